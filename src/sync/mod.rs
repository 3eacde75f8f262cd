pub mod actor;
pub mod dispatcher;
pub mod handle;

pub use actor::*;
pub use dispatcher::*;
pub use handle::*;
