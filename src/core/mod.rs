pub mod backoff;
pub mod registry;
pub mod state;
pub mod stats;
pub mod types;

pub use backoff::*;
pub use registry::*;
pub use state::*;
pub use stats::*;
pub use types::*;
