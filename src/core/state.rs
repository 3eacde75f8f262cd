use std::collections::BTreeSet;
use std::time::SystemTime;

use super::types::TopicId;

/// Raw device/host network reachability.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkStatus {
    Online,
    Offline,
}

impl NetworkStatus {
    #[inline]
    pub fn is_online(self) -> bool {
        matches!(self, NetworkStatus::Online)
    }
}

/// Aggregate status of the transport-level subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelStatus {
    Disconnected,
    Connecting,
    Subscribed,
    Error,
}

/// Immutable snapshot of the engine's connection state, published through a
/// watch channel on every transition.
///
/// Invariants maintained by the engine: `channel_status == Subscribed` implies
/// `network == Online`, and `attempt` resets to 0 exactly on the transition
/// into `Subscribed`.
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionState {
    pub network: NetworkStatus,
    pub backend_reachable: bool,
    pub channel_status: ChannelStatus,
    /// Consecutive failed (re)connection attempts since the last success.
    pub attempt: u32,
    pub last_connected_at: Option<SystemTime>,
    /// Topics with a confirmed transport subscription.
    pub active_topics: BTreeSet<TopicId>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            network: NetworkStatus::Offline,
            backend_reachable: false,
            channel_status: ChannelStatus::Disconnected,
            attempt: 0,
            last_connected_at: None,
            active_topics: BTreeSet::new(),
        }
    }
}

impl ConnectionState {
    #[inline]
    pub fn is_subscribed(&self) -> bool {
        self.channel_status == ChannelStatus::Subscribed
    }
}

/// Canonical causes for losing the change feed, used for logging and stats.
#[derive(Clone, Debug)]
pub enum FeedDisconnectCause {
    RemoteClosed { reason: Option<String> },
    ReadFailure { error: String },
    CommandFailed { error: String },
    HandshakeFailed { message: String },
    NetworkLost,
    Foregrounded,
    Shutdown,
}

impl FeedDisconnectCause {
    pub fn label(&self) -> &'static str {
        match self {
            FeedDisconnectCause::RemoteClosed { .. } => "remote_closed",
            FeedDisconnectCause::ReadFailure { .. } => "read_failure",
            FeedDisconnectCause::CommandFailed { .. } => "command_failed",
            FeedDisconnectCause::HandshakeFailed { .. } => "handshake_failed",
            FeedDisconnectCause::NetworkLost => "network_lost",
            FeedDisconnectCause::Foregrounded => "foregrounded",
            FeedDisconnectCause::Shutdown => "shutdown",
        }
    }

    pub fn detail(&self) -> Option<&str> {
        match self {
            FeedDisconnectCause::RemoteClosed { reason } => reason.as_deref(),
            FeedDisconnectCause::ReadFailure { error } => Some(error),
            FeedDisconnectCause::CommandFailed { error } => Some(error),
            FeedDisconnectCause::HandshakeFailed { message } => Some(message),
            _ => None,
        }
    }
}
