use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::state::FeedDisconnectCause;

const MAX_RECENT_DISCONNECTS: usize = 50;
const MAX_CAUSE_TEXT_BYTES: usize = 256;

fn truncate_string(s: &str) -> String {
    if s.len() <= MAX_CAUSE_TEXT_BYTES {
        return s.to_string();
    }

    let mut end = MAX_CAUSE_TEXT_BYTES;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[derive(Debug, Clone)]
struct DisconnectRec {
    _at: Instant,
    _cause: String,
}

/// Counters tracking engine activity without interior mutability.
#[derive(Debug)]
pub struct SyncStats {
    engine_started: Instant,
    last_change: Option<Instant>,
    changes: u64,
    connects: u64,
    subscribe_failures: u64,
    foregrounds: u64,
    backgrounds: u64,
    recent_disconnects: VecDeque<DisconnectRec>,
}

impl SyncStats {
    pub fn new() -> Self {
        Self {
            engine_started: Instant::now(),
            last_change: None,
            changes: 0,
            connects: 0,
            subscribe_failures: 0,
            foregrounds: 0,
            backgrounds: 0,
            recent_disconnects: VecDeque::with_capacity(MAX_RECENT_DISCONNECTS),
        }
    }

    pub fn record_change(&mut self) {
        self.last_change = Some(Instant::now());
        self.changes = self.changes.saturating_add(1);
    }

    pub fn record_connected(&mut self) {
        self.connects = self.connects.saturating_add(1);
    }

    pub fn record_disconnect(&mut self, cause: &FeedDisconnectCause) {
        let text = match cause.detail() {
            Some(detail) => format!("{}: {}", cause.label(), detail),
            None => cause.label().to_string(),
        };
        if self.recent_disconnects.len() == MAX_RECENT_DISCONNECTS {
            self.recent_disconnects.pop_front();
        }
        self.recent_disconnects.push_back(DisconnectRec {
            _at: Instant::now(),
            _cause: truncate_string(&text),
        });
    }

    pub fn record_subscribe_failure(&mut self) {
        self.subscribe_failures = self.subscribe_failures.saturating_add(1);
    }

    pub fn record_foreground(&mut self) {
        self.foregrounds = self.foregrounds.saturating_add(1);
    }

    pub fn record_background(&mut self) {
        self.backgrounds = self.backgrounds.saturating_add(1);
    }

    pub fn snapshot(&self, refreshes_dispatched: u64, refresh_errors: u64) -> SyncStatsSnapshot {
        SyncStatsSnapshot {
            uptime: self.engine_started.elapsed(),
            changes: self.changes,
            connects: self.connects,
            refreshes_dispatched,
            refresh_errors,
            subscribe_failures: self.subscribe_failures,
            foregrounds: self.foregrounds,
            last_change_age: self.last_change.map(|at| at.elapsed()),
            recent_disconnects: self.recent_disconnects.len(),
        }
    }
}

impl Default for SyncStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of engine activity, surfaced through the handle.
#[derive(Clone, Debug, kameo::Reply)]
pub struct SyncStatsSnapshot {
    pub uptime: Duration,
    pub changes: u64,
    pub connects: u64,
    pub refreshes_dispatched: u64,
    pub refresh_errors: u64,
    pub subscribe_failures: u64,
    pub foregrounds: u64,
    pub last_change_age: Option<Duration>,
    pub recent_disconnects: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_into_snapshot() {
        let mut stats = SyncStats::new();
        stats.record_change();
        stats.record_change();
        stats.record_connected();
        stats.record_subscribe_failure();
        stats.record_foreground();

        let snapshot = stats.snapshot(4, 1);
        assert_eq!(snapshot.changes, 2);
        assert_eq!(snapshot.connects, 1);
        assert_eq!(snapshot.refreshes_dispatched, 4);
        assert_eq!(snapshot.refresh_errors, 1);
        assert_eq!(snapshot.subscribe_failures, 1);
        assert_eq!(snapshot.foregrounds, 1);
        assert!(snapshot.last_change_age.is_some());
    }

    #[test]
    fn disconnect_ring_is_capped() {
        let mut stats = SyncStats::new();
        for i in 0..(MAX_RECENT_DISCONNECTS + 5) {
            stats.record_disconnect(&FeedDisconnectCause::ReadFailure {
                error: format!("error-{i}"),
            });
        }

        assert_eq!(stats.recent_disconnects.len(), MAX_RECENT_DISCONNECTS);
        assert_eq!(
            stats.recent_disconnects.front().unwrap()._cause,
            "read_failure: error-5"
        );
    }

    #[test]
    fn cause_text_is_truncated() {
        let mut stats = SyncStats::new();
        let huge = "x".repeat(MAX_CAUSE_TEXT_BYTES + 100);
        stats.record_disconnect(&FeedDisconnectCause::HandshakeFailed { message: huge });
        assert_eq!(
            stats.recent_disconnects.front().unwrap()._cause.len(),
            MAX_CAUSE_TEXT_BYTES
        );
    }
}
