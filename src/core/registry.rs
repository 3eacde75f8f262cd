use std::collections::HashMap;

use tokio::task::JoinHandle;

use super::types::{
    ChangeEvent, ChangeHandler, RefreshScope, SyncError, SyncResult, Topic, TopicFilter,
    TopicHandle, TopicId,
};

/// Transport-side lifecycle of one coalesced topic subscription.
enum TopicLink {
    /// Not subscribed; queued until the feed is open.
    Idle,
    /// Subscribe issued, waiting for the feed to acknowledge.
    Pending { request_id: u64 },
    /// Acknowledged by the feed.
    Active { subscription_id: u64 },
    /// Rejected; waiting for the per-topic retry timer.
    Backoff { timer: JoinHandle<()> },
}

struct Consumer {
    id: u64,
    handler: Option<ChangeHandler>,
}

struct TopicEntry {
    filter: TopicFilter,
    refresh_keys: Vec<String>,
    consumers: Vec<Consumer>,
    link: TopicLink,
    /// Consecutive subscribe rejections on the current connection.
    failures: u32,
}

/// Result of removing one consumer from the registry.
#[derive(Debug, PartialEq, Eq)]
pub enum UnregisterOutcome {
    /// Last consumer gone; the topic was dropped. Carries the live
    /// subscription id when the feed had acknowledged it.
    Removed { subscription_id: Option<u64> },
    /// Other consumers remain; nothing to do against the transport.
    Retained,
    /// The handle did not match a registration (already unregistered).
    Unknown,
}

/// Bookkeeping for the logical topic set mapped onto the single feed
/// connection: reference counting, pending-request matching and per-topic
/// retry state. The engine remains the only component issuing transport calls.
#[derive(Default)]
pub struct TopicRegistry {
    topics: HashMap<TopicId, TopicEntry>,
    next_consumer_id: u64,
    next_request_id: u64,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    /// Add a consumer, coalescing repeated registrations of the same id.
    ///
    /// Returns the handle plus whether the topic is new to the registry (and
    /// therefore needs a transport subscription). Registering an id with a
    /// conflicting filter is a programmer error.
    pub fn register(&mut self, topic: Topic) -> SyncResult<(TopicHandle, bool)> {
        let (id, filter, refresh_keys, handler) = topic.into_parts();
        if id.is_empty() {
            return Err(SyncError::InvalidTopic("topic id must be non-empty".to_string()));
        }

        self.next_consumer_id += 1;
        let consumer = Consumer {
            id: self.next_consumer_id,
            handler,
        };
        let handle = TopicHandle {
            topic: id.clone(),
            consumer: consumer.id,
        };

        if let Some(entry) = self.topics.get_mut(&id) {
            if entry.filter != filter {
                return Err(SyncError::InvalidTopic(format!(
                    "topic {id} already registered with a different filter"
                )));
            }
            entry.consumers.push(consumer);
            return Ok((handle, false));
        }

        self.topics.insert(
            id,
            TopicEntry {
                filter,
                refresh_keys,
                consumers: vec![consumer],
                link: TopicLink::Idle,
                failures: 0,
            },
        );
        Ok((handle, true))
    }

    /// Drop one consumer; the topic itself is removed when the last one goes.
    pub fn unregister(&mut self, handle: &TopicHandle) -> UnregisterOutcome {
        let Some(entry) = self.topics.get_mut(&handle.topic) else {
            return UnregisterOutcome::Unknown;
        };
        let Some(position) = entry.consumers.iter().position(|c| c.id == handle.consumer) else {
            return UnregisterOutcome::Unknown;
        };

        entry.consumers.remove(position);
        if !entry.consumers.is_empty() {
            return UnregisterOutcome::Retained;
        }

        let entry = self
            .topics
            .remove(&handle.topic)
            .expect("entry exists, just mutated");
        let subscription_id = match entry.link {
            TopicLink::Active { subscription_id } => Some(subscription_id),
            TopicLink::Backoff { timer } => {
                timer.abort();
                None
            }
            _ => None,
        };
        UnregisterOutcome::Removed { subscription_id }
    }

    /// Topics that still need a subscribe issued against the open feed.
    pub fn idle_topics(&self) -> Vec<TopicId> {
        self.topics
            .iter()
            .filter(|(_, entry)| matches!(entry.link, TopicLink::Idle))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Assign a request id and mark the topic pending. Any stale per-topic
    /// retry timer is canceled.
    pub fn begin_subscribe(&mut self, id: &TopicId) -> Option<(u64, TopicFilter)> {
        let entry = self.topics.get_mut(id)?;
        if let TopicLink::Backoff { timer } = std::mem::replace(&mut entry.link, TopicLink::Idle) {
            timer.abort();
        }
        self.next_request_id += 1;
        entry.link = TopicLink::Pending {
            request_id: self.next_request_id,
        };
        Some((self.next_request_id, entry.filter.clone()))
    }

    /// Match a subscribe acknowledgement to its topic.
    ///
    /// Returns `None` when no pending request matches — e.g. the consumer
    /// unregistered while the ack was in flight, leaving an orphan
    /// subscription the caller should release.
    pub fn confirm_subscribe(&mut self, request_id: u64, subscription_id: u64) -> Option<TopicId> {
        let (id, entry) = self.topics.iter_mut().find(|(_, entry)| {
            matches!(entry.link, TopicLink::Pending { request_id: pending } if pending == request_id)
        })?;
        entry.link = TopicLink::Active { subscription_id };
        entry.failures = 0;
        Some(id.clone())
    }

    /// Record a subscribe rejection; returns the topic and its consecutive
    /// failure count so the caller can schedule a scoped retry.
    pub fn fail_subscribe(&mut self, request_id: u64) -> Option<(TopicId, u32)> {
        let (id, entry) = self.topics.iter_mut().find(|(_, entry)| {
            matches!(entry.link, TopicLink::Pending { request_id: pending } if pending == request_id)
        })?;
        entry.link = TopicLink::Idle;
        entry.failures = entry.failures.saturating_add(1);
        Some((id.clone(), entry.failures))
    }

    /// Park a rejected topic behind its retry timer.
    pub fn set_backoff(&mut self, id: &TopicId, timer: JoinHandle<()>) {
        if let Some(entry) = self.topics.get_mut(id) {
            entry.link = TopicLink::Backoff { timer };
        } else {
            timer.abort();
        }
    }

    /// Per-topic retry timer fired: back to idle so a subscribe can be issued.
    pub fn take_backoff(&mut self, id: &TopicId) -> bool {
        let Some(entry) = self.topics.get_mut(id) else {
            return false;
        };
        if matches!(entry.link, TopicLink::Backoff { .. }) {
            entry.link = TopicLink::Idle;
            true
        } else {
            false
        }
    }

    /// Connection went away: cancel per-topic timers and forget transport
    /// state so the next `opened` re-issues every subscription exactly once.
    pub fn reset_links(&mut self) {
        for entry in self.topics.values_mut() {
            if let TopicLink::Backoff { timer } = std::mem::replace(&mut entry.link, TopicLink::Idle)
            {
                timer.abort();
            }
            entry.failures = 0;
        }
    }

    /// Invoke every consumer handler registered for the event's topic.
    pub fn dispatch(&self, event: &ChangeEvent) -> usize {
        let Some(entry) = self.topics.get(&event.topic) else {
            return 0;
        };
        let mut invoked = 0;
        for consumer in &entry.consumers {
            if let Some(handler) = &consumer.handler {
                handler(event);
                invoked += 1;
            }
        }
        invoked
    }

    /// Refresh scope triggered by a change on the given topic.
    pub fn refresh_scope_for(&self, id: &TopicId) -> Option<RefreshScope> {
        self.topics
            .get(id)
            .map(|entry| RefreshScope::keys(entry.refresh_keys.iter().cloned()))
    }
}
