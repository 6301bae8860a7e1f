//! In-process lifecycle event bus backed by a `tokio::sync::broadcast` channel.
//!
//! Notification delivery, UI refresh, and audit logging live outside the core;
//! they subscribe here and receive every [`LifecycleEvent`] published after a
//! mutation commits.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::store::{DownloadKind, DownloadStatus, Request, RequestStatus};

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// A committed state change of a request or one of its downloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    RequestCreated {
        request_id: i64,
    },
    StatusChanged {
        request_id: i64,
        from: RequestStatus,
        to: RequestStatus,
    },
    AttentionRaised {
        request_id: i64,
        description: String,
    },
    AttentionCleared {
        request_id: i64,
    },
    DownloadDispatched {
        request_id: i64,
        download_id: i64,
        kind: DownloadKind,
        external_id: String,
    },
    DownloadProgress {
        request_id: i64,
        download_id: i64,
        status: DownloadStatus,
        progress: u8,
    },
    RetryScheduled {
        request_id: i64,
        retry_count: i64,
        next_retry_at: DateTime<Utc>,
    },
    RetriesExhausted {
        request_id: i64,
        retry_count: i64,
    },
}

impl LifecycleEvent {
    /// The request this event concerns.
    #[must_use]
    pub fn request_id(&self) -> i64 {
        match self {
            Self::RequestCreated { request_id }
            | Self::StatusChanged { request_id, .. }
            | Self::AttentionRaised { request_id, .. }
            | Self::AttentionCleared { request_id }
            | Self::DownloadDispatched { request_id, .. }
            | Self::DownloadProgress { request_id, .. }
            | Self::RetryScheduled { request_id, .. }
            | Self::RetriesExhausted { request_id, .. } => *request_id,
        }
    }
}

/// Fan-out bus for [`LifecycleEvent`]s, cheap to clone.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<LifecycleEvent>,
}

impl EventBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// Slow receivers observe `RecvError::Lagged` once the buffer is full.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: LifecycleEvent) {
        // Zero receivers is not an error.
        let _ = self.sender.send(event);
    }

    /// Publishes the status and attention changes between two snapshots of a request.
    pub fn publish_changes(&self, before: &Request, after: &Request) {
        if before.status != after.status {
            self.publish(LifecycleEvent::StatusChanged {
                request_id: after.id,
                from: before.status,
                to: after.status,
            });
        }
        match (before.attention_needed, after.attention_needed) {
            (false, true) => self.publish(LifecycleEvent::AttentionRaised {
                request_id: after.id,
                description: after.issue_description.clone().unwrap_or_default(),
            }),
            (true, false) => self.publish(LifecycleEvent::AttentionCleared {
                request_id: after.id,
            }),
            _ => {}
        }
    }

    /// Subscribe to all future events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }

    /// Number of active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let bus = EventBus::default();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.publish(LifecycleEvent::RequestCreated { request_id: 7 });

        assert_eq!(first.recv().await.unwrap().request_id(), 7);
        assert_eq!(second.recv().await.unwrap().request_id(), 7);
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(LifecycleEvent::AttentionCleared { request_id: 1 });
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = LifecycleEvent::StatusChanged {
            request_id: 3,
            from: RequestStatus::Pending,
            to: RequestStatus::Searching,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "status_changed");
        assert_eq!(json["to"], "searching");
    }
}
