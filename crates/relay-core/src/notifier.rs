use crate::model::CommandStatus;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::debug;

pub const DEFAULT_EVENT_BACKLOG: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayEvent {
    pub seq: u64,
    pub at_ms: i64,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    ClientRegistered {
        client_id: String,
    },
    CommandCreated {
        command_id: String,
        client_id: String,
    },
    CommandTransitioned {
        command_id: String,
        client_id: String,
        from: CommandStatus,
        to: CommandStatus,
    },
    CancelRequested {
        command_id: String,
        client_id: String,
    },
}

/// Fan-out of relay events to any number of observers.
///
/// Each subscriber sees at most `backlog` undelivered events; when it falls
/// further behind the oldest ones are discarded. `publish` never waits on a
/// subscriber; it only holds the sequence lock for the duration of one send.
pub struct EventNotifier {
    /// Last assigned sequence number. Held across `send` so the ring order
    /// always matches `seq` order.
    seq: Mutex<u64>,
    sender: broadcast::Sender<RelayEvent>,
}

impl EventNotifier {
    pub fn new(backlog: usize) -> Self {
        let (sender, _) = broadcast::channel(backlog.max(1));
        Self {
            seq: Mutex::new(0),
            sender,
        }
    }

    pub fn publish(&self, at_ms: i64, kind: EventKind) -> u64 {
        let mut last = self.seq.lock().unwrap_or_else(PoisonError::into_inner);
        *last += 1;
        let seq = *last;
        // No receivers is fine: polling the store gives the same view.
        let _ = self.sender.send(RelayEvent { seq, at_ms, kind });
        seq
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            dropped: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn last_seq(&self) -> u64 {
        *self.seq.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for EventNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BACKLOG)
    }
}

pub struct Subscription {
    receiver: broadcast::Receiver<RelayEvent>,
    dropped: u64,
}

impl Subscription {
    /// Next event, skipping past anything lost to overflow. `None` once the
    /// notifier is gone.
    pub async fn next(&mut self) -> Option<RelayEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => self.record_lag(skipped),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_next(&mut self) -> Option<RelayEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => self.record_lag(skipped),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Events this subscriber never saw because it stalled.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn record_lag(&mut self, skipped: u64) {
        self.dropped += skipped;
        debug!(event = "subscriber_lagged", skipped, total_dropped = self.dropped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registered(client_id: &str) -> EventKind {
        EventKind::ClientRegistered {
            client_id: client_id.to_string(),
        }
    }

    #[test]
    fn stalled_subscriber_drops_oldest() {
        let notifier = EventNotifier::new(4);
        let mut slow = notifier.subscribe();
        for n in 0..10 {
            notifier.publish(n, registered(&format!("c{n}")));
        }

        let mut seen = Vec::new();
        while let Some(event) = slow.try_next() {
            seen.push(event.seq);
        }
        assert_eq!(seen, vec![7, 8, 9, 10]);
        assert_eq!(slow.dropped(), 6);
    }

    #[test]
    fn publish_without_subscribers_still_advances_seq() {
        let notifier = EventNotifier::default();
        assert_eq!(notifier.publish(1, registered("c1")), 1);
        assert_eq!(notifier.publish(2, registered("c2")), 2);
        assert_eq!(notifier.last_seq(), 2);
        assert_eq!(notifier.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn each_subscriber_gets_every_event() {
        let notifier = EventNotifier::new(8);
        let mut first = notifier.subscribe();
        let mut second = notifier.subscribe();
        notifier.publish(
            5,
            EventKind::CommandTransitioned {
                command_id: "cmd-1".to_string(),
                client_id: "c1".to_string(),
                from: CommandStatus::Pending,
                to: CommandStatus::Running,
            },
        );

        let a = first.next().await.expect("first");
        let b = second.next().await.expect("second");
        assert_eq!(a, b);
        assert_eq!(a.seq, 1);
    }

    #[tokio::test]
    async fn subscription_ends_when_notifier_drops() {
        let notifier = EventNotifier::new(2);
        let mut sub = notifier.subscribe();
        drop(notifier);
        assert!(sub.next().await.is_none());
    }

    #[test]
    fn concurrent_publishers_deliver_in_seq_order() {
        const THREADS: u64 = 8;
        const PER_THREAD: u64 = 4_000;
        let notifier = EventNotifier::new((THREADS * PER_THREAD) as usize);
        let mut sub = notifier.subscribe();

        std::thread::scope(|scope| {
            for t in 0..THREADS {
                let notifier = &notifier;
                scope.spawn(move || {
                    for n in 0..PER_THREAD {
                        notifier.publish(n as i64, registered(&format!("c{t}")));
                    }
                });
            }
        });

        let mut last = 0;
        let mut received = 0;
        while let Some(event) = sub.try_next() {
            assert_eq!(event.seq, last + 1, "gap or inversion after seq {last}");
            last = event.seq;
            received += 1;
        }
        assert_eq!(received, THREADS * PER_THREAD);
        assert_eq!(sub.dropped(), 0);
        assert_eq!(notifier.last_seq(), THREADS * PER_THREAD);
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let event = RelayEvent {
            seq: 3,
            at_ms: 1_000,
            kind: EventKind::CommandCreated {
                command_id: "cmd-1".to_string(),
                client_id: "c1".to_string(),
            },
        };
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["type"], "command_created");
        assert_eq!(value["seq"], 3);
        assert_eq!(value["client_id"], "c1");
    }
}
