//! In-process replication bus.
//!
//! Several canvases in one process join the same `ReplicationBus`. Each
//! member's `publish` fans out to every other member's inbox; a member never
//! receives its own events.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;

use super::{Replicated, ReplicationBridge, ReplicationError};

type Members = Arc<RwLock<Vec<(usize, mpsc::Sender<Replicated>)>>>;

/// Shared fan-out point for `ChannelBridge`s.
#[derive(Clone, Default)]
pub struct ReplicationBus {
    members: Members,
    next: Arc<AtomicUsize>,
}

impl ReplicationBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member with an inbox of `capacity` events.
    pub fn join(&self, capacity: usize) -> ChannelBridge {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let member = self.next.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut members) = self.members.write() {
            members.push((member, tx));
        }
        ChannelBridge {
            members: self.members.clone(),
            member,
            inbox: Mutex::new(Some(rx)),
        }
    }

    pub fn len(&self) -> usize {
        self.members.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One member of a `ReplicationBus`.
pub struct ChannelBridge {
    members: Members,
    member: usize,
    inbox: Mutex<Option<mpsc::Receiver<Replicated>>>,
}

impl ReplicationBridge for ChannelBridge {
    fn name(&self) -> &'static str {
        "channel"
    }

    fn publish(&self, event: &Replicated) -> Result<(), ReplicationError> {
        let members = self
            .members
            .read()
            .map_err(|_| ReplicationError::SinkUnavailable { bridge: "channel" })?;

        let mut result = Ok(());
        for (id, tx) in members.iter() {
            if *id == self.member {
                continue;
            }
            match tx.try_send(*event) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::warn!("Replica inbox {id} full, dropping write #{}", event.sequence);
                    result = Err(ReplicationError::QueueFull { bridge: "channel" });
                }
                // Member dropped its receiver; nothing to deliver to
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        result
    }

    fn subscribe(&self) -> Option<mpsc::Receiver<Replicated>> {
        self.inbox.lock().ok()?.take()
    }
}

impl Drop for ChannelBridge {
    fn drop(&mut self) {
        if let Ok(mut members) = self.members.write() {
            members.retain(|(id, _)| *id != self.member);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::ReplicaId;

    fn event(sequence: u64) -> Replicated {
        Replicated {
            origin: ReplicaId::new(),
            sequence,
            x: 0,
            y: 0,
            color: 1,
        }
    }

    #[tokio::test]
    async fn test_fanout_skips_self() {
        let bus = ReplicationBus::new();
        let a = bus.join(8);
        let b = bus.join(8);
        let mut a_rx = a.subscribe().unwrap();
        let mut b_rx = b.subscribe().unwrap();

        a.publish(&event(1)).unwrap();

        assert_eq!(b_rx.recv().await.unwrap().sequence, 1);
        assert!(a_rx.try_recv().is_err());
    }

    #[test]
    fn test_subscribe_once() {
        let bus = ReplicationBus::new();
        let a = bus.join(8);
        assert!(a.subscribe().is_some());
        assert!(a.subscribe().is_none());
    }

    #[test]
    fn test_full_inbox_reports_queue_full() {
        let bus = ReplicationBus::new();
        let a = bus.join(1);
        let _b = bus.join(1);

        assert!(a.publish(&event(1)).is_ok());
        assert_eq!(
            a.publish(&event(2)),
            Err(ReplicationError::QueueFull { bridge: "channel" })
        );
    }

    #[test]
    fn test_drop_leaves_bus() {
        let bus = ReplicationBus::new();
        let a = bus.join(8);
        {
            let _b = bus.join(8);
            assert_eq!(bus.len(), 2);
        }
        assert_eq!(bus.len(), 1);
        assert!(a.publish(&event(1)).is_ok());
    }
}
