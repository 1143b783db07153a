//! Fan-out of committed writes to every live session.
//!
//! A message is encoded once and the same `Arc<str>` is handed to each
//! session's bounded outbound queue with `try_send`. Publishing never waits
//! on a socket. A session whose queue is full is evicted: it is removed from
//! the registry and its connection task is woken to close the transport.
//!
//! Stats are atomics so that publishing takes no extra lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::protocol::{ProtocolError, ServerMessage};
use crate::session::{ClientSession, Delivery, SessionId, SessionRegistry};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    /// Messages published
    pub published: u64,
    /// Payloads enqueued across all sessions
    pub delivered: u64,
    /// Sessions skipped (origin with echo off, or not open)
    pub skipped: u64,
    /// Sessions evicted for a full queue
    pub evicted: u64,
}

#[derive(Default)]
struct AtomicBroadcastStats {
    published: AtomicU64,
    delivered: AtomicU64,
    skipped: AtomicU64,
    evicted: AtomicU64,
}

/// Outcome of one publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub skipped: usize,
    pub evicted: usize,
}

/// Broadcasts to the sessions in a `SessionRegistry`.
pub struct BroadcastHub {
    registry: Arc<SessionRegistry>,
    /// Deliver a commit to the session that wrote it
    echo_to_origin: bool,
    stats: AtomicBroadcastStats,
}

impl BroadcastHub {
    pub fn new(registry: Arc<SessionRegistry>, echo_to_origin: bool) -> Self {
        Self {
            registry,
            echo_to_origin,
            stats: AtomicBroadcastStats::default(),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn echo_to_origin(&self) -> bool {
        self.echo_to_origin
    }

    /// Encode `msg` once and publish it to every live session.
    pub async fn publish(
        &self,
        msg: &ServerMessage,
        origin: Option<SessionId>,
    ) -> Result<DeliveryReport, ProtocolError> {
        let encoded: Arc<str> = Arc::from(msg.encode()?);
        Ok(self.publish_raw(encoded, origin).await)
    }

    /// Publish a pre-encoded payload.
    pub async fn publish_raw(&self, payload: Arc<str>, origin: Option<SessionId>) -> DeliveryReport {
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        let mut report = DeliveryReport::default();

        for session in self.registry.list_live().await {
            if !self.echo_to_origin && Some(session.id()) == origin {
                report.skipped += 1;
                continue;
            }
            match session.deliver(payload.clone()) {
                Delivery::Sent => report.delivered += 1,
                Delivery::Skipped => report.skipped += 1,
                Delivery::Overflow => {
                    self.evict(&session).await;
                    report.evicted += 1;
                }
            }
        }

        self.stats.delivered.fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.stats.skipped.fetch_add(report.skipped as u64, Ordering::Relaxed);
        report
    }

    /// Enqueue a message for one session only. Overflow evicts it like a
    /// broadcast would.
    pub async fn send_to(
        &self,
        session: &ClientSession,
        msg: &ServerMessage,
    ) -> Result<Delivery, ProtocolError> {
        let encoded: Arc<str> = Arc::from(msg.encode()?);
        let delivery = session.deliver(encoded);
        match delivery {
            Delivery::Sent => {
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Delivery::Skipped => {
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            }
            Delivery::Overflow => self.evict(session).await,
        }
        Ok(delivery)
    }

    async fn evict(&self, session: &ClientSession) {
        log::warn!(
            "Evicting session {} ({}): outbound queue full",
            session.id(),
            session.identity()
        );
        session.evict();
        self.registry.unregister(&session.id()).await;
        self.stats.evicted.fetch_add(1, Ordering::Relaxed);
    }

    /// Lock-free stats snapshot.
    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            published: self.stats.published.load(Ordering::Relaxed),
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            skipped: self.stats.skipped.load(Ordering::Relaxed),
            evicted: self.stats.evicted.load(Ordering::Relaxed),
        }
    }
}
