//! Network ingress
//!
//! Transports hand raw envelopes to a [`NetIngress`] from whatever thread or task reads
//! the socket. Accepted envelopes become events queued for the next tick, sourced from
//! the sending peer. Everything else is dropped with a `warn!` line and reported to the
//! caller.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use resbus_codec::CodecError;
use resbus_events::{EventSender, NetEnvelope, NetError, PeerId, QueueError, names};
use tracing::{trace, warn};

const RATE_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IngressError {
    #[error("malformed envelope: {0}")]
    Envelope(#[from] NetError),
    #[error("peer {peer} may not trigger reserved event '{name}'")]
    ReservedName { peer: PeerId, name: String },
    #[error("payload from peer {peer} is not wire safe: {source}")]
    NotWireSafe { peer: PeerId, source: CodecError },
    #[error("peer {0} exceeded its event budget")]
    RateLimited(PeerId),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Fixed one-second window per peer
#[derive(Debug)]
struct PeerBudget {
    per_second: u32,
    windows: Mutex<HashMap<PeerId, Window>>,
}

impl PeerBudget {
    fn admit(&self, peer: PeerId, now: Instant) -> bool {
        let mut windows = match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let window = windows.entry(peer).or_insert(Window {
            started: now,
            count: 0,
        });
        if now.saturating_duration_since(window.started) >= RATE_WINDOW {
            *window = Window {
                started: now,
                count: 0,
            };
        }

        if window.count >= self.per_second {
            return false;
        }
        window.count += 1;
        true
    }

    fn forget(&self, peer: PeerId) {
        if let Ok(mut windows) = self.windows.lock() {
            windows.remove(&peer);
        }
    }
}

/// Decodes inbound envelopes and queues them as events; cheap to clone
#[derive(Debug, Clone)]
pub struct NetIngress {
    events: EventSender,
    max_envelope_size: usize,
    budget: Option<Arc<PeerBudget>>,
}

impl NetIngress {
    pub fn new(events: EventSender, max_envelope_size: usize) -> Self {
        Self {
            events,
            max_envelope_size,
            budget: None,
        }
    }

    /// Limit each peer to `per_second` accepted events per second
    pub fn with_rate_limit(mut self, per_second: u32) -> Self {
        self.budget = Some(Arc::new(PeerBudget {
            per_second,
            windows: Mutex::new(HashMap::new()),
        }));
        self
    }

    /// Decode an envelope and queue it
    pub fn ingest(&self, bytes: &[u8]) -> Result<(), IngressError> {
        let result = self.try_ingest(bytes, Instant::now());
        if let Err(e) = &result {
            warn!(target: "net", "Dropping inbound event: {}", e);
        }
        result
    }

    fn try_ingest(&self, bytes: &[u8], now: Instant) -> Result<(), IngressError> {
        let envelope = NetEnvelope::decode(bytes, self.max_envelope_size)?;
        let peer = envelope.source;

        if names::is_reserved(&envelope.name) {
            return Err(IngressError::ReservedName {
                peer,
                name: envelope.name,
            });
        }

        resbus_codec::check_wire_safe(&envelope.payload)
            .map_err(|source| IngressError::NotWireSafe { peer, source })?;

        let admitted = self
            .budget
            .as_ref()
            .is_none_or(|budget| budget.admit(peer, now));
        if !admitted {
            return Err(IngressError::RateLimited(peer));
        }

        trace!(target: "net", "Queued {} from {}", envelope.name, peer);
        self.events.queue(envelope.into_event())?;
        Ok(())
    }

    /// Drop rate-limit state for a peer that disconnected
    pub fn peer_dropped(&self, peer: PeerId) {
        if let Some(budget) = &self.budget {
            budget.forget(peer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use resbus_codec::{FunctionRefId, Value};
    use resbus_events::{EventQueue, QueueLimit};

    fn envelope(peer: u16, name: &str, args: &[Value]) -> Vec<u8> {
        let payload = resbus_codec::serialize(args).unwrap();
        NetEnvelope::new(PeerId(peer), name, payload).encode().unwrap()
    }

    #[test]
    fn test_ingest_queues_sourced_event() {
        let (mut queue, sender) = EventQueue::new(QueueLimit::Unbounded);
        let ingress = NetIngress::new(sender, 1024);

        ingress
            .ingest(&envelope(7, "chat:message", &[Value::from("hi")]))
            .unwrap();

        let events = queue.drain_all();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "chat:message");
        assert_eq!(events[0].source, Some(PeerId(7)));
        assert_eq!(events[0].args().unwrap(), vec![Value::from("hi")]);
    }

    #[test]
    fn test_rejections() {
        let (mut queue, sender) = EventQueue::new(QueueLimit::Unbounded);
        let ingress = NetIngress::new(sender, 64);

        assert!(matches!(
            ingress.ingest(&[1, 0]),
            Err(IngressError::Envelope(NetError::TooShort(2)))
        ));
        assert!(matches!(
            ingress.ingest(&[0u8; 65]),
            Err(IngressError::Envelope(NetError::Oversized { .. }))
        ));
        assert_eq!(
            ingress.ingest(&envelope(3, names::RESOURCE_STOPPED, &[Value::from("x")])),
            Err(IngressError::ReservedName {
                peer: PeerId(3),
                name: names::RESOURCE_STOPPED.to_string(),
            })
        );

        let smuggled = envelope(3, "cb", &[Value::FuncRef(FunctionRefId::new("r", 1, 1))]);
        assert!(matches!(
            ingress.ingest(&smuggled),
            Err(IngressError::NotWireSafe { .. })
        ));

        assert!(queue.drain_all().is_empty());
    }

    #[test]
    fn test_rate_limit_per_peer() {
        let (mut queue, sender) = EventQueue::new(QueueLimit::Unbounded);
        let ingress = NetIngress::new(sender, 1024).with_rate_limit(2);
        let start = Instant::now();
        let bytes = envelope(1, "spam", &[]);
        let other = envelope(2, "spam", &[]);

        assert!(ingress.try_ingest(&bytes, start).is_ok());
        assert!(ingress.try_ingest(&bytes, start).is_ok());
        assert_eq!(
            ingress.try_ingest(&bytes, start),
            Err(IngressError::RateLimited(PeerId(1)))
        );
        // Other peers have their own budget
        assert!(ingress.try_ingest(&other, start).is_ok());

        // A new window resets the budget
        assert!(ingress.try_ingest(&bytes, start + RATE_WINDOW).is_ok());

        ingress.peer_dropped(PeerId(1));
        assert!(ingress.try_ingest(&bytes, start).is_ok());

        assert_eq!(queue.drain_all().len(), 5);
    }

    #[test]
    fn test_closed_queue() {
        let (queue, sender) = EventQueue::new(QueueLimit::Unbounded);
        drop(queue);
        let ingress = NetIngress::new(sender, 1024);

        assert_eq!(
            ingress.ingest(&envelope(1, "late", &[])),
            Err(IngressError::Queue(QueueError::Closed))
        );
    }
}
