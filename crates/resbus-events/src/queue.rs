//! Multi-producer, single-consumer event queue
//!
//! Producers hold an [`EventSender`] and never block. The tick thread owns the
//! [`EventQueue`] and drains it once per tick.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::trace;

use crate::Event;

/// Upper bound on queued events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueLimit {
    /// No limit; a runaway producer grows memory without bound
    #[default]
    Unbounded,
    /// `queue` fails with [`QueueError::QueueFull`] once this many events are pending
    MaxDepth(usize),
}

impl From<Option<usize>> for QueueLimit {
    fn from(max: Option<usize>) -> Self {
        max.map_or(QueueLimit::Unbounded, QueueLimit::MaxDepth)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("event queue is full ({depth} pending)")]
    QueueFull { depth: usize },
    #[error("event queue is closed")]
    Closed,
}

/// Producer side; cheap to clone and safe to share across threads
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: UnboundedSender<Event>,
    depth: Arc<AtomicUsize>,
    limit: QueueLimit,
}

impl EventSender {
    /// Append an event to the queue
    pub fn queue(&self, event: Event) -> Result<(), QueueError> {
        match self.limit {
            QueueLimit::Unbounded => {
                self.depth.fetch_add(1, Ordering::AcqRel);
            }
            QueueLimit::MaxDepth(max) => {
                self.depth
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| {
                        (d < max).then_some(d + 1)
                    })
                    .map_err(|depth| QueueError::QueueFull { depth })?;
            }
        }

        trace!(target: "events", "Queued event {}", event.name);

        self.tx.send(event).map_err(|_| {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            QueueError::Closed
        })
    }

    /// Events queued and not yet drained
    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer side, owned by the tick thread
#[derive(Debug)]
pub struct EventQueue {
    rx: UnboundedReceiver<Event>,
    depth: Arc<AtomicUsize>,
}

impl EventQueue {
    pub fn new(limit: QueueLimit) -> (EventQueue, EventSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));

        let queue = EventQueue {
            rx,
            depth: depth.clone(),
        };
        let sender = EventSender { tx, depth, limit };

        (queue, sender)
    }

    /// Remove and return every event queued before this call
    ///
    /// Order is FIFO per producer. Events that arrive while draining are left for the
    /// next drain so one tick cannot be held open by a busy producer.
    pub fn drain_all(&mut self) -> Vec<Event> {
        let pending = self.depth.load(Ordering::Acquire);
        let mut events = Vec::with_capacity(pending);

        while events.len() < pending {
            match self.rx.try_recv() {
                Ok(event) => {
                    self.depth.fetch_sub(1, Ordering::AcqRel);
                    events.push(event);
                }
                // Counted but not yet in the channel; picked up next drain
                Err(_) => break,
            }
        }

        events
    }

    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting events; senders get [`QueueError::Closed`] from now on
    pub fn close(&mut self) {
        self.rx.close();
    }
}
