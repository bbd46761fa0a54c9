//! Cross-thread event delivery into the reactor thread.
//!
//! Producers on any thread push owned [`LocalEvent`]s into a bounded
//! [`EventQueue`] and then raise a wake-up signal so the reactor stops waiting.
//! Only the reactor thread pops.

use std::fmt;
use std::io;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use crossbeam::queue::ArrayQueue;

use crate::orchestrator::queues::SyncQueueData;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LocalEventKind {
    SyncQueueRequest,
    VoteNotify,
}

impl LocalEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SyncQueueRequest => "sync_queue_request",
            Self::VoteNotify => "vote_notify",
        }
    }
}

/// Owned event payload. Whoever pops the event owns the payload.
#[derive(Debug, PartialEq)]
pub enum LocalEventPayload {
    SyncQueueRequest(SyncQueueData),
    VoteNotify,
}

#[derive(Debug, PartialEq)]
pub struct LocalEvent {
    pub timestamp: DateTime<Utc>,
    pub payload: LocalEventPayload,
}

impl LocalEvent {
    pub fn new(payload: LocalEventPayload) -> Self {
        Self {
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn kind(&self) -> LocalEventKind {
        match self.payload {
            LocalEventPayload::SyncQueueRequest(_) => LocalEventKind::SyncQueueRequest,
            LocalEventPayload::VoteNotify => LocalEventKind::VoteNotify,
        }
    }
}

#[derive(Debug)]
pub enum EventQueueError {
    /// The queue is at capacity; the rejected event is handed back.
    Full {
        capacity: usize,
        rejected: Box<LocalEvent>,
    },
}

impl fmt::Display for EventQueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full { capacity, rejected } => write!(
                f,
                "event queue is full (capacity {capacity}), rejected {} event",
                rejected.kind().as_str()
            ),
        }
    }
}

impl std::error::Error for EventQueueError {}

/// Bounded multi-producer queue drained by the reactor thread.
pub struct EventQueue {
    inner: ArrayQueue<LocalEvent>,
}

impl EventQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: ArrayQueue::new(capacity.max(1)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn push(&self, event: LocalEvent) -> Result<(), EventQueueError> {
        self.inner.push(event).map_err(|rejected| EventQueueError::Full {
            capacity: self.inner.capacity(),
            rejected: Box::new(rejected),
        })
    }

    pub fn pop(&self) -> Option<LocalEvent> {
        self.inner.pop()
    }

    /// Drops everything still queued and returns how many events were discarded.
    pub fn discard_all(&self) -> usize {
        let mut discarded = 0;
        while self.inner.pop().is_some() {
            discarded += 1;
        }
        discarded
    }
}

/// Interrupts the reactor's bounded wait.
pub trait WakeSignal: Send + Sync {
    fn wake(&self) -> io::Result<()>;
}

impl WakeSignal for mio::Waker {
    fn wake(&self) -> io::Result<()> {
        mio::Waker::wake(self)
    }
}

#[derive(Debug)]
pub enum NotifyError {
    QueueFull { capacity: usize },
    /// The event is queued but the reactor could not be woken; it will be
    /// picked up when the current poll times out.
    Wake(io::Error),
}

impl fmt::Display for NotifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueFull { capacity } => {
                write!(f, "worker event queue is full (capacity {capacity})")
            }
            Self::Wake(source) => write!(f, "failed to wake worker reactor: {source}"),
        }
    }
}

impl std::error::Error for NotifyError {}

/// Cloneable, thread-safe handle producers use to reach a worker.
#[derive(Clone)]
pub struct WorkerNotifier {
    queue: Arc<EventQueue>,
    signal: Arc<dyn WakeSignal>,
}

impl WorkerNotifier {
    pub fn new(queue: Arc<EventQueue>, signal: Arc<dyn WakeSignal>) -> Self {
        Self { queue, signal }
    }

    pub fn send(&self, payload: LocalEventPayload) -> Result<(), NotifyError> {
        self.queue
            .push(LocalEvent::new(payload))
            .map_err(|EventQueueError::Full { capacity, .. }| NotifyError::QueueFull { capacity })?;
        self.signal.wake().map_err(NotifyError::Wake)
    }

    /// Copies `data` into a sync event for the reactor thread.
    pub fn notify_sync_request(&self, data: &SyncQueueData) -> Result<(), NotifyError> {
        self.send(LocalEventPayload::SyncQueueRequest(data.clone()))
    }

    pub fn notify_leader_change(&self) -> Result<(), NotifyError> {
        self.send(LocalEventPayload::VoteNotify)
    }

    #[cfg(test)]
    pub fn pending_events(&self) -> usize {
        self.queue.len()
    }
}

impl fmt::Debug for WorkerNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerNotifier")
            .field("queued", &self.queue.len())
            .field("capacity", &self.queue.capacity())
            .finish()
    }
}
