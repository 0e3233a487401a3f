//! Per-run ordered event queue.
//!
//! One `EventStream` belongs to one run. Events are buffered from the
//! moment the run is created, so a subscriber that attaches late still sees
//! everything from `RUN_STARTED` on. Emitting `RUN_FINISHED` closes the
//! stream; later emits are dropped.

use crate::error::{Error, Result};
use crate::events::event::{EventEnvelope, RunEvent};
use crate::orchestration::RunId;
use chrono::Utc;
use futures::Stream;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

struct Sender {
    tx: mpsc::UnboundedSender<EventEnvelope>,
    next_seq: u64,
}

pub struct EventStream {
    run_id: RunId,
    sender: Mutex<Option<Sender>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<EventEnvelope>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl EventStream {
    pub fn new(run_id: RunId) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            run_id,
            sender: Mutex::new(Some(Sender { tx, next_seq: 0 })),
            receiver: Mutex::new(Some(rx)),
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Append an event. Returns `false` if the stream is already closed.
    ///
    /// Sequence numbers are assigned under the same lock that enqueues, so
    /// `seq` order is delivery order.
    pub fn emit(&self, event: RunEvent) -> bool {
        self.append(event, None)
    }

    /// Append an event unless `halt` has been cancelled.
    ///
    /// The token is checked under the enqueue lock: once whoever cancelled
    /// `halt` has emitted, nothing gated on it can land after that event.
    pub fn emit_unless_halted(&self, event: RunEvent, halt: &CancellationToken) -> bool {
        self.append(event, Some(halt))
    }

    fn append(&self, event: RunEvent, halt: Option<&CancellationToken>) -> bool {
        let mut guard = lock(&self.sender);
        let Some(sender) = guard.as_mut() else {
            trace!(run_id = %self.run_id, kind = event.kind(), "emit after close dropped");
            return false;
        };
        if halt.is_some_and(CancellationToken::is_cancelled) {
            trace!(run_id = %self.run_id, kind = event.kind(), "emit after halt dropped");
            return false;
        }

        let finished = event.is_run_finished();
        let envelope = EventEnvelope {
            seq: sender.next_seq,
            run_id: self.run_id,
            timestamp: Utc::now(),
            event,
        };
        sender.next_seq += 1;
        debug!(run_id = %self.run_id, seq = envelope.seq, kind = envelope.event.kind(), "event");
        // A dropped subscriber is not an error; the run keeps going.
        let _ = sender.tx.send(envelope);

        if finished {
            *guard = None;
        }
        true
    }

    /// Take the single consumer end of this stream.
    pub fn subscribe(&self) -> Result<EventSubscription> {
        lock(&self.receiver)
            .take()
            .map(|rx| EventSubscription {
                run_id: self.run_id,
                rx,
            })
            .ok_or(Error::AlreadySubscribed(self.run_id))
    }

    /// Close without emitting. Subscribers drain what is buffered, then end.
    pub fn close(&self) {
        lock(&self.sender).take();
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.sender).is_none()
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("run_id", &self.run_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Consumer end of a run's event stream.
///
/// Yields events in emission order and ends after `RUN_FINISHED` (or when
/// the stream is closed).
#[derive(Debug)]
pub struct EventSubscription {
    run_id: RunId,
    rx: mpsc::UnboundedReceiver<EventEnvelope>,
}

impl EventSubscription {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<EventEnvelope> {
        self.rx.try_recv().ok()
    }
}

impl Stream for EventSubscription {
    type Item = EventEnvelope;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
