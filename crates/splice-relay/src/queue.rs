//! Handoff queue between the downstream callbacks and the forwarding task.
//!
//! Client bytes can arrive long before the upstream connection exists, so
//! the downstream half parks them here and the forwarding task drains them
//! once the upstream handle is ready.
//!
//! - Single producer ([`HandoffSender`]), single consumer ([`HandoffReceiver`]).
//! - FIFO: chunks come out in the order they went in.
//! - `push` never blocks. Capacity is unbounded; the byte count is tracked so
//!   the caller can apply backpressure once it passes the high watermark.
//! - `close` is idempotent. The receiver still yields every chunk pushed
//!   before the close, then `None`.

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};

/// Default high watermark for buffered client bytes (1 MiB).
pub const DEFAULT_HIGH_WATERMARK: usize = 1024 * 1024;

/// A piece of client data waiting to be written upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Raw bytes, relayed unmodified.
    pub data: Bytes,
    /// The client half-closed after these bytes.
    pub end_of_stream: bool,
}

impl Chunk {
    /// Create a chunk.
    pub fn new(data: Bytes, end_of_stream: bool) -> Self {
        Self {
            data,
            end_of_stream,
        }
    }
}

/// Returned by [`HandoffSender::push`] once the queue has been closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("handoff queue closed")]
pub struct QueueClosed;

/// Buffer level after a successful push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pressure {
    /// At or below the high watermark.
    Normal,
    /// Above the high watermark; the producer should stop reading.
    High,
}

/// State visible to both halves.
struct Shared {
    buffered: AtomicUsize,
    high_watermark: usize,
    closed: AtomicBool,
    /// Woken by `close`.
    on_close: Notify,
}

/// Create a handoff queue with the given high watermark in bytes.
pub fn channel(high_watermark: usize) -> (HandoffSender, HandoffReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        buffered: AtomicUsize::new(0),
        high_watermark: high_watermark.max(1),
        closed: AtomicBool::new(false),
        on_close: Notify::new(),
    });
    (
        HandoffSender {
            tx: Mutex::new(Some(tx)),
            shared: Arc::clone(&shared),
        },
        HandoffReceiver { rx, shared },
    )
}

/// Producer half, held by the upstream session on behalf of the client side.
pub struct HandoffSender {
    /// `None` once closed. Dropping the sender is what wakes the receiver.
    tx: Mutex<Option<mpsc::UnboundedSender<Chunk>>>,
    shared: Arc<Shared>,
}

impl HandoffSender {
    /// Append a chunk.
    ///
    /// # Errors
    /// Returns [`QueueClosed`] if the queue was closed or the receiver is gone.
    pub fn push(&self, chunk: Chunk) -> Result<Pressure, QueueClosed> {
        // Recover from a poisoned lock: the Option inside is still consistent.
        let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        let tx = guard.as_ref().ok_or(QueueClosed)?;

        let len = chunk.data.len();
        let buffered = self.shared.buffered.fetch_add(len, Ordering::AcqRel) + len;
        if tx.send(chunk).is_err() {
            self.shared.buffered.fetch_sub(len, Ordering::AcqRel);
            return Err(QueueClosed);
        }

        if buffered > self.shared.high_watermark {
            Ok(Pressure::High)
        } else {
            Ok(Pressure::Normal)
        }
    }

    /// Close the queue. Returns `true` only for the call that actually closed it.
    pub fn close(&self) -> bool {
        let mut guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        let was_open = guard.take().is_some();
        if was_open {
            self.shared.closed.store(true, Ordering::Release);
            self.shared.on_close.notify_waiters();
        }
        was_open
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Bytes pushed but not yet taken by the receiver.
    pub fn buffered_bytes(&self) -> usize {
        self.shared.buffered.load(Ordering::Acquire)
    }

    /// True while more than the high watermark is buffered.
    pub fn above_high_watermark(&self) -> bool {
        self.buffered_bytes() > self.shared.high_watermark
    }

    /// The high watermark in bytes.
    pub fn high_watermark(&self) -> usize {
        self.shared.high_watermark
    }
}

/// Consumer half, moved into the forwarding task.
pub struct HandoffReceiver {
    rx: mpsc::UnboundedReceiver<Chunk>,
    shared: Arc<Shared>,
}

impl HandoffReceiver {
    /// Wait for the next chunk.
    ///
    /// Returns `None` once the queue is closed and every earlier chunk has
    /// been handed out.
    pub async fn recv(&mut self) -> Option<Chunk> {
        let chunk = self.rx.recv().await?;
        self.shared
            .buffered
            .fetch_sub(chunk.data.len(), Ordering::AcqRel);
        Some(chunk)
    }

    /// True when the buffered bytes dropped to half the high watermark or less.
    pub fn below_low_watermark(&self) -> bool {
        self.shared.buffered.load(Ordering::Acquire) <= self.shared.high_watermark / 2
    }

    /// Bytes pushed but not yet received.
    pub fn buffered_bytes(&self) -> usize {
        self.shared.buffered.load(Ordering::Acquire)
    }

    /// Whether the sender closed the queue. Chunks may still be pending.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Wait until the sender closes the queue.
    pub async fn closed(&self) {
        loop {
            let notified = self.shared.on_close.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}
