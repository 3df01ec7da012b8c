//! Downstream/upstream session pair.
//!
//! One [`DownstreamSession`] exists per accepted client connection. On the
//! first connection event it creates its [`UpstreamSession`] and asks the
//! connector for an upstream connection at the pre-resolved address.
//!
//! # Upstream State Machine
//!
//! ```text
//!             on_pool_ready                 close event / downstream close
//! Connecting ---------------> Connected -------------------------------> Closed
//!     |                                                                    ^
//!     | on_pool_failure                                                    |
//!     +---------------------> Failed          close event (still connecting)
//!     +--------------------------------------------------------------------+
//! ```
//!
//! # Ownership
//!
//! - The downstream session owns its upstream session.
//! - The upstream session only holds a [`Weak`] back-reference; bytes for a
//!   client that is already gone are dropped.
//! - The forwarding task owns the receiving end of the handoff queue and is
//!   the only writer to the upstream handle. Closing the queue is its only
//!   stop signal.
//!
//! # Backpressure
//!
//! - Client to server: client reads pause once the handoff queue holds more
//!   than the high watermark. The forwarding task waits for each upstream
//!   write to flush before taking the next chunk, and resumes client reads
//!   once the queue is down to half the watermark.
//! - Server to client: upstream reads pause once more than the high
//!   watermark has been written to the client but not flushed, and resume
//!   from `on_write` once half of it is flushed.

use crate::connector::UpstreamConnector;
use crate::queue::{self, Chunk, HandoffReceiver, HandoffSender, Pressure};
use crate::transport::{
    CloseType, ConnectionCallback, ConnectionEvent, DownstreamFilter, FilterStatus,
    PoolFailureReason, UpstreamFilter,
};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use tracing::{debug, warn};

/// Lifecycle of the upstream half.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamState {
    /// Connect requested; client bytes accumulate in the queue.
    Connecting,
    /// Write handle received; the forwarding task is running.
    Connected,
    /// The connect attempt failed. Terminal.
    Failed,
    /// A close was observed on either side. Terminal.
    Closed,
}

impl UpstreamState {
    /// Returns true for `Failed` and `Closed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, UpstreamState::Failed | UpstreamState::Closed)
    }
}

/// Read pausing for one connection.
///
/// Pause and resume decisions re-check the buffer level and call
/// `read_disable` while holding the same lock, so the last call a connection
/// sees always matches the buffer level at that moment.
#[derive(Debug, Default)]
struct ReadGate {
    paused: Mutex<bool>,
}

impl ReadGate {
    /// Disable reads on `conn` unless already paused or `over` no longer holds.
    fn pause_if(&self, conn: &dyn ConnectionCallback, over: impl FnOnce() -> bool) -> bool {
        let mut paused = self.paused.lock().unwrap_or_else(|e| e.into_inner());
        if *paused || !over() {
            return false;
        }
        *paused = true;
        conn.read_disable(true);
        true
    }

    /// Enable reads on `conn` if paused and `drained` holds.
    fn resume_if(&self, conn: &dyn ConnectionCallback, drained: impl FnOnce() -> bool) -> bool {
        let mut paused = self.paused.lock().unwrap_or_else(|e| e.into_inner());
        if !*paused || !drained() {
            return false;
        }
        *paused = false;
        conn.read_disable(false);
        true
    }

    fn is_paused(&self) -> bool {
        *self.paused.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Client-facing half of a session pair.
pub struct DownstreamSession {
    /// Where every connection of this filter instance is relayed to.
    upstream_addr: SocketAddr,

    /// Write handle to the client.
    callback: Arc<dyn ConnectionCallback>,

    /// Establishes the upstream connection.
    connector: Arc<dyn UpstreamConnector>,

    /// High watermark for the handoff queue and for unflushed client writes.
    high_watermark: usize,

    /// Set once by `on_new_connection`, never replaced.
    upstream: OnceLock<Arc<UpstreamSession>>,

    /// Weak self-reference handed to the upstream half.
    this: Weak<DownstreamSession>,

    /// Bytes flushed to the client, as reported by `on_write`.
    bytes_to_client: AtomicU64,
}

impl DownstreamSession {
    /// Create the downstream half for a freshly accepted connection.
    pub fn new(
        upstream_addr: SocketAddr,
        callback: Arc<dyn ConnectionCallback>,
        connector: Arc<dyn UpstreamConnector>,
        high_watermark: usize,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            upstream_addr,
            callback,
            connector,
            high_watermark,
            upstream: OnceLock::new(),
            this: this.clone(),
            bytes_to_client: AtomicU64::new(0),
        })
    }

    /// The upstream target of this session.
    pub fn upstream_addr(&self) -> SocketAddr {
        self.upstream_addr
    }

    /// The paired upstream session, once `on_new_connection` ran.
    pub fn upstream(&self) -> Option<&Arc<UpstreamSession>> {
        self.upstream.get()
    }

    /// Total bytes flushed to the client so far.
    pub fn bytes_to_client(&self) -> u64 {
        self.bytes_to_client.load(Ordering::Acquire)
    }

    fn client_addr(&self) -> String {
        self.callback
            .stream_info()
            .remote_addr
            .map(|a| a.to_string())
            .unwrap_or_else(|| "-".to_string())
    }
}

impl DownstreamFilter for DownstreamSession {
    fn on_new_connection(&self) -> FilterStatus {
        let info = self.callback.stream_info();
        debug!(
            local = ?info.local_addr,
            client = ?info.remote_addr,
            upstream = %self.upstream_addr,
            "new downstream connection"
        );

        if self.upstream.get().is_some() {
            warn!(client = %self.client_addr(), "duplicate new-connection event ignored");
            return FilterStatus::Continue;
        }

        let upstream = UpstreamSession::new(self.this.clone(), self.high_watermark);
        if self.upstream.set(Arc::clone(&upstream)).is_err() {
            return FilterStatus::Continue;
        }

        // Fire and forget: the outcome arrives on the upstream session.
        self.connector.connect(self.upstream_addr, upstream);
        FilterStatus::Continue
    }

    fn on_data(&self, data: Bytes, end_of_stream: bool) -> FilterStatus {
        debug!(
            client = %self.client_addr(),
            len = data.len(),
            end_of_stream,
            "downstream data"
        );

        let Some(upstream) = self.upstream.get() else {
            warn!(client = %self.client_addr(), "data before new-connection event dropped");
            return FilterStatus::StopIteration;
        };

        match upstream.queue.push(Chunk::new(data, end_of_stream)) {
            Ok(Pressure::Normal) => {}
            Ok(Pressure::High) => {
                let queue = &upstream.queue;
                if upstream
                    .client_reads
                    .pause_if(self.callback.as_ref(), || queue.above_high_watermark())
                {
                    debug!(
                        client = %self.client_addr(),
                        buffered = queue.buffered_bytes(),
                        "handoff queue above high watermark, pausing client reads"
                    );
                }
            }
            Err(e) => {
                debug!(client = %self.client_addr(), error = %e, "session pair torn down, chunk dropped");
                return FilterStatus::StopIteration;
            }
        }
        FilterStatus::Continue
    }

    fn on_event(&self, event: ConnectionEvent) {
        debug!(client = %self.client_addr(), %event, "downstream event");
        if event.is_close() {
            if let Some(upstream) = self.upstream.get() {
                upstream.shutdown();
            }
        }
    }

    fn on_write(&self, data: &[u8], end_of_stream: bool) -> FilterStatus {
        let flushed = self
            .bytes_to_client
            .fetch_add(data.len() as u64, Ordering::AcqRel)
            + data.len() as u64;
        debug!(len = data.len(), end_of_stream, "flushed to client");
        if let Some(upstream) = self.upstream.get() {
            upstream.client_flushed(flushed);
        }
        FilterStatus::Continue
    }
}

impl Drop for DownstreamSession {
    fn drop(&mut self) {
        // The pair never outlives the client connection.
        if let Some(upstream) = self.upstream.get() {
            upstream.shutdown();
        }
    }
}

/// Server-facing half of a session pair.
pub struct UpstreamSession {
    /// Non-owning link back to the client side.
    downstream: Weak<DownstreamSession>,

    /// Producer end of the handoff queue.
    queue: HandoffSender,

    /// Consumer end, moved into the forwarding task on connect.
    receiver: Mutex<Option<HandoffReceiver>>,

    state: Mutex<UpstreamState>,

    /// Pauses client reads while the handoff queue is above its high watermark.
    client_reads: Arc<ReadGate>,

    /// Pauses upstream reads while the client is slow to take its bytes.
    upstream_reads: ReadGate,

    /// Upstream handle, kept for read pausing. Only the forwarding task writes to it.
    handle: OnceLock<Arc<dyn ConnectionCallback>>,

    /// Bytes handed to the client's write handle.
    bytes_written_to_client: AtomicU64,
}

impl UpstreamSession {
    fn new(downstream: Weak<DownstreamSession>, high_watermark: usize) -> Arc<Self> {
        let (queue, receiver) = queue::channel(high_watermark);
        Arc::new(Self {
            downstream,
            queue,
            receiver: Mutex::new(Some(receiver)),
            state: Mutex::new(UpstreamState::Connecting),
            client_reads: Arc::new(ReadGate::default()),
            upstream_reads: ReadGate::default(),
            handle: OnceLock::new(),
            bytes_written_to_client: AtomicU64::new(0),
        })
    }

    /// Current state.
    pub fn state(&self) -> UpstreamState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Client bytes waiting to be forwarded.
    pub fn buffered_bytes(&self) -> usize {
        self.queue.buffered_bytes()
    }

    /// Whether the handoff queue has been closed.
    pub fn is_queue_closed(&self) -> bool {
        self.queue.is_closed()
    }

    /// Whether client reads are currently paused for backpressure.
    pub fn client_reads_paused(&self) -> bool {
        self.client_reads.is_paused()
    }

    /// Whether upstream reads are currently paused for backpressure.
    pub fn upstream_reads_paused(&self) -> bool {
        self.upstream_reads.is_paused()
    }

    /// Move to `Closed` and close the handoff queue.
    ///
    /// Safe to call any number of times from either side. Returns true for the
    /// call that closed the queue.
    pub fn shutdown(&self) -> bool {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if !state.is_terminal() {
                *state = UpstreamState::Closed;
            }
        }
        // Connecting sessions still own the receiver; releasing it frees queued chunks.
        self.receiver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let closed = self.queue.close();
        if closed {
            debug!("handoff queue closed");
        }
        closed
    }

    fn close_downstream(&self, close_type: CloseType) {
        if let Some(downstream) = self.downstream.upgrade() {
            downstream.callback.close(close_type);
        }
    }

    /// Bytes handed to the client but not yet flushed, given `flushed` so far.
    fn client_backlog(&self, flushed: u64) -> u64 {
        self.bytes_written_to_client
            .load(Ordering::Acquire)
            .saturating_sub(flushed)
    }

    /// Resume upstream reads once the client backlog fell to half the watermark.
    fn client_flushed(&self, flushed: u64) {
        let Some(handle) = self.handle.get() else {
            return;
        };
        let low = self.queue.high_watermark() as u64 / 2;
        if self
            .upstream_reads
            .resume_if(handle.as_ref(), || self.client_backlog(flushed) <= low)
        {
            debug!("client caught up, resuming upstream reads");
        }
    }
}

impl UpstreamFilter for UpstreamSession {
    fn on_pool_ready(&self, handle: Arc<dyn ConnectionCallback>) {
        let info = handle.stream_info();
        let receiver = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state != UpstreamState::Connecting {
                debug!(state = ?*state, upstream = ?info.remote_addr, "late connect success ignored");
                drop(state);
                handle.close(CloseType::NoFlush);
                return;
            }
            let receiver = self
                .receiver
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            match receiver {
                Some(receiver) => {
                    *state = UpstreamState::Connected;
                    receiver
                }
                None => {
                    *state = UpstreamState::Closed;
                    drop(state);
                    handle.close(CloseType::NoFlush);
                    return;
                }
            }
        };

        debug!(
            local = ?info.local_addr,
            upstream = ?info.remote_addr,
            pending = receiver.buffered_bytes(),
            "upstream connected, starting forwarding task"
        );

        let _ = self.handle.set(Arc::clone(&handle));
        tokio::spawn(forward(
            receiver,
            handle,
            self.downstream.clone(),
            Arc::clone(&self.client_reads),
        ));
    }

    fn on_pool_failure(&self, reason: PoolFailureReason, detail: &str) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state != UpstreamState::Connecting {
                debug!(state = ?*state, %reason, "late connect failure ignored");
                return;
            }
            *state = UpstreamState::Failed;
        }

        warn!(%reason, detail, "upstream connect failed");
        self.receiver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        self.queue.close();
        self.close_downstream(CloseType::NoFlush);
    }

    fn on_data(&self, data: Bytes, end_of_stream: bool) {
        debug!(len = data.len(), end_of_stream, "upstream data");
        let Some(downstream) = self.downstream.upgrade() else {
            debug!(len = data.len(), "client gone, upstream bytes dropped");
            return;
        };

        self.bytes_written_to_client
            .fetch_add(data.len() as u64, Ordering::AcqRel);
        downstream.callback.write(data, end_of_stream);

        let Some(handle) = self.handle.get() else {
            return;
        };
        let high = self.queue.high_watermark() as u64;
        if self.upstream_reads.pause_if(handle.as_ref(), || {
            self.client_backlog(downstream.bytes_to_client()) > high
        }) {
            debug!(
                backlog = self.client_backlog(downstream.bytes_to_client()),
                "client write backlog above high watermark, pausing upstream reads"
            );
        }
    }

    fn on_event(&self, event: ConnectionEvent) {
        debug!(%event, "upstream event");
        if event.is_close() {
            self.shutdown();
            self.close_downstream(CloseType::FlushWrite);
        }
    }
}

/// Drain the handoff queue into the upstream connection.
///
/// Each chunk is written only after the previous one was flushed, so client
/// bytes wait in the handoff queue (where the watermark sees them) rather
/// than in the connection's write buffer. Once the queue is closed the
/// remaining chunks are written without waiting. Runs until the queue is
/// closed and empty, then closes the upstream handle. This is the only
/// writer to `handle`.
async fn forward(
    mut receiver: HandoffReceiver,
    handle: Arc<dyn ConnectionCallback>,
    downstream: Weak<DownstreamSession>,
    client_reads: Arc<ReadGate>,
) {
    let mut forwarded: u64 = 0;
    while let Some(chunk) = receiver.recv().await {
        forwarded += chunk.data.len() as u64;
        handle.write(chunk.data, chunk.end_of_stream);

        if !receiver.is_closed() {
            tokio::select! {
                // Err means the writer is gone; the close event follows.
                _ = handle.flushed() => {}
                _ = receiver.closed() => {}
            }
        }

        if let Some(downstream) = downstream.upgrade() {
            if client_reads.resume_if(downstream.callback.as_ref(), || receiver.below_low_watermark()) {
                debug!(
                    buffered = receiver.buffered_bytes(),
                    "handoff queue drained, resuming client reads"
                );
            }
        }
    }

    debug!(bytes = forwarded, "handoff queue closed, forwarding task done");
    handle.close(CloseType::FlushWrite);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Flushed, StreamInfo};
    use std::time::Duration;
    use tokio::sync::{mpsc, oneshot};

    // ========================================================================
    // Fakes
    // ========================================================================

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Op {
        Write(Bytes, bool),
        Close(CloseType),
        ReadDisable(bool),
    }

    /// Write handle that reports every call on a channel.
    struct RecordingCallback {
        ops: mpsc::UnboundedSender<Op>,
        info: StreamInfo,
        /// `Some` while flush acknowledgements are held back.
        held_flushes: Mutex<Option<Vec<oneshot::Sender<()>>>>,
        /// Time `read_disable(true)` takes before it is recorded.
        pause_delay: Duration,
    }

    impl RecordingCallback {
        fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Op>) {
            Self::build(false, Duration::ZERO)
        }

        /// Flushes are only acknowledged after `release_flushes`.
        fn holding_flushes() -> (Arc<Self>, mpsc::UnboundedReceiver<Op>) {
            Self::build(true, Duration::ZERO)
        }

        /// `read_disable(true)` blocks the calling thread for `delay`.
        fn slow_to_pause(delay: Duration) -> (Arc<Self>, mpsc::UnboundedReceiver<Op>) {
            Self::build(false, delay)
        }

        fn build(hold: bool, pause_delay: Duration) -> (Arc<Self>, mpsc::UnboundedReceiver<Op>) {
            let (ops, rx) = mpsc::unbounded_channel();
            let info = StreamInfo {
                local_addr: Some("127.0.0.1:10000".parse().unwrap()),
                remote_addr: Some("127.0.0.1:40000".parse().unwrap()),
            };
            let callback = Self {
                ops,
                info,
                held_flushes: Mutex::new(hold.then(Vec::new)),
                pause_delay,
            };
            (Arc::new(callback), rx)
        }

        /// Acknowledge every held flush and stop holding new ones.
        fn release_flushes(&self) {
            if let Some(held) = self.held_flushes.lock().unwrap().take() {
                for ack in held {
                    let _ = ack.send(());
                }
            }
        }
    }

    impl ConnectionCallback for RecordingCallback {
        fn write(&self, data: Bytes, end_of_stream: bool) {
            let _ = self.ops.send(Op::Write(data, end_of_stream));
        }

        fn flushed(&self) -> Flushed {
            let (tx, rx) = oneshot::channel();
            match self.held_flushes.lock().unwrap().as_mut() {
                Some(held) => held.push(tx),
                None => {
                    let _ = tx.send(());
                }
            }
            rx
        }

        fn close(&self, close_type: CloseType) {
            let _ = self.ops.send(Op::Close(close_type));
        }

        fn read_disable(&self, disable: bool) {
            if disable && !self.pause_delay.is_zero() {
                std::thread::sleep(self.pause_delay);
            }
            let _ = self.ops.send(Op::ReadDisable(disable));
        }

        fn stream_info(&self) -> StreamInfo {
            self.info
        }
    }

    /// Connector that records requests; the test decides the outcome.
    #[derive(Default)]
    struct ManualConnector {
        requests: Mutex<Vec<(SocketAddr, Arc<dyn UpstreamFilter>)>>,
    }

    impl ManualConnector {
        fn count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        fn take(&self) -> (SocketAddr, Arc<dyn UpstreamFilter>) {
            self.requests.lock().unwrap().remove(0)
        }
    }

    impl UpstreamConnector for ManualConnector {
        fn connect(&self, addr: SocketAddr, receiver: Arc<dyn UpstreamFilter>) {
            self.requests.lock().unwrap().push((addr, receiver));
        }
    }

    fn target() -> SocketAddr {
        "10.0.0.5:9000".parse().unwrap()
    }

    struct Pair {
        session: Arc<DownstreamSession>,
        client: mpsc::UnboundedReceiver<Op>,
        connector: Arc<ManualConnector>,
    }

    fn pair(high_watermark: usize) -> Pair {
        let (callback, client) = RecordingCallback::new();
        pair_with(callback, client, high_watermark)
    }

    fn pair_with(
        callback: Arc<RecordingCallback>,
        client: mpsc::UnboundedReceiver<Op>,
        high_watermark: usize,
    ) -> Pair {
        let connector = Arc::new(ManualConnector::default());
        let session = DownstreamSession::new(
            target(),
            callback,
            Arc::clone(&connector) as Arc<dyn UpstreamConnector>,
            high_watermark,
        );
        Pair {
            session,
            client,
            connector,
        }
    }

    async fn next_op(rx: &mut mpsc::UnboundedReceiver<Op>) -> Op {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for op")
            .expect("callback dropped")
    }

    fn write(s: &'static str) -> Op {
        Op::Write(Bytes::from_static(s.as_bytes()), false)
    }

    fn data(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    // ========================================================================
    // Connection Setup Tests
    // ========================================================================

    #[test]
    fn test_new_connection_starts_one_connect_attempt() {
        let p = pair(queue::DEFAULT_HIGH_WATERMARK);
        assert_eq!(p.session.on_new_connection(), FilterStatus::Continue);
        assert_eq!(p.connector.count(), 1);
        let (addr, _) = p.connector.take();
        assert_eq!(addr, target());
        assert_eq!(p.session.upstream().unwrap().state(), UpstreamState::Connecting);
    }

    #[test]
    fn test_duplicate_new_connection_keeps_upstream() {
        let p = pair(queue::DEFAULT_HIGH_WATERMARK);
        p.session.on_new_connection();
        let first = Arc::as_ptr(p.session.upstream().unwrap());
        p.session.on_new_connection();
        assert_eq!(p.connector.count(), 1);
        assert_eq!(Arc::as_ptr(p.session.upstream().unwrap()), first);
    }

    #[test]
    fn test_data_before_new_connection_is_dropped() {
        let p = pair(queue::DEFAULT_HIGH_WATERMARK);
        assert_eq!(p.session.on_data(data("x"), false), FilterStatus::StopIteration);
        assert!(p.session.upstream().is_none());
    }

    // ========================================================================
    // Forwarding Tests
    // ========================================================================

    #[tokio::test]
    async fn test_chunks_before_connect_are_forwarded_in_order() {
        let p = pair(queue::DEFAULT_HIGH_WATERMARK);
        p.session.on_new_connection();
        for s in ["one", "two", "three"] {
            p.session.on_data(data(s), false);
        }
        assert_eq!(p.session.upstream().unwrap().buffered_bytes(), 11);

        let (_, upstream) = p.connector.take();
        let (handle, mut server) = RecordingCallback::new();
        upstream.on_pool_ready(handle);
        p.session.on_data(data("four"), false);

        for s in ["one", "two", "three", "four"] {
            assert_eq!(next_op(&mut server).await, write(s));
        }
        assert_eq!(p.session.upstream().unwrap().state(), UpstreamState::Connected);
    }

    #[tokio::test]
    async fn test_end_of_stream_is_carried_upstream() {
        let p = pair(queue::DEFAULT_HIGH_WATERMARK);
        p.session.on_new_connection();
        p.session.on_data(data("bye"), false);
        p.session.on_data(Bytes::new(), true);

        let (_, upstream) = p.connector.take();
        let (handle, mut server) = RecordingCallback::new();
        upstream.on_pool_ready(handle);

        assert_eq!(next_op(&mut server).await, write("bye"));
        assert_eq!(next_op(&mut server).await, Op::Write(Bytes::new(), true));
    }

    #[tokio::test]
    async fn test_upstream_bytes_written_to_client_immediately() {
        let mut p = pair(queue::DEFAULT_HIGH_WATERMARK);
        p.session.on_new_connection();
        let (_, upstream) = p.connector.take();

        upstream.on_data(data("OK\n"), false);
        upstream.on_data(data("more"), true);

        assert_eq!(next_op(&mut p.client).await, write("OK\n"));
        assert_eq!(
            next_op(&mut p.client).await,
            Op::Write(data("more"), true)
        );
    }

    #[test]
    fn test_on_write_counts_flushed_bytes() {
        let p = pair(queue::DEFAULT_HIGH_WATERMARK);
        p.session.on_write(b"hello", false);
        p.session.on_write(b"!", true);
        assert_eq!(p.session.bytes_to_client(), 6);
    }

    // ========================================================================
    // Teardown Tests
    // ========================================================================

    #[tokio::test]
    async fn test_upstream_close_stops_forwarding_and_closes_client() {
        let mut p = pair(queue::DEFAULT_HIGH_WATERMARK);
        p.session.on_new_connection();
        let (_, upstream) = p.connector.take();
        let (handle, mut server) = RecordingCallback::new();
        upstream.on_pool_ready(handle);

        p.session.on_data(data("ping"), false);
        assert_eq!(next_op(&mut server).await, write("ping"));

        upstream.on_event(ConnectionEvent::RemoteClose);
        assert_eq!(next_op(&mut server).await, Op::Close(CloseType::FlushWrite));
        assert_eq!(next_op(&mut p.client).await, Op::Close(CloseType::FlushWrite));
        assert_eq!(p.session.upstream().unwrap().state(), UpstreamState::Closed);
    }

    #[tokio::test]
    async fn test_double_close_is_observed_once() {
        let p = pair(queue::DEFAULT_HIGH_WATERMARK);
        p.session.on_new_connection();
        let (_, upstream) = p.connector.take();
        let (handle, mut server) = RecordingCallback::new();
        upstream.on_pool_ready(handle);

        let session = p.session.upstream().unwrap();
        assert!(session.shutdown());
        assert!(!session.shutdown());
        upstream.on_event(ConnectionEvent::LocalClose);
        upstream.on_event(ConnectionEvent::RemoteClose);

        // The forwarding task ends normally: exactly one close, nothing else.
        assert_eq!(next_op(&mut server).await, Op::Close(CloseType::FlushWrite));
        drop(upstream);
        drop(p.session);
        let extra = tokio::time::timeout(Duration::from_millis(100), server.recv()).await;
        assert!(!matches!(extra, Ok(Some(_))));
    }

    #[tokio::test]
    async fn test_downstream_close_tears_down_pair() {
        let p = pair(queue::DEFAULT_HIGH_WATERMARK);
        p.session.on_new_connection();
        let (_, upstream) = p.connector.take();
        let (handle, mut server) = RecordingCallback::new();
        upstream.on_pool_ready(handle);

        p.session.on_data(data("last"), false);
        p.session.on_event(ConnectionEvent::RemoteClose);

        assert_eq!(next_op(&mut server).await, write("last"));
        assert_eq!(next_op(&mut server).await, Op::Close(CloseType::FlushWrite));
        assert!(p.session.upstream().unwrap().is_queue_closed());
    }

    #[tokio::test]
    async fn test_late_connect_success_after_close_is_ignored() {
        let p = pair(queue::DEFAULT_HIGH_WATERMARK);
        p.session.on_new_connection();
        p.session.on_data(data("never sent"), false);
        p.session.on_event(ConnectionEvent::RemoteClose);

        let (_, upstream) = p.connector.take();
        let (handle, mut server) = RecordingCallback::new();
        upstream.on_pool_ready(handle);

        assert_eq!(next_op(&mut server).await, Op::Close(CloseType::NoFlush));
        let extra = tokio::time::timeout(Duration::from_millis(100), server.recv()).await;
        assert!(!matches!(extra, Ok(Some(_))), "no bytes may reach a late upstream");
        assert_eq!(p.session.upstream().unwrap().state(), UpstreamState::Closed);
    }

    #[tokio::test]
    async fn test_late_connect_success_after_session_dropped_is_ignored() {
        let p = pair(queue::DEFAULT_HIGH_WATERMARK);
        p.session.on_new_connection();
        let (_, upstream) = p.connector.take();
        drop(p.session);

        let (handle, mut server) = RecordingCallback::new();
        upstream.on_pool_ready(handle);
        assert_eq!(next_op(&mut server).await, Op::Close(CloseType::NoFlush));
    }

    #[tokio::test]
    async fn test_late_connect_failure_after_close_is_ignored() {
        let mut p = pair(queue::DEFAULT_HIGH_WATERMARK);
        p.session.on_new_connection();
        p.session.on_event(ConnectionEvent::LocalClose);

        let (_, upstream) = p.connector.take();
        upstream.on_pool_failure(PoolFailureReason::Timeout, "too slow");

        assert_eq!(p.session.upstream().unwrap().state(), UpstreamState::Closed);
        assert!(p.client.try_recv().is_err(), "client must not be touched");
    }

    #[tokio::test]
    async fn test_connect_failure_closes_client() {
        let mut p = pair(queue::DEFAULT_HIGH_WATERMARK);
        p.session.on_new_connection();
        p.session.on_data(data("lost"), false);

        let (_, upstream) = p.connector.take();
        upstream.on_pool_failure(PoolFailureReason::RemoteConnectionFailure, "refused");

        assert_eq!(next_op(&mut p.client).await, Op::Close(CloseType::NoFlush));
        let session = p.session.upstream().unwrap();
        assert_eq!(session.state(), UpstreamState::Failed);
        assert!(session.is_queue_closed());

        // A success arriving after the failure must not start forwarding.
        let (handle, mut server) = RecordingCallback::new();
        upstream.on_pool_ready(handle);
        assert_eq!(next_op(&mut server).await, Op::Close(CloseType::NoFlush));
        assert_eq!(session.state(), UpstreamState::Failed);
    }

    #[tokio::test]
    async fn test_data_after_teardown_is_refused() {
        let p = pair(queue::DEFAULT_HIGH_WATERMARK);
        p.session.on_new_connection();
        p.session.on_event(ConnectionEvent::RemoteClose);
        assert_eq!(p.session.on_data(data("late"), false), FilterStatus::StopIteration);
        assert_eq!(p.session.upstream().unwrap().buffered_bytes(), 0);
    }

    #[tokio::test]
    async fn test_upstream_data_after_client_gone_is_dropped() {
        let p = pair(queue::DEFAULT_HIGH_WATERMARK);
        p.session.on_new_connection();
        let (_, upstream) = p.connector.take();
        drop(p.session);
        // No panic, no write.
        upstream.on_data(data("orphan"), false);
    }

    // ========================================================================
    // Backpressure Tests
    // ========================================================================

    #[tokio::test]
    async fn test_high_watermark_pauses_and_drain_resumes_reads() {
        let mut p = pair(8);
        p.session.on_new_connection();
        p.session.on_data(data("12345"), false);
        p.session.on_data(data("67890"), false);
        assert_eq!(next_op(&mut p.client).await, Op::ReadDisable(true));

        // Still paused: no second disable.
        p.session.on_data(data("x"), false);
        assert!(p.client.try_recv().is_err());

        let (_, upstream) = p.connector.take();
        let (handle, mut server) = RecordingCallback::new();
        upstream.on_pool_ready(handle);

        assert_eq!(next_op(&mut server).await, write("12345"));
        assert_eq!(next_op(&mut server).await, write("67890"));
        assert_eq!(next_op(&mut server).await, write("x"));
        assert_eq!(next_op(&mut p.client).await, Op::ReadDisable(false));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_pause_is_never_left_standing_after_drain() {
        let (callback, client) = RecordingCallback::slow_to_pause(Duration::from_millis(100));
        let mut p = pair_with(callback, client, 8);
        p.session.on_new_connection();
        let (_, upstream) = p.connector.take();
        let (handle, mut server) = RecordingCallback::new();
        upstream.on_pool_ready(handle);

        // The forwarding task drains this while the pause is still in flight.
        p.session.on_data(data("0123456789"), false);
        assert_eq!(next_op(&mut server).await, write("0123456789"));

        let mut ops = Vec::new();
        while let Ok(op) = p.client.try_recv() {
            ops.push(op);
        }
        if ops.last() == Some(&Op::ReadDisable(true)) {
            ops.push(next_op(&mut p.client).await);
        }
        assert!(
            matches!(ops.as_slice(), [] | [Op::ReadDisable(true), Op::ReadDisable(false)]),
            "client ops = {ops:?}"
        );
        let session = p.session.upstream().unwrap();
        assert_eq!(session.buffered_bytes(), 0);
        assert!(!session.client_reads_paused());
    }

    #[tokio::test]
    async fn test_unflushed_upstream_write_holds_back_the_queue() {
        let mut p = pair(8);
        p.session.on_new_connection();
        let (_, upstream) = p.connector.take();
        let (handle, mut server) = RecordingCallback::holding_flushes();
        upstream.on_pool_ready(Arc::clone(&handle) as Arc<dyn ConnectionCallback>);

        p.session.on_data(data("first"), false);
        assert_eq!(next_op(&mut server).await, write("first"));

        // "first" is not flushed, so the rest stays queued and trips the watermark.
        p.session.on_data(data("12345"), false);
        p.session.on_data(data("67890"), false);
        assert_eq!(next_op(&mut p.client).await, Op::ReadDisable(true));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(server.try_recv().is_err(), "forwarded past an unflushed write");
        assert_eq!(p.session.upstream().unwrap().buffered_bytes(), 10);

        handle.release_flushes();
        assert_eq!(next_op(&mut server).await, write("12345"));
        assert_eq!(next_op(&mut server).await, write("67890"));
        assert_eq!(next_op(&mut p.client).await, Op::ReadDisable(false));
        assert!(!p.session.upstream().unwrap().client_reads_paused());
    }

    #[tokio::test]
    async fn test_close_while_flush_pending_still_drains_queue() {
        let p = pair(queue::DEFAULT_HIGH_WATERMARK);
        p.session.on_new_connection();
        let (_, upstream) = p.connector.take();
        let (handle, mut server) = RecordingCallback::holding_flushes();
        upstream.on_pool_ready(handle);

        p.session.on_data(data("one"), false);
        p.session.on_data(data("two"), false);
        assert_eq!(next_op(&mut server).await, write("one"));

        p.session.on_event(ConnectionEvent::RemoteClose);
        assert_eq!(next_op(&mut server).await, write("two"));
        assert_eq!(next_op(&mut server).await, Op::Close(CloseType::FlushWrite));
    }

    #[tokio::test]
    async fn test_slow_client_pauses_upstream_reads_until_flushed() {
        let mut p = pair(8);
        p.session.on_new_connection();
        let (_, upstream) = p.connector.take();
        let (handle, mut server) = RecordingCallback::new();
        upstream.on_pool_ready(handle);

        upstream.on_data(data("0123"), false);
        upstream.on_data(data("456789"), false);
        assert_eq!(next_op(&mut p.client).await, write("0123"));
        assert_eq!(next_op(&mut p.client).await, write("456789"));
        assert_eq!(next_op(&mut server).await, Op::ReadDisable(true));
        assert!(p.session.upstream().unwrap().upstream_reads_paused());

        // 7 of 10 bytes still unflushed: not enough.
        p.session.on_write(b"012", false);
        assert!(server.try_recv().is_err());

        p.session.on_write(b"3456", false);
        assert_eq!(next_op(&mut server).await, Op::ReadDisable(false));
        assert!(!p.session.upstream().unwrap().upstream_reads_paused());
    }

    // ========================================================================
    // End-to-End Scenario
    // ========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_request_before_connect_then_reply_then_close() {
        let mut p = pair(queue::DEFAULT_HIGH_WATERMARK);
        p.session.on_new_connection();
        p.session.on_data(data("GET /\n"), false);

        let (addr, upstream) = p.connector.take();
        assert_eq!(addr, "10.0.0.5:9000".parse::<SocketAddr>().unwrap());

        tokio::time::sleep(Duration::from_millis(5)).await;
        let (handle, mut server) = RecordingCallback::new();
        upstream.on_pool_ready(handle);
        upstream.on_event(ConnectionEvent::Connected);
        assert_eq!(next_op(&mut server).await, write("GET /\n"));

        upstream.on_data(data("OK\n"), false);
        assert_eq!(next_op(&mut p.client).await, write("OK\n"));

        p.session.on_data(Bytes::new(), true);
        p.session.on_event(ConnectionEvent::RemoteClose);
        assert_eq!(next_op(&mut server).await, Op::Write(Bytes::new(), true));
        assert_eq!(next_op(&mut server).await, Op::Close(CloseType::FlushWrite));
        assert_eq!(p.session.upstream().unwrap().state(), UpstreamState::Closed);
    }
}
