//! Tokio-backed [`ConnectionCallback`] for a TCP stream.
//!
//! Each stream is split in two:
//!
//! - a writer task that owns the write half and applies queued operations in
//!   order (`write`, `flushed`, `close`);
//! - a [`ConnectionReader`] that the caller drives, delivering inbound bytes
//!   and exactly one terminal event.
//!
//! The two halves share a small control block through a `watch` channel so
//! the reader can notice read pausing, local closes, write failures and a
//! finished write side without polling.

use crate::transport::{
    CloseType, ConnectionCallback, ConnectionEvent, DownstreamFilter, Flushed, StreamInfo,
};
use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

/// Read buffer size per `read` call.
pub const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Queued work for the writer task.
enum WriteOp {
    Data(Bytes, bool),
    /// Answered once every earlier `Data` op has been written.
    Flush(oneshot::Sender<()>),
    Close,
}

/// Flags shared by the reader, the writer and the handle.
#[derive(Debug, Clone, Copy, Default)]
struct Control {
    read_disabled: bool,
    local_close: bool,
    write_failed: bool,
    write_finished: bool,
}

/// Write handle for one TCP connection.
pub struct TcpConnection {
    info: StreamInfo,
    writes: mpsc::UnboundedSender<WriteOp>,
    control: Arc<watch::Sender<Control>>,
    /// Set by `close(NoFlush)`; makes the writer skip queued data.
    discard: Arc<AtomicBool>,
    /// Receives `on_write` after each flush (downstream connections only).
    observer: Arc<OnceLock<Weak<dyn DownstreamFilter>>>,
}

impl TcpConnection {
    /// Split `stream`, spawn its writer task and return the handle and reader.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(stream: TcpStream) -> (Arc<TcpConnection>, ConnectionReader) {
        let info = StreamInfo {
            local_addr: stream.local_addr().ok(),
            remote_addr: stream.peer_addr().ok(),
        };
        let (read_half, write_half) = stream.into_split();
        let (writes, ops) = mpsc::unbounded_channel();
        let (control, control_rx) = watch::channel(Control::default());
        let control = Arc::new(control);
        let discard = Arc::new(AtomicBool::new(false));
        let observer: Arc<OnceLock<Weak<dyn DownstreamFilter>>> = Arc::new(OnceLock::new());

        tokio::spawn(write_loop(
            write_half,
            ops,
            Arc::clone(&control),
            Arc::clone(&discard),
            Arc::clone(&observer),
        ));

        let connection = Arc::new(TcpConnection {
            info,
            writes,
            control,
            discard,
            observer,
        });
        let reader = ConnectionReader {
            read_half,
            control: control_rx,
        };
        (connection, reader)
    }

    /// Report flushed bytes to `filter` via [`DownstreamFilter::on_write`].
    pub fn observe_writes(&self, filter: Weak<dyn DownstreamFilter>) {
        let _ = self.observer.set(filter);
    }
}

impl ConnectionCallback for TcpConnection {
    fn write(&self, data: Bytes, end_of_stream: bool) {
        // A gone writer means the connection is already closed.
        let _ = self.writes.send(WriteOp::Data(data, end_of_stream));
    }

    fn flushed(&self) -> Flushed {
        let (tx, rx) = oneshot::channel();
        // If the writer is gone, `tx` is dropped here and `rx` resolves to an error.
        let _ = self.writes.send(WriteOp::Flush(tx));
        rx
    }

    fn close(&self, close_type: CloseType) {
        match close_type {
            CloseType::NoFlush => {
                self.discard.store(true, Ordering::Release);
                self.control.send_modify(|c| c.local_close = true);
                let _ = self.writes.send(WriteOp::Close);
            }
            CloseType::FlushWrite => {
                let _ = self.writes.send(WriteOp::Close);
            }
        }
    }

    fn read_disable(&self, disable: bool) {
        self.control.send_if_modified(|c| {
            if c.read_disabled == disable {
                false
            } else {
                c.read_disabled = disable;
                true
            }
        });
    }

    fn stream_info(&self) -> StreamInfo {
        self.info
    }
}

/// Apply queued writes in order until closed.
async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut ops: mpsc::UnboundedReceiver<WriteOp>,
    control: Arc<watch::Sender<Control>>,
    discard: Arc<AtomicBool>,
    observer: Arc<OnceLock<Weak<dyn DownstreamFilter>>>,
) {
    let mut shut_down = false;
    while let Some(op) = ops.recv().await {
        match op {
            WriteOp::Data(data, end_of_stream) => {
                if discard.load(Ordering::Acquire) {
                    break;
                }
                if shut_down {
                    debug!(len = data.len(), "write after end of stream dropped");
                    continue;
                }
                if !data.is_empty() {
                    if let Err(e) = write_half.write_all(&data).await {
                        debug!(error = %e, "connection write failed");
                        control.send_modify(|c| c.write_failed = true);
                        return;
                    }
                }
                if end_of_stream {
                    // Best-effort half-close; a failing peer surfaces on the read side.
                    let _ = write_half.shutdown().await;
                    shut_down = true;
                    control.send_modify(|c| c.write_finished = true);
                }
                if let Some(filter) = observer.get().and_then(|w| w.upgrade()) {
                    filter.on_write(&data, end_of_stream);
                }
            }
            WriteOp::Flush(ack) => {
                let _ = ack.send(());
            }
            WriteOp::Close => break,
        }
    }

    if !shut_down {
        let _ = write_half.shutdown().await;
    }
    control.send_modify(|c| c.local_close = true);
}

/// Inbound side of a [`TcpConnection`].
pub struct ConnectionReader {
    read_half: OwnedReadHalf,
    control: watch::Receiver<Control>,
}

impl ConnectionReader {
    /// Deliver inbound bytes to `on_data` until the connection ends, then
    /// report the terminal event to `on_event`.
    ///
    /// Peer EOF is delivered as an empty chunk with `end_of_stream` set. The
    /// connection then stays open until our write side finishes too, so a
    /// half-closed client still receives the rest of the response.
    pub async fn run<D, E>(mut self, mut on_data: D, on_event: E)
    where
        D: FnMut(Bytes, bool),
        E: FnOnce(ConnectionEvent),
    {
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
        let mut read_open = true;

        let event = loop {
            let control = *self.control.borrow_and_update();
            if control.local_close {
                break ConnectionEvent::LocalClose;
            }
            if control.write_failed {
                break ConnectionEvent::RemoteClose;
            }
            if !read_open && control.write_finished {
                break ConnectionEvent::RemoteClose;
            }

            if !read_open || control.read_disabled {
                if self.control.changed().await.is_err() {
                    break ConnectionEvent::LocalClose;
                }
                continue;
            }

            buf.reserve(READ_BUFFER_SIZE);
            tokio::select! {
                changed = self.control.changed() => {
                    if changed.is_err() {
                        break ConnectionEvent::LocalClose;
                    }
                }
                read = self.read_half.read_buf(&mut buf) => match read {
                    Ok(0) => {
                        read_open = false;
                        on_data(Bytes::new(), true);
                    }
                    Ok(_) => on_data(buf.split().freeze(), false),
                    Err(e) => {
                        debug!(error = %e, "connection read failed");
                        break ConnectionEvent::RemoteClose;
                    }
                },
            }
        };

        on_event(event);
    }
}
