//! Transport callback surface.
//!
//! The relay core never owns a socket. Everything it knows about a
//! connection arrives through the filter callbacks below, and everything it
//! sends leaves through a [`ConnectionCallback`] write handle supplied by the
//! host. The tokio host in [`crate::server`] and [`crate::connector`] is one
//! implementation of this surface; tests drive it with recording fakes.
//!
//! # Callback Flow
//!
//! ```text
//! client --> host reader --> DownstreamFilter::on_data
//!                                   |
//!                                   v
//!                             handoff queue --> forwarding task --> upstream handle.write
//!
//! server --> upstream reader --> UpstreamFilter::on_data --> downstream handle.write --> client
//! ```

use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Resolves once every write issued before [`ConnectionCallback::flushed`]
/// was called has been handed to the socket. Errors if the connection is gone.
pub type Flushed = oneshot::Receiver<()>;

/// Connection lifecycle notifications delivered to filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The peer closed the connection (or it failed underneath us).
    RemoteClose,
    /// The connection was closed from this side.
    LocalClose,
    /// The connection finished its handshake.
    Connected,
}

impl ConnectionEvent {
    /// Returns true for the two terminal events.
    pub fn is_close(self) -> bool {
        matches!(self, ConnectionEvent::RemoteClose | ConnectionEvent::LocalClose)
    }
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionEvent::RemoteClose => "remote_close",
            ConnectionEvent::LocalClose => "local_close",
            ConnectionEvent::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Result of a downstream filter callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterStatus {
    /// Keep processing the connection.
    Continue,
    /// The callback did not take the bytes or the connection. Returned from
    /// `on_new_connection`, it asks the host to close the connection.
    StopIteration,
}

/// How a connection should be closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseType {
    /// Drop any queued outbound bytes and close right away.
    NoFlush,
    /// Write everything already queued, then close.
    FlushWrite,
}

/// Why an upstream connection attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolFailureReason {
    /// The attempt failed on this host (socket creation, local resources).
    LocalConnectionFailure,
    /// The remote end refused or was unreachable.
    RemoteConnectionFailure,
    /// The attempt did not finish within the connect timeout.
    Timeout,
}

impl fmt::Display for PoolFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PoolFailureReason::LocalConnectionFailure => "local_connection_failure",
            PoolFailureReason::RemoteConnectionFailure => "remote_connection_failure",
            PoolFailureReason::Timeout => "timeout",
        };
        f.write_str(name)
    }
}

/// Addressing details of a connection, used for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamInfo {
    /// Our end of the connection.
    pub local_addr: Option<SocketAddr>,
    /// The peer's end of the connection.
    pub remote_addr: Option<SocketAddr>,
}

/// Per-connection write handle owned by the host.
///
/// Every method must return immediately; the host queues the work.
pub trait ConnectionCallback: Send + Sync {
    /// Queue `data` for the peer. With `end_of_stream` set, the write side is
    /// shut down once the bytes are flushed.
    fn write(&self, data: Bytes, end_of_stream: bool);

    /// Acknowledgement for all writes queued so far.
    fn flushed(&self) -> Flushed;

    /// Close the connection. Closing twice is a no-op.
    fn close(&self, close_type: CloseType);

    /// Pause (`true`) or resume (`false`) delivery of inbound bytes.
    fn read_disable(&self, disable: bool);

    /// Addresses of the connection.
    fn stream_info(&self) -> StreamInfo;
}

/// Callbacks for the client-facing half of a relay.
pub trait DownstreamFilter: Send + Sync {
    /// Called once, before any data, when the host accepted the connection.
    fn on_new_connection(&self) -> FilterStatus;

    /// Bytes read from the client. An empty chunk with `end_of_stream` set
    /// means the client half-closed.
    fn on_data(&self, data: Bytes, end_of_stream: bool) -> FilterStatus;

    /// Lifecycle notification for the client connection.
    fn on_event(&self, event: ConnectionEvent);

    /// Bytes that were flushed to the client.
    fn on_write(&self, data: &[u8], end_of_stream: bool) -> FilterStatus;
}

/// Callbacks for the server-facing half of a relay.
pub trait UpstreamFilter: Send + Sync {
    /// The upstream connection is established; `handle` writes to the server.
    fn on_pool_ready(&self, handle: Arc<dyn ConnectionCallback>);

    /// The upstream connection could not be established.
    fn on_pool_failure(&self, reason: PoolFailureReason, detail: &str);

    /// Bytes read from the server.
    fn on_data(&self, data: Bytes, end_of_stream: bool);

    /// Lifecycle notification for the upstream connection.
    fn on_event(&self, event: ConnectionEvent);
}
