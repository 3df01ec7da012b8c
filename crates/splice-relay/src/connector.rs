//! Upstream connector.
//!
//! The relay core asks for a connection and moves on; the result arrives
//! later on the [`UpstreamFilter`] passed in, exactly once, as either
//! `on_pool_ready` or `on_pool_failure`.

use crate::connection::TcpConnection;
use crate::transport::{ConnectionEvent, PoolFailureReason, UpstreamFilter};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Default upstream connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Establishes upstream connections on behalf of the relay core.
pub trait UpstreamConnector: Send + Sync {
    /// Start connecting to `addr` and report the outcome to `receiver`.
    ///
    /// Must return without waiting for the connection.
    fn connect(&self, addr: SocketAddr, receiver: Arc<dyn UpstreamFilter>);
}

/// Connector that opens plain TCP connections on the current tokio runtime.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    /// Create a connector with the given connect timeout.
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// The configured connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

impl UpstreamConnector for TcpConnector {
    fn connect(&self, addr: SocketAddr, receiver: Arc<dyn UpstreamFilter>) {
        let timeout = self.connect_timeout;
        tokio::spawn(async move {
            let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    debug!(upstream = %addr, error = %e, "upstream connect failed");
                    receiver.on_pool_failure(failure_reason(e.kind()), &e.to_string());
                    return;
                }
                Err(_) => {
                    debug!(upstream = %addr, ?timeout, "upstream connect timed out");
                    receiver.on_pool_failure(
                        PoolFailureReason::Timeout,
                        &format!("no connection to {addr} within {timeout:?}"),
                    );
                    return;
                }
            };

            // Best effort: Nagle only delays small relayed writes.
            let _ = stream.set_nodelay(true);

            let (connection, reader) = TcpConnection::spawn(stream);
            receiver.on_pool_ready(connection);
            receiver.on_event(ConnectionEvent::Connected);

            let data_sink = Arc::clone(&receiver);
            reader
                .run(
                    move |data, end_of_stream| data_sink.on_data(data, end_of_stream),
                    move |event| receiver.on_event(event),
                )
                .await;
        });
    }
}

/// Map a connect error onto the failure taxonomy.
fn failure_reason(kind: ErrorKind) -> PoolFailureReason {
    match kind {
        ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected => PoolFailureReason::RemoteConnectionFailure,
        ErrorKind::TimedOut => PoolFailureReason::Timeout,
        _ => PoolFailureReason::LocalConnectionFailure,
    }
}
