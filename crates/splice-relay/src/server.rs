//! Relay server: accepts client connections and drives them through a
//! [`FilterFactory`].
//!
//! # Lifecycle
//!
//! ```text
//! RelayServer::new(config, factory)
//!       |
//!       v
//! RelayServer::start() --> RelayHandle
//!       |                       |
//!       v                       |
//! accept loop                   |
//!   per connection:             |
//!     create_filter             |
//!     on_new_connection         |
//!     on_data ... on_event      v
//!       |               RelayHandle::shutdown()
//!       v                       |
//! Graceful shutdown <-----------+
//! ```

use crate::connection::TcpConnection;
use crate::filter::FilterFactory;
use crate::transport::{CloseType, ConnectionCallback, DownstreamFilter, FilterStatus};
use crate::{RelayError, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Configuration for the relay listener.
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    /// Address to accept client connections on.
    /// Default: `127.0.0.1:10000`
    pub bind_addr: SocketAddr,

    /// Maximum concurrent client connections.
    /// Default: 1000
    pub max_connections: usize,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 10000)),
            max_connections: 1000,
        }
    }
}

/// Handle for controlling a running relay server.
pub struct RelayHandle {
    /// Shutdown signal sender.
    shutdown_tx: Option<oneshot::Sender<()>>,

    /// Join handle for the accept loop.
    join_handle: Option<tokio::task::JoinHandle<Result<()>>>,

    /// Actual bound address.
    local_addr: SocketAddr,

    /// Live client connections.
    connection_count: Arc<AtomicUsize>,
}

impl RelayHandle {
    /// Check if the accept loop is still running.
    pub fn is_running(&self) -> bool {
        self.join_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Address the server is accepting on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of client connections currently being relayed.
    pub fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::Relaxed)
    }

    /// Stop accepting connections.
    ///
    /// Connections already accepted keep relaying until they close.
    ///
    /// # Errors
    /// Currently infallible; always returns `Ok`. If the accept loop does not
    /// respond within 2 seconds it is aborted.
    pub async fn shutdown(mut self) -> Result<()> {
        let signal_sent = match self.shutdown_tx.take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        };

        if let Some(mut handle) = self.join_handle.take() {
            if signal_sent {
                if tokio::time::timeout(std::time::Duration::from_secs(2), &mut handle)
                    .await
                    .is_err()
                {
                    handle.abort();
                }
            } else {
                handle.abort();
            }
        }

        Ok(())
    }
}

/// TCP relay server.
pub struct RelayServer {
    config: RelayServerConfig,
    factory: Arc<dyn FilterFactory>,
    connection_count: Arc<AtomicUsize>,
}

impl RelayServer {
    /// Create a relay server that builds filters with `factory`.
    pub fn new(config: RelayServerConfig, factory: Arc<dyn FilterFactory>) -> Self {
        Self {
            config,
            factory,
            connection_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Current connection count.
    pub fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::Relaxed)
    }

    /// Bind the listener and spawn the accept loop.
    ///
    /// # Errors
    /// * `RelayError::Bind` - If binding `config.bind_addr` fails.
    pub async fn start(self) -> Result<RelayHandle> {
        let listener = bind(self.config.bind_addr).await?;
        let local_addr = listener.local_addr().map_err(|e| RelayError::Bind {
            addr: self.config.bind_addr,
            source: e,
        })?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let connection_count = Arc::clone(&self.connection_count);

        let join_handle = tokio::spawn(async move {
            tokio::select! {
                result = self.run_on(listener) => result,
                _ = shutdown_rx => Ok(()),
            }
        });

        info!(addr = %local_addr, "relay listening");
        Ok(RelayHandle {
            shutdown_tx: Some(shutdown_tx),
            join_handle: Some(join_handle),
            local_addr,
            connection_count,
        })
    }

    /// Bind and run the accept loop until an error occurs.
    ///
    /// # Errors
    /// * `RelayError::Bind` - If binding `config.bind_addr` fails.
    pub async fn run(&self) -> Result<()> {
        let listener = bind(self.config.bind_addr).await?;
        self.run_on(listener).await
    }

    /// Run the accept loop on a pre-bound listener.
    ///
    /// # Errors
    /// Currently never returns on its own; accept errors are logged and skipped.
    pub async fn run_on(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (client, client_addr) = match listener.accept().await {
                Ok(result) => result,
                Err(e) => {
                    warn!(error = %e, "TCP accept error");
                    continue;
                }
            };

            let current = self.connection_count.load(Ordering::Relaxed);
            if current >= self.config.max_connections {
                warn!(client = %client_addr, "Connection limit reached, rejecting");
                drop(client);
                continue;
            }
            self.connection_count.fetch_add(1, Ordering::Relaxed);

            let factory = Arc::clone(&self.factory);
            let connection_count = Arc::clone(&self.connection_count);
            tokio::spawn(async move {
                handle_connection(factory, client, client_addr).await;
                connection_count.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }
}

async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| RelayError::Bind { addr, source: e })
}

/// Drive one client connection through a fresh filter until it closes.
async fn handle_connection(factory: Arc<dyn FilterFactory>, client: TcpStream, client_addr: SocketAddr) {
    // Best effort: Nagle only delays small relayed writes.
    let _ = client.set_nodelay(true);

    let (connection, reader) = TcpConnection::spawn(client);
    let callback: Arc<dyn ConnectionCallback> = Arc::clone(&connection) as Arc<dyn ConnectionCallback>;
    let filter = factory.create_filter(callback);
    connection.observe_writes(Arc::downgrade(&filter));

    if filter.on_new_connection() == FilterStatus::StopIteration {
        debug!(client = %client_addr, "filter refused connection");
        connection.close(CloseType::NoFlush);
        return;
    }

    let data_filter: Arc<dyn DownstreamFilter> = Arc::clone(&filter);
    reader
        .run(
            move |data, end_of_stream| {
                data_filter.on_data(data, end_of_stream);
            },
            |event| filter.on_event(event),
        )
        .await;

    debug!(client = %client_addr, "client connection finished");
}
