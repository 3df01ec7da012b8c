//! Payload-agnostic TCP relay.
//!
//! `splice-relay` pairs every accepted client connection with one upstream
//! connection to a target resolved once at startup, and copies bytes both
//! ways without looking at them.
//!
//! # Architecture
//!
//! ```text
//! client
//!   |
//!   v
//! RelayServer (accept loop, TcpConnection per client)
//!   |
//!   +-- DownstreamSession::on_data --> handoff queue --+
//!   |                                                  |
//!   |                          forwarding task <-------+  (starts once connected)
//!   |                                |
//!   |                                v
//!   |                          upstream TcpConnection --> server
//!   |                                                        |
//!   +<-- client write <-- UpstreamSession::on_data <---------+
//! ```
//!
//! # Components
//!
//! - [`DownstreamSession`] / [`UpstreamSession`]: the session pair and its state machine
//! - [`queue`]: the handoff queue between client data and the forwarding task
//! - [`UpstreamConnector`] / [`TcpConnector`]: asynchronous upstream connects
//! - [`Resolver`] / [`DnsResolver`]: async target resolution at factory build time
//! - [`FilterRegistry`]: named filter constructors, passed explicitly
//! - [`RelayServer`]: tokio host driving the callback surface
//!
//! # Usage
//!
//! ```ignore
//! use splice_relay::{default_registry, DnsResolver, RelayServer, RelayServerConfig, TcpConnector};
//! use std::sync::Arc;
//!
//! let registry = default_registry(Arc::new(DnsResolver::new()), Arc::new(TcpConnector::default()));
//! let config: toml::Table = "server_addr = \"10.0.0.5\"\nserver_port = \"9000\"".parse()?;
//! let factory = registry.create("relay", &config).await?;
//!
//! let handle = RelayServer::new(RelayServerConfig::default(), factory).start().await?;
//! // ... later ...
//! handle.shutdown().await?;
//! ```

mod connection;
mod connector;
mod filter;
pub mod queue;
mod resolver;
mod server;
mod session;
mod transport;

pub use connection::{ConnectionReader, TcpConnection, READ_BUFFER_SIZE};
pub use connector::{TcpConnector, UpstreamConnector, DEFAULT_CONNECT_TIMEOUT};
pub use filter::{
    default_registry, ConfigFactory, FilterFactory, FilterRegistry, RelayConfigFactory,
    RelayFilterFactory, RELAY_FILTER_NAME,
};
pub use queue::{Chunk, DEFAULT_HIGH_WATERMARK};
pub use resolver::{resolve_first, DnsResolver, Resolver};
pub use server::{RelayHandle, RelayServer, RelayServerConfig};
pub use session::{DownstreamSession, UpstreamSession, UpstreamState};
pub use transport::{
    CloseType, ConnectionCallback, ConnectionEvent, DownstreamFilter, FilterStatus, Flushed,
    PoolFailureReason, StreamInfo, UpstreamFilter,
};

use std::net::SocketAddr;

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors that can occur while setting up or running a relay.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Failed to bind to address.
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Filter configuration is missing or malformed.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The upstream host could not be resolved.
    #[error("Failed to resolve {host}: {message}")]
    Resolution { host: String, message: String },

    /// No config factory is registered under this name.
    #[error("Unknown filter: {0}")]
    UnknownFilter(String),

    /// A config factory is already registered under this name.
    #[error("Filter already registered: {0}")]
    DuplicateFilter(String),
}
