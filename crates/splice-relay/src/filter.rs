//! Filter factories and the registry that names them.
//!
//! Building a relay takes two steps:
//!
//! 1. A [`ConfigFactory`] validates a config table and resolves the target
//!    once, producing a [`FilterFactory`]. Failures here are startup errors.
//!    Resolution is async so it never blocks a runtime worker.
//! 2. The host calls [`FilterFactory::create_filter`] for every accepted
//!    connection.
//!
//! Factories are found by name through a [`FilterRegistry`] that the caller
//! builds and passes around explicitly.

use crate::connector::UpstreamConnector;
use crate::queue::DEFAULT_HIGH_WATERMARK;
use crate::resolver::{resolve_first, Resolver};
use crate::session::DownstreamSession;
use crate::transport::{ConnectionCallback, DownstreamFilter};
use crate::{RelayError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// Name the relay filter is registered under.
pub const RELAY_FILTER_NAME: &str = "relay";

/// Creates a downstream filter for each accepted connection.
pub trait FilterFactory: Send + Sync {
    /// Build the filter for a new connection whose write handle is `callback`.
    fn create_filter(&self, callback: Arc<dyn ConnectionCallback>) -> Arc<dyn DownstreamFilter>;
}

/// Turns a filter config table into a [`FilterFactory`].
#[async_trait]
pub trait ConfigFactory: Send + Sync {
    /// Validate `config` and build the factory.
    ///
    /// # Errors
    /// Returns `RelayError::Config` for invalid settings and
    /// `RelayError::Resolution` when the target cannot be resolved.
    async fn create_factory(&self, config: &toml::Table) -> Result<Arc<dyn FilterFactory>>;
}

/// Named collection of config factories.
#[derive(Default)]
pub struct FilterRegistry {
    factories: BTreeMap<String, Arc<dyn ConfigFactory>>,
}

impl FilterRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under `name`.
    ///
    /// # Errors
    /// Returns `RelayError::DuplicateFilter` if the name is taken.
    pub fn register(&mut self, name: impl Into<String>, factory: Arc<dyn ConfigFactory>) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(RelayError::DuplicateFilter(name));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Look up a config factory by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn ConfigFactory>> {
        self.factories.get(name).cloned()
    }

    /// Build the filter factory registered as `name` from `config`.
    ///
    /// # Errors
    /// Returns `RelayError::UnknownFilter` for an unregistered name, or
    /// whatever the config factory reports.
    pub async fn create(&self, name: &str, config: &toml::Table) -> Result<Arc<dyn FilterFactory>> {
        let factory = self
            .get(name)
            .ok_or_else(|| RelayError::UnknownFilter(name.to_string()))?;
        factory.create_factory(config).await
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }
}

/// `server_port` may be written as a string or an integer.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PortValue {
    Text(String),
    Number(i64),
}

impl PortValue {
    fn to_port(&self) -> Result<u16> {
        let port = match self {
            PortValue::Text(s) => s.trim().parse::<u16>().ok(),
            PortValue::Number(n) => u16::try_from(*n).ok(),
        };
        match port {
            Some(p) if p != 0 => Ok(p),
            _ => Err(RelayError::Config(format!(
                "server_port must be a port number between 1 and 65535, got {self:?}"
            ))),
        }
    }
}

/// Keys accepted in the relay filter's config table.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RelayFilterSettings {
    server_addr: String,
    server_port: PortValue,
    #[serde(default = "default_high_watermark")]
    max_buffered_bytes: usize,
}

fn default_high_watermark() -> usize {
    DEFAULT_HIGH_WATERMARK
}

/// Config factory for the relay filter.
pub struct RelayConfigFactory {
    resolver: Arc<dyn Resolver>,
    connector: Arc<dyn UpstreamConnector>,
}

impl RelayConfigFactory {
    /// Create the factory with the collaborators every relay instance shares.
    pub fn new(resolver: Arc<dyn Resolver>, connector: Arc<dyn UpstreamConnector>) -> Self {
        Self {
            resolver,
            connector,
        }
    }
}

#[async_trait]
impl ConfigFactory for RelayConfigFactory {
    async fn create_factory(&self, config: &toml::Table) -> Result<Arc<dyn FilterFactory>> {
        let settings: RelayFilterSettings = toml::Value::Table(config.clone())
            .try_into()
            .map_err(|e| RelayError::Config(format!("invalid relay filter config: {e}")))?;

        let host = settings.server_addr.trim();
        if host.is_empty() {
            return Err(RelayError::Config("server_addr must not be empty".to_string()));
        }
        let port = settings.server_port.to_port()?;
        let upstream_addr = resolve_first(self.resolver.as_ref(), host, port).await?;

        info!(server_addr = host, upstream = %upstream_addr, "relay target resolved");
        Ok(Arc::new(RelayFilterFactory {
            upstream_addr,
            connector: Arc::clone(&self.connector),
            max_buffered_bytes: settings.max_buffered_bytes,
        }))
    }
}

/// Per-instance factory: one resolved target, one session pair per connection.
pub struct RelayFilterFactory {
    upstream_addr: SocketAddr,
    connector: Arc<dyn UpstreamConnector>,
    max_buffered_bytes: usize,
}

impl RelayFilterFactory {
    /// Create a factory for an already resolved target.
    pub fn new(
        upstream_addr: SocketAddr,
        connector: Arc<dyn UpstreamConnector>,
        max_buffered_bytes: usize,
    ) -> Self {
        Self {
            upstream_addr,
            connector,
            max_buffered_bytes,
        }
    }

    /// The resolved upstream target.
    pub fn upstream_addr(&self) -> SocketAddr {
        self.upstream_addr
    }

    /// High watermark given to each session's handoff queue.
    pub fn max_buffered_bytes(&self) -> usize {
        self.max_buffered_bytes
    }
}

impl FilterFactory for RelayFilterFactory {
    fn create_filter(&self, callback: Arc<dyn ConnectionCallback>) -> Arc<dyn DownstreamFilter> {
        DownstreamSession::new(
            self.upstream_addr,
            callback,
            Arc::clone(&self.connector),
            self.max_buffered_bytes,
        )
    }
}

/// Registry with the relay filter registered under [`RELAY_FILTER_NAME`].
pub fn default_registry(
    resolver: Arc<dyn Resolver>,
    connector: Arc<dyn UpstreamConnector>,
) -> FilterRegistry {
    let mut registry = FilterRegistry::new();
    registry.factories.insert(
        RELAY_FILTER_NAME.to_string(),
        Arc::new(RelayConfigFactory::new(resolver, connector)),
    );
    registry
}
