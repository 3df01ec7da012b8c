//! Upstream address resolution.
//!
//! Resolution runs once, when a filter factory is built. The relay only ever
//! uses the first address returned.

use crate::{RelayError, Result};
use async_trait::async_trait;
use hickory_resolver::name_server::TokioConnectionProvider;
use std::net::{IpAddr, SocketAddr};
use tokio::sync::OnceCell;

/// Turns a host name into candidate IP addresses.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolve `host` to one or more addresses.
    ///
    /// # Errors
    /// Returns `RelayError::Resolution` if the host cannot be resolved.
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>>;
}

/// DNS resolver built on hickory-resolver with the system configuration.
///
/// The underlying resolver is created on first use and reused afterwards.
/// IP literals (including bracketed IPv6) never reach it.
#[derive(Default)]
pub struct DnsResolver {
    inner: OnceCell<hickory_resolver::Resolver<TokioConnectionProvider>>,
}

impl DnsResolver {
    /// Create a resolver; nothing is read from the system until first use.
    pub fn new() -> Self {
        Self::default()
    }

    async fn inner(&self, host: &str) -> Result<&hickory_resolver::Resolver<TokioConnectionProvider>> {
        self.inner
            .get_or_try_init(|| async {
                hickory_resolver::Resolver::builder_tokio()
                    .map(|builder| builder.build())
                    .map_err(|e| RelayError::Resolution {
                        host: host.to_string(),
                        message: format!("failed to create DNS resolver: {e}"),
                    })
            })
            .await
    }
}

/// Parse `host` as an IP literal, accepting `[v6]` brackets.
fn ip_literal(host: &str) -> Option<IpAddr> {
    let literal = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    literal.parse().ok()
}

#[async_trait]
impl Resolver for DnsResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        let host = host.trim();
        if let Some(ip) = ip_literal(host) {
            return Ok(vec![ip]);
        }

        let lookup = self
            .inner(host)
            .await?
            .lookup_ip(host)
            .await
            .map_err(|e| RelayError::Resolution {
                host: host.to_string(),
                message: e.to_string(),
            })?;

        let mut ips: Vec<IpAddr> = Vec::new();
        for ip in lookup.iter() {
            if !ips.contains(&ip) {
                ips.push(ip);
            }
        }
        Ok(ips)
    }
}

/// Resolve `host` and join the first address with `port`.
///
/// # Errors
/// Returns `RelayError::Resolution` if resolution fails or yields nothing.
pub async fn resolve_first(resolver: &dyn Resolver, host: &str, port: u16) -> Result<SocketAddr> {
    let addrs = resolver.resolve(host).await?;
    let first = addrs.first().ok_or_else(|| RelayError::Resolution {
        host: host.to_string(),
        message: "no addresses returned".to_string(),
    })?;
    Ok(SocketAddr::new(*first, port))
}
