//! Hostname → dialable address.
//!
//! IPv4 only, so the same host resolves the same way on every machine. The
//! provider record decides which of the returned addresses is best and
//! whether a lookup is worth repeating.

use async_trait::async_trait;
use futures::future::join_all;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::errors::{WatchError, WatchResult};
use crate::provider::ProviderProfile;

#[async_trait]
pub trait AddressLookup: Send + Sync {
    async fn lookup_ipv4(&self, host: &str) -> WatchResult<Vec<Ipv4Addr>>;
}

/// The host's resolver configuration (resolv.conf and the hosts file)
/// through hickory.
pub struct DnsLookup {
    resolver: TokioAsyncResolver,
}

impl DnsLookup {
    /// Falls back to hickory's built-in upstreams when the system
    /// configuration cannot be read.
    pub fn new() -> Self {
        let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
            Ok(resolver) => resolver,
            Err(e) => {
                warn!(error = %e, "System DNS configuration unavailable; using default upstreams");
                TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
            }
        };
        Self { resolver }
    }
}

impl Default for DnsLookup {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AddressLookup for DnsLookup {
    async fn lookup_ipv4(&self, host: &str) -> WatchResult<Vec<Ipv4Addr>> {
        let response = self
            .resolver
            .ipv4_lookup(host)
            .await
            .map_err(|e| WatchError::Network(format!("DNS lookup for {host} failed: {e}")))?;
        Ok(response.iter().map(|a| a.0).collect())
    }
}

/// Where the transport should dial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    /// Original hostname; used for TLS SNI and handed to a proxy verbatim.
    pub host: String,
    pub port: u16,
    /// Resolved address, when we resolved one ourselves.
    pub addr: Option<SocketAddr>,
    pub proxy: Option<String>,
    pub is_preferred: bool,
}

impl ConnectTarget {
    /// No local resolution: the name goes to the proxy (or the OS) as-is.
    pub fn passthrough(host: &str, port: u16, proxy: Option<String>) -> Self {
        Self {
            host: host.to_string(),
            port,
            addr: None,
            proxy,
            is_preferred: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolveOptions {
    pub probe: bool,
    pub probe_timeout: Duration,
}

/// Resolve `host`, retrying while the provider finds the answer unsatisfactory,
/// optionally keep only reachable candidates, then pick one.
///
/// Returns [`WatchError::ProxyRequired`] when probing is on and nothing answers.
pub async fn resolve(
    lookup: &dyn AddressLookup,
    host: &str,
    port: u16,
    profile: &ProviderProfile,
    options: &ResolveOptions,
) -> WatchResult<ConnectTarget> {
    let candidates = match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => vec![ip],
        Ok(IpAddr::V6(_)) => {
            debug!(host, "IPv6 literal; dialing as given");
            return Ok(ConnectTarget::passthrough(host, port, None));
        }
        Err(_) => lookup_with_retry(lookup, host, profile).await?,
    };

    let candidates = if options.probe {
        let reachable = probe_reachable(&candidates, port, options.probe_timeout).await;
        if reachable.is_empty() {
            warn!(host, port, tried = candidates.len(), "No candidate address reachable");
            return Err(WatchError::ProxyRequired(host.to_string()));
        }
        reachable
    } else {
        candidates
    };

    let choice = profile
        .select_address(&candidates)
        .ok_or_else(|| WatchError::Network(format!("no IPv4 address for {host}")))?;

    info!(
        host,
        addr = %choice.addr,
        preferred = choice.is_preferred,
        candidates = candidates.len(),
        "Resolved mail server"
    );

    Ok(ConnectTarget {
        host: host.to_string(),
        port,
        addr: Some(SocketAddr::new(IpAddr::V4(choice.addr), port)),
        proxy: None,
        is_preferred: choice.is_preferred,
    })
}

async fn lookup_with_retry(
    lookup: &dyn AddressLookup,
    host: &str,
    profile: &ProviderProfile,
) -> WatchResult<Vec<Ipv4Addr>> {
    let mut best: Option<Vec<Ipv4Addr>> = None;
    let mut last_err = None;

    for attempt in 0..=profile.address.dns_retries {
        if attempt > 0 {
            tokio::time::sleep(profile.address.dns_retry_delay).await;
        }
        match lookup.lookup_ipv4(host).await {
            Ok(addrs) if profile.is_satisfactory(&addrs) => return Ok(addrs),
            Ok(addrs) => {
                debug!(host, attempt, found = addrs.len(), "DNS answer not satisfactory");
                if !addrs.is_empty() {
                    best = Some(addrs);
                }
            }
            Err(e) => {
                debug!(host, attempt, error = %e, "DNS lookup failed");
                last_err = Some(e);
            }
        }
    }

    match (best, last_err) {
        (Some(addrs), _) => Ok(addrs),
        (None, Some(e)) => Err(e),
        (None, None) => Err(WatchError::Network(format!("no IPv4 address for {host}"))),
    }
}

/// Candidates that accept a TCP connection within `limit`, in input order.
pub async fn probe_reachable(candidates: &[Ipv4Addr], port: u16, limit: Duration) -> Vec<Ipv4Addr> {
    let probes = candidates.iter().map(|ip| async move {
        let addr = SocketAddr::new(IpAddr::V4(*ip), port);
        match timeout(limit, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => Some(*ip),
            Ok(Err(e)) => {
                debug!(%addr, error = %e, "Probe failed");
                None
            }
            Err(_) => {
                debug!(%addr, "Probe timed out");
                None
            }
        }
    });
    join_all(probes).await.into_iter().flatten().collect()
}
