//! The DNS resolution hook the dialer consumes. `spec.md` §1 treats "the
//! DNS resolver implementation" as an external collaborator consumed only
//! as a `LookupHost`-like hook; this module is that hook plus the one
//! concrete implementation (`HickoryResolver`) the app crate wires up when
//! `--dns-server` is configured. With no resolver configured, the dialer
//! falls back to the OS resolver via `tokio::net::lookup_host`.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use hickory_resolver::Resolver as Inner;
use hickory_resolver::config::{NameServerConfig, ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;

/// `SocketAddr` lookup, independent of any particular DNS client library.
/// Boxed-future rather than `async fn` so the trait stays object-safe.
pub trait HostResolver: Send + Sync {
	fn resolve<'a>(&'a self, host: &'a str, port: u16) -> Pin<Box<dyn Future<Output = std::io::Result<Vec<SocketAddr>>> + Send + 'a>>;
}

/// Delegates to the OS resolver (`getaddrinfo` via `tokio::net::lookup_host`).
/// This is the default when no `--dns-server` override is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

impl HostResolver for SystemResolver {
	fn resolve<'a>(&'a self, host: &'a str, port: u16) -> Pin<Box<dyn Future<Output = std::io::Result<Vec<SocketAddr>>> + Send + 'a>> {
		Box::pin(async move {
			if let Ok(ip) = host.parse::<IpAddr>() {
				return Ok(vec![SocketAddr::new(ip, port)]);
			}
			let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port)).await?.collect();
			if addrs.is_empty() {
				return Err(std::io::Error::new(std::io::ErrorKind::NotFound, format!("no addresses for {host}")));
			}
			Ok(addrs)
		})
	}
}

#[derive(Debug, Clone)]
pub struct HickoryConfig {
	pub servers: Vec<SocketAddr>,
	pub round_robin: bool,
	pub timeout: Duration,
}

/// Resolver backed by `hickory-resolver`, used when the operator overrides
/// the nameservers with `--dns-server` (spec.md §6 DNS group). `round_robin`
/// controls whether repeated lookups rotate which nameserver answers first,
/// mirroring hickory's own `ResolverOpts::rotate`.
pub struct HickoryResolver {
	inner: Inner<TokioConnectionProvider>,
}

impl HickoryResolver {
	pub fn new(cfg: HickoryConfig) -> Self {
		let mut resolver_cfg = ResolverConfig::new();
		for server in &cfg.servers {
			resolver_cfg.add_name_server(NameServerConfig::new(*server, hickory_resolver::config::Protocol::Udp));
		}
		let mut opts = ResolverOpts::default();
		opts.timeout = cfg.timeout;
		opts.rotate = cfg.round_robin;
		let inner = Inner::builder_with_config(resolver_cfg, TokioConnectionProvider::default())
			.with_options(opts)
			.build();
		HickoryResolver { inner }
	}
}

impl HostResolver for HickoryResolver {
	fn resolve<'a>(&'a self, host: &'a str, port: u16) -> Pin<Box<dyn Future<Output = std::io::Result<Vec<SocketAddr>>> + Send + 'a>> {
		Box::pin(async move {
			if let Ok(ip) = host.parse::<IpAddr>() {
				return Ok(vec![SocketAddr::new(ip, port)]);
			}
			let response = self
				.inner
				.lookup_ip(host)
				.await
				.map_err(|e| std::io::Error::other(e.to_string()))?;
			let addrs: Vec<SocketAddr> = response.iter().map(|ip| SocketAddr::new(ip, port)).collect();
			if addrs.is_empty() {
				return Err(std::io::Error::new(std::io::ErrorKind::NotFound, format!("no addresses for {host}")));
			}
			Ok(addrs)
		})
	}
}

pub fn system() -> Arc<dyn HostResolver> {
	Arc::new(SystemResolver)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn system_resolver_short_circuits_ip_literals() {
		let r = SystemResolver;
		let addrs = r.resolve("203.0.113.5", 443).await.unwrap();
		assert_eq!(addrs, vec![SocketAddr::new("203.0.113.5".parse().unwrap(), 443)]);
	}
}
