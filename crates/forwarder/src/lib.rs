//! Forwarder: a forward HTTP/HTTPS proxy library (spec.md §1-§2).
//!
//! This crate implements the core request/response pipeline and routing
//! engine. Everything that touches the wire is a component of its own
//! (addressing, credentials, hostmatcher, dialer, listener, pac, mitm,
//! modifiers, router, connect, dispatcher, error); this module owns the
//! glue: the validated [`Config`] the rest of the crate is built from, and
//! [`ProxyRuntime`], which binds listeners and drives accepted connections
//! through the pipeline until shutdown.

pub mod addressing;
pub mod client;
pub mod connect;
pub mod credentials;
pub mod dialer;
pub mod dispatcher;
pub mod error;
pub mod hostmatcher;
pub mod http;
pub mod listener;
pub mod mitm;
pub mod modifiers;
pub mod pac;
pub mod resolver;
pub mod router;
pub mod telemetry;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use forwarder_core::Strng;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::addressing::{AddrError, HostPortPair, HostPortUser, ProxyURL, Userinfo};
use crate::client::{OriginClient, build_tls_client_config};
use crate::connect::{ConnectHandler, ConnectOutcome};
use crate::credentials::{CredentialsError, CredentialsMatcher};
use crate::dialer::{Dialer, DialerConfig};
use crate::dispatcher::Dispatcher;
use crate::hostmatcher::{Matcher, MatcherError};
use crate::listener::{InboundStream, Listener, ListenerConfig};
use crate::mitm::{CertificateAuthority, MitmEngine, MitmError};
use crate::modifiers::{
	DenyDomainsModifier, HeaderEdit, HeaderEditError, HeaderRequestModifier, HeaderResponseModifier, LocalhostDenyModifier, LocalhostPolicy,
	ModifierStack, ModifyRequest, ProxyAuthModifier, SiteCredentialsModifier,
};
use crate::pac::PacResolver;
use crate::resolver::{HickoryConfig, HickoryResolver, system};
use crate::router::{Router, RouterConfig};
use crate::telemetry::log::RequestLog;
use crate::telemetry::metrics::Metrics;

pub const PROXY_NAME: &str = "forwarder";

/// A bind address: either "localhost, dual-stack if enabled" or a concrete
/// socket address. Kept distinct from a bare `SocketAddr` so a `localhost`
/// bind doesn't silently skip the IPv6 loopback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Address {
	Localhost(bool, u16),
	SocketAddr(SocketAddr),
}

impl Address {
	pub fn parse(s: &str, ipv6_enabled: bool) -> Result<Self, ConfigError> {
		if let Some(port_str) = s.strip_prefix("localhost:") {
			let port: u16 = port_str.parse().map_err(|_| ConfigError::InvalidAddress(s.to_string()))?;
			return Ok(Address::Localhost(ipv6_enabled, port));
		}
		s.parse::<SocketAddr>().map(Address::SocketAddr).map_err(|_| ConfigError::InvalidAddress(s.to_string()))
	}
}

impl std::fmt::Display for Address {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Address::Localhost(_, port) => write!(f, "localhost:{port}"),
			Address::SocketAddr(s) => write!(f, "{s}"),
		}
	}
}

impl IntoIterator for Address {
	type Item = SocketAddr;
	type IntoIter = std::vec::IntoIter<SocketAddr>;

	fn into_iter(self) -> Self::IntoIter {
		match self {
			Address::Localhost(ipv6, port) => {
				let mut addrs = vec![SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), port)];
				if ipv6 {
					addrs.push(SocketAddr::new(std::net::IpAddr::V6(std::net::Ipv6Addr::LOCALHOST), port));
				}
				addrs.into_iter()
			},
			Address::SocketAddr(s) => vec![s].into_iter(),
		}
	}
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
	#[error("invalid bind address {0:?}")]
	InvalidAddress(String),
	#[error(transparent)]
	Addr(#[from] AddrError),
	#[error(transparent)]
	Credentials(#[from] CredentialsError),
	#[error(transparent)]
	Matcher(#[from] MatcherError),
	#[error(transparent)]
	HeaderEdit(#[from] HeaderEditError),
	#[error("both a static upstream and a PAC resolver were configured; these are mutually exclusive")]
	PacAndUpstreamConflict,
	#[error("invalid duration {0:?}")]
	InvalidDuration(String),
	#[error("invalid protocol {0:?}, expected \"http\" or \"https\"")]
	InvalidProtocol(String),
	#[error("invalid --proxy-localhost policy {0:?}, expected allow, deny, or direct")]
	InvalidLocalhostPolicy(String),
	#[error("--protocol https requires both --tls-cert-file and --tls-key-file")]
	MissingServerTls,
	#[error("invalid --basic-auth value {0:?}, expected user[:pass]")]
	InvalidBasicAuth(String),
	#[error("failed to load MITM CA material: {0}")]
	MitmCa(#[from] MitmError),
}

fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
	go_parse_duration::parse_duration(s)
		.map(|nanos: i64| Duration::from_nanos(nanos.max(0) as u64))
		.map_err(|_| ConfigError::InvalidDuration(s.to_string()))
}

/// Deserializable input config, mirroring the CLI surface. Every field is
/// optional so the app crate can overlay flags/env/file in any combination;
/// [`RawConfig::try_into_config`] applies defaults and performs all
/// cross-field validation. This type is never constructed by the core
/// itself — it exists so the app crate has one place to assemble
/// CLI/env/file input before handing it to the core.
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawConfig {
	// server
	pub address: Option<String>,
	pub protocol: Option<String>,
	pub tls_cert_pem: Option<String>,
	pub tls_key_pem: Option<String>,
	pub read_header_timeout: Option<String>,
	pub read_limit: Option<u64>,
	pub write_limit: Option<u64>,
	pub basic_auth: Option<String>,
	pub proxy_protocol: Option<bool>,

	// proxy
	pub proxy: Option<String>,
	pub credentials: Option<Vec<String>>,
	pub deny_domains: Option<Vec<String>>,
	pub direct_domains: Option<Vec<String>>,
	pub proxy_localhost: Option<String>,
	pub header: Option<Vec<String>>,
	pub response_header: Option<Vec<String>>,
	pub proxy_header: Option<Vec<String>>,
	pub loopback_aliases: Option<Vec<String>>,

	// mitm
	pub mitm: Option<bool>,
	pub mitm_cacert_pem: Option<String>,
	pub mitm_cakey_pem: Option<String>,
	pub mitm_domains: Option<Vec<String>>,
	pub mitm_org: Option<String>,
	pub mitm_validity: Option<String>,
	pub mitm_cache_capacity: Option<usize>,

	// dns
	pub dns_server: Option<Vec<String>>,
	pub dns_round_robin: Option<bool>,
	pub dns_timeout: Option<String>,

	// client
	pub http_dial_timeout: Option<String>,
	pub http_keepalive: Option<String>,
	pub http_tls_handshake_timeout: Option<String>,
	pub insecure: Option<bool>,
	pub cacert_pem: Option<String>,

	// connect
	pub connect_timeout: Option<String>,
	pub idle_timeout: Option<String>,

	/// `[srchost]:[srcport]=[dsthost]:[dstport]`, any field may be blank.
	pub dial_redirects: Option<Vec<String>>,
}

/// The routing strategy a [`Config`] resolves to: nothing configured,
/// a fixed upstream, or a PAC resolver. The two non-`None` variants are
/// mutually exclusive.
pub enum RoutingMode {
	None,
	StaticUpstream(ProxyURL),
	Pac(Arc<dyn PacResolver>),
}

/// The validated configuration [`ProxyRuntime`] is built from. Unlike
/// [`RawConfig`] this never round-trips back through deserialization —
/// constructing one is the only way invalid combinations get caught.
#[derive(Clone)]
pub struct Config {
	pub addresses: Vec<Address>,
	pub listener: ListenerConfig,
	pub read_header_timeout: Duration,

	pub basic_auth: Option<(Strng, Strng)>,

	pub credentials: Vec<HostPortUser>,
	pub deny_domains: Option<Matcher>,
	pub direct_domains: Option<Matcher>,
	pub proxy_localhost: LocalhostPolicy,
	pub loopback_aliases: Arc<[String]>,
	pub header_edits: Vec<HeaderEdit>,
	pub response_header_edits: Vec<HeaderEdit>,

	pub routing: Arc<RoutingMode>,

	pub mitm: Option<MitmSettings>,

	pub dns: Option<HickoryConfig>,

	pub insecure: bool,
	pub cacert_pem: Option<String>,
	pub dial_timeout: Duration,
	pub dial_keepalive: Option<Duration>,
	pub tls_handshake_timeout: Duration,
	pub connect_timeout: Duration,
	pub idle_timeout: Duration,
	pub dial_redirects: Vec<HostPortPair>,
}

#[derive(Clone)]
pub struct MitmSettings {
	/// `None` when `--mitm` was set without `--mitm-cacert-file`/
	/// `--mitm-cakey-file`: the app crate self-signs a throwaway CA and
	/// fills this in before constructing a [`ProxyRuntime`] (spec.md §1,
	/// §6: CA generation is an app-crate concern, not the core's).
	pub ca: Option<Arc<CertificateAuthority>>,
	pub org: String,
	pub validity: Duration,
	pub cache_capacity: usize,
	pub domains: Option<Matcher>,
}

impl RawConfig {
	pub fn try_into_config(self) -> Result<Config, ConfigError> {
		let address = self.address.as_deref().unwrap_or("127.0.0.1:8080");
		let addresses = vec![Address::parse(address, true)?];

		let protocol = self.protocol.as_deref().unwrap_or("http");
		let tls = match protocol {
			"http" => None,
			"https" => {
				let (cert, key) = match (&self.tls_cert_pem, &self.tls_key_pem) {
					(Some(c), Some(k)) => (c, k),
					_ => return Err(ConfigError::MissingServerTls),
				};
				Some(load_server_tls(cert, key)?)
			},
			other => return Err(ConfigError::InvalidProtocol(other.to_string())),
		};

		let listener = ListenerConfig {
			proxy_protocol: self.proxy_protocol.unwrap_or(false),
			proxy_protocol_timeout: Duration::from_secs(5),
			read_limit_bytes_per_sec: self.read_limit,
			write_limit_bytes_per_sec: self.write_limit,
			tls,
		};

		let read_header_timeout = match &self.read_header_timeout {
			Some(s) => parse_duration(s)?,
			None => Duration::from_secs(10),
		};

		let basic_auth = match &self.basic_auth {
			Some(s) => {
				let userinfo = Userinfo::parse(s).map_err(|_| ConfigError::InvalidBasicAuth(s.clone()))?;
				Some((userinfo.username.clone(), userinfo.password.unwrap_or_default()))
			},
			None => None,
		};

		let credentials = self
			.credentials
			.unwrap_or_default()
			.iter()
			.map(|s| HostPortUser::parse(s))
			.collect::<Result<Vec<_>, _>>()?;
		// Fails fast on a duplicate tier here even though the runtime rebuilds
		// the matcher itself, surfacing the error at construction time rather
		// than on first use.
		CredentialsMatcher::build(credentials.clone())?;

		let deny_domains = build_matcher(&self.deny_domains)?;
		let direct_domains = build_matcher(&self.direct_domains)?;

		let proxy_localhost = match self.proxy_localhost.as_deref() {
			None | Some("deny") => LocalhostPolicy::Deny,
			Some("allow") => LocalhostPolicy::Allow,
			Some("direct") => LocalhostPolicy::Direct,
			Some(other) => return Err(ConfigError::InvalidLocalhostPolicy(other.to_string())),
		};

		let header_edits = parse_header_edits(self.header.iter().flatten().chain(self.proxy_header.iter().flatten()))?;
		let response_header_edits = parse_header_edits(self.response_header.iter().flatten())?;

		let static_upstream = self.proxy.as_deref().map(ProxyURL::parse).transpose()?;
		let routing = match static_upstream {
			Some(url) => RoutingMode::StaticUpstream(url),
			None => RoutingMode::None,
		};

		let mitm = if self.mitm.unwrap_or(false) {
			let ca = match (&self.mitm_cacert_pem, &self.mitm_cakey_pem) {
				(Some(cert), Some(key)) => Some(Arc::new(CertificateAuthority::from_pem(cert, key)?)),
				(None, None) => None,
				_ => return Err(ConfigError::MitmCa(MitmError::CaLoad("--mitm-cacert-file and --mitm-cakey-file must be given together".to_string()))),
			};
			let validity = match &self.mitm_validity {
				Some(s) => parse_duration(s)?,
				None => Duration::from_secs(24 * 3600),
			};
			let domains = build_matcher(&self.mitm_domains)?;
			Some(MitmSettings {
				ca,
				org: self.mitm_org.unwrap_or_else(|| "Forwarder".to_string()),
				validity,
				cache_capacity: self.mitm_cache_capacity.unwrap_or(4096),
				domains,
			})
		} else {
			None
		};

		let dns = if self.dns_server.as_ref().is_some_and(|v| !v.is_empty()) {
			let servers = self
				.dns_server
				.unwrap_or_default()
				.iter()
				.map(|s| crate::addressing::parse_dns_address(s).map(|(ip, port)| SocketAddr::new(ip, port)))
				.collect::<Result<Vec<_>, _>>()?;
			let timeout = match &self.dns_timeout {
				Some(s) => parse_duration(s)?,
				None => Duration::from_secs(5),
			};
			Some(HickoryConfig { servers, round_robin: self.dns_round_robin.unwrap_or(false), timeout })
		} else {
			None
		};

		let dial_timeout = match &self.http_dial_timeout {
			Some(s) => parse_duration(s)?,
			None => crate::dialer::DEFAULT_DIAL_TIMEOUT,
		};
		let dial_keepalive = self.http_keepalive.as_deref().map(parse_duration).transpose()?;
		let tls_handshake_timeout = match &self.http_tls_handshake_timeout {
			Some(s) => parse_duration(s)?,
			None => Duration::from_secs(10),
		};
		let connect_timeout = match &self.connect_timeout {
			Some(s) => parse_duration(s)?,
			None => crate::connect::DEFAULT_CONNECT_TIMEOUT,
		};
		let idle_timeout = match &self.idle_timeout {
			Some(s) => parse_duration(s)?,
			None => crate::connect::DEFAULT_IDLE_TIMEOUT,
		};

		let dial_redirects = self
			.dial_redirects
			.unwrap_or_default()
			.iter()
			.map(|s| parse_redirect(s))
			.collect::<Result<Vec<_>, _>>()?;

		Ok(Config {
			addresses,
			listener,
			read_header_timeout,
			basic_auth,
			credentials,
			deny_domains,
			direct_domains,
			proxy_localhost,
			loopback_aliases: Arc::from(self.loopback_aliases.unwrap_or_default()),
			header_edits,
			response_header_edits,
			routing: Arc::new(routing),
			mitm,
			dns,
			insecure: self.insecure.unwrap_or(false),
			cacert_pem: self.cacert_pem,
			dial_timeout,
			dial_keepalive,
			tls_handshake_timeout,
			connect_timeout,
			idle_timeout,
			dial_redirects,
		})
	}
}

impl Config {
	/// Installs a PAC resolver, failing if a static upstream is already
	/// configured — the two never coexist. The app crate calls this after
	/// loading and parsing a PAC script, since evaluating PAC script source
	/// is outside this crate's scope.
	pub fn with_pac(mut self, pac: Arc<dyn PacResolver>) -> Result<Self, ConfigError> {
		if matches!(self.routing.as_ref(), RoutingMode::StaticUpstream(_)) {
			return Err(ConfigError::PacAndUpstreamConflict);
		}
		self.routing = Arc::new(RoutingMode::Pac(pac));
		Ok(self)
	}
}

fn build_matcher(items: &Option<Vec<String>>) -> Result<Option<Matcher>, ConfigError> {
	match items {
		None => Ok(None),
		Some(v) if v.is_empty() => Ok(None),
		Some(v) => Ok(Some(Matcher::build(v.iter().map(String::as_str))?)),
	}
}

fn parse_header_edits<'a>(items: impl Iterator<Item = &'a String>) -> Result<Vec<HeaderEdit>, ConfigError> {
	items.map(|s| HeaderEdit::parse(s).map_err(ConfigError::from)).collect()
}

/// Parses one `--dial-redirect` entry of the form
/// `[srchost]:[srcport]=[dsthost]:[dstport]`, where any of the four fields
/// may be blank.
fn parse_redirect(s: &str) -> Result<HostPortPair, ConfigError> {
	let (src, dst) = s.split_once('=').ok_or_else(|| ConfigError::InvalidAddress(s.to_string()))?;
	let (src_host, src_port) = split_optional_hostport(src)?;
	let (dst_host, dst_port) = split_optional_hostport(dst)?;
	Ok(HostPortPair { src_host, src_port, dst_host, dst_port })
}

fn split_optional_hostport(s: &str) -> Result<(Option<Strng>, Option<u16>), ConfigError> {
	if s.is_empty() {
		return Ok((None, None));
	}
	let (host, port) = s.rsplit_once(':').ok_or_else(|| ConfigError::InvalidAddress(s.to_string()))?;
	let host = if host.is_empty() { None } else { Some(Strng::from(host)) };
	let port = if port.is_empty() {
		None
	} else {
		Some(port.parse::<u16>().map_err(|_| ConfigError::InvalidAddress(s.to_string()))?)
	};
	Ok((host, port))
}

fn load_server_tls(cert_pem: &str, key_pem: &str) -> Result<Arc<rustls::ServerConfig>, ConfigError> {
	let certs = rustls_pemfile::certs(&mut cert_pem.as_bytes())
		.collect::<Result<Vec<_>, _>>()
		.map_err(|_| ConfigError::InvalidAddress("tls-cert-file".to_string()))?;
	let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
		.map_err(|_| ConfigError::InvalidAddress("tls-key-file".to_string()))?
		.ok_or_else(|| ConfigError::InvalidAddress("tls-key-file".to_string()))?;
	let cfg = rustls::ServerConfig::builder()
		.with_no_client_auth()
		.with_single_cert(certs, key)
		.map_err(|_| ConfigError::InvalidAddress("tls-cert-file/tls-key-file".to_string()))?;
	Ok(Arc::new(cfg))
}

/// Glues every component together: binds the configured listener addresses,
/// accepts connections, and drives each through the modifier/router/
/// dispatcher pipeline (or the CONNECT state machine) until `shutdown` is
/// triggered.
pub struct ProxyRuntime {
	cfg: Config,
	router: Arc<Router>,
	dispatcher: Arc<Dispatcher>,
	connect_handler: Arc<ConnectHandler>,
	mitm_engine: Option<Arc<MitmEngine>>,
	metrics: Option<Arc<Metrics>>,
}

impl ProxyRuntime {
	pub fn new(cfg: Config, metrics: Option<Arc<Metrics>>) -> Result<Self, ConfigError> {
		if let Some(m) = &cfg.mitm
			&& m.ca.is_none()
		{
			return Err(ConfigError::MitmCa(MitmError::CaLoad(
				"MITM is enabled but no CA was configured; the app crate must self-sign one before constructing ProxyRuntime".to_string(),
			)));
		}

		let credentials = Arc::new(CredentialsMatcher::build(cfg.credentials.clone())?);

		let resolver = match &cfg.dns {
			Some(dns) => Arc::new(HickoryResolver::new(dns.clone())) as Arc<dyn crate::resolver::HostResolver>,
			None => system(),
		};
		let dialer_cfg = DialerConfig {
			timeout: cfg.dial_timeout,
			keepalive: cfg.dial_keepalive,
			redirects: cfg.dial_redirects.clone(),
			resolver,
		};
		let dialer = Arc::new(Dialer::new(dialer_cfg, metrics.clone()));

		let tls = build_tls_client_config(cfg.insecure, cfg.cacert_pem.as_deref()).map_err(|_| ConfigError::InvalidAddress("client tls".to_string()))?;
		let origin = Arc::new(OriginClient::new((*dialer).clone(), tls));

		let mitm_engine = cfg
			.mitm
			.as_ref()
			.map(|m| Arc::new(MitmEngine::new(m.ca.clone().expect("checked above"), m.org.clone(), m.validity, m.cache_capacity, metrics.clone())));

		let pac = match cfg.routing.as_ref() {
			RoutingMode::Pac(p) => Some(p.clone()),
			_ => None,
		};
		let static_upstream = match cfg.routing.as_ref() {
			RoutingMode::StaticUpstream(u) => Some(u.clone()),
			_ => None,
		};

		let router_cfg = RouterConfig {
			localhost_policy: cfg.proxy_localhost,
			loopback_aliases: cfg.loopback_aliases.clone(),
			direct_domains: cfg.direct_domains.clone(),
			mitm_enabled: cfg.mitm.is_some(),
			mitm_domains: cfg.mitm.as_ref().and_then(|m| m.domains.clone()),
			static_upstream,
			pac,
		};
		let router = Arc::new(Router::new(router_cfg, credentials.clone()));

		let mut outer_request: Vec<Arc<dyn ModifyRequest>> = Vec::new();
		if let Some((user, pass)) = &cfg.basic_auth {
			outer_request.push(Arc::new(ProxyAuthModifier {
				username: user.clone(),
				password: pass.clone(),
				realm: PROXY_NAME.to_string(),
			}));
		}
		outer_request.push(Arc::new(LocalhostDenyModifier {
			policy: cfg.proxy_localhost,
			aliases: cfg.loopback_aliases.clone(),
		}));
		if let Some(m) = &cfg.deny_domains {
			outer_request.push(Arc::new(DenyDomainsModifier { matcher: m.clone() }));
		}

		let mut inner_request: Vec<Arc<dyn ModifyRequest>> = Vec::new();
		if !cfg.header_edits.is_empty() {
			inner_request.push(Arc::new(HeaderRequestModifier { edits: cfg.header_edits.clone() }));
		}

		let mut response: Vec<Arc<dyn crate::modifiers::ModifyResponse>> = Vec::new();
		if !cfg.response_header_edits.is_empty() {
			response.push(Arc::new(HeaderResponseModifier { edits: cfg.response_header_edits.clone() }));
		}

		let site_credentials = Arc::new(SiteCredentialsModifier { matcher: credentials.clone() });
		let modifiers = Arc::new(ModifierStack::new(outer_request, inner_request, response, site_credentials));

		let dispatcher = Arc::new(Dispatcher::new(router.clone(), modifiers.clone(), origin, metrics.clone()));
		let connect_handler = Arc::new(ConnectHandler::new(
			router.clone(),
			modifiers.clone(),
			dialer.clone(),
			mitm_engine.clone(),
			dispatcher.clone(),
			metrics.clone(),
			cfg.connect_timeout,
			cfg.idle_timeout,
			cfg.tls_handshake_timeout,
		));

		Ok(ProxyRuntime { cfg, router, dispatcher, connect_handler, mitm_engine, metrics })
	}

	pub fn router(&self) -> &Arc<Router> {
		&self.router
	}

	/// CA certificate DER, for callers (the app crate's readiness surface,
	/// tests) that need to export it for clients to trust.
	pub fn mitm_ca_cert_der(&self) -> Option<&rcgen::CertificateDer<'static>> {
		self.mitm_engine.as_ref().map(|m| m.ca_cert_der())
	}

	/// Binds every configured listener and serves connections until
	/// `shutdown` is cancelled. On cancellation, listeners stop accepting
	/// immediately and in-flight connections get `grace_period` to finish
	/// before being abandoned.
	pub async fn serve(self: Arc<Self>, shutdown: CancellationToken, grace_period: Duration) -> std::io::Result<()> {
		let mut bound = Vec::new();
		for addr in self.cfg.addresses.clone() {
			for socket_addr in addr {
				bound.push(Listener::bind(socket_addr, self.cfg.listener.clone(), self.metrics.clone()).await?);
			}
		}

		let mut accept_loops = JoinSet::new();
		for listener in bound {
			let runtime = self.clone();
			let shutdown = shutdown.clone();
			accept_loops.spawn(async move { runtime.accept_loop(Arc::new(listener), shutdown, grace_period).await });
		}

		while accept_loops.join_next().await.is_some() {}
		Ok(())
	}

	async fn accept_loop(self: Arc<Self>, listener: Arc<Listener>, shutdown: CancellationToken, grace_period: Duration) {
		let mut connections = JoinSet::new();
		loop {
			tokio::select! {
				biased;
				_ = shutdown.cancelled() => break,
				accepted = listener.accept() => {
					match accepted {
						Ok((remote_addr, stream)) => {
							let runtime = self.clone();
							let listener = listener.clone();
							let conn_shutdown = shutdown.child_token();
							connections.spawn(async move {
								runtime.handle_connection(remote_addr, stream, conn_shutdown).await;
								listener.note_closed();
							});
						},
						Err(e) => {
							tracing::debug!(target: "forwarder::listener", error = %e, "accept failed");
						},
					}
				},
			}
		}
		let drain = async {
			while connections.join_next().await.is_some() {}
		};
		if tokio::time::timeout(grace_period, drain).await.is_err() {
			connections.shutdown().await;
		}
	}

	async fn handle_connection(self: Arc<Self>, remote_addr: SocketAddr, stream: InboundStream, shutdown: CancellationToken) {
		let io = TokioIo::new(stream);
		let runtime = self.clone();
		let service = service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
			let runtime = runtime.clone();
			async move { runtime.handle_request(remote_addr, req).await }
		});

		let conn = hyper::server::conn::http1::Builder::new()
			.header_read_timeout(self.cfg.read_header_timeout)
			.serve_connection(io, service)
			.with_upgrades();
		tokio::select! {
			biased;
			_ = shutdown.cancelled() => {},
			result = conn => {
				if let Err(e) = result {
					tracing::debug!(target: "forwarder::listener", error = %e, "connection closed");
				}
			},
		}
	}

	async fn handle_request(
		&self,
		remote_addr: SocketAddr,
		req: hyper::Request<hyper::body::Incoming>,
	) -> Result<crate::http::Response, std::convert::Infallible> {
		let (parts, body) = req.into_parts();
		let mut req = crate::http::Request::from_parts(parts, crate::http::incoming_body(body));
		let mut log = RequestLog::new(Uuid::new_v4().to_string(), Some(remote_addr));

		if req.method() == http::Method::CONNECT {
			match self.connect_handler.handle(&mut log, &mut req).await {
				ConnectOutcome::Respond(resp) => Ok(resp),
				ConnectOutcome::Upgrade { response, driver } => {
					let connect_handler = self.connect_handler.clone();
					tokio::spawn(async move {
						match hyper::upgrade::on(&mut req).await {
							Ok(upgraded) => {
								let io = TokioIo::new(upgraded);
								connect_handler.drive(Some(remote_addr), driver, io).await;
							},
							Err(e) => {
								tracing::debug!(target: "forwarder::connect", error = %e, "CONNECT upgrade failed");
							},
						}
					});
					Ok(response)
				},
			}
		} else {
			Ok(self.dispatcher.dispatch(&mut log, req, false).await)
		}
	}
}
