//! CONNECT state machine: outer auth/deny checks, MITM-vs-tunnel
//! classification, upstream-chained CONNECT, and the byte/HTTP relay once
//! the client connection has been upgraded to raw I/O (spec.md §4.10).

use std::sync::Arc;
use std::time::Duration;

use forwarder_core::copy::{ConnectionResult, copy_bidirectional};
use hyper::service::service_fn;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::TlsAcceptor;
use uuid::Uuid;

use crate::addressing::ProxyURL;
use crate::dialer::{DialTrackMode, Dialer, TrackedConn};
use crate::dispatcher::Dispatcher;
use crate::error::ProxyError;
use crate::http::{Response, full_body};
use crate::mitm::MitmEngine;
use crate::modifiers::ModifierStack;
use crate::router::{Decision, RouteRequest, Router};
use crate::telemetry::log::{RequestLog, RouteDecision};
use crate::telemetry::metrics::Metrics;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// What to do with the client connection once it has been upgraded to raw
/// I/O, decided in `ConnectHandler::handle` before the 200 response is
/// sent.
pub enum ConnectDriver {
	Mitm { target_host: String },
	Tunnel { conn: TrackedConn },
}

/// Either a final (non-2xx) response to send without upgrading, or a 200
/// response plus the work to perform once the connection is upgraded.
pub enum ConnectOutcome {
	Respond(Response),
	Upgrade { response: Response, driver: ConnectDriver },
}

pub struct ConnectHandler {
	router: Arc<Router>,
	modifiers: Arc<ModifierStack>,
	dialer: Arc<Dialer>,
	mitm: Option<Arc<MitmEngine>>,
	dispatcher: Arc<Dispatcher>,
	metrics: Option<Arc<Metrics>>,
	connect_timeout: Duration,
	idle_timeout: Duration,
	handshake_timeout: Duration,
}

impl ConnectHandler {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		router: Arc<Router>,
		modifiers: Arc<ModifierStack>,
		dialer: Arc<Dialer>,
		mitm: Option<Arc<MitmEngine>>,
		dispatcher: Arc<Dispatcher>,
		metrics: Option<Arc<Metrics>>,
		connect_timeout: Duration,
		idle_timeout: Duration,
		handshake_timeout: Duration,
	) -> Self {
		ConnectHandler {
			router,
			modifiers,
			dialer,
			mitm,
			dispatcher,
			metrics,
			connect_timeout,
			idle_timeout,
			handshake_timeout,
		}
	}

	/// Classifies a CONNECT request (INIT -> CLASSIFIED in spec.md §4.10),
	/// running the outer auth/deny frame and, for the tunnel branch,
	/// dialing the target (possibly through a chained upstream CONNECT)
	/// before ever claiming success to the client.
	pub async fn handle(&self, log: &mut RequestLog, req: &mut crate::http::Request) -> ConnectOutcome {
		match self.modifiers.run_outer(log, req) {
			Ok(Some(resp)) => return ConnectOutcome::Respond(self.finish(log, resp)),
			Ok(None) => {},
			Err(e) => return ConnectOutcome::Respond(self.finish_error(log, &e)),
		}

		let Some(authority) = req.uri().authority().cloned() else {
			return ConnectOutcome::Respond(self.finish_error(
				log,
				&ProxyError::MalformedRequest("CONNECT target must be host:port".to_string()),
			));
		};
		let host = authority.host().to_string();
		let port = authority.port_u16().unwrap_or(443);

		let route_req = RouteRequest { host: &host, port, url: authority.as_str(), is_connect: true };
		let decision = match self.router.route(&route_req).await {
			Ok(d) => d,
			Err(e) => return ConnectOutcome::Respond(self.finish_error(log, &e)),
		};

		match decision {
			Decision::Mitm => {
				log.set_route(RouteDecision::Mitm);
				log.set_upstream(format!("{host}:{port}"));
				ConnectOutcome::Upgrade {
					response: self.finish(log, connection_established()),
					driver: ConnectDriver::Mitm { target_host: host },
				}
			},
			Decision::Direct => {
				log.set_route(RouteDecision::Direct);
				log.set_upstream(format!("{host}:{port}"));
				self.dial_direct(log, &host, port).await
			},
			Decision::Upstream(upstream) => {
				log.set_route(RouteDecision::Upstream);
				log.set_upstream(upstream.to_string());
				self.dial_via_upstream(log, &upstream, &host, port).await
			},
		}
	}

	async fn dial_direct(&self, log: &mut RequestLog, host: &str, port: u16) -> ConnectOutcome {
		let label = format!("{host}:{port}");
		match tokio::time::timeout(self.connect_timeout, self.dialer.dial(host, port, DialTrackMode::Traffic)).await {
			Ok(Ok(conn)) => ConnectOutcome::Upgrade {
				response: self.finish(log, connection_established()),
				driver: ConnectDriver::Tunnel { conn },
			},
			Ok(Err(source)) => ConnectOutcome::Respond(self.finish_error(log, &ProxyError::DialFailed { addr: label, source })),
			Err(_) => ConnectOutcome::Respond(self.finish_error(log, &ProxyError::DialTimeout { addr: label })),
		}
	}

	async fn dial_via_upstream(&self, log: &mut RequestLog, upstream: &ProxyURL, host: &str, port: u16) -> ConnectOutcome {
		match tokio::time::timeout(self.connect_timeout, connect_through_upstream(&self.dialer, upstream, host, port)).await {
			Ok(Ok(conn)) => ConnectOutcome::Upgrade {
				response: self.finish(log, connection_established()),
				driver: ConnectDriver::Tunnel { conn },
			},
			Ok(Err(e)) => ConnectOutcome::Respond(self.finish_error(log, &e)),
			Err(_) => ConnectOutcome::Respond(self.finish_error(log, &ProxyError::DialTimeout { addr: upstream.to_string() })),
		}
	}

	/// Drives the connection once the client side has been upgraded to
	/// raw I/O: either the MITM TLS handshake and inner HTTP loop, or a
	/// straight byte relay to an already-dialed tunnel (spec.md §4.10
	/// HANDSHAKE_CLIENT/RELAY_HTTP and DIAL_TARGET/RELAY_BYTES).
	pub async fn drive<S>(&self, remote_addr: Option<std::net::SocketAddr>, driver: ConnectDriver, client_io: S)
	where
		S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
	{
		match driver {
			ConnectDriver::Mitm { target_host } => self.relay_mitm(remote_addr, &target_host, client_io).await,
			ConnectDriver::Tunnel { conn } => self.relay_tunnel(client_io, conn).await,
		}
	}

	async fn relay_mitm<S>(&self, remote_addr: Option<std::net::SocketAddr>, target_host: &str, client_io: S)
	where
		S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
	{
		let Some(mitm) = &self.mitm else {
			tracing::event!(target: "forwarder::connect", tracing::Level::ERROR, "MITM driver invoked with no MITM engine configured");
			return;
		};
		let server_cfg = match mitm.server_config_for(target_host).await {
			Ok(cfg) => cfg,
			Err(e) => {
				tracing::event!(target: "forwarder::connect", tracing::Level::WARN, error = %e, host = target_host, "failed to forge MITM leaf");
				return;
			},
		};
		let tls_stream = match tokio::time::timeout(self.handshake_timeout, TlsAcceptor::from(server_cfg).accept(client_io)).await {
			Ok(Ok(s)) => s,
			Ok(Err(e)) => {
				tracing::event!(target: "forwarder::connect", tracing::Level::WARN, error = %e, host = target_host, "MITM client handshake failed");
				return;
			},
			Err(_) => {
				tracing::event!(target: "forwarder::connect", tracing::Level::WARN, host = target_host, "MITM client handshake timed out");
				return;
			},
		};

		let io = hyper_util::rt::TokioIo::new(tls_stream);
		let dispatcher = self.dispatcher.clone();
		let target_host = target_host.to_string();
		let service = service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
			let dispatcher = dispatcher.clone();
			let target_host = target_host.clone();
			async move {
				let mut log = RequestLog::new(Uuid::new_v4().to_string(), remote_addr);
				log.extra("mitm_target", &target_host);
				let (parts, body) = req.into_parts();
				let req = http::Request::from_parts(parts, crate::http::incoming_body(body));
				let resp = dispatcher.dispatch(&mut log, req, true).await;
				Ok::<_, std::convert::Infallible>(resp)
			}
		});

		if let Err(e) = hyper::server::conn::http1::Builder::new().serve_connection(io, service).with_upgrades().await {
			tracing::event!(target: "forwarder::connect", tracing::Level::DEBUG, error = %e, "MITM inner connection closed");
		}
	}

	async fn relay_tunnel<S>(&self, client_io: S, conn: TrackedConn)
	where
		S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
	{
		let stats = ConnectionResult::default();
		let result = tokio::time::timeout(self.idle_timeout, copy_bidirectional(client_io, conn, &stats)).await;
		match result {
			Ok(Ok(_)) | Err(_) => {},
			Ok(Err(e)) => {
				tracing::event!(target: "forwarder::connect", tracing::Level::DEBUG, error = %e, "CONNECT relay ended");
			},
		}
	}

	fn finish(&self, log: &mut RequestLog, resp: Response) -> Response {
		log.set_status(resp.status());
		log.finish();
		resp
	}

	fn finish_error(&self, log: &mut RequestLog, err: &ProxyError) -> Response {
		log.set_error(err.label());
		if let Some(m) = &self.metrics
			&& !err.is_deny()
		{
			m.record_error(err.label());
		}
		self.finish(log, crate::error::ErrorMapper::new("forwarder").map(err))
	}
}

/// hyper does not let a server connection set a custom status-line reason
/// phrase, so this surfaces as `200 OK` rather than the RFC-suggested
/// `200 Connection established`; clients key off the status code.
fn connection_established() -> Response {
	http::Response::builder()
		.status(http::StatusCode::OK)
		.body(full_body(&b"Connection established\r\n"[..]))
		.expect("static CONNECT response is always valid")
}

/// Dials `upstream` and issues a chained CONNECT for `host:port`, returning
/// the tunnel past the CONNECT response once it reports success. A
/// non-2xx upstream response surfaces as `martian_error` (spec.md §4.10).
async fn connect_through_upstream(dialer: &Dialer, upstream: &ProxyURL, host: &str, port: u16) -> Result<TrackedConn, ProxyError> {
	let mut conn = dialer
		.dial(upstream.host.as_str(), upstream.port, DialTrackMode::Traffic)
		.await
		.map_err(|source| ProxyError::DialFailed { addr: upstream.to_string(), source })?;

	let target = format!("{host}:{port}");
	let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
	if let Some(creds) = &upstream.userinfo {
		request.push_str(&format!("Proxy-Authorization: {}\r\n", creds.basic_auth_value()));
	}
	request.push_str("\r\n");

	conn
		.write_all(request.as_bytes())
		.await
		.map_err(|source| ProxyError::DialFailed { addr: upstream.to_string(), source })?;

	let status = read_status_line(&mut conn)
		.await
		.map_err(|source| ProxyError::DialFailed { addr: upstream.to_string(), source })?;
	if !status.is_success() {
		return Err(ProxyError::UpstreamConnectStatus { status });
	}
	Ok(conn)
}

/// Reads a raw HTTP/1.x response header block byte by byte (mirroring
/// `listener::read_proxy_header`'s approach) and returns its status code.
/// A successful CONNECT response carries no body, so nothing is left
/// buffered for the caller to lose.
async fn read_status_line(conn: &mut TrackedConn) -> std::io::Result<http::StatusCode> {
	let mut buf = Vec::new();
	let mut byte = [0u8; 1];
	loop {
		let n = conn.read(&mut byte).await?;
		if n == 0 {
			return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "connection closed during CONNECT response"));
		}
		buf.push(byte[0]);
		if buf.ends_with(b"\r\n\r\n") {
			break;
		}
		if buf.len() > 8192 {
			return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "CONNECT response headers too large"));
		}
	}
	let text = String::from_utf8_lossy(&buf);
	let line = text.lines().next().unwrap_or("");
	let code = line
		.split_whitespace()
		.nth(1)
		.ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "malformed CONNECT response status line"))?;
	code
		.parse::<u16>()
		.ok()
		.and_then(|c| http::StatusCode::from_u16(c).ok())
		.ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "invalid CONNECT response status code"))
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::io::duplex;
	use tokio::net::TcpListener;

	#[tokio::test]
	async fn connect_through_upstream_rejects_non_2xx() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		tokio::spawn(async move {
			let (mut sock, _) = listener.accept().await.unwrap();
			let mut buf = [0u8; 1024];
			let _ = sock.read(&mut buf).await.unwrap();
			sock.write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n").await.unwrap();
		});

		let dialer = Dialer::new(crate::dialer::DialerConfig::default(), None);
		let upstream = ProxyURL::parse(&format!("http://{addr}")).unwrap();
		let err = connect_through_upstream(&dialer, &upstream, "origin.example", 443).await.unwrap_err();
		assert_eq!(err.label(), "martian_error");
	}

	#[tokio::test]
	async fn connect_through_upstream_succeeds_on_2xx() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		tokio::spawn(async move {
			let (mut sock, _) = listener.accept().await.unwrap();
			let mut buf = [0u8; 1024];
			let _ = sock.read(&mut buf).await.unwrap();
			sock.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n").await.unwrap();
		});

		let dialer = Dialer::new(crate::dialer::DialerConfig::default(), None);
		let upstream = ProxyURL::parse(&format!("http://{addr}")).unwrap();
		let conn = connect_through_upstream(&dialer, &upstream, "origin.example", 443).await;
		assert!(conn.is_ok());
	}

	#[tokio::test]
	async fn relay_tunnel_copies_bytes_until_close() {
		let server_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let server_addr = server_listener.local_addr().unwrap();
		let server_task = tokio::spawn(async move {
			let (mut sock, _) = server_listener.accept().await.unwrap();
			let mut buf = [0u8; 5];
			sock.read_exact(&mut buf).await.unwrap();
			sock.write_all(b"world").await.unwrap();
		});

		let dialer = Dialer::new(crate::dialer::DialerConfig::default(), None);
		let upstream_conn = dialer.dial(&server_addr.ip().to_string(), server_addr.port(), DialTrackMode::Traffic).await.unwrap();

		let (client_a, mut client_b) = duplex(64);
		let relay = tokio::spawn(async move { copy_bidirectional(client_a, upstream_conn, &ConnectionResult::default()).await });

		client_b.write_all(b"hello").await.unwrap();
		let mut echoed = [0u8; 5];
		client_b.read_exact(&mut echoed).await.unwrap();
		assert_eq!(&echoed, b"world");

		drop(client_b);
		let _ = relay.await.unwrap();
		server_task.abort();
	}
}
