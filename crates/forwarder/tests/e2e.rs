//! End-to-end scenarios with a real listening socket standing in for the
//! origin or upstream, exercising the public collaborators the same way
//! `ProxyRuntime` wires them together (spec.md §8).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use http_body_util::BodyExt;
use prometheus_client::registry::Registry;
use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use forwarder::addressing::ProxyURL;
use forwarder::client::{OriginClient, build_tls_client_config};
use forwarder::connect::{ConnectDriver, ConnectHandler, ConnectOutcome};
use forwarder::credentials::CredentialsMatcher;
use forwarder::dialer::{Dialer, DialerConfig};
use forwarder::dispatcher::Dispatcher;
use forwarder::hostmatcher::Matcher;
use forwarder::http::empty_body;
use forwarder::mitm::{CertificateAuthority, MitmEngine};
use forwarder::modifiers::{DenyDomainsModifier, ModifierStack, ProxyAuthModifier, SiteCredentialsModifier};
use forwarder::pac::{PacError, PacResolver};
use forwarder::router::{Router, RouterConfig};
use forwarder::telemetry::log::RequestLog;
use forwarder::telemetry::metrics::{HostLabel, Metrics};

fn empty_site_credentials() -> Arc<SiteCredentialsModifier> {
	Arc::new(SiteCredentialsModifier { matcher: Arc::new(CredentialsMatcher::default()) })
}

fn build_dispatcher(router_cfg: RouterConfig, modifiers: ModifierStack, metrics: Option<Arc<Metrics>>) -> Dispatcher {
	let router = Arc::new(Router::new(router_cfg, Arc::new(CredentialsMatcher::default())));
	let tls = build_tls_client_config(false, None).unwrap();
	let dialer = Dialer::new(DialerConfig { timeout: Duration::from_millis(500), ..Default::default() }, metrics.clone());
	let origin = Arc::new(OriginClient::new(dialer, tls));
	Dispatcher::new(router, Arc::new(modifiers), origin, metrics)
}

/// Reads one HTTP/1.x request head off `listener`'s first connection and
/// writes `response` back verbatim.
async fn respond_once(listener: TcpListener, response: &'static [u8]) {
	let (mut sock, _) = listener.accept().await.unwrap();
	let mut buf = [0u8; 4096];
	let mut total = Vec::new();
	loop {
		let n = sock.read(&mut buf).await.unwrap();
		total.extend_from_slice(&buf[..n]);
		if total.windows(4).any(|w| w == b"\r\n\r\n") || n == 0 {
			break;
		}
	}
	sock.write_all(response).await.unwrap();
}

#[tokio::test]
async fn direct_get_reaches_real_origin() {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(respond_once(listener, b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nBODY"));

	let modifiers = ModifierStack::new(vec![], vec![], vec![], empty_site_credentials());
	let dispatcher = build_dispatcher(RouterConfig::default(), modifiers, None);

	let mut log = RequestLog::new("e2e-direct".to_string(), None);
	let req = http::Request::builder()
		.method("GET")
		.uri(format!("http://{addr}/"))
		.body(empty_body())
		.unwrap();
	let resp = dispatcher.dispatch(&mut log, req, false).await;
	assert_eq!(resp.status(), http::StatusCode::OK);
	let body = resp.into_body().collect().await.unwrap().to_bytes();
	assert_eq!(&body[..], b"BODY");
}

#[tokio::test]
async fn connect_tunnels_through_configured_upstream() {
	let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let upstream_addr = upstream_listener.local_addr().unwrap();
	let upstream_task = tokio::spawn(async move {
		let (mut sock, _) = upstream_listener.accept().await.unwrap();
		let mut buf = [0u8; 4096];
		let mut total = Vec::new();
		loop {
			let n = sock.read(&mut buf).await.unwrap();
			total.extend_from_slice(&buf[..n]);
			if total.windows(4).any(|w| w == b"\r\n\r\n") {
				break;
			}
		}
		let head = String::from_utf8_lossy(&total);
		assert!(head.contains("CONNECT origin.example:443"));
		assert!(head.contains("Proxy-Authorization: Basic"));
		sock.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n").await.unwrap();
		let mut echoed = [0u8; 5];
		sock.read_exact(&mut echoed).await.unwrap();
		sock.write_all(b"world").await.unwrap();
	});

	let upstream = ProxyURL::parse(&format!("http://u:pw@{upstream_addr}")).unwrap();
	let router_cfg = RouterConfig { static_upstream: Some(upstream), ..Default::default() };
	let router = Arc::new(Router::new(router_cfg, Arc::new(CredentialsMatcher::default())));
	let modifiers = Arc::new(ModifierStack::new(vec![], vec![], vec![], empty_site_credentials()));
	let dialer = Arc::new(Dialer::new(DialerConfig::default(), None));
	let dispatcher = Arc::new(build_dispatcher(RouterConfig::default(), ModifierStack::new(vec![], vec![], vec![], empty_site_credentials()), None));
	let handler = Arc::new(ConnectHandler::new(
		router,
		modifiers,
		dialer,
		None,
		dispatcher,
		None,
		Duration::from_secs(5),
		Duration::from_secs(5),
		Duration::from_secs(5),
	));

	let mut log = RequestLog::new("e2e-connect".to_string(), None);
	let mut req = http::Request::builder()
		.method("CONNECT")
		.uri("origin.example:443")
		.body(empty_body())
		.unwrap();
	let outcome = handler.handle(&mut log, &mut req).await;
	let ConnectOutcome::Upgrade { response, driver } = outcome else {
		panic!("expected an upgrade outcome");
	};
	assert_eq!(response.status(), http::StatusCode::OK);
	assert!(matches!(driver, ConnectDriver::Tunnel { .. }));

	let (client_a, mut client_b) = tokio::io::duplex(64);
	let drive_handle = handler.clone();
	let relay = tokio::spawn(async move { drive_handle.drive(None, driver, client_a).await });

	client_b.write_all(b"hello").await.unwrap();
	let mut reply = [0u8; 5];
	client_b.read_exact(&mut reply).await.unwrap();
	assert_eq!(&reply, b"world");

	drop(client_b);
	let _ = relay.await;
	upstream_task.await.unwrap();
}

#[tokio::test]
async fn deny_domains_blocks_request_before_any_dial() {
	let matcher = Matcher::build([r"^blocked\."]).unwrap();
	let modifiers = ModifierStack::new(vec![Arc::new(DenyDomainsModifier { matcher })], vec![], vec![], empty_site_credentials());
	let dispatcher = build_dispatcher(RouterConfig::default(), modifiers, None);

	let mut log = RequestLog::new("e2e-deny".to_string(), None);
	let req = http::Request::builder()
		.method("GET")
		.uri("http://blocked.example/")
		.body(empty_body())
		.unwrap();
	let resp = dispatcher.dispatch(&mut log, req, false).await;
	assert_eq!(resp.status(), http::StatusCode::FORBIDDEN);
	let err_header = resp.headers().get("X-Forwarder-Error").unwrap().to_str().unwrap().to_string();
	assert!(err_header.contains("blocked.example"));
	let body = resp.into_body().collect().await.unwrap().to_bytes();
	assert!(String::from_utf8_lossy(&body).starts_with("forwarder denied_domain\n"));
}

struct DirectPac;
impl PacResolver for DirectPac {
	fn find_proxy_for_url<'a>(
		&'a self,
		_url: &'a str,
		_hostname: &'a str,
	) -> Pin<Box<dyn Future<Output = Result<String, PacError>> + Send + 'a>> {
		Box::pin(async move { Ok("DIRECT".to_string()) })
	}
}

#[tokio::test]
async fn pac_direct_result_dials_origin_and_counts_it() {
	// Stands in for an intranet hostname PAC would send DIRECT: a loopback
	// address is used so the dial actually succeeds in this test.
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(respond_once(listener, b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK"));

	let mut registry = Registry::default();
	let metrics = Metrics::new(&mut registry);

	let router_cfg = RouterConfig { pac: Some(Arc::new(DirectPac)), ..Default::default() };
	let modifiers = ModifierStack::new(vec![], vec![], vec![], empty_site_credentials());
	let dispatcher = build_dispatcher(router_cfg, modifiers, Some(metrics.clone()));

	let mut log = RequestLog::new("e2e-pac".to_string(), None);
	let req = http::Request::builder()
		.method("GET")
		.uri(format!("http://{addr}/"))
		.body(empty_body())
		.unwrap();
	let resp = dispatcher.dispatch(&mut log, req, false).await;
	assert_eq!(resp.status(), http::StatusCode::OK);

	let count = metrics.dialer_dialed_total.get_or_create(&HostLabel { host: addr.ip().to_string() }).get();
	assert_eq!(count, 1);
}

#[tokio::test]
async fn proxy_auth_challenges_then_admits_correct_credentials() {
	let auth = Arc::new(ProxyAuthModifier { username: "u".into(), password: "p".into(), realm: "forwarder".to_string() });
	let modifiers = ModifierStack::new(vec![auth], vec![], vec![], empty_site_credentials());
	let dispatcher = build_dispatcher(RouterConfig::default(), modifiers, None);

	let mut log = RequestLog::new("e2e-auth-1".to_string(), None);
	let req = http::Request::builder()
		.method("GET")
		.uri("http://example.invalid/")
		.body(empty_body())
		.unwrap();
	let resp = dispatcher.dispatch(&mut log, req, false).await;
	assert_eq!(resp.status(), http::StatusCode::PROXY_AUTHENTICATION_REQUIRED);
	assert_eq!(resp.headers().get(http::header::PROXY_AUTHENTICATE).unwrap(), "Basic realm=\"forwarder\"");

	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(respond_once(listener, b"HTTP/1.1 200 OK\r\nContent-Length: 6\r\n\r\nAUTHED"));

	let creds = base64::engine::general_purpose::STANDARD.encode("u:p");
	let mut log2 = RequestLog::new("e2e-auth-2".to_string(), None);
	let req2 = http::Request::builder()
		.method("GET")
		.uri(format!("http://{addr}/"))
		.header(http::header::PROXY_AUTHORIZATION, format!("Basic {creds}"))
		.body(empty_body())
		.unwrap();
	let resp2 = dispatcher.dispatch(&mut log2, req2, false).await;
	assert_eq!(resp2.status(), http::StatusCode::OK);
	let body = resp2.into_body().collect().await.unwrap().to_bytes();
	assert_eq!(&body[..], b"AUTHED");
}

#[tokio::test]
async fn mitm_connect_presents_a_leaf_trusted_by_its_own_ca() {
	let ca_key = KeyPair::generate().unwrap();
	let mut ca_params = CertificateParams::new(vec!["Test CA".to_string()]).unwrap();
	ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
	let ca_cert = ca_params.clone().self_signed(&ca_key).unwrap();
	let ca = Arc::new(CertificateAuthority { cert_der: ca_cert.der().clone(), key: ca_key, params: ca_params });

	let engine = Arc::new(MitmEngine::new(ca.clone(), "Forwarder Test".to_string(), Duration::from_secs(3600), 10, None));

	let router_cfg = RouterConfig { mitm_enabled: true, ..Default::default() };
	let router = Arc::new(Router::new(router_cfg, Arc::new(CredentialsMatcher::default())));
	let modifiers = Arc::new(ModifierStack::new(vec![], vec![], vec![], empty_site_credentials()));
	let dialer = Arc::new(Dialer::new(DialerConfig::default(), None));
	let dispatcher = Arc::new(build_dispatcher(RouterConfig::default(), ModifierStack::new(vec![], vec![], vec![], empty_site_credentials()), None));
	let handler = Arc::new(ConnectHandler::new(
		router,
		modifiers,
		dialer,
		Some(engine),
		dispatcher,
		None,
		Duration::from_secs(5),
		Duration::from_secs(5),
		Duration::from_secs(5),
	));

	let mut log = RequestLog::new("e2e-mitm".to_string(), None);
	let mut req = http::Request::builder().method("CONNECT").uri("api.example:443").body(empty_body()).unwrap();
	let outcome = handler.handle(&mut log, &mut req).await;
	let ConnectOutcome::Upgrade { driver, .. } = outcome else {
		panic!("expected an upgrade outcome");
	};
	assert!(matches!(driver, ConnectDriver::Mitm { .. }));

	let (client_a, client_b) = tokio::io::duplex(8192);
	let drive_handle = handler.clone();
	let relay = tokio::spawn(async move { drive_handle.drive(None, driver, client_a).await });

	let mut roots = rustls::RootCertStore::empty();
	roots.add(ca.cert_der.clone()).unwrap();
	let client_cfg = Arc::new(rustls::ClientConfig::builder().with_root_certificates(roots).with_no_client_auth());
	let connector = tokio_rustls::TlsConnector::from(client_cfg);
	let server_name = rustls_pki_types::ServerName::try_from("api.example".to_string()).unwrap();

	let tls_stream = connector.connect(server_name, client_b).await;
	assert!(tls_stream.is_ok(), "client should trust the forged leaf signed by its own CA");
	drop(tls_stream);

	let _ = relay.await;
}
