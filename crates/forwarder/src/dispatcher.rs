//! Non-CONNECT request handling: strip hop-by-hop headers, route, attach
//! upstream auth, round-trip, and run response modifiers (spec.md §4.11).

use std::sync::Arc;
use std::time::Instant;

use crate::addressing::Scheme;
use crate::client::OriginClient;
use crate::error::ProxyError;
use crate::http::{Request, Response, strip_hop_by_hop};
use crate::modifiers::ModifierStack;
use crate::router::{Decision, RouteRequest, Router};
use crate::telemetry::log::{RequestLog, RouteDecision};
use crate::telemetry::metrics::Metrics;

pub struct Dispatcher {
	router: Arc<Router>,
	modifiers: Arc<ModifierStack>,
	origin: Arc<OriginClient>,
	metrics: Option<Arc<Metrics>>,
}

impl Dispatcher {
	pub fn new(router: Arc<Router>, modifiers: Arc<ModifierStack>, origin: Arc<OriginClient>, metrics: Option<Arc<Metrics>>) -> Self {
		Dispatcher { router, modifiers, origin, metrics }
	}

	/// Handles one non-CONNECT request end to end, returning the response
	/// to write back to the client. `intercepted` is set when this request
	/// arrived over a MITM-decrypted connection, in which case routing
	/// already happened at the CONNECT stage and this call always dials
	/// the real origin directly over TLS (spec.md §4.10 HANDSHAKE_CLIENT).
	pub async fn dispatch(&self, log: &mut RequestLog, mut req: Request, intercepted: bool) -> Response {
		log.with_request(req.method(), req.uri());
		log.intercepted = intercepted;

		match self.modifiers.run_request(log, &mut req) {
			Ok(Some(resp)) => return self.finish(log, resp),
			Ok(None) => {},
			Err(e) => return self.finish(log, self.map_error(log, &e)),
		}

		let result = if intercepted {
			self.dispatch_intercepted(log, req).await
		} else {
			self.dispatch_routed(log, req).await
		};

		let mut resp = match result {
			Ok(resp) => resp,
			Err(e) => self.map_error(log, &e),
		};
		self.modifiers.run_response(log, &mut resp);
		self.finish(log, resp)
	}

	async fn dispatch_intercepted(&self, log: &mut RequestLog, req: Request) -> Result<Response, ProxyError> {
		let host = req.uri().host().ok_or_else(|| ProxyError::MalformedRequest("missing host".to_string()))?.to_string();
		let port = req.uri().port_u16().unwrap_or(443);
		log.set_route(RouteDecision::Mitm);
		log.set_upstream(format!("{host}:{port}"));
		self.forward(&Scheme::Https, &host, port, req).await
	}

	async fn dispatch_routed(&self, log: &mut RequestLog, req: Request) -> Result<Response, ProxyError> {
		let host = req.uri().host().ok_or_else(|| ProxyError::MalformedRequest("missing host in request-target".to_string()))?.to_string();
		let scheme = req.uri().scheme_str().unwrap_or("http");
		let port = req.uri().port_u16().unwrap_or(if scheme == "https" { 443 } else { 80 });

		let route_req = RouteRequest { host: &host, port, url: &req.uri().to_string(), is_connect: false };
		let decision = self.router.route(&route_req).await?;

		match decision {
			Decision::Direct => {
				log.set_route(RouteDecision::Direct);
				log.set_upstream(format!("{host}:{port}"));
				let origin_scheme = if scheme == "https" { Scheme::Https } else { Scheme::Http };
				self.forward(&origin_scheme, &host, port, req).await
			},
			Decision::Upstream(upstream) => {
				log.set_route(RouteDecision::Upstream);
				log.set_upstream(upstream.to_string());
				let mut req = req;
				if let Some(creds) = self.router.upstream_userinfo(&upstream) {
					let value = http::HeaderValue::try_from(creds.basic_auth_value())
						.map_err(|_| ProxyError::MalformedRequest("invalid upstream credentials".to_string()))?;
					req.headers_mut().insert(http::header::PROXY_AUTHORIZATION, value);
				}
				self.forward(&upstream.scheme, &upstream.host, upstream.port, req).await
			},
			Decision::Mitm => unreachable!("router never returns Mitm for a non-CONNECT request"),
		}
	}

	/// Dials `host:port` and round-trips `req` unchanged over that
	/// connection (hop-by-hop headers have already been stripped).
	async fn forward(&self, scheme: &Scheme, host: &str, port: u16, mut req: Request) -> Result<Response, ProxyError> {
		let is_upgrade = req.headers().get(http::header::UPGRADE).is_some();
		strip_hop_by_hop(req.headers_mut(), is_upgrade);

		let mut sender = self.origin.connect(*scheme, host, port).await?;
		let start = Instant::now();
		let resp = sender
			.send_request(req)
			.await
			.map_err(|e| ProxyError::DialFailed { addr: format!("{host}:{port}"), source: std::io::Error::other(e) })?;
		if let Some(m) = &self.metrics {
			m.connect_duration_seconds.observe(start.elapsed().as_secs_f64());
		}

		let (parts, body) = resp.into_parts();
		Ok(http::Response::from_parts(parts, crate::http::incoming_body(body)))
	}

	fn map_error(&self, log: &mut RequestLog, err: &ProxyError) -> Response {
		log.set_error(err.label());
		if let Some(m) = &self.metrics
			&& !err.is_deny()
		{
			m.record_error(err.label());
		}
		crate::error::ErrorMapper::new("forwarder").map(err)
	}

	fn finish(&self, log: &mut RequestLog, resp: Response) -> Response {
		log.set_status(resp.status());
		log.finish();
		resp
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::credentials::CredentialsMatcher;
	use crate::dialer::{Dialer, DialerConfig};
	use crate::modifiers::SiteCredentialsModifier;
	use crate::router::RouterConfig;

	fn test_dispatcher() -> Dispatcher {
		let router = Arc::new(Router::new(RouterConfig::default(), Arc::new(CredentialsMatcher::default())));
		let modifiers = Arc::new(ModifierStack::new(
			vec![],
			vec![],
			vec![],
			Arc::new(SiteCredentialsModifier { matcher: Arc::new(CredentialsMatcher::default()) }),
		));
		let tls = crate::client::build_tls_client_config(false, None).unwrap();
		let dialer_cfg = DialerConfig { timeout: std::time::Duration::from_millis(50), ..Default::default() };
		let origin = Arc::new(OriginClient::new(Dialer::new(dialer_cfg, None), tls));
		Dispatcher::new(router, modifiers, origin, None)
	}

	#[tokio::test]
	async fn dispatch_with_unreachable_host_maps_to_error_response() {
		let dispatcher = test_dispatcher();
		let mut log = RequestLog::new("t-1".to_string(), None);
		let req = http::Request::builder()
			.method("GET")
			.uri("http://192.0.2.1:81/")
			.body(crate::http::empty_body())
			.unwrap();
		let resp = dispatcher.dispatch(&mut log, req, false).await;
		assert!(resp.status().is_server_error() || resp.status().is_client_error());
		assert!(resp.headers().contains_key("X-Forwarder-Error"));
	}
}
