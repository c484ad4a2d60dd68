//! Top-down, first-match-wins routing decision: DENY, DIRECT, UPSTREAM, or
//! MITM (spec.md §4.9).

use std::sync::Arc;

use crate::addressing::{ProxyURL, Userinfo};
use crate::credentials::CredentialsMatcher;
use crate::error::ProxyError;
use crate::hostmatcher::Matcher;
use crate::modifiers::LocalhostPolicy;
use crate::pac::{PacResolver, select_first_directive};

/// One routing outcome for a request (or CONNECT target).
#[derive(Debug, Clone)]
pub enum Decision {
	Direct,
	Upstream(ProxyURL),
	/// CONNECT only: the request should be intercepted and re-routed after
	/// a forged-certificate TLS handshake with the client.
	Mitm,
}

/// Everything the router needs to decide a single request: the
/// destination host, whether this is a CONNECT (MITM only applies to
/// CONNECT), and the full request URL (for PAC).
pub struct RouteRequest<'a> {
	pub host: &'a str,
	pub port: u16,
	pub url: &'a str,
	pub is_connect: bool,
}

#[derive(Clone, Default)]
pub struct RouterConfig {
	pub localhost_policy: LocalhostPolicy,
	pub loopback_aliases: Arc<[String]>,
	pub direct_domains: Option<Matcher>,
	pub mitm_enabled: bool,
	pub mitm_domains: Option<Matcher>,
	pub static_upstream: Option<ProxyURL>,
	pub pac: Option<Arc<dyn PacResolver>>,
}

/// Holds the assembled routing configuration and the credentials matcher
/// used to attach upstream auth.
pub struct Router {
	cfg: RouterConfig,
	credentials: Arc<CredentialsMatcher>,
}

impl Router {
	pub fn new(cfg: RouterConfig, credentials: Arc<CredentialsMatcher>) -> Self {
		Router { cfg, credentials }
	}

	fn is_loopback(&self, host: &str) -> bool {
		if host.eq_ignore_ascii_case("localhost") || host == "::1" {
			return true;
		}
		if host.parse::<std::net::Ipv4Addr>().map(|ip| ip.octets()[0] == 127).unwrap_or(false) {
			return true;
		}
		self.cfg.loopback_aliases.iter().any(|a| a.eq_ignore_ascii_case(host))
	}

	/// Decides the route for `req`. Steps 1 (outer-frame-already-responded)
	/// is the caller's responsibility: this is only reached once the outer
	/// frame has passed.
	pub async fn route(&self, req: &RouteRequest<'_>) -> Result<Decision, ProxyError> {
		if self.cfg.localhost_policy == LocalhostPolicy::Direct && self.is_loopback(req.host) {
			return Ok(Decision::Direct);
		}

		if let Some(m) = &self.cfg.direct_domains
			&& m.match_str(req.host)
		{
			return Ok(Decision::Direct);
		}

		if req.is_connect
			&& self.cfg.mitm_enabled
			&& self.cfg.mitm_domains.as_ref().is_none_or(|m| m.match_str(req.host))
		{
			return Ok(Decision::Mitm);
		}

		if let Some(upstream) = &self.cfg.static_upstream {
			return Ok(Decision::Upstream(upstream.clone()));
		}

		if let Some(pac) = &self.cfg.pac {
			let result = pac.find_proxy_for_url(req.url, req.host).await?;
			return match select_first_directive(&result)? {
				crate::pac::PacDirective::Direct => Ok(Decision::Direct),
				crate::pac::PacDirective::Proxy(url) => Ok(Decision::Upstream(url)),
			};
		}

		Ok(Decision::Direct)
	}

	/// Resolves the userinfo to attach to an UPSTREAM dial: the upstream
	/// URL's own userinfo if present, else a CredentialsMatcher hit for
	/// that upstream's host:port (spec.md §4.9).
	pub fn upstream_userinfo(&self, upstream: &ProxyURL) -> Option<Userinfo> {
		if let Some(u) = &upstream.userinfo {
			return Some(u.clone());
		}
		self.credentials.match_hostport(upstream.host.as_str(), upstream.port).cloned()
	}
}

#[cfg(test)]
mod tests {
	use std::future::Future;
	use std::pin::Pin;

	use super::*;
	use crate::pac::PacError;

	fn router_with(cfg: RouterConfig) -> Router {
		Router::new(cfg, Arc::new(CredentialsMatcher::default()))
	}

	#[tokio::test]
	async fn localhost_direct_policy_wins_first() {
		let cfg = RouterConfig {
			localhost_policy: LocalhostPolicy::Direct,
			static_upstream: Some(ProxyURL::parse("http://proxy.example:8080").unwrap()),
			..Default::default()
		};
		let router = router_with(cfg);
		let req = RouteRequest { host: "127.0.0.1", port: 80, url: "http://127.0.0.1/", is_connect: false };
		assert!(matches!(router.route(&req).await.unwrap(), Decision::Direct));
	}

	#[tokio::test]
	async fn direct_domains_beats_static_upstream() {
		let cfg = RouterConfig {
			direct_domains: Some(Matcher::build(["intranet.example"]).unwrap()),
			static_upstream: Some(ProxyURL::parse("http://proxy.example:8080").unwrap()),
			..Default::default()
		};
		let router = router_with(cfg);
		let req = RouteRequest { host: "intranet.example", port: 80, url: "http://intranet.example/", is_connect: false };
		assert!(matches!(router.route(&req).await.unwrap(), Decision::Direct));
	}

	#[tokio::test]
	async fn mitm_only_applies_to_connect() {
		let cfg = RouterConfig {
			mitm_enabled: true,
			static_upstream: Some(ProxyURL::parse("http://proxy.example:8080").unwrap()),
			..Default::default()
		};
		let router = router_with(cfg.clone());
		let connect_req = RouteRequest { host: "api.example", port: 443, url: "api.example:443", is_connect: true };
		assert!(matches!(router.route(&connect_req).await.unwrap(), Decision::Mitm));

		let plain_req = RouteRequest { host: "api.example", port: 443, url: "http://api.example/", is_connect: false };
		assert!(matches!(router.route(&plain_req).await.unwrap(), Decision::Upstream(_)));
	}

	#[tokio::test]
	async fn falls_back_to_direct_with_no_configuration() {
		let router = router_with(RouterConfig::default());
		let req = RouteRequest { host: "example.com", port: 80, url: "http://example.com/", is_connect: false };
		assert!(matches!(router.route(&req).await.unwrap(), Decision::Direct));
	}

	struct StubPac(&'static str);
	impl PacResolver for StubPac {
		fn find_proxy_for_url<'a>(
			&'a self,
			_url: &'a str,
			_hostname: &'a str,
		) -> Pin<Box<dyn Future<Output = Result<String, PacError>> + Send + 'a>> {
			Box::pin(async move { Ok(self.0.to_string()) })
		}
	}

	#[tokio::test]
	async fn pac_direct_result_routes_direct() {
		let cfg = RouterConfig { pac: Some(Arc::new(StubPac("DIRECT"))), ..Default::default() };
		let router = router_with(cfg);
		let req = RouteRequest { host: "intranet.corp", port: 80, url: "http://intranet.corp/", is_connect: false };
		assert!(matches!(router.route(&req).await.unwrap(), Decision::Direct));
	}

	#[tokio::test]
	async fn pac_proxy_result_routes_upstream() {
		let cfg = RouterConfig { pac: Some(Arc::new(StubPac("PROXY proxy1.example:8080"))), ..Default::default() };
		let router = router_with(cfg);
		let req = RouteRequest { host: "example.com", port: 80, url: "http://example.com/", is_connect: false };
		let Decision::Upstream(url) = router.route(&req).await.unwrap() else {
			panic!("expected upstream decision");
		};
		assert_eq!(url.host.as_str(), "proxy1.example");
	}

	#[test]
	fn upstream_userinfo_prefers_url_then_credentials_matcher() {
		let creds = CredentialsMatcher::build([crate::addressing::HostPortUser::parse("u:p@proxy.example:8080").unwrap()]).unwrap();
		let router = Router::new(RouterConfig::default(), Arc::new(creds));
		let url = ProxyURL::parse("http://proxy.example:8080").unwrap();
		assert_eq!(router.upstream_userinfo(&url).unwrap().username.as_str(), "u");

		let url_with_user = ProxyURL::parse("http://other:pw@proxy.example:8080").unwrap();
		assert_eq!(router.upstream_userinfo(&url_with_user).unwrap().username.as_str(), "other");
	}
}
