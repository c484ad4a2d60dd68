//! The fixed outer frame plus a user-configurable inner frame of request
//! and response modifiers, with response modifiers running in reverse
//! insertion order (spec.md §4.8).

use std::sync::Arc;

use forwarder_core::Strng;

use crate::credentials::CredentialsMatcher;
use crate::error::ProxyError;
use crate::hostmatcher::Matcher;
use crate::http::{Request, Response};
use crate::telemetry::log::RequestLog;

/// What to do with requests targeting a loopback alias (spec.md §4.8 item 2,
/// §4.9 item 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocalhostPolicy {
	Allow,
	#[default]
	Deny,
	Direct,
}

/// A single request- or response-header edit, parsed from one of:
/// `name: value` (add), `name;` (set empty), `-name` (remove), `-name*`
/// (remove by prefix). Spec parsing is strict — invalid specs fail
/// construction, never at runtime (spec.md §4.8).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderEdit {
	Set(Strng, Strng),
	Remove(Strng),
	RemovePrefix(Strng),
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum HeaderEditError {
	#[error("empty header spec")]
	Empty,
	#[error("invalid header spec {0:?}")]
	Invalid(String),
}

impl HeaderEdit {
	pub fn parse(spec: &str) -> Result<Self, HeaderEditError> {
		if spec.is_empty() {
			return Err(HeaderEditError::Empty);
		}
		if let Some(rest) = spec.strip_prefix('-') {
			return if let Some(prefix) = rest.strip_suffix('*') {
				if prefix.is_empty() {
					Err(HeaderEditError::Invalid(spec.to_string()))
				} else {
					Ok(HeaderEdit::RemovePrefix(prefix.into()))
				}
			} else if rest.is_empty() {
				Err(HeaderEditError::Invalid(spec.to_string()))
			} else {
				Ok(HeaderEdit::Remove(rest.into()))
			};
		}
		match spec.split_once(':') {
			Some((name, value)) if !name.is_empty() => Ok(HeaderEdit::Set(name.trim().into(), value.trim().into())),
			_ => {
				if let Some(name) = spec.strip_suffix(';')
					&& !name.is_empty()
				{
					Ok(HeaderEdit::Set(name.trim().into(), "".into()))
				} else {
					Err(HeaderEditError::Invalid(spec.to_string()))
				}
			},
		}
	}

	pub fn apply(&self, headers: &mut http::HeaderMap) {
		match self {
			HeaderEdit::Set(name, value) => {
				if let (Ok(name), Ok(value)) = (
					http::HeaderName::try_from(name.as_str()),
					http::HeaderValue::try_from(value.as_str()),
				) {
					headers.insert(name, value);
				}
			},
			HeaderEdit::Remove(name) => {
				if let Ok(name) = http::HeaderName::try_from(name.as_str()) {
					headers.remove(name);
				}
			},
			HeaderEdit::RemovePrefix(prefix) => {
				let to_remove: Vec<_> = headers
					.keys()
					.filter(|k| k.as_str().starts_with(prefix.as_str()))
					.cloned()
					.collect();
				for k in to_remove {
					headers.remove(k);
				}
			},
		}
	}
}

/// Request-path capability every modifier (outer or inner) implements.
pub trait ModifyRequest: Send + Sync {
	/// Returning `Ok(Some(response))` short-circuits the rest of the
	/// pipeline (used by the outer auth/deny frame).
	fn modify_request(&self, log: &mut RequestLog, req: &mut Request) -> Result<Option<Response>, ProxyError>;
}

/// Response-path capability. Response modifiers never fail: by the time a
/// response exists the request has already succeeded or been mapped to an
/// error response.
pub trait ModifyResponse: Send + Sync {
	fn modify_response(&self, log: &mut RequestLog, resp: &mut Response);
}

pub struct HeaderRequestModifier {
	pub edits: Vec<HeaderEdit>,
}

impl ModifyRequest for HeaderRequestModifier {
	fn modify_request(&self, _log: &mut RequestLog, req: &mut Request) -> Result<Option<Response>, ProxyError> {
		for edit in &self.edits {
			edit.apply(req.headers_mut());
		}
		Ok(None)
	}
}

pub struct HeaderResponseModifier {
	pub edits: Vec<HeaderEdit>,
}

impl ModifyResponse for HeaderResponseModifier {
	fn modify_response(&self, _log: &mut RequestLog, resp: &mut Response) {
		for edit in &self.edits {
			edit.apply(resp.headers_mut());
		}
	}
}

/// Always-last request modifier: when no `Authorization` header is
/// present and the destination matches a site credential, attach one
/// (spec.md §4.8).
pub struct SiteCredentialsModifier {
	pub matcher: Arc<CredentialsMatcher>,
}

impl ModifyRequest for SiteCredentialsModifier {
	fn modify_request(&self, _log: &mut RequestLog, req: &mut Request) -> Result<Option<Response>, ProxyError> {
		if req.headers().contains_key(http::header::AUTHORIZATION) {
			return Ok(None);
		}
		if let Some(creds) = self.matcher.match_url(req.uri())
			&& let Ok(value) = http::HeaderValue::try_from(creds.basic_auth_value())
		{
			req.headers_mut().insert(http::header::AUTHORIZATION, value);
		}
		Ok(None)
	}
}

/// Constant-time-compared proxy authentication: the server-wide
/// `--basic-auth user[:pass]` credential, distinct from per-site
/// credentials (spec.md §4.8 item 1).
pub struct ProxyAuthModifier {
	pub username: Strng,
	pub password: Strng,
	pub realm: String,
}

impl ModifyRequest for ProxyAuthModifier {
	fn modify_request(&self, _log: &mut RequestLog, req: &mut Request) -> Result<Option<Response>, ProxyError> {
		let Some(header) = req.headers().get(http::header::PROXY_AUTHORIZATION) else {
			return Err(ProxyError::AuthenticationRequired { realm: self.realm.clone() });
		};
		let Ok(value) = header.to_str() else {
			return Err(ProxyError::AuthenticationRequired { realm: self.realm.clone() });
		};
		let Some(encoded) = value.strip_prefix("Basic ") else {
			return Err(ProxyError::AuthenticationRequired { realm: self.realm.clone() });
		};
		use base64::Engine;
		let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded.trim()) else {
			return Err(ProxyError::AuthenticationRequired { realm: self.realm.clone() });
		};
		let decoded = String::from_utf8_lossy(&decoded);
		let (user, pass) = decoded.split_once(':').unwrap_or((decoded.as_ref(), ""));

		let ok = constant_time_eq(user.as_bytes(), self.username.as_bytes())
			& constant_time_eq(pass.as_bytes(), self.password.as_bytes());
		if ok {
			Ok(None)
		} else {
			Err(ProxyError::AuthenticationRequired { realm: self.realm.clone() })
		}
	}
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}
	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}
	diff == 0
}

/// Localhost-deny outer modifier: fails closed on any request whose target
/// resolves to a configured loopback alias, unless policy is `allow`
/// (`direct` is handled in the router instead, per spec.md §4.9 item 2).
pub struct LocalhostDenyModifier {
	pub policy: LocalhostPolicy,
	pub aliases: Arc<[String]>,
}

impl LocalhostDenyModifier {
	pub fn is_loopback_alias(&self, host: &str) -> bool {
		is_loopback_host(host) || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(host))
	}
}

impl ModifyRequest for LocalhostDenyModifier {
	fn modify_request(&self, _log: &mut RequestLog, req: &mut Request) -> Result<Option<Response>, ProxyError> {
		if self.policy != LocalhostPolicy::Deny {
			return Ok(None);
		}
		let Some(host) = req.uri().host() else {
			return Ok(None);
		};
		if self.is_loopback_alias(host) {
			return Err(ProxyError::DeniedLocalhost(host.to_string()));
		}
		Ok(None)
	}
}

fn is_loopback_host(host: &str) -> bool {
	if host.eq_ignore_ascii_case("localhost") || host == "::1" {
		return true;
	}
	host.parse::<std::net::Ipv4Addr>().map(|ip| ip.octets()[0] == 127).unwrap_or(false)
}

/// Deny-domains outer modifier: a `HostMatcher` probe of the target
/// hostname (spec.md §4.8 item 3).
pub struct DenyDomainsModifier {
	pub matcher: Matcher,
}

impl ModifyRequest for DenyDomainsModifier {
	fn modify_request(&self, _log: &mut RequestLog, req: &mut Request) -> Result<Option<Response>, ProxyError> {
		let Some(host) = req.uri().host() else {
			return Ok(None);
		};
		if self.matcher.match_str(host) {
			return Err(ProxyError::DeniedDomain(host.to_string()));
		}
		Ok(None)
	}
}

/// Ordered request and response modifiers. Response modifiers execute in
/// strict reverse of the combined (outer ++ inner) request-modifier order
/// so outer-inserted frames wrap inner ones (spec.md §4.8).
pub struct ModifierStack {
	outer_request: Vec<Arc<dyn ModifyRequest>>,
	inner_request: Vec<Arc<dyn ModifyRequest>>,
	response: Vec<Arc<dyn ModifyResponse>>,
	site_credentials: Arc<SiteCredentialsModifier>,
}

impl ModifierStack {
	pub fn new(
		outer_request: Vec<Arc<dyn ModifyRequest>>,
		inner_request: Vec<Arc<dyn ModifyRequest>>,
		response: Vec<Arc<dyn ModifyResponse>>,
		site_credentials: Arc<SiteCredentialsModifier>,
	) -> Self {
		ModifierStack { outer_request, inner_request, response, site_credentials }
	}

	/// Runs only the outer frame (auth, localhost-deny, domain-deny). Used
	/// for CONNECT requests, which skip the inner frame until after MITM
	/// or tunnel establishment (spec.md §2 CONNECT data flow).
	pub fn run_outer(&self, log: &mut RequestLog, req: &mut Request) -> Result<Option<Response>, ProxyError> {
		for m in &self.outer_request {
			if let Some(resp) = m.modify_request(log, req)? {
				return Ok(Some(resp));
			}
		}
		Ok(None)
	}

	/// Runs the inner frame plus the always-last site-credentials
	/// modifier, for non-CONNECT requests (and for MITM-intercepted
	/// requests re-entering the pipeline).
	pub fn run_inner(&self, log: &mut RequestLog, req: &mut Request) -> Result<Option<Response>, ProxyError> {
		for m in &self.inner_request {
			if let Some(resp) = m.modify_request(log, req)? {
				return Ok(Some(resp));
			}
		}
		self.site_credentials.modify_request(log, req)
	}

	/// Runs request modifiers (outer then inner) in full, for a
	/// non-CONNECT request.
	pub fn run_request(&self, log: &mut RequestLog, req: &mut Request) -> Result<Option<Response>, ProxyError> {
		if let Some(resp) = self.run_outer(log, req)? {
			return Ok(Some(resp));
		}
		self.run_inner(log, req)
	}

	/// Runs response modifiers in reverse of the request order: inner
	/// modifiers (last-inserted first) then outer ones.
	pub fn run_response(&self, log: &mut RequestLog, resp: &mut Response) {
		for m in self.response.iter().rev() {
			m.modify_response(log, resp);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn header_edit_parses_every_form() {
		assert_eq!(
			HeaderEdit::parse("X-Foo: bar").unwrap(),
			HeaderEdit::Set("X-Foo".into(), "bar".into())
		);
		assert_eq!(HeaderEdit::parse("X-Foo;").unwrap(), HeaderEdit::Set("X-Foo".into(), "".into()));
		assert_eq!(HeaderEdit::parse("-X-Foo").unwrap(), HeaderEdit::Remove("X-Foo".into()));
		assert_eq!(HeaderEdit::parse("-X-Foo*").unwrap(), HeaderEdit::RemovePrefix("X-Foo".into()));
	}

	#[test]
	fn header_edit_rejects_malformed_specs() {
		assert!(HeaderEdit::parse("").is_err());
		assert!(HeaderEdit::parse("-").is_err());
		assert!(HeaderEdit::parse("-*").is_err());
		assert!(HeaderEdit::parse("novalueoranything").is_err());
	}

	#[test]
	fn constant_time_eq_rejects_length_mismatch_and_wrong_value() {
		assert!(constant_time_eq(b"abc", b"abc"));
		assert!(!constant_time_eq(b"abc", b"abd"));
		assert!(!constant_time_eq(b"abc", b"ab"));
	}

	#[test]
	fn loopback_alias_covers_localhost_and_127_range() {
		let m = LocalhostDenyModifier {
			policy: LocalhostPolicy::Deny,
			aliases: Arc::from(vec!["my-laptop".to_string()]),
		};
		assert!(m.is_loopback_alias("localhost"));
		assert!(m.is_loopback_alias("127.0.0.1"));
		assert!(m.is_loopback_alias("my-laptop"));
		assert!(!m.is_loopback_alias("example.com"));
	}
}
