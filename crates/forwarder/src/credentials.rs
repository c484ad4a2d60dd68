//! Four-tier credentials lookup used both for site auth (inject
//! `Authorization` on the way to the origin) and upstream auth (attach
//! `Proxy-Authorization` for a configured upstream) — spec.md §3, §4.2.

use std::collections::HashMap;

use forwarder_core::Strng;

use crate::addressing::{HostPortUser, Userinfo, WILDCARD_HOST, WILDCARD_PORT};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum CredentialsError {
	#[error("duplicate credentials entry for {0}")]
	Duplicate(String),
}

/// Immutable, four-tier index: exact `host:port` > wildcard-host (`*:port`)
/// > wildcard-port (`host:0`) > global (`*:0`). Construction fails if two
/// entries collide within the same tier.
#[derive(Debug, Clone, Default)]
pub struct CredentialsMatcher {
	exact: HashMap<(Strng, u16), Userinfo>,
	wildcard_host: HashMap<u16, Userinfo>,
	wildcard_port: HashMap<Strng, Userinfo>,
	global: Option<Userinfo>,
}

impl CredentialsMatcher {
	pub fn build(entries: impl IntoIterator<Item = HostPortUser>) -> Result<Self, CredentialsError> {
		let mut m = CredentialsMatcher::default();
		for e in entries {
			let is_wild_host = e.host.as_str() == WILDCARD_HOST;
			let is_wild_port = e.port == WILDCARD_PORT;
			match (is_wild_host, is_wild_port) {
				(true, true) => {
					if m.global.is_some() {
						return Err(CredentialsError::Duplicate("*:*".to_string()));
					}
					m.global = Some(e.userinfo);
				},
				(true, false) => {
					if m.wildcard_host.insert(e.port, e.userinfo).is_some() {
						return Err(CredentialsError::Duplicate(format!("*:{}", e.port)));
					}
				},
				(false, true) => {
					if m.wildcard_port.insert(e.host.clone(), e.userinfo).is_some() {
						return Err(CredentialsError::Duplicate(format!("{}:*", e.host)));
					}
				},
				(false, false) => {
					let key = (e.host.clone(), e.port);
					if m.exact.insert(key, e.userinfo).is_some() {
						return Err(CredentialsError::Duplicate(format!("{}:{}", e.host, e.port)));
					}
				},
			}
		}
		Ok(m)
	}

	/// Probes tiers in priority order: exact > wildcard-host > wildcard-port
	/// > global.
	pub fn match_hostport(&self, host: &str, port: u16) -> Option<&Userinfo> {
		self
			.exact
			.get(&(host.into(), port))
			.or_else(|| self.wildcard_host.get(&port))
			.or_else(|| self.wildcard_port.get(host))
			.or(self.global.as_ref())
	}

	/// Same lookup, but derives `host:port` from a proxy/request URL,
	/// defaulting the port to 80/443 for http/https and refusing to guess
	/// for any other scheme (spec.md §4.2).
	pub fn match_url(&self, uri: &http::Uri) -> Option<&Userinfo> {
		let host = uri.host()?;
		let port = match uri.port_u16() {
			Some(p) => p,
			None => match uri.scheme_str() {
				Some("http") => 80,
				Some("https") => 443,
				_ => return None,
			},
		};
		self.match_hostport(host, port)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn entry(s: &str) -> HostPortUser {
		HostPortUser::parse(s).unwrap()
	}

	#[test]
	fn exact_wins_over_everything() {
		let m = CredentialsMatcher::build([
			entry("g:gp@*:0"),
			entry("wp:wpp@host:0"),
			entry("wh:whp@*:443"),
			entry("e:ep@host:443"),
		])
		.unwrap();
		assert_eq!(m.match_hostport("host", 443).unwrap().username.as_str(), "e");
	}

	#[test]
	fn wildcard_host_beats_wildcard_port_and_global() {
		let m = CredentialsMatcher::build([entry("g:gp@*:0"), entry("wp:wpp@host:0"), entry("wh:whp@*:443")])
			.unwrap();
		assert_eq!(m.match_hostport("host", 443).unwrap().username.as_str(), "wh");
		assert_eq!(m.match_hostport("other", 443).unwrap().username.as_str(), "wh");
	}

	#[test]
	fn wildcard_port_beats_global_for_its_host() {
		let m = CredentialsMatcher::build([entry("g:gp@*:0"), entry("wp:wpp@host:0")]).unwrap();
		assert_eq!(m.match_hostport("host", 9999).unwrap().username.as_str(), "wp");
		assert_eq!(m.match_hostport("other", 9999).unwrap().username.as_str(), "g");
	}

	#[test]
	fn duplicate_within_a_tier_fails_construction() {
		let err = CredentialsMatcher::build([entry("a:1@host:443"), entry("b:2@host:443")]).unwrap_err();
		assert_eq!(err, CredentialsError::Duplicate("host:443".to_string()));
	}

	#[test]
	fn match_url_defaults_port_by_scheme() {
		let m = CredentialsMatcher::build([entry("u:p@example.com:443")]).unwrap();
		let uri: http::Uri = "https://example.com/".parse().unwrap();
		assert!(m.match_url(&uri).is_some());
		let uri: http::Uri = "ftp://example.com/".parse().unwrap();
		assert!(m.match_url(&uri).is_none());
	}
}
