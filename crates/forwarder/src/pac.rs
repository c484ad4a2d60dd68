//! The external PAC contract and directive parsing (spec.md §4.6, §6).
//! The core depends only on `FindProxyForURL`; evaluating the script
//! itself (a JS engine, file/HTTP loading) is an app-crate concern.

use std::future::Future;
use std::pin::Pin;

use crate::addressing::{AddrError, ProxyURL};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PacError {
	#[error("PAC script produced an empty result")]
	Empty,
	#[error("invalid PAC directive {0:?}")]
	InvalidDirective(String),
	#[error("invalid proxy address in directive {0:?}: {1}")]
	InvalidAddress(String, String),
	#[error("PAC resolver failed: {0}")]
	ResolverFailed(String),
}

impl From<AddrError> for String {
	fn from(e: AddrError) -> Self {
		e.to_string()
	}
}

/// External collaborator contract: given the request URL and bare
/// hostname, return a PAC result string (a `; `-separated directive
/// list). The core has no other knowledge of PAC semantics. Returns a
/// boxed future (rather than an `async fn`) so the trait stays
/// object-safe — the runtime holds this behind an `Arc<dyn PacResolver>`.
pub trait PacResolver: Send + Sync {
	fn find_proxy_for_url<'a>(
		&'a self,
		url: &'a str,
		hostname: &'a str,
	) -> Pin<Box<dyn Future<Output = Result<String, PacError>> + Send + 'a>>;
}

/// One directive from a PAC result string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacDirective {
	Direct,
	Proxy(ProxyURL),
}

/// Parses a PAC result (`DIRECT`, `PROXY host:port`, `HTTP host:port`,
/// `HTTPS host:port`, `SOCKS host:port`, `SOCKS5 host:port`, `; `-joined)
/// and returns only the first directive (spec.md §4.6, §9 Open Question
/// (b): the core never attempts failover to subsequent directives).
pub fn select_first_directive(result: &str) -> Result<PacDirective, PacError> {
	if result.trim().is_empty() {
		return Err(PacError::Empty);
	}
	let first = result.split(';').map(str::trim).find(|s| !s.is_empty()).ok_or(PacError::Empty)?;
	parse_directive(first)
}

fn parse_directive(directive: &str) -> Result<PacDirective, PacError> {
	let mut parts = directive.splitn(2, char::is_whitespace);
	let kind = parts.next().unwrap_or("").to_uppercase();
	let rest = parts.next().map(str::trim).unwrap_or("");

	match kind.as_str() {
		"DIRECT" => Ok(PacDirective::Direct),
		"PROXY" | "HTTP" => parse_proxy_addr(directive, rest, "http"),
		"HTTPS" => parse_proxy_addr(directive, rest, "https"),
		"SOCKS" | "SOCKS5" => parse_proxy_addr(directive, rest, "socks5"),
		_ => Err(PacError::InvalidDirective(directive.to_string())),
	}
}

fn parse_proxy_addr(directive: &str, hostport: &str, scheme: &str) -> Result<PacDirective, PacError> {
	if hostport.is_empty() {
		return Err(PacError::InvalidDirective(directive.to_string()));
	}
	let url = ProxyURL::parse(&format!("{scheme}://{hostport}"))
		.map_err(|e| PacError::InvalidAddress(directive.to_string(), e.to_string()))?;
	Ok(PacDirective::Proxy(url))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn direct_is_recognized() {
		assert_eq!(select_first_directive("DIRECT").unwrap(), PacDirective::Direct);
	}

	#[test]
	fn only_the_first_directive_is_used() {
		let result = "PROXY proxy1:8080; PROXY proxy2:8080; DIRECT";
		let PacDirective::Proxy(url) = select_first_directive(result).unwrap() else {
			panic!("expected proxy directive");
		};
		assert_eq!(url.host.as_str(), "proxy1");
		assert_eq!(url.port, 8080);
	}

	#[test]
	fn socks5_directive() {
		let PacDirective::Proxy(url) = select_first_directive("SOCKS5 s.example:1080").unwrap() else {
			panic!("expected proxy directive");
		};
		assert_eq!(url.to_string(), "socks5://s.example:1080");
	}

	#[test]
	fn empty_result_is_an_error() {
		assert_eq!(select_first_directive("").unwrap_err(), PacError::Empty);
		assert_eq!(select_first_directive("   ").unwrap_err(), PacError::Empty);
	}

	#[test]
	fn unknown_directive_is_an_error() {
		assert!(matches!(
			select_first_directive("BOGUS foo:80").unwrap_err(),
			PacError::InvalidDirective(_)
		));
	}
}
