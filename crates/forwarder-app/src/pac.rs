//! A constrained PAC script loader: the core only depends on
//! `PacResolver::find_proxy_for_url` (spec.md §4.6, §6); evaluating the
//! script itself is this crate's job. No JS engine exists anywhere in the
//! dependency stack this project draws on, so rather than fabricate one
//! this is a small pattern-based interpreter: it recognizes the single
//! most common `FindProxyForURL` shape — one or more `if (condition)
//! return "result";` clauses followed by a final unconditional `return
//! "result";` — and evaluates only the conditions `shExpMatch(host,
//! pattern)` and `dnsDomainIs(host, suffix)`, in source order, the same
//! way a real PAC engine would short-circuit on the first matching
//! `if`. Anything else in the script (helper functions, unrecognized
//! conditions) is ignored rather than rejected, so a script written for a
//! real JS engine still produces a sensible result for the common case.
//! Remote (`http://`/`https://`) PAC URLs are not fetched (spec.md §9 (c)
//! is silent on this but the core's `--pac` contract is local-file only
//! here).

use std::sync::Arc;

use forwarder::pac::{PacError, PacResolver};
use std::future::Future;
use std::pin::Pin;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Condition {
	Always,
	ShExpMatch(String),
	DnsDomainIs(String),
}

#[derive(Debug, Clone)]
struct Clause {
	condition: Condition,
	result: String,
}

/// Evaluates a constrained subset of PAC script source (see module docs).
pub struct ScriptPacResolver {
	clauses: Vec<Clause>,
}

impl ScriptPacResolver {
	pub fn parse(source: &str) -> Result<Self, PacError> {
		let mut clauses = Vec::new();
		for line in source.lines() {
			let line = line.trim();
			if let Some(clause) = parse_if_return(line) {
				clauses.push(clause);
			} else if let Some(result) = parse_bare_return(line) {
				clauses.push(Clause { condition: Condition::Always, result });
			}
		}
		if clauses.is_empty() {
			return Err(PacError::Empty);
		}
		Ok(ScriptPacResolver { clauses })
	}

	fn evaluate(&self, hostname: &str) -> Option<&str> {
		for clause in &self.clauses {
			let matched = match &clause.condition {
				Condition::Always => true,
				Condition::ShExpMatch(pattern) => sh_exp_match(hostname, pattern),
				Condition::DnsDomainIs(suffix) => hostname == suffix.trim_start_matches('.') || hostname.ends_with(&format!(".{}", suffix.trim_start_matches('.'))),
			};
			if matched {
				return Some(&clause.result);
			}
		}
		None
	}
}

impl PacResolver for ScriptPacResolver {
	fn find_proxy_for_url<'a>(&'a self, _url: &'a str, hostname: &'a str) -> Pin<Box<dyn Future<Output = Result<String, PacError>> + Send + 'a>> {
		Box::pin(async move { self.evaluate(hostname).map(str::to_string).ok_or(PacError::Empty) })
	}
}

/// Loads a PAC script from the configured source and wraps it as a
/// [`PacResolver`] the core's [`forwarder::Config::with_pac`] can consume.
pub fn load(source: &str) -> Result<Arc<dyn PacResolver>, PacError> {
	Ok(Arc::new(ScriptPacResolver::parse(source)?))
}

fn parse_if_return(line: &str) -> Option<Clause> {
	let line = line.strip_prefix("if")?.trim_start();
	let (cond, rest) = line.strip_prefix('(').and_then(|l| l.split_once(')'))?;
	let result = parse_bare_return(rest.trim().trim_start_matches('{').trim())?;
	Some(Clause { condition: parse_condition(cond.trim())?, result })
}

fn parse_condition(cond: &str) -> Option<Condition> {
	if let Some(args) = cond.strip_prefix("shExpMatch(").and_then(|s| s.strip_suffix(')')) {
		let (_, pattern) = args.split_once(',')?;
		return Some(Condition::ShExpMatch(unquote(pattern.trim())));
	}
	if let Some(args) = cond.strip_prefix("dnsDomainIs(").and_then(|s| s.strip_suffix(')')) {
		let (_, suffix) = args.split_once(',')?;
		return Some(Condition::DnsDomainIs(unquote(suffix.trim())));
	}
	None
}

fn parse_bare_return(line: &str) -> Option<String> {
	let line = line.trim().trim_end_matches(';').trim_end_matches('}').trim();
	let rest = line.strip_prefix("return")?.trim();
	Some(unquote(rest))
}

fn unquote(s: &str) -> String {
	s.trim().trim_matches('"').trim_matches('\'').to_string()
}

/// Shell-style glob match supporting only `*` and `?`, the two wildcards
/// `shExpMatch` uses in practice.
fn sh_exp_match(s: &str, pattern: &str) -> bool {
	fn matches(s: &[u8], p: &[u8]) -> bool {
		match (s.first(), p.first()) {
			(_, Some(b'*')) => matches(s, &p[1..]) || (!s.is_empty() && matches(&s[1..], p)),
			(Some(_), Some(b'?')) => matches(&s[1..], &p[1..]),
			(Some(sc), Some(pc)) => sc == pc && matches(&s[1..], &p[1..]),
			(None, None) => true,
			_ => false,
		}
	}
	matches(s.as_bytes(), pattern.as_bytes())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn direct_for_intranet_suffix() {
		let script = r#"
			function FindProxyForURL(url, host) {
				if (dnsDomainIs(host, ".corp")) return "DIRECT";
				return "PROXY proxy.example:8080";
			}
		"#;
		let resolver = ScriptPacResolver::parse(script).unwrap();
		assert_eq!(resolver.find_proxy_for_url("http://intranet.corp/", "intranet.corp").await.unwrap(), "DIRECT");
		assert_eq!(resolver.find_proxy_for_url("http://elsewhere.example/", "elsewhere.example").await.unwrap(), "PROXY proxy.example:8080");
	}

	#[tokio::test]
	async fn sh_exp_match_glob() {
		let script = r#"
			function FindProxyForURL(url, host) {
				if (shExpMatch(host, "*.internal.example")) return "DIRECT";
				return "PROXY proxy.example:8080";
			}
		"#;
		let resolver = ScriptPacResolver::parse(script).unwrap();
		assert_eq!(resolver.find_proxy_for_url("http://api.internal.example/", "api.internal.example").await.unwrap(), "DIRECT");
	}

	#[test]
	fn empty_script_is_an_error() {
		assert!(matches!(ScriptPacResolver::parse("").unwrap_err(), PacError::Empty));
	}
}
