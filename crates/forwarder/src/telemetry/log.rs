//! Per-request log accumulator and `tracing-subscriber` wiring
//! (SPEC_FULL.md §4.14). Components append fields to a `RequestLog` as a
//! request moves through the pipeline; the runtime emits one structured
//! event when the request completes, independent of the `trace!`/`debug!`
//! events components emit along the way.

use std::time::Instant;

use indexmap::IndexMap;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Which way the router decided to send a request, recorded for the final
/// log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
	Deny,
	Direct,
	Upstream,
	Mitm,
}

impl RouteDecision {
	pub fn as_str(self) -> &'static str {
		match self {
			RouteDecision::Deny => "deny",
			RouteDecision::Direct => "direct",
			RouteDecision::Upstream => "upstream",
			RouteDecision::Mitm => "mitm",
		}
	}
}

/// Accumulates everything worth logging about one request/connection and
/// emits it as a single `tracing::event!` on `finish`.
#[derive(Debug)]
pub struct RequestLog {
	pub trace_id: String,
	pub remote_addr: Option<std::net::SocketAddr>,
	pub method: Option<String>,
	pub uri: Option<String>,
	pub route: Option<RouteDecision>,
	pub upstream: Option<String>,
	pub status: Option<u16>,
	pub error_label: Option<String>,
	pub intercepted: bool,
	started_at: Instant,
	extra: IndexMap<&'static str, String>,
}

impl RequestLog {
	pub fn new(trace_id: String, remote_addr: Option<std::net::SocketAddr>) -> Self {
		RequestLog {
			trace_id,
			remote_addr,
			method: None,
			uri: None,
			route: None,
			upstream: None,
			status: None,
			error_label: None,
			intercepted: false,
			started_at: Instant::now(),
			extra: IndexMap::new(),
		}
	}

	pub fn with_request(&mut self, method: &http::Method, uri: &http::Uri) {
		self.method = Some(method.to_string());
		self.uri = Some(uri.to_string());
	}

	pub fn set_route(&mut self, route: RouteDecision) {
		self.route = Some(route);
	}

	pub fn set_upstream(&mut self, upstream: impl Into<String>) {
		self.upstream = Some(upstream.into());
	}

	pub fn set_status(&mut self, status: http::StatusCode) {
		self.status = Some(status.as_u16());
	}

	pub fn set_error(&mut self, label: impl Into<String>) {
		self.error_label = Some(label.into());
	}

	pub fn extra(&mut self, key: &'static str, value: impl ToString) {
		self.extra.insert(key, value.to_string());
	}

	/// Emits the final structured log line for this request.
	pub fn finish(&self) {
		let duration_ms = self.started_at.elapsed().as_millis();
		let remote_addr = self.remote_addr.map(|a| a.to_string()).unwrap_or_default();
		tracing::info!(
			target: "forwarder::access",
			trace_id = %self.trace_id,
			remote_addr = %remote_addr,
			method = self.method.as_deref().unwrap_or(""),
			uri = self.uri.as_deref().unwrap_or(""),
			route = self.route.map(RouteDecision::as_str).unwrap_or(""),
			upstream = self.upstream.as_deref().unwrap_or(""),
			status = self.status.unwrap_or(0),
			error = self.error_label.as_deref().unwrap_or(""),
			intercepted = self.intercepted,
			duration_ms = duration_ms as u64,
			"request completed"
		);
	}
}

/// Fields to add to or remove from every structured log event, mirroring
/// the teacher's `RawLoggingFields { remove, add }`.
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LoggingFields {
	#[serde(default)]
	pub remove: Vec<String>,
	#[serde(default)]
	pub add: IndexMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct Config {
	pub filter: String,
	pub fields: LoggingFields,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			filter: "info".to_string(),
			fields: LoggingFields::default(),
		}
	}
}

/// Installs a global `tracing-subscriber` registry with an `EnvFilter`
/// seeded from `cfg.filter` (overridable by `RUST_LOG`) and a JSON
/// formatting layer.
pub fn init(cfg: &Config) -> anyhow::Result<()> {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cfg.filter.clone()));
	let fmt_layer = tracing_subscriber::fmt::layer().with_target(true).json();
	tracing_subscriber::registry().with(filter).with(fmt_layer).try_init()?;
	Ok(())
}
