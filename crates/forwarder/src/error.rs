//! The proxy-wide error type and the classifier chain that turns any
//! failure into a well-formed HTTP response (spec §4.12, §7).
//!
//! `ErrorMapper` is deliberately a flat ordered list of classifier
//! functions rather than a cascade of `match`/`errors.as` on a single enum:
//! each classifier is independently testable and the list can be extended
//! without touching the others.

use std::fmt;

use crate::http::{Body, Response, full_body};

/// Every fallible core operation returns this. Variants map 1:1 onto the
/// rows of spec.md §7's error table.
#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
	#[error("malformed request: {0}")]
	MalformedRequest(String),

	#[error("proxy authentication required")]
	AuthenticationRequired { realm: String },

	#[error("proxying is denied to host {0:?}")]
	DeniedLocalhost(String),

	#[error("proxying is denied to host {0:?}")]
	DeniedDomain(String),

	#[error("dns lookup failed for {host}: {source}")]
	DnsResolution {
		host: String,
		#[source]
		source: std::io::Error,
	},

	#[error("dial to {addr} timed out")]
	DialTimeout { addr: String },

	#[error("dial to {addr} failed: {source}")]
	DialFailed {
		addr: String,
		#[source]
		source: std::io::Error,
	},

	#[error("tls handshake to origin failed: {0}")]
	OriginTlsHandshake(String),

	#[error("upstream proxy CONNECT returned {status}")]
	UpstreamConnectStatus { status: http::StatusCode },

	#[error("request timed out")]
	Timeout,

	#[error("shutting down")]
	ShuttingDown,

	#[error("pac resolver error: {0}")]
	Pac(#[from] crate::pac::PacError),

	#[error("mitm engine error: {0}")]
	Mitm(#[from] crate::mitm::MitmError),

	#[error("configuration error: {0}")]
	Config(String),

	#[error("{0}")]
	Other(String),
}

impl ProxyError {
	/// Machine-readable label. `deny` is intentionally excluded from error
	/// metrics per spec §4.12, but the label still flows into
	/// `X-Forwarder-Error` so clients and logs can see why.
	pub fn label(&self) -> &'static str {
		match self {
			ProxyError::MalformedRequest(_) => "malformed_request",
			ProxyError::AuthenticationRequired { .. } => "authentication_required",
			ProxyError::DeniedLocalhost(_) => "denied_localhost",
			ProxyError::DeniedDomain(_) => "denied_domain",
			ProxyError::DnsResolution { .. } => "net_dial",
			ProxyError::DialTimeout { .. } => "net_dial_timeout",
			ProxyError::DialFailed { .. } => "net_dial",
			ProxyError::OriginTlsHandshake(_) => "tls_handshake",
			ProxyError::UpstreamConnectStatus { .. } => "martian_error",
			ProxyError::Timeout => "timeout",
			ProxyError::ShuttingDown => "shutting_down",
			ProxyError::Pac(_) => "pac_error",
			ProxyError::Mitm(_) => "mitm_error",
			ProxyError::Config(_) => "config_error",
			ProxyError::Other(_) => "unexpected_error",
		}
	}

	pub fn is_deny(&self) -> bool {
		matches!(self, ProxyError::DeniedLocalhost(_) | ProxyError::DeniedDomain(_))
	}

	pub fn status(&self) -> http::StatusCode {
		use http::StatusCode as S;
		match self {
			ProxyError::MalformedRequest(_) => S::BAD_REQUEST,
			ProxyError::AuthenticationRequired { .. } => S::PROXY_AUTHENTICATION_REQUIRED,
			ProxyError::DeniedLocalhost(_) | ProxyError::DeniedDomain(_) => S::FORBIDDEN,
			ProxyError::DnsResolution { .. } | ProxyError::DialTimeout { .. } | ProxyError::Timeout => {
				S::GATEWAY_TIMEOUT
			},
			ProxyError::DialFailed { .. } | ProxyError::OriginTlsHandshake(_) => S::BAD_GATEWAY,
			ProxyError::UpstreamConnectStatus { status } => *status,
			ProxyError::ShuttingDown => S::SERVICE_UNAVAILABLE,
			ProxyError::Pac(_) | ProxyError::Mitm(_) | ProxyError::Config(_) | ProxyError::Other(_) => {
				S::INTERNAL_SERVER_ERROR
			},
		}
	}
}

/// Classifies a `ProxyError` into an HTTP response carrying
/// `X-Forwarder-Error: <name> <err>` and a `<name> <msg>\n<err>\n` body, per
/// spec.md §4.12/§7. The "classifier chain" in the spec is realized here as
/// a single exhaustive match, since unlike the Go original we have a closed
/// error enum rather than a sequence of dynamically-typed `error` values to
/// probe in order.
pub struct ErrorMapper {
	pub proxy_name: &'static str,
}

impl ErrorMapper {
	pub fn new(proxy_name: &'static str) -> Self {
		Self { proxy_name }
	}

	pub fn map(&self, err: &ProxyError) -> Response {
		let label = err.label();
		let status = err.status();
		let err_text = err.to_string();
		let body = format!("{} {}\n{}\n", self.proxy_name, label, err_text);

		let mut builder = http::Response::builder()
			.status(status)
			.header("X-Forwarder-Error", format!("{} {}", self.proxy_name, err_text))
			.header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8");

		if let ProxyError::AuthenticationRequired { realm } = err {
			builder = builder.header(
				http::header::PROXY_AUTHENTICATE,
				format!("Basic realm=\"{realm}\""),
			);
		}

		builder
			.body(full_body(body))
			.unwrap_or_else(|_| fallback_response(status))
	}
}

fn fallback_response(status: http::StatusCode) -> Response {
	http::Response::builder()
		.status(status)
		.body(Body::default())
		.expect("static fallback response is always valid")
}

impl fmt::Debug for ErrorMapper {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ErrorMapper").field("proxy_name", &self.proxy_name).finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn deny_is_silent_for_metrics_but_visible_to_client() {
		let err = ProxyError::DeniedDomain("blocked.example".to_string());
		assert!(err.is_deny());
		assert_eq!(err.status(), http::StatusCode::FORBIDDEN);

		let mapper = ErrorMapper::new("forwarder");
		let resp = mapper.map(&err);
		assert_eq!(resp.status(), http::StatusCode::FORBIDDEN);
		assert!(resp.headers().contains_key("X-Forwarder-Error"));
	}

	#[test]
	fn auth_required_carries_challenge() {
		let err = ProxyError::AuthenticationRequired {
			realm: "forwarder".to_string(),
		};
		let mapper = ErrorMapper::new("forwarder");
		let resp = mapper.map(&err);
		assert_eq!(resp.status(), http::StatusCode::PROXY_AUTHENTICATION_REQUIRED);
		assert_eq!(
			resp.headers().get(http::header::PROXY_AUTHENTICATE).unwrap(),
			"Basic realm=\"forwarder\""
		);
	}

	#[test]
	fn upstream_connect_status_passes_through() {
		let err = ProxyError::UpstreamConnectStatus {
			status: http::StatusCode::NOT_FOUND,
		};
		assert_eq!(err.label(), "martian_error");
		assert_eq!(err.status(), http::StatusCode::NOT_FOUND);
	}
}
