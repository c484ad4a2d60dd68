//! HTTP plumbing shared across the proxy request path: the `Body`/`Request`/
//! `Response` aliases every component passes around, and the hop-by-hop
//! header list the dispatcher strips before forwarding.

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type Body = http_body_util::combinators::BoxBody<Bytes, BoxError>;
pub type Request = http::Request<Body>;
pub type Response = http::Response<Body>;

pub fn empty_body() -> Body {
	Empty::new().map_err(|never| match never {}).boxed()
}

pub fn full_body(data: impl Into<Bytes>) -> Body {
	Full::new(data.into()).map_err(|never| match never {}).boxed()
}

pub fn incoming_body(incoming: hyper::body::Incoming) -> Body {
	incoming.map_err(|e| Box::new(e) as BoxError).boxed()
}

/// Headers defined by RFC 7230 §6.1 that apply to a single transport hop and
/// must never be forwarded unchanged. `Upgrade` and `Connection` are
/// special-cased by the dispatcher for legitimate upgrade requests.
pub const HOP_BY_HOP_HEADERS: &[http::HeaderName] = &[
	http::header::CONNECTION,
	http::header::PROXY_AUTHORIZATION,
	http::header::TE,
	http::header::TRAILER,
	http::header::TRANSFER_ENCODING,
	http::header::UPGRADE,
];

pub static PROXY_CONNECTION: http::HeaderName = http::HeaderName::from_static("proxy-connection");
pub static KEEP_ALIVE: http::HeaderName = http::HeaderName::from_static("keep-alive");

/// Strip hop-by-hop headers from `headers`, preserving `Upgrade`/`Connection`
/// when `is_upgrade` (a legitimate WebSocket-style upgrade) is set.
pub fn strip_hop_by_hop(headers: &mut http::HeaderMap, is_upgrade: bool) {
	headers.remove(&PROXY_CONNECTION);
	headers.remove(&KEEP_ALIVE);
	for name in HOP_BY_HOP_HEADERS {
		if is_upgrade && (*name == http::header::CONNECTION || *name == http::header::UPGRADE) {
			continue;
		}
		headers.remove(name);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn strips_hop_by_hop_but_keeps_upgrade_when_requested() {
		let mut headers = http::HeaderMap::new();
		headers.insert(http::header::CONNECTION, "upgrade".parse().unwrap());
		headers.insert(http::header::UPGRADE, "websocket".parse().unwrap());
		headers.insert(http::header::TRANSFER_ENCODING, "chunked".parse().unwrap());
		headers.insert(PROXY_CONNECTION.clone(), "keep-alive".parse().unwrap());

		strip_hop_by_hop(&mut headers, true);
		assert!(headers.contains_key(http::header::CONNECTION));
		assert!(headers.contains_key(http::header::UPGRADE));
		assert!(!headers.contains_key(http::header::TRANSFER_ENCODING));
		assert!(!headers.contains_key(&PROXY_CONNECTION));

		headers.insert(http::header::CONNECTION, "keep-alive".parse().unwrap());
		strip_hop_by_hop(&mut headers, false);
		assert!(!headers.contains_key(http::header::CONNECTION));
	}
}
