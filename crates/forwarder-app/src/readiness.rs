//! `GET /healthz` and `GET /metrics` (spec.md §6 [ADDED]): the app crate's
//! own HTTP surface, entirely separate from the proxy listener(s) the core
//! binds. The core hands this module only an `Arc<Registry>`/readiness
//! flag; it has no notion of HTTP routes for its own observability.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
struct ReadinessState {
	ready: Arc<AtomicBool>,
	registry: Arc<Registry>,
}

/// Marks the readiness flag `/healthz` reports on; set once the first
/// proxy listener has bound.
#[derive(Clone, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
	pub fn new() -> Self {
		Readiness(Arc::new(AtomicBool::new(false)))
	}

	pub fn mark_ready(&self) {
		self.0.store(true, Ordering::SeqCst);
	}
}

async fn healthz(State(state): State<ReadinessState>) -> impl IntoResponse {
	if state.ready.load(Ordering::SeqCst) {
		(StatusCode::OK, "ok")
	} else {
		(StatusCode::SERVICE_UNAVAILABLE, "not ready")
	}
}

async fn metrics(State(state): State<ReadinessState>) -> impl IntoResponse {
	let mut buf = String::new();
	match encode(&mut buf, &state.registry) {
		Ok(()) => (StatusCode::OK, [("content-type", "application/openmetrics-text; version=1.0.0; charset=utf-8")], buf).into_response(),
		Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
	}
}

/// Serves `/healthz` and `/metrics` on `addr` until `shutdown` is
/// cancelled.
pub async fn serve(addr: std::net::SocketAddr, readiness: Readiness, registry: Arc<Registry>, shutdown: CancellationToken) -> std::io::Result<()> {
	let state = ReadinessState { ready: readiness.0, registry };
	let app = Router::new().route("/healthz", get(healthz)).route("/metrics", get(metrics)).with_state(state);

	let listener = TcpListener::bind(addr).await?;
	axum::serve(listener, app)
		.with_graceful_shutdown(async move { shutdown.cancelled().await })
		.await
}
