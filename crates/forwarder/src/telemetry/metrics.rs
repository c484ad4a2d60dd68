//! Prometheus counters/gauges consumed by the hot path (spec.md §2, §5,
//! SPEC_FULL.md §4.15). Callers get an `Arc<Metrics>` and call narrow
//! methods on it; nothing here knows about HTTP routes — mounting
//! `/metrics` is the app crate's job.

use std::sync::Arc;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HostLabel {
	pub host: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabel {
	pub label: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HostDirectionLabel {
	pub host: String,
	pub direction: &'static str,
}

pub struct Metrics {
	pub accept_total: Counter,
	pub accept_errors_total: Counter,
	pub tls_handshake_errors_total: Counter,
	pub active_connections: Gauge,

	pub dialer_dialed_total: Family<HostLabel, Counter>,
	pub dialer_errors_total: Family<HostLabel, Counter>,
	pub dialer_active: Gauge,
	/// Bytes relayed through `DialTrackMode::Traffic`-tracked connections,
	/// per host and direction (spec.md §4.4: "wrapper also counts bytes").
	pub dialer_bytes_total: Family<HostDirectionLabel, Counter>,

	pub mitm_cache_size: Gauge,
	pub mitm_cache_hits_total: Counter,
	pub mitm_cache_misses_total: Counter,

	pub error_total: Family<ErrorLabel, Counter>,
	pub connect_duration_seconds: Histogram,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Arc<Self> {
		let accept_total = Counter::default();
		let accept_errors_total = Counter::default();
		let tls_handshake_errors_total = Counter::default();
		let active_connections = Gauge::default();
		let dialer_dialed_total = Family::<HostLabel, Counter>::default();
		let dialer_errors_total = Family::<HostLabel, Counter>::default();
		let dialer_active = Gauge::default();
		let dialer_bytes_total = Family::<HostDirectionLabel, Counter>::default();
		let mitm_cache_size = Gauge::default();
		let mitm_cache_hits_total = Counter::default();
		let mitm_cache_misses_total = Counter::default();
		let error_total = Family::<ErrorLabel, Counter>::default();
		let connect_duration_seconds =
			Histogram::new([0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 60.0].into_iter());

		registry.register("accept", "accepted inbound connections", accept_total.clone());
		registry.register(
			"accept_errors",
			"failed inbound accept attempts",
			accept_errors_total.clone(),
		);
		registry.register(
			"tls_handshake_errors",
			"failed inbound TLS handshakes",
			tls_handshake_errors_total.clone(),
		);
		registry.register("active_connections", "currently open inbound connections", active_connections.clone());
		registry.register("dialer_dialed", "successful outbound dials per host", dialer_dialed_total.clone());
		registry.register("dialer_errors", "failed outbound dials per host", dialer_errors_total.clone());
		registry.register("dialer_active", "currently open outbound connections", dialer_active.clone());
		registry.register(
			"dialer_bytes",
			"bytes relayed through traffic-tracked outbound connections",
			dialer_bytes_total.clone(),
		);
		registry.register("mitm_cache_size", "forged leaf certificates currently cached", mitm_cache_size.clone());
		registry.register("mitm_cache_hits", "MITM leaf cache hits", mitm_cache_hits_total.clone());
		registry.register("mitm_cache_misses", "MITM leaf cache misses", mitm_cache_misses_total.clone());
		registry.register("error", "synthesized error responses by label", error_total.clone());
		registry.register(
			"connect_duration_seconds",
			"time from CONNECT accept to tunnel established",
			connect_duration_seconds.clone(),
		);

		Arc::new(Metrics {
			accept_total,
			accept_errors_total,
			tls_handshake_errors_total,
			active_connections,
			dialer_dialed_total,
			dialer_errors_total,
			dialer_active,
			dialer_bytes_total,
			mitm_cache_size,
			mitm_cache_hits_total,
			mitm_cache_misses_total,
			error_total,
			connect_duration_seconds,
		})
	}

	pub fn record_error(&self, label: &str) {
		if label == "deny" {
			return;
		}
		self.error_total.get_or_create(&ErrorLabel { label: label.to_string() }).inc();
	}

	pub fn record_dial(&self, host: &str) {
		self.dialer_dialed_total.get_or_create(&HostLabel { host: host.to_string() }).inc();
	}

	pub fn record_dial_error(&self, host: &str) {
		self.dialer_errors_total.get_or_create(&HostLabel { host: host.to_string() }).inc();
	}

	pub fn record_bytes(&self, host: &str, direction: &'static str, n: u64) {
		self
			.dialer_bytes_total
			.get_or_create(&HostDirectionLabel { host: host.to_string(), direction })
			.inc_by(n);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn deny_label_is_excluded_from_error_counter() {
		let mut registry = Registry::default();
		let m = Metrics::new(&mut registry);
		m.record_error("deny");
		m.record_error("unexpected_error");
		assert_eq!(
			m
				.error_total
				.get_or_create(&ErrorLabel { label: "unexpected_error".to_string() })
				.get(),
			1
		);
		assert_eq!(
			m.error_total.get_or_create(&ErrorLabel { label: "deny".to_string() }).get(),
			0
		);
	}
}
