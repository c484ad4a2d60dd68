//! Per-destination forged leaf certificate cache, keyed by SNI/SAN and
//! signed by a configured CA (spec.md §3, §4.7).

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use hashbrown::HashMap;
use parking_lot::Mutex;
use rcgen::{CertificateParams, DistinguishedName, DnType, Issuer, KeyPair, SanType};
use tokio::sync::broadcast;

use crate::telemetry::metrics::Metrics;

#[derive(thiserror::Error, Debug)]
pub enum MitmError {
	#[error("failed to generate leaf certificate: {0}")]
	Generation(String),
	#[error("failed to load CA material: {0}")]
	CaLoad(String),
}

/// The signing CA: certificate + private key, either loaded from disk or
/// self-signed at startup (self-signed generation is an app-crate concern
/// per spec.md §1; the core only ever signs leaves with what it's given).
pub struct CertificateAuthority {
	pub cert_der: rcgen::CertificateDer<'static>,
	pub key: KeyPair,
	pub params: CertificateParams,
}

impl CertificateAuthority {
	pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, MitmError> {
		let key = KeyPair::from_pem(key_pem).map_err(|e| MitmError::CaLoad(e.to_string()))?;
		let params = CertificateParams::from_ca_cert_pem(cert_pem).map_err(|e| MitmError::CaLoad(e.to_string()))?;
		let cert = params
			.clone()
			.self_signed(&key)
			.map_err(|e| MitmError::CaLoad(e.to_string()))?;
		Ok(CertificateAuthority { cert_der: cert.der().clone(), key, params })
	}

	fn issuer(&self) -> Issuer<'_, KeyPair> {
		Issuer::new(self.params.clone(), &self.key)
	}
}

#[derive(Clone)]
struct CachedLeaf {
	cert_der: rcgen::CertificateDer<'static>,
	key_der: rcgen::PrivatePkcs8KeyDer<'static>,
	expires_at: SystemTime,
}

enum Slot {
	Ready(CachedLeaf),
	/// Another task is generating this leaf; waiters subscribe and
	/// receive the result once it's ready (single-flight coalescing,
	/// spec.md §4.7/§5).
	Pending(broadcast::Sender<CachedLeaf>),
}

/// Forges and caches per-destination leaf certificates. Concurrent lookups
/// for the same key coalesce onto a single generation.
pub struct MitmEngine {
	ca: Arc<CertificateAuthority>,
	org: String,
	validity: Duration,
	capacity: usize,
	metrics: Option<Arc<Metrics>>,
	cache: Mutex<HashMap<String, Slot>>,
	lru: Mutex<Vec<String>>,
}

impl MitmEngine {
	pub fn new(ca: Arc<CertificateAuthority>, org: String, validity: Duration, capacity: usize, metrics: Option<Arc<Metrics>>) -> Self {
		MitmEngine {
			ca,
			org,
			validity,
			capacity,
			metrics,
			cache: Mutex::new(HashMap::new()),
			lru: Mutex::new(Vec::new()),
		}
	}

	/// CA certificate, DER-encoded, for clients that need to trust it out
	/// of band (test harnesses, app-crate bootstrapping).
	pub fn ca_cert_der(&self) -> &rcgen::CertificateDer<'static> {
		&self.ca.cert_der
	}

	/// Builds a single-cert `rustls::ServerConfig` presenting the forged
	/// leaf for `key`, for the client-facing TLS handshake inside a MITM
	/// CONNECT tunnel (spec.md §4.7).
	pub async fn server_config_for(&self, key: &str) -> Result<Arc<rustls::ServerConfig>, MitmError> {
		let (cert_der, key_der) = self.leaf_for(key).await?;
		let private_key = rustls_pki_types::PrivateKeyDer::Pkcs8(key_der);
		let cfg = rustls::ServerConfig::builder()
			.with_no_client_auth()
			.with_single_cert(vec![cert_der], private_key)
			.map_err(|e| MitmError::Generation(e.to_string()))?;
		Ok(Arc::new(cfg))
	}

	/// Returns a cached or freshly-forged leaf for `key` (an SNI hostname
	/// or canonical IP literal), coalescing concurrent requests for the
	/// same key into a single generation.
	pub async fn leaf_for(&self, key: &str) -> Result<(rcgen::CertificateDer<'static>, rcgen::PrivatePkcs8KeyDer<'static>), MitmError> {
		let key = key.to_ascii_lowercase();
		loop {
			let mut rx = {
				let mut cache = self.cache.lock();
				match cache.get(&key) {
					Some(Slot::Ready(leaf)) if leaf.expires_at > SystemTime::now() => {
						let leaf = leaf.clone();
						drop(cache);
						self.touch_lru(&key);
						if let Some(m) = &self.metrics {
							m.mitm_cache_hits_total.inc();
						}
						return Ok((leaf.cert_der, leaf.key_der));
					},
					Some(Slot::Pending(tx)) => tx.subscribe(),
					Some(Slot::Ready(_)) | None => {
						// We're the first to claim this key: insert a Pending
						// slot and generate it ourselves below.
						let (tx, _) = broadcast::channel(1);
						cache.insert(key.clone(), Slot::Pending(tx));
						drop(cache);
						if let Some(m) = &self.metrics {
							m.mitm_cache_misses_total.inc();
						}
						return match self.generate(&key) {
							Ok(leaf) => {
								self.install(&key, leaf.clone());
								Ok((leaf.cert_der, leaf.key_der))
							},
							Err(e) => {
								// Drop the Pending slot (and its sender) so every
								// waiter's rx.recv() below observes a RecvError and
								// retries instead of blocking forever on a
								// generation that never completes.
								self.cache.lock().remove(&key);
								Err(e)
							},
						};
					},
				}
			};
			match rx.recv().await {
				Ok(leaf) => return Ok((leaf.cert_der, leaf.key_der)),
				Err(_) => continue, // generator dropped before sending; retry
			}
		}
	}

	fn generate(&self, key: &str) -> Result<CachedLeaf, MitmError> {
		let mut params = CertificateParams::new(vec![]).map_err(|e| MitmError::Generation(e.to_string()))?;
		let mut dn = DistinguishedName::new();
		dn.push(DnType::CommonName, key);
		dn.push(DnType::OrganizationName, self.org.clone());
		params.distinguished_name = dn;
		params.not_before = time::OffsetDateTime::now_utc() - time::Duration::days(1);
		let expires_at = SystemTime::now() + self.validity;
		params.not_after = time::OffsetDateTime::now_utc() + time::Duration::try_from(self.validity).unwrap_or(time::Duration::days(365));

		let san = if key.parse::<std::net::IpAddr>().is_ok() {
			SanType::IpAddress(key.parse().unwrap())
		} else {
			SanType::DnsName(key.to_string().try_into().map_err(|_| MitmError::Generation(format!("invalid SAN {key}")))?)
		};
		params.subject_alt_names = vec![san];

		let key_pair = KeyPair::generate().map_err(|e| MitmError::Generation(e.to_string()))?;
		let cert = params
			.signed_by(&key_pair, &self.ca.issuer())
			.map_err(|e| MitmError::Generation(e.to_string()))?;

		Ok(CachedLeaf {
			cert_der: cert.der().clone(),
			key_der: key_pair.serialize_der().try_into().map_err(|_| MitmError::Generation("key encoding failed".to_string()))?,
			expires_at,
		})
	}

	fn install(&self, key: &str, leaf: CachedLeaf) {
		let mut cache = self.cache.lock();
		if let Some(Slot::Pending(tx)) = cache.remove(key) {
			let _ = tx.send(leaf.clone());
		}
		cache.insert(key.to_string(), Slot::Ready(leaf));
		drop(cache);

		self.touch_lru(key);
	}

	/// Moves `key` to the most-recently-used end, evicting the least
	/// recently used entries beyond `capacity`. Called both on insert and
	/// on a cache hit so eviction order reflects actual recency of use.
	fn touch_lru(&self, key: &str) {
		let mut lru = self.lru.lock();
		lru.retain(|k| k != key);
		lru.push(key.to_string());
		while lru.len() > self.capacity {
			let evicted = lru.remove(0);
			self.cache.lock().remove(&evicted);
		}
		if let Some(m) = &self.metrics {
			m.mitm_cache_size.set(lru.len() as i64);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn test_ca() -> Arc<CertificateAuthority> {
		let key = KeyPair::generate().unwrap();
		let mut params = CertificateParams::new(vec!["Test CA".to_string()]).unwrap();
		params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
		let cert = params.clone().self_signed(&key).unwrap();
		Arc::new(CertificateAuthority { cert_der: cert.der().clone(), key, params })
	}

	#[tokio::test]
	async fn forges_and_caches_a_leaf() {
		let engine = MitmEngine::new(test_ca(), "Forwarder Test".to_string(), Duration::from_secs(3600), 10, None);
		let (cert1, _) = engine.leaf_for("api.example").await.unwrap();
		let (cert2, _) = engine.leaf_for("api.example").await.unwrap();
		assert_eq!(cert1.as_ref(), cert2.as_ref(), "second lookup should hit the cache");
	}

	#[tokio::test]
	async fn concurrent_requests_for_same_key_coalesce() {
		let engine = Arc::new(MitmEngine::new(test_ca(), "Forwarder Test".to_string(), Duration::from_secs(3600), 10, None));
		let mut handles = Vec::new();
		for _ in 0..8 {
			let engine = engine.clone();
			handles.push(tokio::spawn(async move { engine.leaf_for("shared.example").await.unwrap() }));
		}
		let mut results = Vec::new();
		for h in handles {
			results.push(h.await.unwrap());
		}
		let first = &results[0].0;
		for (cert, _) in &results[1..] {
			assert_eq!(cert.as_ref(), first.as_ref());
		}
	}

	#[tokio::test]
	async fn failed_generation_does_not_wedge_future_callers() {
		// Not a valid DNS name or IP literal, so `generate` fails building
		// the SAN. Both the first caller and a concurrent waiter must
		// observe the error rather than block forever on a Pending slot
		// whose generator never sends.
		let bad_key = "bad\u{1F600}host";
		let engine = Arc::new(MitmEngine::new(test_ca(), "Forwarder Test".to_string(), Duration::from_secs(3600), 10, None));

		let waiter = tokio::spawn({
			let engine = engine.clone();
			async move { engine.leaf_for(bad_key).await }
		});

		let first = tokio::time::timeout(Duration::from_secs(5), engine.leaf_for(bad_key))
			.await
			.expect("leaf_for must not hang on a failed generation");
		assert!(matches!(first, Err(MitmError::Generation(_))));

		let second = tokio::time::timeout(Duration::from_secs(5), waiter)
			.await
			.expect("concurrent waiter must not hang on a failed generation")
			.unwrap();
		assert!(matches!(second, Err(MitmError::Generation(_))));

		assert!(engine.cache.lock().get(bad_key).is_none(), "failed key must not linger in the cache");
	}

	#[tokio::test]
	async fn lru_refreshes_recency_on_cache_hit() {
		let engine = MitmEngine::new(test_ca(), "Forwarder Test".to_string(), Duration::from_secs(3600), 2, None);
		engine.leaf_for("a.example").await.unwrap();
		engine.leaf_for("b.example").await.unwrap();
		// Touch "a" again so it becomes the most recently used entry.
		engine.leaf_for("a.example").await.unwrap();
		engine.leaf_for("c.example").await.unwrap();

		let lru = engine.lru.lock();
		assert_eq!(lru.len(), 2);
		assert!(lru.contains(&"a.example".to_string()), "recently-touched entry should survive eviction");
		assert!(!lru.contains(&"b.example".to_string()), "least recently used entry should be evicted");
	}

	#[tokio::test]
	async fn lru_evicts_beyond_capacity() {
		let engine = MitmEngine::new(test_ca(), "Forwarder Test".to_string(), Duration::from_secs(3600), 2, None);
		engine.leaf_for("a.example").await.unwrap();
		engine.leaf_for("b.example").await.unwrap();
		engine.leaf_for("c.example").await.unwrap();
		assert_eq!(engine.lru.lock().len(), 2);
		assert!(!engine.lru.lock().contains(&"a.example".to_string()));
	}
}
