//! Outbound HTTP/1.1 client connections to an origin or an upstream proxy:
//! dial, optionally wrap in TLS, perform the hyper handshake, and drive the
//! connection on a background task (spec.md §4.4, §4.11).

use std::sync::Arc;

use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use rustls_pki_types::ServerName;

use crate::addressing::Scheme;
use crate::dialer::{DialTrackMode, Dialer};
use crate::error::ProxyError;
use crate::http::Body;

/// Builds the `rustls::ClientConfig` used for every TLS dial to an origin
/// or upstream proxy. `skip_verify` disables certificate verification
/// globally, matching the core's one escape hatch for broken origins
/// (spec.md §9 Open Question (c)). `extra_root_pem`, when set, is added to
/// the platform's native root store (`--cacert-file`, spec.md §6); it has
/// no effect when `skip_verify` is set.
pub fn build_tls_client_config(skip_verify: bool, extra_root_pem: Option<&str>) -> Result<Arc<rustls::ClientConfig>, ProxyError> {
	if skip_verify {
		let cfg = rustls::ClientConfig::builder()
			.dangerous()
			.with_custom_certificate_verifier(Arc::new(NoVerify))
			.with_no_client_auth();
		return Ok(Arc::new(cfg));
	}

	let mut roots = rustls::RootCertStore::empty();
	for cert in rustls_native_certs::load_native_certs().certs {
		let _ = roots.add(cert);
	}
	if let Some(pem) = extra_root_pem {
		for cert in rustls_pemfile::certs(&mut pem.as_bytes()).flatten() {
			let _ = roots.add(cert);
		}
	}
	let cfg = rustls::ClientConfig::builder().with_root_certificates(roots).with_no_client_auth();
	Ok(Arc::new(cfg))
}

#[derive(Debug)]
struct NoVerify;

impl rustls::client::danger::ServerCertVerifier for NoVerify {
	fn verify_server_cert(
		&self,
		_end_entity: &rustls_pki_types::CertificateDer<'_>,
		_intermediates: &[rustls_pki_types::CertificateDer<'_>],
		_server_name: &ServerName<'_>,
		_ocsp_response: &[u8],
		_now: rustls_pki_types::UnixTime,
	) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
		Ok(rustls::client::danger::ServerCertVerified::assertion())
	}

	fn verify_tls12_signature(
		&self,
		_message: &[u8],
		_cert: &rustls_pki_types::CertificateDer<'_>,
		_dss: &rustls::DigitallySignedStruct,
	) -> Result<rustls::client::danger::HandshakeSignatureVerified, rustls::Error> {
		Ok(rustls::client::danger::HandshakeSignatureVerified::assertion())
	}

	fn verify_tls13_signature(
		&self,
		_message: &[u8],
		_cert: &rustls_pki_types::CertificateDer<'_>,
		_dss: &rustls::DigitallySignedStruct,
	) -> Result<rustls::client::danger::HandshakeSignatureVerified, rustls::Error> {
		Ok(rustls::client::danger::HandshakeSignatureVerified::assertion())
	}

	fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
		rustls::crypto::aws_lc_rs::default_provider().signature_verification_algorithms.supported_schemes()
	}
}

/// Dials and (for https) TLS-wraps a connection to `host:port`, then
/// performs the HTTP/1.1 client handshake, spawning the connection driver.
/// Returns a handle the caller can issue requests on.
pub struct OriginClient {
	dialer: Dialer,
	tls: Arc<rustls::ClientConfig>,
}

impl OriginClient {
	pub fn new(dialer: Dialer, tls: Arc<rustls::ClientConfig>) -> Self {
		OriginClient { dialer, tls }
	}

	pub async fn connect(&self, scheme: Scheme, host: &str, port: u16) -> Result<http1::SendRequest<Body>, ProxyError> {
		let conn = self
			.dialer
			.dial(host, port, DialTrackMode::Default)
			.await
			.map_err(|source| ProxyError::DialFailed { addr: format!("{host}:{port}"), source })?;

		match scheme {
			Scheme::Https => {
				let connector = tokio_rustls::TlsConnector::from(self.tls.clone());
				let server_name = ServerName::try_from(host.to_string())
					.map_err(|_| ProxyError::OriginTlsHandshake(format!("invalid server name {host:?}")))?;
				let tls_stream = connector
					.connect(server_name, conn)
					.await
					.map_err(|e| ProxyError::OriginTlsHandshake(e.to_string()))?;
				self.handshake(tls_stream).await
			},
			_ => self.handshake(conn).await,
		}
	}

	async fn handshake<S>(&self, stream: S) -> Result<http1::SendRequest<Body>, ProxyError>
	where
		S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
	{
		let io = TokioIo::new(stream);
		let (sender, conn) = http1::handshake(io).await.map_err(|e| ProxyError::Other(e.to_string()))?;
		tokio::spawn(async move {
			if let Err(e) = conn.with_upgrades().await {
				tracing::event!(target: "forwarder::client", tracing::Level::DEBUG, error = %e, "origin connection closed");
			}
		});
		Ok(sender)
	}
}
