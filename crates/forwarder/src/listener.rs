//! Inbound TCP acceptor: optional PROXY-protocol header, token-bucket
//! rate limiting, and TLS termination, layered in that order (spec.md
//! §4.5).

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use crate::telemetry::metrics::Metrics;

#[derive(Debug, Clone, Default)]
pub struct ListenerConfig {
	pub proxy_protocol: bool,
	pub proxy_protocol_timeout: Duration,
	pub read_limit_bytes_per_sec: Option<u64>,
	pub write_limit_bytes_per_sec: Option<u64>,
	pub tls: Option<Arc<rustls::ServerConfig>>,
}

pub struct Listener {
	inner: TokioTcpListener,
	cfg: ListenerConfig,
	tls_acceptor: Option<TlsAcceptor>,
	metrics: Option<Arc<Metrics>>,
	active: Arc<std::sync::atomic::AtomicUsize>,
}

impl Listener {
	pub async fn bind(addr: SocketAddr, cfg: ListenerConfig, metrics: Option<Arc<Metrics>>) -> io::Result<Self> {
		let inner = TokioTcpListener::bind(addr).await?;
		let tls_acceptor = cfg.tls.clone().map(TlsAcceptor::from);
		Ok(Listener {
			inner,
			cfg,
			tls_acceptor,
			metrics,
			active: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
		})
	}

	pub fn local_addr(&self) -> io::Result<SocketAddr> {
		self.inner.local_addr()
	}

	/// Accepts one connection, layering PROXY-protocol parsing, rate
	/// limiting, and TLS termination as configured. Returns the peer's
	/// real address (from the PROXY-protocol header when present) and the
	/// ready-to-use stream.
	pub async fn accept(&self) -> io::Result<(SocketAddr, InboundStream)> {
		let (tcp, peer) = match self.inner.accept().await {
			Ok(ok) => ok,
			Err(e) => {
				if let Some(m) = &self.metrics {
					m.accept_errors_total.inc();
				}
				return Err(e);
			},
		};

		let (real_peer, tcp) = if self.cfg.proxy_protocol {
			match tokio::time::timeout(self.cfg.proxy_protocol_timeout, read_proxy_header(tcp)).await {
				Ok(Ok(ok)) => ok,
				Ok(Err(e)) => {
					if let Some(m) = &self.metrics {
						m.accept_errors_total.inc();
					}
					return Err(e);
				},
				Err(_) => {
					if let Some(m) = &self.metrics {
						m.accept_errors_total.inc();
					}
					return Err(io::Error::new(io::ErrorKind::TimedOut, "PROXY protocol handshake timed out"));
				},
			}
		} else {
			(peer, tcp)
		};

		let limited = RateLimited::new(tcp, self.cfg.read_limit_bytes_per_sec, self.cfg.write_limit_bytes_per_sec);

		let stream = if let Some(acceptor) = &self.tls_acceptor {
			match acceptor.accept(limited).await {
				Ok(tls) => InboundStream::Tls(Box::new(tls)),
				Err(e) => {
					if let Some(m) = &self.metrics {
						m.tls_handshake_errors_total.inc();
					}
					return Err(e);
				},
			}
		} else {
			InboundStream::Plain(limited)
		};

		if let Some(m) = &self.metrics {
			m.accept_total.inc();
			m.active_connections.inc();
		}
		self.active.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

		Ok((real_peer, stream))
	}

	/// Decrements the active-connection gauge for one closed connection.
	/// Idempotent per call site: callers invoke this exactly once when a
	/// connection handler returns.
	pub fn note_closed(&self) {
		if self.active.fetch_sub(1, std::sync::atomic::Ordering::Relaxed) > 0
			&& let Some(m) = &self.metrics
		{
			m.active_connections.dec();
		}
	}
}

/// Reads and strips a PROXY protocol v1/v2 header if present, returning the
/// original client address it declares.
async fn read_proxy_header(mut tcp: TcpStream) -> io::Result<(SocketAddr, TcpStream)> {
	use tokio::io::AsyncReadExt;

	let peer = tcp.peer_addr()?;
	let mut probe = [0u8; 16];
	let n = tcp.peek(&mut probe).await?;
	if n == 0 {
		return Ok((peer, tcp));
	}

	match ppp::v1::Header::try_from(&probe[..n]) {
		Ok(_) => {
			let mut line = Vec::new();
			loop {
				let mut byte = [0u8; 1];
				tcp.read_exact(&mut byte).await?;
				line.push(byte[0]);
				if line.ends_with(b"\r\n") {
					break;
				}
				if line.len() > 107 {
					return Err(io::Error::new(io::ErrorKind::InvalidData, "PROXY v1 header too long"));
				}
			}
			let header = ppp::v1::Header::try_from(line.as_slice())
				.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
			let addr = header
				.addresses
				.into_tcp()
				.map(|a| SocketAddr::new(a.source_address.into(), a.source_port))
				.unwrap_or(peer);
			Ok((addr, tcp))
		},
		Err(_) => match ppp::v2::Header::try_from(&probe[..n]) {
			Ok(header) => {
				let total_len = header.header_len() + header.length as usize;
				let mut buf = vec![0u8; total_len];
				tcp.read_exact(&mut buf).await?;
				let parsed = ppp::v2::Header::try_from(buf.as_slice())
					.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
				let addr = parsed
					.addresses
					.into_tcp()
					.map(|a| SocketAddr::new(a.source_address.into(), a.source_port))
					.unwrap_or(peer);
				Ok((addr, tcp))
			},
			Err(_) => Ok((peer, tcp)),
		},
	}
}

/// Simple token-bucket rate limiter applied independently to reads and
/// writes.
struct TokenBucket {
	capacity: f64,
	tokens: f64,
	rate_per_sec: f64,
	last: tokio::time::Instant,
}

impl TokenBucket {
	fn new(rate_per_sec: u64) -> Self {
		let rate = rate_per_sec as f64;
		TokenBucket { capacity: rate, tokens: rate, rate_per_sec: rate, last: tokio::time::Instant::now() }
	}

	fn refill(&mut self) {
		let now = tokio::time::Instant::now();
		let elapsed = now.duration_since(self.last).as_secs_f64();
		self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.capacity);
		self.last = now;
	}

	/// Returns the number of bytes of `want` currently permitted by the
	/// bucket, consuming them. `0` means the caller should wait a tick.
	fn take(&mut self, want: usize) -> usize {
		self.refill();
		let allowed = self.tokens.max(0.0) as usize;
		let take = allowed.min(want);
		self.tokens -= take as f64;
		take
	}
}

pub struct RateLimited {
	inner: TcpStream,
	read_bucket: Option<TokenBucket>,
	write_bucket: Option<TokenBucket>,
}

impl RateLimited {
	fn new(inner: TcpStream, read_limit: Option<u64>, write_limit: Option<u64>) -> Self {
		RateLimited {
			inner,
			read_bucket: read_limit.map(TokenBucket::new),
			write_bucket: write_limit.map(TokenBucket::new),
		}
	}
}

impl AsyncRead for RateLimited {
	fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
		let this = self.get_mut();
		if let Some(bucket) = &mut this.read_bucket {
			let want = buf.remaining();
			let allowed = bucket.take(want);
			if allowed == 0 {
				cx.waker().wake_by_ref();
				return Poll::Pending;
			}
			let mut limited = buf.take(allowed);
			let res = Pin::new(&mut this.inner).poll_read(cx, &mut limited);
			let filled = limited.filled().len();
			if res.is_ready() {
				unsafe { buf.assume_init(filled) };
				buf.advance(filled);
			}
			return res;
		}
		Pin::new(&mut this.inner).poll_read(cx, buf)
	}
}

impl AsyncWrite for RateLimited {
	fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
		let this = self.get_mut();
		if let Some(bucket) = &mut this.write_bucket {
			let allowed = bucket.take(buf.len());
			if allowed == 0 {
				cx.waker().wake_by_ref();
				return Poll::Pending;
			}
			return Pin::new(&mut this.inner).poll_write(cx, &buf[..allowed]);
		}
		Pin::new(&mut this.inner).poll_write(cx, buf)
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.get_mut().inner).poll_flush(cx)
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
	}
}

/// A connection after the listener's layering: either plain TCP (wrapped
/// for rate limiting) or a terminated TLS session over it.
pub enum InboundStream {
	Plain(RateLimited),
	Tls(Box<tokio_rustls::server::TlsStream<RateLimited>>),
}

impl InboundStream {
	pub fn sni(&self) -> Option<String> {
		match self {
			InboundStream::Plain(_) => None,
			InboundStream::Tls(tls) => tls.get_ref().1.server_name().map(str::to_string),
		}
	}
}

impl AsyncRead for InboundStream {
	fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
		match self.get_mut() {
			InboundStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
			InboundStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
		}
	}
}

impl AsyncWrite for InboundStream {
	fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
		match self.get_mut() {
			InboundStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
			InboundStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
		}
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		match self.get_mut() {
			InboundStream::Plain(s) => Pin::new(s).poll_flush(cx),
			InboundStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
		}
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		match self.get_mut() {
			InboundStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
			InboundStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn token_bucket_refills_over_time() {
		let mut bucket = TokenBucket::new(100);
		let initial = bucket.take(1000);
		assert_eq!(initial, 100);
		assert_eq!(bucket.take(1000), 0);
	}

	#[tokio::test]
	async fn bind_and_accept_plain() {
		let listener = Listener::bind("127.0.0.1:0".parse().unwrap(), ListenerConfig::default(), None)
			.await
			.unwrap();
		let addr = listener.local_addr().unwrap();
		let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
		let (_peer, stream) = listener.accept().await.unwrap();
		assert!(matches!(stream, InboundStream::Plain(_)));
		client.await.unwrap();
	}
}
