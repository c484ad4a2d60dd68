//! Bidirectional byte relay used once a CONNECT tunnel or a MITM-decrypted
//! stream has been handed off to raw copying, with byte counters for
//! telemetry.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Running byte counters for one relayed connection. Cheap to share via
/// reference since both halves of the copy only ever add to it.
#[derive(Debug, Default)]
pub struct ConnectionResult {
	pub sent: AtomicU64,
	pub received: AtomicU64,
}

impl ConnectionResult {
	pub fn sent(&self) -> u64 {
		self.sent.load(Ordering::Relaxed)
	}

	pub fn received(&self) -> u64 {
		self.received.load(Ordering::Relaxed)
	}
}

const BUF_SIZE: usize = 16 * 1024;

/// Copy bytes in both directions between `a` and `b` until either side
/// closes or errors, recording totals into `stats`. Unlike
/// `tokio::io::copy_bidirectional`, a counter is threaded through so callers
/// can report per-connection byte totals without wrapping the streams.
pub async fn copy_bidirectional<A, B>(
	mut a: A,
	mut b: B,
	stats: &ConnectionResult,
) -> std::io::Result<(u64, u64)>
where
	A: AsyncRead + AsyncWrite + Unpin,
	B: AsyncRead + AsyncWrite + Unpin,
{
	let (mut ar, mut aw) = tokio::io::split(&mut a);
	let (mut br, mut bw) = tokio::io::split(&mut b);

	let a_to_b = pump(&mut ar, &mut bw, &stats.sent);
	let b_to_a = pump(&mut br, &mut aw, &stats.received);

	tokio::try_join!(a_to_b, b_to_a)
}

async fn pump<R, W>(r: &mut R, w: &mut W, counter: &AtomicU64) -> std::io::Result<u64>
where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin,
{
	let mut buf = vec![0u8; BUF_SIZE];
	let mut total = 0u64;
	loop {
		let n = r.read(&mut buf).await?;
		if n == 0 {
			break;
		}
		w.write_all(&buf[..n]).await?;
		total += n as u64;
		counter.fetch_add(n as u64, Ordering::Relaxed);
	}
	w.shutdown().await?;
	Ok(total)
}
