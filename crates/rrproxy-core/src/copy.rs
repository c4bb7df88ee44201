//! Byte-exact bidirectional forwarding between two sockets. Used by the ingress
//! interceptor's HTTP/1.x passthrough path (and by the egress record-mode forwarder):
//! nothing about the payload is inspected or mutated here, only copied.
//!
//! Buffers start small (favoring low first-byte latency for short request/response
//! exchanges) and grow in tiers as a direction proves itself to be a bulk transfer.

use std::io;
use std::pin::Pin;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const INITIAL_BUFFER_SIZE: usize = 1024;
pub const LARGE_BUFFER_SIZE: usize = 16_384 - 64;
pub const JUMBO_BUFFER_SIZE: usize = (16 * 16_384) - 64;
pub const RESIZE_THRESHOLD_LARGE: u64 = 128 * 1024;
pub const RESIZE_THRESHOLD_JUMBO: u64 = 10 * 1024 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum CopyError {
	#[error("io error: {0}")]
	Io(#[from] io::Error),
	#[error("client disconnected")]
	ClientDisconnected,
	#[error("backend disconnected")]
	BackendDisconnected,
	#[error("error receiving from {0}: {1}")]
	ReceiveError(&'static str, Box<CopyError>),
	#[error("error sending to {0}: {1}")]
	SendError(&'static str, Box<CopyError>),
}

/// Splits an owned stream into independent read/write halves that can be driven by
/// separate tasks or separate futures in the same task.
pub trait BufferedSplitter {
	type R: AsyncRead + Unpin + Send;
	type W: AsyncWrite + Unpin + Send;

	fn split(self) -> (Self::R, Self::W);
}

impl BufferedSplitter for tokio::net::TcpStream {
	type R = tokio::net::tcp::OwnedReadHalf;
	type W = tokio::net::tcp::OwnedWriteHalf;

	fn split(self) -> (Self::R, Self::W) {
		self.into_split()
	}
}

struct TieredBuffer {
	buf: BytesMut,
	total_copied: u64,
}

impl TieredBuffer {
	fn new() -> Self {
		TieredBuffer {
			buf: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
			total_copied: 0,
		}
	}

	fn grow_if_warranted(&mut self) {
		let target = if self.total_copied > RESIZE_THRESHOLD_JUMBO {
			JUMBO_BUFFER_SIZE
		} else if self.total_copied > RESIZE_THRESHOLD_LARGE {
			LARGE_BUFFER_SIZE
		} else {
			INITIAL_BUFFER_SIZE
		};
		if self.buf.capacity() < target {
			self.buf.reserve(target - self.buf.capacity());
		}
	}
}

fn ignore_io_errors(e: io::Error) -> Result<(), io::Error> {
	match e.kind() {
		io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => Ok(()),
		_ => Err(e),
	}
}

async fn copy_direction<R, W>(mut reader: R, mut writer: W, from: &'static str) -> Result<(), CopyError>
where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin,
{
	let mut tiered = TieredBuffer::new();
	loop {
		tiered.grow_if_warranted();
		let cap = tiered.buf.capacity().max(INITIAL_BUFFER_SIZE);
		tiered.buf.clear();
		tiered.buf.resize(cap, 0);
		let n = match reader.read(&mut tiered.buf).await {
			Ok(0) => break,
			Ok(n) => n,
			Err(e) => {
				if let Err(real) = ignore_io_errors(e) {
					return Err(CopyError::ReceiveError(from, Box::new(CopyError::Io(real))));
				}
				break;
			},
		};
		tiered.total_copied += n as u64;
		if let Err(e) = writer.write_all(&tiered.buf[..n]).await {
			if let Err(real) = ignore_io_errors(e) {
				return Err(CopyError::SendError(from, Box::new(CopyError::Io(real))));
			}
			break;
		}
	}
	let _ = writer.shutdown().await;
	Ok(())
}

/// Copy bytes in both directions between `a` and `b` until either side closes. Returns
/// once both directions have finished; a clean half-close on one side does not cancel the
/// other direction.
pub async fn copy_bidirectional<A, B>(a: A, b: B) -> Result<(), CopyError>
where
	A: BufferedSplitter + 'static,
	B: BufferedSplitter + 'static,
{
	let (a_read, a_write) = a.split();
	let (b_read, b_write) = b.split();

	let (client_to_upstream, upstream_to_client) = tokio::join!(
		copy_direction(a_read, b_write, "client"),
		copy_direction(b_read, a_write, "upstream"),
	);
	client_to_upstream?;
	upstream_to_client?;
	Ok(())
}

/// Peek the first `n` bytes of a socket without consuming them, for protocol demux
/// (HTTP/1.1 vs the HTTP/2 client preface). Returns a reader that replays the peeked
/// bytes before delegating to the underlying socket, so a downstream handler sees the
/// full, unconsumed byte stream.
pub struct PeekedStream<S> {
	peeked: BytesMut,
	pos: usize,
	inner: S,
}

impl<S: AsyncRead + Unpin> PeekedStream<S> {
	pub async fn peek(mut inner: S, n: usize) -> io::Result<Self> {
		let mut peeked = BytesMut::zeroed(n);
		let mut filled = 0;
		while filled < n {
			let read = inner.read(&mut peeked[filled..]).await?;
			if read == 0 {
				peeked.truncate(filled);
				break;
			}
			filled += read;
		}
		peeked.truncate(filled);
		Ok(PeekedStream { peeked, pos: 0, inner })
	}

	pub fn peeked_bytes(&self) -> &[u8] {
		&self.peeked
	}

	pub fn into_inner(self) -> S {
		self.inner
	}
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekedStream<S> {
	fn poll_read(
		mut self: Pin<&mut Self>,
		cx: &mut std::task::Context<'_>,
		buf: &mut tokio::io::ReadBuf<'_>,
	) -> std::task::Poll<io::Result<()>> {
		if self.pos < self.peeked.len() {
			let remaining = &self.peeked[self.pos..];
			let n = remaining.len().min(buf.remaining());
			buf.put_slice(&remaining[..n]);
			self.pos += n;
			return std::task::Poll::Ready(Ok(()));
		}
		Pin::new(&mut self.inner).poll_read(cx, buf)
	}
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekedStream<S> {
	fn poll_write(mut self: Pin<&mut Self>, cx: &mut std::task::Context<'_>, buf: &[u8]) -> std::task::Poll<io::Result<usize>> {
		Pin::new(&mut self.inner).poll_write(cx, buf)
	}
	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<io::Result<()>> {
		Pin::new(&mut self.inner).poll_flush(cx)
	}
	fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<io::Result<()>> {
		Pin::new(&mut self.inner).poll_shutdown(cx)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::io::AsyncReadExt;

	#[tokio::test]
	async fn peeked_stream_replays_then_delegates() {
		let data = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\nrest-of-stream";
		let cursor = std::io::Cursor::new(data.to_vec());
		let mut peeked = PeekedStream::peek(cursor, 24).await.unwrap();
		assert_eq!(peeked.peeked_bytes(), &data[..24]);

		let mut out = Vec::new();
		peeked.read_to_end(&mut out).await.unwrap();
		assert_eq!(out, data.to_vec());
	}

	#[tokio::test]
	async fn peek_handles_short_stream() {
		let data = b"short";
		let cursor = std::io::Cursor::new(data.to_vec());
		let peeked = PeekedStream::peek(cursor, 24).await.unwrap();
		assert_eq!(peeked.peeked_bytes(), data);
	}

	#[tokio::test]
	async fn copy_bidirectional_forwards_both_directions() {
		let (a, b) = tokio::io::duplex(4096);
		let (c, d) = tokio::io::duplex(4096);

		struct Duplex(tokio::io::DuplexStream);
		impl BufferedSplitter for Duplex {
			type R = tokio::io::ReadHalf<tokio::io::DuplexStream>;
			type W = tokio::io::WriteHalf<tokio::io::DuplexStream>;
			fn split(self) -> (Self::R, Self::W) {
				tokio::io::split(self.0)
			}
		}

		let copier = tokio::spawn(copy_bidirectional(Duplex(b), Duplex(c)));

		let mut a = a;
		a.write_all(b"hello upstream").await.unwrap();
		drop(a.shutdown().await);

		let mut out = Vec::new();
		d.take(14).read_to_end(&mut out).await.unwrap();
		assert_eq!(out, b"hello upstream");

		copier.abort();
	}
}
