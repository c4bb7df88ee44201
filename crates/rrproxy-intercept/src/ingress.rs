//! C3: the ingress interceptor. Binds the application's original port, peeks the first
//! bytes off each accepted client connection to decide HTTP/1.1 vs HTTP/2+gRPC, forwards
//! byte-exact, and emits captured test cases off the hot path.
//!
//! The demux and the HTTP/1↔2 coexistence on one accepted socket mirrors the reference
//! proxy stack's `gateway.rs::proxy`/`auto_server()` (`hyper_util::server::conn::auto`);
//! this implementation peeks the preface itself rather than delegating to that helper,
//! since the spec requires the peeked bytes to still reach a downstream reader verbatim,
//! which `hyper_util`'s auto-detecting acceptor does not expose a hook for.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use rrproxy_core::copy::PeekedStream;
use rrproxy_store::{Kind, Payload, Session};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

use crate::error::InterceptError;

const HTTP2_PREFACE: &[u8; 24] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
const UPSTREAM_DIAL_TIMEOUT: Duration = Duration::from_secs(3);

pub struct IngressInterceptor {
	session: Arc<Session>,
	/// Serializes client requests on a forwarder, one at a time, when the operator has
	/// selected synchronous replay mode.
	sync_lock: Option<Arc<Semaphore>>,
}

impl IngressInterceptor {
	pub fn new(session: Arc<Session>, synchronous: bool) -> Self {
		IngressInterceptor {
			session,
			sync_lock: synchronous.then(|| Arc::new(Semaphore::new(1))),
		}
	}

	/// Accept loop for one original application port, forwarding every connection to
	/// `upstream`. Runs until cancelled by the caller (e.g. via `rrproxy_core::drain`).
	#[instrument(skip(self), fields(original_port))]
	pub async fn serve(&self, listen_addr: SocketAddr, original_port: u16, upstream: SocketAddr) -> Result<(), InterceptError> {
		let listener = tokio::net::TcpListener::bind(listen_addr).await?;
		loop {
			let (stream, _peer) = match listener.accept().await {
				Ok(v) => v,
				Err(e) => {
					warn!(error = %e, "ingress accept failed, continuing");
					continue;
				},
			};
			let session = self.session.clone();
			let sync_lock = self.sync_lock.clone();
			tokio::spawn(async move {
				if let Err(e) = handle_connection(stream, original_port, upstream, session, sync_lock).await {
					debug!(error = %e, "ingress connection ended with error");
				}
			});
		}
	}
}

async fn handle_connection(stream: TcpStream, original_port: u16, upstream: SocketAddr, session: Arc<Session>, sync_lock: Option<Arc<Semaphore>>) -> Result<(), InterceptError> {
	let peeked = PeekedStream::peek(stream, HTTP2_PREFACE.len()).await?;
	if peeked.peeked_bytes() == HTTP2_PREFACE {
		handle_grpc(peeked, original_port, upstream, session).await
	} else {
		handle_http1(peeked, original_port, upstream, session, sync_lock).await
	}
}

// ---------- HTTP/1.x ----------

struct RawHead {
	bytes: Vec<u8>,
	start_line: String,
	headers: Vec<(String, String)>,
}

async fn read_head<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Option<RawHead>> {
	let mut buf = Vec::with_capacity(512);
	let mut byte = [0u8; 1];
	loop {
		let n = reader.read(&mut byte).await?;
		if n == 0 {
			return Ok(None);
		}
		buf.push(byte[0]);
		if buf.len() >= 4 && &buf[buf.len() - 4..] == b"\r\n\r\n" {
			break;
		}
		if buf.len() > 64 * 1024 {
			return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "header section too large"));
		}
	}
	let mut raw_headers = [httparse::EMPTY_HEADER; 64];
	let (start_line, headers) = if let Ok(httparse::Status::Complete(_)) = {
		let mut req = httparse::Request::new(&mut raw_headers);
		req.parse(&buf)
	} {
		let mut req = httparse::Request::new(&mut raw_headers);
		req.parse(&buf).ok();
		(
			format!("{} {} HTTP/1.1", req.method.unwrap_or(""), req.path.unwrap_or("")),
			req.headers.iter().map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).to_string())).collect(),
		)
	} else {
		let mut resp = httparse::Response::new(&mut raw_headers);
		resp.parse(&buf).ok();
		(
			format!("HTTP/1.1 {}", resp.code.unwrap_or(0)),
			resp.headers.iter().map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).to_string())).collect(),
		)
	};
	Ok(Some(RawHead { bytes: buf, start_line, headers }))
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
	headers.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
}

fn is_chunked(headers: &[(String, String)]) -> bool {
	header_value(headers, "transfer-encoding").map(|v| v.to_ascii_lowercase().contains("chunked")).unwrap_or(false)
}

fn content_length(headers: &[(String, String)]) -> Option<usize> {
	header_value(headers, "content-length").and_then(|v| v.trim().parse().ok())
}

async fn read_chunked_body<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Vec<u8>> {
	let mut out = Vec::new();
	loop {
		let mut size_line = Vec::new();
		let mut byte = [0u8; 1];
		loop {
			reader.read_exact(&mut byte).await?;
			size_line.push(byte[0]);
			if size_line.ends_with(b"\r\n") {
				break;
			}
		}
		out.extend_from_slice(&size_line);
		let size_str = String::from_utf8_lossy(&size_line);
		let size_str = size_str.trim().split(';').next().unwrap_or("0");
		let size = usize::from_str_radix(size_str, 16).unwrap_or(0);
		let mut chunk = vec![0u8; size + 2]; // chunk data + trailing CRLF
		reader.read_exact(&mut chunk).await?;
		out.extend_from_slice(&chunk);
		if size == 0 {
			break;
		}
	}
	Ok(out)
}

async fn read_body_for<R: AsyncRead + Unpin>(head: &RawHead, reader: &mut R) -> std::io::Result<(Vec<u8>, bool)> {
	if is_chunked(&head.headers) {
		let body = read_chunked_body(reader).await?;
		return Ok((body, true));
	}
	if let Some(len) = content_length(&head.headers) {
		let mut body = vec![0u8; len];
		reader.read_exact(&mut body).await?;
		return Ok((body, false));
	}
	Ok((Vec::new(), false))
}

async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Option<(RawHead, Vec<u8>, bool)>> {
	let Some(head) = read_head(reader).await? else {
		return Ok(None);
	};
	let (body, streaming) = read_body_for(&head, reader).await?;
	Ok(Some((head, body, streaming)))
}

/// Replace (or add) the `Connection` header in a raw header-block buffer with
/// `Connection: close`, leaving every other header and the start-line untouched.
fn rewrite_connection_close(head_bytes: &[u8]) -> Vec<u8> {
	let head_str = String::from_utf8_lossy(head_bytes);
	let Some(without_trailer) = head_str.strip_suffix("\r\n\r\n") else {
		return head_bytes.to_vec();
	};
	let mut lines: Vec<String> = without_trailer.split("\r\n").map(|s| s.to_string()).collect();
	if lines.is_empty() {
		return head_bytes.to_vec();
	}
	let start_line = lines.remove(0);
	lines.retain(|l| !l.to_ascii_lowercase().starts_with("connection:"));
	lines.push("Connection: close".to_string());

	let mut out = start_line;
	for line in &lines {
		out.push_str("\r\n");
		out.push_str(line);
	}
	out.push_str("\r\n\r\n");
	out.into_bytes()
}

async fn handle_http1(stream: PeekedStream<TcpStream>, original_port: u16, upstream: SocketAddr, session: Arc<Session>, sync_lock: Option<Arc<Semaphore>>) -> Result<(), InterceptError> {
	let mut client = stream;
	loop {
		let permit = match &sync_lock {
			Some(lock) => Some(lock.clone().acquire_owned().await.expect("semaphore never closed")),
			None => None,
		};

		let Some(req_head) = read_head(&mut client).await? else {
			break;
		};

		let mut upstream_stream = tokio::time::timeout(UPSTREAM_DIAL_TIMEOUT, TcpStream::connect(upstream))
			.await
			.map_err(|_| InterceptError::UpstreamDial(std::io::Error::new(std::io::ErrorKind::TimedOut, "dial timeout")))?
			.map_err(InterceptError::UpstreamDial)?;

		// Whether this exchange is a candidate for the sync-mode `Connection: close`
		// rewrite is decided from the request side alone (its chunkedness is known before
		// any bytes cross the wire); the response side can still veto it below.
		let speculative_close = sync_lock.is_some() && !is_chunked(&req_head.headers);
		let forwarded_req_head = if speculative_close { rewrite_connection_close(&req_head.bytes) } else { req_head.bytes.clone() };

		let expects_continue = header_value(&req_head.headers, "expect").map(|v| v.eq_ignore_ascii_case("100-continue")).unwrap_or(false);

		let request_time_ns = now_ns();

		let (req_body, req_streaming, resp_head, resp_body, resp_streaming) = if expects_continue {
			// Forward only the headers first; the client is withholding the body until it
			// sees the interim response (§4.3's `Expect: 100-continue` handling).
			upstream_stream.write_all(&forwarded_req_head).await?;
			let Some(interim) = read_head(&mut upstream_stream).await? else {
				break;
			};
			client.write_all(&interim.bytes).await?;
			if interim.start_line.contains("100") {
				let (body, streaming) = read_body_for(&req_head, &mut client).await?;
				upstream_stream.write_all(&body).await?;
				let Some((resp_head, resp_body, resp_streaming)) = read_message(&mut upstream_stream).await? else {
					break;
				};
				(body, streaming, resp_head, resp_body, resp_streaming)
			} else {
				// Upstream rejected the expectation outright: the interim response is the
				// final response and the client never sends a body for this exchange.
				(Vec::new(), false, interim, Vec::new(), false)
			}
		} else {
			let (body, streaming) = read_body_for(&req_head, &mut client).await?;
			upstream_stream.write_all(&forwarded_req_head).await?;
			upstream_stream.write_all(&body).await?;
			let Some((resp_head, resp_body, resp_streaming)) = read_message(&mut upstream_stream).await? else {
				break;
			};
			(body, streaming, resp_head, resp_body, resp_streaming)
		};

		let response_time_ns = now_ns();
		let streaming = req_streaming || resp_streaming;
		let non_streaming_sync = speculative_close && !streaming;

		let mut resp_bytes = if non_streaming_sync { rewrite_connection_close(&resp_head.bytes) } else { resp_head.bytes.clone() };
		resp_bytes.extend_from_slice(&resp_body);
		client.write_all(&resp_bytes).await?;

		if streaming {
			// Streaming exchanges are not re-captured (§4.3): release the sync lock early
			// and let the connection continue without emitting a test case for this pair.
			drop(permit);
			continue;
		}

		emit_test_case(&session, original_port, &req_head, &req_body, &resp_head, &resp_body, request_time_ns, response_time_ns).await;

		if non_streaming_sync {
			// The next client on this forwarder must not be blocked behind keep-alive, so
			// this connection stops serving further requests once it has told both sides
			// `Connection: close`.
			break;
		}
	}
	Ok(())
}

async fn emit_test_case(session: &Arc<Session>, original_port: u16, req_head: &RawHead, req_body: &[u8], resp_head: &RawHead, resp_body: &[u8], request_time_ns: i64, response_time_ns: i64) {
	let request = vec![Payload::encode(&req_head.bytes), Payload::encode(req_body)];
	let response = vec![Payload::encode(&resp_head.bytes), Payload::encode(resp_body)];
	let _ = session
		.test_case_tx
		.send(rrproxy_store::session::TestCase {
			kind: Kind::Http,
			request,
			response,
			request_time_ns,
			response_time_ns,
			app_port: original_port,
		})
		.await;
}

fn now_ns() -> i64 {
	std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_nanos() as i64).unwrap_or(0)
}

// ---------- HTTP/2 (gRPC) ----------

async fn handle_grpc(stream: PeekedStream<TcpStream>, original_port: u16, upstream: SocketAddr, session: Arc<Session>) -> Result<(), InterceptError> {
	let upstream_stream = tokio::time::timeout(UPSTREAM_DIAL_TIMEOUT, TcpStream::connect(upstream))
		.await
		.map_err(|_| InterceptError::UpstreamDial(std::io::Error::new(std::io::ErrorKind::TimedOut, "dial timeout")))?
		.map_err(InterceptError::UpstreamDial)?;

	let (client_io, upstream_io) = (stream, upstream_stream);
	let mut client_conn = h2::server::handshake(client_io).await?;
	let (upstream_send, upstream_conn) = h2::client::Builder::new().handshake(upstream_io).await?;
	tokio::spawn(async move {
		let _ = upstream_conn.await;
	});

	while let Some(result) = client_conn.accept().await {
		let (client_req, client_respond) = result?;
		let session = session.clone();
		let mut upstream_send = upstream_send.clone();
		tokio::spawn(async move {
			if let Err(e) = proxy_grpc_stream(client_req, client_respond, &mut upstream_send, original_port, upstream, session).await {
				debug!(error = %e, "grpc stream ended with error");
			}
		});
	}
	Ok(())
}

/// Fills in the pseudo-headers and `te` trailer that a gRPC call always carries, defaulting
/// whichever of them the client omitted rather than rejecting the stream (§4.3): method is
/// always `POST` for gRPC, the scheme defaults to `http`, the authority defaults to the
/// upstream address, and `te: trailers` is added when absent.
fn apply_grpc_request_defaults(parts: &mut http::request::Parts, upstream: SocketAddr) {
	parts.method = http::Method::POST;

	let scheme = parts.uri.scheme_str().unwrap_or("http").to_string();
	let authority = parts.uri.authority().map(|a| a.to_string()).unwrap_or_else(|| upstream.to_string());
	let path_and_query = parts.uri.path_and_query().map(|p| p.to_string()).unwrap_or_else(|| "/".to_string());
	if parts.uri.scheme_str().is_none() || parts.uri.authority().is_none() {
		if let Ok(uri) = http::Uri::builder().scheme(scheme.as_str()).authority(authority.as_str()).path_and_query(path_and_query.as_str()).build() {
			parts.uri = uri;
		}
	}

	if !parts.headers.contains_key(http::header::TE) {
		parts.headers.insert(http::header::TE, http::HeaderValue::from_static("trailers"));
	}
}

/// Normalises a `content-type: application/grpc*` response header down to the bare
/// `application/grpc`, per §4.3's response defaulting rule. `:status` needs no equivalent
/// handling since `http::response::Parts::status` already defaults to `200 OK`.
fn normalize_grpc_content_type(headers: &mut http::HeaderMap) {
	let Some(value) = headers.get(http::header::CONTENT_TYPE) else {
		return;
	};
	if value.to_str().map(|s| s.starts_with("application/grpc")).unwrap_or(false) {
		headers.insert(http::header::CONTENT_TYPE, http::HeaderValue::from_static("application/grpc"));
	}
}

async fn proxy_grpc_stream(
	client_req: http::Request<h2::RecvStream>,
	mut client_respond: h2::server::SendResponse<Bytes>,
	upstream_send: &mut h2::client::SendRequest<Bytes>,
	original_port: u16,
	upstream: SocketAddr,
	session: Arc<Session>,
) -> Result<(), InterceptError> {
	let request_time_ns = now_ns();
	let (mut parts, mut client_body) = client_req.into_parts();
	apply_grpc_request_defaults(&mut parts, upstream);
	let forwarded = http::Request::from_parts(parts, ());

	let mut ready = upstream_send.ready().await?;
	let (response_future, mut upstream_send_stream) = ready.send_request(forwarded, false)?;

	let mut captured_request = BytesMut::new();
	while let Some(chunk) = client_body.data().await {
		let chunk = chunk?;
		captured_request.extend_from_slice(&chunk);
		upstream_send_stream.send_data(chunk, false)?;
	}
	if let Some(trailers) = client_body.trailers().await? {
		upstream_send_stream.send_trailers(trailers)?;
	} else {
		upstream_send_stream.send_data(Bytes::new(), true)?;
	}

	let upstream_response = response_future.await.map_err(InterceptError::H2)?;
	let (mut resp_parts, mut upstream_body) = upstream_response.into_parts();
	normalize_grpc_content_type(&mut resp_parts.headers);
	let mut respond_stream = client_respond.send_response(http::Response::from_parts(resp_parts.clone(), ()), false)?;

	let mut captured_response = BytesMut::new();
	while let Some(chunk) = upstream_body.data().await {
		let chunk = chunk?;
		captured_response.extend_from_slice(&chunk);
		respond_stream.send_data(chunk, false)?;
	}
	if let Some(trailers) = upstream_body.trailers().await? {
		respond_stream.send_trailers(trailers)?;
	} else {
		respond_stream.send_data(Bytes::new(), true)?;
	}

	let response_time_ns = now_ns();

	let _ = session
		.test_case_tx
		.send(rrproxy_store::session::TestCase {
			kind: Kind::Grpc,
			request: vec![Payload::encode(&captured_request)],
			response: vec![Payload::encode(&captured_response)],
			request_time_ns,
			response_time_ns,
			app_port: original_port,
		})
		.await;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn http2_preface_is_24_bytes_exact() {
		assert_eq!(HTTP2_PREFACE.len(), 24);
	}

	#[test]
	fn chunked_detection_is_case_insensitive() {
		let headers = vec![("Transfer-Encoding".to_string(), "CHUNKED".to_string())];
		assert!(is_chunked(&headers));
	}

	#[test]
	fn content_length_parses_numeric_header() {
		let headers = vec![("Content-Length".to_string(), "42".to_string())];
		assert_eq!(content_length(&headers), Some(42));
	}

	#[test]
	fn rewrite_connection_close_replaces_existing_header() {
		let head = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: keep-alive\r\n\r\n";
		let rewritten = rewrite_connection_close(head);
		let text = String::from_utf8(rewritten).unwrap();
		assert!(text.contains("Connection: close"));
		assert!(!text.to_ascii_lowercase().contains("keep-alive"));
		assert!(text.contains("Content-Length: 5"));
		assert!(text.ends_with("\r\n\r\n"));
	}

	#[test]
	fn rewrite_connection_close_adds_header_when_absent() {
		let head = b"GET /x HTTP/1.1\r\nHost: a\r\n\r\n";
		let rewritten = rewrite_connection_close(head);
		let text = String::from_utf8(rewritten).unwrap();
		assert!(text.contains("Connection: close"));
		assert!(text.starts_with("GET /x HTTP/1.1\r\n"));
	}

	#[test]
	fn grpc_request_defaults_fill_missing_scheme_and_authority() {
		let upstream: SocketAddr = "127.0.0.1:9000".parse().unwrap();
		let req = http::Request::builder().method("GET").uri("/pkg.Svc/Method").body(()).unwrap();
		let (mut parts, _) = req.into_parts();
		apply_grpc_request_defaults(&mut parts, upstream);
		assert_eq!(parts.method, http::Method::POST);
		assert_eq!(parts.uri.authority().unwrap().as_str(), "127.0.0.1:9000");
		assert_eq!(parts.uri.scheme_str(), Some("http"));
		assert_eq!(parts.uri.path(), "/pkg.Svc/Method");
		assert_eq!(parts.headers.get(http::header::TE).unwrap(), "trailers");
	}

	#[test]
	fn grpc_request_defaults_preserve_existing_te_header() {
		let upstream: SocketAddr = "127.0.0.1:9000".parse().unwrap();
		let req = http::Request::builder()
			.method("GET")
			.uri("http://upstream.example/pkg.Svc/Method")
			.header(http::header::TE, "trailers, deflate")
			.body(())
			.unwrap();
		let (mut parts, _) = req.into_parts();
		apply_grpc_request_defaults(&mut parts, upstream);
		assert_eq!(parts.uri.authority().unwrap().as_str(), "upstream.example");
		assert_eq!(parts.headers.get(http::header::TE).unwrap(), "trailers, deflate");
	}

	#[test]
	fn grpc_content_type_is_normalized_to_bare_application_grpc() {
		let mut headers = http::HeaderMap::new();
		headers.insert(http::header::CONTENT_TYPE, http::HeaderValue::from_static("application/grpc+proto"));
		normalize_grpc_content_type(&mut headers);
		assert_eq!(headers.get(http::header::CONTENT_TYPE).unwrap(), "application/grpc");
	}

	#[test]
	fn grpc_content_type_untouched_when_not_grpc() {
		let mut headers = http::HeaderMap::new();
		headers.insert(http::header::CONTENT_TYPE, http::HeaderValue::from_static("application/json"));
		normalize_grpc_content_type(&mut headers);
		assert_eq!(headers.get(http::header::CONTENT_TYPE).unwrap(), "application/json");
	}
}
