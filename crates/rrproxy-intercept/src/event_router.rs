//! C8: demultiplexes a length-delimited protobuf event stream from the hook collaborator,
//! for the platform that exposes traffic as userspace events rather than hijacked sockets.
//!
//! Generalizes the reference stack's `tokio-util` `codec` + `prost`/`prost-types` wiring
//! (used there for xDS config messages) to this system's own flow/open/data/close
//! envelope. Message types use prost's struct-derive mode (`#[derive(prost::Message)]`
//! directly on hand-written structs) rather than `.proto`-file codegen, since there is no
//! IDL here to compile.

use bytes::Bytes;
use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LengthDelimitedCodec};

use rrproxy_store::{DestinationMap, NetworkAddress};

use crate::error::InterceptError;

pub const EVENT_BODY_MAX_SIZE: usize = 16 * 1024;

#[derive(Clone, PartialEq, prost::Message)]
pub struct FlowEvent {
	#[prost(uint32, tag = "1")]
	pub src_port: u32,
	#[prost(uint32, tag = "2")]
	pub dst_port: u32,
	#[prost(bytes, tag = "3")]
	pub dst_addr: Vec<u8>,
	#[prost(bool, tag = "4")]
	pub is_ipv6: bool,
	#[prost(uint32, tag = "5")]
	pub pid: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SocketOpenEvent {
	#[prost(uint64, tag = "1")]
	pub conn_id: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum Direction {
	ClientToServer = 0,
	ServerToClient = 1,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SocketDataEvent {
	#[prost(uint64, tag = "1")]
	pub conn_id: u64,
	#[prost(enumeration = "Direction", tag = "2")]
	pub direction: i32,
	#[prost(bytes, tag = "3")]
	pub payload: Vec<u8>,
	#[prost(uint64, tag = "4")]
	pub position: u64,
	#[prost(int64, tag = "5")]
	pub timestamp_ns: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SocketCloseEvent {
	#[prost(uint64, tag = "1")]
	pub conn_id: u64,
}

#[derive(Clone, PartialEq, ::prost::Oneof)]
pub enum EventKind {
	#[prost(message, tag = "1")]
	Flow(FlowEvent),
	#[prost(message, tag = "2")]
	Open(SocketOpenEvent),
	#[prost(message, tag = "3")]
	Data(SocketDataEvent),
	#[prost(message, tag = "4")]
	Close(SocketCloseEvent),
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Envelope {
	#[prost(oneof = "EventKind", tags = "1,2,3,4")]
	pub kind: Option<EventKind>,
}

/// A data chunk as handed to the per-connection stream reconstructor: at most
/// `EVENT_BODY_MAX_SIZE` bytes, tagged with its byte offset in the original message so
/// chunks can be reassembled in order even if they arrive out of order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataChunk {
	pub conn_id: u64,
	pub direction: Direction,
	pub offset: u64,
	pub bytes: Bytes,
	pub timestamp_ns: i64,
}

/// Split a `socket-data` payload into chunks no larger than `max_size`, each carrying its
/// absolute offset within the original payload.
pub fn rechunk(conn_id: u64, direction: Direction, base_offset: u64, payload: &[u8], timestamp_ns: i64, max_size: usize) -> Vec<DataChunk> {
	if payload.is_empty() {
		return vec![];
	}
	payload
		.chunks(max_size)
		.enumerate()
		.map(|(i, chunk)| DataChunk {
			conn_id,
			direction,
			offset: base_offset + (i * max_size) as u64,
			bytes: Bytes::copy_from_slice(chunk),
			timestamp_ns,
		})
		.collect()
}

pub struct EventRouter {
	destinations: std::sync::Arc<DestinationMap>,
	open_tx: mpsc::Sender<u64>,
	data_tx: mpsc::Sender<DataChunk>,
	close_tx: mpsc::Sender<u64>,
}

impl EventRouter {
	pub fn new(destinations: std::sync::Arc<DestinationMap>, open_tx: mpsc::Sender<u64>, data_tx: mpsc::Sender<DataChunk>, close_tx: mpsc::Sender<u64>) -> Self {
		EventRouter {
			destinations,
			open_tx,
			data_tx,
			close_tx,
		}
	}

	/// Drain `reader` until EOF, dispatching each decoded envelope. Runs until the stream
	/// closes or a framing error occurs.
	pub async fn run<R: AsyncRead + Unpin>(&self, reader: R) -> Result<(), InterceptError> {
		let mut framed = FramedRead::new(reader, LengthDelimitedCodec::new());
		while let Some(frame) = framed.next().await {
			let frame = frame?;
			let envelope = <Envelope as prost::Message>::decode(frame).map_err(|e| InterceptError::MalformedRequest(e.to_string()))?;
			self.dispatch(envelope).await;
		}
		Ok(())
	}

	async fn dispatch(&self, envelope: Envelope) {
		match envelope.kind {
			Some(EventKind::Flow(flow)) => {
				let address = decode_address(&flow);
				self.destinations.insert(flow.src_port as u16, address, Some(flow.pid));
			},
			Some(EventKind::Open(open)) => {
				let _ = self.open_tx.send(open.conn_id).await;
			},
			Some(EventKind::Data(data)) => {
				let direction = Direction::try_from(data.direction).unwrap_or(Direction::ClientToServer);
				for chunk in rechunk(data.conn_id, direction, data.position, &data.payload, data.timestamp_ns, EVENT_BODY_MAX_SIZE) {
					let _ = self.data_tx.send(chunk).await;
				}
			},
			Some(EventKind::Close(close)) => {
				let _ = self.close_tx.send(close.conn_id).await;
			},
			None => {},
		}
	}
}

fn decode_address(flow: &FlowEvent) -> NetworkAddress {
	if flow.is_ipv6 && flow.dst_addr.len() == 16 {
		let mut addr = [0u8; 16];
		addr.copy_from_slice(&flow.dst_addr);
		NetworkAddress::V6 { addr, port: flow.dst_port as u16 }
	} else {
		let mut addr = [0u8; 4];
		let n = flow.dst_addr.len().min(4);
		addr[..n].copy_from_slice(&flow.dst_addr[..n]);
		NetworkAddress::V4 { addr, port: flow.dst_port as u16 }
	}
}
