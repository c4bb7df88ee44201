use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
	Http,
	Grpc,
	Dns,
	MySql,
	Postgres,
	Redis,
	Mongo,
	Generic,
}

/// A request/response payload, recorded as UTF-8 text when the bytes are ASCII-clean and
/// as base64 with a `"binary"` tag otherwise. This mirrors how the egress record path
/// stores whatever it intercepted without needing a protocol-specific codec for kinds that
/// don't have one implemented yet (§4.5 / `GenericParser`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "encoding", rename_all = "lowercase")]
pub enum Payload {
	Text(String),
	Binary(String),
}

impl Payload {
	pub fn encode(bytes: &[u8]) -> Self {
		match std::str::from_utf8(bytes) {
			Ok(s) if s.chars().all(|c| !c.is_control() || c == '\n' || c == '\r' || c == '\t') => Payload::Text(s.to_string()),
			_ => Payload::Binary(base64::encode_buf(bytes)),
		}
	}

	pub fn as_bytes(&self) -> Vec<u8> {
		match self {
			Payload::Text(s) => s.as_bytes().to_vec(),
			Payload::Binary(b) => base64::decode_buf(b),
		}
	}
}

/// Minimal local base64 shim so this crate doesn't need to pin the external `base64`
/// crate's specific engine API surface for two one-line calls.
mod base64 {
	pub fn encode_buf(bytes: &[u8]) -> String {
		::base64::Engine::encode(&::base64::engine::general_purpose::STANDARD, bytes)
	}
	pub fn decode_buf(s: &str) -> Vec<u8> {
		::base64::Engine::decode(&::base64::engine::general_purpose::STANDARD, s).unwrap_or_default()
	}
}

/// Protocol-specific request/response content plus the request/response timestamps,
/// opaque to everything except the parser that produced it (§6 `Parser` trait).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MockSpec {
	pub request: Vec<Payload>,
	pub response: Vec<Payload>,
	pub request_time_ns: i64,
	pub response_time_ns: i64,
	/// `"config"` marks initialization/handshake traffic recognised by the parser
	/// (§4.5); absent for ordinary request/response mocks.
	pub metadata_type: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Mock {
	pub kind: Kind,
	pub name: String,
	pub spec: MockSpec,
	pub sort_order: i64,
	pub id: u64,
	pub is_filtered: bool,
}

impl Mock {
	pub fn key(&self) -> (i64, u64) {
		(self.sort_order, self.id)
	}
}
