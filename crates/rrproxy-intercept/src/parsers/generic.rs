//! Fallback parser for any kind without a dedicated wire codec: the whole buffer is one
//! opaque payload, encoded as text or base64 per `Payload::encode` (§3).

use rrproxy_store::{Kind, MockStore, Payload, Session};

use super::{default_match_and_consume, MatchOutcome, Parser};
use crate::error::InterceptError;

pub struct GenericParser {
	kind: Kind,
}

impl GenericParser {
	pub fn new(kind: Kind) -> Self {
		GenericParser { kind }
	}
}

impl Parser for GenericParser {
	fn kind(&self) -> Kind {
		self.kind
	}

	fn decode_request(&self, bytes: &[u8]) -> Result<Vec<Payload>, InterceptError> {
		Ok(vec![Payload::encode(bytes)])
	}

	fn encode_response(&self, response: &[Payload]) -> Result<Vec<u8>, InterceptError> {
		Ok(response.iter().flat_map(|p| p.as_bytes()).collect())
	}

	fn match_and_consume(&self, request: &[Payload], store: &MockStore, session: &Session) -> Option<MatchOutcome> {
		default_match_and_consume(self.kind, request, store, session)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rrproxy_store::session::Mode;

	#[test]
	fn round_trips_ascii_bytes() {
		let parser = GenericParser::new(Kind::Generic);
		let decoded = parser.decode_request(b"hello world").unwrap();
		let encoded = parser.encode_response(&decoded).unwrap();
		assert_eq!(encoded, b"hello world");
	}

	#[test]
	fn round_trips_binary_bytes() {
		let parser = GenericParser::new(Kind::Generic);
		let raw = vec![0u8, 159, 146, 150, 1, 2, 3];
		let decoded = parser.decode_request(&raw).unwrap();
		let encoded = parser.encode_response(&decoded).unwrap();
		assert_eq!(encoded, raw);
	}

	#[test]
	fn no_match_when_store_empty() {
		let parser = GenericParser::new(Kind::Generic);
		let store = MockStore::new();
		let session = Session::new(Mode::Replay);
		let request = parser.decode_request(b"anything").unwrap();
		assert!(parser.match_and_consume(&request, &store, &session).is_none());
	}
}
