//! The pluggable per-protocol codec boundary (§6). A `Parser` knows how to turn wire bytes
//! into the comparable request representation the matching engine works with, how to turn
//! a matched mock's response back into wire bytes, and how to drive the match itself
//! (protocol-specific rules like gRPC full-method matching layer on top of the shared
//! exact/fuzzy algorithm in `rrproxy_store::matching`).
//!
//! Only `HttpParser` and `GenericParser` are implemented here; MySQL/Postgres/Redis/Mongo
//! remain represented by this trait boundary alone, per the spec's scope.

pub mod generic;
pub mod http;

use rrproxy_store::{Kind, MockStore, Payload, Session};

use crate::error::InterceptError;

pub struct MatchOutcome {
	pub response: Vec<Payload>,
	pub mock_name: String,
	pub promoted: bool,
	pub sort_order: i64,
	pub is_filtered_source: bool,
}

pub trait Parser: Send + Sync {
	fn kind(&self) -> Kind;

	fn decode_request(&self, bytes: &[u8]) -> Result<Vec<Payload>, InterceptError>;

	fn encode_response(&self, response: &[Payload]) -> Result<Vec<u8>, InterceptError>;

	/// Matches `request` against `store`'s pools for this parser's kind, flags the winning
	/// mock as consumed on `session`, and returns its response payloads.
	fn match_and_consume(&self, request: &[Payload], store: &MockStore, session: &Session) -> Option<MatchOutcome>;
}

pub(crate) fn default_match_and_consume(kind: Kind, request: &[Payload], store: &MockStore, session: &Session) -> Option<MatchOutcome> {
	let result = rrproxy_store::matching::match_and_consume_with_thresholds(store, kind, request, session.thresholds())?;
	// A match is always a read of an existing mock, never a deletion, so the consumed
	// ledger's usage is always `Updated` here; `Deleted` is for the CLI's delete path (§4.2).
	store.flag_consumed(result.mock.name.clone(), rrproxy_store::mock_store::ConsumedUsage::Updated, !result.promoted, result.mock.sort_order);
	Some(MatchOutcome {
		response: result.mock.spec.response.clone(),
		mock_name: result.mock.name.clone(),
		promoted: result.promoted,
		sort_order: result.mock.sort_order,
		is_filtered_source: !result.promoted,
	})
}
