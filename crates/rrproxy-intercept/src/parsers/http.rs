//! HTTP/1.x request/response parsing and noise/ordering-aware comparison (§4.5, §4.3).
//!
//! `httparse` (not a reference-stack dependency, pulled in per the enrichment note in
//! `DESIGN.md`) handles start-line/header tokenizing; everything past that — JSON noise
//! masking, `ignoreOrdering` multiset equality — is this crate's own.

use std::collections::HashMap;

use rrproxy_store::{Kind, MockStore, Payload, Session};

use super::{default_match_and_consume, MatchOutcome, Parser};
use crate::error::InterceptError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpExchange {
	pub method: String,
	pub path: String,
	pub headers: Vec<(String, String)>,
	pub body: Vec<u8>,
}

pub fn parse_http_message(bytes: &[u8]) -> Result<HttpExchange, InterceptError> {
	let mut headers = [httparse::EMPTY_HEADER; 64];
	let mut req = httparse::Request::new(&mut headers);
	let status = req
		.parse(bytes)
		.map_err(|e| InterceptError::MalformedRequest(e.to_string()))?;
	let header_end = match status {
		httparse::Status::Complete(n) => n,
		httparse::Status::Partial => {
			return Err(InterceptError::Truncated {
				expected: bytes.len() + 1,
				got: bytes.len(),
			})
		},
	};
	let method = req.method.unwrap_or("GET").to_string();
	let path = req.path.unwrap_or("/").to_string();
	let parsed_headers = req
		.headers
		.iter()
		.map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).to_string()))
		.collect();
	Ok(HttpExchange {
		method,
		path,
		headers: parsed_headers,
		body: bytes[header_end..].to_vec(),
	})
}

fn header_matches_noise(name: &str, noise_paths: &[String]) -> bool {
	let lname = name.to_ascii_lowercase();
	noise_paths.iter().any(|p| {
		p.strip_prefix("header.")
			.map(|h| h.eq_ignore_ascii_case(&lname) || h == "*")
			.unwrap_or(false)
	})
}

fn body_noise_paths(noise_paths: &[String]) -> Vec<String> {
	noise_paths.iter().filter_map(|p| p.strip_prefix("body.").map(|b| b.to_string())).collect()
}

/// Remove a dotted path (`a.b.c`, or `*` for "the whole value") from a JSON value in
/// place, so later equality treats the masked field as absent from both sides.
fn remove_path(value: &mut serde_json::Value, path: &str) {
	if path == "*" {
		*value = serde_json::Value::Null;
		return;
	}
	let mut parts = path.splitn(2, '.');
	let head = parts.next().unwrap_or("");
	let rest = parts.next();
	if let serde_json::Value::Object(map) = value {
		if let Some(rest) = rest {
			if let Some(child) = map.get_mut(head) {
				remove_path(child, rest);
			}
		} else {
			map.remove(head);
		}
	}
}

/// JSON equality where `ignoreOrdering` makes arrays compare as multisets (preserving
/// multiplicity: `[1,1,1]` never matches `[1,2,3]`) at every depth.
pub fn json_equal(a: &serde_json::Value, b: &serde_json::Value, ignore_ordering: bool) -> bool {
	use serde_json::Value;
	match (a, b) {
		(Value::Array(xs), Value::Array(ys)) => {
			if xs.len() != ys.len() {
				return false;
			}
			if !ignore_ordering {
				return xs.iter().zip(ys.iter()).all(|(x, y)| json_equal(x, y, ignore_ordering));
			}
			let mut remaining: Vec<&Value> = ys.iter().collect();
			for x in xs {
				let Some(pos) = remaining.iter().position(|y| json_equal(x, y, ignore_ordering)) else {
					return false;
				};
				remaining.remove(pos);
			}
			true
		},
		(Value::Object(xs), Value::Object(ys)) => {
			if xs.len() != ys.len() {
				return false;
			}
			xs.iter().all(|(k, v)| ys.get(k).is_some_and(|yv| json_equal(v, yv, ignore_ordering)))
		},
		_ => a == b,
	}
}

/// Canonicalises a non-JSON payload (§4.5): pairs each top-level balanced `{...}` group
/// with whatever label text precedes it into one sibling block, recursively canonicalises
/// the group's own contents the same way, then sorts the resulting siblings before
/// rejoining them so two payloads that differ only in sibling order compare equal. A
/// trailing run of label-only text with no following group becomes its own sibling.
/// Quoted runs (`'`, `"`, `` ` ``) are copied through untouched and don't contribute to
/// brace-depth accounting, so a literal `{` inside a string can't unbalance the scan.
fn canonicalize_non_json(s: &str) -> String {
	let mut blocks = split_top_level_blocks(s);
	blocks.sort();
	blocks.join("\u{1}")
}

fn split_top_level_blocks(s: &str) -> Vec<String> {
	let chars: Vec<char> = s.chars().collect();
	let mut blocks = Vec::new();
	let mut current = String::new();
	let mut quote: Option<char> = None;
	let mut i = 0;
	while i < chars.len() {
		let c = chars[i];
		if let Some(q) = quote {
			current.push(c);
			if c == q {
				quote = None;
			}
			i += 1;
			continue;
		}
		match c {
			'"' | '\'' | '`' => {
				quote = Some(c);
				current.push(c);
				i += 1;
			},
			'{' => {
				let (consumed, body) = extract_balanced(&chars[i..]);
				current.push('{');
				current.push_str(&canonicalize_non_json(&body));
				current.push('}');
				blocks.push(current.trim().to_string());
				current = String::new();
				i += consumed;
			},
			_ => {
				current.push(c);
				i += 1;
			},
		}
	}
	if !current.trim().is_empty() {
		blocks.push(current.trim().to_string());
	}
	blocks
}

/// `chars[0]` must be `{`. Returns the char count spanned by the balanced group (both
/// braces included) and the raw text between them, unprocessed. An unterminated group
/// consumes the rest of `chars` as its body.
fn extract_balanced(chars: &[char]) -> (usize, String) {
	debug_assert_eq!(chars.first(), Some(&'{'));
	let mut depth = 1i32;
	let mut quote: Option<char> = None;
	let mut body = String::new();
	let mut i = 1;
	while i < chars.len() {
		let c = chars[i];
		if let Some(q) = quote {
			body.push(c);
			if c == q {
				quote = None;
			}
			i += 1;
			continue;
		}
		match c {
			'"' | '\'' | '`' => {
				quote = Some(c);
				body.push(c);
			},
			'{' => {
				depth += 1;
				body.push(c);
			},
			'}' => {
				depth -= 1;
				if depth == 0 {
					return (i + 1, body);
				}
				body.push(c);
			},
			_ => body.push(c),
		}
		i += 1;
	}
	(chars.len(), body)
}

pub fn bodies_equal(expected: &[u8], actual: &[u8], noise_body_paths: &[String], ignore_ordering: bool) -> bool {
	if noise_body_paths.iter().any(|p| p == "*") {
		return true;
	}
	match (serde_json::from_slice::<serde_json::Value>(expected), serde_json::from_slice::<serde_json::Value>(actual)) {
		(Ok(mut ev), Ok(mut av)) => {
			for path in noise_body_paths {
				remove_path(&mut ev, path);
				remove_path(&mut av, path);
			}
			json_equal(&ev, &av, ignore_ordering)
		},
		_ => {
			let e = String::from_utf8_lossy(expected);
			let a = String::from_utf8_lossy(actual);
			canonicalize_non_json(&e) == canonicalize_non_json(&a)
		},
	}
}

pub fn exchanges_equal(expected: &HttpExchange, actual: &HttpExchange, noise_paths: &[String], ignore_ordering: bool) -> bool {
	if expected.method != actual.method || expected.path != actual.path {
		return false;
	}
	let expected_headers: HashMap<String, &String> = expected
		.headers
		.iter()
		.filter(|(k, _)| !header_matches_noise(k, noise_paths))
		.map(|(k, v)| (k.to_ascii_lowercase(), v))
		.collect();
	let actual_headers: HashMap<String, &String> = actual
		.headers
		.iter()
		.filter(|(k, _)| !header_matches_noise(k, noise_paths))
		.map(|(k, v)| (k.to_ascii_lowercase(), v))
		.collect();
	if expected_headers != actual_headers {
		return false;
	}
	bodies_equal(&expected.body, &actual.body, &body_noise_paths(noise_paths), ignore_ordering)
}

fn exchange_to_payload(exchange: &HttpExchange) -> Payload {
	let mut text = format!("{} {}\n", exchange.method, exchange.path);
	let mut sorted = exchange.headers.clone();
	sorted.sort();
	for (k, v) in &sorted {
		text.push_str(&format!("{k}: {v}\n"));
	}
	text.push('\n');
	text.push_str(&String::from_utf8_lossy(&exchange.body));
	Payload::Text(text)
}

pub struct HttpParser;

impl Parser for HttpParser {
	fn kind(&self) -> Kind {
		Kind::Http
	}

	fn decode_request(&self, bytes: &[u8]) -> Result<Vec<Payload>, InterceptError> {
		let exchange = parse_http_message(bytes)?;
		Ok(vec![exchange_to_payload(&exchange)])
	}

	fn encode_response(&self, response: &[Payload]) -> Result<Vec<u8>, InterceptError> {
		Ok(response.iter().flat_map(|p| p.as_bytes()).collect())
	}

	fn match_and_consume(&self, request: &[Payload], store: &MockStore, session: &Session) -> Option<MatchOutcome> {
		let options = session.outgoing_options.read().clone();
		let Some(Payload::Text(request_text)) = request.first() else {
			return default_match_and_consume(Kind::Http, request, store, session);
		};
		let Ok(actual) = parse_exchange_from_canonical(request_text) else {
			return default_match_and_consume(Kind::Http, request, store, session);
		};

		for candidate in store.get_filtered_by_kind(Kind::Http) {
			let Some(Payload::Text(expected_text)) = candidate.spec.request.first() else {
				continue;
			};
			let Ok(expected) = parse_exchange_from_canonical(expected_text) else { continue };
			if exchanges_equal(&expected, &actual, &options.noise_paths, options.ignore_ordering) {
				if let Ok(promoted) = store.update_unfiltered(&candidate, Kind::Http) {
					store.flag_consumed(promoted.name.clone(), rrproxy_store::mock_store::ConsumedUsage::Updated, false, promoted.sort_order);
					return Some(MatchOutcome {
						response: promoted.spec.response.clone(),
						mock_name: promoted.name.clone(),
						promoted: true,
						sort_order: promoted.sort_order,
						is_filtered_source: true,
					});
				}
			}
		}

		default_match_and_consume(Kind::Http, request, store, session)
	}
}

/// The canonical payload is round-trippable back into an `HttpExchange` for noise-aware
/// comparison: reverses `exchange_to_payload`.
fn parse_exchange_from_canonical(text: &str) -> Result<HttpExchange, InterceptError> {
	let mut lines = text.splitn(2, '\n');
	let request_line = lines.next().ok_or_else(|| InterceptError::MalformedRequest("empty".into()))?;
	let mut parts = request_line.splitn(2, ' ');
	let method = parts.next().unwrap_or("GET").to_string();
	let path = parts.next().unwrap_or("/").to_string();
	let rest = lines.next().unwrap_or("");
	let (header_block, body) = rest.split_once("\n\n").unwrap_or((rest, ""));
	let headers = header_block
		.lines()
		.filter_map(|l| l.split_once(": ").map(|(k, v)| (k.to_string(), v.to_string())))
		.collect();
	Ok(HttpExchange {
		method,
		path,
		headers,
		body: body.as_bytes().to_vec(),
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_request_line_and_headers() {
		let raw = b"GET /hello HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\n\r\n";
		let exchange = parse_http_message(raw).unwrap();
		assert_eq!(exchange.method, "GET");
		assert_eq!(exchange.path, "/hello");
		assert!(exchange.headers.iter().any(|(k, v)| k == "Host" && v == "x"));
	}

	#[test]
	fn ignore_ordering_treats_arrays_as_multisets() {
		let a = serde_json::json!([1, 2, 3]);
		let b = serde_json::json!([3, 2, 1]);
		assert!(json_equal(&a, &b, true));
		assert!(!json_equal(&a, &b, false));
	}

	#[test]
	fn ignore_ordering_preserves_multiplicity() {
		let a = serde_json::json!([1, 1, 1]);
		let b = serde_json::json!([1, 2, 3]);
		assert!(!json_equal(&a, &b, true));
	}

	#[test]
	fn noise_rule_masks_timestamp_field() {
		let expected = br#"{"status":"ok","timestamp":111}"#;
		let actual = br#"{"status":"ok","timestamp":222}"#;
		assert!(!bodies_equal(expected, actual, &[], false));
		assert!(bodies_equal(expected, actual, &["timestamp".to_string()], false));
	}

	#[test]
	fn wildcard_noise_ignores_entire_body() {
		assert!(bodies_equal(b"anything", b"totally different", &["*".to_string()], false));
	}

	#[test]
	fn header_noise_rule_ignores_named_header() {
		let expected = HttpExchange {
			method: "GET".into(),
			path: "/x".into(),
			headers: vec![("Date".into(), "a".into())],
			body: vec![],
		};
		let actual = HttpExchange {
			method: "GET".into(),
			path: "/x".into(),
			headers: vec![("Date".into(), "b".into())],
			body: vec![],
		};
		assert!(!exchanges_equal(&expected, &actual, &[], false));
		assert!(exchanges_equal(&expected, &actual, &["header.Date".to_string()], false));
	}

	#[test]
	fn non_json_body_reordered_top_level_blocks_match() {
		let expected = b"status{ok}time{111}";
		let actual = b"time{111}status{ok}";
		assert!(bodies_equal(expected, actual, &[], false));
	}

	#[test]
	fn non_json_body_reordered_nested_blocks_match() {
		let expected = b"a{x{2}y{1}}";
		let actual = b"a{y{1}x{2}}";
		assert!(bodies_equal(expected, actual, &[], false));
	}

	#[test]
	fn non_json_body_differing_values_do_not_match() {
		let expected = b"status{ok}time{111}";
		let actual = b"status{fail}time{111}";
		assert!(!bodies_equal(expected, actual, &[], false));
	}

	#[test]
	fn non_json_body_quoted_brace_does_not_unbalance_scan() {
		let expected = br#"tag{"note":"a{b"}plain{1}"#;
		let actual = br#"plain{1}tag{"note":"a{b"}"#;
		assert!(bodies_equal(expected, actual, &[], false));
		let different = br#"plain{1}tag{"note":"a{c"}"#;
		assert!(!bodies_equal(expected, different, &[], false));
	}
}
