//! C5: exact-then-fuzzy matching of an intercepted request against the mock store,
//! with an optimistic promote-then-retry loop when a filtered-pool match is found.
//!
//! The "try the fast path, detect a lost race by re-reading fresh state, retry" shape is
//! the same one the reference proxy stack's connection pool uses when two callers race to
//! establish the same pooled connection: take an optimistic snapshot, attempt the
//! exclusive transition, and on failure just re-snapshot and try again rather than taking a
//! lock across the whole operation.

use std::sync::Arc;

use itertools::Itertools;

use crate::mock::{Kind, Mock, Payload};
use crate::mock_store::MockStore;

pub const DEFAULT_FILTERED_THRESHOLD: f64 = 0.9;
pub const DEFAULT_UNFILTERED_THRESHOLD: f64 = 0.4;

/// The similarity floors the fuzzy matcher applies to each pool (§4.5, §9: "expose them as
/// configuration knobs even though the default is wired in").
#[derive(Clone, Copy, Debug)]
pub struct MatchThresholds {
	pub filtered: f64,
	pub unfiltered: f64,
}

impl Default for MatchThresholds {
	fn default() -> Self {
		MatchThresholds {
			filtered: DEFAULT_FILTERED_THRESHOLD,
			unfiltered: DEFAULT_UNFILTERED_THRESHOLD,
		}
	}
}

pub struct MatchResult {
	pub mock: Arc<Mock>,
	pub promoted: bool,
}

fn shingle_k(len: usize) -> usize {
	let k = (len as f64 / 5.0).round() as i64;
	k.clamp(3, 8) as usize
}

fn shingles(s: &str, k: usize) -> std::collections::HashSet<&str> {
	let boundaries: Vec<usize> = s.char_indices().map(|(i, _)| i).collect();
	if boundaries.is_empty() {
		return std::collections::HashSet::new();
	}
	if boundaries.len() <= k {
		return std::iter::once(s).collect();
	}
	(0..=(boundaries.len() - k))
		.map(|start| {
			let begin = boundaries[start];
			let end = boundaries.get(start + k).copied().unwrap_or(s.len());
			&s[begin..end]
		})
		.unique()
		.collect()
}

/// Jaccard similarity of `a` and `b` over character k-shingles, `k` chosen adaptively from
/// `a`'s length. Symmetric, 1.0 for identical strings, 0.0 for disjoint strings of length
/// at least `k`.
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
	if a.is_empty() && b.is_empty() {
		return 1.0;
	}
	let k = shingle_k(a.chars().count().max(b.chars().count()));
	let sa = shingles(a, k);
	let sb = shingles(b, k);
	if sa.is_empty() && sb.is_empty() {
		return 1.0;
	}
	let intersection = sa.intersection(&sb).count();
	let union = sa.union(&sb).count();
	if union == 0 {
		0.0
	} else {
		intersection as f64 / union as f64
	}
}

fn payloads_text(payloads: &[Payload]) -> String {
	payloads
		.iter()
		.map(|p| match p {
			Payload::Text(s) => s.clone(),
			Payload::Binary(b) => b.clone(),
		})
		.collect::<Vec<_>>()
		.join("\u{0}")
}

fn best_candidate<'a>(request: &[Payload], candidates: &'a [Arc<Mock>], threshold: f64) -> Option<&'a Arc<Mock>> {
	let req_text = payloads_text(request);

	// Exact match first: same cardinality, byte-identical payloads.
	if let Some(exact) = candidates.iter().find(|c| c.spec.request == request) {
		return Some(exact);
	}

	let mut best: Option<(&Arc<Mock>, f64)> = None;
	for candidate in candidates.iter().filter(|c| c.spec.request.len() == request.len()) {
		let score = jaccard_similarity(&req_text, &payloads_text(&candidate.spec.request));
		if score <= threshold {
			continue;
		}
		match best {
			Some((_, best_score)) if score <= best_score => {},
			_ => best = Some((candidate, score)),
		}
	}
	best.map(|(m, _)| m)
}

/// Run the matcher against `kind`'s filtered pool, falling back to the unfiltered pool.
/// Restarts the filtered-pool attempt whenever a concurrent caller wins the promotion
/// race first (the revision-backed optimistic retry in §4.5 step 4).
pub fn match_and_consume_with_thresholds(store: &MockStore, kind: Kind, request: &[Payload], thresholds: MatchThresholds) -> Option<MatchResult> {
	loop {
		let snapshot = store.get_filtered_by_kind(kind);
		let Some(candidate) = best_candidate(request, &snapshot, thresholds.filtered) else {
			break;
		};
		match store.update_unfiltered(candidate, kind) {
			Ok(promoted) => {
				return Some(MatchResult { mock: promoted, promoted: true });
			},
			Err(_) => continue, // lost the race; re-snapshot and try again
		}
	}

	let snapshot = store.get_unfiltered_by_kind(kind);
	best_candidate(request, &snapshot, thresholds.unfiltered).map(|m| MatchResult {
		mock: m.clone(),
		promoted: false,
	})
}

/// Convenience wrapper over [`match_and_consume_with_thresholds`] using the default
/// similarity floors (0.9 filtered, 0.4 unfiltered).
pub fn match_and_consume(store: &MockStore, kind: Kind, request: &[Payload]) -> Option<MatchResult> {
	match_and_consume_with_thresholds(store, kind, request, MatchThresholds::default())
}
