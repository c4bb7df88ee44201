//! C2: the ordered, kind-indexed container of recorded mocks. Two disjoint pools per kind
//! — *filtered* (the primary pool a request is matched against) and *unfiltered* (the
//! fallback/"already used" pool) — plus a flat, cross-kind *global* pool kept in sync for
//! compatibility and to self-heal the rare case where a per-kind tree falls behind.
//!
//! Modeled on the reference proxy's `ConfigStore`: an outer lock guards the map of kinds,
//! each kind's own state sits behind its own lock so a point update to one kind never
//! blocks a read of another.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::StoreError;
use crate::mock::{Kind, Mock};

type Key = (i64, u64);
type GlobalKey = (Kind, i64, u64);

#[derive(Default)]
struct KindPools {
	filtered: BTreeMap<Key, Arc<Mock>>,
	unfiltered: BTreeMap<Key, Arc<Mock>>,
	revision: u64,
	next_sort_order: i64,
}

impl KindPools {
	fn bump_next_sort_order(&mut self, candidate: i64) {
		if candidate >= self.next_sort_order {
			self.next_sort_order = candidate + 1;
		}
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsumedUsage {
	Updated,
	Deleted,
}

struct ConsumedEntry {
	usage: ConsumedUsage,
	is_filtered: bool,
	sort_order: i64,
}

pub struct MockStore {
	kinds: RwLock<HashMap<Kind, Arc<RwLock<KindPools>>>>,
	global_filtered: RwLock<BTreeMap<GlobalKey, Arc<Mock>>>,
	global_unfiltered: RwLock<BTreeMap<GlobalKey, Arc<Mock>>>,
	global_revision: AtomicU64,
	consumed: parking_lot::Mutex<HashMap<String, ConsumedEntry>>,
}

impl MockStore {
	pub fn new() -> Self {
		MockStore {
			kinds: RwLock::new(HashMap::new()),
			global_filtered: RwLock::new(BTreeMap::new()),
			global_unfiltered: RwLock::new(BTreeMap::new()),
			global_revision: AtomicU64::new(0),
			consumed: parking_lot::Mutex::new(HashMap::new()),
		}
	}

	fn kind_pools(&self, kind: Kind) -> Arc<RwLock<KindPools>> {
		if let Some(p) = self.kinds.read().get(&kind) {
			return p.clone();
		}
		self.kinds.write().entry(kind).or_insert_with(|| Arc::new(RwLock::new(KindPools::default()))).clone()
	}

	pub fn revision(&self, kind: Kind) -> u64 {
		self.kind_pools(kind).read().revision
	}

	pub fn global_revision(&self) -> u64 {
		self.global_revision.load(Ordering::SeqCst)
	}

	/// Replace the entire filtered pool for every kind present in `mocks`. Kinds not
	/// mentioned are left untouched. Missing `sort_order`/`id` are assigned densely by
	/// position within each kind's slice, in the order given.
	pub fn set_filtered(&self, mocks: Vec<Mock>) {
		self.set_pool(mocks, true);
	}

	pub fn set_unfiltered(&self, mocks: Vec<Mock>) {
		self.set_pool(mocks, false);
	}

	fn set_pool(&self, mocks: Vec<Mock>, filtered: bool) {
		let mut by_kind: HashMap<Kind, Vec<Mock>> = HashMap::new();
		for m in mocks {
			by_kind.entry(m.kind).or_default().push(m);
		}

		let mut touched_global = false;
		for (kind, mut kind_mocks) in by_kind {
			for (idx, m) in kind_mocks.iter_mut().enumerate() {
				m.sort_order = idx as i64 + 1;
				m.id = idx as u64 + 1;
				m.is_filtered = filtered;
			}
			let arced: Vec<Arc<Mock>> = kind_mocks.into_iter().map(Arc::new).collect();
			let tree: BTreeMap<Key, Arc<Mock>> = arced.iter().map(|m| (m.key(), m.clone())).collect();

			let pools = self.kind_pools(kind);
			{
				let mut pools = pools.write();
				if filtered {
					pools.filtered = tree;
				} else {
					pools.unfiltered = tree;
				}
				for m in &arced {
					pools.bump_next_sort_order(m.sort_order);
				}
				pools.revision += 1;
			}

			let mut global = if filtered { self.global_filtered.write() } else { self.global_unfiltered.write() };
			global.retain(|(k, _, _), _| *k != kind);
			for m in &arced {
				global.insert((kind, m.sort_order, m.id), m.clone());
			}
			touched_global = true;
		}
		if touched_global {
			self.global_revision.fetch_add(1, Ordering::SeqCst);
		}
	}

	/// Snapshot of the filtered pool for `kind` in `(sortOrder, id)` order. Immutable by
	/// construction: it's an owned clone of the tree's `Arc<Mock>` values, so later
	/// mutation of the store is never visible through an already-taken snapshot.
	pub fn get_filtered_by_kind(&self, kind: Kind) -> Vec<Arc<Mock>> {
		self.kind_pools(kind).read().filtered.values().cloned().collect()
	}

	pub fn get_unfiltered_by_kind(&self, kind: Kind) -> Vec<Arc<Mock>> {
		self.kind_pools(kind).read().unfiltered.values().cloned().collect()
	}

	/// Move `old` out of its kind's filtered pool and into `new_kind`'s unfiltered pool,
	/// with a fresh, monotonically increasing sort order so it sorts to the tail. Fails
	/// with `StaleMock` if `old` is no longer present at its recorded key (a concurrent
	/// caller won the race first); the caller is expected to re-snapshot and retry.
	pub fn update_unfiltered(&self, old: &Mock, new_kind: Kind) -> Result<Arc<Mock>, StoreError> {
		let old_pools = self.kind_pools(old.kind);
		let removed = {
			let mut guard = old_pools.write();
			guard.filtered.remove(&old.key())
		};
		let Some(removed) = removed else {
			return Err(StoreError::StaleMock {
				name: old.name.clone(),
				sort_order: old.sort_order,
				id: old.id,
			});
		};

		{
			let mut global = self.global_filtered.write();
			global.remove(&(old.kind, old.sort_order, old.id));
		}

		let new_pools = self.kind_pools(new_kind);
		let mut new_mock = (*removed).clone();
		new_mock.kind = new_kind;
		new_mock.is_filtered = false;

		let arced = {
			let mut guard = new_pools.write();
			new_mock.sort_order = guard.next_sort_order;
			guard.next_sort_order += 1;
			let arced = Arc::new(new_mock);
			guard.unfiltered.insert(arced.key(), arced.clone());
			guard.revision += 1;
			arced
		};
		self.global_unfiltered.write().insert((new_kind, arced.sort_order, arced.id), arced.clone());
		self.global_revision.fetch_add(1, Ordering::SeqCst);
		Ok(arced)
	}

	/// Insert directly into the per-kind unfiltered tree if the global tree already has
	/// this mock but the per-kind tree lost it (e.g. it was never populated for this
	/// kind). Reports success either way.
	pub fn self_heal_unfiltered(&self, kind: Kind, mock: Arc<Mock>) {
		let pools = self.kind_pools(kind);
		let mut guard = pools.write();
		if !guard.unfiltered.contains_key(&mock.key()) {
			tracing::warn!(kind = ?kind, name = %mock.name, "self-healing per-kind unfiltered tree from global pool");
			guard.bump_next_sort_order(mock.sort_order);
			guard.unfiltered.insert(mock.key(), mock);
			guard.revision += 1;
		}
	}

	pub fn delete_filtered(&self, mock: &Mock) {
		let pools = self.kind_pools(mock.kind);
		let removed = {
			let mut guard = pools.write();
			let removed = guard.filtered.remove(&mock.key()).is_some();
			if removed {
				guard.revision += 1;
			}
			removed
		};
		if removed {
			let mut global = self.global_filtered.write();
			if global.remove(&(mock.kind, mock.sort_order, mock.id)).is_some() {
				self.global_revision.fetch_add(1, Ordering::SeqCst);
			}
		}
	}

	pub fn delete_unfiltered(&self, mock: &Mock) {
		let pools = self.kind_pools(mock.kind);
		let removed = {
			let mut guard = pools.write();
			let removed = guard.unfiltered.remove(&mock.key()).is_some();
			if removed {
				guard.revision += 1;
			}
			removed
		};
		if removed {
			let mut global = self.global_unfiltered.write();
			if global.remove(&(mock.kind, mock.sort_order, mock.id)).is_some() {
				self.global_revision.fetch_add(1, Ordering::SeqCst);
			}
		}
	}

	pub fn flag_consumed(&self, name: impl Into<String>, usage: ConsumedUsage, is_filtered: bool, sort_order: i64) {
		self.consumed.lock().insert(name.into(), ConsumedEntry { usage, is_filtered, sort_order });
	}

	/// Drain the consumed ledger, sorted by the trailing `-<int>` numeric suffix in the
	/// name when present (so `req-7` precedes `req-10`); names without such a suffix sort
	/// after every numeric-suffixed name, lexicographically among themselves. Entries
	/// inserted during the drain are not observed by it and survive into the next call.
	pub fn get_consumed(&self) -> Vec<(String, ConsumedUsage, bool, i64)> {
		let mut guard = self.consumed.lock();
		let mut names: Vec<String> = guard.keys().cloned().collect();
		names.sort_by(|a, b| numeric_suffix_key(a).cmp(&numeric_suffix_key(b)));
		names
			.into_iter()
			.filter_map(|name| guard.remove(&name).map(|e| (name, e.usage, e.is_filtered, e.sort_order)))
			.collect()
	}
}

impl Default for MockStore {
	fn default() -> Self {
		Self::new()
	}
}

/// Sorts numeric-suffixed names (`req-2` < `req-7` < `req-10`) ahead of every suffix-less
/// name, which falls back to lexicographic order among themselves. The numeric comparison
/// must win outright over any string comparison, so the key leads with "has no suffix?"
/// rather than pairing the suffix with the name's prefix text.
fn numeric_suffix_key(name: &str) -> (bool, i64, &str) {
	if let Some(dash) = name.rfind('-') {
		if let Ok(n) = name[dash + 1..].parse::<i64>() {
			return (false, n, name);
		}
	}
	(true, 0, name)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::mock::MockSpec;

	fn mock(kind: Kind, name: &str) -> Mock {
		Mock {
			kind,
			name: name.to_string(),
			spec: MockSpec {
				request: vec![],
				response: vec![],
				request_time_ns: 0,
				response_time_ns: 0,
				metadata_type: None,
			},
			sort_order: 0,
			id: 0,
			is_filtered: true,
		}
	}

	#[test]
	fn set_filtered_assigns_dense_order() {
		let store = MockStore::new();
		store.set_filtered(vec![mock(Kind::Http, "a"), mock(Kind::Http, "b")]);
		let snapshot = store.get_filtered_by_kind(Kind::Http);
		assert_eq!(snapshot.len(), 2);
		assert_eq!(snapshot[0].name, "a");
		assert_eq!(snapshot[0].sort_order, 1);
		assert_eq!(snapshot[1].sort_order, 2);
	}

	#[test]
	fn snapshot_is_stable_across_mutation() {
		let store = MockStore::new();
		store.set_filtered(vec![mock(Kind::Http, "a")]);
		let snapshot = store.get_filtered_by_kind(Kind::Http);
		store.set_filtered(vec![mock(Kind::Http, "b"), mock(Kind::Http, "c")]);
		assert_eq!(snapshot.len(), 1);
		assert_eq!(snapshot[0].name, "a");
	}

	#[test]
	fn update_unfiltered_promotes_and_bumps_sort_order() {
		let store = MockStore::new();
		store.set_filtered(vec![mock(Kind::Http, "a"), mock(Kind::Http, "b")]);
		let a = store.get_filtered_by_kind(Kind::Http)[0].clone();

		let promoted = store.update_unfiltered(&a, Kind::Http).expect("promotion should succeed");
		assert!(!promoted.is_filtered);
		assert!(promoted.sort_order > 2);

		let filtered_after = store.get_filtered_by_kind(Kind::Http);
		assert_eq!(filtered_after.len(), 1);
		assert_eq!(filtered_after[0].name, "b");

		let unfiltered_after = store.get_unfiltered_by_kind(Kind::Http);
		assert_eq!(unfiltered_after.len(), 1);
		assert_eq!(unfiltered_after[0].name, "a");
	}

	#[test]
	fn update_unfiltered_fails_on_lost_race() {
		let store = MockStore::new();
		store.set_filtered(vec![mock(Kind::Http, "a")]);
		let a = store.get_filtered_by_kind(Kind::Http)[0].clone();

		store.update_unfiltered(&a, Kind::Http).unwrap();
		let err = store.update_unfiltered(&a, Kind::Http).unwrap_err();
		assert!(matches!(err, StoreError::StaleMock { .. }));
	}

	#[test]
	fn revision_increases_only_on_real_change() {
		let store = MockStore::new();
		store.set_filtered(vec![mock(Kind::Http, "a")]);
		let rev = store.revision(Kind::Http);
		let absent = mock(Kind::Http, "missing");
		store.delete_filtered(&absent);
		assert_eq!(store.revision(Kind::Http), rev, "deleting an absent mock must not bump revision");

		let a = store.get_filtered_by_kind(Kind::Http)[0].clone();
		store.delete_filtered(&a);
		assert!(store.revision(Kind::Http) > rev);
	}

	#[test]
	fn consumed_drain_orders_by_numeric_suffix_then_lex() {
		let store = MockStore::new();
		store.flag_consumed("req-10", ConsumedUsage::Updated, true, 1);
		store.flag_consumed("req-2", ConsumedUsage::Updated, true, 1);
		store.flag_consumed("req-7", ConsumedUsage::Updated, true, 1);
		store.flag_consumed("alpha", ConsumedUsage::Updated, true, 1);

		let drained: Vec<String> = store.get_consumed().into_iter().map(|(n, ..)| n).collect();
		assert_eq!(drained, vec!["req-2", "req-7", "req-10", "alpha"]);
		assert!(store.get_consumed().is_empty());
	}

	#[test]
	fn self_heal_inserts_missing_entry_into_per_kind_tree() {
		let store = MockStore::new();
		// Populate the unfiltered pool for a different kind first, so `kind_pools` for
		// `Kind::Grpc` starts out with an empty (but existing) unfiltered tree — modelling
		// the "global tree has it, per-kind tree never saw it" divergence from §4.2.
		store.set_unfiltered(vec![mock(Kind::Http, "other-kind")]);

		let orphan = std::sync::Arc::new(mock(Kind::Grpc, "orphaned"));
		assert!(store.get_unfiltered_by_kind(Kind::Grpc).is_empty());

		store.self_heal_unfiltered(Kind::Grpc, orphan.clone());

		let healed = store.get_unfiltered_by_kind(Kind::Grpc);
		assert_eq!(healed.len(), 1);
		assert_eq!(healed[0].name, "orphaned");
	}

	#[test]
	fn self_heal_is_idempotent_when_entry_already_present() {
		let store = MockStore::new();
		let orphan = std::sync::Arc::new(mock(Kind::Http, "already-there"));
		store.self_heal_unfiltered(Kind::Http, orphan.clone());
		let rev_after_first = store.revision(Kind::Http);

		store.self_heal_unfiltered(Kind::Http, orphan);
		assert_eq!(store.revision(Kind::Http), rev_after_first, "re-healing an already-present entry must not bump revision again");
		assert_eq!(store.get_unfiltered_by_kind(Kind::Http).len(), 1);
	}

	#[test]
	fn consumed_drain_is_disjoint_across_calls() {
		let store = MockStore::new();
		store.flag_consumed("a", ConsumedUsage::Updated, true, 1);
		let first = store.get_consumed();
		store.flag_consumed("b", ConsumedUsage::Updated, true, 1);
		let second = store.get_consumed();
		assert_eq!(first.len(), 1);
		assert_eq!(second.len(), 1);
		assert_ne!(first[0].0, second[0].0);
	}
}
