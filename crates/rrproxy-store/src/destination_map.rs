//! C1: maps a hijacked connection's source port back to the destination the hook
//! collaborator observed it aiming at. Written by the hook, read exactly once by whichever
//! interceptor handles that flow.
//!
//! Backed by `flurry::HashMap`, the same concurrent-map choice the connection pool in the
//! reference proxy stack uses for its own concurrently-read-and-written keyed state: reads
//! never block on writers, and structural updates are lock-free from the caller's point of
//! view.

use flurry::HashMap;

use crate::net::{DestinationEntry, NetworkAddress};

pub struct DestinationMap {
	inner: HashMap<u16, DestinationEntry>,
}

impl DestinationMap {
	pub fn new() -> Self {
		DestinationMap { inner: HashMap::new() }
	}

	pub fn insert(&self, src_port: u16, address: NetworkAddress, pid: Option<u32>) {
		let guard = self.inner.guard();
		self.inner.insert(src_port, DestinationEntry { address, pid }, &guard);
	}

	/// The only read path: removes and returns the entry atomically, so two concurrent
	/// callers for the same port never both observe it.
	pub fn get_and_remove(&self, src_port: u16) -> Option<DestinationEntry> {
		let guard = self.inner.guard();
		self.inner.remove(&src_port, &guard).copied()
	}

	pub fn remove(&self, src_port: u16) {
		let guard = self.inner.guard();
		self.inner.remove(&src_port, &guard);
	}

	pub fn len(&self) -> usize {
		let guard = self.inner.guard();
		self.inner.len(&guard)
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

impl Default for DestinationMap {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Arc;

	fn addr(port: u16) -> NetworkAddress {
		NetworkAddress::V4 { addr: [10, 0, 0, 1], port }
	}

	#[test]
	fn insert_then_get_and_remove() {
		let map = DestinationMap::new();
		map.insert(12345, addr(80), Some(42));
		let entry = map.get_and_remove(12345).expect("entry must be present");
		assert_eq!(entry.address, addr(80));
		assert_eq!(entry.pid, Some(42));
		assert!(map.get_and_remove(12345).is_none());
	}

	#[test]
	fn missing_key_is_a_miss_not_an_error() {
		let map = DestinationMap::new();
		assert!(map.get_and_remove(1).is_none());
	}

	#[test]
	fn concurrent_consume_is_at_most_once() {
		let map = Arc::new(DestinationMap::new());
		map.insert(12345, addr(80), None);

		let m1 = map.clone();
		let m2 = map.clone();
		let t1 = std::thread::spawn(move || m1.get_and_remove(12345));
		let t2 = std::thread::spawn(move || m2.get_and_remove(12345));

		let r1 = t1.join().unwrap();
		let r2 = t2.join().unwrap();
		let hits = [r1, r2].into_iter().filter(Option::is_some).count();
		assert_eq!(hits, 1, "exactly one concurrent reader should observe the entry");
		assert!(map.get_and_remove(12345).is_none());
	}
}
