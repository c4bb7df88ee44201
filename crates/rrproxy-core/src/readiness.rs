//! Startup readiness tracking. Subsystems register a named block before they begin
//! initializing and drop the returned guard when they're done; the control plane's
//! `/readyz` handler reports "ready" once the registered set is empty.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::info;

#[derive(Clone)]
pub struct Ready {
	pending: Arc<Mutex<HashSet<String>>>,
	start: Instant,
}

impl Ready {
	pub fn new() -> Self {
		Ready {
			pending: Arc::new(Mutex::new(HashSet::new())),
			start: Instant::now(),
		}
	}

	/// Register a named task as not-yet-ready. Dropping the returned guard marks it ready.
	pub fn register_task(&self, name: &str) -> BlockReady {
		self.pending.lock().insert(name.to_string());
		BlockReady {
			name: name.to_string(),
			pending: self.pending.clone(),
			start: self.start,
		}
	}

	pub fn pending_tasks(&self) -> Vec<String> {
		self.pending.lock().iter().cloned().collect()
	}

	pub fn is_ready(&self) -> bool {
		self.pending.lock().is_empty()
	}
}

impl Default for Ready {
	fn default() -> Self {
		Self::new()
	}
}

pub struct BlockReady {
	name: String,
	pending: Arc<Mutex<HashSet<String>>>,
	start: Instant,
}

impl BlockReady {
	/// Register a nested sub-task that must also complete before the parent is ready.
	pub fn subtask(&self, name: &str) -> BlockReady {
		let full = format!("{}/{}", self.name, name);
		self.pending.lock().insert(full.clone());
		BlockReady {
			name: full,
			pending: self.pending.clone(),
			start: self.start,
		}
	}
}

impl Drop for BlockReady {
	fn drop(&mut self) {
		self.pending.lock().remove(&self.name);
		info!(task = %self.name, elapsed = ?self.start.elapsed(), "task ready");
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ready_once_all_blocks_dropped() {
		let ready = Ready::new();
		let a = ready.register_task("a");
		let b = ready.register_task("b");
		assert!(!ready.is_ready());
		drop(a);
		assert!(!ready.is_ready());
		drop(b);
		assert!(ready.is_ready());
	}

	#[test]
	fn subtasks_block_parent() {
		let ready = Ready::new();
		let a = ready.register_task("a");
		let sub = a.subtask("init");
		drop(a);
		assert!(!ready.is_ready());
		drop(sub);
		assert!(ready.is_ready());
	}
}
