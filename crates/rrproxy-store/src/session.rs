//! C6: the process-wide mode/sinks bundle shared by the ingress and egress interceptors.
//! Modeled on the reference proxy stack's `ProxyInputs` bundle-of-shared-state-behind-Arc
//! pattern: a single cheaply cloneable handle threaded into every per-connection task.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::error::StoreError;
use crate::matching::MatchThresholds;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
	Record,
	Replay,
}

#[derive(Clone, Debug)]
pub struct OutgoingOptions {
	pub ignore_ordering: bool,
	pub noise_paths: Vec<String>,
}

impl Default for OutgoingOptions {
	fn default() -> Self {
		OutgoingOptions {
			ignore_ordering: false,
			noise_paths: Vec::new(),
		}
	}
}

/// A captured request/response pair, emitted to the test-case sink by the ingress
/// interceptor (C3).
#[derive(Clone, Debug)]
pub struct TestCase {
	pub kind: crate::mock::Kind,
	pub request: Vec<crate::mock::Payload>,
	pub response: Vec<crate::mock::Payload>,
	pub request_time_ns: i64,
	pub response_time_ns: i64,
	pub app_port: u16,
}

pub struct Session {
	pub mode: RwLock<Mode>,
	pub mocking_enabled: std::sync::atomic::AtomicBool,
	pub outgoing_options: RwLock<OutgoingOptions>,
	pub thresholds: RwLock<MatchThresholds>,
	pub test_case_tx: mpsc::Sender<TestCase>,
	pub test_case_rx: parking_lot::Mutex<Option<mpsc::Receiver<TestCase>>>,
	pub mock_tx: mpsc::Sender<crate::mock::Mock>,
	pub mock_rx: parking_lot::Mutex<Option<mpsc::Receiver<crate::mock::Mock>>>,
}

const TEST_CASE_CHANNEL_CAPACITY: usize = 100;
const MOCK_CHANNEL_CAPACITY: usize = 500;

impl Session {
	pub fn new(mode: Mode) -> Arc<Self> {
		let (test_case_tx, test_case_rx) = mpsc::channel(TEST_CASE_CHANNEL_CAPACITY);
		let (mock_tx, mock_rx) = mpsc::channel(MOCK_CHANNEL_CAPACITY);
		Arc::new(Session {
			mode: RwLock::new(mode),
			mocking_enabled: std::sync::atomic::AtomicBool::new(mode == Mode::Replay),
			outgoing_options: RwLock::new(OutgoingOptions::default()),
			thresholds: RwLock::new(MatchThresholds::default()),
			test_case_tx,
			test_case_rx: parking_lot::Mutex::new(Some(test_case_rx)),
			mock_tx,
			mock_rx: parking_lot::Mutex::new(Some(mock_rx)),
		})
	}

	pub fn mode(&self) -> Mode {
		*self.mode.read()
	}

	pub fn mocking_enabled(&self) -> bool {
		self.mocking_enabled.load(std::sync::atomic::Ordering::SeqCst)
	}

	pub fn thresholds(&self) -> MatchThresholds {
		*self.thresholds.read()
	}

	pub fn take_test_case_receiver(&self) -> Option<mpsc::Receiver<TestCase>> {
		self.test_case_rx.lock().take()
	}

	pub fn take_mock_receiver(&self) -> Option<mpsc::Receiver<crate::mock::Mock>> {
		self.mock_rx.lock().take()
	}
}

/// Process-wide mapping from session id to its bundle. A fresh deployment of this system
/// uses a single session at id 0.
pub struct SessionRegistry {
	sessions: RwLock<HashMap<u64, Arc<Session>>>,
}

impl SessionRegistry {
	pub fn new() -> Self {
		SessionRegistry { sessions: RwLock::new(HashMap::new()) }
	}

	pub fn create(&self, id: u64, mode: Mode) -> Arc<Session> {
		let session = Session::new(mode);
		self.sessions.write().insert(id, session.clone());
		session
	}

	pub fn get(&self, id: u64) -> Result<Arc<Session>, StoreError> {
		self.sessions.read().get(&id).cloned().ok_or(StoreError::NoSession(id))
	}

	pub fn remove(&self, id: u64) {
		self.sessions.write().remove(&id);
	}
}

impl Default for SessionRegistry {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_session_has_zero_id_semantics() {
		let registry = SessionRegistry::new();
		registry.create(0, Mode::Record);
		let session = registry.get(0).expect("single-session deployment must have id 0");
		assert_eq!(session.mode(), Mode::Record);
		assert!(!session.mocking_enabled());
	}

	#[test]
	fn thresholds_default_to_090_and_040() {
		let session = Session::new(Mode::Replay);
		let t = session.thresholds();
		assert!((t.filtered - 0.9).abs() < 1e-9);
		assert!((t.unfiltered - 0.4).abs() < 1e-9);
	}

	#[test]
	fn thresholds_are_configurable_after_creation() {
		let session = Session::new(Mode::Replay);
		*session.thresholds.write() = MatchThresholds { filtered: 0.75, unfiltered: 0.2 };
		let t = session.thresholds();
		assert!((t.filtered - 0.75).abs() < 1e-9);
		assert!((t.unfiltered - 0.2).abs() < 1e-9);
	}

	#[test]
	fn unknown_session_is_an_error() {
		let registry = SessionRegistry::new();
		assert!(matches!(registry.get(7), Err(StoreError::NoSession(7))));
	}

	#[tokio::test]
	async fn test_case_sink_preserves_emission_order() {
		let session = Session::new(Mode::Record);
		let mut rx = session.take_test_case_receiver().unwrap();
		for i in 0..3 {
			session
				.test_case_tx
				.send(TestCase {
					kind: crate::mock::Kind::Http,
					request: vec![],
					response: vec![],
					request_time_ns: i,
					response_time_ns: i,
					app_port: 8080,
				})
				.await
				.unwrap();
		}
		drop(session.test_case_tx.clone());
		let mut seen = Vec::new();
		while let Some(tc) = rx.recv().await {
			seen.push(tc.request_time_ns);
			if seen.len() == 3 {
				break;
			}
		}
		assert_eq!(seen, vec![0, 1, 2]);
	}
}
