//! Graceful shutdown coordination between a supervisor and the long-running tasks it owns
//! (accept loops, per-connection forwarders). A [`DrainTrigger`] asks every outstanding
//! [`DrainWatcher`] to wind down; [`run_with_drain`] is the usual way a component consumes
//! that signal: it gives its inner future a bounded grace period to finish on its own
//! before the caller gives up on it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tracing::{info, warn};

pub fn new() -> (DrainTrigger, DrainWatcher) {
	let (signal_tx, signal_rx) = watch::channel(false);
	let (done_tx, done_rx) = mpsc::channel::<()>(1);
	(
		DrainTrigger {
			signal_tx,
			done_rx: Arc::new(Mutex::new(done_rx)),
		},
		DrainWatcher {
			signal_rx,
			_done_tx: done_tx,
		},
	)
}

pub struct DrainTrigger {
	signal_tx: watch::Sender<bool>,
	done_rx: Arc<Mutex<mpsc::Receiver<()>>>,
}

impl DrainTrigger {
	/// Fire the drain signal, then wait until every [`DrainWatcher`] clone has been
	/// dropped, or `deadline` elapses, whichever comes first.
	pub async fn start_drain_and_wait(&self, deadline: Duration) {
		let _ = self.signal_tx.send(true);
		let mut done_rx = self.done_rx.lock().await;
		if tokio::time::timeout(deadline, done_rx.recv()).await.is_err() {
			warn!(?deadline, "drain deadline elapsed with watchers still outstanding");
		}
	}
}

#[derive(Clone)]
pub struct DrainWatcher {
	signal_rx: watch::Receiver<bool>,
	_done_tx: mpsc::Sender<()>,
}

impl DrainWatcher {
	/// Resolves once the corresponding [`DrainTrigger`] has signaled drain. Safe to await
	/// repeatedly or from multiple clones.
	pub async fn signaled(&self) {
		let mut rx = self.signal_rx.clone();
		if *rx.borrow() {
			return;
		}
		let _ = rx.changed().await;
	}
}

/// Run `make_future` to completion, but once drain is signaled give it only `deadline`
/// more time before abandoning it. Returns `None` if the component did not finish within
/// the grace period.
pub async fn run_with_drain<F, O>(component: String, drain: DrainWatcher, deadline: Duration, make_future: F) -> Option<O>
where
	F: Future<Output = O>,
{
	tokio::pin!(make_future);
	tokio::select! {
		res = &mut make_future => Some(res),
		_ = drain.signaled() => {
			info!(component = %component, ?deadline, "drain signaled, waiting for component to finish");
			match tokio::time::timeout(deadline, &mut make_future).await {
				Ok(res) => Some(res),
				Err(_) => {
					warn!(component = %component, "component did not finish within drain deadline, abandoning");
					None
				},
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	#[tokio::test]
	async fn graceful_shutdown_ok() {
		let (trigger, watcher) = new();
		let task = tokio::spawn(run_with_drain("test".to_string(), watcher, Duration::from_millis(200), async {
			tokio::time::sleep(Duration::from_millis(10)).await;
			42
		}));
		trigger.start_drain_and_wait(Duration::from_millis(500)).await;
		assert_eq!(task.await.unwrap(), Some(42));
	}

	#[tokio::test]
	async fn graceful_shutdown_timeout() {
		let (trigger, watcher) = new();
		let task = tokio::spawn(run_with_drain("test".to_string(), watcher, Duration::from_millis(10), async {
			tokio::time::sleep(Duration::from_secs(60)).await;
			42
		}));
		tokio::time::sleep(Duration::from_millis(20)).await;
		trigger.start_drain_and_wait(Duration::from_millis(200)).await;
		assert_eq!(task.await.unwrap(), None);
	}

	#[tokio::test]
	async fn signaled_before_wait_returns_immediately() {
		let (trigger, watcher) = new();
		let _ = trigger.signal_tx.send(true);
		tokio::time::timeout(Duration::from_millis(50), watcher.signaled())
			.await
			.expect("signaled() must resolve immediately when already signaled");
	}
}
