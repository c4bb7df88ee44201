//! OS signal handling: SIGINT/SIGTERM on Unix, Ctrl-C on Windows. A second Ctrl+C while a
//! shutdown is already underway forces an immediate exit rather than waiting on drain.

use tokio::sync::mpsc;

pub struct Shutdown {
	shutdown_tx: mpsc::Sender<()>,
	shutdown_rx: mpsc::Receiver<()>,
}

impl Shutdown {
	pub fn new() -> Self {
		let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
		Shutdown { shutdown_tx, shutdown_rx }
	}

	/// A cloneable handle that can trigger shutdown from anywhere (e.g. a control-plane
	/// `/agent/stop` handler).
	pub fn trigger(&self) -> ShutdownTrigger {
		ShutdownTrigger {
			shutdown_tx: self.shutdown_tx.clone(),
		}
	}

	/// Resolves when a signal arrives or an explicit trigger fires.
	pub async fn wait(mut self) {
		imp::wait_for_shutdown(&mut self.shutdown_rx).await
	}
}

impl Default for Shutdown {
	fn default() -> Self {
		Self::new()
	}
}

#[derive(Clone, Debug)]
pub struct ShutdownTrigger {
	shutdown_tx: mpsc::Sender<()>,
}

impl ShutdownTrigger {
	pub async fn shutdown_now(&self) {
		let _ = self.shutdown_tx.send(()).await;
	}
}

#[cfg(unix)]
mod imp {
	use std::process;

	use tokio::signal::unix::{signal, SignalKind};
	use tokio::sync::mpsc::Receiver;
	use tracing::info;

	pub(super) async fn wait_for_shutdown(receiver: &mut Receiver<()>) {
		tokio::select! {
			_ = watch_signal(SignalKind::interrupt(), "SIGINT") => {
				tokio::spawn(async move {
					watch_signal(SignalKind::interrupt(), "SIGINT").await;
					info!("second interrupt received, exiting immediately");
					process::exit(0);
				});
			}
			_ = watch_signal(SignalKind::terminate(), "SIGTERM") => {}
			_ = receiver.recv() => { info!("shutdown triggered explicitly"); }
		};
	}

	async fn watch_signal(kind: SignalKind, name: &'static str) {
		signal(kind).expect("failed to register signal handler").recv().await;
		info!(signal = name, "received signal, starting shutdown");
	}
}

#[cfg(not(unix))]
mod imp {
	use tokio::sync::mpsc::Receiver;
	use tracing::info;

	pub(super) async fn wait_for_shutdown(receiver: &mut Receiver<()>) {
		tokio::select! {
			_ = watch_signal() => {}
			_ = receiver.recv() => { info!("shutdown triggered explicitly"); }
		};
	}

	async fn watch_signal() {
		tokio::signal::windows::ctrl_c()
			.expect("failed to register signal handler")
			.recv()
			.await;
		info!("received ctrl-c, starting shutdown");
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	#[tokio::test]
	async fn explicit_trigger_wakes_wait() {
		let shutdown = Shutdown::new();
		let trigger = shutdown.trigger();
		let waiter = tokio::spawn(shutdown.wait());
		trigger.shutdown_now().await;
		tokio::time::timeout(Duration::from_millis(200), waiter)
			.await
			.expect("wait() should resolve once triggered")
			.unwrap();
	}
}
