#[derive(thiserror::Error, Debug)]
pub enum WatchdogError {
	#[error("io error reading/writing pid-file: {0}")]
	Io(#[from] std::io::Error),

	#[error("pid-file contents are not a valid process id: {0:?}")]
	MalformedPidFile(String),

	#[error("hook cleanup failed during crash recovery")]
	HookCleanupFailed,
}
