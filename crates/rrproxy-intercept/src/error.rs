#[derive(thiserror::Error, Debug)]
pub enum InterceptError {
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),

	#[error("malformed request: {0}")]
	MalformedRequest(String),

	#[error("truncated message: expected {expected} bytes, got {got}")]
	Truncated { expected: usize, got: usize },

	#[error("unsupported field type: {0}")]
	UnsupportedField(String),

	#[error("upstream dial failed: {0}")]
	UpstreamDial(std::io::Error),

	#[error("hook redirector failed to load")]
	HookLoadFailed,

	#[error("h2 error: {0}")]
	H2(#[from] h2::Error),
}
