//! Build/version metadata surfaced on the control plane for operational debugging.

#[derive(Clone, Debug, serde::Serialize)]
pub struct BuildInfo {
	pub version: &'static str,
	pub git_sha: &'static str,
	pub rust_version: &'static str,
}

pub fn build_info() -> BuildInfo {
	BuildInfo {
		version: env!("CARGO_PKG_VERSION"),
		git_sha: option_env!("RRPROXY_GIT_SHA").unwrap_or("unknown"),
		rust_version: option_env!("RRPROXY_RUSTC_VERSION").unwrap_or("unknown"),
	}
}
