//! Boundary toward the platform-specific hook collaborator (§6): an eBPF redirector on one
//! OS, a user-mode packet-diversion driver on another. Modeled as a trait so a real FFI
//! backend can be dropped in without touching the interceptors; the in-repo implementation
//! is an in-memory fake sufficient for tests and for running this proxy stand-alone against
//! explicitly-configured listen ports (no transparent redirection).

use rrproxy_store::{DestinationMap, NetworkAddress};

use crate::error::InterceptError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookMode {
	Record,
	Replay,
}

#[async_trait::async_trait]
pub trait HookRedirector: Send + Sync {
	async fn start_redirector(
		&self,
		client_pid: u32,
		agent_pid: u32,
		proxy_port: u16,
		incoming_proxy_port: u16,
		dns_port: u16,
		mode: HookMode,
	) -> Result<(), InterceptError>;

	async fn stop_redirector(&self) -> Result<(), InterceptError>;

	/// Recover (and consume) the destination a hijacked flow from `src_port` was aiming
	/// at. A miss is not an error — callers fall back to whatever relocated address they
	/// were handed directly.
	fn get_destination(&self, src_port: u16) -> Option<NetworkAddress>;

	fn delete_destination(&self, src_port: u16);
}

/// In-memory fake used for tests and for stand-alone operation. Registrations are made
/// directly against the shared `DestinationMap` rather than via a kernel/eBPF call.
pub struct FakeHook {
	destinations: std::sync::Arc<DestinationMap>,
}

impl FakeHook {
	pub fn new(destinations: std::sync::Arc<DestinationMap>) -> Self {
		FakeHook { destinations }
	}

	pub fn register(&self, src_port: u16, address: NetworkAddress, pid: Option<u32>) {
		self.destinations.insert(src_port, address, pid);
	}
}

#[async_trait::async_trait]
impl HookRedirector for FakeHook {
	async fn start_redirector(
		&self,
		_client_pid: u32,
		_agent_pid: u32,
		_proxy_port: u16,
		_incoming_proxy_port: u16,
		_dns_port: u16,
		_mode: HookMode,
	) -> Result<(), InterceptError> {
		Ok(())
	}

	async fn stop_redirector(&self) -> Result<(), InterceptError> {
		Ok(())
	}

	fn get_destination(&self, src_port: u16) -> Option<NetworkAddress> {
		self.destinations.get_and_remove(src_port).map(|e| e.address)
	}

	fn delete_destination(&self, src_port: u16) {
		self.destinations.remove(src_port);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn fake_hook_round_trips_registration() {
		let map = std::sync::Arc::new(DestinationMap::new());
		let hook = FakeHook::new(map);
		let addr = NetworkAddress::V4 { addr: [127, 0, 0, 1], port: 9090 };
		hook.register(4000, addr, Some(1));
		assert_eq!(hook.get_destination(4000), Some(addr));
		assert_eq!(hook.get_destination(4000), None);
	}
}
