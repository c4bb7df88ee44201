//! Process entry point (§4.8): wires `tracing_subscriber` init, `clap`-parsed `Args`, the
//! Destination Map / Mock Store / Session Registry, the ingress/egress listeners, the
//! watchdog check, and the control-plane HTTP server as sibling tasks under one
//! `tokio::task::JoinSet` — matching the teacher's `src/main.rs::run_set: JoinSet` shape.

mod config;
mod control_plane;

use std::sync::Arc;

use clap::Parser;
use prometheus_client::registry::Registry;
use rrproxy_core::drain;
use rrproxy_core::readiness::Ready;
use rrproxy_core::signal::Shutdown;
use rrproxy_intercept::hook::FakeHook;
use rrproxy_intercept::{EgressInterceptor, HookRedirector, IngressInterceptor, ParserRegistry};
use rrproxy_store::{DestinationMap, Kind, MockStore, SessionRegistry};
use rrproxy_watchdog::Watchdog;
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const SESSION_ID: u64 = 0;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
		.with_writer(std::io::stderr)
		.with_ansi(false)
		.init();

	let args = config::Args::parse();
	let ingress_rules = config::parse_ingress_rules(&args.ingress)?;

	let destinations = Arc::new(DestinationMap::new());
	let store = Arc::new(MockStore::new());
	let sessions = SessionRegistry::new();
	let session = sessions.create(SESSION_ID, args.mode.into());
	*session.thresholds.write() = rrproxy_store::MatchThresholds {
		filtered: args.filtered_threshold,
		unfiltered: args.unfiltered_threshold,
	};

	let hook: Arc<dyn HookRedirector> = Arc::new(FakeHook::new(destinations.clone()));
	let ready = Ready::new();
	let shutdown = Shutdown::new();
	let (drain_trigger, drain_watcher) = drain::new();
	let drain_trigger = Arc::new(drain_trigger);

	let watchdog = Watchdog::new(hook.clone());
	{
		let _block = ready.register_task("watchdog");
		watchdog.check_and_claim().await?;
	}

	let mut tasks = JoinSet::new();
	let synchronous = args.sync;

	for rule in ingress_rules {
		let block = ready.register_task(&format!("ingress:{}", rule.listen_port));
		let session = session.clone();
		let drain_watcher = drain_watcher.clone();
		tasks.spawn(async move {
			let _block = block;
			let interceptor = IngressInterceptor::new(session, synchronous);
			let listen_addr = std::net::SocketAddr::from(([0, 0, 0, 0], rule.listen_port));
			let serve = interceptor.serve(listen_addr, rule.listen_port, rule.upstream);
			match drain::run_with_drain(format!("ingress:{}", rule.listen_port), drain_watcher, std::time::Duration::from_secs(5), serve).await {
				Some(Err(e)) => error!(error = %e, port = rule.listen_port, "ingress forwarder exited with error"),
				_ => {},
			}
		});
	}

	{
		let mut parsers = ParserRegistry::new();
		parsers.register(Arc::new(rrproxy_intercept::parsers::http::HttpParser));
		let parsers = Arc::new(parsers);
		let session = session.clone();
		let store = store.clone();
		let hook = hook.clone();
		let block = ready.register_task("egress");
		tasks.spawn(async move {
			let _block = block;
			let interceptor = EgressInterceptor::new(session, store, parsers, hook);
			let listen_addr = std::net::SocketAddr::from(([0, 0, 0, 0], 0));
			if let Err(e) = interceptor.serve(listen_addr, listen_addr, Kind::Generic).await {
				error!(error = %e, "egress listener exited with error");
			}
		});
	}

	{
		let registry = Arc::new(Registry::default());
		let control_plane = control_plane::ControlPlane::new(store.clone(), session.clone(), ready.clone(), shutdown.trigger(), drain_trigger.clone(), registry);
		let control_plane_port = args.control_plane_port;
		let block = ready.register_task("control-plane");
		tasks.spawn(async move {
			let _block = block;
			let listener = match tokio::net::TcpListener::bind(("0.0.0.0", control_plane_port)).await {
				Ok(l) => l,
				Err(e) => {
					error!(error = %e, port = control_plane_port, "failed to bind control-plane listener");
					return;
				},
			};
			info!(port = control_plane_port, "control plane listening");
			if let Err(e) = axum::serve(listener, control_plane.router()).await {
				error!(error = %e, "control-plane server exited with error");
			}
		});
	}

	shutdown.wait().await;
	info!("shutdown requested, draining in-flight connections");
	drain_trigger.start_drain_and_wait(std::time::Duration::from_secs(10)).await;
	watchdog.cleanup_once().await;
	tasks.abort_all();
	while tasks.join_next().await.is_some() {}
	Ok(())
}
