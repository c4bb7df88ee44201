//! The control-plane HTTP surface (§4.8/§6): thin `axum` handlers that deserialize a
//! request body, call into C2/C6/C7, and serialize a response — no business logic lives
//! here, matching the teacher's `src/admin.rs`/`src/metrics.rs` split between routing and
//! state (`Router` + `with_state` + plain handler functions).

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use rrproxy_core::drain::DrainTrigger;
use rrproxy_core::readiness::Ready;
use rrproxy_core::signal::ShutdownTrigger;
use rrproxy_core::version::{self, BuildInfo};
use rrproxy_store::session::{Mode, OutgoingOptions};
use rrproxy_store::{Mock, MockStore, Session};
use serde::{Deserialize, Serialize};
use tracing::info;

const GRACEFUL_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct ControlPlane {
	store: Arc<MockStore>,
	session: Arc<Session>,
	ready: Ready,
	shutdown: ShutdownTrigger,
	drain: Arc<DrainTrigger>,
	metrics: Arc<Registry>,
}

impl ControlPlane {
	pub fn new(store: Arc<MockStore>, session: Arc<Session>, ready: Ready, shutdown: ShutdownTrigger, drain: Arc<DrainTrigger>, metrics: Arc<Registry>) -> Self {
		ControlPlane {
			store,
			session,
			ready,
			shutdown,
			drain,
			metrics,
		}
	}

	pub fn router(self) -> Router {
		Router::new()
			.route("/agent/incoming", post(incoming_handler))
			.route("/agent/outgoing", post(outgoing_handler))
			.route("/agent/storemocks", post(storemocks_handler))
			.route("/agent/mock", post(mock_handler))
			.route("/agent/updatemockparams", post(updatemockparams_handler))
			.route("/agent/consumedmocks", get(consumedmocks_handler))
			.route("/agent/stop", post(stop_handler))
			.route("/agent/graceful-shutdown", post(graceful_shutdown_handler))
			.route("/agent/agent/ready", post(agent_ready_handler))
			.route("/healthz", get(healthz_handler))
			.route("/readyz", get(readyz_handler))
			.route("/metrics", get(metrics_handler))
			.route("/version", get(version_handler))
			.with_state(self)
	}
}

#[derive(Deserialize, Default)]
pub struct IncomingOptions {
	#[serde(default)]
	pub app_port: Option<u16>,
}

async fn incoming_handler(State(app): State<ControlPlane>, Json(_options): Json<IncomingOptions>) -> StatusCode {
	*app.session.mode.write() = Mode::Record;
	info!("ingress test-case capture enabled");
	StatusCode::ACCEPTED
}

#[derive(Deserialize, Default)]
pub struct WireOutgoingOptions {
	#[serde(default)]
	pub ignore_ordering: bool,
	#[serde(default)]
	pub noise_paths: Vec<String>,
}

async fn outgoing_handler(State(app): State<ControlPlane>, Json(options): Json<WireOutgoingOptions>) -> StatusCode {
	*app.session.outgoing_options.write() = OutgoingOptions {
		ignore_ordering: options.ignore_ordering,
		noise_paths: options.noise_paths,
	};
	StatusCode::ACCEPTED
}

#[derive(Deserialize)]
pub struct StoreMocksRequest {
	#[serde(default)]
	pub filtered: Vec<Mock>,
	#[serde(default)]
	pub unfiltered: Vec<Mock>,
}

async fn storemocks_handler(State(app): State<ControlPlane>, Json(body): Json<StoreMocksRequest>) -> StatusCode {
	let filtered_count = body.filtered.len();
	let unfiltered_count = body.unfiltered.len();
	app.store.set_filtered(body.filtered);
	app.store.set_unfiltered(body.unfiltered);
	info!(filtered_count, unfiltered_count, "mocks loaded");
	StatusCode::OK
}

async fn mock_handler(State(app): State<ControlPlane>) -> StatusCode {
	*app.session.mode.write() = Mode::Replay;
	app.session.mocking_enabled.store(true, std::sync::atomic::Ordering::SeqCst);
	info!("egress replay mode enabled");
	StatusCode::OK
}

async fn updatemockparams_handler(State(app): State<ControlPlane>, Json(options): Json<WireOutgoingOptions>) -> StatusCode {
	*app.session.outgoing_options.write() = OutgoingOptions {
		ignore_ordering: options.ignore_ordering,
		noise_paths: options.noise_paths,
	};
	StatusCode::OK
}

#[derive(Serialize)]
struct ConsumedEntryWire {
	name: String,
	usage: &'static str,
	is_filtered: bool,
	sort_order: i64,
}

async fn consumedmocks_handler(State(app): State<ControlPlane>) -> Json<Vec<ConsumedEntryWire>> {
	let drained = app
		.store
		.get_consumed()
		.into_iter()
		.map(|(name, usage, is_filtered, sort_order)| ConsumedEntryWire {
			name,
			usage: match usage {
				rrproxy_store::mock_store::ConsumedUsage::Updated => "updated",
				rrproxy_store::mock_store::ConsumedUsage::Deleted => "deleted",
			},
			is_filtered,
			sort_order,
		})
		.collect();
	Json(drained)
}

async fn stop_handler(State(app): State<ControlPlane>) -> StatusCode {
	app.shutdown.shutdown_now().await;
	StatusCode::OK
}

async fn graceful_shutdown_handler(State(app): State<ControlPlane>) -> StatusCode {
	app.drain.start_drain_and_wait(GRACEFUL_SHUTDOWN_DEADLINE).await;
	app.shutdown.shutdown_now().await;
	StatusCode::OK
}

async fn agent_ready_handler(State(app): State<ControlPlane>) -> StatusCode {
	if app.ready.is_ready() {
		StatusCode::OK
	} else {
		StatusCode::SERVICE_UNAVAILABLE
	}
}

async fn healthz_handler() -> StatusCode {
	StatusCode::OK
}

async fn readyz_handler(State(app): State<ControlPlane>) -> StatusCode {
	if app.ready.is_ready() {
		StatusCode::OK
	} else {
		StatusCode::SERVICE_UNAVAILABLE
	}
}

async fn metrics_handler(State(app): State<ControlPlane>) -> Result<String, StatusCode> {
	let mut buffer = String::new();
	encode(&mut buffer, &app.metrics).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
	Ok(buffer)
}

async fn version_handler() -> Json<BuildInfo> {
	Json(version::build_info())
}

#[cfg(test)]
mod tests {
	use super::*;
	use rrproxy_core::drain;
	use rrproxy_core::signal::Shutdown;
	use rrproxy_store::mock::{Kind, MockSpec, Payload};

	fn make_app() -> ControlPlane {
		let store = Arc::new(MockStore::new());
		let session = Session::new(Mode::Record);
		let ready = Ready::new();
		let shutdown = Shutdown::new();
		let trigger = shutdown.trigger();
		let (drain_trigger, _watcher) = drain::new();
		ControlPlane::new(store, session, ready, trigger, Arc::new(drain_trigger), Arc::new(Registry::default()))
	}

	#[tokio::test]
	async fn mock_handler_enables_replay_and_mocking() {
		let app = make_app();
		let status = mock_handler(State(app.clone())).await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(app.session.mode(), Mode::Replay);
		assert!(app.session.mocking_enabled());
	}

	#[tokio::test]
	async fn storemocks_then_consumedmocks_round_trips() {
		let app = make_app();
		let mock = Mock {
			kind: Kind::Http,
			name: "m1".to_string(),
			spec: MockSpec {
				request: vec![Payload::Text("GET /x".to_string())],
				response: vec![Payload::Text("200 OK".to_string())],
				request_time_ns: 0,
				response_time_ns: 0,
				metadata_type: None,
			},
			sort_order: 0,
			id: 0,
			is_filtered: true,
		};
		let status = storemocks_handler(
			State(app.clone()),
			Json(StoreMocksRequest {
				filtered: vec![mock],
				unfiltered: vec![],
			}),
		)
		.await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(app.store.get_filtered_by_kind(Kind::Http).len(), 1);

		app.store.flag_consumed("m1", rrproxy_store::mock_store::ConsumedUsage::Updated, true, 1);
		let Json(drained) = consumedmocks_handler(State(app)).await;
		assert_eq!(drained.len(), 1);
		assert_eq!(drained[0].name, "m1");
	}

	#[tokio::test]
	async fn version_handler_reports_cargo_package_version() {
		let Json(info) = version_handler().await;
		assert_eq!(info.version, env!("CARGO_PKG_VERSION"));
	}

	#[tokio::test]
	async fn agent_ready_reflects_pending_tasks() {
		let app = make_app();
		let block = app.ready.register_task("listener");
		assert_eq!(agent_ready_handler(State(app.clone())).await, StatusCode::SERVICE_UNAVAILABLE);
		drop(block);
		assert_eq!(agent_ready_handler(State(app)).await, StatusCode::OK);
	}
}
