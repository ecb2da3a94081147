//! Admin/health surface: `/healthz`, `/readyz`, `/metrics`, `/config`. A
//! small `axum` router bound to `--admin-addr`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use policy_engine::route::RouteRegistry;
use prometheus_client::registry::Registry;

#[derive(Clone)]
struct AdminState {
	routes: Arc<RouteRegistry>,
	registry: Arc<Registry>,
	ready: Arc<AtomicBool>,
}

pub async fn serve(addr: std::net::SocketAddr, routes: Arc<RouteRegistry>, registry: Arc<Registry>, ready: Arc<AtomicBool>) -> anyhow::Result<()> {
	let state = AdminState { routes, registry, ready };
	let app = axum::Router::new()
		.route("/healthz", get(healthz))
		.route("/readyz", get(readyz))
		.route("/metrics", get(metrics))
		.route("/config", get(dump_config))
		.with_state(state);

	let listener = tokio::net::TcpListener::bind(addr).await?;
	tracing::info!(%addr, "admin server listening");
	axum::serve(listener, app).await?;
	Ok(())
}

async fn healthz() -> &'static str {
	"ok"
}

async fn readyz(State(state): State<AdminState>) -> impl IntoResponse {
	if state.ready.load(Ordering::SeqCst) {
		(StatusCode::OK, "ready")
	} else {
		(StatusCode::SERVICE_UNAVAILABLE, "not ready")
	}
}

async fn metrics(State(state): State<AdminState>) -> impl IntoResponse {
	match policy_engine::telemetry::metrics::encode(&state.registry) {
		Ok(text) => (StatusCode::OK, text),
		Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
	}
}

async fn dump_config(State(state): State<AdminState>) -> Json<Vec<String>> {
	Json(state.routes.dump().into_iter().map(|k| k.to_string()).collect())
}
