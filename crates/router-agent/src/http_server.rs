//! HTTP command surface and Prometheus endpoint.

use crate::agent::Agent;
use crate::metrics::MetricsRegistry;
use crate::types::{
    CommandReply, ConfigureNicCmd, DefaultActionCmd, EnableHaCmd, InitConfig, RemoveNicCmd,
};
use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Shared state of every handler
#[derive(Clone)]
pub struct AppState {
    pub agent: Arc<Agent>,
    pub metrics: Option<Arc<MetricsRegistry>>,
}

/// Build the router. `/metrics` is only served when metrics are enabled.
pub fn router(state: AppState) -> Router {
    let mut app = Router::new()
        .route("/configurenic", post(configure_nic))
        .route("/removenic", post(remove_nic))
        .route("/configurenicdefaultaction", post(configure_default_action))
        .route("/enableVyosha", post(enable_ha))
        .route("/init", post(init))
        .route("/ping", post(ping))
        .route("/echo", post(echo));

    if state.metrics.is_some() {
        app = app.route("/metrics", get(metrics_handler));
    }

    app.layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

/// HTTP server for the command surface
pub struct CommandServer {
    state: AppState,
    listen_addr: SocketAddr,
}

impl CommandServer {
    pub fn new(state: AppState, listen_addr: SocketAddr) -> Self {
        Self { state, listen_addr }
    }

    /// Serve until `stop` fires, letting in-flight commands finish
    pub async fn run(self, stop: CancellationToken) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.listen_addr).await?;
        info!(listen_addr = %self.listen_addr, "Command server listening");

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(async move { stop.cancelled().await })
            .await?;

        info!("Command server stopped");
        Ok(())
    }
}

/// Decode, run, time and record one command
async fn run_command<T, F, Fut>(
    state: &AppState,
    command: &'static str,
    payload: Result<Json<T>, JsonRejection>,
    op: F,
) -> (StatusCode, Json<CommandReply>)
where
    F: FnOnce(T) -> Fut,
    Fut: Future<Output = common::Result<CommandReply>>,
{
    let start = Instant::now();
    let (status, reply) = match payload {
        Err(rejection) => {
            warn!(command, error = %rejection.body_text(), "Rejected malformed command");
            (
                rejection.status(),
                CommandReply::failure(rejection.body_text()),
            )
        }
        Ok(Json(cmd)) => match op(cmd).await {
            Ok(reply) => (StatusCode::OK, reply),
            Err(e) => {
                warn!(command, error = %e, "Command failed");
                (StatusCode::OK, CommandReply::failure(e))
            }
        },
    };

    if let Some(metrics) = &state.metrics {
        metrics.record_command(command, reply.success, start.elapsed());
    }
    (status, Json(reply))
}

async fn configure_nic(
    State(state): State<AppState>,
    payload: Result<Json<ConfigureNicCmd>, JsonRejection>,
) -> (StatusCode, Json<CommandReply>) {
    let agent = state.agent.clone();
    run_command(&state, "configurenic", payload, |cmd| async move {
        agent.configure_nic(&cmd).await.map(|()| CommandReply::ok())
    })
    .await
}

async fn remove_nic(
    State(state): State<AppState>,
    payload: Result<Json<RemoveNicCmd>, JsonRejection>,
) -> (StatusCode, Json<CommandReply>) {
    let agent = state.agent.clone();
    run_command(&state, "removenic", payload, |cmd| async move {
        agent.remove_nic(&cmd).await.map(|()| CommandReply::ok())
    })
    .await
}

async fn configure_default_action(
    State(state): State<AppState>,
    payload: Result<Json<DefaultActionCmd>, JsonRejection>,
) -> (StatusCode, Json<CommandReply>) {
    let agent = state.agent.clone();
    run_command(&state, "configurenicdefaultaction", payload, |cmd| async move {
        agent
            .configure_default_action(&cmd)
            .await
            .map(|()| CommandReply::ok())
    })
    .await
}

async fn enable_ha(
    State(state): State<AppState>,
    payload: Result<Json<EnableHaCmd>, JsonRejection>,
) -> (StatusCode, Json<CommandReply>) {
    let agent = state.agent.clone();
    run_command(&state, "enableVyosha", payload, |cmd| async move {
        agent.enable_ha(&cmd).await.map(|()| CommandReply::ok())
    })
    .await
}

async fn init(
    State(state): State<AppState>,
    payload: Result<Json<InitConfig>, JsonRejection>,
) -> (StatusCode, Json<CommandReply>) {
    let agent = state.agent.clone();
    run_command(&state, "init", payload, |cmd| async move {
        agent.init(cmd).await.map(|()| CommandReply::ok())
    })
    .await
}

// ping and echo carry no meaningful body
async fn ping(State(state): State<AppState>) -> (StatusCode, Json<CommandReply>) {
    let agent = state.agent.clone();
    run_command(&state, "ping", Ok(Json(())), |()| async move {
        let response = agent.ping().await;
        let body = serde_json::to_value(&response)?;
        Ok::<_, common::Error>(CommandReply::with_body(body))
    })
    .await
}

async fn echo(State(state): State<AppState>) -> (StatusCode, Json<CommandReply>) {
    let agent = state.agent.clone();
    run_command(&state, "echo", Ok(Json(())), |()| async move {
        agent.echo();
        Ok(CommandReply::ok())
    })
    .await
}

/// Handler for /metrics; HA and health gauges are refreshed at scrape time
async fn metrics_handler(State(state): State<AppState>) -> Response {
    let Some(metrics) = state.metrics else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let ha = state.agent.ha();
    metrics.observe_ha(ha.status().await, &ha.stats().await, ha.vips().await.len());
    metrics.observe_health(&state.agent.health().status().await);

    match metrics.encode() {
        Ok(buffer) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            buffer,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
                .into_response()
        }
    }
}
