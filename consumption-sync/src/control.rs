//! Operator HTTP surface: run status, manual triggers, installation removal
//! and credential reload.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use consumption_client::domain::Installation;
use serde::Serialize;
use serde_json::json;

use crate::gap;
use crate::provider::{Credentials, ProviderClient};
use crate::scheduler::Scheduler;
use crate::sinks::StatisticsSink;
use crate::status::InstallationStatus;

/// Reads the provider credentials afresh, e.g. from the config file.
pub type CredentialsLoader = Arc<dyn Fn() -> anyhow::Result<Credentials> + Send + Sync>;

struct ControlState<P: ProviderClient, K: StatisticsSink> {
    scheduler: Arc<Scheduler<P, K>>,
    load_credentials: CredentialsLoader,
}

impl<P: ProviderClient, K: StatisticsSink> Clone for ControlState<P, K> {
    fn clone(&self) -> Self {
        Self {
            scheduler: self.scheduler.clone(),
            load_credentials: self.load_credentials.clone(),
        }
    }
}

#[derive(Serialize)]
struct StatusEntry {
    installation: Installation,
    caught_up: bool,
    status: Option<InstallationStatus>,
}

#[derive(Serialize)]
struct StatusReport {
    /// The portal refused the credentials; imports stay stopped until they
    /// are reloaded.
    login_rejected: bool,
    installations: Vec<StatusEntry>,
}

pub fn router<P, K>(scheduler: Arc<Scheduler<P, K>>, load_credentials: CredentialsLoader) -> Router
where
    P: ProviderClient + 'static,
    K: StatisticsSink + 'static,
{
    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status::<P, K>))
        .route("/sync", post(sync_all::<P, K>))
        .route("/credentials/reload", post(reload_credentials::<P, K>))
        .route("/installations/:id", delete(remove_installation::<P, K>))
        .route("/installations/:id/sync", post(sync_installation::<P, K>))
        .with_state(ControlState {
            scheduler,
            load_credentials,
        })
}

/// Bind `bind_addr` and serve the control routes in the background.
pub async fn serve<P, K>(
    bind_addr: &str,
    scheduler: Arc<Scheduler<P, K>>,
    load_credentials: CredentialsLoader,
) -> anyhow::Result<()>
where
    P: ProviderClient + 'static,
    K: StatisticsSink + 'static,
{
    let addr: SocketAddr = bind_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid control bind addr {bind_addr}: {e}"))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let app = router(scheduler, load_credentials);

    tracing::info!(%addr, "control server listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app.into_make_service()).await {
            tracing::error!(error = %e, "control server error");
        }
    });
    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn status<P, K>(State(state): State<ControlState<P, K>>) -> Json<StatusReport>
where
    P: ProviderClient + 'static,
    K: StatisticsSink + 'static,
{
    let scheduler = &state.scheduler;
    let board = scheduler.status().snapshot();
    let installations = scheduler
        .pipeline()
        .registry()
        .list()
        .await
        .into_iter()
        .map(|installation| StatusEntry {
            caught_up: gap::is_caught_up(&installation),
            status: board.get(&installation.id).cloned(),
            installation,
        })
        .collect();
    Json(StatusReport {
        login_rejected: scheduler.pipeline().sessions().is_rejected().await,
        installations,
    })
}

async fn sync_installation<P, K>(
    State(state): State<ControlState<P, K>>,
    Path(id): Path<String>,
) -> impl IntoResponse
where
    P: ProviderClient + 'static,
    K: StatisticsSink + 'static,
{
    let scheduler = state.scheduler;
    metrics::counter!("control_sync_requests_total").increment(1);

    if scheduler.pipeline().registry().get(&id).await.is_none() {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown installation {id}") })),
        );
    }

    let state = match scheduler.spawn_trigger(&id) {
        Some(_) => "started",
        None => "already_running",
    };
    (
        StatusCode::ACCEPTED,
        Json(json!({ "installation_id": id, "status": state })),
    )
}

async fn sync_all<P, K>(State(state): State<ControlState<P, K>>) -> impl IntoResponse
where
    P: ProviderClient + 'static,
    K: StatisticsSink + 'static,
{
    let scheduler = state.scheduler;
    tokio::spawn(async move {
        let runs = scheduler.run_all().await;
        tracing::info!(runs = runs.len(), "manual pass finished");
    });
    (StatusCode::ACCEPTED, Json(json!({ "status": "started" })))
}

/// Cancel any in-flight run and forget the installation.
async fn remove_installation<P, K>(
    State(state): State<ControlState<P, K>>,
    Path(id): Path<String>,
) -> axum::response::Response
where
    P: ProviderClient + 'static,
    K: StatisticsSink + 'static,
{
    match state.scheduler.remove_installation(&id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown installation {id}") })),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(installation_id = %id, error = %e, "failed to remove installation");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

/// Re-read the credentials and clear a rejected login.
async fn reload_credentials<P, K>(State(state): State<ControlState<P, K>>) -> axum::response::Response
where
    P: ProviderClient + 'static,
    K: StatisticsSink + 'static,
{
    match (state.load_credentials)() {
        Ok(credentials) => {
            state
                .scheduler
                .pipeline()
                .sessions()
                .update_credentials(credentials)
                .await;
            tracing::info!("provider credentials reloaded");
            (StatusCode::OK, Json(json!({ "status": "reloaded" }))).into_response()
        }
        Err(e) => {
            tracing::warn!(error = %e, "credential reload failed");
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({ "error": format!("{e:#}") })),
            )
                .into_response()
        }
    }
}
