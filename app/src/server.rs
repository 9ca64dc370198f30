//! HTTP front end of the session host.
//!
//! Every route is a thin translation onto [`SessionHost::dispatch`].

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chatflow_conversation::{HostError, HostRequest, HostResponse, SessionHost, SessionQuery};
use chatflow_core::PromptSignal;
use serde::{Deserialize, Serialize};
use std::future::Future;
use tracing::{error, info};

/// Body of `POST /sessions/{id}/prompts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptRequest {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

pub struct ApiError(HostError);

impl From<HostError> for ApiError {
    fn from(e: HostError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            HostError::SessionNotFound(_) | HostError::RunNotFound(_) => StatusCode::NOT_FOUND,
            HostError::Unavailable(_) | HostError::ShutDown => StatusCode::SERVICE_UNAVAILABLE,
            HostError::Journal(e) => {
                error!("Journal failure while handling request: {e}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = ErrorBody {
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub struct HostApi;

impl HostApi {
    pub fn router(host: SessionHost) -> Router {
        Router::new()
            .route("/sessions/{session_id}/prompts", post(send_prompt))
            .route("/sessions/{session_id}/history", get(get_history))
            .route("/sessions/{session_id}/summary", get(get_summary))
            .route("/sessions/{session_id}/status", get(get_status))
            .route("/sessions/{session_id}/runs/{run}/history", get(get_run_history))
            .route("/sessions/{session_id}/runs/{run}/summary", get(get_run_summary))
            .route("/sessions/{session_id}/runs/{run}/status", get(get_run_status))
            .route("/health", get(health_check))
            .with_state(host)
    }

    /// Serve until `shutdown` resolves.
    pub async fn serve(
        host: SessionHost,
        listener: tokio::net::TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        info!("Session host listening on {}", listener.local_addr()?);
        axum::serve(listener, Self::router(host))
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}

async fn health_check() -> &'static str {
    "ok"
}

async fn send_prompt(
    State(host): State<SessionHost>,
    Path(session_id): Path<String>,
    Json(body): Json<PromptRequest>,
) -> Result<(StatusCode, Json<HostResponse>), ApiError> {
    let prompt = PromptSignal {
        text: body.text,
        request_id: body.request_id,
    };
    let response = host
        .dispatch(HostRequest::SignalWithStart { session_id, prompt })
        .await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

async fn query(
    host: &SessionHost,
    session_id: String,
    run: Option<u32>,
    query: SessionQuery,
) -> Result<Json<HostResponse>, ApiError> {
    let response = host
        .dispatch(HostRequest::Query {
            session_id,
            run,
            query,
        })
        .await?;
    Ok(Json(response))
}

async fn get_history(
    State(host): State<SessionHost>,
    Path(session_id): Path<String>,
) -> Result<Json<HostResponse>, ApiError> {
    query(&host, session_id, None, SessionQuery::History).await
}

async fn get_summary(
    State(host): State<SessionHost>,
    Path(session_id): Path<String>,
) -> Result<Json<HostResponse>, ApiError> {
    query(&host, session_id, None, SessionQuery::Summary).await
}

async fn get_status(
    State(host): State<SessionHost>,
    Path(session_id): Path<String>,
) -> Result<Json<HostResponse>, ApiError> {
    query(&host, session_id, None, SessionQuery::Status).await
}

async fn get_run_history(
    State(host): State<SessionHost>,
    Path((session_id, run)): Path<(String, u32)>,
) -> Result<Json<HostResponse>, ApiError> {
    query(&host, session_id, Some(run), SessionQuery::History).await
}

async fn get_run_summary(
    State(host): State<SessionHost>,
    Path((session_id, run)): Path<(String, u32)>,
) -> Result<Json<HostResponse>, ApiError> {
    query(&host, session_id, Some(run), SessionQuery::Summary).await
}

async fn get_run_status(
    State(host): State<SessionHost>,
    Path((session_id, run)): Path<(String, u32)>,
) -> Result<Json<HostResponse>, ApiError> {
    query(&host, session_id, Some(run), SessionQuery::Status).await
}
