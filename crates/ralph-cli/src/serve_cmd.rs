//! `ralph serve`: a small read-only HTTP surface over task status, for a
//! dashboard or uptime check to poll. Mutating the queue still goes
//! through `ralph task`/`ralph retry` — this binds no write path.

use std::collections::HashMap;
use std::net::SocketAddr;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use sqlx::PgPool;
use tower_http::cors::CorsLayer;

use ralph_core::state::queries;
use ralph_db::models::TaskStatus;

struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": format!("{:#}", self.0) });
        (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self(err)
    }
}

#[derive(Serialize)]
struct StatusResponse {
    repo: String,
    counts: HashMap<TaskStatus, usize>,
}

async fn get_status(State(pool): State<PgPool>, Path(repo): Path<String>) -> Result<Json<StatusResponse>, AppError> {
    let counts = queries::status_counts_for_repo(&pool, &repo).await?;
    Ok(Json(StatusResponse { repo, counts }))
}

async fn healthz() -> &'static str {
    "ok"
}

pub async fn run_serve(pool: PgPool, addr: SocketAddr) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/repos/{repo}/status", get(get_status))
        .layer(CorsLayer::permissive())
        .with_state(pool);

    tracing::info!(%addr, "ralph serve listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tower::ServiceExt;

    #[tokio::test]
    async fn healthz_responds_ok() {
        let app = Router::new().route("/healthz", get(healthz));
        let response = app
            .oneshot(axum::http::Request::builder().uri("/healthz").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
