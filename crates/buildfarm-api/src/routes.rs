//! Route handlers.

use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

use buildfarm_config::FarmConfig;
use buildfarm_core::BuildId;
use buildfarm_core::build::BuildRun;
use buildfarm_dispatch::BuilderStatus;

use crate::AppState;
use crate::error::ApiError;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/builders/{name}", get(builder_status))
        .route("/api/builders/{name}/force", post(force_build))
        .route("/api/runs/{id}", get(run_status))
        .route("/api/runs/{id}/stop", post(stop_run))
        .route("/api/reload", post(reload))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Default, Deserialize)]
struct ForceBuildRequest {
    branch: Option<String>,
    reason: Option<String>,
    #[serde(default)]
    properties: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
struct ForceBuildResponse {
    id: String,
}

async fn force_build(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Option<Json<ForceBuildRequest>>,
) -> Result<Json<ForceBuildResponse>, ApiError> {
    let Json(req) = body.unwrap_or_default();
    let id = state
        .dispatcher
        .force_build(&name, req.branch, req.properties, req.reason)
        .await?;
    Ok(Json(ForceBuildResponse { id: id.to_string() }))
}

async fn builder_status(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<BuilderStatus>, ApiError> {
    Ok(Json(state.dispatcher.builder_status(&name).await?))
}

async fn run_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<BuildRun>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.dispatcher.run_status(id).await?))
}

async fn stop_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = parse_id(&id)?;
    state.dispatcher.abort(id).await?;
    Ok(Json(serde_json::json!({ "stopped": id.to_string() })))
}

async fn reload(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let config = FarmConfig::load(&state.config_path)?;
    info!(path = %state.config_path.display(), "reloading configuration");
    state.dispatcher.reload(config).await?;
    Ok(Json(serde_json::json!({ "reloaded": true })))
}

fn parse_id(raw: &str) -> Result<BuildId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid build id '{raw}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::util::ServiceExt;
    use url::Url;

    use buildfarm_core::runner::{CommandOutcome, CommandRunner, CommandSpec};
    use buildfarm_dispatch::Dispatcher;

    struct NullRunner;

    #[async_trait::async_trait]
    impl CommandRunner for NullRunner {
        fn name(&self) -> &'static str {
            "null"
        }
        fn base_dir(&self, worker: &str) -> std::path::PathBuf {
            std::path::PathBuf::from("/tmp").join(worker)
        }
        async fn run(
            &self,
            _worker: &str,
            _spec: CommandSpec,
        ) -> buildfarm_core::Result<CommandOutcome> {
            Ok(CommandOutcome {
                exit_code: Some(0),
                output: String::new(),
            })
        }
    }

    fn app() -> Router {
        let config = Arc::new(FarmConfig {
            project: "clementine".to_string(),
            state_dir: "/tmp/farm".into(),
            upload_base: "/tmp/farm/uploads".into(),
            upload_url: Url::parse("http://builds.example.org").unwrap(),
            listen: "127.0.0.1:0".parse().unwrap(),
            workers: Vec::new(),
            locks: Vec::new(),
            sources: Vec::new(),
            builders: Vec::new(),
            schedulers: Vec::new(),
        });
        let (handle, _task) = Dispatcher::spawn(config, Arc::new(NullRunner));
        router(AppState::new(handle, "/tmp/farm.kdl"))
    }

    #[tokio::test]
    async fn health_answers_ok() {
        let response = app()
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_builder_is_404() {
        let response = app()
            .oneshot(
                Request::get("/api/builders/No%20Such%20Builder")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_run_id_is_400() {
        let response = app()
            .oneshot(
                Request::get("/api/runs/not-a-uuid")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
