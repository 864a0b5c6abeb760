//! Read-only HTTP status surface.
//!
//! Handlers never touch the goal table; they ask the orchestration loop for
//! a snapshot through the query channel.

use std::net::SocketAddr;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::model::ScienceGoal;

/// A read request answered by the orchestration loop.
#[derive(Debug)]
pub enum StatusQuery {
    Goals(oneshot::Sender<Vec<ScienceGoal>>),
    Goal(String, oneshot::Sender<Option<ScienceGoal>>),
}

#[derive(Clone)]
pub struct ApiState {
    pub node_id: String,
    pub queries: mpsc::Sender<StatusQuery>,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct InfoResponse {
    pub id: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Unavailable,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            ApiError::NotFound(name) => (StatusCode::NOT_FOUND, format!("goal {name} not found")),
            ApiError::Unavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "scheduler is not running".to_string(),
            ),
        };
        (status, Json(ErrorBody { error })).into_response()
    }
}

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/healthz", get(healthz))
        .route("/api/v1/goals", get(list_goals))
        .route("/api/v1/goals/{name}", get(get_goal))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn root(State(state): State<ApiState>) -> Json<InfoResponse> {
    Json(InfoResponse {
        id: state.node_id,
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "node-scheduler".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
    })
}

async fn list_goals(State(state): State<ApiState>) -> Result<Json<Vec<ScienceGoal>>, ApiError> {
    let (tx, rx) = oneshot::channel();
    state
        .queries
        .send(StatusQuery::Goals(tx))
        .await
        .map_err(|_| ApiError::Unavailable)?;
    rx.await.map(Json).map_err(|_| ApiError::Unavailable)
}

async fn get_goal(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Json<ScienceGoal>, ApiError> {
    let (tx, rx) = oneshot::channel();
    state
        .queries
        .send(StatusQuery::Goal(name.clone(), tx))
        .await
        .map_err(|_| ApiError::Unavailable)?;
    rx.await
        .map_err(|_| ApiError::Unavailable)?
        .map(Json)
        .ok_or(ApiError::NotFound(name))
}

/// Serves the status surface until shutdown.
pub async fn serve(
    addr: SocketAddr,
    state: ApiState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Status API listening");
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use ses_id::GoalId;
    use tower::ServiceExt;

    use crate::model::{Node, SubGoal};

    fn test_goal(name: &str) -> ScienceGoal {
        ScienceGoal {
            id: GoalId::new(),
            name: name.into(),
            sub_goals: vec![SubGoal::new(Node::new("n1"))],
        }
    }

    /// Answers queries from a fixed goal list, like the loop would.
    fn test_state(goals: Vec<ScienceGoal>) -> ApiState {
        let (tx, mut rx) = mpsc::channel::<StatusQuery>(4);
        tokio::spawn(async move {
            while let Some(query) = rx.recv().await {
                match query {
                    StatusQuery::Goals(reply) => {
                        let _ = reply.send(goals.clone());
                    }
                    StatusQuery::Goal(name, reply) => {
                        let _ = reply.send(goals.iter().find(|g| g.name == name).cloned());
                    }
                }
            }
        });
        ApiState {
            node_id: "n1".into(),
            queries: tx,
        }
    }

    async fn get(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_root() {
        let (status, body) = get(create_router(test_state(vec![])), "/").await;
        assert_eq!(status, StatusCode::OK);
        let info: InfoResponse = serde_json::from_value(body).unwrap();
        assert_eq!(info.id, "n1");
        assert_eq!(info.version, env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_healthz() {
        let (status, body) = get(create_router(test_state(vec![])), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        let health: HealthResponse = serde_json::from_value(body).unwrap();
        assert_eq!(health.status, "ok");
        assert_eq!(health.service, "node-scheduler");
    }

    #[tokio::test]
    async fn test_list_goals() {
        let state = test_state(vec![test_goal("rain-watch"), test_goal("sky-watch")]);
        let (status, body) = get(create_router(state), "/api/v1/goals").await;
        assert_eq!(status, StatusCode::OK);
        let goals: Vec<ScienceGoal> = serde_json::from_value(body).unwrap();
        assert_eq!(goals.len(), 2);
        assert_eq!(goals[1].name, "sky-watch");
    }

    #[tokio::test]
    async fn test_get_goal() {
        let goal = test_goal("sky-watch");
        let state = test_state(vec![goal.clone()]);

        let (status, body) = get(create_router(state.clone()), "/api/v1/goals/sky-watch").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(serde_json::from_value::<ScienceGoal>(body).unwrap(), goal);

        let (status, body) = get(create_router(state), "/api/v1/goals/rain-watch").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "goal rain-watch not found");
    }

    #[tokio::test]
    async fn test_loop_gone() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let state = ApiState {
            node_id: "n1".into(),
            queries: tx,
        };
        let (status, _) = get(create_router(state), "/api/v1/goals").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
