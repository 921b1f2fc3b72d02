//! REST client for the task coordinator.

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;
use url::Url;

use crate::api::{AssignedTask, TaskType};
use crate::error::ApiError;

/// Coordinator seam used by the dispatcher and the worker loop; implemented
/// by [`CoordinatorClient`] and by mocks in tests.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Asks the coordinator to assign at most one unassigned task whose type
    /// is in `task_types`. `Ok(None)` means no eligible work exists right
    /// now; it is never used to paper over a failed request.
    async fn claim(&self, task_types: &[TaskType]) -> Result<Option<AssignedTask>, ApiError>;

    /// Renews the lease on a claimed task. `progress` is in [0, 1].
    async fn keepalive(&self, task_id: &str, progress: Option<f64>) -> Result<(), ApiError>;

    /// Reports terminal success with an opaque result payload.
    async fn mark_completed(
        &self,
        task_id: &str,
        completion_data: serde_json::Value,
    ) -> Result<(), ApiError>;
}

pub struct CoordinatorClient {
    http: reqwest::Client,
    base: Url,
    token: String,
}

#[derive(Serialize)]
struct KeepaliveBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    progress: Option<f64>,
}

#[derive(Serialize)]
struct CompletionBody {
    completion_data: serde_json::Value,
}

impl CoordinatorClient {
    /// `base` is the task API root, e.g. `http://host/api/v1/tasks/`.
    pub fn new(mut base: Url, token: impl Into<String>) -> Self {
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        Self {
            http: reqwest::Client::new(),
            base,
            token: token.into(),
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        self.base
            .join(path)
            .map_err(|e| ApiError::InvalidResponse(format!("bad endpoint '{path}': {e}")))
    }

    fn auth_header(&self) -> String {
        format!("Worker {}", self.token)
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::Status { status, body })
    }
}

#[async_trait]
impl Coordinator for CoordinatorClient {
    async fn claim(&self, task_types: &[TaskType]) -> Result<Option<AssignedTask>, ApiError> {
        debug!(?task_types, "asking coordinator for a task");
        let query: Vec<(&str, &str)> = task_types
            .iter()
            .map(|ty| ("task_type", ty.as_str()))
            .collect();
        let response = self
            .http
            .post(self.endpoint("claim_unassigned_task/")?)
            .query(&query)
            .header("authorization", self.auth_header())
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        let response = Self::check_status(response).await?;

        let body = response.text().await.map_err(|e| ApiError::Transport(e.to_string()))?;
        let value: serde_json::Value = serde_json::from_str(&body)
            .map_err(|e| ApiError::InvalidResponse(format!("claim body: {e}")))?;
        if value.is_null() {
            return Ok(None);
        }
        let task: AssignedTask =
            serde_json::from_value(value).map_err(|e| ApiError::InvalidTask(e.to_string()))?;
        Ok(Some(task))
    }

    async fn keepalive(&self, task_id: &str, progress: Option<f64>) -> Result<(), ApiError> {
        debug!(task_id, ?progress, "sending keepalive");
        let response = self
            .http
            .post(self.endpoint(&format!("{task_id}/keepalive/"))?)
            .json(&KeepaliveBody { progress })
            .header("authorization", self.auth_header())
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        Self::check_status(response).await?;
        Ok(())
    }

    async fn mark_completed(
        &self,
        task_id: &str,
        completion_data: serde_json::Value,
    ) -> Result<(), ApiError> {
        debug!(task_id, "marking task completed");
        let response = self
            .http
            .post(self.endpoint(&format!("{task_id}/mark_completed/"))?)
            .json(&CompletionBody { completion_data })
            .header("authorization", self.auth_header())
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        Self::check_status(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    #[derive(Clone, Default)]
    struct Recorded {
        keepalives: Arc<Mutex<Vec<serde_json::Value>>>,
        completions: Arc<Mutex<Vec<serde_json::Value>>>,
    }

    async fn serve(app: Router) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn client_for(addr: SocketAddr) -> CoordinatorClient {
        let base = Url::parse(&format!("http://{addr}/api/v1/tasks")).unwrap();
        CoordinatorClient::new(base, "secret")
    }

    fn transcribe_task_json() -> serde_json::Value {
        serde_json::json!({
            "id": "task-1",
            "task_type": "TRANSCRIBE",
            "task_parameters": {"model": "base", "lang": "en"},
            "document": {"id": "doc-1", "media_files": []}
        })
    }

    #[tokio::test]
    async fn claim_returns_assigned_task() {
        let app = Router::new().route(
            "/api/v1/tasks/claim_unassigned_task/",
            post(|| async { Json(transcribe_task_json()) }),
        );
        let client = client_for(serve(app).await);

        let task = client
            .claim(&[TaskType::Transcribe])
            .await
            .unwrap()
            .expect("task expected");
        assert_eq!(task.id, "task-1");
        assert_eq!(task.task_type(), TaskType::Transcribe);
    }

    #[tokio::test]
    async fn claim_null_means_no_work() {
        let app = Router::new().route(
            "/api/v1/tasks/claim_unassigned_task/",
            post(|| async { Json(serde_json::Value::Null) }),
        );
        let client = client_for(serve(app).await);

        let task = client.claim(&[TaskType::Align]).await.unwrap();
        assert!(task.is_none());
    }

    #[tokio::test]
    async fn claim_error_status_is_not_no_work() {
        let app = Router::new().route(
            "/api/v1/tasks/claim_unassigned_task/",
            post(|| async {
                (
                    axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                    "database on fire",
                )
            }),
        );
        let client = client_for(serve(app).await);

        let err = client.claim(&[TaskType::Transcribe]).await.unwrap_err();
        match err {
            ApiError::Status { status, body } => {
                assert_eq!(status.as_u16(), 500);
                assert_eq!(body, "database on fire");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn claim_refused_connection_is_transport_error() {
        // bind then drop so nothing is listening on the port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = client_for(addr);
        let err = client.claim(&[TaskType::Transcribe]).await.unwrap_err();
        assert!(err.is_transport(), "expected transport error, got {err:?}");
    }

    #[tokio::test]
    async fn claim_rejects_unknown_task_type() {
        let app = Router::new().route(
            "/api/v1/tasks/claim_unassigned_task/",
            post(|| async {
                Json(serde_json::json!({
                    "id": "task-9",
                    "task_type": "FROBNICATE",
                    "task_parameters": {},
                    "document": {"id": "doc-1"}
                }))
            }),
        );
        let client = client_for(serve(app).await);

        let err = client.claim(&[TaskType::Transcribe]).await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidTask(_)));
    }

    #[tokio::test]
    async fn keepalive_and_completion_post_expected_bodies() {
        let recorded = Recorded::default();
        let app = Router::new()
            .route(
                "/api/v1/tasks/:task_id/keepalive/",
                post(
                    |State(rec): State<Recorded>, Json(body): Json<serde_json::Value>| async move {
                        rec.keepalives.lock().unwrap().push(body);
                        Json(serde_json::json!({}))
                    },
                ),
            )
            .route(
                "/api/v1/tasks/:task_id/mark_completed/",
                post(
                    |State(rec): State<Recorded>, Json(body): Json<serde_json::Value>| async move {
                        rec.completions.lock().unwrap().push(body);
                        Json(serde_json::json!({}))
                    },
                ),
            )
            .with_state(recorded.clone());
        let client = client_for(serve(app).await);

        client.keepalive("task-1", Some(0.25)).await.unwrap();
        client.keepalive("task-1", None).await.unwrap();
        client
            .mark_completed("task-1", serde_json::json!({"result": null}))
            .await
            .unwrap();

        let keepalives = recorded.keepalives.lock().unwrap();
        assert_eq!(keepalives[0], serde_json::json!({"progress": 0.25}));
        assert_eq!(keepalives[1], serde_json::json!({}));
        let completions = recorded.completions.lock().unwrap();
        assert_eq!(
            completions[0],
            serde_json::json!({"completion_data": {"result": null}})
        );
    }
}
