//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        Path, Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{StatusCode, header},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};

use crate::broadcast::{LogLine, LogSubscription};
use crate::job::{InvocationSpec, JobStatus, default_prompt};
use crate::package::ExportFormat;
use crate::service::{JobService, ServiceError};
use crate::store::ListOrder;

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::InvalidInput(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) | Self::NotReady(_) => StatusCode::CONFLICT,
            Self::Internal(e) => {
                tracing::error!(error = %e, "Request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Serialize)]
struct HealthCheckResponse {
    status: &'static str,
    version: &'static str,
    jobs: usize,
    worker_slots: usize,
    queue_capacity: usize,
}

async fn health_check(State(service): State<Arc<JobService>>) -> Json<HealthCheckResponse> {
    let stats = service.stats();
    Json(HealthCheckResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        jobs: stats.jobs,
        worker_slots: stats.worker_slots,
        queue_capacity: stats.queue_capacity,
    })
}

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    artifact: String,
    prompt: Option<String>,
    display_name: Option<String>,
}

impl SubmitRequest {
    fn into_spec(self) -> InvocationSpec {
        InvocationSpec {
            artifact: self.artifact.into(),
            prompt: self.prompt.unwrap_or_else(default_prompt),
            display_name: self.display_name,
        }
    }
}

async fn submit_job(
    State(service): State<Arc<JobService>>,
    Json(request): Json<SubmitRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let record = service.submit(request.into_spec())?;
    Ok((StatusCode::CREATED, Json(record)))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
    order: Option<String>,
}

async fn list_jobs(
    State(service): State<Arc<JobService>>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let filter = query
        .status
        .map(|s| s.parse::<JobStatus>())
        .transpose()
        .map_err(ServiceError::InvalidInput)?;
    let order = query
        .order
        .map(|o| o.parse::<ListOrder>())
        .transpose()
        .map_err(ServiceError::InvalidInput)?
        .unwrap_or_default();
    Ok(Json(service.list(filter, order)))
}

async fn job_status(
    State(service): State<Arc<JobService>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    Ok(Json(service.status(&id)?))
}

async fn cancel_job(
    State(service): State<Arc<JobService>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    Ok(Json(service.cancel(&id)?))
}

async fn delete_job(
    State(service): State<Arc<JobService>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    service.delete(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct DownloadQuery {
    format: Option<String>,
}

async fn download_results(
    State(service): State<Arc<JobService>>,
    Path(id): Path<String>,
    Query(query): Query<DownloadQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let format = query
        .format
        .map(|f| f.parse::<ExportFormat>())
        .transpose()
        .map_err(ServiceError::InvalidInput)?
        .unwrap_or_default();

    let package = service.fetch_result_package(&id, format)?;
    let disposition = format!("attachment; filename=\"{}\"", package.file_name);
    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        package.bytes,
    ))
}

/// WebSocket log stream: retained history is replayed first, then live lines
/// until the job's stream closes or the client disconnects. Each frame is one
/// JSON-encoded `LogLine`.
async fn stream_logs(
    State(service): State<Arc<JobService>>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, ServiceError> {
    let (history, subscription) = service.subscribe_logs(&id)?;
    Ok(ws.on_upgrade(move |socket| forward_log_stream(socket, history, subscription)))
}

async fn forward_log_stream(
    mut socket: WebSocket,
    history: Vec<LogLine>,
    mut subscription: LogSubscription,
) {
    for line in history {
        if send_line(&mut socket, &line).await.is_err() {
            return;
        }
    }
    while let Some(line) = subscription.next().await {
        if send_line(&mut socket, &line).await.is_err() {
            return;
        }
    }
    // Stream closed by the producer; tell the client politely.
    let _ = socket.send(Message::Close(None)).await;
}

async fn send_line(socket: &mut WebSocket, line: &LogLine) -> Result<(), axum::Error> {
    // Serializing a seq + string pair cannot fail.
    let payload = serde_json::to_string(line).unwrap_or_default();
    socket.send(Message::Text(payload.into())).await
}

async fn shutdown(State(service): State<Arc<JobService>>) -> impl IntoResponse {
    tracing::info!("Shutdown requested via HTTP");
    service.request_shutdown();
    (StatusCode::OK, Json(serde_json::json!({})))
}

pub fn routes(service: Arc<JobService>) -> Router {
    Router::new()
        .route("/health-check", get(health_check))
        .route("/shutdown", post(shutdown))
        .route("/jobs", post(submit_job))
        .route("/jobs", get(list_jobs))
        .route("/jobs/{id}", get(job_status))
        .route("/jobs/{id}", delete(delete_job))
        .route("/jobs/{id}/cancel", post(cancel_job))
        .route("/jobs/{id}/download", get(download_results))
        .route("/ws/logs/{id}", get(stream_logs))
        .with_state(service)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::LogBroadcaster;
    use crate::runner::{JobLauncher, JobRunner, LaunchError, RunnerConfig};
    use crate::store::JobStore;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::path::PathBuf;
    use std::process::Stdio;
    use std::time::Duration;
    use tokio::process::{Child, Command};
    use tower::ServiceExt;

    struct ScriptLauncher(String);

    impl JobLauncher for ScriptLauncher {
        fn launch(
            &self,
            spec: &InvocationSpec,
            output_dir: &std::path::Path,
        ) -> Result<Child, LaunchError> {
            let child = Command::new("sh")
                .arg("-c")
                .arg(&self.0)
                .env("JOB_INPUT", &spec.artifact)
                .env("JOB_OUTPUT", output_dir)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()?;
            Ok(child)
        }
    }

    struct Harness {
        _data: tempfile::TempDir,
        app: Router,
        service: Arc<JobService>,
        artifact: PathBuf,
    }

    fn start(script: &str) -> Harness {
        let data = tempfile::tempdir().unwrap();
        let artifact = data.path().join("scan.png");
        std::fs::write(&artifact, b"fake image").unwrap();

        let store = Arc::new(JobStore::open(data.path().join("jobs")).unwrap());
        let broadcaster = Arc::new(LogBroadcaster::default());
        let runner = JobRunner::start(
            RunnerConfig {
                worker_slots: 1,
                queue_capacity: 16,
                results_dir: data.path().join("results"),
            },
            Arc::clone(&store),
            Arc::clone(&broadcaster),
            Arc::new(ScriptLauncher(script.to_string())),
        )
        .unwrap();
        let service = Arc::new(JobService::new(store, broadcaster, runner, 1, 16));

        Harness {
            _data: data,
            app: routes(Arc::clone(&service)),
            service,
            artifact,
        }
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn submit(h: &Harness) -> String {
        let body = serde_json::json!({ "artifact": h.artifact.to_str().unwrap() });
        let response = h
            .app
            .clone()
            .oneshot(
                Request::post("/jobs")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let json = response_json(response).await;
        json["id"].as_str().unwrap().to_string()
    }

    async fn wait_for(h: &Harness, id: &str, status: JobStatus) {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if h.service.status(id).unwrap().status == status {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("job never reached expected status")
    }

    #[tokio::test]
    async fn health_check_reports_version_and_capacity() {
        let h = start("true");
        let response = h
            .app
            .oneshot(Request::get("/health-check").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = response_json(response).await;
        assert_eq!(json["status"], "ok");
        assert!(json["version"].is_string());
        assert_eq!(json["worker_slots"], 1);
        assert_eq!(json["queue_capacity"], 16);
    }

    #[tokio::test]
    async fn submit_and_poll_to_completion() {
        let h = start(r#"echo working; printf '# out' > "$JOB_OUTPUT/result.mmd""#);
        let id = submit(&h).await;
        wait_for(&h, &id, JobStatus::Finished).await;

        let response = h
            .app
            .clone()
            .oneshot(
                Request::get(format!("/jobs/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = response_json(response).await;
        assert_eq!(json["status"], "finished");
        assert_eq!(json["source_file_name"], "scan.png");
        assert!(json["started_at"].is_string());
        assert!(json["ended_at"].is_string());
    }

    #[tokio::test]
    async fn invalid_submission_is_unprocessable() {
        let h = start("true");
        let response = h
            .app
            .oneshot(
                Request::post("/jobs")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"artifact": "", "prompt": "x"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let json = response_json(response).await;
        assert!(json["error"].as_str().unwrap().contains("artifact"));
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let h = start("true");
        for request in [
            Request::get("/jobs/deadbeef").body(Body::empty()).unwrap(),
            Request::post("/jobs/deadbeef/cancel")
                .body(Body::empty())
                .unwrap(),
            Request::delete("/jobs/deadbeef")
                .body(Body::empty())
                .unwrap(),
            Request::get("/jobs/deadbeef/download")
                .body(Body::empty())
                .unwrap(),
        ] {
            let response = h.app.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
        }
    }

    #[tokio::test]
    async fn list_filters_by_status() {
        let h = start(r#"printf x > "$JOB_OUTPUT/r.mmd""#);
        let id = submit(&h).await;
        wait_for(&h, &id, JobStatus::Finished).await;

        let response = h
            .app
            .clone()
            .oneshot(
                Request::get("/jobs?status=finished")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = response_json(response).await;
        assert_eq!(json.as_array().unwrap().len(), 1);

        let response = h
            .app
            .clone()
            .oneshot(
                Request::get("/jobs?status=running")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = response_json(response).await;
        assert!(json.as_array().unwrap().is_empty());

        let response = h
            .app
            .clone()
            .oneshot(
                Request::get("/jobs?status=bogus")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn cancel_then_delete_through_the_api() {
        let h = start("sleep 30");
        let id = submit(&h).await;
        wait_for(&h, &id, JobStatus::Running).await;

        // Deleting a running job is refused.
        let response = h
            .app
            .clone()
            .oneshot(
                Request::delete(format!("/jobs/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = h
            .app
            .clone()
            .oneshot(
                Request::post(format!("/jobs/{id}/cancel"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        wait_for(&h, &id, JobStatus::Cancelled).await;

        let response = h
            .app
            .clone()
            .oneshot(
                Request::delete(format!("/jobs/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn download_serves_a_zip_attachment() {
        let h = start(r#"printf '# doc' > "$JOB_OUTPUT/result.mmd""#);
        let id = submit(&h).await;
        wait_for(&h, &id, JobStatus::Finished).await;

        let response = h
            .app
            .clone()
            .oneshot(
                Request::get(format!("/jobs/{id}/download?format=md"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/zip"
        );
        let disposition = response.headers()[header::CONTENT_DISPOSITION]
            .to_str()
            .unwrap()
            .to_string();
        assert!(disposition.contains(&format!("ocr_results_{id}.zip")));

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes.to_vec())).unwrap();
        assert!(archive.by_name("result.md").is_ok());
    }

    #[tokio::test]
    async fn download_before_finish_is_a_conflict() {
        let h = start("sleep 30");
        let id = submit(&h).await;
        wait_for(&h, &id, JobStatus::Running).await;

        let response = h
            .app
            .clone()
            .oneshot(
                Request::get(format!("/jobs/{id}/download"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        h.service.cancel(&id).unwrap();
    }

    #[tokio::test]
    async fn shutdown_triggers_service_shutdown() {
        let h = start("true");
        let mut rx = h.service.shutdown_signal();

        let response = h
            .app
            .clone()
            .oneshot(Request::post("/shutdown").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }
}
