use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use agentexec_api::app::{AppState, LivenessProbe, build_app};
use agentexec_observability::PipelineMetrics;
use prometheus::Registry;
use reqwest::StatusCode;

struct SwitchProbe(AtomicBool);

impl LivenessProbe for SwitchProbe {
    fn is_live(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn(state: AppState) -> Self {
        // Same router as prod, bound to an ephemeral port.
        let app = build_app(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base_url, handle }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn metrics() -> PipelineMetrics {
    PipelineMetrics::new(Registry::new()).unwrap()
}

#[tokio::test]
async fn health_reflects_probe() {
    let probe = Arc::new(SwitchProbe(AtomicBool::new(true)));
    let server = TestServer::spawn(AppState::new(probe.clone(), metrics())).await;
    let client = reqwest::Client::new();

    let res = client
        .get(format!("{}/health", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["status"], "ok");

    probe.0.store(false, Ordering::SeqCst);
    let res = client
        .get(format!("{}/health", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["status"], "unavailable");
}

#[tokio::test]
async fn metrics_are_exposed_as_text() {
    let metrics = metrics();
    metrics.job_finished("completed", std::time::Duration::from_millis(250));
    metrics.job_retried();

    let probe = Arc::new(SwitchProbe(AtomicBool::new(true)));
    let server = TestServer::spawn(AppState::new(probe, metrics)).await;

    let res = reqwest::get(format!("{}/metrics", server.base_url))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert!(
        res.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/plain")
    );

    let body = res.text().await.unwrap();
    assert!(body.contains("agent_executor_jobs_total{status=\"completed\"} 1"));
    assert!(body.contains("agent_executor_jobs_retried_total 1"));
    assert!(body.contains("agent_executor_job_duration_seconds_bucket"));
}

#[tokio::test]
async fn unknown_route_is_not_found() {
    let probe = Arc::new(SwitchProbe(AtomicBool::new(false)));
    let server = TestServer::spawn(AppState::new(probe, metrics())).await;

    let res = reqwest::get(format!("{}/jobs", server.base_url)).await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}
