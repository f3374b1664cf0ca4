use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use annotator::annotator::annotation::grafana::GrafanaSink;
use annotator::annotator::annotation::{
    AnnotationError, AnnotationPhase, AnnotationRequest, AnnotationSink, RegionRequest,
};
use annotator::annotator::k8s::{WorkloadKey, WorkloadKind};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{patch, post};
use axum::{Json, Router};
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use tokio::net::TcpListener;

#[derive(Clone, Debug)]
struct Captured {
    method: &'static str,
    path: String,
    authorization: Option<String>,
    body: Value,
}

#[derive(Clone)]
struct Grafana {
    requests: Arc<Mutex<Vec<Captured>>>,
    status: StatusCode,
    delay: Duration,
}

impl Grafana {
    fn new(status: StatusCode) -> Self {
        Self {
            requests: Arc::new(Mutex::new(Vec::new())),
            status,
            delay: Duration::ZERO,
        }
    }

    fn requests(&self) -> Vec<Captured> {
        self.requests.lock().expect("lock").clone()
    }

    async fn record(&self, method: &'static str, path: String, headers: &HeaderMap, body: Value) {
        self.requests.lock().expect("lock").push(Captured {
            method,
            path,
            authorization: headers
                .get("authorization")
                .and_then(|value| value.to_str().ok())
                .map(str::to_string),
            body,
        });
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

async fn create(
    State(grafana): State<Grafana>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    grafana
        .record("POST", "/api/annotations/graphite".to_string(), &headers, body)
        .await;
    if grafana.status == StatusCode::OK {
        let body = json!({ "id": 42, "message": "Annotation added" });
        (StatusCode::OK, Json(body)).into_response()
    } else {
        (grafana.status, "quota\nexceeded").into_response()
    }
}

async fn update(
    State(grafana): State<Grafana>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    grafana
        .record("PATCH", format!("/api/annotations/{id}"), &headers, body)
        .await;
    (grafana.status, Json(json!({ "message": "Annotation patched" }))).into_response()
}

async fn serve(grafana: Grafana) -> SocketAddr {
    let router = Router::new()
        .route("/api/annotations/graphite", post(create))
        .route("/api/annotations/:id", patch(update))
        .with_state(grafana);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve");
    });
    addr
}

fn sink(addr: SocketAddr, request_timeout: Duration) -> GrafanaSink {
    GrafanaSink::new(
        &format!("http://{addr}/"),
        "secret-key",
        Duration::from_secs(5),
        request_timeout,
    )
    .expect("sink")
}

fn key() -> WorkloadKey {
    WorkloadKey::new(WorkloadKind::Deployment, "shop", "web")
}

#[tokio::test]
async fn create_posts_graphite_payload_with_bearer_auth() {
    let grafana = Grafana::new(StatusCode::OK);
    let addr = serve(grafana.clone()).await;
    let sink = sink(addr, Duration::from_secs(5));
    assert_eq!(sink.base_url(), format!("http://{addr}"));

    let at = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
    let request = AnnotationRequest::for_workload(
        AnnotationPhase::Started,
        &key(),
        Some("registry:5000/web:2.1"),
        Some("2.1"),
        at,
    );
    let id = sink.create(&request).await.expect("create");
    assert_eq!(id, 42);

    let requests = grafana.requests();
    assert_eq!(requests.len(), 1);
    let captured = &requests[0];
    assert_eq!(captured.method, "POST");
    assert_eq!(captured.authorization.as_deref(), Some("Bearer secret-key"));
    assert_eq!(captured.body["what"], "deploy-start:web");
    assert_eq!(captured.body["data"], "Started deployment registry:5000/web:2.1");
    assert_eq!(captured.body["when"], at.timestamp());
    assert_eq!(
        captured.body["tags"],
        json!(["deploy", "shop", "web", "2.1", "started", "deployment"])
    );
}

#[tokio::test]
async fn region_patch_carries_end_in_millis() {
    let grafana = Grafana::new(StatusCode::OK);
    let addr = serve(grafana.clone()).await;
    let sink = sink(addr, Duration::from_secs(5));

    let end = Utc.with_ymd_and_hms(2024, 6, 1, 12, 5, 0).unwrap();
    let request = RegionRequest::for_workload(7, &key(), Some("2.1"), end);
    sink.extend_to_region(&request).await.expect("region");

    let requests = grafana.requests();
    assert_eq!(requests.len(), 1);
    let captured = &requests[0];
    assert_eq!(captured.method, "PATCH");
    assert_eq!(captured.path, "/api/annotations/7");
    assert_eq!(captured.authorization.as_deref(), Some("Bearer secret-key"));
    assert_eq!(captured.body["timeEnd"], end.timestamp_millis());
    assert_eq!(captured.body["isRegion"], true);
    assert_eq!(
        captured.body["tags"],
        json!(["deploy", "shop", "web", "2.1", "region", "deployment"])
    );
}

#[tokio::test]
async fn non_ok_status_is_an_error_with_sanitized_body() {
    let grafana = Grafana::new(StatusCode::TOO_MANY_REQUESTS);
    let addr = serve(grafana.clone()).await;
    let sink = sink(addr, Duration::from_secs(5));

    let request = AnnotationRequest::for_workload(
        AnnotationPhase::Deleted,
        &key(),
        None,
        None,
        Utc::now(),
    );
    match sink.create(&request).await {
        Err(AnnotationError::Status { status, body }) => {
            assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
            assert_eq!(body, "quotaexceeded");
        }
        other => panic!("expected status error, got {other:?}"),
    }
}

#[tokio::test]
async fn accepted_is_not_success() {
    let grafana = Grafana::new(StatusCode::ACCEPTED);
    let addr = serve(grafana.clone()).await;
    let sink = sink(addr, Duration::from_secs(5));

    let request = RegionRequest::for_workload(3, &key(), None, Utc::now());
    assert!(matches!(
        sink.extend_to_region(&request).await,
        Err(AnnotationError::Status { .. })
    ));
}

#[tokio::test]
async fn slow_sink_times_out() {
    let mut grafana = Grafana::new(StatusCode::OK);
    grafana.delay = Duration::from_secs(2);
    let addr = serve(grafana.clone()).await;
    let sink = sink(addr, Duration::from_millis(100));

    let request = AnnotationRequest::for_workload(
        AnnotationPhase::Started,
        &key(),
        Some("web:1"),
        Some("1"),
        Utc::now(),
    );
    assert!(matches!(
        sink.create(&request).await,
        Err(AnnotationError::Timeout)
    ));
}
