use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{Duration, Utc};
use kvrep_core::{
    CredentialBroker, DedupeGate, Error, Replicator, Result, SecretRecord, SessionCredentials,
    SourceStore, TargetStore,
};
use kvrep_replicator::AppState;
use kvrep_replicator::telemetry::CORRELATION_ID_HEADER;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tower::ServiceExt;

struct FakeSource {
    values: HashMap<String, String>,
}

#[async_trait]
impl SourceStore for FakeSource {
    async fn get_secret(&self, name: &str, version: Option<&str>) -> Result<Option<SecretRecord>> {
        match self.values.get(name) {
            Some(value) => Ok(Some(SecretRecord {
                name: name.to_string(),
                value: value.clone(),
                version: version.unwrap_or("latest").to_string(),
            })),
            None => Err(Error::Source(format!("secret {name} not found"))),
        }
    }
}

#[derive(Default)]
struct FakeGate {
    claimed: Mutex<HashSet<(String, String)>>,
}

#[async_trait]
impl DedupeGate for FakeGate {
    async fn try_claim(&self, name: &str, version: &str) -> Result<bool> {
        Ok(self
            .claimed
            .lock()
            .await
            .insert((name.to_string(), version.to_string())))
    }
}

#[derive(Default)]
struct FakeBroker;

#[async_trait]
impl CredentialBroker for FakeBroker {
    async fn credentials(&self) -> Result<SessionCredentials> {
        Ok(SessionCredentials {
            access_key_id: "AKIDTEST".into(),
            secret_access_key: "secret".into(),
            session_token: "token".into(),
            expires_at: Utc::now() + Duration::minutes(30),
        })
    }
}

#[derive(Default)]
struct FakeTarget {
    written: Mutex<HashMap<String, String>>,
    upserts: AtomicUsize,
}

#[async_trait]
impl TargetStore for FakeTarget {
    async fn upsert(
        &self,
        name: &str,
        value: &str,
        _credentials: &SessionCredentials,
    ) -> Result<()> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        self.written
            .lock()
            .await
            .insert(name.to_string(), value.to_string());
        Ok(())
    }
}

fn test_app(values: &[(&str, &str)]) -> (axum::Router, Arc<FakeTarget>) {
    let source = Arc::new(FakeSource {
        values: values
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect(),
    });
    let target = Arc::new(FakeTarget::default());
    let replicator = Replicator::new(
        source,
        Arc::new(FakeGate::default()),
        Arc::new(FakeBroker),
        target.clone(),
    );
    let state = AppState::new(Arc::new(replicator));
    (kvrep_replicator::http::router(state), target)
}

fn post_events(payload: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/events")
        .header("content-type", "application/json")
        .body(Body::from(payload.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn change_event(name: &str, version: &str) -> Value {
    json!({
        "eventType": "Microsoft.KeyVault.SecretNewVersionCreated",
        "subject": name,
        "data": {
            "Id": format!("https://vault.example.net/secrets/{name}/{version}"),
            "ObjectName": name,
            "Version": version
        }
    })
}

#[tokio::test]
async fn healthz_reports_ok() {
    let (app, _) = test_app(&[]);
    let response = app
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({ "status": "ok" }));
}

#[tokio::test]
async fn validation_handshake_is_answered_without_replication() {
    let (app, target) = test_app(&[]);
    let response = app
        .oneshot(post_events(json!([{
            "eventType": "Microsoft.EventGrid.SubscriptionValidationEvent",
            "data": { "validationCode": "code-123" }
        }])))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await,
        json!({ "validationResponse": "code-123" })
    );
    assert_eq!(target.upserts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn event_replicates_end_to_end() {
    let (app, target) = test_app(&[("secretA", "hunter2")]);
    let response = app
        .oneshot(post_events(change_event("secretA", "v1")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await,
        json!({ "received": 1, "replicated": 1, "skipped": 0 })
    );
    assert_eq!(
        target.written.lock().await.get("secretA"),
        Some(&"hunter2".to_string())
    );
}

#[tokio::test]
async fn duplicate_delivery_skips_at_the_gate() {
    let (app, target) = test_app(&[("secretA", "hunter2")]);

    let first = app
        .clone()
        .oneshot(post_events(change_event("secretA", "v1")))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app
        .oneshot(post_events(change_event("secretA", "v1")))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(
        body_json(second).await,
        json!({ "received": 1, "replicated": 0, "skipped": 1 })
    );
    assert_eq!(target.upserts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn batches_process_each_event() {
    let (app, target) = test_app(&[("alpha", "1"), ("beta", "2")]);
    let response = app
        .oneshot(post_events(json!([
            change_event("alpha", "v1"),
            change_event("beta", "v1"),
            { "subject": null }
        ])))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await,
        json!({ "received": 3, "replicated": 2, "skipped": 1 })
    );
    assert_eq!(target.upserts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn partial_event_is_a_skip_not_an_error() {
    let (app, target) = test_app(&[]);
    let response = app
        .oneshot(post_events(json!({ "subject": "a/b/c" })))
        .await
        .unwrap();

    // 200 so the platform does not redeliver expected traffic
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await,
        json!({ "received": 1, "replicated": 0, "skipped": 1 })
    );
    assert_eq!(target.upserts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn pipeline_failure_returns_500_with_correlation_id() {
    // source store has no such secret: the read is a fatal error
    let (app, _) = test_app(&[]);
    let response = app
        .oneshot(post_events(change_event("ghost", "v1")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(response.headers().contains_key(CORRELATION_ID_HEADER));
    let body = body_json(response).await;
    assert_eq!(body["error"], "replication_failed");
    assert!(body["correlation_id"].is_string());
}

#[tokio::test]
async fn inbound_correlation_id_is_echoed() {
    let (app, _) = test_app(&[("secretA", "x")]);
    let mut request = post_events(change_event("secretA", "v1"));
    request
        .headers_mut()
        .insert(CORRELATION_ID_HEADER, "corr-42".parse().unwrap());

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(
        response.headers().get(CORRELATION_ID_HEADER).unwrap(),
        "corr-42"
    );
}

#[tokio::test]
async fn malformed_batch_is_a_bad_request() {
    let (app, _) = test_app(&[]);
    let response = app
        .oneshot(post_events(json!(["just a string"])))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "bad_request");
}
