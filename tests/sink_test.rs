//! HTTP sink against a local mock of the batch events API

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use logbucket::publish::{Event, EventSink, HttpSink, PublishError, SinkConfig};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio::time::{Duration, sleep};

#[derive(Default)]
struct MockApi {
    /// Respond with this status for the first `fail_first` requests
    fail_status: u16,
    fail_first: usize,
    requests: AtomicUsize,
    received: Mutex<Vec<(String, String, Value)>>,
}

async fn batch(
    State(api): State<Arc<MockApi>>,
    Path(dataset): Path<String>,
    headers: HeaderMap,
    Json(events): Json<Vec<Value>>,
) -> (StatusCode, Json<Value>) {
    let n = api.requests.fetch_add(1, Ordering::SeqCst);
    if n < api.fail_first {
        let status = StatusCode::from_u16(api.fail_status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return (status, Json(json!({"error": "try later"})));
    }

    let key = headers
        .get("X-Honeycomb-Team")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let statuses: Vec<Value> = events.iter().map(|_| json!({"status": 202})).collect();
    let mut received = api.received.lock().await;
    for event in events {
        received.push((dataset.clone(), key.clone(), event));
    }
    (StatusCode::OK, Json(Value::Array(statuses)))
}

/// Start the mock server and return its base URL
async fn start_mock_server(api: Arc<MockApi>) -> String {
    let app = Router::new()
        .route("/1/batch/{dataset}", post(batch))
        .with_state(api);

    // Bind to random available port
    let addr = SocketAddr::from(([127, 0, 0, 1], 0));
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    let bound_addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    sleep(Duration::from_millis(50)).await;

    format!("http://{}/", bound_addr)
}

fn create_test_sink(api_host: String, batch_size: usize) -> HttpSink {
    HttpSink::new(SinkConfig {
        api_host,
        dataset: "aws-elb-access".to_string(),
        write_key: "secret-key".to_string(),
        batch_size,
        backoff: Duration::from_millis(10),
        ..SinkConfig::default()
    })
    .unwrap()
}

fn create_test_events(n: usize) -> Vec<Event> {
    (0..n)
        .map(|i| {
            let mut data = serde_json::Map::new();
            data.insert("elb_status_code".to_string(), json!(200));
            data.insert("request".to_string(), json!(format!("GET /{}", i)));
            let mut event = Event::new(chrono::Utc::now(), data);
            event.sample_rate = 4;
            event
        })
        .collect()
}

#[tokio::test]
async fn test_events_posted_in_batches() {
    let api = Arc::new(MockApi::default());
    let host = start_mock_server(api.clone()).await;
    let sink = create_test_sink(host, 2);

    sink.send(&create_test_events(5)).await.unwrap();

    // 5 events at batch size 2
    assert_eq!(api.requests.load(Ordering::SeqCst), 3);

    let received = api.received.lock().await;
    assert_eq!(received.len(), 5);
    let (dataset, key, event) = &received[0];
    assert_eq!(dataset, "aws-elb-access");
    assert_eq!(key, "secret-key");
    assert_eq!(event["samplerate"], 4);
    assert_eq!(event["data"]["elb_status_code"], 200);
    assert!(event["time"].is_string());
}

#[tokio::test]
async fn test_server_errors_are_retried() {
    let api = Arc::new(MockApi {
        fail_status: 503,
        fail_first: 2,
        ..Default::default()
    });
    let host = start_mock_server(api.clone()).await;
    let sink = create_test_sink(host, 100);

    sink.send(&create_test_events(1)).await.unwrap();

    assert_eq!(api.requests.load(Ordering::SeqCst), 3);
    assert_eq!(api.received.lock().await.len(), 1);
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let api = Arc::new(MockApi {
        fail_status: 400,
        fail_first: usize::MAX,
        ..Default::default()
    });
    let host = start_mock_server(api.clone()).await;
    let sink = create_test_sink(host, 100);

    let result = sink.send(&create_test_events(1)).await;

    assert!(matches!(result, Err(PublishError::Rejected { status: 400, .. })));
    assert_eq!(api.requests.load(Ordering::SeqCst), 1);
}
