//! End-to-end pusher scenarios against a local mock ingest endpoint.

use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use chrono::{TimeZone, Utc};

use netpulse_probe::probe::{Measurement, ProbeType};
use netpulse_probe::push::Pusher;
use netpulse_probe::store::Store;

/// Scripted ingest endpoint: answers request N with `responses[N]`
/// (repeating the last entry), recording every body it sees.
struct MockIngest {
    requests: AtomicUsize,
    responses: Vec<StatusCode>,
    bodies: Mutex<Vec<Vec<u8>>>,
    api_keys: Mutex<Vec<String>>,
}

async fn ingest_handler(
    State(state): State<Arc<MockIngest>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let n = state.requests.fetch_add(1, Ordering::SeqCst);
    state.bodies.lock().expect("bodies lock").push(body.to_vec());
    state.api_keys.lock().expect("keys lock").push(
        headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string(),
    );

    *state
        .responses
        .get(n)
        .or_else(|| state.responses.last())
        .expect("at least one scripted response")
}

async fn spawn_ingest(responses: Vec<StatusCode>) -> (String, Arc<MockIngest>) {
    let state = Arc::new(MockIngest {
        requests: AtomicUsize::new(0),
        responses,
        bodies: Mutex::new(Vec::new()),
        api_keys: Mutex::new(Vec::new()),
    });

    let app = Router::new()
        .route("/api/v1/ingest", post(ingest_handler))
        .with_state(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("binding mock ingest");
    let addr = listener.local_addr().expect("local addr");

    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serving mock ingest");
    });

    (format!("http://{addr}"), state)
}

fn gunzip(data: &[u8]) -> Vec<u8> {
    let mut decoder = flate2::read::GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).expect("gunzip body");
    out
}

fn decode_payload(body: &[u8]) -> serde_json::Value {
    serde_json::from_slice(&gunzip(body)).expect("decoding ingest payload")
}

fn seeded_store(count: u32) -> Arc<Store> {
    let store = Store::open_in_memory().expect("store");

    let batch: Vec<Measurement> = (0..count)
        .map(|i| {
            let mut m = Measurement::new(ProbeType::Ping, "1.1.1.1");
            m.timestamp = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
                + chrono::Duration::seconds(i64::from(i));
            m.latency_min = Some(5.0);
            m.latency_avg = Some(10.0 + f64::from(i));
            m.latency_max = Some(50.0);
            m.packet_loss = Some(0.0);
            m
        })
        .collect();
    store.save_measurements(&batch).expect("seed measurements");

    Arc::new(store)
}

#[tokio::test]
async fn push_round_trip_marks_all_synced() {
    let (url, server) = spawn_ingest(vec![StatusCode::OK]).await;
    let store = seeded_store(3);

    let pusher = Pusher::new(url, "np_probe_test_key", "probe-1", Arc::clone(&store))
        .expect("pusher");

    pusher.push_all().await;

    assert!(store.get_unsynced(100).expect("get unsynced").is_empty());
    assert_eq!(server.requests.load(Ordering::SeqCst), 1);

    let bodies = server.bodies.lock().expect("bodies lock");
    let payload = decode_payload(&bodies[0]);

    assert_eq!(payload["probe_id"], "probe-1");

    let measurements = payload["measurements"].as_array().expect("array");
    assert_eq!(measurements.len(), 3);
    assert_eq!(
        measurements[0]["timestamp"],
        "2024-01-01T00:00:00.000000000Z",
    );
    assert_eq!(measurements[0]["latency_avg"], 10.0);
    // latency_min/max are stored locally but never shipped.
    assert!(measurements[0].get("latency_min").is_none());
    assert!(measurements[0].get("latency_max").is_none());
    // Absent metrics are absent keys, not nulls or zeros.
    assert!(measurements[0].get("dns_time").is_none());

    assert_eq!(
        server.api_keys.lock().expect("keys lock")[0],
        "np_probe_test_key",
    );
    drop(bodies);

    // A second drain finds nothing and stays off the wire.
    pusher.push_all().await;
    assert_eq!(server.requests.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn push_failure_keeps_records_for_next_cycle() {
    let (url, server) =
        spawn_ingest(vec![StatusCode::INTERNAL_SERVER_ERROR, StatusCode::OK]).await;
    let store = seeded_store(3);

    let pusher = Pusher::new(url, "key", "probe-1", Arc::clone(&store)).expect("pusher");

    // First cycle fails; nothing is marked synced.
    pusher.push_all().await;
    assert_eq!(store.get_unsynced(100).expect("get unsynced").len(), 3);

    // Second cycle re-sends the same records and succeeds.
    pusher.push_all().await;
    assert!(store.get_unsynced(100).expect("get unsynced").is_empty());
    assert_eq!(server.requests.load(Ordering::SeqCst), 2);

    let bodies = server.bodies.lock().expect("bodies lock");
    let first = decode_payload(&bodies[0]);
    let second = decode_payload(&bodies[1]);
    // The retry carries the identical batch, so server-side dedup by
    // (probe_id, timestamp, target) sees no new data.
    assert_eq!(first, second);
}

#[tokio::test]
async fn rate_limited_batch_stays_unsynced() {
    let (url, server) = spawn_ingest(vec![StatusCode::TOO_MANY_REQUESTS]).await;
    let store = seeded_store(2);

    let pusher = Pusher::new(url, "key", "probe-1", Arc::clone(&store)).expect("pusher");

    pusher.push_all().await;

    assert_eq!(store.get_unsynced(100).expect("get unsynced").len(), 2);
    // One attempt only; backoff is the pusher's tick interval.
    assert_eq!(server.requests.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn full_batches_keep_draining_in_one_cycle() {
    let (url, server) = spawn_ingest(vec![StatusCode::OK]).await;
    // One more than the batch size forces a second, short batch.
    let store = seeded_store(501);

    let pusher = Pusher::new(url, "key", "probe-1", Arc::clone(&store)).expect("pusher");

    pusher.push_all().await;

    assert!(store.get_unsynced(1000).expect("get unsynced").is_empty());
    assert_eq!(server.requests.load(Ordering::SeqCst), 2);

    let bodies = server.bodies.lock().expect("bodies lock");
    let first = decode_payload(&bodies[0]);
    let second = decode_payload(&bodies[1]);
    assert_eq!(
        first["measurements"].as_array().expect("array").len(),
        500,
    );
    assert_eq!(second["measurements"].as_array().expect("array").len(), 1);
}
