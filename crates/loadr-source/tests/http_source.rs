use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use loadr_core::{DeliveryId, ErrorDisposition, LoaderError};
use loadr_source::{file_name_for, DeliveryFile, DeliveryRow, DeliverySource, HttpSource, HttpSourceConfig};
use loadr_storage::BackoffPolicy;

/// Serves files by `<pipeline>/<name>`; scripted statuses are answered first.
#[derive(Clone, Default)]
struct Feed {
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    script: Arc<Mutex<VecDeque<StatusCode>>>,
    authorization: Arc<Mutex<Vec<Option<String>>>>,
}

impl Feed {
    fn put(&self, file: &DeliveryFile) {
        let path = format!("{}/{}", file.pipeline, file_name_for(file.sequence));
        let body = serde_json::to_vec(file).expect("encode");
        self.files.lock().expect("files").insert(path, body);
    }

    fn fail_with(&self, statuses: &[StatusCode]) {
        self.script.lock().expect("script").extend(statuses.iter().copied());
    }

    fn hits(&self) -> usize {
        self.authorization.lock().expect("auth").len()
    }
}

async fn serve_file(State(feed): State<Feed>, Path((pipeline, name)): Path<(String, String)>, headers: HeaderMap) -> Response {
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    feed.authorization.lock().expect("auth").push(auth);

    if let Some(status) = feed.script.lock().expect("script").pop_front() {
        return status.into_response();
    }
    match feed.files.lock().expect("files").get(&format!("{pipeline}/{name}")) {
        Some(body) => (StatusCode::OK, body.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn start_feed(feed: Feed) -> (String, tokio::task::JoinHandle<()>) {
    let app = Router::new()
        .route("/{pipeline}/{name}", get(serve_file))
        .with_state(feed);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind listener");
    let addr: SocketAddr = listener.local_addr().expect("listener addr");
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve feed");
    });
    (format!("http://{addr}"), handle)
}

fn source(base_url: String, token: Option<&str>, max_retries: usize) -> HttpSource {
    HttpSource::new(HttpSourceConfig {
        base_url,
        token: token.map(str::to_string),
        timeout: Duration::from_secs(5),
        backoff: BackoffPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        },
        ..Default::default()
    })
    .expect("http source")
}

fn sample(sequence: i64) -> DeliveryFile {
    DeliveryFile::new("orders", DeliveryId(sequence)).with_row(DeliveryRow::Checkpoint {
        owner_id: 3,
        timestamp: "2024-02-01T16:00:00Z".parse().expect("ts"),
    })
}

#[tokio::test]
async fn missing_file_means_no_new_delivery() {
    let feed = Feed::default();
    let (base_url, _handle) = start_feed(feed.clone()).await;

    let fetched = source(base_url, None, 3)
        .fetch("orders", DeliveryId(1))
        .await
        .expect("fetch");
    assert!(fetched.is_none());
    assert_eq!(feed.hits(), 1);
}

#[tokio::test]
async fn server_errors_are_retried_until_the_file_arrives() {
    let feed = Feed::default();
    feed.put(&sample(2));
    feed.fail_with(&[StatusCode::SERVICE_UNAVAILABLE, StatusCode::TOO_MANY_REQUESTS]);
    let (base_url, _handle) = start_feed(feed.clone()).await;

    let fetched = source(base_url, None, 3)
        .fetch("orders", DeliveryId(2))
        .await
        .expect("fetch")
        .expect("present");
    assert_eq!(fetched, sample(2));
    assert_eq!(feed.hits(), 3);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let feed = Feed::default();
    feed.put(&sample(1));
    feed.fail_with(&[StatusCode::FORBIDDEN]);
    let (base_url, _handle) = start_feed(feed.clone()).await;

    let err = source(base_url, None, 3)
        .fetch("orders", DeliveryId(1))
        .await
        .expect_err("forbidden");
    assert!(matches!(err, LoaderError::Source { .. }));
    assert_eq!(feed.hits(), 1);
}

#[tokio::test]
async fn retries_stop_at_the_policy_limit() {
    let feed = Feed::default();
    feed.put(&sample(1));
    feed.fail_with(&[StatusCode::BAD_GATEWAY; 5]);
    let (base_url, _handle) = start_feed(feed.clone()).await;

    let err = source(base_url, None, 2)
        .fetch("orders", DeliveryId(1))
        .await
        .expect_err("gives up");
    assert_eq!(err.disposition(), ErrorDisposition::Retry);
    let cause = std::error::Error::source(&err).expect("cause").to_string();
    assert!(cause.contains("502"), "{cause}");
    assert_eq!(feed.hits(), 3);
}

#[tokio::test]
async fn bearer_token_is_sent_on_every_attempt() {
    let feed = Feed::default();
    feed.put(&sample(1));
    feed.fail_with(&[StatusCode::INTERNAL_SERVER_ERROR]);
    let (base_url, _handle) = start_feed(feed.clone()).await;

    source(base_url, Some("feed-token"), 3)
        .fetch("orders", DeliveryId(1))
        .await
        .expect("fetch")
        .expect("present");
    let seen = feed.authorization.lock().expect("auth").clone();
    assert_eq!(seen, vec![Some("Bearer feed-token".to_string()); 2]);
}

#[tokio::test]
async fn body_for_another_sequence_is_rejected() {
    let feed = Feed::default();
    let body = serde_json::to_vec(&sample(4)).expect("encode");
    feed.files
        .lock()
        .expect("files")
        .insert(format!("orders/{}", file_name_for(DeliveryId(5))), body);
    let (base_url, _handle) = start_feed(feed.clone()).await;

    let err = source(base_url, None, 0)
        .fetch("orders", DeliveryId(5))
        .await
        .expect_err("mismatched sequence");
    assert_eq!(err.disposition(), ErrorDisposition::Halt);
}
