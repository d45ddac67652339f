//! HTTP build client against a mock Jenkins.
//!
//! The mock is an axum router bound to `127.0.0.1:0`. It serves the handful
//! of Jenkins REST endpoints the client uses and records the requests it
//! sees (method, path, query, basic-auth header, body) for assertions.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;

use polaris::config::JenkinsSettings;
use polaris::jenkins::{BuildClient, CiError, JenkinsClient};

#[derive(Debug, Clone)]
struct Seen {
    method: Method,
    uri: String,
    auth: Option<String>,
    body: String,
}

type Log = Arc<Mutex<Vec<Seen>>>;

fn remember(log: &Log, method: Method, uri: &Uri, headers: &HeaderMap, body: &Bytes) {
    log.lock().unwrap().push(Seen {
        method,
        uri: uri.to_string(),
        auth: headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body: String::from_utf8_lossy(body).into_owned(),
    });
}

async fn job_api(
    State(log): State<Log>,
    Path(job): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> impl IntoResponse {
    remember(&log, method, &uri, &headers, &Bytes::new());
    if job != "shop_smoke" {
        return StatusCode::NOT_FOUND.into_response();
    }
    Json(serde_json::json!({
        "_class": "hudson.model.FreeStyleProject",
        "nextBuildNumber": 44,
        "builds": [{"number": 43}, {"number": 41}, {"number": 42}]
    }))
    .into_response()
}

async fn build_api(
    State(log): State<Log>,
    Path((_job, number)): Path<(String, i64)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> impl IntoResponse {
    remember(&log, method, &uri, &headers, &Bytes::new());
    match number {
        41 => Json(serde_json::json!({"result": "SUCCESS", "building": false})).into_response(),
        42 => Json(serde_json::json!({"result": "UNSTABLE", "building": false})).into_response(),
        43 => Json(serde_json::json!({"result": null, "building": true})).into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn console(
    State(log): State<Log>,
    Path((_job, number)): Path<(String, i64)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> impl IntoResponse {
    remember(&log, method, &uri, &headers, &Bytes::new());
    format!("Started by user ci\nbuild {}\nFinished: SUCCESS\n", number)
}

async fn computer(
    State(log): State<Log>,
    Path(node): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> impl IntoResponse {
    remember(&log, method, &uri, &headers, &Bytes::new());
    match node.as_str() {
        "agent-1" => Json(serde_json::json!({"offline": false})).into_response(),
        "agent-2" => Json(serde_json::json!({"offline": true})).into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn config_get(
    State(log): State<Log>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> impl IntoResponse {
    remember(&log, method, &uri, &headers, &Bytes::new());
    "<project><description>smoke</description></project>"
}

async fn record_post(
    State(log): State<Log>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    remember(&log, method, &uri, &headers, &body);
    if uri.path().contains("/job/gone/") {
        return StatusCode::NOT_FOUND;
    }
    if uri.path().contains("/job/broken/") {
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    StatusCode::CREATED
}

/// Start the mock and return its base URL and request log.
async fn start_mock_jenkins() -> (String, Log, tokio::task::JoinHandle<()>) {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new()
        .route("/job/{job}/api/json", get(job_api))
        .route("/job/{job}/{number}/api/json", get(build_api))
        .route("/job/{job}/{number}/consoleText", get(console))
        .route("/computer/{node}/api/json", get(computer))
        .route("/job/{job}/config.xml", get(config_get).post(record_post))
        .route("/job/{job}/build", post(record_post))
        .route("/job/{job}/doDelete", post(record_post))
        .route("/createItem", post(record_post))
        .with_state(Arc::clone(&log));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    let url = format!("http://127.0.0.1:{}", addr.port());
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (url, log, handle)
}

fn client(url: &str, username: &str) -> JenkinsClient {
    JenkinsClient::new(&JenkinsSettings {
        url: url.to_string(),
        username: username.to_string(),
        api_token: "t0ken".to_string(),
        timeout_secs: 5,
    })
    .unwrap()
}

#[tokio::test]
async fn lists_builds_oldest_first() {
    let (url, log, handle) = start_mock_jenkins().await;
    let c = client(&url, "ci");

    let builds = c.job_builds("shop_smoke").await.unwrap();
    assert_eq!(builds.next_build_number, 44);
    assert_eq!(builds.builds, vec![41, 42, 43]);
    assert_eq!(c.next_build_number("shop_smoke").await.unwrap(), 44);

    let seen = log.lock().unwrap().clone();
    assert!(seen[0].uri.starts_with("/job/shop_smoke/api/json?tree=nextBuildNumber"));
    // base64("ci:t0ken")
    assert_eq!(seen[0].auth.as_deref(), Some("Basic Y2k6dDBrZW4="));
    handle.abort();
}

#[tokio::test]
async fn build_result_is_none_while_building() {
    let (url, _log, handle) = start_mock_jenkins().await;
    let c = client(&url, "ci");

    assert_eq!(
        c.build_result("shop_smoke", 41).await.unwrap().as_deref(),
        Some("SUCCESS")
    );
    assert_eq!(
        c.build_result("shop_smoke", 42).await.unwrap().as_deref(),
        Some("UNSTABLE")
    );
    assert_eq!(c.build_result("shop_smoke", 43).await.unwrap(), None);
    assert!(c
        .build_result("shop_smoke", 99)
        .await
        .unwrap_err()
        .is_not_found());
    handle.abort();
}

#[tokio::test]
async fn console_and_node_status() {
    let (url, _log, handle) = start_mock_jenkins().await;
    let c = client(&url, "ci");

    let text = c.console_output("shop_smoke", 41).await.unwrap();
    assert!(text.contains("build 41"));
    assert!(c.node_online("agent-1").await.unwrap());
    assert!(!c.node_online("agent-2").await.unwrap());
    assert!(c.node_online("agent-9").await.unwrap_err().is_not_found());
    handle.abort();
}

#[tokio::test]
async fn job_management_posts_config_xml() {
    let (url, log, handle) = start_mock_jenkins().await;
    let c = client(&url, "");

    c.create_job("shop_new", "<project/>").await.unwrap();
    c.reconfigure_job("shop_smoke", "<project><description>x</description></project>")
        .await
        .unwrap();
    c.start_build("shop_smoke").await.unwrap();
    c.delete_job("shop_smoke").await.unwrap();
    let xml = c.job_config("shop_smoke").await.unwrap();
    assert!(xml.contains("<description>smoke</description>"));

    let seen = log.lock().unwrap().clone();
    assert_eq!(seen[0].method, Method::POST);
    assert!(seen[0].uri.ends_with("/createItem?name=shop_new"));
    assert_eq!(seen[0].body, "<project/>");
    assert!(seen[1].uri.ends_with("/job/shop_smoke/config.xml"));
    assert!(seen[1].body.contains("<description>x</description>"));
    assert!(seen[2].uri.ends_with("/job/shop_smoke/build"));
    assert!(seen[3].uri.ends_with("/job/shop_smoke/doDelete"));
    assert!(seen.iter().all(|s| s.auth.is_none()));
    handle.abort();
}

#[tokio::test]
async fn status_codes_map_to_error_kinds() {
    let (url, _log, handle) = start_mock_jenkins().await;
    let c = client(&url, "ci");

    assert!(c.delete_job("gone").await.unwrap_err().is_not_found());
    assert!(c.next_build_number("other").await.unwrap_err().is_not_found());
    match c.start_build("broken").await {
        Err(CiError::Status { status, .. }) => assert_eq!(status, 500),
        other => panic!("expected status error, got {:?}", other),
    }
    handle.abort();
}

#[tokio::test]
async fn unreachable_server_is_reported_as_such() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let c = client(&format!("http://127.0.0.1:{}", port), "ci");
    match c.job_builds("shop_smoke").await {
        Err(CiError::Unreachable(_)) => {}
        other => panic!("expected unreachable, got {:?}", other),
    }
}
