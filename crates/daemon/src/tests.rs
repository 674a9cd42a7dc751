use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use drivedeck_core::progress::{ProgressReport, ProgressSink, TaskReport};
use drivedeck_core::{
    BatchOutcome, DriveClient, DriveCredentials, Error, RelayClient, RelaySettings, UploadLimits,
    UploadQueue, UploadTask,
};

use crate::routes::{self, AppState, parse_range};

#[derive(Debug, Clone)]
struct MockFile {
    id: String,
    name: String,
    mime_type: String,
    bytes: Vec<u8>,
    parents: Vec<String>,
    trashed: bool,
}

#[derive(Debug)]
struct MockSession {
    name: String,
    mime_type: String,
    parents: Vec<String>,
    total: u64,
    received: Vec<u8>,
}

#[derive(Debug, Default)]
struct MockDrive {
    base: String,
    next_id: u64,
    token_calls: usize,
    sessions: HashMap<String, MockSession>,
    files: Vec<MockFile>,
}

impl MockDrive {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}{}", self.next_id)
    }

    fn file(&self, id: &str) -> Option<&MockFile> {
        self.files.iter().find(|f| f.id == id)
    }

    fn insert(&mut self, name: &str, mime_type: &str, bytes: Vec<u8>, parents: Vec<String>) -> MockFile {
        let file = MockFile {
            id: self.next_id("file"),
            name: name.to_string(),
            mime_type: mime_type.to_string(),
            bytes,
            parents,
            trashed: false,
        };
        self.files.push(file.clone());
        file
    }
}

type Mock = Arc<Mutex<MockDrive>>;

fn google_error(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": { "code": status.as_u16(), "message": message } })),
    )
        .into_response()
}

fn file_json(f: &MockFile) -> serde_json::Value {
    serde_json::json!({
        "id": f.id,
        "name": f.name,
        "mimeType": f.mime_type,
        "size": f.bytes.len().to_string(),
        "modifiedTime": "2024-03-15T12:00:00.000Z",
        "parents": f.parents,
        "webViewLink": format!("https://drive.example/{}", f.id),
    })
}

async fn mock_token(State(mock): State<Mock>) -> Json<serde_json::Value> {
    mock.lock().unwrap().token_calls += 1;
    Json(serde_json::json!({ "access_token": "tok", "expires_in": 3600 }))
}

async fn mock_upload(
    State(mock): State<Mock>,
    Query(q): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut drive = mock.lock().unwrap();
    match q.get("uploadType").map(String::as_str) {
        Some("resumable") => {
            let meta: serde_json::Value = serde_json::from_slice(&body).unwrap_or_default();
            let name = meta["name"].as_str().unwrap_or_default().to_string();
            if name == "reject-me" {
                return google_error(StatusCode::FORBIDDEN, "The user does not have sufficient permissions");
            }
            let header = |h: &str| {
                headers
                    .get(h)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string()
            };
            let total = header("x-upload-content-length").parse().unwrap_or(0);
            let sid = drive.next_id("s");
            drive.sessions.insert(
                sid.clone(),
                MockSession {
                    name,
                    mime_type: header("x-upload-content-type"),
                    parents: serde_json::from_value(meta["parents"].clone()).unwrap_or_default(),
                    total,
                    received: Vec::new(),
                },
            );
            let location = format!("{}/upload/drive/v3/session/{sid}", drive.base);
            (StatusCode::OK, [(header::LOCATION, location)]).into_response()
        }
        Some("multipart") => {
            let text = String::from_utf8_lossy(&body).to_string();
            let parts: Vec<&str> = text.split("\r\n\r\n").collect();
            let meta: serde_json::Value = parts
                .get(1)
                .and_then(|p| p.split("\r\n").next())
                .and_then(|m| serde_json::from_str(m).ok())
                .unwrap_or_default();
            let content = parts
                .get(2)
                .and_then(|p| p.rsplit_once("\r\n--"))
                .map(|(c, _)| c.as_bytes().to_vec())
                .unwrap_or_default();
            let name = meta["name"].as_str().unwrap_or_default().to_string();
            let file = drive.insert(&name, "text/plain", content, Vec::new());
            Json(file_json(&file)).into_response()
        }
        _ => google_error(StatusCode::BAD_REQUEST, "unsupported uploadType"),
    }
}

async fn mock_put_session(
    State(mock): State<Mock>,
    Path(sid): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut drive = mock.lock().unwrap();
    let Some(session) = drive.sessions.get_mut(&sid) else {
        return google_error(StatusCode::NOT_FOUND, "session not found");
    };
    if session.name == "fail.bin" {
        return (StatusCode::INTERNAL_SERVER_ERROR, "quota exceeded").into_response();
    }
    let range = headers
        .get(header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    if !range.starts_with("bytes */") {
        let start: usize = range
            .trim_start_matches("bytes ")
            .split('-')
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap_or(usize::MAX);
        if start != session.received.len() {
            return google_error(StatusCode::BAD_REQUEST, "out of order chunk");
        }
    }
    session.received.extend_from_slice(&body);

    if session.received.len() as u64 >= session.total {
        let name = session.name.clone();
        let mime_type = session.mime_type.clone();
        let parents = session.parents.clone();
        let bytes = std::mem::take(&mut session.received);
        drive.sessions.remove(&sid);
        let file = drive.insert(&name, &mime_type, bytes, parents);
        return Json(serde_json::json!({ "id": file.id, "name": file.name })).into_response();
    }
    let acked = format!("bytes=0-{}", session.received.len() - 1);
    (StatusCode::PERMANENT_REDIRECT, [(header::RANGE, acked)]).into_response()
}

async fn mock_list(State(mock): State<Mock>) -> Json<serde_json::Value> {
    let drive = mock.lock().unwrap();
    let files: Vec<_> = drive
        .files
        .iter()
        .filter(|f| !f.trashed)
        .map(file_json)
        .collect();
    Json(serde_json::json!({ "files": files }))
}

async fn mock_create(State(mock): State<Mock>, Json(meta): Json<serde_json::Value>) -> Response {
    let mut drive = mock.lock().unwrap();
    let file = drive.insert(
        meta["name"].as_str().unwrap_or_default(),
        meta["mimeType"].as_str().unwrap_or_default(),
        Vec::new(),
        Vec::new(),
    );
    Json(file_json(&file)).into_response()
}

async fn mock_get(
    State(mock): State<Mock>,
    Path(id): Path<String>,
    Query(q): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let drive = mock.lock().unwrap();
    let Some(file) = drive.file(&id) else {
        return google_error(StatusCode::NOT_FOUND, &format!("File not found: {id}"));
    };
    if q.get("alt").map(String::as_str) != Some("media") {
        return Json(file_json(file)).into_response();
    }
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("bytes="))
        .and_then(|v| v.split_once('-'))
        .and_then(|(a, b)| Some((a.parse::<usize>().ok()?, b.parse::<usize>().ok()?)));
    match range {
        Some((a, b)) => (
            StatusCode::PARTIAL_CONTENT,
            file.bytes[a..=b.min(file.bytes.len() - 1)].to_vec(),
        )
            .into_response(),
        None => (StatusCode::OK, file.bytes.clone()).into_response(),
    }
}

async fn mock_trash(State(mock): State<Mock>, Path(id): Path<String>) -> Response {
    let mut drive = mock.lock().unwrap();
    match drive.files.iter_mut().find(|f| f.id == id) {
        Some(f) => {
            f.trashed = true;
            Json(serde_json::json!({ "id": id })).into_response()
        }
        None => google_error(StatusCode::NOT_FOUND, "File not found"),
    }
}

async fn mock_copy(
    State(mock): State<Mock>,
    Path(id): Path<String>,
    Json(meta): Json<serde_json::Value>,
) -> Response {
    let mut drive = mock.lock().unwrap();
    let Some(original) = drive.file(&id).cloned() else {
        return google_error(StatusCode::NOT_FOUND, "File not found");
    };
    let copy = drive.insert(
        meta["name"].as_str().unwrap_or_default(),
        &original.mime_type,
        original.bytes.clone(),
        serde_json::from_value(meta["parents"].clone()).unwrap_or_default(),
    );
    Json(file_json(&copy)).into_response()
}

async fn serve(listener: tokio::net::TcpListener, app: Router) {
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
}

async fn spawn_mock_drive() -> (String, Mock) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let mock: Mock = Arc::new(Mutex::new(MockDrive {
        base: base.clone(),
        ..MockDrive::default()
    }));
    let app = Router::new()
        .route("/token", post(mock_token))
        .route("/upload/drive/v3/files", post(mock_upload))
        .route("/upload/drive/v3/session/{sid}", put(mock_put_session))
        .route("/drive/v3/files", get(mock_list).post(mock_create))
        .route("/drive/v3/files/{id}", get(mock_get).patch(mock_trash))
        .route("/drive/v3/files/{id}/copy", post(mock_copy))
        .with_state(mock.clone());
    serve(listener, app).await;
    (base, mock)
}

fn settings_for(mock_base: &str) -> RelaySettings {
    let mut settings = RelaySettings::default();
    settings.drive.api_base = format!("{mock_base}/drive/v3");
    settings.drive.upload_base = format!("{mock_base}/upload/drive/v3");
    settings.drive.token_url = format!("{mock_base}/token");
    settings
}

fn full_credentials() -> DriveCredentials {
    DriveCredentials {
        client_id: Some("id".to_string()),
        client_secret: Some("secret".to_string()),
        refresh_token: Some("refresh".to_string()),
    }
}

async fn spawn_relay(settings: RelaySettings, credentials: DriveCredentials) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let drive = Arc::new(DriveClient::new(settings.drive.clone(), credentials).unwrap());
    serve(listener, routes::router(AppState::new(drive, settings))).await;
    base
}

async fn relay_with_mock() -> (RelayClient, Mock) {
    let (mock_base, mock) = spawn_mock_drive().await;
    let relay = spawn_relay(settings_for(&mock_base), full_credentials()).await;
    (RelayClient::new(relay), mock)
}

#[derive(Default)]
struct RecordingSink {
    progress: Mutex<Vec<ProgressReport>>,
    finished: Mutex<Vec<TaskReport>>,
    batches: Mutex<Vec<BatchOutcome>>,
}

impl ProgressSink for RecordingSink {
    fn on_progress(&self, progress: &ProgressReport) {
        self.progress.lock().unwrap().push(progress.clone());
    }

    fn on_task_finished(&self, report: &TaskReport) {
        self.finished.lock().unwrap().push(report.clone());
    }

    fn on_batch_finished(&self, outcome: &BatchOutcome) {
        self.batches.lock().unwrap().push(outcome.clone());
    }
}

#[tokio::test]
async fn chunked_upload_through_relay_lands_in_drive() {
    let (client, mock) = relay_with_mock().await;
    let client = Arc::new(client);
    let sink = Arc::new(RecordingSink::default());
    let queue = UploadQueue::new(
        client.clone(),
        UploadLimits {
            chunk_bytes: 4,
            max_file_bytes: 1024,
        },
        client.clone(),
        sink.clone(),
    );

    let report = queue.enqueue(vec![
        UploadTask::from_bytes("digits.txt", Some("text/plain".to_string()), b"0123456789".to_vec()),
        UploadTask::from_bytes("empty.bin", None, Vec::new()),
    ]);
    assert_eq!(report.accepted.len(), 2);
    tokio::time::timeout(Duration::from_secs(10), queue.wait_idle())
        .await
        .unwrap();

    assert_eq!(
        sink.batches.lock().unwrap().clone(),
        vec![BatchOutcome::Succeeded { completed: 2 }]
    );
    let finished = sink.finished.lock().unwrap().clone();
    assert_eq!(finished[0].remote_name, "digits.txt");

    {
        let drive = mock.lock().unwrap();
        let stored = drive.file(&finished[0].file_id).unwrap();
        assert_eq!(stored.bytes, b"0123456789");
        assert_eq!(stored.mime_type, "text/plain");
        let empty = drive.file(&finished[1].file_id).unwrap();
        assert!(empty.bytes.is_empty());
        assert!(drive.sessions.is_empty());
        // One token exchange serves every request.
        assert_eq!(drive.token_calls, 1);
    }

    let files = client.list_files().await.unwrap();
    let digits = files.iter().find(|f| f.name == "digits.txt").unwrap();
    assert_eq!(digits.size_bytes, 10);
    assert_eq!(digits.size, "0.00 MB");
    assert_eq!(digits.owner, "Me");
}

#[tokio::test]
async fn start_upload_requires_a_name() {
    let (client, _mock) = relay_with_mock().await;
    let res = reqwest::Client::new()
        .post(format!("{}/upload/start", client.base_url()))
        .json(&serde_json::json!({ "name": "  ", "size": 1 }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "File name required");
}

#[tokio::test]
async fn missing_credentials_surface_as_configuration_error() {
    let (mock_base, _mock) = spawn_mock_drive().await;
    let relay = spawn_relay(settings_for(&mock_base), DriveCredentials::default()).await;

    let res = reqwest::Client::new()
        .post(format!("{relay}/upload/start"))
        .json(&serde_json::json!({ "name": "a.bin", "size": 1 }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "Server credentials not configured");
    assert_eq!(body["code"], "config.invalid");

    let client = RelayClient::new(relay);
    let err = client.start_upload("a.bin", None, 1).await.unwrap_err();
    assert!(matches!(err, Error::Configuration { .. }));
    assert!(client.list_files().await.unwrap().is_empty());
}

#[tokio::test]
async fn rejected_session_is_a_session_error() {
    let (client, _mock) = relay_with_mock().await;
    let err = client.start_upload("reject-me", None, 5).await.unwrap_err();
    match err {
        Error::Session { message } => {
            assert!(message.contains("Failed to start upload session"), "{message}");
            assert!(message.contains("sufficient permissions"), "{message}");
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn chunk_without_fields_is_rejected() {
    let (client, _mock) = relay_with_mock().await;
    let http = reqwest::Client::new();
    let url = format!("{}/upload/chunk", client.base_url());

    let form = reqwest::multipart::Form::new().text("start", "0");
    let res = http.post(&url).multipart(form).send().await.unwrap();
    assert_eq!(res.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "Missing chunk or uploadUrl");

    let res = http.post(&url).body("not a form").send().await.unwrap();
    assert_eq!(res.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn chunk_to_foreign_url_is_rejected() {
    let (client, _mock) = relay_with_mock().await;
    let err = client
        .upload_chunk(drivedeck_core::ChunkRequest {
            session_url: "http://169.254.169.254/latest".to_string(),
            bytes: vec![1, 2, 3],
            start: 0,
            total: 3,
        })
        .await
        .unwrap_err();
    match err {
        Error::ChunkTransport { status, .. } => assert_eq!(status, Some(400)),
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn remote_chunk_failure_carries_details() {
    let (client, _mock) = relay_with_mock().await;
    let session_url = client.start_upload("fail.bin", None, 3).await.unwrap();
    let err = client
        .upload_chunk(drivedeck_core::ChunkRequest {
            session_url,
            bytes: vec![1, 2, 3],
            start: 0,
            total: 3,
        })
        .await
        .unwrap_err();
    match err {
        Error::ChunkTransport {
            status,
            message,
            body,
        } => {
            assert_eq!(status, Some(500));
            assert_eq!(message, "Chunk upload failed");
            assert_eq!(body, "quota exceeded");
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn folder_names_are_trimmed_and_required() {
    let (client, mock) = relay_with_mock().await;
    let created = client.create_folder("  Photos  ").await.unwrap();
    assert!(created.success);
    assert_eq!(created.name, "Photos");
    {
        let drive = mock.lock().unwrap();
        let folder = drive.file(&created.folder_id).unwrap();
        assert_eq!(folder.mime_type, "application/vnd.google-apps.folder");
    }

    let err = client.create_folder("   ").await.unwrap_err();
    match err {
        Error::Validation { message } => assert_eq!(message, "Folder name is required"),
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn small_upload_trash_and_duplicate() {
    let (client, _mock) = relay_with_mock().await;
    let uploaded = client
        .upload_small("notes.txt", "text/plain", b"hello world".to_vec())
        .await
        .unwrap();
    assert!(uploaded.success);

    let copy = client.duplicate(&uploaded.file_id).await.unwrap();
    assert_eq!(copy.name, "Copy of notes.txt");
    assert_ne!(copy.file_id, uploaded.file_id);

    client.trash(&uploaded.file_id).await.unwrap();
    let names: Vec<_> = client
        .list_files()
        .await
        .unwrap()
        .into_iter()
        .map(|f| f.name)
        .collect();
    assert_eq!(names, vec!["Copy of notes.txt"]);

    let err = client.trash("missing1").await.unwrap_err();
    assert_eq!(err.code(), "remote.not_found");
}

#[tokio::test]
async fn stream_serves_ranges() {
    let (client, _mock) = relay_with_mock().await;
    let uploaded = client
        .upload_small("notes.txt", "text/plain", b"hello world".to_vec())
        .await
        .unwrap();

    let res = client
        .open_stream(&uploaded.file_id, Some((0, Some(4))))
        .await
        .unwrap();
    assert_eq!(res.status(), reqwest::StatusCode::PARTIAL_CONTENT);
    let headers = res.headers().clone();
    assert_eq!(headers[reqwest::header::CONTENT_RANGE], "bytes 0-4/11");
    assert_eq!(headers[reqwest::header::CONTENT_LENGTH], "5");
    assert_eq!(headers[reqwest::header::ACCEPT_RANGES], "bytes");
    assert_eq!(headers[reqwest::header::CACHE_CONTROL], "public, max-age=3600");
    assert_eq!(res.bytes().await.unwrap().as_ref(), b"hello");

    let res = client.open_stream(&uploaded.file_id, Some((6, None))).await.unwrap();
    assert_eq!(res.headers()[reqwest::header::CONTENT_RANGE], "bytes 6-10/11");
    assert_eq!(res.bytes().await.unwrap().as_ref(), b"world");

    let res = client.open_stream(&uploaded.file_id, None).await.unwrap();
    assert_eq!(res.status(), reqwest::StatusCode::OK);
    assert_eq!(res.bytes().await.unwrap().as_ref(), b"hello world");

    let err = client
        .open_stream(&uploaded.file_id, Some((20, None)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation { .. }));

    let err = client.open_stream("nope", None).await.unwrap_err();
    assert_eq!(err.code(), "remote.not_found");
}

#[test]
fn range_header_parsing() {
    let h = |v: &str| HeaderValue::from_str(v).unwrap();

    assert_eq!(parse_range(None, 100).unwrap(), None);
    assert_eq!(parse_range(Some(&h("bytes=0-9")), 100).unwrap(), Some((0, 9)));
    assert_eq!(parse_range(Some(&h("bytes=90-")), 100).unwrap(), Some((90, 99)));
    assert_eq!(parse_range(Some(&h("bytes=90-500")), 100).unwrap(), Some((90, 99)));
    // Unsupported forms fall back to the whole file.
    assert_eq!(parse_range(Some(&h("bytes=-10")), 100).unwrap(), None);
    assert_eq!(parse_range(Some(&h("items=0-1")), 100).unwrap(), None);
    assert!(parse_range(Some(&h("bytes=100-")), 100).is_err());
    assert!(parse_range(Some(&h("bytes=5-2")), 100).is_err());
    assert!(parse_range(Some(&h("bytes=0-")), 0).is_err());
}
