use std::sync::Arc;

use axum::body::Body;
use axum::extract::multipart::MultipartRejection;
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use drivedeck_core::api::{
    self, ChunkStatus, CreateFolderRequest, ErrorBody, FilesResponse, StartUploadRequest,
    StartUploadResponse, SuccessResponse, chunk_form,
};
use drivedeck_core::{
    ChunkOutcome, ChunkRequest, DriveClient, Error, RelaySettings, drive::validate_file_id,
};
use futures_util::TryStreamExt;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Multipart framing overhead allowed on top of the payload limits.
const FORM_OVERHEAD_BYTES: u64 = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    drive: Arc<DriveClient>,
    settings: Arc<RelaySettings>,
}

impl AppState {
    pub fn new(drive: Arc<DriveClient>, settings: RelaySettings) -> Self {
        Self {
            drive,
            settings: Arc::new(settings),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let chunk_limit = body_limit(state.settings.server.max_chunk_request_bytes);
    let small_limit = body_limit(state.settings.server.max_small_upload_bytes);

    Router::new()
        .route(api::PATH_UPLOAD_START, post(start_upload))
        .route(
            api::PATH_UPLOAD_CHUNK,
            post(upload_chunk).layer(DefaultBodyLimit::max(chunk_limit)),
        )
        .route(
            api::PATH_FILES,
            get(list_files)
                .post(upload_small)
                .layer(DefaultBodyLimit::max(small_limit)),
        )
        .route(api::PATH_FOLDERS, post(create_folder))
        .route("/files/{id}", post(duplicate_file).patch(trash_file))
        .route("/files/{id}/stream", get(stream_file))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn body_limit(payload_bytes: u64) -> usize {
    usize::try_from(payload_bytes.saturating_add(FORM_OVERHEAD_BYTES)).unwrap_or(usize::MAX)
}

/// JSON error response: `{error, details?, code}` with a status derived from the error kind.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
    content_range: Option<String>,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: ErrorBody::new(message).with_code("request.invalid"),
            content_range: None,
        }
    }

    fn range_not_satisfiable(size: u64) -> Self {
        Self {
            status: StatusCode::RANGE_NOT_SATISFIABLE,
            body: ErrorBody::new("Range not satisfiable").with_code("request.invalid"),
            content_range: Some(format!("bytes */{size}")),
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let code = err.code();
        let (status, body) = match err {
            Error::Validation { message } => (StatusCode::BAD_REQUEST, ErrorBody::new(message)),
            Error::Configuration { message } => {
                (StatusCode::INTERNAL_SERVER_ERROR, ErrorBody::new(message))
            }
            Error::Session { message } => {
                (StatusCode::INTERNAL_SERVER_ERROR, ErrorBody::new(message))
            }
            Error::ChunkTransport { message, body, .. } => {
                let mut out = ErrorBody::new(message);
                if !body.is_empty() {
                    out = out.with_details(body);
                }
                (StatusCode::INTERNAL_SERVER_ERROR, out)
            }
            Error::Remote {
                message,
                status: Some(404),
            } => (StatusCode::NOT_FOUND, ErrorBody::new(message)),
            other => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody::new(other.to_string()),
            ),
        };
        Self {
            status,
            body: body.with_code(code),
            content_range: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!(
                event = "relay.request_failed",
                status = self.status.as_u16(),
                error = %self.body.error,
                details = self.body.details.as_deref().unwrap_or(""),
                "relay.request_failed"
            );
        }
        let mut headers = HeaderMap::new();
        if let Some(value) = self
            .content_range
            .as_deref()
            .and_then(|v| HeaderValue::from_str(v).ok())
        {
            headers.insert(header::CONTENT_RANGE, value);
        }
        (self.status, headers, Json(self.body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

async fn start_upload(
    State(state): State<AppState>,
    payload: Result<Json<StartUploadRequest>, JsonRejection>,
) -> ApiResult<Json<StartUploadResponse>> {
    let Json(req) = payload.map_err(|e| ApiError::bad_request(e.body_text()))?;
    if req.name.trim().is_empty() {
        return Err(ApiError::bad_request("File name required"));
    }
    if req.size > state.settings.upload.max_file_bytes {
        return Err(ApiError::bad_request(format!(
            "File exceeds the {} byte limit",
            state.settings.upload.max_file_bytes
        )));
    }
    let mime_type = req
        .mime_type
        .as_deref()
        .filter(|m| !m.trim().is_empty())
        .unwrap_or(api::DEFAULT_MIME_TYPE);

    let upload_url = state
        .drive
        .start_resumable_session(&req.name, mime_type, req.size)
        .await?;
    info!(
        event = "relay.upload_started",
        file = %req.name,
        size_bytes = req.size,
        "relay.upload_started"
    );
    Ok(Json(StartUploadResponse { upload_url }))
}

#[derive(Default)]
struct ChunkForm {
    chunk: Option<Vec<u8>>,
    upload_url: Option<String>,
    start: Option<String>,
    end: Option<String>,
    total: Option<String>,
}

async fn read_chunk_form(mut multipart: Multipart) -> ApiResult<ChunkForm> {
    let mut form = ChunkForm::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            chunk_form::CHUNK => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request(e.body_text()))?;
                form.chunk = Some(bytes.to_vec());
            }
            chunk_form::UPLOAD_URL | chunk_form::START | chunk_form::END | chunk_form::TOTAL => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request(e.body_text()))?;
                let slot = match name.as_str() {
                    chunk_form::UPLOAD_URL => &mut form.upload_url,
                    chunk_form::START => &mut form.start,
                    chunk_form::END => &mut form.end,
                    _ => &mut form.total,
                };
                *slot = Some(text);
            }
            _ => {}
        }
    }
    Ok(form)
}

fn parse_offset(field: &str, value: Option<&str>) -> ApiResult<u64> {
    value
        .map(str::trim)
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(|| ApiError::bad_request(format!("Invalid {field}")))
}

async fn upload_chunk(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<Json<ChunkStatus>> {
    let multipart = multipart.map_err(|_| ApiError::bad_request("Missing chunk or uploadUrl"))?;
    let form = read_chunk_form(multipart).await?;
    let (Some(bytes), Some(session_url)) = (form.chunk, form.upload_url) else {
        return Err(ApiError::bad_request("Missing chunk or uploadUrl"));
    };

    // The relay only ever PUTs to sessions the remote handed out.
    if !session_url.starts_with(&state.settings.drive.upload_base) {
        return Err(ApiError::bad_request("uploadUrl is not a resumable session"));
    }

    let start = parse_offset(chunk_form::START, form.start.as_deref())?;
    let total = parse_offset(chunk_form::TOTAL, form.total.as_deref())?;
    let request = ChunkRequest {
        session_url,
        bytes,
        start,
        total,
    };
    if request.end() > total {
        return Err(ApiError::bad_request("Chunk extends past total"));
    }
    if let (Some(end), Some(expected)) = (form.end.as_deref(), request.end_inclusive())
        && parse_offset(chunk_form::END, Some(end))? != expected
    {
        return Err(ApiError::bad_request("Chunk length does not match start/end"));
    }

    let outcome = state.drive.put_chunk(request).await?;
    Ok(Json(match outcome {
        ChunkOutcome::Continue => ChunkStatus::Continue,
        ChunkOutcome::Complete { file_id, name } => {
            info!(
                event = "relay.upload_completed",
                file_id = %file_id,
                file = %name,
                "relay.upload_completed"
            );
            ChunkStatus::Complete { file_id, name }
        }
    }))
}

async fn list_files(State(state): State<AppState>) -> ApiResult<Json<FilesResponse>> {
    let files = state.drive.list_files().await?;
    Ok(Json(FilesResponse { files }))
}

async fn upload_small(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<Response> {
    let mut multipart = multipart.map_err(|_| ApiError::bad_request("No file uploaded"))?;
    let limit = state.settings.server.max_small_upload_bytes;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(e.body_text()))?
    {
        if field.name() != Some(api::SMALL_UPLOAD_FIELD) {
            continue;
        }
        let name = field.file_name().unwrap_or_default().to_string();
        let mime_type = field
            .content_type()
            .unwrap_or(api::DEFAULT_MIME_TYPE)
            .to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(e.body_text()))?;
        if bytes.len() as u64 > limit {
            return Err(ApiError::bad_request(format!(
                "File exceeds the {limit} byte small-upload limit"
            )));
        }
        let res = state
            .drive
            .upload_small(&name, &mime_type, bytes.to_vec())
            .await?;
        info!(
            event = "relay.small_upload_completed",
            file = %name,
            file_id = %res.file_id,
            "relay.small_upload_completed"
        );
        return Ok(Json(res).into_response());
    }
    Err(ApiError::bad_request("No file uploaded"))
}

async fn create_folder(
    State(state): State<AppState>,
    payload: Result<Json<CreateFolderRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(req) = payload.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let name = req.name.unwrap_or_default();
    let res = state.drive.create_folder(&name).await?;
    Ok(Json(res).into_response())
}

async fn trash_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<SuccessResponse>> {
    state.drive.trash(&id).await?;
    info!(event = "relay.trashed", file_id = %id, "relay.trashed");
    Ok(Json(SuccessResponse { success: true }))
}

async fn duplicate_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let res = state.drive.duplicate(&id).await?;
    Ok(Json(res).into_response())
}

async fn stream_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    validate_file_id(&id)?;
    let info = state.drive.media_info(&id).await?;
    let size = info.size_bytes;
    let range = parse_range(headers.get(header::RANGE), size)?;

    let upstream = state.drive.open_media(&id, range).await?;

    let mut out = HeaderMap::new();
    out.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&info.mime_type)
            .unwrap_or_else(|_| HeaderValue::from_static(api::DEFAULT_MIME_TYPE)),
    );
    out.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    out.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=3600"),
    );

    let status = match range {
        Some((start, end)) => {
            out.insert(
                header::CONTENT_RANGE,
                header_value(&format!("bytes {start}-{end}/{size}"))?,
            );
            out.insert(
                header::CONTENT_LENGTH,
                header_value(&(end - start + 1).to_string())?,
            );
            StatusCode::PARTIAL_CONTENT
        }
        None => {
            out.insert(header::CONTENT_LENGTH, header_value(&size.to_string())?);
            StatusCode::OK
        }
    };

    let file_id = id.clone();
    let stream = upstream.bytes_stream().inspect_err(move |e| {
        warn!(
            event = "relay.stream_aborted",
            file_id = %file_id,
            error = %e,
            "relay.stream_aborted"
        );
    });
    Ok((status, out, Body::from_stream(stream)).into_response())
}

fn header_value(value: &str) -> ApiResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|_| ApiError::from(Error::remote("failed to build response header")))
}

/// `bytes=a-b` or `bytes=a-`. Anything else is ignored and the whole file is served.
pub fn parse_range(value: Option<&HeaderValue>, size: u64) -> ApiResult<Option<(u64, u64)>> {
    let Some(spec) = value
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().strip_prefix("bytes="))
    else {
        return Ok(None);
    };
    let Some((start, end)) = spec.split_once('-') else {
        return Ok(None);
    };
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if !digits(start) || !(end.is_empty() || digits(end)) {
        return Ok(None);
    }

    let (Ok(start), Ok(end)) = (
        start.parse::<u64>(),
        if end.is_empty() {
            Ok(size.saturating_sub(1))
        } else {
            end.parse::<u64>()
        },
    ) else {
        return Err(ApiError::range_not_satisfiable(size));
    };
    if size == 0 || start >= size || start > end {
        return Err(ApiError::range_not_satisfiable(size));
    }
    Ok(Some((start, end.min(size - 1))))
}
