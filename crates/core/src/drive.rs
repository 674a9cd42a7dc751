use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::api::{
    CreateFolderResponse, DuplicateResponse, FOLDER_MIME_TYPE, FileEntry, SmallUploadResponse,
};
use crate::config::{DriveCredentials, DriveSettings};
use crate::task::UploadTask;
use crate::transport::{
    BoxFuture, ChunkOutcome, ChunkRequest, ChunkTransport, SessionInitiator, UploadSession,
};
use crate::{Error, Result};

const LIST_FIELDS: &str =
    "files(id, name, mimeType, modifiedTime, size, owners, webViewLink, iconLink)";
const TOKEN_EXPIRY_SLACK: Duration = Duration::from_secs(60);
const STATUS_RESUME_INCOMPLETE: u16 = 308;

#[derive(Debug)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

/// Google Drive v3 client: the remote side of every relay endpoint.
pub struct DriveClient {
    settings: DriveSettings,
    credentials: DriveCredentials,
    client: reqwest::Client,
    token: Mutex<Option<CachedToken>>,
}

/// Remote metadata needed to serve a media stream.
#[derive(Debug, Clone)]
pub struct MediaInfo {
    pub name: String,
    pub mime_type: String,
    pub size_bytes: u64,
}

impl DriveClient {
    pub fn new(settings: DriveSettings, credentials: DriveCredentials) -> Result<Self> {
        // Redirects would swallow the 308 that drives the resumable protocol.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            settings,
            credentials,
            client,
            token: Mutex::new(None),
        })
    }

    pub fn settings(&self) -> &DriveSettings {
        &self.settings
    }

    pub fn has_client_id(&self) -> bool {
        self.credentials.client_id.is_some()
    }

    fn parents(&self) -> Vec<String> {
        self.settings.folder_id.iter().cloned().collect()
    }

    async fn access_token(&self) -> Result<String> {
        let (Some(client_id), Some(client_secret), Some(refresh_token)) = (
            self.credentials.client_id.as_deref(),
            self.credentials.client_secret.as_deref(),
            self.credentials.refresh_token.as_deref(),
        ) else {
            return Err(Error::configuration("Server credentials not configured"));
        };

        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref()
            && token.expires_at > Instant::now() + TOKEN_EXPIRY_SLACK
        {
            return Ok(token.access_token.clone());
        }

        let res = self
            .client
            .post(&self.settings.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", client_id),
                ("client_secret", client_secret),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await?;
        let status = res.status();
        let body = res.text().await?;
        if !status.is_success() {
            return Err(Error::Remote {
                message: format!("token refresh failed: http {status}: {body}"),
                status: Some(status.as_u16()),
            });
        }
        let parsed: TokenResponse = serde_json::from_str(&body)?;
        let expires_at = Instant::now() + Duration::from_secs(parsed.expires_in.unwrap_or(3600));
        debug!(event = "drive.token_refreshed", "drive.token_refreshed");
        *cached = Some(CachedToken {
            access_token: parsed.access_token.clone(),
            expires_at,
        });
        Ok(parsed.access_token)
    }

    /// Open a resumable session; returns the session URL from `Location`.
    pub async fn start_resumable_session(
        &self,
        name: &str,
        mime_type: &str,
        size_bytes: u64,
    ) -> Result<String> {
        if name.trim().is_empty() {
            return Err(Error::session("File name required"));
        }
        let token = self.access_token().await.map_err(|e| match e {
            Error::Remote { message, .. } => Error::session(message),
            other => other,
        })?;

        let res = self
            .client
            .post(format!("{}/files", self.settings.upload_base))
            .query(&[("uploadType", "resumable")])
            .bearer_auth(token)
            .header("X-Upload-Content-Type", mime_type)
            .header("X-Upload-Content-Length", size_bytes.to_string())
            .json(&serde_json::json!({
                "name": name,
                "parents": self.parents(),
            }))
            .send()
            .await
            .map_err(|e| Error::session(format!("request failed: {e}")))?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            error!(
                event = "drive.resumable_init_failed",
                status = status.as_u16(),
                body = %body,
                "drive.resumable_init_failed"
            );
            return Err(Error::session(format!(
                "Failed to start upload session: http {status}: {}",
                remote_error_message(&body)
            )));
        }

        res.headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| Error::session("No upload URL returned"))
    }

    /// PUT one byte range to a session URL. 308 continues, 2xx completes.
    pub async fn put_chunk(&self, request: ChunkRequest) -> Result<ChunkOutcome> {
        let content_range = request.content_range();
        let len = request.len();
        let res = self
            .client
            .put(&request.session_url)
            .header(reqwest::header::CONTENT_LENGTH, len.to_string())
            .header(reqwest::header::CONTENT_RANGE, &content_range)
            .body(request.bytes)
            .send()
            .await
            .map_err(|e| Error::ChunkTransport {
                status: None,
                message: format!("request failed: {e}"),
                body: String::new(),
            })?;

        let status = res.status();
        if status.as_u16() == STATUS_RESUME_INCOMPLETE {
            return Ok(ChunkOutcome::Continue);
        }

        let body = res.text().await.unwrap_or_default();
        if status.is_success() {
            let file: DriveFile = serde_json::from_str(&body).map_err(|e| Error::ChunkTransport {
                status: Some(status.as_u16()),
                message: format!("invalid completion body: {e}"),
                body: body.clone(),
            })?;
            return Ok(ChunkOutcome::Complete {
                file_id: file.id,
                name: file.name.unwrap_or_default(),
            });
        }

        error!(
            event = "drive.chunk_failed",
            status = status.as_u16(),
            content_range = %content_range,
            body = %body,
            "drive.chunk_failed"
        );
        Err(Error::ChunkTransport {
            status: Some(status.as_u16()),
            message: "Chunk upload failed".to_string(),
            body,
        })
    }

    /// Files in the destination folder, folders first, newest first.
    ///
    /// Without a client id the listing is empty rather than an error.
    pub async fn list_files(&self) -> Result<Vec<FileEntry>> {
        if !self.has_client_id() {
            return Ok(Vec::new());
        }
        let token = self.access_token().await?;
        let query = match &self.settings.folder_id {
            Some(folder) => format!("'{folder}' in parents and trashed = false"),
            None => "trashed = false".to_string(),
        };
        let res = self
            .client
            .get(format!("{}/files", self.settings.api_base))
            .bearer_auth(token)
            .query(&[
                ("q", query.as_str()),
                ("fields", LIST_FIELDS),
                ("orderBy", "folder, modifiedTime desc"),
                ("pageSize", &self.settings.page_size.to_string()),
            ])
            .send()
            .await?;
        let body = check_remote(res, "list").await?;
        let parsed: DriveFileList = serde_json::from_str(&body)?;
        Ok(parsed.files.into_iter().map(format_listing_entry).collect())
    }

    pub async fn create_folder(&self, name: &str) -> Result<CreateFolderResponse> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::validation("Folder name is required"));
        }
        let token = self.access_token().await?;
        let res = self
            .client
            .post(format!("{}/files", self.settings.api_base))
            .bearer_auth(token)
            .query(&[("fields", "id, name, webViewLink")])
            .json(&serde_json::json!({
                "name": name,
                "mimeType": FOLDER_MIME_TYPE,
                "parents": self.parents(),
            }))
            .send()
            .await?;
        let body = check_remote(res, "create folder").await?;
        let file: DriveFile = serde_json::from_str(&body)?;
        Ok(CreateFolderResponse {
            success: true,
            folder_id: file.id,
            name: file.name.unwrap_or_else(|| name.to_string()),
            link: file.web_view_link,
        })
    }

    pub async fn trash(&self, file_id: &str) -> Result<()> {
        validate_file_id(file_id)?;
        let token = self.access_token().await?;
        let res = self
            .client
            .patch(format!("{}/files/{file_id}", self.settings.api_base))
            .bearer_auth(token)
            .json(&serde_json::json!({ "trashed": true }))
            .send()
            .await?;
        check_remote(res, "trash").await?;
        Ok(())
    }

    /// Copy into the same parents as `Copy of <name>`.
    pub async fn duplicate(&self, file_id: &str) -> Result<DuplicateResponse> {
        validate_file_id(file_id)?;
        let token = self.access_token().await?;

        let res = self
            .client
            .get(format!("{}/files/{file_id}", self.settings.api_base))
            .bearer_auth(&token)
            .query(&[("fields", "name, parents")])
            .send()
            .await?;
        let body = check_remote(res, "duplicate lookup").await?;
        let original: DriveFile = serde_json::from_str(&body)?;

        let res = self
            .client
            .post(format!("{}/files/{file_id}/copy", self.settings.api_base))
            .bearer_auth(&token)
            .query(&[("fields", "id, name, webViewLink")])
            .json(&serde_json::json!({
                "name": format!("Copy of {}", original.name.unwrap_or_default()),
                "parents": original.parents.unwrap_or_default(),
            }))
            .send()
            .await?;
        let body = check_remote(res, "duplicate").await?;
        let copy: DriveFile = serde_json::from_str(&body)?;
        Ok(DuplicateResponse {
            success: true,
            file_id: copy.id,
            name: copy.name.unwrap_or_default(),
            link: copy.web_view_link,
        })
    }

    /// Single-request upload for small files (`multipart/related`).
    pub async fn upload_small(
        &self,
        name: &str,
        mime_type: &str,
        bytes: Vec<u8>,
    ) -> Result<SmallUploadResponse> {
        if name.trim().is_empty() {
            return Err(Error::validation("No file uploaded"));
        }
        let token = self.access_token().await?;
        let boundary = format!("drivedeck-{}", uuid::Uuid::new_v4().simple());
        let metadata = serde_json::json!({ "name": name, "parents": self.parents() });
        let body = multipart_related_body(&boundary, &metadata, mime_type, &bytes);

        let res = self
            .client
            .post(format!("{}/files", self.settings.upload_base))
            .bearer_auth(token)
            .query(&[
                ("uploadType", "multipart"),
                ("fields", "id, name, webViewLink, iconLink, webContentLink"),
            ])
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={boundary}"),
            )
            .body(body)
            .send()
            .await?;
        let body = check_remote(res, "upload").await?;
        let file: DriveFile = serde_json::from_str(&body)?;
        Ok(SmallUploadResponse {
            success: true,
            file_id: file.id,
            link: file.web_view_link,
        })
    }

    pub async fn media_info(&self, file_id: &str) -> Result<MediaInfo> {
        validate_file_id(file_id)?;
        let token = self.access_token().await?;
        let res = self
            .client
            .get(format!("{}/files/{file_id}", self.settings.api_base))
            .bearer_auth(token)
            .query(&[("fields", "name, mimeType, size")])
            .send()
            .await?;
        let body = check_remote(res, "metadata").await?;
        let file: DriveFile = serde_json::from_str(&body)?;
        Ok(MediaInfo {
            name: file.name.unwrap_or_default(),
            mime_type: file
                .mime_type
                .unwrap_or_else(|| crate::api::DEFAULT_MIME_TYPE.to_string()),
            size_bytes: parse_size(file.size.as_deref()),
        })
    }

    /// Start downloading content; `range` is an inclusive byte window.
    pub async fn open_media(
        &self,
        file_id: &str,
        range: Option<(u64, u64)>,
    ) -> Result<reqwest::Response> {
        validate_file_id(file_id)?;
        let token = self.access_token().await?;
        let mut req = self
            .client
            .get(format!("{}/files/{file_id}", self.settings.api_base))
            .bearer_auth(token)
            .query(&[("alt", "media")]);
        if let Some((start, end)) = range {
            req = req.header(reqwest::header::RANGE, format!("bytes={start}-{end}"));
        }
        let res = req.send().await?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(Error::Remote {
                message: format!("media: http {status}: {}", remote_error_message(&body)),
                status: Some(status.as_u16()),
            });
        }
        Ok(res)
    }
}

impl SessionInitiator for DriveClient {
    fn start_session<'a>(&'a self, task: &'a UploadTask) -> BoxFuture<'a, Result<UploadSession>> {
        Box::pin(async move {
            let session_url = self
                .start_resumable_session(task.name(), task.mime_type(), task.size_bytes())
                .await?;
            Ok(UploadSession { session_url })
        })
    }
}

impl ChunkTransport for DriveClient {
    fn send_chunk(&self, request: ChunkRequest) -> BoxFuture<'_, Result<ChunkOutcome>> {
        Box::pin(self.put_chunk(request))
    }
}

/// Drive ids are URL-safe base64-ish tokens; anything else never reaches the remote.
pub fn validate_file_id(file_id: &str) -> Result<()> {
    let ok = !file_id.is_empty()
        && file_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(Error::validation(format!("invalid file id: {file_id:?}")))
    }
}

async fn check_remote(res: reqwest::Response, what: &str) -> Result<String> {
    let status = res.status();
    let body = res.text().await?;
    if !status.is_success() {
        error!(
            event = "drive.request_failed",
            op = what,
            status = status.as_u16(),
            body = %body,
            "drive.request_failed"
        );
        return Err(Error::Remote {
            message: format!("{what}: http {status}: {}", remote_error_message(&body)),
            status: Some(status.as_u16()),
        });
    }
    Ok(body)
}

/// Google wraps errors as `{"error": {"message": ...}}`; fall back to the raw body.
fn remote_error_message(body: &str) -> String {
    serde_json::from_str::<GoogleErrorEnvelope>(body)
        .ok()
        .and_then(|e| e.error.message)
        .unwrap_or_else(|| body.trim().to_string())
}

fn parse_size(size: Option<&str>) -> u64 {
    size.and_then(|s| s.parse::<u64>().ok()).unwrap_or(0)
}

fn format_listing_entry(file: DriveFile) -> FileEntry {
    let size_bytes = parse_size(file.size.as_deref());
    let size = match file.size.as_deref().and_then(|s| s.parse::<u64>().ok()) {
        Some(bytes) => format!("{:.2} MB", bytes as f64 / 1024.0 / 1024.0),
        None => "-".to_string(),
    };
    let modified = file
        .modified_time
        .as_deref()
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Local).format("%-m/%-d/%Y").to_string())
        .unwrap_or_else(|| "-".to_string());
    let owner = file
        .owners
        .unwrap_or_default()
        .into_iter()
        .next()
        .and_then(|o| o.display_name)
        .unwrap_or_else(|| "Me".to_string());

    FileEntry {
        id: file.id,
        name: file.name.unwrap_or_default(),
        mime_type: file.mime_type.unwrap_or_default(),
        owner,
        modified,
        size,
        size_bytes,
        link: file.web_view_link,
        icon: file.icon_link,
    }
}

fn multipart_related_body(
    boundary: &str,
    metadata: &serde_json::Value,
    mime_type: &str,
    bytes: &[u8],
) -> Vec<u8> {
    let mut body = Vec::with_capacity(bytes.len() + 512);
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{metadata}\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(format!("--{boundary}\r\nContent-Type: {mime_type}\r\n\r\n").as_bytes());
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct DriveFileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    #[serde(default)]
    id: String,
    name: Option<String>,
    mime_type: Option<String>,
    modified_time: Option<String>,
    size: Option<String>,
    owners: Option<Vec<DriveOwner>>,
    parents: Option<Vec<String>>,
    web_view_link: Option<String>,
    icon_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveOwner {
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GoogleErrorEnvelope {
    error: GoogleError,
}

#[derive(Debug, Deserialize)]
struct GoogleError {
    message: Option<String>,
}
