use reqwest::multipart::{Form, Part};
use tracing::{debug, info};

use crate::api::{
    self, ChunkStatus, CreateFolderRequest, CreateFolderResponse, DuplicateResponse, ErrorBody,
    FileEntry, FilesResponse, SmallUploadResponse, StartUploadRequest, StartUploadResponse,
    chunk_form,
};
use crate::queue::ListingRefresher;
use crate::task::UploadTask;
use crate::transport::{
    BoxFuture, ChunkOutcome, ChunkRequest, ChunkTransport, SessionInitiator, UploadSession,
};
use crate::{Error, Result};

/// HTTP client for a `drivedeckd` relay. Implements both upload seams so the
/// queue can run against a relay instead of the remote directly.
#[derive(Debug, Clone)]
pub struct RelayClient {
    base_url: String,
    client: reqwest::Client,
}

impl RelayClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, reqwest::Client::new())
    }

    pub fn with_client(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url, client }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn start_upload(
        &self,
        name: &str,
        mime_type: Option<&str>,
        size: u64,
    ) -> Result<String> {
        let res = self
            .client
            .post(self.url(api::PATH_UPLOAD_START))
            .json(&StartUploadRequest {
                name: name.to_string(),
                mime_type: mime_type.map(str::to_string),
                size,
            })
            .send()
            .await
            .map_err(|e| Error::session(format!("request failed: {e}")))?;

        let status = res.status();
        let body = res.text().await?;
        if !status.is_success() {
            let err = parse_error_body(&body);
            return Err(match err.code.as_deref() {
                Some("config.invalid") => Error::configuration(err.error),
                _ => Error::session(join_details(&err)),
            });
        }
        let parsed: StartUploadResponse = serde_json::from_str(&body)?;
        Ok(parsed.upload_url)
    }

    pub async fn upload_chunk(&self, request: ChunkRequest) -> Result<ChunkOutcome> {
        let end = request.end_inclusive().unwrap_or(request.start);
        let form = Form::new()
            .text(chunk_form::UPLOAD_URL, request.session_url.clone())
            .text(chunk_form::START, request.start.to_string())
            .text(chunk_form::END, end.to_string())
            .text(chunk_form::TOTAL, request.total.to_string())
            .part(
                chunk_form::CHUNK,
                Part::bytes(request.bytes).file_name("chunk"),
            );

        let res = self
            .client
            .post(self.url(api::PATH_UPLOAD_CHUNK))
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::ChunkTransport {
                status: None,
                message: format!("request failed: {e}"),
                body: String::new(),
            })?;

        let status = res.status();
        let body = res.text().await?;
        if !status.is_success() {
            let err = parse_error_body(&body);
            return Err(Error::ChunkTransport {
                status: Some(status.as_u16()),
                message: err.error,
                body: err.details.unwrap_or_default(),
            });
        }
        let parsed: ChunkStatus = serde_json::from_str(&body)?;
        Ok(match parsed {
            ChunkStatus::Continue => ChunkOutcome::Continue,
            ChunkStatus::Complete { file_id, name } => ChunkOutcome::Complete { file_id, name },
        })
    }

    pub async fn list_files(&self) -> Result<Vec<FileEntry>> {
        let res = self.client.get(self.url(api::PATH_FILES)).send().await?;
        let body = check_relay(res).await?;
        let parsed: FilesResponse = serde_json::from_str(&body)?;
        Ok(parsed.files)
    }

    pub async fn create_folder(&self, name: &str) -> Result<CreateFolderResponse> {
        let res = self
            .client
            .post(self.url(api::PATH_FOLDERS))
            .json(&CreateFolderRequest {
                name: Some(name.to_string()),
            })
            .send()
            .await?;
        let body = check_relay(res).await?;
        Ok(serde_json::from_str(&body)?)
    }

    pub async fn trash(&self, file_id: &str) -> Result<()> {
        let res = self
            .client
            .patch(format!("{}/{file_id}", self.url(api::PATH_FILES)))
            .send()
            .await?;
        check_relay(res).await?;
        Ok(())
    }

    pub async fn duplicate(&self, file_id: &str) -> Result<DuplicateResponse> {
        let res = self
            .client
            .post(format!("{}/{file_id}", self.url(api::PATH_FILES)))
            .send()
            .await?;
        let body = check_relay(res).await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// One-shot upload through the relay, bypassing the resumable protocol.
    pub async fn upload_small(
        &self,
        name: &str,
        mime_type: &str,
        bytes: Vec<u8>,
    ) -> Result<SmallUploadResponse> {
        let part = Part::bytes(bytes)
            .file_name(name.to_string())
            .mime_str(mime_type)?;
        let form = Form::new().part(api::SMALL_UPLOAD_FIELD, part);
        let res = self
            .client
            .post(self.url(api::PATH_FILES))
            .multipart(form)
            .send()
            .await?;
        let body = check_relay(res).await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// `GET /files/{id}/stream`; the response body is left unread for the caller.
    pub async fn open_stream(
        &self,
        file_id: &str,
        range: Option<(u64, Option<u64>)>,
    ) -> Result<reqwest::Response> {
        let mut req = self
            .client
            .get(format!("{}/{file_id}/stream", self.url(api::PATH_FILES)));
        if let Some((start, end)) = range {
            let end = end.map(|e| e.to_string()).unwrap_or_default();
            req = req.header(reqwest::header::RANGE, format!("bytes={start}-{end}"));
        }
        let res = req.send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(error_from_body(status.as_u16(), &body));
        }
        Ok(res)
    }
}

impl SessionInitiator for RelayClient {
    fn start_session<'a>(&'a self, task: &'a UploadTask) -> BoxFuture<'a, Result<UploadSession>> {
        Box::pin(async move {
            let session_url = self
                .start_upload(task.name(), Some(task.mime_type()), task.size_bytes())
                .await?;
            Ok(UploadSession { session_url })
        })
    }
}

impl ChunkTransport for RelayClient {
    fn send_chunk(&self, request: ChunkRequest) -> BoxFuture<'_, Result<ChunkOutcome>> {
        Box::pin(self.upload_chunk(request))
    }
}

impl ListingRefresher for RelayClient {
    fn refresh(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let files = self.list_files().await?;
            info!(
                event = "listing.refreshed",
                files = files.len(),
                "listing.refreshed"
            );
            Ok(())
        })
    }
}

async fn check_relay(res: reqwest::Response) -> Result<String> {
    let status = res.status();
    let body = res.text().await?;
    if !status.is_success() {
        debug!(
            event = "relay.request_failed",
            status = status.as_u16(),
            body = %body,
            "relay.request_failed"
        );
        return Err(error_from_body(status.as_u16(), &body));
    }
    Ok(body)
}

fn parse_error_body(body: &str) -> ErrorBody {
    serde_json::from_str(body).unwrap_or_else(|_| ErrorBody::new(body.trim()))
}

fn join_details(err: &ErrorBody) -> String {
    match &err.details {
        Some(details) if !details.is_empty() => format!("{}: {details}", err.error),
        _ => err.error.clone(),
    }
}

/// Map a relay error body back onto the shared taxonomy via its `code`.
fn error_from_body(status: u16, body: &str) -> Error {
    let err = parse_error_body(body);
    let message = join_details(&err);
    match err.code.as_deref() {
        Some("config.invalid") => Error::configuration(message),
        Some("request.invalid") => Error::validation(message),
        Some("upload.session_failed") => Error::session(message),
        _ => Error::Remote {
            message,
            status: Some(status),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let c = RelayClient::new("http://127.0.0.1:3000/");
        assert_eq!(c.base_url(), "http://127.0.0.1:3000");
        assert_eq!(c.url("/files"), "http://127.0.0.1:3000/files");
    }

    #[test]
    fn error_codes_map_back_to_variants() {
        let body = r#"{"error":"Server credentials not configured","code":"config.invalid"}"#;
        assert!(matches!(
            error_from_body(500, body),
            Error::Configuration { .. }
        ));

        let body = r#"{"error":"Folder name is required","code":"request.invalid"}"#;
        assert!(matches!(error_from_body(400, body), Error::Validation { .. }));

        let err = error_from_body(404, r#"{"error":"File not found","code":"remote.not_found"}"#);
        assert_eq!(err.code(), "remote.not_found");
    }

    #[test]
    fn non_json_error_body_is_kept_verbatim() {
        let err = error_from_body(502, "bad gateway\n");
        match err {
            Error::Remote { message, status } => {
                assert_eq!(message, "bad gateway");
                assert_eq!(status, Some(502));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn details_are_joined() {
        let err = ErrorBody::new("Chunk upload failed").with_details("quota");
        assert_eq!(join_details(&err), "Chunk upload failed: quota");
        assert_eq!(join_details(&ErrorBody::new("x")), "x");
    }
}
