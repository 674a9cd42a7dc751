use std::fmt;
use std::future::Future;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::api::DEFAULT_MIME_TYPE;
use crate::{Error, Result};

/// Byte source an upload slices chunks from. `end` is exclusive.
pub trait Payload: Send + Sync {
    fn read_range<'a>(
        &'a self,
        start: u64,
        end: u64,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>>> + Send + 'a>>;
}

#[derive(Debug, Clone)]
pub struct BytesPayload {
    bytes: Arc<[u8]>,
}

impl BytesPayload {
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl Payload for BytesPayload {
    fn read_range<'a>(
        &'a self,
        start: u64,
        end: u64,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>>> + Send + 'a>> {
        Box::pin(async move {
            if start > end || end > self.len() {
                return Err(Error::validation(format!(
                    "range {start}..{end} out of bounds for {} bytes",
                    self.len()
                )));
            }
            Ok(self.bytes[start as usize..end as usize].to_vec())
        })
    }
}

#[derive(Debug, Clone)]
pub struct FilePayload {
    path: PathBuf,
}

impl FilePayload {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Payload for FilePayload {
    fn read_range<'a>(
        &'a self,
        start: u64,
        end: u64,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>>> + Send + 'a>> {
        Box::pin(async move {
            if start > end {
                return Err(Error::validation(format!("invalid range {start}..{end}")));
            }
            let mut file = tokio::fs::File::open(&self.path).await?;
            file.seek(SeekFrom::Start(start)).await?;
            let mut buf = vec![0u8; (end - start) as usize];
            file.read_exact(&mut buf).await?;
            Ok(buf)
        })
    }
}

/// One file to upload. Immutable once built; cloning shares the payload.
#[derive(Clone)]
pub struct UploadTask {
    id: String,
    name: String,
    mime_type: String,
    size_bytes: u64,
    payload: Arc<dyn Payload>,
}

impl UploadTask {
    pub fn new(
        name: impl Into<String>,
        mime_type: Option<String>,
        size_bytes: u64,
        payload: Arc<dyn Payload>,
    ) -> Self {
        let mime_type = mime_type
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string());
        Self {
            id: format!("upl_{}", uuid::Uuid::new_v4()),
            name: name.into(),
            mime_type,
            size_bytes,
            payload,
        }
    }

    pub fn from_bytes(name: impl Into<String>, mime_type: Option<String>, bytes: Vec<u8>) -> Self {
        let payload = BytesPayload::new(bytes);
        let size = payload.len();
        Self::new(name, mime_type, size, Arc::new(payload))
    }

    pub async fn from_path(path: impl AsRef<Path>, mime_type: Option<String>) -> Result<Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(Error::validation(format!(
                "not a regular file: {}",
                path.display()
            )));
        }
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::validation(format!("unsupported file name: {path:?}")))?
            .to_string();
        Ok(Self::new(
            name,
            mime_type,
            metadata.len(),
            Arc::new(FilePayload::new(path)),
        ))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub async fn read_range(&self, start: u64, end: u64) -> Result<Vec<u8>> {
        self.payload.read_range(start, end).await
    }
}

impl fmt::Debug for UploadTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadTask")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("mime_type", &self.mime_type)
            .field("size_bytes", &self.size_bytes)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_or_blank_mime_type_defaults_to_octet_stream() {
        let t = UploadTask::from_bytes("a.bin", None, vec![1, 2, 3]);
        assert_eq!(t.mime_type(), "application/octet-stream");
        assert_eq!(t.size_bytes(), 3);

        let t = UploadTask::from_bytes("a.bin", Some(" ".to_string()), vec![]);
        assert_eq!(t.mime_type(), "application/octet-stream");

        let t = UploadTask::from_bytes("a.txt", Some("text/plain".to_string()), vec![]);
        assert_eq!(t.mime_type(), "text/plain");
    }

    #[tokio::test]
    async fn bytes_payload_slices_and_rejects_out_of_bounds() {
        let t = UploadTask::from_bytes("a", None, (0u8..10).collect());
        assert_eq!(t.read_range(2, 5).await.unwrap(), vec![2, 3, 4]);
        assert!(t.read_range(0, 0).await.unwrap().is_empty());
        assert!(matches!(
            t.read_range(5, 11).await,
            Err(Error::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn file_payload_reads_requested_window() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("data.bin");
        std::fs::write(&path, (0u8..=255).collect::<Vec<_>>()).unwrap();

        let t = UploadTask::from_path(&path, None).await.unwrap();
        assert_eq!(t.name(), "data.bin");
        assert_eq!(t.size_bytes(), 256);
        assert_eq!(t.read_range(250, 256).await.unwrap(), vec![250, 251, 252, 253, 254, 255]);
        assert!(t.read_range(250, 300).await.is_err());
    }

    #[tokio::test]
    async fn from_path_rejects_directories() {
        let temp = tempfile::tempdir().unwrap();
        let err = UploadTask::from_path(temp.path(), None).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }
}
