use std::future::Future;
use std::pin::Pin;

use crate::Result;
use crate::task::UploadTask;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Opaque handle for one resumable session. Never reused across tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    pub session_url: String,
}

/// One byte-range slice. `bytes.len()` is the chunk length; `start` its offset.
#[derive(Debug, Clone)]
pub struct ChunkRequest {
    pub session_url: String,
    pub bytes: Vec<u8>,
    pub start: u64,
    pub total: u64,
}

impl ChunkRequest {
    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Exclusive end offset.
    pub fn end(&self) -> u64 {
        self.start + self.len()
    }

    pub fn end_inclusive(&self) -> Option<u64> {
        self.end().checked_sub(1).filter(|_| !self.is_empty())
    }

    pub fn content_range(&self) -> String {
        content_range(self.start, self.len(), self.total)
    }
}

/// `Content-Range` value for a resumable PUT. An empty body finalizes with `bytes */total`.
pub fn content_range(start: u64, len: u64, total: u64) -> String {
    if len == 0 {
        format!("bytes */{total}")
    } else {
        format!("bytes {start}-{}/{total}", start + len - 1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// 308 Resume Incomplete.
    Continue,
    /// 200/201: the remote assembled the file.
    Complete { file_id: String, name: String },
}

pub trait SessionInitiator: Send + Sync {
    fn start_session<'a>(&'a self, task: &'a UploadTask) -> BoxFuture<'a, Result<UploadSession>>;
}

/// Stateless: everything about progress lives with the caller.
pub trait ChunkTransport: Send + Sync {
    fn send_chunk(&self, request: ChunkRequest) -> BoxFuture<'_, Result<ChunkOutcome>>;
}
