use std::future::Future;
use std::ops::Range;
use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::progress::TransferState;
use crate::task::UploadTask;
use crate::transport::{ChunkOutcome, ChunkRequest, ChunkTransport, SessionInitiator};
use crate::{Error, Result};

/// Scope of one queue-processing run. Created when the run starts, dropped when it ends.
#[derive(Debug, Clone)]
pub struct UploadContext {
    run_id: String,
    cancel: CancellationToken,
}

impl UploadContext {
    pub fn new() -> Self {
        Self::with_token(CancellationToken::new())
    }

    pub fn with_token(cancel: CancellationToken) -> Self {
        Self {
            run_id: format!("run_{}", uuid::Uuid::new_v4()),
            cancel,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Race `fut` against cancellation. Losing the race drops (aborts) the request.
    pub async fn guard<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            res = fut => res,
        }
    }
}

impl Default for UploadContext {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverPhase {
    Initiating,
    Transferring,
    Completed,
    Cancelled,
    Failed,
}

impl DriverPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initiating => "initiating",
            Self::Transferring => "transferring",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverOutcome {
    Completed {
        file_id: String,
        name: String,
        chunks_sent: u64,
    },
    Cancelled,
}

pub trait DriverObserver: Send + Sync {
    fn on_phase(&self, _task: &UploadTask, _phase: DriverPhase) {}

    fn on_transfer(&self, _task: &UploadTask, _state: &TransferState) {}
}

pub struct NoopObserver;

impl DriverObserver for NoopObserver {}

/// `[start, end)` windows covering `[0, size)` in order. Empty for a zero-byte file.
#[derive(Debug, Clone)]
pub struct ChunkWindows {
    next: u64,
    size: u64,
    chunk: u64,
}

pub fn chunk_windows(size_bytes: u64, chunk_bytes: u64) -> ChunkWindows {
    ChunkWindows {
        next: 0,
        size: size_bytes,
        chunk: chunk_bytes.max(1),
    }
}

impl Iterator for ChunkWindows {
    type Item = Range<u64>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.size {
            return None;
        }
        let start = self.next;
        let end = start.saturating_add(self.chunk).min(self.size);
        self.next = end;
        Some(start..end)
    }
}

impl ChunkWindows {
    pub fn count_hint(&self) -> u64 {
        (self.size - self.next).div_ceil(self.chunk)
    }
}

/// Drives one task: one session, then sequential chunks until the remote says complete.
pub struct UploadDriver<T> {
    transport: Arc<T>,
    chunk_bytes: u64,
}

impl<T> UploadDriver<T>
where
    T: SessionInitiator + ChunkTransport,
{
    pub fn new(transport: Arc<T>, chunk_bytes: u64) -> Self {
        Self {
            transport,
            chunk_bytes: chunk_bytes.max(1),
        }
    }

    pub fn chunk_bytes(&self) -> u64 {
        self.chunk_bytes
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub async fn run(
        &self,
        task: &UploadTask,
        ctx: &UploadContext,
        observer: &dyn DriverObserver,
    ) -> Result<DriverOutcome> {
        let res = self.run_inner(task, ctx, observer).await;
        let phase = match &res {
            Ok(DriverOutcome::Completed { .. }) => DriverPhase::Completed,
            Ok(DriverOutcome::Cancelled) | Err(Error::Cancelled) => DriverPhase::Cancelled,
            Err(_) => DriverPhase::Failed,
        };
        observer.on_phase(task, phase);

        match res {
            Err(Error::Cancelled) => {
                info!(
                    event = "upload.cancelled",
                    run_id = ctx.run_id(),
                    task_id = task.id(),
                    file = task.name(),
                    "upload.cancelled"
                );
                Ok(DriverOutcome::Cancelled)
            }
            Err(e) => {
                warn!(
                    event = "upload.failed",
                    run_id = ctx.run_id(),
                    task_id = task.id(),
                    file = task.name(),
                    code = e.code(),
                    error = %e,
                    "upload.failed"
                );
                Err(e)
            }
            Ok(outcome) => Ok(outcome),
        }
    }

    async fn run_inner(
        &self,
        task: &UploadTask,
        ctx: &UploadContext,
        observer: &dyn DriverObserver,
    ) -> Result<DriverOutcome> {
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }

        observer.on_phase(task, DriverPhase::Initiating);
        let session = ctx.guard(self.transport.start_session(task)).await?;
        debug!(
            event = "upload.session_started",
            run_id = ctx.run_id(),
            task_id = task.id(),
            file = task.name(),
            size_bytes = task.size_bytes(),
            "upload.session_started"
        );

        observer.on_phase(task, DriverPhase::Transferring);
        let size = task.size_bytes();
        let mut state = TransferState::new(size, Instant::now());
        observer.on_transfer(task, &state);

        // A zero-byte file still needs one (empty) PUT to finalize the session.
        let windows: Vec<Range<u64>> = if size == 0 {
            vec![0..0]
        } else {
            chunk_windows(size, self.chunk_bytes).collect()
        };

        for window in windows {
            let bytes = task.read_range(window.start, window.end).await?;
            let request = ChunkRequest {
                session_url: session.session_url.clone(),
                bytes,
                start: window.start,
                total: size,
            };

            let outcome = ctx.guard(self.transport.send_chunk(request)).await?;
            state.acknowledge(window.end, Instant::now());
            debug!(
                event = "upload.chunk_acked",
                run_id = ctx.run_id(),
                task_id = task.id(),
                start = window.start,
                end = window.end,
                total = size,
                percent = state.percent,
                "upload.chunk_acked"
            );
            observer.on_transfer(task, &state);

            match outcome {
                ChunkOutcome::Continue => {}
                ChunkOutcome::Complete { file_id, name } => {
                    if window.end < size {
                        warn!(
                            event = "upload.completed_early",
                            task_id = task.id(),
                            offset = window.end,
                            total = size,
                            "upload.completed_early"
                        );
                    }
                    info!(
                        event = "upload.completed",
                        run_id = ctx.run_id(),
                        task_id = task.id(),
                        file = task.name(),
                        file_id = %file_id,
                        chunks = state.chunks_acked,
                        "upload.completed"
                    );
                    return Ok(DriverOutcome::Completed {
                        file_id,
                        name,
                        chunks_sent: state.chunks_acked,
                    });
                }
            }
        }

        // Every byte was accepted yet the last PUT still answered "continue".
        Err(Error::ChunkTransport {
            status: Some(308),
            message: "remote never confirmed completion".to_string(),
            body: String::new(),
        })
    }
}
