use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::UploadLimits;
use crate::driver::{DriverObserver, DriverOutcome, DriverPhase, UploadContext, UploadDriver};
use crate::progress::{BatchOutcome, ProgressReport, ProgressSink, TaskReport, TransferState};
use crate::task::UploadTask;
use crate::transport::{BoxFuture, ChunkTransport, SessionInitiator};
use crate::{Error, Result};

/// The file-listing collaborator, asked to refresh after every completed file.
pub trait ListingRefresher: Send + Sync {
    fn refresh(&self) -> BoxFuture<'_, Result<()>>;
}

pub struct NoopRefresher;

impl ListingRefresher for NoopRefresher {
    fn refresh(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedFile {
    pub name: String,
    pub size_bytes: u64,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueReport {
    pub accepted: Vec<String>,
    pub skipped: Vec<SkippedFile>,
    pub started_run: bool,
}

struct ActiveRun {
    context: UploadContext,
    completed: u64,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<UploadTask>,
    run: Option<ActiveRun>,
}

struct QueueInner<T> {
    driver: UploadDriver<T>,
    limits: UploadLimits,
    refresher: Arc<dyn ListingRefresher>,
    sink: Arc<dyn ProgressSink>,
    state: Mutex<QueueState>,
    idle: watch::Sender<bool>,
}

impl<T> QueueInner<T> {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// FIFO of upload tasks, processed one at a time through a single driver.
pub struct UploadQueue<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> Clone for UploadQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> UploadQueue<T>
where
    T: SessionInitiator + ChunkTransport + 'static,
{
    pub fn new(
        transport: Arc<T>,
        limits: UploadLimits,
        refresher: Arc<dyn ListingRefresher>,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        let (idle, _) = watch::channel(true);
        Self {
            inner: Arc::new(QueueInner {
                driver: UploadDriver::new(transport, limits.chunk_bytes),
                limits,
                refresher,
                sink,
                state: Mutex::new(QueueState::default()),
                idle,
            }),
        }
    }

    /// Append to the tail, rejecting oversized files. Starts a run when idle.
    ///
    /// Must be called from within a tokio runtime.
    pub fn enqueue(&self, tasks: Vec<UploadTask>) -> EnqueueReport {
        let mut report = EnqueueReport::default();
        let mut accepted = Vec::new();

        for task in tasks {
            if let Err(e) = self.check(&task) {
                warn!(
                    event = "queue.skipped",
                    file = task.name(),
                    size_bytes = task.size_bytes(),
                    error = %e,
                    "queue.skipped"
                );
                report.skipped.push(SkippedFile {
                    name: task.name().to_string(),
                    size_bytes: task.size_bytes(),
                    reason: match e {
                        Error::Validation { message } => message,
                        other => other.to_string(),
                    },
                });
                continue;
            }
            report.accepted.push(task.name().to_string());
            accepted.push(task);
        }

        if accepted.is_empty() {
            return report;
        }

        let start = {
            let mut st = self.inner.lock();
            st.pending.extend(accepted);
            if st.run.is_none() {
                let context = UploadContext::new();
                st.run = Some(ActiveRun {
                    context: context.clone(),
                    completed: 0,
                });
                self.inner.idle.send_replace(false);
                Some(context)
            } else {
                None
            }
        };

        if let Some(context) = start {
            report.started_run = true;
            info!(
                event = "queue.run_started",
                run_id = context.run_id(),
                "queue.run_started"
            );
            let inner = self.inner.clone();
            tokio::spawn(process_run(inner, context));
        }
        report
    }

    fn check(&self, task: &UploadTask) -> Result<()> {
        if task.name().trim().is_empty() {
            return Err(Error::validation("file name is required"));
        }
        if task.size_bytes() > self.inner.limits.max_file_bytes {
            return Err(Error::validation(format!(
                "file exceeds the {} byte limit ({} bytes)",
                self.inner.limits.max_file_bytes,
                task.size_bytes()
            )));
        }
        Ok(())
    }

    /// Signal the active run. Returns false when nothing is running.
    pub fn cancel(&self) -> bool {
        let st = self.inner.lock();
        match &st.run {
            Some(run) => {
                run.context.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().run.is_some()
    }

    /// Tasks not yet finished, including the one in flight.
    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub async fn wait_idle(&self) {
        let mut rx = self.inner.idle.subscribe();
        let _ = rx.wait_for(|idle| *idle).await;
    }
}

struct BatchObserver<'a> {
    sink: &'a dyn ProgressSink,
    index: u64,
    total: u64,
}

impl DriverObserver for BatchObserver<'_> {
    fn on_phase(&self, task: &UploadTask, phase: DriverPhase) {
        tracing::debug!(
            event = "upload.phase",
            task_id = task.id(),
            phase = phase.as_str(),
            "upload.phase"
        );
    }

    fn on_transfer(&self, task: &UploadTask, state: &TransferState) {
        self.sink.on_progress(&ProgressReport {
            file_name: task.name().to_string(),
            percent: state.percent,
            current_index_in_batch: self.index,
            total_in_batch: self.total,
            eta: state.eta,
            bytes_uploaded: state.offset_bytes,
            size_bytes: state.size_bytes,
        });
    }
}

async fn process_run<T>(inner: Arc<QueueInner<T>>, context: UploadContext)
where
    T: SessionInitiator + ChunkTransport + 'static,
{
    let outcome = loop {
        let next = {
            let mut st = inner.lock();
            let completed = st.run.as_ref().map(|r| r.completed).unwrap_or(0);
            match st.pending.front().cloned() {
                Some(task) => {
                    let total = completed + st.pending.len() as u64;
                    NextTask::Run(task, completed + 1, total)
                }
                None => {
                    // Observing the empty queue and ending the run happen under one lock,
                    // so a concurrent enqueue either joins this run or starts a new one.
                    st.run = None;
                    NextTask::Drained(completed)
                }
            }
        };
        let (task, index, total) = match next {
            NextTask::Run(task, index, total) => (task, index, total),
            NextTask::Drained(completed) => break BatchOutcome::Succeeded { completed },
        };

        let observer = BatchObserver {
            sink: inner.sink.as_ref(),
            index,
            total,
        };
        let res = inner.driver.run(&task, &context, &observer).await;

        match res {
            Ok(DriverOutcome::Completed { file_id, name, .. }) => {
                {
                    let mut st = inner.lock();
                    st.pending.pop_front();
                    if let Some(run) = st.run.as_mut() {
                        run.completed += 1;
                    }
                }
                inner.sink.on_task_finished(&TaskReport {
                    file_name: task.name().to_string(),
                    file_id,
                    remote_name: name,
                    index_in_batch: index,
                    total_in_batch: total,
                });
                match context.guard(inner.refresher.refresh()).await {
                    Ok(()) => {}
                    Err(Error::Cancelled) => {
                        let (completed, abandoned) = abort_run(&inner, false);
                        break BatchOutcome::Cancelled {
                            completed,
                            abandoned,
                        };
                    }
                    Err(e) => {
                        warn!(
                            event = "listing.refresh_failed",
                            run_id = context.run_id(),
                            error = %e,
                            "listing.refresh_failed"
                        );
                    }
                }
            }
            Ok(DriverOutcome::Cancelled) => {
                let (completed, abandoned) = abort_run(&inner, true);
                break BatchOutcome::Cancelled {
                    completed,
                    abandoned,
                };
            }
            Err(e) => {
                let (completed, abandoned) = abort_run(&inner, true);
                break BatchOutcome::Failed {
                    completed,
                    abandoned,
                    file_name: task.name().to_string(),
                    code: e.code().to_string(),
                    message: e.to_string(),
                };
            }
        }
    };

    info!(
        event = "queue.run_finished",
        run_id = context.run_id(),
        outcome = ?outcome,
        "queue.run_finished"
    );
    inner.sink.on_batch_finished(&outcome);

    // A newer run may already own the flag; check and send under one lock.
    let st = inner.lock();
    if st.run.is_none() {
        inner.idle.send_replace(true);
    }
}

enum NextTask {
    Run(UploadTask, u64, u64),
    Drained(u64),
}

/// Clear the remaining batch and end the run under one lock.
///
/// Returns `(completed, abandoned)`. When `stopper_queued` is set, the head of the queue is the
/// task that stopped the run and is not counted as abandoned.
fn abort_run<T>(inner: &QueueInner<T>, stopper_queued: bool) -> (u64, u64) {
    let mut st = inner.lock();
    let queued = st.pending.len() as u64;
    let abandoned = if stopper_queued {
        queued.saturating_sub(1)
    } else {
        queued
    };
    st.pending.clear();
    let completed = st.run.take().map(|r| r.completed).unwrap_or(0);
    (completed, abandoned)
}
