use std::io::Write;
use std::sync::{Arc, Mutex};

use drivedeck_core::progress::{
    BatchOutcome, Eta, EtaCountdown, ProgressReport, ProgressSink, TaskReport, format_eta,
};
use tokio::time::Instant;

/// `[2/3] video.mp4  42%  ETA 3m 12s`
pub fn render_progress_line(report: &ProgressReport, eta: Eta) -> String {
    format!(
        "[{}/{}] {}  {:>3}%  ETA {}",
        report.current_index_in_batch,
        report.total_in_batch,
        report.file_name,
        report.percent,
        format_eta(eta)
    )
}

pub fn progress_event(report: &ProgressReport) -> serde_json::Value {
    serde_json::json!({
        "type": "task.progress",
        "file": report.file_name,
        "percent": report.percent,
        "index": report.current_index_in_batch,
        "total": report.total_in_batch,
        "bytesUploaded": report.bytes_uploaded,
        "sizeBytes": report.size_bytes,
        "eta": report.eta,
    })
}

pub fn task_finished_event(report: &TaskReport) -> serde_json::Value {
    serde_json::json!({
        "type": "task.state",
        "kind": "file",
        "state": "succeeded",
        "file": report.file_name,
        "fileId": report.file_id,
        "index": report.index_in_batch,
        "total": report.total_in_batch,
    })
}

pub fn batch_event(outcome: &BatchOutcome) -> serde_json::Value {
    let mut v = serde_json::to_value(outcome).unwrap_or_else(|_| serde_json::json!({}));
    if let Some(map) = v.as_object_mut() {
        map.insert("type".to_string(), "task.state".into());
        map.insert("kind".to_string(), "batch".into());
    }
    v
}

/// One NDJSON line per callback on stdout.
pub struct NdjsonProgressSink;

impl ProgressSink for NdjsonProgressSink {
    fn on_progress(&self, p: &ProgressReport) {
        println!("{}", progress_event(p));
    }

    fn on_task_finished(&self, report: &TaskReport) {
        println!("{}", task_finished_event(report));
    }

    fn on_batch_finished(&self, outcome: &BatchOutcome) {
        println!("{}", batch_event(outcome));
    }
}

struct LineState {
    last: Option<ProgressReport>,
    countdown: EtaCountdown,
}

/// Single redrawn status line on stderr. `tick` keeps the ETA counting down between chunks.
pub struct HumanProgressSink {
    state: Mutex<LineState>,
}

impl HumanProgressSink {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LineState {
                last: None,
                countdown: EtaCountdown::new(Instant::now()),
            }),
        }
    }

    pub fn tick(&self, now: Instant) {
        let st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(last) = &st.last {
            redraw(&render_progress_line(last, st.countdown.remaining_at(now)));
        }
    }
}

impl Default for HumanProgressSink {
    fn default() -> Self {
        Self::new()
    }
}

fn redraw(line: &str) {
    let mut err = std::io::stderr();
    let _ = write!(err, "\r\x1b[2K{line}");
    let _ = err.flush();
}

impl ProgressSink for HumanProgressSink {
    fn on_progress(&self, p: &ProgressReport) {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        st.countdown.anchor(p.eta, Instant::now());
        redraw(&render_progress_line(p, p.eta));
        st.last = Some(p.clone());
    }

    fn on_task_finished(&self, report: &TaskReport) {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        st.last = None;
        redraw("");
        println!(
            "uploaded [{}/{}] {} -> {}",
            report.index_in_batch, report.total_in_batch, report.file_name, report.file_id
        );
    }

    fn on_batch_finished(&self, _outcome: &BatchOutcome) {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        st.last = None;
        redraw("");
    }
}

/// Forwards to the display sink and keeps what the command needs to report at the end.
pub struct RecordingSink {
    inner: Arc<dyn ProgressSink>,
    finished: Mutex<Vec<TaskReport>>,
    outcome: Mutex<Option<BatchOutcome>>,
}

impl RecordingSink {
    pub fn new(inner: Arc<dyn ProgressSink>) -> Self {
        Self {
            inner,
            finished: Mutex::new(Vec::new()),
            outcome: Mutex::new(None),
        }
    }

    pub fn finished(&self) -> Vec<TaskReport> {
        self.finished
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn outcome(&self) -> Option<BatchOutcome> {
        self.outcome
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl ProgressSink for RecordingSink {
    fn on_progress(&self, p: &ProgressReport) {
        self.inner.on_progress(p);
    }

    fn on_task_finished(&self, report: &TaskReport) {
        self.finished
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(report.clone());
        self.inner.on_task_finished(report);
    }

    fn on_batch_finished(&self, outcome: &BatchOutcome) {
        *self.outcome.lock().unwrap_or_else(|e| e.into_inner()) = Some(outcome.clone());
        self.inner.on_batch_finished(outcome);
    }
}
