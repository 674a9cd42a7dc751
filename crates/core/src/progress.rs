use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Below this much elapsed time throughput is not meaningful.
const MIN_ELAPSED_FOR_ETA: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "seconds")]
pub enum Eta {
    Calculating,
    Seconds(u64),
}

/// `floor(offset / size * 100)`; a zero-byte file is complete by definition.
pub fn percent(offset_bytes: u64, size_bytes: u64) -> u8 {
    if size_bytes == 0 {
        return 100;
    }
    let offset = offset_bytes.min(size_bytes) as u128;
    ((offset * 100) / size_bytes as u128) as u8
}

pub fn estimate_eta(offset_bytes: u64, size_bytes: u64, elapsed: Duration) -> Eta {
    if offset_bytes >= size_bytes {
        return Eta::Seconds(0);
    }
    if offset_bytes == 0 || elapsed < MIN_ELAPSED_FOR_ETA {
        return Eta::Calculating;
    }
    let throughput = offset_bytes as f64 / elapsed.as_secs_f64();
    let remaining = (size_bytes - offset_bytes) as f64;
    Eta::Seconds((remaining / throughput).ceil() as u64)
}

pub fn format_eta(eta: Eta) -> String {
    match eta {
        Eta::Calculating => "calculating...".to_string(),
        Eta::Seconds(s) if s < 60 => format!("{s}s"),
        Eta::Seconds(s) if s < 3600 => format!("{}m {}s", s / 60, s % 60),
        Eta::Seconds(s) => format!("{}h {}m", s / 3600, (s % 3600) / 60),
    }
}

/// Progress record for the in-flight task. `offset_bytes` never regresses.
#[derive(Debug, Clone)]
pub struct TransferState {
    pub offset_bytes: u64,
    pub size_bytes: u64,
    pub started_at: Instant,
    pub chunks_acked: u64,
    pub percent: u8,
    pub eta: Eta,
}

impl TransferState {
    pub fn new(size_bytes: u64, started_at: Instant) -> Self {
        Self {
            offset_bytes: 0,
            size_bytes,
            started_at,
            chunks_acked: 0,
            percent: 0,
            eta: Eta::Calculating,
        }
    }

    /// Record an acknowledged chunk ending at `offset_bytes` (exclusive).
    pub fn acknowledge(&mut self, offset_bytes: u64, now: Instant) {
        self.offset_bytes = self.offset_bytes.max(offset_bytes.min(self.size_bytes));
        self.chunks_acked += 1;
        self.percent = percent(self.offset_bytes, self.size_bytes);
        self.eta = estimate_eta(
            self.offset_bytes,
            self.size_bytes,
            now.saturating_duration_since(self.started_at),
        );
    }

    pub fn is_done(&self) -> bool {
        self.offset_bytes >= self.size_bytes
    }
}

/// What a display surface needs for one progress line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressReport {
    pub file_name: String,
    pub percent: u8,
    pub current_index_in_batch: u64,
    pub total_in_batch: u64,
    pub eta: Eta,
    pub bytes_uploaded: u64,
    pub size_bytes: u64,
}

impl ProgressReport {
    pub fn eta_display(&self) -> String {
        format_eta(self.eta)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskReport {
    pub file_name: String,
    pub file_id: String,
    pub remote_name: String,
    pub index_in_batch: u64,
    pub total_in_batch: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "state")]
pub enum BatchOutcome {
    Succeeded {
        completed: u64,
    },
    Cancelled {
        completed: u64,
        abandoned: u64,
    },
    Failed {
        completed: u64,
        abandoned: u64,
        file_name: String,
        code: String,
        message: String,
    },
}

pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, progress: &ProgressReport);

    fn on_task_finished(&self, _report: &TaskReport) {}

    fn on_batch_finished(&self, _outcome: &BatchOutcome) {}
}

pub struct NoopProgressSink;

impl ProgressSink for NoopProgressSink {
    fn on_progress(&self, _progress: &ProgressReport) {}
}

/// Display-side countdown between chunk acknowledgments.
///
/// Cosmetic only: every acknowledgment re-anchors it to the computed ETA.
#[derive(Debug, Clone)]
pub struct EtaCountdown {
    anchor: Eta,
    anchored_at: Instant,
}

impl EtaCountdown {
    pub fn new(now: Instant) -> Self {
        Self {
            anchor: Eta::Calculating,
            anchored_at: now,
        }
    }

    pub fn anchor(&mut self, eta: Eta, now: Instant) {
        self.anchor = eta;
        self.anchored_at = now;
    }

    /// Whole seconds elapsed since the anchor are subtracted, floored at zero.
    pub fn remaining_at(&self, now: Instant) -> Eta {
        match self.anchor {
            Eta::Calculating => Eta::Calculating,
            Eta::Seconds(s) => {
                let ticks = now.saturating_duration_since(self.anchored_at).as_secs();
                Eta::Seconds(s.saturating_sub(ticks))
            }
        }
    }
}
