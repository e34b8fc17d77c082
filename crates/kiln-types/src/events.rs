//! Wire event types shared between the runtime and its clients.

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

// ── Install progress ──────────────────────────────────────────────────────────

/// Lifecycle phase of an install.
///
/// `Ready`, `Failed` and `Cancelled` are terminal; a progress stream carries
/// exactly one terminal event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum InstallPhase {
    Idle,
    Downloading,
    Verifying,
    Extracting,
    Ready,
    Failed,
    Cancelled,
}

impl InstallPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InstallPhase::Ready | InstallPhase::Failed | InstallPhase::Cancelled
        )
    }
}

/// One event on an install progress stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallProgress {
    pub model_id: String,
    pub version: Version,
    pub request_id: Uuid,
    pub phase: InstallPhase,
    pub received_bytes: u64,
    pub total_bytes: u64,
    /// Download completion in `[0, 1]`; verifying and extracting report `1.0`.
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CoreError>,
}

// ── LLM stream events ─────────────────────────────────────────────────────────

/// Why a generation stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FinishReason {
    Eos,
    Length,
    Stop,
    Cancel,
    Error,
}

/// Token accounting attached to metrics and terminal events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationStats {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_to_first_token_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ms_per_token: Option<f64>,
}

/// Event payload, discriminated by `eventType` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "eventType", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum StreamPayload {
    Delta {
        /// Always present, possibly empty.
        delta_text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token_ids: Option<Vec<u32>>,
    },
    Metrics {
        stats: GenerationStats,
    },
    Finish {
        finish_reason: FinishReason,
        stats: GenerationStats,
    },
    Error {
        error: CoreError,
        /// Always [`FinishReason::Error`].
        finish_reason: FinishReason,
    },
}

impl StreamPayload {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamPayload::Finish { .. } | StreamPayload::Error { .. })
    }
}

/// One event on an LLM generation stream.
///
/// `sequence` starts at 1 and strictly increases per `request_id`; nothing
/// follows a terminal payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    pub request_id: Uuid,
    pub sequence: u64,
    #[serde(flatten)]
    pub payload: StreamPayload,
}

/// The non-streaming result shape.
///
/// Equal to the concatenation of every `deltaText` in sequence order plus the
/// terminal reason and stats of the same stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionResult {
    pub text: String,
    pub finish_reason: FinishReason,
    pub stats: GenerationStats,
}

// ── Scheduler events ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TaskEventType {
    Submitted,
    Started,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

/// Broadcast record of a task lifecycle transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    #[serde(rename = "type")]
    pub event_type: TaskEventType,
    pub task_id: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CoreError>,
}
