//! Task vocabulary for the scheduler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::watch;

use kiln_types::CoreError;

pub type TaskId = u64;

/// Queue families.  Downloads and inference are distinct queues by
/// construction, so I/O never blocks inference.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TaskType {
    Llm,
    Ocr,
    Stt,
    Tts,
    Embedding,
    Download,
    Verify,
}

impl TaskType {
    pub const ALL: [TaskType; 7] = [
        TaskType::Llm,
        TaskType::Ocr,
        TaskType::Stt,
        TaskType::Tts,
        TaskType::Embedding,
        TaskType::Download,
        TaskType::Verify,
    ];
}

/// Advisory resource classification; used for queue assignment defaults and
/// reporting, never as a scheduling key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum ResourceKind {
    CpuBound,
    GpuBound,
    IoBound,
}

/// Per-type concurrency caps.
#[derive(Debug, Clone)]
pub struct QueueCaps(BTreeMap<TaskType, usize>);

impl Default for QueueCaps {
    fn default() -> Self {
        let mut caps = BTreeMap::new();
        caps.insert(TaskType::Llm, 1);
        caps.insert(TaskType::Ocr, 2);
        caps.insert(TaskType::Stt, 2);
        caps.insert(TaskType::Tts, 1);
        caps.insert(TaskType::Embedding, 2);
        caps.insert(TaskType::Download, 3);
        caps.insert(TaskType::Verify, 2);
        Self(caps)
    }
}

impl QueueCaps {
    pub fn cap(&self, task_type: TaskType) -> usize {
        self.0.get(&task_type).copied().unwrap_or(1)
    }

    pub fn set(&mut self, task_type: TaskType, cap: usize) {
        self.0.insert(task_type, cap);
    }
}

/// Submission parameters for one task.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub task_type: TaskType,
    /// Higher runs first within the type queue; ties are FIFO.
    pub priority: i32,
    pub resource: ResourceKind,
    pub timeout: Option<Duration>,
    pub cancellable: bool,
}

impl TaskSpec {
    pub fn new(task_type: TaskType) -> Self {
        let resource = match task_type {
            TaskType::Download | TaskType::Verify => ResourceKind::IoBound,
            TaskType::Llm => ResourceKind::GpuBound,
            _ => ResourceKind::CpuBound,
        };
        Self {
            task_type,
            priority: 0,
            resource,
            timeout: None,
            cancellable: true,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn resource(mut self, resource: ResourceKind) -> Self {
        self.resource = resource;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cancellable(mut self, cancellable: bool) -> Self {
        self.cancellable = cancellable;
        self
    }
}

/// Lifecycle states.  `Completed`, `Failed`, `Cancelled` and `Timeout` are
/// terminal and written exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }
}

/// Cooperative cancellation signal handed to every task thunk.
///
/// Becomes `true` on explicit cancel and on timeout expiry; the thunk
/// observes it at its own suspension points.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
    /// Keeps the sender alive for tokens created outside the scheduler.
    _keepalive: Option<std::sync::Arc<watch::Sender<bool>>>,
}

impl CancelToken {
    pub(super) fn new(rx: watch::Receiver<bool>) -> Self {
        Self {
            rx,
            _keepalive: None,
        }
    }

    /// A token that never fires, for calls outside the scheduler.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            rx,
            _keepalive: Some(std::sync::Arc::new(tx)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is signalled.
    pub async fn cancelled(&mut self) {
        // An Err means the scheduler side dropped the sender, which only
        // happens after a terminal state; treat it as cancellation.
        let _ = self.rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// The scheduler's record of one task.  Owned by the scheduler from submit
/// to terminal state; clients refer to tasks by id only.
#[derive(Debug)]
pub(super) struct TaskRecord {
    pub spec: TaskSpec,
    pub status: TaskStatus,
    pub error: Option<CoreError>,
    pub result: Option<serde_json::Value>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cancel_tx: Option<watch::Sender<bool>>,
}

/// Read-only snapshot of a task's state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusView {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub resource: ResourceKind,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<CoreError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    pub submitted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Boxed async work: receives the cancel token, returns a JSON result.
pub type TaskFuture = futures::future::BoxFuture<'static, Result<serde_json::Value, CoreError>>;
pub type TaskFn = Box<dyn FnOnce(CancelToken) -> TaskFuture + Send + 'static>;
