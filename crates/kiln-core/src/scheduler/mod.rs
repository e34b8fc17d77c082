//! Priority-aware task scheduler.
//!
//! Many producers submit; one dispatch loop owns admission.  A task runs
//! only when both the global worker budget and its type queue's cap admit
//! it.  Within a type queue, dispatch is by descending priority, ties FIFO
//! by submission order.  Cancellation is cooperative via a watch channel;
//! per-task timeouts fire the same signal.

mod task;

pub use task::{
    CancelToken, QueueCaps, ResourceKind, TaskFn, TaskFuture, TaskId, TaskSpec, TaskStatus,
    TaskStatusView, TaskType,
};

use chrono::Utc;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch, RwLock};
use tracing::{debug, info, warn};

use kiln_types::{CoreError, TaskEvent, TaskEventType};

use task::TaskRecord;

const COMMAND_QUEUE_CAPACITY: usize = 256;
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Read-consistent snapshot of the scheduler's counters.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStats {
    pub total_submitted: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_cancelled: u64,
    pub total_timeout: u64,
    pub running: u64,
    pub pending: u64,
}

enum Command {
    Submit {
        id: TaskId,
        spec: TaskSpec,
        thunk: TaskFn,
    },
    Cancel {
        id: TaskId,
        reply: oneshot::Sender<bool>,
    },
    Finished {
        task_type: TaskType,
    },
}

struct Shared {
    records: RwLock<HashMap<TaskId, TaskRecord>>,
    events_tx: broadcast::Sender<TaskEvent>,
    stats: std::sync::Mutex<SchedulerStats>,
    next_id: AtomicU64,
}

impl Shared {
    fn emit(&self, event_type: TaskEventType, task_id: TaskId, error: Option<CoreError>) {
        let _ = self.events_tx.send(TaskEvent {
            event_type,
            task_id,
            timestamp: Utc::now(),
            error,
        });
    }

    fn with_stats(&self, update: impl FnOnce(&mut SchedulerStats)) {
        let mut stats = self.stats.lock().expect("stats mutex poisoned");
        update(&mut stats);
    }
}

/// Handle to the scheduler.  Cheap to clone; all clones share one dispatcher.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
    cmd_tx: mpsc::Sender<Command>,
}

impl Scheduler {
    /// Start the scheduler with its dispatch loop.
    pub fn new(max_total_concurrent: usize, caps: QueueCaps) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            records: RwLock::new(HashMap::new()),
            events_tx,
            stats: std::sync::Mutex::new(SchedulerStats::default()),
            next_id: AtomicU64::new(1),
        });

        let loop_shared = Arc::clone(&shared);
        let loop_tx = cmd_tx.clone();
        tokio::spawn(async move {
            DispatchLoop::new(loop_shared, loop_tx, max_total_concurrent, caps)
                .run(cmd_rx)
                .await;
        });

        Self { shared, cmd_tx }
    }

    /// Submit a task.  Returns its id immediately; execution is admitted by
    /// the dispatch loop.
    pub async fn submit(
        &self,
        spec: TaskSpec,
        thunk: impl FnOnce(CancelToken) -> TaskFuture + Send + 'static,
    ) -> Result<TaskId, CoreError> {
        let id = self.shared.next_id.fetch_add(1, AtomicOrdering::Relaxed);

        let record = TaskRecord {
            spec: spec.clone(),
            status: TaskStatus::Pending,
            error: None,
            result: None,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            cancel_tx: None,
        };
        self.shared.records.write().await.insert(id, record);
        self.shared.with_stats(|s| {
            s.total_submitted += 1;
            s.pending += 1;
        });
        self.shared.emit(TaskEventType::Submitted, id, None);
        debug!(task_id = id, task_type = %spec.task_type, "task submitted");

        self.cmd_tx
            .send(Command::Submit {
                id,
                spec,
                thunk: Box::new(thunk),
            })
            .await
            .map_err(|_| {
                CoreError::runtime_not_available("scheduler", "scheduler dispatch loop stopped")
            })?;
        Ok(id)
    }

    /// Request cancellation.
    ///
    /// Pending tasks transition to `cancelled` immediately and never run.
    /// Running cancellable tasks get the signal and finish as `cancelled`
    /// when they acknowledge.  Returns `false` for unknown, terminal, or
    /// non-cancellable running tasks.
    pub async fn cancel(&self, id: TaskId) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Cancel {
                id,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    pub async fn status(&self, id: TaskId) -> Option<TaskStatusView> {
        let records = self.shared.records.read().await;
        let record = records.get(&id)?;
        Some(TaskStatusView {
            task_id: id,
            task_type: record.spec.task_type,
            resource: record.spec.resource,
            status: record.status,
            error: record.error.clone(),
            result: record.result.clone(),
            submitted_at: record.submitted_at,
            started_at: record.started_at,
            finished_at: record.finished_at,
        })
    }

    /// Subscribe to the canonical lifecycle event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.shared.events_tx.subscribe()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.shared.stats.lock().expect("stats mutex poisoned").clone()
    }
}

// ── Dispatch loop ─────────────────────────────────────────────────────────────

struct PendingEntry {
    priority: i32,
    seq: u64,
    id: TaskId,
    spec: TaskSpec,
    thunk: TaskFn,
}

impl PartialEq for PendingEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for PendingEntry {}
impl PartialOrd for PendingEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for PendingEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then earlier submission.
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

struct DispatchLoop {
    shared: Arc<Shared>,
    cmd_tx: mpsc::Sender<Command>,
    max_total: usize,
    caps: QueueCaps,
    pending: BTreeMap<TaskType, BinaryHeap<PendingEntry>>,
    running_per_type: BTreeMap<TaskType, usize>,
    running_total: usize,
    next_seq: u64,
}

impl DispatchLoop {
    fn new(
        shared: Arc<Shared>,
        cmd_tx: mpsc::Sender<Command>,
        max_total: usize,
        caps: QueueCaps,
    ) -> Self {
        Self {
            shared,
            cmd_tx,
            max_total: max_total.max(1),
            caps,
            pending: BTreeMap::new(),
            running_per_type: BTreeMap::new(),
            running_total: 0,
            next_seq: 0,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                Command::Submit { id, spec, thunk } => {
                    let seq = self.next_seq;
                    self.next_seq += 1;
                    self.pending.entry(spec.task_type).or_default().push(PendingEntry {
                        priority: spec.priority,
                        seq,
                        id,
                        spec,
                        thunk,
                    });
                    self.dispatch().await;
                }
                Command::Cancel { id, reply } => {
                    let accepted = self.handle_cancel(id).await;
                    let _ = reply.send(accepted);
                }
                Command::Finished { task_type } => {
                    self.running_total = self.running_total.saturating_sub(1);
                    if let Some(count) = self.running_per_type.get_mut(&task_type) {
                        *count = count.saturating_sub(1);
                    }
                    self.dispatch().await;
                }
            }
        }
    }

    /// Start every pending task both limits admit.
    async fn dispatch(&mut self) {
        loop {
            let mut dispatched = false;
            for task_type in TaskType::ALL {
                if self.running_total >= self.max_total {
                    return;
                }
                let cap = self.caps.cap(task_type);
                let running = self.running_per_type.get(&task_type).copied().unwrap_or(0);
                if running >= cap {
                    continue;
                }
                if let Some(entry) = self.pop_pending(task_type).await {
                    self.start(entry).await;
                    dispatched = true;
                }
            }
            if !dispatched {
                return;
            }
        }
    }

    /// Pop the highest-priority entry whose record is still pending.
    /// Entries cancelled while queued are skipped here.
    async fn pop_pending(&mut self, task_type: TaskType) -> Option<PendingEntry> {
        let heap = self.pending.get_mut(&task_type)?;
        let records = self.shared.records.read().await;
        while let Some(entry) = heap.pop() {
            match records.get(&entry.id) {
                Some(record) if record.status == TaskStatus::Pending => return Some(entry),
                _ => continue,
            }
        }
        None
    }

    async fn start(&mut self, entry: PendingEntry) {
        let PendingEntry {
            id, spec, thunk, ..
        } = entry;
        let (cancel_tx, cancel_rx) = watch::channel(false);

        {
            let mut records = self.shared.records.write().await;
            let Some(record) = records.get_mut(&id) else {
                return;
            };
            record.status = TaskStatus::Running;
            record.started_at = Some(Utc::now());
            record.cancel_tx = Some(cancel_tx.clone());
        }
        self.running_total += 1;
        *self.running_per_type.entry(spec.task_type).or_insert(0) += 1;
        self.shared.with_stats(|s| {
            s.pending = s.pending.saturating_sub(1);
            s.running += 1;
        });
        self.shared.emit(TaskEventType::Started, id, None);
        debug!(task_id = id, task_type = %spec.task_type, "task started");

        let shared = Arc::clone(&self.shared);
        let cmd_tx = self.cmd_tx.clone();
        let task_type = spec.task_type;
        let timeout = spec.timeout;
        tokio::spawn(async move {
            let token = CancelToken::new(cancel_rx);
            let outcome = match timeout {
                Some(limit) => {
                    tokio::select! {
                        result = (thunk)(token) => Some(result),
                        _ = tokio::time::sleep(limit) => {
                            // Fire the same signal explicit cancel uses, for
                            // any work still holding the token.
                            let _ = cancel_tx.send(true);
                            None
                        }
                    }
                }
                None => Some((thunk)(token).await),
            };
            finish_task(&shared, id, outcome).await;
            let _ = cmd_tx.send(Command::Finished { task_type }).await;
        });
    }

    async fn handle_cancel(&mut self, id: TaskId) -> bool {
        let mut records = self.shared.records.write().await;
        let Some(record) = records.get_mut(&id) else {
            warn!(task_id = id, "cancel: task not found");
            return false;
        };
        match record.status {
            TaskStatus::Pending => {
                record.status = TaskStatus::Cancelled;
                record.finished_at = Some(Utc::now());
                record.error = Some(CoreError::task_cancelled());
                drop(records);
                self.shared.with_stats(|s| {
                    s.pending = s.pending.saturating_sub(1);
                    s.total_cancelled += 1;
                });
                self.shared.emit(TaskEventType::Cancelled, id, None);
                info!(task_id = id, "pending task cancelled");
                true
            }
            TaskStatus::Running => {
                if !record.spec.cancellable {
                    return false;
                }
                if let Some(cancel_tx) = &record.cancel_tx {
                    let _ = cancel_tx.send(true);
                }
                info!(task_id = id, "cancellation signalled to running task");
                true
            }
            _ => false,
        }
    }
}

/// Write the terminal state exactly once and emit the matching event.
///
/// `outcome` is `None` on timeout expiry.
async fn finish_task(
    shared: &Shared,
    id: TaskId,
    outcome: Option<Result<serde_json::Value, CoreError>>,
) {
    let mut records = shared.records.write().await;
    let Some(record) = records.get_mut(&id) else {
        return;
    };
    if record.status.is_terminal() {
        return;
    }

    let (status, event_type, error) = match outcome {
        None => {
            let err = CoreError::task_timeout(format!("task {id} exceeded its deadline"));
            (TaskStatus::Timeout, TaskEventType::Timeout, Some(err))
        }
        Some(Ok(value)) => {
            record.result = Some(value);
            (TaskStatus::Completed, TaskEventType::Completed, None)
        }
        Some(Err(err)) if err.code == kiln_types::ErrorCode::TaskCancelled => {
            (TaskStatus::Cancelled, TaskEventType::Cancelled, Some(err))
        }
        Some(Err(err)) => (TaskStatus::Failed, TaskEventType::Failed, Some(err)),
    };

    record.status = status;
    record.error = error.clone();
    record.finished_at = Some(Utc::now());
    record.cancel_tx = None;
    drop(records);

    shared.with_stats(|s| {
        s.running = s.running.saturating_sub(1);
        match status {
            TaskStatus::Completed => s.total_completed += 1,
            TaskStatus::Failed => s.total_failed += 1,
            TaskStatus::Cancelled => s.total_cancelled += 1,
            TaskStatus::Timeout => s.total_timeout += 1,
            TaskStatus::Pending | TaskStatus::Running => {}
        }
    });
    shared.emit(event_type, id, error);
    debug!(task_id = id, status = %status, "task finished");
}
