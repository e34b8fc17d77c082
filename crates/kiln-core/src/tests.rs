//! Behavioural tests across scheduler, stream protocol and the runtime
//! facade, using mock adapters in place of real inference backends.

use async_trait::async_trait;
use semver::Version;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use kiln_types::{
    BackendKind, CoreError, ErrorCode, FinishReason, GenerationConfig, GenerationStats, Manifest,
    Platform, StreamPayload, TaskEventType,
};

use crate::adapter::{
    AccelerationSupport, AdapterRegistry, AdapterRequest, AdapterResponse, BackendAdapter,
    LoadParams, SessionHandle,
};
use crate::scheduler::{
    CancelToken, QueueCaps, Scheduler, TaskSpec, TaskStatus, TaskType,
};
use crate::selector::{HostProbe, SelectionHints};
use crate::stream::RawDelta;
use crate::{ModelRuntime, RuntimeConfig};

const GIB: u64 = 1024 * 1024 * 1024;

// ── Fixtures ──────────────────────────────────────────────────────────────────

fn probe() -> HostProbe {
    let mut installed = BTreeMap::new();
    installed.insert(BackendKind::LlamaCpp, Version::new(0, 3, 0));
    HostProbe {
        platform: Platform::Linux,
        sdk_version: 34,
        cpu_cores: 8,
        available_memory_bytes: 32 * GIB,
        accel: None,
        accel_stable_backends: BTreeSet::new(),
        installed_backends: installed,
    }
}

fn sha_hex(data: &[u8]) -> String {
    // Tests only need a stable manifest digest for files they also write.
    use sha2::{Digest, Sha256};
    Sha256::digest(data).iter().map(|b| format!("{b:02x}")).collect()
}

/// Manifest with one LLM whose single artifact is already on disk, sentinel
/// included, so no install traffic happens.
fn ready_manifest(cache_dir: &std::path::Path, stop_strings: &[&str]) -> Manifest {
    let content = b"mock-weights";
    let version_dir = cache_dir.join("chat-7b").join("1.0.0");
    std::fs::create_dir_all(&version_dir).unwrap();
    std::fs::write(version_dir.join("model.gguf"), content).unwrap();
    std::fs::write(version_dir.join(".ready"), b"").unwrap();

    let manifest = serde_json::json!({
        "schemaVersion": 1,
        "contentVersion": "2024.1",
        "generatedAt": "2024-01-15T10:00:00Z",
        "models": [{
            "id": "chat-7b",
            "type": "llm",
            "version": "1.0.0",
            "backendHints": ["llama.cpp"],
            "platforms": ["linux"],
            "defaultGenerationConfig": {
                "maxTokens": 128,
                "stopStrings": stop_strings,
            },
            "requiredArtifacts": [{
                "name": "model.gguf",
                "role": "model",
                "format": "gguf",
                "path": "model.gguf",
                "size": content.len(),
                "sha256": sha_hex(content),
            }],
        }],
    });
    Manifest::from_json(&manifest.to_string()).unwrap()
}

fn runtime_config(cache_dir: &std::path::Path) -> RuntimeConfig {
    RuntimeConfig {
        cache_dir: cache_dir.to_path_buf(),
        ..Default::default()
    }
}

/// Channel-backed mock LLM backend emitting a fixed token sequence.
struct MockLlama {
    tokens: Vec<String>,
    token_delay: Duration,
}

impl MockLlama {
    fn new(tokens: &[&str]) -> Self {
        Self {
            tokens: tokens.iter().map(|t| (*t).to_owned()).collect(),
            token_delay: Duration::from_millis(1),
        }
    }

    fn slow(tokens: Vec<String>, token_delay: Duration) -> Self {
        Self {
            tokens,
            token_delay,
        }
    }
}

#[async_trait]
impl BackendAdapter for MockLlama {
    fn backend(&self) -> BackendKind {
        BackendKind::LlamaCpp
    }

    fn version(&self) -> Version {
        Version::new(0, 3, 0)
    }

    fn platforms(&self) -> &[Platform] {
        &[Platform::Linux, Platform::Macos]
    }

    fn probe_acceleration(&self) -> AccelerationSupport {
        AccelerationSupport::default()
    }

    async fn load(&self, _params: LoadParams) -> Result<SessionHandle, CoreError> {
        Ok(SessionHandle {
            backend: BackendKind::LlamaCpp,
            id: 1,
        })
    }

    async fn unload(&self, _session: SessionHandle) -> Result<(), CoreError> {
        Ok(())
    }

    async fn stream_generate(
        &self,
        _session: &SessionHandle,
        _prompt: &str,
        _config: &GenerationConfig,
        mut cancel: CancelToken,
    ) -> Result<mpsc::Receiver<RawDelta>, CoreError> {
        let (tx, rx) = mpsc::channel(8);
        let tokens = self.tokens.clone();
        let delay = self.token_delay;
        tokio::spawn(async move {
            let mut sent: u64 = 0;
            for token in tokens {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = tx
                            .send(RawDelta::Done {
                                reason: FinishReason::Cancel,
                                stats: GenerationStats {
                                    prompt_tokens: 4,
                                    completion_tokens: sent,
                                    ..Default::default()
                                },
                            })
                            .await;
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                if tx
                    .send(RawDelta::Text {
                        text: token,
                        token_ids: None,
                    })
                    .await
                    .is_err()
                {
                    // Consumer dropped the stream (e.g. stop match); stop.
                    return;
                }
                sent += 1;
            }
            let _ = tx
                .send(RawDelta::Done {
                    reason: FinishReason::Eos,
                    stats: GenerationStats {
                        prompt_tokens: 4,
                        completion_tokens: sent,
                        ..Default::default()
                    },
                })
                .await;
        });
        Ok(rx)
    }

    async fn run(
        &self,
        _session: &SessionHandle,
        _request: AdapterRequest,
        _cancel: CancelToken,
    ) -> Result<AdapterResponse, CoreError> {
        Err(CoreError::runtime_not_available(
            "mock",
            "mock adapter only implements generation",
        ))
    }
}

fn registry_with(adapter: MockLlama) -> AdapterRegistry {
    let mut registry = AdapterRegistry::new();
    registry.register(Arc::new(adapter));
    registry
}

async fn wait_for_status(
    scheduler: &Scheduler,
    id: crate::scheduler::TaskId,
    predicate: impl Fn(TaskStatus) -> bool,
) -> TaskStatus {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(view) = scheduler.status(id).await {
                if predicate(view.status) {
                    return view.status;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("status condition not reached in time")
}

// ── Scheduler tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn type_queue_cap_bounds_concurrency() {
    let scheduler = Scheduler::new(8, QueueCaps::default());
    let concurrent = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut ids = Vec::new();
    for _ in 0..4 {
        let concurrent = Arc::clone(&concurrent);
        let peak = Arc::clone(&peak);
        let id = scheduler
            .submit(TaskSpec::new(TaskType::Llm), move |_cancel| {
                Box::pin(async move {
                    let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    concurrent.fetch_sub(1, Ordering::SeqCst);
                    Ok(serde_json::Value::Null)
                })
            })
            .await
            .unwrap();
        ids.push(id);
    }

    for id in ids {
        wait_for_status(&scheduler, id, |s| s.is_terminal()).await;
    }
    // LLM queue cap is 1.
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn total_concurrency_cap_is_enforced() {
    let mut caps = QueueCaps::default();
    for task_type in TaskType::ALL {
        caps.set(task_type, 4);
    }
    let scheduler = Scheduler::new(2, caps);
    let concurrent = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut ids = Vec::new();
    for task_type in [TaskType::Ocr, TaskType::Stt, TaskType::Embedding, TaskType::Verify] {
        let concurrent = Arc::clone(&concurrent);
        let peak = Arc::clone(&peak);
        let id = scheduler
            .submit(TaskSpec::new(task_type), move |_cancel| {
                Box::pin(async move {
                    let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    concurrent.fetch_sub(1, Ordering::SeqCst);
                    Ok(serde_json::Value::Null)
                })
            })
            .await
            .unwrap();
        ids.push(id);
    }

    for id in ids {
        wait_for_status(&scheduler, id, |s| s.is_terminal()).await;
    }
    assert!(peak.load(Ordering::SeqCst) <= 2, "total cap violated");
}

#[tokio::test]
async fn priority_order_with_fifo_ties() {
    let scheduler = Scheduler::new(4, QueueCaps::default());
    let order = Arc::new(std::sync::Mutex::new(Vec::<&'static str>::new()));
    let (gate_tx, gate_rx) = tokio::sync::oneshot::channel::<()>();

    // Occupy the single LLM slot so the rest queue up.
    let blocker = scheduler
        .submit(TaskSpec::new(TaskType::Llm), move |_c| {
            Box::pin(async move {
                let _ = gate_rx.await;
                Ok(serde_json::Value::Null)
            })
        })
        .await
        .unwrap();

    let mut submitted = Vec::new();
    for (name, priority) in [("low", 0), ("high-a", 5), ("high-b", 5)] {
        let order = Arc::clone(&order);
        let id = scheduler
            .submit(
                TaskSpec::new(TaskType::Llm).priority(priority),
                move |_c| {
                    Box::pin(async move {
                        order.lock().unwrap().push(name);
                        Ok(serde_json::Value::Null)
                    })
                },
            )
            .await
            .unwrap();
        submitted.push(id);
    }

    // Give the queued tasks a moment to land, then open the gate.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let _ = gate_tx.send(());

    wait_for_status(&scheduler, blocker, |s| s.is_terminal()).await;
    for id in submitted {
        wait_for_status(&scheduler, id, |s| s.is_terminal()).await;
    }
    assert_eq!(*order.lock().unwrap(), vec!["high-a", "high-b", "low"]);
}

#[tokio::test]
async fn cancel_pending_task_never_runs() {
    let scheduler = Scheduler::new(4, QueueCaps::default());
    let (gate_tx, gate_rx) = tokio::sync::oneshot::channel::<()>();

    let blocker = scheduler
        .submit(TaskSpec::new(TaskType::Tts), move |_c| {
            Box::pin(async move {
                let _ = gate_rx.await;
                Ok(serde_json::Value::Null)
            })
        })
        .await
        .unwrap();

    let ran = Arc::new(AtomicUsize::new(0));
    let ran_clone = Arc::clone(&ran);
    let pending = scheduler
        .submit(TaskSpec::new(TaskType::Tts), move |_c| {
            Box::pin(async move {
                ran_clone.fetch_add(1, Ordering::SeqCst);
                Ok(serde_json::Value::Null)
            })
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(scheduler.cancel(pending).await);
    let status = wait_for_status(&scheduler, pending, |s| s.is_terminal()).await;
    assert_eq!(status, TaskStatus::Cancelled);

    let _ = gate_tx.send(());
    wait_for_status(&scheduler, blocker, |s| s.is_terminal()).await;
    // The cancelled task's thunk must never execute.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(scheduler.stats().total_cancelled, 1);
}

#[tokio::test]
async fn running_cancellable_task_acknowledges_cancel() {
    let scheduler = Scheduler::new(4, QueueCaps::default());
    let id = scheduler
        .submit(TaskSpec::new(TaskType::Llm), move |mut cancel| {
            Box::pin(async move {
                cancel.cancelled().await;
                Err(CoreError::task_cancelled())
            })
        })
        .await
        .unwrap();

    wait_for_status(&scheduler, id, |s| s == TaskStatus::Running).await;
    assert!(scheduler.cancel(id).await);
    let status = wait_for_status(&scheduler, id, |s| s.is_terminal()).await;
    assert_eq!(status, TaskStatus::Cancelled);
    assert_eq!(scheduler.stats().total_cancelled, 1);
}

#[tokio::test]
async fn non_cancellable_running_task_refuses_cancel() {
    let scheduler = Scheduler::new(4, QueueCaps::default());
    let (gate_tx, gate_rx) = tokio::sync::oneshot::channel::<()>();
    let id = scheduler
        .submit(
            TaskSpec::new(TaskType::Ocr).cancellable(false),
            move |_c| {
                Box::pin(async move {
                    let _ = gate_rx.await;
                    Ok(serde_json::Value::Null)
                })
            },
        )
        .await
        .unwrap();

    wait_for_status(&scheduler, id, |s| s == TaskStatus::Running).await;
    assert!(!scheduler.cancel(id).await);
    let _ = gate_tx.send(());
    let status = wait_for_status(&scheduler, id, |s| s.is_terminal()).await;
    assert_eq!(status, TaskStatus::Completed);
}

#[tokio::test]
async fn timeout_expires_into_terminal_timeout() {
    let scheduler = Scheduler::new(4, QueueCaps::default());
    let mut events = scheduler.subscribe();

    let started = std::time::Instant::now();
    let id = scheduler
        .submit(
            TaskSpec::new(TaskType::Embedding).timeout(Duration::from_millis(100)),
            move |_c| {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    Ok(serde_json::Value::Null)
                })
            },
        )
        .await
        .unwrap();

    let status = wait_for_status(&scheduler, id, |s| s.is_terminal()).await;
    assert_eq!(status, TaskStatus::Timeout);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(90), "expired early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(600), "expired late: {elapsed:?}");
    assert_eq!(scheduler.stats().total_timeout, 1);

    // The event stream for this task ends at timeout; nothing follows it.
    let mut last_for_task = None;
    while let Ok(event) =
        tokio::time::timeout(Duration::from_millis(200), events.recv()).await
    {
        if let Ok(event) = event {
            if event.task_id == id {
                last_for_task = Some(event.event_type);
            }
        } else {
            break;
        }
    }
    assert_eq!(last_for_task, Some(TaskEventType::Timeout));
}

#[tokio::test]
async fn events_follow_lifecycle_order() {
    let scheduler = Scheduler::new(4, QueueCaps::default());
    let mut events = scheduler.subscribe();

    let id = scheduler
        .submit(TaskSpec::new(TaskType::Verify), |_c| {
            Box::pin(async { Ok(serde_json::Value::Null) })
        })
        .await
        .unwrap();
    wait_for_status(&scheduler, id, |s| s.is_terminal()).await;

    let mut seen = Vec::new();
    while let Ok(Ok(event)) =
        tokio::time::timeout(Duration::from_millis(200), events.recv()).await
    {
        if event.task_id == id {
            seen.push(event.event_type);
        }
        if seen.last() == Some(&TaskEventType::Completed) {
            break;
        }
    }
    assert_eq!(
        seen,
        vec![
            TaskEventType::Submitted,
            TaskEventType::Started,
            TaskEventType::Completed
        ]
    );
}

// ── Runtime facade tests ──────────────────────────────────────────────────────

#[tokio::test]
async fn generate_collects_the_streamed_text() {
    let cache = tempfile::tempdir().unwrap();
    let manifest = ready_manifest(cache.path(), &[]);
    let runtime = ModelRuntime::with_probe(
        manifest,
        registry_with(MockLlama::new(&["Hello", ",", " world"])),
        runtime_config(cache.path()),
        probe(),
    );

    let result = runtime
        .generate("chat-7b", "greet me", &SelectionHints::default(), None)
        .await
        .unwrap();
    assert_eq!(result.text, "Hello, world");
    assert_eq!(result.finish_reason, FinishReason::Eos);
    assert_eq!(result.stats.completion_tokens, 3);
}

#[tokio::test]
async fn stop_string_terminates_stream_without_leaking() {
    let cache = tempfile::tempdir().unwrap();
    let manifest = ready_manifest(cache.path(), &["\n\nUser:"]);
    let runtime = ModelRuntime::with_probe(
        manifest,
        registry_with(MockLlama::new(&["Hi there.\n", "\nUser:", " more"])),
        runtime_config(cache.path()),
        probe(),
    );

    let (_, stream) = runtime
        .generate_stream("chat-7b", "hi", &SelectionHints::default(), None)
        .await
        .unwrap();
    let mut rx = stream.into_inner();

    let mut text = String::new();
    let mut finish = None;
    let mut sequence = 0;
    while let Some(event) = rx.recv().await {
        assert!(event.sequence > sequence, "sequence must strictly increase");
        sequence = event.sequence;
        match event.payload {
            StreamPayload::Delta { delta_text, .. } => {
                assert!(!delta_text.contains("User:"), "stop text leaked: {delta_text}");
                text.push_str(&delta_text);
            }
            StreamPayload::Finish { finish_reason, .. } => {
                finish = Some(finish_reason);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }
    assert_eq!(text, "Hi there.");
    assert_eq!(finish, Some(FinishReason::Stop));
}

#[tokio::test]
async fn cancel_mid_generation_yields_finish_cancel() {
    let cache = tempfile::tempdir().unwrap();
    let manifest = ready_manifest(cache.path(), &[]);
    let tokens: Vec<String> = (0..200).map(|i| format!("tok{i} ")).collect();
    let runtime = ModelRuntime::with_probe(
        manifest,
        registry_with(MockLlama::slow(tokens, Duration::from_millis(10))),
        runtime_config(cache.path()),
        probe(),
    );

    let (request_id, stream) = runtime
        .generate_stream("chat-7b", "go", &SelectionHints::default(), None)
        .await
        .unwrap();
    let mut rx = stream.into_inner();

    let mut deltas = 0;
    while deltas < 3 {
        match rx.recv().await.expect("stream ended early").payload {
            StreamPayload::Delta { .. } => deltas += 1,
            other => panic!("unexpected payload before cancel: {other:?}"),
        }
    }
    assert!(runtime.cancel_generation(request_id).await);

    let finish = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await.expect("stream ended without terminal").payload {
                StreamPayload::Delta { .. } => continue,
                StreamPayload::Finish { finish_reason, .. } => break finish_reason,
                other => panic!("unexpected payload: {other:?}"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(finish, FinishReason::Cancel);

    // The scheduler records the generation as cancelled.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if runtime.scheduler().stats().total_cancelled >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("cancellation never reached the scheduler stats");
}

#[tokio::test]
async fn unknown_model_is_model_not_found() {
    let cache = tempfile::tempdir().unwrap();
    let manifest = ready_manifest(cache.path(), &[]);
    let runtime = ModelRuntime::with_probe(
        manifest,
        registry_with(MockLlama::new(&["x"])),
        runtime_config(cache.path()),
        probe(),
    );

    let err = runtime
        .generate("nope", "hi", &SelectionHints::default(), None)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::ModelNotFound);
}

#[tokio::test]
async fn absent_adapter_surfaces_runtime_not_available() {
    let cache = tempfile::tempdir().unwrap();
    let manifest = ready_manifest(cache.path(), &[]);
    // The probe claims llama.cpp is installed, but this build carries no
    // adapter for it: selection succeeds, execution cannot.
    let mut registry = AdapterRegistry::new();
    registry.register_absent(BackendKind::LlamaCpp);
    let runtime =
        ModelRuntime::with_probe(manifest, registry, runtime_config(cache.path()), probe());

    let err = runtime
        .generate("chat-7b", "hi", &SelectionHints::default(), None)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::RuntimeNotAvailable);
}

#[tokio::test]
async fn selection_report_is_returned_for_display() {
    let cache = tempfile::tempdir().unwrap();
    let manifest = ready_manifest(cache.path(), &[]);
    let runtime = ModelRuntime::with_probe(
        manifest,
        registry_with(MockLlama::new(&["x"])),
        runtime_config(cache.path()),
        probe(),
    );

    let report = runtime
        .select("chat-7b", &SelectionHints::default())
        .unwrap();
    let decision = report.final_decision.as_ref().unwrap();
    assert_eq!(decision.backend, BackendKind::LlamaCpp);
    assert!(report.candidates.iter().any(|c| c.accepted));
}
