//! The runtime root object.
//!
//! `ModelRuntime` ties the manifest, installer, scheduler, selector and
//! adapter registry together.  It is constructed explicitly and passed to
//! collaborators; tests instantiate as many independent runtimes as they
//! need.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};
use uuid::Uuid;

use kiln_fetch::{CacheLayout, InstallTicket, Installer, InstallerConfig};
use kiln_types::{
    ArtifactRole, CompletionResult, CoreError, GenerationConfig, InstallPhase, Manifest, ModelItem,
    StreamEvent, StreamPayload,
};

use crate::adapter::{AdapterRegistry, LoadParams, SessionHandle};
use crate::config::RuntimeConfig;
use crate::scheduler::{QueueCaps, Scheduler, TaskId, TaskSpec, TaskType};
use crate::selector::{select, HostProbe, SelectionHints, SelectionReport};
use crate::stream::{collect, normalize, StreamConfig};

/// Model lifecycle runtime: resolve, select, install, execute.
pub struct ModelRuntime {
    manifest: Arc<Manifest>,
    installer: Arc<Installer>,
    scheduler: Scheduler,
    adapters: AdapterRegistry,
    probe: HostProbe,
    config: RuntimeConfig,
    /// Loaded model sessions, keyed by model id.
    sessions: Mutex<HashMap<String, SessionHandle>>,
    /// In-flight generations, request id → scheduler task.
    generations: Arc<Mutex<HashMap<Uuid, TaskId>>>,
}

impl ModelRuntime {
    /// Construct a runtime, probing the host.
    pub fn new(manifest: Manifest, adapters: AdapterRegistry, config: RuntimeConfig) -> Self {
        let mut probe = HostProbe::detect(adapters.installed_versions());
        probe.accel_stable_backends = adapters.accel_stable_backends();
        Self::with_probe(manifest, adapters, config, probe)
    }

    /// Construct a runtime with an explicit probe.  This is the test entry
    /// point; selection stays deterministic against a hand-built probe.
    pub fn with_probe(
        manifest: Manifest,
        adapters: AdapterRegistry,
        config: RuntimeConfig,
        probe: HostProbe,
    ) -> Self {
        let layout = CacheLayout::new(&config.cache_dir);
        let installer = Installer::new(
            layout,
            InstallerConfig {
                base_url: config.artifact_base_url.clone(),
                retry_count: config.download_retry_count,
                retry_delay: config.download_retry_delay,
                max_cache_bytes: config.max_cache_bytes,
            },
        );
        if let Err(err) = installer.recover() {
            warn!(error = %err, "cache recovery failed");
        }
        let scheduler = Scheduler::new(config.max_total_concurrent, QueueCaps::default());

        info!(
            models = manifest.models.len(),
            cache_dir = %config.cache_dir.display(),
            "model runtime ready"
        );

        Self {
            manifest: Arc::new(manifest),
            installer: Arc::new(installer),
            scheduler,
            adapters,
            probe,
            config,
            sessions: Mutex::new(HashMap::new()),
            generations: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn installer(&self) -> &Arc<Installer> {
        &self.installer
    }

    /// Look up a manifest item by id.
    pub fn resolve(&self, model_id: &str) -> Result<&ModelItem, CoreError> {
        self.manifest
            .find(model_id)
            .ok_or_else(|| CoreError::model_not_found(model_id))
    }

    /// Run selection for a model; the report is returned on success and
    /// failure alike.
    pub fn select(
        &self,
        model_id: &str,
        hints: &SelectionHints,
    ) -> Result<SelectionReport, CoreError> {
        let item = self.resolve(model_id)?;
        Ok(select(item, &self.probe, hints))
    }

    /// Install a model through the download queue.
    ///
    /// Returns once the task is admitted; the ticket streams the install's
    /// progress.  Cancelling the scheduler task propagates into the install.
    pub async fn install(&self, model_id: &str) -> Result<InstallTicket, CoreError> {
        let item = self.resolve(model_id)?.clone();
        let installer = Arc::clone(&self.installer);
        let (ticket_tx, ticket_rx) = oneshot::channel();

        self.scheduler
            .submit(TaskSpec::new(TaskType::Download), move |mut cancel| {
                Box::pin(async move {
                    let caller_ticket = installer.install(&item).await;
                    // Second subscription to the same flight drives this task.
                    let watch_ticket = installer.install(&item).await;
                    let _ = ticket_tx.send(caller_ticket);

                    tokio::select! {
                        terminal = watch_ticket.wait() => match terminal {
                            Some(event) if event.phase == InstallPhase::Ready => {
                                Ok(serde_json::Value::Null)
                            }
                            Some(event) if event.phase == InstallPhase::Cancelled => {
                                Err(CoreError::task_cancelled())
                            }
                            Some(event) => Err(event
                                .error
                                .unwrap_or_else(|| CoreError::download_failed("install failed"))),
                            None => Err(CoreError::download_failed(
                                "install progress stream closed unexpectedly",
                            )),
                        },
                        _ = cancel.cancelled() => {
                            installer.cancel(&item.id, &item.version).await;
                            Err(CoreError::task_cancelled())
                        }
                    }
                })
            })
            .await?;

        ticket_rx.await.map_err(|_| {
            CoreError::download_failed("install task dropped before producing a ticket")
        })
    }

    /// Make sure the model's artifacts are ready on disk, installing if
    /// needed.
    async fn ensure_installed(&self, model_id: &str) -> Result<(), CoreError> {
        let item = self.resolve(model_id)?;
        if self.installer.layout().is_ready(&item.id, &item.version) {
            return Ok(());
        }
        let ticket = self.install(model_id).await?;
        match ticket.wait().await {
            Some(event) if event.phase == InstallPhase::Ready => Ok(()),
            Some(event) if event.phase == InstallPhase::Cancelled => {
                Err(CoreError::task_cancelled())
            }
            Some(event) => Err(event
                .error
                .unwrap_or_else(|| CoreError::download_failed("install failed"))),
            None => Err(CoreError::download_failed(
                "install progress stream closed unexpectedly",
            )),
        }
    }

    /// Streaming generation.
    ///
    /// Resolves, selects, installs as needed, loads (or reuses) the model
    /// session, and submits the generation on the LLM queue.  The returned
    /// stream carries a stable request id, strictly increasing sequence
    /// numbers, and exactly one terminal event.
    pub async fn generate_stream(
        &self,
        model_id: &str,
        prompt: &str,
        hints: &SelectionHints,
        overrides: Option<GenerationConfig>,
    ) -> Result<(Uuid, ReceiverStream<StreamEvent>), CoreError> {
        let item = self.resolve(model_id)?.clone();
        let report = self.select(model_id, hints)?;
        let decision = match report.final_decision {
            Ok(decision) => decision,
            Err(err) => return Err(err),
        };

        self.ensure_installed(model_id).await?;

        let adapter = self
            .adapters
            .get(decision.backend)
            .ok_or_else(|| {
                CoreError::runtime_not_available(
                    model_id,
                    format!("backend {} has no adapter on this build", decision.backend),
                )
            })?;

        // One session per model, reused across requests; the LLM queue cap
        // keeps it single-tenant while generating.
        let session = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get(&item.id) {
                Some(session) => session.clone(),
                None => {
                    let session = adapter
                        .load(LoadParams {
                            model_path: self.model_artifact_path(&item),
                            context_length: decision.context_length,
                            threads: decision.threads,
                            gpu_layers: decision.gpu_layers,
                            quantization: decision.quantization.clone(),
                        })
                        .await?;
                    sessions.insert(item.id.clone(), session.clone());
                    session
                }
            }
        };

        let generation_config = overrides
            .or_else(|| item.default_generation_config.clone())
            .unwrap_or_default();
        let stream_config = StreamConfig {
            stop_strings: generation_config.stop_strings.clone(),
            emit_stop_fragment: self.config.emit_stop_fragment,
        };

        let request_id = Uuid::new_v4();
        let prompt = prompt.to_owned();
        let (out_tx, out_rx) = tokio::sync::mpsc::channel::<StreamEvent>(64);
        let generations = Arc::clone(&self.generations);

        let task_id = self
            .scheduler
            .submit(TaskSpec::new(TaskType::Llm), move |cancel| {
                Box::pin(async move {
                    let raw = adapter
                        .stream_generate(&session, &prompt, &generation_config, cancel)
                        .await?;
                    let mut events = normalize(request_id, stream_config, raw);
                    let mut cancelled = false;
                    while let Some(event) = events.recv().await {
                        if let StreamPayload::Finish { finish_reason, .. } = &event.payload {
                            cancelled = *finish_reason == kiln_types::FinishReason::Cancel;
                        }
                        if out_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    generations.lock().await.remove(&request_id);
                    if cancelled {
                        Err(CoreError::task_cancelled())
                    } else {
                        Ok(serde_json::Value::Null)
                    }
                })
            })
            .await?;

        self.generations.lock().await.insert(request_id, task_id);
        info!(%request_id, task_id, model_id, "generation submitted");

        Ok((request_id, ReceiverStream::new(out_rx)))
    }

    /// Non-streaming generation: collect the stream into
    /// `{text, finishReason, stats}`.
    pub async fn generate(
        &self,
        model_id: &str,
        prompt: &str,
        hints: &SelectionHints,
        overrides: Option<GenerationConfig>,
    ) -> Result<CompletionResult, CoreError> {
        let (_, stream) = self
            .generate_stream(model_id, prompt, hints, overrides)
            .await?;
        collect(stream.into_inner()).await
    }

    /// Cancel an in-flight generation by request id.
    pub async fn cancel_generation(&self, request_id: Uuid) -> bool {
        let task_id = { self.generations.lock().await.get(&request_id).copied() };
        match task_id {
            Some(task_id) => {
                let accepted = self.scheduler.cancel(task_id).await;
                if !accepted {
                    // Already terminal; drop the stale mapping.
                    self.generations.lock().await.remove(&request_id);
                }
                accepted
            }
            None => false,
        }
    }

    /// Unload a cached model session, if any.
    pub async fn unload(&self, model_id: &str) -> Result<(), CoreError> {
        let session = { self.sessions.lock().await.remove(model_id) };
        if let Some(session) = session {
            if let Some(adapter) = self.adapters.get(session.backend) {
                adapter.unload(session).await?;
            }
        }
        Ok(())
    }

    /// Path to the model-role artifact inside the version directory.
    fn model_artifact_path(&self, item: &ModelItem) -> std::path::PathBuf {
        let version_dir = self
            .installer
            .layout()
            .version_dir(&item.id, &item.version);
        item.required_artifacts
            .iter()
            .find(|a| a.role == ArtifactRole::Model)
            .map(|a| version_dir.join(&a.path))
            .unwrap_or(version_dir)
    }
}
