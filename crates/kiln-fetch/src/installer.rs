//! Single-flight install state machine.
//!
//! Installs are keyed by `(model_id, version)`.  Concurrent submitters for
//! the same key share the first in-flight install: they subscribe to the same
//! progress stream and observe the same terminal outcome.  Cross-process
//! contention serializes on the version directory's `.lock` file.
//!
//! Phase order is `downloading → verifying → extracting → ready`, with
//! `extracting` skipped when no artifact is an archive.  Any non-terminal
//! phase may fall to `failed` or `cancelled`.  The readiness sentinel is on
//! disk before the `ready` event is emitted.

use semver::Version;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use kiln_types::{Artifact, CoreError, ErrorCode, InstallPhase, InstallProgress, LocalModel, ModelItem};

use crate::extract::{extract_archive, promote_staged};
use crate::fetcher::{ArtifactFetcher, FetchedArtifact};
use crate::index::ModelIndex;
use crate::layout::CacheLayout;
use crate::lock::VersionLock;
use crate::progress::ProgressSender;

/// Identifies one install: a model at a specific version.
pub type InstallKey = (String, Version);

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Installer configuration.
#[derive(Debug, Clone)]
pub struct InstallerConfig {
    /// Base URL that artifact `path`s are resolved against.
    pub base_url: String,
    pub retry_count: usize,
    pub retry_delay: Duration,
    /// Cache size threshold that triggers LRU eviction; `None` disables it.
    pub max_cache_bytes: Option<u64>,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            retry_count: 3,
            retry_delay: Duration::from_secs(2),
            max_cache_bytes: None,
        }
    }
}

/// A caller's view of one install: its request id plus the progress stream.
pub struct InstallTicket {
    pub request_id: Uuid,
    rx: broadcast::Receiver<InstallProgress>,
}

impl InstallTicket {
    /// Next progress event; `None` once the stream is closed.
    ///
    /// A lagged subscriber skips coalesced updates but never the terminal
    /// event, which is the last message on the channel.
    pub async fn recv(&mut self) -> Option<InstallProgress> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Drain the stream and return its terminal event.
    pub async fn wait(mut self) -> Option<InstallProgress> {
        while let Some(event) = self.recv().await {
            if event.phase.is_terminal() {
                return Some(event);
            }
        }
        None
    }
}

struct InstallHandle {
    request_id: Uuid,
    events_tx: broadcast::Sender<InstallProgress>,
    cancel_tx: watch::Sender<bool>,
}

/// The install pipeline.
///
/// Shared-immutable after construction; clone the surrounding `Arc` to hand
/// it to collaborators.
pub struct Installer {
    layout: CacheLayout,
    fetcher: ArtifactFetcher,
    config: InstallerConfig,
    registry: Arc<Mutex<HashMap<InstallKey, InstallHandle>>>,
    index: Arc<Mutex<ModelIndex>>,
}

impl Installer {
    pub fn new(layout: CacheLayout, config: InstallerConfig) -> Self {
        let fetcher = ArtifactFetcher::new(
            config.base_url.clone(),
            config.retry_count,
            config.retry_delay,
        );
        let index = ModelIndex::load(layout.index_file());
        Self {
            layout,
            fetcher,
            config,
            registry: Arc::new(Mutex::new(HashMap::new())),
            index: Arc::new(Mutex::new(index)),
        }
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    /// Delete leftovers of interrupted installs.  Call once at startup.
    pub fn recover(&self) -> std::io::Result<()> {
        self.layout.recover()
    }

    /// Currently installed versions, per the index.
    pub async fn installed(&self) -> Vec<LocalModel> {
        self.index.lock().await.entries().to_vec()
    }

    /// Start (or join) the install for `item`.
    ///
    /// Returns a ticket on the shared progress stream.  If the version is
    /// already ready on disk, the ticket carries a single `ready` event and
    /// no network I/O happens.
    pub async fn install(&self, item: &ModelItem) -> InstallTicket {
        let key: InstallKey = (item.id.clone(), item.version.clone());

        {
            let registry = self.registry.lock().await;
            if let Some(handle) = registry.get(&key) {
                return InstallTicket {
                    request_id: handle.request_id,
                    rx: handle.events_tx.subscribe(),
                };
            }
        }

        if self.layout.is_ready(&item.id, &item.version) && self.artifacts_present(item) {
            return self.ready_ticket(item).await;
        }

        let mut registry = self.registry.lock().await;
        // Someone may have won the race while the ready check ran.
        if let Some(handle) = registry.get(&key) {
            return InstallTicket {
                request_id: handle.request_id,
                rx: handle.events_tx.subscribe(),
            };
        }

        let request_id = Uuid::new_v4();
        let (events_tx, rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        registry.insert(
            key.clone(),
            InstallHandle {
                request_id,
                events_tx: events_tx.clone(),
                cancel_tx,
            },
        );
        drop(registry);

        info!(model_id = %item.id, version = %item.version, %request_id, "starting install");

        let worker = InstallWorker {
            layout: self.layout.clone(),
            fetcher: self.fetcher.clone(),
            registry: Arc::clone(&self.registry),
            index: Arc::clone(&self.index),
            max_cache_bytes: self.config.max_cache_bytes,
            key,
            item: item.clone(),
            progress: ProgressSender::new(
                events_tx,
                item.id.clone(),
                item.version.clone(),
                request_id,
            ),
            cancel_rx,
        };
        tokio::spawn(worker.run());

        InstallTicket { request_id, rx }
    }

    /// Request cancellation of an in-flight install.
    ///
    /// Returns `false` when no install for the key is running.  The terminal
    /// `cancelled` event arrives on the progress stream once the worker
    /// observes the signal.
    pub async fn cancel(&self, model_id: &str, version: &Version) -> bool {
        let registry = self.registry.lock().await;
        match registry.get(&(model_id.to_owned(), version.clone())) {
            Some(handle) => {
                let _ = handle.cancel_tx.send(true);
                info!(model_id, %version, "install cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Mark a ready version as active.
    pub fn activate(&self, model_id: &str, version: &Version) -> Result<(), CoreError> {
        if !self.layout.is_ready(model_id, version) {
            return Err(CoreError::model_not_found(model_id));
        }
        self.layout
            .activate(model_id, version)
            .map_err(|e| CoreError::from_io("writing active pointer", &e))
    }

    fn artifacts_present(&self, item: &ModelItem) -> bool {
        let version_dir = self.layout.version_dir(&item.id, &item.version);
        item.required_artifacts
            .iter()
            .all(|a| version_dir.join(&a.path).is_file())
    }

    async fn ready_ticket(&self, item: &ModelItem) -> InstallTicket {
        let request_id = Uuid::new_v4();
        let (events_tx, rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let mut progress = ProgressSender::new(
            events_tx,
            item.id.clone(),
            item.version.clone(),
            request_id,
        );
        let total = item.required_size();
        progress.set_total_bytes(total);
        progress.terminal(InstallPhase::Ready, None);

        let mut index = self.index.lock().await;
        index.touch(&item.id, &item.version);
        if let Err(err) = index.save() {
            warn!(error = %err, "failed to persist model index");
        }

        InstallTicket { request_id, rx }
    }
}

// ── Install worker ────────────────────────────────────────────────────────────

struct InstallWorker {
    layout: CacheLayout,
    fetcher: ArtifactFetcher,
    registry: Arc<Mutex<HashMap<InstallKey, InstallHandle>>>,
    index: Arc<Mutex<ModelIndex>>,
    max_cache_bytes: Option<u64>,
    key: InstallKey,
    item: ModelItem,
    progress: ProgressSender,
    cancel_rx: watch::Receiver<bool>,
}

impl InstallWorker {
    async fn run(mut self) {
        let result = self.execute().await;

        // Deregister before the terminal goes out: a caller that misses the
        // registry entry decides from disk state, which is final by now.
        let mut registry = self.registry.lock().await;
        registry.remove(&self.key);
        match result {
            Ok(()) => self.progress.terminal(InstallPhase::Ready, None),
            Err(err) if err.code == ErrorCode::TaskCancelled => {
                info!(model_id = %self.key.0, version = %self.key.1, "install cancelled");
                self.progress.terminal(InstallPhase::Cancelled, None);
            }
            Err(err) => {
                warn!(model_id = %self.key.0, version = %self.key.1, error = %err, "install failed");
                self.progress.terminal(InstallPhase::Failed, Some(err));
            }
        }
    }

    async fn execute(&mut self) -> Result<(), CoreError> {
        let (model_id, version) = (self.key.0.clone(), self.key.1.clone());
        let _lock = VersionLock::acquire(self.layout.lock_file(&model_id, &version)).await?;

        // Another process may have finished this version while we waited.
        if self.layout.is_ready(&model_id, &version) {
            let mut index = self.index.lock().await;
            index.touch(&model_id, &version);
            let _ = index.save();
            return Ok(());
        }

        let version_dir = self.layout.version_dir(&model_id, &version);
        tokio::fs::create_dir_all(&version_dir)
            .await
            .map_err(|e| CoreError::from_io("creating version directory", &e))?;

        let fetched = self.download(&version_dir).await?;
        self.verify_and_place(&version_dir, fetched).await?;
        self.extract(&version_dir).await?;
        self.finalize(&version_dir, &model_id, &version).await
    }

    fn check_cancel(&self) -> Result<(), CoreError> {
        if *self.cancel_rx.borrow() {
            Err(CoreError::task_cancelled())
        } else {
            Ok(())
        }
    }

    /// Downloading phase: fetch every artifact to a tmp sibling.
    async fn download(
        &mut self,
        version_dir: &Path,
    ) -> Result<Vec<(Artifact, FetchedArtifact)>, CoreError> {
        self.check_cancel()?;
        // Artifacts materialized by archive extraction are not fetched.
        let required: Vec<Artifact> = self
            .item
            .required_artifacts
            .iter()
            .filter(|a| a.from_archive.is_none())
            .cloned()
            .collect();
        let optional: Vec<Artifact> = self
            .item
            .optional_artifacts
            .iter()
            .filter(|a| a.from_archive.is_none())
            .cloned()
            .collect();
        let total: u64 = required
            .iter()
            .chain(optional.iter())
            .map(|a| a.size)
            .sum();
        self.progress.set_total_bytes(total);
        self.progress.phase(InstallPhase::Downloading);

        let mut fetched: Vec<(Artifact, FetchedArtifact)> = Vec::new();
        let mut base: u64 = 0;

        let fetch_result: Result<(), CoreError> = async {
            for artifact in &required {
                self.check_cancel()?;
                let file = self
                    .fetcher
                    .fetch(artifact, version_dir, base, &mut self.progress, &self.cancel_rx)
                    .await?;
                base += artifact.size;
                fetched.push((artifact.clone(), file));
            }
            for artifact in &optional {
                self.check_cancel()?;
                match self
                    .fetcher
                    .fetch(artifact, version_dir, base, &mut self.progress, &self.cancel_rx)
                    .await
                {
                    Ok(file) => fetched.push((artifact.clone(), file)),
                    Err(err) if err.code == ErrorCode::TaskCancelled => return Err(err),
                    Err(err) => {
                        // Optional artifacts are best-effort.
                        warn!(artifact = %artifact.name, error = %err, "optional artifact skipped");
                    }
                }
                base += artifact.size;
            }
            Ok(())
        }
        .await;

        if let Err(err) = fetch_result {
            Self::discard_tmp(&fetched).await;
            return Err(err);
        }
        Ok(fetched)
    }

    /// Verifying phase: compare streamed digests, then rename tmp → final.
    ///
    /// All digests are checked before the first rename so a mismatch leaves
    /// no artifact under its final name.
    async fn verify_and_place(
        &mut self,
        _version_dir: &Path,
        fetched: Vec<(Artifact, FetchedArtifact)>,
    ) -> Result<(), CoreError> {
        self.progress.phase(InstallPhase::Verifying);
        if let Err(err) = self.check_cancel() {
            Self::discard_tmp(&fetched).await;
            return Err(err);
        }

        for (artifact, file) in &fetched {
            if file.digest != artifact.sha256 {
                let err = CoreError::verify_failed(&artifact.name, &artifact.sha256, &file.digest);
                Self::discard_tmp(&fetched).await;
                return Err(err);
            }
        }

        for (_, file) in &fetched {
            tokio::fs::rename(&file.tmp_path, &file.final_path)
                .await
                .map_err(|e| CoreError::from_io("renaming artifact into place", &e))?;
        }
        Ok(())
    }

    /// Extracting phase; skipped when no artifact is an archive.
    async fn extract(&mut self, version_dir: &Path) -> Result<(), CoreError> {
        let archives: Vec<Artifact> = self
            .item
            .all_artifacts()
            .filter(|a| a.is_archive())
            .cloned()
            .collect();
        if archives.is_empty() {
            return Ok(());
        }

        self.progress.phase(InstallPhase::Extracting);
        self.check_cancel()?;

        let stage = self.layout.stage_dir(&self.key.0, &self.key.1);
        let expected: Vec<Artifact> = self.item.all_artifacts().cloned().collect();
        let version_dir = version_dir.to_path_buf();

        let result = tokio::task::spawn_blocking(move || {
            for archive in &archives {
                let archive_path = version_dir.join(&archive.path);
                extract_archive(&archive_path, &archive.format, &stage)?;
            }
            promote_staged(&stage, &version_dir, &expected)
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(join_err) => Err(CoreError::download_failed(format!(
                "extraction task panicked: {join_err}"
            ))),
        }
    }

    /// Sentinel, index and eviction.  The sentinel reaches disk before the
    /// ready event is emitted.
    async fn finalize(
        &mut self,
        version_dir: &Path,
        model_id: &str,
        version: &Version,
    ) -> Result<(), CoreError> {
        let sentinel = self.layout.sentinel(model_id, version);
        let dir = version_dir.to_path_buf();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            std::fs::write(&sentinel, b"")?;
            // Make the sentinel durable before anyone is told about it.
            std::fs::File::open(&dir)?.sync_all()
        })
        .await
        .map_err(|e| CoreError::download_failed(format!("sentinel task panicked: {e}")))?
        .map_err(|e| CoreError::from_io("writing readiness sentinel", &e))?;

        let size = self.item.required_size();
        let mut index = self.index.lock().await;
        index.record_install(model_id, version, version_dir, size);
        if let Some(max_bytes) = self.max_cache_bytes {
            if let Err(err) = self.layout.evict_lru(index.entries_mut(), max_bytes) {
                warn!(error = %err, "LRU eviction failed");
            }
        }
        if let Err(err) = index.save() {
            warn!(error = %err, "failed to persist model index");
        }
        Ok(())
    }

    async fn discard_tmp(fetched: &[(Artifact, FetchedArtifact)]) {
        for (_, file) in fetched {
            let _ = tokio::fs::remove_file(&file.tmp_path).await;
        }
    }
}
