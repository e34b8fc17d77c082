//! On-disk cache layout.
//!
//! ```text
//! {root}/
//!   {modelId}/
//!     {version}/
//!       <artifact files>
//!       .ready            (sentinel, written last)
//!       .lock             (cross-process lock file)
//!       .stage/           (archive staging, transient)
//!     active              (pointer file naming a version directory)
//!   models.json           (index of installed models)
//! ```
//!
//! A version directory lacking `.ready` is invalid by definition and is
//! garbage-collected on startup.

use semver::Version;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use kiln_types::LocalModel;

pub const READY_SENTINEL: &str = ".ready";
pub const LOCK_FILE: &str = ".lock";
pub const STAGE_DIR: &str = ".stage";
pub const ACTIVE_POINTER: &str = "active";
pub const INDEX_FILE: &str = "models.json";

/// Path helpers over a cache root.  Pure path math except where noted.
#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn model_dir(&self, model_id: &str) -> PathBuf {
        self.root.join(model_id)
    }

    pub fn version_dir(&self, model_id: &str, version: &Version) -> PathBuf {
        self.model_dir(model_id).join(version.to_string())
    }

    pub fn sentinel(&self, model_id: &str, version: &Version) -> PathBuf {
        self.version_dir(model_id, version).join(READY_SENTINEL)
    }

    pub fn lock_file(&self, model_id: &str, version: &Version) -> PathBuf {
        self.version_dir(model_id, version).join(LOCK_FILE)
    }

    pub fn stage_dir(&self, model_id: &str, version: &Version) -> PathBuf {
        self.version_dir(model_id, version).join(STAGE_DIR)
    }

    pub fn active_pointer(&self, model_id: &str) -> PathBuf {
        self.model_dir(model_id).join(ACTIVE_POINTER)
    }

    pub fn index_file(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    /// Sibling temp path for an in-flight artifact download.
    pub fn tmp_path(final_path: &Path, suffix: &str) -> PathBuf {
        let name = final_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        final_path.with_file_name(format!("{name}.tmp.{suffix}"))
    }

    /// Whether the readiness sentinel is present for `(model_id, version)`.
    pub fn is_ready(&self, model_id: &str, version: &Version) -> bool {
        self.sentinel(model_id, version).exists()
    }

    // ── Activation pointer ───────────────────────────────────────────────────

    /// Point `active` at `version`, atomically (tmp + rename).
    pub fn activate(&self, model_id: &str, version: &Version) -> io::Result<()> {
        let pointer = self.active_pointer(model_id);
        let tmp = pointer.with_file_name(format!("{ACTIVE_POINTER}.tmp"));
        fs::create_dir_all(self.model_dir(model_id))?;
        fs::write(&tmp, version.to_string())?;
        fs::rename(&tmp, &pointer)
    }

    /// Read the currently activated version, if any.
    pub fn active_version(&self, model_id: &str) -> Option<Version> {
        let text = fs::read_to_string(self.active_pointer(model_id)).ok()?;
        text.trim().parse().ok()
    }

    // ── Startup recovery ─────────────────────────────────────────────────────

    /// Delete leftovers of interrupted installs.
    ///
    /// Removes orphan `*.tmp.*` files and `.stage/` directories everywhere,
    /// and whole version directories that lack the readiness sentinel.
    /// Directories holding a live `.lock` belong to another process and are
    /// skipped.
    pub fn recover(&self) -> io::Result<()> {
        if !self.root.exists() {
            return Ok(());
        }
        for model_entry in fs::read_dir(&self.root)? {
            let model_entry = model_entry?;
            if !model_entry.file_type()?.is_dir() {
                continue;
            }
            for version_entry in fs::read_dir(model_entry.path())? {
                let version_entry = version_entry?;
                let version_path = version_entry.path();
                if !version_entry.file_type()?.is_dir() {
                    continue;
                }
                if is_locked_elsewhere(&version_path.join(LOCK_FILE)) {
                    debug!(path = %version_path.display(), "skipping locked version dir");
                    continue;
                }
                if !version_path.join(READY_SENTINEL).exists() {
                    warn!(path = %version_path.display(), "removing incomplete version dir");
                    fs::remove_dir_all(&version_path)?;
                    continue;
                }
                sweep_orphans(&version_path)?;
            }
        }
        Ok(())
    }

    // ── LRU eviction ─────────────────────────────────────────────────────────

    /// Evict least-recently-used ready versions until the cache fits
    /// `max_total_bytes`.  The activated version of a model is never evicted.
    ///
    /// Returns the evicted entries; `index` is updated in place.
    pub fn evict_lru(
        &self,
        index: &mut Vec<LocalModel>,
        max_total_bytes: u64,
    ) -> io::Result<Vec<LocalModel>> {
        let mut evicted = Vec::new();
        let mut total: u64 = index.iter().map(|m| m.size_bytes).sum();
        while total > max_total_bytes {
            let candidate = index
                .iter()
                .enumerate()
                .filter(|(_, m)| self.active_version(&m.model_id).as_ref() != Some(&m.version))
                .min_by_key(|(_, m)| m.last_used_at);
            let Some((pos, _)) = candidate else {
                break;
            };
            let victim = index.remove(pos);
            let dir = self.version_dir(&victim.model_id, &victim.version);
            debug!(model_id = %victim.model_id, version = %victim.version, "evicting LRU version");
            if dir.exists() {
                fs::remove_dir_all(&dir)?;
            }
            total = total.saturating_sub(victim.size_bytes);
            evicted.push(victim);
        }
        Ok(evicted)
    }
}

/// Remove `*.tmp.*` files and a stale `.stage/` inside a ready version dir.
fn sweep_orphans(version_path: &Path) -> io::Result<()> {
    for entry in fs::read_dir(version_path)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == STAGE_DIR && entry.file_type()?.is_dir() {
            warn!(path = %entry.path().display(), "removing orphan stage dir");
            fs::remove_dir_all(entry.path())?;
        } else if name.contains(".tmp.") && entry.file_type()?.is_file() {
            warn!(path = %entry.path().display(), "removing orphan tmp file");
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

/// Best-effort check whether another process currently holds the lock file.
fn is_locked_elsewhere(lock_path: &Path) -> bool {
    if !lock_path.exists() {
        return false;
    }
    match fs::OpenOptions::new().read(true).write(true).open(lock_path) {
        Ok(file) => {
            let mut lock = fd_lock::RwLock::new(file);
            lock.try_write().is_err()
        }
        Err(_) => true,
    }
}
