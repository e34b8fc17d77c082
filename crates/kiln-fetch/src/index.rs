//! `models.json` — the index of installed model versions.

use chrono::Utc;
use semver::Version;
use std::fs;
use std::io;
use std::path::PathBuf;

use kiln_types::LocalModel;

/// In-memory copy of the installed-models index, persisted as pretty JSON.
///
/// Writes go through a tmp file and rename so a crash never leaves a torn
/// index; a missing or unreadable file is treated as empty.
#[derive(Debug)]
pub struct ModelIndex {
    path: PathBuf,
    entries: Vec<LocalModel>,
}

impl ModelIndex {
    pub fn load(path: PathBuf) -> Self {
        let entries = fs::read_to_string(&path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default();
        Self { path, entries }
    }

    pub fn entries(&self) -> &[LocalModel] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> &mut Vec<LocalModel> {
        &mut self.entries
    }

    pub fn find(&self, model_id: &str, version: &Version) -> Option<&LocalModel> {
        self.entries
            .iter()
            .find(|m| m.model_id == model_id && &m.version == version)
    }

    /// Insert or replace the entry for `(model_id, version)`.
    pub fn record_install(
        &mut self,
        model_id: &str,
        version: &Version,
        path: &std::path::Path,
        size_bytes: u64,
    ) {
        let now = Utc::now();
        self.remove(model_id, version);
        self.entries.push(LocalModel {
            model_id: model_id.to_owned(),
            version: version.clone(),
            path: path.display().to_string(),
            size_bytes,
            installed_at: now,
            last_used_at: now,
        });
    }

    /// Bump `last_used_at` for LRU accounting.
    pub fn touch(&mut self, model_id: &str, version: &Version) {
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|m| m.model_id == model_id && &m.version == version)
        {
            entry.last_used_at = Utc::now();
        }
    }

    pub fn remove(&mut self, model_id: &str, version: &Version) {
        self.entries
            .retain(|m| !(m.model_id == model_id && &m.version == version));
    }

    /// Persist the index atomically.
    pub fn save(&self) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.entries)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)
    }
}
