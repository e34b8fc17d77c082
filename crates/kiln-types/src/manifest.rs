//! Typed model manifest.
//!
//! The manifest is the declarative input of the whole runtime: it describes
//! which models exist, which artifacts make them up, and which backends and
//! platforms they run on.  Parsed manifests are immutable and shared by
//! reference; unknown JSON fields are preserved in `extra` maps so a
//! parse/serialize round-trip is non-lossy.

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::error::CoreError;

/// The context lengths the downgrade ladder understands, largest first.
pub const CONTEXT_LADDER: [u32; 3] = [8192, 4096, 2048];

/// Model task families.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ModelType {
    Llm,
    Embedding,
    Ocr,
    Stt,
    Tts,
    Classification,
    Custom,
}

/// Known inference backends.
///
/// A closed set: a manifest naming an unknown backend fails to parse, which
/// is how the "every hint names a known backend" invariant is enforced.
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
    strum::EnumString,
)]
pub enum BackendKind {
    #[serde(rename = "llama.cpp")]
    #[strum(serialize = "llama.cpp")]
    LlamaCpp,
    #[serde(rename = "onnx")]
    #[strum(serialize = "onnx")]
    Onnx,
    #[serde(rename = "tflite")]
    #[strum(serialize = "tflite")]
    Tflite,
    #[serde(rename = "whisper")]
    #[strum(serialize = "whisper")]
    Whisper,
    #[serde(rename = "vosk")]
    #[strum(serialize = "vosk")]
    Vosk,
    #[serde(rename = "mediapipe")]
    #[strum(serialize = "mediapipe")]
    MediaPipe,
}

/// Host platform tags used in manifest filters.
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
pub enum Platform {
    Android,
    Ios,
    Macos,
    Linux,
    Windows,
}

impl Platform {
    /// Mobile platforms default to the onnx backend when no hint matches.
    pub fn is_mobile(self) -> bool {
        matches!(self, Platform::Android | Platform::Ios)
    }
}

/// The role a file plays within a model package.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ArtifactRole {
    Model,
    Tokenizer,
    Config,
    Vocab,
    Adapter,
}

/// One file referenced by a manifest entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub name: String,
    pub role: ArtifactRole,
    pub format: String,
    /// Path relative to the version directory.
    pub path: String,
    /// Decimal byte count.
    pub size: u64,
    /// Lowercase hex of the 32-byte digest.
    pub sha256: String,
    /// Name of the archive artifact that produces this file on extraction.
    /// Such artifacts are not downloaded directly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_archive: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Artifact {
    /// Archives are verified, then extracted through a staging directory.
    pub fn is_archive(&self) -> bool {
        matches!(self.format.as_str(), "zip" | "tar.gz" | "tgz")
    }
}

/// Default generation parameters shipped with an LLM entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_strings: Vec<String>,
}

/// One model entry of the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelItem {
    pub id: String,
    #[serde(rename = "type")]
    pub model_type: ModelType,
    pub version: Version,
    /// Preference-ordered backend hints; order is significant.
    #[serde(default)]
    pub backend_hints: Vec<BackendKind>,
    #[serde(default)]
    pub platforms: BTreeSet<Platform>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub min_sdk_version: BTreeMap<Platform, u32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub min_backend_version: BTreeMap<BackendKind, Version>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantization: Option<String>,
    /// Quantization variants the downgrade ladder may substitute.  Only
    /// values listed here are ever tried; nothing is guessed at runtime.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variants: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_length: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rope_scaling: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rope_theta: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_generation_config: Option<GenerationConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_template: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub special_tokens: BTreeMap<String, String>,
    pub required_artifacts: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub optional_artifacts: Vec<Artifact>,
    /// Estimated resident memory at the manifest's own quantization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_memory_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_gpu_layers: Option<u32>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ModelItem {
    /// Required plus optional artifacts, in manifest order.
    pub fn all_artifacts(&self) -> impl Iterator<Item = &Artifact> {
        self.required_artifacts
            .iter()
            .chain(self.optional_artifacts.iter())
    }

    /// Total download size of required artifacts.
    pub fn required_size(&self) -> u64 {
        self.required_artifacts.iter().map(|a| a.size).sum()
    }
}

/// Root manifest document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    pub content_version: String,
    pub generated_at: DateTime<Utc>,
    pub models: Vec<ModelItem>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Manifest {
    /// Parse and validate a manifest document.
    ///
    /// Both malformed JSON and invariant violations surface as
    /// `INVALID_MODEL_FORMAT`; a manifest that parses here is safe to share
    /// immutably for the life of the process.
    pub fn from_json(text: &str) -> Result<Self, CoreError> {
        let manifest: Manifest = serde_json::from_str(text)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Check structural invariants that serde alone cannot express.
    pub fn validate(&self) -> Result<(), CoreError> {
        let mut seen = HashSet::new();
        for item in &self.models {
            if !seen.insert(item.id.as_str()) {
                return Err(CoreError::invalid_manifest(format!(
                    "duplicate model id '{}'",
                    item.id
                )));
            }
            if item.required_artifacts.is_empty() {
                return Err(CoreError::invalid_manifest(format!(
                    "model '{}' has no required artifacts",
                    item.id
                )));
            }
            for artifact in &item.required_artifacts {
                if !is_sha256_hex(&artifact.sha256) {
                    return Err(CoreError::invalid_manifest(format!(
                        "artifact '{}' of model '{}' has invalid sha256 '{}'",
                        artifact.name, item.id, artifact.sha256
                    )));
                }
            }
            if let Some(len) = item.context_length {
                if !CONTEXT_LADDER.contains(&len) {
                    return Err(CoreError::invalid_manifest(format!(
                        "model '{}' declares contextLength {len}; expected one of {CONTEXT_LADDER:?}",
                        item.id
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn find(&self, id: &str) -> Option<&ModelItem> {
        self.models.iter().find(|m| m.id == id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.models.iter().map(|m| m.id.as_str())
    }
}

fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Index entry for a model version installed in the local cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalModel {
    pub model_id: String,
    pub version: Version,
    pub path: String,
    pub size_bytes: u64,
    pub installed_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}
