use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Stable error identifiers shared across the runtime.
///
/// The set is closed: adapters and callers must map their failures onto one
/// of these codes.  Wire form is SCREAMING_SNAKE_CASE.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ModelNotFound,
    ModelVerifyFailed,
    RuntimeNotAvailable,
    UnsupportedPlatform,
    InsufficientMemory,
    TaskTimeout,
    TaskCancelled,
    DownloadFailed,
    InvalidModelFormat,
    ConfigError,
}

impl ErrorCode {
    /// Whether a failure with this code may succeed on retry.
    pub fn retriable(self) -> bool {
        match self {
            ErrorCode::ModelVerifyFailed
            | ErrorCode::RuntimeNotAvailable
            | ErrorCode::InsufficientMemory
            | ErrorCode::TaskTimeout
            | ErrorCode::TaskCancelled
            | ErrorCode::DownloadFailed => true,
            ErrorCode::ModelNotFound
            | ErrorCode::UnsupportedPlatform
            | ErrorCode::InvalidModelFormat
            | ErrorCode::ConfigError => false,
        }
    }
}

/// Structured context attached to a [`CoreError`].
///
/// All fields are optional; producers fill what they know.  Unknown fields
/// from decoded errors are kept in `extra` so re-serialization is non-lossy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    /// Sub-code refining the main [`ErrorCode`], e.g. `DISK_FULL`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ErrorDetails {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// The spanning error type of the runtime.
///
/// Carries a stable [`ErrorCode`], a human message, structured details, and
/// an optional suggestion for user-facing callers.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[error("{code}: {message}")]
pub struct CoreError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "ErrorDetails::is_empty")]
    pub details: ErrorDetails,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl CoreError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: ErrorDetails::default(),
            suggestion: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn retriable(&self) -> bool {
        self.code.retriable()
    }

    // ── Constructors per taxonomy entry ──────────────────────────────────────

    pub fn model_not_found(model_id: impl Into<String>) -> Self {
        let model_id = model_id.into();
        let mut err = Self::new(
            ErrorCode::ModelNotFound,
            format!("model '{model_id}' not found in manifest or cache"),
        );
        err.details.model_id = Some(model_id);
        err
    }

    pub fn verify_failed(
        artifact: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        let artifact = artifact.into();
        let mut err = Self::new(
            ErrorCode::ModelVerifyFailed,
            format!("sha256 mismatch for artifact '{artifact}'"),
        );
        err.details.artifact = Some(artifact);
        err.details.expected_sha256 = Some(expected.into());
        err.details.actual_sha256 = Some(actual.into());
        err
    }

    pub fn runtime_not_available(model_id: impl Into<String>, message: impl Into<String>) -> Self {
        let mut err = Self::new(ErrorCode::RuntimeNotAvailable, message);
        err.details.model_id = Some(model_id.into());
        err
    }

    pub fn unsupported_platform(model_id: impl Into<String>, platform: impl Into<String>) -> Self {
        let model_id = model_id.into();
        let platform = platform.into();
        let mut err = Self::new(
            ErrorCode::UnsupportedPlatform,
            format!("model '{model_id}' does not support platform '{platform}'"),
        );
        err.details.model_id = Some(model_id);
        err.details.platform = Some(platform);
        err
    }

    pub fn insufficient_memory(required: u64, available: u64) -> Self {
        let mut err = Self::new(
            ErrorCode::InsufficientMemory,
            format!("requires {required} bytes but only {available} available"),
        );
        err.details.required_bytes = Some(required);
        err.details.available_bytes = Some(available);
        err
    }

    pub fn task_timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::TaskTimeout, message)
    }

    pub fn task_cancelled() -> Self {
        Self::new(ErrorCode::TaskCancelled, "task cancelled by caller")
    }

    pub fn download_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DownloadFailed, message)
    }

    pub fn disk_full(required: u64, available: u64) -> Self {
        let mut err = Self::new(
            ErrorCode::DownloadFailed,
            format!("out of disk space: need {required} bytes, {available} free"),
        );
        err.details.reason = Some("DISK_FULL".to_owned());
        err.details.required_bytes = Some(required);
        err.details.available_bytes = Some(available);
        err.suggestion = Some("free up disk space and retry the install".to_owned());
        err
    }

    pub fn invalid_manifest(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidModelFormat, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigError, message)
    }

    /// Map an I/O error, recognizing out-of-space conditions.
    pub fn from_io(context: &str, err: &std::io::Error) -> Self {
        let mut core = Self::new(ErrorCode::DownloadFailed, format!("{context}: {err}"));
        if err.kind() == std::io::ErrorKind::StorageFull {
            core.details.reason = Some("DISK_FULL".to_owned());
        }
        core
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid_manifest(format!("malformed JSON: {err}"))
    }
}
