//! Selection diagnostics.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use kiln_types::{BackendKind, CoreError};

use super::probe::Provider;

/// One considered `(backend, provider)` pair, accepted or rejected.
///
/// The candidate list is the audit trail consumers display when selection
/// fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub backend: BackendKind,
    pub provider: Provider,
    pub accepted: bool,
    pub reasons: Vec<String>,
}

/// The ladder dimensions, in their fixed application order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum DowngradeDimension {
    Quantization,
    ContextLength,
    Threads,
    GpuLayers,
}

/// A single reproducible downgrade applied during selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DowngradeStep {
    pub dimension: DowngradeDimension,
    pub from: String,
    pub to: String,
}

/// The accepted runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub backend: BackendKind,
    pub provider: Provider,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantization: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_length: Option<u32>,
    pub threads: u32,
    pub gpu_layers: u32,
    pub estimated_memory_bytes: u64,
}

/// Full diagnostic emitted by every selection run, success or failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionReport {
    pub request_id: Uuid,
    pub candidates: Vec<Candidate>,
    pub downgrade_steps: Vec<DowngradeStep>,
    pub final_decision: Result<Decision, CoreError>,
}

impl SelectionReport {
    pub fn decision(&self) -> Result<&Decision, &CoreError> {
        self.final_decision.as_ref()
    }
}
