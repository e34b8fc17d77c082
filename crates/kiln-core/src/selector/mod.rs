//! Deterministic backend/provider selection.
//!
//! Given a manifest item, a host probe and optional caller hints, `select`
//! walks a fixed decision order and returns a [`SelectionReport`] with the
//! full candidate audit trail.  The function is pure: same inputs, same
//! report (modulo the generated `requestId`).

mod ladder;
mod probe;
mod report;

pub use probe::{Accelerator, HostProbe, Provider};
pub use report::{Candidate, Decision, DowngradeDimension, DowngradeStep, SelectionReport};

use tracing::debug;
use uuid::Uuid;

use kiln_types::{BackendKind, CoreError, ModelItem, ModelType};

use ladder::LadderConfig;

/// Optional caller preferences.  Everything is advisory except `force_cpu`.
#[derive(Debug, Clone, Default)]
pub struct SelectionHints {
    /// Considered before the manifest's own `backendHints`.
    pub preferred_backend: Option<BackendKind>,
    /// Upper bound on the negotiated context length.
    pub max_context_length: Option<u32>,
    /// Upper bound on GPU offload.
    pub max_gpu_layers: Option<u32>,
    /// Skip accelerated providers entirely.
    pub force_cpu: bool,
}

/// Run selection for `item` on the probed host.
pub fn select(item: &ModelItem, probe: &HostProbe, hints: &SelectionHints) -> SelectionReport {
    let request_id = Uuid::new_v4();
    let mut candidates: Vec<Candidate> = Vec::new();

    // 1. Platform and SDK gates apply to the item as a whole.
    if !item.platforms.is_empty() && !item.platforms.contains(&probe.platform) {
        return SelectionReport {
            request_id,
            candidates,
            downgrade_steps: Vec::new(),
            final_decision: Err(CoreError::unsupported_platform(
                &item.id,
                probe.platform.to_string(),
            )),
        };
    }
    if let Some(&min_sdk) = item.min_sdk_version.get(&probe.platform) {
        if probe.sdk_version < min_sdk {
            let mut err =
                CoreError::unsupported_platform(&item.id, probe.platform.to_string());
            err.message = format!(
                "model '{}' requires SDK {min_sdk} on {}, host has {}",
                item.id, probe.platform, probe.sdk_version
            );
            return SelectionReport {
                request_id,
                candidates,
                downgrade_steps: Vec::new(),
                final_decision: Err(err),
            };
        }
    }

    // 2. Walk the hints left to right; first installed backend that clears
    //    its version gate wins.  Caller preference goes first.
    let mut ordered_hints: Vec<BackendKind> = Vec::new();
    if let Some(preferred) = hints.preferred_backend {
        ordered_hints.push(preferred);
    }
    for &hint in &item.backend_hints {
        if !ordered_hints.contains(&hint) {
            ordered_hints.push(hint);
        }
    }
    let fallback = default_backend(item.model_type, probe);
    if !ordered_hints.contains(&fallback) {
        ordered_hints.push(fallback);
    }

    let mut backend = None;
    for candidate in ordered_hints {
        match backend_usable(candidate, item, probe) {
            Ok(()) => {
                backend = Some(candidate);
                break;
            }
            Err(reason) => candidates.push(Candidate {
                backend: candidate,
                provider: Provider::Cpu,
                accepted: false,
                reasons: vec![reason],
            }),
        }
    }
    let Some(backend) = backend else {
        return SelectionReport {
            request_id,
            candidates,
            downgrade_steps: Vec::new(),
            final_decision: Err(CoreError::runtime_not_available(
                &item.id,
                "no installed backend satisfies the manifest hints",
            )),
        };
    };

    // 3. Prefer the accelerated provider when it is available and stable for
    //    the chosen backend; CPU stays on the list as the fallback.
    let provider = match probe.accel {
        Some(accel)
            if !hints.force_cpu && probe.accel_stable_backends.contains(&backend) =>
        {
            candidates.push(Candidate {
                backend,
                provider: Provider::Cpu,
                accepted: false,
                reasons: vec!["fallback behind accelerated provider".to_owned()],
            });
            accel.provider()
        }
        _ => Provider::Cpu,
    };

    // 4. Resource fit, with the downgrade ladder on memory pressure.
    let initial = LadderConfig {
        quantization: item.quantization.clone(),
        context_length: match (item.context_length, hints.max_context_length) {
            (Some(model), Some(cap)) => Some(model.min(cap)),
            (Some(model), None) => Some(model),
            (None, cap) => cap,
        },
        threads: probe.default_threads(),
        gpu_layers: if provider == Provider::Cpu {
            0
        } else {
            let model_max = item.max_gpu_layers.unwrap_or(0);
            hints.max_gpu_layers.map_or(model_max, |cap| cap.min(model_max))
        },
    };

    let outcome = ladder::run(item, probe.available_memory_bytes, initial);
    debug!(
        model_id = %item.id,
        backend = %backend,
        provider = %provider,
        steps = outcome.steps.len(),
        fits = outcome.fits,
        "selection ladder finished"
    );

    if !outcome.fits {
        candidates.push(Candidate {
            backend,
            provider,
            accepted: false,
            reasons: vec![format!(
                "INSUFFICIENT_MEMORY: needs {} bytes, {} available after downgrades",
                outcome.estimated_bytes, probe.available_memory_bytes
            )],
        });
        let mut err = CoreError::runtime_not_available(
            &item.id,
            "no configuration fits the host even after downgrades",
        );
        err.details.backend = Some(backend.to_string());
        err.details.required_bytes = Some(outcome.estimated_bytes);
        err.details.available_bytes = Some(probe.available_memory_bytes);
        return SelectionReport {
            request_id,
            candidates,
            downgrade_steps: outcome.steps,
            final_decision: Err(err),
        };
    }

    candidates.push(Candidate {
        backend,
        provider,
        accepted: true,
        reasons: Vec::new(),
    });

    SelectionReport {
        request_id,
        candidates,
        downgrade_steps: outcome.steps,
        final_decision: Ok(Decision {
            backend,
            provider,
            quantization: outcome.config.quantization,
            context_length: outcome.config.context_length,
            threads: outcome.config.threads,
            gpu_layers: outcome.config.gpu_layers,
            estimated_memory_bytes: outcome.estimated_bytes,
        }),
    }
}

/// The per-model-type fallback when no hint matches.
fn default_backend(model_type: ModelType, probe: &HostProbe) -> BackendKind {
    if probe.platform.is_mobile() {
        BackendKind::Onnx
    } else if model_type == ModelType::Llm {
        BackendKind::LlamaCpp
    } else {
        BackendKind::Onnx
    }
}

/// Step-1/2 gates for one backend: installed, and version floor cleared.
fn backend_usable(
    backend: BackendKind,
    item: &ModelItem,
    probe: &HostProbe,
) -> Result<(), String> {
    let Some(installed) = probe.installed_backends.get(&backend) else {
        return Err(format!("backend {backend} not installed"));
    };
    if let Some(min) = item.min_backend_version.get(&backend) {
        if installed < min {
            return Err(format!(
                "backend {backend} {installed} below required {min}"
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use semver::Version;
    use std::collections::{BTreeMap, BTreeSet};

    const GIB: u64 = 1024 * 1024 * 1024;

    fn probe(available: u64) -> HostProbe {
        let mut installed = BTreeMap::new();
        installed.insert(BackendKind::LlamaCpp, Version::new(0, 3, 0));
        installed.insert(BackendKind::Onnx, Version::new(1, 17, 0));
        HostProbe {
            platform: kiln_types::Platform::Linux,
            sdk_version: 34,
            cpu_cores: 8,
            available_memory_bytes: available,
            accel: None,
            accel_stable_backends: BTreeSet::new(),
            installed_backends: installed,
        }
    }

    fn item() -> ModelItem {
        serde_json::from_value(serde_json::json!({
            "id": "llama3.1-8b",
            "type": "llm",
            "version": "1.0.0",
            "backendHints": ["llama.cpp"],
            "platforms": ["linux", "macos"],
            "quantization": "Q5_K_M",
            "variants": ["Q5_K_M", "Q4_K_M", "Q3_K_M"],
            "contextLength": 8192,
            "requiredMemoryBytes": 5 * GIB,
            "requiredArtifacts": [{
                "name": "model.gguf", "role": "model", "format": "gguf",
                "path": "model.gguf", "size": 4 * GIB, "sha256": "a".repeat(64),
            }],
        }))
        .unwrap()
    }

    #[test]
    fn tight_host_downgrades_quant_then_context() {
        let report = select(&item(), &probe(3 * GIB), &SelectionHints::default());
        let decision = report.final_decision.as_ref().expect("selection must succeed");

        assert_eq!(decision.backend, BackendKind::LlamaCpp);
        assert_eq!(decision.provider, Provider::Cpu);
        assert_eq!(decision.threads, 7);
        assert_eq!(decision.gpu_layers, 0);
        assert_eq!(decision.quantization.as_deref(), Some("Q4_K_M"));
        assert_eq!(decision.context_length, Some(4096));

        let dims: Vec<_> = report.downgrade_steps.iter().map(|s| s.dimension).collect();
        assert_eq!(
            dims,
            vec![DowngradeDimension::Quantization, DowngradeDimension::ContextLength]
        );
    }

    #[test]
    fn roomy_host_takes_manifest_parameters_unchanged() {
        let report = select(&item(), &probe(32 * GIB), &SelectionHints::default());
        let decision = report.final_decision.as_ref().unwrap();
        assert_eq!(decision.quantization.as_deref(), Some("Q5_K_M"));
        assert_eq!(decision.context_length, Some(8192));
        assert!(report.downgrade_steps.is_empty());
    }

    #[test]
    fn unsupported_platform_fails_without_candidates() {
        let mut host = probe(32 * GIB);
        host.platform = kiln_types::Platform::Windows;
        let report = select(&item(), &host, &SelectionHints::default());
        let err = report.final_decision.as_ref().unwrap_err();
        assert_eq!(err.code, kiln_types::ErrorCode::UnsupportedPlatform);
    }

    #[test]
    fn missing_backend_recorded_then_fallback_used() {
        let mut host = probe(32 * GIB);
        host.installed_backends.remove(&BackendKind::LlamaCpp);
        // llama.cpp is both the hint and the LLM desktop fallback, so with it
        // gone, selection fails and the audit names it.
        let report = select(&item(), &host, &SelectionHints::default());
        let err = report.final_decision.as_ref().unwrap_err();
        assert_eq!(err.code, kiln_types::ErrorCode::RuntimeNotAvailable);
        assert!(report
            .candidates
            .iter()
            .any(|c| c.backend == BackendKind::LlamaCpp && !c.accepted));
    }

    #[test]
    fn backend_version_floor_enforced() {
        let mut tight = item();
        tight
            .min_backend_version
            .insert(BackendKind::LlamaCpp, Version::new(9, 0, 0));
        let report = select(&tight, &probe(32 * GIB), &SelectionHints::default());
        // llama.cpp rejected on version; falls through to the fallback which
        // for LLM on desktop is llama.cpp again, already rejected.
        assert!(report.final_decision.is_err());
        assert!(report.candidates[0].reasons[0].contains("below required"));
    }

    #[test]
    fn accelerated_provider_preferred_when_stable() {
        let mut host = probe(32 * GIB);
        host.accel = Some(Accelerator::Gpu);
        host.accel_stable_backends.insert(BackendKind::LlamaCpp);
        let mut accel_item = item();
        accel_item.max_gpu_layers = Some(33);

        let report = select(&accel_item, &host, &SelectionHints::default());
        let decision = report.final_decision.as_ref().unwrap();
        assert_eq!(decision.provider, Provider::Gpu);
        assert_eq!(decision.gpu_layers, 33);
        // CPU recorded as the fallback candidate.
        assert!(report
            .candidates
            .iter()
            .any(|c| c.provider == Provider::Cpu && !c.accepted));
    }

    #[test]
    fn force_cpu_hint_skips_acceleration() {
        let mut host = probe(32 * GIB);
        host.accel = Some(Accelerator::Gpu);
        host.accel_stable_backends.insert(BackendKind::LlamaCpp);
        let hints = SelectionHints {
            force_cpu: true,
            ..Default::default()
        };
        let report = select(&item(), &host, &hints);
        assert_eq!(report.final_decision.as_ref().unwrap().provider, Provider::Cpu);
    }

    #[test]
    fn exhausted_ladder_reports_insufficient_memory_diagnostics() {
        let report = select(&item(), &probe(GIB / 4), &SelectionHints::default());
        let err = report.final_decision.as_ref().unwrap_err();
        assert_eq!(err.code, kiln_types::ErrorCode::RuntimeNotAvailable);
        assert!(err.details.required_bytes.is_some());
        assert!(err.details.available_bytes.is_some());
        assert!(report
            .candidates
            .iter()
            .any(|c| c.reasons.iter().any(|r| r.contains("INSUFFICIENT_MEMORY"))));
        assert!(!report.downgrade_steps.is_empty());
    }

    #[test]
    fn selection_is_deterministic() {
        let host = probe(3 * GIB);
        let model = item();
        let hints = SelectionHints::default();
        let a = select(&model, &host, &hints);
        let b = select(&model, &host, &hints);
        assert_eq!(
            serde_json::to_value(&a.final_decision).unwrap(),
            serde_json::to_value(&b.final_decision).unwrap()
        );
        assert_eq!(
            serde_json::to_value(&a.downgrade_steps).unwrap(),
            serde_json::to_value(&b.downgrade_steps).unwrap()
        );
    }

    #[test]
    fn min_sdk_gate_applies_per_platform() {
        let mut gated = item();
        gated
            .min_sdk_version
            .insert(kiln_types::Platform::Linux, 99);
        let report = select(&gated, &probe(32 * GIB), &SelectionHints::default());
        let err = report.final_decision.as_ref().unwrap_err();
        assert_eq!(err.code, kiln_types::ErrorCode::UnsupportedPlatform);
        assert!(err.message.contains("SDK"));
    }
}
