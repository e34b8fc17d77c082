//! The reproducible downgrade ladder.
//!
//! Dimensions are applied in a fixed order, one downgrade step per
//! dimension, re-checking the memory fit after each step.  Under memory
//! pressure a nonzero `gpuLayers` drops straight to zero before any other
//! dimension is considered.  No randomness, no I/O: the same inputs always
//! yield the same steps.

use kiln_types::{ModelItem, CONTEXT_LADDER};

use super::report::{DowngradeDimension, DowngradeStep};

/// Relative footprint factors per quantization family, matched by prefix.
/// Unknown schemes count as full weight.
const QUANT_FACTORS: &[(&str, f64)] = &[
    ("Q8", 1.0),
    ("Q6", 0.82),
    ("Q5", 0.72),
    ("Q4", 0.62),
    ("Q3", 0.50),
    ("Q2", 0.40),
];

/// Share of the footprint that does not scale with context length.
const CONTEXT_FLOOR: f64 = 0.3;

/// Mutable parameter set the ladder walks over.
#[derive(Debug, Clone, PartialEq)]
pub(super) struct LadderConfig {
    pub quantization: Option<String>,
    pub context_length: Option<u32>,
    pub threads: u32,
    pub gpu_layers: u32,
}

/// Outcome of a ladder run.
pub(super) struct LadderOutcome {
    pub steps: Vec<DowngradeStep>,
    pub config: LadderConfig,
    pub estimated_bytes: u64,
    pub fits: bool,
}

fn quant_factor(scheme: &str) -> f64 {
    let upper = scheme.to_ascii_uppercase();
    QUANT_FACTORS
        .iter()
        .find(|(prefix, _)| upper.starts_with(prefix))
        .map(|(_, factor)| *factor)
        .unwrap_or(1.0)
}

/// Estimate resident memory for `item` at the given parameters.
///
/// The manifest's `requiredMemoryBytes` is the anchor (falling back to
/// artifact sizes plus headroom); quantization scales the whole estimate
/// relative to the manifest's own scheme, context length scales the
/// KV-cache share.
pub(super) fn estimate_memory(item: &ModelItem, config: &LadderConfig) -> u64 {
    let base = item
        .required_memory_bytes
        .unwrap_or_else(|| item.required_size() + item.required_size() / 5);

    let quant_scale = match (&config.quantization, &item.quantization) {
        (Some(current), Some(original)) => quant_factor(current) / quant_factor(original),
        _ => 1.0,
    };
    let context_scale = match (config.context_length, item.context_length) {
        (Some(current), Some(original)) if original > 0 => {
            CONTEXT_FLOOR + (1.0 - CONTEXT_FLOOR) * current as f64 / original as f64
        }
        _ => 1.0,
    };

    (base as f64 * quant_scale * context_scale) as u64
}

/// Walk the ladder until the estimate fits `available_bytes` or every
/// dimension has been tried.
pub(super) fn run(item: &ModelItem, available_bytes: u64, mut config: LadderConfig) -> LadderOutcome {
    let mut steps = Vec::new();

    let fits = |config: &LadderConfig| estimate_memory(item, config) <= available_bytes;

    if fits(&config) {
        let estimated_bytes = estimate_memory(item, &config);
        return LadderOutcome {
            steps,
            config,
            estimated_bytes,
            fits: true,
        };
    }

    // Under memory pressure, GPU offload drops straight to zero first.
    if config.gpu_layers > 0 {
        steps.push(DowngradeStep {
            dimension: DowngradeDimension::GpuLayers,
            from: config.gpu_layers.to_string(),
            to: "0".to_owned(),
        });
        config.gpu_layers = 0;
        if fits(&config) {
            let estimated_bytes = estimate_memory(item, &config);
            return LadderOutcome {
                steps,
                config,
                estimated_bytes,
                fits: true,
            };
        }
    }

    // Quantization: only variants the manifest lists, one step down.
    if let Some(current) = config.quantization.clone() {
        let next = item
            .variants
            .iter()
            .position(|v| *v == current)
            .and_then(|pos| item.variants.get(pos + 1));
        if let Some(next) = next {
            steps.push(DowngradeStep {
                dimension: DowngradeDimension::Quantization,
                from: current,
                to: next.clone(),
            });
            config.quantization = Some(next.clone());
            if fits(&config) {
                let estimated_bytes = estimate_memory(item, &config);
                return LadderOutcome {
                    steps,
                    config,
                    estimated_bytes,
                    fits: true,
                };
            }
        }
    }

    // Context length: strictly down the fixed ladder.
    if let Some(current) = config.context_length {
        let next = CONTEXT_LADDER.iter().copied().find(|&level| level < current);
        if let Some(next) = next {
            steps.push(DowngradeStep {
                dimension: DowngradeDimension::ContextLength,
                from: current.to_string(),
                to: next.to_string(),
            });
            config.context_length = Some(next);
            if fits(&config) {
                let estimated_bytes = estimate_memory(item, &config);
                return LadderOutcome {
                    steps,
                    config,
                    estimated_bytes,
                    fits: true,
                };
            }
        }
    }

    // Threads: halve once.  Bounded below by 1.
    if config.threads > 1 {
        let next = (config.threads / 2).max(1);
        steps.push(DowngradeStep {
            dimension: DowngradeDimension::Threads,
            from: config.threads.to_string(),
            to: next.to_string(),
        });
        config.threads = next;
        if fits(&config) {
            let estimated_bytes = estimate_memory(item, &config);
            return LadderOutcome {
                steps,
                config,
                estimated_bytes,
                fits: true,
            };
        }
    }

    let estimated_bytes = estimate_memory(item, &config);
    LadderOutcome {
        steps,
        config,
        estimated_bytes,
        fits: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn item() -> ModelItem {
        serde_json::from_value(serde_json::json!({
            "id": "llama3.1-8b",
            "type": "llm",
            "version": "1.0.0",
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

    fn base_config(item: &ModelItem) -> LadderConfig {
        LadderConfig {
            quantization: item.quantization.clone(),
            context_length: item.context_length,
            threads: 7,
            gpu_layers: 0,
        }
    }

    #[test]
    fn no_steps_when_it_already_fits() {
        let item = item();
        let outcome = run(&item, 16 * GIB, base_config(&item));
        assert!(outcome.fits);
        assert!(outcome.steps.is_empty());
        assert_eq!(outcome.estimated_bytes, 5 * GIB);
    }

    #[test]
    fn quant_then_context_on_tight_host() {
        let item = item();
        let outcome = run(&item, 3 * GIB, base_config(&item));
        assert!(outcome.fits);
        let dims: Vec<_> = outcome.steps.iter().map(|s| s.dimension).collect();
        assert_eq!(
            dims,
            vec![DowngradeDimension::Quantization, DowngradeDimension::ContextLength]
        );
        assert_eq!(outcome.steps[0].from, "Q5_K_M");
        assert_eq!(outcome.steps[0].to, "Q4_K_M");
        assert_eq!(outcome.steps[1].from, "8192");
        assert_eq!(outcome.steps[1].to, "4096");
        assert_eq!(outcome.config.quantization.as_deref(), Some("Q4_K_M"));
        assert_eq!(outcome.config.context_length, Some(4096));
        assert_eq!(outcome.config.threads, 7);
        assert!(outcome.estimated_bytes <= 3 * GIB);
    }

    #[test]
    fn gpu_layers_drop_to_zero_first() {
        let item = item();
        let mut config = base_config(&item);
        config.gpu_layers = 32;
        let outcome = run(&item, 3 * GIB, config);
        assert_eq!(outcome.steps[0].dimension, DowngradeDimension::GpuLayers);
        assert_eq!(outcome.steps[0].from, "32");
        assert_eq!(outcome.steps[0].to, "0");
        assert_eq!(outcome.config.gpu_layers, 0);
    }

    #[test]
    fn quantization_skipped_without_variants() {
        let mut item = item();
        item.variants.clear();
        let outcome = run(&item, 3 * GIB, base_config(&item));
        assert!(
            outcome
                .steps
                .iter()
                .all(|s| s.dimension != DowngradeDimension::Quantization),
            "no quantization guessing without a variants list"
        );
    }

    #[test]
    fn exhaustion_reports_no_fit() {
        let item = item();
        let outcome = run(&item, GIB / 2, base_config(&item));
        assert!(!outcome.fits);
        assert!(!outcome.steps.is_empty());
    }

    #[test]
    fn determinism() {
        let item = item();
        let a = run(&item, 3 * GIB, base_config(&item));
        let b = run(&item, 3 * GIB, base_config(&item));
        assert_eq!(a.config, b.config);
        assert_eq!(a.steps.len(), b.steps.len());
        for (x, y) in a.steps.iter().zip(&b.steps) {
            assert_eq!(x.dimension, y.dimension);
            assert_eq!(x.from, y.from);
            assert_eq!(x.to, y.to);
        }
    }
}
