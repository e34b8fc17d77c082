//! Static host capability probe.
//!
//! Selection is a pure function of `(manifest item, probe, hints)`; the probe
//! is plain data so tests construct it directly and production code fills it
//! once at startup from `sysinfo` plus compile-time platform facts.

use semver::Version;
use std::collections::{BTreeMap, BTreeSet};

use kiln_types::{BackendKind, Platform};

/// Hardware acceleration families the selector understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Accelerator {
    CoreMl,
    Nnapi,
    Gpu,
}

/// A hardware execution path within a backend.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Provider {
    Cpu,
    Gpu,
    CoreMl,
    Nnapi,
}

impl Accelerator {
    pub fn provider(self) -> Provider {
        match self {
            Accelerator::CoreMl => Provider::CoreMl,
            Accelerator::Nnapi => Provider::Nnapi,
            Accelerator::Gpu => Provider::Gpu,
        }
    }
}

/// Snapshot of the facts selection depends on.
#[derive(Debug, Clone)]
pub struct HostProbe {
    pub platform: Platform,
    /// Platform SDK / OS API level, compared against `minSdkVersion`.
    pub sdk_version: u32,
    pub cpu_cores: u32,
    pub available_memory_bytes: u64,
    /// Detected accelerator, if any.
    pub accel: Option<Accelerator>,
    /// Backends for which the accelerator is considered production-stable.
    pub accel_stable_backends: BTreeSet<BackendKind>,
    /// Installed backends with their versions.
    pub installed_backends: BTreeMap<BackendKind, Version>,
}

impl HostProbe {
    /// Probe the current host.
    ///
    /// `installed_backends` comes from the adapter registry, which knows what
    /// is actually linked in; the probe itself only inspects the machine.
    pub fn detect(installed_backends: BTreeMap<BackendKind, Version>) -> Self {
        let mut sys = sysinfo::System::new();
        sys.refresh_memory();
        sys.refresh_cpu_all();

        let platform = if cfg!(target_os = "android") {
            Platform::Android
        } else if cfg!(target_os = "ios") {
            Platform::Ios
        } else if cfg!(target_os = "macos") {
            Platform::Macos
        } else if cfg!(target_os = "windows") {
            Platform::Windows
        } else {
            Platform::Linux
        };

        let accel = match platform {
            Platform::Macos | Platform::Ios => Some(Accelerator::CoreMl),
            Platform::Android => Some(Accelerator::Nnapi),
            // Desktop GPU detection is left to adapters' own probes; assume
            // none until an adapter reports support.
            Platform::Linux | Platform::Windows => None,
        };

        Self {
            platform,
            sdk_version: 0,
            cpu_cores: sys.cpus().len().max(1) as u32,
            available_memory_bytes: sys.available_memory(),
            accel,
            accel_stable_backends: BTreeSet::new(),
            installed_backends,
        }
    }

    /// Default worker thread count: leave one core for the application.
    pub fn default_threads(&self) -> u32 {
        self.cpu_cores.saturating_sub(1).max(1)
    }
}
