//! The narrow interface inference backends implement.
//!
//! The core never links inference libraries; llama.cpp, ONNX Runtime,
//! Whisper and friends live behind [`BackendAdapter`] implementations
//! registered at startup.  A backend that is not present on this build is an
//! explicit [`AdapterSlot::NotInstalled`] — there is no always-failing stub
//! object to call by accident; the selector reports `RUNTIME_NOT_AVAILABLE`
//! instead.

use async_trait::async_trait;
use semver::Version;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

use kiln_types::{BackendKind, CoreError, GenerationConfig, Platform};

use crate::scheduler::CancelToken;
use crate::stream::RawDelta;

/// Result of an adapter's hardware-acceleration probe.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccelerationSupport {
    pub available: bool,
    /// Whether the accelerated path is considered production-stable.
    pub stable: bool,
}

/// Parameters for loading a model into a backend, carrying the selector's
/// decision.
#[derive(Debug, Clone)]
pub struct LoadParams {
    pub model_path: PathBuf,
    pub context_length: Option<u32>,
    pub threads: u32,
    pub gpu_layers: u32,
    pub quantization: Option<String>,
}

/// Opaque handle to a loaded model session.  Owned by whoever loaded it;
/// return it to [`BackendAdapter::unload`] when done.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    pub backend: BackendKind,
    pub id: u64,
}

/// Request/response surface for the non-LLM task families.
#[derive(Debug)]
pub enum AdapterRequest {
    Ocr { image: Vec<u8> },
    Transcribe { samples: Vec<f32>, sample_rate: u32 },
    Synthesize { text: String },
    Embed { texts: Vec<String> },
}

#[derive(Debug)]
pub enum AdapterResponse {
    Text(String),
    Audio { samples: Vec<f32>, sample_rate: u32 },
    Embeddings(Vec<Vec<f32>>),
}

/// One inference backend.
///
/// Errors MUST be drawn from the core taxonomy; adapters map their native
/// failures before returning.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    fn backend(&self) -> BackendKind;

    fn version(&self) -> Version;

    fn platforms(&self) -> &[Platform];

    fn probe_acceleration(&self) -> AccelerationSupport;

    async fn load(&self, params: LoadParams) -> Result<SessionHandle, CoreError>;

    async fn unload(&self, session: SessionHandle) -> Result<(), CoreError>;

    /// Start streaming generation.  The adapter stops generating when the
    /// cancel token fires (finishing with `reason = cancel`) or when the
    /// returned receiver is dropped.
    async fn stream_generate(
        &self,
        session: &SessionHandle,
        prompt: &str,
        config: &GenerationConfig,
        cancel: CancelToken,
    ) -> Result<mpsc::Receiver<RawDelta>, CoreError>;

    /// Unary request/response for OCR, STT, TTS and embeddings.
    async fn run(
        &self,
        session: &SessionHandle,
        request: AdapterRequest,
        cancel: CancelToken,
    ) -> Result<AdapterResponse, CoreError>;
}

/// Presence of a backend on this build: installed, or explicitly absent.
#[derive(Clone)]
pub enum AdapterSlot {
    Installed(Arc<dyn BackendAdapter>),
    NotInstalled,
}

/// Registry of adapters by backend.
///
/// Populated once at startup; shared immutably afterwards.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    slots: BTreeMap<BackendKind, AdapterSlot>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn BackendAdapter>) {
        self.slots
            .insert(adapter.backend(), AdapterSlot::Installed(adapter));
    }

    /// Record a backend as known-but-absent, e.g. compiled out on this
    /// platform.
    pub fn register_absent(&mut self, backend: BackendKind) {
        self.slots.entry(backend).or_insert(AdapterSlot::NotInstalled);
    }

    /// The adapter for `backend`, if installed.
    pub fn get(&self, backend: BackendKind) -> Option<Arc<dyn BackendAdapter>> {
        match self.slots.get(&backend) {
            Some(AdapterSlot::Installed(adapter)) => Some(Arc::clone(adapter)),
            Some(AdapterSlot::NotInstalled) | None => None,
        }
    }

    /// Installed backends with versions, for the host probe.
    pub fn installed_versions(&self) -> BTreeMap<BackendKind, Version> {
        self.slots
            .iter()
            .filter_map(|(backend, slot)| match slot {
                AdapterSlot::Installed(adapter) => Some((*backend, adapter.version())),
                AdapterSlot::NotInstalled => None,
            })
            .collect()
    }

    /// Backends for which the adapter reports a stable accelerated path.
    pub fn accel_stable_backends(&self) -> std::collections::BTreeSet<BackendKind> {
        self.slots
            .iter()
            .filter_map(|(backend, slot)| match slot {
                AdapterSlot::Installed(adapter) => {
                    let accel = adapter.probe_acceleration();
                    (accel.available && accel.stable).then_some(*backend)
                }
                AdapterSlot::NotInstalled => None,
            })
            .collect()
    }
}
