mod error;
mod events;
mod manifest;

pub use error::{CoreError, ErrorCode, ErrorDetails};
pub use events::{
    CompletionResult, FinishReason, GenerationStats, InstallPhase, InstallProgress, StreamEvent,
    StreamPayload, TaskEvent, TaskEventType,
};
pub use manifest::{
    Artifact, ArtifactRole, BackendKind, GenerationConfig, LocalModel, Manifest, ModelItem,
    ModelType, Platform, CONTEXT_LADDER,
};
