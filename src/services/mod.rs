//! Engine services.

pub mod artifact_store;
pub mod diagram;
pub mod orchestrator;
pub mod pipeline;
pub mod progress;
pub mod recovery;
pub mod runs;

pub use artifact_store::{ArtifactStore, ComputedPage, PageComputer};
pub use diagram::DiagramExtractor;
pub use orchestrator::{
    OrchestratorOutcome, PhaseOrchestrator, PhaseOutput, PhaseState, SkippedPhase, UnitResult,
};
pub use pipeline::{PageExtractor, Pipeline, PlainTextExtractor, ProcessJob};
pub use progress::{ProgressEvent, ProgressSequencer};
pub use recovery::{RecoverySweeper, RunResumer};
pub use runs::{ResumeValidation, RunRegistry};
