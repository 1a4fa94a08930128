//! Data models for the processing engine.

mod address;
mod artifact;
mod checkpoint;
mod run;

pub use address::{ContentAddress, ProcessingParams, ALGORITHM_VERSION};
pub use artifact::{word_count, Artifact, ArtifactKind, ArtifactSet, UserDocumentLink};
pub use checkpoint::Checkpoint;
pub use run::{Run, RunStatus};
