//! Content-addressed document processing and multi-phase contract analysis.
//!
//! The engine deduplicates expensive document processing across unrelated
//! users through keyed content addressing, guarantees at most one concurrent
//! computation per content fingerprint, survives crashes by resuming from
//! the last completed checkpoint, and executes a fixed dependency graph of
//! analysis phases while reporting strictly monotonic progress.
//!
//! Layering, bottom up:
//!
//! - [`services::ArtifactStore`] — content-addressed, immutable storage with
//!   a single-flight `resolve_or_compute` primitive;
//! - [`services::RunRegistry`] — run lifecycle, checkpoints, orphan
//!   discovery, resume validation;
//! - [`services::PhaseOrchestrator`] — the phase DAG state machine;
//! - [`services::ProgressSequencer`] — monotonic progress with replay;
//! - [`services::Pipeline`] — the end-to-end composition.
//!
//! The OCR/LLM callers behind analyzer units, the upload service supplying
//! document bytes, and the client notification transport are collaborators
//! specified at their trait seams ([`analysis::AnalyzerUnit`],
//! [`services::PageExtractor`], the broadcast stream).

pub mod analysis;
pub mod config;
pub mod error;
pub mod models;
pub mod repository;
pub mod services;
pub mod storage;

pub use config::EngineConfig;
pub use error::EngineError;
