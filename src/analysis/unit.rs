//! Analyzer unit seam.
//!
//! Units are the pluggable workers inside a phase: LLM callers, vision
//! models, or the deterministic extractors shipped in [`crate::analysis::builtin`].
//! The orchestrator never interprets a unit's value, only success/failure,
//! criticality, and declared confidence.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::models::{Artifact, ArtifactSet};

/// Confidence a unit declares for its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

/// Typed result of one analyzer unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitOutput {
    /// Unit-specific payload, opaque to the orchestrator.
    pub value: serde_json::Value,
    pub confidence: Confidence,
    /// Degradations worth surfacing without failing the unit.
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl UnitOutput {
    pub fn new(value: serde_json::Value, confidence: Confidence) -> Self {
        Self {
            value,
            confidence,
            warnings: Vec::new(),
        }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}

/// Everything a unit gets to work with: the resolved artifacts, outputs of
/// predecessor phases, and any extracted diagrams.
#[derive(Clone)]
pub struct UnitContext {
    pub run_id: String,
    pub document_id: String,
    pub artifacts: Arc<ArtifactSet>,
    /// Full document text, loaded once per run.
    pub full_text: Arc<String>,
    /// Outputs of predecessor phases, keyed by phase id then unit key.
    pub upstream: BTreeMap<String, BTreeMap<String, UnitOutput>>,
    /// Sub-image artifacts extracted for this address. Optional input: an
    /// empty list lowers confidence for units that want diagrams but never
    /// blocks them.
    pub diagrams: Vec<Artifact>,
}

impl UnitContext {
    /// Look up one upstream unit output.
    pub fn upstream_value(&self, phase: &str, unit: &str) -> Option<&UnitOutput> {
        self.upstream.get(phase).and_then(|units| units.get(unit))
    }
}

/// One analyzer inside a phase.
#[async_trait]
pub trait AnalyzerUnit: Send + Sync {
    /// Stable key, unique within the owning phase.
    fn key(&self) -> &str;

    /// Analyze and return a typed result or a typed failure.
    async fn analyze(&self, ctx: &UnitContext) -> Result<UnitOutput, EngineError>;
}

/// Registry of analyzer units by key.
///
/// Production registers LLM/vision-backed units; the registry starts from
/// the deterministic builtins so every unit key in the fixed graph is
/// always resolvable.
#[derive(Default)]
pub struct UnitRegistry {
    units: HashMap<String, Arc<dyn AnalyzerUnit>>,
}

impl UnitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a unit, replacing any previous registration for its key.
    pub fn register(&mut self, unit: Arc<dyn AnalyzerUnit>) {
        self.units.insert(unit.key().to_string(), unit);
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn AnalyzerUnit>> {
        self.units.get(key).cloned()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.units.keys().map(|k| k.as_str())
    }
}
