//! Phase orchestration.
//!
//! Executes the fixed phase graph for one run: every phase whose
//! predecessors are done is dispatched concurrently (bounded by the
//! configured fan-out), units inside a phase fan out and join, failures
//! degrade or propagate according to unit criticality, and dependents of a
//! failed phase are marked skipped with a recorded reason rather than
//! silently dropped. Whatever terminal synthesis is still reachable runs,
//! so a degraded run yields a partial result instead of nothing.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::analysis::{
    builtin, phase_step_key, step_percent, AnalyzerUnit, PhaseGraph, PhaseSpec, UnitContext,
    UnitOutput, UnitRegistry, UnitSpec,
};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::models::{Run, RunStatus};
use crate::services::progress::ProgressSequencer;
use crate::services::runs::RunRegistry;

/// Per-run state of one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseState {
    Pending,
    Ready,
    Running,
    Done,
    Failed,
    Skipped,
}

/// How one unit inside a phase ended up.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UnitResult {
    Completed { output: UnitOutput },
    /// Non-critical failure, degraded to a synthesized fallback value.
    Fallback { output: UnitOutput, error: String },
    Failed { error: String },
}

impl UnitResult {
    pub fn output(&self) -> Option<&UnitOutput> {
        match self {
            Self::Completed { output } | Self::Fallback { output, .. } => Some(output),
            Self::Failed { .. } => None,
        }
    }
}

/// Recorded result of a finished phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseOutput {
    pub phase: String,
    pub units: BTreeMap<String, UnitResult>,
    pub warnings: Vec<String>,
}

impl PhaseOutput {
    /// Unit outputs visible to dependent phases.
    fn unit_outputs(&self) -> BTreeMap<String, UnitOutput> {
        self.units
            .iter()
            .filter_map(|(key, result)| result.output().map(|o| (key.clone(), o.clone())))
            .collect()
    }
}

/// A phase that never ran, with the reason it was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedPhase {
    pub phase: String,
    pub reason: String,
}

/// Final result of orchestrating one run.
#[derive(Debug, Clone)]
pub struct OrchestratorOutcome {
    pub status: RunStatus,
    pub phases: BTreeMap<String, PhaseOutput>,
    pub skipped: Vec<SkippedPhase>,
    /// Reasons for phases that failed outright.
    pub failures: BTreeMap<String, String>,
    pub synthesis: serde_json::Value,
}

/// Executes the phase graph for runs.
pub struct PhaseOrchestrator {
    graph: Arc<PhaseGraph>,
    units: Arc<UnitRegistry>,
    registry: Arc<RunRegistry>,
    progress: Arc<ProgressSequencer>,
    config: EngineConfig,
}

impl PhaseOrchestrator {
    pub fn new(
        graph: Arc<PhaseGraph>,
        units: Arc<UnitRegistry>,
        registry: Arc<RunRegistry>,
        progress: Arc<ProgressSequencer>,
        config: EngineConfig,
    ) -> Self {
        Self {
            graph,
            units,
            registry,
            progress,
            config,
        }
    }

    /// Execute all phases for a run, resuming past phases already recorded
    /// in the run's checkpoint data.
    pub async fn execute(
        &self,
        run: &Run,
        base: UnitContext,
    ) -> Result<OrchestratorOutcome, EngineError> {
        let mut completed = restore_phases(&self.graph, &run.checkpoint_data);
        if !completed.is_empty() {
            tracing::info!(
                run_id = %run.run_id,
                restored = completed.len(),
                "resuming with checkpointed phase results"
            );
        }

        let mut states: HashMap<&'static str, PhaseState> = self
            .graph
            .phases()
            .iter()
            .map(|p| {
                let state = if completed.contains_key(p.id) {
                    PhaseState::Done
                } else {
                    PhaseState::Pending
                };
                (p.id, state)
            })
            .collect();

        let mut skipped: Vec<SkippedPhase> = Vec::new();
        let mut failures: BTreeMap<String, String> = BTreeMap::new();
        let semaphore = Arc::new(Semaphore::new(self.config.max_fanout));
        let mut in_flight = FuturesUnordered::new();
        let mut cancelled = false;

        loop {
            if !cancelled && self.registry.cancel_requested(&run.run_id)? {
                cancelled = true;
                tracing::info!(
                    run_id = %run.run_id,
                    "cancellation requested; in-flight phases may finish, none will be dispatched"
                );
            }

            if !cancelled {
                self.propagate_skips(&mut states, &mut skipped);

                let done: HashSet<String> = states
                    .iter()
                    .filter(|(_, s)| **s == PhaseState::Done)
                    .map(|(id, _)| id.to_string())
                    .collect();

                for spec in self.graph.phases() {
                    if states[spec.id] != PhaseState::Pending
                        || !self.graph.predecessors_done(spec.id, &done)
                    {
                        continue;
                    }
                    // Ready the instant all predecessors are done; dispatch
                    // immediately.
                    states.insert(spec.id, PhaseState::Ready);
                    let ctx = phase_context(&base, spec, &completed);
                    let task = self.spawn_phase(*spec, ctx, semaphore.clone());
                    in_flight.push(task);
                    states.insert(spec.id, PhaseState::Running);
                    tracing::debug!(run_id = %run.run_id, phase = spec.id, "phase dispatched");
                }
            }

            let Some((phase_id, result)) = in_flight.next().await else {
                break;
            };

            // The graph owns the 'static id; look it up to key the state map.
            let static_id = self.graph.get(&phase_id).map(|spec| spec.id);
            match result {
                Ok(output) => {
                    tracing::info!(run_id = %run.run_id, phase = %phase_id, "phase done");
                    if let Some(id) = static_id {
                        states.insert(id, PhaseState::Done);
                    }
                    completed.insert(phase_id.clone(), output);
                    self.checkpoint_phase(run, &phase_id, &completed)?;
                }
                Err(reason) => {
                    tracing::warn!(
                        run_id = %run.run_id,
                        phase = %phase_id,
                        reason = %reason,
                        "phase failed"
                    );
                    if let Some(id) = static_id {
                        states.insert(id, PhaseState::Failed);
                    }
                    failures.insert(phase_id, reason);
                }
            }
            self.registry.touch_heartbeat(&run.run_id)?;
        }

        if !cancelled {
            // A failure on the last completed phase may leave dependents
            // unmarked; settle them before reporting.
            self.propagate_skips(&mut states, &mut skipped);
        }

        let status = if cancelled {
            RunStatus::Cancelled
        } else if failures.is_empty() && skipped.is_empty() {
            RunStatus::Completed
        } else if !completed.is_empty() {
            RunStatus::Partial
        } else {
            RunStatus::Failed
        };

        let synthesis = synthesize(&completed, &skipped, &failures);
        Ok(OrchestratorOutcome {
            status,
            phases: completed,
            skipped,
            failures,
            synthesis,
        })
    }

    /// Mark pending phases whose predecessors failed or were skipped.
    /// Topological order makes one pass sufficient.
    fn propagate_skips(
        &self,
        states: &mut HashMap<&'static str, PhaseState>,
        skipped: &mut Vec<SkippedPhase>,
    ) {
        for &id in self.graph.topo_order() {
            if states[id] != PhaseState::Pending {
                continue;
            }
            let Some(spec) = self.graph.get(id) else {
                continue;
            };
            let blocker = spec.predecessors.iter().find(|pred| {
                matches!(states[**pred], PhaseState::Failed | PhaseState::Skipped)
            });
            if let Some(pred) = blocker {
                let reason = match states[*pred] {
                    PhaseState::Failed => format!("dependency_failed: {pred}"),
                    _ => format!("dependency_skipped: {pred}"),
                };
                tracing::warn!(phase = id, reason = %reason, "phase skipped");
                states.insert(id, PhaseState::Skipped);
                skipped.push(SkippedPhase {
                    phase: id.to_string(),
                    reason,
                });
            }
        }
    }

    fn spawn_phase(
        &self,
        spec: PhaseSpec,
        ctx: UnitContext,
        semaphore: Arc<Semaphore>,
    ) -> impl std::future::Future<Output = (String, Result<PhaseOutput, String>)> {
        let units = self.units.clone();
        let config = self.config.clone();
        let phase_id = spec.id.to_string();

        let handle = tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| "orchestrator shut down".to_string())?;
            run_phase(spec, ctx, units, config).await
        });

        async move {
            match handle.await {
                Ok(result) => (phase_id, result),
                Err(e) => (phase_id, Err(format!("phase task panicked: {e}"))),
            }
        }
    }

    /// Persist the resumable frontier after a phase completes.
    ///
    /// The run-row mirror always carries every completed phase; the
    /// checkpoint row and progress emission go through their monotonic
    /// guards, so a lower-percent phase finishing after a higher one is a
    /// logged no-op there.
    fn checkpoint_phase(
        &self,
        run: &Run,
        phase_id: &str,
        completed: &BTreeMap<String, PhaseOutput>,
    ) -> Result<(), EngineError> {
        let overall = completed
            .keys()
            .filter_map(|id| step_percent(&phase_step_key(id)))
            .max()
            .unwrap_or(0);
        let data = serde_json::json!({ "phases": completed });

        self.registry.repo().set_checkpoint_data(&run.run_id, &data)?;
        self.registry.record_checkpoint(
            &run.run_id,
            &format!("phase_{phase_id}"),
            overall,
            data,
            false,
        )?;
        self.progress.emit(
            &run.run_id,
            &phase_step_key(phase_id),
            overall,
            &format!("{phase_id} complete"),
        )?;
        Ok(())
    }
}

/// Upstream context for a phase: the outputs of its declared predecessors.
fn phase_context(
    base: &UnitContext,
    spec: &PhaseSpec,
    completed: &BTreeMap<String, PhaseOutput>,
) -> UnitContext {
    let mut ctx = base.clone();
    ctx.upstream = spec
        .predecessors
        .iter()
        .filter_map(|pred| {
            completed
                .get(*pred)
                .map(|output| (pred.to_string(), output.unit_outputs()))
        })
        .collect();
    ctx
}

/// Run every unit of a phase concurrently and join.
///
/// The phase is done only when all units settle; it fails if any critical
/// unit fails. Unit fan-out is not separately permit-bounded: the phase
/// semaphore caps concurrent phases and no phase declares more than a
/// handful of units.
async fn run_phase(
    spec: PhaseSpec,
    ctx: UnitContext,
    units: Arc<UnitRegistry>,
    config: EngineConfig,
) -> Result<PhaseOutput, String> {
    let unit_futures = spec.units.iter().map(|unit_spec| {
        let unit = units.get(unit_spec.key);
        let ctx = ctx.clone();
        let config = config.clone();
        let unit_spec = *unit_spec;
        async move {
            match unit {
                Some(unit) => {
                    let (result, critical_failed) =
                        run_unit(unit_spec, unit, &ctx, &config).await;
                    (unit_spec.key, result, critical_failed)
                }
                None if unit_spec.critical => (
                    unit_spec.key,
                    UnitResult::Failed {
                        error: "unit not registered".to_string(),
                    },
                    true,
                ),
                None => (
                    unit_spec.key,
                    UnitResult::Fallback {
                        output: builtin::fallback_output(unit_spec.key, "unit not registered"),
                        error: "unit not registered".to_string(),
                    },
                    false,
                ),
            }
        }
    });

    let settled = futures::future::join_all(unit_futures).await;

    let mut output = PhaseOutput {
        phase: spec.id.to_string(),
        units: BTreeMap::new(),
        warnings: Vec::new(),
    };
    let mut critical_failure: Option<String> = None;

    for (key, result, critical_failed) in settled {
        match &result {
            UnitResult::Completed { output: unit_output } => {
                output.warnings.extend(unit_output.warnings.clone());
            }
            UnitResult::Fallback { error, .. } => {
                output
                    .warnings
                    .push(format!("unit {key} degraded: {error}"));
            }
            UnitResult::Failed { error } => {
                if critical_failed && critical_failure.is_none() {
                    critical_failure = Some(format!("critical unit {key} failed: {error}"));
                }
            }
        }
        output.units.insert(key.to_string(), result);
    }

    match critical_failure {
        Some(reason) => Err(reason),
        None => Ok(output),
    }
}

/// Drive one unit: per-attempt timeout, transient retries with exponential
/// backoff, then criticality-based degradation.
async fn run_unit(
    spec: UnitSpec,
    unit: Arc<dyn AnalyzerUnit>,
    ctx: &UnitContext,
    config: &EngineConfig,
) -> (UnitResult, bool) {
    let timeout = config.unit_timeout();
    let mut attempt = 0u32;

    let error = loop {
        attempt += 1;
        match tokio::time::timeout(timeout, unit.analyze(ctx)).await {
            Ok(Ok(output)) => return (UnitResult::Completed { output }, false),
            Ok(Err(e)) if e.is_retryable() && attempt <= config.unit_retries => {
                tracing::debug!(unit = spec.key, attempt, "transient unit failure, retrying: {e}");
                tokio::time::sleep(config.retry_delay(attempt)).await;
            }
            Ok(Err(e)) => {
                let exhausted = e.is_retryable();
                let e = if exhausted {
                    e.into_dependency_failure(spec.key)
                } else {
                    e
                };
                break e.to_string();
            }
            // A timeout is a unit failure, not a retryable error.
            Err(_) => break format!("timed out after {}s", timeout.as_secs()),
        }
    };

    if spec.critical {
        (UnitResult::Failed { error }, true)
    } else {
        (
            UnitResult::Fallback {
                output: builtin::fallback_output(spec.key, &error),
                error,
            },
            false,
        )
    }
}

/// Rebuild completed phase outputs from the run's checkpoint mirror,
/// dropping any phase the current graph does not know.
fn restore_phases(
    graph: &PhaseGraph,
    checkpoint_data: &serde_json::Value,
) -> BTreeMap<String, PhaseOutput> {
    let Some(phases) = checkpoint_data.get("phases") else {
        return BTreeMap::new();
    };
    let restored: BTreeMap<String, PhaseOutput> =
        serde_json::from_value(phases.clone()).unwrap_or_default();
    restored
        .into_iter()
        .filter(|(id, _)| graph.get(id).is_some())
        .collect()
}

/// Compose the final report from whatever finished.
fn synthesize(
    completed: &BTreeMap<String, PhaseOutput>,
    skipped: &[SkippedPhase],
    failures: &BTreeMap<String, String>,
) -> serde_json::Value {
    let contradictions = completed
        .get("cross_validation")
        .and_then(|phase| phase.units.get("reconciliation"))
        .and_then(|unit| unit.output())
        .and_then(|output| output.value.get("contradictions").cloned())
        .unwrap_or_else(|| serde_json::json!([]));

    let warnings: Vec<&String> = completed.values().flat_map(|p| p.warnings.iter()).collect();

    serde_json::json!({
        "phases": completed,
        "skipped": skipped,
        "failed": failures,
        "contradictions": contradictions,
        "warnings": warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::Confidence;
    use crate::repository::RunRepository;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::tempdir;

    struct RecordingUnit {
        key: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl AnalyzerUnit for RecordingUnit {
        fn key(&self) -> &str {
            self.key
        }

        async fn analyze(&self, _ctx: &UnitContext) -> Result<UnitOutput, EngineError> {
            self.log.lock().unwrap().push(self.key.to_string());
            Ok(UnitOutput::new(serde_json::json!({}), Confidence::High))
        }
    }

    struct AlwaysFailUnit {
        key: &'static str,
    }

    #[async_trait]
    impl AnalyzerUnit for AlwaysFailUnit {
        fn key(&self) -> &str {
            self.key
        }

        async fn analyze(&self, _ctx: &UnitContext) -> Result<UnitOutput, EngineError> {
            Err(EngineError::Validation("malformed input".into()))
        }
    }

    struct FlakyUnit {
        key: &'static str,
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl AnalyzerUnit for FlakyUnit {
        fn key(&self) -> &str {
            self.key
        }

        async fn analyze(&self, _ctx: &UnitContext) -> Result<UnitOutput, EngineError> {
            let remaining = self.failures_left.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_left.store(remaining - 1, Ordering::SeqCst);
                return Err(EngineError::TransientIo("socket reset".into()));
            }
            Ok(UnitOutput::new(serde_json::json!("ok"), Confidence::High))
        }
    }

    struct SlowUnit {
        key: &'static str,
    }

    #[async_trait]
    impl AnalyzerUnit for SlowUnit {
        fn key(&self) -> &str {
            self.key
        }

        async fn analyze(&self, _ctx: &UnitContext) -> Result<UnitOutput, EngineError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(UnitOutput::new(serde_json::json!({}), Confidence::High))
        }
    }

    const GRAPH_A: &[UnitSpec] = &[UnitSpec::critical("unit_a")];
    const GRAPH_B: &[UnitSpec] = &[UnitSpec::critical("unit_b")];
    const GRAPH_C: &[UnitSpec] = &[UnitSpec::critical("unit_c")];

    fn ordered_graph() -> PhaseGraph {
        PhaseGraph::new(&[
            PhaseSpec {
                id: "alpha",
                predecessors: &[],
                units: GRAPH_A,
            },
            PhaseSpec {
                id: "beta",
                predecessors: &[],
                units: GRAPH_B,
            },
            PhaseSpec {
                id: "gamma",
                predecessors: &["alpha", "beta"],
                units: GRAPH_C,
            },
        ])
        .unwrap()
    }

    struct Harness {
        _dir: tempfile::TempDir,
        registry: Arc<RunRegistry>,
        progress: Arc<ProgressSequencer>,
        config: EngineConfig,
    }

    fn harness() -> Harness {
        let dir = tempdir().unwrap();
        let repo = RunRepository::new(&dir.path().join("test.db")).unwrap();
        let progress = Arc::new(ProgressSequencer::new(repo.clone()));
        let registry = Arc::new(RunRegistry::new(
            repo,
            progress.clone(),
            chrono::Duration::seconds(300),
        ));
        let mut config = EngineConfig::at(dir.path(), "test-secret");
        config.retry_base_ms = 1;
        Harness {
            _dir: dir,
            registry,
            progress,
            config,
        }
    }

    fn base_ctx(run: &Run) -> UnitContext {
        UnitContext {
            run_id: run.run_id.clone(),
            document_id: run.document_id.clone(),
            artifacts: Arc::new(Default::default()),
            full_text: Arc::new(String::new()),
            upstream: BTreeMap::new(),
            diagrams: Vec::new(),
        }
    }

    fn orchestrator(
        h: &Harness,
        graph: PhaseGraph,
        units: UnitRegistry,
    ) -> PhaseOrchestrator {
        PhaseOrchestrator::new(
            Arc::new(graph),
            Arc::new(units),
            h.registry.clone(),
            h.progress.clone(),
            h.config.clone(),
        )
    }

    #[tokio::test]
    async fn test_dependency_ordering_enforced() {
        let h = harness();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut units = UnitRegistry::new();
        for key in ["unit_a", "unit_b", "unit_c"] {
            units.register(Arc::new(RecordingUnit {
                key,
                log: log.clone(),
            }));
        }
        let run = h.registry.start_or_resume("doc", "user", false, None).unwrap();
        let orch = orchestrator(&h, ordered_graph(), units);

        let outcome = orch.execute(&run, base_ctx(&run)).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);

        let order = log.lock().unwrap().clone();
        let pos = |k: &str| order.iter().position(|x| x == k).unwrap();
        // gamma never runs before both predecessors are done.
        assert!(pos("unit_c") > pos("unit_a"));
        assert!(pos("unit_c") > pos("unit_b"));
    }

    #[tokio::test]
    async fn test_critical_failure_skips_dependents_and_reports_partial() {
        let h = harness();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut units = UnitRegistry::new();
        units.register(Arc::new(RecordingUnit {
            key: "unit_a",
            log: log.clone(),
        }));
        units.register(Arc::new(AlwaysFailUnit { key: "unit_b" }));
        units.register(Arc::new(RecordingUnit {
            key: "unit_c",
            log: log.clone(),
        }));
        let run = h.registry.start_or_resume("doc", "user", false, None).unwrap();
        let orch = orchestrator(&h, ordered_graph(), units);

        let outcome = orch.execute(&run, base_ctx(&run)).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Partial);
        assert!(outcome.failures.contains_key("beta"));
        assert_eq!(outcome.skipped.len(), 1);
        assert_eq!(outcome.skipped[0].phase, "gamma");
        assert_eq!(outcome.skipped[0].reason, "dependency_failed: beta");
        // The independent phase still completed.
        assert!(outcome.phases.contains_key("alpha"));
        // The skip is visible in the synthesis, never silently dropped.
        assert_eq!(outcome.synthesis["skipped"][0]["phase"], "gamma");
    }

    #[tokio::test]
    async fn test_non_critical_failure_degrades_to_fallback() {
        const SOFT: &[UnitSpec] = &[UnitSpec::optional("soft"), UnitSpec::critical("hard")];
        let h = harness();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut units = UnitRegistry::new();
        units.register(Arc::new(AlwaysFailUnit { key: "soft" }));
        units.register(Arc::new(RecordingUnit {
            key: "hard",
            log: log.clone(),
        }));
        let graph = PhaseGraph::new(&[PhaseSpec {
            id: "only",
            predecessors: &[],
            units: SOFT,
        }])
        .unwrap();
        let run = h.registry.start_or_resume("doc", "user", false, None).unwrap();
        let orch = orchestrator(&h, graph, units);

        let outcome = orch.execute(&run, base_ctx(&run)).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        let phase = &outcome.phases["only"];
        assert!(matches!(phase.units["soft"], UnitResult::Fallback { .. }));
        assert!(matches!(phase.units["hard"], UnitResult::Completed { .. }));
        assert!(!phase.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_transient_failures_retried_until_success() {
        const FLAKY: &[UnitSpec] = &[UnitSpec::critical("flaky")];
        let h = harness();
        let mut units = UnitRegistry::new();
        units.register(Arc::new(FlakyUnit {
            key: "flaky",
            failures_left: AtomicU32::new(2),
        }));
        let graph = PhaseGraph::new(&[PhaseSpec {
            id: "only",
            predecessors: &[],
            units: FLAKY,
        }])
        .unwrap();
        let run = h.registry.start_or_resume("doc", "user", false, None).unwrap();
        let orch = orchestrator(&h, graph, units);

        let outcome = orch.execute(&run, base_ctx(&run)).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_timeout_fails_critical_unit() {
        const SLOW: &[UnitSpec] = &[UnitSpec::critical("slow")];
        let mut h = harness();
        h.config.unit_timeout_secs = 0;
        let mut units = UnitRegistry::new();
        units.register(Arc::new(SlowUnit { key: "slow" }));
        let graph = PhaseGraph::new(&[PhaseSpec {
            id: "only",
            predecessors: &[],
            units: SLOW,
        }])
        .unwrap();
        let run = h.registry.start_or_resume("doc", "user", false, None).unwrap();
        let orch = orchestrator(&h, graph, units);

        let outcome = orch.execute(&run, base_ctx(&run)).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Failed);
        assert!(outcome.failures["only"].contains("timed out"));
    }

    #[tokio::test]
    async fn test_cancellation_dispatches_nothing() {
        let h = harness();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut units = UnitRegistry::new();
        for key in ["unit_a", "unit_b", "unit_c"] {
            units.register(Arc::new(RecordingUnit {
                key,
                log: log.clone(),
            }));
        }
        let run = h.registry.start_or_resume("doc", "user", false, None).unwrap();
        h.registry.request_cancel(&run.run_id).unwrap();
        let orch = orchestrator(&h, ordered_graph(), units);

        let outcome = orch.execute(&run, base_ctx(&run)).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Cancelled);
        assert!(outcome.phases.is_empty());
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resume_skips_checkpointed_phases() {
        let h = harness();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut units = UnitRegistry::new();
        for key in ["unit_a", "unit_b", "unit_c"] {
            units.register(Arc::new(RecordingUnit {
                key,
                log: log.clone(),
            }));
        }
        let run = h.registry.start_or_resume("doc", "user", false, None).unwrap();
        let orch = orchestrator(&h, ordered_graph(), units);

        // First pass completes everything.
        let outcome = orch.execute(&run, base_ctx(&run)).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        log.lock().unwrap().clear();

        // Replaying with the checkpoint mirror re-runs nothing.
        let resumed = h.registry.get(&run.run_id).unwrap().unwrap();
        let outcome = orch.execute(&resumed, base_ctx(&resumed)).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        assert!(log.lock().unwrap().is_empty());
    }
}
