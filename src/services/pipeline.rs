//! End-to-end processing pipeline.
//!
//! Composes the artifact store, diagram extraction, phase orchestration,
//! checkpointing, and progress sequencing into the run lifecycle: submit
//! bytes, derive the content address, resolve or compute artifacts, link
//! them to the submitting user, analyze, synthesize.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::analysis::{contract_graph, step_percent, UnitContext, UnitRegistry};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::models::{ArtifactKind, ContentAddress, Run, RunStatus, ALGORITHM_VERSION};
use crate::repository::{ArtifactRepository, RunRepository};
use crate::services::artifact_store::{ArtifactStore, ComputedPage, PageComputer};
use crate::services::diagram::DiagramExtractor;
use crate::services::orchestrator::PhaseOrchestrator;
use crate::services::progress::ProgressSequencer;
use crate::services::recovery::RunResumer;
use crate::services::runs::RunRegistry;
use crate::storage;

/// Extraction collaborator at the ingestion boundary. Supplies per-page
/// text (and optionally structure and images) from raw document bytes.
#[async_trait]
pub trait PageExtractor: Send + Sync {
    async fn page_count(&self, content: &[u8]) -> Result<u32, EngineError>;

    async fn extract_pages(
        &self,
        content: &[u8],
        pages: &[u32],
    ) -> Result<Vec<ComputedPage>, EngineError>;
}

/// Extractor for plain-text documents: form feeds delimit pages.
pub struct PlainTextExtractor;

#[async_trait]
impl PageExtractor for PlainTextExtractor {
    async fn page_count(&self, content: &[u8]) -> Result<u32, EngineError> {
        let text = std::str::from_utf8(content)
            .map_err(|_| EngineError::Validation("document is not valid UTF-8 text".into()))?;
        Ok(text.split('\x0c').count() as u32)
    }

    async fn extract_pages(
        &self,
        content: &[u8],
        pages: &[u32],
    ) -> Result<Vec<ComputedPage>, EngineError> {
        let text = std::str::from_utf8(content)
            .map_err(|_| EngineError::Validation("document is not valid UTF-8 text".into()))?;
        let all: Vec<&str> = text.split('\x0c').collect();
        let mut out = Vec::with_capacity(pages.len());
        for page in pages {
            let index = (*page as usize).saturating_sub(1);
            let Some(page_text) = all.get(index) else {
                return Err(EngineError::Validation(format!(
                    "page {page} out of range ({} pages)",
                    all.len()
                )));
            };
            out.push(ComputedPage {
                page_number: *page,
                text: page_text.to_string(),
                structured: None,
                image: None,
            });
        }
        Ok(out)
    }
}

/// Adapts the ingestion extractor plus one document's bytes to the artifact
/// store's compute seam.
struct ExtractorComputer {
    extractor: Arc<dyn PageExtractor>,
    content: Arc<Vec<u8>>,
}

#[async_trait]
impl PageComputer for ExtractorComputer {
    async fn compute(
        &self,
        _address: &ContentAddress,
        pages: &[u32],
    ) -> Result<Vec<ComputedPage>, EngineError> {
        self.extractor.extract_pages(&self.content, pages).await
    }
}

/// One submission for batch processing.
pub struct ProcessJob {
    pub document_id: String,
    pub user_id: String,
    pub content: Vec<u8>,
}

/// The assembled engine.
pub struct Pipeline {
    config: EngineConfig,
    store: Arc<ArtifactStore>,
    diagrams: DiagramExtractor,
    registry: Arc<RunRegistry>,
    progress: Arc<ProgressSequencer>,
    orchestrator: PhaseOrchestrator,
    extractor: Arc<dyn PageExtractor>,
}

impl Pipeline {
    /// Build a pipeline over the configured database and blob directory.
    ///
    /// `units` may override any analyzer unit; keys the caller does not
    /// provide fall back to the deterministic builtins so the fixed graph
    /// is always fully resolvable.
    pub fn new(
        config: EngineConfig,
        units: UnitRegistry,
        extractor: Arc<dyn PageExtractor>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let graph = Arc::new(contract_graph()?);

        let mut registry_units = UnitRegistry::new();
        crate::analysis::builtin::register_builtins(&mut registry_units, &graph);
        let override_keys: Vec<String> = units.keys().map(|k| k.to_string()).collect();
        for key in override_keys {
            if let Some(unit) = units.get(&key) {
                registry_units.register(unit);
            }
        }
        let registry_units = Arc::new(registry_units);

        let artifact_repo = ArtifactRepository::new(&config.db_path)?;
        let run_repo = RunRepository::new(&config.db_path)?;

        let store = Arc::new(ArtifactStore::new(
            artifact_repo.clone(),
            config.blobs_dir.clone(),
            config.staleness(),
        ));
        let diagrams = DiagramExtractor::new(artifact_repo, config.blobs_dir.clone());
        let progress = Arc::new(ProgressSequencer::new(run_repo.clone()));
        let registry = Arc::new(RunRegistry::new(
            run_repo,
            progress.clone(),
            config.staleness(),
        ));
        let orchestrator = PhaseOrchestrator::new(
            graph,
            registry_units,
            registry.clone(),
            progress.clone(),
            config.clone(),
        );

        Ok(Self {
            config,
            store,
            diagrams,
            registry,
            progress,
            orchestrator,
            extractor,
        })
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    pub fn progress(&self) -> &Arc<ProgressSequencer> {
        &self.progress
    }

    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    /// Submit a document for processing. Idempotent unless `force_restart`.
    pub fn submit(
        &self,
        document_id: &str,
        user_id: &str,
        force_restart: bool,
        restart_from_step: Option<&str>,
    ) -> Result<Run, EngineError> {
        self.registry
            .start_or_resume(document_id, user_id, force_restart, restart_from_step)
    }

    /// Drive a run to completion over the supplied bytes.
    pub async fn process(&self, run_id: &str, content: &[u8]) -> Result<Run, EngineError> {
        let run = self
            .registry
            .get(run_id)?
            .ok_or_else(|| EngineError::Validation(format!("unknown run: {run_id}")))?;
        if run.status.is_terminal() {
            return Ok(run);
        }

        match self.process_inner(&run, content).await {
            Ok(run) => Ok(run),
            Err(e) => {
                // Validation and fatal errors surface with the run marked
                // failed; transient errors leave retry bookkeeping behind.
                tracing::warn!(run_id, "run failed: {e}");
                self.registry.repo().increment_retry(run_id)?;
                self.registry.repo().set_error(run_id, Some(&e.to_string()))?;
                self.registry.repo().update_status(run_id, RunStatus::Failed)?;
                Err(e)
            }
        }
    }

    /// Submit and process in one call.
    pub async fn submit_and_process(
        &self,
        document_id: &str,
        user_id: &str,
        content: &[u8],
    ) -> Result<Run, EngineError> {
        let run = self.submit(document_id, user_id, false, None)?;
        self.process(&run.run_id, content).await
    }

    async fn process_inner(&self, run: &Run, content: &[u8]) -> Result<Run, EngineError> {
        let run_id = run.run_id.as_str();
        self.registry.repo().update_status(run_id, RunStatus::Started)?;
        self.emit(run_id, "received", "document received")?;

        validate_content(content)?;

        let address =
            ContentAddress::derive(self.config.address_secret.as_bytes(), content, &self.config.params);
        self.registry
            .repo()
            .set_content_hmac(run_id, &address.content_hmac)?;
        self.emit(run_id, "address_derived", "content address derived")?;
        self.registry.record_checkpoint(
            run_id,
            "address_derived",
            step_percent("address_derived").unwrap_or(5),
            serde_json::json!({ "content_hmac": address.content_hmac }),
            false,
        )?;

        let page_count = self.extractor.page_count(content).await?;
        self.registry.repo().update_status(run_id, RunStatus::Processing)?;

        let computer = ExtractorComputer {
            extractor: self.extractor.clone(),
            content: Arc::new(content.to_vec()),
        };
        let set = self
            .store
            .resolve_or_compute(&address, page_count, &computer)
            .await?;
        self.store
            .link_user_document(&run.user_id, &run.document_id, &set)?;
        self.emit(run_id, "artifacts_resolved", "page artifacts resolved")?;
        self.registry.record_checkpoint(
            run_id,
            "artifacts_resolved",
            step_percent("artifacts_resolved").unwrap_or(20),
            serde_json::json!({
                "content_hmac": address.content_hmac,
                "page_count": page_count,
            }),
            false,
        )?;

        let diagram_artifacts = self.diagrams.extract(&set)?;
        self.emit(run_id, "diagrams_extracted", "inline diagrams extracted")?;

        let full_text = match set.full_text() {
            Some(artifact) => storage::read_text_blob(&artifact.blob_path)?,
            None => String::new(),
        };
        let ctx = UnitContext {
            run_id: run.run_id.clone(),
            document_id: run.document_id.clone(),
            artifacts: Arc::new(set),
            full_text: Arc::new(full_text),
            upstream: Default::default(),
            diagrams: diagram_artifacts,
        };

        // Reload: the checkpoint mirror may hold phases from a prior attempt.
        let current = self
            .registry
            .get(run_id)?
            .ok_or_else(|| EngineError::FatalConfig("run vanished mid-process".into()))?;
        self.finish(&current, ctx).await
    }

    /// Run the phase graph and finalize status, synthesis, and progress.
    async fn finish(&self, run: &Run, ctx: UnitContext) -> Result<Run, EngineError> {
        let run_id = run.run_id.as_str();
        let outcome = self.orchestrator.execute(run, ctx).await?;

        if outcome.status == RunStatus::Cancelled {
            self.registry.repo().update_status(run_id, RunStatus::Cancelled)?;
            self.progress.close(run_id);
            return Ok(self.reload(run_id)?);
        }

        self.emit(run_id, "synthesis", "composing final report")?;
        self.registry.record_checkpoint(
            run_id,
            "synthesis",
            step_percent("synthesis").unwrap_or(97),
            outcome.synthesis.clone(),
            false,
        )?;

        if outcome.status == RunStatus::Partial {
            let summary: Vec<String> = outcome
                .skipped
                .iter()
                .map(|s| format!("{}: {}", s.phase, s.reason))
                .collect();
            self.registry
                .repo()
                .set_error(run_id, Some(&format!("skipped phases: {}", summary.join("; "))))?;
        } else if outcome.status == RunStatus::Failed {
            let summary: Vec<String> = outcome
                .failures
                .iter()
                .map(|(phase, reason)| format!("{phase}: {reason}"))
                .collect();
            self.registry
                .repo()
                .set_error(run_id, Some(&format!("failed phases: {}", summary.join("; "))))?;
        }

        self.registry.repo().update_status(run_id, outcome.status)?;
        if matches!(outcome.status, RunStatus::Completed | RunStatus::Partial) {
            self.emit(run_id, "completed", "analysis complete")?;
        }
        self.progress.close(run_id);
        self.reload(run_id)
    }

    /// Resume a previously-started run from its checkpoints. Artifacts must
    /// already exist for the run's content address; recovery never re-reads
    /// original bytes.
    pub async fn resume(&self, run_id: &str) -> Result<Run, EngineError> {
        let run = self
            .registry
            .get(run_id)?
            .ok_or_else(|| EngineError::Validation(format!("unknown run: {run_id}")))?;

        let validation = self.registry.validate_resume(run_id)?;
        if !validation.valid {
            if validation.reason.as_deref() == Some("already_completed") {
                self.registry.repo().update_status(run_id, RunStatus::Completed)?;
                return self.reload(run_id);
            }
            return Err(EngineError::Validation(format!(
                "resume invalid: {}",
                validation.reason.unwrap_or_default()
            )));
        }

        let Some(content_hmac) = run.content_hmac.clone() else {
            return Err(EngineError::Validation(
                "run has no content address yet; resubmit the document bytes".into(),
            ));
        };
        let address = ContentAddress {
            content_hmac,
            algorithm_version: ALGORITHM_VERSION,
            params_fingerprint: self.config.params.fingerprint(),
        };

        let set = self.store.repo().get_set(&address)?;
        let Some(full) = set.full_text() else {
            return Err(EngineError::Validation(
                "artifacts missing for this address; resubmit the document bytes".into(),
            ));
        };
        let full_text = storage::read_text_blob(&full.blob_path)?;
        let diagrams = set.of_kind(ArtifactKind::SubImage).cloned().collect();

        self.registry.repo().update_status(run_id, RunStatus::Processing)?;
        let ctx = UnitContext {
            run_id: run.run_id.clone(),
            document_id: run.document_id.clone(),
            artifacts: Arc::new(set),
            full_text: Arc::new(full_text),
            upstream: Default::default(),
            diagrams,
        };
        self.finish(&run, ctx).await
    }

    /// Process a batch of submissions with the configured worker count.
    pub async fn process_batch(&self, jobs: Vec<ProcessJob>) -> Vec<Result<Run, EngineError>> {
        let semaphore = Arc::new(Semaphore::new(self.config.workers));
        let mut results = Vec::with_capacity(jobs.len());

        let futures = jobs.into_iter().map(|job| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|_| EngineError::FatalConfig("worker pool shut down".into()))?;
                self.submit_and_process(&job.document_id, &job.user_id, &job.content)
                    .await
            }
        });
        for result in futures::future::join_all(futures).await {
            results.push(result);
        }
        results
    }

    /// Delete one user's document links; shared artifacts are untouched.
    pub fn delete_user_document(&self, user_id: &str, document_id: &str) -> Result<usize, EngineError> {
        self.store.delete_user_document(user_id, document_id)
    }

    /// Out-of-band artifact garbage collection.
    pub fn gc_artifacts(&self) -> Result<usize, EngineError> {
        self.store.gc_unreferenced()
    }

    fn emit(&self, run_id: &str, step_key: &str, description: &str) -> Result<(), EngineError> {
        if let Some(percent) = step_percent(step_key) {
            self.progress.emit(run_id, step_key, percent, description)?;
        }
        Ok(())
    }

    fn reload(&self, run_id: &str) -> Result<Run, EngineError> {
        self.registry
            .get(run_id)?
            .ok_or_else(|| EngineError::FatalConfig("run vanished".into()))
    }
}

#[async_trait]
impl RunResumer for Pipeline {
    async fn resume(&self, run: Run) -> Result<(), EngineError> {
        Pipeline::resume(self, &run.run_id).await.map(|_| ())
    }
}

/// Structural check at the ingestion boundary: the engine accepts PDFs and
/// plain text; anything else is rejected before any work is scheduled.
fn validate_content(content: &[u8]) -> Result<(), EngineError> {
    if content.is_empty() {
        return Err(EngineError::Validation("document is empty".into()));
    }
    match infer::get(content) {
        Some(kind) if kind.mime_type() == "application/pdf" => Ok(()),
        Some(kind) => Err(EngineError::Validation(format!(
            "unsupported content type: {}",
            kind.mime_type()
        ))),
        // No magic bytes: require readable text.
        None => match std::str::from_utf8(content) {
            Ok(_) => Ok(()),
            Err(_) => Err(EngineError::Validation(
                "content is neither a known document format nor text".into(),
            )),
        },
    }
}
