//! Content-addressed artifact store with single-flight computation.
//!
//! `resolve_or_compute` is the one primitive every artifact consumer goes
//! through: look up, and only compute what is missing while holding the
//! per-address advisory lock. The lock is two layers deep: a keyed async
//! mutex serializes tasks in this process, and a database lease serializes
//! workers across processes. Together they guarantee at most one computation
//! per `(address, page)` is in flight cluster-wide.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::EngineError;
use crate::models::{
    word_count, Artifact, ArtifactKind, ArtifactSet, ContentAddress, UserDocumentLink,
};
use crate::repository::ArtifactRepository;
use crate::storage;

/// How long a lease-blocked caller sleeps before re-checking.
const LEASE_POLL: Duration = Duration::from_millis(200);

/// Output of the extraction collaborator for one page.
#[derive(Debug, Clone)]
pub struct ComputedPage {
    /// 1-based page number.
    pub page_number: u32,
    pub text: String,
    /// Layout/tables when the extractor produces them.
    pub structured: Option<serde_json::Value>,
    /// Rendered page image, if the extractor produces one.
    pub image: Option<Vec<u8>>,
}

/// The `compute_fn` seam: invoked only for pages whose artifacts are absent.
#[async_trait]
pub trait PageComputer: Send + Sync {
    async fn compute(
        &self,
        address: &ContentAddress,
        pages: &[u32],
    ) -> Result<Vec<ComputedPage>, EngineError>;
}

/// Content-addressed, immutable artifact storage.
pub struct ArtifactStore {
    repo: ArtifactRepository,
    blobs_dir: PathBuf,
    /// Identifies this process as a lease holder.
    holder_id: String,
    lease_ttl: chrono::Duration,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ArtifactStore {
    pub fn new(repo: ArtifactRepository, blobs_dir: PathBuf, lease_ttl: chrono::Duration) -> Self {
        Self {
            repo,
            blobs_dir,
            holder_id: uuid::Uuid::new_v4().to_string(),
            lease_ttl,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn repo(&self) -> &ArtifactRepository {
        &self.repo
    }

    fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("lock map poisoned");
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Resolve the artifact set for an address, computing missing pages.
    ///
    /// The dominant path for duplicate documents is the first lookup: fully
    /// present artifacts return without touching the lock or `compute_fn`.
    /// Otherwise the caller serializes on the per-address lock, re-checks,
    /// and computes only what is still missing. If `compute_fn` fails, no
    /// artifact is committed for the failing pages and the lock is released
    /// so a later retry can attempt again; pages persisted earlier remain
    /// usable.
    pub async fn resolve_or_compute(
        &self,
        address: &ContentAddress,
        page_count: u32,
        computer: &dyn PageComputer,
    ) -> Result<ArtifactSet, EngineError> {
        let existing = self.repo.get_set(address)?;
        if existing.covers(page_count) {
            tracing::debug!(address = address.short(), "artifact cache hit");
            return Ok(existing);
        }

        let key = address.lock_key();
        let lock = self.lock_for(&key);
        let _guard = lock.lock().await;

        // Cross-process lease. While another holder computes, poll for its
        // result instead of queueing a duplicate computation.
        loop {
            if self
                .repo
                .try_acquire_lease(&key, &self.holder_id, self.lease_ttl)?
            {
                break;
            }
            tokio::time::sleep(LEASE_POLL).await;
            let current = self.repo.get_set(address)?;
            if current.covers(page_count) {
                return Ok(current);
            }
        }

        let result = self.compute_missing(address, page_count, computer).await;
        if let Err(e) = self.repo.release_lease(&key, &self.holder_id) {
            tracing::warn!(address = address.short(), "lease release failed: {e}");
        }
        result
    }

    async fn compute_missing(
        &self,
        address: &ContentAddress,
        page_count: u32,
        computer: &dyn PageComputer,
    ) -> Result<ArtifactSet, EngineError> {
        // Re-check under the lock: a racing worker may have finished while
        // we waited.
        let set = self.repo.get_set(address)?;
        let missing = set.missing_text_pages(page_count);

        if !missing.is_empty() {
            tracing::info!(
                address = address.short(),
                pages = missing.len(),
                "computing missing page artifacts"
            );
            let computed = computer.compute(address, &missing).await?;
            for page in &computed {
                self.persist_page(address, page)?;
            }

            let still_missing = self.repo.get_set(address)?.missing_text_pages(page_count);
            if !still_missing.is_empty() {
                return Err(EngineError::TransientIo(format!(
                    "extractor returned no output for pages {still_missing:?}"
                )));
            }
        }

        self.ensure_full_text(address, page_count)?;
        Ok(self.repo.get_set(address)?)
    }

    fn persist_page(&self, address: &ContentAddress, page: &ComputedPage) -> Result<(), EngineError> {
        let (path, checksum) = storage::write_blob(&self.blobs_dir, page.text.as_bytes(), "txt")?;
        self.repo.insert_if_absent(&Artifact {
            id: 0,
            address: address.clone(),
            kind: ArtifactKind::PageText,
            page_number: page.page_number,
            sub_key: None,
            blob_path: path,
            checksum,
            byte_len: page.text.len() as u64,
            word_count: Some(word_count(&page.text)),
            created_at: Utc::now(),
        })?;

        if let Some(structured) = &page.structured {
            let encoded = structured.to_string();
            let (path, checksum) =
                storage::write_blob(&self.blobs_dir, encoded.as_bytes(), "json")?;
            self.repo.insert_if_absent(&Artifact {
                id: 0,
                address: address.clone(),
                kind: ArtifactKind::PageStructuredData,
                page_number: page.page_number,
                sub_key: None,
                blob_path: path,
                checksum,
                byte_len: encoded.len() as u64,
                word_count: None,
                created_at: Utc::now(),
            })?;
        }

        if let Some(image) = &page.image {
            let (path, checksum) = storage::write_blob(&self.blobs_dir, image, "png")?;
            self.repo.insert_if_absent(&Artifact {
                id: 0,
                address: address.clone(),
                kind: ArtifactKind::PageImage,
                page_number: page.page_number,
                sub_key: None,
                blob_path: path,
                checksum,
                byte_len: image.len() as u64,
                word_count: None,
                created_at: Utc::now(),
            })?;
        }

        Ok(())
    }

    /// Compose the document-scope full text once every page is present.
    fn ensure_full_text(&self, address: &ContentAddress, page_count: u32) -> Result<(), EngineError> {
        let set = self.repo.get_set(address)?;
        if set.full_text().is_some() || !set.missing_text_pages(page_count).is_empty() {
            return Ok(());
        }

        let mut combined = String::new();
        for page in 1..=page_count {
            if let Some(artifact) = set.page_text(page) {
                let text = storage::read_text_blob(&artifact.blob_path)?;
                if !combined.is_empty() {
                    combined.push('\n');
                }
                combined.push_str(&text);
            }
        }

        let (path, checksum) = storage::write_blob(&self.blobs_dir, combined.as_bytes(), "txt")?;
        self.repo.insert_if_absent(&Artifact {
            id: 0,
            address: address.clone(),
            kind: ArtifactKind::FullText,
            page_number: 0,
            sub_key: None,
            blob_path: path,
            checksum,
            byte_len: combined.len() as u64,
            word_count: Some(word_count(&combined)),
            created_at: Utc::now(),
        })?;
        Ok(())
    }

    /// Bind a user-visible document to every artifact in the set.
    pub fn link_user_document(
        &self,
        user_id: &str,
        document_id: &str,
        set: &ArtifactSet,
    ) -> Result<Vec<UserDocumentLink>, EngineError> {
        let mut links = Vec::with_capacity(set.len());
        for artifact in set.iter() {
            let link = UserDocumentLink::new(user_id, document_id, artifact);
            self.repo.insert_link(&link)?;
            links.push(link);
        }
        Ok(links)
    }

    /// Remove one user's links. Shared artifacts are untouched.
    pub fn delete_user_document(&self, user_id: &str, document_id: &str) -> Result<usize, EngineError> {
        Ok(self.repo.delete_document_links(user_id, document_id)?)
    }

    /// Out-of-band garbage collection: delete artifacts (rows and blobs)
    /// whose address no user link references. Returns the number of
    /// addresses collected.
    pub fn gc_unreferenced(&self) -> Result<usize, EngineError> {
        let addresses = self.repo.unreferenced_addresses()?;
        let mut collected = 0;
        for address in addresses {
            // Re-check per address: a link may have appeared since the scan.
            if self.repo.address_referenced(&address)? {
                continue;
            }
            let paths = self.repo.delete_address(&address)?;
            for path in paths {
                match std::fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        tracing::warn!("failed to remove blob {}: {e}", path.display());
                    }
                }
            }
            collected += 1;
        }
        Ok(collected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProcessingParams;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct CountingComputer {
        calls: AtomicUsize,
    }

    impl CountingComputer {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PageComputer for CountingComputer {
        async fn compute(
            &self,
            _address: &ContentAddress,
            pages: &[u32],
        ) -> Result<Vec<ComputedPage>, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(pages
                .iter()
                .map(|p| ComputedPage {
                    page_number: *p,
                    text: format!("page {p} text"),
                    structured: None,
                    image: None,
                })
                .collect())
        }
    }

    struct FailingComputer;

    #[async_trait]
    impl PageComputer for FailingComputer {
        async fn compute(
            &self,
            _address: &ContentAddress,
            _pages: &[u32],
        ) -> Result<Vec<ComputedPage>, EngineError> {
            Err(EngineError::TransientIo("extractor offline".into()))
        }
    }

    fn store() -> (tempfile::TempDir, Arc<ArtifactStore>) {
        let dir = tempdir().unwrap();
        let repo = ArtifactRepository::new(&dir.path().join("test.db")).unwrap();
        let store = ArtifactStore::new(repo, dir.path().join("blobs"), chrono::Duration::seconds(60));
        (dir, Arc::new(store))
    }

    fn address(content: &[u8]) -> ContentAddress {
        ContentAddress::derive(b"test-secret", content, &ProcessingParams::default())
    }

    #[tokio::test]
    async fn test_second_resolve_is_cache_hit() {
        let (_dir, store) = store();
        let addr = address(b"doc");
        let computer = CountingComputer::new();

        let first = store.resolve_or_compute(&addr, 2, &computer).await.unwrap();
        assert!(first.covers(2));
        let second = store.resolve_or_compute(&addr, 2, &computer).await.unwrap();
        assert!(second.covers(2));

        assert_eq!(computer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_identical_artifact_ids_across_callers() {
        let (_dir, store) = store();
        let addr = address(b"doc");
        let computer = CountingComputer::new();

        let first = store.resolve_or_compute(&addr, 1, &computer).await.unwrap();
        let second = store.resolve_or_compute(&addr, 1, &computer).await.unwrap();

        let first_ids: Vec<i64> = first.iter().map(|a| a.id).collect();
        let second_ids: Vec<i64> = second.iter().map(|a| a.id).collect();
        assert_eq!(first_ids, second_ids);
    }

    #[tokio::test]
    async fn test_concurrent_resolves_compute_once() {
        let (_dir, store) = store();
        let addr = address(b"doc");
        let computer = Arc::new(CountingComputer::new());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let addr = addr.clone();
            let computer = computer.clone();
            handles.push(tokio::spawn(async move {
                store.resolve_or_compute(&addr, 3, computer.as_ref()).await
            }));
        }
        for handle in handles {
            let set = handle.await.unwrap().unwrap();
            assert!(set.covers(3));
        }

        assert_eq!(computer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_compute_commits_nothing_and_releases_lock() {
        let (_dir, store) = store();
        let addr = address(b"doc");

        let err = store
            .resolve_or_compute(&addr, 1, &FailingComputer)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(store.repo().get_set(&addr).unwrap().is_empty());

        // The lock was released, so a retry with a working extractor
        // succeeds.
        let computer = CountingComputer::new();
        let set = store.resolve_or_compute(&addr, 1, &computer).await.unwrap();
        assert!(set.covers(1));
    }

    #[tokio::test]
    async fn test_full_text_composed_in_page_order() {
        let (_dir, store) = store();
        let addr = address(b"doc");
        let set = store
            .resolve_or_compute(&addr, 2, &CountingComputer::new())
            .await
            .unwrap();

        let full = set.full_text().unwrap();
        let text = storage::read_text_blob(&full.blob_path).unwrap();
        assert_eq!(text, "page 1 text\npage 2 text");
        assert_eq!(full.word_count, Some(6));
    }

    #[tokio::test]
    async fn test_gc_respects_links() {
        let (_dir, store) = store();
        let addr = address(b"doc");
        let set = store
            .resolve_or_compute(&addr, 1, &CountingComputer::new())
            .await
            .unwrap();

        store.link_user_document("user-a", "doc-a", &set).unwrap();
        assert_eq!(store.gc_unreferenced().unwrap(), 0);

        store.delete_user_document("user-a", "doc-a").unwrap();
        assert_eq!(store.gc_unreferenced().unwrap(), 1);
        assert!(store.repo().get_set(&addr).unwrap().is_empty());
    }
}
