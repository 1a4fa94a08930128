//! Inline diagram extraction.
//!
//! Scans page text and structured-data artifacts for embedded base64 image
//! payloads (plans, survey diagrams), decodes them, and stores each as its
//! own artifact keyed by `(address, page, checksum)`. The checksum key makes
//! re-extraction idempotent even when the same image appears verbatim on
//! multiple pages or across reprocessing.

use std::path::PathBuf;
use std::sync::LazyLock;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use regex::Regex;

use crate::error::EngineError;
use crate::models::{Artifact, ArtifactKind, ArtifactSet};
use crate::repository::ArtifactRepository;
use crate::storage;

static DATA_URI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"data:image/(?:png|jpe?g|gif);base64,([A-Za-z0-9+/]+={0,2})").unwrap()
});

/// Extracts embedded images from text artifacts into sub-image artifacts.
pub struct DiagramExtractor {
    repo: ArtifactRepository,
    blobs_dir: PathBuf,
}

impl DiagramExtractor {
    pub fn new(repo: ArtifactRepository, blobs_dir: PathBuf) -> Self {
        Self { repo, blobs_dir }
    }

    /// Scan the set's text-bearing artifacts and store every decoded image.
    ///
    /// Returns the stored sub-image artifacts, including ones that already
    /// existed from a previous extraction.
    pub fn extract(&self, set: &ArtifactSet) -> Result<Vec<Artifact>, EngineError> {
        let mut found = Vec::new();
        let sources = set
            .of_kind(ArtifactKind::PageText)
            .chain(set.of_kind(ArtifactKind::PageStructuredData));

        for source in sources {
            let text = storage::read_text_blob(&source.blob_path)?;
            for caps in DATA_URI.captures_iter(&text) {
                let Ok(payload) = BASE64.decode(&caps[1]) else {
                    tracing::debug!(
                        page = source.page_number,
                        "skipping undecodable inline payload"
                    );
                    continue;
                };
                // The declared mime can lie; trust the magic bytes.
                if !infer::is_image(&payload) {
                    continue;
                }

                let sub_key = blake3::hash(&payload).to_hex().to_string();
                let extension = infer::get(&payload).map(|t| t.extension()).unwrap_or("png");
                let (path, checksum) = storage::write_blob(&self.blobs_dir, &payload, extension)?;

                let stored = self.repo.insert_if_absent(&Artifact {
                    id: 0,
                    address: source.address.clone(),
                    kind: ArtifactKind::SubImage,
                    page_number: source.page_number,
                    sub_key: Some(sub_key),
                    blob_path: path,
                    checksum,
                    byte_len: payload.len() as u64,
                    word_count: None,
                    created_at: Utc::now(),
                })?;
                if !found.iter().any(|a: &Artifact| a.id == stored.id) {
                    found.push(stored);
                }
            }
        }

        if !found.is_empty() {
            tracing::info!(count = found.len(), "extracted inline diagrams");
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContentAddress, ProcessingParams};
    use crate::services::artifact_store::{ArtifactStore, ComputedPage, PageComputer};
    use async_trait::async_trait;
    use tempfile::tempdir;

    // Smallest valid PNG: 8-byte signature is enough for magic detection.
    const PNG_MAGIC: &[u8] = &[
        0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D,
    ];

    struct EmbeddingComputer {
        payload: String,
    }

    #[async_trait]
    impl PageComputer for EmbeddingComputer {
        async fn compute(
            &self,
            _address: &ContentAddress,
            pages: &[u32],
        ) -> Result<Vec<ComputedPage>, EngineError> {
            Ok(pages
                .iter()
                .map(|p| ComputedPage {
                    page_number: *p,
                    text: format!("plan: data:image/png;base64,{}", self.payload),
                    structured: None,
                    image: None,
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn test_extraction_is_idempotent_across_pages() {
        let dir = tempdir().unwrap();
        let repo = ArtifactRepository::new(&dir.path().join("test.db")).unwrap();
        let store = ArtifactStore::new(
            repo.clone(),
            dir.path().join("blobs"),
            chrono::Duration::seconds(60),
        );
        let extractor = DiagramExtractor::new(repo, dir.path().join("blobs"));

        let address = ContentAddress::derive(b"k", b"doc", &ProcessingParams::default());
        let computer = EmbeddingComputer {
            payload: BASE64.encode(PNG_MAGIC),
        };
        // The same image appears verbatim on both pages.
        let set = store.resolve_or_compute(&address, 2, &computer).await.unwrap();

        let first = extractor.extract(&set).unwrap();
        // One sub-image per page, same checksum key.
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].sub_key, first[1].sub_key);

        // Re-extraction finds the same artifacts, not new rows.
        let second = extractor.extract(&set).unwrap();
        let mut first_ids: Vec<i64> = first.iter().map(|a| a.id).collect();
        let mut second_ids: Vec<i64> = second.iter().map(|a| a.id).collect();
        first_ids.sort_unstable();
        second_ids.sort_unstable();
        assert_eq!(first_ids, second_ids);
    }

    #[tokio::test]
    async fn test_non_image_payload_ignored() {
        let dir = tempdir().unwrap();
        let repo = ArtifactRepository::new(&dir.path().join("test.db")).unwrap();
        let store = ArtifactStore::new(
            repo.clone(),
            dir.path().join("blobs"),
            chrono::Duration::seconds(60),
        );
        let extractor = DiagramExtractor::new(repo, dir.path().join("blobs"));

        let address = ContentAddress::derive(b"k", b"doc2", &ProcessingParams::default());
        let computer = EmbeddingComputer {
            payload: BASE64.encode(b"just some text, not an image"),
        };
        let set = store.resolve_or_compute(&address, 1, &computer).await.unwrap();

        assert!(extractor.extract(&set).unwrap().is_empty());
    }
}
