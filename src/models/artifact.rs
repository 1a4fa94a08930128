//! Shared, immutable processing artifacts and per-user document links.
//!
//! Artifacts are owned by the service and keyed by content address, so
//! byte-identical documents uploaded by unrelated users resolve to the same
//! rows. The per-user [`UserDocumentLink`] is the privacy boundary: links are
//! tenant-scoped and carry the user's private annotations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::address::ContentAddress;

/// What a stored artifact is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Concatenated text of the whole document.
    FullText,
    /// Extracted text for one page.
    PageText,
    /// Rendered image of one page.
    PageImage,
    /// Structured per-page extraction output (layout, tables).
    PageStructuredData,
    /// Decoded inline image (diagram, plan) found inside page content.
    SubImage,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FullText => "full_text",
            Self::PageText => "page_text",
            Self::PageImage => "page_image",
            Self::PageStructuredData => "page_structured_data",
            Self::SubImage => "sub_image",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "full_text" => Some(Self::FullText),
            "page_text" => Some(Self::PageText),
            "page_image" => Some(Self::PageImage),
            "page_structured_data" => Some(Self::PageStructuredData),
            "sub_image" => Some(Self::SubImage),
            _ => None,
        }
    }
}

/// One immutable processing output.
///
/// Created exactly once per `(address, kind, page, sub_key)`; never updated.
/// Document-scope artifacts use page number 0. `sub_key` is set only for
/// [`ArtifactKind::SubImage`] and holds the checksum of the decoded payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    /// Database row ID.
    pub id: i64,
    /// Content address this artifact belongs to.
    pub address: ContentAddress,
    pub kind: ArtifactKind,
    /// 1-based page number; 0 for document-scope artifacts.
    pub page_number: u32,
    /// Checksum key for sub-images; empty otherwise.
    pub sub_key: Option<String>,
    /// Path to the immutable blob on disk.
    pub blob_path: PathBuf,
    /// SHA-256 checksum of the blob.
    pub checksum: String,
    /// Blob size in bytes.
    pub byte_len: u64,
    /// Word count for text artifacts.
    pub word_count: Option<u64>,
    pub created_at: DateTime<Utc>,
}

/// The artifacts resolved for one content address.
#[derive(Debug, Clone, Default)]
pub struct ArtifactSet {
    artifacts: Vec<Artifact>,
}

impl ArtifactSet {
    pub fn new(artifacts: Vec<Artifact>) -> Self {
        Self { artifacts }
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Artifact> {
        self.artifacts.iter()
    }

    pub fn full_text(&self) -> Option<&Artifact> {
        self.artifacts
            .iter()
            .find(|a| a.kind == ArtifactKind::FullText)
    }

    pub fn page_text(&self, page: u32) -> Option<&Artifact> {
        self.artifacts
            .iter()
            .find(|a| a.kind == ArtifactKind::PageText && a.page_number == page)
    }

    pub fn of_kind(&self, kind: ArtifactKind) -> impl Iterator<Item = &Artifact> {
        self.artifacts.iter().filter(move |a| a.kind == kind)
    }

    /// Pages that have no text artifact yet, out of `1..=page_count`.
    pub fn missing_text_pages(&self, page_count: u32) -> Vec<u32> {
        (1..=page_count)
            .filter(|p| self.page_text(*p).is_none())
            .collect()
    }

    /// Whether text extraction is complete for a document of `page_count`
    /// pages: every page has text and the combined full text exists.
    pub fn covers(&self, page_count: u32) -> bool {
        self.full_text().is_some() && self.missing_text_pages(page_count).is_empty()
    }

    pub fn push(&mut self, artifact: Artifact) {
        self.artifacts.push(artifact);
    }

    pub fn into_inner(self) -> Vec<Artifact> {
        self.artifacts
    }
}

/// Per-user, per-page binding of a user-visible document to a shared artifact.
///
/// Never shared across users; deleted when the user deletes their document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserDocumentLink {
    pub id: String,
    pub user_id: String,
    pub document_id: String,
    pub address: ContentAddress,
    /// Page number of the linked artifact; 0 for document scope.
    pub page_number: u32,
    pub artifact_id: i64,
    /// User-private annotations, opaque to the engine.
    pub annotations: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl UserDocumentLink {
    pub fn new(user_id: &str, document_id: &str, artifact: &Artifact) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            document_id: document_id.to_string(),
            address: artifact.address.clone(),
            page_number: artifact.page_number,
            artifact_id: artifact.id,
            annotations: serde_json::json!({}),
            created_at: Utc::now(),
        }
    }
}

/// Count the words in a text blob. Stored as a lightweight derived metric.
pub fn word_count(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::address::ProcessingParams;

    fn artifact(kind: ArtifactKind, page: u32) -> Artifact {
        let address = ContentAddress::derive(b"k", b"doc", &ProcessingParams::default());
        Artifact {
            id: 1,
            address,
            kind,
            page_number: page,
            sub_key: None,
            blob_path: PathBuf::from("/tmp/x"),
            checksum: "00".into(),
            byte_len: 2,
            word_count: Some(1),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_kind_round_trip() {
        for kind in [
            ArtifactKind::FullText,
            ArtifactKind::PageText,
            ArtifactKind::PageImage,
            ArtifactKind::PageStructuredData,
            ArtifactKind::SubImage,
        ] {
            assert_eq!(ArtifactKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(ArtifactKind::from_str("bogus"), None);
    }

    #[test]
    fn test_missing_text_pages() {
        let set = ArtifactSet::new(vec![
            artifact(ArtifactKind::PageText, 1),
            artifact(ArtifactKind::PageText, 3),
        ]);
        assert_eq!(set.missing_text_pages(3), vec![2]);
        assert!(!set.covers(3));
    }

    #[test]
    fn test_covers_requires_full_text() {
        let mut set = ArtifactSet::new(vec![artifact(ArtifactKind::PageText, 1)]);
        assert!(!set.covers(1));
        set.push(artifact(ArtifactKind::FullText, 0));
        assert!(set.covers(1));
    }

    #[test]
    fn test_word_count() {
        assert_eq!(word_count(""), 0);
        assert_eq!(word_count("settlement  on   completion"), 3);
    }
}
