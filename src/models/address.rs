//! Content addressing for processed documents.
//!
//! An address is derived from the raw document bytes with a keyed hash so
//! that identical bytes always resolve to the same artifact set, while the
//! address itself cannot be used by an outside party to probe whether a
//! given document was ever processed.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Current processing pipeline revision. Bump when extraction output for the
/// same input bytes would change.
pub const ALGORITHM_VERSION: i32 = 3;

/// Parameters that affect extraction output. Two documents processed with
/// different parameters must never share artifacts, so these are folded into
/// the address as a stable fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingParams {
    /// Text extraction backend identifier.
    pub extractor: String,
    /// OCR backend identifier.
    pub ocr_backend: String,
    /// Render DPI for page images.
    pub dpi: u32,
    /// OCR language code.
    pub language: String,
}

impl Default for ProcessingParams {
    fn default() -> Self {
        Self {
            extractor: "pdftotext".to_string(),
            ocr_backend: "tesseract".to_string(),
            dpi: 300,
            language: "eng".to_string(),
        }
    }
}

impl ProcessingParams {
    /// Stable fingerprint of the parameter set.
    ///
    /// Fields serialize in declaration order, so the JSON encoding is
    /// deterministic for a given struct revision.
    pub fn fingerprint(&self) -> String {
        let encoded = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(encoded.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Deterministic keyed identifier for one document's processing outputs.
///
/// The triple uniquely determines every derived artifact. It is never
/// mutated; reprocessing with a new pipeline revision or parameter set
/// produces a new triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentAddress {
    /// Keyed HMAC-SHA256 of the raw input bytes, hex encoded.
    pub content_hmac: String,
    /// Processing pipeline revision.
    pub algorithm_version: i32,
    /// Fingerprint of the [`ProcessingParams`] in effect.
    pub params_fingerprint: String,
}

impl ContentAddress {
    /// Derive the address for raw document bytes.
    ///
    /// The secret is held only by the backend; without it, knowledge of an
    /// address gives no way to test whether particular bytes were processed.
    pub fn derive(secret: &[u8], content: &[u8], params: &ProcessingParams) -> Self {
        let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts keys of any length");
        mac.update(content);
        let content_hmac = hex::encode(mac.finalize().into_bytes());

        Self {
            content_hmac,
            algorithm_version: ALGORITHM_VERSION,
            params_fingerprint: params.fingerprint(),
        }
    }

    /// Compact key for lock tables and log lines.
    pub fn lock_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.content_hmac,
            self.algorithm_version,
            &self.params_fingerprint[..8.min(self.params_fingerprint.len())]
        )
    }

    /// Short prefix of the content HMAC for log lines.
    pub fn short(&self) -> &str {
        &self.content_hmac[..8.min(self.content_hmac.len())]
    }
}
