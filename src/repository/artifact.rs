//! Artifact repository: shared content-addressed outputs, per-address
//! compute leases, and tenant-scoped document links.

use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::{params, Connection, Row};

use super::{parse_datetime, OptionalExt, Result};
use crate::models::{Artifact, ArtifactKind, ArtifactSet, ContentAddress, UserDocumentLink};

/// SQLite-backed repository for artifacts and links.
#[derive(Clone)]
pub struct ArtifactRepository {
    db_path: PathBuf,
}

impl ArtifactRepository {
    /// Create a new artifact repository.
    pub fn new(db_path: &Path) -> Result<Self> {
        let repo = Self {
            db_path: db_path.to_path_buf(),
        };
        repo.init_schema()?;
        Ok(repo)
    }

    pub(crate) fn connect(&self) -> Result<Connection> {
        super::connect(&self.db_path)
    }

    /// Path to the backing database.
    pub fn database_path(&self) -> &Path {
        &self.db_path
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.execute_batch(
            r#"
            -- Shared, immutable processing outputs. The UNIQUE constraint is
            -- what makes insert-if-absent race-free across workers.
            CREATE TABLE IF NOT EXISTS artifacts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                content_hmac TEXT NOT NULL,
                algorithm_version INTEGER NOT NULL,
                params_fingerprint TEXT NOT NULL,
                kind TEXT NOT NULL,
                page_number INTEGER NOT NULL DEFAULT 0,
                sub_key TEXT NOT NULL DEFAULT '',
                blob_path TEXT NOT NULL,
                checksum TEXT NOT NULL,
                byte_len INTEGER NOT NULL,
                word_count INTEGER,
                created_at TEXT NOT NULL,
                UNIQUE(content_hmac, algorithm_version, params_fingerprint,
                       kind, page_number, sub_key)
            );

            CREATE INDEX IF NOT EXISTS idx_artifacts_address
                ON artifacts(content_hmac, algorithm_version, params_fingerprint);

            -- Per-user binding of a user-visible document to shared
            -- artifacts. This table is the privacy boundary.
            CREATE TABLE IF NOT EXISTS user_document_links (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                document_id TEXT NOT NULL,
                content_hmac TEXT NOT NULL,
                algorithm_version INTEGER NOT NULL,
                params_fingerprint TEXT NOT NULL,
                page_number INTEGER NOT NULL DEFAULT 0,
                artifact_id INTEGER NOT NULL,
                annotations TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                UNIQUE(user_id, document_id, artifact_id)
            );

            CREATE INDEX IF NOT EXISTS idx_links_user_document
                ON user_document_links(user_id, document_id);
            CREATE INDEX IF NOT EXISTS idx_links_address
                ON user_document_links(content_hmac, algorithm_version, params_fingerprint);

            -- Advisory single-flight leases, one per content address.
            CREATE TABLE IF NOT EXISTS compute_leases (
                lease_key TEXT PRIMARY KEY,
                holder TEXT NOT NULL,
                acquired_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    /// Insert an artifact if absent and return the stored row.
    ///
    /// When a concurrent worker already inserted the same key, the existing
    /// row is returned: first computation wins, all others read.
    pub fn insert_if_absent(&self, artifact: &Artifact) -> Result<Artifact> {
        let conn = self.connect()?;
        conn.execute(
            r#"
            INSERT OR IGNORE INTO artifacts
                (content_hmac, algorithm_version, params_fingerprint, kind,
                 page_number, sub_key, blob_path, checksum, byte_len,
                 word_count, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                artifact.address.content_hmac,
                artifact.address.algorithm_version,
                artifact.address.params_fingerprint,
                artifact.kind.as_str(),
                artifact.page_number,
                artifact.sub_key.clone().unwrap_or_default(),
                artifact.blob_path.display().to_string(),
                artifact.checksum,
                artifact.byte_len,
                artifact.word_count,
                artifact.created_at.to_rfc3339(),
            ],
        )?;

        let stored = conn.query_row(
            r#"
            SELECT * FROM artifacts
            WHERE content_hmac = ? AND algorithm_version = ?
              AND params_fingerprint = ? AND kind = ?
              AND page_number = ? AND sub_key = ?
            "#,
            params![
                artifact.address.content_hmac,
                artifact.address.algorithm_version,
                artifact.address.params_fingerprint,
                artifact.kind.as_str(),
                artifact.page_number,
                artifact.sub_key.clone().unwrap_or_default(),
            ],
            row_to_artifact,
        )?;
        Ok(stored)
    }

    /// All artifacts stored for a content address.
    pub fn get_set(&self, address: &ContentAddress) -> Result<ArtifactSet> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM artifacts
            WHERE content_hmac = ? AND algorithm_version = ? AND params_fingerprint = ?
            ORDER BY kind, page_number, sub_key
            "#,
        )?;
        let artifacts = stmt
            .query_map(
                params![
                    address.content_hmac,
                    address.algorithm_version,
                    address.params_fingerprint
                ],
                row_to_artifact,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ArtifactSet::new(artifacts))
    }

    /// Look up one artifact by its full key.
    pub fn get(
        &self,
        address: &ContentAddress,
        kind: ArtifactKind,
        page_number: u32,
        sub_key: Option<&str>,
    ) -> Result<Option<Artifact>> {
        let conn = self.connect()?;
        let artifact = conn
            .query_row(
                r#"
                SELECT * FROM artifacts
                WHERE content_hmac = ? AND algorithm_version = ?
                  AND params_fingerprint = ? AND kind = ?
                  AND page_number = ? AND sub_key = ?
                "#,
                params![
                    address.content_hmac,
                    address.algorithm_version,
                    address.params_fingerprint,
                    kind.as_str(),
                    page_number,
                    sub_key.unwrap_or(""),
                ],
                row_to_artifact,
            )
            .optional()?;
        Ok(artifact)
    }

    /// Atomically acquire (or refresh) the compute lease for a lock key.
    ///
    /// Returns false when another live holder owns the lease. An expired
    /// lease is reclaimed so a crashed worker cannot block recomputation
    /// forever.
    pub fn try_acquire_lease(
        &self,
        lease_key: &str,
        holder: &str,
        ttl: chrono::Duration,
    ) -> Result<bool> {
        let conn = self.connect()?;
        let now = Utc::now();
        let expires = (now + ttl).to_rfc3339();

        conn.execute("BEGIN IMMEDIATE", [])?;

        let result: Result<bool> = (|| {
            let existing = conn
                .query_row(
                    "SELECT holder, expires_at FROM compute_leases WHERE lease_key = ?",
                    params![lease_key],
                    |row| {
                        Ok((
                            row.get::<_, String>("holder")?,
                            row.get::<_, String>("expires_at")?,
                        ))
                    },
                )
                .optional()?;

            match existing {
                None => {
                    conn.execute(
                        "INSERT INTO compute_leases (lease_key, holder, acquired_at, expires_at)
                         VALUES (?, ?, ?, ?)",
                        params![lease_key, holder, now.to_rfc3339(), expires],
                    )?;
                    Ok(true)
                }
                Some((current_holder, _)) if current_holder == holder => {
                    conn.execute(
                        "UPDATE compute_leases SET expires_at = ? WHERE lease_key = ?",
                        params![expires, lease_key],
                    )?;
                    Ok(true)
                }
                Some((_, expires_at)) if parse_datetime(&expires_at) <= now => {
                    conn.execute(
                        "UPDATE compute_leases
                         SET holder = ?, acquired_at = ?, expires_at = ?
                         WHERE lease_key = ?",
                        params![holder, now.to_rfc3339(), expires, lease_key],
                    )?;
                    Ok(true)
                }
                Some(_) => Ok(false),
            }
        })();

        if result.is_ok() {
            conn.execute("COMMIT", [])?;
        } else {
            let _ = conn.execute("ROLLBACK", []);
        }

        result
    }

    /// Release a lease held by this holder. Releasing someone else's lease
    /// is a no-op.
    pub fn release_lease(&self, lease_key: &str, holder: &str) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "DELETE FROM compute_leases WHERE lease_key = ? AND holder = ?",
            params![lease_key, holder],
        )?;
        Ok(())
    }

    /// Insert a user-document link if absent.
    pub fn insert_link(&self, link: &UserDocumentLink) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            r#"
            INSERT OR IGNORE INTO user_document_links
                (id, user_id, document_id, content_hmac, algorithm_version,
                 params_fingerprint, page_number, artifact_id, annotations, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                link.id,
                link.user_id,
                link.document_id,
                link.address.content_hmac,
                link.address.algorithm_version,
                link.address.params_fingerprint,
                link.page_number,
                link.artifact_id,
                link.annotations.to_string(),
                link.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Links for one user-visible document.
    pub fn links_for(&self, user_id: &str, document_id: &str) -> Result<Vec<UserDocumentLink>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM user_document_links
            WHERE user_id = ? AND document_id = ?
            ORDER BY page_number ASC
            "#,
        )?;
        let links = stmt
            .query_map(params![user_id, document_id], row_to_link)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(links)
    }

    /// Replace the private annotations on one link.
    pub fn set_link_annotations(
        &self,
        link_id: &str,
        annotations: &serde_json::Value,
    ) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE user_document_links SET annotations = ? WHERE id = ?",
            params![annotations.to_string(), link_id],
        )?;
        Ok(())
    }

    /// Delete all links for one user's document. The shared artifacts stay.
    pub fn delete_document_links(&self, user_id: &str, document_id: &str) -> Result<usize> {
        let conn = self.connect()?;
        let deleted = conn.execute(
            "DELETE FROM user_document_links WHERE user_id = ? AND document_id = ?",
            params![user_id, document_id],
        )?;
        Ok(deleted)
    }

    /// Whether any user link still references this address.
    pub fn address_referenced(&self, address: &ContentAddress) -> Result<bool> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row(
            r#"
            SELECT COUNT(*) FROM user_document_links
            WHERE content_hmac = ? AND algorithm_version = ? AND params_fingerprint = ?
            "#,
            params![
                address.content_hmac,
                address.algorithm_version,
                address.params_fingerprint
            ],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Addresses whose artifacts no user link references any more.
    pub fn unreferenced_addresses(&self) -> Result<Vec<ContentAddress>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT DISTINCT content_hmac, algorithm_version, params_fingerprint
            FROM artifacts a
            WHERE NOT EXISTS (
                SELECT 1 FROM user_document_links l
                WHERE l.content_hmac = a.content_hmac
                  AND l.algorithm_version = a.algorithm_version
                  AND l.params_fingerprint = a.params_fingerprint
            )
            "#,
        )?;
        let addresses = stmt
            .query_map([], |row| {
                Ok(ContentAddress {
                    content_hmac: row.get("content_hmac")?,
                    algorithm_version: row.get("algorithm_version")?,
                    params_fingerprint: row.get("params_fingerprint")?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(addresses)
    }

    /// Delete all artifact rows for an address, returning the blob paths so
    /// the caller can remove the files. Only called by the GC policy after
    /// confirming no link references the address.
    pub fn delete_address(&self, address: &ContentAddress) -> Result<Vec<PathBuf>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT blob_path FROM artifacts
            WHERE content_hmac = ? AND algorithm_version = ? AND params_fingerprint = ?
            "#,
        )?;
        let paths: Vec<PathBuf> = stmt
            .query_map(
                params![
                    address.content_hmac,
                    address.algorithm_version,
                    address.params_fingerprint
                ],
                |row| row.get::<_, String>(0).map(PathBuf::from),
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        conn.execute(
            r#"
            DELETE FROM artifacts
            WHERE content_hmac = ? AND algorithm_version = ? AND params_fingerprint = ?
            "#,
            params![
                address.content_hmac,
                address.algorithm_version,
                address.params_fingerprint
            ],
        )?;
        Ok(paths)
    }
}

fn row_to_artifact(row: &Row) -> std::result::Result<Artifact, rusqlite::Error> {
    let kind_str: String = row.get("kind")?;
    let kind = ArtifactKind::from_str(&kind_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("unknown artifact kind: {kind_str}").into(),
        )
    })?;
    let sub_key: String = row.get("sub_key")?;
    let created_at: String = row.get("created_at")?;
    Ok(Artifact {
        id: row.get("id")?,
        address: ContentAddress {
            content_hmac: row.get("content_hmac")?,
            algorithm_version: row.get("algorithm_version")?,
            params_fingerprint: row.get("params_fingerprint")?,
        },
        kind,
        page_number: row.get("page_number")?,
        sub_key: if sub_key.is_empty() {
            None
        } else {
            Some(sub_key)
        },
        blob_path: PathBuf::from(row.get::<_, String>("blob_path")?),
        checksum: row.get("checksum")?,
        byte_len: row.get("byte_len")?,
        word_count: row.get("word_count")?,
        created_at: parse_datetime(&created_at),
    })
}

fn row_to_link(row: &Row) -> std::result::Result<UserDocumentLink, rusqlite::Error> {
    let annotations: String = row.get("annotations")?;
    let created_at: String = row.get("created_at")?;
    Ok(UserDocumentLink {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        document_id: row.get("document_id")?,
        address: ContentAddress {
            content_hmac: row.get("content_hmac")?,
            algorithm_version: row.get("algorithm_version")?,
            params_fingerprint: row.get("params_fingerprint")?,
        },
        page_number: row.get("page_number")?,
        artifact_id: row.get("artifact_id")?,
        annotations: serde_json::from_str(&annotations).unwrap_or(serde_json::Value::Null),
        created_at: parse_datetime(&created_at),
    })
}
