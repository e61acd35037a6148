//! Storage for generated content and raw service responses.
//!
//! Generated course content is written to an artifact store and the job only
//! keeps a `result_reference` to it. Resolving references is the reader's
//! business.
//!
//! Artifacts are keyed by job and claim, so every attempt writes its own
//! artifact. An attempt that loses its claim cannot replace the content a
//! committed reference points at.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::jobs::types::ClaimToken;

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("artifact io error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store `content` for the attempt holding `token` and return its reference.
    async fn put(&self, token: &ClaimToken, content: &str) -> Result<String, ArtifactError>;
}

/// Writes each artifact to `<root>/<job_id>/<attempt>.md`.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(&self, token: &ClaimToken, content: &str) -> Result<String, ArtifactError> {
        let dir = self.root.join(token.job_id.to_string());
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{}.md", token.attempt_key()));
        tokio::fs::write(&path, content).await?;
        Ok(format!("file://{}", path.display()))
    }
}

/// Keeps artifacts in memory, for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryArtifactStore {
    artifacts: Mutex<HashMap<String, String>>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(&self, reference: &str) -> Option<String> {
        self.artifacts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(reference)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.artifacts.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn put(&self, token: &ClaimToken, content: &str) -> Result<String, ArtifactError> {
        let reference = format!("mem://{}/{}", token.job_id, token.attempt_key());
        self.artifacts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(reference.clone(), content.to_string());
        Ok(reference)
    }
}

/// A raw service response prepared for persistence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredResponse {
    pub raw: Option<String>,
    pub compressed: Option<Vec<u8>>,
}

/// Keep small responses as text, gzip anything of `threshold` bytes or more.
pub fn encode_response(raw: &str, threshold: usize) -> std::io::Result<StoredResponse> {
    if raw.is_empty() {
        return Ok(StoredResponse::default());
    }
    if raw.len() < threshold {
        return Ok(StoredResponse {
            raw: Some(raw.to_string()),
            compressed: None,
        });
    }

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(raw.as_bytes())?;
    Ok(StoredResponse {
        raw: None,
        compressed: Some(encoder.finish()?),
    })
}

pub fn decode_compressed(bytes: &[u8]) -> std::io::Result<String> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = String::new();
    decoder.read_to_string(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use coursegen_core::JobId;

    #[test]
    fn small_responses_stay_raw() {
        let stored = encode_response("{\"ok\":true}", 1024).unwrap();
        assert_eq!(stored.raw.as_deref(), Some("{\"ok\":true}"));
        assert!(stored.compressed.is_none());
        assert_eq!(encode_response("", 0).unwrap(), StoredResponse::default());
    }

    #[test]
    fn large_responses_are_gzipped() {
        let body = "lesson ".repeat(2_000);
        let stored = encode_response(&body, 1024).unwrap();
        assert!(stored.raw.is_none());
        let compressed = stored.compressed.unwrap();
        assert!(compressed.len() < body.len());
        assert_eq!(decode_compressed(&compressed).unwrap(), body);
    }

    fn token(owner: &str, secs: i64) -> ClaimToken {
        ClaimToken {
            job_id: JobId::new(),
            owner: owner.to_string(),
            claimed_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap(),
        }
    }

    #[tokio::test]
    async fn in_memory_store_keeps_each_attempt() {
        let store = InMemoryArtifactStore::new();
        let first = token("w-1", 0);
        let takeover = ClaimToken {
            owner: "w-2".into(),
            claimed_at: first.claimed_at + chrono::TimeDelta::minutes(20),
            ..first.clone()
        };

        let committed = store.put(&takeover, "# Week 1 (retried)").await.unwrap();
        let late = store.put(&first, "# Week 1 (stale)").await.unwrap();

        assert_ne!(committed, late);
        assert!(committed.starts_with(&format!("mem://{}/", first.job_id)));
        assert_eq!(store.resolve(&committed).as_deref(), Some("# Week 1 (retried)"));
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn fs_store_writes_one_file_per_attempt() {
        let root = std::env::temp_dir().join(format!("coursegen-artifacts-{}", JobId::new()));
        let store = FsArtifactStore::new(&root);
        let token = token("coursegen-worker-0/x", 5);

        let reference = store.put(&token, "# Week 2").await.unwrap();
        let path = root
            .join(token.job_id.to_string())
            .join(format!("{}.md", token.attempt_key()));
        assert_eq!(reference, format!("file://{}", path.display()));
        assert!(!token.attempt_key().contains('/'));
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "# Week 2");

        tokio::fs::remove_dir_all(&root).await.unwrap();
    }
}
