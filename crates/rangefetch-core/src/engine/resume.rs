//! Resume store - temp file, sidecar metadata and final promotion
//!
//! Data is written to `<dest>.part`. Next to it, `<dest>.part.json` records
//! where the bytes came from and how much of the file is contiguous from
//! offset 0. The temp file is preallocated, so its length says nothing about
//! progress; the sidecar does.

use crate::error::FetchError;
use chrono::{DateTime, Utc};
use rangefetch_types::{Configuration, ProbeInfo};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Contents of the `<dest>.part.json` sidecar
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeMetadata {
    pub url: String,
    pub total_size: Option<u64>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    /// Bytes `[0, completed_bytes)` are known to be on disk
    pub completed_bytes: u64,
    pub updated_at: DateTime<Utc>,
}

impl ResumeMetadata {
    pub fn from_probe(probe: &ProbeInfo, completed_bytes: u64) -> Self {
        Self {
            url: probe.url.clone(),
            total_size: probe.size,
            etag: probe.etag.clone(),
            last_modified: probe.last_modified.clone(),
            completed_bytes,
            updated_at: Utc::now(),
        }
    }
}

/// What to do with whatever is already on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeDecision {
    /// The destination already holds the full file
    AlreadyComplete { size: u64 },
    /// Continue from `existing_bytes`
    Resume { existing_bytes: u64 },
    /// Start from zero
    Fresh { reason: String },
}

#[derive(Debug, Clone)]
pub struct ResumeStore {
    destination: PathBuf,
    part_path: PathBuf,
    sidecar_path: PathBuf,
}

impl ResumeStore {
    pub fn for_destination(destination: impl Into<PathBuf>) -> Self {
        let destination = destination.into();
        let part_path = with_suffix(&destination, ".part");
        let sidecar_path = with_suffix(&destination, ".part.json");
        Self {
            destination,
            part_path,
            sidecar_path,
        }
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn part_path(&self) -> &Path {
        &self.part_path
    }

    pub fn sidecar_path(&self) -> &Path {
        &self.sidecar_path
    }

    /// Decide how to treat the destination, temp file and sidecar
    ///
    /// Partials that can't be trusted are deleted here so the caller
    /// starts from a clean slate on `Fresh`.
    pub async fn inspect(
        &self,
        probe: &ProbeInfo,
        config: &Configuration,
    ) -> Result<ResumeDecision, FetchError> {
        if let (Some(size), Some(existing)) = (probe.size, file_len(&self.destination).await?) {
            if existing == size {
                info!(
                    "{} already complete ({} bytes), skipping",
                    self.destination.display(),
                    size
                );
                return Ok(ResumeDecision::AlreadyComplete { size });
            }
        }

        let part_len = file_len(&self.part_path).await?.unwrap_or(0);
        if part_len == 0 {
            self.discard().await?;
            return Ok(fresh("no partial download"));
        }
        if !config.enable_resume_support {
            self.discard().await?;
            return Ok(fresh("resume support disabled"));
        }
        if !probe.supports_range {
            warn!(
                "Server does not accept ranges, restarting {}",
                self.destination.display()
            );
            self.discard().await?;
            return Ok(fresh("server does not accept byte ranges"));
        }

        let existing_bytes = match self.load_metadata().await? {
            Some(meta) => {
                if let Some(reason) = validator_mismatch(&meta, probe) {
                    warn!("Discarding partial {}: {}", self.part_path.display(), reason);
                    self.discard().await?;
                    return Ok(fresh(&reason));
                }
                if !has_validator(&meta, probe) {
                    warn!(
                        "No ETag or Last-Modified for {}, resumed content cannot be validated",
                        probe.url
                    );
                }
                meta.completed_bytes
            }
            None => {
                // A full-length part without a sidecar may be a preallocated,
                // mostly empty file
                if probe.size.is_some_and(|size| part_len >= size) {
                    warn!(
                        "Discarding {}: no resume metadata and not shorter than the remote file",
                        self.part_path.display()
                    );
                    self.discard().await?;
                    return Ok(fresh("full-length partial file without resume metadata"));
                }
                warn!(
                    "No resume metadata for {}, trusting {} bytes on disk",
                    self.part_path.display(),
                    part_len
                );
                part_len
            }
        };

        if existing_bytes == 0 {
            return Ok(fresh("no completed prefix recorded"));
        }

        info!(
            "Resuming {} from byte {}",
            self.destination.display(),
            existing_bytes
        );
        Ok(ResumeDecision::Resume { existing_bytes })
    }

    pub async fn load_metadata(&self) -> Result<Option<ResumeMetadata>, FetchError> {
        let raw = match tokio::fs::read(&self.sidecar_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&raw) {
            Ok(meta) => Ok(Some(meta)),
            Err(e) => {
                warn!("Ignoring unreadable sidecar {}: {}", self.sidecar_path.display(), e);
                Ok(None)
            }
        }
    }

    /// Write the sidecar atomically (temp file + rename)
    pub async fn save(&self, meta: &ResumeMetadata) -> Result<(), FetchError> {
        let json = serde_json::to_vec_pretty(meta)
            .map_err(|e| FetchError::Unknown(format!("failed to encode resume metadata: {}", e)))?;
        let tmp = with_suffix(&self.sidecar_path, ".tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.sidecar_path).await?;
        debug!(
            "Saved resume metadata for {} at {} bytes",
            self.destination.display(),
            meta.completed_bytes
        );
        Ok(())
    }

    /// Remove the temp file and sidecar, ignoring missing files
    pub async fn discard(&self) -> Result<(), FetchError> {
        remove_if_exists(&self.part_path).await?;
        remove_if_exists(&self.sidecar_path).await?;
        Ok(())
    }

    /// Verify the temp file and move it into place
    ///
    /// Any existing destination is replaced. Returns the final size.
    pub async fn promote(&self, expected_size: Option<u64>) -> Result<u64, FetchError> {
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&self.part_path)
            .await?;
        file.sync_all().await?;
        let actual = file.metadata().await?.len();
        drop(file);

        if let Some(expected) = expected_size {
            if actual != expected {
                return Err(FetchError::SizeMismatch { expected, actual });
            }
        }

        remove_if_exists(&self.destination).await?;
        tokio::fs::rename(&self.part_path, &self.destination).await?;
        remove_if_exists(&self.sidecar_path).await?;
        info!("Saved {} ({} bytes)", self.destination.display(), actual);
        Ok(actual)
    }
}

fn fresh(reason: &str) -> ResumeDecision {
    ResumeDecision::Fresh {
        reason: reason.to_string(),
    }
}

/// Why the sidecar no longer describes the remote file, if it doesn't
fn validator_mismatch(meta: &ResumeMetadata, probe: &ProbeInfo) -> Option<String> {
    if meta.total_size != probe.size {
        return Some(format!(
            "remote size changed ({:?} -> {:?})",
            meta.total_size, probe.size
        ));
    }
    if let (Some(saved), Some(current)) = (&meta.etag, &probe.etag) {
        return (saved != current).then(|| format!("ETag changed ({} -> {})", saved, current));
    }
    if let (Some(saved), Some(current)) = (&meta.last_modified, &probe.last_modified) {
        return (saved != current)
            .then(|| format!("Last-Modified changed ({} -> {})", saved, current));
    }
    None
}

fn has_validator(meta: &ResumeMetadata, probe: &ProbeInfo) -> bool {
    (meta.etag.is_some() && probe.etag.is_some())
        || (meta.last_modified.is_some() && probe.last_modified.is_some())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

async fn file_len(path: &Path) -> Result<Option<u64>, FetchError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
        Ok(_) => Ok(None),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn remove_if_exists(path: &Path) -> Result<(), FetchError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn probe(size: u64) -> ProbeInfo {
        ProbeInfo {
            url: "http://mirror.test/image.iso".to_string(),
            final_url: None,
            filename: "image.iso".to_string(),
            size: Some(size),
            content_type: None,
            supports_range: true,
            etag: Some("\"v1\"".to_string()),
            last_modified: None,
        }
    }

    #[test]
    fn test_paths() {
        let store = ResumeStore::for_destination("/tmp/out/image.iso");
        assert_eq!(store.part_path(), Path::new("/tmp/out/image.iso.part"));
        assert_eq!(store.sidecar_path(), Path::new("/tmp/out/image.iso.part.json"));
    }

    #[tokio::test]
    async fn test_existing_destination_is_complete() {
        let dir = TempDir::new().unwrap();
        let store = ResumeStore::for_destination(dir.path().join("image.iso"));
        tokio::fs::write(store.destination(), vec![7u8; 100]).await.unwrap();

        let decision = store.inspect(&probe(100), &Configuration::default()).await.unwrap();
        assert_eq!(decision, ResumeDecision::AlreadyComplete { size: 100 });

        // Different size is not a match
        let decision = store.inspect(&probe(200), &Configuration::default()).await.unwrap();
        assert!(matches!(decision, ResumeDecision::Fresh { .. }));
    }

    #[tokio::test]
    async fn test_resume_uses_sidecar_prefix() {
        let dir = TempDir::new().unwrap();
        let store = ResumeStore::for_destination(dir.path().join("image.iso"));
        // Preallocated: full length on disk, only 40 bytes valid
        tokio::fs::write(store.part_path(), vec![0u8; 100]).await.unwrap();
        store.save(&ResumeMetadata::from_probe(&probe(100), 40)).await.unwrap();

        let decision = store.inspect(&probe(100), &Configuration::default()).await.unwrap();
        assert_eq!(decision, ResumeDecision::Resume { existing_bytes: 40 });
    }

    #[tokio::test]
    async fn test_etag_change_discards_partial() {
        let dir = TempDir::new().unwrap();
        let store = ResumeStore::for_destination(dir.path().join("image.iso"));
        tokio::fs::write(store.part_path(), vec![0u8; 100]).await.unwrap();
        store.save(&ResumeMetadata::from_probe(&probe(100), 40)).await.unwrap();

        let mut changed = probe(100);
        changed.etag = Some("\"v2\"".to_string());
        let decision = store.inspect(&changed, &Configuration::default()).await.unwrap();
        assert!(matches!(decision, ResumeDecision::Fresh { reason } if reason.contains("ETag")));
        assert!(!store.part_path().exists());
        assert!(!store.sidecar_path().exists());
    }

    #[tokio::test]
    async fn test_no_range_support_restarts() {
        let dir = TempDir::new().unwrap();
        let store = ResumeStore::for_destination(dir.path().join("image.iso"));
        tokio::fs::write(store.part_path(), vec![0u8; 10]).await.unwrap();

        let mut no_ranges = probe(100);
        no_ranges.supports_range = false;
        let decision = store.inspect(&no_ranges, &Configuration::default()).await.unwrap();
        assert!(matches!(decision, ResumeDecision::Fresh { .. }));
    }

    #[tokio::test]
    async fn test_legacy_partial_without_sidecar() {
        let dir = TempDir::new().unwrap();
        let store = ResumeStore::for_destination(dir.path().join("image.iso"));
        tokio::fs::write(store.part_path(), vec![1u8; 30]).await.unwrap();

        let decision = store.inspect(&probe(100), &Configuration::default()).await.unwrap();
        assert_eq!(decision, ResumeDecision::Resume { existing_bytes: 30 });

        let disabled = Configuration {
            enable_resume_support: false,
            ..Default::default()
        };
        let decision = store.inspect(&probe(100), &disabled).await.unwrap();
        assert!(matches!(decision, ResumeDecision::Fresh { .. }));
        assert!(!store.part_path().exists());
    }

    #[tokio::test]
    async fn test_full_length_part_without_sidecar_is_discarded() {
        let dir = TempDir::new().unwrap();
        let store = ResumeStore::for_destination(dir.path().join("image.iso"));
        tokio::fs::write(store.part_path(), vec![0u8; 100]).await.unwrap();

        let decision = store.inspect(&probe(100), &Configuration::default()).await.unwrap();
        assert!(matches!(decision, ResumeDecision::Fresh { .. }));
        assert!(!store.part_path().exists());
    }

    #[tokio::test]
    async fn test_zero_prefix_sidecar_restarts() {
        let dir = TempDir::new().unwrap();
        let store = ResumeStore::for_destination(dir.path().join("image.iso"));
        // Preallocated, then interrupted before any byte was committed
        tokio::fs::write(store.part_path(), vec![0u8; 100]).await.unwrap();
        store.save(&ResumeMetadata::from_probe(&probe(100), 0)).await.unwrap();

        let decision = store.inspect(&probe(100), &Configuration::default()).await.unwrap();
        assert!(matches!(decision, ResumeDecision::Fresh { .. }));
    }

    #[tokio::test]
    async fn test_promote_checks_size_and_replaces() {
        let dir = TempDir::new().unwrap();
        let store = ResumeStore::for_destination(dir.path().join("image.iso"));
        tokio::fs::write(store.destination(), b"old").await.unwrap();
        tokio::fs::write(store.part_path(), b"new contents").await.unwrap();
        store.save(&ResumeMetadata::from_probe(&probe(12), 12)).await.unwrap();

        let err = store.promote(Some(99)).await.unwrap_err();
        assert!(matches!(err, FetchError::SizeMismatch { expected: 99, actual: 12 }));

        assert_eq!(store.promote(Some(12)).await.unwrap(), 12);
        assert_eq!(tokio::fs::read(store.destination()).await.unwrap(), b"new contents");
        assert!(!store.part_path().exists());
        assert!(!store.sidecar_path().exists());
    }
}
