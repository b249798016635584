use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;

use unison_protocol::message::TrackAnnounce;
use unison_protocol::types::ReadyErrorCode;

#[derive(Debug, Error)]
pub enum TrackError {
    #[error("track not present in cache: {}", .0.display())]
    NotCached(PathBuf),
    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },
    #[error("reading track: {0}")]
    Io(#[from] std::io::Error),
    #[error("hashing task died: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl TrackError {
    /// Wire error code reported to the host via `client_ready_error`.
    pub fn code(&self) -> ReadyErrorCode {
        match self {
            TrackError::NotCached(_) => ReadyErrorCode::DownloadFailed,
            TrackError::HashMismatch { .. } => ReadyErrorCode::HashMismatch,
            TrackError::Io(_) => ReadyErrorCode::Unknown,
            TrackError::Join(_) => ReadyErrorCode::Unknown,
        }
    }
}

/// SHA-256 of a file, hex-encoded. Runs on the blocking pool: track
/// files run to hundreds of megabytes and the core loop must not stall
/// behind them.
pub async fn file_sha256(path: PathBuf) -> Result<String, TrackError> {
    let digest = tokio::task::spawn_blocking(move || -> Result<String, std::io::Error> {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];

        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        Ok(format!("{:x}", hasher.finalize()))
    })
    .await??;

    Ok(digest)
}

/// Where announced tracks are expected to land. The transfer itself is
/// the distributor collaborator's job; this type only locates and
/// verifies what it delivered.
pub struct TrackCache {
    dir: PathBuf,
}

impl TrackCache {
    pub fn new(dir: PathBuf) -> Self {
        TrackCache { dir }
    }

    pub fn path_for(&self, announce: &TrackAnnounce) -> PathBuf {
        match &announce.file_name {
            Some(name) => self.dir.join(name),
            None => self.dir.join(announce.track_id.to_string()),
        }
    }

    /// Verify a delivered file against the announced content hash.
    pub async fn verify(&self, announce: &TrackAnnounce) -> Result<PathBuf, TrackError> {
        let path = self.path_for(announce);
        if !path.is_file() {
            return Err(TrackError::NotCached(path));
        }

        let actual = file_sha256(path.clone()).await?;
        if !actual.eq_ignore_ascii_case(&announce.file_hash) {
            return Err(TrackError::HashMismatch {
                expected: announce.file_hash.clone(),
                actual,
            });
        }

        Ok(path)
    }
}

/// Announce metadata for a local file the host is about to serve.
pub async fn announce_local_file(path: &Path) -> Result<(String, u64), TrackError> {
    let meta = tokio::fs::metadata(path).await?;
    let hash = file_sha256(path.to_path_buf()).await?;
    Ok((hash, meta.len()))
}
