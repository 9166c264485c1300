#![deny(clippy::all)]

/// A wrapper for the cache that uses a worker pool to perform cache writes
/// off the task's critical path.
mod async_cache;
/// The core artifact creation and restoration logic.
pub mod cache_archive;
/// File system cache tier.
pub mod fs;
/// A tier that composes the file system and remote tiers.
mod multiplexer;
/// Remote cache tier over an abstract transport client.
pub mod remote;

pub use async_cache::AsyncCache;
use camino::Utf8PathBuf;
pub use multiplexer::CacheMultiplexer;
pub use remote::{RemoteClient, RemoteCache};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("cannot untar file to {0}")]
    InvalidFilePath(String),
    #[error("tar attempts to write outside of directory: {0}")]
    LinkOutsideOfDirectory(String),
    #[error("attempted to restore unsupported file type: {0:?}")]
    RestoreUnsupportedFileType(tar::EntryType),
    #[error("tar file is malformed")]
    MalformedTar,
    #[error("Invalid cache metadata file")]
    InvalidMetadata(#[source] serde_json::Error),
    #[error("Failed to write cache metadata file")]
    MetadataWriteFailure(#[source] serde_json::Error),
    #[error("failed to contact remote cache: {0}")]
    Remote(String),
    #[error("Invalid file path: {0}")]
    PathError(#[from] turbopath::PathError),
    #[error("Unable to perform write as cache is shutting down")]
    CacheShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    Local,
    Remote,
}

/// Reported on a cache hit: which tier answered and how long the original
/// execution took, so the hit can report time saved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheHitMetadata {
    pub source: CacheSource,
    pub time_saved: u64,
}

#[derive(Clone, Debug, Default)]
pub struct CacheOpts {
    /// Relative to the repo root unless absolute.
    pub cache_dir: Utf8PathBuf,
    pub remote_cache_read_only: bool,
    pub skip_remote: bool,
    pub skip_filesystem: bool,
    /// Maximum concurrent background cache writes.
    pub workers: u32,
}

impl CacheOpts {
    pub fn default_cache_dir() -> Utf8PathBuf {
        Utf8PathBuf::from_iter([".turbo", "cache"])
    }
}

/// Sidecar stored next to each artifact. `files` is the authoritative list of
/// paths captured in the artifact, used to answer `expanded_outputs` without
/// unpacking it.
#[derive(Debug, Deserialize, Serialize)]
pub struct CacheMetadata {
    pub hash: String,
    pub duration: u64,
    pub exit_code: i32,
    pub files: Vec<turbopath::AnchoredSystemPathBuf>,
}
