use camino::Utf8Path;
use tracing::debug;
use turbopath::{AbsoluteSystemPath, AbsoluteSystemPathBuf, AnchoredSystemPathBuf};

use crate::{
    cache_archive::{CacheReader, CacheWriter},
    CacheError, CacheHitMetadata, CacheMetadata, CacheSource,
};

/// Local cache tier: one `<hash>.tar.zst` artifact plus a `<hash>-meta.json`
/// sidecar per task hash, under a per-workspace cache directory.
pub struct FSCache {
    cache_directory: AbsoluteSystemPathBuf,
}

impl FSCache {
    pub fn new(cache_dir: &Utf8Path, repo_root: &AbsoluteSystemPath) -> Result<Self, CacheError> {
        let cache_directory = AbsoluteSystemPathBuf::from_unknown(repo_root, cache_dir);
        cache_directory.create_dir_all()?;
        Ok(FSCache { cache_directory })
    }

    fn metadata_path(&self, hash: &str) -> AbsoluteSystemPathBuf {
        self.cache_directory
            .join_component(&format!("{hash}-meta.json"))
    }

    fn read_metadata(&self, hash: &str) -> Result<CacheMetadata, CacheError> {
        let path = self.metadata_path(hash);
        serde_json::from_str(&path.read_to_string()?).map_err(CacheError::InvalidMetadata)
    }

    pub fn fetch(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
    ) -> Result<Option<(CacheHitMetadata, Vec<AnchoredSystemPathBuf>)>, CacheError> {
        let uncompressed_cache_path = self.cache_directory.join_component(&format!("{hash}.tar"));
        let compressed_cache_path = self
            .cache_directory
            .join_component(&format!("{hash}.tar.zst"));

        let cache_path = if uncompressed_cache_path.exists() {
            uncompressed_cache_path
        } else if compressed_cache_path.exists() {
            compressed_cache_path
        } else {
            debug!("cache miss for {hash} in {}", self.cache_directory);
            return Ok(None);
        };

        let mut cache_reader = CacheReader::open(&cache_path)?;
        let restored_files = cache_reader.restore(anchor)?;
        let meta = self.read_metadata(hash)?;

        Ok(Some((
            CacheHitMetadata {
                source: CacheSource::Local,
                time_saved: meta.duration,
            },
            restored_files,
        )))
    }

    /// Checks for an artifact without restoring it.
    pub fn exists(&self, hash: &str) -> Result<Option<CacheHitMetadata>, CacheError> {
        let has_artifact = self
            .cache_directory
            .join_component(&format!("{hash}.tar"))
            .exists()
            || self
                .cache_directory
                .join_component(&format!("{hash}.tar.zst"))
                .exists();
        if !has_artifact {
            return Ok(None);
        }

        // A missing or unreadable sidecar downgrades the hit metadata, not
        // the hit itself.
        let time_saved = self.read_metadata(hash).map(|meta| meta.duration).unwrap_or(0);
        Ok(Some(CacheHitMetadata {
            source: CacheSource::Local,
            time_saved,
        }))
    }

    /// The file list recorded when the artifact was stored.
    pub fn expanded_outputs(&self, hash: &str) -> Result<Vec<AnchoredSystemPathBuf>, CacheError> {
        Ok(self.read_metadata(hash)?.files)
    }

    pub fn put(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
        files: &[AnchoredSystemPathBuf],
        duration: u64,
    ) -> Result<(), CacheError> {
        let cache_path = self
            .cache_directory
            .join_component(&format!("{hash}.tar.zst"));

        let mut cache_item = CacheWriter::create(&cache_path)?;
        for file in files {
            cache_item.add_file(anchor, file)?;
        }
        // Performs the atomic rename from temp to final path.
        cache_item.finish()?;

        let meta = CacheMetadata {
            hash: hash.to_string(),
            duration,
            exit_code: 0,
            files: files.to_vec(),
        };
        let meta_json = serde_json::to_string(&meta).map_err(CacheError::MetadataWriteFailure)?;

        // Same write-to-temp-then-rename pattern as the artifact itself.
        let metadata_path = self.metadata_path(hash);
        let temp_metadata_path = self
            .cache_directory
            .join_component(&format!(".{hash}-meta.json.{}.tmp", std::process::id()));
        temp_metadata_path.create_with_contents(&meta_json)?;
        temp_metadata_path.rename(&metadata_path)?;

        Ok(())
    }
}
