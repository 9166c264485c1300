use futures::future::BoxFuture;
use turbopath::{AbsoluteSystemPath, AnchoredSystemPathBuf};

use crate::{
    cache_archive::{CacheReader, CacheWriter, SharedBuffer},
    CacheError, CacheHitMetadata, CacheSource,
};

/// Transport for the remote tier. The cache only deals in whole artifact
/// bodies; HTTP, retries, and auth all live behind this trait. Uploads are
/// assumed idempotent: storing the same hash twice must be harmless.
pub trait RemoteClient: Send + Sync {
    /// Returns the recorded duration if the artifact exists.
    fn artifact_exists<'a>(
        &'a self,
        hash: &'a str,
    ) -> BoxFuture<'a, Result<Option<u64>, CacheError>>;

    /// Returns the recorded duration and the artifact body on a hit.
    fn fetch_artifact<'a>(
        &'a self,
        hash: &'a str,
    ) -> BoxFuture<'a, Result<Option<(u64, Vec<u8>)>, CacheError>>;

    fn put_artifact<'a>(
        &'a self,
        hash: &'a str,
        artifact_body: &'a [u8],
        duration: u64,
    ) -> BoxFuture<'a, Result<(), CacheError>>;
}

/// Remote cache tier. Packages outputs into the same tar.zst format as the
/// local tier and ships the bytes through a `RemoteClient`.
pub struct RemoteCache {
    client: Box<dyn RemoteClient>,
}

impl RemoteCache {
    pub fn new(client: Box<dyn RemoteClient>) -> Self {
        Self { client }
    }

    pub async fn exists(&self, hash: &str) -> Result<Option<CacheHitMetadata>, CacheError> {
        Ok(self
            .client
            .artifact_exists(hash)
            .await?
            .map(|time_saved| CacheHitMetadata {
                source: CacheSource::Remote,
                time_saved,
            }))
    }

    pub async fn fetch(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
    ) -> Result<Option<(CacheHitMetadata, Vec<AnchoredSystemPathBuf>)>, CacheError> {
        let Some((duration, body)) = self.client.fetch_artifact(hash).await? else {
            return Ok(None);
        };

        let mut reader = CacheReader::from_reader(std::io::Cursor::new(body), true)?;
        let files = reader.restore(anchor)?;
        Ok(Some((
            CacheHitMetadata {
                source: CacheSource::Remote,
                time_saved: duration,
            },
            files,
        )))
    }

    pub async fn put(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
        files: &[AnchoredSystemPathBuf],
        duration: u64,
    ) -> Result<(), CacheError> {
        let buffer = SharedBuffer::default();
        let mut writer = CacheWriter::from_writer(buffer.clone(), true)?;
        for file in files {
            writer.add_file(anchor, file)?;
        }
        writer.finish()?;

        let body = buffer.into_bytes();
        self.client.put_artifact(hash, &body, duration).await
    }
}

#[cfg(test)]
pub mod test {
    use std::{collections::HashMap, sync::Mutex};

    use anyhow::Result;
    use futures::FutureExt;
    use turbopath::AbsoluteSystemPath;

    use super::*;

    /// In-memory transport used across the cache tests.
    #[derive(Default)]
    pub struct InMemoryRemoteClient {
        pub artifacts: Mutex<HashMap<String, (u64, Vec<u8>)>>,
    }

    impl RemoteClient for InMemoryRemoteClient {
        fn artifact_exists<'a>(
            &'a self,
            hash: &'a str,
        ) -> BoxFuture<'a, Result<Option<u64>, CacheError>> {
            async move {
                Ok(self
                    .artifacts
                    .lock()
                    .unwrap()
                    .get(hash)
                    .map(|(duration, _)| *duration))
            }
            .boxed()
        }

        fn fetch_artifact<'a>(
            &'a self,
            hash: &'a str,
        ) -> BoxFuture<'a, Result<Option<(u64, Vec<u8>)>, CacheError>> {
            async move { Ok(self.artifacts.lock().unwrap().get(hash).cloned()) }.boxed()
        }

        fn put_artifact<'a>(
            &'a self,
            hash: &'a str,
            artifact_body: &'a [u8],
            duration: u64,
        ) -> BoxFuture<'a, Result<(), CacheError>> {
            async move {
                self.artifacts
                    .lock()
                    .unwrap()
                    .insert(hash.to_string(), (duration, artifact_body.to_vec()));
                Ok(())
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_remote_roundtrip() -> Result<()> {
        let repo_root = tempfile::tempdir()?;
        let repo_root_path = AbsoluteSystemPath::from_std_path(repo_root.path())?;
        repo_root_path
            .join_component("banana.txt")
            .create_with_contents("ripe")?;
        let files = vec![AnchoredSystemPathBuf::from_raw("banana.txt")?];

        let cache = RemoteCache::new(Box::new(InMemoryRemoteClient::default()));
        assert!(cache.exists("feedbead00000000").await?.is_none());

        cache
            .put(repo_root_path, "feedbead00000000", &files, 33)
            .await?;
        let hit = cache.exists("feedbead00000000").await?.unwrap();
        assert_eq!(hit.source, CacheSource::Remote);
        assert_eq!(hit.time_saved, 33);

        repo_root_path.join_component("banana.txt").remove_file()?;
        let (meta, restored) = cache
            .fetch(repo_root_path, "feedbead00000000")
            .await?
            .unwrap();
        assert_eq!(meta.source, CacheSource::Remote);
        assert_eq!(restored, files);
        assert_eq!(
            repo_root_path.join_component("banana.txt").read_to_string()?,
            "ripe"
        );
        Ok(())
    }
}
