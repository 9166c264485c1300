use camino::Utf8Path;
use tracing::{debug, warn};
use turbopath::{AbsoluteSystemPath, AnchoredSystemPathBuf};

use crate::{
    fs::FSCache, remote::RemoteCache, CacheError, CacheHitMetadata, CacheOpts, RemoteClient,
};

/// Composes the local and remote tiers behind the single-tier capability set.
/// Reads consult local first; a remote hit back-fills the local tier. Writes
/// always land locally and go remote when a writable remote is configured.
pub struct CacheMultiplexer {
    fs: Option<FSCache>,
    remote: Option<RemoteCache>,
    remote_read_only: bool,
}

impl CacheMultiplexer {
    pub fn new(
        opts: &CacheOpts,
        repo_root: &AbsoluteSystemPath,
        remote_client: Option<Box<dyn RemoteClient>>,
    ) -> Result<Self, CacheError> {
        let use_fs_cache = !opts.skip_filesystem;
        let use_remote_cache = !opts.skip_remote;

        // These flags are not mutually exclusive, so it is possible to
        // configure yourself out of having a cache at all. Warn rather than
        // fail the build over it.
        if !use_fs_cache && !use_remote_cache {
            warn!("no caches are enabled");
        }

        let cache_dir = if opts.cache_dir.as_str().is_empty() {
            CacheOpts::default_cache_dir()
        } else {
            opts.cache_dir.clone()
        };
        let fs = use_fs_cache
            .then(|| FSCache::new(Utf8Path::new(cache_dir.as_str()), repo_root))
            .transpose()?;

        let remote = match (use_remote_cache, remote_client) {
            (true, Some(client)) => Some(RemoteCache::new(client)),
            _ => None,
        };

        Ok(CacheMultiplexer {
            fs,
            remote,
            remote_read_only: opts.remote_cache_read_only,
        })
    }

    pub async fn fetch(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
    ) -> Result<Option<(CacheHitMetadata, Vec<AnchoredSystemPathBuf>)>, CacheError> {
        if let Some(fs) = &self.fs {
            if let Some(hit) = fs.fetch(anchor, hash)? {
                return Ok(Some(hit));
            }
        }

        if let Some(remote) = &self.remote {
            if let Some((response, files)) = remote.fetch(anchor, hash).await? {
                // Back-fill the local tier so the next fetch is local.
                if let Some(fs) = &self.fs {
                    if let Err(e) = fs.put(anchor, hash, &files, response.time_saved) {
                        debug!("failed to back-fill local cache for {hash}: {e}");
                    }
                }
                return Ok(Some((response, files)));
            }
        }

        Ok(None)
    }

    pub async fn exists(&self, hash: &str) -> Result<Option<CacheHitMetadata>, CacheError> {
        if let Some(fs) = &self.fs {
            if let Some(hit) = fs.exists(hash)? {
                return Ok(Some(hit));
            }
        }
        if let Some(remote) = &self.remote {
            if let Some(hit) = remote.exists(hash).await? {
                return Ok(Some(hit));
            }
        }
        Ok(None)
    }

    pub fn expanded_outputs(&self, hash: &str) -> Result<Vec<AnchoredSystemPathBuf>, CacheError> {
        match &self.fs {
            Some(fs) => fs.expanded_outputs(hash),
            None => Ok(Vec::new()),
        }
    }

    pub async fn put(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
        files: &[AnchoredSystemPathBuf],
        duration: u64,
    ) -> Result<(), CacheError> {
        if let Some(fs) = &self.fs {
            fs.put(anchor, hash, files, duration)?;
        }

        if let Some(remote) = &self.remote {
            if !self.remote_read_only {
                remote.put(anchor, hash, files, duration).await?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use anyhow::Result;
    use turbopath::AnchoredSystemPathBuf;

    use super::*;
    use crate::{remote::test::InMemoryRemoteClient, CacheSource};

    fn opts() -> CacheOpts {
        CacheOpts {
            cache_dir: "cache".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_remote_hit_populates_local() -> Result<()> {
        let repo_root = tempfile::tempdir()?;
        let repo_root_path = AbsoluteSystemPath::from_std_path(repo_root.path())?;
        repo_root_path
            .join_component("out.txt")
            .create_with_contents("output")?;
        let files = vec![AnchoredSystemPathBuf::from_raw("out.txt")?];

        // Seed only the remote.
        let remote = RemoteCache::new(Box::new(InMemoryRemoteClient::default()));
        remote
            .put(repo_root_path, "abcdabcdabcdabcd", &files, 12)
            .await?;
        let mut cache = CacheMultiplexer::new(&opts(), repo_root_path, None)?;
        cache.remote = Some(remote);

        let (hit, _) = cache
            .fetch(repo_root_path, "abcdabcdabcdabcd")
            .await?
            .unwrap();
        assert_eq!(hit.source, CacheSource::Remote);

        // Second fetch is answered by the back-filled local tier.
        let (hit, _) = cache
            .fetch(repo_root_path, "abcdabcdabcdabcd")
            .await?
            .unwrap();
        assert_eq!(hit.source, CacheSource::Local);
        Ok(())
    }

    #[tokio::test]
    async fn test_read_only_remote_not_written() -> Result<()> {
        let repo_root = tempfile::tempdir()?;
        let repo_root_path = AbsoluteSystemPath::from_std_path(repo_root.path())?;
        repo_root_path
            .join_component("out.txt")
            .create_with_contents("output")?;
        let files = vec![AnchoredSystemPathBuf::from_raw("out.txt")?];

        let mut cache_opts = opts();
        cache_opts.remote_cache_read_only = true;
        let mut cache = CacheMultiplexer::new(&cache_opts, repo_root_path, None)?;
        let remote = RemoteCache::new(Box::new(InMemoryRemoteClient::default()));
        cache.remote = Some(remote);

        cache
            .put(repo_root_path, "1234123412341234", &files, 3)
            .await?;
        // Local tier has it, remote was skipped.
        assert_eq!(
            cache.exists("1234123412341234").await?.unwrap().source,
            CacheSource::Local
        );
        let remote_only = CacheOpts {
            cache_dir: "cache2".into(),
            skip_filesystem: true,
            ..Default::default()
        };
        let remote_view = CacheMultiplexer::new(&remote_only, repo_root_path, None)?;
        assert!(remote_view.exists("1234123412341234").await?.is_none());
        Ok(())
    }
}
