use std::{
    io::Write,
    sync::Arc,
};

use tracing::warn;
use turbopath::{AbsoluteSystemPath, AbsoluteSystemPathBuf, AnchoredSystemPathBuf};
use turborepo_cache::{AsyncCache, CacheError, CacheHitMetadata};
use turborepo_ui::{replay_logs, PrefixedUI};

use crate::{
    cli::OutputLogsMode,
    globs,
    opts::RunCacheOpts,
    package_graph::WorkspaceInfo,
    run::task_id::TaskId,
    task_graph::{TaskDefinition, TaskOutputs},
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Globs(#[from] globs::Error),
    #[error("Error writing to log file: {0}")]
    LogFile(#[from] std::io::Error),
    #[error(transparent)]
    Ui(#[from] turborepo_ui::Error),
}

/// Per-run cache front-end. Binds run-wide policy (reads/writes disabled,
/// output-mode override) and hands out one `TaskCache` per node.
pub struct RunCache {
    task_output_mode_override: Option<OutputLogsMode>,
    cache: AsyncCache,
    reads_disabled: bool,
    writes_disabled: bool,
    repo_root: AbsoluteSystemPathBuf,
}

impl RunCache {
    pub fn new(cache: AsyncCache, repo_root: &AbsoluteSystemPath, opts: &RunCacheOpts) -> Self {
        RunCache {
            task_output_mode_override: opts.task_output_mode_override,
            cache,
            reads_disabled: opts.skip_reads,
            writes_disabled: opts.skip_writes,
            repo_root: repo_root.to_owned(),
        }
    }

    /// Binds a task cache handle to a node and its finalized hash.
    pub fn task_cache(
        self: &Arc<Self>,
        task_definition: &TaskDefinition,
        workspace_info: &WorkspaceInfo,
        task_id: TaskId<'static>,
        hash: &str,
    ) -> TaskCache {
        let log_file_path = self
            .repo_root
            .resolve(&workspace_info.task_log_path(&task_id));
        let repo_relative_globs = task_definition
            .repo_relative_hashable_outputs(&task_id, workspace_info.package_path());

        let mut task_output_mode = task_definition.output_mode;
        if let Some(task_output_mode_override) = self.task_output_mode_override {
            task_output_mode = task_output_mode_override;
        }

        let caching_disabled = !task_definition.cache;

        TaskCache {
            expanded_outputs: Vec::new(),
            run_cache: self.clone(),
            repo_relative_globs,
            hash: hash.to_owned(),
            task_id,
            task_output_mode,
            caching_disabled,
            log_file_path,
        }
    }

    /// Waits for queued cache writes to land without closing the cache.
    pub async fn wait(&self) -> Result<(), CacheError> {
        self.cache.wait().await
    }

    /// Flushes queued cache writes. Call once, after the run.
    pub async fn shutdown(self) {
        self.cache.shutdown().await
    }
}

/// One node's view of the cache, bound to its hash, output globs, and log
/// file.
pub struct TaskCache {
    expanded_outputs: Vec<AnchoredSystemPathBuf>,
    run_cache: Arc<RunCache>,
    repo_relative_globs: TaskOutputs,
    hash: String,
    task_id: TaskId<'static>,
    task_output_mode: OutputLogsMode,
    caching_disabled: bool,
    log_file_path: AbsoluteSystemPathBuf,
}

impl TaskCache {
    pub fn is_caching_disabled(&self) -> bool {
        self.caching_disabled
    }

    pub fn output_mode(&self) -> OutputLogsMode {
        self.task_output_mode
    }

    pub fn expanded_outputs(&self) -> &[AnchoredSystemPathBuf] {
        &self.expanded_outputs
    }

    /// Cache check without restoration, for dry runs.
    pub async fn exists(&self) -> Result<Option<CacheHitMetadata>, Error> {
        if self.caching_disabled || self.run_cache.reads_disabled {
            return Ok(None);
        }
        Ok(self.run_cache.cache.exists(&self.hash).await?)
    }

    /// Restores the recorded file tree into the repo and replays the
    /// captured log according to the task's output mode. A restore error is
    /// a warning and a miss, never a task failure.
    pub async fn restore_outputs<W: Write>(
        &mut self,
        prefixed_ui: &mut PrefixedUI<W>,
    ) -> Result<Option<CacheHitMetadata>, Error> {
        if self.caching_disabled || self.run_cache.reads_disabled {
            if !matches!(
                self.task_output_mode,
                OutputLogsMode::None | OutputLogsMode::ErrorsOnly
            ) {
                prefixed_ui.output(format!(
                    "cache bypass, force executing {}",
                    self.hash
                ));
            }
            return Ok(None);
        }

        let cache_status = self
            .run_cache
            .cache
            .fetch(&self.run_cache.repo_root, &self.hash)
            .await
            .unwrap_or_else(|err| {
                warn!("failed to restore outputs for {}: {err}", self.task_id);
                None
            });

        let Some((cache_hit_metadata, restored_files)) = cache_status else {
            if !matches!(
                self.task_output_mode,
                OutputLogsMode::None | OutputLogsMode::ErrorsOnly
            ) {
                prefixed_ui.output(format!("cache miss, executing {}", self.hash));
            }
            return Ok(None);
        };

        self.expanded_outputs = restored_files;

        match self.task_output_mode {
            OutputLogsMode::Full => {
                prefixed_ui.output(format!("cache hit, replaying logs {}", self.hash));
                self.replay_log_file(prefixed_ui)?;
            }
            OutputLogsMode::HashOnly | OutputLogsMode::NewOnly => {
                prefixed_ui.output(format!("cache hit, suppressing logs {}", self.hash));
            }
            OutputLogsMode::None | OutputLogsMode::ErrorsOnly => {}
        }

        Ok(Some(cache_hit_metadata))
    }

    pub fn replay_log_file<W: Write>(
        &self,
        prefixed_ui: &mut PrefixedUI<W>,
    ) -> Result<(), Error> {
        if self.log_file_path.exists() {
            replay_logs(prefixed_ui.output_prefixed_writer(), &self.log_file_path)?;
        }
        Ok(())
    }

    /// A writer that tees task output into this task's log file, so a later
    /// cache hit can replay it.
    pub fn output_writer<W: Write>(&self, writer: W) -> Result<TaskOutputWriter<W>, Error> {
        self.log_file_path.ensure_dir()?;
        let log_file = self.log_file_path.create()?;
        Ok(TaskOutputWriter {
            log_file: std::io::BufWriter::new(log_file),
            writer,
        })
    }

    /// Packages the declared outputs plus the captured log into the cache.
    /// Storage failures are soft: warn and keep the run going.
    pub async fn save_outputs(&mut self, duration_ms: u64) -> Result<(), Error> {
        if self.caching_disabled || self.run_cache.writes_disabled {
            return Ok(());
        }

        let files = globs::globwalk_files(
            &self.run_cache.repo_root,
            &self.repo_relative_globs.inclusions,
            &self.repo_relative_globs.exclusions,
        )?;

        self.run_cache
            .cache
            .put(
                self.run_cache.repo_root.clone(),
                self.hash.clone(),
                files.clone(),
                duration_ms,
            )
            .await?;

        self.expanded_outputs = files;
        Ok(())
    }
}

pub struct TaskOutputWriter<W> {
    log_file: std::io::BufWriter<std::fs::File>,
    writer: W,
}

impl<W: Write> Write for TaskOutputWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.log_file.write_all(buf)?;
        self.writer.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.log_file.flush()?;
        self.writer.flush()
    }
}
