//! The resolved invocation surface, handed over by the CLI layer.

use std::collections::HashSet;

use turborepo_cache::CacheOpts;

use crate::{
    cli::{DryRunMode, LogPrefix, OutputLogsMode},
    package_graph::PackageName,
};

#[derive(Debug, Default)]
pub struct Opts {
    pub run_opts: RunOpts,
    pub cache_opts: CacheOpts,
    pub runcache_opts: RunCacheOpts,
    pub scope_opts: ScopeOpts,
}

#[derive(Debug)]
pub struct RunOpts {
    /// Target task names.
    pub tasks: Vec<String>,
    pub concurrency: u32,
    pub parallel: bool,
    pub continue_on_error: bool,
    /// Arguments after `--`, forwarded to every spawned task command.
    pub pass_through_args: Vec<String>,
    pub dry_run: Option<DryRunMode>,
    /// Persist the run summary under `.turbo/runs`.
    pub summarize: bool,
    pub log_prefix: LogPrefix,
}

pub const DEFAULT_CONCURRENCY: u32 = 10;

impl Default for RunOpts {
    fn default() -> Self {
        Self {
            tasks: Vec::new(),
            concurrency: DEFAULT_CONCURRENCY,
            parallel: false,
            continue_on_error: false,
            pass_through_args: Vec::new(),
            dry_run: None,
            summarize: false,
            log_prefix: LogPrefix::default(),
        }
    }
}

impl RunOpts {
    /// The command line this run is equivalent to, for summaries.
    pub fn synthesize_command(&self) -> String {
        let mut cmd = format!("turbo run {}", self.tasks.join(" "));
        if self.parallel {
            cmd.push_str(" --parallel");
        }
        if self.continue_on_error {
            cmd.push_str(" --continue");
        }
        if !self.pass_through_args.is_empty() {
            cmd.push_str(" -- ");
            cmd.push_str(&self.pass_through_args.join(" "));
        }
        cmd
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RunCacheOpts {
    pub skip_reads: bool,
    pub skip_writes: bool,
    pub task_output_mode_override: Option<OutputLogsMode>,
}

/// Which packages are in scope. Filtering itself (globs, git ranges) is
/// resolved upstream; an empty set means every package.
#[derive(Debug, Default)]
pub struct ScopeOpts {
    pub filtered_packages: HashSet<PackageName>,
}
