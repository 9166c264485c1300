#![allow(clippy::too_many_arguments)]

pub(crate) mod cache;
pub(crate) mod global_hash;
pub(crate) mod summary;
pub mod task_id;

use std::sync::Arc;

pub use cache::{RunCache, TaskCache};
use chrono::Local;
use itertools::Itertools;
use tracing::debug;
use turbopath::AbsoluteSystemPathBuf;
use turborepo_cache::{AsyncCache, RemoteClient};
use turborepo_env::EnvironmentVariableMap;
use turborepo_ui::{cprint, cprintln, BOLD_GREY, GREY, UI};

use crate::{
    engine::{Engine, EngineBuilder},
    get_version,
    opts::Opts,
    package_graph::{PackageGraph, PackageName},
    process::ProcessManager,
    run::{
        global_hash::get_global_hash_inputs,
        summary::RunTracker,
        task_id::TaskName,
    },
    signal::SignalHandler,
    task_graph::Visitor,
    task_hash::PackageInputsHashes,
    turbo_json::TurboJson,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("error preparing engine: {0}")]
    EnginePreparation(#[from] crate::engine::BuilderError),
    #[error("error preparing engine: {0}")]
    EngineValidation(String),
    #[error(transparent)]
    PackageGraph(#[from] crate::package_graph::Error),
    #[error(transparent)]
    Cache(#[from] turborepo_cache::CacheError),
    #[error(transparent)]
    TaskHash(#[from] crate::task_hash::Error),
    #[error(transparent)]
    Visitor(#[from] crate::task_graph::VisitorError),
    #[error(transparent)]
    Path(#[from] turbopath::PathError),
}

/// A single invocation: expand the targets into a task graph, hash it,
/// execute it against the cache, and summarize.
pub struct Run {
    repo_root: AbsoluteSystemPathBuf,
    opts: Opts,
    package_graph: Arc<PackageGraph>,
    turbo_json: TurboJson,
    ui: UI,
    processes: ProcessManager,
    remote_client: Option<Box<dyn RemoteClient>>,
}

impl Run {
    pub fn new(
        repo_root: AbsoluteSystemPathBuf,
        package_graph: PackageGraph,
        turbo_json: TurboJson,
        opts: Opts,
        ui: UI,
    ) -> Self {
        Self {
            repo_root,
            opts,
            package_graph: Arc::new(package_graph),
            turbo_json,
            ui,
            processes: ProcessManager::new(),
            remote_client: None,
        }
    }

    /// Installs the remote cache transport. Without one, the run is
    /// local-only.
    pub fn with_remote_client(mut self, remote_client: Box<dyn RemoteClient>) -> Self {
        self.remote_client = Some(remote_client);
        self
    }

    /// Wires process teardown to an external cancellation source.
    pub fn connect_signal_handler(&self, handler: &SignalHandler) {
        if let Some(subscriber) = handler.subscribe() {
            let manager = self.processes.clone();
            tokio::spawn(async move {
                let _guard = subscriber.listen().await;
                manager.stop().await;
            });
        }
    }

    fn filtered_packages(&self) -> Vec<PackageName> {
        if self.opts.scope_opts.filtered_packages.is_empty() {
            self.package_graph
                .workspaces()
                .map(|(name, _)| name.clone())
                .filter(|name| !matches!(name, PackageName::Root))
                .sorted()
                .collect()
        } else {
            self.opts
                .scope_opts
                .filtered_packages
                .iter()
                .cloned()
                .sorted()
                .collect()
        }
    }

    fn print_run_prelude(&self, filtered_pkgs: &[PackageName]) {
        let targets_list = self.opts.run_opts.tasks.join(", ");
        let packages = filtered_pkgs
            .iter()
            .map(|workspace_name| workspace_name.to_string())
            .sorted()
            .join(", ");
        cprintln!(self.ui, GREY, "• Packages in scope: {packages}");
        cprint!(self.ui, GREY, "{} ", "• Running");
        cprint!(self.ui, BOLD_GREY, "{}", targets_list);
        cprint!(self.ui, GREY, " in {} packages\n", filtered_pkgs.len());

        if self.remote_client.is_some() && !self.opts.cache_opts.skip_remote {
            cprintln!(self.ui, GREY, "• Remote caching enabled");
        } else {
            cprintln!(self.ui, GREY, "• Remote caching disabled");
        }
    }

    fn build_engine(&self, filtered_pkgs: &[PackageName]) -> Result<Engine, Error> {
        let engine = EngineBuilder::new(&self.package_graph, &self.turbo_json)
            .with_workspaces(filtered_pkgs.to_vec())
            .with_tasks(
                self.opts
                    .run_opts
                    .tasks
                    .iter()
                    .map(|task| TaskName::from(task.as_str()).into_owned()),
            )
            .build()?;

        if !self.opts.run_opts.parallel {
            engine
                .validate(&self.package_graph, self.opts.run_opts.concurrency)
                .map_err(|errors| {
                    Error::EngineValidation(
                        errors
                            .into_iter()
                            .map(|e| e.to_string())
                            .sorted()
                            .join("\n"),
                    )
                })?;
        }

        Ok(engine)
    }

    pub async fn run(self) -> Result<i32, Error> {
        let start_at = Local::now();

        self.package_graph.validate()?;

        let filtered_pkgs = self.filtered_packages();
        let engine = Arc::new(self.build_engine(&filtered_pkgs)?);

        let env_at_execution_start = EnvironmentVariableMap::infer();

        let is_dry_run = self.opts.run_opts.dry_run.is_some();
        if !is_dry_run {
            self.print_run_prelude(&filtered_pkgs);
        }

        let global_hash_inputs = get_global_hash_inputs(
            &self.repo_root,
            self.package_graph.package_manager(),
            &self.turbo_json.global_dependencies,
            &env_at_execution_start,
            &self.turbo_json.global_env,
            self.turbo_json.global_cache_key.as_deref(),
        )?;
        let global_hash = global_hash_inputs.calculate_global_hash_from_inputs();
        debug!("global hash: {}", global_hash);

        let package_inputs_hashes = PackageInputsHashes::calculate_file_hashes(
            engine.tasks(),
            &self.package_graph,
            engine.task_definitions(),
            &self.repo_root,
        )?;

        let async_cache = AsyncCache::new(
            &self.opts.cache_opts,
            &self.repo_root,
            self.remote_client,
        )?;
        let runcache = Arc::new(RunCache::new(
            async_cache,
            &self.repo_root,
            &self.opts.runcache_opts,
        ));

        let run_tracker = RunTracker::new(
            start_at,
            get_version(),
            self.opts.run_opts.synthesize_command(),
        );

        let mut visitor = Visitor::new(
            self.package_graph.clone(),
            runcache.clone(),
            run_tracker,
            &self.opts.run_opts,
            package_inputs_hashes,
            &env_at_execution_start,
            &global_hash,
            self.ui,
            self.processes.clone(),
            &self.repo_root,
        );

        if is_dry_run {
            visitor.dry_run();
        }

        debug!("running visitor");
        let errors = visitor.visit(engine.clone()).await?;

        let exit_code = errors
            .iter()
            .filter_map(|err| err.exit_code())
            .max()
            // We hit some error, it shouldn't be exit code 0
            .unwrap_or(if errors.is_empty() { 0 } else { 1 });

        for err in &errors {
            eprintln!("{err}");
        }

        visitor
            .finish(
                exit_code,
                &engine,
                &global_hash_inputs,
                &self.turbo_json.pipeline,
            )
            .await?;

        // Make sure pending cache writes land before the process goes away.
        if let Some(runcache) = Arc::into_inner(runcache) {
            runcache.shutdown().await;
        }

        Ok(exit_code)
    }
}
