mod command;
mod error;
mod exec;
mod output;

use std::{
    borrow::Cow,
    io::Write,
    sync::{Arc, Mutex},
};

use console::{Style, StyledObject};
pub use error::{TaskError, TaskErrorCause};
use exec::ExecContextFactory;
use futures::{stream::FuturesUnordered, StreamExt};
use itertools::Itertools;
use output::StdWriter;
use tokio::sync::mpsc;
use tracing::debug;
use turbopath::AbsoluteSystemPath;
use turborepo_env::EnvironmentVariableMap;
use turborepo_ui::{
    ColorSelector, OutputClient, OutputClientBehavior, OutputSink, PrefixedUI, UI,
};

use crate::{
    cli::OutputLogsMode,
    engine::{Engine, ExecutionOptions},
    opts::RunOpts,
    package_graph::{PackageGraph, PackageName},
    process::ProcessManager,
    run::{
        global_hash::GlobalHashableInputs,
        summary::{self, RunTracker},
        task_id::TaskId,
        RunCache,
    },
    task_hash::{self, PackageInputsHashes, TaskHasher},
    turbo_json::Pipeline,
};

// This holds the whole world
pub struct Visitor<'a> {
    color_cache: ColorSelector,
    dry: bool,
    manager: ProcessManager,
    run_opts: &'a RunOpts,
    package_graph: Arc<PackageGraph>,
    repo_root: &'a AbsoluteSystemPath,
    run_cache: Arc<RunCache>,
    run_tracker: RunTracker,
    sink: OutputSink<StdWriter>,
    task_hasher: TaskHasher<'a>,
    ui: UI,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Cannot find package {package_name} for task {task_id}")]
    MissingPackage {
        package_name: PackageName,
        task_id: TaskId<'static>,
    },
    #[error("Could not find definition for task")]
    MissingDefinition,
    #[error("Error while executing engine: {0}")]
    Engine(#[from] crate::engine::ExecuteError),
    #[error(transparent)]
    TaskHash(#[from] task_hash::Error),
    #[error(transparent)]
    RunSummary(#[from] summary::Error),
    #[error("Internal errors encountered: {0}")]
    InternalErrors(String),
    #[error("Unable to find package manager binary: {0}")]
    Which(#[from] which::Error),
}

impl<'a> Visitor<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        package_graph: Arc<PackageGraph>,
        run_cache: Arc<RunCache>,
        run_tracker: RunTracker,
        run_opts: &'a RunOpts,
        package_inputs_hashes: PackageInputsHashes,
        env_at_execution_start: &'a EnvironmentVariableMap,
        global_hash: &'a str,
        ui: UI,
        manager: ProcessManager,
        repo_root: &'a AbsoluteSystemPath,
    ) -> Self {
        let task_hasher = TaskHasher::new(
            package_inputs_hashes,
            run_opts,
            env_at_execution_start,
            global_hash,
        );
        let sink = Self::sink();
        let color_cache = ColorSelector::default();

        Self {
            color_cache,
            dry: false,
            manager,
            run_opts,
            package_graph,
            repo_root,
            run_cache,
            run_tracker,
            sink,
            task_hasher,
            ui,
        }
    }

    pub fn dry_run(&mut self) {
        self.dry = true;
    }

    pub async fn visit(&self, engine: Arc<Engine>) -> Result<Vec<TaskError>, Error> {
        // Pin prefix colors to the lexicographic task order so output is
        // stable across runs regardless of scheduling.
        for task_id in engine.task_ids().sorted() {
            self.color_cache.color_for_key(&task_id.to_string());
        }

        let concurrency = self.run_opts.concurrency as usize;
        let (node_sender, mut node_stream) = mpsc::channel(concurrency);

        let engine_handle = {
            let engine = engine.clone();
            tokio::spawn(engine.execute(
                ExecutionOptions::new(self.run_opts.parallel, concurrency),
                node_sender,
            ))
        };
        let mut tasks = FuturesUnordered::new();
        let errors = Arc::new(Mutex::new(Vec::new()));

        let factory = ExecContextFactory::new(self, errors.clone(), self.manager.clone(), &engine);

        while let Some(message) = node_stream.recv().await {
            let crate::engine::Message { info, callback } = message;
            let package_name = PackageName::from(info.package());

            let workspace_info = self
                .package_graph
                .workspace_info(&package_name)
                .ok_or_else(|| Error::MissingPackage {
                    package_name: package_name.clone(),
                    task_id: info.clone(),
                })?;

            let task_definition = engine
                .task_definition(&info)
                .ok_or(Error::MissingDefinition)?;

            let dependency_set = engine.dependencies(&info).ok_or(Error::MissingDefinition)?;

            // Hashes are computed inline, in message-arrival order, which is
            // what lets dependents read finalized upstream hashes.
            let task_hash = self.task_hasher.calculate_task_hash(
                &info,
                task_definition,
                workspace_info,
                dependency_set,
            )?;
            debug!("task {} hash is {}", info, task_hash);

            let task_cache =
                self.run_cache
                    .task_cache(task_definition, workspace_info, info.clone(), &task_hash);

            if self.dry {
                let dry_run_exec_context = factory.dry_run_exec_context(info.clone(), task_cache);
                tasks.push(tokio::spawn(async move {
                    dry_run_exec_context.execute_dry_run(callback).await
                }));
                continue;
            }

            let execution_env = self.task_hasher.env();
            let Some(exec_context) =
                factory.exec_context(info.clone(), task_hash, task_cache, execution_env)?
            else {
                // No script for this task in this package: a zero-work
                // barrier. Dropping the callback reads as completion to the
                // engine, and downstream tasks can still count on the hash
                // existing.
                continue;
            };

            let output_client = self.output_client(task_definition.output_mode);
            let tracker = self.run_tracker.track_task(info.clone().into_owned());
            tasks.push(tokio::spawn(async move {
                exec_context.execute(tracker, output_client, callback).await
            }));
        }

        // Wait for the engine task to finish and for all of our tasks to
        // finish
        engine_handle.await.expect("engine execution panicked")?;
        // This will poll the futures until they are all completed
        let mut internal_errors = Vec::new();
        while let Some(result) = tasks.next().await {
            if let Err(e) = result.expect("task executor panicked") {
                internal_errors.push(e);
            }
        }
        drop(factory);

        if !internal_errors.is_empty() {
            return Err(Error::InternalErrors(
                internal_errors.into_iter().map(|e| e.to_string()).join(","),
            ));
        }

        let errors = Arc::into_inner(errors)
            .expect("only one strong reference to errors should remain")
            .into_inner()
            .expect("mutex poisoned");

        Ok(errors)
    }

    /// Finishes visiting the tasks, builds the run summary, and prints or
    /// saves it per the run mode.
    pub async fn finish(
        self,
        exit_code: i32,
        engine: &Engine,
        global_hash_inputs: &GlobalHashableInputs,
        pipeline: &Pipeline,
    ) -> Result<(), Error> {
        let Self {
            package_graph,
            run_opts,
            repo_root,
            run_tracker,
            task_hasher,
            ui,
            ..
        } = self;

        Ok(run_tracker
            .finish(
                exit_code,
                repo_root,
                run_opts,
                &package_graph,
                engine,
                task_hasher.task_hash_tracker(),
                global_hash_inputs,
                pipeline,
                ui,
            )
            .await?)
    }

    fn sink() -> OutputSink<StdWriter> {
        OutputSink::new(std::io::stdout().into(), std::io::stderr().into())
    }

    fn output_client(&self, output_mode: OutputLogsMode) -> OutputClient<StdWriter> {
        let behavior = match output_mode {
            // Errors-only buffers everything and only emits when the task
            // fails.
            OutputLogsMode::ErrorsOnly => OutputClientBehavior::InMemoryBuffer,
            _ => OutputClientBehavior::Passthrough,
        };
        self.sink.logger(behavior)
    }

    fn prefix<'b>(&self, task_id: &'b TaskId) -> Cow<'b, str> {
        match self.run_opts.log_prefix {
            crate::cli::LogPrefix::Auto => format!("{}:{}", task_id.package(), task_id.task()).into(),
            crate::cli::LogPrefix::None => "".into(),
        }
    }

    // Task ID as displayed in error messages
    fn display_task_id(&self, task_id: &TaskId) -> String {
        task_id.to_string()
    }

    fn prefixed_ui<W: Write>(
        ui: UI,
        output_client: &OutputClient<W>,
        prefix: StyledObject<String>,
    ) -> PrefixedUI<turborepo_ui::OutputWriter<'_, W>> {
        PrefixedUI::new(ui, output_client.stdout(), output_client.stderr())
            .with_output_prefix(prefix.clone())
            .with_error_prefix(
                Style::new().apply_to(format!("{}ERROR: ", ui.apply(prefix.clone()))),
            )
            .with_warn_prefix(prefix)
    }
}
