use std::{io::Write, sync::{Arc, Mutex}, time::Duration};

use console::StyledObject;
use tokio::sync::oneshot;
use tracing::error;
use turborepo_ui::{OutputClient, PrefixedUI, PrefixedWriter, UI};

use super::{
    command::{CommandFactory, PackageGraphCommandProvider},
    error::{TaskError, TaskErrorCause},
    output::StdWriter,
    Visitor,
};
use crate::{
    cli::OutputLogsMode,
    engine::{Engine, StopExecution},
    process::{ChildExit, Command, ProcessManager},
    run::{cache::TaskCache, summary::TaskResultSink, task_id::TaskId},
    task_hash::TaskHashTracker,
};

/// Grace period between asking a child to stop and killing it.
const CHILD_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ExecContextFactory<'a> {
    visitor: &'a Visitor<'a>,
    errors: Arc<Mutex<Vec<TaskError>>>,
    manager: ProcessManager,
    #[allow(dead_code)]
    engine: &'a Arc<Engine>,
    command_factory: CommandFactory<'a>,
}

impl<'a> ExecContextFactory<'a> {
    pub fn new(
        visitor: &'a Visitor<'a>,
        errors: Arc<Mutex<Vec<TaskError>>>,
        manager: ProcessManager,
        engine: &'a Arc<Engine>,
    ) -> Self {
        let mut command_factory = CommandFactory::new();
        command_factory.add_provider(PackageGraphCommandProvider::new(
            visitor.repo_root,
            &visitor.package_graph,
            visitor.run_opts.pass_through_args.as_slice(),
        ));

        Self {
            visitor,
            errors,
            manager,
            engine,
            command_factory,
        }
    }

    /// Builds the execution context for a node, or `None` for nodes whose
    /// package defines no matching script.
    pub fn exec_context(
        &self,
        task_id: TaskId<'static>,
        task_hash: String,
        task_cache: TaskCache,
        mut execution_env: turborepo_env::EnvironmentVariableMap,
    ) -> Result<Option<ExecContext>, super::Error> {
        // Always last so it overwrites any user configured env var.
        execution_env.insert("TURBO_HASH".to_owned(), task_hash.clone());

        let Some(cmd) = self.command_factory.command(&task_id, execution_env)? else {
            return Ok(None);
        };

        let task_id_for_display = self.visitor.display_task_id(&task_id);
        let pretty_prefix = self.prefix_with_color(&task_id);

        Ok(Some(ExecContext {
            task_id,
            task_id_for_display,
            cmd,
            manager: self.manager.clone(),
            continue_on_error: self.visitor.run_opts.continue_on_error,
            pretty_prefix,
            ui: self.visitor.ui,
            task_cache,
            hash_tracker: self.visitor.task_hasher.task_hash_tracker(),
            errors: self.errors.clone(),
            result_sink: self.visitor.run_tracker.result_sink(),
        }))
    }

    pub fn dry_run_exec_context(
        &self,
        task_id: TaskId<'static>,
        task_cache: TaskCache,
    ) -> DryRunExecContext {
        DryRunExecContext {
            task_id,
            task_cache,
            hash_tracker: self.visitor.task_hasher.task_hash_tracker(),
        }
    }

    fn prefix_with_color(&self, task_id: &TaskId) -> StyledObject<String> {
        self.visitor
            .color_cache
            .prefix_with_color(&task_id.to_string(), &self.visitor.prefix(task_id))
    }
}

pub struct ExecContext {
    task_id: TaskId<'static>,
    task_id_for_display: String,
    cmd: Command,
    manager: ProcessManager,
    continue_on_error: bool,
    pretty_prefix: StyledObject<String>,
    ui: UI,
    task_cache: TaskCache,
    hash_tracker: TaskHashTracker,
    errors: Arc<Mutex<Vec<TaskError>>>,
    result_sink: TaskResultSink,
}

impl ExecContext {
    /// Runs one node to completion: restore from cache, else spawn, stream,
    /// and store. The callback tells the engine whether to keep scheduling.
    pub async fn execute(
        mut self,
        tracker: crate::run::summary::TaskTracker<()>,
        output_client: OutputClient<StdWriter>,
        callback: oneshot::Sender<Result<(), StopExecution>>,
    ) -> Result<(), InternalError> {
        let tracker = tracker.start().await;
        let mut prefixed_ui = Visitor::prefixed_ui(
            self.ui,
            &output_client,
            self.pretty_prefix.clone(),
        );

        // Restore happens-before spawn; a hit ends the node here.
        match self.task_cache.restore_outputs(&mut prefixed_ui).await {
            Ok(Some(status)) => {
                self.hash_tracker
                    .insert_cache_status(self.task_id.clone(), Some(status));
                self.hash_tracker.insert_expanded_outputs(
                    self.task_id.clone(),
                    self.task_cache.expanded_outputs().to_vec(),
                );
                let execution = tracker.cached().await;
                self.result_sink.record(self.task_id.clone(), execution);
                callback.send(Ok(())).ok();
                return finish_output(output_client, false);
            }
            Ok(None) => {
                self.hash_tracker
                    .insert_cache_status(self.task_id.clone(), None);
            }
            Err(err) => {
                // Restore trouble is a warning and a miss, never a failure.
                prefixed_ui.warn(format!("cache restore failed: {err}"));
                self.hash_tracker
                    .insert_cache_status(self.task_id.clone(), None);
            }
        }

        let Some(spawn_result) = self
            .manager
            .spawn(self.cmd, CHILD_SHUTDOWN_TIMEOUT)
        else {
            // The manager is tearing the run down; this task was never
            // started and shouldn't report anything loud.
            let execution = tracker.cancel();
            self.result_sink.record(self.task_id.clone(), execution);
            callback.send(Ok(())).ok();
            return finish_output(output_client, false);
        };

        let mut process = match spawn_result {
            Ok(process) => process,
            Err(e) => {
                let cause = TaskErrorCause::from_spawn(e);
                prefixed_ui.error(format!("unable to start task: {cause}"));
                let execution = tracker.build_failed(1, &cause).await;
                self.result_sink.record(self.task_id.clone(), execution);
                self.errors
                    .lock()
                    .expect("errors mutex poisoned")
                    .push(TaskError::new(self.task_id_for_display.clone(), cause));
                let result = if self.continue_on_error {
                    Ok(())
                } else {
                    self.manager.stop().await;
                    Err(StopExecution)
                };
                callback.send(result).ok();
                return finish_output(output_client, true);
            }
        };

        let exit_status = {
            // Live streaming is policy-gated; the log file always captures.
            let direct_writer: Box<dyn Write + Send + '_> = match self.task_cache.output_mode() {
                OutputLogsMode::Full | OutputLogsMode::NewOnly | OutputLogsMode::ErrorsOnly => {
                    Box::new(PrefixedWriter::new(
                        self.ui,
                        self.pretty_prefix.clone(),
                        output_client.stdout(),
                    ))
                }
                OutputLogsMode::HashOnly | OutputLogsMode::None => Box::new(std::io::sink()),
            };
            let stdout_writer = self
                .task_cache
                .output_writer(direct_writer)
                .map_err(|e| InternalError::new(&self.task_id, e))?;

            process
                .wait_with_piped_outputs(stdout_writer)
                .await
                .map_err(|e| InternalError::new(&self.task_id, e))?
        };

        match exit_status {
            Some(ChildExit::Finished(Some(0))) => {
                let execution = tracker.build_succeeded(0).await;
                let duration = execution.duration_ms();

                // The command exited cleanly, and only now does the cache
                // learn about it.
                if let Err(err) = self.task_cache.save_outputs(duration).await {
                    prefixed_ui.warn(format!("failed caching outputs: {err}"));
                }
                self.hash_tracker.insert_expanded_outputs(
                    self.task_id.clone(),
                    self.task_cache.expanded_outputs().to_vec(),
                );

                self.result_sink.record(self.task_id.clone(), execution);
                callback.send(Ok(())).ok();
                finish_output(output_client, false)
            }
            Some(ChildExit::Finished(Some(exit_code))) => {
                let cause =
                    TaskErrorCause::from_execution(process.label().to_string(), exit_code);
                let execution = tracker.build_failed(exit_code, &cause).await;
                self.result_sink.record(self.task_id.clone(), execution);
                prefixed_ui.error(format!("command finished with error: {cause}"));
                self.errors
                    .lock()
                    .expect("errors mutex poisoned")
                    .push(TaskError::new(self.task_id_for_display.clone(), cause));

                let result = if self.continue_on_error {
                    prefixed_ui.warn("command finished with error, but continuing...");
                    Ok(())
                } else {
                    self.manager.stop().await;
                    Err(StopExecution)
                };
                callback.send(result).ok();
                finish_output(output_client, true)
            }
            // The run is being torn down around this task; nothing to
            // report.
            Some(ChildExit::Killed)
            | Some(ChildExit::KilledExternal)
            | Some(ChildExit::Finished(None))
            | None => {
                let execution = tracker.cancel();
                self.result_sink.record(self.task_id.clone(), execution);
                callback.send(Ok(())).ok();
                finish_output(output_client, false)
            }
            Some(ChildExit::Failed) => {
                let cause = TaskErrorCause::Spawn {
                    msg: "unable to determine why child exited".to_string(),
                };
                let execution = tracker.build_failed(1, &cause).await;
                self.result_sink.record(self.task_id.clone(), execution);
                self.errors
                    .lock()
                    .expect("errors mutex poisoned")
                    .push(TaskError::new(self.task_id_for_display.clone(), cause));
                callback.send(Ok(())).ok();
                finish_output(output_client, true)
            }
        }
    }
}

/// A task for a dry run: hash and cache status are recorded, no command is
/// spawned and no cache is mutated. Persistent tasks are scheduled like any
/// other node.
pub struct DryRunExecContext {
    task_id: TaskId<'static>,
    task_cache: TaskCache,
    hash_tracker: TaskHashTracker,
}

impl DryRunExecContext {
    pub async fn execute_dry_run(
        self,
        callback: oneshot::Sender<Result<(), StopExecution>>,
    ) -> Result<(), InternalError> {
        let cache_status = self
            .task_cache
            .exists()
            .await
            .unwrap_or_default();
        self.hash_tracker
            .insert_cache_status(self.task_id.clone(), cache_status);
        callback.send(Ok(())).ok();
        Ok(())
    }
}

/// Plumbing failure inside the executor itself, distinct from a task
/// failing.
#[derive(Debug, thiserror::Error)]
#[error("{task_id}: {source}")]
pub struct InternalError {
    task_id: String,
    #[source]
    source: Box<dyn std::error::Error + Send + Sync>,
}

impl InternalError {
    fn new(task_id: &TaskId, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self {
            task_id: task_id.to_string(),
            source: Box::new(source),
        }
    }
}

fn finish_output(
    output_client: OutputClient<StdWriter>,
    use_error: bool,
) -> Result<(), InternalError> {
    if let Err(e) = output_client.finish(use_error) {
        error!("unable to flush output client: {e}");
    }
    Ok(())
}
