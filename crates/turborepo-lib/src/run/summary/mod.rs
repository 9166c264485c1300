mod execution;
mod global_hash;
mod task;
mod task_factory;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Local};
pub use execution::{ExecutionSummary, ExecutionTracker, SummaryState, TaskTracker};
pub use global_hash::GlobalHashSummary;
use itertools::Itertools;
use serde::Serialize;
pub use task::{TaskCacheSummary, TaskEnvVarSummary, TaskSummary};
pub use task_factory::TaskSummaryFactory;
use turbopath::AbsoluteSystemPath;
use turborepo_ui::{cprintln, BOLD, GREY, UI};

use crate::{
    cli::DryRunMode,
    engine::Engine,
    opts::RunOpts,
    package_graph::PackageGraph,
    run::{global_hash::GlobalHashableInputs, task_id::TaskId},
    task_hash::TaskHashTracker,
    turbo_json::Pipeline,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to write run summary: {0}")]
    IO(#[from] std::io::Error),
    #[error("Failed to serialize run summary to JSON: {0}")]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    TaskFactory(#[from] task_factory::Error),
    #[error("Summary state thread panicked")]
    StateThread,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunSummary<'a> {
    turbo_version: &'a str,
    global_hash_summary: GlobalHashSummary<'a>,
    tasks: Vec<TaskSummary>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SavedRunSummary<'a> {
    id: i64,
    execution_summary: ExecutionSummary,
    #[serde(flatten)]
    run_summary: RunSummary<'a>,
}

/// Records one task's terminal state. Each task is recorded exactly once,
/// inside the guarded section, as the executor's final act.
#[derive(Clone)]
pub struct TaskResultSink {
    executions: Arc<Mutex<HashMap<TaskId<'static>, execution::TaskExecutionSummary>>>,
}

impl TaskResultSink {
    pub fn record(
        &self,
        task_id: TaskId<'static>,
        task_execution: execution::TaskExecutionSummary,
    ) {
        self.executions
            .lock()
            .expect("run tracker mutex poisoned")
            .insert(task_id, task_execution);
    }
}

/// Accumulates per-task outcomes during a run and turns them into the
/// end-of-run output: status counts, the dry-run JSON, or a persisted
/// summary file.
pub struct RunTracker {
    execution_tracker: ExecutionTracker,
    executions: Arc<Mutex<HashMap<TaskId<'static>, execution::TaskExecutionSummary>>>,
    started_at: DateTime<Local>,
    version: &'static str,
    synthesized_command: String,
}

impl RunTracker {
    pub fn new(
        started_at: DateTime<Local>,
        version: &'static str,
        synthesized_command: String,
    ) -> Self {
        Self {
            execution_tracker: ExecutionTracker::new(),
            executions: Arc::new(Mutex::new(HashMap::new())),
            started_at,
            version,
            synthesized_command,
        }
    }

    pub fn track_task(&self, task_id: TaskId<'static>) -> TaskTracker<()> {
        self.execution_tracker.tracker(task_id)
    }

    /// Cloneable handle the executors use to record terminal states.
    pub fn result_sink(&self) -> TaskResultSink {
        TaskResultSink {
            executions: self.executions.clone(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn finish(
        self,
        exit_code: i32,
        repo_root: &AbsoluteSystemPath,
        run_opts: &RunOpts,
        package_graph: &PackageGraph,
        engine: &Engine,
        hash_tracker: TaskHashTracker,
        global_hash_inputs: &GlobalHashableInputs,
        pipeline: &Pipeline,
        ui: UI,
    ) -> Result<(), Error> {
        let state = self
            .execution_tracker
            .finish()
            .await
            .map_err(|_| Error::StateThread)?;
        let mut executions = self
            .executions
            .lock()
            .expect("run tracker mutex poisoned")
            .clone();

        let global_env_pairs = global_hash_inputs
            .resolved_env_vars
            .as_ref()
            .map(|vars| vars.all.to_secret_hashable())
            .unwrap_or_default();
        let factory =
            TaskSummaryFactory::new(package_graph, engine, hash_tracker, global_env_pairs);

        let tasks = engine
            .task_ids()
            .sorted()
            .map(|task_id| {
                let execution = executions.remove(task_id);
                factory.task_summary(task_id.clone(), execution)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let run_summary = RunSummary {
            turbo_version: self.version,
            global_hash_summary: GlobalHashSummary::new(global_hash_inputs, pipeline),
            tasks,
        };

        match run_opts.dry_run {
            Some(DryRunMode::Json) => {
                println!("{}", serde_json::to_string_pretty(&run_summary)?);
            }
            Some(DryRunMode::Text) => {
                Self::print_dry_text(&run_summary, ui);
            }
            None => {
                let failed_tasks: Vec<_> = run_summary
                    .tasks
                    .iter()
                    .filter(|task| {
                        task.execution
                            .as_ref()
                            .is_some_and(|execution| execution.is_failure())
                    })
                    .map(|task| &task.task_id)
                    .collect();

                let summary_path = run_opts
                    .summarize
                    .then(|| {
                        let path = repo_root.join_components(&[
                            ".turbo",
                            "runs",
                            &format!("{}.json", self.started_at.timestamp_millis()),
                        ]);
                        let saved = SavedRunSummary {
                            id: self.started_at.timestamp_millis(),
                            execution_summary: ExecutionSummary::new(
                                self.synthesized_command.clone(),
                                state,
                                engine.task_ids().count(),
                                self.started_at,
                                Local::now(),
                                exit_code,
                            ),
                            run_summary: RunSummary {
                                turbo_version: run_summary.turbo_version,
                                global_hash_summary: GlobalHashSummary::new(
                                    global_hash_inputs,
                                    pipeline,
                                ),
                                tasks: run_summary.tasks.clone(),
                            },
                        };
                        let json = serde_json::to_string_pretty(&saved)?;
                        path.ensure_dir()?;
                        path.create_with_contents(json)?;
                        Ok::<_, Error>(path)
                    })
                    .transpose()?;

                let execution_summary = ExecutionSummary::new(
                    self.synthesized_command.clone(),
                    state,
                    engine.task_ids().count(),
                    self.started_at,
                    Local::now(),
                    exit_code,
                );
                execution_summary.print(ui, summary_path, failed_tasks);
            }
        }

        Ok(())
    }

    fn print_dry_text(run_summary: &RunSummary, ui: UI) {
        cprintln!(ui, BOLD, "Tasks to Run");
        for task in &run_summary.tasks {
            cprintln!(ui, BOLD, "{}", task.task_id);
            cprintln!(ui, GREY, "  Task             = {}", task.task);
            cprintln!(ui, GREY, "  Package          = {}", task.package);
            cprintln!(ui, GREY, "  Hash             = {}", task.hash);
            cprintln!(
                ui,
                GREY,
                "  Cached (Local)   = {}",
                task.cache_state.local
            );
            cprintln!(
                ui,
                GREY,
                "  Cached (Remote)  = {}",
                task.cache_state.remote
            );
            cprintln!(ui, GREY, "  Command          = {}", task.command);
            cprintln!(ui, GREY, "  Directory        = {}", task.directory);
            cprintln!(ui, GREY, "  Log File         = {}", task.log_file);
            cprintln!(
                ui,
                GREY,
                "  Dependencies     = {}",
                task.dependencies.iter().map(|id| id.to_string()).join(", ")
            );
            cprintln!(
                ui,
                GREY,
                "  Dependents       = {}",
                task.dependents.iter().map(|id| id.to_string()).join(", ")
            );
        }
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;

    use anyhow::Result;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use turbopath::AbsoluteSystemPath;
    use turborepo_env::EnvironmentVariableMap;

    use super::*;
    use crate::{
        engine::EngineBuilder,
        package_graph::{PackageGraph, PackageJson, PackageName, WorkspaceInfo},
        run::{global_hash::get_global_hash_inputs, task_id::TaskName},
        task_hash::{PackageInputsHashes, TaskHasher},
        turbo_json::TurboJson,
    };

    const SHA256_OF_EMPTY: &str =
        "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
    const SHA256_OF_BANANA: &str =
        "b493d48364afe44d11c0165cf470a4164d1e2609911ef998be868d46ade3de4e";

    fn seed_workspace(repo_root: &AbsoluteSystemPath) -> Result<()> {
        repo_root
            .join_component("package.json")
            .create_with_contents(r#"{"name": "monorepo"}"#)?;
        repo_root
            .join_component("package-lock.json")
            .create_with_contents(r#"{"lockfileVersion": 3}"#)?;
        for (dir, source) in [("my-app", "console.log('app')"), ("util", "module.exports = 1")] {
            let package_dir = repo_root.join_components(&["packages", dir, "src"]);
            package_dir.create_dir_all()?;
            package_dir
                .join_component("index.js")
                .create_with_contents(source)?;
        }
        Ok(())
    }

    fn workspace_info(dir: &str) -> WorkspaceInfo {
        WorkspaceInfo {
            package_json: PackageJson {
                name: Some(dir.to_string()),
                scripts: [("build".to_string(), "build it".to_string())]
                    .into_iter()
                    .collect(),
            },
            package_path: turbopath::AnchoredSystemPathBuf::from_raw(format!("packages/{dir}"))
                .unwrap(),
            manifest_hash: format!("manifest-{dir}"),
            dependencies: Vec::new(),
        }
    }

    /// Builds the full dry-run summary for the S-series workspace: `my-app`
    /// with declared outputs, `util` hashing `NODE_ENV`.
    fn build_summary(
        repo_root: &AbsoluteSystemPath,
        env_at_execution_start: &EnvironmentVariableMap,
    ) -> Result<serde_json::Value> {
        let package_graph = PackageGraph::builder(PackageJson::default())
            .with_workspace("my-app", workspace_info("my-app"))
            .with_workspace("util", workspace_info("util"))
            .build()?;

        let turbo_json = TurboJson::parse(
            &json!({
                "pipeline": {
                    "build": { "env": ["NODE_ENV"] },
                    "my-app#build": { "outputs": ["apple.json", "banana.txt"] },
                },
                "globalEnv": ["SOME_ENV_VAR", "VERCEL_ANALYTICS_ID"],
            })
            .to_string(),
        )?;

        let engine = EngineBuilder::new(&package_graph, &turbo_json)
            .with_tasks(Some(TaskName::from("build")))
            .with_workspaces(vec![PackageName::from("my-app"), PackageName::from("util")])
            .build()?;

        let global_hash_inputs = get_global_hash_inputs(
            repo_root,
            package_graph.package_manager(),
            &turbo_json.global_dependencies,
            env_at_execution_start,
            &turbo_json.global_env,
            turbo_json.global_cache_key.as_deref(),
        )?;
        let global_hash = global_hash_inputs.calculate_global_hash_from_inputs();

        let package_inputs_hashes = PackageInputsHashes::calculate_file_hashes(
            engine.tasks(),
            &package_graph,
            engine.task_definitions(),
            repo_root,
        )?;
        let run_opts = crate::opts::RunOpts::default();
        let hasher = TaskHasher::new(
            package_inputs_hashes,
            &run_opts,
            env_at_execution_start,
            &global_hash,
        );
        for task_id in engine.task_ids().sorted() {
            let definition = engine.task_definition(task_id).unwrap();
            let workspace_info = package_graph
                .workspace_info(&PackageName::from(task_id.package()))
                .unwrap();
            hasher.calculate_task_hash(task_id, definition, workspace_info, HashSet::new())?;
        }

        let global_env_pairs = global_hash_inputs
            .resolved_env_vars
            .as_ref()
            .map(|vars| vars.all.to_secret_hashable())
            .unwrap_or_default();
        let factory = TaskSummaryFactory::new(
            &package_graph,
            &engine,
            hasher.task_hash_tracker(),
            global_env_pairs,
        );
        let tasks = engine
            .task_ids()
            .sorted()
            .map(|task_id| factory.task_summary(task_id.clone(), None))
            .collect::<Result<Vec<_>, _>>()?;

        let run_summary = RunSummary {
            turbo_version: "1.11.0",
            global_hash_summary: GlobalHashSummary::new(&global_hash_inputs, &turbo_json.pipeline),
            tasks,
        };
        Ok(serde_json::to_value(&run_summary)?)
    }

    #[test]
    fn test_dry_run_shape() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let repo_root = AbsoluteSystemPath::from_std_path(dir.path())?;
        seed_workspace(repo_root)?;

        let env = EnvironmentVariableMap::default();
        let value = build_summary(repo_root, &env)?;

        let top_keys: Vec<_> = value.as_object().unwrap().keys().cloned().sorted().collect();
        assert_eq!(top_keys, vec!["globalHashSummary", "tasks", "turboVersion"]);

        let global_keys: Vec<_> = value["globalHashSummary"]
            .as_object()
            .unwrap()
            .keys()
            .cloned()
            .sorted()
            .collect();
        assert_eq!(
            global_keys,
            vec![
                "globalCacheKey",
                "globalFileHashMap",
                "pipeline",
                "rootExternalDepsHash",
            ]
        );

        let tasks = value["tasks"].as_array().unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0]["taskId"], "my-app#build");
        assert_eq!(tasks[1]["taskId"], "util#build");

        for key in [
            "taskId",
            "task",
            "package",
            "hash",
            "cacheState",
            "command",
            "outputs",
            "excludedOutputs",
            "logFile",
            "directory",
            "dependencies",
            "dependents",
            "resolvedTaskDefinition",
            "expandedInputs",
            "expandedOutputs",
            "framework",
            "environmentVariables",
        ] {
            assert!(
                tasks[0].get(key).is_some(),
                "task entry missing key {key}: {}",
                tasks[0]
            );
        }

        // The override replaced the global definition wholesale.
        assert_eq!(
            tasks[0]["outputs"],
            json!(["apple.json", "banana.txt"])
        );
        assert_eq!(tasks[0]["environmentVariables"]["configured"], json!([]));

        // util inherits the global definition; NODE_ENV is unset so it
        // hashes as the empty value.
        assert_eq!(
            tasks[1]["environmentVariables"]["configured"],
            json!([format!("NODE_ENV={SHA256_OF_EMPTY}")])
        );

        // Both unset global env vars are present, hashed as empty.
        let global_env = value["tasks"][0]["environmentVariables"]["global"]
            .as_array()
            .unwrap();
        assert_eq!(
            global_env,
            &vec![
                json!(format!("SOME_ENV_VAR={SHA256_OF_EMPTY}")),
                json!(format!("VERCEL_ANALYTICS_ID={SHA256_OF_EMPTY}")),
            ]
        );

        // The same workspace state serializes identically on a second pass.
        let again = build_summary(repo_root, &env)?;
        assert_eq!(value, again);
        Ok(())
    }

    #[test]
    fn test_env_var_only_changes_declaring_task() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let repo_root = AbsoluteSystemPath::from_std_path(dir.path())?;
        seed_workspace(repo_root)?;

        let unset = EnvironmentVariableMap::default();
        let before = build_summary(repo_root, &unset)?;

        let set: EnvironmentVariableMap = [("NODE_ENV".to_string(), "banana".to_string())]
            .into_iter()
            .collect::<std::collections::HashMap<_, _>>()
            .into();
        let after = build_summary(repo_root, &set)?;

        // util#build sees the new value and a new hash.
        assert_eq!(
            after["tasks"][1]["environmentVariables"]["configured"],
            json!([format!("NODE_ENV={SHA256_OF_BANANA}")])
        );
        assert_ne!(before["tasks"][1]["hash"], after["tasks"][1]["hash"]);

        // my-app#build doesn't declare NODE_ENV; its hash is untouched.
        assert_eq!(before["tasks"][0]["hash"], after["tasks"][0]["hash"]);
        Ok(())
    }
}
