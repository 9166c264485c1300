use itertools::Itertools;
use turborepo_env::EnvironmentVariablePairs;

use super::{
    execution::TaskExecutionSummary,
    task::{TaskCacheSummary, TaskEnvVarSummary, TaskSummary},
};
use crate::{
    engine::{Engine, TaskNode},
    package_graph::{PackageGraph, PackageName, WorkspaceInfo},
    run::task_id::TaskId,
    task_hash::TaskHashTracker,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no workspace found for {0}")]
    MissingWorkspace(String),
    #[error("no task definition found for {0}")]
    MissingTask(TaskId<'static>),
    #[error("no hash found for {0}")]
    MissingHash(TaskId<'static>),
}

/// Builds summary entries for every node in the graph from the finalized
/// hash tracker state.
pub struct TaskSummaryFactory<'a> {
    package_graph: &'a PackageGraph,
    engine: &'a Engine,
    hash_tracker: TaskHashTracker,
    global_env_pairs: EnvironmentVariablePairs,
}

impl<'a> TaskSummaryFactory<'a> {
    pub fn new(
        package_graph: &'a PackageGraph,
        engine: &'a Engine,
        hash_tracker: TaskHashTracker,
        global_env_pairs: EnvironmentVariablePairs,
    ) -> Self {
        Self {
            package_graph,
            engine,
            hash_tracker,
            global_env_pairs,
        }
    }

    pub fn task_summary(
        &self,
        task_id: TaskId<'static>,
        execution: Option<TaskExecutionSummary>,
    ) -> Result<TaskSummary, Error> {
        let workspace_info = self.workspace_info(&task_id)?;
        let task_definition = self
            .engine
            .task_definition(&task_id)
            .ok_or_else(|| Error::MissingTask(task_id.clone()))?;

        let command = workspace_info
            .package_json
            .scripts
            .get(task_id.task())
            .cloned()
            .unwrap_or_default();

        let hash = self
            .hash_tracker
            .hash(&task_id)
            .ok_or_else(|| Error::MissingHash(task_id.clone()))?;
        let expanded_inputs = self
            .hash_tracker
            .expanded_inputs(&task_id)
            .unwrap_or_default()
            .0;
        let expanded_outputs = self
            .hash_tracker
            .expanded_outputs(&task_id)
            .unwrap_or_default();
        let cache_state = TaskCacheSummary::from(self.hash_tracker.cache_status(&task_id));

        let env_vars = self.hash_tracker.env_vars(&task_id);
        let environment_variables = TaskEnvVarSummary {
            configured: env_vars
                .as_ref()
                .map(|vars| vars.by_source.explicit.to_secret_hashable())
                .unwrap_or_default(),
            inferred: env_vars
                .as_ref()
                .map(|vars| vars.by_source.matching.to_secret_hashable())
                .unwrap_or_default(),
            global: self.global_env_pairs.clone(),
        };

        let dependencies = self.task_neighbors(&task_id, self.engine.dependencies(&task_id));
        let dependents = self.task_neighbors(&task_id, self.engine.dependents(&task_id));

        Ok(TaskSummary {
            task: task_id.task().to_string(),
            package: task_id.package().to_string(),
            hash,
            cache_state,
            command,
            outputs: task_definition.outputs.inclusions.clone(),
            excluded_outputs: task_definition.outputs.exclusions.clone(),
            log_file: workspace_info.task_log_path(&task_id).to_unix().to_string(),
            directory: workspace_info.package_path().to_unix().to_string(),
            dependencies,
            dependents,
            resolved_task_definition: task_definition.clone(),
            expanded_inputs,
            expanded_outputs,
            framework: String::new(),
            environment_variables,
            execution,
            task_id,
        })
    }

    fn workspace_info(&self, task_id: &TaskId) -> Result<&WorkspaceInfo, Error> {
        let workspace_name = PackageName::from(task_id.package());
        self.package_graph
            .workspace_info(&workspace_name)
            .ok_or_else(|| Error::MissingWorkspace(workspace_name.to_string()))
    }

    fn task_neighbors(
        &self,
        _task_id: &TaskId,
        neighbors: Option<std::collections::HashSet<&TaskNode>>,
    ) -> Vec<TaskId<'static>> {
        neighbors
            .unwrap_or_default()
            .into_iter()
            .filter_map(|node| match node {
                TaskNode::Root => None,
                TaskNode::Task(task_id) => Some(task_id.clone()),
            })
            .sorted()
            .collect()
    }
}
