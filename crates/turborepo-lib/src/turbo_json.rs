//! Pipeline configuration types. Parsing from disk happens upstream; this
//! module owns the shapes and the raw-to-resolved conversion.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{cli::OutputLogsMode, run::task_id::TaskName, task_graph::TaskDefinition};

/// Mapping from task key (`"build"` or `"my-app#build"`) to its raw
/// definition. A package-scoped key replaces the global one wholesale; no
/// field-level merging ever happens, so a per-package override can't
/// accidentally inherit env or inputs from the global entry.
pub type Pipeline = BTreeMap<TaskName<'static>, RawTaskDefinition>;

/// A task definition as authored in the pipeline configuration.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct RawTaskDefinition {
    /// Output globs; entries prefixed with `!` are exclusions.
    pub outputs: Vec<String>,
    pub cache: Option<bool>,
    pub depends_on: Vec<String>,
    /// Input globs; empty means every file in the package.
    pub inputs: Vec<String>,
    pub output_mode: Option<OutputLogsMode>,
    /// Env var names that contribute to this task's hash.
    pub env: Vec<String>,
    pub persistent: Option<bool>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TurboJson {
    pub pipeline: Pipeline,
    pub global_dependencies: Vec<String>,
    pub global_env: Vec<String>,
    pub global_cache_key: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unable to parse turbo.json: {0}")]
    Parse(#[from] serde_json::Error),
}

impl TurboJson {
    pub fn parse(json: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(json)?)
    }

    /// Resolves the definition for a task id: the package-scoped key wins
    /// verbatim, then the global key. `None` means the node is a no-op.
    pub fn task(&self, task_name: &TaskName) -> Option<&RawTaskDefinition> {
        if let Some(task_id) = task_name.task_id() {
            let scoped_key =
                TaskName::from(format!("{}#{}", task_id.package(), task_id.task()));
            if let Some(entry) = self.pipeline.get(&scoped_key) {
                return Some(entry);
            }
        }
        self.pipeline
            .get(&TaskName::from(task_name.task()).into_owned())
    }

    /// Resolution used by the graph builder: given the concrete `(package,
    /// task)` pair, prefer `"<package>#<task>"` and fall back to `"<task>"`.
    pub fn task_definition(
        &self,
        package: &str,
        task: &str,
    ) -> Option<Result<TaskDefinition, crate::task_graph::Error>> {
        let scoped_key = TaskName::from(format!("{package}#{task}"));
        let raw = self
            .pipeline
            .get(&scoped_key)
            .or_else(|| self.pipeline.get(&TaskName::from(task.to_string())))?;
        Some(TaskDefinition::try_from(raw.clone()))
    }

    /// Whether a requested target can be satisfied at all: either a global
    /// definition exists, or some package-scoped key names this task.
    pub fn has_task(&self, task_name: &TaskName) -> bool {
        self.pipeline.keys().any(|key| key.task() == task_name.task())
    }
}
