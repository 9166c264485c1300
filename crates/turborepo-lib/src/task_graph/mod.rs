mod visitor;

use serde::ser::{Serialize, SerializeStruct, Serializer};
use turbopath::{AnchoredSystemPath, AnchoredSystemPathBuf};

pub use crate::task_graph::visitor::{Error as VisitorError, Visitor};
use crate::{
    cli::OutputLogsMode,
    run::task_id::{TaskId, TaskName},
    turbo_json::RawTaskDefinition,
};

pub const LOG_DIR: &str = ".turbo";

const TOPOLOGICAL_PIPELINE_DELIMITER: &str = "^";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("dependsOn entry '{0}' is empty after '^'")]
    EmptyTopologicalDependency(String),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TaskOutputs {
    pub inclusions: Vec<String>,
    pub exclusions: Vec<String>,
}

/// A task definition after resolution against the pipeline. Immutable once
/// attached to a graph node.
#[derive(Clone, Debug, PartialEq)]
pub struct TaskDefinition {
    pub outputs: TaskOutputs,
    pub cache: bool,

    /// Same-workspace and explicit `pkg#task` prerequisites.
    pub task_dependencies: Vec<TaskName<'static>>,

    /// `^task` prerequisites, run against each direct workspace dependency.
    pub topological_dependencies: Vec<TaskName<'static>>,

    /// Input globs restricting which package files feed the hash. Empty
    /// means all of them.
    pub inputs: Vec<String>,

    pub output_mode: OutputLogsMode,

    /// Env var names whose values feed this task's hash.
    pub env: Vec<String>,

    pub persistent: bool,
}

impl Default for TaskDefinition {
    fn default() -> Self {
        Self {
            outputs: TaskOutputs::default(),
            cache: true,
            task_dependencies: Vec::new(),
            topological_dependencies: Vec::new(),
            inputs: Vec::new(),
            output_mode: OutputLogsMode::default(),
            env: Vec::new(),
            persistent: false,
        }
    }
}

impl TaskDefinition {
    /// The definition attached to nodes that appear in the graph without any
    /// pipeline entry. They run nothing and cache nothing, but still carry a
    /// hash for their dependents.
    pub fn no_op() -> Self {
        Self {
            cache: false,
            ..Default::default()
        }
    }

    pub fn workspace_relative_log_file(task_name: &str) -> AnchoredSystemPathBuf {
        AnchoredSystemPath::new(LOG_DIR)
            .expect("LOG_DIR is relative")
            .join_component(&task_log_filename(task_name))
    }

    /// Output globs for hashing and caching: the declared inclusions plus
    /// the task's log file, all relative to the workspace directory.
    pub fn hashable_outputs(&self, task_id: &TaskId) -> TaskOutputs {
        let mut inclusion_outputs =
            vec![format!("{LOG_DIR}/{}", task_log_filename(task_id.task()))];
        inclusion_outputs.extend_from_slice(&self.outputs.inclusions);
        inclusion_outputs.sort();

        let mut exclusion_outputs = self.outputs.exclusions.clone();
        exclusion_outputs.sort();

        TaskOutputs {
            inclusions: inclusion_outputs,
            exclusions: exclusion_outputs,
        }
    }

    /// Same as `hashable_outputs`, but rooted at the repo instead of the
    /// workspace directory.
    pub fn repo_relative_hashable_outputs(
        &self,
        task_id: &TaskId,
        workspace_dir: &AnchoredSystemPath,
    ) -> TaskOutputs {
        let make_glob_repo_relative = |glob: &str| -> String {
            let mut repo_relative_glob = workspace_dir.to_unix().to_string();
            repo_relative_glob.push('/');
            repo_relative_glob.push_str(glob);
            repo_relative_glob
        };

        let local_outputs = self.hashable_outputs(task_id);
        TaskOutputs {
            inclusions: local_outputs
                .inclusions
                .iter()
                .map(|glob| make_glob_repo_relative(glob))
                .collect(),
            exclusions: local_outputs
                .exclusions
                .iter()
                .map(|glob| make_glob_repo_relative(glob))
                .collect(),
        }
    }

    /// The authored `dependsOn` list, reconstructed for serialization.
    fn depends_on(&self) -> Vec<String> {
        let mut depends_on = Vec::with_capacity(
            self.task_dependencies.len() + self.topological_dependencies.len(),
        );
        depends_on.extend(
            self.topological_dependencies
                .iter()
                .map(|dep| format!("{TOPOLOGICAL_PIPELINE_DELIMITER}{dep}")),
        );
        depends_on.extend(self.task_dependencies.iter().map(|dep| dep.to_string()));
        depends_on.sort();
        depends_on
    }
}

pub fn task_log_filename(task_name: &str) -> String {
    format!("turbo-{}.log", task_name.replace(':', "$colon$"))
}

impl TryFrom<RawTaskDefinition> for TaskDefinition {
    type Error = Error;

    fn try_from(raw: RawTaskDefinition) -> Result<Self, Error> {
        let mut inclusions = Vec::new();
        let mut exclusions = Vec::new();
        for glob in raw.outputs {
            match glob.strip_prefix('!') {
                Some(exclusion) => exclusions.push(exclusion.to_owned()),
                None => inclusions.push(glob),
            }
        }
        inclusions.sort();
        exclusions.sort();

        let mut task_dependencies = Vec::new();
        let mut topological_dependencies = Vec::new();
        for dependency in raw.depends_on {
            if let Some(topo_dependency) =
                dependency.strip_prefix(TOPOLOGICAL_PIPELINE_DELIMITER)
            {
                if topo_dependency.is_empty() {
                    return Err(Error::EmptyTopologicalDependency(dependency));
                }
                topological_dependencies.push(TaskName::from(topo_dependency.to_string()));
            } else {
                task_dependencies.push(TaskName::from(dependency));
            }
        }
        task_dependencies.sort();
        topological_dependencies.sort();

        let mut env = raw.env;
        env.sort();

        Ok(TaskDefinition {
            outputs: TaskOutputs {
                inclusions,
                exclusions,
            },
            cache: raw.cache.unwrap_or(true),
            task_dependencies,
            topological_dependencies,
            inputs: raw.inputs,
            output_mode: raw.output_mode.unwrap_or_default(),
            env,
            persistent: raw.persistent.unwrap_or_default(),
        })
    }
}

// Serialized in the resolvedTaskDefinition shape consumed by dry runs and
// run summaries: outputs flattened back to the authored glob list, dependsOn
// reconstructed with the `^` prefix.
impl Serialize for TaskDefinition {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut outputs: Vec<String> = self.outputs.inclusions.clone();
        outputs.extend(
            self.outputs
                .exclusions
                .iter()
                .map(|exclusion| format!("!{exclusion}")),
        );

        let mut state = serializer.serialize_struct("TaskDefinition", 7)?;
        state.serialize_field("outputs", &outputs)?;
        state.serialize_field("cache", &self.cache)?;
        state.serialize_field("dependsOn", &self.depends_on())?;
        state.serialize_field("inputs", &self.inputs)?;
        state.serialize_field("outputMode", &self.output_mode)?;
        state.serialize_field("env", &self.env)?;
        state.serialize_field("persistent", &self.persistent)?;
        state.end()
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn definition(raw: serde_json::Value) -> TaskDefinition {
        let raw: RawTaskDefinition = serde_json::from_value(raw).unwrap();
        TaskDefinition::try_from(raw).unwrap()
    }

    #[test]
    fn test_depends_on_split() {
        let task_defn = definition(json!({
            "dependsOn": ["^build", "prepare", "tooling#codegen"],
        }));
        assert_eq!(
            task_defn.topological_dependencies,
            vec![TaskName::from("build")]
        );
        assert_eq!(
            task_defn.task_dependencies,
            vec![TaskName::from("prepare"), TaskName::from("tooling#codegen")]
        );
    }

    #[test]
    fn test_bare_caret_rejected() {
        let raw: RawTaskDefinition = serde_json::from_value(json!({
            "dependsOn": ["^"],
        }))
        .unwrap();
        assert!(TaskDefinition::try_from(raw).is_err());
    }

    #[test]
    fn test_relative_output_globs() {
        let task_defn = definition(json!({
            "outputs": [".next/**/*", "!.next/bad-file"],
        }));

        let task_id = TaskId::new("foo", "build");
        let workspace_dir = AnchoredSystemPath::new("apps/foo").unwrap();

        let relative_outputs = task_defn.repo_relative_hashable_outputs(&task_id, workspace_dir);
        assert_eq!(
            relative_outputs,
            TaskOutputs {
                inclusions: vec![
                    "apps/foo/.next/**/*".to_string(),
                    "apps/foo/.turbo/turbo-build.log".to_string(),
                ],
                exclusions: vec!["apps/foo/.next/bad-file".to_string()],
            }
        );
    }

    #[test]
    fn test_escape_log_file() {
        let build_log = TaskDefinition::workspace_relative_log_file("build");
        assert_eq!(build_log.as_str(), ".turbo/turbo-build.log");

        let build_log = TaskDefinition::workspace_relative_log_file("build:prod");
        assert_eq!(build_log.as_str(), ".turbo/turbo-build$colon$prod.log");
    }

    #[test]
    fn test_resolved_serialization_shape() {
        let task_defn = definition(json!({
            "outputs": ["dist/**", "!dist/cache/**"],
            "dependsOn": ["^build"],
            "env": ["NODE_ENV"],
        }));
        assert_eq!(
            serde_json::to_value(&task_defn).unwrap(),
            json!({
                "outputs": ["dist/**", "!dist/cache/**"],
                "cache": true,
                "dependsOn": ["^build"],
                "inputs": [],
                "outputMode": "full",
                "env": ["NODE_ENV"],
                "persistent": false,
            })
        );
    }
}
