use std::collections::BTreeMap;

use serde::Serialize;
use turbopath::{AnchoredSystemPathBuf, RelativeUnixPathBuf};
use turborepo_cache::{CacheHitMetadata, CacheSource};
use turborepo_env::EnvironmentVariablePairs;

use crate::{
    run::{summary::execution::TaskExecutionSummary, task_id::TaskId},
    task_graph::TaskDefinition,
};

/// Which tiers answered for this task's hash. A miss is `false`/`false`;
/// note that a local hit says nothing about the remote tier, it just means
/// the remote was never asked.
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct TaskCacheSummary {
    pub local: bool,
    pub remote: bool,
}

impl TaskCacheSummary {
    pub fn cache_miss() -> Self {
        Self {
            local: false,
            remote: false,
        }
    }
}

impl From<Option<CacheHitMetadata>> for TaskCacheSummary {
    fn from(value: Option<CacheHitMetadata>) -> Self {
        value.map_or_else(Self::cache_miss, |CacheHitMetadata { source, .. }| {
            match source {
                CacheSource::Local => Self {
                    local: true,
                    remote: false,
                },
                CacheSource::Remote => Self {
                    local: false,
                    remote: true,
                },
            }
        })
    }
}

/// One task's entry in the run summary and dry-run output.
#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub task_id: TaskId<'static>,
    pub task: String,
    pub package: String,
    pub hash: String,
    pub cache_state: TaskCacheSummary,
    pub command: String,
    pub outputs: Vec<String>,
    pub excluded_outputs: Vec<String>,
    pub log_file: String,
    pub directory: String,
    pub dependencies: Vec<TaskId<'static>>,
    pub dependents: Vec<TaskId<'static>>,
    pub resolved_task_definition: TaskDefinition,
    pub expanded_inputs: BTreeMap<RelativeUnixPathBuf, String>,
    pub expanded_outputs: Vec<AnchoredSystemPathBuf>,
    pub framework: String,
    pub environment_variables: TaskEnvVarSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution: Option<TaskExecutionSummary>,
}

/// The env var pairs feeding this task's hash, values already reduced to
/// sha256.
#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TaskEnvVarSummary {
    pub configured: EnvironmentVariablePairs,
    pub inferred: EnvironmentVariablePairs,
    pub global: EnvironmentVariablePairs,
}

#[cfg(test)]
mod test {
    use serde_json::json;
    use test_case::test_case;
    use turborepo_cache::CacheHitMetadata;

    use super::*;

    #[test_case(None, TaskCacheSummary { local: false, remote: false } ; "miss")]
    #[test_case(
        Some(CacheHitMetadata { source: CacheSource::Local, time_saved: 5 }),
        TaskCacheSummary { local: true, remote: false }
        ; "local hit"
    )]
    #[test_case(
        Some(CacheHitMetadata { source: CacheSource::Remote, time_saved: 5 }),
        TaskCacheSummary { local: false, remote: true }
        ; "remote hit"
    )]
    fn test_cache_state_from_hit_metadata(
        hit: Option<CacheHitMetadata>,
        expected: TaskCacheSummary,
    ) {
        assert_eq!(TaskCacheSummary::from(hit), expected);
    }

    #[test]
    fn test_cache_state_serialization() {
        assert_eq!(
            serde_json::to_value(TaskCacheSummary::cache_miss()).unwrap(),
            json!({ "local": false, "remote": false })
        );
    }
}
