//! The hashing pipeline: per-package file-set hashes, composite task hashes,
//! and the shared tracker that execution and summaries read finalized values
//! from.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
};

use rayon::prelude::*;
use sha2::{Digest, Sha256};
use tracing::debug;
use turbopath::{AbsoluteSystemPath, AnchoredSystemPathBuf};
use turborepo_cache::CacheHitMetadata;
use turborepo_env::{BySource, DetailedMap, EnvironmentVariableMap};

use crate::{
    engine::TaskNode,
    globs,
    hash::{FileHashes, TaskDefinitionHashable, TaskHashable, TurboHash},
    opts::RunOpts,
    package_graph::{PackageGraph, PackageName, WorkspaceInfo},
    run::task_id::TaskId,
    task_graph::TaskDefinition,
};

/// Globs never fed into a package's file hash. The log directory in
/// particular must stay out, or a run would change the inputs of the next
/// one.
const DEFAULT_FILE_EXCLUSIONS: [&str; 3] = [".turbo/**", "node_modules/**", ".git/**"];

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Globs(#[from] globs::Error),
    #[error("missing package.json for {0}")]
    MissingPackageJson(String),
    #[error("cannot find package-file hash for {0}")]
    MissingPackageFileHash(String),
    #[error("missing hash for dependent task {0}")]
    MissingDependencyTaskHash(String),
    #[error(transparent)]
    Env(#[from] turborepo_env::Error),
    #[error("unable to read file for hashing: {0}")]
    Io(#[from] std::io::Error),
}

/// File-set hashes for every task's package, computed up front so the
/// per-node hashing step is pure lookup plus digesting.
#[derive(Debug, Default)]
pub struct PackageInputsHashes {
    hashes: HashMap<TaskId<'static>, String>,
    expanded_hashes: HashMap<TaskId<'static>, FileHashes>,
}

impl PackageInputsHashes {
    pub fn calculate_file_hashes<'a>(
        all_tasks: impl Iterator<Item = &'a TaskNode>,
        package_graph: &PackageGraph,
        task_definitions: &HashMap<TaskId<'static>, TaskDefinition>,
        repo_root: &AbsoluteSystemPath,
    ) -> Result<PackageInputsHashes, Error> {
        let task_ids: Vec<_> = all_tasks
            .filter_map(|node| match node {
                TaskNode::Root => None,
                TaskNode::Task(task_id) => Some(task_id.clone()),
            })
            .collect();

        let hashes = task_ids
            .into_par_iter()
            .map(|task_id| -> Result<_, Error> {
                let task_definition = task_definitions
                    .get(&task_id)
                    .cloned()
                    .unwrap_or_default();
                let workspace = package_graph
                    .workspace_info(&PackageName::from(task_id.package()))
                    .ok_or_else(|| Error::MissingPackageJson(task_id.package().to_string()))?;

                let expanded = package_file_hashes(repo_root, workspace, &task_definition)?;
                let hash = expanded.hash();
                debug!("package-file hash for {task_id} is {hash}");
                Ok((task_id, (hash, expanded)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut result = PackageInputsHashes::default();
        for (task_id, (hash, expanded)) in hashes {
            result.hashes.insert(task_id.clone(), hash);
            result.expanded_hashes.insert(task_id, expanded);
        }
        Ok(result)
    }

    pub fn hash_for_task<'a, 'b: 'a>(&'a self, task_id: &TaskId<'b>) -> Option<&'a str> {
        self.hashes.get(task_id).map(|hash| hash.as_str())
    }
}

/// The file set feeding one task's hash: `inputs` globs when declared,
/// otherwise every tracked file in the package, the package manifest always
/// included.
fn package_file_hashes(
    repo_root: &AbsoluteSystemPath,
    workspace: &WorkspaceInfo,
    task_definition: &TaskDefinition,
) -> Result<FileHashes, Error> {
    let package_dir = repo_root.resolve(workspace.package_path());

    let (inclusions, mut exclusions) = if task_definition.inputs.is_empty() {
        (vec!["**/*".to_string()], Vec::new())
    } else {
        let mut inclusions = Vec::new();
        let mut exclusions = Vec::new();
        for glob in &task_definition.inputs {
            match glob.strip_prefix('!') {
                Some(exclusion) => exclusions.push(exclusion.to_owned()),
                None => inclusions.push(glob.clone()),
            }
        }
        (inclusions, exclusions)
    };
    exclusions.extend(DEFAULT_FILE_EXCLUSIONS.iter().map(|glob| glob.to_string()));

    let mut file_hashes = BTreeMap::new();
    for file in globs::globwalk_files(&package_dir, &inclusions, &exclusions)? {
        let absolute_path = package_dir.resolve(&file);
        let contents = absolute_path.read()?;
        let workspace_relative = workspace.package_path().join(&file);
        file_hashes.insert(
            workspace_relative.to_unix(),
            hex::encode(Sha256::digest(&contents)),
        );
    }

    // The manifest participates even when `inputs` doesn't match it.
    let manifest_path = workspace.package_path().join_component("package.json");
    file_hashes.insert(manifest_path.to_unix(), workspace.manifest_hash.clone());

    Ok(FileHashes(file_hashes))
}

/// Shared mutable state published during the run: finalized task hashes,
/// resolved env maps, expanded inputs and outputs, and cache status. Writes
/// are serialized per node; reads happen after finalization.
#[derive(Default, Debug, Clone)]
pub struct TaskHashTracker {
    state: Arc<Mutex<TaskHashTrackerState>>,
}

#[derive(Default, Debug)]
pub struct TaskHashTrackerState {
    package_task_hashes: HashMap<TaskId<'static>, String>,
    package_task_env_vars: HashMap<TaskId<'static>, DetailedMap>,
    package_task_inputs: HashMap<TaskId<'static>, FileHashes>,
    package_task_outputs: HashMap<TaskId<'static>, Vec<AnchoredSystemPathBuf>>,
    package_task_cache: HashMap<TaskId<'static>, Option<CacheHitMetadata>>,
}

impl TaskHashTracker {
    fn state(&self) -> MutexGuard<'_, TaskHashTrackerState> {
        self.state.lock().expect("hash tracker mutex poisoned")
    }

    pub fn hash(&self, task_id: &TaskId) -> Option<String> {
        self.state().package_task_hashes.get(task_id).cloned()
    }

    pub fn env_vars(&self, task_id: &TaskId) -> Option<DetailedMap> {
        self.state().package_task_env_vars.get(task_id).cloned()
    }

    pub fn expanded_inputs(&self, task_id: &TaskId) -> Option<FileHashes> {
        self.state().package_task_inputs.get(task_id).cloned()
    }

    pub fn expanded_outputs(&self, task_id: &TaskId) -> Option<Vec<AnchoredSystemPathBuf>> {
        self.state().package_task_outputs.get(task_id).cloned()
    }

    pub fn insert_expanded_outputs(
        &self,
        task_id: TaskId<'static>,
        outputs: Vec<AnchoredSystemPathBuf>,
    ) {
        self.state().package_task_outputs.insert(task_id, outputs);
    }

    pub fn cache_status(&self, task_id: &TaskId) -> Option<CacheHitMetadata> {
        self.state()
            .package_task_cache
            .get(task_id)
            .copied()
            .flatten()
    }

    pub fn insert_cache_status(&self, task_id: TaskId<'static>, status: Option<CacheHitMetadata>) {
        self.state().package_task_cache.insert(task_id, status);
    }
}

/// Computes composite task hashes in dependency order. Not `Sync`: hashing
/// happens serially in the visitor's receive loop, which is what guarantees
/// a dependency's hash is finalized before any dependent asks for it.
pub struct TaskHasher<'a> {
    package_inputs_hashes: PackageInputsHashes,
    run_opts: &'a RunOpts,
    env_at_execution_start: &'a EnvironmentVariableMap,
    global_hash: &'a str,
    task_hash_tracker: TaskHashTracker,
}

impl<'a> TaskHasher<'a> {
    pub fn new(
        package_inputs_hashes: PackageInputsHashes,
        run_opts: &'a RunOpts,
        env_at_execution_start: &'a EnvironmentVariableMap,
        global_hash: &'a str,
    ) -> Self {
        Self {
            package_inputs_hashes,
            run_opts,
            env_at_execution_start,
            global_hash,
            task_hash_tracker: TaskHashTracker::default(),
        }
    }

    pub fn calculate_task_hash(
        &self,
        task_id: &TaskId<'static>,
        task_definition: &TaskDefinition,
        workspace_info: &WorkspaceInfo,
        dependency_set: HashSet<&TaskNode>,
    ) -> Result<String, Error> {
        let hash_of_files = self
            .package_inputs_hashes
            .hash_for_task(task_id)
            .ok_or_else(|| Error::MissingPackageFileHash(task_id.to_string()))?;

        let env_vars = self.resolve_declared_env(&task_definition.env)?;
        let hashable_env_pairs = env_vars.all.to_secret_hashable();

        let task_dependency_hashes = self.calculate_dependency_hashes(dependency_set)?;

        let task_hashable = TaskHashable {
            global_hash: self.global_hash,
            task_dependency_hashes,
            hash_of_files,
            package_dir: workspace_info.package_path().to_unix(),
            task: task_id.task(),
            outputs: (&task_definition.outputs).into(),
            pass_through_args: &self.run_opts.pass_through_args,
            task_definition: TaskDefinitionHashable {
                cache: task_definition.cache,
                depends_on: task_definition
                    .task_dependencies
                    .iter()
                    .map(|dep| dep.to_string())
                    .chain(
                        task_definition
                            .topological_dependencies
                            .iter()
                            .map(|dep| format!("^{dep}")),
                    )
                    .collect(),
                inputs: &task_definition.inputs,
                output_mode: task_definition.output_mode,
                persistent: task_definition.persistent,
            },
            env: &task_definition.env,
            resolved_env_vars: hashable_env_pairs,
        };
        let task_hash = task_hashable.hash();
        debug!("task hash for {task_id} is {task_hash}");

        {
            let mut state = self.task_hash_tracker.state();
            state
                .package_task_hashes
                .insert(task_id.clone(), task_hash.clone());
            state.package_task_env_vars.insert(task_id.clone(), env_vars);
            if let Some(expanded) = self.package_inputs_hashes.expanded_hashes.get(task_id) {
                state
                    .package_task_inputs
                    .insert(task_id.clone(), expanded.clone());
            }
        }

        Ok(task_hash)
    }

    /// The env the spawned command sees: the inherited process environment.
    /// `TURBO_HASH` is layered on later, at spawn time.
    pub fn env(&self) -> EnvironmentVariableMap {
        self.env_at_execution_start.clone()
    }

    pub fn task_hash_tracker(&self) -> TaskHashTracker {
        self.task_hash_tracker.clone()
    }

    /// Resolves the declared env names against the environment. A declared
    /// name that is not set still contributes, with the empty value, so
    /// setting it later predictably changes the hash.
    fn resolve_declared_env(&self, names: &[String]) -> Result<DetailedMap, Error> {
        let mut resolved = self.env_at_execution_start.from_wildcards(names)?;
        for name in names {
            if !name.contains('*') && !name.starts_with('!') {
                resolved.entry(name.clone()).or_default();
            }
        }
        Ok(DetailedMap {
            all: resolved.clone(),
            by_source: BySource {
                explicit: resolved,
                matching: EnvironmentVariableMap::default(),
            },
        })
    }

    /// Gathers the finalized hashes of the node's prerequisites, sorted for
    /// canonical ordering.
    fn calculate_dependency_hashes(
        &self,
        dependency_set: HashSet<&TaskNode>,
    ) -> Result<Vec<String>, Error> {
        let mut dependency_hashes = Vec::new();
        for dependency_task in dependency_set {
            let TaskNode::Task(dependency_task_id) = dependency_task else {
                continue;
            };
            let dependency_hash = self
                .task_hash_tracker
                .hash(dependency_task_id)
                .ok_or_else(|| {
                    Error::MissingDependencyTaskHash(dependency_task_id.to_string())
                })?;
            dependency_hashes.push(dependency_hash);
        }
        dependency_hashes.sort();
        Ok(dependency_hashes)
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::package_graph::test::workspace;

    fn run_opts() -> RunOpts {
        RunOpts::default()
    }

    fn env(pairs: &[(&str, &str)]) -> EnvironmentVariableMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<std::collections::HashMap<_, _>>()
            .into()
    }

    fn hasher_fixture<'a>(
        task_id: &TaskId<'static>,
        run_opts: &'a RunOpts,
        env_at_start: &'a EnvironmentVariableMap,
    ) -> TaskHasher<'a> {
        let mut package_inputs_hashes = PackageInputsHashes::default();
        package_inputs_hashes
            .hashes
            .insert(task_id.clone(), "filehashfilehash".to_string());
        TaskHasher::new(package_inputs_hashes, run_opts, env_at_start, "globalhash0000000")
    }

    #[test]
    fn test_declared_env_changes_hash_undeclared_does_not() {
        let task_id = TaskId::new("util", "build").into_owned();
        let opts = run_opts();
        let info = workspace("packages/util", &[("build", "tsc")], &[]);
        let definition = TaskDefinition {
            env: vec!["NODE_ENV".to_string()],
            ..Default::default()
        };

        let unset_env = env(&[]);
        let hasher = hasher_fixture(&task_id, &opts, &unset_env);
        let base = hasher
            .calculate_task_hash(&task_id, &definition, &info, HashSet::new())
            .unwrap();

        let set_env = env(&[("NODE_ENV", "banana")]);
        let hasher = hasher_fixture(&task_id, &opts, &set_env);
        let with_declared = hasher
            .calculate_task_hash(&task_id, &definition, &info, HashSet::new())
            .unwrap();
        assert_ne!(base, with_declared);

        let unrelated_env = env(&[("UNRELATED", "value")]);
        let hasher = hasher_fixture(&task_id, &opts, &unrelated_env);
        let with_unrelated = hasher
            .calculate_task_hash(&task_id, &definition, &info, HashSet::new())
            .unwrap();
        assert_eq!(base, with_unrelated);
    }

    #[test]
    fn test_missing_declared_env_hashes_as_empty() {
        let task_id = TaskId::new("util", "build").into_owned();
        let opts = run_opts();
        let unset_env = env(&[]);
        let info = workspace("packages/util", &[("build", "tsc")], &[]);
        let definition = TaskDefinition {
            env: vec!["SOME_ENV_VAR".to_string()],
            ..Default::default()
        };

        let hasher = hasher_fixture(&task_id, &opts, &unset_env);
        hasher
            .calculate_task_hash(&task_id, &definition, &info, HashSet::new())
            .unwrap();

        let env_vars = hasher.task_hash_tracker().env_vars(&task_id).unwrap();
        assert_eq!(
            env_vars.all.to_secret_hashable(),
            vec![
                "SOME_ENV_VAR=e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
                    .to_string()
            ]
        );
    }

    #[test]
    fn test_dependency_hash_feeds_dependent() {
        let dep_id = TaskId::new("util", "build").into_owned();
        let app_id = TaskId::new("app", "build").into_owned();
        let opts = run_opts();
        let no_env = env(&[]);
        let definition = TaskDefinition::default();

        let mut package_inputs_hashes = PackageInputsHashes::default();
        package_inputs_hashes
            .hashes
            .insert(dep_id.clone(), "utilfiles0000000".to_string());
        package_inputs_hashes
            .hashes
            .insert(app_id.clone(), "appfiles00000000".to_string());
        let hasher = TaskHasher::new(package_inputs_hashes, &opts, &no_env, "globalhash0000000");

        let util_info = workspace("packages/util", &[("build", "tsc")], &[]);
        let app_info = workspace("apps/app", &[("build", "next build")], &["util"]);

        let dep_hash = hasher
            .calculate_task_hash(&dep_id, &definition, &util_info, HashSet::new())
            .unwrap();
        let dep_node = TaskNode::Task(dep_id.clone());
        let app_hash = hasher
            .calculate_task_hash(
                &app_id,
                &definition,
                &app_info,
                [&dep_node].into_iter().collect(),
            )
            .unwrap();
        assert_ne!(dep_hash, app_hash);

        // A dependent whose prerequisite hash is missing is an error, not a
        // silently different hash.
        let missing_node = TaskNode::Task(TaskId::new("ghost", "build").into_owned());
        let result = hasher.calculate_task_hash(
            &app_id,
            &definition,
            &app_info,
            [&missing_node].into_iter().collect(),
        );
        assert!(matches!(result, Err(Error::MissingDependencyTaskHash(_))));
    }
}
