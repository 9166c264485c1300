//! Canonical hashing for task and global fingerprints.
//!
//! Hashables are serialized to a canonical byte encoding (fixed field order,
//! sorted map keys, env values already reduced to `NAME=<sha256>` pairs) and
//! digested with xxh64, rendered as 16 hex chars. Any two runs that agree on
//! the inputs agree on the bytes, and therefore on the hash.

use std::{collections::BTreeMap, hash::Hasher};

use serde::Serialize;
use turbopath::RelativeUnixPathBuf;

use crate::{cli::OutputLogsMode, task_graph::TaskOutputs};

/// Anything canonically serializable can be reduced to a short stable
/// digest.
pub trait TurboHash: Serialize {
    fn hash(&self) -> String {
        let bytes = serde_json::to_vec(self).expect("hashable serialization is infallible");
        let mut hasher = twox_hash::XxHash64::with_seed(0);
        hasher.write(&bytes);
        format!("{:016x}", hasher.finish())
    }
}

#[derive(Debug, Serialize)]
pub struct TaskHashable<'a> {
    // hashes
    pub global_hash: &'a str,
    pub task_dependency_hashes: Vec<String>,
    pub hash_of_files: &'a str,

    // task
    pub package_dir: RelativeUnixPathBuf,
    pub task: &'a str,
    pub outputs: TaskOutputsHashable<'a>,
    pub pass_through_args: &'a [String],

    // resolved definition
    pub task_definition: TaskDefinitionHashable<'a>,

    // env
    pub env: &'a [String],
    pub resolved_env_vars: Vec<String>,
}

/// The resolved-definition fields that feed the hash beyond outputs, which
/// get their own slot above.
#[derive(Debug, Serialize)]
pub struct TaskDefinitionHashable<'a> {
    pub cache: bool,
    pub depends_on: Vec<String>,
    pub inputs: &'a [String],
    pub output_mode: OutputLogsMode,
    pub persistent: bool,
}

#[derive(Debug, Serialize)]
pub struct TaskOutputsHashable<'a> {
    pub inclusions: &'a [String],
    pub exclusions: &'a [String],
}

impl<'a> From<&'a TaskOutputs> for TaskOutputsHashable<'a> {
    fn from(outputs: &'a TaskOutputs) -> Self {
        Self {
            inclusions: &outputs.inclusions,
            exclusions: &outputs.exclusions,
        }
    }
}

#[derive(Debug, Serialize, Default)]
pub struct GlobalHashable<'a> {
    pub global_cache_key: &'a str,
    pub global_file_hash_map: BTreeMap<RelativeUnixPathBuf, String>,
    pub root_external_deps_hash: &'a str,
    pub env: &'a [String],
    pub resolved_env_vars: Vec<String>,
}

/// A package's file set: workspace-relative unix path to content hash.
/// Stored sorted so the digest is path-order independent.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct FileHashes(pub BTreeMap<RelativeUnixPathBuf, String>);

impl TurboHash for TaskHashable<'_> {}
impl TurboHash for GlobalHashable<'_> {}
impl TurboHash for FileHashes {}

#[cfg(test)]
mod test {
    use test_case::test_case;

    use super::*;

    fn file_hashes(pairs: Vec<(&str, &str)>) -> FileHashes {
        FileHashes(
            pairs
                .into_iter()
                .map(|(path, hash)| {
                    (
                        RelativeUnixPathBuf::from_raw(path).unwrap(),
                        hash.to_string(),
                    )
                })
                .collect(),
        )
    }

    fn task_hashable() -> TaskHashable<'static> {
        static EMPTY: [String; 0] = [];
        TaskHashable {
            global_hash: "global_hash",
            task_dependency_hashes: vec!["dependency_hash".to_string()],
            hash_of_files: "hash_of_files",
            package_dir: RelativeUnixPathBuf::from_raw("packages/util").unwrap(),
            task: "build",
            outputs: TaskOutputsHashable {
                inclusions: &EMPTY,
                exclusions: &EMPTY,
            },
            pass_through_args: &EMPTY,
            task_definition: TaskDefinitionHashable {
                cache: true,
                depends_on: vec![],
                inputs: &EMPTY,
                output_mode: OutputLogsMode::Full,
                persistent: false,
            },
            env: &EMPTY,
            resolved_env_vars: vec![],
        }
    }

    #[test]
    fn test_hash_is_stable_and_hex() {
        let first = task_hashable().hash();
        let second = task_hashable().hash();
        assert_eq!(first, second);
        assert_eq!(first.len(), 16);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_each_input_perturbs_the_hash() {
        let base = task_hashable().hash();

        let mut changed = task_hashable();
        changed.global_hash = "other";
        assert_ne!(base, changed.hash());

        let mut changed = task_hashable();
        changed.task_dependency_hashes = vec!["zzz".to_string()];
        assert_ne!(base, changed.hash());

        let mut changed = task_hashable();
        changed.hash_of_files = "other";
        assert_ne!(base, changed.hash());

        let mut changed = task_hashable();
        changed.resolved_env_vars = vec!["NODE_ENV=abc".to_string()];
        assert_ne!(base, changed.hash());

        let mut changed = task_hashable();
        changed.task_definition.cache = false;
        assert_ne!(base, changed.hash());
    }

    #[test_case(vec![] ; "empty")]
    #[test_case(vec![("a", "b"), ("c", "d")] ; "non-empty")]
    fn test_file_hashes_order_resistant(pairs: Vec<(&str, &str)>) {
        let forward = file_hashes(pairs.clone());
        let reverse = file_hashes(pairs.into_iter().rev().collect());
        assert_eq!(forward.hash(), reverse.hash());
    }

    #[test]
    fn test_file_hashes_content_sensitive() {
        let a = file_hashes(vec![("a", "b")]);
        let b = file_hashes(vec![("a", "c")]);
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_global_hashable_env_ordering_is_canonical() {
        let env = ["A".to_string(), "B".to_string()];
        let hashable = GlobalHashable {
            global_cache_key: "key",
            global_file_hash_map: BTreeMap::new(),
            root_external_deps_hash: "lockfile",
            env: &env,
            resolved_env_vars: vec!["A=1".to_string(), "B=2".to_string()],
        };
        let first = hashable.hash();
        let hashable_again = GlobalHashable {
            global_cache_key: "key",
            global_file_hash_map: BTreeMap::new(),
            root_external_deps_hash: "lockfile",
            env: &env,
            resolved_env_vars: vec!["A=1".to_string(), "B=2".to_string()],
        };
        assert_eq!(first, hashable_again.hash());
    }
}
