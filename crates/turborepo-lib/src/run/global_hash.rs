use std::collections::HashMap;

use sha2::{Digest, Sha256};
use tracing::debug;
use turbopath::{AbsoluteSystemPath, RelativeUnixPathBuf};
use turborepo_env::{get_global_hashable_env_vars, DetailedMap, EnvironmentVariableMap};

use crate::{
    globs,
    hash::{GlobalHashable, TurboHash},
    package_graph::PackageManager,
    task_hash,
};

/// Cache-busting salt for every hash produced by this version of the hashing
/// scheme.
const GLOBAL_CACHE_KEY: &str = "HEY STELLLLLLLAAAAAAAAAAAAA";

/// The workspace-root state that feeds every task hash exactly once per run.
#[derive(Debug, Default)]
pub struct GlobalHashableInputs {
    pub global_cache_key: String,
    pub global_file_hash_map: HashMap<RelativeUnixPathBuf, String>,
    pub root_external_deps_hash: Option<String>,
    pub env: Vec<String>,
    pub resolved_env_vars: Option<DetailedMap>,
}

#[allow(clippy::too_many_arguments)]
pub fn get_global_hash_inputs(
    repo_root: &AbsoluteSystemPath,
    package_manager: PackageManager,
    global_file_dependencies: &[String],
    env_at_execution_start: &EnvironmentVariableMap,
    global_env: &[String],
    global_cache_key_override: Option<&str>,
) -> Result<GlobalHashableInputs, task_hash::Error> {
    let mut global_file_hash_map = HashMap::new();

    // The root manifest and the external-dependencies lockfile always
    // participate; globalDependencies add whatever else the user declared.
    let mut root_files = vec!["package.json".to_string()];
    root_files.extend(global_file_dependencies.iter().cloned());
    for file in globs::globwalk_files(repo_root, &root_files, &[])? {
        let contents = repo_root.resolve(&file).read()?;
        global_file_hash_map.insert(file.to_unix(), hex::encode(Sha256::digest(&contents)));
    }

    let lockfile_path = repo_root.join_component(package_manager.lockfile_name());
    let root_external_deps_hash = match lockfile_path.exists() {
        true => Some(hex::encode(Sha256::digest(lockfile_path.read()?))),
        false => None,
    };

    let mut resolved_env_vars = get_global_hashable_env_vars(env_at_execution_start, global_env)?;
    // Declared-but-unset vars still contribute, with the empty value.
    for name in global_env {
        if !name.contains('*') && !name.starts_with('!') {
            resolved_env_vars
                .all
                .entry(name.clone())
                .or_default();
            resolved_env_vars
                .by_source
                .explicit
                .entry(name.clone())
                .or_default();
        }
    }

    let global_cache_key = global_cache_key_override
        .unwrap_or(GLOBAL_CACHE_KEY)
        .to_string();

    Ok(GlobalHashableInputs {
        global_cache_key,
        global_file_hash_map,
        root_external_deps_hash,
        env: global_env.to_vec(),
        resolved_env_vars: Some(resolved_env_vars),
    })
}

impl GlobalHashableInputs {
    pub fn calculate_global_hash_from_inputs(&self) -> String {
        let global_hash = GlobalHashable {
            global_cache_key: &self.global_cache_key,
            global_file_hash_map: self
                .global_file_hash_map
                .iter()
                .map(|(path, hash)| (path.clone(), hash.clone()))
                .collect(),
            root_external_deps_hash: self.root_external_deps_hash.as_deref().unwrap_or_default(),
            env: &self.env,
            resolved_env_vars: self
                .resolved_env_vars
                .as_ref()
                .map(|vars| vars.all.to_secret_hashable())
                .unwrap_or_default(),
        }
        .hash();
        debug!("global hash: {global_hash}");
        global_hash
    }
}

#[cfg(test)]
mod test {
    use anyhow::Result;

    use super::*;

    fn seed_repo(repo_root: &AbsoluteSystemPath) -> Result<()> {
        repo_root
            .join_component("package.json")
            .create_with_contents(r#"{"name": "monorepo"}"#)?;
        repo_root
            .join_component("package-lock.json")
            .create_with_contents(r#"{"lockfileVersion": 3}"#)?;
        Ok(())
    }

    fn inputs(
        repo_root: &AbsoluteSystemPath,
        env: &EnvironmentVariableMap,
        global_env: &[String],
    ) -> GlobalHashableInputs {
        get_global_hash_inputs(
            repo_root,
            PackageManager::Npm,
            &[],
            env,
            global_env,
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_global_hash_stable_across_runs() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let repo_root = AbsoluteSystemPath::from_std_path(dir.path())?;
        seed_repo(repo_root)?;
        let env = EnvironmentVariableMap::default();

        let first = inputs(repo_root, &env, &[]).calculate_global_hash_from_inputs();
        let second = inputs(repo_root, &env, &[]).calculate_global_hash_from_inputs();
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn test_lockfile_change_changes_hash() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let repo_root = AbsoluteSystemPath::from_std_path(dir.path())?;
        seed_repo(repo_root)?;
        let env = EnvironmentVariableMap::default();

        let before = inputs(repo_root, &env, &[]).calculate_global_hash_from_inputs();
        repo_root
            .join_component("package-lock.json")
            .create_with_contents(r#"{"lockfileVersion": 3, "packages": {}}"#)?;
        let after = inputs(repo_root, &env, &[]).calculate_global_hash_from_inputs();
        assert_ne!(before, after);
        Ok(())
    }

    #[test]
    fn test_global_env_declared_but_unset_still_contributes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let repo_root = AbsoluteSystemPath::from_std_path(dir.path())?;
        seed_repo(repo_root)?;
        let env = EnvironmentVariableMap::default();

        let without = inputs(repo_root, &env, &[]).calculate_global_hash_from_inputs();
        let with_declared = inputs(repo_root, &env, &["SOME_ENV_VAR".to_string()])
            .calculate_global_hash_from_inputs();
        assert_ne!(without, with_declared);
        Ok(())
    }

    #[test]
    fn test_cache_key_override() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let repo_root = AbsoluteSystemPath::from_std_path(dir.path())?;
        seed_repo(repo_root)?;
        let env = EnvironmentVariableMap::default();

        let default_key = inputs(repo_root, &env, &[]).calculate_global_hash_from_inputs();
        let overridden = get_global_hash_inputs(
            repo_root,
            PackageManager::Npm,
            &[],
            &env,
            &[],
            Some("custom-key"),
        )?
        .calculate_global_hash_from_inputs();
        assert_ne!(default_key, overridden);
        Ok(())
    }
}
