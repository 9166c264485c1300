use turbopath::AbsoluteSystemPath;
use turborepo_env::EnvironmentVariableMap;

use super::Error;
use crate::{
    package_graph::{PackageGraph, PackageName},
    process::Command,
    run::task_id::TaskId,
};

/// Constructs the command to spawn for a task, if it has one.
pub trait CommandProvider {
    fn command(
        &self,
        task_id: &TaskId,
        environment: EnvironmentVariableMap,
    ) -> Result<Option<Command>, Error>;
}

/// Asks each provider in registration order; the first one that produces a
/// command wins. An error from any provider short-circuits.
pub struct CommandFactory<'a> {
    providers: Vec<Box<dyn CommandProvider + 'a + Send>>,
}

impl<'a> CommandFactory<'a> {
    pub fn new() -> Self {
        Self {
            providers: Vec::new(),
        }
    }

    pub fn add_provider(&mut self, provider: impl CommandProvider + 'a + Send) -> &mut Self {
        self.providers.push(Box::new(provider));
        self
    }

    pub fn command(
        &self,
        task_id: &TaskId,
        environment: EnvironmentVariableMap,
    ) -> Result<Option<Command>, Error> {
        for provider in self.providers.iter() {
            let cmd = provider.command(task_id, environment.clone())?;
            if cmd.is_some() {
                return Ok(cmd);
            }
        }
        Ok(None)
    }
}

impl Default for CommandFactory<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds `<package manager binary> run <task> [-- passthrough…]` in the
/// package's directory. Tasks whose package doesn't define the script get no
/// command.
pub struct PackageGraphCommandProvider<'a> {
    repo_root: &'a AbsoluteSystemPath,
    package_graph: &'a PackageGraph,
    pass_through_args: &'a [String],
}

impl<'a> PackageGraphCommandProvider<'a> {
    pub fn new(
        repo_root: &'a AbsoluteSystemPath,
        package_graph: &'a PackageGraph,
        pass_through_args: &'a [String],
    ) -> Self {
        Self {
            repo_root,
            package_graph,
            pass_through_args,
        }
    }
}

impl CommandProvider for PackageGraphCommandProvider<'_> {
    fn command(
        &self,
        task_id: &TaskId,
        environment: EnvironmentVariableMap,
    ) -> Result<Option<Command>, Error> {
        let package_name = PackageName::from(task_id.package());
        let workspace_info =
            self.package_graph
                .workspace_info(&package_name)
                .ok_or_else(|| Error::MissingPackage {
                    package_name: package_name.clone(),
                    task_id: task_id.clone().into_owned(),
                })?;

        // A task without a script in package.json spawns nothing.
        if !workspace_info
            .package_json
            .scripts
            .contains_key(task_id.task())
        {
            return Ok(None);
        }

        let package_manager = self.package_graph.package_manager();
        let program = which::which(package_manager.command())?;
        let package_dir = self.repo_root.resolve(workspace_info.package_path());

        let mut args = vec!["run".to_string(), task_id.task().to_string()];
        if !self.pass_through_args.is_empty() {
            if let Some(separator) = package_manager.arg_separator() {
                args.push(separator.to_string());
            }
            args.extend(self.pass_through_args.iter().cloned());
        }

        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(package_dir).envs(
            environment
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );

        Ok(Some(cmd))
    }
}

#[cfg(test)]
mod test {
    use std::ffi::OsStr;

    use super::*;

    struct EchoCmdFactory;

    impl CommandProvider for EchoCmdFactory {
        fn command(
            &self,
            _task_id: &TaskId,
            _environment: EnvironmentVariableMap,
        ) -> Result<Option<Command>, Error> {
            Ok(Some(Command::new("echo")))
        }
    }

    struct ErrProvider;

    impl CommandProvider for ErrProvider {
        fn command(
            &self,
            _task_id: &TaskId,
            _environment: EnvironmentVariableMap,
        ) -> Result<Option<Command>, Error> {
            Err(Error::InternalErrors("oops!".into()))
        }
    }

    struct NoneProvider;

    impl CommandProvider for NoneProvider {
        fn command(
            &self,
            _task_id: &TaskId,
            _environment: EnvironmentVariableMap,
        ) -> Result<Option<Command>, Error> {
            Ok(None)
        }
    }

    #[test]
    fn test_first_present_cmd_returned() {
        let mut factory = CommandFactory::new();
        factory
            .add_provider(EchoCmdFactory)
            .add_provider(ErrProvider);
        let task_id = TaskId::new("foo", "build");
        let cmd = factory
            .command(&task_id, EnvironmentVariableMap::default())
            .unwrap()
            .unwrap();
        assert_eq!(cmd.program(), OsStr::new("echo"));
    }

    #[test]
    fn test_error_short_circuits_factory() {
        let mut factory = CommandFactory::new();
        factory
            .add_provider(ErrProvider)
            .add_provider(EchoCmdFactory);
        let task_id = TaskId::new("foo", "build");
        let err = factory
            .command(&task_id, EnvironmentVariableMap::default())
            .unwrap_err();
        assert_eq!(err.to_string(), "Internal errors encountered: oops!");
    }

    #[test]
    fn test_none_values_filtered() {
        let mut factory = CommandFactory::new();
        factory
            .add_provider(NoneProvider)
            .add_provider(EchoCmdFactory);
        let task_id = TaskId::new("foo", "build");
        let cmd = factory
            .command(&task_id, EnvironmentVariableMap::default())
            .unwrap()
            .unwrap();
        assert_eq!(cmd.program(), OsStr::new("echo"));
    }

    #[test]
    fn test_none_returned_if_no_commands_found() {
        let factory = CommandFactory::new();
        let task_id = TaskId::new("foo", "build");
        let cmd = factory
            .command(&task_id, EnvironmentVariableMap::default())
            .unwrap();
        assert!(cmd.is_none(), "expected no cmd, got {cmd:?}");
    }
}
