use std::collections::{HashSet, VecDeque};

use itertools::Itertools;
use turborepo_graph_utils as graph;

use crate::{
    engine::{Building, Engine, TaskNode},
    package_graph::{PackageGraph, PackageName, PackageNode},
    run::task_id::{TaskId, TaskName},
    task_graph::TaskDefinition,
    turbo_json::TurboJson,
};

#[derive(Debug, thiserror::Error)]
pub enum BuilderError {
    #[error("Could not find the following tasks in project: {0}")]
    MissingTasks(String),
    #[error(transparent)]
    InvalidTaskGraph(#[from] graph::Error),
    #[error(transparent)]
    InvalidTaskDefinition(#[from] crate::task_graph::Error),
}

/// Expands the requested targets into the full task graph by walking
/// `dependsOn` edges outward from the `(package, task)` frontier.
pub struct EngineBuilder<'a> {
    package_graph: &'a PackageGraph,
    turbo_json: &'a TurboJson,
    workspaces: Vec<PackageName>,
    tasks: Vec<TaskName<'static>>,
    tasks_only: bool,
}

impl<'a> EngineBuilder<'a> {
    pub fn new(package_graph: &'a PackageGraph, turbo_json: &'a TurboJson) -> Self {
        Self {
            package_graph,
            turbo_json,
            workspaces: Vec::new(),
            tasks: Vec::new(),
            tasks_only: false,
        }
    }

    pub fn with_workspaces(mut self, workspaces: Vec<PackageName>) -> Self {
        self.workspaces = workspaces;
        self
    }

    pub fn with_tasks<I: IntoIterator<Item = TaskName<'static>>>(mut self, tasks: I) -> Self {
        self.tasks = tasks.into_iter().collect();
        self
    }

    /// Restricts the graph to exactly the requested `(package, task)` pairs,
    /// dropping prerequisite edges.
    pub fn with_tasks_only(mut self, tasks_only: bool) -> Self {
        self.tasks_only = tasks_only;
        self
    }

    // The set of allowed tasks when --only is used: exactly the product of
    // the packages in scope and the tasks named on the command line.
    fn allowed_tasks(&self) -> Option<HashSet<TaskId<'static>>> {
        if self.tasks_only {
            Some(
                self.workspaces
                    .iter()
                    .cartesian_product(self.tasks.iter())
                    .map(|(package, task_name)| {
                        task_name
                            .task_id()
                            .unwrap_or(TaskId::new(package.as_str(), task_name.task()))
                            .into_owned()
                    })
                    .collect(),
            )
        } else {
            None
        }
    }

    pub fn build(self) -> Result<Engine, BuilderError> {
        // If there are no packages in scope we can exit early.
        if self.workspaces.is_empty() {
            return Ok(Engine::default().seal());
        }

        // Every requested target must resolve to a pipeline entry somewhere:
        // a global key, or a package-scoped key naming the task.
        let mut missing_tasks: HashSet<&TaskName<'static>> =
            HashSet::from_iter(self.tasks.iter());
        let mut traversal_queue = VecDeque::with_capacity(self.workspaces.len());
        for (workspace, task) in self.workspaces.iter().cartesian_product(self.tasks.iter()) {
            let task_id = task
                .task_id()
                .unwrap_or_else(|| TaskId::new(workspace.as_str(), task.task()));

            if self.turbo_json.has_task(task) {
                missing_tasks.remove(task);
                traversal_queue.push_back(task_id.into_owned());
            }
        }

        if !missing_tasks.is_empty() {
            return Err(BuilderError::MissingTasks(
                missing_tasks
                    .into_iter()
                    .map(|task_name| task_name.to_string())
                    .sorted()
                    .join(", "),
            ));
        }

        let allowed_tasks = self.allowed_tasks();

        let mut visited = HashSet::new();
        let mut engine: Engine<Building> = Engine::default();

        while let Some(task_id) = traversal_queue.pop_front() {
            if !visited.insert(task_id.clone()) {
                continue;
            }

            // The resolver never merges: a package-scoped entry replaces the
            // global one wholesale, and a node without any entry is a no-op
            // that still occupies its place in the graph.
            let task_definition = self
                .turbo_json
                .task_definition(task_id.package(), task_id.task())
                .transpose()?
                .unwrap_or_else(TaskDefinition::no_op);

            let to_task_index = engine.get_index(&task_id);

            let dep_pkgs = self
                .package_graph
                .immediate_dependencies(&PackageNode::Workspace(PackageName::from(
                    task_id.package(),
                )));

            let mut has_deps = false;

            // `^task`: the same task in each direct workspace dependency.
            for (from, dependency_workspace) in task_definition
                .topological_dependencies
                .iter()
                .cartesian_product(dep_pkgs.iter().flatten())
            {
                let PackageNode::Workspace(dependency_workspace) = dependency_workspace else {
                    continue;
                };
                let from_task_id =
                    TaskId::new(dependency_workspace.as_str(), from.task()).into_owned();
                if let Some(allowed_tasks) = &allowed_tasks {
                    if !allowed_tasks.contains(&from_task_id) {
                        continue;
                    }
                }
                let from_task_index = engine.get_index(&from_task_id);
                engine.task_graph_mut().add_edge(to_task_index, from_task_index, ());
                has_deps = true;
                traversal_queue.push_back(from_task_id);
            }

            // Plain `"task"` is the same package; `"pkg#task"` is explicit.
            for dep in &task_definition.task_dependencies {
                let from_task_id = dep
                    .task_id()
                    .unwrap_or_else(|| TaskId::new(task_id.package(), dep.task()))
                    .into_owned();
                if let Some(allowed_tasks) = &allowed_tasks {
                    if !allowed_tasks.contains(&from_task_id) {
                        continue;
                    }
                }
                let from_task_index = engine.get_index(&from_task_id);
                engine.task_graph_mut().add_edge(to_task_index, from_task_index, ());
                has_deps = true;
                traversal_queue.push_back(from_task_id);
            }

            engine.add_definition(task_id.clone(), task_definition);
            if !has_deps {
                engine.connect_to_root(&task_id);
            }
        }

        self.prune_no_op_leaves(&mut engine);

        graph::validate_graph(engine.task_graph())?;

        Ok(engine.seal())
    }

    /// Drops nodes that would do no work and influence nothing: no command,
    /// no prerequisites, and no dependents. A no-op node that something
    /// depends on stays as a zero-work barrier so its hash still feeds its
    /// dependents.
    fn prune_no_op_leaves(&self, engine: &mut Engine<Building>) {
        let to_remove: HashSet<TaskId<'static>> = engine
            .task_ids_with_edges()
            .filter_map(|(task_id, has_dependencies, has_dependents)| {
                if has_dependencies || has_dependents {
                    return None;
                }
                let has_command = self
                    .package_graph
                    .package_json(&PackageName::from(task_id.package()))
                    .is_some_and(|package_json| {
                        package_json.scripts.contains_key(task_id.task())
                    });
                (!has_command).then(|| task_id.clone())
            })
            .collect();
        engine.remove_tasks(&to_remove);
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::package_graph::{
        test::workspace, PackageGraph, PackageJson,
    };

    fn turbo_json(value: serde_json::Value) -> TurboJson {
        TurboJson::parse(&value.to_string()).unwrap()
    }

    fn mock_package_graph(workspaces: Vec<(&str, &[(&str, &str)], &[&str])>) -> PackageGraph {
        let mut builder = PackageGraph::builder(PackageJson::default());
        for (name, scripts, deps) in workspaces {
            builder = builder.with_workspace(
                name,
                workspace(&format!("packages/{name}"), scripts, deps),
            );
        }
        builder.build().unwrap()
    }

    macro_rules! deps {
        {} => {
            HashMap::new()
        };
        {$($key:expr => $value:expr),+ $(,)?} => {
            {
                let mut _map = HashMap::new();
                $(
                let key = TaskId::try_from($key).unwrap().into_owned();
                let value = $value.iter().copied().map(|x| {
                    if x == "___ROOT___" {
                        TaskNode::Root
                    } else {
                        TaskNode::Task(TaskId::try_from(x).unwrap().into_owned())
                    }
                }).collect::<std::collections::HashSet<_>>();
                _map.insert(key, value);
                )+
                _map
            }
        };
    }

    fn all_dependencies(
        engine: &Engine,
    ) -> HashMap<TaskId<'static>, std::collections::HashSet<TaskNode>> {
        engine
            .task_ids()
            .map(|task_id| {
                let deps = engine
                    .dependencies(task_id)
                    .expect("node in graph")
                    .into_iter()
                    .cloned()
                    .collect();
                (task_id.clone(), deps)
            })
            .collect()
    }

    const BUILD_SCRIPT: &[(&str, &str)] = &[("build", "build it"), ("test", "test it"), ("prepare", "prepare it")];

    #[test]
    fn test_default_engine() {
        let package_graph = mock_package_graph(vec![
            ("a", BUILD_SCRIPT, &[]),
            ("b", BUILD_SCRIPT, &[]),
            ("c", BUILD_SCRIPT, &["a", "b"]),
        ]);
        let turbo_json = turbo_json(json!({
            "pipeline": {
                "test": { "dependsOn": ["^build", "prepare"] },
                "build": { "dependsOn": ["^build", "prepare"] },
                "prepare": {},
            }
        }));
        let engine = EngineBuilder::new(&package_graph, &turbo_json)
            .with_tasks(Some(TaskName::from("test")))
            .with_workspaces(vec![
                PackageName::from("a"),
                PackageName::from("b"),
                PackageName::from("c"),
            ])
            .build()
            .unwrap();

        let expected = deps! {
            "a#test" => ["a#prepare"],
            "a#build" => ["a#prepare"],
            "a#prepare" => ["___ROOT___"],
            "b#test" => ["b#prepare"],
            "b#build" => ["b#prepare"],
            "b#prepare" => ["___ROOT___"],
            "c#prepare" => ["___ROOT___"],
            "c#test" => ["a#build", "b#build", "c#prepare"],
        };
        assert_eq!(all_dependencies(&engine), expected);
    }

    #[test]
    fn test_dependencies_on_unspecified_packages() {
        // app1 -> libA
        //              \
        //                > libB -> libD
        //              /
        //       app2 <
        //              \ libC
        let package_graph = mock_package_graph(vec![
            ("app1", BUILD_SCRIPT, &["libA"]),
            ("app2", BUILD_SCRIPT, &["libB", "libC"]),
            ("libA", BUILD_SCRIPT, &["libB"]),
            ("libB", BUILD_SCRIPT, &["libD"]),
            ("libC", BUILD_SCRIPT, &[]),
            ("libD", BUILD_SCRIPT, &[]),
        ]);
        let turbo_json = turbo_json(json!({
            "pipeline": {
                "test": { "dependsOn": ["^build"] },
                "build": { "dependsOn": ["^build"] },
            }
        }));
        let engine = EngineBuilder::new(&package_graph, &turbo_json)
            .with_tasks(Some(TaskName::from("test")))
            .with_workspaces(vec![PackageName::from("app2")])
            .build()
            .unwrap();

        let expected = deps! {
            "app2#test" => ["libB#build", "libC#build"],
            "libB#build" => ["libD#build"],
            "libC#build" => ["___ROOT___"],
            "libD#build" => ["___ROOT___"],
        };
        assert_eq!(all_dependencies(&engine), expected);
    }

    #[test]
    fn test_run_package_task() {
        let package_graph = mock_package_graph(vec![
            ("app1", &[("special", "special it"), ("build", "build it")], &["libA"]),
            ("libA", BUILD_SCRIPT, &[]),
        ]);
        let turbo_json = turbo_json(json!({
            "pipeline": {
                "build": { "dependsOn": ["^build"] },
                "app1#special": { "dependsOn": ["^build"] },
            }
        }));
        let engine = EngineBuilder::new(&package_graph, &turbo_json)
            .with_tasks(Some(TaskName::from("special")))
            .with_workspaces(vec![PackageName::from("app1"), PackageName::from("libA")])
            .build()
            .unwrap();

        let expected = deps! {
            "app1#special" => ["libA#build"],
            "libA#build" => ["___ROOT___"],
        };
        assert_eq!(all_dependencies(&engine), expected);
    }

    #[test]
    fn test_explicit_package_task_dependency() {
        let package_graph = mock_package_graph(vec![
            ("app1", BUILD_SCRIPT, &["libA"]),
            ("libA", &[("build", "build it"), ("compile", "compile it")], &[]),
        ]);
        let turbo_json = turbo_json(json!({
            "pipeline": {
                "libA#build": { "dependsOn": ["app1#compile"] },
                "build": { "dependsOn": ["^build"] },
                "compile": {},
            }
        }));
        let engine = EngineBuilder::new(&package_graph, &turbo_json)
            .with_tasks(Some(TaskName::from("build")))
            .with_workspaces(vec![PackageName::from("app1")])
            .build()
            .unwrap();

        let expected = deps! {
            "app1#build" => ["libA#build"],
            "app1#compile" => ["___ROOT___"],
            "libA#build" => ["app1#compile"],
        };
        assert_eq!(all_dependencies(&engine), expected);
    }

    #[test]
    fn test_missing_task_error_message() {
        let package_graph = mock_package_graph(vec![("app1", BUILD_SCRIPT, &[])]);
        let turbo_json = turbo_json(json!({
            "pipeline": {
                "build": {},
            }
        }));
        let err = EngineBuilder::new(&package_graph, &turbo_json)
            .with_tasks(Some(TaskName::from("doesnotexist")))
            .with_workspaces(vec![PackageName::from("app1")])
            .build()
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "Could not find the following tasks in project: doesnotexist"
        );
    }

    #[test]
    fn test_cycle_rejected_with_path() {
        let package_graph = mock_package_graph(vec![("app1", BUILD_SCRIPT, &[])]);
        let turbo_json = turbo_json(json!({
            "pipeline": {
                "build": { "dependsOn": ["test"] },
                "test": { "dependsOn": ["build"] },
            }
        }));
        let err = EngineBuilder::new(&package_graph, &turbo_json)
            .with_tasks(Some(TaskName::from("build")))
            .with_workspaces(vec![PackageName::from("app1")])
            .build()
            .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("Cyclic dependency detected"), "{message}");
        assert!(message.contains("app1#build"), "{message}");
        assert!(message.contains("app1#test"), "{message}");
    }

    #[test]
    fn test_no_op_leaf_pruned_but_barrier_kept() {
        let package_graph = mock_package_graph(vec![
            // `prepare` has no script in either package.
            ("app1", &[("build", "build it")], &["libA"]),
            ("libA", &[("build", "build it")], &[]),
        ]);
        let turbo_json = turbo_json(json!({
            "pipeline": {
                "build": { "dependsOn": ["prepare"] },
                // Scheduled directly, no command, no deps, no dependents.
                "lint": {},
                "prepare": {},
            }
        }));
        let engine = EngineBuilder::new(&package_graph, &turbo_json)
            .with_tasks(vec![TaskName::from("build"), TaskName::from("lint")])
            .with_workspaces(vec![PackageName::from("app1"), PackageName::from("libA")])
            .build()
            .unwrap();

        // The lint nodes are pruned: no command and nothing depends on them.
        // The prepare nodes stay as zero-work barriers feeding build hashes.
        let expected = deps! {
            "app1#build" => ["app1#prepare"],
            "app1#prepare" => ["___ROOT___"],
            "libA#build" => ["libA#prepare"],
            "libA#prepare" => ["___ROOT___"],
        };
        assert_eq!(all_dependencies(&engine), expected);
    }

    #[test]
    fn test_tasks_only() {
        let package_graph = mock_package_graph(vec![
            ("a", BUILD_SCRIPT, &[]),
            ("b", BUILD_SCRIPT, &["a"]),
        ]);
        let turbo_json = turbo_json(json!({
            "pipeline": {
                "build": { "dependsOn": ["^build", "prepare"] },
                "prepare": {},
            }
        }));
        let engine = EngineBuilder::new(&package_graph, &turbo_json)
            .with_tasks_only(true)
            .with_tasks(Some(TaskName::from("build")))
            .with_workspaces(vec![PackageName::from("b")])
            .build()
            .unwrap();

        let expected = deps! {
            "b#build" => ["___ROOT___"],
        };
        assert_eq!(all_dependencies(&engine), expected);
    }

    #[test]
    fn test_persistent_dependency_rejected() {
        let package_graph = mock_package_graph(vec![(
            "app1",
            &[("build", "build it"), ("dev", "dev it")],
            &[],
        )]);
        let turbo_json = turbo_json(json!({
            "pipeline": {
                "build": { "dependsOn": ["dev"] },
                "dev": { "cache": false, "persistent": true },
            }
        }));
        let engine = EngineBuilder::new(&package_graph, &turbo_json)
            .with_tasks(Some(TaskName::from("build")))
            .with_workspaces(vec![PackageName::from("app1")])
            .build()
            .unwrap();

        let errors = engine.validate(&package_graph, 10).unwrap_err();
        assert!(errors.iter().any(|error| matches!(
            error,
            crate::engine::ValidateError::DependencyOnPersistentTask { .. }
        )));
    }
}
