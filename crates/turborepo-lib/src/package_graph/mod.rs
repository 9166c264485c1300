//! The workspace package model. Discovery (filesystem walking, manifest
//! parsing, lockfile resolution) happens upstream; the graph is built from
//! the packages the discovery layer hands over.

use std::collections::{BTreeMap, HashMap, HashSet};

use petgraph::graph::{Graph, NodeIndex};
use serde::Serialize;
use turbopath::{AnchoredSystemPath, AnchoredSystemPathBuf};
use turborepo_graph_utils as graph;

use crate::{
    run::task_id::{TaskId, ROOT_PKG_NAME},
    task_graph::{task_log_filename, LOG_DIR},
};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(into = "String")]
pub enum WorkspaceName {
    Root,
    Other(String),
}

// The teacher-facing alias used throughout the run core.
pub use WorkspaceName as PackageName;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PackageNode {
    Root,
    Workspace(PackageName),
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct PackageJson {
    pub name: Option<String>,
    /// Task name to command string.
    pub scripts: BTreeMap<String, String>,
}

/// Everything the run core needs to know about one workspace package.
#[derive(Debug, Clone)]
pub struct WorkspaceInfo {
    pub package_json: PackageJson,
    /// Workspace-relative directory holding the package.
    pub package_path: AnchoredSystemPathBuf,
    /// Content hash of the package manifest, computed by discovery.
    pub manifest_hash: String,
    /// Names of direct internal dependencies.
    pub dependencies: Vec<String>,
}

impl WorkspaceInfo {
    pub fn package_path(&self) -> &AnchoredSystemPath {
        &self.package_path
    }

    pub fn task_log_path(&self, task_id: &TaskId) -> AnchoredSystemPathBuf {
        self.package_path
            .join_component(LOG_DIR)
            .join_component(&task_log_filename(task_id.task()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PackageManager {
    #[default]
    Npm,
    Pnpm,
    Yarn,
}

impl PackageManager {
    pub fn command(&self) -> &'static str {
        match self {
            PackageManager::Npm => "npm",
            PackageManager::Pnpm => "pnpm",
            PackageManager::Yarn => "yarn",
        }
    }

    pub fn lockfile_name(&self) -> &'static str {
        match self {
            PackageManager::Npm => "package-lock.json",
            PackageManager::Pnpm => "pnpm-lock.yaml",
            PackageManager::Yarn => "yarn.lock",
        }
    }

    /// npm swallows arguments that follow `run <task>` unless they come
    /// after a `--` separator.
    pub fn arg_separator(&self) -> Option<&'static str> {
        match self {
            PackageManager::Npm => Some("--"),
            PackageManager::Pnpm | PackageManager::Yarn => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid workspace dependency graph: {0}")]
    InvalidPackageGraph(#[source] graph::Error),
    #[error("Duplicate workspace name: {0}")]
    DuplicateWorkspace(String),
}

pub struct PackageGraph {
    graph: Graph<PackageNode, ()>,
    node_lookup: HashMap<PackageNode, NodeIndex>,
    workspaces: HashMap<PackageName, WorkspaceInfo>,
    package_manager: PackageManager,
}

pub struct PackageGraphBuilder {
    root_package_json: PackageJson,
    package_manager: PackageManager,
    workspaces: Vec<(PackageName, WorkspaceInfo)>,
}

impl PackageGraph {
    pub fn builder(root_package_json: PackageJson) -> PackageGraphBuilder {
        PackageGraphBuilder {
            root_package_json,
            package_manager: PackageManager::default(),
            workspaces: Vec::new(),
        }
    }

    pub fn workspace_info(&self, name: &PackageName) -> Option<&WorkspaceInfo> {
        self.workspaces.get(name)
    }

    pub fn package_json(&self, name: &PackageName) -> Option<&PackageJson> {
        self.workspace_info(name).map(|info| &info.package_json)
    }

    pub fn package_dir(&self, name: &PackageName) -> Option<&AnchoredSystemPath> {
        self.workspace_info(name).map(|info| info.package_path())
    }

    pub fn workspaces(&self) -> impl Iterator<Item = (&PackageName, &WorkspaceInfo)> {
        self.workspaces.iter()
    }

    pub fn len(&self) -> usize {
        // The root node isn't a workspace.
        self.workspaces
            .keys()
            .filter(|name| !matches!(name, PackageName::Root))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn package_manager(&self) -> PackageManager {
        self.package_manager
    }

    /// Direct workspace dependencies of the given node. External
    /// dependencies are not represented in the graph.
    pub fn immediate_dependencies(&self, node: &PackageNode) -> Option<HashSet<PackageNode>> {
        let index = self.node_lookup.get(node)?;
        Some(
            self.graph
                .neighbors_directed(*index, petgraph::Direction::Outgoing)
                .map(|index| {
                    self.graph
                        .node_weight(index)
                        .expect("node index came from iterating the graph")
                        .clone()
                })
                .filter(|node| !matches!(node, PackageNode::Root))
                .collect(),
        )
    }

    pub fn validate(&self) -> Result<(), Error> {
        graph::validate_graph(&self.graph).map_err(Error::InvalidPackageGraph)
    }

    /// Drops every workspace-to-workspace edge. Used by `--parallel`, where
    /// dependency ordering is intentionally ignored.
    pub fn remove_workspace_dependencies(&mut self) {
        self.graph.retain_edges(|graph, edge| {
            let (_, target) = graph
                .edge_endpoints(edge)
                .expect("edge index came from iterating the graph");
            matches!(graph[target], PackageNode::Root)
        });
    }
}

impl PackageGraphBuilder {
    pub fn with_package_manager(mut self, package_manager: PackageManager) -> Self {
        self.package_manager = package_manager;
        self
    }

    /// Registers a discovered workspace package.
    pub fn with_workspace(mut self, name: impl Into<String>, info: WorkspaceInfo) -> Self {
        self.workspaces
            .push((PackageName::Other(name.into()), info));
        self
    }

    pub fn build(self) -> Result<PackageGraph, Error> {
        let Self {
            root_package_json,
            package_manager,
            workspaces: workspace_list,
        } = self;

        let mut graph = Graph::new();
        let mut node_lookup = HashMap::new();
        let mut workspaces = HashMap::new();

        let root_index = graph.add_node(PackageNode::Root);
        node_lookup.insert(PackageNode::Root, root_index);

        let root_info = WorkspaceInfo {
            package_json: root_package_json,
            package_path: AnchoredSystemPathBuf::from_raw("").expect("empty path is anchored"),
            manifest_hash: String::new(),
            dependencies: Vec::new(),
        };
        workspaces.insert(PackageName::Root, root_info);
        let root_workspace_index = graph.add_node(PackageNode::Workspace(PackageName::Root));
        node_lookup.insert(PackageNode::Workspace(PackageName::Root), root_workspace_index);
        graph.add_edge(root_workspace_index, root_index, ());

        for (name, info) in workspace_list {
            if workspaces.contains_key(&name) {
                return Err(Error::DuplicateWorkspace(name.to_string()));
            }
            let index = graph.add_node(PackageNode::Workspace(name.clone()));
            node_lookup.insert(PackageNode::Workspace(name.clone()), index);
            workspaces.insert(name, info);
        }

        // Dependencies naming no internal package are external and carry no
        // edge.
        for (name, info) in &workspaces {
            let from = node_lookup[&PackageNode::Workspace(name.clone())];
            let mut has_internal_dependency = false;
            for dependency in &info.dependencies {
                let dependency_name = PackageName::from(dependency.as_str());
                if let Some(to) = node_lookup.get(&PackageNode::Workspace(dependency_name)) {
                    graph.add_edge(from, *to, ());
                    has_internal_dependency = true;
                }
            }
            if !has_internal_dependency && !matches!(name, PackageName::Root) {
                graph.add_edge(from, root_index, ());
            }
        }

        let package_graph = PackageGraph {
            graph,
            node_lookup,
            workspaces,
            package_manager,
        };
        package_graph.validate()?;
        Ok(package_graph)
    }
}

impl From<WorkspaceName> for String {
    fn from(name: WorkspaceName) -> String {
        name.to_string()
    }
}

impl From<&str> for PackageName {
    fn from(name: &str) -> Self {
        match name {
            ROOT_PKG_NAME => PackageName::Root,
            name => PackageName::Other(name.to_string()),
        }
    }
}

impl PackageName {
    pub fn as_str(&self) -> &str {
        match self {
            PackageName::Root => ROOT_PKG_NAME,
            PackageName::Other(name) => name,
        }
    }
}

impl std::fmt::Display for PackageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Display for PackageNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PackageNode::Root => f.write_str("___ROOT___"),
            PackageNode::Workspace(name) => name.fmt(f),
        }
    }
}

#[cfg(test)]
pub mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    pub fn workspace(dir: &str, scripts: &[(&str, &str)], deps: &[&str]) -> WorkspaceInfo {
        WorkspaceInfo {
            package_json: PackageJson {
                name: None,
                scripts: scripts
                    .iter()
                    .map(|(task, command)| (task.to_string(), command.to_string()))
                    .collect(),
            },
            package_path: AnchoredSystemPathBuf::from_raw(dir).unwrap(),
            manifest_hash: format!("manifest-{dir}"),
            dependencies: deps.iter().map(|dep| dep.to_string()).collect(),
        }
    }

    #[test]
    fn test_immediate_dependencies() {
        let graph = PackageGraph::builder(PackageJson::default())
            .with_workspace("a", workspace("packages/a", &[], &[]))
            .with_workspace("b", workspace("packages/b", &[], &["a", "left-pad"]))
            .build()
            .unwrap();

        assert_eq!(graph.len(), 2);
        let deps = graph
            .immediate_dependencies(&PackageNode::Workspace(PackageName::from("b")))
            .unwrap();
        // left-pad is external, no edge.
        assert_eq!(
            deps,
            [PackageNode::Workspace(PackageName::from("a"))]
                .into_iter()
                .collect()
        );
    }

    #[test]
    fn test_cycle_detected() {
        let result = PackageGraph::builder(PackageJson::default())
            .with_workspace("a", workspace("packages/a", &[], &["b"]))
            .with_workspace("b", workspace("packages/b", &[], &["a"]))
            .build();
        assert!(matches!(result, Err(Error::InvalidPackageGraph(_))));
    }

    #[test]
    fn test_remove_workspace_dependencies() {
        let mut graph = PackageGraph::builder(PackageJson::default())
            .with_workspace("a", workspace("packages/a", &[], &[]))
            .with_workspace("b", workspace("packages/b", &[], &["a"]))
            .build()
            .unwrap();

        graph.remove_workspace_dependencies();
        let deps = graph
            .immediate_dependencies(&PackageNode::Workspace(PackageName::from("b")))
            .unwrap();
        assert!(deps.is_empty());
    }

    #[test]
    fn test_task_log_path() {
        let info = workspace("apps/web", &[("build", "next build")], &[]);
        let log_path = info.task_log_path(&TaskId::new("web", "build"));
        assert_eq!(log_path.to_unix().as_str(), "apps/web/.turbo/turbo-build.log");
    }
}
