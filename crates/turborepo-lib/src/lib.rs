#![deny(clippy::all)]
//! The run core: task graph construction and bounded execution, the hashing
//! pipeline, the run cache front-end, and run summaries. Command-line
//! parsing, workspace discovery, and remote cache transport live upstream of
//! this crate and hand their results in through `opts`, `package_graph`, and
//! `turborepo_cache::RemoteClient`.

pub mod cli;
mod engine;
mod globs;
mod hash;
pub mod opts;
pub mod package_graph;
pub mod process;
pub mod run;
pub mod signal;
mod task_graph;
mod task_hash;
pub mod turbo_json;

pub use run::Run;

pub fn get_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
