//! Enums shared with the invocation surface. The actual argument parsing
//! happens in the CLI layer; these are the shapes it hands down.

use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputLogsMode {
    #[default]
    Full,
    None,
    HashOnly,
    NewOnly,
    ErrorsOnly,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DryRunMode {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum LogPrefix {
    #[default]
    Auto,
    None,
}
