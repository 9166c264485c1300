use std::{borrow::Cow, fmt};

use serde::{Deserialize, Serialize};

pub const TASK_DELIMITER: &str = "#";
pub const ROOT_PKG_NAME: &str = "//";

/// A task identifier that has been fully resolved to a specific package:
/// `"<package>#<task>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId<'a> {
    package: Cow<'a, str>,
    task: Cow<'a, str>,
}

/// A task name as it appears in configuration. May be package-scoped
/// (`"my-app#build"`) or apply to whichever package it gets attached to
/// (`"build"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskName<'a> {
    package: Option<Cow<'a, str>>,
    task: Cow<'a, str>,
}

#[derive(Debug, thiserror::Error)]
#[error("No '#' found in '{input}'")]
pub struct TaskIdError<'a> {
    input: &'a str,
}

impl<'a> TaskId<'a> {
    pub fn new(package: &'a str, task: &'a str) -> Self {
        TaskId {
            package: package.into(),
            task: task.into(),
        }
    }

    pub fn from_static(package: String, task: String) -> TaskId<'static> {
        TaskId {
            package: package.into(),
            task: task.into(),
        }
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn as_task_name(&self) -> TaskName<'_> {
        TaskName {
            package: Some(self.package.as_ref().into()),
            task: self.task.as_ref().into(),
        }
    }

    /// The unscoped name of this task.
    pub fn as_non_workspace_task_name(&self) -> TaskName<'_> {
        TaskName {
            package: None,
            task: self.task.as_ref().into(),
        }
    }

    pub fn into_owned(self) -> TaskId<'static> {
        let TaskId { package, task } = self;
        TaskId {
            package: package.into_owned().into(),
            task: task.into_owned().into(),
        }
    }
}

impl<'a> TryFrom<&'a str> for TaskId<'a> {
    type Error = TaskIdError<'a>;

    fn try_from(input: &'a str) -> Result<Self, Self::Error> {
        match input.split_once(TASK_DELIMITER) {
            // "#task" is not a package task, it's an escaped task name
            None | Some(("", _)) => Err(TaskIdError { input }),
            Some((package, task)) => Ok(TaskId {
                package: package.into(),
                task: task.into(),
            }),
        }
    }
}

impl fmt::Display for TaskId<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{TASK_DELIMITER}{}", self.package, self.task)
    }
}

impl Serialize for TaskId<'_> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'a> TaskName<'a> {
    pub fn package(&self) -> Option<&str> {
        self.package.as_deref()
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn is_package_task(&self) -> bool {
        self.package.is_some()
    }

    /// The task id this name resolves to, if it is package-scoped.
    pub fn task_id(&self) -> Option<TaskId<'_>> {
        Some(TaskId {
            package: self.package.as_deref()?.into(),
            task: self.task.as_ref().into(),
        })
    }

    pub fn into_root_task(self) -> TaskName<'a> {
        let TaskName { task, .. } = self;
        TaskName {
            package: Some(ROOT_PKG_NAME.into()),
            task,
        }
    }

    pub fn into_owned(self) -> TaskName<'static> {
        let TaskName { package, task } = self;
        TaskName {
            package: package.map(|package| package.into_owned().into()),
            task: task.into_owned().into(),
        }
    }
}

impl<'a> From<&'a str> for TaskName<'a> {
    fn from(input: &'a str) -> Self {
        match input.split_once(TASK_DELIMITER) {
            None | Some(("", _)) => TaskName {
                package: None,
                task: input.into(),
            },
            Some((package, task)) => TaskName {
                package: Some(package.into()),
                task: task.into(),
            },
        }
    }
}

impl From<String> for TaskName<'static> {
    fn from(input: String) -> Self {
        TaskName::from(input.as_str()).into_owned()
    }
}

impl fmt::Display for TaskName<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.package {
            Some(package) => write!(f, "{package}{TASK_DELIMITER}{}", self.task),
            None => write!(f, "{}", self.task),
        }
    }
}

impl Serialize for TaskName<'_> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TaskName<'static> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let input = String::deserialize(deserializer)?;
        Ok(TaskName::from(input))
    }
}
