//! `process`
//!
//! Owns the child processes spawned for task commands. The manager tracks
//! every live child so a single stop call can tear the whole group down;
//! once it is closing, spawn requests quietly return `None` so tasks racing
//! the shutdown don't report spurious failures.

mod child;
mod command;

use std::{
    io,
    sync::{Arc, Mutex},
    time::Duration,
};

pub use child::{Child, ChildExit, ShutdownStyle};
pub use command::Command;
use futures::future::join_all;
use tracing::{debug, trace};

#[derive(Debug, Clone)]
pub struct ProcessManager {
    state: Arc<Mutex<ProcessManagerInner>>,
}

#[derive(Debug)]
struct ProcessManagerInner {
    is_closing: bool,
    children: Vec<child::Child>,
}

impl ProcessManager {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ProcessManagerInner {
                is_closing: false,
                children: Vec::new(),
            })),
        }
    }

    /// Spawns a child for the command.
    ///
    /// Returns `None` if the manager is closing: callers treat that as "the
    /// run is over", not as a task failure.
    pub fn spawn(
        &self,
        command: Command,
        stop_timeout: Duration,
    ) -> Option<io::Result<child::Child>> {
        let mut lock = self.state.lock().expect("process manager mutex poisoned");
        if lock.is_closing {
            return None;
        }
        let child = child::Child::spawn(command, child::ShutdownStyle::Graceful(stop_timeout));
        if let Ok(child) = &child {
            lock.children.push(child.clone());
        }
        Some(child)
    }

    /// Stops the manager: no new children are admitted and every running
    /// child is asked to shut down (gracefully, then killed).
    pub async fn stop(&self) {
        self.close(|mut child| async move { child.stop().await })
            .await
    }

    /// Waits for the manager: no new children are admitted, and running
    /// children are awaited to natural exit.
    pub async fn wait(&self) {
        self.close(|mut child| async move { child.wait().await })
            .await
    }

    async fn close<F, C>(&self, callback: F)
    where
        F: Fn(Child) -> C,
        C: std::future::Future<Output = Option<ChildExit>>,
    {
        let children = {
            let mut lock = self.state.lock().expect("process manager mutex poisoned");
            lock.is_closing = true;
            lock.children.clone()
        };

        debug!("waiting for {} processes to exit", children.len());
        let exits = join_all(children.into_iter().map(callback)).await;
        for exit in exits {
            trace!("process exited: {:?}", exit);
        }

        let mut lock = self.state.lock().expect("process manager mutex poisoned");
        lock.children.clear();
    }

    pub fn is_closing(&self) -> bool {
        self.state
            .lock()
            .expect("process manager mutex poisoned")
            .is_closing
    }
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new()
    }
}
