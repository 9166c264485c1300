use std::sync::{Arc, Mutex};

use futures::{stream::FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::debug;
use turborepo_graph_utils::Walker;

use super::{Engine, TaskNode};
use crate::run::task_id::TaskId;

pub struct Message<T, U> {
    pub info: T,
    pub callback: oneshot::Sender<U>,
}

// Type alias used just to make altering the data sent to the visitor easier
// in the future
type VisitorData = TaskId<'static>;
type VisitorResult = Result<(), StopExecution>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionOptions {
    parallel: bool,
    concurrency: usize,
}

impl ExecutionOptions {
    pub fn new(parallel: bool, concurrency: usize) -> Self {
        Self {
            parallel,
            concurrency,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("Semaphore closed before all tasks finished")]
    Semaphore(#[from] tokio::sync::AcquireError),
    #[error("Engine visitor closed channel before walk finished")]
    Visitor,
}

impl From<mpsc::error::SendError<Message<VisitorData, VisitorResult>>> for ExecuteError {
    fn from(
        _: mpsc::error::SendError<Message<TaskId<'static>, Result<(), StopExecution>>>,
    ) -> Self {
        ExecuteError::Visitor
    }
}

/// Sentinel returned by a visitor to stop scheduling new tasks. Tasks that
/// are already running are unaffected.
#[derive(Debug, Clone, Copy)]
pub struct StopExecution;

impl Engine {
    /// Walks the task graph, sending each ready task id to the visitor and
    /// holding dependents until the visitor reports completion.
    ///
    /// With `parallel`, a node is marked done for the walker as soon as the
    /// visitor has accepted it, so dependents execute without waiting.
    /// Hash ordering survives this because the visitor computes hashes
    /// serially in message-arrival order, and a prerequisite's message is
    /// always enqueued before its dependents become ready.
    pub async fn execute(
        self: Arc<Self>,
        options: ExecutionOptions,
        visitor: mpsc::Sender<Message<VisitorData, VisitorResult>>,
    ) -> Result<(), ExecuteError> {
        let ExecutionOptions {
            parallel,
            concurrency,
        } = options;
        let sema = Arc::new(Semaphore::new(concurrency));
        let mut tasks: FuturesUnordered<tokio::task::JoinHandle<Result<(), ExecuteError>>> =
            FuturesUnordered::new();

        let (walker, mut nodes) = Walker::new(&self.task_graph).walk();
        let walker = Arc::new(Mutex::new(walker));

        while let Some((node_id, done)) = nodes.recv().await {
            let visitor = visitor.clone();
            let sema = sema.clone();
            let walker = walker.clone();
            let this = self.clone();

            tasks.push(tokio::spawn(async move {
                let TaskNode::Task(task_id) = this
                    .task_graph
                    .node_weight(node_id)
                    .expect("node id should be present")
                else {
                    // Root task has nothing to do so we don't emit any event
                    // for it
                    if done.send(()).is_err() {
                        debug!("graph walk done receiver closed before root node was processed");
                    }
                    return Ok(());
                };

                // Each task blocks on a concurrency permit unless parallel
                // was requested.
                let _permit = match parallel {
                    false => Some(sema.acquire().await.expect(
                        "Graph concurrency semaphore closed while tasks are still attempting to \
                         acquire permits",
                    )),
                    true => None,
                };

                let (message, result) = Message::new(task_id.clone());
                visitor.send(message).await?;

                let mut done = Some(done);
                if parallel {
                    // Unblock dependents immediately; execution order is no
                    // longer gated on edges.
                    if done.take().expect("done sent once").send(()).is_err() {
                        debug!("graph walk done receiver closed before node was finished");
                    }
                }

                if let Err(StopExecution) = result.await.unwrap_or_else(|_| {
                    // If the visitor drops the callback without sending a
                    // result we assume the task finished.
                    tracing::trace!("visitor dropped callback sender without sending result");
                    Ok(())
                }) {
                    if walker
                        .lock()
                        .expect("Walker mutex poisoned")
                        .cancel()
                        .is_err()
                    {
                        debug!("unable to cancel graph walk");
                    }
                }
                if let Some(done) = done {
                    if done.send(()).is_err() {
                        debug!("graph walk done receiver closed before node was finished");
                    }
                }
                Ok(())
            }));
        }

        while let Some(res) = tasks.next().await {
            res.expect("unable to join task")?;
        }

        Ok(())
    }
}

impl<T, U> Message<T, U> {
    pub fn new(info: T) -> (Self, oneshot::Receiver<U>) {
        let (callback, receiver) = oneshot::channel();
        (Self { info, callback }, receiver)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{run::task_id::TaskId, task_graph::TaskDefinition};

    // a <- b <- c (b depends on a, c depends on b)
    fn three_task_engine() -> Engine {
        let mut engine = crate::engine::Engine::new();
        let a = TaskId::new("a", "build").into_owned();
        let b = TaskId::new("b", "build").into_owned();
        let c = TaskId::new("c", "build").into_owned();
        engine.add_edge(&b, &a);
        engine.add_edge(&c, &b);
        engine.connect_to_root(&a);
        for task_id in [a, b, c] {
            engine.add_definition(task_id, TaskDefinition::default());
        }
        engine.seal()
    }

    #[tokio::test]
    async fn test_prerequisites_complete_before_dependents_start() {
        let engine = Arc::new(three_task_engine());
        let (visitor_tx, mut visitor_rx) = mpsc::channel(1);
        let execute =
            tokio::spawn(engine.execute(ExecutionOptions::new(false, 2), visitor_tx));

        let mut visited = Vec::new();
        while let Some(message) = visitor_rx.recv().await {
            visited.push(message.info.clone());
            message.callback.send(Ok(())).unwrap();
        }
        execute.await.unwrap().unwrap();

        assert_eq!(
            visited
                .iter()
                .map(|task_id| task_id.to_string())
                .collect::<Vec<_>>(),
            vec!["a#build", "b#build", "c#build"]
        );
    }

    #[tokio::test]
    async fn test_stop_execution_prevents_scheduling_dependents() {
        let engine = Arc::new(three_task_engine());
        let (visitor_tx, mut visitor_rx) = mpsc::channel(1);
        let execute =
            tokio::spawn(engine.execute(ExecutionOptions::new(false, 2), visitor_tx));

        let mut visited = Vec::new();
        while let Some(message) = visitor_rx.recv().await {
            visited.push(message.info.clone());
            // The first task reports a failure that should halt the walk.
            message.callback.send(Err(StopExecution)).unwrap();
        }
        execute.await.unwrap().unwrap();

        assert_eq!(
            visited
                .iter()
                .map(|task_id| task_id.to_string())
                .collect::<Vec<_>>(),
            vec!["a#build"]
        );
    }

    #[tokio::test]
    async fn test_parallel_does_not_wait_for_dependencies() {
        let engine = Arc::new(three_task_engine());
        let (visitor_tx, mut visitor_rx) = mpsc::channel(3);
        let execute =
            tokio::spawn(engine.execute(ExecutionOptions::new(true, 1), visitor_tx));

        // Collect every message before acking any of them: with parallel
        // scheduling all three tasks are dispatched without waiting on their
        // prerequisites' results.
        let mut messages = Vec::new();
        for _ in 0..3 {
            messages.push(visitor_rx.recv().await.expect("task dispatched"));
        }
        for message in messages {
            message.callback.send(Ok(())).unwrap();
        }
        assert!(visitor_rx.recv().await.is_none());
        execute.await.unwrap().unwrap();
    }
}
