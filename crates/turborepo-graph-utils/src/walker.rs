use std::{collections::HashMap, hash::Hash};

use futures::{future::join_all, stream::FuturesUnordered, StreamExt};
use petgraph::{
    visit::{IntoNeighborsDirected, IntoNodeIdentifiers},
    Direction,
};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::trace;

/// Emitted for each node once every dependency has finished: the node id and
/// a callback the consumer fires to mark the node as done.
pub type WalkMessage<N> = (N, oneshot::Sender<()>);

pub struct Start;
pub struct Walking;

/// Walks a DAG, emitting a node only after all of the nodes it has edges
/// towards have been marked done. Each node gets a single-shot broadcast
/// channel; a node's task waits on the channels of its dependencies before
/// emitting itself. The graph must not be mutated once a walker exists for
/// it.
pub struct Walker<N, S> {
    marker: std::marker::PhantomData<S>,
    cancel: watch::Sender<bool>,
    node_events: Option<mpsc::Receiver<WalkMessage<N>>>,
    join_handles: FuturesUnordered<JoinHandle<()>>,
}

// All petgraph node ids are Copy + Eq integers, so requiring Hash + Send on
// top of that doesn't narrow the graphs we accept in practice.
impl<N: Eq + Hash + Copy + Send + 'static> Walker<N, Start> {
    pub fn new<G: IntoNodeIdentifiers<NodeId = N> + IntoNeighborsDirected>(graph: G) -> Self {
        let (cancel, cancel_rx) = watch::channel(false);

        // A node finishes at most once, so capacity 1 suffices.
        let mut finished_txs = HashMap::new();
        let mut finished_rxs = HashMap::new();
        for node in graph.node_identifiers() {
            let (tx, rx) = broadcast::channel::<()>(1);
            finished_txs.insert(node, tx);
            finished_rxs.insert(node, rx);
        }

        // At most one message per node is emitted, so emission never blocks.
        // The channel constructor panics on capacity 0, hence the max.
        let (node_tx, node_rx) = mpsc::channel(std::cmp::max(finished_txs.len(), 1));

        let join_handles = FuturesUnordered::new();
        for node in graph.node_identifiers() {
            let finished_tx = finished_txs
                .remove(&node)
                .expect("every node got a finished channel");
            let mut dependency_rxs = graph
                .neighbors_directed(node, Direction::Outgoing)
                .map(|dep| {
                    finished_rxs
                        .get(&dep)
                        .expect("every node got a finished channel")
                        .resubscribe()
                })
                .collect::<Vec<_>>();
            let node_tx = node_tx.clone();
            let mut cancel_rx = cancel_rx.clone();

            join_handles.push(tokio::spawn(async move {
                let dependencies_done = join_all(dependency_rxs.iter_mut().map(|rx| rx.recv()));

                tokio::select! {
                    // When cancel and the dependencies resolve together,
                    // prefer the cancel so no extra node gets emitted.
                    biased;
                    _ = cancel_rx.changed() => {
                        // Either cancel was set to true or the sender was
                        // dropped; both mean this walk is over.
                    }
                    results = dependencies_done => {
                        for result in results {
                            match result {
                                Ok(()) => (),
                                // A dependency task exited without sending a
                                // finish. That only happens when a cancel is
                                // racing the walk, so treat it as one.
                                Err(broadcast::error::RecvError::Closed) => return,
                                Err(broadcast::error::RecvError::Lagged(n)) => {
                                    debug_assert!(false, "node finished {n} extra times");
                                    trace!("node finished {n} extra times");
                                }
                            }
                        }

                        let (done_tx, done_rx) = oneshot::channel::<()>();
                        if node_tx.send((node, done_tx)).await.is_err() {
                            // The consumer dropped the receiver mid-walk.
                            // Nothing can mark this node done, so behave as
                            // if canceled.
                            trace!("receiver dropped before walk finished without calling cancel");
                            return;
                        }
                        if done_rx.await.is_err() {
                            // Consumer dropped the callback without firing
                            // it; assume the node is finished.
                            trace!("done callback dropped without sending a finish signal");
                        }
                        // A send error just means this node has no dependents
                        // listening.
                        finished_tx.send(()).ok();
                    }
                }
            }));
        }

        debug_assert!(finished_txs.is_empty(), "all senders moved into node tasks");

        Self {
            marker: std::marker::PhantomData,
            cancel,
            node_events: Some(node_rx),
            join_handles,
        }
    }

    /// Starts the walk, returning the channel that yields nodes as they
    /// become ready. The caller must fire each node's callback to unblock its
    /// dependents.
    pub fn walk(self) -> (Walker<N, Walking>, mpsc::Receiver<WalkMessage<N>>) {
        let Self {
            cancel,
            mut node_events,
            join_handles,
            ..
        } = self;
        let node_events = node_events
            .take()
            .expect("walking graph with walker that has already been used");
        (
            Walker {
                marker: std::marker::PhantomData,
                cancel,
                node_events: None,
                join_handles,
            },
            node_events,
        )
    }
}

impl<N> Walker<N, Walking> {
    /// Cancels the walk. Nodes already queued for emission will still be
    /// sent, but no new nodes become ready.
    pub fn cancel(&mut self) -> Result<(), watch::error::SendError<bool>> {
        self.cancel.send(true)
    }

    /// Consumes the walker, waiting for all node tasks to wind down. Mostly
    /// useful after a cancel.
    pub async fn wait(self) -> Result<(), tokio::task::JoinError> {
        let Self {
            mut join_handles, ..
        } = self;
        while let Some(result) = join_handles.next().await {
            result?;
        }
        Ok(())
    }
}
