//! Bridges an external cancellation source (usually ctrl-c, wired up by the
//! embedding binary) to the run: subscribers get woken once, do their
//! teardown, and drop their guard to let the process exit.

use std::{
    future::Future,
    sync::{Arc, Mutex},
};

use futures::{stream::FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, oneshot};

/// Alerts subscribers when the given future completes or `close` is called.
#[derive(Debug, Clone)]
pub struct SignalHandler {
    state: Arc<Mutex<HandlerState>>,
    close: mpsc::Sender<()>,
}

#[derive(Debug, Default)]
struct HandlerState {
    subscribers: Vec<oneshot::Sender<oneshot::Sender<()>>>,
    is_closing: bool,
}

pub struct SignalSubscriber(oneshot::Receiver<oneshot::Sender<()>>);

/// Held by a subscriber while it processes the signal; the handler's
/// shutdown completes once every guard is dropped.
pub struct SubscriberGuard(#[allow(dead_code)] oneshot::Sender<()>);

impl SignalHandler {
    pub fn new(signal_source: impl Future<Output = Option<()>> + Send + 'static) -> Self {
        let state = Arc::new(Mutex::new(HandlerState::default()));
        let worker_state = state.clone();
        let (close, mut close_rx) = mpsc::channel::<()>(1);
        tokio::spawn(async move {
            tokio::select! {
                // Getting a signal and being unable to receive signals both
                // start the shutdown.
                _ = signal_source => {},
                // A close message and all handles being dropped both start
                // the shutdown.
                _ = close_rx.recv() => {}
            }

            let mut callbacks = {
                let mut state = worker_state.lock().expect("signal handler mutex poisoned");
                // No new subscribers once we start closing.
                state.is_closing = true;
                state
                    .subscribers
                    .drain(..)
                    .filter_map(|callback| {
                        let (tx, rx) = oneshot::channel();
                        // A subscriber that's already gone has no cleanup to
                        // wait for.
                        callback.send(tx).ok()?;
                        Some(rx)
                    })
                    .collect::<FuturesUnordered<_>>()
            };

            // Wait for subscribers to finish their cleanup work; dropped
            // guards count as finished.
            while callbacks.next().await.is_some() {}
        });

        Self { state, close }
    }

    /// Returns `None` when the handler is already shutting down.
    pub fn subscribe(&self) -> Option<SignalSubscriber> {
        self.state
            .lock()
            .expect("signal handler mutex poisoned")
            .add_subscriber()
            .map(SignalSubscriber)
    }

    /// Starts the shutdown and waits for subscribers to finish.
    pub async fn close(&self) {
        if self.close.send(()).await.is_err() {
            // Worker already exited.
            return;
        }
        self.done().await;
    }

    /// Waits until the handler has shut down and subscribers finished.
    pub async fn done(&self) {
        // The receiver is dropped once the worker task completes.
        self.close.closed().await;
    }
}

impl SignalSubscriber {
    /// Resolves once the signal fires.
    pub async fn listen(self) -> SubscriberGuard {
        let callback = self
            .0
            .await
            .expect("signal handler worker exited without alerting subscribers");
        SubscriberGuard(callback)
    }
}

impl HandlerState {
    fn add_subscriber(&mut self) -> Option<oneshot::Receiver<oneshot::Sender<()>>> {
        (!self.is_closing).then(|| {
            let (tx, rx) = oneshot::channel();
            self.subscribers.push(tx);
            rx
        })
    }
}
