//! Task plumbing for the websocketd daemon.
//!
//! Every session runs a handful of background tasks (socket reader, stdout
//! and stderr readers, the child reaper). Spawning them with
//! [`spawn_in_span`] keeps the session's tracing span (id, remote, command,
//! pid) attached, so their log lines stay attributable long after the
//! request handler returned. [`Shutdown`] broadcasts the stop order to the
//! daemon's long-running tasks and observes them winding down.

use std::future::Future;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument as _, Span};

/// Spawn `future` on the runtime with the caller's current tracing span
/// attached. `tokio::spawn` severs span parentage; for per-session tasks
/// that would strip the session context from every log line they emit.
pub fn spawn_in_span<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::task::spawn(future.instrument(Span::current()))
}

/// A task tied to the lifetime of its handle: dropping the handle aborts
/// the task. Session readers are held this way so none of them can outlive
/// the session that spawned them.
#[must_use]
pub struct ChildTask<T>(JoinHandle<T>);

impl<T> ChildTask<T> {
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        ChildTask(spawn_in_span(future))
    }

    pub async fn join(mut self) -> Result<T, tokio::task::JoinError> {
        (&mut self.0).await
    }

    pub fn abort(&self) {
        self.0.abort();
    }

    /// Hand the task over to the runtime instead of aborting it on drop.
    pub fn detach(self) {
        core::mem::forget(self);
    }
}

impl<T> Drop for ChildTask<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Orders the daemon's long-running tasks (listeners, redirector) to stop.
///
/// Signals are handed out on demand with [`Shutdown::subscribe`]; a signal
/// subscribed after [`Shutdown::signal`] still observes the stop order.
pub struct Shutdown {
    sender: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self { sender }
    }

    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal(self.sender.subscribe())
    }

    pub fn signal(&self) {
        let _ = self.sender.send(true);
    }

    /// Resolves once every subscribed signal has been dropped.
    pub async fn all_closed(&self) {
        self.sender.closed().await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug)]
pub struct ShutdownSignal(watch::Receiver<bool>);

impl ShutdownSignal {
    /// Wait for the stop order. Returns immediately when it was already
    /// given, even before this signal was subscribed.
    pub async fn wait(&mut self) {
        let _ = self.0.wait_for(|stop| *stop).await;
    }

    pub fn is_signaled(&self) -> bool {
        *self.0.borrow()
    }
}

/// A long-running unit of work owned by the service.
#[async_trait]
pub trait Task {
    type Output: Send;

    const NAME: &'static str;

    async fn run(self, shutdown_signal: ShutdownSignal) -> Self::Output;
}

pub fn spawn_task<T>(task: T, shutdown_signal: ShutdownSignal) -> ChildTask<T::Output>
where
    T: Task + 'static,
    T::Output: 'static,
{
    ChildTask::spawn(task.run(shutdown_signal))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_order_reaches_every_subscriber() {
        let shutdown = Shutdown::new();
        let mut early = shutdown.subscribe();

        let waiter = tokio::spawn(async move { early.wait().await });

        shutdown.signal();
        waiter.await.expect("waiter task");

        // A signal subscribed after the fact still sees the order.
        let mut late = shutdown.subscribe();
        assert!(late.is_signaled());
        late.wait().await;
    }

    #[tokio::test]
    async fn all_closed_resolves_once_signals_are_dropped() {
        let shutdown = Shutdown::new();
        let signal = shutdown.subscribe();
        drop(signal);
        shutdown.all_closed().await;
    }

    #[tokio::test]
    async fn child_task_aborts_on_drop() {
        let task = ChildTask::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        });
        task.abort();
        assert!(task.join().await.is_err());
    }

    #[tokio::test]
    async fn spawned_future_completes_with_its_value() {
        let handle = spawn_in_span(async { 40 + 2 });
        assert_eq!(handle.await.expect("task result"), 42);
    }
}
