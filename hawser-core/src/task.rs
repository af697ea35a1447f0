//! Task spawning abstraction for single-threaded runtimes.

use std::future::Future;

use async_trait::async_trait;

/// Provider for spawning tasks on the current thread.
///
/// The registry runs everything on one thread so that its state can live in
/// plain `Rc<RefCell<..>>` cells. Task creation goes through this trait to
/// keep names attached to tasks and to leave room for a scheduling shim in
/// tests.
#[async_trait(?Send)]
pub trait TaskProvider: Clone {
    /// Spawn a named task on the current thread.
    ///
    /// Must be called from within a `tokio::task::LocalSet`.
    fn spawn_task<F>(&self, name: &str, future: F) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = ()> + 'static;

    /// Yield control to other tasks on this thread.
    async fn yield_now(&self);
}

/// Tokio-backed task provider using `spawn_local`.
#[derive(Clone, Debug, Default)]
pub struct TokioTask;

#[async_trait(?Send)]
impl TaskProvider for TokioTask {
    fn spawn_task<F>(&self, name: &str, future: F) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = ()> + 'static,
    {
        let task_name = name.to_string();
        tokio::task::spawn_local(async move {
            tracing::trace!(task = %task_name, "task starting");
            future.await;
            tracing::trace!(task = %task_name, "task completed");
        })
    }

    async fn yield_now(&self) {
        tokio::task::yield_now().await;
    }
}
