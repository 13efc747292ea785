//! Host-provided task pool for short background jobs
//!
//! Retries (resolve, probe, start commands) do blocking network I/O and
//! must never run on the host thread that calls `tick`.

use crossbeam_channel::{unbounded, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::error::NetworkError;

/// A unit of background work
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs tasks off the caller's thread
pub trait TaskPool: Send + Sync {
    fn spawn(&self, task: Task);
}

/// Shared handle to a task pool
pub type SharedTaskPool = Arc<dyn TaskPool>;

/// Single worker thread fed through a channel
pub struct ThreadTaskPool {
    sender: Option<Sender<Task>>,
    thread_handle: Option<JoinHandle<()>>,
}

impl ThreadTaskPool {
    pub fn new(name: &str) -> Result<Self, NetworkError> {
        let (sender, receiver) = unbounded::<Task>();

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Ok(task) = receiver.recv() {
                    task();
                }
            })
            .map_err(|e| NetworkError::Spawn(e.to_string()))?;

        Ok(Self {
            sender: Some(sender),
            thread_handle: Some(handle),
        })
    }
}

impl TaskPool for ThreadTaskPool {
    fn spawn(&self, task: Task) {
        if let Some(sender) = &self.sender {
            if sender.send(task).is_err() {
                tracing::error!("Task pool worker has exited, dropping task");
            }
        }
    }
}

impl Drop for ThreadTaskPool {
    fn drop(&mut self) {
        // Closing the channel ends the worker after queued tasks
        self.sender.take();
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                tracing::error!("Task pool worker panicked");
            }
        }
    }
}

/// Runs tasks on tokio's blocking pool
pub struct TokioTaskPool {
    handle: tokio::runtime::Handle,
}

impl TokioTaskPool {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Pool bound to the runtime of the calling context
    ///
    /// Panics outside a tokio runtime, like `Handle::current`.
    pub fn current() -> Self {
        Self::new(tokio::runtime::Handle::current())
    }
}

impl TaskPool for TokioTaskPool {
    fn spawn(&self, task: Task) {
        drop(self.handle.spawn_blocking(task));
    }
}
