//! Dispatch contexts: where observer callbacks run.
//!
//! An update manager is pinned to one `DispatchContext`, the execution
//! context that owns its observers. Callbacks and drain ticks are posted to
//! the context and run there serially, so observer code never races with
//! the manager's own scheduling.

use parking_lot::Mutex;
use std::sync::mpsc;
use std::thread::{self, JoinHandle, ThreadId};

/// A task posted to a context.
pub type Task = Box<dyn FnOnce() + Send>;

/// An execution context that runs posted tasks serially.
pub trait DispatchContext: Send + Sync {
    /// Enqueues a task; tasks run in post order.
    fn post(&self, task: Task);
}

/// A context that runs tasks inline on the calling thread.
///
/// Useful for tests and fully synchronous embedding.
#[derive(Default)]
pub struct ImmediateContext;

impl DispatchContext for ImmediateContext {
    fn post(&self, task: Task) {
        task();
    }
}

/// A dedicated-thread event loop context.
///
/// Tasks post to a channel and run on one long-lived thread, in order.
/// Shutting down stops accepting tasks, drains the queue and joins the
/// thread.
pub struct EventLoop {
    sender: Mutex<Option<mpsc::Sender<Task>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl EventLoop {
    /// Spawns the loop thread.
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel::<Task>();
        let handle = thread::Builder::new()
            .name("ravel-event-loop".into())
            .spawn(move || {
                while let Ok(task) = receiver.recv() {
                    task();
                }
            })
            .expect("failed to spawn event loop thread");
        let thread_id = handle.thread().id();
        Self {
            sender: Mutex::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
            thread_id,
        }
    }

    /// Stops accepting tasks, runs what was already queued and joins the
    /// thread. Calling from inside the loop only closes the queue.
    pub fn shutdown(&self) {
        *self.sender.lock() = None;
        if thread::current().id() == self.thread_id {
            return;
        }
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchContext for EventLoop {
    fn post(&self, task: Task) {
        // Posts after shutdown are dropped.
        if let Some(sender) = self.sender.lock().as_ref() {
            let _ = sender.send(task);
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}
