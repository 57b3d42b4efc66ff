//! The shared background worker pool.
//!
//! Batch execution (mutations, derivative queries) runs off the owning
//! context on a small process-wide pool of worker threads. Every update
//! manager shares the same pool.

use parking_lot::Mutex;
use std::sync::mpsc;
use std::sync::{Arc, OnceLock};
use std::thread;

use crate::context::Task;

/// Number of threads in the shared pool.
const POOL_SIZE: usize = 4;

/// A fixed pool of background worker threads.
pub struct WorkerPool {
    sender: mpsc::Sender<Task>,
}

impl WorkerPool {
    fn new(size: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<Task>();
        let receiver = Arc::new(Mutex::new(receiver));
        for index in 0..size {
            let receiver = receiver.clone();
            thread::Builder::new()
                .name(format!("ravel-worker-{}", index))
                .spawn(move || loop {
                    let task = {
                        let receiver = receiver.lock();
                        receiver.recv()
                    };
                    match task {
                        Ok(task) => task(),
                        Err(_) => break,
                    }
                })
                .expect("failed to spawn worker thread");
        }
        Self { sender }
    }

    /// The process-wide shared pool.
    pub fn shared() -> &'static WorkerPool {
        static SHARED: OnceLock<WorkerPool> = OnceLock::new();
        SHARED.get_or_init(|| WorkerPool::new(POOL_SIZE))
    }

    /// Submits a task for background execution.
    pub fn submit(&self, task: Task) {
        // The receivers live for the process lifetime.
        let _ = self.sender.send(task);
    }
}
