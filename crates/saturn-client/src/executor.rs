//! Executors for completion callbacks.
//!
//! Callbacks are user code: they must never run on the thread that reads a
//! connection, and may block. Two interchangeable strategies sit behind
//! [`CallbackExecutor`].

use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use saturn_common::{Result, SaturnError};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub trait CallbackExecutor: Send + Sync {
    fn execute(&self, task: Task);
}

/// Runs callbacks on the tokio blocking pool.
pub struct TokioExecutor {
    handle: Handle,
}

impl TokioExecutor {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Executor for the runtime the caller is running in.
    pub fn current() -> Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| SaturnError::Config(format!("no tokio runtime: {}", e)))
    }
}

impl CallbackExecutor for TokioExecutor {
    fn execute(&self, task: Task) {
        self.handle.spawn_blocking(task);
    }
}

/// Fixed pool of worker threads fed by a bounded queue.
///
/// When the queue is full the task runs on the submitting thread.
pub struct WorkerPoolExecutor {
    sender: Mutex<Option<SyncSender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPoolExecutor {
    pub fn new(workers: usize, queue_capacity: usize) -> Result<Self> {
        if workers == 0 {
            return Err(SaturnError::Config("worker pool needs at least one thread".to_string()));
        }

        let (sender, receiver) = mpsc::sync_channel::<Task>(queue_capacity);
        let receiver = Arc::new(Mutex::new(receiver));

        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let receiver = receiver.clone();
            let handle = std::thread::Builder::new()
                .name(format!("saturn-callback-{}", i))
                .spawn(move || loop {
                    let task = receiver.lock().recv();
                    match task {
                        Ok(task) => task(),
                        Err(_) => break,
                    }
                })?;
            handles.push(handle);
        }

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(handles),
        })
    }

    /// Stop accepting tasks and wait for queued ones to finish.
    pub fn shutdown(&self) {
        self.sender.lock().take();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if worker.join().is_err() {
                warn!("callback worker panicked");
            }
        }
    }
}

impl CallbackExecutor for WorkerPoolExecutor {
    fn execute(&self, task: Task) {
        let sender = self.sender.lock().clone();
        let rejected = match sender {
            Some(sender) => match sender.try_send(task) {
                Ok(()) => None,
                Err(TrySendError::Full(task)) => {
                    debug!("callback queue full, running on caller");
                    Some(task)
                }
                Err(TrySendError::Disconnected(task)) => Some(task),
            },
            None => Some(task),
        };
        if let Some(task) = rejected {
            task();
        }
    }
}

impl Drop for WorkerPoolExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
