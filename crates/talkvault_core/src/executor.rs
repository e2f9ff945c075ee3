//! Background task executors.

use crate::error::CoreResult;
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

/// A unit of background work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs tasks off the calling thread.
pub trait Executor: Send + Sync {
    /// Submits a task. Tasks submitted after [`shutdown`](Self::shutdown)
    /// are dropped without running.
    fn execute(&self, task: Task);

    /// Stops accepting tasks. Queued tasks that have not started are
    /// discarded; a running task finishes.
    fn shutdown(&self);
}

/// Executes tasks one at a time, in submission order, on a dedicated thread.
///
/// A panicking task is logged and does not stop the worker.
pub struct SerialExecutor {
    name: String,
    sender: Mutex<Option<Sender<Task>>>,
    shut_down: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SerialExecutor {
    /// Spawns the worker thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn new(name: &str) -> CoreResult<Self> {
        let (sender, receiver) = mpsc::channel::<Task>();
        let shut_down = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shut_down);
        let thread_name = name.to_string();

        let worker = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                for task in receiver {
                    if flag.load(Ordering::SeqCst) {
                        continue;
                    }
                    if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                        error!(executor = %thread_name, "task panicked");
                    }
                }
                debug!(executor = %thread_name, "worker exited");
            })?;

        Ok(Self {
            name: name.to_string(),
            sender: Mutex::new(Some(sender)),
            shut_down,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Returns the executor's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true once [`Executor::shutdown`] has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Waits for the worker thread to exit.
    ///
    /// Only returns after `shutdown` has been called. Must not be called from
    /// a task running on this executor.
    pub fn join(&self) {
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!(executor = %self.name, "worker thread panicked");
            }
        }
    }
}

impl Executor for SerialExecutor {
    fn execute(&self, task: Task) {
        if self.is_shut_down() {
            debug!(executor = %self.name, "discarding task submitted after shutdown");
            return;
        }
        if let Some(sender) = self.sender.lock().as_ref() {
            // The worker only stops after shutdown, so a failed send means
            // the task is discarded anyway.
            let _ = sender.send(task);
        }
    }

    fn shutdown(&self) {
        if !self.shut_down.swap(true, Ordering::SeqCst) {
            debug!(executor = %self.name, "shutting down");
        }
        self.sender.lock().take();
    }
}

impl std::fmt::Debug for SerialExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialExecutor")
            .field("name", &self.name)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn runs_tasks_in_order() {
        let executor = SerialExecutor::new("test-serial").unwrap();
        let (tx, rx) = mpsc::channel();
        for i in 0..10 {
            let tx = tx.clone();
            executor.execute(Box::new(move || tx.send(i).unwrap()));
        }
        let received: Vec<i32> = (0..10)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(received, (0..10).collect::<Vec<_>>());
        executor.shutdown();
        executor.join();
    }

    #[test]
    fn discards_after_shutdown() {
        let executor = SerialExecutor::new("test-discard").unwrap();
        executor.shutdown();
        executor.join();

        let (tx, rx) = mpsc::channel::<()>();
        executor.execute(Box::new(move || tx.send(()).unwrap()));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert!(executor.is_shut_down());
    }

    #[test]
    fn survives_panicking_task() {
        let executor = SerialExecutor::new("test-panic").unwrap();
        executor.execute(Box::new(|| panic!("boom")));
        let (tx, rx) = mpsc::channel();
        executor.execute(Box::new(move || tx.send(42).unwrap()));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
        executor.shutdown();
    }
}
