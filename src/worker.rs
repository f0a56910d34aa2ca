//! Bounded background worker for watchdog waits.
//!
//! A [`Worker`] owns exactly one thread draining a job queue, so everything
//! submitted through one worker runs serialized. Submission hands back a
//! [`TaskHandle`] that can be cached as a pending-operation marker and
//! awaited from another thread.

use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use tracing::trace;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Completion state shared between the worker thread and handle holders.
struct TaskState<T> {
    value: Option<T>,
    finished: bool,
}

struct TaskShared<T> {
    state: Mutex<TaskState<T>>,
    done: Condvar,
}

/// Handle to a job submitted to a [`Worker`].
///
/// Clones share the same completion slot. [`TaskHandle::wait`] returns the
/// job's result by clone, so several holders can observe the same outcome.
pub struct TaskHandle<T> {
    shared: Arc<TaskShared<T>>,
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        TaskHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone> TaskHandle<T> {
    fn new() -> Self {
        TaskHandle {
            shared: Arc::new(TaskShared {
                state: Mutex::new(TaskState {
                    value: None,
                    finished: false,
                }),
                done: Condvar::new(),
            }),
        }
    }

    fn complete(&self, value: Option<T>) {
        let mut state = self.shared.state.lock().unwrap();
        state.value = value;
        state.finished = true;
        self.shared.done.notify_all();
    }

    /// Whether the job has finished.
    pub fn is_finished(&self) -> bool {
        self.shared.state.lock().unwrap().finished
    }

    /// Block until the job finishes and return its result.
    ///
    /// Returns `None` only if the worker was torn down before the job ran.
    pub fn wait(&self) -> Option<T> {
        let mut state = self.shared.state.lock().unwrap();
        while !state.finished {
            state = self.shared.done.wait(state).unwrap();
        }
        state.value.clone()
    }
}

/// Single-thread job queue serializing watchdog waits.
pub struct Worker {
    sender: Option<Sender<Job>>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawn the worker thread.
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let handle = thread::spawn(move || {
            while let Ok(job) = receiver.recv() {
                job();
            }
            trace!("watchdog worker stopped");
        });
        Worker {
            sender: Some(sender),
            handle: Some(handle),
        }
    }

    /// Queue a job and return a handle to its completion.
    ///
    /// If the worker is already torn down the handle resolves immediately
    /// with `None`.
    pub fn submit<T, F>(&self, job: F) -> TaskHandle<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let handle = TaskHandle::new();
        let completion = handle.clone();
        let boxed: Job = Box::new(move || {
            let value = job();
            completion.complete(Some(value));
        });
        if let Some(sender) = &self.sender {
            if sender.send(boxed).is_err() {
                handle.complete(None);
            }
        } else {
            handle.complete(None);
        }
        handle
    }
}

impl Default for Worker {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        // Closing the channel ends the thread's recv loop.
        drop(self.sender.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_submit_and_wait() {
        let worker = Worker::new();
        let handle = worker.submit(|| 41 + 1);
        assert_eq!(handle.wait(), Some(42));
        assert!(handle.is_finished());
    }

    #[test]
    fn test_jobs_run_in_submission_order() {
        let worker = Worker::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = Arc::clone(&order);
        let a = worker.submit(move || {
            thread::sleep(Duration::from_millis(20));
            first.lock().unwrap().push(1);
        });
        let second = Arc::clone(&order);
        let b = worker.submit(move || second.lock().unwrap().push(2));

        a.wait();
        b.wait();
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_handle_clones_share_result() {
        let worker = Worker::new();
        let handle = worker.submit(|| "done".to_string());
        let other = handle.clone();
        assert_eq!(handle.wait(), Some("done".to_string()));
        assert_eq!(other.wait(), Some("done".to_string()));
    }
}
