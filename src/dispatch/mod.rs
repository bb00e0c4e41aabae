//! Host callback-execution context.
//!
//! Subscriber callbacks never run on the listener's worker. Every delivery is
//! posted as a job to a `DispatchContext`, which runs jobs one at a time.
//! `SerialExecutor` is a dedicated OS thread draining a job queue.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;
use std::thread::JoinHandle;

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Unit of work posted to a dispatch context.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Single-threaded execution context supplied by the host.
pub trait DispatchContext: Send + Sync {
    /// Queue `job` for execution. Must not block.
    fn post(&self, job: Job);
}

/// Runs posted jobs sequentially on one dedicated thread.
pub struct SerialExecutor {
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SerialExecutor {
    /// Spawn the executor thread.
    pub fn spawn(name: impl Into<String>) -> std::io::Result<Self> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        let name = name.into();

        let thread = std::thread::Builder::new().name(name.clone()).spawn(move || {
            debug!(executor = %name, "Dispatch executor started");
            while let Some(job) = receiver.blocking_recv() {
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    error!(executor = %name, "Subscriber callback panicked");
                }
            }
            debug!(executor = %name, "Dispatch executor stopped");
        })?;

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Stop accepting jobs and wait for queued jobs to finish.
    ///
    /// Must not be called from inside a job.
    pub fn close(&self) {
        self.sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        let thread = self.thread.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                error!("Dispatch executor thread panicked");
            }
        }
    }
}

impl DispatchContext for SerialExecutor {
    fn post(&self, job: Job) {
        let sender = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        match sender.as_ref() {
            Some(tx) => {
                if tx.send(job).is_err() {
                    warn!("Dispatch executor gone, dropping callback");
                }
            }
            None => warn!("Dispatch executor closed, dropping callback"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};

    #[test]
    fn test_runs_jobs_in_order_on_one_thread() {
        let executor = SerialExecutor::spawn("test-dispatch").unwrap();
        let seen = Arc::new(StdMutex::new(Vec::new()));

        for i in 0..50 {
            let seen = seen.clone();
            executor.post(Box::new(move || {
                let name = std::thread::current().name().map(str::to_string);
                seen.lock().unwrap().push((i, name));
            }));
        }
        executor.close();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 50);
        for (idx, (i, name)) in seen.iter().enumerate() {
            assert_eq!(*i, idx);
            assert_eq!(name.as_deref(), Some("test-dispatch"));
        }
    }

    #[test]
    fn test_survives_panicking_job() {
        let executor = SerialExecutor::spawn("panicky").unwrap();
        let ran = Arc::new(StdMutex::new(false));

        executor.post(Box::new(|| panic!("subscriber bug")));
        let flag = ran.clone();
        executor.post(Box::new(move || *flag.lock().unwrap() = true));
        executor.close();

        assert!(*ran.lock().unwrap());
    }

    #[test]
    fn test_post_after_close_is_dropped() {
        let executor = SerialExecutor::spawn("closed").unwrap();
        executor.close();
        executor.post(Box::new(|| panic!("must not run")));
        executor.close();
    }
}
