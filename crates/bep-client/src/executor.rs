//! Thread executors owned by a connection or client.
//!
//! Every executor runs on plain OS threads. Shutdown never blocks for longer
//! than the given timeout; threads still busy afterwards are detached.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::ClientError;

/// Grace period used when a connection stops its executors.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool of worker threads fed by a shared queue.
///
/// A pool of one thread runs tasks strictly in submission order.
pub struct WorkerPool {
    name: String,
    sender: Mutex<Option<Sender<Task>>>,
    exited: Mutex<Receiver<()>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    thread_ids: Vec<ThreadId>,
}

impl WorkerPool {
    /// Spawns `size` workers named `{name}-{n}`.
    pub fn new(name: &str, size: usize) -> Result<Self, ClientError> {
        let (sender, receiver) = mpsc::channel::<Task>();
        let receiver = Arc::new(Mutex::new(receiver));
        let (exit_tx, exit_rx) = mpsc::channel();

        let mut workers = Vec::with_capacity(size.max(1));
        for n in 0..size.max(1) {
            let receiver = receiver.clone();
            let exit_tx = exit_tx.clone();
            let thread_name = format!("{name}-{n}");
            let handle = thread::Builder::new().name(thread_name.clone()).spawn(move || {
                loop {
                    let task = receiver.lock().recv();
                    let Ok(task) = task else {
                        break;
                    };
                    if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                        error!(thread = %thread_name, "task panicked");
                    }
                }
                let _ = exit_tx.send(());
            })?;
            workers.push(handle);
        }

        let thread_ids = workers.iter().map(|w| w.thread().id()).collect();
        Ok(Self {
            name: name.to_string(),
            sender: Mutex::new(Some(sender)),
            exited: Mutex::new(exit_rx),
            workers: Mutex::new(workers),
            thread_ids,
        })
    }

    /// Queues a task. Fails once the pool is shut down.
    pub fn execute<F>(&self, task: F) -> Result<(), ClientError>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.lock();
        let sender = sender.as_ref().ok_or(ClientError::Closed)?;
        sender.send(Box::new(task)).map_err(|_| ClientError::Closed)
    }

    /// Returns true if the calling thread is one of the workers.
    pub fn is_worker_thread(&self) -> bool {
        self.thread_ids.contains(&thread::current().id())
    }

    /// Stops accepting tasks and waits up to `timeout` for queued tasks to
    /// finish. Returns false if some worker was still busy.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        if self.sender.lock().take().is_none() {
            return true;
        }
        let workers = std::mem::take(&mut *self.workers.lock());
        let expected = workers.len() - usize::from(self.is_worker_thread());

        let deadline = Instant::now() + timeout;
        let exited = self.exited.lock();
        for _ in 0..expected {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match exited.recv_timeout(remaining) {
                Ok(()) => {}
                Err(RecvTimeoutError::Timeout) => {
                    warn!(pool = %self.name, "executor did not stop in time");
                    return false;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        let current = thread::current().id();
        for worker in workers {
            if worker.thread().id() != current {
                let _ = worker.join();
            }
        }
        debug!(pool = %self.name, "executor stopped");
        true
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.sender.lock().take();
    }
}

/// Runs a task on its own thread at a fixed interval until stopped.
pub struct Periodic {
    name: String,
    stopped: Arc<(Mutex<bool>, Condvar)>,
    exited: Mutex<Receiver<()>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Periodic {
    /// Starts running `task` every `interval`, first after one interval.
    pub fn start<F>(name: &str, interval: Duration, mut task: F) -> Result<Self, ClientError>
    where
        F: FnMut() + Send + 'static,
    {
        let stopped = Arc::new((Mutex::new(false), Condvar::new()));
        let (exit_tx, exit_rx) = mpsc::channel();
        let flag = stopped.clone();
        let worker = thread::Builder::new().name(name.to_string()).spawn(move || {
            let (lock, cvar) = &*flag;
            loop {
                let deadline = Instant::now() + interval;
                let mut stopped = lock.lock();
                while !*stopped && Instant::now() < deadline {
                    cvar.wait_until(&mut stopped, deadline);
                }
                if *stopped {
                    break;
                }
                drop(stopped);
                if panic::catch_unwind(AssertUnwindSafe(&mut task)).is_err() {
                    error!("periodic task panicked");
                }
            }
            let _ = exit_tx.send(());
        })?;

        Ok(Self {
            name: name.to_string(),
            stopped,
            exited: Mutex::new(exit_rx),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Stops the task and waits up to `timeout` for a running tick.
    pub fn stop(&self, timeout: Duration) -> bool {
        {
            let (lock, cvar) = &*self.stopped;
            let mut stopped = lock.lock();
            if *stopped {
                return true;
            }
            *stopped = true;
            cvar.notify_all();
        }
        let Some(worker) = self.worker.lock().take() else {
            return true;
        };
        if worker.thread().id() == thread::current().id() {
            return true;
        }
        match self.exited.lock().recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                let _ = worker.join();
                debug!(task = %self.name, "periodic task stopped");
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(task = %self.name, "periodic task did not stop in time");
                false
            }
        }
    }
}

impl Drop for Periodic {
    fn drop(&mut self) {
        let (lock, cvar) = &*self.stopped;
        *lock.lock() = true;
        cvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_single_worker_keeps_order() {
        let pool = WorkerPool::new("test-serial", 1).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..50 {
            let seen = seen.clone();
            pool.execute(move || seen.lock().push(i)).unwrap();
        }
        assert!(pool.shutdown(Duration::from_secs(5)));
        assert_eq!(*seen.lock(), (0..50).collect::<Vec<_>>());
        assert!(matches!(pool.execute(|| {}), Err(ClientError::Closed)));
    }

    #[test]
    fn test_panicking_task_keeps_pool_alive() {
        let pool = WorkerPool::new("test-panic", 1).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        pool.execute(|| panic!("boom")).unwrap();
        let c = count.clone();
        pool.execute(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert!(pool.shutdown(Duration::from_secs(5)));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shutdown_times_out_on_busy_worker() {
        let pool = WorkerPool::new("test-busy", 1).unwrap();
        pool.execute(|| thread::sleep(Duration::from_millis(500))).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(!pool.shutdown(Duration::from_millis(10)));
    }

    #[test]
    fn test_periodic_ticks_until_stopped() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let periodic = Periodic::start("test-tick", Duration::from_millis(10), move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        thread::sleep(Duration::from_millis(200));
        assert!(periodic.stop(Duration::from_secs(2)));
        let ticks = count.load(Ordering::SeqCst);
        assert!(ticks >= 2, "ticks = {ticks}");
        thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), ticks);
    }
}
