//! Single-worker queue for index batches.
//!
//! Batches are processed strictly in arrival order by one thread. While a
//! batch is pending, further batches are parked in the temp repository and
//! only their keys are queued, which bounds memory use on large indexes.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use bep_proto::bep::IndexUpdate;
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::handler::IndexHandler;
use crate::{IndexError, IndexPeer};

pub(crate) enum Job {
    /// Batch kept in memory
    Batch {
        update: IndexUpdate,
        peer: Arc<dyn IndexPeer>,
    },
    /// Batch parked in the temp repository
    Stored {
        key: String,
        records: usize,
        peer: Arc<dyn IndexPeer>,
    },
}

pub(crate) struct IndexQueue {
    sender: Mutex<Option<Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    queued_messages: Arc<AtomicUsize>,
    queued_records: Arc<AtomicU64>,
}

impl IndexQueue {
    pub(crate) fn start(handler: Weak<IndexHandler>) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let queued_messages = Arc::new(AtomicUsize::new(0));
        let queued_records = Arc::new(AtomicU64::new(0));

        let (messages, records) = (queued_messages.clone(), queued_records.clone());
        let worker = thread::Builder::new()
            .name("index-processor".into())
            .spawn(move || {
                for job in receiver {
                    let Some(handler) = handler.upgrade() else {
                        break;
                    };
                    let count = match &job {
                        Job::Batch { update, .. } => update.files.len(),
                        Job::Stored { records, .. } => *records,
                    };
                    handler.process_job(job);
                    records.fetch_sub(count as u64, Ordering::SeqCst);
                    messages.fetch_sub(1, Ordering::SeqCst);
                }
                debug!("index processor stopped");
            })
            .map_err(|e| error!(error = %e, "cannot spawn index processor"))
            .ok();

        Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(worker),
            queued_messages,
            queued_records,
        }
    }

    /// Number of batches submitted but not processed yet.
    pub(crate) fn pending(&self) -> usize {
        self.queued_messages.load(Ordering::SeqCst)
    }

    /// Number of records in pending batches.
    pub(crate) fn pending_records(&self) -> u64 {
        self.queued_records.load(Ordering::SeqCst)
    }

    pub(crate) fn submit(&self, job: Job) -> Result<(), IndexError> {
        let records = match &job {
            Job::Batch { update, .. } => update.files.len(),
            Job::Stored { records, .. } => *records,
        };
        let sender = self.sender.lock();
        let sender = sender.as_ref().ok_or(IndexError::Closed)?;
        self.queued_messages.fetch_add(1, Ordering::SeqCst);
        self.queued_records.fetch_add(records as u64, Ordering::SeqCst);
        sender.send(job).map_err(|_| {
            self.queued_messages.fetch_sub(1, Ordering::SeqCst);
            self.queued_records.fetch_sub(records as u64, Ordering::SeqCst);
            IndexError::Closed
        })
    }

    /// Stops accepting batches and waits for the queued ones.
    pub(crate) fn stop(&self) {
        if self.sender.lock().take().is_none() {
            return;
        }
        info!("stopping index record processor");
        if let Some(worker) = self.worker.lock().take() {
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}
