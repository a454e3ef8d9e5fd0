//! Index events and the listener registry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bep_core::{FileInfo, FolderInfo, FolderStats, IndexInfo};
use parking_lot::Mutex;

/// Opaque handle returned by listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// New records were merged from a peer batch.
#[derive(Debug, Clone)]
pub struct IndexRecordsAcquired {
    /// Folder the batch belongs to
    pub folder: FolderInfo,
    /// Records that replaced older local ones
    pub records: Vec<FileInfo>,
    /// Peer progress after the batch
    pub index_info: IndexInfo,
}

/// A peer's index is complete for every folder it shares with us.
#[derive(Debug, Clone)]
pub struct FullIndexAcquired {
    /// Folder of the batch that completed the index
    pub folder: FolderInfo,
}

/// A record was stored.
#[derive(Debug, Clone)]
pub struct IndexChange {
    /// Folder id
    pub folder: String,
    /// Stored record
    pub record: FileInfo,
    /// Folder stats after the write
    pub stats: FolderStats,
}

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Set of callbacks for one event type.
///
/// Callbacks run outside the registry lock, so a callback may register or
/// unregister listeners.
pub struct Listeners<E> {
    entries: Mutex<Vec<(ListenerId, Callback<E>)>>,
}

impl<E> Listeners<E> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Adds a callback.
    pub fn register<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = ListenerId::next();
        self.entries.lock().push((id, Arc::new(callback)));
        id
    }

    /// Removes a callback. Returns false if `id` is not registered here.
    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(entry, _)| *entry != id);
        entries.len() != before
    }

    /// Calls every registered callback.
    pub fn emit(&self, event: &E) {
        let callbacks: Vec<Callback<E>> = self.entries.lock().iter().map(|(_, cb)| cb.clone()).collect();
        for callback in callbacks {
            callback(event);
        }
    }

    /// Number of registered callbacks.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_register_emit_unregister() {
        let listeners: Listeners<u32> = Listeners::new();
        let total = Arc::new(AtomicUsize::new(0));

        let t = total.clone();
        let a = listeners.register(move |n| {
            t.fetch_add(*n as usize, Ordering::SeqCst);
        });
        let t = total.clone();
        let b = listeners.register(move |n| {
            t.fetch_add(*n as usize * 10, Ordering::SeqCst);
        });
        assert_ne!(a, b);
        assert_eq!(listeners.len(), 2);

        listeners.emit(&2);
        assert_eq!(total.load(Ordering::SeqCst), 22);

        assert!(listeners.unregister(a));
        assert!(!listeners.unregister(a));
        listeners.emit(&1);
        assert_eq!(total.load(Ordering::SeqCst), 32);

        assert!(listeners.unregister(b));
        assert!(listeners.is_empty());
    }

    #[test]
    fn test_callback_can_unregister_itself() {
        let listeners: Arc<Listeners<()>> = Arc::new(Listeners::new());
        let id = Arc::new(Mutex::new(None));
        let (l, i) = (listeners.clone(), id.clone());
        *id.lock() = Some(listeners.register(move |_| {
            if let Some(id) = *i.lock() {
                l.unregister(id);
            }
        }));
        listeners.emit(&());
        assert!(listeners.is_empty());
    }
}
