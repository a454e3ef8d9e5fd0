//! Directory browser over the index of one folder.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use bep_core::path::{self, is_parent, is_root, parent_path};
use bep_core::FileInfo;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::events::ListenerId;
use crate::handler::IndexHandler;
use crate::IndexError;

/// Ordering of listed entries. The `..` entry always comes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BrowserOrdering {
    /// Directories first, then case-insensitive name
    #[default]
    AlphaDirsFirst,
    /// Most recently modified first, then case-insensitive name
    LastModifiedDesc,
}

impl BrowserOrdering {
    fn compare(&self, a: &FileInfo, b: &FileInfo) -> Ordering {
        let parent_first = is_parent(&b.path).cmp(&is_parent(&a.path));
        let by_name = || a.file_name().to_lowercase().cmp(&b.file_name().to_lowercase());
        match self {
            BrowserOrdering::AlphaDirsFirst => parent_first
                .then_with(|| b.is_directory().cmp(&a.is_directory()))
                .then_with(by_name),
            BrowserOrdering::LastModifiedDesc => parent_first
                .then_with(|| b.last_modified.cmp(&a.last_modified))
                .then_with(by_name),
        }
    }
}

/// Listing options.
#[derive(Debug, Clone, Copy, Default)]
pub struct BrowserOptions {
    /// Prepend a `..` entry to listings
    pub include_parent: bool,
    /// Also prepend `..` when listing the root
    pub allow_parent_in_root: bool,
    /// Entry ordering
    pub ordering: BrowserOrdering,
}

type ChangeCallback = Box<dyn Fn() + Send + Sync>;

/// Navigable view of a folder's directory tree.
///
/// The change callback fires whenever a record of this folder is stored.
/// Closing (or dropping) the browser unregisters it from the engine.
pub struct IndexBrowser {
    handler: Arc<IndexHandler>,
    folder: String,
    options: BrowserOptions,
    current_path: RwLock<String>,
    on_change: Arc<Mutex<Option<ChangeCallback>>>,
    listener: ListenerId,
    closed: AtomicBool,
}

impl IndexBrowser {
    pub(crate) fn open(handler: Arc<IndexHandler>, folder: &str, options: BrowserOptions) -> Result<Self, IndexError> {
        if folder.is_empty() {
            return Err(IndexError::NotFound("empty folder id".into()));
        }
        let on_change: Arc<Mutex<Option<ChangeCallback>>> = Arc::new(Mutex::new(None));
        let (watched, callback) = (folder.to_string(), on_change.clone());
        let listener = handler.on_index_change(move |event| {
            if event.folder == watched {
                if let Some(callback) = callback.lock().as_ref() {
                    callback();
                }
            }
        });

        Ok(Self {
            handler,
            folder: folder.to_string(),
            options,
            current_path: RwLock::new(path::ROOT_PATH.to_string()),
            on_change,
            listener,
            closed: AtomicBool::new(false),
        })
    }

    /// Browsed folder.
    pub fn folder(&self) -> &str {
        &self.folder
    }

    /// Sets the callback fired when the folder's index changes.
    pub fn set_on_folder_changed_listener(&self, callback: Option<ChangeCallback>) {
        *self.on_change.lock() = callback;
    }

    /// Current directory path.
    pub fn current_path(&self) -> String {
        self.current_path.read().clone()
    }

    /// Name of the current directory.
    pub fn current_path_file_name(&self) -> String {
        path::file_name(&self.current_path()).to_string()
    }

    /// Record of the current directory.
    pub fn current_path_info(&self) -> Result<FileInfo, IndexError> {
        self.get_file_info_by_absolute_path(&self.current_path())
    }

    /// Returns true at the folder root.
    pub fn is_root(&self) -> bool {
        is_root(&self.current_path.read())
    }

    /// Lists the live children of `path`, sorted by the browser's ordering.
    pub fn list_files(&self, path: &str) -> Result<Vec<FileInfo>, IndexError> {
        let mut list = self
            .handler
            .repository()
            .find_not_deleted_files_by_folder_and_parent(&self.folder, path)?;
        debug!(folder = %self.folder, path = %path, records = list.len(), "listed files");
        if self.options.include_parent && (!is_root(path) || self.options.allow_parent_in_root) {
            list.push(FileInfo::parent_entry(self.folder.as_str()));
        }
        list.sort_by(|a, b| self.options.ordering.compare(a, b));
        Ok(list)
    }

    /// Lists the current directory.
    pub fn list_current(&self) -> Result<Vec<FileInfo>, IndexError> {
        self.list_files(&self.current_path())
    }

    /// Looks up a live record by path; the root resolves to a synthetic entry.
    pub fn get_file_info_by_absolute_path(&self, path: &str) -> Result<FileInfo, IndexError> {
        if is_root(path) {
            return Ok(FileInfo::root(self.folder.as_str()));
        }
        self.handler
            .repository()
            .find_not_deleted_file_info(&self.folder, path)?
            .ok_or_else(|| IndexError::NotFound(format!("{}:{}", self.folder, path)))
    }

    /// Enters a directory listed by this browser; `..` goes up one level.
    pub fn navigate_to(&self, entry: &FileInfo) -> Result<(), IndexError> {
        if !entry.is_directory() || entry.folder != self.folder {
            return Err(IndexError::InvalidRecord(format!(
                "cannot navigate to {}:{}",
                entry.folder, entry.path
            )));
        }
        if is_parent(&entry.path) {
            let parent = parent_path(&self.current_path());
            self.navigate_to_absolute_path(&parent)
        } else {
            self.navigate_to_absolute_path(&entry.path)
        }
    }

    /// Navigates to `path`, or to its closest existing ancestor directory.
    pub fn navigate_to_nearest_path(&self, path: &str) -> Result<(), IndexError> {
        let mut candidate = path.trim().to_string();
        while !is_root(&candidate) {
            match self.get_file_info_by_absolute_path(&candidate) {
                Ok(info) if info.is_directory() => break,
                _ => candidate = parent_path(&candidate),
            }
        }
        self.navigate_to_absolute_path(&candidate)
    }

    fn navigate_to_absolute_path(&self, path: &str) -> Result<(), IndexError> {
        let new_path = if is_root(path) {
            path::ROOT_PATH.to_string()
        } else {
            let info = self.get_file_info_by_absolute_path(path)?;
            if !info.is_directory() {
                return Err(IndexError::InvalidRecord(format!("{path} is not a directory")));
            }
            info.path
        };
        info!(folder = %self.folder, path = %new_path, "navigate to path");
        *self.current_path.write() = new_path;
        Ok(())
    }

    /// Unregisters the browser. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, AtomicOrdering::SeqCst) {
            self.handler.unregister_listener(self.listener);
        }
    }
}

impl Drop for IndexBrowser {
    fn drop(&mut self) {
        self.close();
    }
}
