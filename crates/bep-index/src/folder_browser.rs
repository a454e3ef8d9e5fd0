//! Known folders with their statistics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bep_core::{FolderInfo, FolderStats};
use parking_lot::RwLock;

use crate::events::ListenerId;
use crate::handler::IndexHandler;
use crate::IndexError;

/// Folder list with stats kept current from index changes.
pub struct FolderBrowser {
    handler: Arc<IndexHandler>,
    stats: Arc<RwLock<HashMap<String, FolderStats>>>,
    listener: ListenerId,
    closed: AtomicBool,
}

impl FolderBrowser {
    pub(crate) fn open(handler: Arc<IndexHandler>) -> Result<Self, IndexError> {
        let stats = Arc::new(RwLock::new(HashMap::new()));
        let cache = stats.clone();
        let listener = handler.on_index_change(move |event| {
            cache.write().insert(event.stats.folder.clone(), event.stats.clone());
        });

        {
            let mut stats = stats.write();
            for entry in handler.repository().find_all_folder_stats()? {
                stats.entry(entry.folder.clone()).or_insert(entry);
            }
        }

        Ok(Self {
            handler,
            stats,
            listener,
            closed: AtomicBool::new(false),
        })
    }

    /// Known folders paired with their stats, sorted by label.
    pub fn folder_info_and_stats_list(&self) -> Vec<(FolderInfo, FolderStats)> {
        let mut list: Vec<_> = self
            .handler
            .folder_info_list()
            .into_iter()
            .map(|info| {
                let stats = self.folder_stats(&info.folder_id);
                (info, stats)
            })
            .collect();
        list.sort_by(|a, b| a.0.label.cmp(&b.0.label));
        list
    }

    /// Stats of a folder; empty stats when nothing is indexed yet.
    pub fn folder_stats(&self, folder: &str) -> FolderStats {
        self.stats
            .read()
            .get(folder)
            .cloned()
            .unwrap_or_else(|| FolderStats::new(folder))
    }

    /// Looks up a known folder.
    pub fn folder_info(&self, folder: &str) -> Option<FolderInfo> {
        self.handler.folder_info(folder)
    }

    /// Stops tracking stats. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.handler.unregister_listener(self.listener);
        }
    }
}

impl Drop for FolderBrowser {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bep_core::config::ConfigData;
    use bep_core::{Configuration, FileInfo};
    use bep_proto::bep;
    use bep_store::{IndexRepository, MemoryRepository};

    #[test]
    fn test_stats_follow_index_changes() {
        let repo = Arc::new(MemoryRepository::new());
        repo.update_file_info(&FileInfo::file("b-folder", "x", 10, "h", 1).unwrap(), None)
            .unwrap();

        let mut data = ConfigData::default();
        data.folders = vec![FolderInfo::new("b-folder", Some("Beta")), FolderInfo::new("a-folder", Some("Alpha"))];
        let config = Arc::new(Configuration::in_memory(data));
        let handler = IndexHandler::new(config, repo.clone(), repo.clone());
        let browser = handler.new_folder_browser().unwrap();

        let list = browser.folder_info_and_stats_list();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].0.label, "Alpha");
        assert_eq!(list[0].1.record_count(), 0);
        assert_eq!(list[1].1.file_count, 1);

        handler
            .push_record(
                "a-folder",
                &bep::FileInfo {
                    name: "dir".into(),
                    r#type: bep::FileInfoType::Directory as i32,
                    modified_s: 5,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(browser.folder_stats("a-folder").dir_count, 1);
        assert_eq!(browser.folder_stats("unknown"), FolderStats::new("unknown"));
        assert_eq!(browser.folder_info("b-folder").unwrap().label, "Beta");

        browser.close();
    }
}
