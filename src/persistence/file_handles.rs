use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::session::{QueryTab, QueryTabId};

/// File a query tab was opened from or saved to, with the text as it was on
/// disk at that moment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileHandle {
    pub path: PathBuf,
    pub saved_text: String,
}

impl FileHandle {
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Side table keyed by query tab id, persisted apart from the workspace
/// layout so it survives layout resets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileHandleTable {
    entries: HashMap<QueryTabId, FileHandle>,
}

impl FileHandleTable {
    pub fn get(&self, tab_id: &QueryTabId) -> Option<&FileHandle> {
        self.entries.get(tab_id)
    }

    pub fn set(&mut self, tab_id: QueryTabId, handle: FileHandle) {
        self.entries.insert(tab_id, handle);
    }

    /// Drops entries of the given tabs. Returns whether anything changed.
    pub fn remove(&mut self, tab_ids: &[QueryTabId]) -> bool {
        let before = self.entries.len();
        for id in tab_ids {
            self.entries.remove(id);
        }
        before != self.entries.len()
    }

    /// A tab is unsaved when its text differs from the file it came from.
    /// A blank tab without a file is never unsaved.
    pub fn is_unsaved(&self, tab: &QueryTab) -> bool {
        match self.entries.get(&tab.id) {
            Some(handle) => handle.saved_text != tab.sql,
            None => !tab.sql.is_empty(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionStore;

    #[test]
    fn test_unsaved_detection() {
        let mut store = SessionStore::with_default_worksheet();
        let tab_id = store.active_query_tab().unwrap().id.clone();
        let mut table = FileHandleTable::default();

        assert!(!table.is_unsaved(store.query_tab(&tab_id).unwrap()));

        store.set_query_tab_sql(&tab_id, "SELECT 1").unwrap();
        assert!(table.is_unsaved(store.query_tab(&tab_id).unwrap()));

        table.set(
            tab_id.clone(),
            FileHandle {
                path: PathBuf::from("/tmp/report.sql"),
                saved_text: "SELECT 1".into(),
            },
        );
        assert!(!table.is_unsaved(store.query_tab(&tab_id).unwrap()));
        assert_eq!(table.get(&tab_id).unwrap().name(), "report.sql");

        assert!(table.remove(&[tab_id.clone()]));
        assert!(!table.remove(&[tab_id]));
        assert!(table.is_empty());
    }
}
