//! Knowledge base: trigger/reply entries loaded from a JSON file.
//!
//! Each decision cycle reads one immutable [`KnowledgeSnapshot`]. Reloads
//! swap the snapshot between cycles; a cycle holding the old `Arc` keeps
//! seeing the old entries until it finishes.

pub mod matcher;
pub mod model;

pub use matcher::KnowledgeMatcher;
pub use model::{KnowledgeEntry, KnowledgeSnapshot};

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tracing::{info, warn};

use crate::error::KnowledgeError;

/// Hot-reloadable knowledge snapshot holder.
pub struct KnowledgeBase {
    path: Option<PathBuf>,
    current: RwLock<Arc<KnowledgeSnapshot>>,
}

impl KnowledgeBase {
    /// Load the knowledge file. Failing here is fatal for startup.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, KnowledgeError> {
        let path = path.as_ref().to_path_buf();
        let snapshot = KnowledgeSnapshot::load(&path)?;
        Ok(Self {
            path: Some(path),
            current: RwLock::new(Arc::new(snapshot)),
        })
    }

    /// A knowledge base with fixed entries and no backing file.
    pub fn from_entries(entries: Vec<KnowledgeEntry>) -> Self {
        Self {
            path: None,
            current: RwLock::new(Arc::new(KnowledgeSnapshot::new(entries))),
        }
    }

    pub fn empty() -> Self {
        Self::from_entries(Vec::new())
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<KnowledgeSnapshot> {
        self.current
            .read()
            .map(|s| Arc::clone(&s))
            .unwrap_or_else(|e| Arc::clone(&e.into_inner()))
    }

    /// Re-read the backing file. On failure the previous snapshot stays.
    pub fn reload(&self) -> Result<usize, KnowledgeError> {
        let Some(path) = &self.path else {
            return Ok(self.snapshot().len());
        };
        match KnowledgeSnapshot::load(path) {
            Ok(snapshot) => {
                let count = snapshot.len();
                let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
                *current = Arc::new(snapshot);
                info!(path = %path.display(), entries = count, "Knowledge base reloaded");
                Ok(count)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Knowledge reload failed, keeping previous snapshot");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reload_swaps_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("kb.json");
        std::fs::write(&path, r#"[{"id": 1, "triggers": ["质保"], "reply": "一年"}]"#).unwrap();

        let kb = KnowledgeBase::load(&path).unwrap();
        let before = kb.snapshot();
        assert_eq!(before.len(), 1);

        std::fs::write(
            &path,
            r#"[{"id": 1, "triggers": ["质保"], "reply": "两年"}, {"id": 2, "triggers": ["发货"], "reply": "当天"}]"#,
        )
        .unwrap();
        assert_eq!(kb.reload().unwrap(), 2);

        // Old handle still sees the old entries.
        assert_eq!(before.get(1).unwrap().reply_text, "一年");
        assert_eq!(kb.snapshot().get(1).unwrap().reply_text, "两年");
    }

    #[test]
    fn failed_reload_keeps_previous() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("kb.json");
        std::fs::write(&path, r#"[{"id": 4, "triggers": ["质保"], "reply": "一年"}]"#).unwrap();
        let kb = KnowledgeBase::load(&path).unwrap();

        std::fs::write(&path, "not json").unwrap();
        assert!(kb.reload().is_err());
        assert!(kb.snapshot().get(4).is_some());
    }

    #[test]
    fn startup_with_corrupt_file_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("kb.json");
        std::fs::write(&path, "{").unwrap();
        assert!(KnowledgeBase::load(&path).is_err());
    }
}
