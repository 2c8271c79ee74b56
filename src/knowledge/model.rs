//! Knowledge base entries and snapshot loading.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::KnowledgeError;

/// One knowledge rule: if the customer says something like a trigger,
/// answer with `reply_text`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub id: u64,
    pub triggers: Vec<String>,
    #[serde(rename = "reply")]
    pub reply_text: String,
    #[serde(default)]
    pub priority: i32,
}

impl KnowledgeEntry {
    pub fn new(id: u64, triggers: &[&str], reply_text: impl Into<String>, priority: i32) -> Self {
        Self {
            id,
            triggers: triggers.iter().map(|t| t.to_string()).collect(),
            reply_text: reply_text.into(),
            priority,
        }
    }
}

/// On-disk record, tolerant of the legacy `{question, answer}` shape.
#[derive(Debug, Deserialize)]
struct RawEntry {
    #[serde(default)]
    id: Option<serde_json::Value>,
    #[serde(default)]
    triggers: Vec<String>,
    #[serde(default)]
    question: Option<String>,
    #[serde(default, alias = "answer")]
    reply: Option<String>,
    #[serde(default)]
    priority: i32,
}

/// Immutable view of the knowledge base used for one decision cycle.
#[derive(Debug, Clone, Default)]
pub struct KnowledgeSnapshot {
    entries: Vec<KnowledgeEntry>,
}

impl KnowledgeSnapshot {
    pub fn new(entries: Vec<KnowledgeEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[KnowledgeEntry] {
        &self.entries
    }

    pub fn get(&self, id: u64) -> Option<&KnowledgeEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parse a JSON array of entries.
    ///
    /// Entries without a numeric `id` get one in file order after the
    /// highest explicit id. Entries with no trigger or an empty reply are
    /// skipped.
    pub fn from_json(raw: &str, path: &Path) -> Result<Self, KnowledgeError> {
        let records: Vec<RawEntry> =
            serde_json::from_str(raw).map_err(|e| KnowledgeError::Parse {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let max_id = records
            .iter()
            .filter_map(|r| r.id.as_ref().and_then(|v| v.as_u64()))
            .max()
            .unwrap_or(0);
        let mut next_id = max_id + 1;

        let mut entries = Vec::with_capacity(records.len());
        for (index, record) in records.into_iter().enumerate() {
            let id = match record.id.as_ref().and_then(|v| v.as_u64()) {
                Some(id) => id,
                None => {
                    let id = next_id;
                    next_id += 1;
                    id
                }
            };

            let mut triggers: Vec<String> = record
                .triggers
                .into_iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect();
            if triggers.is_empty() {
                if let Some(question) = record.question.map(|q| q.trim().to_string()) {
                    if !question.is_empty() {
                        triggers.push(question);
                    }
                }
            }
            let reply_text = record.reply.unwrap_or_default().trim().to_string();

            if triggers.is_empty() || reply_text.is_empty() {
                warn!(index, id, "Skipping knowledge entry without triggers or reply");
                continue;
            }

            entries.push(KnowledgeEntry {
                id,
                triggers,
                reply_text,
                priority: record.priority,
            });
        }

        Ok(Self { entries })
    }

    /// Load a snapshot from disk. A missing file is an empty snapshot.
    pub fn load(path: &Path) -> Result<Self, KnowledgeError> {
        if !path.exists() {
            info!(path = %path.display(), "Knowledge base file not found, starting empty");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|source| KnowledgeError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let snapshot = Self::from_json(&raw, path)?;
        info!(path = %path.display(), entries = snapshot.len(), "Knowledge base loaded");
        Ok(snapshot)
    }
}
