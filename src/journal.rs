//! Conversation journal: append-only JSONL per conversation.
//!
//! Journal writes never affect the reply pipeline: failures are logged and
//! dropped.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::pipeline::types::{Decision, MediaKind};

/// One journaled event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum JournalEvent {
    UserMessage { text: String },
    Decision { decision: Decision },
    MediaSent { kind: MediaKind },
    MediaCancelled { kind: MediaKind },
}

impl JournalEvent {
    pub fn label(&self) -> &'static str {
        match self {
            Self::UserMessage { .. } => "user_message",
            Self::Decision { .. } => "decision",
            Self::MediaSent { .. } => "media_sent",
            Self::MediaCancelled { .. } => "media_cancelled",
        }
    }
}

#[derive(Serialize)]
struct Record<'a> {
    timestamp: DateTime<Utc>,
    conversation_id: &'a str,
    conversation_hash: String,
    #[serde(flatten)]
    event: &'a JournalEvent,
}

/// Writes one `<conversation>.jsonl` file per conversation.
#[derive(Debug, Clone)]
pub struct ConversationJournal {
    dir: PathBuf,
}

impl ConversationJournal {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File backing a conversation.
    pub fn file_for(&self, conversation_id: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", sanitize(conversation_id)))
    }

    /// Append an event. Errors are logged, never returned.
    pub fn record(&self, conversation_id: &str, at: DateTime<Utc>, event: &JournalEvent) {
        if let Err(e) = self.append(conversation_id, at, event) {
            warn!(
                conversation_id,
                event = event.label(),
                error = %e,
                "Failed to write conversation journal"
            );
        }
    }

    fn append(
        &self,
        conversation_id: &str,
        at: DateTime<Utc>,
        event: &JournalEvent,
    ) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let record = Record {
            timestamp: at,
            conversation_id,
            conversation_hash: conversation_hash(conversation_id),
            event,
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.file_for(conversation_id))?;
        file.write_all(line.as_bytes())
    }
}

/// Keep `[0-9A-Za-z_-]`, replace everything else with `_`.
fn sanitize(conversation_id: &str) -> String {
    if conversation_id.is_empty() {
        return "unknown".to_string();
    }
    conversation_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn conversation_hash(conversation_id: &str) -> String {
    let digest = Sha256::digest(conversation_id.as_bytes());
    hex::encode(&digest[..8])
}
