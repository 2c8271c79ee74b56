//! In-memory automation surface for simulations and tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::channels::AutomationSurface;
use crate::error::SurfaceError;
use crate::pipeline::abort::AbortHandle;
use crate::pipeline::types::{MediaKind, Message};

/// Bucket used for transcript fingerprints; the scheduler re-fingerprints
/// with its own configuration.
const TRANSCRIPT_BUCKET_SECS: u64 = 60;

/// Something the engine sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentItem {
    Text { conversation_id: String, text: String },
    Media { conversation_id: String, kind: MediaKind },
}

#[derive(Default)]
struct State {
    unread: VecDeque<String>,
    transcripts: HashMap<String, Vec<Message>>,
    sent: Vec<SentItem>,
    aborts: HashMap<String, AbortHandle>,
    fail_sends: bool,
}

/// A page that lives in memory. Inbound messages are pushed by the caller;
/// sends are recorded in order.
#[derive(Default)]
pub struct MemorySurface {
    state: Mutex<State>,
}

impl MemorySurface {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Deliver a customer message and mark the conversation unread.
    pub fn push_inbound(&self, conversation_id: &str, text: &str, at: DateTime<Utc>) {
        let mut state = self.lock();
        state
            .transcripts
            .entry(conversation_id.to_string())
            .or_default()
            .push(Message::new(conversation_id, text, at, TRANSCRIPT_BUCKET_SECS));
        if !state.unread.iter().any(|id| id == conversation_id) {
            state.unread.push_back(conversation_id.to_string());
        }
    }

    /// Everything sent so far.
    pub fn sent(&self) -> Vec<SentItem> {
        self.lock().sent.clone()
    }

    /// Sends addressed to one conversation.
    pub fn sent_to(&self, conversation_id: &str) -> Vec<SentItem> {
        self.lock()
            .sent
            .iter()
            .filter(|item| match item {
                SentItem::Text { conversation_id: c, .. } | SentItem::Media { conversation_id: c, .. } => {
                    c == conversation_id
                }
            })
            .cloned()
            .collect()
    }

    /// Make subsequent sends fail.
    pub fn set_fail_sends(&self, fail: bool) {
        self.lock().fail_sends = fail;
    }

    /// Simulate the page changing under the cycle for `conversation_id`.
    pub fn change_page(&self, conversation_id: &str) -> bool {
        match self.lock().aborts.remove(conversation_id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    fn record(&self, conversation_id: &str, item: SentItem) -> Result<(), SurfaceError> {
        let mut state = self.lock();
        if state.fail_sends {
            return Err(SurfaceError::SendFailed {
                conversation_id: conversation_id.to_string(),
                reason: "send disabled".into(),
            });
        }
        state.sent.push(item);
        Ok(())
    }
}

#[async_trait]
impl AutomationSurface for MemorySurface {
    fn name(&self) -> &str {
        "memory"
    }

    async fn poll_unread(&self) -> Result<Vec<String>, SurfaceError> {
        Ok(self.lock().unread.drain(..).collect())
    }

    async fn fetch_transcript(&self, conversation_id: &str) -> Result<Vec<Message>, SurfaceError> {
        self.lock()
            .transcripts
            .get(conversation_id)
            .cloned()
            .ok_or_else(|| SurfaceError::Transcript {
                conversation_id: conversation_id.to_string(),
                reason: "unknown conversation".into(),
            })
    }

    async fn send_text(&self, conversation_id: &str, text: &str) -> Result<(), SurfaceError> {
        self.record(
            conversation_id,
            SentItem::Text {
                conversation_id: conversation_id.to_string(),
                text: text.to_string(),
            },
        )
    }

    async fn send_media(&self, conversation_id: &str, kind: MediaKind) -> Result<(), SurfaceError> {
        self.record(
            conversation_id,
            SentItem::Media {
                conversation_id: conversation_id.to_string(),
                kind,
            },
        )
    }

    fn abort_on_page_change(&self, conversation_id: &str, handle: AbortHandle) {
        self.lock().aborts.insert(conversation_id.to_string(), handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::abort::abort_pair;

    #[tokio::test]
    async fn poll_drains_unread_once() {
        let surface = MemorySurface::new();
        let now = Utc::now();
        surface.push_inbound("c1", "你好", now);
        surface.push_inbound("c1", "在吗", now);
        surface.push_inbound("c2", "地址", now);

        assert_eq!(surface.poll_unread().await.unwrap(), vec!["c1", "c2"]);
        assert!(surface.poll_unread().await.unwrap().is_empty());
        assert_eq!(surface.fetch_transcript("c1").await.unwrap().len(), 2);
        assert!(surface.fetch_transcript("c9").await.is_err());
    }

    #[tokio::test]
    async fn records_sends_and_failures() {
        let surface = MemorySurface::new();
        surface.send_text("c1", "好的").await.unwrap();
        surface.send_media("c1", MediaKind::AddressImage).await.unwrap();
        surface.set_fail_sends(true);
        assert!(surface.send_text("c1", "x").await.is_err());
        assert_eq!(surface.sent_to("c1").len(), 2);
        assert!(surface.sent_to("c2").is_empty());
    }

    #[test]
    fn change_page_fires_registered_abort() {
        let surface = MemorySurface::new();
        let (handle, signal) = abort_pair();
        surface.abort_on_page_change("c1", handle);
        assert!(!surface.change_page("c2"));
        assert!(surface.change_page("c1"));
        assert!(signal.is_aborted());
    }
}
