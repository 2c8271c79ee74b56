//! Deferred media sends (the delayed try-on video).
//!
//! Entries are scheduled when a decision is made and fired later by the
//! scheduler, outside the guard. Each carries a cancel flag that is checked
//! right before sending.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::pipeline::types::MediaKind;

/// A scheduled media send.
#[derive(Debug, Clone)]
pub struct DeferredMedia {
    pub id: u64,
    pub conversation_id: String,
    pub kind: MediaKind,
    pub due_at: DateTime<Utc>,
    cancelled: Arc<AtomicBool>,
}

impl DeferredMedia {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Queue of deferred sends, shared by the coordinator and the scheduler.
#[derive(Debug, Default)]
pub struct MediaQueue {
    entries: Mutex<Vec<DeferredMedia>>,
    next_id: AtomicU64,
}

impl MediaQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&self, conversation_id: &str, kind: MediaKind, due_at: DateTime<Utc>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let entry = DeferredMedia {
            id,
            conversation_id: conversation_id.to_string(),
            kind,
            due_at,
            cancelled: Arc::new(AtomicBool::new(false)),
        };
        debug!(conversation_id, kind = kind.label(), %due_at, "Deferred media scheduled");
        self.lock().push(entry);
        id
    }

    /// Cancel every pending send for a conversation and return them.
    pub fn cancel_conversation(&self, conversation_id: &str) -> Vec<DeferredMedia> {
        let mut entries = self.lock();
        let (cancelled, kept): (Vec<_>, Vec<_>) = entries
            .drain(..)
            .partition(|e| e.conversation_id == conversation_id);
        *entries = kept;
        for entry in &cancelled {
            entry.cancelled.store(true, Ordering::SeqCst);
        }
        if !cancelled.is_empty() {
            info!(conversation_id, count = cancelled.len(), "Deferred media cancelled");
        }
        cancelled
    }

    /// Remove and return entries due at `now`, earliest first.
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<DeferredMedia> {
        let mut entries = self.lock();
        let (mut due, kept): (Vec<_>, Vec<_>) = entries.drain(..).partition(|e| e.due_at <= now);
        *entries = kept;
        due.sort_by_key(|e| (e.due_at, e.id));
        due
    }

    pub fn pending_for(&self, conversation_id: &str) -> usize {
        self.lock()
            .iter()
            .filter(|e| e.conversation_id == conversation_id)
            .count()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<DeferredMedia>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}
