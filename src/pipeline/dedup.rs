//! Fingerprint store: exactly-once admission of inbound messages.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::clock::{SharedClock, saturating_add, to_chrono};
use crate::pipeline::types::Message;

/// Default cap on remembered fingerprints.
const DEFAULT_MAX_RECORDS: usize = 10_000;

/// A remembered fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintRecord {
    pub fingerprint: String,
    pub expires_at: DateTime<Utc>,
}

/// Remembers admitted fingerprints until their TTL passes.
///
/// Faults fail open: if a record cannot be stored the message is still
/// admitted, so a storage problem never drops a customer message.
pub struct FingerprintStore {
    records: Mutex<HashMap<String, DateTime<Utc>>>,
    ttl: chrono::Duration,
    max_records: usize,
    clock: SharedClock,
}

impl FingerprintStore {
    pub fn new(ttl: Duration, clock: SharedClock) -> Self {
        Self::with_capacity(ttl, DEFAULT_MAX_RECORDS, clock)
    }

    /// Create a store that remembers at most `max_records` live fingerprints.
    pub fn with_capacity(ttl: Duration, max_records: usize, clock: SharedClock) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            ttl: to_chrono(ttl),
            max_records: max_records.max(1),
            clock,
        }
    }

    /// Admit a message unless an unexpired record with its fingerprint exists.
    pub fn admit(&self, message: &Message) -> bool {
        let now = self.clock.now();
        let mut records = match self.records.lock() {
            Ok(records) => records,
            Err(_) => {
                warn!(
                    conversation_id = %message.conversation_id,
                    "Fingerprint store poisoned, admitting message"
                );
                return true;
            }
        };

        if let Some(expires_at) = records.get(&message.fingerprint) {
            if *expires_at > now {
                debug!(
                    conversation_id = %message.conversation_id,
                    fingerprint = %short(&message.fingerprint),
                    "Duplicate message rejected"
                );
                return false;
            }
            records.remove(&message.fingerprint);
        }

        if records.len() >= self.max_records {
            records.retain(|_, expires_at| *expires_at > now);
        }
        if records.len() >= self.max_records {
            warn!(
                conversation_id = %message.conversation_id,
                capacity = self.max_records,
                "Fingerprint store full, admitting without record"
            );
            return true;
        }

        records.insert(message.fingerprint.clone(), saturating_add(now, self.ttl));
        true
    }

    /// Drop a fingerprint so the same message can be admitted again.
    pub fn forget(&self, fingerprint: &str) {
        if let Ok(mut records) = self.records.lock() {
            records.remove(fingerprint);
        }
    }

    /// Look up the live record for a fingerprint.
    pub fn record(&self, fingerprint: &str) -> Option<FingerprintRecord> {
        let now = self.clock.now();
        let records = self.records.lock().ok()?;
        records
            .get(fingerprint)
            .filter(|expires_at| **expires_at > now)
            .map(|expires_at| FingerprintRecord {
                fingerprint: fingerprint.to_string(),
                expires_at: *expires_at,
            })
    }

    /// Number of stored records (expired ones included until purged).
    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn short(fingerprint: &str) -> &str {
    fingerprint.get(..12).unwrap_or(fingerprint)
}
