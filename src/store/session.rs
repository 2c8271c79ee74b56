//! Session records: per-conversation facts and bounded history.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::saturating_add;
use crate::pipeline::types::MediaKind;

/// Fact keys written by the reply coordinator.
pub mod facts {
    pub const LAST_INTENT: &str = "last_intent";
    pub const LAST_ROUTE_REASON: &str = "last_route_reason";
    pub const LAST_RULE_ID: &str = "last_rule_id";
    pub const LAST_TARGET_STORE: &str = "last_target_store";
    pub const ADDRESS_IMAGE_SENT: &str = "address_image_sent";
    pub const CONTACT_IMAGE_SENT: &str = "contact_image_sent";
    pub const VIDEO_SCHEDULED: &str = "video_scheduled";
    pub const ADDRESS_IMAGE_SENT_COUNT: &str = "address_image_sent_count";
    /// Comma-separated store names whose image was sent.
    pub const SENT_ADDRESS_STORES: &str = "sent_address_stores";
    pub const GEO_FOLLOWUP_ROUND: &str = "geo_followup_round";
    pub const GEO_CHOICE_OFFERED: &str = "geo_choice_offered";
    /// Set while the last reply asked the customer where they are.
    pub const LAST_GEO_PENDING: &str = "last_geo_pending";
    pub const LAST_DETECTED_REGION: &str = "last_detected_region";
    pub const CONTACT_FOLLOWUP_COUNT: &str = "contact_followup_count";
}

const TRUE: &str = "true";

/// Who spoke a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agent,
}

/// One entry of a session's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub media_refs: BTreeSet<MediaKind>,
}

impl Turn {
    pub fn user(text: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            timestamp,
            media_refs: BTreeSet::new(),
        }
    }

    pub fn agent(
        text: impl Into<String>,
        timestamp: DateTime<Utc>,
        media: impl IntoIterator<Item = MediaKind>,
    ) -> Self {
        Self {
            role: Role::Agent,
            text: text.into(),
            timestamp,
            media_refs: media.into_iter().collect(),
        }
    }
}

/// Whether a session is inside a decision cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Idle,
    Deciding,
}

/// Persistent memory for one conversation.
///
/// `id` and `state` are not serialized: the id is the key of the store's
/// JSON object and the state only exists in memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    #[serde(skip)]
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub facts: BTreeMap<String, String>,
    #[serde(default)]
    pub history: Vec<Turn>,
    #[serde(skip)]
    pub state: SessionState,
}

impl Session {
    /// A fresh, empty session.
    pub fn new(id: impl Into<String>, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            id: id.into(),
            created_at: now,
            last_active_at: now,
            expires_at: saturating_add(now, ttl),
            facts: BTreeMap::new(),
            history: Vec::new(),
            state: SessionState::Idle,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Mark activity and push expiry out by `ttl`.
    pub fn touch(&mut self, now: DateTime<Utc>, ttl: Duration) {
        self.last_active_at = now;
        self.expires_at = saturating_add(now, ttl);
    }

    pub fn fact(&self, key: &str) -> Option<&str> {
        self.facts.get(key).map(String::as_str)
    }

    pub fn set_fact(&mut self, key: &str, value: impl Into<String>) {
        self.facts.insert(key.to_string(), value.into());
    }

    /// A boolean fact; anything but `"true"` reads as unset.
    pub fn flag(&self, key: &str) -> bool {
        self.fact(key) == Some(TRUE)
    }

    pub fn set_flag(&mut self, key: &str) {
        self.set_fact(key, TRUE);
    }

    /// A numeric fact; missing or unparsable reads as zero.
    pub fn count(&self, key: &str) -> u32 {
        self.fact(key).and_then(|v| v.parse().ok()).unwrap_or(0)
    }

    /// Increment a numeric fact, returning the new value.
    pub fn bump_count(&mut self, key: &str) -> u32 {
        let next = self.count(key).saturating_add(1);
        self.set_fact(key, next.to_string());
        next
    }

    /// A comma-separated list fact.
    pub fn fact_list(&self, key: &str) -> Vec<&str> {
        self.fact(key)
            .map(|v| v.split(',').filter(|s| !s.is_empty()).collect())
            .unwrap_or_default()
    }

    /// Add `item` to a list fact unless present.
    pub fn add_to_list(&mut self, key: &str, item: &str) {
        let mut items: Vec<String> = self.fact_list(key).into_iter().map(str::to_string).collect();
        if items.iter().any(|i| i == item) {
            return;
        }
        items.push(item.replace(',', " "));
        self.set_fact(key, items.join(","));
    }

    /// Append a turn, dropping the oldest ones beyond `limit`.
    pub fn push_turn(&mut self, turn: Turn, limit: usize) {
        self.history.push(turn);
        self.trim_history(limit);
    }

    pub fn trim_history(&mut self, limit: usize) {
        if self.history.len() > limit {
            let excess = self.history.len() - limit;
            self.history.drain(..excess);
        }
    }

    /// The last `n` turns, oldest first.
    pub fn recent(&self, n: usize) -> &[Turn] {
        let start = self.history.len().saturating_sub(n);
        &self.history[start..]
    }

    /// Texts of earlier agent replies.
    pub fn agent_replies(&self) -> impl Iterator<Item = &str> {
        self.history
            .iter()
            .filter(|t| t.role == Role::Agent)
            .map(|t| t.text.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new("c1", Utc::now(), Duration::days(30))
    }

    #[test]
    fn history_drops_oldest() {
        let mut s = session();
        let now = Utc::now();
        for i in 0..5 {
            s.push_turn(Turn::user(format!("m{i}"), now), 3);
        }
        let texts: Vec<&str> = s.history.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["m2", "m3", "m4"]);
        assert_eq!(s.recent(2).len(), 2);
        assert_eq!(s.recent(10).len(), 3);
    }

    #[test]
    fn flags_read_true_only() {
        let mut s = session();
        assert!(!s.flag(facts::ADDRESS_IMAGE_SENT));
        s.set_fact(facts::ADDRESS_IMAGE_SENT, "false");
        assert!(!s.flag(facts::ADDRESS_IMAGE_SENT));
        s.set_flag(facts::ADDRESS_IMAGE_SENT);
        assert!(s.flag(facts::ADDRESS_IMAGE_SENT));
    }

    #[test]
    fn counters_and_lists() {
        let mut s = session();
        assert_eq!(s.count(facts::ADDRESS_IMAGE_SENT_COUNT), 0);
        assert_eq!(s.bump_count(facts::ADDRESS_IMAGE_SENT_COUNT), 1);
        assert_eq!(s.bump_count(facts::ADDRESS_IMAGE_SENT_COUNT), 2);
        s.set_fact(facts::GEO_FOLLOWUP_ROUND, "garbage");
        assert_eq!(s.count(facts::GEO_FOLLOWUP_ROUND), 0);

        assert!(s.fact_list(facts::SENT_ADDRESS_STORES).is_empty());
        s.add_to_list(facts::SENT_ADDRESS_STORES, "上海静安店");
        s.add_to_list(facts::SENT_ADDRESS_STORES, "北京朝阳店");
        s.add_to_list(facts::SENT_ADDRESS_STORES, "上海静安店");
        assert_eq!(
            s.fact_list(facts::SENT_ADDRESS_STORES),
            vec!["上海静安店", "北京朝阳店"]
        );
    }

    #[test]
    fn expiry_follows_activity() {
        let start = Utc::now();
        let mut s = Session::new("c1", start, Duration::days(30));
        assert!(!s.is_expired(start + Duration::days(29)));
        assert!(s.is_expired(start + Duration::days(30)));
        s.touch(start + Duration::days(20), Duration::days(30));
        assert!(!s.is_expired(start + Duration::days(45)));
    }

    #[test]
    fn unbounded_ttl_saturates() {
        let start = Utc::now();
        let mut s = Session::new("c1", start, Duration::MAX);
        assert_eq!(s.expires_at, DateTime::<Utc>::MAX_UTC);
        s.touch(start + Duration::days(1), Duration::MAX);
        assert!(!s.is_expired(start + Duration::days(365 * 1000)));
    }

    #[test]
    fn serializes_without_id_and_state() {
        let mut s = session();
        s.state = SessionState::Deciding;
        s.push_turn(
            Turn::agent("好的", Utc::now(), [MediaKind::AddressImage]),
            10,
        );
        let json = serde_json::to_value(&s).unwrap();
        assert!(json.get("id").is_none());
        assert!(json.get("state").is_none());
        assert_eq!(json["history"][0]["role"], "agent");
        assert_eq!(json["history"][0]["media_refs"][0], "address_image");
    }

    #[test]
    fn missing_collections_default() {
        let raw = r#"{
            "created_at": "2025-03-01T12:00:00Z",
            "last_active_at": "2025-03-01T12:00:00Z",
            "expires_at": "2025-03-31T12:00:00Z"
        }"#;
        let s: Session = serde_json::from_str(raw).unwrap();
        assert!(s.facts.is_empty());
        assert!(s.history.is_empty());
        assert_eq!(s.state, SessionState::Idle);
    }
}
