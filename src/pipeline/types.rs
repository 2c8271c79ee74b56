//! Shared types for the reply pipeline.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::pipeline::text::normalize;

// ── Inbound message ─────────────────────────────────────────────────

/// One inbound customer message, alive for a single pipeline pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Conversation the message belongs to.
    pub conversation_id: String,
    /// Raw message text.
    pub text: String,
    /// When the surface saw the message.
    pub received_at: DateTime<Utc>,
    /// Digest of (conversation, normalized text, time bucket).
    pub fingerprint: String,
}

impl Message {
    /// Build a message and compute its fingerprint.
    pub fn new(
        conversation_id: impl Into<String>,
        text: impl Into<String>,
        received_at: DateTime<Utc>,
        bucket_secs: u64,
    ) -> Self {
        let conversation_id = conversation_id.into();
        let text = text.into();
        let fingerprint = fingerprint(&conversation_id, &text, received_at, bucket_secs);
        Self {
            conversation_id,
            text,
            received_at,
            fingerprint,
        }
    }
}

/// Deterministic message digest.
///
/// Two messages in the same conversation whose normalized text is equal
/// and which fall into the same `bucket_secs` window share a fingerprint.
pub fn fingerprint(
    conversation_id: &str,
    text: &str,
    received_at: DateTime<Utc>,
    bucket_secs: u64,
) -> String {
    let bucket = received_at.timestamp().div_euclid(bucket_secs.max(1) as i64);
    let mut hasher = Sha256::new();
    hasher.update(conversation_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(normalize(text).as_bytes());
    hasher.update([0u8]);
    hasher.update(bucket.to_be_bytes());
    hex::encode(hasher.finalize())
}

// ── Decision ────────────────────────────────────────────────────────

/// Classified category of an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Address,
    Knowledge,
    Generative,
}

impl Intent {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Address => "address",
            Self::Knowledge => "knowledge",
            Self::Generative => "generative",
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Where the reply text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplySource {
    /// Fixed rule template.
    Rule,
    /// Knowledge base entry.
    Knowledge,
    /// Generative model.
    Llm,
    /// Static fallback after the generative path was unavailable.
    Fallback,
}

impl ReplySource {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Rule => "rule",
            Self::Knowledge => "knowledge",
            Self::Llm => "llm",
            Self::Fallback => "fallback",
        }
    }
}

/// Kinds of media that can accompany a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    AddressImage,
    ContactImage,
    DelayedVideo,
}

impl MediaKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::AddressImage => "address_image",
            Self::ContactImage => "contact_image",
            Self::DelayedVideo => "delayed_video",
        }
    }
}

/// Attachments planned for one decision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaPlan {
    pub address_image: bool,
    pub contact_image: bool,
    /// Seconds after the reply at which the video is sent.
    pub delayed_video: Option<u64>,
}

impl MediaPlan {
    /// Media to send right after the text reply, in send order.
    pub fn immediate(&self) -> Vec<MediaKind> {
        let mut kinds = Vec::new();
        if self.address_image {
            kinds.push(MediaKind::AddressImage);
        }
        if self.contact_image {
            kinds.push(MediaKind::ContactImage);
        }
        kinds
    }

    /// Every media kind this plan touches, deferred ones included.
    pub fn kinds(&self) -> Vec<MediaKind> {
        let mut kinds = self.immediate();
        if self.delayed_video.is_some() {
            kinds.push(MediaKind::DelayedVideo);
        }
        kinds
    }

    pub fn is_empty(&self) -> bool {
        !self.address_image && !self.contact_image && self.delayed_video.is_none()
    }
}

/// The composed output of one decision cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub conversation_id: String,
    pub intent: Intent,
    /// Matched rule or knowledge entry, if any.
    pub rule_id: Option<String>,
    pub reply_text: String,
    pub media_plan: MediaPlan,
    pub reply_source: ReplySource,
    /// Why the router picked this branch.
    pub route_reason: String,
    /// Store whose image accompanies an address recommendation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_store: Option<String>,
}

/// Result of handing one message to the coordinator.
#[derive(Debug, Clone)]
pub enum HandleOutcome {
    /// A reply was decided and the session committed.
    Replied(Decision),
    /// Duplicate of a message already admitted.
    Rejected,
    /// Another cycle is in flight; resubmit later in arrival order.
    Deferred,
    /// The surface changed under the cycle; nothing was committed.
    Aborted,
}

impl HandleOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Replied(_) => "replied",
            Self::Rejected => "rejected",
            Self::Deferred => "deferred",
            Self::Aborted => "aborted",
        }
    }

    /// The decision, when one was produced.
    pub fn decision(&self) -> Option<&Decision> {
        match self {
            Self::Replied(decision) => Some(decision),
            _ => None,
        }
    }
}
