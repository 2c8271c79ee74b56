//! Reply coordinator: one decision cycle per inbound message.
//!
//! Flow:
//! 1. Fingerprint admission → duplicates are `Rejected`
//! 2. Guard acquire → `Deferred` while another cycle is in flight
//! 3. Session checkout
//! 4. Intent routing (address → knowledge → contact → generative)
//! 5. Media planning
//! 6. History and facts update
//! 7. Session commit
//! 8. Guard release (also on every error and abort path)
//! 9. Decision returned to the caller

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::clock::{SharedClock, saturating_add, to_chrono};
use crate::config::AgentConfig;
use crate::error::{ConfigError, PipelineError};
use crate::journal::{ConversationJournal, JournalEvent};
use crate::knowledge::{KnowledgeBase, KnowledgeMatcher};
use crate::llm::GenerativeGateway;
use crate::pipeline::abort::AbortSignal;
use crate::pipeline::dedup::FingerprintStore;
use crate::pipeline::deferred::MediaQueue;
use crate::pipeline::guard::ConcurrencyGuard;
use crate::pipeline::media::MediaPlanner;
use crate::pipeline::router::{IntentRouter, Route};
use crate::pipeline::rules::RulesEngine;
use crate::pipeline::types::{Decision, HandleOutcome, MediaKind, Message};
use crate::store::{CommitStatus, Session, SessionStore, SessionStoreOptions, Turn, facts};

/// Top-level orchestrator.
pub struct ReplyCoordinator {
    fingerprints: FingerprintStore,
    guard: ConcurrencyGuard,
    sessions: Arc<SessionStore>,
    knowledge: Arc<KnowledgeBase>,
    rules: Arc<RulesEngine>,
    router: IntentRouter,
    planner: MediaPlanner,
    media_queue: Arc<MediaQueue>,
    journal: Option<ConversationJournal>,
    clock: SharedClock,
    history_limit: usize,
    dedup_bucket_secs: u64,
}

impl ReplyCoordinator {
    /// Build a coordinator, loading the session store from `config.data_dir`.
    pub fn new(
        config: &AgentConfig,
        knowledge: Arc<KnowledgeBase>,
        gateway: Option<Arc<dyn GenerativeGateway>>,
        clock: SharedClock,
    ) -> Result<Self, ConfigError> {
        let sessions = Arc::new(SessionStore::load(
            config.session_store_path(),
            SessionStoreOptions::from(config),
            Arc::clone(&clock),
        ));
        Self::with_session_store(config, sessions, knowledge, gateway, clock)
    }

    /// Build a coordinator over an existing session store.
    pub fn with_session_store(
        config: &AgentConfig,
        sessions: Arc<SessionStore>,
        knowledge: Arc<KnowledgeBase>,
        gateway: Option<Arc<dyn GenerativeGateway>>,
        clock: SharedClock,
    ) -> Result<Self, ConfigError> {
        let rules = Arc::new(RulesEngine::from_rule_set(&config.rules)?);
        let router = IntentRouter::new(
            Arc::clone(&rules),
            KnowledgeMatcher::new(config.knowledge_threshold),
            gateway,
            config.templates.clone(),
            &config.rules,
            config.generative_timeout,
            config.context_turns,
        );
        Ok(Self {
            fingerprints: FingerprintStore::new(config.dedup_ttl, Arc::clone(&clock)),
            guard: ConcurrencyGuard::new(),
            sessions,
            knowledge,
            rules,
            router,
            planner: MediaPlanner::new(config.video_delay_secs)
                .with_address_image_cap(config.address_image_cap)
                .with_whitelist(config.media_whitelist.iter().cloned()),
            media_queue: Arc::new(MediaQueue::new()),
            journal: None,
            clock,
            history_limit: config.history_limit,
            dedup_bucket_secs: config.dedup_bucket.as_secs().max(1),
        })
    }

    /// Journal every committed cycle.
    pub fn with_journal(mut self, journal: ConversationJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Build a message received now.
    pub fn message(&self, conversation_id: &str, text: &str) -> Message {
        self.message_at(conversation_id, text, self.clock.now())
    }

    /// Build a message with an explicit receive time.
    pub fn message_at(&self, conversation_id: &str, text: &str, at: DateTime<Utc>) -> Message {
        Message::new(conversation_id, text, at, self.dedup_bucket_secs)
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn knowledge(&self) -> &Arc<KnowledgeBase> {
        &self.knowledge
    }

    pub fn media_queue(&self) -> &Arc<MediaQueue> {
        &self.media_queue
    }

    pub fn journal(&self) -> Option<&ConversationJournal> {
        self.journal.as_ref()
    }

    pub fn guard(&self) -> &ConcurrencyGuard {
        &self.guard
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn has_gateway(&self) -> bool {
        self.router.has_gateway()
    }

    /// Handle one inbound message.
    pub async fn handle(&self, message: Message) -> Result<HandleOutcome, PipelineError> {
        self.handle_with_abort(message, &AbortSignal::never()).await
    }

    /// Handle one inbound message, giving up if `abort` fires mid-cycle.
    pub async fn handle_with_abort(
        &self,
        message: Message,
        abort: &AbortSignal,
    ) -> Result<HandleOutcome, PipelineError> {
        let conversation_id = message.conversation_id.clone();

        // Step 1: exactly-once admission
        if !self.fingerprints.admit(&message) {
            info!(conversation_id = %conversation_id, "Duplicate message rejected");
            return Ok(HandleOutcome::Rejected);
        }

        // Step 2: single flight. The permit releases on drop, so every early
        // return below frees the guard.
        let permit = match self.guard.acquire_permit() {
            Ok(permit) => permit,
            Err(e) => {
                debug!(conversation_id = %conversation_id, error = %e, "Guard busy, deferring");
                // Not processed yet: the resubmission must be admitted again.
                self.fingerprints.forget(&message.fingerprint);
                return Ok(HandleOutcome::Deferred);
            }
        };

        info!(
            conversation_id = %conversation_id,
            ticket = ?permit.ticket().map(|t| t.id()),
            "Decision cycle started"
        );

        // Step 3: checkout
        let mut session = match self.sessions.get_or_create(&conversation_id) {
            Ok(session) => session,
            Err(e) => {
                self.fingerprints.forget(&message.fingerprint);
                return Err(e.into());
            }
        };

        // Step 4: route against one knowledge snapshot
        let snapshot = self.knowledge.snapshot();
        let signals = self.rules.evaluate(&message.text);
        let route = match self
            .router
            .route(&message.text, &signals, &session, &snapshot, abort)
            .await
        {
            Some(route) => route,
            None => return Ok(self.abort_cycle(&message)),
        };

        // Step 5: route facts, then attachments
        route.apply_facts(&mut session);
        let media_plan = self.planner.plan_route(&route, &signals, &mut session);

        if abort.is_aborted() {
            return Ok(self.abort_cycle(&message));
        }

        // Step 6: history and facts
        let now = self.clock.now();
        self.record_turns(&mut session, &message, &route, media_plan.kinds(), now);

        // Step 7: commit
        match self.sessions.commit(session) {
            Ok(CommitStatus::Persisted) => {}
            Ok(CommitStatus::PendingRetry { next_attempt_at }) => {
                warn!(
                    conversation_id = %conversation_id,
                    %next_attempt_at,
                    "Session kept in memory until the store write succeeds"
                );
            }
            Err(e) => {
                self.sessions.discard_checkout(&conversation_id);
                self.fingerprints.forget(&message.fingerprint);
                return Err(e.into());
            }
        }

        // Step 8: release. A mismatch is a coordination bug, not fatal.
        let _ = permit.release();

        if let Some(delay) = media_plan.delayed_video {
            let due_at = saturating_add(now, to_chrono(std::time::Duration::from_secs(delay)));
            self.media_queue
                .schedule(&conversation_id, MediaKind::DelayedVideo, due_at);
        }

        let decision = Decision {
            conversation_id: conversation_id.clone(),
            intent: route.intent,
            rule_id: route.rule_id,
            reply_text: route.reply_text,
            media_plan,
            reply_source: route.reply_source,
            route_reason: route.route_reason,
            target_store: route.target_store,
        };

        if let Some(journal) = &self.journal {
            journal.record(
                &conversation_id,
                message.received_at,
                &JournalEvent::UserMessage {
                    text: message.text.clone(),
                },
            );
            journal.record(
                &conversation_id,
                now,
                &JournalEvent::Decision {
                    decision: decision.clone(),
                },
            );
        }

        info!(
            conversation_id = %conversation_id,
            intent = decision.intent.label(),
            reply_source = decision.reply_source.label(),
            route_reason = %decision.route_reason,
            rule_id = ?decision.rule_id,
            address_image = decision.media_plan.address_image,
            contact_image = decision.media_plan.contact_image,
            delayed_video = ?decision.media_plan.delayed_video,
            "Decision made"
        );

        // Step 9
        Ok(HandleOutcome::Replied(decision))
    }

    /// Forget a conversation: session, pending deferred media.
    ///
    /// Fails without touching anything while a cycle holds the session.
    pub fn reset(&self, conversation_id: &str) -> Result<(), PipelineError> {
        let status = self.sessions.reset(conversation_id)?;
        if let CommitStatus::PendingRetry { next_attempt_at } = status {
            warn!(
                conversation_id,
                %next_attempt_at,
                "Reset kept in memory until the store write succeeds"
            );
        }
        self.cancel_media(conversation_id);
        Ok(())
    }

    /// Cancel deferred media for a conversation, journaling each one.
    pub fn cancel_media(&self, conversation_id: &str) -> usize {
        let cancelled = self.media_queue.cancel_conversation(conversation_id);
        if let Some(journal) = &self.journal {
            let now = self.clock.now();
            for entry in &cancelled {
                journal.record(
                    conversation_id,
                    now,
                    &JournalEvent::MediaCancelled { kind: entry.kind },
                );
            }
        }
        cancelled.len()
    }

    fn abort_cycle(&self, message: &Message) -> HandleOutcome {
        self.sessions.discard_checkout(&message.conversation_id);
        self.fingerprints.forget(&message.fingerprint);
        // Media scheduled by earlier committed cycles stays queued.
        warn!(
            conversation_id = %message.conversation_id,
            "Decision cycle aborted, message left for retry"
        );
        HandleOutcome::Aborted
    }

    fn record_turns(
        &self,
        session: &mut Session,
        message: &Message,
        route: &Route,
        media: Vec<MediaKind>,
        now: DateTime<Utc>,
    ) {
        session.push_turn(Turn::user(&message.text, message.received_at), self.history_limit);
        session.push_turn(Turn::agent(&route.reply_text, now, media), self.history_limit);

        session.set_fact(facts::LAST_INTENT, route.intent.label());
        session.set_fact(facts::LAST_ROUTE_REASON, route.route_reason.as_str());
        match &route.rule_id {
            Some(rule_id) => session.set_fact(facts::LAST_RULE_ID, rule_id.as_str()),
            None => {
                session.facts.remove(facts::LAST_RULE_ID);
            }
        }
        if let Some(store) = &route.target_store {
            session.set_fact(facts::LAST_TARGET_STORE, store.as_str());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::TimeZone;

    use crate::clock::{Clock, ManualClock};
    use crate::error::GenerativeError;
    use crate::knowledge::KnowledgeEntry;
    use crate::pipeline::abort::abort_pair;
    use crate::pipeline::types::{Intent, ReplySource};

    struct SlowGateway(Duration);

    #[async_trait]
    impl GenerativeGateway for SlowGateway {
        fn model_name(&self) -> &str {
            "slow"
        }

        async fn generate(&self, _context: &[Turn], _text: &str) -> Result<String, GenerativeError> {
            tokio::time::sleep(self.0).await;
            Ok("姐姐这款很适合您🌹".into())
        }
    }

    fn setup(
        gateway: Option<Arc<dyn GenerativeGateway>>,
    ) -> (ReplyCoordinator, ManualClock, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let config = AgentConfig {
            data_dir: tmp.path().to_path_buf(),
            ..AgentConfig::default()
        };
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap());
        let knowledge = Arc::new(KnowledgeBase::from_entries(vec![KnowledgeEntry::new(
            1,
            &["发货时间", "多久发货"],
            "48小时内发货",
            1,
        )]));
        let coordinator =
            ReplyCoordinator::new(&config, knowledge, gateway, Arc::new(clock.clone())).unwrap();
        (coordinator, clock, tmp)
    }

    #[tokio::test]
    async fn address_message_plans_image() {
        let (coordinator, _clock, _tmp) = setup(None);
        let outcome = coordinator
            .handle(coordinator.message("c1", "地址在哪里"))
            .await
            .unwrap();
        let decision = outcome.decision().unwrap();
        assert_eq!(decision.intent, Intent::Address);
        assert!(decision.media_plan.address_image);
        assert!(!coordinator.guard().is_busy());

        let session = coordinator.sessions().get("c1").unwrap();
        assert_eq!(session.history.len(), 2);
        assert_eq!(session.fact(facts::LAST_INTENT), Some("address"));
        assert_eq!(session.fact(facts::LAST_RULE_ID), Some("ADDR_DEFAULT"));
        assert_eq!(session.history[1].media_refs.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_is_rejected() {
        let (coordinator, _clock, _tmp) = setup(None);
        let first = coordinator.message("c1", "多久发货");
        let second = coordinator.message("c1", "多久发货");
        assert!(matches!(
            coordinator.handle(first).await.unwrap(),
            HandleOutcome::Replied(_)
        ));
        assert!(matches!(
            coordinator.handle(second).await.unwrap(),
            HandleOutcome::Rejected
        ));
        assert_eq!(coordinator.sessions().get("c1").unwrap().history.len(), 2);
    }

    #[tokio::test]
    async fn busy_guard_defers_and_resubmission_succeeds() {
        let (coordinator, _clock, _tmp) = setup(None);
        let held = coordinator.guard().acquire().unwrap();

        let message = coordinator.message("c2", "多久发货");
        assert!(matches!(
            coordinator.handle(message.clone()).await.unwrap(),
            HandleOutcome::Deferred
        ));

        coordinator.guard().release(held).unwrap();
        let outcome = coordinator.handle(message).await.unwrap();
        assert_eq!(outcome.decision().unwrap().intent, Intent::Knowledge);
    }

    #[tokio::test]
    async fn second_address_message_skips_image() {
        let (coordinator, clock, _tmp) = setup(None);
        coordinator
            .handle(coordinator.message("c1", "地址在哪里"))
            .await
            .unwrap();
        clock.advance(chrono::Duration::minutes(5));
        let outcome = coordinator
            .handle(coordinator.message("c1", "门店怎么走"))
            .await
            .unwrap();
        let decision = outcome.decision().unwrap();
        assert_eq!(decision.intent, Intent::Address);
        assert!(!decision.media_plan.address_image);
    }

    #[tokio::test]
    async fn video_trigger_schedules_deferred_send() {
        let (coordinator, clock, _tmp) = setup(None);
        let outcome = coordinator
            .handle(coordinator.message("c1", "有佩戴效果视频吗"))
            .await
            .unwrap();
        assert_eq!(outcome.decision().unwrap().media_plan.delayed_video, Some(8));
        assert_eq!(coordinator.media_queue().pending_for("c1"), 1);

        let due = coordinator
            .media_queue()
            .take_due(clock.now() + chrono::Duration::seconds(8));
        assert_eq!(due.len(), 1);
    }

    #[tokio::test]
    async fn abort_releases_guard_and_reopens_admission() {
        let (coordinator, _clock, _tmp) = setup(Some(Arc::new(SlowGateway(Duration::from_secs(5)))));
        let (handle, signal) = abort_pair();
        let message = coordinator.message("c1", "这款是什么材质");

        let cycle = coordinator.handle_with_abort(message.clone(), &signal);
        let abort = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.abort();
        };
        let (outcome, ()) = tokio::join!(cycle, abort);

        assert!(matches!(outcome.unwrap(), HandleOutcome::Aborted));
        assert!(!coordinator.guard().is_busy());
        assert!(coordinator.sessions().get("c1").is_none());

        // Checkout was discarded and the fingerprint reopened for a retry.
        assert!(coordinator.sessions().get_or_create("c1").is_ok());
        assert!(coordinator.fingerprints.admit(&message));
    }

    #[tokio::test]
    async fn abort_keeps_video_from_committed_cycle() {
        let (coordinator, clock, _tmp) = setup(Some(Arc::new(SlowGateway(Duration::from_secs(5)))));
        let outcome = coordinator
            .handle(coordinator.message("c1", "门店地址发我，有真人视频吗"))
            .await
            .unwrap();
        assert_eq!(outcome.decision().unwrap().media_plan.delayed_video, Some(8));
        let scheduled_at = clock.now();

        clock.advance(chrono::Duration::seconds(1));
        let (handle, signal) = abort_pair();
        let cycle = coordinator.handle_with_abort(coordinator.message("c1", "这款是什么材质"), &signal);
        let abort = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.abort();
        };
        let (outcome, ()) = tokio::join!(cycle, abort);
        assert!(matches!(outcome.unwrap(), HandleOutcome::Aborted));

        assert_eq!(coordinator.media_queue().pending_for("c1"), 1);
        let session = coordinator.sessions().get("c1").unwrap();
        assert!(session.flag(facts::VIDEO_SCHEDULED));
        let due = coordinator
            .media_queue()
            .take_due(scheduled_at + chrono::Duration::seconds(8));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].kind, MediaKind::DelayedVideo);
    }

    #[tokio::test]
    async fn oversized_video_delay_does_not_panic() {
        let tmp = tempfile::tempdir().unwrap();
        let config = AgentConfig {
            data_dir: tmp.path().to_path_buf(),
            video_delay_secs: u64::MAX,
            ..AgentConfig::default()
        };
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap());
        let coordinator = ReplyCoordinator::new(
            &config,
            Arc::new(KnowledgeBase::empty()),
            None,
            Arc::new(clock.clone()),
        )
        .unwrap();

        coordinator
            .handle(coordinator.message("c1", "有真人视频吗"))
            .await
            .unwrap();
        assert_eq!(coordinator.media_queue().pending_for("c1"), 1);
        assert!(coordinator
            .media_queue()
            .take_due(clock.now() + chrono::Duration::days(365))
            .is_empty());
    }

    #[tokio::test]
    async fn reset_refused_while_session_checked_out() {
        let (coordinator, _clock, _tmp) = setup(None);
        coordinator
            .handle(coordinator.message("c1", "有真人视频吗"))
            .await
            .unwrap();

        let held = coordinator.sessions().get_or_create("c1").unwrap();
        assert!(matches!(
            coordinator.reset("c1"),
            Err(PipelineError::SessionStore(
                crate::error::SessionStoreError::AlreadyCheckedOut { .. }
            ))
        ));
        assert_eq!(coordinator.media_queue().pending_for("c1"), 1);

        coordinator.sessions().commit(held).unwrap();
        coordinator.reset("c1").unwrap();
        assert_eq!(coordinator.media_queue().pending_for("c1"), 0);
    }

    #[tokio::test]
    async fn timeout_uses_fallback_and_commits() {
        let tmp = tempfile::tempdir().unwrap();
        let config = AgentConfig {
            data_dir: tmp.path().to_path_buf(),
            generative_timeout: Duration::from_millis(20),
            ..AgentConfig::default()
        };
        let coordinator = ReplyCoordinator::new(
            &config,
            Arc::new(KnowledgeBase::empty()),
            Some(Arc::new(SlowGateway(Duration::from_secs(5)))),
            Arc::new(ManualClock::new(Utc::now())),
        )
        .unwrap();

        let outcome = coordinator
            .handle(coordinator.message("c1", "这款是什么材质"))
            .await
            .unwrap();
        let decision = outcome.decision().unwrap();
        assert_eq!(decision.reply_source, ReplySource::Fallback);
        assert_eq!(decision.route_reason, "generative_timeout");
        assert_eq!(
            coordinator.sessions().get("c1").unwrap().fact(facts::LAST_ROUTE_REASON),
            Some("generative_timeout")
        );
    }

    #[tokio::test]
    async fn reset_clears_session_and_media() {
        let (coordinator, _clock, _tmp) = setup(None);
        coordinator
            .handle(coordinator.message("c1", "有真人视频吗"))
            .await
            .unwrap();
        assert_eq!(coordinator.media_queue().pending_for("c1"), 1);

        coordinator.reset("c1").unwrap();
        assert!(coordinator.sessions().get("c1").is_none());
        assert_eq!(coordinator.media_queue().pending_for("c1"), 0);
    }

    #[tokio::test]
    async fn journal_records_cycle() {
        let tmp = tempfile::tempdir().unwrap();
        let config = AgentConfig {
            data_dir: tmp.path().to_path_buf(),
            ..AgentConfig::default()
        };
        let coordinator = ReplyCoordinator::new(
            &config,
            Arc::new(KnowledgeBase::empty()),
            None,
            Arc::new(ManualClock::new(Utc::now())),
        )
        .unwrap()
        .with_journal(ConversationJournal::new(config.journal_dir()));

        coordinator
            .handle(coordinator.message("c1", "地址在哪里"))
            .await
            .unwrap();
        let path = coordinator.journal().unwrap().file_for("c1");
        let raw = std::fs::read_to_string(path).unwrap();
        assert_eq!(raw.lines().count(), 2);
    }
}
