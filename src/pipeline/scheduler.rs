//! Cooperative scheduler: drives the coordinator from the automation
//! surface, one explicit `tick` at a time.
//!
//! Each tick:
//! 1. retries a failed session-store write whose backoff elapsed
//! 2. fires due deferred media that were not cancelled
//! 3. resubmits deferred messages in arrival order, stopping at the first
//!    one that is still deferred
//! 4. polls for unread conversations and handles each latest message
//!
//! Time comes from the coordinator's clock, so tests step through ticks
//! without real timers.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channels::AutomationSurface;
use crate::error::PipelineError;
use crate::journal::JournalEvent;
use crate::pipeline::abort::abort_pair;
use crate::pipeline::coordinator::ReplyCoordinator;
use crate::pipeline::types::{Decision, HandleOutcome, Message};
use crate::store::CommitStatus;

/// What one tick did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// Result of a retried store write, if one was due.
    pub store_flush: Option<CommitStatus>,
    pub media_sent: usize,
    pub media_skipped: usize,
    pub resubmitted: usize,
    pub polled: usize,
    pub replied: usize,
    pub deferred: usize,
    pub rejected: usize,
    pub aborted: usize,
    pub failed: usize,
}

impl TickReport {
    fn count(&mut self, outcome: &HandleOutcome) {
        match outcome {
            HandleOutcome::Replied(_) => self.replied += 1,
            HandleOutcome::Deferred => self.deferred += 1,
            HandleOutcome::Rejected => self.rejected += 1,
            HandleOutcome::Aborted => self.aborted += 1,
        }
    }
}

/// Polls the surface and runs decision cycles.
pub struct ReplyScheduler {
    coordinator: Arc<ReplyCoordinator>,
    surface: Arc<dyn AutomationSurface>,
    pending: Mutex<VecDeque<Message>>,
}

impl ReplyScheduler {
    pub fn new(coordinator: Arc<ReplyCoordinator>, surface: Arc<dyn AutomationSurface>) -> Self {
        Self {
            coordinator,
            surface,
            pending: Mutex::new(VecDeque::new()),
        }
    }

    pub fn coordinator(&self) -> &Arc<ReplyCoordinator> {
        &self.coordinator
    }

    /// Queue a message that came back `Deferred`.
    pub async fn defer(&self, message: Message) {
        self.pending.lock().await.push_back(message);
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Run one scheduling pass.
    pub async fn tick(&self) -> Result<TickReport, PipelineError> {
        let mut report = TickReport {
            store_flush: self.coordinator.sessions().flush_pending(),
            ..TickReport::default()
        };

        self.fire_due_media(&mut report).await;
        self.resubmit_deferred(&mut report).await?;
        self.poll_surface(&mut report).await?;

        if report != TickReport::default() {
            debug!(?report, "Tick complete");
        }
        Ok(report)
    }

    async fn fire_due_media(&self, report: &mut TickReport) {
        let now = self.coordinator.clock().now();
        for entry in self.coordinator.media_queue().take_due(now) {
            if entry.is_cancelled() {
                report.media_skipped += 1;
                continue;
            }
            match self
                .surface
                .send_media(&entry.conversation_id, entry.kind)
                .await
            {
                Ok(()) => {
                    report.media_sent += 1;
                    info!(
                        conversation_id = %entry.conversation_id,
                        kind = entry.kind.label(),
                        "Deferred media sent"
                    );
                    if let Some(journal) = self.coordinator.journal() {
                        journal.record(
                            &entry.conversation_id,
                            now,
                            &JournalEvent::MediaSent { kind: entry.kind },
                        );
                    }
                }
                Err(e) => {
                    warn!(
                        conversation_id = %entry.conversation_id,
                        kind = entry.kind.label(),
                        error = %e,
                        "Deferred media send failed"
                    );
                }
            }
        }
    }

    async fn resubmit_deferred(&self, report: &mut TickReport) -> Result<(), PipelineError> {
        loop {
            let Some(message) = self.pending.lock().await.front().cloned() else {
                return Ok(());
            };
            let outcome = self.run_cycle(message).await;
            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(e) => {
                    // Drop the message rather than wedge the queue on it.
                    self.pending.lock().await.pop_front();
                    report.failed += 1;
                    error!(error = %e, "Deferred message failed");
                    continue;
                }
            };
            report.count(&outcome);
            if matches!(outcome, HandleOutcome::Deferred) {
                return Ok(());
            }
            self.pending.lock().await.pop_front();
            report.resubmitted += 1;
        }
    }

    async fn poll_surface(&self, report: &mut TickReport) -> Result<(), PipelineError> {
        let conversations = self.surface.poll_unread().await?;
        report.polled = conversations.len();

        for conversation_id in conversations {
            let transcript = match self.surface.fetch_transcript(&conversation_id).await {
                Ok(transcript) => transcript,
                Err(e) => {
                    report.failed += 1;
                    warn!(conversation_id = %conversation_id, error = %e, "Transcript fetch failed");
                    continue;
                }
            };
            let Some(latest) = transcript.last() else {
                continue;
            };
            let message =
                self.coordinator
                    .message_at(&conversation_id, &latest.text, latest.received_at);

            // Keep arrival order: never overtake messages already waiting.
            if self.pending_len().await > 0 {
                report.count(&HandleOutcome::Deferred);
                self.defer(message).await;
                continue;
            }

            match self.run_cycle(message.clone()).await {
                Ok(HandleOutcome::Deferred) => {
                    report.count(&HandleOutcome::Deferred);
                    self.defer(message).await;
                }
                Ok(outcome) => report.count(&outcome),
                Err(e) => {
                    report.failed += 1;
                    error!(conversation_id = %conversation_id, error = %e, "Decision cycle failed");
                }
            }
        }
        Ok(())
    }

    /// One decision cycle with abort wiring, then execute the decision.
    async fn run_cycle(&self, message: Message) -> Result<HandleOutcome, PipelineError> {
        let (handle, signal) = abort_pair();
        self.surface
            .abort_on_page_change(&message.conversation_id, handle);
        let outcome = self.coordinator.handle_with_abort(message, &signal).await?;
        if let HandleOutcome::Replied(decision) = &outcome {
            self.execute(decision).await;
        }
        Ok(outcome)
    }

    /// Send the reply text, then immediate media in plan order.
    async fn execute(&self, decision: &Decision) {
        let conversation_id = &decision.conversation_id;
        if let Err(e) = self
            .surface
            .send_text(conversation_id, &decision.reply_text)
            .await
        {
            warn!(conversation_id = %conversation_id, error = %e, "Reply send failed");
            return;
        }

        for kind in decision.media_plan.immediate() {
            match self.surface.send_media(conversation_id, kind).await {
                Ok(()) => {
                    if let Some(journal) = self.coordinator.journal() {
                        journal.record(
                            conversation_id,
                            self.coordinator.clock().now(),
                            &JournalEvent::MediaSent { kind },
                        );
                    }
                }
                Err(e) => {
                    warn!(
                        conversation_id = %conversation_id,
                        kind = kind.label(),
                        error = %e,
                        "Media send failed"
                    );
                }
            }
        }
    }
}

/// Drive `tick` on a fixed interval until the task is aborted.
pub fn spawn_poll_loop(scheduler: Arc<ReplyScheduler>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_ms = every.as_millis() as u64, "Poll loop started");
        loop {
            interval.tick().await;
            if let Err(e) = scheduler.tick().await {
                warn!(error = %e, "Scheduler tick failed");
            }
        }
    })
}
