//! Reply pipeline.
//!
//! Every inbound message flows through:
//! 1. `FingerprintStore::admit()`: exactly-once admission
//! 2. `ConcurrencyGuard::acquire()`: one decision cycle system-wide
//! 3. `IntentRouter::route()`: address rules, knowledge match, contact rules, generative fallback
//! 4. `MediaPlanner::plan_route()`: attachments with per-session suppression
//! 5. `SessionStore::commit()`: crash-safe persistence
//!
//! `ReplyCoordinator` composes these; `ReplyScheduler` feeds it from the
//! automation surface.

pub mod abort;
pub mod coordinator;
pub mod dedup;
pub mod deferred;
pub mod guard;
pub mod media;
pub mod router;
pub mod rules;
pub mod scheduler;
pub mod text;
pub mod types;

pub use abort::{AbortHandle, AbortSignal, abort_pair};
pub use coordinator::ReplyCoordinator;
pub use scheduler::{ReplyScheduler, TickReport, spawn_poll_loop};
pub use types::{Decision, HandleOutcome, Intent, MediaKind, MediaPlan, Message, ReplySource};
