//! Automation surface: the remote chat page the engine reads from and
//! replies through.
//!
//! The engine never touches the page directly. It polls for unread
//! conversations, fetches transcripts, and hands decisions back as text and
//! media sends.

pub mod cli;
pub mod memory;

pub use cli::{CliSimulator, SimInput};
pub use memory::{MemorySurface, SentItem};

use async_trait::async_trait;

use crate::error::SurfaceError;
use crate::pipeline::abort::AbortHandle;
use crate::pipeline::types::{MediaKind, Message};

/// External page automation collaborator.
#[async_trait]
pub trait AutomationSurface: Send + Sync {
    /// Surface name, for logs.
    fn name(&self) -> &str;

    /// Conversations with unread inbound messages.
    async fn poll_unread(&self) -> Result<Vec<String>, SurfaceError>;

    /// Inbound messages of a conversation, oldest first.
    async fn fetch_transcript(&self, conversation_id: &str) -> Result<Vec<Message>, SurfaceError>;

    /// Type and send a text reply.
    async fn send_text(&self, conversation_id: &str, text: &str) -> Result<(), SurfaceError>;

    /// Send one media attachment.
    async fn send_media(&self, conversation_id: &str, kind: MediaKind) -> Result<(), SurfaceError>;

    /// Register the abort for the cycle now running in `conversation_id`.
    ///
    /// The surface fires it if the page changes under the cycle. Surfaces
    /// that cannot detect that ignore the handle.
    fn abort_on_page_change(&self, _conversation_id: &str, _handle: AbortHandle) {}
}
