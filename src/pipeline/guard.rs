//! Single-flight concurrency guard.
//!
//! The automation surface can only be inside one conversation at a time, so
//! at most one decision cycle may run system-wide. The guard hands out one
//! ticket; `acquire` never blocks.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, error};

use crate::error::GuardError;

/// Proof of holding the guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket {
    id: u64,
}

impl Ticket {
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Single-slot admission control.
pub struct ConcurrencyGuard {
    slot: Mutex<Option<u64>>,
    next_id: AtomicU64,
}

impl ConcurrencyGuard {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Take the slot, or report `Busy` if a ticket is outstanding.
    pub fn acquire(&self) -> Result<Ticket, GuardError> {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(held) = *slot {
            return Err(GuardError::Busy { held });
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        *slot = Some(id);
        debug!(ticket = id, "Guard acquired");
        Ok(Ticket { id })
    }

    /// Give the slot back.
    ///
    /// Releasing a ticket that is not the outstanding one is a coordination
    /// bug: it is logged and reported, and the slot is left untouched.
    pub fn release(&self, ticket: Ticket) -> Result<(), GuardError> {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if *slot == Some(ticket.id) {
            *slot = None;
            debug!(ticket = ticket.id, "Guard released");
            return Ok(());
        }
        error!(
            ticket = ticket.id,
            outstanding = ?*slot,
            "Guard release mismatch"
        );
        Err(GuardError::ReleaseMismatch {
            ticket: ticket.id,
            outstanding: *slot,
        })
    }

    /// Acquire a permit that releases the ticket when dropped.
    pub fn acquire_permit(&self) -> Result<GuardPermit<'_>, GuardError> {
        let ticket = self.acquire()?;
        Ok(GuardPermit {
            guard: self,
            ticket: Some(ticket),
        })
    }

    pub fn is_busy(&self) -> bool {
        self.outstanding().is_some()
    }

    /// The outstanding ticket id, if any.
    pub fn outstanding(&self) -> Option<u64> {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ConcurrencyGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Scoped hold on the guard. Dropping it releases the ticket, so every exit
/// path of a decision cycle (error, abort, cancelled future) frees the slot.
pub struct GuardPermit<'a> {
    guard: &'a ConcurrencyGuard,
    ticket: Option<Ticket>,
}

impl GuardPermit<'_> {
    pub fn ticket(&self) -> Option<Ticket> {
        self.ticket
    }

    /// Release now and surface any mismatch.
    pub fn release(mut self) -> Result<(), GuardError> {
        match self.ticket.take() {
            Some(ticket) => self.guard.release(ticket),
            None => Ok(()),
        }
    }
}

impl Drop for GuardPermit<'_> {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            let _ = self.guard.release(ticket);
        }
    }
}
