//! JSON-file session store.
//!
//! All sessions live in memory and are written as one JSON object keyed by
//! conversation id. Writes go to a temp file that is renamed over the store,
//! so a crash mid-write leaves the previous file intact. A failed write is
//! retried with exponential backoff; until it succeeds the in-memory state is
//! authoritative.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::clock::{SharedClock, saturating_add, to_chrono};
use crate::config::AgentConfig;
use crate::error::SessionStoreError;
use crate::store::session::{Session, SessionState};

/// Result of a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStatus {
    /// Written to disk.
    Persisted,
    /// Kept in memory; the write will be retried at `next_attempt_at`.
    PendingRetry { next_attempt_at: DateTime<Utc> },
}

#[derive(Debug, Clone, Copy)]
struct RetryState {
    attempts: u32,
    next_attempt_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Session>,
    checked_out: HashSet<String>,
    retry: Option<RetryState>,
}

/// Store tuning, usually taken from [`AgentConfig`].
#[derive(Debug, Clone)]
pub struct SessionStoreOptions {
    pub ttl: Duration,
    pub history_limit: usize,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl From<&AgentConfig> for SessionStoreOptions {
    fn from(config: &AgentConfig) -> Self {
        Self {
            ttl: config.session_ttl,
            history_limit: config.history_limit,
            retry_base: config.store_retry_base,
            retry_max: config.store_retry_max,
        }
    }
}

/// Persistent, expiring per-conversation memory.
pub struct SessionStore {
    path: PathBuf,
    options: SessionStoreOptions,
    clock: SharedClock,
    inner: Mutex<Inner>,
}

impl SessionStore {
    /// Open the store at `path`.
    ///
    /// A missing file starts empty. An unreadable or corrupt file also
    /// starts empty, with a warning; it is overwritten on the next commit.
    /// Expired sessions are pruned.
    pub fn load(path: impl AsRef<Path>, options: SessionStoreOptions, clock: SharedClock) -> Self {
        let path = path.as_ref().to_path_buf();
        let now = clock.now();

        let mut sessions = match read_sessions(&path) {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!(error = %e, "Session store unreadable, starting empty");
                HashMap::new()
            }
        };

        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired(now));
        for session in sessions.values_mut() {
            session.trim_history(options.history_limit);
        }
        info!(
            path = %path.display(),
            sessions = sessions.len(),
            pruned = before - sessions.len(),
            "Session store loaded"
        );

        Self {
            path,
            options,
            clock,
            inner: Mutex::new(Inner {
                sessions,
                ..Inner::default()
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Check out a session for one decision cycle.
    ///
    /// Absent or expired sessions come back fresh. The copy must be handed
    /// back through [`commit`](Self::commit) or
    /// [`discard_checkout`](Self::discard_checkout).
    pub fn get_or_create(&self, conversation_id: &str) -> Result<Session, SessionStoreError> {
        let now = self.clock.now();
        let mut inner = self.lock();
        if inner.checked_out.contains(conversation_id) {
            return Err(SessionStoreError::AlreadyCheckedOut {
                id: conversation_id.to_string(),
            });
        }

        let mut session = match inner.sessions.get(conversation_id) {
            Some(existing) if !existing.is_expired(now) => existing.clone(),
            Some(_) => {
                debug!(conversation_id, "Session expired, starting fresh");
                Session::new(conversation_id, now, to_chrono(self.options.ttl))
            }
            None => Session::new(conversation_id, now, to_chrono(self.options.ttl)),
        };
        session.id = conversation_id.to_string();
        session.state = SessionState::Deciding;
        inner.checked_out.insert(conversation_id.to_string());
        Ok(session)
    }

    /// Read-only copy of a live session.
    pub fn get(&self, conversation_id: &str) -> Option<Session> {
        let now = self.clock.now();
        self.lock()
            .sessions
            .get(conversation_id)
            .filter(|s| !s.is_expired(now))
            .cloned()
            .map(|mut s| {
                s.id = conversation_id.to_string();
                s
            })
    }

    /// Merge a checked-out session back and persist the store.
    ///
    /// Write failures do not fail the commit: the session is kept in memory
    /// and the write is scheduled for retry.
    pub fn commit(&self, mut session: Session) -> Result<CommitStatus, SessionStoreError> {
        let now = self.clock.now();
        let mut inner = self.lock();
        if !inner.checked_out.remove(&session.id) {
            return Err(SessionStoreError::NotCheckedOut { id: session.id });
        }

        session.touch(now, to_chrono(self.options.ttl));
        session.trim_history(self.options.history_limit);
        session.state = SessionState::Idle;
        inner.sessions.insert(session.id.clone(), session);

        Ok(self.persist(&mut inner, now))
    }

    /// Give up a checkout without changing the stored session.
    pub fn discard_checkout(&self, conversation_id: &str) -> bool {
        self.lock().checked_out.remove(conversation_id)
    }

    /// Forget a conversation entirely.
    ///
    /// Refused while a decision cycle holds the session, so the cycle's
    /// commit cannot be orphaned.
    pub fn reset(&self, conversation_id: &str) -> Result<CommitStatus, SessionStoreError> {
        let now = self.clock.now();
        let mut inner = self.lock();
        if inner.checked_out.contains(conversation_id) {
            return Err(SessionStoreError::AlreadyCheckedOut {
                id: conversation_id.to_string(),
            });
        }
        if inner.sessions.remove(conversation_id).is_some() {
            info!(conversation_id, "Session reset");
        }
        Ok(self.persist(&mut inner, now))
    }

    /// Retry a failed write if its backoff has elapsed.
    ///
    /// Returns `None` when no write is pending or it is not yet due.
    pub fn flush_pending(&self) -> Option<CommitStatus> {
        let now = self.clock.now();
        let mut inner = self.lock();
        match inner.retry {
            Some(retry) if retry.next_attempt_at <= now => Some(self.persist(&mut inner, now)),
            _ => None,
        }
    }

    pub fn has_pending_write(&self) -> bool {
        self.lock().retry.is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn persist(&self, inner: &mut Inner, now: DateTime<Utc>) -> CommitStatus {
        match write_sessions(&self.path, &inner.sessions) {
            Ok(()) => {
                if let Some(retry) = inner.retry.take() {
                    info!(attempts = retry.attempts, "Session store write recovered");
                }
                CommitStatus::Persisted
            }
            Err(e) => {
                let attempts = inner.retry.map(|r| r.attempts).unwrap_or(0) + 1;
                let delay = backoff(self.options.retry_base, self.options.retry_max, attempts);
                let next_attempt_at = saturating_add(now, to_chrono(delay));
                warn!(
                    error = %e,
                    attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    "Session store write failed, will retry"
                );
                inner.retry = Some(RetryState {
                    attempts,
                    next_attempt_at,
                });
                CommitStatus::PendingRetry { next_attempt_at }
            }
        }
    }
}

/// Delay before retry number `attempt` (1-based).
fn backoff(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.checked_mul(factor).unwrap_or(max).min(max)
}

fn read_sessions(path: &Path) -> Result<HashMap<String, Session>, SessionStoreError> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let raw = fs::read_to_string(path).map_err(|e| SessionStoreError::Corrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    if raw.trim().is_empty() {
        return Ok(HashMap::new());
    }
    let value: serde_json::Value =
        serde_json::from_str(&raw).map_err(|e| SessionStoreError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    let serde_json::Value::Object(map) = value else {
        return Err(SessionStoreError::Corrupt {
            path: path.to_path_buf(),
            reason: "top level is not an object".into(),
        });
    };

    let mut sessions = HashMap::with_capacity(map.len());
    for (id, record) in map {
        match serde_json::from_value::<Session>(record) {
            Ok(mut session) => {
                session.id = id.clone();
                sessions.insert(id, session);
            }
            Err(e) => {
                warn!(conversation_id = %id, error = %e, "Skipping unreadable session record");
            }
        }
    }
    Ok(sessions)
}

fn write_sessions(
    path: &Path,
    sessions: &HashMap<String, Session>,
) -> Result<(), SessionStoreError> {
    let write_err = |e: std::io::Error| SessionStoreError::Write {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(write_err)?;
    }

    let ordered: BTreeMap<&String, &Session> = sessions.iter().collect();
    let temp_path = path.with_extension("json.tmp");
    {
        let file = File::create(&temp_path).map_err(write_err)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &ordered)?;
        writer.flush().map_err(write_err)?;
        writer.get_ref().sync_all().map_err(write_err)?;
    }
    fs::rename(&temp_path, path).map_err(write_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::TimeZone;

    use crate::clock::{Clock, ManualClock};
    use crate::store::session::{Turn, facts};

    fn options() -> SessionStoreOptions {
        SessionStoreOptions {
            ttl: Duration::from_secs(30 * 24 * 3600),
            history_limit: 4,
            retry_base: Duration::from_millis(500),
            retry_max: Duration::from_secs(60),
        }
    }

    fn clock() -> ManualClock {
        ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap())
    }

    #[test]
    fn commit_survives_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("agent_memory.json");
        let clock = clock();

        let store = SessionStore::load(&path, options(), Arc::new(clock.clone()));
        let mut session = store.get_or_create("c1").unwrap();
        session.set_flag(facts::ADDRESS_IMAGE_SENT);
        session.push_turn(Turn::user("地址在哪里", clock.now()), 4);
        assert_eq!(store.commit(session).unwrap(), CommitStatus::Persisted);

        let reloaded = SessionStore::load(&path, options(), Arc::new(clock.clone()));
        let session = reloaded.get("c1").unwrap();
        assert!(session.flag(facts::ADDRESS_IMAGE_SENT));
        assert_eq!(session.history.len(), 1);
        assert_eq!(session.id, "c1");
    }

    #[test]
    fn expired_session_comes_back_fresh() {
        let tmp = tempfile::tempdir().unwrap();
        let clock = clock();
        let store = SessionStore::load(tmp.path().join("m.json"), options(), Arc::new(clock.clone()));

        let mut session = store.get_or_create("c1").unwrap();
        session.set_fact(facts::LAST_INTENT, "address");
        store.commit(session).unwrap();

        clock.advance(chrono::Duration::days(31));
        assert!(store.get("c1").is_none());
        let fresh = store.get_or_create("c1").unwrap();
        assert!(fresh.facts.is_empty());
        assert!(fresh.history.is_empty());
        assert_eq!(fresh.created_at, clock.now());
    }

    #[test]
    fn load_prunes_expired() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("m.json");
        let clock = clock();
        let store = SessionStore::load(&path, options(), Arc::new(clock.clone()));
        let s = store.get_or_create("old").unwrap();
        store.commit(s).unwrap();
        clock.advance(chrono::Duration::days(20));
        let s = store.get_or_create("new").unwrap();
        store.commit(s).unwrap();

        clock.advance(chrono::Duration::days(15));
        let reloaded = SessionStore::load(&path, options(), Arc::new(clock.clone()));
        assert_eq!(reloaded.len(), 1);
        assert!(reloaded.get("new").is_some());
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("m.json");
        fs::write(&path, "{ not json").unwrap();
        let store = SessionStore::load(&path, options(), Arc::new(clock()));
        assert!(store.is_empty());

        // Next commit overwrites the corrupt file.
        let s = store.get_or_create("c1").unwrap();
        assert_eq!(store.commit(s).unwrap(), CommitStatus::Persisted);
        let raw = fs::read_to_string(&path).unwrap();
        assert!(serde_json::from_str::<serde_json::Value>(&raw).is_ok());
    }

    #[test]
    fn bad_record_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("m.json");
        fs::write(
            &path,
            r#"{
                "good": {"created_at": "2025-03-01T00:00:00Z", "last_active_at": "2025-03-01T00:00:00Z", "expires_at": "2025-03-20T00:00:00Z", "unknown": 1},
                "bad": {"created_at": 42}
            }"#,
        )
        .unwrap();
        let store = SessionStore::load(&path, options(), Arc::new(clock()));
        assert_eq!(store.len(), 1);
        assert!(store.get("good").is_some());
    }

    #[test]
    fn checkout_is_exclusive() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::load(tmp.path().join("m.json"), options(), Arc::new(clock()));
        let s = store.get_or_create("c1").unwrap();
        assert_eq!(s.state, SessionState::Deciding);
        assert!(matches!(
            store.get_or_create("c1"),
            Err(SessionStoreError::AlreadyCheckedOut { .. })
        ));
        assert!(store.discard_checkout("c1"));
        assert!(store.get_or_create("c1").is_ok());
    }

    #[test]
    fn commit_without_checkout_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let clock = clock();
        let store = SessionStore::load(tmp.path().join("m.json"), options(), Arc::new(clock.clone()));
        let session = Session::new("c1", clock.now(), chrono::Duration::days(1));
        assert!(matches!(
            store.commit(session),
            Err(SessionStoreError::NotCheckedOut { .. })
        ));
    }

    #[test]
    fn commit_caps_history() {
        let tmp = tempfile::tempdir().unwrap();
        let clock = clock();
        let store = SessionStore::load(tmp.path().join("m.json"), options(), Arc::new(clock.clone()));
        let mut s = store.get_or_create("c1").unwrap();
        for i in 0..10 {
            s.history.push(Turn::user(format!("m{i}"), clock.now()));
        }
        store.commit(s).unwrap();
        let s = store.get("c1").unwrap();
        assert_eq!(s.history.len(), 4);
        assert_eq!(s.history[0].text, "m6");
    }

    #[test]
    fn failed_write_retries_with_backoff() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("blocker");
        fs::write(&blocker, "file in the way").unwrap();
        let path = blocker.join("m.json");
        let clock = clock();
        let store = SessionStore::load(&path, options(), Arc::new(clock.clone()));

        let mut s = store.get_or_create("c1").unwrap();
        s.set_flag(facts::VIDEO_SCHEDULED);
        let status = store.commit(s).unwrap();
        assert_eq!(
            status,
            CommitStatus::PendingRetry {
                next_attempt_at: clock.now() + chrono::Duration::milliseconds(500)
            }
        );
        // Memory stays authoritative.
        assert!(store.get("c1").unwrap().flag(facts::VIDEO_SCHEDULED));
        assert!(store.flush_pending().is_none());

        clock.advance(chrono::Duration::milliseconds(500));
        let status = store.flush_pending().unwrap();
        assert_eq!(
            status,
            CommitStatus::PendingRetry {
                next_attempt_at: clock.now() + chrono::Duration::seconds(1)
            }
        );

        fs::remove_file(&blocker).unwrap();
        clock.advance(chrono::Duration::seconds(1));
        assert_eq!(store.flush_pending(), Some(CommitStatus::Persisted));
        assert!(!store.has_pending_write());
        assert!(path.exists());
    }

    #[test]
    fn reset_forgets_session() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("m.json");
        let store = SessionStore::load(&path, options(), Arc::new(clock()));
        let mut s = store.get_or_create("c1").unwrap();
        s.set_flag(facts::ADDRESS_IMAGE_SENT);
        store.commit(s).unwrap();

        assert_eq!(store.reset("c1").unwrap(), CommitStatus::Persisted);
        assert!(store.get("c1").is_none());
        let reloaded = SessionStore::load(&path, options(), Arc::new(clock()));
        assert!(reloaded.is_empty());
    }

    #[test]
    fn reset_waits_for_checkout() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::load(tmp.path().join("m.json"), options(), Arc::new(clock()));
        let mut s = store.get_or_create("c1").unwrap();
        s.set_flag(facts::ADDRESS_IMAGE_SENT);

        assert!(matches!(
            store.reset("c1"),
            Err(SessionStoreError::AlreadyCheckedOut { .. })
        ));
        // The cycle still owns its checkout and can commit.
        assert!(store.commit(s).is_ok());
        assert!(store.get("c1").unwrap().flag(facts::ADDRESS_IMAGE_SENT));

        store.reset("c1").unwrap();
        assert!(store.get("c1").is_none());
    }

    #[test]
    fn backoff_is_capped() {
        let base = Duration::from_millis(500);
        let max = Duration::from_secs(60);
        assert_eq!(backoff(base, max, 1), Duration::from_millis(500));
        assert_eq!(backoff(base, max, 3), Duration::from_secs(2));
        assert_eq!(backoff(base, max, 20), max);
        assert_eq!(backoff(base, max, 64), max);
    }
}
