//! In-memory conversation sessions.
//!
//! Each session is an actor in miniature: its history lives behind its own
//! async mutex, so two requests for the same session id serialize while
//! different sessions run independently. Idle sessions are evicted on a
//! sweep; eviction only drops the manager's reference, so an in-flight run
//! that still holds the session keeps working and simply becomes the last
//! one to see it.

use crate::types::ChatMessage;
use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;
use uuid::Uuid;

/// Default idle timeout before a session is evicted.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(3600);

/// A resumable dialogue: ordered history plus bookkeeping timestamps.
#[derive(Debug)]
pub struct ConversationSession {
    pub id: String,
    pub messages: Vec<ChatMessage>,
    pub created_at: Instant,
    pub last_access: Instant,
}

impl ConversationSession {
    fn new(id: String) -> Self {
        let now = Instant::now();
        Self {
            id,
            messages: Vec::new(),
            created_at: now,
            last_access: now,
        }
    }

    /// Append messages and touch the access time.
    pub fn append(&mut self, messages: impl IntoIterator<Item = ChatMessage>) {
        self.messages.extend(messages);
        self.last_access = Instant::now();
    }
}

type SharedSession = Arc<Mutex<ConversationSession>>;

/// Process-wide owner of conversation sessions, keyed by opaque id.
pub struct SessionManager {
    sessions: StdMutex<HashMap<String, SharedSession>>,
    idle_timeout: Duration,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE_TIMEOUT)
    }
}

impl SessionManager {
    /// Manager with the given idle-eviction timeout.
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            sessions: StdMutex::new(HashMap::new()),
            idle_timeout,
        }
    }

    /// Fetch or create the session for `id`; `None` generates a fresh id.
    ///
    /// Every call sweeps idle sessions first, so the map never grows without
    /// bound.
    pub fn get_or_create(&self, id: Option<&str>) -> (String, SharedSession) {
        self.evict_idle();

        let id = match id {
            Some(id) => id.to_string(),
            None => Uuid::new_v4().to_string(),
        };

        let mut sessions = self.sessions.lock().expect("session map lock poisoned");
        let session = sessions
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(ConversationSession::new(id.clone()))))
            .clone();
        (id, session)
    }

    /// Lock a session for exclusive use across an entire run.
    ///
    /// The owned guard serializes concurrent requests for the same id: the
    /// later caller queues here until the earlier run commits its messages.
    pub async fn acquire(&self, id: Option<&str>) -> (String, OwnedMutexGuard<ConversationSession>) {
        let (id, session) = self.get_or_create(id);
        let mut guard = session.lock_owned().await;
        guard.last_access = Instant::now();
        (id, guard)
    }

    /// Compose the message list for a new ask:
    /// `[system_prompt, ...previous_messages, user(ask)]`.
    ///
    /// The composed list is a copy; the loop runs on it and the caller
    /// appends the outcome back via the held guard.
    pub fn build(
        session: &ConversationSession,
        system_prompt: &str,
        ask: &str,
    ) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(session.messages.len() + 2);
        messages.push(ChatMessage::system(system_prompt));
        messages.extend(session.messages.iter().cloned());
        messages.push(ChatMessage::user(ask));
        messages
    }

    /// Append messages to a session, creating it if needed.
    pub async fn append(&self, id: &str, messages: impl IntoIterator<Item = ChatMessage>) {
        let (_, mut guard) = self.acquire(Some(id)).await;
        guard.append(messages);
    }

    /// Drop a session outright.
    pub fn clear(&self, id: &str) {
        let mut sessions = self.sessions.lock().expect("session map lock poisoned");
        sessions.remove(id);
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .expect("session map lock poisoned")
            .len()
    }

    /// Whether no sessions are live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop sessions idle past the timeout. In-flight runs are unaffected:
    /// they hold their own `Arc` to the session.
    pub fn evict_idle(&self) {
        let mut sessions = self.sessions.lock().expect("session map lock poisoned");
        let before = sessions.len();
        sessions.retain(|_, session| {
            // A locked session is in use; try_lock failing means keep it.
            match session.try_lock() {
                Ok(guard) => guard.last_access.elapsed() < self.idle_timeout,
                Err(_) => true,
            }
        });
        let evicted = before - sessions.len();
        if evicted > 0 {
            debug!(evicted, "evicted idle sessions");
        }
    }
}
