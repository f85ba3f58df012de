//! Per-conversation message log.
//!
//! Every conversation key is owned by one worker task fed through an
//! mpsc mailbox, so requests for the same key are processed strictly in
//! arrival order while different keys proceed in parallel. A worker
//! hydrates its state from the record store on its first request and
//! persists every mutation before committing it in memory. A worker that
//! sees no request for its idle timeout exits; the next request for its key
//! spawns a fresh one that hydrates again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use parley_core::error::ParleyError;
use parley_core::types::{Message, Role, SessionSnapshot, UserContext};
use parley_storage::{RecordKey, RecordStore};

use crate::error::ChatError;

/// Default rolling window of stored messages per conversation.
pub const DEFAULT_CAPACITY: usize = 50;

const SCOPE: &str = "session";
const MESSAGES_RECORD: &str = "messages";
const USER_CONTEXT_RECORD: &str = "user_context";
const MAILBOX_CAPACITY: usize = 64;
const ACTOR_NAME: &str = "session log";

/// Default time a session worker stays alive without requests.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

type Reply<T> = oneshot::Sender<Result<T, ChatError>>;

enum Command {
    GetAll {
        reply: Reply<SessionSnapshot>,
    },
    Append {
        role: Role,
        content: String,
        reply: Reply<Message>,
    },
    AppendTurn {
        user: String,
        assistant: String,
        reply: Reply<(Message, Message)>,
    },
    MergeContext {
        partial: UserContext,
        reply: Reply<UserContext>,
    },
    Clear {
        reply: Reply<()>,
    },
}

/// Keyed, serialized access to conversation histories.
pub struct SessionLog {
    store: Arc<dyn RecordStore>,
    capacity: usize,
    idle_timeout: Duration,
    mailboxes: Mutex<HashMap<String, mpsc::Sender<Command>>>,
}

impl SessionLog {
    /// Create a log keeping at most `capacity` messages per conversation.
    pub fn new(store: Arc<dyn RecordStore>, capacity: usize) -> Self {
        Self {
            store,
            capacity: capacity.max(1),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            mailboxes: Mutex::new(HashMap::new()),
        }
    }

    /// Retire a key's worker after `idle` without requests.
    pub fn with_idle_timeout(mut self, idle: Duration) -> Self {
        self.idle_timeout = idle;
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of keys with a live worker.
    pub fn active_sessions(&self) -> usize {
        self.mailboxes
            .lock()
            .map(|mailboxes| mailboxes.values().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Messages and user context for `key`. Unknown keys yield empty state.
    pub async fn get_all(&self, key: &str) -> Result<SessionSnapshot, ChatError> {
        self.request(key, |reply| Command::GetAll { reply }).await
    }

    /// Messages for `key`, oldest first.
    pub async fn history(&self, key: &str) -> Result<Vec<Message>, ChatError> {
        Ok(self.get_all(key).await?.messages)
    }

    /// Append a message, evicting the oldest ones beyond the window.
    pub async fn append(&self, key: &str, role: Role, content: &str) -> Result<Message, ChatError> {
        if role == Role::System {
            return Err(ChatError::Validation(
                "system messages are not stored in a session log".to_string(),
            ));
        }
        let content = content.to_string();
        self.request(key, |reply| Command::Append {
            role,
            content,
            reply,
        })
        .await
    }

    /// Append a user message and the assistant reply as one unit: both are
    /// persisted in a single write or neither is stored.
    pub async fn append_turn(
        &self,
        key: &str,
        user: &str,
        assistant: &str,
    ) -> Result<(Message, Message), ChatError> {
        let user = user.to_string();
        let assistant = assistant.to_string();
        self.request(key, |reply| Command::AppendTurn {
            user,
            assistant,
            reply,
        })
        .await
    }

    /// Shallow-merge `partial` into the user context; returns the result.
    pub async fn merge_context(
        &self,
        key: &str,
        partial: UserContext,
    ) -> Result<UserContext, ChatError> {
        self.request(key, |reply| Command::MergeContext { partial, reply })
            .await
    }

    /// Drop every stored message for `key`. The user context is kept.
    pub async fn clear(&self, key: &str) -> Result<(), ChatError> {
        self.request(key, |reply| Command::Clear { reply }).await
    }

    async fn request<T>(
        &self,
        key: &str,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, ChatError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let mailbox = self.mailbox(key)?;
        if let Err(mpsc::error::SendError(command)) = mailbox.send(make(reply_tx)).await {
            // The worker retired between lookup and send; hand it to a new one.
            self.mailbox(key)?
                .send(command)
                .await
                .map_err(|_| ChatError::ActorUnavailable(ACTOR_NAME))?;
        }
        reply_rx
            .await
            .map_err(|_| ChatError::ActorUnavailable(ACTOR_NAME))?
    }

    /// Mailbox of the worker owning `key`, spawning it on first use.
    fn mailbox(&self, key: &str) -> Result<mpsc::Sender<Command>, ChatError> {
        let mut mailboxes = self
            .mailboxes
            .lock()
            .map_err(|_| ChatError::ActorUnavailable(ACTOR_NAME))?;
        if let Some(tx) = mailboxes.get(key).filter(|tx| !tx.is_closed()) {
            return Ok(tx.clone());
        }

        mailboxes.retain(|_, tx| !tx.is_closed());
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let worker = SessionWorker {
            key: key.to_string(),
            store: Arc::clone(&self.store),
            capacity: self.capacity,
            state: None,
        };
        tokio::spawn(worker.run(rx, self.idle_timeout));
        debug!(session_id = key, "Session worker started");
        mailboxes.insert(key.to_string(), tx.clone());
        Ok(tx)
    }
}

impl std::fmt::Debug for SessionLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLog")
            .field("capacity", &self.capacity)
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}

// =============================================================================
// Worker
// =============================================================================

#[derive(Debug, Clone, Default)]
struct SessionLogState {
    messages: Vec<Message>,
    user_context: UserContext,
    last_activity: Option<DateTime<Utc>>,
}

struct SessionWorker {
    key: String,
    store: Arc<dyn RecordStore>,
    capacity: usize,
    state: Option<SessionLogState>,
}

impl SessionWorker {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>, idle: Duration) {
        loop {
            match tokio::time::timeout(idle, rx.recv()).await {
                Ok(Some(command)) => self.handle(command).await,
                Ok(None) => break,
                Err(_) => {
                    // Refuse new sends, then finish whatever is queued.
                    rx.close();
                    while let Some(command) = rx.recv().await {
                        self.handle(command).await;
                    }
                    debug!(session_id = %self.key, "Session worker idle, retiring");
                    break;
                }
            }
        }
        debug!(session_id = %self.key, "Session worker stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::GetAll { reply } => {
                let _ = reply.send(self.get_all().await);
            }
            Command::Append {
                role,
                content,
                reply,
            } => {
                let message = Message::now(role, content);
                let result = self.commit_messages(vec![message.clone()]).await;
                let _ = reply.send(result.map(|_| message));
            }
            Command::AppendTurn {
                user,
                assistant,
                reply,
            } => {
                let user = Message::now(Role::User, user);
                let assistant = Message::now(Role::Assistant, assistant);
                let result = self
                    .commit_messages(vec![user.clone(), assistant.clone()])
                    .await;
                let _ = reply.send(result.map(|_| (user, assistant)));
            }
            Command::MergeContext { partial, reply } => {
                let _ = reply.send(self.merge_context(partial).await);
            }
            Command::Clear { reply } => {
                let _ = reply.send(self.clear().await);
            }
        }
    }

    async fn get_all(&mut self) -> Result<SessionSnapshot, ChatError> {
        let state = self.loaded().await?;
        Ok(SessionSnapshot {
            messages: state.messages.clone(),
            user_context: state.user_context.clone(),
            last_activity: state.last_activity,
        })
    }

    /// Append `added` in one persisted write, evicting beyond the window.
    async fn commit_messages(&mut self, added: Vec<Message>) -> Result<(), ChatError> {
        let mut messages = self.loaded().await?.messages.clone();
        let appended = added.len();
        let last = added.last().map(|m| m.timestamp);
        messages.extend(added);
        if messages.len() > self.capacity {
            let excess = messages.len() - self.capacity;
            messages.drain(..excess);
        }

        self.store
            .save(&self.record(MESSAGES_RECORD), to_json(&messages)?)
            .await?;

        let state = self.committed()?;
        state.messages = messages;
        if last.is_some() {
            state.last_activity = last;
        }
        let stored = state.messages.len();
        debug!(session_id = %self.key, appended, stored, "Messages appended");
        Ok(())
    }

    async fn merge_context(&mut self, partial: UserContext) -> Result<UserContext, ChatError> {
        let mut merged = self.loaded().await?.user_context.clone();
        for (field, value) in partial {
            merged.insert(field, value);
        }

        self.store
            .save(&self.record(USER_CONTEXT_RECORD), to_json(&merged)?)
            .await?;

        let state = self.committed()?;
        state.user_context = merged.clone();
        state.last_activity = Some(Utc::now());
        Ok(merged)
    }

    async fn clear(&mut self) -> Result<(), ChatError> {
        self.store.delete(&self.record(MESSAGES_RECORD)).await?;
        if let Some(state) = self.state.as_mut() {
            state.messages.clear();
        }
        debug!(session_id = %self.key, "Session messages cleared");
        Ok(())
    }

    /// In-memory state, hydrating it from storage on first use.
    async fn loaded(&mut self) -> Result<&SessionLogState, ChatError> {
        if self.state.is_none() {
            let hydrated = self.hydrate().await?;
            self.state = Some(hydrated);
        }
        self.state
            .as_ref()
            .ok_or(ChatError::ActorUnavailable(ACTOR_NAME))
    }

    /// Mutable state after a successful persist; always hydrated by then.
    fn committed(&mut self) -> Result<&mut SessionLogState, ChatError> {
        self.state
            .as_mut()
            .ok_or(ChatError::ActorUnavailable(ACTOR_NAME))
    }

    async fn hydrate(&self) -> Result<SessionLogState, ChatError> {
        let mut messages: Vec<Message> =
            match self.store.load(&self.record(MESSAGES_RECORD)).await? {
                Some(value) => from_json(value)?,
                None => Vec::new(),
            };
        if messages.len() > self.capacity {
            let excess = messages.len() - self.capacity;
            messages.drain(..excess);
        }
        let user_context: UserContext =
            match self.store.load(&self.record(USER_CONTEXT_RECORD)).await? {
                Some(value) => from_json(value)?,
                None => UserContext::new(),
            };

        debug!(
            session_id = %self.key,
            messages = messages.len(),
            context_fields = user_context.len(),
            "Session hydrated"
        );
        Ok(SessionLogState {
            last_activity: messages.last().map(|m| m.timestamp),
            messages,
            user_context,
        })
    }

    fn record(&self, name: &str) -> RecordKey {
        RecordKey::new(SCOPE, self.key.as_str(), name)
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, ChatError> {
    serde_json::to_value(value).map_err(|e| ParleyError::from(e).into())
}

fn from_json<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T, ChatError> {
    serde_json::from_value(value).map_err(|e| ParleyError::from(e).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_storage::MemoryRecordStore;
    use serde_json::json;

    fn log_with_store() -> (SessionLog, Arc<MemoryRecordStore>) {
        let store = Arc::new(MemoryRecordStore::new());
        (SessionLog::new(store.clone(), DEFAULT_CAPACITY), store)
    }

    fn ctx(value: serde_json::Value) -> UserContext {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_get_all_on_unknown_key_is_empty() {
        let (log, _) = log_with_store();
        let snapshot = log.get_all("nobody").await.unwrap();
        assert!(snapshot.messages.is_empty());
        assert!(snapshot.user_context.is_empty());
        assert!(snapshot.last_activity.is_none());
    }

    #[tokio::test]
    async fn test_append_preserves_order() {
        let (log, _) = log_with_store();
        log.append("s1", Role::User, "hi").await.unwrap();
        log.append("s1", Role::Assistant, "hello").await.unwrap();

        let history = log.history("s1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[0].content, "hi");
        assert_eq!(history[1].role, Role::Assistant);
        assert_eq!(history[1].content, "hello");
    }

    #[tokio::test]
    async fn test_window_keeps_last_fifty_in_order() {
        let (log, _) = log_with_store();
        for n in 0..73 {
            log.append("s1", Role::User, &format!("m{}", n)).await.unwrap();
            let len = log.history("s1").await.unwrap().len();
            assert!(len <= DEFAULT_CAPACITY);
            assert_eq!(len, (n + 1).min(DEFAULT_CAPACITY));
        }

        let contents: Vec<String> = log
            .history("s1")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        let expected: Vec<String> = (23..73).map(|n| format!("m{}", n)).collect();
        assert_eq!(contents, expected);
    }

    #[tokio::test]
    async fn test_append_persists_full_window() {
        let (log, store) = log_with_store();
        for n in 0..55 {
            log.append("s1", Role::User, &n.to_string()).await.unwrap();
        }
        let stored = store
            .peek(&RecordKey::new(SCOPE, "s1", MESSAGES_RECORD))
            .unwrap();
        let stored = stored.as_array().unwrap();
        assert_eq!(stored.len(), 50);
        assert_eq!(stored[0]["content"], "5");
    }

    #[tokio::test]
    async fn test_append_turn_stores_pair_in_one_write() {
        let (log, store) = log_with_store();
        let (user, reply) = log.append_turn("s1", "Hello", "Hi there").await.unwrap();
        assert_eq!(user.role, Role::User);
        assert_eq!(reply.role, Role::Assistant);

        let stored = store
            .peek(&RecordKey::new(SCOPE, "s1", MESSAGES_RECORD))
            .unwrap();
        let stored = stored.as_array().unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0]["content"], "Hello");
        assert_eq!(stored[1]["content"], "Hi there");
    }

    #[tokio::test]
    async fn test_append_turn_failure_stores_nothing() {
        let (log, store) = log_with_store();
        log.append_turn("s1", "first", "one").await.unwrap();

        store.fail_writes(true);
        let err = log.append_turn("s1", "second", "two").await.unwrap_err();
        assert!(matches!(err, ChatError::Persistence(_)));
        assert_eq!(log.history("s1").await.unwrap().len(), 2);

        store.fail_writes(false);
        log.append_turn("s1", "second", "two").await.unwrap();
        let contents: Vec<String> = log
            .history("s1")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["first", "one", "second", "two"]);
    }

    #[tokio::test]
    async fn test_append_turn_respects_window() {
        let store = Arc::new(MemoryRecordStore::new());
        let log = SessionLog::new(store, 3);
        log.append_turn("s1", "q1", "a1").await.unwrap();
        log.append_turn("s1", "q2", "a2").await.unwrap();
        let contents: Vec<String> = log
            .history("s1")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["a1", "q2", "a2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_worker_retires_and_rehydrates() {
        let store = Arc::new(MemoryRecordStore::new());
        let log = SessionLog::new(store.clone(), DEFAULT_CAPACITY)
            .with_idle_timeout(Duration::from_secs(5));
        log.append("s1", Role::User, "before").await.unwrap();
        log.append("s2", Role::User, "other").await.unwrap();
        assert_eq!(log.active_sessions(), 2);
        let loads = store.load_count();

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(log.active_sessions(), 0);

        let history = log.history("s1").await.unwrap();
        assert_eq!(history[0].content, "before");
        assert_eq!(store.load_count(), loads + 2);
        assert_eq!(log.active_sessions(), 1);
        assert_eq!(log.mailboxes.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_worker_is_not_retired() {
        let (log, store) = log_with_store();
        let log = log.with_idle_timeout(Duration::from_secs(5));
        log.append("s1", Role::User, "a").await.unwrap();
        let loads = store.load_count();
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_secs(3)).await;
            log.get_all("s1").await.unwrap();
        }
        assert_eq!(store.load_count(), loads);
        assert_eq!(log.active_sessions(), 1);
    }

    #[tokio::test]
    async fn test_merge_context_is_idempotent_per_field() {
        let (log, _) = log_with_store();
        log.merge_context("s1", ctx(json!({"a": 1}))).await.unwrap();
        let merged = log.merge_context("s1", ctx(json!({"a": 1}))).await.unwrap();
        assert_eq!(merged, ctx(json!({"a": 1})));

        log.merge_context("s1", ctx(json!({"b": 2}))).await.unwrap();
        let snapshot = log.get_all("s1").await.unwrap();
        assert_eq!(snapshot.user_context, ctx(json!({"a": 1, "b": 2})));
        assert!(snapshot.last_activity.is_some());
    }

    #[tokio::test]
    async fn test_merge_context_last_write_wins() {
        let (log, _) = log_with_store();
        log.merge_context("s1", ctx(json!({"city": "Oslo", "units": "metric"})))
            .await
            .unwrap();
        let merged = log
            .merge_context("s1", ctx(json!({"city": "Lima"})))
            .await
            .unwrap();
        assert_eq!(merged["city"], "Lima");
        assert_eq!(merged["units"], "metric");
    }

    #[tokio::test]
    async fn test_clear_keeps_user_context() {
        let (log, store) = log_with_store();
        log.append("s1", Role::User, "hi").await.unwrap();
        log.merge_context("s1", ctx(json!({"name": "Sam"})))
            .await
            .unwrap();

        log.clear("s1").await.unwrap();

        let snapshot = log.get_all("s1").await.unwrap();
        assert!(snapshot.messages.is_empty());
        assert_eq!(snapshot.user_context["name"], "Sam");
        assert!(store
            .peek(&RecordKey::new(SCOPE, "s1", MESSAGES_RECORD))
            .is_none());
    }

    #[tokio::test]
    async fn test_clear_before_first_read() {
        let store = Arc::new(MemoryRecordStore::new());
        {
            let log = SessionLog::new(store.clone(), DEFAULT_CAPACITY);
            log.append("s1", Role::User, "old").await.unwrap();
        }
        let log = SessionLog::new(store.clone(), DEFAULT_CAPACITY);
        log.clear("s1").await.unwrap();
        assert!(log.history("s1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hydrates_lazily_once() {
        let (log, store) = log_with_store();
        assert_eq!(store.load_count(), 0);
        log.get_all("s1").await.unwrap();
        let after_first = store.load_count();
        assert_eq!(after_first, 2);
        log.get_all("s1").await.unwrap();
        log.append("s1", Role::User, "x").await.unwrap();
        assert_eq!(store.load_count(), after_first);
    }

    #[tokio::test]
    async fn test_hydrates_from_existing_records() {
        let store = Arc::new(MemoryRecordStore::new());
        {
            let log = SessionLog::new(store.clone(), DEFAULT_CAPACITY);
            log.append("s1", Role::User, "persisted").await.unwrap();
            log.merge_context("s1", ctx(json!({"k": true}))).await.unwrap();
        }
        let log = SessionLog::new(store, DEFAULT_CAPACITY);
        let snapshot = log.get_all("s1").await.unwrap();
        assert_eq!(snapshot.messages[0].content, "persisted");
        assert_eq!(snapshot.user_context["k"], true);
    }

    #[tokio::test]
    async fn test_hydration_applies_smaller_window() {
        let store = Arc::new(MemoryRecordStore::new());
        {
            let log = SessionLog::new(store.clone(), DEFAULT_CAPACITY);
            for n in 0..10 {
                log.append("s1", Role::User, &n.to_string()).await.unwrap();
            }
        }
        let log = SessionLog::new(store, 3);
        let contents: Vec<String> = log
            .history("s1")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["7", "8", "9"]);
    }

    #[tokio::test]
    async fn test_failed_persist_leaves_state_untouched() {
        let (log, store) = log_with_store();
        log.append("s1", Role::User, "kept").await.unwrap();

        store.fail_writes(true);
        let err = log.append("s1", Role::Assistant, "lost").await.unwrap_err();
        assert!(matches!(err, ChatError::Persistence(_)));
        assert!(err.is_retryable());
        assert!(log
            .merge_context("s1", ctx(json!({"a": 1})))
            .await
            .is_err());
        assert!(log.clear("s1").await.is_err());

        let snapshot = log.get_all("s1").await.unwrap();
        assert_eq!(snapshot.messages.len(), 1);
        assert_eq!(snapshot.messages[0].content, "kept");
        assert!(snapshot.user_context.is_empty());

        store.fail_writes(false);
        log.append("s1", Role::Assistant, "retry").await.unwrap();
        assert_eq!(log.history("s1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_appends_same_key_are_serialized() {
        let (log, _) = log_with_store();
        let log = Arc::new(log);
        let mut handles = Vec::new();
        for n in 0..40 {
            let log = Arc::clone(&log);
            handles.push(tokio::spawn(async move {
                log.append("shared", Role::User, &n.to_string()).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let history = log.history("shared").await.unwrap();
        assert_eq!(history.len(), 40);
        let mut seen: Vec<u32> = history.iter().map(|m| m.content.parse().unwrap()).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..40).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let (log, _) = log_with_store();
        log.append("a", Role::User, "for a").await.unwrap();
        log.append("b", Role::User, "for b").await.unwrap();
        log.clear("a").await.unwrap();

        assert!(log.history("a").await.unwrap().is_empty());
        assert_eq!(log.history("b").await.unwrap()[0].content, "for b");
    }

    #[tokio::test]
    async fn test_system_role_rejected() {
        let (log, _) = log_with_store();
        let err = log.append("s1", Role::System, "nope").await.unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
        assert!(log.history("s1").await.unwrap().is_empty());
    }
}
