//! Global conversation directory.
//!
//! A single worker owns the list of conversation summaries, newest
//! creation first. Every metadata change from every conversation is
//! serialized through it.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use parley_core::error::ParleyError;
use parley_core::types::{ConversationSummary, SummaryUpdate};
use parley_storage::{RecordKey, RecordStore};

use crate::error::ChatError;

const SCOPE: &str = "directory";
const DIRECTORY_KEY: &str = "global";
const SUMMARIES_RECORD: &str = "summaries";
const MAILBOX_CAPACITY: usize = 64;
const ACTOR_NAME: &str = "session directory";

type Reply<T> = oneshot::Sender<Result<T, ChatError>>;

enum Command {
    List {
        reply: Reply<Vec<ConversationSummary>>,
    },
    Get {
        id: String,
        reply: Reply<Option<ConversationSummary>>,
    },
    Create {
        id: Option<String>,
        name: Option<String>,
        reply: Reply<ConversationSummary>,
    },
    Update {
        id: String,
        update: SummaryUpdate,
        reply: Reply<ConversationSummary>,
    },
    Remove {
        id: String,
        reply: Reply<()>,
    },
}

/// Serialized access to the list of conversations.
pub struct SessionDirectory {
    store: Arc<dyn RecordStore>,
    mailbox: Mutex<Option<mpsc::Sender<Command>>>,
}

impl SessionDirectory {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            mailbox: Mutex::new(None),
        }
    }

    /// All summaries, newest creation first.
    pub async fn list(&self) -> Result<Vec<ConversationSummary>, ChatError> {
        self.request(|reply| Command::List { reply }).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<ConversationSummary>, ChatError> {
        let id = id.to_string();
        self.request(|reply| Command::Get { id, reply }).await
    }

    /// Register a conversation at the front of the list.
    ///
    /// A missing `id` is generated. Supplied ids are not checked for
    /// duplicates.
    pub async fn create(
        &self,
        id: Option<String>,
        name: Option<String>,
    ) -> Result<ConversationSummary, ChatError> {
        self.request(|reply| Command::Create { id, name, reply })
            .await
    }

    /// Apply `update` to the summary with `id`, refreshing `updated_at`.
    ///
    /// Returns [`ChatError::NotFound`] if no such summary exists. The
    /// list position is unchanged.
    pub async fn update(
        &self,
        id: &str,
        update: SummaryUpdate,
    ) -> Result<ConversationSummary, ChatError> {
        let id = id.to_string();
        self.request(|reply| Command::Update { id, update, reply })
            .await
    }

    pub async fn rename(&self, id: &str, name: &str) -> Result<ConversationSummary, ChatError> {
        self.update(id, SummaryUpdate::rename(name)).await
    }

    /// Remove the summary with `id`. Unknown ids are ignored.
    pub async fn remove(&self, id: &str) -> Result<(), ChatError> {
        let id = id.to_string();
        self.request(|reply| Command::Remove { id, reply }).await
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, ChatError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let mailbox = self.mailbox()?;
        mailbox
            .send(make(reply_tx))
            .await
            .map_err(|_| ChatError::ActorUnavailable(ACTOR_NAME))?;
        reply_rx
            .await
            .map_err(|_| ChatError::ActorUnavailable(ACTOR_NAME))?
    }

    fn mailbox(&self) -> Result<mpsc::Sender<Command>, ChatError> {
        let mut slot = self
            .mailbox
            .lock()
            .map_err(|_| ChatError::ActorUnavailable(ACTOR_NAME))?;
        if let Some(tx) = slot.as_ref().filter(|tx| !tx.is_closed()) {
            return Ok(tx.clone());
        }

        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let worker = DirectoryWorker {
            store: Arc::clone(&self.store),
            summaries: None,
        };
        tokio::spawn(worker.run(rx));
        debug!("Directory worker started");
        *slot = Some(tx.clone());
        Ok(tx)
    }
}

impl std::fmt::Debug for SessionDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionDirectory").finish_non_exhaustive()
    }
}

// =============================================================================
// Worker
// =============================================================================

struct DirectoryWorker {
    store: Arc<dyn RecordStore>,
    summaries: Option<Vec<ConversationSummary>>,
}

impl DirectoryWorker {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::List { reply } => {
                    let result = self.loaded().await.map(|s| s.to_vec());
                    let _ = reply.send(result);
                }
                Command::Get { id, reply } => {
                    let result = self
                        .loaded()
                        .await
                        .map(|s| s.iter().find(|c| c.id == id).cloned());
                    let _ = reply.send(result);
                }
                Command::Create { id, name, reply } => {
                    let _ = reply.send(self.create(id, name).await);
                }
                Command::Update { id, update, reply } => {
                    let _ = reply.send(self.update(&id, update).await);
                }
                Command::Remove { id, reply } => {
                    let _ = reply.send(self.remove(&id).await);
                }
            }
        }
        debug!("Directory worker stopped");
    }

    async fn create(
        &mut self,
        id: Option<String>,
        name: Option<String>,
    ) -> Result<ConversationSummary, ChatError> {
        let summary = ConversationSummary::new(id, name);
        let mut next = self.loaded().await?.to_vec();
        next.insert(0, summary.clone());
        self.commit(next).await?;
        debug!(session_id = %summary.id, "Conversation registered");
        Ok(summary)
    }

    async fn update(
        &mut self,
        id: &str,
        update: SummaryUpdate,
    ) -> Result<ConversationSummary, ChatError> {
        let mut next = self.loaded().await?.to_vec();
        let summary = next
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| ChatError::NotFound { id: id.to_string() })?;
        if let Some(name) = update.name {
            summary.name = name;
        }
        if let Some(preview) = update.last_message_preview {
            summary.last_message_preview = preview;
        }
        summary.updated_at = Utc::now();
        let updated = summary.clone();

        self.commit(next).await?;
        Ok(updated)
    }

    async fn remove(&mut self, id: &str) -> Result<(), ChatError> {
        let mut next = self.loaded().await?.to_vec();
        next.retain(|c| c.id != id);
        self.commit(next).await?;
        debug!(session_id = id, "Conversation removed");
        Ok(())
    }

    /// Persist `next`, then make it the in-memory list.
    async fn commit(&mut self, next: Vec<ConversationSummary>) -> Result<(), ChatError> {
        let value = serde_json::to_value(&next).map_err(ParleyError::from)?;
        self.store.save(&summaries_key(), value).await?;
        self.summaries = Some(next);
        Ok(())
    }

    async fn loaded(&mut self) -> Result<&[ConversationSummary], ChatError> {
        if self.summaries.is_none() {
            let summaries: Vec<ConversationSummary> =
                match self.store.load(&summaries_key()).await? {
                    Some(value) => serde_json::from_value(value).map_err(ParleyError::from)?,
                    None => Vec::new(),
                };
            debug!(conversations = summaries.len(), "Directory hydrated");
            self.summaries = Some(summaries);
        }
        self.summaries
            .as_deref()
            .ok_or(ChatError::ActorUnavailable(ACTOR_NAME))
    }
}

fn summaries_key() -> RecordKey {
    RecordKey::new(SCOPE, DIRECTORY_KEY, SUMMARIES_RECORD)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_storage::MemoryRecordStore;

    fn directory_with_store() -> (SessionDirectory, Arc<MemoryRecordStore>) {
        let store = Arc::new(MemoryRecordStore::new());
        (SessionDirectory::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_empty_directory() {
        let (dir, _) = directory_with_store();
        assert!(dir.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_inserts_at_front() {
        let (dir, _) = directory_with_store();
        dir.create(Some("a".into()), None).await.unwrap();
        let created = dir.create(Some("b".into()), Some("Trip".into())).await.unwrap();

        let list = dir.list().await.unwrap();
        assert_eq!(list[0], created);
        assert_eq!(list[0].name, "Trip");
        assert_eq!(list[1].id, "a");
        assert_eq!(list[1].name, "New Chat");
    }

    #[tokio::test]
    async fn test_create_generates_id() {
        let (dir, _) = directory_with_store();
        let first = dir.create(None, None).await.unwrap();
        let second = dir.create(None, None).await.unwrap();
        assert!(!first.id.is_empty());
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_duplicate_ids_are_kept() {
        let (dir, _) = directory_with_store();
        dir.create(Some("same".into()), None).await.unwrap();
        dir.create(Some("same".into()), None).await.unwrap();
        assert_eq!(dir.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_rename_keeps_position() {
        let (dir, _) = directory_with_store();
        let oldest = dir.create(Some("a".into()), None).await.unwrap();
        dir.create(Some("b".into()), None).await.unwrap();
        dir.create(Some("c".into()), None).await.unwrap();

        let renamed = dir.update("a", SummaryUpdate::rename("X")).await.unwrap();
        assert_eq!(renamed.name, "X");
        assert_eq!(renamed.last_message_preview, oldest.last_message_preview);
        assert_eq!(renamed.created_at, oldest.created_at);
        assert!(renamed.updated_at >= oldest.updated_at);

        let ids: Vec<_> = dir.list().await.unwrap().into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
    }

    #[tokio::test]
    async fn test_update_preview_only() {
        let (dir, _) = directory_with_store();
        dir.create(Some("a".into()), Some("Named".into())).await.unwrap();
        let updated = dir
            .update("a", SummaryUpdate::preview("Hello"))
            .await
            .unwrap();
        assert_eq!(updated.name, "Named");
        assert_eq!(updated.last_message_preview, "Hello");
    }

    #[tokio::test]
    async fn test_update_unknown_id_is_not_found() {
        let (dir, _) = directory_with_store();
        let err = dir.rename("ghost", "X").await.unwrap_err();
        assert!(matches!(err, ChatError::NotFound { ref id } if id == "ghost"));
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test]
    async fn test_remove_is_unconditional() {
        let (dir, _) = directory_with_store();
        dir.create(Some("a".into()), None).await.unwrap();
        dir.remove("missing").await.unwrap();
        assert_eq!(dir.list().await.unwrap().len(), 1);
        dir.remove("a").await.unwrap();
        assert!(dir.list().await.unwrap().is_empty());
        assert!(dir.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let store = Arc::new(MemoryRecordStore::new());
        {
            let dir = SessionDirectory::new(store.clone());
            dir.create(Some("a".into()), Some("Kept".into())).await.unwrap();
        }
        let dir = SessionDirectory::new(store);
        let found = dir.get("a").await.unwrap().unwrap();
        assert_eq!(found.name, "Kept");
    }

    #[tokio::test]
    async fn test_failed_persist_leaves_list_unchanged() {
        let (dir, store) = directory_with_store();
        dir.create(Some("a".into()), None).await.unwrap();

        store.fail_writes(true);
        let err = dir.create(Some("b".into()), None).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(dir.rename("a", "X").await.is_err());

        store.fail_writes(false);
        let list = dir.list().await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name, "New Chat");
    }
}
