use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use im::{OrdMap, OrdSet};
use tokio::sync::OwnedMutexGuard;

use crate::backend::{internal, StoredMessage};
use crate::error::{MailboxError, Result};
use crate::mail::mailbox::{Mailbox, MailboxPath};
use crate::mail::message::{FetchType, ImapUid, Message, UidRange};
use crate::mapper::store::{
    uid_validity_from, Backend, MailboxStore, MessageStore, StoreBuilder, SubscriptionStore,
};
use crate::timestamp::now_msec;
use crate::transaction::TransactionBackend;
use crate::unique_ident::gen_content_id;

/// The hierarchical document adapter: every mailbox is a node addressed by
/// an opaque string id under a configured root, messages are encoded child
/// documents keyed by uid. Same snapshot transaction discipline as the row
/// adapter; what differs is the physical shape.
pub struct TreeDb {
    shared: Arc<TreeShared>,
}

struct TreeShared {
    root: String,
    state: RwLock<TreeState>,
    tx_lock: Arc<tokio::sync::Mutex<()>>,
}

#[derive(Clone, Default)]
struct TreeState {
    nodes: OrdMap<String, MailboxNode>,
    subscriptions: OrdSet<(String, String)>,
}

#[derive(Clone)]
struct MailboxNode {
    mailbox: Mailbox<String>,
    /// rmp-encoded [`StoredMessage`] documents, one per uid.
    documents: OrdMap<u32, Vec<u8>>,
}

impl TreeDb {
    pub fn open(root_node: &str) -> Self {
        tracing::debug!(root = root_node, "opening tree store");
        Self {
            shared: Arc::new(TreeShared {
                root: root_node.to_string(),
                state: RwLock::new(TreeState::default()),
                tx_lock: Arc::new(tokio::sync::Mutex::new(())),
            }),
        }
    }
}

#[async_trait]
impl StoreBuilder for TreeDb {
    type Store = TreeStore;

    async fn build(&self) -> Result<TreeStore> {
        Ok(TreeStore {
            shared: self.shared.clone(),
            active: Mutex::new(None),
        })
    }
}

pub struct TreeStore {
    shared: Arc<TreeShared>,
    active: Mutex<Option<TreeTransaction>>,
}

struct TreeTransaction {
    _guard: OwnedMutexGuard<()>,
    checkpoint: TreeState,
}

fn encode(stored: &StoredMessage) -> Result<Vec<u8>> {
    rmp_serde::to_vec(stored).map_err(|e| MailboxError::Storage(e.into()))
}

fn decode(document: &[u8]) -> Result<StoredMessage> {
    rmp_serde::from_slice(document).map_err(|e| MailboxError::Storage(e.into()))
}

impl TreeStore {
    fn read_state(&self) -> Result<TreeState> {
        Ok(self
            .shared
            .state
            .read()
            .or(Err(internal("tree state poisoned")))?
            .clone())
    }

    fn with_state_mut<T>(&self, work: impl FnOnce(&mut TreeState) -> Result<T>) -> Result<T> {
        let mut state = self
            .shared
            .state
            .write()
            .or(Err(internal("tree state poisoned")))?;
        work(&mut state)
    }

    fn documents_of(&self, mailbox: &str) -> Result<OrdMap<u32, Vec<u8>>> {
        let state = self.read_state()?;
        state
            .nodes
            .get(mailbox)
            .map(|node| node.documents.clone())
            .ok_or(internal("unknown mailbox node"))
    }

    fn uids_with(
        &self,
        mailbox: &str,
        keep: impl Fn(&StoredMessage) -> bool,
    ) -> Result<Vec<ImapUid>> {
        let mut uids = vec![];
        for (uid, document) in self.documents_of(mailbox)?.iter() {
            if keep(&decode(document)?) {
                uids.push(ImapUid::new(*uid).ok_or_else(|| internal("stored uid is zero"))?);
            }
        }
        Ok(uids)
    }
}

#[async_trait]
impl TransactionBackend for TreeStore {
    async fn begin(&self) -> Result<()> {
        let guard = self.shared.tx_lock.clone().lock_owned().await;
        let checkpoint = self.read_state()?;
        let mut active = self.active.lock().or(Err(internal("tx state poisoned")))?;
        if active.is_some() {
            return Err(internal("transaction already open on this connection"));
        }
        *active = Some(TreeTransaction {
            _guard: guard,
            checkpoint,
        });
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        self.active
            .lock()
            .or(Err(internal("tx state poisoned")))?
            .take()
            .ok_or(internal("commit without an open transaction"))?;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let tx = self
            .active
            .lock()
            .or(Err(internal("tx state poisoned")))?
            .take()
            .ok_or(internal("rollback without an open transaction"))?;
        self.with_state_mut(|state| {
            *state = tx.checkpoint.clone();
            Ok(())
        })
    }
}

impl Backend for TreeStore {
    type Id = String;
}

#[async_trait]
impl MessageStore for TreeStore {
    async fn find_in_mailbox(
        &self,
        mailbox: &String,
        range: &UidRange,
        fetch: FetchType,
        limit: Option<usize>,
    ) -> Result<Vec<Message>> {
        let mut found = vec![];
        for (uid, document) in self.documents_of(mailbox)?.iter() {
            let uid = ImapUid::new(*uid).ok_or_else(|| internal("stored uid is zero"))?;
            if !range.contains(uid) {
                continue;
            }
            found.push(decode(document)?.to_message(fetch)?);
            if let Some(limit) = limit {
                if found.len() >= limit {
                    break;
                }
            }
        }
        Ok(found)
    }

    async fn find_recent_uids(&self, mailbox: &String) -> Result<Vec<ImapUid>> {
        self.uids_with(mailbox, |stored| {
            stored.flags.contains(&crate::mail::flags::Flag::Recent)
        })
    }

    async fn find_unseen_uids(&self, mailbox: &String) -> Result<Vec<ImapUid>> {
        self.uids_with(mailbox, |stored| {
            !stored.flags.contains(&crate::mail::flags::Flag::Seen)
        })
    }

    async fn save(&self, mailbox: &String, message: &Message) -> Result<()> {
        let uid = message.uid().get();
        self.with_state_mut(|state| {
            let node = state
                .nodes
                .get_mut(mailbox)
                .ok_or(internal("unknown mailbox node"))?;
            let document = match node.documents.get(&uid) {
                Some(existing) => {
                    let mut stored = decode(existing)?;
                    stored.apply_metadata(&message.metadata);
                    encode(&stored)?
                }
                None => encode(&StoredMessage::from_message(message)?)?,
            };
            node.documents.insert(uid, document);
            Ok(())
        })
    }

    async fn delete(&self, mailbox: &String, uid: ImapUid) -> Result<()> {
        self.with_state_mut(|state| {
            let node = state
                .nodes
                .get_mut(mailbox)
                .ok_or(internal("unknown mailbox node"))?;
            node.documents
                .remove(&uid.get())
                .map(|_| ())
                .ok_or(MailboxError::MessageNotFound { uid: uid.get() })
        })
    }

    async fn calculate_last_uid(&self, mailbox: &String) -> Result<u32> {
        Ok(self
            .documents_of(mailbox)?
            .keys()
            .max()
            .copied()
            .unwrap_or(0))
    }

    /// Scans by the modseq property of the documents, not by uid: the
    /// message with the greatest uid is not necessarily the one modified
    /// last.
    async fn calculate_highest_modseq(&self, mailbox: &String) -> Result<u64> {
        let mut highest = 0;
        for (_, document) in self.documents_of(mailbox)?.iter() {
            highest = highest.max(decode(document)?.modseq);
        }
        Ok(highest)
    }

    async fn save_sequences(
        &self,
        mailbox: &String,
        last_uid: u32,
        highest_modseq: u64,
    ) -> Result<()> {
        self.with_state_mut(|state| {
            let node = state
                .nodes
                .get_mut(mailbox)
                .ok_or(internal("save_sequences on an unknown mailbox node"))?;
            node.mailbox.last_known_uid = node.mailbox.last_known_uid.max(last_uid);
            node.mailbox.highest_known_modseq =
                node.mailbox.highest_known_modseq.max(highest_modseq);
            Ok(())
        })
    }

    fn supports_move(&self) -> bool {
        true
    }
}

#[async_trait]
impl MailboxStore for TreeStore {
    async fn find_by_id(&self, id: &String) -> Result<Option<Mailbox<String>>> {
        Ok(self
            .read_state()?
            .nodes
            .get(id)
            .map(|node| node.mailbox.clone()))
    }

    async fn find_by_path(&self, path: &MailboxPath) -> Result<Option<Mailbox<String>>> {
        Ok(self
            .read_state()?
            .nodes
            .values()
            .find(|node| node.mailbox.path == *path)
            .map(|node| node.mailbox.clone()))
    }

    async fn insert(&self, path: &MailboxPath) -> Result<Mailbox<String>> {
        let id = format!("{}/{}", self.shared.root, gen_content_id());
        let uid_validity = uid_validity_from(now_msec() as u32);
        self.with_state_mut(|state| {
            if state.nodes.values().any(|node| node.mailbox.path == *path) {
                return Err(MailboxError::MailboxExists(path.clone()));
            }
            let mailbox = Mailbox::new(id.clone(), path.clone(), uid_validity);
            state.nodes.insert(
                id.clone(),
                MailboxNode {
                    mailbox: mailbox.clone(),
                    documents: OrdMap::new(),
                },
            );
            Ok(mailbox)
        })
    }

    async fn update(&self, mailbox: &Mailbox<String>) -> Result<()> {
        self.with_state_mut(|state| {
            let node = state
                .nodes
                .get_mut(&mailbox.id)
                .ok_or_else(|| MailboxError::MailboxNotFound(mailbox.path.clone()))?;
            let uid_validity = node.mailbox.uid_validity;
            node.mailbox = mailbox.clone();
            node.mailbox.uid_validity = uid_validity;
            Ok(())
        })
    }

    async fn delete(&self, id: &String) -> Result<()> {
        self.with_state_mut(|state| {
            state.nodes.remove(id);
            Ok(())
        })
    }

    async fn list(&self) -> Result<Vec<Mailbox<String>>> {
        let state = self.read_state()?;
        let mut all: Vec<Mailbox<String>> =
            state.nodes.values().map(|node| node.mailbox.clone()).collect();
        all.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(all)
    }
}

#[async_trait]
impl SubscriptionStore for TreeStore {
    async fn add_subscription(&self, user: &str, mailbox: &str) -> Result<()> {
        self.with_state_mut(|state| {
            state
                .subscriptions
                .insert((user.to_string(), mailbox.to_string()));
            Ok(())
        })
    }

    async fn remove_subscription(&self, user: &str, mailbox: &str) -> Result<()> {
        self.with_state_mut(|state| {
            state
                .subscriptions
                .remove(&(user.to_string(), mailbox.to_string()));
            Ok(())
        })
    }

    async fn list_subscriptions(&self, user: &str) -> Result<Vec<String>> {
        let state = self.read_state()?;
        Ok(state
            .subscriptions
            .iter()
            .filter(|(u, _)| u == user)
            .map(|(_, mb)| mb.clone())
            .collect())
    }
}
