use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
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
use crate::transaction::TransactionBackend;

/// The relational-style adapter: row tables keyed by integer ids, real
/// begin/commit/rollback. Tables are immutable maps, so a transaction
/// checkpoint is a cheap structural clone and rollback is a pointer swap.
/// Transactions serialize on a database-wide lock; that lock *is* the
/// serialization discipline the mapper contract defers to.
pub struct RowDb {
    shared: Arc<RowShared>,
}

struct RowShared {
    tables: RwLock<Tables>,
    tx_lock: Arc<tokio::sync::Mutex<()>>,
    next_mailbox_id: AtomicU64,
    uid_validity_gen: AtomicU32,
}

#[derive(Clone, Default)]
struct Tables {
    mailboxes: OrdMap<u64, Mailbox<u64>>,
    messages: OrdMap<(u64, u32), StoredMessage>,
    subscriptions: OrdSet<(String, String)>,
}

impl RowDb {
    /// The connection string is opaque configuration; this adapter only
    /// logs it.
    pub fn open(connection_string: &str) -> Self {
        tracing::debug!(connection = connection_string, "opening row database");
        Self {
            shared: Arc::new(RowShared {
                tables: RwLock::new(Tables::default()),
                tx_lock: Arc::new(tokio::sync::Mutex::new(())),
                next_mailbox_id: AtomicU64::new(1),
                uid_validity_gen: AtomicU32::new(1),
            }),
        }
    }
}

#[async_trait]
impl StoreBuilder for RowDb {
    type Store = RowStore;

    async fn build(&self) -> Result<RowStore> {
        Ok(RowStore {
            shared: self.shared.clone(),
            active: Mutex::new(None),
        })
    }
}

/// One session's connection to the row database.
pub struct RowStore {
    shared: Arc<RowShared>,
    active: Mutex<Option<RowTransaction>>,
}

struct RowTransaction {
    _guard: OwnedMutexGuard<()>,
    checkpoint: Tables,
}

impl RowStore {
    fn read_tables(&self) -> Result<Tables> {
        Ok(self
            .shared
            .tables
            .read()
            .or(Err(internal("row tables poisoned")))?
            .clone())
    }

    fn with_tables_mut<T>(&self, work: impl FnOnce(&mut Tables) -> Result<T>) -> Result<T> {
        let mut tables = self
            .shared
            .tables
            .write()
            .or(Err(internal("row tables poisoned")))?;
        work(&mut tables)
    }
}

#[async_trait]
impl TransactionBackend for RowStore {
    async fn begin(&self) -> Result<()> {
        let guard = self.shared.tx_lock.clone().lock_owned().await;
        let checkpoint = self.read_tables()?;
        let mut active = self.active.lock().or(Err(internal("tx state poisoned")))?;
        if active.is_some() {
            return Err(internal("transaction already open on this connection"));
        }
        *active = Some(RowTransaction {
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
        self.with_tables_mut(|tables| {
            *tables = tx.checkpoint.clone();
            Ok(())
        })
    }
}

impl Backend for RowStore {
    type Id = u64;
}

fn uid_bounds(range: &UidRange) -> (u32, u32) {
    match range {
        UidRange::All => (1, u32::MAX),
        UidRange::One(uid) => (uid.get(), uid.get()),
        UidRange::From(lo) => (lo.get(), u32::MAX),
        UidRange::Between(lo, hi) => (lo.get(), hi.get()),
    }
}

#[async_trait]
impl MessageStore for RowStore {
    async fn find_in_mailbox(
        &self,
        mailbox: &u64,
        range: &UidRange,
        fetch: FetchType,
        limit: Option<usize>,
    ) -> Result<Vec<Message>> {
        let (lo, hi) = uid_bounds(range);
        if lo > hi {
            return Ok(vec![]);
        }
        let tables = self.read_tables()?;
        tables
            .messages
            .range((*mailbox, lo)..=(*mailbox, hi))
            .take(limit.unwrap_or(usize::MAX))
            .map(|(_, stored)| stored.to_message(fetch))
            .collect()
    }

    async fn find_recent_uids(&self, mailbox: &u64) -> Result<Vec<ImapUid>> {
        self.uids_with(mailbox, |stored| {
            stored.flags.contains(&crate::mail::flags::Flag::Recent)
        })
    }

    async fn find_unseen_uids(&self, mailbox: &u64) -> Result<Vec<ImapUid>> {
        self.uids_with(mailbox, |stored| {
            !stored.flags.contains(&crate::mail::flags::Flag::Seen)
        })
    }

    async fn save(&self, mailbox: &u64, message: &Message) -> Result<()> {
        let key = (*mailbox, message.uid().get());
        self.with_tables_mut(|tables| {
            match tables.messages.get_mut(&key) {
                Some(stored) => stored.apply_metadata(&message.metadata),
                None => {
                    tables
                        .messages
                        .insert(key, StoredMessage::from_message(message)?);
                }
            }
            Ok(())
        })
    }

    async fn delete(&self, mailbox: &u64, uid: ImapUid) -> Result<()> {
        self.with_tables_mut(|tables| {
            tables
                .messages
                .remove(&(*mailbox, uid.get()))
                .map(|_| ())
                .ok_or(MailboxError::MessageNotFound { uid: uid.get() })
        })
    }

    async fn calculate_last_uid(&self, mailbox: &u64) -> Result<u32> {
        let tables = self.read_tables()?;
        Ok(tables
            .messages
            .range((*mailbox, 1)..=(*mailbox, u32::MAX))
            .map(|((_, uid), _)| *uid)
            .max()
            .unwrap_or(0))
    }

    async fn calculate_highest_modseq(&self, mailbox: &u64) -> Result<u64> {
        let tables = self.read_tables()?;
        Ok(tables
            .messages
            .range((*mailbox, 1)..=(*mailbox, u32::MAX))
            .map(|(_, stored)| stored.modseq)
            .max()
            .unwrap_or(0))
    }

    async fn save_sequences(&self, mailbox: &u64, last_uid: u32, highest_modseq: u64) -> Result<()> {
        self.with_tables_mut(|tables| {
            let row = tables
                .mailboxes
                .get_mut(mailbox)
                .ok_or(internal("save_sequences on an unknown mailbox"))?;
            // The persisted counters never regress
            row.last_known_uid = row.last_known_uid.max(last_uid);
            row.highest_known_modseq = row.highest_known_modseq.max(highest_modseq);
            Ok(())
        })
    }

    fn supports_move(&self) -> bool {
        true
    }
}

impl RowStore {
    fn uids_with(&self, mailbox: &u64, keep: impl Fn(&StoredMessage) -> bool) -> Result<Vec<ImapUid>> {
        let tables = self.read_tables()?;
        tables
            .messages
            .range((*mailbox, 1)..=(*mailbox, u32::MAX))
            .filter(|(_, stored)| keep(stored))
            .map(|((_, uid), _)| {
                ImapUid::new(*uid).ok_or_else(|| internal("stored uid is zero"))
            })
            .collect()
    }
}

#[async_trait]
impl MailboxStore for RowStore {
    async fn find_by_id(&self, id: &u64) -> Result<Option<Mailbox<u64>>> {
        Ok(self.read_tables()?.mailboxes.get(id).cloned())
    }

    async fn find_by_path(&self, path: &MailboxPath) -> Result<Option<Mailbox<u64>>> {
        Ok(self
            .read_tables()?
            .mailboxes
            .values()
            .find(|mb| mb.path == *path)
            .cloned())
    }

    async fn insert(&self, path: &MailboxPath) -> Result<Mailbox<u64>> {
        let id = self.shared.next_mailbox_id.fetch_add(1, Ordering::SeqCst);
        let uid_validity =
            uid_validity_from(self.shared.uid_validity_gen.fetch_add(1, Ordering::SeqCst));
        self.with_tables_mut(|tables| {
            if tables.mailboxes.values().any(|mb| mb.path == *path) {
                return Err(MailboxError::MailboxExists(path.clone()));
            }
            let mailbox = Mailbox::new(id, path.clone(), uid_validity);
            tables.mailboxes.insert(id, mailbox.clone());
            Ok(mailbox)
        })
    }

    async fn update(&self, mailbox: &Mailbox<u64>) -> Result<()> {
        self.with_tables_mut(|tables| {
            let row = tables
                .mailboxes
                .get_mut(&mailbox.id)
                .ok_or_else(|| MailboxError::MailboxNotFound(mailbox.path.clone()))?;
            // id and uid-validity are immutable; everything else follows
            let uid_validity = row.uid_validity;
            *row = mailbox.clone();
            row.uid_validity = uid_validity;
            Ok(())
        })
    }

    async fn delete(&self, id: &u64) -> Result<()> {
        self.with_tables_mut(|tables| {
            tables.mailboxes.remove(id);
            let doomed: Vec<(u64, u32)> = tables
                .messages
                .range((*id, 1)..=(*id, u32::MAX))
                .map(|(key, _)| *key)
                .collect();
            for key in doomed {
                tables.messages.remove(&key);
            }
            Ok(())
        })
    }

    async fn list(&self) -> Result<Vec<Mailbox<u64>>> {
        let tables = self.read_tables()?;
        let mut all: Vec<Mailbox<u64>> = tables.mailboxes.values().cloned().collect();
        all.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(all)
    }
}

#[async_trait]
impl SubscriptionStore for RowStore {
    async fn add_subscription(&self, user: &str, mailbox: &str) -> Result<()> {
        self.with_tables_mut(|tables| {
            tables
                .subscriptions
                .insert((user.to_string(), mailbox.to_string()));
            Ok(())
        })
    }

    async fn remove_subscription(&self, user: &str, mailbox: &str) -> Result<()> {
        self.with_tables_mut(|tables| {
            tables
                .subscriptions
                .remove(&(user.to_string(), mailbox.to_string()));
            Ok(())
        })
    }

    async fn list_subscriptions(&self, user: &str) -> Result<Vec<String>> {
        let tables = self.read_tables()?;
        Ok(tables
            .subscriptions
            .iter()
            .filter(|(u, _)| u == user)
            .map(|(_, mb)| mb.clone())
            .collect())
    }
}
