use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;

use crate::error::{MailboxError, Result};
use crate::mail::mailbox::{Mailbox, MailboxId};
use crate::mail::message::{ImapUid, ModSeq};
use crate::mapper::store::{Backend, MessageStore};

/// Cache of the last issued UID and MODSEQ per mailbox. One registry is
/// shared by every session of a mapper factory; it is an explicit value, not
/// process-global state, so tests can run against isolated instances.
///
/// Counters are seeded on first touch by asking the backend to derive the
/// current high-water mark, falling back to the hint persisted on the
/// mailbox when the backend cannot compute one. After that, allocation is a
/// single atomic increment; the entry map lock is only taken to look the
/// entry up.
pub struct SequenceRegistry<Id: MailboxId> {
    entries: Mutex<HashMap<Id, Arc<MailboxCounters>>>,
}

struct MailboxCounters {
    seeded: tokio::sync::OnceCell<()>,
    last_uid: AtomicU32,
    highest_modseq: AtomicU64,
}

impl Default for MailboxCounters {
    fn default() -> Self {
        Self {
            seeded: tokio::sync::OnceCell::new(),
            last_uid: AtomicU32::new(0),
            highest_modseq: AtomicU64::new(0),
        }
    }
}

impl<Id: MailboxId> Default for SequenceRegistry<Id> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Id: MailboxId> SequenceRegistry<Id> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate the next UID for `mailbox`. Distinct concurrent calls are
    /// guaranteed distinct, strictly increasing values.
    pub async fn next_uid<S>(&self, store: &S, mailbox: &Mailbox<Id>) -> Result<ImapUid>
    where
        S: MessageStore + Backend<Id = Id> + ?Sized,
    {
        let counters = self.counters(&mailbox.id);
        self.seed(&counters, store, mailbox).await?;
        let value = counters.last_uid.fetch_add(1, Ordering::SeqCst) + 1;
        ImapUid::new(value).ok_or_else(|| MailboxError::Storage(anyhow!("uid counter overflow")))
    }

    /// Allocate the next MODSEQ for `mailbox`.
    pub async fn next_modseq<S>(&self, store: &S, mailbox: &Mailbox<Id>) -> Result<ModSeq>
    where
        S: MessageStore + Backend<Id = Id> + ?Sized,
    {
        let counters = self.counters(&mailbox.id);
        self.seed(&counters, store, mailbox).await?;
        let value = counters.highest_modseq.fetch_add(1, Ordering::SeqCst) + 1;
        ModSeq::new(value).ok_or_else(|| MailboxError::Storage(anyhow!("modseq counter overflow")))
    }

    /// The last issued UID, without allocating; 0 when none was ever issued.
    pub async fn current_uid<S>(&self, store: &S, mailbox: &Mailbox<Id>) -> Result<u32>
    where
        S: MessageStore + Backend<Id = Id> + ?Sized,
    {
        let counters = self.counters(&mailbox.id);
        self.seed(&counters, store, mailbox).await?;
        Ok(counters.last_uid.load(Ordering::SeqCst))
    }

    /// The last issued MODSEQ, without allocating.
    pub async fn current_modseq<S>(&self, store: &S, mailbox: &Mailbox<Id>) -> Result<u64>
    where
        S: MessageStore + Backend<Id = Id> + ?Sized,
    {
        let counters = self.counters(&mailbox.id);
        self.seed(&counters, store, mailbox).await?;
        Ok(counters.highest_modseq.load(Ordering::SeqCst))
    }

    /// Drop the cached counters of a deleted mailbox. A mailbox re-created
    /// under the same id starts over from its backend-derived values.
    pub fn forget(&self, id: &Id) {
        self.entries.lock().unwrap().remove(id);
    }

    fn counters(&self, id: &Id) -> Arc<MailboxCounters> {
        let mut entries = self.entries.lock().unwrap();
        entries.entry(id.clone()).or_default().clone()
    }

    async fn seed<S>(
        &self,
        counters: &MailboxCounters,
        store: &S,
        mailbox: &Mailbox<Id>,
    ) -> Result<()>
    where
        S: MessageStore + Backend<Id = Id> + ?Sized,
    {
        counters
            .seeded
            .get_or_try_init(|| async {
                let mut last_uid = store.calculate_last_uid(&mailbox.id).await?;
                if last_uid == 0 {
                    // The backend could not (or would not) derive a value;
                    // trust the hint persisted on the mailbox.
                    last_uid = mailbox.last_known_uid;
                }

                let mut highest_modseq = store.calculate_highest_modseq(&mailbox.id).await?;
                if highest_modseq == 0 {
                    highest_modseq = mailbox.highest_known_modseq;
                }

                counters.last_uid.store(last_uid, Ordering::SeqCst);
                counters.highest_modseq.store(highest_modseq, Ordering::SeqCst);
                tracing::debug!(
                    mailbox = ?mailbox.id,
                    last_uid,
                    highest_modseq,
                    "seeded sequence counters"
                );
                Ok::<_, MailboxError>(())
            })
            .await?;
        Ok(())
    }
}
