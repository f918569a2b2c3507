use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use itertools::Itertools;

use crate::error::{MailboxError, Result};
use crate::event::{EventDispatcher, MailboxEvent};
use crate::mail::flags::{Flag, FlagSet, UpdatedFlags};
use crate::mail::mailbox::Mailbox;
use crate::mail::message::{
    FetchType, ImapUid, Message, MessageDraft, MessageMetadata, UidRange,
};
use crate::mail::search::{SearchIndex, SearchQuery};
use crate::mapper::store::MessageStore;
use crate::sequence::SequenceRegistry;
use crate::session::MailboxSession;
use crate::transaction::TransactionRunner;

/// The message-mapper contract, implemented once over the backend
/// primitives. A mapper instance is scoped to one session; every operation
/// checks the session and runs inside a transactional frame.
pub struct StoreMessageMapper<S: MessageStore> {
    store: Arc<S>,
    registry: Arc<SequenceRegistry<S::Id>>,
    dispatcher: Arc<EventDispatcher>,
    index: Option<Arc<dyn SearchIndex<S::Id>>>,
    session: Arc<MailboxSession>,
    tx: TransactionRunner,
}

impl<S: MessageStore> StoreMessageMapper<S> {
    pub fn new(
        store: Arc<S>,
        registry: Arc<SequenceRegistry<S::Id>>,
        dispatcher: Arc<EventDispatcher>,
        index: Option<Arc<dyn SearchIndex<S::Id>>>,
        session: Arc<MailboxSession>,
    ) -> Self {
        Self {
            store,
            registry,
            dispatcher,
            index,
            session,
            tx: TransactionRunner::new(),
        }
    }

    pub fn session(&self) -> &Arc<MailboxSession> {
        &self.session
    }

    pub async fn count_messages(&self, mailbox: &Mailbox<S::Id>) -> Result<usize> {
        self.session.ensure_open()?;
        let store = self.store.as_ref();
        self.tx
            .execute(store, async {
                let found = store
                    .find_in_mailbox(&mailbox.id, &UidRange::All, FetchType::Metadata, None)
                    .await?;
                Ok(found.len())
            })
            .await
    }

    pub async fn count_unseen(&self, mailbox: &Mailbox<S::Id>) -> Result<usize> {
        self.session.ensure_open()?;
        let store = self.store.as_ref();
        self.tx
            .execute(store, async {
                Ok(store.find_unseen_uids(&mailbox.id).await?.len())
            })
            .await
    }

    pub async fn find_in_mailbox(
        &self,
        mailbox: &Mailbox<S::Id>,
        range: &UidRange,
        fetch: FetchType,
        limit: Option<usize>,
    ) -> Result<Vec<Message>> {
        self.session.ensure_open()?;
        let store = self.store.as_ref();
        self.tx
            .execute(store, async {
                let mut found = store
                    .find_in_mailbox(&mailbox.id, range, fetch, limit)
                    .await?;
                // Backends already deliver ascending; enforce the contract
                // anyway so a sloppy adapter cannot leak out of order.
                found.sort_by_key(|m| m.uid());
                if let Some(limit) = limit {
                    found.truncate(limit);
                }
                Ok(found)
            })
            .await
    }

    pub async fn find_recent_uids(&self, mailbox: &Mailbox<S::Id>) -> Result<Vec<ImapUid>> {
        self.session.ensure_open()?;
        let store = self.store.as_ref();
        self.tx
            .execute(store, async {
                let mut uids = store.find_recent_uids(&mailbox.id).await?;
                uids.sort();
                Ok(uids)
            })
            .await
    }

    pub async fn find_first_unseen_uid(&self, mailbox: &Mailbox<S::Id>) -> Result<Option<ImapUid>> {
        self.session.ensure_open()?;
        let store = self.store.as_ref();
        self.tx
            .execute(store, async {
                Ok(store.find_unseen_uids(&mailbox.id).await?.into_iter().min())
            })
            .await
    }

    /// Append a message: assign the next uid and modseq, persist, announce.
    pub async fn add(
        &self,
        mailbox: &mut Mailbox<S::Id>,
        draft: MessageDraft,
    ) -> Result<MessageMetadata> {
        self.session.ensure_open()?;
        let store = self.store.as_ref();
        let metadata = self
            .tx
            .execute(store, async {
                let uid = self.registry.next_uid(store, mailbox).await?;
                let modseq = self.registry.next_modseq(store, mailbox).await?;

                let metadata = MessageMetadata {
                    uid,
                    modseq,
                    internal_date: draft.internal_date,
                    size: draft.size(),
                    flags: draft.flags.clone(),
                };
                let message = Message {
                    metadata: metadata.clone(),
                    headers: Some(draft.headers()),
                    body: Some(draft.raw),
                };
                store.save(&mailbox.id, &message).await?;
                self.persist_sequences(mailbox).await?;

                tracing::debug!(
                    mailbox = %mailbox.path,
                    uid = uid.get(),
                    size = metadata.size,
                    "message appended"
                );
                Ok(metadata)
            })
            .await?;

        self.dispatcher.dispatch(&MailboxEvent::MessageAdded {
            path: mailbox.path.clone(),
            metadata: metadata.clone(),
        });
        Ok(metadata)
    }

    /// Copy `source` into `mailbox` under a fresh uid and modseq. Flags are
    /// preserved, except that the copy is born Recent.
    pub async fn copy(
        &self,
        mailbox: &mut Mailbox<S::Id>,
        source_mailbox: &Mailbox<S::Id>,
        source: &Message,
    ) -> Result<MessageMetadata> {
        self.session.ensure_open()?;
        let store = self.store.as_ref();
        let metadata = self
            .tx
            .execute(store, async {
                let metadata = self.duplicate(mailbox, source_mailbox, source).await?;
                self.persist_sequences(mailbox).await?;
                Ok(metadata)
            })
            .await?;

        self.dispatcher.dispatch(&MailboxEvent::MessageAdded {
            path: mailbox.path.clone(),
            metadata: metadata.clone(),
        });
        Ok(metadata)
    }

    /// Relocate `source` into `mailbox`. Optional: a backend that cannot
    /// natively move refuses and the error reaches the caller untouched.
    pub async fn move_message(
        &self,
        mailbox: &mut Mailbox<S::Id>,
        source_mailbox: &Mailbox<S::Id>,
        source: &Message,
    ) -> Result<MessageMetadata> {
        self.session.ensure_open()?;
        if !self.store.supports_move() {
            return Err(MailboxError::NotSupported("move"));
        }

        let store = self.store.as_ref();
        let metadata = self
            .tx
            .execute(store, async {
                let metadata = self.duplicate(mailbox, source_mailbox, source).await?;
                store.delete(&source_mailbox.id, source.uid()).await?;
                self.persist_sequences(mailbox).await?;
                Ok(metadata)
            })
            .await?;

        self.dispatcher.dispatch(&MailboxEvent::MessageAdded {
            path: mailbox.path.clone(),
            metadata: metadata.clone(),
        });
        self.dispatcher.dispatch(&MailboxEvent::MessageExpunged {
            path: source_mailbox.path.clone(),
            first: source.uid(),
            last: source.uid(),
        });
        Ok(metadata)
    }

    /// Apply a flag change to every message in `range`. Messages whose flag
    /// set actually changes all share one newly allocated modseq; untouched
    /// messages produce neither an entry nor an event.
    pub async fn update_flags(
        &self,
        mailbox: &mut Mailbox<S::Id>,
        flags: &FlagSet,
        value: bool,
        replace: bool,
        range: &UidRange,
    ) -> Result<Vec<UpdatedFlags>> {
        self.session.ensure_open()?;
        let store = self.store.as_ref();
        let updated = self
            .tx
            .execute(store, async {
                let candidates = store
                    .find_in_mailbox(&mailbox.id, range, FetchType::Metadata, None)
                    .await?;

                let mut pending: Vec<(Message, FlagSet)> = vec![];
                for message in candidates {
                    let old_flags = message.metadata.flags.clone();
                    let new_flags = apply_flag_change(&old_flags, flags, value, replace);
                    if new_flags != old_flags {
                        pending.push((message, new_flags));
                    }
                }

                if pending.is_empty() {
                    return Ok(vec![]);
                }

                // One modseq for the whole batch
                let modseq = self.registry.next_modseq(store, mailbox).await?;

                let mut updated = vec![];
                for (mut message, new_flags) in pending {
                    let old_flags = message.metadata.flags.clone();
                    message.metadata.flags = new_flags.clone();
                    message.metadata.modseq = modseq;
                    store.save(&mailbox.id, &message).await?;
                    updated.push(UpdatedFlags {
                        uid: message.uid(),
                        old_flags,
                        new_flags,
                        modseq,
                    });
                }
                self.persist_sequences(mailbox).await?;
                Ok(updated)
            })
            .await?;

        for update in &updated {
            self.dispatcher.dispatch(&MailboxEvent::FlagsUpdated {
                path: mailbox.path.clone(),
                update: update.clone(),
            });
        }
        Ok(updated)
    }

    /// Remove every message in `range` that carries the Deleted flag.
    /// Returns the pre-deletion metadata keyed by uid. A non-empty expunge
    /// carries the counters forward and persists them, so re-derived
    /// sequences can never fall back below the expunged uids; an empty one
    /// leaves them untouched.
    pub async fn expunge_marked_for_deletion(
        &self,
        mailbox: &mut Mailbox<S::Id>,
        range: &UidRange,
    ) -> Result<BTreeMap<ImapUid, MessageMetadata>> {
        self.session.ensure_open()?;
        let store = self.store.as_ref();
        let removed = self
            .tx
            .execute(store, async {
                let doomed = store
                    .find_in_mailbox(&mailbox.id, range, FetchType::Metadata, None)
                    .await?
                    .into_iter()
                    .filter(|m| m.metadata.flags.contains(&Flag::Deleted))
                    .collect::<Vec<_>>();

                if doomed.is_empty() {
                    return Ok(BTreeMap::new());
                }

                let mut removed = BTreeMap::new();
                for message in doomed {
                    store.delete(&mailbox.id, message.uid()).await?;
                    removed.insert(message.uid(), message.metadata);
                }

                // Expunge is a modification of the mailbox
                self.registry.next_modseq(store, mailbox).await?;
                self.persist_sequences(mailbox).await?;
                Ok(removed)
            })
            .await?;

        for (first, last) in contiguous_runs(removed.keys().copied()) {
            self.dispatcher.dispatch(&MailboxEvent::MessageExpunged {
                path: mailbox.path.clone(),
                first,
                last,
            });
        }
        Ok(removed)
    }

    /// Ascending uids matching `query`. With an external index configured
    /// the whole query is delegated; a bare uid query never loads messages;
    /// everything else evaluates candidates one by one.
    pub async fn search(
        &self,
        mailbox: &Mailbox<S::Id>,
        query: &SearchQuery,
    ) -> Result<Vec<ImapUid>> {
        self.session.ensure_open()?;

        if let Some(index) = &self.index {
            let mut uids = index.search(&mailbox.id, query).await?;
            uids.sort();
            uids.dedup();
            return Ok(uids);
        }

        let store = self.store.as_ref();
        self.tx
            .execute(store, async {
                if let Some(ranges) = query.as_uid_only() {
                    let mut uids = BTreeSet::new();
                    for range in ranges {
                        let found = store
                            .find_in_mailbox(&mailbox.id, range, FetchType::Metadata, None)
                            .await?;
                        uids.extend(found.into_iter().map(|m| m.uid()));
                    }
                    return Ok(uids.into_iter().collect());
                }

                let fetch = if query.needs_body() {
                    FetchType::Full
                } else if query.needs_headers() {
                    FetchType::Headers
                } else {
                    FetchType::Metadata
                };
                let recent = self.session.recent_uids(&mailbox.path);
                let hits = store
                    .find_in_mailbox(&mailbox.id, &UidRange::All, fetch, None)
                    .await?
                    .into_iter()
                    .filter(|message| query.matches(message, &recent))
                    .map(|message| message.uid())
                    .collect::<BTreeSet<_>>();
                Ok(hits.into_iter().collect())
            })
            .await
    }

    /// Registry values for metadata answers: (last uid, highest modseq).
    pub async fn current_sequences(&self, mailbox: &Mailbox<S::Id>) -> Result<(u32, u64)> {
        self.session.ensure_open()?;
        let store = self.store.as_ref();
        let uid = self.registry.current_uid(store, mailbox).await?;
        let modseq = self.registry.current_modseq(store, mailbox).await?;
        Ok((uid, modseq))
    }

    /// Strip the Recent flag without advancing modseq or producing events:
    /// Recent is session state, not a client-visible modification.
    pub(crate) async fn claim_recent(
        &self,
        mailbox: &Mailbox<S::Id>,
    ) -> Result<Vec<ImapUid>> {
        self.session.ensure_open()?;
        let store = self.store.as_ref();
        self.tx
            .execute(store, async {
                let uids = store.find_recent_uids(&mailbox.id).await?;
                if uids.is_empty() {
                    return Ok(uids);
                }
                let recent = store
                    .find_in_mailbox(&mailbox.id, &UidRange::All, FetchType::Metadata, None)
                    .await?
                    .into_iter()
                    .filter(|m| m.metadata.flags.contains(&Flag::Recent));
                for mut message in recent {
                    message.metadata.flags.remove(&Flag::Recent);
                    store.save(&mailbox.id, &message).await?;
                }
                Ok(uids)
            })
            .await
    }

    async fn duplicate(
        &self,
        mailbox: &mut Mailbox<S::Id>,
        source_mailbox: &Mailbox<S::Id>,
        source: &Message,
    ) -> Result<MessageMetadata> {
        let store = self.store.as_ref();
        let uid = self.registry.next_uid(store, mailbox).await?;
        let modseq = self.registry.next_modseq(store, mailbox).await?;

        let mut flags = source.metadata.flags.clone();
        flags.insert(Flag::Recent);
        let metadata = MessageMetadata {
            uid,
            modseq,
            internal_date: source.metadata.internal_date,
            size: source.metadata.size,
            flags,
        };
        store
            .copy(&source_mailbox.id, source.uid(), &mailbox.id, &metadata)
            .await?;
        Ok(metadata)
    }

    /// Push the registry high-water marks into the store and onto the
    /// mailbox value so they survive restarts.
    async fn persist_sequences(&self, mailbox: &mut Mailbox<S::Id>) -> Result<()> {
        let store = self.store.as_ref();
        let last_uid = self.registry.current_uid(store, mailbox).await?;
        let highest_modseq = self.registry.current_modseq(store, mailbox).await?;
        store
            .save_sequences(&mailbox.id, last_uid, highest_modseq)
            .await?;
        mailbox.last_known_uid = last_uid;
        mailbox.highest_known_modseq = highest_modseq;
        Ok(())
    }
}

fn apply_flag_change(old: &FlagSet, flags: &FlagSet, value: bool, replace: bool) -> FlagSet {
    if replace {
        // Recent is not client-assignable; replacement keeps it as-is
        let mut new: FlagSet = flags.clone();
        if old.contains(&Flag::Recent) {
            new.insert(Flag::Recent);
        } else {
            new.remove(&Flag::Recent);
        }
        new
    } else if value {
        old.union(flags).cloned().collect()
    } else {
        old.difference(flags).cloned().collect()
    }
}

/// Collapse ascending uids into (first, last) runs of consecutive values.
fn contiguous_runs<I: IntoIterator<Item = ImapUid>>(uids: I) -> Vec<(ImapUid, ImapUid)> {
    let mut runs = vec![];
    for (_, group) in &uids
        .into_iter()
        .enumerate()
        .group_by(|(index, uid)| uid.get() as i64 - *index as i64)
    {
        let run: Vec<ImapUid> = group.map(|(_, uid)| uid).collect();
        if let (Some(first), Some(last)) = (run.first(), run.last()) {
            runs.push((*first, *last));
        }
    }
    runs
}
