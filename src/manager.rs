use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::{MailboxError, Result};
use crate::event::EventDispatcher;
use crate::mail::flags::{Flag, FlagSet, UpdatedFlags};
use crate::mail::mailbox::{Mailbox, MailboxPath, INBOX};
use crate::mail::message::{
    FetchType, ImapUid, Message, MessageDraft, MessageMetadata, UidRange,
};
use crate::mail::search::{SearchIndex, SearchQuery};
use crate::mapper::store::{Backend, StoreBuilder};
use crate::mapper::{StoreMailboxMapper, StoreMessageMapper, StoreSubscriptionMapper};
use crate::sequence::SequenceRegistry;
use crate::session::MailboxSession;

pub type IdOf<B> = <<B as StoreBuilder>::Store as Backend>::Id;

/// Hands out the session-scoped mappers. The registry and dispatcher behind
/// it are shared by every session of this factory, which is exactly the
/// sharing the engine relies on: uid/modseq allocation and event delivery
/// are per-store, not per-session.
pub struct SessionMapperFactory<B: StoreBuilder> {
    builder: Arc<B>,
    registry: Arc<SequenceRegistry<IdOf<B>>>,
    dispatcher: Arc<EventDispatcher>,
    index: Option<Arc<dyn SearchIndex<IdOf<B>>>>,
    delimiter: char,
}

impl<B: StoreBuilder> SessionMapperFactory<B> {
    pub fn new(builder: B, delimiter: char) -> Self {
        Self {
            builder: Arc::new(builder),
            registry: Arc::new(SequenceRegistry::new()),
            dispatcher: Arc::new(EventDispatcher::new()),
            index: None,
            delimiter,
        }
    }

    /// Plug in an external search index; queries are then delegated to it
    /// wholesale.
    pub fn with_index(mut self, index: Arc<dyn SearchIndex<IdOf<B>>>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    pub fn registry(&self) -> &Arc<SequenceRegistry<IdOf<B>>> {
        &self.registry
    }

    pub fn delimiter(&self) -> char {
        self.delimiter
    }

    pub async fn create_message_mapper(
        &self,
        session: &Arc<MailboxSession>,
    ) -> Result<StoreMessageMapper<B::Store>> {
        let store = Arc::new(self.builder.build().await?);
        Ok(StoreMessageMapper::new(
            store,
            self.registry.clone(),
            self.dispatcher.clone(),
            self.index.clone(),
            session.clone(),
        ))
    }

    pub async fn create_mailbox_mapper(
        &self,
        session: &Arc<MailboxSession>,
    ) -> Result<StoreMailboxMapper<B::Store>> {
        let store = Arc::new(self.builder.build().await?);
        Ok(StoreMailboxMapper::new(
            store,
            self.dispatcher.clone(),
            session.clone(),
            self.delimiter,
        ))
    }

    pub async fn create_subscription_mapper(
        &self,
        session: &Arc<MailboxSession>,
    ) -> Result<StoreSubscriptionMapper<B::Store>> {
        let store = Arc::new(self.builder.build().await?);
        Ok(StoreSubscriptionMapper::new(store, session.clone()))
    }
}

/// ACL resolution is an external collaborator; the engine only asks it
/// yes/no questions.
pub trait AccessOracle: Send + Sync {
    fn may_enumerate(&self, session: &MailboxSession, mailbox: &MailboxPath) -> bool;
}

/// The default oracle: a session enumerates the mailboxes its own user owns.
pub struct OwnerOracle;

impl AccessOracle for OwnerOracle {
    fn may_enumerate(&self, session: &MailboxSession, mailbox: &MailboxPath) -> bool {
        mailbox.user.as_deref() == Some(session.user())
    }
}

/// The session-facing entry point of the store.
pub struct MailboxManager<B: StoreBuilder> {
    factory: Arc<SessionMapperFactory<B>>,
    oracle: Arc<dyn AccessOracle>,
}

impl<B: StoreBuilder> MailboxManager<B> {
    pub fn new(builder: B, delimiter: char) -> Self {
        Self {
            factory: Arc::new(SessionMapperFactory::new(builder, delimiter)),
            oracle: Arc::new(OwnerOracle),
        }
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn AccessOracle>) -> Self {
        self.oracle = oracle;
        self
    }

    pub fn factory(&self) -> &Arc<SessionMapperFactory<B>> {
        &self.factory
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        self.factory.dispatcher()
    }

    pub fn create_system_session(&self, user: &str) -> Arc<MailboxSession> {
        let session = MailboxSession::new(user);
        tracing::debug!(session = session.id(), user, "session created");
        session
    }

    pub fn start_processing_request(&self, session: &MailboxSession) -> Result<()> {
        session.ensure_open()?;
        tracing::trace!(session = session.id(), "request processing started");
        Ok(())
    }

    pub fn end_processing_request(&self, session: &MailboxSession) {
        tracing::trace!(session = session.id(), "request processing ended");
        if !session.is_open() {
            // The session was logged out during this request; whatever
            // Recent state it still owned dies with it.
            session.release_all_recent();
        }
    }

    pub fn logout(&self, session: &MailboxSession, force: bool) {
        tracing::debug!(session = session.id(), force, "session logged out");
        session.close();
    }

    pub async fn mailbox_exists(
        &self,
        path: &MailboxPath,
        session: &Arc<MailboxSession>,
    ) -> Result<bool> {
        let mapper = self.factory.create_mailbox_mapper(session).await?;
        Ok(mapper.find_by_path(path).await?.is_some())
    }

    pub async fn create_mailbox(
        &self,
        path: &MailboxPath,
        session: &Arc<MailboxSession>,
    ) -> Result<()> {
        if path.name.is_empty() || path.name.ends_with(self.factory.delimiter()) {
            return Err(MailboxError::Storage(anyhow::anyhow!(
                "invalid mailbox name: {}",
                path.name
            )));
        }
        let mapper = self.factory.create_mailbox_mapper(session).await?;
        mapper.create(path).await?;
        Ok(())
    }

    /// Delete one mailbox. Sub-mailboxes are not cascaded; their paths keep
    /// working after the parent is gone.
    pub async fn delete_mailbox(
        &self,
        path: &MailboxPath,
        session: &Arc<MailboxSession>,
    ) -> Result<()> {
        let mapper = self.factory.create_mailbox_mapper(session).await?;
        let mailbox = mapper
            .find_by_path(path)
            .await?
            .ok_or_else(|| MailboxError::MailboxNotFound(path.clone()))?;
        mapper.delete(&mailbox).await?;
        self.factory.registry().forget(&mailbox.id);
        Ok(())
    }

    /// Rename a mailbox; its sub-mailboxes follow, uid-validity is
    /// preserved, and subscribers of the old path move with it.
    pub async fn rename_mailbox(
        &self,
        path: &MailboxPath,
        new_path: &MailboxPath,
        session: &Arc<MailboxSession>,
    ) -> Result<()> {
        let mapper = self.factory.create_mailbox_mapper(session).await?;
        let mut mailbox = mapper
            .find_by_path(path)
            .await?
            .ok_or_else(|| MailboxError::MailboxNotFound(path.clone()))?;
        mailbox.path = new_path.clone();
        mapper.save(&mailbox).await
    }

    /// Open a mailbox for message operations. The reserved INBOX
    /// materializes on first use; any other missing path is an error. The
    /// session takes over the Recent flag of every message it is first to
    /// observe here.
    pub async fn get_mailbox(
        &self,
        path: &MailboxPath,
        session: &Arc<MailboxSession>,
    ) -> Result<MessageManager<B>> {
        let mailbox_mapper = self.factory.create_mailbox_mapper(session).await?;
        let mailbox = match mailbox_mapper.find_by_path(path).await? {
            Some(mailbox) => mailbox,
            None if path.name == INBOX => mailbox_mapper.create(path).await?,
            None => return Err(MailboxError::MailboxNotFound(path.clone())),
        };

        let mapper = self.factory.create_message_mapper(session).await?;
        let recent = mapper.claim_recent(&mailbox).await?;
        if !recent.is_empty() {
            tracing::debug!(
                session = session.id(),
                mailbox = %mailbox.path,
                count = recent.len(),
                "session took ownership of recent messages"
            );
            session.claim_recent(&mailbox.path, recent);
        }

        Ok(MessageManager {
            factory: self.factory.clone(),
            session: session.clone(),
            path: mailbox.path.clone(),
            mailbox: tokio::sync::Mutex::new(mailbox),
            mapper,
        })
    }

    /// Paths of every mailbox the session may enumerate.
    pub async fn list(&self, session: &Arc<MailboxSession>) -> Result<Vec<MailboxPath>> {
        let mapper = self.factory.create_mailbox_mapper(session).await?;
        Ok(mapper
            .list()
            .await?
            .into_iter()
            .map(|mailbox| mailbox.path)
            .filter(|path| self.oracle.may_enumerate(session, path))
            .collect())
    }

    pub async fn create_subscription_mapper(
        &self,
        session: &Arc<MailboxSession>,
    ) -> Result<StoreSubscriptionMapper<B::Store>> {
        self.factory.create_subscription_mapper(session).await
    }
}

/// Answer of [`MessageManager::get_metadata`].
#[derive(Clone, Debug)]
pub struct MailboxMetadata {
    pub uid_validity: NonZeroU32,
    pub next_uid: ImapUid,
    pub highest_modseq: u64,
    pub message_count: usize,
    pub unseen_count: usize,
    pub first_unseen: Option<ImapUid>,
    pub permanent_flags: Vec<Flag>,
}

/// One session's handle on one mailbox.
pub struct MessageManager<B: StoreBuilder> {
    factory: Arc<SessionMapperFactory<B>>,
    session: Arc<MailboxSession>,
    path: MailboxPath,
    mailbox: tokio::sync::Mutex<Mailbox<IdOf<B>>>,
    mapper: StoreMessageMapper<B::Store>,
}

impl<B: StoreBuilder> MessageManager<B> {
    pub fn path(&self) -> &MailboxPath {
        &self.path
    }

    pub fn session(&self) -> &Arc<MailboxSession> {
        &self.session
    }

    /// Append raw content; returns the assigned uid.
    pub async fn append_message(
        &self,
        raw: &[u8],
        internal_date: DateTime<Utc>,
        is_recent: bool,
        mut flags: FlagSet,
    ) -> Result<ImapUid> {
        if is_recent {
            flags.insert(Flag::Recent);
        } else {
            flags.remove(&Flag::Recent);
        }
        let draft = MessageDraft::new(raw.to_vec(), internal_date, flags);
        let mut mailbox = self.mailbox.lock().await;
        let metadata = self.mapper.add(&mut mailbox, draft).await?;
        Ok(metadata.uid)
    }

    pub async fn get_metadata(&self) -> Result<MailboxMetadata> {
        let mailbox = self.mailbox.lock().await;
        let (last_uid, highest_modseq) = self.mapper.current_sequences(&mailbox).await?;
        let next_uid = last_uid
            .checked_add(1)
            .and_then(ImapUid::new)
            .ok_or_else(|| MailboxError::Storage(anyhow::anyhow!("uid space exhausted")))?;
        Ok(MailboxMetadata {
            uid_validity: mailbox.uid_validity,
            next_uid,
            highest_modseq,
            message_count: self.mapper.count_messages(&mailbox).await?,
            unseen_count: self.mapper.count_unseen(&mailbox).await?,
            first_unseen: self.mapper.find_first_unseen_uid(&mailbox).await?,
            permanent_flags: Flag::permanent(),
        })
    }

    pub async fn get_messages(
        &self,
        range: &UidRange,
        fetch: FetchType,
    ) -> Result<Vec<Message>> {
        let mailbox = self.mailbox.lock().await;
        self.mapper.find_in_mailbox(&mailbox, range, fetch, None).await
    }

    pub async fn set_flags(
        &self,
        range: &UidRange,
        flags: &FlagSet,
        value: bool,
        replace: bool,
    ) -> Result<Vec<UpdatedFlags>> {
        let mut mailbox = self.mailbox.lock().await;
        self.mapper
            .update_flags(&mut mailbox, flags, value, replace, range)
            .await
    }

    pub async fn expunge(&self, range: &UidRange) -> Result<BTreeMap<ImapUid, MessageMetadata>> {
        let mut mailbox = self.mailbox.lock().await;
        self.mapper
            .expunge_marked_for_deletion(&mut mailbox, range)
            .await
    }

    /// Copy the messages of `range` into the mailbox at `destination`,
    /// which must exist. Returns the fresh metadata in source uid order.
    pub async fn copy_to(
        &self,
        range: &UidRange,
        destination: &MailboxPath,
    ) -> Result<Vec<MessageMetadata>> {
        let mailbox_mapper = self.factory.create_mailbox_mapper(&self.session).await?;
        let mut dest = mailbox_mapper
            .find_by_path(destination)
            .await?
            .ok_or_else(|| MailboxError::MailboxNotFound(destination.clone()))?;

        let source = self.mailbox.lock().await;
        let messages = self
            .mapper
            .find_in_mailbox(&source, range, FetchType::Metadata, None)
            .await?;

        let mut copied = vec![];
        for message in &messages {
            copied.push(self.mapper.copy(&mut dest, &source, message).await?);
        }
        Ok(copied)
    }

    pub async fn search(&self, query: &SearchQuery) -> Result<Vec<ImapUid>> {
        let mailbox = self.mailbox.lock().await;
        self.mapper.search(&mailbox, query).await
    }

    /// Uids whose Recent flag this session owns.
    pub fn recent_uids(&self) -> Vec<ImapUid> {
        self.session.recent_uids(&self.path).into_iter().collect()
    }
}
