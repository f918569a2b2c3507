use std::num::NonZeroU32;

use async_trait::async_trait;

use crate::error::{MailboxError, Result};
use crate::mail::mailbox::{Mailbox, MailboxId, MailboxPath};
use crate::mail::message::{FetchType, ImapUid, Message, MessageMetadata, UidRange};
use crate::transaction::TransactionBackend;

/// A backend connection. Connections are per-session and never shared
/// across threads; the data they reach may well be.
pub trait Backend: TransactionBackend + Send + Sync + 'static {
    /// The backend-native mailbox identifier.
    type Id: MailboxId;
}

/// The query and persistence primitives a backend contributes to the
/// message-mapper contract. Everything else — counting, uid/modseq
/// allocation, flag batches, expunge bookkeeping, search — lives once in
/// [`StoreMessageMapper`](crate::mapper::message::StoreMessageMapper) and is
/// shared by every backend.
#[async_trait]
pub trait MessageStore: Backend {
    /// Messages of `mailbox` whose uid falls in `range`, ascending by uid,
    /// at most `limit` of them. `fetch` bounds how much content is loaded.
    async fn find_in_mailbox(
        &self,
        mailbox: &Self::Id,
        range: &UidRange,
        fetch: FetchType,
        limit: Option<usize>,
    ) -> Result<Vec<Message>>;

    /// Ascending uids of messages carrying the Recent flag.
    async fn find_recent_uids(&self, mailbox: &Self::Id) -> Result<Vec<ImapUid>>;

    /// Ascending uids of messages lacking the Seen flag.
    async fn find_unseen_uids(&self, mailbox: &Self::Id) -> Result<Vec<ImapUid>>;

    /// Insert a new message (full content required) or update the metadata
    /// of an existing one; an update never touches headers or body.
    async fn save(&self, mailbox: &Self::Id, message: &Message) -> Result<()>;

    /// Remove one message.
    async fn delete(&self, mailbox: &Self::Id, uid: ImapUid) -> Result<()>;

    /// Materialize a copy of `source` in `destination` under fresh metadata.
    /// The default loads the full source message and saves the duplicate;
    /// backends with a cheaper native copy override it.
    async fn copy(
        &self,
        source_mailbox: &Self::Id,
        source_uid: ImapUid,
        destination: &Self::Id,
        metadata: &MessageMetadata,
    ) -> Result<()> {
        let mut found = self
            .find_in_mailbox(
                source_mailbox,
                &UidRange::One(source_uid),
                FetchType::Full,
                Some(1),
            )
            .await?;
        let mut message = found.pop().ok_or(MailboxError::MessageNotFound {
            uid: source_uid.get(),
        })?;
        message.metadata = metadata.clone();
        self.save(destination, &message).await
    }

    /// Whether the backend can relocate messages natively; refusing is
    /// allowed, the mapper then surfaces NotSupported.
    fn supports_move(&self) -> bool {
        false
    }

    /// Derive the last assigned uid from stored data; 0 when that is not
    /// cheaply computable (the registry then falls back to the persisted
    /// mailbox hint).
    async fn calculate_last_uid(&self, mailbox: &Self::Id) -> Result<u32>;

    /// Derive the highest modseq from stored data; 0 when not computable.
    async fn calculate_highest_modseq(&self, mailbox: &Self::Id) -> Result<u64>;

    /// Persist the counter high-water marks, atomically with respect to the
    /// surrounding transaction.
    async fn save_sequences(
        &self,
        mailbox: &Self::Id,
        last_uid: u32,
        highest_modseq: u64,
    ) -> Result<()>;
}

/// Mailbox-level persistence primitives.
#[async_trait]
pub trait MailboxStore: Backend {
    async fn find_by_id(&self, id: &Self::Id) -> Result<Option<Mailbox<Self::Id>>>;

    async fn find_by_path(&self, path: &MailboxPath) -> Result<Option<Mailbox<Self::Id>>>;

    /// Create a mailbox at `path`, stamping it with an immutable
    /// uid-validity. Fails with MailboxExists when the path is taken.
    async fn insert(&self, path: &MailboxPath) -> Result<Mailbox<Self::Id>>;

    /// Replace the stored attributes of an existing mailbox (path on
    /// rename, counters, ACL). The id and uid-validity never change.
    async fn update(&self, mailbox: &Mailbox<Self::Id>) -> Result<()>;

    /// Remove the mailbox and the messages it owns. Sub-mailboxes are left
    /// alone.
    async fn delete(&self, id: &Self::Id) -> Result<()>;

    /// Every stored mailbox, ordered by path.
    async fn list(&self) -> Result<Vec<Mailbox<Self::Id>>>;
}

/// IMAP subscription persistence.
#[async_trait]
pub trait SubscriptionStore: Backend {
    async fn add_subscription(&self, user: &str, mailbox: &str) -> Result<()>;
    async fn remove_subscription(&self, user: &str, mailbox: &str) -> Result<()>;
    /// Sorted mailbox names the user subscribed to.
    async fn list_subscriptions(&self, user: &str) -> Result<Vec<String>>;
}

/// The full backend surface a session store exposes.
pub trait Store: MessageStore + MailboxStore + SubscriptionStore {}

impl<T> Store for T where T: MessageStore + MailboxStore + SubscriptionStore {}

/// Hands out per-session store connections, like a connection pool front.
#[async_trait]
pub trait StoreBuilder: Send + Sync + 'static {
    type Store: Store;

    async fn build(&self) -> Result<Self::Store>;
}

/// Stamp for freshly created mailboxes: uid-validity values must be non-zero
/// and, within one store, never repeat for the same path.
pub fn uid_validity_from(raw: u32) -> NonZeroU32 {
    NonZeroU32::new(raw).unwrap_or(NonZeroU32::MIN)
}
