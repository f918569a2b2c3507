use std::sync::Arc;

use crate::error::Result;
use crate::mapper::store::SubscriptionStore;
use crate::session::MailboxSession;
use crate::transaction::TransactionRunner;

/// Subscription list handling for the session's user.
pub struct StoreSubscriptionMapper<S: SubscriptionStore> {
    store: Arc<S>,
    session: Arc<MailboxSession>,
    tx: TransactionRunner,
}

impl<S: SubscriptionStore> StoreSubscriptionMapper<S> {
    pub fn new(store: Arc<S>, session: Arc<MailboxSession>) -> Self {
        Self {
            store,
            session,
            tx: TransactionRunner::new(),
        }
    }

    /// Subscribe the session's user to a mailbox name. Idempotent.
    pub async fn subscribe(&self, mailbox: &str) -> Result<()> {
        self.session.ensure_open()?;
        let store = self.store.as_ref();
        let user = self.session.user();
        self.tx
            .execute(store, async { store.add_subscription(user, mailbox).await })
            .await
    }

    /// Drop a subscription; unknown names are not an error.
    pub async fn unsubscribe(&self, mailbox: &str) -> Result<()> {
        self.session.ensure_open()?;
        let store = self.store.as_ref();
        let user = self.session.user();
        self.tx
            .execute(store, async {
                store.remove_subscription(user, mailbox).await
            })
            .await
    }

    /// Sorted subscribed names of the session's user.
    pub async fn subscriptions(&self) -> Result<Vec<String>> {
        self.session.ensure_open()?;
        let store = self.store.as_ref();
        let user = self.session.user();
        self.tx
            .execute(store, async { store.list_subscriptions(user).await })
            .await
    }
}
