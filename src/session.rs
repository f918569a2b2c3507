use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{MailboxError, Result};
use crate::mail::mailbox::MailboxPath;
use crate::mail::message::ImapUid;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// One logged-in user's handle on the store. A session is single-threaded
/// with respect to the mappers it owns; distinct sessions run concurrently.
/// Once closed, every mapper call made through it fails.
pub struct MailboxSession {
    id: u64,
    user: String,
    open: AtomicBool,
    span: tracing::Span,
    /// UIDs this session owns the Recent flag for, per mailbox.
    recent: Mutex<HashMap<MailboxPath, BTreeSet<ImapUid>>>,
}

impl MailboxSession {
    pub(crate) fn new(user: impl Into<String>) -> Arc<Self> {
        let user = user.into();
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let span = tracing::info_span!("mailbox_session", session = id, user = %user);
        Arc::new(Self {
            id,
            user,
            open: AtomicBool::new(true),
            span,
            recent: Mutex::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// The session's log sink: operations on its behalf record under this
    /// span.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(MailboxError::SessionClosed)
        }
    }

    pub(crate) fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    /// Take ownership of the Recent flag for these messages. Ownership is
    /// claimed by the first session that observes them and lives until the
    /// session releases the mailbox.
    pub(crate) fn claim_recent<I>(&self, path: &MailboxPath, uids: I)
    where
        I: IntoIterator<Item = ImapUid>,
    {
        let mut recent = self.recent.lock().unwrap();
        recent.entry(path.clone()).or_default().extend(uids);
    }

    /// The Recent set this session owns for `path`; empty when it owns none.
    pub fn recent_uids(&self, path: &MailboxPath) -> BTreeSet<ImapUid> {
        self.recent
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn release_recent(&self, path: &MailboxPath) -> BTreeSet<ImapUid> {
        self.recent.lock().unwrap().remove(path).unwrap_or_default()
    }

    pub(crate) fn release_all_recent(&self) -> HashMap<MailboxPath, BTreeSet<ImapUid>> {
        std::mem::take(&mut *self.recent.lock().unwrap())
    }
}
