use crate::mail::mailbox::MailboxPath;

/// Error taxonomy surfaced by the mapper contracts and the session API.
/// The IMAP layer maps these to response codes; storage faults carry their
/// backend context.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("bad credentials")]
    BadCredentials,

    #[error("mailbox does not exist: {0}")]
    MailboxNotFound(MailboxPath),

    #[error("mailbox already exists: {0}")]
    MailboxExists(MailboxPath),

    #[error("message {uid} does not exist")]
    MessageNotFound { uid: u32 },

    #[error(transparent)]
    Storage(#[from] anyhow::Error),

    #[error("operation not supported: {0}")]
    NotSupported(&'static str),

    #[error("unsupported search criterion")]
    UnsupportedSearch,

    #[error("session is closed")]
    SessionClosed,
}

pub type Result<T> = std::result::Result<T, MailboxError>;
