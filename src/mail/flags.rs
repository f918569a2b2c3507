use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::mail::message::{ImapUid, ModSeq};

/// A message flag: one of the system flags or a user keyword.
/// Non standard but common keywords:
/// https://www.iana.org/assignments/imap-jmap-keywords/imap-jmap-keywords.xhtml
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Flag {
    Seen,
    Answered,
    Draft,
    Flagged,
    Recent,
    Deleted,
    Keyword(String),
}

impl Flag {
    pub fn is_system(&self) -> bool {
        !matches!(self, Flag::Keyword(_))
    }

    /// The flags a client may set permanently; Recent is session-owned.
    pub fn permanent() -> Vec<Flag> {
        vec![
            Flag::Seen,
            Flag::Answered,
            Flag::Draft,
            Flag::Flagged,
            Flag::Deleted,
        ]
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Flag::Seen => write!(f, "\\Seen"),
            Flag::Answered => write!(f, "\\Answered"),
            Flag::Draft => write!(f, "\\Draft"),
            Flag::Flagged => write!(f, "\\Flagged"),
            Flag::Recent => write!(f, "\\Recent"),
            Flag::Deleted => write!(f, "\\Deleted"),
            Flag::Keyword(kw) => write!(f, "{}", kw),
        }
    }
}

pub type FlagSet = BTreeSet<Flag>;

/// Outcome of one message's flag change inside an update batch.
/// Every entry of a batch carries the same freshly allocated modseq.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdatedFlags {
    pub uid: ImapUid,
    pub old_flags: FlagSet,
    pub new_flags: FlagSet,
    pub modseq: ModSeq,
}

pub fn flag_set<I: IntoIterator<Item = Flag>>(flags: I) -> FlagSet {
    flags.into_iter().collect()
}
