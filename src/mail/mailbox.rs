use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hash;
use std::num::NonZeroU32;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// The personal namespace; shared and other-user namespaces are partitions
/// the path-policy layer may add on top.
pub const PERSONAL_NAMESPACE: &str = "#private";

/// INBOX is a reserved name within a user namespace: it always refers to the
/// same mailbox regardless of the case the client spelled it with.
pub const INBOX: &str = "INBOX";

/// Bound on the backend-native mailbox identifier. Backends pick an integer,
/// a string, or any other value that is equatable, hashable and
/// serializable; the mapper contracts are parametric over it.
pub trait MailboxId:
    Clone + Eq + Hash + fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

impl<T> MailboxId for T where
    T: Clone + Eq + Hash + fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

/// Where a mailbox lives: namespace, owning user, and its name within that
/// user's hierarchy. The name is an opaque value; hierarchy is only visible
/// through the delimiter handed around alongside paths.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MailboxPath {
    pub namespace: String,
    pub user: Option<String>,
    pub name: String,
}

impl MailboxPath {
    pub fn new(
        namespace: impl Into<String>,
        user: Option<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            user,
            name: name.into(),
        }
    }

    /// A path in the user's personal namespace. The reserved INBOX name is
    /// normalized to its canonical spelling.
    pub fn personal(user: impl Into<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        let name = if name.eq_ignore_ascii_case(INBOX) {
            INBOX.to_string()
        } else {
            name
        };
        Self {
            namespace: PERSONAL_NAMESPACE.to_string(),
            user: Some(user.into()),
            name,
        }
    }

    /// Same mailbox tree position, different name.
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            namespace: self.namespace.clone(),
            user: self.user.clone(),
            name: name.into(),
        }
    }

    /// Whether `self` sits directly or transitively below `parent`.
    pub fn is_descendant_of(&self, parent: &MailboxPath, delimiter: char) -> bool {
        self.namespace == parent.namespace
            && self.user == parent.user
            && self
                .name
                .strip_prefix(&parent.name)
                .map(|rest| rest.starts_with(delimiter))
                .unwrap_or(false)
    }
}

impl fmt::Display for MailboxPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.user {
            Some(user) => write!(f, "{}:{}:{}", self.namespace, user, self.name),
            None => write!(f, "{}::{}", self.namespace, self.name),
        }
    }
}

/// Access control entries, consumed by an external decision oracle.
/// The engine stores and transports them; it never interprets rights.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxAcl {
    pub entries: BTreeMap<String, String>,
}

/// A mailbox as the mapper contracts see it. `uid_validity` is stamped at
/// creation and never changes; the two counters are persisted hints that
/// only ever move forward.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mailbox<Id> {
    pub id: Id,
    pub path: MailboxPath,
    pub uid_validity: NonZeroU32,
    pub last_known_uid: u32,
    pub highest_known_modseq: u64,
    pub acl: MailboxAcl,
}

impl<Id: MailboxId> Mailbox<Id> {
    pub fn new(id: Id, path: MailboxPath, uid_validity: NonZeroU32) -> Self {
        Self {
            id,
            path,
            uid_validity,
            last_known_uid: 0,
            highest_known_modseq: 0,
            acl: MailboxAcl::default(),
        }
    }
}
