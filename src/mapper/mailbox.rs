use std::sync::Arc;

use crate::error::{MailboxError, Result};
use crate::event::{EventDispatcher, MailboxEvent};
use crate::mail::mailbox::{Mailbox, MailboxPath};
use crate::mapper::store::MailboxStore;
use crate::session::MailboxSession;
use crate::transaction::TransactionRunner;

/// The mailbox-mapper contract over the backend primitives, session-scoped
/// like its message sibling.
pub struct StoreMailboxMapper<S: MailboxStore> {
    store: Arc<S>,
    dispatcher: Arc<EventDispatcher>,
    session: Arc<MailboxSession>,
    delimiter: char,
    tx: TransactionRunner,
}

impl<S: MailboxStore> StoreMailboxMapper<S> {
    pub fn new(
        store: Arc<S>,
        dispatcher: Arc<EventDispatcher>,
        session: Arc<MailboxSession>,
        delimiter: char,
    ) -> Self {
        Self {
            store,
            dispatcher,
            session,
            delimiter,
            tx: TransactionRunner::new(),
        }
    }

    pub async fn find_by_path(&self, path: &MailboxPath) -> Result<Option<Mailbox<S::Id>>> {
        self.session.ensure_open()?;
        let store = self.store.as_ref();
        self.tx
            .execute(store, async { store.find_by_path(path).await })
            .await
    }

    /// Mailboxes whose name matches `pattern` within the pattern's
    /// namespace and user. `*` matches anything, `%` stops at the hierarchy
    /// delimiter.
    pub async fn find_with_path_like(
        &self,
        pattern: &MailboxPath,
    ) -> Result<Vec<Mailbox<S::Id>>> {
        self.session.ensure_open()?;
        let store = self.store.as_ref();
        let delimiter = self.delimiter;
        self.tx
            .execute(store, async {
                let mut found = store
                    .list()
                    .await?
                    .into_iter()
                    .filter(|mb| {
                        mb.path.namespace == pattern.namespace
                            && mb.path.user == pattern.user
                            && wildcard_match(&pattern.name, &mb.path.name, delimiter)
                    })
                    .collect::<Vec<_>>();
                found.sort_by(|a, b| a.path.cmp(&b.path));
                Ok(found)
            })
            .await
    }

    pub async fn has_children(
        &self,
        mailbox: &Mailbox<S::Id>,
        delimiter: char,
    ) -> Result<bool> {
        self.session.ensure_open()?;
        let store = self.store.as_ref();
        self.tx
            .execute(store, async {
                Ok(store
                    .list()
                    .await?
                    .iter()
                    .any(|other| other.path.is_descendant_of(&mailbox.path, delimiter)))
            })
            .await
    }

    /// Create a mailbox. The parent does not have to exist; creating over an
    /// existing path fails with MailboxExists.
    pub async fn create(&self, path: &MailboxPath) -> Result<Mailbox<S::Id>> {
        self.session.ensure_open()?;
        let store = self.store.as_ref();
        let created = self
            .tx
            .execute(store, async {
                if store.find_by_path(path).await?.is_some() {
                    return Err(MailboxError::MailboxExists(path.clone()));
                }
                store.insert(path).await
            })
            .await?;

        tracing::debug!(session = self.session.id(), path = %path, "mailbox created");
        self.dispatcher
            .dispatch(&MailboxEvent::MailboxAdded { path: path.clone() });
        Ok(created)
    }

    /// Persist a mailbox's attributes. When the path changed this is a
    /// rename: sub-mailboxes follow, uid-validity stays put, collisions are
    /// rejected, and every affected mailbox announces MailboxRenamed.
    pub async fn save(&self, mailbox: &Mailbox<S::Id>) -> Result<()> {
        self.session.ensure_open()?;
        let store = self.store.as_ref();
        let delimiter = self.delimiter;

        let renames = self
            .tx
            .execute(store, async {
                let stored = store
                    .find_by_id(&mailbox.id)
                    .await?
                    .ok_or_else(|| MailboxError::MailboxNotFound(mailbox.path.clone()))?;

                if stored.path == mailbox.path {
                    store.update(mailbox).await?;
                    return Ok(vec![]);
                }

                let old_path = stored.path;
                let new_path = &mailbox.path;
                let siblings = store.list().await?;
                let collision = siblings.iter().any(|other| {
                    other.id != mailbox.id
                        && (other.path == *new_path
                            || other.path.is_descendant_of(new_path, delimiter))
                });
                if collision {
                    return Err(MailboxError::MailboxExists(new_path.clone()));
                }

                let mut renames = vec![(old_path.clone(), new_path.clone())];
                store.update(mailbox).await?;

                // Children ride along under the new prefix
                for mut child in siblings {
                    if !child.path.is_descendant_of(&old_path, delimiter) {
                        continue;
                    }
                    let tail = child.path.name[old_path.name.len()..].to_string();
                    let moved = child.path.renamed(format!("{}{}", new_path.name, tail));
                    renames.push((child.path.clone(), moved.clone()));
                    child.path = moved;
                    store.update(&child).await?;
                }
                Ok(renames)
            })
            .await?;

        for (old, new) in renames {
            tracing::debug!(session = self.session.id(), old = %old, new = %new, "mailbox renamed");
            self.dispatcher
                .dispatch(&MailboxEvent::MailboxRenamed { old, new });
        }
        Ok(())
    }

    /// Remove the mailbox itself. Sub-mailboxes survive their parent.
    pub async fn delete(&self, mailbox: &Mailbox<S::Id>) -> Result<()> {
        self.session.ensure_open()?;
        let store = self.store.as_ref();
        self.tx
            .execute(store, async { store.delete(&mailbox.id).await })
            .await?;

        tracing::debug!(session = self.session.id(), path = %mailbox.path, "mailbox deleted");
        self.dispatcher.dispatch(&MailboxEvent::MailboxDeleted {
            path: mailbox.path.clone(),
        });
        Ok(())
    }

    /// Every stored mailbox; enumeration rights are the caller's concern.
    pub async fn list(&self) -> Result<Vec<Mailbox<S::Id>>> {
        self.session.ensure_open()?;
        let store = self.store.as_ref();
        self.tx
            .execute(store, async {
                let mut all = store.list().await?;
                all.sort_by(|a, b| a.path.cmp(&b.path));
                Ok(all)
            })
            .await
    }
}

/// IMAP LIST wildcards: `*` matches any run of characters, `%` any run that
/// does not cross the hierarchy delimiter.
pub fn wildcard_match(pattern: &str, name: &str, delimiter: char) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();
    matches_at(&pattern, &name, delimiter)
}

fn matches_at(pattern: &[char], name: &[char], delimiter: char) -> bool {
    match pattern.split_first() {
        None => name.is_empty(),
        Some((&'*', rest)) => {
            (0..=name.len()).any(|skip| matches_at(rest, &name[skip..], delimiter))
        }
        Some((&'%', rest)) => {
            for skip in 0..=name.len() {
                if matches_at(rest, &name[skip..], delimiter) {
                    return true;
                }
                if skip < name.len() && name[skip] == delimiter {
                    break;
                }
            }
            false
        }
        Some((&expected, rest)) => match name.split_first() {
            Some((&actual, name_rest)) => {
                actual == expected && matches_at(rest, name_rest, delimiter)
            }
            None => false,
        },
    }
}
