use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::mail::flags::UpdatedFlags;
use crate::mail::mailbox::MailboxPath;
use crate::mail::message::{ImapUid, MessageMetadata};
use crate::session::MailboxSession;

/// State changes a mailbox announces to its subscribers.
#[derive(Clone, Debug)]
pub enum MailboxEvent {
    MailboxAdded {
        path: MailboxPath,
    },
    MailboxDeleted {
        path: MailboxPath,
    },
    MailboxRenamed {
        old: MailboxPath,
        new: MailboxPath,
    },
    MessageAdded {
        path: MailboxPath,
        metadata: MessageMetadata,
    },
    /// One event per contiguous run of expunged UIDs.
    MessageExpunged {
        path: MailboxPath,
        first: ImapUid,
        last: ImapUid,
    },
    FlagsUpdated {
        path: MailboxPath,
        update: UpdatedFlags,
    },
}

impl MailboxEvent {
    /// The path whose subscribers receive this event.
    pub fn path(&self) -> &MailboxPath {
        match self {
            MailboxEvent::MailboxAdded { path } => path,
            MailboxEvent::MailboxDeleted { path } => path,
            MailboxEvent::MailboxRenamed { old, .. } => old,
            MailboxEvent::MessageAdded { path, .. } => path,
            MailboxEvent::MessageExpunged { path, .. } => path,
            MailboxEvent::FlagsUpdated { path, .. } => path,
        }
    }
}

/// A mailbox event subscriber. Membership in a dispatcher is by identity:
/// the same Arc subscribed twice is registered once.
pub trait MailboxListener: Send + Sync {
    fn notify(&self, event: &MailboxEvent);

    /// A closed listener eventually stops receiving events; it is pruned
    /// lazily while dispatching.
    fn is_closed(&self) -> bool;
}

/// Delivers mailbox events to the listeners subscribed to their path.
pub struct EventDispatcher {
    listeners: Mutex<HashMap<MailboxPath, Vec<Arc<dyn MailboxListener>>>>,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(
        &self,
        path: &MailboxPath,
        listener: Arc<dyn MailboxListener>,
        session: &MailboxSession,
    ) {
        let mut listeners = self.listeners.lock().unwrap();
        let slot = listeners.entry(path.clone()).or_default();
        if slot.iter().any(|known| Arc::ptr_eq(known, &listener)) {
            return;
        }
        tracing::debug!(session = session.id(), path = %path, "listener subscribed");
        slot.push(listener);
    }

    /// Deliver `event` to the listeners of its path. Closed listeners are
    /// pruned on the way. Deletion drops the path's subscription list after
    /// delivery; a rename moves the list to the new path atomically with
    /// respect to subsequent dispatches.
    pub fn dispatch(&self, event: &MailboxEvent) {
        let targets = {
            let mut listeners = self.listeners.lock().unwrap();
            match event {
                MailboxEvent::MailboxDeleted { path } => {
                    let mut dropped = listeners.remove(path).unwrap_or_default();
                    dropped.retain(|l| !l.is_closed());
                    dropped
                }
                MailboxEvent::MailboxRenamed { old, new } => {
                    let mut moved = listeners.remove(old).unwrap_or_default();
                    moved.retain(|l| !l.is_closed());
                    if !moved.is_empty() {
                        listeners
                            .entry(new.clone())
                            .or_default()
                            .extend(moved.iter().cloned());
                    }
                    moved
                }
                _ => match listeners.get_mut(event.path()) {
                    Some(slot) => {
                        slot.retain(|l| !l.is_closed());
                        slot.clone()
                    }
                    None => vec![],
                },
            }
        };

        for listener in targets {
            listener.notify(event);
        }
    }
}
