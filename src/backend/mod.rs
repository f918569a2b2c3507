pub mod maildir;
pub mod row;
pub mod tree;

use anyhow::anyhow;
use chrono::TimeZone;
use serde::{Deserialize, Serialize};

use crate::error::{MailboxError, Result};
use crate::mail::flags::FlagSet;
use crate::mail::message::{FetchType, HeaderField, ImapUid, Message, MessageMetadata, ModSeq};

pub(crate) fn internal(msg: &'static str) -> MailboxError {
    MailboxError::Storage(anyhow!(msg))
}

/// The shape every backend persists a message in; only the physical
/// encoding differs between adapters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct StoredMessage {
    pub uid: u32,
    pub modseq: u64,
    /// Milliseconds since epoch, UTC.
    pub internal_date: i64,
    pub size: u64,
    pub flags: FlagSet,
    pub headers: Vec<HeaderField>,
    pub body: Vec<u8>,
}

impl StoredMessage {
    pub fn from_message(message: &Message) -> Result<Self> {
        let headers = message
            .headers
            .clone()
            .ok_or_else(|| internal("cannot insert a message without headers"))?;
        let body = message
            .body
            .clone()
            .ok_or_else(|| internal("cannot insert a message without its content"))?;
        Ok(Self {
            uid: message.metadata.uid.get(),
            modseq: message.metadata.modseq.get(),
            internal_date: message.metadata.internal_date.timestamp_millis(),
            size: message.metadata.size,
            flags: message.metadata.flags.clone(),
            headers,
            body,
        })
    }

    /// Metadata updates touch flags and modseq; content and dates are
    /// write-once.
    pub fn apply_metadata(&mut self, metadata: &MessageMetadata) {
        self.flags = metadata.flags.clone();
        self.modseq = metadata.modseq.get();
    }

    pub fn metadata(&self) -> Result<MessageMetadata> {
        Ok(MessageMetadata {
            uid: ImapUid::new(self.uid).ok_or_else(|| internal("stored uid is zero"))?,
            modseq: ModSeq::new(self.modseq).ok_or_else(|| internal("stored modseq is zero"))?,
            internal_date: chrono::Utc
                .timestamp_millis_opt(self.internal_date)
                .single()
                .ok_or_else(|| internal("stored internal date out of range"))?,
            size: self.size,
            flags: self.flags.clone(),
        })
    }

    pub fn to_message(&self, fetch: FetchType) -> Result<Message> {
        Ok(Message {
            metadata: self.metadata()?,
            headers: match fetch {
                FetchType::Metadata => None,
                FetchType::Headers | FetchType::Full => Some(self.headers.clone()),
            },
            body: match fetch {
                FetchType::Full => Some(self.body.clone()),
                _ => None,
            },
        })
    }
}
