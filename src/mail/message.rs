use std::num::{NonZeroU32, NonZeroU64};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use mail_parser::{HeaderValue, MessageParser};
use serde::{Deserialize, Serialize};

use crate::error::{MailboxError, Result};
use crate::mail::flags::FlagSet;

pub type ImapUid = NonZeroU32;
pub type ModSeq = NonZeroU64;

/// One header line of a message, in original order.
/// Parsing the header block out of the raw content is delegated to
/// mail-parser; everything below the header seam treats headers as plain
/// name/value pairs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderField {
    pub name: String,
    pub value: String,
}

impl HeaderField {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// How much of a message a find call must materialize.
/// Backends use this to avoid loading bodies for metadata queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchType {
    Metadata,
    Headers,
    Full,
}

/// UID selection for ranged operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UidRange {
    All,
    One(ImapUid),
    From(ImapUid),
    Between(ImapUid, ImapUid),
}

impl UidRange {
    pub fn contains(&self, uid: ImapUid) -> bool {
        match self {
            UidRange::All => true,
            UidRange::One(v) => *v == uid,
            UidRange::From(lo) => uid >= *lo,
            UidRange::Between(lo, hi) => uid >= *lo && uid <= *hi,
        }
    }
}

/// The per-message attributes every backend persists.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageMetadata {
    pub uid: ImapUid,
    pub modseq: ModSeq,
    pub internal_date: DateTime<Utc>,
    /// Full content size in octets.
    pub size: u64,
    pub flags: FlagSet,
}

/// A message as returned by the mappers. Headers and body are present
/// according to the [`FetchType`] of the originating query.
#[derive(Clone, Debug)]
pub struct Message {
    pub metadata: MessageMetadata,
    pub headers: Option<Vec<HeaderField>>,
    pub body: Option<Vec<u8>>,
}

impl Message {
    pub fn uid(&self) -> ImapUid {
        self.metadata.uid
    }

    /// All header values carried under `name`, compared case-insensitively.
    pub fn headers_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a HeaderField> {
        self.headers
            .as_deref()
            .unwrap_or(&[])
            .iter()
            .filter(move |h| h.name.eq_ignore_ascii_case(name))
    }

    pub fn require_body(&self) -> Result<&[u8]> {
        self.body
            .as_deref()
            .ok_or_else(|| MailboxError::Storage(anyhow!("message body was not fetched")))
    }
}

/// A message about to be appended: raw content plus the attributes the
/// caller controls. UID and modseq are assigned by the mapper.
#[derive(Clone, Debug)]
pub struct MessageDraft {
    pub internal_date: DateTime<Utc>,
    pub flags: FlagSet,
    pub raw: Vec<u8>,
}

impl MessageDraft {
    pub fn new(raw: Vec<u8>, internal_date: DateTime<Utc>, flags: FlagSet) -> Self {
        Self {
            internal_date,
            flags,
            raw,
        }
    }

    pub fn size(&self) -> u64 {
        self.raw.len() as u64
    }

    pub fn headers(&self) -> Vec<HeaderField> {
        enumerate_headers(&self.raw)
    }
}

/// Enumerate the header fields of a raw message. A message that does not
/// parse yields no headers rather than an error; search criteria then simply
/// do not match it.
pub fn enumerate_headers(raw: &[u8]) -> Vec<HeaderField> {
    let parsed = match MessageParser::default().parse_headers(raw) {
        Some(parsed) => parsed,
        None => return vec![],
    };

    parsed
        .headers()
        .iter()
        .map(|header| HeaderField {
            name: header.name().to_string(),
            value: header_value_text(header.value()),
        })
        .collect()
}

/// Flatten a structured header value back into searchable text.
fn header_value_text(value: &HeaderValue<'_>) -> String {
    use mail_parser::{Addr, Address};

    fn addr_text(addr: &Addr<'_>) -> Option<String> {
        match (&addr.name, &addr.address) {
            (Some(name), Some(email)) => Some(format!("{} <{}>", name, email)),
            (None, Some(email)) => Some(email.to_string()),
            (Some(name), None) => Some(name.to_string()),
            (None, None) => None,
        }
    }

    match value {
        HeaderValue::Text(text) => text.to_string(),
        HeaderValue::TextList(list) => list.join(", "),
        HeaderValue::Address(Address::List(list)) => {
            list.iter().filter_map(addr_text).collect::<Vec<_>>().join(", ")
        }
        HeaderValue::Address(Address::Group(groups)) => groups
            .iter()
            .flat_map(|group| group.addresses.iter())
            .filter_map(addr_text)
            .collect::<Vec<_>>()
            .join(", "),
        HeaderValue::DateTime(dt) => dt.to_rfc3339(),
        HeaderValue::ContentType(ct) => match &ct.c_subtype {
            Some(sub) => format!("{}/{}", ct.c_type, sub),
            None => ct.c_type.to_string(),
        },
        _ => String::new(),
    }
}

/// Body bytes of a raw message: everything past the header separator.
/// This is a byte-level split, not MIME interpretation.
pub fn body_octets(raw: &[u8]) -> &[u8] {
    if let Some(pos) = find_subslice(raw, b"\r\n\r\n") {
        return &raw[pos + 4..];
    }
    if let Some(pos) = find_subslice(raw, b"\n\n") {
        return &raw[pos + 2..];
    }
    raw
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[u8] = b"From: Alice Example <alice@example.com>\r\n\
Subject: Lunch plans\r\n\
Date: Tue, 12 Mar 2024 10:31:00 +0000\r\n\
\r\n\
Shall we meet at noon?\r\n";

    #[test]
    fn enumerates_headers_in_order() {
        let headers = enumerate_headers(SAMPLE);
        assert_eq!(headers.len(), 3);
        assert_eq!(headers[0].name, "From");
        assert!(headers[0].value.contains("alice@example.com"));
        assert_eq!(headers[1].name, "Subject");
        assert_eq!(headers[1].value, "Lunch plans");
    }

    #[test]
    fn body_split_at_separator() {
        assert_eq!(body_octets(SAMPLE), b"Shall we meet at noon?\r\n");
        assert_eq!(body_octets(b"no separator at all"), b"no separator at all");
    }

    #[test]
    fn uid_range_membership() {
        let uid = |v: u32| ImapUid::new(v).unwrap();
        assert!(UidRange::All.contains(uid(7)));
        assert!(UidRange::One(uid(3)).contains(uid(3)));
        assert!(!UidRange::One(uid(3)).contains(uid(4)));
        assert!(UidRange::From(uid(5)).contains(uid(9)));
        assert!(!UidRange::From(uid(5)).contains(uid(4)));
        assert!(UidRange::Between(uid(2), uid(4)).contains(uid(2)));
        assert!(UidRange::Between(uid(2), uid(4)).contains(uid(4)));
        assert!(!UidRange::Between(uid(2), uid(4)).contains(uid(5)));
    }
}
