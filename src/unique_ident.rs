use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use lazy_static::lazy_static;
use rand::prelude::*;
use serde::{de::Error, Deserialize, Deserializer, Serialize, Serializer};

use crate::timestamp::now_msec;

/// A process-unique identifier used as a storage key for message content:
/// maildir file stems and tree document names. 16 bytes, a process stamp
/// (startup time mixed with a random number) followed by a sequence number,
/// so identifiers never collide without any cross-process synchronization.
#[derive(Clone, Copy, PartialOrd, Ord, PartialEq, Eq, Hash, Debug)]
pub struct ContentId(pub [u8; 16]);

struct ContentIdGenerator {
    stamp: u64,
    sequence: AtomicU64,
}

impl ContentIdGenerator {
    fn new() -> Self {
        Self {
            stamp: now_msec() ^ thread_rng().gen::<u64>(),
            sequence: AtomicU64::new(0),
        }
    }

    fn next(&self) -> ContentId {
        let sn = self.sequence.fetch_add(1, Ordering::Relaxed);
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&u64::to_be_bytes(self.stamp));
        bytes[8..16].copy_from_slice(&u64::to_be_bytes(sn));
        ContentId(bytes)
    }
}

lazy_static! {
    static ref GENERATOR: ContentIdGenerator = ContentIdGenerator::new();
}

pub fn gen_content_id() -> ContentId {
    GENERATOR.next()
}

// -- serde, as the hex form --

impl<'de> Deserialize<'de> for ContentId {
    fn deserialize<D>(d: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let v = String::deserialize(d)?;
        ContentId::from_str(&v).map_err(D::Error::custom)
    }
}

impl Serialize for ContentId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl std::fmt::Display for ContentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for ContentId {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<ContentId, &'static str> {
        let bytes = hex::decode(s).map_err(|_| "invalid hex")?;

        if bytes.len() != 16 {
            return Err("bad length");
        }

        let mut tmp = [0u8; 16];
        tmp[..].copy_from_slice(&bytes);
        Ok(ContentId(tmp))
    }
}
