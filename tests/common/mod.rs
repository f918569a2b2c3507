#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};

use mailstore::backend::maildir::MaildirDb;
use mailstore::backend::row::RowDb;
use mailstore::backend::tree::TreeDb;
use mailstore::error::Result;
use mailstore::event::{MailboxEvent, MailboxListener};
use mailstore::mail::flags::FlagSet;
use mailstore::mail::mailbox::MailboxPath;
use mailstore::manager::MailboxManager;
use mailstore::mapper::store::StoreBuilder;

pub const DELIMITER: char = '.';

/// Capture engine logs per test; repeat registrations are fine.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn row_manager() -> MailboxManager<RowDb> {
    init_tracing();
    MailboxManager::new(RowDb::open("row://test"), DELIMITER)
}

pub fn tree_manager() -> MailboxManager<TreeDb> {
    init_tracing();
    MailboxManager::new(TreeDb::open("mailstore-test"), DELIMITER)
}

pub fn maildir_manager(root: &Path) -> MailboxManager<MaildirDb> {
    init_tracing();
    MailboxManager::new(MaildirDb::open(root), DELIMITER)
}

pub fn inbox(user: &str) -> MailboxPath {
    MailboxPath::personal(user, "INBOX")
}

pub fn path(user: &str, name: impl Into<String>) -> MailboxPath {
    MailboxPath::personal(user, name)
}

pub fn sample_date() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 12, 10, 31, 0).unwrap()
}

pub fn sample_mail(subject: &str, body: &str) -> Vec<u8> {
    format!(
        "From: Mock Sender <mock@example.com>\r\n\
To: You <you@example.com>\r\n\
Subject: {}\r\n\
Date: Tue, 12 Mar 2024 10:31:00 +0000\r\n\
\r\n\
{}\r\n",
        subject, body
    )
    .into_bytes()
}

/// Listener that remembers what it saw; closable to exercise pruning.
#[derive(Default)]
pub struct RecordingListener {
    pub events: Mutex<Vec<String>>,
    pub count: AtomicUsize,
    pub closed: AtomicBool,
}

impl MailboxListener for RecordingListener {
    fn notify(&self, event: &MailboxEvent) {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.events.lock().unwrap().push(format!("{:?}", event));
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Deterministic population for list/search tests: for each user an INBOX,
/// a Trash folder, and `FOLDERS` sub-folders holding `MESSAGES` messages
/// each.
pub struct MockMailboxManager<B: StoreBuilder> {
    pub manager: MailboxManager<B>,
}

impl<B: StoreBuilder> MockMailboxManager<B> {
    pub const USERS: [&'static str; 2] = ["alice", "bob"];
    pub const FOLDERS: usize = 2;
    pub const MESSAGES: usize = 3;

    pub async fn seed(manager: MailboxManager<B>) -> Result<Self> {
        for user in Self::USERS {
            let session = manager.create_system_session(user);
            manager.start_processing_request(&session)?;

            manager.create_mailbox(&inbox(user), &session).await?;
            manager.create_mailbox(&path(user, "Trash"), &session).await?;

            for folder in 1..=Self::FOLDERS {
                let folder_path = path(user, format!("INBOX.folder{}", folder));
                manager.create_mailbox(&folder_path, &session).await?;

                let handle = manager.get_mailbox(&folder_path, &session).await?;
                for n in 1..=Self::MESSAGES {
                    let raw = sample_mail(
                        &format!("{} message {}", user, n),
                        &format!("body of message {} in folder {}", n, folder),
                    );
                    handle
                        .append_message(&raw, sample_date(), true, FlagSet::new())
                        .await?;
                }
            }

            manager.logout(&session, false);
            manager.end_processing_request(&session);
        }
        Ok(Self { manager })
    }
}
