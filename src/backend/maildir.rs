use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::backend::internal;
use crate::error::{MailboxError, Result};
use crate::mail::flags::{Flag, FlagSet};
use crate::mail::mailbox::{Mailbox, MailboxAcl, MailboxPath};
use crate::mail::message::{
    FetchType, HeaderField, ImapUid, Message, MessageMetadata, ModSeq, UidRange,
};
use crate::mapper::store::{
    uid_validity_from, Backend, MailboxStore, MessageStore, StoreBuilder, SubscriptionStore,
};
use crate::timestamp::now_msec;
use crate::transaction::TransactionBackend;
use crate::unique_ident::gen_content_id;

/// Transient read faults are retried this many times before escalating.
const READ_ATTEMPTS: usize = 3;

const MAILBOX_RECORD: &str = "mailbox";
const SUBSCRIPTIONS: &str = "subscriptions";

/// The filesystem adapter. Every mailbox is a directory with the classic
/// `cur/`, `new/`, `tmp/` trio — a message file lives in `new/` exactly
/// while it carries Recent — plus a `meta/` directory of per-message
/// sidecars and a `mailbox` record at the top. Writes stage in `tmp/` and
/// rename into place. There is no transaction to speak of: begin and commit
/// are no-ops and rollback discards nothing.
pub struct MaildirDb {
    root: PathBuf,
}

impl MaildirDb {
    pub fn open(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        tracing::debug!(root = %root.display(), "opening maildir store");
        Self { root }
    }
}

#[async_trait]
impl StoreBuilder for MaildirDb {
    type Store = MaildirStore;

    async fn build(&self) -> Result<MaildirStore> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating maildir root {}", self.root.display()))?;
        Ok(MaildirStore {
            root: self.root.clone(),
        })
    }
}

pub struct MaildirStore {
    root: PathBuf,
}

/// What the `mailbox` file holds.
#[derive(Serialize, Deserialize)]
struct MailboxRecord {
    namespace: String,
    user: Option<String>,
    name: String,
    uid_validity: u32,
    last_known_uid: u32,
    highest_known_modseq: u64,
    acl: BTreeMap<String, String>,
}

impl MailboxRecord {
    fn from_mailbox(mailbox: &Mailbox<String>) -> Self {
        Self {
            namespace: mailbox.path.namespace.clone(),
            user: mailbox.path.user.clone(),
            name: mailbox.path.name.clone(),
            uid_validity: mailbox.uid_validity.get(),
            last_known_uid: mailbox.last_known_uid,
            highest_known_modseq: mailbox.highest_known_modseq,
            acl: mailbox.acl.entries.clone(),
        }
    }

    fn into_mailbox(self, id: String) -> Mailbox<String> {
        Mailbox {
            id,
            path: MailboxPath::new(self.namespace, self.user, self.name),
            uid_validity: uid_validity_from(self.uid_validity),
            last_known_uid: self.last_known_uid,
            highest_known_modseq: self.highest_known_modseq,
            acl: MailboxAcl { entries: self.acl },
        }
    }
}

/// Per-message sidecar under `meta/`; the body itself stays a plain file.
#[derive(Serialize, Deserialize)]
struct Sidecar {
    uid: u32,
    modseq: u64,
    internal_date: i64,
    size: u64,
    flags: FlagSet,
    headers: Vec<HeaderField>,
}

impl Sidecar {
    fn metadata(&self) -> Result<MessageMetadata> {
        Ok(MessageMetadata {
            uid: ImapUid::new(self.uid).ok_or_else(|| internal("sidecar uid is zero"))?,
            modseq: ModSeq::new(self.modseq).ok_or_else(|| internal("sidecar modseq is zero"))?,
            internal_date: chrono::TimeZone::timestamp_millis_opt(
                &chrono::Utc,
                self.internal_date,
            )
            .single()
            .ok_or_else(|| internal("sidecar date out of range"))?,
            size: self.size,
            flags: self.flags.clone(),
        })
    }
}

async fn read_with_retry(path: &Path) -> Result<Vec<u8>> {
    let mut attempt = 0;
    loop {
        match tokio::fs::read(path).await {
            Ok(bytes) => return Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(MailboxError::Storage(
                    anyhow::Error::new(e).context(format!("missing file {}", path.display())),
                ))
            }
            Err(e) => {
                attempt += 1;
                if attempt >= READ_ATTEMPTS {
                    return Err(MailboxError::Storage(
                        anyhow::Error::new(e).context(format!("reading {}", path.display())),
                    ));
                }
                tracing::debug!(path = %path.display(), attempt, "transient read fault, retrying");
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

impl MaildirStore {
    fn dir_of(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    /// Stage in tmp/ and rename into place, so partially written files are
    /// never visible under their final name.
    async fn write_file(&self, dir: &Path, final_path: &Path, bytes: &[u8]) -> Result<()> {
        let stage = dir.join("tmp").join(format!("{}", gen_content_id()));
        tokio::fs::write(&stage, bytes)
            .await
            .with_context(|| format!("staging {}", stage.display()))?;
        tokio::fs::rename(&stage, final_path)
            .await
            .with_context(|| format!("publishing {}", final_path.display()))?;
        Ok(())
    }

    async fn read_record(&self, id: &str) -> Result<MailboxRecord> {
        let path = self.dir_of(id).join(MAILBOX_RECORD);
        let bytes = read_with_retry(&path).await?;
        rmp_serde::from_slice(&bytes).map_err(|e| MailboxError::Storage(e.into()))
    }

    async fn write_record(&self, id: &str, record: &MailboxRecord) -> Result<()> {
        let dir = self.dir_of(id);
        let bytes = rmp_serde::to_vec(record).map_err(|e| MailboxError::Storage(e.into()))?;
        self.write_file(&dir, &dir.join(MAILBOX_RECORD), &bytes).await
    }

    /// All sidecars of a mailbox as (file stem, sidecar), unordered.
    async fn scan_sidecars(&self, id: &str) -> Result<Vec<(String, Sidecar)>> {
        let meta_dir = self.dir_of(id).join("meta");
        let mut entries = tokio::fs::read_dir(&meta_dir)
            .await
            .with_context(|| format!("listing {}", meta_dir.display()))?;
        let mut sidecars = vec![];
        while let Some(entry) = entries
            .next_entry()
            .await
            .context("walking sidecar directory")?
        {
            let stem = entry.file_name().to_string_lossy().into_owned();
            let bytes = read_with_retry(&entry.path()).await?;
            let sidecar: Sidecar =
                rmp_serde::from_slice(&bytes).map_err(|e| MailboxError::Storage(e.into()))?;
            sidecars.push((stem, sidecar));
        }
        Ok(sidecars)
    }

    async fn sidecar_by_uid(&self, id: &str, uid: ImapUid) -> Result<Option<(String, Sidecar)>> {
        Ok(self
            .scan_sidecars(id)
            .await?
            .into_iter()
            .find(|(_, sidecar)| sidecar.uid == uid.get()))
    }

    /// Where the body file of `stem` currently lives: `new/` while Recent,
    /// `cur/` afterwards.
    async fn locate_body(&self, id: &str, stem: &str) -> Result<PathBuf> {
        let dir = self.dir_of(id);
        for folder in ["cur", "new"] {
            let candidate = dir.join(folder).join(stem);
            if tokio::fs::try_exists(&candidate)
                .await
                .context("probing body file")?
            {
                return Ok(candidate);
            }
        }
        Err(internal("message body file has gone missing"))
    }

    async fn place_body(&self, id: &str, stem: &str, recent: bool) -> Result<()> {
        let dir = self.dir_of(id);
        let (from, to) = if recent {
            (dir.join("cur").join(stem), dir.join("new").join(stem))
        } else {
            (dir.join("new").join(stem), dir.join("cur").join(stem))
        };
        if tokio::fs::try_exists(&from)
            .await
            .context("probing body file")?
        {
            tokio::fs::rename(&from, &to)
                .await
                .with_context(|| format!("moving {}", from.display()))?;
        }
        Ok(())
    }

    async fn write_sidecar(&self, id: &str, stem: &str, sidecar: &Sidecar) -> Result<()> {
        let dir = self.dir_of(id);
        let bytes = rmp_serde::to_vec(sidecar).map_err(|e| MailboxError::Storage(e.into()))?;
        self.write_file(&dir, &dir.join("meta").join(stem), &bytes)
            .await
    }

    async fn user_dirs(&self) -> Result<Vec<PathBuf>> {
        let mut users = vec![];
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .with_context(|| format!("listing {}", self.root.display()))?;
        while let Some(entry) = entries.next_entry().await.context("walking store root")? {
            if entry
                .file_type()
                .await
                .context("inspecting store root entry")?
                .is_dir()
            {
                users.push(entry.path());
            }
        }
        Ok(users)
    }
}

#[async_trait]
impl TransactionBackend for MaildirStore {
    async fn begin(&self) -> Result<()> {
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        tracing::debug!("maildir rollback: nothing buffered to discard");
        Ok(())
    }
}

impl Backend for MaildirStore {
    type Id = String;
}

#[async_trait]
impl MessageStore for MaildirStore {
    async fn find_in_mailbox(
        &self,
        mailbox: &String,
        range: &UidRange,
        fetch: FetchType,
        limit: Option<usize>,
    ) -> Result<Vec<Message>> {
        let mut hits: Vec<(String, Sidecar)> = self
            .scan_sidecars(mailbox)
            .await?
            .into_iter()
            .filter(|(_, sidecar)| {
                ImapUid::new(sidecar.uid).map(|uid| range.contains(uid)).unwrap_or(false)
            })
            .collect();
        hits.sort_by_key(|(_, sidecar)| sidecar.uid);
        if let Some(limit) = limit {
            hits.truncate(limit);
        }

        let mut found = vec![];
        for (stem, sidecar) in hits {
            let metadata = sidecar.metadata()?;
            let body = match fetch {
                FetchType::Full => {
                    let path = self.locate_body(mailbox, &stem).await?;
                    Some(read_with_retry(&path).await?)
                }
                _ => None,
            };
            found.push(Message {
                metadata,
                headers: match fetch {
                    FetchType::Metadata => None,
                    _ => Some(sidecar.headers),
                },
                body,
            });
        }
        Ok(found)
    }

    async fn find_recent_uids(&self, mailbox: &String) -> Result<Vec<ImapUid>> {
        let mut uids = vec![];
        for (_, sidecar) in self.scan_sidecars(mailbox).await? {
            if sidecar.flags.contains(&Flag::Recent) {
                uids.push(ImapUid::new(sidecar.uid).ok_or_else(|| internal("sidecar uid is zero"))?);
            }
        }
        uids.sort();
        Ok(uids)
    }

    async fn find_unseen_uids(&self, mailbox: &String) -> Result<Vec<ImapUid>> {
        let mut uids = vec![];
        for (_, sidecar) in self.scan_sidecars(mailbox).await? {
            if !sidecar.flags.contains(&Flag::Seen) {
                uids.push(ImapUid::new(sidecar.uid).ok_or_else(|| internal("sidecar uid is zero"))?);
            }
        }
        uids.sort();
        Ok(uids)
    }

    async fn save(&self, mailbox: &String, message: &Message) -> Result<()> {
        match self.sidecar_by_uid(mailbox, message.uid()).await? {
            Some((stem, mut sidecar)) => {
                sidecar.flags = message.metadata.flags.clone();
                sidecar.modseq = message.metadata.modseq.get();
                self.write_sidecar(mailbox, &stem, &sidecar).await?;
                self.place_body(mailbox, &stem, sidecar.flags.contains(&Flag::Recent))
                    .await
            }
            None => {
                let headers = message
                    .headers
                    .clone()
                    .ok_or_else(|| internal("cannot insert a message without headers"))?;
                let body = message
                    .body
                    .as_deref()
                    .ok_or_else(|| internal("cannot insert a message without its content"))?;

                let stem = format!("{}", gen_content_id());
                let dir = self.dir_of(mailbox);
                let recent = message.metadata.flags.contains(&Flag::Recent);
                let folder = if recent { "new" } else { "cur" };
                let sidecar = Sidecar {
                    uid: message.metadata.uid.get(),
                    modseq: message.metadata.modseq.get(),
                    internal_date: message.metadata.internal_date.timestamp_millis(),
                    size: message.metadata.size,
                    flags: message.metadata.flags.clone(),
                    headers,
                };

                // Body and sidecar land independently; each goes through
                // its own stage-and-rename.
                let file_path = dir.join(folder).join(&stem);
                futures::try_join!(
                    self.write_file(&dir, &file_path, body),
                    self.write_sidecar(mailbox, &stem, &sidecar),
                )?;
                Ok(())
            }
        }
    }

    async fn delete(&self, mailbox: &String, uid: ImapUid) -> Result<()> {
        let (stem, _) = self
            .sidecar_by_uid(mailbox, uid)
            .await?
            .ok_or(MailboxError::MessageNotFound { uid: uid.get() })?;
        let body = self.locate_body(mailbox, &stem).await?;
        tokio::fs::remove_file(&body)
            .await
            .with_context(|| format!("removing {}", body.display()))?;
        let meta = self.dir_of(mailbox).join("meta").join(&stem);
        tokio::fs::remove_file(&meta)
            .await
            .with_context(|| format!("removing {}", meta.display()))?;
        Ok(())
    }

    /// File-level copy: the body is duplicated without being loaded through
    /// the message model.
    async fn copy(
        &self,
        source_mailbox: &String,
        source_uid: ImapUid,
        destination: &String,
        metadata: &MessageMetadata,
    ) -> Result<()> {
        let (source_stem, source_sidecar) = self
            .sidecar_by_uid(source_mailbox, source_uid)
            .await?
            .ok_or(MailboxError::MessageNotFound {
                uid: source_uid.get(),
            })?;
        let source_body = self.locate_body(source_mailbox, &source_stem).await?;

        let stem = format!("{}", gen_content_id());
        let dest_dir = self.dir_of(destination);
        let stage = dest_dir.join("tmp").join(&stem);
        tokio::fs::copy(&source_body, &stage)
            .await
            .with_context(|| format!("copying {}", source_body.display()))?;
        let folder = if metadata.flags.contains(&Flag::Recent) {
            "new"
        } else {
            "cur"
        };
        let final_path = dest_dir.join(folder).join(&stem);
        tokio::fs::rename(&stage, &final_path)
            .await
            .with_context(|| format!("publishing {}", final_path.display()))?;

        let sidecar = Sidecar {
            uid: metadata.uid.get(),
            modseq: metadata.modseq.get(),
            internal_date: metadata.internal_date.timestamp_millis(),
            size: metadata.size,
            flags: metadata.flags.clone(),
            headers: source_sidecar.headers,
        };
        self.write_sidecar(destination, &stem, &sidecar).await
    }

    async fn calculate_last_uid(&self, mailbox: &String) -> Result<u32> {
        Ok(self
            .scan_sidecars(mailbox)
            .await?
            .iter()
            .map(|(_, sidecar)| sidecar.uid)
            .max()
            .unwrap_or(0))
    }

    async fn calculate_highest_modseq(&self, mailbox: &String) -> Result<u64> {
        Ok(self
            .scan_sidecars(mailbox)
            .await?
            .iter()
            .map(|(_, sidecar)| sidecar.modseq)
            .max()
            .unwrap_or(0))
    }

    async fn save_sequences(
        &self,
        mailbox: &String,
        last_uid: u32,
        highest_modseq: u64,
    ) -> Result<()> {
        let mut record = self.read_record(mailbox).await?;
        record.last_known_uid = record.last_known_uid.max(last_uid);
        record.highest_known_modseq = record.highest_known_modseq.max(highest_modseq);
        self.write_record(mailbox, &record).await
    }
}

#[async_trait]
impl MailboxStore for MaildirStore {
    async fn find_by_id(&self, id: &String) -> Result<Option<Mailbox<String>>> {
        let record_path = self.dir_of(id).join(MAILBOX_RECORD);
        match tokio::fs::try_exists(&record_path)
            .await
            .context("probing mailbox record")?
        {
            true => Ok(Some(self.read_record(id).await?.into_mailbox(id.clone()))),
            false => Ok(None),
        }
    }

    async fn find_by_path(&self, path: &MailboxPath) -> Result<Option<Mailbox<String>>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .find(|mailbox| mailbox.path == *path))
    }

    async fn insert(&self, path: &MailboxPath) -> Result<Mailbox<String>> {
        if self.find_by_path(path).await?.is_some() {
            return Err(MailboxError::MailboxExists(path.clone()));
        }

        // The directory name is a stable content id: renaming the mailbox
        // later must not change its identity.
        let user_dir = path.user.as_deref().unwrap_or("shared");
        let id = format!("{}/{}", user_dir, gen_content_id());
        let dir = self.dir_of(&id);
        for folder in ["cur", "new", "tmp", "meta"] {
            tokio::fs::create_dir_all(dir.join(folder))
                .await
                .with_context(|| format!("creating {}", dir.join(folder).display()))?;
        }

        let mailbox = Mailbox::new(id.clone(), path.clone(), uid_validity_from(now_msec() as u32));
        self.write_record(&id, &MailboxRecord::from_mailbox(&mailbox))
            .await?;
        Ok(mailbox)
    }

    async fn update(&self, mailbox: &Mailbox<String>) -> Result<()> {
        let mut record = self.read_record(&mailbox.id).await?;
        record.namespace = mailbox.path.namespace.clone();
        record.user = mailbox.path.user.clone();
        record.name = mailbox.path.name.clone();
        record.last_known_uid = mailbox.last_known_uid;
        record.highest_known_modseq = mailbox.highest_known_modseq;
        record.acl = mailbox.acl.entries.clone();
        self.write_record(&mailbox.id, &record).await
    }

    async fn delete(&self, id: &String) -> Result<()> {
        let dir = self.dir_of(id);
        tokio::fs::remove_dir_all(&dir)
            .await
            .with_context(|| format!("removing {}", dir.display()))?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Mailbox<String>>> {
        let mut all = vec![];
        for user_dir in self.user_dirs().await? {
            let mut entries = tokio::fs::read_dir(&user_dir)
                .await
                .with_context(|| format!("listing {}", user_dir.display()))?;
            while let Some(entry) = entries.next_entry().await.context("walking user directory")? {
                let record_path = entry.path().join(MAILBOX_RECORD);
                if !tokio::fs::try_exists(&record_path)
                    .await
                    .context("probing mailbox record")?
                {
                    continue;
                }
                let id = format!(
                    "{}/{}",
                    user_dir
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                    entry.file_name().to_string_lossy()
                );
                all.push(self.read_record(&id).await?.into_mailbox(id.clone()));
            }
        }
        all.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(all)
    }
}

#[async_trait]
impl SubscriptionStore for MaildirStore {
    async fn add_subscription(&self, user: &str, mailbox: &str) -> Result<()> {
        let mut names = self.list_subscriptions(user).await?;
        if !names.iter().any(|n| n == mailbox) {
            names.push(mailbox.to_string());
            names.sort();
            self.write_subscriptions(user, &names).await?;
        }
        Ok(())
    }

    async fn remove_subscription(&self, user: &str, mailbox: &str) -> Result<()> {
        let mut names = self.list_subscriptions(user).await?;
        let before = names.len();
        names.retain(|n| n != mailbox);
        if names.len() != before {
            self.write_subscriptions(user, &names).await?;
        }
        Ok(())
    }

    async fn list_subscriptions(&self, user: &str) -> Result<Vec<String>> {
        let path = self.root.join(user).join(SUBSCRIPTIONS);
        match tokio::fs::try_exists(&path)
            .await
            .context("probing subscriptions")?
        {
            false => Ok(vec![]),
            true => {
                let bytes = read_with_retry(&path).await?;
                rmp_serde::from_slice(&bytes).map_err(|e| MailboxError::Storage(e.into()))
            }
        }
    }
}

impl MaildirStore {
    async fn write_subscriptions(&self, user: &str, names: &[String]) -> Result<()> {
        let user_dir = self.root.join(user);
        tokio::fs::create_dir_all(&user_dir)
            .await
            .with_context(|| format!("creating {}", user_dir.display()))?;
        let bytes =
            rmp_serde::to_vec(&names.to_vec()).map_err(|e| MailboxError::Storage(e.into()))?;
        // No tmp/ at the user level; write directly, the file is tiny
        tokio::fs::write(user_dir.join(SUBSCRIPTIONS), bytes)
            .await
            .context("writing subscriptions")?;
        Ok(())
    }
}
