mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use common::*;

use mailstore::error::MailboxError;
use mailstore::mail::flags::{flag_set, Flag, FlagSet};
use mailstore::mail::message::{FetchType, ImapUid, UidRange};
use mailstore::mail::search::{SearchCriterion, SearchQuery};
use mailstore::manager::MailboxManager;
use mailstore::mapper::store::StoreBuilder;

fn uid(v: u32) -> ImapUid {
    ImapUid::new(v).unwrap()
}

// ---- Scenario 1: basic mailbox lifecycle ----

async fn scenario_basic_lifecycle<B: StoreBuilder>(manager: MailboxManager<B>) {
    let session = manager.create_system_session("U1");
    manager.start_processing_request(&session).unwrap();

    assert!(!manager.mailbox_exists(&inbox("U1"), &session).await.unwrap());

    manager.create_mailbox(&inbox("U1"), &session).await.unwrap();
    assert!(manager.mailbox_exists(&inbox("U1"), &session).await.unwrap());

    let duplicate = manager.create_mailbox(&inbox("U1"), &session).await;
    assert!(matches!(duplicate, Err(MailboxError::MailboxExists(_))));

    manager
        .create_mailbox(&path("U1", "INBOX.Test"), &session)
        .await
        .unwrap();

    manager.delete_mailbox(&inbox("U1"), &session).await.unwrap();
    assert!(!manager.mailbox_exists(&inbox("U1"), &session).await.unwrap());
    // Deleting a parent leaves the sub-mailbox standing
    assert!(manager
        .mailbox_exists(&path("U1", "INBOX.Test"), &session)
        .await
        .unwrap());

    manager.logout(&session, false);
    manager.end_processing_request(&session);
}

#[tokio::test]
async fn basic_lifecycle_row() {
    scenario_basic_lifecycle(row_manager()).await;
}

#[tokio::test]
async fn basic_lifecycle_tree() {
    scenario_basic_lifecycle(tree_manager()).await;
}

#[tokio::test]
async fn basic_lifecycle_maildir() {
    let tmp = tempfile::tempdir().unwrap();
    scenario_basic_lifecycle(maildir_manager(tmp.path())).await;
}

// ---- Scenario 2: concurrent sessions of the same user ----

async fn scenario_concurrent_sessions<B: StoreBuilder>(manager: MailboxManager<B>) {
    let s1 = manager.create_system_session("U1");
    let s2 = manager.create_system_session("U1");

    manager.create_mailbox(&inbox("U1"), &s1).await.unwrap();
    assert!(manager.mailbox_exists(&inbox("U1"), &s1).await.unwrap());
    assert!(manager.mailbox_exists(&inbox("U1"), &s2).await.unwrap());

    let m1 = manager.get_mailbox(&inbox("U1"), &s1).await.unwrap();
    let m2 = manager.get_mailbox(&inbox("U1"), &s2).await.unwrap();

    let raw = sample_mail("same bytes", "identical content");
    let (u1, u2) = tokio::join!(
        m1.append_message(&raw, sample_date(), true, FlagSet::new()),
        m2.append_message(&raw, sample_date(), true, FlagSet::new()),
    );
    let (u1, u2) = (u1.unwrap(), u2.unwrap());

    assert_ne!(u1, u2);
    let issued: BTreeSet<u32> = [u1.get(), u2.get()].into();
    assert_eq!(issued, BTreeSet::from([1, 2]));
}

#[tokio::test]
async fn concurrent_sessions_row() {
    scenario_concurrent_sessions(row_manager()).await;
}

#[tokio::test]
async fn concurrent_sessions_maildir() {
    let tmp = tempfile::tempdir().unwrap();
    scenario_concurrent_sessions(maildir_manager(tmp.path())).await;
}

// ---- Scenario 3: subsequent sessions continue the uid sequence ----

async fn scenario_subsequent_sessions<B: StoreBuilder>(manager: MailboxManager<B>) {
    let s1 = manager.create_system_session("U1");
    manager.create_mailbox(&inbox("U1"), &s1).await.unwrap();
    let m1 = manager.get_mailbox(&inbox("U1"), &s1).await.unwrap();
    let first = m1
        .append_message(
            &sample_mail("first", "hello"),
            sample_date(),
            true,
            FlagSet::new(),
        )
        .await
        .unwrap();
    assert_eq!(first, uid(1));
    manager.logout(&s1, false);
    manager.end_processing_request(&s1);

    let s2 = manager.create_system_session("U1");
    let m2 = manager.get_mailbox(&inbox("U1"), &s2).await.unwrap();
    let metadata = m2.get_metadata().await.unwrap();
    assert_eq!(metadata.message_count, 1);
    assert_eq!(metadata.next_uid, uid(2));

    let second = m2
        .append_message(
            &sample_mail("second", "world"),
            sample_date(),
            true,
            FlagSet::new(),
        )
        .await
        .unwrap();
    assert_eq!(second, uid(2));
}

#[tokio::test]
async fn subsequent_sessions_row() {
    scenario_subsequent_sessions(row_manager()).await;
}

#[tokio::test]
async fn subsequent_sessions_tree() {
    scenario_subsequent_sessions(tree_manager()).await;
}

#[tokio::test]
async fn subsequent_sessions_maildir() {
    let tmp = tempfile::tempdir().unwrap();
    scenario_subsequent_sessions(maildir_manager(tmp.path())).await;
}

// ---- Scenario 4: sub-folder creation does not require the parent ----

async fn scenario_subfolder_without_parent<B: StoreBuilder>(manager: MailboxManager<B>) {
    let session = manager.create_system_session("U1");
    manager
        .create_mailbox(&path("U1", "Trash"), &session)
        .await
        .unwrap();
    manager
        .create_mailbox(&path("U1", "INBOX.testfolder"), &session)
        .await
        .unwrap();
    assert!(!manager.mailbox_exists(&inbox("U1"), &session).await.unwrap());

    // INBOX is reserved: appending materializes it on demand
    let handle = manager.get_mailbox(&inbox("U1"), &session).await.unwrap();
    let appended = handle
        .append_message(
            &sample_mail("implicit inbox", "made on demand"),
            sample_date(),
            true,
            FlagSet::new(),
        )
        .await
        .unwrap();
    assert_eq!(appended, uid(1));
    assert!(manager.mailbox_exists(&inbox("U1"), &session).await.unwrap());
}

#[tokio::test]
async fn subfolder_without_parent_row() {
    scenario_subfolder_without_parent(row_manager()).await;
}

#[tokio::test]
async fn subfolder_without_parent_maildir() {
    let tmp = tempfile::tempdir().unwrap();
    scenario_subfolder_without_parent(maildir_manager(tmp.path())).await;
}

// ---- Scenario 5: search by uid range ----

async fn scenario_search_uid_range<B: StoreBuilder>(manager: MailboxManager<B>) {
    let session = manager.create_system_session("U1");
    manager.create_mailbox(&inbox("U1"), &session).await.unwrap();
    let handle = manager.get_mailbox(&inbox("U1"), &session).await.unwrap();

    for n in 1..=5 {
        handle
            .append_message(
                &sample_mail(&format!("message {}", n), "filler"),
                sample_date(),
                true,
                FlagSet::new(),
            )
            .await
            .unwrap();
    }

    let query = SearchQuery::new(vec![SearchCriterion::Uid(vec![UidRange::Between(
        uid(2),
        uid(4),
    )])]);
    let hits = handle.search(&query).await.unwrap();
    assert_eq!(hits, vec![uid(2), uid(3), uid(4)]);
}

#[tokio::test]
async fn search_uid_range_row() {
    scenario_search_uid_range(row_manager()).await;
}

#[tokio::test]
async fn search_uid_range_tree() {
    scenario_search_uid_range(tree_manager()).await;
}

#[tokio::test]
async fn search_uid_range_maildir() {
    let tmp = tempfile::tempdir().unwrap();
    scenario_search_uid_range(maildir_manager(tmp.path())).await;
}

// ---- Scenario 6: a flag batch shares one modseq ----

async fn scenario_flag_batch_modseq<B: StoreBuilder>(manager: MailboxManager<B>) {
    let session = manager.create_system_session("U1");
    manager.create_mailbox(&inbox("U1"), &session).await.unwrap();
    let handle = manager.get_mailbox(&inbox("U1"), &session).await.unwrap();

    for n in 1..=3 {
        handle
            .append_message(
                &sample_mail(&format!("message {}", n), "filler"),
                sample_date(),
                false,
                FlagSet::new(),
            )
            .await
            .unwrap();
    }

    let before = handle
        .get_messages(&UidRange::All, FetchType::Metadata)
        .await
        .unwrap();
    let modseqs: Vec<u64> = before.iter().map(|m| m.metadata.modseq.get()).collect();
    assert!(modseqs.windows(2).all(|w| w[0] < w[1]));
    let m3 = *modseqs.last().unwrap();

    let updates = handle
        .set_flags(&UidRange::All, &flag_set([Flag::Seen]), true, true)
        .await
        .unwrap();
    assert_eq!(updates.len(), 3);
    let m4 = updates[0].modseq;
    assert!(updates.iter().all(|u| u.modseq == m4));
    assert!(m4.get() > m3);
}

#[tokio::test]
async fn flag_batch_modseq_row() {
    scenario_flag_batch_modseq(row_manager()).await;
}

#[tokio::test]
async fn flag_batch_modseq_tree() {
    scenario_flag_batch_modseq(tree_manager()).await;
}

#[tokio::test]
async fn flag_batch_modseq_maildir() {
    let tmp = tempfile::tempdir().unwrap();
    scenario_flag_batch_modseq(maildir_manager(tmp.path())).await;
}

// ---- Idempotent replace: no modseq advance, no event ----

async fn scenario_idempotent_replace<B: StoreBuilder>(manager: MailboxManager<B>) {
    let session = manager.create_system_session("U1");
    manager.create_mailbox(&inbox("U1"), &session).await.unwrap();
    let handle = manager.get_mailbox(&inbox("U1"), &session).await.unwrap();

    handle
        .append_message(
            &sample_mail("steady", "no change expected"),
            sample_date(),
            false,
            flag_set([Flag::Seen]),
        )
        .await
        .unwrap();
    let before = handle.get_metadata().await.unwrap().highest_modseq;

    let updates = handle
        .set_flags(&UidRange::All, &flag_set([Flag::Seen]), true, true)
        .await
        .unwrap();
    assert!(updates.is_empty());
    assert_eq!(handle.get_metadata().await.unwrap().highest_modseq, before);
}

#[tokio::test]
async fn idempotent_replace_row() {
    scenario_idempotent_replace(row_manager()).await;
}

#[tokio::test]
async fn idempotent_replace_maildir() {
    let tmp = tempfile::tempdir().unwrap();
    scenario_idempotent_replace(maildir_manager(tmp.path())).await;
}

// ---- Scenario 7: expunge returns metadata and counters move past it ----

async fn scenario_expunge<B: StoreBuilder>(manager: MailboxManager<B>) {
    let session = manager.create_system_session("U1");
    manager.create_mailbox(&inbox("U1"), &session).await.unwrap();
    let handle = manager.get_mailbox(&inbox("U1"), &session).await.unwrap();

    for n in 1..=5 {
        handle
            .append_message(
                &sample_mail(&format!("message {}", n), "filler"),
                sample_date(),
                false,
                FlagSet::new(),
            )
            .await
            .unwrap();
    }

    for doomed in [2u32, 4] {
        handle
            .set_flags(
                &UidRange::One(uid(doomed)),
                &flag_set([Flag::Deleted]),
                true,
                false,
            )
            .await
            .unwrap();
    }

    let removed = handle.expunge(&UidRange::All).await.unwrap();
    let removed_uids: Vec<ImapUid> = removed.keys().copied().collect();
    assert_eq!(removed_uids, vec![uid(2), uid(4)]);
    assert!(removed[&uid(2)].flags.contains(&Flag::Deleted));

    let metadata = handle.get_metadata().await.unwrap();
    assert_eq!(metadata.message_count, 3);

    let next = handle
        .append_message(
            &sample_mail("after expunge", "fresh"),
            sample_date(),
            false,
            FlagSet::new(),
        )
        .await
        .unwrap();
    assert_eq!(next, uid(6));
}

#[tokio::test]
async fn expunge_row() {
    scenario_expunge(row_manager()).await;
}

#[tokio::test]
async fn expunge_tree() {
    scenario_expunge(tree_manager()).await;
}

#[tokio::test]
async fn expunge_maildir() {
    let tmp = tempfile::tempdir().unwrap();
    scenario_expunge(maildir_manager(tmp.path())).await;
}

// ---- Empty expunge leaves the counters alone ----

async fn scenario_empty_expunge<B: StoreBuilder>(manager: MailboxManager<B>) {
    let session = manager.create_system_session("U1");
    manager.create_mailbox(&inbox("U1"), &session).await.unwrap();
    let handle = manager.get_mailbox(&inbox("U1"), &session).await.unwrap();

    handle
        .append_message(
            &sample_mail("kept", "nothing deleted here"),
            sample_date(),
            false,
            FlagSet::new(),
        )
        .await
        .unwrap();
    let before = handle.get_metadata().await.unwrap();

    let removed = handle.expunge(&UidRange::All).await.unwrap();
    assert!(removed.is_empty());

    let after = handle.get_metadata().await.unwrap();
    assert_eq!(after.next_uid, before.next_uid);
    assert_eq!(after.highest_modseq, before.highest_modseq);
}

#[tokio::test]
async fn empty_expunge_row() {
    scenario_empty_expunge(row_manager()).await;
}

// ---- Scenario 8: listeners follow a mailbox rename ----

#[tokio::test]
async fn listener_follows_rename() {
    let manager = row_manager();
    let session = manager.create_system_session("U1");
    let old = path("U1", "Projects");
    let new = path("U1", "Archive");

    manager.create_mailbox(&old, &session).await.unwrap();

    let listener = Arc::new(RecordingListener::default());
    manager.dispatcher().subscribe(&old, listener.clone(), &session);

    manager.rename_mailbox(&old, &new, &session).await.unwrap();
    let renames = listener.count.load(std::sync::atomic::Ordering::SeqCst);
    assert_eq!(renames, 1);

    // An event under the new path reaches the listener...
    let handle = manager.get_mailbox(&new, &session).await.unwrap();
    handle
        .append_message(
            &sample_mail("renamed home", "delivered"),
            sample_date(),
            true,
            FlagSet::new(),
        )
        .await
        .unwrap();
    assert_eq!(
        listener.count.load(std::sync::atomic::Ordering::SeqCst),
        renames + 1
    );

    // ...while the old path no longer leads anywhere: a mailbox re-created
    // under it starts with an empty subscription list.
    manager.create_mailbox(&old, &session).await.unwrap();
    let stale = manager.get_mailbox(&old, &session).await.unwrap();
    stale
        .append_message(
            &sample_mail("old shell", "nobody listening"),
            sample_date(),
            true,
            FlagSet::new(),
        )
        .await
        .unwrap();
    assert_eq!(
        listener.count.load(std::sync::atomic::Ordering::SeqCst),
        renames + 1
    );
}

// ---- Round-trip fidelity ----

async fn scenario_round_trip<B: StoreBuilder>(manager: MailboxManager<B>) {
    let session = manager.create_system_session("U1");
    manager.create_mailbox(&inbox("U1"), &session).await.unwrap();
    let handle = manager.get_mailbox(&inbox("U1"), &session).await.unwrap();

    let raw = sample_mail("round trip", "bytes must survive verbatim");
    let date = sample_date();
    let appended = handle
        .append_message(&raw, date, false, flag_set([Flag::Flagged]))
        .await
        .unwrap();

    let fetched = handle
        .get_messages(&UidRange::One(appended), FetchType::Full)
        .await
        .unwrap();
    assert_eq!(fetched.len(), 1);
    let message = &fetched[0];
    assert_eq!(message.body.as_deref(), Some(raw.as_slice()));
    assert_eq!(message.metadata.internal_date, date);
    assert_eq!(message.metadata.size, raw.len() as u64);
    assert!(message.metadata.flags.contains(&Flag::Flagged));
    assert!(message
        .headers_named("subject")
        .any(|h| h.value.contains("round trip")));
}

#[tokio::test]
async fn round_trip_row() {
    scenario_round_trip(row_manager()).await;
}

#[tokio::test]
async fn round_trip_tree() {
    scenario_round_trip(tree_manager()).await;
}

#[tokio::test]
async fn round_trip_maildir() {
    let tmp = tempfile::tempdir().unwrap();
    scenario_round_trip(maildir_manager(tmp.path())).await;
}

// ---- Copy preserves content and marks the duplicate Recent ----

async fn scenario_copy_sets_recent<B: StoreBuilder>(manager: MailboxManager<B>) {
    let session = manager.create_system_session("U1");
    manager.create_mailbox(&inbox("U1"), &session).await.unwrap();
    manager
        .create_mailbox(&path("U1", "Archive"), &session)
        .await
        .unwrap();

    let source = manager.get_mailbox(&inbox("U1"), &session).await.unwrap();
    let raw = sample_mail("to copy", "copied content");
    source
        .append_message(&raw, sample_date(), false, flag_set([Flag::Seen]))
        .await
        .unwrap();

    let copied = source
        .copy_to(&UidRange::All, &path("U1", "Archive"))
        .await
        .unwrap();
    assert_eq!(copied.len(), 1);
    assert!(copied[0].flags.contains(&Flag::Recent));
    assert!(copied[0].flags.contains(&Flag::Seen));

    let dest = manager
        .get_mailbox(&path("U1", "Archive"), &session)
        .await
        .unwrap();
    let fetched = dest
        .get_messages(&UidRange::All, FetchType::Full)
        .await
        .unwrap();
    assert_eq!(fetched.len(), 1);
    assert_eq!(fetched[0].body.as_deref(), Some(raw.as_slice()));
}

#[tokio::test]
async fn copy_sets_recent_row() {
    scenario_copy_sets_recent(row_manager()).await;
}

#[tokio::test]
async fn copy_sets_recent_maildir() {
    let tmp = tempfile::tempdir().unwrap();
    scenario_copy_sets_recent(maildir_manager(tmp.path())).await;
}

// ---- A closed session refuses mapper work ----

#[tokio::test]
async fn closed_session_refuses_operations() {
    let manager = row_manager();
    let session = manager.create_system_session("U1");
    manager.create_mailbox(&inbox("U1"), &session).await.unwrap();
    let handle = manager.get_mailbox(&inbox("U1"), &session).await.unwrap();

    manager.logout(&session, false);
    manager.end_processing_request(&session);

    let refused = handle
        .append_message(
            &sample_mail("too late", "session is gone"),
            sample_date(),
            false,
            FlagSet::new(),
        )
        .await;
    assert!(matches!(refused, Err(MailboxError::SessionClosed)));

    let refused = manager.mailbox_exists(&inbox("U1"), &session).await;
    assert!(matches!(refused, Err(MailboxError::SessionClosed)));
}

// ---- LIST patterns and hierarchy probing ----

#[tokio::test]
async fn list_patterns_and_children() {
    let fixture = MockMailboxManager::seed(row_manager()).await.unwrap();
    let manager = &fixture.manager;
    let session = manager.create_system_session("alice");
    let mapper = manager
        .factory()
        .create_mailbox_mapper(&session)
        .await
        .unwrap();

    let top_level: Vec<String> = mapper
        .find_with_path_like(&path("alice", "%"))
        .await
        .unwrap()
        .into_iter()
        .map(|mb| mb.path.name)
        .collect();
    assert_eq!(top_level, vec!["INBOX", "Trash"]);

    let everything = mapper
        .find_with_path_like(&path("alice", "*"))
        .await
        .unwrap();
    assert_eq!(everything.len(), 4);

    let inbox_mb = mapper.find_by_path(&inbox("alice")).await.unwrap().unwrap();
    assert!(mapper.has_children(&inbox_mb, DELIMITER).await.unwrap());
    let trash = mapper
        .find_by_path(&path("alice", "Trash"))
        .await
        .unwrap()
        .unwrap();
    assert!(!mapper.has_children(&trash, DELIMITER).await.unwrap());
}

// ---- Subscriptions ----

#[tokio::test]
async fn subscriptions_round_trip() {
    let manager = row_manager();
    let session = manager.create_system_session("U1");
    let mapper = manager.create_subscription_mapper(&session).await.unwrap();

    mapper.subscribe("INBOX").await.unwrap();
    mapper.subscribe("Trash").await.unwrap();
    mapper.subscribe("INBOX").await.unwrap();
    assert_eq!(mapper.subscriptions().await.unwrap(), vec!["INBOX", "Trash"]);

    mapper.unsubscribe("INBOX").await.unwrap();
    assert_eq!(mapper.subscriptions().await.unwrap(), vec!["Trash"]);

    // Subscriptions are per user
    let other = manager.create_system_session("U2");
    let other_mapper = manager.create_subscription_mapper(&other).await.unwrap();
    assert!(other_mapper.subscriptions().await.unwrap().is_empty());
}

// ---- Move is native on row, refused by maildir ----

#[tokio::test]
async fn move_support_differs_by_backend() {
    let manager = row_manager();
    let session = manager.create_system_session("U1");
    manager.create_mailbox(&inbox("U1"), &session).await.unwrap();
    manager
        .create_mailbox(&path("U1", "Archive"), &session)
        .await
        .unwrap();

    let factory = manager.factory();
    let mailbox_mapper = factory.create_mailbox_mapper(&session).await.unwrap();
    let message_mapper = factory.create_message_mapper(&session).await.unwrap();

    let handle = manager.get_mailbox(&inbox("U1"), &session).await.unwrap();
    handle
        .append_message(
            &sample_mail("movable", "goes elsewhere"),
            sample_date(),
            false,
            FlagSet::new(),
        )
        .await
        .unwrap();

    let source = mailbox_mapper
        .find_by_path(&inbox("U1"))
        .await
        .unwrap()
        .unwrap();
    let mut dest = mailbox_mapper
        .find_by_path(&path("U1", "Archive"))
        .await
        .unwrap()
        .unwrap();
    let message = message_mapper
        .find_in_mailbox(&source, &UidRange::All, FetchType::Full, None)
        .await
        .unwrap()
        .remove(0);

    let moved = message_mapper
        .move_message(&mut dest, &source, &message)
        .await
        .unwrap();
    assert!(moved.flags.contains(&Flag::Recent));
    assert_eq!(
        message_mapper.count_messages(&source).await.unwrap(),
        0,
        "source must be empty after the move"
    );
    assert_eq!(message_mapper.count_messages(&dest).await.unwrap(), 1);
}

#[tokio::test]
async fn maildir_refuses_move() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = maildir_manager(tmp.path());
    let session = manager.create_system_session("U1");
    manager.create_mailbox(&inbox("U1"), &session).await.unwrap();
    manager
        .create_mailbox(&path("U1", "Archive"), &session)
        .await
        .unwrap();

    let handle = manager.get_mailbox(&inbox("U1"), &session).await.unwrap();
    handle
        .append_message(
            &sample_mail("stuck", "maildir does not move"),
            sample_date(),
            false,
            FlagSet::new(),
        )
        .await
        .unwrap();

    let factory = manager.factory();
    let mailbox_mapper = factory.create_mailbox_mapper(&session).await.unwrap();
    let message_mapper = factory.create_message_mapper(&session).await.unwrap();
    let source = mailbox_mapper
        .find_by_path(&inbox("U1"))
        .await
        .unwrap()
        .unwrap();
    let mut dest = mailbox_mapper
        .find_by_path(&path("U1", "Archive"))
        .await
        .unwrap()
        .unwrap();
    let message = message_mapper
        .find_in_mailbox(&source, &UidRange::All, FetchType::Metadata, None)
        .await
        .unwrap()
        .remove(0);

    let refused = message_mapper
        .move_message(&mut dest, &source, &message)
        .await;
    assert!(matches!(refused, Err(MailboxError::NotSupported(_))));
}

// ---- The mock fixture seeds what it promises ----

#[tokio::test]
async fn mock_population_lists_and_counts() {
    let fixture = MockMailboxManager::seed(row_manager()).await.unwrap();
    let manager = &fixture.manager;

    for user in MockMailboxManager::<mailstore::backend::row::RowDb>::USERS {
        let session = manager.create_system_session(user);
        let mut names: Vec<String> = manager
            .list(&session)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["INBOX", "INBOX.folder1", "INBOX.folder2", "Trash"]);

        let folder = manager
            .get_mailbox(&path(user, "INBOX.folder1"), &session)
            .await
            .unwrap();
        assert_eq!(folder.get_metadata().await.unwrap().message_count, 3);
    }
}
