/*
 * SPDX-FileCopyrightText: 2020 Fannst B.V. <hello@fannst.nl>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! The `MailStore` interface: raw message bytes, per-mailbox message
//! shortcuts, and mailbox status counters. The persistence backend proper
//! (Cassandra in production) is external; this crate defines the contract
//! the session workers write through and ships an in-memory implementation
//! for tests and single-node operation.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

/// Partitions wide tables by time: roughly one bucket per ~11.5 days.
/// Keeping raw message rows and mailbox-status rows bucketed bounds how
/// wide any single partition grows regardless of mailbox age.
pub fn bucket_of(unix_millis: u64) -> u64 {
    unix_millis / 1_000_000_000
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RawMessageKey {
    pub bucket: u64,
    pub domain: String,
    pub owner_id: String,
    pub email_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageShortcutKey {
    pub domain: String,
    pub mailbox: String,
    pub owner_id: String,
    pub email_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageShortcut {
    pub subject: String,
    pub preview: String,
    pub size: u64,
    pub uid: u32,
    pub flags: Vec<String>,
    pub sender_display: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MailboxStatusKey {
    pub bucket: u64,
    pub domain: String,
    pub owner_id: String,
    pub mailbox_path: String,
}

/// Invariants: `0 <= recent <= total`, `0 <= unseen <= total`, `next_uid`
/// strictly monotone across the mailbox's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MailboxStatus {
    pub total: u32,
    pub unseen: u32,
    pub recent: u32,
    pub next_uid: u32,
    pub flags: u32,
    pub permaflags: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    Backend(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Backend(e) => write!(f, "store backend error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

pub type Result<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait MailStore: Send + Sync {
    async fn put_raw_message(&self, key: RawMessageKey, bytes: Vec<u8>) -> Result<()>;

    async fn get_raw_message(&self, key: &RawMessageKey) -> Result<Option<Vec<u8>>>;

    async fn put_message_shortcut(&self, key: MessageShortcutKey, shortcut: MessageShortcut) -> Result<()>;

    async fn list_message_shortcuts(&self, domain: &str, mailbox: &str, owner_id: &str) -> Result<Vec<MessageShortcut>>;

    async fn mailbox_status(&self, key: &MailboxStatusKey) -> Result<MailboxStatus>;

    /// Applies `(delta_total, delta_unseen, delta_recent)` to the mailbox's
    /// counters. A negative delta on `recent` with a magnitude exceeding the
    /// current count clamps to zero rather than underflowing (used when a
    /// client re-reads the status and the recent count is cleared).
    async fn adjust_mailbox_counts(&self, key: &MailboxStatusKey, delta_total: i64, delta_unseen: i64, delta_recent: i64) -> Result<()>;

    async fn clear_recent(&self, key: &MailboxStatusKey) -> Result<()>;

    /// Atomically allocates the next UID for the mailbox. On first use for a
    /// key the counter seeds from the highest UID among that mailbox's
    /// existing shortcuts (recovered from storage), never from zero, so a
    /// cache that lost its warm state can't hand out a UID already in use.
    async fn next_uid(&self, key: &MailboxStatusKey) -> Result<u32>;
}

struct MailboxState {
    status: MailboxStatus,
    uid_counter: AtomicU32,
}

/// Reference in-memory [`MailStore`]. Message bodies and shortcuts are kept
/// in `DashMap`s; there is no eviction, so this is for tests and small
/// deployments only.
#[derive(Default)]
pub struct InMemoryStore {
    raw_messages: DashMap<RawMessageKey, Vec<u8>>,
    shortcuts: DashMap<MessageShortcutKey, MessageShortcut>,
    mailboxes: DashMap<MailboxStatusKey, MailboxState>,
    next_email_id: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generates a process-unique, time-ordered hex id for a new message,
    /// the `email-uuid` component of the store's composite keys.
    pub fn new_email_id(&self) -> String {
        let seq = self.next_email_id.fetch_add(1, Ordering::Relaxed);
        format!("{seq:016x}")
    }
}

#[async_trait]
impl MailStore for InMemoryStore {
    async fn put_raw_message(&self, key: RawMessageKey, bytes: Vec<u8>) -> Result<()> {
        self.raw_messages.insert(key, bytes);
        Ok(())
    }

    async fn get_raw_message(&self, key: &RawMessageKey) -> Result<Option<Vec<u8>>> {
        Ok(self.raw_messages.get(key).map(|v| v.clone()))
    }

    async fn put_message_shortcut(&self, key: MessageShortcutKey, shortcut: MessageShortcut) -> Result<()> {
        self.shortcuts.insert(key, shortcut);
        Ok(())
    }

    async fn list_message_shortcuts(&self, domain: &str, mailbox: &str, owner_id: &str) -> Result<Vec<MessageShortcut>> {
        Ok(self
            .shortcuts
            .iter()
            .filter(|entry| {
                let k = entry.key();
                k.domain == domain && k.mailbox == mailbox && k.owner_id == owner_id
            })
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn mailbox_status(&self, key: &MailboxStatusKey) -> Result<MailboxStatus> {
        Ok(self.mailboxes.get(key).map(|s| s.status).unwrap_or_default())
    }

    async fn adjust_mailbox_counts(&self, key: &MailboxStatusKey, delta_total: i64, delta_unseen: i64, delta_recent: i64) -> Result<()> {
        let mut entry = self.mailboxes.entry(key.clone()).or_insert_with(|| MailboxState {
            status: MailboxStatus::default(),
            uid_counter: AtomicU32::new(0),
        });
        entry.status.total = apply_delta(entry.status.total, delta_total);
        entry.status.unseen = apply_delta(entry.status.unseen, delta_unseen);
        entry.status.recent = apply_delta(entry.status.recent, delta_recent);
        Ok(())
    }

    async fn clear_recent(&self, key: &MailboxStatusKey) -> Result<()> {
        if let Some(mut entry) = self.mailboxes.get_mut(key) {
            entry.status.recent = 0;
        }
        Ok(())
    }

    async fn next_uid(&self, key: &MailboxStatusKey) -> Result<u32> {
        let highest_existing = self
            .shortcuts
            .iter()
            .filter(|entry| entry.key().domain == key.domain && entry.key().mailbox == key.mailbox_path && entry.key().owner_id == key.owner_id)
            .map(|entry| entry.value().uid)
            .max()
            .unwrap_or(0);

        let entry = self.mailboxes.entry(key.clone()).or_insert_with(|| MailboxState {
            status: MailboxStatus {
                next_uid: highest_existing + 1,
                ..MailboxStatus::default()
            },
            uid_counter: AtomicU32::new(highest_existing + 1),
        });
        let uid = entry.uid_counter.fetch_add(1, Ordering::AcqRel);
        Ok(uid.max(1))
    }
}

fn apply_delta(current: u32, delta: i64) -> u32 {
    let next = current as i64 + delta;
    next.max(0) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> MailboxStatusKey {
        MailboxStatusKey {
            bucket: 0,
            domain: "example.com".into(),
            owner_id: "owner-1".into(),
            mailbox_path: "INBOX".into(),
        }
    }

    #[test]
    fn bucket_of_divides_by_one_billion_millis() {
        assert_eq!(bucket_of(0), 0);
        assert_eq!(bucket_of(999_999_999), 0);
        assert_eq!(bucket_of(1_000_000_000), 1);
    }

    #[tokio::test]
    async fn next_uid_is_monotone_and_starts_at_one() {
        let store = InMemoryStore::new();
        let k = key();
        let first = store.next_uid(&k).await.unwrap();
        let second = store.next_uid(&k).await.unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 2);
    }

    #[tokio::test]
    async fn next_uid_recovers_from_existing_shortcuts_on_cache_miss() {
        let store = InMemoryStore::new();
        store
            .put_message_shortcut(
                MessageShortcutKey {
                    domain: "example.com".into(),
                    mailbox: "INBOX".into(),
                    owner_id: "owner-1".into(),
                    email_id: "aaa".into(),
                },
                MessageShortcut {
                    subject: "hi".into(),
                    preview: "".into(),
                    size: 10,
                    uid: 41,
                    flags: vec![],
                    sender_display: "bob".into(),
                },
            )
            .await
            .unwrap();

        let next = store.next_uid(&key()).await.unwrap();
        assert_eq!(next, 42);
    }

    #[tokio::test]
    async fn adjust_mailbox_counts_never_underflows_recent() {
        let store = InMemoryStore::new();
        let k = key();
        store.adjust_mailbox_counts(&k, 1, 1, 1).await.unwrap();
        store.adjust_mailbox_counts(&k, 0, 0, -5).await.unwrap();
        let status = store.mailbox_status(&k).await.unwrap();
        assert_eq!(status.recent, 0);
    }

    #[tokio::test]
    async fn clear_recent_zeroes_without_touching_total() {
        let store = InMemoryStore::new();
        let k = key();
        store.adjust_mailbox_counts(&k, 3, 2, 3).await.unwrap();
        store.clear_recent(&k).await.unwrap();
        let status = store.mailbox_status(&k).await.unwrap();
        assert_eq!(status.recent, 0);
        assert_eq!(status.total, 3);
    }
}
