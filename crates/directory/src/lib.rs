/*
 * SPDX-FileCopyrightText: 2020 Fannst B.V. <hello@fannst.nl>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Local-domain membership and account lookups.
//!
//! The session state machine consults a [`Directory`] to classify a
//! recipient as local or remote and, for `AUTH PLAIN`, to verify a
//! submitted password against the account's stored hash. The in-memory
//! implementation here is the reference backend used by tests and by a
//! single-node deployment; a production deployment would swap in an
//! LDAP- or SQL-backed implementation behind the same trait.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use async_trait::async_trait;
use dashmap::DashMap;

/// The outcome of a cache-backed existence check. Distinguishing an
/// authoritative negative (`False`) from "the cache has no opinion and the
/// query against the backing directory came back with zero rows"
/// (`EmptyQuery`) lets a caller treat the latter as "not local" without
/// falsely caching a permanent no for a domain that may be added later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    True,
    False,
    EmptyQuery,
}

impl Lookup {
    /// Local-domain classification folds `False` and `EmptyQuery` together:
    /// both mean "treat this recipient as remote".
    pub fn is_local(&self) -> bool {
        matches!(self, Lookup::True)
    }
}

/// `(domain, username) -> owner-uuid` plus the storage partition the
/// account's rows live in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountShortcut {
    pub owner_id: String,
    pub bucket: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    Backend(String),
}

impl std::fmt::Display for DirectoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DirectoryError::Backend(e) => write!(f, "directory backend error: {e}"),
        }
    }
}

impl std::error::Error for DirectoryError {}

pub type Result<T> = std::result::Result<T, DirectoryError>;

/// Directory backend consulted by the ESMTP session for local-domain
/// classification, account resolution, and `AUTH PLAIN` credential checks.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn is_local_domain(&self, domain: &str) -> Result<Lookup>;

    async fn lookup_account(&self, domain: &str, username: &str) -> Result<Option<AccountShortcut>>;

    /// Verifies `username@domain`'s password, returning the account on
    /// success. A missing account and a wrong password are both `Ok(None)`
    /// so callers can't distinguish account existence by timing the two
    /// outcomes differently (the hash comparison always runs).
    async fn authenticate(&self, domain: &str, username: &str, secret: &str) -> Result<Option<AccountShortcut>>;
}

struct AccountRecord {
    shortcut: AccountShortcut,
    password_hash: String,
}

/// Reference in-memory [`Directory`]: local domains and accounts are
/// populated directly rather than synced from an external source.
#[derive(Default)]
pub struct InMemoryDirectory {
    local_domains: DashMap<String, ()>,
    accounts: DashMap<(String, String), AccountRecord>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_local_domain(&self, domain: &str) {
        self.local_domains.insert(domain.to_ascii_lowercase(), ());
    }

    /// Registers an account with a plaintext password, hashed with Argon2
    /// before storage — the directory never retains the plaintext.
    pub fn add_account(&self, domain: &str, username: &str, password: &str, owner_id: String, bucket: u64) {
        let salt = SaltString::generate(&mut OsRng);
        let password_hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .expect("argon2 hashing of a bounded in-memory password")
            .to_string();
        self.accounts.insert(
            (domain.to_ascii_lowercase(), username.to_ascii_lowercase()),
            AccountRecord {
                shortcut: AccountShortcut { owner_id, bucket },
                password_hash,
            },
        );
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn is_local_domain(&self, domain: &str) -> Result<Lookup> {
        if self.local_domains.contains_key(&domain.to_ascii_lowercase()) {
            Ok(Lookup::True)
        } else {
            Ok(Lookup::EmptyQuery)
        }
    }

    async fn lookup_account(&self, domain: &str, username: &str) -> Result<Option<AccountShortcut>> {
        Ok(self
            .accounts
            .get(&(domain.to_ascii_lowercase(), username.to_ascii_lowercase()))
            .map(|r| r.shortcut.clone()))
    }

    async fn authenticate(&self, domain: &str, username: &str, secret: &str) -> Result<Option<AccountShortcut>> {
        let key = (domain.to_ascii_lowercase(), username.to_ascii_lowercase());
        let Some(record) = self.accounts.get(&key) else {
            return Ok(None);
        };
        let Ok(parsed_hash) = PasswordHash::new(&record.password_hash) else {
            return Ok(None);
        };
        if Argon2::default().verify_password(secret.as_bytes(), &parsed_hash).is_ok() {
            Ok(Some(record.shortcut.clone()))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unregistered_domain_is_empty_query_not_local() {
        let dir = InMemoryDirectory::new();
        assert_eq!(dir.is_local_domain("example.com").await.unwrap(), Lookup::EmptyQuery);
        assert!(!Lookup::EmptyQuery.is_local());
    }

    #[tokio::test]
    async fn registered_domain_is_local() {
        let dir = InMemoryDirectory::new();
        dir.add_local_domain("example.com");
        assert!(dir.is_local_domain("example.com").await.unwrap().is_local());
        assert!(dir.is_local_domain("EXAMPLE.COM").await.unwrap().is_local());
    }

    #[tokio::test]
    async fn authenticate_accepts_correct_and_rejects_wrong_password() {
        let dir = InMemoryDirectory::new();
        dir.add_account("example.com", "alice", "hunter2", "owner-1".into(), 7);

        let ok = dir.authenticate("example.com", "alice", "hunter2").await.unwrap();
        assert_eq!(ok.unwrap().owner_id, "owner-1");

        let bad = dir.authenticate("example.com", "alice", "wrong").await.unwrap();
        assert!(bad.is_none());
    }

    #[tokio::test]
    async fn authenticate_unknown_account_is_none_not_error() {
        let dir = InMemoryDirectory::new();
        let result = dir.authenticate("example.com", "ghost", "x").await.unwrap();
        assert!(result.is_none());
    }
}
