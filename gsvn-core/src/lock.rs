//! Path lock coordination
//!
//! One [`LockCoordinator`] exists per repository and is shared by every
//! session of that repository. The lock table is an immutable map behind
//! an `Arc`: readers clone the `Arc` under a short read guard and walk their
//! private snapshot afterwards, writers swap in a modified copy under the
//! write guard. A reader therefore never sees a half-installed lock, and an
//! enumeration never blocks a writer for longer than the `Arc` clone.

use crate::path::{self, Depth};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::iter::FusedIterator;
use std::ops::Bound;
use std::sync::Arc;
use tokio::sync::RwLock;

/// An exclusive claim on a file path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    pub path: String,
    pub token: String,
    pub owner: String,
    pub comment: Option<String>,
    pub created: DateTime<Utc>,
    pub expires: Option<DateTime<Utc>>,
}

impl Lock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|expires| expires <= now)
    }
}

/// Parameters of a lock acquisition
#[derive(Debug, Clone)]
pub struct LockRequest {
    pub path: String,
    pub owner: String,
    pub comment: Option<String>,
    pub expires: Option<DateTime<Utc>>,
    /// Replace an existing lock held by anyone ("steal")
    pub force: bool,
}

/// What to do with locks whose expiration time has passed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExpiredLockPolicy {
    /// Expired locks are invisible and never block a new lock
    #[default]
    TreatAsAbsent,
    /// Expired locks stay in force until explicitly unlocked or stolen
    RequireRemoval,
}

/// Lock table failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    #[error("Path '{path}' is already locked by user '{owner}'")]
    AlreadyLocked { path: String, owner: String },

    #[error("No lock on path '{0}'")]
    NoSuchLock(String),

    #[error("User '{user}' does not own lock on path '{path}' (currently locked by '{owner}')")]
    OwnerMismatch {
        path: String,
        owner: String,
        user: String,
    },

    #[error(transparent)]
    InvalidPath(#[from] path::PathError),
}

type LockTable = BTreeMap<String, Lock>;

/// Authoritative lock store of one repository
#[derive(Debug, Default)]
pub struct LockCoordinator {
    table: RwLock<Arc<LockTable>>,
    policy: ExpiredLockPolicy,
}

impl LockCoordinator {
    pub fn new(policy: ExpiredLockPolicy) -> Self {
        Self {
            table: RwLock::new(Arc::new(BTreeMap::new())),
            policy,
        }
    }

    pub fn policy(&self) -> ExpiredLockPolicy {
        self.policy
    }

    fn is_visible(&self, lock: &Lock, now: DateTime<Utc>) -> bool {
        self.policy == ExpiredLockPolicy::RequireRemoval || !lock.is_expired(now)
    }

    async fn snapshot(&self) -> Arc<LockTable> {
        Arc::clone(&*self.table.read().await)
    }

    /// Enumerate locks at or below `path`, bounded by `depth`, in path order.
    ///
    /// The returned iterator walks the table as it was when this call
    /// acquired its snapshot; later mutations are not reflected.
    pub async fn list_locks(&self, path: &str, depth: Depth) -> Result<LockIter, LockError> {
        let base = path::normalize(path)?;
        let snapshot = self.snapshot().await;
        Ok(LockIter {
            snapshot,
            cursor: Bound::Included(base.clone()),
            base,
            depth,
            now: Utc::now(),
            policy: self.policy,
            done: false,
        })
    }

    /// The lock on exactly `path`, if any
    pub async fn get_lock(&self, path: &str) -> Result<Option<Lock>, LockError> {
        let path = path::normalize(path)?;
        let snapshot = self.snapshot().await;
        let now = Utc::now();
        Ok(snapshot.get(&path).filter(|lock| self.is_visible(lock, now)).cloned())
    }

    /// Install a new lock.
    ///
    /// Without `force`, any lock still in force on the path makes this fail,
    /// including one held by the requester.
    pub async fn create_lock(&self, request: LockRequest) -> Result<Lock, LockError> {
        let path = path::normalize(&request.path)?;
        let now = Utc::now();

        let mut table = self.table.write().await;
        if let Some(existing) = table.get(&path) {
            if self.is_visible(existing, now) && !request.force {
                return Err(LockError::AlreadyLocked {
                    path,
                    owner: existing.owner.clone(),
                });
            }
        }

        let lock = Lock {
            path: path.clone(),
            token: format!("opaquelocktoken:{}", uuid::Uuid::new_v4()),
            owner: request.owner,
            comment: request.comment.filter(|c| !c.is_empty()),
            created: now,
            expires: request.expires,
        };
        if let Some(replaced) = Arc::make_mut(&mut *table).insert(path, lock.clone()) {
            tracing::debug!("Lock on {} replaced (previous owner {})", replaced.path, replaced.owner);
        }
        Ok(lock)
    }

    /// Remove the lock on `path`.
    ///
    /// Succeeds when `force` is set, when `token` matches, or when `user`
    /// owns the lock.
    pub async fn remove_lock(
        &self,
        path: &str,
        token: Option<&str>,
        user: &str,
        force: bool,
    ) -> Result<Lock, LockError> {
        let path = path::normalize(path)?;
        let now = Utc::now();

        let mut table = self.table.write().await;
        let Some(existing) = table.get(&path) else {
            return Err(LockError::NoSuchLock(path));
        };

        if !self.is_visible(existing, now) {
            Arc::make_mut(&mut *table).remove(&path);
            return Err(LockError::NoSuchLock(path));
        }

        if !force {
            let token_matches = token.is_some_and(|t| t == existing.token);
            if !token_matches && existing.owner != user {
                return Err(LockError::OwnerMismatch {
                    path,
                    owner: existing.owner.clone(),
                    user: user.to_string(),
                });
            }
        }

        Arc::make_mut(&mut *table)
            .remove(&path)
            .ok_or(LockError::NoSuchLock(path))
    }

    /// Number of entries in the table, expired ones included
    pub async fn len(&self) -> usize {
        self.table.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// One-shot, path-ordered walk over a lock table snapshot
///
/// Locks are produced on demand; the snapshot is never copied.
#[derive(Debug)]
pub struct LockIter {
    snapshot: Arc<LockTable>,
    cursor: Bound<String>,
    base: String,
    depth: Depth,
    now: DateTime<Utc>,
    policy: ExpiredLockPolicy,
    done: bool,
}

impl Iterator for LockIter {
    type Item = Lock;

    fn next(&mut self) -> Option<Lock> {
        if self.done {
            return None;
        }
        let prefix = self.base.as_str();
        loop {
            let next = self
                .snapshot
                .range::<String, _>((self.cursor.clone(), Bound::Unbounded))
                .next();
            let Some((key, lock)) = next else {
                self.done = true;
                return None;
            };
            self.cursor = Bound::Excluded(key.clone());

            // Every key sharing the prefix sorts contiguously from the base.
            if !key.starts_with(prefix) {
                self.done = true;
                return None;
            }
            // Locks only ever cover files.
            if !self.depth.covers(&self.base, key, false) {
                continue;
            }
            if self.policy == ExpiredLockPolicy::TreatAsAbsent && lock.is_expired(self.now) {
                continue;
            }
            return Some(lock.clone());
        }
    }
}

impl FusedIterator for LockIter {}
