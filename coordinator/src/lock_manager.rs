//! Lease-based exclusive account locks with fencing tokens.
//!
//! The lock table is a shared compare-and-set store: acquisition succeeds
//! only if no valid (non-expired) lock exists for the account. A crashed
//! holder's lock self-expires after at most one lease interval. Fencing
//! tokens strictly increase per account so a holder whose lease lapsed and
//! was reassigned is detected on release or renew.

use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, warn};

use paycore_common::{AccountId, CoreError, Result, TransactionId};

use crate::config::LockConfig;

/// A lease granting exclusive mutation rights on one account.
#[derive(Debug, Clone)]
pub struct AccountLock {
    /// Locked account.
    pub account_id: AccountId,
    /// Transaction holding the lease.
    pub holder_transaction_id: TransactionId,
    /// When the lease was granted.
    pub acquired_at: Instant,
    /// When the lease lapses; an expired lock is logically absent.
    pub expires_at: Instant,
    /// Monotonically increasing per account.
    pub fencing_token: u64,
}

impl AccountLock {
    fn new(
        account_id: AccountId,
        holder_transaction_id: TransactionId,
        lease: Duration,
        fencing_token: u64,
    ) -> Self {
        let now = Instant::now();
        Self {
            account_id,
            holder_transaction_id,
            acquired_at: now,
            expires_at: now + lease,
            fencing_token,
        }
    }

    /// Check if the lease has lapsed.
    pub fn is_expired(&self) -> bool {
        Instant::now() > self.expires_at
    }

    /// Remaining lease time, zero if expired.
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

/// Manager for account leases.
pub struct LockManager {
    /// Current lock per account; expired entries are logically absent.
    locks: DashMap<AccountId, AccountLock>,
    /// Next fencing token per account.
    fencing: DashMap<AccountId, u64>,
    /// Configuration.
    config: LockConfig,
}

impl LockManager {
    /// Create a new lock manager.
    pub fn new(config: LockConfig) -> Self {
        Self {
            locks: DashMap::new(),
            fencing: DashMap::new(),
            config,
        }
    }

    /// Try to acquire an exclusive lease on one account.
    ///
    /// Set-if-absent-or-expired: the entry guard makes the check and the
    /// insert one atomic step, so two concurrent acquirers cannot both
    /// succeed.
    pub fn acquire(
        &self,
        account_id: &AccountId,
        holder: TransactionId,
        lease: Duration,
    ) -> Result<AccountLock> {
        match self.locks.entry(account_id.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    let lock = self.grant(account_id, holder, lease);
                    occupied.insert(lock.clone());
                    Ok(lock)
                } else {
                    Err(CoreError::LockConflict {
                        account_id: account_id.clone(),
                        held_by: occupied.get().holder_transaction_id,
                    })
                }
            }
            Entry::Vacant(vacant) => {
                let lock = self.grant(account_id, holder, lease);
                vacant.insert(lock.clone());
                Ok(lock)
            }
        }
    }

    /// Acquire leases on a set of accounts, always in ascending account-id
    /// order regardless of how the caller listed them.
    ///
    /// On any conflict every lease acquired in this attempt is released
    /// before the conflict is returned, so a failed multi-account attempt
    /// holds nothing.
    pub fn acquire_all(
        &self,
        accounts: &[AccountId],
        holder: TransactionId,
        lease: Duration,
    ) -> Result<Vec<AccountLock>> {
        let mut ordered: Vec<AccountId> = accounts.to_vec();
        ordered.sort();
        ordered.dedup();

        let mut held: Vec<AccountLock> = Vec::with_capacity(ordered.len());
        for account_id in &ordered {
            match self.acquire(account_id, holder, lease) {
                Ok(lock) => held.push(lock),
                Err(conflict) => {
                    for lock in held {
                        let _ = self.release(&lock.account_id, lock.fencing_token);
                    }
                    return Err(conflict);
                }
            }
        }
        Ok(held)
    }

    /// Release a lease. Succeeds only if the fencing token is still current.
    pub fn release(&self, account_id: &AccountId, fencing_token: u64) -> Result<()> {
        match self.locks.entry(account_id.clone()) {
            Entry::Occupied(occupied) if occupied.get().fencing_token == fencing_token => {
                occupied.remove();
                debug!(account_id = %account_id, fencing_token, "Lock released");
                Ok(())
            }
            _ => Err(CoreError::StaleLock {
                account_id: account_id.clone(),
                presented: fencing_token,
            }),
        }
    }

    /// Extend an active lease. Fails with `StaleLock` if the token no longer
    /// matches or the lease already lapsed.
    pub fn renew(
        &self,
        account_id: &AccountId,
        fencing_token: u64,
        lease: Duration,
    ) -> Result<AccountLock> {
        match self.locks.entry(account_id.clone()) {
            Entry::Occupied(mut occupied)
                if occupied.get().fencing_token == fencing_token
                    && !occupied.get().is_expired() =>
            {
                let lock = occupied.get_mut();
                lock.expires_at = Instant::now() + lease;
                Ok(lock.clone())
            }
            _ => Err(CoreError::StaleLock {
                account_id: account_id.clone(),
                presented: fencing_token,
            }),
        }
    }

    /// Current holder of a valid lock on the account, if any.
    pub fn holder(&self, account_id: &AccountId) -> Option<TransactionId> {
        self.locks
            .get(account_id)
            .filter(|lock| !lock.is_expired())
            .map(|lock| lock.holder_transaction_id)
    }

    /// Count of valid (non-expired) locks.
    pub fn active_lock_count(&self) -> usize {
        self.locks.iter().filter(|l| !l.is_expired()).count()
    }

    /// Run the cleanup loop, dropping expired entries on an interval.
    /// Expired locks are reacquirable before cleanup runs; this only bounds
    /// table growth.
    pub async fn run_cleanup_loop(&self) {
        loop {
            tokio::time::sleep(self.config.cleanup_interval).await;
            self.cleanup_expired();
        }
    }

    /// Drop expired entries.
    pub fn cleanup_expired(&self) {
        let expired: Vec<AccountId> = self
            .locks
            .iter()
            .filter(|l| l.is_expired())
            .map(|l| l.account_id.clone())
            .collect();

        for account_id in expired {
            // Re-check under the entry guard; a fresh lock may have replaced
            // the expired one since the scan.
            if let Entry::Occupied(occupied) = self.locks.entry(account_id.clone()) {
                if occupied.get().is_expired() {
                    warn!(account_id = %account_id, "Expired lock removed");
                    occupied.remove();
                }
            }
        }
    }

    fn grant(&self, account_id: &AccountId, holder: TransactionId, lease: Duration) -> AccountLock {
        let mut next = self.fencing.entry(account_id.clone()).or_insert(0);
        *next += 1;
        let token = *next;
        drop(next);

        debug!(
            account_id = %account_id,
            holder = %holder,
            fencing_token = token,
            "Lock granted"
        );
        AccountLock::new(account_id.clone(), holder, lease, token)
    }
}
