//! Account pool: availability state, cooldown tracking, and atomic
//! reservation of accounts for batches.
//!
//! The pool is the single shared mutable resource in the engine. It is a
//! plain synchronous structure; concurrent access goes through
//! [`SharedPool`], a tokio mutex, so reserve/release are mutually exclusive
//! and no account can ever be Reserved by two batches at once.

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::EngineError;

/// Availability state of one account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountState {
    Available,
    Reserved,
    Cooldown,
    /// Terminal: never reconsidered without external intervention.
    Disabled,
}

impl AccountState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountState::Available => "available",
            AccountState::Reserved => "reserved",
            AccountState::Cooldown => "cooldown",
            AccountState::Disabled => "disabled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "available" => Some(AccountState::Available),
            "reserved" => Some(AccountState::Reserved),
            "cooldown" => Some(AccountState::Cooldown),
            "disabled" => Some(AccountState::Disabled),
            _ => None,
        }
    }
}

/// One tradeable account. Owned exclusively by the pool; mutated only
/// through pool operations.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: String,
    /// Opaque reference resolved to signing capability by an external
    /// credential provider.
    pub credential_ref: String,
    /// Opaque network-egress identity reference, if assigned.
    pub proxy_ref: Option<String>,
    pub state: AccountState,
    pub last_used: Option<DateTime<Utc>>,
    /// When the account last became eligible; drives oldest-first selection.
    pub eligible_since: DateTime<Utc>,
    pub trades: u64,
}

impl Account {
    pub fn new(id: impl Into<String>, credential_ref: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            credential_ref: credential_ref.into(),
            proxy_ref: None,
            state: AccountState::Available,
            last_used: None,
            eligible_since: DateTime::<Utc>::MIN_UTC,
            trades: 0,
        }
    }
}

/// How an account comes back from a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Normal path: rest for the configured cooldown before reuse.
    Cooldown,
    /// Rollback path (no order was sent): straight back to Available.
    Immediate,
    /// Credentials were rejected: terminal.
    Disabled,
}

/// A pending return-to-availability.
#[derive(Debug, Clone)]
pub struct CooldownEntry {
    pub account_id: String,
    pub eligible_at: DateTime<Utc>,
}

/// Tracks when released accounts become eligible again.
#[derive(Debug, Default)]
pub struct CooldownTracker {
    entries: Vec<CooldownEntry>,
}

impl CooldownTracker {
    pub fn schedule(&mut self, account_id: String, eligible_at: DateTime<Utc>) {
        self.entries.push(CooldownEntry {
            account_id,
            eligible_at,
        });
    }

    /// Remove and return every entry whose eligible-at has passed.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<CooldownEntry> {
        let (due, pending): (Vec<_>, Vec<_>) = self
            .entries
            .drain(..)
            .partition(|e| e.eligible_at <= now);
        self.entries = pending;
        due
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Pool counters for the periodic stats log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub available: usize,
    pub reserved: usize,
    pub cooldown: usize,
    pub disabled: usize,
}

impl PoolStats {
    /// Share of non-disabled accounts currently working or resting, in
    /// percent.
    pub fn utilization(&self) -> f64 {
        let active = self.total - self.disabled;
        if active == 0 {
            return 0.0;
        }
        (self.reserved + self.cooldown) as f64 / active as f64 * 100.0
    }
}

/// The account pool.
pub struct AccountPool {
    accounts: BTreeMap<String, Account>,
    cooldowns: CooldownTracker,
    cooldown: Duration,
    min_batch_size: usize,
}

/// Shared handle used by the generator and workers.
pub type SharedPool = Arc<tokio::sync::Mutex<AccountPool>>;

impl AccountPool {
    pub fn new(accounts: Vec<Account>, cooldown: Duration, min_batch_size: usize) -> Self {
        let accounts: BTreeMap<String, Account> = accounts
            .into_iter()
            .map(|mut a| {
                // A crashed run can leave Reserved/Cooldown in the store;
                // neither survives a restart.
                if matches!(a.state, AccountState::Reserved | AccountState::Cooldown) {
                    a.state = AccountState::Available;
                }
                (a.id.clone(), a)
            })
            .collect();

        info!(total = accounts.len(), "Account pool initialized");

        Self {
            accounts,
            cooldowns: CooldownTracker::default(),
            cooldown,
            min_batch_size,
        }
    }

    pub fn into_shared(self) -> SharedPool {
        Arc::new(tokio::sync::Mutex::new(self))
    }

    /// Atomically reserve up to `n` Available accounts.
    ///
    /// Sweeps expired cooldowns first so the view is current. Selection
    /// prefers accounts whose previous cooldown expired longest ago, ties
    /// broken by account id, so load spreads evenly and the order is
    /// deterministic. Fails when fewer than the configured minimum batch
    /// size is Available.
    pub fn reserve(&mut self, n: usize, now: DateTime<Utc>) -> Result<Vec<Account>, EngineError> {
        self.sweep_cooldowns(now);

        let mut candidates: Vec<&Account> = self
            .accounts
            .values()
            .filter(|a| a.state == AccountState::Available)
            .collect();

        let needed = self.min_batch_size.min(n);
        if candidates.len() < needed {
            return Err(EngineError::InsufficientAccounts {
                available: candidates.len(),
                needed,
            });
        }

        candidates.sort_by(|a, b| {
            a.eligible_since
                .cmp(&b.eligible_since)
                .then_with(|| a.id.cmp(&b.id))
        });

        let selected: Vec<String> = candidates
            .iter()
            .take(n)
            .map(|a| a.id.clone())
            .collect();

        for id in &selected {
            let account = self.accounts.get_mut(id).expect("selected from this map");
            account.state = AccountState::Reserved;
            account.last_used = Some(now);
        }

        debug!(count = selected.len(), accounts = ?selected, "Reserved batch");

        Ok(selected
            .iter()
            .map(|id| self.accounts[id].clone())
            .collect())
    }

    /// Return a Reserved account with the given outcome.
    pub fn release(&mut self, account_id: &str, outcome: ReleaseOutcome, now: DateTime<Utc>) {
        let Some(account) = self.accounts.get_mut(account_id) else {
            warn!(account_id, "Release for unknown account");
            return;
        };

        if account.state != AccountState::Reserved {
            warn!(
                account_id,
                state = account.state.as_str(),
                "Release for account that is not reserved"
            );
        }

        match outcome {
            ReleaseOutcome::Cooldown => {
                account.state = AccountState::Cooldown;
                account.trades += 1;
                self.cooldowns
                    .schedule(account_id.to_string(), now + self.cooldown);
            }
            ReleaseOutcome::Immediate => {
                // Rollback: keep the prior eligibility ordering, the account
                // never actually traded.
                account.state = AccountState::Available;
            }
            ReleaseOutcome::Disabled => {
                account.state = AccountState::Disabled;
                warn!(account_id, "Account disabled");
            }
        }
    }

    /// Move every expired cooldown entry back to Available.
    pub fn sweep_cooldowns(&mut self, now: DateTime<Utc>) {
        for entry in self.cooldowns.sweep(now) {
            if let Some(account) = self.accounts.get_mut(&entry.account_id) {
                // Disable can race a cooldown entry; Disabled stays terminal.
                if account.state == AccountState::Cooldown {
                    account.state = AccountState::Available;
                    account.eligible_since = entry.eligible_at;
                }
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            total: self.accounts.len(),
            available: 0,
            reserved: 0,
            cooldown: 0,
            disabled: 0,
        };
        for account in self.accounts.values() {
            match account.state {
                AccountState::Available => stats.available += 1,
                AccountState::Reserved => stats.reserved += 1,
                AccountState::Cooldown => stats.cooldown += 1,
                AccountState::Disabled => stats.disabled += 1,
            }
        }
        stats
    }

    pub fn get(&self, account_id: &str) -> Option<&Account> {
        self.accounts.get(account_id)
    }

    /// Snapshot of all accounts, for persistence.
    pub fn snapshot(&self) -> Vec<Account> {
        self.accounts.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_of(n: usize, cooldown_secs: i64, min_batch: usize) -> AccountPool {
        let accounts = (0..n)
            .map(|i| Account::new(format!("acct-{i:02}"), format!("key-{i:02}")))
            .collect();
        AccountPool::new(accounts, Duration::seconds(cooldown_secs), min_batch)
    }

    #[test]
    fn test_reserve_marks_reserved() {
        let mut pool = pool_of(6, 60, 3);
        let now = Utc::now();

        let reserved = pool.reserve(4, now).unwrap();
        assert_eq!(reserved.len(), 4);

        let stats = pool.stats();
        assert_eq!(stats.reserved, 4);
        assert_eq!(stats.available, 2);
    }

    #[test]
    fn test_reserve_insufficient() {
        let mut pool = pool_of(3, 60, 5);
        let err = pool.reserve(5, Utc::now()).unwrap_err();
        assert!(matches!(
            err,
            EngineError::InsufficientAccounts {
                available: 3,
                needed: 5
            }
        ));
    }

    #[test]
    fn test_reserve_is_exclusive() {
        let mut pool = pool_of(6, 60, 3);
        let now = Utc::now();

        let first: Vec<String> = pool.reserve(3, now).unwrap().into_iter().map(|a| a.id).collect();
        let second: Vec<String> = pool.reserve(3, now).unwrap().into_iter().map(|a| a.id).collect();

        for id in &first {
            assert!(!second.contains(id), "{id} reserved twice");
        }
    }

    #[tokio::test]
    async fn test_concurrent_reserve_release_never_overlaps() {
        use std::collections::HashSet;

        let pool = pool_of(10, 0, 2).into_shared();
        // Ids currently handed out to a live reservation, across all tasks.
        let live = Arc::new(std::sync::Mutex::new(HashSet::new()));

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let live = Arc::clone(&live);
                tokio::spawn(async move {
                    for _ in 0..50 {
                        let reserved = pool.lock().await.reserve(2, Utc::now());
                        let Ok(reserved) = reserved else {
                            tokio::task::yield_now().await;
                            continue;
                        };
                        {
                            let mut live = live.lock().unwrap();
                            for account in &reserved {
                                assert!(
                                    live.insert(account.id.clone()),
                                    "{} handed to two live reservations",
                                    account.id
                                );
                            }
                        }
                        tokio::task::yield_now().await;
                        {
                            let mut live = live.lock().unwrap();
                            for account in &reserved {
                                live.remove(&account.id);
                            }
                        }
                        let mut guard = pool.lock().await;
                        for account in &reserved {
                            guard.release(&account.id, ReleaseOutcome::Immediate, Utc::now());
                        }
                    }
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }

        let stats = pool.lock().await.stats();
        assert_eq!(stats.reserved, 0);
        assert_eq!(stats.available, 10);
    }

    #[test]
    fn test_cooldown_gates_availability() {
        let mut pool = pool_of(5, 60, 5);
        let now = Utc::now();

        let reserved = pool.reserve(5, now).unwrap();
        for account in &reserved {
            pool.release(&account.id, ReleaseOutcome::Cooldown, now);
        }

        // Before eligible-at: nothing available.
        let err = pool.reserve(5, now + Duration::seconds(59)).unwrap_err();
        assert!(matches!(err, EngineError::InsufficientAccounts { .. }));

        // After eligible-at: the whole pool is back.
        let again = pool.reserve(5, now + Duration::seconds(60)).unwrap();
        assert_eq!(again.len(), 5);
    }

    #[test]
    fn test_immediate_release_skips_cooldown() {
        let mut pool = pool_of(5, 60, 5);
        let now = Utc::now();

        let reserved = pool.reserve(5, now).unwrap();
        for account in &reserved {
            pool.release(&account.id, ReleaseOutcome::Immediate, now);
        }

        assert_eq!(pool.stats().available, 5);
        assert!(pool.reserve(5, now).is_ok());
    }

    #[test]
    fn test_disabled_is_terminal() {
        let mut pool = pool_of(5, 1, 3);
        let now = Utc::now();

        let reserved = pool.reserve(3, now).unwrap();
        pool.release(&reserved[0].id, ReleaseOutcome::Disabled, now);
        pool.release(&reserved[1].id, ReleaseOutcome::Cooldown, now);
        pool.release(&reserved[2].id, ReleaseOutcome::Cooldown, now);

        let later = now + Duration::seconds(10);
        pool.sweep_cooldowns(later);

        let stats = pool.stats();
        assert_eq!(stats.disabled, 1);
        assert_eq!(stats.available, 4);
        assert_eq!(pool.get(&reserved[0].id).unwrap().state, AccountState::Disabled);
    }

    #[test]
    fn test_oldest_eligible_selected_first() {
        let mut pool = pool_of(4, 10, 2);
        let now = Utc::now();

        // Use two accounts; their cooldown expires first, making the other
        // two (never used, eligible since MIN) still the oldest.
        let first = pool.reserve(2, now).unwrap();
        for account in &first {
            pool.release(&account.id, ReleaseOutcome::Cooldown, now);
        }

        let later = now + Duration::seconds(20);
        let second = pool.reserve(2, later).unwrap();
        for account in &second {
            assert!(
                !first.iter().any(|a| a.id == account.id),
                "recently used account selected over idle one"
            );
        }
    }

    #[test]
    fn test_selection_ties_break_by_id() {
        let mut pool = pool_of(4, 10, 2);
        let ids: Vec<String> = pool
            .reserve(2, Utc::now())
            .unwrap()
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(ids, vec!["acct-00".to_string(), "acct-01".to_string()]);
    }

    #[test]
    fn test_stale_states_reset_on_load() {
        let mut crashed = Account::new("acct-00", "key-00");
        crashed.state = AccountState::Reserved;
        let pool = AccountPool::new(vec![crashed], Duration::seconds(60), 1);
        assert_eq!(pool.stats().available, 1);
    }

    #[test]
    fn test_cooldown_tracker_sweep() {
        let mut tracker = CooldownTracker::default();
        let now = Utc::now();
        tracker.schedule("a".to_string(), now - Duration::seconds(1));
        tracker.schedule("b".to_string(), now + Duration::seconds(5));

        let due = tracker.sweep(now);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].account_id, "a");
        assert_eq!(tracker.len(), 1);
    }
}
