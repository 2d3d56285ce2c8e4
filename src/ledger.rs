/// Ledger Store for the stake pool engine
///
/// Durable home of account balances, the append-only stake record, the
/// balance journal and the event metadata (events, votes, disputes,
/// payout records). Everything lives in one sled tree split into key
/// spaces:
///
/// ```text
/// acct/{user}                          -> Account
/// evt/{event}                          -> Event
/// stk/{event}/{selector}/{stake_id}    -> Stake   (the (event, selector) index)
/// part/{event}/{user}                  -> first stake marker
/// vote/{event}/{user}                  -> ResolutionVote
/// disp/{event}/{dispute_id}            -> ResolutionDispute
/// pay/{event}/{run}/{user}             -> PayoutRecord
/// jrnl/{user}/{entry_id}               -> JournalEntry
/// ```
///
/// Multi-key writes go through [`Ledger::transaction`] so they commit
/// or abort as a unit. Serialization between writers is the job of the
/// [`LockTable`]: event lock first, then account locks in user-id order.

use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Serialize};
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionalTree,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::error::EngineError;
use crate::models::*;

const TREE_LEDGER: &str = "stakepool";

pub type TxResult<T> = ConflictableTransactionResult<T, EngineError>;

/// Abort the surrounding ledger transaction with a domain error
pub fn abort<T>(err: EngineError) -> TxResult<T> {
    Err(ConflictableTransactionError::Abort(err))
}

// ============================================================================
// KEYS
// ============================================================================

fn account_key(user_id: &str) -> Vec<u8> {
    format!("acct/{}", user_id).into_bytes()
}

fn event_key(event_id: &str) -> Vec<u8> {
    format!("evt/{}", event_id).into_bytes()
}

fn stake_prefix(event_id: &str) -> Vec<u8> {
    format!("stk/{}/", event_id).into_bytes()
}

fn pool_prefix(event_id: &str, selector: &Selector) -> Vec<u8> {
    format!("stk/{}/{}/", event_id, selector.index_key()).into_bytes()
}

fn stake_key(stake: &Stake) -> Vec<u8> {
    format!("stk/{}/{}/{:020}", stake.event_id, stake.selector.index_key(), stake.id).into_bytes()
}

fn participant_key(event_id: &str, user_id: &str) -> Vec<u8> {
    format!("part/{}/{}", event_id, user_id).into_bytes()
}

fn vote_key(event_id: &str, user_id: &str) -> Vec<u8> {
    format!("vote/{}/{}", event_id, user_id).into_bytes()
}

fn vote_prefix(event_id: &str) -> Vec<u8> {
    format!("vote/{}/", event_id).into_bytes()
}

fn dispute_key(event_id: &str, dispute_id: u64) -> Vec<u8> {
    format!("disp/{}/{:020}", event_id, dispute_id).into_bytes()
}

fn dispute_prefix(event_id: &str) -> Vec<u8> {
    format!("disp/{}/", event_id).into_bytes()
}

fn payout_key(record: &PayoutRecord) -> Vec<u8> {
    format!("pay/{}/{:010}/{}", record.event_id, record.run_id, record.user_id).into_bytes()
}

fn payout_prefix(event_id: &str, run_id: u64) -> Vec<u8> {
    format!("pay/{}/{:010}/", event_id, run_id).into_bytes()
}

fn journal_key(entry: &JournalEntry) -> Vec<u8> {
    format!("jrnl/{}/{:020}", entry.user_id, entry.id).into_bytes()
}

fn journal_prefix(user_id: &str) -> Vec<u8> {
    format!("jrnl/{}/", user_id).into_bytes()
}

// ============================================================================
// LOCKS
// ============================================================================

/// Per-row exclusive locks. Handles are created on first use; once a map
/// reaches `LOCK_PRUNE_THRESHOLD` entries, handles nobody else holds are
/// dropped on the next lookup.
#[derive(Default)]
pub struct LockTable {
    events: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    accounts: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

const LOCK_PRUNE_THRESHOLD: usize = 1024;

/// Handles are only cloned out while the map lock is held, so a strong
/// count of one means no caller holds or waits on that lock.
fn lock_handle(map: &Mutex<HashMap<String, Arc<Mutex<()>>>>, key: &str) -> Arc<Mutex<()>> {
    let mut map = map.lock();
    if map.len() >= LOCK_PRUNE_THRESHOLD {
        map.retain(|_, lock| Arc::strong_count(lock) > 1);
    }
    map.entry(key.to_string()).or_default().clone()
}

impl LockTable {
    pub fn event(&self, event_id: &str) -> Arc<Mutex<()>> {
        lock_handle(&self.events, event_id)
    }

    pub fn account(&self, user_id: &str) -> Arc<Mutex<()>> {
        lock_handle(&self.accounts, user_id)
    }

    /// Handles for several accounts, sorted and deduplicated so that every
    /// caller acquires them in the same order.
    pub fn accounts<'a, I>(&self, user_ids: I) -> Vec<Arc<Mutex<()>>>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut ids: Vec<&String> = user_ids.into_iter().collect();
        ids.sort();
        ids.dedup();
        ids.into_iter().map(|id| self.account(id)).collect()
    }
}

// ============================================================================
// LEDGER
// ============================================================================

pub struct Ledger {
    db: sled::Db,
    tree: sled::Tree,
    locks: LockTable,
}

impl Ledger {
    /// Open (or create) the on-disk store
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, EngineError> {
        let db = sled::Config::new().path(path.as_ref()).open()?;
        let ledger = Self::from_db(db)?;
        tracing::info!("📒 Ledger opened at {}", path.as_ref().display());
        Ok(ledger)
    }

    /// Throwaway store, removed when dropped
    pub fn temporary() -> Result<Self, EngineError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, EngineError> {
        let tree = db.open_tree(TREE_LEDGER)?;
        Ok(Self { db, tree, locks: LockTable::default() })
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    /// Monotonic id for stakes, journal entries and disputes
    pub fn next_id(&self) -> Result<u64, EngineError> {
        Ok(self.db.generate_id()?)
    }

    pub fn flush(&self) -> Result<(), EngineError> {
        self.db.flush()?;
        Ok(())
    }

    /// Run `f` as one atomic commit. `f` may be re-run on conflict, so it
    /// must only touch the store through the [`LedgerTx`] it is handed.
    pub fn transaction<T, F>(&self, f: F) -> Result<T, EngineError>
    where
        F: Fn(&LedgerTx<'_>) -> TxResult<T>,
    {
        self.tree
            .transaction(|tx| f(&LedgerTx { tx }))
            .map_err(|err| match err {
                TransactionError::Abort(err) => err,
                TransactionError::Storage(err) => EngineError::from(err),
            })
    }

    fn get<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>, EngineError> {
        match self.tree.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(&self, prefix: &[u8]) -> Result<Vec<T>, EngineError> {
        self.tree
            .scan_prefix(prefix)
            .values()
            .map(|value| {
                let bytes = value?;
                Ok(serde_json::from_slice(&bytes)?)
            })
            .collect()
    }

    // ===== ACCOUNTS =====

    pub fn account(&self, user_id: &str) -> Result<Option<Account>, EngineError> {
        self.get(&account_key(user_id))
    }

    pub fn require_account(&self, user_id: &str) -> Result<Account, EngineError> {
        self.account(user_id)?
            .ok_or_else(|| EngineError::not_found("account", user_id))
    }

    /// Create an account funded with `initial`, journaled as a deposit
    pub fn open_account(&self, user_id: &str, initial: Decimal) -> Result<Account, EngineError> {
        validate_identifier("user id", user_id)?;
        if initial.is_sign_negative() {
            return Err(EngineError::validation("initial balance cannot be negative"));
        }

        let lock = self.locks.account(user_id);
        let _guard = lock.lock();

        let entry_id = self.next_id()?;
        let account = self.transaction(|tx| {
            if tx.account(user_id)?.is_some() {
                return abort(EngineError::validation(format!(
                    "account {} already exists",
                    user_id
                )));
            }
            let account = Account::new(user_id, initial);
            tx.put_account(&account)?;
            tx.append_journal(&JournalEntry {
                id: entry_id,
                user_id: user_id.to_string(),
                event_id: None,
                kind: JournalKind::Deposit,
                amount: initial,
                balance_after: initial,
                run_id: None,
                shortfall: None,
                created_at: account.created_at,
            })?;
            Ok(account)
        })?;

        tracing::info!("👤 Opened account {} with {} tokens", user_id, initial);
        Ok(account)
    }

    pub fn journal(&self, user_id: &str) -> Result<Vec<JournalEntry>, EngineError> {
        self.scan(&journal_prefix(user_id))
    }

    // ===== EVENTS =====

    pub fn event(&self, event_id: &str) -> Result<Option<Event>, EngineError> {
        self.get(&event_key(event_id))
    }

    pub fn require_event(&self, event_id: &str) -> Result<Event, EngineError> {
        self.event(event_id)?
            .ok_or_else(|| EngineError::not_found("event", event_id))
    }

    pub fn insert_event(&self, event: &Event) -> Result<(), EngineError> {
        self.transaction(|tx| {
            if tx.get::<Event>(&event_key(&event.id))?.is_some() {
                return abort(EngineError::validation(format!(
                    "event {} already exists",
                    event.id
                )));
            }
            tx.put_event(event)
        })
    }

    // ===== STAKES & POOLS =====

    /// Every stake on the event, grouped by selector
    pub fn stakes(&self, event_id: &str) -> Result<Vec<Stake>, EngineError> {
        self.scan(&stake_prefix(event_id))
    }

    pub fn stakes_by_user(&self, event_id: &str, user_id: &str) -> Result<Vec<Stake>, EngineError> {
        Ok(self
            .stakes(event_id)?
            .into_iter()
            .filter(|s| s.user_id == user_id)
            .collect())
    }

    /// Σ amount of the stakes selecting `selector`, read through the
    /// `(event, selector)` key prefix
    pub fn pool_total(&self, event_id: &str, selector: &Selector) -> Result<Decimal, EngineError> {
        let stakes: Vec<Stake> = self.scan(&pool_prefix(event_id, selector))?;
        Ok(stakes.iter().map(|s| s.amount).sum())
    }

    pub fn has_staked(&self, event_id: &str, user_id: &str) -> Result<bool, EngineError> {
        Ok(self.tree.contains_key(participant_key(event_id, user_id))?)
    }

    // ===== VOTES, DISPUTES, PAYOUTS =====

    pub fn votes(&self, event_id: &str) -> Result<Vec<ResolutionVote>, EngineError> {
        self.scan(&vote_prefix(event_id))
    }

    pub fn disputes(&self, event_id: &str) -> Result<Vec<ResolutionDispute>, EngineError> {
        self.scan(&dispute_prefix(event_id))
    }

    pub fn payouts(&self, event_id: &str, run_id: u64) -> Result<Vec<PayoutRecord>, EngineError> {
        self.scan(&payout_prefix(event_id, run_id))
    }
}

// ============================================================================
// TRANSACTION VIEW
// ============================================================================

/// Typed access to the store inside [`Ledger::transaction`]
pub struct LedgerTx<'a> {
    tx: &'a TransactionalTree,
}

impl LedgerTx<'_> {
    fn get<T: DeserializeOwned>(&self, key: &[u8]) -> TxResult<Option<T>> {
        match self.tx.get(key)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| ConflictableTransactionError::Abort(EngineError::from(e))),
            None => Ok(None),
        }
    }

    fn put<T: Serialize>(&self, key: &[u8], value: &T) -> TxResult<()> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| ConflictableTransactionError::Abort(EngineError::from(e)))?;
        self.tx.insert(key, bytes)?;
        Ok(())
    }

    pub fn account(&self, user_id: &str) -> TxResult<Option<Account>> {
        self.get(&account_key(user_id))
    }

    pub fn require_account(&self, user_id: &str) -> TxResult<Account> {
        match self.account(user_id)? {
            Some(account) => Ok(account),
            None => abort(EngineError::not_found("account", user_id)),
        }
    }

    pub fn put_account(&self, account: &Account) -> TxResult<()> {
        self.put(&account_key(&account.user_id), account)
    }

    pub fn require_event(&self, event_id: &str) -> TxResult<Event> {
        match self.get(&event_key(event_id))? {
            Some(event) => Ok(event),
            None => abort(EngineError::not_found("event", event_id)),
        }
    }

    pub fn put_event(&self, event: &Event) -> TxResult<()> {
        self.put(&event_key(&event.id), event)
    }

    pub fn insert_stake(&self, stake: &Stake) -> TxResult<()> {
        self.put(&stake_key(stake), stake)
    }

    pub fn is_participant(&self, event_id: &str, user_id: &str) -> TxResult<bool> {
        Ok(self.tx.get(participant_key(event_id, user_id))?.is_some())
    }

    pub fn mark_participant(&self, event_id: &str, user_id: &str) -> TxResult<()> {
        self.tx.insert(participant_key(event_id, user_id), &b"1"[..])?;
        Ok(())
    }

    pub fn put_vote(&self, vote: &ResolutionVote) -> TxResult<()> {
        self.put(&vote_key(&vote.event_id, &vote.user_id), vote)
    }

    pub fn dispute(&self, event_id: &str, dispute_id: u64) -> TxResult<ResolutionDispute> {
        match self.get(&dispute_key(event_id, dispute_id))? {
            Some(dispute) => Ok(dispute),
            None => abort(EngineError::not_found("dispute", &dispute_id.to_string())),
        }
    }

    pub fn put_dispute(&self, dispute: &ResolutionDispute) -> TxResult<()> {
        self.put(&dispute_key(&dispute.event_id, dispute.id), dispute)
    }

    pub fn put_payout(&self, record: &PayoutRecord) -> TxResult<()> {
        self.put(&payout_key(record), record)
    }

    pub fn append_journal(&self, entry: &JournalEntry) -> TxResult<()> {
        self.put(&journal_key(entry), entry)
    }
}
