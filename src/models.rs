// Data models for the stake pool ledger

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::EngineError;

/// Legacy unit price of a "share". Stakes are always priced at par.
pub const LEGACY_SHARE_PRICE: u32 = 100;

/// Fractional digits carried by every token amount
pub const AMOUNT_SCALE: u32 = 2;

const MAX_IDENTIFIER_LEN: usize = 64;

/// Identifiers end up inside storage keys, so `/` and whitespace are refused.
pub fn validate_identifier(kind: &str, value: &str) -> Result<(), EngineError> {
    if value.is_empty() || value.len() > MAX_IDENTIFIER_LEN {
        return Err(EngineError::validation(format!(
            "{} must be 1-{} characters",
            kind, MAX_IDENTIFIER_LEN
        )));
    }
    let valid = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'));
    if !valid {
        return Err(EngineError::validation(format!(
            "{} '{}' may only contain letters, digits, '-', '_', '.' or '@'",
            kind, value
        )));
    }
    Ok(())
}

// ============================================================================
// SELECTORS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Yes,
    No,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Yes => "yes",
            Side::No => "no",
        }
    }
}

/// What a stake is placed on: a side of a binary event or one declared
/// outcome of a multiple-outcome event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selector {
    Side(Side),
    Outcome(String),
}

impl Selector {
    pub fn yes() -> Self {
        Selector::Side(Side::Yes)
    }

    pub fn no() -> Self {
        Selector::Side(Side::No)
    }

    pub fn outcome(id: &str) -> Self {
        Selector::Outcome(id.to_string())
    }

    /// Segment used in the `(event_id, selector)` stake index
    pub fn index_key(&self) -> String {
        match self {
            Selector::Side(side) => format!("side:{}", side.as_str()),
            Selector::Outcome(id) => format!("outcome:{}", id),
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Side(side) => write!(f, "{}", side.as_str()),
            Selector::Outcome(id) => write!(f, "{}", id),
        }
    }
}

// ============================================================================
// ACCOUNTS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub user_id: String,
    /// Never negative
    pub balance: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn new(user_id: &str, balance: Decimal) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.to_string(),
            balance,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn debit(&mut self, amount: Decimal) -> Result<(), EngineError> {
        if self.balance < amount {
            return Err(EngineError::InsufficientFunds {
                available: self.balance,
                requested: amount,
            });
        }
        self.balance -= amount;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn credit(&mut self, amount: Decimal) {
        self.balance += amount;
        self.updated_at = Utc::now();
    }
}

// ============================================================================
// EVENTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Binary,
    Multiple,
}

/// Event lifecycle
///
/// Flow: Open → Closed → Resolved
///         ↑______↓         │
///               ↑__________↓ (dispute)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    /// Accepting stakes
    Open,
    /// Trading halted, awaiting a resolution
    Closed,
    /// Winner declared
    Resolved,
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status_str = match self {
            EventStatus::Open => "open",
            EventStatus::Closed => "closed",
            EventStatus::Resolved => "resolved",
        };
        write!(f, "{}", status_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeDef {
    pub id: String,
    pub label: String,
}

/// Idempotency guard for payouts. A dispute returns the event to
/// `Unsettled`; the next settlement gets a fresh run id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Settlement {
    Unsettled,
    Settled {
        run_id: u64,
        settled_at: DateTime<Utc>,
        total_pool: Decimal,
        winning_pool: Decimal,
        paid_out: Decimal,
    },
}

impl Settlement {
    pub fn run_id(&self) -> Option<u64> {
        match self {
            Settlement::Unsettled => None,
            Settlement::Settled { run_id, .. } => Some(*run_id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub market_id: String,
    pub title: String,
    pub kind: EventKind,
    /// Declared outcomes for `Multiple`, in canonical order
    #[serde(default)]
    pub outcomes: Vec<OutcomeDef>,
    pub status: EventStatus,
    pub creator: String,
    #[serde(default)]
    pub resolver: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    pub winner: Option<Selector>,
    pub settlement: Settlement,
    /// Cache of Σ stakes.amount, written in the same commit as each stake
    pub volume: Decimal,
    pub traders_count: u64,
    /// Settlement runs so far; the next run id is this plus one
    pub settlement_runs: u64,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Event {
    pub fn is_settled(&self) -> bool {
        matches!(self.settlement, Settlement::Settled { .. })
    }

    /// Every selector in canonical order: yes/no, or declared outcomes
    pub fn selectors(&self) -> Vec<(Selector, String)> {
        match self.kind {
            EventKind::Binary => vec![
                (Selector::yes(), "Yes".to_string()),
                (Selector::no(), "No".to_string()),
            ],
            EventKind::Multiple => self
                .outcomes
                .iter()
                .map(|o| (Selector::Outcome(o.id.clone()), o.label.clone()))
                .collect(),
        }
    }

    pub fn validate_selector(&self, selector: &Selector) -> Result<(), EngineError> {
        match (self.kind, selector) {
            (EventKind::Binary, Selector::Side(_)) => Ok(()),
            (EventKind::Multiple, Selector::Outcome(id)) => {
                if self.outcomes.iter().any(|o| &o.id == id) {
                    Ok(())
                } else {
                    Err(EngineError::validation(format!(
                        "outcome '{}' is not declared on event {}",
                        id, self.id
                    )))
                }
            }
            (EventKind::Binary, Selector::Outcome(_)) => Err(EngineError::validation(
                "binary events take a yes/no side, not an outcome",
            )),
            (EventKind::Multiple, Selector::Side(_)) => Err(EngineError::validation(
                "multiple-outcome events take an outcome id, not a side",
            )),
        }
    }
}

// ============================================================================
// STAKES
// ============================================================================

/// A bet. Immutable once written and the only source of pool sizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stake {
    pub id: u64,
    pub event_id: String,
    pub user_id: String,
    pub selector: Selector,
    pub amount: Decimal,
    pub created_at: DateTime<Utc>,
}

impl Stake {
    /// Legacy alias: shares are bought at par, one per token
    pub fn shares(&self) -> Decimal {
        self.amount
    }

    pub fn price(&self) -> u32 {
        LEGACY_SHARE_PRICE
    }
}

// ============================================================================
// RESOLUTION VOTES & DISPUTES
// ============================================================================

/// Advisory only; the latest vote per user wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionVote {
    pub event_id: String,
    pub user_id: String,
    pub outcome: Selector,
    pub reason: String,
    pub voted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisputeStatus {
    Pending,
    Reviewed,
    Resolved,
    Rejected,
}

impl fmt::Display for DisputeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DisputeStatus::Pending => "pending",
            DisputeStatus::Reviewed => "reviewed",
            DisputeStatus::Resolved => "resolved",
            DisputeStatus::Rejected => "rejected",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionDispute {
    pub id: u64,
    pub event_id: String,
    pub filer: String,
    pub reason: String,
    pub status: DisputeStatus,
    /// Winner that was in force when the dispute was filed
    pub disputed_winner: Option<Selector>,
    /// Settlement run cleared by this dispute, if the event had paid out
    pub reversed_run: Option<u64>,
    pub reviewed_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// JOURNAL
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalKind {
    Deposit,
    Stake,
    Payout,
    Reversal,
}

/// One balance movement. Every account write commits together with the
/// entry that explains it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: u64,
    pub user_id: String,
    pub event_id: Option<String>,
    pub kind: JournalKind,
    /// Signed: negative for debits
    pub amount: Decimal,
    pub balance_after: Decimal,
    #[serde(default)]
    pub run_id: Option<u64>,
    /// Part of a reversal that could not be recovered from the balance
    #[serde(default)]
    pub shortfall: Option<Decimal>,
    pub created_at: DateTime<Utc>,
}

/// Credit made to one user by one settlement run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutRecord {
    pub event_id: String,
    pub run_id: u64,
    pub user_id: String,
    pub amount: Decimal,
}

// ============================================================================
// REQUEST BODIES
// ============================================================================

/// POST /events request body
///
/// ```json
/// {
///   "market_id": "friday-league",
///   "title": "Who wins the final?",
///   "kind": "multiple",
///   "outcomes": [{ "id": "reds", "label": "Reds" }, { "id": "blues", "label": "Blues" }],
///   "resolver": "carol"
/// }
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct NewEvent {
    pub market_id: String,
    pub title: String,
    pub kind: EventKind,
    #[serde(default)]
    pub outcomes: Vec<OutcomeDef>,
    #[serde(default)]
    pub resolver: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PlaceStakeRequest {
    pub selector: Selector,
    pub amount: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct VoteRequest {
    pub outcome: Selector,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    pub outcome: Selector,
}

#[derive(Debug, Deserialize)]
pub struct DisputeRequest {
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct ConcludeDisputeRequest {
    pub upheld: bool,
}

#[derive(Debug, Deserialize)]
pub struct RegisterMarketRequest {
    pub market_id: String,
}

#[derive(Debug, Deserialize)]
pub struct AddMemberRequest {
    pub user_id: String,
}
