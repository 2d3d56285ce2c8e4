// ============================================================================
// Market Resolve Module - parimutuel pools, stakes and resolution
// ============================================================================
//
//   - pools: odds and implied probabilities derived from the stake record
//   - stakes: atomic stake placement
//   - lifecycle: close / reopen / vote / resolve / dispute
//   - settlement: exactly-once payout per settlement run
//
// Every mutating operation takes the event lock first, then account locks
// in user-id order, and commits in a single ledger transaction.
//
// ============================================================================

pub mod lifecycle;
pub mod pools;
pub mod settlement;
pub mod stakes;

pub use lifecycle::*;
pub use pools::*;
pub use settlement::*;
pub use stakes::*;

use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;

use crate::auth::{Actor, MarketDirectory};
use crate::config::Config;
use crate::error::EngineError;
use crate::ledger::Ledger;
use crate::models::*;
use crate::notify::{Notification, Notifier};

/// Roles that may drive an event's lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authority {
    /// close / reopen: creator, host or market owner
    Manage,
    /// resolve / settle / dispute review: adds the designated resolver
    Resolve,
}

pub struct PoolEngine {
    pub(crate) ledger: Ledger,
    pub(crate) config: Config,
    markets: Arc<dyn MarketDirectory>,
    notifier: Arc<dyn Notifier>,
}

impl PoolEngine {
    pub fn new(
        ledger: Ledger,
        config: Config,
        markets: Arc<dyn MarketDirectory>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self { ledger, config, markets, notifier }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ===== ACCOUNTS =====

    pub fn open_account(&self, user_id: &str, initial: Decimal) -> Result<Account, EngineError> {
        self.ledger.open_account(user_id, initial)
    }

    pub fn balance(&self, user_id: &str) -> Result<Decimal, EngineError> {
        Ok(self.ledger.require_account(user_id)?.balance)
    }

    pub fn journal(&self, user_id: &str) -> Result<Vec<JournalEntry>, EngineError> {
        self.ledger.require_account(user_id)?;
        self.ledger.journal(user_id)
    }

    // ===== EVENTS =====

    pub fn create_event(&self, actor: &Actor, new_event: NewEvent) -> Result<Event, EngineError> {
        if !self.markets.is_member(&new_event.market_id, &actor.user_id) {
            return Err(EngineError::unauthorized(format!(
                "{} is not a member of market {}",
                actor.user_id, new_event.market_id
            )));
        }
        let title = new_event.title.trim();
        if title.is_empty() {
            return Err(EngineError::validation("event title cannot be empty"));
        }

        match new_event.kind {
            EventKind::Binary if !new_event.outcomes.is_empty() => {
                return Err(EngineError::validation("binary events do not declare outcomes"));
            }
            EventKind::Multiple => {
                if new_event.outcomes.len() < 2 {
                    return Err(EngineError::validation(
                        "multiple-outcome events need at least two outcomes",
                    ));
                }
                let mut seen = HashSet::new();
                for outcome in &new_event.outcomes {
                    validate_identifier("outcome id", &outcome.id)?;
                    if !seen.insert(outcome.id.as_str()) {
                        return Err(EngineError::validation(format!(
                            "outcome '{}' declared twice",
                            outcome.id
                        )));
                    }
                }
            }
            _ => {}
        }

        let event = Event {
            id: uuid::Uuid::new_v4().simple().to_string(),
            market_id: new_event.market_id,
            title: title.to_string(),
            kind: new_event.kind,
            outcomes: new_event.outcomes,
            status: EventStatus::Open,
            creator: actor.user_id.clone(),
            resolver: new_event.resolver,
            host: new_event.host,
            winner: None,
            settlement: Settlement::Unsettled,
            volume: Decimal::ZERO,
            traders_count: 0,
            settlement_runs: 0,
            created_at: Utc::now(),
            closed_at: None,
            resolved_at: None,
        };
        self.ledger.insert_event(&event)?;

        tracing::info!("🎯 Event {} created in market {}: {}", event.id, event.market_id, event.title);
        Ok(event)
    }

    pub fn event(&self, event_id: &str) -> Result<Event, EngineError> {
        self.ledger.require_event(event_id)
    }

    pub fn stakes(&self, event_id: &str) -> Result<Vec<Stake>, EngineError> {
        self.ledger.require_event(event_id)?;
        self.ledger.stakes(event_id)
    }

    pub fn votes(&self, event_id: &str) -> Result<Vec<ResolutionVote>, EngineError> {
        self.ledger.require_event(event_id)?;
        self.ledger.votes(event_id)
    }

    pub fn disputes(&self, event_id: &str) -> Result<Vec<ResolutionDispute>, EngineError> {
        self.ledger.require_event(event_id)?;
        self.ledger.disputes(event_id)
    }

    // ===== COLLABORATORS =====

    pub(crate) fn ensure_member(&self, actor: &Actor, event: &Event) -> Result<(), EngineError> {
        if self.markets.is_member(&event.market_id, &actor.user_id) {
            Ok(())
        } else {
            Err(EngineError::unauthorized(format!(
                "{} is not a member of market {}",
                actor.user_id, event.market_id
            )))
        }
    }

    pub(crate) fn authorize(&self, actor: &Actor, event: &Event, authority: Authority) -> Result<(), EngineError> {
        let user = actor.user_id.as_str();
        let is_owner = self.markets.owner(&event.market_id).as_deref() == Some(user);
        let allowed = event.creator == user
            || event.host.as_deref() == Some(user)
            || is_owner
            || (authority == Authority::Resolve && event.resolver.as_deref() == Some(user));

        if allowed {
            Ok(())
        } else {
            let role = match authority {
                Authority::Manage => "the creator, host or market owner",
                Authority::Resolve => "the creator, resolver, host or market owner",
            };
            Err(EngineError::unauthorized(format!("only {} can do this", role)))
        }
    }

    /// Best effort; a failed delivery is logged and otherwise ignored
    pub(crate) fn dispatch(&self, notification: Notification) {
        if let Err(e) = self.notifier.notify(&notification) {
            tracing::warn!(
                recipient = notification.recipient(),
                "⚠️  {}",
                e
            );
        }
    }
}
