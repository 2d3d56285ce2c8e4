// ============================================================================
// Settlement Engine - exactly-once payout per resolution
// ============================================================================
//
//   winning_pool == 0            → nobody picked the winner, pool forfeited
//   winning_pool == total_pool   → everyone picked it, stakes returned 1:1
//   otherwise                    → payout = round(amount * total / winning, 2)
//
// The Settlement marker on the event is written in the same commit as the
// credits, under the event lock, so a retry finds `Settled` and does
// nothing. Rounding can leave the paid total a few minimal units away from
// the pool; that residue is reported, not redistributed.
//
// ============================================================================

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;

use super::PoolEngine;
use super::pools::round_amount;
use crate::auth::Actor;
use crate::error::EngineError;
use crate::ledger::{abort, LedgerTx, TxResult};
use crate::models::*;
use crate::notify::Notification;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StakePayout {
    pub stake_id: u64,
    pub user_id: String,
    pub staked: Decimal,
    pub payout: Decimal,
}

/// Pure result of applying a winner to a stake record
#[derive(Debug, Clone, Serialize)]
pub struct SettlementPlan {
    pub winner: Selector,
    pub total_pool: Decimal,
    pub winning_pool: Decimal,
    /// `None` when nobody picked the winner
    pub multiplier: Option<Decimal>,
    pub payouts: Vec<StakePayout>,
    /// Stake amounts of the losing side, per user
    pub losers: BTreeMap<String, Decimal>,
}

impl SettlementPlan {
    pub fn paid_out(&self) -> Decimal {
        self.payouts.iter().map(|p| p.payout).sum()
    }

    /// `total_pool - paid_out`: forfeited pool or rounding residue
    pub fn residue(&self) -> Decimal {
        self.total_pool - self.paid_out()
    }

    /// Total credit per winning user, sorted by user id
    pub fn credits(&self) -> BTreeMap<String, Decimal> {
        let mut credits = BTreeMap::new();
        for p in &self.payouts {
            *credits.entry(p.user_id.clone()).or_insert(Decimal::ZERO) += p.payout;
        }
        credits
    }
}

pub fn plan_settlement(stakes: &[Stake], winner: &Selector) -> SettlementPlan {
    let total_pool: Decimal = stakes.iter().map(|s| s.amount).sum();
    let winning: Vec<&Stake> = stakes.iter().filter(|s| &s.selector == winner).collect();
    let winning_pool: Decimal = winning.iter().map(|s| s.amount).sum();

    let mut losers = BTreeMap::new();
    for s in stakes.iter().filter(|s| &s.selector != winner) {
        *losers.entry(s.user_id.clone()).or_insert(Decimal::ZERO) += s.amount;
    }

    let multiplier = if winning_pool.is_zero() {
        None
    } else if winning_pool == total_pool {
        Some(Decimal::ONE)
    } else {
        Some(total_pool / winning_pool)
    };

    let payouts = match multiplier {
        None => Vec::new(),
        Some(m) => winning
            .iter()
            .map(|s| StakePayout {
                stake_id: s.id,
                user_id: s.user_id.clone(),
                staked: s.amount,
                payout: if m == Decimal::ONE { s.amount } else { round_amount(s.amount * m) },
            })
            .collect(),
    };

    SettlementPlan {
        winner: winner.clone(),
        total_pool,
        winning_pool,
        multiplier,
        payouts,
        losers,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SettlementRun {
    pub event_id: String,
    pub run_id: u64,
    pub plan: SettlementPlan,
    pub paid_out: Decimal,
    pub residue: Decimal,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SettlementOutcome {
    Settled(SettlementRun),
    /// The marker was already set; nothing moved
    AlreadySettled { event_id: String, run_id: u64 },
}

impl SettlementOutcome {
    pub fn run_id(&self) -> u64 {
        match self {
            SettlementOutcome::Settled(run) => run.run_id,
            SettlementOutcome::AlreadySettled { run_id, .. } => *run_id,
        }
    }
}

/// Journal ids reserved up front; a transaction retry must not burn new ones
pub(crate) struct PreparedSettlement {
    pub plan: SettlementPlan,
    pub run_id: u64,
    pub journal_ids: Vec<u64>,
}

impl PoolEngine {
    pub(crate) fn prepare_settlement(&self, event: &Event, winner: &Selector) -> Result<PreparedSettlement, EngineError> {
        // Stakes are only written under the event lock the caller holds
        let stakes = self.ledger.stakes(&event.id)?;
        let plan = plan_settlement(&stakes, winner);
        let journal_ids = plan
            .credits()
            .keys()
            .map(|_| self.ledger.next_id())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(PreparedSettlement { plan, run_id: event.settlement_runs + 1, journal_ids })
    }

    /// Credit winners, record the run and set the marker. Runs inside the
    /// caller's transaction, which has already moved `event` to Resolved.
    pub(crate) fn apply_settlement(
        tx: &LedgerTx<'_>,
        event: &mut Event,
        prepared: &PreparedSettlement,
    ) -> TxResult<()> {
        if let Settlement::Settled { run_id, .. } = event.settlement {
            return abort(EngineError::Validation(format!(
                "event {} already settled by run {}",
                event.id, run_id
            )));
        }

        let now = Utc::now();
        let credits = prepared.plan.credits();
        for ((user_id, amount), entry_id) in credits.iter().zip(&prepared.journal_ids) {
            let mut account = tx.require_account(user_id)?;
            account.credit(*amount);
            tx.put_account(&account)?;
            tx.append_journal(&JournalEntry {
                id: *entry_id,
                user_id: user_id.clone(),
                event_id: Some(event.id.clone()),
                kind: JournalKind::Payout,
                amount: *amount,
                balance_after: account.balance,
                run_id: Some(prepared.run_id),
                shortfall: None,
                created_at: now,
            })?;
            tx.put_payout(&PayoutRecord {
                event_id: event.id.clone(),
                run_id: prepared.run_id,
                user_id: user_id.clone(),
                amount: *amount,
            })?;
        }

        event.settlement_runs = prepared.run_id;
        event.settlement = Settlement::Settled {
            run_id: prepared.run_id,
            settled_at: now,
            total_pool: prepared.plan.total_pool,
            winning_pool: prepared.plan.winning_pool,
            paid_out: prepared.plan.paid_out(),
        };
        tx.put_event(event)
    }

    pub(crate) fn announce_settlement(&self, event: &Event, plan: &SettlementPlan) {
        let mut staked_by_winner: BTreeMap<String, Decimal> = BTreeMap::new();
        for p in &plan.payouts {
            *staked_by_winner.entry(p.user_id.clone()).or_insert(Decimal::ZERO) += p.staked;
        }
        for (user_id, payout) in plan.credits() {
            let staked = staked_by_winner.get(&user_id).copied().unwrap_or(Decimal::ZERO);
            self.dispatch(Notification::Won {
                recipient: user_id,
                event_id: event.id.clone(),
                staked,
                payout,
            });
        }
        for (user_id, staked) in &plan.losers {
            if staked_by_winner.contains_key(user_id) {
                continue;
            }
            self.dispatch(Notification::Lost {
                recipient: user_id.clone(),
                event_id: event.id.clone(),
                staked: *staked,
            });
        }
    }

    /// Settle a resolved event. Safe to call any number of times: once the
    /// marker is set this is a no-op reporting `AlreadySettled`.
    pub fn settle(&self, actor: &Actor, event_id: &str) -> Result<SettlementOutcome, EngineError> {
        let event_lock = self.ledger.locks().event(event_id);
        let _event_guard = event_lock.lock();

        let event = self.ledger.require_event(event_id)?;
        if !actor.admin {
            self.authorize(actor, &event, super::Authority::Resolve)?;
        }
        if event.status != EventStatus::Resolved {
            return Err(EngineError::InvalidTransition { op: "settle", status: event.status });
        }
        if let Some(run_id) = event.settlement.run_id() {
            tracing::info!("♻️  Event {} already settled by run {}", event_id, run_id);
            return Ok(SettlementOutcome::AlreadySettled { event_id: event_id.to_string(), run_id });
        }
        let winner = event.winner.clone().ok_or_else(|| {
            EngineError::Storage(format!("event {} is resolved without a winner", event_id))
        })?;

        let prepared = self.prepare_settlement(&event, &winner)?;
        let credits = prepared.plan.credits();
        let account_locks = self.ledger.locks().accounts(credits.keys());
        let _account_guards: Vec<_> = account_locks.iter().map(|l| l.lock()).collect();

        let settled = self.ledger.transaction(|tx| {
            let mut current = tx.require_event(event_id)?;
            Self::apply_settlement(tx, &mut current, &prepared)?;
            Ok(current)
        })?;

        if actor.admin {
            tracing::info!(
                target: "audit",
                actor = %actor.user_id,
                event_id,
                run_id = prepared.run_id,
                "admin settlement"
            );
        }
        let run = self.finish_settlement(&settled, prepared);
        Ok(SettlementOutcome::Settled(run))
    }

    pub(crate) fn finish_settlement(&self, event: &Event, prepared: PreparedSettlement) -> SettlementRun {
        let paid_out = prepared.plan.paid_out();
        let residue = prepared.plan.residue();
        tracing::info!(
            "💰 Settled event {} run {}: pool {} paid {} residue {}",
            event.id,
            prepared.run_id,
            prepared.plan.total_pool,
            paid_out,
            residue
        );
        self.announce_settlement(event, &prepared.plan);
        SettlementRun {
            event_id: event.id.clone(),
            run_id: prepared.run_id,
            plan: prepared.plan,
            paid_out,
            residue,
        }
    }
}
