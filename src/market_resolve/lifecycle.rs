// ============================================================================
// Resolution State Machine
// ============================================================================
//
//   Open ──close──▶ Closed ──resolve──▶ Resolved
//     ▲               │  ▲                  │
//     └────reopen─────┘  └─────dispute──────┘
//
// resolve settles in the same commit. dispute clears the winner and the
// settlement marker in the same commit, and (by default) claws back the
// payouts of the run it clears.
//
// ============================================================================

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;

use super::settlement::SettlementRun;
use super::{Authority, PoolEngine};
use crate::auth::Actor;
use crate::error::EngineError;
use crate::ledger::abort;
use crate::models::*;
use crate::notify::Notification;

#[derive(Debug, Clone, Serialize)]
pub struct VoteCount {
    pub selector: Selector,
    pub label: String,
    pub votes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Resolution {
    pub event: Event,
    pub settlement: SettlementRun,
}

/// One payout clawed back by a dispute
#[derive(Debug, Clone, Serialize)]
pub struct Reversal {
    pub user_id: String,
    pub credited: Decimal,
    pub recovered: Decimal,
    /// Part of the credit already spent; never taken below zero
    pub shortfall: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct DisputeReceipt {
    pub dispute: ResolutionDispute,
    pub event: Event,
    pub reversals: Vec<Reversal>,
}

impl PoolEngine {
    /// Open → Closed
    pub fn close(&self, actor: &Actor, event_id: &str) -> Result<Event, EngineError> {
        self.transition(actor, event_id, Authority::Manage, |event| {
            if event.status != EventStatus::Open {
                return Err(EngineError::InvalidTransition { op: "close", status: event.status });
            }
            event.status = EventStatus::Closed;
            event.closed_at = Some(Utc::now());
            Ok(())
        })
    }

    /// Closed → Open. Only resolved events carry a settlement, and a
    /// dispute clears it on the way back to Closed.
    pub fn reopen(&self, actor: &Actor, event_id: &str) -> Result<Event, EngineError> {
        self.transition(actor, event_id, Authority::Manage, |event| {
            if event.status != EventStatus::Closed {
                return Err(EngineError::InvalidTransition { op: "reopen", status: event.status });
            }
            event.status = EventStatus::Open;
            event.closed_at = None;
            Ok(())
        })
    }

    fn transition<F>(
        &self,
        actor: &Actor,
        event_id: &str,
        authority: Authority,
        apply: F,
    ) -> Result<Event, EngineError>
    where
        F: Fn(&mut Event) -> Result<(), EngineError>,
    {
        let event_lock = self.ledger.locks().event(event_id);
        let _event_guard = event_lock.lock();

        let event = self.ledger.require_event(event_id)?;
        self.authorize(actor, &event, authority)?;

        let event = self.ledger.transaction(|tx| {
            let mut event = tx.require_event(event_id)?;
            if let Err(e) = apply(&mut event) {
                return abort(e);
            }
            tx.put_event(&event)?;
            Ok(event)
        })?;

        tracing::info!("🔁 Event {} is now {} ({})", event_id, event.status, actor.user_id);
        Ok(event)
    }

    /// Advisory vote on the outcome of a closed event; one per stake-holder,
    /// the latest replaces the previous one
    pub fn vote(
        &self,
        actor: &Actor,
        event_id: &str,
        outcome: Selector,
        reason: &str,
    ) -> Result<ResolutionVote, EngineError> {
        let event_lock = self.ledger.locks().event(event_id);
        let _event_guard = event_lock.lock();

        let event = self.ledger.require_event(event_id)?;
        if event.status != EventStatus::Closed {
            return Err(EngineError::InvalidTransition { op: "vote on", status: event.status });
        }
        if !self.ledger.has_staked(event_id, &actor.user_id)? {
            return Err(EngineError::unauthorized("only stake-holders can vote"));
        }
        event.validate_selector(&outcome)?;

        let vote = ResolutionVote {
            event_id: event_id.to_string(),
            user_id: actor.user_id.clone(),
            outcome,
            reason: reason.trim().to_string(),
            voted_at: Utc::now(),
        };
        self.ledger.transaction(|tx| tx.put_vote(&vote))?;

        tracing::info!("🗳️  {} voted {} on event {}", vote.user_id, vote.outcome, event_id);
        Ok(vote)
    }

    pub fn vote_tally(&self, event_id: &str) -> Result<Vec<VoteCount>, EngineError> {
        let event = self.ledger.require_event(event_id)?;
        let votes = self.ledger.votes(event_id)?;
        Ok(event
            .selectors()
            .into_iter()
            .map(|(selector, label)| VoteCount {
                votes: votes.iter().filter(|v| v.outcome == selector).count() as u64,
                selector,
                label,
            })
            .collect())
    }

    /// Closed → Resolved, settling in the same commit. Admins may resolve
    /// any event; their resolutions are written to the audit log.
    pub fn resolve(&self, actor: &Actor, event_id: &str, outcome: Selector) -> Result<Resolution, EngineError> {
        let event_lock = self.ledger.locks().event(event_id);
        let _event_guard = event_lock.lock();

        let event = self.ledger.require_event(event_id)?;
        if !actor.admin {
            self.authorize(actor, &event, Authority::Resolve)?;
        }
        if event.status != EventStatus::Closed {
            return Err(EngineError::InvalidTransition { op: "resolve", status: event.status });
        }
        event.validate_selector(&outcome)?;

        let prepared = self.prepare_settlement(&event, &outcome)?;
        let credits = prepared.plan.credits();
        let account_locks = self.ledger.locks().accounts(credits.keys());
        let _account_guards: Vec<_> = account_locks.iter().map(|l| l.lock()).collect();

        let resolved = self.ledger.transaction(|tx| {
            let mut current = tx.require_event(event_id)?;
            if current.status != EventStatus::Closed {
                return abort(EngineError::InvalidTransition { op: "resolve", status: current.status });
            }
            current.status = EventStatus::Resolved;
            current.winner = Some(outcome.clone());
            current.resolved_at = Some(Utc::now());
            Self::apply_settlement(tx, &mut current, &prepared)?;
            Ok(current)
        })?;

        if actor.admin {
            tracing::info!(
                target: "audit",
                actor = %actor.user_id,
                event_id,
                outcome = %outcome,
                run_id = prepared.run_id,
                "admin resolution"
            );
        }
        tracing::info!("✅ Event {} resolved as {} by {}", event_id, outcome, actor.user_id);
        let settlement = self.finish_settlement(&resolved, prepared);
        Ok(Resolution { event: resolved, settlement })
    }

    /// Resolved → Closed. Clears the winner and the settlement marker; with
    /// `reverse_payouts_on_dispute` the cleared run's credits are taken
    /// back in the same commit.
    pub fn dispute(&self, actor: &Actor, event_id: &str, reason: &str) -> Result<DisputeReceipt, EngineError> {
        let reason = reason.trim();
        if reason.chars().count() < self.config.min_dispute_reason {
            return Err(EngineError::validation(format!(
                "dispute reason must be at least {} characters",
                self.config.min_dispute_reason
            )));
        }

        let event_lock = self.ledger.locks().event(event_id);
        let _event_guard = event_lock.lock();

        let event = self.ledger.require_event(event_id)?;
        if event.status != EventStatus::Resolved {
            return Err(EngineError::InvalidTransition { op: "dispute", status: event.status });
        }
        if !self.ledger.has_staked(event_id, &actor.user_id)? {
            return Err(EngineError::unauthorized("only stake-holders can dispute a resolution"));
        }

        let cleared_run = event.settlement.run_id();
        let reversed_run = cleared_run.filter(|_| self.config.reverse_payouts_on_dispute);
        let payouts = match cleared_run {
            Some(run_id) if self.config.reverse_payouts_on_dispute => self.ledger.payouts(event_id, run_id)?,
            Some(run_id) => {
                tracing::warn!(
                    "⚠️  Event {} disputed after settlement run {}; payouts are kept and a new resolution will pay again",
                    event_id,
                    run_id
                );
                Vec::new()
            }
            None => Vec::new(),
        };

        let account_locks = self.ledger.locks().accounts(payouts.iter().map(|p| &p.user_id));
        let _account_guards: Vec<_> = account_locks.iter().map(|l| l.lock()).collect();

        let dispute_id = self.ledger.next_id()?;
        let entry_ids = payouts
            .iter()
            .map(|_| self.ledger.next_id())
            .collect::<Result<Vec<_>, _>>()?;
        let filer = actor.user_id.as_str();

        let (dispute, event, reversals) = self.ledger.transaction(|tx| {
            let mut event = tx.require_event(event_id)?;
            if event.status != EventStatus::Resolved {
                return abort(EngineError::InvalidTransition { op: "dispute", status: event.status });
            }

            let now = Utc::now();
            let mut reversals = Vec::with_capacity(payouts.len());
            for (payout, entry_id) in payouts.iter().zip(&entry_ids) {
                let mut account = tx.require_account(&payout.user_id)?;
                let recovered = account.balance.min(payout.amount);
                let shortfall = payout.amount - recovered;
                if let Err(e) = account.debit(recovered) {
                    return abort(e);
                }
                tx.put_account(&account)?;
                tx.append_journal(&JournalEntry {
                    id: *entry_id,
                    user_id: payout.user_id.clone(),
                    event_id: Some(event_id.to_string()),
                    kind: JournalKind::Reversal,
                    amount: -recovered,
                    balance_after: account.balance,
                    run_id: Some(payout.run_id),
                    shortfall: (!shortfall.is_zero()).then_some(shortfall),
                    created_at: now,
                })?;
                reversals.push(Reversal {
                    user_id: payout.user_id.clone(),
                    credited: payout.amount,
                    recovered,
                    shortfall,
                });
            }

            let dispute = ResolutionDispute {
                id: dispute_id,
                event_id: event_id.to_string(),
                filer: filer.to_string(),
                reason: reason.to_string(),
                status: DisputeStatus::Pending,
                disputed_winner: event.winner.clone(),
                reversed_run,
                reviewed_by: None,
                created_at: now,
                updated_at: now,
            };
            tx.put_dispute(&dispute)?;

            event.status = EventStatus::Closed;
            event.winner = None;
            event.resolved_at = None;
            event.settlement = Settlement::Unsettled;
            tx.put_event(&event)?;

            Ok((dispute, event, reversals))
        })?;

        for r in reversals.iter().filter(|r| !r.shortfall.is_zero()) {
            tracing::warn!(
                "⚠️  Reversal shortfall for {} on event {}: credited {}, recovered {}",
                r.user_id,
                event_id,
                r.credited,
                r.recovered
            );
        }
        tracing::info!("⚖️  Event {} disputed by {}: {}", event_id, filer, reason);

        if event.creator != filer {
            self.dispatch(Notification::DisputeFiled {
                recipient: event.creator.clone(),
                event_id: event_id.to_string(),
                filer: filer.to_string(),
                reason: reason.to_string(),
            });
        }

        Ok(DisputeReceipt { dispute, event, reversals })
    }

    /// pending → reviewed
    pub fn review_dispute(&self, actor: &Actor, event_id: &str, dispute_id: u64) -> Result<ResolutionDispute, EngineError> {
        self.advance_dispute(actor, event_id, dispute_id, DisputeStatus::Pending, DisputeStatus::Reviewed)
    }

    /// reviewed → resolved (upheld) or rejected
    pub fn conclude_dispute(
        &self,
        actor: &Actor,
        event_id: &str,
        dispute_id: u64,
        upheld: bool,
    ) -> Result<ResolutionDispute, EngineError> {
        let to = if upheld { DisputeStatus::Resolved } else { DisputeStatus::Rejected };
        self.advance_dispute(actor, event_id, dispute_id, DisputeStatus::Reviewed, to)
    }

    fn advance_dispute(
        &self,
        actor: &Actor,
        event_id: &str,
        dispute_id: u64,
        from: DisputeStatus,
        to: DisputeStatus,
    ) -> Result<ResolutionDispute, EngineError> {
        let event_lock = self.ledger.locks().event(event_id);
        let _event_guard = event_lock.lock();

        let event = self.ledger.require_event(event_id)?;
        if !actor.admin {
            self.authorize(actor, &event, Authority::Resolve)?;
        }

        let reviewer = actor.user_id.as_str();
        let dispute = self.ledger.transaction(|tx| {
            let mut dispute = tx.dispute(event_id, dispute_id)?;
            if dispute.status != from {
                return abort(EngineError::validation(format!(
                    "dispute {} is {}, expected {}",
                    dispute_id, dispute.status, from
                )));
            }
            dispute.status = to;
            dispute.reviewed_by = Some(reviewer.to_string());
            dispute.updated_at = Utc::now();
            tx.put_dispute(&dispute)?;
            Ok(dispute)
        })?;

        if actor.admin {
            tracing::info!(target: "audit", actor = reviewer, event_id, dispute_id, status = %to, "admin dispute review");
        }
        tracing::info!("⚖️  Dispute {} on event {} is now {}", dispute_id, event_id, to);
        Ok(dispute)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::config::Config;
    use crate::notify::MemoryNotifier;
    use rust_decimal_macros::dec;

    const REASON: &str = "the match was abandoned at half time";

    fn staked_and_closed(h: &Harness) -> Event {
        let event = binary_event(&h.engine, "owner");
        h.engine.place_stake(&Actor::user("alice"), &event.id, Selector::yes(), dec!(100)).unwrap();
        h.engine.place_stake(&Actor::user("bob"), &event.id, Selector::no(), dec!(50)).unwrap();
        h.engine.close(&Actor::user("owner"), &event.id).unwrap()
    }

    #[test]
    fn test_close_and_reopen() {
        let h = harness();
        let event = binary_event(&h.engine, "alice");

        let err = h.engine.close(&Actor::user("bob"), &event.id).unwrap_err();
        assert!(matches!(err, EngineError::Unauthorized(_)));

        let closed = h.engine.close(&Actor::user("alice"), &event.id).unwrap();
        assert_eq!(closed.status, EventStatus::Closed);
        assert!(closed.closed_at.is_some());

        let err = h.engine.close(&Actor::user("alice"), &event.id).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { op: "close", .. }));

        let reopened = h.engine.reopen(&Actor::user("owner"), &event.id).unwrap();
        assert_eq!(reopened.status, EventStatus::Open);
    }

    #[test]
    fn test_resolve_settles_in_same_commit() {
        let h = harness();
        let event = staked_and_closed(&h);

        let resolution = h.engine.resolve(&Actor::user("owner"), &event.id, Selector::yes()).unwrap();
        assert_eq!(resolution.event.status, EventStatus::Resolved);
        assert_eq!(resolution.settlement.run_id, 1);
        assert_eq!(resolution.settlement.paid_out, dec!(150));

        assert_eq!(h.engine.balance("alice").unwrap(), dec!(1050));
        assert_eq!(h.engine.balance("bob").unwrap(), dec!(950));

        let event = h.engine.event(&event.id).unwrap();
        assert!(event.is_settled());
        assert_eq!(event.winner, Some(Selector::yes()));

        let won = h.notifier.sent_to("alice");
        assert!(won.iter().any(|n| matches!(n, Notification::Won { payout, .. } if *payout == dec!(150))));
        let lost = h.notifier.sent_to("bob");
        assert!(lost.iter().any(|n| matches!(n, Notification::Lost { .. })));
    }

    #[test]
    fn test_resolve_requires_closed_and_authority() {
        let h = harness();
        let event = binary_event(&h.engine, "owner");

        let err = h.engine.resolve(&Actor::user("owner"), &event.id, Selector::yes()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { op: "resolve", .. }));

        h.engine.close(&Actor::user("owner"), &event.id).unwrap();
        let err = h.engine.resolve(&Actor::user("bob"), &event.id, Selector::yes()).unwrap_err();
        assert!(matches!(err, EngineError::Unauthorized(_)));
        assert_eq!(h.engine.event(&event.id).unwrap().status, EventStatus::Closed);
    }

    #[test]
    fn test_reopen_refuses_resolved_event() {
        let h = harness();
        let event = staked_and_closed(&h);
        h.engine.resolve(&Actor::user("owner"), &event.id, Selector::yes()).unwrap();

        let err = h.engine.reopen(&Actor::user("owner"), &event.id).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { op: "reopen", .. }));
        assert!(h.engine.event(&event.id).unwrap().is_settled());
    }

    #[test]
    fn test_admin_can_resolve_any_event() {
        let h = harness();
        let event = staked_and_closed(&h);

        let resolution = h.engine.resolve(&Actor::admin("ops"), &event.id, Selector::yes()).unwrap();
        assert_eq!(resolution.event.status, EventStatus::Resolved);
        assert_eq!(resolution.settlement.run_id, 1);
        assert_eq!(h.engine.balance("alice").unwrap(), dec!(1050));

        // admin status does not bypass the lifecycle
        let err = h.engine.resolve(&Actor::admin("ops"), &event.id, Selector::no()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { op: "resolve", .. }));
    }

    #[test]
    fn test_votes_only_from_stake_holders_on_closed_events() {
        let h = harness();
        let event = binary_event(&h.engine, "owner");
        h.engine.place_stake(&Actor::user("alice"), &event.id, Selector::yes(), dec!(10)).unwrap();

        let err = h.engine.vote(&Actor::user("alice"), &event.id, Selector::yes(), "").unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));

        h.engine.close(&Actor::user("owner"), &event.id).unwrap();
        let err = h.engine.vote(&Actor::user("carol"), &event.id, Selector::yes(), "").unwrap_err();
        assert!(matches!(err, EngineError::Unauthorized(_)));

        h.engine.vote(&Actor::user("alice"), &event.id, Selector::yes(), "saw it").unwrap();
        h.engine.vote(&Actor::user("alice"), &event.id, Selector::no(), "changed my mind").unwrap();

        let tally = h.engine.vote_tally(&event.id).unwrap();
        assert_eq!(tally[0].votes, 0);
        assert_eq!(tally[1].votes, 1);
        assert_eq!(h.engine.votes(&event.id).unwrap().len(), 1);
    }

    #[test]
    fn test_dispute_reverses_and_allows_resettlement() {
        let h = harness();
        let event = staked_and_closed(&h);
        h.engine.resolve(&Actor::user("owner"), &event.id, Selector::yes()).unwrap();

        let receipt = h.engine.dispute(&Actor::user("bob"), &event.id, REASON).unwrap();
        assert_eq!(receipt.event.status, EventStatus::Closed);
        assert_eq!(receipt.event.winner, None);
        assert_eq!(receipt.event.settlement, Settlement::Unsettled);
        assert_eq!(receipt.dispute.reversed_run, Some(1));
        assert_eq!(receipt.reversals.len(), 1);
        assert_eq!(h.engine.balance("alice").unwrap(), dec!(900));
        assert!(h.notifier.sent_to("owner").iter().any(|n| matches!(n, Notification::DisputeFiled { .. })));

        let resolution = h.engine.resolve(&Actor::user("owner"), &event.id, Selector::no()).unwrap();
        assert_eq!(resolution.settlement.run_id, 2);
        assert_eq!(h.engine.balance("alice").unwrap(), dec!(900));
        assert_eq!(h.engine.balance("bob").unwrap(), dec!(1100));
    }

    #[test]
    fn test_dispute_reversal_records_shortfall() {
        let h = harness();
        let event = staked_and_closed(&h);
        h.engine.resolve(&Actor::user("owner"), &event.id, Selector::yes()).unwrap();

        // alice spends most of her winnings elsewhere
        let other = binary_event(&h.engine, "owner");
        h.engine.place_stake(&Actor::user("alice"), &other.id, Selector::yes(), dec!(1000)).unwrap();
        assert_eq!(h.engine.balance("alice").unwrap(), dec!(50));

        let receipt = h.engine.dispute(&Actor::user("bob"), &event.id, REASON).unwrap();
        assert_eq!(receipt.reversals[0].recovered, dec!(50));
        assert_eq!(receipt.reversals[0].shortfall, dec!(100));
        assert_eq!(h.engine.balance("alice").unwrap(), Decimal::ZERO);

        let last = h.engine.journal("alice").unwrap().pop().unwrap();
        assert_eq!(last.kind, JournalKind::Reversal);
        assert_eq!(last.shortfall, Some(dec!(100)));
    }

    #[test]
    fn test_dispute_without_reversal_keeps_credits() {
        let config = Config { reverse_payouts_on_dispute: false, ..Config::default() };
        let h = harness_with(config, MemoryNotifier::new());
        let event = staked_and_closed(&h);
        h.engine.resolve(&Actor::user("owner"), &event.id, Selector::yes()).unwrap();

        let receipt = h.engine.dispute(&Actor::user("bob"), &event.id, REASON).unwrap();
        assert!(receipt.reversals.is_empty());
        assert_eq!(receipt.dispute.reversed_run, None);
        assert_eq!(h.engine.balance("alice").unwrap(), dec!(1050));
    }

    #[test]
    fn test_dispute_rules() {
        let h = harness();
        let event = staked_and_closed(&h);

        let err = h.engine.dispute(&Actor::user("bob"), &event.id, REASON).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { op: "dispute", .. }));

        h.engine.resolve(&Actor::user("owner"), &event.id, Selector::yes()).unwrap();
        let err = h.engine.dispute(&Actor::user("bob"), &event.id, "   too short   ").unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        let err = h.engine.dispute(&Actor::user("carol"), &event.id, REASON).unwrap_err();
        assert!(matches!(err, EngineError::Unauthorized(_)));
        assert_eq!(h.engine.event(&event.id).unwrap().status, EventStatus::Resolved);
    }

    #[test]
    fn test_dispute_review_flow() {
        let h = harness();
        let event = staked_and_closed(&h);
        h.engine.resolve(&Actor::user("owner"), &event.id, Selector::yes()).unwrap();
        let id = h.engine.dispute(&Actor::user("bob"), &event.id, REASON).unwrap().dispute.id;

        let err = h.engine.conclude_dispute(&Actor::user("owner"), &event.id, id, true).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        let err = h.engine.review_dispute(&Actor::user("carol"), &event.id, id).unwrap_err();
        assert!(matches!(err, EngineError::Unauthorized(_)));

        let reviewed = h.engine.review_dispute(&Actor::admin("ops"), &event.id, id).unwrap();
        assert_eq!(reviewed.status, DisputeStatus::Reviewed);
        assert_eq!(reviewed.reviewed_by.as_deref(), Some("ops"));

        let done = h.engine.conclude_dispute(&Actor::user("owner"), &event.id, id, false).unwrap();
        assert_eq!(done.status, DisputeStatus::Rejected);
        assert_eq!(h.engine.event(&event.id).unwrap().status, EventStatus::Closed);
    }

    #[test]
    fn test_reopen_after_dispute() {
        let h = harness();
        let event = staked_and_closed(&h);
        h.engine.resolve(&Actor::user("owner"), &event.id, Selector::yes()).unwrap();
        h.engine.dispute(&Actor::user("alice"), &event.id, REASON).unwrap();

        let reopened = h.engine.reopen(&Actor::user("owner"), &event.id).unwrap();
        assert_eq!(reopened.status, EventStatus::Open);
        assert_eq!(reopened.settlement, Settlement::Unsettled);
        assert_eq!(reopened.settlement_runs, 1);

        let again = h.engine.settle(&Actor::user("owner"), &event.id).unwrap_err();
        assert!(matches!(again, EngineError::InvalidTransition { op: "settle", .. }));
    }
}
