// Stake Placement Service
//
// One stake is one ledger commit: balance debit, stake record (and its
// pool index key), journal entry, event volume and trader count all land
// together or not at all. Odds are read before and after the commit while
// the event lock is held, for display only.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;

use super::pools::{OddsSnapshot, PotentialPayout};
use super::PoolEngine;
use crate::auth::Actor;
use crate::error::EngineError;
use crate::ledger::abort;
use crate::models::*;
use crate::notify::Notification;

#[derive(Debug, Clone, Serialize)]
pub struct StakeReceipt {
    pub stake: Stake,
    /// Balance after the debit
    pub balance: Decimal,
    pub odds_before: OddsSnapshot,
    pub odds_after: OddsSnapshot,
    pub potential_payout: PotentialPayout,
}

impl PoolEngine {
    fn validate_amount(&self, amount: Decimal) -> Result<(), EngineError> {
        if amount <= Decimal::ZERO {
            return Err(EngineError::validation("stake amount must be positive"));
        }
        if amount < self.config.min_stake {
            return Err(EngineError::validation(format!(
                "minimum stake is {}",
                self.config.min_stake
            )));
        }
        if amount.normalize().scale() > AMOUNT_SCALE {
            return Err(EngineError::validation(format!(
                "amounts carry at most {} decimal places",
                AMOUNT_SCALE
            )));
        }
        Ok(())
    }

    pub fn place_stake(
        &self,
        actor: &Actor,
        event_id: &str,
        selector: Selector,
        amount: Decimal,
    ) -> Result<StakeReceipt, EngineError> {
        self.validate_amount(amount)?;

        let event = self.ledger.require_event(event_id)?;
        self.ensure_member(actor, &event)?;
        event.validate_selector(&selector)?;

        let event_lock = self.ledger.locks().event(event_id);
        let _event_guard = event_lock.lock();
        let account_lock = self.ledger.locks().account(&actor.user_id);
        let _account_guard = account_lock.lock();
        // under the event lock so before/after differ by exactly this stake
        let odds_before = self.snapshot(&event)?;

        let stake_id = self.ledger.next_id()?;
        let entry_id = self.ledger.next_id()?;
        let user_id = actor.user_id.as_str();

        let (stake, account, event) = self.ledger.transaction(|tx| {
            let mut event = tx.require_event(event_id)?;
            if event.status != EventStatus::Open {
                return abort(EngineError::InvalidTransition { op: "stake on", status: event.status });
            }

            let mut account = tx.require_account(user_id)?;
            if let Err(e) = account.debit(amount) {
                return abort(e);
            }

            let now = Utc::now();
            let stake = Stake {
                id: stake_id,
                event_id: event_id.to_string(),
                user_id: user_id.to_string(),
                selector: selector.clone(),
                amount,
                created_at: now,
            };
            tx.insert_stake(&stake)?;
            tx.put_account(&account)?;
            tx.append_journal(&JournalEntry {
                id: entry_id,
                user_id: user_id.to_string(),
                event_id: Some(event_id.to_string()),
                kind: JournalKind::Stake,
                amount: -amount,
                balance_after: account.balance,
                run_id: None,
                shortfall: None,
                created_at: now,
            })?;

            event.volume += amount;
            if !tx.is_participant(event_id, user_id)? {
                tx.mark_participant(event_id, user_id)?;
                event.traders_count += 1;
            }
            tx.put_event(&event)?;

            Ok((stake, account, event))
        })?;

        tracing::info!(
            "🎲 {} staked {} on {} for event {} (balance {})",
            user_id,
            amount,
            selector,
            event_id,
            account.balance
        );

        let odds_after = self.snapshot(&event)?;
        let stakes = self.ledger.stakes_by_user(event_id, user_id)?;
        let potential_payout = super::pools::project_payout(&odds_after, user_id, &stakes);

        if event.creator != user_id {
            self.dispatch(Notification::NewStake {
                recipient: event.creator.clone(),
                event_id: event_id.to_string(),
                staker: user_id.to_string(),
                selector: stake.selector.clone(),
                amount,
            });
        }

        Ok(StakeReceipt {
            stake,
            balance: account.balance,
            odds_before,
            odds_after,
            potential_payout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::notify::MemoryNotifier;
    use rust_decimal_macros::dec;

    #[test]
    fn test_stake_debits_and_updates_volume() {
        let h = harness();
        let event = binary_event(&h.engine, "owner");

        let receipt = h
            .engine
            .place_stake(&Actor::user("alice"), &event.id, Selector::yes(), dec!(100))
            .unwrap();
        assert_eq!(receipt.balance, dec!(900));
        assert_eq!(receipt.odds_before.total_pool, Decimal::ZERO);
        assert_eq!(receipt.odds_after.total_pool, dec!(100));
        assert_eq!(receipt.stake.shares(), dec!(100));
        assert_eq!(receipt.stake.price(), 100);

        h.engine.place_stake(&Actor::user("alice"), &event.id, Selector::no(), dec!(20)).unwrap();
        h.engine.place_stake(&Actor::user("bob"), &event.id, Selector::no(), dec!(30)).unwrap();

        let event = h.engine.event(&event.id).unwrap();
        assert_eq!(event.volume, dec!(150));
        assert_eq!(event.traders_count, 2);

        let journal = h.engine.journal("alice").unwrap();
        assert_eq!(journal.len(), 3);
        assert_eq!(journal[1].kind, JournalKind::Stake);
        assert_eq!(journal[1].amount, dec!(-100));
    }

    #[test]
    fn test_insufficient_funds_changes_nothing() {
        let h = harness();
        let event = binary_event(&h.engine, "owner");

        let err = h
            .engine
            .place_stake(&Actor::user("bob"), &event.id, Selector::yes(), dec!(1000.01))
            .unwrap_err();
        assert!(matches!(err, EngineError::InsufficientFunds { .. }));

        assert_eq!(h.engine.balance("bob").unwrap(), dec!(1000));
        let event = h.engine.event(&event.id).unwrap();
        assert_eq!(event.volume, Decimal::ZERO);
        assert_eq!(event.traders_count, 0);
        assert!(h.engine.stakes(&event.id).unwrap().is_empty());
        assert_eq!(h.engine.journal("bob").unwrap().len(), 1);
    }

    #[test]
    fn test_amount_rules() {
        let h = harness();
        let event = binary_event(&h.engine, "owner");
        let alice = Actor::user("alice");

        for bad in [dec!(0), dec!(-5), dec!(0.5), dec!(1.005)] {
            let err = h.engine.place_stake(&alice, &event.id, Selector::yes(), bad).unwrap_err();
            assert!(matches!(err, EngineError::Validation(_)), "{} accepted", bad);
        }
        assert!(h.engine.place_stake(&alice, &event.id, Selector::yes(), dec!(1.50)).is_ok());
    }

    #[test]
    fn test_huge_stake_keeps_odds_readable() {
        let h = harness();
        let event = binary_event(&h.engine, "owner");
        let huge = Decimal::from_i128_with_scale(10i128.pow(27), 0);
        h.markets.add_member(&Actor::user("owner"), "club", "whale").unwrap();
        h.engine.open_account("whale", huge).unwrap();

        let receipt = h
            .engine
            .place_stake(&Actor::user("whale"), &event.id, Selector::yes(), huge)
            .unwrap();
        assert_eq!(receipt.odds_after.total_pool, huge);
        assert_eq!(receipt.potential_payout.total_staked, huge);
        assert_eq!(h.engine.compute_odds(&event.id).unwrap().sides[0].percent, 100);
    }

    #[test]
    fn test_closed_event_and_wrong_selector_rejected() {
        let h = harness();
        let event = binary_event(&h.engine, "owner");
        let alice = Actor::user("alice");

        let err = h
            .engine
            .place_stake(&alice, &event.id, Selector::outcome("reds"), dec!(5))
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        h.engine.close(&Actor::user("owner"), &event.id).unwrap();
        let err = h.engine.place_stake(&alice, &event.id, Selector::yes(), dec!(5)).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
        assert_eq!(h.engine.balance("alice").unwrap(), dec!(1000));
    }

    #[test]
    fn test_non_member_cannot_stake() {
        let h = harness();
        let event = binary_event(&h.engine, "owner");
        h.engine.open_account("mallory", dec!(50)).unwrap();

        let err = h
            .engine
            .place_stake(&Actor::user("mallory"), &event.id, Selector::yes(), dec!(5))
            .unwrap_err();
        assert!(matches!(err, EngineError::Unauthorized(_)));
    }

    #[test]
    fn test_creator_notified_of_others_stakes() {
        let h = harness();
        let event = binary_event(&h.engine, "alice");

        h.engine.place_stake(&Actor::user("alice"), &event.id, Selector::yes(), dec!(5)).unwrap();
        h.engine.place_stake(&Actor::user("bob"), &event.id, Selector::no(), dec!(5)).unwrap();

        let sent = h.notifier.sent_to("alice");
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0], Notification::NewStake { staker, .. } if staker == "bob"));
    }

    #[test]
    fn test_failed_notification_keeps_stake() {
        let h = harness_with(Default::default(), MemoryNotifier::failing());
        let event = binary_event(&h.engine, "alice");

        let receipt = h
            .engine
            .place_stake(&Actor::user("bob"), &event.id, Selector::no(), dec!(40))
            .unwrap();
        assert_eq!(receipt.balance, dec!(960));
        assert_eq!(h.notifier.sent().len(), 1);
        assert_eq!(h.engine.event(&event.id).unwrap().volume, dec!(40));
    }
}
