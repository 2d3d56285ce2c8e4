// ============================================================================
// Pool Aggregator - parimutuel odds derived from the stake record
// ============================================================================
//
// Pools are never stored. Each read sums the stakes under the event's
// (event, selector) index and derives:
//
//   odds(side)    = total_pool / side_pool          (payout per token staked)
//   percent(side) = round(side_pool / total * 100)  (implied probability)
//
// An empty side is shown at the display ceiling instead of inventing a
// virtual pool: a bettor alone on a side wins back exactly their stake.
//
// ============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

use super::PoolEngine;
use crate::error::EngineError;
use crate::models::{Event, EventKind, Selector, Stake, AMOUNT_SCALE};

pub const NO_BETS_WARNING: &str = "no bets yet, profit depends on future opposing bets";

/// Floor and ceiling used when deriving display odds
#[derive(Debug, Clone, Copy)]
pub struct OddsPolicy {
    pub liquidity_floor: Decimal,
    pub odds_ceiling: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolSide {
    pub selector: Selector,
    pub label: String,
    pub pool: Decimal,
    /// Implied probability, whole percent; all sides sum to 100
    pub percent: u32,
    /// Display odds, 2 dp, capped at the ceiling
    pub odds: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct OddsSnapshot {
    pub event_id: String,
    pub kind: EventKind,
    pub total_pool: Decimal,
    pub sides: Vec<PoolSide>,
    pub low_liquidity: bool,
    pub warning: Option<String>,
    pub computed_at: DateTime<Utc>,
}

impl OddsSnapshot {
    pub fn side(&self, selector: &Selector) -> Option<&PoolSide> {
        self.sides.iter().find(|s| &s.selector == selector)
    }

    /// Exact payout multiplier for a selector (`total / pool`), or `None`
    /// while nobody has staked on it
    pub fn multiplier(&self, selector: &Selector) -> Option<Decimal> {
        let side = self.side(selector)?;
        if side.pool.is_zero() {
            return None;
        }
        self.total_pool.checked_div(side.pool)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PayoutLine {
    pub selector: Selector,
    pub staked: Decimal,
    pub multiplier: Decimal,
    pub potential: Decimal,
}

/// What the caller would receive if each of their selectors won right now
#[derive(Debug, Clone, Serialize)]
pub struct PotentialPayout {
    pub event_id: String,
    pub user_id: String,
    pub lines: Vec<PayoutLine>,
    pub total_staked: Decimal,
}

impl PotentialPayout {
    pub fn line(&self, selector: &Selector) -> Option<&PayoutLine> {
        self.lines.iter().find(|l| &l.selector == selector)
    }
}

pub fn round_amount(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(AMOUNT_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Whole-number percentages that sum to exactly 100.
///
/// Each side but the last is rounded half away from zero; the last takes
/// the remainder. If rounding up earlier sides would leave the last one
/// negative, the excess is taken back from earlier sides, last first.
pub fn split_percentages(pools: &[Decimal], total: Decimal) -> Vec<u32> {
    let n = pools.len();
    if n == 0 {
        return Vec::new();
    }
    if total.is_zero() {
        let even = 100 / n as u32;
        let mut out = vec![even; n];
        out[n - 1] = 100 - even * (n as u32 - 1);
        return out;
    }

    let mut out: Vec<i64> = pools[..n - 1]
        .iter()
        .map(|pool| {
            // divide first: pool * 100 overflows for pools near Decimal::MAX / 100
            (*pool / total * Decimal::ONE_HUNDRED)
                .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
                .to_i64()
                .unwrap_or(0)
        })
        .collect();

    let mut last = 100 - out.iter().sum::<i64>();
    let mut idx = out.len();
    while last < 0 && idx > 0 {
        idx -= 1;
        let take = out[idx].min(-last);
        out[idx] -= take;
        last += take;
    }
    out.push(last);

    out.into_iter().map(|p| p.max(0) as u32).collect()
}

/// Build the snapshot for `event` from per-selector pool totals given in
/// canonical order.
pub fn snapshot_from_pools(
    event: &Event,
    pools: Vec<(Selector, String, Decimal)>,
    policy: OddsPolicy,
) -> OddsSnapshot {
    let total_pool: Decimal = pools.iter().map(|(_, _, pool)| *pool).sum();
    let amounts: Vec<Decimal> = pools.iter().map(|(_, _, pool)| *pool).collect();
    let percents = split_percentages(&amounts, total_pool);

    let sides: Vec<PoolSide> = pools
        .into_iter()
        .zip(percents)
        .map(|((selector, label, pool), percent)| {
            let odds = if total_pool.is_zero() {
                Decimal::ONE
            } else if pool.is_zero() {
                policy.odds_ceiling
            } else {
                round_amount(total_pool / pool).min(policy.odds_ceiling)
            };
            PoolSide { selector, label, pool, percent, odds }
        })
        .collect();

    let empty_side = sides.iter().find(|s| s.pool.is_zero());
    let warning = if total_pool.is_zero() {
        Some(NO_BETS_WARNING.to_string())
    } else if let Some(side) = empty_side {
        Some(format!(
            "nobody has staked on {} yet; winners currently earn no profit",
            side.label
        ))
    } else if total_pool < policy.liquidity_floor {
        Some(format!(
            "total pool {} is below {}; odds may swing sharply",
            total_pool, policy.liquidity_floor
        ))
    } else {
        None
    };

    OddsSnapshot {
        event_id: event.id.clone(),
        kind: event.kind,
        total_pool,
        low_liquidity: warning.is_some(),
        warning,
        sides,
        computed_at: Utc::now(),
    }
}

/// Multiply the caller's stakes per selector by the current multipliers
pub fn project_payout(snapshot: &OddsSnapshot, user_id: &str, stakes: &[Stake]) -> PotentialPayout {
    let mut lines: Vec<PayoutLine> = Vec::new();
    for side in &snapshot.sides {
        let staked: Decimal = stakes
            .iter()
            .filter(|s| s.user_id == user_id && s.selector == side.selector)
            .map(|s| s.amount)
            .sum();
        if staked.is_zero() {
            continue;
        }
        let multiplier = snapshot.multiplier(&side.selector).unwrap_or(Decimal::ONE);
        lines.push(PayoutLine {
            selector: side.selector.clone(),
            staked,
            multiplier: multiplier.round_dp(4),
            potential: round_amount(staked * multiplier),
        });
    }

    PotentialPayout {
        event_id: snapshot.event_id.clone(),
        user_id: user_id.to_string(),
        total_staked: lines.iter().map(|l| l.staked).sum(),
        lines,
    }
}

impl PoolEngine {
    pub fn odds_policy(&self) -> OddsPolicy {
        OddsPolicy {
            liquidity_floor: self.config.liquidity_floor,
            odds_ceiling: self.config.odds_ceiling,
        }
    }

    /// Live odds for an event, recomputed from its stakes on every call
    pub fn compute_odds(&self, event_id: &str) -> Result<OddsSnapshot, EngineError> {
        let event = self.ledger.require_event(event_id)?;
        self.snapshot(&event)
    }

    pub(crate) fn snapshot(&self, event: &Event) -> Result<OddsSnapshot, EngineError> {
        let mut pools = Vec::new();
        for (selector, label) in event.selectors() {
            let pool = self.ledger.pool_total(&event.id, &selector)?;
            pools.push((selector, label, pool));
        }
        Ok(snapshot_from_pools(event, pools, self.odds_policy()))
    }

    /// Informational: odds keep moving as stakes arrive
    pub fn potential_payout(&self, event_id: &str, user_id: &str) -> Result<PotentialPayout, EngineError> {
        let event = self.ledger.require_event(event_id)?;
        let snapshot = self.snapshot(&event)?;
        let stakes = self.ledger.stakes_by_user(event_id, user_id)?;
        Ok(project_payout(&snapshot, user_id, &stakes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventStatus, OutcomeDef, Settlement};
    use rust_decimal_macros::dec;

    fn policy() -> OddsPolicy {
        OddsPolicy { liquidity_floor: dec!(100), odds_ceiling: dec!(100) }
    }

    fn event(kind: EventKind, outcomes: &[&str]) -> Event {
        Event {
            id: "evt".to_string(),
            market_id: "m".to_string(),
            title: "t".to_string(),
            kind,
            outcomes: outcomes
                .iter()
                .map(|id| OutcomeDef { id: id.to_string(), label: id.to_uppercase() })
                .collect(),
            status: EventStatus::Open,
            creator: "alice".to_string(),
            resolver: None,
            host: None,
            winner: None,
            settlement: Settlement::Unsettled,
            volume: Decimal::ZERO,
            traders_count: 0,
            settlement_runs: 0,
            created_at: Utc::now(),
            closed_at: None,
            resolved_at: None,
        }
    }

    fn binary(yes: Decimal, no: Decimal) -> OddsSnapshot {
        let e = event(EventKind::Binary, &[]);
        snapshot_from_pools(
            &e,
            vec![
                (Selector::yes(), "Yes".to_string(), yes),
                (Selector::no(), "No".to_string(), no),
            ],
            policy(),
        )
    }

    #[test]
    fn test_empty_binary_is_neutral() {
        let snap = binary(Decimal::ZERO, Decimal::ZERO);
        assert_eq!(snap.total_pool, Decimal::ZERO);
        for side in &snap.sides {
            assert_eq!(side.percent, 50);
            assert_eq!(side.odds, Decimal::ONE);
        }
        assert!(snap.low_liquidity);
        assert_eq!(snap.warning.as_deref(), Some(NO_BETS_WARNING));
    }

    #[test]
    fn test_hundred_vs_fifty() {
        let snap = binary(dec!(100), dec!(50));
        assert_eq!(snap.total_pool, dec!(150));

        let yes = snap.side(&Selector::yes()).unwrap();
        let no = snap.side(&Selector::no()).unwrap();
        assert_eq!(yes.percent, 67);
        assert_eq!(no.percent, 33);
        assert_eq!(yes.odds, dec!(1.5));
        assert_eq!(no.odds, dec!(3.0));
        assert!(!snap.low_liquidity);
        assert!(snap.warning.is_none());
    }

    #[test]
    fn test_complement_keeps_sum_at_100() {
        // 50.5 / 49.5 would round to 51 + 50 independently
        let snap = binary(dec!(101), dec!(99));
        let total: u32 = snap.sides.iter().map(|s| s.percent).sum();
        assert_eq!(total, 100);
        assert_eq!(snap.sides[0].percent, 51);
        assert_eq!(snap.sides[1].percent, 49);
    }

    #[test]
    fn test_empty_side_uses_ceiling_not_virtual_pool() {
        let snap = binary(dec!(500), Decimal::ZERO);
        assert_eq!(snap.side(&Selector::yes()).unwrap().odds, Decimal::ONE);
        assert_eq!(snap.side(&Selector::no()).unwrap().odds, dec!(100));
        assert_eq!(snap.multiplier(&Selector::no()), None);
        assert!(snap.low_liquidity);
        assert!(snap.warning.unwrap().contains("No"));
    }

    #[test]
    fn test_small_pool_below_floor() {
        let snap = binary(dec!(30), dec!(20));
        assert!(snap.low_liquidity);
        assert!(snap.warning.unwrap().contains("below 100"));
    }

    #[test]
    fn test_multiple_outcomes_normalized() {
        let e = event(EventKind::Multiple, &["a", "b", "c"]);
        let snap = snapshot_from_pools(
            &e,
            vec![
                (Selector::outcome("a"), "A".to_string(), dec!(100)),
                (Selector::outcome("b"), "B".to_string(), dec!(100)),
                (Selector::outcome("c"), "C".to_string(), dec!(100)),
            ],
            policy(),
        );
        let percents: Vec<u32> = snap.sides.iter().map(|s| s.percent).collect();
        assert_eq!(percents, vec![33, 33, 34]);
        assert_eq!(snap.sides[0].odds, dec!(3));
    }

    #[test]
    fn test_neutral_multiple_split() {
        assert_eq!(split_percentages(&[Decimal::ZERO; 3], Decimal::ZERO), vec![33, 33, 34]);
        assert_eq!(split_percentages(&[Decimal::ZERO; 4], Decimal::ZERO), vec![25, 25, 25, 25]);
    }

    #[test]
    fn test_remainder_never_negative() {
        // 50.5% and 49.5% both round up, leaving -1 for the last outcome
        let pools = [dec!(101), dec!(99), Decimal::ZERO];
        let percents = split_percentages(&pools, dec!(200));
        assert_eq!(percents.iter().sum::<u32>(), 100);
        assert_eq!(percents, vec![51, 49, 0]);
    }

    #[test]
    fn test_huge_pools_do_not_overflow() {
        let huge = Decimal::from_i128_with_scale(10i128.pow(27), 0);
        assert_eq!(split_percentages(&[huge, Decimal::ZERO], huge), vec![100, 0]);
        assert_eq!(split_percentages(&[huge, huge], huge * Decimal::TWO), vec![50, 50]);

        let snap = binary(huge, Decimal::ZERO);
        assert_eq!(snap.side(&Selector::yes()).unwrap().percent, 100);
        assert_eq!(snap.side(&Selector::yes()).unwrap().odds, Decimal::ONE);
        assert_eq!(snap.side(&Selector::no()).unwrap().odds, dec!(100));
    }

    #[test]
    fn test_projection_uses_live_multiplier() {
        let snap = binary(dec!(100), dec!(50));
        let stakes = vec![
            Stake {
                id: 1,
                event_id: "evt".to_string(),
                user_id: "bob".to_string(),
                selector: Selector::no(),
                amount: dec!(50),
                created_at: Utc::now(),
            },
            Stake {
                id: 2,
                event_id: "evt".to_string(),
                user_id: "alice".to_string(),
                selector: Selector::yes(),
                amount: dec!(100),
                created_at: Utc::now(),
            },
        ];
        let payout = project_payout(&snap, "bob", &stakes);
        assert_eq!(payout.total_staked, dec!(50));
        let line = payout.line(&Selector::no()).unwrap();
        assert_eq!(line.multiplier, dec!(3));
        assert_eq!(line.potential, dec!(150));
        assert!(payout.line(&Selector::yes()).is_none());
    }
}
