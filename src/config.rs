// Runtime configuration, read from the environment (and `.env` if present)

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct Config {
    /// sled database directory
    pub data_dir: String,
    /// HTTP listen address
    pub bind_addr: String,
    /// Smallest stake accepted
    pub min_stake: Decimal,
    /// Pools below this total are flagged as low liquidity
    pub liquidity_floor: Decimal,
    /// Display ceiling for odds on an empty side
    pub odds_ceiling: Decimal,
    /// Balance granted when an account is opened over HTTP
    pub starting_balance: Decimal,
    /// Minimum characters in a dispute reason
    pub min_dispute_reason: usize,
    /// Claw back the previous run's payouts when a settled event is disputed
    pub reverse_payouts_on_dispute: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: "data/stakepool".to_string(),
            bind_addr: "0.0.0.0:1234".to_string(),
            min_stake: dec!(1),
            liquidity_floor: dec!(100),
            odds_ceiling: dec!(100),
            starting_balance: dec!(1000),
            min_dispute_reason: 10,
            reverse_payouts_on_dispute: true,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let defaults = Self::default();
        Self {
            data_dir: std::env::var("STAKEPOOL_DATA_DIR").unwrap_or(defaults.data_dir),
            bind_addr: std::env::var("STAKEPOOL_BIND").unwrap_or(defaults.bind_addr),
            min_stake: env_or("STAKEPOOL_MIN_STAKE", defaults.min_stake),
            liquidity_floor: env_or("STAKEPOOL_LIQUIDITY_FLOOR", defaults.liquidity_floor),
            odds_ceiling: env_or("STAKEPOOL_ODDS_CEILING", defaults.odds_ceiling),
            starting_balance: env_or("STAKEPOOL_STARTING_BALANCE", defaults.starting_balance),
            min_dispute_reason: env_or("STAKEPOOL_MIN_DISPUTE_REASON", defaults.min_dispute_reason),
            reverse_payouts_on_dispute: std::env::var("STAKEPOOL_REVERSE_ON_DISPUTE")
                .map(|v| parse_flag(&v))
                .unwrap_or(defaults.reverse_payouts_on_dispute),
        }
    }

    pub fn log_summary(&self) {
        tracing::info!(
            data_dir = %self.data_dir,
            min_stake = %self.min_stake,
            liquidity_floor = %self.liquidity_floor,
            odds_ceiling = %self.odds_ceiling,
            reverse_on_dispute = self.reverse_payouts_on_dispute,
            "⚙️  Configuration loaded"
        );
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!("⚠️  Ignoring unparsable {}={:?}", key, raw);
                default
            }
        },
        Err(_) => default,
    }
}

fn parse_flag(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.min_stake, dec!(1));
        assert_eq!(config.liquidity_floor, dec!(100));
        assert_eq!(config.odds_ceiling, dec!(100));
        assert!(config.reverse_payouts_on_dispute);
    }

    #[test]
    fn test_env_override_and_fallback() {
        std::env::set_var("STAKEPOOL_TEST_FLOOR", "250.5");
        assert_eq!(env_or("STAKEPOOL_TEST_FLOOR", dec!(100)), dec!(250.5));

        std::env::set_var("STAKEPOOL_TEST_FLOOR", "lots");
        assert_eq!(env_or("STAKEPOOL_TEST_FLOOR", dec!(100)), dec!(100));

        assert_eq!(env_or("STAKEPOOL_TEST_UNSET_KEY", 7usize), 7);
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("TRUE"));
        assert!(parse_flag(" 1 "));
        assert!(!parse_flag("false"));
        assert!(!parse_flag("0"));
    }
}
