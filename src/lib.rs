/// Stake Pool Ledger - parimutuel stake pools for groups of friends
/// Exports all modules for use as a library crate

pub mod app_state;
pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod ledger;
pub mod market_resolve;
pub mod models;
pub mod notify;
pub mod routes;

pub use app_state::{AppState, SharedState};
pub use auth::{Actor, MarketDirectory, MembershipRegistry};
pub use config::Config;
pub use error::EngineError;
pub use ledger::{Ledger, LockTable};
pub use market_resolve::{
    Authority, DisputeReceipt, OddsSnapshot, PoolEngine, PotentialPayout, Resolution, Reversal,
    SettlementOutcome, SettlementPlan, SettlementRun, StakeReceipt, VoteCount,
};
pub use models::*;
pub use notify::{MemoryNotifier, Notification, Notifier, TracingNotifier};
