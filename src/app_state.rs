// Application state management

use std::sync::Arc;

use crate::auth::MembershipRegistry;
use crate::config::Config;
use crate::error::EngineError;
use crate::ledger::Ledger;
use crate::market_resolve::PoolEngine;
use crate::notify::{Notifier, TracingNotifier};

pub type SharedState = Arc<AppState>;

/// The engine synchronizes itself (per-event and per-account locks), so
/// the state is shared without an outer mutex.
pub struct AppState {
    pub engine: PoolEngine,
    pub markets: Arc<MembershipRegistry>,
    pub config: Config,
}

impl AppState {
    /// Open the on-disk ledger at `config.data_dir`
    pub fn open(config: Config) -> Result<Self, EngineError> {
        tracing::info!("🚀 Initializing stake pool ledger...");
        let ledger = Ledger::open(&config.data_dir)?;
        let state = Self::with_ledger(ledger, config, Arc::new(TracingNotifier));
        tracing::info!("✅ Stake pool ledger initialized");
        Ok(state)
    }

    /// In-memory ledger, dropped with the state
    pub fn temporary(config: Config, notifier: Arc<dyn Notifier>) -> Result<Self, EngineError> {
        Ok(Self::with_ledger(Ledger::temporary()?, config, notifier))
    }

    fn with_ledger(ledger: Ledger, config: Config, notifier: Arc<dyn Notifier>) -> Self {
        let markets = Arc::new(MembershipRegistry::new());
        let engine = PoolEngine::new(ledger, config.clone(), markets.clone(), notifier);
        Self { engine, markets, config }
    }

    pub fn shared(self) -> SharedState {
        Arc::new(self)
    }

    pub fn flush(&self) -> Result<(), EngineError> {
        self.engine.ledger().flush()
    }
}
