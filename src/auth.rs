// Caller identity and market membership
//
// Authentication itself happens upstream; by the time a request reaches
// this service the session layer has stamped the user id (and whether the
// caller is an operator) onto the request headers.

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    Json,
};
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};

use crate::error::EngineError;
use crate::models::validate_identifier;

pub const USER_HEADER: &str = "x-user-id";
pub const ADMIN_HEADER: &str = "x-admin";

/// The user on whose behalf an operation runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: String,
    /// Operator acting through admin tooling; audit-logged
    pub admin: bool,
}

impl Actor {
    pub fn user(user_id: &str) -> Self {
        Self { user_id: user_id.to_string(), admin: false }
    }

    pub fn admin(user_id: &str) -> Self {
        Self { user_id: user_id.to_string(), admin: true }
    }

    /// Balances and journals are private to their owner and to admins
    pub fn ensure_can_view(&self, user_id: &str) -> Result<(), EngineError> {
        if self.admin || self.user_id == user_id {
            Ok(())
        } else {
            Err(EngineError::unauthorized(format!(
                "{} cannot view the account of {}",
                self.user_id, user_id
            )))
        }
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<Value>);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                (
                    StatusCode::UNAUTHORIZED,
                    Json(json!({
                        "success": false,
                        "error": format!("missing {} header", USER_HEADER),
                        "code": "unauthenticated",
                    })),
                )
            })?;

        let admin = parts
            .headers
            .get(ADMIN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| matches!(v.trim(), "true" | "1"))
            .unwrap_or(false);

        Ok(Actor { user_id: user_id.to_string(), admin })
    }
}

/// Who may see and stake on a market's events, and who owns it
pub trait MarketDirectory: Send + Sync {
    fn is_member(&self, market_id: &str, user_id: &str) -> bool;
    fn owner(&self, market_id: &str) -> Option<String>;
}

#[derive(Debug, Clone)]
struct MarketMembers {
    owner: String,
    members: HashSet<String>,
}

/// In-process market registry
#[derive(Default)]
pub struct MembershipRegistry {
    markets: RwLock<HashMap<String, MarketMembers>>,
}

impl MembershipRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a market; the owner is its first member
    pub fn register_market(&self, market_id: &str, owner: &str) -> Result<(), EngineError> {
        validate_identifier("market id", market_id)?;
        let mut markets = self.markets.write();
        if markets.contains_key(market_id) {
            return Err(EngineError::validation(format!("market {} already exists", market_id)));
        }
        let mut members = HashSet::new();
        members.insert(owner.to_string());
        markets.insert(
            market_id.to_string(),
            MarketMembers { owner: owner.to_string(), members },
        );
        tracing::info!("📊 Market {} registered by {}", market_id, owner);
        Ok(())
    }

    pub fn add_member(&self, actor: &Actor, market_id: &str, user_id: &str) -> Result<(), EngineError> {
        validate_identifier("user id", user_id)?;
        let mut markets = self.markets.write();
        let market = markets
            .get_mut(market_id)
            .ok_or_else(|| EngineError::not_found("market", market_id))?;
        if market.owner != actor.user_id && !actor.admin {
            return Err(EngineError::unauthorized("only the market owner can add members"));
        }
        market.members.insert(user_id.to_string());
        Ok(())
    }
}

impl MarketDirectory for MembershipRegistry {
    fn is_member(&self, market_id: &str, user_id: &str) -> bool {
        self.markets
            .read()
            .get(market_id)
            .map(|m| m.members.contains(user_id))
            .unwrap_or(false)
    }

    fn owner(&self, market_id: &str) -> Option<String> {
        self.markets.read().get(market_id).map(|m| m.owner.clone())
    }
}
