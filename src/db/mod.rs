//! Persistence for everything needed to resume a trading session after restart:
//! - Session metadata (never the tokens)
//! - Budget, active positions and closed-trade history
//! - The configuration the session was started with
//!
//! One document per session id, written atomically once per cycle.

mod json_file;
mod sqlite;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{AssetClass, Budget, Instrument, Position, TradeRecord};
use crate::session::SessionMetadata;
use crate::trading::{CompoundingSettings, StrategyProfile, TradingConfig};

pub use json_file::JsonFileStore;
pub use sqlite::SqliteStateStore;

/// Current document layout.
pub const STATE_VERSION: u32 = 1;

/// Default state location.
pub const DEFAULT_STATE_URL: &str = "sqlite:autotrader.db?mode=rwc";

/// Run configuration stored alongside the state it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedConfig {
    pub strategy: StrategyProfile,
    pub interval_secs: u64,
    pub dry_run: bool,
    pub asset_classes: Vec<AssetClass>,
    #[serde(default)]
    pub watchlist: Vec<Instrument>,
    #[serde(default)]
    pub compounding: CompoundingSettings,
    #[serde(default)]
    pub trading: TradingConfig,
}

impl PersistedConfig {
    pub fn crypto_enabled(&self) -> bool {
        self.asset_classes.contains(&AssetClass::Crypto)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDocument {
    #[serde(default = "state_version")]
    pub version: u32,
    pub session_id: String,
    pub session: Option<SessionMetadata>,
    pub budget: Budget,
    pub positions: Vec<Position>,
    pub history: Vec<TradeRecord>,
    pub config: PersistedConfig,
    pub updated_at: DateTime<Utc>,
}

fn state_version() -> u32 {
    STATE_VERSION
}

impl StateDocument {
    pub fn new(session_id: impl Into<String>, budget: Budget, config: PersistedConfig) -> Self {
        Self {
            version: STATE_VERSION,
            session_id: session_id.into(),
            session: None,
            budget,
            positions: Vec::new(),
            history: Vec::new(),
            config,
            updated_at: Utc::now(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let document: StateDocument = serde_json::from_str(json)?;
        if document.version > STATE_VERSION {
            bail!(
                "state document version {} is newer than supported version {}",
                document.version,
                STATE_VERSION
            );
        }
        Ok(document)
    }
}

/// Storage backend for state documents.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// `None` when nothing has been saved under `session_id`.
    async fn load(&self, session_id: &str) -> Result<Option<StateDocument>>;

    /// Replace the stored document in a single atomic write.
    async fn save(&self, document: &StateDocument) -> Result<()>;

    /// Session ids with saved state, most recently updated first.
    async fn session_ids(&self) -> Result<Vec<String>>;

    fn describe(&self) -> String;
}

/// Open the store named by `location`: a `sqlite:` URL, or a directory for
/// JSON files.
pub async fn open_store(location: &str) -> Result<Box<dyn StateStore>> {
    if location.starts_with("sqlite:") {
        Ok(Box::new(SqliteStateStore::new(location).await?))
    } else {
        Ok(Box::new(JsonFileStore::new(location)))
    }
}
