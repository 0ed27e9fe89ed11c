//! Application configuration.

use crate::error::{AppError, AppResult};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tickguard_feed::{FallbackConfig, SymbolMap};
use tickguard_position::{EngineConfig, ProtectionConfig, StaticConfigSource};
use tickguard_ws::ConnectionConfig;

/// Config path used when neither `--config` nor `TICKGUARD_CONFIG` is set.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Streaming market-data settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StreamConfig {
    /// WebSocket base URL; streams connect to `<base_url>/ws`.
    #[serde(default = "default_stream_base_url")]
    pub base_url: String,
    /// Symbols to watch, canonical (`BTC/USDT`) or bare base (`BTC`).
    #[serde(default)]
    pub symbols: Vec<String>,
    /// Quote asset appended to bare bases.
    #[serde(default = "default_quote")]
    pub default_quote: String,
    /// Open a partial-depth stream per symbol.
    #[serde(default = "default_true")]
    pub depth_enabled: bool,
    /// Levels per side kept in aggregated books.
    #[serde(default = "default_depth_limit")]
    pub depth_limit: usize,
    /// Partial-depth update cadence requested from the exchange.
    #[serde(default = "default_depth_cadence_ms")]
    pub depth_cadence_ms: u64,
    /// Capacity of the tick and book fan-out channels.
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
    /// Backoff, probe and idle settings shared by every stream.
    #[serde(flatten)]
    pub connection: ConnectionConfig,
}

fn default_stream_base_url() -> String {
    "wss://stream.binance.com:9443".to_string()
}

fn default_quote() -> String {
    "USDT".to_string()
}

fn default_true() -> bool {
    true
}

fn default_depth_limit() -> usize {
    20
}

fn default_depth_cadence_ms() -> u64 {
    100
}

fn default_broadcast_capacity() -> usize {
    1024
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_stream_base_url(),
            symbols: Vec::new(),
            default_quote: default_quote(),
            depth_enabled: default_true(),
            depth_limit: default_depth_limit(),
            depth_cadence_ms: default_depth_cadence_ms(),
            broadcast_capacity: default_broadcast_capacity(),
            connection: ConnectionConfig::default(),
        }
    }
}

impl StreamConfig {
    pub fn symbol_map(&self) -> SymbolMap {
        SymbolMap::new(self.default_quote.clone())
    }

    /// Configured symbols in canonical form, deduplicated in order.
    pub fn canonical_symbols(&self) -> Vec<String> {
        let map = self.symbol_map();
        let mut out: Vec<String> = Vec::with_capacity(self.symbols.len());
        for symbol in &self.symbols {
            let canonical = map.canonicalize(symbol);
            if !out.contains(&canonical) {
                out.push(canonical);
            }
        }
        out
    }

    /// Endpoint URL every stream connects to.
    pub fn ws_url(&self) -> String {
        format!("{}/ws", self.base_url.trim_end_matches('/'))
    }
}

/// Protection defaults plus overrides keyed by position id or symbol.
///
/// An override replaces the defaults wholesale for the positions it matches.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ProtectionSection {
    #[serde(flatten)]
    pub defaults: ProtectionConfig,
    #[serde(default)]
    pub overrides: HashMap<String, ProtectionConfig>,
}

impl ProtectionSection {
    pub fn config_source(&self) -> StaticConfigSource {
        StaticConfigSource::new(self.defaults.clone()).with_overrides(self.overrides.clone())
    }
}

/// Bundled store and journal locations.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PersistenceConfig {
    /// JSON array of open positions to seed the in-memory store with.
    #[serde(default)]
    pub positions_file: Option<PathBuf>,
    /// Directory for daily close-command journal files.
    #[serde(default = "default_journal_dir")]
    pub journal_dir: PathBuf,
}

fn default_journal_dir() -> PathBuf {
    PathBuf::from("data/journal")
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            positions_file: None,
            journal_dir: default_journal_dir(),
        }
    }
}

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub fallback: FallbackConfig,
    #[serde(default)]
    pub protection: ProtectionSection,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

impl AppConfig {
    /// Load and validate a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("Failed to read config {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate TOML text.
    pub fn from_toml(content: &str) -> AppResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no component could run with.
    pub fn validate(&self) -> AppResult<()> {
        if self.stream.symbols.is_empty() {
            return Err(AppError::Config(
                "stream.symbols must list at least one symbol".to_string(),
            ));
        }
        if self.stream.depth_limit == 0 {
            return Err(AppError::Config("stream.depth_limit must be > 0".to_string()));
        }
        if self.stream.broadcast_capacity == 0 {
            return Err(AppError::Config(
                "stream.broadcast_capacity must be > 0".to_string(),
            ));
        }
        self.stream
            .connection
            .validate()
            .map_err(|e| AppError::Config(format!("stream: {e}")))?;
        self.fallback
            .validate()
            .map_err(|e| AppError::Config(e.to_string()))?;
        self.engine
            .validate()
            .map_err(|e| AppError::Config(e.to_string()))?;
        self.protection
            .defaults
            .validate()
            .map_err(|e| AppError::Config(format!("protection: {e}")))?;
        for (key, config) in &self.protection.overrides {
            config
                .validate()
                .map_err(|e| AppError::Config(format!("protection.overrides.{key}: {e}")))?;
        }
        Ok(())
    }
}
