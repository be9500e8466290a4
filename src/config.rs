// =============================================================================
// Runtime Configuration — engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the Kestrel sniper engine. Exit-strategy
// defaults, monitoring cadence, and retry limits all live here so they can be
// tuned without a rebuild.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_take_profit_pct() -> f64 {
    20.0
}

fn default_stop_loss_pct() -> f64 {
    10.0
}

fn default_trailing_offset_pct() -> f64 {
    5.0
}

fn default_take_profit_sell_fraction() -> f64 {
    0.5
}

fn default_time_based_sell_minutes() -> u64 {
    30
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_max_retry_attempts() -> u32 {
    5
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_buy_frequency_ms() -> u64 {
    100
}

fn default_max_snipe_attempts() -> u32 {
    50
}

fn default_default_quote_amount() -> f64 {
    100.0
}

fn default_min_order_quote() -> f64 {
    1.0
}

fn default_data_dir() -> String {
    "data".to_string()
}

// =============================================================================
// ExitDefaults
// =============================================================================

/// Default exit-strategy parameters applied when an acquisition fill does not
/// carry an explicit per-strategy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitDefaults {
    /// Take-profit target above entry, in percent.
    #[serde(default = "default_take_profit_pct")]
    pub take_profit_pct: f64,

    /// Stop-loss floor below entry, in percent.
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: f64,

    /// Distance maintained below the running peak once trailing is active,
    /// in percent.
    #[serde(default = "default_trailing_offset_pct")]
    pub trailing_offset_pct: f64,

    /// Percentage rise at which trailing tracking arms. `None` arms trailing
    /// at the take-profit level.
    #[serde(default)]
    pub trailing_activation_pct: Option<f64>,

    /// Fraction of the remaining quantity sold when take-profit fires
    /// (0 < fraction <= 1).
    #[serde(default = "default_take_profit_sell_fraction")]
    pub take_profit_sell_fraction: f64,

    /// Holding-time limit in minutes; 0 disables time-based selling.
    #[serde(default = "default_time_based_sell_minutes")]
    pub time_based_sell_minutes: u64,
}

impl Default for ExitDefaults {
    fn default() -> Self {
        Self {
            take_profit_pct: default_take_profit_pct(),
            stop_loss_pct: default_stop_loss_pct(),
            trailing_offset_pct: default_trailing_offset_pct(),
            trailing_activation_pct: None,
            take_profit_sell_fraction: default_take_profit_sell_fraction(),
            time_based_sell_minutes: default_time_based_sell_minutes(),
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Kestrel engine.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Exit strategy defaults ----------------------------------------------
    #[serde(default)]
    pub exit_defaults: ExitDefaults,

    // --- Monitoring ----------------------------------------------------------
    /// Price sampling cadence per strategy monitor, in milliseconds.
    /// Kept short to bound slippage exposure; a tunable, not a correctness
    /// property.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    // --- Liquidation retries -------------------------------------------------
    /// Maximum sell attempts before a strategy is marked FAILED.
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,

    /// Base delay between retries, in milliseconds. Backoff grows linearly
    /// with the attempt number.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    // --- Acquisition (sniping) ----------------------------------------------
    /// Delay between buy attempts while a listing is not yet tradable.
    #[serde(default = "default_buy_frequency_ms")]
    pub buy_frequency_ms: u64,

    /// Maximum buy attempts per snipe before giving up.
    #[serde(default = "default_max_snipe_attempts")]
    pub max_snipe_attempts: u32,

    /// Quote-asset amount spent per snipe when the caller does not specify.
    #[serde(default = "default_default_quote_amount")]
    pub default_quote_amount: f64,

    /// Minimum order size in quote asset accepted by the venue.
    #[serde(default = "default_min_order_quote")]
    pub min_order_quote: f64,

    // --- Persistence ---------------------------------------------------------
    /// Directory holding the position store and the completion journal.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            exit_defaults: ExitDefaults::default(),
            poll_interval_ms: default_poll_interval_ms(),
            max_retry_attempts: default_max_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            buy_frequency_ms: default_buy_frequency_ms(),
            max_snipe_attempts: default_max_snipe_attempts(),
            default_quote_amount: default_default_quote_amount(),
            min_order_quote: default_min_order_quote(),
            data_dir: default_data_dir(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            take_profit_pct = config.exit_defaults.take_profit_pct,
            stop_loss_pct = config.exit_defaults.stop_loss_pct,
            poll_interval_ms = config.poll_interval_ms,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}
