// =============================================================================
// Strategy configuration — the Phase-1 parameter record
// =============================================================================
//
// The decision core closes over these values for the lifetime of a run; they
// are loaded once at startup and never hot-reloaded. Unknown fields are a
// hard error: configuration drift between backtest and live is a silent
// killer, so a misspelled key must fail loudly instead of falling back to a
// default.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_leverage() -> u32 {
    7
}

fn default_position_size_pct() -> f64 {
    1.0
}

fn default_pullback_tolerance() -> f64 {
    0.01
}

fn default_ma20_buffer() -> f64 {
    0.02
}

fn default_max_add_count() -> u32 {
    3
}

fn default_add_position_min_interval() -> u64 {
    3
}

fn default_stop_loss_confirm_bars() -> u32 {
    10
}

fn default_emergency_stop_atr() -> f64 {
    3.5
}

// =============================================================================
// StrategyParams
// =============================================================================

/// Tunable parameters of the BiGe 7x trend strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StrategyParams {
    /// Futures leverage applied per symbol (1..=125).
    #[serde(default = "default_leverage")]
    pub leverage: u32,

    /// Fraction of the per-symbol equity slot committed as margin per entry.
    #[serde(default = "default_position_size_pct")]
    pub position_size_pct: f64,

    /// Maximum relative distance of the wick to AVG20 that still counts as a
    /// pullback touch.
    #[serde(default = "default_pullback_tolerance")]
    pub pullback_tolerance: f64,

    /// Buffer below/above AVG20 used for the trailing stop anchor.
    #[serde(default = "default_ma20_buffer")]
    pub ma20_buffer: f64,

    /// Maximum number of scale-ins per position.
    #[serde(default = "default_max_add_count")]
    pub max_add_count: u32,

    /// Minimum bars between the entry (or last add) and the next add.
    #[serde(default = "default_add_position_min_interval")]
    pub add_position_min_interval: u64,

    /// Consecutive stop-touching bars required before the position closes.
    #[serde(default = "default_stop_loss_confirm_bars")]
    pub stop_loss_confirm_bars: u32,

    /// ATR multiple for the single-bar emergency stop; 0 disables it.
    #[serde(default = "default_emergency_stop_atr")]
    pub emergency_stop_atr: f64,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            leverage: default_leverage(),
            position_size_pct: default_position_size_pct(),
            pullback_tolerance: default_pullback_tolerance(),
            ma20_buffer: default_ma20_buffer(),
            max_add_count: default_max_add_count(),
            add_position_min_interval: default_add_position_min_interval(),
            stop_loss_confirm_bars: default_stop_loss_confirm_bars(),
            emergency_stop_atr: default_emergency_stop_atr(),
        }
    }
}

impl StrategyParams {
    /// Load parameters from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read strategy config from {}", path.display()))?;
        let params: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse strategy config from {}", path.display()))?;
        params.validate()?;
        info!(path = %path.display(), "strategy config loaded");
        Ok(params)
    }

    /// Reject values outside their documented domains.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            (1..=125).contains(&self.leverage),
            "leverage must be within 1..=125, got {}",
            self.leverage
        );
        anyhow::ensure!(
            self.position_size_pct > 0.0 && self.position_size_pct <= 1.0,
            "position_size_pct must be in (0, 1], got {}",
            self.position_size_pct
        );
        anyhow::ensure!(
            self.pullback_tolerance > 0.0,
            "pullback_tolerance must be positive, got {}",
            self.pullback_tolerance
        );
        anyhow::ensure!(
            self.ma20_buffer >= 0.0,
            "ma20_buffer must be non-negative, got {}",
            self.ma20_buffer
        );
        anyhow::ensure!(
            self.stop_loss_confirm_bars >= 1,
            "stop_loss_confirm_bars must be at least 1, got {}",
            self.stop_loss_confirm_bars
        );
        anyhow::ensure!(
            self.emergency_stop_atr >= 0.0,
            "emergency_stop_atr must be non-negative, got {}",
            self.emergency_stop_atr
        );
        Ok(())
    }
}

// =============================================================================
// Credentials
// =============================================================================

/// Venue API credentials, read from the environment only.
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl Credentials {
    /// Read `API_KEY` / `API_SECRET` from the environment. Missing values are
    /// fatal — the engine never starts half-authenticated.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("API_KEY").context("API_KEY is not set")?;
        let api_secret = std::env::var("API_SECRET").context("API_SECRET is not set")?;
        anyhow::ensure!(!api_key.is_empty(), "API_KEY is empty");
        anyhow::ensure!(!api_secret.is_empty(), "API_SECRET is empty");
        Ok(Self {
            api_key,
            api_secret,
        })
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_params_match_phase1_profile() {
        let p = StrategyParams::default();
        assert_eq!(p.leverage, 7);
        assert_eq!(p.position_size_pct, 1.0);
        assert_eq!(p.pullback_tolerance, 0.01);
        assert_eq!(p.ma20_buffer, 0.02);
        assert_eq!(p.max_add_count, 3);
        assert_eq!(p.add_position_min_interval, 3);
        assert_eq!(p.stop_loss_confirm_bars, 10);
        assert_eq!(p.emergency_stop_atr, 3.5);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn empty_json_uses_defaults() {
        let p: StrategyParams = serde_json::from_str("{}").unwrap();
        assert_eq!(p, StrategyParams::default());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let p: StrategyParams =
            serde_json::from_str(r#"{ "leverage": 3, "max_add_count": 1 }"#).unwrap();
        assert_eq!(p.leverage, 3);
        assert_eq!(p.max_add_count, 1);
        assert_eq!(p.stop_loss_confirm_bars, 10);
    }

    #[test]
    fn unknown_field_is_rejected() {
        let result: Result<StrategyParams, _> =
            serde_json::from_str(r#"{ "leverage": 7, "position_sizepct": 0.5 }"#);
        assert!(result.is_err(), "misspelled keys must fail loudly");
    }

    #[test]
    fn validate_rejects_out_of_range_leverage() {
        let mut p = StrategyParams::default();
        p.leverage = 0;
        assert!(p.validate().is_err());
        p.leverage = 126;
        assert!(p.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_position_size() {
        let mut p = StrategyParams::default();
        p.position_size_pct = 0.0;
        assert!(p.validate().is_err());
        p.position_size_pct = 1.5;
        assert!(p.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_confirm_bars() {
        let mut p = StrategyParams::default();
        p.stop_loss_confirm_bars = 0;
        assert!(p.validate().is_err());
    }

    #[test]
    fn zero_emergency_stop_is_valid_and_means_disabled() {
        let mut p = StrategyParams::default();
        p.emergency_stop_atr = 0.0;
        assert!(p.validate().is_ok());
    }
}
