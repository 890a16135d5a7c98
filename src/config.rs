// =============================================================================
// Engine Configuration — loaded once at startup, saved atomically
// =============================================================================
//
// Every tunable named in the operations handbook lives here. All fields carry
// `#[serde(default)]` so an older config file never fails to load. Secrets
// (exchange keys, advisor key, bot token) are environment-only and never part
// of this struct.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::BotError;
use crate::types::RiskLevel;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbol() -> String {
    "BTCUSDT".to_string()
}

fn default_timezone() -> String {
    "Asia/Seoul".to_string()
}

fn default_min_confidence() -> f64 {
    70.0
}

fn default_min_trend_strength() -> f64 {
    60.0
}

fn default_max_daily_trades() -> u32 {
    3
}

fn default_cooldown_minutes() -> u32 {
    60
}

fn default_max_loss_pct() -> f64 {
    2.0
}

fn default_profit_targets() -> Vec<f64> {
    vec![2.0, 3.5, 5.0]
}

fn default_leverage_caps() -> RiskCaps<u32> {
    RiskCaps {
        high: 10,
        medium: 5,
        low: 3,
    }
}

fn default_position_caps() -> RiskCaps<f64> {
    RiskCaps {
        high: 30.0,
        medium: 20.0,
        low: 15.0,
    }
}

fn default_step_size() -> f64 {
    0.001
}

fn default_min_notional() -> f64 {
    1.0
}

fn default_rate_limit_per_channel() -> u32 {
    20
}

fn default_channel_queue_cap() -> usize {
    256
}

fn default_true() -> bool {
    true
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_advisor_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_advisor_model() -> String {
    "gpt-4o".to_string()
}

fn default_advisor_temperature() -> f64 {
    0.2
}

fn default_advisor_max_tokens() -> u32 {
    2048
}

// =============================================================================
// Sub-structures
// =============================================================================

/// One cap per advisor risk level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskCaps<T> {
    pub high: T,
    pub medium: T,
    pub low: T,
}

impl<T: Copy> RiskCaps<T> {
    pub fn for_level(&self, level: RiskLevel) -> T {
        match level {
            RiskLevel::High => self.high,
            RiskLevel::Medium => self.medium,
            RiskLevel::Low => self.low,
        }
    }
}

/// LLM advisor endpoint settings. The API key comes from the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvisorConfig {
    #[serde(default = "default_advisor_base_url")]
    pub base_url: String,
    #[serde(default = "default_advisor_model")]
    pub model: String,
    #[serde(default = "default_advisor_temperature")]
    pub temperature: f64,
    #[serde(default = "default_advisor_max_tokens")]
    pub max_tokens: u32,
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            base_url: default_advisor_base_url(),
            model: default_advisor_model(),
            temperature: default_advisor_temperature(),
            max_tokens: default_advisor_max_tokens(),
        }
    }
}

/// Chat channel wiring. Exactly one admin chat; zero or more notify-only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub admin_chat_id: i64,
    #[serde(default)]
    pub notify_chat_ids: Vec<i64>,
}

// =============================================================================
// AppConfig
// =============================================================================

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Instrument, uppercase concatenation (e.g. "BTCUSDT").
    #[serde(default = "default_symbol")]
    pub symbol: String,

    /// IANA timezone name the scheduler aligns to.
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// Whether the optional 15m pipeline is scheduled.
    #[serde(default)]
    pub enable_15m: bool,

    // --- Signal admission gates ----------------------------------------------
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,

    #[serde(default = "default_min_trend_strength")]
    pub min_trend_strength: f64,

    #[serde(default = "default_max_daily_trades")]
    pub max_daily_trades: u32,

    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: u32,

    /// Maximum stop distance as a percentage of entry price.
    #[serde(default = "default_max_loss_pct")]
    pub max_loss_pct: f64,

    /// Informational profit-target ladder in percent of entry.
    #[serde(default = "default_profit_targets")]
    pub profit_targets: Vec<f64>,

    #[serde(default = "default_leverage_caps")]
    pub leverage_caps_by_risk: RiskCaps<u32>,

    #[serde(default = "default_position_caps")]
    pub position_caps_by_risk: RiskCaps<f64>,

    // --- Instrument filters --------------------------------------------------
    /// Minimum base-quantity increment.
    #[serde(default = "default_step_size")]
    pub step_size: f64,

    /// Minimum order notional in quote units.
    #[serde(default = "default_min_notional")]
    pub min_notional: f64,

    // --- Notifier ------------------------------------------------------------
    /// Messages per minute allowed per chat channel.
    #[serde(default = "default_rate_limit_per_channel")]
    pub rate_limit_per_channel: u32,

    /// Bounded FIFO depth per channel before drop-oldest kicks in.
    #[serde(default = "default_channel_queue_cap")]
    pub channel_queue_cap: usize,

    #[serde(default)]
    pub telegram: TelegramConfig,

    // --- External services ---------------------------------------------------
    #[serde(default)]
    pub advisor: AdvisorConfig,

    /// Selects the exchange endpoint only; no other behaviour changes.
    #[serde(default = "default_true")]
    pub testnet: bool,

    /// Root for snapshots, trade history, and logs.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        // Round-trip through serde so the field defaults stay the single
        // source of truth.
        serde_json::from_str("{}").expect("empty config must deserialize")
    }
}

impl AppConfig {
    /// Load configuration from a JSON file, then apply environment overrides.
    ///
    /// A missing file is an error so the caller can decide to fall back to
    /// defaults with a warning; a present-but-invalid file is fatal
    /// ([`BotError::CorruptConfig`]).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let mut config: Self = serde_json::from_str(&content)
            .map_err(|e| BotError::CorruptConfig(format!("{}: {e}", path.display())))?;

        config.apply_env_overrides();
        config.validate()?;

        info!(
            path = %path.display(),
            symbol = %config.symbol,
            timezone = %config.timezone,
            testnet = config.testnet,
            "config loaded"
        );

        Ok(config)
    }

    /// Persist the configuration using an atomic write (tmp + rename) so a
    /// crash mid-write never leaves a torn file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "config saved (atomic)");
        Ok(())
    }

    /// Environment overrides for the handful of knobs operators flip without
    /// editing the file.
    fn apply_env_overrides(&mut self) {
        if let Ok(sym) = std::env::var("MERIDIAN_SYMBOL") {
            let sym = sym.trim().to_uppercase();
            if !sym.is_empty() {
                self.symbol = sym;
            }
        }
        if let Ok(v) = std::env::var("MERIDIAN_TESTNET") {
            if let Ok(b) = v.trim().parse::<bool>() {
                self.testnet = b;
            }
        }
        if let Ok(v) = std::env::var("MERIDIAN_TIMEZONE") {
            if !v.trim().is_empty() {
                self.timezone = v.trim().to_string();
            }
        }
    }

    /// Reject configs the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.tz()?;
        if self.symbol.is_empty() || self.symbol.contains(':') {
            anyhow::bail!(BotError::CorruptConfig(format!(
                "symbol must be plain uppercase concatenation, got {:?}",
                self.symbol
            )));
        }
        if self.step_size <= 0.0 {
            anyhow::bail!(BotError::CorruptConfig("step_size must be > 0".into()));
        }
        if self.min_notional < 0.0 {
            anyhow::bail!(BotError::CorruptConfig("min_notional must be >= 0".into()));
        }
        Ok(())
    }

    /// The scheduler timezone, parsed.
    pub fn tz(&self) -> Result<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| BotError::CorruptConfig(format!("unknown timezone {:?}", self.timezone)))
            .map_err(Into::into)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_handbook() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.symbol, "BTCUSDT");
        assert_eq!(cfg.timezone, "Asia/Seoul");
        assert!(!cfg.enable_15m);
        assert_eq!(cfg.min_confidence, 70.0);
        assert_eq!(cfg.min_trend_strength, 60.0);
        assert_eq!(cfg.max_daily_trades, 3);
        assert_eq!(cfg.cooldown_minutes, 60);
        assert_eq!(cfg.max_loss_pct, 2.0);
        assert_eq!(cfg.leverage_caps_by_risk.for_level(RiskLevel::High), 10);
        assert_eq!(cfg.leverage_caps_by_risk.for_level(RiskLevel::Medium), 5);
        assert_eq!(cfg.leverage_caps_by_risk.for_level(RiskLevel::Low), 3);
        assert_eq!(cfg.position_caps_by_risk.for_level(RiskLevel::High), 30.0);
        assert_eq!(cfg.position_caps_by_risk.for_level(RiskLevel::Medium), 20.0);
        assert_eq!(cfg.position_caps_by_risk.for_level(RiskLevel::Low), 15.0);
        assert_eq!(cfg.step_size, 0.001);
        assert_eq!(cfg.min_notional, 1.0);
        assert_eq!(cfg.rate_limit_per_channel, 20);
        assert_eq!(cfg.channel_queue_cap, 256);
        assert!(cfg.testnet);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let json = r#"{ "symbol": "ETHUSDT", "cooldown_minutes": 30 }"#;
        let cfg: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.symbol, "ETHUSDT");
        assert_eq!(cfg.cooldown_minutes, 30);
        assert_eq!(cfg.max_daily_trades, 3);
        assert_eq!(cfg.timezone, "Asia/Seoul");
    }

    #[test]
    fn timezone_parses() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.tz().unwrap(), chrono_tz::Asia::Seoul);

        let bad = AppConfig {
            timezone: "Mars/Olympus".into(),
            ..AppConfig::default()
        };
        assert!(bad.tz().is_err());
    }

    #[test]
    fn validate_rejects_colon_symbol() {
        let cfg = AppConfig {
            symbol: "BTC:USDT".into(),
            ..AppConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = AppConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: AppConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.symbol, cfg2.symbol);
        assert_eq!(cfg.cooldown_minutes, cfg2.cooldown_minutes);
        assert_eq!(cfg.step_size, cfg2.step_size);
    }
}
