//! Configuration management for the hedge keeper.
//!
//! Two layers:
//! - [`Config`]: process configuration loaded once from `.env`, an optional
//!   `keeper` config file and `KEEPER__*` environment variables.
//! - [`TunableParams`]: decision parameters operators change at runtime. They
//!   are stored per project and cached with a TTL (see `keeper::tunables`);
//!   `Config::tunables` only provides the defaults.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub keeper: KeeperConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// Paper venues driven by the bundled simulator
    #[serde(default = "default_venues")]
    pub venues: Vec<PaperVenueConfig>,
    /// Defaults for the runtime tunables
    #[serde(default)]
    pub tunables: TunableParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeeperConfig {
    /// Project id used to look up tunables
    #[serde(default = "default_project")]
    pub project: String,
    /// Cache key namespace
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Main reconciliation cycle interval
    #[serde(default = "default_cycle_interval")]
    pub cycle_interval_secs: u64,
    /// Exposure report interval
    #[serde(default = "default_report_interval")]
    pub report_interval_secs: u64,
    /// Leverage every position is synced back to
    #[serde(default = "default_target_leverage")]
    pub target_leverage: u32,
    /// USD size of one decrease/settlement order
    #[serde(default = "default_order_usd")]
    pub order_usd: Decimal,
    /// USD floor of a percent-triggered decrease order
    #[serde(default = "default_percent_usd_cap")]
    pub percent_usd_cap: Decimal,
    /// Holding window after which settlement only requires the minimum spread
    #[serde(default = "default_max_holding_hours")]
    pub max_holding_hours: u32,
    /// Cached order books older than this are ignored
    #[serde(default = "default_orderbook_max_age")]
    pub orderbook_max_age_secs: u64,
    /// TTL of the cached tunables
    #[serde(default = "default_tunables_ttl")]
    pub tunables_ttl_secs: u64,
    /// Window before the next funding settlement in which the settlement
    /// threshold snaps to its extremes
    #[serde(default = "default_funding_override_minutes")]
    pub funding_override_minutes: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Delay between order status polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Status polls per order before giving up
    #[serde(default = "default_poll_retries")]
    pub poll_retries: u32,
    /// Jittered wait after submission, lower bound
    #[serde(default = "default_jitter_min")]
    pub jitter_min_ms: u64,
    /// Jittered wait after submission, upper bound
    #[serde(default = "default_jitter_max")]
    pub jitter_max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Named channel every alert is sent to
    #[serde(default = "default_channel")]
    pub channel: String,
    /// Webhook endpoint; alerts only go to the log when unset
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_notify_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// SQLite database holding project tunables and the order journal
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperVenueConfig {
    pub name: String,
    #[serde(default = "default_paper_equity")]
    pub equity: Decimal,
    #[serde(default = "default_symbol_suffix")]
    pub symbol_suffix: String,
    #[serde(default = "default_funding_interval")]
    pub funding_interval_hours: u32,
}

/// Venue-specific leverage band driving the decrease signal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarginBand {
    /// Leverage (notional / equity) at which positions are reduced when the
    /// spread allows it
    pub decrease: Decimal,
    /// Leverage at which positions are reduced by a fixed fraction
    pub decrease_percent: Decimal,
}

impl Default for MarginBand {
    fn default() -> Self {
        Self {
            decrease: dec!(3),
            decrease_percent: dec!(4),
        }
    }
}

/// Runtime decision parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunableParams {
    /// Skip every cycle while set
    pub paused: bool,
    /// Per-venue leverage bands, keyed by exchange name
    pub margin_ratios: BTreeMap<String, MarginBand>,
    /// Band for venues missing from `margin_ratios`
    pub default_margin: MarginBand,
    /// Capital committed by investors, in USD
    pub investor_capital: Decimal,
    /// Minimum spread (bps) the opening engine requires
    pub min_open_delta_bps: Decimal,
    pub max_open_per_cycle: u32,
    /// Reductions per decrease pass
    pub max_close_per_cycle: u32,
    pub max_token_types: u32,
    pub max_usd_per_token: Decimal,
    /// Tokens that are never held for profit
    pub deny_tokens: Vec<String>,
    /// Notional cap of one rebalance order, in USD
    pub max_rebalance_usd: Decimal,
    /// Keep shrinking the book whenever the spread allows
    pub reduce_only: bool,
    pub min_settle_delta_bps: Decimal,
    pub max_settle_delta_bps: Decimal,
    /// Spread a spread-gated decrease must clear, in bps
    pub min_decrease_delta_bps: Decimal,
    /// Taker pairs a settlement pass may open
    pub max_settle_pairs: u32,
    /// Fraction reduced by a percent-triggered decrease
    pub decrease_percent: Decimal,
}

impl Default for TunableParams {
    fn default() -> Self {
        Self {
            paused: false,
            margin_ratios: BTreeMap::new(),
            default_margin: MarginBand::default(),
            investor_capital: dec!(100000),
            min_open_delta_bps: dec!(10),
            max_open_per_cycle: 3,
            max_close_per_cycle: 3,
            max_token_types: 20,
            max_usd_per_token: dec!(50000),
            deny_tokens: Vec::new(),
            max_rebalance_usd: dec!(2000),
            reduce_only: false,
            min_settle_delta_bps: dec!(5),
            max_settle_delta_bps: dec!(20),
            min_decrease_delta_bps: dec!(-5),
            max_settle_pairs: 3,
            decrease_percent: dec!(0.2),
        }
    }
}

impl TunableParams {
    /// Leverage band for a venue.
    pub fn margin_band(&self, venue: &str) -> MarginBand {
        self.margin_ratios
            .get(venue)
            .copied()
            .unwrap_or(self.default_margin)
    }

    pub fn is_denied(&self, token: &str) -> bool {
        self.deny_tokens.iter().any(|t| t.eq_ignore_ascii_case(token))
    }

    /// Validate ranges.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.min_settle_delta_bps <= self.max_settle_delta_bps,
            "min_settle_delta_bps must not exceed max_settle_delta_bps"
        );
        anyhow::ensure!(
            self.decrease_percent > Decimal::ZERO && self.decrease_percent <= dec!(0.2),
            "decrease_percent must be in (0, 0.2]"
        );
        anyhow::ensure!(
            self.max_rebalance_usd > Decimal::ZERO,
            "max_rebalance_usd must be positive"
        );
        for (venue, band) in &self.margin_ratios {
            anyhow::ensure!(
                band.decrease <= band.decrease_percent,
                "margin band for {} must have decrease <= decrease_percent",
                venue
            );
        }
        Ok(())
    }
}

fn default_project() -> String {
    "default".to_string()
}

fn default_namespace() -> String {
    "FUNDING".to_string()
}

fn default_cycle_interval() -> u64 {
    30
}

fn default_report_interval() -> u64 {
    3600
}

fn default_target_leverage() -> u32 {
    5
}

fn default_order_usd() -> Decimal {
    dec!(200)
}

fn default_percent_usd_cap() -> Decimal {
    dec!(500)
}

fn default_max_holding_hours() -> u32 {
    72 // three days decays the settlement bar to its minimum
}

fn default_orderbook_max_age() -> u64 {
    5
}

fn default_tunables_ttl() -> u64 {
    4 * 3600
}

fn default_funding_override_minutes() -> u32 {
    5
}

fn default_poll_interval() -> u64 {
    500
}

fn default_poll_retries() -> u32 {
    10
}

fn default_jitter_min() -> u64 {
    200
}

fn default_jitter_max() -> u64 {
    800
}

fn default_channel() -> String {
    "funding-keeper".to_string()
}

fn default_notify_timeout() -> u64 {
    10
}

fn default_db_path() -> String {
    "data/keeper.db".to_string()
}

fn default_paper_equity() -> Decimal {
    dec!(10000)
}

fn default_symbol_suffix() -> String {
    "USDT".to_string()
}

fn default_funding_interval() -> u32 {
    8
}

fn default_venues() -> Vec<PaperVenueConfig> {
    vec![
        PaperVenueConfig {
            name: "BINANCE".to_string(),
            equity: default_paper_equity(),
            symbol_suffix: default_symbol_suffix(),
            funding_interval_hours: 8,
        },
        PaperVenueConfig {
            name: "OKX".to_string(),
            equity: default_paper_equity(),
            symbol_suffix: "-USDT-SWAP".to_string(),
            funding_interval_hours: 8,
        },
    ]
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("keeper").required(false))
            .add_source(config::Environment::default().separator("__").prefix("KEEPER"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.keeper.cycle_interval_secs > 0 && self.keeper.report_interval_secs > 0,
            "cycle and report intervals must be positive"
        );
        anyhow::ensure!(
            self.keeper.target_leverage >= 1,
            "target_leverage must be >= 1"
        );
        anyhow::ensure!(
            self.keeper.order_usd > Decimal::ZERO,
            "order_usd must be positive"
        );
        anyhow::ensure!(
            self.keeper.max_holding_hours > 0,
            "max_holding_hours must be positive"
        );
        anyhow::ensure!(
            self.execution.jitter_min_ms <= self.execution.jitter_max_ms,
            "jitter_min_ms must not exceed jitter_max_ms"
        );
        anyhow::ensure!(
            self.execution.poll_retries >= 1,
            "poll_retries must be >= 1"
        );
        anyhow::ensure!(!self.venues.is_empty(), "at least one venue is required");

        self.tunables.validate()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            keeper: KeeperConfig::default(),
            execution: ExecutionConfig::default(),
            notify: NotifyConfig::default(),
            persistence: PersistenceConfig::default(),
            venues: default_venues(),
            tunables: TunableParams::default(),
        }
    }
}

impl Default for KeeperConfig {
    fn default() -> Self {
        Self {
            project: default_project(),
            namespace: default_namespace(),
            cycle_interval_secs: default_cycle_interval(),
            report_interval_secs: default_report_interval(),
            target_leverage: default_target_leverage(),
            order_usd: default_order_usd(),
            percent_usd_cap: default_percent_usd_cap(),
            max_holding_hours: default_max_holding_hours(),
            orderbook_max_age_secs: default_orderbook_max_age(),
            tunables_ttl_secs: default_tunables_ttl(),
            funding_override_minutes: default_funding_override_minutes(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            poll_retries: default_poll_retries(),
            jitter_min_ms: default_jitter_min(),
            jitter_max_ms: default_jitter_max(),
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            channel: default_channel(),
            webhook_url: None,
            timeout_secs: default_notify_timeout(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.venues.len(), 2);
    }

    #[test]
    fn test_invalid_settlement_band_rejected() {
        let mut config = Config::default();
        config.tunables.min_settle_delta_bps = dec!(30);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_decrease_percent_range() {
        let mut tunables = TunableParams::default();
        tunables.decrease_percent = dec!(0.25);
        assert!(tunables.validate().is_err());
        tunables.decrease_percent = dec!(0.2);
        assert!(tunables.validate().is_ok());
    }

    #[test]
    fn test_tunables_blob_fills_missing_fields() {
        let blob = r#"{"paused":true,"deny_tokens":["LUNA"],"margin_ratios":{"OKX":{"decrease":"2","decrease_percent":"2.5"}}}"#;
        let tunables: TunableParams = serde_json::from_str(blob).unwrap();
        assert!(tunables.paused);
        assert!(tunables.is_denied("luna"));
        assert_eq!(tunables.margin_band("OKX").decrease, dec!(2));
        assert_eq!(tunables.margin_band("BINANCE"), MarginBand::default());
        assert_eq!(tunables.max_settle_pairs, 3);
    }
}
