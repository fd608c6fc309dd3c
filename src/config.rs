//! Configuration management for the Fusion Relayer
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub relayer: RelayerConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub pair: PairConfig,
    pub auction: AuctionConfig,
    pub timelocks: TimelockConfig,
    pub resolvers: Vec<ResolverConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayerConfig {
    pub instance_id: String,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub call_timeout_ms: u64,
    pub escrow_attempts: u32,
    pub rate_limit_cooldown_secs: u64,
    pub refund_scan_interval_secs: u64,
    pub resolver_poll_interval_ms: u64,
    pub health_check_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub backend: StoreBackend,
    #[serde(default)]
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

/// The two coordinated ledgers. The state machine is parameterized by this
/// pair rather than duplicated per deployment.
#[derive(Debug, Clone, Deserialize)]
pub struct PairConfig {
    pub mode: GatewayMode,
    #[serde(default = "default_sim_balance")]
    pub sim_initial_balance: u64,
    pub source: LedgerConfig,
    pub destination: LedgerConfig,
}

fn default_sim_balance() -> u64 {
    1_000_000_000_000
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GatewayMode {
    /// In-process simulated ledgers; live connectors plug in out of tree.
    Simulation,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    pub name: String,
    pub poll_interval_ms: u64,
    pub confirmations: u64,
    pub min_timelock_secs: u64,
    pub max_timelock_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuctionConfig {
    pub duration_secs: u64,
    pub start_premium_bps: u32,
    pub floor_discount_bps: u32,
}

/// Cross-leg timelock discipline. The destination timelock is the source
/// timelock minus the safety margin, so the resolver can always refund
/// before the originator can.
#[derive(Debug, Clone, Deserialize)]
pub struct TimelockConfig {
    pub safety_margin_secs: u64,
    pub min_destination_window_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolverConfig {
    pub id: String,
    pub address: String,
    pub strategy: BidStrategy,
    pub risk: RiskTag,
}

/// How a resolver prices its bids off the live auction price.
/// Pricing behavior lives in the resolver module.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BidStrategy {
    /// Outbids the auction price by a premium to win early.
    Aggressive { premium_bps: u32 },
    /// Shaves the auction price, betting the decay reaches it.
    Conservative { discount_bps: u32 },
    /// Prices at the auction level minus an estimated gas recovery bump.
    GasAware { gas_units: u64, bump_bps: u32 },
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RiskTag {
    Low,
    Medium,
    High,
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("FUSION_RELAYER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        // Substitute environment variables
        let config_str = substitute_env_vars(&config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.auction.duration_secs == 0 {
            anyhow::bail!("Auction duration must be non-zero");
        }
        if self.auction.floor_discount_bps >= 10_000 {
            anyhow::bail!("Auction floor discount must be below 100%");
        }

        if self.database.backend == StoreBackend::Postgres && self.database.url.is_empty() {
            anyhow::bail!("Postgres store selected but no database URL configured");
        }

        for ledger in [&self.pair.source, &self.pair.destination] {
            if ledger.poll_interval_ms == 0 {
                anyhow::bail!("Ledger {} has a zero poll interval", ledger.name);
            }
            if ledger.min_timelock_secs >= ledger.max_timelock_secs {
                anyhow::bail!(
                    "Ledger {} timelock bounds are inverted: min {} >= max {}",
                    ledger.name,
                    ledger.min_timelock_secs,
                    ledger.max_timelock_secs
                );
            }
        }

        // Every accepted source timelock must leave room for the destination
        // leg after the safety margin is subtracted.
        let margin = self.timelocks.safety_margin_secs + self.timelocks.min_destination_window_secs;
        if margin >= self.pair.source.min_timelock_secs {
            anyhow::bail!(
                "Timelock safety margin {}s plus destination window {}s exceeds the \
                 minimum source timelock {}s; every order would be rejected",
                self.timelocks.safety_margin_secs,
                self.timelocks.min_destination_window_secs,
                self.pair.source.min_timelock_secs
            );
        }

        if self.resolvers.is_empty() {
            anyhow::bail!("At least one resolver must be configured");
        }
        let mut ids: Vec<&str> = self.resolvers.iter().map(|r| r.id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != self.resolvers.len() {
            anyhow::bail!("Resolver ids must be unique");
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_toml() -> String {
        r#"
[relayer]
instance_id = "relayer-test"
max_retries = 3
retry_delay_ms = 50
retry_max_delay_ms = 400
call_timeout_ms = 5000
escrow_attempts = 2
rate_limit_cooldown_secs = 30
refund_scan_interval_secs = 5
resolver_poll_interval_ms = 100
health_check_interval_secs = 30

[database]
backend = "memory"
max_connections = 5
min_connections = 1

[api]
host = "127.0.0.1"
port = 8080

[metrics]
enabled = false
port = 9090

[pair]
mode = "simulation"

[pair.source]
name = "evm-sim"
poll_interval_ms = 100
confirmations = 1
min_timelock_secs = 3600
max_timelock_secs = 172800

[pair.destination]
name = "algo-sim"
poll_interval_ms = 100
confirmations = 1
min_timelock_secs = 3600
max_timelock_secs = 86400

[auction]
duration_secs = 180
start_premium_bps = 500
floor_discount_bps = 500

[timelocks]
safety_margin_secs = 600
min_destination_window_secs = 300

[[resolvers]]
id = "res-1"
address = "resolver-one"
strategy = { type = "aggressive", premium_bps = 30 }
risk = "high"

[[resolvers]]
id = "res-2"
address = "resolver-two"
strategy = { type = "conservative", discount_bps = 20 }
risk = "low"
"#
        .to_string()
    }

    #[test]
    fn test_env_var_substitution() {
        env::set_var("TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(sample_toml().as_bytes()).unwrap();
        env::set_var("FUSION_RELAYER_CONFIG", file.path());

        let settings = Settings::load().unwrap();
        assert_eq!(settings.relayer.instance_id, "relayer-test");
        assert_eq!(settings.pair.source.name, "evm-sim");
        assert_eq!(settings.resolvers.len(), 2);
        assert_eq!(
            settings.resolvers[0].strategy,
            BidStrategy::Aggressive { premium_bps: 30 }
        );

        env::remove_var("FUSION_RELAYER_CONFIG");
    }

    #[test]
    fn test_validate_rejects_bad_margin() {
        let toml_str = sample_toml().replace("safety_margin_secs = 600", "safety_margin_secs = 3500");
        let settings: Settings = toml::from_str(&toml_str).unwrap();
        let err = settings.validate().unwrap_err().to_string();
        assert!(err.contains("safety margin"));
    }

    #[test]
    fn test_validate_rejects_duplicate_resolvers() {
        let toml_str = sample_toml().replace("id = \"res-2\"", "id = \"res-1\"");
        let settings: Settings = toml::from_str(&toml_str).unwrap();
        assert!(settings.validate().is_err());
    }
}
