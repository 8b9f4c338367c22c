//! Configuration module for the x402 facilitator server.
//!
//! ```json
//! {
//!   "port": 8403,
//!   "solana": { "network": "devnet", "signer": "$FACILITATOR_PRIVATE_KEY" },
//!   "settlement": { "platformFeeBps": 500, "store": { "type": "sqlite", "path": "settlements.db" } },
//!   "gasless": { "enabled": true, "maxSponsoredFeeLamports": 1000000 },
//!   "security": { "rateLimit": { "requestsPerMinute": 60 }, "adminToken": "$ADMIN_TOKEN" },
//!   "invoice": { "expirySeconds": 300 }
//! }
//! ```
//!
//! Every section is optional; missing values resolve through environment variables,
//! then hardcoded defaults.

use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use x402_chain_solana::chain::SolanaChainConfig;
use x402_chain_solana::gasless::GaslessConfig;
use x402_facilitator_local::SettlementConfig;
use x402_facilitator_local::guard::SecurityConfig;
use x402_facilitator_local::invoice::InvoiceConfig;

/// CLI arguments for the x402 facilitator server.
#[derive(Parser, Debug)]
#[command(name = "x402-facilitator")]
#[command(about = "x402 Facilitator HTTP server for Solana")]
struct CliArgs {
    /// Path to the JSON configuration file
    #[arg(long, short, env = "CONFIG", default_value = "config.json")]
    config: PathBuf,
}

/// Server configuration.
///
/// Fields use serde defaults that fall back to environment variables,
/// then to hardcoded defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "config_defaults::default_port")]
    port: u16,
    #[serde(default = "config_defaults::default_host")]
    host: IpAddr,
    #[serde(default)]
    solana: SolanaChainConfig,
    #[serde(default)]
    settlement: SettlementConfig,
    #[serde(default)]
    gasless: GaslessConfig,
    #[serde(default)]
    security: SecurityConfig,
    #[serde(default)]
    invoice: InvoiceConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: config_defaults::default_port(),
            host: config_defaults::default_host(),
            solana: SolanaChainConfig::default(),
            settlement: SettlementConfig::default(),
            gasless: GaslessConfig::default(),
            security: SecurityConfig::default(),
            invoice: InvoiceConfig::default(),
        }
    }
}

pub mod config_defaults {
    use std::env;
    use std::net::{IpAddr, Ipv4Addr};

    pub const DEFAULT_PORT: u16 = 8403;
    pub const DEFAULT_HOST: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

    /// Returns the default port value with fallback: $PORT env var -> 8403
    pub fn default_port() -> u16 {
        env::var("PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_PORT)
    }

    /// Returns the default host value with fallback: $HOST env var -> "0.0.0.0"
    pub fn default_host() -> IpAddr {
        env::var("HOST")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_HOST)
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {0}: {1}")]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file: {0}")]
    JsonParse(#[from] serde_json::Error),
}

impl Config {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn host(&self) -> IpAddr {
        self.host
    }

    pub fn solana(&self) -> &SolanaChainConfig {
        &self.solana
    }

    pub fn settlement(&self) -> &SettlementConfig {
        &self.settlement
    }

    pub fn gasless(&self) -> &GaslessConfig {
        &self.gasless
    }

    pub fn security(&self) -> &SecurityConfig {
        &self.security
    }

    pub fn invoice(&self) -> &InvoiceConfig {
        &self.invoice
    }

    /// Load configuration from CLI arguments and JSON file.
    ///
    /// The config file path is determined by:
    /// 1. `--config <path>` CLI argument
    /// 2. `$CONFIG`
    /// 3. `./config.json`
    ///
    /// A missing file yields the defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let cli_args = CliArgs::parse();
        Self::load_from_path(&cli_args.config)
    }

    fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "No config file, using defaults");
            return Ok(Config::default());
        }
        let content =
            fs::read_to_string(path).map_err(|e| ConfigError::FileRead(path.to_path_buf(), e))?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }
}
