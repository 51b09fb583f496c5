//! Configuration loading.
//!
//! Per chain: `rpcUrl` (push transport), `httpRpcUrl` (pull transport),
//! `chainId`, `nativeCurrency`, `requiredConfirmations`, withdrawal limits
//! and fee, the batch-processor contract address, and a map of ERC-20
//! tokens. Secrets (the encryption key, the hot wallet key and address) are
//! loaded separately and redacted from `Debug`.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::Path;

use eyre::{eyre, Result, WrapErr};
use serde::Deserialize;

#[derive(Clone, Deserialize)]
pub struct TokenConfig {
    pub address: String,
    pub decimals: u8,
    pub min_withdrawal: String,
    pub max_withdrawal: String,
    pub withdrawal_fee: String,
    #[serde(default)]
    pub min_deposit: String,
}

#[derive(Clone, Deserialize)]
pub struct ChainConfig {
    pub name: String,
    /// Push transport (WS/IPC) for live block and log subscriptions.
    pub rpc_url: String,
    /// Pull transport (HTTP) for request/response RPC, including all
    /// signed submissions.
    pub http_rpc_url: String,
    pub chain_id: u64,
    pub native_currency: String,
    pub native_decimals: u8,
    pub required_confirmations: u64,
    pub min_deposit: String,
    pub min_withdrawal: String,
    pub max_withdrawal: String,
    pub withdrawal_fee: String,
    pub withdrawal_processor_contract_address: String,
    #[serde(default)]
    pub tokens: HashMap<String, TokenConfig>,
    #[serde(default = "default_window_ms")]
    pub window_ms: i64,
    #[serde(default = "default_gas_limit")]
    pub native_gas_limit: u64,
    #[serde(default = "default_gas_limit_erc20")]
    pub erc20_gas_limit: u64,
}

fn default_window_ms() -> i64 {
    60_000
}

fn default_gas_limit() -> u64 {
    21_000
}

fn default_gas_limit_erc20() -> u64 {
    65_000
}

/// Secret material: redacted from `Debug` so logs never leak it.
#[derive(Clone, Deserialize)]
pub struct Secrets {
    /// 32-byte AES-256 key, hex-encoded.
    pub encryption_key_hex: String,
    pub hot_wallet_private_key_hex: String,
    pub hot_wallet_address: String,
    /// High-entropy seed used to derive each user's deposit-address key.
    pub signing_master_seed_hex: String,
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secrets")
            .field("encryption_key_hex", &"<redacted>")
            .field("hot_wallet_private_key_hex", &"<redacted>")
            .field("hot_wallet_address", &self.hot_wallet_address)
            .field("signing_master_seed_hex", &"<redacted>")
            .finish()
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_lookback_blocks")]
    pub lookback_blocks: u64,
    #[serde(default = "default_recovery_interval_secs")]
    pub recovery_interval_secs: u64,
    #[serde(default = "default_cache_cleanup_interval_secs")]
    pub cache_cleanup_interval_secs: u64,
}

fn default_lookback_blocks() -> u64 {
    256
}

fn default_recovery_interval_secs() -> u64 {
    300
}

fn default_cache_cleanup_interval_secs() -> u64 {
    60
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            lookback_blocks: default_lookback_blocks(),
            recovery_interval_secs: default_recovery_interval_secs(),
            cache_cleanup_interval_secs: default_cache_cleanup_interval_secs(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_store_path")]
    pub store_path: String,
    #[serde(default = "default_health_addr")]
    pub health_addr: String,
}

fn default_max_retries() -> u32 {
    5
}

fn default_store_path() -> String {
    "./data/engine-store".to_string()
}

fn default_health_addr() -> String {
    "0.0.0.0:9090".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            store_path: default_store_path(),
            health_addr: default_health_addr(),
        }
    }
}

#[derive(Clone)]
pub struct Config {
    pub chains: HashMap<String, ChainConfig>,
    pub secrets: Secrets,
    pub recovery: RecoveryConfig,
    pub engine: EngineConfig,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("chains", &self.chains.keys().collect::<Vec<_>>())
            .field("secrets", &self.secrets)
            .field("recovery", &self.recovery)
            .field("engine", &self.engine)
            .finish()
    }
}

impl Config {
    /// Load configuration from environment variables, optionally from a
    /// `.env` file if present. A deployment configures one or more chains by
    /// setting `CHAINS=mind,base` and then `CHAIN_<NAME>_*` variables per
    /// chain.
    pub fn load() -> Result<Self> {
        if Path::new(".env").exists() {
            dotenvy::from_filename(".env").wrap_err("failed to load .env")?;
        }
        Self::load_from_env()
    }

    fn load_from_env() -> Result<Self> {
        let chain_names = env::var("CHAINS")
            .wrap_err("CHAINS environment variable is required (comma-separated chain names)")?;

        let mut chains = HashMap::new();
        for name in chain_names.split(',').map(|s| s.trim()).filter(|s| !s.is_empty()) {
            chains.insert(name.to_string(), load_chain_config(name)?);
        }
        if chains.is_empty() {
            return Err(eyre!("at least one chain must be configured"));
        }

        let secrets = Secrets {
            encryption_key_hex: env::var("ENCRYPTION_KEY_HEX")
                .wrap_err("ENCRYPTION_KEY_HEX is required")?,
            hot_wallet_private_key_hex: env::var("HOT_WALLET_PRIVATE_KEY_HEX")
                .wrap_err("HOT_WALLET_PRIVATE_KEY_HEX is required")?,
            hot_wallet_address: env::var("HOT_WALLET_ADDRESS")
                .wrap_err("HOT_WALLET_ADDRESS is required")?,
            signing_master_seed_hex: env::var("SIGNING_MASTER_SEED_HEX")
                .wrap_err("SIGNING_MASTER_SEED_HEX is required")?,
        };

        let recovery = RecoveryConfig {
            lookback_blocks: env::var("RECOVERY_LOOKBACK_BLOCKS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_lookback_blocks),
            recovery_interval_secs: env::var("RECOVERY_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_recovery_interval_secs),
            cache_cleanup_interval_secs: env::var("CACHE_CLEANUP_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_cache_cleanup_interval_secs),
        };

        let engine = EngineConfig {
            max_retries: env::var("MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_max_retries),
            store_path: env::var("STORE_PATH").unwrap_or_else(|_| default_store_path()),
            health_addr: env::var("HEALTH_ADDR").unwrap_or_else(|_| default_health_addr()),
        };

        let config = Config {
            chains,
            secrets,
            recovery,
            engine,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.secrets.encryption_key_hex.trim_start_matches("0x").len() != 64 {
            return Err(eyre!("ENCRYPTION_KEY_HEX must encode 32 bytes"));
        }
        if !self.secrets.hot_wallet_address.starts_with("0x")
            || self.secrets.hot_wallet_address.len() != 42
        {
            return Err(eyre!("HOT_WALLET_ADDRESS must be a 20-byte hex address"));
        }
        for (name, chain) in &self.chains {
            if chain.rpc_url.is_empty() && chain.http_rpc_url.is_empty() {
                return Err(eyre!("chain {name}: at least one RPC URL is required"));
            }
            if chain.withdrawal_processor_contract_address.len() != 42 {
                return Err(eyre!(
                    "chain {name}: withdrawal_processor_contract_address must be a hex address"
                ));
            }
        }
        Ok(())
    }
}

fn load_chain_config(name: &str) -> Result<ChainConfig> {
    let upper = name.to_uppercase();
    let var = |suffix: &str| -> Result<String> {
        let key = format!("CHAIN_{upper}_{suffix}");
        env::var(&key).wrap_err_with(|| format!("{key} is required"))
    };
    let var_opt = |suffix: &str, default: &str| -> String {
        env::var(format!("CHAIN_{upper}_{suffix}")).unwrap_or_else(|_| default.to_string())
    };

    let mut tokens = HashMap::new();
    if let Ok(symbols) = env::var(format!("CHAIN_{upper}_TOKENS")) {
        for symbol in symbols.split(',').map(|s| s.trim()).filter(|s| !s.is_empty()) {
            let token_upper = symbol.to_uppercase();
            let tvar = |suffix: &str| -> Result<String> {
                let key = format!("CHAIN_{upper}_TOKEN_{token_upper}_{suffix}");
                env::var(&key).wrap_err_with(|| format!("{key} is required"))
            };
            tokens.insert(
                symbol.to_string(),
                TokenConfig {
                    address: tvar("ADDRESS")?,
                    decimals: tvar("DECIMALS")?
                        .parse()
                        .wrap_err("token decimals must be a number")?,
                    min_withdrawal: tvar("MIN_WITHDRAWAL")?,
                    max_withdrawal: tvar("MAX_WITHDRAWAL")?,
                    withdrawal_fee: tvar("WITHDRAWAL_FEE")?,
                    min_deposit: env::var(format!(
                        "CHAIN_{upper}_TOKEN_{token_upper}_MIN_DEPOSIT"
                    ))
                    .unwrap_or_else(|_| "0.00".to_string()),
                },
            );
        }
    }

    Ok(ChainConfig {
        name: name.to_string(),
        rpc_url: var_opt("RPC_URL", ""),
        http_rpc_url: var_opt("HTTP_RPC_URL", ""),
        chain_id: var("CHAIN_ID")?.parse().wrap_err("chain_id must be u64")?,
        native_currency: var("NATIVE_CURRENCY")?,
        native_decimals: var_opt("NATIVE_DECIMALS", "18")
            .parse()
            .wrap_err("native_decimals must be a number")?,
        required_confirmations: var("REQUIRED_CONFIRMATIONS")?
            .parse()
            .wrap_err("required_confirmations must be a number")?,
        min_deposit: var("MIN_DEPOSIT")?,
        min_withdrawal: var("MIN_WITHDRAWAL")?,
        max_withdrawal: var("MAX_WITHDRAWAL")?,
        withdrawal_fee: var("WITHDRAWAL_FEE")?,
        withdrawal_processor_contract_address: var("PROCESSOR_ADDRESS")?,
        tokens,
        window_ms: var_opt("WINDOW_MS", "60000")
            .parse()
            .wrap_err("window_ms must be a number")?,
        native_gas_limit: var_opt("NATIVE_GAS_LIMIT", "21000")
            .parse()
            .wrap_err("native_gas_limit must be a number")?,
        erc20_gas_limit: var_opt("ERC20_GAS_LIMIT", "65000")
            .parse()
            .wrap_err("erc20_gas_limit must be a number")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_window_is_sixty_seconds() {
        assert_eq!(default_window_ms(), 60_000);
    }

    #[test]
    fn validate_rejects_short_encryption_key() {
        let mut chains = HashMap::new();
        chains.insert(
            "mind".to_string(),
            ChainConfig {
                name: "mind".to_string(),
                rpc_url: "wss://mind".to_string(),
                http_rpc_url: "https://mind".to_string(),
                chain_id: 1,
                native_currency: "MIND".to_string(),
                native_decimals: 18,
                required_confirmations: 10,
                min_deposit: "0.001".to_string(),
                min_withdrawal: "1".to_string(),
                max_withdrawal: "1000".to_string(),
                withdrawal_fee: "1".to_string(),
                withdrawal_processor_contract_address:
                    "0x0000000000000000000000000000000000000001".to_string(),
                tokens: HashMap::new(),
                window_ms: 60_000,
                native_gas_limit: 21_000,
                erc20_gas_limit: 65_000,
            },
        );
        let config = Config {
            chains,
            secrets: Secrets {
                encryption_key_hex: "deadbeef".to_string(),
                hot_wallet_private_key_hex: "00".repeat(32),
                hot_wallet_address: "0x0000000000000000000000000000000000000001".to_string(),
                signing_master_seed_hex: "00".repeat(32),
            },
            recovery: RecoveryConfig::default(),
            engine: EngineConfig::default(),
        };
        assert!(config.validate().is_err());
    }
}
