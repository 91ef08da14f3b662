//! Pool configuration, read from a TOML file.
//!
//! ```toml
//! [pool]
//! address = "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa"
//!
//! [coin]
//! name = "bitcoin"
//! algorithm = "sha256d"
//!
//! [daemon]
//! url = "http://127.0.0.1:8332"
//! user = "rpcuser"
//! password = "rpcpassword"
//!
//! [[ports]]
//! port = 3333
//! diff = 8
//! ```

use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::algorithm::{self, PowAlgorithm};
use crate::auth::AuthorizationMode;
use crate::codec::{self, DecodeError};
use crate::job_manager::{JobManagerConfig, random_instance_id};
use crate::stratum::{BanningConfig, PortConfig, ServerConfig};
use crate::template::{GenerationConfig, RewardKind, RewardRecipient};
use crate::u256::U256;

pub const DEFAULT_CONFIG_PATH: &str = "pool.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid TOML")]
    Parse(#[from] toml::de::Error),

    #[error("invalid {field}")]
    Decode {
        field: String,
        #[source]
        source: DecodeError,
    },

    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub pool: PoolConfig,
    pub coin: CoinConfig,
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub banning: BanningConfig,
    #[serde(default)]
    pub reward_recipients: Vec<RecipientConfig>,
    pub ports: Vec<PortConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Payout address for the block reward.
    pub address: Option<String>,
    /// Hex public key; takes precedence over `address` and pays to the key
    /// directly.
    pub pubkey: Option<String>,
    /// Top bits of every extranonce1; random when unset. Give each
    /// instance behind the same node a different value.
    pub instance_id: Option<u32>,
    /// Template poll interval in milliseconds; 0 disables polling.
    pub block_refresh_interval: u64,
    /// Seconds without a new job before the current one is refreshed.
    pub job_rebroadcast_timeout: u64,
    /// Seconds a miner may go without submitting a share.
    pub connection_timeout: u64,
    pub signature: String,
    pub emit_invalid_block_hashes: bool,
    pub tcp_proxy_protocol: bool,
    pub bind_address: IpAddr,
    /// How `mining.authorize` is checked.
    pub authorization: AuthorizationMode,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            address: None,
            pubkey: None,
            instance_id: None,
            block_refresh_interval: 1000,
            job_rebroadcast_timeout: 55,
            connection_timeout: 600,
            signature: "/stratum-pool/".into(),
            emit_invalid_block_hashes: false,
            tcp_proxy_protocol: false,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            authorization: AuthorizationMode::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoinConfig {
    pub name: String,
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    /// Target at difficulty 1, as hex. Defaults to the algorithm's.
    #[serde(default)]
    pub diff1: Option<String>,
    #[serde(default)]
    pub multiplier: Option<f64>,
    #[serde(default)]
    pub reward: RewardKind,
    #[serde(default)]
    pub tx_messages: bool,
}

fn default_algorithm() -> String {
    "sha256d".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    pub url: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// `rules` sent with `getblocktemplate`.
    #[serde(default = "default_template_rules")]
    pub template_rules: Vec<String>,
}

fn default_template_rules() -> Vec<String> {
    vec!["segwit".into()]
}

/// A fixed cut of every block reward.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RecipientConfig {
    pub address: String,
    pub percent: f64,
}

impl Config {
    /// Read, parse, and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        text.parse()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pool_script()?;
        self.generation()?;
        self.algorithm()?;

        if self.ports.is_empty() {
            return invalid("at least one port must be configured");
        }
        let mut seen = HashSet::new();
        for port in &self.ports {
            if port.port != 0 && !seen.insert(port.port) {
                return invalid(format!("port {} configured twice", port.port));
            }
            if !(port.diff.is_finite() && port.diff > 0.0) {
                return invalid(format!("port {}: diff must be positive", port.port));
            }
            if let Some(vardiff) = &port.vardiff {
                if !(vardiff.min_diff > 0.0 && vardiff.min_diff <= vardiff.max_diff) {
                    return invalid(format!(
                        "port {}: vardiff needs 0 < min_diff <= max_diff",
                        port.port
                    ));
                }
                if !(vardiff.target_time > 0.0 && vardiff.retarget_time > 0.0) {
                    return invalid(format!(
                        "port {}: vardiff times must be positive",
                        port.port
                    ));
                }
                if !(0.0..100.0).contains(&vardiff.variance_percent) {
                    return invalid(format!(
                        "port {}: vardiff variance_percent must be in [0, 100)",
                        port.port
                    ));
                }
            }
        }

        let mut total = 0.0;
        for recipient in &self.reward_recipients {
            if !(recipient.percent > 0.0 && recipient.percent <= 100.0) {
                return invalid(format!(
                    "reward recipient {}: percent must be in (0, 100]",
                    recipient.address
                ));
            }
            total += recipient.percent;
        }
        if total >= 100.0 {
            return invalid("reward recipients take the whole block reward");
        }

        if self.banning.enabled {
            if self.banning.check_threshold == 0 {
                return invalid("banning check_threshold must be positive");
            }
            if !(0.0..=100.0).contains(&self.banning.invalid_percent) {
                return invalid("banning invalid_percent must be in [0, 100]");
            }
        }

        Ok(())
    }

    /// Output script the pool's share of the reward is paid to.
    pub fn pool_script(&self) -> Result<Vec<u8>, ConfigError> {
        match (&self.pool.pubkey, &self.pool.address) {
            (Some(pubkey), _) => codec::pubkey_to_script(pubkey).map_err(|source| {
                ConfigError::Decode {
                    field: "pool.pubkey".into(),
                    source,
                }
            }),
            (None, Some(address)) => codec::address_to_script(address).map_err(|source| {
                ConfigError::Decode {
                    field: "pool.address".into(),
                    source,
                }
            }),
            (None, None) => invalid("pool needs an address or a pubkey"),
        }
    }

    pub fn generation(&self) -> Result<GenerationConfig, ConfigError> {
        let recipients = self
            .reward_recipients
            .iter()
            .map(|r| {
                let script =
                    codec::address_to_script(&r.address).map_err(|source| ConfigError::Decode {
                        field: format!("reward recipient {}", r.address),
                        source,
                    })?;
                Ok(RewardRecipient {
                    script,
                    fraction: r.percent / 100.0,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        Ok(GenerationConfig {
            pool_script: self.pool_script()?,
            recipients,
            reward: self.coin.reward,
            tx_messages: self.coin.tx_messages,
            signature: self.pool.signature.clone(),
        })
    }

    pub fn algorithm(&self) -> Result<Arc<dyn PowAlgorithm>, ConfigError> {
        let diff1 = match &self.coin.diff1 {
            Some(hex) => Some(
                U256::from_str_radix(hex.trim_start_matches("0x"), 16)
                    .map_err(|e| ConfigError::Invalid(format!("coin.diff1: {}", e)))?,
            ),
            None => None,
        };
        if let Some(multiplier) = self.coin.multiplier {
            if !(multiplier.is_finite() && multiplier > 0.0) {
                return invalid("coin.multiplier must be positive");
            }
        }

        algorithm::from_name(&self.coin.algorithm, diff1, self.coin.multiplier).ok_or_else(|| {
            ConfigError::Invalid(format!("unknown algorithm {:?}", self.coin.algorithm))
        })
    }

    pub fn job_manager(&self) -> Result<JobManagerConfig, ConfigError> {
        Ok(JobManagerConfig {
            generation: self.generation()?,
            instance_id: self.pool.instance_id.unwrap_or_else(random_instance_id),
            emit_invalid_block_hashes: self.pool.emit_invalid_block_hashes,
        })
    }

    pub fn server(&self) -> ServerConfig {
        ServerConfig {
            bind_address: self.pool.bind_address,
            ports: self.ports.clone(),
            banning: self.banning.clone(),
            connection_timeout: Duration::from_secs(self.pool.connection_timeout),
            tcp_proxy_protocol: self.pool.tcp_proxy_protocol,
        }
    }

    /// `None` when polling is disabled.
    pub fn block_refresh_interval(&self) -> Option<Duration> {
        (self.pool.block_refresh_interval > 0)
            .then(|| Duration::from_millis(self.pool.block_refresh_interval))
    }

    pub fn job_rebroadcast_timeout(&self) -> Duration {
        Duration::from_secs(self.pool.job_rebroadcast_timeout)
    }
}

impl std::str::FromStr for Config {
    type Err = ConfigError;

    /// Parse and validate.
    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }
}

fn invalid<T>(message: impl Into<String>) -> Result<T, ConfigError> {
    Err(ConfigError::Invalid(message.into()))
}
