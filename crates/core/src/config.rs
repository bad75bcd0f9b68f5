//! Configuration for the MoE communication layer.
//!
//! Configuration is resolved with the following priority:
//! 1. Explicit overrides, usually CLI arguments (highest priority)
//! 2. Config file (TOML)
//! 3. Default values (lowest priority)
//!
//! ```toml
//! [parallel]
//! expert_parallel_size = 4
//! data_parallel_size = 4
//! tensor_parallel_size = 1
//! activated_experts = 2
//!
//! [kernels]
//! use_cumsum_kernel = true
//!
//! [exchange]
//! hierarchical = true
//! local_group_size = 2
//! overlap = false
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Process-group sizes and the expert fan-out used by the gradient scalers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    /// Ranks the experts are sharded across.
    pub expert_parallel_size: usize,
    /// Data-parallel replicas seen by the dense layers.
    pub data_parallel_size: usize,
    /// Ranks sharing one token batch along the hidden dimension.
    pub tensor_parallel_size: usize,
    /// Experts each token is routed to (top-k).
    pub activated_experts: usize,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            expert_parallel_size: 1,
            data_parallel_size: 1,
            tensor_parallel_size: 1,
            activated_experts: 1,
        }
    }
}

/// Kernel provider options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Use the provider's cumulative-sum kernel when the row count allows it.
    pub use_cumsum_kernel: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            use_cumsum_kernel: true,
        }
    }
}

/// Token exchange topology.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// Route the all-to-all through one designated rank per local group.
    pub hierarchical: bool,
    /// Ranks per local group when `hierarchical` is set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_group_size: Option<usize>,
    /// Issue the dispatch all-to-all without blocking.
    pub overlap: bool,
}

/// Persistent configuration stored in TOML format.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MoeCommConfig {
    pub parallel: ParallelConfig,
    pub kernels: KernelConfig,
    pub exchange: ExchangeConfig,
}

/// Values that replace the loaded configuration when present.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub expert_parallel_size: Option<usize>,
    pub data_parallel_size: Option<usize>,
    pub tensor_parallel_size: Option<usize>,
    pub activated_experts: Option<usize>,
    pub use_cumsum_kernel: Option<bool>,
    pub hierarchical: Option<bool>,
    pub local_group_size: Option<usize>,
    pub overlap: Option<bool>,
}

impl MoeCommConfig {
    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Save configuration to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(fs::write(path, self.to_toml()?)?)
    }

    /// Render as pretty TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Merge overrides, preferring values from `other`.
    pub fn merge(&mut self, other: &ConfigOverrides) {
        if let Some(v) = other.expert_parallel_size {
            self.parallel.expert_parallel_size = v;
        }
        if let Some(v) = other.data_parallel_size {
            self.parallel.data_parallel_size = v;
        }
        if let Some(v) = other.tensor_parallel_size {
            self.parallel.tensor_parallel_size = v;
        }
        if let Some(v) = other.activated_experts {
            self.parallel.activated_experts = v;
        }
        if let Some(v) = other.use_cumsum_kernel {
            self.kernels.use_cumsum_kernel = v;
        }
        if let Some(v) = other.hierarchical {
            self.exchange.hierarchical = v;
        }
        if other.local_group_size.is_some() {
            self.exchange.local_group_size = other.local_group_size;
        }
        if let Some(v) = other.overlap {
            self.exchange.overlap = v;
        }
    }

    /// Ranks per local group for the hierarchical exchange.
    pub fn local_group_size(&self) -> usize {
        self.exchange
            .local_group_size
            .unwrap_or(self.parallel.expert_parallel_size)
    }

    /// Check sizes are positive and the hierarchy tiles the EP group.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.parallel;
        for (value, name) in [
            (p.expert_parallel_size, "expert_parallel_size"),
            (p.data_parallel_size, "data_parallel_size"),
            (p.tensor_parallel_size, "tensor_parallel_size"),
            (p.activated_experts, "activated_experts"),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be > 0")));
            }
        }
        if self.exchange.hierarchical {
            let local = self.local_group_size();
            if local == 0 || p.expert_parallel_size % local != 0 {
                return Err(ConfigError::Invalid(format!(
                    "local_group_size {local} must divide expert_parallel_size {}",
                    p.expert_parallel_size
                )));
            }
        }
        Ok(())
    }
}

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Values that cannot describe a valid group layout.
    #[error("Invalid config: {0}")]
    Invalid(String),
}
