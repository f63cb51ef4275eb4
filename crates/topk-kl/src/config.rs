//! Configuration types for the top-k KL loss.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{kernel::MASS_FLOOR, TopKKlError};

/// Configuration for [`TopKKlLoss`](crate::TopKKlLoss).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopKKlConfig {
    /// Number of teacher tokens retained per position when extracting a
    /// rollout with [`TopKKlLoss::rollout_from_logits`](crate::TopKKlLoss::rollout_from_logits)
    /// (default: 20).
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Multiplier on the aggregated KL term (default: 1.0).
    #[serde(default = "default_kl_coef")]
    pub kl_coef: f32,

    /// How per-token KL is reduced to a scalar loss.
    #[serde(default)]
    pub aggregation: AggregationMode,

    /// Floor applied to the top-k and rest masses before taking logs.
    #[serde(default = "default_mass_floor")]
    pub mass_floor: f32,

    /// Check that every rollout token id indexes into the vocabulary before
    /// computing. Forces an evaluation of the id array.
    #[serde(default)]
    pub validate_token_ids: bool,
}

impl Default for TopKKlConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            kl_coef: default_kl_coef(),
            aggregation: AggregationMode::default(),
            mass_floor: default_mass_floor(),
            validate_token_ids: false,
        }
    }
}

fn default_top_k() -> usize {
    20
}

fn default_kl_coef() -> f32 {
    1.0
}

fn default_mass_floor() -> f32 {
    MASS_FLOOR
}

/// Reduction applied to a `[batch, seq]` array of per-token values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMode {
    /// Masked mean over every valid token in the batch.
    #[default]
    TokenMean,

    /// Masked sum per sequence, then mean over sequences.
    SeqMeanTokenSum,

    /// Masked mean per sequence, then mean over sequences.
    SeqMeanTokenMean,

    /// Masked sum over the batch divided by the padded sequence length.
    SeqMeanTokenSumNorm,
}

impl TopKKlConfig {
    /// Load configuration from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> crate::Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        debug!(
            top_k = config.top_k,
            kl_coef = config.kl_coef,
            aggregation = ?config.aggregation,
            mass_floor = config.mass_floor,
            "Parsed top-k KL config"
        );
        Ok(config)
    }

    /// Builder-style setter for `top_k`.
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    /// Builder-style setter for `kl_coef`.
    pub fn with_kl_coef(mut self, kl_coef: f32) -> Self {
        self.kl_coef = kl_coef;
        self
    }

    /// Builder-style setter for `aggregation`.
    pub fn with_aggregation(mut self, aggregation: AggregationMode) -> Self {
        self.aggregation = aggregation;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> crate::Result<()> {
        if self.top_k == 0 {
            return Err(TopKKlError::InvalidConfig(
                "top_k must be at least 1".to_string(),
            ));
        }

        if !self.kl_coef.is_finite() || self.kl_coef < 0.0 {
            return Err(TopKKlError::InvalidConfig(format!(
                "kl_coef must be finite and non-negative, got {}",
                self.kl_coef
            )));
        }

        if !(self.mass_floor > 0.0 && self.mass_floor < 1.0) {
            return Err(TopKKlError::InvalidConfig(format!(
                "mass_floor must be in (0, 1), got {}",
                self.mass_floor
            )));
        }

        Ok(())
    }
}
