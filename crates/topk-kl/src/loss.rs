//! Top-k KL as a training-step loss term.
//!
//! Wraps [`compute_topk_kl`](crate::compute_topk_kl) with the pieces a
//! trainer needs around it: optional id validation, a masked reduction to a
//! scalar, a coefficient, and host-side metrics for logging.
//!
//! ```rust,ignore
//! use topk_kl::{RolloutTopK, TopKKlConfig, TopKKlLoss};
//!
//! let loss = TopKKlLoss::new(TopKKlConfig::default().with_kl_coef(0.1))?;
//! let rollout = RolloutTopK::new(&topk_ids, &topk_logprobs)?;
//! let out = loss.compute(&logits, &rollout, &response_mask)?;
//! ```

use mlx_rs::Array;
use tracing::{debug, warn};

use crate::{
    aggregate::{aggregate, masked_mean},
    compute_topk_kl_with_floor, Result, RolloutTopK, TopKKlConfig,
};

/// Configured top-k KL loss.
#[derive(Debug, Clone)]
pub struct TopKKlLoss {
    config: TopKKlConfig,
}

/// Output of [`TopKKlLoss::compute`].
#[derive(Debug)]
pub struct TopKKlLossOutput {
    /// `kl_coef * aggregate(kl, mask)`, scalar.
    pub loss: Array,
    /// Per-position KL `[...]`.
    pub kl: Array,
    /// Per-position TV `[...]`.
    pub tv: Array,
    /// Masked mean KL.
    pub kl_mean: f32,
    /// Masked mean TV.
    pub tv_mean: f32,
    /// Masked mean teacher mass inside the top-k set.
    pub topk_p_mass_mean: f32,
}

impl TopKKlLoss {
    /// Create a loss from a validated configuration.
    pub fn new(config: TopKKlConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Get the configuration.
    pub fn config(&self) -> &TopKKlConfig {
        &self.config
    }

    /// Get the name of this loss.
    pub fn name(&self) -> &'static str {
        "topk_kl"
    }

    /// Compress reference-model logits `[..., V]` into a rollout record of
    /// the configured `top_k` width.
    pub fn rollout_from_logits(&self, teacher_logits: &Array) -> Result<RolloutTopK> {
        RolloutTopK::from_logits(teacher_logits, self.config.top_k)
    }

    /// Compute the loss for one batch.
    ///
    /// # Arguments
    /// * `logits` - Current model logits `[..., V]`
    /// * `rollout` - Teacher top-k ids and log-probabilities `[..., k]`
    /// * `mask` - Valid-token mask `[...]`, float or bool
    pub fn compute(
        &self,
        logits: &Array,
        rollout: &RolloutTopK,
        mask: &Array,
    ) -> Result<TopKKlLossOutput> {
        if self.config.validate_token_ids {
            rollout.validate(logits.dim(-1))?;
        }

        let out = compute_topk_kl_with_floor(
            logits,
            &rollout.token_ids,
            &rollout.logprobs,
            self.config.mass_floor,
        )?;

        let reduced = aggregate(&out.kl, mask, self.config.aggregation)?;
        let loss = reduced.multiply(&Array::from_f32(self.config.kl_coef))?;

        let kl_mean = host_scalar(&masked_mean(&out.kl, mask)?)?;
        let tv_mean = host_scalar(&masked_mean(&out.tv, mask)?)?;
        let topk_p_mass_mean = host_scalar(&masked_mean(&out.topk_p_mass, mask)?)?;

        if !kl_mean.is_finite() || !tv_mean.is_finite() {
            warn!(kl_mean, tv_mean, "Top-k KL metrics are not finite");
        }
        debug!(
            kl_mean,
            tv_mean,
            topk_p_mass_mean,
            k = rollout.k(),
            aggregation = ?self.config.aggregation,
            "Computed top-k KL"
        );

        Ok(TopKKlLossOutput {
            loss,
            kl: out.kl,
            tv: out.tv,
            kl_mean,
            tv_mean,
            topk_p_mass_mean,
        })
    }
}

/// Read a scalar `Float32` array back to the host.
fn host_scalar(a: &Array) -> Result<f32> {
    a.eval()?;
    Ok(a.try_as_slice::<f32>()?.first().copied().unwrap_or(f32::NAN))
}

impl Default for TopKKlLoss {
    fn default() -> Self {
        Self {
            config: TopKKlConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AggregationMode, TopKKlError};
    use serial_test::serial;

    fn student_and_teacher() -> (Array, RolloutTopK) {
        let logits = Array::from_slice(
            &[
                2.0_f32, 1.0, 0.1, 0.1, // position 0
                0.0, 0.0, 0.0, 0.0, // position 1
            ],
            &[1, 2, 4],
        );
        let ids = Array::from_slice(&[0_i32, 1, 2, 3], &[1, 2, 2]);
        let logprobs = Array::from_slice(
            &[0.7_f32.ln(), 0.2_f32.ln(), 0.5_f32.ln(), 0.25_f32.ln()],
            &[1, 2, 2],
        );
        (logits, RolloutTopK::new(&ids, &logprobs).unwrap())
    }

    #[test]
    fn test_loss_name() {
        assert_eq!(TopKKlLoss::default().name(), "topk_kl");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = TopKKlConfig::default().with_kl_coef(-1.0);
        assert!(TopKKlLoss::new(config).is_err());
    }

    #[test]
    fn test_loss_scales_with_coef() {
        let (logits, rollout) = student_and_teacher();
        let mask = Array::from_slice(&[1.0_f32, 1.0], &[1, 2]);

        let base = TopKKlLoss::new(TopKKlConfig::default()).unwrap();
        let scaled = TopKKlLoss::new(TopKKlConfig::default().with_kl_coef(0.5)).unwrap();

        let base_out = base.compute(&logits, &rollout, &mask).unwrap();
        let scaled_out = scaled.compute(&logits, &rollout, &mask).unwrap();

        let base_loss = base_out.loss.item::<f32>();
        let scaled_loss = scaled_out.loss.item::<f32>();
        assert!(base_loss > 0.0);
        assert!((scaled_loss - 0.5 * base_loss).abs() < 1e-6);

        // Token-mean loss with coef 1 equals the reported mean KL.
        assert!((base_loss - base_out.kl_mean).abs() < 1e-6);
    }

    #[test]
    fn test_masked_position_ignored() {
        let (logits, rollout) = student_and_teacher();
        let only_first = Array::from_slice(&[1.0_f32, 0.0], &[1, 2]);

        let loss = TopKKlLoss::default();
        let out = loss.compute(&logits, &rollout, &only_first).unwrap();

        out.kl.eval().unwrap();
        let kl: &[f32] = out.kl.as_slice();
        assert!((out.kl_mean - kl[0]).abs() < 1e-6);
        assert!((out.topk_p_mass_mean - 0.9).abs() < 1e-5);
    }

    #[test]
    fn test_aggregation_mode_applied() {
        let (logits, rollout) = student_and_teacher();
        let mask = Array::from_slice(&[1.0_f32, 1.0], &[1, 2]);

        let config = TopKKlConfig::default().with_aggregation(AggregationMode::SeqMeanTokenSum);
        let out = TopKKlLoss::new(config)
            .unwrap()
            .compute(&logits, &rollout, &mask)
            .unwrap();

        // One sequence of two tokens: sum = 2 * mean.
        assert!((out.loss.item::<f32>() - 2.0 * out.kl_mean).abs() < 1e-5);
    }

    #[test]
    fn test_rollout_uses_configured_top_k() {
        let teacher_logits = Array::from_slice(
            &(0..2 * 3 * 10).map(|i| (i % 7) as f32 * 0.5).collect::<Vec<f32>>(),
            &[2, 3, 10],
        );

        for top_k in [1, 4, 10] {
            let loss = TopKKlLoss::new(TopKKlConfig::default().with_top_k(top_k)).unwrap();
            let rollout = loss.rollout_from_logits(&teacher_logits).unwrap();
            assert_eq!(rollout.k(), top_k);
            assert_eq!(rollout.token_ids.shape(), &[2, 3, top_k as i32]);
        }

        // The default width of 20 is clamped to the vocabulary.
        let rollout = TopKKlLoss::default()
            .rollout_from_logits(&teacher_logits)
            .unwrap();
        assert_eq!(rollout.k(), 10);
    }

    #[test]
    fn test_single_position_without_leading_axis() {
        let logits = Array::from_slice(&[2.0_f32, 1.0, 0.1, 0.1], &[4]);
        let ids = Array::from_slice(&[0_i32, 1], &[2]);
        let logprobs = Array::from_slice(&[0.7_f32.ln(), 0.2_f32.ln()], &[2]);
        let rollout = RolloutTopK::new(&ids, &logprobs).unwrap();

        let out = TopKKlLoss::default()
            .compute(&logits, &rollout, &Array::from_f32(1.0))
            .unwrap();

        assert_eq!(out.kl.ndim(), 0);
        assert!(out.kl_mean > 0.0);
        assert!((out.loss.item::<f32>() - out.kl_mean).abs() < 1e-6);
        assert!((out.topk_p_mass_mean - 0.9).abs() < 1e-5);
    }

    #[test]
    fn test_token_id_validation_int64_ids() {
        let logits = Array::from_slice(&[0.0_f32; 4], &[1, 4]);
        let rollout = RolloutTopK {
            token_ids: Array::from_slice(&[1_i64, 9], &[1, 2]),
            logprobs: Array::from_slice(&[-1.0_f32, -2.0], &[1, 2]),
        };
        let mask = Array::from_slice(&[1.0_f32], &[1]);

        let config = TopKKlConfig {
            validate_token_ids: true,
            ..Default::default()
        };
        let err = TopKKlLoss::new(config)
            .unwrap()
            .compute(&logits, &rollout, &mask)
            .unwrap_err();
        assert!(matches!(err, TopKKlError::TokenIdOutOfRange { id: 9, .. }));
    }

    #[test]
    fn test_token_id_validation() {
        let logits = Array::from_slice(&[0.0_f32; 4], &[1, 4]);
        let ids = Array::from_slice(&[0_i32, 7], &[1, 2]);
        let logprobs = Array::from_slice(&[-1.0_f32, -2.0], &[1, 2]);
        let rollout = RolloutTopK::new(&ids, &logprobs).unwrap();
        let mask = Array::from_slice(&[1.0_f32], &[1]);

        let config = TopKKlConfig {
            validate_token_ids: true,
            ..Default::default()
        };
        let err = TopKKlLoss::new(config)
            .unwrap()
            .compute(&logits, &rollout, &mask)
            .unwrap_err();
        assert!(matches!(err, TopKKlError::TokenIdOutOfRange { id: 7, .. }));
    }

    #[test]
    #[serial]
    fn test_larger_batch() {
        let batch = 4;
        let seq = 16;
        let vocab = 2048;

        let data: Vec<f32> = (0..batch * seq * vocab)
            .map(|i| ((i * 31 % 97) as f32 - 48.0) / 8.0)
            .collect();
        let teacher_data: Vec<f32> = (0..batch * seq * vocab)
            .map(|i| ((i * 17 % 89) as f32 - 44.0) / 8.0)
            .collect();
        let shape = [batch as i32, seq as i32, vocab as i32];
        let logits = Array::from_slice(&data, &shape);
        let teacher_logits = Array::from_slice(&teacher_data, &shape);

        let rollout = RolloutTopK::from_logits(&teacher_logits, 32).unwrap();
        let mask = Array::from_slice(&vec![1.0_f32; batch * seq], &[batch as i32, seq as i32]);

        let out = TopKKlLoss::default()
            .compute(&logits, &rollout, &mask)
            .unwrap();

        assert_eq!(out.kl.shape(), &[batch as i32, seq as i32]);
        assert!(out.kl_mean.is_finite() && out.kl_mean >= 0.0);
        assert!(out.tv_mean >= 0.0 && out.tv_mean <= 1.0 + 1e-5);
    }
}
