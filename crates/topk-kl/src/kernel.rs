//! Top-k + rest KL divergence and total variation.
//!
//! The teacher distribution P is known only through its top-k token ids and
//! their log-probabilities. Everything outside the top-k set is collapsed into
//! one pseudo-token carrying `1 - sum(top-k probs)`. The student distribution Q
//! is computed from full logits and collapsed onto the same ids plus a rest
//! bucket, so both sides live on a support of size `k + 1`:
//!
//! ```text
//! KL(P || Q) ≈ sum_k p_k (log p_k - log q_k) + p_rest (log p_rest - log q_rest)
//! TV(P, Q)   ≈ (sum_k |p_k - q_k| + |p_rest - q_rest|) / 2
//! ```
//!
//! This is exact only when P and Q agree on the shape of the rest bucket, so
//! the quality of the estimate tracks how much mass the top-k set captures.
//!
//! All four masses are floored at [`MASS_FLOOR`] before taking logs. Degenerate
//! inputs (e.g. teacher top-k mass ≥ 1 from rounding) are clamped, not rejected.

use mlx_rs::{Array, Dtype};

use crate::{Result, TopKKlError};

/// Floor applied to top-k and rest masses before logarithms.
pub const MASS_FLOOR: f32 = 1e-12;

/// Per-position KL and TV between the rollout (P) and current (Q) distributions.
#[derive(Debug, Clone)]
pub struct TopKKlOutput {
    /// Approximate KL(P || Q), shape `logits.shape[..ndim - 1]`.
    pub kl: Array,
    /// Approximate total-variation distance, same shape as `kl`.
    pub tv: Array,
    /// Teacher probability mass on the top-k ids, floored.
    pub topk_p_mass: Array,
    /// Student probability mass on the same ids, floored.
    pub topk_q_mass: Array,
}

impl TopKKlOutput {
    /// Split into `(kl, tv)`.
    pub fn into_tuple(self) -> (Array, Array) {
        (self.kl, self.tv)
    }
}

impl From<TopKKlOutput> for (Array, Array) {
    fn from(output: TopKKlOutput) -> Self {
        output.into_tuple()
    }
}

/// Compute top-k + rest KL and TV for every leading position.
///
/// # Arguments
/// * `logits` - Current model logits `[..., V]`
/// * `rollout_topk_token_ids` - Teacher top-k vocabulary ids `[..., k]`
/// * `rollout_topk_logprobs` - Teacher log-probabilities at those ids `[..., k]`
///
/// # Returns
/// [`TopKKlOutput`] with `kl` and `tv` of shape `[...]`.
///
/// Inputs are cast to `Float32` / `Int32` and detached from any gradient
/// graph. Token ids are assumed in range and distinct; only shapes are checked.
pub fn compute_topk_kl(
    logits: &Array,
    rollout_topk_token_ids: &Array,
    rollout_topk_logprobs: &Array,
) -> Result<TopKKlOutput> {
    compute_topk_kl_with_floor(
        logits,
        rollout_topk_token_ids,
        rollout_topk_logprobs,
        MASS_FLOOR,
    )
}

/// [`compute_topk_kl`] with an explicit mass floor.
pub fn compute_topk_kl_with_floor(
    logits: &Array,
    rollout_topk_token_ids: &Array,
    rollout_topk_logprobs: &Array,
    mass_floor: f32,
) -> Result<TopKKlOutput> {
    check_shapes(logits, rollout_topk_token_ids, rollout_topk_logprobs)?;

    let logits = mlx_rs::stop_gradient(&logits.as_dtype(Dtype::Float32)?)?;
    let token_ids = mlx_rs::stop_gradient(&rollout_topk_token_ids.as_dtype(Dtype::Int32)?)?;
    let p_log_probs = mlx_rs::stop_gradient(&rollout_topk_logprobs.as_dtype(Dtype::Float32)?)?;

    let one = Array::from_f32(1.0);
    let floor = Array::from_f32(mass_floor);

    // Q restricted to the teacher's ids
    let log_q = mlx_rs::nn::log_softmax(&logits, -1)?; // [..., V]
    let topk_q_log_probs = log_q.take_along_axis(&token_ids, -1)?; // [..., k]
    let topk_q_probs = topk_q_log_probs.exp()?;
    let topk_q_mass = topk_q_probs.sum_axis(-1, None)?; // [...]
    let rest_q_mass = one.subtract(&topk_q_mass)?;

    // P from the rollout
    let topk_p_probs = p_log_probs.exp()?; // [..., k]
    let topk_p_mass = topk_p_probs.sum_axis(-1, None)?; // [...]
    let rest_p_mass = one.subtract(&topk_p_mass)?;

    let rest_p_mass = mlx_rs::ops::maximum(&rest_p_mass, &floor)?;
    let topk_p_mass = mlx_rs::ops::maximum(&topk_p_mass, &floor)?;
    let topk_q_mass = mlx_rs::ops::maximum(&topk_q_mass, &floor)?;
    let rest_q_mass = mlx_rs::ops::maximum(&rest_q_mass, &floor)?;

    // KL(P || Q) = sum_i p_i * (log p_i - log q_i)
    let topk_kl = topk_p_probs
        .multiply(&p_log_probs.subtract(&topk_q_log_probs)?)?
        .sum_axis(-1, None)?;
    let rest_kl = rest_p_mass.multiply(&rest_p_mass.log()?.subtract(&rest_q_mass.log()?)?)?;
    let kl = topk_kl.add(&rest_kl)?;

    let topk_tv = topk_p_probs
        .subtract(&topk_q_probs)?
        .abs()?
        .sum_axis(-1, None)?;
    let rest_tv = rest_p_mass.subtract(&rest_q_mass)?.abs()?;
    let tv = topk_tv.add(&rest_tv)?.divide(&Array::from_f32(2.0))?;

    Ok(TopKKlOutput {
        kl,
        tv,
        topk_p_mass,
        topk_q_mass,
    })
}

/// Metadata-only checks; never forces evaluation.
fn check_shapes(logits: &Array, token_ids: &Array, logprobs: &Array) -> Result<()> {
    let logits_shape = logits.shape();
    let ids_shape = token_ids.shape();

    if ids_shape != logprobs.shape() {
        return Err(TopKKlError::ShapeMismatch {
            what: "rollout_topk_logprobs vs rollout_topk_token_ids",
            expected: ids_shape.to_vec(),
            actual: logprobs.shape().to_vec(),
        });
    }

    if logits_shape.is_empty() || ids_shape.len() != logits_shape.len() {
        return Err(TopKKlError::ShapeMismatch {
            what: "rollout_topk_token_ids rank vs logits rank",
            expected: logits_shape.to_vec(),
            actual: ids_shape.to_vec(),
        });
    }

    let rank = logits_shape.len();
    if ids_shape[..rank - 1] != logits_shape[..rank - 1] {
        return Err(TopKKlError::ShapeMismatch {
            what: "leading dimensions",
            expected: logits_shape[..rank - 1].to_vec(),
            actual: ids_shape[..rank - 1].to_vec(),
        });
    }

    let vocab_size = logits_shape[rank - 1];
    let k = ids_shape[rank - 1];
    if k < 1 || vocab_size < 1 || k > vocab_size {
        return Err(TopKKlError::InvalidTopK { k, vocab_size });
    }

    Ok(())
}
