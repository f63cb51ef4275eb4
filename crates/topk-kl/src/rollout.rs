//! Rollout top-k records: the teacher side of the top-k + rest scheme.
//!
//! A rollout engine reports, for every generated position, the k most likely
//! token ids and their log-probabilities. [`RolloutTopK`] holds that pair and
//! can also build it from full logits, which is how a reference model's
//! distribution gets compressed before the student step.

use mlx_rs::{
    ops::{argsort_axis, indexing::IndexOp},
    Array, Dtype,
};
use tracing::debug;

use crate::{compute_topk_kl, Result, TopKKlError, TopKKlOutput};

/// Top-k token ids and log-probabilities for each position.
#[derive(Debug, Clone)]
pub struct RolloutTopK {
    /// Vocabulary ids `[..., k]`, `Int32`.
    pub token_ids: Array,
    /// Natural-log probabilities at those ids `[..., k]`, `Float32`.
    pub logprobs: Array,
}

impl RolloutTopK {
    /// Wrap existing rollout arrays.
    ///
    /// Ids are cast to `Int32` and log-probabilities to `Float32`.
    pub fn new(token_ids: &Array, logprobs: &Array) -> Result<Self> {
        if token_ids.shape() != logprobs.shape() {
            return Err(TopKKlError::ShapeMismatch {
                what: "rollout logprobs vs token ids",
                expected: token_ids.shape().to_vec(),
                actual: logprobs.shape().to_vec(),
            });
        }

        let k = token_ids.shape().last().copied().unwrap_or(0);
        if k < 1 {
            return Err(TopKKlError::InvalidTopK { k, vocab_size: 0 });
        }

        Ok(Self {
            token_ids: token_ids.as_dtype(Dtype::Int32)?,
            logprobs: logprobs.as_dtype(Dtype::Float32)?,
        })
    }

    /// Keep the `k` most likely entries of a `[..., V]` log-probability array.
    ///
    /// Entries are ordered by descending probability. `k` above `V` is clamped.
    pub fn from_logprobs(log_probs: &Array, k: usize) -> Result<Self> {
        let shape = log_probs.shape();
        let vocab_size = shape.last().copied().unwrap_or(0);
        if k == 0 || vocab_size < 1 {
            return Err(TopKKlError::InvalidTopK {
                k: k as i32,
                vocab_size,
            });
        }

        let k = if k > vocab_size as usize {
            debug!(k, vocab_size, "Clamping rollout top-k to vocabulary size");
            vocab_size
        } else {
            k as i32
        };

        let mut out_shape = shape[..shape.len() - 1].to_vec();
        out_shape.push(k);

        let log_probs = log_probs.as_dtype(Dtype::Float32)?;
        let flat = log_probs.reshape(&[-1, vocab_size])?;

        // Ascending argsort of the negation gives descending probability
        let order = argsort_axis(&flat.negative()?, -1)?;
        let top_ids = order.index((.., ..k)).as_dtype(Dtype::Int32)?;
        let top_logprobs = flat.take_along_axis(&top_ids, -1)?;

        Ok(Self {
            token_ids: top_ids.reshape(&out_shape)?,
            logprobs: top_logprobs.reshape(&out_shape)?,
        })
    }

    /// Normalize `[..., V]` logits with log-softmax and keep the top `k`.
    pub fn from_logits(logits: &Array, k: usize) -> Result<Self> {
        let log_probs = mlx_rs::nn::log_softmax(&logits.as_dtype(Dtype::Float32)?, -1)?;
        Self::from_logprobs(&log_probs, k)
    }

    /// Number of retained tokens per position.
    pub fn k(&self) -> usize {
        self.token_ids.shape().last().copied().unwrap_or(0) as usize
    }

    /// Check every id lies in `[0, vocab_size)`.
    ///
    /// Forces evaluation of the id array. Ids of any integer dtype are read
    /// as `Int32`, matching the kernel's promotion.
    pub fn validate(&self, vocab_size: i32) -> Result<()> {
        let ids = self.token_ids.as_dtype(Dtype::Int32)?;
        ids.eval()?;
        let ids: &[i32] = ids.try_as_slice()?;

        if let Some(&id) = ids.iter().find(|&&id| id < 0 || id >= vocab_size) {
            return Err(TopKKlError::TokenIdOutOfRange { id, vocab_size });
        }

        Ok(())
    }

    /// Teacher probability mass captured by the top-k set, shape `[...]`.
    pub fn topk_mass(&self) -> Result<Array> {
        Ok(self.logprobs.exp()?.sum_axis(-1, None)?)
    }

    /// Compare these rollout probabilities against `logits`.
    pub fn compute_kl(&self, logits: &Array) -> Result<TopKKlOutput> {
        compute_topk_kl(logits, &self.token_ids, &self.logprobs)
    }
}
