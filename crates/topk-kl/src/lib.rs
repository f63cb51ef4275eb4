//! Top-k + rest KL divergence between rollout and current-policy distributions.
//!
//! A rollout or reference model rarely ships its full vocabulary distribution;
//! it reports the top-k token log-probabilities per position. This crate
//! compares such a record (P) with the current model's logits (Q) by
//! collapsing both distributions onto the same k ids plus one "rest" bucket:
//!
//! - **Kernel**: [`compute_topk_kl`] returns per-position KL(P || Q) and
//!   total-variation distance
//! - **Rollout records**: [`RolloutTopK`] builds the top-k pair from logits or
//!   wraps arrays received from a rollout engine
//! - **Reductions**: [`aggregate()`] token-mean and sequence-mean loss reductions
//! - **Loss**: [`TopKKlLoss`] ties the above to a configurable training term
//!
//! All computation is lazy MLX array math. The kernel detaches its inputs from
//! the gradient graph, so the result is a diagnostic or regularization signal
//! rather than something to differentiate through.
//!
//! # Example
//!
//! ```rust,ignore
//! use topk_kl::{compute_topk_kl, RolloutTopK};
//!
//! let rollout = RolloutTopK::from_logits(&reference_logits, 20)?;
//! let (kl, tv) = compute_topk_kl(&logits, &rollout.token_ids, &rollout.logprobs)?.into_tuple();
//! ```

#![allow(clippy::cast_precision_loss)]

mod aggregate;
mod config;
mod error;
mod kernel;
mod loss;
mod rollout;

pub use aggregate::{aggregate, masked_mean};
pub use config::{AggregationMode, TopKKlConfig};
pub use error::{Result, TopKKlError};
pub use kernel::{compute_topk_kl, compute_topk_kl_with_floor, TopKKlOutput, MASS_FLOOR};
pub use loss::{TopKKlLoss, TopKKlLossOutput};
pub use rollout::RolloutTopK;
