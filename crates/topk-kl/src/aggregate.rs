//! Reductions from per-token values to a scalar loss.
//!
//! The KL kernel stops at one value per position. Training loops reduce those
//! over a response mask; the modes here cover the usual token-level and
//! sequence-level choices. The last axis is the token axis, every other axis
//! indexes sequences.

use mlx_rs::{Array, Dtype};

use crate::{AggregationMode, Result, TopKKlError};

/// Guard for empty masks.
const MASK_EPS: f32 = 1e-8;

/// Masked mean over every element: `sum(values * mask) / sum(mask)`.
///
/// An all-zero mask yields 0.
pub fn masked_mean(values: &Array, mask: &Array) -> Result<Array> {
    let (values, mask) = prepare(values, mask)?;
    let total = values.multiply(&mask)?.sum(None)?;
    let count = mlx_rs::ops::maximum(&mask.sum(None)?, &Array::from_f32(MASK_EPS))?;
    Ok(total.divide(&count)?)
}

/// Reduce `values` over `mask` with the given mode. Returns a scalar array.
///
/// A scalar `values` (one position, no token axis) is treated as a single
/// sequence of length 1.
pub fn aggregate(values: &Array, mask: &Array, mode: AggregationMode) -> Result<Array> {
    match mode {
        AggregationMode::TokenMean => masked_mean(values, mask),
        AggregationMode::SeqMeanTokenSum => {
            let (values, mask) = prepare(values, mask)?;
            let seq_sums = values.multiply(&mask)?.sum_axis(-1, None)?;
            Ok(seq_sums.mean(None)?)
        }
        AggregationMode::SeqMeanTokenMean => {
            let (values, mask) = prepare(values, mask)?;
            let seq_sums = values.multiply(&mask)?.sum_axis(-1, None)?;
            let seq_counts =
                mlx_rs::ops::maximum(&mask.sum_axis(-1, None)?, &Array::from_f32(MASK_EPS))?;
            Ok(seq_sums.divide(&seq_counts)?.mean(None)?)
        }
        AggregationMode::SeqMeanTokenSumNorm => {
            let (values, mask) = prepare(values, mask)?;
            let seq_len = values.dim(-1) as f32;
            let total = values.multiply(&mask)?.sum(None)?;
            Ok(total.divide(&Array::from_f32(seq_len))?)
        }
    }
}

fn prepare(values: &Array, mask: &Array) -> Result<(Array, Array)> {
    if values.shape() != mask.shape() {
        return Err(TopKKlError::ShapeMismatch {
            what: "mask vs values",
            expected: values.shape().to_vec(),
            actual: mask.shape().to_vec(),
        });
    }

    let (values, mask) = (
        values.as_dtype(Dtype::Float32)?,
        mask.as_dtype(Dtype::Float32)?,
    );
    if values.ndim() == 0 {
        return Ok((values.reshape(&[1])?, mask.reshape(&[1])?));
    }

    Ok((values, mask))
}
