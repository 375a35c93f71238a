//! Causal multi-head self-attention over a key/value history.

use crate::utils::softmax_inplace;
use anyhow::{ensure, Result};
use ndarray::linalg::general_mat_mul;
use ndarray::{s, ArrayView2, ArrayViewMut2, Axis};

pub struct AttentionInputs<'a> {
    /// Queries for the new positions, `(n_tokens, n_embd)`.
    pub query: ArrayView2<'a, f32>,
    /// Keys for every position `0..n_past + n_tokens`.
    pub keys: ArrayView2<'a, f32>,
    /// Values for every position `0..n_past + n_tokens`.
    pub values: ArrayView2<'a, f32>,
    pub n_head: usize,
    /// Absolute position of the first query row.
    pub n_past: usize,
}

/// Scaled dot-product attention, one head at a time.
///
/// `scores` is a `(n_tokens, n_past + n_tokens)` work buffer reused across heads; `out`
/// receives the concatenated head outputs.
pub fn causal_attention_into(
    inputs: &AttentionInputs<'_>,
    mut scores: ArrayViewMut2<'_, f32>,
    mut out: ArrayViewMut2<'_, f32>,
) -> Result<()> {
    let (n_tokens, n_embd) = inputs.query.dim();
    let n_total = inputs.keys.nrows();

    ensure!(
        inputs.n_head > 0 && n_embd % inputs.n_head == 0,
        "embedding width {} is not divisible into {} heads",
        n_embd,
        inputs.n_head
    );
    ensure!(
        inputs.keys.dim() == inputs.values.dim(),
        "key history {:?} and value history {:?} differ",
        inputs.keys.dim(),
        inputs.values.dim()
    );
    ensure!(
        inputs.keys.ncols() == n_embd,
        "query dim {} must match key dim {}",
        n_embd,
        inputs.keys.ncols()
    );
    ensure!(
        n_total == inputs.n_past + n_tokens,
        "history holds {} positions, expected n_past {} + {} new",
        n_total,
        inputs.n_past,
        n_tokens
    );
    ensure!(
        scores.dim() == (n_tokens, n_total),
        "scores buffer {:?} must be {}x{}",
        scores.dim(),
        n_tokens,
        n_total
    );
    ensure!(
        out.dim() == (n_tokens, n_embd),
        "attention output {:?} must be {}x{}",
        out.dim(),
        n_tokens,
        n_embd
    );

    let head_dim = n_embd / inputs.n_head;
    let scale = 1.0 / (head_dim as f32).sqrt();

    for head in 0..inputs.n_head {
        let cols = head * head_dim..(head + 1) * head_dim;
        let query = inputs.query.slice(s![.., cols.clone()]);
        let keys = inputs.keys.slice(s![.., cols.clone()]);
        let values = inputs.values.slice(s![.., cols.clone()]);

        general_mat_mul(scale, &query, &keys.t(), 0.0, &mut scores);
        apply_causal_mask(scores.view_mut(), inputs.n_past);
        softmax_inplace(scores.view_mut());

        let mut head_out = out.slice_mut(s![.., cols]);
        general_mat_mul(1.0, &scores, &values, 0.0, &mut head_out);
    }

    Ok(())
}

/// Row `i` is absolute position `n_past + i` and may only see columns up to itself.
pub fn apply_causal_mask(mut scores: ArrayViewMut2<'_, f32>, n_past: usize) {
    for (i, mut row) in scores.axis_iter_mut(Axis(0)).enumerate() {
        let visible = (n_past + i + 1).min(row.len());
        row.slice_mut(s![visible..]).fill(f32::NEG_INFINITY);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array2};

    #[test]
    fn first_position_attends_only_to_itself() {
        let keys = Array2::from_shape_fn((3, 4), |(i, j)| (i + j) as f32 * 0.3);
        let values = Array2::from_shape_fn((3, 4), |(i, j)| (i * 10 + j) as f32);
        let query = keys.clone();
        let mut scores = Array2::<f32>::zeros((3, 3));
        let mut out = Array2::<f32>::zeros((3, 4));

        let inputs = AttentionInputs {
            query: query.view(),
            keys: keys.view(),
            values: values.view(),
            n_head: 2,
            n_past: 0,
        };
        causal_attention_into(&inputs, scores.view_mut(), out.view_mut()).expect("attention");

        for j in 0..4 {
            assert_abs_diff_eq!(out[[0, j]], values[[0, j]], epsilon = 1e-5);
        }
        // later rows mix earlier values, so they stay within the seen range
        assert!(out[[2, 0]] >= 0.0 && out[[2, 0]] <= 20.0);
    }

    #[test]
    fn uniform_keys_average_visible_values() {
        let keys = Array2::<f32>::zeros((3, 2));
        let values = array![[0.0f32, 3.0], [3.0, 6.0], [6.0, 9.0]];
        // one new position at absolute index 2 sees all three history rows
        let query = Array2::<f32>::ones((1, 2));
        let mut scores = Array2::<f32>::zeros((1, 3));
        let mut out = Array2::<f32>::zeros((1, 2));

        let inputs = AttentionInputs {
            query: query.view(),
            keys: keys.view(),
            values: values.view(),
            n_head: 1,
            n_past: 2,
        };
        causal_attention_into(&inputs, scores.view_mut(), out.view_mut()).expect("attention");

        assert_abs_diff_eq!(out[[0, 0]], 3.0, epsilon = 1e-5);
        assert_abs_diff_eq!(out[[0, 1]], 6.0, epsilon = 1e-5);
    }

    #[test]
    fn causal_mask_hides_future_columns() {
        let mut scores = Array2::<f32>::zeros((2, 4));
        apply_causal_mask(scores.view_mut(), 1);
        assert_eq!(scores[[0, 1]], 0.0);
        assert_eq!(scores[[0, 2]], f32::NEG_INFINITY);
        assert_eq!(scores[[1, 2]], 0.0);
        assert_eq!(scores[[1, 3]], f32::NEG_INFINITY);
    }

    #[test]
    fn rejects_history_length_mismatch() {
        let keys = Array2::<f32>::zeros((2, 4));
        let query = Array2::<f32>::zeros((1, 4));
        let mut scores = Array2::<f32>::zeros((1, 2));
        let mut out = Array2::<f32>::zeros((1, 4));
        let inputs = AttentionInputs {
            query: query.view(),
            keys: keys.view(),
            values: keys.view(),
            n_head: 2,
            n_past: 3,
        };
        assert!(causal_attention_into(&inputs, scores.view_mut(), out.view_mut()).is_err());
    }
}
