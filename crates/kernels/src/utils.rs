//! Shared helpers for kernel implementations.

use crate::linear::LinearProblem;
use anyhow::{bail, ensure, Result};
use ndarray::{ArrayView2, ArrayViewMut2, Axis, Zip};
use rayon::prelude::*;

/// Checks `out = x · Wᵀ` shapes, with `weight` laid out `(out_features, in_features)`.
pub fn validate_linear_shapes(
    input: &ArrayView2<'_, f32>,
    weight: &ArrayView2<'_, f32>,
    out: &ArrayView2<'_, f32>,
) -> Result<LinearProblem> {
    if input.ncols() != weight.ncols() {
        bail!(
            "linear dimension mismatch: input {}x{} vs weight {}x{}",
            input.nrows(),
            input.ncols(),
            weight.nrows(),
            weight.ncols()
        );
    }
    ensure!(
        out.dim() == (input.nrows(), weight.nrows()),
        "linear output buffer {:?} must be {}x{}",
        out.dim(),
        input.nrows(),
        weight.nrows()
    );
    Ok(LinearProblem::new(input.nrows(), input.ncols(), weight.nrows()))
}

/// Row-wise softmax. Entries at `-inf` end up at exactly zero.
pub fn softmax_inplace(mut scores: ArrayViewMut2<'_, f32>) {
    scores
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .for_each(|mut row| {
            let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            row.mapv_inplace(|x| (x - max).exp());
            let sum = row.sum();
            row /= sum.max(f32::EPSILON);
        });
}

/// Residual connection: `dst += src`.
pub fn add_inplace(mut dst: ArrayViewMut2<'_, f32>, src: ArrayView2<'_, f32>) -> Result<()> {
    ensure!(
        dst.dim() == src.dim(),
        "residual shapes differ: {:?} vs {:?}",
        dst.dim(),
        src.dim()
    );
    Zip::from(&mut dst).and(&src).for_each(|d, &s| *d += s);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array2};

    #[test]
    fn softmax_rows_sum_to_one_and_ignore_masked() {
        let mut scores = array![[1.0f32, 2.0, 3.0], [0.5, f32::NEG_INFINITY, f32::NEG_INFINITY]];
        softmax_inplace(scores.view_mut());

        assert_abs_diff_eq!(scores.row(0).sum(), 1.0, epsilon = 1e-6);
        assert!(scores[[0, 2]] > scores[[0, 1]]);
        assert_abs_diff_eq!(scores[[1, 0]], 1.0, epsilon = 1e-6);
        assert_eq!(scores[[1, 1]], 0.0);
    }

    #[test]
    fn linear_shape_validation_reports_mismatch() {
        let input = Array2::<f32>::zeros((2, 3));
        let weight = Array2::<f32>::zeros((4, 5));
        let out = Array2::<f32>::zeros((2, 4));
        let err = validate_linear_shapes(&input.view(), &weight.view(), &out.view())
            .expect_err("mismatch");
        assert!(err.to_string().contains("2x3"));
    }

    #[test]
    fn residual_add_accumulates() {
        let mut dst = array![[1.0f32, 1.0]];
        add_inplace(dst.view_mut(), array![[0.5f32, -2.0]].view()).expect("add");
        assert_eq!(dst, array![[1.5f32, -1.0]]);
        assert!(add_inplace(dst.view_mut(), Array2::zeros((2, 2)).view()).is_err());
    }
}
