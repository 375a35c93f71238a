//! Dense projections.
//!
//! Weights follow the checkpoint layout: one row per output feature, so a projection is
//! `out = x · Wᵀ + b`.

use crate::activation::ActivationKind;
use crate::utils::validate_linear_shapes;
use anyhow::{ensure, Result};
use ndarray::linalg::general_mat_mul;
use ndarray::{ArrayView1, ArrayView2, ArrayViewMut2, Axis};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearProblem {
    pub rows: usize,
    pub in_features: usize,
    pub out_features: usize,
}

impl LinearProblem {
    pub fn new(rows: usize, in_features: usize, out_features: usize) -> Self {
        Self {
            rows,
            in_features,
            out_features,
        }
    }

    pub fn flops(&self) -> f64 {
        2.0 * self.rows as f64 * self.in_features as f64 * self.out_features as f64
    }
}

pub struct LinearInputs<'a> {
    pub input: ArrayView2<'a, f32>,
    pub weight: ArrayView2<'a, f32>,
    pub bias: Option<ArrayView1<'a, f32>>,
    pub activation: ActivationKind,
}

impl<'a> LinearInputs<'a> {
    pub fn new(
        input: ArrayView2<'a, f32>,
        weight: ArrayView2<'a, f32>,
        bias: Option<ArrayView1<'a, f32>>,
        activation: ActivationKind,
    ) -> Self {
        Self {
            input,
            weight,
            bias,
            activation,
        }
    }
}

/// Computes `out = act(x · Wᵀ + b)`, overwriting `out`.
pub fn linear_into(
    inputs: &LinearInputs<'_>,
    mut out: ArrayViewMut2<'_, f32>,
) -> Result<LinearProblem> {
    let problem = validate_linear_shapes(&inputs.input, &inputs.weight, &out.view())?;

    general_mat_mul(1.0, &inputs.input, &inputs.weight.t(), 0.0, &mut out);

    if let Some(bias) = &inputs.bias {
        ensure!(
            bias.len() == problem.out_features,
            "bias length {} must equal output features {}",
            bias.len(),
            problem.out_features
        );
        for mut row in out.axis_iter_mut(Axis(0)) {
            row += bias;
        }
    }

    inputs.activation.apply_inplace(out);
    Ok(problem)
}
