//! Pointwise activations.

use ndarray::{ArrayViewMut2, Axis};
use rayon::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActivationKind {
    #[default]
    None,
    Gelu,
}

impl ActivationKind {
    pub fn apply_inplace(self, data: ArrayViewMut2<'_, f32>) {
        match self {
            ActivationKind::None => {}
            ActivationKind::Gelu => gelu_inplace(data),
        }
    }
}

/// Tanh approximation of GELU, the formulation GPT-2 style checkpoints are trained with.
pub fn gelu(x: f32) -> f32 {
    const SQRT_2_OVER_PI: f32 = 0.797_884_6;
    0.5 * x * (1.0 + (SQRT_2_OVER_PI * (x + 0.044715 * x * x * x)).tanh())
}

pub fn gelu_inplace(mut data: ArrayViewMut2<'_, f32>) {
    data.axis_iter_mut(Axis(0))
        .into_par_iter()
        .for_each(|mut row| row.mapv_inplace(gelu));
}
