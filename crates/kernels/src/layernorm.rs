//! Layer normalization kernels.

use anyhow::{ensure, Result};
use ndarray::{ArrayView1, ArrayView2, ArrayViewMut2, Axis};
use rayon::prelude::*;

pub fn layer_norm_inplace(
    mut data: ArrayViewMut2<'_, f32>,
    gamma: ArrayView1<'_, f32>,
    beta: ArrayView1<'_, f32>,
    epsilon: f32,
) -> Result<()> {
    let feature_dim = data.len_of(Axis(1));
    ensure!(
        gamma.len() == feature_dim,
        "gamma length {} must equal feature dimension {}",
        gamma.len(),
        feature_dim
    );
    ensure!(
        beta.len() == feature_dim,
        "beta length {} must equal feature dimension {}",
        beta.len(),
        feature_dim
    );

    data.axis_iter_mut(Axis(0))
        .into_par_iter()
        .for_each(|mut row| {
            let len = row.len() as f32;
            let mean = row.iter().sum::<f32>() / len;
            let var = row.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / len;
            let inv_std = 1.0 / (var + epsilon).sqrt();

            for ((value, g), b) in row.iter_mut().zip(gamma.iter()).zip(beta.iter()) {
                *value = (*value - mean) * inv_std * g + b;
            }
        });

    Ok(())
}

/// Normalizes `src` into `dst`, leaving `src` untouched.
pub fn layer_norm_into(
    src: ArrayView2<'_, f32>,
    gamma: ArrayView1<'_, f32>,
    beta: ArrayView1<'_, f32>,
    epsilon: f32,
    mut dst: ArrayViewMut2<'_, f32>,
) -> Result<()> {
    ensure!(
        src.dim() == dst.dim(),
        "layer norm source {:?} and destination {:?} differ",
        src.dim(),
        dst.dim()
    );
    dst.assign(&src);
    layer_norm_inplace(dst, gamma, beta, epsilon)
}
