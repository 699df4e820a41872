//! Moves data between host `ndarray` arrays and backend tensors.
//!
//! Host arrays carry everything that is decided on the CPU (keypoints, grids, mining
//! selections); tensors carry everything that gradients flow through.

use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};
use ndarray::{Array, ArrayBase, Data, Dimension, IxDyn};

use crate::error::{GiftError, Result};

const NORM_EPS: f32 = 1e-12;

/// Uploads `array` as a rank-`D` float tensor, in logical (row-major) order.
pub fn to_tensor<B, const D: usize, S, Dm>(
    array: &ArrayBase<S, Dm>,
    device: &B::Device,
) -> Result<Tensor<B, D>>
where
    B: Backend,
    S: Data<Elem = f32>,
    Dm: Dimension,
{
    let shape: [usize; D] = array
        .shape()
        .try_into()
        .map_err(|_| GiftError::shape_mismatch("tensor rank", &[D], &[array.ndim()]))?;
    let values: Vec<f32> = array.iter().copied().collect();
    Ok(Tensor::from_data(TensorData::new(values, shape), device))
}

/// Uploads indices as a rank-`D` integer tensor.
pub fn to_int_tensor<B: Backend, const D: usize>(
    values: Vec<i64>,
    shape: [usize; D],
    device: &B::Device,
) -> Tensor<B, D, Int> {
    Tensor::from_data(TensorData::new(values, shape), device)
}

/// Reads a tensor back in logical order.
pub fn to_vec<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|err| GiftError::TensorData(format!("{err:?}")))
}

/// Reads a tensor back into a host array of matching rank.
pub fn to_array<B: Backend, const D: usize, Dm: Dimension>(
    tensor: Tensor<B, D>,
) -> Result<Array<f32, Dm>> {
    let dims = tensor.dims();
    let values = to_vec(tensor)?;
    Ok(Array::from_shape_vec(IxDyn(&dims), values)?.into_dimensionality::<Dm>()?)
}

/// Scales `x` to unit L2 norm along `dim`.
///
/// The squared norm is clamped before the square root so that all-zero lanes stay finite,
/// gradients included.
pub fn l2_normalize<B: Backend, const D: usize>(x: Tensor<B, D>, dim: usize) -> Tensor<B, D> {
    let norm = x
        .clone()
        .powf_scalar(2.)
        .sum_dim(dim)
        .clamp_min(NORM_EPS * NORM_EPS)
        .sqrt();
    x / norm
}

/// Euclidean length of `sq`, a tensor of squared distances, with a finite gradient at zero.
pub fn safe_sqrt<B: Backend, const D: usize>(sq: Tensor<B, D>) -> Tensor<B, D> {
    sq.clamp_min(NORM_EPS).sqrt()
}
