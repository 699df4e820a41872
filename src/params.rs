use std::collections::BTreeMap;

use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use ndarray::ArrayD;
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::error::{GiftError, Result};

/// Named parameter tensors of a network, as stored in checkpoints.
pub type ParamMap = BTreeMap<String, ArrayD<f32>>;

/// Whether gradients flow back through a module's output.
///
/// `Frozen` detaches the output from the autodiff graph, so neither the module's parameters
/// nor anything upstream of it receive gradients from that path. On a backend without
/// autodiff both modes compute the same values.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum GradMode {
    Track,
    #[default]
    Frozen,
}

impl GradMode {
    pub fn from_flag(trainable: bool) -> Self {
        if trainable {
            GradMode::Track
        } else {
            GradMode::Frozen
        }
    }

    pub fn apply<B: Backend, const D: usize>(self, tensor: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            GradMode::Track => tensor,
            GradMode::Frozen => tensor.detach(),
        }
    }
}

/// Looks up `name` in `params`, checks its shape and uploads it to `device`.
pub fn take_param<B: Backend, const D: usize>(
    params: &ParamMap,
    name: &str,
    shape: [usize; D],
    device: &B::Device,
) -> Result<Tensor<B, D>> {
    let value = params
        .get(name)
        .ok_or_else(|| GiftError::parameter(name, "missing from state dict"))?;
    if value.shape() != shape {
        return Err(GiftError::parameter(
            name,
            format!("expected shape {:?}, got {:?}", shape, value.shape()),
        ));
    }
    let values: Vec<f32> = value.iter().copied().collect();
    Ok(Tensor::from_data(TensorData::new(values, shape), device))
}

/// Uniform Kaiming initialisation for a weight whose first axis is the output axis.
pub fn kaiming_uniform<B: Backend, const D: usize>(
    shape: [usize; D],
    fan_in: usize,
    rng: &mut StdRng,
    device: &B::Device,
) -> Tensor<B, D> {
    let bound = (6. / fan_in.max(1) as f32).sqrt();
    let values: Vec<f32> = (0..shape.iter().product::<usize>())
        .map(|_| rng.gen_range(-bound..bound))
        .collect();
    Tensor::from_data(TensorData::new(values, shape), device)
}

pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}
