use burn::tensor::backend::Backend;
use rayon::prelude::*;

/// How host-side loops (negative mining over anchors) are scheduled.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum HostParallelism {
    /// Everything on the calling thread.
    #[default]
    Sequential,
    /// Spread over the rayon pool.
    Rayon,
}

impl HostParallelism {
    /// Maps `f` over `0..len`, in parallel when allowed. Output order always follows the index
    /// order.
    pub fn map_indices<T, F>(&self, len: usize, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(usize) -> T + Sync + Send,
    {
        match self {
            HostParallelism::Rayon => (0..len).into_par_iter().map(f).collect(),
            HostParallelism::Sequential => (0..len).map(f).collect(),
        }
    }
}

/// Execution placement, passed explicitly to every wrapper at construction.
///
/// Tensors and module parameters live on `device`; dense kernels run wherever the backend puts
/// them.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext<B: Backend> {
    pub device: B::Device,
    pub host: HostParallelism,
}

impl<B: Backend> ExecutionContext<B> {
    pub fn new(device: B::Device) -> Self {
        Self {
            device,
            host: HostParallelism::Sequential,
        }
    }

    /// Same device, host loops on the rayon pool.
    pub fn parallel(self) -> Self {
        Self {
            host: HostParallelism::Rayon,
            ..self
        }
    }
}
