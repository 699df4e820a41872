use divan::{black_box, Bencher};
use gift_features::{HostParallelism, MiningParams, SemiHardNegativeMiner};
use ndarray::{Array, Array2, Array3, Array4};
use rand::{rngs::StdRng, Rng, SeedableRng};

fn main() {
    divan::main();
}

const PARAMS: MiningParams = MiningParams {
    exclusion_radius: 2.,
    window: 0.5,
    squared: false,
};

struct Inputs {
    candidates: Array4<f32>,
    dis_pos: Array2<f32>,
    anchors: Array3<f32>,
    matches: Array3<f32>,
}

/// `instances` candidate maps of 32 channels on a `grid` x `grid` lattice, 64 anchors each.
fn inputs(instances: usize, grid: usize) -> Inputs {
    let mut rng = StdRng::seed_from_u64(0);
    let n = 64;
    Inputs {
        candidates: Array::from_shape_fn((instances, 32, grid, grid), |_| rng.gen_range(-1.0..1.0)),
        dis_pos: Array::from_shape_fn((instances, n), |_| rng.gen_range(0.0..2.0)),
        anchors: Array::from_shape_fn((instances, n, 32), |_| rng.gen_range(-1.0..1.0)),
        matches: Array::from_shape_fn((instances, n, 2), |_| rng.gen_range(0.0..grid as f32)),
    }
}

#[divan::bench(args = [8, 16, 32], sample_count = 20)]
fn semi_hard_sequential(bencher: Bencher, grid: usize) {
    let inputs = inputs(4, grid);
    let miner = SemiHardNegativeMiner::new(PARAMS, HostParallelism::Sequential);
    bencher.bench_local(|| {
        black_box(miner.mine(
            &inputs.candidates.view(),
            &inputs.dis_pos.view(),
            &inputs.anchors.view(),
            &inputs.matches.view(),
        ))
    });
}

#[divan::bench(args = [8, 16, 32], sample_count = 20)]
fn semi_hard_parallel(bencher: Bencher, grid: usize) {
    let inputs = inputs(4, grid);
    let miner = SemiHardNegativeMiner::new(PARAMS, HostParallelism::Rayon);
    bencher.bench_local(|| {
        black_box(miner.mine(
            &inputs.candidates.view(),
            &inputs.dis_pos.view(),
            &inputs.anchors.view(),
            &inputs.matches.view(),
        ))
    });
}
