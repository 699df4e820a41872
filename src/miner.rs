//! Semi-hard negative mining over a dense grid of candidate descriptors.
//!
//! For every anchor the candidate cost volume is scanned once. Cells within the exclusion radius
//! of the true match never count as negatives. Among the remaining cells, the closest one whose
//! distance lies in `[d_pos, d_pos + window]` is selected. If there is none, the closest
//! remaining cell is used instead, and if the exclusion removed every cell the closest cell
//! overall is used. Every anchor therefore always gets a negative.

use std::cmp::Ordering;

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use log::debug;
use ndarray::{s, Array2, Array3, ArrayView1, ArrayView2, ArrayView3, ArrayView4, Axis, Zip};

use crate::context::HostParallelism;
use crate::error::{ensure_dim, ensure_shape, GiftError, Result};
use crate::tensor::to_int_tensor;

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct MiningParams {
    /// Cells at most this far from the true match, in grid units, are excluded.
    pub exclusion_radius: f32,
    /// Width of the semi-hard window above the positive distance.
    pub window: f32,
    /// Compare squared Euclidean distances. `dis_pos` must then be squared as well.
    pub squared: bool,
}

/// How a negative was chosen.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Closest cell inside the semi-hard window.
    SemiHard,
    /// No cell in the window; closest cell outside the exclusion radius.
    Hardest,
    /// The exclusion radius covered the whole grid; closest cell overall.
    Unmasked,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct MiningStats {
    pub semi_hard: usize,
    pub hardest: usize,
    pub unmasked: usize,
}

#[derive(Debug, Clone)]
pub struct MinedNegatives {
    /// `[B, n, f]` selected candidate descriptors.
    pub features: Array3<f32>,
    /// `[B, n]` row-major index `y * gw + x` of the selected cell.
    pub cells: Array2<usize>,
    pub stats: MiningStats,
}

impl MinedNegatives {
    /// Picks the selected cells out of the `[B, f, gh, gw]` candidate tensor the selection was
    /// made on, `[B, n, f]`. Unlike [`MinedNegatives::features`] the result stays attached to
    /// the candidates' autodiff graph.
    pub fn gather<B: Backend>(&self, candidates: Tensor<B, 4>) -> Result<Tensor<B, 3>> {
        let [batch, channels, gh, gw] = candidates.dims();
        let (rows, n) = self.cells.dim();
        ensure_dim("mined batch", batch, rows)?;
        let index: Vec<i64> = self.cells.iter().map(|&cell| cell as i64).collect();
        if let Some(&cell) = self.cells.iter().find(|&&cell| cell >= gh * gw) {
            return Err(GiftError::shape_mismatch("mined cell", &[gh * gw], &[cell + 1]));
        }
        let index = to_int_tensor::<B, 3>(index, [batch, 1, n], &candidates.device())
            .repeat_dim(1, channels);
        Ok(candidates
            .reshape([batch, channels, gh * gw])
            .gather(2, index)
            .swap_dims(1, 2))
    }
}

#[derive(Debug, Copy, Clone)]
struct Best {
    index: usize,
    distance: f32,
}

fn keep_closest(best: &mut Option<Best>, index: usize, distance: f32) {
    let closer = match best {
        Some(current) => distance.total_cmp(&current.distance) == Ordering::Less,
        None => true,
    };
    if closer {
        *best = Some(Best { index, distance });
    }
}

/// Distance from `anchor` to every cell of a `[f, gh, gw]` candidate map.
pub fn cost_volume(cells: &ArrayView3<f32>, anchor: &ArrayView1<f32>, squared: bool) -> Array2<f32> {
    let (_, gh, gw) = cells.dim();
    let mut cost = Array2::zeros((gh, gw));
    for (plane, &a) in cells.outer_iter().zip(anchor.iter()) {
        Zip::from(&mut cost)
            .and(&plane)
            .for_each(|c, &v| *c += (v - a) * (v - a));
    }
    if !squared {
        cost.mapv_inplace(f32::sqrt);
    }
    cost
}

fn select_for_anchor(
    cells: &ArrayView3<f32>,
    anchor: &ArrayView1<f32>,
    (match_x, match_y): (f32, f32),
    dis_pos: f32,
    params: &MiningParams,
) -> (usize, Selection) {
    let cost = cost_volume(cells, anchor, params.squared);
    let gw = cost.ncols();
    let upper = dis_pos + params.window;

    let mut semi_hard = None;
    let mut hardest = None;
    let mut any = None;
    for ((y, x), &distance) in cost.indexed_iter() {
        let index = y * gw + x;
        keep_closest(&mut any, index, distance);
        if (x as f32 - match_x).hypot(y as f32 - match_y) <= params.exclusion_radius {
            continue;
        }
        keep_closest(&mut hardest, index, distance);
        if distance >= dis_pos && distance <= upper {
            keep_closest(&mut semi_hard, index, distance);
        }
    }

    match (semi_hard, hardest, any) {
        (Some(best), _, _) => (best.index, Selection::SemiHard),
        (None, Some(best), _) => (best.index, Selection::Hardest),
        (None, None, Some(best)) => (best.index, Selection::Unmasked),
        (None, None, None) => unreachable!("candidate grid is checked to be non-empty"),
    }
}

pub struct SemiHardNegativeMiner {
    params: MiningParams,
    host: HostParallelism,
}

impl SemiHardNegativeMiner {
    pub fn new(params: MiningParams, host: HostParallelism) -> Self {
        Self { params, host }
    }

    pub fn params(&self) -> &MiningParams {
        &self.params
    }

    /// Picks one negative per anchor.
    ///
    /// - `candidates`: `[B, f, gh, gw]`, one candidate map per anchor set
    /// - `dis_pos`: `[B, n]` positive distance of each anchor
    /// - `anchors`: `[B, n, f]`
    /// - `matches`: `[B, n, 2]` true match location `(x, y)` in grid units
    pub fn mine(
        &self,
        candidates: &ArrayView4<f32>,
        dis_pos: &ArrayView2<f32>,
        anchors: &ArrayView3<f32>,
        matches: &ArrayView3<f32>,
    ) -> Result<MinedNegatives> {
        let (batch, channels, gh, gw) = candidates.dim();
        let n = anchors.shape()[1];
        ensure_shape("anchors", &[batch, n, channels], anchors.shape())?;
        ensure_shape("positive distances", &[batch, n], dis_pos.shape())?;
        ensure_shape("match locations", &[batch, n, 2], matches.shape())?;
        if gh * gw == 0 {
            return Err(GiftError::shape_mismatch("candidate grid", &[1, 1], &[gh, gw]));
        }
        ensure_dim("descriptor channels", channels, anchors.shape()[2])?;

        let selections = self.host.map_indices(batch * n, |k| {
            let (b, i) = (k / n, k % n);
            let cells = candidates.index_axis(Axis(0), b);
            let anchor = anchors.slice(s![b, i, ..]);
            let location = (matches[(b, i, 0)], matches[(b, i, 1)]);
            select_for_anchor(&cells, &anchor, location, dis_pos[(b, i)], &self.params)
        });

        let mut features = Array3::zeros((batch, n, channels));
        let mut cells = Array2::zeros((batch, n));
        let mut stats = MiningStats::default();
        for (k, (index, selection)) in selections.into_iter().enumerate() {
            let (b, i) = (k / n, k % n);
            let (y, x) = (index / gw, index % gw);
            features
                .slice_mut(s![b, i, ..])
                .assign(&candidates.slice(s![b, .., y, x]));
            cells[(b, i)] = index;
            match selection {
                Selection::SemiHard => stats.semi_hard += 1,
                Selection::Hardest => stats.hardest += 1,
                Selection::Unmasked => stats.unmasked += 1,
            }
        }
        debug!(
            "semi-hard mining over {gh}x{gw} grid: {} semi-hard, {} hardest fallback, {} unmasked fallback",
            stats.semi_hard, stats.hardest, stats.unmasked
        );
        Ok(MinedNegatives {
            features,
            cells,
            stats,
        })
    }
}
