use std::fs;

use burn::backend::NdArray;
use burn::module::Module;
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use gift_features::{
    to_array, to_tensor, to_vec, ExecutionContext, ExtractorWrapper, FeatureMapExtractor, GiftConfig,
    GiftDescriptor, GradMode, HostParallelism, LoadOutcome, LossLevel, MiningParams, Observation,
    ParamMap, Result, ScaleRotateTransformer, SemiHardNegativeMiner, TrainBatch, TrainWrapper,
    TransformGenerator, TransformGroup, VanillaLightCnn,
};
use image::{Rgb, RgbImage};
use itertools::iproduct;
use ndarray::{array, s, Array, Array1, Array2, Array3, Array4, Array5, Axis};

const CHANNELS: usize = 8;

/// Same unit-norm 8-channel map for every input image.
#[derive(Module, Debug, Clone)]
struct ConstantExtractor {
    channels: usize,
}

impl ConstantExtractor {
    fn descriptor(&self) -> Vec<f32> {
        let raw: Vec<f32> = (1..=self.channels).map(|c| c as f32).collect();
        let norm = raw.iter().map(|v| v * v).sum::<f32>().sqrt();
        raw.into_iter().map(|v| v / norm).collect()
    }
}

impl<B: Backend> FeatureMapExtractor<B> for ConstantExtractor {
    fn forward(&self, images: Tensor<B, 4>) -> Result<Tensor<B, 4>> {
        let [b, _, h, w] = images.dims();
        let descriptor = TensorData::new(self.descriptor(), [1, self.channels, 1, 1]);
        Ok(Tensor::<B, 4>::from_data(descriptor, &images.device())
            .repeat_dim(0, b)
            .repeat_dim(2, h)
            .repeat_dim(3, w))
    }
}

#[test]
fn constant_extractor_then_semi_hard_cell() {
    let group = TransformGroup::new(2, 2).unwrap();
    let wrapper = ExtractorWrapper::<NdArray, _>::with_extractor(
        Some(ConstantExtractor { channels: CHANNELS }),
        group,
        Default::default(),
    );
    let images: Vec<Array4<f32>> = (0..4)
        .map(|k| Array4::from_elem((1, 3, 10, 10), k as f32 / 4.))
        .collect();
    let points: Vec<Array3<f32>> = (0..4)
        .map(|_| array![[[1., 2.], [4.5, 4.5], [8., 3.]]])
        .collect();
    let grids: Vec<Array4<f32>> = (0..4)
        .map(|_| Array::from_shape_fn((1, 5, 5, 2), |(_, y, x, c)| [x, y][c] as f32 * 2.))
        .collect();
    let extracted = wrapper
        .forward(&images, &points, Some(&grids), GradMode::Frozen)
        .unwrap();
    let gfeats: Array5<f32> = extracted.gfeats.to_array().unwrap();
    assert_eq!(gfeats.shape(), &[1, 3, CHANNELS, 2, 2]);
    let reference = gfeats.slice(s![.., .., .., 0, 0]).to_owned();
    for (s, r) in group.members() {
        assert_eq!(gfeats.slice(s![.., .., .., s, r]), reference);
    }
    assert_eq!(extracted.gfeats_neg.unwrap().dims(), (1, 5, 5, CHANNELS));

    // Crafted 5x5 candidate map around the first keypoint's anchor.
    let margin = 0.5;
    let dis_pos = 0.3;
    let anchor = reference.slice(s![0, 0, ..]).to_owned();
    let mut unit = Array1::<f32>::zeros(CHANNELS);
    unit[0] = 1.;
    let mut candidates = Array4::<f32>::zeros((1, CHANNELS, 5, 5));
    for (y, x) in iproduct!(0..5, 0..5) {
        let distance = match (y, x) {
            (0, 0) => 0.,
            (1, 3) => dis_pos + margin / 2.,
            (4, 4) => 0.1,
            (2, 2) => dis_pos + margin + 0.3,
            _ => 5.,
        };
        candidates
            .slice_mut(s![0, .., y, x])
            .assign(&(&anchor + &(&unit * distance)));
    }
    let miner = SemiHardNegativeMiner::new(
        MiningParams {
            exclusion_radius: 1.,
            window: margin,
            squared: false,
        },
        HostParallelism::Sequential,
    );
    let mined = miner
        .mine(
            &candidates.view(),
            &array![[dis_pos]].view(),
            &anchor.clone().insert_axis(Axis(0)).insert_axis(Axis(0)).view(),
            &array![[[0., 0.]]].view(),
        )
        .unwrap();
    // row-major index of (y, x) = (1, 3)
    assert_eq!(mined.cells[(0, 0)], 8);
    assert_eq!(mined.stats.semi_hard, 1);

    let candidates = to_tensor::<NdArray, 4, _, _>(&candidates, &Default::default()).unwrap();
    let gathered: Array3<f32> = to_array(mined.gather(candidates).unwrap()).unwrap();
    let expected = &anchor + &(&unit * (dis_pos + margin / 2.));
    assert!(gathered
        .slice(s![0, 0, ..])
        .iter()
        .zip(expected.iter())
        .all(|(g, e)| (g - e).abs() < 1e-6));
}

fn light_cnn_checkpoint(step: i64, seed: u64) -> String {
    let checkpoint = gift_features::Checkpoint {
        extractor: VanillaLightCnn::<NdArray>::new(seed, &Default::default())
            .state_dict()
            .unwrap(),
        embedder: ParamMap::new(),
        step,
    };
    serde_json::to_string(&checkpoint).unwrap()
}

#[test]
fn cold_start_and_latest_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let config = GiftConfig {
        sample_scale_num: 1,
        sample_rotate_num: 2,
        model_dir: dir.path().to_path_buf(),
        ..GiftConfig::default()
    };

    let untrained = GiftDescriptor::<NdArray>::new(&config, ExecutionContext::default()).unwrap();
    assert_eq!(untrained.load_outcome(), &LoadOutcome::Untrained);
    assert_eq!(untrained.step(), 0);

    fs::write(dir.path().join("10.pth"), light_cnn_checkpoint(10, 10)).unwrap();
    fs::write(dir.path().join("20.pth"), light_cnn_checkpoint(20, 20)).unwrap();
    let trained = GiftDescriptor::<NdArray>::new(&config, ExecutionContext::default()).unwrap();
    assert_eq!(trained.step(), 20);
    match trained.load_outcome() {
        LoadOutcome::Loaded { path, .. } => assert!(path.ends_with("20.pth")),
        other => panic!("expected a loaded checkpoint, got {other:?}"),
    }

    let older = GiftDescriptor::<NdArray>::new(
        &GiftConfig {
            step: 10,
            ..config.clone()
        },
        ExecutionContext::default(),
    )
    .unwrap();
    let image = RgbImage::from_fn(16, 16, |x, y| Rgb([(x * 15) as u8, (y * 15) as u8, ((x + y) * 7) as u8]));
    let points = array![[8., 8.], [5., 10.]];
    let latest = trained.describe(&image, &points.view()).unwrap();
    let previous = older.describe(&image, &points.view()).unwrap();
    assert_eq!(latest.shape(), previous.shape());
    assert_ne!(latest, previous);
}

/// Warps `image` and a dense grid through the transformer to build one observation.
fn observe(
    transformer: &ScaleRotateTransformer,
    image: &RgbImage,
    keypoints: &Array2<f32>,
    grid_spacing: f32,
    with_grid: bool,
) -> Observation {
    let set = transformer.transform(image, &keypoints.view()).unwrap();
    let (images, points) = transformer.postprocess(set).unwrap();
    let grids = with_grid.then(|| {
        let (gh, gw) = (4, 4);
        let cells = Array::from_shape_fn((gh * gw, 2), |(k, c)| {
            [k % gw, k / gw][c] as f32 * grid_spacing
        });
        let set = transformer.transform(image, &cells.view()).unwrap();
        set.points
            .into_iter()
            .map(|p| p.into_shape_with_order((1, gh, gw, 2)).unwrap())
            .collect()
    });
    Observation {
        images,
        keypoints: keypoints.clone().insert_axis(Axis(0)),
        points,
        grids,
    }
}

#[test]
fn train_save_and_describe() {
    let dir = tempfile::tempdir().unwrap();
    let config = GiftConfig {
        sample_scale_num: 2,
        sample_rotate_num: 2,
        sample_scale_inter: -0.5,
        sample_rotate_begin: 0.,
        sample_rotate_inter: 90.,
        hem_interval: 4.,
        model_dir: dir.path().to_path_buf(),
        ..GiftConfig::default()
    };
    let transformer = ScaleRotateTransformer::from_config(&config).unwrap();
    let image = RgbImage::from_fn(16, 16, |x, y| {
        Rgb([((x * y) % 256) as u8, (x * 13) as u8, (y * 11) as u8])
    });
    let keypoints = array![[4., 4.], [8., 8.], [11., 6.]];

    let batch = TrainBatch {
        first: observe(&transformer, &image, &keypoints, 4., false),
        second: observe(&transformer, &image, &keypoints, 4., true),
        scale_offset: Array2::zeros((1, 3)),
        rotate_offset: Array2::zeros((1, 3)),
        hem_thresh: 4.,
    };

    let mut trainer =
        TrainWrapper::<NdArray>::new(&config, ExecutionContext::default().parallel()).unwrap();
    assert_eq!(trainer.restore().unwrap().resume_step(), 0);
    for level in [LossLevel::GroupFeatures, LossLevel::Embeddings] {
        let out = trainer.forward(&batch, level).unwrap();
        // Identical observations have zero positive distance.
        let dis_pos = to_vec(out.dis_pos.clone()).unwrap();
        assert!(dis_pos.iter().all(|d| d.abs() < 1e-4), "{level:?}");
        let loss = out.loss_value().unwrap();
        assert!(loss >= 0. && loss <= config.loss_margin + 1e-4);
        assert!((0. ..=1.).contains(&out.triplet_neg_rate));
    }

    gift_features::save_checkpoint(dir.path(), &trainer.checkpoint(7).unwrap()).unwrap();
    let descriptor = GiftDescriptor::<NdArray>::new(&config, ExecutionContext::default()).unwrap();
    assert_eq!(descriptor.step(), 7);
    let efeats = descriptor.describe(&image, &keypoints.view()).unwrap();
    assert_eq!(efeats.shape(), &[3, 32 * 4]);
}
