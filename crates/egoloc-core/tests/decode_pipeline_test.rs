//! Integration tests for the tensor-free pipeline: configuration file →
//! pyramid layout → label assignment → NMS decoding, plus the continual task
//! order resolved from the manifest next to the configuration.

use std::collections::BTreeSet;

use egoloc_core::config::{ExperimentConfig, NmsMethod};
use egoloc_core::continual::{ReplayMemory, TaskSchedule};
use egoloc_core::{
    CoreError, GroundTruth, LabelAssigner, LevelPrediction, NmsDecoder, PyramidLayout,
    SequencePolicy, VideoMeta,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const TINY: &str = include_str!("fixtures/tiny.yaml");

fn write_experiment(manifest: &str) -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let config_path = dir.path().join("experiment.yaml");
    std::fs::write(&config_path, TINY).expect("write config");
    std::fs::write(dir.path().join("tasks.yaml"), manifest).expect("write manifest");
    (dir, config_path)
}

fn meta(config: &ExperimentConfig, len: usize) -> VideoMeta {
    let fps = config.dataset.default_fps.expect("fixture sets default_fps");
    let feat_stride = config.dataset.feat_stride;
    // the last feature window ends num_frames after its start
    VideoMeta {
        fps,
        duration: ((len as u32 - 1) * feat_stride + config.dataset.num_frames) as f32 / fps,
        feat_stride,
        num_frames: config.dataset.num_frames,
    }
}

/// Predictions that reproduce the assigned targets exactly.
fn oracle_predictions(
    layout: &PyramidLayout,
    assigner: &LabelAssigner,
    gts: &[GroundTruth],
    valid_len: usize,
) -> Vec<LevelPrediction> {
    let targets = assigner.assign(gts).expect("assignment");
    let masks = layout.level_masks(valid_len);
    let c = targets.num_classes;
    layout
        .levels()
        .iter()
        .zip(masks)
        .map(|(level, mask)| {
            let range = level.offset..level.offset + level.length;
            LevelPrediction {
                stride: level.stride,
                scores: targets.cls[range.start * c..range.end * c]
                    .iter()
                    .map(|&t| t * 0.9)
                    .collect(),
                offsets: targets.reg[range].to_vec(),
                mask,
            }
        })
        .collect()
}

#[test]
fn test_oracle_predictions_decode_to_ground_truth() {
    let (_dir, path) = write_experiment("tasks: [[0, 1], [2]]\n");
    let config = ExperimentConfig::from_file(&path).expect("config");
    let layout = PyramidLayout::from_config(&config.model, &config.dataset).unwrap();
    let assigner = LabelAssigner::new(layout.clone(), &config.train_cfg, config.dataset.num_classes);
    let policy = SequencePolicy::from_config(&config.model, &config.dataset);
    let plan = policy.plan(64).unwrap();

    let gts = [GroundTruth::new(10.0, 14.0, 1).unwrap()];
    let levels = oracle_predictions(&layout, &assigner, &gts, plan.valid_len);
    let decoder = NmsDecoder::new(&config.test_cfg, config.dataset.num_classes).unwrap();
    let segments = decoder.decode(&levels, &plan, &meta(&config, 64)).unwrap();

    assert_eq!(segments.len(), 1, "hard NMS must collapse identical boxes");
    let seg = segments[0];
    assert_eq!(seg.class_id, 1);
    assert!((seg.start - 176.0 / 30.0).abs() < 1e-4, "start {}", seg.start);
    assert!((seg.end - 8.0).abs() < 1e-4, "end {}", seg.end);
}

#[test]
fn test_upsampled_sequence_maps_back_to_original_grid() {
    let config = ExperimentConfig::from_yaml_str(TINY).unwrap();
    let layout = PyramidLayout::from_config(&config.model, &config.dataset).unwrap();
    let assigner = LabelAssigner::new(layout.clone(), &config.train_cfg, config.dataset.num_classes);
    let policy = SequencePolicy::from_config(&config.model, &config.dataset);
    let plan = policy.plan(4).unwrap();
    assert!(plan.is_resampled());

    let original = [GroundTruth::new(0.5, 3.5, 2).unwrap()];
    let on_grid = policy.project_ground_truth(&plan, &original);
    let levels = oracle_predictions(&layout, &assigner, &on_grid, plan.valid_len);
    let decoder = NmsDecoder::new(&config.test_cfg, config.dataset.num_classes).unwrap();
    let meta = meta(&config, 4);
    let segments = decoder.decode(&levels, &plan, &meta).unwrap();

    assert!(!segments.is_empty());
    let expected_start = meta.grid_to_seconds(0.5);
    let expected_end = meta.grid_to_seconds(3.5);
    assert!((segments[0].start - expected_start).abs() < 1e-3);
    assert!((segments[0].end - expected_end).abs() < 1e-3);
}

#[test]
fn test_parallel_and_sequential_decoding_agree() {
    let config = ExperimentConfig::from_yaml_str(TINY).unwrap();
    let layout = PyramidLayout::from_config(&config.model, &config.dataset).unwrap();
    let plan = SequencePolicy::from_config(&config.model, &config.dataset)
        .plan(64)
        .unwrap();
    let mut rng = StdRng::seed_from_u64(config.init_rand_seed);
    let c = config.dataset.num_classes;
    let levels: Vec<LevelPrediction> = layout
        .levels()
        .iter()
        .map(|level| LevelPrediction {
            stride: level.stride,
            // coarse scores force plenty of exact ties
            scores: (0..level.length * c)
                .map(|_| (rng.gen_range(0..20) as f32) / 20.0)
                .collect(),
            offsets: (0..level.length)
                .map(|_| [rng.gen_range(0.0..4.0), rng.gen_range(0.0..4.0)])
                .collect(),
            mask: vec![true; level.length],
        })
        .collect();

    for method in [NmsMethod::Soft, NmsMethod::Hard, NmsMethod::None] {
        let mut test_cfg = config.test_cfg.clone();
        test_cfg.nms_method = method;
        let decoder = NmsDecoder::new(&test_cfg, c).unwrap();
        let meta = meta(&config, 64);
        let parallel = decoder.clone().with_parallel(true).decode(&levels, &plan, &meta).unwrap();
        let sequential = decoder.with_parallel(false).decode(&levels, &plan, &meta).unwrap();
        assert_eq!(parallel, sequential, "{method:?}");
        assert!(parallel.len() <= test_cfg.max_seg_num);
        assert!(parallel.windows(2).all(|w| w[0].score >= w[1].score));
    }
}

#[test]
fn test_task_schedule_from_config_directory() {
    let (dir, path) = write_experiment("tasks:\n  - [0]\n  - [1, 2]\n");
    let config = ExperimentConfig::from_file(&path).unwrap();
    let mut schedule = TaskSchedule::from_config(&config, dir.path()).unwrap();
    assert_eq!(schedule.len(), 2);
    assert!(matches!(
        schedule.validate_labels([1]),
        Err(CoreError::TaskSequencing(_))
    ));

    let mut memory = ReplayMemory::new(
        config.cl_cfg.memory_size,
        config.cl_cfg.type_sampling,
        config.init_rand_seed,
    );
    let pool: Vec<_> = (0..5)
        .map(|i| egoloc_core::continual::Exemplar {
            sample_id: format!("video_{i}"),
            class_id: 0,
            embedding: vec![],
        })
        .collect();
    memory.update(&schedule.seen_classes(), &pool);
    assert_eq!(memory.len(), config.cl_cfg.memory_size);

    schedule.advance().unwrap();
    schedule.validate_labels([0, 1, 2]).unwrap();
    assert_eq!(schedule.seen_classes(), BTreeSet::from([0, 1, 2]));
}

#[test]
fn test_missing_manifest_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = ExperimentConfig::from_yaml_str(TINY).unwrap();
    let err = TaskSchedule::from_config(&config, dir.path()).unwrap_err();
    assert!(matches!(err, CoreError::Io(_)));
}
