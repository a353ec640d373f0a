//! End-to-end tests: batch preparation, training steps, the continual task
//! lifecycle and decoded inference on the full-depth pyramid.

use candle_core::Device;
use egoloc_core::continual::TaskSchedule;
use egoloc_core::{CoreError, ExperimentConfig, GroundTruth};
use egoloc_model::{BatchBuilder, PreparedBatch, RegularizerState, Trainer, VideoSample};
use tempfile::TempDir;

fn sample(config: &ExperimentConfig, len: usize, seed: u64) -> VideoSample {
    let video = egoloc_test_utils::synthetic_video(config, len, seed, &Device::Cpu);
    VideoSample {
        sample_id: video.sample_id,
        features: vec![video.features],
        text: Some(video.text),
        ground_truth: video.ground_truth,
        meta: video.meta,
    }
}

fn with_labels(mut s: VideoSample, labels: &[usize]) -> VideoSample {
    s.ground_truth = labels
        .iter()
        .enumerate()
        .map(|(i, &label)| GroundTruth::new(4.0 + 12.0 * i as f32, 12.0 + 12.0 * i as f32, label).unwrap())
        .collect();
    s
}

fn inference(config: &ExperimentConfig, samples: &[VideoSample]) -> PreparedBatch {
    BatchBuilder::new(config, &Device::Cpu).inference_batch(samples).unwrap()
}

#[test]
fn test_full_depth_pyramid_decodes_ranked_segments() {
    let mut config = egoloc_test_utils::e2e_config();
    config.opt.warmup = false;
    let device = Device::Cpu;
    let mut trainer = Trainer::new(&config, 1, &device).unwrap();
    assert_eq!(trainer.detector().layout().num_levels(), 10);
    trainer.begin_task().unwrap();

    let mut builder = BatchBuilder::new(&config, &device);
    let train = builder.training_batch(&[sample(&config, 200, 1)]).unwrap();
    assert_eq!(train.plans[0].padded_len, 1024);
    let report = trainer.step(&train).unwrap();
    assert!(report.loss.total.is_finite());
    assert!(report.loss.num_pos > 0);

    let batch = inference(&config, &[sample(&config, 200, 2)]);
    let segments = trainer.predict(&batch).unwrap();
    let segs = &segments[0];
    assert!(!segs.is_empty());
    assert!(segs.len() <= 200);
    assert!(segs.windows(2).all(|w| w[0].score >= w[1].score));
    let duration = batch.metas[0].duration;
    assert!(segs.iter().all(|s| s.start >= 0.0 && s.start < s.end && s.end <= duration));
}

#[test]
fn test_task_sequence_with_replay_and_importance() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("tasks.yaml"), "tasks:\n  - [0]\n  - [1, 2]\n").unwrap();
    let mut config = egoloc_test_utils::tiny_config();
    config.opt.warmup = false;
    config.cl_cfg.pkl_file = "tasks.yaml".into();
    let tasks = TaskSchedule::from_config(&config, dir.path()).unwrap();

    let device = Device::Cpu;
    let mut trainer = Trainer::new(&config, 2, &device).unwrap().with_tasks(tasks);
    trainer.begin_task().unwrap();

    // class 1 belongs to the second task
    let early = inference(&config, &[with_labels(sample(&config, 48, 0), &[0, 1])]);
    let err = trainer.step(&early).unwrap_err();
    assert!(matches!(err.as_core(), Some(CoreError::TaskSequencing(_))));
    assert_eq!(trainer.current_step(), 0);

    let first = inference(&config, &[with_labels(sample(&config, 48, 0), &[0]), with_labels(sample(&config, 64, 3), &[0])]);
    trainer.step(&first).unwrap();
    trainer.finalize_task(std::slice::from_ref(&first)).unwrap();
    assert_eq!(trainer.tasks().unwrap().current_index(), 1);
    assert_eq!(trainer.regularizer().state(), RegularizerState::TaskActive);
    assert_eq!(trainer.replay().class_exemplars(0).len(), 2);
    let after_first = trainer.regularizer().snapshot().total_importance().unwrap();
    assert!(after_first > 0.0);

    let second = inference(&config, &[with_labels(sample(&config, 64, 1), &[1, 2])]);
    trainer.step(&second).unwrap();
    // parameters moved away from the anchors, so the penalty is now active
    let report = trainer.step(&second).unwrap();
    assert!(report.loss.penalty > 0.0);
    assert_eq!(report.snapshot_version, 1);

    trainer.finalize_task(std::slice::from_ref(&second)).unwrap();
    let after_second = trainer.regularizer().snapshot().total_importance().unwrap();
    assert!(after_second >= after_first);
    assert_eq!(trainer.regularizer().version(), 2);
    // last task: the order stays put
    assert_eq!(trainer.tasks().unwrap().current_index(), 1);
    // budget of 4 split over 3 seen classes
    assert!(trainer.replay().exemplars().all(|e| e.class_id < 3));
    assert!(trainer.replay().len() <= 4);
}

#[test]
fn test_finalize_requires_active_task() {
    let config = egoloc_test_utils::tiny_config();
    let mut trainer = Trainer::new(&config, 1, &Device::Cpu).unwrap();
    let batch = inference(&config, &[sample(&config, 32, 0)]);
    let err = trainer.finalize_task(&[batch]).unwrap_err();
    assert!(matches!(err.as_core(), Some(CoreError::TaskSequencing(_))));
}
