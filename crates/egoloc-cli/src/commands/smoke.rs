//! `egoloc smoke`: exercise the whole pipeline on synthetic features.
//!
//! Builds the detector from the config, runs one training step and one
//! decode, and prints the step report and segments as JSON on stdout.

use std::path::PathBuf;

use candle_core::{Device, Tensor};
use clap::Args;
use egoloc_core::{ExperimentConfig, GroundTruth, Segment, VideoMeta};
use egoloc_model::{BatchBuilder, StepReport, Trainer, VideoSample};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::info;

use super::{exit_code, load_config};

/// Frame rate assumed when the dataset section leaves `default_fps` null.
const DEFAULT_FPS: f32 = 30.0;

#[derive(Args)]
pub struct SmokeArgs {
    #[arg(short, long)]
    pub config: PathBuf,

    /// Feature sequence length of the synthetic video
    #[arg(short, long, default_value = "200")]
    pub length: usize,

    /// Seed of the synthetic video
    #[arg(long, default_value = "0")]
    pub seed: u64,
}

#[derive(Serialize)]
struct SmokeOutput {
    step: StepReport,
    segments: Vec<Segment>,
}

pub fn handle(args: SmokeArgs) -> i32 {
    exit_code(run(&args))
}

/// Seeded random features with two actions at fixed fractions of the video.
fn synthetic_sample(config: &ExperimentConfig, len: usize, seed: u64, device: &Device) -> anyhow::Result<VideoSample> {
    let mut rng = StdRng::seed_from_u64(seed);
    let num_classes = config.dataset.num_classes;
    let len_f = len as f32;
    let mut ground_truth = vec![GroundTruth::new(
        (0.2 * len_f).floor(),
        (0.45 * len_f).ceil().max((0.2 * len_f).floor() + 1.0),
        seed as usize % num_classes,
    )?];
    if len >= 10 {
        ground_truth.push(GroundTruth::new(
            (0.6 * len_f).floor(),
            (0.85 * len_f).ceil(),
            (seed as usize + 1) % num_classes,
        )?);
    }

    let dim = config.dataset.input_dim;
    let features: Vec<f32> = (0..dim * len).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let text: Vec<f32> = (0..config.model.n_txt_in).map(|_| rng.gen_range(-1.0..1.0)).collect();

    let fps = config.dataset.default_fps.unwrap_or(DEFAULT_FPS);
    let feat_stride = config.dataset.feat_stride;
    let num_frames = config.dataset.num_frames;
    Ok(VideoSample {
        sample_id: format!("smoke_{seed}_{len}"),
        features: vec![Tensor::from_vec(features, (dim, len), device)?],
        text: Some(Tensor::from_vec(text, config.model.n_txt_in, device)?),
        ground_truth,
        meta: VideoMeta {
            fps,
            duration: ((len - 1) as f32 * feat_stride as f32 + num_frames as f32) / fps,
            feat_stride,
            num_frames,
        },
    })
}

fn run(args: &SmokeArgs) -> anyhow::Result<()> {
    if args.length == 0 {
        anyhow::bail!("--length must be greater than 0");
    }
    let config = load_config(&args.config)?;
    let device = Device::Cpu;
    let mut trainer = Trainer::new(&config, 1, &device)?;
    trainer.begin_task()?;

    let sample = synthetic_sample(&config, args.length, args.seed, &device)?;
    let mut builder = BatchBuilder::new(&config, &device);
    let train = builder.training_batch(std::slice::from_ref(&sample))?;
    let step = trainer.step(&train)?;

    let batch = builder.inference_batch(std::slice::from_ref(&sample))?;
    let segments = trainer.predict(&batch)?.into_iter().next().unwrap_or_default();
    info!(segments = segments.len(), total_loss = step.loss.total, "Smoke run finished");

    let output = SmokeOutput { step, segments };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
