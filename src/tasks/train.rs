use candle_core::Device;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

use crate::config::{Config, TrainConfig};
use crate::data::TransitionSource;
use crate::error::DynamicsResult;
use crate::model::{DynamicsModels, Mode};

pub const CONFIG_FILE: &str = "config.json";

/// Warmup + cosine learning rate schedule over a fixed number of steps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LrSchedule {
    pub initial_lr: f64,
    pub peak_lr: f64,
    pub final_lr: f64,
    pub total_steps: usize,
}

impl LrSchedule {
    pub fn from_config(train: &TrainConfig) -> Self {
        Self {
            initial_lr: train.initial_lr,
            peak_lr: train.peak_lr,
            final_lr: train.final_lr,
            total_steps: train.steps,
        }
    }

    /// First 15% of the run, rounded down.
    pub fn warmup_steps(&self) -> usize {
        (self.total_steps as f64 * 0.15).floor() as usize
    }
}

/// Linear ramp from `initial_lr` to `peak_lr` over the warmup, then a half cosine
/// from `peak_lr` down to `final_lr` at `total_steps`.
pub fn scheduled_lr(step: usize, schedule: &LrSchedule) -> f64 {
    let warmup = schedule.warmup_steps();
    if step < warmup {
        let t = step as f64 / warmup as f64;
        return schedule.initial_lr + (schedule.peak_lr - schedule.initial_lr) * t;
    }
    let decay_steps = schedule.total_steps.saturating_sub(warmup);
    let progress = if decay_steps == 0 {
        1.0
    } else {
        ((step - warmup) as f64 / decay_steps as f64).clamp(0.0, 1.0)
    };
    let cosine = 0.5 * (1.0 + (std::f64::consts::PI * progress + std::f64::consts::PI).cos());
    schedule.peak_lr + (schedule.final_lr - schedule.peak_lr) * cosine
}

/// What one optimizer step reports to the metric sinks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepMetrics {
    pub step: usize,
    /// Samples seen so far, step * batch_size
    pub global_step: usize,
    pub loss: f32,
    pub wm_loss: f32,
    pub per_layer: Vec<f32>,
    pub num_tokens: usize,
    pub ema_momentum: f64,
    pub lr: f64,
    pub weight_decay: f64,
}

impl StepMetrics {
    pub fn is_finite(&self) -> bool {
        self.loss.is_finite() && self.wm_loss.is_finite() && self.per_layer.iter().all(|v| v.is_finite())
    }
}

pub trait MetricsSink {
    fn record(&mut self, metrics: &StepMetrics) -> DynamicsResult<()>;
}

/// Logs a step line through `tracing` every `log_every` steps.
pub struct TracingSink {
    log_every: usize,
    total_steps: usize,
}

impl TracingSink {
    pub fn new(log_every: usize, total_steps: usize) -> Self {
        Self {
            log_every: log_every.max(1),
            total_steps,
        }
    }
}

impl MetricsSink for TracingSink {
    fn record(&mut self, m: &StepMetrics) -> DynamicsResult<()> {
        if m.step % self.log_every == 0 {
            let layers = m
                .per_layer
                .iter()
                .map(|v| format!("{v:.5}"))
                .collect::<Vec<_>>()
                .join(" ");
            info!(
                "step {}/{} wm loss {:.6} layers [{}] tokens {} lr {:.2e}",
                m.step, self.total_steps, m.wm_loss, layers, m.num_tokens, m.lr
            );
        }
        Ok(())
    }
}

/// Appends one JSON object per step.
pub struct JsonlSink {
    writer: BufWriter<File>,
}

impl JsonlSink {
    pub fn create(path: &Path) -> DynamicsResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl MetricsSink for JsonlSink {
    fn record(&mut self, metrics: &StepMetrics) -> DynamicsResult<()> {
        serde_json::to_writer(&mut self.writer, metrics)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// CUDA device 0 when the `cuda` feature is built and a GPU is present, otherwise CPU.
pub fn select_device(force_cpu: bool) -> Device {
    if force_cpu {
        return Device::Cpu;
    }
    match Device::new_cuda(0) {
        Ok(device) => {
            info!("using device: CUDA(0)");
            device
        }
        Err(e) => {
            warn!("CUDA not available ({e}), falling back to CPU");
            Device::Cpu
        }
    }
}

/// Owns the models, optimizer and RNG for one run.
///
/// Each step labels a fresh batch with the IDM, scores it with the world model,
/// takes one AdamW step on the mean per-layer loss and then blends the online
/// encoder into its EMA copy.
pub struct Trainer {
    models: DynamicsModels,
    opt: AdamW,
    schedule: LrSchedule,
    config: Config,
    rng: StdRng,
    step: usize,
}

impl Trainer {
    pub fn new(models: DynamicsModels, config: &Config) -> DynamicsResult<Self> {
        config.validate()?;
        let schedule = LrSchedule::from_config(&config.train);
        let params = ParamsAdamW {
            lr: scheduled_lr(0, &schedule),
            weight_decay: config.train.weight_decay,
            ..Default::default()
        };
        let opt = AdamW::new(models.trainable_vars(), params)?;
        let rng = match config.train.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            models,
            opt,
            schedule,
            config: config.clone(),
            rng,
            step: 0,
        })
    }

    pub fn models(&self) -> &DynamicsModels {
        &self.models
    }

    pub fn into_models(self) -> DynamicsModels {
        self.models
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn schedule(&self) -> &LrSchedule {
        &self.schedule
    }

    /// One full optimization step on a freshly sampled batch.
    pub fn train_step(&mut self, source: &mut dyn TransitionSource) -> DynamicsResult<StepMetrics> {
        let train = &self.config.train;
        let lr = scheduled_lr(self.step, &self.schedule);

        let mut batch = source.next_batch(train.batch_size, &mut self.rng)?;
        self.models.idm.label(&mut batch, Mode::Train, &mut self.rng)?;
        let num_tokens = batch.la.as_ref().map(|la| la.dims()[1]).unwrap_or(0);

        let per_layer = self.models.world_model.label(&batch)?;
        let wm_loss = per_layer.mean_all()?;
        let loss = wm_loss.clone();

        self.opt.set_learning_rate(lr);
        self.opt.backward_step(&loss)?;
        self.models.update_ema(train.ema_momentum)?;

        let metrics = StepMetrics {
            step: self.step,
            global_step: self.step * train.batch_size,
            loss: loss.to_scalar::<f32>()?,
            wm_loss: wm_loss.to_scalar::<f32>()?,
            per_layer: per_layer.to_vec1::<f32>()?,
            num_tokens,
            ema_momentum: train.ema_momentum,
            lr,
            weight_decay: train.weight_decay,
        };

        // Release the labels and the graph before the next batch is drawn.
        drop(loss);
        drop(wm_loss);
        drop(per_layer);
        drop(batch);

        self.step += 1;
        Ok(metrics)
    }

    /// Write both parameter sets plus the run config into `dir`.
    pub fn save_checkpoint(&self, dir: &Path) -> DynamicsResult<()> {
        self.models.save(dir)?;
        self.config.save(&dir.join(CONFIG_FILE))?;
        info!("checkpoint saved to {}", dir.display());
        Ok(())
    }

    /// Run the remaining configured steps, reporting to every sink and saving to `out_dir`.
    pub fn run(
        &mut self,
        source: &mut dyn TransitionSource,
        sinks: &mut [Box<dyn MetricsSink>],
    ) -> DynamicsResult<PathBuf> {
        let train = self.config.train.clone();
        let out_dir = train.out_dir.clone();
        info!(
            "training latent dynamics: {} steps, batch {}, {} trainable parameters, warmup {} steps",
            train.steps,
            train.batch_size,
            self.models.num_parameters(),
            self.schedule.warmup_steps()
        );

        let started = Instant::now();
        while self.step < train.steps {
            let metrics = self.train_step(source)?;
            for sink in sinks.iter_mut() {
                sink.record(&metrics)?;
            }
            if train.save_every > 0 && self.step % train.save_every == 0 && self.step < train.steps {
                self.save_checkpoint(&out_dir)?;
            }
        }
        self.save_checkpoint(&out_dir)?;
        info!(
            "finished {} steps in {:.1}s",
            self.step,
            started.elapsed().as_secs_f64()
        );
        Ok(out_dir)
    }
}
