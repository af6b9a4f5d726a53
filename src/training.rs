// Episodic training driver: cosine LR schedule with warmup, AdamW over the
// model's VarMap, early stopping with best-checkpoint tracking, and the
// per-episode loss assembly (query segmentation + prototype alignment +
// threshold regularization).

use crate::encoder::Encoder;
use crate::model::{nll_binary, FewShotSeg};
use crate::sampler::EpisodeSampler;
use anyhow::Result;
use candle_core::{Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use rand::rngs::StdRng;
use std::time::Instant;

// ---------------------------------------------------------------------------
// Cosine LR Scheduler with Linear Warmup
// ---------------------------------------------------------------------------

pub struct CosineScheduler {
    base_lr: f64,
    min_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    current_step: usize,
}

impl CosineScheduler {
    pub fn new(base_lr: f64, min_lr: f64, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            base_lr,
            min_lr,
            warmup_steps,
            total_steps,
            current_step: 0,
        }
    }

    pub fn step(&mut self) -> f64 {
        let lr = self.get_lr();
        self.current_step += 1;
        lr
    }

    pub fn get_lr(&self) -> f64 {
        if self.current_step < self.warmup_steps {
            self.base_lr * (self.current_step as f64 + 1.0) / self.warmup_steps as f64
        } else {
            let progress = (self.current_step - self.warmup_steps) as f64
                / (self.total_steps - self.warmup_steps).max(1) as f64;
            let progress = progress.min(1.0);
            self.min_lr
                + 0.5
                    * (self.base_lr - self.min_lr)
                    * (1.0 + (std::f64::consts::PI * progress).cos())
        }
    }
}

// ---------------------------------------------------------------------------
// Training Config
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct TrainingConfig {
    pub lr: f64,
    pub min_lr: f64,
    pub weight_decay: f64,
    pub warmup_fraction: f64,
    pub total_steps: usize,
    /// Scale of the threshold regularization term in the total loss.
    pub t_loss_scaler: f64,
    pub log_interval: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            min_lr: 1e-5,
            weight_decay: 0.01,
            warmup_fraction: 0.05,
            total_steps: 1000,
            t_loss_scaler: 1.0,
            log_interval: 50,
        }
    }
}

// ---------------------------------------------------------------------------
// Trainer
// ---------------------------------------------------------------------------

pub struct Trainer {
    pub optimizer: AdamW,
    pub scheduler: CosineScheduler,
    pub config: TrainingConfig,
    pub varmap: VarMap,
    step_count: usize,
    timer_start: Instant,
}

impl Trainer {
    pub fn new(varmap: VarMap, config: TrainingConfig) -> Result<Self> {
        let warmup_steps = (config.total_steps as f64 * config.warmup_fraction) as usize;
        let scheduler =
            CosineScheduler::new(config.lr, config.min_lr, warmup_steps, config.total_steps);

        let params = ParamsAdamW {
            lr: config.lr,
            weight_decay: config.weight_decay,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        };
        let optimizer = AdamW::new(varmap.all_vars(), params)?;

        Ok(Self {
            optimizer,
            scheduler,
            config,
            varmap,
            step_count: 0,
            timer_start: Instant::now(),
        })
    }

    pub fn backward_step(&mut self, loss: &Tensor) -> Result<usize> {
        self.optimizer.backward_step(loss)?;
        self.step_count += 1;
        let new_lr = self.scheduler.step();
        self.optimizer.set_learning_rate(new_lr);
        Ok(self.step_count)
    }

    pub fn step_count(&self) -> usize {
        self.step_count
    }

    pub fn current_lr(&self) -> f64 {
        self.scheduler.get_lr()
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.timer_start.elapsed().as_secs_f64()
    }
}

// ---------------------------------------------------------------------------
// Early Stopping + Best Checkpoint Tracking
// ---------------------------------------------------------------------------

/// Tracks convergence and saves the best checkpoint automatically.
/// Call `check()` at each log interval and act on the returned action.
pub struct EarlyStopping {
    threshold: f32,
    patience: usize,
    below_count: usize,
    best_loss: f32,
    best_step: usize,
    best_path: Option<String>,
}

#[derive(Debug, PartialEq)]
pub enum EarlyStopAction {
    Continue,
    NewBest,
    Stop,
}

impl EarlyStopping {
    /// threshold = 0.0 disables stopping (best checkpoint still tracked).
    pub fn new(threshold: f32, patience: usize, best_path: Option<String>) -> Self {
        Self {
            threshold,
            patience,
            below_count: 0,
            best_loss: f32::MAX,
            best_step: 0,
            best_path,
        }
    }

    pub fn disabled() -> Self {
        Self::new(0.0, usize::MAX, None)
    }

    pub fn check(&mut self, avg_loss: f32, step: usize, varmap: &VarMap) -> EarlyStopAction {
        let mut action = EarlyStopAction::Continue;

        if avg_loss < self.best_loss {
            self.best_loss = avg_loss;
            self.best_step = step;
            if let Some(ref path) = self.best_path {
                if let Err(e) = save_checkpoint(varmap, path) {
                    eprintln!("[BEST] Warning: failed to save best checkpoint: {e}");
                } else {
                    eprintln!("[BEST] New best loss={avg_loss:.6} at step {step} -> {path}");
                }
            }
            action = EarlyStopAction::NewBest;
        }

        if self.threshold > 0.0 {
            if avg_loss < self.threshold {
                self.below_count += 1;
                if self.below_count >= self.patience {
                    eprintln!(
                        "[EARLY STOP] Loss {avg_loss:.6} < threshold {:.6} for {} consecutive checks. \
                         Stopping at step {step} (best was {:.6} at step {}).",
                        self.threshold, self.patience, self.best_loss, self.best_step
                    );
                    return EarlyStopAction::Stop;
                }
            } else {
                self.below_count = 0;
            }
        }

        action
    }

    pub fn best_loss(&self) -> f32 {
        self.best_loss
    }

    pub fn best_step(&self) -> usize {
        self.best_step
    }
}

// ---------------------------------------------------------------------------
// Loss assembly
// ---------------------------------------------------------------------------

/// Primary query segmentation loss: two-channel NLL of the upsampled
/// prediction against the binary query labels.
pub fn query_seg_loss(pred: &Tensor, labels: &Tensor) -> Result<Tensor> {
    nll_binary(pred, labels)
}

// ---------------------------------------------------------------------------
// Episodic loop
// ---------------------------------------------------------------------------

/// Run `steps` training episodes. Returns the per-step total losses.
pub fn train_episodes<E: Encoder>(
    model: &FewShotSeg<E>,
    sampler: &EpisodeSampler,
    trainer: &mut Trainer,
    device: &Device,
    steps: usize,
    rng: &mut StdRng,
) -> Result<Vec<f32>> {
    let mut losses = Vec::with_capacity(steps);
    for step in 0..steps {
        let episode = sampler.sample(rng)?;
        let tensors = episode.to_tensors(device)?;
        let (pred, align_loss) = model.forward(
            &tensors.support_images,
            &tensors.support_fg_masks,
            &tensors.query_images,
            true,
        )?;
        let seg_loss = query_seg_loss(&pred, &tensors.query_labels)?;
        let t_loss = model
            .threshold_loss()?
            .affine(trainer.config.t_loss_scaler, 0.0)?
            .sum_all()?;
        let total = ((seg_loss + align_loss)? + t_loss)?;
        let loss_val = total.to_scalar::<f32>()?;
        trainer.backward_step(&total)?;

        if step % trainer.config.log_interval == 0 {
            eprintln!(
                "[TRAIN] step {step:>5}/{steps} class={} loss={loss_val:.4} lr={:.2e} ({:.1}s)",
                episode.class_id,
                trainer.current_lr(),
                trainer.elapsed_secs()
            );
        }
        losses.push(loss_val);
    }
    Ok(losses)
}

// ---------------------------------------------------------------------------
// Model Checkpointing (safetensors)
// ---------------------------------------------------------------------------

pub fn save_checkpoint(varmap: &VarMap, path: &str) -> Result<()> {
    let data = varmap.data().lock().unwrap();
    let named: std::collections::HashMap<String, Tensor> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
        .collect();
    candle_core::safetensors::save(&named, path)?;
    eprintln!("[CHECKPOINT] Saved {} params to {path}", named.len());
    Ok(())
}

pub fn load_checkpoint(varmap: &VarMap, path: &str, device: &Device) -> Result<()> {
    let tensors = candle_core::safetensors::load(path, device)?;
    let data = varmap.data().lock().unwrap();
    let mut loaded = 0usize;
    for (name, var) in data.iter() {
        if let Some(saved_tensor) = tensors.get(name) {
            var.set(saved_tensor)?;
            loaded += 1;
        }
    }
    eprintln!(
        "[CHECKPOINT] Loaded {loaded}/{} params from {path}",
        data.len()
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
