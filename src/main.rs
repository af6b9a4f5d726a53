// protoseg unified binary
//
// Commands:
//   protoseg train [--steps N] [--seed S]   Episodic training on phantoms
//   protoseg eval [--seed S]                Volume evaluation on phantoms
//   protoseg selftest                       One episode end to end
//
// Config tiers: test (default, CPU, tiny model), default (256-dim model)
// GPU: auto-detected when compiled with --features cuda and tier is not "test"
//
// Volumes here are synthetic spherical phantoms; real data loading is the
// job of the surrounding tooling, which hands volumes in through the same
// LabeledVolume type.

use protoseg::encoder::ConvEncoder;
use protoseg::eval::evaluate_volume;
use protoseg::model::{FewShotSeg, ModelConfig};
use protoseg::sampler::{EpisodeSampler, LabeledVolume, SamplerConfig};
use protoseg::training::{save_checkpoint, train_episodes, Trainer, TrainingConfig};

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use ndarray::Array3;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

// ---------------------------------------------------------------------------
// Config Tier Selection
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq)]
enum ConfigTier {
    Test,
    Default,
}

impl ConfigTier {
    fn from_str(s: &str) -> Option<Self> {
        match s {
            "test" => Some(Self::Test),
            "default" => Some(Self::Default),
            _ => None,
        }
    }

    fn model_config(&self) -> ModelConfig {
        match self {
            Self::Test => ModelConfig::test_config(),
            Self::Default => ModelConfig::default_config(),
        }
    }
}

/// Select device: CUDA if available and not test tier, else CPU.
fn select_device(tier: ConfigTier) -> Device {
    if tier == ConfigTier::Test {
        return Device::Cpu;
    }

    #[cfg(feature = "cuda")]
    {
        if candle_core::utils::cuda_is_available() {
            match Device::new_cuda(0) {
                Ok(dev) => {
                    eprintln!("[PROTOSEG] Using CUDA device 0");
                    return dev;
                }
                Err(e) => {
                    eprintln!("[PROTOSEG] CUDA init failed, falling back to CPU: {}", e);
                }
            }
        }
    }

    #[cfg(not(feature = "cuda"))]
    {
        eprintln!("[PROTOSEG] Built without CUDA feature, using CPU");
    }

    Device::Cpu
}

fn parse_flag(args: &[String], name: &str, default: u64) -> u64 {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_tier(args: &[String]) -> ConfigTier {
    args.iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .and_then(|v| ConfigTier::from_str(v))
        .unwrap_or(ConfigTier::Test)
}

// ---------------------------------------------------------------------------
// Synthetic phantoms
// ---------------------------------------------------------------------------

/// Spherical phantom volume: class 1 is a bright ball spanning most slices,
/// over a noisy background. Stands in for the external volume loader.
fn phantom_volume(n_slices: usize, hw: usize, radius_frac: f64, rng: &mut StdRng) -> LabeledVolume {
    let noise = Normal::new(0.0f32, 0.3).expect("valid normal");
    let mut image = Array3::zeros((n_slices, hw, hw));
    let mut label = Array3::<i64>::zeros((n_slices, hw, hw));
    let cz = n_slices as f64 / 2.0;
    let cyx = hw as f64 / 2.0;
    let radius = hw as f64 * radius_frac;
    for z in 0..n_slices {
        for y in 0..hw {
            for x in 0..hw {
                let dz = (z as f64 - cz) * (hw as f64 / n_slices as f64);
                let dy = y as f64 - cyx;
                let dx = x as f64 - cyx;
                let inside = (dz * dz + dy * dy + dx * dx).sqrt() < radius;
                if inside {
                    label[[z, y, x]] = 1;
                }
                let base = if inside { 2.0 } else { 0.0 };
                image[[z, y, x]] = base + noise.sample(rng);
            }
        }
    }
    LabeledVolume::from_raw(image, label).expect("aligned phantom arrays")
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    let command = args[1].as_str();
    let rest = &args[2..];

    let result = match command {
        "train" => cmd_train(rest),
        "eval" => cmd_eval(rest),
        "selftest" => cmd_selftest(rest),
        _ => {
            print_usage();
            std::process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("[PROTOSEG] Error: {:#}", e);
        std::process::exit(1);
    }
}

fn print_usage() {
    eprintln!("Usage: protoseg <command> [--config test|default] [--seed S]");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  train [--steps N]   Episodic training on synthetic phantoms");
    eprintln!("  eval                Volume evaluation on synthetic phantoms");
    eprintln!("  selftest            Run one episode end to end");
    eprintln!();
    eprintln!("Config tiers:");
    eprintln!("  test     16-dim features, 32x32 images, CPU only");
    eprintln!("  default  256-dim features, 256x256 images, auto-GPU");
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn build_model(
    tier: ConfigTier,
    varmap: &VarMap,
    device: &Device,
) -> anyhow::Result<FewShotSeg<ConvEncoder>> {
    let config = tier.model_config();
    let vb = VarBuilder::from_varmap(varmap, DType::F32, device);
    let encoder = ConvEncoder::new(config.feat_dim, vb.pp("encoder"))?;
    FewShotSeg::new(encoder, config, vb.pp("model"))
}

fn phantom_set(tier: ConfigTier, rng: &mut StdRng, count: usize) -> Vec<LabeledVolume> {
    let hw = tier.model_config().img_h;
    (0..count)
        .map(|i| phantom_volume(12, hw, 0.2 + 0.03 * i as f64, rng))
        .collect()
}

fn cmd_train(args: &[String]) -> anyhow::Result<()> {
    let tier = parse_tier(args);
    let steps = parse_flag(args, "--steps", 20) as usize;
    let seed = parse_flag(args, "--seed", 42);
    let device = select_device(tier);
    let mut rng = StdRng::seed_from_u64(seed);

    let volumes = phantom_set(tier, &mut rng, 3);
    let sampler = EpisodeSampler::new(
        volumes,
        SamplerConfig {
            min_size: 10,
            ..Default::default()
        },
    )?;

    let varmap = VarMap::new();
    let model = build_model(tier, &varmap, &device)?;
    let mut trainer = Trainer::new(
        varmap,
        TrainingConfig {
            total_steps: steps,
            log_interval: 5,
            ..Default::default()
        },
    )?;

    let losses = train_episodes(&model, &sampler, &mut trainer, &device, steps, &mut rng)?;
    let last = losses.last().copied().unwrap_or(f32::NAN);
    eprintln!("[TRAIN] Done: {} steps, final loss {last:.4}", losses.len());
    save_checkpoint(&trainer.varmap, "protoseg.safetensors")?;
    Ok(())
}

fn cmd_eval(args: &[String]) -> anyhow::Result<()> {
    let tier = parse_tier(args);
    let seed = parse_flag(args, "--seed", 42);
    let device = select_device(tier);
    let mut rng = StdRng::seed_from_u64(seed);

    let varmap = VarMap::new();
    let model = build_model(tier, &varmap, &device)?;

    let hw = tier.model_config().img_h;
    let support = phantom_volume(12, hw, 0.22, &mut rng);
    let query = phantom_volume(12, hw, 0.25, &mut rng);
    let dice = evaluate_volume(&model, &support, &query, 1, 1, &device)?;
    eprintln!("[EVAL] mean dice: {dice:.4}");
    Ok(())
}

fn cmd_selftest(args: &[String]) -> anyhow::Result<()> {
    let tier = parse_tier(args);
    let seed = parse_flag(args, "--seed", 42);
    let device = select_device(tier);
    let mut rng = StdRng::seed_from_u64(seed);

    let volumes = phantom_set(tier, &mut rng, 1);
    let sampler = EpisodeSampler::new(
        volumes,
        SamplerConfig {
            min_size: 10,
            ..Default::default()
        },
    )?;
    let episode = sampler.sample(&mut rng)?;
    eprintln!(
        "[SELFTEST] sampled class {} from slices {:?}",
        episode.class_id, episode.slice_indices
    );

    let varmap = VarMap::new();
    let model = build_model(tier, &varmap, &device)?;
    let tensors = episode.to_tensors(&device)?;
    let (out, _) = model.forward(
        &tensors.support_images,
        &tensors.support_fg_masks,
        &tensors.query_images,
        false,
    )?;
    let dims = out.dims4()?;
    eprintln!("[SELFTEST] prediction {dims:?}");
    let fg_mean = out
        .narrow(1, 1, 1)?
        .mean_all()?
        .to_scalar::<f32>()?;
    eprintln!("[SELFTEST] mean foreground probability {fg_mean:.4}");
    eprintln!("[SELFTEST] OK");
    Ok(())
}
