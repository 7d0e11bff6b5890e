//! SoRA command line tool
//!
//! ```bash
//! # list the tensors of a checkpoint
//! cargo run --release --bin sora -- inspect ./stdit3.safetensors
//!
//! # reconcile a checkpoint into the predictor and report missing / unexpected keys
//! cargo run --release --bin sora -- load --config sora.json --checkpoint ./model.pt
//!
//! # sample latents from pre-computed text features
//! cargo run --release --bin sora -- sample --config sora.json \
//!     --checkpoint ./stdit3.safetensors --text-features prompt.safetensors \
//!     --frames 16 --height 32 --width 32 --output latents.safetensors
//! ```

use anyhow::{Context, Result, bail};
use candle_core::{DType, Tensor};
use clap::{Args, Parser, Subcommand};
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::path::PathBuf;
use tracing::{info, warn};

use candle_sora::{
    CheckpointLoader, ModelKwargs, ParallelContext, SampleOptions, SoraComponents, SoraConfig,
    SoraModel,
    config::load_model_config,
    loader::{ModelFamily, list_tensor_info, read_checkpoint},
};

#[derive(Parser, Debug)]
#[command(author, version, about = "SoRA video diffusion: checkpoints and sampling")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List tensor names and shapes of a checkpoint
    Inspect {
        path: PathBuf,
    },
    /// Load a checkpoint into the configured predictor
    Load {
        #[command(flatten)]
        model: ModelArgs,

        /// Save the reconciled predictor parameters as safetensors
        #[arg(long)]
        save: Option<PathBuf>,
    },
    /// Run the sampling loop and write the final latents
    Sample(SampleArgs),
}

#[derive(Args, Debug)]
struct ModelArgs {
    /// JSON model configuration (`SoraConfig`)
    #[arg(short, long)]
    config: PathBuf,

    /// Checkpoint to load (.pt / .pth / .safetensors)
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// Treat the checkpoint as a VAE export (prefer EMA weights)
    #[arg(long)]
    vae: bool,

    /// Inpainting variant: synthesize the mask-conditioning embedding
    #[arg(long)]
    inpaint: bool,
}

#[derive(Args, Debug)]
struct SampleArgs {
    #[command(flatten)]
    model: ModelArgs,

    /// safetensors file with `prompt` `[B, 1, L, C]`, optional `prompt_mask` and `negative_prompt`
    #[arg(long)]
    text_features: PathBuf,

    /// Latent frames
    #[arg(long, default_value = "16")]
    frames: usize,

    /// Latent height
    #[arg(long, default_value = "32")]
    height: usize,

    /// Latent width
    #[arg(long, default_value = "32")]
    width: usize,

    #[arg(long)]
    steps: Option<usize>,

    #[arg(long)]
    guidance_scale: Option<f64>,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long, default_value = "24")]
    fps: f32,

    /// Log every N-th progress callback
    #[arg(long, default_value = "1")]
    callback_steps: usize,

    #[arg(short, long, default_value = "latents.safetensors")]
    output: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("candle_sora=info".parse()?)
                .add_directive("sora=info".parse()?),
        )
        .init();

    match Cli::parse().command {
        Command::Inspect { path } => inspect(path),
        Command::Load { model, save } => {
            let model = build_model(&model, |_| {})?;
            if let Some(path) = save {
                model.save_checkpoint(&path)?;
                info!("Saved predictor parameters to {}", path.display());
            }
            Ok(())
        }
        Command::Sample(args) => sample(args),
    }
}

fn inspect(path: PathBuf) -> Result<()> {
    let is_safetensors = path.extension().is_some_and(|e| e == "safetensors");
    let mut entries = if is_safetensors {
        list_tensor_info(&path)?
    } else {
        read_checkpoint(&path)?
            .iter()
            .map(|(name, t)| (name.clone(), t.dims().to_vec()))
            .collect()
    };
    entries.sort();
    for (name, shape) in &entries {
        println!("{name}: {shape:?}");
    }
    info!("{} tensors in {}", entries.len(), path.display());
    Ok(())
}

/// Build the model from `args.config`, adjust the config first, then load the checkpoint
fn build_model(args: &ModelArgs, adjust: impl FnOnce(&mut SoraConfig)) -> Result<SoraModel> {
    let mut config: SoraConfig = load_model_config(&args.config)
        .with_context(|| format!("reading {}", args.config.display()))?;
    if !config.load_video_features || !config.load_text_features {
        warn!("No encoders are available from the command line; using pre-computed features");
        config.load_video_features = true;
        config.load_text_features = true;
    }
    adjust(&mut config);

    let model = SoraModel::new(config, SoraComponents::default(), ParallelContext::single())?;
    if let Some(path) = &args.checkpoint {
        let family = if args.vae {
            ModelFamily::Vae
        } else if args.inpaint {
            ModelFamily::Inpaint
        } else {
            ModelFamily::Generic
        };
        let report = model.load_checkpoint(path, &CheckpointLoader::new(family))?;
        info!(
            "Loaded {} tensors ({} missing, {} unexpected)",
            report.loaded,
            report.missing.len(),
            report.unexpected.len()
        );
    } else {
        warn!("No checkpoint given; predictor weights are randomly initialized");
    }
    Ok(model)
}

fn sample(args: SampleArgs) -> Result<()> {
    let mut model = build_model(&args.model, |config| {
        if let Some(steps) = args.steps {
            config.diffusion.num_inference_steps = Some(steps);
        }
        if let Some(g) = args.guidance_scale {
            config.diffusion.guidance_scale = g;
        }
        if args.seed.is_some() {
            config.diffusion.seed = args.seed;
        }
    })?;
    let device = model.device().clone();

    let mut features: HashMap<String, Tensor> =
        candle_core::safetensors::load(&args.text_features, &device)
            .with_context(|| format!("reading {}", args.text_features.display()))?;
    let Some(prompt) = features.remove("prompt") else {
        bail!("{} has no `prompt` tensor", args.text_features.display());
    };
    let prompt_mask = features.remove("prompt_mask");
    let batch = prompt.dim(0)?;

    let (prompt, prompt_mask) = if model.diffusion().do_classifier_free_guidance() {
        let Some(negative) = features.remove("negative_prompt") else {
            bail!("guidance scale > 1 needs a `negative_prompt` tensor");
        };
        // unconditional half first
        let mask = match prompt_mask {
            Some(mask) => {
                let ones = mask.ones_like()?;
                Some(Tensor::cat(&[&ones, &mask], 0)?)
            }
            None => None,
        };
        (Tensor::cat(&[&negative, &prompt], 0)?, mask)
    } else {
        (prompt, prompt_mask)
    };
    let rows = prompt.dim(0)?;

    let in_channels = model.predictor().in_channels();
    let shape = [batch, in_channels, args.frames, args.height, args.width];
    let kwargs = ModelKwargs::default()
        .with_text(prompt, prompt_mask)
        .with_resolution(
            Tensor::full(args.fps, rows, &device)?,
            Tensor::full((args.height * 8) as f32, rows, &device)?,
            Tensor::full((args.width * 8) as f32, rows, &device)?,
        );

    info!("Sampling latents of shape {shape:?}");
    let options = SampleOptions::default().with_callback(args.callback_steps, |step, t, latents| {
        let mean = latents
            .to_dtype(DType::F32)
            .and_then(|l| l.mean_all())
            .and_then(|m| m.to_scalar::<f32>())
            .unwrap_or(f32::NAN);
        info!(step, timestep = t, mean, "progress");
        ControlFlow::Continue(())
    });
    let latents = model.sample(&shape, kwargs, options)?;

    candle_core::safetensors::save(&HashMap::from([("latents".to_string(), latents)]), &args.output)?;
    info!("Wrote latents to {}", args.output.display());
    Ok(())
}
