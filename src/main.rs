use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

use latent_dynamics::config::{Config, DataSource};
use latent_dynamics::data::open_source;
use latent_dynamics::model::create_dynamics_models;
use latent_dynamics::tasks::{
    run_label, select_device, JsonlSink, MetricsSink, TracingSink, Trainer, CONFIG_FILE,
};

#[derive(Parser)]
#[command(name = "latent-dynamics")]
#[command(about = "Train and run a latent world model with an inverse dynamics labeler")]
#[command(version)]
struct Cli {
    /// JSON config file; command-line flags override its values
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Run on CPU even if CUDA is available
    #[arg(long, global = true)]
    cpu: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train the IDM and world model jointly
    Train(TrainArgs),
    /// Label an observation file with latent actions from a trained checkpoint
    Label(LabelArgs),
    /// Print the effective configuration as JSON
    PrintConfig,
}

#[derive(Args)]
struct TrainArgs {
    #[arg(long)]
    steps: Option<usize>,

    #[arg(short = 'b', long)]
    batch_size: Option<usize>,

    #[arg(long)]
    peak_lr: Option<f64>,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    log_every: Option<usize>,

    /// Checkpoint every N steps (0 = only at the end)
    #[arg(long)]
    save_every: Option<usize>,

    /// Directory for checkpoints and config.json
    #[arg(short = 'o', long)]
    out_dir: Option<PathBuf>,

    /// Safetensors file with an `obs` tensor [N, T, C, H, W]; synthetic data if omitted
    #[arg(short = 'd', long)]
    data: Option<PathBuf>,

    /// Also append per-step metrics as JSON lines to this file
    #[arg(long)]
    metrics: Option<PathBuf>,

    /// Start from the weights in this checkpoint directory
    #[arg(long)]
    resume: Option<PathBuf>,
}

#[derive(Args)]
struct LabelArgs {
    /// Checkpoint directory written by `train`
    checkpoint: PathBuf,

    /// Safetensors file with an `obs` tensor [N, T, C, H, W]
    obs: PathBuf,

    /// Output safetensors file for `la` and `la_flat`
    #[arg(short = 'o', long, default_value = "labels.safetensors")]
    output: PathBuf,

    #[arg(long, default_value = "128")]
    chunk_size: usize,
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("failed to read config {}", path.display())),
        None => Ok(Config::default()),
    }
}

impl TrainArgs {
    fn apply(&self, config: &mut Config) {
        let train = &mut config.train;
        if let Some(steps) = self.steps {
            train.steps = steps;
        }
        if let Some(batch_size) = self.batch_size {
            train.batch_size = batch_size;
        }
        if let Some(peak_lr) = self.peak_lr {
            train.peak_lr = peak_lr;
        }
        if let Some(seed) = self.seed {
            train.seed = Some(seed);
        }
        if let Some(log_every) = self.log_every {
            train.log_every = log_every;
        }
        if let Some(save_every) = self.save_every {
            train.save_every = save_every;
        }
        if let Some(out_dir) = &self.out_dir {
            train.out_dir = out_dir.clone();
        }
        if let Some(path) = &self.data {
            config.data.source = DataSource::Safetensors { path: path.clone() };
        }
    }
}

fn run_train(cli: &Cli, args: &TrainArgs) -> Result<()> {
    let mut config = load_config(cli.config.as_deref())?;
    args.apply(&mut config);
    config.validate().context("invalid configuration")?;

    let device = select_device(cli.cpu);
    let mut models =
        create_dynamics_models(&config.model, &device).context("failed to build models")?;
    if let Some(dir) = &args.resume {
        models
            .load(dir)
            .with_context(|| format!("failed to load checkpoint {}", dir.display()))?;
        info!("resumed weights from {}", dir.display());
    }

    let mut source = open_source(&config.data, &config.model, &device)
        .context("failed to open training data")?;
    let mut sinks: Vec<Box<dyn MetricsSink>> = vec![Box::new(TracingSink::new(
        config.train.log_every,
        config.train.steps,
    ))];
    if let Some(path) = &args.metrics {
        sinks.push(Box::new(JsonlSink::create(path)?));
    }

    let mut trainer = Trainer::new(models, &config)?;
    let out_dir = trainer.run(source.as_mut(), &mut sinks)?;
    info!("final weights in {}", out_dir.display());
    Ok(())
}

fn run_label_command(cli: &Cli, args: &LabelArgs) -> Result<()> {
    // Without --config, reuse the architecture the checkpoint was trained with.
    let saved = args.checkpoint.join(CONFIG_FILE);
    let config = match (&cli.config, saved.exists()) {
        (Some(path), _) => load_config(Some(path.as_path()))?,
        (None, true) => load_config(Some(saved.as_path()))?,
        (None, false) => Config::default(),
    };
    let device = select_device(cli.cpu);
    run_label(
        &config,
        &args.checkpoint,
        &args.obs,
        &args.output,
        args.chunk_size,
        &device,
    )
    .with_context(|| format!("failed to label {}", args.obs.display()))?;
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match &cli.command {
        Command::Train(args) => run_train(&cli, args),
        Command::Label(args) => run_label_command(&cli, args),
        Command::PrintConfig => {
            let config = load_config(cli.config.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
