use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueHint};
use dfw_train::{NoiseType, Options, Trainer};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Progressive-depth watermark training")]
struct Cli {
    /// TOML options file; defaults are used for anything it leaves out
    #[arg(long, short, global = true, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Grow the message round trip depth by depth and save the pretraining checkpoint
    Pretrain,

    /// Train on images from the pretraining checkpoint
    Train {
        /// Skip the background evaluator
        #[arg(long)]
        no_eval: bool,
    },

    /// Evaluate the checkpoint on the test split
    Test,

    /// Evaluate the checkpoint once per distinct message
    TestPerUser,

    /// Export cover, watermark, encoded, noised and decoded examples
    SaveExamples,

    /// Print the effective options as TOML
    Config,
}

#[derive(Args)]
struct Overrides {
    #[arg(long, global = true)]
    epochs: Option<usize>,

    #[arg(long, global = true)]
    batch_size: Option<usize>,

    #[arg(long, global = true)]
    msg_l: Option<usize>,

    #[arg(long, global = true)]
    img_size: Option<usize>,

    /// identity, gaussian, dropout, cropout, crop, jpeg or combined
    #[arg(long, global = true)]
    noise_type: Option<NoiseType>,

    #[arg(long, global = true)]
    use_hamming: bool,

    #[arg(long, global = true)]
    seed: Option<u64>,

    #[arg(long, global = true)]
    lr: Option<f64>,

    #[arg(long, global = true, value_hint = ValueHint::FilePath)]
    checkpoint: Option<PathBuf>,

    #[arg(long, global = true, value_hint = ValueHint::DirPath)]
    output_dir: Option<PathBuf>,
}

impl Overrides {
    fn apply(self, options: &mut Options) {
        if let Some(v) = self.epochs {
            options.epochs = v;
        }
        if let Some(v) = self.batch_size {
            options.batch_size = v;
        }
        if let Some(v) = self.msg_l {
            options.msg_l = v;
        }
        if let Some(v) = self.img_size {
            options.img_size = v;
        }
        if let Some(v) = self.noise_type {
            options.noise_type = v;
        }
        if self.use_hamming {
            options.use_hamming = true;
        }
        if let Some(v) = self.seed {
            options.seed = v;
        }
        if let Some(v) = self.lr {
            options.lr = v;
        }
        if let Some(v) = self.checkpoint {
            options.paths.checkpoint = v;
        }
        if let Some(v) = self.output_dir {
            options.paths.output_dir = v;
        }
    }
}

fn load_options(cli_config: Option<PathBuf>, overrides: Overrides) -> anyhow::Result<Options> {
    let mut options = match cli_config {
        Some(path) => Options::from_file(&path)
            .with_context(|| format!("loading options from {}", path.display()))?,
        None => Options::default(),
    };
    overrides.apply(&mut options);
    options.validate().context("invalid options")?;
    Ok(options)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let options = load_options(cli.config, cli.overrides)?;

    match cli.command {
        Command::Pretrain => {
            let report = dfw_train::pretrain(&options).context("pretraining failed")?;
            info!(steps = report.steps, depth = report.final_depth, "pretraining done");
        }
        Command::Train { no_eval } => {
            let report = Trainer::new(&options)
                .with_evaluator(!no_eval)
                .run()
                .context("training failed")?;
            info!(
                best_val_loss = report.best_val_loss,
                saved = report.saved_epochs.len(),
                "training done"
            );
        }
        Command::Test => {
            let stats = dfw_train::test(&options).context("test failed")?;
            println!("{}", dfw_train::offline::test_line(&options, &stats));
        }
        Command::TestPerUser => {
            let report = dfw_train::test_per_user(&options).context("per-user test failed")?;
            println!(
                "{} users evaluated: {} {}",
                report.stats.len(),
                report.stats_path.display(),
                report.users_path.display()
            );
        }
        Command::SaveExamples => {
            let report = dfw_train::save_examples(&options).context("saving examples failed")?;
            println!("examples written to {}", report.dir.display());
        }
        Command::Config => {
            print!("{}", options.to_toml()?);
        }
    }
    Ok(())
}
