//! Command-line front end: stitch a set of overlapping photographs.
//!
//! ```bash
//! panostitch --mode scans --output page.jpg scan-top.jpg scan-bottom.jpg
//! ```

use anyhow::{Context, bail};
use clap::Parser;
use log::{debug, info};
use panostitch::{ImageRef, RequestCoordinator, StitchConfig, StitchMode, StitchResult, logging};
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "panostitch")]
#[command(about = "Sharpen and stitch overlapping photographs into a panorama or a flat scan")]
struct Args {
    /// Images to stitch, in capture order
    #[arg(required = true)]
    images: Vec<PathBuf>,

    /// panorama (rotating camera) or scans (flat documents)
    #[arg(short, long, default_value = "panorama")]
    mode: StitchMode,

    /// Copy the stitched result here
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Root directory for temporary files and results
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Gaussian sigma of the unsharp mask
    #[arg(long)]
    sigma: Option<f32>,

    /// Weight of the original image in the unsharp mask
    #[arg(long, allow_hyphen_values = true)]
    original_weight: Option<f32>,

    /// Weight of the high-frequency residual in the unsharp mask
    #[arg(long, allow_hyphen_values = true)]
    residual_weight: Option<f32>,

    /// Constant added after weighting
    #[arg(long, allow_hyphen_values = true)]
    bias: Option<f32>,

    /// Preprocessing threads (default: one per CPU)
    #[arg(long)]
    threads: Option<usize>,

    /// Print the outcome as JSON
    #[arg(long, default_value_t = false)]
    json: bool,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn config(&self) -> anyhow::Result<StitchConfig> {
        let mut config = StitchConfig::from_env().context("failed to read PANOSTITCH_* settings")?;
        if let Some(root) = &self.workspace {
            config.workspace_root = root.clone();
            if std::env::var_os("PANOSTITCH_RESULT_DIR").is_none() {
                config.result_dir = root.join("results");
            }
        }
        if let Some(sigma) = self.sigma {
            config.sharpen.sigma = sigma;
        }
        if let Some(weight) = self.original_weight {
            config.sharpen.original_weight = weight;
        }
        if let Some(weight) = self.residual_weight {
            config.sharpen.residual_weight = weight;
        }
        if let Some(bias) = self.bias {
            config.sharpen.bias = bias;
        }
        if let Some(threads) = self.threads {
            config.preprocess_threads = threads;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(logging::level_for_verbosity(args.verbose));

    let config = args.config()?;
    debug!("Using configuration {config:?}");

    let (coordinator, mut results) = RequestCoordinator::with_default_engine(&config)?;
    let images = args.images.iter().cloned().map(ImageRef::from).collect();
    let start = Instant::now();
    let id = coordinator.submit(images, args.mode)?;

    let delivery = {
        let mut ticker = tokio::time::interval(Duration::from_millis(500));
        let mut stderr = std::io::stderr();
        loop {
            tokio::select! {
                delivery = results.recv() => break delivery,
                _ = ticker.tick() => {
                    let elapsed = start.elapsed().as_secs_f32();
                    let _ = write!(stderr, "\rProcessing images... {elapsed:.1}s");
                    let _ = stderr.flush();
                }
            }
        }
    };
    eprintln!();
    let delivery = delivery.context("coordinator stopped before delivering a result")?;
    info!("Request {id} finished in {:.2?}", start.elapsed());

    if args.json {
        println!("{}", serde_json::to_string_pretty(&delivery)?);
    }

    match delivery.result {
        StitchResult::Success { location } => {
            let location = match &args.output {
                Some(output) => {
                    std::fs::copy(&location, output)
                        .with_context(|| format!("failed to copy result to {}", output.display()))?;
                    output.clone()
                }
                None => location,
            };
            if !args.json {
                println!("{}", location.display());
            }
            Ok(())
        }
        StitchResult::Failure { kind, message } => {
            if !args.json {
                eprintln!("{message}");
            }
            bail!("stitching failed ({kind})")
        }
    }
}
