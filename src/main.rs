use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use clap::{Args, Parser, Subcommand};

use fundus_seg::config::{
    default_workers, DEFAULT_CLASS_COUNT, DEFAULT_FAILURE_THRESHOLD, DEFAULT_FUNDUS_DIR,
    DEFAULT_MASK_DIR, DEFAULT_MASK_EXTENSION, DEFAULT_MASK_SUFFIX, DEFAULT_OUTPUT_DIR,
    DEFAULT_SEED, DEFAULT_SPLIT_RATIO, DEFAULT_TARGET_RESOLUTION,
};
use fundus_seg::inference::{DEFAULT_BATCH_SIZE, DEFAULT_THRESHOLD};
use fundus_seg::split::{materialize, Split};
use fundus_seg::{
    init_tracing, Analyzer, BuildReport, Config, DatasetBuilder, InferenceOptions,
    InferenceRunner, MaskNaming, ModelOptions, NamedModel, OnnxModel, SplitAssigner,
};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Pair raw images with masks and copy them into train/test directories
    Prepare {
        #[command(flatten)]
        sources: SourceArgs,

        #[command(flatten)]
        split: SplitArgs,

        #[arg(short, long, default_value = "data/split")]
        output_dir: PathBuf,
    },
    /// Encode prepared train/test directories into archives
    Preprocess {
        /// Directory holding `train/` and `test/`, each with `images/` and `masks/`
        #[arg(short, long)]
        input_dir: PathBuf,

        #[arg(short, long, default_value = DEFAULT_OUTPUT_DIR)]
        output_dir: PathBuf,

        #[arg(long, default_value = DEFAULT_MASK_SUFFIX)]
        mask_suffix: String,

        #[arg(long, default_value = DEFAULT_MASK_EXTENSION)]
        mask_extension: String,

        #[command(flatten)]
        encoding: EncodingArgs,
    },
    /// Pair, split and encode raw data into archives in one pass
    Build {
        #[command(flatten)]
        sources: SourceArgs,

        #[command(flatten)]
        split: SplitArgs,

        #[arg(short, long, default_value = DEFAULT_OUTPUT_DIR)]
        output_dir: PathBuf,

        #[command(flatten)]
        encoding: EncodingArgs,
    },
    /// Run an ONNX model over an archive and write masks, overlays and metrics
    Infer {
        #[arg(short, long)]
        archive: PathBuf,

        #[arg(short, long)]
        model_path: PathBuf,

        #[arg(short, long, default_value = "results")]
        output_dir: PathBuf,

        #[arg(short, long, default_value_t = DEFAULT_THRESHOLD)]
        threshold: f32,

        #[arg(short, long, default_value_t = DEFAULT_BATCH_SIZE)]
        batch_size: usize,

        #[command(flatten)]
        model: ModelArgs,
    },
    /// Analyze a single fundus photograph with one or more ONNX models
    Analyze {
        #[arg(short, long)]
        image: PathBuf,

        /// `name=path.onnx`, repeatable
        #[arg(short, long = "model", value_parser = parse_named_path, required = true)]
        models: Vec<(String, PathBuf)>,

        /// Binary lesion mask to score predictions against
        #[arg(short, long)]
        ground_truth: Option<PathBuf>,

        #[arg(short, long, default_value = "results")]
        results_dir: PathBuf,

        #[arg(short, long, default_value_t = DEFAULT_THRESHOLD)]
        threshold: f32,

        #[command(flatten)]
        model: ModelArgs,
    },
}

#[derive(Args)]
struct SourceArgs {
    #[arg(long, default_value = DEFAULT_FUNDUS_DIR)]
    fundus_dir: PathBuf,

    #[arg(long, default_value = DEFAULT_MASK_DIR)]
    mask_dir: PathBuf,

    /// Appended to the image identifier to form the mask file name
    #[arg(long, default_value = DEFAULT_MASK_SUFFIX)]
    mask_suffix: String,

    #[arg(long, default_value = DEFAULT_MASK_EXTENSION)]
    mask_extension: String,
}

#[derive(Args)]
struct SplitArgs {
    #[arg(long, default_value_t = DEFAULT_SPLIT_RATIO)]
    split_ratio: f64,

    #[arg(long, default_value_t = DEFAULT_SEED)]
    seed: u64,
}

#[derive(Args)]
struct EncodingArgs {
    #[arg(short, long, default_value_t = DEFAULT_TARGET_RESOLUTION)]
    resolution: u32,

    #[arg(short, long, default_value_t = DEFAULT_CLASS_COUNT)]
    classes: usize,

    /// Largest tolerated fraction of failed pairs per split
    #[arg(long, default_value_t = DEFAULT_FAILURE_THRESHOLD)]
    failure_threshold: f64,

    #[arg(short = 'n', long, default_value_t = default_workers())]
    num_threads: usize,

    /// Print every excluded pair after the build
    #[arg(long)]
    list_exclusions: bool,
}

#[derive(Args)]
struct ModelArgs {
    #[arg(short, long, default_value_t = 0)]
    device_id: i32,

    /// Used when the model leaves its input size dynamic
    #[arg(long, default_value_t = DEFAULT_TARGET_RESOLUTION)]
    image_size: u32,

    /// Used when the model leaves its class count dynamic
    #[arg(long, default_value_t = DEFAULT_CLASS_COUNT)]
    class_count: usize,
}

impl ModelArgs {
    fn load(&self, path: &Path) -> Result<OnnxModel> {
        ensure!(path.exists(), "Model path does not exist: {}", path.display());
        let options = ModelOptions {
            device_id: self.device_id,
            image_size: self.image_size,
            class_count: self.class_count,
        };
        OnnxModel::new(path, options)
            .with_context(|| format!("Failed to load model: {}", path.display()))
    }
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Prepare {
            sources,
            split,
            output_dir,
        } => {
            let config = config_from(&sources, &split, output_dir.clone(), None);
            config.validate()?;
            let locator = fundus_seg::PairLocator::new(
                &config.fundus_dir,
                &config.mask_dir,
                config.mask_naming.clone(),
            );
            let pairing = locator.locate().context("Pair discovery failed")?;
            let assignment = SplitAssigner::new(config.split_ratio, config.seed)?
                .assign(pairing.pairings.clone());
            if assignment.test.is_empty() {
                tracing::warn!("test split is empty");
            }
            materialize(&assignment, &output_dir).context("Split materialization failed")?;
            println!(
                "{} train / {} test pairs written to {} ({} images without mask)",
                assignment.train.len(),
                assignment.test.len(),
                output_dir.display(),
                pairing.unresolved.len()
            );
            for image_id in &pairing.unresolved {
                println!("  no mask: {image_id}");
            }
        }
        Command::Preprocess {
            input_dir,
            output_dir,
            mask_suffix,
            mask_extension,
            encoding,
        } => {
            ensure!(
                input_dir.exists(),
                "Input directory does not exist: {}",
                input_dir.display()
            );
            let config = Config {
                output_dir,
                target_resolution: encoding.resolution,
                class_count: encoding.classes,
                failure_threshold: encoding.failure_threshold,
                workers: encoding.num_threads,
                mask_naming: MaskNaming::new(mask_suffix, mask_extension),
                ..Config::default()
            };
            let output = DatasetBuilder::new(config)?
                .build_from_split_root(&input_dir)
                .context("Preprocessing failed")?;
            print_report(&output.report, encoding.list_exclusions);
        }
        Command::Build {
            sources,
            split,
            output_dir,
            encoding,
        } => {
            let config = config_from(&sources, &split, output_dir, Some(&encoding));
            let output = DatasetBuilder::new(config)?
                .build()
                .context("Dataset build failed")?;
            print_report(&output.report, encoding.list_exclusions);
        }
        Command::Infer {
            archive,
            model_path,
            output_dir,
            threshold,
            batch_size,
            model,
        } => {
            ensure!(
                archive.exists(),
                "Archive does not exist: {}",
                archive.display()
            );
            let model = model.load(&model_path)?;
            let runner = InferenceRunner::new(InferenceOptions {
                threshold,
                batch_size,
                ..InferenceOptions::new(&output_dir)
            })?;
            let summary = runner.run(&archive, &model).context("Inference failed")?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Analyze {
            image,
            models,
            ground_truth,
            results_dir,
            threshold,
            model,
        } => {
            ensure!(image.exists(), "Image does not exist: {}", image.display());
            let named = models
                .iter()
                .map(|(name, path)| {
                    let loaded = model.load(path)?;
                    Ok(NamedModel::new(name.clone(), Box::new(loaded)))
                })
                .collect::<Result<Vec<_>>>()?;
            let report = Analyzer::new(&results_dir, threshold)?
                .analyze(&image, &named, ground_truth.as_deref())
                .context("Analysis failed")?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

fn config_from(
    sources: &SourceArgs,
    split: &SplitArgs,
    output_dir: PathBuf,
    encoding: Option<&EncodingArgs>,
) -> Config {
    let mut config = Config {
        fundus_dir: sources.fundus_dir.clone(),
        mask_dir: sources.mask_dir.clone(),
        output_dir,
        split_ratio: split.split_ratio,
        seed: split.seed,
        mask_naming: MaskNaming::new(&sources.mask_suffix, &sources.mask_extension),
        ..Config::default()
    };
    if let Some(encoding) = encoding {
        config.target_resolution = encoding.resolution;
        config.class_count = encoding.classes;
        config.failure_threshold = encoding.failure_threshold;
        config.workers = encoding.num_threads;
    }
    config
}

fn print_report(report: &BuildReport, list_exclusions: bool) {
    for split in Split::ALL {
        if let Some(summary) = report.split(split) {
            println!(
                "{split}: {} samples -> {}",
                summary.samples,
                summary.archive.display()
            );
        }
    }
    let excluded = report.excluded_count();
    println!("{excluded} pairs excluded");
    if list_exclusions {
        for image_id in &report.unresolved {
            println!("  {image_id}: no mask");
        }
        for failure in report.splits.iter().flat_map(|s| &s.failures) {
            println!("  {}: {}", failure.image_id, failure.error);
        }
    }
}

fn parse_named_path(value: &str) -> std::result::Result<(String, PathBuf), String> {
    let (name, path) = value
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=PATH, got `{value}`"))?;
    if name.is_empty() || path.is_empty() {
        return Err(format!("expected NAME=PATH, got `{value}`"));
    }
    Ok((name.to_string(), PathBuf::from(path)))
}
