pub mod analysis;
pub mod archive;
pub mod builder;
pub mod config;
pub mod errors;
pub mod image_codec;
pub mod imageops_ai;
pub mod inference;
pub mod mask_encoder;
pub mod metrics;
pub mod model;
pub mod pairing;
pub mod split;
pub mod traits;

pub mod mocks;

mod progress_tracker;

pub use analysis::{AnalysisReport, Analyzer, NamedModel};
pub use archive::Dataset;
pub use builder::{BuildOutput, BuildReport, DatasetBuilder};
pub use config::{Config, MaskNaming};
pub use errors::{FundusSegError, Result};
pub use image_codec::ImageCodec;
pub use inference::{InferenceOptions, InferenceRunner, InferenceSummary};
pub use mask_encoder::MaskEncoder;
pub use model::{ModelOptions, OnnxModel};
pub use pairing::{PairLocator, Pairing, PairingReport};
pub use split::{Split, SplitAssigner, SplitAssignment};
pub use traits::*;

/// Installs the global `tracing` subscriber writing to stderr. `RUST_LOG`
/// overrides the default `info` level.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
