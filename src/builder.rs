use std::io::Write;
use std::path::{Path, PathBuf};

use indicatif::ParallelProgressIterator;
use ndarray::prelude::*;
use rayon::{prelude::*, ThreadPool, ThreadPoolBuilder};
use serde::Serialize;
use tracing::{info, warn};

use crate::archive::{Dataset, StagedWrites};
use crate::config::Config;
use crate::errors::{FundusSegError, Result};
use crate::image_codec::{ImageCodec, ImageTensor};
use crate::mask_encoder::{MaskEncoder, MaskTensor};
use crate::pairing::{PairLocator, Pairing, PairingReport};
use crate::progress_tracker::progress_bar;
use crate::split::{Split, SplitAssigner, SplitAssignment, IMAGES_DIR, MASKS_DIR};

pub const BUILD_REPORT_FILE: &str = "build_report.json";

/// A pair excluded from its split because it could not be encoded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EncodeFailure {
    pub image_id: String,
    pub image_path: PathBuf,
    pub mask_path: PathBuf,
    pub error: String,
}

/// Encoded samples of one split, in assignment order.
#[derive(Debug, Clone)]
pub struct SplitOutcome {
    pub split: Split,
    pub dataset: Dataset,
    /// Pairings that made it into `dataset`, row for row.
    pub included: Vec<Pairing>,
    pub failures: Vec<EncodeFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SplitSummary {
    pub split: Split,
    pub archive: PathBuf,
    pub samples: usize,
    pub image_ids: Vec<String>,
    pub failures: Vec<EncodeFailure>,
}

/// Written next to the archives as `build_report.json`.
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub target_resolution: u32,
    pub class_count: usize,
    pub split_ratio: f64,
    pub seed: u64,
    /// Image identifiers without a matching mask.
    pub unresolved: Vec<String>,
    pub duplicates: Vec<PathBuf>,
    /// Image files whose name is not valid UTF-8.
    pub skipped: Vec<PathBuf>,
    pub splits: Vec<SplitSummary>,
}

impl BuildReport {
    /// Images left out of every archive: missing masks, unusable file names
    /// and encode failures.
    pub fn excluded_count(&self) -> usize {
        self.unresolved.len()
            + self.skipped.len()
            + self
                .splits
                .iter()
                .map(|summary| summary.failures.len())
                .sum::<usize>()
    }

    pub fn split(&self, split: Split) -> Option<&SplitSummary> {
        self.splits.iter().find(|summary| summary.split == split)
    }
}

#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub train: SplitOutcome,
    pub test: SplitOutcome,
    pub report: BuildReport,
}

impl BuildOutput {
    pub fn get(&self, split: Split) -> &SplitOutcome {
        match split {
            Split::Train => &self.train,
            Split::Test => &self.test,
        }
    }
}

/// Turns paired raw files into the train and test archives.
pub struct DatasetBuilder {
    config: Config,
    image_codec: ImageCodec,
    mask_encoder: MaskEncoder,
    pool: ThreadPool,
}

impl DatasetBuilder {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.workers)
            .build()
            .map_err(|e| FundusSegError::Configuration {
                message: format!("cannot start {} encoding workers: {e}", config.workers),
            })?;
        Ok(Self {
            image_codec: ImageCodec::new(config.target_resolution),
            mask_encoder: MaskEncoder::new(config.target_resolution, config.class_count),
            config,
            pool,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn locator(&self) -> PairLocator {
        PairLocator::new(
            &self.config.fundus_dir,
            &self.config.mask_dir,
            self.config.mask_naming.clone(),
        )
    }

    /// Locates pairs in the raw directories, splits them and writes both archives.
    pub fn build(&self) -> Result<BuildOutput> {
        let pairing = self.locator().locate()?;
        let assigner = SplitAssigner::new(self.config.split_ratio, self.config.seed)?;
        let assignment = assigner.assign(pairing.pairings.clone());
        info!(
            pairs = assignment.len(),
            train = assignment.train.len(),
            test = assignment.test.len(),
            unresolved = pairing.unresolved.len(),
            "pairs assigned to splits"
        );
        self.build_from_assignment(&assignment, &pairing)
    }

    /// Encodes already materialized `{root}/{split}/images|masks` directories.
    pub fn build_from_split_root(&self, root: &Path) -> Result<BuildOutput> {
        let mut pairing = PairingReport::default();
        let mut assignment = SplitAssignment::default();
        for split in Split::ALL {
            let dir = split.dir(root);
            let report = PairLocator::new(
                dir.join(IMAGES_DIR),
                dir.join(MASKS_DIR),
                self.config.mask_naming.clone(),
            )
            .locate_or_empty()?;
            pairing.unresolved.extend(report.unresolved);
            pairing.duplicates.extend(report.duplicates);
            pairing.skipped.extend(report.skipped);
            pairing.pairings.extend(report.pairings.iter().cloned());
            match split {
                Split::Train => assignment.train = report.pairings,
                Split::Test => assignment.test = report.pairings,
            }
        }
        if assignment.is_empty() {
            return Err(FundusSegError::FileSystem {
                path: root.to_path_buf(),
                operation: "split directory discovery".to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no image/mask pairs in any split directory",
                ),
            });
        }
        self.build_from_assignment(&assignment, &pairing)
    }

    /// Encodes every split, then persists. Nothing is written if any split
    /// exceeds the failure threshold, and the two archives and the report are
    /// replaced together: a failed write leaves the previous build in place.
    pub fn build_from_assignment(
        &self,
        assignment: &SplitAssignment,
        pairing: &PairingReport,
    ) -> Result<BuildOutput> {
        for split in Split::ALL {
            if assignment.get(split).is_empty() {
                warn!(split = %split, "split is empty");
            }
        }

        let train = self.encode_split(Split::Train, assignment.get(Split::Train))?;
        let test = self.encode_split(Split::Test, assignment.get(Split::Test))?;

        let output_dir = &self.config.output_dir;
        let mut writes = StagedWrites::new();
        let mut splits = Vec::with_capacity(Split::ALL.len());
        for outcome in [&train, &test] {
            let archive = outcome.split.archive_path(output_dir);
            outcome.dataset.stage(&mut writes, &archive)?;
            splits.push(SplitSummary {
                split: outcome.split,
                archive,
                samples: outcome.dataset.len(),
                image_ids: outcome
                    .included
                    .iter()
                    .map(|p| p.image_id.clone())
                    .collect(),
                failures: outcome.failures.clone(),
            });
        }

        let report = BuildReport {
            target_resolution: self.config.target_resolution,
            class_count: self.config.class_count,
            split_ratio: self.config.split_ratio,
            seed: self.config.seed,
            unresolved: pairing.unresolved.clone(),
            duplicates: pairing.duplicates.clone(),
            skipped: pairing.skipped.clone(),
            splits,
        };
        stage_report(&mut writes, &output_dir.join(BUILD_REPORT_FILE), &report)?;
        writes.commit()?;

        for summary in &report.splits {
            info!(
                split = %summary.split,
                samples = summary.samples,
                path = %summary.archive.display(),
                "archive written"
            );
        }
        let excluded = report.excluded_count();
        if excluded > 0 {
            warn!(excluded, "pairs excluded from the dataset");
        }
        Ok(BuildOutput {
            train,
            test,
            report,
        })
    }

    /// Encodes one split into pre-sized buffers indexed by pairing position.
    ///
    /// Per-pair decode and shape failures are recorded and the pair dropped.
    /// Fails with [`FundusSegError::DatasetBuild`] when the failure rate
    /// exceeds the configured threshold.
    pub fn encode_split(&self, split: Split, pairings: &[Pairing]) -> Result<SplitOutcome> {
        let total = pairings.len();
        let size = self.config.target_resolution as usize;
        let classes = self.config.class_count;
        let mut images = Array4::<f32>::zeros((total, size, size, 3));
        let mut masks = Array4::<f32>::zeros((total, size, size, classes));

        let bar = progress_bar(total, format!("encoding {split}"));
        let outcomes: Vec<Option<EncodeFailure>> = self.pool.install(|| {
            images
                .axis_iter_mut(Axis(0))
                .into_par_iter()
                .zip(masks.axis_iter_mut(Axis(0)).into_par_iter())
                .zip(pairings.par_iter())
                .progress_with(bar.clone())
                .map(|((mut image_row, mut mask_row), pairing)| {
                    match self.encode_pair(pairing) {
                        Ok((image, mask)) => {
                            image_row.assign(&image);
                            mask_row.assign(&mask);
                            Ok(None)
                        }
                        Err(e) if !e.is_recoverable() => Err(e),
                        Err(e) => {
                            warn!(
                                image_id = %pairing.image_id,
                                error = %e,
                                "failed to encode pair, excluding"
                            );
                            Ok(Some(EncodeFailure {
                                image_id: pairing.image_id.clone(),
                                image_path: pairing.image_path.clone(),
                                mask_path: pairing.mask_path.clone(),
                                error: e.to_string(),
                            }))
                        }
                    }
                })
                .collect::<Result<_>>()
        })?;
        bar.finish_and_clear();

        let failed = outcomes.iter().filter(|outcome| outcome.is_some()).count();
        if total > 0 && failed as f64 / total as f64 > self.config.failure_threshold {
            return Err(FundusSegError::DatasetBuild {
                split,
                failed,
                total,
                threshold: self.config.failure_threshold,
            });
        }

        let mut included = Vec::with_capacity(total - failed);
        let mut kept_rows = Vec::with_capacity(total - failed);
        let mut failures = Vec::with_capacity(failed);
        for (row, (pairing, outcome)) in pairings.iter().zip(outcomes).enumerate() {
            match outcome {
                Some(failure) => failures.push(failure),
                None => {
                    kept_rows.push(row);
                    included.push(pairing.clone());
                }
            }
        }
        if failed > 0 {
            images = images.select(Axis(0), &kept_rows);
            masks = masks.select(Axis(0), &kept_rows);
        }

        info!(split = %split, samples = included.len(), failed, "split encoded");
        Ok(SplitOutcome {
            split,
            dataset: Dataset::new(images, masks)?,
            included,
            failures,
        })
    }

    pub fn encode_pair(&self, pairing: &Pairing) -> Result<(ImageTensor, MaskTensor)> {
        let image = self.image_codec.encode(&pairing.image_path)?;
        let mask = self.mask_encoder.encode(&pairing.mask_path)?;
        Ok((image, mask))
    }
}

fn stage_report(writes: &mut StagedWrites, path: &Path, report: &BuildReport) -> Result<()> {
    writes.stage(path, |file| {
        serde_json::to_writer_pretty(&mut *file, report)?;
        file.write_all(b"\n")
    })
}
