use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use image::GrayImage;
use ndarray::prelude::*;
use serde::Serialize;
use tracing::info;

use crate::config::lesion_class_names;
use crate::errors::{FundusSegError, Result};
use crate::image_codec::ImageCodec;
use crate::inference::{binarize_probabilities, combine_classes, render_overlay};
use crate::mask_encoder::MaskEncoder;
use crate::metrics::{MetricsAccumulator, MetricsReport};
use crate::traits::SegmentationModel;

pub const ORIGINAL_DIR: &str = "original";
pub const HEATMAP_DIR: &str = "heatmap";

/// A segmentation model under a display name, e.g. `segnet` or `unetpp`.
pub struct NamedModel {
    pub name: String,
    pub model: Box<dyn SegmentationModel>,
}

impl NamedModel {
    pub fn new(name: impl Into<String>, model: Box<dyn SegmentationModel>) -> Self {
        Self {
            name: name.into(),
            model,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelAnalysis {
    pub overlay: PathBuf,
    /// Per-pixel maximum class probability as grayscale.
    pub heatmap: PathBuf,
    /// Fraction of pixels predicted as each lesion class.
    pub lesion_fraction: BTreeMap<String, f64>,
    /// Present only when a ground-truth mask was supplied.
    pub metrics: Option<MetricsReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub filename: String,
    pub original: PathBuf,
    pub models: BTreeMap<String, ModelAnalysis>,
}

/// Runs uploaded fundus photographs through one or more models and stores the
/// renders under a results directory.
#[derive(Debug, Clone)]
pub struct Analyzer {
    results_dir: PathBuf,
    threshold: f32,
}

impl Analyzer {
    pub fn new(results_dir: impl Into<PathBuf>, threshold: f32) -> Result<Self> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(FundusSegError::Validation {
                field: "threshold".to_string(),
                reason: format!("must lie within [0, 1], got {threshold}"),
            });
        }
        Ok(Self {
            results_dir: results_dir.into(),
            threshold,
        })
    }

    pub fn analyze(
        &self,
        image_path: &Path,
        models: &[NamedModel],
        ground_truth: Option<&Path>,
    ) -> Result<AnalysisReport> {
        let upload_name = image_path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| FundusSegError::Validation {
                field: "image".to_string(),
                reason: format!("{} has no usable file name", image_path.display()),
            })?;
        let filename = sanitize_filename(upload_name);
        let stem = Path::new(&filename)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&filename)
            .to_string();

        let original = self.results_dir.join(ORIGINAL_DIR).join(&filename);
        create_dir(&self.results_dir.join(ORIGINAL_DIR))?;
        fs::copy(image_path, &original).map_err(|e| FundusSegError::FileSystem {
            path: original.clone(),
            operation: "upload copy".to_string(),
            source: e,
        })?;

        let mut report = AnalysisReport {
            filename,
            original,
            models: BTreeMap::new(),
        };
        for named in models {
            let analysis = self.analyze_with(image_path, &stem, named, ground_truth)?;
            report.models.insert(named.name.clone(), analysis);
        }
        info!(
            filename = %report.filename,
            models = report.models.len(),
            "analysis finished"
        );
        Ok(report)
    }

    fn analyze_with(
        &self,
        image_path: &Path,
        stem: &str,
        named: &NamedModel,
        ground_truth: Option<&Path>,
    ) -> Result<ModelAnalysis> {
        let model = &named.model;
        let image = ImageCodec::new(model.image_size()).encode(image_path)?;
        let probabilities = model.predict(image.view().insert_axis(Axis(0)))?;
        let size = model.image_size() as usize;
        if probabilities.dim() != (1, size, size, model.class_count()) {
            return Err(FundusSegError::Shape {
                subject: format!("{} output", named.name),
                reason: format!("is {:?} for a single {size}x{size} image", probabilities.shape()),
            });
        }
        let probabilities = probabilities.index_axis_move(Axis(0), 0);
        let predicted = binarize_probabilities(probabilities.view(), self.threshold);
        let class_names = lesion_class_names(model.class_count());

        let model_dir = sanitize_filename(&named.name);
        let overlay = self.results_dir.join(&model_dir).join(format!("{stem}.png"));
        let heatmap = self
            .results_dir
            .join(HEATMAP_DIR)
            .join(&model_dir)
            .join(format!("{stem}.png"));
        create_dir(&self.results_dir.join(&model_dir))?;
        create_dir(&self.results_dir.join(HEATMAP_DIR).join(&model_dir))?;

        render_overlay(image.view(), combine_classes(predicted.view()).view())?
            .save(&overlay)
            .map_err(|e| image_error(&overlay, "overlay write", e))?;
        probability_heatmap(probabilities.view())
            .save(&heatmap)
            .map_err(|e| image_error(&heatmap, "heatmap write", e))?;

        let lesion_fraction = class_names
            .iter()
            .enumerate()
            .map(|(k, name)| {
                let fraction = predicted.index_axis(Axis(2), k).mean().map_or(0.0, f64::from);
                (name.clone(), fraction)
            })
            .collect();

        let metrics = ground_truth
            .map(|mask_path| -> Result<MetricsReport> {
                let target =
                    MaskEncoder::new(model.image_size(), model.class_count()).encode(mask_path)?;
                let mut accumulator = MetricsAccumulator::new(class_names.clone());
                accumulator.update(predicted.view(), target.view())?;
                Ok(accumulator.report())
            })
            .transpose()?;

        Ok(ModelAnalysis {
            overlay,
            heatmap,
            lesion_fraction,
            metrics,
        })
    }
}

/// Spaces and path separators become underscores.
pub fn sanitize_filename(filename: &str) -> String {
    filename.replace([' ', '/', '\\'], "_")
}

fn probability_heatmap(probabilities: ArrayView3<f32>) -> GrayImage {
    let peak = probabilities.fold_axis(Axis(2), 0.0_f32, |&acc, &p| acc.max(p));
    let (height, width) = peak.dim();
    GrayImage::from_fn(width as u32, height as u32, |x, y| {
        let p = peak[[y as usize, x as usize]].clamp(0.0, 1.0);
        image::Luma([(p * 255.0).round() as u8])
    })
}

fn create_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| FundusSegError::FileSystem {
        path: dir.to_path_buf(),
        operation: "results directory creation".to_string(),
        source: e,
    })
}

fn image_error(path: &Path, operation: &str, source: image::ImageError) -> FundusSegError {
    FundusSegError::ImageProcessing {
        path: path.display().to_string(),
        operation: operation.to_string(),
        source: Box::new(source),
    }
}
