use std::io::Write;
use std::path::{Path, PathBuf};

use image::GrayImage;
use ndarray::prelude::*;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info};

use crate::archive::{write_atomically, Dataset};
use crate::config::lesion_class_names;
use crate::errors::{FundusSegError, Result};
use crate::image_codec::tensor_to_rgb;
use crate::imageops_ai::blend_mask;
use crate::metrics::{MetricsAccumulator, MetricsReport};
use crate::progress_tracker::progress_bar;
use crate::traits::SegmentationModel;

pub const DEFAULT_THRESHOLD: f32 = 0.5;
pub const DEFAULT_BATCH_SIZE: usize = 8;
pub const MASKS_DIR: &str = "masks";
pub const OVERLAYS_DIR: &str = "overlays";
pub const SUMMARY_FILE: &str = "summary.json";
/// Weight of the combined mask in overlays; the image keeps the rest.
pub const OVERLAY_MASK_WEIGHT: f32 = 0.3;

#[derive(Debug, Clone)]
pub struct InferenceOptions {
    /// Probabilities strictly above this value are foreground.
    pub threshold: f32,
    pub batch_size: usize,
    pub output_dir: PathBuf,
    /// Names used in mask file names. Defaults to the lesion class names.
    pub class_names: Option<Vec<String>>,
}

impl InferenceOptions {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            batch_size: DEFAULT_BATCH_SIZE,
            output_dir: output_dir.into(),
            class_names: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InferenceSummary {
    pub archive: PathBuf,
    pub samples: usize,
    pub threshold: f32,
    pub class_names: Vec<String>,
    pub masks_dir: PathBuf,
    pub overlays_dir: PathBuf,
    /// Predictions scored against the masks stored in the archive.
    pub metrics: MetricsReport,
}

/// Runs a segmentation model over a persisted split and writes per-class
/// masks, overlays and a metrics summary.
#[derive(Debug, Clone)]
pub struct InferenceRunner {
    options: InferenceOptions,
}

impl InferenceRunner {
    pub fn new(options: InferenceOptions) -> Result<Self> {
        if !(0.0..=1.0).contains(&options.threshold) {
            return Err(FundusSegError::Validation {
                field: "threshold".to_string(),
                reason: format!("must lie within [0, 1], got {}", options.threshold),
            });
        }
        if options.batch_size == 0 {
            return Err(FundusSegError::Validation {
                field: "batch_size".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(Self { options })
    }

    pub fn options(&self) -> &InferenceOptions {
        &self.options
    }

    /// Output files are named by sample index and class, so re-running into
    /// the same directory overwrites instead of duplicating.
    pub fn run<M>(&self, archive: &Path, model: &M) -> Result<InferenceSummary>
    where
        M: SegmentationModel + ?Sized,
    {
        let dataset = Dataset::load_expecting(archive, model.image_size(), model.class_count())?;
        let class_names = self.class_names(model.class_count())?;

        let masks_dir = self.options.output_dir.join(MASKS_DIR);
        let overlays_dir = self.options.output_dir.join(OVERLAYS_DIR);
        for dir in [&masks_dir, &overlays_dir] {
            std::fs::create_dir_all(dir).map_err(|e| FundusSegError::FileSystem {
                path: dir.clone(),
                operation: "output directory creation".to_string(),
                source: e,
            })?;
        }

        let images = dataset.images();
        let targets = dataset.masks();
        let mut accumulator = MetricsAccumulator::new(class_names.clone());
        let bar = progress_bar(dataset.len(), "inference");

        let batch_size = self.options.batch_size;
        for (batch_index, (image_batch, target_batch)) in images
            .axis_chunks_iter(Axis(0), batch_size)
            .zip(targets.axis_chunks_iter(Axis(0), batch_size))
            .enumerate()
        {
            let probabilities = model.predict(image_batch)?;
            check_prediction_shape(&probabilities, image_batch.len_of(Axis(0)), model)?;
            let predicted = binarize_probabilities(probabilities.view(), self.options.threshold);
            accumulator.update(predicted.view(), target_batch)?;

            let offset = batch_index * batch_size;
            (0..predicted.len_of(Axis(0)))
                .into_par_iter()
                .try_for_each(|j| {
                    self.write_sample(
                        offset + j,
                        image_batch.index_axis(Axis(0), j),
                        predicted.index_axis(Axis(0), j),
                        &class_names,
                        &masks_dir,
                        &overlays_dir,
                    )
                })?;
            bar.inc(predicted.len_of(Axis(0)) as u64);
        }
        bar.finish_and_clear();

        let summary = InferenceSummary {
            archive: archive.to_path_buf(),
            samples: dataset.len(),
            threshold: self.options.threshold,
            class_names,
            masks_dir,
            overlays_dir,
            metrics: accumulator.report(),
        };
        let summary_path = self.options.output_dir.join(SUMMARY_FILE);
        write_atomically(&summary_path, |file| {
            serde_json::to_writer_pretty(&mut *file, &summary)?;
            file.write_all(b"\n")
        })?;

        info!(
            archive = %archive.display(),
            samples = summary.samples,
            dice = summary.metrics.overall.dice,
            "inference finished"
        );
        Ok(summary)
    }

    fn class_names(&self, class_count: usize) -> Result<Vec<String>> {
        match &self.options.class_names {
            Some(names) if names.len() != class_count => Err(FundusSegError::Validation {
                field: "class_names".to_string(),
                reason: format!(
                    "lists {} names but the model predicts {class_count} classes",
                    names.len()
                ),
            }),
            Some(names) => Ok(names.clone()),
            None => Ok(lesion_class_names(class_count)),
        }
    }

    fn write_sample(
        &self,
        index: usize,
        image: ArrayView3<f32>,
        predicted: ArrayView3<f32>,
        class_names: &[String],
        masks_dir: &Path,
        overlays_dir: &Path,
    ) -> Result<()> {
        for (k, name) in class_names.iter().enumerate() {
            let path = masks_dir.join(mask_file_name(index, name));
            save_image(&mask_to_luma(predicted.index_axis(Axis(2), k)), &path)?;
        }

        let path = overlays_dir.join(overlay_file_name(index));
        let overlay = render_overlay(image, combine_classes(predicted).view())?;
        overlay
            .save(&path)
            .map_err(|e| image_error(&path, "overlay write", e))?;
        debug!(index, "sample written");
        Ok(())
    }
}

/// `image_{index}_{class}.png`
pub fn mask_file_name(index: usize, class_name: &str) -> String {
    format!("image_{index}_{class_name}.png")
}

/// `image_{index}_overlay.png`
pub fn overlay_file_name(index: usize) -> String {
    format!("image_{index}_overlay.png")
}

/// `p > threshold -> 1.0`, everything else `0.0`.
pub fn binarize_probabilities<D: Dimension>(
    probabilities: ArrayView<'_, f32, D>,
    threshold: f32,
) -> Array<f32, D> {
    probabilities.mapv(|p| if p > threshold { 1.0 } else { 0.0 })
}

/// Logical OR of a binary `[H, W, C]` mask across its classes.
pub fn combine_classes(mask: ArrayView3<f32>) -> Array2<f32> {
    mask.fold_axis(Axis(2), 0.0, |&acc, &v| acc.max(v))
}

pub fn mask_to_luma(mask: ArrayView2<f32>) -> GrayImage {
    let (height, width) = mask.dim();
    GrayImage::from_fn(width as u32, height as u32, |x, y| {
        image::Luma([if mask[[y as usize, x as usize]] > 0.5 { 255 } else { 0 }])
    })
}

/// Blends a binary mask over the image at [`OVERLAY_MASK_WEIGHT`].
pub fn render_overlay(image: ArrayView3<f32>, mask: ArrayView2<f32>) -> Result<image::RgbImage> {
    let rgb = tensor_to_rgb(image)?;
    let luma = mask_to_luma(mask);
    blend_mask(&rgb, &luma, OVERLAY_MASK_WEIGHT).map_err(|e| FundusSegError::ImageProcessing {
        path: "<overlay>".to_string(),
        operation: "mask blending".to_string(),
        source: e.into(),
    })
}

fn check_prediction_shape<M>(prediction: &Array4<f32>, batch: usize, model: &M) -> Result<()>
where
    M: SegmentationModel + ?Sized,
{
    let size = model.image_size() as usize;
    let expected = (batch, size, size, model.class_count());
    if prediction.dim() != expected {
        return Err(FundusSegError::Shape {
            subject: "model output".to_string(),
            reason: format!("is {:?}, expected {expected:?}", prediction.shape()),
        });
    }
    Ok(())
}

fn save_image(image: &GrayImage, path: &Path) -> Result<()> {
    image
        .save(path)
        .map_err(|e| image_error(path, "mask write", e))
}

fn image_error(path: &Path, operation: &str, source: image::ImageError) -> FundusSegError {
    FundusSegError::ImageProcessing {
        path: path.display().to_string(),
        operation: operation.to_string(),
        source: Box::new(source),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{MockOutput, MockSegmentationModel};
    use tempfile::TempDir;

    fn write_archive(dir: &Path, samples: usize, size: usize, classes: usize) -> PathBuf {
        let mut images = Array4::<f32>::zeros((samples, size, size, 3));
        let mut masks = Array4::<f32>::zeros((samples, size, size, classes));
        images.slice_mut(s![.., ..size / 2, .., 0]).fill(0.8);
        masks.slice_mut(s![.., ..size / 2, .., ..]).fill(1.0);
        let path = dir.join("test.npz");
        Dataset::new(images, masks).unwrap().save(&path).unwrap();
        path
    }

    #[test]
    fn test_threshold_is_strict() {
        let probabilities = array![0.5_f32, 0.51, 0.49, 1.0, 0.0];
        let binary = binarize_probabilities(probabilities.view(), 0.5);
        assert_eq!(binary, array![0.0_f32, 1.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_combine_classes_is_logical_or() {
        let mut mask = Array3::<f32>::zeros((2, 2, 3));
        mask[[0, 0, 2]] = 1.0;
        mask[[1, 1, 0]] = 1.0;
        let combined = combine_classes(mask.view());
        assert_eq!(combined, array![[1.0_f32, 0.0], [0.0, 1.0]]);
    }

    #[test]
    fn test_overlay_size_mismatch_is_image_processing_error() {
        let image = Array3::<f32>::zeros((4, 4, 3));
        let mask = Array2::<f32>::zeros((4, 2));
        match render_overlay(image.view(), mask.view()) {
            Err(FundusSegError::ImageProcessing { operation, source, .. }) => {
                assert_eq!(operation, "mask blending");
                assert!(source.to_string().contains("dimensions"));
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_file_names() {
        assert_eq!(mask_file_name(3, "HE"), "image_3_HE.png");
        assert_eq!(overlay_file_name(0), "image_0_overlay.png");
    }

    #[test]
    fn test_run_writes_outputs_and_scores() -> Result<()> {
        let temp_dir = TempDir::new().unwrap();
        let archive = write_archive(temp_dir.path(), 3, 8, 4);
        let out = temp_dir.path().join("results");
        let model = MockSegmentationModel::new(8, 4, MockOutput::RedChannel);
        let runner = InferenceRunner::new(InferenceOptions {
            batch_size: 2,
            ..InferenceOptions::new(&out)
        })?;

        let summary = runner.run(&archive, &model)?;

        assert_eq!(summary.samples, 3);
        assert_eq!(summary.class_names, ["MA", "HE", "SE", "EX"]);
        assert!((summary.metrics.overall.dice - 1.0).abs() < 1e-6);
        for i in 0..3 {
            for name in &summary.class_names {
                assert!(out.join(MASKS_DIR).join(mask_file_name(i, name)).is_file());
            }
            assert!(out.join(OVERLAYS_DIR).join(overlay_file_name(i)).is_file());
        }
        assert!(out.join(SUMMARY_FILE).is_file());

        let mask = image::open(out.join(MASKS_DIR).join(mask_file_name(2, "EX")))
            .unwrap()
            .to_luma8();
        assert_eq!(mask.get_pixel(0, 0).0, [255]);
        assert_eq!(mask.get_pixel(0, 7).0, [0]);

        let overlay = image::open(out.join(OVERLAYS_DIR).join(overlay_file_name(0)))
            .unwrap()
            .to_rgb8();
        // 赤 0.8 -> 204、白マスクと 0.3 でブレンド
        assert_eq!(overlay.get_pixel(0, 0).0, [219, 77, 77]);
        assert_eq!(overlay.get_pixel(0, 7).0, [0, 0, 0]);
        Ok(())
    }

    #[test]
    fn test_rerun_overwrites_outputs() -> Result<()> {
        let temp_dir = TempDir::new().unwrap();
        let archive = write_archive(temp_dir.path(), 2, 4, 2);
        let out = temp_dir.path().join("results");
        let model = MockSegmentationModel::constant(4, 2, 0.9);
        let runner = InferenceRunner::new(InferenceOptions::new(&out))?;

        runner.run(&archive, &model)?;
        runner.run(&archive, &model)?;

        let masks = std::fs::read_dir(out.join(MASKS_DIR)).unwrap().count();
        let overlays = std::fs::read_dir(out.join(OVERLAYS_DIR)).unwrap().count();
        assert_eq!(masks, 4);
        assert_eq!(overlays, 2);
        Ok(())
    }

    #[test]
    fn test_contract_mismatch_is_format_error() {
        let temp_dir = TempDir::new().unwrap();
        let archive = write_archive(temp_dir.path(), 1, 8, 4);
        let model = MockSegmentationModel::constant(16, 4, 0.0);
        let options = InferenceOptions::new(temp_dir.path().join("out"));
        let runner = InferenceRunner::new(options).unwrap();

        assert!(matches!(
            runner.run(&archive, &model),
            Err(FundusSegError::Format { .. })
        ));
    }

    #[test]
    fn test_options_validation() {
        let options = InferenceOptions {
            threshold: 1.5,
            ..InferenceOptions::new("out")
        };
        assert!(InferenceRunner::new(options).is_err());

        let options = InferenceOptions {
            batch_size: 0,
            ..InferenceOptions::new("out")
        };
        assert!(InferenceRunner::new(options).is_err());
    }
}
