use std::path::{Path, PathBuf};
use std::thread;

use crate::errors::{FundusSegError, Result};

pub const DEFAULT_FUNDUS_DIR: &str = "data/diaretdb1/resources/images/diaretdb0_fundus_images";
pub const DEFAULT_MASK_DIR: &str = "data/diaretdb1/resources/images/diaretdb0_binary_masks";
pub const DEFAULT_OUTPUT_DIR: &str = "data/processed";
pub const DEFAULT_TARGET_RESOLUTION: u32 = 512;
pub const DEFAULT_CLASS_COUNT: usize = 4;
pub const DEFAULT_SPLIT_RATIO: f64 = 0.8;
pub const DEFAULT_SEED: u64 = 42;
pub const DEFAULT_FAILURE_THRESHOLD: f64 = 0.5;
pub const DEFAULT_MASK_SUFFIX: &str = "_valid";
pub const DEFAULT_MASK_EXTENSION: &str = "png";

/// チャネル順の病変クラスコード: 毛細血管瘤、出血、軟性白斑、硬性白斑
pub const LESION_CLASSES: [&str; 4] = ["MA", "HE", "SE", "EX"];

/// 画像IDからマスクファイル名を導出する規則: `{image_id}{suffix}.{extension}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskNaming {
    pub suffix: String,
    pub extension: String,
}

impl MaskNaming {
    pub fn new(suffix: impl Into<String>, extension: impl Into<String>) -> Self {
        Self {
            suffix: suffix.into(),
            extension: extension.into().trim_start_matches('.').to_string(),
        }
    }

    pub fn mask_file_name(&self, image_id: &str) -> String {
        format!("{}{}.{}", image_id, self.suffix, self.extension)
    }

    pub fn mask_path(&self, mask_dir: &Path, image_id: &str) -> PathBuf {
        mask_dir.join(self.mask_file_name(image_id))
    }
}

impl Default for MaskNaming {
    fn default() -> Self {
        Self::new(DEFAULT_MASK_SUFFIX, DEFAULT_MASK_EXTENSION)
    }
}

/// パイプライン設定（各コンポーネントに明示的に渡す）
#[derive(Debug, Clone)]
pub struct Config {
    pub fundus_dir: PathBuf,
    pub mask_dir: PathBuf,
    pub output_dir: PathBuf,
    pub target_resolution: u32,
    pub class_count: usize,
    pub split_ratio: f64,
    pub seed: u64,
    /// 分割ごとに許容する失敗ペアの最大割合
    pub failure_threshold: f64,
    pub mask_naming: MaskNaming,
    pub workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fundus_dir: DEFAULT_FUNDUS_DIR.into(),
            mask_dir: DEFAULT_MASK_DIR.into(),
            output_dir: DEFAULT_OUTPUT_DIR.into(),
            target_resolution: DEFAULT_TARGET_RESOLUTION,
            class_count: DEFAULT_CLASS_COUNT,
            split_ratio: DEFAULT_SPLIT_RATIO,
            seed: DEFAULT_SEED,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            mask_naming: MaskNaming::default(),
            workers: default_workers(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.target_resolution == 0 {
            return Err(validation("target_resolution", "must be greater than zero"));
        }
        if self.class_count == 0 {
            return Err(validation("class_count", "must be greater than zero"));
        }
        if !(self.split_ratio > 0.0 && self.split_ratio < 1.0) {
            return Err(validation(
                "split_ratio",
                &format!("must lie strictly between 0 and 1, got {}", self.split_ratio),
            ));
        }
        if !(0.0..=1.0).contains(&self.failure_threshold) {
            return Err(validation(
                "failure_threshold",
                &format!("must lie within [0, 1], got {}", self.failure_threshold),
            ));
        }
        if self.workers == 0 {
            return Err(validation("workers", "must be greater than zero"));
        }
        if self.mask_naming.extension.is_empty() {
            return Err(validation("mask_naming.extension", "must not be empty"));
        }
        Ok(())
    }
}

/// `class_count` 個の出力チャネルのクラス名
pub fn lesion_class_names(class_count: usize) -> Vec<String> {
    (0..class_count)
        .map(|k| {
            LESION_CLASSES
                .get(k)
                .map_or_else(|| format!("C{k}"), |name| (*name).to_string())
        })
        .collect()
}

pub fn default_workers() -> usize {
    thread::available_parallelism().map_or(1, |n| n.get())
}

fn validation(field: &str, reason: &str) -> FundusSegError {
    FundusSegError::Validation {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.target_resolution, 512);
        assert_eq!(config.class_count, 4);
        assert_eq!(config.seed, 42);
    }

    #[test]
    fn test_validate_rejects_bad_ratio() {
        for ratio in [0.0, 1.0, -0.1, 1.5, f64::NAN] {
            let config = Config {
                split_ratio: ratio,
                ..Config::default()
            };
            match config.validate() {
                Err(FundusSegError::Validation { field, .. }) => assert_eq!(field, "split_ratio"),
                other => panic!("expected validation error for {ratio}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        let config = Config {
            target_resolution: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            class_count: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mask_naming() {
        let naming = MaskNaming::new("_valid", ".png");
        assert_eq!(naming.mask_file_name("image001"), "image001_valid.png");
        assert_eq!(
            naming.mask_path(Path::new("masks"), "image001"),
            Path::new("masks/image001_valid.png")
        );
    }

    #[test]
    fn test_lesion_class_names() {
        assert_eq!(lesion_class_names(4), vec!["MA", "HE", "SE", "EX"]);
        assert_eq!(lesion_class_names(2), vec!["MA", "HE"]);
        assert_eq!(lesion_class_names(6)[4..], ["C4".to_string(), "C5".to_string()]);
    }
}
