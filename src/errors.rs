use std::path::PathBuf;
use thiserror::Error;

use crate::split::Split;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Structured error types for the fundus segmentation pipeline.
///
/// Per-pair failures (`Decode`, `Shape`) are recovered by the dataset builder,
/// which records them and excludes the pair. `DatasetBuild`, `Format` and
/// `Persistence` are always fatal to the running operation.
#[derive(Error, Debug)]
pub enum FundusSegError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Validation error: {field} {reason}")]
    Validation { field: String, reason: String },

    #[error("Filesystem error: {operation} failed for {path:?}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Decode error: cannot read raster image {path:?}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("Shape error: {subject} {reason}")]
    Shape { subject: String, reason: String },

    #[error("Pairing error: no mask for image `{image_id}` (expected {expected_mask:?})")]
    Pairing {
        image_id: String,
        expected_mask: PathBuf,
    },

    #[error(
        "Dataset build error: {failed} of {total} pairs failed to encode in the {split} split \
         (allowed failure rate {threshold})"
    )]
    DatasetBuild {
        split: Split,
        failed: usize,
        total: usize,
        threshold: f64,
    },

    #[error("Format error: archive {path:?} {reason}")]
    Format { path: PathBuf, reason: String },

    #[error("Persistence error: {operation} failed for {path:?}")]
    Persistence {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Image processing error: {operation} failed (file: {path})")]
    ImageProcessing {
        path: String,
        operation: String,
        #[source]
        source: BoxError,
    },

    #[error("Model error: {operation} failed")]
    Model {
        operation: String,
        #[source]
        source: BoxError,
    },
}

pub type Result<T> = std::result::Result<T, FundusSegError>;

impl FundusSegError {
    /// Per-pair failures the dataset builder may exclude without aborting.
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Decode { .. } | Self::Shape { .. } | Self::Pairing { .. }
        )
    }
}

/// Fallback for I/O errors raised without path context. Code that knows the
/// path builds `FileSystem` directly.
impl From<std::io::Error> for FundusSegError {
    fn from(err: std::io::Error) -> Self {
        Self::FileSystem {
            path: PathBuf::from("unknown"),
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

impl From<image::ImageError> for FundusSegError {
    fn from(err: image::ImageError) -> Self {
        Self::ImageProcessing {
            path: "unknown".to_string(),
            operation: "image processing".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<ort::Error> for FundusSegError {
    fn from(err: ort::Error) -> Self {
        Self::Model {
            operation: "ort operation".to_string(),
            source: Box::new(err),
        }
    }
}

/// Shape errors from ndarray only occur while reshaping model tensors.
impl From<ndarray::ShapeError> for FundusSegError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::Model {
            operation: "tensor shape conversion".to_string(),
            source: Box::new(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        let shape = FundusSegError::Shape {
            subject: "image".to_string(),
            reason: "has zero width".to_string(),
        };
        assert!(shape.is_recoverable());

        let build = FundusSegError::DatasetBuild {
            split: Split::Train,
            failed: 6,
            total: 10,
            threshold: 0.5,
        };
        assert!(!build.is_recoverable());
        assert_eq!(
            build.to_string(),
            "Dataset build error: 6 of 10 pairs failed to encode in the train split \
             (allowed failure rate 0.5)"
        );
    }
}
