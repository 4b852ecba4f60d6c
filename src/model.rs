use std::path::Path;

use crate::{
    errors::{FundusSegError, Result},
    traits::SegmentationModel,
};
use ndarray::prelude::*;
use ort::value::TensorRef;
use ort::{
    execution_providers::{CUDAExecutionProvider, TensorRTExecutionProvider},
    session::{builder::SessionBuilder, Session},
};
use parking_lot::Mutex;
use tracing::{info, warn};

/// Fallbacks used when the ONNX graph leaves spatial size or class count dynamic.
#[derive(Debug, Clone, Copy)]
pub struct ModelOptions {
    pub device_id: i32,
    pub image_size: u32,
    pub class_count: usize,
}

/// SegNet / U-Net++ exported to ONNX: NHWC float input, NHWC sigmoid output.
pub struct OnnxModel {
    image_size: u32,
    class_count: usize,
    input_name: String,
    output_name: String,
    session: Mutex<Session>,
}

impl OnnxModel {
    pub fn new(model_path: &Path, options: ModelOptions) -> Result<Self> {
        let mut session = SessionBuilder::new()
            .map_err(|e| model_error("session builder initialization", e))?
            .with_execution_providers([
                TensorRTExecutionProvider::default()
                    .with_device_id(options.device_id)
                    .build(),
                CUDAExecutionProvider::default()
                    .with_device_id(options.device_id)
                    .build(),
            ])
            .map_err(|e| model_error("execution provider registration", e))?
            .with_memory_pattern(true)
            .map_err(|e| model_error("memory pattern setup", e))?
            .commit_from_file(model_path)
            .map_err(|e| model_error(&format!("model load: {}", model_path.display()), e))?;

        let input = session.inputs.first().ok_or_else(|| missing("model input"))?;
        let output = session.outputs.first().ok_or_else(|| missing("model output"))?;
        let input_name = input.name.clone();
        let output_name = output.name.clone();
        let input_dims: Vec<i64> = input
            .input_type
            .tensor_shape()
            .map(|shape| shape.iter().copied().collect())
            .ok_or_else(|| missing("input tensor shape"))?;
        let output_dims: Vec<i64> = output
            .output_type
            .tensor_shape()
            .map(|shape| shape.iter().copied().collect())
            .ok_or_else(|| missing("output tensor shape"))?;

        if input_dims.len() != 4 || output_dims.len() != 4 {
            return Err(FundusSegError::Shape {
                subject: "model".to_string(),
                reason: format!(
                    "expects rank-4 NHWC tensors, got input {input_dims:?} \
                     and output {output_dims:?}"
                ),
            });
        }
        if input_dims[3] > 0 && input_dims[3] != 3 {
            return Err(FundusSegError::Shape {
                subject: "model input".to_string(),
                reason: format!("has {} channels, expected 3 (NHWC RGB)", input_dims[3]),
            });
        }

        let image_size = static_dim(input_dims[1]).map_or(options.image_size, |d| d as u32);
        let class_count = static_dim(output_dims[3]).unwrap_or(options.class_count);
        if image_size != options.image_size || class_count != options.class_count {
            warn!(
                image_size,
                class_count,
                "model shape overrides configured resolution/class count"
            );
        }

        // モデルの初期化
        let size = image_size as usize;
        let data = Array4::<f32>::zeros((1, size, size, 3));
        session
            .run(ort::inputs![input_name.as_str() => TensorRef::from_array_view(&data)
                .map_err(|e| model_error("warm-up tensor creation", e))?])
            .map_err(|e| model_error("model warm-up run", e))?;

        info!(
            path = %model_path.display(),
            image_size,
            class_count,
            "onnx model loaded"
        );

        Ok(Self {
            image_size,
            class_count,
            input_name,
            output_name,
            session: Mutex::new(session),
        })
    }
}

impl SegmentationModel for OnnxModel {
    fn predict(&self, batch: ArrayView4<f32>) -> Result<Array4<f32>> {
        let mut binding = self.session.lock();
        let outputs = binding.run(ort::inputs![
            self.input_name.as_str() => TensorRef::from_array_view(&batch.as_standard_layout())?
        ])?;
        Ok(outputs[self.output_name.as_str()]
            .try_extract_array::<f32>()?
            .into_dimensionality::<Ix4>()?
            .to_owned())
    }

    fn image_size(&self) -> u32 {
        self.image_size
    }

    fn class_count(&self) -> usize {
        self.class_count
    }
}

fn static_dim(dim: i64) -> Option<usize> {
    usize::try_from(dim).ok().filter(|&d| d > 0)
}

fn model_error(operation: &str, source: ort::Error) -> FundusSegError {
    FundusSegError::Model {
        operation: operation.to_string(),
        source: Box::new(source),
    }
}

fn missing(what: &str) -> FundusSegError {
    FundusSegError::Model {
        operation: "model introspection".to_string(),
        source: Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("{what} is not available"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_dim() {
        assert_eq!(static_dim(512), Some(512));
        assert_eq!(static_dim(-1), None);
        assert_eq!(static_dim(0), None);
    }
}
