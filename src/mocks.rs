use crate::errors::{FundusSegError, Result};
use crate::traits::SegmentationModel;
use ndarray::prelude::*;

/// モックモデルが各ピクセルに出力する値
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MockOutput {
    /// 全ピクセルで同じ確率
    Constant(f32),
    /// 入力の赤チャネルを全クラスにコピー
    RedChannel,
}

/// テスト用の [`SegmentationModel`] モック実装
#[derive(Debug, Clone)]
pub struct MockSegmentationModel {
    pub image_size: u32,
    pub class_count: usize,
    pub output: MockOutput,
}

impl MockSegmentationModel {
    pub const fn new(image_size: u32, class_count: usize, output: MockOutput) -> Self {
        Self {
            image_size,
            class_count,
            output,
        }
    }

    pub const fn constant(image_size: u32, class_count: usize, probability: f32) -> Self {
        Self::new(image_size, class_count, MockOutput::Constant(probability))
    }
}

impl SegmentationModel for MockSegmentationModel {
    fn predict(&self, batch: ArrayView4<f32>) -> Result<Array4<f32>> {
        let (n, h, w, c) = batch.dim();
        if c != 3 {
            return Err(FundusSegError::Shape {
                subject: "model input".to_string(),
                reason: format!("has {c} channels, expected 3"),
            });
        }
        Ok(match self.output {
            MockOutput::Constant(p) => Array4::from_elem((n, h, w, self.class_count), p),
            MockOutput::RedChannel => {
                Array4::from_shape_fn((n, h, w, self.class_count), |(i, y, x, _)| {
                    batch[[i, y, x, 0]]
                })
            }
        })
    }

    fn image_size(&self) -> u32 {
        self.image_size
    }

    fn class_count(&self) -> usize {
        self.class_count
    }
}

/// デフォルト契約（512x512 入力、4 病変クラス）のモックを作成
pub const fn create_mock_model() -> MockSegmentationModel {
    MockSegmentationModel::constant(512, 4, 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_model_creation() {
        let mock = create_mock_model();
        assert_eq!(mock.image_size(), 512);
        assert_eq!(mock.class_count(), 4);
    }

    #[test]
    fn test_mock_model_predict_shape() -> Result<()> {
        let mock = MockSegmentationModel::constant(16, 4, 0.25);
        let input = Array4::<f32>::zeros((2, 16, 16, 3));

        let result = mock.predict(input.view())?;
        assert_eq!(result.shape(), &[2, 16, 16, 4]);
        assert!(result.iter().all(|&p| p == 0.25));
        Ok(())
    }

    #[test]
    fn test_mock_model_red_channel() -> Result<()> {
        let mock = MockSegmentationModel::new(2, 3, MockOutput::RedChannel);
        let mut input = Array4::<f32>::zeros((1, 2, 2, 3));
        input[[0, 1, 0, 0]] = 0.9;

        let result = mock.predict(input.view())?;
        assert_eq!(result[[0, 1, 0, 2]], 0.9);
        assert_eq!(result[[0, 0, 0, 1]], 0.0);
        Ok(())
    }

    #[test]
    fn test_mock_model_rejects_bad_channels() {
        let mock = create_mock_model();
        let input = Array4::<f32>::zeros((1, 4, 4, 1));
        assert!(mock.predict(input.view()).is_err());
    }
}
