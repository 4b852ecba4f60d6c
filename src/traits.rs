use crate::errors::Result;
use ndarray::prelude::*;

/// 推論と解析が利用するセグメンテーションモデルの抽象化
///
/// `[0, 1]` の RGB テンソル `[N, H, W, 3]` をクラスごとの確率 `[N, H, W, C]` に変換する。
/// `H = W = image_size()`、`C = class_count()` はデータセットの契約と一致すること。
pub trait SegmentationModel: Send + Sync {
    fn predict(&self, batch: ArrayView4<f32>) -> Result<Array4<f32>>;

    /// モデルの入力画像サイズ（高さ・幅）を取得
    fn image_size(&self) -> u32;

    fn class_count(&self) -> usize;
}

impl<M: SegmentationModel + ?Sized> SegmentationModel for Box<M> {
    fn predict(&self, batch: ArrayView4<f32>) -> Result<Array4<f32>> {
        (**self).predict(batch)
    }

    fn image_size(&self) -> u32 {
        (**self).image_size()
    }

    fn class_count(&self) -> usize {
        (**self).class_count()
    }
}
