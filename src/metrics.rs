use ndarray::prelude::*;
use serde::Serialize;

use crate::errors::{FundusSegError, Result};

/// Additive smoothing applied to every ratio, so empty masks score 1.
pub const SMOOTH: f64 = 1e-6;

/// Pixel-level confusion counts of a binary prediction against a binary target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConfusionCounts {
    pub true_positive: u64,
    pub false_positive: u64,
    pub false_negative: u64,
    pub true_negative: u64,
}

impl ConfusionCounts {
    /// Counts over two equally shaped arrays where values `> 0.5` are foreground.
    pub fn from_arrays<D: Dimension>(
        prediction: ArrayView<'_, f32, D>,
        target: ArrayView<'_, f32, D>,
    ) -> Result<Self> {
        if prediction.shape() != target.shape() {
            return Err(FundusSegError::Shape {
                subject: "prediction".to_string(),
                reason: format!(
                    "{:?} does not match target {:?}",
                    prediction.shape(),
                    target.shape()
                ),
            });
        }
        let mut counts = Self::default();
        ndarray::Zip::from(&prediction)
            .and(&target)
            .for_each(|&p, &t| counts.record(p > 0.5, t > 0.5));
        Ok(counts)
    }

    fn record(&mut self, predicted: bool, actual: bool) {
        match (predicted, actual) {
            (true, true) => self.true_positive += 1,
            (true, false) => self.false_positive += 1,
            (false, true) => self.false_negative += 1,
            (false, false) => self.true_negative += 1,
        }
    }

    pub fn merge(&mut self, other: &Self) {
        self.true_positive += other.true_positive;
        self.false_positive += other.false_positive;
        self.false_negative += other.false_negative;
        self.true_negative += other.true_negative;
    }

    pub fn metrics(&self) -> SegmentationMetrics {
        let tp = self.true_positive as f64;
        let fp = self.false_positive as f64;
        let fn_ = self.false_negative as f64;
        let tn = self.true_negative as f64;
        SegmentationMetrics {
            dice: (2.0 * tp + SMOOTH) / (2.0 * tp + fp + fn_ + SMOOTH),
            iou: (tp + SMOOTH) / (tp + fp + fn_ + SMOOTH),
            sensitivity: (tp + SMOOTH) / (tp + fn_ + SMOOTH),
            specificity: (tn + SMOOTH) / (tn + fp + SMOOTH),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SegmentationMetrics {
    pub dice: f64,
    pub iou: f64,
    pub sensitivity: f64,
    pub specificity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassMetrics {
    pub class: String,
    pub counts: ConfusionCounts,
    pub metrics: SegmentationMetrics,
}

/// Per-class and pooled metrics for a batch of `[.., C]` predictions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsReport {
    pub per_class: Vec<ClassMetrics>,
    pub overall: SegmentationMetrics,
}

/// Accumulates confusion counts per class over any number of batches.
#[derive(Debug, Clone)]
pub struct MetricsAccumulator {
    class_names: Vec<String>,
    counts: Vec<ConfusionCounts>,
}

impl MetricsAccumulator {
    pub fn new(class_names: Vec<String>) -> Self {
        let counts = vec![ConfusionCounts::default(); class_names.len()];
        Self {
            class_names,
            counts,
        }
    }

    /// Adds binary predictions and targets whose last axis is the class axis.
    pub fn update<D: Dimension + ndarray::RemoveAxis>(
        &mut self,
        prediction: ArrayView<'_, f32, D>,
        target: ArrayView<'_, f32, D>,
    ) -> Result<()> {
        let class_axis = Axis(prediction.ndim().saturating_sub(1));
        let classes = prediction.len_of(class_axis);
        if classes != self.counts.len() {
            return Err(FundusSegError::Shape {
                subject: "prediction".to_string(),
                reason: format!("has {classes} classes, expected {}", self.counts.len()),
            });
        }
        for (k, counts) in self.counts.iter_mut().enumerate() {
            let batch = ConfusionCounts::from_arrays(
                prediction.index_axis(class_axis, k),
                target.index_axis(class_axis, k),
            )?;
            counts.merge(&batch);
        }
        Ok(())
    }

    pub fn report(&self) -> MetricsReport {
        let mut pooled = ConfusionCounts::default();
        let per_class = self
            .class_names
            .iter()
            .zip(&self.counts)
            .map(|(class, counts)| {
                pooled.merge(counts);
                ClassMetrics {
                    class: class.clone(),
                    counts: *counts,
                    metrics: counts.metrics(),
                }
            })
            .collect();
        MetricsReport {
            per_class,
            overall: pooled.metrics(),
        }
    }
}
