// src/transform.rs
//
// Normalization applied to each cube after it is read.

use ndarray::ArrayD;
use std::fmt::Debug;

/// Element-wise transform over a loaded array.
pub trait Transform: Send + Sync + Debug {
    fn apply(&self, data: ArrayD<f32>) -> ArrayD<f32>;
}

/// Either `ln(1 + x)` or division by `mean(x) / len(x)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CosmoFlowTransform {
    pub apply_log: bool,
}

impl CosmoFlowTransform {
    pub fn new(apply_log: bool) -> Self {
        Self { apply_log }
    }
}

impl Default for CosmoFlowTransform {
    fn default() -> Self {
        Self { apply_log: true }
    }
}

impl Transform for CosmoFlowTransform {
    fn apply(&self, mut data: ArrayD<f32>) -> ArrayD<f32> {
        if data.is_empty() {
            return data;
        }
        if self.apply_log {
            data.mapv_inplace(f32::ln_1p);
        } else {
            let len = data.len() as f32;
            let mean = data.iter().map(|&v| v as f64).sum::<f64>() as f32 / len;
            let divisor = mean / len;
            data.mapv_inplace(|v| v / divisor);
        }
        data
    }
}

/// Cast the raw `i16` particle counts to `f32`.
pub fn to_f32(raw: &ArrayD<i16>) -> ArrayD<f32> {
    raw.mapv(f32::from)
}
