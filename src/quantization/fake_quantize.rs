//! Fake quantization for quantization-aware training
//!
//! Symmetric, zero-point-free quantization with bin count `bnt`:
//! `q = round(clip(x, -s, s) * bnt / s)` and `fq(x) = q * s / bnt`.
//! The backward pass is the straight-through estimator (identity).

use crate::ops::accumulate_grad;
use crate::{tape::Tape, Tensor};

/// Scales below this quantize everything to zero.
const MIN_SCALE: f32 = 1e-12;

/// Integer code of `x` under scale `s`, still stored as `f32`.
#[inline]
pub fn quant_code(x: f32, scale: f32, bnt: f32) -> f32 {
    if scale <= MIN_SCALE {
        return 0.0;
    }
    (x.clamp(-scale, scale) * bnt / scale).round()
}

#[inline]
pub fn fake_quant_value(x: f32, scale: f32, bnt: f32) -> f32 {
    quant_code(x, scale, bnt) * scale / bnt
}

pub fn abs_max(data: &[f32]) -> f32 {
    data.iter().fold(0.0f32, |m, v| m.max(v.abs()))
}

/// `abs_max` of each leading-axis slice.
pub fn channel_abs_max(data: &[f32], channels: usize) -> Vec<f32> {
    assert!(
        channels > 0 && data.len() % channels == 0,
        "channel_abs_max: {} values do not split into {} channels",
        data.len(),
        channels
    );
    data.chunks(data.len() / channels).map(abs_max).collect()
}

impl Tensor {
    /// Quantize-dequantize with one scale, or one scale per slice of axis 0.
    pub fn fake_quant_dequant(&self, scales: &[f32], bnt: f32) -> Tensor {
        let numel = self.numel();
        assert!(
            !scales.is_empty() && numel % scales.len() == 0,
            "fake_quant: {} scales do not divide {} elements",
            scales.len(),
            numel
        );
        let per = numel / scales.len();
        let out: Vec<f32> = self
            .data()
            .iter()
            .enumerate()
            .map(|(i, &x)| fake_quant_value(x, scales[i / per.max(1)], bnt))
            .collect();
        let mut output = Tensor::new(out, self.shape());

        if self.requires_grad {
            output.requires_grad = true;
            let input = self.clone();
            let out = output.clone();
            Tape::push_unary_op(self, &output, move || {
                if let Some(gout) = out.grad_ref() {
                    accumulate_grad(&input, &gout);
                }
            });
        }

        output
    }

    /// Integer codes (as `f32`) under a single scale. No gradient.
    pub fn quant_codes(&self, scale: f32, bnt: f32) -> Tensor {
        let codes: Vec<f32> = self
            .data()
            .iter()
            .map(|&x| quant_code(x, scale, bnt))
            .collect();
        Tensor::new(codes, self.shape())
    }
}
