//! Quantization-aware training configuration
//!
//! Option names and values follow the usual QAT config dictionaries, so a
//! JSON file like
//! `{"weight_quantize_type": "abs_max", "quantize_op_types": ["conv2d"]}`
//! deserializes directly. Anything left out takes its default.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightQuantizeType {
    /// One scale for the whole weight tensor.
    AbsMax,
    /// One scale per output channel.
    ChannelWiseAbsMax,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationQuantizeType {
    AbsMax,
    MovingAverageAbsMax,
    RangeAbsMax,
}

/// Op types the transform knows how to instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpType {
    Conv2d,
    DepthwiseConv2d,
    Mul,
}

impl OpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpType::Conv2d => "conv2d",
            OpType::DepthwiseConv2d => "depthwise_conv2d",
            OpType::Mul => "mul",
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QuantConfig {
    pub weight_quantize_type: WeightQuantizeType,
    pub activation_quantize_type: ActivationQuantizeType,
    pub quantize_op_types: Vec<OpType>,
    /// Converted programs keep quantize/dequantize pairs instead of integer weights.
    pub onnx_format: bool,
    pub weight_bits: u32,
    pub activation_bits: u32,
    /// Decay of `moving_average_abs_max`.
    pub moving_rate: f32,
    /// Number of batch maxima remembered by `range_abs_max`.
    pub window_size: usize,
    /// Layers whose name contains any of these substrings stay in float.
    pub not_quant_pattern: Vec<String>,
    /// When set, batch norm uses (and keeps) its running statistics during
    /// QAT training instead of batch statistics.
    pub freeze_bn: bool,
}

impl Default for QuantConfig {
    fn default() -> Self {
        Self {
            weight_quantize_type: WeightQuantizeType::ChannelWiseAbsMax,
            activation_quantize_type: ActivationQuantizeType::MovingAverageAbsMax,
            quantize_op_types: vec![OpType::DepthwiseConv2d, OpType::Mul, OpType::Conv2d],
            onnx_format: false,
            weight_bits: 8,
            activation_bits: 8,
            moving_rate: 0.9,
            window_size: 10000,
            not_quant_pattern: vec!["skip_quant".to_string()],
            freeze_bn: false,
        }
    }
}

impl QuantConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: QuantConfig = serde_json::from_str(json).map_err(|e| {
            if e.is_data() {
                Error::InvalidConfig(e.to_string())
            } else {
                Error::Json(e)
            }
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<()> {
        for (what, bits) in [
            ("weight_bits", self.weight_bits),
            ("activation_bits", self.activation_bits),
        ] {
            if !(2..=16).contains(&bits) {
                return Err(Error::InvalidConfig(format!(
                    "{what} must be in 2..=16, got {bits}"
                )));
            }
        }
        if !(self.moving_rate > 0.0 && self.moving_rate < 1.0) {
            return Err(Error::InvalidConfig(format!(
                "moving_rate must be in (0, 1), got {}",
                self.moving_rate
            )));
        }
        if self.window_size == 0 {
            return Err(Error::InvalidConfig(
                "window_size must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether a layer of `op_type` named `name` gets fake-quant ops.
    pub fn should_quantize(&self, op_type: OpType, name: &str) -> bool {
        self.quantize_op_types.contains(&op_type)
            && !self
                .not_quant_pattern
                .iter()
                .any(|p| !p.is_empty() && name.contains(p.as_str()))
    }

    pub fn weight_bin_count(&self) -> f32 {
        bin_count(self.weight_bits)
    }

    pub fn activation_bin_count(&self) -> f32 {
        bin_count(self.activation_bits)
    }
}

/// Largest code of a symmetric signed quantizer: `2^(bits-1) - 1`.
pub fn bin_count(bits: u32) -> f32 {
    ((1u32 << (bits - 1)) - 1) as f32
}
