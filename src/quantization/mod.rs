//! Quantization-aware training for quantcheck
//!
//! `quant_aware` rewrites a float program so that every selected op sees
//! fake-quantized activations and weights. `convert` freezes the result into
//! an inference program.

pub mod fake_quantize;
pub mod observers;
pub mod pact;
pub mod qat_config;
pub mod qat_layers;
pub mod transform;

pub use fake_quantize::{abs_max, channel_abs_max, fake_quant_value, quant_code};
pub use observers::ActivationObserver;
pub use pact::{pact, pact_preprocess, ActPreprocessFn, Pact};
pub use qat_config::{
    bin_count, ActivationQuantizeType, OpType, QuantConfig, WeightQuantizeType,
};
pub use qat_layers::{ConvertedLayer, QuantAwareLayer, Quantizable};
pub use transform::{convert, quant_aware, QuantAwareContext, QuantAwareOptions};
