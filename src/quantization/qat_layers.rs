//! QAT-aware layer implementations
//!
//! Any layer with a weight and a linear op (`conv2d`, `depthwise_conv2d`,
//! `mul`) implements [`Quantizable`]. The transform wraps such layers in a
//! [`QuantAwareLayer`], which fake-quantizes the input activation and the
//! weight around the op, and `convert` freezes that into a [`ConvertedLayer`].

use std::rc::Rc;

use super::fake_quantize::{abs_max, channel_abs_max, quant_code};
use super::observers::ActivationObserver;
use super::qat_config::{OpType, QuantConfig, WeightQuantizeType};
use crate::error::Result;
use crate::nn::{Mode, Module};
use crate::scope::Parameter;
use crate::tape::no_grad;
use crate::Tensor;

/// A layer whose op can run on fake-quantized inputs and weights.
pub trait Quantizable: Module {
    fn op_type(&self) -> OpType;

    fn weight(&self) -> &Parameter;

    fn bias(&self) -> Option<&Parameter>;

    /// The op itself, without bias.
    fn apply(&self, input: &Tensor, weight: &Tensor) -> Tensor;

    fn add_bias(&self, output: Tensor) -> Tensor;

    fn clone_quantizable(&self) -> Box<dyn Quantizable>;
}

fn weight_scales(kind: WeightQuantizeType, weight: &Tensor) -> Vec<f32> {
    let data = weight.data();
    match kind {
        WeightQuantizeType::AbsMax => vec![abs_max(&data)],
        WeightQuantizeType::ChannelWiseAbsMax => channel_abs_max(&data, weight.shape()[0]),
    }
}

/// Training-time wrapper: `op(fq(preprocess(x)), fq(W)) + b`.
#[derive(Clone)]
pub struct QuantAwareLayer {
    inner: Rc<dyn Quantizable>,
    preprocess: Option<Rc<dyn Module>>,
    observer: ActivationObserver,
    weight_quantize_type: WeightQuantizeType,
    weight_bnt: f32,
    activation_bnt: f32,
}

impl QuantAwareLayer {
    pub fn new(
        inner: Box<dyn Quantizable>,
        preprocess: Option<Box<dyn Module>>,
        observer: ActivationObserver,
        config: &QuantConfig,
    ) -> Self {
        Self {
            inner: Rc::from(inner),
            preprocess: preprocess.map(Rc::from),
            observer,
            weight_quantize_type: config.weight_quantize_type,
            weight_bnt: config.weight_bin_count(),
            activation_bnt: config.activation_bin_count(),
        }
    }

    pub fn op_type(&self) -> OpType {
        self.inner.op_type()
    }

    pub fn observer(&self) -> &ActivationObserver {
        &self.observer
    }

    pub fn has_preprocess(&self) -> bool {
        self.preprocess.is_some()
    }
}

impl Module for QuantAwareLayer {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn forward(&self, input: &Tensor, mode: Mode) -> Tensor {
        let x = match &self.preprocess {
            Some(p) => p.forward(input, mode),
            None => input.clone(),
        };
        let s_x = self.observer.observe(abs_max(&x.data()), mode);
        let xq = x.fake_quant_dequant(&[s_x], self.activation_bnt);

        let weight = &self.inner.weight().tensor;
        let scales = weight_scales(self.weight_quantize_type, weight);
        let wq = weight.fake_quant_dequant(&scales, self.weight_bnt);

        self.inner.add_bias(self.inner.apply(&xq, &wq))
    }

    fn parameters(&self) -> Vec<Parameter> {
        let mut params = self.inner.parameters();
        if let Some(p) = &self.preprocess {
            params.extend(p.parameters());
        }
        params
    }

    fn box_clone(&self) -> Box<dyn Module> {
        Box::new(self.clone())
    }

    fn convert(&self, config: &QuantConfig) -> Result<Box<dyn Module>> {
        let weight = &self.inner.weight().tensor;
        let scales = weight_scales(self.weight_quantize_type, weight);
        let frozen = if config.onnx_format {
            FrozenWeight::Dequantized(no_grad(|| {
                weight.fake_quant_dequant(&scales, self.weight_bnt).detach()
            }))
        } else {
            let per = weight.numel() / scales.len();
            let codes: Vec<f32> = weight
                .data()
                .iter()
                .enumerate()
                .map(|(i, &w)| quant_code(w, scales[i / per], self.weight_bnt))
                .collect();
            FrozenWeight::Integer {
                codes: Tensor::new(codes, weight.shape()),
                scales,
            }
        };

        Ok(Box::new(ConvertedLayer {
            inner: self.inner.clone(),
            preprocess: self.preprocess.clone(),
            observer: self.observer.clone(),
            weight: frozen,
            weight_bnt: self.weight_bnt,
            activation_bnt: self.activation_bnt,
        }))
    }

    fn quantized_layers(&self) -> Vec<String> {
        vec![self.name().to_string()]
    }
}

#[derive(Debug, Clone)]
enum FrozenWeight {
    /// Integer codes with per-tensor or per-output-channel scales.
    Integer { codes: Tensor, scales: Vec<f32> },
    /// Weights already quantized and dequantized back to float.
    Dequantized(Tensor),
}

/// Inference-only form of a [`QuantAwareLayer`] with weights quantized once.
#[derive(Clone)]
pub struct ConvertedLayer {
    inner: Rc<dyn Quantizable>,
    preprocess: Option<Rc<dyn Module>>,
    observer: ActivationObserver,
    weight: FrozenWeight,
    weight_bnt: f32,
    activation_bnt: f32,
}

impl ConvertedLayer {
    pub fn is_integer(&self) -> bool {
        matches!(self.weight, FrozenWeight::Integer { .. })
    }

    /// `y[:, c] *= s_x * s_w[c] / (bnt_x * bnt_w)` along axis 1.
    fn rescale(&self, y: Tensor, s_x: f32, scales: &[f32]) -> Tensor {
        let shape = y.shape().to_vec();
        let channels = shape[1];
        let inner: usize = shape[2..].iter().product();
        let denom = self.activation_bnt * self.weight_bnt;
        let mut data = y.data().clone();
        for (i, v) in data.iter_mut().enumerate() {
            let c = (i / inner) % channels;
            let s_w = if scales.len() == 1 { scales[0] } else { scales[c] };
            *v *= s_x * s_w / denom;
        }
        Tensor::new(data, &shape)
    }
}

impl Module for ConvertedLayer {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn forward(&self, input: &Tensor, _mode: Mode) -> Tensor {
        no_grad(|| {
            let x = match &self.preprocess {
                Some(p) => p.forward(input, Mode::Eval),
                None => input.clone(),
            };
            let s_x = self.observer.observe(abs_max(&x.data()), Mode::Eval);
            match &self.weight {
                FrozenWeight::Integer { codes, scales } => {
                    let x_codes = x.quant_codes(s_x, self.activation_bnt);
                    let acc = self.inner.apply(&x_codes, codes);
                    self.inner.add_bias(self.rescale(acc, s_x, scales))
                }
                FrozenWeight::Dequantized(w) => {
                    let xq = x.fake_quant_dequant(&[s_x], self.activation_bnt);
                    self.inner.add_bias(self.inner.apply(&xq, w))
                }
            }
        })
    }

    fn parameters(&self) -> Vec<Parameter> {
        vec![]
    }

    fn box_clone(&self) -> Box<dyn Module> {
        Box::new(self.clone())
    }

    fn quantized_layers(&self) -> Vec<String> {
        vec![self.name().to_string()]
    }
}
