//! MobileNet v1 for single-channel 28x28 inputs.
//!
//! Variable names follow the classic layout (`conv1`, `conv2_1_dw`,
//! `conv2_1_sep`, ..., `fc7`) so per-layer quantization state and PACT
//! thresholds are addressable by name.

use tracing::info;

use crate::activation::ReLU;
use crate::conv::Conv2d;
use crate::error::{Error, Result};
use crate::nn::{Flatten, Linear, Module, Sequential};
use crate::norm::BatchNorm2d;
use crate::pool::AdaptiveAvgPool2d;
use crate::program::Program;
use crate::scope::Scope;

/// `(name, in, out, stride)` of each depthwise-separable block at scale 1.
const BLOCKS: [(&str, usize, usize, usize); 13] = [
    ("conv2_1", 32, 64, 1),
    ("conv2_2", 64, 128, 2),
    ("conv3_1", 128, 128, 1),
    ("conv3_2", 128, 256, 2),
    ("conv4_1", 256, 256, 1),
    ("conv4_2", 256, 512, 2),
    ("conv5_1", 512, 512, 1),
    ("conv5_2", 512, 512, 1),
    ("conv5_3", 512, 512, 1),
    ("conv5_4", 512, 512, 1),
    ("conv5_5", 512, 512, 1),
    ("conv5_6", 512, 1024, 2),
    ("conv6", 1024, 1024, 1),
];

pub const MNIST_INPUT_SHAPE: [usize; 3] = [1, 28, 28];

#[derive(Debug, Clone, Copy)]
pub struct MobileNet {
    scale: f32,
}

impl Default for MobileNet {
    fn default() -> Self {
        Self { scale: 1.0 }
    }
}

impl MobileNet {
    /// Width multiplier `scale` applies to every layer. The narrowest layer
    /// (32 channels at scale 1) must keep at least one channel.
    pub fn new(scale: f32) -> Result<Self> {
        if !scale.is_finite() || (32.0 * scale) < 1.0 {
            return Err(Error::InvalidConfig(format!(
                "MobileNet scale must be finite and at least 1/32, got {scale}"
            )));
        }
        Ok(Self { scale })
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    fn width(&self, channels: usize) -> usize {
        (channels as f32 * self.scale) as usize
    }

    /// Builds the network, registering every variable in `scope`.
    pub fn net(&self, scope: &Scope, class_dim: usize) -> Result<Sequential> {
        let mut layers: Vec<Box<dyn Module>> = Vec::with_capacity(BLOCKS.len() + 4);
        layers.push(Box::new(conv_bn_relu(
            scope,
            "conv1",
            MNIST_INPUT_SHAPE[0],
            self.width(32),
            3,
            2,
            1,
            1,
        )?));

        for (name, input, output, stride) in BLOCKS {
            layers.push(Box::new(self.depthwise_separable(
                scope, name, input, output, stride,
            )?));
        }

        layers.push(Box::new(AdaptiveAvgPool2d::global("pool")));
        layers.push(Box::new(Flatten::new("flatten")));
        layers.push(Box::new(Linear::new(
            scope,
            "fc7",
            self.width(1024),
            class_dim,
            true,
        )?));
        Ok(Sequential::new("mobilenet", layers))
    }

    /// Float training program over `[N, 1, 28, 28]` feeds.
    pub fn build_program(&self, scope: &Scope, class_dim: usize) -> Result<Program> {
        let net = self.net(scope, class_dim)?;
        let program = Program::new(Box::new(net), scope.clone(), MNIST_INPUT_SHAPE);
        let params: usize = program
            .parameters()
            .iter()
            .map(|p| p.tensor.numel())
            .sum();
        info!(scale = self.scale, class_dim, params, "built MobileNet");
        Ok(program)
    }

    fn depthwise_separable(
        &self,
        scope: &Scope,
        name: &str,
        input: usize,
        output: usize,
        stride: usize,
    ) -> Result<Sequential> {
        let channels = self.width(input);
        let dw = conv_bn_relu(
            scope,
            &format!("{name}_dw"),
            channels,
            channels,
            3,
            stride,
            1,
            channels,
        )?;
        let sep = conv_bn_relu(
            scope,
            &format!("{name}_sep"),
            channels,
            self.width(output),
            1,
            1,
            0,
            1,
        )?;
        Ok(Sequential::new(name, vec![Box::new(dw), Box::new(sep)]))
    }
}

#[allow(clippy::too_many_arguments)]
fn conv_bn_relu(
    scope: &Scope,
    name: &str,
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    groups: usize,
) -> Result<Sequential> {
    let conv = Conv2d::new(
        scope,
        name,
        in_channels,
        out_channels,
        kernel,
        stride,
        padding,
        groups,
    )?;
    let bn = BatchNorm2d::new(scope, &format!("{name}_bn"), out_channels)?;
    Ok(Sequential::new(
        name,
        vec![
            Box::new(conv),
            Box::new(bn),
            Box::new(ReLU::new(&format!("{name}_relu"))),
        ],
    ))
}
