use crate::error::Result;
use crate::nn::{Mode, Module};
use crate::ops::accumulate_grad;
use crate::quantization::QuantAwareContext;
use crate::scope::{Initializer, ParamAttr, Parameter, Scope};
use crate::{tape::Tape, Tensor};

pub const BN_MOMENTUM: f32 = 0.9;
pub const BN_EPSILON: f32 = 1e-5;

/// Per-channel batch normalization over `[N, C, H, W]`.
///
/// Variables: `<name>_scale`, `<name>_offset` (trainable) and
/// `<name>_mean`, `<name>_variance` (running statistics, persistable).
/// A frozen layer normalizes with the running statistics in every mode and
/// never updates them.
#[derive(Debug, Clone)]
pub struct BatchNorm2d {
    name: String,
    pub scale: Parameter,
    pub offset: Parameter,
    pub running_mean: Tensor,
    pub running_variance: Tensor,
    momentum: f32,
    epsilon: f32,
    frozen: bool,
}

impl BatchNorm2d {
    pub fn new(scope: &Scope, name: &str, channels: usize) -> Result<Self> {
        let scale = scope.create_parameter(
            ParamAttr::new(format!("{name}_scale"), Initializer::Constant(1.0)),
            &[channels],
        )?;
        let offset = scope.create_parameter(
            ParamAttr::new(format!("{name}_offset"), Initializer::Constant(0.0)),
            &[channels],
        )?;
        let running_mean = scope.persistable(&format!("{name}_mean"), &[channels], 0.0)?;
        let running_variance = scope.persistable(&format!("{name}_variance"), &[channels], 1.0)?;

        Ok(Self {
            name: name.to_string(),
            scale,
            offset,
            running_mean,
            running_variance,
            momentum: BN_MOMENTUM,
            epsilon: BN_EPSILON,
            frozen: false,
        })
    }

    /// Copy sharing every variable that uses the running statistics even in training.
    pub fn frozen(&self) -> Self {
        Self {
            frozen: true,
            ..self.clone()
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    fn batch_statistics(&self, x: &[f32], n: usize, c: usize, hw: usize) -> (Vec<f32>, Vec<f32>) {
        let m = (n * hw) as f32;
        let mut mean = vec![0.0f32; c];
        let mut var = vec![0.0f32; c];
        for ch in 0..c {
            let mut sum = 0.0f32;
            for b in 0..n {
                let start = (b * c + ch) * hw;
                sum += x[start..start + hw].iter().sum::<f32>();
            }
            let mu = sum / m;
            let mut sq = 0.0f32;
            for b in 0..n {
                let start = (b * c + ch) * hw;
                sq += x[start..start + hw].iter().map(|v| (v - mu) * (v - mu)).sum::<f32>();
            }
            mean[ch] = mu;
            var[ch] = sq / m;
        }
        (mean, var)
    }
}

impl Module for BatchNorm2d {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, input: &Tensor, mode: Mode) -> Tensor {
        assert_eq!(input.shape().len(), 4, "batch_norm: input must be NCHW");
        let (n, c, h, w) = (
            input.shape()[0],
            input.shape()[1],
            input.shape()[2],
            input.shape()[3],
        );
        assert_eq!(c, self.scale.tensor.numel(), "batch_norm: channel mismatch");
        let hw = h * w;
        let use_batch_stats = mode == Mode::Train && !self.frozen;

        let x = input.data();
        let (mean, var) = if use_batch_stats {
            let (mean, var) = self.batch_statistics(&x, n, c, hw);
            let mut rm = self.running_mean.data_mut();
            let mut rv = self.running_variance.data_mut();
            for ch in 0..c {
                rm[ch] = self.momentum * rm[ch] + (1.0 - self.momentum) * mean[ch];
                rv[ch] = self.momentum * rv[ch] + (1.0 - self.momentum) * var[ch];
            }
            (mean, var)
        } else {
            (
                self.running_mean.data().clone(),
                self.running_variance.data().clone(),
            )
        };
        let inv_std: Vec<f32> = var.iter().map(|v| 1.0 / (v + self.epsilon).sqrt()).collect();

        let gamma = self.scale.tensor.data();
        let beta = self.offset.tensor.data();
        let mut xhat = vec![0.0f32; x.len()];
        let mut y = vec![0.0f32; x.len()];
        for (i, (xh, yo)) in xhat.iter_mut().zip(y.iter_mut()).enumerate() {
            let ch = (i / hw) % c;
            *xh = (x[i] - mean[ch]) * inv_std[ch];
            *yo = gamma[ch] * *xh + beta[ch];
        }
        drop((x, gamma, beta));
        let mut output = Tensor::new(y, input.shape());

        let (scale, offset) = (&self.scale.tensor, &self.offset.tensor);
        if input.requires_grad || scale.requires_grad || offset.requires_grad {
            output.requires_grad = true;
            let x = input.clone();
            let g = scale.clone();
            let b = offset.clone();
            let out = output.clone();
            let m = (n * hw) as f32;

            Tape::push_op(&[input, scale, offset], &output, move || {
                let Some(gy) = out.grad_ref() else {
                    return;
                };
                let mut sum_dy = vec![0.0f32; c];
                let mut sum_dy_xhat = vec![0.0f32; c];
                for (i, &d) in gy.iter().enumerate() {
                    let ch = (i / hw) % c;
                    sum_dy[ch] += d;
                    sum_dy_xhat[ch] += d * xhat[i];
                }

                if x.requires_grad {
                    let gamma = g.data();
                    let gx: Vec<f32> = gy
                        .iter()
                        .enumerate()
                        .map(|(i, &d)| {
                            let ch = (i / hw) % c;
                            let k = gamma[ch] * inv_std[ch];
                            if use_batch_stats {
                                k / m * (m * d - sum_dy[ch] - xhat[i] * sum_dy_xhat[ch])
                            } else {
                                k * d
                            }
                        })
                        .collect();
                    drop(gamma);
                    accumulate_grad(&x, &gx);
                }
                if g.requires_grad {
                    accumulate_grad(&g, &sum_dy_xhat);
                }
                if b.requires_grad {
                    accumulate_grad(&b, &sum_dy);
                }
            });
        }

        output
    }

    fn parameters(&self) -> Vec<Parameter> {
        vec![self.scale.clone(), self.offset.clone()]
    }

    fn box_clone(&self) -> Box<dyn Module> {
        Box::new(self.clone())
    }

    fn quant_aware(&self, ctx: &mut QuantAwareContext<'_>) -> Result<Box<dyn Module>> {
        if ctx.freeze_bn() {
            Ok(Box::new(self.frozen()))
        } else {
            Ok(self.box_clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> Tensor {
        // two samples, two channels, 1x2 spatial
        Tensor::new(vec![1.0, 3.0, 10.0, 10.0, 5.0, 7.0, 20.0, 20.0], &[2, 2, 1, 2])
    }

    #[test]
    fn test_train_mode_normalizes_and_updates_running_stats() {
        Tape::reset();
        let scope = Scope::new(0);
        let bn = BatchNorm2d::new(&scope, "conv1_bn", 2).unwrap();
        let y = bn.forward(&input(), Mode::Train);

        // channel 0: values 1,3,5,7 -> mean 4, var 5
        let d = y.data();
        let inv = 1.0 / (5.0f32 + BN_EPSILON).sqrt();
        assert!((d[0] - (-3.0 * inv)).abs() < 1e-5);
        assert!((d[5] - (3.0 * inv)).abs() < 1e-5);

        let rm = bn.running_mean.data();
        assert!((rm[0] - 0.4).abs() < 1e-5);
        assert!((rm[1] - 1.5).abs() < 1e-5);
        let rv = bn.running_variance.data();
        assert!((rv[0] - (0.9 + 0.5)).abs() < 1e-5);
        assert!((rv[1] - (0.9 + 2.5)).abs() < 1e-5);
    }

    #[test]
    fn test_eval_and_frozen_use_running_stats() {
        let scope = Scope::new(0);
        let bn = BatchNorm2d::new(&scope, "bn", 2).unwrap();
        let frozen = bn.frozen();
        assert!(frozen.is_frozen());

        let before = bn.running_mean.data().clone();
        let y_eval = bn.forward(&input(), Mode::Eval);
        let y_frozen = frozen.forward(&input(), Mode::Train);
        assert_eq!(*bn.running_mean.data(), before);
        assert_eq!(*y_eval.data(), *y_frozen.data());
        // running mean 0, var 1 -> near-identity
        assert!((y_eval.data()[2] - 10.0).abs() < 1e-3);
    }

    #[test]
    fn test_batch_stat_gradient_sums_to_zero_per_channel() {
        Tape::reset();
        let scope = Scope::new(0);
        let bn = BatchNorm2d::new(&scope, "bn", 2).unwrap();
        let x = input().requires_grad();
        let weights = Tensor::new(vec![1.0, -2.0, 0.5, 3.0, 1.5, 0.0, -1.0, 2.0], &[2, 2, 1, 2]);
        let y = bn.forward(&x, Mode::Train);
        (&y * &weights).mean().backward();

        let gx = x.grad_ref().unwrap();
        let ch0: f32 = [0, 1, 4, 5].iter().map(|&i| gx[i]).sum();
        let ch1: f32 = [2, 3, 6, 7].iter().map(|&i| gx[i]).sum();
        assert!(ch0.abs() < 1e-5 && ch1.abs() < 1e-5);

        let gb = bn.offset.tensor.grad_ref().unwrap();
        assert!((gb[0] - (1.0 - 2.0 + 1.5 + 0.0) / 8.0).abs() < 1e-6);
    }
}
