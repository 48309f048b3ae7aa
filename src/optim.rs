use std::rc::Rc;

use crate::scope::{L2Decay, Parameter};

pub trait Optimizer {
    fn step(&mut self);
    fn zero_grad(&mut self);
    fn parameters(&self) -> &[Parameter];
}

/// Builds an optimizer over parameters created after `minimize` was called,
/// such as activation-preprocess thresholds added by the QAT transform.
pub type OptimizerFactory = Rc<dyn Fn(Vec<Parameter>) -> Box<dyn Optimizer>>;

/// SGD with momentum:
/// v = mu * v + (g + decay * p)
/// p = p - lr * lr_mult * v
pub struct Momentum {
    params: Vec<Parameter>,
    lr: f32,
    momentum: f32,
    weight_decay: Option<L2Decay>,
    velocity: Vec<Vec<f32>>,
}

impl Momentum {
    pub fn new(params: Vec<Parameter>, lr: f32, momentum: f32) -> Self {
        let velocity = params.iter().map(|p| vec![0.0; p.tensor.numel()]).collect();
        Momentum {
            params,
            lr,
            momentum,
            weight_decay: None,
            velocity,
        }
    }

    /// Optimizer-level L2 decay, overridden by a parameter's own regularizer.
    pub fn with_weight_decay(mut self, decay: L2Decay) -> Self {
        self.weight_decay = Some(decay);
        self
    }

    pub fn get_lr(&self) -> f32 {
        self.lr
    }

    pub fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }
}

impl Optimizer for Momentum {
    fn step(&mut self) {
        for (param, v) in self.params.iter().zip(self.velocity.iter_mut()) {
            let Some(grad) = param.tensor.grad_ref() else {
                continue;
            };
            let decay = param
                .attr
                .regularizer
                .or(self.weight_decay)
                .map_or(0.0, |d| d.0);
            let lr = self.lr * param.attr.learning_rate;

            let mut data = param.tensor.data_mut();
            for ((p, vi), &g) in data.iter_mut().zip(v.iter_mut()).zip(grad.iter()) {
                let g = g + decay * *p;
                *vi = self.momentum * *vi + g;
                *p -= lr * *vi;
            }
        }
    }

    fn zero_grad(&mut self) {
        for param in &self.params {
            param.tensor.zero_grad();
        }
    }

    fn parameters(&self) -> &[Parameter] {
        &self.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::{Initializer, ParamAttr, Scope};

    #[test]
    fn test_momentum_accumulates_velocity() {
        let scope = Scope::new(0);
        let w = scope
            .create_parameter(ParamAttr::new("w", Initializer::Constant(1.0)), &[2])
            .unwrap();
        let mut opt = Momentum::new(vec![w.clone()], 0.1, 0.9);

        *w.tensor.grad.borrow_mut() = Some(vec![1.0, -1.0]);
        opt.step();
        assert!((w.tensor.data()[0] - 0.9).abs() < 1e-6);
        assert!((w.tensor.data()[1] - 1.1).abs() < 1e-6);

        // v = 0.9 * 1 + 1 = 1.9
        opt.step();
        assert!((w.tensor.data()[0] - (0.9 - 0.19)).abs() < 1e-6);

        opt.zero_grad();
        assert!(w.tensor.grad_ref().is_none());
        opt.step();
        assert!((w.tensor.data()[0] - 0.71).abs() < 1e-6);
    }

    #[test]
    fn test_param_regularizer_overrides_weight_decay_and_lr_mult() {
        let scope = Scope::new(0);
        let plain = scope
            .create_parameter(ParamAttr::new("plain", Initializer::Constant(2.0)), &[1])
            .unwrap();
        let custom = scope
            .create_parameter(
                ParamAttr::new("custom", Initializer::Constant(2.0))
                    .with_regularizer(L2Decay(0.0))
                    .with_learning_rate(2.0),
                &[1],
            )
            .unwrap();
        let mut opt = Momentum::new(vec![plain.clone(), custom.clone()], 0.1, 0.0)
            .with_weight_decay(L2Decay(0.5));

        *plain.tensor.grad.borrow_mut() = Some(vec![0.0]);
        *custom.tensor.grad.borrow_mut() = Some(vec![1.0]);
        opt.step();

        // plain: g = 0 + 0.5 * 2 = 1 -> 2 - 0.1
        assert!((plain.tensor.data()[0] - 1.9).abs() < 1e-6);
        // custom: no decay, doubled lr -> 2 - 0.2
        assert!((custom.tensor.data()[0] - 1.8).abs() < 1e-6);
    }
}
