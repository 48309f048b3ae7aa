use crate::nn::{Mode, Module};
use crate::ops::accumulate_grad;
use crate::scope::Parameter;
use crate::{tape::Tape, Tensor};

impl Tensor {
    /// Global average over the spatial axes: `[N, C, H, W] -> [N, C, 1, 1]`.
    pub fn global_avg_pool2d(&self) -> Tensor {
        assert_eq!(self.shape().len(), 4, "avg_pool2d: input must be NCHW");
        let (n, c) = (self.shape()[0], self.shape()[1]);
        let hw = self.shape()[2] * self.shape()[3];
        let pooled: Vec<f32> = self
            .data()
            .chunks(hw.max(1))
            .map(|plane| plane.iter().sum::<f32>() / hw as f32)
            .collect();
        let mut output = Tensor::new(pooled, &[n, c, 1, 1]);

        if self.requires_grad {
            output.requires_grad = true;
            let input = self.clone();
            let out = output.clone();
            Tape::push_unary_op(self, &output, move || {
                if let Some(gout) = out.grad_ref() {
                    let gin: Vec<f32> = gout
                        .iter()
                        .flat_map(|&g| std::iter::repeat(g / hw as f32).take(hw))
                        .collect();
                    accumulate_grad(&input, &gin);
                }
            });
        }

        output
    }
}

/// Average pooling whose output is always `1x1` per channel.
#[derive(Debug, Clone)]
pub struct AdaptiveAvgPool2d {
    name: String,
}

impl AdaptiveAvgPool2d {
    pub fn global(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

impl Module for AdaptiveAvgPool2d {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, input: &Tensor, _mode: Mode) -> Tensor {
        input.global_avg_pool2d()
    }

    fn parameters(&self) -> Vec<Parameter> {
        vec![]
    }

    fn box_clone(&self) -> Box<dyn Module> {
        Box::new(self.clone())
    }
}
