use crate::error::Result;
use crate::quantization::{OpType, QuantAwareContext, QuantConfig, Quantizable};
use crate::scope::{Initializer, ParamAttr, Parameter, Scope};
use crate::Tensor;

/// Whether a forward pass belongs to a training step or to inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

/// Trait for any differentiable network component.
pub trait Module {
    fn name(&self) -> &str;

    fn forward(&self, input: &Tensor, mode: Mode) -> Tensor;

    fn parameters(&self) -> Vec<Parameter>;

    /// Structural copy that shares every variable with `self`.
    fn box_clone(&self) -> Box<dyn Module>;

    /// Rewrites this layer for quantization-aware training.
    fn quant_aware(&self, _ctx: &mut QuantAwareContext<'_>) -> Result<Box<dyn Module>> {
        Ok(self.box_clone())
    }

    /// Freezes a quantization-aware layer into its inference form.
    fn convert(&self, _config: &QuantConfig) -> Result<Box<dyn Module>> {
        Ok(self.box_clone())
    }

    /// Names of quantized ops at or below this layer.
    fn quantized_layers(&self) -> Vec<String> {
        Vec::new()
    }
}

impl Clone for Box<dyn Module> {
    fn clone(&self) -> Self {
        self.box_clone()
    }
}

/// Fully connected layer: `y = xWᵀ + b`. Lowered as a `mul` op.
#[derive(Debug, Clone)]
pub struct Linear {
    name: String,
    pub weight: Parameter,
    pub bias: Option<Parameter>,
}

impl Linear {
    /// Creates `<name>_weights` (`[out, in]`, MSRA) and `<name>_offset` (zeros).
    pub fn new(
        scope: &Scope,
        name: &str,
        in_features: usize,
        out_features: usize,
        with_bias: bool,
    ) -> Result<Self> {
        let weight = scope.create_parameter(
            ParamAttr::new(
                format!("{name}_weights"),
                Initializer::Msra {
                    fan_in: in_features,
                },
            ),
            &[out_features, in_features],
        )?;
        let bias = if with_bias {
            Some(scope.create_parameter(
                ParamAttr::new(format!("{name}_offset"), Initializer::Constant(0.0)),
                &[out_features],
            )?)
        } else {
            None
        };

        Ok(Self {
            name: name.to_string(),
            weight,
            bias,
        })
    }
}

impl Quantizable for Linear {
    fn op_type(&self) -> OpType {
        OpType::Mul
    }

    fn weight(&self) -> &Parameter {
        &self.weight
    }

    fn bias(&self) -> Option<&Parameter> {
        self.bias.as_ref()
    }

    fn apply(&self, input: &Tensor, weight: &Tensor) -> Tensor {
        input.matmul_t(weight)
    }

    fn add_bias(&self, output: Tensor) -> Tensor {
        match &self.bias {
            Some(b) => output.add_broadcast(&b.tensor),
            None => output,
        }
    }

    fn clone_quantizable(&self) -> Box<dyn Quantizable> {
        Box::new(self.clone())
    }
}

impl Module for Linear {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, input: &Tensor, _mode: Mode) -> Tensor {
        self.add_bias(self.apply(input, &self.weight.tensor))
    }

    fn parameters(&self) -> Vec<Parameter> {
        let mut p = vec![self.weight.clone()];
        if let Some(b) = &self.bias {
            p.push(b.clone());
        }
        p
    }

    fn box_clone(&self) -> Box<dyn Module> {
        Box::new(self.clone())
    }

    fn quant_aware(&self, ctx: &mut QuantAwareContext<'_>) -> Result<Box<dyn Module>> {
        ctx.instrument(self)
    }
}

/// Collapses every axis after the first: `[N, ...] -> [N, prod(...)]`.
#[derive(Debug, Clone)]
pub struct Flatten {
    name: String,
}

impl Flatten {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

impl Module for Flatten {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, input: &Tensor, _mode: Mode) -> Tensor {
        let n = input.shape()[0];
        let rest = input.numel() / n.max(1);
        input.reshape(&[n, rest])
    }

    fn parameters(&self) -> Vec<Parameter> {
        vec![]
    }

    fn box_clone(&self) -> Box<dyn Module> {
        Box::new(self.clone())
    }
}

/// A stack of layers applied in sequence.
#[derive(Clone)]
pub struct Sequential {
    name: String,
    layers: Vec<Box<dyn Module>>,
}

impl Sequential {
    pub fn new(name: &str, layers: Vec<Box<dyn Module>>) -> Self {
        Self {
            name: name.to_string(),
            layers,
        }
    }

    pub fn layers(&self) -> &[Box<dyn Module>] {
        &self.layers
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    fn try_map<F>(&self, mut f: F) -> Result<Box<dyn Module>>
    where
        F: FnMut(&dyn Module) -> Result<Box<dyn Module>>,
    {
        let layers = self
            .layers
            .iter()
            .map(|l| f(l.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Box::new(Sequential::new(&self.name, layers)))
    }
}

impl Module for Sequential {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, input: &Tensor, mode: Mode) -> Tensor {
        self.layers
            .iter()
            .fold(input.clone(), |x, l| l.forward(&x, mode))
    }

    fn parameters(&self) -> Vec<Parameter> {
        self.layers.iter().flat_map(|l| l.parameters()).collect()
    }

    fn box_clone(&self) -> Box<dyn Module> {
        Box::new(self.clone())
    }

    fn quant_aware(&self, ctx: &mut QuantAwareContext<'_>) -> Result<Box<dyn Module>> {
        self.try_map(|l| l.quant_aware(ctx))
    }

    fn convert(&self, config: &QuantConfig) -> Result<Box<dyn Module>> {
        self.try_map(|l| l.convert(config))
    }

    fn quantized_layers(&self) -> Vec<String> {
        self.layers
            .iter()
            .flat_map(|l| l.quantized_layers())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::ReLU;
    use crate::Tape;

    #[test]
    fn test_linear_forward_and_names() {
        let scope = Scope::new(0);
        let fc = Linear::new(&scope, "fc7", 4, 3, true).unwrap();
        assert_eq!(fc.weight.name(), "fc7_weights");
        assert_eq!(fc.bias.as_ref().unwrap().name(), "fc7_offset");

        Tape::reset();
        let x = Tensor::full(&[2, 4], 1.0);
        let y = fc.forward(&x, Mode::Train);
        assert_eq!(y.shape(), &[2, 3]);
        assert_eq!(fc.parameters().len(), 2);
    }

    #[test]
    fn test_sequential_clone_shares_parameters() {
        let scope = Scope::new(0);
        let model = Sequential::new(
            "mlp",
            vec![
                Box::new(Flatten::new("flatten")),
                Box::new(Linear::new(&scope, "fc1", 6, 4, true).unwrap()),
                Box::new(ReLU::new("relu1")),
                Box::new(Linear::new(&scope, "fc2", 4, 2, false).unwrap()),
            ],
        );
        let copy = model.box_clone();

        let a = model.parameters();
        let b = copy.parameters();
        assert_eq!(a.len(), 3);
        for (pa, pb) in a.iter().zip(b.iter()) {
            assert!(pa.tensor.same_storage(&pb.tensor));
        }

        let x = Tensor::full(&[3, 1, 2, 3], 0.5);
        let y = copy.forward(&x, Mode::Eval);
        assert_eq!(y.shape(), &[3, 2]);
    }
}
