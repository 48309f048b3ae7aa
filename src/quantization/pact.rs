//! PACT: parameterized clipping of activations before quantization.

use std::rc::Rc;

use crate::error::Result;
use crate::nn::{Mode, Module};
use crate::scope::{Initializer, L2Decay, ParamAttr, Parameter, Scope};
use crate::Tensor;

pub const PACT_INIT_THRESHOLD: f32 = 20.0;
pub const PACT_L2_DECAY: f32 = 1e-4;

/// Builds the preprocess module for the activation named by the first
/// argument, registering any parameters it needs in the scope.
pub type ActPreprocessFn = Rc<dyn Fn(&str, &Scope) -> Result<Box<dyn Module>>>;

/// `x - relu(x - u) + relu(-u - x)`, i.e. `x` clipped to `[-u, u]` with a
/// learnable threshold `u`.
#[derive(Debug, Clone)]
pub struct Pact {
    name: String,
    pub threshold: Parameter,
}

impl Module for Pact {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, input: &Tensor, _mode: Mode) -> Tensor {
        let u = self.threshold.tensor.expand_as(input.shape());
        let part_a = (input - &u).relu();
        let part_b = (-&u - input).relu();
        input - &part_a + &part_b
    }

    fn parameters(&self) -> Vec<Parameter> {
        vec![self.threshold.clone()]
    }

    fn box_clone(&self) -> Box<dyn Module> {
        Box::new(self.clone())
    }
}

/// Registers `<input_name>_pact` (init 20, L2 decay 1e-4) and returns the clip module.
pub fn pact(input_name: &str, scope: &Scope) -> Result<Box<dyn Module>> {
    let name = format!("{input_name}_pact");
    let threshold = scope.create_parameter(
        ParamAttr::new(name.clone(), Initializer::Constant(PACT_INIT_THRESHOLD))
            .with_regularizer(L2Decay(PACT_L2_DECAY))
            .with_learning_rate(1.0),
        &[1],
    )?;
    Ok(Box::new(Pact { name, threshold }))
}

/// [`pact`] as a transform hook.
pub fn pact_preprocess() -> ActPreprocessFn {
    Rc::new(pact)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::Tape;
    use proptest::prelude::*;

    fn with_threshold(scope: &Scope, u: f32) -> Box<dyn Module> {
        let module = pact("conv1_input", scope).unwrap();
        module.parameters()[0].tensor.data_mut()[0] = u;
        module
    }

    #[test]
    fn test_registers_named_threshold() {
        let scope = Scope::new(0);
        let module = pact("conv1_input", &scope).unwrap();
        let u = scope.parameter("conv1_input_pact").unwrap();
        assert_eq!(u.tensor.data()[0], 20.0);
        assert_eq!(u.attr.regularizer, Some(L2Decay(1e-4)));
        assert!(u.tensor.same_storage(&module.parameters()[0].tensor));
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let scope = Scope::new(0);
        pact("fc7_input", &scope).unwrap();
        assert!(matches!(
            pact("fc7_input", &scope),
            Err(Error::DuplicateVariable(name)) if name == "fc7_input_pact"
        ));
    }

    #[test]
    fn test_clips_and_routes_gradient_from_clipped_elements() {
        Tape::reset();
        let scope = Scope::new(0);
        let module = with_threshold(&scope, 1.0);
        let x = Tensor::new(vec![-3.0, -0.5, 0.5, 2.0, 4.0], &[5]).requires_grad();
        let y = module.forward(&x, Mode::Train);
        assert_eq!(*y.data(), vec![-1.0, -0.5, 0.5, 1.0, 1.0]);

        y.backward();
        // dy/du: +1 above the threshold, -1 below -u
        let gu = module.parameters()[0].tensor.grad_ref().unwrap()[0];
        assert!((gu - (2.0 - 1.0)).abs() < 1e-6);
        assert_eq!(*x.grad_ref().unwrap(), vec![0.0, 1.0, 1.0, 0.0, 0.0]);
    }

    proptest! {
        #[test]
        fn prop_preserves_shape_and_bounds(
            rows in 1usize..4,
            cols in 1usize..6,
            u in 0.1f32..5.0,
            seed in prop::collection::vec(-10.0f32..10.0, 24),
        ) {
            let scope = Scope::new(0);
            let module = with_threshold(&scope, u);
            let data: Vec<f32> = seed.iter().cycle().take(rows * cols).copied().collect();
            let x = Tensor::new(data, &[rows, cols]);
            let y = module.forward(&x, Mode::Eval);
            prop_assert_eq!(y.shape(), x.shape());
            for (&yi, &xi) in y.data().iter().zip(x.data().iter()) {
                prop_assert!(yi.abs() <= u + 1e-5);
                if xi.abs() <= u {
                    prop_assert!((yi - xi).abs() < 1e-5);
                }
            }
        }
    }
}
