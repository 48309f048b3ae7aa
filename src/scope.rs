//! Named variable storage shared by programs cloned from the same root.
//!
//! Trainable parameters carry a [`ParamAttr`]; persistable state such as
//! batch-norm statistics and quantization scales is plain tensors looked up
//! by name, so two programs that reference the same name see the same value.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::error::{Error, Result};
use crate::Tensor;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Initializer {
    Constant(f32),
    /// He/MSRA uniform: `U(-sqrt(6 / fan_in), sqrt(6 / fan_in))`
    Msra { fan_in: usize },
    Uniform { low: f32, high: f32 },
}

/// L2 weight decay coefficient.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct L2Decay(pub f32);

#[derive(Debug, Clone, PartialEq)]
pub struct ParamAttr {
    pub name: String,
    pub initializer: Initializer,
    /// Multiplier applied to the optimizer learning rate.
    pub learning_rate: f32,
    /// Overrides the optimizer-level weight decay when set.
    pub regularizer: Option<L2Decay>,
    pub trainable: bool,
}

impl ParamAttr {
    pub fn new(name: impl Into<String>, initializer: Initializer) -> Self {
        Self {
            name: name.into(),
            initializer,
            learning_rate: 1.0,
            regularizer: None,
            trainable: true,
        }
    }

    pub fn with_learning_rate(mut self, learning_rate: f32) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    pub fn with_regularizer(mut self, regularizer: L2Decay) -> Self {
        self.regularizer = Some(regularizer);
        self
    }

    pub fn with_trainable(mut self, trainable: bool) -> Self {
        self.trainable = trainable;
        self
    }
}

/// A trainable variable: shared tensor handle plus its attributes.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub tensor: Tensor,
    pub attr: Rc<ParamAttr>,
}

impl Parameter {
    pub fn name(&self) -> &str {
        &self.attr.name
    }
}

enum Var {
    Parameter(Parameter),
    Persistable(Tensor),
}

impl Var {
    fn tensor(&self) -> &Tensor {
        match self {
            Var::Parameter(p) => &p.tensor,
            Var::Persistable(t) => t,
        }
    }
}

struct ScopeInner {
    vars: BTreeMap<String, Var>,
    rng: StdRng,
}

#[derive(Clone)]
pub struct Scope {
    inner: Rc<RefCell<ScopeInner>>,
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("vars", &self.var_names())
            .finish()
    }
}

impl Scope {
    /// Empty scope whose initializers draw from a generator seeded with `seed`.
    pub fn new(seed: u64) -> Self {
        Self {
            inner: Rc::new(RefCell::new(ScopeInner {
                vars: BTreeMap::new(),
                rng: StdRng::seed_from_u64(seed),
            })),
        }
    }

    /// Registers a new trainable parameter. Names must be unique.
    pub fn create_parameter(&self, attr: ParamAttr, shape: &[usize]) -> Result<Parameter> {
        let mut inner = self.inner.borrow_mut();
        if inner.vars.contains_key(&attr.name) {
            return Err(Error::DuplicateVariable(attr.name));
        }

        let numel: usize = shape.iter().product();
        let data = match attr.initializer {
            Initializer::Constant(value) => vec![value; numel],
            Initializer::Msra { fan_in } => {
                let limit = (6.0 / fan_in.max(1) as f32).sqrt();
                sample_uniform(&mut inner.rng, -limit, limit, numel)
            }
            Initializer::Uniform { low, high } => sample_uniform(&mut inner.rng, low, high, numel),
        };

        let mut tensor = Tensor::new(data, shape);
        tensor.requires_grad = attr.trainable;
        let param = Parameter {
            tensor,
            attr: Rc::new(attr),
        };
        inner
            .vars
            .insert(param.attr.name.clone(), Var::Parameter(param.clone()));
        Ok(param)
    }

    /// Looks up persistable state by name, creating it filled with `init` if absent.
    pub fn persistable(&self, name: &str, shape: &[usize], init: f32) -> Result<Tensor> {
        let mut inner = self.inner.borrow_mut();
        if let Some(var) = inner.vars.get(name) {
            let tensor = var.tensor();
            if tensor.shape() != shape {
                return Err(Error::ShapeMismatch {
                    what: name.to_string(),
                    expected: shape.to_vec(),
                    actual: tensor.shape().to_vec(),
                });
            }
            return Ok(tensor.clone());
        }

        let tensor = Tensor::full(shape, init);
        inner
            .vars
            .insert(name.to_string(), Var::Persistable(tensor.clone()));
        Ok(tensor)
    }

    pub fn find_var(&self, name: &str) -> Option<Tensor> {
        self.inner.borrow().vars.get(name).map(|v| v.tensor().clone())
    }

    pub fn parameter(&self, name: &str) -> Option<Parameter> {
        match self.inner.borrow().vars.get(name) {
            Some(Var::Parameter(p)) => Some(p.clone()),
            _ => None,
        }
    }

    /// All trainable parameters, ordered by name.
    pub fn parameters(&self) -> Vec<Parameter> {
        self.inner
            .borrow()
            .vars
            .values()
            .filter_map(|v| match v {
                Var::Parameter(p) if p.attr.trainable => Some(p.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn var_names(&self) -> Vec<String> {
        self.inner.borrow().vars.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn sample_uniform(rng: &mut StdRng, low: f32, high: f32, n: usize) -> Vec<f32> {
    if low >= high {
        return vec![low; n];
    }
    let dist = Uniform::new_inclusive(low, high);
    (0..n).map(|_| dist.sample(rng)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_parameter_rejects_duplicates() {
        let scope = Scope::new(0);
        let attr = ParamAttr::new("fc_weights", Initializer::Constant(0.5));
        let p = scope.create_parameter(attr.clone(), &[2, 2]).unwrap();
        assert!(p.tensor.requires_grad);
        assert_eq!(*p.tensor.data(), vec![0.5; 4]);

        match scope.create_parameter(attr, &[2, 2]) {
            Err(Error::DuplicateVariable(name)) => assert_eq!(name, "fc_weights"),
            other => panic!("expected duplicate error, got {:?}", other),
        }
    }

    #[test]
    fn test_msra_init_is_bounded_and_seeded() {
        let a = Scope::new(7);
        let b = Scope::new(7);
        let attr = ParamAttr::new("w", Initializer::Msra { fan_in: 6 });
        let pa = a.create_parameter(attr.clone(), &[4, 6]).unwrap();
        let pb = b.create_parameter(attr, &[4, 6]).unwrap();

        assert_eq!(*pa.tensor.data(), *pb.tensor.data());
        assert!(pa.tensor.data().iter().all(|v| v.abs() <= 1.0 + 1e-6));
    }

    #[test]
    fn test_persistable_is_shared_by_name() {
        let scope = Scope::new(0);
        let first = scope.persistable("act.scale", &[1], 0.001).unwrap();
        first.data_mut()[0] = 3.0;

        let second = scope.persistable("act.scale", &[1], 0.001).unwrap();
        assert_eq!(second.data()[0], 3.0);
        assert!(first.same_storage(&second));

        assert!(matches!(
            scope.persistable("act.scale", &[2], 0.0),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_parameters_skip_persistable_state() {
        let scope = Scope::new(0);
        scope
            .create_parameter(ParamAttr::new("b", Initializer::Constant(0.0)), &[1])
            .unwrap();
        scope
            .create_parameter(ParamAttr::new("a", Initializer::Constant(0.0)), &[1])
            .unwrap();
        scope.persistable("a_mean", &[1], 0.0).unwrap();

        let names: Vec<String> = scope.parameters().iter().map(|p| p.name().to_string()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(scope.len(), 3);
    }
}
