use crate::nn::{Mode, Module};
use crate::scope::Parameter;
use crate::Tensor;

/// ReLU activation as a module
#[derive(Debug, Clone)]
pub struct ReLU {
    name: String,
}

impl ReLU {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

impl Module for ReLU {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, input: &Tensor, _mode: Mode) -> Tensor {
        input.relu()
    }

    fn parameters(&self) -> Vec<Parameter> {
        vec![]
    }

    fn box_clone(&self) -> Box<dyn Module> {
        Box::new(self.clone())
    }
}
