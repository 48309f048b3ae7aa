//! Programs, placement and the executor that runs them one batch at a time.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::debug;

use crate::data::Batch;
use crate::error::{Error, Result};
use crate::loss::{accuracy, softmax_cross_entropy};
use crate::nn::{Mode, Module};
use crate::optim::Optimizer;
use crate::scope::{Parameter, Scope};
use crate::tape::{no_grad, Tape};

/// Stage of a program in the quantization workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramKind {
    Float,
    QuantAware,
    Converted,
}

/// A network bound to its scope, plus the optimizers `minimize` attached.
///
/// Cloning is shallow: the clone shares every variable and optimizer state.
#[derive(Clone)]
pub struct Program {
    network: Box<dyn Module>,
    scope: Scope,
    input_shape: [usize; 3],
    kind: ProgramKind,
    for_test: bool,
    optimizers: Vec<Rc<RefCell<Box<dyn Optimizer>>>>,
}

impl Program {
    /// A float training program over samples of `input_shape` (`[C, H, W]`).
    pub fn new(network: Box<dyn Module>, scope: Scope, input_shape: [usize; 3]) -> Self {
        Self {
            network,
            scope,
            input_shape,
            kind: ProgramKind::Float,
            for_test: false,
            optimizers: Vec::new(),
        }
    }

    pub fn network(&self) -> &dyn Module {
        self.network.as_ref()
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn kind(&self) -> ProgramKind {
        self.kind
    }

    pub fn is_for_test(&self) -> bool {
        self.for_test
    }

    pub fn input_shape(&self) -> [usize; 3] {
        self.input_shape
    }

    pub fn parameters(&self) -> Vec<Parameter> {
        self.network.parameters()
    }

    /// Attaches an optimizer that every training run of this program steps.
    pub fn minimize(&mut self, optimizer: Box<dyn Optimizer>) {
        self.optimizers.push(Rc::new(RefCell::new(optimizer)));
    }

    pub fn optimizers(&self) -> &[Rc<RefCell<Box<dyn Optimizer>>>] {
        &self.optimizers
    }

    /// Inference variant: same network and variables, no optimizers.
    pub fn clone_for_test(&self) -> Self {
        Self {
            for_test: true,
            optimizers: Vec::new(),
            ..self.clone()
        }
    }

    pub(crate) fn derive(
        &self,
        network: Box<dyn Module>,
        kind: ProgramKind,
        for_test: bool,
        optimizers: Vec<Rc<RefCell<Box<dyn Optimizer>>>>,
    ) -> Self {
        Self {
            network,
            scope: self.scope.clone(),
            input_shape: self.input_shape,
            kind,
            for_test,
            optimizers,
        }
    }
}

impl std::fmt::Debug for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Program")
            .field("network", &self.network.name())
            .field("kind", &self.kind)
            .field("for_test", &self.for_test)
            .field("input_shape", &self.input_shape)
            .field("optimizers", &self.optimizers.len())
            .finish()
    }
}

/// Where programs execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Place {
    Cpu,
    Accelerator(usize),
}

impl Place {
    /// Best available device. Only CPU kernels are compiled in.
    pub fn select() -> Self {
        Place::Cpu
    }

    pub fn ensure_available(self) -> Result<()> {
        match self {
            Place::Cpu => Ok(()),
            Place::Accelerator(id) => Err(Error::DeviceUnavailable(format!(
                "accelerator {id}: no accelerator kernels in this build"
            ))),
        }
    }
}

/// Values fetched from one executor step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fetch {
    pub loss: f32,
    pub top1: f32,
    pub top5: f32,
}

/// Runs programs batch by batch.
#[derive(Debug)]
pub struct Executor {
    place: Place,
}

impl Executor {
    pub fn new(place: Place) -> Result<Self> {
        place.ensure_available()?;
        Ok(Self { place })
    }

    pub fn place(&self) -> Place {
        self.place
    }

    /// One step over `batch`. Training programs also run backward and every
    /// attached optimizer.
    pub fn run(&self, program: &Program, batch: &Batch) -> Result<Fetch> {
        self.check_feed(program, batch)?;
        Tape::reset();

        let fetch = if program.is_for_test() {
            no_grad(|| {
                let logits = program.network.forward(&batch.images, Mode::Eval);
                eval_fetch(&logits, &batch.labels)
            })?
        } else {
            let logits = program.network.forward(&batch.images, Mode::Train);
            check_labels(&logits, &batch.labels)?;
            let loss = softmax_cross_entropy(&logits, &batch.labels);
            loss.backward();
            for optimizer in &program.optimizers {
                optimizer.borrow_mut().step();
            }
            for param in program.parameters() {
                param.tensor.zero_grad();
            }
            Tape::reset();
            let loss_value = loss.data()[0];
            Fetch {
                loss: loss_value,
                top1: accuracy(&logits, &batch.labels, 1),
                top5: accuracy(&logits, &batch.labels, 5),
            }
        };
        debug!(
            kind = ?program.kind(),
            for_test = program.is_for_test(),
            loss = fetch.loss,
            top1 = fetch.top1,
            "executor step"
        );
        Ok(fetch)
    }

    fn check_feed(&self, program: &Program, batch: &Batch) -> Result<()> {
        let n = batch.labels.len();
        let [c, h, w] = program.input_shape();
        let expected = vec![n, c, h, w];
        if n == 0 || batch.images.shape() != expected.as_slice() {
            return Err(Error::ShapeMismatch {
                what: "image feed".to_string(),
                expected,
                actual: batch.images.shape().to_vec(),
            });
        }
        Ok(())
    }
}

fn check_labels(logits: &crate::Tensor, labels: &[usize]) -> Result<()> {
    let classes = logits.shape().get(1).copied().unwrap_or(0);
    match labels.iter().copied().max() {
        Some(max) if max >= classes => Err(Error::ShapeMismatch {
            what: "label range".to_string(),
            expected: vec![classes],
            actual: vec![max + 1],
        }),
        _ => Ok(()),
    }
}

fn eval_fetch(logits: &crate::Tensor, labels: &[usize]) -> Result<Fetch> {
    check_labels(logits, labels)?;
    let loss = softmax_cross_entropy(logits, labels).data()[0];
    Ok(Fetch {
        loss,
        top1: accuracy(logits, labels, 1),
        top5: accuracy(logits, labels, 5),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::{Flatten, Linear, Sequential};
    use crate::optim::Momentum;
    use crate::Tensor;

    fn linear_program(scope: &Scope) -> Program {
        let net = Sequential::new(
            "net",
            vec![
                Box::new(Flatten::new("flatten")),
                Box::new(Linear::new(scope, "fc7", 4, 2, true).unwrap()),
            ],
        );
        let mut program = Program::new(Box::new(net), scope.clone(), [1, 2, 2]);
        let params = program.parameters();
        program.minimize(Box::new(Momentum::new(params, 0.5, 0.0)));
        program
    }

    fn batch() -> Batch {
        Batch {
            images: Tensor::new(vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0], &[2, 1, 2, 2]),
            labels: vec![0, 1],
        }
    }

    #[test]
    fn test_training_step_lowers_loss_and_clears_grads() {
        let scope = Scope::new(1);
        let program = linear_program(&scope);
        let exe = Executor::new(Place::select()).unwrap();

        let first = exe.run(&program, &batch()).unwrap();
        for _ in 0..20 {
            exe.run(&program, &batch()).unwrap();
        }
        let last = exe.run(&program.clone_for_test(), &batch()).unwrap();
        assert!(last.loss < first.loss);
        assert_eq!(last.top1, 1.0);
        assert!(program
            .parameters()
            .iter()
            .all(|p| p.tensor.grad_ref().is_none()));
        assert!(Tape::is_empty());
    }

    #[test]
    fn test_eval_leaves_parameters_untouched() {
        let scope = Scope::new(1);
        let program = linear_program(&scope).clone_for_test();
        assert!(program.optimizers().is_empty());
        let before = scope.parameter("fc7_weights").unwrap().tensor.data().clone();
        let exe = Executor::new(Place::Cpu).unwrap();
        let fetch = exe.run(&program, &batch()).unwrap();
        assert!(fetch.top5 >= fetch.top1);
        assert_eq!(*scope.parameter("fc7_weights").unwrap().tensor.data(), before);
    }

    #[test]
    fn test_feed_is_validated() {
        let scope = Scope::new(1);
        let program = linear_program(&scope);
        let exe = Executor::new(Place::Cpu).unwrap();

        let wrong_shape = Batch {
            images: Tensor::zeros(&[2, 4]),
            labels: vec![0, 1],
        };
        assert!(matches!(
            exe.run(&program, &wrong_shape),
            Err(Error::ShapeMismatch { .. })
        ));

        let bad_label = Batch {
            labels: vec![0, 7],
            ..batch()
        };
        assert!(matches!(
            exe.run(&program, &bad_label),
            Err(Error::ShapeMismatch { what, .. }) if what == "label range"
        ));
    }

    #[test]
    fn test_accelerator_is_unavailable() {
        assert!(matches!(
            Executor::new(Place::Accelerator(0)),
            Err(Error::DeviceUnavailable(_))
        ));
    }
}
