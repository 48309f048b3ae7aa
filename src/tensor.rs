use crate::{ops, tape::Tape};
use smallvec::SmallVec;
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::rc::Rc;

#[derive(Clone)]
pub struct Tensor {
    data: Rc<RefCell<Vec<f32>>>,
    pub(crate) shape: SmallVec<[usize; 4]>,
    // In-place gradient accumulation buffer (allocated on demand)
    pub grad: Rc<RefCell<Option<Vec<f32>>>>,
    pub requires_grad: bool,
    pub tape_node: Cell<Option<usize>>,
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let data = self.data.borrow();
        let preview = &data[..data.len().min(8)];
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("data", &preview)
            .field("requires_grad", &self.requires_grad)
            .field("has_grad", &self.grad.borrow().is_some())
            .finish()
    }
}

impl Tensor {
    pub fn new(data: Vec<f32>, shape: &[usize]) -> Self {
        assert_eq!(
            data.len(),
            shape.iter().product::<usize>(),
            "data length does not match shape {:?}",
            shape
        );
        Tensor {
            data: Rc::new(RefCell::new(data)),
            shape: shape.iter().cloned().collect(),
            grad: Rc::new(RefCell::new(None)),
            requires_grad: false,
            tape_node: Cell::new(None),
        }
    }

    pub fn scalar(value: f32) -> Self {
        Tensor::new(vec![value], &[1])
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Self::full(shape, 0.0)
    }

    pub fn full(shape: &[usize], value: f32) -> Self {
        Tensor::new(vec![value; shape.iter().product()], shape)
    }

    pub fn requires_grad(mut self) -> Self {
        self.requires_grad = true;
        self
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn data(&self) -> Ref<'_, Vec<f32>> {
        self.data.borrow()
    }

    pub fn data_mut(&self) -> RefMut<'_, Vec<f32>> {
        self.data.borrow_mut()
    }

    /// Whether two handles share the same storage.
    pub fn same_storage(&self, other: &Tensor) -> bool {
        Rc::ptr_eq(&self.data, &other.data)
    }

    /// Zero-copy view of gradient buffer, if present.
    pub fn grad_ref(&self) -> Option<Ref<'_, Vec<f32>>> {
        Ref::filter_map(self.grad.borrow(), |g| g.as_ref()).ok()
    }

    /// Materializes the gradient as a standalone tensor (allocates).
    pub fn grad(&self) -> Option<Tensor> {
        self.grad
            .borrow()
            .as_ref()
            .map(|g| Tensor::new(g.clone(), &self.shape))
    }

    pub fn backward(&self) {
        // Seed dL/dself = 1
        *self.grad.borrow_mut() = Some(vec![1.0; self.numel()]);

        if let Some(node_id) = self.tape_node.get() {
            crate::tape::backward(node_id);
        }
    }

    pub fn zero_grad(&self) {
        *self.grad.borrow_mut() = None;
    }

    /// Copy of the data detached from the tape.
    pub fn detach(&self) -> Tensor {
        Tensor::new(self.data().clone(), &self.shape)
    }

    /// Same elements, new shape. Gradient flows back unchanged.
    pub fn reshape(&self, shape: &[usize]) -> Tensor {
        assert_eq!(
            self.numel(),
            shape.iter().product::<usize>(),
            "cannot reshape {:?} into {:?}",
            self.shape,
            shape
        );
        let mut output = Tensor::new(self.data().clone(), shape);

        if self.requires_grad {
            output.requires_grad = true;
            let input = self.clone();
            let out = output.clone();
            Tape::push_unary_op(self, &output, move || {
                if let Some(gout) = out.grad_ref() {
                    ops::accumulate_grad(&input, &gout);
                }
            });
        }

        output
    }

    /// Broadcast a one-element tensor to `shape`; the gradient is summed back.
    pub fn expand_as(&self, shape: &[usize]) -> Tensor {
        assert_eq!(self.numel(), 1, "expand_as expects a single-element tensor");
        let value = self.data()[0];
        let mut output = Tensor::full(shape, value);

        if self.requires_grad {
            output.requires_grad = true;
            let input = self.clone();
            let out = output.clone();
            Tape::push_unary_op(self, &output, move || {
                if let Some(gout) = out.grad_ref() {
                    let total: f32 = gout.iter().sum();
                    ops::accumulate_grad(&input, &[total]);
                }
            });
        }

        output
    }

    /// Mean of all elements
    pub fn mean(&self) -> Tensor {
        let n = self.numel() as f32;
        let mean_val = self.data().iter().sum::<f32>() / n;
        let mut output = Tensor::scalar(mean_val);

        if self.requires_grad {
            output.requires_grad = true;
            let input = self.clone();
            let out = output.clone();
            Tape::push_unary_op(self, &output, move || {
                if let Some(gout) = out.grad_ref() {
                    let grad_vec = vec![gout[0] / n; input.numel()];
                    ops::accumulate_grad(&input, &grad_vec);
                }
            });
        }

        output
    }
}
