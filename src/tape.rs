use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::tensor::Tensor;

thread_local! {
    static TAPE: RefCell<Vec<Node>> = RefCell::new(Vec::new());
    static RECORDING: Cell<bool> = Cell::new(true);
}

struct Node {
    // Rc so closures can be cloned out of the borrow before running.
    backward_fn: Rc<dyn Fn()>,
}

/// Handle to the thread-local gradient tape.
pub struct Tape;

impl Tape {
    /// Clear recorded nodes. Call once per iteration before the forward pass.
    pub fn reset() {
        TAPE.with(|t| t.borrow_mut().clear());
    }

    /// Number of recorded nodes.
    pub fn len() -> usize {
        TAPE.with(|t| t.borrow().len())
    }

    pub fn is_empty() -> bool {
        Self::len() == 0
    }

    /// Whether ops are currently being recorded.
    pub fn is_recording() -> bool {
        RECORDING.with(|r| r.get())
    }

    pub fn push_binary_op<F>(a: &Tensor, b: &Tensor, output: &Tensor, backward_fn: F)
    where
        F: Fn() + 'static,
    {
        if !(a.requires_grad || b.requires_grad) {
            return;
        }
        Self::push(output, backward_fn);
    }

    pub fn push_unary_op<F>(input: &Tensor, output: &Tensor, backward_fn: F)
    where
        F: Fn() + 'static,
    {
        if !input.requires_grad {
            return;
        }
        Self::push(output, backward_fn);
    }

    /// Records an op with any number of inputs.
    pub fn push_op<F>(inputs: &[&Tensor], output: &Tensor, backward_fn: F)
    where
        F: Fn() + 'static,
    {
        if !inputs.iter().any(|t| t.requires_grad) {
            return;
        }
        Self::push(output, backward_fn);
    }

    fn push<F>(output: &Tensor, backward_fn: F)
    where
        F: Fn() + 'static,
    {
        if !Self::is_recording() {
            return;
        }
        let id = TAPE.with(|t| {
            let mut nodes = t.borrow_mut();
            nodes.push(Node {
                backward_fn: Rc::new(backward_fn),
            });
            nodes.len() - 1
        });
        output.tape_node.set(Some(id));
    }
}

/// Run `f` without recording anything on the tape.
pub fn no_grad<T>(f: impl FnOnce() -> T) -> T {
    struct Restore(bool);
    impl Drop for Restore {
        fn drop(&mut self) {
            RECORDING.with(|r| r.set(self.0));
        }
    }

    let _restore = Restore(RECORDING.with(|r| r.replace(false)));
    f()
}

/// Execute backward functions up to `final_node_id` (inclusive), in reverse.
pub fn backward(final_node_id: usize) {
    // Clone closures out first so no RefCell borrow is alive while they run.
    let fns: Vec<Rc<dyn Fn()>> = TAPE.with(|t| {
        let nodes = t.borrow();
        if nodes.is_empty() {
            return Vec::new();
        }
        let end = final_node_id.min(nodes.len() - 1);
        nodes[..=end].iter().map(|n| n.backward_fn.clone()).collect()
    });

    for f in fns.into_iter().rev() {
        (f)();
    }
}
