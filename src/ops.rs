use crate::gemm::{sgemm_rowmajor, Trans};
use crate::{tape::Tape, Tensor};
use std::ops::{Add, Mul, Neg, Sub};

// Gradient accumulation into the tensor's own buffer
#[inline]
pub fn accumulate_grad(t: &Tensor, src: &[f32]) {
    accumulate_grad_scaled(t, src, 1.0);
}

#[inline]
pub fn accumulate_grad_scaled(t: &Tensor, src: &[f32], scale: f32) {
    let mut slot = t.grad.borrow_mut();
    let g = slot.get_or_insert_with(|| vec![0.0; t.numel()]);
    debug_assert_eq!(g.len(), src.len());
    for (gi, &s) in g.iter_mut().zip(src) {
        *gi += scale * s;
    }
}

fn elementwise<F>(a: &Tensor, b: &Tensor, f: F) -> Tensor
where
    F: Fn(f32, f32) -> f32,
{
    assert_eq!(
        a.shape(),
        b.shape(),
        "Tensor dimensions must match"
    );
    let out_data: Vec<f32> = a
        .data()
        .iter()
        .zip(b.data().iter())
        .map(|(&x, &y)| f(x, y))
        .collect();
    Tensor::new(out_data, a.shape())
}

impl Add for &Tensor {
    type Output = Tensor;
    fn add(self, other: &Tensor) -> Tensor {
        let mut out = elementwise(self, other, |x, y| x + y);

        if self.requires_grad || other.requires_grad {
            out.requires_grad = true;
            let a = self.clone();
            let b = other.clone();
            let o = out.clone();

            Tape::push_binary_op(self, other, &out, move || {
                if let Some(gout) = o.grad_ref() {
                    if a.requires_grad {
                        accumulate_grad(&a, &gout);
                    }
                    if b.requires_grad {
                        accumulate_grad(&b, &gout);
                    }
                }
            });
        }
        out
    }
}

impl Sub for &Tensor {
    type Output = Tensor;
    fn sub(self, other: &Tensor) -> Tensor {
        let mut out = elementwise(self, other, |x, y| x - y);

        if self.requires_grad || other.requires_grad {
            out.requires_grad = true;
            let a = self.clone();
            let b = other.clone();
            let o = out.clone();

            Tape::push_binary_op(self, other, &out, move || {
                if let Some(gout) = o.grad_ref() {
                    if a.requires_grad {
                        accumulate_grad(&a, &gout);
                    }
                    if b.requires_grad {
                        accumulate_grad_scaled(&b, &gout, -1.0);
                    }
                }
            });
        }
        out
    }
}

impl Mul for &Tensor {
    type Output = Tensor;
    fn mul(self, other: &Tensor) -> Tensor {
        let mut out = elementwise(self, other, |x, y| x * y);

        if self.requires_grad || other.requires_grad {
            out.requires_grad = true;
            let a = self.clone();
            let b = other.clone();
            let o = out.clone();

            Tape::push_binary_op(self, other, &out, move || {
                if let Some(gout) = o.grad_ref() {
                    // Compute both before accumulating: `a` and `b` may alias.
                    let ga: Option<Vec<f32>> = a.requires_grad.then(|| {
                        gout.iter().zip(b.data().iter()).map(|(&g, &y)| g * y).collect()
                    });
                    let gb: Option<Vec<f32>> = b.requires_grad.then(|| {
                        gout.iter().zip(a.data().iter()).map(|(&g, &x)| g * x).collect()
                    });
                    if let Some(ga) = ga {
                        accumulate_grad(&a, &ga);
                    }
                    if let Some(gb) = gb {
                        accumulate_grad(&b, &gb);
                    }
                }
            });
        }
        out
    }
}

impl Neg for &Tensor {
    type Output = Tensor;
    fn neg(self) -> Tensor {
        let data: Vec<f32> = self.data().iter().map(|&x| -x).collect();
        let mut out = Tensor::new(data, self.shape());

        if self.requires_grad {
            out.requires_grad = true;
            let input = self.clone();
            let o = out.clone();
            Tape::push_unary_op(self, &out, move || {
                if let Some(gout) = o.grad_ref() {
                    accumulate_grad_scaled(&input, &gout, -1.0);
                }
            });
        }
        out
    }
}

macro_rules! forward_owned_binop {
    ($trait:ident, $method:ident) => {
        impl $trait<&Tensor> for Tensor {
            type Output = Tensor;
            fn $method(self, other: &Tensor) -> Tensor {
                (&self).$method(other)
            }
        }

        impl $trait<Tensor> for &Tensor {
            type Output = Tensor;
            fn $method(self, other: Tensor) -> Tensor {
                self.$method(&other)
            }
        }

        impl $trait for Tensor {
            type Output = Tensor;
            fn $method(self, other: Tensor) -> Tensor {
                (&self).$method(&other)
            }
        }
    };
}

forward_owned_binop!(Add, add);
forward_owned_binop!(Sub, sub);
forward_owned_binop!(Mul, mul);

impl Neg for Tensor {
    type Output = Tensor;
    fn neg(self) -> Tensor {
        -(&self)
    }
}

impl Tensor {
    pub fn relu(&self) -> Tensor {
        let result: Vec<f32> = self.data().iter().map(|&x| x.max(0.0)).collect();
        let mut output = Tensor::new(result, self.shape());

        if self.requires_grad {
            output.requires_grad = true;
            let input = self.clone();
            let out = output.clone();

            Tape::push_unary_op(self, &output, move || {
                if let Some(gout) = out.grad_ref() {
                    let gin: Vec<f32> = gout
                        .iter()
                        .zip(input.data().iter())
                        .map(|(&g, &v)| if v > 0.0 { g } else { 0.0 })
                        .collect();
                    accumulate_grad(&input, &gin);
                }
            });
        }

        output
    }

    /// `[batch, in] x [out, in]ᵀ -> [batch, out]`
    pub fn matmul_t(&self, weight: &Tensor) -> Tensor {
        assert_eq!(self.shape().len(), 2, "matmul_t: input must be 2D");
        assert_eq!(weight.shape().len(), 2, "matmul_t: weight must be 2D");
        let (m, k) = (self.shape()[0], self.shape()[1]);
        let n = weight.shape()[0];
        assert_eq!(
            k,
            weight.shape()[1],
            "Inner dimensions must match: {}x{} @ ({}x{})ᵀ",
            m,
            k,
            n,
            weight.shape()[1]
        );

        let mut result = vec![0.0f32; m * n];
        sgemm_rowmajor(
            Trans::N,
            Trans::T,
            m,
            n,
            k,
            1.0,
            &self.data(),
            &weight.data(),
            0.0,
            &mut result,
        );
        let mut output = Tensor::new(result, &[m, n]);

        if self.requires_grad || weight.requires_grad {
            output.requires_grad = true;
            let x = self.clone();
            let w = weight.clone();
            let out = output.clone();

            Tape::push_binary_op(self, weight, &output, move || {
                if let Some(gout) = out.grad_ref() {
                    if x.requires_grad {
                        // dX = dY @ W
                        let mut gx = vec![0.0; m * k];
                        sgemm_rowmajor(
                            Trans::N, Trans::N, m, k, n, 1.0, &gout, &w.data(), 0.0, &mut gx,
                        );
                        accumulate_grad(&x, &gx);
                    }
                    if w.requires_grad {
                        // dW = dYᵀ @ X
                        let mut gw = vec![0.0; n * k];
                        sgemm_rowmajor(
                            Trans::T, Trans::N, n, k, m, 1.0, &gout, &x.data(), 0.0, &mut gw,
                        );
                        accumulate_grad(&w, &gw);
                    }
                }
            });
        }

        output
    }

    /// Adds `[features]` along the last axis of `[batch, features]`.
    pub fn add_broadcast(&self, other: &Tensor) -> Tensor {
        if self.shape() == other.shape() {
            return self + other;
        }
        assert!(
            self.shape().len() == 2 && other.shape().len() == 1,
            "Unsupported broadcasting shapes: {:?} and {:?}",
            self.shape(),
            other.shape()
        );
        let features = self.shape()[1];
        assert_eq!(
            features,
            other.shape()[0],
            "Last dimension must match for broadcasting"
        );

        let bias = other.data();
        let result: Vec<f32> = self
            .data()
            .iter()
            .enumerate()
            .map(|(i, &v)| v + bias[i % features])
            .collect();
        drop(bias);
        let mut output = Tensor::new(result, self.shape());

        if self.requires_grad || other.requires_grad {
            output.requires_grad = true;
            let a = self.clone();
            let b = other.clone();
            let out = output.clone();

            Tape::push_binary_op(self, other, &output, move || {
                if let Some(gout) = out.grad_ref() {
                    if a.requires_grad {
                        accumulate_grad(&a, &gout);
                    }
                    if b.requires_grad {
                        let mut bias_grad = vec![0.0; features];
                        for row in gout.chunks(features) {
                            for (bg, &g) in bias_grad.iter_mut().zip(row) {
                                *bg += g;
                            }
                        }
                        accumulate_grad(&b, &bias_grad);
                    }
                }
            });
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn g(t: &Tensor) -> Vec<f32> {
        t.grad_ref().map(|g| g.clone()).unwrap_or_default()
    }

    #[test]
    fn test_mul_grads() {
        Tape::reset();
        let x = Tensor::scalar(2.0).requires_grad();
        let y = Tensor::scalar(3.0).requires_grad();
        let z = &x * &y;
        z.backward();

        assert!((z.data()[0] - 6.0).abs() < 1e-6);
        assert!((g(&x)[0] - 3.0).abs() < 1e-6);
        assert!((g(&y)[0] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_square_accumulates_both_sides() {
        Tape::reset();
        let x = Tensor::scalar(3.0).requires_grad();
        let z = &x * &x;
        z.backward();
        assert!((g(&x)[0] - 6.0).abs() < 1e-6);
    }

    #[test]
    fn test_compound_affine() {
        Tape::reset();
        let a = Tensor::scalar(2.0).requires_grad();
        let b = Tensor::scalar(3.0).requires_grad();
        let c = &a * &b + &a;
        c.backward();

        assert!((c.data()[0] - 8.0).abs() < 1e-6);
        assert!((g(&a)[0] - 4.0).abs() < 1e-6);
        assert!((g(&b)[0] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_sub_neg_relu() {
        Tape::reset();
        let x = Tensor::new(vec![-1.0, 2.0], &[2]).requires_grad();
        let y = Tensor::new(vec![0.5, 0.5], &[2]).requires_grad();
        let z = (-&x - &y).relu(); // [0.5, 0]
        assert_eq!(*z.data(), vec![0.5, 0.0]);
        z.mean().backward();

        assert_eq!(g(&x), vec![-0.5, 0.0]);
        assert_eq!(g(&y), vec![-0.5, 0.0]);
    }

    #[test]
    fn test_matmul_t_shapes_and_grads() {
        Tape::reset();
        let x = Tensor::new(vec![1., 2., 3., 4., 5., 6.], &[2, 3]).requires_grad();
        // W is [2 out, 3 in]
        let w = Tensor::new(vec![1., 0., 1., 0., 1., 0.], &[2, 3]).requires_grad();
        let y = x.matmul_t(&w);
        assert_eq!(y.shape(), &[2, 2]);
        assert_eq!(*y.data(), vec![4., 2., 10., 5.]);

        y.mean().backward();
        // dY = 0.25 everywhere; dX = dY @ W, dW = dYᵀ @ X
        assert_eq!(g(&x), vec![0.25, 0.25, 0.25, 0.25, 0.25, 0.25]);
        assert_eq!(g(&w), vec![1.25, 1.75, 2.25, 1.25, 1.75, 2.25]);
    }

    #[test]
    fn test_add_broadcast_bias_grad() {
        Tape::reset();
        let x = Tensor::new(vec![1., 2., 3., 4.], &[2, 2]).requires_grad();
        let b = Tensor::new(vec![10., 20.], &[2]).requires_grad();
        let y = x.add_broadcast(&b);
        assert_eq!(*y.data(), vec![11., 22., 13., 24.]);
        y.backward();
        assert_eq!(g(&b), vec![2.0, 2.0]);
        assert_eq!(g(&x), vec![1.0; 4]);
    }
}
