//! Grouped 2-D convolution (NCHW) lowered to im2col + GEMM.

use rayon::prelude::*;

use crate::error::Result;
use crate::gemm::{sgemm_rowmajor, Trans};
use crate::nn::{Mode, Module};
use crate::ops::accumulate_grad;
use crate::quantization::{OpType, QuantAwareContext, Quantizable};
use crate::scope::{Initializer, ParamAttr, Parameter, Scope};
use crate::{tape::Tape, Tensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Geometry {
    height: usize,
    width: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    out_height: usize,
    out_width: usize,
}

impl Geometry {
    fn col_rows(&self, group_channels: usize) -> usize {
        group_channels * self.kernel * self.kernel
    }

    fn out_area(&self) -> usize {
        self.out_height * self.out_width
    }
}

/// Unfolds `channels` planes of `x` into a `[channels*k*k, out_h*out_w]` matrix.
fn im2col(x: &[f32], channels: usize, g: &Geometry, col: &mut [f32]) {
    let (h, w, k) = (g.height, g.width, g.kernel);
    let area = g.out_area();
    for c in 0..channels {
        let plane = &x[c * h * w..(c + 1) * h * w];
        for ki in 0..k {
            for kj in 0..k {
                let row = (c * k + ki) * k + kj;
                let dst = &mut col[row * area..(row + 1) * area];
                for oy in 0..g.out_height {
                    let iy = (oy * g.stride + ki) as isize - g.padding as isize;
                    for ox in 0..g.out_width {
                        let ix = (ox * g.stride + kj) as isize - g.padding as isize;
                        dst[oy * g.out_width + ox] =
                            if iy >= 0 && ix >= 0 && (iy as usize) < h && (ix as usize) < w {
                                plane[iy as usize * w + ix as usize]
                            } else {
                                0.0
                            };
                    }
                }
            }
        }
    }
}

/// Inverse of [`im2col`]: scatters (and sums) columns back into planes.
fn col2im(col: &[f32], channels: usize, g: &Geometry, x: &mut [f32]) {
    let (h, w, k) = (g.height, g.width, g.kernel);
    let area = g.out_area();
    for c in 0..channels {
        let plane = &mut x[c * h * w..(c + 1) * h * w];
        for ki in 0..k {
            for kj in 0..k {
                let row = (c * k + ki) * k + kj;
                let src = &col[row * area..(row + 1) * area];
                for oy in 0..g.out_height {
                    let iy = (oy * g.stride + ki) as isize - g.padding as isize;
                    if iy < 0 || iy as usize >= h {
                        continue;
                    }
                    for ox in 0..g.out_width {
                        let ix = (ox * g.stride + kj) as isize - g.padding as isize;
                        if ix < 0 || ix as usize >= w {
                            continue;
                        }
                        plane[iy as usize * w + ix as usize] += src[oy * g.out_width + ox];
                    }
                }
            }
        }
    }
}

impl Tensor {
    /// `[N, C, H, W] * [O, C/groups, k, k] -> [N, O, H', W']`, square kernels only.
    pub fn conv2d(&self, weight: &Tensor, stride: usize, padding: usize, groups: usize) -> Tensor {
        assert_eq!(self.shape().len(), 4, "conv2d: input must be NCHW");
        assert_eq!(weight.shape().len(), 4, "conv2d: weight must be OIHW");
        let (n, c, h, w) = (
            self.shape()[0],
            self.shape()[1],
            self.shape()[2],
            self.shape()[3],
        );
        let (o, cg, k) = (weight.shape()[0], weight.shape()[1], weight.shape()[2]);
        assert_eq!(weight.shape()[3], k, "conv2d: kernel must be square");
        assert!(groups > 0 && c % groups == 0 && o % groups == 0, "conv2d: bad groups");
        assert_eq!(cg * groups, c, "conv2d: weight channels do not match input");
        assert!(stride > 0, "conv2d: stride must be positive");
        assert!(h + 2 * padding >= k && w + 2 * padding >= k, "conv2d: kernel larger than input");

        let geom = Geometry {
            height: h,
            width: w,
            kernel: k,
            stride,
            padding,
            out_height: (h + 2 * padding - k) / stride + 1,
            out_width: (w + 2 * padding - k) / stride + 1,
        };
        let og = o / groups;
        let rows = geom.col_rows(cg);
        let area = geom.out_area();
        let in_sample = c * h * w;
        let out_sample = o * area;
        let w_group = og * rows;

        let mut result = vec![0.0f32; n * out_sample];
        {
            let x_ref = self.data();
            let w_ref = weight.data();
            let xs: &[f32] = &x_ref;
            let ws: &[f32] = &w_ref;
            result
                .par_chunks_mut(out_sample.max(1))
                .enumerate()
                .for_each(|(i, out)| {
                    let x = &xs[i * in_sample..(i + 1) * in_sample];
                    let mut col = vec![0.0f32; rows * area];
                    for gi in 0..groups {
                        im2col(&x[gi * cg * h * w..], cg, &geom, &mut col);
                        sgemm_rowmajor(
                            Trans::N,
                            Trans::N,
                            og,
                            area,
                            rows,
                            1.0,
                            &ws[gi * w_group..(gi + 1) * w_group],
                            &col,
                            0.0,
                            &mut out[gi * og * area..(gi + 1) * og * area],
                        );
                    }
                });
        }
        let mut output = Tensor::new(result, &[n, o, geom.out_height, geom.out_width]);

        if self.requires_grad || weight.requires_grad {
            output.requires_grad = true;
            let x = self.clone();
            let wt = weight.clone();
            let out = output.clone();

            Tape::push_binary_op(self, weight, &output, move || {
                let Some(gout) = out.grad_ref() else {
                    return;
                };
                let gy: &[f32] = &gout;

                if x.requires_grad {
                    let w_ref = wt.data();
                    let ws: &[f32] = &w_ref;
                    let mut gx = vec![0.0f32; n * in_sample];
                    gx.par_chunks_mut(in_sample.max(1))
                        .enumerate()
                        .for_each(|(i, gxi)| {
                            let gyi = &gy[i * out_sample..(i + 1) * out_sample];
                            let mut dcol = vec![0.0f32; rows * area];
                            for gi in 0..groups {
                                // dcol = W_gᵀ @ dY_g
                                sgemm_rowmajor(
                                    Trans::T,
                                    Trans::N,
                                    rows,
                                    area,
                                    og,
                                    1.0,
                                    &ws[gi * w_group..(gi + 1) * w_group],
                                    &gyi[gi * og * area..(gi + 1) * og * area],
                                    0.0,
                                    &mut dcol,
                                );
                                col2im(&dcol, cg, &geom, &mut gxi[gi * cg * h * w..]);
                            }
                        });
                    accumulate_grad(&x, &gx);
                }

                if wt.requires_grad {
                    let xs = x.data();
                    let mut gw = vec![0.0f32; o * rows];
                    let mut col = vec![0.0f32; rows * area];
                    for i in 0..n {
                        let xi = &xs[i * in_sample..(i + 1) * in_sample];
                        let gyi = &gy[i * out_sample..(i + 1) * out_sample];
                        for gi in 0..groups {
                            im2col(&xi[gi * cg * h * w..], cg, &geom, &mut col);
                            // dW_g += dY_g @ colᵀ
                            sgemm_rowmajor(
                                Trans::N,
                                Trans::T,
                                og,
                                rows,
                                area,
                                1.0,
                                &gyi[gi * og * area..(gi + 1) * og * area],
                                &col,
                                1.0,
                                &mut gw[gi * w_group..(gi + 1) * w_group],
                            );
                        }
                    }
                    accumulate_grad(&wt, &gw);
                }
            });
        }

        output
    }
}

/// Convolution layer without bias. Lowered as `depthwise_conv2d` when every
/// input channel forms its own group, `conv2d` otherwise.
#[derive(Debug, Clone)]
pub struct Conv2d {
    name: String,
    pub weight: Parameter,
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: usize,
    pub stride: usize,
    pub padding: usize,
    pub groups: usize,
}

impl Conv2d {
    /// Registers `<name>_weights` with shape `[out, in/groups, k, k]` (MSRA init).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        scope: &Scope,
        name: &str,
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        groups: usize,
    ) -> Result<Self> {
        let fan_in = in_channels / groups * kernel_size * kernel_size;
        let weight = scope.create_parameter(
            ParamAttr::new(format!("{name}_weights"), Initializer::Msra { fan_in }),
            &[out_channels, in_channels / groups, kernel_size, kernel_size],
        )?;
        Ok(Self {
            name: name.to_string(),
            weight,
            in_channels,
            out_channels,
            kernel_size,
            stride,
            padding,
            groups,
        })
    }
}

impl Quantizable for Conv2d {
    fn op_type(&self) -> OpType {
        if self.groups > 1 && self.groups == self.in_channels {
            OpType::DepthwiseConv2d
        } else {
            OpType::Conv2d
        }
    }

    fn weight(&self) -> &Parameter {
        &self.weight
    }

    fn bias(&self) -> Option<&Parameter> {
        None
    }

    fn apply(&self, input: &Tensor, weight: &Tensor) -> Tensor {
        input.conv2d(weight, self.stride, self.padding, self.groups)
    }

    fn add_bias(&self, output: Tensor) -> Tensor {
        output
    }

    fn clone_quantizable(&self) -> Box<dyn Quantizable> {
        Box::new(self.clone())
    }
}

impl Module for Conv2d {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, input: &Tensor, _mode: Mode) -> Tensor {
        self.apply(input, &self.weight.tensor)
    }

    fn parameters(&self) -> Vec<Parameter> {
        vec![self.weight.clone()]
    }

    fn box_clone(&self) -> Box<dyn Module> {
        Box::new(self.clone())
    }

    fn quant_aware(&self, ctx: &mut QuantAwareContext<'_>) -> Result<Box<dyn Module>> {
        ctx.instrument(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Direct nested-loop reference.
    fn naive_conv(
        x: &[f32],
        xs: [usize; 4],
        w: &[f32],
        ws: [usize; 4],
        stride: usize,
        pad: usize,
        groups: usize,
    ) -> Vec<f32> {
        let [n, c, h, wd] = xs;
        let [o, cg, k, _] = ws;
        let og = o / groups;
        let ho = (h + 2 * pad - k) / stride + 1;
        let wo = (wd + 2 * pad - k) / stride + 1;
        let mut out = vec![0.0; n * o * ho * wo];
        for b in 0..n {
            for oc in 0..o {
                let g = oc / og;
                for oy in 0..ho {
                    for ox in 0..wo {
                        let mut acc = 0.0;
                        for ic in 0..cg {
                            let cin = g * cg + ic;
                            for ki in 0..k {
                                for kj in 0..k {
                                    let iy = (oy * stride + ki) as isize - pad as isize;
                                    let ix = (ox * stride + kj) as isize - pad as isize;
                                    if iy < 0 || ix < 0 || iy as usize >= h || ix as usize >= wd {
                                        continue;
                                    }
                                    acc += x[((b * c + cin) * h + iy as usize) * wd + ix as usize]
                                        * w[((oc * cg + ic) * k + ki) * k + kj];
                                }
                            }
                        }
                        out[((b * o + oc) * ho + oy) * wo + ox] = acc;
                    }
                }
            }
        }
        out
    }

    fn ramp(n: usize, scale: f32) -> Vec<f32> {
        (0..n).map(|i| ((i * 7 % 11) as f32 - 5.0) * scale).collect()
    }

    #[test]
    fn test_conv2d_matches_reference() {
        for &(c, o, groups, stride, pad) in &[(2, 4, 1, 1, 1), (4, 4, 4, 2, 1), (3, 6, 3, 1, 0)] {
            let xs = [2, c, 5, 5];
            let ws = [o, c / groups, 3, 3];
            let x = ramp(xs.iter().product(), 0.1);
            let w = ramp(ws.iter().product(), 0.05);

            let out = Tensor::new(x.clone(), &xs).conv2d(
                &Tensor::new(w.clone(), &ws),
                stride,
                pad,
                groups,
            );
            let expected = naive_conv(&x, xs, &w, ws, stride, pad, groups);
            assert_eq!(out.data().len(), expected.len());
            for (a, b) in out.data().iter().zip(expected.iter()) {
                assert!((a - b).abs() < 1e-4, "{a} vs {b}");
            }
        }
    }

    #[test]
    fn test_output_shape_stride_two() {
        let x = Tensor::zeros(&[1, 1, 28, 28]);
        let w = Tensor::zeros(&[8, 1, 3, 3]);
        assert_eq!(x.conv2d(&w, 2, 1, 1).shape(), &[1, 8, 14, 14]);
    }

    #[test]
    fn test_conv2d_gradients_match_finite_differences() {
        let xs = [1, 2, 4, 4];
        let ws = [2, 1, 3, 3];
        let x0 = ramp(32, 0.1);
        let w0 = ramp(18, 0.07);
        let loss = |x: &[f32], w: &[f32]| -> f32 {
            naive_conv(x, xs, w, ws, 1, 1, 2).iter().map(|v| v * v).sum::<f32>() * 0.5
        };

        Tape::reset();
        let x = Tensor::new(x0.clone(), &xs).requires_grad();
        let w = Tensor::new(w0.clone(), &ws).requires_grad();
        let y = x.conv2d(&w, 1, 1, 2);
        // d(0.5*sum(y^2))/dy = y, seeded via y*y mean scaled.
        let sq = &y * &y;
        sq.mean().backward();
        let scale = sq.numel() as f32 * 0.5;

        let gx = x.grad_ref().unwrap().clone();
        let gw = w.grad_ref().unwrap().clone();
        let eps = 1e-2;
        for i in [0usize, 5, 17, 31] {
            let mut xp = x0.clone();
            xp[i] += eps;
            let mut xm = x0.clone();
            xm[i] -= eps;
            let fd = (loss(&xp, &w0) - loss(&xm, &w0)) / (2.0 * eps);
            assert!((gx[i] * scale - fd).abs() < 1e-2, "dx[{i}] {} vs {fd}", gx[i] * scale);
        }
        for i in [0usize, 4, 9, 17] {
            let mut wp = w0.clone();
            wp[i] += eps;
            let mut wm = w0.clone();
            wm[i] -= eps;
            let fd = (loss(&x0, &wp) - loss(&x0, &wm)) / (2.0 * eps);
            assert!((gw[i] * scale - fd).abs() < 1e-2, "dw[{i}] {} vs {fd}", gw[i] * scale);
        }
    }

    #[test]
    fn test_layer_op_types_and_names() {
        let scope = Scope::new(0);
        let dense = Conv2d::new(&scope, "conv1", 1, 8, 3, 2, 1, 1).unwrap();
        let dw = Conv2d::new(&scope, "conv2_1_dw", 8, 8, 3, 1, 1, 8).unwrap();
        assert_eq!(dense.weight.name(), "conv1_weights");
        assert_eq!(dense.op_type(), OpType::Conv2d);
        assert_eq!(dw.op_type(), OpType::DepthwiseConv2d);
        assert_eq!(dw.weight.tensor.shape(), &[8, 1, 3, 3]);
    }
}
