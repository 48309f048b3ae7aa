//! Row-major single-precision GEMM on top of `matrixmultiply`.

use matrixmultiply::sgemm;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trans {
    N,
    T,
}

/// `C = alpha * op(A) @ op(B) + beta * C`, all row-major.
///
/// `op(A)` is `m×k`, `op(B)` is `k×n`, `C` is `m×n`. With `Trans::T` the
/// stored matrix is the transpose (`k×m` for A, `n×k` for B).
#[allow(clippy::too_many_arguments)]
pub fn sgemm_rowmajor(
    trans_a: Trans,
    trans_b: Trans,
    m: usize,
    n: usize,
    k: usize,
    alpha: f32,
    a: &[f32],
    b: &[f32],
    beta: f32,
    c: &mut [f32],
) {
    assert!(a.len() >= m * k, "sgemm: A too small");
    assert!(b.len() >= k * n, "sgemm: B too small");
    assert!(c.len() >= m * n, "sgemm: C too small");
    if m == 0 || n == 0 {
        return;
    }

    let (a_rs, a_cs): (isize, isize) = match trans_a {
        Trans::N => (k as isize, 1),
        Trans::T => (1, m as isize),
    };
    let (b_rs, b_cs): (isize, isize) = match trans_b {
        Trans::N => (n as isize, 1),
        Trans::T => (1, k as isize),
    };

    // SAFETY: the asserts above bound every index touched by the strides.
    unsafe {
        sgemm(
            m,
            k,
            n,
            alpha,
            a.as_ptr(),
            a_rs,
            a_cs,
            b.as_ptr(),
            b_rs,
            b_cs,
            beta,
            c.as_mut_ptr(),
            n as isize,
            1,
        );
    }
}
