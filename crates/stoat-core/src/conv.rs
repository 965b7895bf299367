use crate::dtype::DType;
use crate::error::{Error, Result};

// ConvLayer — shape contract of a 3-D convolution layer
//
// The descriptor is pure metadata, shared by every backend so that both
// execution paths agree on dimI/dimF/dimO before a single element moves.
// Tensor axis order follows the kernels' access pattern:
//
//   dimI = (C, D, H, W, N)   input
//   dimF = (C, T, R, S, K)   filters
//   dimO = (K, M, P, Q, N)   output
//
// with N the batch size innermost, so one gathered window row holds all
// batch lanes contiguously.

/// Derived output extent for one axis:
/// `floor((in + 2*pad - ext) / stride) + 1`, rejected when non-positive.
pub(crate) fn out_dim(axis: &str, input: usize, ext: usize, pad: usize, stride: usize) -> Result<usize> {
    if ext == 0 || stride == 0 || input == 0 {
        return Err(Error::invalid_shape(format!(
            "{axis}: extent {ext}, stride {stride} and input {input} must all be positive"
        )));
    }
    if pad >= ext {
        // A window shifted fully into the padding has no valid position.
        return Err(Error::invalid_shape(format!(
            "{axis}: padding {pad} must be smaller than window extent {ext}"
        )));
    }
    let span = input as i64 + 2 * pad as i64 - ext as i64;
    if span < 0 {
        return Err(Error::invalid_shape(format!(
            "{axis}: window extent {ext} exceeds padded input {}",
            input + 2 * pad
        )));
    }
    Ok((span / stride as i64) as usize + 1)
}

/// Immutable metadata record for one convolution layer.
///
/// Construction derives the output spatial dims (M, P, Q) and validates
/// every parameter eagerly; kernels trust the descriptor afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvLayer {
    dtype: DType,
    n: usize,
    c: usize,
    k: usize,
    dhw: (usize, usize, usize),
    trs: (usize, usize, usize),
    mpq: (usize, usize, usize),
    padding: (usize, usize, usize),
    strides: (usize, usize, usize),
}

impl ConvLayer {
    /// Build a descriptor from layer parameters.
    ///
    /// Fails with [`Error::InvalidShape`] when a derived output dim would
    /// be non-positive or a padding reaches the matching filter extent.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dtype: DType,
        n: usize,
        c: usize,
        k: usize,
        dhw: (usize, usize, usize),
        trs: (usize, usize, usize),
        padding: (usize, usize, usize),
        strides: (usize, usize, usize),
    ) -> Result<Self> {
        if !matches!(dtype, DType::F16 | DType::F32) {
            return Err(Error::unsupported(format!(
                "conv layers support f16/f32, got {dtype}"
            )));
        }
        if n == 0 || c == 0 || k == 0 {
            return Err(Error::invalid_shape(format!(
                "N={n}, C={c}, K={k} must all be positive"
            )));
        }
        let (d, h, w) = dhw;
        let (t, r, s) = trs;
        let (pad_d, pad_h, pad_w) = padding;
        let (str_d, str_h, str_w) = strides;

        let m = out_dim("depth", d, t, pad_d, str_d)?;
        let p = out_dim("height", h, r, pad_h, str_h)?;
        let q = out_dim("width", w, s, pad_w, str_w)?;

        Ok(ConvLayer {
            dtype,
            n,
            c,
            k,
            dhw,
            trs,
            mpq: (m, p, q),
            padding,
            strides,
        })
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }
    pub fn n(&self) -> usize {
        self.n
    }
    pub fn c(&self) -> usize {
        self.c
    }
    pub fn k(&self) -> usize {
        self.k
    }
    /// Input spatial dims (D, H, W).
    pub fn dhw(&self) -> (usize, usize, usize) {
        self.dhw
    }
    /// Filter spatial dims (T, R, S).
    pub fn trs(&self) -> (usize, usize, usize) {
        self.trs
    }
    /// Derived output spatial dims (M, P, Q).
    pub fn mpq(&self) -> (usize, usize, usize) {
        self.mpq
    }
    pub fn padding(&self) -> (usize, usize, usize) {
        self.padding
    }
    pub fn strides(&self) -> (usize, usize, usize) {
        self.strides
    }

    /// Input tensor dims (C, D, H, W, N).
    pub fn dim_i(&self) -> [usize; 5] {
        let (d, h, w) = self.dhw;
        [self.c, d, h, w, self.n]
    }

    /// Filter tensor dims (C, T, R, S, K).
    pub fn dim_f(&self) -> [usize; 5] {
        let (t, r, s) = self.trs;
        [self.c, t, r, s, self.k]
    }

    /// Output tensor dims (K, M, P, Q, N).
    pub fn dim_o(&self) -> [usize; 5] {
        let (m, p, q) = self.mpq;
        [self.k, m, p, q, self.n]
    }

    /// Number of taps in one filter window (C*T*R*S).
    pub fn window_len(&self) -> usize {
        let (t, r, s) = self.trs;
        self.c * t * r * s
    }

    /// Sentinel flat index standing for the implicit zero element: one past
    /// the collapsed (C*D*H*W) input plane.
    pub fn sentinel(&self) -> usize {
        let (d, h, w) = self.dhw;
        self.c * d * h * w
    }

    /// Flat indices of one gathered window, anchored at the (possibly
    /// negative) input coordinates `(mt, pr, qs)`. Each index addresses a
    /// row of N batch lanes in the collapsed (C*D*H*W, N) view of the
    /// input; out-of-bounds taps yield the sentinel.
    ///
    /// Enumeration order is fixed: channel, then depth, row, column. Both
    /// backends and the reference oracle share this order.
    pub fn window_indices(&self, mt: i64, pr: i64, qs: i64, out: &mut Vec<usize>) {
        let (d, h, w) = self.dhw;
        let (t, r, s) = self.trs;
        let hw = h * w;
        let dhw = d * hw;
        let sentinel = self.sentinel();

        out.clear();
        for c in 0..self.c {
            let ci = c * dhw;
            for ti in 0..t {
                let z = mt + ti as i64;
                let zb = z >= 0 && (z as usize) < d;
                for ri in 0..r {
                    let y = pr + ri as i64;
                    let yb = zb && y >= 0 && (y as usize) < h;
                    for si in 0..s {
                        let x = qs + si as i64;
                        if yb && x >= 0 && (x as usize) < w {
                            out.push(ci + z as usize * hw + y as usize * w + x as usize);
                        } else {
                            out.push(sentinel);
                        }
                    }
                }
            }
        }
    }
}
