use crate::conv::out_dim;
use crate::dtype::DType;
use crate::error::{Error, Result};
use std::fmt;

// PoolLayer — shape contract of a pooling layer
//
// Pooling differs from convolution in one structural way: the window also
// slides over the channel axis, with extent J and its own padding/stride.
// The output channel count K is therefore derived, not given.
//
//   dimI = (C, D, H, W, N)
//   dimO = (K, M, P, Q, N)

/// The reduction applied inside each pooling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolOp {
    /// Maximum over the window; backward routes the gradient to the argmax.
    Max,
    /// Mean over the window with a fixed divisor of J*T*R*S taps;
    /// out-of-bounds taps count as zero.
    Avg,
    /// Euclidean norm over the window.
    L2,
}

impl fmt::Display for PoolOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PoolOp::Max => "max",
            PoolOp::Avg => "avg",
            PoolOp::L2 => "l2",
        };
        write!(f, "{}", s)
    }
}

/// Immutable metadata record for one pooling layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolLayer {
    dtype: DType,
    op: PoolOp,
    n: usize,
    c: usize,
    dhw: (usize, usize, usize),
    jtrs: (usize, usize, usize, usize),
    kmpq: (usize, usize, usize, usize),
    padding: (usize, usize, usize, usize),
    strides: (usize, usize, usize, usize),
}

impl PoolLayer {
    /// Build a descriptor from layer parameters.
    ///
    /// Same eager validation as [`crate::ConvLayer::new`], extended to the
    /// channel-window axis.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dtype: DType,
        op: PoolOp,
        n: usize,
        c: usize,
        dhw: (usize, usize, usize),
        jtrs: (usize, usize, usize, usize),
        padding: (usize, usize, usize, usize),
        strides: (usize, usize, usize, usize),
    ) -> Result<Self> {
        if !matches!(dtype, DType::F16 | DType::F32) {
            return Err(Error::unsupported(format!(
                "pool layers support f16/f32, got {dtype}"
            )));
        }
        if n == 0 || c == 0 {
            return Err(Error::invalid_shape(format!(
                "N={n} and C={c} must be positive"
            )));
        }
        let (d, h, w) = dhw;
        let (j, t, r, s) = jtrs;
        let (pad_j, pad_d, pad_h, pad_w) = padding;
        let (str_j, str_d, str_h, str_w) = strides;

        let k = out_dim("channel", c, j, pad_j, str_j)?;
        let m = out_dim("depth", d, t, pad_d, str_d)?;
        let p = out_dim("height", h, r, pad_h, str_h)?;
        let q = out_dim("width", w, s, pad_w, str_w)?;

        Ok(PoolLayer {
            dtype,
            op,
            n,
            c,
            dhw,
            jtrs,
            kmpq: (k, m, p, q),
            padding,
            strides,
        })
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }
    pub fn op(&self) -> PoolOp {
        self.op
    }
    pub fn n(&self) -> usize {
        self.n
    }
    pub fn c(&self) -> usize {
        self.c
    }
    pub fn dhw(&self) -> (usize, usize, usize) {
        self.dhw
    }
    /// Window dims (J, T, R, S), J being the channel-window extent.
    pub fn jtrs(&self) -> (usize, usize, usize, usize) {
        self.jtrs
    }
    /// Derived output dims (K, M, P, Q).
    pub fn kmpq(&self) -> (usize, usize, usize, usize) {
        self.kmpq
    }
    pub fn padding(&self) -> (usize, usize, usize, usize) {
        self.padding
    }
    pub fn strides(&self) -> (usize, usize, usize, usize) {
        self.strides
    }

    /// Input tensor dims (C, D, H, W, N).
    pub fn dim_i(&self) -> [usize; 5] {
        let (d, h, w) = self.dhw;
        [self.c, d, h, w, self.n]
    }

    /// Output tensor dims (K, M, P, Q, N).
    pub fn dim_o(&self) -> [usize; 5] {
        let (k, m, p, q) = self.kmpq;
        [k, m, p, q, self.n]
    }

    /// Number of taps in one window (J*T*R*S) — also the fixed `avg`
    /// divisor.
    pub fn window_len(&self) -> usize {
        let (j, t, r, s) = self.jtrs;
        j * t * r * s
    }

    /// Sentinel flat index for the implicit zero element.
    pub fn sentinel(&self) -> usize {
        let (d, h, w) = self.dhw;
        self.c * d * h * w
    }

    /// Flat indices of one pooling window anchored at `(kj, mt, pr, qs)`,
    /// the channel anchor included. Enumeration order is fixed:
    /// channel-window, then depth, row, column — the order that breaks
    /// `max` ties.
    pub fn window_indices(&self, kj: i64, mt: i64, pr: i64, qs: i64, out: &mut Vec<usize>) {
        let (d, h, w) = self.dhw;
        let (j, t, r, s) = self.jtrs;
        let hw = h * w;
        let dhw = d * hw;
        let sentinel = self.sentinel();

        out.clear();
        for ji in 0..j {
            let cc = kj + ji as i64;
            let cb = cc >= 0 && (cc as usize) < self.c;
            for ti in 0..t {
                let z = mt + ti as i64;
                let zb = cb && z >= 0 && (z as usize) < d;
                for ri in 0..r {
                    let y = pr + ri as i64;
                    let yb = zb && y >= 0 && (y as usize) < h;
                    for si in 0..s {
                        let x = qs + si as i64;
                        if yb && x >= 0 && (x as usize) < w {
                            out.push(
                                cc as usize * dhw + z as usize * hw + y as usize * w + x as usize,
                            );
                        } else {
                            out.push(sentinel);
                        }
                    }
                }
            }
        }
    }
}
