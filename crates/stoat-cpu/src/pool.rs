use rayon::prelude::*;
use stoat_core::{PoolLayer, PoolOp, Result, WithDType};

// Pooling kernels, host path
//
// The window slides over the channel axis too (extent J), so windows are
// enumerated per output channel position k as well as per (m, p, q).
// Tie-breaking for max and the fixed avg divisor are part of the
// cross-backend contract; both live here and nowhere else.

/// Forward pooling. Overwrites `o`, so repeated calls are idempotent.
pub fn fprop<T: WithDType>(desc: &PoolLayer, i: &[T], o: &mut [T]) -> Result<()> {
    let n = desc.n();
    let (_, m_dim, p_dim, q_dim) = desc.kmpq();
    let (pad_j, pad_d, pad_h, pad_w) = desc.padding();
    let (str_j, str_d, str_h, str_w) = desc.strides();
    let sentinel = desc.sentinel();
    let divisor = desc.window_len() as f64;
    let op = desc.op();
    let mpq_n = m_dim * p_dim * q_dim * n;

    o.par_chunks_mut(mpq_n).enumerate().for_each(|(k, o_chunk)| {
        let kj = (k * str_j) as i64 - pad_j as i64;
        let mut idx = Vec::new();
        let mut w = 0usize;
        for m in 0..m_dim {
            let mt = (m * str_d) as i64 - pad_d as i64;
            for p in 0..p_dim {
                let pr = (p * str_h) as i64 - pad_h as i64;
                for q in 0..q_dim {
                    let qs = (q * str_w) as i64 - pad_w as i64;
                    desc.window_indices(kj, mt, pr, qs, &mut idx);
                    for lane in 0..n {
                        let val = match op {
                            PoolOp::Max => {
                                let mut best = f64::NEG_INFINITY;
                                for &src in &idx {
                                    if src != sentinel {
                                        let v = i[src * n + lane].to_f64();
                                        if v > best {
                                            best = v;
                                        }
                                    }
                                }
                                best
                            }
                            PoolOp::Avg => {
                                let mut sum = 0f64;
                                for &src in &idx {
                                    if src != sentinel {
                                        sum += i[src * n + lane].to_f64();
                                    }
                                }
                                sum / divisor
                            }
                            PoolOp::L2 => {
                                let mut sumsq = 0f64;
                                for &src in &idx {
                                    if src != sentinel {
                                        let v = i[src * n + lane].to_f64();
                                        sumsq += v * v;
                                    }
                                }
                                sumsq.sqrt()
                            }
                        };
                        o_chunk[w * n + lane] = T::from_f64(val);
                    }
                    w += 1;
                }
            }
        }
    });
    Ok(())
}

/// Backward pooling. Zeroes `b` first, then scatters:
/// - max routes the whole delta to the argmax tap (first win on ties,
///   in the fixed window enumeration order)
/// - avg spreads delta/(J*T*R*S) over every in-bounds tap
/// - l2 scatters delta * input/output per tap, zero where output is zero
pub fn bprop<T: WithDType>(desc: &PoolLayer, i: &[T], e: &[T], b: &mut [T]) -> Result<()> {
    let n = desc.n();
    let (k_dim, m_dim, p_dim, q_dim) = desc.kmpq();
    let (pad_j, pad_d, pad_h, pad_w) = desc.padding();
    let (str_j, str_d, str_h, str_w) = desc.strides();
    let sentinel = desc.sentinel();
    let divisor = desc.window_len() as f64;
    let op = desc.op();

    for slot in b.iter_mut() {
        *slot = T::zero();
    }

    // Overlapping windows may scatter onto the same input element, so this
    // pass stays sequential over windows; lanes within a window are
    // independent.
    let mut idx = Vec::new();
    let mut w = 0usize;
    for k in 0..k_dim {
        let kj = (k * str_j) as i64 - pad_j as i64;
        for m in 0..m_dim {
            let mt = (m * str_d) as i64 - pad_d as i64;
            for p in 0..p_dim {
                let pr = (p * str_h) as i64 - pad_h as i64;
                for q in 0..q_dim {
                    let qs = (q * str_w) as i64 - pad_w as i64;
                    desc.window_indices(kj, mt, pr, qs, &mut idx);
                    for lane in 0..n {
                        let delta = e[w * n + lane].to_f64();
                        match op {
                            PoolOp::Max => {
                                let mut best = f64::NEG_INFINITY;
                                let mut best_src = sentinel;
                                for &src in &idx {
                                    if src != sentinel {
                                        let v = i[src * n + lane].to_f64();
                                        if v > best {
                                            best = v;
                                            best_src = src;
                                        }
                                    }
                                }
                                if best_src != sentinel {
                                    let bi = best_src * n + lane;
                                    b[bi] = T::from_f64(b[bi].to_f64() + delta);
                                }
                            }
                            PoolOp::Avg => {
                                for &src in &idx {
                                    if src != sentinel {
                                        let bi = src * n + lane;
                                        b[bi] = T::from_f64(b[bi].to_f64() + delta / divisor);
                                    }
                                }
                            }
                            PoolOp::L2 => {
                                let mut sumsq = 0f64;
                                for &src in &idx {
                                    if src != sentinel {
                                        let v = i[src * n + lane].to_f64();
                                        sumsq += v * v;
                                    }
                                }
                                let norm = sumsq.sqrt();
                                if norm > 0.0 {
                                    for &src in &idx {
                                        if src != sentinel {
                                            let bi = src * n + lane;
                                            let v = i[src * n + lane].to_f64();
                                            b[bi] =
                                                T::from_f64(b[bi].to_f64() + delta * v / norm);
                                        }
                                    }
                                }
                            }
                        }
                    }
                    w += 1;
                }
            }
        }
    }
    Ok(())
}
