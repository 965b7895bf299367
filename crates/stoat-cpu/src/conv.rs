use rayon::prelude::*;
use stoat_core::{ConvLayer, Result, WithDType};

// Convolution kernels, host path
//
// All three passes walk the same sliding windows. The input is treated as
// a collapsed (C*D*H*W, N) matrix; a window is a list of row indices into
// it, with the sentinel index standing for the implicit zero row, so the
// hot loops never branch on padding beyond one index comparison.
//
// Accumulation is in f64, rounded to the tensor dtype on store.

/// Window row-index lists for every output spatial position (m, p, q),
/// in m-major order.
fn spatial_windows(desc: &ConvLayer) -> Vec<Vec<usize>> {
    let (m_dim, p_dim, q_dim) = desc.mpq();
    let (pad_d, pad_h, pad_w) = desc.padding();
    let (str_d, str_h, str_w) = desc.strides();

    let mut windows = Vec::with_capacity(m_dim * p_dim * q_dim);
    for m in 0..m_dim {
        let mt = (m * str_d) as i64 - pad_d as i64;
        for p in 0..p_dim {
            let pr = (p * str_h) as i64 - pad_h as i64;
            for q in 0..q_dim {
                let qs = (q * str_w) as i64 - pad_w as i64;
                let mut idx = Vec::new();
                desc.window_indices(mt, pr, qs, &mut idx);
                windows.push(idx);
            }
        }
    }
    windows
}

/// Forward: for each output position, dot the gathered window with the
/// filter slice. Overwrites `o`.
pub fn fprop<T: WithDType>(desc: &ConvLayer, i: &[T], f: &[T], o: &mut [T]) -> Result<()> {
    let n = desc.n();
    let k_dim = desc.k();
    let (m_dim, p_dim, q_dim) = desc.mpq();
    let mpq_n = m_dim * p_dim * q_dim * n;
    let sentinel = desc.sentinel();
    let windows = spatial_windows(desc);

    // One contiguous output chunk per filter k.
    o.par_chunks_mut(mpq_n)
        .enumerate()
        .for_each(|(k, o_chunk)| {
            for (w, idx) in windows.iter().enumerate() {
                for lane in 0..n {
                    let mut acc = 0f64;
                    for (l, &src) in idx.iter().enumerate() {
                        if src != sentinel {
                            acc += f[l * k_dim + k].to_f64() * i[src * n + lane].to_f64();
                        }
                    }
                    o_chunk[w * n + lane] = T::from_f64(acc);
                }
            }
        });
    debug_assert_eq!(windows.len() * n * k_dim, o.len());
    Ok(())
}

/// Backward: accumulate the filter-weighted deltas back onto the input
/// positions each window touched. Formulated as a gather over input
/// elements so channels parallelize without write conflicts; the caller
/// zeroes `b` (or deliberately accumulates across calls).
pub fn bprop<T: WithDType>(desc: &ConvLayer, f: &[T], e: &[T], b: &mut [T]) -> Result<()> {
    let n = desc.n();
    let k_dim = desc.k();
    let (d, h, w) = desc.dhw();
    let (t_dim, r_dim, s_dim) = desc.trs();
    let (m_dim, p_dim, q_dim) = desc.mpq();
    let (pad_d, pad_h, pad_w) = desc.padding();
    let (str_d, str_h, str_w) = desc.strides();
    let dhw_n = d * h * w * n;

    // Output position m covering input depth z at tap t satisfies
    // z = m*str_d - pad_d + t; valid m must divide exactly and land in
    // [0, M). Same for p/q.
    let covering = |coord: usize, pad: usize, stride: usize, limit: usize, tap: usize| {
        let num = coord as i64 + pad as i64 - tap as i64;
        if num < 0 || num % stride as i64 != 0 {
            return None;
        }
        let pos = (num / stride as i64) as usize;
        (pos < limit).then_some(pos)
    };

    b.par_chunks_mut(dhw_n).enumerate().for_each(|(c, b_chunk)| {
        for z in 0..d {
            for y in 0..h {
                for x in 0..w {
                    for lane in 0..n {
                        let mut acc = 0f64;
                        for t in 0..t_dim {
                            let Some(m) = covering(z, pad_d, str_d, m_dim, t) else {
                                continue;
                            };
                            for r in 0..r_dim {
                                let Some(p) = covering(y, pad_h, str_h, p_dim, r) else {
                                    continue;
                                };
                                for s in 0..s_dim {
                                    let Some(q) = covering(x, pad_w, str_w, q_dim, s) else {
                                        continue;
                                    };
                                    let l = ((c * t_dim + t) * r_dim + r) * s_dim + s;
                                    let e_base = ((m * p_dim + p) * q_dim + q) * n + lane;
                                    for k in 0..k_dim {
                                        acc += f[l * k_dim + k].to_f64()
                                            * e[k * m_dim * p_dim * q_dim * n + e_base].to_f64();
                                    }
                                }
                            }
                        }
                        let bi = ((z * h + y) * w + x) * n + lane;
                        b_chunk[bi] = T::from_f64(b_chunk[bi].to_f64() + acc);
                    }
                }
            }
        }
    });
    Ok(())
}

/// Weight update: each filter element accumulates input·delta over every
/// window position. Accumulates into caller-zeroed `u`.
pub fn update<T: WithDType>(desc: &ConvLayer, i: &[T], e: &[T], u: &mut [T]) -> Result<()> {
    let n = desc.n();
    let k_dim = desc.k();
    let (m_dim, p_dim, q_dim) = desc.mpq();
    let sentinel = desc.sentinel();
    let (t_dim, r_dim, s_dim) = desc.trs();
    let trs_k = t_dim * r_dim * s_dim * k_dim;
    let mpq_n = m_dim * p_dim * q_dim * n;
    let windows = spatial_windows(desc);

    u.par_chunks_mut(trs_k).enumerate().for_each(|(c, u_chunk)| {
        let l_base = c * t_dim * r_dim * s_dim;
        for l_off in 0..t_dim * r_dim * s_dim {
            for k in 0..k_dim {
                let mut acc = 0f64;
                for (w, idx) in windows.iter().enumerate() {
                    let src = idx[l_base + l_off];
                    if src == sentinel {
                        continue;
                    }
                    for lane in 0..n {
                        acc += i[src * n + lane].to_f64() * e[k * mpq_n + w * n + lane].to_f64();
                    }
                }
                let ui = l_off * k_dim + k;
                u_chunk[ui] = T::from_f64(u_chunk[ui].to_f64() + acc);
            }
        }
    });
    Ok(())
}
