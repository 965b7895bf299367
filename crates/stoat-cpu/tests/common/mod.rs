// Brute-force f64 reference for the layer kernels. Written straight from
// the window formulas with explicit bounds checks — deliberately not
// sharing any index machinery with the backends it validates.
#![allow(dead_code)]

use stoat_core::{ConvLayer, PoolLayer, PoolOp};

/// O[k,m,p,q,n] = sum over (c,t,r,s) of F[c,t,r,s,k] * I[window], with
/// out-of-bounds taps contributing zero.
pub fn conv_fprop_ref(desc: &ConvLayer, i: &[f64], f: &[f64]) -> Vec<f64> {
    let (n_dim, c_dim, k_dim) = (desc.n(), desc.c(), desc.k());
    let (d, h, w) = desc.dhw();
    let (t_dim, r_dim, s_dim) = desc.trs();
    let (m_dim, p_dim, q_dim) = desc.mpq();
    let (pd, ph, pw) = desc.padding();
    let (sd, sh, sw) = desc.strides();

    let mut o = vec![0f64; k_dim * m_dim * p_dim * q_dim * n_dim];
    for k in 0..k_dim {
        for m in 0..m_dim {
            for p in 0..p_dim {
                for q in 0..q_dim {
                    for n in 0..n_dim {
                        let mut acc = 0f64;
                        for c in 0..c_dim {
                            for t in 0..t_dim {
                                let z = (m * sd + t) as i64 - pd as i64;
                                if z < 0 || z as usize >= d {
                                    continue;
                                }
                                for r in 0..r_dim {
                                    let y = (p * sh + r) as i64 - ph as i64;
                                    if y < 0 || y as usize >= h {
                                        continue;
                                    }
                                    for s in 0..s_dim {
                                        let x = (q * sw + s) as i64 - pw as i64;
                                        if x < 0 || x as usize >= w {
                                            continue;
                                        }
                                        let fi = (((c * t_dim + t) * r_dim + r) * s_dim + s)
                                            * k_dim
                                            + k;
                                        let ii = ((((c * d + z as usize) * h + y as usize) * w
                                            + x as usize)
                                            * n_dim)
                                            + n;
                                        acc += f[fi] * i[ii];
                                    }
                                }
                            }
                        }
                        o[(((k * m_dim + m) * p_dim + p) * q_dim + q) * n_dim + n] = acc;
                    }
                }
            }
        }
    }
    o
}

/// Scatter formulation of the input-gradient pass.
pub fn conv_bprop_ref(desc: &ConvLayer, f: &[f64], e: &[f64]) -> Vec<f64> {
    let (n_dim, c_dim, k_dim) = (desc.n(), desc.c(), desc.k());
    let (d, h, w) = desc.dhw();
    let (t_dim, r_dim, s_dim) = desc.trs();
    let (m_dim, p_dim, q_dim) = desc.mpq();
    let (pd, ph, pw) = desc.padding();
    let (sd, sh, sw) = desc.strides();

    let mut b = vec![0f64; c_dim * d * h * w * n_dim];
    for k in 0..k_dim {
        for m in 0..m_dim {
            for p in 0..p_dim {
                for q in 0..q_dim {
                    for c in 0..c_dim {
                        for t in 0..t_dim {
                            let z = (m * sd + t) as i64 - pd as i64;
                            if z < 0 || z as usize >= d {
                                continue;
                            }
                            for r in 0..r_dim {
                                let y = (p * sh + r) as i64 - ph as i64;
                                if y < 0 || y as usize >= h {
                                    continue;
                                }
                                for s in 0..s_dim {
                                    let x = (q * sw + s) as i64 - pw as i64;
                                    if x < 0 || x as usize >= w {
                                        continue;
                                    }
                                    let fi =
                                        (((c * t_dim + t) * r_dim + r) * s_dim + s) * k_dim + k;
                                    for n in 0..n_dim {
                                        let ei = (((k * m_dim + m) * p_dim + p) * q_dim + q)
                                            * n_dim
                                            + n;
                                        let bi = ((((c * d + z as usize) * h + y as usize) * w
                                            + x as usize)
                                            * n_dim)
                                            + n;
                                        b[bi] += f[fi] * e[ei];
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    }
    b
}

/// Scatter formulation of the filter-gradient pass.
pub fn conv_update_ref(desc: &ConvLayer, i: &[f64], e: &[f64]) -> Vec<f64> {
    let (n_dim, c_dim, k_dim) = (desc.n(), desc.c(), desc.k());
    let (d, h, w) = desc.dhw();
    let (t_dim, r_dim, s_dim) = desc.trs();
    let (m_dim, p_dim, q_dim) = desc.mpq();
    let (pd, ph, pw) = desc.padding();
    let (sd, sh, sw) = desc.strides();

    let mut u = vec![0f64; c_dim * t_dim * r_dim * s_dim * k_dim];
    for k in 0..k_dim {
        for m in 0..m_dim {
            for p in 0..p_dim {
                for q in 0..q_dim {
                    for c in 0..c_dim {
                        for t in 0..t_dim {
                            let z = (m * sd + t) as i64 - pd as i64;
                            if z < 0 || z as usize >= d {
                                continue;
                            }
                            for r in 0..r_dim {
                                let y = (p * sh + r) as i64 - ph as i64;
                                if y < 0 || y as usize >= h {
                                    continue;
                                }
                                for s in 0..s_dim {
                                    let x = (q * sw + s) as i64 - pw as i64;
                                    if x < 0 || x as usize >= w {
                                        continue;
                                    }
                                    let mut acc = 0f64;
                                    for n in 0..n_dim {
                                        let ei = (((k * m_dim + m) * p_dim + p) * q_dim + q)
                                            * n_dim
                                            + n;
                                        let ii = ((((c * d + z as usize) * h + y as usize) * w
                                            + x as usize)
                                            * n_dim)
                                            + n;
                                        acc += i[ii] * e[ei];
                                    }
                                    let ui =
                                        (((c * t_dim + t) * r_dim + r) * s_dim + s) * k_dim + k;
                                    u[ui] += acc;
                                }
                            }
                        }
                    }
                }
            }
        }
    }
    u
}

/// In-bounds taps of one pooling window in (j,t,r,s) order: flat
/// collapsed (c,z,y,x) index per tap, or None when the tap is padding.
fn pool_window(desc: &PoolLayer, k: usize, m: usize, p: usize, q: usize) -> Vec<Option<usize>> {
    let (c_dim, (d, h, w)) = (desc.c(), desc.dhw());
    let (j_dim, t_dim, r_dim, s_dim) = desc.jtrs();
    let (pj, pd, ph, pw) = desc.padding();
    let (sj, sd, sh, sw) = desc.strides();

    let mut taps = Vec::new();
    for j in 0..j_dim {
        let c = (k * sj + j) as i64 - pj as i64;
        for t in 0..t_dim {
            let z = (m * sd + t) as i64 - pd as i64;
            for r in 0..r_dim {
                let y = (p * sh + r) as i64 - ph as i64;
                for s in 0..s_dim {
                    let x = (q * sw + s) as i64 - pw as i64;
                    let inside = c >= 0
                        && (c as usize) < c_dim
                        && z >= 0
                        && (z as usize) < d
                        && y >= 0
                        && (y as usize) < h
                        && x >= 0
                        && (x as usize) < w;
                    if inside {
                        taps.push(Some(
                            ((c as usize * d + z as usize) * h + y as usize) * w + x as usize,
                        ));
                    } else {
                        taps.push(None);
                    }
                }
            }
        }
    }
    taps
}

pub fn pool_fprop_ref(desc: &PoolLayer, i: &[f64]) -> Vec<f64> {
    let n_dim = desc.n();
    let (k_dim, m_dim, p_dim, q_dim) = desc.kmpq();
    let divisor = desc.window_len() as f64;

    let mut o = vec![0f64; k_dim * m_dim * p_dim * q_dim * n_dim];
    let mut out_pos = 0usize;
    for k in 0..k_dim {
        for m in 0..m_dim {
            for p in 0..p_dim {
                for q in 0..q_dim {
                    let taps = pool_window(desc, k, m, p, q);
                    for n in 0..n_dim {
                        let vals = taps
                            .iter()
                            .filter_map(|t| t.map(|src| i[src * n_dim + n]));
                        o[out_pos * n_dim + n] = match desc.op() {
                            PoolOp::Max => vals.fold(f64::NEG_INFINITY, f64::max),
                            PoolOp::Avg => vals.sum::<f64>() / divisor,
                            PoolOp::L2 => vals.map(|v| v * v).sum::<f64>().sqrt(),
                        };
                    }
                    out_pos += 1;
                }
            }
        }
    }
    o
}

pub fn pool_bprop_ref(desc: &PoolLayer, i: &[f64], e: &[f64]) -> Vec<f64> {
    let n_dim = desc.n();
    let (c_dim, (d, h, w)) = (desc.c(), desc.dhw());
    let (k_dim, m_dim, p_dim, q_dim) = desc.kmpq();
    let divisor = desc.window_len() as f64;

    let mut b = vec![0f64; c_dim * d * h * w * n_dim];
    let mut out_pos = 0usize;
    for k in 0..k_dim {
        for m in 0..m_dim {
            for p in 0..p_dim {
                for q in 0..q_dim {
                    let taps = pool_window(desc, k, m, p, q);
                    for n in 0..n_dim {
                        let delta = e[out_pos * n_dim + n];
                        match desc.op() {
                            PoolOp::Max => {
                                let mut best = f64::NEG_INFINITY;
                                let mut best_src = None;
                                for src in taps.iter().flatten() {
                                    let v = i[src * n_dim + n];
                                    if v > best {
                                        best = v;
                                        best_src = Some(*src);
                                    }
                                }
                                if let Some(src) = best_src {
                                    b[src * n_dim + n] += delta;
                                }
                            }
                            PoolOp::Avg => {
                                for src in taps.iter().flatten() {
                                    b[src * n_dim + n] += delta / divisor;
                                }
                            }
                            PoolOp::L2 => {
                                let norm = taps
                                    .iter()
                                    .flatten()
                                    .map(|src| i[src * n_dim + n].powi(2))
                                    .sum::<f64>()
                                    .sqrt();
                                if norm > 0.0 {
                                    for src in taps.iter().flatten() {
                                        b[src * n_dim + n] += delta * i[src * n_dim + n] / norm;
                                    }
                                }
                            }
                        }
                    }
                    out_pos += 1;
                }
            }
        }
    }
    b
}

// Test utilities

pub fn rand_vec(rng: &mut impl rand::Rng, n: usize, lo: f64, hi: f64) -> Vec<f64> {
    (0..n).map(|_| rng.gen_range(lo..hi)).collect()
}

pub fn assert_allclose(actual: &[f64], expected: &[f64], atol: f64, what: &str) {
    assert_eq!(
        actual.len(),
        expected.len(),
        "{what}: length {} vs {}",
        actual.len(),
        expected.len()
    );
    for (idx, (a, e)) in actual.iter().zip(expected.iter()).enumerate() {
        assert!(
            (a - e).abs() <= atol,
            "{what}: index {idx}: {a} vs {e} (atol {atol})"
        );
    }
}
