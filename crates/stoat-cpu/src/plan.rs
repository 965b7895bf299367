use log::trace;
use rayon::prelude::*;

use crate::CpuStorage;
use stoat_core::{BinOp, Error, Layout, MapInstr, Plan, ReduceOp, Result, Step, ValueRef};

// Plan execution, host path
//
// Slots and arithmetic are f64 throughout; the root slot is rounded to the
// plan dtype at the end. Map steps are one fused pass per step: every
// element of the output is computed by running the postfix program against
// the input views, so intermediates of an elementwise chain never touch
// memory.

struct Env {
    leaves: Vec<Vec<f64>>,
    slots: Vec<Option<Vec<f64>>>,
}

impl Env {
    fn buffer(&self, source: ValueRef) -> Result<&[f64]> {
        match source {
            ValueRef::Leaf(i) => Ok(&self.leaves[i]),
            ValueRef::Slot(s) => self.slots[s]
                .as_deref()
                .ok_or_else(|| Error::device(format!("slot {s} read before it was written"))),
        }
    }
}

pub fn run(plan: &Plan, leaves: &[(&CpuStorage, &Layout)]) -> Result<CpuStorage> {
    let mut env = Env {
        leaves: leaves.iter().map(|(s, _)| s.to_f64_buffer()).collect(),
        slots: vec![None; plan.slot_shapes.len()],
    };
    trace!(
        "running plan: {} steps, {} slots",
        plan.steps.len(),
        plan.slot_shapes.len()
    );

    let max_stack = plan.max_stack();
    for step in &plan.steps {
        match step {
            Step::Map(map) => {
                let views: Vec<(&[f64], &Layout)> = map
                    .inputs
                    .iter()
                    .map(|v| Ok((env.buffer(v.source)?, &v.layout)))
                    .collect::<Result<_>>()?;
                let out = eval_map(&map.prog, &views, map.out_shape.elem_count(), max_stack);
                env.slots[map.dst] = Some(out);
            }
            Step::Reduce {
                op,
                src,
                axis,
                out_shape,
                dst,
            } => {
                let buf = env.buffer(src.source)?;
                let out = eval_reduce(*op, buf, &src.layout, *axis, out_shape.elem_count());
                env.slots[*dst] = Some(out);
            }
            Step::Dot { lhs, rhs, dst, .. } => {
                let out = {
                    let l_buf = env.buffer(lhs.source)?;
                    let r_buf = env.buffer(rhs.source)?;
                    eval_dot(l_buf, &lhs.layout, r_buf, &rhs.layout)
                };
                env.slots[*dst] = Some(out);
            }
        }
    }

    let root = env.slots[plan.root]
        .take()
        .ok_or_else(|| Error::device("plan produced no root value"))?;
    Ok(CpuStorage::from_f64_buffer(root, plan.dtype))
}

/// One fused elementwise pass: postfix evaluation per output element,
/// loads resolved through each input's (broadcast) strides.
fn eval_map(
    prog: &[MapInstr],
    inputs: &[(&[f64], &Layout)],
    elem_count: usize,
    max_stack: usize,
) -> Vec<f64> {
    let mut out = vec![0f64; elem_count];
    let chunk = 4096.max(elem_count / (rayon::current_num_threads().max(1) * 4)).max(1);
    out.par_chunks_mut(chunk).enumerate().for_each(|(ci, vals)| {
        let base = ci * chunk;
        let mut stack = vec![0f64; max_stack.max(1)];
        for (off, slot) in vals.iter_mut().enumerate() {
            let pos = base + off;
            let mut sp = 0usize;
            for instr in prog {
                match *instr {
                    MapInstr::Input(i) => {
                        let (buf, layout) = inputs[i];
                        stack[sp] = buf[layout.linear_to_flat(pos)];
                        sp += 1;
                    }
                    MapInstr::Const(c) => {
                        stack[sp] = c;
                        sp += 1;
                    }
                    MapInstr::Bin(op) => {
                        let r = stack[sp - 1];
                        let l = stack[sp - 2];
                        stack[sp - 2] = apply_bin(op, l, r);
                        sp -= 1;
                    }
                }
            }
            *slot = stack[0];
        }
    });
    out
}

fn apply_bin(op: BinOp, l: f64, r: f64) -> f64 {
    match op {
        BinOp::Add => l + r,
        BinOp::Sub => l - r,
        BinOp::Mul => l * r,
        BinOp::Div => l / r,
    }
}

/// Reduction over an optional axis of a strided view.
fn eval_reduce(
    op: ReduceOp,
    buf: &[f64],
    layout: &Layout,
    axis: Option<usize>,
    out_count: usize,
) -> Vec<f64> {
    match axis {
        None => {
            let vals: Vec<f64> = layout.strided_indices().map(|i| buf[i]).collect();
            vec![reduce_values(op, &vals); out_count.max(1)]
        }
        Some(a) => {
            let dims = layout.dims().to_vec();
            let red = dims[a];
            let mut out = vec![0f64; out_count];
            let mut outer_idx = vec![0usize; dims.len()];
            let mut vals = vec![0f64; red];
            for slot in out.iter_mut() {
                for (ai, v) in vals.iter_mut().enumerate() {
                    outer_idx[a] = ai;
                    *v = buf[layout.flat_index(&outer_idx)];
                }
                *slot = reduce_values(op, &vals);
                // Advance the multi-index, skipping the reduced axis.
                for i in (0..dims.len()).rev() {
                    if i == a {
                        continue;
                    }
                    outer_idx[i] += 1;
                    if outer_idx[i] < dims[i] {
                        break;
                    }
                    outer_idx[i] = 0;
                }
            }
            out
        }
    }
}

fn reduce_values(op: ReduceOp, vals: &[f64]) -> f64 {
    let n = vals.len() as f64;
    match op {
        ReduceOp::Sum => vals.iter().sum(),
        ReduceOp::Mean => vals.iter().sum::<f64>() / n,
        ReduceOp::Max => vals.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        ReduceOp::Min => vals.iter().copied().fold(f64::INFINITY, f64::min),
        ReduceOp::Var => variance(vals),
        ReduceOp::Std => variance(vals).sqrt(),
    }
}

fn variance(vals: &[f64]) -> f64 {
    let n = vals.len() as f64;
    let mean = vals.iter().sum::<f64>() / n;
    vals.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n
}

/// 2-D matrix product of two strided views.
fn eval_dot(l_buf: &[f64], l_layout: &Layout, r_buf: &[f64], r_layout: &Layout) -> Vec<f64> {
    let m = l_layout.dims()[0];
    let k = l_layout.dims()[1];
    let n = r_layout.dims()[1];
    let mut out = vec![0f64; m * n];
    out.par_chunks_mut(n).enumerate().for_each(|(mi, row)| {
        for (ni, slot) in row.iter_mut().enumerate() {
            let mut acc = 0f64;
            for ki in 0..k {
                acc += l_buf[l_layout.flat_index(&[mi, ki])]
                    * r_buf[r_layout.flat_index(&[ki, ni])];
            }
            *slot = acc;
        }
    });
    out
}
