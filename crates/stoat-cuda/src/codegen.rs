// Fused elementwise kernels — CUDA C generated per Map step
//
// A Map step is a postfix program over strided input views. The generated
// kernel computes one output element per thread: each input's flat index
// is rebuilt from the thread's linear position with the view's dims and
// strides baked in as literals, then the whole expression evaluates in
// registers. Two plans with identical programs, shapes, and strides
// generate identical source, so the compiled module cache keys on the
// source hash.
//
// Input buffers arrive as an array of raw device addresses (`ptrs`), which
// keeps the launch signature fixed no matter how many leaves a fused
// region reads.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use stoat_core::{BinOp, DType, MapInstr, MapStep};

/// Kernel entry point name used by every generated module.
pub const FUSED_FN: &str = "fused_kernel";

const F16_HELPERS: &str = "
__device__ __forceinline__ float f16_to_f32(unsigned short h) {
    float f;
    asm(\"{ cvt.f32.f16 %0, %1; }\" : \"=f\"(f) : \"h\"(h));
    return f;
}

__device__ __forceinline__ unsigned short f32_to_f16(float f) {
    unsigned short h;
    asm(\"{ cvt.rn.f16.f32 %0, %1; }\" : \"=h\"(h) : \"f\"(f));
    return h;
}
";

/// Generate the CUDA source of one fused pass.
pub fn map_kernel_source(map: &MapStep, dtype: DType) -> String {
    let (out_ty, val_ty) = match dtype {
        DType::F16 => ("unsigned short", "float"),
        DType::F32 => ("float", "float"),
        DType::F64 => ("double", "double"),
    };

    let mut src = String::new();
    if dtype == DType::F16 {
        src.push_str(F16_HELPERS);
    }
    src.push_str(&format!(
        "\nextern \"C\" __global__ void {FUSED_FN}(\n    \
         const unsigned long long* ptrs, {out_ty}* out, unsigned int n)\n{{\n    \
         unsigned int idx = blockIdx.x * blockDim.x + threadIdx.x;\n    \
         if (idx >= n) return;\n"
    ));

    for (i, view) in map.inputs.iter().enumerate() {
        let layout = &view.layout;
        src.push_str(&format!(
            "    long long f{i} = {};\n",
            layout.offset()
        ));
        if layout.rank() > 0 {
            src.push_str(&format!("    {{ unsigned int p{i} = idx;"));
            for d in (0..layout.rank()).rev() {
                let dim = layout.dims()[d];
                let stride = layout.strides()[d];
                src.push_str(&format!(
                    " f{i} += (long long)(p{i} % {dim}u) * {stride}; p{i} /= {dim}u;"
                ));
            }
            src.push_str(" }\n");
        }
        let load = match dtype {
            DType::F16 => format!("f16_to_f32(((const unsigned short*)ptrs[{i}])[f{i}])"),
            DType::F32 => format!("((const float*)ptrs[{i}])[f{i}]"),
            DType::F64 => format!("((const double*)ptrs[{i}])[f{i}]"),
        };
        src.push_str(&format!("    {val_ty} v{i} = {load};\n"));
    }

    let expr = expression(&map.prog, val_ty);
    let store = match dtype {
        DType::F16 => format!("out[idx] = f32_to_f16({expr});"),
        _ => format!("out[idx] = {expr};"),
    };
    src.push_str(&format!("    {store}\n}}\n"));
    src
}

/// Render the postfix program as one C expression.
fn expression(prog: &[MapInstr], val_ty: &str) -> String {
    let mut stack: Vec<String> = Vec::new();
    for instr in prog {
        match *instr {
            MapInstr::Input(i) => stack.push(format!("v{i}")),
            MapInstr::Const(c) => stack.push(format!("(({val_ty})({c:?}))")),
            MapInstr::Bin(op) => {
                let r = stack.pop().expect("malformed map program");
                let l = stack.pop().expect("malformed map program");
                let sym = match op {
                    BinOp::Add => "+",
                    BinOp::Sub => "-",
                    BinOp::Mul => "*",
                    BinOp::Div => "/",
                };
                stack.push(format!("({l} {sym} {r})"));
            }
        }
    }
    stack.pop().expect("empty map program")
}

/// Cache key of a generated kernel: the hash of its full source.
pub fn source_hash(src: &str) -> u64 {
    let mut h = DefaultHasher::new();
    src.hash(&mut h);
    h.finish()
}
