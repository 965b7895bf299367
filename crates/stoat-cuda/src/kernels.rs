// Static CUDA kernels — compiled to PTX via NVRTC at device creation
//
// Layer kernels and the reduce/matmul building blocks live here as one
// compilation unit; fused elementwise kernels are generated per-plan in
// `codegen` instead. Conventions shared with the host backend:
//
// - Conv/pool tensors are contiguous in (C,D,H,W,N) / (C,T,R,S,K) /
//   (K,M,P,Q,N) order; one thread computes one output element.
// - Out-of-bounds window taps contribute zero (conv, avg, l2) or are
//   skipped (max); max ties resolve to the first tap in (j,t,r,s) order.
// - Backward passes are gather-formulated (one thread per *input*
//   element), so no atomics are needed and results are deterministic.
// - F16 is stored as unsigned short; arithmetic promotes to F32.
//
// Scalar layer geometry is passed as one device int array `g` to keep
// launch parameter lists short:
//   conv: [N,C,K, D,H,W, T,R,S, pd,ph,pw, sd,sh,sw, M,P,Q]
//   pool: [N,C, D,H,W, J,T,R,S, pj,pd,ph,pw, sj,sd,sh,sw, K,M,P,Q, op]
//   reduce meta: [rank, axis(-1 = all), op, offset, dims.., strides..]
//   matmul meta: [m,k,n, a_off,a_s0,a_s1, b_off,b_s0,b_s1]

pub const MODULE_NAME: &str = "stoat";

pub const KERNEL_NAMES: &[&str] = &[
    "conv_fprop_f32",
    "conv_fprop_f16",
    "conv_bprop_f32",
    "conv_bprop_f16",
    "conv_update_f32",
    "conv_update_f16",
    "pool_fprop_f32",
    "pool_fprop_f16",
    "pool_bprop_f32",
    "pool_bprop_f16",
    "reduce_f32",
    "reduce_f64",
    "reduce_f16",
    "matmul_f32",
    "matmul_f64",
    "matmul_f16",
];

pub const KERNEL_SOURCE: &str = r#"

// ---- f16 conversion helpers (storage is unsigned short) ----

__device__ __forceinline__ float f16_to_f32(unsigned short h) {
    float f;
    asm("{ cvt.f32.f16 %0, %1; }" : "=f"(f) : "h"(h));
    return f;
}

__device__ __forceinline__ unsigned short f32_to_f16(float f) {
    unsigned short h;
    asm("{ cvt.rn.f16.f32 %0, %1; }" : "=h"(h) : "f"(f));
    return h;
}

// ---- convolution ----

// g: [N,C,K, D,H,W, T,R,S, pd,ph,pw, sd,sh,sw, M,P,Q]

extern "C" __global__ void conv_fprop_f32(
    const float* I, const float* F, float* O, const int* g, unsigned int n_out)
{
    unsigned int tid = blockIdx.x * blockDim.x + threadIdx.x;
    if (tid >= n_out) return;
    int N=g[0], C=g[1], K=g[2], D=g[3], H=g[4], W=g[5], T=g[6], R=g[7], S=g[8];
    int pd=g[9], ph=g[10], pw=g[11], sd=g[12], sh=g[13], sw=g[14];
    int M=g[15], P=g[16], Q=g[17];

    int rem = tid;
    int n = rem % N; rem /= N;
    int q = rem % Q; rem /= Q;
    int p = rem % P; rem /= P;
    int m = rem % M; rem /= M;
    int k = rem;

    int mt = m*sd - pd, pr = p*sh - ph, qs = q*sw - pw;
    float acc = 0.0f;
    for (int c = 0; c < C; ++c) {
        for (int t = 0; t < T; ++t) {
            int z = mt + t;
            if (z < 0 || z >= D) continue;
            for (int r = 0; r < R; ++r) {
                int y = pr + r;
                if (y < 0 || y >= H) continue;
                for (int s = 0; s < S; ++s) {
                    int x = qs + s;
                    if (x < 0 || x >= W) continue;
                    int l = ((c*T + t)*R + r)*S + s;
                    acc += F[l*K + k] * I[(((c*D + z)*H + y)*W + x)*N + n];
                }
            }
        }
    }
    O[tid] = acc;
}

extern "C" __global__ void conv_fprop_f16(
    const unsigned short* I, const unsigned short* F, unsigned short* O,
    const int* g, unsigned int n_out)
{
    unsigned int tid = blockIdx.x * blockDim.x + threadIdx.x;
    if (tid >= n_out) return;
    int N=g[0], C=g[1], K=g[2], D=g[3], H=g[4], W=g[5], T=g[6], R=g[7], S=g[8];
    int pd=g[9], ph=g[10], pw=g[11], sd=g[12], sh=g[13], sw=g[14];
    int M=g[15], P=g[16], Q=g[17];

    int rem = tid;
    int n = rem % N; rem /= N;
    int q = rem % Q; rem /= Q;
    int p = rem % P; rem /= P;
    int m = rem % M; rem /= M;
    int k = rem;

    int mt = m*sd - pd, pr = p*sh - ph, qs = q*sw - pw;
    float acc = 0.0f;
    for (int c = 0; c < C; ++c) {
        for (int t = 0; t < T; ++t) {
            int z = mt + t;
            if (z < 0 || z >= D) continue;
            for (int r = 0; r < R; ++r) {
                int y = pr + r;
                if (y < 0 || y >= H) continue;
                for (int s = 0; s < S; ++s) {
                    int x = qs + s;
                    if (x < 0 || x >= W) continue;
                    int l = ((c*T + t)*R + r)*S + s;
                    acc += f16_to_f32(F[l*K + k])
                         * f16_to_f32(I[(((c*D + z)*H + y)*W + x)*N + n]);
                }
            }
        }
    }
    O[tid] = f32_to_f16(acc);
}

// Backward data: one thread per input element of B = dimI, gathering the
// filter-weighted deltas of every window that covered it.

extern "C" __global__ void conv_bprop_f32(
    const float* F, const float* E, float* B, const int* g, unsigned int n_in)
{
    unsigned int tid = blockIdx.x * blockDim.x + threadIdx.x;
    if (tid >= n_in) return;
    int N=g[0], C=g[1], K=g[2], D=g[3], H=g[4], W=g[5], T=g[6], R=g[7], S=g[8];
    int pd=g[9], ph=g[10], pw=g[11], sd=g[12], sh=g[13], sw=g[14];
    int M=g[15], P=g[16], Q=g[17];

    int rem = tid;
    int n = rem % N; rem /= N;
    int x = rem % W; rem /= W;
    int y = rem % H; rem /= H;
    int z = rem % D; rem /= D;
    int c = rem;

    int MPQN = M*P*Q*N;
    float acc = 0.0f;
    for (int t = 0; t < T; ++t) {
        int zm = z + pd - t;
        if (zm < 0 || zm % sd) continue;
        int m = zm / sd;
        if (m >= M) continue;
        for (int r = 0; r < R; ++r) {
            int yp = y + ph - r;
            if (yp < 0 || yp % sh) continue;
            int p = yp / sh;
            if (p >= P) continue;
            for (int s = 0; s < S; ++s) {
                int xq = x + pw - s;
                if (xq < 0 || xq % sw) continue;
                int q = xq / sw;
                if (q >= Q) continue;
                int l = ((c*T + t)*R + r)*S + s;
                int e_base = ((m*P + p)*Q + q)*N + n;
                for (int k = 0; k < K; ++k)
                    acc += F[l*K + k] * E[k*MPQN + e_base];
            }
        }
    }
    B[tid] += acc;
}

extern "C" __global__ void conv_bprop_f16(
    const unsigned short* F, const unsigned short* E, unsigned short* B,
    const int* g, unsigned int n_in)
{
    unsigned int tid = blockIdx.x * blockDim.x + threadIdx.x;
    if (tid >= n_in) return;
    int N=g[0], K=g[2], D=g[3], H=g[4], W=g[5], T=g[6], R=g[7], S=g[8];
    int pd=g[9], ph=g[10], pw=g[11], sd=g[12], sh=g[13], sw=g[14];
    int M=g[15], P=g[16], Q=g[17];

    int rem = tid;
    int n = rem % N; rem /= N;
    int x = rem % W; rem /= W;
    int y = rem % H; rem /= H;
    int z = rem % D; rem /= D;
    int c = rem;

    int MPQN = M*P*Q*N;
    float acc = 0.0f;
    for (int t = 0; t < T; ++t) {
        int zm = z + pd - t;
        if (zm < 0 || zm % sd) continue;
        int m = zm / sd;
        if (m >= M) continue;
        for (int r = 0; r < R; ++r) {
            int yp = y + ph - r;
            if (yp < 0 || yp % sh) continue;
            int p = yp / sh;
            if (p >= P) continue;
            for (int s = 0; s < S; ++s) {
                int xq = x + pw - s;
                if (xq < 0 || xq % sw) continue;
                int q = xq / sw;
                if (q >= Q) continue;
                int l = ((c*T + t)*R + r)*S + s;
                int e_base = ((m*P + p)*Q + q)*N + n;
                for (int k = 0; k < K; ++k)
                    acc += f16_to_f32(F[l*K + k]) * f16_to_f32(E[k*MPQN + e_base]);
            }
        }
    }
    B[tid] = f32_to_f16(f16_to_f32(B[tid]) + acc);
}

// Weight update: one thread per filter element of U = dimF.

extern "C" __global__ void conv_update_f32(
    const float* I, const float* E, float* U, const int* g, unsigned int n_flt)
{
    unsigned int tid = blockIdx.x * blockDim.x + threadIdx.x;
    if (tid >= n_flt) return;
    int N=g[0], K=g[2], D=g[3], H=g[4], W=g[5], T=g[6], R=g[7], S=g[8];
    int pd=g[9], ph=g[10], pw=g[11], sd=g[12], sh=g[13], sw=g[14];
    int M=g[15], P=g[16], Q=g[17];

    int rem = tid;
    int k = rem % K; rem /= K;
    int s = rem % S; rem /= S;
    int r = rem % R; rem /= R;
    int t = rem % T; rem /= T;
    int c = rem;

    int MPQN = M*P*Q*N;
    float acc = 0.0f;
    for (int m = 0; m < M; ++m) {
        int z = m*sd - pd + t;
        if (z < 0 || z >= D) continue;
        for (int p = 0; p < P; ++p) {
            int y = p*sh - ph + r;
            if (y < 0 || y >= H) continue;
            for (int q = 0; q < Q; ++q) {
                int x = q*sw - pw + s;
                if (x < 0 || x >= W) continue;
                int i_base = (((c*D + z)*H + y)*W + x)*N;
                int e_base = ((m*P + p)*Q + q)*N;
                for (int n = 0; n < N; ++n)
                    acc += I[i_base + n] * E[k*MPQN + e_base + n];
            }
        }
    }
    U[tid] += acc;
}

extern "C" __global__ void conv_update_f16(
    const unsigned short* I, const unsigned short* E, unsigned short* U,
    const int* g, unsigned int n_flt)
{
    unsigned int tid = blockIdx.x * blockDim.x + threadIdx.x;
    if (tid >= n_flt) return;
    int N=g[0], K=g[2], D=g[3], H=g[4], W=g[5], T=g[6], R=g[7], S=g[8];
    int pd=g[9], ph=g[10], pw=g[11], sd=g[12], sh=g[13], sw=g[14];
    int M=g[15], P=g[16], Q=g[17];

    int rem = tid;
    int k = rem % K; rem /= K;
    int s = rem % S; rem /= S;
    int r = rem % R; rem /= R;
    int t = rem % T; rem /= T;
    int c = rem;

    int MPQN = M*P*Q*N;
    float acc = 0.0f;
    for (int m = 0; m < M; ++m) {
        int z = m*sd - pd + t;
        if (z < 0 || z >= D) continue;
        for (int p = 0; p < P; ++p) {
            int y = p*sh - ph + r;
            if (y < 0 || y >= H) continue;
            for (int q = 0; q < Q; ++q) {
                int x = q*sw - pw + s;
                if (x < 0 || x >= W) continue;
                int i_base = (((c*D + z)*H + y)*W + x)*N;
                int e_base = ((m*P + p)*Q + q)*N;
                for (int n = 0; n < N; ++n)
                    acc += f16_to_f32(I[i_base + n]) * f16_to_f32(E[k*MPQN + e_base + n]);
            }
        }
    }
    U[tid] = f32_to_f16(f16_to_f32(U[tid]) + acc);
}

// ---- pooling ----

// g: [N,C, D,H,W, J,T,R,S, pj,pd,ph,pw, sj,sd,sh,sw, K,M,P,Q, op]
// op: 0 = max, 1 = avg (fixed divisor J*T*R*S), 2 = l2

extern "C" __global__ void pool_fprop_f32(
    const float* I, float* O, const int* g, unsigned int n_out)
{
    unsigned int tid = blockIdx.x * blockDim.x + threadIdx.x;
    if (tid >= n_out) return;
    int N=g[0], C=g[1], D=g[2], H=g[3], W=g[4];
    int J=g[5], T=g[6], R=g[7], S=g[8];
    int pj=g[9], pd=g[10], ph=g[11], pw=g[12];
    int sj=g[13], sd=g[14], sh=g[15], sw=g[16];
    int M=g[18], P=g[19], Q=g[20], op=g[21];

    int rem = tid;
    int n = rem % N; rem /= N;
    int q = rem % Q; rem /= Q;
    int p = rem % P; rem /= P;
    int m = rem % M; rem /= M;
    int k = rem;

    int kj = k*sj - pj, mt = m*sd - pd, pr = p*sh - ph, qs = q*sw - pw;
    float best = -3.402823466e+38f;
    float sum = 0.0f;
    for (int j = 0; j < J; ++j) {
        int c = kj + j;
        if (c < 0 || c >= C) continue;
        for (int t = 0; t < T; ++t) {
            int z = mt + t;
            if (z < 0 || z >= D) continue;
            for (int r = 0; r < R; ++r) {
                int y = pr + r;
                if (y < 0 || y >= H) continue;
                for (int s = 0; s < S; ++s) {
                    int x = qs + s;
                    if (x < 0 || x >= W) continue;
                    float v = I[(((c*D + z)*H + y)*W + x)*N + n];
                    if (v > best) best = v;
                    sum += (op == 2) ? v*v : v;
                }
            }
        }
    }
    if (op == 0)      O[tid] = best;
    else if (op == 1) O[tid] = sum / (float)(J*T*R*S);
    else              O[tid] = sqrtf(sum);
}

extern "C" __global__ void pool_fprop_f16(
    const unsigned short* I, unsigned short* O, const int* g, unsigned int n_out)
{
    unsigned int tid = blockIdx.x * blockDim.x + threadIdx.x;
    if (tid >= n_out) return;
    int N=g[0], C=g[1], D=g[2], H=g[3], W=g[4];
    int J=g[5], T=g[6], R=g[7], S=g[8];
    int pj=g[9], pd=g[10], ph=g[11], pw=g[12];
    int sj=g[13], sd=g[14], sh=g[15], sw=g[16];
    int M=g[18], P=g[19], Q=g[20], op=g[21];

    int rem = tid;
    int n = rem % N; rem /= N;
    int q = rem % Q; rem /= Q;
    int p = rem % P; rem /= P;
    int m = rem % M; rem /= M;
    int k = rem;

    int kj = k*sj - pj, mt = m*sd - pd, pr = p*sh - ph, qs = q*sw - pw;
    float best = -3.402823466e+38f;
    float sum = 0.0f;
    for (int j = 0; j < J; ++j) {
        int c = kj + j;
        if (c < 0 || c >= C) continue;
        for (int t = 0; t < T; ++t) {
            int z = mt + t;
            if (z < 0 || z >= D) continue;
            for (int r = 0; r < R; ++r) {
                int y = pr + r;
                if (y < 0 || y >= H) continue;
                for (int s = 0; s < S; ++s) {
                    int x = qs + s;
                    if (x < 0 || x >= W) continue;
                    float v = f16_to_f32(I[(((c*D + z)*H + y)*W + x)*N + n]);
                    if (v > best) best = v;
                    sum += (op == 2) ? v*v : v;
                }
            }
        }
    }
    float out;
    if (op == 0)      out = best;
    else if (op == 1) out = sum / (float)(J*T*R*S);
    else              out = sqrtf(sum);
    O[tid] = f32_to_f16(out);
}

// Backward pooling: one thread per input element, gathering over every
// window that covered it. For max, the window's argmax is recomputed in
// the fixed (j,t,r,s) order so the first-wins tie-break matches the host
// backend exactly. Writes overwrite B, so repeated calls are idempotent.

extern "C" __global__ void pool_bprop_f32(
    const float* I, const float* E, float* B, const int* g, unsigned int n_in)
{
    unsigned int tid = blockIdx.x * blockDim.x + threadIdx.x;
    if (tid >= n_in) return;
    int N=g[0], C=g[1], D=g[2], H=g[3], W=g[4];
    int J=g[5], T=g[6], R=g[7], S=g[8];
    int pj=g[9], pd=g[10], ph=g[11], pw=g[12];
    int sj=g[13], sd=g[14], sh=g[15], sw=g[16];
    int K=g[17], M=g[18], P=g[19], Q=g[20], op=g[21];

    int rem = tid;
    int n = rem % N; rem /= N;
    int x = rem % W; rem /= W;
    int y = rem % H; rem /= H;
    int z = rem % D; rem /= D;
    int c = rem;

    int my_flat = ((c*D + z)*H + y)*W + x;
    float my_val = I[my_flat*N + n];
    float acc = 0.0f;

    for (int j = 0; j < J; ++j) {
        int ck = c + pj - j;
        if (ck < 0 || ck % sj) continue;
        int k = ck / sj;
        if (k >= K) continue;
        for (int t = 0; t < T; ++t) {
            int zm = z + pd - t;
            if (zm < 0 || zm % sd) continue;
            int m = zm / sd;
            if (m >= M) continue;
            for (int r = 0; r < R; ++r) {
                int yp = y + ph - r;
                if (yp < 0 || yp % sh) continue;
                int p = yp / sh;
                if (p >= P) continue;
                for (int s = 0; s < S; ++s) {
                    int xq = x + pw - s;
                    if (xq < 0 || xq % sw) continue;
                    int q = xq / sw;
                    if (q >= Q) continue;

                    float e = E[(((k*M + m)*P + p)*Q + q)*N + n];
                    if (op == 1) {
                        acc += e / (float)(J*T*R*S);
                    } else if (op == 0) {
                        // Recompute this window's argmax; gradient lands
                        // here only if this element is it.
                        int kj = k*sj - pj, mt = m*sd - pd;
                        int pr = p*sh - ph, qs = q*sw - pw;
                        float best = -3.402823466e+38f;
                        int best_flat = -1;
                        for (int jj = 0; jj < J; ++jj) {
                            int cc = kj + jj;
                            if (cc < 0 || cc >= C) continue;
                            for (int tt = 0; tt < T; ++tt) {
                                int zz = mt + tt;
                                if (zz < 0 || zz >= D) continue;
                                for (int rr = 0; rr < R; ++rr) {
                                    int yy = pr + rr;
                                    if (yy < 0 || yy >= H) continue;
                                    for (int ss = 0; ss < S; ++ss) {
                                        int xx = qs + ss;
                                        if (xx < 0 || xx >= W) continue;
                                        int flat = ((cc*D + zz)*H + yy)*W + xx;
                                        float v = I[flat*N + n];
                                        if (v > best) { best = v; best_flat = flat; }
                                    }
                                }
                            }
                        }
                        if (best_flat == my_flat) acc += e;
                    } else {
                        // l2: delta * input / norm, zero where norm is zero.
                        int kj = k*sj - pj, mt = m*sd - pd;
                        int pr = p*sh - ph, qs = q*sw - pw;
                        float sumsq = 0.0f;
                        for (int jj = 0; jj < J; ++jj) {
                            int cc = kj + jj;
                            if (cc < 0 || cc >= C) continue;
                            for (int tt = 0; tt < T; ++tt) {
                                int zz = mt + tt;
                                if (zz < 0 || zz >= D) continue;
                                for (int rr = 0; rr < R; ++rr) {
                                    int yy = pr + rr;
                                    if (yy < 0 || yy >= H) continue;
                                    for (int ss = 0; ss < S; ++ss) {
                                        int xx = qs + ss;
                                        if (xx < 0 || xx >= W) continue;
                                        float v = I[(((cc*D + zz)*H + yy)*W + xx)*N + n];
                                        sumsq += v*v;
                                    }
                                }
                            }
                        }
                        float norm = sqrtf(sumsq);
                        if (norm > 0.0f) acc += e * my_val / norm;
                    }
                }
            }
        }
    }
    B[tid] = acc;
}

extern "C" __global__ void pool_bprop_f16(
    const unsigned short* I, const unsigned short* E, unsigned short* B,
    const int* g, unsigned int n_in)
{
    unsigned int tid = blockIdx.x * blockDim.x + threadIdx.x;
    if (tid >= n_in) return;
    int N=g[0], C=g[1], D=g[2], H=g[3], W=g[4];
    int J=g[5], T=g[6], R=g[7], S=g[8];
    int pj=g[9], pd=g[10], ph=g[11], pw=g[12];
    int sj=g[13], sd=g[14], sh=g[15], sw=g[16];
    int K=g[17], M=g[18], P=g[19], Q=g[20], op=g[21];

    int rem = tid;
    int n = rem % N; rem /= N;
    int x = rem % W; rem /= W;
    int y = rem % H; rem /= H;
    int z = rem % D; rem /= D;
    int c = rem;

    int my_flat = ((c*D + z)*H + y)*W + x;
    float my_val = f16_to_f32(I[my_flat*N + n]);
    float acc = 0.0f;

    for (int j = 0; j < J; ++j) {
        int ck = c + pj - j;
        if (ck < 0 || ck % sj) continue;
        int k = ck / sj;
        if (k >= K) continue;
        for (int t = 0; t < T; ++t) {
            int zm = z + pd - t;
            if (zm < 0 || zm % sd) continue;
            int m = zm / sd;
            if (m >= M) continue;
            for (int r = 0; r < R; ++r) {
                int yp = y + ph - r;
                if (yp < 0 || yp % sh) continue;
                int p = yp / sh;
                if (p >= P) continue;
                for (int s = 0; s < S; ++s) {
                    int xq = x + pw - s;
                    if (xq < 0 || xq % sw) continue;
                    int q = xq / sw;
                    if (q >= Q) continue;

                    float e = f16_to_f32(E[(((k*M + m)*P + p)*Q + q)*N + n]);
                    if (op == 1) {
                        acc += e / (float)(J*T*R*S);
                    } else if (op == 0) {
                        int kj = k*sj - pj, mt = m*sd - pd;
                        int pr = p*sh - ph, qs = q*sw - pw;
                        float best = -3.402823466e+38f;
                        int best_flat = -1;
                        for (int jj = 0; jj < J; ++jj) {
                            int cc = kj + jj;
                            if (cc < 0 || cc >= C) continue;
                            for (int tt = 0; tt < T; ++tt) {
                                int zz = mt + tt;
                                if (zz < 0 || zz >= D) continue;
                                for (int rr = 0; rr < R; ++rr) {
                                    int yy = pr + rr;
                                    if (yy < 0 || yy >= H) continue;
                                    for (int ss = 0; ss < S; ++ss) {
                                        int xx = qs + ss;
                                        if (xx < 0 || xx >= W) continue;
                                        int flat = ((cc*D + zz)*H + yy)*W + xx;
                                        float v = f16_to_f32(I[flat*N + n]);
                                        if (v > best) { best = v; best_flat = flat; }
                                    }
                                }
                            }
                        }
                        if (best_flat == my_flat) acc += e;
                    } else {
                        int kj = k*sj - pj, mt = m*sd - pd;
                        int pr = p*sh - ph, qs = q*sw - pw;
                        float sumsq = 0.0f;
                        for (int jj = 0; jj < J; ++jj) {
                            int cc = kj + jj;
                            if (cc < 0 || cc >= C) continue;
                            for (int tt = 0; tt < T; ++tt) {
                                int zz = mt + tt;
                                if (zz < 0 || zz >= D) continue;
                                for (int rr = 0; rr < R; ++rr) {
                                    int yy = pr + rr;
                                    if (yy < 0 || yy >= H) continue;
                                    for (int ss = 0; ss < S; ++ss) {
                                        int xx = qs + ss;
                                        if (xx < 0 || xx >= W) continue;
                                        float v = f16_to_f32(I[(((cc*D + zz)*H + yy)*W + xx)*N + n]);
                                        sumsq += v*v;
                                    }
                                }
                            }
                        }
                        float norm = sqrtf(sumsq);
                        if (norm > 0.0f) acc += e * my_val / norm;
                    }
                }
            }
        }
    }
    B[tid] = f32_to_f16(acc);
}

// ---- reduction ----

// meta: [rank, axis(-1 = all elements), op, offset, dims[rank], strides[rank]]
// op: 0 sum, 1 mean, 2 max, 3 min, 4 var, 5 std
// One thread per output element; each loops over the reduced extent.

extern "C" __global__ void reduce_f32(
    const float* src, float* dst, const int* meta, unsigned int n_out)
{
    unsigned int tid = blockIdx.x * blockDim.x + threadIdx.x;
    if (tid >= n_out) return;
    int rank = meta[0], axis = meta[1], op = meta[2], offset = meta[3];
    const int* dims = meta + 4;
    const int* strides = meta + 4 + rank;

    // Count of reduced values and the base flat offset of this thread's
    // slice through the source view.
    long long red;
    long long base = offset;
    int red_stride = 0;
    if (axis < 0) {
        red = 1;
        for (int i = 0; i < rank; ++i) red *= dims[i];
    } else {
        red = dims[axis];
        red_stride = strides[axis];
        int rem = tid;
        for (int i = rank - 1; i >= 0; --i) {
            if (i == axis) continue;
            base += (long long)(rem % dims[i]) * strides[i];
            rem /= dims[i];
        }
    }

    float acc;
    if (op == 2) acc = -3.402823466e+38f;
    else if (op == 3) acc = 3.402823466e+38f;
    else acc = 0.0f;

    for (long long i = 0; i < red; ++i) {
        long long flat;
        if (axis < 0) {
            long long rem = i;
            flat = offset;
            for (int d = rank - 1; d >= 0; --d) {
                flat += (rem % dims[d]) * strides[d];
                rem /= dims[d];
            }
        } else {
            flat = base + i * red_stride;
        }
        float v = src[flat];
        if (op == 2)      { if (v > acc) acc = v; }
        else if (op == 3) { if (v < acc) acc = v; }
        else              acc += v;
    }

    if (op == 0) { dst[tid] = acc; return; }
    if (op == 1) { dst[tid] = acc / (float)red; return; }
    if (op == 2 || op == 3) { dst[tid] = acc; return; }

    // var/std: second pass over squared deviations from the mean.
    float mean = acc / (float)red;
    float sq = 0.0f;
    for (long long i = 0; i < red; ++i) {
        long long flat;
        if (axis < 0) {
            long long rem = i;
            flat = offset;
            for (int d = rank - 1; d >= 0; --d) {
                flat += (rem % dims[d]) * strides[d];
                rem /= dims[d];
            }
        } else {
            flat = base + i * red_stride;
        }
        float v = src[flat] - mean;
        sq += v * v;
    }
    float var = sq / (float)red;
    dst[tid] = (op == 4) ? var : sqrtf(var);
}

extern "C" __global__ void reduce_f64(
    const double* src, double* dst, const int* meta, unsigned int n_out)
{
    unsigned int tid = blockIdx.x * blockDim.x + threadIdx.x;
    if (tid >= n_out) return;
    int rank = meta[0], axis = meta[1], op = meta[2], offset = meta[3];
    const int* dims = meta + 4;
    const int* strides = meta + 4 + rank;

    long long red;
    long long base = offset;
    int red_stride = 0;
    if (axis < 0) {
        red = 1;
        for (int i = 0; i < rank; ++i) red *= dims[i];
    } else {
        red = dims[axis];
        red_stride = strides[axis];
        int rem = tid;
        for (int i = rank - 1; i >= 0; --i) {
            if (i == axis) continue;
            base += (long long)(rem % dims[i]) * strides[i];
            rem /= dims[i];
        }
    }

    double acc;
    if (op == 2) acc = -1.7976931348623157e+308;
    else if (op == 3) acc = 1.7976931348623157e+308;
    else acc = 0.0;

    for (long long i = 0; i < red; ++i) {
        long long flat;
        if (axis < 0) {
            long long rem = i;
            flat = offset;
            for (int d = rank - 1; d >= 0; --d) {
                flat += (rem % dims[d]) * strides[d];
                rem /= dims[d];
            }
        } else {
            flat = base + i * red_stride;
        }
        double v = src[flat];
        if (op == 2)      { if (v > acc) acc = v; }
        else if (op == 3) { if (v < acc) acc = v; }
        else              acc += v;
    }

    if (op == 0) { dst[tid] = acc; return; }
    if (op == 1) { dst[tid] = acc / (double)red; return; }
    if (op == 2 || op == 3) { dst[tid] = acc; return; }

    double mean = acc / (double)red;
    double sq = 0.0;
    for (long long i = 0; i < red; ++i) {
        long long flat;
        if (axis < 0) {
            long long rem = i;
            flat = offset;
            for (int d = rank - 1; d >= 0; --d) {
                flat += (rem % dims[d]) * strides[d];
                rem /= dims[d];
            }
        } else {
            flat = base + i * red_stride;
        }
        double v = src[flat] - mean;
        sq += v * v;
    }
    double var = sq / (double)red;
    dst[tid] = (op == 4) ? var : sqrt(var);
}

extern "C" __global__ void reduce_f16(
    const unsigned short* src, unsigned short* dst, const int* meta, unsigned int n_out)
{
    unsigned int tid = blockIdx.x * blockDim.x + threadIdx.x;
    if (tid >= n_out) return;
    int rank = meta[0], axis = meta[1], op = meta[2], offset = meta[3];
    const int* dims = meta + 4;
    const int* strides = meta + 4 + rank;

    long long red;
    long long base = offset;
    int red_stride = 0;
    if (axis < 0) {
        red = 1;
        for (int i = 0; i < rank; ++i) red *= dims[i];
    } else {
        red = dims[axis];
        red_stride = strides[axis];
        int rem = tid;
        for (int i = rank - 1; i >= 0; --i) {
            if (i == axis) continue;
            base += (long long)(rem % dims[i]) * strides[i];
            rem /= dims[i];
        }
    }

    float acc;
    if (op == 2) acc = -3.402823466e+38f;
    else if (op == 3) acc = 3.402823466e+38f;
    else acc = 0.0f;

    for (long long i = 0; i < red; ++i) {
        long long flat;
        if (axis < 0) {
            long long rem = i;
            flat = offset;
            for (int d = rank - 1; d >= 0; --d) {
                flat += (rem % dims[d]) * strides[d];
                rem /= dims[d];
            }
        } else {
            flat = base + i * red_stride;
        }
        float v = f16_to_f32(src[flat]);
        if (op == 2)      { if (v > acc) acc = v; }
        else if (op == 3) { if (v < acc) acc = v; }
        else              acc += v;
    }

    if (op == 0) { dst[tid] = f32_to_f16(acc); return; }
    if (op == 1) { dst[tid] = f32_to_f16(acc / (float)red); return; }
    if (op == 2 || op == 3) { dst[tid] = f32_to_f16(acc); return; }

    float mean = acc / (float)red;
    float sq = 0.0f;
    for (long long i = 0; i < red; ++i) {
        long long flat;
        if (axis < 0) {
            long long rem = i;
            flat = offset;
            for (int d = rank - 1; d >= 0; --d) {
                flat += (rem % dims[d]) * strides[d];
                rem /= dims[d];
            }
        } else {
            flat = base + i * red_stride;
        }
        float v = f16_to_f32(src[flat]) - mean;
        sq += v * v;
    }
    float var = sq / (float)red;
    dst[tid] = f32_to_f16((op == 4) ? var : sqrtf(var));
}

// ---- matrix product ----

// meta: [m,k,n, a_off,a_s0,a_s1, b_off,b_s0,b_s1]
// Strided views feed directly in, so a transposed operand costs nothing.

extern "C" __global__ void matmul_f32(
    const float* A, const float* Bm, float* C, const int* meta, unsigned int n_out)
{
    unsigned int tid = blockIdx.x * blockDim.x + threadIdx.x;
    if (tid >= n_out) return;
    int k = meta[1], n = meta[2];
    int a_off = meta[3], a_s0 = meta[4], a_s1 = meta[5];
    int b_off = meta[6], b_s0 = meta[7], b_s1 = meta[8];
    int mi = tid / n, ni = tid % n;
    float acc = 0.0f;
    for (int ki = 0; ki < k; ++ki)
        acc += A[a_off + mi*a_s0 + ki*a_s1] * Bm[b_off + ki*b_s0 + ni*b_s1];
    C[tid] = acc;
}

extern "C" __global__ void matmul_f64(
    const double* A, const double* Bm, double* C, const int* meta, unsigned int n_out)
{
    unsigned int tid = blockIdx.x * blockDim.x + threadIdx.x;
    if (tid >= n_out) return;
    int k = meta[1], n = meta[2];
    int a_off = meta[3], a_s0 = meta[4], a_s1 = meta[5];
    int b_off = meta[6], b_s0 = meta[7], b_s1 = meta[8];
    int mi = tid / n, ni = tid % n;
    double acc = 0.0;
    for (int ki = 0; ki < k; ++ki)
        acc += A[a_off + mi*a_s0 + ki*a_s1] * Bm[b_off + ki*b_s0 + ni*b_s1];
    C[tid] = acc;
}

extern "C" __global__ void matmul_f16(
    const unsigned short* A, const unsigned short* Bm, unsigned short* C,
    const int* meta, unsigned int n_out)
{
    unsigned int tid = blockIdx.x * blockDim.x + threadIdx.x;
    if (tid >= n_out) return;
    int k = meta[1], n = meta[2];
    int a_off = meta[3], a_s0 = meta[4], a_s1 = meta[5];
    int b_off = meta[6], b_s0 = meta[7], b_s1 = meta[8];
    int mi = tid / n, ni = tid % n;
    float acc = 0.0f;
    for (int ki = 0; ki < k; ++ki)
        acc += f16_to_f32(A[a_off + mi*a_s0 + ki*a_s1])
             * f16_to_f32(Bm[b_off + ki*b_s0 + ni*b_s1]);
    C[tid] = f32_to_f16(acc);
}
"#;
