// Host pool kernels against the brute-force f64 reference, including the
// repeat-stability contract (re-running fprop/bprop on the same buffers
// must reproduce the single-call result).

mod common;

use rand::rngs::StdRng;
use rand::SeedableRng;

use common::{assert_allclose, pool_bprop_ref, pool_fprop_ref, rand_vec};
use stoat_core::kernels;
use stoat_core::{DType, PoolLayer, PoolOp, Shape};
use stoat_cpu::{CpuDevice, CpuTensor};

/// The overlapping channel-window configuration: C=8 pooled two channels
/// at a time, 3x3 spatial window at stride 2.
fn overlap_layer(op: PoolOp) -> PoolLayer {
    PoolLayer::new(
        DType::F32,
        op,
        8,
        8,
        (1, 8, 8),
        (2, 1, 3, 3),
        (0, 0, 0, 0),
        (2, 1, 2, 2),
    )
    .unwrap()
}

fn padded_layer(op: PoolOp) -> PoolLayer {
    PoolLayer::new(
        DType::F32,
        op,
        4,
        4,
        (1, 6, 6),
        (2, 1, 3, 3),
        (1, 0, 1, 1),
        (1, 1, 1, 1),
    )
    .unwrap()
}

fn check_pool(desc: &PoolLayer, seed: u64, atol: f64) {
    let dev = CpuDevice::new();
    let dtype = desc.dtype();
    let mut rng = StdRng::seed_from_u64(seed);
    let i_data = rand_vec(&mut rng, Shape::from(desc.dim_i()).elem_count(), 0.0, 1.0);
    let e_data = rand_vec(&mut rng, Shape::from(desc.dim_o()).elem_count(), -0.2, 0.2);

    let i = CpuTensor::from_f64_slice(&i_data, desc.dim_i(), dtype, &dev).unwrap();
    let e = CpuTensor::from_f64_slice(&e_data, desc.dim_o(), dtype, &dev).unwrap();
    let o = CpuTensor::zeros(desc.dim_o(), dtype, &dev).unwrap();
    let b = CpuTensor::zeros(desc.dim_i(), dtype, &dev).unwrap();

    let i_ref = i.to_f64_vec().unwrap();
    let e_ref = e.to_f64_vec().unwrap();

    // Five repeats on the same buffers must land on the single-call
    // result: fprop overwrites, bprop re-zeroes internally.
    for _ in 0..5 {
        kernels::fprop_pool(desc, &i, &o).unwrap();
        kernels::bprop_pool(desc, &i, &e, &b).unwrap();
    }

    assert_allclose(
        &o.to_f64_vec().unwrap(),
        &pool_fprop_ref(desc, &i_ref),
        atol,
        "fprop",
    );
    assert_allclose(
        &b.to_f64_vec().unwrap(),
        &pool_bprop_ref(desc, &i_ref, &e_ref),
        atol,
        "bprop",
    );
}

#[test]
fn test_max_pool_overlapping_channels() {
    check_pool(&overlap_layer(PoolOp::Max), 3, 1e-5);
}

#[test]
fn test_avg_pool_overlapping_channels() {
    check_pool(&overlap_layer(PoolOp::Avg), 5, 1e-5);
}

#[test]
fn test_max_pool_padded() {
    check_pool(&padded_layer(PoolOp::Max), 7, 1e-5);
}

#[test]
fn test_avg_pool_padded() {
    check_pool(&padded_layer(PoolOp::Avg), 11, 1e-5);
}

#[test]
fn test_l2_pool_forward() {
    // l2 backward is API-complete but unvalidated; forward is checked.
    let desc = overlap_layer(PoolOp::L2);
    let dev = CpuDevice::new();
    let mut rng = StdRng::seed_from_u64(13);
    let i_data = rand_vec(&mut rng, Shape::from(desc.dim_i()).elem_count(), -1.0, 1.0);
    let i = CpuTensor::from_f64_slice(&i_data, desc.dim_i(), DType::F32, &dev).unwrap();
    let o = CpuTensor::zeros(desc.dim_o(), DType::F32, &dev).unwrap();
    kernels::fprop_pool(&desc, &i, &o).unwrap();
    assert_allclose(
        &o.to_f64_vec().unwrap(),
        &pool_fprop_ref(&desc, &i_data),
        1e-5,
        "l2 fprop",
    );
}

#[test]
fn test_max_pool_channel_window_argmax() {
    // Two channels, J=2 window: forward picks 5.0, backward routes the
    // whole gradient to channel 1.
    let dev = CpuDevice::new();
    let desc = PoolLayer::new(
        DType::F32,
        PoolOp::Max,
        1,
        2,
        (1, 1, 1),
        (2, 1, 1, 1),
        (0, 0, 0, 0),
        (1, 1, 1, 1),
    )
    .unwrap();
    assert_eq!(desc.dim_o(), [1, 1, 1, 1, 1]);

    let i = CpuTensor::from_f64_slice(&[3.0, 5.0], desc.dim_i(), DType::F32, &dev).unwrap();
    let e = CpuTensor::from_f64_slice(&[1.0], desc.dim_o(), DType::F32, &dev).unwrap();
    let o = CpuTensor::zeros(desc.dim_o(), DType::F32, &dev).unwrap();
    let b = CpuTensor::zeros(desc.dim_i(), DType::F32, &dev).unwrap();

    kernels::fprop_pool(&desc, &i, &o).unwrap();
    assert_eq!(o.to_f64_vec().unwrap(), vec![5.0]);

    kernels::bprop_pool(&desc, &i, &e, &b).unwrap();
    assert_eq!(b.to_f64_vec().unwrap(), vec![0.0, 1.0]);
}

#[test]
fn test_max_pool_tie_breaks_to_first_tap() {
    let dev = CpuDevice::new();
    let desc = PoolLayer::new(
        DType::F32,
        PoolOp::Max,
        1,
        2,
        (1, 1, 1),
        (2, 1, 1, 1),
        (0, 0, 0, 0),
        (1, 1, 1, 1),
    )
    .unwrap();
    let i = CpuTensor::from_f64_slice(&[4.0, 4.0], desc.dim_i(), DType::F32, &dev).unwrap();
    let e = CpuTensor::from_f64_slice(&[1.0], desc.dim_o(), DType::F32, &dev).unwrap();
    let b = CpuTensor::zeros(desc.dim_i(), DType::F32, &dev).unwrap();
    kernels::bprop_pool(&desc, &i, &e, &b).unwrap();
    assert_eq!(b.to_f64_vec().unwrap(), vec![1.0, 0.0]);
}

#[test]
fn test_avg_pool_fixed_divisor_at_edges() {
    // 1x1 spatial input with a 3x3 window and padding 1: the single
    // window holds one in-bounds tap and eight padding taps, and the
    // divisor stays the full window size.
    let dev = CpuDevice::new();
    let desc = PoolLayer::new(
        DType::F32,
        PoolOp::Avg,
        1,
        1,
        (1, 1, 1),
        (1, 1, 3, 3),
        (0, 0, 1, 1),
        (1, 1, 1, 1),
    )
    .unwrap();
    assert_eq!(desc.kmpq(), (1, 1, 1, 1));

    let i = CpuTensor::from_f64_slice(&[9.0], desc.dim_i(), DType::F32, &dev).unwrap();
    let o = CpuTensor::zeros(desc.dim_o(), DType::F32, &dev).unwrap();
    kernels::fprop_pool(&desc, &i, &o).unwrap();
    assert_eq!(o.to_f64_vec().unwrap(), vec![1.0]); // 9 / (3*3)

    // Backward spreads delta/9 onto the lone in-bounds tap; padding taps
    // are discarded, so nothing divides by the in-bounds count.
    let e = CpuTensor::from_f64_slice(&[0.9], desc.dim_o(), DType::F32, &dev).unwrap();
    let b = CpuTensor::zeros(desc.dim_i(), DType::F32, &dev).unwrap();
    kernels::bprop_pool(&desc, &i, &e, &b).unwrap();
    assert_allclose(&b.to_f64_vec().unwrap(), &[0.1], 1e-7, "avg bprop edge");
}

#[test]
fn test_pool_f16() {
    let desc = PoolLayer::new(
        DType::F16,
        PoolOp::Avg,
        2,
        4,
        (1, 4, 4),
        (2, 1, 2, 2),
        (0, 0, 0, 0),
        (2, 1, 2, 2),
    )
    .unwrap();
    check_pool(&desc, 17, 1e-2);
}
