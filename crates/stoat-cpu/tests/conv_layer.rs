// Host conv kernels against the brute-force f64 reference.

mod common;

use rand::rngs::StdRng;
use rand::SeedableRng;

use common::{assert_allclose, conv_bprop_ref, conv_fprop_ref, conv_update_ref, rand_vec};
use stoat_core::kernels;
use stoat_core::{ConvLayer, DType, Error, Shape};
use stoat_cpu::{CpuDevice, CpuTensor};

struct ConvCase {
    desc: ConvLayer,
    i: CpuTensor,
    f: CpuTensor,
    e: CpuTensor,
}

fn conv_case(desc: ConvLayer, seed: u64) -> ConvCase {
    let dev = CpuDevice::new();
    let mut rng = StdRng::seed_from_u64(seed);
    let dtype = desc.dtype();
    let i = rand_vec(&mut rng, Shape::from(desc.dim_i()).elem_count(), -0.8, 0.8);
    let f = rand_vec(&mut rng, Shape::from(desc.dim_f()).elem_count(), 0.0, 0.3);
    let e = rand_vec(&mut rng, Shape::from(desc.dim_o()).elem_count(), -0.2, 0.2);
    ConvCase {
        i: CpuTensor::from_f64_slice(&i, desc.dim_i(), dtype, &dev).unwrap(),
        f: CpuTensor::from_f64_slice(&f, desc.dim_f(), dtype, &dev).unwrap(),
        e: CpuTensor::from_f64_slice(&e, desc.dim_o(), dtype, &dev).unwrap(),
        desc,
    }
}

/// Run all three passes and compare against the reference at `atol`.
/// Reference inputs are read back from the tensors so that dtype
/// quantization (f16) applies to both sides.
fn check_conv(case: &ConvCase, atol: f64) {
    let dev = CpuDevice::new();
    let desc = &case.desc;
    let dtype = desc.dtype();

    let i_ref = case.i.to_f64_vec().unwrap();
    let f_ref = case.f.to_f64_vec().unwrap();
    let e_ref = case.e.to_f64_vec().unwrap();

    let o = CpuTensor::zeros(desc.dim_o(), dtype, &dev).unwrap();
    kernels::fprop_conv(desc, &case.i, &case.f, &o).unwrap();
    assert_allclose(
        &o.to_f64_vec().unwrap(),
        &conv_fprop_ref(desc, &i_ref, &f_ref),
        atol,
        "fprop",
    );

    let b = CpuTensor::zeros(desc.dim_i(), dtype, &dev).unwrap();
    kernels::bprop_conv(desc, &case.f, &case.e, &b).unwrap();
    assert_allclose(
        &b.to_f64_vec().unwrap(),
        &conv_bprop_ref(desc, &f_ref, &e_ref),
        atol,
        "bprop",
    );

    let u = CpuTensor::zeros(desc.dim_f(), dtype, &dev).unwrap();
    kernels::update_conv(desc, &case.i, &case.e, &u).unwrap();
    assert_allclose(
        &u.to_f64_vec().unwrap(),
        &conv_update_ref(desc, &i_ref, &e_ref),
        atol,
        "update",
    );
}

#[test]
fn test_conv_padded_unit_stride() {
    let desc = ConvLayer::new(
        DType::F32,
        8,
        4,
        8,
        (1, 6, 6),
        (1, 3, 3),
        (0, 1, 1),
        (1, 1, 1),
    )
    .unwrap();
    check_conv(&conv_case(desc, 7), 1e-5);
}

#[test]
fn test_conv_strided() {
    let desc = ConvLayer::new(
        DType::F32,
        4,
        3,
        5,
        (1, 8, 8),
        (1, 3, 3),
        (0, 1, 1),
        (1, 2, 2),
    )
    .unwrap();
    check_conv(&conv_case(desc, 11), 1e-5);
}

#[test]
fn test_conv_volumetric() {
    // Depth axis engaged: T > 1 with depth padding.
    let desc = ConvLayer::new(
        DType::F32,
        2,
        2,
        3,
        (4, 5, 5),
        (3, 3, 3),
        (1, 1, 1),
        (1, 1, 1),
    )
    .unwrap();
    check_conv(&conv_case(desc, 13), 1e-5);
}

#[test]
fn test_conv_f16() {
    let desc = ConvLayer::new(
        DType::F16,
        2,
        2,
        2,
        (1, 4, 4),
        (1, 3, 3),
        (0, 1, 1),
        (1, 1, 1),
    )
    .unwrap();
    // f16 stores round each output to ~3 decimal digits.
    check_conv(&conv_case(desc, 17), 1e-2);
}

#[test]
fn test_unit_conv_is_scalar_multiply() {
    let dev = CpuDevice::new();
    let desc = ConvLayer::new(
        DType::F32,
        1,
        1,
        1,
        (1, 1, 1),
        (1, 1, 1),
        (0, 0, 0),
        (1, 1, 1),
    )
    .unwrap();
    assert_eq!(desc.dim_o(), [1, 1, 1, 1, 1]);

    let i = CpuTensor::from_f64_slice(&[3.0], desc.dim_i(), DType::F32, &dev).unwrap();
    let f = CpuTensor::from_f64_slice(&[0.5], desc.dim_f(), DType::F32, &dev).unwrap();
    let o = CpuTensor::zeros(desc.dim_o(), DType::F32, &dev).unwrap();
    kernels::fprop_conv(&desc, &i, &f, &o).unwrap();
    assert_eq!(o.to_f64_vec().unwrap(), vec![1.5]);
}

#[test]
fn test_bprop_accumulates_into_b() {
    // B is accumulated, not overwritten: two passes double the result.
    let dev = CpuDevice::new();
    let desc = ConvLayer::new(
        DType::F32,
        2,
        2,
        2,
        (1, 4, 4),
        (1, 3, 3),
        (0, 1, 1),
        (1, 1, 1),
    )
    .unwrap();
    let case = conv_case(desc, 23);

    let b = CpuTensor::zeros(case.desc.dim_i(), DType::F32, &dev).unwrap();
    kernels::bprop_conv(&case.desc, &case.f, &case.e, &b).unwrap();
    let once = b.to_f64_vec().unwrap();
    kernels::bprop_conv(&case.desc, &case.f, &case.e, &b).unwrap();
    let twice = b.to_f64_vec().unwrap();
    let doubled: Vec<f64> = once.iter().map(|v| v * 2.0).collect();
    assert_allclose(&twice, &doubled, 1e-5, "bprop accumulation");
}

#[test]
fn test_fprop_overwrites_output() {
    let dev = CpuDevice::new();
    let desc = ConvLayer::new(
        DType::F32,
        2,
        2,
        2,
        (1, 4, 4),
        (1, 3, 3),
        (0, 1, 1),
        (1, 1, 1),
    )
    .unwrap();
    let case = conv_case(desc, 29);

    let o = CpuTensor::zeros(case.desc.dim_o(), DType::F32, &dev).unwrap();
    kernels::fprop_conv(&case.desc, &case.i, &case.f, &o).unwrap();
    let once = o.to_f64_vec().unwrap();
    kernels::fprop_conv(&case.desc, &case.i, &case.f, &o).unwrap();
    assert_eq!(o.to_f64_vec().unwrap(), once);
}

#[test]
fn test_kernel_rejects_mismatched_shapes() {
    let dev = CpuDevice::new();
    let desc = ConvLayer::new(
        DType::F32,
        2,
        2,
        2,
        (1, 4, 4),
        (1, 3, 3),
        (0, 1, 1),
        (1, 1, 1),
    )
    .unwrap();
    let i = CpuTensor::zeros(desc.dim_i(), DType::F32, &dev).unwrap();
    let f = CpuTensor::zeros((2, 1, 3, 3, 3), DType::F32, &dev).unwrap(); // wrong K
    let o = CpuTensor::zeros(desc.dim_o(), DType::F32, &dev).unwrap();
    match kernels::fprop_conv(&desc, &i, &f, &o) {
        Err(Error::ShapeMismatch { .. }) => {}
        other => panic!("expected ShapeMismatch, got {other:?}"),
    }
}

#[test]
fn test_kernel_rejects_wrong_dtype() {
    let dev = CpuDevice::new();
    let desc = ConvLayer::new(
        DType::F32,
        2,
        2,
        2,
        (1, 4, 4),
        (1, 3, 3),
        (0, 1, 1),
        (1, 1, 1),
    )
    .unwrap();
    let i = CpuTensor::zeros(desc.dim_i(), DType::F16, &dev).unwrap();
    let f = CpuTensor::zeros(desc.dim_f(), DType::F32, &dev).unwrap();
    let o = CpuTensor::zeros(desc.dim_o(), DType::F32, &dev).unwrap();
    match kernels::fprop_conv(&desc, &i, &f, &o) {
        Err(Error::DTypeMismatch { .. }) => {}
        other => panic!("expected DTypeMismatch, got {other:?}"),
    }
}
