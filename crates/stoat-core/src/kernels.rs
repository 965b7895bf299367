use crate::backend::{Backend, BackendDevice};
use crate::conv::ConvLayer;
use crate::error::{Error, Result};
use crate::pool::PoolLayer;
use crate::shape::Shape;
use crate::tensor::Tensor;

// Kernel entry points
//
// Thin validated wrappers around the Backend kernel methods. Validation is
// eager: a tensor whose shape, dtype, or device disagrees with the
// descriptor fails here, before any compute is dispatched.

fn check_tensor<B: Backend>(
    what: &str,
    t: &Tensor<B>,
    dims: [usize; 5],
    desc_dtype: crate::DType,
    device: &B::Device,
) -> Result<()> {
    let expected = Shape::from(dims);
    if t.shape() != &expected {
        return Err(Error::ShapeMismatch {
            expected,
            got: t.shape().clone(),
        });
    }
    if t.dtype() != desc_dtype {
        return Err(Error::DTypeMismatch {
            expected: desc_dtype,
            got: t.dtype(),
        });
    }
    if !t.device().same_device(device) {
        return Err(Error::device(format!(
            "{what} tensor lives on {}, kernel dispatched on {}",
            t.device().name(),
            device.name()
        )));
    }
    if !t.layout().is_contiguous() {
        return Err(Error::unsupported(format!(
            "{what} tensor must be contiguous for layer kernels"
        )));
    }
    t.check_storage()
}

/// Forward convolution: `o[k,m,p,q,n] = Σ f[c,t,r,s,k] · i[window]`.
/// Overwrites `o` entirely.
pub fn fprop_conv<B: Backend>(
    desc: &ConvLayer,
    i: &Tensor<B>,
    f: &Tensor<B>,
    o: &Tensor<B>,
) -> Result<()> {
    let dev = i.device();
    check_tensor("input", i, desc.dim_i(), desc.dtype(), dev)?;
    check_tensor("filter", f, desc.dim_f(), desc.dtype(), dev)?;
    check_tensor("output", o, desc.dim_o(), desc.dtype(), dev)?;
    let i_s = i.storage();
    let f_s = f.storage();
    let mut o_s = o.storage_mut();
    B::fprop_conv(desc, &i_s, &f_s, &mut o_s, dev)
}

/// Input-gradient pass: scatters `f·e` back through the forward windows,
/// accumulating into `b`. The caller zeroes `b` beforehand.
pub fn bprop_conv<B: Backend>(
    desc: &ConvLayer,
    f: &Tensor<B>,
    e: &Tensor<B>,
    b: &Tensor<B>,
) -> Result<()> {
    let dev = f.device();
    check_tensor("filter", f, desc.dim_f(), desc.dtype(), dev)?;
    check_tensor("delta", e, desc.dim_o(), desc.dtype(), dev)?;
    check_tensor("grad-input", b, desc.dim_i(), desc.dtype(), dev)?;
    let f_s = f.storage();
    let e_s = e.storage();
    let mut b_s = b.storage_mut();
    B::bprop_conv(desc, &f_s, &e_s, &mut b_s, dev)
}

/// Filter-gradient pass: `u[c,t,r,s,k] += Σ_{m,p,q,n} i[window]·e[k,m,p,q,n]`,
/// accumulating into caller-zeroed `u`.
pub fn update_conv<B: Backend>(
    desc: &ConvLayer,
    i: &Tensor<B>,
    e: &Tensor<B>,
    u: &Tensor<B>,
) -> Result<()> {
    let dev = i.device();
    check_tensor("input", i, desc.dim_i(), desc.dtype(), dev)?;
    check_tensor("delta", e, desc.dim_o(), desc.dtype(), dev)?;
    check_tensor("grad-filter", u, desc.dim_f(), desc.dtype(), dev)?;
    let i_s = i.storage();
    let e_s = e.storage();
    let mut u_s = u.storage_mut();
    B::update_conv(desc, &i_s, &e_s, &mut u_s, dev)
}

/// Forward pooling. Overwrites `o` entirely; safe to call repeatedly.
pub fn fprop_pool<B: Backend>(desc: &PoolLayer, i: &Tensor<B>, o: &Tensor<B>) -> Result<()> {
    let dev = i.device();
    check_tensor("input", i, desc.dim_i(), desc.dtype(), dev)?;
    check_tensor("output", o, desc.dim_o(), desc.dtype(), dev)?;
    let i_s = i.storage();
    let mut o_s = o.storage_mut();
    B::fprop_pool(desc, &i_s, &mut o_s, dev)
}

/// Backward pooling. Zeroes `b` before scattering, so repeated calls with
/// the same inputs converge to the same result.
pub fn bprop_pool<B: Backend>(
    desc: &PoolLayer,
    i: &Tensor<B>,
    e: &Tensor<B>,
    b: &Tensor<B>,
) -> Result<()> {
    let dev = i.device();
    check_tensor("input", i, desc.dim_i(), desc.dtype(), dev)?;
    check_tensor("delta", e, desc.dim_o(), desc.dtype(), dev)?;
    check_tensor("grad-input", b, desc.dim_i(), desc.dtype(), dev)?;
    let i_s = i.storage();
    let e_s = e.storage();
    let mut b_s = b.storage_mut();
    B::bprop_pool(desc, &i_s, &e_s, &mut b_s, dev)
}
