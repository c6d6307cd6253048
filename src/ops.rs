//! Kernel boundary helpers
//!
//! Compute kernels live outside this crate; they take input tensors and write
//! into caller-provided outputs. This module holds the checks every kernel
//! call shares, plus the one data-movement operation the core owns itself:
//! appending key/value state into a pre-expanded cache tensor.

use rayon::prelude::*;

use crate::error::{Result, TesseraError};
use crate::tensor::{element_count, DataType, Device, Tensor};

/// Verify that every tensor lives on the same device
///
/// # Errors
///
/// Returns `DeviceMismatch` naming the first disagreeing pair.
pub fn ensure_same_device(operation: &str, tensors: &[&Tensor]) -> Result<()> {
    let Some(first) = tensors.first() else {
        return Ok(());
    };
    for t in &tensors[1..] {
        if t.device() != first.device() {
            return Err(TesseraError::DeviceMismatch {
                operation: operation.to_string(),
                left: first.device().to_string(),
                right: t.device().to_string(),
            });
        }
    }
    Ok(())
}

/// Verify that every tensor has the same element type
///
/// # Errors
///
/// Returns `UnsupportedOperation` on the first mismatch.
pub fn ensure_same_dtype(operation: &str, tensors: &[&Tensor]) -> Result<()> {
    let Some(first) = tensors.first() else {
        return Ok(());
    };
    if let Some(other) = tensors[1..].iter().find(|t| t.dtype() != first.dtype()) {
        return Err(TesseraError::UnsupportedOperation {
            operation: operation.to_string(),
            reason: format!("mixed element types {} and {}", first.dtype(), other.dtype()),
        });
    }
    Ok(())
}

/// Make `output` a `dtype` tensor of shape `dims` on `device`, ready to write
///
/// The existing buffer is reused when it already has the right type,
/// placement and enough capacity; otherwise a fresh zeroed buffer replaces
/// it. The output is never left smaller than `dims` requires.
///
/// # Errors
///
/// Returns `LockedInCpu` if a host-locked output is asked to live elsewhere.
pub fn prepare_output(
    output: &mut Tensor,
    dtype: DataType,
    dims: &[usize],
    device: &Device,
) -> Result<()> {
    if output.is_locked_in_cpu() && !device.is_cpu() {
        return Err(TesseraError::LockedInCpu {
            target: device.to_string(),
        });
    }

    let required = dtype.bytes_for(element_count(dims));
    let reusable = output.dtype() == dtype
        && output.device() == device
        && output.is_allocated()
        && !output.is_mapped()
        && output.per_channel_axis().is_none()
        && output.capacity_bytes() >= required;
    if reusable {
        return output.resize(dims);
    }

    let mut fresh = Tensor::with_dims(dtype, dims);
    fresh.set_lock_in_cpu(output.is_locked_in_cpu());
    fresh.to_device(device)?;
    fresh.allocate();
    *output = fresh;
    Ok(())
}

/// Validated byte geometry of one append
#[derive(Debug, Clone)]
struct CatPlan {
    new_dims: Vec<usize>,
    outer: usize,
    old_row: usize,
    add_row: usize,
}

fn plan_cat(dest: &Tensor, src: &Tensor, axis: usize) -> Result<CatPlan> {
    ensure_same_device("cat_direct", &[dest, src])?;
    ensure_same_dtype("cat_direct", &[dest, src])?;
    if dest.dtype().unit_size_div() != 1 {
        return Err(TesseraError::UnsupportedOperation {
            operation: "cat_direct".to_string(),
            reason: format!("{} rows are not byte aligned", dest.dtype()),
        });
    }
    if axis >= src.ndim() {
        return Err(TesseraError::InvalidShape {
            reason: format!("cat axis {axis} out of range for {:?}", src.dims()),
        });
    }

    // An unshaped destination starts as an empty slice along `axis`.
    let base: Vec<usize> = if dest.ndim() == 0 {
        let mut d = src.dims().to_vec();
        d[axis] = 0;
        d
    } else {
        dest.dims().to_vec()
    };
    let compatible = base.len() == src.ndim()
        && base
            .iter()
            .zip(src.dims())
            .enumerate()
            .all(|(i, (a, b))| i == axis || a == b);
    if !compatible {
        return Err(TesseraError::InvalidShape {
            reason: format!(
                "cannot append {:?} to {:?} along axis {axis}",
                src.dims(),
                base
            ),
        });
    }

    let mut new_dims = base.clone();
    new_dims[axis] += src.dims()[axis];
    let required = dest.dtype().bytes_for(element_count(&new_dims));
    if required > dest.capacity_bytes() {
        return Err(TesseraError::CapacityExceeded {
            required,
            capacity: dest.capacity_bytes(),
        });
    }
    if src.count(0) > 0 && !src.is_allocated() {
        return Err(TesseraError::UnsupportedOperation {
            operation: "cat_direct".to_string(),
            reason: "source tensor has no allocated buffer".to_string(),
        });
    }

    let unit = dest.dtype().unit_size();
    let inner: usize = base[axis + 1..].iter().product();
    Ok(CatPlan {
        outer: base[..axis].iter().product(),
        old_row: base[axis] * inner * unit,
        add_row: src.dims()[axis] * inner * unit,
        new_dims,
    })
}

fn apply_cat(dest: &mut Tensor, src: &Tensor, plan: &CatPlan) -> Result<()> {
    let new_row = plan.old_row + plan.add_row;
    let incoming = src.as_bytes();
    {
        let buf = dest.capacity_bytes_mut();
        // Back to front: row r only ever moves to a higher offset, so rows
        // below it are still intact when they are moved.
        for r in (0..plan.outer).rev() {
            buf.copy_within(r * plan.old_row..(r + 1) * plan.old_row, r * new_row);
            let at = r * new_row + plan.old_row;
            buf[at..at + plan.add_row]
                .copy_from_slice(&incoming[r * plan.add_row..(r + 1) * plan.add_row]);
        }
    }
    dest.resize(&plan.new_dims)
}

/// Append `src` to `dest` along `axis` inside `dest`'s reserved capacity
///
/// `dest` must have been grown with [`Tensor::expansion`] beforehand; an
/// unshaped `dest` takes `src`'s shape. Existing elements keep their
/// logical positions.
///
/// # Errors
///
/// Returns a device, type, shape or capacity error before touching `dest`.
pub fn cat_direct(dest: &mut Tensor, src: &Tensor, axis: usize) -> Result<()> {
    let plan = plan_cat(dest, src, axis)?;
    apply_cat(dest, src, &plan)
}

/// [`cat_direct`] for every sequence of a batch
///
/// All appends are validated first; if any fails, no destination is
/// modified. Valid appends then run in parallel, one task per destination.
///
/// # Errors
///
/// Returns `InvalidShape` if the slices differ in length, or the first
/// per-sequence error.
pub fn cat_direct_batch(dests: &mut [Tensor], srcs: &[Tensor], axis: usize) -> Result<()> {
    if dests.len() != srcs.len() {
        return Err(TesseraError::InvalidShape {
            reason: format!(
                "batch of {} destinations but {} sources",
                dests.len(),
                srcs.len()
            ),
        });
    }
    let plans = dests
        .iter()
        .zip(srcs)
        .map(|(d, s)| plan_cat(d, s, axis))
        .collect::<Result<Vec<_>>>()?;

    dests
        .par_iter_mut()
        .zip(srcs.par_iter())
        .zip(plans.par_iter())
        .try_for_each(|((dest, src), plan)| apply_cat(dest, src, plan))
}
