//! Precision-tagged host and device vectors.
//!
//! Every calculation runs either in `float` or `double`; tagging the
//! staging vectors and device buffers with the precision keeps the two
//! code paths from mixing element sizes at a transfer site.

use opencl3::command_queue::CommandQueue;
use opencl3::context::Context;
use opencl3::event::Event;
use opencl3::kernel::ExecuteKernel;
use opencl3::memory::{Buffer, CL_MEM_READ_WRITE};
use opencl3::types::{cl_bool, cl_double, cl_event, cl_float};

use std::ptr;

use crate::error::functions::device_op;
use crate::ComputeError;

/// Floating-point type a calculation is evaluated in on the device.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum FpType {
    Single,
    Double,
}

impl FpType {
    #[inline]
    pub fn from_settings(use_double_precision: bool) -> Self {
        if use_double_precision {
            FpType::Double
        } else {
            FpType::Single
        }
    }

    /// Element size in bytes, on host and device alike.
    #[inline]
    pub fn size(self) -> usize {
        match self {
            FpType::Single => std::mem::size_of::<cl_float>(),
            FpType::Double => std::mem::size_of::<cl_double>(),
        }
    }

    /// Type name in generated device source.
    #[inline]
    pub fn type_name(self) -> &'static str {
        match self {
            FpType::Single => "float",
            FpType::Double => "double",
        }
    }

    /// Literal suffix in generated device source.
    #[inline]
    pub fn suffix(self) -> &'static str {
        match self {
            FpType::Single => "f",
            FpType::Double => "",
        }
    }

    /// Machine epsilon as a hex literal of the matching type.
    #[inline]
    pub fn eps_literal(self) -> &'static str {
        match self {
            FpType::Single => "0x1.0p-23f",
            FpType::Double => "0x1.0p-52",
        }
    }

    /// Largest finite value as a hex literal of the matching type.
    #[inline]
    pub fn max_literal(self) -> &'static str {
        match self {
            FpType::Single => "0x1.fffffep127f",
            FpType::Double => "0x1.fffffffffffffp1023",
        }
    }
}

/// Clamp into the finite `float` range before narrowing, so that large
/// doubles become `±FLT_MAX` instead of `±inf`.
#[inline]
pub(crate) fn clamp_to_single(v: f64) -> f32 {
    v.min(f32::MAX as f64).max(-f32::MAX as f64) as f32
}

/// Host staging vector in the precision of the current calculation.
#[derive(Debug)]
pub(crate) enum HostVec {
    Single(Vec<f32>),
    Double(Vec<f64>),
}

impl HostVec {
    pub fn new(fp: FpType) -> Self {
        match fp {
            FpType::Single => HostVec::Single(Vec::new()),
            FpType::Double => HostVec::Double(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            HostVec::Single(v) => v.len(),
            HostVec::Double(v) => v.len(),
        }
    }

    pub fn extend(&mut self, values: &[f64]) {
        match self {
            HostVec::Single(v) => v.extend(values.iter().copied().map(clamp_to_single)),
            HostVec::Double(v) => v.extend_from_slice(values),
        }
    }
}

/// Device buffer in the precision of the calculation that created it.
#[derive(Debug)]
pub(crate) enum DeviceVec {
    Single(Buffer<cl_float>),
    Double(Buffer<cl_double>),
}

impl DeviceVec {
    /// Allocate an uninitialised device buffer of `len` elements.
    pub fn create(context: &Context, fp: FpType, len: usize) -> Result<Self, ComputeError> {
        match fp {
            FpType::Single => {
                let buffer = unsafe {
                    Buffer::<cl_float>::create(context, CL_MEM_READ_WRITE, len, ptr::null_mut())
                }
                .map_err(|e| device_op(format!("creating device buffer ({len} x float): {e}")))?;
                Ok(DeviceVec::Single(buffer))
            }
            FpType::Double => {
                let buffer = unsafe {
                    Buffer::<cl_double>::create(context, CL_MEM_READ_WRITE, len, ptr::null_mut())
                }
                .map_err(|e| device_op(format!("creating device buffer ({len} x double): {e}")))?;
                Ok(DeviceVec::Double(buffer))
            }
        }
    }

    pub fn fp(&self) -> FpType {
        match self {
            DeviceVec::Single(_) => FpType::Single,
            DeviceVec::Double(_) => FpType::Double,
        }
    }

    /// Enqueue a non-blocking upload of `host` into this buffer.
    ///
    /// `host` must carry the same precision as the buffer; the caller
    /// keeps the staging vector alive until the returned event completes.
    pub fn enqueue_write(
        &mut self,
        queue: &CommandQueue,
        host: &HostVec,
        blocking_write: cl_bool,
        wait: &[cl_event],
    ) -> Result<Event, ComputeError> {
        let event = match (self, host) {
            (DeviceVec::Single(buffer), HostVec::Single(data)) => unsafe {
                queue.enqueue_write_buffer(buffer, blocking_write, 0, data, wait)
            },
            (DeviceVec::Double(buffer), HostVec::Double(data)) => unsafe {
                queue.enqueue_write_buffer(buffer, blocking_write, 0, data, wait)
            },
            _ => {
                return Err(device_op(
                    "host/device precision mismatch on buffer upload",
                ))
            }
        };
        event.map_err(|e| device_op(format!("writing to device buffer: {e}")))
    }

    /// Enqueue a device-side copy of the first `elems` elements of
    /// `self` into `dst`.
    pub fn enqueue_copy_to(
        &self,
        queue: &CommandQueue,
        dst: &mut DeviceVec,
        elems: usize,
        wait: &[cl_event],
    ) -> Result<Event, ComputeError> {
        let bytes = elems * self.fp().size();
        let event = match (self, dst) {
            (DeviceVec::Single(src), DeviceVec::Single(dst)) => unsafe {
                queue.enqueue_copy_buffer(src, dst, 0, 0, bytes, wait)
            },
            (DeviceVec::Double(src), DeviceVec::Double(dst)) => unsafe {
                queue.enqueue_copy_buffer(src, dst, 0, 0, bytes, wait)
            },
            _ => return Err(device_op("precision mismatch on device buffer copy")),
        };
        event.map_err(|e| device_op(format!("copying device buffer: {e}")))
    }

    /// Bind this buffer as the next kernel argument.
    pub fn set_exec_arg(&self, exec: &mut ExecuteKernel<'_>) {
        match self {
            DeviceVec::Single(buffer) => unsafe {
                exec.set_arg(buffer);
            },
            DeviceVec::Double(buffer) => unsafe {
                exec.set_arg(buffer);
            },
        }
    }
}
