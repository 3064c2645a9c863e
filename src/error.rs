use std::fmt;

/// Classifies every failure surfaced by this crate.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ErrorKind {
    /// Requested device name is not registered.
    NoDevice,
    /// Device context creation failed after retries; the context is
    /// permanently unhealthy.
    DeviceInit,
    /// Double precision requested on a device without `cl_khr_fp64`.
    CapabilityMismatch,
    /// API call in the wrong state of the calculation protocol.
    BadState,
    /// Unknown, disposed or wrong-size calculation id.
    BadId,
    /// Host-side argument inconsistent with the current calculation.
    InvalidInput,
    /// Opcode outside the supported set.
    UnknownOpcode,
    /// Kernel compilation failed; `info` carries the trimmed build log.
    BuildFailed,
    /// A device API call returned a non-success status.
    DeviceOp,
    /// Number of supplied output vectors disagrees with the declared
    /// outputs.
    OutputArity,
}

#[derive(Clone, Debug)]
pub struct ComputeError {
    pub kind: ErrorKind,
    pub info: String,
}

impl fmt::Display for ComputeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.info)
    }
}

impl std::error::Error for ComputeError {}

pub(crate) mod functions {
    use super::{ComputeError, ErrorKind::*};

    macro_rules! builder {
        ($name:ident $kind:expr) => {
            #[inline]
            pub fn $name(info: impl Into<String>) -> ComputeError {
                ComputeError {
                    kind: $kind,
                    info: info.into(),
                }
            }
        };
    }

    builder!(no_device           NoDevice          );
    builder!(device_init         DeviceInit        );
    builder!(capability_mismatch CapabilityMismatch);
    builder!(bad_state           BadState          );
    builder!(bad_id              BadId             );
    builder!(invalid_input       InvalidInput      );
    builder!(unknown_opcode      UnknownOpcode     );
    builder!(build_failed        BuildFailed       );
    builder!(device_op           DeviceOp          );
    builder!(output_arity        OutputArity       );
}
