//! Batched arithmetic expression evaluation on OpenCL devices.
//!
//! A client opens a calculation on a [`ClContext`], declares scalar and
//! vector inputs of a fixed batch size, draws standard-normal variates
//! from a device-resident pool, streams elementary operations as a
//! single-assignment dataflow and declares its outputs. On
//! finalisation the context compiles the accumulated source into a
//! device kernel (or reuses the kernel cached for the same calculation
//! identity), uploads the inputs, runs one work item per path and reads
//! the outputs back.
//!
//! ```no_run
//! use clcalc::{ClRegistry, OpCode, Settings};
//!
//! # fn main() -> Result<(), clcalc::ComputeError> {
//! let mut registry = ClRegistry::new();
//! let name = registry.device_names().into_iter().next().expect("a device");
//! let ctx = registry.context(&name)?;
//! ctx.init()?;
//!
//! let (_id, _fresh) = ctx.initiate_calculation(4, 0, 0, Settings::default())?;
//! let a = ctx.create_input_scalar(3.0)?;
//! let b = ctx.create_input_vector(&[1.0, 2.0, 3.0, 4.0])?;
//! let t = ctx.apply_operation(OpCode::Mul, &[a, b])?;
//! let y = ctx.apply_operation(OpCode::Add, &[t, a])?;
//! ctx.declare_output_variable(y)?;
//!
//! let mut result = vec![0.0f64; 4];
//! ctx.finalize_calculation(&mut [&mut result[..]])?;
//! assert_eq!(result, [6.0, 9.0, 12.0, 15.0]);
//! # Ok(())
//! # }
//! ```
//!
//! Contexts are driven by one caller at a time; device work is
//! enqueued non-blocking and ordered through event dependencies.

mod buffers;
mod context;
mod error;
mod opcode;
mod registry;
mod source;
mod variates;

pub use context::{ClContext, DebugInfo, Settings};
pub use error::{ComputeError, ErrorKind};
pub use opcode::OpCode;
pub use registry::ClRegistry;
