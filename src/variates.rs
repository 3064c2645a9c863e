//! Device-resident pool of standard-normal variates.
//!
//! Samples come from a 32-bit MT19937 twisted on the device, pushed
//! through the inverse normal CDF. The pool is shared by every
//! calculation on the same context and only ever grows; growth copies
//! the live prefix into the new buffer so previously drawn samples keep
//! their indices bitwise.
//!
//! All state mutation is serialised through event dependencies: each
//! `twist` waits on the previous `generate` (or on the seed
//! initialisation), each `generate` waits on its `twist`, and a growth
//! step retires the old buffer only after the copy and the last
//! `generate` have completed. `twist` and the seed initialisation run as
//! a single work item; `generate` runs one work item per state word.

use log::debug;
use opencl3::command_queue::CommandQueue;
use opencl3::context::Context;
use opencl3::event::Event;
use opencl3::kernel::{ExecuteKernel, Kernel};
use opencl3::memory::{Buffer, CL_MEM_READ_WRITE};
use opencl3::program::Program;
use opencl3::types::{cl_event, cl_ulong};

use std::ptr;

use crate::buffers::{DeviceVec, FpType};
use crate::error::functions::{bad_state, build_failed, device_op};
use crate::source::{self, MT_N};
use crate::ComputeError;

/// Round a sample demand up to a whole number of twist blocks.
#[inline]
pub(crate) fn aligned_size(demand: usize) -> usize {
    MT_N * demand.div_ceil(MT_N)
}

#[derive(Debug)]
pub(crate) struct VariatePool {
    /// Samples currently in the pool; a multiple of [`MT_N`] after any
    /// successful growth.
    size: usize,
    /// Precision the pool was first built with.
    fp: Option<FpType>,
    buffer: Option<DeviceVec>,
    state_buffer: Option<Buffer<cl_ulong>>,
    program: Option<Program>,
    kernel_twist: Option<Kernel>,
    kernel_generate: Option<Kernel>,
    /// Pending seed-initialisation event, consumed by the first wait.
    seed_event: Option<Event>,
}

impl VariatePool {
    pub fn new() -> Self {
        VariatePool {
            size: 0,
            fp: None,
            buffer: None,
            state_buffer: None,
            program: None,
            kernel_twist: None,
            kernel_generate: None,
            seed_event: None,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn buffer(&self) -> Option<&DeviceVec> {
        self.buffer.as_ref()
    }

    /// Ensure the pool holds at least `demand` samples.
    pub fn update(
        &mut self,
        context: &Context,
        queue: &CommandQueue,
        fp: FpType,
        seed: u64,
        demand: usize,
    ) -> Result<(), ComputeError> {
        debug_assert!(demand > 0, "pool update with zero demand");

        if let Some(pool_fp) = self.fp {
            if pool_fp != fp {
                return Err(bad_state(format!(
                    "variates pool was built for {} precision, it can not be reused under {}",
                    pool_fp.type_name(),
                    fp.type_name()
                )));
            }
        }

        if self.program.is_none() {
            self.build_kernels(context, queue, fp, seed)?;
        }

        if self.size >= demand {
            if let Some(event) = self.seed_event.take() {
                event
                    .wait()
                    .map_err(|e| device_op(format!("waiting for seed initialisation: {e}")))?;
            }
            return Ok(());
        }

        let aligned = aligned_size(demand);
        debug!(
            "growing variates pool from {} to {} samples",
            self.size, aligned
        );

        let mut new_buffer = DeviceVec::create(context, fp, aligned)?;
        let old_buffer = self.buffer.take();
        let mut copy_event = None;
        if let Some(old) = old_buffer.as_ref() {
            copy_event = Some(old.enqueue_copy_to(queue, &mut new_buffer, self.size, &[])?);
        }

        let state = self
            .state_buffer
            .as_ref()
            .expect("state buffer exists once the program is built");
        let twist = self.kernel_twist.as_ref().unwrap();
        let generate = self.kernel_generate.as_ref().unwrap();

        let seed_event = self.seed_event.take();
        let mut last_generate: Option<Event> = None;
        let mut cursor = self.size;
        while cursor < demand {
            let wait: Vec<cl_event> = match (&last_generate, &seed_event) {
                (Some(generated), _) => vec![generated.get()],
                (None, Some(seeded)) => vec![seeded.get()],
                (None, None) => Vec::new(),
            };
            let mut exec = ExecuteKernel::new(twist);
            unsafe {
                exec.set_arg(state);
            }
            exec.set_global_work_size(1);
            if !wait.is_empty() {
                exec.set_event_wait_list(&wait);
            }
            let twist_event = unsafe { exec.enqueue_nd_range(queue) }
                .map_err(|e| device_op(format!("enqueueing twist kernel: {e}")))?;

            let twist_wait = [twist_event.get()];
            let mut exec = ExecuteKernel::new(generate);
            unsafe {
                exec.set_arg(&(cursor as cl_ulong)).set_arg(state);
            }
            new_buffer.set_exec_arg(&mut exec);
            exec.set_global_work_size(MT_N)
                .set_event_wait_list(&twist_wait);
            let generate_event = unsafe { exec.enqueue_nd_range(queue) }
                .map_err(|e| device_op(format!("enqueueing generate kernel: {e}")))?;

            last_generate = Some(generate_event);
            cursor += MT_N;
        }

        if let Some(event) = copy_event {
            event
                .wait()
                .map_err(|e| device_op(format!("waiting for pool copy: {e}")))?;
        }
        if let Some(event) = &last_generate {
            event
                .wait()
                .map_err(|e| device_op(format!("waiting for pool generation: {e}")))?;
        }

        // all work referencing the old buffer has completed
        if old_buffer.is_some() {
            debug!("retiring previous variates buffer of {} samples", self.size);
        }
        drop(old_buffer);

        debug_assert_eq!(cursor, aligned);
        self.size = cursor;
        self.buffer = Some(new_buffer);
        Ok(())
    }

    fn build_kernels(
        &mut self,
        context: &Context,
        queue: &CommandQueue,
        fp: FpType,
        seed: u64,
    ) -> Result<(), ComputeError> {
        let src = source::variate_program(fp);
        let program = Program::create_and_build_from_source(context, &src, "").map_err(|log| {
            build_failed(format!(
                "variates program build failed: {}",
                source::trim_build_log(&log)
            ))
        })?;
        let seed_init = Kernel::create(&program, "clc_seedInitialization")
            .map_err(|e| device_op(format!("creating seed init kernel: {e}")))?;
        let kernel_twist = Kernel::create(&program, "clc_twist")
            .map_err(|e| device_op(format!("creating twist kernel: {e}")))?;
        let kernel_generate = Kernel::create(&program, "clc_generate")
            .map_err(|e| device_op(format!("creating generate kernel: {e}")))?;
        let state_buffer =
            unsafe { Buffer::<cl_ulong>::create(context, CL_MEM_READ_WRITE, MT_N, ptr::null_mut()) }
                .map_err(|e| device_op(format!("creating twister state buffer: {e}")))?;

        let seed_event = unsafe {
            ExecuteKernel::new(&seed_init)
                .set_arg(&(seed as cl_ulong))
                .set_arg(&state_buffer)
                .set_global_work_size(1)
                .enqueue_nd_range(queue)
        }
        .map_err(|e| device_op(format!("enqueueing seed initialisation: {e}")))?;

        self.program = Some(program);
        self.kernel_twist = Some(kernel_twist);
        self.kernel_generate = Some(kernel_generate);
        self.state_buffer = Some(state_buffer);
        self.seed_event = Some(seed_event);
        self.fp = Some(fp);
        Ok(())
    }
}
