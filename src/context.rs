//! The per-device calculation context.
//!
//! A context is a state machine driven by one caller at a time:
//! `initiate_calculation` opens a calculation, inputs and variates are
//! declared, operations are streamed into a single-assignment kernel
//! body, and `finalize_calculation` compiles (or reuses) the kernel,
//! uploads the inputs, launches one work item per path and reads the
//! outputs back. Compiled kernels are cached per `(id, version)` so a
//! repeated calculation skips the build.

use log::{debug, error};
use opencl3::command_queue::CommandQueue;
use opencl3::context::Context;
use opencl3::device::Device;
use opencl3::event::Event;
use opencl3::kernel::{ExecuteKernel, Kernel};
use opencl3::memory::{Buffer, CL_MEM_READ_WRITE};
use opencl3::program::Program;
use opencl3::types::{cl_double, cl_event, cl_float, cl_uint, cl_ulong, CL_BLOCKING, CL_NON_BLOCKING};

use std::ptr;
use std::time::{Duration, Instant};

use crate::buffers::{DeviceVec, FpType, HostVec};
use crate::error::functions::{
    bad_id, bad_state, build_failed, capability_mismatch, device_init, device_op, invalid_input,
    output_arity,
};
use crate::opcode::{check_args, ssa_line, ArgResolver, OpCode};
use crate::source;
use crate::variates::VariatePool;
use crate::ComputeError;

/// Attempts at device context creation before giving up.
pub(crate) const INIT_ATTEMPTS: usize = 10;
/// Backoff between context creation attempts.
pub(crate) const INIT_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Per-evaluation settings, chosen at `initiate_calculation`.
#[derive(Clone, Copy, Debug)]
pub struct Settings {
    pub use_double_precision: bool,
    pub rng_seed: u64,
    /// Collect the [`DebugInfo`] counters; inserts queue flushes between
    /// phases so the timings attribute correctly.
    pub debug: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            use_double_precision: false,
            rng_seed: 42,
            debug: false,
        }
    }
}

/// Counters accumulated across calculations when `Settings::debug` is
/// set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DebugInfo {
    pub number_of_operations: u64,
    pub nanos_data_copy: u64,
    pub nanos_program_build: u64,
    pub nanos_calculation: u64,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ComputeState {
    Idle,
    CreateInput,
    CreateVariates,
    Calc,
}

/// One cached calculation, addressed by its 1-based id.
#[derive(Debug)]
struct CalcRecord {
    n: usize,
    version: usize,
    disposed: bool,
    fp: FpType,
    program: Option<Program>,
    kernel: Option<Kernel>,
    input_buffer_size: usize,
    n_output_vars: usize,
    /// Variate count baked into the kernel signature at build time.
    n_variates: usize,
}

/// Scratch state of the calculation currently between
/// `initiate_calculation` and `finalize_calculation`.
#[derive(Debug)]
struct CurrentCalc {
    id: usize,
    settings: Settings,
    n_vars: usize,
    n_variates: usize,
    input_offset: Vec<usize>,
    input_is_scalar: Vec<bool>,
    input_values: HostVec,
    freed: Vec<usize>,
    outputs: Vec<usize>,
    ssa: String,
}

impl CurrentCalc {
    fn new() -> Self {
        CurrentCalc {
            id: 0,
            settings: Settings::default(),
            n_vars: 0,
            n_variates: 0,
            input_offset: Vec::new(),
            input_is_scalar: Vec::new(),
            input_values: HostVec::new(FpType::Single),
            freed: Vec::new(),
            outputs: Vec::new(),
            ssa: String::new(),
        }
    }

    fn n_inputs(&self) -> usize {
        self.input_offset.len()
    }
}

#[derive(Debug)]
struct ClState {
    context: Context,
    queue: CommandQueue,
}

#[derive(Debug)]
pub struct ClContext {
    // records and the pool drop before the device context and queue
    records: Vec<CalcRecord>,
    pool: VariatePool,
    cur: CurrentCalc,
    state: ComputeState,
    debug_info: DebugInfo,
    device_info: Vec<(String, String)>,
    supports_double_precision: bool,
    healthy: bool,
    cl: Option<ClState>,
    device: Device,
}

impl ClContext {
    pub(crate) fn new(
        device: Device,
        device_info: Vec<(String, String)>,
        supports_double_precision: bool,
    ) -> Self {
        ClContext {
            records: Vec::new(),
            pool: VariatePool::new(),
            cur: CurrentCalc::new(),
            state: ComputeState::Idle,
            debug_info: DebugInfo::default(),
            device_info,
            supports_double_precision,
            healthy: true,
            cl: None,
            device,
        }
    }

    /// Context without a backing device, for exercising the protocol
    /// bookkeeping in tests.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        ClContext::new(Device::new(ptr::null_mut()), Vec::new(), true)
    }

    /// Create the device context and command queue and run the device
    /// probes. No-op when already initialised; an unhealthy context
    /// rejects the call.
    pub fn init(&mut self) -> Result<(), ComputeError> {
        self.init_with_retry(INIT_ATTEMPTS, INIT_RETRY_DELAY)
    }

    /// [`init`](Self::init) with explicit retry parameters.
    pub fn init_with_retry(
        &mut self,
        attempts: usize,
        delay: Duration,
    ) -> Result<(), ComputeError> {
        if !self.healthy {
            return Err(device_init(
                "context is unhealthy, check log for previous errors",
            ));
        }
        if self.cl.is_some() {
            return Ok(());
        }

        self.debug_info = DebugInfo::default();

        let mut context = None;
        let mut last_error = String::new();
        for attempt in 0..attempts.max(1) {
            match Context::from_device(&self.device) {
                Ok(created) => {
                    context = Some(created);
                    break;
                }
                Err(e) => {
                    last_error = e.to_string();
                    error!(
                        "device context creation failed (attempt {}/{}): {last_error}",
                        attempt + 1,
                        attempts.max(1)
                    );
                    if attempt + 1 < attempts {
                        std::thread::sleep(delay);
                    }
                }
            }
        }
        let Some(context) = context else {
            self.healthy = false;
            return Err(device_init(format!(
                "device context creation failed after {attempts} attempts: {last_error}"
            )));
        };

        let queue = match CommandQueue::create_default_with_properties(&context, 0, 0) {
            Ok(queue) => queue,
            Err(e) => {
                self.healthy = false;
                return Err(device_init(format!("creating command queue: {e}")));
            }
        };

        self.cl = Some(ClState { context, queue });
        self.run_device_probes();
        Ok(())
    }

    /// Capability metadata captured at registration plus the init-time
    /// probe results.
    pub fn device_info(&self) -> &[(String, String)] {
        &self.device_info
    }

    pub fn supports_double_precision(&self) -> bool {
        self.supports_double_precision
    }

    pub fn debug_info(&self) -> &DebugInfo {
        &self.debug_info
    }

    /// Open a calculation of batch size `n`.
    ///
    /// `id == 0` allocates a new record and returns its fresh 1-based
    /// id. A non-zero `id` resumes an existing record; a differing
    /// `version` (or a change of floating-point precision against the
    /// cached kernel) releases the kernel and reports the calculation
    /// fresh again.
    pub fn initiate_calculation(
        &mut self,
        n: usize,
        id: usize,
        version: usize,
        settings: Settings,
    ) -> Result<(usize, bool), ComputeError> {
        if !self.healthy {
            return Err(device_init(
                "context is unhealthy, check log for previous errors",
            ));
        }
        if self.state != ComputeState::Idle {
            return Err(bad_state(
                "initiateCalculation: a calculation is already in progress",
            ));
        }
        if n == 0 {
            return Err(invalid_input("initiateCalculation: n must not be zero"));
        }

        let fp = FpType::from_settings(settings.use_double_precision);
        let mut fresh = false;

        if id == 0 {
            self.records.push(CalcRecord {
                n,
                version,
                disposed: false,
                fp,
                program: None,
                kernel: None,
                input_buffer_size: 0,
                n_output_vars: 0,
                n_variates: 0,
            });
            self.cur.id = self.records.len();
            fresh = true;
        } else {
            if id > self.records.len() {
                return Err(bad_id(format!(
                    "id ({id}) invalid, got 1...{}",
                    self.records.len()
                )));
            }
            let record = &mut self.records[id - 1];
            if record.disposed {
                return Err(bad_id(format!(
                    "id ({id}) was already disposed, it can not be used any more"
                )));
            }
            if record.n != n {
                return Err(bad_id(format!(
                    "size ({}) for id {id} does not match current size ({n})",
                    record.n
                )));
            }
            if version != record.version || (record.kernel.is_some() && record.fp != fp) {
                if record.kernel.is_some() {
                    debug!(
                        "id {id}: version {} -> {version}, releasing cached kernel and program",
                        record.version
                    );
                }
                record.version = version;
                record.fp = fp;
                record.kernel = None;
                record.program = None;
                record.n_output_vars = 0;
                record.n_variates = 0;
                fresh = true;
            }
            self.cur.id = id;
        }

        self.cur.settings = settings;
        self.cur.n_vars = 0;
        self.cur.input_offset.clear();
        self.cur.input_is_scalar.clear();
        self.cur.input_values = HostVec::new(fp);

        if fresh {
            self.cur.freed.clear();
            self.cur.outputs.clear();
            self.cur.n_variates = 0;
            self.cur.ssa.clear();
        } else {
            // the cached kernel signature baked in the variate layout
            self.cur.n_variates = self.records[self.cur.id - 1].n_variates;
        }

        self.state = ComputeState::CreateInput;
        Ok((self.cur.id, fresh))
    }

    /// Release the cached kernel and program of a calculation; the id
    /// can not be used again.
    pub fn dispose_calculation(&mut self, id: usize) -> Result<(), ComputeError> {
        if id == 0 || id > self.records.len() {
            return Err(bad_id(format!(
                "id ({id}) invalid, got 1...{}",
                self.records.len()
            )));
        }
        let record = &mut self.records[id - 1];
        if record.disposed {
            return Err(bad_id(format!("id {id} was already disposed")));
        }
        debug!("disposing calculation {id}, releasing its kernel and program");
        record.disposed = true;
        record.kernel = None;
        record.program = None;
        Ok(())
    }

    /// Add a scalar input; the value is broadcast over the batch.
    pub fn create_input_scalar(&mut self, value: f64) -> Result<usize, ComputeError> {
        self.require_state(&[ComputeState::CreateInput], "createInputVariable")?;
        Ok(self.push_input(true, &[value]))
    }

    /// Add a vector input of batch length.
    pub fn create_input_vector(&mut self, values: &[f64]) -> Result<usize, ComputeError> {
        self.require_state(&[ComputeState::CreateInput], "createInputVariable")?;
        let n = self.records[self.cur.id - 1].n;
        if values.len() != n {
            return Err(invalid_input(format!(
                "input vector length ({}) does not match batch size ({n})",
                values.len()
            )));
        }
        Ok(self.push_input(false, values))
    }

    fn push_input(&mut self, is_scalar: bool, values: &[f64]) -> usize {
        let next_offset = match self.cur.input_offset.last() {
            Some(&offset) => {
                let span = if *self.cur.input_is_scalar.last().unwrap() {
                    1
                } else {
                    self.records[self.cur.id - 1].n
                };
                offset + span
            }
            None => 0,
        };
        self.cur.input_offset.push(next_offset);
        self.cur.input_is_scalar.push(is_scalar);
        self.cur.input_values.extend(values);
        let id = self.cur.n_vars;
        self.cur.n_vars += 1;
        id
    }

    /// Draw `dim * steps` standard-normal variates from the shared
    /// pool, growing it if needed. Returns the ids as `[dim][steps]`.
    pub fn create_input_variates(
        &mut self,
        dim: usize,
        steps: usize,
    ) -> Result<Vec<Vec<usize>>, ComputeError> {
        self.require_state(
            &[ComputeState::CreateInput, ComputeState::CreateVariates],
            "createInputVariates",
        )?;
        self.require_no_kernel("createInputVariates")?;
        self.state = ComputeState::CreateVariates;

        let mut ids = vec![vec![0usize; steps]; dim];
        for j in 0..steps {
            for row in ids.iter_mut() {
                row[j] = self.cur.n_vars;
                self.cur.n_vars += 1;
            }
        }
        self.cur.n_variates += dim * steps;

        if self.cur.n_variates > 0 {
            let n = self.records[self.cur.id - 1].n;
            let fp = FpType::from_settings(self.cur.settings.use_double_precision);
            let Some(cl) = self.cl.as_ref() else {
                return Err(device_init("context not initialized; call init() first"));
            };
            self.pool.update(
                &cl.context,
                &cl.queue,
                fp,
                self.cur.settings.rng_seed,
                self.cur.n_variates * n,
            )?;
            debug_assert!(self.pool.size() >= self.cur.n_variates * n);
        }
        Ok(ids)
    }

    /// Stream one operation; returns the id of the result variable.
    pub fn apply_operation(
        &mut self,
        op: OpCode,
        args: &[usize],
    ) -> Result<usize, ComputeError> {
        self.require_state(
            &[
                ComputeState::CreateInput,
                ComputeState::CreateVariates,
                ComputeState::Calc,
            ],
            "applyOperation",
        )?;
        self.require_no_kernel("applyOperation")?;
        self.state = ComputeState::Calc;

        check_args(op, args, self.cur.n_vars)?;

        let (result_id, needs_declaration) = match self.cur.freed.pop() {
            Some(id) => (id, false),
            None => {
                let id = self.cur.n_vars;
                self.cur.n_vars += 1;
                (id, true)
            }
        };

        let n = self.records[self.cur.id - 1].n;
        let resolver = ArgResolver {
            n,
            input_offset: &self.cur.input_offset,
            input_is_scalar: &self.cur.input_is_scalar,
            n_variates: self.cur.n_variates,
        };
        let resolved: Vec<String> = args.iter().map(|&arg| resolver.resolve(arg)).collect();

        if let Some(rhs) = op.rhs(&resolved) {
            let fp = FpType::from_settings(self.cur.settings.use_double_precision);
            self.cur
                .ssa
                .push_str(&ssa_line(fp, result_id, needs_declaration, &rhs));
        }

        if self.cur.settings.debug {
            self.debug_info.number_of_operations += n as u64;
        }

        Ok(result_id)
    }

    /// Return an intermediate variable id for reuse by later
    /// operations. Inputs and variates are never freed.
    pub fn free_variable(&mut self, id: usize) -> Result<(), ComputeError> {
        self.require_state(&[ComputeState::Calc], "freeVariable")?;
        self.require_no_kernel("freeVariable")?;
        if id >= self.cur.n_vars {
            return Err(invalid_input(format!(
                "freeVariable: id {id} out of range (have {} variables)",
                self.cur.n_vars
            )));
        }
        if id < self.cur.n_inputs() + self.cur.n_variates {
            return Ok(());
        }
        self.cur.freed.push(id);
        Ok(())
    }

    /// Append a variable to the ordered output list.
    pub fn declare_output_variable(&mut self, id: usize) -> Result<(), ComputeError> {
        if self.state == ComputeState::Idle {
            return Err(bad_state(
                "declareOutputVariable: no calculation in progress",
            ));
        }
        self.require_no_kernel("declareOutputVariable")?;
        if id >= self.cur.n_vars {
            return Err(invalid_input(format!(
                "declareOutputVariable: id {id} out of range (have {} variables)",
                self.cur.n_vars
            )));
        }
        self.cur.outputs.push(id);
        self.records[self.cur.id - 1].n_output_vars += 1;
        Ok(())
    }

    /// Compile the kernel if not cached, run it and copy the declared
    /// outputs into `output`. The state returns to idle on every exit
    /// path, including failures.
    pub fn finalize_calculation(
        &mut self,
        output: &mut [&mut [f64]],
    ) -> Result<(), ComputeError> {
        let result = self.finalize_inner(output);
        self.state = ComputeState::Idle;
        result
    }

    fn finalize_inner(&mut self, output: &mut [&mut [f64]]) -> Result<(), ComputeError> {
        if self.state == ComputeState::Idle {
            return Err(bad_state("finalizeCalculation: no calculation in progress"));
        }
        let id = self.cur.id;
        let settings = self.cur.settings;
        let fp = FpType::from_settings(settings.use_double_precision);
        let debug_timers = settings.debug;

        if settings.use_double_precision && !self.supports_double_precision {
            return Err(capability_mismatch(
                "double precision is configured for this calculation, but not supported by the \
                 device; switch to single precision or use an appropriate device",
            ));
        }

        let n = self.records[id - 1].n;
        let n_output_vars = self.records[id - 1].n_output_vars;
        if output.len() != n_output_vars {
            return Err(output_arity(format!(
                "output size ({}) inconsistent to kernel output size ({n_output_vars})",
                output.len()
            )));
        }
        for (i, out) in output.iter().enumerate() {
            if out.len() != n {
                return Err(invalid_input(format!(
                    "output vector {i} has length {}, batch size is {n}",
                    out.len()
                )));
            }
        }

        let Some(cl) = self.cl.as_ref() else {
            return Err(device_init("context not initialized; call init() first"));
        };

        // input buffer is compacted: scalars take one slot, vectors n
        let input_buffer_size = match self.cur.input_offset.last() {
            Some(&offset) => {
                offset
                    + if *self.cur.input_is_scalar.last().unwrap() {
                        1
                    } else {
                        n
                    }
            }
            None => 0,
        };
        let output_buffer_size = n_output_vars * n;
        let has_variates = self.cur.n_variates > 0;

        let mut timer = Instant::now();
        let mut input_buffer = if input_buffer_size > 0 {
            Some(DeviceVec::create(&cl.context, fp, input_buffer_size)?)
        } else {
            None
        };
        let output_buffer = if output_buffer_size > 0 {
            Some(DeviceVec::create(&cl.context, fp, output_buffer_size)?)
        } else {
            None
        };
        if debug_timers {
            self.debug_info.nanos_data_copy += elapsed_nanos(timer);
        }

        // build phase, skipped when the kernel is cached
        if self.records[id - 1].kernel.is_none() {
            let resolver = ArgResolver {
                n,
                input_offset: &self.cur.input_offset,
                input_is_scalar: &self.cur.input_is_scalar,
                n_variates: self.cur.n_variates,
            };
            let mut output_block = String::new();
            for (slot, &var) in self.cur.outputs.iter().enumerate() {
                output_block.push_str(&source::output_line(slot, n, &resolver.resolve(var)));
            }
            let name = source::kernel_name(id, self.records[id - 1].version);
            let src = source::assemble_kernel(
                fp,
                &name,
                n,
                input_buffer_size > 0,
                has_variates,
                output_buffer_size > 0,
                &self.cur.ssa,
                &output_block,
            );
            debug!("building kernel {name}, {} bytes of source", src.len());

            timer = Instant::now();
            let program =
                Program::create_and_build_from_source(&cl.context, &src, "").map_err(|log| {
                    build_failed(format!(
                        "program build for kernel '{name}' failed: {}",
                        source::trim_build_log(&log)
                    ))
                })?;
            let kernel = Kernel::create(&program, &name)
                .map_err(|e| device_op(format!("creating kernel '{name}': {e}")))?;

            let record = &mut self.records[id - 1];
            record.program = Some(program);
            record.kernel = Some(kernel);
            record.input_buffer_size = input_buffer_size;
            record.n_variates = self.cur.n_variates;
            record.fp = fp;
            if debug_timers {
                self.debug_info.nanos_program_build += elapsed_nanos(timer);
            }
        } else if input_buffer_size != self.records[id - 1].input_buffer_size {
            return Err(bad_id(format!(
                "input buffer size ({input_buffer_size}) inconsistent to kernel input buffer \
                 size ({})",
                self.records[id - 1].input_buffer_size
            )));
        }

        // upload inputs asynchronously
        debug_assert_eq!(self.cur.input_values.len(), input_buffer_size);
        timer = Instant::now();
        let mut input_event = None;
        if let Some(buffer) = input_buffer.as_mut() {
            input_event = Some(buffer.enqueue_write(
                &cl.queue,
                &self.cur.input_values,
                CL_NON_BLOCKING,
                &[],
            )?);
        }
        if debug_timers {
            finish(&cl.queue)?;
            self.debug_info.nanos_data_copy += elapsed_nanos(timer);
        }

        // bind arguments in positional order (input, rn, output)
        let kernel = self.records[id - 1].kernel.as_ref().unwrap();
        let mut exec = ExecuteKernel::new(kernel);
        if let Some(buffer) = input_buffer.as_ref() {
            buffer.set_exec_arg(&mut exec);
        }
        if has_variates {
            let pool = self
                .pool
                .buffer()
                .ok_or_else(|| bad_state("variates pool is empty"))?;
            pool.set_exec_arg(&mut exec);
        }
        if let Some(buffer) = output_buffer.as_ref() {
            buffer.set_exec_arg(&mut exec);
        }
        exec.set_global_work_size(n);
        let run_wait: Vec<cl_event> = input_event.iter().map(|e| e.get()).collect();
        if !run_wait.is_empty() {
            exec.set_event_wait_list(&run_wait);
        }

        if debug_timers {
            finish(&cl.queue)?;
        }
        timer = Instant::now();
        let run_event = unsafe { exec.enqueue_nd_range(&cl.queue) }
            .map_err(|e| device_op(format!("enqueueing kernel: {e}")))?;
        if debug_timers {
            finish(&cl.queue)?;
            self.debug_info.nanos_calculation += elapsed_nanos(timer);
        }

        // read back one vector per output, all depending on the run
        timer = Instant::now();
        if let Some(out_buffer) = output_buffer.as_ref() {
            let read_wait = [run_event.get()];
            let mut read_events: Vec<Event> = Vec::with_capacity(output.len());
            match out_buffer {
                DeviceVec::Double(buffer) => {
                    for (i, out) in output.iter_mut().enumerate() {
                        let event = unsafe {
                            cl.queue.enqueue_read_buffer(
                                buffer,
                                CL_NON_BLOCKING,
                                i * n * fp.size(),
                                &mut out[..],
                                &read_wait,
                            )
                        }
                        .map_err(|e| device_op(format!("reading output vector {i}: {e}")))?;
                        read_events.push(event);
                    }
                    wait_all(&read_events)?;
                }
                DeviceVec::Single(buffer) => {
                    let mut staged = vec![vec![0.0f32; n]; output.len()];
                    for (i, host) in staged.iter_mut().enumerate() {
                        let event = unsafe {
                            cl.queue.enqueue_read_buffer(
                                buffer,
                                CL_NON_BLOCKING,
                                i * n * fp.size(),
                                &mut host[..],
                                &read_wait,
                            )
                        }
                        .map_err(|e| device_op(format!("reading output vector {i}: {e}")))?;
                        read_events.push(event);
                    }
                    wait_all(&read_events)?;
                    for (out, host) in output.iter_mut().zip(&staged) {
                        for (dst, &src) in out.iter_mut().zip(host) {
                            *dst = src as f64;
                        }
                    }
                }
            }
        }
        if debug_timers {
            finish(&cl.queue)?;
            self.debug_info.nanos_data_copy += elapsed_nanos(timer);
        }

        Ok(())
    }

    fn require_state(
        &self,
        allowed: &[ComputeState],
        call: &str,
    ) -> Result<(), ComputeError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(bad_state(format!(
                "{call}: not allowed in state {:?}",
                self.state
            )))
        }
    }

    fn require_no_kernel(&self, call: &str) -> Result<(), ComputeError> {
        let record = &self.records[self.cur.id - 1];
        if record.kernel.is_some() {
            Err(bad_state(format!(
                "{call}: id ({}) in version {} has a kernel already",
                self.cur.id, record.version
            )))
        } else {
            Ok(())
        }
    }

    fn run_device_probes(&mut self) {
        self.device_info.push((
            "host_sizeof(cl_uint)".to_string(),
            std::mem::size_of::<cl_uint>().to_string(),
        ));
        self.device_info.push((
            "host_sizeof(cl_ulong)".to_string(),
            std::mem::size_of::<cl_ulong>().to_string(),
        ));
        self.device_info.push((
            "host_sizeof(cl_float)".to_string(),
            std::mem::size_of::<cl_float>().to_string(),
        ));
        self.device_info.push((
            "host_sizeof(cl_double)".to_string(),
            std::mem::size_of::<cl_double>().to_string(),
        ));

        for ty in ["uint", "ulong", "float", "double"] {
            let value = match self.run_probe(&source::probe_source(ty), &source::probe_kernel_name(ty)) {
                Ok(size) => size.to_string(),
                // the probe result is diagnostic, a failure is recorded
                // rather than failing init
                Err(e) => e.info,
            };
            self.device_info.push((format!("device_sizeof({ty})"), value));
        }
    }

    fn run_probe(&self, src: &str, kernel_name: &str) -> Result<cl_ulong, ComputeError> {
        let cl = self.cl.as_ref().expect("probes run after init");
        let program = Program::create_and_build_from_source(&cl.context, src, "").map_err(
            |log| build_failed(source::trim_build_log(&log).to_string()),
        )?;
        let kernel = Kernel::create(&program, kernel_name)
            .map_err(|e| device_op(format!("creating probe kernel: {e}")))?;
        let result_buffer =
            unsafe { Buffer::<cl_ulong>::create(&cl.context, CL_MEM_READ_WRITE, 1, ptr::null_mut()) }
                .map_err(|e| device_op(format!("creating probe buffer: {e}")))?;

        let run_event = unsafe {
            ExecuteKernel::new(&kernel)
                .set_arg(&result_buffer)
                .set_global_work_size(1)
                .enqueue_nd_range(&cl.queue)
        }
        .map_err(|e| device_op(format!("running probe kernel: {e}")))?;

        let mut result = [0 as cl_ulong; 1];
        unsafe {
            cl.queue.enqueue_read_buffer(
                &result_buffer,
                CL_BLOCKING,
                0,
                &mut result,
                &[run_event.get()],
            )
        }
        .map_err(|e| device_op(format!("reading probe result: {e}")))?;
        Ok(result[0])
    }
}

#[inline]
fn elapsed_nanos(since: Instant) -> u64 {
    since.elapsed().as_nanos() as u64
}

fn finish(queue: &CommandQueue) -> Result<(), ComputeError> {
    queue
        .finish()
        .map_err(|e| device_op(format!("flushing command queue: {e}")))
}

fn wait_all(events: &[Event]) -> Result<(), ComputeError> {
    for event in events {
        event
            .wait()
            .map_err(|e| device_op(format!("waiting for output readback: {e}")))?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ErrorKind;

    fn open(ctx: &mut ClContext, n: usize) -> usize {
        let (id, fresh) = ctx
            .initiate_calculation(n, 0, 0, Settings::default())
            .unwrap();
        assert!(fresh);
        id
    }

    #[test]
    fn calls_outside_the_protocol_are_rejected() {
        let mut ctx = ClContext::detached();

        let err = ctx.apply_operation(OpCode::Add, &[0, 1]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadState);
        let err = ctx.create_input_scalar(1.0).unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadState);
        let err = ctx.declare_output_variable(0).unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadState);
        let err = ctx.finalize_calculation(&mut []).unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadState);

        open(&mut ctx, 4);
        // inputs can not be created once an operation was applied
        let a = ctx.create_input_scalar(1.0).unwrap();
        ctx.apply_operation(OpCode::Neg, &[a]).unwrap();
        let err = ctx.create_input_scalar(2.0).unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadState);
        // free is only allowed in the calc state, which we are in now
        assert!(ctx.free_variable(a).is_ok());
        // a second initiate needs an intervening finalize
        let err = ctx
            .initiate_calculation(4, 0, 0, Settings::default())
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadState);
    }

    #[test]
    fn input_offsets_are_compacted() {
        let mut ctx = ClContext::detached();
        open(&mut ctx, 8);
        let a = ctx.create_input_scalar(1.0).unwrap();
        let b = ctx.create_input_vector(&[0.0; 8]).unwrap();
        let c = ctx.create_input_scalar(2.0).unwrap();
        let d = ctx.create_input_vector(&[1.0; 8]).unwrap();
        assert_eq!((a, b, c, d), (0, 1, 2, 3));
        assert_eq!(ctx.cur.input_offset, vec![0, 1, 9, 10]);
        // offsets advance by 1 for scalars and n for vectors
        for k in 0..3 {
            let step = ctx.cur.input_offset[k + 1] - ctx.cur.input_offset[k];
            assert!(step == 1 || step == 8);
        }
        assert_eq!(ctx.cur.input_values.len(), 18);
    }

    #[test]
    fn input_vector_length_must_match_batch_size() {
        let mut ctx = ClContext::detached();
        open(&mut ctx, 8);
        let err = ctx.create_input_vector(&[0.0; 7]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidInput);
    }

    #[test]
    fn variable_ids_are_dense_and_freed_ids_are_reused() {
        let mut ctx = ClContext::detached();
        open(&mut ctx, 4);
        let a = ctx.create_input_scalar(1.0).unwrap();
        let b = ctx.create_input_scalar(2.0).unwrap();
        assert_eq!((a, b), (0, 1));

        let t = ctx.apply_operation(OpCode::Add, &[a, b]).unwrap();
        let u = ctx.apply_operation(OpCode::Mul, &[t, b]).unwrap();
        assert_eq!((t, u), (2, 3));

        // freeing an input is a no-op; its id is never recycled
        ctx.free_variable(a).unwrap();
        let v = ctx.apply_operation(OpCode::Neg, &[u]).unwrap();
        assert_eq!(v, 4);

        // freeing an intermediate recycles its id
        ctx.free_variable(t).unwrap();
        let w = ctx.apply_operation(OpCode::Neg, &[u]).unwrap();
        assert_eq!(w, t);
    }

    #[test]
    fn recycled_ids_are_not_redeclared() {
        let mut ctx = ClContext::detached();
        open(&mut ctx, 4);
        let a = ctx.create_input_scalar(1.0).unwrap();
        let t = ctx.apply_operation(OpCode::Neg, &[a]).unwrap();
        ctx.free_variable(t).unwrap();
        let u = ctx.apply_operation(OpCode::Neg, &[a]).unwrap();
        assert_eq!(t, u);
        let declared = format!("float v{t} = ");
        let redeclared = format!("  v{t} = ");
        assert_eq!(ctx.cur.ssa.matches(&declared).count(), 1);
        assert_eq!(ctx.cur.ssa.matches(redeclared.as_str()).count(), 1);
    }

    #[test]
    fn zero_dimensional_variates_do_not_touch_the_pool() {
        let mut ctx = ClContext::detached();
        open(&mut ctx, 4);
        // no device is attached, so this would fail if the pool were hit
        let ids = ctx.create_input_variates(0, 0).unwrap();
        assert!(ids.is_empty());
        assert_eq!(ctx.pool.size(), 0);
        // requesting actual variates without a device errors instead
        let err = ctx.create_input_variates(1, 1).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DeviceInit);
    }

    #[test]
    fn initiate_validates_the_id() {
        let mut ctx = ClContext::detached();
        let id = open(&mut ctx, 4);
        ctx.finalize_calculation(&mut []).ok();

        let err = ctx
            .initiate_calculation(4, 99, 0, Settings::default())
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadId);

        let err = ctx
            .initiate_calculation(5, id, 0, Settings::default())
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadId);

        let (again, fresh) = ctx
            .initiate_calculation(4, id, 0, Settings::default())
            .unwrap();
        assert_eq!(again, id);
        assert!(!fresh);
        ctx.finalize_calculation(&mut []).ok();

        // bumping the version reports the calculation fresh again
        let (_, fresh) = ctx
            .initiate_calculation(4, id, 1, Settings::default())
            .unwrap();
        assert!(fresh);
    }

    #[test]
    fn disposal_is_terminal() {
        let mut ctx = ClContext::detached();
        let id = open(&mut ctx, 4);
        ctx.finalize_calculation(&mut []).ok();

        ctx.dispose_calculation(id).unwrap();
        let err = ctx.dispose_calculation(id).unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadId);

        let err = ctx
            .initiate_calculation(4, id, 0, Settings::default())
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadId);

        let err = ctx.dispose_calculation(0).unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadId);
    }

    #[test]
    fn finalize_restores_idle_on_failure() {
        let mut ctx = ClContext::detached();
        open(&mut ctx, 4);
        let a = ctx.create_input_scalar(1.0).unwrap();
        ctx.declare_output_variable(a).unwrap();
        // wrong arity fails, but the state must be idle afterwards
        let err = ctx.finalize_calculation(&mut []).unwrap_err();
        assert_eq!(err.kind, ErrorKind::OutputArity);
        assert_eq!(ctx.state, ComputeState::Idle);
        // a new calculation can be initiated immediately
        assert!(ctx
            .initiate_calculation(4, 0, 0, Settings::default())
            .is_ok());
    }

    #[test]
    fn operation_counter_scales_with_batch_size() {
        let mut ctx = ClContext::detached();
        let settings = Settings {
            debug: true,
            ..Settings::default()
        };
        ctx.initiate_calculation(100, 0, 0, settings).unwrap();
        let a = ctx.create_input_scalar(1.0).unwrap();
        ctx.apply_operation(OpCode::Neg, &[a]).unwrap();
        ctx.apply_operation(OpCode::Exp, &[1]).unwrap();
        assert_eq!(ctx.debug_info().number_of_operations, 200);
    }

    #[test]
    fn operations_validate_their_arguments() {
        let mut ctx = ClContext::detached();
        open(&mut ctx, 4);
        let a = ctx.create_input_scalar(1.0).unwrap();
        let err = ctx.apply_operation(OpCode::Add, &[a]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidInput);
        let err = ctx.apply_operation(OpCode::Add, &[a, 7]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidInput);
    }

    #[test]
    fn double_precision_needs_device_support() {
        let mut ctx = ClContext::detached();
        ctx.supports_double_precision = false;
        let settings = Settings {
            use_double_precision: true,
            ..Settings::default()
        };
        ctx.initiate_calculation(4, 0, 0, settings).unwrap();
        let a = ctx.create_input_scalar(1.0).unwrap();
        ctx.declare_output_variable(a).unwrap();
        let mut out = vec![0.0f64; 4];
        let err = ctx
            .finalize_calculation(&mut [&mut out[..]])
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::CapabilityMismatch);
    }

    // Tests below need a physical OpenCL device; they return early when
    // none is registered so the suite passes on bare machines.
    mod device {
        use super::super::*;
        use crate::ClRegistry;

        fn with_device(f: impl FnOnce(&mut ClContext)) {
            let mut registry = ClRegistry::new();
            let names = registry.device_names();
            let Some(name) = names.first() else { return };
            let ctx = registry.context(name).unwrap();
            if ctx.init_with_retry(1, Duration::ZERO).is_err() {
                return;
            }
            f(ctx);
        }

        #[test]
        fn probes_record_device_type_sizes() {
            with_device(|ctx| {
                let info = ctx.device_info();
                let value = |key: &str| {
                    info.iter()
                        .find(|(k, _)| k == key)
                        .map(|(_, v)| v.as_str())
                        .unwrap()
                };
                assert_eq!(value("host_sizeof(cl_uint)"), "4");
                assert_eq!(value("host_sizeof(cl_ulong)"), "8");
                assert_eq!(value("device_sizeof(uint)"), "4");
                assert_eq!(value("device_sizeof(float)"), "4");
                assert!(info.iter().any(|(k, _)| k == "device_name"));
            });
        }

        #[test]
        fn init_is_idempotent() {
            with_device(|ctx| {
                let probes = ctx.device_info().len();
                ctx.init().unwrap();
                assert_eq!(ctx.device_info().len(), probes);
            });
        }

        #[test]
        fn scalar_arithmetic_with_kernel_reuse_and_version_bump() {
            with_device(|ctx| {
                let settings = Settings {
                    debug: true,
                    ..Settings::default()
                };

                let (id, fresh) = ctx.initiate_calculation(4, 0, 0, settings).unwrap();
                assert!(fresh);
                let a = ctx.create_input_scalar(3.0).unwrap();
                let b = ctx.create_input_vector(&[1.0, 2.0, 3.0, 4.0]).unwrap();
                let t = ctx.apply_operation(OpCode::Mul, &[a, b]).unwrap();
                let y = ctx.apply_operation(OpCode::Add, &[t, a]).unwrap();
                ctx.declare_output_variable(y).unwrap();
                let mut out = vec![0.0f64; 4];
                ctx.finalize_calculation(&mut [&mut out[..]]).unwrap();
                assert_eq!(out, [6.0, 9.0, 12.0, 15.0]);
                let build_nanos = ctx.debug_info().nanos_program_build;
                assert!(build_nanos > 0);

                // same identity: the cached kernel is reused, only the
                // inputs are re-supplied
                let (id2, fresh) = ctx.initiate_calculation(4, id, 0, settings).unwrap();
                assert_eq!(id2, id);
                assert!(!fresh);
                ctx.create_input_scalar(3.0).unwrap();
                ctx.create_input_vector(&[1.0, 2.0, 3.0, 4.0]).unwrap();
                let mut out = vec![0.0f64; 4];
                ctx.finalize_calculation(&mut [&mut out[..]]).unwrap();
                assert_eq!(out, [6.0, 9.0, 12.0, 15.0]);
                assert_eq!(ctx.debug_info().nanos_program_build, build_nanos);

                // version bump: rebuild with the new dataflow
                let (_, fresh) = ctx.initiate_calculation(4, id, 1, settings).unwrap();
                assert!(fresh);
                let a = ctx.create_input_scalar(3.0).unwrap();
                let b = ctx.create_input_vector(&[1.0, 2.0, 3.0, 4.0]).unwrap();
                let t = ctx.apply_operation(OpCode::Add, &[a, b]).unwrap();
                ctx.declare_output_variable(t).unwrap();
                let mut out = vec![0.0f64; 4];
                ctx.finalize_calculation(&mut [&mut out[..]]).unwrap();
                assert_eq!(out, [4.0, 5.0, 6.0, 7.0]);
                assert!(ctx.debug_info().nanos_program_build > build_nanos);
            });
        }

        #[test]
        fn variate_sample_moments() {
            with_device(|ctx| {
                let settings = Settings {
                    rng_seed: 42,
                    ..Settings::default()
                };
                ctx.initiate_calculation(1000, 0, 0, settings).unwrap();
                let ids = ctx.create_input_variates(1, 1).unwrap();
                ctx.declare_output_variable(ids[0][0]).unwrap();
                let mut out = vec![0.0f64; 1000];
                ctx.finalize_calculation(&mut [&mut out[..]]).unwrap();

                let mean = out.iter().sum::<f64>() / out.len() as f64;
                let variance = out.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>()
                    / (out.len() - 1) as f64;
                assert!(mean.abs() < 0.1, "sample mean {mean}");
                assert!(
                    (0.9..1.1).contains(&variance),
                    "sample variance {variance}"
                );
            });
        }

        #[test]
        fn pool_growth_preserves_existing_samples() {
            with_device(|ctx| {
                let settings = Settings::default();
                ctx.initiate_calculation(200, 0, 0, settings).unwrap();
                let ids = ctx.create_input_variates(1, 2).unwrap();
                ctx.declare_output_variable(ids[0][0]).unwrap();
                ctx.declare_output_variable(ids[0][1]).unwrap();
                let mut v0 = vec![0.0f64; 200];
                let mut v1 = vec![0.0f64; 200];
                ctx.finalize_calculation(&mut [&mut v0[..], &mut v1[..]])
                    .unwrap();

                // a larger calculation grows the pool; the first two
                // variate slots must be preserved bitwise
                ctx.initiate_calculation(200, 0, 0, settings).unwrap();
                let ids = ctx.create_input_variates(1, 5).unwrap();
                ctx.declare_output_variable(ids[0][0]).unwrap();
                ctx.declare_output_variable(ids[0][1]).unwrap();
                let mut w0 = vec![0.0f64; 200];
                let mut w1 = vec![0.0f64; 200];
                ctx.finalize_calculation(&mut [&mut w0[..], &mut w1[..]])
                    .unwrap();
                assert_eq!(v0, w0);
                assert_eq!(v1, w1);
            });
        }

        #[test]
        fn fixed_seed_is_deterministic() {
            let run = || -> Option<Vec<f64>> {
                let mut registry = ClRegistry::new();
                let names = registry.device_names();
                let name = names.first()?;
                let ctx = registry.context(name).unwrap();
                ctx.init_with_retry(1, Duration::ZERO).ok()?;
                let settings = Settings {
                    rng_seed: 7,
                    ..Settings::default()
                };
                ctx.initiate_calculation(64, 0, 0, settings).unwrap();
                let ids = ctx.create_input_variates(2, 3).unwrap();
                ctx.declare_output_variable(ids[1][2]).unwrap();
                let mut out = vec![0.0f64; 64];
                ctx.finalize_calculation(&mut [&mut out[..]]).unwrap();
                Some(out)
            };
            if let (Some(first), Some(second)) = (run(), run()) {
                assert_eq!(first, second);
            }
        }

        #[test]
        fn indicator_equality_tolerance() {
            with_device(|ctx| {
                if !ctx.supports_double_precision() {
                    return;
                }
                let settings = Settings {
                    use_double_precision: true,
                    ..Settings::default()
                };
                ctx.initiate_calculation(3, 0, 0, settings).unwrap();
                let x = ctx
                    .create_input_vector(&[1.0, 1.0 + 1e-20, 1.000001])
                    .unwrap();
                let y = ctx.create_input_scalar(1.0).unwrap();
                let eq = ctx.apply_operation(OpCode::IndicatorEq, &[x, y]).unwrap();
                ctx.declare_output_variable(eq).unwrap();
                let mut out = vec![0.0f64; 3];
                ctx.finalize_calculation(&mut [&mut out[..]]).unwrap();
                assert_eq!(out, [1.0, 1.0, 0.0]);
            });
        }

        #[test]
        fn indicator_laws() {
            with_device(|ctx| {
                ctx.initiate_calculation(4, 0, 0, Settings::default())
                    .unwrap();
                let x = ctx.create_input_vector(&[1.0, 2.0, 2.0, 5.0]).unwrap();
                let y = ctx.create_input_vector(&[2.0, 2.0, 1.0, -5.0]).unwrap();
                let eq = ctx.apply_operation(OpCode::IndicatorEq, &[x, y]).unwrap();
                let gt = ctx.apply_operation(OpCode::IndicatorGt, &[x, y]).unwrap();
                let geq = ctx.apply_operation(OpCode::IndicatorGeq, &[x, y]).unwrap();
                let self_eq = ctx.apply_operation(OpCode::IndicatorEq, &[x, x]).unwrap();
                for id in [eq, gt, geq, self_eq] {
                    ctx.declare_output_variable(id).unwrap();
                }
                let mut eq_v = vec![0.0f64; 4];
                let mut gt_v = vec![0.0f64; 4];
                let mut geq_v = vec![0.0f64; 4];
                let mut self_eq_v = vec![0.0f64; 4];
                ctx.finalize_calculation(&mut [
                    &mut eq_v[..],
                    &mut gt_v[..],
                    &mut geq_v[..],
                    &mut self_eq_v[..],
                ])
                .unwrap();

                for i in 0..4 {
                    for v in [eq_v[i], gt_v[i], geq_v[i]] {
                        assert!(v == 0.0 || v == 1.0);
                    }
                    assert_eq!(geq_v[i], gt_v[i] + eq_v[i]);
                    assert_eq!(self_eq_v[i], 1.0);
                }
                assert_eq!(eq_v, [0.0, 1.0, 0.0, 0.0]);
                assert_eq!(gt_v, [0.0, 0.0, 1.0, 1.0]);
            });
        }

        #[test]
        fn algebraic_laws_on_exact_integers() {
            use rand::{rngs::StdRng, Rng, SeedableRng};

            with_device(|ctx| {
                let n = 16;
                let mut rng = StdRng::seed_from_u64(1);
                let xs: Vec<f64> = (0..n).map(|_| rng.gen_range(-100..100) as f64).collect();
                let ys: Vec<f64> = (0..n).map(|_| rng.gen_range(-100..100) as f64).collect();

                ctx.initiate_calculation(n, 0, 0, Settings::default())
                    .unwrap();
                let x = ctx.create_input_vector(&xs).unwrap();
                let y = ctx.create_input_vector(&ys).unwrap();
                let xy = ctx.apply_operation(OpCode::Mul, &[x, y]).unwrap();
                let yx = ctx.apply_operation(OpCode::Mul, &[y, x]).unwrap();
                let xpy = ctx.apply_operation(OpCode::Add, &[x, y]).unwrap();
                let ypx = ctx.apply_operation(OpCode::Add, &[y, x]).unwrap();
                let neg = ctx.apply_operation(OpCode::Neg, &[x]).unwrap();
                let negneg = ctx.apply_operation(OpCode::Neg, &[neg]).unwrap();
                for id in [xy, yx, xpy, ypx, negneg] {
                    ctx.declare_output_variable(id).unwrap();
                }
                let mut outs: Vec<Vec<f64>> = vec![vec![0.0; n]; 5];
                {
                    let mut slices: Vec<&mut [f64]> =
                        outs.iter_mut().map(|v| &mut v[..]).collect();
                    ctx.finalize_calculation(&mut slices).unwrap();
                }
                assert_eq!(outs[0], outs[1]);
                assert_eq!(outs[2], outs[3]);
                assert_eq!(outs[4], xs);
            });
        }

        #[test]
        fn single_precision_clamps_inputs() {
            with_device(|ctx| {
                ctx.initiate_calculation(2, 0, 0, Settings::default())
                    .unwrap();
                let a = ctx.create_input_vector(&[1.0e300, -1.0e300]).unwrap();
                ctx.declare_output_variable(a).unwrap();
                let mut out = vec![0.0f64; 2];
                ctx.finalize_calculation(&mut [&mut out[..]]).unwrap();
                assert!(out.iter().all(|v| v.is_finite()));
                assert_eq!(out[0], f32::MAX as f64);
                assert_eq!(out[1], -(f32::MAX as f64));
            });
        }

        #[test]
        fn replaying_the_same_stream_is_reproducible() {
            with_device(|ctx| {
                let run = |ctx: &mut ClContext| -> Vec<f64> {
                    ctx.initiate_calculation(8, 0, 0, Settings::default())
                        .unwrap();
                    let a = ctx.create_input_scalar(2.5).unwrap();
                    let b = ctx
                        .create_input_vector(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0])
                        .unwrap();
                    let t = ctx.apply_operation(OpCode::Mul, &[a, b]).unwrap();
                    let u = ctx.apply_operation(OpCode::Sqrt, &[t]).unwrap();
                    let v = ctx.apply_operation(OpCode::Log, &[u]).unwrap();
                    ctx.declare_output_variable(v).unwrap();
                    let mut out = vec![0.0f64; 8];
                    ctx.finalize_calculation(&mut [&mut out[..]]).unwrap();
                    out
                };
                let first = run(ctx);
                let second = run(ctx);
                assert_eq!(first, second);
            });
        }
    }
}
