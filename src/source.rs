//! Generated device source.
//!
//! Everything the engine emits that is not a client value carries the
//! reserved `clc_` prefix: helper functions, probe kernels, the variate
//! program and the kernel entry points. Client-addressable values only
//! appear as `v<id>` (decimal id) or as `input`/`rn`/`output` buffer
//! reads, so generated identifiers cannot collide.
//!
//! The sources are parameterised by [`FpType`] because the literal
//! suffix (`1.0f` vs `1.0`) has to change together with the type name.

use crate::buffers::FpType;

/// Upper bound on the build-log excerpt carried in a `BuildFailed`
/// error. The head of the log names the first diagnostic, which is the
/// actionable one; everything past the bound is dropped.
pub(crate) const MAX_BUILD_LOG: usize = 65536;

/// Mersenne-Twister state size; the variate pool grows in blocks of
/// this many samples.
pub(crate) const MT_N: usize = 624;

pub(crate) fn trim_build_log(log: &str) -> &str {
    match log.char_indices().nth(MAX_BUILD_LOG) {
        Some((byte, _)) => &log[..byte],
        None => log,
    }
}

pub(crate) fn kernel_name(id: usize, version: usize) -> String {
    format!("clc_kernel_{id}_{version}")
}

/// Comparison helpers shared by every generated kernel.
///
/// `clc_closeEnough` uses a tolerance of 42 machine epsilons, relative
/// to the larger operand and squared when either operand is exactly
/// zero.
pub(crate) fn helper_prelude(fp: FpType) -> String {
    let t = fp.type_name();
    let s = fp.suffix();
    let eps = fp.eps_literal();
    format!(
        "bool clc_closeEnough(const {t} x, const {t} y) {{\n\
         \x20   const {t} tol = 42.0{s} * {eps};\n\
         \x20   {t} diff = fabs(x - y);\n\
         \x20   if (x == 0.0{s} || y == 0.0{s})\n\
         \x20       return diff < tol * tol;\n\
         \x20   return diff <= tol * fabs(x) || diff <= tol * fabs(y);\n\
         }}\n\
         \n\
         {t} clc_indicatorEq(const {t} x, const {t} y) {{ return clc_closeEnough(x, y) ? 1.0{s} : 0.0{s}; }}\n\
         \n\
         {t} clc_indicatorGt(const {t} x, const {t} y) {{ return x > y && !clc_closeEnough(x, y); }}\n\
         \n\
         {t} clc_indicatorGeq(const {t} x, const {t} y) {{ return x > y || clc_closeEnough(x, y); }}\n\
         \n"
    )
}

/// Assemble the per-calculation kernel from the accumulated SSA body and
/// the output assignment block. Buffers that are empty for this
/// calculation are left out of the signature.
pub(crate) fn assemble_kernel(
    fp: FpType,
    name: &str,
    n: usize,
    has_input: bool,
    has_variates: bool,
    has_output: bool,
    ssa_body: &str,
    output_block: &str,
) -> String {
    let t = fp.type_name();
    let mut args = Vec::new();
    if has_input {
        args.push(format!("__global {t}* input"));
    }
    if has_variates {
        args.push(format!("__global {t}* rn"));
    }
    if has_output {
        args.push(format!("__global {t}* output"));
    }

    let mut source = helper_prelude(fp);
    source.push_str(&format!(
        "__kernel void {name}({}) {{\n\
         unsigned int i = get_global_id(0);\n\
         if (i < {n}U) {{\n",
        args.join(",")
    ));
    source.push_str(ssa_body);
    source.push_str(output_block);
    source.push_str("  }\n}\n");
    source
}

/// One line of the output assignment block.
pub(crate) fn output_line(slot: usize, n: usize, value_expr: &str) -> String {
    format!("  output[{}UL + i] = {value_expr};\n", slot * n)
}

/// The variate program: inverse normal CDF plus the three
/// Mersenne-Twister kernels (`clc_seedInitialization`, `clc_twist`,
/// `clc_generate`).
pub(crate) fn variate_program(fp: FpType) -> String {
    let mut source = inv_cum_n(fp);
    source.push_str(SEED_INIT_SOURCE);
    source.push_str(TWIST_SOURCE);
    source.push_str(&generate_source(fp));
    source
}

/// Rational approximation of the inverse cumulative normal, with
/// breakpoints at `x_low = 0.02425` and `1 - x_low` and saturation of
/// the exact integer bounds of the 32-bit uniform to the largest finite
/// value of the active precision.
fn inv_cum_n(fp: FpType) -> String {
    let t = fp.type_name();
    let s = fp.suffix();
    let max = fp.max_literal();
    format!(
        "{t} clc_invCumN(const uint x0) {{\n\
         \x20   const {t} a1_ = -3.969683028665376e+01{s};\n\
         \x20   const {t} a2_ = 2.209460984245205e+02{s};\n\
         \x20   const {t} a3_ = -2.759285104469687e+02{s};\n\
         \x20   const {t} a4_ = 1.383577518672690e+02{s};\n\
         \x20   const {t} a5_ = -3.066479806614716e+01{s};\n\
         \x20   const {t} a6_ = 2.506628277459239e+00{s};\n\
         \x20   const {t} b1_ = -5.447609879822406e+01{s};\n\
         \x20   const {t} b2_ = 1.615858368580409e+02{s};\n\
         \x20   const {t} b3_ = -1.556989798598866e+02{s};\n\
         \x20   const {t} b4_ = 6.680131188771972e+01{s};\n\
         \x20   const {t} b5_ = -1.328068155288572e+01{s};\n\
         \x20   const {t} c1_ = -7.784894002430293e-03{s};\n\
         \x20   const {t} c2_ = -3.223964580411365e-01{s};\n\
         \x20   const {t} c3_ = -2.400758277161838e+00{s};\n\
         \x20   const {t} c4_ = -2.549732539343734e+00{s};\n\
         \x20   const {t} c5_ = 4.374664141464968e+00{s};\n\
         \x20   const {t} c6_ = 2.938163982698783e+00{s};\n\
         \x20   const {t} d1_ = 7.784695709041462e-03{s};\n\
         \x20   const {t} d2_ = 3.224671290700398e-01{s};\n\
         \x20   const {t} d3_ = 2.445134137142996e+00{s};\n\
         \x20   const {t} d4_ = 3.754408661907416e+00{s};\n\
         \x20   const {t} x_low_ = 0.02425{s};\n\
         \x20   const {t} x_high_ = 1.0{s} - x_low_;\n\
         \x20   const {t} x = x0 / ({t})UINT_MAX;\n\
         \x20   if (x < x_low_ || x_high_ < x) {{\n\
         \x20       if (x0 == UINT_MAX) {{\n\
         \x20         return {max};\n\
         \x20       }} else if (x0 == 0) {{\n\
         \x20         return -{max};\n\
         \x20       }}\n\
         \x20       {t} z;\n\
         \x20       if (x < x_low_) {{\n\
         \x20           z = sqrt(-2.0{s} * log(x));\n\
         \x20           z = (((((c1_ * z + c2_) * z + c3_) * z + c4_) * z + c5_) * z + c6_) /\n\
         \x20               ((((d1_ * z + d2_) * z + d3_) * z + d4_) * z + 1.0{s});\n\
         \x20       }} else {{\n\
         \x20           z = sqrt(-2.0{s} * log(1.0{s} - x));\n\
         \x20           z = -(((((c1_ * z + c2_) * z + c3_) * z + c4_) * z + c5_) * z + c6_) /\n\
         \x20               ((((d1_ * z + d2_) * z + d3_) * z + d4_) * z + 1.0{s});\n\
         \x20       }}\n\
         \x20       return z;\n\
         \x20   }} else {{\n\
         \x20       {t} z = x - 0.5{s};\n\
         \x20       {t} r = z * z;\n\
         \x20       z = (((((a1_ * r + a2_) * r + a3_) * r + a4_) * r + a5_) * r + a6_) * z /\n\
         \x20           (((((b1_ * r + b2_) * r + b3_) * r + b4_) * r + b5_) * r + 1.0{s});\n\
         \x20       return z;\n\
         \x20   }}\n\
         }}\n\
         \n"
    )
}

const SEED_INIT_SOURCE: &str = "\
__kernel void clc_seedInitialization(const ulong s, __global ulong* mt) {
  const ulong N = 624;
  mt[0] = s & 0xffffffffU;
  for (ulong mti = 1; mti < N; ++mti) {
    mt[mti] = (1812433253UL * (mt[mti-1] ^ (mt[mti-1] >> 30)) + mti);
    mt[mti] &= 0xffffffffUL;
  }
}

";

const TWIST_SOURCE: &str = "\
__kernel void clc_twist(__global ulong* mt) {
  const ulong N = 624;
  const ulong M = 397;
  const ulong MATRIX_A = 0x9908b0dfUL;
  const ulong UPPER_MASK = 0x80000000UL;
  const ulong LOWER_MASK = 0x7fffffffUL;
  const ulong mag01[2] = {0x0UL, MATRIX_A};
  ulong kk;
  ulong y;
  for (kk = 0; kk < N-M; ++kk) {
    y = (mt[kk]&UPPER_MASK)|(mt[kk+1]&LOWER_MASK);
    mt[kk] = mt[kk+M] ^ (y >> 1) ^ mag01[y & 0x1UL];
  }
  for (; kk < N-1; ++kk) {
    y = (mt[kk]&UPPER_MASK)|(mt[kk+1]&LOWER_MASK);
    mt[kk] = mt[(kk+M)-N] ^ (y >> 1) ^ mag01[y & 0x1UL];
  }
  y = (mt[N-1]&UPPER_MASK)|(mt[0]&LOWER_MASK);
  mt[N-1] = mt[M-1] ^ (y >> 1) ^ mag01[y & 0x1UL];
}

";

fn generate_source(fp: FpType) -> String {
    let t = fp.type_name();
    format!(
        "__kernel void clc_generate(const ulong offset, __global ulong* mt, __global {t}* output) {{\n\
         \x20 ulong mti = get_global_id(0);\n\
         \x20 ulong y = mt[mti];\n\
         \x20 y ^= (y >> 11);\n\
         \x20 y ^= (y << 7) & 0x9d2c5680U;\n\
         \x20 y ^= (y << 15) & 0xefc60000U;\n\
         \x20 y ^= (y >> 18);\n\
         \x20 output[offset + mti] = clc_invCumN((uint)y);\n\
         }}\n\
         \n"
    )
}

/// Probe kernel writing `sizeof(<ty>)` into a one-element `ulong`
/// buffer; used by the init-time device checks.
pub(crate) fn probe_source(ty: &str) -> String {
    format!("__kernel void clc_get_{ty}_size(__global ulong* result) {{ result[0] = sizeof({ty}); }}")
}

pub(crate) fn probe_kernel_name(ty: &str) -> String {
    format!("clc_get_{ty}_size")
}
