//! Opcode enumeration and the pure SSA emitter.
//!
//! The emitter is a translation table from `(opcode, resolved args)` to
//! the right-hand side of one single-assignment source line. It holds no
//! state; the context owns the accumulated kernel body.

use crate::buffers::FpType;
use crate::error::functions::{invalid_input, unknown_opcode};
use crate::ComputeError;

/// Elementary operations over vector-valued variables.
///
/// The discriminants form the stable integer encoding shared with
/// clients; new opcodes are only ever appended.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(usize)]
pub enum OpCode {
    /// Reserved; allocates a result id but emits no assignment.
    None = 0,
    Add,
    Sub,
    Neg,
    Mul,
    Div,
    IndicatorEq,
    IndicatorGt,
    IndicatorGeq,
    Min,
    Max,
    Abs,
    Exp,
    Sqrt,
    Log,
    Pow,
}

impl OpCode {
    const ALL: [OpCode; 16] = [
        OpCode::None,
        OpCode::Add,
        OpCode::Sub,
        OpCode::Neg,
        OpCode::Mul,
        OpCode::Div,
        OpCode::IndicatorEq,
        OpCode::IndicatorGt,
        OpCode::IndicatorGeq,
        OpCode::Min,
        OpCode::Max,
        OpCode::Abs,
        OpCode::Exp,
        OpCode::Sqrt,
        OpCode::Log,
        OpCode::Pow,
    ];

    pub fn label(self) -> &'static str {
        match self {
            OpCode::None => "None",
            OpCode::Add => "Add",
            OpCode::Sub => "Sub",
            OpCode::Neg => "Neg",
            OpCode::Mul => "Mul",
            OpCode::Div => "Div",
            OpCode::IndicatorEq => "IndicatorEq",
            OpCode::IndicatorGt => "IndicatorGt",
            OpCode::IndicatorGeq => "IndicatorGeq",
            OpCode::Min => "Min",
            OpCode::Max => "Max",
            OpCode::Abs => "Abs",
            OpCode::Exp => "Exp",
            OpCode::Sqrt => "Sqrt",
            OpCode::Log => "Log",
            OpCode::Pow => "Pow",
        }
    }

    /// Number of argument variables the opcode consumes.
    pub fn arity(self) -> usize {
        match self {
            OpCode::None => 0,
            OpCode::Neg | OpCode::Abs | OpCode::Exp | OpCode::Sqrt | OpCode::Log => 1,
            _ => 2,
        }
    }

    /// Right-hand side of the SSA line, or `None` for the reserved
    /// opcode.
    pub(crate) fn rhs(self, a: &[String]) -> Option<String> {
        let rhs = match self {
            OpCode::None => return Option::None,
            OpCode::Add => format!("{} + {}", a[0], a[1]),
            OpCode::Sub => format!("{} - {}", a[0], a[1]),
            OpCode::Neg => format!("-{}", a[0]),
            OpCode::Mul => format!("{} * {}", a[0], a[1]),
            OpCode::Div => format!("{} / {}", a[0], a[1]),
            OpCode::IndicatorEq => format!("clc_indicatorEq({},{})", a[0], a[1]),
            OpCode::IndicatorGt => format!("clc_indicatorGt({},{})", a[0], a[1]),
            OpCode::IndicatorGeq => format!("clc_indicatorGeq({},{})", a[0], a[1]),
            OpCode::Min => format!("fmin({},{})", a[0], a[1]),
            OpCode::Max => format!("fmax({},{})", a[0], a[1]),
            OpCode::Abs => format!("fabs({})", a[0]),
            OpCode::Exp => format!("exp({})", a[0]),
            OpCode::Sqrt => format!("sqrt({})", a[0]),
            OpCode::Log => format!("log({})", a[0]),
            OpCode::Pow => format!("pow({},{})", a[0], a[1]),
        };
        Some(rhs)
    }
}

impl TryFrom<usize> for OpCode {
    type Error = ComputeError;

    fn try_from(code: usize) -> Result<Self, ComputeError> {
        OpCode::ALL
            .get(code)
            .copied()
            .ok_or_else(|| unknown_opcode(format!("no implementation for op code {code}")))
    }
}

/// Resolves a variable id to the source expression reading it.
///
/// Ids partition by numeric range into inputs, variates and
/// intermediates; the same rules apply to operation arguments and to
/// output assignments.
pub(crate) struct ArgResolver<'a> {
    /// Batch size of the current calculation.
    pub n: usize,
    /// Flat input buffer offset per input variable.
    pub input_offset: &'a [usize],
    pub input_is_scalar: &'a [bool],
    pub n_variates: usize,
}

impl ArgResolver<'_> {
    pub fn n_inputs(&self) -> usize {
        self.input_offset.len()
    }

    pub fn resolve(&self, id: usize) -> String {
        if id < self.n_inputs() {
            if self.input_is_scalar[id] {
                format!("input[{}U]", self.input_offset[id])
            } else {
                format!("input[{}U + i]", self.input_offset[id])
            }
        } else if id < self.n_inputs() + self.n_variates {
            format!("rn[{}U + i]", (id - self.n_inputs()) * self.n)
        } else {
            format!("v{id}")
        }
    }
}

/// Emit one SSA line, with the type prefix only on first declaration of
/// the result id (recycled ids are already declared).
pub(crate) fn ssa_line(fp: FpType, result_id: usize, needs_declaration: bool, rhs: &str) -> String {
    if needs_declaration {
        format!("  {} v{result_id} = {rhs};\n", fp.type_name())
    } else {
        format!("  v{result_id} = {rhs};\n")
    }
}

/// Check the argument count and that every argument id was previously
/// produced by the current calculation.
pub(crate) fn check_args(op: OpCode, args: &[usize], n_vars: usize) -> Result<(), ComputeError> {
    if args.len() != op.arity() {
        return Err(invalid_input(format!(
            "op {} expects {} argument(s), got {}",
            op.label(),
            op.arity(),
            args.len()
        )));
    }
    if let Some(id) = args.iter().find(|&&id| id >= n_vars) {
        return Err(invalid_input(format!(
            "op {}: argument id {} out of range (have {} variables)",
            op.label(),
            id,
            n_vars
        )));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ErrorKind;

    fn resolver<'a>(offsets: &'a [usize], scalar: &'a [bool]) -> ArgResolver<'a> {
        ArgResolver {
            n: 100,
            input_offset: offsets,
            input_is_scalar: scalar,
            n_variates: 2,
        }
    }

    #[test]
    fn resolves_all_variable_classes() {
        // input 0 scalar at offset 0, input 1 vector at offset 1
        let r = resolver(&[0, 1], &[true, false]);
        assert_eq!(r.resolve(0), "input[0U]");
        assert_eq!(r.resolve(1), "input[1U + i]");
        // variates are addressed by their relative index times the batch
        assert_eq!(r.resolve(2), "rn[0U + i]");
        assert_eq!(r.resolve(3), "rn[100U + i]");
        // everything beyond inputs + variates is an intermediate
        assert_eq!(r.resolve(4), "v4");
        assert_eq!(r.resolve(17), "v17");
    }

    #[test]
    fn rhs_translation_table() {
        let a = vec!["x".to_string(), "y".to_string()];
        assert_eq!(OpCode::Add.rhs(&a).unwrap(), "x + y");
        assert_eq!(OpCode::Sub.rhs(&a).unwrap(), "x - y");
        assert_eq!(OpCode::Neg.rhs(&a).unwrap(), "-x");
        assert_eq!(OpCode::Mul.rhs(&a).unwrap(), "x * y");
        assert_eq!(OpCode::Div.rhs(&a).unwrap(), "x / y");
        assert_eq!(OpCode::IndicatorEq.rhs(&a).unwrap(), "clc_indicatorEq(x,y)");
        assert_eq!(OpCode::IndicatorGt.rhs(&a).unwrap(), "clc_indicatorGt(x,y)");
        assert_eq!(
            OpCode::IndicatorGeq.rhs(&a).unwrap(),
            "clc_indicatorGeq(x,y)"
        );
        assert_eq!(OpCode::Min.rhs(&a).unwrap(), "fmin(x,y)");
        assert_eq!(OpCode::Max.rhs(&a).unwrap(), "fmax(x,y)");
        assert_eq!(OpCode::Abs.rhs(&a).unwrap(), "fabs(x)");
        assert_eq!(OpCode::Exp.rhs(&a).unwrap(), "exp(x)");
        assert_eq!(OpCode::Sqrt.rhs(&a).unwrap(), "sqrt(x)");
        assert_eq!(OpCode::Log.rhs(&a).unwrap(), "log(x)");
        assert_eq!(OpCode::Pow.rhs(&a).unwrap(), "pow(x,y)");
        assert!(OpCode::None.rhs(&a).is_none());
    }

    #[test]
    fn ssa_line_declares_only_fresh_ids() {
        assert_eq!(
            ssa_line(FpType::Double, 7, true, "v5 + v6"),
            "  double v7 = v5 + v6;\n"
        );
        assert_eq!(
            ssa_line(FpType::Single, 7, true, "v5 + v6"),
            "  float v7 = v5 + v6;\n"
        );
        assert_eq!(ssa_line(FpType::Double, 7, false, "v5"), "  v7 = v5;\n");
    }

    #[test]
    fn integer_encoding_is_stable() {
        assert_eq!(OpCode::try_from(0).unwrap(), OpCode::None);
        assert_eq!(OpCode::try_from(1).unwrap(), OpCode::Add);
        assert_eq!(OpCode::try_from(15).unwrap(), OpCode::Pow);
        for code in 0..16 {
            assert_eq!(OpCode::try_from(code).unwrap() as usize, code);
        }
        let err = OpCode::try_from(16).unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnknownOpcode);
    }

    #[test]
    fn argument_checks() {
        assert!(check_args(OpCode::Add, &[0, 1], 2).is_ok());
        assert!(check_args(OpCode::Neg, &[1], 2).is_ok());

        let err = check_args(OpCode::Add, &[0], 2).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidInput);

        let err = check_args(OpCode::Add, &[0, 5], 2).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidInput);
        assert!(err.info.contains("out of range"));
    }
}
