use crate::instrumentation::{Fault, InstructionInfo};
use capstone::prelude::*;
use std::fmt;

/// Arithmetic category of an instruction, as counted by the profiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InstructionCategory {
    IntAdd,
    IntSub,
    IntMul,
    IntDiv,
    ShiftLeft,
    ShiftRight,
    BitwiseAnd,
    BitwiseOr,
    BitwiseXor,
    FloatAdd,
    FloatSub,
    FloatMul,
    FloatDiv,
    SsePacked,
    AvxPacked,
    OtherSimd,
    Unknown,
}

impl fmt::Display for InstructionCategory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            InstructionCategory::IntAdd => "INT_ADD",
            InstructionCategory::IntSub => "INT_SUB",
            InstructionCategory::IntMul => "INT_MUL",
            InstructionCategory::IntDiv => "INT_DIV",
            InstructionCategory::ShiftLeft => "SHIFT_LEFT",
            InstructionCategory::ShiftRight => "SHIFT_RIGHT",
            InstructionCategory::BitwiseAnd => "BITWISE_AND",
            InstructionCategory::BitwiseOr => "BITWISE_OR",
            InstructionCategory::BitwiseXor => "BITWISE_XOR",
            InstructionCategory::FloatAdd => "FLOAT_ADD",
            InstructionCategory::FloatSub => "FLOAT_SUB",
            InstructionCategory::FloatMul => "FLOAT_MUL",
            InstructionCategory::FloatDiv => "FLOAT_DIV",
            InstructionCategory::SsePacked => "SSE_PACKED",
            InstructionCategory::AvxPacked => "AVX_PACKED",
            InstructionCategory::OtherSimd => "OTHER_SIMD",
            InstructionCategory::Unknown => "UNKNOWN",
        };
        write!(f, "{name}")
    }
}

/// How an instruction hands over control to the next one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFlow {
    Sequential,
    Branch,
    Call,
    Return,
}

impl ControlFlow {
    pub fn of(mnemonic: &str) -> Self {
        let mnemonic = mnemonic.to_lowercase();
        let mnemonic = mnemonic
            .strip_prefix("bnd ")
            .or_else(|| mnemonic.strip_prefix("notrack "))
            .unwrap_or(&mnemonic);
        match mnemonic {
            "ret" | "retf" | "retn" | "iret" | "iretq" | "iretd" => ControlFlow::Return,
            "call" | "lcall" => ControlFlow::Call,
            m if m.starts_with('j') || m.starts_with("loop") => ControlFlow::Branch,
            _ => ControlFlow::Sequential,
        }
    }

    /// Execution falls through to the following instruction
    pub fn falls_through(&self) -> bool {
        *self == ControlFlow::Sequential
    }
}

/// Classify an instruction by mnemonic and operand text.
///
/// Scalar floating point forms are checked before the integer forms so
/// `addsd` does not count as an integer addition.
pub fn classify(mnemonic: &str, operands: &str) -> InstructionCategory {
    let op = mnemonic.to_lowercase();
    let op = op.as_str();

    let scalar_float = |base: &str| {
        op.starts_with(&format!("f{base}"))
            || op == format!("{base}sd")
            || op == format!("{base}ss")
            || op == format!("v{base}sd")
            || op == format!("v{base}ss")
    };
    if scalar_float("add") {
        return InstructionCategory::FloatAdd;
    }
    if scalar_float("sub") {
        return InstructionCategory::FloatSub;
    }
    if scalar_float("mul") {
        return InstructionCategory::FloatMul;
    }
    if scalar_float("div") {
        return InstructionCategory::FloatDiv;
    }

    if matches!(op, "add" | "adc" | "inc" | "xadd") {
        return InstructionCategory::IntAdd;
    }
    if matches!(op, "sub" | "sbb" | "dec" | "neg") {
        return InstructionCategory::IntSub;
    }
    if matches!(op, "mul" | "imul" | "mulx") {
        return InstructionCategory::IntMul;
    }
    if matches!(op, "div" | "idiv") {
        return InstructionCategory::IntDiv;
    }
    if matches!(op, "shl" | "sal" | "shld" | "shlx" | "rol" | "rcl") {
        return InstructionCategory::ShiftLeft;
    }
    if matches!(op, "shr" | "sar" | "shrd" | "shrx" | "sarx" | "ror" | "rcr") {
        return InstructionCategory::ShiftRight;
    }
    if matches!(op, "and" | "andn") {
        return InstructionCategory::BitwiseAnd;
    }
    if op == "or" {
        return InstructionCategory::BitwiseOr;
    }
    if op == "xor" {
        return InstructionCategory::BitwiseXor;
    }

    let operands = operands.to_lowercase();
    let vector_operands =
        operands.contains("xmm") || operands.contains("ymm") || operands.contains("zmm");
    if op.starts_with('v') && vector_operands {
        return InstructionCategory::AvxPacked;
    }
    if op.starts_with('p') && vector_operands {
        return InstructionCategory::SsePacked;
    }
    if vector_operands {
        return InstructionCategory::OtherSimd;
    }
    InstructionCategory::Unknown
}

/// Upper bound for decoding routines whose symbol carries no size
const UNSIZED_ROUTINE_LIMIT: usize = 0x1000;

/// x86-64 decoder for routine instruction streams
pub struct Disassembly {
    cs: Capstone,
}

impl Disassembly {
    pub fn new() -> Result<Self, Fault> {
        let cs = Capstone::new()
            .x86()
            .mode(arch::x86::ArchMode::Mode64)
            .detail(false)
            .build()
            .map_err(|e| Fault::Decode(format!("failed to create capstone object: {e}")))?;

        Ok(Self { cs })
    }

    /// Decode the instructions of `code` located at `address`.
    ///
    /// With `stop_at_return` set, decoding ends after the first return
    /// instruction. This is used for routines without symbol size such as
    /// marker labels defined in assembly.
    pub fn decode(
        &self,
        code: &[u8],
        address: u64,
        stop_at_return: bool,
    ) -> Result<Vec<InstructionInfo>, Fault> {
        let code = match stop_at_return {
            true => &code[..code.len().min(UNSIZED_ROUTINE_LIMIT)],
            false => code,
        };
        let insns = self
            .cs
            .disasm_all(code, address)
            .map_err(|e| Fault::Decode(format!("0x{address:x}: {e}")))?;

        let mut instructions = Vec::new();
        for insn in insns.iter() {
            let mnemonic = insn.mnemonic().unwrap_or_default().to_string();
            let operands = insn.op_str().unwrap_or_default().to_string();
            let flow = ControlFlow::of(&mnemonic);
            instructions.push(InstructionInfo {
                address: insn.address(),
                size: insn.bytes().len() as u64,
                category: classify(&mnemonic, &operands),
                mnemonic,
                operands,
                flow,
            });
            if stop_at_return && flow == ControlFlow::Return {
                break;
            }
        }
        Ok(instructions)
    }
}
