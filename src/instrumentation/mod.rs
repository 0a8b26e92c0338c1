//! # Instrumentation capability interface
//!
//! The injection engine never talks to a concrete host engine. It sees the
//! victim only through the traits in this module:
//!
//! * [`Instrumentation`] enumerates code images, decodes routines, places
//!   probes and drives the victim.
//! * [`ProbeHandler`] receives every probe hit synchronously on the victim's
//!   thread.
//! * [`ProbeContext`] is handed to the handler for the duration of one hit and
//!   gives checked access to memory, registers, nested routine calls and
//!   checkpoints.
//!
//! Two backends implement these traits: the unicorn based
//! [`EmulatorBackend`](crate::emulation::EmulatorBackend) and the in-process
//! [`ScriptedBackend`](scripted::ScriptedBackend).

pub mod register;
pub mod scripted;

pub use register::Register;

use crate::disassembly::{ControlFlow, InstructionCategory};

/// Identifier of an inserted probe, unique per backend
pub type ProbeId = usize;

/// Program point a probe can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbePoint {
    /// Before the instruction at the given address executes
    Instruction(u64),
    /// Entry of the system call with the given number
    Syscall(u64),
}

/// One probe hit as delivered to a [`ProbeHandler`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeHit {
    pub probe: ProbeId,
    pub point: ProbePoint,
}

/// Fault raised by checked access to the victim or by victim code itself.
///
/// Faults never terminate the host. They travel as `Err` values up to the
/// injection engine, which logs them and abandons the current step.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Fault {
    #[error("address 0x{0:x} is not mapped")]
    Unmapped(u64),
    #[error("address 0x{0:x} is below the lowest valid address")]
    LowAddress(u64),
    #[error("routine at 0x{address:x} crashed: {reason}")]
    Crashed { address: u64, reason: String },
    #[error("panic contained: {0}")]
    Panicked(String),
    #[error("register {0} is not supported by this backend")]
    UnsupportedRegister(Register),
    #[error("bit {bit} is out of range for a {bits} bit value")]
    BitOutOfRange { bit: u32, bits: u32 },
    #[error("no checkpoint has been saved")]
    NoCheckpoint,
    #[error("instruction budget of {0} exhausted")]
    BudgetExhausted(usize),
    #[error("decoding failed: {0}")]
    Decode(String),
    #[error("emulation failed: {0}")]
    Emulation(String),
}

/// Routine as enumerated from a loaded code image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutineInfo {
    pub name: String,
    pub address: u64,
    /// Size in bytes, zero if the symbol carries no size
    pub size: u64,
}

/// Loaded code image with its routines
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub name: String,
    pub main: bool,
    pub routines: Vec<RoutineInfo>,
}

/// One statically decoded instruction of a routine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionInfo {
    pub address: u64,
    pub size: u64,
    pub mnemonic: String,
    pub operands: String,
    pub category: InstructionCategory,
    pub flow: ControlFlow,
}

impl InstructionInfo {
    /// Address of the instruction directly following this one
    pub fn next_address(&self) -> u64 {
        self.address + self.size
    }
}

/// Outcome of one victim run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Exit status reported by the victim, if it terminated normally
    pub exit_code: Option<i64>,
    /// Number of executed instructions (steps for the scripted backend)
    pub instructions: usize,
    /// Crash of the victim itself after all containment
    pub crash: Option<Fault>,
    /// Probes were detached before the victim finished
    pub detached: bool,
}

/// Receiver of probe hits
pub trait ProbeHandler {
    /// Called synchronously for every probe hit. The victim is suspended
    /// until the handler returns.
    fn on_probe(&mut self, hit: ProbeHit, ctx: &mut dyn ProbeContext);
}

/// Access to the suspended victim during one probe hit.
pub trait ProbeContext {
    /// Identifier of the victim thread that hit the probe
    fn thread_id(&self) -> u64;

    fn read_memory(&mut self, address: u64, buffer: &mut [u8]) -> Result<(), Fault>;

    fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<(), Fault>;

    /// Read the full register value, little endian, `register.width()` bytes
    fn read_register(&mut self, register: Register) -> Result<Vec<u8>, Fault>;

    fn write_register(&mut self, register: Register, value: &[u8]) -> Result<(), Fault>;

    /// Call a one argument victim routine and wait for it to return.
    ///
    /// Probes do not fire inside the call. Any fault in the callee is returned
    /// as `Err` and the victim context is left as it was before the call.
    fn call_routine(&mut self, address: u64, argument: u64) -> Result<(), Fault>;

    /// Save the full machine context at the current program point
    fn save_checkpoint(&mut self) -> Result<(), Fault>;

    /// Continue execution from the last saved checkpoint once the handler returns
    fn resume_from_checkpoint(&mut self) -> Result<(), Fault>;

    /// Remove all probes, the victim runs to completion uninstrumented
    fn detach(&mut self);

    /// Read one 64-bit little endian word
    fn read_word(&mut self, address: u64) -> Result<u64, Fault> {
        let mut buffer = [0u8; 8];
        self.read_memory(address, &mut buffer)?;
        Ok(u64::from_le_bytes(buffer))
    }

    /// Write one 64-bit little endian word
    fn write_word(&mut self, address: u64, value: u64) -> Result<(), Fault> {
        self.write_memory(address, &value.to_le_bytes())
    }
}

/// Host engine able to instrument and run a victim.
pub trait Instrumentation {
    /// Code images of the victim, enumerated once before the run
    fn images(&self) -> Vec<ImageInfo>;

    /// Static instruction stream of a routine in program order
    fn routine_instructions(&self, routine: &RoutineInfo) -> Result<Vec<InstructionInfo>, Fault>;

    fn insert_probe(&mut self, point: ProbePoint) -> ProbeId;

    /// Run the victim to completion, delivering probe hits to `handler`
    fn run(&mut self, handler: &mut dyn ProbeHandler) -> Result<RunSummary, Fault>;
}
