//! In-process stand-in for a host instrumentation engine.
//!
//! The victim is a list of [`Step`]s executed in order. Routines are
//! declared with a list of mnemonics, each mnemonic becoming a four byte
//! instruction so instruction probes can be placed by static ordinal. Routine
//! side effects are plain Rust closures working on a checked
//! [`ScriptedMemory`].

use super::{
    Fault, ImageInfo, InstructionInfo, Instrumentation, ProbeContext, ProbeHandler, ProbeHit,
    ProbeId, ProbePoint, Register, RoutineInfo, RunSummary,
};
use crate::disassembly::{classify, ControlFlow};
use crate::handoff::HandoffRecord;
use crate::victim;
use log::debug;
use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;

const INSTRUCTION_SIZE: u64 = 4;
const DEFAULT_STEP_LIMIT: usize = 1_000_000;

/// Side effect of a scripted routine, called with the routine argument
pub type Behavior = Box<dyn FnMut(&mut ScriptedMemory, u64) -> Result<(), Fault> + Send>;

/// One step of a scripted victim program
pub enum Step {
    /// Call the named routine with the current `rdi` as argument
    Call(String),
    Syscall(u64),
    /// Legitimate store of the victim itself
    Store { address: u64, value: u64 },
    SetRegister(Register, Vec<u8>),
    /// Continue on another thread
    Thread(u64),
    /// Publish addresses through the handoff file like a native victim
    Export { path: PathBuf, record: HandoffRecord },
    Exit(i64),
}

/// Sparse memory made of mapped regions. Every access is bounds checked.
#[derive(Debug, Default, Clone)]
pub struct ScriptedMemory {
    regions: BTreeMap<u64, Vec<u8>>,
}

impl ScriptedMemory {
    pub fn map(&mut self, address: u64, size: usize) {
        self.regions.insert(address, vec![0; size]);
    }

    fn locate(&self, address: u64, length: usize) -> Result<(u64, usize), Fault> {
        let (base, data) = self
            .regions
            .range(..=address)
            .next_back()
            .ok_or(Fault::Unmapped(address))?;
        let offset = (address - base) as usize;
        match offset.checked_add(length) {
            Some(end) if end <= data.len() => Ok((*base, offset)),
            _ => Err(Fault::Unmapped(address)),
        }
    }

    pub fn read(&self, address: u64, buffer: &mut [u8]) -> Result<(), Fault> {
        let (base, offset) = self.locate(address, buffer.len())?;
        buffer.copy_from_slice(&self.regions[&base][offset..offset + buffer.len()]);
        Ok(())
    }

    pub fn write(&mut self, address: u64, data: &[u8]) -> Result<(), Fault> {
        let (base, offset) = self.locate(address, data.len())?;
        if let Some(region) = self.regions.get_mut(&base) {
            region[offset..offset + data.len()].copy_from_slice(data);
        }
        Ok(())
    }

    pub fn read_word(&self, address: u64) -> Result<u64, Fault> {
        let mut buffer = [0u8; 8];
        self.read(address, &mut buffer)?;
        Ok(u64::from_le_bytes(buffer))
    }

    pub fn write_word(&mut self, address: u64, value: u64) -> Result<(), Fault> {
        self.write(address, &value.to_le_bytes())
    }
}

struct ScriptedRoutine {
    image: usize,
    info: RoutineInfo,
    instructions: Vec<InstructionInfo>,
}

struct Checkpoint {
    step: usize,
    registers: HashMap<Register, Vec<u8>>,
    thread: u64,
}

#[derive(Default)]
struct Machine {
    memory: ScriptedMemory,
    registers: HashMap<Register, Vec<u8>>,
    thread: u64,
    probes: HashMap<ProbePoint, Vec<ProbeId>>,
    probe_count: usize,
    checkpoint: Option<Checkpoint>,
    current_step: usize,
    jump: Option<usize>,
    detached: bool,
    in_call: bool,
}

impl Machine {
    fn register(&self, register: Register) -> Vec<u8> {
        self.registers
            .get(&register)
            .cloned()
            .unwrap_or_else(|| vec![0; register.width()])
    }
}

/// Scripted victim and host engine in one.
pub struct ScriptedBackend {
    images: Vec<String>,
    routines: Vec<ScriptedRoutine>,
    behaviors: HashMap<u64, Behavior>,
    program: Vec<Step>,
    machine: Machine,
    step_limit: usize,
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            images: vec!["victim".to_string()],
            routines: Vec::new(),
            behaviors: HashMap::new(),
            program: Vec::new(),
            machine: Machine::default(),
            step_limit: DEFAULT_STEP_LIMIT,
        }
    }

    /// Start a new code image, following routines belong to it
    pub fn image(mut self, name: &str) -> Self {
        self.images.push(name.to_string());
        self
    }

    /// Declare a routine made of the given mnemonics at `address`
    pub fn routine(mut self, name: &str, address: u64, mnemonics: &[&str]) -> Self {
        let instructions = mnemonics
            .iter()
            .enumerate()
            .map(|(ordinal, mnemonic)| InstructionInfo {
                address: address + ordinal as u64 * INSTRUCTION_SIZE,
                size: INSTRUCTION_SIZE,
                mnemonic: mnemonic.to_string(),
                operands: String::new(),
                category: classify(mnemonic, ""),
                flow: ControlFlow::of(mnemonic),
            })
            .collect();
        self.routines.push(ScriptedRoutine {
            image: self.images.len() - 1,
            info: RoutineInfo {
                name: name.to_string(),
                address,
                size: mnemonics.len() as u64 * INSTRUCTION_SIZE,
            },
            instructions,
        });
        self
    }

    /// Attach a side effect to an already declared routine
    pub fn behavior<F>(mut self, name: &str, behavior: F) -> Self
    where
        F: FnMut(&mut ScriptedMemory, u64) -> Result<(), Fault> + Send + 'static,
    {
        if let Some(routine) = self.routines.iter().find(|r| r.info.name == name) {
            self.behaviors.insert(routine.info.address, Box::new(behavior));
        }
        self
    }

    /// Map a zero initialized memory region
    pub fn region(mut self, address: u64, size: usize) -> Self {
        self.machine.memory.map(address, size);
        self
    }

    pub fn program(mut self, program: Vec<Step>) -> Self {
        self.program = program;
        self
    }

    pub fn step_limit(mut self, step_limit: usize) -> Self {
        self.step_limit = step_limit;
        self
    }

    pub fn memory(&self) -> &ScriptedMemory {
        &self.machine.memory
    }

    pub fn memory_mut(&mut self) -> &mut ScriptedMemory {
        &mut self.machine.memory
    }

    pub fn register(&self, register: Register) -> Vec<u8> {
        self.machine.register(register)
    }

    pub fn set_register(&mut self, register: Register, value: &[u8]) {
        self.machine.registers.insert(register, value.to_vec());
    }

    /// Number of probes currently inserted
    pub fn probe_count(&self) -> usize {
        self.machine.probe_count
    }
}

fn fire(
    machine: &mut Machine,
    behaviors: &mut HashMap<u64, Behavior>,
    handler: &mut dyn ProbeHandler,
    point: ProbePoint,
) {
    if machine.detached || machine.in_call {
        return;
    }
    let Some(probes) = machine.probes.get(&point).cloned() else {
        return;
    };
    for probe in probes {
        if machine.detached || machine.jump.is_some() {
            break;
        }
        let mut ctx = ScriptedContext {
            machine: &mut *machine,
            behaviors: &mut *behaviors,
        };
        handler.on_probe(ProbeHit { probe, point }, &mut ctx);
    }
}

impl ScriptedBackend {
    /// Execute one step, returns the exit code if the victim exited
    fn execute(
        &mut self,
        index: usize,
        handler: &mut dyn ProbeHandler,
    ) -> Result<Option<i64>, Fault> {
        let machine = &mut self.machine;
        let behaviors = &mut self.behaviors;
        match &self.program[index] {
            Step::Call(name) => {
                let routine = self
                    .routines
                    .iter()
                    .find(|routine| routine.info.name == *name)
                    .ok_or_else(|| Fault::Crashed {
                        address: 0,
                        reason: format!("call of undeclared routine {name}"),
                    })?;
                for instruction in &routine.instructions {
                    fire(
                        machine,
                        behaviors,
                        handler,
                        ProbePoint::Instruction(instruction.address),
                    );
                    if machine.jump.is_some() {
                        return Ok(None);
                    }
                }
                if let Some(behavior) = behaviors.get_mut(&routine.info.address) {
                    let argument = machine
                        .register(Register::RDI)
                        .get(..8)
                        .and_then(|bytes| bytes.try_into().ok())
                        .map(u64::from_le_bytes)
                        .unwrap_or_default();
                    behavior(&mut machine.memory, argument)?;
                }
            }
            Step::Syscall(number) => {
                fire(machine, behaviors, handler, ProbePoint::Syscall(*number));
            }
            Step::Store { address, value } => machine.memory.write_word(*address, *value)?,
            Step::SetRegister(register, value) => {
                machine.registers.insert(*register, value.clone());
            }
            Step::Thread(thread) => machine.thread = *thread,
            Step::Export { path, record } => {
                victim::export_addresses(path, record).map_err(|e| Fault::Crashed {
                    address: 0,
                    reason: format!("handoff export failed: {e}"),
                })?;
            }
            Step::Exit(code) => return Ok(Some(*code)),
        }
        Ok(None)
    }
}

impl Instrumentation for ScriptedBackend {
    fn images(&self) -> Vec<ImageInfo> {
        self.images
            .iter()
            .enumerate()
            .map(|(index, name)| ImageInfo {
                name: name.clone(),
                main: index == 0,
                routines: self
                    .routines
                    .iter()
                    .filter(|routine| routine.image == index)
                    .map(|routine| routine.info.clone())
                    .collect(),
            })
            .collect()
    }

    fn routine_instructions(&self, routine: &RoutineInfo) -> Result<Vec<InstructionInfo>, Fault> {
        self.routines
            .iter()
            .find(|candidate| candidate.info.address == routine.address)
            .map(|candidate| candidate.instructions.clone())
            .ok_or_else(|| Fault::Decode(format!("no routine at 0x{:x}", routine.address)))
    }

    fn insert_probe(&mut self, point: ProbePoint) -> ProbeId {
        let probe = self.machine.probe_count;
        self.machine.probe_count += 1;
        self.machine.probes.entry(point).or_default().push(probe);
        probe
    }

    fn run(&mut self, handler: &mut dyn ProbeHandler) -> Result<RunSummary, Fault> {
        let mut summary = RunSummary::default();
        let mut pc = 0;
        while pc < self.program.len() {
            if summary.instructions >= self.step_limit {
                summary.crash = Some(Fault::BudgetExhausted(self.step_limit));
                break;
            }
            summary.instructions += 1;
            self.machine.current_step = pc;
            let index = pc;
            pc += 1;
            match self.execute(index, handler) {
                Ok(Some(code)) => {
                    summary.exit_code = Some(code);
                    break;
                }
                Ok(None) => {}
                Err(fault) => {
                    debug!("Scripted victim crashed at step {index}: {fault}");
                    summary.crash = Some(fault);
                    break;
                }
            }
            if let Some(target) = self.machine.jump.take() {
                pc = target;
            }
        }
        if summary.exit_code.is_none() && summary.crash.is_none() {
            summary.exit_code = Some(0);
        }
        summary.detached = self.machine.detached;
        Ok(summary)
    }
}

/// Register file of the scripted machine: 16 of each kind plus rip
fn modelled(register: Register) -> bool {
    match register {
        Register::Gpr(number) | Register::Xmm(number) | Register::Ymm(number) => number < 16,
        Register::Rip => true,
    }
}

struct ScriptedContext<'a> {
    machine: &'a mut Machine,
    behaviors: &'a mut HashMap<u64, Behavior>,
}

impl ProbeContext for ScriptedContext<'_> {
    fn thread_id(&self) -> u64 {
        self.machine.thread
    }

    fn read_memory(&mut self, address: u64, buffer: &mut [u8]) -> Result<(), Fault> {
        self.machine.memory.read(address, buffer)
    }

    fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<(), Fault> {
        self.machine.memory.write(address, data)
    }

    fn read_register(&mut self, register: Register) -> Result<Vec<u8>, Fault> {
        if !modelled(register) {
            return Err(Fault::UnsupportedRegister(register));
        }
        Ok(self.machine.register(register))
    }

    fn write_register(&mut self, register: Register, value: &[u8]) -> Result<(), Fault> {
        if !modelled(register) || value.len() != register.width() {
            return Err(Fault::UnsupportedRegister(register));
        }
        self.machine.registers.insert(register, value.to_vec());
        Ok(())
    }

    fn call_routine(&mut self, address: u64, argument: u64) -> Result<(), Fault> {
        let Some(behavior) = self.behaviors.get_mut(&address) else {
            return Ok(());
        };
        self.machine.in_call = true;
        let memory = &mut self.machine.memory;
        let result = panic::catch_unwind(AssertUnwindSafe(|| behavior(memory, argument)));
        self.machine.in_call = false;
        // probes are live again before the panic reaches the caller's guard
        result.unwrap_or_else(|payload| panic::resume_unwind(payload))
    }

    fn save_checkpoint(&mut self) -> Result<(), Fault> {
        self.machine.checkpoint = Some(Checkpoint {
            step: self.machine.current_step,
            registers: self.machine.registers.clone(),
            thread: self.machine.thread,
        });
        Ok(())
    }

    fn resume_from_checkpoint(&mut self) -> Result<(), Fault> {
        let checkpoint = self.machine.checkpoint.as_ref().ok_or(Fault::NoCheckpoint)?;
        self.machine.registers = checkpoint.registers.clone();
        self.machine.thread = checkpoint.thread;
        self.machine.jump = Some(checkpoint.step);
        Ok(())
    }

    fn detach(&mut self) {
        self.machine.detached = true;
    }
}
