//! # Emulator backend
//!
//! Runs an x86-64 victim image inside unicorn and implements the
//! [`Instrumentation`] capabilities on top of it.
//!
//! Probe hits are never handled inside a unicorn hook. The code hook records
//! the hit and stops the emulation, the run loop dispatches the hit to the
//! handler with a [`ProbeContext`] and resumes afterwards. Resuming at the
//! probed instruction skips the probe once, so every dynamic execution of a
//! probed instruction is reported exactly once.
//!
//! The victim is started at the image entry with a return address pointing
//! into a sentinel page filled with `hlt`. Returning from the entry routine
//! ends the run with RAX as exit code. Linux system calls are emulated as far
//! as needed: `write` to stdout, stderr and the handoff descriptor, `exit`,
//! `exit_group` and `getpid`.

use crate::disassembly::Disassembly;
use crate::elf_file::VictimImage;
use crate::instrumentation::{
    Fault, ImageInfo, InstructionInfo, Instrumentation, ProbeContext, ProbeHandler, ProbeHit,
    ProbeId, ProbePoint, Register, RoutineInfo, RunSummary,
};

mod callback;

use callback::{hook_code_callback, hook_syscall_callback};
use unicorn_engine::unicorn_const::{uc_error, Arch, Mode, Permission};
use unicorn_engine::{Context, InsnSysX86, RegisterX86, Unicorn};

use log::{debug, info};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

// Constant variable definitions
const PAGE_SIZE: u64 = 0x1000;
const STACK_TOP: u64 = 0x7fff_f000_0000;
const STACK_SIZE: u64 = 0x10_0000;
const SENTINEL_PAGE: u64 = 0xdead_0000;
/// Return address of the entry routine
const RETURN_SENTINEL: u64 = SENTINEL_PAGE;
/// Return address of nested routine calls
const CALL_SENTINEL: u64 = SENTINEL_PAGE + 0x10;
const HLT: u8 = 0xf4;
/// Space kept free below the interrupted stack pointer for nested calls
const CALL_FRAME_GAP: u64 = 0x180;

/// General purpose registers in encoding order
pub const GPR: [RegisterX86; 16] = [
    RegisterX86::RAX,
    RegisterX86::RCX,
    RegisterX86::RDX,
    RegisterX86::RBX,
    RegisterX86::RSP,
    RegisterX86::RBP,
    RegisterX86::RSI,
    RegisterX86::RDI,
    RegisterX86::R8,
    RegisterX86::R9,
    RegisterX86::R10,
    RegisterX86::R11,
    RegisterX86::R12,
    RegisterX86::R13,
    RegisterX86::R14,
    RegisterX86::R15,
];

const XMM: [RegisterX86; 16] = [
    RegisterX86::XMM0,
    RegisterX86::XMM1,
    RegisterX86::XMM2,
    RegisterX86::XMM3,
    RegisterX86::XMM4,
    RegisterX86::XMM5,
    RegisterX86::XMM6,
    RegisterX86::XMM7,
    RegisterX86::XMM8,
    RegisterX86::XMM9,
    RegisterX86::XMM10,
    RegisterX86::XMM11,
    RegisterX86::XMM12,
    RegisterX86::XMM13,
    RegisterX86::XMM14,
    RegisterX86::XMM15,
];

const YMM: [RegisterX86; 16] = [
    RegisterX86::YMM0,
    RegisterX86::YMM1,
    RegisterX86::YMM2,
    RegisterX86::YMM3,
    RegisterX86::YMM4,
    RegisterX86::YMM5,
    RegisterX86::YMM6,
    RegisterX86::YMM7,
    RegisterX86::YMM8,
    RegisterX86::YMM9,
    RegisterX86::YMM10,
    RegisterX86::YMM11,
    RegisterX86::YMM12,
    RegisterX86::YMM13,
    RegisterX86::YMM14,
    RegisterX86::YMM15,
];

/// Settings of one emulated victim run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    /// Instructions the victim may execute outside nested calls
    pub max_instructions: usize,
    /// Instructions one nested routine call may execute
    pub call_budget: usize,
    /// Host file receiving everything the victim writes to `handoff_fd`
    pub handoff_file: Option<PathBuf>,
    pub handoff_fd: u64,
    /// Forward victim writes to stdout and stderr
    pub echo_output: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            max_instructions: 10_000_000,
            call_budget: 1_000_000,
            handoff_file: None,
            handoff_fd: 3,
            echo_output: false,
        }
    }
}

/// Data shared with the unicorn hooks
pub(crate) struct EmulatorState {
    probes: HashMap<u64, Vec<ProbeId>>,
    syscall_probes: HashMap<u64, Vec<ProbeId>>,
    probe_count: usize,
    pending: Vec<ProbeHit>,
    /// Address following an intercepted system call
    syscall_return: Option<u64>,
    /// Probes at this address are skipped once
    skip_address: Option<u64>,
    in_call: bool,
    detached: bool,
    resumed: bool,
    exit_code: Option<i64>,
    instructions: usize,
    max_instructions: usize,
    budget_exhausted: bool,
    handoff_file: Option<PathBuf>,
    handoff_fd: u64,
    handoff_started: bool,
    echo_output: bool,
}

impl EmulatorState {
    fn new(config: &BackendConfig) -> Self {
        Self {
            probes: HashMap::new(),
            syscall_probes: HashMap::new(),
            probe_count: 0,
            pending: Vec::new(),
            syscall_return: None,
            skip_address: None,
            in_call: false,
            detached: false,
            resumed: false,
            exit_code: None,
            instructions: 0,
            max_instructions: config.max_instructions,
            budget_exhausted: false,
            handoff_file: config.handoff_file.clone(),
            handoff_fd: config.handoff_fd,
            handoff_started: false,
            echo_output: config.echo_output,
        }
    }
}

/// Machine context plus the live part of the stack
struct Checkpoint {
    context: Context,
    stack_pointer: u64,
    stack: Vec<u8>,
}

fn emulation_error(error: uc_error) -> Fault {
    Fault::Emulation(format!("{error:?}"))
}

fn page_floor(address: u64) -> u64 {
    address & !(PAGE_SIZE - 1)
}

fn in_sentinel_page(address: u64) -> bool {
    page_floor(address) == SENTINEL_PAGE
}

pub struct EmulatorBackend {
    emu: Unicorn<'static, EmulatorState>,
    image: Arc<VictimImage>,
    disassembly: Disassembly,
    checkpoint: Option<Checkpoint>,
    call_budget: usize,
}

impl EmulatorBackend {
    /// Setup a new unicorn instance with the image loaded and hooks installed
    pub fn new(image: Arc<VictimImage>, config: &BackendConfig) -> Result<Self, Fault> {
        let mut emu = Unicorn::new_with_data(Arch::X86, Mode::MODE_64, EmulatorState::new(config))
            .map_err(emulation_error)?;
        debug!("Setup new unicorn instance");

        Self::setup_memory(&mut emu, &image)?;

        emu.add_code_hook(1, 0, hook_code_callback)
            .map_err(emulation_error)?;
        emu.add_insn_sys_hook(InsnSysX86::SYSCALL, 1, 0, hook_syscall_callback)
            .map_err(emulation_error)?;

        Ok(Self {
            emu,
            image,
            disassembly: Disassembly::new()?,
            checkpoint: None,
            call_budget: config.call_budget,
        })
    }

    /// Map image segments, stack and sentinel page
    fn setup_memory(emu: &mut Unicorn<EmulatorState>, image: &VictimImage) -> Result<(), Fault> {
        // Pages covered by any segment, merged into contiguous runs
        let mut pages = BTreeSet::new();
        for segment in &image.segments {
            let end = segment.address + segment.size.max(1);
            let mut page = page_floor(segment.address);
            while page < end {
                pages.insert(page);
                page += PAGE_SIZE;
            }
        }
        let mut runs: Vec<(u64, u64)> = Vec::new();
        for page in pages {
            match runs.last_mut() {
                Some((start, size)) if *start + *size == page => *size += PAGE_SIZE,
                _ => runs.push((page, PAGE_SIZE)),
            }
        }
        for (start, size) in runs {
            debug!("Map image pages 0x{start:x}..0x{:x}", start + size);
            emu.mem_map(start, size as _, Permission::ALL)
                .map_err(emulation_error)?;
        }
        for segment in &image.segments {
            emu.mem_write(segment.address, &segment.data)
                .map_err(emulation_error)?;
        }

        // Stack
        emu.mem_map(
            STACK_TOP - STACK_SIZE,
            STACK_SIZE as _,
            Permission::READ | Permission::WRITE,
        )
        .map_err(emulation_error)?;

        // Return sentinels
        emu.mem_map(SENTINEL_PAGE, PAGE_SIZE as _, Permission::READ | Permission::EXEC)
            .map_err(emulation_error)?;
        emu.mem_write(SENTINEL_PAGE, &[HLT; PAGE_SIZE as usize])
            .map_err(emulation_error)
    }

    /// Clear all general purpose registers and push the return sentinel
    fn init_register(&mut self) -> Result<(), Fault> {
        for register in GPR {
            self.emu.reg_write(register, 0).map_err(emulation_error)?;
        }
        let stack_pointer = STACK_TOP - 8;
        self.emu
            .reg_write(RegisterX86::RSP, stack_pointer)
            .map_err(emulation_error)?;
        self.emu
            .mem_write(stack_pointer, &RETURN_SENTINEL.to_le_bytes())
            .map_err(emulation_error)
    }

    /// Read victim memory, for inspection after a run
    pub fn read_memory(&self, address: u64, buffer: &mut [u8]) -> Result<(), Fault> {
        self.emu
            .mem_read(address, buffer)
            .map_err(|_| Fault::Unmapped(address))
    }

    pub fn read_word(&self, address: u64) -> Result<u64, Fault> {
        let mut buffer = [0u8; 8];
        self.read_memory(address, &mut buffer)?;
        Ok(u64::from_le_bytes(buffer))
    }

    pub fn image(&self) -> &VictimImage {
        &self.image
    }

    fn dispatch(&mut self, hit: ProbeHit, handler: &mut dyn ProbeHandler) {
        // Detach also drops hits already collected in the same stop
        if self.emu.get_data().detached {
            return;
        }
        let mut ctx = EmulatorContext {
            emu: &mut self.emu,
            checkpoint: &mut self.checkpoint,
            call_budget: self.call_budget,
        };
        handler.on_probe(hit, &mut ctx);
    }
}

impl Instrumentation for EmulatorBackend {
    fn images(&self) -> Vec<ImageInfo> {
        vec![ImageInfo {
            name: self.image.name.clone(),
            main: true,
            routines: self.image.routines.clone(),
        }]
    }

    fn routine_instructions(&self, routine: &RoutineInfo) -> Result<Vec<InstructionInfo>, Fault> {
        let (length, stop_at_return) = match routine.size {
            0 => (usize::MAX, true),
            size => (size as usize, false),
        };
        let code = self
            .image
            .bytes_at(routine.address, length)
            .ok_or(Fault::Unmapped(routine.address))?;
        self.disassembly.decode(code, routine.address, stop_at_return)
    }

    fn insert_probe(&mut self, point: ProbePoint) -> ProbeId {
        let state = self.emu.get_data_mut();
        let probe = state.probe_count;
        state.probe_count += 1;
        match point {
            ProbePoint::Instruction(address) => {
                state.probes.entry(address).or_default().push(probe)
            }
            ProbePoint::Syscall(number) => {
                state.syscall_probes.entry(number).or_default().push(probe)
            }
        }
        probe
    }

    fn run(&mut self, handler: &mut dyn ProbeHandler) -> Result<RunSummary, Fault> {
        self.init_register()?;
        let mut summary = RunSummary::default();
        let mut program_counter = self.image.entry;
        info!("Start {} at 0x{program_counter:x}", self.image.name);

        loop {
            let result = self.emu.emu_start(program_counter, RETURN_SENTINEL, 0, 0);
            let stopped_at = self.emu.pc_read().map_err(emulation_error)?;
            let state = self.emu.get_data_mut();
            let hits = std::mem::take(&mut state.pending);
            let syscall_return = state.syscall_return.take();

            if let Some(code) = state.exit_code {
                summary.exit_code = Some(code);
                break;
            }
            if state.budget_exhausted {
                summary.crash = Some(Fault::BudgetExhausted(state.max_instructions));
                break;
            }
            if let Err(error) = result {
                summary.crash = Some(Fault::Crashed {
                    address: stopped_at,
                    reason: format!("{error:?}"),
                });
                break;
            }
            if hits.is_empty() {
                if in_sentinel_page(stopped_at) {
                    let rax = self.emu.reg_read(RegisterX86::RAX).map_err(emulation_error)?;
                    summary.exit_code = Some(rax as i64);
                } else {
                    summary.crash = Some(Fault::Crashed {
                        address: stopped_at,
                        reason: "emulation stopped outside of a probe".to_string(),
                    });
                }
                break;
            }

            let probed_address = hits.iter().find_map(|hit| match hit.point {
                ProbePoint::Instruction(address) => Some(address),
                ProbePoint::Syscall(_) => None,
            });
            for hit in hits {
                self.dispatch(hit, handler);
            }

            let state = self.emu.get_data_mut();
            if std::mem::take(&mut state.resumed) {
                program_counter = self.emu.pc_read().map_err(emulation_error)?;
            } else if let Some(address) = probed_address {
                state.skip_address = Some(address);
                program_counter = address;
            } else {
                program_counter = syscall_return.unwrap_or(stopped_at);
            }
        }

        let state = self.emu.get_data();
        summary.instructions = state.instructions;
        summary.detached = state.detached;
        Ok(summary)
    }
}

/// Probe context of the suspended emulator
struct EmulatorContext<'e> {
    emu: &'e mut Unicorn<'static, EmulatorState>,
    checkpoint: &'e mut Option<Checkpoint>,
    call_budget: usize,
}

impl EmulatorContext<'_> {
    fn nested_call(&mut self, address: u64, argument: u64) -> Result<(), Fault> {
        let stack_pointer = self.emu.reg_read(RegisterX86::RSP).map_err(emulation_error)?;
        // Aligned frame below the red zone, holding the return sentinel
        let frame = ((stack_pointer - CALL_FRAME_GAP) & !0xf) - 8;
        self.write_memory(frame, &CALL_SENTINEL.to_le_bytes())?;
        self.emu
            .reg_write(RegisterX86::RSP, frame)
            .map_err(emulation_error)?;
        self.emu
            .reg_write(RegisterX86::RDI, argument)
            .map_err(emulation_error)?;

        self.emu.get_data_mut().in_call = true;
        let result = self
            .emu
            .emu_start(address, CALL_SENTINEL, 0, self.call_budget);
        let program_counter = self.emu.pc_read().map_err(emulation_error)?;
        match result {
            Err(error) => Err(Fault::Crashed {
                address: program_counter,
                reason: format!("{error:?}"),
            }),
            Ok(()) if (CALL_SENTINEL..=CALL_SENTINEL + 1).contains(&program_counter) => Ok(()),
            Ok(()) => Err(Fault::Crashed {
                address: program_counter,
                reason: format!("routine 0x{address:x} did not return"),
            }),
        }
    }
}

impl ProbeContext for EmulatorContext<'_> {
    fn thread_id(&self) -> u64 {
        0
    }

    fn read_memory(&mut self, address: u64, buffer: &mut [u8]) -> Result<(), Fault> {
        self.emu
            .mem_read(address, buffer)
            .map_err(|_| Fault::Unmapped(address))
    }

    fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<(), Fault> {
        self.emu
            .mem_write(address, data)
            .map_err(|_| Fault::Unmapped(address))
    }

    fn read_register(&mut self, register: Register) -> Result<Vec<u8>, Fault> {
        let unsupported = |_| Fault::UnsupportedRegister(register);
        match register {
            Register::Gpr(n) if (n as usize) < GPR.len() => self
                .emu
                .reg_read(GPR[n as usize])
                .map(|value| value.to_le_bytes().to_vec())
                .map_err(unsupported),
            Register::Rip => self
                .emu
                .reg_read(RegisterX86::RIP)
                .map(|value| value.to_le_bytes().to_vec())
                .map_err(unsupported),
            Register::Xmm(n) if (n as usize) < XMM.len() => self
                .emu
                .reg_read_long(XMM[n as usize])
                .map(|value| value.to_vec())
                .map_err(unsupported),
            Register::Ymm(n) if (n as usize) < YMM.len() => self
                .emu
                .reg_read_long(YMM[n as usize])
                .map(|value| value.to_vec())
                .map_err(unsupported),
            _ => Err(Fault::UnsupportedRegister(register)),
        }
    }

    fn write_register(&mut self, register: Register, value: &[u8]) -> Result<(), Fault> {
        let unsupported = |_| Fault::UnsupportedRegister(register);
        let mut full = vec![0u8; register.width()];
        let length = full.len().min(value.len());
        full[..length].copy_from_slice(&value[..length]);
        let mut word = [0u8; 8];
        let length = word.len().min(full.len());
        word[..length].copy_from_slice(&full[..length]);
        let word = u64::from_le_bytes(word);

        match register {
            Register::Gpr(n) if (n as usize) < GPR.len() => {
                self.emu.reg_write(GPR[n as usize], word).map_err(unsupported)
            }
            Register::Rip => self.emu.reg_write(RegisterX86::RIP, word).map_err(unsupported),
            Register::Xmm(n) if (n as usize) < XMM.len() => self
                .emu
                .reg_write_long(XMM[n as usize], &full)
                .map_err(unsupported),
            Register::Ymm(n) if (n as usize) < YMM.len() => self
                .emu
                .reg_write_long(YMM[n as usize], &full)
                .map_err(unsupported),
            _ => Err(Fault::UnsupportedRegister(register)),
        }
    }

    fn call_routine(&mut self, address: u64, argument: u64) -> Result<(), Fault> {
        let saved = self.emu.context_init().map_err(emulation_error)?;
        let result = self.nested_call(address, argument);
        self.emu.get_data_mut().in_call = false;
        self.emu.context_restore(&saved).map_err(emulation_error)?;
        result
    }

    fn save_checkpoint(&mut self) -> Result<(), Fault> {
        let stack_pointer = self.emu.reg_read(RegisterX86::RSP).map_err(emulation_error)?;
        if !(STACK_TOP - STACK_SIZE..STACK_TOP).contains(&stack_pointer) {
            return Err(Fault::Unmapped(stack_pointer));
        }
        let mut stack = vec![0u8; (STACK_TOP - stack_pointer) as usize];
        self.read_memory(stack_pointer, &mut stack)?;
        let context = self.emu.context_init().map_err(emulation_error)?;
        *self.checkpoint = Some(Checkpoint {
            context,
            stack_pointer,
            stack,
        });
        Ok(())
    }

    fn resume_from_checkpoint(&mut self) -> Result<(), Fault> {
        let checkpoint = self.checkpoint.as_ref().ok_or(Fault::NoCheckpoint)?;
        self.emu
            .context_restore(&checkpoint.context)
            .map_err(emulation_error)?;
        self.emu
            .mem_write(checkpoint.stack_pointer, &checkpoint.stack)
            .map_err(emulation_error)?;
        self.emu.get_data_mut().resumed = true;
        Ok(())
    }

    fn detach(&mut self) {
        self.emu.get_data_mut().detached = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Silent;

    impl ProbeHandler for Silent {
        fn on_probe(&mut self, _hit: ProbeHit, _ctx: &mut dyn ProbeContext) {}
    }

    #[test]
    fn run_returns_rax_as_exit_code() {
        // mov eax, 7 ; ret
        let image = VictimImage::from_raw("ret7", 0x400000, vec![0xb8, 0x07, 0, 0, 0, 0xc3], &[]);
        let mut backend = EmulatorBackend::new(Arc::new(image), &BackendConfig::default()).unwrap();
        let summary = backend.run(&mut Silent).unwrap();
        assert_eq!(summary.exit_code, Some(7));
        assert_eq!(summary.instructions, 2);
        assert!(summary.crash.is_none());
    }

    #[test]
    fn probed_instruction_reported_once_per_execution() {
        struct Count(usize);
        impl ProbeHandler for Count {
            fn on_probe(&mut self, _hit: ProbeHit, _ctx: &mut dyn ProbeContext) {
                self.0 += 1;
            }
        }
        // mov ecx, 3 ; loop: dec ecx ; jnz loop ; ret
        let code = vec![0xb9, 0x03, 0, 0, 0, 0xff, 0xc9, 0x75, 0xfc, 0xc3];
        let image = VictimImage::from_raw("loop", 0x400000, code, &[]);
        let mut backend = EmulatorBackend::new(Arc::new(image), &BackendConfig::default()).unwrap();
        backend.insert_probe(ProbePoint::Instruction(0x400005));
        let mut count = Count(0);
        let summary = backend.run(&mut count).unwrap();
        assert_eq!(count.0, 3);
        assert_eq!(summary.exit_code, Some(0));
    }

    #[test]
    fn budget_exhaustion_is_a_crash() {
        // jmp $
        let image = VictimImage::from_raw("spin", 0x400000, vec![0xeb, 0xfe], &[]);
        let config = BackendConfig {
            max_instructions: 100,
            ..Default::default()
        };
        let mut backend = EmulatorBackend::new(Arc::new(image), &config).unwrap();
        let summary = backend.run(&mut Silent).unwrap();
        assert_eq!(summary.crash, Some(Fault::BudgetExhausted(100)));
    }

    #[test]
    fn exit_syscall_reports_status() {
        // mov eax, 60 ; mov edi, 42 ; syscall
        let code = vec![0xb8, 0x3c, 0, 0, 0, 0xbf, 0x2a, 0, 0, 0, 0x0f, 0x05];
        let image = VictimImage::from_raw("exit", 0x400000, code, &[]);
        let mut backend = EmulatorBackend::new(Arc::new(image), &BackendConfig::default()).unwrap();
        assert_eq!(backend.run(&mut Silent).unwrap().exit_code, Some(42));
    }

    #[test]
    fn oversized_write_fails_inside_the_victim() {
        let code = vec![
            0xb8, 0x01, 0x00, 0x00, 0x00, // mov eax, 1
            0xbf, 0x01, 0x00, 0x00, 0x00, // mov edi, 1
            0xbe, 0x00, 0x00, 0x40, 0x00, // mov esi, 0x400000
            0x48, 0xba, 0, 0, 0, 0, 0, 0, 0, 0x40, // movabs rdx, 1 << 62
            0x0f, 0x05, // syscall
            0xc3, // ret
        ];
        let image = VictimImage::from_raw("write", 0x400000, code, &[]);
        let mut backend = EmulatorBackend::new(Arc::new(image), &BackendConfig::default()).unwrap();
        let summary = backend.run(&mut Silent).unwrap();
        // capped length still runs past the single code page
        assert_eq!(summary.exit_code, Some(-14));
        assert!(summary.crash.is_none());
    }

    #[test]
    fn failed_nested_calls_leave_the_victim_intact() {
        struct CallOnce(Vec<Result<(), Fault>>);
        impl ProbeHandler for CallOnce {
            fn on_probe(&mut self, _hit: ProbeHit, ctx: &mut dyn ProbeContext) {
                // spinning routine, then a load from an unmapped pointer
                self.0.push(ctx.call_routine(0x400010, 0));
                self.0.push(ctx.call_routine(0x400020, 0x1234_5678_0000));
                self.0.push(ctx.call_routine(0x400030, 0));
            }
        }
        let mut code = vec![0x90; 0x40];
        code[..6].copy_from_slice(&[0xb8, 0x07, 0, 0, 0, 0xc3]); // mov eax, 7 ; ret
        code[0x10..0x12].copy_from_slice(&[0xeb, 0xfe]); // jmp $
        code[0x20..0x24].copy_from_slice(&[0x48, 0x8b, 0x07, 0xc3]); // mov rax, [rdi] ; ret
        code[0x30..0x33].copy_from_slice(&[0x31, 0xc0, 0xc3]); // xor eax, eax ; ret
        let image = VictimImage::from_raw("calls", 0x400000, code, &[]);
        let config = BackendConfig {
            call_budget: 1000,
            ..Default::default()
        };
        let mut backend = EmulatorBackend::new(Arc::new(image), &config).unwrap();
        backend.insert_probe(ProbePoint::Instruction(0x400005));

        let mut handler = CallOnce(Vec::new());
        let summary = backend.run(&mut handler).unwrap();

        assert!(matches!(
            &handler.0[0],
            Err(Fault::Crashed { reason, .. }) if reason.contains("did not return")
        ));
        assert!(matches!(handler.0[1], Err(Fault::Crashed { .. })));
        assert_eq!(handler.0[2], Ok(()));
        // registers of the interrupted victim are restored after every call
        assert_eq!(summary.exit_code, Some(7));
        assert!(summary.crash.is_none());
        assert_eq!(summary.instructions, 2);
    }
}
