use super::{EmulatorState, ProbeHit, ProbePoint, RegisterX86, Unicorn};
use log::{debug, error, warn};
use std::fs::OpenOptions;
use std::io::Write;

const SYS_WRITE: u64 = 1;
const SYS_GETPID: u64 = 39;
const SYS_EXIT: u64 = 60;
const SYS_EXIT_GROUP: u64 = 231;

const EBADF: i64 = 9;
const EFAULT: i64 = 14;
const ENOSYS: i64 = 38;
/// Largest `write` served in one call, longer requests are written partially
const MAX_WRITE: usize = 0x10_0000;
/// Length of the `syscall` instruction
const SYSCALL_SIZE: u64 = 2;
const VICTIM_PID: u64 = 1000;

fn stop(emu: &mut Unicorn<EmulatorState>) {
    if let Err(e) = emu.emu_stop() {
        error!("Failed to stop emulation: {e:?}");
    }
}

fn read_register(emu: &Unicorn<EmulatorState>, register: RegisterX86) -> u64 {
    emu.reg_read(register).unwrap_or_default()
}

fn set_return(emu: &mut Unicorn<EmulatorState>, value: i64) {
    if let Err(e) = emu.reg_write(RegisterX86::RAX, value as u64) {
        warn!("Failed to set syscall return value: {e:?}");
    }
}

/// Code hook for probes and the instruction budget
///
/// A probed instruction stops the emulation before it executes. The run loop
/// dispatches the hit and continues at the same address with the probe
/// skipped once.
pub fn hook_code_callback(emu: &mut Unicorn<EmulatorState>, address: u64, _size: u32) {
    let state = emu.get_data_mut();
    if state.in_call {
        return;
    }
    if state.skip_address.take() == Some(address) {
        return;
    }
    state.instructions += 1;
    if state.instructions > state.max_instructions {
        state.budget_exhausted = true;
        stop(emu);
        return;
    }
    if state.detached {
        return;
    }
    if let Some(probes) = state.probes.get(&address) {
        let hits: Vec<ProbeHit> = probes
            .iter()
            .map(|probe| ProbeHit {
                probe: *probe,
                point: ProbePoint::Instruction(address),
            })
            .collect();
        state.pending.extend(hits);
        stop(emu);
    }
}

/// Hook for the `syscall` instruction
///
/// Intercepted rendezvous calls return 0 and stop the emulation. The other
/// calls are emulated here.
pub fn hook_syscall_callback(emu: &mut Unicorn<EmulatorState>) {
    let number = read_register(emu, RegisterX86::RAX);
    let state = emu.get_data();
    if !state.in_call && !state.detached {
        if let Some(probes) = state.syscall_probes.get(&number) {
            let hits: Vec<ProbeHit> = probes
                .iter()
                .map(|probe| ProbeHit {
                    probe: *probe,
                    point: ProbePoint::Syscall(number),
                })
                .collect();
            let syscall_return = read_register(emu, RegisterX86::RIP) + SYSCALL_SIZE;
            let state = emu.get_data_mut();
            state.pending.extend(hits);
            state.syscall_return = Some(syscall_return);
            set_return(emu, 0);
            stop(emu);
            return;
        }
    }

    match number {
        SYS_WRITE => {
            let fd = read_register(emu, RegisterX86::RDI);
            let buffer = read_register(emu, RegisterX86::RSI);
            let length = read_register(emu, RegisterX86::RDX).min(MAX_WRITE as u64) as usize;
            let mut data = vec![0u8; length];
            if emu.mem_read(buffer, &mut data).is_err() {
                set_return(emu, -EFAULT);
                return;
            }
            let written = write_output(emu.get_data_mut(), fd, &data);
            set_return(emu, written);
        }
        SYS_GETPID => set_return(emu, VICTIM_PID as i64),
        SYS_EXIT | SYS_EXIT_GROUP => {
            let status = read_register(emu, RegisterX86::RDI) as i32;
            debug!("Victim exit({status})");
            emu.get_data_mut().exit_code = Some(status as i64);
            stop(emu);
        }
        _ => {
            debug!("Unsupported syscall {number}");
            set_return(emu, -ENOSYS);
        }
    }
}

/// Emulated `write`, returns the syscall result
fn write_output(state: &mut EmulatorState, fd: u64, data: &[u8]) -> i64 {
    match fd {
        1 | 2 => {
            if state.echo_output {
                let result = match fd {
                    1 => std::io::stdout().write_all(data),
                    _ => std::io::stderr().write_all(data),
                };
                if let Err(e) = result {
                    warn!("Victim output lost: {e}");
                }
            }
            data.len() as i64
        }
        fd if fd == state.handoff_fd => {
            let Some(path) = &state.handoff_file else {
                return -EBADF;
            };
            // First write of the run replaces any previous content
            let result = OpenOptions::new()
                .create(true)
                .write(true)
                .append(state.handoff_started)
                .truncate(!state.handoff_started)
                .open(path)
                .and_then(|mut file| file.write_all(data));
            match result {
                Ok(()) => {
                    state.handoff_started = true;
                    data.len() as i64
                }
                Err(e) => {
                    warn!("Handoff write to {} failed: {e}", path.display());
                    -EBADF
                }
            }
        }
        _ => -EBADF,
    }
}
