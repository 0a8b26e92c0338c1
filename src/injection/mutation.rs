//! Bit-flip mutation engine.

use super::guard::guarded;
use crate::instrumentation::{Fault, ProbeContext, Register};
use log::{debug, info};
use std::fmt;

/// Addresses below this value are rejected as obviously invalid.
///
/// This only catches null and near-null pointers, anything else is left to
/// checked access.
pub const LOW_ADDRESS_SENTINEL: u64 = 0x1000;

/// What a flip was applied to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationTarget {
    Word(u64),
    Register(Register),
}

impl fmt::Display for MutationTarget {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MutationTarget::Word(address) => write!(f, "0x{address:x}"),
            MutationTarget::Register(register) => write!(f, "{register}"),
        }
    }
}

/// Victim routine called around a word flip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReformatCall {
    pub routine: u64,
    pub argument: u64,
}

/// Value of the target before and after the flip, little endian
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub target: MutationTarget,
    pub bit: u32,
    pub before: Vec<u8>,
    pub after: Vec<u8>,
    /// False in dry-run mode
    pub written: bool,
}

impl Mutation {
    /// Number of bits differing between `before` and `after`
    pub fn flipped_bits(&self) -> u32 {
        self.before
            .iter()
            .zip(&self.after)
            .map(|(before, after)| (before ^ after).count_ones())
            .sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReformatStage {
    Before,
    After,
}

impl fmt::Display for ReformatStage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ReformatStage::Before => write!(f, "before"),
            ReformatStage::After => write!(f, "after"),
        }
    }
}

/// Failure of one mutation attempt
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MutationError {
    /// Target rejected or not accessible, nothing was written
    #[error("target not accessible: {0}")]
    Access(Fault),
    /// Reformat routine faulted. `mutation` is set if the flip itself happened.
    #[error("reformat call {stage} flip crashed: {fault}")]
    Reformat {
        stage: ReformatStage,
        fault: Fault,
        mutation: Option<Mutation>,
    },
}

/// Flip `bit` in a little endian byte buffer: byte `bit / 8`, bit `bit % 8`
pub fn flip_bit_in_bytes(bytes: &mut [u8], bit: u32) -> Result<(), Fault> {
    let byte = (bit / 8) as usize;
    match bytes.get_mut(byte) {
        Some(value) => {
            *value ^= 1 << (bit % 8);
            Ok(())
        }
        None => Err(Fault::BitOutOfRange {
            bit,
            bits: bytes.len() as u32 * 8,
        }),
    }
}

/// Weak validity check of a target address
pub fn check_address(address: u64) -> Result<(), Fault> {
    match address < LOW_ADDRESS_SENTINEL {
        true => Err(Fault::LowAddress(address)),
        false => Ok(()),
    }
}

/// Applies single bit flips through a probe context.
#[derive(Debug, Clone, Copy, Default)]
pub struct BitFlipEngine {
    dry_run: bool,
}

impl BitFlipEngine {
    pub fn new(dry_run: bool) -> Self {
        Self { dry_run }
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    fn reformat(
        &self,
        ctx: &mut dyn ProbeContext,
        call: ReformatCall,
        stage: ReformatStage,
    ) -> Result<(), Fault> {
        debug!(
            "Reformat 0x{:x}(0x{:x}) {stage} flip",
            call.routine, call.argument
        );
        guarded("reformat call", || {
            ctx.call_routine(call.routine, call.argument)
        })
    }

    /// Flip `bit` of the 64-bit word at `address`.
    ///
    /// With a reformat routine, it is called right before and right after the
    /// flip. In dry-run mode nothing is written and no routine is called.
    ///
    /// # Arguments
    ///
    /// * `ctx` - Context of the current probe hit.
    /// * `address` - Absolute address of the word.
    /// * `bit` - Bit position, must be below 64.
    /// * `reformat` - Optional routine bracketing the flip.
    ///
    /// # Returns
    ///
    /// * `Ok(Mutation)` - The word was flipped (or would have been in dry-run).
    /// * `Err(MutationError)` - The attempt was abandoned.
    pub fn flip_word(
        &self,
        ctx: &mut dyn ProbeContext,
        address: u64,
        bit: u32,
        reformat: Option<ReformatCall>,
    ) -> Result<Mutation, MutationError> {
        check_address(address).map_err(MutationError::Access)?;
        let reformat = reformat.filter(|_| !self.dry_run);

        if let Some(call) = reformat {
            self.reformat(ctx, call, ReformatStage::Before)
                .map_err(|fault| MutationError::Reformat {
                    stage: ReformatStage::Before,
                    fault,
                    mutation: None,
                })?;
        }

        let before = guarded("target read", || ctx.read_word(address))
            .map_err(MutationError::Access)?;
        let mut bytes = before.to_le_bytes();
        flip_bit_in_bytes(&mut bytes, bit).map_err(MutationError::Access)?;
        let after = u64::from_le_bytes(bytes);

        if !self.dry_run {
            guarded("target write", || ctx.write_word(address, after))
                .map_err(MutationError::Access)?;
        }
        let mutation = Mutation {
            target: MutationTarget::Word(address),
            bit,
            before: before.to_le_bytes().to_vec(),
            after: bytes.to_vec(),
            written: !self.dry_run,
        };
        info!(
            "Flip bit {bit} at 0x{address:x}: 0x{before:016x} -> 0x{after:016x}{}",
            if self.dry_run { " (dry-run)" } else { "" }
        );

        if let Some(call) = reformat {
            self.reformat(ctx, call, ReformatStage::After)
                .map_err(|fault| MutationError::Reformat {
                    stage: ReformatStage::After,
                    fault,
                    mutation: Some(mutation.clone()),
                })?;
        }
        Ok(mutation)
    }

    /// Flip `bit` of `register`. Vector registers are flipped byte wise.
    pub fn flip_register(
        &self,
        ctx: &mut dyn ProbeContext,
        register: Register,
        bit: u32,
    ) -> Result<Mutation, MutationError> {
        let before = guarded("register read", || ctx.read_register(register))
            .map_err(MutationError::Access)?;
        let mut after = before.clone();
        flip_bit_in_bytes(&mut after, bit).map_err(MutationError::Access)?;
        if !self.dry_run {
            guarded("register write", || ctx.write_register(register, &after))
                .map_err(MutationError::Access)?;
        }
        info!(
            "Flip bit {bit} of {register}: {} -> {}",
            hex_bytes(&before),
            hex_bytes(&after)
        );
        Ok(Mutation {
            target: MutationTarget::Register(register),
            bit,
            before,
            after,
            written: !self.dry_run,
        })
    }
}

/// Hex representation of a little endian value, most significant byte first
pub fn hex_bytes(bytes: &[u8]) -> String {
    let digits: String = bytes.iter().rev().map(|byte| format!("{byte:02x}")).collect();
    format!("0x{digits}")
}
