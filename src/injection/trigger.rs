//! Trigger detector: binds probes to marker routines, to entry and exit of
//! the target routine and to one static instruction of the target routine.

use super::sync::SyncMode;
use crate::disassembly::ControlFlow;
use crate::handoff::ChannelError;
use crate::instrumentation::{
    Fault, ImageInfo, InstructionInfo, Instrumentation, ProbeId, ProbePoint, RoutineInfo,
};
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};

/// Which side of the target instruction the probe sits on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum InsPoint {
    #[default]
    Before,
    /// At the instruction following the target, only valid for fall through
    /// instructions
    After,
}

/// Meaning of a probe hit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Trigger marker: read the handoff record and arm
    ReadAddress,
    /// Target instruction: mutate
    Mutate,
    /// Synchronization point: restore and advance
    Sync,
    RoutineEnter,
    RoutineExit,
}

/// Failure to bind a configured program point
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("symbol {0} not found in any image")]
    SymbolNotFound(String),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("instruction {index} of {routine} ({mnemonic}) does not fall through, no point after it")]
    NotValidAfter {
        routine: String,
        index: usize,
        mnemonic: String,
    },
    #[error("routine {routine} could not be decoded: {fault}")]
    Decode { routine: String, fault: Fault },
}

/// Program points to bind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerSites {
    /// Marker announcing a readable handoff record
    pub trigger_marker: Option<String>,
    pub sync: Option<SyncMode>,
    pub target_routine: String,
    pub instruction_index: usize,
    pub point: InsPoint,
    /// Bind probes on entry and exit of the target routine
    pub track_routine: bool,
    /// Routine whose address is resolved but never probed
    pub reformat_routine: Option<String>,
}

/// Resolve the probe address of instruction `index` of a routine.
pub fn resolve_instruction(
    routine: &str,
    instructions: &[InstructionInfo],
    index: usize,
    point: InsPoint,
) -> Result<u64, ResolveError> {
    let instruction = instructions
        .get(index)
        .ok_or_else(|| ChannelError::InstructionIndexOutOfRange {
            routine: routine.to_string(),
            index,
            count: instructions.len(),
        })?;
    match point {
        InsPoint::Before => Ok(instruction.address),
        InsPoint::After if instruction.flow.falls_through() => Ok(instruction.next_address()),
        InsPoint::After => Err(ResolveError::NotValidAfter {
            routine: routine.to_string(),
            index,
            mnemonic: instruction.mnemonic.clone(),
        }),
    }
}

/// Maps probe ids to triggers. Binding is idempotent per symbol name.
#[derive(Debug)]
pub struct TriggerDetector {
    sites: TriggerSites,
    triggers: HashMap<ProbeId, Trigger>,
    bound: HashSet<String>,
    reformat_address: Option<u64>,
    errors: Vec<ResolveError>,
}

impl TriggerDetector {
    pub fn new(sites: TriggerSites) -> Self {
        Self {
            sites,
            triggers: HashMap::new(),
            bound: HashSet::new(),
            reformat_address: None,
            errors: Vec::new(),
        }
    }

    pub fn trigger(&self, probe: ProbeId) -> Option<Trigger> {
        self.triggers.get(&probe).copied()
    }

    pub fn reformat_address(&self) -> Option<u64> {
        self.reformat_address
    }

    /// Resolution errors collected during binding
    pub fn errors(&self) -> &[ResolveError] {
        &self.errors
    }

    /// Number of bound probes
    pub fn probe_count(&self) -> usize {
        self.triggers.len()
    }

    /// Symbol names that are expected to resolve
    fn wanted(&self) -> Vec<String> {
        let mut names = vec![self.sites.target_routine.clone()];
        names.extend(self.sites.trigger_marker.clone());
        if let Some(SyncMode::Marker(name)) = &self.sites.sync {
            names.push(name.clone());
        }
        names.extend(self.sites.reformat_routine.clone());
        names
    }

    fn insert(&mut self, backend: &mut dyn Instrumentation, point: ProbePoint, trigger: Trigger) {
        let probe = backend.insert_probe(point);
        debug!("Probe {probe} at {point:x?} -> {trigger:?}");
        self.triggers.insert(probe, trigger);
    }

    /// Enumerate all images once and bind every configured program point.
    ///
    /// Returns the resolution errors, which are also kept for the report.
    /// Unresolved points simply stay unbound.
    pub fn bind(&mut self, backend: &mut dyn Instrumentation) -> &[ResolveError] {
        if let Some(SyncMode::Syscall(number)) = self.sites.sync {
            if self.bound.insert(format!("syscall {number}")) {
                self.insert(backend, ProbePoint::Syscall(number), Trigger::Sync);
            }
        }
        for image in backend.images() {
            self.bind_image(backend, &image);
        }
        for name in self.wanted() {
            if !self.bound.contains(&name) {
                warn!("Symbol {name} not found, no instrumentation installed for it");
                self.errors.push(ResolveError::SymbolNotFound(name));
            }
        }
        &self.errors
    }

    fn bind_image(&mut self, backend: &mut dyn Instrumentation, image: &ImageInfo) {
        for routine in &image.routines {
            if self.bound.contains(&routine.name) {
                continue;
            }
            let name = routine.name.as_str();
            if Some(name) == self.sites.trigger_marker.as_deref() {
                self.insert(
                    backend,
                    ProbePoint::Instruction(routine.address),
                    Trigger::ReadAddress,
                );
            } else if matches!(&self.sites.sync, Some(SyncMode::Marker(sync)) if sync == name) {
                self.insert(backend, ProbePoint::Instruction(routine.address), Trigger::Sync);
            } else if Some(name) == self.sites.reformat_routine.as_deref() {
                self.reformat_address = Some(routine.address);
            } else if name == self.sites.target_routine {
                if let Err(error) = self.bind_target(backend, routine) {
                    // Resolved but unusable, not searched for in later images
                    warn!("Target {name} not instrumented: {error}");
                    self.errors.push(error);
                    self.bound.insert(routine.name.clone());
                    continue;
                }
            } else {
                continue;
            }
            info!(
                "Bound {} at 0x{:x} in image {}",
                routine.name, routine.address, image.name
            );
            self.bound.insert(routine.name.clone());
        }
    }

    fn bind_target(
        &mut self,
        backend: &mut dyn Instrumentation,
        routine: &RoutineInfo,
    ) -> Result<(), ResolveError> {
        let instructions =
            backend
                .routine_instructions(routine)
                .map_err(|fault| ResolveError::Decode {
                    routine: routine.name.clone(),
                    fault,
                })?;
        let address = resolve_instruction(
            &routine.name,
            &instructions,
            self.sites.instruction_index,
            self.sites.point,
        )?;
        if self.sites.track_routine {
            self.insert(backend, ProbePoint::Instruction(routine.address), Trigger::RoutineEnter);
            for exit in instructions
                .iter()
                .filter(|instruction| instruction.flow == ControlFlow::Return)
            {
                self.insert(backend, ProbePoint::Instruction(exit.address), Trigger::RoutineExit);
            }
        }
        debug!(
            "Target instruction {} of {}: 0x{address:x}",
            self.sites.instruction_index, routine.name
        );
        self.insert(backend, ProbePoint::Instruction(address), Trigger::Mutate);
        Ok(())
    }
}
