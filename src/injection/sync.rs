//! Synchronization and re-execution protocol.
//!
//! In marker mode the victim loops over the trials itself and calls the sync
//! marker once per trial. In syscall mode the victim runs the instrumented
//! region once. A checkpoint is taken when the session arms and every
//! interception of the rendezvous syscall rewinds the victim to it until the
//! sweep is complete.

use super::session::Phase;
use crate::instrumentation::ProbeContext;
use log::{debug, info, warn};
use std::fmt;

/// Synchronization point of a trial
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMode {
    /// Entry of the named marker routine
    Marker(String),
    /// Entry of the given system call, repurposed as rendezvous
    Syscall(u64),
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SyncMode::Marker(name) => write!(f, "marker {name}"),
            SyncMode::Syscall(number) => write!(f, "syscall {number}"),
        }
    }
}

/// What the victim does after a synchronization point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    /// Keep running, the victim starts the next trial on its own
    Continue,
    /// Rewind to the checkpoint for the next trial
    Resume,
    /// Sweep complete, run uninstrumented to the end
    Detach,
}

#[derive(Debug)]
pub struct SyncProtocol {
    mode: Option<SyncMode>,
    detach_on_completion: bool,
    checkpoint_saved: bool,
}

impl SyncProtocol {
    pub fn new(mode: Option<SyncMode>, detach_on_completion: bool) -> Self {
        Self {
            mode,
            detach_on_completion,
            checkpoint_saved: false,
        }
    }

    pub fn mode(&self) -> Option<&SyncMode> {
        self.mode.as_ref()
    }

    /// Called once the session armed. Saves the re-execution checkpoint in
    /// syscall mode.
    pub fn on_armed(&mut self, ctx: &mut dyn ProbeContext) {
        if !matches!(self.mode, Some(SyncMode::Syscall(_))) || self.checkpoint_saved {
            return;
        }
        match ctx.save_checkpoint() {
            Ok(()) => {
                debug!("Checkpoint saved");
                self.checkpoint_saved = true;
            }
            Err(fault) => warn!("Checkpoint could not be saved: {fault}"),
        }
    }

    /// Decide how to continue after the session advanced to `phase`
    pub fn action(&self, phase: Phase) -> SyncAction {
        match (phase, &self.mode) {
            (Phase::Done, _) if self.detach_on_completion => SyncAction::Detach,
            (Phase::Done, _) => SyncAction::Continue,
            (_, Some(SyncMode::Syscall(_))) if self.checkpoint_saved => SyncAction::Resume,
            _ => SyncAction::Continue,
        }
    }

    /// Apply the action to the suspended victim
    pub fn apply(&self, action: SyncAction, ctx: &mut dyn ProbeContext) {
        match action {
            SyncAction::Continue => {}
            SyncAction::Resume => {
                if let Err(fault) = ctx.resume_from_checkpoint() {
                    warn!("Resume from checkpoint failed: {fault}");
                }
            }
            SyncAction::Detach => {
                info!("Sweep complete, detaching");
                ctx.detach();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actions_by_mode() {
        let marker = SyncProtocol::new(Some(SyncMode::Marker("sync_marker".into())), true);
        assert_eq!(marker.action(Phase::Armed), SyncAction::Continue);
        assert_eq!(marker.action(Phase::Done), SyncAction::Detach);

        let mut syscall = SyncProtocol::new(Some(SyncMode::Syscall(39)), false);
        // no checkpoint yet, nothing to rewind to
        assert_eq!(syscall.action(Phase::Armed), SyncAction::Continue);
        syscall.checkpoint_saved = true;
        assert_eq!(syscall.action(Phase::Armed), SyncAction::Resume);
        assert_eq!(syscall.action(Phase::Done), SyncAction::Continue);
    }
}
