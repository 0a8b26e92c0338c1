//! # Sweep session
//!
//! Owns all mutable state of one sweep: the plan, the current trial, the
//! snapshot of the clean words and the set of words mutated since the last
//! restore. The session never touches the victim directly, memory access is
//! passed in through [`WordMemory`].

use crate::handoff::{HandoffRecord, WORD_SIZE};
use crate::instrumentation::{Fault, ProbeContext};
use itertools::iproduct;
use log::{debug, warn};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::ops::Range;

/// Bits of one data word
pub const WORD_BITS: u32 = (WORD_SIZE * 8) as u32;

/// Largest word range a plan may cover, 8 MiB of data words
pub const MAX_WORDS: usize = 1 << 20;

/// Word granular access to the victim
pub trait WordMemory {
    fn load(&mut self, address: u64) -> Result<u64, Fault>;
    fn store(&mut self, address: u64, value: u64) -> Result<(), Fault>;
}

impl<'a> WordMemory for dyn ProbeContext + 'a {
    fn load(&mut self, address: u64) -> Result<u64, Fault> {
        self.read_word(address)
    }

    fn store(&mut self, address: u64, value: u64) -> Result<(), Fault> {
        self.write_word(address, value)
    }
}

/// Which words are checked and rewritten at the end of a trial.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RestorePolicy {
    /// Every word of the sweep range. Correct for any reformat routine.
    #[default]
    Full,
    /// Only words in the modified set. Correct only if the reformat routine
    /// never writes a word other than the mutated one.
    Selective,
}

/// Trial space of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepPlan {
    /// Every bit of every word in `[0, width)`
    Sweep { width: usize },
    /// One trial only
    Single { index: usize, bit: u32 },
}

impl SweepPlan {
    /// Word indices covered by the snapshot
    pub fn words(&self) -> Range<usize> {
        match self {
            SweepPlan::Sweep { width } => 0..*width,
            SweepPlan::Single { index, .. } => *index..index + 1,
        }
    }

    /// Check the plan against the word size and the range limit
    pub fn validate(&self, word_bits: u32) -> Result<(), ConfigError> {
        match *self {
            SweepPlan::Sweep { width: 0 } => Err(ConfigError::EmptySweep),
            SweepPlan::Sweep { width } if width > MAX_WORDS => Err(ConfigError::WordRange {
                words: width,
                max: MAX_WORDS,
            }),
            SweepPlan::Single { index, .. } if index >= MAX_WORDS => {
                Err(ConfigError::WordRange {
                    words: index.saturating_add(1),
                    max: MAX_WORDS,
                })
            }
            SweepPlan::Single { bit, .. } if bit >= word_bits => {
                Err(ConfigError::BitOutOfRange { bit, word_bits })
            }
            _ => Ok(()),
        }
    }

    pub fn first(&self) -> (usize, u32) {
        match self {
            SweepPlan::Sweep { .. } => (0, 0),
            SweepPlan::Single { index, bit } => (*index, *bit),
        }
    }

    pub fn trial_count(&self, word_bits: u32) -> usize {
        match self {
            SweepPlan::Sweep { width } => width * word_bits as usize,
            SweepPlan::Single { .. } => 1,
        }
    }

    /// All trials in execution order: bit fastest, word index slowest
    pub fn trials(&self, word_bits: u32) -> Vec<(usize, u32)> {
        match self {
            SweepPlan::Sweep { width } => iproduct!(0..*width, 0..word_bits).collect(),
            SweepPlan::Single { index, bit } => vec![(*index, *bit)],
        }
    }
}

/// Current trial
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrialState {
    pub index: usize,
    pub bit: u32,
    pub armed: bool,
    pub applied: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Armed,
    Applied,
    Done,
}

/// Result of one restore step
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Words written back to their snapshot value
    pub restored: Vec<usize>,
    /// Words that diverged without being mutated by the engine
    pub inconsistent: Vec<usize>,
    /// Words that could not be accessed
    pub faults: Vec<(usize, Fault)>,
}

/// Configuration error of a sweep
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("bit position {bit} out of range for {word_bits} bit words")]
    BitOutOfRange { bit: u32, word_bits: u32 },
    #[error("sweep width must be at least one word")]
    EmptySweep,
    #[error("plan covers {words} words, at most {max} are supported")]
    WordRange { words: usize, max: usize },
    #[error("invalid option: {0}")]
    Invalid(String),
}

/// State of one sweep.
#[derive(Debug)]
pub struct SweepSession {
    plan: SweepPlan,
    word_bits: u32,
    policy: RestorePolicy,
    state: TrialState,
    phase: Phase,
    record: Option<HandoffRecord>,
    snapshot: Vec<u64>,
    modified: BTreeSet<usize>,
    completed: usize,
}

impl SweepSession {
    /// Create an idle session, validating the plan against the word size.
    pub fn new(
        plan: SweepPlan,
        word_bits: u32,
        policy: RestorePolicy,
    ) -> Result<Self, ConfigError> {
        plan.validate(word_bits)?;
        let (index, bit) = plan.first();
        Ok(Self {
            plan,
            word_bits,
            policy,
            state: TrialState {
                index,
                bit,
                ..Default::default()
            },
            phase: Phase::Idle,
            record: None,
            snapshot: Vec::new(),
            modified: BTreeSet::new(),
            completed: 0,
        })
    }

    pub fn plan(&self) -> SweepPlan {
        self.plan
    }

    pub fn policy(&self) -> RestorePolicy {
        self.policy
    }

    pub fn state(&self) -> TrialState {
        self.state
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn record(&self) -> Option<HandoffRecord> {
        self.record
    }

    /// The handoff record has been read
    pub fn address_read(&self) -> bool {
        self.record.is_some()
    }

    /// Store the handoff record without arming
    pub fn set_record(&mut self, record: HandoffRecord) {
        self.record = Some(record);
    }

    /// Number of finished trials
    pub fn completed(&self) -> usize {
        self.completed
    }

    pub fn snapshot(&self) -> &[u64] {
        &self.snapshot
    }

    /// Snapshot value of word `index`
    pub fn snapshot_word(&self, index: usize) -> Option<u64> {
        let first = self.plan.words().start;
        index
            .checked_sub(first)
            .and_then(|offset| self.snapshot.get(offset))
            .copied()
    }

    fn address(&self, index: usize) -> Result<u64, Fault> {
        let record = self.record.ok_or(Fault::Unmapped(0))?;
        record
            .target_address(index)
            .ok_or(Fault::Unmapped(record.base_address))
    }

    /// Address of the word under test
    pub fn target_address(&self) -> Result<u64, Fault> {
        self.address(self.state.index)
    }

    /// Transition `Idle -> Armed`.
    ///
    /// Captures the snapshot of every word of the plan. On a fault the session
    /// stays idle and the next trigger may try again.
    pub fn arm<M: WordMemory + ?Sized>(
        &mut self,
        record: HandoffRecord,
        memory: &mut M,
    ) -> Result<(), Fault> {
        if self.phase != Phase::Idle {
            debug!("Session already armed, trigger ignored");
            return Ok(());
        }
        self.record = Some(record);
        let mut snapshot = Vec::with_capacity(self.plan.words().len());
        for index in self.plan.words() {
            snapshot.push(memory.load(self.address(index)?)?);
        }
        self.snapshot = snapshot;
        self.modified.clear();
        let (index, bit) = self.plan.first();
        self.state = TrialState {
            index,
            bit,
            armed: true,
            applied: false,
        };
        self.phase = Phase::Armed;
        debug!(
            "Armed: {} words from 0x{:x}",
            self.snapshot.len(),
            record.base_address
        );
        Ok(())
    }

    /// Mutation may proceed in the current cycle
    pub fn ready(&self) -> bool {
        self.state.armed && !self.state.applied && self.plan.words().contains(&self.state.index)
    }

    /// Transition `Armed -> Applied`. The word under test joins the modified
    /// set even if the mutation was abandoned, it may be partially written.
    pub fn mark_applied(&mut self) {
        self.state.applied = true;
        self.modified.insert(self.state.index);
        self.phase = Phase::Applied;
    }

    /// Bring every word of the range back to its snapshot value before a flip.
    ///
    /// Words that diverge at this point were changed by the victim itself.
    pub fn ensure_clean<M: WordMemory + ?Sized>(&mut self, memory: &mut M) -> RestoreReport {
        self.restore_range(memory, self.plan.words().collect())
    }

    /// Restore step at the end of a trial, according to the restore policy.
    pub fn restore<M: WordMemory + ?Sized>(&mut self, memory: &mut M) -> RestoreReport {
        let indices = match self.policy {
            RestorePolicy::Full => self.plan.words().collect(),
            RestorePolicy::Selective => self.modified.iter().copied().collect(),
        };
        let report = self.restore_range(memory, indices);
        self.modified.clear();
        report
    }

    fn restore_range<M: WordMemory + ?Sized>(
        &mut self,
        memory: &mut M,
        indices: Vec<usize>,
    ) -> RestoreReport {
        let mut report = RestoreReport::default();
        for index in indices {
            let (Ok(address), Some(original)) = (self.address(index), self.snapshot_word(index))
            else {
                continue;
            };
            let live = match memory.load(address) {
                Ok(live) => live,
                Err(fault) => {
                    report.faults.push((index, fault));
                    continue;
                }
            };
            if live == original {
                continue;
            }
            if !self.modified.contains(&index) {
                warn!(
                    "Word {index} at 0x{address:x} diverged from snapshot: 0x{live:016x} != 0x{original:016x}, overwriting"
                );
                report.inconsistent.push(index);
            }
            match memory.store(address, original) {
                Ok(()) => report.restored.push(index),
                Err(fault) => report.faults.push((index, fault)),
            }
        }
        report
    }

    /// Advance to the next trial in row-major order.
    ///
    /// Returns the new phase, `Phase::Done` after the last trial.
    pub fn advance(&mut self) -> Phase {
        if self.phase == Phase::Done {
            return Phase::Done;
        }
        self.completed += 1;
        let next = match self.plan {
            SweepPlan::Single { .. } => None,
            SweepPlan::Sweep { width } => {
                let mut index = self.state.index;
                let mut bit = self.state.bit + 1;
                if bit == self.word_bits {
                    bit = 0;
                    index += 1;
                }
                (index < width).then_some((index, bit))
            }
        };
        match next {
            Some((index, bit)) => {
                self.state = TrialState {
                    index,
                    bit,
                    armed: true,
                    applied: false,
                };
                self.phase = Phase::Armed;
            }
            None => {
                self.state.armed = false;
                self.phase = Phase::Done;
            }
        }
        self.phase
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Word memory backed by a map, counting stores
    #[derive(Default)]
    struct TestMemory {
        words: HashMap<u64, u64>,
        stores: usize,
    }

    impl WordMemory for TestMemory {
        fn load(&mut self, address: u64) -> Result<u64, Fault> {
            self.words.get(&address).copied().ok_or(Fault::Unmapped(address))
        }

        fn store(&mut self, address: u64, value: u64) -> Result<(), Fault> {
            self.stores += 1;
            match self.words.get_mut(&address) {
                Some(word) => {
                    *word = value;
                    Ok(())
                }
                None => Err(Fault::Unmapped(address)),
            }
        }
    }

    const BASE: u64 = 0x5000;

    fn memory_with(words: &[u64]) -> TestMemory {
        let mut memory = TestMemory::default();
        for (index, word) in words.iter().enumerate() {
            memory.words.insert(BASE + index as u64 * 8, *word);
        }
        memory
    }

    fn record() -> HandoffRecord {
        HandoffRecord {
            object_address: None,
            base_address: BASE,
        }
    }

    #[test]
    fn rejects_invalid_plans() {
        assert_eq!(
            SweepSession::new(SweepPlan::Sweep { width: 0 }, 64, RestorePolicy::Full).unwrap_err(),
            ConfigError::EmptySweep
        );
        assert_eq!(
            SweepSession::new(SweepPlan::Single { index: 0, bit: 64 }, 64, RestorePolicy::Full)
                .unwrap_err(),
            ConfigError::BitOutOfRange {
                bit: 64,
                word_bits: 64
            }
        );
        assert_eq!(
            SweepSession::new(SweepPlan::Sweep { width: usize::MAX }, 64, RestorePolicy::Full)
                .unwrap_err(),
            ConfigError::WordRange {
                words: usize::MAX,
                max: MAX_WORDS
            }
        );
        let single = SweepPlan::Single {
            index: usize::MAX,
            bit: 0,
        };
        assert!(matches!(
            single.validate(64),
            Err(ConfigError::WordRange { .. })
        ));
        assert!(SweepPlan::Sweep { width: MAX_WORDS }.validate(64).is_ok());
    }

    #[test]
    fn advance_visits_every_pair_in_row_major_order() {
        let plan = SweepPlan::Sweep { width: 3 };
        let mut session = SweepSession::new(plan, 8, RestorePolicy::Full).unwrap();
        let mut memory = memory_with(&[0; 3]);
        session.arm(record(), &mut memory).unwrap();

        let mut visited = vec![(session.state().index, session.state().bit)];
        while session.advance() != Phase::Done {
            visited.push((session.state().index, session.state().bit));
        }
        assert_eq!(visited, plan.trials(8));
        assert_eq!(visited.len(), plan.trial_count(8));
        assert_eq!(visited[..3], [(0, 0), (0, 1), (0, 2)]);
        assert_eq!(visited[8], (1, 0));
        assert_eq!(session.completed(), 24);
        assert!(!session.ready());
        // done is terminal
        assert_eq!(session.advance(), Phase::Done);
        assert_eq!(session.completed(), 24);
    }

    #[test]
    fn single_plan_runs_one_trial() {
        let plan = SweepPlan::Single { index: 2, bit: 17 };
        let mut session = SweepSession::new(plan, 64, RestorePolicy::Full).unwrap();
        let mut memory = memory_with(&[1, 2, 3]);
        session.arm(record(), &mut memory).unwrap();
        assert_eq!(session.snapshot(), &[3]);
        assert_eq!(session.target_address(), Ok(BASE + 16));
        assert!(session.ready());
        session.mark_applied();
        assert!(!session.ready());
        assert_eq!(session.advance(), Phase::Done);
    }

    #[test]
    fn arm_is_only_taken_once() {
        let mut session =
            SweepSession::new(SweepPlan::Sweep { width: 2 }, 64, RestorePolicy::Full).unwrap();
        let mut memory = memory_with(&[10, 20]);
        session.arm(record(), &mut memory).unwrap();
        session.advance();
        memory.words.insert(BASE, 99);
        session.arm(record(), &mut memory).unwrap();
        assert_eq!(session.snapshot(), &[10, 20]);
        assert_eq!(session.state().bit, 1);
    }

    #[test]
    fn failed_snapshot_keeps_session_idle() {
        let mut session =
            SweepSession::new(SweepPlan::Sweep { width: 4 }, 64, RestorePolicy::Full).unwrap();
        let mut memory = memory_with(&[1, 2]);
        assert_eq!(
            session.arm(record(), &mut memory),
            Err(Fault::Unmapped(BASE + 16))
        );
        assert_eq!(session.phase(), Phase::Idle);
        assert!(!session.ready());
    }

    #[test]
    fn full_restore_repairs_every_word() {
        let mut session =
            SweepSession::new(SweepPlan::Sweep { width: 3 }, 64, RestorePolicy::Full).unwrap();
        let mut memory = memory_with(&[7, 8, 9]);
        session.arm(record(), &mut memory).unwrap();

        // engine flips word 0, the victim rewrites word 2
        session.mark_applied();
        memory.words.insert(BASE, 7 ^ 1);
        memory.words.insert(BASE + 16, 1234);

        let report = session.restore(&mut memory);
        assert_eq!(report.restored, vec![0, 2]);
        assert_eq!(report.inconsistent, vec![2]);
        assert!(report.faults.is_empty());
        for (index, word) in [7, 8, 9].iter().enumerate() {
            assert_eq!(memory.words[&(BASE + index as u64 * 8)], *word);
        }
    }

    #[test]
    fn selective_restore_only_touches_modified_words() {
        let mut session =
            SweepSession::new(SweepPlan::Sweep { width: 3 }, 64, RestorePolicy::Selective)
                .unwrap();
        let mut memory = memory_with(&[7, 8, 9]);
        session.arm(record(), &mut memory).unwrap();

        session.mark_applied();
        memory.words.insert(BASE, 7 ^ (1 << 63));
        let report = session.restore(&mut memory);
        assert_eq!(report.restored, vec![0]);
        assert_eq!(memory.stores, 1);
        assert_eq!(memory.words[&BASE], 7);

        // nothing modified, nothing checked
        let report = session.restore(&mut memory);
        assert_eq!(report, RestoreReport::default());
    }

    #[test]
    fn ensure_clean_flags_victim_writes() {
        let mut session =
            SweepSession::new(SweepPlan::Sweep { width: 2 }, 64, RestorePolicy::Full).unwrap();
        let mut memory = memory_with(&[5, 6]);
        session.arm(record(), &mut memory).unwrap();
        memory.words.insert(BASE + 8, 0);
        let report = session.ensure_clean(&mut memory);
        assert_eq!(report.inconsistent, vec![1]);
        assert_eq!(memory.words[&(BASE + 8)], 6);
    }
}
