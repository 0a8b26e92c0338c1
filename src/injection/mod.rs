//! # Fault injection orchestration
//!
//! The [`Injector`] owns one [`SweepSession`] and receives every probe hit of
//! a backend run. It binds the configured program points, arms the session at
//! the trigger marker, flips at the target instruction, restores and advances
//! at the synchronization point and finally reports what happened.

pub mod guard;
pub mod mutation;
pub mod record;
pub mod session;
pub mod sync;
pub mod trigger;

use crate::handoff::{ChannelError, HandoffChannel};
use crate::instrumentation::{
    Fault, Instrumentation, ProbeContext, ProbeHandler, ProbeHit, Register, RunSummary,
};
use log::{debug, info, warn};
use mutation::{BitFlipEngine, Mutation, MutationError, MutationTarget, ReformatCall};
use record::{InjectionReport, ResultsFile, TrialLog, TrialOutcome, TrialRecord};
use session::{
    ConfigError, Phase, RestorePolicy, RestoreReport, SweepPlan, SweepSession, WORD_BITS,
};
use std::path::PathBuf;
use sync::{SyncMode, SyncProtocol};
use trigger::{InsPoint, Trigger, TriggerDetector, TriggerSites};

/// What is corrupted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Variant {
    /// Words of the array published through the handoff channel
    Memory {
        plan: SweepPlan,
        policy: RestorePolicy,
    },
    /// One register, flipped once per run at the `occurrence`-th execution of
    /// the target instruction within one invocation of the target routine
    Register {
        register: Register,
        bit: u32,
        occurrence: usize,
    },
}

/// Validated configuration of one injection run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectionConfig {
    pub variant: Variant,
    pub handoff_file: PathBuf,
    /// The handoff record must be readable before the run starts
    pub require_handoff: bool,
    pub trigger_marker: String,
    pub sync: Option<SyncMode>,
    pub target_routine: String,
    pub instruction_index: usize,
    pub point: InsPoint,
    pub reformat_routine: Option<String>,
    pub dry_run: bool,
    /// Register holding the distance metric at the sync point
    pub metric_register: Option<Register>,
    pub results_file: Option<PathBuf>,
    pub trial_log: Option<PathBuf>,
    /// Only this victim thread may change the injection state
    pub designated_thread: Option<u64>,
    pub detach_on_completion: bool,
}

impl InjectionConfig {
    /// Memory variant with the default marker names
    pub fn memory(plan: SweepPlan, handoff_file: impl Into<PathBuf>) -> Self {
        Self {
            variant: Variant::Memory {
                plan,
                policy: RestorePolicy::Full,
            },
            handoff_file: handoff_file.into(),
            require_handoff: false,
            trigger_marker: "addr_label".to_string(),
            sync: Some(SyncMode::Marker("sync_marker".to_string())),
            target_routine: "foo".to_string(),
            instruction_index: 0,
            point: InsPoint::Before,
            reformat_routine: None,
            dry_run: false,
            metric_register: None,
            results_file: None,
            trial_log: None,
            designated_thread: None,
            detach_on_completion: true,
        }
    }

    /// Register variant without synchronization point
    pub fn register(register: Register, bit: u32, target_routine: &str, index: usize) -> Self {
        Self {
            variant: Variant::Register {
                register,
                bit,
                occurrence: 0,
            },
            sync: None,
            target_routine: target_routine.to_string(),
            instruction_index: index,
            point: InsPoint::After,
            ..Self::memory(SweepPlan::Single { index: 0, bit: 0 }, PathBuf::new())
        }
    }

    /// Bits of one target value
    pub fn word_bits(&self) -> u32 {
        match &self.variant {
            Variant::Memory { .. } => WORD_BITS,
            Variant::Register { register, .. } => register.bits(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match &self.variant {
            Variant::Memory { plan, .. } => plan.validate(WORD_BITS)?,
            Variant::Register { register, bit, .. } => {
                if *bit >= register.bits() {
                    return Err(ConfigError::BitOutOfRange {
                        bit: *bit,
                        word_bits: register.bits(),
                    });
                }
            }
        }
        if self.target_routine.is_empty() {
            return Err(ConfigError::Invalid("target routine name is empty".into()));
        }
        Ok(())
    }
}

/// Fatal failure of an injection run
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InjectError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("handoff record required before instrumentation: {0}")]
    HandoffRequired(ChannelError),
    #[error("instrumentation backend failed: {0}")]
    Backend(Fault),
    #[error("output file: {0}")]
    Output(String),
}

/// Progress of the register variant
#[derive(Debug, Default)]
struct RegisterProgress {
    depth: usize,
    hits: usize,
}

/// Orchestrator of one injection run.
pub struct Injector {
    config: InjectionConfig,
    detector: TriggerDetector,
    session: SweepSession,
    engine: BitFlipEngine,
    sync: SyncProtocol,
    channel: HandoffChannel,
    register_progress: RegisterProgress,
    pending: Option<TrialRecord>,
    trials: Vec<TrialRecord>,
    errors: Vec<String>,
    fault_injected: bool,
    trial_log: Option<TrialLog>,
    results: Option<ResultsFile>,
}

impl Injector {
    /// Create an injector for the given configuration.
    ///
    /// # Arguments
    ///
    /// * `config` - Validated run configuration.
    ///
    /// # Returns
    ///
    /// * `Ok(Injector)` - Ready to run against a backend.
    /// * `Err(InjectError)` - Invalid configuration or output files not creatable.
    pub fn new(config: InjectionConfig) -> Result<Self, InjectError> {
        config.validate()?;
        let (plan, policy, memory_variant) = match &config.variant {
            Variant::Memory { plan, policy } => (*plan, *policy, true),
            Variant::Register { bit, .. } => (
                SweepPlan::Single { index: 0, bit: *bit },
                RestorePolicy::Full,
                false,
            ),
        };
        let session = SweepSession::new(plan, config.word_bits(), policy)?;
        let detector = TriggerDetector::new(TriggerSites {
            trigger_marker: memory_variant.then(|| config.trigger_marker.clone()),
            sync: config.sync.clone().filter(|_| memory_variant),
            target_routine: config.target_routine.clone(),
            instruction_index: config.instruction_index,
            point: config.point,
            track_routine: !memory_variant,
            reformat_routine: config.reformat_routine.clone(),
        });
        let trial_log = config
            .trial_log
            .as_deref()
            .map(TrialLog::create)
            .transpose()
            .map_err(|e| InjectError::Output(e.to_string()))?;
        let results = config
            .results_file
            .as_deref()
            .map(ResultsFile::open)
            .transpose()
            .map_err(|e| InjectError::Output(e.to_string()))?;

        Ok(Self {
            engine: BitFlipEngine::new(config.dry_run),
            sync: SyncProtocol::new(config.sync.clone(), config.detach_on_completion),
            channel: HandoffChannel::new(config.handoff_file.clone()),
            detector,
            session,
            register_progress: RegisterProgress::default(),
            pending: None,
            trials: Vec::new(),
            errors: Vec::new(),
            fault_injected: false,
            trial_log,
            results,
            config,
        })
    }

    pub fn session(&self) -> &SweepSession {
        &self.session
    }

    /// Bind all program points and run the victim to completion.
    pub fn run(
        mut self,
        backend: &mut dyn Instrumentation,
    ) -> Result<InjectionReport, InjectError> {
        if self.config.require_handoff && matches!(self.config.variant, Variant::Memory { .. }) {
            let record = self.channel.read().map_err(InjectError::HandoffRequired)?;
            self.session.set_record(record);
        }
        let errors: Vec<String> = self
            .detector
            .bind(backend)
            .iter()
            .map(|error| error.to_string())
            .collect();
        self.errors.extend(errors);
        info!(
            "{} probes bound, running victim",
            self.detector.probe_count()
        );

        let summary = backend.run(&mut self).map_err(InjectError::Backend)?;
        Ok(self.finish(summary))
    }

    fn finish(mut self, summary: RunSummary) -> InjectionReport {
        if let Some(record) = self.pending.take() {
            self.complete(record);
        }
        if !self.fault_injected {
            warn!(
                "No fault was injected into {}",
                self.config.target_routine
            );
        }
        let target = match &self.config.variant {
            Variant::Memory { .. } => self.config.target_routine.clone(),
            Variant::Register { register, .. } => MutationTarget::Register(*register).describe(),
        };
        InjectionReport {
            target,
            trials: self.trials,
            fault_injected: self.fault_injected,
            errors: self.errors,
            summary,
        }
    }

    fn complete(&mut self, record: TrialRecord) {
        info!("{record}");
        if let Some(log) = &mut self.trial_log {
            log.append(&record);
        }
        self.fault_injected |= record.injected();
        self.trials.push(record);
    }

    fn on_trigger_marker(&mut self, ctx: &mut dyn ProbeContext) {
        if self.session.phase() != Phase::Idle {
            debug!("Trigger marker hit again, ignored");
            return;
        }
        let record = match self.session.record() {
            Some(record) => record,
            None => match self.channel.read() {
                Ok(record) => record,
                Err(error) => {
                    warn!("Handoff channel not readable, sweep not armed: {error}");
                    self.errors.push(error.to_string());
                    return;
                }
            },
        };
        match self.session.arm(record, ctx) {
            Ok(()) => {
                info!(
                    "Armed at base 0x{:x}, {} trials",
                    record.base_address,
                    self.session.plan().trial_count(WORD_BITS)
                );
                self.sync.on_armed(ctx);
            }
            Err(fault) => {
                warn!("Snapshot of target words failed, sweep not armed: {fault}");
                self.errors.push(fault.to_string());
            }
        }
    }

    fn on_target_instruction(&mut self, ctx: &mut dyn ProbeContext) {
        if !self.session.ready() {
            return;
        }
        let cleanup = self.session.ensure_clean(ctx);
        let state = self.session.state();
        let reformat = self.detector.reformat_address().and_then(|routine| {
            let argument = self.session.record().and_then(|record| record.object_address);
            if argument.is_none() {
                warn!("Reformat routine known but no object address published, call skipped");
            }
            argument.map(|argument| ReformatCall { routine, argument })
        });
        let result = match self.session.target_address() {
            Ok(address) => self.engine.flip_word(ctx, address, state.bit, reformat),
            Err(fault) => Err(MutationError::Access(fault)),
        };
        self.session.mark_applied();

        let mut record = self.trial_record(result);
        record.inconsistent = cleanup.inconsistent;
        if self.config.sync.is_none() {
            // single-shot run without restore
            self.complete(record);
            self.session.advance();
        } else {
            self.pending = Some(record);
        }
    }

    fn trial_record(&self, result: Result<Mutation, MutationError>) -> TrialRecord {
        let state = self.session.state();
        let trial = self.trials.len();
        let (outcome, mutation) = match result {
            Ok(mutation) if mutation.written => (TrialOutcome::Applied, Some(mutation)),
            Ok(mutation) => (TrialOutcome::DryRun, Some(mutation)),
            Err(MutationError::Reformat {
                stage,
                fault,
                mutation,
            }) => (
                TrialOutcome::Crashed(format!("reformat {stage} flip: {fault}")),
                mutation,
            ),
            Err(MutationError::Access(fault)) => (TrialOutcome::Skipped(fault.to_string()), None),
        };
        let mut record = TrialRecord::new(trial, state.index, state.bit, outcome);
        record.mutation = mutation;
        record
    }

    fn on_sync(&mut self, ctx: &mut dyn ProbeContext) {
        match self.session.phase() {
            Phase::Idle => {
                debug!("Sync point before arming, ignored");
                return;
            }
            Phase::Done => {
                debug!("Sync point after completion, ignored");
                return;
            }
            Phase::Armed | Phase::Applied => {}
        }
        let state = self.session.state();
        let mut record = self.pending.take().unwrap_or_else(|| {
            warn!(
                "No mutation occurred in trial word {} bit {}",
                state.index, state.bit
            );
            TrialRecord::new(self.trials.len(), state.index, state.bit, TrialOutcome::Missed)
        });

        if let Some(register) = self.config.metric_register {
            let metric = match ctx.read_register(register) {
                Ok(bytes) => bytes
                    .get(..8)
                    .and_then(|bytes| bytes.try_into().ok())
                    .map(f64::from_le_bytes),
                Err(fault) => {
                    warn!("Metric register {register} not readable: {fault}");
                    None
                }
            };
            // One line per trial, a missing value keeps the file aligned
            if let Some(results) = &mut self.results {
                results.append(metric.unwrap_or(f64::NAN));
            }
            record.metric = metric;
        }

        let RestoreReport {
            restored,
            inconsistent,
            faults,
        } = self.session.restore(ctx);
        for (index, fault) in faults {
            warn!("Restore of word {index} failed: {fault}");
        }
        record.restored = restored;
        record.inconsistent.extend(inconsistent);
        self.complete(record);

        let phase = self.session.advance();
        let action = self.sync.action(phase);
        debug!("Advanced to {:?}, {action:?}", self.session.state());
        self.sync.apply(action, ctx);
    }

    fn on_register_instruction(&mut self, ctx: &mut dyn ProbeContext) {
        let Variant::Register {
            register,
            bit,
            occurrence,
        } = self.config.variant
        else {
            return;
        };
        let hit = self.register_progress.hits;
        self.register_progress.hits += 1;
        if self.session.phase() == Phase::Done || hit != occurrence {
            return;
        }
        let result = self.engine.flip_register(ctx, register, bit);
        let mut record = self.trial_record(result);
        record.index = hit;
        self.complete(record);
        self.session.mark_applied();
        self.session.advance();
    }

    fn on_routine_enter(&mut self) {
        let progress = &mut self.register_progress;
        if progress.depth == 0 {
            progress.hits = 0;
            info!("ENTER {}", self.config.target_routine);
        }
        progress.depth += 1;
    }

    fn on_routine_exit(&mut self) {
        let progress = &mut self.register_progress;
        progress.depth = progress.depth.saturating_sub(1);
        if progress.depth == 0 {
            info!("EXIT {}", self.config.target_routine);
        }
    }
}

impl ProbeHandler for Injector {
    fn on_probe(&mut self, hit: ProbeHit, ctx: &mut dyn ProbeContext) {
        if let Some(thread) = self.config.designated_thread {
            if ctx.thread_id() != thread {
                debug!("Probe {} on thread {} ignored", hit.probe, ctx.thread_id());
                return;
            }
        }
        let Some(trigger) = self.detector.trigger(hit.probe) else {
            return;
        };
        match (trigger, &self.config.variant) {
            (Trigger::ReadAddress, _) => self.on_trigger_marker(ctx),
            (Trigger::Mutate, Variant::Memory { .. }) => self.on_target_instruction(ctx),
            (Trigger::Mutate, Variant::Register { .. }) => self.on_register_instruction(ctx),
            (Trigger::Sync, _) => self.on_sync(ctx),
            (Trigger::RoutineEnter, _) => self.on_routine_enter(),
            (Trigger::RoutineExit, _) => self.on_routine_exit(),
        }
    }
}
