use super::mutation::{hex_bytes, Mutation, MutationTarget};
use crate::instrumentation::RunSummary;
use colored::Colorize;
use log::warn;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

/// How a trial ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrialOutcome {
    /// Exactly one bit was flipped in the live target
    Applied,
    /// Dry-run, the flip was computed but not written
    DryRun,
    /// Victim code crashed on the corrupted value (reformat routine)
    Crashed(String),
    /// Target could not be accessed, nothing was written
    Skipped(String),
    /// The target instruction was never reached during the trial
    Missed,
}

impl fmt::Display for TrialOutcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TrialOutcome::Applied => write!(f, "applied"),
            TrialOutcome::DryRun => write!(f, "dry-run"),
            TrialOutcome::Crashed(reason) => write!(f, "crashed ({reason})"),
            TrialOutcome::Skipped(reason) => write!(f, "skipped ({reason})"),
            TrialOutcome::Missed => write!(f, "missed"),
        }
    }
}

/// One row of the trial log
#[derive(Debug, Clone, PartialEq)]
pub struct TrialRecord {
    /// Position in the sweep order
    pub trial: usize,
    pub index: usize,
    pub bit: u32,
    pub mutation: Option<Mutation>,
    pub outcome: TrialOutcome,
    /// Words restored at the end of the trial
    pub restored: Vec<usize>,
    /// Words found diverging without an engine mutation
    pub inconsistent: Vec<usize>,
    /// Distance metric read at the sync point
    pub metric: Option<f64>,
}

impl TrialRecord {
    pub fn new(trial: usize, index: usize, bit: u32, outcome: TrialOutcome) -> Self {
        Self {
            trial,
            index,
            bit,
            mutation: None,
            outcome,
            restored: Vec::new(),
            inconsistent: Vec::new(),
            metric: None,
        }
    }

    /// Number of bits the live target differed from its clean value after the flip
    pub fn flipped_bits(&self) -> u32 {
        self.mutation
            .as_ref()
            .map(|mutation| mutation.flipped_bits())
            .unwrap_or_default()
    }

    pub fn injected(&self) -> bool {
        matches!(self.outcome, TrialOutcome::Applied | TrialOutcome::Crashed(_))
            && self.mutation.as_ref().is_some_and(|mutation| mutation.written)
    }
}

impl fmt::Display for TrialRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "trial {} word {} bit {}", self.trial, self.index, self.bit)?;
        if let Some(mutation) = &self.mutation {
            write!(
                f,
                " at {}: {} -> {}",
                mutation.target,
                hex_bytes(&mutation.before),
                hex_bytes(&mutation.after)
            )?;
        }
        write!(f, " {}", self.outcome)?;
        if !self.restored.is_empty() {
            write!(f, ", restored {:?}", self.restored)?;
        }
        if let Some(metric) = self.metric {
            write!(f, ", metric {metric}")?;
        }
        Ok(())
    }
}

/// Result of one injection run
#[derive(Debug, Clone, PartialEq)]
pub struct InjectionReport {
    pub target: String,
    pub trials: Vec<TrialRecord>,
    pub fault_injected: bool,
    /// Resolution and channel problems seen during the run
    pub errors: Vec<String>,
    pub summary: RunSummary,
}

impl InjectionReport {
    pub fn crashed_trials(&self) -> usize {
        self.trials
            .iter()
            .filter(|trial| matches!(trial.outcome, TrialOutcome::Crashed(_)))
            .count()
    }

    /// Machine readable summary line
    pub fn summary_line(&self) -> String {
        format!(
            "SUMMARY: Target={} FaultInjected={}",
            self.target,
            if self.fault_injected { "YES" } else { "NO" }
        )
    }

    /// Pretty print the report
    pub fn print(&self) {
        println!("\nTrials executed: {}", self.trials.len());
        for trial in &self.trials {
            let line = trial.to_string();
            match trial.outcome {
                TrialOutcome::Applied | TrialOutcome::DryRun => println!("{}", line.green()),
                TrialOutcome::Crashed(_) => println!("{}", line.red()),
                TrialOutcome::Skipped(_) | TrialOutcome::Missed => println!("{}", line.yellow()),
            }
        }
        for error in &self.errors {
            println!("{}", error.yellow());
        }
        if let Some(crash) = &self.summary.crash {
            println!("{}", format!("Victim crashed: {crash}").red());
        }
        if let Some(code) = self.summary.exit_code {
            println!("Victim exit code: {code}");
        }
        let line = self.summary_line();
        match self.fault_injected {
            true => println!("{}", line.green()),
            false => println!("{}", line.red()),
        }
    }
}

impl MutationTarget {
    /// Short description used in the summary line
    pub fn describe(&self) -> String {
        match self {
            MutationTarget::Word(address) => format!("word@0x{address:x}"),
            MutationTarget::Register(register) => register.to_string(),
        }
    }
}

/// Appends finished trials to a text file, one line each.
pub struct TrialLog {
    writer: BufWriter<File>,
}

impl TrialLog {
    pub fn create(path: &Path) -> std::io::Result<Self> {
        Ok(Self {
            writer: BufWriter::new(File::create(path)?),
        })
    }

    pub fn append(&mut self, record: &TrialRecord) {
        if let Err(e) = writeln!(self.writer, "{record}").and_then(|_| self.writer.flush()) {
            warn!("Trial log write failed: {e}");
        }
    }
}

/// Appends one metric value per trial, in sweep order.
pub struct ResultsFile {
    file: File,
}

impl ResultsFile {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }

    pub fn append(&mut self, value: f64) {
        if let Err(e) = writeln!(self.file, "{value}") {
            warn!("Results file write failed: {e}");
        }
    }
}
