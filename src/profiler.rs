//! # Instruction category profiler
//!
//! Counts executed arithmetic and vector instructions per routine and
//! category between hits of a start and an end marker routine. Every
//! classified instruction of every routine gets a probe, routines whose name
//! matches the exclusion pattern are skipped.

use crate::disassembly::InstructionCategory;
use crate::instrumentation::{
    Fault, Instrumentation, ProbeContext, ProbeHandler, ProbeHit, ProbeId, ProbePoint, RunSummary,
};
use colored::Colorize;
use log::{debug, info, warn};
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

pub const CSV_HEADER: &str = "Function,Address,Instruction_Type,Count";

#[derive(Debug, Clone)]
pub struct ProfilerConfig {
    pub start_marker: String,
    pub end_marker: String,
    /// Routines matching this pattern are not instrumented
    pub exclude: Option<Regex>,
    pub designated_thread: Option<u64>,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            start_marker: "start_measurement".to_string(),
            end_marker: "end_measurement".to_string(),
            exclude: None,
            designated_thread: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ProfileProbe {
    Start,
    End,
    Instruction {
        routine: usize,
        category: InstructionCategory,
    },
}

/// One CSV row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileRow {
    pub function: String,
    pub address: u64,
    pub category: InstructionCategory,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileReport {
    /// In routine enumeration order, then by category
    pub rows: Vec<ProfileRow>,
    /// Number of started measurements
    pub measurements: usize,
    pub summary: RunSummary,
}

impl ProfileReport {
    pub fn write_csv(&self, path: &Path) -> std::io::Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        writeln!(writer, "{CSV_HEADER}")?;
        for row in &self.rows {
            writeln!(
                writer,
                "{},{:x},{},{}",
                row.function, row.address, row.category, row.count
            )?;
        }
        writer.flush()
    }

    pub fn count(&self, function: &str, category: InstructionCategory) -> u64 {
        self.rows
            .iter()
            .filter(|row| row.function == function && row.category == category)
            .map(|row| row.count)
            .sum()
    }

    pub fn print(&self) {
        println!("\nMeasurements: {}", self.measurements);
        for row in &self.rows {
            println!(
                "{:<32} 0x{:<12x} {:<12} {}",
                row.function.bold(),
                row.address,
                row.category,
                row.count
            );
        }
    }
}

pub struct Profiler {
    config: ProfilerConfig,
    probes: HashMap<ProbeId, ProfileProbe>,
    routines: Vec<(String, u64)>,
    measuring: bool,
    measurements: usize,
    counts: BTreeMap<(usize, InstructionCategory), u64>,
}

impl Profiler {
    pub fn new(config: ProfilerConfig) -> Self {
        Self {
            config,
            probes: HashMap::new(),
            routines: Vec::new(),
            measuring: false,
            measurements: 0,
            counts: BTreeMap::new(),
        }
    }

    /// Place marker and instruction probes. Returns the names of markers not
    /// found in any image.
    pub fn bind(&mut self, backend: &mut dyn Instrumentation) -> Vec<String> {
        let mut start_found = false;
        let mut end_found = false;
        for image in backend.images() {
            for routine in &image.routines {
                if routine.name == self.config.start_marker {
                    let probe = backend.insert_probe(ProbePoint::Instruction(routine.address));
                    self.probes.insert(probe, ProfileProbe::Start);
                    start_found = true;
                    continue;
                }
                if routine.name == self.config.end_marker {
                    let probe = backend.insert_probe(ProbePoint::Instruction(routine.address));
                    self.probes.insert(probe, ProfileProbe::End);
                    end_found = true;
                    continue;
                }
                if self
                    .config
                    .exclude
                    .as_ref()
                    .is_some_and(|exclude| exclude.is_match(&routine.name))
                {
                    continue;
                }
                let instructions = match backend.routine_instructions(routine) {
                    Ok(instructions) => instructions,
                    Err(fault) => {
                        debug!("Routine {} skipped: {fault}", routine.name);
                        continue;
                    }
                };
                let index = self.routines.len();
                self.routines.push((routine.name.clone(), routine.address));
                for instruction in instructions
                    .iter()
                    .filter(|instruction| instruction.category != InstructionCategory::Unknown)
                {
                    let probe = backend.insert_probe(ProbePoint::Instruction(instruction.address));
                    self.probes.insert(
                        probe,
                        ProfileProbe::Instruction {
                            routine: index,
                            category: instruction.category,
                        },
                    );
                }
            }
        }
        info!(
            "{} probes in {} routines",
            self.probes.len(),
            self.routines.len()
        );
        let mut missing = Vec::new();
        if !start_found {
            missing.push(self.config.start_marker.clone());
        }
        if !end_found {
            missing.push(self.config.end_marker.clone());
        }
        for name in &missing {
            warn!("Marker {name} not found, nothing will be measured");
        }
        missing
    }

    pub fn run(mut self, backend: &mut dyn Instrumentation) -> Result<ProfileReport, Fault> {
        self.bind(backend);
        let summary = backend.run(&mut self)?;
        let rows = self
            .counts
            .iter()
            .map(|((routine, category), count)| {
                let (function, address) = &self.routines[*routine];
                ProfileRow {
                    function: function.clone(),
                    address: *address,
                    category: *category,
                    count: *count,
                }
            })
            .collect();
        Ok(ProfileReport {
            rows,
            measurements: self.measurements,
            summary,
        })
    }
}

impl ProbeHandler for Profiler {
    fn on_probe(&mut self, hit: ProbeHit, ctx: &mut dyn ProbeContext) {
        if let Some(thread) = self.config.designated_thread {
            if ctx.thread_id() != thread {
                return;
            }
        }
        match self.probes.get(&hit.probe) {
            Some(ProfileProbe::Start) => {
                info!("Started measurement");
                self.measuring = true;
                self.measurements += 1;
            }
            Some(ProfileProbe::End) => {
                info!("Ended measurement");
                self.measuring = false;
            }
            Some(ProfileProbe::Instruction { routine, category }) if self.measuring => {
                *self.counts.entry((*routine, *category)).or_default() += 1;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrumentation::scripted::{ScriptedBackend, Step};

    fn backend() -> ScriptedBackend {
        ScriptedBackend::new()
            .routine("start_measurement", 0x1000, &["ret"])
            .routine("end_measurement", 0x1100, &["ret"])
            .routine("kernel", 0x2000, &["add", "imul", "mov", "ret"])
            .routine("helper_noise", 0x3000, &["add", "ret"])
            .program(vec![
                Step::Call("kernel".into()),
                Step::Call("start_measurement".into()),
                Step::Call("kernel".into()),
                Step::Call("kernel".into()),
                Step::Call("helper_noise".into()),
                Step::Call("end_measurement".into()),
                Step::Call("kernel".into()),
                Step::Exit(0),
            ])
    }

    #[test]
    fn counts_only_between_markers() {
        let mut backend = backend();
        let profiler = Profiler::new(ProfilerConfig {
            exclude: Some(Regex::new("^helper_").unwrap()),
            ..Default::default()
        });
        let report = profiler.run(&mut backend).unwrap();

        assert_eq!(report.measurements, 1);
        assert_eq!(report.count("kernel", InstructionCategory::IntAdd), 2);
        assert_eq!(report.count("kernel", InstructionCategory::IntMul), 2);
        assert_eq!(report.count("helper_noise", InstructionCategory::IntAdd), 0);
        assert_eq!(report.rows.len(), 2);
    }

    #[test]
    fn csv_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counts.csv");
        let mut backend = backend();
        let report = Profiler::new(ProfilerConfig::default())
            .run(&mut backend)
            .unwrap();
        report.write_csv(&path).unwrap();

        let csv = std::fs::read_to_string(&path).unwrap();
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some(CSV_HEADER));
        assert_eq!(lines.next(), Some("kernel,2000,INT_ADD,2"));
        assert_eq!(lines.next(), Some("kernel,2000,INT_MUL,2"));
        assert_eq!(lines.next(), Some("helper_noise,3000,INT_ADD,1"));
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn other_threads_are_ignored() {
        let mut backend = ScriptedBackend::new()
            .routine("start_measurement", 0x1000, &["ret"])
            .routine("end_measurement", 0x1100, &["ret"])
            .routine("kernel", 0x2000, &["sub", "ret"])
            .program(vec![
                Step::Call("start_measurement".into()),
                Step::Thread(1),
                Step::Call("kernel".into()),
                Step::Thread(0),
                Step::Call("kernel".into()),
                Step::Call("end_measurement".into()),
            ]);
        let report = Profiler::new(ProfilerConfig {
            designated_thread: Some(0),
            ..Default::default()
        })
        .run(&mut backend)
        .unwrap();
        assert_eq!(report.count("kernel", InstructionCategory::IntSub), 1);
    }
}
