//! # Campaign mode
//!
//! Executes every trial of a sweep as an independent single-shot run on a
//! fresh emulator instance. Trials are distributed over worker threads, each
//! worker owns a private handoff file so concurrent victims never read each
//! other's addresses.

use crate::elf_file::VictimImage;
use crate::emulation::{BackendConfig, EmulatorBackend};
use crate::injection::record::{InjectionReport, ResultsFile, TrialLog, TrialRecord};
use crate::injection::session::SweepPlan;
use crate::injection::{InjectionConfig, Injector, Variant};
use colored::Colorize;
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, info, warn};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{spawn, JoinHandle};

/// One trial sent to a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CampaignWorkload {
    pub trial: usize,
    pub index: usize,
    pub bit: u32,
}

/// Outcome of one single-shot run
#[derive(Debug, Clone, PartialEq)]
pub struct CampaignRun {
    pub workload: CampaignWorkload,
    pub report: Result<InjectionReport, String>,
}

impl CampaignRun {
    /// Trial record of the run, renumbered to the sweep position
    pub fn record(&self) -> Option<TrialRecord> {
        let report = self.report.as_ref().ok()?;
        let mut record = report.trials.first()?.clone();
        record.trial = self.workload.trial;
        Some(record)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CampaignReport {
    /// Runs in row-major sweep order
    pub runs: Vec<CampaignRun>,
}

impl CampaignReport {
    pub fn fault_injected(&self) -> usize {
        self.runs
            .iter()
            .filter(|run| matches!(&run.report, Ok(report) if report.fault_injected))
            .count()
    }

    pub fn crashed_victims(&self) -> usize {
        self.runs
            .iter()
            .filter(|run| matches!(&run.report, Ok(report) if report.summary.crash.is_some()))
            .count()
    }

    pub fn print(&self) {
        println!("\nCampaign runs executed: {}", self.runs.len());
        for run in &self.runs {
            match (&run.report, run.record()) {
                (Ok(report), Some(record)) => {
                    let exit = match (&report.summary.exit_code, &report.summary.crash) {
                        (_, Some(crash)) => format!("victim crashed: {crash}").red(),
                        (Some(code), None) => format!("exit {code}").normal(),
                        (None, None) => "no exit".normal(),
                    };
                    println!("{record}, {exit}");
                }
                (Ok(_), None) => println!(
                    "{}",
                    format!(
                        "trial {} word {} bit {} not reached",
                        run.workload.trial, run.workload.index, run.workload.bit
                    )
                    .yellow()
                ),
                (Err(error), _) => println!(
                    "{}",
                    format!("trial {} failed: {error}", run.workload.trial).red()
                ),
            }
        }
        println!(
            "Fault injected in {} of {} runs, {} victim crashes",
            self.fault_injected(),
            self.runs.len(),
            self.crashed_victims()
        );
    }
}

/// Handoff file of one worker, next to the configured one
pub fn worker_handoff_path(base: &Path, worker: usize) -> PathBuf {
    let mut name = OsString::from(base.as_os_str());
    name.push(format!(".w{worker}"));
    PathBuf::from(name)
}

pub struct Campaign {
    image: Arc<VictimImage>,
    injection: InjectionConfig,
    backend: BackendConfig,
    threads: usize,
}

impl Campaign {
    /// Create a campaign.
    ///
    /// # Arguments
    ///
    /// * `image` - Victim executed by every run.
    /// * `injection` - Memory variant configuration, its plan defines the trials.
    /// * `backend` - Emulator settings, the handoff file is replaced per worker.
    /// * `threads` - Number of worker threads, greater than 0.
    pub fn new(
        image: Arc<VictimImage>,
        injection: InjectionConfig,
        backend: BackendConfig,
        threads: usize,
    ) -> Result<Self, String> {
        if threads == 0 {
            return Err("Number of threads must be greater than 0".to_string());
        }
        if !matches!(injection.variant, Variant::Memory { .. }) {
            return Err("Campaign mode needs the memory variant".to_string());
        }
        injection.validate().map_err(|e| e.to_string())?;
        Ok(Self {
            image,
            injection,
            backend,
            threads,
        })
    }

    fn workloads(&self) -> Vec<CampaignWorkload> {
        let Variant::Memory { plan, .. } = self.injection.variant else {
            return Vec::new();
        };
        plan.trials(self.injection.word_bits())
            .into_iter()
            .enumerate()
            .map(|(trial, (index, bit))| CampaignWorkload { trial, index, bit })
            .collect()
    }

    /// Run all trials and collect them in sweep order
    pub fn run(&self) -> Result<CampaignReport, String> {
        let workloads = self.workloads();
        info!(
            "Campaign of {} runs on {} threads",
            workloads.len(),
            self.threads
        );

        let (workload_sender, workload_receiver): (
            Sender<CampaignWorkload>,
            Receiver<CampaignWorkload>,
        ) = unbounded();
        let (result_sender, result_receiver) = unbounded();

        let handles: Vec<JoinHandle<()>> = (0..self.threads)
            .map(|worker| {
                let receiver = workload_receiver.clone();
                let result_sender = result_sender.clone();
                let image = Arc::clone(&self.image);
                let handoff = worker_handoff_path(&self.injection.handoff_file, worker);
                let mut injection = self.injection.clone();
                injection.handoff_file = handoff.clone();
                injection.trial_log = None;
                injection.results_file = None;
                let mut backend = self.backend.clone();
                backend.handoff_file = Some(handoff.clone());

                spawn(move || {
                    // Loop until the workload channel is closed
                    while let Ok(workload) = receiver.recv() {
                        let report = single_run(&image, &injection, &backend, workload);
                        if result_sender.send(CampaignRun { workload, report }).is_err() {
                            break;
                        }
                    }
                    if let Err(e) = std::fs::remove_file(&handoff) {
                        debug!("Handoff file {} not removed: {e}", handoff.display());
                    }
                })
            })
            .collect();
        drop(result_sender);

        for workload in &workloads {
            workload_sender
                .send(*workload)
                .map_err(|e| format!("Failed to send campaign workload: {e}"))?;
        }
        // Close the sender to signal worker threads to stop
        drop(workload_sender);

        let mut runs: Vec<CampaignRun> = result_receiver.iter().collect();
        for handle in handles {
            if handle.join().is_err() {
                warn!("Campaign worker panicked");
            }
        }
        if runs.len() != workloads.len() {
            return Err(format!(
                "{} of {} campaign runs returned",
                runs.len(),
                workloads.len()
            ));
        }
        runs.sort_by_key(|run| run.workload.trial);
        let report = CampaignReport { runs };
        self.write_outputs(&report);
        Ok(report)
    }

    /// Trial log and metric values in sweep order
    fn write_outputs(&self, report: &CampaignReport) {
        if let Some(path) = &self.injection.trial_log {
            match TrialLog::create(path) {
                Ok(mut log) => report
                    .runs
                    .iter()
                    .filter_map(CampaignRun::record)
                    .for_each(|record| log.append(&record)),
                Err(e) => warn!("Trial log {} not created: {e}", path.display()),
            }
        }
        let results_file = self
            .injection
            .results_file
            .as_ref()
            .filter(|_| self.injection.metric_register.is_some());
        if let Some(path) = results_file {
            match ResultsFile::open(path) {
                Ok(mut results) => report.runs.iter().for_each(|run| {
                    let metric = run.record().and_then(|record| record.metric);
                    results.append(metric.unwrap_or(f64::NAN))
                }),
                Err(e) => warn!("Results file {} not opened: {e}", path.display()),
            }
        }
    }
}

fn single_run(
    image: &Arc<VictimImage>,
    template: &InjectionConfig,
    backend_config: &BackendConfig,
    workload: CampaignWorkload,
) -> Result<InjectionReport, String> {
    let mut injection = template.clone();
    if let Variant::Memory { policy, .. } = template.variant {
        injection.variant = Variant::Memory {
            plan: SweepPlan::Single {
                index: workload.index,
                bit: workload.bit,
            },
            policy,
        };
    }
    injection.detach_on_completion = true;
    let mut backend =
        EmulatorBackend::new(Arc::clone(image), backend_config).map_err(|e| e.to_string())?;
    let report = Injector::new(injection)
        .map_err(|e| e.to_string())?
        .run(&mut backend)
        .map_err(|e| e.to_string())?;
    debug!(
        "Trial {} word {} bit {}: {}",
        workload.trial,
        workload.index,
        workload.bit,
        report.summary_line()
    );
    Ok(report)
}
