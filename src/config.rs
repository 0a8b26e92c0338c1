use crate::deserializers::{deserialize_hex_option, deserialize_register_option, parse_hex};
use crate::emulation::BackendConfig;
use crate::injection::session::{ConfigError, RestorePolicy, SweepPlan};
use crate::injection::sync::SyncMode;
use crate::injection::trigger::InsPoint;
use crate::injection::{InjectionConfig, Variant};
use crate::instrumentation::Register;
use crate::profiler::ProfilerConfig;
use clap::Parser;
use regex::Regex;
use serde::Deserialize;
use std::path::PathBuf;

/// What a run of the injector does
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Flip every bit of every word in one victim run
    #[default]
    Sweep,
    /// Flip one bit of one word
    Single,
    /// Flip one register bit at the target instruction
    Register,
    /// Count executed instruction categories
    Profile,
    /// Every trial of the sweep as a fresh victim run
    Campaign,
}

/// Configuration structure that can be loaded from JSON5
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub elf: Option<PathBuf>,
    pub mode: RunMode,
    pub trigger_marker: String,
    /// Empty name disables the marker synchronization
    pub sync_marker: String,
    /// Rendezvous syscall number, replaces the sync marker
    #[serde(deserialize_with = "deserialize_hex_option")]
    pub sync_syscall: Option<u64>,
    pub target_routine: String,
    pub instruction_index: usize,
    pub point: InsPoint,
    pub reformat_routine: Option<String>,
    pub handoff_file: PathBuf,
    pub handoff_fd: u64,
    pub require_handoff: bool,
    pub word_index: usize,
    pub bit: u32,
    pub width: usize,
    pub restore: RestorePolicy,
    #[serde(deserialize_with = "deserialize_register_option")]
    pub register: Option<Register>,
    pub occurrence: usize,
    pub dry_run: bool,
    pub verbose: bool,
    pub max_instructions: usize,
    pub call_budget: usize,
    pub results_file: Option<PathBuf>,
    pub trial_log: Option<PathBuf>,
    #[serde(deserialize_with = "deserialize_register_option")]
    pub metric_register: Option<Register>,
    #[serde(deserialize_with = "deserialize_hex_option")]
    pub designated_thread: Option<u64>,
    pub threads: usize,
    pub echo_output: bool,
    pub no_detach: bool,
    pub profile_start: String,
    pub profile_end: String,
    pub profile_exclude: Option<String>,
    pub profile_output: PathBuf,
}

// Keep defaults in sync with CLI documentation
impl Default for Config {
    fn default() -> Self {
        let backend = BackendConfig::default();
        let profiler = ProfilerConfig::default();
        Self {
            elf: None,
            mode: RunMode::Sweep,
            trigger_marker: "addr_label".to_string(),
            sync_marker: "sync_marker".to_string(),
            sync_syscall: None,
            target_routine: "foo".to_string(),
            instruction_index: 0,
            point: InsPoint::Before,
            reformat_routine: None,
            handoff_file: PathBuf::from("addr.txt"),
            handoff_fd: backend.handoff_fd,
            require_handoff: false,
            word_index: 0,
            bit: 0,
            width: 1,
            restore: RestorePolicy::Full,
            register: None,
            occurrence: 0,
            dry_run: false,
            verbose: false,
            max_instructions: backend.max_instructions,
            call_budget: backend.call_budget,
            results_file: None,
            trial_log: None,
            metric_register: None,
            designated_thread: None,
            threads: 1,
            echo_output: false,
            no_detach: false,
            profile_start: profiler.start_marker,
            profile_end: profiler.end_marker,
            profile_exclude: None,
            profile_output: PathBuf::from("instruction_counts.csv"),
        }
    }
}

impl Config {
    /// Load configuration from JSON5 file
    pub fn from_file(path: &PathBuf) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;

        json5::from_str(&content).map_err(|e| format!("Failed to parse JSON5 config: {}", e))
    }

    /// Create Config from command line arguments
    pub fn from_args(args: &Args) -> Self {
        let mut config = Self::default();
        config.override_with_args(args);
        config
    }

    /// Override config values with command line arguments
    pub fn override_with_args(&mut self, args: &Args) {
        // Options only if provided
        macro_rules! take {
            ($($field:ident),*) => {
                $(if let Some(value) = &args.$field {
                    self.$field = value.clone();
                })*
            };
        }
        take!(
            mode,
            trigger_marker,
            sync_marker,
            target_routine,
            instruction_index,
            point,
            handoff_file,
            handoff_fd,
            word_index,
            bit,
            width,
            restore,
            occurrence,
            max_instructions,
            call_budget,
            threads,
            profile_start,
            profile_end,
            profile_output
        );
        if args.elf.is_some() {
            self.elf = args.elf.clone();
        }
        if args.sync_syscall.is_some() {
            self.sync_syscall = args.sync_syscall;
        }
        if args.reformat_routine.is_some() {
            self.reformat_routine = args.reformat_routine.clone();
        }
        if args.register.is_some() {
            self.register = args.register;
        }
        if args.results_file.is_some() {
            self.results_file = args.results_file.clone();
        }
        if args.trial_log.is_some() {
            self.trial_log = args.trial_log.clone();
        }
        if args.metric_register.is_some() {
            self.metric_register = args.metric_register;
        }
        if args.designated_thread.is_some() {
            self.designated_thread = args.designated_thread;
        }
        if args.profile_exclude.is_some() {
            self.profile_exclude = args.profile_exclude.clone();
        }

        // Only override boolean flags if they're true (explicitly set by user)
        if args.require_handoff {
            self.require_handoff = true;
        }
        if args.dry_run {
            self.dry_run = true;
        }
        if args.verbose {
            self.verbose = true;
        }
        if args.echo_output {
            self.echo_output = true;
        }
        if args.no_detach {
            self.no_detach = true;
        }
    }

    fn sync(&self) -> Option<SyncMode> {
        match (self.sync_syscall, self.sync_marker.as_str()) {
            (Some(number), _) => Some(SyncMode::Syscall(number)),
            (None, "") => None,
            (None, name) => Some(SyncMode::Marker(name.to_string())),
        }
    }

    /// Validated injection configuration of the selected mode
    pub fn injection_config(&self) -> Result<InjectionConfig, ConfigError> {
        let variant = match self.mode {
            RunMode::Sweep | RunMode::Campaign => Variant::Memory {
                plan: SweepPlan::Sweep { width: self.width },
                policy: self.restore,
            },
            RunMode::Single => Variant::Memory {
                plan: SweepPlan::Single {
                    index: self.word_index,
                    bit: self.bit,
                },
                policy: self.restore,
            },
            RunMode::Register => Variant::Register {
                register: self
                    .register
                    .ok_or_else(|| ConfigError::Invalid("register mode needs --register".into()))?,
                bit: self.bit,
                occurrence: self.occurrence,
            },
            RunMode::Profile => {
                return Err(ConfigError::Invalid(
                    "profile mode does not inject faults".into(),
                ))
            }
        };
        let config = InjectionConfig {
            variant,
            handoff_file: self.handoff_file.clone(),
            require_handoff: self.require_handoff,
            trigger_marker: self.trigger_marker.clone(),
            sync: self.sync(),
            target_routine: self.target_routine.clone(),
            instruction_index: self.instruction_index,
            point: self.point,
            reformat_routine: self.reformat_routine.clone(),
            dry_run: self.dry_run,
            metric_register: self.metric_register,
            results_file: self.results_file.clone(),
            trial_log: self.trial_log.clone(),
            designated_thread: self.designated_thread,
            detach_on_completion: !self.no_detach,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn backend_config(&self) -> BackendConfig {
        BackendConfig {
            max_instructions: self.max_instructions,
            call_budget: self.call_budget,
            handoff_file: Some(self.handoff_file.clone()),
            handoff_fd: self.handoff_fd,
            echo_output: self.echo_output,
        }
    }

    pub fn profiler_config(&self) -> Result<ProfilerConfig, ConfigError> {
        let exclude = self
            .profile_exclude
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| ConfigError::Invalid(format!("exclusion pattern: {e}")))?;
        Ok(ProfilerConfig {
            start_marker: self.profile_start.clone(),
            end_marker: self.profile_end.clone(),
            exclude,
            designated_thread: self.designated_thread,
        })
    }
}

/// Parse hex numbers given on the command line
pub fn parse_hex_number(s: &str) -> Result<u64, String> {
    parse_hex(s)
}

/// Command-line arguments of the injector.
///
/// Every option left out keeps the value of the configuration file, or the
/// default without one.
#[derive(Parser, Debug, Default)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Load configuration from JSON5 file
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Victim executable (statically linked x86-64 ELF)
    #[arg(short, long)]
    pub elf: Option<PathBuf>,

    /// Run mode [default: sweep]
    #[arg(long, value_enum)]
    pub mode: Option<RunMode>,

    /// Marker routine announcing the handoff record [default: addr_label]
    #[arg(long)]
    pub trigger_marker: Option<String>,

    /// Marker routine ending a trial, empty to disable [default: sync_marker]
    #[arg(long)]
    pub sync_marker: Option<String>,

    /// Syscall number used as rendezvous instead of the sync marker
    ///   E.g.: --sync-syscall 0x27
    #[arg(long, value_parser = parse_hex_number, verbatim_doc_comment)]
    pub sync_syscall: Option<u64>,

    /// Routine holding the target instruction [default: foo]
    #[arg(short, long)]
    pub target_routine: Option<String>,

    /// Index of the target instruction within the routine [default: 0]
    #[arg(short, long)]
    pub instruction_index: Option<usize>,

    /// Probe before or after the target instruction [default: before]
    #[arg(long, value_enum)]
    pub point: Option<InsPoint>,

    /// Routine called with the object address around each flip
    #[arg(long)]
    pub reformat_routine: Option<String>,

    /// Handoff file shared with the victim [default: addr.txt]
    #[arg(long)]
    pub handoff_file: Option<PathBuf>,

    /// File descriptor the victim writes the handoff record to [default: 3]
    #[arg(long)]
    pub handoff_fd: Option<u64>,

    /// Fail before the run if the handoff record is not readable
    #[arg(long, default_value_t = false)]
    pub require_handoff: bool,

    /// Word index in single mode [default: 0]
    #[arg(short, long)]
    pub word_index: Option<usize>,

    /// Bit position in single and register mode [default: 0]
    #[arg(short, long)]
    pub bit: Option<u32>,

    /// Number of words swept [default: 1]
    #[arg(long)]
    pub width: Option<usize>,

    /// Words restored after each trial [default: full]
    #[arg(long, value_enum)]
    pub restore: Option<RestorePolicy>,

    /// Register flipped in register mode, e.g. rax, xmm0, ymm3
    #[arg(short, long)]
    pub register: Option<Register>,

    /// Execution of the target instruction within one routine invocation
    /// that gets the flip [default: 0]
    #[arg(long)]
    pub occurrence: Option<usize>,

    /// Compute flips without writing them
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,

    /// Debug logging
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,

    /// Maximum number of victim instructions [default: 10000000]
    #[arg(short, long)]
    pub max_instructions: Option<usize>,

    /// Maximum number of instructions of one reformat call [default: 1000000]
    #[arg(long)]
    pub call_budget: Option<usize>,

    /// Append the metric of every trial to this file
    #[arg(long)]
    pub results_file: Option<PathBuf>,

    /// Write one line per trial to this file
    #[arg(long)]
    pub trial_log: Option<PathBuf>,

    /// Register holding the metric at the sync point
    #[arg(long)]
    pub metric_register: Option<Register>,

    /// Only probe hits of this victim thread change the injection state
    #[arg(long, value_parser = parse_hex_number)]
    pub designated_thread: Option<u64>,

    /// Worker threads in campaign mode [default: 1]
    #[arg(long)]
    pub threads: Option<usize>,

    /// Forward the victim's stdout and stderr
    #[arg(long, default_value_t = false)]
    pub echo_output: bool,

    /// Keep probes installed after the last trial
    #[arg(long, default_value_t = false)]
    pub no_detach: bool,

    /// Profiler start marker [default: start_measurement]
    #[arg(long)]
    pub profile_start: Option<String>,

    /// Profiler end marker [default: end_measurement]
    #[arg(long)]
    pub profile_end: Option<String>,

    /// Routines matching this regex are not profiled
    #[arg(long)]
    pub profile_exclude: Option<String>,

    /// CSV output of the profiler [default: instruction_counts.csv]
    #[arg(long)]
    pub profile_output: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_describe_marker_sweep() {
        let config = Config::from_args(&Args::default());
        let injection = config.injection_config().unwrap();
        assert_eq!(
            injection.variant,
            Variant::Memory {
                plan: SweepPlan::Sweep { width: 1 },
                policy: RestorePolicy::Full
            }
        );
        assert_eq!(injection.sync, Some(SyncMode::Marker("sync_marker".into())));
        assert_eq!(injection.trigger_marker, "addr_label");
        assert!(injection.detach_on_completion);
    }

    #[test]
    fn cli_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json5");
        std::fs::write(
            &path,
            r#"{
                mode: "single",
                word_index: 2,
                bit: 5,
                sync_syscall: "0x27",
                restore: "selective",
                metric_register: "xmm0",
            }"#,
        )
        .unwrap();
        let mut config = Config::from_file(&path).unwrap();
        let args = Args::parse_from(["bitflip_injector", "--bit", "7", "--dry-run"]);
        config.override_with_args(&args);

        let injection = config.injection_config().unwrap();
        assert_eq!(
            injection.variant,
            Variant::Memory {
                plan: SweepPlan::Single { index: 2, bit: 7 },
                policy: RestorePolicy::Selective
            }
        );
        assert_eq!(injection.sync, Some(SyncMode::Syscall(39)));
        assert_eq!(injection.metric_register, Some(Register::Xmm(0)));
        assert!(injection.dry_run);
    }

    #[test]
    fn invalid_bit_is_rejected() {
        let args = Args::parse_from(["bitflip_injector", "--mode", "single", "--bit", "64"]);
        assert_eq!(
            Config::from_args(&args).injection_config(),
            Err(ConfigError::BitOutOfRange {
                bit: 64,
                word_bits: 64
            })
        );

        let args = Args::parse_from([
            "bitflip_injector",
            "--mode",
            "register",
            "-r",
            "xmm2",
            "-b",
            "127",
        ]);
        let injection = Config::from_args(&args).injection_config().unwrap();
        assert_eq!(injection.word_bits(), 128);

        let args = Args::parse_from(["bitflip_injector", "--mode", "register"]);
        assert!(Config::from_args(&args).injection_config().is_err());
    }

    #[test]
    fn oversized_word_range_is_rejected() {
        let args = Args::parse_from(["bitflip_injector", "--width", "18446744073709551615"]);
        assert!(matches!(
            Config::from_args(&args).injection_config(),
            Err(ConfigError::WordRange { .. })
        ));

        let args = Args::parse_from(["bitflip_injector", "--width", "0"]);
        assert_eq!(
            Config::from_args(&args).injection_config(),
            Err(ConfigError::EmptySweep)
        );

        let args = Args::parse_from([
            "bitflip_injector",
            "--mode",
            "single",
            "--word-index",
            "18446744073709551615",
        ]);
        assert!(Config::from_args(&args).injection_config().is_err());
    }

    #[test]
    fn empty_sync_marker_disables_sync() {
        let args = Args::parse_from(["bitflip_injector", "--sync-marker", ""]);
        assert_eq!(Config::from_args(&args).injection_config().unwrap().sync, None);
    }

    #[test]
    fn bad_exclusion_pattern() {
        let args = Args::parse_from(["bitflip_injector", "--profile-exclude", "(unclosed"]);
        assert!(Config::from_args(&args).profiler_config().is_err());
    }
}
