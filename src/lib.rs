pub mod campaign;
pub mod config;
pub mod deserializers;
pub mod disassembly;
pub mod elf_file;
pub mod emulation;
pub mod handoff;
pub mod injection;
pub mod instrumentation;
pub mod profiler;
pub mod victim;

pub mod prelude {
    pub use crate::campaign::{Campaign, CampaignReport, CampaignRun};
    pub use crate::config::{Args, Config, RunMode};
    pub use crate::disassembly::InstructionCategory;
    pub use crate::elf_file::VictimImage;
    pub use crate::emulation::{BackendConfig, EmulatorBackend};
    pub use crate::handoff::{ChannelError, HandoffChannel, HandoffRecord};
    pub use crate::injection::record::{InjectionReport, TrialOutcome, TrialRecord};
    pub use crate::injection::session::{
        ConfigError, Phase, RestorePolicy, SweepPlan, SweepSession, WORD_BITS,
    };
    pub use crate::injection::sync::SyncMode;
    pub use crate::injection::trigger::InsPoint;
    pub use crate::injection::{InjectError, InjectionConfig, Injector, Variant};
    pub use crate::instrumentation::scripted::{ScriptedBackend, ScriptedMemory, Step};
    pub use crate::instrumentation::{
        Fault, Instrumentation, ProbeContext, ProbeHandler, ProbeHit, ProbePoint, Register,
        RunSummary,
    };
    pub use crate::profiler::{ProfileReport, Profiler, ProfilerConfig};
}
