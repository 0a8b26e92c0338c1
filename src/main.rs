use clap::Parser;
use std::sync::Arc;

use bitflip_injector::prelude::*;

use git_version::git_version;
const GIT_VERSION: &str = git_version!(fallback = "unknown");

/// Single-shot bit-flip fault injection into x86-64 victims
///
fn main() -> Result<(), String> {
    // Get parameter from command line and optional config file
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => {
            let mut config = Config::from_file(path)?;
            config.override_with_args(&args);
            config
        }
        None => Config::from_args(&args),
    };

    // Switch on more with: RUST_LOG=debug or --verbose
    let level = if config.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    println!("--- Bit-flip injector: {GIT_VERSION} ---\n");

    let path = config
        .elf
        .clone()
        .ok_or("No victim executable given, use --elf")?;
    println!("Victim executable: {}\n", path.display());
    let image = Arc::new(VictimImage::from_elf(&path)?);

    let exit_code = match config.mode {
        RunMode::Profile => {
            let profiler = Profiler::new(config.profiler_config().map_err(|e| e.to_string())?);
            let mut backend = EmulatorBackend::new(image, &config.backend_config())
                .map_err(|e| e.to_string())?;
            let report = profiler.run(&mut backend).map_err(|e| e.to_string())?;
            report.print();
            report
                .write_csv(&config.profile_output)
                .map_err(|e| format!("Failed to write {}: {e}", config.profile_output.display()))?;
            println!("Results written to {}", config.profile_output.display());
            report.summary.exit_code
        }
        RunMode::Campaign => {
            let injection = config.injection_config().map_err(|e| e.to_string())?;
            let campaign =
                Campaign::new(image, injection, config.backend_config(), config.threads)?;
            campaign.run()?.print();
            None
        }
        RunMode::Sweep | RunMode::Single | RunMode::Register => {
            let injection = config.injection_config().map_err(|e| e.to_string())?;
            let mut backend = EmulatorBackend::new(image, &config.backend_config())
                .map_err(|e| e.to_string())?;
            let report = Injector::new(injection)
                .map_err(|e| e.to_string())?
                .run(&mut backend)
                .map_err(|e| e.to_string())?;
            report.print();
            report.summary.exit_code
        }
    };

    // Hand the victim's status through
    match exit_code {
        Some(code) if code != 0 => std::process::exit(code as i32),
        _ => Ok(()),
    }
}
