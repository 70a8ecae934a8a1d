pub mod assets;
pub mod cli;
pub mod config;
pub mod errors;
pub mod install;
pub mod logging;
pub mod status;

use anyhow::Context;
use clap::Parser;
use cli::{Command, InstallArgs};
use errors::InstallError;
use install::{Manifest, Sequence};
use keel_hal::{LinuxHal, SystemHal};

pub fn run() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();
    logging::init(cli.log_file.as_deref());
    let hal = LinuxHal::new();

    match &cli.command {
        Command::Install(args) => {
            log::info!("💾 Running install...");
            provision(&hal, args, Sequence::Install, false)
        }
        Command::Upgrade {
            args,
            legacy_source,
        } => {
            log::info!("🔁 Running upgrade...");
            provision(&hal, args, Sequence::Upgrade, *legacy_source)
        }
        Command::Status { disk, json } => {
            let status = status::DiskStatus::probe(&hal, disk)
                .with_context(|| format!("Failed to inspect {}", disk.display()))?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print!("{}", status);
            }
            Ok(())
        }
    }
}

fn provision<H: SystemHal + ?Sized>(
    hal: &H,
    args: &InstallArgs,
    sequence: Sequence,
    legacy_source: bool,
) -> anyhow::Result<()> {
    let opts = args.to_options()?;
    let manifest = Manifest::new(&args.slot, sequence, legacy_source, &opts, hal)
        .with_context(|| format!("Failed to plan {} of {}", sequence, opts.disk.display()))?;
    print!("{}", manifest);

    if args.dry_run {
        log::info!("🧪 Dry run: no changes made");
        return Ok(());
    }
    if !args.yes_i_know {
        return Err(InstallError::MissingYesIKnow.into());
    }

    let report = manifest
        .execute(hal)
        .with_context(|| format!("{} failed", sequence))?;
    log::info!("✅ {} complete", sequence);
    print!("{}", report);
    Ok(())
}
