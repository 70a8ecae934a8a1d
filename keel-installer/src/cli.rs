//! CLI argument parsing for keel

use crate::config::{AssetSpec, Options};
use crate::errors::InstallResult;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "keel")]
#[command(version)]
#[command(about = "⚓ keel - A/B disk provisioning for an immutable OS")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Append logs to this file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// 💾 Partition, format and install the first boot slot
    Install(InstallArgs),

    /// 🔁 Install the next boot slot on an existing disk
    Upgrade {
        #[command(flatten)]
        args: InstallArgs,

        /// The disk is expected to hold the two-partition legacy layout
        #[arg(long)]
        legacy_source: bool,
    },

    /// 🔍 Show the layout, active slot and mounts of a disk
    Status {
        /// Disk to inspect (e.g., /dev/sda)
        #[arg(long)]
        disk: PathBuf,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug, Clone, Default)]
pub struct InstallArgs {
    /// TOML file with install options; flags override its values
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Target disk device (e.g., /dev/sda)
    #[arg(long)]
    pub disk: Option<PathBuf>,

    /// Boot slot to install into
    #[arg(long, default_value = "A")]
    pub slot: String,

    /// Recreate every partition, carrying BOOT and STATE content across
    #[arg(long, conflicts_with = "preserve", overrides_with = "no_force")]
    pub force: bool,

    /// Turn off `force` from the config file
    #[arg(long, overrides_with = "force")]
    pub no_force: bool,

    /// Keep existing partitions in place (the default for upgrades)
    #[arg(long, overrides_with = "no_preserve")]
    pub preserve: bool,

    /// Turn off `preserve` from the config file
    #[arg(long, overrides_with = "preserve")]
    pub no_preserve: bool,

    /// Wipe the partition table headers before repartitioning
    #[arg(long, overrides_with = "no_zero")]
    pub zero: bool,

    /// Turn off `zero` from the config file
    #[arg(long, overrides_with = "zero")]
    pub no_zero: bool,

    /// Install EFI bootloader files
    #[arg(long, overrides_with = "no_bootloader")]
    pub bootloader: bool,

    /// Turn off `bootloader` from the config file
    #[arg(long, overrides_with = "bootloader")]
    pub no_bootloader: bool,

    /// Kernel image (path or http(s) URL)
    #[arg(long)]
    pub kernel: Option<String>,

    /// Initramfs image (path or http(s) URL)
    #[arg(long)]
    pub initramfs: Option<String>,

    /// Machine configuration written to STATE
    #[arg(long)]
    pub machine_config: Option<String>,

    /// Bootloader file as SRC=DEST, DEST under /boot/EFI (repeatable)
    #[arg(long = "bootloader-asset")]
    pub bootloader_assets: Vec<AssetSpec>,

    /// Extra file as SRC=DEST (repeatable)
    #[arg(long = "asset")]
    pub assets: Vec<AssetSpec>,

    /// Directory for staging carried partition content
    #[arg(long)]
    pub staging_dir: Option<PathBuf>,

    /// Print the manifest and exit without touching the disk
    #[arg(long)]
    pub dry_run: bool,

    /// Confirm destructive operation (required for non-dry-run)
    #[arg(long)]
    pub yes_i_know: bool,
}

impl InstallArgs {
    /// Options from `--config` (if any) with every given flag applied on top.
    pub fn to_options(&self) -> InstallResult<Options> {
        let mut opts = match &self.config {
            Some(path) => Options::load(path)?,
            None => Options::default(),
        };
        if let Some(disk) = &self.disk {
            opts.disk = disk.clone();
        }
        if let Some(force) = flag(self.force, self.no_force) {
            opts.force = force;
        }
        if let Some(preserve) = flag(self.preserve, self.no_preserve) {
            opts.preserve = preserve;
        }
        if let Some(zero) = flag(self.zero, self.no_zero) {
            opts.zero = zero;
        }
        if let Some(bootloader) = flag(self.bootloader, self.no_bootloader) {
            opts.bootloader = bootloader;
        }
        if self.kernel.is_some() {
            opts.kernel = self.kernel.clone();
        }
        if self.initramfs.is_some() {
            opts.initramfs = self.initramfs.clone();
        }
        if self.machine_config.is_some() {
            opts.machine_config = self.machine_config.clone();
        }
        opts.bootloader_assets
            .extend(self.bootloader_assets.iter().cloned());
        opts.extra_assets.extend(self.assets.iter().cloned());
        if self.staging_dir.is_some() {
            opts.staging_dir = self.staging_dir.clone();
        }
        Ok(opts)
    }
}

/// `Some` when either side of a `--x` / `--no-x` pair was given.
fn flag(on: bool, off: bool) -> Option<bool> {
    match (on, off) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn install_flags_parse() {
        let cli = Cli::try_parse_from([
            "keel",
            "install",
            "--disk",
            "/dev/sda",
            "--kernel",
            "/srv/vmlinuz",
            "--asset",
            "/srv/motd=/var/motd",
            "--asset",
            "/srv/x=/system/state/x",
            "--yes-i-know",
        ])
        .unwrap();
        let Command::Install(args) = cli.command else {
            panic!("expected install");
        };
        assert_eq!(args.slot, "A");
        assert!(args.yes_i_know);
        let opts = args.to_options().unwrap();
        assert_eq!(opts.disk, PathBuf::from("/dev/sda"));
        assert_eq!(opts.extra_assets.len(), 2);
    }

    #[test]
    fn force_and_preserve_conflict() {
        assert!(Cli::try_parse_from([
            "keel", "upgrade", "--disk", "/dev/sda", "--force", "--preserve"
        ])
        .is_err());
    }

    #[test]
    fn bad_asset_spec_is_rejected() {
        assert!(Cli::try_parse_from(["keel", "install", "--asset", "nodest"]).is_err());
    }

    #[test]
    fn flags_override_config_file() {
        let dir = tempdir().unwrap();
        let config = dir.path().join("keel.toml");
        fs::write(
            &config,
            "disk = \"/dev/sda\"\nkernel = \"/srv/old\"\nzero = true\n",
        )
        .unwrap();

        let cli = Cli::try_parse_from([
            "keel",
            "upgrade",
            "--config",
            config.to_str().unwrap(),
            "--kernel",
            "/srv/new",
            "--slot",
            "B",
            "--legacy-source",
        ])
        .unwrap();
        let Command::Upgrade {
            args,
            legacy_source,
        } = cli.command
        else {
            panic!("expected upgrade");
        };
        assert!(legacy_source);
        assert_eq!(args.slot, "B");
        let opts = args.to_options().unwrap();
        assert_eq!(opts.disk, PathBuf::from("/dev/sda"));
        assert_eq!(opts.kernel.as_deref(), Some("/srv/new"));
        assert!(opts.zero);
    }

    #[test]
    fn negated_flags_turn_off_config_values() {
        let dir = tempdir().unwrap();
        let config = dir.path().join("keel.toml");
        fs::write(
            &config,
            "disk = \"/dev/sda\"\nforce = true\nzero = true\nbootloader = true\n",
        )
        .unwrap();

        let cli = Cli::try_parse_from([
            "keel",
            "upgrade",
            "--config",
            config.to_str().unwrap(),
            "--no-force",
            "--preserve",
            "--no-zero",
        ])
        .unwrap();
        let Command::Upgrade { args, .. } = cli.command else {
            panic!("expected upgrade");
        };
        let opts = args.to_options().unwrap();
        assert!(!opts.force);
        assert!(opts.preserve);
        assert!(!opts.zero);
        assert!(opts.bootloader);
    }

    #[test]
    fn last_of_a_flag_pair_wins() {
        let cli = Cli::try_parse_from([
            "keel",
            "install",
            "--disk",
            "/dev/sda",
            "--bootloader",
            "--no-bootloader",
        ])
        .unwrap();
        let Command::Install(args) = cli.command else {
            panic!("expected install");
        };
        assert!(!args.to_options().unwrap().bootloader);
    }

    #[test]
    fn status_takes_a_disk() {
        let cli = Cli::try_parse_from(["keel", "status", "--disk", "/dev/vda", "--json"]).unwrap();
        assert!(matches!(cli.command, Command::Status { json: true, .. }));
    }
}
