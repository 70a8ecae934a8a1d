//! Install options, loaded from an optional TOML file and overridden by CLI flags.

use crate::errors::{InstallError, InstallResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// A `source -> destination` pair requested by configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AssetSpec {
    pub source: String,
    pub destination: PathBuf,
}

impl FromStr for AssetSpec {
    type Err = String;

    /// Parses `SRC=DEST`. URLs may contain `=`, so the split is on the last one.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (source, destination) = s
            .rsplit_once('=')
            .ok_or_else(|| format!("expected SRC=DEST, got {:?}", s))?;
        if source.is_empty() || destination.is_empty() {
            return Err(format!("expected SRC=DEST, got {:?}", s));
        }
        Ok(Self {
            source: source.to_string(),
            destination: PathBuf::from(destination),
        })
    }
}

/// Everything the planner needs to know about the caller's intent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Options {
    pub disk: PathBuf,
    /// Place the EFI bootloader files.
    pub bootloader: bool,
    pub force: bool,
    pub preserve: bool,
    /// Wipe the GPT header regions before partitioning.
    pub zero: bool,
    pub kernel: Option<String>,
    pub initramfs: Option<String>,
    pub machine_config: Option<String>,
    /// Destinations must live under `/boot/EFI`.
    pub bootloader_assets: Vec<AssetSpec>,
    pub extra_assets: Vec<AssetSpec>,
    /// Where carried content is staged; a temporary directory when unset.
    pub staging_dir: Option<PathBuf>,
}

impl Options {
    pub fn load(path: &Path) -> InstallResult<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            InstallError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> InstallResult<Self> {
        toml::from_str(text).map_err(|e| InstallError::Config(e.to_string()))
    }

    /// Checks that do not need the disk.
    pub fn validate(&self) -> InstallResult<()> {
        if self.disk.as_os_str().is_empty() {
            return Err(InstallError::planning("no target disk given"));
        }
        if self.force && self.preserve {
            return Err(InstallError::planning("force and preserve are mutually exclusive"));
        }
        if self.kernel.as_deref().map_or(true, str::is_empty) {
            return Err(InstallError::planning("a kernel source is required"));
        }
        if !self.bootloader && !self.bootloader_assets.is_empty() {
            return Err(InstallError::planning(
                "bootloader assets given but bootloader placement is disabled",
            ));
        }
        for spec in self.bootloader_assets.iter().chain(&self.extra_assets) {
            if !spec.destination.is_absolute() {
                return Err(InstallError::planning(format!(
                    "asset destination {} must be absolute",
                    spec.destination.display()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Options {
        Options {
            disk: PathBuf::from("/dev/vda"),
            kernel: Some("/srv/vmlinuz".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn asset_spec_parses_src_dest() {
        let spec: AssetSpec = "/srv/motd=/system/state/motd".parse().unwrap();
        assert_eq!(spec.source, "/srv/motd");
        assert_eq!(spec.destination, PathBuf::from("/system/state/motd"));

        let spec: AssetSpec = "http://h/x?a=b=/var/x".parse().unwrap();
        assert_eq!(spec.source, "http://h/x?a=b");

        assert!("no-separator".parse::<AssetSpec>().is_err());
        assert!("=/dest".parse::<AssetSpec>().is_err());
    }

    #[test]
    fn toml_file_fills_options() {
        let opts = Options::from_toml_str(
            r#"
            disk = "/dev/sda"
            bootloader = true
            kernel = "https://example.invalid/vmlinuz"

            [[bootloader_assets]]
            source = "/srv/BOOTX64.EFI"
            destination = "/boot/EFI/EFI/BOOT/BOOTX64.EFI"
            "#,
        )
        .unwrap();
        assert_eq!(opts.disk, PathBuf::from("/dev/sda"));
        assert!(opts.bootloader);
        assert!(!opts.force);
        assert_eq!(opts.bootloader_assets.len(), 1);
        opts.validate().unwrap();
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(matches!(
            Options::from_toml_str("disk = \"/dev/sda\"\nboard = \"rpi\"\n"),
            Err(InstallError::Config(_))
        ));
    }

    #[test]
    fn validation_catches_conflicts() {
        minimal().validate().unwrap();

        let mut opts = minimal();
        opts.force = true;
        opts.preserve = true;
        assert!(opts.validate().is_err());

        let mut opts = minimal();
        opts.kernel = None;
        assert!(opts.validate().is_err());

        let mut opts = minimal();
        opts.extra_assets.push("/a=relative/b".parse().unwrap());
        assert!(opts.validate().is_err());

        let mut opts = minimal();
        opts.bootloader_assets
            .push("/a=/boot/EFI/x".parse().unwrap());
        assert!(opts.validate().is_err());
    }

    #[test]
    fn load_reports_missing_file() {
        let err = Options::load(Path::new("/no/such/keel.toml")).unwrap_err();
        assert!(err.to_string().contains("/no/such/keel.toml"));
    }
}
