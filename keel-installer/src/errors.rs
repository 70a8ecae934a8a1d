use keel_hal::HalError;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub type InstallResult<T> = std::result::Result<T, InstallError>;

/// Where in a manifest run an error happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStep {
    Detect,
    Preflight,
    Stage,
    Zero,
    PartitionTable,
    Format,
    Migrate,
    Assets,
    PublishSlot,
}

impl fmt::Display for ExecStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecStep::Detect => "layout detection",
            ExecStep::Preflight => "preflight",
            ExecStep::Stage => "content staging",
            ExecStep::Zero => "header wipe",
            ExecStep::PartitionTable => "partition table write",
            ExecStep::Format => "format",
            ExecStep::Migrate => "content migration",
            ExecStep::Assets => "asset placement",
            ExecStep::PublishSlot => "boot slot publish",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum InstallError {
    /// Rejected before any disk mutation.
    #[error("Planning failed: {0}")]
    Planning(String),

    #[error("Device error during {step} ({target}): {source}")]
    Device {
        step: ExecStep,
        target: String,
        #[source]
        source: HalError,
    },

    #[error("Migration of {target} failed during {step}: {reason}")]
    Migration {
        step: ExecStep,
        target: String,
        reason: String,
    },

    #[error("Asset {source_path} -> {}: {reason}", .destination.display())]
    Asset {
        source_path: String,
        destination: PathBuf,
        reason: String,
    },

    /// A run that stopped after its first destructive write.
    #[error("{source}; staged content kept in {}", .workdir.display())]
    Halted {
        #[source]
        source: Box<InstallError>,
        workdir: PathBuf,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Missing --yes-i-know flag. This operation is destructive!")]
    MissingYesIKnow,
}

impl InstallError {
    pub fn planning(reason: impl Into<String>) -> Self {
        InstallError::Planning(reason.into())
    }

    pub fn device(step: ExecStep, target: impl Into<String>, source: HalError) -> Self {
        InstallError::Device {
            step,
            target: target.into(),
            source,
        }
    }

    pub fn migration(step: ExecStep, target: impl Into<String>, reason: impl fmt::Display) -> Self {
        InstallError::Migration {
            step,
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    pub fn asset(
        source_path: impl Into<String>,
        destination: impl Into<PathBuf>,
        reason: impl fmt::Display,
    ) -> Self {
        InstallError::Asset {
            source_path: source_path.into(),
            destination: destination.into(),
            reason: reason.to_string(),
        }
    }

    /// Step the error was raised in, for errors raised while executing.
    pub fn step(&self) -> Option<ExecStep> {
        match self {
            InstallError::Device { step, .. } | InstallError::Migration { step, .. } => {
                Some(*step)
            }
            InstallError::Asset { .. } => Some(ExecStep::Assets),
            InstallError::Halted { source, .. } => source.step(),
            _ => None,
        }
    }

    /// The underlying error, looking through [`InstallError::Halted`].
    pub fn cause(&self) -> &InstallError {
        match self {
            InstallError::Halted { source, .. } => source.cause(),
            other => other,
        }
    }

    /// Where staged partition content was left, if the run halted.
    pub fn kept_workdir(&self) -> Option<&Path> {
        match self {
            InstallError::Halted { workdir, .. } => Some(workdir),
            _ => None,
        }
    }
}
