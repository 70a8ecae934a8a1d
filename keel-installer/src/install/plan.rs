//! Pure planning: disk state plus intent in, manifest out.
//!
//! Nothing here touches a device. Every rejection happens before the executor
//! gets a chance to write.

use super::layout::{Layout, LegacyLayout};
use super::manifest::{Manifest, Sequence, Target, TargetAction};
use super::meta::SlotLabel;
use super::partitions::{
    fixed_bytes, PartitionSize, PartitionSpec, BOOT_LABEL, CONFIG_FILE, EFI_LABEL,
    EPHEMERAL_LABEL, INITRAMFS_ASSET, KERNEL_ASSET, PARTITION_SPECS, STATE_LABEL,
};
use crate::assets::Asset;
use crate::config::{AssetSpec, Options};
use crate::errors::{InstallError, InstallResult};
use keel_hal::{DiskGeometry, PartitionEntry};
use std::path::{Path, PathBuf};

/// What the detector and the boot-slot record report about a disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskState {
    pub disk: PathBuf,
    pub geometry: DiskGeometry,
    pub layout: Layout,
    pub active_slot: Option<SlotLabel>,
}

pub fn plan(
    next: SlotLabel,
    sequence: Sequence,
    legacy_source: bool,
    state: &DiskState,
    opts: &Options,
) -> InstallResult<Manifest> {
    opts.validate()?;

    if legacy_source && !matches!(state.layout, Layout::Legacy(_)) {
        return Err(InstallError::planning(format!(
            "legacy source requested but {} holds a {} layout",
            state.disk.display(),
            state.layout.name()
        )));
    }

    let geometry = &state.geometry;
    let mut previous_slot = None;
    let mut legacy_config = None;
    let mut preserve = false;

    let mut targets = match (sequence, &state.layout) {
        (Sequence::Install, Layout::None) => fresh_targets(geometry)?,
        (Sequence::Install, _) if opts.force => fresh_targets(geometry)?,
        (Sequence::Install, layout) => {
            return Err(InstallError::planning(format!(
                "{} already holds a {} layout; use force to overwrite it",
                state.disk.display(),
                layout.name()
            )))
        }
        (Sequence::Upgrade, Layout::None) => {
            return Err(InstallError::planning(format!(
                "{} has no layout to upgrade",
                state.disk.display()
            )))
        }
        (Sequence::Upgrade, Layout::Legacy(legacy)) => {
            legacy_config = Some(PathBuf::from(CONFIG_FILE));
            migrate_targets(geometry, legacy)?
        }
        (Sequence::Upgrade, Layout::Current(entries)) => {
            check_next_slot(&next, state.active_slot.as_ref())?;
            previous_slot = state.active_slot.clone();
            if opts.force {
                force_targets(geometry, entries, opts.bootloader)?
            } else {
                if opts.zero {
                    return Err(InstallError::planning(
                        "zero would destroy the partitions a preserving upgrade keeps",
                    ));
                }
                preserve = true;
                preserve_targets(geometry, entries)?
            }
        }
    };

    assign_assets(&mut targets, &next, opts, legacy_config.is_some())?;

    Ok(Manifest {
        disk: state.disk.clone(),
        geometry: *geometry,
        sequence,
        layout: state.layout.clone(),
        next_slot: next,
        previous_slot,
        bootloader: opts.bootloader,
        force: opts.force,
        preserve,
        zero: opts.zero,
        legacy_source,
        targets,
        legacy_config,
        staging_dir: opts.staging_dir.clone(),
    })
}

fn check_next_slot(next: &SlotLabel, active: Option<&SlotLabel>) -> InstallResult<()> {
    if active == Some(next) {
        return Err(InstallError::planning(format!(
            "slot {} is currently active; upgrade into the other slot",
            next
        )));
    }
    Ok(())
}

fn fixed_lbas(spec: &PartitionSpec, bytes: u64, lbs: u64) -> InstallResult<u64> {
    if bytes % lbs != 0 {
        return Err(InstallError::planning(format!(
            "{} size {} is not a multiple of the {}-byte sector",
            spec.label, bytes, lbs
        )));
    }
    Ok(bytes / lbs)
}

fn new_target(spec: &'static PartitionSpec, first_lba: u64, length_lbas: u64) -> Target {
    Target {
        spec,
        number: spec.number(),
        first_lba,
        length_lbas,
        action: TargetAction::CreateFresh,
        preserve_content: false,
        existing: None,
        content_source: None,
        assets: Vec::new(),
    }
}

/// The from-scratch layout: partitions packed from the first usable LBA, the
/// remainder partition running to the last usable LBA.
pub fn fresh_targets(geometry: &DiskGeometry) -> InstallResult<Vec<Target>> {
    let lbs = geometry.logical_block_size;
    let fixed = fixed_bytes();
    let remainder_bytes = geometry
        .size_bytes
        .checked_sub(fixed + geometry.reserved_bytes())
        .unwrap_or(0);
    let remainder_lbas = remainder_bytes / lbs;
    if remainder_lbas == 0 {
        return Err(InstallError::planning(format!(
            "disk of {} bytes is too small: {} bytes of fixed partitions plus {} bytes \
             of GPT leave nothing for {}",
            geometry.size_bytes,
            fixed,
            geometry.reserved_bytes(),
            EPHEMERAL_LABEL
        )));
    }

    let mut next_lba = geometry.first_usable_lba();
    let mut targets = Vec::with_capacity(PARTITION_SPECS.len());
    for spec in PARTITION_SPECS.iter() {
        let length = match spec.size {
            PartitionSize::Fixed(bytes) => fixed_lbas(spec, bytes, lbs)?,
            PartitionSize::Remainder => remainder_lbas,
        };
        targets.push(new_target(spec, next_lba, length));
        next_lba += length;
    }

    debug_assert_eq!(next_lba - 1, geometry.last_usable_lba());
    Ok(targets)
}

/// Force upgrade: fresh geometry, Boot and State content carried across.
fn force_targets(
    geometry: &DiskGeometry,
    existing: &[PartitionEntry],
    bootloader: bool,
) -> InstallResult<Vec<Target>> {
    let mut targets = fresh_targets(geometry)?;
    for target in &mut targets {
        let carry = match target.label() {
            BOOT_LABEL | STATE_LABEL => true,
            // Without a new bootloader the old one has to survive.
            EFI_LABEL => !bootloader,
            _ => false,
        };
        if !carry {
            continue;
        }
        if let Some(entry) = existing.iter().find(|e| e.name == target.label()) {
            target.preserve_content = true;
            target.content_source = Some(entry.clone());
        }
    }
    Ok(targets)
}

/// Preserving upgrade: every existing partition is reused in place; a trailing
/// run of missing partitions is appended after the last one.
fn preserve_targets(
    geometry: &DiskGeometry,
    existing: &[PartitionEntry],
) -> InstallResult<Vec<Target>> {
    let lbs = geometry.logical_block_size;
    let last_usable = geometry.last_usable_lba();
    let mut targets = Vec::with_capacity(PARTITION_SPECS.len());
    let mut missing: Option<&str> = None;
    let mut next_lba = geometry.first_usable_lba();

    for spec in PARTITION_SPECS.iter() {
        match existing.iter().find(|e| e.name == spec.label) {
            Some(entry) => {
                if let Some(gap) = missing {
                    return Err(InstallError::planning(format!(
                        "{} is missing but {} after it exists; cannot place it without moving data",
                        gap, spec.label
                    )));
                }
                targets.push(Target {
                    spec,
                    number: entry.number,
                    first_lba: entry.first_lba,
                    length_lbas: entry.length_lbas(),
                    action: TargetAction::Reuse,
                    preserve_content: true,
                    existing: Some(entry.clone()),
                    content_source: None,
                    assets: Vec::new(),
                });
                next_lba = entry.last_lba + 1;
            }
            None => {
                missing.get_or_insert(spec.label);
                let length = match spec.size {
                    PartitionSize::Fixed(bytes) => fixed_lbas(spec, bytes, lbs)?,
                    PartitionSize::Remainder => (last_usable + 1).saturating_sub(next_lba),
                };
                if length == 0 || next_lba + length - 1 > last_usable {
                    return Err(InstallError::planning(format!(
                        "no room for missing partition {} after LBA {}",
                        spec.label, next_lba
                    )));
                }
                log::info!("{} is missing and will be created", spec.label);
                targets.push(new_target(spec, next_lba, length));
                next_lba += length;
            }
        }
    }
    Ok(targets)
}

/// Legacy migration: the fresh layout, with Boot and Ephemeral fed from the
/// old partitions.
fn migrate_targets(geometry: &DiskGeometry, legacy: &LegacyLayout) -> InstallResult<Vec<Target>> {
    let mut targets = fresh_targets(geometry)?;
    for target in &mut targets {
        let source = match target.label() {
            BOOT_LABEL => &legacy.boot,
            EPHEMERAL_LABEL => &legacy.ephemeral,
            _ => continue,
        };
        target.action = TargetAction::MigrateFromLegacy;
        target.preserve_content = true;
        target.content_source = Some(source.clone());
    }
    Ok(targets)
}

/// Index of the mountable target whose mount path is the longest prefix of `dest`.
fn route(targets: &[Target], dest: &Path) -> Option<usize> {
    targets
        .iter()
        .enumerate()
        .filter(|(_, t)| t.spec.is_mountable())
        .filter_map(|(idx, t)| t.spec.mount_path.map(|mp| (idx, Path::new(mp))))
        .filter(|(_, mp)| dest.starts_with(mp) && dest != *mp)
        .max_by_key(|(_, mp)| mp.components().count())
        .map(|(idx, _)| idx)
}

fn push_routed(targets: &mut [Target], spec: &AssetSpec, only: Option<&str>) -> InstallResult<()> {
    let idx = route(targets, &spec.destination).ok_or_else(|| {
        InstallError::planning(format!(
            "asset destination {} is not under a managed mount",
            spec.destination.display()
        ))
    })?;
    if let Some(label) = only {
        if targets[idx].label() != label {
            return Err(InstallError::planning(format!(
                "asset destination {} must be under the {} partition",
                spec.destination.display(),
                label
            )));
        }
    }
    targets[idx]
        .assets
        .push(Asset::new(spec.source.clone(), spec.destination.clone()));
    Ok(())
}

fn mount_path_of(targets: &[Target], label: &str) -> InstallResult<PathBuf> {
    targets
        .iter()
        .find(|t| t.label() == label)
        .and_then(|t| t.spec.mount_path)
        .map(PathBuf::from)
        .ok_or_else(|| InstallError::planning(format!("no mountable {} partition", label)))
}

fn assign_assets(
    targets: &mut [Target],
    next: &SlotLabel,
    opts: &Options,
    legacy_config: bool,
) -> InstallResult<()> {
    let slot_dir = mount_path_of(targets, BOOT_LABEL)?.join(next.as_str());
    let boot = targets
        .iter()
        .position(|t| t.label() == BOOT_LABEL)
        .ok_or_else(|| InstallError::planning("no BOOT partition"))?;

    if let Some(kernel) = &opts.kernel {
        targets[boot]
            .assets
            .push(Asset::new(kernel.clone(), slot_dir.join(KERNEL_ASSET)));
    }
    if let Some(initramfs) = &opts.initramfs {
        targets[boot]
            .assets
            .push(Asset::new(initramfs.clone(), slot_dir.join(INITRAMFS_ASSET)));
    }

    if let Some(config) = &opts.machine_config {
        let state = targets
            .iter()
            .position(|t| t.label() == STATE_LABEL)
            .ok_or_else(|| InstallError::planning("no STATE partition"))?;
        let carried = legacy_config
            || targets[state].action == TargetAction::Reuse
            || targets[state].content_source.is_some();
        if carried {
            log::warn!("STATE content is carried over; not writing machine config {}", config);
        } else {
            let dest = mount_path_of(targets, STATE_LABEL)?.join(CONFIG_FILE);
            targets[state].assets.push(Asset::new(config.clone(), dest));
        }
    }

    if opts.bootloader {
        for spec in &opts.bootloader_assets {
            push_routed(targets, spec, Some(EFI_LABEL))?;
        }
    }
    for spec in &opts.extra_assets {
        push_routed(targets, spec, None)?;
    }
    Ok(())
}
