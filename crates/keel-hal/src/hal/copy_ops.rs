//! Native file tree copy used for content migration and staging.

use crate::{HalError, HalResult};
use nix::sys::stat::{dev_t, mknod, mode_t, Mode, SFlag};
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use walkdir::WalkDir;

/// Options controlling how trees are copied.
#[derive(Debug, Clone)]
pub struct CopyOptions {
    /// Preserve ownership (uid/gid) when supported.
    pub preserve_owner: bool,
    /// Preserve permissions (mode bits).
    pub preserve_perms: bool,
}

impl CopyOptions {
    /// Archive-style copy (similar to `cp -a`).
    pub fn archive() -> Self {
        Self {
            preserve_owner: true,
            preserve_perms: true,
        }
    }

    /// VFAT-safe copy (no owner/perms).
    pub fn vfat_safe() -> Self {
        Self {
            preserve_owner: false,
            preserve_perms: false,
        }
    }
}

/// Progress information for a copy operation.
#[derive(Debug, Clone, Default)]
pub struct CopyProgress {
    pub bytes_copied: u64,
    pub bytes_total: u64,
    pub files_copied: u64,
    pub files_total: u64,
}

/// Copy operations abstraction.
pub trait CopyOps {
    /// Recursively copy a directory tree from `src` into `dst`, reporting progress.
    ///
    /// The callback returns `true` to continue or `false` to abort the copy.
    fn copy_tree_native(
        &self,
        src: &Path,
        dst: &Path,
        opts: &CopyOptions,
        on_progress: &mut dyn FnMut(CopyProgress) -> bool,
    ) -> HalResult<()>;
}

fn walk_err(err: walkdir::Error) -> HalError {
    HalError::Io(io::Error::from(err))
}

/// Bytes held in regular files and the number of non-directory entries
/// (files, symlinks, fifos, sockets, device nodes) below `root`.
///
/// Symlinks are counted, not followed.
pub fn tree_size(root: &Path) -> HalResult<(u64, u64)> {
    let mut bytes = 0;
    let mut files = 0;
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(walk_err)?;
        let ft = entry.file_type();
        if ft.is_dir() {
            continue;
        }
        files += 1;
        if ft.is_file() {
            bytes += entry.metadata().map_err(walk_err)?.len();
        }
    }
    Ok((bytes, files))
}

fn remove_existing(path: &Path) -> io::Result<()> {
    match path.symlink_metadata() {
        Ok(meta) if !meta.is_dir() => fs::remove_file(path),
        _ => Ok(()),
    }
}

/// Recreate a fifo, socket or device node with the same type, mode and device number.
fn copy_node(out: &Path, meta: &fs::Metadata) -> HalResult<()> {
    let mode = meta.mode() as mode_t;
    let kind = SFlag::from_bits_truncate(mode & SFlag::S_IFMT.bits());
    let perm = Mode::from_bits_truncate(mode & 0o7777);
    mknod(out, kind, perm, meta.rdev() as dev_t)?;
    Ok(())
}

/// Walkdir-backed tree copy shared by the Linux and fake backends.
///
/// Directories are visited after their contents so restrictive directory
/// modes are applied last.
pub fn copy_tree(
    src: &Path,
    dst: &Path,
    opts: &CopyOptions,
    on_progress: &mut dyn FnMut(CopyProgress) -> bool,
) -> HalResult<()> {
    let (bytes_total, files_total) = tree_size(src)?;
    let mut progress = CopyProgress {
        bytes_total,
        files_total,
        ..CopyProgress::default()
    };

    fs::create_dir_all(dst)?;

    for entry in WalkDir::new(src)
        .follow_links(false)
        .contents_first(true)
        .sort_by_file_name()
    {
        let entry = entry.map_err(walk_err)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| HalError::Other(e.to_string()))?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let out = dst.join(rel);
        let ft = entry.file_type();
        let meta = entry.metadata().map_err(walk_err)?;

        if ft.is_dir() {
            fs::create_dir_all(&out)?;
        } else {
            if let Some(parent) = out.parent() {
                fs::create_dir_all(parent)?;
            }
            if ft.is_file() {
                let copied = if opts.preserve_perms {
                    fs::copy(entry.path(), &out)?
                } else {
                    let mut reader = fs::File::open(entry.path())?;
                    let mut writer = fs::File::create(&out)?;
                    io::copy(&mut reader, &mut writer)?
                };
                progress.bytes_copied += copied;
            } else if ft.is_symlink() {
                let link = fs::read_link(entry.path())?;
                remove_existing(&out)?;
                std::os::unix::fs::symlink(&link, &out)?;
            } else {
                remove_existing(&out)?;
                copy_node(&out, &meta)?;
            }
            progress.files_copied += 1;
            if !on_progress(progress.clone()) {
                return Err(HalError::CopyAborted(src.display().to_string()));
            }
        }

        // Permissions on a symlink would apply to its target.
        if opts.preserve_perms && !ft.is_symlink() {
            fs::set_permissions(&out, meta.permissions())?;
        }
        if opts.preserve_owner {
            std::os::unix::fs::lchown(&out, Some(meta.uid()), Some(meta.gid()))?;
        }
    }

    Ok(())
}
