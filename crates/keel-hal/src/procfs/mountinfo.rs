//! Parsing helpers for `/proc/self/mountinfo` (and similar mountinfo files).

use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    pub mount_point: PathBuf,
    pub fstype: String,
    pub source: String,
}

pub fn parse_mountinfo(content: &str) -> Vec<MountInfo> {
    content
        .lines()
        .filter_map(|line| {
            // <id> <parent> <major:minor> <root> <mount point> <opts...>
            //   - <fstype> <source> <superopts>
            let (pre, post) = line.split_once(" - ")?;
            let pre_fields: Vec<&str> = pre.split_whitespace().collect();
            if pre_fields.len() < 5 {
                return None;
            }
            let mut post_fields = post.split_whitespace();
            let fstype = post_fields.next()?.to_string();
            let source = post_fields.next()?.to_string();
            Some(MountInfo {
                mount_point: PathBuf::from(unescape_mount_path(pre_fields[4])),
                fstype,
                source,
            })
        })
        .collect()
}

pub fn is_mounted_from_info(path: &Path, entries: &[MountInfo]) -> bool {
    let target = normalize_path(path);
    entries
        .iter()
        .any(|entry| normalize_path(&entry.mount_point) == target)
}

/// Mount points at or below `target`, deepest first.
pub fn mounts_below(target: &Path, entries: &[MountInfo]) -> Vec<PathBuf> {
    let mut under: Vec<PathBuf> = entries
        .iter()
        .map(|e| e.mount_point.clone())
        .filter(|mp| mp.starts_with(target))
        .collect();
    under.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
    under.dedup();
    under
}

/// Mount points whose source is `disk` itself or one of its partitions.
pub fn mounted_under_device(entries: &[MountInfo], disk: &Path) -> Vec<PathBuf> {
    let disk = disk.to_string_lossy();
    let mut mounts: Vec<PathBuf> = entries
        .iter()
        .filter(|e| is_partition_of(&e.source, &disk))
        .map(|e| e.mount_point.clone())
        .collect();
    mounts.sort();
    mounts.dedup();
    mounts
}

fn is_partition_of(source: &str, disk: &str) -> bool {
    let Some(rest) = source.strip_prefix(disk) else {
        return false;
    };
    let rest = rest.strip_prefix('p').unwrap_or(rest);
    rest.chars().all(|c| c.is_ascii_digit())
}

pub fn unescape_mount_path(raw: &str) -> String {
    raw.replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\012", "\n")
        .replace("\\134", "\\")
}

fn normalize_path(path: &Path) -> String {
    let s = path.to_string_lossy();
    if s.len() > 1 && s.ends_with('/') {
        s.trim_end_matches('/').to_string()
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "36 28 0:31 / / rw,relatime - xfs /dev/sda5 rw\n\
                          37 36 0:32 / /boot rw,relatime - vfat /dev/sda3 rw\n\
                          38 37 0:33 / /boot/EFI rw,relatime - vfat /dev/sda1 rw\n\
                          39 36 0:34 / /mnt/other rw,relatime - xfs /dev/sdab1 rw\n";

    #[test]
    fn parse_mountinfo_extracts_mountpoints_and_sources() {
        let entries = parse_mountinfo(SAMPLE);
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[1].mount_point, PathBuf::from("/boot"));
        assert_eq!(entries[1].fstype, "vfat");
        assert_eq!(entries[1].source, "/dev/sda3");
    }

    #[test]
    fn is_mounted_from_info_matches_paths() {
        let entries = parse_mountinfo(SAMPLE);
        assert!(is_mounted_from_info(Path::new("/boot/"), &entries));
        assert!(!is_mounted_from_info(Path::new("/mnt"), &entries));
    }

    #[test]
    fn mountinfo_unescapes_paths() {
        let sample = "36 28 0:31 / /mnt/data\\040disk rw,relatime - xfs /dev/sda3 rw\n";
        let entries = parse_mountinfo(sample);
        assert_eq!(entries[0].mount_point, PathBuf::from("/mnt/data disk"));
    }

    #[test]
    fn mounts_below_orders_deepest_first() {
        let entries = parse_mountinfo(SAMPLE);
        assert_eq!(
            mounts_below(Path::new("/boot"), &entries),
            vec![PathBuf::from("/boot/EFI"), PathBuf::from("/boot")]
        );
    }

    #[test]
    fn mounted_under_device_ignores_similar_disk_names() {
        let entries = parse_mountinfo(SAMPLE);
        assert_eq!(
            mounted_under_device(&entries, Path::new("/dev/sda")),
            vec![
                PathBuf::from("/"),
                PathBuf::from("/boot"),
                PathBuf::from("/boot/EFI")
            ]
        );
    }

    #[test]
    fn nvme_partitions_match_their_disk() {
        assert!(is_partition_of("/dev/nvme0n1p2", "/dev/nvme0n1"));
        assert!(!is_partition_of("/dev/nvme0n10p2", "/dev/nvme0n1"));
    }
}
