// Volume enumeration over sysinfo.
//
// This is the default DriveEnumerator implementation. Device-change
// debouncing and richer hardware introspection live outside the core; this
// layer only maps mounted volumes to letters and coarse drive types.

use super::{DiscoveredDrive, DriveEnumerator, DriveType};
use anyhow::Result;
use std::path::Path;
use sysinfo::{Disk, DiskKind, Disks};

pub struct SysinfoEnumerator;

impl SysinfoEnumerator {
    pub fn new() -> Self {
        Self
    }

    fn classify(disk: &Disk) -> DriveType {
        if disk.is_removable() {
            return DriveType::Removable;
        }
        match disk.kind() {
            DiskKind::HDD => DriveType::HDD,
            DiskKind::SSD => DriveType::SSD,
            DiskKind::Unknown(_) => DriveType::Unknown,
        }
    }
}

impl Default for SysinfoEnumerator {
    fn default() -> Self {
        Self::new()
    }
}

impl DriveEnumerator for SysinfoEnumerator {
    fn list(&self) -> Result<Vec<DiscoveredDrive>> {
        let disks = Disks::new_with_refreshed_list();
        let mut found = Vec::new();

        for disk in disks.list() {
            let Some(letter) = letter_from_mount(disk.mount_point()) else {
                tracing::debug!(
                    mount = %disk.mount_point().display(),
                    "skipping volume without a drive letter"
                );
                continue;
            };

            found.push(DiscoveredDrive {
                letter,
                drive_type: Self::classify(disk),
                size_bytes: disk.total_space(),
                removable: disk.is_removable(),
            });
        }

        found.sort_by_key(|d| d.letter);
        found.dedup_by_key(|d| d.letter);
        Ok(found)
    }
}

/// Extract a drive letter from a mount point like `C:\`.
///
/// Mount points without the `X:` shape (everything on non-Windows hosts)
/// yield `None`; such volumes are managed through explicit config overrides
/// instead.
pub fn letter_from_mount(mount: &Path) -> Option<char> {
    let text = mount.to_str()?;
    let mut chars = text.chars();
    let letter = chars.next()?;
    if !letter.is_ascii_alphabetic() {
        return None;
    }
    match chars.next() {
        Some(':') => {}
        _ => return None,
    }
    match chars.next() {
        None | Some('\\') | Some('/') => Some(letter.to_ascii_uppercase()),
        Some(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn letters_parse_from_windows_mounts() {
        assert_eq!(letter_from_mount(&PathBuf::from("C:\\")), Some('C'));
        assert_eq!(letter_from_mount(&PathBuf::from("e:")), Some('E'));
        assert_eq!(letter_from_mount(&PathBuf::from("F:/")), Some('F'));
    }

    #[test]
    fn non_letter_mounts_are_skipped() {
        assert_eq!(letter_from_mount(&PathBuf::from("/")), None);
        assert_eq!(letter_from_mount(&PathBuf::from("/mnt/data")), None);
        assert_eq!(letter_from_mount(&PathBuf::from("1:\\")), None);
        assert_eq!(letter_from_mount(&PathBuf::from("C:extra\\path")), None);
    }
}
