//! Kernel mount list parsing and already-mounted detection (spec.md section
//! 4.10, step 2; section 5 "Kernel mount table").

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{MountError, Result};
use crate::escape;
use crate::loopdev;
use crate::volume::VolumeKind;

/// One line of `/proc/mounts` (or a platform's equivalent kernel mount
/// table), fields unescaped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub fsname: String,
    pub mountpoint: PathBuf,
    pub fstype: String,
}

fn unescape_field(field: &str) -> String {
    String::from_utf8_lossy(&escape::decode(field.as_bytes())).into_owned()
}

/// Parse the whitespace-separated, octal-escaped lines of a kernel mount
/// table. Malformed lines (fewer than three fields) are skipped rather than
/// treated as a parse failure, since the table is kernel-maintained and not
/// under this crate's control.
pub fn parse_mounts(contents: &str) -> Vec<MountEntry> {
    let mut entries = Vec::new();
    for line in contents.lines() {
        let mut fields = line.split_whitespace();
        let (Some(fsname), Some(mountpoint), Some(fstype)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        entries.push(MountEntry {
            fsname: unescape_field(fsname),
            mountpoint: PathBuf::from(unescape_field(mountpoint)),
            fstype: unescape_field(fstype),
        });
    }
    entries
}

#[cfg(target_os = "linux")]
const MOUNT_TABLE_PATH: &str = "/proc/mounts";

/// Read and parse the live kernel mount table.
pub fn read_system_mounts() -> Result<Vec<MountEntry>> {
    #[cfg(target_os = "linux")]
    {
        let contents = fs::read_to_string(MOUNT_TABLE_PATH)
            .map_err(|e| MountError::RegistryIo(anyhow::anyhow!(e)))?;
        Ok(parse_mounts(&contents))
    }
    #[cfg(not(target_os = "linux"))]
    {
        Err(MountError::NotSupported)
    }
}

/// Resolve a mount-table source field to the path that should be compared
/// against a volume's canonical source: loop-backed devices resolve to
/// their backing file, everything else passes through unchanged.
fn resolve_source(fsname: &str) -> PathBuf {
    let path = Path::new(fsname);
    if fsname.starts_with("/dev/loop") {
        loopdev::loop_file(path).unwrap_or_else(|_| path.to_path_buf())
    } else {
        path.to_path_buf()
    }
}

fn source_matches(resolved: &Path, canonical: &Path, kind: VolumeKind) -> bool {
    if kind.case_insensitive_match() {
        resolved.to_string_lossy().eq_ignore_ascii_case(&canonical.to_string_lossy())
    } else {
        resolved == canonical
    }
}

/// Whether `canonical_source` is mounted at `mountpoint` according to the
/// live kernel mount table, per the matching rules in spec.md section 4.10
/// step 2: loop-backed sources are resolved to their backing file before
/// comparison, and the comparison is case-insensitive for SMB/CIFS/NCP.
pub fn is_mounted(mountpoint: &Path, canonical_source: &Path, kind: VolumeKind) -> Result<bool> {
    let entries = read_system_mounts()?;
    Ok(entries.iter().any(|entry| {
        entry.mountpoint == mountpoint
            && source_matches(&resolve_source(&entry.fsname), canonical_source, kind)
    }))
}

#[cfg(test)]
mod test {
    use super::*;

    const SAMPLE: &str = "\
/dev/sda1 / ext4 rw,relatime 0 0
server:/share /mnt/nfs nfs4 rw 0 0
//server/share\\040with\\040space /mnt/cifs cifs rw 0 0
";

    #[test]
    fn test_parse_mounts_basic() {
        let entries = parse_mounts(SAMPLE);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].fsname, "/dev/sda1");
        assert_eq!(entries[0].mountpoint, PathBuf::from("/"));
        assert_eq!(entries[1].fstype, "nfs4");
    }

    #[test]
    fn test_parse_mounts_unescapes_spaces() {
        let entries = parse_mounts(SAMPLE);
        assert_eq!(entries[2].fsname, "//server/share with space");
    }

    #[test]
    fn test_parse_mounts_skips_malformed_lines() {
        let entries = parse_mounts("only-one-field\n\n/dev/sdb1 /mnt ext4 rw 0 0\n");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].fsname, "/dev/sdb1");
    }

    #[test]
    fn test_source_matches_case_insensitive_for_cifs() {
        assert!(source_matches(
            Path::new("//SERVER/Share"),
            Path::new("//server/share"),
            VolumeKind::Cifs
        ));
    }

    #[test]
    fn test_source_matches_case_sensitive_for_nfs() {
        assert!(!source_matches(
            Path::new("/srv/Vol"),
            Path::new("/srv/vol"),
            VolumeKind::Nfs
        ));
    }
}
