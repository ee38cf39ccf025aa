//! Association registry: the append-only `cmtab`, plus best-effort edits to
//! the system mtab (`smtab`) where the kernel table is a writable plain file
//! (spec.md C7).

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use nix::fcntl::{flock, FlockArg};

use crate::error::{MountError, Result};
use crate::escape;

/// A single `cmtab` record (spec.md section 4.7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmtabRecord {
    pub mountpoint: PathBuf,
    pub container: PathBuf,
    pub loop_device: Option<PathBuf>,
    pub crypto_device: Option<PathBuf>,
}

/// Which field a lookup/remove matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Mountpoint,
    Container,
    LoopDevice,
    CryptoDevice,
}

impl CmtabRecord {
    fn field(&self, field: Field) -> Option<&Path> {
        match field {
            Field::Mountpoint => Some(&self.mountpoint),
            Field::Container => Some(&self.container),
            Field::LoopDevice => self.loop_device.as_deref(),
            Field::CryptoDevice => self.crypto_device.as_deref(),
        }
    }

    fn serialize(&self) -> Vec<u8> {
        let fields = [
            self.mountpoint.as_os_str().to_string_lossy(),
            self.container.as_os_str().to_string_lossy(),
            opt_path_str(&self.loop_device),
            opt_path_str(&self.crypto_device),
        ];
        let mut line = Vec::new();
        for (i, field) in fields.iter().enumerate() {
            if i > 0 {
                line.push(b'\t');
            }
            line.extend(escape::encode(field.as_bytes()));
        }
        line.push(b'\n');
        line
    }

    fn parse(line: &[u8]) -> Option<CmtabRecord> {
        let parts: Vec<&[u8]> = line.split(|&b| b == b'\t').collect();
        if parts.len() != 4 {
            return None;
        }
        let decoded: Vec<String> = parts
            .iter()
            .map(|p| String::from_utf8_lossy(&escape::decode(p)).into_owned())
            .collect();

        Some(CmtabRecord {
            mountpoint: PathBuf::from(&decoded[0]),
            container: PathBuf::from(&decoded[1]),
            loop_device: str_to_opt_path(&decoded[2]),
            crypto_device: str_to_opt_path(&decoded[3]),
        })
    }
}

fn opt_path_str(p: &Option<PathBuf>) -> std::borrow::Cow<'_, str> {
    match p {
        Some(path) => path.to_string_lossy(),
        None => std::borrow::Cow::Borrowed("-"),
    }
}

fn str_to_opt_path(s: &str) -> Option<PathBuf> {
    if s == "-" {
        None
    } else {
        Some(PathBuf::from(s))
    }
}

/// RAII advisory lock over a whole file, released on drop.
struct LockedFile {
    file: File,
}

impl LockedFile {
    fn open_for_append(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .append(true)
            .mode(0o644)
            .open(path)
            .map_err(|e| MountError::RegistryIo(anyhow::anyhow!(e)))?;
        flock(file.as_raw_fd(), FlockArg::LockExclusive)
            .map_err(|e| MountError::RegistryLock(anyhow::anyhow!(e)))?;
        Ok(LockedFile { file })
    }

    fn open_shared_for_read(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .open(path)
            .map_err(|e| MountError::RegistryIo(anyhow::anyhow!(e)))?;
        flock(file.as_raw_fd(), FlockArg::LockShared)
            .map_err(|e| MountError::RegistryLock(anyhow::anyhow!(e)))?;
        Ok(LockedFile { file })
    }

    fn open_exclusive_for_rw(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| MountError::RegistryIo(anyhow::anyhow!(e)))?;
        flock(file.as_raw_fd(), FlockArg::LockExclusive)
            .map_err(|e| MountError::RegistryLock(anyhow::anyhow!(e)))?;
        Ok(LockedFile { file })
    }
}

/// Append a record to `path`, creating it (mode 0644) if needed. The write
/// happens under an exclusive, blocking, whole-file advisory lock.
pub fn append(path: &Path, record: &CmtabRecord) -> Result<()> {
    let mut locked = LockedFile::open_for_append(path)?;
    let payload = record.serialize();
    let written = locked
        .file
        .write(&payload)
        .map_err(|e| MountError::RegistryIo(anyhow::anyhow!(e)))?;
    if written != payload.len() {
        return Err(MountError::RegistryIo(anyhow::anyhow!(
            "short write to registry file"
        )));
    }
    Ok(())
}

/// Look up a record by field. When several records match, the **last** one
/// in the file wins (handles stacked overmounts).
pub fn lookup(path: &Path, field: Field, key: &Path) -> Result<Option<CmtabRecord>> {
    if !path.exists() {
        return Ok(None);
    }
    let locked = LockedFile::open_shared_for_read(path)?;
    let reader = BufReader::new(&locked.file);

    let mut found = None;
    for line in reader.split(b'\n') {
        let line = line.map_err(|e| MountError::RegistryIo(anyhow::anyhow!(e)))?;
        if line.is_empty() {
            continue;
        }
        if let Some(record) = CmtabRecord::parse(&line) {
            if record.field(field) == Some(key) {
                found = Some(record);
            }
        }
    }
    Ok(found)
}

/// Remove a matching record. Per spec.md section 4.7 / section 9: this
/// removes the **last** matching line and shifts every subsequent byte
/// forward to fill the gap, rather than removing only the most-recent entry
/// for a given mountpoint when that entry is not also the lexically last
/// match. Returns whether a record was removed.
pub fn remove(path: &Path, field: Field, key: &Path) -> Result<bool> {
    if !path.exists() {
        return Ok(false);
    }
    let mut locked = LockedFile::open_exclusive_for_rw(path)?;

    let mut contents = Vec::new();
    locked
        .file
        .read_to_end(&mut contents)
        .map_err(|e| MountError::RegistryIo(anyhow::anyhow!(e)))?;

    // Find the byte offset just past the end of the last matching line.
    let mut cut_point = None;
    let mut offset = 0usize;
    for line in contents.split(|&b| b == b'\n') {
        let line_end = offset + line.len() + 1; // +1 for the newline itself
        if !line.is_empty() {
            if let Some(record) = CmtabRecord::parse(line) {
                if record.field(field) == Some(key) {
                    cut_point = Some((offset, line_end.min(contents.len())));
                }
            }
        }
        offset = line_end;
    }

    let Some((match_start, match_end)) = cut_point else {
        return Ok(false);
    };

    let mut compacted = Vec::with_capacity(contents.len() - (match_end - match_start));
    compacted.extend_from_slice(&contents[..match_start]);
    compacted.extend_from_slice(&contents[match_end..]);

    locked
        .file
        .seek(SeekFrom::Start(0))
        .map_err(|e| MountError::RegistryIo(anyhow::anyhow!(e)))?;
    locked
        .file
        .write_all(&compacted)
        .map_err(|e| MountError::RegistryIo(anyhow::anyhow!(e)))?;
    locked
        .file
        .set_len(compacted.len() as u64)
        .map_err(|e| MountError::RegistryIo(anyhow::anyhow!(e)))?;

    Ok(true)
}

/// A standard mtab entry, written only where the platform's kernel mtab is a
/// writable plain file (spec.md section 3, "Smtab record").
#[derive(Debug, Clone)]
pub struct SmtabRecord {
    pub device: String,
    pub mountpoint: PathBuf,
    pub fstype: String,
    pub options: String,
}

impl SmtabRecord {
    fn serialize(&self) -> Vec<u8> {
        let fields = [
            self.device.clone(),
            self.mountpoint.to_string_lossy().into_owned(),
            self.fstype.clone(),
            self.options.clone(),
        ];
        let mut line = Vec::new();
        for (i, field) in fields.iter().enumerate() {
            if i > 0 {
                line.push(b' ');
            }
            line.extend(escape::encode(field.as_bytes()));
        }
        line.extend_from_slice(b" 0 0\n");
        line
    }
}

/// Where the platform's system mtab is a plain writable file, this is
/// `Some(path)`; where the kernel table is read-only (or synthetic), it is
/// `None` and smtab operations report [`MountError::NotSupported`].
pub type SmtabPath = Option<PathBuf>;

pub fn smtab_add(smtab: &SmtabPath, record: &SmtabRecord) -> Result<()> {
    let Some(path) = smtab else {
        return Err(MountError::NotSupported);
    };
    let mut locked = LockedFile::open_for_append(path)?;
    let payload = record.serialize();
    locked
        .file
        .write_all(&payload)
        .map_err(|e| MountError::RegistryIo(anyhow::anyhow!(e)))?;
    Ok(())
}

/// Mirrors `cmtab` removal by mountpoint. Per spec.md section 8's boundary
/// case, a non-writable smtab platform reports success (0) on remove, not
/// an error: there is nothing to undo.
pub fn smtab_remove(smtab: &SmtabPath, mountpoint: &Path) -> Result<()> {
    let Some(path) = smtab else {
        return Ok(());
    };
    remove(path, Field::Mountpoint, mountpoint).map(|_| ())
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::NamedTempFile;

    fn rec(mountpoint: &str, container: &str, loop_dev: Option<&str>, crypto_dev: Option<&str>) -> CmtabRecord {
        CmtabRecord {
            mountpoint: PathBuf::from(mountpoint),
            container: PathBuf::from(container),
            loop_device: loop_dev.map(PathBuf::from),
            crypto_device: crypto_dev.map(PathBuf::from),
        }
    }

    #[test]
    fn test_append_and_lookup_round_trip() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path();

        let record = rec("/mnt/a", "/srv/img.bin", Some("/dev/loop3"), Some("/dev/mapper/x"));
        append(path, &record).unwrap();

        let found = lookup(path, Field::Mountpoint, Path::new("/mnt/a"))
            .unwrap()
            .unwrap();
        assert_eq!(found, record);
    }

    #[test]
    fn test_append_remove_then_not_found() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path();

        let record = rec("/mnt/a", "/srv/img.bin", Some("/dev/loop3"), Some("/dev/mapper/x"));
        append(path, &record).unwrap();

        assert!(remove(path, Field::Mountpoint, Path::new("/mnt/a")).unwrap());
        assert!(lookup(path, Field::Mountpoint, Path::new("/mnt/a")).unwrap().is_none());
    }

    #[test]
    fn test_lookup_last_match_wins() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path();

        append(path, &rec("/mnt/a", "/srv/one.bin", Some("/dev/loop1"), Some("/dev/mapper/one"))).unwrap();
        append(path, &rec("/mnt/a", "/srv/two.bin", Some("/dev/loop2"), Some("/dev/mapper/two"))).unwrap();

        let found = lookup(path, Field::Mountpoint, Path::new("/mnt/a")).unwrap().unwrap();
        assert_eq!(found.container, PathBuf::from("/srv/two.bin"));
    }

    #[test]
    fn test_remove_preserves_other_records_and_order() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path();

        append(path, &rec("/mnt/a", "/srv/a.bin", None, None)).unwrap();
        append(path, &rec("/mnt/b", "/srv/b.bin", None, None)).unwrap();
        append(path, &rec("/mnt/c", "/srv/c.bin", None, None)).unwrap();

        assert!(remove(path, Field::Mountpoint, Path::new("/mnt/b")).unwrap());

        assert!(lookup(path, Field::Mountpoint, Path::new("/mnt/a")).unwrap().is_some());
        assert!(lookup(path, Field::Mountpoint, Path::new("/mnt/b")).unwrap().is_none());
        let c = lookup(path, Field::Mountpoint, Path::new("/mnt/c")).unwrap().unwrap();
        assert_eq!(c.container, PathBuf::from("/srv/c.bin"));
    }

    #[test]
    fn test_remove_last_match_shifts_everything_after_forward() {
        // Two stacked entries for the same mountpoint, with another entry in
        // between; per spec.md section 9 this crate removes the *last*
        // textual match and compacts everything after it, not "the most
        // recent entry for this mountpoint" in a stack-aware sense.
        let file = NamedTempFile::new().unwrap();
        let path = file.path();

        append(path, &rec("/mnt/a", "/srv/first.bin", None, None)).unwrap();
        append(path, &rec("/mnt/other", "/srv/other.bin", None, None)).unwrap();
        append(path, &rec("/mnt/a", "/srv/second.bin", None, None)).unwrap();

        assert!(remove(path, Field::Mountpoint, Path::new("/mnt/a")).unwrap());

        // The earlier /mnt/a entry and the unrelated entry both survive.
        let remaining = lookup(path, Field::Mountpoint, Path::new("/mnt/a")).unwrap().unwrap();
        assert_eq!(remaining.container, PathBuf::from("/srv/first.bin"));
        assert!(lookup(path, Field::Mountpoint, Path::new("/mnt/other")).unwrap().is_some());
    }

    #[test]
    fn test_remove_missing_returns_false() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path();
        append(path, &rec("/mnt/a", "/srv/a.bin", None, None)).unwrap();

        assert!(!remove(path, Field::Mountpoint, Path::new("/mnt/nope")).unwrap());
    }

    #[test]
    fn test_dash_decodes_to_absent() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path();
        append(path, &rec("/mnt/a", "/srv/a.bin", None, None)).unwrap();

        let found = lookup(path, Field::Mountpoint, Path::new("/mnt/a")).unwrap().unwrap();
        assert_eq!(found.loop_device, None);
        assert_eq!(found.crypto_device, None);
    }

    #[test]
    fn test_smtab_not_supported_on_readonly_platform() {
        let smtab: SmtabPath = None;
        let record = SmtabRecord {
            device: "/dev/sda1".into(),
            mountpoint: PathBuf::from("/mnt/x"),
            fstype: "ext4".into(),
            options: "rw".into(),
        };
        assert!(matches!(smtab_add(&smtab, &record), Err(MountError::NotSupported)));
        // Remove is success (0) even when unsupported: nothing to undo.
        assert!(smtab_remove(&smtab, Path::new("/mnt/x")).is_ok());
    }
}
