//! dm-crypt/LUKS crypto layer, driven through the `cryptsetup` helper
//! (spec.md C5).

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::error::{MountError, Result};
use crate::exe::{OutputChecker, RunAndCheck};
use crate::loopdev;

/// A request to open a crypto mapping over a lower device. `container` is
/// the original container path named in the volume record; `lower_device` is
/// what the mapping is actually layered on (the container itself, or a loop
/// device standing in for a file-backed one). The two differ for file-backed
/// containers, and the mapping's short name is always derived from
/// `container`, never `lower_device` (spec.md section 4.5).
#[derive(Debug, Clone)]
pub struct CryptoOpenRequest<'a> {
    pub container: &'a Path,
    pub lower_device: &'a Path,
    pub is_luks: bool,
    pub cipher: Option<&'a str>,
    pub hash: Option<&'a str>,
    pub key: &'a [u8],
    pub readonly: bool,
}

/// The mapping produced by a successful [`crypto_open`].
#[derive(Debug, Clone)]
pub struct CryptoInfo {
    pub name: String,
    pub device: PathBuf,
}

/// Derive the dm-crypt mapping name from a container path: every
/// non-alphanumeric byte becomes an underscore (spec.md section 4.5).
pub fn mangle_name(container_path: &Path) -> String {
    container_path
        .to_string_lossy()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn mapper_path(name: &str) -> PathBuf {
    PathBuf::from("/dev/mapper").join(name)
}

/// Probe whether `path` holds a LUKS header. If `path` is not itself a block
/// device, a transient read-only loop device is used for the duration of the
/// check.
pub fn is_luks(path: &Path, is_blkdev: bool) -> Result<bool> {
    let loop_guard: Option<PathBuf> = if is_blkdev {
        None
    } else {
        Some(loopdev::loop_setup(path, true)?)
    };
    let probe_path: &Path = loop_guard.as_deref().unwrap_or(path);

    let result = Command::new("cryptsetup")
        .arg("isLuks")
        .arg(probe_path)
        .output();

    if let Some(dev) = &loop_guard {
        let _ = loopdev::loop_release(dev);
    }

    match result {
        Ok(output) => Ok(output.status.success()),
        Err(e) => Err(MountError::CryptoHelperFailed(anyhow::anyhow!(e))),
    }
}

/// Open a crypto mapping: `luksOpen` for LUKS containers, `create` (plain
/// dm-crypt) otherwise. The raw key is written to the helper's stdin.
pub fn crypto_open(request: &CryptoOpenRequest) -> Result<CryptoInfo> {
    let name = mangle_name(request.container);

    let mut cmd = Command::new("cryptsetup");
    if request.readonly {
        cmd.arg("--readonly");
    }

    if request.is_luks {
        if let Some(cipher) = request.cipher {
            cmd.arg("-c").arg(cipher);
        }
        cmd.arg("luksOpen").arg(request.lower_device).arg(&name);
    } else {
        if let Some(cipher) = request.cipher {
            cmd.arg("-c").arg(cipher);
        }
        if let Some(hash) = request.hash {
            cmd.arg("-h").arg(hash);
        }
        cmd.arg("--key-file=-")
            .arg("create")
            .arg(&name)
            .arg(request.lower_device);
    }

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| MountError::CryptoHelperFailed(anyhow::anyhow!(e)))?;

    // Writes to a pipe whose reader has exited raise EPIPE as an I/O error
    // rather than terminating the process (SIGPIPE is ignored by the Rust
    // runtime by default); a failed write here is therefore reported, not
    // fatal to the caller's process.
    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(request.key);
    }

    let output = child
        .wait_with_output()
        .map_err(|e| MountError::CryptoHelperFailed(anyhow::anyhow!(e)))?;

    output
        .check()
        .map_err(MountError::CryptoHelperFailed)?;

    Ok(CryptoInfo {
        device: mapper_path(&name),
        name,
    })
}

/// Close a crypto mapping opened by [`crypto_open`].
pub fn crypto_close(info: &CryptoInfo) -> Result<()> {
    Command::new("cryptsetup")
        .arg("remove")
        .arg(&info.name)
        .run_and_check()
        .map_err(MountError::CryptoHelperFailed)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_mangle_name() {
        assert_eq!(
            mangle_name(Path::new("/srv/vol 1/image.bin")),
            "_srv_vol_1_image_bin"
        );
    }

    #[test]
    fn test_mapper_path_shape() {
        let info = CryptoInfo {
            name: "_srv_vol_1_image_bin".into(),
            device: mapper_path("_srv_vol_1_image_bin"),
        };
        assert_eq!(info.device, PathBuf::from("/dev/mapper/_srv_vol_1_image_bin"));
        assert!(info.name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
    }
}
