//! Loop device allocation and release (spec.md C4).
//!
//! All work is delegated to the `losetup` helper binary (spec.md section 6
//! lists `losetup`/`unlosetup` among the fixed external command kinds); this
//! module never touches `/dev/loop-control` directly.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{MountError, Result};
use crate::exe::RunAndCheck;

#[cfg(target_os = "linux")]
mod linux {
    use super::*;

    pub fn loop_setup(path: &Path, readonly: bool) -> Result<PathBuf> {
        let mut cmd = Command::new("losetup");
        cmd.arg("-f").arg("--show");
        if readonly {
            cmd.arg("--read-only");
        }
        cmd.arg(path);

        let output = cmd.output_and_check().map_err(|e| {
            if format!("{e:#}").to_lowercase().contains("no free loop") {
                MountError::LoopExhausted
            } else {
                MountError::LoopOs(e)
            }
        })?;

        Ok(PathBuf::from(output.trim()))
    }

    /// Outcome of attempting to detach a loop device: success, or the device
    /// was already detached (`ENXIO`) / is not a loop device (`ENOTTY`),
    /// which callers treat identically to success.
    pub fn loop_release(device: &Path) -> Result<()> {
        let mut cmd = Command::new("losetup");
        cmd.arg("-d").arg(device);

        match cmd.run_and_check() {
            Ok(()) => Ok(()),
            Err(e) => {
                let text = format!("{e:#}").to_lowercase();
                if text.contains("no such device") || text.contains("inappropriate ioctl") {
                    Ok(())
                } else {
                    Err(MountError::LoopOs(e))
                }
            }
        }
    }

    pub fn loop_file(device: &Path) -> Result<PathBuf> {
        let mut cmd = Command::new("losetup");
        cmd.arg("-n").arg("-O").arg("BACK-FILE").arg(device);

        match cmd.output_and_check() {
            Ok(output) => {
                let trimmed = output.trim();
                if trimmed.is_empty() {
                    Ok(device.to_path_buf())
                } else {
                    Ok(PathBuf::from(trimmed))
                }
            }
            // Not a loop device (or losetup unavailable for it): per spec,
            // return the input path unchanged.
            Err(_) => Ok(device.to_path_buf()),
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux::{loop_file, loop_release, loop_setup};

#[cfg(not(target_os = "linux"))]
pub fn loop_setup(_path: &Path, _readonly: bool) -> Result<PathBuf> {
    Err(MountError::NotSupported)
}

#[cfg(not(target_os = "linux"))]
pub fn loop_release(_device: &Path) -> Result<()> {
    Err(MountError::NotSupported)
}

#[cfg(not(target_os = "linux"))]
pub fn loop_file(device: &Path) -> Result<PathBuf> {
    let _ = device;
    Err(MountError::NotSupported)
}

#[cfg(all(test, target_os = "linux"))]
mod test {
    use super::*;

    // These exercise only the output-parsing paths; they do not require
    // root privilege or a real loop device.

    #[test]
    fn test_loop_file_falls_back_to_input_for_non_loop_device() {
        let fake = Path::new("/not/a/loop/device");
        let resolved = loop_file(fake).unwrap();
        assert_eq!(resolved, fake);
    }
}
