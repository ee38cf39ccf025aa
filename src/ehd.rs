//! Encrypted-volume ("EHD") engine: composes the loop manager (C4) and the
//! crypto layer (C5) into a single load/unload primitive (spec.md C6).

use std::fs;
use std::path::{Path, PathBuf};

use crate::crypto::{self, CryptoInfo, CryptoOpenRequest};
use crate::error::Result;
use crate::loopdev;

/// An EHD mount request (spec.md section 3).
#[derive(Debug, Clone)]
pub struct EhdMountRequest {
    pub container: PathBuf,
    pub is_luks: bool,
    pub cipher: Option<String>,
    pub hash: Option<String>,
    pub key: Vec<u8>,
    pub readonly: bool,
}

/// EHD mount info: everything needed to unwind a successful [`ehd_load`]
/// (spec.md section 3). `lower_device` is always set; it equals `container`
/// when the container is already a block device, or a freshly allocated
/// loop device path otherwise.
#[derive(Debug, Clone)]
pub struct EhdMountInfo {
    pub container: PathBuf,
    pub lower_device: PathBuf,
    pub loop_device: Option<PathBuf>,
    pub crypto: CryptoInfo,
}

pub(crate) fn is_block_device(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| {
            use std::os::unix::fs::FileTypeExt;
            m.file_type().is_block_device()
        })
        .unwrap_or(false)
}

/// Map a container through a loop device (if needed) and open the crypto
/// mapping over it. On crypto failure after a loop device was allocated,
/// the loop device is released before returning the error.
pub fn ehd_load(request: &EhdMountRequest) -> Result<EhdMountInfo> {
    let container_is_block = is_block_device(&request.container);

    let loop_device = if container_is_block {
        None
    } else {
        Some(loopdev::loop_setup(&request.container, request.readonly)?)
    };

    let lower_device = loop_device
        .clone()
        .unwrap_or_else(|| request.container.clone());

    let open_request = CryptoOpenRequest {
        container: &request.container,
        lower_device: &lower_device,
        is_luks: request.is_luks,
        cipher: request.cipher.as_deref(),
        hash: request.hash.as_deref(),
        key: &request.key,
        readonly: request.readonly,
    };

    let crypto = match crypto::crypto_open(&open_request) {
        Ok(info) => info,
        Err(e) => {
            if let Some(dev) = &loop_device {
                let _ = loopdev::loop_release(dev);
            }
            return Err(e);
        }
    };

    Ok(EhdMountInfo {
        container: request.container.clone(),
        lower_device,
        loop_device,
        crypto,
    })
}

/// Tear down a mapping created by [`ehd_load`]. The crypto mapping is closed
/// first; if the lower device is not a bare block device, the loop device is
/// released afterward.
pub fn ehd_unload(info: &EhdMountInfo) -> Result<()> {
    crypto::crypto_close(&info.crypto)?;

    if let Some(dev) = &info.loop_device {
        loopdev::loop_release(dev)?;
    }

    Ok(())
}
