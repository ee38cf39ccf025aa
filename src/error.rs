//! Error kinds surfaced by the core (spec.md section 7).

use thiserror::Error;

/// Every distinct failure mode the core can report to its caller.
///
/// `AlreadyMounted` is never constructed as an `Err` by this crate; `do_mount`
/// reports it through the success path of [`crate::controller::MountOutcome`].
/// It is kept in this enum because callers must be able to name it when
/// matching on logged diagnostics.
#[derive(Debug, Error)]
pub enum MountError {
    #[error("volume record failed validation: {0}")]
    ConfigInvalid(String),

    #[error("volume is already mounted")]
    AlreadyMounted,

    #[error("failed to create mountpoint: {0}")]
    MountpointCreateFailed(#[source] anyhow::Error),

    #[error("unknown digest '{0}'")]
    KeyDigestUnknown(String),

    #[error("unknown cipher '{0}'")]
    KeyCipherUnknown(String),

    #[error("keyfile I/O error: {0}")]
    KeyIo(#[source] anyhow::Error),

    #[error("keyfile decryption failed: {0}")]
    KeyDecrypt(#[source] anyhow::Error),

    #[error("no free loop device")]
    LoopExhausted,

    #[error("loop device operation failed: {0}")]
    LoopOs(#[source] anyhow::Error),

    #[error("crypto helper failed: {0}")]
    CryptoHelperFailed(#[source] anyhow::Error),

    #[error("mount helper failed: {0}")]
    MountHelperFailed(#[source] anyhow::Error),

    #[error("unmount helper failed: {0}")]
    UnmountHelperFailed(#[source] anyhow::Error),

    #[error("association registry I/O error: {0}")]
    RegistryIo(#[source] anyhow::Error),

    #[error("failed to lock association registry: {0}")]
    RegistryLock(#[source] anyhow::Error),

    #[error("command template expansion failed: {0}")]
    TemplateExpand(String),

    #[error("failed to spawn helper process: {0}")]
    SpawnFailed(#[source] anyhow::Error),

    #[error("operation not supported on this platform")]
    NotSupported,
}

pub type Result<T> = std::result::Result<T, MountError>;
