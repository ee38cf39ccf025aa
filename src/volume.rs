//! Volume record data model (spec.md section 3).

use std::collections::BTreeMap;
use std::path::PathBuf;

use enumflags2::{bitflags, BitFlags};
use serde::{Deserialize, Serialize};
use strum_macros::IntoStaticStr;

use crate::error::{MountError, Result};

/// The fixed enumeration of volume kinds this core understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum VolumeKind {
    Local,
    Cifs,
    Smb,
    Ncp,
    Nfs,
    Fuse,
    DmCrypt,
    TrueCrypt,
}

impl VolumeKind {
    pub fn name(self) -> &'static str {
        self.into()
    }

    /// Whether a non-empty `server` is required for this kind.
    pub fn requires_server(self) -> bool {
        !matches!(self, VolumeKind::Local | VolumeKind::DmCrypt | VolumeKind::TrueCrypt)
    }

    /// Whether comparisons against the kernel mount list are case-insensitive
    /// for this kind (spec.md section 4.10, step 2).
    pub fn case_insensitive_match(self) -> bool {
        matches!(self, VolumeKind::Smb | VolumeKind::Cifs | VolumeKind::Ncp)
    }

    /// Whether this kind is an encrypted container managed through EHD.
    pub fn is_encrypted_container(self) -> bool {
        matches!(self, VolumeKind::DmCrypt | VolumeKind::TrueCrypt)
    }
}

/// Per-volume boolean flags (spec.md section 3).
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeFlag {
    OriginIsGlobalConfig,
    CreatedMountpoint,
    Readonly,
    UsesSsh,
}

pub type VolumeFlags = BitFlags<VolumeFlag>;

/// Optional filesystem-key material associated with a volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyMaterial {
    pub key_path: PathBuf,
    pub cipher: String,
    pub digest: String,
}

/// A single volume to be mounted at login (spec.md section 3). Serializable
/// so a host application's own configuration decoder can hand this crate a
/// ready-made record without this crate knowing the on-disk config format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub kind: VolumeKind,
    pub mountpoint: PathBuf,
    pub server: String,
    pub volume: String,
    pub mount_user: String,
    pub options: BTreeMap<String, String>,
    pub key: Option<KeyMaterial>,
    pub flags: VolumeFlags,
}

/// Longest permitted length for any single string field, mirroring the
/// source's fixed-size-buffer limits (`MAX_PAR`).
pub const MAX_PARAM_LEN: usize = 4096;

impl VolumeRecord {
    /// Structural validation (spec.md section 3 invariants).
    pub fn validate(&self) -> Result<()> {
        for (label, value) in [
            ("mountpoint", self.mountpoint.to_string_lossy().to_string()),
            ("server", self.server.clone()),
            ("volume", self.volume.clone()),
            ("mount_user", self.mount_user.clone()),
        ] {
            if value.len() > MAX_PARAM_LEN {
                return Err(MountError::ConfigInvalid(format!(
                    "field '{label}' exceeds maximum length"
                )));
            }
        }

        if self.kind.requires_server() && self.server.is_empty() {
            return Err(MountError::ConfigInvalid(format!(
                "kind '{}' requires a non-empty server",
                self.kind.name()
            )));
        }

        if let Some(key) = &self.key {
            if key.cipher.is_empty() {
                return Err(MountError::ConfigInvalid(
                    "key material present without a cipher name".into(),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn base_record(kind: VolumeKind) -> VolumeRecord {
        VolumeRecord {
            kind,
            mountpoint: PathBuf::from("/mnt/x"),
            server: "srv".into(),
            volume: "share".into(),
            mount_user: "alice".into(),
            options: BTreeMap::new(),
            key: None,
            flags: VolumeFlags::empty(),
        }
    }

    #[test]
    fn test_validate_local_no_server_needed() {
        let mut record = base_record(VolumeKind::Local);
        record.server.clear();
        record.validate().unwrap();
    }

    #[test]
    fn test_validate_remote_needs_server() {
        let mut record = base_record(VolumeKind::Cifs);
        record.server.clear();
        assert!(record.validate().is_err());
    }

    #[test]
    fn test_case_insensitive_kinds() {
        assert!(VolumeKind::Cifs.case_insensitive_match());
        assert!(VolumeKind::Smb.case_insensitive_match());
        assert!(VolumeKind::Ncp.case_insensitive_match());
        assert!(!VolumeKind::Nfs.case_insensitive_match());
        assert!(!VolumeKind::Local.case_insensitive_match());
    }

    #[test]
    fn test_encrypted_container_kinds() {
        assert!(VolumeKind::DmCrypt.is_encrypted_container());
        assert!(VolumeKind::TrueCrypt.is_encrypted_container());
        assert!(!VolumeKind::Nfs.is_encrypted_container());
    }

    #[test]
    fn test_volume_record_serde_round_trip() {
        let mut record = base_record(VolumeKind::Cifs);
        record.flags = VolumeFlag::Readonly | VolumeFlag::UsesSsh;
        record.options.insert("rw".into(), String::new());

        let json = serde_json::to_string(&record).unwrap();
        let decoded: VolumeRecord = serde_json::from_str(&json).unwrap();

        assert_eq!(decoded.kind, VolumeKind::Cifs);
        assert_eq!(decoded.server, "srv");
        assert!(decoded.flags.contains(VolumeFlag::Readonly));
        assert!(decoded.flags.contains(VolumeFlag::UsesSsh));
        assert!(!decoded.flags.contains(VolumeFlag::OriginIsGlobalConfig));
    }
}
