//! End-to-end `do_mount`/`do_unmount` state machine (spec.md C10).
//!
//! `UNMOUNTED -> (preflight) -> LAYERED -> MOUNTED -> (teardown) -> UNMOUNTED`.
//! `LAYERED` (loop+crypto attached, filesystem not mounted) only exists
//! transiently during the preflight filesystem check on encrypted
//! containers.

use std::path::{Path, PathBuf};

use chrono::Datelike;
use log::{debug, warn};
use nix::unistd::{chown, seteuid, setegid, Gid, Uid, User};

use crate::ehd::{self, EhdMountInfo, EhdMountRequest};
use crate::error::{MountError, Result};
use crate::helpers::{HelperKind, HelperTable};
use crate::keyfile;
use crate::lsof;
use crate::mountlist;
use crate::registry::{self, CmtabRecord, Field, SmtabPath, SmtabRecord};
use crate::spawn::{self, UidPolicy};
use crate::template::VarMap;
use crate::volume::{VolumeKind, VolumeRecord, MAX_PARAM_LEN};

/// Policy knobs that are the caller's to set, not derived from the volume
/// record itself (spec.md section 4.10 steps 3 and do_unmount step 4, plus
/// the debug diagnostics toggle of step 1).
#[derive(Debug, Clone, Copy)]
pub struct MountPolicy {
    pub create_mountpoint: bool,
    pub cleanup_mountpoint: bool,
    pub debug: bool,
}

impl Default for MountPolicy {
    fn default() -> Self {
        MountPolicy {
            create_mountpoint: true,
            cleanup_mountpoint: true,
            debug: false,
        }
    }
}

/// Result of a successful [`do_mount`]. `created_mountpoint` tells the
/// caller whether to persist [`crate::volume::VolumeFlag::CreatedMountpoint`]
/// on its copy of the volume record, since the record itself is read-only
/// to this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountOutcome {
    AlreadyMounted,
    Mounted { created_mountpoint: bool },
}

fn serialize_options(options: &std::collections::BTreeMap<String, String>) -> String {
    options
        .iter()
        .map(|(k, v)| if v.is_empty() { k.clone() } else { format!("{k}={v}") })
        .collect::<Vec<_>>()
        .join(",")
}

/// The mount-table source string a kernel mount entry for this volume
/// would show, used by the already-mounted check (spec.md section 4.10
/// step 2).
fn canonical_source(volume: &VolumeRecord) -> PathBuf {
    match volume.kind {
        VolumeKind::Nfs => PathBuf::from(format!("{}:{}", volume.server, volume.volume)),
        VolumeKind::Cifs | VolumeKind::Smb => {
            PathBuf::from(format!("//{}/{}", volume.server, volume.volume))
        }
        VolumeKind::Ncp => PathBuf::from(format!("{}/{}", volume.server, volume.volume)),
        VolumeKind::Local | VolumeKind::Fuse | VolumeKind::DmCrypt | VolumeKind::TrueCrypt => {
            PathBuf::from(&volume.volume)
        }
    }
}

fn build_var_map(volume: &VolumeRecord, user: Option<&User>) -> VarMap {
    let mut map = VarMap::new();
    map.insert("MNTPT".into(), volume.mountpoint.to_string_lossy().into_owned());
    map.insert("VOLUME".into(), volume.volume.clone());
    map.insert("SERVER".into(), volume.server.clone());
    map.insert("USER".into(), volume.mount_user.clone());
    if let Some(user) = user {
        map.insert("USERUID".into(), user.uid.to_string());
        map.insert("USERGID".into(), user.gid.to_string());
    }
    map.insert("OPTIONS".into(), serialize_options(&volume.options));
    map.insert(
        "FSTYPE".into(),
        volume
            .options
            .get("fstype")
            .cloned()
            .unwrap_or_else(|| volume.kind.name().to_string()),
    );
    if let Some(key) = &volume.key {
        map.insert("CIPHER".into(), key.cipher.clone());
        if let Some(bits) = keyfile::cipher_key_bits(&key.cipher) {
            map.insert("KEYBITS".into(), bits.to_string());
        }
    }
    map.insert("FSCKTARGET".into(), volume.volume.clone());

    let now = chrono::Local::now();
    map.insert("DAY".into(), format!("{:02}", now.day()));
    map.insert("MONTH".into(), format!("{:02}", now.month()));
    map.insert("YEAR".into(), now.year().to_string());

    for (key, value) in std::env::vars() {
        map.entry(key).or_insert(value);
    }
    map
}

/// Switch effective identity to `(uid, gid)` for the duration of `f`,
/// always reverting to root afterward regardless of `f`'s outcome (spec.md
/// section 5, "Effective UID ... must be restored to 0 before returning").
fn as_effective_user<T>(uid: Uid, gid: Gid, f: impl FnOnce() -> T) -> T {
    let _ = setegid(gid);
    let _ = seteuid(uid);
    let result = f();
    let _ = seteuid(Uid::from_raw(0));
    let _ = setegid(Gid::from_raw(0));
    result
}

/// Create `path` with mode 0711 under the target user's identity; on
/// failure, fall back to creating it as root and `chown`ing it (spec.md
/// section 4.10 step 3).
fn create_mountpoint(path: &Path, uid: Uid, gid: Gid) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let attempt = |path: &Path| -> std::io::Result<()> {
        std::fs::create_dir(path)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o711))
    };

    let as_user_result = as_effective_user(uid, gid, || attempt(path));
    if as_user_result.is_ok() {
        return Ok(());
    }

    attempt(path).map_err(|e| MountError::MountpointCreateFailed(anyhow::anyhow!(e)))?;
    chown(path, Some(uid), Some(gid))
        .map_err(|e| MountError::MountpointCreateFailed(anyhow::anyhow!(e)))?;
    Ok(())
}

fn resolve_fs_key(volume: &VolumeRecord, password: &[u8]) -> Result<Vec<u8>> {
    match &volume.key {
        Some(key) => keyfile::decrypt_keyfile(&key.key_path, &key.digest, &key.cipher, password),
        None => {
            let mut truncated = password.to_vec();
            truncated.truncate(MAX_PARAM_LEN);
            Ok(truncated)
        }
    }
}

fn already_mounted(volume: &VolumeRecord, cmtab_path: &Path) -> Result<bool> {
    if volume.kind.is_encrypted_container() {
        let record = registry::lookup(cmtab_path, Field::Mountpoint, &volume.mountpoint)?;
        return Ok(record.map_or(false, |r| r.container == PathBuf::from(&volume.volume)));
    }
    mountlist::is_mounted(&volume.mountpoint, &canonical_source(volume), volume.kind)
}

fn ehd_request_for(volume: &VolumeRecord, fs_key: &[u8], is_luks: bool) -> EhdMountRequest {
    EhdMountRequest {
        container: PathBuf::from(&volume.volume),
        is_luks,
        cipher: volume.key.as_ref().map(|k| k.cipher.clone()),
        hash: volume.key.as_ref().map(|k| k.digest.clone()),
        key: fs_key.to_vec(),
        readonly: volume.flags.contains(crate::volume::VolumeFlag::Readonly),
    }
}

/// Run the preflight filesystem check for an encrypted, loop-backed
/// container: `UNMOUNTED -> LAYERED -> UNMOUNTED`. A non-zero fsck exit is
/// only ever a warning (spec.md section 4.10 step 5).
fn preflight_fsck(volume: &VolumeRecord, fs_key: &[u8], helpers: &HelperTable, var_map: &VarMap) {
    if !volume.kind.is_encrypted_container() || ehd::is_block_device(Path::new(&volume.volume)) {
        return;
    }

    let is_luks = crate::crypto::is_luks(Path::new(&volume.volume), false).unwrap_or(false);
    let request = ehd_request_for(volume, fs_key, is_luks);

    let info = match ehd::ehd_load(&request) {
        Ok(info) => info,
        Err(e) => {
            warn!("preflight: could not attach container for fsck: {e}");
            return;
        }
    };

    let mut fsck_map = var_map.clone();
    fsck_map.insert("FSCKTARGET".into(), info.crypto.device.to_string_lossy().into_owned());

    let outcome = run_helper_sequence_with_env(
        HelperKind::Fsck,
        &fsck_map,
        helpers,
        &UidPolicy::KeepCurrent,
        false,
        &[],
        &[],
    );
    match outcome {
        Ok(code) if code == 0 || code == 1 => debug!("preflight fsck exited {code}, treated as clean"),
        Ok(code) => warn!("preflight fsck exited {code}, continuing anyway"),
        Err(e) => warn!("preflight fsck failed to run: {e}"),
    }

    if let Err(e) = ehd::ehd_unload(&info) {
        warn!("preflight: failed to detach container after fsck: {e}");
    }
}

/// Expand and run every argv template for `kind` in sequence, returning the
/// exit code of the last one run.
fn run_helper_sequence_with_env(
    kind: HelperKind,
    var_map: &VarMap,
    helpers: &HelperTable,
    policy: &UidPolicy,
    feed_key: bool,
    fs_key: &[u8],
    extra_env: &[(String, String)],
) -> Result<i32> {
    let argvs = helpers.expand(kind, var_map)?;
    let mut last_code = 0;
    for argv in argvs {
        let child = spawn::spawn(&argv, policy, feed_key, extra_env)?;
        if feed_key {
            if let Some(stdin) = child.stdin {
                spawn::write_and_close(stdin, fs_key)?;
            }
        }
        last_code = spawn::wait(child.pid)?;
    }
    Ok(last_code)
}

fn resolve_uid_policy(volume: &VolumeRecord) -> (UidPolicy, Option<User>) {
    match User::from_name(&volume.mount_user) {
        Ok(Some(user)) => (UidPolicy::DropTo(volume.mount_user.clone()), Some(user)),
        _ => (UidPolicy::KeepCurrent, None),
    }
}

/// Run the full login-time mount algorithm for a single volume (spec.md
/// section 4.10).
pub fn do_mount(
    volume: &VolumeRecord,
    password: &[u8],
    policy: &MountPolicy,
    helpers: &HelperTable,
    cmtab_path: &Path,
    smtab: &SmtabPath,
) -> Result<MountOutcome> {
    volume.validate()?;

    if already_mounted(volume, cmtab_path)? {
        return Ok(MountOutcome::AlreadyMounted);
    }

    let (uid_policy, resolved_user) = resolve_uid_policy(volume);
    let mut var_map = build_var_map(volume, resolved_user.as_ref());

    let mut created_mountpoint = false;
    if policy.create_mountpoint && !volume.mountpoint.exists() {
        let (uid, gid) = resolved_user
            .as_ref()
            .map(|u| (u.uid, u.gid))
            .unwrap_or((Uid::from_raw(0), Gid::from_raw(0)));
        create_mountpoint(&volume.mountpoint, uid, gid)?;
        created_mountpoint = true;
    }

    let mut fs_key = resolve_fs_key(volume, password)?;

    if volume.kind.is_encrypted_container() {
        preflight_fsck(volume, &fs_key, helpers, &var_map);
    }

    let mut ehd_info: Option<EhdMountInfo> = None;
    if volume.kind.is_encrypted_container() {
        let container_path = Path::new(&volume.volume);
        let is_blkdev = ehd::is_block_device(container_path);
        let is_luks = crate::crypto::is_luks(container_path, is_blkdev).unwrap_or(false);
        let request = ehd_request_for(volume, &fs_key, is_luks);
        let info = ehd::ehd_load(&request)?;
        var_map.insert("VOLUME".into(), info.crypto.device.to_string_lossy().into_owned());
        ehd_info = Some(info);
    }

    let mut extra_env = Vec::new();
    if matches!(volume.kind, VolumeKind::Smb | VolumeKind::Cifs) {
        extra_env.push(("PASSWD_FD".to_string(), "0".to_string()));
    }

    let feed_key = volume.kind != VolumeKind::Nfs;
    let mount_result = run_helper_sequence_with_env(
        HelperKind::Mount(volume.kind),
        &var_map,
        helpers,
        &uid_policy,
        feed_key,
        &fs_key,
        &extra_env,
    );

    zero(&mut fs_key);

    let exit_code = match mount_result {
        Ok(code) => code,
        Err(e) => {
            if let Some(info) = &ehd_info {
                let _ = ehd::ehd_unload(info);
            }
            return Err(e);
        }
    };

    if exit_code != 0 {
        if let Some(info) = &ehd_info {
            let _ = ehd::ehd_unload(info);
        }
        return Err(MountError::MountHelperFailed(anyhow::anyhow!(
            "mount helper exited with status {exit_code}"
        )));
    }

    if let Some(info) = &ehd_info {
        let record = CmtabRecord {
            mountpoint: volume.mountpoint.clone(),
            container: PathBuf::from(&volume.volume),
            loop_device: info.loop_device.clone(),
            crypto_device: Some(info.crypto.device.clone()),
        };
        if let Err(e) = registry::append(cmtab_path, &record) {
            warn!("mount succeeded but cmtab append failed, registry now out of sync: {e}");
        }
    }

    let smtab_device = ehd_info
        .as_ref()
        .map(|info| info.crypto.device.to_string_lossy().into_owned())
        .unwrap_or_else(|| var_map.get("VOLUME").cloned().unwrap_or_default());
    let smtab_record = SmtabRecord {
        device: smtab_device,
        mountpoint: volume.mountpoint.clone(),
        fstype: var_map.get("FSTYPE").cloned().unwrap_or_default(),
        options: serialize_options(&volume.options),
    };
    match registry::smtab_add(smtab, &smtab_record) {
        Ok(()) | Err(MountError::NotSupported) => {}
        Err(e) => warn!("mount succeeded but smtab update failed: {e}"),
    }

    Ok(MountOutcome::Mounted { created_mountpoint })
}

fn zero(buf: &mut [u8]) {
    for byte in buf.iter_mut() {
        *byte = 0;
    }
}

/// Run the teardown algorithm for a single volume (spec.md section 4.10).
pub fn do_unmount(
    volume: &VolumeRecord,
    created_mountpoint: bool,
    policy: &MountPolicy,
    helpers: &HelperTable,
    cmtab_path: &Path,
    smtab: &SmtabPath,
) -> Result<()> {
    let (uid_policy, resolved_user) = resolve_uid_policy(volume);
    let var_map = build_var_map(volume, resolved_user.as_ref());

    if policy.debug {
        match lsof::run(&volume.mountpoint) {
            Ok(open_files) => {
                for file in open_files {
                    debug!(
                        "{} (pid {}) still has a file open under {}",
                        file.command,
                        file.pid,
                        volume.mountpoint.display()
                    );
                }
            }
            Err(e) => warn!("lsof diagnostics failed: {e}"),
        }
    }

    let unmount_kind = helpers.unmount_kind_for(volume.kind);
    let argvs = helpers.expand(unmount_kind, &var_map)?;
    for argv in argvs {
        let child = spawn::spawn(&argv, &uid_policy, false, &[])?;
        let code = spawn::wait(child.pid)?;
        if code != 0 {
            return Err(MountError::UnmountHelperFailed(anyhow::anyhow!(
                "unmount helper exited with status {code}"
            )));
        }
    }

    if created_mountpoint && policy.cleanup_mountpoint {
        if let Err(e) = std::fs::remove_dir(&volume.mountpoint) {
            warn!("failed to remove mountpoint {}: {e}", volume.mountpoint.display());
        }
    }

    if let Err(e) = registry::smtab_remove(smtab, &volume.mountpoint) {
        warn!("failed to remove smtab record for {}: {e}", volume.mountpoint.display());
    }

    if volume.kind.is_encrypted_container() {
        if let Some(record) = registry::lookup(cmtab_path, Field::Mountpoint, &volume.mountpoint)? {
            let lower_device = record
                .loop_device
                .clone()
                .unwrap_or_else(|| record.container.clone());
            let crypto_device = record
                .crypto_device
                .clone()
                .unwrap_or_else(|| record.container.clone());
            let info = EhdMountInfo {
                container: record.container.clone(),
                lower_device: lower_device.clone(),
                loop_device: record.loop_device.clone(),
                crypto: crate::crypto::CryptoInfo {
                    name: crate::crypto::mangle_name(&record.container),
                    device: crypto_device,
                },
            };
            if let Err(e) = ehd::ehd_unload(&info) {
                warn!("failed to tear down encrypted container layers: {e}");
            }
            if let Err(e) = registry::remove(cmtab_path, Field::Mountpoint, &volume.mountpoint) {
                warn!("failed to remove cmtab record for {}: {e}", volume.mountpoint.display());
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::BTreeMap;
    use crate::volume::VolumeFlags;

    fn local_volume() -> VolumeRecord {
        VolumeRecord {
            kind: VolumeKind::Local,
            mountpoint: PathBuf::from("/mnt/x"),
            server: String::new(),
            volume: "/dev/sdb1".into(),
            mount_user: "nobody".into(),
            options: BTreeMap::new(),
            key: None,
            flags: VolumeFlags::empty(),
        }
    }

    #[test]
    fn test_canonical_source_local() {
        let v = local_volume();
        assert_eq!(canonical_source(&v), PathBuf::from("/dev/sdb1"));
    }

    #[test]
    fn test_canonical_source_cifs() {
        let mut v = local_volume();
        v.kind = VolumeKind::Cifs;
        v.server = "fileserv".into();
        v.volume = "share".into();
        assert_eq!(canonical_source(&v), PathBuf::from("//fileserv/share"));
    }

    #[test]
    fn test_canonical_source_nfs() {
        let mut v = local_volume();
        v.kind = VolumeKind::Nfs;
        v.server = "fileserv".into();
        v.volume = "/export/home".into();
        assert_eq!(canonical_source(&v), PathBuf::from("fileserv:/export/home"));
    }

    #[test]
    fn test_serialize_options() {
        let mut options = BTreeMap::new();
        options.insert("rw".to_string(), String::new());
        options.insert("uid".to_string(), "1000".to_string());
        assert_eq!(serialize_options(&options), "rw,uid=1000");
    }

    #[test]
    fn test_build_var_map_has_core_keys() {
        let v = local_volume();
        let map = build_var_map(&v, None);
        assert_eq!(map.get("MNTPT").unwrap(), "/mnt/x");
        assert_eq!(map.get("VOLUME").unwrap(), "/dev/sdb1");
        assert!(map.contains_key("DAY"));
        assert!(map.contains_key("YEAR"));
    }

    #[test]
    fn test_resolve_fs_key_truncates_password_without_keyfile() {
        let v = local_volume();
        let long_password = vec![b'x'; MAX_PARAM_LEN + 10];
        let key = resolve_fs_key(&v, &long_password).unwrap();
        assert_eq!(key.len(), MAX_PARAM_LEN);
    }

    #[test]
    fn test_zero_clears_buffer() {
        let mut buf = vec![1u8, 2, 3, 4];
        zero(&mut buf);
        assert_eq!(buf, vec![0, 0, 0, 0]);
    }
}
