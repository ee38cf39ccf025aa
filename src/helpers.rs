//! Fixed command-kind table: maps each mount/unmount kind (plus the small
//! set of auxiliary helpers) to a sequence of argv templates expanded
//! through the command templater (spec.md section 6).

use crate::template::VarMap;
use crate::volume::VolumeKind;
use crate::{error::Result, template};

/// One unexpanded argument vector; each element may contain `%(...)`
/// placeholders.
pub type ArgvTemplate = Vec<String>;

/// A fixed command kind this core knows how to invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperKind {
    Mount(VolumeKind),
    Unmount(VolumeKind),
    Fsck,
    Fd0ssh,
    Lsof,
}

/// `kind -> sequence of argv templates`. Built-in defaults cover every
/// fixed kind named in spec.md section 6; callers that load configuration
/// overlays call [`HelperTable::set`] to override any of them.
pub struct HelperTable {
    entries: Vec<(HelperKind, Vec<ArgvTemplate>)>,
}

fn tmpl(words: &[&str]) -> ArgvTemplate {
    words.iter().map(|w| w.to_string()).collect()
}

impl HelperTable {
    /// The argv templates this core ships with, good enough to run without
    /// any configuration overlay.
    pub fn with_builtin_defaults() -> Self {
        use VolumeKind::*;

        let mut entries = Vec::new();

        entries.push((
            HelperKind::Mount(Local),
            vec![tmpl(&["mount", "-o", "%(OPTIONS)", "%(VOLUME)", "%(MNTPT)"])],
        ));
        entries.push((HelperKind::Unmount(Local), vec![tmpl(&["umount", "%(MNTPT)"])]));

        entries.push((
            HelperKind::Mount(Cifs),
            vec![tmpl(&[
                "mount.cifs",
                "//%(SERVER)/%(VOLUME)",
                "%(MNTPT)",
                "-o",
                "%(OPTIONS)",
            ])],
        ));
        entries.push((HelperKind::Unmount(Cifs), vec![tmpl(&["umount", "%(MNTPT)"])]));

        entries.push((
            HelperKind::Mount(Smb),
            vec![tmpl(&[
                "smbmount",
                "//%(SERVER)/%(VOLUME)",
                "%(MNTPT)",
                "-o",
                "%(OPTIONS)",
            ])],
        ));
        entries.push((HelperKind::Unmount(Smb), vec![tmpl(&["smbumount", "%(MNTPT)"])]));

        entries.push((
            HelperKind::Mount(Ncp),
            vec![tmpl(&["ncpmount", "-S", "%(SERVER)", "-V", "%(VOLUME)", "%(MNTPT)"])],
        ));
        entries.push((HelperKind::Unmount(Ncp), vec![tmpl(&["ncpumount", "%(MNTPT)"])]));

        entries.push((
            HelperKind::Mount(Nfs),
            vec![tmpl(&[
                "mount.nfs",
                "%(SERVER):%(VOLUME)",
                "%(MNTPT)",
                "-o",
                "%(OPTIONS)",
            ])],
        ));
        entries.push((HelperKind::Unmount(Nfs), vec![tmpl(&["umount", "%(MNTPT)"])]));

        entries.push((
            HelperKind::Mount(Fuse),
            vec![tmpl(&["%(VOLUME)", "%(MNTPT)", "-o", "%(OPTIONS)"])],
        ));
        entries.push((HelperKind::Unmount(Fuse), vec![tmpl(&["fusermount", "-u", "%(MNTPT)"])]));

        entries.push((
            HelperKind::Mount(DmCrypt),
            vec![tmpl(&["mount", "-t", "%(FSTYPE)", "-o", "%(OPTIONS)", "%(VOLUME)", "%(MNTPT)"])],
        ));
        entries.push((HelperKind::Unmount(DmCrypt), vec![tmpl(&["umount", "%(MNTPT)"])]));

        entries.push((
            HelperKind::Mount(TrueCrypt),
            vec![tmpl(&["mount", "-t", "%(FSTYPE)", "-o", "%(OPTIONS)", "%(VOLUME)", "%(MNTPT)"])],
        ));
        entries.push((HelperKind::Unmount(TrueCrypt), vec![tmpl(&["umount", "%(MNTPT)"])]));

        entries.push((HelperKind::Fsck, vec![tmpl(&["fsck", "-y", "%(FSCKTARGET)"])]));
        entries.push((HelperKind::Fd0ssh, vec![tmpl(&["fd0ssh", "ssh", "%(SERVER)"])]));
        entries.push((HelperKind::Lsof, vec![tmpl(&["lsof", "%(MNTPT)"])]));

        HelperTable { entries }
    }

    /// Replace (or insert) the argv template sequence for `kind`.
    pub fn set(&mut self, kind: HelperKind, templates: Vec<ArgvTemplate>) {
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| *k == kind) {
            slot.1 = templates;
        } else {
            self.entries.push((kind, templates));
        }
    }

    pub fn get(&self, kind: HelperKind) -> Option<&[ArgvTemplate]> {
        self.entries
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, v)| v.as_slice())
    }

    /// The unmount kind paired with `kind`; generic `umount` is the
    /// fallback for kinds with no registered pairing (spec.md section
    /// 4.10, do_unmount step 2).
    pub fn unmount_kind_for(&self, kind: VolumeKind) -> HelperKind {
        HelperKind::Unmount(kind)
    }

    /// Expand every template for `kind` against `map`, in sequence, each
    /// producing one argv for [`crate::spawn::spawn`]. Falls back to a
    /// bare `umount %(MNTPT)` when `kind` has no registered templates.
    pub fn expand(&self, kind: HelperKind, map: &VarMap) -> Result<Vec<Vec<String>>> {
        let fallback = [tmpl(&["umount", "%(MNTPT)"])];
        let templates = self.get(kind).unwrap_or(&fallback);
        templates.iter().map(|t| template::arglist_build(t, map)).collect()
    }
}

impl Default for HelperTable {
    fn default() -> Self {
        Self::with_builtin_defaults()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::BTreeMap;

    fn map(pairs: &[(&str, &str)]) -> VarMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect::<BTreeMap<_, _>>()
    }

    #[test]
    fn test_builtin_defaults_cover_every_kind() {
        let table = HelperTable::with_builtin_defaults();
        for kind in [
            VolumeKind::Local,
            VolumeKind::Cifs,
            VolumeKind::Smb,
            VolumeKind::Ncp,
            VolumeKind::Nfs,
            VolumeKind::Fuse,
            VolumeKind::DmCrypt,
            VolumeKind::TrueCrypt,
        ] {
            assert!(table.get(HelperKind::Mount(kind)).is_some());
            assert!(table.get(HelperKind::Unmount(kind)).is_some());
        }
        assert!(table.get(HelperKind::Fsck).is_some());
        assert!(table.get(HelperKind::Lsof).is_some());
    }

    #[test]
    fn test_expand_cifs_mount() {
        let table = HelperTable::with_builtin_defaults();
        let m = map(&[("SERVER", "fileserv"), ("VOLUME", "share"), ("MNTPT", "/mnt/x"), ("OPTIONS", "rw")]);
        let argvs = table.expand(HelperKind::Mount(VolumeKind::Cifs), &m).unwrap();
        assert_eq!(argvs.len(), 1);
        assert_eq!(argvs[0][0], "mount.cifs");
        assert_eq!(argvs[0][1], "//fileserv/share");
    }

    #[test]
    fn test_set_overrides_builtin() {
        let mut table = HelperTable::with_builtin_defaults();
        table.set(HelperKind::Mount(VolumeKind::Local), vec![tmpl(&["custom-mount", "%(MNTPT)"])]);
        let m = map(&[("MNTPT", "/mnt/y")]);
        let argvs = table.expand(HelperKind::Mount(VolumeKind::Local), &m).unwrap();
        assert_eq!(argvs[0][0], "custom-mount");
    }

    #[test]
    fn test_unknown_kind_falls_through_to_generic_umount() {
        let table = HelperTable { entries: Vec::new() };
        let m = map(&[("MNTPT", "/mnt/z")]);
        let argvs = table.expand(HelperKind::Unmount(VolumeKind::Nfs), &m).unwrap();
        assert_eq!(argvs, vec![vec!["umount".to_string(), "/mnt/z".to_string()]]);
    }
}
