//! Login-time volume-mount orchestrator.
//!
//! Mounts a set of per-user volumes (local filesystems, encrypted
//! containers, remote shares) using the credentials captured during
//! authentication, and tears them down on session end. This crate is the
//! core engine; wiring it up to an authentication framework, parsing
//! on-disk configuration, and prompting for passwords are all the host
//! application's job.

pub mod cipher_score;
pub mod controller;
pub mod crypto;
pub mod ehd;
pub mod error;
pub mod escape;
pub mod exe;
pub mod helpers;
pub mod keyfile;
pub mod loopdev;
pub mod lsof;
pub mod mountlist;
pub mod registry;
pub mod spawn;
pub mod template;
pub mod volume;

pub use controller::{do_mount, do_unmount};
pub use error::MountError;
pub use volume::{VolumeFlags, VolumeKind, VolumeRecord};
