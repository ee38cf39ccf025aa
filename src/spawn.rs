//! Fork/exec with privilege drop, pipe plumbing, and signal bookkeeping
//! (spec.md C9).

use std::ffi::CString;
use std::fs::File;
use std::os::unix::io::{IntoRawFd, RawFd};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{
    chdir, close, dup2, execvp, fork, getpid, pipe, setgid, setsid, setuid, ForkResult, Gid, Pid,
    Uid,
};

use crate::error::{MountError, Result};

/// `PATH` forced on every spawned helper, regardless of the caller's own
/// environment (spec.md section 6).
pub const SAFE_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Identity the child should assume before exec'ing.
#[derive(Debug, Clone)]
pub enum UidPolicy {
    /// Stay as whatever the caller currently is (normally root).
    KeepCurrent,
    /// Drop to the named user: resolve uid/gid, `setgid` then `setuid`, and
    /// set `HOME`/`USER` in the child's environment.
    DropTo(String),
}

/// A running child plus the write end of its stdin pipe, if one was set up.
pub struct SpawnedChild {
    pub pid: Pid,
    pub stdin: Option<File>,
}

/// Saves a signal's current disposition and restores it on drop — the
/// "signal juggling" called for by spec.md section 9: SIGCHLD and SIGPIPE
/// dispositions must be saved before spawn/pipe-write and restored after.
struct SignalGuard {
    signal: Signal,
    previous: SigAction,
}

impl SignalGuard {
    fn install(signal: Signal, handler: SigHandler) -> Result<Self> {
        let action = SigAction::new(handler, SaFlags::empty(), SigSet::empty());
        // Safety: installing a simple, well-known disposition for the
        // duration of this guard's lifetime.
        let previous = unsafe { sigaction(signal, &action) }
            .map_err(|e| MountError::SpawnFailed(anyhow::anyhow!(e)))?;
        Ok(SignalGuard { signal, previous })
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        let _ = unsafe { sigaction(self.signal, &self.previous) };
    }
}

fn resolve_user(name: &str) -> Result<(Uid, Gid, String)> {
    let cname = CString::new(name)
        .map_err(|e| MountError::SpawnFailed(anyhow::anyhow!(e)))?;
    let pw = unsafe { libc::getpwnam(cname.as_ptr()) };
    if pw.is_null() {
        return Err(MountError::SpawnFailed(anyhow::anyhow!(
            "no such user: {name}"
        )));
    }
    // Safety: `pw` was just checked non-null and points at a `passwd`
    // struct owned by libc's static buffer, valid until the next call.
    let (uid, gid, home) = unsafe {
        let entry = &*pw;
        let home = std::ffi::CStr::from_ptr(entry.pw_dir)
            .to_string_lossy()
            .into_owned();
        (entry.pw_uid, entry.pw_gid, home)
    };
    Ok((Uid::from_raw(uid), Gid::from_raw(gid), home))
}

/// Spawn `argv`, optionally feeding `stdin_data` on a pipe, under the
/// identity described by `policy`, with `extra_env` set in the child in
/// addition to `PATH`/`HOME`/`USER`. Blocks until the child has exec'd or
/// failed to.
pub fn spawn(
    argv: &[String],
    policy: &UidPolicy,
    want_stdin: bool,
    extra_env: &[(String, String)],
) -> Result<SpawnedChild> {
    if argv.is_empty() {
        return Err(MountError::SpawnFailed(anyhow::anyhow!(
            "empty argument vector"
        )));
    }

    let _sigchld_guard = SignalGuard::install(Signal::SIGCHLD, SigHandler::SigDfl)?;

    let stdin_pipe = if want_stdin {
        Some(pipe().map_err(|e| MountError::SpawnFailed(anyhow::anyhow!(e)))?)
    } else {
        None
    };

    let resolved_user = match policy {
        UidPolicy::DropTo(name) => Some(resolve_user(name)?),
        UidPolicy::KeepCurrent => None,
    };

    // Safety: this process is single-threaded at the points this crate
    // calls `spawn`; the child only calls async-signal-safe functions
    // before `execvp`.
    match unsafe { fork() }.map_err(|e| MountError::SpawnFailed(anyhow::anyhow!(e)))? {
        ForkResult::Child => {
            let stdin_read = stdin_pipe.map(|(read_fd, _)| read_fd.into_raw_fd());
            child_main(argv, &resolved_user, stdin_read, extra_env);
            // child_main never returns; if it does, something went wrong
            // before exec.
            unsafe { libc::_exit(127) };
        }
        ForkResult::Parent { child } => {
            let stdin_file = stdin_pipe.map(|(read_fd, write_fd)| {
                // `read_fd` drops here, closing the parent's copy of the
                // read end; `write_fd` moves into the `File` below, so the
                // write end stays open instead of closing along with it.
                drop(read_fd);
                File::from(write_fd)
            });
            Ok(SpawnedChild {
                pid: child,
                stdin: stdin_file,
            })
        }
    }
}

fn child_main(
    argv: &[String],
    user: &Option<(Uid, Gid, String)>,
    stdin_read: Option<RawFd>,
    extra_env: &[(String, String)],
) {
    let _ = setsid();
    let _ = chdir("/");

    if let Some(fd) = stdin_read {
        let _ = dup2(fd, 0);
        let _ = close(fd);
    }

    if let Some((uid, gid, home)) = user {
        if setgid(*gid).is_err() {
            unsafe { libc::_exit(126) };
        }
        if setuid(*uid).is_err() {
            unsafe { libc::_exit(126) };
        }
        std::env::set_var("HOME", home);
        std::env::set_var("USER", user_name_lossy(*uid));
    }

    std::env::set_var("PATH", SAFE_PATH);
    for (key, value) in extra_env {
        std::env::set_var(key, value);
    }

    let cargv: Vec<CString> = argv
        .iter()
        .map(|a| CString::new(a.as_str()).unwrap_or_default())
        .collect();

    let _ = execvp(&cargv[0], &cargv);
    // execvp only returns on failure.
}

fn user_name_lossy(uid: Uid) -> String {
    let pw = unsafe { libc::getpwuid(uid.as_raw()) };
    if pw.is_null() {
        return uid.to_string();
    }
    unsafe {
        std::ffi::CStr::from_ptr((*pw).pw_name)
            .to_string_lossy()
            .into_owned()
    }
}

/// Wait for `pid` to exit, returning its exit code (or an error if it was
/// killed by a signal).
pub fn wait(pid: Pid) -> Result<i32> {
    let _sigchld_guard = SignalGuard::install(Signal::SIGCHLD, SigHandler::SigDfl)?;
    match waitpid(pid, None).map_err(|e| MountError::SpawnFailed(anyhow::anyhow!(e)))? {
        WaitStatus::Exited(_, code) => Ok(code),
        WaitStatus::Signaled(_, signal, _) => Err(MountError::SpawnFailed(anyhow::anyhow!(
            "child was killed by signal {signal}"
        ))),
        other => Err(MountError::SpawnFailed(anyhow::anyhow!(
            "unexpected wait status: {other:?}"
        ))),
    }
}

/// Write `data` to `pipe`, then close it, with `SIGPIPE` masked for the
/// duration (spec.md section 5: "writers to the key pipe must tolerate the
/// reader exiting early").
pub fn write_and_close(mut pipe: File, data: &[u8]) -> Result<()> {
    use std::io::Write;
    let _guard = SignalGuard::install(Signal::SIGPIPE, SigHandler::SigIgn)?;
    // A write failure here (EPIPE) means the reader exited early; that is
    // tolerated, not propagated, per spec.md section 5.
    let _ = pipe.write_all(data);
    drop(pipe);
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_spawn_and_wait_echo() {
        let child = spawn(
            &["/bin/echo".to_string(), "hello".to_string()],
            &UidPolicy::KeepCurrent,
            false,
            &[],
        )
        .unwrap();
        let code = wait(child.pid).unwrap();
        assert_eq!(code, 0);
    }

    #[test]
    fn test_spawn_feeds_stdin() {
        // A bare exit-code check here would pass even if the bytes never
        // reached the child (e.g. a closed write end); redirect the child's
        // stdin through to a file and read it back to confirm delivery.
        let out = tempfile::NamedTempFile::new().unwrap();
        let argv = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            format!("cat > {}", out.path().display()),
        ];
        let child = spawn(&argv, &UidPolicy::KeepCurrent, true, &[]).unwrap();
        write_and_close(child.stdin.unwrap(), b"fskey-bytes").unwrap();
        let code = wait(child.pid).unwrap();
        assert_eq!(code, 0);
        assert_eq!(std::fs::read(out.path()).unwrap(), b"fskey-bytes");
    }

    #[test]
    fn test_spawn_nonzero_exit() {
        let child = spawn(
            &["/bin/false".to_string()],
            &UidPolicy::KeepCurrent,
            false,
            &[],
        )
        .unwrap();
        let code = wait(child.pid).unwrap();
        assert_ne!(code, 0);
    }

    #[test]
    fn test_current_pid_is_sane() {
        // exercises the same unistd surface the spawner uses
        assert!(getpid().as_raw() > 0);
    }
}
