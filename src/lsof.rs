//! Diagnostic "who has this mountpoint open" helper, invoked only when
//! debug logging is enabled (spec.md section 1: explicitly out of core
//! scope beyond this single call; section 4.10, do_unmount step 1).

use std::path::Path;
use std::process::Command;

use crate::error::{MountError, Result};
use crate::exe::RunAndCheck;

/// One process holding a file open under the mountpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenFile {
    pub pid: u32,
    pub command: String,
    pub path: String,
}

/// Run `lsof` against `mountpoint` and parse its output. Failure to run
/// `lsof` itself (not installed, non-zero with no matches) is reported
/// through the error, since this call is purely advisory — callers should
/// log and continue rather than fail the unmount over it.
pub fn run(mountpoint: &Path) -> Result<Vec<OpenFile>> {
    let output = Command::new("lsof")
        .arg("+D")
        .arg(mountpoint)
        .output_and_check()
        .map_err(MountError::UnmountHelperFailed)?;
    Ok(parse_lsof_output(&output))
}

/// Parse the default `lsof` column output: `COMMAND PID ... NAME`. Lines
/// that don't parse as `command pid ... path` are skipped.
fn parse_lsof_output(output: &str) -> Vec<OpenFile> {
    let mut files = Vec::new();
    for line in output.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 2 {
            continue;
        }
        let Ok(pid) = fields[1].parse::<u32>() else {
            continue;
        };
        let path = fields.last().unwrap_or(&"").to_string();
        files.push(OpenFile {
            pid,
            command: fields[0].to_string(),
            path,
        });
    }
    files
}
