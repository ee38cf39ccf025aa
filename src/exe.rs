//! `std::process::Command` extension to check status and produce rich errors.
//!
//! Adapted from the pattern used throughout this codebase for every external
//! helper invocation (mount, cryptsetup, losetup, fsck, lsof, ...).

use std::{
    os::unix::process::ExitStatusExt,
    process::{Command, Output},
};

use anyhow::{anyhow, Context, Error};
use log::trace;

mod private {
    pub trait Sealed {}
    impl Sealed for std::process::Output {}
    impl Sealed for std::process::Command {}
}

/// Extension for `std::process::Output` to check status and render a report.
pub trait OutputChecker: private::Sealed {
    fn is_success(&self) -> bool;
    fn exit_code(&self) -> Option<i32>;
    fn end_signal(&self) -> Option<i32>;
    fn output(&self) -> String;
    fn error_output(&self) -> String;

    fn output_report(&self) -> String {
        let stdout = self.output();
        let stderr = self.error_output();
        let mut res = String::with_capacity(stdout.len() + stderr.len() + 20);
        if !stdout.is_empty() {
            res += &format!("stdout:\n{}\n", stdout);
        }
        if !stderr.is_empty() {
            if !res.is_empty() {
                res += "\n";
            }
            res += &format!("stderr:\n{}\n", stderr);
        }
        res
    }

    fn explain_exit(&self) -> String {
        if let Some(code) = self.exit_code() {
            format!("process exited with status: {code}")
        } else if let Some(signal) = self.end_signal() {
            format!("process was terminated by signal: {signal}")
        } else {
            "process exited with unknown status".into()
        }
    }

    fn check(&self) -> Result<(), Error> {
        if self.is_success() {
            return Ok(());
        }
        Err(match self.output_report() {
            s if !s.is_empty() => anyhow!("Process output:\n{}", s).context(self.explain_exit()),
            _ => anyhow!("(No output was captured)").context(self.explain_exit()),
        })
    }
}

impl OutputChecker for Output {
    fn is_success(&self) -> bool {
        self.status.success()
    }
    fn exit_code(&self) -> Option<i32> {
        self.status.code()
    }
    fn end_signal(&self) -> Option<i32> {
        self.status.signal()
    }
    fn error_output(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into()
    }
    fn output(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into()
    }
}

/// Run a command, capture its output, and turn a non-zero exit into a rich
/// [`anyhow::Error`] carrying stdout/stderr.
pub trait RunAndCheck: private::Sealed {
    fn run_and_check(&mut self) -> Result<(), Error>;
    fn output_and_check(&mut self) -> Result<String, Error>;
    fn render_command(&self) -> String;
}

impl RunAndCheck for Command {
    fn run_and_check(&mut self) -> Result<(), Error> {
        let rendered = self.render_command();
        trace!("Executing '{rendered}'");
        let output = self
            .output()
            .with_context(|| format!("Failed to execute: {rendered}"))?;
        output
            .check()
            .with_context(|| format!("Error when running: {rendered}"))
    }

    fn output_and_check(&mut self) -> Result<String, Error> {
        let rendered = self.render_command();
        trace!("Executing '{rendered}'");
        let output = self
            .output()
            .with_context(|| format!("Failed to execute: {rendered}"))?;
        output
            .check()
            .with_context(|| format!("Error when running: {rendered}"))?;
        Ok(output.output())
    }

    fn render_command(&self) -> String {
        if self.get_args().count() == 0 {
            self.get_program().to_string_lossy().into()
        } else {
            format!(
                "{} {}",
                self.get_program().to_string_lossy(),
                self.get_args()
                    .map(|arg| arg.to_string_lossy())
                    .map(|arg| if arg.contains(' ') {
                        format!("'{}'", arg)
                    } else {
                        arg.into()
                    })
                    .collect::<Vec<_>>()
                    .join(" "),
            )
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_run_and_check() {
        let mut cmd = Command::new("true");
        cmd.run_and_check().unwrap();

        let mut cmd = Command::new("false");
        cmd.run_and_check().unwrap_err();

        let mut cmd = Command::new("nonexistent_command_xyz123");
        cmd.run_and_check().unwrap_err();
    }

    #[test]
    fn test_output_and_check() {
        let mut cmd = Command::new("echo");
        cmd.arg("hello");
        assert_eq!(cmd.output_and_check().unwrap(), "hello\n");
    }

    #[test]
    fn test_render_command() {
        let mut cmd = Command::new("echo");
        cmd.arg("a b");
        cmd.arg("c");
        assert_eq!(cmd.render_command(), "echo 'a b' c");
    }
}
