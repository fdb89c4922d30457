//! External command invocation.
//!
//! Every external tool this crate drives (sfdisk, losetup, mkfs.*,
//! pacstrap, arch-chroot, qemu-img, ...) goes through [`Cmd`], which
//! treats the command as a synchronous collaborator: run it, check
//! success, optionally capture stdout. Control decisions are never made
//! from free-form tool output.
//!
//! # Example
//!
//! ```rust,ignore
//! use vm_image_builder::process::Cmd;
//!
//! Cmd::new("mkfs.vfat")
//!     .args(["-F", "32", "-n", "EFI"])
//!     .arg_path(&partition)
//!     .error_msg("mkfs.vfat failed")
//!     .run()?;
//! ```

use anyhow::{bail, Context, Result};
use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Check if a command exists on the host system.
pub fn exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Outcome of a captured command run.
#[derive(Debug)]
pub struct CmdOutput {
    status: std::process::ExitStatus,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Captured stdout, lossy-decoded and trimmed.
    pub fn stdout_trimmed(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }

    pub fn stderr_trimmed(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Builder for a single external command invocation.
pub struct Cmd {
    program: String,
    args: Vec<OsString>,
    current_dir: Option<PathBuf>,
    stdin: Option<Vec<u8>>,
    error_msg: Option<String>,
    allow_fail: bool,
}

impl Cmd {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            current_dir: None,
            stdin: None,
            error_msg: None,
            allow_fail: false,
        }
    }

    pub fn arg(mut self, arg: &str) -> Self {
        self.args.push(OsString::from(arg));
        self
    }

    pub fn args<'a, I>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.args.extend(args.into_iter().map(OsString::from));
        self
    }

    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.as_os_str().to_os_string());
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.current_dir = Some(dir.to_path_buf());
        self
    }

    /// Feed the given bytes to the command's stdin (sfdisk scripts).
    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Message to prepend to the failure error.
    pub fn error_msg(mut self, msg: &str) -> Self {
        self.error_msg = Some(msg.to_string());
        self
    }

    /// Return the output even when the command exits non-zero.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Run with captured stdio. Non-zero exit is an error unless
    /// `allow_fail` was set.
    pub fn run(self) -> Result<CmdOutput> {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        command.stdin(if self.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn '{}'", self.program))?;

        if let Some(input) = &self.stdin {
            // Dropping the handle closes the pipe so the child sees EOF.
            if let Some(mut handle) = child.stdin.take() {
                handle
                    .write_all(input)
                    .with_context(|| format!("writing stdin of '{}'", self.program))?;
            }
        }

        let output = child
            .wait_with_output()
            .with_context(|| format!("waiting for '{}'", self.program))?;

        let result = CmdOutput {
            status: output.status,
            stdout: output.stdout,
            stderr: output.stderr,
        };

        if !result.success() && !self.allow_fail {
            return Err(self.failure_error(&result));
        }

        Ok(result)
    }

    /// Run capturing stdout, returning it trimmed. Non-zero exit is
    /// always an error.
    pub fn run_capture(mut self) -> Result<String> {
        self.allow_fail = false;
        let output = self.run()?;
        Ok(output.stdout_trimmed())
    }

    /// Run with inherited stdio so long operations (pacstrap, pacman)
    /// show their own progress. Non-zero exit is an error.
    pub fn run_interactive(self) -> Result<()> {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }

        let status = command
            .status()
            .with_context(|| format!("failed to spawn '{}'", self.program))?;

        if !status.success() {
            let detail = format!("'{}' exited with {}", self.program, status);
            match &self.error_msg {
                Some(msg) => bail!("{}\n{}", msg, detail),
                None => bail!(detail),
            }
        }

        Ok(())
    }

    fn failure_error(&self, output: &CmdOutput) -> anyhow::Error {
        let stderr = output.stderr_trimmed();
        let detail = if stderr.is_empty() {
            format!("'{}' exited with {}", self.program, output.status)
        } else {
            format!(
                "'{}' exited with {}: {}",
                self.program, output.status, stderr
            )
        };
        match &self.error_msg {
            Some(msg) => anyhow::anyhow!("{}\n{}", msg, detail),
            None => anyhow::anyhow!(detail),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exists() {
        assert!(exists("ls"));
        assert!(!exists("definitely_not_a_real_command_12345"));
    }

    #[test]
    fn test_run_success() {
        let output = Cmd::new("true").run().unwrap();
        assert!(output.success());
    }

    #[test]
    fn test_run_failure_is_error() {
        let result = Cmd::new("false").error_msg("false failed").run();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("false failed"));
    }

    #[test]
    fn test_allow_fail() {
        let output = Cmd::new("false").allow_fail().run().unwrap();
        assert!(!output.success());
    }

    #[test]
    fn test_run_capture() {
        let out = Cmd::new("echo").arg("hello").run_capture().unwrap();
        assert_eq!(out, "hello");
    }

    #[test]
    fn test_stdin_is_piped() {
        let out = Cmd::new("cat").stdin("from stdin").run_capture().unwrap();
        assert_eq!(out, "from stdin");
    }
}
