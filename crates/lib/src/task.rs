//! Wrapper for running an external command with a user-visible
//! description of what it is doing.

use std::ffi::OsStr;
use std::process::Command;

use anyhow::{Context, Result};

use bootstick_utils::CommandRunExt;

/// An external command bound to a short description; the description
/// is printed before the command runs so long operations (mkfs,
/// grub-install, transfers) are attributable.
#[derive(Debug)]
pub(crate) struct Task {
    description: String,
    cmd: Command,
    quiet: bool,
    input: Option<String>,
}

impl Task {
    pub(crate) fn new(description: impl Into<String>, exe: impl AsRef<OsStr>) -> Self {
        Self {
            description: description.into(),
            cmd: Command::new(exe),
            quiet: false,
            input: None,
        }
    }

    pub(crate) fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.cmd.arg(arg);
        self
    }

    pub(crate) fn args<T: AsRef<OsStr>>(mut self, args: impl IntoIterator<Item = T>) -> Self {
        self.cmd.args(args);
        self
    }

    /// Don't print the description.
    pub(crate) fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    /// Feed the given string to the child's stdin.
    pub(crate) fn input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    fn announce(&self) {
        if !self.quiet {
            println!("{}", self.description);
        }
        tracing::debug!("exec: {:?}", self.cmd);
    }

    pub(crate) fn run(mut self) -> Result<()> {
        self.announce();
        let description = self.description;
        if let Some(input) = self.input {
            run_with_input(&mut self.cmd, &input).context(description)
        } else {
            self.cmd.run().context(description)
        }
    }

    /// Run the command, capturing and returning stdout.
    pub(crate) fn read(mut self) -> Result<String> {
        self.announce();
        let description = self.description;
        self.cmd.run_get_string().context(description)
    }
}

fn run_with_input(cmd: &mut Command, input: &str) -> Result<()> {
    use std::io::Write;
    use std::process::Stdio;
    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .context("spawning child")?;
    // SAFETY: We set up a pipe above
    child
        .stdin
        .take()
        .unwrap()
        .write_all(input.as_bytes())
        .context("writing child stdin")?;
    let output = child.wait_with_output().context("waiting for child")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("failed ({}): {}", output.status, stderr.trim());
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_run() {
        Task::new("Running true", "true").quiet().run().unwrap();
        assert!(Task::new("Running false", "false").quiet().run().is_err());
    }

    #[test]
    fn test_read() {
        let out = Task::new("Echoing", "echo")
            .args(["-n", "ok"])
            .quiet()
            .read()
            .unwrap();
        assert_eq!(out, "ok");
    }

    #[test]
    fn test_input() {
        Task::new("Consuming stdin", "sh")
            .args(["-c", "read line && test \"$line\" = hello"])
            .input("hello\n")
            .quiet()
            .run()
            .unwrap();
    }
}
