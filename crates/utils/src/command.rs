//! Helpers for executing external commands. Everything privileged that
//! bootstick does goes through the system tools (util-linux, mkfs,
//! grub-install, transfer tools), so the error experience of a failed
//! child process matters a lot; these helpers ensure stderr ends up in
//! the error chain instead of being lost.

use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

/// Maximum number of trailing stderr lines included in an error.
const MAX_STDERR_LINES: usize = 10;

fn cmd_name(cmd: &Command) -> String {
    cmd.get_program().to_string_lossy().into_owned()
}

fn stderr_tail(buf: &[u8]) -> String {
    let s = String::from_utf8_lossy(buf);
    let lines: Vec<&str> = s.lines().collect();
    let start = lines.len().saturating_sub(MAX_STDERR_LINES);
    lines[start..].join("\n")
}

fn check_status(cmd: &Command, st: std::process::ExitStatus, stderr: &[u8]) -> Result<()> {
    if st.success() {
        return Ok(());
    }
    let name = cmd_name(cmd);
    let tail = stderr_tail(stderr);
    if tail.is_empty() {
        anyhow::bail!("{name} failed: {st}");
    }
    anyhow::bail!("{name} failed: {st}\n{tail}");
}

/// Extension trait for [`std::process::Command`].
pub trait CommandRunExt {
    /// Log (at debug level) the full child commandline.
    fn log_debug(&mut self) -> &mut Self;
    /// Execute the child process, capturing stderr; it is included in
    /// the error on failure.
    fn run(&mut self) -> Result<()>;
    /// Execute the child process, capturing and returning stdout.
    fn run_get_string(&mut self) -> Result<String>;
    /// Execute the child process, parsing its stdout as JSON.
    fn run_and_parse_json<T: DeserializeOwned>(&mut self) -> Result<T>;
}

impl CommandRunExt for Command {
    fn log_debug(&mut self) -> &mut Self {
        // We assume no sensitive information is in the arguments.
        tracing::debug!("exec: {self:?}");
        self
    }

    fn run(&mut self) -> Result<()> {
        let name = cmd_name(self);
        let output = self
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("spawning {name}"))?;
        check_status(self, output.status, &output.stderr)
    }

    fn run_get_string(&mut self) -> Result<String> {
        let name = cmd_name(self);
        let output = self
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("spawning {name}"))?;
        check_status(self, output.status, &output.stderr)?;
        String::from_utf8(output.stdout).with_context(|| format!("parsing output of {name}"))
    }

    fn run_and_parse_json<T: DeserializeOwned>(&mut self) -> Result<T> {
        let name = cmd_name(self);
        let output = self
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("spawning {name}"))?;
        check_status(self, output.status, &output.stderr)?;
        serde_json::from_slice(&output.stdout).with_context(|| format!("parsing JSON from {name}"))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_run_ok() {
        Command::new("true").run().unwrap();
    }

    #[test]
    fn test_run_fail_captures_stderr() {
        let e = Command::new("sh")
            .args(["-c", "echo oops >&2; exit 3"])
            .run()
            .unwrap_err();
        let msg = format!("{e}");
        assert!(msg.contains("oops"), "{msg}");
    }

    #[test]
    fn test_run_get_string() {
        let s = Command::new("echo").arg("hello").run_get_string().unwrap();
        assert_eq!(s.trim(), "hello");
    }

    #[test]
    fn test_run_and_parse_json() {
        #[derive(serde::Deserialize)]
        struct V {
            a: u32,
        }
        let v: V = Command::new("echo")
            .arg(r#"{"a": 42}"#)
            .run_and_parse_json()
            .unwrap();
        assert_eq!(v.a, 42);
    }

    #[test]
    fn test_stderr_tail_truncates() {
        let many: String = (0..50).map(|i| format!("line{i}\n")).collect();
        let tail = stderr_tail(many.as_bytes());
        assert!(tail.starts_with("line40"));
        assert!(tail.ends_with("line49"));
    }
}
