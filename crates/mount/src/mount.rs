//! Mounting and unmounting, plus the scoped mountpoint used for all
//! data-partition work.
//!
//! Every command invocation that touches the image store mounts the
//! data partition on a private temporary directory and is expected to
//! release it on *every* exit path; [`TempMount`] encodes that as a
//! drop guard.

use std::process::Command;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use tempfile::TempDir;

use bootstick_utils::CommandRunExt;

/// The number of times we will attempt to unmount a target that still
/// shows up as mounted.
const MAX_UNMOUNT_ATTEMPTS: u32 = 10;

/// Whether the given path is currently a mountpoint. `findmnt` exits
/// nonzero for an unknown target, which is the common case here, so
/// failure just means "no".
pub fn is_mounted(path: &Utf8Path) -> bool {
    Command::new("findmnt")
        .arg(path.as_str())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|st| st.success())
        .unwrap_or(false)
}

/// Mount a block device at the target path.
#[context("Mounting {source} at {target}")]
pub fn mount(source: &Utf8Path, target: &Utf8Path) -> Result<()> {
    Command::new("mount")
        .args([source.as_str(), target.as_str()])
        .log_debug()
        .run()
}

/// Unmount the target path.
#[context("Unmounting {target}")]
pub fn unmount(target: &Utf8Path) -> Result<()> {
    Command::new("umount")
        .arg(target.as_str())
        .log_debug()
        .run()
}

/// A block device mounted on a private temporary directory for the
/// duration of one command invocation. Unmounted and removed on drop,
/// tolerating a target that was already unmounted by another actor.
#[derive(Debug)]
pub struct TempMount {
    // Always Some until drop/close
    dir: Option<TempDir>,
    path: Utf8PathBuf,
}

impl TempMount {
    /// Mount the given partition on a fresh temporary directory.
    #[context("Mounting {source} on a temporary directory")]
    pub fn new(source: &Utf8Path) -> Result<Self> {
        let dir = TempDir::with_prefix("bootstick-mount.").context("Allocating mountpoint")?;
        let path = Utf8PathBuf::try_from(dir.path().to_owned())
            .context("Non-UTF-8 temporary directory")?;
        mount(source, &path)?;
        tracing::debug!("mounted {source} at {path}");
        Ok(Self {
            dir: Some(dir),
            path,
        })
    }

    /// Path to the mounted filesystem root.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    // Shared backend for our `close` and `drop` implementations.
    fn impl_close(&mut self) -> Result<()> {
        let Some(dir) = self.dir.take() else {
            tracing::trace!("mountpoint already released");
            return Ok(());
        };
        let mut attempts = 0;
        while is_mounted(&self.path) {
            attempts += 1;
            if attempts > MAX_UNMOUNT_ATTEMPTS {
                anyhow::bail!("Unable to unmount {}", self.path);
            }
            if let Err(e) = unmount(&self.path) {
                // Racing with e.g. a desktop automounter; retry while
                // the kernel still reports it mounted.
                tracing::debug!("unmount attempt {attempts} failed: {e}");
            }
        }
        dir.close().context("Removing mountpoint directory")?;
        tracing::debug!("released mountpoint {}", self.path);
        Ok(())
    }

    /// Consume this mount, unmounting it.
    pub fn close(mut self) -> Result<()> {
        self.impl_close()
    }
}

impl Drop for TempMount {
    fn drop(&mut self) {
        // Best effort to unmount if we're dropped without invoking `close`
        if let Err(e) = self.impl_close() {
            tracing::warn!("failed to release mountpoint: {e}");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_is_mounted_unknown_path() {
        assert!(!is_mounted(Utf8Path::new("/definitely/not/a/mountpoint")));
    }
}
