//! The command-line frontend: argument validation and dispatch.
//!
//! Every verb is validated the same way before any side effect:
//! parse (verb + arity), privilege, device, image name. All verbs
//! except `init` then acquire the scoped data-partition mount and run
//! exactly one store or update operation through it; the first fatal
//! error aborts the command with the mountpoint released.

use std::ffi::OsString;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Parser, Subcommand};
use fn_error_context::context;

use crate::error::Error;
use crate::install;
use crate::store::{DeploySource, ImageName, ImageStore};
use crate::update;
use bootstick_mount::TempMount;

/// Manage bootable live images on a removable GRUB stick.
#[derive(Debug, Parser)]
#[clap(name = "bootstick", version)]
pub(crate) struct Cli {
    #[clap(subcommand)]
    pub(crate) cmd: Command,
}

#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Wipe a device and provision it as an empty bootstick
    Init {
        /// Target block device, e.g. /dev/sdb
        device: Utf8PathBuf,
    },
    /// Deploy an image from a local file or URL
    Deploy {
        device: Utf8PathBuf,
        /// Image name, vendor/release
        name: String,
        /// Local payload path, or an http(s) URL (a .zsync URL gets a
        /// delta-capable transfer)
        source: String,
    },
    /// Fetch the newer revision named by the image's embedded locator
    Update {
        device: Utf8PathBuf,
        name: String,
    },
    /// Roll back to the payload that was active before the last update
    Revert {
        device: Utf8PathBuf,
        name: String,
    },
    /// Discard an image's backup payload
    Clean {
        device: Utf8PathBuf,
        name: String,
    },
    /// Delete an image entirely
    Remove {
        device: Utf8PathBuf,
        name: String,
    },
    /// List deployed images; a trailing * marks images with a backup
    List {
        device: Utf8PathBuf,
    },
}

impl Command {
    fn device(&self) -> &Utf8Path {
        match self {
            Command::Init { device }
            | Command::Deploy { device, .. }
            | Command::Update { device, .. }
            | Command::Revert { device, .. }
            | Command::Clean { device, .. }
            | Command::Remove { device, .. }
            | Command::List { device } => device,
        }
    }

    fn image_name(&self) -> Option<&str> {
        match self {
            Command::Deploy { name, .. }
            | Command::Update { name, .. }
            | Command::Revert { name, .. }
            | Command::Clean { name, .. }
            | Command::Remove { name, .. } => Some(name),
            Command::Init { .. } | Command::List { .. } => None,
        }
    }
}

fn require_root() -> Result<()> {
    if !rustix::process::getuid().is_root() {
        return Err(Error::PermissionDenied.into());
    }
    tracing::trace!("OK: running as root");
    Ok(())
}

fn require_block_device(device: &Utf8Path) -> Result<()> {
    use std::os::unix::fs::FileTypeExt;
    let meta = std::fs::metadata(device)
        .map_err(|_| Error::InvalidArgument(format!("no such device: {device}")))?;
    if !meta.file_type().is_block_device() {
        return Err(Error::InvalidArgument(format!("not a block device: {device}")).into());
    }
    Ok(())
}

/// Locate and mount the data partition of an initialized stick.
#[context("Locating data partition of {device}")]
fn resolve_data_mount(device: &Utf8Path) -> Result<TempMount> {
    let dev = bootstick_blockdev::list_dev(device)?;
    let Some(part) = dev.partition_by_label(install::DATA_LABEL) else {
        return Err(Error::NotInitialized(device.to_string()).into());
    };
    let part_path = Utf8PathBuf::from(part.path());
    TempMount::new(&part_path).map_err(|e| e.context(Error::NotInitialized(device.to_string())))
}

/// Keep SIGINT/SIGTERM from terminating the process outright. A
/// Ctrl-C still reaches any in-flight transfer tool through the
/// foreground process group; its death surfaces as a failed command
/// and unwinds through the rollback and scoped-mount guards, which is
/// the cleanup the signal would otherwise have skipped.
fn install_termination_guard() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt()).context("Installing SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("Installing SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => {},
            _ = sigterm.recv() => {},
        }
        tracing::warn!("interrupted; rolling back and releasing mounts");
    });
    Ok(())
}

fn dispatch(cmd: &Command, name: Option<&ImageName>) -> Result<()> {
    if let Command::Init { device } = cmd {
        return install::init(device);
    }
    // Classify the deploy source before mounting anything so a typo'd
    // local path fails without touching the device.
    let source = match cmd {
        Command::Deploy { source, .. } => Some(DeploySource::parse(source)?),
        _ => None,
    };
    let mount = resolve_data_mount(cmd.device())?;
    let store = ImageStore::new(mount.path());
    let r = match cmd {
        // Handled above
        Command::Init { .. } => Ok(()),
        Command::List { .. } => list(&store),
        // Arity guarantees a name for every verb below
        Command::Deploy { .. } => {
            let name = name.expect("image name");
            let source = source.as_ref().expect("deploy source");
            store.deploy(name, source)
        }
        Command::Update { .. } => update::update(&store, name.expect("image name")),
        Command::Revert { .. } => store.revert(name.expect("image name")),
        Command::Clean { .. } => store.clean(name.expect("image name")),
        Command::Remove { .. } => store.remove(name.expect("image name")),
    };
    // Drop would also release the mountpoint; closing explicitly
    // reports an unmount failure instead of swallowing it.
    let released = mount.close();
    r.and(released)
}

fn list(store: &ImageStore) -> Result<()> {
    for entry in store.list()? {
        let marker = if entry.has_backup { " *" } else { "" };
        println!("{}{marker}", entry.name);
    }
    Ok(())
}

pub async fn run_from_iter<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(e)
            if matches!(
                e.kind(),
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
            ) =>
        {
            let _ = e.print();
            return Ok(());
        }
        Err(e) => {
            let _ = e.print();
            return Err(Error::InvalidArgument("bad command line".to_string()).into());
        }
    };
    install_termination_guard()?;

    require_root()?;
    require_block_device(cli.cmd.device())?;
    let image_name = cli.cmd.image_name().map(ImageName::parse).transpose()?;
    dispatch(&cli.cmd, image_name.as_ref())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_cli_shape() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("bootstick").chain(args.iter().copied()))
    }

    #[test]
    fn test_parse_verbs() {
        let cli = parse(&["deploy", "/dev/sdb", "acme/widget", "img.iso"]).unwrap();
        assert!(matches!(cli.cmd, Command::Deploy { .. }));
        assert_eq!(cli.cmd.device(), Utf8Path::new("/dev/sdb"));
        assert_eq!(cli.cmd.image_name(), Some("acme/widget"));

        let cli = parse(&["list", "/dev/sdb"]).unwrap();
        assert!(matches!(cli.cmd, Command::List { .. }));
        assert_eq!(cli.cmd.image_name(), None);

        let cli = parse(&["init", "/dev/sdb"]).unwrap();
        assert!(matches!(cli.cmd, Command::Init { .. }));
    }

    #[test]
    fn test_parse_arity() {
        // Missing and surplus positional arguments are both rejected
        assert!(parse(&["deploy", "/dev/sdb", "acme/widget"]).is_err());
        assert!(parse(&["list"]).is_err());
        assert!(parse(&["update", "/dev/sdb", "acme/widget", "extra"]).is_err());
        assert!(parse(&[]).is_err());
        assert!(parse(&["frobnicate", "/dev/sdb"]).is_err());
    }
}
