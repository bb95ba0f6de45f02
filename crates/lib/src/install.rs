//! Provisioning: turn a removable block device into an empty
//! bootstick. One GPT label, two partitions: a FAT boot partition
//! carrying GRUB and the generated discovery configuration, and an
//! ext4 data partition carrying the (initially empty) image store.

use std::fs;

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;

use crate::discovery;
use crate::error::Error;
use crate::store;
use crate::task::Task;
use bootstick_mount::TempMount;

/// Filesystem label identifying the boot partition.
pub(crate) const BOOT_LABEL: &str = "STICKBOOT";
/// Filesystem label identifying the data partition; its absence means
/// the device was never initialized.
pub(crate) const DATA_LABEL: &str = "STICKDATA";

pub(crate) const ESP_GUID: &str = "C12A7328-F81F-11D2-BA4B-00A0C93EC93B";
pub(crate) const LINUX_GUID: &str = "0FC63DAF-8483-4772-8E79-3D69D8477DE4";

const BOOT_SIZE_MIB: u32 = 512;

/// Wipe and provision the device. Requires that nothing on it is
/// currently mounted; refuses otherwise before touching anything.
#[context("Initializing {device}")]
pub(crate) fn init(device: &Utf8Path) -> Result<()> {
    let dev = bootstick_blockdev::list_dev(device)?;
    if !dev.is_disk() {
        return Err(Error::InvalidArgument(format!(
            "{device} is not a whole disk (init wipes the entire device)"
        ))
        .into());
    }
    if dev.is_mounted_anywhere() {
        return Err(Error::InvalidArgument(format!(
            "device {device} has mounted filesystems; unmount them first"
        ))
        .into());
    }
    provision(device).map_err(|e| e.context(Error::ProvisionFailed(device.to_string())))?;
    println!("Initialized {device}");
    Ok(())
}

fn provision(device: &Utf8Path) -> Result<()> {
    Task::new(format!("Wiping {device}"), "wipefs")
        .args(["-a", device.as_str()])
        .run()?;
    let script = format!("label: gpt\n,{BOOT_SIZE_MIB}MiB,{ESP_GUID}\n,,{LINUX_GUID}\n");
    Task::new(format!("Partitioning {device}"), "sfdisk")
        .arg(device.as_str())
        .input(script)
        .run()?;
    // Let the kernel re-read the table and the partition nodes appear.
    Task::new("Settling udev", "udevadm")
        .arg("settle")
        .quiet()
        .run()?;

    let table = bootstick_blockdev::partitions_of(device)?;
    let boot = table.find_partno(1)?.path().to_owned();
    let data = table.find_partno(2)?.path().to_owned();

    Task::new(format!("Formatting {boot} (vfat)"), "mkfs.vfat")
        .args(["-F", "32", "-n", BOOT_LABEL, boot.as_str()])
        .run()?;
    Task::new(format!("Formatting {data} (ext4)"), "mkfs.ext4")
        .args(["-q", "-F", "-L", DATA_LABEL, data.as_str()])
        .run()?;

    // The data label is what every later command locates the store by;
    // make sure it actually stuck before declaring the device initialized.
    let label = Task::new(format!("Checking label of {data}"), "blkid")
        .args(["-s", "LABEL", "-o", "value", data.as_str()])
        .quiet()
        .read()?;
    anyhow::ensure!(
        label.trim() == DATA_LABEL,
        "unexpected label {:?} on {data}",
        label.trim()
    );

    populate_boot_partition(&boot)?;
    populate_data_partition(&data)?;
    Ok(())
}

/// Install GRUB and the generated configuration. The EFI image goes to
/// the removable-media path so firmware boots the stick on machines
/// that have never seen it; BIOS is not supported (the two-partition
/// GPT layout leaves no room for a bios_grub embedding partition).
#[context("Populating boot partition {partition}")]
fn populate_boot_partition(partition: &Utf8Path) -> Result<()> {
    let mount = TempMount::new(partition)?;
    let root = mount.path();
    let boot_dir = root.join("boot");
    Task::new("Installing GRUB", "grub-install")
        .args(["--target=x86_64-efi", "--removable", "--no-nvram"])
        .arg(format!("--efi-directory={root}"))
        .arg(format!("--boot-directory={boot_dir}"))
        .run()?;

    let grub_dir = boot_dir.join("grub");
    fs::create_dir_all(&grub_dir).with_context(|| format!("Creating {grub_dir}"))?;
    fs::write(grub_dir.join(discovery::GRUB_CFG), discovery::grub_cfg())
        .context("Writing grub.cfg")?;
    fs::write(
        grub_dir.join(discovery::DISCOVERY_CFG),
        discovery::discovery_script(),
    )
    .context("Writing discovery script")?;
    sync_dir(&grub_dir)?;
    mount.close()
}

/// Create the empty store root.
#[context("Populating data partition {partition}")]
fn populate_data_partition(partition: &Utf8Path) -> Result<()> {
    let mount = TempMount::new(partition)?;
    let store_root = mount.path().join(store::STORE_ROOT);
    fs::create_dir_all(&store_root).with_context(|| format!("Creating {store_root}"))?;
    sync_dir(&store_root)?;
    mount.close()
}

fn sync_dir(path: &Utf8Path) -> Result<()> {
    fs::File::open(path)
        .and_then(|f| f.sync_all())
        .with_context(|| format!("fsync {path}"))
}
