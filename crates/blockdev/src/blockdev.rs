//! Block device introspection via util-linux.
//!
//! The stick layout convention is entirely label-driven (one boot
//! partition, one data partition, each identified by a filesystem
//! label), so the main job here is turning `lsblk` output into a
//! queryable device tree.

use std::process::Command;

use anyhow::{anyhow, Result};
use camino::Utf8Path;
use fn_error_context::context;
use serde::Deserialize;

use bootstick_utils::CommandRunExt;

#[derive(Debug, Deserialize)]
struct DevicesOutput {
    blockdevices: Vec<Device>,
}

/// One node of the `lsblk` device tree: a whole disk or a partition.
#[derive(Debug, Deserialize)]
pub struct Device {
    pub name: String,
    #[serde(rename = "type")]
    pub devtype: String,
    pub size: u64,
    pub children: Option<Vec<Device>>,

    // Filesystem-related properties
    pub label: Option<String>,
    pub fstype: Option<String>,
    pub path: Option<String>,
    pub mountpoint: Option<String>,
}

impl Device {
    // RHEL8's lsblk doesn't have PATH, so we do it
    pub fn path(&self) -> String {
        self.path.clone().unwrap_or(format!("/dev/{}", &self.name))
    }

    /// Whether this device is a whole disk (as opposed to e.g. a
    /// partition or device-mapper node).
    pub fn is_disk(&self) -> bool {
        matches!(self.devtype.as_str(), "disk" | "loop")
    }

    /// Walk the partitions of this device.
    pub fn partitions(&self) -> impl Iterator<Item = &Device> {
        self.children.iter().flatten()
    }

    /// Find the partition carrying the given filesystem label, if any.
    pub fn partition_by_label(&self, label: &str) -> Option<&Device> {
        self.partitions()
            .find(|p| p.label.as_deref() == Some(label))
    }

    /// Whether this device or any of its partitions is currently
    /// mounted somewhere.
    pub fn is_mounted_anywhere(&self) -> bool {
        self.mountpoint.is_some() || self.partitions().any(|p| p.is_mounted_anywhere())
    }
}

#[context("Listing device {dev}")]
pub fn list_dev(dev: &Utf8Path) -> Result<Device> {
    let devs: DevicesOutput = Command::new("lsblk")
        .args(["-J", "-b", "-o", "NAME,TYPE,SIZE,LABEL,FSTYPE,PATH,MOUNTPOINT"])
        .arg(dev)
        .log_debug()
        .run_and_parse_json()?;
    devs.blockdevices
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no device output from lsblk for {dev}"))
}

#[derive(Debug, Deserialize)]
struct SfDiskOutput {
    partitiontable: PartitionTable,
}

#[derive(Debug, Deserialize)]
pub struct Partition {
    pub node: String,
    pub start: u64,
    pub size: u64,
    #[serde(rename = "type")]
    pub parttype: String,
    pub uuid: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionType {
    Dos,
    Gpt,
    Unknown(String),
}

#[derive(Debug, Deserialize)]
pub struct PartitionTable {
    pub label: PartitionType,
    pub id: String,
    pub device: String,
    pub partitions: Vec<Partition>,
}

impl PartitionTable {
    /// Find the partition with the given device name
    pub fn find<'a>(&'a self, devname: &str) -> Option<&'a Partition> {
        self.partitions.iter().find(|p| p.node.as_str() == devname)
    }

    // Find the partition with the given offset (starting at 1)
    pub fn find_partno(&self, partno: u32) -> Result<&Partition> {
        let idx = partno
            .checked_sub(1)
            .ok_or_else(|| anyhow!("Invalid 1-based partition offset {partno}"))?;
        self.partitions
            .get(idx as usize)
            .ok_or_else(|| anyhow!("Missing partition for index {partno}"))
    }
}

impl Partition {
    pub fn path(&self) -> &Utf8Path {
        self.node.as_str().into()
    }
}

#[context("Listing partitions of {dev}")]
pub fn partitions_of(dev: &Utf8Path) -> Result<PartitionTable> {
    let o: SfDiskOutput = Command::new("sfdisk")
        .args(["-J", dev.as_str()])
        .log_debug()
        .run_and_parse_json()?;
    Ok(o.partitiontable)
}

#[cfg(test)]
mod test {
    use super::*;

    const LSBLK_FIXTURE: &str = indoc::indoc! { r#"
    {
        "blockdevices": [
           {
              "name": "sdb",
              "type": "disk",
              "size": 31268536320,
              "label": null,
              "fstype": null,
              "path": "/dev/sdb",
              "mountpoint": null,
              "children": [
                 {
                    "name": "sdb1",
                    "type": "part",
                    "size": 536870912,
                    "label": "STICKBOOT",
                    "fstype": "vfat",
                    "path": "/dev/sdb1",
                    "mountpoint": null
                 },{
                    "name": "sdb2",
                    "type": "part",
                    "size": 30730617344,
                    "label": "STICKDATA",
                    "fstype": "ext4",
                    "path": "/dev/sdb2",
                    "mountpoint": "/run/media/user/STICKDATA"
                 }
              ]
           }
        ]
     }
    "# };

    #[test]
    fn test_parse_lsblk() {
        let devs: DevicesOutput = serde_json::from_str(LSBLK_FIXTURE).unwrap();
        let dev = devs.blockdevices.into_iter().next().unwrap();
        assert!(dev.is_disk());
        let data = dev.partition_by_label("STICKDATA").unwrap();
        assert_eq!(data.path(), "/dev/sdb2");
        assert_eq!(data.fstype.as_deref(), Some("ext4"));
        assert!(dev.partition_by_label("NOSUCH").is_none());
    }

    #[test]
    fn test_mounted_anywhere() {
        let devs: DevicesOutput = serde_json::from_str(LSBLK_FIXTURE).unwrap();
        let mut dev = devs.blockdevices.into_iter().next().unwrap();
        assert!(dev.is_mounted_anywhere());
        for child in dev.children.iter_mut().flatten() {
            child.mountpoint = None;
        }
        assert!(!dev.is_mounted_anywhere());
    }

    #[test]
    fn test_parse_sfdisk() -> Result<()> {
        let fixture = indoc::indoc! { r#"
        {
            "partitiontable": {
               "label": "gpt",
               "id": "A67AA901-2C72-4818-B098-7F1CAC127279",
               "device": "/dev/sdb",
               "unit": "sectors",
               "firstlba": 34,
               "lastlba": 61071326,
               "sectorsize": 512,
               "partitions": [
                  {
                     "node": "/dev/sdb1",
                     "start": 2048,
                     "size": 1048576,
                     "type": "C12A7328-F81F-11D2-BA4B-00A0C93EC93B",
                     "uuid": "58A4C5F0-BD12-424C-B563-195AC65A25DD",
                     "name": "boot"
                  },{
                     "node": "/dev/sdb2",
                     "start": 1050624,
                     "size": 60020703,
                     "type": "0FC63DAF-8483-4772-8E79-3D69D8477DE4",
                     "uuid": "F51ABB0D-DA16-4A21-83CB-37F4C805AAA0",
                     "name": "data"
                  }
               ]
            }
         }
        "# };
        let table: SfDiskOutput = serde_json::from_str(fixture).unwrap();
        let table = table.partitiontable;
        assert_eq!(table.label, PartitionType::Gpt);
        assert_eq!(table.find("/dev/sdb2").unwrap().size, 60020703);
        assert_eq!(table.find_partno(1)?.node, "/dev/sdb1");
        assert!(table.find_partno(3).is_err());
        Ok(())
    }
}
