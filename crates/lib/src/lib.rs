//! # bootstick
//!
//! Manage a repository of bootable live images on a removable GRUB
//! stick. The stick carries two labeled partitions: a boot partition
//! with GRUB and a generated discovery script, and a data partition
//! holding `boot_images/<vendor>/<release>/active` image payloads.
//! At boot, the discovery script turns that directory layout into a
//! menu of loopback-bootable entries.

// See https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
#![deny(missing_debug_implementations)]
#![forbid(unused_must_use)]
#![deny(unsafe_code)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::todo)]

pub mod cli;
pub mod discovery;
mod error;
mod fetch;
mod install;
mod store;
mod task;
mod update;

pub use error::Error;
