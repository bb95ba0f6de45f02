//! The operational error taxonomy.
//!
//! Commands propagate `anyhow::Error` chains; the variants below are
//! attached as the root cause (or as context) wherever a failure has a
//! defined meaning for the caller, so both the CLI and tests can
//! `downcast_ref::<Error>()`.

use thiserror::Error;

/// Classified failure conditions of the image lifecycle commands.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bad invocation: unknown verb, wrong arity, malformed device or
    /// source argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The image name does not match the `vendor/release` convention.
    #[error("invalid image name {0:?} (expected vendor/release, segments of [A-Za-z0-9_-])")]
    InvalidName(String),
    /// The caller is not root.
    #[error("this command must be run as root")]
    PermissionDenied,
    /// The device carries no data partition label; it was never
    /// initialized (or its data partition cannot be mounted).
    #[error("device {0} is not initialized")]
    NotInitialized(String),
    /// The named image does not exist on the data partition.
    #[error("image {0} is not deployed")]
    NotDeployed(String),
    /// There is no backup to revert to.
    #[error("image {0} has no backup")]
    NoBackup(String),
    /// The active image carries no embedded update locator.
    #[error("image {0} has no embedded update information")]
    NoUpdateInfo(String),
    /// The transfer for a deploy could not be completed.
    #[error("deploying image {0} failed")]
    DeployFailed(String),
    /// The transfer for an update could not be completed.
    #[error("updating image {0} failed")]
    UpdateFailed(String),
    /// Partitioning/formatting/bootloader installation failed.
    #[error("provisioning device {0} failed")]
    ProvisionFailed(String),
}
