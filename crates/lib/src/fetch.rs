//! The transfer capability: bulk fetches via curl, delta fetches via
//! zsync. Both are external tools; we only drive them and classify
//! the URL shape.

use anyhow::Result;
use camino::Utf8Path;
use fn_error_context::context;

use crate::task::Task;

/// URLs with this suffix name a zsync control file and get the
/// delta-capable transfer path.
pub(crate) const ZSYNC_SUFFIX: &str = ".zsync";

pub(crate) fn is_delta_url(url: &str) -> bool {
    url.ends_with(ZSYNC_SUFFIX)
}

/// The payload URL behind a locator: a zsync control URL with the
/// suffix stripped, anything else unchanged.
pub(crate) fn payload_url(url: &str) -> &str {
    url.strip_suffix(ZSYNC_SUFFIX).unwrap_or(url)
}

/// Plain bulk transfer of the payload into `dest`.
#[context("Fetching {url}")]
pub(crate) fn fetch_bulk(url: &str, dest: &Utf8Path) -> Result<()> {
    Task::new(format!("Downloading {url}"), "curl")
        .args(["--location", "--fail", "--output", dest.as_str()])
        .arg(payload_url(url))
        .run()
}

/// Delta-capable transfer: reuse blocks from `basis` where the remote
/// control file says they are unchanged. Without a basis this
/// degrades to a full download through the same tool.
#[context("Delta-fetching {url}")]
pub(crate) fn fetch_delta(url: &str, dest: &Utf8Path, basis: Option<&Utf8Path>) -> Result<()> {
    let mut task = Task::new(format!("Syncing {url}"), "zsync").arg("-q");
    if let Some(basis) = basis {
        task = task.args(["-i", basis.as_str()]);
    }
    task.args(["-o", dest.as_str()]).arg(url).run()
}
