//! The self-describing update protocol.
//!
//! Every deployable image reserves the ISO 9660 application-identifier
//! window of its primary volume descriptor for an update locator: a
//! right-padded URL naming where newer revisions of exactly this image
//! can be fetched. An all-blank window means the image does not
//! support in-place updates.

use std::fs;
use std::io::{Read, Seek, SeekFrom};

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;

use crate::error::Error;
use crate::fetch;
use crate::store::{ImageName, ImageStore};

/// Byte offset of the locator window inside the payload: the
/// application-identifier field of the ISO 9660 primary volume
/// descriptor (sector 16 at 2048 bytes/sector, field offset 574).
pub(crate) const LOCATOR_OFFSET: u64 = 33342;
/// Length of the locator window.
pub(crate) const LOCATOR_LEN: usize = 128;

/// Extract the embedded update locator from an image payload. Returns
/// `None` for an absent or all-padding window (including payloads too
/// short to carry one).
#[context("Reading update locator from {path}")]
pub(crate) fn read_update_url(path: &Utf8Path) -> Result<Option<String>> {
    let mut f = fs::File::open(path).with_context(|| format!("Opening {path}"))?;
    f.seek(SeekFrom::Start(LOCATOR_OFFSET))?;
    let mut window = Vec::with_capacity(LOCATOR_LEN);
    f.take(LOCATOR_LEN as u64).read_to_end(&mut window)?;
    if window.len() < LOCATOR_LEN {
        return Ok(None);
    }
    let trimmed: &[u8] = {
        let mut s = window.as_slice();
        while let [rest @ .., b' ' | b'\0'] = s {
            s = rest;
        }
        s
    };
    if trimmed.is_empty() {
        return Ok(None);
    }
    let url = std::str::from_utf8(trimmed).context("Locator is not UTF-8")?;
    Ok(Some(url.to_string()))
}

/// Fetch the image's next revision as named by its embedded locator,
/// keeping the superseded payload as the backup. The transfer lands in
/// the staging file first; the active payload is replaced only by
/// rename, never overwritten in place, so a failed or interrupted
/// fetch leaves it byte-identical.
#[context("Updating {name}")]
pub(crate) fn update(store: &ImageStore, name: &ImageName) -> Result<()> {
    let active = store.active_path(name);
    if !active
        .try_exists()
        .with_context(|| format!("Checking {active}"))?
    {
        return Err(Error::NotDeployed(name.to_string()).into());
    }
    let url = read_update_url(&active)?
        .ok_or_else(|| Error::NoUpdateInfo(name.to_string()))?;
    tracing::debug!("update locator for {name}: {url}");

    let staged = store.staged_path(name);
    let fetched = if fetch::is_delta_url(&url) {
        fetch::fetch_delta(&url, &staged, Some(&active))
    } else {
        fetch::fetch_bulk(&url, &staged)
    };
    if let Err(e) = fetched {
        if let Err(rm) = fs::remove_file(&staged) {
            if rm.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("failed to remove {staged}: {rm}");
            }
        }
        return Err(e.context(Error::UpdateFailed(name.to_string())));
    }

    store.promote_staged(name)?;
    tracing::info!("updated {name}");
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use camino::Utf8PathBuf;

    fn write_payload(dir: &Utf8Path, locator: Option<&str>) -> Utf8PathBuf {
        let path = dir.join("active");
        let mut buf = vec![0u8; LOCATOR_OFFSET as usize + LOCATOR_LEN + 512];
        if let Some(locator) = locator {
            let window =
                &mut buf[LOCATOR_OFFSET as usize..LOCATOR_OFFSET as usize + LOCATOR_LEN];
            window.fill(b' ');
            window[..locator.len()].copy_from_slice(locator.as_bytes());
        }
        std::fs::write(&path, buf).unwrap();
        path
    }

    #[test]
    fn test_read_locator() {
        let td = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(td.path()).unwrap();

        let url = "https://example.com/acme/widget.iso.zsync";
        let p = write_payload(dir, Some(url));
        assert_eq!(read_update_url(&p).unwrap().as_deref(), Some(url));
    }

    #[test]
    fn test_read_locator_empty_window() {
        let td = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(td.path()).unwrap();

        // NUL-filled and space-filled windows both mean "no updates"
        let p = write_payload(dir, None);
        assert_eq!(read_update_url(&p).unwrap(), None);
        let p = write_payload(dir, Some(""));
        assert_eq!(read_update_url(&p).unwrap(), None);
    }

    #[test]
    fn test_read_locator_short_payload() {
        let td = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(td.path()).unwrap();
        let p = dir.join("active");
        std::fs::write(&p, b"tiny").unwrap();
        assert_eq!(read_update_url(&p).unwrap(), None);
    }

    #[test]
    fn test_update_not_deployed() {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(td.path()).unwrap();
        let store = ImageStore::new(root);
        let name = ImageName::parse("acme/widget").unwrap();
        let e = update(&store, &name).unwrap_err();
        assert!(matches!(
            e.downcast_ref::<Error>(),
            Some(Error::NotDeployed(_))
        ));
    }

    #[test]
    fn test_update_no_locator_leaves_active_unchanged() {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(td.path()).unwrap();
        let store = ImageStore::new(root);
        let name = ImageName::parse("acme/widget").unwrap();
        store.create(&name).unwrap();
        let dir = store.image_dir(&name);
        write_payload(&dir, None);
        let before = std::fs::read(store.active_path(&name)).unwrap();

        let e = update(&store, &name).unwrap_err();
        assert!(matches!(
            e.downcast_ref::<Error>(),
            Some(Error::NoUpdateInfo(_))
        ));
        assert_eq!(std::fs::read(store.active_path(&name)).unwrap(), before);
        assert!(!store.backup_path(&name).exists());
    }
}
