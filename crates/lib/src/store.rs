//! The convention-based image store on the data partition.
//!
//! Layout: `<mount>/boot_images/<vendor>/<release>/` with an `active`
//! payload (present iff the image is deployed) and at most one
//! `backup` payload (present iff an update happened and was neither
//! cleaned nor reverted). All mutations are rename-based; the only
//! file ever written in place is the staging file `active.tmp`.

use std::fs;
use std::str::FromStr;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use regex::Regex;

use crate::error::Error;
use crate::fetch;

/// Top-level directory on the data partition under which all images live.
pub const STORE_ROOT: &str = "boot_images";
/// The currently bootable payload of an image.
pub const ACTIVE: &str = "active";
/// The payload superseded by the most recent update.
pub const BACKUP: &str = "backup";
/// In-flight download target; renamed over `active` on success, never
/// left behind on a handled failure.
const ACTIVE_TMP: &str = "active.tmp";

fn segment_re() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap())
}

/// Whether a single path segment is usable as a vendor or release name.
pub(crate) fn valid_segment(s: &str) -> bool {
    segment_re().is_match(s)
}

/// A validated two-segment image name, `vendor/release`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ImageName {
    vendor: String,
    release: String,
}

impl ImageName {
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidName(s.to_string());
        let (vendor, release) = s.split_once('/').ok_or_else(invalid)?;
        if !valid_segment(vendor) || !valid_segment(release) {
            return Err(invalid().into());
        }
        Ok(Self {
            vendor: vendor.to_string(),
            release: release.to_string(),
        })
    }

    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    pub fn release(&self) -> &str {
        &self.release
    }
}

impl FromStr for ImageName {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl std::fmt::Display for ImageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.vendor, self.release)
    }
}

/// Where a deploy payload comes from.
#[derive(Debug)]
pub(crate) enum DeploySource {
    /// An existing local file, copied into the store.
    LocalFile(Utf8PathBuf),
    /// A remote URL, handed to the fetcher.
    Url(String),
}

impl DeploySource {
    /// Classify a deploy source argument. Anything with a URL scheme
    /// goes to the fetcher; everything else must be an existing file.
    pub(crate) fn parse(s: &str) -> Result<Self> {
        if s.contains("://") {
            return Ok(Self::Url(s.to_string()));
        }
        let path = Utf8PathBuf::from(s);
        if path
            .try_exists()
            .with_context(|| format!("Checking {path}"))?
        {
            Ok(Self::LocalFile(path))
        } else {
            Err(Error::InvalidArgument(format!("no such file: {s}")).into())
        }
    }
}

/// One deployed image, as reported by `list`.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ImageEntry {
    pub(crate) name: ImageName,
    pub(crate) has_backup: bool,
}

/// Handle to the store root on a mounted data partition.
#[derive(Debug)]
pub(crate) struct ImageStore {
    root: Utf8PathBuf,
}

impl ImageStore {
    pub(crate) fn new(mount: &Utf8Path) -> Self {
        Self {
            root: mount.join(STORE_ROOT),
        }
    }

    pub(crate) fn image_dir(&self, name: &ImageName) -> Utf8PathBuf {
        self.root.join(name.vendor()).join(name.release())
    }

    pub(crate) fn active_path(&self, name: &ImageName) -> Utf8PathBuf {
        self.image_dir(name).join(ACTIVE)
    }

    pub(crate) fn backup_path(&self, name: &ImageName) -> Utf8PathBuf {
        self.image_dir(name).join(BACKUP)
    }

    pub(crate) fn staged_path(&self, name: &ImageName) -> Utf8PathBuf {
        self.image_dir(name).join(ACTIVE_TMP)
    }

    /// Create the image directory; pre-existing is not an error.
    #[context("Creating image directory for {name}")]
    pub(crate) fn create(&self, name: &ImageName) -> Result<()> {
        fs::create_dir_all(self.image_dir(name)).map_err(Into::into)
    }

    fn require_deployed(&self, name: &ImageName) -> Result<Utf8PathBuf> {
        let dir = self.image_dir(name);
        if !dir
            .try_exists()
            .with_context(|| format!("Checking {dir}"))?
        {
            return Err(Error::NotDeployed(name.to_string()).into());
        }
        Ok(dir)
    }

    /// Materialize the active payload from a local file or URL. On any
    /// failure (including interruption surfacing as a child-process
    /// error) the rollback guard erases exactly what this deploy
    /// created: the staging file, and the release directory only if it
    /// did not exist beforehand.
    #[context("Deploying {name}")]
    pub(crate) fn deploy(&self, name: &ImageName, source: &DeploySource) -> Result<()> {
        let guard = DeployRollback::new(self, name)?;
        self.create(name)?;
        let staged = self.staged_path(name);
        let fetched = match source {
            DeploySource::LocalFile(path) => copy_payload(path, &staged),
            DeploySource::Url(url) if fetch::is_delta_url(url) => {
                fetch::fetch_delta(url, &staged, None)
            }
            DeploySource::Url(url) => fetch::fetch_bulk(url, &staged),
        };
        fetched.map_err(|e| e.context(Error::DeployFailed(name.to_string())))?;
        fs::rename(&staged, self.active_path(name))
            .with_context(|| format!("Renaming {staged}"))?;
        guard.commit();
        tracing::info!("deployed {name}");
        Ok(())
    }

    /// Commit a staged download: the current active payload becomes
    /// the backup (replacing any previous backup), then the staged
    /// file becomes active. Rename-only, so a crash in between leaves
    /// a valid backup and the staged file, never a truncated active.
    #[context("Committing staged update for {name}")]
    pub(crate) fn promote_staged(&self, name: &ImageName) -> Result<()> {
        let active = self.active_path(name);
        let backup = self.backup_path(name);
        let staged = self.staged_path(name);
        fs::rename(&active, &backup).with_context(|| format!("Renaming {active}"))?;
        fs::rename(&staged, &active).with_context(|| format!("Renaming {staged}"))?;
        Ok(())
    }

    /// Roll back to the payload that was active before the most recent
    /// update. Consumes the backup.
    #[context("Reverting {name}")]
    pub(crate) fn revert(&self, name: &ImageName) -> Result<()> {
        let dir = self.require_deployed(name)?;
        let backup = dir.join(BACKUP);
        if !backup
            .try_exists()
            .with_context(|| format!("Checking {backup}"))?
        {
            return Err(Error::NoBackup(name.to_string()).into());
        }
        fs::rename(&backup, dir.join(ACTIVE)).with_context(|| format!("Renaming {backup}"))?;
        tracing::info!("reverted {name}");
        Ok(())
    }

    /// Discard the backup payload, if any.
    #[context("Cleaning {name}")]
    pub(crate) fn clean(&self, name: &ImageName) -> Result<()> {
        let dir = self.require_deployed(name)?;
        let backup = dir.join(BACKUP);
        if backup
            .try_exists()
            .with_context(|| format!("Checking {backup}"))?
        {
            fs::remove_file(&backup).with_context(|| format!("Removing {backup}"))?;
            tracing::info!("removed backup of {name}");
        }
        Ok(())
    }

    /// Delete the image entirely.
    #[context("Removing {name}")]
    pub(crate) fn remove(&self, name: &ImageName) -> Result<()> {
        let dir = self.require_deployed(name)?;
        fs::remove_dir_all(&dir).with_context(|| format!("Removing {dir}"))?;
        self.prune_vendor(name);
        tracing::info!("removed {name}");
        Ok(())
    }

    // Drop the vendor directory if this was its last release.
    fn prune_vendor(&self, name: &ImageName) {
        let vendor_dir = self.root.join(name.vendor());
        match fs::read_dir(&vendor_dir) {
            Ok(mut entries) => {
                if entries.next().is_none() {
                    let _ = fs::remove_dir(&vendor_dir);
                }
            }
            Err(e) => tracing::debug!("skipping vendor prune of {vendor_dir}: {e}"),
        }
    }

    /// Enumerate deployed images, exactly two directory levels deep,
    /// sorted for stable output. Entries that don't follow the naming
    /// convention or lack an active payload are skipped.
    #[context("Listing images")]
    pub(crate) fn list(&self) -> Result<Vec<ImageEntry>> {
        let mut r = Vec::new();
        if !self
            .root
            .try_exists()
            .with_context(|| format!("Checking {}", self.root))?
        {
            return Ok(r);
        }
        for vendor in self.root.read_dir_utf8()? {
            let vendor = vendor?;
            if !vendor.file_type()?.is_dir() || !valid_segment(vendor.file_name()) {
                continue;
            }
            for release in vendor.path().read_dir_utf8()? {
                let release = release?;
                if !release.file_type()?.is_dir() || !valid_segment(release.file_name()) {
                    continue;
                }
                let dir = release.path();
                if !dir.join(ACTIVE).try_exists()? {
                    continue;
                }
                let name = ImageName::parse(&format!(
                    "{}/{}",
                    vendor.file_name(),
                    release.file_name()
                ))?;
                let has_backup = dir.join(BACKUP).try_exists()?;
                r.push(ImageEntry { name, has_backup });
            }
        }
        r.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(r)
    }
}

fn copy_payload(src: &Utf8Path, dest: &Utf8Path) -> Result<()> {
    fs::copy(src, dest).with_context(|| format!("Copying {src}"))?;
    // Make sure the payload hit the stick before we rename it live.
    fs::File::open(dest)?.sync_all().context("fsync")?;
    Ok(())
}

/// Scoped rollback for an in-flight deploy: until `commit`, dropping
/// this erases the staging file and, if this deploy created the
/// release directory, the directory itself. A pre-existing deployment
/// of the same name is left exactly as it was.
#[derive(Debug)]
struct DeployRollback<'a> {
    store: &'a ImageStore,
    name: &'a ImageName,
    dir_preexisted: bool,
    vendor_preexisted: bool,
    armed: bool,
}

impl<'a> DeployRollback<'a> {
    fn new(store: &'a ImageStore, name: &'a ImageName) -> Result<Self> {
        let dir_preexisted = store.image_dir(name).try_exists()?;
        let vendor_preexisted = store.root.join(name.vendor()).try_exists()?;
        Ok(Self {
            store,
            name,
            dir_preexisted,
            vendor_preexisted,
            armed: true,
        })
    }

    fn commit(mut self) {
        self.armed = false;
    }
}

impl Drop for DeployRollback<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let staged = self.store.staged_path(self.name);
        if let Err(e) = fs::remove_file(&staged) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("failed to remove {staged}: {e}");
            }
        }
        if !self.dir_preexisted {
            let dir = self.store.image_dir(self.name);
            if let Err(e) = fs::remove_dir_all(&dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("failed to remove {dir}: {e}");
                }
            }
            if !self.vendor_preexisted {
                let _ = fs::remove_dir(self.store.root.join(self.name.vendor()));
            }
        }
        tracing::debug!("rolled back interrupted deploy of {}", self.name);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn testdir() -> (tempfile::TempDir, ImageStore) {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(td.path()).unwrap();
        let store = ImageStore::new(root);
        (td, store)
    }

    fn name(s: &str) -> ImageName {
        ImageName::parse(s).unwrap()
    }

    #[test]
    fn test_name_validation() {
        for ok in ["acme-1/widget_2", "a/b", "Vendor/Release-10"] {
            assert!(ImageName::parse(ok).is_ok(), "{ok}");
        }
        for bad in [
            "vendor",
            "vendor/",
            "/release",
            "vendor//release",
            "a/b/c",
            "ve ndor/rel",
            "vendor/rel.ease",
            "",
            "../x",
        ] {
            let e = ImageName::parse(bad).unwrap_err();
            assert!(
                matches!(e.downcast_ref::<Error>(), Some(Error::InvalidName(_))),
                "{bad}"
            );
        }
    }

    #[test]
    fn test_name_display_roundtrip() {
        let n = name("acme/widget");
        assert_eq!(n.to_string(), "acme/widget");
        assert_eq!(n.vendor(), "acme");
        assert_eq!(n.release(), "widget");
    }

    #[test]
    fn test_deploy_list_remove() {
        let (td, store) = testdir();
        let src = td.path().join("payload.iso");
        std::fs::write(&src, b"payload-bytes").unwrap();
        let src = DeploySource::LocalFile(Utf8PathBuf::try_from(src).unwrap());

        let n = name("acme/widget");
        store.deploy(&n, &src).unwrap();
        assert_eq!(
            std::fs::read(store.active_path(&n)).unwrap(),
            b"payload-bytes"
        );
        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, n);
        assert!(!listed[0].has_backup);

        // Deploying again is a replace, not a duplicate
        store.deploy(&n, &src).unwrap();
        assert_eq!(store.list().unwrap().len(), 1);

        store.remove(&n).unwrap();
        assert!(store.list().unwrap().is_empty());
        assert!(!store.image_dir(&n).exists());
        // Vendor dir was pruned too
        assert!(!store.image_dir(&n).parent().unwrap().exists());
    }

    #[test]
    fn test_list_sorted_and_skips_clutter() {
        let (_td, store) = testdir();
        for n in ["zeta/one", "acme/widget", "acme/gadget"] {
            let n = name(n);
            store.create(&n).unwrap();
            std::fs::write(store.active_path(&n), b"x").unwrap();
        }
        // Clutter: no active file, invalid segment, stray file
        store.create(&name("empty/nothing")).unwrap();
        std::fs::create_dir_all(store.root.join("lost+found")).unwrap();
        std::fs::write(store.root.join("README"), b"hi").unwrap();

        let names: Vec<String> = store
            .list()
            .unwrap()
            .into_iter()
            .map(|e| e.name.to_string())
            .collect();
        assert_eq!(names, ["acme/gadget", "acme/widget", "zeta/one"]);
    }

    #[test]
    fn test_promote_and_revert() {
        let (_td, store) = testdir();
        let n = name("acme/widget");
        store.create(&n).unwrap();
        std::fs::write(store.active_path(&n), b"v1").unwrap();
        std::fs::write(store.staged_path(&n), b"v2").unwrap();

        store.promote_staged(&n).unwrap();
        assert_eq!(std::fs::read(store.active_path(&n)).unwrap(), b"v2");
        assert_eq!(std::fs::read(store.backup_path(&n)).unwrap(), b"v1");
        assert!(store.list().unwrap()[0].has_backup);

        // Second update preserves only the most recent backup
        std::fs::write(store.staged_path(&n), b"v3").unwrap();
        store.promote_staged(&n).unwrap();
        assert_eq!(std::fs::read(store.backup_path(&n)).unwrap(), b"v2");

        // Revert restores the pre-update payload and consumes the backup
        store.revert(&n).unwrap();
        assert_eq!(std::fs::read(store.active_path(&n)).unwrap(), b"v2");
        assert!(!store.backup_path(&n).exists());

        let e = store.revert(&n).unwrap_err();
        assert!(matches!(
            e.downcast_ref::<Error>(),
            Some(Error::NoBackup(_))
        ));
    }

    #[test]
    fn test_clean() {
        let (_td, store) = testdir();
        let n = name("acme/widget");

        let e = store.clean(&n).unwrap_err();
        assert!(matches!(
            e.downcast_ref::<Error>(),
            Some(Error::NotDeployed(_))
        ));

        store.create(&n).unwrap();
        std::fs::write(store.active_path(&n), b"v1").unwrap();
        // No backup yet: not an error, and nothing changes
        store.clean(&n).unwrap();
        assert_eq!(std::fs::read(store.active_path(&n)).unwrap(), b"v1");

        std::fs::write(store.backup_path(&n), b"v0").unwrap();
        store.clean(&n).unwrap();
        assert!(!store.backup_path(&n).exists());
        assert!(store.active_path(&n).exists());
    }

    #[test]
    fn test_remove_not_deployed() {
        let (_td, store) = testdir();
        let e = store.remove(&name("no/where")).unwrap_err();
        assert!(matches!(
            e.downcast_ref::<Error>(),
            Some(Error::NotDeployed(_))
        ));
    }

    #[test]
    fn test_deploy_rollback_scoped_to_release() {
        let (_td, store) = testdir();
        let sibling = name("acme/stable");
        store.create(&sibling).unwrap();
        std::fs::write(store.active_path(&sibling), b"keep-me").unwrap();

        let n = name("acme/testing");
        {
            let guard = DeployRollback::new(&store, &n).unwrap();
            store.create(&n).unwrap();
            std::fs::write(store.staged_path(&n), b"partial").unwrap();
            drop(guard); // interrupted before commit
        }
        assert!(!store.image_dir(&n).exists());
        // The sibling release under the same vendor survives
        assert_eq!(std::fs::read(store.active_path(&sibling)).unwrap(), b"keep-me");
    }

    #[test]
    fn test_deploy_rollback_preserves_previous_deployment() {
        let (_td, store) = testdir();
        let n = name("acme/widget");
        store.create(&n).unwrap();
        std::fs::write(store.active_path(&n), b"v1").unwrap();
        {
            let guard = DeployRollback::new(&store, &n).unwrap();
            std::fs::write(store.staged_path(&n), b"partial").unwrap();
            drop(guard);
        }
        assert_eq!(std::fs::read(store.active_path(&n)).unwrap(), b"v1");
        assert!(!store.staged_path(&n).exists());
    }

    #[test]
    fn test_deploy_source_parse() {
        let (td, _store) = testdir();
        let f = td.path().join("x.iso");
        std::fs::write(&f, b"x").unwrap();
        assert!(matches!(
            DeploySource::parse(f.to_str().unwrap()).unwrap(),
            DeploySource::LocalFile(_)
        ));
        assert!(matches!(
            DeploySource::parse("https://example.com/x.iso").unwrap(),
            DeploySource::Url(_)
        ));
        let e = DeploySource::parse("/no/such/file.iso").unwrap_err();
        assert!(matches!(
            e.downcast_ref::<Error>(),
            Some(Error::InvalidArgument(_))
        ));
    }
}
