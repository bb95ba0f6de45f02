//! Boot-time discovery: deriving a boot menu from the on-disk layout.
//!
//! At boot there is no daemon to ask; the menu is recomputed from
//! path structure alone. The algorithm lives twice: the functions here
//! are the authoritative model (explicit segment parsing, testable on
//! plain strings), and [`discovery_script`] emits the same algorithm
//! as a GRUB script that `init` installs on the boot partition.

use std::fmt::Display;

use crate::store;

/// Name of the generated top-level GRUB configuration.
pub const GRUB_CFG: &str = "grub.cfg";
/// Name of the generated discovery script, sourced by `grub.cfg`.
pub const DISCOVERY_CFG: &str = "discover.cfg";
/// Second-stage configuration inside each image payload that an entry
/// delegates to after loop-mounting it.
pub const LOOPBACK_CFG: &str = "/boot/grub/loopback.cfg";

/// One enumerated image payload, decomposed from a boot-time path such
/// as `(hd0,gpt2)/boot_images/acme/widget/active`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootImageRef {
    /// Partition-device prefix, e.g. `(hd0,gpt2)`.
    pub device: String,
    /// Store-relative image directory, e.g. `/boot_images/acme/widget`.
    pub directory: String,
    /// Display name, e.g. `acme/widget`.
    pub name: String,
}

impl BootImageRef {
    /// Full path of the active payload on its partition.
    pub fn image_path(&self) -> String {
        format!("{}/{}", self.directory, store::ACTIVE)
    }
}

/// Decompose an enumerated path into its boot entry constituents.
/// This is structural, not textual: the path must consist of a
/// parenthesized device, the store root, exactly two valid name
/// segments, and the active-payload leaf. Anything else yields `None`
/// and the candidate is skipped.
pub fn decompose(path: &str) -> Option<BootImageRef> {
    let rest = path.strip_prefix('(')?;
    let (device, rest) = rest.split_once(')')?;
    if device.is_empty() {
        return None;
    }
    let segments: Vec<&str> = rest.strip_prefix('/')?.split('/').collect();
    let &[root, vendor, release, leaf] = segments.as_slice() else {
        return None;
    };
    if root != store::STORE_ROOT || leaf != store::ACTIVE {
        return None;
    }
    if !store::valid_segment(vendor) || !store::valid_segment(release) {
        return None;
    }
    Some(BootImageRef {
        device: format!("({device})"),
        directory: format!("/{root}/{vendor}/{release}"),
        name: format!("{vendor}/{release}"),
    })
}

/// Derive a device-agnostic partition glob from the boot root
/// expression: `hd0,gpt2` (with or without parentheses) becomes
/// `(hd0,gpt*)`, matching every same-scheme partition of the disk we
/// booted from. Returns `None` for expressions without a partition
/// part (e.g. a whole-disk or netboot root).
pub fn partition_glob(root: &str) -> Option<String> {
    let root = root.strip_prefix('(').unwrap_or(root);
    let root = root.strip_suffix(')').unwrap_or(root);
    let (disk, part) = root.split_once(',')?;
    if disk.is_empty() {
        return None;
    }
    let scheme = part.trim_end_matches(|c: char| c.is_ascii_digit());
    if scheme.is_empty() || scheme.len() == part.len() {
        return None;
    }
    Some(format!("({disk},{scheme}*)"))
}

// GRUB accepts unquoted words for the character set below; anything
// else gets shell-style quoting.
struct GrubQuoted<'a>(&'a str);

impl Display for GrubQuoted<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let plain = !self.0.is_empty()
            && self
                .0
                .chars()
                .all(|c| matches!(c, '/' | '.' | '_' | '-' | '(' | ')' | ',') || c.is_alphanumeric());
        if plain {
            return f.write_str(self.0);
        }
        match shlex::try_quote(self.0) {
            Ok(q) => f.write_str(&q),
            Err(_) => Err(std::fmt::Error),
        }
    }
}

/// A generated boot menu entry: loop-mount one image payload, hand
/// control to the second-stage configuration inside it, release the
/// loop device if that ever returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuEntry {
    /// Display title.
    pub title: String,
    image: BootImageRef,
}

impl MenuEntry {
    pub fn new(image: BootImageRef) -> Self {
        Self {
            title: image.name.clone(),
            image,
        }
    }
}

impl Display for MenuEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let path = self.image.image_path();
        writeln!(f, "menuentry \"{}\" {{", self.title)?;
        writeln!(f, "    set iso_path={}", GrubQuoted(&path))?;
        writeln!(f, "    export iso_path")?;
        writeln!(
            f,
            "    loopback loop {}{}",
            GrubQuoted(&self.image.device),
            GrubQuoted(&path)
        )?;
        writeln!(f, "    set root=(loop)")?;
        writeln!(f, "    configfile {LOOPBACK_CFG}")?;
        writeln!(f, "    loopback -d loop")?;
        writeln!(f, "}}")
    }
}

/// Host-side model of a full discovery pass: decompose every
/// enumerated path, drop the ones that don't follow the convention,
/// and synthesize one entry each, in stable order. An empty result is
/// an empty menu section, not an error.
pub fn plan_entries<'a>(paths: impl IntoIterator<Item = &'a str>) -> Vec<MenuEntry> {
    let mut entries: Vec<MenuEntry> = paths
        .into_iter()
        .filter_map(decompose)
        .map(MenuEntry::new)
        .collect();
    entries.sort_by(|a, b| a.title.cmp(&b.title));
    entries
}

/// The generated top-level GRUB configuration.
pub(crate) fn grub_cfg() -> String {
    format!(
        "# written by bootstick init\n\
         insmod part_gpt\n\
         insmod ext2\n\
         insmod loopback\n\
         insmod regexp\n\
         set timeout=10\n\
         set default=0\n\
         source ${{prefix}}/{DISCOVERY_CFG}\n"
    )
}

/// The discovery script installed on the boot partition: the boot-time
/// rendition of [`decompose`]/[`plan_entries`]. It globs two wildcard
/// levels (vendor, release) below the store root on every same-disk
/// partition, probe-mounts each candidate (silently skipping payloads
/// that aren't mountable images), and emits one menu entry per
/// survivor. Inside a menuentry body, `$1` is the title and `$2`/`$3`
/// are the extra arguments passed at definition time.
pub(crate) fn discovery_script() -> String {
    let store_root = store::STORE_ROOT;
    let active = store::ACTIVE;
    format!(
        r#"# written by bootstick init
# One menu entry per {store_root}/<vendor>/<release>/{active} found on
# any partition of the disk we booted from.

if regexp --set 1:bootstick_disk '^\(?([^,)]+),' "${{root}}"; then
  for bootstick_image in (${{bootstick_disk}},gpt*)/{store_root}/*/*/{active}; do
    if [ -f "${{bootstick_image}}" ]; then
      if loopback bootstick_probe "${{bootstick_image}}"; then
        loopback -d bootstick_probe
        regexp --set 1:bootstick_device --set 2:bootstick_dir --set 3:bootstick_name \
          '^(\([^)]+\))(/{store_root}/(.+))/{active}$' "${{bootstick_image}}"
        menuentry "${{bootstick_name}}" "${{bootstick_device}}" "${{bootstick_dir}}" {{
          set iso_path="$3/{active}"
          export iso_path
          loopback loop "$2$3/{active}"
          set root=(loop)
          configfile {loopback_cfg}
          loopback -d loop
        }}
      fi
    fi
  done
fi
"#,
        loopback_cfg = LOOPBACK_CFG,
    )
}
