use anyhow::Result;
use std::{collections::BTreeSet, path::Path};

mod host;
#[cfg(test)]
pub(crate) mod fake;

pub(crate) use host::Host;

/// Pool, dataset and swap operations. Everything the provisioning core mutates on
/// the storage side goes through here.
pub(crate) trait Storage {
    /// Every dataset currently visible in any imported pool.
    fn datasets(&self) -> Result<BTreeSet<String>>;

    /// The raw `size` property of a pool, e.g. `237G`.
    fn pool_size(&self, pool: &str) -> Result<String>;

    fn create_pool(
        &self,
        pool: &str,
        vdevs: &[String],
        pool_properties: &[String],
        dataset_properties: &[String],
    ) -> Result<()>;

    fn import_pool(&self, pool: &str) -> Result<()>;

    /// Forcefully export a pool.
    fn export_pool(&self, pool: &str) -> Result<()>;

    fn load_key(&self, dataset: &str) -> Result<()>;

    fn create(&self, dataset: &str, options: &[String]) -> Result<()>;

    fn clone_snapshot(&self, snapshot: &str, dataset: &str, options: &[String]) -> Result<()>;

    fn create_volume(
        &self,
        dataset: &str,
        size: &str,
        block_size: &str,
        sparse: bool,
        options: &[String],
    ) -> Result<()>;

    fn snapshot(&self, snapshot: &str, recursive: bool) -> Result<()>;

    fn hold(&self, tag: &str, snapshot: &str, recursive: bool) -> Result<()>;

    fn set(&self, dataset: &str, property: &str, value: &str) -> Result<()>;

    fn page_size(&self) -> Result<String>;

    fn mkswap(&self, device: &str) -> Result<()>;

    fn swapon(&self, device: &str) -> Result<()>;

    /// Run one parted script against a disk.
    fn parted(&self, device: &str, script: &[String]) -> Result<()>;
}

/// Mount table operations.
pub(crate) trait Mounter {
    fn is_mountpoint(&self, path: &Path) -> Result<bool>;

    /// Create a directory and its parents; an existing one is fine.
    fn create_dir(&self, path: &Path) -> Result<()>;

    fn mount(&self, source: &str, target: &Path, fstype: Option<&str>) -> Result<()>;

    fn bind_mount(&self, source: &Path, target: &Path) -> Result<()>;

    fn unmount_recursive(&self, target: &Path) -> Result<()>;
}

/// The downstream NixOS tooling.
pub(crate) trait Nixos {
    /// Copy the contents of `from` into `to`.
    fn copy(&self, from: &Path, to: &Path) -> Result<()>;

    fn generate_config(&self, root: &Path) -> Result<()>;

    /// Replace every occurrence of `from` with `to` in `file`.
    fn replace(&self, from: &str, to: &str, file: &Path) -> Result<()>;

    fn install(&self, args: &[String], install_bootloader: bool, options: &[(&str, &str)])
        -> Result<()>;

    fn rebuild(&self, action: &str, args: &[String]) -> Result<()>;
}
