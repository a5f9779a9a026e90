use crate::{error::Error, system::Storage};
use anyhow::{format_err, Result};
use log::{debug, info};
use std::{
    path::{Path, PathBuf},
    str::FromStr,
};

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Device {
    pub(crate) path: PathBuf,
}

impl Device {
    pub(crate) fn dev(&self) -> String {
        self.path.display().to_string()
    }

    pub(crate) fn from_path<T: AsRef<Path>>(path: T) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Where a partition labelled `label` shows up once the kernel sees it.
    pub(crate) fn by_label(label: &str) -> Self {
        Self::from_path(Path::new("/dev/disk/by-label").join(label))
    }
}

/// A partition given on the command line as `DEVICE:INDEX`.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Partition {
    pub(crate) device: Device,
    pub(crate) index: u32,
}

impl FromStr for Partition {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (device, index) = s
            .rsplit_once(':')
            .ok_or_else(|| format_err!("expected DEVICE:INDEX, got {:?}", s))?;
        if device.is_empty() {
            return Err(format_err!("missing device in {:?}", s));
        }
        let index = index
            .parse()
            .map_err(|e| format_err!("bad partition index in {:?}: {}", s, e))?;

        Ok(Self {
            device: Device::from_path(device),
            index,
        })
    }
}

/// A whole-disk layout: one partition per requested size, boot first and swap
/// second, and whatever is left for the pool.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct PartitionLayout {
    pub(crate) device: Device,
    pub(crate) sizes: Vec<String>,
    pub(crate) host: String,
}

impl PartitionLayout {
    pub(crate) fn new<T: Into<String>>(device: Device, sizes: Vec<String>, host: T) -> Result<Self> {
        if sizes.is_empty() {
            return Err(Error::config("a partition layout needs at least a boot partition size").into());
        }

        Ok(Self {
            device,
            sizes,
            host: host.into(),
        })
    }

    /// Number of the partition the pool lives on.
    pub(crate) fn pool_partition(&self) -> usize {
        if self.has_swap() {
            3
        } else {
            2
        }
    }

    pub(crate) fn has_swap(&self) -> bool {
        self.sizes.len() > 1
    }

    /// The parted scripts creating the table and the partitions, in order.
    pub(crate) fn scripts(&self) -> Vec<Vec<String>> {
        let mut scripts = vec![args(&["mklabel", "gpt"])];

        let mut start = "0%".to_string();
        for end in &self.sizes {
            scripts.push(args(&["mkpart", "primary", &start, end]));
            start = end.clone();
        }
        scripts.push(args(&["mkpart", "primary", &start, "100%"]));

        scripts.push(args(&[
            "name",
            &self.pool_partition().to_string(),
            &self.host,
        ]));

        scripts
    }
}

fn args(a: &[&str]) -> Vec<String> {
    a.iter().map(|s| s.to_string()).collect()
}

/// Lay out the disk, then format the boot and swap partitions. An explicit boot or
/// swap partition takes precedence over the one on the laid out disk.
pub(crate) fn partition(
    storage: &dyn Storage,
    layout: Option<&PartitionLayout>,
    boot: Option<&Partition>,
    swap: Option<&Partition>,
) -> Result<()> {
    if let Some(layout) = layout {
        info!("partitioning {}", layout.device.dev());
        for script in layout.scripts() {
            storage.parted(&layout.device.dev(), &script)?;
        }
    }

    let host = layout.map(|l| l.host.as_str());

    match (boot, layout) {
        (Some(boot), _) => format_boot(storage, &boot.device, boot.index, None)?,
        (None, Some(layout)) => format_boot(
            storage,
            &layout.device,
            1,
            host.map(|h| format!("{}-boot", h)).as_deref(),
        )?,
        (None, None) => {}
    }

    match (swap, layout) {
        (Some(swap), _) => format_swap(storage, &swap.device, swap.index, None)?,
        (None, Some(layout)) if layout.has_swap() => format_swap(
            storage,
            &layout.device,
            2,
            host.map(|h| format!("{}-swap", h)).as_deref(),
        )?,
        _ => {}
    }

    Ok(())
}

fn format_boot(storage: &dyn Storage, device: &Device, index: u32, name: Option<&str>) -> Result<()> {
    debug!("boot partition: {}:{}", device.dev(), index);
    let index = index.to_string();
    if let Some(name) = name {
        storage.parted(&device.dev(), &args(&["name", &index, name]))?;
    }
    storage.parted(&device.dev(), &args(&["mkfs", &index, "fat32"]))?;
    storage.parted(&device.dev(), &args(&["set", &index, "boot", "on"]))?;
    storage.parted(&device.dev(), &args(&["set", &index, "esp", "on"]))
}

fn format_swap(storage: &dyn Storage, device: &Device, index: u32, name: Option<&str>) -> Result<()> {
    debug!("swap partition: {}:{}", device.dev(), index);
    let index = index.to_string();
    if let Some(name) = name {
        storage.parted(&device.dev(), &args(&["name", &index, name]))?;
    }
    storage.parted(&device.dev(), &args(&["mkfs", &index, "linux-swap"]))
}
