use crate::{
    config::{Inputs, RunConfig},
    device::{self, Device, Partition, PartitionLayout},
    error::Error,
    pool::PoolGuard,
    system::{Mounter, Storage},
    update::{self, UpdateOptions},
};
use anyhow::Result;
use log::{debug, info, warn};
use structopt::StructOpt;

/// What has to be typed to go ahead with pool creation.
pub(crate) const CONFIRMATION: &str = "ZFS CREATE";

pub(crate) const PROMPT: &str =
    "THIS WILL DELETE ALL DATA ON THE SELECTED DEVICE / PARTITION! TO CONTINUE, TYPE IN 'ZFS CREATE'!";

#[derive(Debug, StructOpt)]
#[structopt(rename_all = "kebab-case")]
pub(crate) struct CreateOpt {
    /// Existing partition to format as the boot partition, as DEVICE:INDEX.
    #[structopt(short = "B", long)]
    pub(crate) boot_device: Option<Partition>,

    /// Number of copies of every block.
    #[structopt(short, long, default_value = "1")]
    pub(crate) copies: u32,

    /// Enable deduplication.
    #[structopt(short, long)]
    pub(crate) deduplicated: bool,

    /// Encrypt the pool with a passphrase.
    #[structopt(short, long)]
    pub(crate) encrypted: bool,

    /// Use the hostname as the mountpoint.
    #[structopt(short = "M", long)]
    pub(crate) host_mountpoint: bool,

    /// Mountpoint of the pool's root dataset.
    #[structopt(short, long)]
    pub(crate) mountpoint: Option<String>,

    /// Extra pool properties, as key=value.
    #[structopt(short = "o", long)]
    pub(crate) pool_options: Vec<String>,

    /// Extra root dataset properties, as key=value.
    #[structopt(short = "O", long)]
    pub(crate) dataset_options: Vec<String>,

    /// Set up an entire disk. The first size is the boot partition, the second the
    /// swap partition, any further ones are left unformatted; the rest of the disk
    /// goes to the pool.
    #[structopt(short = "P", long)]
    pub(crate) partition: Vec<String>,

    /// Only create the reserved dataset.
    #[structopt(short, long)]
    pub(crate) pool_only: bool,

    /// Raid layout for multiple devices, e.g. mirror or raidz2.
    #[structopt(short, long)]
    pub(crate) raid: Option<String>,

    /// Existing partition to format as swap, as DEVICE:INDEX.
    #[structopt(short = "S", long)]
    pub(crate) swap_device: Option<Partition>,

    /// Size of the swap volume in gigabytes.
    #[structopt(short, long, default_value = "0")]
    pub(crate) swap: u32,

    /// Devices the pool is built from.
    #[structopt(short, long, required = true)]
    pub(crate) zfs_devices: Vec<String>,
}

impl CreateOpt {
    /// Reject contradicting options before anything is touched.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.host_mountpoint && self.mountpoint.is_some() {
            return Err(Error::conflict("--host-mountpoint and --mountpoint are mutually exclusive").into());
        }
        if !self.partition.is_empty() && self.raid.is_some() {
            return Err(Error::conflict("--partition and --raid are mutually exclusive").into());
        }
        match (self.zfs_devices.len(), &self.raid) {
            (0, _) => Err(Error::conflict("at least one zfs device is needed").into()),
            (1, Some(_)) => Err(Error::conflict("--raid needs more than one zfs device").into()),
            (n, None) if n > 1 => Err(Error::conflict(
                "for multiple zfs devices a raid configuration must be provided using --raid",
            )
            .into()),
            _ => Ok(()),
        }
    }

    /// The vdev arguments of `zpool create`.
    pub(crate) fn vdevs(&self, host: &str) -> Vec<String> {
        if !self.partition.is_empty() {
            return vec![Device::by_label(host).dev()];
        }

        let mut vdevs = vec![];
        if let Some(raid) = &self.raid {
            vdevs.push(raid.clone());
        }
        vdevs.extend(self.zfs_devices.iter().cloned());
        vdevs
    }

    pub(crate) fn pool_properties(&self, staging: &str) -> Vec<String> {
        let mut props = Properties::default();
        props.set("autotrim", "on");
        props.set("altroot", staging);
        props.set("autoexpand", "on");
        props.extend(&self.pool_options);
        props.into_vec()
    }

    pub(crate) fn dataset_properties(&self, host: &str) -> Vec<String> {
        let mountpoint = if self.host_mountpoint {
            format!("/{}", host)
        } else {
            self.mountpoint.clone().unwrap_or_else(|| "none".to_string())
        };

        let mut props = Properties::default();
        props.set("xattr", "sa");
        props.set("acltype", "posixacl");
        props.set("mountpoint", &mountpoint);
        props.set("compression", "zstd-19");
        props.set("checksum", "edonr");
        props.set("atime", "off");
        props.set("relatime", "off");
        props.set("copies", &self.copies.to_string());
        if self.encrypted {
            props.set("encryption", "aes-256-gcm");
            props.set("keyformat", "passphrase");
        }
        if self.deduplicated {
            props.set("dedup", "edonr,verify");
        }
        props.extend(&self.dataset_options);
        props.into_vec()
    }
}

/// Ordered `key=value` properties where a later value replaces an earlier one.
#[derive(Debug, Default)]
struct Properties(Vec<(String, String)>);

impl Properties {
    fn set(&mut self, key: &str, value: &str) {
        match self.0.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.0.push((key.to_string(), value.to_string())),
        }
    }

    fn extend(&mut self, items: &[String]) {
        for item in items {
            match item.split_once('=') {
                Some((k, v)) => self.set(k, v),
                None => warn!("ignoring property {:?} without a value", item),
            }
        }
    }

    fn into_vec(self) -> Vec<String> {
        self.0
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect()
    }
}

/// Create the pool and populate it. `ask` shows the prompt and returns the answer;
/// anything other than the confirmation phrase leaves everything untouched.
pub(crate) fn run(
    cfg: &RunConfig,
    opt: &CreateOpt,
    inputs: &Inputs,
    storage: &dyn Storage,
    mounter: &dyn Mounter,
    ask: impl FnOnce(&str) -> Result<String>,
) -> Result<bool> {
    opt.validate()?;

    if ask(PROMPT)?.trim() != CONFIRMATION {
        println!("Sorry; not continuing!\n");
        return Ok(false);
    }

    let host = cfg.host.as_str();

    // Whatever happens from here on, the pool is exported at the end.
    let _guard = PoolGuard::new(storage, host);

    let layout = if opt.partition.is_empty() {
        None
    } else {
        let device = Device::from_path(&opt.zfs_devices[0]);
        Some(PartitionLayout::new(device, opt.partition.clone(), host)?)
    };
    if layout.is_some() || opt.boot_device.is_some() || opt.swap_device.is_some() {
        device::partition(
            storage,
            layout.as_ref(),
            opt.boot_device.as_ref(),
            opt.swap_device.as_ref(),
        )?;
    }

    if mounter.is_mountpoint(&cfg.staging)? {
        mounter.unmount_recursive(&cfg.staging)?;
    }

    let prefix = format!("{}/", host);
    if storage
        .datasets()?
        .iter()
        .any(|d| d == host || d.starts_with(&prefix))
    {
        debug!("pool {} is imported; exporting it first", host);
        storage.export_pool(host)?;
    }

    let vdevs = opt.vdevs(host);
    info!("creating pool {} on {}", host, vdevs.join(" "));
    storage.create_pool(
        host,
        &vdevs,
        &opt.pool_properties(&cfg.staging.display().to_string()),
        &opt.dataset_properties(host),
    )?;

    update::update(
        cfg,
        inputs,
        storage,
        &UpdateOptions {
            swap: opt.swap,
            encrypted: opt.encrypted,
            deduplicated: opt.deduplicated,
            pool: true,
            root_device: None,
            reserved_only: opt.pool_only,
        },
    )?;

    Ok(true)
}
