use crate::{
    config::NIXOS_DIR,
    device::Device,
    error::Error,
    pool::swap_device,
    system::{Mounter, Storage},
};
use anyhow::{Context, Result};
use log::{debug, info};
use std::path::{Path, PathBuf};
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(rename_all = "kebab-case")]
pub(crate) struct MountOpt {
    /// Boot (EFI) partition to mount at /boot/efi.
    #[structopt(short, long)]
    pub(crate) boot_device: Option<PathBuf>,

    /// The pool was created with deduplication.
    #[structopt(short, long)]
    pub(crate) deduplicated: bool,

    /// The pool is encrypted; its key is loaded first.
    #[structopt(short, long)]
    pub(crate) encrypted: bool,

    /// Mount this device as the root instead of <host>/system/root.
    #[structopt(short, long)]
    pub(crate) root_device: Option<String>,

    /// Activate the pool's swap volume.
    #[structopt(short, long)]
    pub(crate) swap: bool,

    /// Activate this swap device.
    #[structopt(short = "S", long)]
    pub(crate) swap_device: Option<PathBuf>,

    /// Install the system once everything is mounted.
    #[structopt(short, long)]
    pub(crate) install: bool,

    /// Install the bootloader too; implies --install.
    #[structopt(short = "I", long)]
    pub(crate) install_bootloader: bool,
}

impl MountOpt {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.swap && self.swap_device.is_some() {
            return Err(Error::conflict("--swap and --swap-device are mutually exclusive").into());
        }
        Ok(())
    }
}

/// What to mount, independent of the command line.
#[derive(Clone, Debug, Default)]
pub(crate) struct MountOptions {
    pub(crate) root_device: Option<String>,
    pub(crate) boot_device: Option<Device>,
    pub(crate) swap: bool,
    pub(crate) swap_device: Option<Device>,
    pub(crate) encrypted: bool,
}

impl From<&MountOpt> for MountOptions {
    fn from(opt: &MountOpt) -> Self {
        Self {
            root_device: opt.root_device.clone(),
            boot_device: opt.boot_device.as_ref().map(Device::from_path),
            swap: opt.swap,
            swap_device: opt.swap_device.as_ref().map(Device::from_path),
            encrypted: opt.encrypted,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum MountStep {
    LoadKey(String),
    Mount {
        source: String,
        target: PathBuf,
        fstype: Option<String>,
        bind: bool,
    },
    Directory(PathBuf),
    Swap(String),
}

impl MountStep {
    fn zfs(source: String, target: PathBuf) -> Self {
        Self::Mount {
            source,
            target,
            fstype: Some("zfs".to_string()),
            bind: false,
        }
    }
}

/// The mounts for one host, in the order they nest.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct MountPlan {
    pub(crate) steps: Vec<MountStep>,
}

impl MountPlan {
    pub(crate) fn new(host: &str, staging: &Path, opts: &MountOptions) -> Self {
        let mut steps = vec![];

        if opts.encrypted {
            steps.push(MountStep::LoadKey(host.to_string()));
        }

        steps.push(match &opts.root_device {
            Some(device) => MountStep::Mount {
                source: device.clone(),
                target: staging.to_path_buf(),
                fstype: None,
                bind: false,
            },
            None => MountStep::zfs(format!("{}/system/root", host), staging.to_path_buf()),
        });

        // nixos-install expects the target root to be reachable under itself.
        steps.push(MountStep::Mount {
            source: staging.display().to_string(),
            target: staging.join("mnt"),
            fstype: None,
            bind: true,
        });
        steps.push(MountStep::Directory(staging.join(NIXOS_DIR)));

        steps.push(MountStep::zfs(
            format!("{}/system/nix", host),
            staging.join("nix"),
        ));
        steps.push(MountStep::zfs(
            format!("{}/system/persist", host),
            staging.join("persist"),
        ));

        if let Some(boot) = &opts.boot_device {
            steps.push(MountStep::Mount {
                source: boot.dev(),
                target: staging.join("boot/efi"),
                fstype: None,
                bind: false,
            });
        }

        if let Some(swap) = &opts.swap_device {
            steps.push(MountStep::Swap(swap.dev()));
        } else if opts.swap {
            steps.push(MountStep::Swap(swap_device(host)));
        }

        // The build space lives on the live system's /tmp, not inside the target.
        steps.push(MountStep::zfs(
            format!("{}/system/tmp", host),
            PathBuf::from("/tmp"),
        ));
        steps.push(MountStep::zfs(
            format!("{}/system/tmp/nix", host),
            PathBuf::from("/tmp/nix"),
        ));

        Self { steps }
    }

    /// The `(source, target)` of every mount, in order.
    pub(crate) fn mounts(&self) -> Vec<(&str, &Path)> {
        self.steps
            .iter()
            .filter_map(|s| match s {
                MountStep::Mount { source, target, .. } => Some((source.as_str(), target.as_path())),
                _ => None,
            })
            .collect()
    }

    /// Run the steps top to bottom; the first failure stops the sequence.
    pub(crate) fn execute(self, storage: &dyn Storage, mounter: &dyn Mounter) -> Result<()> {
        for step in self.steps {
            debug!("mount step: {:?}", step);
            match step {
                MountStep::LoadKey(dataset) => {
                    info!("loading the key for {}", dataset);
                    storage.load_key(&dataset)?;
                }
                MountStep::Mount {
                    source,
                    target,
                    fstype,
                    bind,
                } => {
                    prepare(mounter, &target)?;
                    info!("mounting {} at {}", source, target.display());
                    let mounted = if bind {
                        mounter.bind_mount(Path::new(&source), &target)
                    } else {
                        mounter.mount(&source, &target, fstype.as_deref())
                    };
                    mounted
                        .with_context(|| format!("mounting {} at {}", source, target.display()))?;
                }
                MountStep::Directory(path) => mounter.create_dir(&path)?,
                MountStep::Swap(device) => {
                    info!("activating swap on {}", device);
                    storage.swapon(&device)?;
                }
            }
        }

        Ok(())
    }
}

// A target that is already mounted is cleared first; otherwise it must exist.
fn prepare(mounter: &dyn Mounter, target: &Path) -> Result<()> {
    if mounter.is_mountpoint(target)? {
        debug!("{} is already mounted; unmounting", target.display());
        mounter.unmount_recursive(target)
    } else {
        mounter.create_dir(target)
    }
}

/// Import the pool if it is not visible yet, then mount everything.
pub(crate) fn mount(
    host: &str,
    staging: &Path,
    opts: &MountOptions,
    storage: &dyn Storage,
    mounter: &dyn Mounter,
) -> Result<()> {
    let prefix = format!("{}/", host);
    let imported = storage
        .datasets()?
        .iter()
        .any(|d| d == host || d.starts_with(&prefix));
    if !imported {
        info!("importing pool {}", host);
        storage.import_pool(host)?;
    }

    let plan = MountPlan::new(host, staging, opts);
    debug!("mounts: {:?}", plan.mounts());
    plan.execute(storage, mounter)
}
