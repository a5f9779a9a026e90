use crate::{
    config::{Inputs, RunConfig},
    pool::{self, RESERVED},
    synth::{self, WalkOptions},
    system::Storage,
};
use anyhow::Result;
use log::info;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(rename_all = "kebab-case")]
pub(crate) struct UpdateOpt {
    /// The pool was created with deduplication.
    #[structopt(short, long)]
    pub(crate) deduplicated: bool,

    /// The pool is encrypted.
    #[structopt(short, long)]
    pub(crate) encrypted: bool,

    /// Update datasets.nix with any new datasets; the default.
    #[structopt(short, long)]
    pub(crate) files: bool,

    /// Update the pool and datasets.nix with any new datasets.
    #[structopt(short, long, conflicts_with = "files")]
    pub(crate) pool: bool,

    /// Map this device to / instead of <host>/system/root.
    #[structopt(short, long)]
    pub(crate) root_device: Option<String>,

    /// Create a swap volume of this many gigabytes.
    #[structopt(short, long, default_value = "0")]
    pub(crate) swap: u32,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct UpdateOptions {
    /// Swap volume size in gigabytes; zero for none.
    pub(crate) swap: u32,
    pub(crate) encrypted: bool,
    pub(crate) deduplicated: bool,
    /// Create missing datasets, not just the mapping.
    pub(crate) pool: bool,
    pub(crate) root_device: Option<String>,
    /// Only create the reserved dataset.
    pub(crate) reserved_only: bool,
}

impl From<&UpdateOpt> for UpdateOptions {
    fn from(opt: &UpdateOpt) -> Self {
        Self {
            swap: opt.swap,
            encrypted: opt.encrypted,
            deduplicated: opt.deduplicated,
            pool: opt.pool,
            root_device: opt.root_device.clone(),
            reserved_only: false,
        }
    }
}

/// Regenerate the mapping and, when asked to, bring the pool in line with the tree.
pub(crate) fn update(
    cfg: &RunConfig,
    inputs: &Inputs,
    storage: &dyn Storage,
    opts: &UpdateOptions,
) -> Result<()> {
    let host = cfg.host.as_str();
    let reserved = format!(
        "{}/{}",
        host,
        inputs
            .tree
            .reserved_path()
            .unwrap_or_else(|| RESERVED.to_string())
    );

    if opts.reserved_only {
        pool::create_reserved(storage, &reserved)?;
        let live = storage.datasets()?;
        pool::apply_reservation(storage, host, &reserved, &live)?;
        return Ok(());
    }

    let live = if opts.pool {
        storage.datasets()?
    } else {
        Default::default()
    };

    let walk = WalkOptions {
        host,
        root_device: opts.root_device.as_deref(),
        primary_user: &inputs.primary_user,
        users: &inputs.users,
        homes: &inputs.homes,
        pool: opts.pool,
        encrypted: opts.encrypted,
        deduplicated: opts.deduplicated,
    };
    let synthesis = synth::synthesize(&inputs.tree, &walk, &live)?;

    let path = cfg.mapping_path();
    synth::write_mapping(&path, &synthesis.mapping)?;
    info!(
        "wrote {} datasets to {}",
        synthesis.mapping.entries.len(),
        path.display()
    );

    if !opts.pool {
        return Ok(());
    }

    let applied = pool::execute(storage, &synthesis.actions, &live)?;
    info!("created {} datasets", applied);

    let live = storage.datasets()?;
    pool::apply_reservation(storage, host, &reserved, &live)?;

    if opts.swap > 0 {
        pool::create_swap(storage, host, opts.swap, &live)?;
    }

    Ok(())
}
