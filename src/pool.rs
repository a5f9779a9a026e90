use crate::{size::PoolCapacity, system::Storage};
use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::collections::BTreeSet;

/// Name of the dataset that holds back a share of the pool.
pub(crate) const RESERVED: &str = "reserved";

/// Share of the pool kept free by the reservation, in percent.
pub(crate) const RESERVATION_PERCENT: f64 = 15.0;

/// Snapshot and hold tag marking the freshly created state of every dataset.
pub(crate) const BLANK: &str = "blank";

const SWAP_OPTIONS: &[&str] = &[
    "com.sun:auto-snapshot=false",
    "compression=zle",
    "logbias=throughput",
    "primarycache=metadata",
    "secondarycache=none",
    "sync=standard",
];

/// One dataset to bring into existence.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct PoolAction {
    pub(crate) dataset: String,
    /// Snapshot to clone from; `None` creates the dataset fresh.
    pub(crate) clone_source: Option<String>,
    pub(crate) options: Vec<String>,
}

/// Apply the actions in order, skipping datasets that already exist. Returns how
/// many actions were applied.
pub(crate) fn execute(
    storage: &dyn Storage,
    actions: &[PoolAction],
    live: &BTreeSet<String>,
) -> Result<usize> {
    let mut applied = 0;
    for action in actions {
        if live.contains(&action.dataset) {
            debug!("dataset {} already exists; skipping", action.dataset);
            continue;
        }

        match &action.clone_source {
            Some(snapshot) => {
                info!("cloning {} to {}", snapshot, action.dataset);
                storage.clone_snapshot(snapshot, &action.dataset, &action.options)?;
            }
            None => {
                info!("creating {}", action.dataset);
                storage.create(&action.dataset, &action.options)?;
            }
        }

        let blank = format!("{}@{}", action.dataset, BLANK);
        storage.snapshot(&blank, true)?;
        storage.hold(BLANK, &blank, true)?;

        applied += 1;
    }

    Ok(applied)
}

/// Create the reserved-space dataset, unmounted.
pub(crate) fn create_reserved(storage: &dyn Storage, dataset: &str) -> Result<()> {
    info!("creating reserved dataset {}", dataset);
    storage.create(dataset, &["mountpoint=none".to_string()])
}

/// Set a refreservation of `RESERVATION_PERCENT` of the pool on the reserved
/// dataset, creating the dataset first if the layout did not. Returns the size.
pub(crate) fn apply_reservation(
    storage: &dyn Storage,
    pool: &str,
    dataset: &str,
    live: &BTreeSet<String>,
) -> Result<String> {
    let capacity: PoolCapacity = storage
        .pool_size(pool)?
        .parse()
        .with_context(|| format!("reading the size of pool {}", pool))?;

    if !live.contains(dataset) {
        create_reserved(storage, dataset)?;
    }

    let size = capacity.percentage_of(RESERVATION_PERCENT);
    info!("reserving {} of {} on {}", size, capacity, dataset);
    storage.set(dataset, "refreservation", &size)?;

    Ok(size)
}

/// Create a swap volume of `gigabytes` unless one is live already, then format it.
pub(crate) fn create_swap(
    storage: &dyn Storage,
    pool: &str,
    gigabytes: u32,
    live: &BTreeSet<String>,
) -> Result<()> {
    let dataset = format!("{}/swap", pool);

    if live.contains(&dataset) {
        debug!("swap volume {} exists; skipping", dataset);
    } else {
        let page_size = storage.page_size()?;
        let options: Vec<String> = SWAP_OPTIONS.iter().map(|o| o.to_string()).collect();

        info!("creating {}G swap volume {}", gigabytes, dataset);
        storage.create_volume(
            &dataset,
            &format!("{}G", gigabytes),
            page_size.trim(),
            true,
            &options,
        )?;
    }

    storage.mkswap(&swap_device(pool))
}

/// Block device of the swap volume.
pub(crate) fn swap_device(pool: &str) -> String {
    format!("/dev/zvol/{}/swap", pool)
}

/// Exports the pool when dropped, whichever way the work in between ended.
pub(crate) struct PoolGuard<'a> {
    storage: &'a dyn Storage,
    pool: String,
}

impl<'a> PoolGuard<'a> {
    pub(crate) fn new<T: Into<String>>(storage: &'a dyn Storage, pool: T) -> Self {
        Self {
            storage,
            pool: pool.into(),
        }
    }
}

impl Drop for PoolGuard<'_> {
    fn drop(&mut self) {
        debug!("releasing pool {}", self.pool);
        if let Err(e) = self.storage.export_pool(&self.pool) {
            warn!("could not export pool {}: {:#}", self.pool, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::fake::Fake;

    fn action(dataset: &str) -> PoolAction {
        PoolAction {
            dataset: dataset.to_string(),
            clone_source: None,
            options: vec!["compression=zstd-19".to_string()],
        }
    }

    #[test]
    fn test_execute_creates_snapshots_and_holds() {
        let fake = Fake::new();
        let actions = vec![
            action("box/system"),
            PoolAction {
                dataset: "box/system/nix".to_string(),
                clone_source: Some("box/base@root".to_string()),
                options: vec![],
            },
        ];

        assert_eq!(execute(&fake, &actions, &BTreeSet::new()).unwrap(), 2);
        assert_eq!(
            fake.calls(),
            vec![
                "create box/system -o compression=zstd-19",
                "snapshot -r box/system@blank",
                "hold -r blank box/system@blank",
                "clone box/base@root box/system/nix",
                "snapshot -r box/system/nix@blank",
                "hold -r blank box/system/nix@blank",
            ]
        );
    }

    #[test]
    fn test_execute_is_idempotent() {
        let fake = Fake::new();
        let actions = vec![action("box/system"), action("box/system/nix")];

        execute(&fake, &actions, &fake.datasets().unwrap()).unwrap();
        let first = fake.calls().len();

        let applied = execute(&fake, &actions, &fake.datasets().unwrap()).unwrap();
        assert_eq!(applied, 0);
        assert_eq!(fake.calls().len(), first);
    }

    #[test]
    fn test_execute_stops_at_first_failure() {
        let fake = Fake::new().fail_on("snapshot");
        let actions = vec![action("box/system"), action("box/system/nix")];

        assert!(execute(&fake, &actions, &BTreeSet::new()).is_err());
        assert_eq!(
            fake.calls(),
            vec![
                "create box/system -o compression=zstd-19",
                "snapshot -r box/system@blank",
            ]
        );
    }

    #[test]
    fn test_apply_reservation() {
        let fake = Fake::new().with_pool_size("237.33G");
        let size = apply_reservation(&fake, "box", "box/reserved", &BTreeSet::new()).unwrap();
        assert_eq!(size, "35.6G");
        assert_eq!(
            fake.calls(),
            vec![
                "create box/reserved -o mountpoint=none",
                "set refreservation=35.6G box/reserved",
            ]
        );
    }

    #[test]
    fn test_apply_reservation_existing_dataset() {
        let fake = Fake::new().with_pool_size("100G");
        let live: BTreeSet<String> = vec!["box/reserved".to_string()].into_iter().collect();
        apply_reservation(&fake, "box", "box/reserved", &live).unwrap();
        assert_eq!(fake.calls(), vec!["set refreservation=15.0G box/reserved"]);
    }

    #[test]
    fn test_create_swap() {
        let fake = Fake::new();
        create_swap(&fake, "box", 8, &BTreeSet::new()).unwrap();
        assert_eq!(
            fake.calls(),
            vec![
                "volume -s -V 8G -b 4096 box/swap -o com.sun:auto-snapshot=false -o compression=zle \
                 -o logbias=throughput -o primarycache=metadata -o secondarycache=none \
                 -o sync=standard",
                "mkswap /dev/zvol/box/swap",
            ]
        );
    }

    #[test]
    fn test_create_swap_keeps_live_volume() {
        let fake = Fake::new();
        let live: BTreeSet<String> = vec!["box/swap".to_string()].into_iter().collect();
        create_swap(&fake, "box", 8, &live).unwrap();
        assert_eq!(fake.calls(), vec!["mkswap /dev/zvol/box/swap"]);
    }

    #[test]
    fn test_guard_exports_on_drop() {
        let fake = Fake::new();
        {
            let _guard = PoolGuard::new(&fake, "box");
        }
        assert_eq!(fake.calls(), vec!["export box"]);
    }

    #[test]
    fn test_guard_swallows_export_failure() {
        let fake = Fake::new().fail_on("export");
        drop(PoolGuard::new(&fake, "box"));
        assert_eq!(fake.count("export"), 1);
    }
}
