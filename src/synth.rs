//! Turns the declarative dataset tree into the mountpoint mapping consumed by the
//! NixOS configuration and the ordered list of datasets to create.

use crate::{
    dataset::{join, DatasetSpec, DatasetTree},
    error::Error,
    pool::{PoolAction, RESERVED},
};
use anyhow::{Context, Result};
use log::debug;
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    io::Write,
    path::Path,
};

/// Stands in for the host name in the mapping; the file is a Nix function of it.
pub(crate) const HOST_PLACEHOLDER: &str = "${host}";

/// The dataset every other dataset is cloned from in a clone run.
pub(crate) const BASE: &str = "base";

/// Datasets that are never mounted on their own, relative to the host. Their names
/// are also stripped off the front of paths when deriving mountpoints, in this order.
pub(crate) const STRUCTURAL: &[&str] = &[
    "system",
    "system/root",
    "swap",
    BASE,
    "omniverse",
    RESERVED,
];

/// Whether a dataset, given relative to the host, is structural.
pub(crate) fn is_structural(relative: &str) -> bool {
    STRUCTURAL.contains(&relative)
}

/// Cloning only pays off when both encryption and deduplication are on; the base
/// dataset itself is always created.
pub(crate) fn should_clone(name: &str, encrypted: bool, deduplicated: bool) -> bool {
    name != BASE && encrypted && deduplicated
}

pub(crate) fn clone_source(host: &str) -> String {
    format!("{}/{}@root", host, BASE)
}

/// `/` followed by the relative path with the structural prefixes stripped.
fn derive_mountpoint(relative: &str) -> String {
    let mut rest = relative;
    for prefix in STRUCTURAL {
        if let Some(stripped) = rest
            .strip_prefix(prefix)
            .and_then(|r| r.strip_prefix('/'))
        {
            rest = stripped;
        }
    }
    format!("/{}", rest)
}

/// Everything a walk needs besides the tree itself.
#[derive(Clone, Copy, Debug)]
pub(crate) struct WalkOptions<'a> {
    pub(crate) host: &'a str,
    pub(crate) root_device: Option<&'a str>,
    pub(crate) primary_user: &'a str,
    pub(crate) users: &'a [String],
    pub(crate) homes: &'a BTreeMap<String, String>,
    pub(crate) pool: bool,
    pub(crate) encrypted: bool,
    pub(crate) deduplicated: bool,
}

/// Where a dataset ends up mounted.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum MountTarget {
    Path(String),
    /// The same dataset duplicated into every user's home.
    PerUser(Vec<String>),
}

impl fmt::Display for MountTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(p) => write!(f, "\"{}\"", p),
            Self::PerUser(paths) => {
                write!(f, "[")?;
                for p in paths {
                    write!(f, " \"{}\"", p)?;
                }
                write!(f, " ]")
            }
        }
    }
}

/// A tree node with its walk context applied.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ResolvedDataset {
    /// Path with the host placeholder, as written to the mapping.
    pub(crate) path: String,
    /// Path in the live pool.
    pub(crate) real: String,
    /// `None` for structural datasets.
    pub(crate) mountpoint: Option<MountTarget>,
    pub(crate) clone_source: Option<String>,
    pub(crate) options: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct MappingEntry {
    pub(crate) dataset: String,
    pub(crate) target: MountTarget,
}

/// The dataset to mountpoint mapping, rendered as a Nix function of `host`.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Mapping {
    pub(crate) root: String,
    pub(crate) entries: Vec<MappingEntry>,
}

impl Mapping {
    #[cfg(test)]
    pub(crate) fn get(&self, dataset: &str) -> Option<&MountTarget> {
        self.entries
            .iter()
            .find(|e| e.dataset == dataset)
            .map(|e| &e.target)
    }
}

impl fmt::Display for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "host: {{")?;
        writeln!(f, "\t\"{}\" = \"/\";", self.root)?;
        for entry in &self.entries {
            writeln!(f, "\t\"{}\" = {};", entry.dataset, entry.target)?;
        }
        writeln!(f, "}}")
    }
}

/// Both products of a walk.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Synthesis {
    pub(crate) mapping: Mapping,
    pub(crate) actions: Vec<PoolAction>,
}

/// Walk the tree depth first, parents before children and siblings in declaration
/// order. Pool actions are only produced when `opts.pool` is set, and only for
/// datasets missing from `live`.
pub(crate) fn synthesize(
    tree: &DatasetTree,
    opts: &WalkOptions<'_>,
    live: &BTreeSet<String>,
) -> Result<Synthesis> {
    let mut walker = Walker {
        opts,
        live,
        entries: vec![],
        actions: vec![],
    };

    for root in &tree.roots {
        walker.visit(root, "", "")?;
    }

    let root = opts
        .root_device
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}/system/root", HOST_PLACEHOLDER));

    Ok(Synthesis {
        mapping: Mapping {
            root,
            entries: walker.entries,
        },
        actions: walker.actions,
    })
}

struct Walker<'a, 'o> {
    opts: &'a WalkOptions<'o>,
    live: &'a BTreeSet<String>,
    entries: Vec<MappingEntry>,
    actions: Vec<PoolAction>,
}

impl Walker<'_, '_> {
    fn visit(&mut self, node: &DatasetSpec, parent: &str, inherited: &str) -> Result<()> {
        let (resolved, inherited) = self.resolve(node, parent, inherited)?;
        debug!("resolved {:?}", resolved);

        if let Some(target) = &resolved.mountpoint {
            self.entries.push(MappingEntry {
                dataset: resolved.path.clone(),
                target: target.clone(),
            });
        }

        if self.opts.pool && !self.live.contains(&resolved.real) {
            self.actions.push(PoolAction {
                dataset: resolved.real.clone(),
                clone_source: resolved.clone_source.clone(),
                options: resolved.options.clone(),
            });
        }

        let relative = join(parent, &node.name);
        for child in &node.children {
            self.visit(child, &relative, &inherited)?;
        }

        Ok(())
    }

    /// Resolve one node; also returns the mountpoint its children build on.
    fn resolve(
        &self,
        node: &DatasetSpec,
        parent: &str,
        inherited: &str,
    ) -> Result<(ResolvedDataset, String)> {
        let host = self.opts.host;
        let relative = join(parent, &node.name);
        let real = format!("{}/{}", host, relative);

        let source = if should_clone(&node.name, self.opts.encrypted, self.opts.deduplicated) {
            Some(clone_source(host))
        } else {
            None
        };

        let mut next = inherited.to_string();
        let mountpoint = if is_structural(&relative) || node.reserved {
            None
        } else {
            let path = if let Some(m) = node.mountpoint_override() {
                next = m.to_string();
                next.clone()
            } else if !inherited.is_empty() {
                next = format!("{}/{}", inherited, node.name);
                next.clone()
            } else {
                derive_mountpoint(&relative)
            };

            Some(self.target(&real, path)?)
        };

        Ok((
            ResolvedDataset {
                path: format!("{}/{}", HOST_PLACEHOLDER, relative),
                real,
                mountpoint,
                clone_source: source,
                options: node.options.clone(),
            },
            next,
        ))
    }

    /// Datasets strictly below the primary user's dataset are duplicated into every
    /// user's home; everything else keeps its single mountpoint.
    fn target(&self, real: &str, path: String) -> Result<MountTarget> {
        let user_root = format!("{}/{}/", self.opts.host, self.opts.primary_user);
        let below = match real.strip_prefix(&user_root) {
            Some(below) if !below.is_empty() => below,
            _ => return Ok(MountTarget::Path(path)),
        };

        let paths = self
            .opts
            .users
            .iter()
            .map(|user| {
                self.opts
                    .homes
                    .get(user)
                    .map(|home| format!("{}/{}", home.trim_end_matches('/'), below))
                    .ok_or_else(|| Error::config(format!("no home directory for user {}", user)))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(MountTarget::PerUser(paths))
    }
}

/// Replace `path` with the rendered mapping in one step, so a failed run never
/// leaves half a file behind.
pub(crate) fn write_mapping(path: &Path, mapping: &Mapping) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("creating a temporary file in {}", dir.display()))?;
    write!(tmp, "{}", mapping)?;
    tmp.persist(path)
        .with_context(|| format!("writing {}", path.display()))?;

    debug!("wrote {}", path.display());
    Ok(())
}
