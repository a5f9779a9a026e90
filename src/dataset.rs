use crate::error::Error;
use anyhow::Result;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};

/// Parents that get one child dataset per user of the installed system.
const PER_USER_PARENTS: &[&str] = &["system/home", "system/persist", "virt/podman"];

/// One node of the declarative dataset tree.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct DatasetSpec {
    pub(crate) name: String,
    /// Explicit mountpoint. An empty string in the tree counts as no override.
    pub(crate) mountpoint: Option<String>,
    /// `key=value` properties passed to `zfs create -o`.
    pub(crate) options: Vec<String>,
    /// Children in declaration order.
    pub(crate) children: Vec<DatasetSpec>,
    /// Marks the dataset that holds the pool's reserved space.
    pub(crate) reserved: bool,
}

// The on-disk shape of a node. Unknown keys are rejected so that a typo does not
// silently become an empty branch.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawNode {
    mountpoint: Option<String>,
    #[serde(default)]
    options: Vec<String>,
    #[serde(default)]
    datasets: Option<Mapping>,
    #[serde(default)]
    reserved: bool,
}

impl DatasetSpec {
    pub(crate) fn new<T: Into<String>>(name: T) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Explicit mountpoint, ignoring the empty "inherit" form.
    pub(crate) fn mountpoint_override(&self) -> Option<&str> {
        self.mountpoint.as_deref().filter(|m| !m.is_empty())
    }

    pub(crate) fn child(&self, name: &str) -> Option<&DatasetSpec> {
        self.children.iter().find(|c| c.name == name)
    }

    fn child_mut(&mut self, name: &str) -> Option<&mut DatasetSpec> {
        self.children.iter_mut().find(|c| c.name == name)
    }

    fn from_value(name: &str, path: &str, value: Value) -> Result<Self> {
        validate_name(name, path)?;

        let raw: RawNode = match value {
            Value::Null => RawNode::default(),
            v @ Value::Mapping(_) => serde_yaml::from_value(v)
                .map_err(|e| Error::config(format!("dataset {}: {}", path, e)))?,
            other => {
                return Err(Error::config(format!(
                    "dataset {}: expected a mapping, found {:?}",
                    path, other
                ))
                .into())
            }
        };

        for option in &raw.options {
            match option.split_once('=') {
                Some((k, _)) if !k.is_empty() => {}
                _ => {
                    return Err(Error::config(format!(
                        "dataset {}: option {:?} is not of the form key=value",
                        path, option
                    ))
                    .into())
                }
            }
        }

        let children = match raw.datasets {
            Some(mapping) => children_from_mapping(mapping, Some(path))?,
            None => vec![],
        };

        Ok(Self {
            name: name.to_string(),
            mountpoint: raw.mountpoint,
            options: raw.options,
            children,
            reserved: raw.reserved,
        })
    }
}

/// The whole declarative layout, as an ordered list of top-level datasets.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct DatasetTree {
    pub(crate) roots: Vec<DatasetSpec>,
}

impl DatasetTree {
    /// Parse the base tree and merge the optional user fragment on top of it. A
    /// top-level key of the fragment replaces the base entry of the same name in
    /// place; new keys are appended.
    pub(crate) fn from_yaml(base: &str, fragment: Option<&str>) -> Result<Self> {
        let mut mapping = parse_document(base, "dataset tree")?;

        if let Some(fragment) = fragment {
            for (k, v) in parse_document(fragment, "user dataset tree")? {
                mapping.insert(k, v);
            }
        }

        Ok(Self {
            roots: children_from_mapping(mapping, None)?,
        })
    }

    /// Look a node up by its path relative to the host, e.g. `system/home`.
    #[cfg(test)]
    pub(crate) fn get(&self, path: &str) -> Option<&DatasetSpec> {
        let mut parts = path.split('/');
        let first = parts.next()?;
        let mut node = self.roots.iter().find(|r| r.name == first)?;
        for part in parts {
            node = node.child(part)?;
        }
        Some(node)
    }

    fn get_mut(&mut self, path: &str) -> Option<&mut DatasetSpec> {
        let mut parts = path.split('/');
        let first = parts.next()?;
        let mut node = self.roots.iter_mut().find(|r| r.name == first)?;
        for part in parts {
            node = node.child_mut(part)?;
        }
        Some(node)
    }

    /// Give every user an empty dataset under each per-user parent that exists.
    pub(crate) fn add_users(&mut self, users: &[String]) -> Result<()> {
        for parent in PER_USER_PARENTS {
            if let Some(node) = self.get_mut(parent) {
                for user in users {
                    validate_name(user, &format!("{}/{}", parent, user))?;
                    if node.child(user).is_none() {
                        node.children.push(DatasetSpec::new(user.as_str()));
                    }
                }
            }
        }

        Ok(())
    }

    /// Relative path of the first node flagged as reserved space.
    pub(crate) fn reserved_path(&self) -> Option<String> {
        fn find(node: &DatasetSpec, prefix: &str) -> Option<String> {
            let path = join(prefix, &node.name);
            if node.reserved {
                return Some(path);
            }
            node.children.iter().find_map(|c| find(c, &path))
        }

        self.roots.iter().find_map(|r| find(r, ""))
    }
}

pub(crate) fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}

fn parse_document(text: &str, what: &str) -> Result<Mapping> {
    let value: Value = serde_yaml::from_str(text)
        .map_err(|e| Error::config(format!("could not parse {}: {}", what, e)))?;

    match value {
        Value::Null => Ok(Mapping::new()),
        Value::Mapping(m) => Ok(m),
        _ => Err(Error::config(format!("{} must be a mapping of datasets", what)).into()),
    }
}

fn children_from_mapping(mapping: Mapping, parent: Option<&str>) -> Result<Vec<DatasetSpec>> {
    let mut children = Vec::with_capacity(mapping.len());
    for (k, v) in mapping {
        let name = match k {
            Value::String(s) => s,
            other => {
                return Err(Error::config(format!(
                    "dataset names must be strings, found {:?} under {}",
                    other,
                    parent.unwrap_or("the root")
                ))
                .into())
            }
        };
        let path = join(parent.unwrap_or(""), &name);
        children.push(DatasetSpec::from_value(&name, &path, v)?);
    }

    Ok(children)
}

fn validate_name(name: &str, path: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name.contains('@') {
        return Err(Error::config(format!("invalid dataset name at {:?}", path)).into());
    }

    Ok(())
}
