use crate::{dataset::DatasetTree, error::Error};
use anyhow::{Context, Result};
use log::debug;
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

/// Where the installed system's configuration lives, relative to a root.
pub(crate) const NIXOS_DIR: &str = "etc/nixos";

/// Default staging root the target system is assembled under.
pub(crate) const STAGING: &str = "/mnt";

/// How external commands are treated.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum ExecMode {
    Run,
    /// Log mutating commands instead of running them.
    Print,
    /// Log mutating commands, then run them.
    PrintRun,
}

/// Per-run settings, passed explicitly to everything that needs them.
#[derive(Clone, Debug)]
pub(crate) struct RunConfig {
    pub(crate) host: String,
    pub(crate) resources: PathBuf,
    pub(crate) staging: PathBuf,
    pub(crate) mode: ExecMode,
}

impl RunConfig {
    pub(crate) fn new<T: Into<String>>(host: T, resources: PathBuf, mode: ExecMode) -> Self {
        Self {
            host: host.into(),
            resources,
            staging: PathBuf::from(STAGING),
            mode,
        }
    }

    /// The generated dataset to mountpoint mapping.
    pub(crate) fn mapping_path(&self) -> PathBuf {
        self.resources.join("datasets.nix")
    }

    /// The configuration directory inside the staging root.
    pub(crate) fn staged_nixos_dir(&self) -> PathBuf {
        self.staging.join(NIXOS_DIR)
    }
}

/// Find the configuration directory when none is passed: the current directory if
/// it already is an `etc/nixos`, otherwise the nearest `<ancestor>/etc/nixos`. When
/// that turns out to be the live `/etc/nixos` and a staged copy exists under the
/// staging root, the staged copy wins.
pub(crate) fn find_resources(cwd: &Path, staging: &Path) -> Result<PathBuf> {
    if cwd.ends_with(NIXOS_DIR) {
        return Ok(cwd.to_path_buf());
    }

    for dir in cwd.ancestors() {
        let candidate = dir.join(NIXOS_DIR);
        if !candidate.is_dir() {
            continue;
        }

        if candidate == Path::new("/").join(NIXOS_DIR) {
            let staged = staging.join(NIXOS_DIR);
            if staged.is_dir() {
                return Ok(staged);
            }
        }

        return Ok(candidate);
    }

    Err(Error::config(format!("no {} directory found above {}", NIXOS_DIR, cwd.display())).into())
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum UserList {
    Names(Vec<String>),
    /// User name to the name of their per-user datasets, in file order.
    Map(serde_json::Map<String, serde_json::Value>),
}

/// The static inputs of a run, read once from the resources directory.
#[derive(Clone, Debug)]
pub(crate) struct Inputs {
    pub(crate) tree: DatasetTree,
    pub(crate) primary_user: String,
    /// Login names, in the order per-user mappings list them.
    pub(crate) users: Vec<String>,
    /// Per-user dataset names, in the same order as `users`.
    pub(crate) user_datasets: Vec<String>,
    pub(crate) homes: BTreeMap<String, String>,
}

impl Inputs {
    /// Load `datasets.yaml`, the optional `user_datasets.yaml` fragment,
    /// `username.txt`, `users.json` and `homes.json`.
    pub(crate) fn load(dir: &Path) -> Result<Self> {
        debug!("loading inputs from {}", dir.display());

        let base = read(dir, "datasets.yaml")?;
        let fragment_path = dir.join("user_datasets.yaml");
        let fragment = if fragment_path.exists() {
            Some(read(dir, "user_datasets.yaml")?)
        } else {
            None
        };

        let primary_user = read(dir, "username.txt")?.trim().to_string();

        let users: UserList = serde_json::from_str(&read(dir, "users.json")?)
            .map_err(|e| Error::config(format!("users.json: {}", e)))?;
        let (users, user_datasets) = match users {
            UserList::Names(names) => (names.clone(), names),
            UserList::Map(map) => {
                let mut names = vec![];
                let mut datasets = vec![];
                for (name, dataset) in map {
                    let dataset = dataset.as_str().ok_or_else(|| {
                        Error::config(format!("users.json: dataset of {} is not a string", name))
                    })?;
                    datasets.push(dataset.to_string());
                    names.push(name);
                }
                (names, datasets)
            }
        };

        let homes: BTreeMap<String, String> = serde_json::from_str(&read(dir, "homes.json")?)
            .map_err(|e| Error::config(format!("homes.json: {}", e)))?;

        Self::with_user_datasets(
            DatasetTree::from_yaml(&base, fragment.as_deref())?,
            primary_user,
            users,
            user_datasets,
            homes,
        )
    }

    /// Inputs where every user's datasets carry the user's own name.
    pub(crate) fn new(
        tree: DatasetTree,
        primary_user: String,
        users: Vec<String>,
        homes: BTreeMap<String, String>,
    ) -> Result<Self> {
        let user_datasets = users.clone();
        Self::with_user_datasets(tree, primary_user, users, user_datasets, homes)
    }

    /// Validate the user inputs and give every user their per-user datasets.
    pub(crate) fn with_user_datasets(
        mut tree: DatasetTree,
        primary_user: String,
        users: Vec<String>,
        user_datasets: Vec<String>,
        homes: BTreeMap<String, String>,
    ) -> Result<Self> {
        if primary_user.is_empty() {
            return Err(Error::config("username.txt is empty").into());
        }
        if !users.contains(&primary_user) {
            return Err(
                Error::config(format!("primary user {} is not in users.json", primary_user)).into(),
            );
        }
        if let Some(user) = users.iter().find(|u| !homes.contains_key(*u)) {
            return Err(Error::config(format!("no home directory for user {}", user)).into());
        }

        if user_datasets.len() != users.len() {
            return Err(Error::config("every user needs exactly one dataset name").into());
        }

        tree.add_users(&user_datasets)?;

        Ok(Self {
            tree,
            primary_user,
            users,
            user_datasets,
            homes,
        })
    }
}

fn read(dir: &Path, name: &str) -> Result<String> {
    let path = dir.join(name);
    fs::read_to_string(&path)
        .map_err(|e| Error::config(format!("{}: {}", path.display(), e)))
        .with_context(|| format!("reading {}", name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, contents: &str) {
        fs::write(dir.join(name), contents).unwrap();
    }

    fn resources() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "datasets.yaml",
            "system:\n  datasets:\n    root: {}\n    home: {}\n",
        );
        write(dir.path(), "username.txt", "alice\n");
        write(dir.path(), "users.json", r#"["alice", "bob"]"#);
        write(
            dir.path(),
            "homes.json",
            r#"{"alice": "/home/alice", "bob": "/home/bob"}"#,
        );
        dir
    }

    #[test]
    fn test_load() {
        let dir = resources();
        let inputs = Inputs::load(dir.path()).unwrap();
        assert_eq!(inputs.primary_user, "alice");
        assert_eq!(inputs.users, ["alice", "bob"]);
        assert!(inputs.tree.get("system/home/bob").is_some());
    }

    #[test]
    fn test_load_user_map_and_fragment() {
        let dir = resources();
        write(
            dir.path(),
            "users.json",
            r#"{"alice": "alice", "bob": "bob"}"#,
        );
        write(dir.path(), "user_datasets.yaml", "alice:\n  datasets:\n    cache: {}\n");
        let inputs = Inputs::load(dir.path()).unwrap();
        assert_eq!(inputs.users, ["alice", "bob"]);
        assert!(inputs.tree.get("alice/cache").is_some());
    }

    #[test]
    fn test_user_map_names_datasets_by_value() {
        let dir = resources();
        write(dir.path(), "username.txt", "jeet\n");
        write(dir.path(), "users.json", r#"{"jeet": "shadowrylander"}"#);
        write(dir.path(), "homes.json", r#"{"jeet": "/home/jeet"}"#);

        let inputs = Inputs::load(dir.path()).unwrap();
        assert_eq!(inputs.users, ["jeet"]);
        assert_eq!(inputs.user_datasets, ["shadowrylander"]);
        assert!(inputs.tree.get("system/home/shadowrylander").is_some());
        assert!(inputs.tree.get("system/home/jeet").is_none());
    }

    #[test]
    fn test_user_map_keeps_file_order() {
        let dir = resources();
        write(dir.path(), "users.json", r#"{"bob": "b", "alice": "a"}"#);
        let inputs = Inputs::load(dir.path()).unwrap();
        assert_eq!(inputs.users, ["bob", "alice"]);
        assert_eq!(inputs.user_datasets, ["b", "a"]);
    }

    #[test]
    fn test_load_fails_fast() {
        let dir = resources();
        write(dir.path(), "homes.json", r#"{"alice": "/home/alice"}"#);
        let err = Inputs::load(dir.path()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::Configuration(_))
        ));

        let dir = resources();
        fs::remove_file(dir.path().join("datasets.yaml")).unwrap();
        assert!(Inputs::load(dir.path()).is_err());

        let dir = resources();
        write(dir.path(), "username.txt", "carol");
        assert!(Inputs::load(dir.path()).is_err());
    }

    #[test]
    fn test_find_resources() {
        let root = tempfile::tempdir().unwrap();
        let nixos = root.path().join(NIXOS_DIR);
        fs::create_dir_all(&nixos).unwrap();
        let deep = root.path().join("a/b");
        fs::create_dir_all(&deep).unwrap();

        assert_eq!(find_resources(&nixos, Path::new(STAGING)).unwrap(), nixos);
        assert_eq!(find_resources(&deep, Path::new(STAGING)).unwrap(), nixos);
    }
}
