//! A recording stand-in for the real system, used by the tests.

use super::{Mounter, Nixos, Storage};
use crate::error::Error;
use anyhow::Result;
use std::{
    cell::RefCell,
    collections::BTreeSet,
    path::{Path, PathBuf},
};

pub(crate) struct Fake {
    calls: RefCell<Vec<String>>,
    live: RefCell<BTreeSet<String>>,
    mounted: RefCell<BTreeSet<PathBuf>>,
    pool_size: String,
    fail_on: Option<String>,
}

impl Fake {
    pub(crate) fn new() -> Self {
        Self {
            calls: RefCell::new(vec![]),
            live: RefCell::new(BTreeSet::new()),
            mounted: RefCell::new(BTreeSet::new()),
            pool_size: "100G".to_string(),
            fail_on: None,
        }
    }

    /// Make every call of the given operation fail.
    pub(crate) fn fail_on(mut self, op: &str) -> Self {
        self.fail_on = Some(op.to_string());
        self
    }

    pub(crate) fn with_pool_size(mut self, size: &str) -> Self {
        self.pool_size = size.to_string();
        self
    }

    pub(crate) fn with_datasets(self, datasets: &[&str]) -> Self {
        self.live
            .borrow_mut()
            .extend(datasets.iter().map(|d| d.to_string()));
        self
    }

    pub(crate) fn with_mounted(self, path: &str) -> Self {
        self.mounted.borrow_mut().insert(PathBuf::from(path));
        self
    }

    /// Every mutating call so far, failed ones included.
    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    /// Number of calls of one operation.
    pub(crate) fn count(&self, op: &str) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|c| c.split(' ').next() == Some(op))
            .count()
    }

    fn check(&self, op: &str) -> Result<()> {
        if self.fail_on.as_deref() == Some(op) {
            return Err(Error::Command {
                command: op.to_string(),
                stderr: "injected failure".to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn record(&self, op: &str, call: String) -> Result<()> {
        self.calls.borrow_mut().push(call);
        self.check(op)
    }
}

fn with_options(mut call: String, flag: &str, options: &[String]) -> String {
    for o in options {
        call.push_str(&format!(" {} {}", flag, o));
    }
    call
}

impl Storage for Fake {
    fn datasets(&self) -> Result<BTreeSet<String>> {
        self.check("list")?;
        Ok(self.live.borrow().clone())
    }

    fn pool_size(&self, _pool: &str) -> Result<String> {
        self.check("size")?;
        Ok(self.pool_size.clone())
    }

    fn create_pool(
        &self,
        pool: &str,
        vdevs: &[String],
        pool_properties: &[String],
        dataset_properties: &[String],
    ) -> Result<()> {
        let call = format!("create-pool {} {}", pool, vdevs.join(" "));
        let call = with_options(call, "-o", pool_properties);
        self.record("create-pool", with_options(call, "-O", dataset_properties))?;
        self.live.borrow_mut().insert(pool.to_string());
        Ok(())
    }

    fn import_pool(&self, pool: &str) -> Result<()> {
        self.record("import", format!("import {}", pool))?;
        self.live.borrow_mut().insert(pool.to_string());
        Ok(())
    }

    fn export_pool(&self, pool: &str) -> Result<()> {
        self.record("export", format!("export {}", pool))
    }

    fn load_key(&self, dataset: &str) -> Result<()> {
        self.record("load-key", format!("load-key {}", dataset))
    }

    fn create(&self, dataset: &str, options: &[String]) -> Result<()> {
        let call = with_options(format!("create {}", dataset), "-o", options);
        self.record("create", call)?;
        self.live.borrow_mut().insert(dataset.to_string());
        Ok(())
    }

    fn clone_snapshot(&self, snapshot: &str, dataset: &str, options: &[String]) -> Result<()> {
        let call = with_options(format!("clone {} {}", snapshot, dataset), "-o", options);
        self.record("clone", call)?;
        self.live.borrow_mut().insert(dataset.to_string());
        Ok(())
    }

    fn create_volume(
        &self,
        dataset: &str,
        size: &str,
        block_size: &str,
        sparse: bool,
        options: &[String],
    ) -> Result<()> {
        let call = format!(
            "volume{} -V {} -b {} {}",
            if sparse { " -s" } else { "" },
            size,
            block_size,
            dataset
        );
        self.record("volume", with_options(call, "-o", options))?;
        self.live.borrow_mut().insert(dataset.to_string());
        Ok(())
    }

    fn snapshot(&self, snapshot: &str, recursive: bool) -> Result<()> {
        let flag = if recursive { "-r " } else { "" };
        self.record("snapshot", format!("snapshot {}{}", flag, snapshot))
    }

    fn hold(&self, tag: &str, snapshot: &str, recursive: bool) -> Result<()> {
        let flag = if recursive { "-r " } else { "" };
        self.record("hold", format!("hold {}{} {}", flag, tag, snapshot))
    }

    fn set(&self, dataset: &str, property: &str, value: &str) -> Result<()> {
        self.record("set", format!("set {}={} {}", property, value, dataset))
    }

    fn page_size(&self) -> Result<String> {
        self.check("getconf")?;
        Ok("4096\n".to_string())
    }

    fn mkswap(&self, device: &str) -> Result<()> {
        self.record("mkswap", format!("mkswap {}", device))
    }

    fn swapon(&self, device: &str) -> Result<()> {
        self.record("swapon", format!("swapon {}", device))
    }

    fn parted(&self, device: &str, script: &[String]) -> Result<()> {
        self.record("parted", format!("parted {} {}", device, script.join(" ")))
    }
}

impl Mounter for Fake {
    fn is_mountpoint(&self, path: &Path) -> Result<bool> {
        self.check("mountpoint")?;
        Ok(self.mounted.borrow().contains(path))
    }

    fn create_dir(&self, path: &Path) -> Result<()> {
        self.record("mkdir", format!("mkdir {}", path.display()))
    }

    fn mount(&self, source: &str, target: &Path, fstype: Option<&str>) -> Result<()> {
        let call = match fstype {
            Some(t) => format!("mount -t {} {} {}", t, source, target.display()),
            None => format!("mount {} {}", source, target.display()),
        };
        self.record("mount", call)?;
        self.mounted.borrow_mut().insert(target.to_path_buf());
        Ok(())
    }

    fn bind_mount(&self, source: &Path, target: &Path) -> Result<()> {
        self.record(
            "mount",
            format!("mount --bind {} {}", source.display(), target.display()),
        )?;
        self.mounted.borrow_mut().insert(target.to_path_buf());
        Ok(())
    }

    fn unmount_recursive(&self, target: &Path) -> Result<()> {
        self.record("umount", format!("umount -R {}", target.display()))?;
        self.mounted.borrow_mut().retain(|m| !m.starts_with(target));
        Ok(())
    }
}

impl Nixos for Fake {
    fn copy(&self, from: &Path, to: &Path) -> Result<()> {
        self.record("copy", format!("copy {} {}", from.display(), to.display()))
    }

    fn generate_config(&self, root: &Path) -> Result<()> {
        self.record("generate-config", format!("generate-config {}", root.display()))
    }

    fn replace(&self, from: &str, to: &str, file: &Path) -> Result<()> {
        self.record(
            "replace",
            format!("replace {:?} {:?} {}", from, to, file.display()),
        )
    }

    fn install(
        &self,
        args: &[String],
        install_bootloader: bool,
        options: &[(&str, &str)],
    ) -> Result<()> {
        let mut call = "install".to_string();
        if install_bootloader {
            call.push_str(" --install-bootloader");
        }
        for (k, v) in options {
            call.push_str(&format!(" --option {} {}", k, v));
        }
        for a in args {
            call.push_str(&format!(" {}", a));
        }
        self.record("install", call)
    }

    fn rebuild(&self, action: &str, args: &[String]) -> Result<()> {
        let mut call = format!("rebuild {}", action);
        for a in args {
            call.push_str(&format!(" {}", a));
        }
        self.record("rebuild", call)
    }
}
