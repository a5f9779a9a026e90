use super::{Mounter, Nixos, Storage};
use crate::{config::ExecMode, error::Error, exec};
use anyhow::{Context, Result};
use cmd_lib::run_fun;
use log::{debug, info};
use std::{collections::BTreeSet, fs, path::Path};

/// The machine we are running on.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Host {
    mode: ExecMode,
}

impl Host {
    pub(crate) fn new(mode: ExecMode) -> Self {
        Self { mode }
    }

    /// Run a command that changes something; in print mode it is only logged.
    fn run<S: AsRef<str>>(&self, cmd: &[S]) -> Result<String> {
        let line = cmd.iter().map(AsRef::as_ref).collect::<Vec<_>>().join(" ");
        match self.mode {
            ExecMode::Print => {
                info!("{}", line);
                return Ok(String::new());
            }
            ExecMode::PrintRun => info!("{}", line),
            ExecMode::Run => {}
        }

        self.query(cmd)
    }

    /// Run a command that only reads state. These run in every mode.
    fn query<S: AsRef<str>>(&self, cmd: &[S]) -> Result<String> {
        let cmd: Vec<&str> = cmd.iter().map(AsRef::as_ref).collect();
        let out = exec(&cmd)?;

        if !out.status.success() {
            return Err(Error::Command {
                command: cmd.join(" "),
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            }
            .into());
        }

        Ok(String::from_utf8(out.stdout)?)
    }
}

fn options(flag: &str, opts: &[String]) -> Vec<String> {
    opts.iter()
        .flat_map(|o| vec![flag.to_string(), o.clone()])
        .collect()
}

fn strings(a: &[&str]) -> Vec<String> {
    a.iter().map(|s| s.to_string()).collect()
}

impl Storage for Host {
    fn datasets(&self) -> Result<BTreeSet<String>> {
        let out = self.query(&["zfs", "list", "-rHo", "name"])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn pool_size(&self, pool: &str) -> Result<String> {
        Ok(self
            .query(&["zpool", "get", "-H", "-o", "value", "size", pool])?
            .trim()
            .to_string())
    }

    fn create_pool(
        &self,
        pool: &str,
        vdevs: &[String],
        pool_properties: &[String],
        dataset_properties: &[String],
    ) -> Result<()> {
        let mut cmd = strings(&["zpool", "create", "-f"]);
        cmd.extend(options("-o", pool_properties));
        cmd.extend(options("-O", dataset_properties));
        cmd.push(pool.to_string());
        // A raid layout arrives as "mirror /dev/a /dev/b" in one piece.
        cmd.extend(vdevs.iter().flat_map(|v| v.split_whitespace().map(str::to_string)));
        self.run(&cmd).map(drop)
    }

    fn import_pool(&self, pool: &str) -> Result<()> {
        self.run(&["zpool", "import", "-f", pool]).map(drop)
    }

    fn export_pool(&self, pool: &str) -> Result<()> {
        self.run(&["zpool", "export", "-f", pool]).map(drop)
    }

    fn load_key(&self, dataset: &str) -> Result<()> {
        self.run(&["zfs", "load-key", dataset]).map(drop)
    }

    fn create(&self, dataset: &str, opts: &[String]) -> Result<()> {
        let mut cmd = strings(&["zfs", "create"]);
        cmd.extend(options("-o", opts));
        cmd.push(dataset.to_string());
        self.run(&cmd).map(drop)
    }

    fn clone_snapshot(&self, snapshot: &str, dataset: &str, opts: &[String]) -> Result<()> {
        let mut cmd = strings(&["zfs", "clone"]);
        cmd.extend(options("-o", opts));
        cmd.push(snapshot.to_string());
        cmd.push(dataset.to_string());
        self.run(&cmd).map(drop)
    }

    fn create_volume(
        &self,
        dataset: &str,
        size: &str,
        block_size: &str,
        sparse: bool,
        opts: &[String],
    ) -> Result<()> {
        let mut cmd = strings(&["zfs", "create"]);
        if sparse {
            cmd.push("-s".to_string());
        }
        cmd.extend(strings(&["-V", size, "-b", block_size]));
        cmd.extend(options("-o", opts));
        cmd.push(dataset.to_string());
        self.run(&cmd).map(drop)
    }

    fn snapshot(&self, snapshot: &str, recursive: bool) -> Result<()> {
        if recursive {
            self.run(&["zfs", "snapshot", "-r", snapshot])
        } else {
            self.run(&["zfs", "snapshot", snapshot])
        }
        .map(drop)
    }

    fn hold(&self, tag: &str, snapshot: &str, recursive: bool) -> Result<()> {
        if recursive {
            self.run(&["zfs", "hold", "-r", tag, snapshot])
        } else {
            self.run(&["zfs", "hold", tag, snapshot])
        }
        .map(drop)
    }

    fn set(&self, dataset: &str, property: &str, value: &str) -> Result<()> {
        let assignment = format!("{}={}", property, value);
        self.run(&["zfs", "set", assignment.as_str(), dataset])
            .map(drop)
    }

    fn page_size(&self) -> Result<String> {
        Ok(run_fun!(getconf PAGESIZE).context("reading the page size")?)
    }

    fn mkswap(&self, device: &str) -> Result<()> {
        self.run(&["mkswap", device]).map(drop)
    }

    fn swapon(&self, device: &str) -> Result<()> {
        self.run(&["swapon", device]).map(drop)
    }

    fn parted(&self, device: &str, script: &[String]) -> Result<()> {
        let mut cmd = strings(&["parted", "-s", "-a", "optimal", "--", device]);
        cmd.extend(script.iter().cloned());
        self.run(&cmd).map(drop)
    }
}

impl Mounter for Host {
    fn is_mountpoint(&self, path: &Path) -> Result<bool> {
        if !path.exists() {
            return Ok(false);
        }

        let path = path.display().to_string();
        Ok(exec(&["mountpoint", "-q", path.as_str()])?.status.success())
    }

    fn create_dir(&self, path: &Path) -> Result<()> {
        if self.mode != ExecMode::Run {
            info!("mkdir -p {}", path.display());
            if self.mode == ExecMode::Print {
                return Ok(());
            }
        }

        debug!("creating {}", path.display());
        fs::create_dir_all(path).with_context(|| format!("creating {}", path.display()))
    }

    fn mount(&self, source: &str, target: &Path, fstype: Option<&str>) -> Result<()> {
        let target = target.display().to_string();
        match fstype {
            Some(t) => self.run(&["mount", "-t", t, source, target.as_str()]),
            None => self.run(&["mount", source, target.as_str()]),
        }
        .map(drop)
    }

    fn bind_mount(&self, source: &Path, target: &Path) -> Result<()> {
        let source = source.display().to_string();
        let target = target.display().to_string();
        self.run(&["mount", "--bind", source.as_str(), target.as_str()]).map(drop)
    }

    fn unmount_recursive(&self, target: &Path) -> Result<()> {
        let target = target.display().to_string();
        self.run(&["umount", "-R", target.as_str()]).map(drop)
    }
}

impl Nixos for Host {
    fn copy(&self, from: &Path, to: &Path) -> Result<()> {
        let from = format!("{}/", from.display());
        let to = format!("{}/", to.display());
        self.run(&["rsync", "-avvczz", from.as_str(), to.as_str()]).map(drop)
    }

    fn generate_config(&self, root: &Path) -> Result<()> {
        let root = root.display().to_string();
        self.run(&["nixos-generate-config", "--root", root.as_str()]).map(drop)
    }

    fn replace(&self, from: &str, to: &str, file: &Path) -> Result<()> {
        let file = file.display().to_string();
        self.run(&["sd", "--fixed-strings", from, to, file.as_str()]).map(drop)
    }

    fn install(
        &self,
        args: &[String],
        install_bootloader: bool,
        opts: &[(&str, &str)],
    ) -> Result<()> {
        let mut cmd = strings(&["nixos-install", "--show-trace"]);
        if install_bootloader {
            cmd.push("--install-bootloader".to_string());
        }
        for (k, v) in opts {
            cmd.extend(strings(&["--option", *k, *v]));
        }
        cmd.extend(args.iter().cloned());
        self.run(&cmd).map(drop)
    }

    fn rebuild(&self, action: &str, args: &[String]) -> Result<()> {
        let mut cmd = strings(&["nixos-rebuild", action, "--show-trace"]);
        cmd.extend(args.iter().cloned());
        self.run(&cmd).map(drop)
    }
}
