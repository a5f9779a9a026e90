use crate::{
    config::{Inputs, RunConfig, NIXOS_DIR},
    error::Error,
    system::{Nixos, Storage},
    update::{self, UpdateOptions},
};
use anyhow::Result;
use log::info;
use std::path::Path;
use structopt::StructOpt;

/// Options handed to nixos-install.
const INSTALL_OPTIONS: &[(&str, &str)] = &[("build-fallback", "true")];

#[derive(Debug, Default, StructOpt)]
#[structopt(rename_all = "kebab-case")]
pub(crate) struct InstallOpt {
    /// Copy, generate, replace and install.
    #[structopt(short, long)]
    pub(crate) all: bool,

    /// Regenerate datasets.nix and copy the configuration into place.
    #[structopt(short, long)]
    pub(crate) copy: bool,

    /// Generate the hardware configuration of the target.
    #[structopt(short, long)]
    pub(crate) generate: bool,

    /// Install the target system.
    #[structopt(short, long)]
    pub(crate) install: bool,

    /// Install the bootloader as well; needs --install or --all.
    #[structopt(short = "b", long)]
    pub(crate) install_bootloader: bool,

    /// Point the generated configuration at this host's configuration.
    #[structopt(short, long)]
    pub(crate) replace: bool,

    /// Map this device to / when regenerating datasets.nix.
    #[structopt(long)]
    pub(crate) root_device: Option<String>,

    /// Rebuild the running system instead, with this nixos-rebuild action.
    #[structopt(short = "R", long)]
    pub(crate) rebuild: Option<String>,

    /// Passed through to nixos-install or nixos-rebuild.
    pub(crate) program_arguments: Vec<String>,
}

impl InstallOpt {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.install_bootloader && !(self.install || self.all) {
            return Err(
                Error::conflict("--install-bootloader needs --install or --all").into(),
            );
        }
        Ok(())
    }
}

pub(crate) fn run(
    cfg: &RunConfig,
    opt: &InstallOpt,
    inputs: &Inputs,
    storage: &dyn Storage,
    nixos: &dyn Nixos,
) -> Result<()> {
    opt.validate()?;

    if let Some(action) = &opt.rebuild {
        if opt.copy {
            nixos.copy(&cfg.resources, &Path::new("/").join(NIXOS_DIR))?;
        }
        info!("rebuilding with {}", action);
        return nixos.rebuild(action, &opt.program_arguments);
    }

    let target = cfg.staged_nixos_dir();

    if opt.copy || opt.all {
        let opts = UpdateOptions {
            root_device: opt.root_device.clone(),
            ..UpdateOptions::default()
        };
        update::update(cfg, inputs, storage, &opts)?;
        info!("copying {} to {}", cfg.resources.display(), target.display());
        nixos.copy(&cfg.resources, &target)?;
    }

    if opt.generate || opt.all {
        nixos.generate_config(&cfg.staging)?;
    }

    if opt.replace || opt.all {
        let flake = format!(
            "(import ./.).nixosConfigurations.${{pkgs.stdenv.targetPlatform.system}}.mini-{}",
            cfg.host
        );
        nixos.replace(
            "./hardware-configuration.nix",
            &flake,
            &target.join("configuration.nix"),
        )?;
        nixos.replace(
            "device = \"\"",
            "device = \"!\"",
            &target.join("hardware-configuration.nix"),
        )?;
    }

    if opt.install || opt.all {
        info!("installing {}", cfg.host);
        nixos.install(
            &opt.program_arguments,
            opt.install_bootloader,
            INSTALL_OPTIONS,
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::ExecMode, dataset::DatasetTree, system::fake::Fake};

    fn inputs() -> Inputs {
        Inputs::new(
            DatasetTree::from_yaml("system:\n  datasets:\n    nix: {}\n", None).unwrap(),
            "alice".to_string(),
            vec!["alice".to_string()],
            vec![("alice".to_string(), "/home/alice".to_string())]
                .into_iter()
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_all() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = RunConfig::new("box", dir.path().to_path_buf(), ExecMode::Run);
        let fake = Fake::new();
        let opt = InstallOpt {
            all: true,
            install_bootloader: true,
            root_device: Some("/dev/sda2".to_string()),
            program_arguments: vec!["--no-root-passwd".to_string()],
            ..InstallOpt::default()
        };

        run(&cfg, &opt, &inputs(), &fake, &fake).unwrap();

        let ops: Vec<String> = fake
            .calls()
            .iter()
            .map(|c| c.split(' ').next().unwrap().to_string())
            .collect();
        assert_eq!(
            ops,
            ["copy", "generate-config", "replace", "replace", "install"]
        );
        assert_eq!(
            fake.calls()[4],
            "install --install-bootloader --option build-fallback true --no-root-passwd"
        );
        let text = std::fs::read_to_string(dir.path().join("datasets.nix")).unwrap();
        assert!(text.contains("\t\"/dev/sda2\" = \"/\";\n"));
    }

    #[test]
    fn test_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = RunConfig::new("box", dir.path().to_path_buf(), ExecMode::Run);
        let fake = Fake::new();
        let opt = InstallOpt::from_iter(&["install", "--rebuild", "switch", "--copy", "--", "--fast"]);

        run(&cfg, &opt, &inputs(), &fake, &fake).unwrap();
        assert_eq!(
            fake.calls(),
            vec![
                format!("copy {} /etc/nixos", dir.path().display()),
                "rebuild switch --fast".to_string(),
            ]
        );
    }

    #[test]
    fn test_bootloader_needs_install() {
        let opt = InstallOpt {
            install_bootloader: true,
            ..InstallOpt::default()
        };
        assert!(opt.validate().is_err());
    }
}
