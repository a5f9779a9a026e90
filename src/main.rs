use anyhow::{format_err, Context, Result};
use dialoguer::Input;
use log::{debug, info};
use simplelog::{
    ColorChoice, CombinedLogger, Config, LevelFilter, TermLogger, TerminalMode, WriteLogger,
};
use std::{
    env, fs,
    path::{Path, PathBuf},
    process,
};
use structopt::StructOpt;

mod config;
mod create;
mod dataset;
mod device;
mod error;
mod install;
mod mount;
mod pool;
mod size;
mod synth;
mod system;
mod update;

use config::{ExecMode, Inputs, RunConfig, STAGING};
use create::CreateOpt;
use install::InstallOpt;
use mount::{MountOpt, MountOptions};
use pool::PoolGuard;
use system::Host;
use update::{UpdateOpt, UpdateOptions};

#[derive(Debug, StructOpt)]
#[structopt(setting = structopt::clap::AppSettings::ColoredHelp)]
#[structopt(rename_all = "kebab-case")]
struct Opt {
    /// Hostname of the target system; the pool carries the same name.
    #[structopt(short = "H", long)]
    host: String,

    /// Directory holding datasets.yaml and the user files. Defaults to the nearest
    /// etc/nixos.
    #[structopt(short, long)]
    resources_dir: Option<PathBuf>,

    /// Print the commands that would change something instead of running them.
    #[structopt(short, long)]
    print: bool,

    /// Print the commands that change something, then run them.
    #[structopt(short = "P", long, conflicts_with = "print")]
    print_run: bool,

    /// Log at debug level.
    #[structopt(short, long)]
    inspect: bool,

    #[structopt(subcommand)]
    cmd: Command,
}

impl Opt {
    fn mode(&self) -> ExecMode {
        if self.print {
            ExecMode::Print
        } else if self.print_run {
            ExecMode::PrintRun
        } else {
            ExecMode::Run
        }
    }
}

#[derive(Debug, StructOpt)]
#[structopt(rename_all = "kebab-case")]
enum Command {
    /// Create the pool and its datasets.
    Create(CreateOpt),
    /// Mount the host's datasets under the staging root.
    Mount(MountOpt),
    /// Regenerate datasets.nix, optionally creating new datasets.
    Update(UpdateOpt),
    /// Copy the configuration and install or rebuild the system.
    Install(InstallOpt),
}

fn main() -> Result<()> {
    // Parse the arguments.
    let opt = Opt::from_args();

    let level = if opt.inspect {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    // Log to terminal and disk, for debugging later.
    CombinedLogger::init(vec![
        WriteLogger::new(
            LevelFilter::Debug,
            Config::default(),
            fs::File::create("strapper.log")?,
        ),
        TermLogger::new(
            level,
            Config::default(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ),
    ])
    .context("setting up logging")?;
    debug!("{:?}", opt);

    // Everything below talks to zpool, mount and friends.
    if !running_as_root() {
        return Err(format_err!("strapper must be run as root"));
    }

    let mode = opt.mode();
    let resources = match &opt.resources_dir {
        Some(dir) => dir.clone(),
        None => config::find_resources(&env::current_dir()?, Path::new(STAGING))?,
    };
    debug!("resources: {}", resources.display());

    // Fail on bad inputs before anything is touched.
    let inputs = Inputs::load(&resources)?;
    let cfg = RunConfig::new(opt.host, resources, mode);
    let host = Host::new(cfg.mode);

    match opt.cmd {
        Command::Create(c) => {
            if create::run(&cfg, &c, &inputs, &host, &host, input)? {
                info!("pool {} is ready", cfg.host);
            }
        }
        Command::Mount(m) => {
            m.validate()?;
            let files = UpdateOptions {
                encrypted: m.encrypted,
                deduplicated: m.deduplicated,
                root_device: m.root_device.clone(),
                ..UpdateOptions::default()
            };
            update::update(&cfg, &inputs, &host, &files)?;
            mount::mount(
                &cfg.host,
                &cfg.staging,
                &MountOptions::from(&m),
                &host,
                &host,
            )?;

            if m.install || m.install_bootloader {
                let opt = InstallOpt {
                    all: true,
                    install_bootloader: m.install_bootloader,
                    root_device: m.root_device.clone(),
                    ..InstallOpt::default()
                };
                install::run(&cfg, &opt, &inputs, &host, &host)?;
            }
        }
        Command::Update(u) => {
            let opts = UpdateOptions::from(&u);
            let _guard = if opts.pool {
                Some(PoolGuard::new(&host, cfg.host.as_str()))
            } else {
                None
            };
            update::update(&cfg, &inputs, &host, &opts)?;
        }
        Command::Install(i) => install::run(&cfg, &i, &inputs, &host, &host)?,
    }

    Ok(())
}

fn running_as_root() -> bool {
    // SAFETY: geteuid takes no arguments and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

fn input(title: &str) -> Result<String> {
    Ok(Input::<String>::new()
        .with_prompt(title)
        .allow_empty(true)
        .interact()?)
}

fn exec(cmd: &[&str]) -> Result<process::Output> {
    debug!("exec: running: {:?}", cmd);

    let (cmd, args) = match cmd {
        [cmd, args @ ..] => (cmd, args),
        _ => return Err(format_err!("missing command".to_string())),
    };

    Ok(process::Command::new(cmd)
        .args(args)
        .output()
        .with_context(|| format!("{:?} {:?}", cmd, args))?)
}
