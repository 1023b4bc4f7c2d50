//! CLI flags. Flag parsing is external collaborator territory per the
//! spec's Non-goals, but the crate still needs a real `clap::Parser` surface
//! to drive the two run modes: configured (`--config`) and ad-hoc
//! (`--listener`/`--target`/`--metrics`).

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "l4-mtls-proxy", version, about = "L4 reverse proxy with transport security")]
pub struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "config.yaml")]
    pub config: PathBuf,

    /// Ad-hoc one-server mode: local listener address (host:port).
    #[arg(long, conflicts_with = "config", requires = "target")]
    pub listener: Option<String>,

    /// Ad-hoc one-server mode: comma-separated target addresses.
    #[arg(long)]
    pub target: Option<String>,

    /// Ad-hoc one-server mode: metrics endpoint address (host:port).
    #[arg(long)]
    pub metrics: Option<String>,

    /// Raise log verbosity to debug.
    #[arg(long)]
    pub debug: bool,
}

impl Cli {
    pub fn is_ad_hoc(&self) -> bool {
        self.listener.is_some()
    }
}
