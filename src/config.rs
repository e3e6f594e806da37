use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::Deserialize;
use tracing::{debug, info, info_span};

use crate::error::{Error, Result};

const fn default_frontend_port() -> u16 {
    8880
}
const fn default_verdict_port() -> u16 {
    9002
}
fn default_replica_ports() -> Vec<u16> {
    vec![8881, 8882, 8883, 8884]
}
fn default_sandbox() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8099)
}
fn default_collector() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9003)
}
const fn default_max_msg() -> usize {
    100_000
}
const fn default_report_quota() -> u64 {
    1000
}
fn default_replica_exe() -> String {
    "node".to_string()
}
fn default_replica_args() -> Vec<String> {
    vec!["app.js".to_string()]
}

/// Settings as loaded from an optional YAML file, in the shape of the
/// teacher's `riverdb.yaml`: every field has a sane default so the file may
/// be partial or absent entirely.
#[derive(Debug, Deserialize)]
pub struct Settings {
    #[serde(default = "default_frontend_port")]
    pub frontend_port: u16,
    #[serde(default = "default_verdict_port")]
    pub verdict_port: u16,
    #[serde(default = "default_replica_ports")]
    pub replica_ports: Vec<u16>,
    #[serde(default = "default_sandbox")]
    pub sandbox: SocketAddr,
    #[serde(default = "default_collector")]
    pub collector: SocketAddr,
    #[serde(default = "default_max_msg")]
    pub max_msg: usize,
    #[serde(default = "default_report_quota")]
    pub report_quota: u64,
    #[serde(default = "default_replica_exe")]
    pub replica_exe: String,
    #[serde(default = "default_replica_args")]
    pub replica_args: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            frontend_port: default_frontend_port(),
            verdict_port: default_verdict_port(),
            replica_ports: default_replica_ports(),
            sandbox: default_sandbox(),
            collector: default_collector(),
            max_msg: default_max_msg(),
            report_quota: default_report_quota(),
            replica_exe: default_replica_exe(),
            replica_args: default_replica_args(),
        }
    }
}

/// CLI surface (§6): flags override whatever the config file set.
#[derive(Parser, Debug)]
#[command(version, about = "HTTP reverse proxy with an adaptive quarantine data-plane")]
pub struct Args {
    /// Path to a YAML config file. Searched for in the current directory
    /// and its parents if not given.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub frontend_port: Option<u16>,

    #[arg(long)]
    pub verdict_port: Option<u16>,

    /// Comma-separated list of trusted replica ports.
    #[arg(long, value_delimiter = ',')]
    pub replica_ports: Option<Vec<u16>>,

    #[arg(long)]
    pub sandbox: Option<SocketAddr>,

    #[arg(long)]
    pub collector: Option<SocketAddr>,

    #[arg(long)]
    pub max_msg: Option<usize>,

    #[arg(long)]
    pub report_quota: Option<u64>,

    #[arg(long)]
    pub replica_exe: Option<String>,

    /// Space-separated argv passed to each spawned replica.
    #[arg(long, value_delimiter = ' ')]
    pub replica_args: Option<Vec<String>>,
}

impl Settings {
    fn merge_args(mut self, args: &Args) -> Self {
        if let Some(v) = args.frontend_port {
            self.frontend_port = v;
        }
        if let Some(v) = args.verdict_port {
            self.verdict_port = v;
        }
        if let Some(v) = args.replica_ports.clone() {
            self.replica_ports = v;
        }
        if let Some(v) = args.sandbox {
            self.sandbox = v;
        }
        if let Some(v) = args.collector {
            self.collector = v;
        }
        if let Some(v) = args.max_msg {
            self.max_msg = v;
        }
        if let Some(v) = args.report_quota {
            self.report_quota = v;
        }
        if let Some(v) = args.replica_exe.clone() {
            self.replica_exe = v;
        }
        if let Some(v) = args.replica_args.clone() {
            self.replica_args = v;
        }
        self
    }

    fn validate(&self) -> Result<()> {
        if self.replica_ports.is_empty() {
            return Err(Error::config("replica_ports must not be empty"));
        }
        if self.max_msg == 0 {
            return Err(Error::config("max_msg must be > 0"));
        }
        Ok(())
    }
}

/// Load settings: start from defaults, overlay a YAML file if one is found
/// (explicit `--config` or search upward from the current directory, in the
/// teacher's `find_config_file` style), then overlay CLI flags.
pub fn load(args: &Args) -> Result<Settings> {
    let _span = info_span!("loading config").entered();

    let settings = match locate_config_file(args.config.as_deref()) {
        Some(path) => {
            info!(path = %path.display(), "found config file");
            let raw = std::fs::read_to_string(&path)?;
            serde_yaml::from_str(&raw)?
        }
        None => {
            debug!("no config file found, using defaults");
            Settings::default()
        }
    };

    let settings = settings.merge_args(args);
    settings.validate()?;
    Ok(settings)
}

fn locate_config_file(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(p) = explicit {
        return p.exists().then(|| p.to_path_buf());
    }

    let mut dir = env::current_dir().ok()?;
    loop {
        let candidate = dir.join("quarantine-proxy.yaml");
        if candidate.exists() {
            return Some(candidate);
        }
        if !dir.pop() {
            return None;
        }
    }
}
