//! Load config from file, environment and command line.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/taichi/config.toml or /etc/taichi/config.toml.
/// Env overrides: TAICHI_NAME, TAICHI_BEACON_PORT, TAICHI_MAILBOX_PORT, TAICHI_INBOX.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Name announced in HELLO (default: host name).
    pub name: String,
    /// Discovery UDP port (default 5670).
    pub beacon_port: u16,
    /// Mailbox TCP port (default 49152).
    pub mailbox_port: u16,
    pub beacon_interval_ms: u64,
    pub evasive_timeout_ms: u64,
    pub expired_timeout_ms: u64,
    /// Port publishers serve files on; paired with the peer's address.
    pub file_service_port: u16,
    pub connect_timeout_ms: u64,
    /// Root under which each publisher gets its own directory.
    pub inbox: PathBuf,
    pub groups: Vec<String>,
    /// Groups this node is willing to lead.
    pub contest: Vec<String>,
    pub headers: BTreeMap<String, String>,
    /// Advertise a file service on every joined group.
    pub publish: bool,
    /// Subscribe to every advertised file service.
    pub auto_receive: bool,
}

fn default_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "taichi".to_string())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: default_name(),
            beacon_port: 5670,
            mailbox_port: 49152,
            beacon_interval_ms: 1000,
            evasive_timeout_ms: 5000,
            expired_timeout_ms: 30000,
            file_service_port: 5670,
            connect_timeout_ms: 1000,
            inbox: PathBuf::from("./clfmq"),
            groups: vec!["CHAT".to_string()],
            contest: Vec::new(),
            headers: BTreeMap::new(),
            publish: false,
            auto_receive: true,
        }
    }
}

impl Config {
    pub fn beacon_interval(&self) -> Duration {
        Duration::from_millis(self.beacon_interval_ms)
    }

    pub fn evasive_timeout(&self) -> Duration {
        Duration::from_millis(self.evasive_timeout_ms)
    }

    pub fn expired_timeout(&self) -> Duration {
        Duration::from_millis(self.expired_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Reject values the daemon cannot run with. A zero mailbox port would be
    /// announced in beacons, where port 0 means departure.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.beacon_port != 0, "beacon_port must not be 0");
        anyhow::ensure!(self.mailbox_port != 0, "mailbox_port must not be 0");
        anyhow::ensure!(self.file_service_port != 0, "file_service_port must not be 0");
        for (key, ms) in [
            ("beacon_interval_ms", self.beacon_interval_ms),
            ("evasive_timeout_ms", self.evasive_timeout_ms),
            ("expired_timeout_ms", self.expired_timeout_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
        ] {
            anyhow::ensure!(ms > 0, "{key} must be greater than 0");
        }
        Ok(())
    }
}

/// Command-line values that win over file and environment.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub name: Option<String>,
    pub beacon_port: Option<u16>,
    pub mailbox_port: Option<u16>,
    pub inbox: Option<PathBuf>,
    pub groups: Vec<String>,
    pub contest: Vec<String>,
    pub publish: bool,
    pub no_receive: bool,
}

/// Load config: merge default, then config file (if present), then env vars,
/// then command line. The merged result must pass [`Config::validate`].
pub fn load(path: Option<&Path>, overrides: &Overrides) -> anyhow::Result<Config> {
    let mut c = match path {
        Some(p) => read_file(p)?,
        None => load_file().unwrap_or_default(),
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    apply_overrides(&mut c, overrides);
    c.validate()?;
    Ok(c)
}

pub fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("TAICHI_NAME").filter(|s| !s.is_empty()) {
        c.name = s;
    }
    if let Some(p) = var("TAICHI_BEACON_PORT").and_then(|s| s.parse().ok()) {
        c.beacon_port = p;
    }
    if let Some(p) = var("TAICHI_MAILBOX_PORT").and_then(|s| s.parse().ok()) {
        c.mailbox_port = p;
    }
    if let Some(s) = var("TAICHI_INBOX").filter(|s| !s.is_empty()) {
        c.inbox = PathBuf::from(s);
    }
}

pub fn apply_overrides(c: &mut Config, o: &Overrides) {
    if let Some(name) = &o.name {
        c.name = name.clone();
    }
    if let Some(p) = o.beacon_port {
        c.beacon_port = p;
    }
    if let Some(p) = o.mailbox_port {
        c.mailbox_port = p;
    }
    if let Some(inbox) = &o.inbox {
        c.inbox = inbox.clone();
    }
    if !o.groups.is_empty() {
        c.groups = o.groups.clone();
    }
    if !o.contest.is_empty() {
        c.contest = o.contest.clone();
    }
    if o.publish {
        c.publish = true;
    }
    if o.no_receive {
        c.auto_receive = false;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/taichi/config.toml"));
    }
    out.push(PathBuf::from("/etc/taichi/config.toml"));
    out
}

fn read_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing {}", path.display()))
}

/// First existing default location wins; a broken file falls back to defaults.
fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    match read_file(&path) {
        Ok(c) => Some(c),
        Err(e) => {
            tracing::warn!(error = %format!("{e:#}"), "ignoring config file");
            None
        }
    }
}
