// Configuration (C: ambient). CLI flags (clap) supply the required
// filesystem/network parameters; an optional TOML file at
// `<root>/aqua/ct-server.toml` layers in scheduler/quick-engine tuning knobs
// that are reasonable to default and rare to touch.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;

#[derive(Parser, Debug)]
#[command(author, version, about = "Continuous-testing orchestration server", long_about = None)]
pub struct Args {
    /// Root directory containing the checked-out repositories.
    #[arg(long, default_value = ".")]
    pub root: PathBuf,

    /// Number of local worker loops to run concurrently.
    #[arg(long, default_value_t = 4)]
    pub local_count: usize,

    /// Port for the main aquaserver HTTP API.
    #[arg(long, default_value_t = 45366)]
    pub port: u16,

    /// Port for the quickserver HTTP API.
    #[arg(long, default_value_t = 45367)]
    pub quick_port: u16,

    /// Serve tests directly out of `root` instead of maintaining separate
    /// snapshot directories. Implies a single, never-retired snapshot.
    #[arg(long, default_value_t = false)]
    pub use_root_dir: bool,

    /// Skip snapshot creation entirely (used for quick-engine-only runs).
    #[arg(long, default_value_t = false)]
    pub no_snapshot: bool,

    /// Path to the JSON checkpoint file. Defaults to `<root>/aqua/ct-server-state.json`.
    #[arg(long)]
    pub state_file: Option<PathBuf>,

    /// Optional TOML config overriding scheduler/quick-engine tuning.
    /// Defaults to `<root>/aqua/ct-server.toml` if present, otherwise built-in
    /// defaults are used.
    #[arg(long)]
    pub config_file: Option<PathBuf>,
}

/// Tuning knobs layered on top of the CLI flags. Every field is optional in
/// the TOML source and defaulted here, and unknown keys are rejected so that
/// a typo'd key fails loudly instead of silently doing nothing.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields, default)]
pub struct TuningConfig {
    pub retained_count: usize,
    pub retention_hours: u64,
    pub local_test_timeout_secs: u64,
    pub quick_cycle_end_wait_secs: u64,
    pub webhook_url: Option<String>,
    /// Base URL repos are cloned from, e.g. `https://github.com/my-org`; used
    /// to build `<origin_base>/<repo>.git` for `clone`/`ls-remote`. Staleness
    /// polling and cloning are skipped (logged, not fatal) when unset.
    pub origin_base: Option<String>,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            retained_count: 70,
            retention_hours: 7 * 24,
            local_test_timeout_secs: 600,
            quick_cycle_end_wait_secs: 20,
            webhook_url: None,
            origin_base: None,
        }
    }
}

/// The merged, fully-resolved configuration the rest of the server reads
/// from. Built once at startup by [`load`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub root: PathBuf,
    pub local_count: usize,
    pub port: u16,
    pub quick_port: u16,
    pub use_root_dir: bool,
    pub no_snapshot: bool,
    pub state_file: PathBuf,
    pub retained_count: usize,
    pub retention_hours: u64,
    pub local_test_timeout_secs: u64,
    pub quick_cycle_end_wait_secs: u64,
    pub webhook_url: Option<String>,
    pub origin_base: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let tuning = TuningConfig::default();
        Self {
            root: PathBuf::from("."),
            local_count: 4,
            port: 45366,
            quick_port: 45367,
            use_root_dir: false,
            no_snapshot: false,
            state_file: PathBuf::from("aqua/ct-server-state.json"),
            retained_count: tuning.retained_count,
            retention_hours: tuning.retention_hours,
            local_test_timeout_secs: tuning.local_test_timeout_secs,
            quick_cycle_end_wait_secs: tuning.quick_cycle_end_wait_secs,
            webhook_url: tuning.webhook_url,
            origin_base: tuning.origin_base,
        }
    }
}

/// Reads the optional TOML tuning file, falling back to defaults if it
/// doesn't exist. A file that exists but fails to parse is a hard error:
/// better to refuse to start than run with half-understood config.
fn load_tuning(path: &Path) -> anyhow::Result<TuningConfig> {
    if !path.exists() {
        return Ok(TuningConfig::default());
    }
    let content = fs::read_to_string(path).with_context(|| format!("reading config file {path:?}"))?;
    toml::from_str(&content).with_context(|| format!("parsing config file {path:?}"))
}

pub fn load(args: Args) -> anyhow::Result<ServerConfig> {
    let config_path = args
        .config_file
        .clone()
        .unwrap_or_else(|| args.root.join("aqua").join("ct-server.toml"));
    let tuning = load_tuning(&config_path)?;

    let state_file = args
        .state_file
        .unwrap_or_else(|| args.root.join("aqua").join("ct-server-state.json"));

    Ok(ServerConfig {
        root: args.root,
        local_count: args.local_count,
        port: args.port,
        quick_port: args.quick_port,
        use_root_dir: args.use_root_dir,
        no_snapshot: args.no_snapshot,
        state_file,
        retained_count: tuning.retained_count,
        retention_hours: tuning.retention_hours,
        local_test_timeout_secs: tuning.local_test_timeout_secs,
        quick_cycle_end_wait_secs: tuning.quick_cycle_end_wait_secs,
        webhook_url: tuning.webhook_url,
        origin_base: tuning.origin_base,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_tuning_file_falls_back_to_defaults() {
        let tmp = TempDir::new().unwrap();
        let tuning = load_tuning(&tmp.path().join("nope.toml")).unwrap();
        assert_eq!(tuning.retained_count, 70);
    }

    #[test]
    fn tuning_file_overrides_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ct-server.toml");
        fs::write(&path, "retained_count = 10\nwebhook_url = \"https://example.invalid/hook\"\n").unwrap();
        let tuning = load_tuning(&path).unwrap();
        assert_eq!(tuning.retained_count, 10);
        assert_eq!(tuning.webhook_url.as_deref(), Some("https://example.invalid/hook"));
    }

    #[test]
    fn unknown_tuning_key_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ct-server.toml");
        fs::write(&path, "bogus_key = 1\n").unwrap();
        assert!(load_tuning(&path).is_err());
    }

    #[test]
    fn load_defaults_state_file_under_root_aqua_dir() {
        let args = Args {
            root: PathBuf::from("/srv/codebase"),
            local_count: 4,
            port: 45366,
            quick_port: 45367,
            use_root_dir: false,
            no_snapshot: false,
            state_file: None,
            config_file: Some(PathBuf::from("/does/not/exist.toml")),
        };
        let config = load(args).unwrap();
        assert_eq!(config.state_file, PathBuf::from("/srv/codebase/aqua/ct-server-state.json"));
    }
}
