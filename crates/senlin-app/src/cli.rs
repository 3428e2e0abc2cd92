//! CLI argument definitions for the Senlin binary.
//!
//! Priority resolution: CLI args > env vars > config file > defaults.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use uuid::Uuid;

use senlin_core::types::{ActionStatus, StartTime, TargetKind, Verb};

/// Senlin: action lifecycle and dependency scheduling engine.
#[derive(Parser, Debug)]
#[command(name = "senlin", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Data directory holding the action database.
    #[arg(short = 'd', long = "data-dir", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level", global = true)]
    pub log_level: Option<String>,

    /// Number of actions executed concurrently.
    #[arg(short = 'w', long = "workers", global = true)]
    pub workers: Option<usize>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Record a new action.
    Submit(SubmitArgs),

    /// List actions, oldest first.
    List {
        /// Only actions in this status.
        #[arg(long)]
        status: Option<ActionStatus>,
        /// Only actions against this target.
        #[arg(long)]
        target: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Print one action record as JSON.
    Show { id: Uuid },

    /// Cancel an action and its dependents.
    Cancel { id: Uuid },

    /// Run the scheduler until interrupted.
    Run {
        /// Handle every action with a pass-through operation.
        #[arg(long)]
        simulate: bool,
    },

    /// Write the effective configuration, global flags applied, to the
    /// config file.
    Init {
        /// Replace an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args, Debug)]
pub struct SubmitArgs {
    /// cluster, node or policy.
    pub kind: TargetKind,

    /// Identifier of the entity acted on.
    pub target: String,

    /// Operation, e.g. CREATE or ADD_NODE.
    pub verb: Verb,

    /// Operation input as key=value; the value is read as JSON when it parses.
    #[arg(short = 'i', long = "input", value_parser = parse_input)]
    pub inputs: Vec<(String, serde_json::Value)>,

    /// Action that must succeed first. Repeatable.
    #[arg(long = "depends-on")]
    pub depends_on: Vec<Uuid>,

    /// Action that triggered this one.
    #[arg(long = "cause")]
    pub cause: Option<Uuid>,

    /// RFC 3339 timestamp, "AFTER: <id>" or "WHEN: <id> <STATUS>".
    #[arg(long = "start")]
    pub start: Option<StartTime>,

    /// Cancel the action if it has not started by this time.
    #[arg(long = "end")]
    pub end: Option<DateTime<Utc>>,

    /// Repeat every N seconds after each success.
    #[arg(long = "interval")]
    pub interval: Option<i64>,

    /// Ownership timeout in seconds.
    #[arg(long = "timeout")]
    pub timeout: Option<u64>,

    #[arg(long = "description")]
    pub description: Option<String>,
}

fn parse_input(s: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", s))?;
    if key.is_empty() {
        return Err(format!("empty key in '{}'", s));
    }
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

impl CliArgs {
    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > SENLIN_CONFIG env var > ~/.senlin/config.toml.
    pub fn resolve_config_path(&self) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Ok(p) = std::env::var("SENLIN_CONFIG") {
            return PathBuf::from(p);
        }
        default_config_path()
    }

    /// Resolve the data directory path.
    ///
    /// Returns `None` if not overridden (use config value).
    pub fn resolve_data_dir(&self) -> Option<String> {
        self.data_dir
            .as_ref()
            .map(|p| p.to_string_lossy().to_string())
    }

    /// Resolve the log level. Returns `None` if not overridden.
    pub fn resolve_log_level(&self) -> Option<String> {
        self.log_level.clone()
    }

    /// Resolve the worker count. Zero is treated as not set.
    pub fn resolve_workers(&self) -> Option<usize> {
        self.workers.filter(|w| *w > 0)
    }
}

/// Default config file path for the current platform.
fn default_config_path() -> PathBuf {
    match home_dir() {
        Some(home) => home.join(".senlin").join("config.toml"),
        None => PathBuf::from("config.toml"),
    }
}

pub fn home_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    let home = std::env::var("USERPROFILE");
    #[cfg(not(target_os = "windows"))]
    let home = std::env::var("HOME");
    home.ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_submit() {
        let dep = Uuid::new_v4();
        let args = CliArgs::try_parse_from([
            "senlin",
            "submit",
            "cluster",
            "cluster-a",
            "ADD_NODE",
            "--input",
            "count=2",
            "-i",
            "name=web",
            "--depends-on",
            &dep.to_string(),
            "--timeout",
            "120",
            "--cause",
            &dep.to_string(),
        ])
        .unwrap();

        let Command::Submit(submit) = args.command else {
            panic!("expected submit");
        };
        assert_eq!(submit.kind, TargetKind::Cluster);
        assert_eq!(submit.verb, Verb::AddNode);
        assert_eq!(
            submit.inputs,
            vec![
                ("count".to_string(), json!(2)),
                ("name".to_string(), json!("web")),
            ]
        );
        assert_eq!(submit.depends_on, vec![dep]);
        assert_eq!(submit.timeout, Some(120));
        assert_eq!(submit.cause, Some(dep));
        assert!(submit.start.is_none());
    }

    #[test]
    fn test_parse_start_predicate() {
        let reference = Uuid::new_v4();
        let start = format!("WHEN: {} SUCCEEDED", reference);
        let args = CliArgs::try_parse_from([
            "senlin", "submit", "node", "node-1", "JOIN", "--start", &start,
        ])
        .unwrap();
        let Command::Submit(submit) = args.command else {
            panic!("expected submit");
        };
        assert_eq!(
            submit.start,
            Some(StartTime::When(reference, ActionStatus::Succeeded))
        );
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        let result = CliArgs::try_parse_from([
            "senlin", "submit", "node", "node-1", "JOIN", "--input", "novalue",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args =
            CliArgs::try_parse_from(["senlin", "run", "--simulate", "--workers", "8"]).unwrap();
        assert!(matches!(args.command, Command::Run { simulate: true }));
        assert_eq!(args.resolve_workers(), Some(8));
        assert!(args.resolve_log_level().is_none());
    }

    #[test]
    fn test_parse_list_filters() {
        let args = CliArgs::try_parse_from(["senlin", "list", "--status", "ready"]).unwrap();
        match args.command {
            Command::List { status, limit, .. } => {
                assert_eq!(status, Some(ActionStatus::Ready));
                assert_eq!(limit, 50);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_init() {
        let args = CliArgs::try_parse_from(["senlin", "init", "--force", "-w", "2"]).unwrap();
        assert!(matches!(args.command, Command::Init { force: true }));
        assert_eq!(args.resolve_workers(), Some(2));
    }

    #[test]
    fn test_explicit_config_path_wins() {
        let args =
            CliArgs::try_parse_from(["senlin", "--config", "/etc/senlin.toml", "run"]).unwrap();
        assert_eq!(args.resolve_config_path(), PathBuf::from("/etc/senlin.toml"));
    }
}
