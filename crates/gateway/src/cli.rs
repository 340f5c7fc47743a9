//! Command-line interface for the `mcpv` binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::catalog::CatalogProvider;
use mcpv_domain::config::ConfigSeverity;

/// Exit codes shared with the wrapper scripts.
pub mod exit_codes {
    pub const OK: i32 = 0;
    pub const ERROR: i32 = 1;
    pub const NOT_RUNNING: i32 = 3;
    pub const NOT_INSTALLED: i32 = 4;
}

#[derive(Parser)]
#[command(name = "mcpv", about = "Local control plane for MCP servers")]
pub struct Cli {
    /// Path to the gateway config file.
    #[arg(long, global = true, default_value = "mcpv.yaml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the gateway (default).
    Serve,
    /// Config inspection.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print the version.
    Version,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Validate the config file and report issues.
    Validate,
    /// Print the normalized config.
    Show,
}

/// `mcpv config validate`: print every issue, return success iff none
/// are errors.
pub fn validate(path: &PathBuf) -> bool {
    match CatalogProvider::validate_file(path) {
        Ok((_config, issues)) => {
            for issue in &issues {
                println!("{issue}");
            }
            let errors = issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count();
            if errors == 0 {
                println!("config OK ({} warning(s))", issues.len());
                true
            } else {
                println!("config INVALID ({errors} error(s))");
                false
            }
        }
        Err(e) => {
            println!("config INVALID: {e}");
            false
        }
    }
}

/// `mcpv config show`: dump the normalized config as YAML.
pub fn show(path: &PathBuf) -> bool {
    match CatalogProvider::validate_file(path) {
        Ok((config, _issues)) => {
            match serde_yaml::to_string(&config) {
                Ok(rendered) => {
                    println!("{rendered}");
                    true
                }
                Err(e) => {
                    eprintln!("failed to render config: {e}");
                    false
                }
            }
        }
        Err(e) => {
            eprintln!("failed to load config: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn config_file(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcpv.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn validate_accepts_good_config() {
        let (_dir, path) = config_file("servers:\n  - name: a\n    cmd: echo\n");
        assert!(validate(&path));
    }

    #[test]
    fn validate_rejects_bad_config() {
        let (_dir, path) = config_file("servers:\n  - name: a\n");
        assert!(!validate(&path));
    }

    #[test]
    fn show_round_trips() {
        let (_dir, path) = config_file("servers:\n  - name: a\n    cmd: echo\n");
        assert!(show(&path));
    }
}
