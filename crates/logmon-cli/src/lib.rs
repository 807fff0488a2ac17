use clap::{Parser, Subcommand};
use logmon_config::{AppConfigLayer, LoggingConfigLayer};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "logmon", version, about = "Browse and tail log files on remote hosts over SSH")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Config file to use instead of ./logmon.toml or the per-user config.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Write the debug log to FILE.
    #[arg(long, value_name = "FILE")]
    pub debug: Option<PathBuf>,

    /// Server to select on startup (by name).
    #[arg(long)]
    pub server: Option<String>,

    /// Folder to open on the selected server (by path or name).
    #[arg(long, requires = "server")]
    pub folder: Option<String>,

    /// File to open once the folder is listed.
    #[arg(long, requires = "server")]
    pub file: Option<String>,

    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    Config {
        #[arg(long)]
        init: bool,
    },
}

impl Cli {
    pub fn config_overrides(&self) -> Option<AppConfigLayer> {
        let level = match (&self.log_level, &self.debug) {
            (Some(level), _) => Some(level.clone()),
            (None, Some(_)) => Some("debug".to_string()),
            (None, None) => None,
        };
        level.map(|level| AppConfigLayer {
            logging: Some(LoggingConfigLayer {
                level: Some(level),
                ..Default::default()
            }),
            ..Default::default()
        })
    }
}
