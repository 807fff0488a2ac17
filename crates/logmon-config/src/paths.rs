use anyhow::Result;
use directories::{BaseDirs, ProjectDirs};
use std::path::{Path, PathBuf};

#[derive(Clone, Debug)]
pub struct AppPaths {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub config_file: PathBuf,
    pub downloads_dir: PathBuf,
}

impl AppPaths {
    pub fn new() -> Result<Self> {
        let proj = ProjectDirs::from("org", "logmon", "logmon")
            .ok_or_else(|| anyhow::anyhow!("project dirs unavailable"))?;
        let config_dir = proj.config_dir().to_path_buf();
        let data_dir = proj.data_dir().to_path_buf();
        let log_dir = data_dir.join("logs");
        let config_file = config_dir.join("config.toml");
        let downloads_dir = data_dir.join("downloads");
        Ok(Self {
            config_dir,
            data_dir,
            log_dir,
            config_file,
            downloads_dir,
        })
    }

    /// Config file picked up from the working directory before the per-user one.
    pub fn project_config_path(base: impl AsRef<Path>) -> PathBuf {
        base.as_ref().join("logmon.toml")
    }
}

/// Expands a leading `~/` to the user's home directory. Other paths are returned as-is.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match BaseDirs::new() {
        Some(dirs) => dirs.home_dir().join(rest),
        None => path.to_path_buf(),
    }
}
