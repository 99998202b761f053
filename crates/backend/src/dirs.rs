//! Well-known lambdev directories

use std::path::{Path, PathBuf};

const APP_DIR: &str = "lambdev";

/// Explicit override, then `$XDG_*/lambdev`, then the platform default
fn resolve(override_var: &str, xdg_var: &str, platform: Option<PathBuf>) -> PathBuf {
  if let Ok(dir) = std::env::var(override_var) {
    return PathBuf::from(dir);
  }

  if let Ok(xdg) = std::env::var(xdg_var) {
    return PathBuf::from(xdg).join(APP_DIR);
  }

  platform.unwrap_or_else(|| PathBuf::from(".")).join(APP_DIR)
}

/// Where `serve` writes its rolling log files (`LAMBDEV_DATA_DIR` overrides)
pub fn default_data_dir() -> PathBuf {
  resolve("LAMBDEV_DATA_DIR", "XDG_DATA_HOME", dirs::data_local_dir())
}

/// Home of the user-level `config.toml` (`LAMBDEV_CONFIG_DIR` overrides)
pub fn default_config_dir() -> PathBuf {
  resolve("LAMBDEV_CONFIG_DIR", "XDG_CONFIG_HOME", dirs::config_dir())
}

/// Project-local cache for build outputs
///
/// Compiled binaries land in `<project>/.lambdev/functions`, which discovery
/// never scans because hidden entries are skipped.
pub fn project_cache_dir(project_root: &Path) -> PathBuf {
  if let Ok(dir) = std::env::var("LAMBDEV_CACHE_DIR") {
    return PathBuf::from(dir);
  }

  project_root.join(".lambdev")
}
