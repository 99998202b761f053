//! Config commands

use anyhow::{Context, Result, bail};
use lambdev::config::Config;

use super::Project;

/// Write the commented default config into the project root
pub fn cmd_config_init(project: &Project) -> Result<()> {
  let path = Config::project_config_path(&project.root);
  if path.exists() {
    bail!("Config already exists at {}", path.display());
  }

  std::fs::write(&path, Config::generate_template())
    .with_context(|| format!("Failed to write {}", path.display()))?;
  println!("Created {}", path.display());
  Ok(())
}

/// Print the effective config and where it came from
pub fn cmd_config_show(project: &Project) -> Result<()> {
  let project_config = Config::project_config_path(&project.root);
  let source = match &project.config_file {
    Some(path) => path.display().to_string(),
    None if project_config.exists() => project_config.display().to_string(),
    None => match Config::user_config_path() {
      Some(user) if user.exists() => user.display().to_string(),
      _ => "defaults".to_string(),
    },
  };

  println!("# Source: {}", source);
  println!("{}", toml::to_string_pretty(&project.config)?);
  Ok(())
}
