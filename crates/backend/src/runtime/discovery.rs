//! Function discovery.
//!
//! Each functions directory is scanned one level deep. A function is either a
//! flat file (`<dir>/hello.js`) or a folder whose main file is
//! `<dir>/hello/hello.<ext>`, `<dir>/hello/index.<ext>` or `<dir>/hello/main.go`.
//!
//! When several candidates share a name, the lowest rank wins:
//! folder layouts before flat files, then by extension, then a file named
//! after its folder before `index`. Directory order never affects the outcome.

use std::{
  collections::BTreeMap,
  path::{Path, PathBuf},
};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::domain::{
  config::{FunctionConfig, FunctionsConfig},
  function::RuntimeName,
};

/// Supported main file extensions with their precedence rank
const EXTENSIONS: &[(&str, u8, RuntimeName)] = &[
  ("js", 0, RuntimeName::Js),
  ("mjs", 1, RuntimeName::Js),
  ("cjs", 2, RuntimeName::Js),
  ("go", 3, RuntimeName::Go),
  ("ts", 4, RuntimeName::Js),
  ("mts", 5, RuntimeName::Js),
  ("cts", 6, RuntimeName::Js),
];

/// A function found on disk, before registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionCandidate {
  pub name: String,
  pub main_file: PathBuf,
  /// Functions directory the candidate was found in
  pub directory: PathBuf,
  pub runtime: RuntimeName,
  /// Settings resolved from the `[functions]` subsection
  pub config: FunctionConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Layout {
  Folder,
  Flat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Stem {
  Named,
  Index,
}

type Rank = (Layout, u8, Stem);

fn extension_info(path: &Path) -> Option<(u8, RuntimeName)> {
  let ext = path.extension()?.to_str()?;
  EXTENSIONS
    .iter()
    .find(|(candidate, _, _)| *candidate == ext)
    .map(|(_, rank, runtime)| (*rank, *runtime))
}

fn is_skipped(name: &str) -> bool {
  name.starts_with('.') || name == "node_modules"
}

/// Main file candidates inside a function folder
fn folder_candidates(folder: &Path, name: &str) -> Vec<(PathBuf, Rank, RuntimeName)> {
  let mut found = Vec::new();
  for (ext, rank, runtime) in EXTENSIONS {
    let named = folder.join(format!("{name}.{ext}"));
    if named.is_file() {
      found.push((named, (Layout::Folder, *rank, Stem::Named), *runtime));
    }
    let index = folder.join(format!("index.{ext}"));
    if *runtime == RuntimeName::Js && index.is_file() {
      found.push((index, (Layout::Folder, *rank, Stem::Index), *runtime));
    }
  }

  let go_main = folder.join("main.go");
  if go_main.is_file()
    && let Some((rank, runtime)) = extension_info(&go_main)
  {
    found.push((go_main, (Layout::Folder, rank, Stem::Index), runtime));
  }
  found
}

fn scan_directory(directory: &Path, best: &mut BTreeMap<String, (Rank, PathBuf, PathBuf, RuntimeName)>) {
  let walker = WalkDir::new(directory)
    .min_depth(1)
    .max_depth(1)
    .sort_by_file_name()
    .into_iter()
    .filter_entry(|entry| !is_skipped(&entry.file_name().to_string_lossy()));

  for entry in walker {
    let entry = match entry {
      Ok(entry) => entry,
      Err(e) => {
        warn!(directory = %directory.display(), error = %e, "Skipping unreadable entry");
        continue;
      }
    };

    let path = entry.path();
    let candidates = if entry.file_type().is_dir() {
      let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        continue;
      };
      folder_candidates(path, name)
        .into_iter()
        .map(|(main, rank, runtime)| (name.to_string(), main, rank, runtime))
        .collect()
    } else if let Some((rank, runtime)) = extension_info(path) {
      let Some(name) = path.file_stem().and_then(|n| n.to_str()) else {
        continue;
      };
      vec![(name.to_string(), path.to_path_buf(), (Layout::Flat, rank, Stem::Named), runtime)]
    } else {
      Vec::new()
    };

    for (name, main_file, rank, runtime) in candidates {
      let replace = best.get(&name).is_none_or(|(current, ..)| rank < *current);
      if replace {
        best.insert(name, (rank, main_file, directory.to_path_buf(), runtime));
      }
    }
  }
}

/// List the functions in `directories`, resolving each name's config.
///
/// Missing or unreadable directories are skipped. Earlier directories win ties
/// between equally ranked candidates.
pub fn list_functions(directories: &[PathBuf], config: &FunctionsConfig) -> Vec<FunctionCandidate> {
  let mut best = BTreeMap::new();
  for directory in directories {
    if !directory.is_dir() {
      debug!(directory = %directory.display(), "Functions directory does not exist");
      continue;
    }
    scan_directory(directory, &mut best);
  }

  best
    .into_iter()
    .map(|(name, (_, main_file, directory, runtime))| FunctionCandidate {
      config: config.resolve(&name),
      name,
      main_file,
      directory,
      runtime,
    })
    .collect()
}

/// [`list_functions`] on the blocking pool
pub async fn list_functions_async(directories: Vec<PathBuf>, config: FunctionsConfig) -> Vec<FunctionCandidate> {
  match tokio::task::spawn_blocking(move || list_functions(&directories, &config)).await {
    Ok(found) => found,
    Err(e) => {
      warn!(error = %e, "Function discovery task failed");
      Vec::new()
    }
  }
}
