//! Metadata-driven packaging for managed-script functions.
//!
//! The packaging tool reads in-source metadata (module format, handler shape,
//! schedule, relative imports) and decides whether it should own the build.
//! [`SourcePackager`] is the built-in tool: it packages sources in place and
//! reports everything they pull in so the build actor can watch it.

use std::{
  collections::HashSet,
  path::{Component, Path, PathBuf},
  sync::{Arc, LazyLock},
};

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, trace};
use walkdir::WalkDir;

use super::{BuildError, BuildInput};
use crate::{
  domain::{
    config::{FunctionConfig, NodeBundler},
    function::{BuildResult, dedup_ordered},
  },
  runtime::cache::ModuleCache,
};

/// Protocol version reported for functions exporting only a default handler
pub const RUNTIME_API_V2: u32 = 2;

static ESM_SYNTAX: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"(?m)^\s*(?:import\s+[\w{*]|import\s*['\x22]|export\s)").expect("valid regex"));

static DEFAULT_EXPORT: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"(?m)^\s*export\s+default\b").expect("valid regex"));

static HANDLER_EXPORT: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(
    r"(?m)(?:^\s*export\s+(?:const|let|var|async\s+function|function)\s+handler\b|^\s*export\s*\{[^}]*\bhandler\b|\bexports\.handler\b|\bmodule\.exports\b)",
  )
  .expect("valid regex")
});

static SCHEDULE: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r#"\bschedule\s*(?:\(\s*|:\s*)["'`]([^"'`]+)["'`]"#).expect("valid regex")
});

static RELATIVE_IMPORT: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r#"(?:\bfrom\s*|\bimport\s*\(?\s*|\brequire\s*\(\s*)["'](\.\.?/[^"']+)["']"#).expect("valid regex")
});

/// Extensions tried, in order, when resolving an extensionless import
const IMPORT_SUFFIXES: &[&str] = &["", ".js", ".mjs", ".cjs", ".ts", ".mts", ".cts", ".json"];
const INDEX_FILES: &[&str] = &["index.js", "index.mjs", "index.ts"];

// ============================================================================
// Function Metadata
// ============================================================================

/// What a function's main file declares about itself
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionMetadata {
  pub runtime_api_version: Option<u32>,
  pub schedule: Option<String>,
  pub is_esm: bool,
  /// Relative import specifiers, in source order
  pub imports: Vec<String>,
}

impl FunctionMetadata {
  pub fn parse(source: &str) -> Self {
    let has_default = DEFAULT_EXPORT.is_match(source);
    let has_handler = HANDLER_EXPORT.is_match(source);

    let runtime_api_version = if has_default && !has_handler {
      Some(RUNTIME_API_V2)
    } else if has_handler {
      Some(1)
    } else {
      None
    };

    Self {
      runtime_api_version,
      schedule: SCHEDULE.captures(source).map(|c| c[1].to_string()),
      is_esm: ESM_SYNTAX.is_match(source),
      imports: RELATIVE_IMPORT
        .captures_iter(source)
        .map(|c| c[1].to_string())
        .collect(),
    }
  }

  /// Copy with config overrides applied. A configured schedule wins over source.
  pub fn with_config(&self, config: &FunctionConfig) -> Self {
    Self {
      schedule: config.schedule.clone().or_else(|| self.schedule.clone()),
      ..self.clone()
    }
  }

  pub fn is_v2(&self) -> bool {
    self.runtime_api_version == Some(RUNTIME_API_V2)
  }
}

// ============================================================================
// Packaging Tool
// ============================================================================

/// A packaging tool that may take over a function's build
#[async_trait]
pub trait PackagingTool: Send + Sync {
  fn name(&self) -> &'static str;

  /// In-source metadata of `main_file`, without config overrides
  async fn get_metadata(&self, main_file: &Path) -> Result<Arc<FunctionMetadata>, BuildError>;

  /// Whether this tool should build the function
  fn detect(&self, input: &BuildInput, metadata: Option<&FunctionMetadata>) -> bool;

  async fn build(&self, input: &BuildInput, metadata: Option<&FunctionMetadata>) -> Result<BuildResult, BuildError>;
}

/// Packages sources in place, backed by the shared module cache
pub struct SourcePackager {
  cache: Arc<ModuleCache>,
}

impl SourcePackager {
  pub fn new(cache: Arc<ModuleCache>) -> Self {
    Self { cache }
  }

  /// Main file plus everything it reaches through relative imports
  async fn trace_imports(&self, main_file: &Path) -> Vec<PathBuf> {
    let mut seen = HashSet::from([main_file.to_path_buf()]);
    let mut ordered = vec![main_file.to_path_buf()];
    let mut stack = vec![main_file.to_path_buf()];

    while let Some(file) = stack.pop() {
      if !is_script(&file) {
        continue;
      }
      let metadata = match self.get_metadata(&file).await {
        Ok(metadata) => metadata,
        Err(e) => {
          trace!(path = %file.display(), error = %e, "Skipping unreadable import");
          continue;
        }
      };

      for specifier in &metadata.imports {
        if let Some(resolved) = resolve_import(&file, specifier)
          && seen.insert(resolved.clone())
        {
          ordered.push(resolved.clone());
          stack.push(resolved);
        }
      }
    }

    ordered
  }
}

#[async_trait]
impl PackagingTool for SourcePackager {
  fn name(&self) -> &'static str {
    "source"
  }

  async fn get_metadata(&self, main_file: &Path) -> Result<Arc<FunctionMetadata>, BuildError> {
    if let Some(cached) = self.cache.get(main_file) {
      return Ok(cached);
    }

    let source = tokio::fs::read_to_string(main_file)
      .await
      .map_err(|e| BuildError::read(main_file, e))?;
    let metadata = Arc::new(FunctionMetadata::parse(&source));
    self.cache.insert(main_file.to_path_buf(), metadata.clone());
    Ok(metadata)
  }

  fn detect(&self, input: &BuildInput, metadata: Option<&FunctionMetadata>) -> bool {
    let extension = input.main_file.extension().and_then(|e| e.to_str());
    if matches!(extension, Some("ts" | "mts" | "cts" | "mjs")) {
      return true;
    }
    if input.config.node_bundler == Some(NodeBundler::Esbuild) {
      return true;
    }
    metadata.is_some_and(|m| m.is_esm || m.is_v2())
  }

  async fn build(&self, input: &BuildInput, metadata: Option<&FunctionMetadata>) -> Result<BuildResult, BuildError> {
    let src_files = match input.own_directory() {
      Some(dir) => list_directory_files(dir.to_path_buf()).await?,
      None => self.trace_imports(&input.main_file).await,
    };
    let included_files = resolve_included_files(input.project_root.clone(), input.config.included_files.clone()).await?;

    debug!(
      function = %input.name,
      packager = self.name(),
      src = src_files.len(),
      included = included_files.len(),
      "Packaged function"
    );

    Ok(BuildResult {
      src_files: dedup_ordered(src_files),
      included_files,
      schedule: metadata.and_then(|m| m.schedule.clone()),
      runtime_api_version: metadata
        .and_then(|m| m.runtime_api_version)
        .map(|v| serde_json::json!(v)),
      build_path: None,
    })
  }
}

// ============================================================================
// Helpers
// ============================================================================

fn is_script(path: &Path) -> bool {
  matches!(
    path.extension().and_then(|e| e.to_str()),
    Some("js" | "mjs" | "cjs" | "ts" | "mts" | "cts")
  )
}

/// Remove `.` and `..` components without touching the filesystem
fn normalize(path: &Path) -> PathBuf {
  let mut out = PathBuf::new();
  for component in path.components() {
    match component {
      Component::CurDir => {}
      Component::ParentDir => {
        out.pop();
      }
      other => out.push(other),
    }
  }
  out
}

fn resolve_import(from: &Path, specifier: &str) -> Option<PathBuf> {
  let base = normalize(&from.parent()?.join(specifier));

  for suffix in IMPORT_SUFFIXES {
    let mut candidate = base.clone().into_os_string();
    candidate.push(suffix);
    let candidate = PathBuf::from(candidate);
    if candidate.is_file() {
      return Some(candidate);
    }
  }

  INDEX_FILES.iter().map(|index| base.join(index)).find(|p| p.is_file())
}

/// All files below a function folder, sorted, skipping dependencies and hidden entries
async fn list_directory_files(dir: PathBuf) -> Result<Vec<PathBuf>, BuildError> {
  tokio::task::spawn_blocking(move || {
    let mut files: Vec<PathBuf> = WalkDir::new(&dir)
      .into_iter()
      .filter_entry(|entry| {
        let name = entry.file_name().to_string_lossy();
        entry.depth() == 0 || !(name.starts_with('.') || name == "node_modules")
      })
      .filter_map(|entry| entry.ok())
      .filter(|entry| entry.file_type().is_file())
      .map(|entry| entry.into_path())
      .collect();
    files.sort();
    files
  })
  .await
  .map_err(|e| BuildError::Unsupported(format!("directory walk panicked: {e}")))
}

/// Expand `included_files` patterns against the project root.
///
/// Patterns starting with `!` remove matches of the positive patterns.
pub async fn resolve_included_files(project_root: PathBuf, patterns: Vec<String>) -> Result<Vec<PathBuf>, BuildError> {
  if patterns.is_empty() {
    return Ok(Vec::new());
  }

  tokio::task::spawn_blocking(move || {
    let pattern_error = |pattern: &str, e: &dyn std::fmt::Display| BuildError::Pattern {
      pattern: pattern.to_string(),
      message: e.to_string(),
    };

    let mut excludes = Vec::new();
    let mut includes = Vec::new();
    for pattern in &patterns {
      match pattern.strip_prefix('!') {
        Some(negated) => {
          let absolute = project_root.join(negated);
          let compiled = glob::Pattern::new(&absolute.to_string_lossy()).map_err(|e| pattern_error(pattern, &e))?;
          excludes.push(compiled);
        }
        None => includes.push(pattern),
      }
    }

    let mut matched = Vec::new();
    for pattern in includes {
      let absolute = project_root.join(pattern);
      let paths = glob::glob(&absolute.to_string_lossy()).map_err(|e| pattern_error(pattern, &e))?;
      matched.extend(
        paths
          .filter_map(Result::ok)
          .filter(|path| !excludes.iter().any(|exclude| exclude.matches_path(path))),
      );
    }

    Ok(dedup_ordered(matched))
  })
  .await
  .map_err(|e| BuildError::Unsupported(format!("included_files expansion panicked: {e}")))?
}
