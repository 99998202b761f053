//! FunctionsRegistry tests: discovery through scan, duplicate precedence,
//! config isolation and rescans.

#[cfg(test)]
mod tests {
  use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
  };

  use async_trait::async_trait;
  use pretty_assertions::assert_eq;
  use serde_json::json;

  use crate::{
    actor::{
      __tests__::helpers::{RecordingWatchFactory, TestProject},
      registry::{FunctionsRegistry, RegistryError, RegistryOptions},
      watcher::WatchFactory,
    },
    domain::{
      config::{Config, FunctionConfig, FunctionsConfig},
      function::{BuildResult, FunctionDescriptor, RuntimeName},
    },
    invoke::{InvocationRequest, InvokeError, Protocol},
    runtime::{Launcher, Runtime, Runtimes, builder::BuildError},
  };

  const HANDLER: &str = "exports.handler = async () => ({ statusCode: 200 })\n";

  /// Config whose Go toolchain can never be found, so Go builds fail fast
  fn test_config() -> Config {
    let mut config = Config::default();
    config.runtimes.go.toolchain = "lambdev-test-missing-go".to_string();
    config.legacy_builder.enabled = false;
    config
  }

  fn registry(project: &TestProject, config: &Config) -> Arc<FunctionsRegistry> {
    FunctionsRegistry::new(RegistryOptions::new(project.root().to_path_buf(), config).without_watch())
  }

  #[tokio::test]
  async fn test_duplicate_names_resolve_by_precedence() {
    let project = TestProject::new();
    project.write("functions/hello.js", HANDLER);
    project.write("functions/hello.ts", "export const handler = async () => ({ statusCode: 200 })\n");
    project.write("functions/hello2.js", HANDLER);
    project.write("functions/hello2/main.go", "package main\n\nfunc main() {}\n");

    let registry = registry(&project, &test_config());
    let summary = registry.scan(&[project.functions_dir()]).await.expect("scan");

    let functions: Vec<(String, RuntimeName)> = registry
      .list_functions()
      .iter()
      .map(|f| (f.name.clone(), f.runtime))
      .collect();
    assert_eq!(
      functions,
      vec![
        ("hello".to_string(), RuntimeName::Js),
        ("hello2".to_string(), RuntimeName::Go),
      ]
    );

    let hello = registry.get("hello").expect("hello registered");
    assert_eq!(hello.main_file, project.path("functions/hello.js"));
    assert!(hello.build_data().is_some(), "plain JS builds without a toolchain");

    assert_eq!(summary.added, vec!["hello".to_string(), "hello2".to_string()]);
    assert_eq!(summary.failed.len(), 1, "go build needs the toolchain");
    assert_eq!(summary.failed[0].0, "hello2");
  }

  #[tokio::test]
  async fn test_only_functions_section_reaches_discovery() {
    let project = TestProject::new();
    project.write("functions/hello.js", HANDLER);

    let config: Config = toml::from_str(
      r#"
        plugins = ["x"]

        [functions."*"]
      "#,
    )
    .expect("parse config");
    assert_eq!(config.plugins, vec!["x".to_string()]);

    let registry = registry(&project, &config);
    registry.scan(&[project.functions_dir()]).await.expect("scan");

    let expected = FunctionsConfig::new(BTreeMap::from([("*".to_string(), FunctionConfig::default())]));
    assert_eq!(registry.functions_config(), &expected);
    assert_eq!(registry.get("hello").expect("hello").config, FunctionConfig::default());
  }

  #[tokio::test]
  async fn test_function_config_applies_to_descriptor() {
    let project = TestProject::new();
    project.write("functions/hello.js", HANDLER);
    project.write("include/a.txt", "a");

    let mut config = test_config();
    config.functions = FunctionsConfig::new(BTreeMap::from([
      (
        "*".to_string(),
        FunctionConfig {
          included_files: vec!["include/*".to_string()],
          ..Default::default()
        },
      ),
      (
        "hello".to_string(),
        FunctionConfig {
          schedule: Some("@daily".to_string()),
          timeout: Some(3),
          ..Default::default()
        },
      ),
    ]));

    let registry = registry(&project, &config);
    registry.scan(&[project.functions_dir()]).await.expect("scan");

    let hello = registry.get("hello").expect("hello");
    assert_eq!(hello.timeout_secs(), 3);
    assert_eq!(hello.schedule().as_deref(), Some("@daily"));
    let data = hello.build_data().expect("built");
    assert_eq!(data.included_files, vec![project.path("include/a.txt")]);
  }

  #[tokio::test]
  async fn test_rescan_drops_removed_functions() {
    let project = TestProject::new();
    project.write("functions/hello.js", HANDLER);
    project.write("functions/bye.js", HANDLER);

    let registry = registry(&project, &test_config());
    registry.scan(&[project.functions_dir()]).await.expect("scan");
    assert_eq!(registry.list_functions().len(), 2);

    project.remove("functions/bye.js");
    let summary = registry.rescan().await.expect("rescan");

    assert_eq!(summary.removed, vec!["bye".to_string()]);
    assert!(summary.added.is_empty());
    assert!(registry.get("bye").is_none());
    assert!(registry.get("hello").is_some());
  }

  #[tokio::test]
  async fn test_higher_precedence_file_replaces_function() {
    let project = TestProject::new();
    project.write("functions/hello.ts", "export const handler = async () => ({ statusCode: 200 })\n");

    let registry = registry(&project, &test_config());
    registry.scan(&[project.functions_dir()]).await.expect("scan");
    assert_eq!(
      registry.get("hello").expect("hello").main_file,
      project.path("functions/hello.ts")
    );

    project.write("functions/hello.js", HANDLER);
    let summary = registry.rescan().await.expect("rescan");

    assert_eq!(summary.removed, vec!["hello".to_string()]);
    assert_eq!(summary.added, vec!["hello".to_string()]);
    assert_eq!(
      registry.get("hello").expect("hello").main_file,
      project.path("functions/hello.js")
    );
  }

  #[tokio::test]
  async fn test_missing_directory_is_created() {
    let project = TestProject::new();
    let directory = project.path("netlify/functions");

    let registry = registry(&project, &test_config());
    let summary = registry.scan(std::slice::from_ref(&directory)).await.expect("scan");

    assert!(directory.is_dir());
    assert!(summary.added.is_empty());
    assert!(registry.list_functions().is_empty());
  }

  #[tokio::test]
  async fn test_unknown_function_errors() {
    let project = TestProject::new();
    let registry = registry(&project, &test_config());
    registry.scan(&[project.functions_dir()]).await.expect("scan");

    let err = registry.build("missing").await.expect_err("build should fail");
    assert!(matches!(err, RegistryError::NotFound(name) if name == "missing"));

    let err = registry
      .invoke("missing", InvocationRequest::new(json!({})))
      .await
      .expect_err("invoke should fail");
    assert!(matches!(err, InvokeError::NotFound(_)));
    assert_eq!(err.status_code(), 404);
  }

  #[tokio::test]
  async fn test_scan_watches_directory_and_sources() {
    let project = TestProject::new();
    project.write("functions/hello.js", HANDLER);

    let factory = RecordingWatchFactory::new();
    let mut options = RegistryOptions::new(project.root().to_path_buf(), &test_config());
    options.watch_factory = Some(factory.clone() as Arc<dyn WatchFactory>);
    let registry = FunctionsRegistry::new(options);

    registry.scan(&[project.functions_dir()]).await.expect("scan");
    registry.rescan().await.expect("rescan");

    let directory_calls = factory.calls_for(&project.functions_dir());
    assert_eq!(directory_calls.len(), 1, "directory watched once across scans");
    assert_eq!(directory_calls[0].options.depth, Some(1));
    assert!(directory_calls[0].options.on_add.is_some());
    assert!(directory_calls[0].options.on_unlink.is_some());

    let source_calls = factory.calls_for(&project.path("functions/hello.js"));
    assert_eq!(source_calls.len(), 1);

    registry.shutdown();
    assert!(registry.list_functions().is_empty());
  }

  /// Runtime whose pre-scan hook generates a function, like a legacy build
  /// writing its output into the functions directory
  #[derive(Default)]
  struct GeneratingRuntime {
    events: Mutex<Vec<String>>,
  }

  impl GeneratingRuntime {
    fn events(&self) -> Vec<String> {
      self.events.lock().expect("lock events").clone()
    }
  }

  #[async_trait]
  impl Runtime for GeneratingRuntime {
    fn name(&self) -> RuntimeName {
      RuntimeName::Js
    }

    async fn on_directory_scan(&self, directories: &[PathBuf]) -> Result<(), BuildError> {
      // Yield first so a scan that did not wait for the hook would race past it
      tokio::time::sleep(std::time::Duration::from_millis(50)).await;
      for directory in directories {
        std::fs::write(directory.join("generated.js"), HANDLER).expect("write generated function");
      }
      self.events.lock().expect("lock events").push("scan".to_string());
      Ok(())
    }

    async fn build(&self, function: &FunctionDescriptor) -> Result<BuildResult, BuildError> {
      self
        .events
        .lock()
        .expect("lock events")
        .push(format!("build:{}", function.name));
      Ok(BuildResult::from_src_files(vec![function.main_file.clone()]))
    }

    fn launcher(&self, _function: &FunctionDescriptor, entry: &Path, _protocol: Protocol) -> Result<Launcher, InvokeError> {
      Ok(Launcher::new("sh").arg(entry.to_string_lossy()))
    }
  }

  #[tokio::test]
  async fn test_pre_scan_hook_output_is_discovered_in_same_scan() {
    let project = TestProject::new();
    project.write("functions/hello.js", HANDLER);

    let runtime = Arc::new(GeneratingRuntime::default());
    let mut options = RegistryOptions::new(project.root().to_path_buf(), &test_config()).without_watch();
    options.runtimes = Runtimes::new().with(runtime.clone());
    let registry = FunctionsRegistry::new(options);

    let summary = registry.scan(&[project.functions_dir()]).await.expect("scan");

    assert_eq!(summary.added, vec!["generated".to_string(), "hello".to_string()]);
    assert!(registry.get("generated").is_some_and(|f| f.build_data().is_some()));

    let events = runtime.events();
    assert_eq!(events.first().map(String::as_str), Some("scan"));
    assert_eq!(events.iter().filter(|e| e.starts_with("build:")).count(), 2);
  }
}
