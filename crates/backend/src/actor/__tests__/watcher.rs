//! File watcher tests against the real filesystem.

#[cfg(test)]
mod tests {
  use std::{path::PathBuf, sync::Arc, time::Duration};

  use pretty_assertions::assert_eq;
  use tokio::{
    sync::mpsc,
    time::{sleep, timeout},
  };

  use crate::{
    actor::{
      __tests__::helpers::TestProject,
      watcher::{WatchCallback, WatchOptions, watch},
    },
    runtime::{builder::metadata::FunctionMetadata, cache::ModuleCache},
  };

  fn channel_callback() -> (WatchCallback, mpsc::UnboundedReceiver<Vec<PathBuf>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback: WatchCallback = Arc::new(move |paths: Vec<PathBuf>| {
      let _ = tx.send(paths);
    });
    (callback, rx)
  }

  async fn next_batch(rx: &mut mpsc::UnboundedReceiver<Vec<PathBuf>>) -> Vec<PathBuf> {
    timeout(Duration::from_secs(2), rx.recv())
      .await
      .expect("timeout waiting for watch callback")
      .expect("callback channel open")
  }

  async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<Vec<PathBuf>>) {
    let extra = timeout(Duration::from_millis(300), rx.recv()).await;
    assert!(extra.is_err(), "unexpected watch callback: {:?}", extra);
  }

  fn fast_options() -> WatchOptions {
    WatchOptions {
      debounce: Duration::from_millis(50),
      ..Default::default()
    }
  }

  #[tokio::test]
  async fn test_rapid_writes_debounce_into_one_change() {
    let project = TestProject::new();
    let file = project.write("functions/hello.js", "v1");

    let (on_change, mut rx) = channel_callback();
    let _handle = watch(
      vec![file.clone()],
      WatchOptions {
        on_change: Some(on_change),
        ..fast_options()
      },
    )
    .await
    .expect("watch");

    project.write("functions/hello.js", "v2");
    project.write("functions/hello.js", "v3");
    project.write("functions/hello.js", "v4");

    assert_eq!(next_batch(&mut rx).await, vec![file]);
    assert_quiet(&mut rx).await;
  }

  #[tokio::test]
  async fn test_mtime_only_update_is_one_change() {
    let project = TestProject::new();
    let file = project.write("functions/hello.js", "v1");

    let (on_change, mut rx) = channel_callback();
    let _handle = watch(
      vec![file.clone()],
      WatchOptions {
        on_change: Some(on_change),
        ..fast_options()
      },
    )
    .await
    .expect("watch");

    project.touch("functions/hello.js");

    assert_eq!(next_batch(&mut rx).await, vec![file]);
    assert_quiet(&mut rx).await;
  }

  #[tokio::test]
  async fn test_file_target_ignores_siblings() {
    let project = TestProject::new();
    let file = project.write("functions/hello.js", "v1");
    project.write("functions/other.js", "v1");

    let (on_change, mut rx) = channel_callback();
    let _handle = watch(
      vec![file.clone()],
      WatchOptions {
        on_change: Some(on_change),
        ..fast_options()
      },
    )
    .await
    .expect("watch");

    project.write("functions/other.js", "v2");
    assert_quiet(&mut rx).await;

    project.write("functions/hello.js", "v2");
    assert_eq!(next_batch(&mut rx).await, vec![file]);
  }

  #[tokio::test]
  async fn test_new_file_reported_as_add() {
    let project = TestProject::new();
    let (on_add, mut add_rx) = channel_callback();
    let (on_change, mut change_rx) = channel_callback();

    let _handle = watch(
      vec![project.functions_dir()],
      WatchOptions {
        on_add: Some(on_add),
        on_change: Some(on_change),
        ..fast_options()
      },
    )
    .await
    .expect("watch");

    let file = project.write("functions/hello.js", "exports.handler = () => {}");

    assert_eq!(next_batch(&mut add_rx).await, vec![file]);
    // The write right after creation folds into the add
    assert_quiet(&mut change_rx).await;
  }

  #[tokio::test]
  async fn test_removed_file_reported_as_unlink() {
    let project = TestProject::new();
    let file = project.write("functions/hello.js", "v1");

    let (on_unlink, mut rx) = channel_callback();
    let _handle = watch(
      vec![project.functions_dir()],
      WatchOptions {
        on_unlink: Some(on_unlink),
        ..fast_options()
      },
    )
    .await
    .expect("watch");

    project.remove("functions/hello.js");
    assert_eq!(next_batch(&mut rx).await, vec![file]);
  }

  #[tokio::test]
  async fn test_node_modules_ignored() {
    let project = TestProject::new();
    std::fs::create_dir_all(project.path("functions/node_modules/lib")).expect("create node_modules");

    let (on_add, mut rx) = channel_callback();
    let _handle = watch(
      vec![project.functions_dir()],
      WatchOptions {
        on_add: Some(on_add),
        ..fast_options()
      },
    )
    .await
    .expect("watch");

    project.write("functions/node_modules/lib/index.js", "module.exports = 1");
    sleep(Duration::from_millis(100)).await;
    let file = project.write("functions/hello.js", "v1");

    assert_eq!(next_batch(&mut rx).await, vec![file]);
  }

  #[tokio::test]
  async fn test_glob_target_filters_events() {
    let project = TestProject::new();
    std::fs::create_dir_all(project.path("include")).expect("create include dir");

    let (on_add, mut rx) = channel_callback();
    let _handle = watch(
      vec![project.path("include/*.txt")],
      WatchOptions {
        on_add: Some(on_add),
        ..fast_options()
      },
    )
    .await
    .expect("watch");

    project.write("include/skip.json", "{}");
    sleep(Duration::from_millis(100)).await;
    let file = project.write("include/a.txt", "a");

    assert_eq!(next_batch(&mut rx).await, vec![file]);
  }

  #[tokio::test]
  async fn test_events_purge_module_cache() {
    let project = TestProject::new();
    let file = project.write("functions/hello.js", "v1");
    let cache = Arc::new(ModuleCache::new());
    cache.insert(file.clone(), Arc::new(FunctionMetadata::default()));

    let (on_change, mut rx) = channel_callback();
    let _handle = watch(
      vec![file.clone()],
      WatchOptions {
        on_change: Some(on_change),
        cache: Some(cache.clone()),
        ..fast_options()
      },
    )
    .await
    .expect("watch");

    project.write("functions/hello.js", "v2");
    next_batch(&mut rx).await;

    assert!(cache.get(&file).is_none());
  }

  #[tokio::test]
  async fn test_dropping_handle_stops_watch() {
    let project = TestProject::new();
    let file = project.write("functions/hello.js", "v1");

    let (on_change, mut rx) = channel_callback();
    let handle = watch(
      vec![file],
      WatchOptions {
        on_change: Some(on_change),
        ..fast_options()
      },
    )
    .await
    .expect("watch");

    handle.close();
    project.write("functions/hello.js", "v2");

    let result = timeout(Duration::from_millis(300), rx.recv()).await;
    assert!(matches!(result, Err(_) | Ok(None)), "closed watch must stay silent");
  }
}
