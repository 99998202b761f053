//! Worker (v2) invocation: protocol routing, message handoff and the
//! response stream bridge.

#[cfg(test)]
mod tests {
  use std::{collections::BTreeMap, path::Path, time::Duration};

  use pretty_assertions::assert_eq;
  use serde_json::{Value, json};
  use tokio::io::AsyncReadExt;

  use crate::{
    domain::function::BuildResult,
    invoke::{
      Dispatcher, InvocationRequest, InvocationResult, InvokeError, Protocol,
      __tests__::helpers::{ScriptFunctions, StubBehavior, StubSpawner, sh_dispatcher, sh_runtimes},
      worker::{self, ProcessSpawner, WorkerMessage, file_url},
    },
    runtime::Launcher,
  };

  /// Reports which protocol launched it: only direct launches set LAMBDA_ENTRY_PATH
  const WHICH_PROTOCOL: &str = r#"read -r input
if [ -n "$LAMBDA_ENTRY_PATH" ]; then
  printf '{"type":"result","message":{"statusCode":200,"body":"v1"}}\n'
else
  printf '{"type":"result","message":{"statusCode":200,"body":"v2"}}\n'
fi
"#;

  fn build_with_version(version: Option<Value>) -> BuildResult {
    BuildResult {
      runtime_api_version: version,
      ..Default::default()
    }
  }

  #[test]
  fn test_only_numeric_two_selects_worker_protocol() {
    assert_eq!(Protocol::for_build(None), Protocol::V1);
    assert_eq!(Protocol::for_build(Some(&build_with_version(None))), Protocol::V1);
    assert_eq!(Protocol::for_build(Some(&build_with_version(Some(json!("2"))))), Protocol::V1);
    assert_eq!(Protocol::for_build(Some(&build_with_version(Some(json!(3))))), Protocol::V1);
    assert_eq!(Protocol::for_build(Some(&build_with_version(Some(json!(1))))), Protocol::V1);
    assert_eq!(Protocol::for_build(Some(&build_with_version(Some(json!(2))))), Protocol::V2);
  }

  #[tokio::test]
  async fn test_dispatch_routes_by_runtime_api_version() {
    let functions = ScriptFunctions::new();
    let dispatcher = sh_dispatcher(functions.path());

    let v2 = functions.function("modern.js", WHICH_PROTOCOL, Some(json!(2)));
    match dispatcher.invoke(&v2, InvocationRequest::new(json!({}))).await.expect("invoke v2") {
      InvocationResult::Worker { message, body } => {
        assert_eq!(message.fields["body"], "v2");
        assert_eq!(message.status_code(), Some(200));
        assert!(body.is_none());
      }
      other => panic!("expected worker result, got {:?}", other),
    }

    let string_version = functions.function("legacy.js", WHICH_PROTOCOL, Some(json!("2")));
    match dispatcher
      .invoke(&string_version, InvocationRequest::new(json!({})))
      .await
      .expect("invoke v1")
    {
      InvocationResult::Direct(response) => assert_eq!(response.body.as_deref(), Some("v1")),
      other => panic!("expected direct result, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_worker_seeded_with_request() {
    let functions = ScriptFunctions::new();
    let function = functions.function("hello.mjs", "", Some(json!(2)));
    let spawner = StubSpawner::new(StubBehavior::Message(WorkerMessage::default()));
    let dispatcher = Dispatcher::new(sh_runtimes(functions.path()), spawner.clone());

    let request = InvocationRequest {
      event: json!({ "rawUrl": "http://localhost:8888/hello" }),
      context: json!({ "identity": { "url": "http://localhost" } }),
      environment: BTreeMap::from([("GREETING".to_string(), "hi".to_string())]),
      timeout_seconds: Some(7),
    };
    dispatcher.invoke(&function, request).await.expect("invoke");

    let data = spawner.seen().expect("worker spawned");
    assert_eq!(data.entry_file_path, file_url(&function.main_file));
    assert!(data.entry_file_path.starts_with("file:///"));
    assert_eq!(data.timeout_ms, 7_000);
    assert_eq!(data.event["rawUrl"], "http://localhost:8888/hello");
    assert_eq!(
      serde_json::from_str::<Value>(&data.client_context).expect("context json"),
      json!({ "identity": { "url": "http://localhost" } })
    );
    assert_eq!(data.environment.get("GREETING").map(String::as_str), Some("hi"));
  }

  #[tokio::test]
  async fn test_direct_message_lets_worker_finish() {
    let mut message = WorkerMessage::default();
    message.fields.insert("statusCode".to_string(), json!(204));
    let spawner = StubSpawner::new(StubBehavior::Message(message));

    let (message, body) = worker::invoke(
      spawner.as_ref(),
      &Launcher::new("unused"),
      Path::new("/p/functions/hello.mjs"),
      InvocationRequest::new(json!({})),
      5,
    )
    .await
    .expect("invoke");

    assert_eq!(message.status_code(), Some(204));
    assert!(body.is_none());
    assert!(!spawner.worker_token().is_cancelled());
  }

  #[tokio::test]
  async fn test_stream_port_is_bridged_to_body() {
    let spawner = StubSpawner::new(StubBehavior::Stream {
      status: 200,
      body: "chunk one\nchunk two\n",
    });

    let (message, body) = worker::invoke(
      spawner.as_ref(),
      &Launcher::new("unused"),
      Path::new("/p/functions/stream.mjs"),
      InvocationRequest::new(json!({})),
      5,
    )
    .await
    .expect("invoke");

    assert_eq!(message.status_code(), Some(200));
    assert!(message.stream_port.is_some());

    let mut body = body.expect("streamed body");
    let mut text = String::new();
    body.read_to_string(&mut text).await.expect("read body");
    assert_eq!(text, "chunk one\nchunk two\n");

    let worker = spawner.worker_token();
    assert!(!worker.is_cancelled(), "worker lives as long as the body");
    drop(body);
    assert!(worker.is_cancelled());
  }

  #[tokio::test]
  async fn test_unreachable_stream_port_is_bridge_error() {
    let spawner = StubSpawner::new(StubBehavior::DeadPort);

    let err = worker::invoke(
      spawner.as_ref(),
      &Launcher::new("unused"),
      Path::new("/p/functions/stream.mjs"),
      InvocationRequest::new(json!({})),
      5,
    )
    .await
    .expect_err("bridge error");

    assert!(matches!(err, InvokeError::StreamBridge { .. }));
    assert_eq!(err.status_code(), 502);
    assert!(spawner.worker_token().is_cancelled());
  }

  #[tokio::test]
  async fn test_silent_worker_times_out() {
    let spawner = StubSpawner::new(StubBehavior::Silent);

    let err = tokio::time::timeout(
      Duration::from_secs(5),
      worker::invoke(
        spawner.as_ref(),
        &Launcher::new("unused"),
        Path::new("/p/functions/slow.mjs"),
        InvocationRequest::new(json!({})),
        1,
      ),
    )
    .await
    .expect("invoke finished")
    .expect_err("timeout");

    assert!(matches!(err, InvokeError::Timeout { secs: 1 }));
    assert!(spawner.worker_token().is_cancelled());
  }

  #[tokio::test]
  async fn test_worker_timeout_covers_unread_seed_data() {
    let launcher = Launcher::new("sh").arg("-c").arg("sleep 4");

    let start = std::time::Instant::now();
    let err = worker::invoke(
      &ProcessSpawner,
      &launcher,
      Path::new("/p/functions/slow.mjs"),
      InvocationRequest::new(json!({ "body": "x".repeat(1024 * 1024) })),
      1,
    )
    .await
    .expect_err("timeout");

    assert!(matches!(err, InvokeError::Timeout { secs: 1 }), "got {:?}", err);
    assert!(start.elapsed().as_millis() < 2500, "elapsed {:?}", start.elapsed());
  }

  #[tokio::test]
  async fn test_worker_exit_without_message_reports_stderr() {
    let launcher = Launcher::new("sh").arg("-c").arg("echo boom >&2; exit 3");

    let err = worker::invoke(
      &ProcessSpawner,
      &launcher,
      Path::new("/p/functions/crash.mjs"),
      InvocationRequest::new(json!({})),
      5,
    )
    .await
    .expect_err("worker error");

    match err {
      InvokeError::Worker(message) => assert!(message.contains("boom"), "message: {message}"),
      other => panic!("expected worker error, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_worker_output_before_envelope_is_logged_not_parsed() {
    let launcher = Launcher::new("sh").arg("-c").arg(
      r#"read -r data; echo "starting"; printf '{"type":"result","message":{"statusCode":201}}\n'; echo "after""#,
    );

    let (message, body) = worker::invoke(
      &ProcessSpawner,
      &launcher,
      Path::new("/p/functions/hello.mjs"),
      InvocationRequest::new(json!({})),
      5,
    )
    .await
    .expect("invoke");

    assert_eq!(message.status_code(), Some(201));
    assert!(body.is_none());
  }

  #[tokio::test]
  async fn test_worker_error_envelope_maps_to_runtime_error() {
    let launcher = Launcher::new("sh").arg("-c").arg(
      r#"read -r data; printf '{"type":"error","name":"Error","message":"handler threw"}\n'"#,
    );

    let err = worker::invoke(
      &ProcessSpawner,
      &launcher,
      Path::new("/p/functions/hello.mjs"),
      InvocationRequest::new(json!({})),
      5,
    )
    .await
    .expect_err("runtime error");

    assert!(matches!(err, InvokeError::Runtime { message, .. } if message == "handler threw"));
  }
}
