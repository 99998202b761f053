//! Direct (v1) invocation through the dispatcher with real child processes.

#[cfg(test)]
mod tests {
  use std::{collections::BTreeMap, time::Instant};

  use pretty_assertions::assert_eq;
  use serde_json::json;

  use crate::invoke::{
    BLOBS_CONTEXT_VAR, InvocationRequest, InvocationResult, InvokeError, LambdaResponse,
    __tests__::helpers::{ScriptFunctions, sh_dispatcher},
  };

  const ECHO_EVENT: &str = r#"read -r event
echo "handler log line"
printf '{"type":"result","message":{"statusCode":200,"headers":{"event":%s}}}\n' "$event"
"#;

  const ECHO_ENV: &str = r#"printf '{"type":"result","message":{"statusCode":200,"body":"%s|%s|%s|%s|%s"}}\n' \
  "$LAMBDA_MODULE_FORMAT" "${NETLIFY_BLOBS_CONTEXT:-unset}" "$GREETING" "$LAMBDA_FUNCTION_NAME" "${#LAMBDA_REQUEST_ID}"
"#;

  fn expect_direct(result: InvocationResult) -> LambdaResponse {
    match result {
      InvocationResult::Direct(response) => response,
      other => panic!("expected a direct result, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_event_reaches_handler_and_response_is_parsed() {
    let functions = ScriptFunctions::new();
    let function = functions.function("hello.js", ECHO_EVENT, None);
    let dispatcher = sh_dispatcher(functions.path());

    let event = json!({ "path": "/hello", "httpMethod": "GET" });
    let result = dispatcher
      .invoke(&function, InvocationRequest::new(event.clone()))
      .await
      .expect("invoke");

    let response = expect_direct(result);
    assert_eq!(response.status_code, Some(200));
    assert_eq!(response.headers.expect("headers")["event"], event);
  }

  #[tokio::test]
  async fn test_environment_and_module_format() {
    let functions = ScriptFunctions::new();
    let function = functions.function("hello.mjs", ECHO_ENV, None);
    let dispatcher = sh_dispatcher(functions.path());

    let request = InvocationRequest {
      environment: BTreeMap::from([
        (BLOBS_CONTEXT_VAR.to_string(), "secret".to_string()),
        ("GREETING".to_string(), "hi".to_string()),
      ]),
      ..InvocationRequest::new(json!({}))
    };
    let response = expect_direct(dispatcher.invoke(&function, request).await.expect("invoke"));

    assert_eq!(response.body.as_deref(), Some("esm|unset|hi|hello|36"));
  }

  #[tokio::test]
  async fn test_null_result_is_empty_response() {
    let functions = ScriptFunctions::new();
    let function = functions.function("hello.js", "printf '{\"type\":\"result\",\"message\":null}\\n'\n", None);
    let dispatcher = sh_dispatcher(functions.path());

    let response = expect_direct(
      dispatcher
        .invoke(&function, InvocationRequest::new(json!({})))
        .await
        .expect("invoke"),
    );
    assert_eq!(response, LambdaResponse::default());
  }

  #[tokio::test]
  async fn test_handler_error_maps_to_runtime_error() {
    let functions = ScriptFunctions::new();
    let function = functions.function(
      "hello.js",
      "printf '{\"type\":\"error\",\"name\":\"TypeError\",\"message\":\"boom\"}\\n'\n",
      None,
    );
    let dispatcher = sh_dispatcher(functions.path());

    let err = dispatcher
      .invoke(&function, InvocationRequest::new(json!({})))
      .await
      .expect_err("handler error");

    assert!(matches!(&err, InvokeError::Runtime { name, message } if name == "TypeError" && message == "boom"));
    assert_eq!(err.status_code(), 500);
  }

  #[tokio::test]
  async fn test_exit_without_envelope_is_process_error() {
    let functions = ScriptFunctions::new();
    let function = functions.function("hello.js", "echo 'no envelope'\necho 'crashed' >&2\nexit 1\n", None);
    let dispatcher = sh_dispatcher(functions.path());

    let err = dispatcher
      .invoke(&function, InvocationRequest::new(json!({})))
      .await
      .expect_err("process error");

    match err {
      InvokeError::Process(message) => assert!(message.contains("crashed"), "message: {message}"),
      other => panic!("expected process error, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_slow_function_times_out() {
    let functions = ScriptFunctions::new();
    let function = functions.function("slow.js", "sleep 5\n", None);
    let dispatcher = sh_dispatcher(functions.path());

    let start = Instant::now();
    let request = InvocationRequest {
      timeout_seconds: Some(1),
      ..InvocationRequest::new(json!({}))
    };
    let err = dispatcher.invoke(&function, request).await.expect_err("timeout");

    assert!(matches!(err, InvokeError::Timeout { secs: 1 }));
    assert!(err.is_timeout());
    assert_eq!(err.status_code(), 504);
    assert!(start.elapsed().as_secs() < 4, "timed out call must not wait for the process");
  }

  #[tokio::test]
  async fn test_timeout_covers_event_the_function_never_reads() {
    let functions = ScriptFunctions::new();
    let function = functions.function("slow.js", "sleep 4\n", None);
    let dispatcher = sh_dispatcher(functions.path());

    // Larger than any pipe buffer, so the write cannot complete on its own
    let start = Instant::now();
    let request = InvocationRequest {
      timeout_seconds: Some(1),
      ..InvocationRequest::new(json!({ "body": "x".repeat(1024 * 1024) }))
    };
    let err = dispatcher.invoke(&function, request).await.expect_err("timeout");

    assert!(matches!(err, InvokeError::Timeout { secs: 1 }), "got {:?}", err);
    assert!(start.elapsed().as_millis() < 2500, "elapsed {:?}", start.elapsed());
  }

  #[tokio::test]
  async fn test_unbuilt_function_is_rejected() {
    let functions = ScriptFunctions::new();
    let main_file = functions.write("hello.js", ECHO_EVENT);
    let function = functions.unbuilt("hello.js", main_file);
    let dispatcher = sh_dispatcher(functions.path());

    let err = dispatcher
      .invoke(&function, InvocationRequest::new(json!({})))
      .await
      .expect_err("not built");

    assert!(matches!(err, InvokeError::NotBuilt(_)));
    assert_eq!(err.to_string(), "Cannot invoke a function that has not been built");
  }
}
