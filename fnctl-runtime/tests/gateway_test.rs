use {
    std::time::{Duration, Instant},
    futures::StreamExt,
    serde_json::{Value, json},
    fnctl_runtime::InvocationLogEntry,
    crate::fixtures::{CapturedLogs, ECHO_SCRIPT, HELLO_WAT, TestServer, wat_returning},
};


async fn log_entries(server: &TestServer, name: &str) -> Vec<InvocationLogEntry> {
    server.gateway.logger().tail(name, false).map(|v| v.unwrap()).collect().await
}

#[tokio::test]
async fn hello_module() {
    let server = TestServer::start().await;
    server.add_module("hello", HELLO_WAT);

    assert_eq!((200, "Hello, world".to_owned()), server.get("/fn/hello").await);
    assert_eq!((200, "Hello, dev".to_owned()), server.get("/fn/hello?name=dev").await);
    assert_eq!((200, "Hello, dev".to_owned()), server.get("/fn/hello/any/sub/path?name=dev").await);
}

#[tokio::test]
async fn echo_exec() {
    let server = TestServer::start().await;
    server.add_exec("echo", "sh handler.sh", None);
    std::fs::write(server.function_dir("echo").join("handler.sh"), ECHO_SCRIPT).unwrap();

    let (status, body) = server.post("/fn/echo?a=1", "x").await;
    assert_eq!(200, status);

    let event: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json!("x"), event["body"]);
    assert_eq!(json!("POST"), event["method"]);
    assert_eq!(json!({"a": "1"}), event["query"]);
    assert_eq!(json!("text/plain"), event["headers"]["content-type"]);
}

#[tokio::test]
async fn module_reloads_on_change() {
    let server = TestServer::start().await;
    server.add_module("version", &wat_returning(r#"{"ok":"v1"}"#));
    assert_eq!((200, "v1".to_owned()), server.get("/fn/version").await);

    server.write_module_source("version", &wat_returning(r#"{"ok":"v2"}"#));
    assert_eq!((200, "v2".to_owned()), server.get("/fn/version").await);
}

#[tokio::test]
async fn module_heals_after_invalid_source() {
    let server = TestServer::start().await;
    server.add_module("hello", HELLO_WAT);
    assert_eq!(200, server.get("/fn/hello").await.0);

    server.write_module_source("hello", "(module (func");
    let (status, body) = server.get("/fn/hello").await;
    assert_eq!(500, status);
    assert!(body.starts_with("Error: "));
    // the previous module is not served while the source is broken
    assert_eq!(500, server.get("/fn/hello").await.0);

    server.write_module_source("hello", HELLO_WAT);
    assert_eq!((200, "Hello, world".to_owned()), server.get("/fn/hello").await);
}

#[tokio::test]
async fn handler_error_is_500() {
    let server = TestServer::start().await;
    server.add_module("failing", &wat_returning(r#"{"err":"something went wrong"}"#));

    let (status, body) = server.get("/fn/failing").await;
    assert_eq!(500, status);
    assert!(body.contains("something went wrong"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exec_timeout_keeps_gateway_responsive() {
    let server = TestServer::start().await;
    server.add_exec("slow", "sleep 5", Some(2000));
    server.add_module("hello", HELLO_WAT);

    let started_at = Instant::now();
    let (slow, hello) = tokio::join!(server.get("/fn/slow"), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let started_at = Instant::now();
        (server.get("/fn/hello").await, started_at.elapsed())
    });

    assert_eq!(500, slow.0);
    assert!(slow.1.contains("timed out"));
    assert!(started_at.elapsed() < Duration::from_secs(4));

    // served while the slow function was still running
    let (hello, hello_duration) = hello;
    assert_eq!((200, "Hello, world".to_owned()), hello);
    assert!(hello_duration < Duration::from_millis(1500));

    assert_eq!((200, "Hello, world".to_owned()), server.get("/fn/hello").await);
}

#[tokio::test]
async fn logging_toggle() {
    let server = TestServer::start().await;
    server.add_module("hello", HELLO_WAT);

    server.get("/fn/hello?name=first").await;
    server.gateway.store().set_logging("hello", false).await.unwrap();
    server.get("/fn/hello?name=hidden").await;
    server.gateway.store().set_logging("hello", true).await.unwrap();
    server.get("/fn/hello?name=last").await;

    let entries = log_entries(&server, "hello").await;
    assert_eq!(
        vec!["first", "last"],
        entries.iter().map(|v| v.query["name"].as_str()).collect::<Vec<_>>(),
    );
    assert_eq!("Hello, last", entries[1].body_preview);
    assert_eq!(200, entries[1].status);
}

#[tokio::test]
async fn destroyed_function_is_404() {
    let server = TestServer::start().await;
    server.add_module("hello", HELLO_WAT);
    assert_eq!(200, server.get("/fn/hello").await.0);

    server.gateway.store().remove("hello").await.unwrap();
    server.gateway.logger().purge("hello").await.unwrap();

    assert_eq!((404, "Function not found".to_owned()), server.get("/fn/hello").await);
    assert!(!server.gateway.logger().log_path("hello").exists());
}

#[tokio::test]
async fn unknown_routes_are_404() {
    let server = TestServer::start().await;

    assert_eq!(404, server.get("/fn/missing").await.0);
    assert_eq!((404, "Not Found".to_owned()), server.get("/").await);
    assert_eq!((404, "Not Found".to_owned()), server.get("/fn/").await);
}

#[tokio::test]
async fn function_added_while_running() {
    let server = TestServer::start().await;
    assert_eq!(404, server.get("/fn/late").await.0);

    server.add_exec("late", "echo '{\"statusCode\":201,\"body\":\"created\"}'", None);
    assert_eq!((201, "created".to_owned()), server.get("/fn/late").await);
}

// current thread runtime, so the connection tasks log through the thread local subscriber
#[tokio::test]
async fn access_log_follows_quiet() {
    for quiet in [false, true] {
        let logs = CapturedLogs::default();
        let _guard = logs.install();

        let server = TestServer::start_with_quiet(quiet).await;
        server.add_exec("greet", "echo '\"hi\"'", None);
        assert_eq!((200, "hi".to_owned()), server.get("/fn/greet?x=1").await);
        assert_eq!(404, server.get("/fn/missing").await.0);

        let access_logged = logs.contents().contains("GET /fn/greet 200");
        assert_eq!(!quiet, access_logged, "quiet: {quiet}");
        assert_eq!(!quiet, logs.contents().contains("GET /fn/missing 404"), "quiet: {quiet}");

        // invocation logging does not depend on the access log
        assert_eq!(1, log_entries(&server, "greet").await.len(), "quiet: {quiet}");
    }
}
