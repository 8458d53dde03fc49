use {
    std::{convert::Infallible, future::Future, io, pin::Pin, sync::Arc, time::{Duration, Instant}},
    tokio::net::TcpListener,
    hyper::{
        HeaderMap,
        Method,
        Request,
        Response,
        StatusCode,
        Uri,
        body::{Bytes, Incoming},
        header::{HeaderName, HeaderValue},
        server::conn::http1,
    },
    hyper_util::{rt::{TokioIo, TokioTimer}, server::graceful::GracefulShutdown},
    http_body_util::{BodyExt, Full},
    tracing::{info, warn, error},
    chrono::Utc,
    uuid::Uuid,
    fnctl_core::{Context, Event, HttpResponse},
    crate::{
        config::ServerConfig,
        error::{InvokeError, StoreError},
        invoker::{Invocation, Invoker, exec::ExecInvoker, module::ModuleInvoker, wasm::WasmLoader},
        logs::{InvocationLogEntry, InvocationLogger},
        store::{FunctionKind, FunctionStore},
    },
};

const ROUTE_PREFIX: &str = "/fn/";
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Routes `/fn/<name>` requests to the function's invoker and records the outcome.
pub struct Gateway {
    store: FunctionStore,
    logger: InvocationLogger,
    module_invoker: Arc<dyn Invoker>,
    exec_invoker: Arc<dyn Invoker>,
    quiet: bool,
}

impl Gateway {
    pub fn new(config: &ServerConfig) -> Result<Self, InvokeError> {
        let loader = WasmLoader::new(config.module_fuel)?;

        Ok(Self {
            store: FunctionStore::new(config.functions_dir()),
            logger: InvocationLogger::new(config.logs_dir()),
            module_invoker: Arc::new(ModuleInvoker::new(loader, config.module_timeout())),
            exec_invoker: Arc::new(ExecInvoker::new(config.exec_timeout())),
            quiet: config.quiet,
        })
    }

    pub fn with_invokers(mut self, module_invoker: Arc<dyn Invoker>, exec_invoker: Arc<dyn Invoker>) -> Self {
        self.module_invoker = module_invoker;
        self.exec_invoker = exec_invoker;
        self
    }

    pub fn with_quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    pub fn store(&self) -> &FunctionStore {
        &self.store
    }

    pub fn logger(&self) -> &InvocationLogger {
        &self.logger
    }

    /// Transport independent entry point: everything the HTTP service does except the socket.
    pub async fn handle(&self, method: &Method, uri: &Uri, headers: &HeaderMap, body: Bytes) -> HttpResponse {
        let name = match function_name(uri.path()) {
            Some(v) => v,
            None => return HttpResponse::text(StatusCode::NOT_FOUND, "Not Found"),
        };

        let event = headers.iter()
            .fold(
                Event::new(method.as_str(), uri.path()).with_query_string(uri.query().unwrap_or("")),
                |event, (name, value)| event.with_header(name.as_str(), &String::from_utf8_lossy(value.as_bytes())),
            )
            .with_body(String::from_utf8_lossy(&body));

        self.invoke_function(name, event).await
    }

    pub async fn invoke_function(&self, name: &str, event: Event) -> HttpResponse {
        let started_at = Instant::now();

        let record = match self.store.load(name).await {
            Ok(v) => v,
            Err(StoreError::NotFound { .. }) => {
                self.module_invoker.evict(name);
                self.exec_invoker.evict(name);
                return HttpResponse::text(StatusCode::NOT_FOUND, "Function not found");
            },
            Err(err) => {
                error!("failed to load function {name:?}: {err}");
                return HttpResponse::text(StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {err}"));
            }
        };

        let invoker = match &record.kind {
            FunctionKind::Module { .. } => &self.module_invoker,
            FunctionKind::Exec { .. } => &self.exec_invoker,
        };
        let logging_enabled = record.logging_enabled;
        let context = Context::new(name, Uuid::new_v4().to_string(), Utc::now());
        let invocation = Invocation::new(record, self.store.function_dir(name), event.clone(), context.clone());

        let (response, error) = match invoker.invoke(invocation).await {
            Ok(result) => (result.into_response(), None),
            Err(err) => {
                warn!("invocation {} of function {name:?} failed: {err}", context.invocation_id);
                (HttpResponse::text(StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {err}")), Some(err.to_string()))
            }
        };

        if logging_enabled {
            let entry = InvocationLogEntry::new(&context, &event, &response, started_at.elapsed(), error);
            if let Err(err) = self.logger.append(&entry).await {
                warn!("failed to write invocation log for function {name:?}: {err}");
            }
        }

        response
    }

    /// One access log line per request, unless the gateway is quiet.
    fn log_access(&self, method: &Method, path: &str, status: StatusCode, elapsed: Duration) {
        if !self.quiet {
            info!("{method} {path} {} {}ms", status.as_u16(), elapsed.as_millis());
        }
    }

    /// Binds to the configured address and serves until ctrl-c.
    pub async fn run(self: Arc<Self>, host: &str, port: u16) -> io::Result<()> {
        let listener = TcpListener::bind((host, port)).await?;
        info!("gateway listening on http://{}", listener.local_addr()?);

        self.serve(listener, async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!("failed to listen for ctrl-c: {err:?}");
                futures::future::pending::<()>().await;
            }
            info!("received ctrl-c, stopping gateway");
        }).await;

        Ok(())
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: impl Future<Output = ()>) {
        let graceful = GracefulShutdown::new();
        let service = GatewayService { gateway: self };
        let mut shutdown = std::pin::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                connection = listener.accept() => {
                    let (tcp, _) = match connection {
                        Ok(v) => v,
                        Err(err) => {
                            error!("failed to accept http connection: {err:?}");
                            continue;
                        }
                    };
                    let io = TokioIo::new(tcp);

                    let conn = http1::Builder::new()
                        .timer(TokioTimer::new())
                        .serve_connection(io, service.clone());
                    let fut = graceful.watch(conn);
                    tokio::task::spawn(async move {
                        if let Err(err) = fut.await {
                            if err.is_timeout() || err.is_incomplete_message() {
                                // caused by client
                            } else {
                                error!("error while handling http request: {err:?}");
                            }
                        }
                    });
                }
            }
        }

        drop(listener);
        tokio::select! {
            _ = graceful.shutdown() => info!("all connections closed"),
            _ = tokio::time::sleep(SHUTDOWN_GRACE_PERIOD) => warn!("timed out waiting for connections to close"),
        }
    }
}

#[derive(Clone)]
struct GatewayService {
    gateway: Arc<Gateway>,
}

impl hyper::service::Service<Request<Incoming>> for GatewayService {
    type Response = Response<Full<Bytes>>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let gateway = self.gateway.clone();

        Box::pin(async move {
            let started_at = Instant::now();
            let (parts, body) = req.into_parts();

            let response = match body.collect().await {
                Ok(body) => gateway.handle(&parts.method, &parts.uri, &parts.headers, body.to_bytes()).await,
                Err(err) => {
                    warn!("failed to read request body: {err:?}");
                    HttpResponse::text(StatusCode::BAD_REQUEST, "Bad Request")
                }
            };

            gateway.log_access(&parts.method, parts.uri.path(), response.status, started_at.elapsed());

            Ok(into_hyper_response(response))
        })
    }
}

fn into_hyper_response(response: HttpResponse) -> Response<Full<Bytes>> {
    let mut hyper_response = Response::new(Full::new(Bytes::from(response.body)));
    *hyper_response.status_mut() = response.status;

    let headers = hyper_response.headers_mut();
    for (name, value) in response.headers {
        match (HeaderName::try_from(name.as_str()), HeaderValue::try_from(value.as_str())) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            },
            _ => warn!("skipping invalid response header {name:?}"),
        }
    }

    hyper_response
}

/// `/fn/<name>` and `/fn/<name>/...` route to `<name>`.
fn function_name(path: &str) -> Option<&str> {
    let name = path.strip_prefix(ROUTE_PREFIX)?.split('/').next()?;
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        std::sync::atomic::{AtomicUsize, Ordering},
        futures::{StreamExt, future::BoxFuture},
        serde_json::{json, Value},
        fnctl_core::InvocationResult,
        crate::store::CONFIG_FILE_NAME,
    };

    /// Responds with the event it received, or fails when the event body says so.
    struct EchoInvoker {
        calls: AtomicUsize,
        evicted: std::sync::Mutex<Vec<String>>,
    }

    impl EchoInvoker {
        fn new() -> Arc<Self> {
            Arc::new(Self { calls: AtomicUsize::new(0), evicted: std::sync::Mutex::new(Vec::new()) })
        }

        fn evicted(&self) -> Vec<String> {
            self.evicted.lock().unwrap().clone()
        }
    }

    impl Invoker for EchoInvoker {
        fn evict(&self, name: &str) {
            self.evicted.lock().unwrap().push(name.to_owned());
        }

        fn invoke(&self, invocation: Invocation) -> BoxFuture<'_, Result<InvocationResult, InvokeError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if invocation.event.body == "fail" {
                    return Err(InvokeError::Handler { reason: "requested failure".to_owned() });
                }
                Ok(InvocationResult::from_value(json!({
                    "statusCode": 200,
                    "headers": {"X-Function": invocation.context.function},
                    "body": invocation.event,
                })).unwrap())
            })
        }
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<std::sync::Mutex<Vec<u8>>>);

    impl io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLogs {
        fn capture(&self, f: impl FnOnce()) {
            let writer = self.clone();
            let subscriber = tracing_subscriber::fmt()
                .with_writer(move || writer.clone())
                .with_ansi(false)
                .finish();
            tracing::subscriber::with_default(subscriber, f);
        }

        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        gateway: Gateway,
        module: Arc<EchoInvoker>,
        exec: Arc<EchoInvoker>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let module = EchoInvoker::new();
            let exec = EchoInvoker::new();
            let gateway = Gateway::new(&ServerConfig::new(dir.path()))
                .unwrap()
                .with_invokers(module.clone(), exec.clone())
                .with_quiet(true);

            Self { _dir: dir, gateway, module, exec }
        }

        fn add_function(&self, config: Value) {
            let name = config["name"].as_str().unwrap().to_owned();
            let dir = self.gateway.store().function_dir(&name);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join(CONFIG_FILE_NAME), config.to_string()).unwrap();
        }

        async fn request(&self, method: Method, uri: &str, body: &str) -> HttpResponse {
            let mut headers = HeaderMap::new();
            headers.append("x-tag", HeaderValue::from_static("a"));
            headers.append("x-tag", HeaderValue::from_static("b"));
            self.gateway.handle(&method, &uri.parse().unwrap(), &headers, Bytes::from(body.to_owned())).await
        }

        async fn log_entries(&self, name: &str) -> Vec<InvocationLogEntry> {
            self.gateway.logger().tail(name, false).map(|v| v.unwrap()).collect().await
        }
    }

    #[test]
    fn routing() {
        assert_eq!(Some("hello"), function_name("/fn/hello"));
        assert_eq!(Some("hello"), function_name("/fn/hello/"));
        assert_eq!(Some("hello"), function_name("/fn/hello/nested/path"));
        assert_eq!(None, function_name("/fn/"));
        assert_eq!(None, function_name("/fn"));
        assert_eq!(None, function_name("/hello"));
        assert_eq!(None, function_name("/"));
    }

    #[tokio::test]
    async fn unknown_routes_and_functions() {
        let fixture = Fixture::new();

        let response = fixture.request(Method::GET, "/other", "").await;
        assert_eq!(StatusCode::NOT_FOUND, response.status);
        assert_eq!(b"Not Found".to_vec(), response.body);

        let response = fixture.request(Method::GET, "/fn/missing", "").await;
        assert_eq!(StatusCode::NOT_FOUND, response.status);
        assert_eq!(b"Function not found".to_vec(), response.body);
    }

    #[tokio::test]
    async fn removed_function_is_evicted() {
        let fixture = Fixture::new();
        fixture.add_function(json!({"name": "mod", "kind": "module", "entrypoint": "main.wasm:handler"}));
        fixture.request(Method::GET, "/fn/mod", "").await;
        assert!(fixture.module.evicted().is_empty());

        fixture.gateway.store().remove("mod").await.unwrap();
        let response = fixture.request(Method::GET, "/fn/mod", "").await;
        assert_eq!(StatusCode::NOT_FOUND, response.status);
        assert_eq!(vec!["mod".to_owned()], fixture.module.evicted());
        assert_eq!(vec!["mod".to_owned()], fixture.exec.evicted());
    }

    #[tokio::test]
    async fn dispatch_by_kind() {
        let fixture = Fixture::new();
        fixture.add_function(json!({"name": "mod", "kind": "module", "entrypoint": "main.wasm:handler"}));
        fixture.add_function(json!({"name": "cmd", "kind": "exec", "command": "cat"}));

        fixture.request(Method::GET, "/fn/mod", "").await;
        fixture.request(Method::GET, "/fn/cmd", "").await;
        fixture.request(Method::GET, "/fn/cmd", "").await;

        assert_eq!(1, fixture.module.calls.load(Ordering::SeqCst));
        assert_eq!(2, fixture.exec.calls.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn event_is_normalized() {
        let fixture = Fixture::new();
        fixture.add_function(json!({"name": "echo", "kind": "exec", "command": "cat"}));

        let response = fixture.request(Method::POST, "/fn/echo/sub?name=a+b&x=%2F&x=last", "payload").await;
        assert_eq!(StatusCode::OK, response.status);
        assert_eq!(Some("echo"), response.header("x-function"));

        let event: Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(json!("POST"), event["method"]);
        assert_eq!(json!("/fn/echo/sub"), event["path"]);
        assert_eq!(json!({"name": "a b", "x": "last"}), event["query"]);
        assert_eq!(json!("a, b"), event["headers"]["x-tag"]);
        assert_eq!(json!("payload"), event["body"]);
    }

    #[tokio::test]
    async fn invoker_failure_is_500_and_logged() {
        let fixture = Fixture::new();
        fixture.add_function(json!({"name": "echo", "kind": "exec", "command": "cat"}));

        let response = fixture.request(Method::POST, "/fn/echo", "fail").await;
        assert_eq!(StatusCode::INTERNAL_SERVER_ERROR, response.status);
        assert!(String::from_utf8(response.body).unwrap().contains("requested failure"));

        let entries = fixture.log_entries("echo").await;
        assert_eq!(1, entries.len());
        assert_eq!(500, entries[0].status);
        assert!(entries[0].error.as_deref().unwrap().contains("requested failure"));
    }

    #[tokio::test]
    async fn config_error_is_500() {
        let fixture = Fixture::new();
        fixture.add_function(json!({"name": "broken", "kind": "python"}));

        let response = fixture.request(Method::GET, "/fn/broken", "").await;
        assert_eq!(StatusCode::INTERNAL_SERVER_ERROR, response.status);
        assert_eq!(0, fixture.exec.calls.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn logging_follows_record() {
        let fixture = Fixture::new();
        fixture.add_function(json!({"name": "echo", "kind": "exec", "command": "cat"}));

        fixture.request(Method::GET, "/fn/echo?n=1", "").await;
        fixture.gateway.store().set_logging("echo", false).await.unwrap();
        fixture.request(Method::GET, "/fn/echo?n=2", "").await;
        fixture.gateway.store().set_logging("echo", true).await.unwrap();
        fixture.request(Method::GET, "/fn/echo?n=3", "").await;

        let entries = fixture.log_entries("echo").await;
        assert_eq!(
            vec!["1", "3"],
            entries.iter().map(|v| v.query["n"].as_str()).collect::<Vec<_>>(),
        );
        assert_eq!("echo", entries[0].function);
        assert_eq!(200, entries[0].status);
        assert!(entries[0].error.is_none());
        assert_ne!(entries[0].invocation_id, entries[1].invocation_id);
    }

    #[test]
    fn access_log_unless_quiet() {
        let fixture = Fixture::new();
        let logs = CapturedLogs::default();
        logs.capture(|| {
            fixture.gateway.log_access(&Method::GET, "/fn/hidden", StatusCode::OK, Duration::from_millis(3));
        });
        assert!(!logs.contents().contains("/fn/hidden"));

        let gateway = fixture.gateway.with_quiet(false);
        logs.capture(|| {
            gateway.log_access(&Method::POST, "/fn/echo", StatusCode::CREATED, Duration::from_millis(7));
        });
        assert!(logs.contents().contains("POST /fn/echo 201 7ms"));
    }

    #[tokio::test]
    async fn invocations_are_logged_regardless_of_quiet() {
        for quiet in [true, false] {
            let mut fixture = Fixture::new();
            fixture.gateway = fixture.gateway.with_quiet(quiet);
            fixture.add_function(json!({"name": "echo", "kind": "exec", "command": "cat"}));

            fixture.request(Method::GET, "/fn/echo?n=1", "").await;
            fixture.request(Method::POST, "/fn/echo", "fail").await;

            let entries = fixture.log_entries("echo").await;
            assert_eq!(vec![200, 500], entries.iter().map(|v| v.status).collect::<Vec<_>>(), "quiet: {quiet}");
        }
    }

    #[test]
    fn invalid_headers_are_skipped() {
        let response = into_hyper_response(
            HttpResponse::new(StatusCode::CREATED)
                .with_header("x-ok", "1")
                .with_header("bad header", "1")
                .with_header("x-bad-value", "line\nbreak")
        );
        assert_eq!(StatusCode::CREATED, response.status());
        assert_eq!(response.headers()["x-ok"], "1");
        assert_eq!(1, response.headers().len());
    }
}
