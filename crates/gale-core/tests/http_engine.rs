//! End-to-end HTTP tests against a live engine, using raw TCP clients.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use gale_core::{Dispatcher, Engine, EngineConfig, Error, MiddlewareDecision};

type Handler = Box<dyn Fn(&Engine, u64) + Send + Sync>;
type Hook = Box<dyn Fn(&Engine, u64) -> MiddlewareDecision + Send + Sync>;

/// Scriptable dispatcher: tests register closures per handler and
/// middleware name, and every invocation is recorded.
#[derive(Default)]
struct TestDispatcher {
    engine: OnceLock<Engine>,
    handlers: Mutex<HashMap<String, Handler>>,
    hooks: Mutex<HashMap<String, Hook>>,
    invoked: Mutex<Vec<String>>,
}

impl TestDispatcher {
    fn on(&self, name: &str, handler: impl Fn(&Engine, u64) + Send + Sync + 'static) {
        self.handlers
            .lock()
            .insert(name.to_string(), Box::new(handler));
    }

    fn hook(
        &self,
        name: &str,
        hook: impl Fn(&Engine, u64) -> MiddlewareDecision + Send + Sync + 'static,
    ) {
        self.hooks.lock().insert(name.to_string(), Box::new(hook));
    }

    fn engine(&self) -> &Engine {
        self.engine.get().expect("engine wired into dispatcher")
    }

    fn invoked(&self) -> Vec<String> {
        self.invoked.lock().clone()
    }
}

impl Dispatcher for TestDispatcher {
    fn invoke_handler(&self, handler: &str, request_id: u64) -> bool {
        self.invoked.lock().push(handler.to_string());
        let handlers = self.handlers.lock();
        match handlers.get(handler) {
            Some(f) => {
                f(self.engine(), request_id);
                true
            }
            None => false,
        }
    }

    fn invoke_middleware(&self, middleware: &str, request_id: u64) -> MiddlewareDecision {
        self.invoked.lock().push(format!("mw:{middleware}"));
        let hooks = self.hooks.lock();
        match hooks.get(middleware) {
            Some(f) => f(self.engine(), request_id),
            None => MiddlewareDecision::Continue,
        }
    }
}

fn setup() -> (Engine, Arc<TestDispatcher>) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let engine = Engine::new().expect("engine");
    let dispatcher = Arc::new(TestDispatcher::default());
    let _ = dispatcher.engine.set(engine.clone());
    engine.set_dispatcher(dispatcher.clone());
    (engine, dispatcher)
}

/// Send one raw request with `Connection: close` and return the whole
/// response text.
fn roundtrip(port: u16, raw: &str) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    stream.write_all(raw.as_bytes()).expect("write request");
    let mut response = String::new();
    stream.read_to_string(&mut response).expect("read response");
    response
}

fn get(port: u16, target: &str) -> String {
    roundtrip(
        port,
        &format!("GET {target} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n"),
    )
}

fn body_of(response: &str) -> &str {
    response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body)
        .unwrap_or("")
}

/// Read one response off a keep-alive connection using Content-Length.
fn read_response(reader: &mut BufReader<TcpStream>) -> (String, String) {
    let mut head = String::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).expect("read header line");
        assert!(n > 0, "connection closed mid-headers");
        if line == "\r\n" {
            break;
        }
        head.push_str(&line);
    }
    let length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.eq_ignore_ascii_case("content-length") {
                value.trim().parse::<usize>().ok()
            } else {
                None
            }
        })
        .unwrap_or(0);
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).expect("read body");
    (head, String::from_utf8_lossy(&body).into_owned())
}

#[test]
fn test_literal_route_beats_parameter() {
    let (engine, dispatcher) = setup();
    let server = engine.create_server(0).unwrap();
    let port = engine.server_port(server).unwrap();

    engine.add_route(server, "GET", "/items/:id", "item").unwrap();
    engine.add_route(server, "GET", "/items/special", "special").unwrap();

    dispatcher.on("item", |engine, id| {
        let item = engine.route_param(id, "id");
        engine
            .send_response(id, 200, "text/plain", &format!("item {item}"))
            .unwrap();
    });
    dispatcher.on("special", |engine, id| {
        engine.send_response(id, 200, "text/plain", "special!").unwrap();
    });

    let special = get(port, "/items/special");
    assert!(special.starts_with("HTTP/1.1 200"));
    assert_eq!(body_of(&special), "special!");

    let by_id = get(port, "/items/42");
    assert_eq!(body_of(&by_id), "item 42");

    engine.stop_server(server).unwrap();
}

#[test]
fn test_query_params_decode_and_last_wins() {
    let (engine, dispatcher) = setup();
    let server = engine.create_server(0).unwrap();
    let port = engine.server_port(server).unwrap();

    engine.add_route(server, "GET", "/search", "search").unwrap();
    dispatcher.on("search", |engine, id| {
        let q = engine.query_param(id, "q");
        engine.send_response(id, 200, "text/plain", &q).unwrap();
    });

    let last_wins = get(port, "/search?q=a%20b&q=c");
    assert_eq!(body_of(&last_wins), "c");

    let decoded = get(port, "/search?q=a%20b");
    assert_eq!(body_of(&decoded), "a b");

    engine.stop_server(server).unwrap();
}

#[test]
fn test_unrouted_path_answers_404() {
    let (engine, _dispatcher) = setup();
    let server = engine.create_server(0).unwrap();
    let port = engine.server_port(server).unwrap();

    let response = get(port, "/nothing/here");
    assert!(response.starts_with("HTTP/1.1 404"));

    engine.stop_server(server).unwrap();
}

#[test]
fn test_removed_route_stops_matching() {
    let (engine, dispatcher) = setup();
    let server = engine.create_server(0).unwrap();
    let port = engine.server_port(server).unwrap();

    engine.add_route(server, "GET", "/gone", "gone").unwrap();
    dispatcher.on("gone", |engine, id| {
        engine.send_response(id, 200, "text/plain", "here").unwrap();
    });

    assert!(get(port, "/gone").starts_with("HTTP/1.1 200"));

    engine.remove_route(server, "GET", "/gone").unwrap();
    assert!(get(port, "/gone").starts_with("HTTP/1.1 404"));

    // Removing again is a no-op, not an error.
    engine.remove_route(server, "GET", "/gone").unwrap();

    engine.stop_server(server).unwrap();
}

#[test]
fn test_second_terminal_send_is_rejected() {
    let (engine, dispatcher) = setup();
    let server = engine.create_server(0).unwrap();
    let port = engine.server_port(server).unwrap();

    let second_result: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));
    let captured = Arc::clone(&second_result);

    engine.add_route(server, "GET", "/twice", "twice").unwrap();
    dispatcher.on("twice", move |engine, id| {
        engine.send_response(id, 200, "text/plain", "first").unwrap();
        *captured.lock() = engine.send_response(id, 500, "text/plain", "second").err();
    });

    let response = get(port, "/twice");
    assert!(response.starts_with("HTTP/1.1 200"));
    assert_eq!(body_of(&response), "first");

    assert!(matches!(
        second_result.lock().take(),
        Some(Error::ResponseAlreadySent { .. })
    ));

    engine.stop_server(server).unwrap();
}

#[test]
fn test_middleware_runs_in_order_and_short_circuits() {
    let (engine, dispatcher) = setup();
    let server = engine.create_server(0).unwrap();
    let port = engine.server_port(server).unwrap();

    engine.add_route(server, "GET", "/private", "private").unwrap();
    engine.use_middleware(server, "log").unwrap();
    engine.use_middleware(server, "auth").unwrap();

    dispatcher.hook("auth", |engine, id| {
        if engine.request_header(id, "authorization").is_empty() {
            engine
                .send_response(id, 401, "text/plain", "unauthorized")
                .unwrap();
            MiddlewareDecision::ShortCircuit
        } else {
            MiddlewareDecision::Continue
        }
    });
    dispatcher.on("private", |engine, id| {
        engine.send_response(id, 200, "text/plain", "secret").unwrap();
    });

    // Without credentials the chain stops at "auth" and the handler
    // never runs.
    let denied = get(port, "/private");
    assert!(denied.starts_with("HTTP/1.1 401"));
    assert_eq!(body_of(&denied), "unauthorized");
    assert_eq!(dispatcher.invoked(), vec!["mw:log", "mw:auth"]);

    let allowed = roundtrip(
        port,
        "GET /private HTTP/1.1\r\nHost: localhost\r\nAuthorization: Bearer x\r\nConnection: close\r\n\r\n",
    );
    assert!(allowed.starts_with("HTTP/1.1 200"));
    assert_eq!(body_of(&allowed), "secret");
    assert_eq!(
        dispatcher.invoked(),
        vec!["mw:log", "mw:auth", "mw:log", "mw:auth", "private"]
    );

    engine.stop_server(server).unwrap();
}

#[test]
fn test_response_headers_keep_duplicates() {
    let (engine, dispatcher) = setup();
    let server = engine.create_server(0).unwrap();
    let port = engine.server_port(server).unwrap();

    engine.add_route(server, "GET", "/cookies", "cookies").unwrap();
    dispatcher.on("cookies", |engine, id| {
        engine.set_response_header(id, "Set-Cookie", "a=1").unwrap();
        engine.set_response_header(id, "Set-Cookie", "b=2").unwrap();
        engine.send_response(id, 200, "text/plain", "ok").unwrap();
    });

    let response = get(port, "/cookies").to_ascii_lowercase();
    assert!(response.contains("set-cookie: a=1"));
    assert!(response.contains("set-cookie: b=2"));

    engine.stop_server(server).unwrap();
}

#[test]
fn test_request_body_and_headers_are_readable() {
    let (engine, dispatcher) = setup();
    let server = engine.create_server(0).unwrap();
    let port = engine.server_port(server).unwrap();

    engine.add_route(server, "POST", "/echo", "echo").unwrap();
    dispatcher.on("echo", |engine, id| {
        let body = engine.request_body(id);
        let kind = engine.request_header(id, "X-Kind");
        let method = engine.request_method(id);
        engine
            .send_response(id, 200, "text/plain", &format!("{method} {kind} {body}"))
            .unwrap();
    });

    let response = roundtrip(
        port,
        "POST /echo HTTP/1.1\r\nHost: localhost\r\nX-Kind: demo\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello",
    );
    assert_eq!(body_of(&response), "POST demo hello");

    engine.stop_server(server).unwrap();
}

#[test]
fn test_oversized_body_answers_413() {
    let _ = tracing_subscriber::fmt().try_init();
    let engine = Engine::with_config(EngineConfig {
        max_body_size: 64,
        ..EngineConfig::default()
    })
    .unwrap();
    let dispatcher = Arc::new(TestDispatcher::default());
    let _ = dispatcher.engine.set(engine.clone());
    engine.set_dispatcher(dispatcher.clone());

    let server = engine.create_server(0).unwrap();
    let port = engine.server_port(server).unwrap();
    engine.add_route(server, "POST", "/upload", "upload").unwrap();

    let body = "x".repeat(1024);
    let response = roundtrip(
        port,
        &format!(
            "POST /upload HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        ),
    );
    assert!(response.starts_with("HTTP/1.1 413"));

    engine.stop_server(server).unwrap();
}

#[test]
fn test_keep_alive_serves_requests_in_order() {
    let (engine, dispatcher) = setup();
    let server = engine.create_server(0).unwrap();
    let port = engine.server_port(server).unwrap();

    engine.add_route(server, "GET", "/n/:i", "n").unwrap();
    dispatcher.on("n", |engine, id| {
        let i = engine.route_param(id, "i");
        engine.send_response(id, 200, "text/plain", &i).unwrap();
    });

    let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let mut writer = stream.try_clone().unwrap();
    let mut reader = BufReader::new(stream);

    writer
        .write_all(b"GET /n/1 HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let (_, first) = read_response(&mut reader);
    assert_eq!(first, "1");

    writer
        .write_all(b"GET /n/2 HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .unwrap();
    let (_, second) = read_response(&mut reader);
    assert_eq!(second, "2");

    engine.stop_server(server).unwrap();
}

#[test]
fn test_file_response_infers_content_type() {
    let (engine, dispatcher) = setup();
    let server = engine.create_server(0).unwrap();
    let port = engine.server_port(server).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let file_path = dir.path().join("data.json");
    std::fs::write(&file_path, r#"{"ok":true}"#).unwrap();
    let file_path = file_path.to_str().unwrap().to_string();

    engine.add_route(server, "GET", "/data", "data").unwrap();
    engine.add_route(server, "GET", "/missing", "missing").unwrap();

    let served = file_path.clone();
    dispatcher.on("data", move |engine, id| {
        engine.send_file_response(id, &served).unwrap();
    });
    dispatcher.on("missing", |engine, id| {
        engine.send_file_response(id, "/no/such/file.txt").unwrap();
    });

    let response = get(port, "/data");
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.to_ascii_lowercase().contains("content-type: application/json"));
    assert_eq!(body_of(&response), r#"{"ok":true}"#);

    // A missing file is a 404 on the wire, not an error to the caller.
    let missing = get(port, "/missing");
    assert!(missing.starts_with("HTTP/1.1 404"));
    assert_eq!(body_of(&missing), "File not found");

    engine.stop_server(server).unwrap();
}

#[test]
fn test_unregistered_handler_answers_500() {
    let (engine, _dispatcher) = setup();
    let server = engine.create_server(0).unwrap();
    let port = engine.server_port(server).unwrap();

    engine.add_route(server, "GET", "/orphan", "no-such-handler").unwrap();

    let response = get(port, "/orphan");
    assert!(response.starts_with("HTTP/1.1 500"));

    engine.stop_server(server).unwrap();
}

#[test]
fn test_silent_handler_answers_504() {
    let _ = tracing_subscriber::fmt().try_init();
    let engine = Engine::with_config(EngineConfig {
        request_timeout: Duration::from_millis(200),
        ..EngineConfig::default()
    })
    .unwrap();
    let dispatcher = Arc::new(TestDispatcher::default());
    let _ = dispatcher.engine.set(engine.clone());
    engine.set_dispatcher(dispatcher.clone());

    let server = engine.create_server(0).unwrap();
    let port = engine.server_port(server).unwrap();

    engine.add_route(server, "GET", "/silent", "silent").unwrap();
    dispatcher.on("silent", |_engine, _id| {
        // Accepts the dispatch but never sends a response.
    });

    let response = get(port, "/silent");
    assert!(response.starts_with("HTTP/1.1 504"));

    engine.stop_server(server).unwrap();
}

#[test]
fn test_stop_force_closes_stalled_request() {
    let _ = tracing_subscriber::fmt().try_init();
    let engine = Engine::with_config(EngineConfig {
        request_timeout: Duration::from_secs(30),
        shutdown_grace: Duration::from_millis(200),
        ..EngineConfig::default()
    })
    .unwrap();
    let dispatcher = Arc::new(TestDispatcher::default());
    let _ = dispatcher.engine.set(engine.clone());
    engine.set_dispatcher(dispatcher.clone());

    let server = engine.create_server(0).unwrap();
    let port = engine.server_port(server).unwrap();

    let stalled_id: Arc<Mutex<Option<u64>>> = Arc::new(Mutex::new(None));
    let captured = Arc::clone(&stalled_id);
    engine.add_route(server, "GET", "/stall", "stall").unwrap();
    dispatcher.on("stall", move |_engine, id| {
        *captured.lock() = Some(id);
    });

    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream
        .write_all(b"GET /stall HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    // Make sure the request is parked inside the pipeline before the
    // stop begins.
    for _ in 0..200 {
        if stalled_id.lock().is_some() {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    let id = stalled_id.lock().take().expect("request dispatched");

    engine.stop_server(server).unwrap();
    let stopped_at = Instant::now();

    // The stalled connection dies with the server; nobody waits out the
    // 30s request timeout for a 504 the peer can no longer receive.
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut leftover = Vec::new();
    let outcome = stream.read_to_end(&mut leftover);
    assert!(leftover.is_empty(), "unexpected late bytes: {leftover:?}");
    match outcome {
        // EOF and a reset both prove the transport died; only a silent
        // socket (read timeout) means it survived the stop.
        Ok(_) => {}
        Err(error) => assert_eq!(error.kind(), std::io::ErrorKind::ConnectionReset),
    }
    assert!(stopped_at.elapsed() < Duration::from_secs(2));

    // Its context went with it.
    assert!(matches!(
        engine.send_response(id, 200, "text/plain", "late"),
        Err(Error::InvalidHandle)
    ));
}

#[test]
fn test_busy_port_reports_port_unavailable() {
    let (engine, _dispatcher) = setup();
    let server = engine.create_server(0).unwrap();
    let port = engine.server_port(server).unwrap();

    match engine.create_server(port) {
        Err(Error::PortUnavailable { port: reported, .. }) => assert_eq!(reported, port),
        other => panic!("expected PortUnavailable, got {other:?}"),
    }

    engine.stop_server(server).unwrap();
}

#[test]
fn test_port_is_reusable_after_stop() {
    let (engine, _dispatcher) = setup();
    let first = engine.create_server(0).unwrap();
    let port = engine.server_port(first).unwrap();
    engine.stop_server(first).unwrap();

    let second = engine.create_server(port).unwrap();
    assert!(engine.is_running(second));
    assert_eq!(engine.server_port(second).unwrap(), port);

    engine.stop_server(second).unwrap();
}

#[test]
fn test_stale_handle_stays_invalid_after_reuse() {
    let (engine, _dispatcher) = setup();
    let first = engine.create_server(0).unwrap();
    engine.stop_server(first).unwrap();

    // The next server may land in the same table slot; the stale handle
    // must not reach it.
    let second = engine.create_server(0).unwrap();
    assert_ne!(first.raw(), second.raw());
    assert!(!engine.is_running(first));
    assert!(matches!(engine.server_port(first), Err(Error::InvalidHandle)));
    assert!(matches!(
        engine.add_route(first, "GET", "/x", "h"),
        Err(Error::InvalidHandle)
    ));
    assert!(engine.is_running(second));

    engine.stop_server(second).unwrap();
}

#[test]
fn test_engine_shutdown_stops_every_server() {
    let (engine, dispatcher) = setup();
    let first = engine.create_server(0).unwrap();
    let second = engine.create_server(0).unwrap();
    let first_port = engine.server_port(first).unwrap();
    let second_port = engine.server_port(second).unwrap();

    engine.add_route(first, "GET", "/a", "a").unwrap();
    engine.add_route(second, "GET", "/b", "b").unwrap();
    dispatcher.on("a", |engine, id| {
        engine.send_response(id, 200, "text/plain", "a").unwrap();
    });
    dispatcher.on("b", |engine, id| {
        engine.send_response(id, 200, "text/plain", "b").unwrap();
    });

    assert!(get(first_port, "/a").starts_with("HTTP/1.1 200"));
    assert!(get(second_port, "/b").starts_with("HTTP/1.1 200"));

    engine.shutdown();

    assert!(!engine.is_running(first));
    assert!(!engine.is_running(second));
    assert!(matches!(engine.stop_server(first), Err(Error::InvalidHandle)));
    assert!(matches!(engine.stop_server(second), Err(Error::InvalidHandle)));

    // Both listeners are gone; the engine itself stays serviceable.
    let replacement = engine.create_server(first_port).unwrap();
    assert!(engine.is_running(replacement));
    engine.stop_server(replacement).unwrap();
}
