use std::{
    net::TcpListener,
    sync::{Arc, mpsc},
    thread,
    time::{Duration, Instant},
};

use relay::{
    CallOptions, ClientConfig, MethodDescriptor, RemoteError, Request, Runtime, RpcClient,
    RpcError, RpcServer, ServerConfig, ServerHandle, Status, interceptor::RateLimitInterceptor,
    protocol,
};
use tempdir::TempDir;

fn echo_server(runtime: &Runtime) -> ServerHandle {
    RpcServer::builder("127.0.0.1:0")
        .config(ServerConfig::default().workers(4))
        .register("echo", "Echo", |req: &Request| -> Result<Vec<u8>, RemoteError> {
            Ok(req.payload.clone())
        })
        .register("echo", "Slow", |req: &Request| -> Result<Vec<u8>, RemoteError> {
            thread::sleep(Duration::from_millis(300));
            Ok(req.payload.clone())
        })
        .register("echo", "Fail", |_: &Request| -> Result<Vec<u8>, RemoteError> {
            Err(RemoteError::application("handler refused"))
        })
        .start(runtime)
        .unwrap()
}

fn client(runtime: &Runtime, server: &ServerHandle, config: ClientConfig) -> RpcClient {
    let url = format!("list://{}", server.local_addr());
    RpcClient::builder(url).config(config).build(runtime).unwrap()
}

fn eventually(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

fn named_server(runtime: &Runtime, url: &str, name: &'static str) -> ServerHandle {
    RpcServer::builder("127.0.0.1:0")
        .register("greeter", "Who", move |_: &Request| -> Result<Vec<u8>, RemoteError> {
            Ok(name.as_bytes().to_vec())
        })
        .advertise(url)
        .start(runtime)
        .unwrap()
}

fn dead_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[test]
fn echo_over_standard() {
    let runtime = Runtime::default();
    let server = echo_server(&runtime);
    let client = client(&runtime, &server, ClientConfig::default());
    let echo = MethodDescriptor::new("echo", "Echo");

    let future = client
        .invoke_async(&echo, b"hello world".to_vec(), CallOptions::new())
        .unwrap();
    let id = future.log_id();
    let response = future.wait().unwrap();
    assert_eq!(response.log_id, id);
    assert_eq!(response.payload, b"hello world");
    assert_eq!(client.pending(), 0);
}

#[test]
fn echo_over_every_json_protocol() {
    let runtime = Runtime::default();
    let server = echo_server(&runtime);
    let echo = MethodDescriptor::new("echo", "Echo");

    for id in [protocol::STANDARD, protocol::NSHEAD_JSON, protocol::PUSH, protocol::DUBBO] {
        let client = client(&runtime, &server, ClientConfig::default().protocol(id));
        let reply: String = client
            .call(&echo, "hello world", CallOptions::new())
            .unwrap_or_else(|e| panic!("protocol {id}: {e}"));
        assert_eq!(reply, "hello world");
        client.shutdown();
    }
}

#[test]
fn concurrent_calls_share_the_pool() {
    let runtime = Runtime::default();
    let server = echo_server(&runtime);
    let client = client(&runtime, &server, ClientConfig::default());
    let echo = MethodDescriptor::new("echo", "Echo");

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let client = client.clone();
            let echo = echo.clone();
            thread::spawn(move || {
                let reply: u32 = client.call(&echo, &i, CallOptions::new()).unwrap();
                assert_eq!(reply, i);
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn fails_over_to_a_live_endpoint() {
    let runtime = Runtime::default();
    let server = echo_server(&runtime);
    let url = format!("list://127.0.0.1:{},{}", dead_port(), server.local_addr());
    let client = RpcClient::builder(url)
        .config(ClientConfig::default().max_attempts(2))
        .build(&runtime)
        .unwrap();
    let echo = MethodDescriptor::new("echo", "Echo");

    for _ in 0..4 {
        let response = client
            .invoke(&echo, b"\"ping\"".to_vec(), CallOptions::new())
            .unwrap();
        assert_eq!(response.payload, b"\"ping\"");
    }
}

#[test]
fn no_live_endpoint_is_a_connection_error() {
    let runtime = Runtime::default();
    let url = format!("list://127.0.0.1:{}", dead_port());
    let client = RpcClient::builder(url).build(&runtime).unwrap();
    let err = client
        .invoke(&MethodDescriptor::new("echo", "Echo"), Vec::new(), CallOptions::new())
        .unwrap_err();
    assert!(err.is_retryable(), "{err}");
}

#[test]
fn unlisted_service_has_no_provider() {
    let dir = TempDir::new("relay-naming").unwrap();
    let url = format!("file://{}?interval_ms=50", dir.path().display());
    let runtime = Runtime::default();
    let client = RpcClient::builder(url).build(&runtime).unwrap();

    assert!(client.endpoints("ghost").unwrap().is_empty());
    let err = client
        .invoke(&MethodDescriptor::new("ghost", "Echo"), Vec::new(), CallOptions::new())
        .unwrap_err();
    assert!(matches!(err, RpcError::NoProvider { ref service } if service == "ghost"), "{err}");
    assert_eq!(client.pending(), 0);
}

#[test]
fn withdrawn_endpoints_are_never_selected() {
    let dir = TempDir::new("relay-naming").unwrap();
    let url = format!("file://{}?interval_ms=20", dir.path().display());
    let runtime = Runtime::default();
    let leaving = named_server(&runtime, &url, "leaving");
    let staying = named_server(&runtime, &url, "staying");

    // a single attempt means a pick of the withdrawn endpoint would surface
    let client = RpcClient::builder(url)
        .config(ClientConfig::default().max_attempts(1))
        .build(&runtime)
        .unwrap();
    assert!(eventually(|| client.endpoints("greeter").unwrap().len() == 2));

    leaving.shutdown();
    let port = staying.local_addr().port();
    assert!(eventually(|| {
        let endpoints = client.endpoints("greeter").unwrap();
        endpoints.len() == 1 && endpoints[0].port == port
    }));

    let who = MethodDescriptor::new("greeter", "Who");
    for _ in 0..10 {
        let response = client.invoke(&who, Vec::new(), CallOptions::new()).unwrap();
        assert_eq!(response.payload, b"staying");
    }
}

#[test]
fn unencodable_payloads_are_serialization_errors() {
    let runtime = Runtime::default();
    let server = echo_server(&runtime);
    for id in [protocol::NSHEAD_JSON, protocol::DUBBO] {
        let client = client(&runtime, &server, ClientConfig::default().protocol(id));
        let err = client
            .invoke(&MethodDescriptor::new("echo", "Echo"), vec![0xff, 0x00], CallOptions::new())
            .unwrap_err();
        assert!(matches!(err, RpcError::Serialization(_)), "protocol {id}: {err}");
        assert!(!err.is_retryable());
        assert_eq!(client.pending(), 0);
    }
}

#[test]
fn remote_failures_carry_their_status() {
    let runtime = Runtime::default();
    let server = echo_server(&runtime);
    let client = client(&runtime, &server, ClientConfig::default());

    let err = client
        .invoke(&MethodDescriptor::new("echo", "Nope"), Vec::new(), CallOptions::new())
        .unwrap_err();
    assert_eq!(err.status(), Status::MethodNotFound);

    let err = client
        .invoke(&MethodDescriptor::new("echo", "Fail"), Vec::new(), CallOptions::new())
        .unwrap_err();
    match err {
        RpcError::Remote { status, message } => {
            assert_eq!(status, Status::ApplicationError);
            assert_eq!(message, "handler refused");
        }
        other => panic!("unexpected {other}"),
    }
}

#[test]
fn rate_limited_calls_never_leave() {
    let runtime = Runtime::default();
    let server = echo_server(&runtime);
    let client = RpcClient::builder(format!("list://{}", server.local_addr()))
        .interceptor(Arc::new(RateLimitInterceptor::new(1, Duration::from_secs(60))))
        .build(&runtime)
        .unwrap();
    let echo = MethodDescriptor::new("echo", "Echo");

    assert!(client.invoke(&echo, b"1".to_vec(), CallOptions::new()).is_ok());
    let err = client
        .invoke(&echo, b"2".to_vec(), CallOptions::new())
        .unwrap_err();
    assert!(matches!(err, RpcError::RateLimited { ref interceptor } if interceptor == "rate_limit"));
    assert_eq!(client.pending(), 0);
}

#[test]
fn slow_calls_time_out() {
    let runtime = Runtime::default();
    let server = echo_server(&runtime);
    let client = client(&runtime, &server, ClientConfig::default());

    let err = client
        .invoke(
            &MethodDescriptor::new("echo", "Slow"),
            b"late".to_vec(),
            CallOptions::new().timeout(Duration::from_millis(50)),
        )
        .unwrap_err();
    assert!(matches!(err, RpcError::Timeout { .. }), "{err}");
    assert_eq!(client.pending(), 0);
}

#[test]
fn callbacks_run_once() {
    let runtime = Runtime::default();
    let server = echo_server(&runtime);
    let client = client(&runtime, &server, ClientConfig::default());

    let (tx, rx) = mpsc::channel();
    client
        .invoke_with_callback(
            &MethodDescriptor::new("echo", "Echo"),
            b"cb".to_vec(),
            CallOptions::new(),
            move |result| tx.send(result).unwrap(),
        )
        .unwrap();
    let response = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    assert_eq!(response.payload, b"cb");
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn pushes_reach_push_clients() {
    let runtime = Runtime::default();
    let server = echo_server(&runtime);
    let client = client(
        &runtime,
        &server,
        ClientConfig::default().protocol(protocol::PUSH),
    );
    let (tx, rx) = mpsc::channel();
    client.on_push("echo", move |push| {
        let _ = tx.send(push);
    });

    // the server learns the protocol from the first request
    client
        .invoke(&MethodDescriptor::new("echo", "Echo"), b"hi".to_vec(), CallOptions::new())
        .unwrap();
    assert_eq!(server.push("echo", "Tick", b"tock".to_vec()).unwrap(), 1);

    let push = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(push.method, "Tick");
    assert_eq!(push.payload, b"tock");
}

#[test]
fn advertised_services_are_discoverable() {
    let dir = TempDir::new("relay-naming").unwrap();
    let url = format!("file://{}?interval_ms=50", dir.path().display());
    let runtime = Runtime::default();
    let server = RpcServer::builder("127.0.0.1:0")
        .register("greeter", "Hello", |req: &Request| -> Result<Vec<u8>, RemoteError> {
            let mut reply = b"hello ".to_vec();
            reply.extend_from_slice(&req.payload);
            Ok(reply)
        })
        .advertise(url.clone())
        .start(&runtime)
        .unwrap();

    let client = RpcClient::builder(url).build(&runtime).unwrap();
    let endpoints = client.endpoints("greeter").unwrap();
    assert_eq!(endpoints.len(), 1);
    assert_eq!(endpoints[0].port, server.local_addr().port());

    let response = client
        .invoke(&MethodDescriptor::new("greeter", "Hello"), b"world".to_vec(), CallOptions::new())
        .unwrap();
    assert_eq!(response.payload, b"hello world");
}

#[test]
fn shutdown_closes_connections() {
    let runtime = Runtime::default();
    let server = echo_server(&runtime);
    let client = client(&runtime, &server, ClientConfig::default());
    client
        .invoke(&MethodDescriptor::new("echo", "Echo"), b"x".to_vec(), CallOptions::new())
        .unwrap();
    assert_eq!(server.connections(), 1);

    server.shutdown();
    client.shutdown();
    let err = client
        .invoke(&MethodDescriptor::new("echo", "Echo"), b"x".to_vec(), CallOptions::new())
        .unwrap_err();
    assert!(matches!(err, RpcError::Cancelled { .. }), "{err}");
}
