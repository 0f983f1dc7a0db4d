//! End-to-end RPC tests over in-memory transports.
//!
//! Every test wires a real client and server through `Duplex::pair`, so the
//! full stack runs: framing, handshake, adapters, registry and middleware.

use std::sync::Arc;
use std::time::{Duration, Instant};

use avrio::{
    discover_protocol, factory, CallOptions, ChannelOptions, Client, ClientOptions, Connection,
    Dialect, Duplex, ErrorCode, RpcError, Server, ServerOptions, Service, Value,
};
use parking_lot::Mutex;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

const PING: &str = r#"{
    "protocol": "Ping",
    "messages": {"ping": {"request": [], "response": "string"}}
}"#;

const ECHO: &str = r#"{
    "protocol": "Echo",
    "messages": {
        "echo": {
            "request": [{"name": "s", "type": "string"}],
            "response": "string"
        }
    }
}"#;

const SLOW: &str = r#"{
    "protocol": "Slow",
    "messages": {
        "slow": {
            "request": [{"name": "ms", "type": "int"}],
            "response": "int"
        }
    }
}"#;

const GREET: &str = r#"{
    "protocol": "Greeter",
    "messages": {
        "greet": {
            "request": [{"name": "name", "type": "string"}],
            "one-way": true
        }
    }
}"#;

fn field(request: &Value, name: &str) -> Value {
    let Value::Record(fields) = request else {
        panic!("request is not a record: {:?}", request);
    };
    fields
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.clone())
        .unwrap_or_else(|| panic!("missing field {:?}", name))
}

/// Wire a client and a server together over one in-memory transport.
fn connect(client: &Client, server: &Server) {
    let (cd, sd) = Duplex::pair();
    server.create_channel(sd, ChannelOptions::default());
    client.create_channel(cd, ChannelOptions::default());
}

#[tokio::test]
async fn ping_returns_pong() {
    init_tracing();
    let service = Service::from_json(PING).unwrap();
    let server = Server::new(service.clone(), ServerOptions::default());
    server
        .on_message("ping", |_ctx, _req| async { Ok(Value::String("pong".into())) })
        .unwrap();

    let client = Client::new(service, ClientOptions::default());
    connect(&client, &server);

    let out = client
        .emit_message("ping", Value::Record(vec![]), CallOptions::default())
        .await
        .unwrap();
    assert_eq!(out, Value::String("pong".into()));
}

#[tokio::test]
async fn echo_round_trips_the_request() {
    init_tracing();
    let service = Service::from_json(ECHO).unwrap();
    let server = Server::new(service.clone(), ServerOptions::default());
    server
        .on_message("echo", |_ctx, req| async move { Ok(field(&req, "s")) })
        .unwrap();

    let client = Client::new(service, ClientOptions::default());
    connect(&client, &server);

    let out = client
        .emit_message(
            "echo",
            Value::Record(vec![("s".into(), Value::String("hi".into()))]),
            CallOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(out, Value::String("hi".into()));
}

#[tokio::test]
async fn interleaved_responses_resolve_the_right_callers() {
    init_tracing();
    let service = Service::from_json(SLOW).unwrap();
    let server = Server::new(service.clone(), ServerOptions::default());
    server
        .on_message("slow", |_ctx, req| async move {
            let Value::Int(ms) = field(&req, "ms") else {
                return Err(RpcError::new(ErrorCode::InvalidRequest, "ms must be an int"));
            };
            tokio::time::sleep(Duration::from_millis(ms as u64)).await;
            Ok(Value::Int(ms))
        })
        .unwrap();

    let client = Client::new(service, ClientOptions::default());
    connect(&client, &server);

    let call = |ms: i32| {
        let client = client.clone();
        async move {
            client
                .emit_message(
                    "slow",
                    Value::Record(vec![("ms".into(), Value::Int(ms))]),
                    CallOptions::default(),
                )
                .await
        }
    };

    let started = Instant::now();
    let (a, b, c) = tokio::join!(call(300), call(100), call(200));
    let elapsed = started.elapsed();

    // Responses come back out of order but each caller sees its own value.
    assert_eq!(a.unwrap(), Value::Int(300));
    assert_eq!(b.unwrap(), Value::Int(100));
    assert_eq!(c.unwrap(), Value::Int(200));
    // The three calls overlapped; run serially they would take 600ms.
    assert!(elapsed < Duration::from_millis(500), "took {:?}", elapsed);
}

#[tokio::test]
async fn timed_out_call_never_fires_twice() {
    init_tracing();
    let service = Service::from_json(SLOW).unwrap();
    let server = Server::new(service.clone(), ServerOptions::default());
    server
        .on_message("slow", |_ctx, req| async move {
            let Value::Int(ms) = field(&req, "ms") else {
                return Err(RpcError::new(ErrorCode::InvalidRequest, "ms must be an int"));
            };
            tokio::time::sleep(Duration::from_millis(ms as u64)).await;
            Ok(Value::Int(ms))
        })
        .unwrap();

    let client = Client::new(service, ClientOptions::default());
    connect(&client, &server);

    let err = client
        .emit_message(
            "slow",
            Value::Record(vec![("ms".into(), Value::Int(200))]),
            CallOptions::default().timeout(Duration::from_millis(40)),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Timeout);

    // The late response is discarded and the channel keeps working.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let out = client
        .emit_message(
            "slow",
            Value::Record(vec![("ms".into(), Value::Int(1))]),
            CallOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(out, Value::Int(1));
}

#[tokio::test]
async fn one_way_messages_run_in_order_with_no_reply() {
    init_tracing();
    let service = Service::from_json(GREET).unwrap();
    let server = Server::new(service.clone(), ServerOptions::default());
    let seen = Arc::new(Mutex::new(Vec::<String>::new()));
    let sink = seen.clone();
    server
        .on_message("greet", move |_ctx, req| {
            let sink = sink.clone();
            async move {
                if let Value::String(name) = field(&req, "name") {
                    sink.lock().push(name);
                }
                Ok(Value::Null)
            }
        })
        .unwrap();

    let client = Client::new(service, ClientOptions::default());
    connect(&client, &server);

    for name in ["a", "b", "c"] {
        let out = client
            .emit_message(
                "greet",
                Value::Record(vec![("name".into(), Value::String(name.into()))]),
                CallOptions::default(),
            )
            .await
            .unwrap();
        // A one-way call completes locally with no payload.
        assert_eq!(out, Value::Null);
    }

    // Wait for the server to drain the three requests.
    let deadline = Instant::now() + Duration::from_secs(2);
    while seen.lock().len() < 3 {
        assert!(Instant::now() < deadline, "server never saw the greetings");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(*seen.lock(), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn scoped_channels_share_one_transport() {
    init_tracing();
    let service = Service::from_json(ECHO).unwrap();
    let server = Server::new(service.clone(), ServerOptions::default());
    server
        .on_message("echo", |_ctx, req| async move { Ok(field(&req, "s")) })
        .unwrap();

    let (cd, sd) = Duplex::pair();
    let server_conn = Connection::new(sd, Dialect::Netty);
    let client_conn = Connection::new(cd, Dialect::Netty);

    let shared = |scope: &str| {
        ChannelOptions::default()
            .scope(scope)
            .end_writable(false)
    };
    server.stateful_channel(&server_conn, shared("A"));
    server.stateful_channel(&server_conn, shared("B"));

    let client_a = Client::new(service.clone(), ClientOptions::default());
    let client_b = Client::new(service, ClientOptions::default());
    client_a.stateful_channel(&client_conn, shared("A"));
    client_b.stateful_channel(&client_conn, shared("B"));

    let run = |client: Client, tag: &'static str| async move {
        let mut calls = Vec::new();
        for i in 0..100 {
            let client = client.clone();
            calls.push(async move {
                let s = format!("{}-{}", tag, i);
                let out = client
                    .emit_message(
                        "echo",
                        Value::Record(vec![("s".into(), Value::String(s.clone()))]),
                        CallOptions::default(),
                    )
                    .await
                    .unwrap();
                assert_eq!(out, Value::String(s.into()));
            });
        }
        futures::future::join_all(calls).await;
    };

    tokio::join!(run(client_a, "A"), run(client_b, "B"));
    assert_eq!(server.active_channels().len(), 2);
}

#[tokio::test]
async fn unscoped_channel_ignores_scoped_traffic() {
    init_tracing();
    let service = Service::from_json(ECHO).unwrap();
    let server = Server::new(service.clone(), ServerOptions::default());
    server
        .on_message("echo", |_ctx, req| async move { Ok(field(&req, "s")) })
        .unwrap();

    let (cd, sd) = Duplex::pair();
    let server_conn = Connection::new(sd, Dialect::Netty);
    let client_conn = Connection::new(cd, Dialect::Netty);

    // The server only listens under scope "A"; an unscoped client channel's
    // handshake is invisible to it and times out.
    server.stateful_channel(
        &server_conn,
        ChannelOptions::default().scope("A").end_writable(false),
    );

    let client = Client::new(service, ClientOptions::default());
    let scoped = client.stateful_channel(
        &client_conn,
        ChannelOptions::default().scope("A").end_writable(false),
    );
    scoped.wait_connected().await.unwrap();

    let orphan_client = Client::new(
        Service::from_json(ECHO).unwrap(),
        ClientOptions::default(),
    );
    let orphan = orphan_client.stateful_channel(
        &client_conn,
        ChannelOptions::default()
            .timeout(Duration::from_millis(100))
            .end_writable(false),
    );
    assert!(orphan.wait_connected().await.is_err());
    assert!(orphan.is_destroyed());
    assert!(!scoped.is_destroyed());
}

#[tokio::test]
async fn handshake_is_cached_across_channels() {
    init_tracing();
    // The client's protocol is an evolution of the server's: same message,
    // wider response type. First contact needs a protocol exchange.
    let wide = r#"{
        "protocol": "Echo",
        "messages": {
            "echo": {
                "request": [{"name": "s", "type": "string"}],
                "response": "string"
            },
            "shout": {
                "request": [{"name": "s", "type": "string"}],
                "response": "string"
            }
        }
    }"#;
    let client_svc = Service::from_json(ECHO).unwrap();
    let server_svc = Service::from_json(wide).unwrap();

    let server = Server::new(server_svc, ServerOptions::default());
    server
        .on_message("echo", |_ctx, req| async move { Ok(field(&req, "s")) })
        .unwrap();

    let client = Client::new(client_svc, ClientOptions::default());
    connect(&client, &server);

    let out = client
        .emit_message(
            "echo",
            Value::Record(vec![("s".into(), Value::String("one".into()))]),
            CallOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(out, Value::String("one".into()));

    // Both sides learned exactly one remote protocol.
    assert_eq!(client.remote_protocols().len(), 1);
    assert_eq!(server.remote_protocols().len(), 1);

    // A second channel resolves from the caches: no new protocols travel.
    connect(&client, &server);
    let out = client
        .emit_message(
            "echo",
            Value::Record(vec![("s".into(), Value::String("two".into()))]),
            CallOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(out, Value::String("two".into()));
    assert_eq!(client.remote_protocols().len(), 1);
    assert_eq!(server.remote_protocols().len(), 1);
}

#[tokio::test]
async fn stateless_channel_round_trips() {
    init_tracing();
    let service = Service::from_json(ECHO).unwrap();
    let server = Server::new(service.clone(), ServerOptions::default());
    server
        .on_message("echo", |_ctx, req| async move { Ok(field(&req, "s")) })
        .unwrap();

    let server_for_factory = server.clone();
    let transports = factory(move || {
        let server = server_for_factory.clone();
        async move {
            let (cd, sd) = Duplex::pair();
            tokio::spawn(async move {
                let _ = server.serve_stateless(sd, ChannelOptions::default()).await;
            });
            Ok(cd)
        }
    });

    let client = Client::new(service, ClientOptions::default());
    client.stateless_channel(transports, ChannelOptions::default());

    for text in ["first", "second"] {
        let out = client
            .emit_message(
                "echo",
                Value::Record(vec![("s".into(), Value::String(text.into()))]),
                CallOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(out, Value::String(text.into()));
    }
}

#[tokio::test]
async fn stateless_channel_renegotiates_unknown_protocols() {
    init_tracing();
    // Client declares a subset of the server's protocol: the first call must
    // carry the client protocol after a NONE response.
    let wide = r#"{
        "protocol": "Echo",
        "messages": {
            "echo": {
                "request": [{"name": "s", "type": "string"}],
                "response": "string"
            },
            "shout": {
                "request": [{"name": "s", "type": "string"}],
                "response": "string"
            }
        }
    }"#;
    let client_svc = Service::from_json(ECHO).unwrap();
    let server_svc = Service::from_json(wide).unwrap();

    let server = Server::new(server_svc, ServerOptions::default());
    server
        .on_message("echo", |_ctx, req| async move { Ok(field(&req, "s")) })
        .unwrap();

    let server_for_factory = server.clone();
    let transports = factory(move || {
        let server = server_for_factory.clone();
        async move {
            let (cd, sd) = Duplex::pair();
            tokio::spawn(async move {
                let _ = server.serve_stateless(sd, ChannelOptions::default()).await;
            });
            Ok(cd)
        }
    });

    let client = Client::new(client_svc, ClientOptions::default());
    client.stateless_channel(transports, ChannelOptions::default());

    let out = client
        .emit_message(
            "echo",
            Value::Record(vec![("s".into(), Value::String("hi".into()))]),
            CallOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(out, Value::String("hi".into()));
    assert_eq!(server.remote_protocols().len(), 1);
}

#[tokio::test]
async fn destroying_a_channel_interrupts_pending_calls() {
    init_tracing();
    let service = Service::from_json(SLOW).unwrap();
    let server = Server::new(service.clone(), ServerOptions::default());
    server
        .on_message("slow", |_ctx, req| async move {
            let Value::Int(ms) = field(&req, "ms") else {
                return Err(RpcError::new(ErrorCode::InvalidRequest, "ms must be an int"));
            };
            tokio::time::sleep(Duration::from_millis(ms as u64)).await;
            Ok(Value::Int(ms))
        })
        .unwrap();

    let client = Client::new(service, ClientOptions::default());
    let (cd, sd) = Duplex::pair();
    server.create_channel(sd, ChannelOptions::default());
    let channel = client.create_channel(cd, ChannelOptions::default());
    channel.wait_connected().await.unwrap();

    let pending = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .emit_message(
                    "slow",
                    Value::Record(vec![("ms".into(), Value::Int(5_000))]),
                    CallOptions::default().timeout(Duration::from_secs(30)),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    channel.destroy(true);
    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err.code(), ErrorCode::Interrupted);
    assert!(client.active_channels().is_empty());
}

#[tokio::test]
async fn buffered_calls_wait_for_the_first_channel() {
    init_tracing();
    let service = Service::from_json(PING).unwrap();
    let server = Server::new(service.clone(), ServerOptions::default());
    server
        .on_message("ping", |_ctx, _req| async { Ok(Value::String("pong".into())) })
        .unwrap();

    let client = Client::new(service, ClientOptions::default());
    let parked = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .emit_message("ping", Value::Record(vec![]), CallOptions::default())
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    connect(&client, &server);

    let out = parked.await.unwrap().unwrap();
    assert_eq!(out, Value::String("pong".into()));
}

#[tokio::test]
async fn discover_protocol_reads_the_peer_protocol() {
    init_tracing();
    let service = Service::from_json(ECHO).unwrap();
    let server = Server::new(service.clone(), ServerOptions::default());

    let (cd, sd) = Duplex::pair();
    server.create_channel(sd, ChannelOptions::default());

    let discovered = discover_protocol(cd, ChannelOptions::default())
        .await
        .unwrap();
    let parsed = Service::from_json(&discovered).unwrap();
    assert_eq!(parsed.fingerprint(), service.fingerprint());
}
