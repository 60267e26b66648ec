use ferrolb::backend::HealthPolicy;
use ferrolb::config::Config;
use ferrolb::factory;
use ferrolb::listener::Listener;
use ferrolb::proxy::{EngineOptions, ProxyEngine};
use futures_util::{SinkExt, StreamExt};
use http::{header, HeaderMap, Request, StatusCode};
use http_body_util::Empty;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Response;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;

async fn start_mock_upstream(id: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };

            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |_req: Request<Incoming>| async move {
                    Ok::<_, Infallible>(
                        Response::builder()
                            .status(StatusCode::OK)
                            .header("x-backend-id", id)
                            .body("upstream response".to_string())
                            .unwrap(),
                    )
                });
                let _ = http1::Builder::new().serve_connection(io, service).await;
            });
        }
    });

    format!("http://127.0.0.1:{}", addr.port())
}

/// Echo WebSocket server used as a backend.
async fn start_ws_echo_upstream() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            tokio::spawn(async move {
                let ws = match tokio_tungstenite::accept_async(stream).await {
                    Ok(ws) => ws,
                    Err(_) => return,
                };
                let (mut sink, mut stream) = ws.split();
                while let Some(Ok(message)) = stream.next().await {
                    if message.is_close() {
                        break;
                    }
                    if message.is_text() || message.is_binary() {
                        if sink.send(message).await.is_err() {
                            break;
                        }
                    }
                }
            });
        }
    });

    format!("http://127.0.0.1:{}", addr.port())
}

/// An address nothing is listening on: connects to it are refused.
async fn dead_upstream() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://127.0.0.1:{}", addr.port())
}

async fn start_balancer(
    config_text: &str,
    options: EngineOptions,
) -> (SocketAddr, Arc<ProxyEngine>, broadcast::Sender<()>) {
    let config = Config::parse(config_text).unwrap();
    let engine = Arc::new(factory::build_engine(&config, options).unwrap());
    let listener = Listener::bind("127.0.0.1:0", Arc::clone(&engine))
        .await
        .unwrap();
    let addr = listener.local_addr();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        let _ = listener.serve(shutdown_rx).await;
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    (addr, engine, shutdown_tx)
}

type TestClient = Client<HttpConnector, Empty<Bytes>>;

fn test_client() -> TestClient {
    Client::builder(TokioExecutor::new()).build_http()
}

async fn send(
    client: &TestClient,
    addr: SocketAddr,
    path: &str,
    headers: &[(&str, String)],
) -> (StatusCode, HeaderMap) {
    let mut builder = Request::builder().uri(format!("http://{addr}{path}"));
    for (name, value) in headers {
        builder = builder.header(*name, value.as_str());
    }
    let response = client
        .request(builder.body(Empty::new()).unwrap())
        .await
        .unwrap();
    (response.status(), response.headers().clone())
}

fn backend_id(headers: &HeaderMap) -> String {
    headers
        .get("x-backend-id")
        .expect("response missing x-backend-id")
        .to_str()
        .unwrap()
        .to_string()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_weighted_round_robin_distribution() {
    let u1 = start_mock_upstream("1").await;
    let u2 = start_mock_upstream("2").await;
    let u3 = start_mock_upstream("3").await;
    let config = format!(
        "method weighted_round_robin\nupstream backend {{\n server {u1} weight=5\n server {u2} weight=3\n server {u3} weight=2\n}}\n"
    );
    let (addr, _engine, shutdown_tx) = start_balancer(&config, EngineOptions::default()).await;
    let client = test_client();

    let mut counts: HashMap<String, usize> = HashMap::new();
    for _ in 0..100 {
        let (status, headers) = send(&client, addr, "/", &[]).await;
        assert_eq!(status, StatusCode::OK);
        *counts.entry(backend_id(&headers)).or_default() += 1;
    }

    // Sequential dispatches follow the weights exactly.
    assert_eq!(counts.get("1"), Some(&50));
    assert_eq!(counts.get("2"), Some(&30));
    assert_eq!(counts.get("3"), Some(&20));

    let _ = shutdown_tx.send(());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cookie_persistence_stickiness() {
    let u1 = start_mock_upstream("1").await;
    let u2 = start_mock_upstream("2").await;
    let u3 = start_mock_upstream("3").await;
    let config = format!(
        "method round_robin\npersistence cookie\nupstream backend {{\n server {u1}\n server {u2}\n server {u3}\n}}\n"
    );
    let (addr, _engine, shutdown_tx) = start_balancer(&config, EngineOptions::default()).await;
    let client = test_client();

    let (status, headers) = send(&client, addr, "/", &[]).await;
    assert_eq!(status, StatusCode::OK);
    let first_backend = backend_id(&headers);
    let set_cookie = headers
        .get(header::SET_COOKIE)
        .expect("first response must set the session cookie")
        .to_str()
        .unwrap()
        .to_string();
    assert!(set_cookie.starts_with("GOLB_SESSION="));
    assert!(set_cookie.contains("Path=/"));
    assert!(set_cookie.contains("HttpOnly"));

    let cookie_pair = set_cookie.split(';').next().unwrap().to_string();
    let mut counts: HashMap<String, usize> = HashMap::new();
    *counts.entry(first_backend.clone()).or_default() += 1;

    for _ in 0..10 {
        let (status, headers) =
            send(&client, addr, "/", &[("cookie", cookie_pair.clone())]).await;
        assert_eq!(status, StatusCode::OK);
        let id = backend_id(&headers);
        assert_eq!(id, first_backend);
        // A sticky hit never re-sets the cookie.
        assert!(headers.get(header::SET_COOKIE).is_none());
        *counts.entry(id).or_default() += 1;
    }

    assert_eq!(counts.get(&first_backend), Some(&11));
    assert_eq!(counts.len(), 1);

    let _ = shutdown_tx.send(());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ip_hash_persistence() {
    let u1 = start_mock_upstream("1").await;
    let u2 = start_mock_upstream("2").await;
    let u3 = start_mock_upstream("3").await;
    let config = format!(
        "method round_robin\npersistence ip_hash\nupstream backend {{\n server {u1}\n server {u2}\n server {u3}\n}}\n"
    );
    let (addr, _engine, shutdown_tx) = start_balancer(&config, EngineOptions::default()).await;
    let client = test_client();

    // One simulated peer always lands on the same backend.
    let mut seen = std::collections::HashSet::new();
    for _ in 0..10 {
        let (status, headers) = send(
            &client,
            addr,
            "/",
            &[("x-forwarded-for", "203.0.113.5".to_string())],
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        seen.insert(backend_id(&headers));
    }
    assert_eq!(seen.len(), 1);

    // Distinct peers spread across the pool.
    let mut seen = std::collections::HashSet::new();
    for i in 0..10 {
        let (status, headers) = send(
            &client,
            addr,
            "/",
            &[("x-forwarded-for", format!("10.0.0.{i}"))],
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        seen.insert(backend_id(&headers));
    }
    assert!(seen.len() >= 2);

    let _ = shutdown_tx.send(());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_consistent_hash_per_path() {
    let u1 = start_mock_upstream("1").await;
    let u2 = start_mock_upstream("2").await;
    let u3 = start_mock_upstream("3").await;
    let config = format!(
        "method round_robin\npersistence consistent_hash\nupstream backend {{\n server {u1}\n server {u2}\n server {u3}\n}}\n"
    );
    let (addr, _engine, shutdown_tx) = start_balancer(&config, EngineOptions::default()).await;
    let client = test_client();

    let paths = [
        "/products", "/users", "/orders", "/carts", "/reviews", "/search", "/inventory",
        "/payments", "/sessions", "/events",
    ];
    let mut per_path: HashMap<&str, String> = HashMap::new();
    for path in paths {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..5 {
            let (status, headers) = send(&client, addr, path, &[]).await;
            assert_eq!(status, StatusCode::OK);
            seen.insert(backend_id(&headers));
        }
        // Every request for one path lands on one backend.
        assert_eq!(seen.len(), 1, "path {path} was not stable");
        per_path.insert(path, seen.into_iter().next().unwrap());
    }

    let distinct: std::collections::HashSet<_> = per_path.values().collect();
    assert!(distinct.len() >= 2);

    let _ = shutdown_tx.send(());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failover_and_revival() {
    let dead = dead_upstream().await;
    let u2 = start_mock_upstream("2").await;
    let u3 = start_mock_upstream("3").await;
    let config = format!(
        "method round_robin\nupstream backend {{\n server {dead}\n server {u2}\n server {u3}\n}}\n"
    );
    let options = EngineOptions {
        health: HealthPolicy {
            failure_threshold: 3,
            revival_cooldown: Duration::from_secs(2),
        },
        ..EngineOptions::default()
    };
    let (addr, engine, shutdown_tx) = start_balancer(&config, options).await;
    let client = test_client();

    // Failed dispatches are transparently retried on healthy backends.
    for _ in 0..12 {
        let (status, _) = send(&client, addr, "/", &[]).await;
        assert_eq!(status, StatusCode::OK);
    }

    let backends = engine.router().default_pool().backends();
    assert!(!backends[0].is_alive());
    assert!(backends[0].error_count() >= 3);

    // While dead, traffic goes only to the healthy pair.
    let mut seen = std::collections::HashSet::new();
    for _ in 0..20 {
        let (status, headers) = send(&client, addr, "/", &[]).await;
        assert_eq!(status, StatusCode::OK);
        seen.insert(backend_id(&headers));
    }
    assert_eq!(
        seen,
        ["2".to_string(), "3".to_string()].into_iter().collect()
    );

    // The revival timer puts it back into rotation.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(backends[0].is_alive());
    assert_eq!(backends[0].error_count(), 0);

    let _ = shutdown_tx.send(());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_all_backends_down_returns_503() {
    let dead = dead_upstream().await;
    let config = format!("method round_robin\nupstream backend {{\n server {dead}\n}}\n");
    let options = EngineOptions {
        health: HealthPolicy {
            failure_threshold: 1,
            revival_cooldown: Duration::from_secs(60),
        },
        ..EngineOptions::default()
    };
    let (addr, _engine, shutdown_tx) = start_balancer(&config, options).await;
    let client = test_client();

    // The single backend dies on the first failed attempt; the
    // redispatch then finds nothing alive.
    let (status, _) = send(&client, addr, "/", &[]).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let (status, _) = send(&client, addr, "/", &[]).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let _ = shutdown_tx.send(());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_retries_exhausted_returns_502() {
    let dead = dead_upstream().await;
    let config = format!("method round_robin\nupstream backend {{\n server {dead}\n}}\n");
    let options = EngineOptions {
        hop_limit: 3,
        health: HealthPolicy {
            failure_threshold: 100,
            revival_cooldown: Duration::from_secs(60),
        },
        ..EngineOptions::default()
    };
    let (addr, engine, shutdown_tx) = start_balancer(&config, options).await;
    let client = test_client();

    // The backend stays nominally alive, so every hop is burned on it.
    let (status, _) = send(&client, addr, "/", &[]).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);

    let backends = engine.router().default_pool().backends();
    assert_eq!(backends[0].error_count(), 3);

    let _ = shutdown_tx.send(());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_path_routing_between_pools() {
    let u1 = start_mock_upstream("web").await;
    let u2 = start_mock_upstream("api").await;
    let config = format!(
        "upstream backend {{\n server {u1}\n}}\nupstream api {{\n server {u2}\n}}\nroute path /api/ api\ndefault_backend backend\n"
    );
    let (addr, _engine, shutdown_tx) = start_balancer(&config, EngineOptions::default()).await;
    let client = test_client();

    let (_, headers) = send(&client, addr, "/api/users", &[]).await;
    assert_eq!(backend_id(&headers), "api");

    let (_, headers) = send(&client, addr, "/site", &[]).await;
    assert_eq!(backend_id(&headers), "web");

    let _ = shutdown_tx.send(());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_websocket_echo_proxy() {
    let ws_backend = start_ws_echo_upstream().await;
    let config = format!("upstream backend {{\n server {ws_backend}\n}}\n");
    let (addr, engine, shutdown_tx) = start_balancer(&config, EngineOptions::default()).await;

    let (mut ws, response) = tokio_tungstenite::connect_async(format!("ws://{addr}/echo"))
        .await
        .expect("websocket upgrade through proxy failed");
    assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);

    ws.send(Message::Text("hello through the proxy".to_string()))
        .await
        .unwrap();

    let echoed = loop {
        match ws.next().await.expect("connection closed early").unwrap() {
            Message::Text(text) => break text,
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    };
    assert_eq!(echoed, "hello through the proxy");
    assert_eq!(engine.registry().count(), 1);

    // Closing the client side tears down the backend leg and the
    // registry entry.
    ws.close(None).await.unwrap();
    let mut drained = false;
    for _ in 0..50 {
        if engine.registry().count() == 0 {
            drained = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(drained, "websocket pair was not cleaned up");

    let _ = shutdown_tx.send(());
}
