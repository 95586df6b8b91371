//! Command servers and peer clients talking over real loopback sockets.

use paddock_command::{
    Args, AsyncCommandServer, AsyncPeerClient, CommandError, CommandRegistry, CommandServer,
    HeartbeatConfig, PeerClient, ServeExit, ServerConfig,
};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(2);

fn overlay_registry() -> CommandRegistry {
    let mut r = CommandRegistry::new();
    r.register("lock_widgets", |args| {
        let locked = args.get("locked").and_then(Value::as_bool).unwrap_or(true);
        Ok(json!({"status": "success", "locked": locked}))
    })
    .unwrap();
    r.register("explode", |_| anyhow::bail!("widget tree missing"))
        .unwrap();
    r
}

fn args(pairs: &[(&str, Value)]) -> Args {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

/// The exchange both server flavours must answer identically.
fn scripted_session(client: &mut PeerClient) -> Vec<Value> {
    vec![
        client.ping(),
        client.request("bogus", Args::new()),
        client.request("lock_widgets", args(&[("locked", json!(false))])),
        client.request("explode", Args::new()),
        client.heartbeat(),
        client.ping(),
    ]
}

#[test]
fn sync_server_dispatches_and_survives_handler_errors() {
    let server = CommandServer::bind(ServerConfig::new("hud"), overlay_registry()).unwrap();
    let port = server.port();
    let handle = server.spawn().unwrap();
    let mut client = PeerClient::for_port(port, TIMEOUT);

    let replies = scripted_session(&mut client);
    assert_eq!(replies[0], json!({"reply": "__pong__", "source": "hud"}));
    assert_eq!(
        replies[1],
        json!({"status": "error", "message": "unknown command: bogus", "source": "hud"})
    );
    assert_eq!(replies[2], json!({"status": "success", "locked": false}));
    assert_eq!(
        replies[3],
        json!({"status": "error", "message": "widget tree missing"})
    );
    assert_eq!(replies[4]["reply"], "__heartbeat_ack__");
    assert_eq!(replies[5]["reply"], "__pong__");

    assert_eq!(handle.close().unwrap(), ServeExit::Stopped);
}

#[test]
fn shutdown_replies_with_callback_result_then_stops() {
    let mut registry = overlay_registry();
    registry.on_shutdown(|args| {
        let save = args.get("save").and_then(Value::as_bool).unwrap_or(false);
        Ok(json!({"status": "success", "saved": save}))
    });
    let server = CommandServer::bind(ServerConfig::new("timing"), registry).unwrap();
    let port = server.port();
    let handle = server.spawn().unwrap();

    let mut client = PeerClient::for_port(port, TIMEOUT);
    let reply = client.shutdown_child(args(&[("save", json!(true))]));
    assert_eq!(reply, json!({"status": "success", "saved": true}));
    assert_eq!(handle.join().unwrap(), ServeExit::Shutdown);

    // Nobody is listening any more.
    assert!(client.ping().get("error").is_some());
}

#[test]
fn terminate_skips_shutdown_callback() {
    let called = Arc::new(AtomicBool::new(false));
    let mut registry = CommandRegistry::new();
    let flag = Arc::clone(&called);
    registry.on_shutdown(move |_| {
        flag.store(true, Ordering::SeqCst);
        Ok(Value::Null)
    });
    let server = CommandServer::bind(ServerConfig::new("hud"), registry).unwrap();
    let port = server.port();
    let handle = server.spawn().unwrap();

    let reply = PeerClient::for_port(port, TIMEOUT).terminate_child();
    assert_eq!(reply["message"], "terminated");
    assert_eq!(handle.join().unwrap(), ServeExit::Terminated);
    assert!(!called.load(Ordering::SeqCst));
}

#[test]
fn missed_heartbeats_fire_callback_once() {
    let fired = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&fired);
    let mut registry = CommandRegistry::new();
    registry.on_missed_heartbeat(move |missed| sink.lock().unwrap().push(missed));

    let cfg = ServerConfig::new("hud").with_heartbeat(HeartbeatConfig {
        interval: Duration::from_millis(50),
        timeout: Duration::from_millis(100),
        max_missed: 3,
    });
    let handle = CommandServer::bind(cfg, registry).unwrap().spawn().unwrap();

    assert!(wait_until(Duration::from_secs(3), || !fired.lock().unwrap().is_empty()));
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(*fired.lock().unwrap(), vec![3]);

    // The server keeps serving after the monitor gave up.
    let mut client = PeerClient::for_port(handle.local_addr().port(), TIMEOUT);
    assert!(client.is_alive());
    handle.close().unwrap();
}

#[test]
fn regular_heartbeats_keep_monitor_quiet() {
    let fired = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&fired);
    let mut registry = CommandRegistry::new();
    registry.on_missed_heartbeat(move |_| flag.store(true, Ordering::SeqCst));

    let cfg = ServerConfig::new("hud").with_heartbeat(HeartbeatConfig {
        interval: Duration::from_millis(20),
        timeout: Duration::from_millis(150),
        max_missed: 3,
    });
    let handle = CommandServer::bind(cfg, registry).unwrap().spawn().unwrap();
    let mut client = PeerClient::for_port(handle.local_addr().port(), TIMEOUT);

    let end = Instant::now() + Duration::from_millis(600);
    while Instant::now() < end {
        assert_eq!(client.heartbeat()["status"], "success");
        std::thread::sleep(Duration::from_millis(30));
    }
    assert!(!fired.load(Ordering::SeqCst));
    handle.close().unwrap();
}

#[test]
fn client_reconnects_after_a_timed_out_request() {
    let mut registry = CommandRegistry::new();
    registry
        .register("slow", |_| {
            std::thread::sleep(Duration::from_millis(300));
            Ok(json!({"status": "success"}))
        })
        .unwrap();
    let handle = CommandServer::bind(ServerConfig::new("hud"), registry)
        .unwrap()
        .spawn()
        .unwrap();
    let mut client = PeerClient::for_port(handle.local_addr().port(), Duration::from_millis(100));

    let reply = client.request("slow", Args::new());
    assert!(reply["error"].as_str().unwrap().contains("timed out"));
    assert!(!client.is_connected());

    std::thread::sleep(Duration::from_millis(400));
    // The late "slow" reply went to the discarded socket, not this one.
    assert_eq!(client.ping()["reply"], "__pong__");
    handle.close().unwrap();
}

#[test]
fn port_in_use_is_a_bind_error() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();
    let err = CommandServer::bind(ServerConfig::new("hud").with_port(port), CommandRegistry::new())
        .err()
        .unwrap();
    assert!(matches!(err, CommandError::Bind { .. }));
}

#[test]
fn async_server_is_wire_identical() {
    let sync_handle = CommandServer::bind(ServerConfig::new("hud"), overlay_registry())
        .unwrap()
        .spawn()
        .unwrap();
    let async_handle = AsyncCommandServer::spawn(ServerConfig::new("hud"), overlay_registry()).unwrap();

    let sync_replies = scripted_session(&mut PeerClient::for_port(
        sync_handle.local_addr().port(),
        TIMEOUT,
    ));
    let async_replies = scripted_session(&mut PeerClient::for_port(
        async_handle.local_addr().port(),
        TIMEOUT,
    ));
    assert_eq!(sync_replies, async_replies);

    let mut client = PeerClient::for_port(async_handle.local_addr().port(), TIMEOUT);
    assert_eq!(client.terminate_child()["message"], "terminated");
    assert_eq!(async_handle.join().unwrap(), ServeExit::Terminated);
    sync_handle.close().unwrap();
}

#[tokio::test(flavor = "current_thread")]
async fn async_server_and_client_on_one_runtime() {
    let mut registry = overlay_registry();
    registry.on_shutdown(|_| Ok(Value::Null));
    let server = AsyncCommandServer::bind(ServerConfig::new("relay"), registry)
        .await
        .unwrap();
    let endpoint = server.endpoint();
    let serving = tokio::spawn(server.serve());

    let mut client = AsyncPeerClient::new(&endpoint, TIMEOUT).unwrap();
    assert!(client.is_alive().await);
    assert_eq!(
        client.request("lock_widgets", Args::new()).await,
        json!({"status": "success", "locked": true})
    );
    assert_eq!(
        client.shutdown_child(Args::new()).await,
        json!({"status": "success", "message": "shutting down", "source": "relay"})
    );
    assert_eq!(serving.await.unwrap().unwrap(), ServeExit::Shutdown);
}

#[tokio::test(flavor = "current_thread")]
async fn async_heartbeat_monitor_fires_once() {
    let fired = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&fired);
    let mut registry = CommandRegistry::new();
    registry.on_missed_heartbeat(move |missed| sink.lock().unwrap().push(missed));
    let cfg = ServerConfig::new("hud").with_heartbeat(HeartbeatConfig {
        interval: Duration::from_millis(50),
        timeout: Duration::from_millis(100),
        max_missed: 3,
    });
    let server = AsyncCommandServer::bind(cfg, registry).await.unwrap();
    let stopper = server.stopper();
    let serving = tokio::spawn(server.serve());

    tokio::time::sleep(Duration::from_millis(900)).await;
    assert_eq!(*fired.lock().unwrap(), vec![3]);

    stopper.stop();
    assert_eq!(serving.await.unwrap().unwrap(), ServeExit::Stopped);
}

/// Pipelines pings at `handle` from a peer that never reads a reply, then
/// checks another peer is still answered and that `close()` returns.
fn survive_peer_that_never_reads(handle: paddock_command::ServerHandle) {
    let mut flood = std::net::TcpStream::connect(handle.local_addr()).unwrap();
    std::thread::spawn(move || {
        let ping = br#"{"cmd":"__ping__","args":{}}"#;
        // Ends once the server drops this connection.
        while paddock_wire::write_frame(&mut flood, ping).is_ok() {}
    });
    std::thread::sleep(Duration::from_millis(1500));

    let mut client = PeerClient::for_port(handle.local_addr().port(), Duration::from_secs(10));
    assert_eq!(client.ping()["reply"], "__pong__");

    let closed = Arc::new(AtomicBool::new(false));
    let done = Arc::clone(&closed);
    std::thread::spawn(move || {
        assert_eq!(handle.close().unwrap(), ServeExit::Stopped);
        done.store(true, Ordering::SeqCst);
    });
    assert!(wait_until(Duration::from_secs(10), || closed.load(Ordering::SeqCst)));
}

#[test]
fn sync_server_survives_peer_that_never_reads() {
    let handle = CommandServer::bind(ServerConfig::new("hud"), overlay_registry())
        .unwrap()
        .spawn()
        .unwrap();
    survive_peer_that_never_reads(handle);
}

#[test]
fn async_server_survives_peer_that_never_reads() {
    let handle = AsyncCommandServer::spawn(ServerConfig::new("hud"), overlay_registry()).unwrap();
    survive_peer_that_never_reads(handle);
}
