use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use overlan::network::{tls, Connection, Deadlines, ServerHandler, ServerOptions, ServerStats, TcpServer};
use overlan::protocol::constants;
use overlan::{Error, Result};

/// 原样回写收到的报文
#[derive(Default)]
struct Echo {
    clients: AtomicUsize,
    closed: AtomicUsize,
}

impl ServerHandler for Echo {
    async fn on_client(&self, _conn: &Arc<Connection>) -> Result<()> {
        self.clients.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_recv(&self, conn: &Arc<Connection>, data: &[u8]) -> Result<()> {
        conn.send_msg(data).await?;
        Ok(())
    }

    async fn on_close(&self, _conn: &Arc<Connection>) -> Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// 每个回调都失败
#[derive(Default)]
struct Faulty {
    calls: AtomicUsize,
}

impl ServerHandler for Faulty {
    async fn on_client(&self, _conn: &Arc<Connection>) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(Error::Config("on_client rejected".into()))
    }

    async fn on_recv(&self, _conn: &Arc<Connection>, _data: &[u8]) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(Error::InvalidFrame("on_recv rejected".into()))
    }

    async fn on_close(&self, _conn: &Arc<Connection>) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(Error::Config("on_close rejected".into()))
    }
}

const SWITCH_CERT: &[u8] = include_bytes!("data/switch.cert.der");
const SWITCH_KEY: &[u8] = include_bytes!("data/switch.key.der");

async fn echo_server() -> (Arc<TcpServer>, Arc<Echo>, String) {
    let _ = env_logger::builder().is_test(true).try_init();
    let server = TcpServer::bind("127.0.0.1:0", None, ServerOptions::default())
        .await
        .unwrap();
    let handler = Arc::new(Echo::default());
    server.start(handler.clone()).unwrap();
    let addr = server.local_addr().to_string();
    (server, handler, addr)
}

async fn client(addr: &str) -> Connection {
    let conn = Connection::new(addr, None, Deadlines::default());
    conn.connect().await.unwrap();
    conn
}

async fn wait_for(stats: &ServerStats, done: impl Fn(&ServerStats) -> bool) {
    for _ in 0..200 {
        if done(stats) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached: {:?}", stats.snapshot());
}

#[tokio::test]
async fn echoes_over_loopback() {
    let (server, _handler, addr) = echo_server().await;
    let conn = client(&addr).await;
    assert!(conn.is_open());
    assert_eq!(conn.state().to_string(), "connected");

    conn.send_msg(b"\x02\x00\x00\x00\x00\x01hello").await.unwrap();
    let mut buf = [0u8; constants::MAX_MESSAGE_LENGTH];
    let n = conn.recv_msg(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"\x02\x00\x00\x00\x00\x01hello");

    assert_eq!(conn.stats().snapshot().rx, 1);
    wait_for(&server.stats(), |s| s.rx.load(Ordering::Relaxed) == 1).await;
    server.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn registry_returns_to_empty_after_disconnects() {
    const K: usize = 8;
    let (server, handler, addr) = echo_server().await;
    let stats = server.stats();

    let mut clients = Vec::new();
    for _ in 0..K {
        clients.push(client(&addr).await);
    }
    wait_for(&stats, |s| s.clients.load(Ordering::Acquire) == K).await;
    assert_eq!(stats.snapshot().accepted, K as u64);

    for conn in &clients {
        conn.close().await;
    }
    wait_for(&stats, |s| s.clients.load(Ordering::Acquire) == 0).await;

    let counters = stats.snapshot();
    assert_eq!(counters.closed, K as u64);
    assert_eq!(handler.clients.load(Ordering::SeqCst), K);
    assert_eq!(handler.closed.load(Ordering::SeqCst), K);
    server.close().await;
}

#[tokio::test]
async fn close_disconnects_every_client() {
    let (server, handler, addr) = echo_server().await;
    let a = client(&addr).await;
    let b = client(&addr).await;
    wait_for(&server.stats(), |s| s.clients.load(Ordering::Acquire) == 2).await;

    server.close().await;
    server.close().await;
    assert!(!server.is_listening());
    assert_eq!(handler.closed.load(Ordering::SeqCst), 2);
    assert_eq!(server.stats().snapshot().clients, 0);

    let mut buf = [0u8; 64];
    assert!(matches!(a.recv_msg(&mut buf).await, Err(Error::ConnectionClosed(_))));
    assert!(matches!(b.recv_msg(&mut buf).await, Err(Error::ConnectionClosed(_))));
}

#[tokio::test]
async fn bind_failure_is_reported() {
    let (server, _handler, addr) = echo_server().await;
    assert!(TcpServer::bind(&addr, None, ServerOptions::default()).await.is_err());
    server.close().await;
}

#[tokio::test]
async fn connect_to_nothing_fails_and_reports_closed() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let conn = Connection::new(&addr, None, Deadlines::default());
    assert!(conn.connect().await.is_err());
    assert_eq!(conn.state().to_string(), "closed");
    assert_eq!(conn.uptime(), 0);
    assert!(matches!(conn.send_msg(b"x").await, Err(Error::NotConnected(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failing_callbacks_do_not_stop_bookkeeping() {
    const K: usize = 4;
    let _ = env_logger::builder().is_test(true).try_init();
    let server = TcpServer::bind("127.0.0.1:0", None, ServerOptions::default())
        .await
        .unwrap();
    let handler = Arc::new(Faulty::default());
    server.start(handler.clone()).unwrap();
    let addr = server.local_addr().to_string();
    let stats = server.stats();

    let mut clients = Vec::new();
    for _ in 0..K {
        clients.push(client(&addr).await);
    }
    wait_for(&stats, |s| s.clients.load(Ordering::Acquire) == K).await;

    // 数据回调失败后连接仍然可用
    for conn in &clients {
        conn.send_msg(b"\x02\x00\x00\x00\x00\x01ping").await.unwrap();
        conn.send_msg(b"\x02\x00\x00\x00\x00\x01pong").await.unwrap();
    }
    wait_for(&stats, |s| s.rx.load(Ordering::Relaxed) == 2 * K as u64).await;
    assert_eq!(stats.snapshot().clients, K);

    for conn in &clients {
        conn.close().await;
    }
    wait_for(&stats, |s| s.clients.load(Ordering::Acquire) == 0).await;

    assert_eq!(stats.snapshot().closed, K as u64);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 4 * K);
    server.close().await;
}

async fn tls_echo_server() -> (Arc<TcpServer>, Arc<Echo>, u16) {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = tls::server_config(vec![SWITCH_CERT.to_vec()], SWITCH_KEY.to_vec()).unwrap();
    let server = TcpServer::bind("127.0.0.1:0", Some(config), ServerOptions::default())
        .await
        .unwrap();
    let handler = Arc::new(Echo::default());
    server.start(handler.clone()).unwrap();
    let port = server.local_addr().port();
    (server, handler, port)
}

#[tokio::test]
async fn echoes_over_tls() {
    let (server, handler, port) = tls_echo_server().await;
    let conn = Connection::new(
        &format!("127.0.0.1:{}", port),
        Some(tls::insecure_client_config()),
        Deadlines::default(),
    );
    conn.connect().await.unwrap();
    assert_eq!(conn.state().to_string(), "connected");

    conn.send_msg(b"\x02\x00\x00\x00\x00\x01sealed").await.unwrap();
    let mut buf = [0u8; constants::MAX_MESSAGE_LENGTH];
    let n = tokio::time::timeout(Duration::from_secs(2), conn.recv_msg(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"\x02\x00\x00\x00\x00\x01sealed");

    wait_for(&server.stats(), |s| s.clients.load(Ordering::Acquire) == 1).await;
    conn.close().await;
    wait_for(&server.stats(), |s| s.clients.load(Ordering::Acquire) == 0).await;
    assert_eq!(handler.closed.load(Ordering::SeqCst), 1);
    server.close().await;
}

#[tokio::test]
async fn plain_client_never_joins_a_tls_server() {
    let (server, handler, port) = tls_echo_server().await;
    let conn = Connection::new(&format!("127.0.0.1:{}", port), None, Deadlines::default());
    conn.connect().await.unwrap();
    let _ = conn.send_msg(b"\x02\x00\x00\x00\x00\x01plain").await;

    let mut buf = [0u8; 64];
    let _ = tokio::time::timeout(Duration::from_secs(2), conn.recv_msg(&mut buf)).await;
    assert_eq!(server.stats().snapshot().accepted, 1);
    assert_eq!(handler.clients.load(Ordering::SeqCst), 0);
    server.close().await;
}

#[tokio::test]
async fn verified_client_rejects_a_certificate_for_another_name() {
    let (server, handler, port) = tls_echo_server().await;
    let config = tls::client_config(SWITCH_CERT.to_vec()).unwrap();

    // 证书只签发给 localhost，不含 IP 地址
    let conn = Connection::new(&format!("127.0.0.1:{}", port), Some(config), Deadlines::default());
    assert!(matches!(conn.connect().await, Err(Error::Tls(_))));
    assert_eq!(conn.state().to_string(), "closed");
    assert_eq!(handler.clients.load(Ordering::SeqCst), 0);
    server.close().await;
}
