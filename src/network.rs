/*!
OverLAN网络模块

隧道连接的生命周期管理，包括：
- TCP/TLS 监听与接入
- 单一控制循环维护连接表
- 每连接一个接收任务
- 客户端连接与重连
*/

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::protocol::{self, constants};

/// 连接底层流：明文TCP、TLS或测试用的内存管道
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    /// 客户端尚未连接
    Init = 0,
    Connecting = 1,
    Open = 2,
    Closing = 3,
    Closed = 4,
}

impl ConnState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnState::Init,
            1 => ConnState::Connecting,
            2 => ConnState::Open,
            3 => ConnState::Closing,
            _ => ConnState::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnState::Init => "init",
            ConnState::Connecting => "connecting",
            ConnState::Open => "connected",
            ConnState::Closing => "closing",
            ConnState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 连接的读写期限
#[derive(Debug, Clone, Copy)]
pub struct Deadlines {
    pub connect: Duration,
    /// None 表示不限时
    pub read: Option<Duration>,
    pub write: Option<Duration>,
}

impl Default for Deadlines {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            read: None,
            write: Some(Duration::from_secs(10)),
        }
    }
}

/// 连接计数，尽力而为的观测值
#[derive(Debug, Default)]
pub struct ConnStats {
    pub rx: AtomicU64,
    pub tx: AtomicU64,
    pub dropped: AtomicU64,
}

/// 计数快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub rx: u64,
    pub tx: u64,
    pub dropped: u64,
}

impl ConnStats {
    pub fn snapshot(&self) -> Counters {
        Counters {
            rx: self.rx.load(Ordering::Relaxed),
            tx: self.tx.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// 隧道连接（服务端接入或客户端发起）
pub struct Connection {
    id: u64,
    addr: String,
    state: AtomicU8,
    reader: Mutex<Option<ReadHalf<BoxedStream>>>,
    writer: Mutex<Option<WriteHalf<BoxedStream>>>,
    closing: Notify,
    /// 串行化 connect 与 close
    lifecycle: Mutex<()>,
    /// 每次建立链路加一
    generation: AtomicU64,
    tls: Option<Arc<rustls::ClientConfig>>,
    deadlines: Deadlines,
    opened_at: std::sync::Mutex<Option<Instant>>,
    stats: ConnStats,
}

impl Connection {
    /// 创建客户端连接，需要调用 [`Connection::connect`]
    pub fn new(addr: &str, tls: Option<Arc<rustls::ClientConfig>>, deadlines: Deadlines) -> Self {
        Self {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            addr: addr.to_string(),
            state: AtomicU8::new(ConnState::Init as u8),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            closing: Notify::new(),
            lifecycle: Mutex::new(()),
            generation: AtomicU64::new(0),
            tls,
            deadlines,
            opened_at: std::sync::Mutex::new(None),
            stats: ConnStats::default(),
        }
    }

    /// 用已建立的流创建连接，状态直接为 Open
    pub fn from_stream(stream: BoxedStream, addr: &str, deadlines: Deadlines) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let mut conn = Self::new(addr, None, deadlines);
        *conn.reader.get_mut() = Some(reader);
        *conn.writer.get_mut() = Some(writer);
        conn.mark_open();
        conn
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnState::Open
    }

    pub fn stats(&self) -> &ConnStats {
        &self.stats
    }

    /// 当前链路的代数，重连后变化
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// 自连接建立以来的秒数，未连接时为0
    pub fn uptime(&self) -> u64 {
        if !self.is_open() {
            return 0;
        }
        self.opened_at
            .lock()
            .ok()
            .and_then(|t| t.map(|t| t.elapsed().as_secs()))
            .unwrap_or(0)
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn mark_open(&self) {
        if let Ok(mut opened_at) = self.opened_at.lock() {
            *opened_at = Some(Instant::now());
        }
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.set_state(ConnState::Open);
    }

    /// 发起（或重新发起）客户端连接
    pub async fn connect(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_open() {
            return Ok(());
        }
        self.set_state(ConnState::Connecting);
        log::info!("Connecting to {}", self.addr);

        match self.dial().await {
            Ok(stream) => {
                let (reader, writer) = tokio::io::split(stream);
                *self.reader.lock().await = Some(reader);
                *self.writer.lock().await = Some(writer);
                self.mark_open();
                log::info!("Connected to {}", self.addr);
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnState::Closed);
                Err(e)
            }
        }
    }

    async fn dial(&self) -> Result<BoxedStream> {
        let tcp = timeout(self.deadlines.connect, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| Error::Timeout(format!("connect {}", self.addr)))??;
        tcp.set_nodelay(true)?;

        match &self.tls {
            Some(config) => {
                let host = self
                    .addr
                    .rsplit_once(':')
                    .map(|(host, _)| host.trim_start_matches('[').trim_end_matches(']'))
                    .unwrap_or(&self.addr);
                let name = rustls::ServerName::try_from(host)
                    .map_err(|e| Error::Tls(format!("{}: {}", host, e)))?;
                let connector = TlsConnector::from(config.clone());
                let stream = timeout(self.deadlines.connect, connector.connect(name, tcp))
                    .await
                    .map_err(|_| Error::Timeout(format!("tls handshake {}", self.addr)))?
                    .map_err(|e| Error::Tls(e.to_string()))?;
                Ok(Box::new(stream))
            }
            None => Ok(Box::new(tcp)),
        }
    }

    /// 接收一个完整报文到 `buf`，返回负载长度
    pub async fn recv_msg(&self, buf: &mut [u8]) -> Result<usize> {
        let closing = self.closing.notified();
        tokio::pin!(closing);
        closing.as_mut().enable();

        if !self.is_open() {
            return Err(Error::NotConnected(self.addr.clone()));
        }

        let mut guard = self.reader.lock().await;
        let reader = guard
            .as_mut()
            .ok_or_else(|| Error::NotConnected(self.addr.clone()))?;

        let read = async {
            let mut header = [0u8; constants::HEADER_LEN];
            reader.read_exact(&mut header).await?;
            let len = protocol::decode_header(&header)
                .ok_or_else(|| Error::InvalidFrame(format!("bad magic {:02x?}", &header[..2])))?;
            if len > buf.len() {
                return Err(Error::InvalidFrame(format!("payload {} exceeds buffer {}", len, buf.len())));
            }
            reader.read_exact(&mut buf[..len]).await?;
            Ok::<usize, Error>(len)
        };

        let result = tokio::select! {
            r = with_deadline(self.deadlines.read, "read", read) => r,
            _ = &mut closing => Err(Error::ConnectionClosed(self.addr.clone())),
        };

        match result {
            Ok(len) => {
                self.stats.rx.fetch_add(1, Ordering::Relaxed);
                Ok(len)
            }
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(Error::ConnectionClosed(self.addr.clone()))
            }
            Err(e) => Err(e),
        }
    }

    /// 发送一个报文，写超时受 [`Deadlines::write`] 约束
    pub async fn send_msg(&self, data: &[u8]) -> Result<usize> {
        if data.len() > constants::MAX_PAYLOAD {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(Error::InvalidFrame(format!("payload {} too large", data.len())));
        }

        let mut guard = self.writer.lock().await;
        let writer = match guard.as_mut() {
            Some(writer) if self.is_open() => writer,
            _ => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                return Err(Error::NotConnected(self.addr.clone()));
            }
        };

        let mut message = Vec::with_capacity(constants::HEADER_LEN + data.len());
        message.extend_from_slice(&protocol::encode_header(data.len()));
        message.extend_from_slice(data);

        let write = async {
            writer.write_all(&message).await?;
            writer.flush().await?;
            Ok::<(), Error>(())
        };

        match with_deadline(self.deadlines.write, "write", write).await {
            Ok(()) => {
                self.stats.tx.fetch_add(1, Ordering::Relaxed);
                Ok(data.len())
            }
            Err(e) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// 等待链路离开 Open 状态
    pub async fn closed(&self) {
        loop {
            let closing = self.closing.notified();
            tokio::pin!(closing);
            closing.as_mut().enable();
            if !self.is_open() {
                return;
            }
            closing.await;
        }
    }

    /// 关闭连接，可重复调用
    pub async fn close(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.teardown().await;
    }

    /// 只关闭第 `generation` 代链路，已经重连时不做任何事
    pub async fn close_generation(&self, generation: u64) {
        let _lifecycle = self.lifecycle.lock().await;
        if self.generation() != generation {
            log::debug!("Connection.close {}: generation {} already replaced", self.addr, generation);
            return;
        }
        self.teardown().await;
    }

    async fn teardown(&self) {
        let state = self.state();
        if state == ConnState::Closed || state == ConnState::Closing {
            return;
        }
        self.set_state(ConnState::Closing);
        log::debug!("Connection.close {}", self.addr);

        self.closing.notify_waiters();
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = with_deadline(self.deadlines.write, "shutdown", async {
                writer.shutdown().await.map_err(Error::from)
            })
            .await;
        }
        // 接收任务持有读端时由它自行释放
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
        self.set_state(ConnState::Closed);
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.addr)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("state", &self.state())
            .finish()
    }
}

async fn with_deadline<T, F>(deadline: Option<Duration>, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match deadline {
        Some(d) => timeout(d, fut)
            .await
            .map_err(|_| Error::Timeout(format!("{} after {:?}", what, d)))?,
        None => fut.await,
    }
}

/// 服务端回调，错误只记录不传播
pub trait ServerHandler: Send + Sync + 'static {
    fn on_client(&self, conn: &Arc<Connection>) -> impl Future<Output = Result<()>> + Send;

    fn on_recv(&self, conn: &Arc<Connection>, data: &[u8]) -> impl Future<Output = Result<()>> + Send;

    fn on_close(&self, conn: &Arc<Connection>) -> impl Future<Output = Result<()>> + Send;
}

/// 服务端计数
#[derive(Debug, Default)]
pub struct ServerStats {
    pub rx: AtomicU64,
    pub tx: AtomicU64,
    pub dropped: AtomicU64,
    pub accepted: AtomicU64,
    pub closed: AtomicU64,
    /// 连接表大小，只由控制循环写入
    pub clients: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServerCounters {
    pub rx: u64,
    pub tx: u64,
    pub dropped: u64,
    pub accepted: u64,
    pub closed: u64,
    pub clients: usize,
}

impl ServerStats {
    pub fn snapshot(&self) -> ServerCounters {
        ServerCounters {
            rx: self.rx.load(Ordering::Relaxed),
            tx: self.tx.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            clients: self.clients.load(Ordering::Acquire),
        }
    }
}

/// 服务端参数
#[derive(Debug, Clone, Copy)]
pub struct ServerOptions {
    /// 接入队列容量，控制循环处理慢时接入自然被节流
    pub incoming_capacity: usize,
    pub offboard_capacity: usize,
    pub handshake_timeout: Duration,
    pub deadlines: Deadlines,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            incoming_capacity: 4,
            offboard_capacity: 8,
            handshake_timeout: Duration::from_secs(10),
            deadlines: Deadlines::default(),
        }
    }
}

/// TCP/TLS 服务端
pub struct TcpServer {
    addr: String,
    local_addr: SocketAddr,
    tls: Option<TlsAcceptor>,
    listener: std::sync::Mutex<Option<TcpListener>>,
    listening: AtomicBool,
    options: ServerOptions,
    stats: Arc<ServerStats>,
    cancel: CancellationToken,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl TcpServer {
    /// 绑定监听地址；失败时返回错误，服务端不可用
    pub async fn bind(
        addr: &str,
        tls: Option<Arc<rustls::ServerConfig>>,
        options: ServerOptions,
    ) -> Result<Arc<Self>> {
        log::info!("TcpServer.listen {} (tls: {})", addr, tls.is_some());

        let listener = TcpListener::bind(addr).await.map_err(|e| {
            log::error!("TcpServer.listen {}: {}", addr, e);
            e
        })?;
        let local_addr = listener.local_addr()?;

        Ok(Arc::new(Self {
            addr: addr.to_string(),
            local_addr,
            tls: tls.map(TlsAcceptor::from),
            listener: std::sync::Mutex::new(Some(listener)),
            listening: AtomicBool::new(true),
            options,
            stats: Arc::new(ServerStats::default()),
            cancel: CancellationToken::new(),
            tasks: std::sync::Mutex::new(Vec::new()),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        self.stats.clone()
    }

    /// 启动接入循环和控制循环
    pub fn start<H: ServerHandler>(self: &Arc<Self>, handler: Arc<H>) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .ok()
            .and_then(|mut l| l.take())
            .ok_or_else(|| Error::Config(format!("{} is not listening", self.addr)))?;

        let (incoming_tx, incoming_rx) = mpsc::channel(self.options.incoming_capacity);
        let (offboard_tx, offboard_rx) = mpsc::channel(self.options.offboard_capacity);

        let accept = tokio::spawn(self.clone().go_accept(listener, incoming_tx));
        let control = tokio::spawn(self.clone().go_loop(handler, incoming_rx, offboard_rx, offboard_tx));

        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(accept);
            tasks.push(control);
        }
        Ok(())
    }

    /// 停止服务，可重复调用
    pub async fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        log::info!("TcpServer.close {}", self.addr);
        self.cancel.cancel();

        // 未启动时监听器仍在这里
        if let Ok(mut listener) = self.listener.lock() {
            listener.take();
        }
        self.listening.store(false, Ordering::Release);

        let tasks: Vec<_> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            let _ = task.await;
        }
    }

    async fn go_accept(self: Arc<Self>, listener: TcpListener, incoming: mpsc::Sender<Arc<Connection>>) {
        log::debug!("TcpServer.go_accept {}", self.local_addr);

        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => break,
                r = listener.accept() => r,
            };

            let (tcp, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::error!("TcpServer.go_accept: {}", e);
                    break;
                }
            };

            self.stats.accepted.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = tcp.set_nodelay(true) {
                log::warn!("TcpServer.go_accept {}: nodelay: {}", peer, e);
            }

            match &self.tls {
                Some(acceptor) => {
                    let acceptor = acceptor.clone();
                    let incoming = incoming.clone();
                    let options = self.options;
                    let cancel = self.cancel.clone();
                    tokio::spawn(async move {
                        let handshake = timeout(options.handshake_timeout, acceptor.accept(tcp));
                        let stream = tokio::select! {
                            _ = cancel.cancelled() => return,
                            r = handshake => r,
                        };
                        match stream {
                            Ok(Ok(stream)) => {
                                let conn = Connection::from_stream(Box::new(stream), &peer.to_string(), options.deadlines);
                                let _ = incoming.send(Arc::new(conn)).await;
                            }
                            Ok(Err(e)) => log::warn!("TcpServer.handshake {}: {}", peer, e),
                            Err(_) => log::warn!("TcpServer.handshake {}: timed out", peer),
                        }
                    });
                }
                None => {
                    let conn = Connection::from_stream(Box::new(tcp), &peer.to_string(), self.options.deadlines);
                    let sent = tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        r = incoming.send(Arc::new(conn)) => r,
                    };
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }

        drop(listener);
        self.listening.store(false, Ordering::Release);
        log::info!("TcpServer.go_accept: {} closed", self.local_addr);
    }

    /// 连接表的唯一修改者
    async fn go_loop<H: ServerHandler>(
        self: Arc<Self>,
        handler: Arc<H>,
        mut incoming: mpsc::Receiver<Arc<Connection>>,
        mut offboard: mpsc::Receiver<Arc<Connection>>,
        offboard_tx: mpsc::Sender<Arc<Connection>>,
    ) {
        log::debug!("TcpServer.go_loop {}", self.local_addr);
        let mut clients: HashMap<u64, Arc<Connection>> = HashMap::new();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                Some(conn) = incoming.recv() => {
                    log::debug!("TcpServer.add_client {}", conn);
                    if let Err(e) = handler.on_client(&conn).await {
                        log::warn!("TcpServer.on_client {}: {}", conn, e);
                    }
                    clients.insert(conn.id(), conn.clone());
                    self.stats.clients.store(clients.len(), Ordering::Release);

                    let server = self.clone();
                    let handler = handler.clone();
                    let offboard_tx = offboard_tx.clone();
                    tokio::spawn(async move { server.go_recv(conn, handler, offboard_tx).await });
                }
                Some(conn) = offboard.recv() => {
                    self.del_client(&mut clients, &conn, handler.as_ref()).await;
                }
            }
        }

        let remaining: Vec<_> = clients.values().cloned().collect();
        for conn in remaining {
            self.del_client(&mut clients, &conn, handler.as_ref()).await;
        }
        log::debug!("TcpServer.go_loop {} exited", self.local_addr);
    }

    async fn del_client<H: ServerHandler>(
        &self,
        clients: &mut HashMap<u64, Arc<Connection>>,
        conn: &Arc<Connection>,
        handler: &H,
    ) {
        // 重复的下线通知直接忽略
        if clients.remove(&conn.id()).is_none() {
            return;
        }
        log::debug!("TcpServer.del_client {}", conn);
        self.stats.closed.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = handler.on_close(conn).await {
            log::warn!("TcpServer.on_close {}: {}", conn, e);
        }
        conn.close().await;
        self.stats.clients.store(clients.len(), Ordering::Release);
    }

    async fn go_recv<H: ServerHandler>(
        &self,
        conn: Arc<Connection>,
        handler: Arc<H>,
        offboard: mpsc::Sender<Arc<Connection>>,
    ) {
        log::debug!("TcpServer.go_recv {}", conn);
        let mut data = vec![0u8; constants::MAX_MESSAGE_LENGTH];

        loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => return,
                r = conn.recv_msg(&mut data) => r,
            };

            match received {
                Ok(0) => continue,
                Ok(len) => {
                    self.stats.rx.fetch_add(1, Ordering::Relaxed);
                    log::debug!("TcpServer.go_recv {}: length {}", conn, len);
                    if let Err(e) = handler.on_recv(&conn, &data[..len]).await {
                        log::warn!("TcpServer.on_recv {}: {}", conn, e);
                    }
                }
                Err(e) => {
                    log::debug!("TcpServer.go_recv {}: {}", conn, e);
                    let _ = offboard.send(conn.clone()).await;
                    return;
                }
            }
        }
    }
}

/// TLS 配置辅助
pub mod tls {
    use std::sync::Arc;
    use std::time::SystemTime;

    use rustls::client::{ServerCertVerified, ServerCertVerifier};
    use rustls::{Certificate, PrivateKey, RootCertStore, ServerName};
    pub use rustls::{ClientConfig, ServerConfig};

    use crate::error::{Error, Result};

    struct SkipVerify;

    impl ServerCertVerifier for SkipVerify {
        fn verify_server_cert(
            &self,
            _end_entity: &Certificate,
            _intermediates: &[Certificate],
            _server_name: &ServerName,
            _scts: &mut dyn Iterator<Item = &[u8]>,
            _ocsp_response: &[u8],
            _now: SystemTime,
        ) -> std::result::Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }
    }

    /// 不校验服务端证书
    pub fn insecure_client_config() -> Arc<ClientConfig> {
        let config = ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(SkipVerify))
            .with_no_client_auth();
        Arc::new(config)
    }

    /// 只信任给定的CA证书（DER）
    pub fn client_config(ca_der: Vec<u8>) -> Result<Arc<ClientConfig>> {
        let mut roots = RootCertStore::empty();
        roots
            .add(&Certificate(ca_der))
            .map_err(|e| Error::Tls(format!("ca certificate: {}", e)))?;
        let config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Arc::new(config))
    }

    /// 服务端证书链和PKCS#8私钥（DER）
    pub fn server_config(cert_chain: Vec<Vec<u8>>, key_der: Vec<u8>) -> Result<Arc<ServerConfig>> {
        let certs = cert_chain.into_iter().map(Certificate).collect();
        let config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(certs, PrivateKey(key_der))?;
        Ok(Arc::new(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Connection, Connection) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            Connection::from_stream(Box::new(a), "a", Deadlines::default()),
            Connection::from_stream(Box::new(b), "b", Deadlines::default()),
        )
    }

    #[tokio::test]
    async fn messages_keep_their_boundaries() {
        let (a, b) = pair();
        a.send_msg(b"hello").await.unwrap();
        a.send_msg(b"world!").await.unwrap();

        let mut buf = [0u8; constants::MAX_MESSAGE_LENGTH];
        let n = b.recv_msg(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        let n = b.recv_msg(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"world!");

        assert_eq!(a.stats().snapshot().tx, 2);
        assert_eq!(b.stats().snapshot().rx, 2);
    }

    #[tokio::test]
    async fn bad_magic_is_an_invalid_frame() {
        let (mut raw, peer) = tokio::io::duplex(1024);
        let conn = Connection::from_stream(Box::new(peer), "peer", Deadlines::default());
        raw.write_all(&[0x12, 0x34, 0x00, 0x01, 0xaa]).await.unwrap();

        let mut buf = [0u8; 64];
        assert!(matches!(conn.recv_msg(&mut buf).await, Err(Error::InvalidFrame(_))));
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected() {
        let (a, b) = pair();
        a.send_msg(&[7u8; 100]).await.unwrap();
        let mut small = [0u8; 10];
        assert!(matches!(b.recv_msg(&mut small).await, Err(Error::InvalidFrame(_))));

        let too_big = vec![0u8; constants::MAX_PAYLOAD + 1];
        assert!(a.send_msg(&too_big).await.is_err());
        assert_eq!(a.stats().snapshot().dropped, 1);
    }

    #[tokio::test]
    async fn peer_close_ends_recv() {
        let (a, b) = pair();
        a.close().await;
        a.close().await;
        assert_eq!(a.state(), ConnState::Closed);

        let mut buf = [0u8; 64];
        assert!(matches!(b.recv_msg(&mut buf).await, Err(Error::ConnectionClosed(_))));
        assert!(matches!(a.send_msg(b"x").await, Err(Error::NotConnected(_))));
    }

    #[tokio::test]
    async fn close_interrupts_a_pending_read() {
        let (_a, b) = pair();
        let b = Arc::new(b);
        let reader = {
            let b = b.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 64];
                b.recv_msg(&mut buf).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        b.close().await;

        let result = timeout(Duration::from_secs(1), reader).await.unwrap().unwrap();
        assert!(matches!(result, Err(Error::ConnectionClosed(_))));
    }

    #[tokio::test]
    async fn read_deadline_bounds_an_idle_read() {
        let (a, b) = tokio::io::duplex(1024);
        let _keep = a;
        let deadlines = Deadlines {
            read: Some(Duration::from_millis(20)),
            ..Deadlines::default()
        };
        let conn = Connection::from_stream(Box::new(b), "idle", deadlines);

        let mut buf = [0u8; 64];
        assert!(matches!(conn.recv_msg(&mut buf).await, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn stale_close_leaves_a_fresh_link_alone() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let conn = Connection::new(&addr, None, Deadlines::default());

        conn.connect().await.unwrap();
        let first = conn.generation();
        conn.close().await;
        conn.connect().await.unwrap();
        assert_ne!(conn.generation(), first);

        conn.close_generation(first).await;
        assert!(conn.is_open());

        let _old = listener.accept().await.unwrap();
        let (mut live, _) = listener.accept().await.unwrap();
        conn.send_msg(b"ping").await.unwrap();
        let mut wire = [0u8; 8];
        live.read_exact(&mut wire).await.unwrap();
        assert_eq!(&wire, b"\xff\xff\x00\x04ping");

        conn.close_generation(conn.generation()).await;
        assert_eq!(conn.state(), ConnState::Closed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn close_and_connect_do_not_interleave() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let mut kept = Vec::new();
            while let Ok((tcp, _)) = listener.accept().await {
                kept.push(tcp);
            }
        });

        let conn = Arc::new(Connection::new(&addr, None, Deadlines::default()));
        let mut buf = [0u8; 64];
        for _ in 0..50 {
            conn.connect().await.unwrap();
            let closer = {
                let conn = conn.clone();
                tokio::spawn(async move { conn.close().await })
            };
            let dialer = {
                let conn = conn.clone();
                tokio::spawn(async move { conn.connect().await })
            };
            closer.await.unwrap();
            dialer.await.unwrap().unwrap();

            // 状态与读写端保持一致
            if conn.is_open() {
                conn.send_msg(b"x").await.unwrap();
                assert!(timeout(Duration::from_millis(20), conn.recv_msg(&mut buf)).await.is_err());
            } else {
                assert_eq!(conn.state(), ConnState::Closed);
                assert!(matches!(conn.send_msg(b"x").await, Err(Error::NotConnected(_))));
            }
        }
        server.abort();
    }

    #[tokio::test]
    async fn closed_resolves_once_the_link_goes_down() {
        let (a, _b) = pair();
        let a = Arc::new(a);
        let waiter = {
            let a = a.clone();
            tokio::spawn(async move { a.closed().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        a.close().await;
        timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        timeout(Duration::from_millis(100), a.closed()).await.unwrap();
    }

    #[tokio::test]
    async fn client_reports_state_and_uptime() {
        let conn = Connection::new("127.0.0.1:1", None, Deadlines::default());
        assert_eq!(conn.state(), ConnState::Init);
        assert_eq!(conn.uptime(), 0);
        assert_eq!(conn.state().to_string(), "init");
    }
}
