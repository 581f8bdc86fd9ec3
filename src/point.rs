/*!
OverLAN接入点

把本地虚拟设备和一条隧道连接双向桥接起来，包括：
- 设备工作者（设备 ↔ 队列）
- 隧道工作者（隧道 ↔ 队列，断线重连）
- 两个方向各一个有界队列，满时丢弃并计数
- 共享的取消范围
*/

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::network::{Connection, Deadlines};
use crate::protocol::{self, constants, Action, Frame};
use crate::virtual_device::{Device, DeviceConfig};

/// 重连退避参数
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    fn next(&self, current: Duration) -> Duration {
        (current * 2).min(self.max)
    }

    fn jittered(&self, current: Duration) -> Duration {
        let jitter = rand::thread_rng().gen_range(0..=current.as_millis() as u64 / 4);
        current + Duration::from_millis(jitter)
    }
}

/// 接入点配置
#[derive(Clone)]
pub struct PointConfig {
    /// 交换机地址 host:port
    pub addr: String,
    pub tls: Option<Arc<rustls::ClientConfig>>,
    pub device: DeviceConfig,
    /// 每个方向的队列容量
    pub queue_size: usize,
    pub deadlines: Deadlines,
    pub retry: RetryPolicy,
}

impl PointConfig {
    pub fn new(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
            tls: None,
            device: DeviceConfig::default(),
            queue_size: 1024,
            deadlines: Deadlines::default(),
            retry: RetryPolicy::default(),
        }
    }
}

/// 主机侧链路配置（网桥、地址），由外部实现
pub trait Uplink: Send + Sync {
    fn up(&self, if_name: &str) -> Result<()>;

    fn down(&self, if_name: &str) -> Result<()>;
}

/// 单方向的转发计数
#[derive(Debug, Default)]
pub struct RelayStats {
    pub forwarded: AtomicU64,
    pub dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelayCounters {
    pub forwarded: u64,
    pub dropped: u64,
}

impl RelayStats {
    pub fn snapshot(&self) -> RelayCounters {
        RelayCounters {
            forwarded: self.forwarded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// 两个方向的转发计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PointStats {
    /// 设备 → 隧道
    pub to_tunnel: RelayCounters,
    /// 隧道 → 设备
    pub to_device: RelayCounters,
}

/// 有界队列的发送端：满了就丢弃
#[derive(Clone)]
struct Relay {
    tx: mpsc::Sender<Vec<u8>>,
    stats: Arc<RelayStats>,
}

impl Relay {
    fn deliver(&self, frame: Vec<u8>) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(frame)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("Relay.deliver: queue full, drop {} bytes", frame.len());
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

/// 设备侧工作者
pub struct TapWorker<D: Device> {
    device: Arc<D>,
}

impl<D: Device> TapWorker<D> {
    pub fn new(device: Arc<D>) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    /// 设备 → 隧道队列
    async fn go_recv(device: Arc<D>, to_tunnel: Relay, cancel: CancellationToken) {
        log::debug!("TapWorker.go_recv {}", device.name());
        let mut buf = vec![0u8; constants::MAX_PAYLOAD];

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                r = device.recv(&mut buf) => r,
            };
            match received {
                Ok(0) => continue,
                Ok(len) => {
                    log::debug!("TapWorker.go_recv {}: {:02x?}", device.name(), &buf[..len]);
                    to_tunnel.deliver(buf[..len].to_vec());
                }
                Err(e) => {
                    log::error!("TapWorker.go_recv {}: {}", device.name(), e);
                    break;
                }
            }
        }
    }

    /// 隧道队列 → 设备
    async fn go_loop(device: Arc<D>, mut from_tunnel: mpsc::Receiver<Vec<u8>>, stats: Arc<RelayStats>, cancel: CancellationToken) {
        log::debug!("TapWorker.go_loop {}", device.name());

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                f = from_tunnel.recv() => match f {
                    Some(frame) => frame,
                    None => break,
                },
            };

            let sent = tokio::select! {
                _ = cancel.cancelled() => break,
                r = device.send(&frame) => r,
            };
            match sent {
                Ok(_) => {
                    stats.forwarded.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    stats.dropped.fetch_add(1, Ordering::Relaxed);
                    log::warn!("TapWorker.go_loop {}: {}", device.name(), e);
                }
            }
        }
    }

    pub fn stop(&self) {
        self.device.close();
    }
}

/// 隧道侧工作者
pub struct TcpWorker {
    conn: Arc<Connection>,
    retry: RetryPolicy,
}

impl TcpWorker {
    pub fn new(conn: Arc<Connection>, retry: RetryPolicy) -> Self {
        Self { conn, retry }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub async fn connect(&self) -> Result<()> {
        self.conn.connect().await
    }

    /// 隧道 → 设备队列
    async fn go_recv(conn: Arc<Connection>, to_device: Relay, retry: RetryPolicy, cancel: CancellationToken) {
        log::debug!("TcpWorker.go_recv {}", conn);
        let mut buf = vec![0u8; constants::MAX_MESSAGE_LENGTH];

        loop {
            if !conn.is_open() {
                // 等待 go_loop 重连
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(retry.initial) => continue,
                }
            }

            let generation = conn.generation();
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                r = conn.recv_msg(&mut buf) => r,
            };
            match received {
                Ok(0) => continue,
                Ok(len) => {
                    let frame = Frame::new(&buf[..len]);
                    if frame.is_inst() {
                        Self::on_instruction(&conn, frame.data());
                    } else {
                        to_device.deliver(frame.data().to_vec());
                    }
                }
                Err(e) => {
                    log::warn!("TcpWorker.go_recv {}: {}", conn, e);
                    // 关闭会唤醒 go_loop 重连
                    conn.close_generation(generation).await;
                }
            }
        }
    }

    fn on_instruction(conn: &Connection, frame: &[u8]) {
        let (action, body) = protocol::decode_action_body(frame);
        match Action::parse(&action) {
            Action::Neighbor => log::debug!("TcpWorker.on_instruction {}: {} {}", conn, action, body),
            Action::Unknown(action) => log::debug!("TcpWorker.on_instruction {}: ignore {}", conn, action),
        }
    }

    /// 设备队列 → 隧道，负责断线重连
    ///
    /// 只在链路打开时从队列取帧，断线期间帧留在队列里。
    async fn go_loop(
        conn: Arc<Connection>,
        mut from_device: mpsc::Receiver<Vec<u8>>,
        stats: Arc<RelayStats>,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) {
        log::debug!("TcpWorker.go_loop {}", conn);
        let mut backoff = retry.initial;
        let mut pending: Option<Vec<u8>> = None;

        loop {
            // 停止时先取消再关闭连接，这里不能再重连
            if cancel.is_cancelled() {
                break;
            }
            if !conn.is_open() {
                let connected = tokio::select! {
                    _ = cancel.cancelled() => break,
                    r = conn.connect() => r,
                };
                match connected {
                    Ok(()) => backoff = retry.initial,
                    Err(e) => {
                        let wait = retry.jittered(backoff);
                        log::warn!("TcpWorker.go_loop {}: {}, retry in {:?}", conn, e, wait);
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(wait) => {}
                        }
                        backoff = retry.next(backoff);
                        continue;
                    }
                }
            }

            let generation = conn.generation();
            let frame = match pending.take() {
                Some(frame) => frame,
                None => tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = conn.closed() => continue,
                    f = from_device.recv() => match f {
                        Some(frame) => frame,
                        None => break,
                    },
                },
            };

            match conn.send_msg(&frame).await {
                Ok(_) => {
                    stats.forwarded.fetch_add(1, Ordering::Relaxed);
                }
                Err(Error::NotConnected(_)) => {
                    // 链路刚断开，一个字节都没写出去，重连后再发
                    pending = Some(frame);
                }
                Err(e) => {
                    stats.dropped.fetch_add(1, Ordering::Relaxed);
                    log::warn!("TcpWorker.go_loop {}: {}", conn, e);
                    if !matches!(e, Error::InvalidFrame(_)) {
                        conn.close_generation(generation).await;
                    }
                }
            }
        }
    }

    pub async fn stop(&self) {
        self.conn.close().await;
    }
}

/// 接入点
pub struct Point<D: Device> {
    config: PointConfig,
    uplink: Option<Box<dyn Uplink>>,
    tcp_worker: Option<TcpWorker>,
    tap_worker: Option<TapWorker<D>>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    to_tunnel: Arc<RelayStats>,
    to_device: Arc<RelayStats>,
    linked: bool,
    stopped: bool,
}

impl<D: Device> Point<D> {
    pub fn new(config: PointConfig) -> Self {
        let conn = Connection::new(&config.addr, config.tls.clone(), config.deadlines);
        let tcp_worker = TcpWorker::new(Arc::new(conn), config.retry);
        Self {
            config,
            uplink: None,
            tcp_worker: Some(tcp_worker),
            tap_worker: None,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
            to_tunnel: Arc::new(RelayStats::default()),
            to_device: Arc::new(RelayStats::default()),
            linked: false,
            stopped: false,
        }
    }

    /// 使用已经创建好的设备
    pub fn with_device(mut self, device: D) -> Self {
        log::info!("Point.device {}", device.name());
        self.tap_worker = Some(TapWorker::new(Arc::new(device)));
        self
    }

    pub fn with_uplink(mut self, uplink: Box<dyn Uplink>) -> Self {
        self.uplink = Some(uplink);
        self
    }

    fn new_device(&mut self) -> Result<()> {
        let device = D::open(&self.config.device).map_err(|e| {
            log::error!("Point.new_device: {}", e);
            e
        })?;
        log::info!("Point.device {}", device.name());
        self.tap_worker = Some(TapWorker::new(Arc::new(device)));
        Ok(())
    }

    /// 启动；设备无法创建时返回 [`Error::DeviceUnavailable`]
    pub async fn start(&mut self) -> Result<()> {
        if self.stopped {
            return Err(Error::Config("point already stopped".to_string()));
        }
        if !self.tasks.is_empty() {
            return Ok(());
        }
        log::debug!("Point.start {}", self.config.addr);

        if self.tap_worker.is_none() {
            self.new_device()?;
        }
        let (device, conn) = match (&self.tap_worker, &self.tcp_worker) {
            (Some(tap), Some(tcp)) => (tap.device().clone(), tcp.connection().clone()),
            _ => return Err(Error::DeviceUnavailable("no device".to_string())),
        };

        if let Some(uplink) = &self.uplink {
            match uplink.up(device.name()) {
                Ok(()) => self.linked = true,
                Err(e) => log::error!("Point.up_link {}: {}", device.name(), e),
            }
        }

        if let Err(e) = conn.connect().await {
            log::error!("Point.start {}: {}", self.config.addr, e);
        }

        let (to_tunnel_tx, to_tunnel_rx) = mpsc::channel(self.config.queue_size);
        let (to_device_tx, to_device_rx) = mpsc::channel(self.config.queue_size);
        let to_tunnel = Relay {
            tx: to_tunnel_tx,
            stats: self.to_tunnel.clone(),
        };
        let to_device = Relay {
            tx: to_device_tx,
            stats: self.to_device.clone(),
        };
        let retry = self.config.retry;

        self.tasks.push(tokio::spawn(TapWorker::go_recv(device.clone(), to_tunnel, self.cancel.clone())));
        self.tasks.push(tokio::spawn(TapWorker::go_loop(
            device,
            to_device_rx,
            self.to_device.clone(),
            self.cancel.clone(),
        )));
        self.tasks.push(tokio::spawn(TcpWorker::go_recv(conn.clone(), to_device, retry, self.cancel.clone())));
        self.tasks.push(tokio::spawn(TcpWorker::go_loop(
            conn,
            to_tunnel_rx,
            self.to_tunnel.clone(),
            retry,
            self.cancel.clone(),
        )));

        Ok(())
    }

    /// 停止；可重复调用，未完整启动时也不会失败
    pub async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        log::info!("Point.stop {}", self.if_name());

        self.cancel.cancel();
        if let Some(tcp) = &self.tcp_worker {
            tcp.stop().await;
        }
        if let (Some(uplink), Some(tap)) = (&self.uplink, &self.tap_worker) {
            if self.linked {
                if let Err(e) = uplink.down(tap.device().name()) {
                    log::error!("Point.down_link {}: {}", tap.device().name(), e);
                }
            }
        }
        if let Some(tap) = &self.tap_worker {
            tap.stop();
        }

        for task in self.tasks.drain(..) {
            match tokio::time::timeout(Duration::from_secs(5), task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::error!("Point.stop: worker failed: {}", e),
                Err(_) => log::warn!("Point.stop: worker did not exit in time"),
            }
        }
    }

    pub fn connection(&self) -> Option<&Arc<Connection>> {
        self.tcp_worker.as_ref().map(TcpWorker::connection)
    }

    pub fn device(&self) -> Option<&Arc<D>> {
        self.tap_worker.as_ref().map(TapWorker::device)
    }

    pub fn uptime(&self) -> u64 {
        self.connection().map(|c| c.uptime()).unwrap_or(0)
    }

    pub fn state(&self) -> String {
        self.connection()
            .map(|c| c.state().to_string())
            .unwrap_or_default()
    }

    pub fn addr(&self) -> String {
        self.connection()
            .map(|c| c.addr().to_string())
            .unwrap_or_default()
    }

    pub fn if_name(&self) -> String {
        self.device().map(|d| d.name().to_string()).unwrap_or_default()
    }

    pub fn stats(&self) -> PointStats {
        PointStats {
            to_tunnel: self.to_tunnel.snapshot(),
            to_device: self.to_device.snapshot(),
        }
    }
}
