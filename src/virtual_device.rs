/*!
OverLAN虚拟设备模块

管理本地虚拟网络接口，包括：
- 设备抽象（收发一帧）
- Linux TAP/TUN 设备的创建
- 内存管道设备，用于测试和嵌入
*/

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};

use crate::error::{Error, Result};

/// 设备类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// 二层设备，收发以太网帧
    #[default]
    Tap,
    /// 三层设备，收发IP报文
    Tun,
}

/// 虚拟设备配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// 为空时由内核分配
    pub name: String,
    pub device_type: DeviceType,
    pub mtu: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            device_type: DeviceType::Tap,
            mtu: 1500,
        }
    }
}

/// 本地虚拟设备
pub trait Device: Send + Sync + 'static {
    /// 打开或创建设备
    fn open(config: &DeviceConfig) -> Result<Self>
    where
        Self: Sized;

    fn name(&self) -> &str;

    /// 读取一帧
    fn recv(&self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send;

    /// 写入一帧
    fn send(&self, frame: &[u8]) -> impl Future<Output = io::Result<usize>> + Send;

    fn close(&self);
}

#[cfg(target_os = "linux")]
pub use linux::TapDevice;

#[cfg(target_os = "linux")]
mod linux {
    use std::ffi::CStr;
    use std::fs::{File, OpenOptions};
    use std::io::{self, Read, Write};
    use std::os::unix::fs::OpenOptionsExt;
    use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
    use std::sync::atomic::{AtomicBool, Ordering};

    use nix::libc;
    use tokio::io::unix::AsyncFd;

    use super::{Device, DeviceConfig, DeviceType};
    use crate::error::{Error, Result};

    const CLONE_DEVICE: &str = "/dev/net/tun";

    nix::ioctl_write_int!(tunsetiff, b'T', 202);
    nix::ioctl_write_ptr_bad!(siocsifmtu, libc::SIOCSIFMTU, libc::ifreq);

    /// 最小的IPv4 MTU
    const MIN_MTU: u32 = 68;

    fn ifreq(name: &str) -> libc::ifreq {
        // SAFETY: ifreq 是纯数据结构，全零是合法值
        let mut req: libc::ifreq = unsafe { std::mem::zeroed() };
        for (dst, src) in req
            .ifr_name
            .iter_mut()
            .zip(name.bytes().take(libc::IFNAMSIZ - 1))
        {
            *dst = src as libc::c_char;
        }
        req
    }

    fn mtu_request(name: &str, mtu: u32) -> io::Result<libc::ifreq> {
        let value = libc::c_int::try_from(mtu)
            .ok()
            .filter(|_| mtu >= MIN_MTU)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("mtu {} out of range", mtu)))?;
        let mut req = ifreq(name);
        req.ifr_ifru.ifru_mtu = value;
        Ok(req)
    }

    /// 通过控制套接字设置接口MTU
    fn set_mtu(name: &str, mtu: u32) -> io::Result<()> {
        let req = mtu_request(name, mtu)?;

        // SAFETY: 只创建一个普通的数据报套接字
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd 刚创建且未被其他地方持有
        let sock = unsafe { OwnedFd::from_raw_fd(fd) };

        // SAFETY: sock 有效，req 在调用期间存活
        unsafe { siocsifmtu(sock.as_raw_fd(), &req) }.map_err(io::Error::from)?;
        log::debug!("TapDevice.set_mtu {} {}", name, mtu);
        Ok(())
    }

    /// Linux TAP/TUN 设备
    pub struct TapDevice {
        fd: AsyncFd<File>,
        name: String,
        closed: AtomicBool,
    }

    impl TapDevice {
        fn create(config: &DeviceConfig) -> io::Result<Self> {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(CLONE_DEVICE)?;

            let mut req = ifreq(&config.name);
            let mode = match config.device_type {
                DeviceType::Tap => libc::IFF_TAP,
                DeviceType::Tun => libc::IFF_TUN,
            };
            req.ifr_ifru.ifru_flags = (mode | libc::IFF_NO_PI) as libc::c_short;

            // SAFETY: fd 有效，req 在调用期间存活
            unsafe {
                tunsetiff(
                    file.as_raw_fd(),
                    &mut req as *mut libc::ifreq as nix::sys::ioctl::ioctl_param_type,
                )
            }
            .map_err(io::Error::from)?;

            // SAFETY: 内核写回的名字以 NUL 结尾
            let name = unsafe { CStr::from_ptr(req.ifr_name.as_ptr()) }
                .to_string_lossy()
                .into_owned();
            set_mtu(&name, config.mtu)?;

            Ok(Self {
                fd: AsyncFd::new(file)?,
                name,
                closed: AtomicBool::new(false),
            })
        }

        fn check_open(&self) -> io::Result<()> {
            if self.closed.load(Ordering::Acquire) {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "device closed"));
            }
            Ok(())
        }
    }

    impl Device for TapDevice {
        fn open(config: &DeviceConfig) -> Result<Self> {
            let device = Self::create(config)
                .map_err(|e| Error::DeviceUnavailable(format!("{} {:?}: {}", CLONE_DEVICE, config.name, e)))?;
            log::info!("TapDevice.open {} ({:?}, mtu {})", device.name, config.device_type, config.mtu);
            Ok(device)
        }

        fn name(&self) -> &str {
            &self.name
        }

        async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
            loop {
                self.check_open()?;
                let mut guard = self.fd.readable().await?;
                match guard.try_io(|inner| {
                    let mut file: &File = inner.get_ref();
                    file.read(buf)
                }) {
                    Ok(result) => return result,
                    Err(_would_block) => continue,
                }
            }
        }

        async fn send(&self, frame: &[u8]) -> io::Result<usize> {
            loop {
                self.check_open()?;
                let mut guard = self.fd.writable().await?;
                match guard.try_io(|inner| {
                    let mut file: &File = inner.get_ref();
                    file.write(frame)
                }) {
                    Ok(result) => return result,
                    Err(_would_block) => continue,
                }
            }
        }

        fn close(&self) {
            if !self.closed.swap(true, Ordering::AcqRel) {
                log::info!("TapDevice.close {}", self.name);
            }
        }
    }

}

/// 其他平台暂不支持
#[cfg(not(target_os = "linux"))]
pub struct TapDevice {
    name: String,
}

#[cfg(not(target_os = "linux"))]
impl Device for TapDevice {
    fn open(config: &DeviceConfig) -> Result<Self> {
        Err(Error::DeviceUnavailable(format!(
            "{:?} devices are not supported on this platform ({})",
            config.device_type, config.name
        )))
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn recv(&self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    async fn send(&self, _frame: &[u8]) -> io::Result<usize> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    fn close(&self) {}
}

/// 内存管道设备：另一端由 [`PipeHandle`] 持有
pub struct PipeDevice {
    name: String,
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    tx: mpsc::Sender<Vec<u8>>,
    closed: AtomicBool,
}

/// 管道设备的另一端
pub struct PipeHandle {
    /// 写入后设备 `recv` 可读到
    pub to_device: mpsc::Sender<Vec<u8>>,
    /// 设备 `send` 写出的帧
    pub from_device: mpsc::Receiver<Vec<u8>>,
}

impl PipeDevice {
    pub fn pair(name: &str, capacity: usize) -> (Self, PipeHandle) {
        let (to_device, rx) = mpsc::channel(capacity);
        let (tx, from_device) = mpsc::channel(capacity);
        (
            Self {
                name: name.to_string(),
                rx: Mutex::new(rx),
                tx,
                closed: AtomicBool::new(false),
            },
            PipeHandle { to_device, from_device },
        )
    }
}

impl Device for PipeDevice {
    /// 管道设备只能通过 [`PipeDevice::pair`] 创建
    fn open(config: &DeviceConfig) -> Result<Self> {
        Err(Error::DeviceUnavailable(format!(
            "pipe device {:?} has no peer",
            config.name
        )))
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        let frame = self
            .rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::from(io::ErrorKind::BrokenPipe))?;
        let len = frame.len().min(buf.len());
        buf[..len].copy_from_slice(&frame[..len]);
        Ok(len)
    }

    async fn send(&self, frame: &[u8]) -> io::Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        self.tx
            .send(frame.to_vec())
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        Ok(frame.len())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
