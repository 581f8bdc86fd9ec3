/*!
OverLAN - 覆盖网络上的虚拟局域网

接入点把本地虚拟网卡的二层帧经由 TCP/TLS 隧道送到交换机，交换机通过观察ARP
学习邻居并转发。本库包括：
- IPv4 报文头编解码
- 隧道报文格式与帧分类
- TCP/TLS 连接与服务端
- 邻居表
- 虚拟设备、接入点与交换机
*/

pub mod error;
pub mod ethernet;
pub mod ipv4;
pub mod neighbor;
pub mod network;
pub mod point;
pub mod protocol;
pub mod switch;
pub mod virtual_device;

pub use error::{Error, Result};
pub use neighbor::{Neighbor, NeighborSink, NeighborTable};
pub use network::{Connection, ConnState, ServerHandler, TcpServer};
pub use point::{Point, PointConfig, Uplink};
pub use switch::Switch;
pub use virtual_device::{Device, DeviceConfig, DeviceType, TapDevice};

/// OverLAN version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 交换机默认端口
pub const DEFAULT_PORT: u16 = 10002;

/// 虚拟设备默认MTU
pub const DEFAULT_MTU: u32 = 1500;
