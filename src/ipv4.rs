/*!
IPv4报文头编解码

固定20字节报头的逐字节解码与编码。编码时原样写回已存储的校验和，
不会重新计算；需要时显式调用 [`Ipv4Header::with_checksum`]。
*/

use std::net::Ipv4Addr;

use crate::error::{Error, Result};

pub const IPV4_VER: u8 = 0x04;

/// 最小报头长度
pub const IPV4_LEN: usize = 20;

/// IP协议号
pub mod proto {
    pub const ICMP: u8 = 0x01;
    pub const IGMP: u8 = 0x02;
    pub const IPIP: u8 = 0x04;
    pub const TCP: u8 = 0x06;
    pub const UDP: u8 = 0x11;
    pub const ESP: u8 = 0x32;
    pub const AH: u8 = 0x33;
    pub const OSPF: u8 = 0x59;
    pub const PIM: u8 = 0x67;
    pub const VRRP: u8 = 0x70;
    pub const ISIS: u8 = 0x7c;
}

/// 协议号对应的名称，仅用于分类和日志
pub fn protocol_name(protocol: u8) -> &'static str {
    match protocol {
        proto::ICMP => "icmp",
        proto::IGMP => "igmp",
        proto::IPIP => "ipip",
        proto::TCP => "tcp",
        proto::UDP => "udp",
        proto::ESP => "esp",
        proto::AH => "ah",
        proto::OSPF => "ospf",
        proto::PIM => "pim",
        proto::VRRP => "vrrp",
        proto::ISIS => "isis",
        _ => "unknown",
    }
}

/// IPv4报头
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Header {
    pub version: u8,
    /// 以4字节为单位
    pub header_len: u8,
    pub tos: u8,
    pub total_len: u16,
    pub identifier: u16,
    /// 3位: Z|DF|MF
    pub flags: u8,
    /// 13位
    pub frag_offset: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    /// 报头声明的字节长度
    pub len: usize,
}

impl Default for Ipv4Header {
    fn default() -> Self {
        Self {
            version: IPV4_VER,
            header_len: 0x05,
            tos: 0,
            total_len: 0,
            identifier: 0,
            flags: 0,
            frag_offset: 0,
            ttl: 0xff,
            protocol: 0,
            checksum: 0,
            source: Ipv4Addr::UNSPECIFIED,
            destination: Ipv4Addr::UNSPECIFIED,
            len: IPV4_LEN,
        }
    }
}

impl Ipv4Header {
    pub fn decode(frame: &[u8]) -> Result<Self> {
        if frame.len() < IPV4_LEN {
            return Err(Error::ShortBuffer {
                expected: IPV4_LEN,
                actual: frame.len(),
            });
        }

        let version = frame[0] >> 4;
        if version != IPV4_VER {
            return Err(Error::VersionMismatch(version));
        }

        let fragment = u16::from_be_bytes([frame[6], frame[7]]);

        Ok(Self {
            version,
            header_len: frame[0] & 0x0f,
            tos: frame[1],
            total_len: u16::from_be_bytes([frame[2], frame[3]]),
            identifier: u16::from_be_bytes([frame[4], frame[5]]),
            flags: (fragment >> 13) as u8,
            frag_offset: fragment & 0x1fff,
            ttl: frame[8],
            protocol: frame[9],
            checksum: u16::from_be_bytes([frame[10], frame[11]]),
            source: Ipv4Addr::new(frame[12], frame[13], frame[14], frame[15]),
            destination: Ipv4Addr::new(frame[16], frame[17], frame[18], frame[19]),
            len: IPV4_LEN,
        })
    }

    /// 按相同布局重新打包，校验和原样写回
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = vec![0u8; IPV4_LEN];

        buffer[0] = (self.version << 4) | (self.header_len & 0x0f);
        buffer[1] = self.tos;
        buffer[2..4].copy_from_slice(&self.total_len.to_be_bytes());
        buffer[4..6].copy_from_slice(&self.identifier.to_be_bytes());
        let fragment = (u16::from(self.flags & 0x07) << 13) | (self.frag_offset & 0x1fff);
        buffer[6..8].copy_from_slice(&fragment.to_be_bytes());
        buffer[8] = self.ttl;
        buffer[9] = self.protocol;
        buffer[10..12].copy_from_slice(&self.checksum.to_be_bytes());
        buffer[12..16].copy_from_slice(&self.source.octets());
        buffer[16..20].copy_from_slice(&self.destination.octets());

        buffer
    }

    pub fn is_ip4(&self) -> bool {
        self.version == IPV4_VER
    }

    pub fn protocol_name(&self) -> &'static str {
        protocol_name(self.protocol)
    }

    /// 按当前字段计算报头校验和（校验和字段视为0）
    pub fn compute_checksum(&self) -> u16 {
        let mut buffer = self.encode();
        buffer[10] = 0;
        buffer[11] = 0;
        calculate_checksum(&buffer)
    }

    /// 返回填入正确校验和的副本
    pub fn with_checksum(mut self) -> Self {
        self.checksum = self.compute_checksum();
        self
    }
}

/// 计算互联网校验和
pub fn calculate_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u32::from(u16::from_be_bytes([pair[0], pair[1]]));
    }

    // 处理剩余的字节
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }

    // 折叠进位
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !(sum as u16)
}
