/*!
以太网与ARP报文的边界解析

基于 pnet 的报文视图，只取学习逻辑需要的字段。
*/

use std::net::Ipv4Addr;

use pnet::packet::arp::{ArpOperation, ArpOperations, ArpPacket};
use pnet::packet::ethernet::{EtherType, EtherTypes, EthernetPacket};
pub use pnet::util::MacAddr;

use crate::error::{Error, Result};

pub const ETHER_LEN: usize = 14;
pub const ARP_LEN: usize = 28;

/// 解码后的以太网头
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ether {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub ether_type: EtherType,
    /// 头部长度，负载从这里开始
    pub len: usize,
}

impl Ether {
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let eth = EthernetPacket::new(frame).ok_or(Error::ShortBuffer {
            expected: ETHER_LEN,
            actual: frame.len(),
        })?;

        Ok(Self {
            dst: eth.get_destination(),
            src: eth.get_source(),
            ether_type: eth.get_ethertype(),
            len: ETHER_LEN,
        })
    }

    pub fn is_arp(&self) -> bool {
        self.ether_type == EtherTypes::Arp
    }

    pub fn is_vlan(&self) -> bool {
        self.ether_type == EtherTypes::Vlan || self.ether_type == EtherTypes::QinQ
    }

    pub fn is_ip4(&self) -> bool {
        self.ether_type == EtherTypes::Ipv4
    }
}

/// 解码后的ARP报文
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arp {
    pub op_code: ArpOperation,
    pub proto_type: EtherType,
    pub proto_len: u8,
    pub s_hw_addr: MacAddr,
    pub s_ip_addr: Ipv4Addr,
    pub t_hw_addr: MacAddr,
    pub t_ip_addr: Ipv4Addr,
}

impl Arp {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let arp = ArpPacket::new(payload).ok_or(Error::ShortBuffer {
            expected: ARP_LEN,
            actual: payload.len(),
        })?;

        Ok(Self {
            op_code: arp.get_operation(),
            proto_type: arp.get_protocol_type(),
            proto_len: arp.get_proto_addr_len(),
            s_hw_addr: arp.get_sender_hw_addr(),
            s_ip_addr: arp.get_sender_proto_addr(),
            t_hw_addr: arp.get_target_hw_addr(),
            t_ip_addr: arp.get_target_proto_addr(),
        })
    }

    pub fn is_ip4(&self) -> bool {
        self.proto_type == EtherTypes::Ipv4 && usize::from(self.proto_len) == 4
    }

    /// 只有请求和应答参与学习
    pub fn is_learnable(&self) -> bool {
        self.op_code == ArpOperations::Request || self.op_code == ArpOperations::Reply
    }
}

/// 取出以太网负载
pub fn payload(frame: &[u8]) -> Option<&[u8]> {
    frame.get(ETHER_LEN..)
}

pub fn is_multicast(mac: &MacAddr) -> bool {
    mac.0 & 0x01 == 0x01
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use pnet::packet::arp::{ArpHardwareTypes, MutableArpPacket};
    use pnet::packet::ethernet::MutableEthernetPacket;

    /// 构造一个完整的ARP以太网帧
    pub fn arp_frame(op: ArpOperation, sender: MacAddr, sender_ip: Ipv4Addr) -> Vec<u8> {
        let mut buffer = vec![0u8; ETHER_LEN + ARP_LEN];
        {
            let mut eth = MutableEthernetPacket::new(&mut buffer).unwrap();
            eth.set_destination(MacAddr::broadcast());
            eth.set_source(sender);
            eth.set_ethertype(EtherTypes::Arp);
        }
        {
            let mut arp = MutableArpPacket::new(&mut buffer[ETHER_LEN..]).unwrap();
            arp.set_hardware_type(ArpHardwareTypes::Ethernet);
            arp.set_protocol_type(EtherTypes::Ipv4);
            arp.set_hw_addr_len(6);
            arp.set_proto_addr_len(4);
            arp.set_operation(op);
            arp.set_sender_hw_addr(sender);
            arp.set_sender_proto_addr(sender_ip);
            arp.set_target_hw_addr(MacAddr::zero());
            arp.set_target_proto_addr(Ipv4Addr::new(10, 0, 0, 1));
        }
        buffer
    }

    /// 构造一个以太网帧，负载任意
    pub fn ether_frame(dst: MacAddr, src: MacAddr, ether_type: EtherType, payload: &[u8]) -> Vec<u8> {
        let mut buffer = vec![0u8; ETHER_LEN + payload.len()];
        {
            let mut eth = MutableEthernetPacket::new(&mut buffer).unwrap();
            eth.set_destination(dst);
            eth.set_source(src);
            eth.set_ethertype(ether_type);
        }
        buffer[ETHER_LEN..].copy_from_slice(payload);
        buffer
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn decodes_arp_reply() {
        let sender = MacAddr::new(0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff);
        let frame = arp_frame(ArpOperations::Reply, sender, Ipv4Addr::new(10, 0, 0, 5));

        let eth = Ether::decode(&frame).unwrap();
        assert!(eth.is_arp());
        assert_eq!(eth.src, sender);
        assert!(is_multicast(&eth.dst));

        let arp = Arp::decode(&frame[eth.len..]).unwrap();
        assert!(arp.is_ip4());
        assert!(arp.is_learnable());
        assert_eq!(arp.s_hw_addr.to_string(), "aa:bb:cc:dd:ee:ff");
        assert_eq!(arp.s_ip_addr, Ipv4Addr::new(10, 0, 0, 5));
    }

    #[test]
    fn short_frames_are_rejected() {
        assert!(matches!(Ether::decode(&[0u8; 10]), Err(Error::ShortBuffer { .. })));
        assert!(matches!(Arp::decode(&[0u8; 27]), Err(Error::ShortBuffer { .. })));
    }

    #[test]
    fn payload_skips_the_header() {
        let frame = ether_frame(MacAddr::zero(), MacAddr::zero(), EtherTypes::Ipv4, &[1, 2, 3]);
        assert_eq!(payload(&frame), Some(&[1u8, 2, 3][..]));
    }
}
