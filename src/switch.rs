/*!
OverLAN交换机

挂在 [`TcpServer`](crate::network::TcpServer) 上的回调，包括：
- 指令帧分发
- 邻居学习
- 按目的MAC单播，未知目的或广播时泛洪
- 连接下线时清理邻居
*/

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::Result;
use crate::ethernet::{self, Ether};
use crate::ipv4::Ipv4Header;
use crate::neighbor::NeighborTable;
use crate::network::{Connection, ServerHandler, ServerStats};
use crate::protocol::{self, Action, Frame, FrameKind};

pub struct Switch {
    neighbors: Arc<NeighborTable>,
    clients: RwLock<HashMap<u64, Arc<Connection>>>,
    stats: Arc<ServerStats>,
}

impl Switch {
    pub fn new(neighbors: Arc<NeighborTable>, stats: Arc<ServerStats>) -> Self {
        Self {
            neighbors,
            clients: RwLock::new(HashMap::new()),
            stats,
        }
    }

    pub fn neighbors(&self) -> &Arc<NeighborTable> {
        &self.neighbors
    }

    pub async fn clients(&self) -> usize {
        self.clients.read().await.len()
    }

    fn on_request(&self, conn: &Connection, frame: &[u8]) {
        let (action, body) = protocol::decode_action_body(frame);
        log::debug!("Switch.on_request {}: {} {}", conn, action, body);

        match Action::parse(&action) {
            Action::Neighbor => {}
            Action::Unknown(action) => log::debug!("Switch.on_request {}: unknown action {:?}", conn, action),
        }
    }

    async fn forward(&self, conn: &Arc<Connection>, frame: &[u8]) {
        let eth = match Ether::decode(frame) {
            Ok(eth) => eth,
            Err(e) => {
                log::warn!("Switch.forward {}: {}", conn, e);
                return;
            }
        };

        if eth.is_ip4() && log::log_enabled!(log::Level::Debug) {
            if let Some(Ok(ip)) = ethernet::payload(frame).map(Ipv4Header::decode) {
                log::debug!(
                    "Switch.forward {}: {} {} -> {}",
                    conn,
                    ip.protocol_name(),
                    ip.source,
                    ip.destination
                );
            }
        }

        if !ethernet::is_multicast(&eth.dst) {
            let owner = self
                .neighbors
                .get_neighbor(&eth.dst.to_string())
                .await
                .and_then(|n| n.connection())
                .filter(|c| c.is_open());

            if let Some(target) = owner {
                if target.id() == conn.id() {
                    log::debug!("Switch.forward {}: {} is local", conn, eth.dst);
                } else {
                    self.send_to(&target, frame).await;
                }
                return;
            }
        }

        self.flood(conn, frame).await;
    }

    async fn flood(&self, conn: &Arc<Connection>, frame: &[u8]) {
        let targets: Vec<Arc<Connection>> = self
            .clients
            .read()
            .await
            .values()
            .filter(|c| c.id() != conn.id())
            .cloned()
            .collect();

        for target in &targets {
            self.send_to(target, frame).await;
        }
    }

    async fn send_to(&self, target: &Connection, frame: &[u8]) {
        match target.send_msg(frame).await {
            Ok(_) => {
                self.stats.tx.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("Switch.send_to {}: {}", target, e);
            }
        }
    }
}

impl ServerHandler for Switch {
    async fn on_client(&self, conn: &Arc<Connection>) -> Result<()> {
        log::info!("Switch.on_client {}", conn);
        self.clients.write().await.insert(conn.id(), conn.clone());
        Ok(())
    }

    async fn on_recv(&self, conn: &Arc<Connection>, data: &[u8]) -> Result<()> {
        log::debug!("Switch.on_recv {}: {:02x?}", conn, data);

        let frame = Frame::new(data);
        match frame.kind() {
            FrameKind::Instruction => self.on_request(conn, frame.data()),
            FrameKind::Data => {
                self.neighbors.on_frame(conn, frame.data()).await;
                self.forward(conn, frame.data()).await;
            }
        }
        Ok(())
    }

    async fn on_close(&self, conn: &Arc<Connection>) -> Result<()> {
        log::info!("Switch.on_close {}", conn);
        self.clients.write().await.remove(&conn.id());

        let purged = self.neighbors.del_by_connection(conn.id()).await;
        if purged > 0 {
            log::info!("Switch.on_close {}: purged {} neighbors", conn, purged);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ethernet::testing::{arp_frame, ether_frame};
    use crate::ethernet::MacAddr;
    use crate::neighbor::NullSink;
    use crate::network::Deadlines;
    use crate::protocol::constants;
    use pnet::packet::arp::ArpOperations;
    use pnet::packet::ethernet::EtherTypes;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tokio::time::timeout;

    struct Port {
        server_side: Arc<Connection>,
        peer: Connection,
    }

    fn port(addr: &str) -> Port {
        let (a, b) = tokio::io::duplex(64 * 1024);
        Port {
            server_side: Arc::new(Connection::from_stream(Box::new(a), addr, Deadlines::default())),
            peer: Connection::from_stream(Box::new(b), "peer", Deadlines::default()),
        }
    }

    async fn next_frame(conn: &Connection) -> Option<Vec<u8>> {
        let mut buf = [0u8; constants::MAX_MESSAGE_LENGTH];
        match timeout(Duration::from_millis(100), conn.recv_msg(&mut buf)).await {
            Ok(Ok(n)) => Some(buf[..n].to_vec()),
            _ => None,
        }
    }

    fn mac(last: u8) -> MacAddr {
        MacAddr::new(0x02, 0, 0, 0, 0, last)
    }

    async fn switch_with(ports: &[&Port]) -> Switch {
        let switch = Switch::new(Arc::new(NeighborTable::new(Arc::new(NullSink))), Arc::new(ServerStats::default()));
        for p in ports {
            switch.on_client(&p.server_side).await.unwrap();
        }
        switch
    }

    #[tokio::test]
    async fn broadcast_floods_and_learned_mac_is_unicast() {
        let (a, b, c) = (port("a:1"), port("b:1"), port("c:1"));
        let switch = switch_with(&[&a, &b, &c]).await;

        let request = arp_frame(ArpOperations::Request, mac(1), Ipv4Addr::new(10, 0, 0, 1));
        switch.on_recv(&a.server_side, &request).await.unwrap();
        assert_eq!(next_frame(&b.peer).await.as_deref(), Some(&request[..]));
        assert_eq!(next_frame(&c.peer).await.as_deref(), Some(&request[..]));
        assert!(next_frame(&a.peer).await.is_none());
        assert!(switch.neighbors().get_neighbor("02:00:00:00:00:01").await.is_some());

        let unicast = ether_frame(mac(1), mac(2), EtherTypes::Ipv4, &[0x45; 40]);
        switch.on_recv(&b.server_side, &unicast).await.unwrap();
        assert_eq!(next_frame(&a.peer).await.as_deref(), Some(&unicast[..]));
        assert!(next_frame(&c.peer).await.is_none());

        assert_eq!(switch.stats.tx.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn unknown_destination_is_flooded() {
        let (a, b) = (port("a:1"), port("b:1"));
        let switch = switch_with(&[&a, &b]).await;

        let frame = ether_frame(mac(9), mac(1), EtherTypes::Ipv4, &[0x45; 40]);
        switch.on_recv(&a.server_side, &frame).await.unwrap();
        assert_eq!(next_frame(&b.peer).await.as_deref(), Some(&frame[..]));
        assert!(switch.neighbors().is_empty().await);
    }

    #[tokio::test]
    async fn instructions_are_not_forwarded() {
        let (a, b) = (port("a:1"), port("b:1"));
        let switch = switch_with(&[&a, &b]).await;

        switch
            .on_recv(&a.server_side, &protocol::encode_inst("neig=", "list"))
            .await
            .unwrap();
        switch
            .on_recv(&a.server_side, &protocol::encode_inst("ping=", ""))
            .await
            .unwrap();
        assert!(next_frame(&b.peer).await.is_none());
    }

    #[tokio::test]
    async fn close_purges_learned_neighbors() {
        let (a, b) = (port("a:1"), port("b:1"));
        let switch = switch_with(&[&a, &b]).await;

        let reply = arp_frame(ArpOperations::Reply, mac(1), Ipv4Addr::new(10, 0, 0, 1));
        switch.on_recv(&a.server_side, &reply).await.unwrap();
        let reply = arp_frame(ArpOperations::Reply, mac(2), Ipv4Addr::new(10, 0, 0, 2));
        switch.on_recv(&b.server_side, &reply).await.unwrap();
        assert_eq!(switch.neighbors().len().await, 2);

        switch.on_close(&a.server_side).await.unwrap();
        assert_eq!(switch.clients().await, 1);
        assert!(switch.neighbors().get_neighbor("02:00:00:00:00:01").await.is_none());
        assert!(switch.neighbors().get_neighbor("02:00:00:00:00:02").await.is_some());
    }

    #[tokio::test]
    async fn dead_target_counts_as_dropped() {
        let (a, b) = (port("a:1"), port("b:1"));
        let switch = switch_with(&[&a, &b]).await;
        b.server_side.close().await;

        let frame = ether_frame(MacAddr::broadcast(), mac(1), EtherTypes::Ipv4, &[0x45; 40]);
        switch.on_recv(&a.server_side, &frame).await.unwrap();
        assert_eq!(switch.stats.dropped.load(Ordering::Relaxed), 1);
    }
}
