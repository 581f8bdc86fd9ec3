/*!
OverLAN邻居表

通过观察ARP报文学习 MAC ↔ IP ↔ 连接 的对应关系，包括：
- 读写锁保护的邻居表
- 基于ARP请求/应答的学习
- 邻居变更发布
- 快照遍历
*/

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::ethernet::{Arp, Ether, MacAddr};
use crate::network::Connection;
use crate::protocol;

/// 邻居
#[derive(Clone)]
pub struct Neighbor {
    pub hw_addr: MacAddr,
    pub ip_addr: Ipv4Addr,
    /// 只做查找，不持有连接
    pub conn: Weak<Connection>,
    pub conn_id: u64,
    pub remote: String,
    pub new_time: DateTime<Utc>,
    pub hit_time: DateTime<Utc>,
}

impl Neighbor {
    pub fn new(hw_addr: MacAddr, ip_addr: Ipv4Addr, conn: &Arc<Connection>) -> Self {
        Self::observed_at(hw_addr, ip_addr, conn, Utc::now())
    }

    /// 指定观察时间
    pub fn observed_at(hw_addr: MacAddr, ip_addr: Ipv4Addr, conn: &Arc<Connection>, at: DateTime<Utc>) -> Self {
        Self {
            hw_addr,
            ip_addr,
            conn: Arc::downgrade(conn),
            conn_id: conn.id(),
            remote: conn.to_string(),
            new_time: at,
            hit_time: at,
        }
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.conn.upgrade()
    }

    pub fn record(&self, active: bool) -> NeighborRecord {
        NeighborRecord {
            key: format!("neighbor:{}", self.hw_addr.to_string().replace(':', "-")),
            hw_addr: self.hw_addr.to_string(),
            ip_addr: self.ip_addr.to_string(),
            remote: self.remote.clone(),
            new_time: self.new_time.timestamp(),
            hit_time: self.hit_time.timestamp(),
            active,
        }
    }
}

impl fmt::Display for Neighbor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.hw_addr, self.ip_addr, self.remote)
    }
}

impl fmt::Debug for Neighbor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Neighbor")
            .field("hw_addr", &self.hw_addr)
            .field("ip_addr", &self.ip_addr)
            .field("remote", &self.remote)
            .field("new_time", &self.new_time)
            .field("hit_time", &self.hit_time)
            .finish()
    }
}

/// 发布到外部存储的邻居记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NeighborRecord {
    pub key: String,
    #[serde(rename = "hwAddr")]
    pub hw_addr: String,
    #[serde(rename = "ipAddr")]
    pub ip_addr: String,
    pub remote: String,
    #[serde(rename = "newTime")]
    pub new_time: i64,
    #[serde(rename = "hitTime")]
    pub hit_time: i64,
    pub active: bool,
}

/// 邻居变更的接收方；在表锁内调用，实现必须很快返回
pub trait NeighborSink: Send + Sync {
    fn publish(&self, record: &NeighborRecord) -> Result<()>;
}

/// 丢弃所有变更
pub struct NullSink;

impl NeighborSink for NullSink {
    fn publish(&self, _record: &NeighborRecord) -> Result<()> {
        Ok(())
    }
}

/// 以JSON形式写入日志
pub struct LogSink;

impl NeighborSink for LogSink {
    fn publish(&self, record: &NeighborRecord) -> Result<()> {
        let value = serde_json::to_string(record)?;
        log::info!("{} {}", record.key, value);
        Ok(())
    }
}

/// 邻居表快照，可重复遍历
#[derive(Debug, Clone, Default)]
pub struct NeighborSnapshot {
    entries: Vec<Neighbor>,
}

impl NeighborSnapshot {
    pub fn iter(&self) -> std::slice::Iter<'_, Neighbor> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl IntoIterator for NeighborSnapshot {
    type Item = Neighbor;
    type IntoIter = std::vec::IntoIter<Neighbor>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a> IntoIterator for &'a NeighborSnapshot {
    type Item = &'a Neighbor;
    type IntoIter = std::slice::Iter<'a, Neighbor>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// 邻居表
pub struct NeighborTable {
    neighbors: RwLock<HashMap<String, Neighbor>>,
    sink: Arc<dyn NeighborSink>,
}

impl NeighborTable {
    pub fn new(sink: Arc<dyn NeighborSink>) -> Self {
        Self {
            neighbors: RwLock::new(HashMap::with_capacity(1024)),
            sink,
        }
    }

    pub async fn get_neighbor(&self, hw_addr: &str) -> Option<Neighbor> {
        self.neighbors.read().await.get(&hw_addr.to_lowercase()).cloned()
    }

    /// 在读锁下复制出全部条目
    pub async fn list_neighbor(&self) -> NeighborSnapshot {
        let neighbors = self.neighbors.read().await;
        NeighborSnapshot {
            entries: neighbors.values().cloned().collect(),
        }
    }

    pub async fn len(&self) -> usize {
        self.neighbors.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.neighbors.read().await.is_empty()
    }

    /// 新增或更新；更新时保留创建时间
    pub async fn add_neighbor(&self, neighbor: Neighbor) {
        let mut neighbors = self.neighbors.write().await;
        let key = neighbor.hw_addr.to_string();

        let entry = match neighbors.entry(key) {
            Entry::Occupied(occupied) => {
                log::info!("NeighborTable.add_neighbor: update {}", neighbor);
                let existing = occupied.into_mut();
                existing.ip_addr = neighbor.ip_addr;
                existing.conn = neighbor.conn;
                existing.conn_id = neighbor.conn_id;
                existing.remote = neighbor.remote;
                existing.hit_time = neighbor.hit_time;
                existing
            }
            Entry::Vacant(vacant) => {
                log::info!("NeighborTable.add_neighbor: new {}", neighbor);
                vacant.insert(neighbor)
            }
        };

        self.publish(entry, true);
    }

    pub async fn del_neighbor(&self, hw_addr: &str) -> Option<Neighbor> {
        let mut neighbors = self.neighbors.write().await;
        log::info!("NeighborTable.del_neighbor {}", hw_addr);

        let removed = neighbors.remove(&hw_addr.to_lowercase());
        if let Some(neighbor) = &removed {
            self.publish(neighbor, false);
        }
        removed
    }

    /// 删除某个连接学到的所有邻居，返回删除的数量
    pub async fn del_by_connection(&self, conn_id: u64) -> usize {
        let mut neighbors = self.neighbors.write().await;
        let keys: Vec<String> = neighbors
            .iter()
            .filter(|(_, n)| n.conn_id == conn_id)
            .map(|(k, _)| k.clone())
            .collect();

        for key in &keys {
            if let Some(neighbor) = neighbors.remove(key) {
                log::info!("NeighborTable.del_by_connection {}", neighbor);
                self.publish(&neighbor, false);
            }
        }
        keys.len()
    }

    /// 从收到的帧中学习邻居；解析失败只记录，不返回错误
    pub async fn on_frame(&self, conn: &Arc<Connection>, frame: &[u8]) {
        log::debug!("NeighborTable.on_frame {:02x?}", frame);

        if protocol::is_inst(frame) {
            return;
        }

        let eth = match Ether::decode(frame) {
            Ok(eth) => eth,
            Err(e) => {
                log::warn!("NeighborTable.on_frame {}: {}", conn, e);
                return;
            }
        };
        if !eth.is_arp() {
            if eth.is_vlan() {
                log::debug!("NeighborTable.on_frame {}: vlan frame not learned", conn);
            }
            return;
        }

        let arp = match Arp::decode(&frame[eth.len..]) {
            Ok(arp) => arp,
            Err(e) => {
                log::error!("NeighborTable.on_frame {}: {}", conn, e);
                return;
            }
        };
        if arp.is_ip4() && arp.is_learnable() {
            self.add_neighbor(Neighbor::new(arp.s_hw_addr, arp.s_ip_addr, conn))
                .await;
        }
    }

    fn publish(&self, neighbor: &Neighbor, active: bool) {
        if let Err(e) = self.sink.publish(&neighbor.record(active)) {
            log::error!("NeighborTable.publish {}: {}", neighbor.hw_addr, e);
        }
    }
}
