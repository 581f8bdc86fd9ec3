/*!
OverLAN隧道协议

定义隧道上传输的报文格式，包括：
- 报文头（魔术字 + 负载长度）
- 指令帧与数据帧的区分
- 指令帧的动作/内容拆分
*/

use std::fmt;

/// 协议常量
pub mod constants {
    /// 报文头魔术字
    pub const MAGIC: [u8; 2] = [0xff, 0xff];

    /// 报文头长度：魔术字 + 2字节大端负载长度
    pub const HEADER_LEN: usize = 4;

    /// 单次接收缓冲区大小
    pub const MAX_MESSAGE_LENGTH: usize = 4096;

    /// 最大负载长度
    pub const MAX_PAYLOAD: usize = MAX_MESSAGE_LENGTH - HEADER_LEN;

    /// 指令帧前缀：全零的目的MAC
    pub const INST_PREFIX: [u8; 6] = [0u8; 6];

    /// 动作结束符
    pub const ACTION_DELIMITER: u8 = b'=';
}

/// 帧分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// 指令帧
    Instruction,
    /// 数据帧
    Data,
}

/// 指令动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// 邻居相关指令 `neig=`
    Neighbor,
    /// 未识别的动作，忽略
    Unknown(String),
}

impl Action {
    pub const NEIGHBOR: &'static str = "neig=";

    pub fn parse(token: &str) -> Self {
        match token {
            Self::NEIGHBOR => Action::Neighbor,
            other => Action::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Neighbor => f.write_str(Self::NEIGHBOR),
            Action::Unknown(token) => f.write_str(token),
        }
    }
}

/// 一个隧道帧：接收缓冲区中的原始字节 + 分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    data: &'a [u8],
    kind: FrameKind,
}

impl<'a> Frame<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            kind: classify(data),
        }
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn is_inst(&self) -> bool {
        self.kind == FrameKind::Instruction
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// 是否是指令帧
pub fn is_inst(data: &[u8]) -> bool {
    data.len() > constants::INST_PREFIX.len() && data[..constants::INST_PREFIX.len()] == constants::INST_PREFIX
}

pub fn classify(data: &[u8]) -> FrameKind {
    if is_inst(data) {
        FrameKind::Instruction
    } else {
        FrameKind::Data
    }
}

/// 拆分指令帧的动作和内容
///
/// 动作包含结尾的 `=`；没有 `=` 时整个剩余部分都是动作。
pub fn decode_action_body(data: &[u8]) -> (String, String) {
    let rest = data.get(constants::INST_PREFIX.len()..).unwrap_or_default();

    match rest.iter().position(|b| *b == constants::ACTION_DELIMITER) {
        Some(pos) => {
            let action = String::from_utf8_lossy(&rest[..=pos]).into_owned();
            let body = String::from_utf8_lossy(&rest[pos + 1..])
                .trim_start_matches(' ')
                .to_string();
            (action, body)
        }
        None => (String::from_utf8_lossy(rest).into_owned(), String::new()),
    }
}

/// 构造指令帧
pub fn encode_inst(action: &str, body: &str) -> Vec<u8> {
    let mut data = Vec::with_capacity(constants::INST_PREFIX.len() + action.len() + body.len());
    data.extend_from_slice(&constants::INST_PREFIX);
    data.extend_from_slice(action.as_bytes());
    data.extend_from_slice(body.as_bytes());
    data
}

/// 构造报文头
pub fn encode_header(payload_len: usize) -> [u8; constants::HEADER_LEN] {
    let len = (payload_len as u16).to_be_bytes();
    [constants::MAGIC[0], constants::MAGIC[1], len[0], len[1]]
}

/// 解析报文头，返回负载长度；魔术字不对返回 None
pub fn decode_header(header: &[u8; constants::HEADER_LEN]) -> Option<usize> {
    if header[..2] != constants::MAGIC {
        return None;
    }
    Some(usize::from(u16::from_be_bytes([header[2], header[3]])))
}
