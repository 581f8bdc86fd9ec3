/*!
OverLAN错误类型

调用方只区分成功与失败，错误码统一为 [`GENERIC_CODE`]；
具体的错误种类用于日志和测试。
*/

use thiserror::Error;

/// 所有错误共用的错误码
pub const GENERIC_CODE: u16 = 0xFFFF;

/// 库错误
#[derive(Error, Debug)]
pub enum Error {
    #[error("too small buffer: {actual} < {expected}")]
    ShortBuffer { expected: usize, actual: usize },

    #[error("not right ip version: 0x{0:x}")]
    VersionMismatch(u8),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("not connected: {0}")]
    NotConnected(String),

    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn code(&self) -> u16 {
        GENERIC_CODE
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Publish(e.to_string())
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Error::Tls(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_shares_the_generic_code() {
        let errors = [
            Error::ShortBuffer { expected: 20, actual: 3 },
            Error::VersionMismatch(6),
            Error::ConnectionClosed("peer".into()),
            Error::DeviceUnavailable("tap0".into()),
        ];
        for e in &errors {
            assert_eq!(e.code(), GENERIC_CODE);
        }
        assert_eq!(errors[1].to_string(), "not right ip version: 0x6");
    }
}
