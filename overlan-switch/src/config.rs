/*!
OverLAN Switch 配置模块

定义和加载交换机配置，包括：
- 监听地址与报告周期
- TLS 证书
- 超时配置
*/

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use overlan::network::{Deadlines, ServerOptions};

/// 配置错误
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Toml parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Toml writing error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Missing required configuration: {0}")]
    Missing(String),
}

/// 交换机配置
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub switch: Switch,
    pub tls: Tls,
    pub timeout: Timeout,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Switch {
    pub listen: String,
    /// 邻居表与计数的报告周期（秒），0 关闭
    pub report_interval: u64,
    pub incoming_capacity: usize,
}

/// TLS 配置，证书和PKCS#8私钥均为DER
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Tls {
    pub enable: bool,
    pub cert_file: String,
    pub key_file: String,
}

/// 超时配置（秒），0 表示不限时
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Timeout {
    pub handshake: u64,
    pub read: u64,
    pub write: u64,
}

impl Config {
    pub fn server_options(&self) -> ServerOptions {
        let optional = |secs: u64| (secs > 0).then(|| Duration::from_secs(secs));
        let defaults = ServerOptions::default();
        ServerOptions {
            incoming_capacity: self.switch.incoming_capacity,
            handshake_timeout: Duration::from_secs(self.timeout.handshake.max(1)),
            deadlines: Deadlines {
                read: optional(self.timeout.read),
                write: optional(self.timeout.write),
                ..defaults.deadlines
            },
            ..defaults
        }
    }
}

/// 生成默认配置
pub fn default_config() -> Config {
    Config {
        switch: Switch {
            listen: format!("0.0.0.0:{}", overlan::DEFAULT_PORT),
            report_interval: 60,
            incoming_capacity: 4,
        },
        tls: Tls {
            enable: false,
            cert_file: "overlan-switch.crt.der".to_string(),
            key_file: "overlan-switch.key.der".to_string(),
        },
        timeout: Timeout {
            handshake: 10,
            read: 0,
            write: 10,
        },
    }
}

/// 保存配置到文件
pub fn save_config(config: &Config, path: &str) -> Result<(), ConfigError> {
    let toml_str = toml::to_string_pretty(config)?;
    let mut file = File::create(path)?;
    file.write_all(toml_str.as_bytes())?;
    Ok(())
}

/// 加载或生成配置
pub fn load_or_generate_config(path: &str) -> Result<Config, ConfigError> {
    if Path::new(path).exists() {
        let mut file = File::open(path)?;
        let mut content = String::new();
        file.read_to_string(&mut content)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    } else {
        let config = default_config();
        save_config(&config, path)?;
        Ok(config)
    }
}

/// 验证配置
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.switch.listen.is_empty() {
        return Err(ConfigError::Missing("switch.listen".to_string()));
    }

    if config.switch.listen.parse::<SocketAddr>().is_err() {
        return Err(ConfigError::Invalid(format!(
            "switch.listen {:?} is not an address",
            config.switch.listen
        )));
    }

    if config.switch.incoming_capacity == 0 {
        return Err(ConfigError::Invalid("switch.incoming_capacity must be greater than 0".to_string()));
    }

    if config.tls.enable {
        if config.tls.cert_file.is_empty() {
            return Err(ConfigError::Missing("tls.cert_file".to_string()));
        }
        if config.tls.key_file.is_empty() {
            return Err(ConfigError::Missing("tls.key_file".to_string()));
        }
    }

    Ok(())
}
