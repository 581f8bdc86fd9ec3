/*!
OverLAN Point 配置模块

定义和加载接入点配置，包括：
- 交换机地址与队列
- TLS 配置
- 虚拟设备与主机链路配置
- 超时配置
*/

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use overlan::network::Deadlines;
use overlan::DeviceType;

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

/// 接入点配置
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub point: Point,
    pub tls: Tls,
    pub device: Device,
    pub timeout: Timeout,
}

/// 基本配置
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Point {
    /// 交换机地址 host:port
    pub switch: String,
    pub queue_size: usize,
}

/// TLS 配置
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Tls {
    pub enable: bool,
    /// CA证书（DER）；为空时不校验服务端证书
    pub ca_file: String,
}

/// 虚拟设备配置
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Device {
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    pub mtu: u32,
    /// 加入的网桥，为空不使用网桥
    pub br_name: String,
    /// 链路地址 CIDR，为空不配置
    pub if_addr: String,
}

/// 超时配置（秒），0 表示不限时
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Timeout {
    pub connect: u64,
    pub read: u64,
    pub write: u64,
}

impl Timeout {
    pub fn deadlines(&self) -> Deadlines {
        let optional = |secs: u64| (secs > 0).then(|| Duration::from_secs(secs));
        Deadlines {
            connect: Duration::from_secs(self.connect.max(1)),
            read: optional(self.read),
            write: optional(self.write),
        }
    }
}

/// 生成默认配置
pub fn default_config() -> Config {
    Config {
        point: Point {
            switch: format!("127.0.0.1:{}", overlan::DEFAULT_PORT),
            queue_size: 1024,
        },
        tls: Tls {
            enable: false,
            ca_file: String::new(),
        },
        device: Device {
            name: String::new(),
            device_type: DeviceType::Tap,
            mtu: overlan::DEFAULT_MTU,
            br_name: String::new(),
            if_addr: String::new(),
        },
        timeout: Timeout {
            connect: 10,
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
    if config.point.switch.is_empty() {
        return Err(ConfigError::Missing("point.switch".to_string()));
    }

    if !config.point.switch.contains(':') {
        return Err(ConfigError::Invalid(format!(
            "point.switch {:?} must be host:port",
            config.point.switch
        )));
    }

    if config.point.queue_size == 0 {
        return Err(ConfigError::Invalid("point.queue_size must be greater than 0".to_string()));
    }

    if config.device.mtu < 576 {
        return Err(ConfigError::Invalid(format!("device.mtu {} is too small", config.device.mtu)));
    }

    if !config.device.if_addr.is_empty() && !config.device.if_addr.contains('/') {
        return Err(ConfigError::Invalid(format!(
            "device.if_addr {:?} must be in CIDR form",
            config.device.if_addr
        )));
    }

    if config.tls.enable && !config.tls.ca_file.is_empty() && !Path::new(&config.tls.ca_file).exists() {
        return Err(ConfigError::Invalid(format!("tls.ca_file {} not found", config.tls.ca_file)));
    }

    Ok(())
}
