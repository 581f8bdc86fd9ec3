/*!
OverLAN Point - 虚拟局域网接入点

接入点主要功能：
- 创建本地虚拟设备
- 连接到交换机（可选TLS）
- 在设备和隧道之间转发二层帧
- 配置主机链路
*/

use clap::Parser;
use env_logger::Builder;
use log::LevelFilter;
use std::fs;
use std::process::ExitCode;

use overlan::network::tls;
use overlan::point::PointConfig;
use overlan::{DeviceConfig, Error, Point, TapDevice};

mod config;
mod uplink;

use config::{load_or_generate_config, validate_config, Config};
use uplink::IpUplink;

/// 命令行参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "overlan-point.toml")]
    config: String,

    /// 启用调试日志
    #[arg(short, long, action = clap::ArgAction::SetTrue)]
    debug: bool,

    /// 交换机地址 host:port
    #[arg(short, long, env = "OVERLAN_SWITCH")]
    switch: Option<String>,

    /// 虚拟设备名
    #[arg(long)]
    if_name: Option<String>,

    /// 加入的网桥
    #[arg(long)]
    br_name: Option<String>,

    /// 链路地址 CIDR
    #[arg(long)]
    if_addr: Option<String>,

    /// 使用TLS连接
    #[arg(long, action = clap::ArgAction::SetTrue)]
    tls: bool,
}

fn point_config(config: &Config) -> Result<PointConfig, Box<dyn std::error::Error>> {
    let tls = if config.tls.enable {
        if config.tls.ca_file.is_empty() {
            log::warn!("TLS enabled without a CA file, server certificate is not verified");
            Some(tls::insecure_client_config())
        } else {
            Some(tls::client_config(fs::read(&config.tls.ca_file)?)?)
        }
    } else {
        None
    };

    let mut point = PointConfig::new(&config.point.switch);
    point.tls = tls;
    point.queue_size = config.point.queue_size;
    point.deadlines = config.timeout.deadlines();
    point.device = DeviceConfig {
        name: config.device.name.clone(),
        device_type: config.device.device_type,
        mtu: config.device.mtu,
    };
    Ok(point)
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                log::warn!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = sigterm => {},
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = load_or_generate_config(&args.config)?;

    // 从命令行参数覆盖配置
    if let Some(switch) = args.switch {
        config.point.switch = switch;
    }
    if let Some(if_name) = args.if_name {
        config.device.name = if_name;
    }
    if let Some(br_name) = args.br_name {
        config.device.br_name = br_name;
    }
    if let Some(if_addr) = args.if_addr {
        config.device.if_addr = if_addr;
    }
    if args.tls {
        config.tls.enable = true;
    }
    validate_config(&config)?;
    log::debug!("Config loaded: {:?}", config);

    let uplink = IpUplink::new(&config.device.br_name, &config.device.if_addr);
    let mut point: Point<TapDevice> = Point::new(point_config(&config)?).with_uplink(Box::new(uplink));

    point.start().await?;
    log::info!("OverLAN Point started on {} -> {}", point.if_name(), point.addr());

    shutdown_signal().await;
    log::info!("Received shutdown signal, stopping point...");

    let stats = point.stats();
    point.stop().await;
    log::info!(
        "OverLAN Point stopped (to tunnel {:?}, to device {:?})",
        stats.to_tunnel,
        stats.to_device
    );
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let mut logger = Builder::new();
    logger.filter(None, if args.debug { LevelFilter::Debug } else { LevelFilter::Info });
    logger.init();

    log::info!("OverLAN Point {} starting...", overlan::VERSION);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(Error::DeviceUnavailable(_)) = e.downcast_ref::<Error>() {
                log::error!("No virtual device: {}", e);
            } else {
                log::error!("{}", e);
            }
            ExitCode::FAILURE
        }
    }
}
