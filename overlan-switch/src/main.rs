/*!
OverLAN Switch - 虚拟局域网交换机

交换机主要功能：
- 接入接入点的TCP/TLS连接
- 通过ARP学习邻居
- 在接入点之间转发二层帧
- 周期性报告邻居表和流量计数
*/

use clap::Parser;
use env_logger::Builder;
use log::LevelFilter;
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use overlan::neighbor::LogSink;
use overlan::network::{tls, ServerStats};
use overlan::{NeighborTable, Switch, TcpServer};

mod config;

use config::{load_or_generate_config, validate_config, Config};

/// 命令行参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "overlan-switch.toml")]
    config: String,

    /// 启用调试日志
    #[arg(short, long, action = clap::ArgAction::SetTrue)]
    debug: bool,

    /// 监听地址
    #[arg(short, long, env = "OVERLAN_LISTEN")]
    listen: Option<String>,

    /// 报告周期（秒）
    #[arg(long)]
    report_interval: Option<u64>,
}

fn server_tls(config: &Config) -> Result<Option<Arc<tls::ServerConfig>>, Box<dyn std::error::Error>> {
    if !config.tls.enable {
        return Ok(None);
    }
    let cert = fs::read(&config.tls.cert_file)?;
    let key = fs::read(&config.tls.key_file)?;
    Ok(Some(tls::server_config(vec![cert], key)?))
}

fn start_report(
    neighbors: Arc<NeighborTable>,
    stats: Arc<ServerStats>,
    interval: u64,
) -> Option<JoinHandle<()>> {
    if interval == 0 {
        return None;
    }

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match serde_json::to_string(&stats.snapshot()) {
                Ok(counters) => log::info!("Switch.report counters {}", counters),
                Err(e) => log::warn!("Switch.report: {}", e),
            }
            let snapshot = neighbors.list_neighbor().await;
            log::info!("Switch.report {} neighbors", snapshot.len());
            for neighbor in &snapshot {
                log::info!("Switch.report {}", neighbor);
            }
        }
    }))
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

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut logger = Builder::new();
    logger.filter(None, if args.debug { LevelFilter::Debug } else { LevelFilter::Info });
    logger.init();

    log::info!("OverLAN Switch {} starting...", overlan::VERSION);

    let mut config = load_or_generate_config(&args.config)?;

    // 从命令行参数覆盖配置
    if let Some(listen) = args.listen {
        config.switch.listen = listen;
    }
    if let Some(report_interval) = args.report_interval {
        config.switch.report_interval = report_interval;
    }
    validate_config(&config)?;
    log::debug!("Config loaded: {:?}", config);

    let server = TcpServer::bind(&config.switch.listen, server_tls(&config)?, config.server_options()).await?;
    let neighbors = Arc::new(NeighborTable::new(Arc::new(LogSink)));
    let switch = Arc::new(Switch::new(neighbors.clone(), server.stats()));
    server.start(switch)?;
    log::info!("OverLAN Switch listening on {}", server.local_addr());

    let report = start_report(neighbors, server.stats(), config.switch.report_interval);

    shutdown_signal().await;
    log::info!("Received shutdown signal, stopping switch...");

    if let Some(report) = report {
        report.abort();
    }
    server.close().await;

    log::info!("OverLAN Switch stopped ({:?})", server.stats().snapshot());
    Ok(())
}
