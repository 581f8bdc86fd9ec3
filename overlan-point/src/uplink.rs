/*!
主机链路配置

通过 `ip` 命令把虚拟设备拉起、加入网桥并配置地址。
*/

use std::process::Command;

use overlan::{Error, Result, Uplink};

pub struct IpUplink {
    br_name: String,
    if_addr: String,
}

impl IpUplink {
    pub fn new(br_name: &str, if_addr: &str) -> Self {
        Self {
            br_name: br_name.to_string(),
            if_addr: if_addr.to_string(),
        }
    }

    /// 地址配置在网桥上（有网桥时）或设备上
    fn link_name<'a>(&'a self, if_name: &'a str) -> &'a str {
        if self.br_name.is_empty() {
            if_name
        } else {
            &self.br_name
        }
    }

    fn add_bridge(&self, if_name: &str) -> Result<()> {
        let exists = Command::new("ip")
            .args(["link", "show", &self.br_name])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false);
        if !exists {
            log::info!("IpUplink.add_bridge {}", self.br_name);
            ip(&["link", "add", "name", &self.br_name, "type", "bridge"])?;
        }
        if let Err(e) = ip(&["link", "set", "dev", &self.br_name, "type", "bridge", "stp_state", "1"]) {
            log::error!("IpUplink.stp {}: {}", self.br_name, e);
        }
        ip(&["link", "set", "dev", &self.br_name, "up"])?;
        ip(&["link", "set", "dev", if_name, "master", &self.br_name])
    }
}

impl Uplink for IpUplink {
    fn up(&self, if_name: &str) -> Result<()> {
        log::debug!("IpUplink.up {}", if_name);
        ip(&["link", "set", "dev", if_name, "up"])?;

        if !self.br_name.is_empty() {
            if let Err(e) = self.add_bridge(if_name) {
                log::error!("IpUplink.up {}: bridge {}: {}", if_name, self.br_name, e);
            }
        }

        if !self.if_addr.is_empty() {
            ip(&["addr", "add", &self.if_addr, "dev", self.link_name(if_name)])?;
        }
        Ok(())
    }

    fn down(&self, if_name: &str) -> Result<()> {
        if self.if_addr.is_empty() {
            return Ok(());
        }
        log::debug!("IpUplink.down {}", if_name);
        ip(&["addr", "del", &self.if_addr, "dev", self.link_name(if_name)])
    }
}

fn ip(args: &[&str]) -> Result<()> {
    let output = Command::new("ip").args(args).output()?;
    if !output.status.success() {
        return Err(Error::Config(format!(
            "ip {}: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}
