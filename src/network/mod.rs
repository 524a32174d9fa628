pub mod iptables;
pub mod subnet;

use crate::cmd;
use crate::errors::{LockerError, Result};
use log::{info, warn};
use nix::fcntl::{open, OFlag};
use nix::sched::CloneFlags;
use nix::sys::stat::Mode;
use nix::unistd::close;
use rand::Rng;
use std::os::unix::io::BorrowedFd;
use std::path::Path;

use subnet::{Subnet, SubnetRegistry};

const NETNS_DIRECTORY: &str = "/var/run/netns/";
const NS_PREFIX: &str = "ns-";
const VETH_PREFIX: &str = "veth";
/// 内核接口名上限 15 字符, veth + 7 位随机数已足够防碰撞
const SUFFIX_LEN: usize = 7;

/// 容器的隔离网络栈: 具名 netns, 一对 veth, 一个 /24 子网与对应的
/// NAT/转发规则. 创建于子进程启动前, 子进程以 setns 加入,
/// 退出时无条件拆除.
#[derive(Debug)]
pub struct NetworkConfig {
    ns_name: String,
    veth_name: String,
    veth_peer_name: String,
    subnet: Subnet,
    net_interface: String,
    registry: SubnetRegistry,
    rules_installed: bool,
    ns_created: bool,
}

impl NetworkConfig {
    pub fn ns_name(&self) -> &str {
        &self.ns_name
    }
}

/// 搭建容器网络. 每一步失败都会回滚已获取的部分再返回错误.
pub fn create(registry: SubnetRegistry) -> Result<NetworkConfig> {
    let net_interface = connected_interface_name()?;
    let sub = registry.allocate()?;

    let suffix = random_suffix(SUFFIX_LEN);
    let mut config = NetworkConfig {
        ns_name: format!("{}{}", NS_PREFIX, suffix),
        veth_name: format!("{}{}", VETH_PREFIX, suffix),
        veth_peer_name: format!("{}{}-p", VETH_PREFIX, suffix),
        subnet: sub,
        net_interface,
        registry,
        rules_installed: false,
        ns_created: false,
    };

    if let Err(e) = config.provision() {
        config.cleanup();
        return Err(e);
    }
    info!(
        "容器网络就绪: netns={}, 子网={}, 出口接口={}",
        config.ns_name,
        config.subnet.base(),
        config.net_interface
    );
    Ok(config)
}

impl NetworkConfig {
    fn provision(&mut self) -> Result<()> {
        // create network namespace
        cmd::run("ip", &["netns", "add", &self.ns_name])?;
        self.ns_created = true;

        // create veth pair
        cmd::run(
            "ip",
            &["link", "add", &self.veth_name, "type", "veth", "peer", "name", &self.veth_peer_name],
        )?;

        // assign peer to namespace
        cmd::run(
            "ip",
            &["link", "set", &self.veth_peer_name, "netns", &self.ns_name],
        )?;

        // setup ipv4 of host side
        cmd::run(
            "ip",
            &["addr", "add", &self.subnet.host_cidr(), "dev", &self.veth_name],
        )?;
        cmd::run("ip", &["link", "set", &self.veth_name, "up"])?;

        // setup ipv4 of peer, bring peer and loopback up inside the namespace
        self.run_inside_ns(&["ip", "addr", "add", &self.subnet.peer_cidr(), "dev", &self.veth_peer_name])?;
        self.run_inside_ns(&["ip", "link", "set", &self.veth_peer_name, "up"])?;
        self.run_inside_ns(&["ip", "link", "set", "lo", "up"])?;

        // default gateway inside the namespace is the host side of the veth
        self.run_inside_ns(&["ip", "route", "add", "default", "via", &self.subnet.host_ip()])?;

        // enable ipv4 forwarding (idempotent)
        cmd::run("sysctl", &["-w", "net.ipv4.ip_forward=1"])?;

        iptables::install_rules(&self.subnet.masquerade(), &self.net_interface, &self.veth_name)?;
        self.rules_installed = true;
        Ok(())
    }

    fn run_inside_ns(&self, command: &[&str]) -> Result<()> {
        let mut args = vec!["netns", "exec", &self.ns_name];
        args.extend_from_slice(command);
        cmd::run("ip", &args)
    }

    /// 无条件拆除: 精确删除防火墙规则, 删除 netns, 归还子网.
    /// 任一失败仅记日志, 不阻断其余步骤.
    pub fn cleanup(&mut self) {
        if self.rules_installed {
            if let Err(e) = iptables::remove_rules(
                &self.subnet.masquerade(),
                &self.net_interface,
                &self.veth_name,
            ) {
                warn!("删除防火墙规则失败: {}", e);
            }
            self.rules_installed = false;
        }
        if self.ns_created {
            if let Err(e) = cmd::run("ip", &["netns", "delete", &self.ns_name]) {
                warn!("删除网络命名空间 {} 失败: {}", self.ns_name, e);
            }
            self.ns_created = false;
        }
        if let Err(e) = self.registry.release(&self.subnet) {
            warn!("归还子网 {} 失败: {}", self.subnet.base(), e);
        }
    }
}

/// 子进程加入指定 netns, 必须发生在 chroot 之前
pub fn join(ns_name: &str) -> Result<()> {
    let path = format!("{}{}", NETNS_DIRECTORY, ns_name);
    if !Path::new(&path).exists() {
        return Err(LockerError::Setup(format!(
            "network namespace {:?} doesn't exist",
            path
        )));
    }
    let fd = open(path.as_str(), OFlag::O_RDONLY, Mode::empty())
        .map_err(|e| LockerError::Setup(format!("couldn't open {:?}: {}", path, e)))?;
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let result = nix::sched::setns(borrowed, CloneFlags::CLONE_NEWNET)
        .map_err(|e| LockerError::Setup(format!("couldn't join network namespace: {}", e)));
    let _ = close(fd);
    result
}

/// 解析默认路由, 取得当前联网接口名
fn connected_interface_name() -> Result<String> {
    let out = cmd::output("ip", &["-4", "route", "ls"])?;
    parse_default_interface(&out)
        .ok_or_else(|| LockerError::Setup("not connected to the internet".to_string()))
}

fn parse_default_interface(route_output: &str) -> Option<String> {
    for line in route_output.lines() {
        let words: Vec<&str> = line.split_whitespace().collect();
        if words.first() == Some(&"default") {
            // "default via <gw> dev <iface> ..."
            return words.get(4).map(|s| s.to_string());
        }
    }
    None
}

fn random_suffix(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| {
            let n = rng.gen_range(0..36u32);
            std::char::from_digit(n, 36).unwrap_or('0')
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_default_interface() {
        let out = "default via 192.168.1.1 dev wlp3s0 proto dhcp metric 600\n\
                   10.0.0.0/24 dev docker0 proto kernel scope link src 10.0.0.1\n";
        assert_eq!(parse_default_interface(out), Some("wlp3s0".to_string()));
    }

    #[test]
    fn test_parse_default_interface_absent() {
        let out = "10.0.0.0/24 dev docker0 proto kernel scope link src 10.0.0.1\n";
        assert_eq!(parse_default_interface(out), None);
    }

    #[test]
    fn test_names_fit_interface_limit() {
        let suffix = random_suffix(SUFFIX_LEN);
        let veth = format!("{}{}", VETH_PREFIX, suffix);
        let peer = format!("{}-p", veth);
        assert!(veth.len() <= 15);
        assert!(peer.len() <= 15);
        assert_eq!(suffix.len(), SUFFIX_LEN);
    }
}
