use crate::errors::{LockerError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 容器资源限制
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resources {
    /// 内存上限, 人类可读字节串 (如 "512MB", "1GB")
    pub memory_limit: String,
    /// memory.swappiness, 0-100
    pub memory_swappiness: u8,
    /// cpuset 列表串 (如 "0" 或 "0-2,4")
    pub cpus_allowed: String,
    /// 容器内最大进程数
    pub max_pids: u32,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            memory_limit: "1GB".to_string(),
            memory_swappiness: 30,
            cpus_allowed: "0".to_string(),
            max_pids: 100,
        }
    }
}

/// 一次容器启动的全部输入, 启动时构造一次, 之后不再修改.
/// 所有组件通过参数接收它, 不存在全局配置.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// 容器名, 同时用作容器内 hostname
    pub name: String,
    /// 镜像层目录, 从旧到新排列
    pub layers: Vec<PathBuf>,
    pub resources: Resources,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    /// seccomp 白名单 JSON 路径
    pub seccomp_profile: PathBuf,
    /// 是否加载 AppArmor profile
    pub apparmor: bool,
    /// 容器内要执行的命令及参数
    pub command: Vec<String>,
    /// KEY=VALUE 环境变量列表
    pub env: Vec<String>,
}

impl ContainerSpec {
    /// 构造时做一次性校验, 全部失败均为 Config 错误
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(LockerError::Config("container name is empty".to_string()));
        }
        if self.layers.is_empty() {
            return Err(LockerError::Config("no rootfs layers given".to_string()));
        }
        if self.command.is_empty() {
            return Err(LockerError::Config("no command given".to_string()));
        }
        if self.resources.memory_swappiness > 100 {
            return Err(LockerError::Config(format!(
                "memory swappiness {} out of range 0-100",
                self.resources.memory_swappiness
            )));
        }
        parse_bytes(&self.resources.memory_limit)?;
        Ok(())
    }
}

const DEFAULT_PATH: &str = "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// 补全缺失的默认环境变量 (PATH/HOME/TERM)
pub fn append_default_env(mut env: Vec<String>) -> Vec<String> {
    let has = |list: &[String], key: &str| list.iter().any(|e| e.starts_with(key));
    if !has(&env, "PATH=") {
        env.push(DEFAULT_PATH.to_string());
    }
    if !has(&env, "HOME=") {
        env.push("HOME=/root".to_string());
    }
    if !has(&env, "TERM=") {
        env.push("TERM=xterm".to_string());
    }
    env
}

/// Parses a human byte string into a byte count. Decimal units (KB/MB/GB/TB,
/// 10^3 steps) and binary units (KiB/MiB/GiB/TiB, 2^10 steps) are accepted,
/// case-insensitively; a bare number is a byte count.
pub fn parse_bytes(s: &str) -> Result<u64> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or_else(|| s.len());
    let (num, unit) = s.split_at(split);
    let value: u64 = num
        .parse()
        .map_err(|_| LockerError::Config(format!("couldn't parse byte size {:?}", s)))?;
    let multiplier: u64 = match unit.trim().to_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" => 1_000,
        "M" | "MB" => 1_000_000,
        "G" | "GB" => 1_000_000_000,
        "T" | "TB" => 1_000_000_000_000,
        "KIB" => 1 << 10,
        "MIB" => 1 << 20,
        "GIB" => 1 << 30,
        "TIB" => 1 << 40,
        _ => {
            return Err(LockerError::Config(format!(
                "unknown byte unit in {:?}",
                s
            )))
        }
    };
    value
        .checked_mul(multiplier)
        .ok_or_else(|| LockerError::Config(format!("byte size {:?} overflows", s)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bytes_decimal() {
        assert_eq!(parse_bytes("100MB").unwrap(), 100_000_000);
        assert_eq!(parse_bytes("512MB").unwrap(), 512_000_000);
        assert_eq!(parse_bytes("1GB").unwrap(), 1_000_000_000);
        assert_eq!(parse_bytes("2kb").unwrap(), 2_000);
        assert_eq!(parse_bytes("42").unwrap(), 42);
        assert_eq!(parse_bytes("7B").unwrap(), 7);
    }

    #[test]
    fn test_parse_bytes_binary() {
        assert_eq!(parse_bytes("1KiB").unwrap(), 1024);
        assert_eq!(parse_bytes("4MiB").unwrap(), 4 * 1024 * 1024);
    }

    #[test]
    fn test_parse_bytes_invalid() {
        assert!(parse_bytes("").is_err());
        assert!(parse_bytes("MB").is_err());
        assert!(parse_bytes("12XB").is_err());
        assert!(parse_bytes("12 34").is_err());
    }

    #[test]
    fn test_append_default_env() {
        let env = append_default_env(vec!["PATH=/bin".to_string()]);
        assert_eq!(env.iter().filter(|e| e.starts_with("PATH=")).count(), 1);
        assert!(env.iter().any(|e| e == "HOME=/root"));
        assert!(env.iter().any(|e| e == "TERM=xterm"));

        let env = append_default_env(Vec::new());
        assert!(env.iter().any(|e| e.starts_with("PATH=/usr/local/sbin")));
    }

    #[test]
    fn test_validate() {
        let spec = ContainerSpec {
            name: "locker".to_string(),
            layers: vec![PathBuf::from("/tmp/layer0")],
            resources: Resources::default(),
            cap_add: Vec::new(),
            cap_drop: Vec::new(),
            seccomp_profile: PathBuf::from("/etc/locker/seccomp_default.json"),
            apparmor: true,
            command: vec!["sh".to_string()],
            env: Vec::new(),
        };
        assert!(spec.validate().is_ok());

        let mut bad = spec.clone();
        bad.resources.memory_limit = "lots".to_string();
        assert!(matches!(bad.validate(), Err(LockerError::Config(_))));

        let mut bad = spec.clone();
        bad.resources.memory_swappiness = 101;
        assert!(matches!(bad.validate(), Err(LockerError::Config(_))));

        let mut bad = spec;
        bad.command.clear();
        assert!(bad.validate().is_err());
    }
}
