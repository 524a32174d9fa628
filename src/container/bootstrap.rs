use crate::errors::{LockerError, Result};
use nix::unistd::getpid;
use serde::{Deserialize, Serialize};
use std::os::unix::io::RawFd;
use std::path::PathBuf;

/// Environment variable carrying the serialized descriptor into the
/// re-exec'd child.
pub const BOOTSTRAP_ENV: &str = "LOCKER_BOOTSTRAP";

/// 两阶段引导的第二阶段输入: 父进程把子进程在新命名空间内需要知道的
/// 一切序列化进环境变量. 运行时自身的参数与要 exec 的命令是两个独立的
/// 类型化字段, 从不拼接.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bootstrap {
    /// 容器名, 用作 UTS 命名空间内的 hostname
    pub name: String,
    /// overlay merged 目录, chroot 目标
    pub merged_dir: PathBuf,
    /// 要加入的网络命名空间, 网络搭建失败时为 None
    pub netns: Option<String>,
    pub seccomp_profile: PathBuf,
    /// 已解析的容器内 capability 列表
    pub caps: Vec<String>,
    /// 容器内 exec 的命令及参数
    pub command: Vec<String>,
    pub env: Vec<String>,
    /// 与父进程握手用的管道读端
    pub sync_fd: Option<RawFd>,
}

impl Bootstrap {
    pub fn to_env_value(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// 从环境中取出描述符; 不在子进程模式时返回 None
    pub fn from_env() -> Result<Option<Bootstrap>> {
        match std::env::var(BOOTSTRAP_ENV) {
            Ok(value) => {
                let bootstrap: Bootstrap = serde_json::from_str(&value).map_err(|e| {
                    LockerError::Setup(format!("couldn't parse bootstrap descriptor: {}", e))
                })?;
                Ok(Some(bootstrap))
            }
            Err(_) => Ok(None),
        }
    }
}

/// The child is created in a fresh PID namespace, so it sees itself as PID 1.
pub fn is_child() -> bool {
    getpid().as_raw() == 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Bootstrap {
        Bootstrap {
            name: "locker".to_string(),
            merged_dir: PathBuf::from("/tmp/locker-x/merged"),
            netns: Some("ns-abc1234".to_string()),
            seccomp_profile: PathBuf::from("/etc/locker/seccomp_default.json"),
            caps: vec!["CAP_NET_RAW".to_string()],
            command: vec!["sh".to_string(), "-c".to_string(), "echo hi".to_string()],
            env: vec!["PATH=/bin".to_string()],
            sync_fd: Some(3),
        }
    }

    #[test]
    fn test_round_trip() {
        let bootstrap = sample();
        let value = bootstrap.to_env_value().unwrap();
        let parsed: Bootstrap = serde_json::from_str(&value).unwrap();
        assert_eq!(parsed, bootstrap);
    }

    #[test]
    fn test_command_is_kept_verbatim() {
        // the exec argv is exactly the command list: nothing prepended,
        // nothing duplicated, nothing truncated
        let bootstrap = sample();
        let value = bootstrap.to_env_value().unwrap();
        let parsed: Bootstrap = serde_json::from_str(&value).unwrap();
        assert_eq!(parsed.command.len(), 3);
        assert_eq!(parsed.command.first().map(String::as_str), Some("sh"));
        assert_eq!(parsed.command.last().map(String::as_str), Some("echo hi"));
    }

    #[test]
    fn test_is_child_in_tests() {
        assert!(!is_child());
    }
}
