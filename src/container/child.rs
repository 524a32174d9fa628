use crate::container::bootstrap::Bootstrap;
use crate::errors::{LockerError, Result};
use crate::{capabilities, mounts, network, seccomp, signals, sync};
use log::{info, warn};
use nix::unistd::{chdir, chroot, execvpe, sethostname};
use std::ffi::CString;

/// 第二阶段: 已处于新 UTS/PID/mount/IPC/cgroup 命名空间内的子进程.
/// 顺序是硬性契约: 加入 netns → 设置 hostname → 进入挂载根 → chroot →
/// 默认伪文件系统 → 加载 seccomp → 收缩 capability → exec.
/// mount(2) 需要 CAP_SYS_ADMIN, 因此降权必须发生在挂载之后.
pub fn run(bootstrap: Bootstrap) -> Result<()> {
    // 子进程恢复默认信号掩码, 容器命令应正常收到信号
    if let Err(e) = signals::reset_mask() {
        warn!("恢复信号掩码失败: {}", e);
    }

    // 等父进程完成 cgroup 配置并退回根组
    if let Some(fd) = bootstrap.sync_fd {
        sync::wait_for_parent(fd)?;
    }

    // 网络命名空间必须先于 chroot 加入
    if let Some(ref ns_name) = bootstrap.netns {
        network::join(ns_name)?;
    }

    // profile 位于宿主机文件系统, 必须在 chroot 前读出
    let whitelist = seccomp::read_profile(&bootstrap.seccomp_profile)?;

    sethostname(&bootstrap.name)
        .map_err(|e| LockerError::Setup(format!("couldn't set child's hostname: {}", e)))?;

    chdir(&bootstrap.merged_dir).map_err(|e| {
        LockerError::Setup(format!(
            "couldn't change dir into {:?}: {}",
            bootstrap.merged_dir, e
        ))
    })?;
    chroot(".").map_err(|e| LockerError::Setup(format!("couldn't change root: {}", e)))?;
    chdir("/").map_err(|e| LockerError::Setup(format!("couldn't enter new root: {}", e)))?;

    mounts::mount_defaults();

    // seccomp 在挂载完成后构建加载, mount(2) 自身必须仍然可用
    let filter = seccomp::Filter::build(&whitelist)?;
    filter.load()?;

    // 降权是 exec 前的最后一步
    capabilities::apply(&bootstrap.caps)?;

    info!("启动容器命令: {:?}", bootstrap.command);
    exec(&bootstrap.command, &bootstrap.env)
}

/// Replaces the process image with the container command. Only returns on
/// failure.
fn exec(command: &[String], env: &[String]) -> Result<()> {
    let argv = to_cstring_vec(command)?;
    let envp = to_cstring_vec(env)?;
    let program = argv
        .first()
        .ok_or_else(|| LockerError::Config("no command given".to_string()))?;
    execvpe(program, &argv, &envp)
        .map_err(|e| LockerError::Setup(format!("couldn't exec {:?}: {}", command, e)))?;
    unreachable!("execvpe returned without error")
}

fn to_cstring_vec(strings: &[String]) -> Result<Vec<CString>> {
    strings
        .iter()
        .map(|s| CString::new(s.as_str()).map_err(Into::into))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_cstring_vec() {
        let argv = to_cstring_vec(&["sh".to_string(), "-c".to_string(), "true".to_string()])
            .unwrap();
        assert_eq!(argv.len(), 3);
        assert_eq!(argv[0].to_str().unwrap(), "sh");
        assert_eq!(argv[2].to_str().unwrap(), "true");
    }

    #[test]
    fn test_to_cstring_vec_rejects_nul() {
        assert!(to_cstring_vec(&["a\0b".to_string()]).is_err());
    }
}
