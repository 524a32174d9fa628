pub mod bootstrap;
pub mod child;

use crate::errors::{LockerError, Result};
use crate::network::subnet::SubnetRegistry;
use crate::spec::ContainerSpec;
use crate::sync::Sync;
use crate::{apparmor, capabilities, cgroups, mounts, network, signals, spec};
use bootstrap::{Bootstrap, BOOTSTRAP_ENV};
use log::{info, warn};
use nix::sched::{clone, CloneFlags};
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{execve, Pid, Uid};
use scopeguard::guard;
use std::ffi::CString;
use std::path::{Path, PathBuf};

const STACK_SIZE: usize = 1024 * 1024;

/// 第一阶段: 父进程装配全部资源, 再把自身 re-exec 进新命名空间.
/// 每个资源在成功获取后立即挂上守卫, 无论成功失败都按获取的逆序拆除.
/// 返回容器命令的退出码.
pub fn run(container_spec: &ContainerSpec) -> Result<i32> {
    container_spec.validate()?;
    if !Uid::effective().is_root() {
        return Err(LockerError::Config(
            "locker run needs to be executed as root".to_string(),
        ));
    }
    if let Err(e) = signals::shield_parent() {
        warn!("屏蔽退出信号失败: {}", e);
    }

    // 根文件系统
    let overlay = mounts::mount_image(&container_spec.layers)?;
    let overlay = guard(overlay, |o| o.cleanup());
    copy_resolv_conf(overlay.merged());

    // 入口可执行文件与 capability 列表在任何内核资源之外先行解析
    let env = spec::append_default_env(container_spec.env.clone());
    let executable = resolve_executable(&container_spec.command[0], overlay.merged(), &env)?;
    let caps = capabilities::resolve(&container_spec.cap_add, &container_spec.cap_drop)?;

    // MAC profile, 启动后续任何一步失败都保证卸载
    let mut _apparmor_guard = None;
    if container_spec.apparmor && apparmor::enabled() {
        let profile = apparmor::set(&executable, &caps)?;
        _apparmor_guard = Some(guard(profile, |p| {
            if let Err(e) = apparmor::unload(&p.path) {
                warn!("卸载 AppArmor profile 失败: {}", e);
            }
        }));
    }

    // cgroup: 先于 clone 配置并把父进程挂进去, 子进程继承记账
    let cgroup = cgroups::CgroupHandle::new();
    if let Err(e) = cgroup.set(&container_spec.resources) {
        cgroups::destruct_logged(&cgroup);
        return Err(e);
    }
    let cgroup = guard(cgroup, |c| cgroups::destruct_logged(&c));

    // 网络失败不阻止容器启动, 只是没有连接
    let network_config = match network::create(SubnetRegistry::open_default()) {
        Ok(config) => Some(config),
        Err(e) => {
            warn!("{} - 容器将没有网络连接", e);
            None
        }
    };
    let network_config = guard(network_config, |config| {
        if let Some(mut config) = config {
            config.cleanup();
        }
    });

    let sync = Sync::new()?;
    let descriptor = Bootstrap {
        name: container_spec.name.clone(),
        merged_dir: overlay.merged().to_path_buf(),
        netns: network_config
            .as_ref()
            .map(|config| config.ns_name().to_string()),
        seccomp_profile: container_spec.seccomp_profile.clone(),
        caps,
        command: container_spec.command.clone(),
        env,
        sync_fd: Some(sync.child_fd()),
    };

    let child_pid = clone_child(&descriptor)?;
    info!("子进程已启动, PID: {}", child_pid);

    // 父进程退出新建的 cgroup, 此后仅子进程及其后代计入限制
    cgroup.remove_self()?;
    sync.notify_child()?;

    wait_child(child_pid)
    // 守卫按声明逆序拆除: 网络 → cgroup → AppArmor → overlay
}

/// Re-execs this binary into fresh UTS/PID/mount/IPC/cgroup namespaces.
/// The child finds everything it needs in the serialized descriptor.
fn clone_child(descriptor: &Bootstrap) -> Result<Pid> {
    let exe = CString::new("/proc/self/exe")?;
    let argv = [CString::new("locker")?];
    let mut envp = Vec::new();
    for (key, value) in std::env::vars() {
        if key == BOOTSTRAP_ENV {
            continue;
        }
        envp.push(CString::new(format!("{}={}", key, value))?);
    }
    envp.push(CString::new(format!(
        "{}={}",
        BOOTSTRAP_ENV,
        descriptor.to_env_value()?
    ))?);

    let flags = CloneFlags::CLONE_NEWUTS
        | CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWIPC
        | CloneFlags::CLONE_NEWCGROUP;

    let mut stack = vec![0u8; STACK_SIZE];
    let cb = Box::new(|| -> isize {
        match execve(&exe, &argv, &envp) {
            Ok(_) => 0,
            Err(_) => 127,
        }
    });
    let pid = unsafe { clone(cb, &mut stack, flags, Some(Signal::SIGCHLD as i32)) }
        .map_err(|e| LockerError::Setup(format!("couldn't start child: {}", e)))?;
    Ok(pid)
}

/// 阻塞等待子进程退出; 信号终止按 128+signo 折算
fn wait_child(pid: Pid) -> Result<i32> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => {
                info!("容器进程退出, 退出码: {}", code);
                return Ok(code);
            }
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                info!("容器进程被信号 {} 终止", signal);
                return Ok(128 + signal as i32);
            }
            Ok(_) => continue,
            Err(e) => {
                return Err(LockerError::Setup(format!(
                    "couldn't wait for child: {}",
                    e
                )))
            }
        }
    }
}

/// Resolves the entry command to an absolute path under the merged root,
/// searching the PATH entries of the container environment for bare names.
/// Needed both for the exec and to scope the AppArmor profile.
pub fn resolve_executable(command: &str, merged: &Path, env: &[String]) -> Result<PathBuf> {
    let inside = |p: &str| merged.join(p.trim_start_matches('/'));

    if command.contains('/') {
        let candidate = inside(command);
        if candidate.exists() {
            return Ok(candidate);
        }
    } else {
        for entry in env.iter().filter_map(|e| e.strip_prefix("PATH=")) {
            for dir in entry.split(':').filter(|d| !d.is_empty()) {
                let candidate = inside(dir).join(command);
                if candidate.exists() {
                    return Ok(candidate);
                }
            }
        }
    }
    Err(LockerError::Config(format!(
        "couldn't find executable {:?} in container root",
        command
    )))
}

/// DNS 能在 NAT 之后工作依赖宿主机的 resolv.conf; 复制失败仅告警
fn copy_resolv_conf(merged: &Path) {
    let dst = merged.join("etc/resolv.conf");
    if let Some(parent) = dst.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!("创建 {:?} 失败: {}", parent, e);
            return;
        }
    }
    if let Err(e) = std::fs::copy("/etc/resolv.conf", &dst) {
        warn!("复制 resolv.conf 失败: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_executable_from_path_env() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("usr/bin");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::write(bin.join("sh"), "").unwrap();

        let env = vec!["PATH=/usr/local/bin:/usr/bin".to_string()];
        let resolved = resolve_executable("sh", dir.path(), &env).unwrap();
        assert_eq!(resolved, bin.join("sh"));
    }

    #[test]
    fn test_resolve_executable_absolute() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::write(bin.join("busybox"), "").unwrap();

        let resolved = resolve_executable("/bin/busybox", dir.path(), &[]).unwrap();
        assert_eq!(resolved, bin.join("busybox"));
    }

    #[test]
    fn test_resolve_executable_missing_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let env = vec!["PATH=/bin".to_string()];
        assert!(matches!(
            resolve_executable("nope", dir.path(), &env),
            Err(LockerError::Config(_))
        ));
    }

    #[test]
    fn test_run_rejects_invalid_spec_before_touching_anything() {
        let spec = ContainerSpec {
            name: String::new(),
            layers: Vec::new(),
            resources: Default::default(),
            cap_add: Vec::new(),
            cap_drop: Vec::new(),
            seccomp_profile: PathBuf::from("/etc/locker/seccomp_default.json"),
            apparmor: false,
            command: Vec::new(),
            env: Vec::new(),
        };
        assert!(matches!(run(&spec), Err(LockerError::Config(_))));
    }
}
