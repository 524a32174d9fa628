use crate::cmd;
use crate::errors::{LockerError, Result};
use log::{debug, info};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Profile skeleton. `$EXECUTABLE` is replaced with the absolute path of the
/// container's entry executable, `$CAPS` with one `capability x,` clause per
/// granted capability.
const TEMPLATE: &str = r#"#include <tunables/global>

$EXECUTABLE flags=(attach_disconnected) {
  #include <abstractions/base>

  $CAPS

  file,
  network,

  deny @{PROC}/* w,   # deny write for all files directly in /proc (not in a subdir)
  # deny write to files not in /proc/<number>/** or /proc/sys/**
  deny @{PROC}/{[^1-9],[^1-9][^0-9],[^1-9s][^0-9y][^0-9s],[^1-9][^0-9][^0-9][^0-9]*}/** w,
  deny @{PROC}/sys/[^k]** w,  # deny /proc/sys except /proc/sys/k* (effectively /proc/sys/kernel)
  deny @{PROC}/sys/kernel/{?,??,[^s][^h][^m]**} w,  # deny everything except shm* in /proc/sys/kernel/
  deny @{PROC}/sysrq-trigger rwklx,
  deny @{PROC}/kcore rwklx,

  deny /sys/[^f]*/** wklx,
  deny /sys/f[^s]*/** wklx,
  deny /sys/fs/[^c]*/** wklx,
  deny /sys/fs/c[^g]*/** wklx,
  deny /sys/fs/cg[^r]*/** wklx,
  deny /sys/firmware/** rwklx,
  deny /sys/kernel/security/** rwklx,
}
"#;

/// AppArmor 临时 profile, 绑定到一个可执行文件路径.
/// 容器退出时保证内核卸载 + 文件删除, 启动失败亦然.
#[derive(Debug)]
pub struct Profile {
    pub path: PathBuf,
}

/// Returns true only if the host reports AppArmor enforcement is on.
/// A missing `aa-enabled` tool or a negative answer mean disabled, never an
/// error.
pub fn enabled() -> bool {
    match cmd::output("aa-enabled", &[]) {
        Ok(out) => out.contains("Yes"),
        Err(_) => false,
    }
}

/// Renders the profile text for one executable and capability list.
fn render(executable: &Path, caps: &[String]) -> String {
    let clauses: Vec<String> = caps
        .iter()
        .map(|c| {
            let name = c.strip_prefix("CAP_").unwrap_or(c).to_lowercase();
            format!("capability {},", name)
        })
        .collect();
    TEMPLATE
        .replacen("$EXECUTABLE", &executable.to_string_lossy(), 1)
        .replacen("$CAPS", &clauses.join("\n  "), 1)
}

/// Renders the profile for the given entry executable, writes it to a unique
/// temp file and loads it into the kernel. `apparmor_parser -Kr` only
/// replaces policy, so a read-only backing filesystem doesn't fail the load.
pub fn set(executable: &Path, caps: &[String]) -> Result<Profile> {
    let mut file = tempfile::Builder::new()
        .prefix("locker")
        .tempfile()
        .map_err(|e| LockerError::Setup(format!("couldn't create apparmor tempfile: {}", e)))?;
    file.write_all(render(executable, caps).as_bytes())
        .map_err(|e| LockerError::Setup(format!("couldn't write apparmor profile: {}", e)))?;
    let (_, path) = file
        .keep()
        .map_err(|e| LockerError::Setup(format!("couldn't keep apparmor tempfile: {}", e)))?;

    let path_str = path.to_string_lossy();
    if let Err(e) = cmd::run("apparmor_parser", &["-Kr", path_str.as_ref()]) {
        let _ = std::fs::remove_file(&path);
        return Err(LockerError::Setup(format!(
            "couldn't load apparmor profile: {}",
            e
        )));
    }
    info!("已加载 AppArmor profile: {:?}", path);
    Ok(Profile { path })
}

/// Unloads the kernel policy and deletes the temp file. Both steps are
/// attempted even if the first fails; failures are joined into one error.
pub fn unload(path: &Path) -> Result<()> {
    let mut failures = Vec::new();
    let path_str = path.to_string_lossy();
    if let Err(e) = cmd::run("apparmor_parser", &["-R", path_str.as_ref()]) {
        failures.push(format!("couldn't unload apparmor profile: {}", e));
    }
    if let Err(e) = std::fs::remove_file(path) {
        failures.push(format!("couldn't remove apparmor tempfile {:?}: {}", path, e));
    }
    if failures.is_empty() {
        debug!("AppArmor profile {:?} 已卸载", path);
        Ok(())
    } else {
        Err(LockerError::Teardown(failures.join("; ")))
    }
}
