use crate::errors::{LockerError, Result};
use lazy_static::lazy_static;
use log::{info, warn};
use std::collections::HashMap;
use std::ffi::CString;
use std::fs::create_dir_all;
use std::path::{Path, PathBuf};

const WORK: &str = "work";
const UPPER: &str = "upper";
const MERGED: &str = "merged";

/// 镜像层叠成的 overlay 挂载. work/upper/merged 目录为本次运行独有,
/// merged 即子进程 chroot 的目标.
#[derive(Debug)]
pub struct OverlayMount {
    base: PathBuf,
    merged: PathBuf,
}

impl OverlayMount {
    pub fn merged(&self) -> &Path {
        &self.merged
    }
}

/// Builds the overlay option string. `layers` is ordered oldest→newest;
/// overlayfs treats the leftmost lowerdir as topmost, so the join is
/// reversed.
fn overlay_options(layers: &[PathBuf], upper: &Path, work: &Path) -> String {
    let lower: Vec<String> = layers
        .iter()
        .rev()
        .map(|l| l.to_string_lossy().into_owned())
        .collect();
    format!(
        "index=off,lowerdir={},upperdir={},workdir={}",
        lower.join(":"),
        upper.to_string_lossy(),
        work.to_string_lossy()
    )
}

/// 创建 work/upper/merged 目录并把镜像层挂成 overlay, 返回挂载句柄.
pub fn mount_image(layers: &[PathBuf]) -> Result<OverlayMount> {
    if layers.is_empty() {
        return Err(LockerError::Config("no rootfs layers given".to_string()));
    }
    let base = tempfile::Builder::new()
        .prefix("locker-")
        .tempdir()
        .map_err(|e| LockerError::Setup(format!("couldn't create container base dir: {}", e)))?
        .into_path();
    for d in [WORK, UPPER, MERGED] {
        create_dir_all(base.join(d))
            .map_err(|e| LockerError::Setup(format!("couldn't create directory {}: {}", d, e)))?;
    }

    let merged = base.join(MERGED);
    let opts = overlay_options(layers, &base.join(UPPER), &base.join(WORK));
    if let Err(e) = mount("overlay", &merged.to_string_lossy(), "overlay", 0, &opts) {
        let _ = std::fs::remove_dir_all(&base);
        return Err(LockerError::Setup(format!("unable to mount image: {}", e)));
    }

    info!("镜像已挂载到 {:?}", merged);
    Ok(OverlayMount { base, merged })
}

impl OverlayMount {
    /// 卸载 merged 并删除临时目录. 尽力而为: "未挂载" 不算错误.
    pub fn cleanup(&self) {
        let merged = CString::new(self.merged.to_string_lossy().as_bytes()).unwrap_or_default();
        unsafe {
            if libc::umount2(merged.as_ptr(), 0) == -1 {
                let errno = std::io::Error::last_os_error();
                if errno.raw_os_error() != Some(libc::EINVAL)
                    && errno.raw_os_error() != Some(libc::ENOENT)
                {
                    warn!("卸载 {:?} 失败: {}", self.merged, errno);
                }
            }
        }
        if let Err(e) = std::fs::remove_dir_all(&self.base) {
            warn!("删除容器目录 {:?} 失败: {}", self.base, e);
        }
    }
}

/// A mount inside the container, fstab style.
struct Mount {
    destination: &'static str,
    typ: &'static str,
    source: &'static str,
    options: &'static [&'static str],
}

/// The default pseudo-filesystems every container gets. Paths are relative
/// to the already-chrooted root.
fn default_mounts() -> Vec<Mount> {
    vec![
        Mount {
            destination: "/proc",
            typ: "proc",
            source: "proc",
            options: &["nosuid", "noexec", "nodev"],
        },
        Mount {
            destination: "/dev",
            typ: "tmpfs",
            source: "tmpfs",
            options: &["nosuid", "strictatime", "mode=755", "size=65536k"],
        },
        Mount {
            destination: "/dev/pts",
            typ: "devpts",
            source: "devpts",
            options: &["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620", "gid=5"],
        },
        Mount {
            destination: "/sys",
            typ: "sysfs",
            source: "sysfs",
            options: &["nosuid", "noexec", "nodev", "ro"],
        },
        Mount {
            destination: "/sys/fs/cgroup",
            typ: "cgroup",
            source: "cgroup",
            options: &["ro", "nosuid", "noexec", "nodev"],
        },
        Mount {
            destination: "/dev/mqueue",
            typ: "mqueue",
            source: "mqueue",
            options: &["nosuid", "noexec", "nodev"],
        },
        Mount {
            destination: "/dev/shm",
            typ: "tmpfs",
            source: "shm",
            options: &["nosuid", "noexec", "nodev", "mode=1777"],
        },
    ]
}

/// 在 chroot 之后挂载默认伪文件系统. 个别挂载点在部分内核上不可用,
/// 因此单个失败仅记日志.
pub fn mount_defaults() {
    for m in default_mounts() {
        if !Path::new(m.destination).exists() {
            if let Err(e) = create_dir_all(m.destination) {
                warn!("创建挂载点 {} 失败: {}", m.destination, e);
                continue;
            }
        }
        let (flags, data) = parse_mount_options(m.options);
        if let Err(e) = mount(m.source, m.destination, m.typ, flags, &data) {
            warn!("挂载 {} -> {} 失败, 继续执行: {}", m.source, m.destination, e);
        }
    }
}

fn mount(src: &str, dest: &str, typ: &str, flags: u64, data: &str) -> Result<()> {
    let src_cstr = CString::new(src)?;
    let dest_cstr = CString::new(dest)?;
    let typ_cstr = CString::new(typ)?;
    let data_cstr = CString::new(data)?;

    unsafe {
        if libc::mount(
            src_cstr.as_ptr(),
            dest_cstr.as_ptr(),
            typ_cstr.as_ptr(),
            flags,
            data_cstr.as_ptr() as *const libc::c_void,
        ) == -1
        {
            let errno = std::io::Error::last_os_error();
            // EINVAL may just mean the data string isn't understood here
            if errno.raw_os_error() == Some(libc::EINVAL) && !data.is_empty() {
                let empty = CString::new("")?;
                if libc::mount(
                    src_cstr.as_ptr(),
                    dest_cstr.as_ptr(),
                    typ_cstr.as_ptr(),
                    flags,
                    empty.as_ptr() as *const libc::c_void,
                ) != -1
                {
                    return Ok(());
                }
            }
            return Err(LockerError::Setup(format!(
                "mount {} -> {} failed: {}",
                src,
                dest,
                std::io::Error::last_os_error()
            )));
        }
    }
    Ok(())
}

#[rustfmt::skip]
lazy_static! {
    static ref OPTIONS: HashMap<&'static str, (bool, u64)> = {
        let mut m = HashMap::new();
        m.insert("defaults",      (false, 0));
        m.insert("ro",            (false, libc::MS_RDONLY));
        m.insert("rw",            (true,  libc::MS_RDONLY));
        m.insert("suid",          (true,  libc::MS_NOSUID));
        m.insert("nosuid",        (false, libc::MS_NOSUID));
        m.insert("dev",           (true,  libc::MS_NODEV));
        m.insert("nodev",         (false, libc::MS_NODEV));
        m.insert("exec",          (true,  libc::MS_NOEXEC));
        m.insert("noexec",        (false, libc::MS_NOEXEC));
        m.insert("sync",          (false, libc::MS_SYNCHRONOUS));
        m.insert("async",         (true,  libc::MS_SYNCHRONOUS));
        m.insert("dirsync",       (false, libc::MS_DIRSYNC));
        m.insert("remount",       (false, libc::MS_REMOUNT));
        m.insert("mand",          (false, libc::MS_MANDLOCK));
        m.insert("nomand",        (true,  libc::MS_MANDLOCK));
        m.insert("atime",         (true,  libc::MS_NOATIME));
        m.insert("noatime",       (false, libc::MS_NOATIME));
        m.insert("diratime",      (true,  libc::MS_NODIRATIME));
        m.insert("nodiratime",    (false, libc::MS_NODIRATIME));
        m.insert("relatime",      (false, libc::MS_RELATIME));
        m.insert("norelatime",    (true,  libc::MS_RELATIME));
        m.insert("strictatime",   (false, libc::MS_STRICTATIME));
        m.insert("nostrictatime", (true,  libc::MS_STRICTATIME));
        m
    };
}

fn parse_mount_options(options: &[&str]) -> (u64, String) {
    let mut flags = 0u64;
    let mut data = Vec::new();

    for option in options {
        match OPTIONS.get(option) {
            Some((clear, flag)) => {
                if *clear {
                    flags &= !flag;
                } else {
                    flags |= flag;
                }
            }
            None => {
                // unknown options become fs-specific data
                data.push(option.to_string());
            }
        }
    }

    (flags, data.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mount_options() {
        let (flags, data) = parse_mount_options(&["ro", "nosuid"]);
        assert!(flags & libc::MS_RDONLY != 0);
        assert!(flags & libc::MS_NOSUID != 0);
        assert!(data.is_empty());
    }

    #[test]
    fn test_parse_mount_options_with_data() {
        let (flags, data) = parse_mount_options(&["nosuid", "mode=755", "size=65536k"]);
        assert!(flags & libc::MS_NOSUID != 0);
        assert_eq!(data, "mode=755,size=65536k");
    }

    #[test]
    fn test_parse_mount_options_clear() {
        let (flags, _) = parse_mount_options(&["ro", "rw"]);
        assert_eq!(flags & libc::MS_RDONLY, 0);
    }

    #[test]
    fn test_overlay_options_newest_layer_first() {
        let layers = vec![PathBuf::from("/var/lib/l/base"), PathBuf::from("/var/lib/l/top")];
        let opts = overlay_options(
            &layers,
            Path::new("/tmp/c/upper"),
            Path::new("/tmp/c/work"),
        );
        assert_eq!(
            opts,
            "index=off,lowerdir=/var/lib/l/top:/var/lib/l/base,upperdir=/tmp/c/upper,workdir=/tmp/c/work"
        );
    }

    #[test]
    fn test_mount_image_requires_layers() {
        assert!(matches!(
            mount_image(&[]),
            Err(LockerError::Config(_))
        ));
    }
}
