use log::{info, warn};
use nix::unistd::getpid;
use std::fs::{create_dir, read_to_string, remove_dir, write};
use std::path::{Path, PathBuf};

use crate::errors::{LockerError, Result};
use crate::spec::{parse_bytes, Resources};

const BASE_PATH: &str = "/sys/fs/cgroup";

const BYTE_LIMIT_FILE: &str = "memory.limit_in_bytes";
const KMEM_BYTE_LIMIT_FILE: &str = "memory.kmem.limit_in_bytes";
const TCP_BYTE_LIMIT_FILE: &str = "memory.kmem.tcp.limit_in_bytes";
const SWAPPINESS_FILE: &str = "memory.swappiness";
const CPUSET_LIMIT_FILE: &str = "cpuset.cpus";
const CPUSET_MEM_FILE: &str = "cpuset.mems";
const PIDS_FILE: &str = "pids.max";
const PROCS_FILE: &str = "cgroup.procs";

/// 为父进程自身预留的内存, 避免仍在 cgroup 内的当前进程被 OOM
const MEMORY_RESERVE: u64 = 5_000_000;
const MIN_PIDS: u32 = 10;

/// 一个容器的 cgroup v1 层级: memory/cpuset/pids 三个控制器下
/// 各有一个以 locker<pid> 命名的目录.
#[derive(Debug)]
pub struct CgroupHandle {
    name: String,
    memory_path: PathBuf,
    cpuset_path: PathBuf,
    pids_path: PathBuf,
}

impl CgroupHandle {
    pub fn new() -> Self {
        Self::with_base(Path::new(BASE_PATH))
    }

    fn with_base(base: &Path) -> Self {
        let name = format!("locker{}", getpid());
        Self {
            memory_path: base.join("memory").join(&name),
            cpuset_path: base.join("cpuset").join(&name),
            pids_path: base.join("pids").join(&name),
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 创建各控制器目录并写入限制. 数值解析失败在创建任何目录之前
    /// 就以 Config 错误返回; 最后一步才把当前进程写入 cgroup.procs,
    /// 这样不存在不受限进程被记账的窗口.
    pub fn set(&self, resources: &Resources) -> Result<()> {
        let memory_limit = (parse_bytes(&resources.memory_limit)? + MEMORY_RESERVE).to_string();
        let swappiness = resources.memory_swappiness.to_string();
        let max_pids = resources.max_pids.max(MIN_PIDS).to_string();

        for dir in [&self.memory_path, &self.cpuset_path, &self.pids_path] {
            create_dir(dir).map_err(|e| {
                LockerError::Setup(format!("couldn't make cgroup directory {:?}: {}", dir, e))
            })?;
        }

        // 内存上限写入三个 limit 文件
        for file in [BYTE_LIMIT_FILE, KMEM_BYTE_LIMIT_FILE, TCP_BYTE_LIMIT_FILE] {
            write_file(&self.memory_path, file, &memory_limit)?;
        }
        write_file(&self.memory_path, SWAPPINESS_FILE, &swappiness)?;

        // cpuset.mems 先从根控制器继承默认 NUMA 集, 再限制 CPU 列表
        let root_mems = read_file(self.cpuset_root(), CPUSET_MEM_FILE)?;
        write_file(&self.cpuset_path, CPUSET_MEM_FILE, root_mems.trim())?;
        write_file(&self.cpuset_path, CPUSET_LIMIT_FILE, &resources.cpus_allowed)?;

        write_file(&self.pids_path, PIDS_FILE, &max_pids)?;

        // 最后把自己挂进去, clone 出的子进程随之继承记账
        for dir in [&self.memory_path, &self.cpuset_path, &self.pids_path] {
            write_file(dir, PROCS_FILE, "0")?;
        }

        info!("cgroup {} 配置完成, 内存上限 {} 字节", self.name, memory_limit);
        Ok(())
    }

    /// 把当前 (父) 进程移回各控制器的根组. 在子进程启动后立即调用,
    /// 此后仅子进程及其后代计入限制.
    pub fn remove_self(&self) -> Result<()> {
        for root in [self.memory_root(), self.cpuset_root(), self.pids_root()] {
            write_file(&root, PROCS_FILE, "0")?;
        }
        Ok(())
    }

    /// 删除 cgroup 目录. 仅在被跟踪的组为空 (子进程已退出) 后有效;
    /// 此处的失败上报但从不致命.
    pub fn destruct(&self) -> Result<()> {
        let mut failures = Vec::new();
        for dir in [&self.memory_path, &self.cpuset_path, &self.pids_path] {
            if let Err(e) = remove_dir(dir) {
                failures.push(format!("couldn't remove {:?}: {}", dir, e));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(LockerError::Teardown(failures.join("; ")))
        }
    }

    fn memory_root(&self) -> PathBuf {
        self.memory_path.parent().unwrap_or(Path::new(BASE_PATH)).to_path_buf()
    }

    fn cpuset_root(&self) -> PathBuf {
        self.cpuset_path.parent().unwrap_or(Path::new(BASE_PATH)).to_path_buf()
    }

    fn pids_root(&self) -> PathBuf {
        self.pids_path.parent().unwrap_or(Path::new(BASE_PATH)).to_path_buf()
    }
}

impl Default for CgroupHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// 尽力销毁, 失败仅记日志 (Teardown 错误从不向上传播)
pub fn destruct_logged(handle: &CgroupHandle) {
    if let Err(e) = handle.destruct() {
        warn!("清理 cgroup {} 失败: {}", handle.name(), e);
    }
}

fn write_file<P: AsRef<Path>>(dir: P, file: &str, data: &str) -> Result<()> {
    let path = dir.as_ref().join(file);
    write(&path, data).map_err(|e| {
        LockerError::Setup(format!("couldn't write {:?} to {:?}: {}", data, path, e))
    })
}

fn read_file<P: AsRef<Path>>(dir: P, file: &str) -> Result<String> {
    let path = dir.as_ref().join(file);
    read_to_string(&path)
        .map_err(|e| LockerError::Setup(format!("couldn't read {:?}: {}", path, e)))
}
