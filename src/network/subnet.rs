use crate::errors::{LockerError, Result};
use nix::fcntl::{flock, FlockArg};
use rand::Rng;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

const REGISTRY_FILE: &str = "/var/run/locker/subnets";
const LOCK_FILE: &str = "/var/run/locker/subnets.lock";
const MAX_ATTEMPTS: usize = 100;

/// 第一个八位组不允许的取值: 保留/环回/私有常用/广播段
const EXCLUDED_FIRST_OCTETS: [u8; 4] = [0, 127, 192, 255];

/// 一个已分配的 /24 子网, 以 a.b.c 前缀表示
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subnet {
    octets: [u8; 3],
}

impl Subnet {
    fn prefix(&self) -> String {
        format!("{}.{}.{}", self.octets[0], self.octets[1], self.octets[2])
    }

    /// 网络地址, 如 10.200.1.0
    pub fn base(&self) -> String {
        format!("{}.0", self.prefix())
    }

    /// veth 宿主端地址, 兼作容器默认网关
    pub fn host_ip(&self) -> String {
        format!("{}.1", self.prefix())
    }

    pub fn host_cidr(&self) -> String {
        format!("{}/24", self.host_ip())
    }

    /// veth 容器端地址
    pub fn peer_ip(&self) -> String {
        format!("{}.2", self.prefix())
    }

    pub fn peer_cidr(&self) -> String {
        format!("{}/24", self.peer_ip())
    }

    /// MASQUERADE 规则的源网段表示
    pub fn masquerade(&self) -> String {
        format!("{}/255.255.255.0", self.base())
    }
}

/// 子网注册表: 一行一个已占用网段, 由具名文件锁保护.
/// 并发启动的容器在此处做唯一的跨进程互斥.
#[derive(Debug, Clone)]
pub struct SubnetRegistry {
    registry: PathBuf,
    lock: PathBuf,
}

impl SubnetRegistry {
    pub fn open_default() -> Self {
        Self::with_paths(PathBuf::from(REGISTRY_FILE), PathBuf::from(LOCK_FILE))
    }

    pub fn with_paths(registry: PathBuf, lock: PathBuf) -> Self {
        Self { registry, lock }
    }

    /// 随机生成候选 /24, 在锁内做 "读-查-追加": 候选不在注册表中则写入
    /// 并返回, 冲突则重试, 重试耗尽为 Config 错误.
    pub fn allocate(&self) -> Result<Subnet> {
        for _ in 0..MAX_ATTEMPTS {
            let candidate = random_subnet();
            let _guard = LockGuard::acquire(&self.lock)?;
            let entries = self.read_entries()?;
            if entries.contains(&candidate.base()) {
                continue;
            }
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.registry)
                .map_err(|e| {
                    LockerError::Setup(format!(
                        "couldn't open subnet registry {:?}: {}",
                        self.registry, e
                    ))
                })?;
            writeln!(file, "{}", candidate.base()).map_err(|e| {
                LockerError::Setup(format!("couldn't append to subnet registry: {}", e))
            })?;
            return Ok(candidate);
        }
        Err(LockerError::Config(format!(
            "couldn't allocate a free /24 subnet after {} attempts",
            MAX_ATTEMPTS
        )))
    }

    /// 归还子网: 锁内读出注册表, 过滤掉该网段后重写.
    /// 网段不在表中时视为已归还, 不报错.
    pub fn release(&self, subnet: &Subnet) -> Result<()> {
        let _guard = LockGuard::acquire(&self.lock)?;
        let entries = self.read_entries()?;
        let remaining: Vec<&String> = entries.iter().filter(|e| **e != subnet.base()).collect();
        let mut content = String::new();
        for entry in remaining {
            content.push_str(entry);
            content.push('\n');
        }
        std::fs::write(&self.registry, content).map_err(|e| {
            LockerError::Teardown(format!(
                "couldn't rewrite subnet registry {:?}: {}",
                self.registry, e
            ))
        })
    }

    fn read_entries(&self) -> Result<Vec<String>> {
        let mut content = String::new();
        match File::open(&self.registry) {
            Ok(mut f) => {
                f.read_to_string(&mut content).map_err(|e| {
                    LockerError::Setup(format!("couldn't read subnet registry: {}", e))
                })?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(LockerError::Setup(format!(
                    "couldn't open subnet registry {:?}: {}",
                    self.registry, e
                )))
            }
        }
        Ok(content
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }
}

fn random_subnet() -> Subnet {
    let mut rng = rand::thread_rng();
    let first = loop {
        let candidate: u8 = rng.gen_range(1..=254);
        if !EXCLUDED_FIRST_OCTETS.contains(&candidate) {
            break candidate;
        }
    };
    Subnet {
        octets: [first, rng.gen(), rng.gen()],
    }
}

/// flock 持有期即临界区; 文件关闭时锁随之释放
struct LockGuard {
    _file: File,
}

impl LockGuard {
    fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                LockerError::Setup(format!("couldn't create lock directory {:?}: {}", parent, e))
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)
            .map_err(|e| LockerError::Setup(format!("couldn't create lock {:?}: {}", path, e)))?;
        flock(file.as_raw_fd(), FlockArg::LockExclusive)
            .map_err(|e| LockerError::Setup(format!("couldn't acquire lock {:?}: {}", path, e)))?;
        Ok(Self { _file: file })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn test_registry() -> (tempfile::TempDir, SubnetRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let registry = SubnetRegistry::with_paths(
            dir.path().join("subnets"),
            dir.path().join("subnets.lock"),
        );
        (dir, registry)
    }

    #[test]
    fn test_random_subnet_excludes_reserved_first_octets() {
        for _ in 0..1000 {
            let s = random_subnet();
            assert!(!EXCLUDED_FIRST_OCTETS.contains(&s.octets[0]), "{:?}", s);
        }
    }

    #[test]
    fn test_subnet_addresses() {
        let s = Subnet { octets: [10, 200, 1] };
        assert_eq!(s.base(), "10.200.1.0");
        assert_eq!(s.host_cidr(), "10.200.1.1/24");
        assert_eq!(s.peer_cidr(), "10.200.1.2/24");
        assert_eq!(s.masquerade(), "10.200.1.0/255.255.255.0");
    }

    #[test]
    fn test_allocate_registers_and_release_unregisters() {
        let (_dir, registry) = test_registry();
        let subnet = registry.allocate().unwrap();
        let entries = registry.read_entries().unwrap();
        assert!(entries.contains(&subnet.base()));

        registry.release(&subnet).unwrap();
        let entries = registry.read_entries().unwrap();
        assert!(!entries.contains(&subnet.base()));
        // releasing again is a no-op
        registry.release(&subnet).unwrap();
    }

    #[test]
    fn test_allocate_never_returns_registered_subnet() {
        let (_dir, registry) = test_registry();
        let mut seen = HashSet::new();
        for _ in 0..50 {
            let s = registry.allocate().unwrap();
            assert!(seen.insert(s.base()), "duplicate subnet {}", s.base());
        }
    }

    #[test]
    fn test_concurrent_allocations_are_disjoint() {
        let (_dir, registry) = test_registry();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(std::thread::spawn(move || {
                (0..10)
                    .map(|_| registry.allocate().unwrap().base())
                    .collect::<Vec<_>>()
            }));
        }
        let mut seen = HashSet::new();
        for handle in handles {
            for base in handle.join().unwrap() {
                assert!(seen.insert(base.clone()), "duplicate subnet {}", base);
            }
        }
    }
}
