#![allow(unknown_lints)]
#![recursion_limit = "1024"]

pub mod apparmor;
pub mod capabilities;
pub mod cgroups;
pub mod cmd;
pub mod container;
pub mod errors;
pub mod logger;
pub mod mounts;
pub mod network;
pub mod seccomp;
pub mod signals;
pub mod spec;
pub mod sync;

// 重新导出主要的类型和函数
pub use container::bootstrap::{is_child, Bootstrap};
pub use errors::{LockerError, Result};
pub use spec::{ContainerSpec, Resources};
