#![allow(unknown_lints)]
#![recursion_limit = "1024"]

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;

mod apparmor;
mod capabilities;
mod cgroups;
mod cmd;
mod container;
mod errors;
mod logger;
mod mounts;
mod network;
mod seccomp;
mod signals;
mod spec;
mod sync;

use container::bootstrap::{self, Bootstrap};
use spec::{ContainerSpec, Resources};

#[derive(Parser)]
#[command(name = "locker")]
#[command(about = "Locker 容器运行时")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command in a new container
    Run {
        /// Container name, used as hostname and more
        #[arg(long, default_value = "locker")]
        name: String,
        /// Rootfs layer directory, oldest first (repeatable)
        #[arg(long = "layer", required = true)]
        layers: Vec<PathBuf>,
        /// RAM limit of the container, e.g. 512MB or 1GB
        #[arg(long, default_value = "1GB")]
        memory_limit: String,
        /// Memory swappiness inside the container, 0-100
        #[arg(long, default_value = "30")]
        memory_swappiness: u8,
        /// CPU cores to use inside the container, cpuset syntax
        #[arg(long, default_value = "0")]
        cpus_allowed: String,
        /// Maximum number of pids available in the container
        #[arg(long, default_value = "100")]
        max_pids: u32,
        /// Seccomp whitelist profile path
        #[arg(long, default_value = "/etc/locker/seccomp_default.json")]
        seccomp: PathBuf,
        /// Add linux capabilities (repeatable, "ALL" accepted)
        #[arg(long = "cap-add")]
        cap_add: Vec<String>,
        /// Drop linux capabilities (repeatable, "ALL" accepted)
        #[arg(long = "cap-drop")]
        cap_drop: Vec<String>,
        /// Skip loading an AppArmor profile
        #[arg(long)]
        no_apparmor: bool,
        /// KEY=VALUE environment entries (repeatable)
        #[arg(long = "env", short = 'e')]
        env: Vec<String>,
        /// Command to run inside the container
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
}

fn main() {
    // 初始化日志
    logger::init().unwrap_or_else(|e| {
        eprintln!("初始化日志失败: {}", e);
        process::exit(1);
    });

    // 第二阶段: 新 PID 命名空间内的 re-exec, 通过 PID 1 + 描述符识别
    if bootstrap::is_child() {
        match Bootstrap::from_env() {
            Ok(Some(descriptor)) => {
                if let Err(e) = container::child::run(descriptor) {
                    eprintln!("错误: {}", e);
                    process::exit(1);
                }
                return;
            }
            Ok(None) => {} // PID 1 but not our re-exec, fall through to the CLI
            Err(e) => {
                eprintln!("错误: {}", e);
                process::exit(1);
            }
        }
    }

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            name,
            layers,
            memory_limit,
            memory_swappiness,
            cpus_allowed,
            max_pids,
            seccomp,
            cap_add,
            cap_drop,
            no_apparmor,
            env,
            command,
        } => {
            let container_spec = ContainerSpec {
                name,
                layers,
                resources: Resources {
                    memory_limit,
                    memory_swappiness,
                    cpus_allowed,
                    max_pids,
                },
                cap_add,
                cap_drop,
                seccomp_profile: seccomp,
                apparmor: !no_apparmor,
                command,
                env,
            };
            container::run(&container_spec)
        }
    };

    match result {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("错误: {}", e);
            process::exit(1);
        }
    }
}
