use log::{Level, LevelFilter, Log, Metadata, Record};

use std::io::{stderr, Write};

pub struct SimpleLogger;

pub static SIMPLE_LOGGER: SimpleLogger = SimpleLogger;

impl Log for SimpleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Debug
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let _ = writeln!(&mut stderr(), "{} - {}", record.level(), record.args());
        }
    }

    fn flush(&self) {
        let _ = stderr().flush();
    }
}

/// 初始化日志系统, 级别由 LOCKER_LOG 环境变量控制
pub fn init() -> Result<(), log::SetLoggerError> {
    log::set_logger(&SIMPLE_LOGGER)?;
    log::set_max_level(max_level_from_env());
    Ok(())
}

fn max_level_from_env() -> LevelFilter {
    match std::env::var("LOCKER_LOG").as_deref() {
        Ok("error") => LevelFilter::Error,
        Ok("warn") => LevelFilter::Warn,
        Ok("debug") => LevelFilter::Debug,
        Ok("trace") => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}
