use thiserror::Error;

#[derive(Error, Debug)]
pub enum LockerError {
    /// Invalid input, raised before any kernel resource is touched.
    #[error("config error: {0}")]
    Config(String),

    /// A kernel or external-tool call failed while acquiring a resource.
    #[error("setup error: {0}")]
    Setup(String),

    /// Cleanup of an already-exited container failed. Logged, never fatal.
    #[error("teardown error: {0}")]
    Teardown(String),

    /// External tool failure, carrying the exact command line attempted.
    #[error("command `{command}` failed: {output}")]
    Command { command: String, output: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Nix error: {0}")]
    Nix(#[from] nix::Error),

    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("Capabilities error: {0}")]
    Capabilities(#[from] caps::errors::CapsError),

    #[error("NUL error: {0}")]
    NulError(#[from] std::ffi::NulError),
}

pub type Result<T> = std::result::Result<T, LockerError>;

/// 便捷宏, 构造 Setup 错误并返回
#[macro_export]
macro_rules! bail {
    ($msg:expr) => {
        return Err($crate::errors::LockerError::Setup($msg.to_string()))
    };
    ($fmt:expr, $($arg:tt)*) => {
        return Err($crate::errors::LockerError::Setup(format!($fmt, $($arg)*)))
    };
}

pub trait ResultExt<T> {
    fn chain_err<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<LockerError>,
{
    fn chain_err<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| {
            let base_error = e.into();
            let context = f();
            LockerError::Setup(format!("{}: {}", context, base_error))
        })
    }
}
