//! One-shot pipe handshake between parent and child. The read end survives
//! the child's re-exec (the fd number travels in the bootstrap descriptor),
//! so the child can block until cgroups are configured and the parent has
//! moved itself back to the root groups.

use crate::errors::{LockerError, Result};
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::unistd::{close, pipe, read, write};
use std::os::unix::io::{IntoRawFd, RawFd};

pub struct Sync {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl Sync {
    pub fn new() -> Result<Self> {
        let (read_fd, write_fd) = pipe()?;
        let write_fd = write_fd.into_raw_fd();
        // only the parent may hold the write end: the child would otherwise
        // keep its own inherited copy open and never see EOF
        fcntl(write_fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
        Ok(Sync {
            read_fd: read_fd.into_raw_fd(),
            write_fd,
        })
    }

    /// The fd the child inherits; serialized into the bootstrap descriptor.
    pub fn child_fd(&self) -> RawFd {
        self.read_fd
    }

    pub fn notify_child(&self) -> Result<()> {
        write(self.write_fd, b"1")?;
        Ok(())
    }
}

impl Drop for Sync {
    fn drop(&mut self) {
        let _ = close(self.read_fd);
        let _ = close(self.write_fd);
    }
}

/// Child side: blocks until the parent writes, then closes the fd.
pub fn wait_for_parent(fd: RawFd) -> Result<()> {
    let mut buf = [0u8; 1];
    let n = read(fd, &mut buf)?;
    let _ = close(fd);
    if n == 0 {
        return Err(LockerError::Setup(
            "parent exited before signalling the child".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_same_process() {
        let sync = Sync::new().unwrap();
        sync.notify_child().unwrap();
        let fd = sync.child_fd();
        let mut buf = [0u8; 1];
        let n = read(fd, &mut buf).unwrap();
        assert_eq!(n, 1);
        assert_eq!(&buf, b"1");
    }

    #[test]
    fn test_wait_reports_closed_write_end() {
        let sync = Sync::new().unwrap();
        let read_fd = sync.child_fd();
        let _ = close(sync.write_fd);
        // read end sees EOF once the write end is gone
        let result = wait_for_parent(read_fd);
        assert!(result.is_err());
        // Drop closing an already-closed fd is harmless here
        std::mem::forget(sync);
    }
}
