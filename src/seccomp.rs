use crate::errors::{LockerError, Result};
use log::warn;
use seccomp_sys::*;
use serde::Deserialize;
use std::path::Path;

/// On-disk whitelist document: `{"syscalls": ["read", "write", ...]}`.
#[derive(Debug, Deserialize)]
struct Profile {
    syscalls: Vec<String>,
}

/// Reads a seccomp profile, returning the flat syscall name list.
pub fn read_profile<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let path = path.as_ref();
    let data = std::fs::read_to_string(path).map_err(|e| {
        LockerError::Config(format!("couldn't read seccomp profile {:?}: {}", path, e))
    })?;
    let profile: Profile = serde_json::from_str(&data).map_err(|e| {
        LockerError::Config(format!("couldn't parse seccomp profile {:?}: {}", path, e))
    })?;
    Ok(profile.syscalls)
}

/// A compiled whitelist filter. Anything not on the list returns EPERM
/// instead of killing the process. Resources are released on drop, whatever
/// the exec path does.
pub struct Filter {
    ctx: *mut scmp_filter_ctx,
}

impl Filter {
    /// Builds the filter: default action EPERM, one allow rule per syscall
    /// name resolvable on this architecture. Names the kernel doesn't know
    /// are skipped rather than failing the container, since syscall sets
    /// vary across kernel versions.
    pub fn build(syscalls: &[String]) -> Result<Filter> {
        let ctx = unsafe { seccomp_init(SCMP_ACT_ERRNO(libc::EPERM as _)) };
        if ctx.is_null() {
            return Err(LockerError::Setup(
                "failed to initialize seccomp filter".to_string(),
            ));
        }
        let filter = Filter { ctx };

        for name in syscalls {
            let name_cstr = std::ffi::CString::new(name.as_str())?;
            let syscall_nr = unsafe { seccomp_syscall_resolve_name(name_cstr.as_ptr()) };
            if syscall_nr == __NR_SCMP_ERROR {
                warn!("unknown syscall in profile, skipping: {}", name);
                continue;
            }
            let ret = unsafe { seccomp_rule_add(filter.ctx, SCMP_ACT_ALLOW, syscall_nr, 0) };
            if ret != 0 {
                return Err(LockerError::Setup(format!(
                    "failed to add seccomp rule for {:?}",
                    name
                )));
            }
        }
        Ok(filter)
    }

    /// Commits the filter to the current process. No rules may be added
    /// afterwards.
    pub fn load(&self) -> Result<()> {
        let ret = unsafe { seccomp_load(self.ctx) };
        if ret != 0 {
            return Err(LockerError::Setup(
                "failed to load seccomp filter".to_string(),
            ));
        }
        Ok(())
    }
}

impl Drop for Filter {
    fn drop(&mut self) {
        unsafe {
            seccomp_release(self.ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_read_profile() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, r#"{{"syscalls": ["read", "write", "execve"]}}"#).unwrap();
        let syscalls = read_profile(f.path()).unwrap();
        assert_eq!(syscalls, vec!["read", "write", "execve"]);
    }

    #[test]
    fn test_read_profile_malformed() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, r#"{{"syscalls": "read"}}"#).unwrap();
        assert!(matches!(
            read_profile(f.path()),
            Err(LockerError::Config(_))
        ));
    }

    #[test]
    fn test_read_profile_missing_file() {
        assert!(matches!(
            read_profile("/nonexistent/seccomp.json"),
            Err(LockerError::Config(_))
        ));
    }
}
