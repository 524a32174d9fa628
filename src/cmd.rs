//! Thin wrappers around external tools (`ip`, `iptables`, `sysctl`,
//! `apparmor_parser`). Every failure carries the exact command line that was
//! attempted so it can be re-run by hand.

use crate::errors::{LockerError, Result};
use std::process::Command;

fn render(binary: &str, args: &[&str]) -> String {
    let mut line = binary.to_string();
    for a in args {
        line.push(' ');
        line.push_str(a);
    }
    line
}

/// Runs a command to completion, discarding output on success.
pub fn run(binary: &str, args: &[&str]) -> Result<()> {
    output(binary, args).map(|_| ())
}

/// Runs a command to completion and returns its combined stdout+stderr.
pub fn output(binary: &str, args: &[&str]) -> Result<String> {
    let out = Command::new(binary).args(args).output().map_err(|e| {
        LockerError::Command {
            command: render(binary, args),
            output: e.to_string(),
        }
    })?;
    let mut combined = String::from_utf8_lossy(&out.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&out.stderr));
    if !out.status.success() {
        return Err(LockerError::Command {
            command: render(binary, args),
            output: combined.trim().to_string(),
        });
    }
    Ok(combined)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render() {
        assert_eq!(
            render("iptables", &["-P", "FORWARD", "DROP"]),
            "iptables -P FORWARD DROP"
        );
    }

    #[test]
    fn test_failure_carries_command_line() {
        let err = run("/nonexistent-locker-tool", &["--flag"]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("/nonexistent-locker-tool --flag"), "{}", msg);
    }

    #[test]
    fn test_output_success() {
        let out = output("true", &[]).unwrap();
        assert!(out.is_empty());
    }
}
