use crate::errors::Result;
use nix::sys::signal::{sigprocmask, SigSet, SigmaskHow, Signal};

/// Signals that must not take the parent down while it is mid-teardown.
/// SIGSTOP can be neither caught nor blocked and is left out.
const SHIELDED: [Signal; 6] = [
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGHUP,
    Signal::SIGABRT,
    Signal::SIGQUIT,
    Signal::SIGCHLD,
];

/// Blocks the shielded signals for the parent's lifetime. Teardown of
/// cgroups, firewall rules and the netns must run to completion even if the
/// user hits ctrl-c.
pub fn shield_parent() -> Result<()> {
    let mut set = SigSet::empty();
    for sig in SHIELDED {
        set.add(sig);
    }
    sigprocmask(SigmaskHow::SIG_BLOCK, Some(&set), None)?;
    Ok(())
}

/// The signal mask survives exec; the child restores the default mask so the
/// container command receives signals normally.
pub fn reset_mask() -> Result<()> {
    let set = SigSet::empty();
    sigprocmask(SigmaskHow::SIG_SETMASK, Some(&set), None)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shield_and_reset() {
        shield_parent().unwrap();
        let mut current = SigSet::empty();
        sigprocmask(SigmaskHow::SIG_BLOCK, None, Some(&mut current)).unwrap();
        for sig in SHIELDED {
            assert!(current.contains(sig), "{:?} not blocked", sig);
        }
        reset_mask().unwrap();
        let mut current = SigSet::empty();
        sigprocmask(SigmaskHow::SIG_BLOCK, None, Some(&mut current)).unwrap();
        assert!(!current.contains(Signal::SIGINT));
    }
}
