use caps::{CapSet, Capability};
use lazy_static::lazy_static;
use log::debug;
use std::collections::{HashMap, HashSet};

use crate::errors::{LockerError, Result};

/// Magic value accepted in both add and drop lists.
const ALL_CAPABILITIES: &str = "ALL";

lazy_static! {
    /// Every capability the kernel (as known to the caps crate) supports,
    /// keyed by its canonical CAP_* name.
    static ref CAPABILITY_MAP: HashMap<String, Capability> = {
        let mut map = HashMap::new();
        for cap in caps::all() {
            map.insert(cap.to_string(), cap);
        }
        map
    };
}

/// The default capability set granted to containers, matching the common
/// runtime default.
pub fn default_capabilities() -> Vec<&'static str> {
    vec![
        "CAP_CHOWN",
        "CAP_DAC_OVERRIDE",
        "CAP_FSETID",
        "CAP_FOWNER",
        "CAP_MKNOD",
        "CAP_NET_RAW",
        "CAP_SETGID",
        "CAP_SETUID",
        "CAP_SETFCAP",
        "CAP_SETPCAP",
        "CAP_NET_BIND_SERVICE",
        "CAP_SYS_CHROOT",
        "CAP_KILL",
        "CAP_AUDIT_WRITE",
    ]
}

/// Normalizes add/drop capability names by upper-casing them and adding a
/// CAP_ prefix if not yet present. Accepts the "ALL" magic value. Unknown
/// names are a config error.
fn normalize(names: &[String]) -> Result<Vec<String>> {
    let mut normalized = Vec::with_capacity(names.len());
    for name in names {
        let mut c = name.to_uppercase();
        if c == ALL_CAPABILITIES {
            normalized.push(c);
            continue;
        }
        if !c.starts_with("CAP_") {
            c = format!("CAP_{}", c);
        }
        if !CAPABILITY_MAP.contains_key(&c) {
            return Err(LockerError::Config(format!("unknown capability: {:?}", c)));
        }
        normalized.push(c);
    }
    Ok(normalized)
}

/// Resolves the effective capability name list from add/drop lists:
/// "ALL" in add means every known capability minus the drops; "ALL" in drop
/// means exactly the add list; otherwise the default set minus the drops,
/// with the add list appended.
pub fn resolve(add: &[String], drop: &[String]) -> Result<Vec<String>> {
    let add_caps = normalize(add)?;
    let drop_caps = normalize(drop)?;

    let contains = |list: &[String], s: &str| list.iter().any(|c| c == s);

    let caps = if contains(&add_caps, ALL_CAPABILITIES) {
        let mut all: Vec<String> = CAPABILITY_MAP
            .keys()
            .filter(|k| !contains(&drop_caps, k))
            .cloned()
            .collect();
        all.sort();
        all
    } else if contains(&drop_caps, ALL_CAPABILITIES) {
        add_caps
    } else {
        let mut caps: Vec<String> = default_capabilities()
            .into_iter()
            .map(str::to_string)
            .filter(|c| !contains(&drop_caps, c))
            .collect();
        caps.extend(add_caps);
        caps
    };
    Ok(caps)
}

/// Restricts the current process to exactly the given capabilities in the
/// bounding and effective sets. Runs last in the child, right before exec;
/// everything needing privilege must already be done.
pub fn apply(names: &[String]) -> Result<()> {
    let mut keep: HashSet<Capability> = HashSet::new();
    for name in names {
        match CAPABILITY_MAP.get(name) {
            Some(cap) => {
                keep.insert(*cap);
            }
            None => return Err(LockerError::Config(format!("unknown capability: {:?}", name))),
        }
    }

    debug!("restricting capabilities to {:?}", names);
    // drop everything else from the bounding set
    for cap in caps::all().difference(&keep) {
        caps::drop(None, CapSet::Bounding, *cap)
            .map_err(|e| LockerError::Setup(format!("couldn't drop {} from bounding set: {}", cap, e)))?;
    }
    caps::set(None, CapSet::Effective, &keep)
        .map_err(|e| LockerError::Setup(format!("couldn't set effective capabilities: {}", e)))?;
    caps::set(None, CapSet::Permitted, &keep)
        .map_err(|e| LockerError::Setup(format!("couldn't set permitted capabilities: {}", e)))?;
    caps::clear(None, CapSet::Inheritable)
        .map_err(|e| LockerError::Setup(format!("couldn't clear inheritable capabilities: {}", e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_resolve_defaults() {
        let caps = resolve(&[], &[]).unwrap();
        assert_eq!(caps.len(), 14);
        assert_eq!(caps, strings(&default_capabilities()));
    }

    #[test]
    fn test_resolve_all_in_add() {
        let caps = resolve(&strings(&["ALL"]), &strings(&["CAP_SYS_ADMIN"])).unwrap();
        assert_eq!(caps.len(), caps::all().len() - 1);
        assert!(!caps.contains(&"CAP_SYS_ADMIN".to_string()));
        assert!(caps.contains(&"CAP_NET_RAW".to_string()));
    }

    #[test]
    fn test_resolve_all_in_drop() {
        let caps = resolve(&strings(&["CAP_NET_RAW"]), &strings(&["ALL"])).unwrap();
        assert_eq!(caps, strings(&["CAP_NET_RAW"]));
    }

    #[test]
    fn test_resolve_add_and_drop() {
        let caps = resolve(&strings(&["CAP_SYS_ADMIN"]), &strings(&["CAP_NET_RAW"])).unwrap();
        assert!(caps.contains(&"CAP_SYS_ADMIN".to_string()));
        assert!(!caps.contains(&"CAP_NET_RAW".to_string()));
        assert_eq!(caps.len(), 14); // 14 defaults - 1 drop + 1 add
    }

    #[test]
    fn test_normalize_prefix_and_case() {
        let caps = resolve(&strings(&["net_admin", "cap_sys_time"]), &[]).unwrap();
        assert!(caps.contains(&"CAP_NET_ADMIN".to_string()));
        assert!(caps.contains(&"CAP_SYS_TIME".to_string()));
    }

    #[test]
    fn test_unknown_capability() {
        let err = resolve(&strings(&["CAP_NOT_A_THING"]), &[]).unwrap_err();
        assert!(matches!(err, LockerError::Config(_)));
    }
}
