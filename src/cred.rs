//! User/group resolution, resource limits and capability application.

use caps::{CapSet, Capability, CapsHashSet};
use nix::unistd::{Gid, Group, Uid, User};
use once_cell::sync::OnceCell;

use crate::error::{Error, ErrorKind, Result};
use crate::syscall::Syscall;
use crate::utils;

static LAST_CAP: OnceCell<u8> = OnceCell::new();

/// Highest capability index supported by the running kernel. Read once at
/// daemon startup and treated as immutable afterwards.
pub fn last_cap() -> u8 {
    *LAST_CAP.get_or_init(|| {
        utils::read_to_string("/proc/sys/kernel/cap_last_cap")
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(Capability::CAP_SYS_ADMIN.index())
    })
}

/// Bitmask with every capability the kernel knows about.
pub fn all_caps_mask() -> u64 {
    (0..=last_cap()).fold(0u64, |mask, i| mask | (1u64 << i))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub uid: Uid,
    pub gid: Gid,
}

impl Credentials {
    pub fn root() -> Credentials {
        Credentials {
            uid: Uid::from_raw(0),
            gid: Gid::from_raw(0),
        }
    }

    pub fn is_root(&self) -> bool {
        self.uid.is_root()
    }
}

pub fn resolve_user(name: &str) -> Result<Uid> {
    if let Ok(uid) = name.parse::<u32>() {
        return Ok(Uid::from_raw(uid));
    }
    match User::from_name(name) {
        Ok(Some(user)) => Ok(user.uid),
        Ok(None) => Err(Error::new(
            ErrorKind::InvalidValue,
            format!("invalid user {}", name),
        )),
        Err(e) => Err(Error::from(e).wrap(format!("getpwnam({})", name))),
    }
}

/// uid and gid for a task: the group defaults to the user's primary group
/// when not given explicitly.
pub fn resolve_credentials(user: &str, group: &str) -> Result<Credentials> {
    let uid = resolve_user(user)?;
    let gid = if group.is_empty() {
        match User::from_uid(uid) {
            Ok(Some(pw)) => pw.gid,
            _ => Gid::from_raw(uid.as_raw()),
        }
    } else {
        resolve_group(group)?
    };
    Ok(Credentials { uid, gid })
}

pub fn resolve_group(name: &str) -> Result<Gid> {
    if let Ok(gid) = name.parse::<u32>() {
        return Ok(Gid::from_raw(gid));
    }
    match Group::from_name(name) {
        Ok(Some(group)) => Ok(group.gid),
        Ok(None) => Err(Error::new(
            ErrorKind::InvalidValue,
            format!("invalid group {}", name),
        )),
        Err(e) => Err(Error::from(e).wrap(format!("getgrnam({})", name))),
    }
}

/// Translate a capability name, with or without the `CAP_` prefix, into its
/// bit index.
pub fn capability_bit(name: &str) -> Result<u64> {
    let upper = name.trim().to_ascii_uppercase();
    let full = if upper.starts_with("CAP_") {
        upper
    } else {
        format!("CAP_{}", upper)
    };
    let cap: Capability = full
        .parse()
        .map_err(|_| Error::new(ErrorKind::InvalidValue, format!("invalid capability {}", name)))?;
    Ok(1u64 << cap.index())
}

pub fn apply_rlimits(
    syscall: &dyn Syscall,
    rlimits: &std::collections::HashMap<u32, (u64, u64)>,
) -> Result<()> {
    for (&resource, &(soft, hard)) in rlimits {
        syscall.set_rlimit(resource, soft, hard)?;
    }
    Ok(())
}

fn caps_in_mask(mask: u64) -> CapsHashSet {
    caps::all()
        .into_iter()
        .filter(|c| c.index() <= last_cap() && mask & (1u64 << c.index()) != 0)
        .collect()
}

/// Restrict what the container init and all of its descendants may ever
/// acquire. Only meaningful for root tasks; an unprivileged task is already
/// constrained by the kernel.
///
/// The inheritable set is pinned first, then every unwanted capability is
/// removed from the bounding set. CAP_SETPCAP must survive until the end of
/// the loop because it is the capability that authorizes the drops.
pub fn apply_capabilities(syscall: &dyn Syscall, cred: &Credentials, mask: u64) -> Result<()> {
    if !cred.is_root() {
        return Ok(());
    }

    syscall.set_capability(CapSet::Inheritable, &caps_in_mask(mask))?;

    let setpcap_bit = 1u64 << Capability::CAP_SETPCAP.index();
    for i in 0..=last_cap() {
        let bit = 1u64 << i;
        if mask & bit != 0 || i == Capability::CAP_SETPCAP.index() {
            continue;
        }
        let cap = cap_from_index(i)?;
        syscall.drop_bounded_cap(cap)?;
    }
    if mask & setpcap_bit == 0 {
        syscall.drop_bounded_cap(Capability::CAP_SETPCAP)?;
    }

    Ok(())
}

/// Cap the bounding set for a helper process without touching the
/// inheritable set.
pub fn limit_capabilities(syscall: &dyn Syscall, mask: u64) -> Result<()> {
    for i in 0..=last_cap() {
        if mask & (1u64 << i) == 0 {
            syscall.drop_bounded_cap(cap_from_index(i)?)?;
        }
    }
    Ok(())
}

fn cap_from_index(index: u8) -> Result<Capability> {
    caps::all()
        .into_iter()
        .find(|c| c.index() == index)
        .ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidValue,
                format!("unknown capability index {}", index),
            )
        })
}

/// setgid before initgroups before setuid; the reverse order would lose the
/// privilege needed for each following step.
pub fn drop_privileges(syscall: &dyn Syscall, cred: &Credentials, user: &str) -> Result<()> {
    syscall.set_id(cred.uid, cred.gid, user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall::test::{CapArgs, TestSyscall};

    #[test]
    fn test_resolve_numeric_ids() {
        assert_eq!(resolve_user("0").unwrap(), Uid::from_raw(0));
        assert_eq!(resolve_group("100").unwrap(), Gid::from_raw(100));
        assert_eq!(resolve_user("root").unwrap(), Uid::from_raw(0));
        assert!(resolve_user("no-such-user-here").is_err());
    }

    #[test]
    fn test_capability_bit() {
        assert_eq!(capability_bit("CAP_CHOWN").unwrap(), 1 << 0);
        assert_eq!(capability_bit("chown").unwrap(), 1 << 0);
        assert_eq!(
            capability_bit("NET_BIND_SERVICE").unwrap(),
            1 << Capability::CAP_NET_BIND_SERVICE.index()
        );
        assert!(capability_bit("does_not_exist").is_err());
    }

    #[test]
    fn test_apply_capabilities_skips_non_root() {
        let syscall = TestSyscall::default();
        let cred = Credentials {
            uid: Uid::from_raw(1000),
            gid: Gid::from_raw(1000),
        };
        apply_capabilities(&syscall, &cred, 0).unwrap();
        assert!(syscall.get_cap_args().is_empty());
    }

    #[test]
    fn test_apply_capabilities_drops_unrequested_bits() {
        let syscall = TestSyscall::default();
        let mask = capability_bit("NET_BIND_SERVICE").unwrap();
        apply_capabilities(&syscall, &Credentials::root(), mask).unwrap();

        let args = syscall.get_cap_args();
        // First the inheritable set is pinned to the requested mask.
        match &args[0] {
            CapArgs::Set(CapSet::Inheritable, set) => {
                assert_eq!(set.len(), 1);
                assert!(set.contains(&Capability::CAP_NET_BIND_SERVICE));
            }
            other => panic!("expected inheritable set first, got {:?}", other),
        }

        let dropped: Vec<Capability> = args[1..]
            .iter()
            .map(|a| match a {
                CapArgs::DropBounded(c) => *c,
                other => panic!("expected bounding drops, got {:?}", other),
            })
            .collect();
        assert!(!dropped.contains(&Capability::CAP_NET_BIND_SERVICE));
        assert!(dropped.contains(&Capability::CAP_NET_RAW));
        // SETPCAP authorizes the drops, so it must be the final one.
        assert_eq!(*dropped.last().unwrap(), Capability::CAP_SETPCAP);
    }

    #[test]
    fn test_requested_setpcap_is_kept() {
        let syscall = TestSyscall::default();
        let mask = capability_bit("SETPCAP").unwrap();
        apply_capabilities(&syscall, &Credentials::root(), mask).unwrap();

        let dropped: Vec<_> = syscall
            .get_cap_args()
            .into_iter()
            .filter_map(|a| match a {
                CapArgs::DropBounded(c) => Some(c),
                _ => None,
            })
            .collect();
        assert!(!dropped.contains(&Capability::CAP_SETPCAP));
    }

    #[test]
    fn test_limit_capabilities_only_drops() {
        let syscall = TestSyscall::default();
        limit_capabilities(&syscall, all_caps_mask()).unwrap();
        assert!(syscall.get_cap_args().is_empty());

        limit_capabilities(&syscall, 0).unwrap();
        assert!(syscall
            .get_cap_args()
            .iter()
            .all(|a| matches!(a, CapArgs::DropBounded(_))));
    }
}
