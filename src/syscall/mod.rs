//! Seam between the runtime logic and the kernel, so the mount, namespace
//! and capability choreography can be asserted in tests without privileges.

pub mod linux;

use std::any::Any;
use std::os::unix::io::RawFd;
use std::path::Path;

use caps::{CapSet, Capability, CapsHashSet};
use nix::mount::{MntFlags, MsFlags};
use nix::sched::CloneFlags;
use nix::sys::stat::{Mode, SFlag};
use nix::unistd::{Gid, Uid};

use crate::error::Result;

pub trait Syscall {
    fn as_any(&self) -> &dyn Any;

    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> Result<()>;
    fn umount(&self, target: &Path, flags: MntFlags) -> Result<()>;

    fn pivot_rootfs(&self, path: &Path) -> Result<()>;
    fn chroot(&self, path: &Path) -> Result<()>;
    fn chdir(&self, path: &Path) -> Result<()>;
    fn set_ns(&self, fd: RawFd, nstype: CloneFlags) -> Result<()>;
    fn set_hostname(&self, hostname: &str) -> Result<()>;

    fn mknod(&self, path: &Path, kind: SFlag, perm: Mode, dev: u64) -> Result<()>;
    fn symlink(&self, original: &Path, link: &Path) -> Result<()>;
    fn chown(&self, path: &Path, uid: Uid, gid: Gid) -> Result<()>;

    fn set_rlimit(&self, resource: u32, soft: u64, hard: u64) -> Result<()>;
    fn set_capability(&self, cset: CapSet, value: &CapsHashSet) -> Result<()>;
    fn drop_bounded_cap(&self, cap: Capability) -> Result<()>;
    fn set_id(&self, uid: Uid, gid: Gid, user: &str) -> Result<()>;
}
