//! Kernel-backed implementation of the [`Syscall`] trait.

use std::any::Any;
use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::path::Path;

use caps::{CapSet, Capability, CapsHashSet};
use nix::fcntl::{open, OFlag};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{setns, CloneFlags};
use nix::sys::stat::{mknod, Mode, SFlag};
use nix::unistd::{self, fchdir, initgroups, pivot_root, sethostname, Gid, Uid};

use super::Syscall;
use crate::error::{Error, ErrorKind, Result};

#[derive(Clone)]
pub struct LinuxSyscall;

impl Syscall for LinuxSyscall {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> Result<()> {
        mount(source, target, fstype, flags, data).map_err(|e| {
            Error::from(e).wrap(format!(
                "mount({:?}, {}, {:?})",
                source.unwrap_or_else(|| Path::new("none")),
                target.display(),
                fstype.unwrap_or("none")
            ))
        })
    }

    fn umount(&self, target: &Path, flags: MntFlags) -> Result<()> {
        umount2(target, flags)
            .map_err(|e| Error::from(e).wrap(format!("umount({})", target.display())))
    }

    /// Stack the old root on top of the new one and detach it, which spares
    /// us a scratch directory for `put_old`. See pivot_root(2), NOTES.
    fn pivot_rootfs(&self, path: &Path) -> Result<()> {
        let newroot = open(path, OFlag::O_DIRECTORY | OFlag::O_RDONLY, Mode::empty())
            .map_err(|e| Error::from(e).wrap(format!("open({})", path.display())))?;

        pivot_root(path, path)
            .map_err(|e| Error::from(e).wrap(format!("pivot_root({})", path.display())))?;
        umount2("/", MntFlags::MNT_DETACH)
            .map_err(|e| Error::from(e).wrap("umount2(/, MNT_DETACH)"))?;
        fchdir(newroot).map_err(|e| Error::from(e).wrap("fchdir(newroot)"))?;
        let _ = unistd::close(newroot);
        Ok(())
    }

    fn chroot(&self, path: &Path) -> Result<()> {
        unistd::chroot(path)
            .map_err(|e| Error::from(e).wrap(format!("chroot({})", path.display())))
    }

    fn chdir(&self, path: &Path) -> Result<()> {
        unistd::chdir(path)
            .map_err(|e| Error::from(e).wrap(format!("chdir({})", path.display())))
    }

    fn set_ns(&self, fd: RawFd, nstype: CloneFlags) -> Result<()> {
        setns(fd, nstype).map_err(|e| Error::from(e).wrap(format!("setns({:?})", nstype)))
    }

    fn set_hostname(&self, hostname: &str) -> Result<()> {
        sethostname(hostname)
            .map_err(|e| Error::from(e).wrap(format!("sethostname({})", hostname)))
    }

    fn mknod(&self, path: &Path, kind: SFlag, perm: Mode, dev: u64) -> Result<()> {
        mknod(path, kind, perm, dev)
            .map_err(|e| Error::from(e).wrap(format!("mknod({})", path.display())))
    }

    fn symlink(&self, original: &Path, link: &Path) -> Result<()> {
        std::os::unix::fs::symlink(original, link).map_err(|e| {
            Error::from(e).wrap(format!(
                "symlink({} -> {})",
                link.display(),
                original.display()
            ))
        })
    }

    fn chown(&self, path: &Path, uid: Uid, gid: Gid) -> Result<()> {
        unistd::chown(path, Some(uid), Some(gid))
            .map_err(|e| Error::from(e).wrap(format!("chown({})", path.display())))
    }

    fn set_rlimit(&self, resource: u32, soft: u64, hard: u64) -> Result<()> {
        let rlim = libc::rlimit {
            rlim_cur: soft,
            rlim_max: hard,
        };
        let ret = unsafe { libc::setrlimit(resource, &rlim) };
        if ret != 0 {
            return Err(Error::sys(format!(
                "setrlimit({}, {}:{})",
                resource, soft, hard
            )));
        }
        Ok(())
    }

    fn set_capability(&self, cset: CapSet, value: &CapsHashSet) -> Result<()> {
        caps::set(None, cset, value)
            .map_err(|e| Error::new(ErrorKind::Permission, format!("set {:?}: {}", cset, e)))
    }

    fn drop_bounded_cap(&self, cap: Capability) -> Result<()> {
        caps::drop(None, CapSet::Bounding, cap)
            .map_err(|e| Error::new(ErrorKind::Permission, format!("drop {}: {}", cap, e)))
    }

    /// setgid before setuid: once the uid changes we may no longer have the
    /// privilege to change groups.
    fn set_id(&self, uid: Uid, gid: Gid, user: &str) -> Result<()> {
        unistd::setgid(gid).map_err(|e| Error::from(e).wrap("setgid()"))?;
        let cuser = CString::new(user)
            .map_err(|_| Error::new(ErrorKind::InvalidValue, "user name contains NUL"))?;
        initgroups(&cuser, gid).map_err(|e| Error::from(e).wrap("initgroups()"))?;
        unistd::setuid(uid).map_err(|e| Error::from(e).wrap("setuid()"))?;
        Ok(())
    }
}
