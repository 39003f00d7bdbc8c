//! Mount primitives: a single mount record with the operations the runtime
//! needs, a snapshot of the host mount table, and loop device plumbing for
//! image-backed roots.

use std::fs;
use std::path::{Path, PathBuf};

use nix::fcntl::{open, OFlag};
use nix::mount::MsFlags;
use nix::sys::stat::Mode;
use nix::unistd::close;

use crate::error::{Error, Result};
use crate::syscall::Syscall;

#[derive(Debug, Clone)]
pub struct Mount {
    source: PathBuf,
    target: PathBuf,
    fstype: String,
    data: Vec<String>,
}

impl Mount {
    pub fn new(
        source: impl Into<PathBuf>,
        target: impl Into<PathBuf>,
        fstype: impl Into<String>,
        data: Vec<String>,
    ) -> Self {
        Mount {
            source: source.into(),
            target: target.into(),
            fstype: fstype.into(),
            data,
        }
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    fn data_opt(&self) -> Option<String> {
        if self.data.is_empty() {
            None
        } else {
            Some(self.data.join(","))
        }
    }

    fn fstype_opt(&self) -> Option<&str> {
        if self.fstype.is_empty() || self.fstype == "none" {
            None
        } else {
            Some(&self.fstype)
        }
    }

    /// Mount a filesystem onto `target`, creating the directory first.
    pub fn mount_dir(&self, syscall: &dyn Syscall, flags: MsFlags) -> Result<()> {
        fs::create_dir_all(&self.target)
            .map_err(|e| Error::from(e).wrap(format!("mkdir {}", self.target.display())))?;
        let data = self.data_opt();
        syscall.mount(
            Some(&self.source),
            &self.target,
            self.fstype_opt(),
            flags,
            data.as_deref(),
        )
    }

    /// Bind a directory over `target`. Read-only binds need a second
    /// remount; the first call only attaches the subtree.
    pub fn bind_dir(&self, syscall: &dyn Syscall, rdonly: bool, extra: MsFlags) -> Result<()> {
        fs::create_dir_all(&self.target)
            .map_err(|e| Error::from(e).wrap(format!("mkdir {}", self.target.display())))?;
        syscall.mount(
            Some(&self.source),
            &self.target,
            None,
            MsFlags::MS_BIND | extra,
            None,
        )?;
        if rdonly {
            self.remount(
                syscall,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            )?;
        }
        Ok(())
    }

    /// Bind a single file, creating an empty target file if needed.
    pub fn bind_file(&self, syscall: &dyn Syscall, rdonly: bool) -> Result<()> {
        if let Some(parent) = self.target.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::from(e).wrap(format!("mkdir {}", parent.display())))?;
        }
        if !self.target.exists() {
            fs::File::create(&self.target)
                .map_err(|e| Error::from(e).wrap(format!("touch {}", self.target.display())))?;
        }
        syscall.mount(
            Some(&self.source),
            &self.target,
            None,
            MsFlags::MS_BIND,
            None,
        )?;
        if rdonly {
            self.remount(
                syscall,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            )?;
        }
        Ok(())
    }

    pub fn remount(&self, syscall: &dyn Syscall, flags: MsFlags) -> Result<()> {
        syscall.mount(Some(&self.target), &self.target, None, flags, None)
    }
}

/// The host mount table at a point in time.
pub struct MountSnapshot {
    mount_points: Vec<PathBuf>,
}

impl MountSnapshot {
    pub fn new() -> Result<Self> {
        let mounts = procfs::process::Process::myself()?.mountinfo()?;
        Ok(MountSnapshot {
            mount_points: mounts.into_iter().map(|m| m.mount_point).collect(),
        })
    }

    pub fn from_mount_points(mount_points: Vec<PathBuf>) -> Self {
        MountSnapshot { mount_points }
    }

    /// Switch every mount to slave propagation so mounts made in this mount
    /// namespace stop leaking back to the host. Individual failures are
    /// logged and skipped: some kernel-internal mounts refuse propagation
    /// changes.
    pub fn remount_slave(&self, syscall: &dyn Syscall) -> Result<()> {
        for mount_point in &self.mount_points {
            if let Err(e) = syscall.mount(None, mount_point, None, MsFlags::MS_SLAVE, None) {
                log::warn!("cannot make {} slave: {}", mount_point.display(), e);
            }
        }
        Ok(())
    }
}

const LOOP_SET_FD: libc::c_ulong = 0x4C00;
const LOOP_CLR_FD: libc::c_ulong = 0x4C01;
const LOOP_CTL_GET_FREE: libc::c_ulong = 0x4C82;

/// Attach an image file to a loop device. Without an explicit device name,
/// `/dev/loop-control` hands out a free slot.
pub fn attach_loop(image: &Path, requested: Option<&str>) -> Result<String> {
    let device = match requested {
        Some(dev) => dev.to_owned(),
        None => {
            let ctl = open("/dev/loop-control", OFlag::O_RDWR, Mode::empty())
                .map_err(|e| Error::from(e).wrap("open(/dev/loop-control)"))?;
            let index = unsafe { libc::ioctl(ctl, LOOP_CTL_GET_FREE) };
            let _ = close(ctl);
            if index < 0 {
                return Err(Error::sys("ioctl(LOOP_CTL_GET_FREE)"));
            }
            format!("/dev/loop{}", index)
        }
    };

    let dev_fd = open(Path::new(&device), OFlag::O_RDWR, Mode::empty())
        .map_err(|e| Error::from(e).wrap(format!("open({})", device)))?;
    let image_fd = match open(image, OFlag::O_RDWR, Mode::empty()) {
        Ok(fd) => fd,
        Err(e) => {
            let _ = close(dev_fd);
            return Err(Error::from(e).wrap(format!("open({})", image.display())));
        }
    };

    let ret = unsafe { libc::ioctl(dev_fd, LOOP_SET_FD, image_fd) };
    let _ = close(image_fd);
    let _ = close(dev_fd);
    if ret < 0 {
        return Err(Error::sys(format!("ioctl(LOOP_SET_FD, {})", device)));
    }
    Ok(device)
}

pub fn detach_loop(device: &str) -> Result<()> {
    let dev_fd = open(Path::new(device), OFlag::O_RDWR, Mode::empty())
        .map_err(|e| Error::from(e).wrap(format!("open({})", device)))?;
    let ret = unsafe { libc::ioctl(dev_fd, LOOP_CLR_FD, 0) };
    let _ = close(dev_fd);
    if ret < 0 {
        return Err(Error::sys(format!("ioctl(LOOP_CLR_FD, {})", device)));
    }
    Ok(())
}

/// Loop-mount an ext4 image onto `root`.
pub fn loop_mount(
    syscall: &dyn Syscall,
    image: &Path,
    requested_dev: Option<&str>,
    root: &Path,
) -> Result<String> {
    let device = attach_loop(image, requested_dev)?;
    let mount = Mount::new(&device, root, "ext4", vec![]);
    if let Err(e) = mount.mount_dir(syscall, MsFlags::empty()) {
        let _ = detach_loop(&device);
        return Err(e.wrap(format!("loop mount {} on {}", image.display(), root.display())));
    }
    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall::test::TestSyscall;

    #[test]
    fn test_bind_dir_rdonly_remounts() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("bind");
        let syscall = TestSyscall::default();

        Mount::new("/etc", &target, "none", vec![])
            .bind_dir(&syscall, true, MsFlags::empty())
            .unwrap();

        let calls = syscall.get_mount_args();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].flags.contains(MsFlags::MS_BIND));
        assert!(calls[1].flags.contains(MsFlags::MS_REMOUNT));
        assert!(calls[1].flags.contains(MsFlags::MS_RDONLY));
        assert!(target.is_dir());
    }

    #[test]
    fn test_bind_file_creates_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("etc/hosts");
        let syscall = TestSyscall::default();

        Mount::new("/etc/hosts", &target, "none", vec![])
            .bind_file(&syscall, false)
            .unwrap();

        assert!(target.is_file());
        assert_eq!(syscall.get_mount_args().len(), 1);
    }

    #[test]
    fn test_mount_dir_joins_data() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("dev");
        let syscall = TestSyscall::default();

        Mount::new(
            "tmpfs",
            &target,
            "tmpfs",
            vec!["mode=755".into(), "size=32m".into()],
        )
        .mount_dir(&syscall, MsFlags::MS_NOSUID)
        .unwrap();

        let calls = syscall.get_mount_args();
        assert_eq!(calls[0].data.as_deref(), Some("mode=755,size=32m"));
        assert_eq!(calls[0].fstype.as_deref(), Some("tmpfs"));
    }

    #[test]
    fn test_remount_slave_covers_every_mount() {
        let syscall = TestSyscall::default();
        let snapshot = MountSnapshot::from_mount_points(vec![
            PathBuf::from("/"),
            PathBuf::from("/proc"),
            PathBuf::from("/sys"),
        ]);
        snapshot.remount_slave(&syscall).unwrap();

        let calls = syscall.get_mount_args();
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|c| c.flags == MsFlags::MS_SLAVE));
        assert_eq!(calls[0].target, PathBuf::from("/"));
    }
}
