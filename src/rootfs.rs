//! Construction of the container's mount namespace: root filesystem, /sys,
//! /proc with restrictions, a private /dev, bind mounts, and the final
//! pivot into the new root.
//!
//! Every step runs inside the grandchild's fresh mount namespace and is
//! extremely order-sensitive; see the step comments. All mounts go through
//! the syscall seam so the exact sequence is testable.

use std::fs;
use std::path::{Path, PathBuf};

use nix::mount::MsFlags;
use nix::sys::stat::{makedev, Mode, SFlag};

use crate::error::{Error, ErrorKind, Result};
use crate::mount::{self, Mount};
use crate::process::env::TaskEnv;
use crate::syscall::Syscall;
use crate::utils::{self, FileKind, PathBufExt};

fn default_flags() -> MsFlags {
    MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV
}

/// Bind-mount the configured entries into the root. A target that resolves
/// outside the root is an attack, not a configuration.
fn bind_all(env: &TaskEnv, syscall: &dyn Syscall) -> Result<()> {
    for bind in &env.bind_map {
        let dest = if env.root == Path::new("/") {
            env.cwd.join(&bind.dest)
        } else if bind.dest.is_absolute() {
            env.root.join_absolute(&bind.dest)?
        } else {
            env.root.join(&bind.dest)
        };

        if env.root != Path::new("/") {
            let real = utils::canonicalize_prefix(&dest)?;
            let root = utils::canonicalize_prefix(&env.root)?;
            if !real.starts_with(&root) {
                return Err(Error::new(
                    ErrorKind::InvalidValue,
                    format!(
                        "container bind mount {} resolves to root {} ({})",
                        bind.source.display(),
                        real.display(),
                        env.root.display()
                    ),
                ));
            }
        }

        let mount = Mount::new(&bind.source, &dest, "none", vec![]);
        match utils::file_kind(&bind.source) {
            FileKind::Directory => mount.bind_dir(syscall, bind.rdonly, MsFlags::empty())?,
            _ => mount.bind_file(syscall, bind.rdonly)?,
        }
    }
    Ok(())
}

/// Hide the host's dangerous /proc entries behind read-only binds and mask
/// kcore entirely.
fn restrict_proc(env: &TaskEnv, syscall: &dyn Syscall, privileged: bool) -> Result<()> {
    let mut paths = vec!["/proc/sysrq-trigger", "/proc/irq", "/proc/bus"];
    if !privileged {
        paths.push("/proc/sys");
    }

    for path in paths {
        let target = env.root.join_absolute(Path::new(path))?;
        let mount = Mount::new(&target, &target, "none", vec![]);
        match utils::file_kind(&target) {
            FileKind::Directory => mount.bind_dir(syscall, true, MsFlags::empty())?,
            _ => mount.bind_file(syscall, true)?,
        }
    }

    let kcore = env.root.join_absolute(Path::new("/proc/kcore"))?;
    Mount::new("/dev/null", &kcore, "none", vec![]).bind_file(syscall, false)?;
    Ok(())
}

/// A private /dev: small tmpfs, new devpts instance, the canonical device
/// nodes, and the compatibility symlinks.
fn mount_dev(env: &TaskEnv, syscall: &dyn Syscall) -> Result<()> {
    let nodes = [
        ("/dev/null", makedev(1, 3)),
        ("/dev/zero", makedev(1, 5)),
        ("/dev/full", makedev(1, 7)),
        ("/dev/random", makedev(1, 8)),
        ("/dev/urandom", makedev(1, 9)),
    ];

    let dev = env.root.join_absolute(Path::new("/dev"))?;
    Mount::new(
        "tmpfs",
        &dev,
        "tmpfs",
        vec!["mode=755".into(), "size=32m".into()],
    )
    .mount_dir(syscall, MsFlags::MS_NOSUID | MsFlags::MS_STRICTATIME)?;

    Mount::new(
        "devpts",
        env.root.join_absolute(Path::new("/dev/pts"))?,
        "devpts",
        vec![
            "newinstance".into(),
            "ptmxmode=0666".into(),
            "mode=620".into(),
            "gid=5".into(),
        ],
    )
    .mount_dir(syscall, MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC)?;

    for (path, dev) in nodes {
        syscall.mknod(
            &env.root.join_absolute(Path::new(path))?,
            SFlag::S_IFCHR,
            Mode::from_bits_truncate(0o666),
            dev,
        )?;
    }

    syscall.symlink(
        Path::new("pts/ptmx"),
        &env.root.join_absolute(Path::new("/dev/ptmx"))?,
    )?;
    syscall.symlink(
        Path::new("/proc/self/fd"),
        &env.root.join_absolute(Path::new("/dev/fd"))?,
    )?;

    let console = env.root.join_absolute(Path::new("/dev/console"))?;
    let _ = fs::File::create(&console);

    Ok(())
}

/// Loop-backed roots carry a persistent /run; replace it with a tmpfs but
/// keep its directory skeleton. The enumeration must happen before the
/// mount, afterwards the old content is shadowed.
fn mount_run(env: &TaskEnv, syscall: &dyn Syscall) -> Result<()> {
    let run = env.root.join_absolute(Path::new("/run"))?;
    let mut subdirs: Vec<PathBuf> = Vec::new();
    if run.is_dir() {
        for entry in fs::read_dir(&run)
            .map_err(|e| Error::from(e).wrap(format!("list {}", run.display())))?
        {
            let entry = entry.map_err(Error::from)?;
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                subdirs.push(run.join(entry.file_name()));
            }
        }
    }

    Mount::new(
        "tmpfs",
        &run,
        "tmpfs",
        vec!["mode=755".into(), "size=32m".into()],
    )
    .mount_dir(syscall, MsFlags::MS_NOSUID | MsFlags::MS_STRICTATIME)?;

    for dir in subdirs {
        fs::create_dir_all(&dir)
            .map_err(|e| Error::from(e).wrap(format!("mkdir {}", dir.display())))?;
    }
    Ok(())
}

fn bind_dns(env: &TaskEnv, syscall: &dyn Syscall) -> Result<()> {
    for file in ["/etc/hosts", "/etc/resolv.conf"] {
        Mount::new(
            file,
            env.root.join_absolute(Path::new(file))?,
            "none",
            vec![],
        )
        .bind_file(syscall, true)?;
    }
    Ok(())
}

/// Build the container's filesystem view and enter it. Returns the loop
/// device the root was mounted from, if any.
pub fn isolate_fs(env: &TaskEnv, syscall: &dyn Syscall) -> Result<Option<String>> {
    // Without a chroot only the bind map applies, relative to cwd.
    if env.root == Path::new("/") {
        bind_all(env, syscall)?;
        return Ok(None);
    }

    // 1. The root must itself be a mount point for pivot_root to accept it:
    //    either the loop image mounted onto it, or a self-bind.
    let loop_dev = match &env.loop_image {
        Some(image) if image.exists() => Some(mount::loop_mount(
            syscall,
            image,
            env.loop_dev.as_deref(),
            &env.root,
        )?),
        _ => {
            Mount::new(&env.root, &env.root, "none", vec![]).bind_dir(
                syscall,
                false,
                MsFlags::MS_SHARED,
            )?;
            None
        }
    };

    // 2-3. Kernel filesystems, /sys strictly read-only.
    Mount::new("sysfs", env.root.join_absolute(Path::new("/sys"))?, "sysfs", vec![])
        .mount_dir(syscall, default_flags() | MsFlags::MS_RDONLY)?;
    Mount::new("proc", env.root.join_absolute(Path::new("/proc"))?, "proc", vec![])
        .mount_dir(syscall, default_flags())?;

    // 4. /proc restrictions; root containers keep a writable /proc/sys.
    restrict_proc(env, syscall, env.cred.is_root())?;

    // 5. Private /dev.
    mount_dev(env, syscall)?;

    // 6. Image-backed roots get a fresh /run.
    if loop_dev.is_some() {
        mount_run(env, syscall)?;
    }

    // 7. Shared memory.
    Mount::new(
        "shm",
        env.root.join_absolute(Path::new("/dev/shm"))?,
        "tmpfs",
        vec!["mode=1777".into(), "size=65536k".into()],
    )
    .mount_dir(syscall, default_flags())?;

    // 8. Host resolver files, if requested.
    if env.bind_dns {
        bind_dns(env, syscall)?;
    }

    // 9. User binds, after everything the container relies on is in place.
    bind_all(env, syscall)?;

    // 10. Seal the root last so the steps above could still write it.
    if env.root_rdonly {
        let mut flags = MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY;
        if loop_dev.is_none() {
            flags |= MsFlags::MS_BIND;
        }
        Mount::new(&env.root, &env.root, "none", vec![]).remount(syscall, flags)?;
    }

    // 11. Enter. pivot_root fails on some propagation setups; chroot is the
    //     degraded fallback.
    syscall.chdir(&env.root)?;
    if let Err(e) = syscall.pivot_rootfs(&env.root) {
        log::warn!("cannot pivot root, rolling back to chroot: {}", e);
        syscall.chroot(&env.root)?;
    }
    syscall.chdir(Path::new("/"))?;

    Ok(loop_dev)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cred::Credentials;
    use crate::syscall::test::TestSyscall;
    use nix::unistd::{Gid, Uid};

    fn chroot_env() -> (tempfile::TempDir, TaskEnv) {
        let dir = tempfile::tempdir().unwrap();
        let mut env = TaskEnv::default();
        env.root = dir.path().to_path_buf();
        (dir, env)
    }

    #[test]
    fn test_isolate_fs_sequence() {
        let (_dir, env) = chroot_env();
        let syscall = TestSyscall::default();

        isolate_fs(&env, &syscall).unwrap();

        let mounts = syscall.get_mount_args();
        let position = |suffix: &str| {
            mounts
                .iter()
                .position(|m| m.target.to_string_lossy().ends_with(suffix))
                .unwrap_or_else(|| panic!("no mount with target suffix {}", suffix))
        };

        // Root self-bind comes first and is shared so it becomes a mount point.
        assert_eq!(mounts[0].target, env.root);
        assert!(mounts[0].flags.contains(MsFlags::MS_BIND));
        assert!(mounts[0].flags.contains(MsFlags::MS_SHARED));

        // Kernel filesystems precede the /proc restrictions, which precede /dev.
        assert!(position("/sys") < position("/proc"));
        assert!(position("/proc") < position("/proc/sysrq-trigger"));
        assert!(position("/proc/kcore") < position("/dev"));
        assert!(position("/dev") < position("/dev/pts"));
        assert!(position("/dev/pts") < position("/dev/shm"));

        // /sys is read-only, /proc is not.
        assert!(mounts[position("/sys")].flags.contains(MsFlags::MS_RDONLY));
        assert!(!mounts[position("/proc")].flags.contains(MsFlags::MS_RDONLY));

        // Entry happens last: chdir(root), pivot, chdir(/).
        assert_eq!(syscall.get_pivot_args(), vec![env.root.clone()]);
        assert_eq!(
            syscall.get_chdir_args(),
            vec![env.root.clone(), PathBuf::from("/")]
        );
        assert!(syscall.get_chroot_args().is_empty());

        // Device nodes with their canonical numbers.
        let mknods = syscall.get_mknod_args();
        assert_eq!(mknods.len(), 5);
        assert_eq!(mknods[0].3, makedev(1, 3));
        assert!(mknods.iter().all(|(_, kind, _, _)| *kind == SFlag::S_IFCHR));

        // ptmx and fd symlinks.
        let symlinks = syscall.get_symlink_args();
        assert_eq!(symlinks[0].0, PathBuf::from("pts/ptmx"));
        assert_eq!(symlinks[1].0, PathBuf::from("/proc/self/fd"));
    }

    #[test]
    fn test_unprivileged_gets_proc_sys_masked() {
        let (_dir, mut env) = chroot_env();
        env.cred = Credentials {
            uid: Uid::from_raw(1000),
            gid: Gid::from_raw(1000),
        };
        let syscall = TestSyscall::default();
        isolate_fs(&env, &syscall).unwrap();
        assert!(syscall
            .get_mount_args()
            .iter()
            .any(|m| m.target.to_string_lossy().ends_with("/proc/sys")));

        let (_dir, root_env) = chroot_env();
        let root_syscall = TestSyscall::default();
        isolate_fs(&root_env, &root_syscall).unwrap();
        assert!(!root_syscall
            .get_mount_args()
            .iter()
            .any(|m| m.target.to_string_lossy().ends_with("/proc/sys")));
    }

    #[test]
    fn test_rdonly_root_is_sealed_after_binds() {
        let (_dir, mut env) = chroot_env();
        env.root_rdonly = true;
        let syscall = TestSyscall::default();
        isolate_fs(&env, &syscall).unwrap();

        let mounts = syscall.get_mount_args();
        let last = mounts.last().unwrap();
        assert_eq!(last.target, env.root);
        assert!(last.flags.contains(MsFlags::MS_REMOUNT));
        assert!(last.flags.contains(MsFlags::MS_RDONLY));
        // Not loop-backed, so the remount needs MS_BIND.
        assert!(last.flags.contains(MsFlags::MS_BIND));
    }

    #[test]
    fn test_bind_escape_is_rejected() {
        let (_dir, mut env) = chroot_env();
        env.bind_map.push(crate::process::env::BindEntry {
            source: "/etc".into(),
            dest: "../../outside".into(),
            rdonly: true,
        });
        let syscall = TestSyscall::default();

        let err = isolate_fs(&env, &syscall).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidValue);
        assert!(err.message().contains("resolves to root"));
    }

    #[test]
    fn test_bind_inside_root_is_accepted() {
        let (_dir, mut env) = chroot_env();
        env.bind_map.push(crate::process::env::BindEntry {
            source: "/etc".into(),
            dest: "/mnt/etc".into(),
            rdonly: true,
        });
        let syscall = TestSyscall::default();
        isolate_fs(&env, &syscall).unwrap();
        assert!(syscall
            .get_mount_args()
            .iter()
            .any(|m| m.target.to_string_lossy().ends_with("/mnt/etc")));
    }

    #[test]
    fn test_no_chroot_only_applies_binds() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = TaskEnv::default();
        env.root = PathBuf::from("/");
        env.cwd = dir.path().to_path_buf();
        env.bind_map.push(crate::process::env::BindEntry {
            source: "/etc".into(),
            dest: "etc".into(),
            rdonly: false,
        });
        let syscall = TestSyscall::default();

        isolate_fs(&env, &syscall).unwrap();
        let mounts = syscall.get_mount_args();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].target, dir.path().join("etc"));
        assert!(syscall.get_pivot_args().is_empty());
    }

    #[test]
    fn test_run_subdirs_survive_tmpfs() {
        let (_dir, mut env) = chroot_env();
        let run = env.root.join("run");
        fs::create_dir_all(run.join("lock")).unwrap();
        fs::create_dir_all(run.join("user")).unwrap();
        // Pretend the root is image-backed; point at a missing image so the
        // loop path is skipped but /run handling can be driven directly.
        env.loop_image = Some(PathBuf::from("/no/such/image"));

        let syscall = TestSyscall::default();
        mount_run(&env, &syscall).unwrap();

        assert!(run.join("lock").is_dir());
        assert!(run.join("user").is_dir());
        let mounts = syscall.get_mount_args();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].fstype.as_deref(), Some("tmpfs"));
    }
}
