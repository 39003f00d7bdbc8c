//! Short-lived privileged helper commands (cp, find, rm) run in a confined
//! child: helpers memory cgroup, death signal, read-only root with only the
//! working directory writable, and a capability ceiling.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::mount::MsFlags;
use nix::sched::{unshare, CloneFlags};
use nix::sys::signal::Signal;
use nix::sys::stat::Mode;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{self, dup2, ForkResult};

use caps::Capability;

use crate::cgroups::{ControllerKind, Registry};
use crate::config::config;
use crate::cred;
use crate::error::{Error, ErrorKind, Result};
use crate::syscall::linux::LinuxSyscall;
use crate::syscall::Syscall;
use crate::utils;

/// Tail of the helper's stderr that gets folded into the error message.
const ERROR_TAIL: usize = 3072;

/// What a file-management helper may keep in its bounding set.
fn helper_caps() -> u64 {
    [
        Capability::CAP_CHOWN,
        Capability::CAP_DAC_OVERRIDE,
        Capability::CAP_FOWNER,
        Capability::CAP_FSETID,
        Capability::CAP_DAC_READ_SEARCH,
    ]
    .iter()
    .fold(0u64, |mask, c| mask | (1u64 << c.index()))
}

fn helper_error(scratch_fd: RawFd, text: &str, error: &Error) -> ! {
    log::warn!("{}: {}", text, error);
    let _ = unistd::write(scratch_fd, format!("{}: {}", text, error).as_bytes());
    std::process::exit(1);
}

fn helper_child(
    command: &[String],
    dir: &Path,
    stdin_fd: Option<RawFd>,
    stdout_fd: Option<RawFd>,
    scratch_fd: RawFd,
) -> ! {
    let syscall = LinuxSyscall;

    // All helper descendants are accounted against one memory cgroup.
    match Registry::get().cgroup(ControllerKind::Memory, &config().daemon.helpers_cgroup) {
        Ok(memcg) => match memcg.attach(unistd::getpid().as_raw()) {
            // An unprivileged daemon cannot account helpers; not fatal.
            Err(e) if e.kind() == ErrorKind::Permission => {
                log::warn!("cannot attach to helper cgroup: {}", e)
            }
            Err(e) => helper_error(scratch_fd, "cannot attach to helper cgroup", &e),
            Ok(()) => {}
        },
        Err(e) => log::warn!("helper cgroup unavailable: {}", e),
    }

    if let Err(e) = prctl::set_death_signal(Signal::SIGKILL as isize) {
        helper_error(
            scratch_fd,
            "pdeathsig",
            &Error::os(ErrorKind::Unknown, e, "prctl(PR_SET_PDEATHSIG)"),
        );
    }

    let stdin_fd = match stdin_fd {
        Some(fd) => fd,
        None => match open(Path::new("/dev/null"), OFlag::O_RDONLY, Mode::empty()) {
            Ok(fd) => fd,
            Err(e) => helper_error(scratch_fd, "open stdin", &Error::from(e)),
        },
    };
    if let Err(e) = dup2(stdin_fd, 0) {
        helper_error(scratch_fd, "stdin", &Error::from(e));
    }
    if let Err(e) = dup2(stdout_fd.unwrap_or(scratch_fd), 1) {
        helper_error(scratch_fd, "stdout", &Error::from(e));
    }
    if let Err(e) = dup2(scratch_fd, 2) {
        helper_error(scratch_fd, "stderr", &Error::from(e));
    }

    let root = Path::new("/");
    if dir != root {
        // Private mount namespace with a read-only view of everything but
        // the working directory.
        if let Err(e) = unshare(CloneFlags::CLONE_NEWNS) {
            helper_error(scratch_fd, "newns", &Error::from(e));
        }
        if let Err(e) = syscall.mount(
            None,
            root,
            None,
            MsFlags::MS_PRIVATE | MsFlags::MS_REC,
            None,
        ) {
            helper_error(scratch_fd, "remount private", &e);
        }
        if let Err(e) = syscall.mount(
            None,
            root,
            None,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_REC | MsFlags::MS_RDONLY,
            None,
        ) {
            helper_error(scratch_fd, "remount read-only", &e);
        }
        if let Err(e) = syscall.mount(
            Some(dir),
            dir,
            None,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None,
        ) {
            helper_error(scratch_fd, "bind workdir", &e);
        }
        if let Err(e) = syscall.chdir(dir) {
            helper_error(scratch_fd, "chdir", &e);
        }
    } else if let Err(e) = syscall.chdir(root) {
        helper_error(scratch_fd, "root chdir", &e);
    }

    // An unprivileged daemon has nothing to drop.
    if unistd::geteuid().is_root() {
        if let Err(e) = cred::limit_capabilities(&syscall, helper_caps()) {
            helper_error(scratch_fd, "caps", &e);
        }
    }

    let _ = utils::close_fds(3, &[]);

    let argv: Vec<std::ffi::CString> = command
        .iter()
        .map(|a| std::ffi::CString::new(a.as_str()).unwrap_or_default())
        .collect();
    let errno = unistd::execvp(&argv[0], &argv).unwrap_err();
    // The scratch fd is gone with the rest; fd 2 still points at it.
    helper_error(
        2,
        &format!("cannot execute {}", command[0]),
        &Error::from(errno),
    );
}

fn read_error_tail(scratch: &mut File) -> String {
    let len = scratch.metadata().map(|m| m.len()).unwrap_or(0);
    let start = len.saturating_sub(ERROR_TAIL as u64);
    let mut text = String::new();
    if scratch.seek(SeekFrom::Start(start)).is_ok() {
        let _ = scratch.read_to_string(&mut text);
    }
    text
}

/// Fork a confined helper and wait for it. A non-zero exit comes back as an
/// error wrapping the tail of the helper's stderr.
pub fn run_command(
    command: &[String],
    dir: &Path,
    stdin_fd: Option<RawFd>,
    stdout_fd: Option<RawFd>,
) -> Result<()> {
    if command.is_empty() {
        return Err(Error::new(ErrorKind::InvalidValue, "external command is empty"));
    }

    let mut scratch = tempfile::tempfile().map_err(Error::from)?;
    let cmdline = command.join(" ");
    log::info!("call helper: {} in {}", cmdline, dir.display());

    let child = match unsafe { unistd::fork() } {
        Ok(ForkResult::Parent { child }) => child,
        Ok(ForkResult::Child) => {
            helper_child(command, dir, stdin_fd, stdout_fd, scratch.as_raw_fd())
        }
        Err(e) => return Err(Error::from(e).wrap("fork()")),
    };

    let failed = match waitpid(child, None) {
        Ok(WaitStatus::Exited(_, 0)) => false,
        Ok(_) => true,
        // The reaper thread can win the race for the status; the scratch
        // file still carries the verdict.
        Err(Errno::ECHILD) => false,
        Err(e) => return Err(Error::from(e).wrap("waitpid(helper)")),
    };

    let text = read_error_tail(&mut scratch);
    if failed || !text.is_empty() {
        return Err(Error::new(
            ErrorKind::Unknown,
            format!("helper: {} stderr: {}", cmdline, text.trim_end()),
        ));
    }
    Ok(())
}

fn copy_argv(src: &Path, _dst: &Path) -> Vec<String> {
    vec![
        "cp".into(),
        "--archive".into(),
        "--force".into(),
        "--one-file-system".into(),
        "--no-target-directory".into(),
        src.to_string_lossy().into_owned(),
        ".".into(),
    ]
}

fn clear_argv() -> Vec<String> {
    vec![
        "find".into(),
        ".".into(),
        "-xdev".into(),
        "-mindepth".into(),
        "1".into(),
        "-delete".into(),
    ]
}

fn remove_argv(path: &Path) -> Vec<String> {
    vec![
        "rm".into(),
        "-rf".into(),
        "--one-file-system".into(),
        "--".into(),
        path.to_string_lossy().into_owned(),
    ]
}

pub fn copy_recursive(src: &Path, dst: &Path) -> Result<()> {
    run_command(&copy_argv(src, dst), dst, None, None)
}

pub fn clear_recursive(path: &Path) -> Result<()> {
    run_command(&clear_argv(), path, None, None)
}

pub fn remove_recursive(path: &Path) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("/"));
    run_command(&remove_argv(path), dir, None, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_command_is_invalid() {
        assert_eq!(
            run_command(&[], Path::new("/"), None, None)
                .unwrap_err()
                .kind(),
            ErrorKind::InvalidValue
        );
    }

    #[test]
    fn test_helper_argv_shapes() {
        assert_eq!(
            copy_argv(Path::new("/src"), Path::new("/dst")),
            vec![
                "cp",
                "--archive",
                "--force",
                "--one-file-system",
                "--no-target-directory",
                "/src",
                "."
            ]
        );
        assert_eq!(
            clear_argv(),
            vec!["find", ".", "-xdev", "-mindepth", "1", "-delete"]
        );
        assert_eq!(
            remove_argv(Path::new("/some/dir")),
            vec!["rm", "-rf", "--one-file-system", "--", "/some/dir"]
        );
    }

    #[test]
    fn test_successful_helper_in_root() {
        // dir == "/" skips the mount namespace isolation, so this runs
        // without privileges.
        run_command(&["true".to_string()], Path::new("/"), None, None).unwrap();
    }

    #[test]
    fn test_failing_helper_reports_stderr_tail() {
        let err = run_command(
            &["ls".to_string(), "/definitely/not/here".to_string()],
            Path::new("/"),
            None,
            None,
        )
        .unwrap_err();
        assert!(err.message().contains("helper: ls"));
        assert!(err.message().contains("stderr"));
    }

    #[test]
    fn test_helper_caps_are_file_management_only() {
        let mask = helper_caps();
        assert!(mask & (1 << Capability::CAP_CHOWN.index()) != 0);
        assert!(mask & (1 << Capability::CAP_NET_ADMIN.index()) == 0);
        assert!(mask & (1 << Capability::CAP_SYS_ADMIN.index()) == 0);
    }
}
