//! Standard I/O plumbing for spawned containers.
//!
//! The intermediate process closes everything it inherited and reopens fds
//! 0/1/2 onto the paths the container was configured with. The opens must
//! land on exactly those fd numbers; anything else means an fd leaked.

use std::os::unix::io::RawFd;
use std::path::Path;

use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::fchown;

use crate::error::{Error, ErrorKind, Result};
use crate::process::env::TaskEnv;
use crate::utils::{self, FileKind};

const STDIN: RawFd = 0;
const STDOUT: RawFd = 1;
const STDERR: RawFd = 2;

fn open_output(env: &TaskEnv, path: &Path, expected: RawFd) -> Result<()> {
    let fd = open(
        path,
        OFlag::O_CREAT | OFlag::O_WRONLY | OFlag::O_APPEND,
        Mode::from_bits_truncate(0o660),
    )
    .map_err(|e| {
        Error::os(
            ErrorKind::InvalidValue,
            e as i32,
            format!("open({}) -> {}", path.display(), expected),
        )
    })?;
    if fd != expected {
        return Err(Error::os(
            ErrorKind::Unknown,
            libc::EINVAL,
            format!(
                "open({}) -> {}: unexpected fd {}",
                path.display(),
                expected,
                fd
            ),
        ));
    }
    fchown(fd, Some(env.cred.uid), Some(env.cred.gid)).map_err(|e| {
        Error::os(
            ErrorKind::Unknown,
            e as i32,
            format!("fchown({}) -> {}", path.display(), expected),
        )
    })?;
    Ok(())
}

/// Close every inherited fd except `keep`, then populate 0/1/2 from the
/// environment's stdio paths.
pub fn reopen(env: &TaskEnv, keep: &[RawFd]) -> Result<()> {
    utils::close_fds(0, keep)?;

    let fd = open(
        &env.stdin_path,
        OFlag::O_CREAT | OFlag::O_RDONLY,
        Mode::from_bits_truncate(0o660),
    )
    .map_err(|e| {
        Error::os(
            ErrorKind::Unknown,
            e as i32,
            format!("open({}) -> 0", env.stdin_path.display()),
        )
    })?;
    if fd != STDIN {
        return Err(Error::os(
            ErrorKind::Unknown,
            libc::EINVAL,
            "open(0): unexpected fd",
        ));
    }

    open_output(env, &env.stdout_path, STDOUT)?;
    open_output(env, &env.stderr_path, STDERR)?;
    Ok(())
}

fn remove_stdio_file(path: &Path) {
    match utils::file_kind(path) {
        // Never unlink device nodes a container was pointed at.
        FileKind::Character | FileKind::Block | FileKind::Missing => {}
        _ => {
            if let Err(e) = std::fs::remove_file(path) {
                log::error!("cannot remove stdio file {}: {}", path.display(), e);
            }
        }
    }
}

/// Drop the stdio files the runtime created itself.
pub fn remove_stdio(env: &TaskEnv) {
    if env.remove_stdout {
        remove_stdio_file(&env.stdout_path);
    }
    if env.remove_stderr {
        remove_stdio_file(&env.stderr_path);
    }
}

/// Trim regular stdout/stderr files that outgrew the configured bound.
pub fn rotate(env: &TaskEnv, max_size: u64) -> Result<()> {
    if utils::file_kind(&env.stdout_path) == FileKind::Regular {
        utils::rotate_log(&env.stdout_path, max_size)?;
    }
    if utils::file_kind(&env.stderr_path) == FileKind::Regular {
        utils::rotate_log(&env.stderr_path, max_size)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_stdio_skips_devices() {
        let mut env = TaskEnv::default();
        env.stdout_path = "/dev/null".into();
        env.remove_stdout = true;
        remove_stdio(&env);
        assert!(Path::new("/dev/null").exists());
    }

    #[test]
    fn test_remove_stdio_removes_regular_files() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("stdout.log");
        let err = dir.path().join("stderr.log");
        std::fs::write(&out, "x").unwrap();
        std::fs::write(&err, "x").unwrap();

        let mut env = TaskEnv::default();
        env.stdout_path = out.clone();
        env.stderr_path = err.clone();
        env.remove_stdout = true;
        env.remove_stderr = false;
        remove_stdio(&env);

        assert!(!out.exists());
        assert!(err.exists());
    }

    #[test]
    fn test_rotate_only_touches_regular_files() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("stdout.log");
        std::fs::write(&out, vec![b'x'; 4096]).unwrap();

        let mut env = TaskEnv::default();
        env.stdout_path = out.clone();
        env.stderr_path = "/dev/null".into();
        rotate(&env, 1024).unwrap();

        assert!(std::fs::metadata(&out).unwrap().len() <= 1024);
    }
}
