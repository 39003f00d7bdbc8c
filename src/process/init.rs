//! The grandchild's deterministic pipeline: from "go" on the sync pipe to
//! execvpe, with every isolation step in between.
//!
//! Order is semantic. Namespace entry must precede filesystem isolation,
//! filesystem isolation must precede chdir(cwd), the hostname needs the UTS
//! namespace, capabilities must be pinned before setuid, and exec comes
//! last. Each failing step is reported over the sync pipe by the caller and
//! aborts the process.

use std::ffi::CString;
use std::path::Path;

use nix::sys::stat::{umask, Mode};
use nix::unistd;

use crate::config::config;
use crate::cred;
use crate::error::{Error, ErrorKind, Result};
use crate::mount::{Mount, MountSnapshot};
use crate::network;
use crate::process::env::TaskEnv;
use crate::process::pipe::SyncPipe;
use crate::rootfs;
use crate::signal;
use crate::syscall::Syscall;
use crate::utils;

/// Everything between the handshake and exec. Does not return on success:
/// the process image is replaced.
pub fn child_callback(
    env: &TaskEnv,
    wait_parent: &mut SyncPipe,
    syscall: &dyn Syscall,
) -> Result<()> {
    // Block until the parent finished the parts only it can do, network
    // namespace population above all.
    wait_parent.close_write();
    wait_parent.wait_go()?;
    wait_parent.close_read();

    signal::reset_all()?;
    cred::apply_rlimits(syscall, &env.rlimits)?;
    unistd::setsid().map_err(|e| Error::from(e).wrap("setsid()"))?;
    umask(Mode::empty());

    if env.new_mount_ns {
        // Downstream mounts must not leak back to the host.
        MountSnapshot::new()?.remount_slave(syscall)?;
    }

    if env.isolate {
        // Remount /proc so the new pid namespace is what shows through.
        Mount::new("proc", "/proc", "proc", vec![]).mount_dir(syscall, nix::mount::MsFlags::empty())?;

        // A loop-backed root may not have its mount point yet.
        if env.loop_image.as_deref().map(Path::exists).unwrap_or(false) {
            std::fs::create_dir_all(&env.root)
                .map_err(|e| Error::from(e).wrap(format!("mkdir {}", env.root.display())))?;
        }
    }

    if !env.net.share {
        network::enable_net(env)?;
    }

    if env.parent_ns.valid() {
        env.parent_ns.chroot(syscall)?;
        syscall.chdir(&env.cwd)?;
    } else {
        rootfs::isolate_fs(env, syscall)?;
        syscall.chdir(&env.cwd)?;
        set_hostname(env, syscall)?;
    }

    cred::apply_capabilities(syscall, &env.cred, env.caps)?;
    cred::drop_privileges(syscall, &env.cred, &env.user)?;

    exec(env)
}

/// Record the hostname inside the container root and apply it to the UTS
/// namespace. A container sharing the host root must not touch either.
fn set_hostname(env: &TaskEnv, syscall: &dyn Syscall) -> Result<()> {
    if env.hostname.is_empty() || env.root == Path::new("/") {
        return Ok(());
    }

    // We are already inside the new root here.
    let etc_hostname = Path::new("/etc/hostname");
    if etc_hostname.exists() {
        utils::write_file(etc_hostname, &format!("{}\n", env.hostname))
            .map_err(|e| e.wrap("write(/etc/hostname)"))?;
    }

    syscall.set_hostname(&env.hostname)
}

const BAD_CHARS: &[char] = &['|', '&', ';', '<', '>', '(', ')', '{', '}', '\n'];

/// Shell-style word expansion restricted to what a container command may
/// use: variable expansion and quoting, but no command substitution, no
/// redirections, and no references to undefined variables. Anything the
/// splitter rejects beyond these cases maps to `Unknown`.
pub fn expand_command(command: &str) -> Result<Vec<String>> {
    if command.contains('`') || command.contains("$(") {
        return Err(Error::os(
            ErrorKind::Unknown,
            libc::EINVAL,
            "command substitution is not supported",
        ));
    }
    if let Some(bad) = command.chars().find(|c| BAD_CHARS.contains(c)) {
        return Err(Error::os(
            ErrorKind::Unknown,
            libc::EINVAL,
            format!("illegal occurrence of {:?} in command", bad),
        ));
    }

    let expanded = shellexpand::env(command).map_err(|e| {
        Error::os(
            ErrorKind::Unknown,
            libc::EINVAL,
            format!("undefined shell variable {} was referenced", e.var_name),
        )
    })?;
    let words = shell_words::split(&expanded).map_err(|_| {
        Error::os(ErrorKind::Unknown, libc::EINVAL, "syntax error in command")
    })?;

    if words.is_empty() {
        return Err(Error::new(ErrorKind::InvalidValue, "empty command"));
    }
    Ok(words)
}

/// Replace the environment with the configured one and exec the command.
/// Returns only on failure.
fn exec(env: &TaskEnv) -> Result<()> {
    let inherited: Vec<_> = std::env::vars_os().map(|(k, _)| k).collect();
    for key in inherited {
        std::env::remove_var(key);
    }
    for entry in &env.environ {
        if let Some((key, value)) = entry.split_once('=') {
            std::env::set_var(key, value);
        }
    }

    let argv = expand_command(&env.command)?;
    if config().log.verbose {
        log::debug!("command={}", env.command);
        for (i, arg) in argv.iter().enumerate() {
            log::debug!("argv[{}]={}", i, arg);
        }
    }

    let to_cstrings = |items: &[String]| -> Result<Vec<CString>> {
        items
            .iter()
            .map(|s| {
                CString::new(s.as_str()).map_err(|_| {
                    Error::new(ErrorKind::InvalidValue, format!("NUL byte in {:?}", s))
                })
            })
            .collect()
    };
    let cargv = to_cstrings(&argv)?;
    let cenvp = to_cstrings(&env.environ)?;

    let errno = unistd::execvpe(&cargv[0], &cargv, &cenvp).unwrap_err();
    Err(Error::os(
        ErrorKind::InvalidValue,
        errno as i32,
        format!(
            "execvpe({}, {}, {})",
            argv[0],
            argv.len(),
            env.environ.len()
        ),
    ))
}
