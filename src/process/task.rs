//! The task launcher: fork → clone → synchronize → exec.
//!
//! The daemon must not end up as the direct parent of container init, so
//! start forks a short-lived intermediate process which clones the actual
//! init with the requested namespace flags and exits. Two sync pipes order
//! the work: the outer pipe carries init's pid and at most one serialized
//! error back to the daemon, the inner pipe holds init until the
//! intermediate has populated its network namespace from the outside.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use nix::errno::Errno;
use nix::sched;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};

use crate::cgroups::{task_cgroups, Cgroup, ControllerKind};
use crate::config::config;
use crate::error::{Error, ErrorKind, Result};
use crate::logger;
use crate::network;
use crate::process::env::TaskEnv;
use crate::process::init;
use crate::process::pipe::SyncPipe;
use crate::stdio;
use crate::syscall::linux::LinuxSyscall;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Initial,
    Started,
    Stopped,
}

#[derive(Debug)]
pub struct Task {
    env: Arc<TaskEnv>,
    pid: i32,
    exit_status: i32,
    state: TaskState,
    leaf_cgroups: HashMap<ControllerKind, Cgroup>,
}

impl Task {
    pub fn new(env: Arc<TaskEnv>, leaf_cgroups: HashMap<ControllerKind, Cgroup>) -> Task {
        Task {
            env,
            pid: 0,
            exit_status: 0,
            state: TaskState::Initial,
            leaf_cgroups,
        }
    }

    pub fn env(&self) -> &TaskEnv {
        &self.env
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn exit_status(&self) -> i32 {
        self.exit_status
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == TaskState::Started
    }

    fn create_cwd(&self) -> Result<()> {
        if !self.env.cwd.exists() {
            fs::create_dir_all(&self.env.cwd)
                .map_err(|e| Error::from(e).wrap(format!("mkdir {}", self.env.cwd.display())))?;
            fs::set_permissions(&self.env.cwd, fs::Permissions::from_mode(0o755))
                .map_err(Error::from)?;
            unistd::chown(
                &self.env.cwd,
                Some(self.env.cred.uid),
                Some(self.env.cred.gid),
            )
            .map_err(|e| Error::from(e).wrap(format!("chown {}", self.env.cwd.display())))?;
        }
        Ok(())
    }

    /// Remove an auto-created working directory, but only if it actually
    /// lives under the tmp prefix the daemon owns. Deletion goes through
    /// the confined helper; containers can stuff arbitrary trees in here.
    pub fn cleanup_cwd(&self) {
        if self.env.create_cwd
            && self.env.cwd.starts_with(&config().container.tmp_dir)
            && self.env.cwd.exists()
        {
            if let Err(e) = crate::helpers::remove_recursive(&self.env.cwd) {
                log::error!("cannot remove cwd {}: {}", self.env.cwd.display(), e);
            }
        }
    }

    /// Launch the container init process. On success the task owns a
    /// running pid; on failure no stray child and no leaked fd remain.
    pub fn start(&mut self) -> Result<()> {
        self.pid = 0;
        self.exit_status = 0;

        if self.env.create_cwd {
            self.create_cwd().map_err(|e| {
                if e.kind() != ErrorKind::NoSpace {
                    log::error!("cannot create temporary cwd: {}", e);
                }
                e
            })?;
        }

        let mut outer = SyncPipe::new().map_err(|e| {
            log::error!("cannot create communication pipe for child: {}", e);
            e
        })?;

        let fork_pid = match unsafe { unistd::fork() } {
            Ok(ForkResult::Parent { child }) => child,
            Ok(ForkResult::Child) => self.run_intermediate(&mut outer),
            Err(e) => {
                return Err(Error::from(e).wrap("fork()"));
            }
        };

        outer.close_write();

        // The intermediate exits as soon as init is unblocked. The reaper
        // thread may get to it first, which is fine: the pipe, not the
        // exit code, carries the verdict.
        let status = match waitpid(fork_pid, None) {
            Ok(WaitStatus::Exited(_, code)) => code,
            Ok(_) => 0,
            Err(Errno::ECHILD) => 0,
            Err(e) => {
                let _ = kill(fork_pid, Signal::SIGKILL);
                return Err(Error::from(e).wrap("waitpid(intermediate)"));
            }
        };

        let pid = match outer.recv_pid()? {
            Some(pid) => pid,
            None => {
                return Err(Error::os(
                    ErrorKind::InvalidValue,
                    Errno::last() as i32,
                    "Container couldn't start due to resource limits",
                ))
            }
        };

        let reported = outer.recv_error()?;
        outer.close_read();

        if reported.is_some() || status != 0 {
            if pid > 0 {
                let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
                log::info!("killed partly constructed container {}", pid);
            }
            self.pid = 0;
            self.exit_status = -1;
            return Err(reported.unwrap_or_else(|| {
                Error::new(
                    ErrorKind::InvalidValue,
                    format!(
                        "Container couldn't start due to resource limits \
                         (child terminated with {})",
                        status
                    ),
                )
            }));
        }

        self.pid = pid;
        self.state = TaskState::Started;
        Ok(())
    }

    /// The intermediate process: cgroup attachment, stdio, namespace entry,
    /// clone of init, parent-side network setup, handshake. Never returns.
    fn run_intermediate(&self, outer: &mut SyncPipe) -> ! {
        let _ = prctl::set_name("warden:[1:INTER]");
        let _ = unistd::setsid();
        outer.close_read();

        fn report_and_abort(outer: &SyncPipe, error: Error, report_pid: bool) -> ! {
            log::error!("cannot spawn container init: {}", error);
            if report_pid {
                let _ = outer.send_pid(-1);
            }
            let _ = outer.send_error(&error);
            std::process::exit(1);
        }

        // Attach ourselves first so every descendant starts life in the
        // right cgroups.
        for cgroup in self.leaf_cgroups.values() {
            if let Err(e) = cgroup.attach(unistd::getpid().as_raw()) {
                report_and_abort(outer, e.wrap("cannot attach to cgroup"), true);
            }
        }

        if self.env.client_ns.valid() {
            let syscall = LinuxSyscall;
            if let Err(e) = self.env.client_ns.attach(&syscall) {
                report_and_abort(outer, e.wrap("cannot move task to client namespace"), true);
            }
            if let Err(e) = self.env.client_ns.chroot(&syscall) {
                report_and_abort(outer, e.wrap("cannot move task to client chroot"), true);
            }
        }

        let mut keep = vec![outer.wfd()];
        keep.extend(logger::log_fd());
        // The target namespace handles are entered only after the stdio
        // sweep; they must survive it.
        keep.extend(self.env.parent_ns.raw_fds());
        if let Err(e) = stdio::reopen(&self.env, &keep) {
            report_and_abort(outer, e, true);
        }

        if self.env.parent_ns.valid() {
            if let Err(e) = self.env.parent_ns.attach(&LinuxSyscall) {
                report_and_abort(outer, e.wrap("cannot move task to target namespace"), true);
            }
        }

        let mut wait_parent = match SyncPipe::new() {
            Ok(pipe) => pipe,
            Err(e) => report_and_abort(outer, e.wrap("cannot create sync pipe for child"), true),
        };

        let clone_flags = self.env.clone_flags();
        let outer_wfd = outer.wfd();
        let env = Arc::clone(&self.env);

        const STACK_SIZE: usize = 1024 * 1024;
        let mut stack: Vec<u8> = vec![0; STACK_SIZE];

        let clone_result = {
            let wait_parent = &mut wait_parent;
            let cb = Box::new(move || -> isize {
                let _ = prctl::set_name("warden:[2:INIT]");
                let error = match init::child_callback(&env, wait_parent, &LinuxSyscall) {
                    Ok(()) => unreachable!("child callback returned after exec"),
                    Err(e) => e,
                };
                let _ = error.serialize(outer_wfd);
                std::process::exit(1)
            });
            sched::clone(
                cb,
                &mut stack[..],
                clone_flags,
                Some(Signal::SIGCHLD as libc::c_int),
            )
        };

        wait_parent.close_read();

        let child_pid = match clone_result {
            Ok(pid) => pid,
            Err(e) => {
                let _ = outer.send_pid(-1);
                let kind = if e == Errno::ENOMEM {
                    ErrorKind::ResourceNotAvailable
                } else {
                    ErrorKind::Unknown
                };
                report_and_abort(outer, Error::os(kind, e as i32, "clone()"), false);
            }
        };
        if let Err(e) = outer.send_pid(child_pid.as_raw()) {
            report_and_abort(outer, e, false);
        }

        // Populate init's network namespace from out here, before init is
        // allowed to run EnableNet inside it.
        if config().network.enabled {
            if let Err(e) = network::isolate_net(&self.env, child_pid.as_raw()) {
                report_and_abort(outer, e.wrap("cannot isolate child network"), false);
            }
        }

        if let Err(e) = wait_parent.send_go() {
            report_and_abort(outer, e, false);
        }

        std::process::exit(0);
    }

    pub fn kill(&self, signal: Signal) -> Result<()> {
        if self.pid == 0 {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                "tried to kill an invalid process",
            ));
        }
        log::info!("kill {} {}", signal, self.pid);
        kill(Pid::from_raw(self.pid), signal)
            .map_err(|e| Error::from(e).wrap(format!("kill({})", self.pid)))
    }

    /// The exit status arrived; the leaf cgroup set is released so the
    /// directories can be removed.
    pub fn deliver_exit_status(&mut self, status: i32) {
        self.leaf_cgroups.clear();
        self.exit_status = status;
        self.state = TaskState::Stopped;
    }

    /// Adopt an already-running pid after a daemon restart.
    pub fn restore(&mut self, pid: i32) {
        self.exit_status = 0;
        self.pid = pid;
        self.state = TaskState::Started;
    }

    pub fn is_zombie(&self) -> bool {
        procfs::process::Process::new(self.pid)
            .and_then(|p| p.status())
            .map(|s| s.state.starts_with('Z'))
            .unwrap_or(false)
    }

    fn ppid(&self) -> Result<i32> {
        Ok(procfs::process::Process::new(self.pid)?.status()?.ppid)
    }

    /// A restored pid must still be parented the way our spawn pipeline
    /// leaves it; anything else means the pid was recycled.
    pub fn has_correct_parent(&self) -> bool {
        match self.ppid() {
            Ok(ppid) => {
                if ppid != unistd::getppid().as_raw() {
                    log::info!(
                        "invalid ppid of restored task: {} != {}",
                        ppid,
                        unistd::getppid()
                    );
                    return false;
                }
                true
            }
            Err(e) => {
                log::info!("cannot get ppid of restored task: {}", e);
                false
            }
        }
    }

    /// A restored pid must still sit in the expected freezer cgroup; pids
    /// wrap, and stale bookkeeping must not capture a foreign process.
    pub fn has_correct_freezer(&mut self) -> bool {
        let cgmap = match task_cgroups(self.pid) {
            Ok(map) => map,
            Err(e) => {
                log::info!("cannot read cgroups of restored task {}: {}", self.pid, e);
                return false;
            }
        };

        if let Some(expected) = self.leaf_cgroups.get(&ControllerKind::Freezer) {
            let actual = cgmap.get("freezer").map(String::as_str).unwrap_or("");
            if expected.relpath() != actual {
                // A zombie has no cgroup data left to compare against.
                if self.is_zombie() {
                    return true;
                }
                log::warn!(
                    "unexpected freezer cgroup of restored task {}: {} != {}",
                    self.pid,
                    expected.relpath(),
                    actual
                );
                self.pid = 0;
                self.state = TaskState::Stopped;
                return false;
            }
        }
        true
    }

    pub fn rotate_logs(&self) -> Result<()> {
        stdio::rotate(&self.env, config().container.max_log_size)
    }

    pub fn remove_stdio(&self) {
        stdio::remove_stdio(&self.env);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stopped_task() -> Task {
        Task::new(Arc::new(TaskEnv::default()), HashMap::new())
    }

    #[test]
    fn test_new_task_is_initial() {
        let task = stopped_task();
        assert_eq!(task.state(), TaskState::Initial);
        assert_eq!(task.pid(), 0);
        assert_eq!(task.exit_status(), 0);
        assert!(!task.is_running());
    }

    #[test]
    fn test_kill_requires_a_pid() {
        let task = stopped_task();
        assert_eq!(
            task.kill(Signal::SIGTERM).unwrap_err().kind(),
            ErrorKind::InvalidValue
        );
    }

    #[test]
    fn test_exit_delivery_releases_cgroups() {
        let tmp = tempfile::tempdir().unwrap();
        let mut leaves = HashMap::new();
        leaves.insert(
            ControllerKind::Freezer,
            Cgroup::new(ControllerKind::Freezer, tmp.path(), "warden/box"),
        );
        let mut task = Task::new(Arc::new(TaskEnv::default()), leaves);
        task.restore(4242);
        assert!(task.is_running());

        task.deliver_exit_status(137);
        assert_eq!(task.state(), TaskState::Stopped);
        assert_eq!(task.exit_status(), 137);
        assert!(task.leaf_cgroups.is_empty());
    }

    #[test]
    fn test_restore_validation_rejects_foreign_pid() {
        let tmp = tempfile::tempdir().unwrap();
        let mut leaves = HashMap::new();
        leaves.insert(
            ControllerKind::Freezer,
            Cgroup::new(ControllerKind::Freezer, tmp.path(), "warden/box"),
        );
        let mut task = Task::new(Arc::new(TaskEnv::default()), leaves);

        // Our own pid is alive but certainly not in the expected freezer
        // cgroup, so validation must clear the task.
        task.restore(unistd::getpid().as_raw());
        assert!(!task.has_correct_freezer());
        assert_eq!(task.pid(), 0);
        assert_eq!(task.state(), TaskState::Stopped);
    }

    #[test]
    fn test_restore_without_freezer_leaf_passes() {
        let mut task = stopped_task();
        task.restore(unistd::getpid().as_raw());
        assert!(task.has_correct_freezer());
        assert!(task.is_running());
    }
}
