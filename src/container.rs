//! Container: a named, supervised, isolated process group with a property
//! bag and a strict state machine.
//!
//! `Stopped → Running → Paused → Running → Stopped`, plus the terminal
//! `Destroying`. All transitions serialize on the per-container mutex; the
//! reaper thread delivers exit statuses through the same lock.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};

use crate::cgroups::{Cgroup, ControllerKind, Registry};
use crate::config::config;
use crate::error::{Error, ErrorKind, Result};
use crate::process::{Task, TaskEnv};

const STOP_TIMEOUT: Duration = Duration::from_secs(5);
const STOP_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Stopped,
    Running,
    Paused,
    Destroying,
}

impl ContainerState {
    pub fn can_start(&self) -> bool {
        matches!(self, ContainerState::Stopped)
    }

    pub fn can_stop(&self) -> bool {
        matches!(self, ContainerState::Running | ContainerState::Paused)
    }

    pub fn can_pause(&self) -> bool {
        matches!(self, ContainerState::Running)
    }

    pub fn can_resume(&self) -> bool {
        matches!(self, ContainerState::Paused)
    }

    pub fn can_set_property(&self) -> bool {
        matches!(self, ContainerState::Stopped)
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContainerState::Stopped => "stopped",
            ContainerState::Running => "running",
            ContainerState::Paused => "paused",
            ContainerState::Destroying => "destroying",
        };
        f.write_str(name)
    }
}

/// On-disk form of a container, one JSON file per container under the
/// daemon's state directory.
#[derive(Debug, Serialize, Deserialize)]
struct SavedState {
    name: String,
    state: ContainerState,
    pid: i32,
    properties: HashMap<String, String>,
}

#[derive(Debug)]
struct ContainerInner {
    state: ContainerState,
    task: Option<Task>,
    properties: HashMap<String, String>,
    leaf_cgroups: HashMap<ControllerKind, Cgroup>,
}

#[derive(Debug)]
pub struct Container {
    name: String,
    state_file: Option<PathBuf>,
    inner: Mutex<ContainerInner>,
}

impl Container {
    pub fn new(name: &str) -> Container {
        Self::with_state_file(name, None)
    }

    pub fn with_state_file(name: &str, state_file: Option<PathBuf>) -> Container {
        Container {
            name: name.to_owned(),
            state_file,
            inner: Mutex::new(ContainerInner {
                state: ContainerState::Stopped,
                task: None,
                properties: HashMap::new(),
                leaf_cgroups: HashMap::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ContainerState {
        self.lock().state
    }

    pub fn pid(&self) -> i32 {
        self.lock().task.as_ref().map(Task::pid).unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ContainerInner> {
        self.inner.lock().expect("container mutex poisoned")
    }

    fn wrong_state(&self, state: ContainerState, op: &str) -> Error {
        Error::new(
            ErrorKind::InvalidValue,
            format!("{} cannot be {} because it is {}", self.name, op, state),
        )
    }

    /// Persist the current state. Best effort: a failed save must never
    /// break a running transition, it only degrades restart recovery.
    fn save_locked(&self, inner: &ContainerInner) {
        let Some(path) = &self.state_file else {
            return;
        };
        let saved = SavedState {
            name: self.name.clone(),
            state: inner.state,
            pid: inner.task.as_ref().map(Task::pid).unwrap_or(0),
            properties: inner.properties.clone(),
        };
        let written = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|e| e.to_string())
            .and_then(|file| serde_json::to_writer(file, &saved).map_err(|e| e.to_string()));
        if let Err(e) = written {
            log::error!("cannot save state of {}: {}", self.name, e);
        }
    }

    fn remove_state_file(&self) {
        if let Some(path) = &self.state_file {
            let _ = fs::remove_file(path);
        }
    }

    /// Write the current state to disk immediately.
    pub fn save(&self) {
        let inner = self.lock();
        self.save_locked(&inner);
    }

    /// Load a container from its state file. A container that was running
    /// when the previous daemon died is reattached to its pid, but only
    /// after the pid passes the parent and freezer validation.
    pub fn load(path: &Path) -> Result<Container> {
        let file = fs::File::open(path)
            .map_err(|e| Error::from(e).wrap(format!("open {}", path.display())))?;
        let saved: SavedState = serde_json::from_reader(file).map_err(|e| {
            Error::new(
                ErrorKind::InvalidValue,
                format!("malformed state file {}: {}", path.display(), e),
            )
        })?;
        if saved.name.is_empty() {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                format!("state file {} has no container name", path.display()),
            ));
        }

        let container = Container::with_state_file(&saved.name, Some(path.to_path_buf()));
        {
            let mut inner = container.lock();
            inner.properties = saved.properties;
        }

        match saved.state {
            ContainerState::Running | ContainerState::Paused if saved.pid > 0 => {
                container.restore_task(saved.pid, saved.state);
            }
            // An interrupted destroy or a stopped container comes back as
            // plain stopped; the entry stays manageable either way.
            _ => {}
        }
        Ok(container)
    }

    /// The leaf cgroups a previous daemon left behind for this container,
    /// without creating anything.
    fn existing_leaf_cgroups(&self) -> HashMap<ControllerKind, Cgroup> {
        let registry = Registry::get();
        let mut leaves = HashMap::new();
        for kind in [
            ControllerKind::Memory,
            ControllerKind::Freezer,
            ControllerKind::Cpu,
            ControllerKind::CpuAcct,
            ControllerKind::NetCls,
        ] {
            if let Ok(cgroup) = registry.cgroup(kind, &format!("warden/{}", self.name)) {
                if cgroup.exists() {
                    leaves.insert(kind, cgroup);
                }
            }
        }
        leaves
    }

    /// Adopt a pid recorded by a previous daemon. The pid is only trusted
    /// when it is still parented the way our spawn pipeline leaves it and
    /// still sits in the expected freezer cgroup; pids wrap, and capturing
    /// a foreign process would let us signal it later.
    fn restore_task(&self, pid: i32, state: ContainerState) {
        let mut inner = self.lock();
        let env = match TaskEnv::from_properties(&self.name, &inner.properties) {
            Ok(env) => Arc::new(env),
            Err(e) => {
                log::warn!("cannot rebuild environment of {}: {}", self.name, e);
                self.save_locked(&inner);
                return;
            }
        };

        let leaves = self.existing_leaf_cgroups();
        let mut task = Task::new(env, leaves.clone());
        task.restore(pid);

        let valid = task.has_correct_parent() && task.has_correct_freezer();
        if valid || task.is_zombie() {
            log::info!("restored {} with pid {}", self.name, pid);
            inner.leaf_cgroups = leaves;
            inner.task = Some(task);
            inner.state = state;
        } else {
            log::warn!(
                "cannot restore {}: pid {} failed validation",
                self.name,
                pid
            );
            inner.state = ContainerState::Stopped;
        }
        self.save_locked(&inner);
    }

    /// Create the per-container leaf cgroups and apply the configured
    /// limits before anything is attached to them.
    fn prepare_leaf_cgroups(
        &self,
        env: &TaskEnv,
    ) -> Result<HashMap<ControllerKind, Cgroup>> {
        let registry = Registry::get();
        let mut kinds = vec![
            ControllerKind::Memory,
            ControllerKind::Freezer,
            ControllerKind::Cpu,
            ControllerKind::CpuAcct,
        ];
        if config().network.enabled {
            kinds.push(ControllerKind::NetCls);
        }

        let mut leaves = HashMap::new();
        for kind in kinds {
            if !registry.supported(kind) {
                continue;
            }
            let cgroup = registry.cgroup(kind, &format!("warden/{}", self.name))?;
            cgroup.create()?;
            match kind {
                ControllerKind::Memory => {
                    if let Some(limit) = env.memory_limit {
                        cgroup.set_memory_limit(limit)?;
                    }
                }
                ControllerKind::NetCls => {
                    if let Some(classid) = env.net_classid {
                        cgroup.set_classid(classid)?;
                    }
                }
                _ => {}
            }
            leaves.insert(kind, cgroup);
        }
        Ok(leaves)
    }

    fn remove_leaf_cgroups(leaves: &mut HashMap<ControllerKind, Cgroup>) {
        for cgroup in leaves.values() {
            if let Err(e) = cgroup.remove() {
                log::error!("cannot remove cgroup {}: {}", cgroup.path().display(), e);
            }
        }
        leaves.clear();
    }

    pub fn start(&self) -> Result<()> {
        let mut inner = self.lock();
        if !inner.state.can_start() {
            return Err(self.wrong_state(inner.state, "started"));
        }

        let env = Arc::new(TaskEnv::from_properties(&self.name, &inner.properties)?);
        let leaves = self.prepare_leaf_cgroups(&env)?;
        let mut task = Task::new(env, leaves.clone());

        if let Err(e) = task.start() {
            task.cleanup_cwd();
            let mut leaves = leaves;
            Self::remove_leaf_cgroups(&mut leaves);
            return Err(e);
        }

        log::info!("started {} with pid {}", self.name, task.pid());
        inner.leaf_cgroups = leaves;
        inner.task = Some(task);
        inner.state = ContainerState::Running;
        self.save_locked(&inner);
        Ok(())
    }

    /// SIGTERM, a bounded wait, then SIGKILL. Absence of the process is
    /// success; stop on a stopped container is a no-op.
    pub fn stop(&self) -> Result<()> {
        {
            let mut inner = self.lock();
            match inner.state {
                ContainerState::Stopped => return Ok(()),
                ContainerState::Destroying => {
                    return Err(self.wrong_state(inner.state, "stopped"))
                }
                ContainerState::Running | ContainerState::Paused => {}
            }

            // Frozen tasks cannot handle signals.
            if inner.state == ContainerState::Paused {
                if let Some(freezer) = inner.leaf_cgroups.get(&ControllerKind::Freezer) {
                    freezer.thaw()?;
                }
                inner.state = ContainerState::Running;
            }

            if let Some(task) = &inner.task {
                if task.is_running() {
                    let _ = task.kill(Signal::SIGTERM);
                }
            }
        }

        if !self.wait_stopped(STOP_TIMEOUT) {
            {
                let inner = self.lock();
                if let Some(task) = &inner.task {
                    if task.is_running() {
                        let _ = task.kill(Signal::SIGKILL);
                    }
                }
            }
            self.wait_stopped(STOP_TIMEOUT);
        }

        let mut inner = self.lock();
        if inner.state != ContainerState::Stopped {
            // The exit never got delivered; force the bookkeeping.
            if let Some(task) = inner.task.as_mut() {
                task.deliver_exit_status(128 + Signal::SIGKILL as i32);
            }
            Self::finalize_stop(&mut inner);
            self.save_locked(&inner);
        }
        Ok(())
    }

    /// Poll for the reaper thread to deliver the exit. The container lock
    /// is released between probes, otherwise the delivery could never
    /// happen.
    fn wait_stopped(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.lock().state == ContainerState::Stopped {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(STOP_POLL);
        }
    }

    fn finalize_stop(inner: &mut ContainerInner) {
        Self::remove_leaf_cgroups(&mut inner.leaf_cgroups);
        inner.state = ContainerState::Stopped;
    }

    pub fn pause(&self) -> Result<()> {
        let mut inner = self.lock();
        if !inner.state.can_pause() {
            return Err(self.wrong_state(inner.state, "paused"));
        }
        let alive = inner.task.as_ref().map(Task::is_running).unwrap_or(false);
        if !alive {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                format!("{} has no live task to pause", self.name),
            ));
        }

        let freezer = inner
            .leaf_cgroups
            .get(&ControllerKind::Freezer)
            .ok_or_else(|| {
                Error::new(ErrorKind::NotFound, "freezer cgroup is not available")
            })?;
        freezer.freeze()?;
        inner.state = ContainerState::Paused;
        self.save_locked(&inner);
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        let mut inner = self.lock();
        if !inner.state.can_resume() {
            return Err(self.wrong_state(inner.state, "resumed"));
        }

        let freezer = inner
            .leaf_cgroups
            .get(&ControllerKind::Freezer)
            .ok_or_else(|| {
                Error::new(ErrorKind::NotFound, "freezer cgroup is not available")
            })?;
        freezer.thaw()?;
        inner.state = ContainerState::Running;
        self.save_locked(&inner);
        Ok(())
    }

    /// Deliver an arbitrary signal to the container init process.
    pub fn kill(&self, signal: Signal) -> Result<()> {
        let inner = self.lock();
        if !inner.state.can_stop() {
            return Err(self.wrong_state(inner.state, "signalled"));
        }
        match &inner.task {
            Some(task) => task.kill(signal),
            None => Err(Error::new(
                ErrorKind::InvalidValue,
                format!("{} has no live task", self.name),
            )),
        }
    }

    pub fn get_property(&self, property: &str) -> Result<String> {
        Ok(self
            .lock()
            .properties
            .get(property)
            .cloned()
            .unwrap_or_default())
    }

    pub fn set_property(&self, property: &str, value: &str) -> Result<()> {
        let mut inner = self.lock();
        if !inner.state.can_set_property() {
            return Err(self.wrong_state(inner.state, "modified"));
        }
        inner
            .properties
            .insert(property.to_owned(), value.to_owned());
        self.save_locked(&inner);
        Ok(())
    }

    /// Derived data, read through from the task, cgroups and /proc.
    pub fn get_data(&self, key: &str) -> Result<String> {
        let inner = self.lock();
        match key {
            "state" => Ok(inner.state.to_string()),
            "pid" | "root_pid" => Ok(inner
                .task
                .as_ref()
                .map(Task::pid)
                .unwrap_or(0)
                .to_string()),
            "exit_status" => Ok(inner
                .task
                .as_ref()
                .map(Task::exit_status)
                .unwrap_or(0)
                .to_string()),
            "memory_usage" => inner
                .leaf_cgroups
                .get(&ControllerKind::Memory)
                .ok_or_else(|| Error::new(ErrorKind::NotFound, "memory cgroup is not available"))
                .and_then(|cg| cg.memory_usage())
                .map(|v| v.to_string()),
            "cpu_usage" => inner
                .leaf_cgroups
                .get(&ControllerKind::CpuAcct)
                .ok_or_else(|| Error::new(ErrorKind::NotFound, "cpuacct cgroup is not available"))
                .and_then(|cg| cg.cpu_usage())
                .map(|v| v.to_string()),
            _ => Err(Error::new(
                ErrorKind::InvalidValue,
                format!("unknown data {}", key),
            )),
        }
    }

    /// Called by the reaper thread. Returns whether the pid belonged to
    /// this container.
    pub fn deliver_exit(&self, pid: i32, status: i32) -> bool {
        let mut inner = self.lock();
        let matched = inner
            .task
            .as_ref()
            .map(|t| t.is_running() && t.pid() == pid)
            .unwrap_or(false);
        if !matched {
            return false;
        }

        if let Some(task) = inner.task.as_mut() {
            task.deliver_exit_status(status);
        }
        Self::finalize_stop(&mut inner);
        self.save_locked(&inner);
        log::info!("{} exited with status {}", self.name, status);
        true
    }

    /// Transition into the terminal state, releasing what the container
    /// still owns. The holder removes the entry afterwards.
    pub fn destroy(&self) -> Result<()> {
        self.stop()?;
        let mut inner = self.lock();
        if let Some(task) = inner.task.take() {
            task.remove_stdio();
            task.cleanup_cwd();
        }
        inner.state = ContainerState::Destroying;
        self.remove_state_file();
        Ok(())
    }

    pub fn rotate_logs(&self) {
        let inner = self.lock();
        if let Some(task) = &inner.task {
            if let Err(e) = task.rotate_logs() {
                log::warn!("cannot rotate logs of {}: {}", self.name, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_gating() {
        assert!(ContainerState::Stopped.can_start());
        assert!(!ContainerState::Running.can_start());
        assert!(!ContainerState::Destroying.can_start());

        assert!(ContainerState::Running.can_stop());
        assert!(ContainerState::Paused.can_stop());
        assert!(!ContainerState::Stopped.can_stop());

        assert!(ContainerState::Running.can_pause());
        assert!(!ContainerState::Paused.can_pause());
        assert!(ContainerState::Paused.can_resume());
        assert!(!ContainerState::Running.can_resume());

        assert!(ContainerState::Stopped.can_set_property());
        assert!(!ContainerState::Running.can_set_property());
        assert!(!ContainerState::Paused.can_set_property());
    }

    #[test]
    fn test_new_container_is_stopped() {
        let container = Container::new("box");
        assert_eq!(container.state(), ContainerState::Stopped);
        assert_eq!(container.pid(), 0);
        assert_eq!(container.get_data("state").unwrap(), "stopped");
        assert_eq!(container.get_data("pid").unwrap(), "0");
    }

    #[test]
    fn test_property_round_trip() {
        let container = Container::new("box");
        assert_eq!(container.get_property("command").unwrap(), "");
        container.set_property("command", "/bin/true").unwrap();
        assert_eq!(container.get_property("command").unwrap(), "/bin/true");
    }

    #[test]
    fn test_stop_on_stopped_is_noop() {
        let container = Container::new("box");
        container.stop().unwrap();
        container.stop().unwrap();
        assert_eq!(container.state(), ContainerState::Stopped);
    }

    #[test]
    fn test_pause_requires_running() {
        let container = Container::new("box");
        let err = container.pause().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidValue);
        let err = container.resume().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidValue);
    }

    #[test]
    fn test_unknown_data_is_invalid() {
        let container = Container::new("box");
        assert_eq!(
            container.get_data("frobnication").unwrap_err().kind(),
            ErrorKind::InvalidValue
        );
    }

    #[test]
    fn test_deliver_exit_ignores_foreign_pid() {
        let container = Container::new("box");
        assert!(!container.deliver_exit(12345, 0));
        assert_eq!(container.state(), ContainerState::Stopped);
    }

    #[test]
    fn test_destroy_is_terminal() {
        let container = Container::new("box");
        container.destroy().unwrap();
        assert_eq!(container.state(), ContainerState::Destroying);
        assert!(container.start().is_err());
        assert!(container.set_property("command", "x").is_err());
    }

    fn write_saved_state(path: &Path, state: ContainerState, pid: i32) {
        let mut properties = HashMap::new();
        properties.insert("command".to_owned(), "/bin/sleep 60".to_owned());
        let saved = SavedState {
            name: "box".to_owned(),
            state,
            pid,
            properties,
        };
        let file = fs::File::create(path).unwrap();
        serde_json::to_writer(file, &saved).unwrap();
    }

    #[test]
    fn test_state_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("box.json");

        let container = Container::with_state_file("box", Some(path.clone()));
        container.set_property("command", "/bin/true").unwrap();
        container.set_property("hostname", "box").unwrap();
        assert!(path.exists());

        let loaded = Container::load(&path).unwrap();
        assert_eq!(loaded.name(), "box");
        assert_eq!(loaded.state(), ContainerState::Stopped);
        assert_eq!(loaded.get_property("command").unwrap(), "/bin/true");
        assert_eq!(loaded.get_property("hostname").unwrap(), "box");
    }

    #[test]
    fn test_restore_reattaches_validated_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("box.json");
        // Our own pid passes the parent check (its ppid is this process's
        // ppid) and has no recorded freezer leaf to contradict.
        let pid = nix::unistd::getpid().as_raw();
        write_saved_state(&path, ContainerState::Running, pid);

        let loaded = Container::load(&path).unwrap();
        assert_eq!(loaded.state(), ContainerState::Running);
        assert_eq!(loaded.pid(), pid);
    }

    #[test]
    fn test_restore_rejects_recycled_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("box.json");
        // A pid that already exited and was reaped fails the parent check
        // and is not a zombie, so the container must come back stopped.
        let mut child = std::process::Command::new("/bin/true")
            .spawn()
            .expect("spawn /bin/true");
        let pid = child.id() as i32;
        child.wait().expect("wait for /bin/true");
        write_saved_state(&path, ContainerState::Running, pid);

        let loaded = Container::load(&path).unwrap();
        assert_eq!(loaded.state(), ContainerState::Stopped);
        assert_eq!(loaded.pid(), 0);
    }

    #[test]
    fn test_restore_without_pid_stays_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("box.json");
        write_saved_state(&path, ContainerState::Running, 0);

        let loaded = Container::load(&path).unwrap();
        assert_eq!(loaded.state(), ContainerState::Stopped);
    }
}
