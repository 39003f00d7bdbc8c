//! Name-indexed container registry with coarse locking.
//!
//! With a state directory configured, every container is mirrored to one
//! JSON file and the registry can be rebuilt from disk after a daemon
//! restart.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::container::Container;
use crate::error::{Error, ErrorKind, Result};

#[derive(Default)]
pub struct ContainerHolder {
    state_dir: Option<PathBuf>,
    containers: Mutex<HashMap<String, Arc<Container>>>,
}

impl ContainerHolder {
    pub fn new() -> ContainerHolder {
        ContainerHolder::default()
    }

    pub fn with_state_dir(state_dir: PathBuf) -> ContainerHolder {
        if let Err(e) = fs::create_dir_all(&state_dir) {
            log::warn!(
                "cannot create state directory {}: {}",
                state_dir.display(),
                e
            );
        }
        ContainerHolder {
            state_dir: Some(state_dir),
            containers: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Container>>> {
        self.containers.lock().expect("holder mutex poisoned")
    }

    fn state_file(&self, name: &str) -> Option<PathBuf> {
        self.state_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.json", name)))
    }

    pub fn create(&self, name: &str) -> Result<Arc<Container>> {
        if name.is_empty() || name.contains('/') {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                format!("invalid container name {:?}", name),
            ));
        }

        let mut containers = self.lock();
        if containers.contains_key(name) {
            return Err(Error::new(
                ErrorKind::Busy,
                format!("container {} already exists", name),
            ));
        }
        let container = Arc::new(Container::with_state_file(name, self.state_file(name)));
        // Write the empty record right away so a restart sees the name.
        container.save();
        containers.insert(name.to_owned(), Arc::clone(&container));
        Ok(container)
    }

    pub fn find(&self, name: &str) -> Result<Arc<Container>> {
        self.lock().get(name).cloned().ok_or_else(|| {
            Error::new(
                ErrorKind::NotFound,
                format!("container {} does not exist", name),
            )
        })
    }

    /// Stop the container, mark it terminal and drop it from the index.
    pub fn destroy(&self, name: &str) -> Result<()> {
        let container = self.find(name)?;
        container.destroy()?;
        self.lock().remove(name);
        Ok(())
    }

    pub fn list(&self) -> Vec<Arc<Container>> {
        let mut all: Vec<_> = self.lock().values().cloned().collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    /// Rebuild the registry from the state directory. Containers that were
    /// running are reattached to their pids when the pid survives
    /// validation; corrupt state files are logged and skipped.
    pub fn restore_all(&self) -> usize {
        let Some(dir) = &self.state_dir else {
            return 0;
        };
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("cannot list state directory {}: {}", dir.display(), e);
                return 0;
            }
        };

        let mut restored = 0;
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Container::load(&path) {
                Ok(container) => {
                    let name = container.name().to_owned();
                    self.lock().insert(name, Arc::new(container));
                    restored += 1;
                }
                Err(e) => {
                    log::warn!("skipping state file {}: {}", path.display(), e);
                }
            }
        }
        restored
    }

    /// Route an exit status from the reaper to whichever container owns the
    /// pid. Unknown pids (reaped intermediates, helpers) are not an error.
    pub fn deliver_exit(&self, pid: i32, status: i32) -> bool {
        let all: Vec<_> = self.lock().values().cloned().collect();
        for container in all {
            if container.deliver_exit(pid, status) {
                return true;
            }
        }
        false
    }

    pub fn rotate_all_logs(&self) {
        for container in self.list() {
            container.rotate_logs();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ContainerState;

    #[test]
    fn test_create_find_destroy() {
        let holder = ContainerHolder::new();
        holder.create("a").unwrap();
        holder.create("b").unwrap();

        assert_eq!(holder.find("a").unwrap().name(), "a");
        assert_eq!(
            holder.find("missing").unwrap_err().kind(),
            ErrorKind::NotFound
        );

        holder.destroy("a").unwrap();
        assert!(holder.find("a").is_err());
        assert!(holder.find("b").is_ok());
    }

    #[test]
    fn test_duplicate_create_is_rejected() {
        let holder = ContainerHolder::new();
        holder.create("a").unwrap();
        assert_eq!(holder.create("a").unwrap_err().kind(), ErrorKind::Busy);
    }

    #[test]
    fn test_invalid_names_are_rejected() {
        let holder = ContainerHolder::new();
        assert_eq!(holder.create("").unwrap_err().kind(), ErrorKind::InvalidValue);
        assert_eq!(
            holder.create("a/b").unwrap_err().kind(),
            ErrorKind::InvalidValue
        );
    }

    #[test]
    fn test_list_is_sorted() {
        let holder = ContainerHolder::new();
        holder.create("zeta").unwrap();
        holder.create("alpha").unwrap();
        let names: Vec<_> = holder.list().iter().map(|c| c.name().to_owned()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_exit_for_unknown_pid_is_ignored() {
        let holder = ContainerHolder::new();
        holder.create("a").unwrap();
        assert!(!holder.deliver_exit(99999, 0));
    }

    #[test]
    fn test_registry_survives_a_restart() {
        let dir = tempfile::tempdir().unwrap();

        {
            let holder = ContainerHolder::with_state_dir(dir.path().to_path_buf());
            let container = holder.create("web").unwrap();
            container.set_property("command", "/bin/true").unwrap();
        }

        let holder = ContainerHolder::with_state_dir(dir.path().to_path_buf());
        assert!(holder.find("web").is_err());
        assert_eq!(holder.restore_all(), 1);

        let container = holder.find("web").unwrap();
        assert_eq!(container.get_property("command").unwrap(), "/bin/true");
        assert_eq!(container.state(), ContainerState::Stopped);
    }

    #[test]
    fn test_destroy_removes_the_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let holder = ContainerHolder::with_state_dir(dir.path().to_path_buf());
        holder.create("web").unwrap();
        assert!(dir.path().join("web.json").exists());

        holder.destroy("web").unwrap();
        assert!(!dir.path().join("web.json").exists());

        let fresh = ContainerHolder::with_state_dir(dir.path().to_path_buf());
        assert_eq!(fresh.restore_all(), 0);
    }

    #[test]
    fn test_corrupt_state_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.json"), "not json").unwrap();
        let holder = ContainerHolder::with_state_dir(dir.path().to_path_buf());
        assert_eq!(holder.restore_all(), 0);
    }
}
