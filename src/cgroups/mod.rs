//! Cgroup v1 controller registry and leaf cgroup handling.
//!
//! Controllers are a closed set of tagged variants rather than a trait
//! hierarchy: the runtime only needs to locate mount points, create leaf
//! directories, attach pids and poke a handful of typed knobs.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use once_cell::sync::OnceCell;

use crate::error::{Error, ErrorKind, Result};
use crate::utils;

pub const CGROUP_PROCS: &str = "cgroup.procs";

const FREEZER_STATE: &str = "freezer.state";
const FREEZER_FROZEN: &str = "FROZEN";
const FREEZER_FREEZING: &str = "FREEZING";
const FREEZER_THAWED: &str = "THAWED";

const MEMORY_LIMIT: &str = "memory.limit_in_bytes";
const MEMORY_USAGE: &str = "memory.usage_in_bytes";
const CPUACCT_USAGE: &str = "cpuacct.usage";
const NET_CLS_CLASSID: &str = "net_cls.classid";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerKind {
    Memory,
    Freezer,
    Cpu,
    CpuAcct,
    NetCls,
    Devices,
    Blkio,
}

pub const CONTROLLERS: &[ControllerKind] = &[
    ControllerKind::Memory,
    ControllerKind::Freezer,
    ControllerKind::Cpu,
    ControllerKind::CpuAcct,
    ControllerKind::NetCls,
    ControllerKind::Devices,
    ControllerKind::Blkio,
];

impl ControllerKind {
    pub fn name(&self) -> &'static str {
        match self {
            ControllerKind::Memory => "memory",
            ControllerKind::Freezer => "freezer",
            ControllerKind::Cpu => "cpu",
            ControllerKind::CpuAcct => "cpuacct",
            ControllerKind::NetCls => "net_cls",
            ControllerKind::Devices => "devices",
            ControllerKind::Blkio => "blkio",
        }
    }

    /// Whether a cgroup mount point belongs to this controller. Distributions
    /// co-mount net_cls/net_prio and cpu/cpuacct in combined directories.
    fn matches_mount_point(&self, mount_point: &Path) -> bool {
        match self {
            ControllerKind::NetCls => {
                mount_point.ends_with("net_cls,net_prio")
                    || mount_point.ends_with("net_prio,net_cls")
                    || mount_point.ends_with("net_cls")
            }
            ControllerKind::Cpu => {
                mount_point.ends_with("cpu,cpuacct") || mount_point.ends_with("cpu")
            }
            ControllerKind::CpuAcct => {
                mount_point.ends_with("cpu,cpuacct") || mount_point.ends_with("cpuacct")
            }
            kind => mount_point.ends_with(kind.name()),
        }
    }
}

impl fmt::Display for ControllerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

static REGISTRY: OnceCell<Registry> = OnceCell::new();

/// The mounted cgroup v1 hierarchy, discovered once at daemon startup.
pub struct Registry {
    mounts: HashMap<ControllerKind, PathBuf>,
}

impl Registry {
    pub fn discover() -> Result<Registry> {
        let mounts = procfs::process::Process::myself()?.mountinfo()?;
        Ok(Self::from_mount_table(
            mounts
                .into_iter()
                .map(|m| (m.mount_point, m.fs_type))
                .collect(),
        ))
    }

    pub fn from_mount_table(mounts: Vec<(PathBuf, String)>) -> Registry {
        let mut found = HashMap::new();
        for kind in CONTROLLERS {
            let mount = mounts
                .iter()
                .find(|(mp, fstype)| fstype.as_str() == "cgroup" && kind.matches_mount_point(mp));
            match mount {
                Some((mp, _)) => {
                    found.insert(*kind, mp.clone());
                }
                None => log::warn!("cgroup controller {} not mounted on this system", kind),
            }
        }
        Registry { mounts: found }
    }

    pub fn get() -> &'static Registry {
        REGISTRY.get_or_init(|| {
            Registry::discover().unwrap_or_else(|e| {
                log::warn!("cannot read cgroup mounts: {}", e);
                Registry {
                    mounts: HashMap::new(),
                }
            })
        })
    }

    pub fn supported(&self, kind: ControllerKind) -> bool {
        self.mounts.contains_key(&kind)
    }

    pub fn mount_point(&self, kind: ControllerKind) -> Option<&Path> {
        self.mounts.get(&kind).map(PathBuf::as_path)
    }

    pub fn cgroup(&self, kind: ControllerKind, rel: &str) -> Result<Cgroup> {
        let mount = self.mounts.get(&kind).ok_or_else(|| {
            Error::new(
                ErrorKind::NotFound,
                format!("cgroup controller {} is not mounted", kind),
            )
        })?;
        Ok(Cgroup::new(kind, mount, rel))
    }
}

/// One leaf directory under a controller mount point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cgroup {
    kind: ControllerKind,
    rel: String,
    path: PathBuf,
}

impl Cgroup {
    pub fn new(kind: ControllerKind, mount_point: &Path, rel: &str) -> Cgroup {
        let rel = rel.trim_matches('/').to_owned();
        Cgroup {
            kind,
            path: mount_point.join(&rel),
            rel,
        }
    }

    pub fn kind(&self) -> ControllerKind {
        self.kind
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The path as it appears in `/proc/<pid>/cgroup`.
    pub fn relpath(&self) -> String {
        format!("/{}", self.rel)
    }

    pub fn exists(&self) -> bool {
        self.path.is_dir()
    }

    pub fn create(&self) -> Result<()> {
        fs::create_dir_all(&self.path)
            .map_err(|e| Error::from(e).wrap(format!("mkdir {}", self.path.display())))
    }

    pub fn attach(&self, pid: i32) -> Result<()> {
        self.create()?;
        self.write_knob(CGROUP_PROCS, &pid.to_string())
    }

    pub fn procs(&self) -> Result<Vec<i32>> {
        let procs = utils::read_to_string(self.path.join(CGROUP_PROCS))?;
        Ok(procs.lines().filter_map(|l| l.trim().parse().ok()).collect())
    }

    pub fn knob_path(&self, knob: &str) -> PathBuf {
        self.path.join(knob)
    }

    pub fn read_knob(&self, knob: &str) -> Result<String> {
        Ok(utils::read_to_string(self.knob_path(knob))?.trim().to_owned())
    }

    /// Controller files must already exist; creating them is the kernel's
    /// job, so `create` is off when opening.
    pub fn write_knob(&self, knob: &str, data: &str) -> Result<()> {
        let path = self.knob_path(knob);
        use std::io::Write;
        fs::OpenOptions::new()
            .create(false)
            .write(true)
            .truncate(false)
            .open(&path)
            .and_then(|mut f| f.write_all(data.as_bytes()))
            .map_err(|e| Error::from(e).wrap(format!("write {}", path.display())))
    }

    /// Remove the leaf directory. The kernel refuses while tasks remain, and
    /// exit notification races rmdir, so retry briefly.
    pub fn remove(&self) -> Result<()> {
        let mut delay = Duration::from_millis(10);
        for _ in 0..4 {
            match fs::remove_dir(&self.path) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(_) => {
                    thread::sleep(delay);
                    delay *= 2;
                }
            }
        }
        fs::remove_dir(&self.path)
            .map_err(|e| Error::from(e).wrap(format!("rmdir {}", self.path.display())))
    }

    pub fn freeze(&self) -> Result<()> {
        self.write_knob(FREEZER_STATE, FREEZER_FROZEN)?;
        for i in 0..100 {
            match self.read_knob(FREEZER_STATE)?.as_str() {
                FREEZER_FROZEN => return Ok(()),
                FREEZER_FREEZING => {
                    if i % 25 == 24 {
                        self.write_knob(FREEZER_STATE, FREEZER_FROZEN)?;
                    }
                    thread::sleep(Duration::from_millis(10));
                }
                other => {
                    return Err(Error::new(
                        ErrorKind::Unknown,
                        format!("unexpected freezer state {}", other),
                    ))
                }
            }
        }
        // Leaving a cgroup FREEZING is dangerous, thaw it back.
        let _ = self.write_knob(FREEZER_STATE, FREEZER_THAWED);
        Err(Error::new(ErrorKind::Busy, "unable to freeze"))
    }

    pub fn thaw(&self) -> Result<()> {
        self.write_knob(FREEZER_STATE, FREEZER_THAWED)
    }

    pub fn freezer_state(&self) -> Result<String> {
        self.read_knob(FREEZER_STATE)
    }

    pub fn set_memory_limit(&self, bytes: u64) -> Result<()> {
        self.write_knob(MEMORY_LIMIT, &bytes.to_string())
    }

    pub fn memory_usage(&self) -> Result<u64> {
        parse_u64(&self.read_knob(MEMORY_USAGE)?)
    }

    pub fn cpu_usage(&self) -> Result<u64> {
        parse_u64(&self.read_knob(CPUACCT_USAGE)?)
    }

    pub fn set_classid(&self, classid: u32) -> Result<()> {
        self.write_knob(NET_CLS_CLASSID, &classid.to_string())
    }
}

fn parse_u64(value: &str) -> Result<u64> {
    value.parse().map_err(|_| {
        Error::new(
            ErrorKind::Unknown,
            format!("malformed cgroup value {:?}", value),
        )
    })
}

/// controller name → cgroup path, from `/proc/<pid>/cgroup`.
pub fn task_cgroups(pid: i32) -> Result<HashMap<String, String>> {
    let mut map = HashMap::new();
    for cgroup in procfs::process::Process::new(pid)?.cgroups()? {
        for controller in cgroup.controllers {
            map.insert(controller, cgroup.pathname.clone());
        }
    }
    Ok(map)
}

#[cfg(test)]
pub(crate) fn set_fixture(root: &Path, name: &str, content: &str) -> Result<PathBuf> {
    let path = root.join(name);
    utils::write_file(&path, content)?;
    Ok(path)
}
