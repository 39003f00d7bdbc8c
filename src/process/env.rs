//! The frozen per-start specification handed to the launcher, and its
//! construction from free-form container properties.

use std::collections::HashMap;
use std::net::IpAddr;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use nix::fcntl::{open, OFlag};
use nix::sched::CloneFlags;
use nix::sys::stat::Mode;
use nix::unistd::close;

use crate::config::config;
use crate::cred::{self, Credentials};
use crate::error::{Error, ErrorKind, Result};
use crate::syscall::Syscall;
use crate::utils::PathBufExt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindEntry {
    pub source: PathBuf,
    pub dest: PathBuf,
    pub rdonly: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpSpec {
    pub addr: IpAddr,
    pub prefix: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostMove {
    pub dev: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VethPair {
    pub name: String,
    pub bridge: String,
    pub peer: String,
    pub hw: String,
    pub mtu: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacVlan {
    pub master: String,
    pub name: String,
    pub mode: String,
    pub hw: String,
    pub mtu: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpVlan {
    pub master: String,
    pub name: String,
    pub mode: String,
    pub mtu: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetConfig {
    pub share: bool,
    pub host: Vec<HostMove>,
    pub veth: Vec<VethPair>,
    pub macvlan: Vec<MacVlan>,
    pub ipvlan: Vec<IpVlan>,
}

impl NetConfig {
    pub fn host_shared() -> NetConfig {
        NetConfig {
            share: true,
            host: vec![],
            veth: vec![],
            macvlan: vec![],
            ipvlan: vec![],
        }
    }
}

/// Open handles onto another process's namespaces, used to start a task
/// inside an existing container's context.
#[derive(Debug, Default)]
pub struct NamespaceHandles {
    ns_fds: Vec<(CloneFlags, RawFd)>,
    root_fd: Option<RawFd>,
}

impl NamespaceHandles {
    pub fn empty() -> NamespaceHandles {
        NamespaceHandles::default()
    }

    pub fn for_pid(pid: i32) -> Result<NamespaceHandles> {
        // The mount namespace comes last: entering it first would change
        // what the remaining /proc paths resolve to.
        let kinds = [
            ("ipc", CloneFlags::CLONE_NEWIPC),
            ("uts", CloneFlags::CLONE_NEWUTS),
            ("net", CloneFlags::CLONE_NEWNET),
            ("pid", CloneFlags::CLONE_NEWPID),
            ("mnt", CloneFlags::CLONE_NEWNS),
        ];
        let mut handles = NamespaceHandles::default();
        for (name, flag) in kinds {
            let path = format!("/proc/{}/ns/{}", pid, name);
            let fd = open(Path::new(&path), OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty())
                .map_err(|e| Error::from(e).wrap(format!("open({})", path)))?;
            handles.ns_fds.push((flag, fd));
        }
        let root = format!("/proc/{}/root", pid);
        let fd = open(Path::new(&root), OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty())
            .map_err(|e| Error::from(e).wrap(format!("open({})", root)))?;
        handles.root_fd = Some(fd);
        Ok(handles)
    }

    pub fn valid(&self) -> bool {
        !self.ns_fds.is_empty()
    }

    /// Raw fds backing the handles, for close-sweep exclusion lists.
    pub fn raw_fds(&self) -> Vec<RawFd> {
        let mut fds: Vec<RawFd> = self.ns_fds.iter().map(|&(_, fd)| fd).collect();
        fds.extend(self.root_fd);
        fds
    }

    pub fn attach(&self, syscall: &dyn Syscall) -> Result<()> {
        for &(flag, fd) in &self.ns_fds {
            syscall.set_ns(fd, flag)?;
        }
        Ok(())
    }

    /// Enter the root of the owning process. fchdir + chroot(".") so that
    /// the path does not depend on any mount namespace state.
    pub fn chroot(&self, syscall: &dyn Syscall) -> Result<()> {
        let fd = self
            .root_fd
            .ok_or_else(|| Error::new(ErrorKind::InvalidValue, "no root handle"))?;
        nix::unistd::fchdir(fd).map_err(|e| Error::from(e).wrap("fchdir(root)"))?;
        syscall.chroot(Path::new("."))?;
        syscall.chdir(Path::new("/"))
    }
}

impl Drop for NamespaceHandles {
    fn drop(&mut self) {
        for &(_, fd) in &self.ns_fds {
            let _ = close(fd);
        }
        if let Some(fd) = self.root_fd {
            let _ = close(fd);
        }
    }
}

/// Immutable specification for one task start.
#[derive(Debug)]
pub struct TaskEnv {
    pub command: String,
    pub environ: Vec<String>,
    pub cwd: PathBuf,
    pub root: PathBuf,
    pub root_rdonly: bool,
    pub loop_image: Option<PathBuf>,
    pub loop_dev: Option<String>,
    pub bind_map: Vec<BindEntry>,
    pub net: NetConfig,
    pub ip_map: HashMap<String, IpSpec>,
    pub default_gw: Option<IpAddr>,
    pub hostname: String,
    pub isolate: bool,
    pub new_mount_ns: bool,
    pub bind_dns: bool,
    pub caps: u64,
    pub rlimits: HashMap<u32, (u64, u64)>,
    pub cred: Credentials,
    pub user: String,
    pub stdin_path: PathBuf,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    pub remove_stdout: bool,
    pub remove_stderr: bool,
    pub parent_ns: NamespaceHandles,
    pub client_ns: NamespaceHandles,
    pub create_cwd: bool,
    pub memory_limit: Option<u64>,
    pub net_classid: Option<u32>,
}

impl Default for TaskEnv {
    fn default() -> Self {
        TaskEnv {
            command: String::new(),
            environ: vec![],
            cwd: PathBuf::from("/"),
            root: PathBuf::from("/"),
            root_rdonly: false,
            loop_image: None,
            loop_dev: None,
            bind_map: vec![],
            net: NetConfig::host_shared(),
            ip_map: HashMap::new(),
            default_gw: None,
            hostname: String::new(),
            isolate: true,
            new_mount_ns: true,
            bind_dns: false,
            caps: 0,
            rlimits: HashMap::new(),
            cred: Credentials::root(),
            user: String::from("root"),
            stdin_path: PathBuf::from("/dev/null"),
            stdout_path: PathBuf::from("/dev/null"),
            stderr_path: PathBuf::from("/dev/null"),
            remove_stdout: false,
            remove_stderr: false,
            parent_ns: NamespaceHandles::empty(),
            client_ns: NamespaceHandles::empty(),
            create_cwd: false,
            memory_limit: None,
            net_classid: None,
        }
    }
}

impl TaskEnv {
    /// Clone flags for the grandchild, derived from the isolation toggles.
    pub fn clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::empty();
        if self.isolate {
            flags |= CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_NEWIPC;
        }
        if self.new_mount_ns {
            flags |= CloneFlags::CLONE_NEWNS;
        }
        if !self.hostname.is_empty() {
            flags |= CloneFlags::CLONE_NEWUTS;
        }
        if !self.net.share {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        flags
    }

    /// Build the frozen environment from container properties. Bad values
    /// surface as `InvalidValue` before anything forks.
    pub fn from_properties(name: &str, props: &HashMap<String, String>) -> Result<TaskEnv> {
        let mut env = TaskEnv::default();

        let get = |key: &str| props.get(key).map(String::as_str).unwrap_or("");

        env.command = get("command").to_owned();
        if env.command.is_empty() {
            return Err(Error::new(ErrorKind::InvalidValue, "command is not set"));
        }

        for entry in split_list(get("env")) {
            if !entry.contains('=') {
                return Err(Error::new(
                    ErrorKind::InvalidValue,
                    format!("invalid environment entry {}", entry),
                ));
            }
            env.environ.push(entry);
        }

        if !get("root").is_empty() {
            env.root = PathBuf::from(get("root"));
        }
        env.root_rdonly = parse_bool("root_rdonly", get("root_rdonly"), false)?;
        if !get("loop").is_empty() {
            env.loop_image = Some(PathBuf::from(get("loop")));
        }

        env.isolate = parse_bool("isolate", get("isolate"), true)?;
        env.new_mount_ns = env.isolate || env.root != Path::new("/");
        env.hostname = get("hostname").to_owned();
        env.bind_dns = parse_bool(
            "bind_dns",
            get("bind_dns"),
            env.root != Path::new("/"),
        )?;

        match get("cwd") {
            "" if env.root == Path::new("/") => {
                env.cwd = config().container.tmp_dir.join(name);
                env.create_cwd = true;
            }
            "" => env.cwd = PathBuf::from("/"),
            cwd => env.cwd = PathBuf::from(cwd),
        }

        for entry in split_list(get("bind")) {
            env.bind_map.push(parse_bind(&entry)?);
        }

        env.net = parse_net(get("net"))?;
        for entry in split_list(get("ip")) {
            let (dev, spec) = parse_ip(&entry)?;
            env.ip_map.insert(dev, spec);
        }
        if !get("default_gw").is_empty() {
            env.default_gw = Some(parse_addr(get("default_gw"))?);
        }

        // Start inside the namespaces of an already-running process
        // instead of building fresh isolation.
        if !get("parent_pid").is_empty() {
            let pid = parse_u64("parent_pid", get("parent_pid"))? as i32;
            env.parent_ns = NamespaceHandles::for_pid(pid)
                .map_err(|e| e.wrap(format!("open namespaces of pid {}", pid)))?;
        }

        env.user = if get("user").is_empty() {
            "root".to_owned()
        } else {
            get("user").to_owned()
        };
        env.cred = cred::resolve_credentials(&env.user, get("group"))?;

        env.caps = if get("capabilities").is_empty() {
            cred::all_caps_mask()
        } else {
            let mut mask = 0;
            for cap in split_list(get("capabilities")) {
                mask |= cred::capability_bit(&cap)?;
            }
            mask
        };

        for entry in split_list(get("rlimit")) {
            let (resource, soft, hard) = parse_rlimit(&entry)?;
            env.rlimits.insert(resource, (soft, hard));
        }

        if !get("memory_limit").is_empty() {
            env.memory_limit = Some(parse_u64("memory_limit", get("memory_limit"))?);
        }
        if !get("classid").is_empty() {
            env.net_classid = Some(parse_u64("classid", get("classid"))? as u32);
        }

        // Stdio files are opened from the host side, before any pivot, so
        // defaults for chroot containers live under the root prefix.
        let stdio_base = if env.root == Path::new("/") {
            env.cwd.clone()
        } else if env.cwd.is_absolute() {
            env.root.join_absolute(&env.cwd)?
        } else {
            env.root.join(&env.cwd)
        };

        env.stdin_path = if get("stdin_path").is_empty() {
            PathBuf::from("/dev/null")
        } else {
            PathBuf::from(get("stdin_path"))
        };
        match get("stdout_path") {
            "" => {
                env.stdout_path = stdio_base.join("stdout.log");
                env.remove_stdout = true;
            }
            path => env.stdout_path = PathBuf::from(path),
        }
        match get("stderr_path") {
            "" => {
                env.stderr_path = stdio_base.join("stderr.log");
                env.remove_stderr = true;
            }
            path => env.stderr_path = PathBuf::from(path),
        }

        Ok(env)
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

fn parse_bool(key: &str, value: &str, default: bool) -> Result<bool> {
    match value {
        "" => Ok(default),
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(Error::new(
            ErrorKind::InvalidValue,
            format!("invalid boolean value {} for {}", value, key),
        )),
    }
}

fn parse_u64(key: &str, value: &str) -> Result<u64> {
    value.parse().map_err(|_| {
        Error::new(
            ErrorKind::InvalidValue,
            format!("invalid numeric value {} for {}", value, key),
        )
    })
}

fn parse_bind(entry: &str) -> Result<BindEntry> {
    let tokens: Vec<&str> = entry.split_whitespace().collect();
    match tokens.as_slice() {
        [source, dest] => Ok(BindEntry {
            source: PathBuf::from(source),
            dest: PathBuf::from(dest),
            rdonly: false,
        }),
        [source, dest, mode] => Ok(BindEntry {
            source: PathBuf::from(source),
            dest: PathBuf::from(dest),
            rdonly: match *mode {
                "ro" => true,
                "rw" => false,
                _ => {
                    return Err(Error::new(
                        ErrorKind::InvalidValue,
                        format!("invalid bind mode {}", mode),
                    ))
                }
            },
        }),
        _ => Err(Error::new(
            ErrorKind::InvalidValue,
            format!("invalid bind entry {}", entry),
        )),
    }
}

fn parse_addr(value: &str) -> Result<IpAddr> {
    value.parse().map_err(|_| {
        Error::new(
            ErrorKind::InvalidValue,
            format!("invalid address {}", value),
        )
    })
}

fn parse_ip(entry: &str) -> Result<(String, IpSpec)> {
    let tokens: Vec<&str> = entry.split_whitespace().collect();
    let [dev, cidr] = tokens.as_slice() else {
        return Err(Error::new(
            ErrorKind::InvalidValue,
            format!("invalid ip entry {}", entry),
        ));
    };
    let (addr, prefix) = match cidr.split_once('/') {
        Some((addr, prefix)) => (
            parse_addr(addr)?,
            prefix.parse().map_err(|_| {
                Error::new(
                    ErrorKind::InvalidValue,
                    format!("invalid prefix length in {}", entry),
                )
            })?,
        ),
        None => {
            let addr = parse_addr(cidr)?;
            (addr, if addr.is_ipv4() { 32 } else { 128 })
        }
    };
    Ok((dev.to_string(), IpSpec { addr, prefix }))
}

fn parse_mtu(token: &str) -> Result<u32> {
    token.parse().map_err(|_| {
        Error::new(
            ErrorKind::InvalidValue,
            format!("invalid mtu {}", token),
        )
    })
}

/// `net` grammar, entries separated by `;`:
///   host | none | host <dev> | veth <name> <bridge> [mtu] [hw]
///   | macvlan <master> <name> [mode] [mtu] [hw]
///   | ipvlan <master> <name> [mode] [mtu]
fn parse_net(value: &str) -> Result<NetConfig> {
    let mut net = NetConfig::host_shared();
    if value.is_empty() {
        return Ok(net);
    }

    net.share = false;
    for entry in split_list(value) {
        let tokens: Vec<&str> = entry.split_whitespace().collect();
        match tokens.as_slice() {
            ["host"] => net.share = true,
            ["none"] => {}
            ["host", dev] => net.host.push(HostMove {
                dev: dev.to_string(),
            }),
            ["veth", name, bridge, rest @ ..] => {
                let mtu = rest.first().map(|t| parse_mtu(t)).transpose()?;
                net.veth.push(VethPair {
                    name: name.to_string(),
                    bridge: bridge.to_string(),
                    peer: format!("veth-{}", name),
                    hw: rest.get(1).unwrap_or(&"").to_string(),
                    mtu,
                });
            }
            ["macvlan", master, name, rest @ ..] => net.macvlan.push(MacVlan {
                master: master.to_string(),
                name: name.to_string(),
                mode: rest.first().unwrap_or(&"").to_string(),
                mtu: rest.get(1).map(|t| parse_mtu(t)).transpose()?,
                hw: rest.get(2).unwrap_or(&"").to_string(),
            }),
            ["ipvlan", master, name, rest @ ..] => net.ipvlan.push(IpVlan {
                master: master.to_string(),
                name: name.to_string(),
                mode: rest.first().unwrap_or(&"").to_string(),
                mtu: rest.get(1).map(|t| parse_mtu(t)).transpose()?,
            }),
            _ => {
                return Err(Error::new(
                    ErrorKind::InvalidValue,
                    format!("invalid net entry {}", entry),
                ))
            }
        }
    }
    Ok(net)
}

fn parse_rlimit(entry: &str) -> Result<(u32, u64, u64)> {
    let tokens: Vec<&str> = entry.split_whitespace().collect();
    let [name, soft, hard] = tokens.as_slice() else {
        return Err(Error::new(
            ErrorKind::InvalidValue,
            format!("invalid rlimit entry {}", entry),
        ));
    };
    let resource = match *name {
        "cpu" => libc::RLIMIT_CPU,
        "fsize" => libc::RLIMIT_FSIZE,
        "data" => libc::RLIMIT_DATA,
        "stack" => libc::RLIMIT_STACK,
        "core" => libc::RLIMIT_CORE,
        "nproc" => libc::RLIMIT_NPROC,
        "nofile" => libc::RLIMIT_NOFILE,
        "memlock" => libc::RLIMIT_MEMLOCK,
        "as" => libc::RLIMIT_AS,
        _ => {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                format!("invalid rlimit {}", name),
            ))
        }
    };
    Ok((
        resource as u32,
        parse_u64("rlimit soft", soft)?,
        parse_u64("rlimit hard", hard)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sched::CloneFlags;

    fn props(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_command_is_required() {
        let err = TaskEnv::from_properties("box", &props(&[])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidValue);
    }

    #[test]
    fn test_defaults_for_minimal_container() {
        let env =
            TaskEnv::from_properties("box", &props(&[("command", "/bin/sleep 5")])).unwrap();
        assert!(env.isolate);
        assert!(env.net.share);
        assert_eq!(env.root, PathBuf::from("/"));
        assert!(env.create_cwd);
        assert!(env.cwd.ends_with("box"));
        assert!(env.remove_stdout && env.remove_stderr);
        assert_eq!(env.caps, crate::cred::all_caps_mask());
    }

    #[test]
    fn test_clone_flags_follow_toggles() {
        let mut env = TaskEnv::default();
        env.isolate = false;
        env.new_mount_ns = false;
        env.net.share = true;
        assert_eq!(env.clone_flags(), CloneFlags::empty());

        env.isolate = true;
        assert_eq!(
            env.clone_flags(),
            CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_NEWIPC
        );

        env.new_mount_ns = true;
        env.hostname = "box".into();
        env.net.share = false;
        let flags = env.clone_flags();
        assert!(flags.contains(CloneFlags::CLONE_NEWNS));
        assert!(flags.contains(CloneFlags::CLONE_NEWUTS));
        assert!(flags.contains(CloneFlags::CLONE_NEWNET));
    }

    #[test]
    fn test_env_entries_must_have_separator() {
        let err = TaskEnv::from_properties(
            "box",
            &props(&[("command", "/bin/true"), ("env", "PATH=/bin;BROKEN")]),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidValue);
    }

    #[test]
    fn test_bind_parsing() {
        let env = TaskEnv::from_properties(
            "box",
            &props(&[
                ("command", "/bin/true"),
                ("bind", "/etc /mnt/etc ro; /var /mnt/var"),
            ]),
        )
        .unwrap();
        assert_eq!(
            env.bind_map,
            vec![
                BindEntry {
                    source: "/etc".into(),
                    dest: "/mnt/etc".into(),
                    rdonly: true
                },
                BindEntry {
                    source: "/var".into(),
                    dest: "/mnt/var".into(),
                    rdonly: false
                },
            ]
        );

        let err = TaskEnv::from_properties(
            "box",
            &props(&[("command", "/bin/true"), ("bind", "/etc /mnt/etc rx")]),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidValue);
    }

    #[test]
    fn test_net_parsing() {
        let net = parse_net("veth eth0 br0 1400; macvlan eth1 m0 bridge; ipvlan eth2 i0 l2").unwrap();
        assert!(!net.share);
        assert_eq!(net.veth[0].name, "eth0");
        assert_eq!(net.veth[0].bridge, "br0");
        assert_eq!(net.veth[0].mtu, Some(1400));
        assert_eq!(net.macvlan[0].mode, "bridge");
        assert_eq!(net.ipvlan[0].mode, "l2");

        assert!(parse_net("host").unwrap().share);
        assert!(!parse_net("none").unwrap().share);
        assert!(parse_net("frob eth0").is_err());
    }

    #[test]
    fn test_ip_parsing() {
        let (dev, spec) = parse_ip("eth0 192.168.1.10/24").unwrap();
        assert_eq!(dev, "eth0");
        assert_eq!(spec.prefix, 24);

        let (_, spec) = parse_ip("eth0 10.0.0.1").unwrap();
        assert_eq!(spec.prefix, 32);

        assert!(parse_ip("eth0").is_err());
        assert!(parse_ip("eth0 not-an-address").is_err());
    }

    #[test]
    fn test_rlimit_parsing() {
        let env = TaskEnv::from_properties(
            "box",
            &props(&[("command", "/bin/true"), ("rlimit", "nofile 1024 2048")]),
        )
        .unwrap();
        assert_eq!(
            env.rlimits.get(&(libc::RLIMIT_NOFILE as u32)),
            Some(&(1024, 2048))
        );

        let err = TaskEnv::from_properties(
            "box",
            &props(&[("command", "/bin/true"), ("rlimit", "bogus 1 2")]),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidValue);
    }

    #[test]
    fn test_default_stdio_of_chroot_container_is_under_root() {
        let env = TaskEnv::from_properties(
            "box",
            &props(&[("command", "/bin/true"), ("root", "/srv/rootfs")]),
        )
        .unwrap();
        // Stdio opens happen before the pivot, from the host's view.
        assert!(env.stdout_path.starts_with("/srv/rootfs"));
        assert!(env.stderr_path.starts_with("/srv/rootfs"));
        assert_eq!(env.cwd, PathBuf::from("/"));
        assert!(!env.create_cwd);
    }

    #[test]
    fn test_capability_list_overrides_default() {
        let env = TaskEnv::from_properties(
            "box",
            &props(&[
                ("command", "/bin/true"),
                ("capabilities", "NET_BIND_SERVICE"),
            ]),
        )
        .unwrap();
        assert_eq!(
            env.caps,
            crate::cred::capability_bit("NET_BIND_SERVICE").unwrap()
        );
    }
}
