//! The daemon: reaper thread, log rotation sweep, and the control socket
//! serving one JSON request per line.

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

use crate::api::{ContainerSummary, Request, Response};
use crate::cgroups::Registry;
use crate::config::config;
use crate::cred;
use crate::error::{Error, Result};
use crate::holder::ContainerHolder;
use crate::network;
use crate::signal;

pub struct Daemon {
    holder: Arc<ContainerHolder>,
}

impl Daemon {
    pub fn new() -> Daemon {
        Daemon {
            holder: Arc::new(ContainerHolder::with_state_dir(
                config().daemon.state_dir.clone(),
            )),
        }
    }

    #[cfg(test)]
    fn new_transient() -> Daemon {
        Daemon {
            holder: Arc::new(ContainerHolder::new()),
        }
    }

    /// Collect every child this process is responsible for. Container init
    /// processes reparent to us through PR_SET_CHILD_SUBREAPER; everything
    /// else (intermediates, helpers) is reaped and ignored here.
    fn reaper(holder: Arc<ContainerHolder>) {
        loop {
            match waitpid(Pid::from_raw(-1), None) {
                Ok(WaitStatus::Exited(pid, code)) => {
                    holder.deliver_exit(pid.as_raw(), code);
                }
                Ok(WaitStatus::Signaled(pid, sig, _)) => {
                    holder.deliver_exit(pid.as_raw(), 128 + sig as i32);
                }
                Ok(_) => {}
                Err(Errno::ECHILD) => thread::sleep(Duration::from_millis(200)),
                Err(Errno::EINTR) => {}
                Err(e) => {
                    log::error!("waitpid failed in reaper: {}", e);
                    thread::sleep(Duration::from_millis(200));
                }
            }
        }
    }

    fn handle(&self, request: Request) -> Response {
        let result = self.dispatch(request);
        match result {
            Ok(response) => response,
            Err(e) => Response::from_error(&e),
        }
    }

    fn dispatch(&self, request: Request) -> Result<Response> {
        match request {
            Request::Create { name } => {
                self.holder.create(&name)?;
                Ok(Response::Ok)
            }
            Request::Destroy { name } => {
                self.holder.destroy(&name)?;
                Ok(Response::Ok)
            }
            Request::List => {
                let list = self
                    .holder
                    .list()
                    .into_iter()
                    .map(|c| ContainerSummary {
                        name: c.name().to_owned(),
                        state: c.state().to_string(),
                        pid: c.pid(),
                    })
                    .collect();
                Ok(Response::List(list))
            }
            Request::Start { name } => {
                self.holder.find(&name)?.start()?;
                Ok(Response::Ok)
            }
            Request::Stop { name } => {
                self.holder.find(&name)?.stop()?;
                Ok(Response::Ok)
            }
            Request::Pause { name } => {
                self.holder.find(&name)?.pause()?;
                Ok(Response::Ok)
            }
            Request::Resume { name } => {
                self.holder.find(&name)?.resume()?;
                Ok(Response::Ok)
            }
            Request::Kill { name, signal } => {
                let sig = signal::from_str(&signal)?;
                self.holder.find(&name)?.kill(sig)?;
                Ok(Response::Ok)
            }
            Request::GetProperty { name, property } => Ok(Response::Value(
                self.holder.find(&name)?.get_property(&property)?,
            )),
            Request::SetProperty {
                name,
                property,
                value,
            } => {
                self.holder.find(&name)?.set_property(&property, &value)?;
                Ok(Response::Ok)
            }
            Request::GetData { name, key } => {
                Ok(Response::Value(self.holder.find(&name)?.get_data(&key)?))
            }
        }
    }

    fn serve_connection(&self, stream: UnixStream) {
        let reader = BufReader::new(match stream.try_clone() {
            Ok(s) => s,
            Err(e) => {
                log::warn!("cannot clone client stream: {}", e);
                return;
            }
        });
        let mut writer = stream;

        for line in reader.lines() {
            let line = match line {
                Ok(line) if !line.trim().is_empty() => line,
                Ok(_) => continue,
                Err(_) => break,
            };
            let response = match serde_json::from_str::<Request>(&line) {
                Ok(request) => {
                    log::debug!("request: {:?}", request);
                    self.handle(request)
                }
                Err(e) => Response::from_error(&Error::new(
                    crate::error::ErrorKind::InvalidValue,
                    format!("malformed request: {}", e),
                )),
            };
            let mut payload = match serde_json::to_string(&response) {
                Ok(payload) => payload,
                Err(e) => {
                    log::error!("cannot encode response: {}", e);
                    break;
                }
            };
            payload.push('\n');
            if writer.write_all(payload.as_bytes()).is_err() {
                break;
            }
        }
    }

    pub fn run(&self) -> Result<()> {
        // Process-wide state, initialized exactly once.
        cred::last_cap();
        Registry::get();

        if let Err(e) = prctl::set_child_subreaper(true) {
            log::warn!(
                "cannot become child subreaper: {}",
                Errno::from_i32(e)
            );
        }

        if config().network.enabled {
            if let Err(e) = network::prepare_shaping() {
                log::warn!("cannot prepare traffic shaping: {}", e);
            }
        }

        // Reattach to whatever the previous daemon left behind before any
        // client can talk to us and before exits start being delivered.
        let restored = self.holder.restore_all();
        if restored > 0 {
            log::info!("restored {} containers from state", restored);
        }

        {
            let holder = Arc::clone(&self.holder);
            thread::spawn(move || Self::reaper(holder));
        }
        {
            let holder = Arc::clone(&self.holder);
            let interval = Duration::from_secs(config().daemon.rotate_interval.max(1));
            thread::spawn(move || loop {
                thread::sleep(interval);
                holder.rotate_all_logs();
            });
        }

        let socket_path = &config().daemon.socket_path;
        if socket_path.exists() {
            let _ = fs::remove_file(socket_path);
        }
        if let Some(parent) = socket_path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let listener = UnixListener::bind(socket_path)
            .map_err(|e| Error::from(e).wrap(format!("bind {}", socket_path.display())))?;
        log::info!("listening on {}", socket_path.display());

        for stream in listener.incoming() {
            match stream {
                Ok(stream) => self.serve_connection(stream),
                Err(e) => log::warn!("accept failed: {}", e),
            }
        }
        Ok(())
    }
}

impl Default for Daemon {
    fn default() -> Self {
        Self::new()
    }
}
