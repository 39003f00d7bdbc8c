use nix::sys::signal::{signal, SigHandler, Signal};

use crate::error::{Error, ErrorKind, Result};

pub fn from_str(name: &str) -> Result<Signal> {
    use Signal::*;
    Ok(match name.to_ascii_uppercase().as_str() {
        "1" | "HUP" | "SIGHUP" => SIGHUP,
        "2" | "INT" | "SIGINT" => SIGINT,
        "3" | "QUIT" | "SIGQUIT" => SIGQUIT,
        "6" | "ABRT" | "SIGABRT" => SIGABRT,
        "9" | "KILL" | "SIGKILL" => SIGKILL,
        "10" | "USR1" | "SIGUSR1" => SIGUSR1,
        "12" | "USR2" | "SIGUSR2" => SIGUSR2,
        "13" | "PIPE" | "SIGPIPE" => SIGPIPE,
        "14" | "ALRM" | "SIGALRM" => SIGALRM,
        "15" | "TERM" | "SIGTERM" => SIGTERM,
        "17" | "CHLD" | "SIGCHLD" => SIGCHLD,
        "18" | "CONT" | "SIGCONT" => SIGCONT,
        "19" | "STOP" | "SIGSTOP" => SIGSTOP,
        "24" | "XCPU" | "SIGXCPU" => SIGXCPU,
        "25" | "XFSZ" | "SIGXFSZ" => SIGXFSZ,
        _ => {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                format!("{} is not a valid signal", name),
            ))
        }
    })
}

/// Restore default dispositions for every catchable signal. The spawned
/// container process must not inherit the daemon's handlers.
pub fn reset_all() -> Result<()> {
    for sig in Signal::iterator() {
        if sig == Signal::SIGKILL || sig == Signal::SIGSTOP {
            continue;
        }
        unsafe {
            signal(sig, SigHandler::SigDfl)
                .map_err(|e| Error::from(e).wrap(format!("reset handler for {}", sig)))?;
        }
    }
    Ok(())
}
