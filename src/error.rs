//! Runtime error type shared between the daemon and the processes it spawns.
//!
//! Errors cross the fork boundary during container start, so the type carries
//! a stable kind code and the OS errno in addition to a message, and knows how
//! to serialize itself onto a pipe fd.

use std::fmt;
use std::io;
use std::os::unix::io::RawFd;

use nix::errno::Errno;
use nix::unistd;

pub type Result<T> = std::result::Result<T, Error>;

/// Stable error classification. The discriminants are part of the wire
/// format between the daemon and the spawn processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorKind {
    Success = 0,
    Unknown = 1,
    InvalidValue = 2,
    NoSpace = 3,
    ResourceNotAvailable = 4,
    Permission = 5,
    NotFound = 6,
    Busy = 7,
}

impl ErrorKind {
    fn from_code(code: u32) -> Self {
        match code {
            0 => ErrorKind::Success,
            2 => ErrorKind::InvalidValue,
            3 => ErrorKind::NoSpace,
            4 => ErrorKind::ResourceNotAvailable,
            5 => ErrorKind::Permission,
            6 => ErrorKind::NotFound,
            7 => ErrorKind::Busy,
            _ => ErrorKind::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Success => "Success",
            ErrorKind::Unknown => "Unknown",
            ErrorKind::InvalidValue => "InvalidValue",
            ErrorKind::NoSpace => "NoSpace",
            ErrorKind::ResourceNotAvailable => "ResourceNotAvailable",
            ErrorKind::Permission => "Permission",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Busy => "Busy",
        }
    }
}

/// Classify an OS errno into an [`ErrorKind`].
pub fn kind_from_errno(errno: i32) -> ErrorKind {
    match Errno::from_i32(errno) {
        Errno::EPERM | Errno::EACCES => ErrorKind::Permission,
        Errno::ENOENT | Errno::ENODEV | Errno::ENXIO => ErrorKind::NotFound,
        Errno::ENOMEM | Errno::EAGAIN | Errno::EMFILE | Errno::ENFILE => {
            ErrorKind::ResourceNotAvailable
        }
        Errno::ENOSPC | Errno::EDQUOT => ErrorKind::NoSpace,
        Errno::EBUSY => ErrorKind::Busy,
        Errno::EINVAL => ErrorKind::InvalidValue,
        _ => ErrorKind::Unknown,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    errno: i32,
    msg: String,
    cause: Option<Box<Error>>,
}

impl Error {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Error {
            kind,
            errno: 0,
            msg: msg.into(),
            cause: None,
        }
    }

    pub fn os(kind: ErrorKind, errno: i32, msg: impl Into<String>) -> Self {
        Error {
            kind,
            errno,
            msg: msg.into(),
            cause: None,
        }
    }

    /// Build an error from the calling thread's current errno.
    pub fn sys(msg: impl Into<String>) -> Self {
        let errno = Errno::last() as i32;
        Error::os(kind_from_errno(errno), errno, msg)
    }

    pub fn wrap(self, msg: impl Into<String>) -> Self {
        Error {
            kind: self.kind,
            errno: self.errno,
            msg: msg.into(),
            cause: Some(Box::new(self)),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn errno(&self) -> i32 {
        self.errno
    }

    pub fn message(&self) -> &str {
        &self.msg
    }

    /// Wire format: kind (u32 LE), errno (u32 LE), message length (u32 LE),
    /// message bytes. The cause chain is flattened into the message since the
    /// receiving side only reports.
    pub fn serialize(&self, fd: RawFd) -> Result<()> {
        let msg = self.to_string();
        let mut buf = Vec::with_capacity(12 + msg.len());
        buf.extend_from_slice(&(self.kind as u32).to_le_bytes());
        buf.extend_from_slice(&(self.errno as u32).to_le_bytes());
        buf.extend_from_slice(&(msg.len() as u32).to_le_bytes());
        buf.extend_from_slice(msg.as_bytes());
        write_all(fd, &buf)
    }

    /// Read a serialized error from a pipe. Returns `Ok(None)` if the writer
    /// closed the pipe without reporting anything, which callers must treat
    /// as "the child died before it could tell us why".
    pub fn deserialize(fd: RawFd) -> Result<Option<Error>> {
        let mut header = [0u8; 12];
        match read_full(fd, &mut header)? {
            0 => return Ok(None),
            n if n < header.len() => {
                return Err(Error::new(
                    ErrorKind::Unknown,
                    format!("short read of error header: {} bytes", n),
                ))
            }
            _ => {}
        }

        let kind = ErrorKind::from_code(u32::from_le_bytes(header[0..4].try_into().unwrap()));
        let errno = u32::from_le_bytes(header[4..8].try_into().unwrap()) as i32;
        let len = u32::from_le_bytes(header[8..12].try_into().unwrap()) as usize;
        if len > MAX_SERIALIZED_MSG {
            return Err(Error::new(
                ErrorKind::Unknown,
                format!("oversized error message: {} bytes", len),
            ));
        }

        let mut msg = vec![0u8; len];
        let n = read_full(fd, &mut msg)?;
        msg.truncate(n);
        Ok(Some(Error::os(
            kind,
            errno,
            String::from_utf8_lossy(&msg).into_owned(),
        )))
    }
}

/// Upper bound for a message travelling over the sync pipe.
pub const MAX_SERIALIZED_MSG: usize = 4096;

fn write_all(fd: RawFd, mut buf: &[u8]) -> Result<()> {
    while !buf.is_empty() {
        match unistd::write(fd, buf) {
            Ok(0) => return Err(Error::new(ErrorKind::Unknown, "pipe closed during write")),
            Ok(n) => buf = &buf[n..],
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(Error::os(kind_from_errno(e as i32), e as i32, "write(pipe)")),
        }
    }
    Ok(())
}

fn read_full(fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    let mut off = 0;
    while off < buf.len() {
        match unistd::read(fd, &mut buf[off..]) {
            Ok(0) => break,
            Ok(n) => off += n,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(Error::os(kind_from_errno(e as i32), e as i32, "read(pipe)")),
        }
    }
    Ok(off)
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)?;
        if self.errno != 0 {
            write!(f, ": {}", Errno::from_i32(self.errno).desc())?;
        }
        if let Some(cause) = &self.cause {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|c| c as &(dyn std::error::Error + 'static))
    }
}

impl From<Errno> for Error {
    fn from(e: Errno) -> Self {
        Error::os(kind_from_errno(e as i32), e as i32, e.desc())
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        let errno = e.raw_os_error().unwrap_or(0);
        Error::os(kind_from_errno(errno), errno, e.to_string())
    }
}

impl From<procfs::ProcError> for Error {
    fn from(e: procfs::ProcError) -> Self {
        Error::new(ErrorKind::Unknown, e.to_string())
    }
}

impl From<caps::errors::CapsError> for Error {
    fn from(e: caps::errors::CapsError) -> Self {
        Error::new(ErrorKind::Permission, e.to_string())
    }
}
