//! Anonymous sync pipes used to order work across the fork boundary and to
//! carry the single error report out of a failed spawn.

use std::os::unix::io::RawFd;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::unistd::{close, pipe2, read, write};

use crate::error::{Error, ErrorKind, Result};

#[derive(Debug)]
pub struct SyncPipe {
    rfd: RawFd,
    wfd: RawFd,
}

impl SyncPipe {
    pub fn new() -> Result<SyncPipe> {
        let (rfd, wfd) =
            pipe2(OFlag::O_CLOEXEC).map_err(|e| Error::from(e).wrap("pipe2(O_CLOEXEC)"))?;
        Ok(SyncPipe { rfd, wfd })
    }

    pub fn rfd(&self) -> RawFd {
        self.rfd
    }

    pub fn wfd(&self) -> RawFd {
        self.wfd
    }

    pub fn close_read(&mut self) {
        if self.rfd >= 0 {
            let _ = close(self.rfd);
            self.rfd = -1;
        }
    }

    pub fn close_write(&mut self) {
        if self.wfd >= 0 {
            let _ = close(self.wfd);
            self.wfd = -1;
        }
    }

    pub fn send_pid(&self, pid: i32) -> Result<()> {
        let buf = pid.to_le_bytes();
        match write(self.wfd, &buf) {
            Ok(n) if n == buf.len() => Ok(()),
            Ok(n) => Err(Error::new(
                ErrorKind::Unknown,
                format!("partial write of pid: {} bytes", n),
            )),
            Err(e) => Err(Error::from(e).wrap("write pid to sync pipe")),
        }
    }

    /// `Ok(None)` means the writer exited without reporting a pid.
    pub fn recv_pid(&self) -> Result<Option<i32>> {
        let mut buf = [0u8; 4];
        let mut off = 0;
        while off < buf.len() {
            match read(self.rfd, &mut buf[off..]) {
                Ok(0) => break,
                Ok(n) => off += n,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(Error::from(e).wrap("read pid from sync pipe")),
            }
        }
        if off == 0 {
            return Ok(None);
        }
        if off < buf.len() {
            return Err(Error::new(
                ErrorKind::Unknown,
                format!("partial read of pid: {} bytes", off),
            ));
        }
        Ok(Some(i32::from_le_bytes(buf)))
    }

    /// Unblock the peer with a 4-byte token.
    pub fn send_go(&self) -> Result<()> {
        let token = 0i32.to_le_bytes();
        match write(self.wfd, &token) {
            Ok(n) if n == token.len() => Ok(()),
            Ok(n) => Err(Error::new(
                ErrorKind::Unknown,
                format!("partial write to child sync pipe ({} != 4)", n),
            )),
            Err(e) => Err(Error::from(e).wrap("write to child sync pipe")),
        }
    }

    /// Block until the peer writes the token. An empty read means the peer
    /// died first.
    pub fn wait_go(&self) -> Result<()> {
        let mut buf = [0u8; 4];
        let mut off = 0;
        while off < buf.len() {
            match read(self.rfd, &mut buf[off..]) {
                Ok(0) => {
                    return Err(Error::os(
                        ErrorKind::Unknown,
                        libc::ENODATA,
                        "partial read from child sync pipe",
                    ))
                }
                Ok(n) => off += n,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(Error::from(e).wrap("read from child sync pipe")),
            }
        }
        Ok(())
    }

    pub fn send_error(&self, error: &Error) -> Result<()> {
        error.serialize(self.wfd)
    }

    pub fn recv_error(&self) -> Result<Option<Error>> {
        Error::deserialize(self.rfd)
    }
}

impl Drop for SyncPipe {
    fn drop(&mut self) {
        self.close_read();
        self.close_write();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_round_trip() {
        let mut pipe = SyncPipe::new().unwrap();
        pipe.send_pid(4321).unwrap();
        pipe.close_write();
        assert_eq!(pipe.recv_pid().unwrap(), Some(4321));
    }

    #[test]
    fn test_closed_writer_reports_none() {
        let mut pipe = SyncPipe::new().unwrap();
        pipe.close_write();
        assert_eq!(pipe.recv_pid().unwrap(), None);
    }

    #[test]
    fn test_go_handshake() {
        let mut pipe = SyncPipe::new().unwrap();
        pipe.send_go().unwrap();
        pipe.wait_go().unwrap();

        // A writer dying before the handshake surfaces as an error.
        let mut dead = SyncPipe::new().unwrap();
        dead.close_write();
        let err = dead.wait_go().unwrap_err();
        assert_eq!(err.errno(), libc::ENODATA);
    }

    #[test]
    fn test_error_channel() {
        let mut pipe = SyncPipe::new().unwrap();
        pipe.send_error(&Error::new(ErrorKind::Permission, "mount denied"))
            .unwrap();
        pipe.close_write();
        let got = pipe.recv_error().unwrap().unwrap();
        assert_eq!(got.kind(), ErrorKind::Permission);
    }
}
