//! Small path and file helpers used across the runtime.

use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileTypeExt;
use std::path::{Component, Path, PathBuf};

use nix::unistd;

use crate::error::{Error, ErrorKind, Result};

pub trait PathBufExt {
    /// Append an absolute path under this one, e.g. `/rootfs` + `/proc` →
    /// `/rootfs/proc`. `Path::join` would discard the base instead.
    fn join_absolute(&self, p: &Path) -> Result<PathBuf>;
}

impl PathBufExt for Path {
    fn join_absolute(&self, p: &Path) -> Result<PathBuf> {
        if !p.is_absolute() && !p.as_os_str().is_empty() {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                format!("cannot join {:?}: not an absolute path", p),
            ));
        }
        Ok(PathBuf::from(format!("{}{}", self.display(), p.display())))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Character,
    Block,
    Fifo,
    Symlink,
    Socket,
    Missing,
}

pub fn file_kind(path: &Path) -> FileKind {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(_) => return FileKind::Missing,
    };
    let ft = meta.file_type();
    if ft.is_dir() {
        FileKind::Directory
    } else if ft.is_symlink() {
        FileKind::Symlink
    } else if ft.is_char_device() {
        FileKind::Character
    } else if ft.is_block_device() {
        FileKind::Block
    } else if ft.is_fifo() {
        FileKind::Fifo
    } else if ft.is_socket() {
        FileKind::Socket
    } else {
        FileKind::Regular
    }
}

pub fn write_file(path: impl AsRef<Path>, data: &str) -> Result<()> {
    let path = path.as_ref();
    fs::write(path, data)
        .map_err(|e| Error::from(e).wrap(format!("write {}", path.display())))
}

/// Append with real `O_APPEND` semantics, so concurrent writers cannot
/// interleave inside each other's records.
pub fn append_file(path: impl AsRef<Path>, data: &str) -> Result<()> {
    let path = path.as_ref();
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| Error::from(e).wrap(format!("open {} for append", path.display())))?;
    file.write_all(data.as_bytes())
        .map_err(|e| Error::from(e).wrap(format!("append {}", path.display())))?;
    Ok(())
}

pub fn read_to_string(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    fs::read_to_string(path)
        .map_err(|e| Error::from(e).wrap(format!("read {}", path.display())))
}

pub fn read_lines(path: impl AsRef<Path>) -> Result<Vec<String>> {
    Ok(read_to_string(path)?.lines().map(str::to_owned).collect())
}

/// Trim a log file down once it grows past `max_size`, keeping the newest
/// half. Writers hold the file with `O_APPEND`, so their next write lands at
/// the new end without any coordination.
pub fn rotate_log(path: &Path, max_size: u64) -> Result<()> {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(_) => return Ok(()),
    };
    if !meta.is_file() || meta.len() <= max_size {
        return Ok(());
    }

    let keep = max_size / 2;
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| Error::from(e).wrap(format!("open {} for rotation", path.display())))?;
    file.seek(SeekFrom::End(-(keep as i64)))?;
    let mut tail = Vec::with_capacity(keep as usize);
    file.read_to_end(&mut tail)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&tail)?;
    file.set_len(tail.len() as u64)?;
    Ok(())
}

/// Resolve a path that may not fully exist yet: the longest existing prefix
/// is canonicalized, the remainder is appended after lexical `..`/`.`
/// normalization. Used to decide whether a bind target escapes a root.
pub fn canonicalize_prefix(path: &Path) -> Result<PathBuf> {
    let unresolvable = || {
        Error::new(
            ErrorKind::InvalidValue,
            format!("cannot resolve {}", path.display()),
        )
    };

    let mut existing = path.to_path_buf();
    let mut rest: Vec<std::ffi::OsString> = Vec::new();
    loop {
        match existing.canonicalize() {
            Ok(resolved) => {
                let mut out = resolved;
                for comp in rest.iter().rev() {
                    match comp.to_str() {
                        Some("..") => {
                            out.pop();
                        }
                        Some(".") => {}
                        _ => out.push(comp),
                    }
                }
                return Ok(out);
            }
            Err(_) => {
                match existing.file_name() {
                    Some(name) => rest.push(name.to_os_string()),
                    // the path ends in ".." or "."
                    None => match existing.components().next_back() {
                        Some(Component::ParentDir) => rest.push("..".into()),
                        Some(Component::CurDir) => rest.push(".".into()),
                        _ => return Err(unresolvable()),
                    },
                }
                if !existing.pop() {
                    return Err(unresolvable());
                }
            }
        }
    }
}

/// Enumerate the fds this process currently has open.
pub fn open_fds() -> Result<Vec<i32>> {
    let fds = fs::read_dir("/proc/self/fd")?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str().and_then(|n| n.parse().ok()))
        .collect();
    Ok(fds)
}

/// Close every fd at or above `min` except the ones listed in `keep`. The
/// listing fd itself shows up in the enumeration, so collect first and close
/// after.
pub fn close_fds(min: i32, keep: &[i32]) -> Result<()> {
    for fd in open_fds()? {
        if fd >= min && !keep.contains(&fd) {
            let _ = unistd::close(fd);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn test_join_absolute() {
        assert_eq!(
            Path::new("/rootfs").join_absolute(Path::new("/proc")).unwrap(),
            PathBuf::from("/rootfs/proc")
        );
        assert!(Path::new("/rootfs").join_absolute(Path::new("b/c")).is_err());
    }

    #[test]
    fn test_file_kind() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(file_kind(dir.path()), FileKind::Directory);
        let file = dir.path().join("f");
        fs::write(&file, "x").unwrap();
        assert_eq!(file_kind(&file), FileKind::Regular);
        assert_eq!(file_kind(&dir.path().join("missing")), FileKind::Missing);
        assert_eq!(file_kind(Path::new("/dev/null")), FileKind::Character);
    }

    #[test]
    fn test_append_appends() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("log");
        append_file(&file, "one\n").unwrap();
        append_file(&file, "two\n").unwrap();
        assert_eq!(read_to_string(&file).unwrap(), "one\ntwo\n");
    }

    #[test]
    fn test_rotate_log_keeps_tail() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("stdout.log");
        let mut data = String::new();
        for i in 0..200 {
            data.push_str(&format!("line {}\n", i));
        }
        fs::write(&file, &data).unwrap();

        rotate_log(&file, 256).unwrap();
        let got = read_to_string(&file).unwrap();
        assert!(got.len() as u64 <= 256);
        assert!(got.ends_with("line 199\n"));
    }

    #[test]
    fn test_rotate_log_below_limit_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("stdout.log");
        fs::write(&file, "short\n").unwrap();
        rotate_log(&file, 1024).unwrap();
        assert_eq!(read_to_string(&file).unwrap(), "short\n");
    }

    #[test]
    fn test_canonicalize_prefix_escape() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let inside = canonicalize_prefix(&root.join("a/b")).unwrap();
        assert!(inside.starts_with(&root));

        let escape = canonicalize_prefix(&root.join("a/../../outside")).unwrap();
        assert!(!escape.starts_with(&root));
    }

    #[test]
    fn test_open_fds_sees_open_file() {
        let file = std::fs::File::open("/dev/null").unwrap();
        let fd = file.as_raw_fd();
        assert!(open_fds().unwrap().contains(&fd));
    }
}
