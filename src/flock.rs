use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// Exclusive advisory lock on the archive directory. Two archiver instances
/// writing runs into the same directory would corrupt the run sequence, so
/// the directory takes this lock on startup and holds it for its lifetime.
///
/// The lock file contains the owning process id for debugging.
pub struct DirLock {
    _file: File,
    path: PathBuf,
}

impl DirLock {
    pub fn lock<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }

        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

// The kernel releases the lock when the file handle is dropped. The lock
// file itself is left in place; removing it would race a concurrent locker.

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn lock_writes_pid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("archive.lock");
        let lock = DirLock::lock(&path).expect("acquire lock");
        assert_eq!(lock.path(), path);
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains(&std::process::id().to_string()));
    }

    #[test]
    fn second_lock_fails_while_held() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("archive.lock");
        let _held = DirLock::lock(&path).expect("acquire lock");
        assert!(DirLock::lock(&path).is_err());
    }

    #[test]
    fn lock_released_on_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("archive.lock");
        {
            let _held = DirLock::lock(&path).expect("acquire lock");
        }
        DirLock::lock(&path).expect("reacquire after drop");
    }
}
