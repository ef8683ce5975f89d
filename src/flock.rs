use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Exclusive advisory lock next to a database file, held for the lifetime of
/// the owning process' cache.
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

/// `<database>.lock`
pub fn lock_path_for(database: &Path) -> PathBuf {
    let mut name = OsString::from(database.as_os_str());
    name.push(".lock");
    PathBuf::from(name)
}

impl FileLock {
    /// Takes the lock guarding `database`. Fails with
    /// [`io::ErrorKind::WouldBlock`] when another holder has it.
    pub fn for_database(database: &Path) -> io::Result<Self> {
        Self::lock(lock_path_for(database))
    }

    /// Locks `path`, creating it if needed. The file records the holder's
    /// process id.
    pub fn lock<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        Self::try_lock(&file)?;

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self { _file: file, path })
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> io::Result<()> {
        use libc::{flock, LOCK_EX, LOCK_NB};
        use std::os::unix::io::AsRawFd;

        let result = unsafe { flock(file.as_raw_fd(), LOCK_EX | LOCK_NB) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(windows)]
    fn try_lock(file: &File) -> io::Result<()> {
        use std::os::windows::io::AsRawHandle;
        use winapi::um::fileapi::LockFileEx;
        use winapi::um::minwinbase::OVERLAPPED;
        use winapi::um::winnt::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY};

        let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
        let result = unsafe {
            LockFileEx(
                file.as_raw_handle() as *mut _,
                LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
                0,
                !0,
                !0,
                &mut overlapped,
            )
        };
        if result == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(any(unix, windows)))]
    fn try_lock(_file: &File) -> io::Result<()> {
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Whether a lock failure means another holder owns the file.
pub fn is_held_elsewhere(err: &io::Error) -> bool {
    // ERROR_LOCK_VIOLATION
    #[cfg(windows)]
    if err.raw_os_error() == Some(33) {
        return true;
    }
    err.kind() == io::ErrorKind::WouldBlock
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_lock_records_pid() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("cache.db");

        let lock = FileLock::for_database(&db).unwrap();
        assert_eq!(lock.path(), dir.path().join("cache.db.lock"));
        let content = fs::read_to_string(lock.path()).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());
    }

    #[test]
    fn test_second_holder_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("cache.db");

        let _first = FileLock::for_database(&db).unwrap();
        let second = FileLock::for_database(&db);
        match second {
            Err(err) => assert!(is_held_elsewhere(&err)),
            Ok(_) => panic!("lock acquired twice"),
        }
        // The holder's pid survives the failed attempt.
        let content = fs::read_to_string(lock_path_for(&db)).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());
    }

    #[test]
    fn test_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("cache.db");

        {
            let _lock = FileLock::for_database(&db).unwrap();
        }
        assert!(FileLock::for_database(&db).is_ok());
    }
}
