use std::fs;
use std::io::{self, ErrorKind};
use std::path::Path;
use std::time::{Duration, SystemTime};

/// What a PID file currently says.
#[derive(Debug, PartialEq, Eq)]
pub enum PidFile {
    Missing,
    Pid(u32),
    /// Present but empty or not a number.
    Garbled(String),
}

pub fn read(path: &Path) -> io::Result<PidFile> {
    match fs::read_to_string(path) {
        Ok(contents) => {
            let trimmed = contents.trim();
            Ok(match trimmed.parse::<u32>() {
                Ok(pid) if pid > 0 => PidFile::Pid(pid),
                _ => PidFile::Garbled(trimmed.to_string()),
            })
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(PidFile::Missing),
        Err(e) => Err(e),
    }
}

pub fn write(path: &Path, pid: u32) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, pid.to_string())
}

/// Remove the file, treating "already gone" as success.
pub fn remove(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Time since the PID file was last written.
pub fn age(path: &Path) -> Option<Duration> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_states() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm.pid");

        assert_eq!(read(&path).unwrap(), PidFile::Missing);

        write(&path, 4242).unwrap();
        assert_eq!(read(&path).unwrap(), PidFile::Pid(4242));

        fs::write(&path, " 17\n").unwrap();
        assert_eq!(read(&path).unwrap(), PidFile::Pid(17));

        fs::write(&path, "").unwrap();
        assert_eq!(read(&path).unwrap(), PidFile::Garbled(String::new()));

        fs::write(&path, "qemu").unwrap();
        assert_eq!(read(&path).unwrap(), PidFile::Garbled("qemu".into()));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/vm.pid");
        write(&path, 1).unwrap();
        remove(&path).unwrap();
        remove(&path).unwrap();
        assert!(!path.exists());
        assert!(age(&path).is_none());
    }
}
