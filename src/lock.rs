//! Exclusive operator lock
//!
//! The proxy configuration file is the only state store, so two operators running at
//! once could both read the same routes, hand out the same port, and the later save
//! would drop the other's route. Holding this lock across load-mutate-save rules that out.

use std::path::{Path, PathBuf};

/// Lock file handle; the lock is released when this is dropped
#[derive(Debug)]
pub struct StoreLock {
    path: PathBuf,
    _file: std::fs::File,
}

impl StoreLock {
    /// Lock file used for a given proxy configuration file
    pub fn path_for(config_file: &Path) -> PathBuf {
        let mut name = config_file
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        config_file.with_file_name(name)
    }

    /// Take the lock without blocking; fails if another process holds it
    pub fn acquire(config_file: &Path) -> anyhow::Result<Self> {
        let path = Self::path_for(config_file);
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| anyhow::anyhow!("Failed to open lock file {}: {}", path.display(), e))?;

        try_lock(&file).map_err(|e| {
            if e.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::anyhow!(
                    "Another labgate process is modifying {} (lock {} is held)",
                    config_file.display(),
                    path.display()
                )
            } else {
                anyhow::anyhow!("Failed to lock {}: {}", path.display(), e)
            }
        })?;

        Ok(Self { path, _file: file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn try_lock(file: &std::fs::File) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let fd = file.as_raw_fd();
    let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
    if result != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn try_lock(_file: &std::fs::File) -> std::io::Result<()> {
    Ok(())
}
