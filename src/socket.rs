//! Socket setup: the listening socket clients connect to, the socket pair
//! handed to a spawned client, and an upstream socket inherited through
//! `WAYLAND_SOCKET`.

use std::ffi::OsStr;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command};

use rustix::fs::{flock, FlockOperation};
use rustix::io::{fcntl_getfd, fcntl_setfd, Errno, FdFlags};
use thiserror::Error;

/// Appended to the socket path to name its lock file
const LOCK_SUFFIX: &str = ".lock";

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("unable to open lock file {path}: {source}")]
    LockFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unable to lock {lock}, maybe another instance is already running")]
    AlreadyRunning { lock: PathBuf },

    #[error("unable to lock {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unable to stat {path}: {source}")]
    Stat {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unable to bind {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to create socket pair: {0}")]
    SocketPair(#[source] io::Error),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("WAYLAND_SOCKET is not a descriptor number: '{0}'")]
    InvalidInherited(String),

    #[error("WAYLAND_SOCKET descriptor {fd} is unusable: {source}")]
    Inherited {
        fd: RawFd,
        #[source]
        source: io::Error,
    },
}

// =============================================================================
// Listening Socket
// =============================================================================

/// A bound, non-blocking listening socket guarded by a lock file.
///
/// Both the socket and its lock file are removed on drop.
#[derive(Debug)]
pub struct ListenSocket {
    listener: UnixListener,
    path: PathBuf,
    lock_path: PathBuf,
    _lock: File,
}

impl ListenSocket {
    /// Lock `path` and bind a listener on it.
    ///
    /// A leftover socket from an earlier run is replaced when the lock is
    /// free. Fails with [`SocketError::AlreadyRunning`] when another process
    /// holds the lock.
    pub fn bind(path: &Path) -> Result<Self, SocketError> {
        let mut lock_name = path.as_os_str().to_owned();
        lock_name.push(LOCK_SUFFIX);
        let lock_path = PathBuf::from(lock_name);

        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o660)
            .open(&lock_path)
            .map_err(|source| SocketError::LockFile {
                path: lock_path.clone(),
                source,
            })?;

        match flock(&lock, FlockOperation::NonBlockingLockExclusive) {
            Ok(()) => {}
            Err(Errno::WOULDBLOCK) => return Err(SocketError::AlreadyRunning { lock: lock_path }),
            Err(e) => {
                return Err(SocketError::Lock {
                    path: lock_path,
                    source: e.into(),
                })
            }
        }

        remove_stale_socket(path)?;

        let listener = UnixListener::bind(path)
            .and_then(|listener| {
                listener.set_nonblocking(true)?;
                Ok(listener)
            })
            .map_err(|source| SocketError::Bind {
                path: path.to_path_buf(),
                source,
            })?;

        log::debug!("[SOCKET] Bound {} (lock {})", path.display(), lock_path.display());
        Ok(Self {
            listener,
            path: path.to_path_buf(),
            lock_path,
            _lock: lock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept one pending client. `Ok(None)` when none is waiting.
    pub fn accept(&self) -> io::Result<Option<UnixStream>> {
        match self.listener.accept() {
            Ok((stream, _addr)) => Ok(Some(stream)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl AsFd for ListenSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.listener.as_fd()
    }
}

impl Drop for ListenSocket {
    fn drop(&mut self) {
        for path in [&self.path, &self.lock_path] {
            if let Err(e) = std::fs::remove_file(path) {
                log::debug!("[SOCKET] Failed to remove {}: {}", path.display(), e);
            }
        }
    }
}

/// Remove a socket left behind at `path` if it is owner or group writable.
fn remove_stale_socket(path: &Path) -> Result<(), SocketError> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(source) => {
            return Err(SocketError::Stat {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    if metadata.permissions().mode() & 0o220 != 0 {
        log::debug!("[SOCKET] Removing stale socket {}", path.display());
        std::fs::remove_file(path).map_err(|source| SocketError::Bind {
            path: path.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}

// =============================================================================
// Spawned Client
// =============================================================================

/// Run `program` with one end of a fresh socket pair exported as
/// `WAYLAND_SOCKET`. Returns our end and the child.
pub fn spawn_client(program: &OsStr, args: &[impl AsRef<OsStr>]) -> Result<(UnixStream, Child), SocketError> {
    let (ours, theirs) = UnixStream::pair().map_err(SocketError::SocketPair)?;

    // The child's end has to survive exec
    fcntl_setfd(&theirs, FdFlags::empty()).map_err(|e| SocketError::SocketPair(e.into()))?;

    let child = Command::new(program)
        .args(args)
        .env("WAYLAND_SOCKET", theirs.as_raw_fd().to_string())
        .spawn()
        .map_err(|source| SocketError::Spawn {
            program: program.to_string_lossy().into_owned(),
            source,
        })?;

    log::info!(
        "Spawned {} (pid {}) on fd {}",
        program.to_string_lossy(),
        child.id(),
        theirs.as_raw_fd()
    );
    Ok((ours, child))
}

// =============================================================================
// Inherited Socket
// =============================================================================

/// Take ownership of the descriptor named by a `WAYLAND_SOCKET` value.
///
/// The descriptor is checked to be open and marked close-on-exec so it is
/// not leaked into programs we spawn.
pub fn inherited_socket(value: &str) -> Result<UnixStream, SocketError> {
    let fd: RawFd = value
        .trim()
        .parse()
        .ok()
        .filter(|fd| *fd >= 0)
        .ok_or_else(|| SocketError::InvalidInherited(value.to_owned()))?;

    // SAFETY: only used for the two fcntl calls below; an fd that is not
    // open makes them fail with EBADF.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let flags = fcntl_getfd(borrowed).map_err(|e| SocketError::Inherited { fd, source: e.into() })?;
    fcntl_setfd(borrowed, flags | FdFlags::CLOEXEC)
        .map_err(|e| SocketError::Inherited { fd, source: e.into() })?;

    // SAFETY: the descriptor is open and WAYLAND_SOCKET hands it to us
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
    Ok(UnixStream::from(owned))
}

// =============================================================================
// Tests
// =============================================================================
