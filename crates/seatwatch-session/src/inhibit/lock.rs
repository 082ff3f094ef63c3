//! A held inhibitor lock.

use std::io;
use std::os::fd::{AsFd, BorrowedFd, IntoRawFd, OwnedFd};

/// File descriptor returned by logind's `Inhibit` call.
///
/// The inhibition lasts until this descriptor and every duplicate of it
/// are closed. Dropping the lock closes it; [`release`](Self::release)
/// does the same but reports the close error.
#[derive(Debug)]
pub struct InhibitLock {
    fd: Option<OwnedFd>,
}

impl InhibitLock {
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd: Some(fd) }
    }

    /// Borrows the descriptor, e.g. to hand a duplicate to a child process.
    pub fn fd(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(AsFd::as_fd)
    }

    /// Whether the descriptor is still open.
    pub fn is_held(&self) -> bool {
        self.fd.is_some()
    }

    /// Releases the lock.
    ///
    /// # Errors
    ///
    /// Returns the OS error from `close(2)`.
    pub fn release(mut self) -> io::Result<()> {
        self.close_fd()
    }

    fn close_fd(&mut self) -> io::Result<()> {
        let Some(fd) = self.fd.take() else {
            return Ok(());
        };

        let raw = fd.into_raw_fd();
        // SAFETY: `raw` came from an OwnedFd we just gave up, so nothing else closes it.
        if unsafe { libc::close(raw) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for InhibitLock {
    fn drop(&mut self) {
        let _ = self.close_fd();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    fn dev_null() -> OwnedFd {
        OwnedFd::from(std::fs::File::open("/dev/null").unwrap())
    }

    fn is_open(raw: i32) -> bool {
        unsafe { libc::fcntl(raw, libc::F_GETFD) != -1 }
    }

    #[test]
    fn test_release_closes_descriptor() {
        let lock = InhibitLock::new(dev_null());
        let raw = lock.fd().unwrap().as_raw_fd();
        assert!(is_open(raw));
        assert!(lock.is_held());

        lock.release().unwrap();
        assert!(!is_open(raw));
    }

    #[test]
    fn test_drop_closes_descriptor() {
        let lock = InhibitLock::new(dev_null());
        let raw = lock.fd().unwrap().as_raw_fd();
        drop(lock);
        assert!(!is_open(raw));
    }
}
