// LININOIO ETHERD — POLL MULTIPLEXER
// Thin registry over poll(2). One entry per watched descriptor with a
// caller-chosen tag; the main loop matches on tags to dispatch. Descriptors
// are watched for read-readiness only, which is all the daemon needs.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

pub struct PollSet<T> {
    fds: Vec<libc::pollfd>,
    tags: Vec<T>,
}

impl<T: Copy> PollSet<T> {
    pub fn new() -> Self {
        PollSet {
            fds: Vec::new(),
            tags: Vec::new(),
        }
    }

    pub fn add(&mut self, fd: RawFd, tag: T) {
        self.fds.push(libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        });
        self.tags.push(tag);
    }

    /// Drop a descriptor from the set. The caller owns the fd itself.
    pub fn remove(&mut self, fd: RawFd) {
        if let Some(i) = self.fds.iter().position(|p| p.fd == fd) {
            self.fds.swap_remove(i);
            self.tags.swap_remove(i);
        }
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// Block until readiness or `timeout` (None = indefinitely). Appends the
    /// tags of readable descriptors to `ready`. EINTR surfaces as 0 ready.
    pub fn wait(&mut self, timeout: Option<Duration>, ready: &mut Vec<T>) -> io::Result<usize> {
        let ms: libc::c_int = match timeout {
            // poll rounds down; +1 so we never spin before a deadline.
            Some(t) => t.as_millis().min(i32::MAX as u128 - 1) as libc::c_int + 1,
            None => -1,
        };
        let rc = unsafe { libc::poll(self.fds.as_mut_ptr(), self.fds.len() as libc::nfds_t, ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }
        let mut n = 0;
        for (p, tag) in self.fds.iter().zip(&self.tags) {
            if p.revents & (libc::POLLIN | libc::POLLERR | libc::POLLHUP) != 0 {
                ready.push(*tag);
                n += 1;
            }
        }
        Ok(n)
    }
}

impl<T: Copy> Default for PollSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn reports_readable_tag() {
        let (mut a, b) = UnixStream::pair().unwrap();
        let mut set = PollSet::new();
        set.add(b.as_raw_fd(), 7u32);
        a.write_all(b"x").unwrap();
        let mut ready = Vec::new();
        let n = set.wait(Some(Duration::from_millis(100)), &mut ready).unwrap();
        assert_eq!(n, 1);
        assert_eq!(ready, vec![7]);
    }

    #[test]
    fn times_out_with_nothing_ready() {
        let (_a, b) = UnixStream::pair().unwrap();
        let mut set = PollSet::new();
        set.add(b.as_raw_fd(), 1u8);
        let mut ready = Vec::new();
        let n = set.wait(Some(Duration::from_millis(10)), &mut ready).unwrap();
        assert_eq!(n, 0);
        assert!(ready.is_empty());
    }

    #[test]
    fn remove_unwatches() {
        let (mut a, b) = UnixStream::pair().unwrap();
        let mut set = PollSet::new();
        set.add(b.as_raw_fd(), 1u8);
        set.remove(b.as_raw_fd());
        a.write_all(b"x").unwrap();
        let mut ready = Vec::new();
        set.wait(Some(Duration::from_millis(10)), &mut ready).unwrap();
        assert!(ready.is_empty());
        assert!(set.is_empty());
    }
}
