//! Ordered file-descriptor map used to assemble a child's descriptor table.
//!
//! Every entry binds an owned source descriptor (or a "silence" placeholder)
//! to a destination number in the child. Ownership is explicit: `take`
//! transfers in, `steal` transfers out, `get` hands back a duplicate, and
//! `steal_from` moves a whole map while rejecting overlapping destinations.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use rustix::pipe::PipeFlags;

use crate::error::AgentError;

#[derive(Debug)]
struct Entry {
    /// `None` both for a slot whose FD was stolen and for an explicit
    /// "silence this destination" binding.
    source: Option<OwnedFd>,
    dest: i32,
}

/// Ordered sequence of `(source, dest)` descriptor bindings.
#[derive(Debug, Default)]
pub struct FdMap {
    entries: Vec<Entry>,
}

impl FdMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Transfers ownership of `source` into the map at `dest`.
    ///
    /// `None` silences the destination. An existing binding for `dest` is
    /// replaced and its previously-held descriptor closed.
    pub fn take(&mut self, source: Option<OwnedFd>, dest: i32) {
        debug_assert!(dest >= 0);

        for entry in &mut self.entries {
            if entry.dest == dest {
                entry.source = source;
                return;
            }
        }

        self.entries.push(Entry { source, dest });
    }

    /// Non-transfer read by position.
    pub fn peek(&self, index: usize) -> (Option<BorrowedFd<'_>>, i32) {
        let entry = &self.entries[index];
        (entry.source.as_ref().map(|fd| fd.as_fd()), entry.dest)
    }

    /// Duplicates the descriptor at `index` for inspection.
    ///
    /// Fails with [`AgentError::Closed`] when the slot has been stolen.
    #[allow(dead_code)]
    pub fn get(&self, index: usize) -> Result<OwnedFd, AgentError> {
        let entry = &self.entries[index];
        let Some(source) = entry.source.as_ref() else {
            return Err(AgentError::Closed(index));
        };
        Ok(rustix::io::fcntl_dupfd_cloexec(source, 0)?)
    }

    /// Transfers ownership out of the slot at `index`.
    pub fn steal(&mut self, index: usize) -> (Option<OwnedFd>, i32) {
        let entry = &mut self.entries[index];
        (entry.source.take(), entry.dest)
    }

    /// Moves every binding from `other` into `self`.
    ///
    /// Fails with [`AgentError::OverlappingFd`] if both maps hold a live
    /// descriptor for the same destination; `other` holds no live
    /// descriptors afterward on success.
    pub fn steal_from(&mut self, other: &mut FdMap) -> Result<(), AgentError> {
        for i in 0..other.entries.len() {
            if other.entries[i].source.is_some() {
                let dest = other.entries[i].dest;
                for entry in &self.entries {
                    if entry.dest == dest && entry.source.is_some() {
                        return Err(AgentError::OverlappingFd(dest));
                    }
                }
            }

            let source = other.entries[i].source.take();
            let dest = other.entries[i].dest;
            self.take(source, dest);
        }

        Ok(())
    }

    /// Opens a pipe pair wired to `dest_read`/`dest_write` in the child and
    /// returns the parent's `(read, write)` ends, set non-blocking.
    #[allow(dead_code)]
    pub fn create_stream(
        &mut self,
        dest_read: i32,
        dest_write: i32,
    ) -> Result<(OwnedFd, OwnedFd), AgentError> {
        debug_assert!(dest_read >= 0);
        debug_assert!(dest_write >= 0);

        let (child_read, parent_write) = rustix::pipe::pipe_with(PipeFlags::CLOEXEC)?;
        let (parent_read, child_write) = rustix::pipe::pipe_with(PipeFlags::CLOEXEC)?;

        self.take(Some(child_read), dest_read);
        self.take(Some(child_write), dest_write);

        rustix::io::ioctl_fionbio(&parent_read, true)?;
        rustix::io::ioctl_fionbio(&parent_write, true)?;

        Ok((parent_read, parent_write))
    }

    fn isatty_for_dest(&self, dest: i32) -> bool {
        for entry in &self.entries {
            if entry.dest == dest {
                return entry
                    .source
                    .as_ref()
                    .map(rustix::termios::isatty)
                    .unwrap_or(false);
            }
        }
        false
    }

    pub fn stdin_isatty(&self) -> bool {
        self.isatty_for_dest(0)
    }

    pub fn stdout_isatty(&self) -> bool {
        self.isatty_for_dest(1)
    }

    pub fn stderr_isatty(&self) -> bool {
        self.isatty_for_dest(2)
    }

    /// Highest destination FD in the map, never less than 2.
    pub fn max_dest_fd(&self) -> i32 {
        let mut max = 2;
        for entry in &self.entries {
            if entry.dest > max {
                max = entry.dest;
            }
        }
        max
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::os::fd::AsRawFd;

    use super::*;

    fn pipe_fds() -> (OwnedFd, OwnedFd) {
        rustix::pipe::pipe_with(PipeFlags::CLOEXEC).unwrap()
    }

    #[test]
    fn test_take_replaces_binding() {
        let mut map = FdMap::new();
        let (r1, _w1) = pipe_fds();
        let (r2, _w2) = pipe_fds();

        map.take(Some(r1), 3);
        map.take(Some(r2), 3);
        assert_eq!(map.len(), 1);

        // The second take closed the first source; only one live entry.
        let (source, dest) = map.peek(0);
        assert!(source.is_some());
        assert_eq!(dest, 3);
    }

    #[test]
    fn test_steal_leaves_empty_slot() {
        let mut map = FdMap::new();
        let (r, _w) = pipe_fds();
        let raw = r.as_raw_fd();

        map.take(Some(r), 0);
        let (stolen, dest) = map.steal(0);
        assert_eq!(dest, 0);
        assert_eq!(stolen.unwrap().as_raw_fd(), raw);

        let (source, _) = map.peek(0);
        assert!(source.is_none());
        assert!(matches!(map.get(0), Err(AgentError::Closed(0))));
    }

    #[test]
    fn test_get_returns_duplicate() {
        let mut map = FdMap::new();
        let (r, w) = pipe_fds();
        map.take(Some(r), 0);

        let dup = map.get(0).unwrap();
        let mut w = std::fs::File::from(w);
        w.write_all(b"x").unwrap();
        drop(w);

        let mut buf = [0u8; 1];
        let mut file = std::fs::File::from(dup);
        file.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"x");

        // The original stays live.
        assert!(map.get(0).is_ok());
    }

    #[test]
    fn test_steal_from_rejects_overlap() {
        let mut a = FdMap::new();
        let mut b = FdMap::new();
        let (r1, _w1) = pipe_fds();
        let (r2, _w2) = pipe_fds();

        a.take(Some(r1), 1);
        b.take(Some(r2), 1);

        assert!(matches!(
            a.steal_from(&mut b),
            Err(AgentError::OverlappingFd(1))
        ));
    }

    #[test]
    fn test_steal_from_disjoint_dests() {
        let mut a = FdMap::new();
        let mut b = FdMap::new();
        let (r1, _w1) = pipe_fds();
        let (r2, _w2) = pipe_fds();

        a.take(Some(r1), 1);
        b.take(Some(r2), 2);

        a.steal_from(&mut b).unwrap();
        assert_eq!(a.len(), 2);
        assert!(a.get(0).is_ok());
        assert!(a.get(1).is_ok());

        // b's entries survive but hold nothing.
        let (source, _) = b.peek(0);
        assert!(source.is_none());
    }

    #[test]
    fn test_max_dest_fd_floor() {
        let mut map = FdMap::new();
        assert_eq!(map.max_dest_fd(), 2);

        let (r, _w) = pipe_fds();
        map.take(Some(r), 7);
        assert_eq!(map.max_dest_fd(), 7);
    }

    #[test]
    fn test_create_stream_round_trip() {
        let mut map = FdMap::new();
        let (parent_read, parent_write) = map.create_stream(0, 1).unwrap();
        assert_eq!(map.len(), 2);

        // Write through the map's stdin end, read it back from the child
        // side to prove the plumbing is crossed correctly.
        let (child_stdin, _) = map.steal(0);
        let mut writer = std::fs::File::from(parent_write);
        writer.write_all(b"ping").unwrap();
        drop(writer);

        let mut buf = [0u8; 4];
        let mut reader = std::fs::File::from(child_stdin.unwrap());
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        drop(parent_read);
    }

    #[test]
    fn test_isatty_probes() {
        let mut map = FdMap::new();
        let (r, _w) = pipe_fds();
        map.take(Some(r), 0);
        assert!(!map.stdin_isatty());
        assert!(!map.stdout_isatty());

        let consumer = crate::pty::create_consumer().unwrap();
        let producer = crate::pty::create_producer(consumer.as_fd()).unwrap();
        map.take(Some(producer), 1);
        assert!(map.stdout_isatty());
    }
}
