//! In-memory files.
//!
//! The real file system sits behind the core, this module carries just
//! enough of its contract for file-backed pages and mmap regions: byte
//! reads and writes at a cursor, and `reopen`, which yields an
//! independent cursor over the same file identity. Mmap depends on that
//! so its backing survives a user-level close of the original handle.

use core::cell::Cell;

use alloc::{sync::Arc, vec::Vec};

use crate::utils::locks::SpinLock;

#[derive(Debug)]
struct Inode {
    data: SpinLock<Vec<u8>>,
}

#[derive(Debug)]
pub struct File {
    inode: Arc<Inode>,
    pos: Cell<usize>,
}

// the cursor is plain state private to whoever holds the handle, the
// shared inode behind it is lock protected
unsafe impl Send for File {}

impl File {
    /// creates a fresh file identity holding `contents`
    pub fn create(contents: &[u8]) -> Self {
        Self {
            inode: Arc::new(Inode {
                data: SpinLock::new(contents.to_vec()),
            }),
            pos: Cell::new(0),
        }
    }

    /// a new handle on the same file with its own cursor at zero
    pub fn reopen(&self) -> Self {
        Self {
            inode: self.inode.clone(),
            pos: Cell::new(0),
        }
    }

    /// duplicates the handle, cursor position included
    pub fn duplicate(&self) -> Self {
        Self {
            inode: self.inode.clone(),
            pos: Cell::new(self.pos.get()),
        }
    }

    /// true when both handles name the same file
    pub fn same_identity(&self, other: &File) -> bool {
        Arc::ptr_eq(&self.inode, &other.inode)
    }

    pub fn length(&self) -> usize {
        self.inode.data.lock().len()
    }

    pub fn seek(&self, pos: usize) {
        self.pos.set(pos);
    }

    pub fn tell(&self) -> usize {
        self.pos.get()
    }

    /// reads from the cursor, stopping at end of file
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let data = self.inode.data.lock();
        let pos = self.pos.get().min(data.len());
        let count = buf.len().min(data.len() - pos);
        buf[..count].copy_from_slice(&data[pos..pos + count]);
        self.pos.set(pos + count);
        count
    }

    /// writes at the cursor, growing the file when writing past the end
    pub fn write(&self, buf: &[u8]) -> usize {
        let mut data = self.inode.data.lock();
        let pos = self.pos.get();
        if pos + buf.len() > data.len() {
            data.resize(pos + buf.len(), 0);
        }
        data[pos..pos + buf.len()].copy_from_slice(buf);
        self.pos.set(pos + buf.len());
        buf.len()
    }

    /// snapshots the whole file, test observability helper
    pub fn snapshot(&self) -> Vec<u8> {
        self.inode.data.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::File;

    #[test]
    fn reopen_shares_identity_with_independent_cursor() {
        let file = File::create(b"hello world");
        let mut buf = [0u8; 5];
        assert_eq!(file.read(&mut buf), 5);
        assert_eq!(&buf, b"hello");

        let other = file.reopen();
        assert!(file.same_identity(&other));
        assert_eq!(other.tell(), 0);

        other.seek(6);
        assert_eq!(other.read(&mut buf), 5);
        assert_eq!(&buf, b"world");
        assert_eq!(file.tell(), 5);
    }

    #[test]
    fn writes_are_visible_through_every_handle() {
        let file = File::create(b"aaaa");
        let other = file.reopen();
        file.seek(2);
        file.write(b"XY");

        let mut buf = [0u8; 4];
        assert_eq!(other.read(&mut buf), 4);
        assert_eq!(&buf, b"aaXY");
    }

    #[test]
    fn read_stops_at_end_of_file() {
        let file = File::create(b"abc");
        file.seek(2);
        let mut buf = [0u8; 8];
        assert_eq!(file.read(&mut buf), 1);
        assert_eq!(file.read(&mut buf), 0);

        file.seek(10);
        assert_eq!(file.read(&mut buf), 0);
    }
}
