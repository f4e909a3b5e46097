use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

/// Shared contents of one file. Handles keep nodes alive, so a file
/// removed from the namespace stays readable and writable through
/// every handle already open on it.
pub struct FileNode {
    pub(super) data: Vec<u8>,
    /// While positive, writes through any handle are refused. Used to
    /// protect executables that are currently running.
    deny_write: u32,
}

impl FileNode {
    pub(super) fn with_size(size: usize) -> FileNode {
        let mut data = Vec::new();
        data.resize(size, 0);
        FileNode {
            data,
            deny_write: 0,
        }
    }
}

/// An open file: a shared node plus this handle's position.
pub struct File {
    node: Arc<Mutex<FileNode>>,
    pos: usize,
    denying: bool,
}

impl File {
    pub(super) fn open_node(node: Arc<Mutex<FileNode>>) -> File {
        File {
            node,
            pos: 0,
            denying: false,
        }
    }

    /// A fresh handle on the same file, positioned at the start.
    pub fn reopen(&self) -> File {
        File::open_node(self.node.clone())
    }

    pub fn len(&self) -> usize {
        self.node.lock().data.len()
    }

    /// Reads from the handle position, advancing it. Short counts at
    /// end of file; zero at or past it.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = self.read_at(self.pos, buf);
        self.pos += n;
        n
    }

    /// Reads at an absolute offset without touching the position.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        let node = self.node.lock();
        if offset >= node.data.len() {
            return 0;
        }
        let n = buf.len().min(node.data.len() - offset);
        buf[..n].copy_from_slice(&node.data[offset..offset + n]);
        n
    }

    /// Writes at the handle position, growing the file as needed.
    /// Returns 0 when writes are denied.
    pub fn write(&mut self, buf: &[u8]) -> usize {
        let n = self.write_at(self.pos, buf);
        self.pos += n;
        n
    }

    /// Writes at an absolute offset without touching the position.
    pub fn write_at(&self, offset: usize, buf: &[u8]) -> usize {
        let mut node = self.node.lock();
        if node.deny_write > 0 {
            return 0;
        }
        let end = offset + buf.len();
        if end > node.data.len() {
            node.data.resize(end, 0);
        }
        node.data[offset..end].copy_from_slice(buf);
        buf.len()
    }

    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    pub fn tell(&self) -> usize {
        self.pos
    }

    /// Refuses writes through every handle until this one allows them
    /// again (or is dropped).
    pub fn deny_write(&mut self) {
        if !self.denying {
            self.denying = true;
            self.node.lock().deny_write += 1;
        }
    }

    pub fn allow_write(&mut self) {
        if self.denying {
            self.denying = false;
            self.node.lock().deny_write -= 1;
        }
    }
}

impl Clone for File {
    /// Clones share the node but never the write denial.
    fn clone(&self) -> File {
        File {
            node: self.node.clone(),
            pos: self.pos,
            denying: false,
        }
    }
}

impl Drop for File {
    fn drop(&mut self) {
        self.allow_write();
    }
}
