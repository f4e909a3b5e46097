//! The flat file store behind the file-related system calls.
//!
//! The kernel consumes files through a deliberately narrow interface:
//! create, remove, open, and per-handle read/write/seek/tell/length/
//! reopen. Everything lives in RAM. The store itself is not
//! thread-aware; callers serialize through [`FS_LOCK`], the one global
//! filesystem lock.

pub mod file;

pub use file::File;

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use lazy_static::lazy_static;
use spin::Mutex;

use crate::threads::sync::Lock;
use file::FileNode;

/// Longest accepted file name.
pub const NAME_MAX: usize = 128;

/// Serializes every filesystem operation. Callers of this module's
/// functions must hold it.
pub static FS_LOCK: Lock = Lock::new();

pub struct FileStore {
    files: BTreeMap<String, Arc<Mutex<FileNode>>>,
}

impl FileStore {
    pub fn new() -> FileStore {
        FileStore {
            files: BTreeMap::new(),
        }
    }

    /// Creates `name` with `size` zero bytes. False if it exists or
    /// the name is unusable.
    pub fn create(&mut self, name: &str, size: usize) -> bool {
        if name.is_empty() || name.len() > NAME_MAX || self.files.contains_key(name) {
            return false;
        }
        self.files
            .insert(String::from(name), Arc::new(Mutex::new(FileNode::with_size(size))));
        true
    }

    /// Unlinks `name`. Open handles keep working on the orphaned node.
    pub fn remove(&mut self, name: &str) -> bool {
        self.files.remove(name).is_some()
    }

    pub fn open(&self, name: &str) -> Option<File> {
        self.files.get(name).map(|node| File::open_node(node.clone()))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.files.contains_key(name)
    }
}

lazy_static! {
    static ref STORE: Mutex<FileStore> = Mutex::new(FileStore::new());
}

pub fn create(name: &str, size: usize) -> bool {
    STORE.lock().create(name, size)
}

pub fn remove(name: &str) -> bool {
    STORE.lock().remove(name)
}

pub fn open(name: &str) -> Option<File> {
    STORE.lock().open(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_open_read_write() {
        let mut store = FileStore::new();
        assert!(store.create("hello.txt", 0));
        assert!(!store.create("hello.txt", 0));
        assert!(!store.create("", 0));

        let mut f = store.open("hello.txt").unwrap();
        assert_eq!(f.write(b"hello world"), 11);
        assert_eq!(f.len(), 11);

        let mut g = store.open("hello.txt").unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(g.read(&mut buf), 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(g.tell(), 5);
        g.seek(6);
        assert_eq!(g.read(&mut buf), 5);
        assert_eq!(&buf, b"world");
        assert_eq!(g.read(&mut buf), 0);
    }

    #[test]
    fn create_with_initial_size_is_zero_filled() {
        let mut store = FileStore::new();
        assert!(store.create("blob", 100));
        let f = store.open("blob").unwrap();
        assert_eq!(f.len(), 100);
        let mut buf = [0xFFu8; 100];
        assert_eq!(f.read_at(0, &mut buf), 100);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn removed_file_stays_open() {
        let mut store = FileStore::new();
        store.create("doomed", 0);
        let mut f = store.open("doomed").unwrap();
        f.write(b"still here");
        assert!(store.remove("doomed"));
        assert!(store.open("doomed").is_none());
        assert!(!store.remove("doomed"));

        let mut buf = [0u8; 10];
        assert_eq!(f.read_at(0, &mut buf), 10);
        assert_eq!(&buf, b"still here");
    }

    #[test]
    fn reopen_resets_position_only() {
        let mut store = FileStore::new();
        store.create("f", 0);
        let mut a = store.open("f").unwrap();
        a.write(b"abcdef");
        let mut b = a.reopen();
        assert_eq!(b.tell(), 0);
        let mut buf = [0u8; 3];
        assert_eq!(b.read(&mut buf), 3);
        assert_eq!(&buf, b"abc");
    }

    #[test]
    fn deny_write_blocks_every_handle() {
        let mut store = FileStore::new();
        store.create("prog", 0);
        let mut exec_handle = store.open("prog").unwrap();
        exec_handle.write(b"code");
        exec_handle.deny_write();

        let mut other = store.open("prog").unwrap();
        assert_eq!(other.write(b"overwrite"), 0);
        assert_eq!(exec_handle.len(), 4);

        // Dropping the denying handle lifts the protection.
        drop(exec_handle);
        assert_eq!(other.write(b"overwrite"), 9);
    }

    #[test]
    fn read_at_respects_eof() {
        let mut store = FileStore::new();
        store.create("short", 4);
        let f = store.open("short").unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(f.read_at(2, &mut buf), 2);
        assert_eq!(f.read_at(4, &mut buf), 0);
        assert_eq!(f.read_at(100, &mut buf), 0);
    }
}
