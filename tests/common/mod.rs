#![allow(dead_code, missing_docs, clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use tokio::sync::Semaphore;

use sort_fuse::fs::backing::{BackingStore, FileReader};
use sort_fuse::fs::{BackingId, Entry, EntryKind, FsStats, InodePerms, VPath};

/// Build an entry with the given metadata. `mtime_secs` is seconds past the epoch.
pub fn make_entry(name: &str, kind: EntryKind, size: u64, mtime_secs: u64, ino: u64) -> Entry {
    Entry {
        name: OsString::from(name),
        kind,
        size,
        modified: SystemTime::UNIX_EPOCH + Duration::from_secs(mtime_secs),
        permissions: InodePerms::from_mode(0o644),
        uid: 1000,
        gid: 1000,
        nlink: 1,
        id: BackingId { dev: 1, ino },
    }
}

pub fn file(name: &str, size: u64) -> Entry {
    make_entry(name, EntryKind::File, size, 0, 0)
}

pub fn vpath(s: &str) -> VPath {
    VPath::parse(s).unwrap()
}

pub fn names(entries: &[Entry]) -> Vec<&str> {
    entries.iter().map(|e| e.name.to_str().unwrap()).collect()
}

#[derive(Debug, Clone)]
enum Node {
    Dir,
    File(Bytes),
    Symlink(OsString),
}

struct State {
    nodes: HashMap<VPath, (Entry, Node)>,
    next_ino: u64,
    /// errno returned by the next `list`, then cleared.
    list_error: Option<i32>,
    /// Number of upcoming `list` calls that report their first entry twice.
    duplicate_lists: usize,
}

/// An in-memory [`BackingStore`] with call counters and a gate for holding
/// `list` calls mid-flight.
#[derive(Clone)]
pub struct MockBacking {
    state: Arc<Mutex<State>>,
    pub list_calls: Arc<AtomicUsize>,
    pub stat_calls: Arc<AtomicUsize>,
    gate: Arc<Mutex<Option<Arc<Semaphore>>>>,
}

impl Default for MockBacking {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBacking {
    /// A store containing only the root directory.
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            VPath::root(),
            (make_entry("", EntryKind::Directory, 0, 0, 1), Node::Dir),
        );
        Self {
            state: Arc::new(Mutex::new(State {
                nodes,
                next_ino: 2,
                list_error: None,
                duplicate_lists: 0,
            })),
            list_calls: Arc::new(AtomicUsize::new(0)),
            stat_calls: Arc::new(AtomicUsize::new(0)),
            gate: Arc::new(Mutex::new(None)),
        }
    }

    fn insert(&self, path: &str, kind: EntryKind, size: u64, mtime_secs: u64, node: Node) {
        let path = vpath(path);
        let name = path.file_name().unwrap().to_str().unwrap().to_owned();
        let mut state = self.state.lock().unwrap();
        let ino = state.next_ino;
        state.next_ino += 1;
        let entry = make_entry(&name, kind, size, mtime_secs, ino);
        state.nodes.insert(path, (entry, node));
    }

    pub fn add_dir(&self, path: &str) {
        self.insert(path, EntryKind::Directory, 0, 0, Node::Dir);
    }

    pub fn add_file(&self, path: &str, contents: &[u8], mtime_secs: u64) {
        self.insert(
            path,
            EntryKind::File,
            contents.len() as u64,
            mtime_secs,
            Node::File(Bytes::copy_from_slice(contents)),
        );
    }

    pub fn add_sized(&self, path: &str, size: u64) {
        self.add_file(path, &vec![b'x'; size as usize], 0);
    }

    pub fn add_symlink(&self, path: &str, target: &str) {
        self.insert(
            path,
            EntryKind::Symlink,
            target.len() as u64,
            0,
            Node::Symlink(OsString::from(target)),
        );
    }

    pub fn remove(&self, path: &str) {
        self.state.lock().unwrap().nodes.remove(&vpath(path));
    }

    pub fn fail_next_list(&self, errno: i32) {
        self.state.lock().unwrap().list_error = Some(errno);
    }

    pub fn duplicate_next_lists(&self, count: usize) {
        self.state.lock().unwrap().duplicate_lists = count;
    }

    /// Make every subsequent `list` wait for a permit from the returned semaphore.
    pub fn hold_lists(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn release_lists(&self) {
        if let Some(gate) = self.gate.lock().unwrap().take() {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    pub fn lists(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` `list` calls have started, counting from
    /// construction. Panics after five seconds.
    pub async fn wait_for_lists(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.lists() < count {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("backing list call never started");
    }

    pub fn stats(&self) -> usize {
        self.stat_calls.load(Ordering::SeqCst)
    }

    fn enoent() -> std::io::Error {
        std::io::Error::from_raw_os_error(libc::ENOENT)
    }
}

pub struct MockReader {
    data: Bytes,
}

impl FileReader for MockReader {
    async fn read(&self, offset: u64, size: u32) -> Result<Bytes, std::io::Error> {
        let len = self.data.len();
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(len);
        let end = start.saturating_add(size as usize).min(len);
        Ok(self.data.slice(start..end))
    }
}

impl BackingStore for MockBacking {
    type Reader = MockReader;

    async fn stat(&self, path: &VPath) -> Result<Entry, std::io::Error> {
        self.stat_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        state
            .nodes
            .get(path)
            .map(|(entry, _)| entry.clone())
            .ok_or_else(Self::enoent)
    }

    async fn list(&self, path: &VPath) -> Result<Vec<Entry>, std::io::Error> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await.unwrap().forget();
        }

        let mut state = self.state.lock().unwrap();
        if let Some(errno) = state.list_error.take() {
            return Err(std::io::Error::from_raw_os_error(errno));
        }
        match state.nodes.get(path) {
            Some((_, Node::Dir)) => {}
            Some(_) => return Err(std::io::Error::from_raw_os_error(libc::ENOTDIR)),
            None => return Err(Self::enoent()),
        }
        let mut entries: Vec<Entry> = state
            .nodes
            .iter()
            .filter(|(p, _)| p.parent().as_ref() == Some(path))
            .map(|(_, (entry, _))| entry.clone())
            .collect();
        if state.duplicate_lists > 0 {
            state.duplicate_lists -= 1;
            if let Some(first) = entries.first().cloned() {
                entries.push(first);
            }
        }
        Ok(entries)
    }

    async fn open(&self, path: &VPath, expected: &Entry) -> Result<MockReader, std::io::Error> {
        let state = self.state.lock().unwrap();
        match state.nodes.get(path) {
            Some((entry, Node::File(data))) if entry.id == expected.id => Ok(MockReader {
                data: data.clone(),
            }),
            Some((_, Node::File(_))) => Err(std::io::Error::from_raw_os_error(libc::ESTALE)),
            Some(_) => Err(std::io::Error::from_raw_os_error(libc::EISDIR)),
            None => Err(Self::enoent()),
        }
    }

    async fn read_link(&self, path: &VPath) -> Result<OsString, std::io::Error> {
        let state = self.state.lock().unwrap();
        match state.nodes.get(path) {
            Some((_, Node::Symlink(target))) => Ok(target.clone()),
            Some(_) => Err(std::io::Error::from_raw_os_error(libc::EINVAL)),
            None => Err(Self::enoent()),
        }
    }

    async fn statfs(&self) -> Result<FsStats, std::io::Error> {
        let state = self.state.lock().unwrap();
        Ok(FsStats {
            block_size: 4096,
            fragment_size: 4096,
            total_blocks: 1000,
            free_blocks: 500,
            available_blocks: 400,
            total_inodes: 100,
            free_inodes: 100 - state.nodes.len() as u64,
            max_filename_length: 255,
        })
    }
}

pub fn os(s: &str) -> &OsStr {
    OsStr::new(s)
}
