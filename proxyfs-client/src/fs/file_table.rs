// Copyright 2025 OPPO.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use proxyfs_common::proto::DEFAULT_BLOCK_SIZE;
use proxyfs_common::utils::now_ms;
use proxyfs_common::{Errno, FsError, FsResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub const INVALID_HANDLE: i32 = -1;

/// One open handle. The cache attaches by file id, so several entries may
/// share the same id; permission and path metadata stay per-handle.
#[derive(Debug)]
pub struct FileEntry {
    pub id: u64,
    pub block_size: u32,
    pub handle: i32,
    pub path: String,
    pub open_flags: i32,
    pub mode: u32,
    pub direct_io: bool,
    last_access_ms: AtomicU64,
}

impl FileEntry {
    pub fn new(id: u64, path: String, open_flags: i32, mode: u32) -> Self {
        Self {
            id,
            block_size: DEFAULT_BLOCK_SIZE,
            handle: INVALID_HANDLE,
            path,
            open_flags,
            mode,
            direct_io: open_flags & libc::O_DIRECT != 0,
            last_access_ms: AtomicU64::new(now_ms()),
        }
    }

    /// Bare entry for cache calls that have no open handle (e.g. truncate
    /// by path).
    pub fn simple(id: u64) -> Self {
        Self::new(id, String::new(), 0, 0)
    }

    pub fn touch(&self) {
        self.last_access_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn last_access_ms(&self) -> u64 {
        self.last_access_ms.load(Ordering::Relaxed)
    }
}

struct TableState {
    slots: Vec<Option<Arc<FileEntry>>>,
    next_free: usize,
    refs: HashMap<u64, u32>,
}

/// Fixed-size descriptor table. Descriptors are the smallest free slot
/// index; `refs` counts non-direct handles per file id so the caches know
/// when the last cached handle goes away.
pub struct FileHandleTable {
    state: Mutex<TableState>,
}

impl FileHandleTable {
    pub fn new(open_file_max: usize) -> Self {
        Self {
            state: Mutex::new(TableState {
                slots: vec![None; open_file_max],
                next_free: 0,
                refs: HashMap::new(),
            }),
        }
    }

    /// Installs an entry into the smallest free slot and returns it with
    /// its descriptor assigned.
    pub fn insert(&self, mut entry: FileEntry) -> FsResult<Arc<FileEntry>> {
        let mut st = self.state.lock().unwrap();

        if st.next_free >= st.slots.len() {
            return Err(FsError::Errno(Errno::EBADF));
        }

        let fd = st.next_free;
        debug_assert!(st.slots[fd].is_none());

        entry.handle = fd as i32;
        entry.touch();
        let entry = Arc::new(entry);

        if !entry.direct_io {
            *st.refs.entry(entry.id).or_insert(0) += 1;
        }

        st.slots[fd] = Some(entry.clone());
        st.next_free = Self::min_free(&st.slots, fd);

        Ok(entry)
    }

    fn min_free(slots: &[Option<Arc<FileEntry>>], from: usize) -> usize {
        let mut next = from;
        while next < slots.len() && slots[next].is_some() {
            next += 1;
        }
        next
    }

    pub fn get(&self, fd: i32) -> FsResult<Arc<FileEntry>> {
        let st = self.state.lock().unwrap();
        let entry = usize::try_from(fd)
            .ok()
            .and_then(|fd| st.slots.get(fd))
            .and_then(|slot| slot.as_ref())
            .ok_or(FsError::Errno(Errno::EBADF))?;

        entry.touch();
        Ok(entry.clone())
    }

    /// Releases the slot and drops the non-direct reference.
    pub fn close(&self, fd: i32) -> FsResult<Arc<FileEntry>> {
        let mut st = self.state.lock().unwrap();
        let idx = usize::try_from(fd).map_err(|_| FsError::Errno(Errno::EBADF))?;

        let entry = st
            .slots
            .get_mut(idx)
            .and_then(Option::take)
            .ok_or(FsError::Errno(Errno::EBADF))?;

        if !entry.direct_io {
            match st.refs.get_mut(&entry.id) {
                Some(1) => {
                    st.refs.remove(&entry.id);
                }
                Some(n) => *n -= 1,
                None => debug_assert!(false, "missing refcount for file {}", entry.id),
            }
        }

        if idx < st.next_free {
            st.next_free = idx;
        }

        Ok(entry)
    }

    /// True iff exactly one non-direct handle still references the file id.
    pub fn is_last_ref(&self, id: u64) -> bool {
        let st = self.state.lock().unwrap();
        st.refs.get(&id).copied() == Some(1)
    }

    #[cfg(test)]
    fn next_free(&self) -> usize {
        self.state.lock().unwrap().next_free
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u64, flags: i32) -> FileEntry {
        FileEntry::new(id, format!("/f{}", id), flags, 0o644)
    }

    #[test]
    fn test_smallest_free_allocation() {
        let table = FileHandleTable::new(4);
        let a = table.insert(entry(1, libc::O_RDWR)).unwrap();
        let b = table.insert(entry(2, libc::O_RDWR)).unwrap();
        let c = table.insert(entry(3, libc::O_RDWR)).unwrap();
        assert_eq!((a.handle, b.handle, c.handle), (0, 1, 2));

        // closing a middle slot makes it the next allocation target
        table.close(1).unwrap();
        assert_eq!(table.next_free(), 1);
        let d = table.insert(entry(4, libc::O_RDWR)).unwrap();
        assert_eq!(d.handle, 1);
        assert_eq!(table.next_free(), 3);
    }

    #[test]
    fn test_table_full() {
        let table = FileHandleTable::new(1);
        table.insert(entry(1, libc::O_RDWR)).unwrap();
        let err = table.insert(entry(2, libc::O_RDWR)).unwrap_err();
        assert_eq!(err, FsError::Errno(Errno::EBADF));
    }

    #[test]
    fn test_refcount_by_file_id() {
        let table = FileHandleTable::new(8);
        let a = table.insert(entry(7, libc::O_RDWR)).unwrap();
        let b = table.insert(entry(7, libc::O_RDWR)).unwrap();
        assert_ne!(a.handle, b.handle);

        assert!(!table.is_last_ref(7));
        table.close(a.handle).unwrap();
        assert!(table.is_last_ref(7));
        table.close(b.handle).unwrap();
        assert!(!table.is_last_ref(7));
    }

    #[test]
    fn test_direct_handles_not_counted() {
        let table = FileHandleTable::new(8);
        let cached = table.insert(entry(7, libc::O_RDWR)).unwrap();
        let direct = table.insert(entry(7, libc::O_RDWR | libc::O_DIRECT)).unwrap();

        assert!(direct.direct_io);
        // only the cached handle counts
        assert!(table.is_last_ref(7));

        table.close(direct.handle).unwrap();
        assert!(table.is_last_ref(7));
        table.close(cached.handle).unwrap();
    }

    #[test]
    fn test_get_invalid() {
        let table = FileHandleTable::new(2);
        assert_eq!(table.get(0).unwrap_err(), FsError::Errno(Errno::EBADF));
        assert_eq!(table.get(-1).unwrap_err(), FsError::Errno(Errno::EBADF));
        assert_eq!(table.get(99).unwrap_err(), FsError::Errno(Errno::EBADF));
        assert_eq!(table.close(0).unwrap_err(), FsError::Errno(Errno::EBADF));
    }
}
