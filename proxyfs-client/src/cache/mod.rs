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

//! Block-oriented read/write cache between the file operations and the
//! proxy. The write cache coalesces small writes into block buffers and
//! flushes them asynchronously; the read cache populates whole blocks ahead
//! of sequential readers. Both attach to file ids, never to handles.

pub mod block;
pub mod file_buffer;
mod read_cache;
mod rw_cache;
mod write_cache;

pub use read_cache::ReadCache;
pub use rw_cache::RwCache;
pub use write_cache::WriteCache;

use crate::cache::block::BlockBuffer;
use crate::cache::file_buffer::FileBuffer;
use lru::LruCache;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Pool, LRU list, and file-id map shared by both cache sides. One mutex
/// guards the three structures; it is only held around list/map mutations.
///
/// A buffer is either in the free list, or attached to exactly one
/// `FileBuffer` (and then optionally on the LRU list).
pub(crate) struct CacheCore {
    state: Mutex<CoreState>,
}

struct CoreState {
    free: Vec<Arc<BlockBuffer>>,
    lru: LruCache<(u64, u64), Arc<BlockBuffer>>,
    files: HashMap<u64, Arc<FileBuffer>>,
}

impl CacheCore {
    pub fn new(buffer_max: usize, block_size: u32) -> Self {
        let free = (0..buffer_max)
            .map(|i| Arc::new(BlockBuffer::new(i as u32, block_size)))
            .collect();

        Self {
            state: Mutex::new(CoreState {
                free,
                lru: LruCache::unbounded(),
                files: HashMap::new(),
            }),
        }
    }

    /// Takes a buffer from the free list, rebound to `(file_id, blk_idx)`.
    /// None when the pool is exhausted.
    pub fn alloc(&self, file_id: u64, block_size: u32, blk_idx: u64) -> Option<Arc<BlockBuffer>> {
        let mut st = self.state.lock().unwrap();
        let buf = st.free.pop()?;
        buf.reset(file_id, block_size, blk_idx);
        Some(buf)
    }

    pub fn free(&self, buf: Arc<BlockBuffer>) {
        let mut st = self.state.lock().unwrap();
        st.free.push(buf);
    }

    /// Moves the buffer to the LRU front, stamping its update time.
    pub fn touch_lru(&self, buf: &Arc<BlockBuffer>) {
        let mut st = self.state.lock().unwrap();
        buf.touch();
        st.lru.put(buf.lru_key(), buf.clone());
    }

    pub fn remove_lru(&self, buf: &Arc<BlockBuffer>) {
        let mut st = self.state.lock().unwrap();
        st.lru.pop(&buf.lru_key());
    }

    /// Pops the LRU tail if it has been idle at least `expire`.
    pub fn lru_expire(&self, expire: Duration) -> Option<(u64, u64)> {
        let mut st = self.state.lock().unwrap();
        let (key, buf) = st.lru.peek_lru()?;
        if buf.idle_for() < expire {
            return None;
        }
        let key = *key;
        st.lru.pop(&key);
        Some(key)
    }

    /// The file's buffer container, created on demand when `alloc` is set.
    pub fn file_buffer(
        &self,
        file_id: u64,
        block_size: u32,
        alloc: bool,
    ) -> Option<Arc<FileBuffer>> {
        let mut st = self.state.lock().unwrap();
        match st.files.get(&file_id) {
            Some(fb) => Some(fb.clone()),
            None if alloc => {
                let fb = Arc::new(FileBuffer::new(file_id, block_size));
                st.files.insert(file_id, fb.clone());
                Some(fb)
            }
            None => None,
        }
    }

    pub fn file_buffer_by_id(&self, file_id: u64) -> Option<Arc<FileBuffer>> {
        self.state.lock().unwrap().files.get(&file_id).cloned()
    }

    pub fn detach_file(&self, file_id: u64) {
        self.state.lock().unwrap().files.remove(&file_id);
    }

    pub fn file_ids(&self) -> Vec<u64> {
        self.state.lock().unwrap().files.keys().copied().collect()
    }

    #[cfg(test)]
    pub fn free_count(&self) -> usize {
        self.state.lock().unwrap().free.len()
    }
}
