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

use crate::cache::block::{BlockBuffer, PrefetchWindow};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

const LOCK_SPIN_SLEEP: Duration = Duration::from_micros(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockKind {
    Exclusive,
    Shared,
}

#[derive(Debug)]
struct BlockLock {
    kind: LockKind,
    refs: u32,
}

/// Per-file container of cached blocks in one cache, plus the per-block
/// lock table and the prefetch window.
///
/// The block lock protects both the presence of a block in the map and its
/// offset/len/payload; shared holders may stack because they only read a
/// stable window.
pub struct FileBuffer {
    file_id: u64,
    block_size: u32,
    blocks: Mutex<HashMap<u64, Arc<BlockBuffer>>>,
    locks: Mutex<HashMap<u64, BlockLock>>,
    window: RwLock<PrefetchWindow>,
}

impl FileBuffer {
    pub fn new(file_id: u64, block_size: u32) -> Self {
        Self {
            file_id,
            block_size,
            blocks: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            window: RwLock::new(PrefetchWindow::default()),
        }
    }

    pub fn file_id(&self) -> u64 {
        self.file_id
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn get(&self, blk_idx: u64) -> Option<Arc<BlockBuffer>> {
        self.blocks.lock().unwrap().get(&blk_idx).cloned()
    }

    pub fn attach(&self, blk_idx: u64, buf: Arc<BlockBuffer>) {
        let prev = self.blocks.lock().unwrap().insert(blk_idx, buf);
        assert!(prev.is_none(), "block {} attached twice", blk_idx);
    }

    pub fn detach(&self, blk_idx: u64) {
        self.blocks.lock().unwrap().remove(&blk_idx);
    }

    pub fn indexes(&self) -> Vec<u64> {
        self.blocks.lock().unwrap().keys().copied().collect()
    }

    pub fn upper_index(&self) -> u64 {
        self.blocks
            .lock()
            .unwrap()
            .keys()
            .copied()
            .max()
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.lock().unwrap().is_empty()
    }

    /// Acquires the exclusive lock on a block, spinning while any lock is
    /// held for it.
    pub async fn lock_exclusive(&self, blk_idx: u64) {
        loop {
            {
                let mut locks = self.locks.lock().unwrap();
                if let std::collections::hash_map::Entry::Vacant(e) = locks.entry(blk_idx) {
                    e.insert(BlockLock {
                        kind: LockKind::Exclusive,
                        refs: 0,
                    });
                    return;
                }
            }
            tokio::time::sleep(LOCK_SPIN_SLEEP).await;
        }
    }

    pub fn unlock_exclusive(&self, blk_idx: u64) {
        let mut locks = self.locks.lock().unwrap();
        let prev = locks.remove(&blk_idx);
        debug_assert!(
            matches!(
                prev,
                Some(BlockLock {
                    kind: LockKind::Exclusive,
                    refs: 0
                })
            ),
            "exclusive unlock without lock on block {}",
            blk_idx
        );
    }

    /// Acquires a shared lock, spinning while an exclusive holder exists.
    pub async fn lock_shared(&self, blk_idx: u64) {
        loop {
            {
                let mut locks = self.locks.lock().unwrap();
                match locks.get_mut(&blk_idx) {
                    Some(l) if l.kind == LockKind::Exclusive => {}
                    Some(l) => {
                        l.refs += 1;
                        return;
                    }
                    None => {
                        locks.insert(
                            blk_idx,
                            BlockLock {
                                kind: LockKind::Shared,
                                refs: 1,
                            },
                        );
                        return;
                    }
                }
            }
            tokio::time::sleep(LOCK_SPIN_SLEEP).await;
        }
    }

    pub fn unlock_shared(&self, blk_idx: u64) {
        let mut locks = self.locks.lock().unwrap();
        let lock = locks.get_mut(&blk_idx);
        debug_assert!(matches!(
            lock,
            Some(BlockLock {
                kind: LockKind::Shared,
                refs: 1..
            })
        ));
        if let Some(l) = lock {
            l.refs -= 1;
            if l.refs == 0 {
                locks.remove(&blk_idx);
            }
        }
    }

    /// Returns once no lock is held on any block of the file.
    pub async fn wait_unlocked(&self) {
        loop {
            if self.locks.lock().unwrap().is_empty() {
                return;
            }
            tokio::time::sleep(LOCK_SPIN_SLEEP).await;
        }
    }

    pub fn window(&self) -> PrefetchWindow {
        *self.window.read().unwrap()
    }

    /// Prefetch-window state machine. Returns the block range to enqueue, or
    /// None when the read is not part of a sequential pattern.
    pub fn advance_window(&self, rw: PrefetchWindow, times: u32) -> Option<(u64, u64)> {
        let mut pw = self.window.write().unwrap();
        if rw.start == 0 && pw.size() == 0 {
            *pw = rw;
            pw.move_next();
            pw.extend(times);
        } else if rw.cross(&pw) {
            debug_assert!(pw.size() > 0);
            pw.move_next();
        } else {
            return None;
        }
        Some((pw.start, pw.end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_attach_detach() {
        let fb = FileBuffer::new(1, 16);
        assert!(fb.is_empty());
        fb.attach(3, Arc::new(BlockBuffer::new(0, 16)));
        fb.attach(7, Arc::new(BlockBuffer::new(1, 16)));
        assert_eq!(fb.upper_index(), 7);
        let mut idx = fb.indexes();
        idx.sort_unstable();
        assert_eq!(idx, vec![3, 7]);
        fb.detach(7);
        assert_eq!(fb.upper_index(), 3);
    }

    #[tokio::test]
    async fn test_shared_locks_stack() {
        let fb = FileBuffer::new(1, 16);
        fb.lock_shared(0).await;
        fb.lock_shared(0).await;
        fb.unlock_shared(0);
        fb.unlock_shared(0);
        // table drained, exclusive is immediate
        fb.lock_exclusive(0).await;
        fb.unlock_exclusive(0);
    }

    #[tokio::test]
    async fn test_exclusive_blocks_shared() {
        let fb = Arc::new(FileBuffer::new(1, 16));
        fb.lock_exclusive(5).await;

        let fb2 = fb.clone();
        let waiter = tokio::spawn(async move {
            fb2.lock_shared(5).await;
            fb2.unlock_shared(5);
            Instant::now()
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let released = Instant::now();
        fb.unlock_exclusive(5);

        let acquired = waiter.await.unwrap();
        assert!(acquired >= released);
    }

    #[tokio::test]
    async fn test_wait_unlocked() {
        let fb = Arc::new(FileBuffer::new(1, 16));
        fb.lock_shared(2).await;

        let fb2 = fb.clone();
        let handle = tokio::spawn(async move {
            fb2.wait_unlocked().await;
        });

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!handle.is_finished());
        fb.unlock_shared(2);
        handle.await.unwrap();
    }

    #[test]
    fn test_advance_window_from_zero() {
        let fb = FileBuffer::new(1, 1024);
        // read of block 0 arms the window past itself, scaled up
        let rw = PrefetchWindow { start: 0, end: 1 };
        assert_eq!(fb.advance_window(rw, 8), Some((1, 9)));
        // a read inside the window slides it forward
        let rw = PrefetchWindow { start: 1, end: 2 };
        assert_eq!(fb.advance_window(rw, 8), Some((9, 17)));
        // a far random read is ignored
        let rw = PrefetchWindow { start: 100, end: 101 };
        assert_eq!(fb.advance_window(rw, 8), None);
    }

    #[test]
    fn test_advance_window_random_start() {
        let fb = FileBuffer::new(1, 1024);
        // a read that does not begin at block 0 never arms prefetch
        let rw = PrefetchWindow { start: 5, end: 6 };
        assert_eq!(fb.advance_window(rw, 8), None);
        assert_eq!(fb.window().size(), 0);
    }
}
