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

use bytes::{Bytes, BytesMut};
use std::ops::Range;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A pooled block buffer. Pool membership, the file block map, and the LRU
/// list all share it through an `Arc`; content access is serialized by the
/// per-block logical lock, the inner mutex only keeps the sharing sound.
///
/// Invariants: `offset + len <= block_size`; `offset` is set once per reuse
/// via `skip` while `len == 0`; merges append at `offset + len`.
pub struct BlockBuffer {
    pool_id: u32,
    state: Mutex<BufState>,
}

struct BufState {
    file_id: u64,
    block_size: u32,
    blk_idx: u64,
    offset: u32,
    len: u32,
    data: BytesMut,
    last_update: Instant,
}

impl BlockBuffer {
    pub fn new(pool_id: u32, block_size: u32) -> Self {
        Self {
            pool_id,
            state: Mutex::new(BufState {
                file_id: 0,
                block_size,
                blk_idx: 0,
                offset: 0,
                len: 0,
                // payload storage materializes on first reuse
                data: BytesMut::new(),
                last_update: Instant::now(),
            }),
        }
    }

    pub fn pool_id(&self) -> u32 {
        self.pool_id
    }

    /// Rebinds a free buffer to a (file, block) pair. Stale payload bytes are
    /// never observable because reads are bounded by `len`.
    pub fn reset(&self, file_id: u64, block_size: u32, blk_idx: u64) {
        let mut st = self.state.lock().unwrap();
        st.file_id = file_id;
        st.blk_idx = blk_idx;
        st.offset = 0;
        st.len = 0;
        if st.data.len() < block_size as usize {
            st.data = BytesMut::zeroed(block_size as usize);
        }
        st.block_size = block_size;
        st.last_update = Instant::now();
    }

    pub fn skip(&self, offset: u32) {
        let mut st = self.state.lock().unwrap();
        debug_assert_eq!(st.offset, 0);
        debug_assert_eq!(st.len, 0);
        st.offset = offset;
    }

    pub fn can_merge(&self, offset: u32) -> bool {
        let st = self.state.lock().unwrap();
        st.offset + st.len == offset
    }

    pub fn merge(&self, data: &[u8]) {
        let mut st = self.state.lock().unwrap();
        let at = (st.offset + st.len) as usize;
        debug_assert!(at + data.len() <= st.block_size as usize);
        st.data[at..at + data.len()].copy_from_slice(data);
        st.len += data.len() as u32;
        st.last_update = Instant::now();
    }

    pub fn is_full(&self) -> bool {
        let st = self.state.lock().unwrap();
        debug_assert!(st.offset + st.len <= st.block_size);
        st.offset + st.len == st.block_size
    }

    pub fn file_id(&self) -> u64 {
        self.state.lock().unwrap().file_id
    }

    pub fn blk_idx(&self) -> u64 {
        self.state.lock().unwrap().blk_idx
    }

    pub fn lru_key(&self) -> (u64, u64) {
        let st = self.state.lock().unwrap();
        (st.file_id, st.blk_idx)
    }

    pub fn offset(&self) -> u32 {
        self.state.lock().unwrap().offset
    }

    pub fn len(&self) -> u32 {
        self.state.lock().unwrap().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn window(&self) -> (u32, u32) {
        let st = self.state.lock().unwrap();
        (st.offset, st.len)
    }

    /// File offset of the block start.
    pub fn align_offset(&self) -> u64 {
        let st = self.state.lock().unwrap();
        st.blk_idx * st.block_size as u64
    }

    /// File offset of the first valid byte.
    pub fn file_offset(&self) -> u64 {
        let st = self.state.lock().unwrap();
        st.blk_idx * st.block_size as u64 + st.offset as u64
    }

    /// File offset one past the last valid byte.
    pub fn tail_offset(&self) -> u64 {
        let st = self.state.lock().unwrap();
        st.blk_idx * st.block_size as u64 + st.offset as u64 + st.len as u64
    }

    /// Copy of the valid payload with its file offset, for a direct write.
    pub fn flush_payload(&self) -> (u64, u64, Bytes) {
        let st = self.state.lock().unwrap();
        let off = st.blk_idx * st.block_size as u64 + st.offset as u64;
        let data =
            Bytes::copy_from_slice(&st.data[st.offset as usize..(st.offset + st.len) as usize]);
        (st.file_id, off, data)
    }

    /// Copies `[start, end)` of the block (absolute in-block offsets) into
    /// `dst`. The range must lie inside the valid window.
    pub fn copy_range_into(&self, start: u32, end: u32, dst: &mut [u8]) {
        let st = self.state.lock().unwrap();
        debug_assert!(st.offset <= start && end <= st.offset + st.len);
        dst[..(end - start) as usize].copy_from_slice(&st.data[start as usize..end as usize]);
    }

    pub fn touch(&self) {
        self.state.lock().unwrap().last_update = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.state.lock().unwrap().last_update.elapsed()
    }
}

impl std::fmt::Debug for BlockBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock().unwrap();
        f.debug_struct("BlockBuffer")
            .field("pool_id", &self.pool_id)
            .field("file_id", &st.file_id)
            .field("blk_idx", &st.blk_idx)
            .field("offset", &st.offset)
            .field("len", &st.len)
            .finish()
    }
}

/// One per-block slice of a caller read/write: the block index, the in-block
/// window, and the cursor into the caller buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockOp {
    pub index: u64,
    pub rw_offset: u32,
    pub rw_size: u32,
    pub buf_pos: usize,
    pub block_size: u32,
}

impl BlockOp {
    pub fn align_offset(&self) -> u64 {
        self.index * self.block_size as u64
    }

    pub fn file_offset(&self) -> u64 {
        self.align_offset() + self.rw_offset as u64
    }

    pub fn is_full(&self) -> bool {
        debug_assert!(self.rw_offset + self.rw_size <= self.block_size);
        self.rw_offset == 0 && self.rw_size == self.block_size
    }

    /// Range of the caller buffer covered by this op.
    pub fn buf_range(&self) -> Range<usize> {
        self.buf_pos..self.buf_pos + self.rw_size as usize
    }
}

/// Slices a byte range into ordered per-block ops. An empty range yields no
/// ops.
pub fn slice_ops(block_size: u32, len: usize, offset: u64) -> Vec<BlockOp> {
    let size = len as u64;
    let bs = block_size as u64;
    let mut index = offset / bs;
    let index_end = (offset + size).div_ceil(bs);

    let mut rw_offset = (offset % bs) as u32;
    let mut left = len as u32;
    let mut buf_pos = 0usize;

    let mut ops = Vec::with_capacity((index_end.saturating_sub(index)) as usize);
    while index < index_end {
        let op_offset = rw_offset % block_size;
        let op_size = (block_size - op_offset).min(left);

        ops.push(BlockOp {
            index,
            rw_offset: op_offset,
            rw_size: op_size,
            buf_pos,
            block_size,
        });

        rw_offset += op_size;
        left -= op_size;
        buf_pos += op_size as usize;
        index += 1;
    }

    ops
}

/// Block-index range the read cache is allowed to populate eagerly. Empty
/// when `start == end`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrefetchWindow {
    pub start: u64,
    pub end: u64,
}

impl PrefetchWindow {
    pub fn covering(block_size: u32, size: u32, offset: u64) -> Self {
        let bs = block_size as u64;
        Self {
            start: offset / bs,
            end: (offset + size as u64).div_ceil(bs),
        }
    }

    pub fn size(&self) -> u64 {
        debug_assert!(self.start <= self.end);
        self.end - self.start
    }

    /// Shifts the window past itself.
    pub fn move_next(&mut self) {
        self.shift(self.end - self.start);
    }

    pub fn shift(&mut self, step: u64) {
        self.start += step;
        self.end += step;
    }

    /// Grows the window to `times` its size, anchored at the start.
    pub fn extend(&mut self, times: u32) {
        let step = self.end - self.start;
        self.end = self.start + step * times as u64;
    }

    pub fn cross(&self, other: &PrefetchWindow) -> bool {
        !(self.end <= other.start || other.end <= self.start)
    }
}
