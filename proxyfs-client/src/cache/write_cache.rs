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

use crate::api::ProxyApi;
use crate::cache::block::{slice_ops, BlockBuffer, BlockOp};
use crate::cache::file_buffer::FileBuffer;
use crate::cache::CacheCore;
use crate::fs::FileEntry;
use crate::metrics::ClientMetrics;
use futures::stream::StreamExt;
use log::{debug, error, info, warn};
use proxyfs_common::conf::CacheConf;
use proxyfs_common::{Errno, FsError, FsResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const FLUSH_ROUTINE: usize = 8;
const EXPIRE_ROUTINE: usize = 8;
const EXPIRE_POLL: Duration = Duration::from_millis(100);

struct SyncTask {
    file_buf: Arc<FileBuffer>,
    buffer: Arc<BlockBuffer>,
}

/// Write-behind block cache. Dirty data coalesces into pooled buffers;
/// full blocks are handed to the sync workers, partial ones age on the LRU
/// until flushed by the sweeper, an explicit flush, or close.
pub struct WriteCache {
    core: CacheCore,
    client: Arc<dyn ProxyApi>,
    metrics: Arc<ClientMetrics>,
    expire: Duration,
    check_gap: Duration,
    sync_routine: usize,
    sync_tx: Mutex<Option<mpsc::Sender<SyncTask>>>,
    stop: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WriteCache {
    pub fn new(
        client: Arc<dyn ProxyApi>,
        metrics: Arc<ClientMetrics>,
        conf: &CacheConf,
        block_size: u32,
    ) -> Arc<Self> {
        let cache = Arc::new(Self {
            core: CacheCore::new(conf.buffer_max, block_size),
            client,
            metrics,
            expire: Duration::from_millis(conf.expire_ms),
            check_gap: Duration::from_millis(conf.check_gap_ms),
            sync_routine: conf.sync_routine,
            sync_tx: Mutex::new(None),
            stop: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        let mut tasks = Vec::new();
        if conf.sync_routine > 0 {
            let (tx, rx) = mpsc::channel::<SyncTask>(conf.sync_routine);
            *cache.sync_tx.lock().unwrap() = Some(tx);

            let rx = Arc::new(tokio::sync::Mutex::new(rx));
            for _ in 0..conf.sync_routine {
                let cache = cache.clone();
                let rx = rx.clone();
                tasks.push(tokio::spawn(async move { cache.sync_write(rx).await }));
            }
        }

        for _ in 0..EXPIRE_ROUTINE {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move { cache.check_expire().await }));
        }

        cache.tasks.lock().unwrap().extend(tasks);
        cache
    }

    /// Synchronous-only mode: no sync channel was configured.
    fn sync_io(&self) -> bool {
        self.sync_routine == 0
    }

    fn sync_sender(&self) -> Option<mpsc::Sender<SyncTask>> {
        self.sync_tx.lock().unwrap().clone()
    }

    pub(crate) fn file_buffer(&self, fe: &FileEntry, alloc: bool) -> Option<Arc<FileBuffer>> {
        self.core.file_buffer(fe.id, fe.block_size, alloc)
    }

    async fn direct_write(&self, id: u64, offset: u64, data: &[u8]) -> FsResult<()> {
        ClientMetrics::add(&self.metrics.write_bytes, data.len() as u64);
        self.client.write(id, offset, data).await
    }

    pub async fn write(&self, fe: &FileEntry, buf: &[u8], offset: u64) -> FsResult<usize> {
        let file_buf = self
            .file_buffer(fe, true)
            .expect("write file buffer must allocate");

        let mut wt_size = 0usize;
        for op in slice_ops(fe.block_size, buf.len(), offset) {
            file_buf.lock_exclusive(op.index).await;

            match self.write_op(fe, &file_buf, op, &buf[op.buf_range()]).await {
                Ok((sync_io, size)) => {
                    if sync_io {
                        file_buf.unlock_exclusive(op.index);
                    }
                    wt_size += size;
                }
                Err(e) => {
                    file_buf.unlock_exclusive(op.index);
                    // earlier ops may already be committed
                    return Err(e);
                }
            }
        }

        debug_assert_eq!(wt_size, buf.len());
        Ok(wt_size)
    }

    /// Applies one sliced op to its block. Returns `(sync_io, size)`;
    /// `sync_io == false` means the buffer went to the sync channel and the
    /// worker owns the block lock now.
    async fn write_op(
        &self,
        fe: &FileEntry,
        file_buf: &Arc<FileBuffer>,
        op: BlockOp,
        data: &[u8],
    ) -> FsResult<(bool, usize)> {
        let size = op.rw_size as usize;

        let Some(buffer) = file_buf.get(op.index) else {
            // no cached block yet
            if op.is_full() && self.sync_io() {
                self.direct_write(fe.id, op.file_offset(), data).await?;
                return Ok((true, size));
            }

            let Some(buffer) = self.core.alloc(fe.id, fe.block_size, op.index) else {
                error!("write cache pool exhausted, fd {} op {:?}", fe.id, op);
                self.direct_write(fe.id, op.file_offset(), data).await?;
                return Ok((true, size));
            };

            buffer.skip(op.rw_offset);
            debug_assert!(buffer.can_merge(op.rw_offset));
            buffer.merge(data);
            file_buf.attach(op.index, buffer.clone());

            info!("write cache new buffer, id {} op {:?}", fe.id, op);

            if buffer.is_full() {
                debug_assert!(op.is_full() && !self.sync_io());
                self.push_sync(file_buf, buffer).await;
                return Ok((false, size));
            }

            self.core.touch_lru(&buffer);
            return Ok((true, size));
        };

        // cached block exists
        self.core.remove_lru(&buffer);

        if buffer.can_merge(op.rw_offset) {
            buffer.merge(data);
            debug!("write cache merged, id {} op {:?}", fe.id, op);

            if buffer.is_full() {
                if !self.sync_io() {
                    self.push_sync(file_buf, buffer).await;
                    return Ok((false, size));
                }

                let (id, off, payload) = buffer.flush_payload();
                if let Err(e) = self.direct_write(id, off, &payload).await {
                    self.core.touch_lru(&buffer);
                    return Err(e);
                }

                file_buf.detach(op.index);
                self.core.free(buffer);
                return Ok((true, size));
            }

            self.core.touch_lru(&buffer);
            return Ok((true, size));
        }

        // not mergeable: flush the old window first
        let (id, off, payload) = buffer.flush_payload();
        if let Err(e) = self.direct_write(id, off, &payload).await {
            self.core.touch_lru(&buffer);
            return Err(e);
        }

        if op.is_full() {
            file_buf.detach(op.index);
            self.core.free(buffer);

            self.direct_write(fe.id, op.file_offset(), data).await?;
            return Ok((true, size));
        }

        buffer.reset(fe.id, fe.block_size, op.index);
        buffer.skip(op.rw_offset);
        debug_assert!(buffer.can_merge(op.rw_offset));
        buffer.merge(data);
        self.core.touch_lru(&buffer);

        info!("write cache reset buffer, id {} op {:?}", fe.id, op);
        Ok((true, size))
    }

    /// Hands a full buffer to the sync workers, which take over the block
    /// lock. If the channel is already gone the buffer stays attached and a
    /// later flush writes it out.
    async fn push_sync(&self, file_buf: &Arc<FileBuffer>, buffer: Arc<BlockBuffer>) {
        let blk_idx = buffer.blk_idx();
        let Some(tx) = self.sync_sender() else {
            warn!("sync channel closed, leaving block {} for flush", blk_idx);
            file_buf.unlock_exclusive(blk_idx);
            return;
        };

        let task = SyncTask {
            file_buf: file_buf.clone(),
            buffer,
        };
        if tx.send(task).await.is_err() {
            warn!("sync channel closed, leaving block {} for flush", blk_idx);
            file_buf.unlock_exclusive(blk_idx);
        }
    }

    /// Overlays dirty bytes onto data just read from the proxy and applies
    /// the hole rule: a short read below cached data further into the file
    /// zero-extends to the full op window.
    pub fn merge_op(
        &self,
        file_buf: &FileBuffer,
        op: &BlockOp,
        data_size: usize,
        out: &mut [u8],
    ) -> usize {
        debug_assert!(data_size <= op.rw_size as usize);

        let Some(buffer) = file_buf.get(op.index) else {
            // read hit a hole below a higher dirty block
            if data_size < op.rw_size as usize && op.index < file_buf.upper_index() {
                return op.rw_size as usize;
            }
            return data_size;
        };

        let (buf_off, buf_len) = buffer.window();

        // no intersection with the dirty window
        if buf_off + buf_len <= op.rw_offset || op.rw_offset + op.rw_size <= buf_off {
            if data_size < op.rw_size as usize && op.rw_offset < buf_off {
                return op.rw_size as usize;
            }
            return data_size;
        }

        let cp_off = buf_off.max(op.rw_offset);
        let cp_tail = (buf_off + buf_len).min(op.rw_offset + op.rw_size);
        debug_assert!(cp_off < cp_tail);

        let dst_start = (cp_off - op.rw_offset) as usize;
        let dst_end = (cp_tail - op.rw_offset) as usize;
        buffer.copy_range_into(cp_off, cp_tail, &mut out[dst_start..dst_end]);
        ClientMetrics::add(&self.metrics.merged_bytes, (cp_tail - cp_off) as u64);

        debug!(
            "write cache read hit, id {} blk {} window [{}, {}) size {} -> {}",
            file_buf.file_id(),
            op.index,
            cp_off,
            cp_tail,
            data_size,
            dst_end.max(data_size)
        );

        data_size.max(dst_end)
    }

    /// Flushes one block under its exclusive lock. A proxy ENOENT drops the
    /// buffer: the file is gone and the data cannot be saved.
    async fn flush_buffer(&self, file_buf: &Arc<FileBuffer>, blk_idx: u64) -> FsResult<()> {
        file_buf.lock_exclusive(blk_idx).await;
        let result = self.flush_buffer_locked(file_buf, blk_idx).await;
        file_buf.unlock_exclusive(blk_idx);
        result
    }

    async fn flush_buffer_locked(&self, file_buf: &Arc<FileBuffer>, blk_idx: u64) -> FsResult<()> {
        let Some(buffer) = file_buf.get(blk_idx) else {
            return Ok(());
        };

        self.core.remove_lru(&buffer);

        let (id, off, payload) = buffer.flush_payload();
        if let Err(e) = self.direct_write(id, off, &payload).await {
            if matches!(e, FsError::Errno(Errno::ENOENT)) {
                error!(
                    "flush failed with ENOENT, dropping block, id {} buffer {:?}",
                    id, buffer
                );
                file_buf.detach(blk_idx);
                self.core.free(buffer);
                return Err(e);
            }

            self.core.touch_lru(&buffer);
            return Err(e);
        }

        file_buf.detach(blk_idx);
        self.core.free(buffer);
        ClientMetrics::incr(&self.metrics.flushed_buffers);
        Ok(())
    }

    /// Writes out every block present at snapshot time with a bounded
    /// fan-out; the first error wins.
    pub async fn flush(&self, fe: &FileEntry) -> FsResult<()> {
        let Some(file_buf) = self.core.file_buffer_by_id(fe.id) else {
            return Ok(());
        };
        self.flush_file(&file_buf).await
    }

    async fn flush_file(&self, file_buf: &Arc<FileBuffer>) -> FsResult<()> {
        let indexes = file_buf.indexes();
        if indexes.is_empty() {
            return Ok(());
        }

        let first_err = Mutex::new(None::<FsError>);
        let routine = FLUSH_ROUTINE.min(indexes.len());

        futures::stream::iter(indexes)
            .for_each_concurrent(routine, |blk_idx| {
                let first_err = &first_err;
                let file_buf = file_buf.clone();
                async move {
                    if let Err(e) = self.flush_buffer(&file_buf, blk_idx).await {
                        let mut slot = first_err.lock().unwrap();
                        if slot.is_none() {
                            *slot = Some(e);
                        }
                    }
                }
            })
            .await;

        match first_err.into_inner().unwrap() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// In-memory file size implied by the highest dirty buffer; 0 when the
    /// file has no dirty data.
    pub async fn stat_size(&self, fe: &FileEntry) -> FsResult<u64> {
        let Some(file_buf) = self.core.file_buffer_by_id(fe.id) else {
            return Ok(0);
        };

        if file_buf.is_empty() {
            return Ok(0);
        }

        let upper = file_buf.upper_index();
        file_buf.lock_exclusive(upper).await;
        let result = match file_buf.get(upper) {
            Some(buffer) => Ok(buffer.tail_offset()),
            None => Err(FsError::Errno(Errno::EIO)),
        };
        file_buf.unlock_exclusive(upper);
        result
    }

    pub async fn close(&self, fe: &FileEntry) -> FsResult<()> {
        self.flush(fe).await?;
        self.core.detach_file(fe.id);
        Ok(())
    }

    async fn close_by_id(&self, file_id: u64) -> FsResult<()> {
        if let Some(file_buf) = self.core.file_buffer_by_id(file_id) {
            self.flush_file(&file_buf).await?;
        }
        self.core.detach_file(file_id);
        Ok(())
    }

    /// Shutdown: drain the sync workers, stop the sweepers, flush every
    /// file, then join all tasks.
    pub async fn close_all(&self) {
        self.sync_tx.lock().unwrap().take();
        self.stop.store(true, Ordering::Relaxed);

        for file_id in self.core.file_ids() {
            if let Err(e) = self.close_by_id(file_id).await {
                warn!("close-all flush failed for file {}: {}", file_id, e);
            }
        }

        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }

    async fn sync_write(&self, rx: Arc<tokio::sync::Mutex<mpsc::Receiver<SyncTask>>>) {
        loop {
            let task = { rx.lock().await.recv().await };
            let Some(SyncTask { file_buf, buffer }) = task else {
                break;
            };

            let blk_idx = buffer.blk_idx();
            let (id, off, payload) = buffer.flush_payload();
            match self.direct_write(id, off, &payload).await {
                Ok(()) => {
                    file_buf.detach(blk_idx);
                    self.core.free(buffer);
                    ClientMetrics::incr(&self.metrics.flushed_buffers);
                }
                Err(e) => {
                    warn!("async flush failed, id {} blk {}: {}", id, blk_idx, e);
                    self.core.touch_lru(&buffer);
                }
            }
            file_buf.unlock_exclusive(blk_idx);
        }
    }

    async fn check_expire(&self) {
        let mut last_check = tokio::time::Instant::now();
        loop {
            if self.stop.load(Ordering::Relaxed) {
                break;
            }

            if last_check.elapsed() < self.check_gap {
                tokio::time::sleep(EXPIRE_POLL).await;
                continue;
            }

            while let Some((file_id, blk_idx)) = self.core.lru_expire(self.expire) {
                let Some(file_buf) = self.core.file_buffer_by_id(file_id) else {
                    continue;
                };

                if let Err(e) = self.flush_buffer(&file_buf, blk_idx).await {
                    warn!("expire flush failed, id {} blk {}: {}", file_id, blk_idx, e);
                }
                ClientMetrics::incr(&self.metrics.expired_buffers);
            }

            last_check = tokio::time::Instant::now();
        }
    }
}
