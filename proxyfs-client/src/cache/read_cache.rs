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
use crate::cache::block::{BlockOp, PrefetchWindow};
use crate::cache::file_buffer::FileBuffer;
use crate::cache::CacheCore;
use crate::fs::FileEntry;
use crate::metrics::ClientMetrics;
use log::warn;
use proxyfs_common::conf::CacheConf;
use proxyfs_common::{err_fs, FsResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const EXPIRE_POLL: Duration = Duration::from_millis(100);

struct PrefetchTask {
    file_buf: Arc<FileBuffer>,
    file_id: u64,
    block_size: u32,
    blk_idx: u64,
}

/// Read-ahead block cache. Blocks are only populated by the prefetch
/// workers; foreground misses go straight to the proxy and are not
/// retained.
pub struct ReadCache {
    core: CacheCore,
    client: Arc<dyn ProxyApi>,
    metrics: Arc<ClientMetrics>,
    expire: Duration,
    check_gap: Duration,
    prefetch_times: u32,
    prefetch_tx: Mutex<Option<mpsc::Sender<PrefetchTask>>>,
    stop: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ReadCache {
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
            prefetch_times: conf.prefetch_times,
            prefetch_tx: Mutex::new(None),
            stop: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        let mut tasks = Vec::new();
        if conf.prefetch_routine > 0 {
            let (tx, rx) = mpsc::channel::<PrefetchTask>(conf.prefetch_routine);
            *cache.prefetch_tx.lock().unwrap() = Some(tx);

            let rx = Arc::new(tokio::sync::Mutex::new(rx));
            for _ in 0..conf.prefetch_routine {
                let cache = cache.clone();
                let rx = rx.clone();
                tasks.push(tokio::spawn(async move { cache.prefetch_read(rx).await }));
            }
        }

        {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move { cache.check_expire().await }));
        }

        cache.tasks.lock().unwrap().extend(tasks);
        cache
    }

    pub(crate) fn file_buffer(&self, fe: &FileEntry, alloc: bool) -> Option<Arc<FileBuffer>> {
        self.core.file_buffer(fe.id, fe.block_size, alloc)
    }

    async fn direct_read(&self, id: u64, offset: u64, len: u64) -> FsResult<Vec<u8>> {
        let data = self.client.read(id, offset, len).await?;
        ClientMetrics::add(&self.metrics.read_bytes, data.len() as u64);
        Ok(data)
    }

    /// Serves one sliced op: from the cached block when present, otherwise
    /// straight from the proxy. Returns the bytes produced into `out`.
    pub(crate) async fn read_op(
        &self,
        fe: &FileEntry,
        file_buf: &FileBuffer,
        op: &BlockOp,
        out: &mut [u8],
    ) -> FsResult<usize> {
        let Some(buffer) = file_buf.get(op.index) else {
            let data = self
                .direct_read(fe.id, op.file_offset(), op.rw_size as u64)
                .await?;
            let n = data.len().min(out.len());
            out[..n].copy_from_slice(&data[..n]);
            return Ok(n);
        };

        // prefetched blocks always start at offset 0 with data
        let (buf_off, buf_len) = buffer.window();
        debug_assert!(buf_off == 0 && buf_len != 0);

        if op.rw_offset >= buf_len {
            return Ok(0);
        }

        let size = (buf_len - op.rw_offset).min(op.rw_size);
        buffer.copy_range_into(op.rw_offset, op.rw_offset + size, &mut out[..size as usize]);
        ClientMetrics::incr(&self.metrics.cache_read_hits);
        Ok(size as usize)
    }

    /// Runs the window heuristic for this read and enqueues any newly
    /// authorized blocks, each handed to a worker with its exclusive lock
    /// already held.
    pub(crate) async fn try_prefetch(&self, file_buf: &Arc<FileBuffer>, size: u32, offset: u64) {
        let Some(tx) = self.prefetch_tx.lock().unwrap().clone() else {
            return;
        };

        if size == 0 {
            return;
        }

        let rw = PrefetchWindow::covering(file_buf.block_size(), size, offset);
        let Some((blk_start, blk_end)) = file_buf.advance_window(rw, self.prefetch_times) else {
            return;
        };

        for blk_idx in blk_start..blk_end {
            file_buf.lock_exclusive(blk_idx).await;

            // still cached, nothing to read until it expires
            if file_buf.get(blk_idx).is_some() {
                file_buf.unlock_exclusive(blk_idx);
                continue;
            }

            let task = PrefetchTask {
                file_buf: file_buf.clone(),
                file_id: file_buf.file_id(),
                block_size: file_buf.block_size(),
                blk_idx,
            };
            if tx.send(task).await.is_err() {
                file_buf.unlock_exclusive(blk_idx);
                break;
            }
        }
    }

    async fn do_prefetch_read(&self, task: &PrefetchTask) -> FsResult<()> {
        let offset = task.blk_idx * task.block_size as u64;
        let data = self
            .direct_read(task.file_id, offset, task.block_size as u64)
            .await?;

        if data.is_empty() {
            return Ok(());
        }

        let Some(buffer) = self
            .core
            .alloc(task.file_id, task.block_size, task.blk_idx)
        else {
            warn!(
                "read cache pool exhausted, id {} blk {}",
                task.file_id, task.blk_idx
            );
            return Err(err_fs!("read buffer allocation failed"));
        };

        buffer.skip(0);
        buffer.merge(&data);
        task.file_buf.attach(task.blk_idx, buffer.clone());
        self.core.touch_lru(&buffer);
        ClientMetrics::incr(&self.metrics.prefetch_reads);

        Ok(())
    }

    async fn prefetch_read(&self, rx: Arc<tokio::sync::Mutex<mpsc::Receiver<PrefetchTask>>>) {
        loop {
            let task = { rx.lock().await.recv().await };
            let Some(task) = task else {
                break;
            };

            if let Err(e) = self.do_prefetch_read(&task).await {
                warn!(
                    "prefetch failed, id {} blk {}: {}",
                    task.file_id, task.blk_idx, e
                );
            }
            task.file_buf.unlock_exclusive(task.blk_idx);
        }
    }

    /// Frees one cached block under its exclusive lock.
    async fn release_buffer(&self, file_buf: &Arc<FileBuffer>, blk_idx: u64) {
        file_buf.lock_exclusive(blk_idx).await;

        if let Some(buffer) = file_buf.get(blk_idx) {
            self.core.remove_lru(&buffer);
            file_buf.detach(blk_idx);
            self.core.free(buffer);
        }

        file_buf.unlock_exclusive(blk_idx);
    }

    /// Drops clean blocks overlapping a fresh write so readers cannot see
    /// stale data.
    pub async fn clean(&self, fe: &FileEntry, size: usize, offset: u64) {
        if size == 0 {
            return;
        }

        let Some(file_buf) = self.core.file_buffer_by_id(fe.id) else {
            return;
        };

        let rw = PrefetchWindow::covering(fe.block_size, size as u32, offset);
        for blk_idx in rw.start..rw.end {
            self.release_buffer(&file_buf, blk_idx).await;
        }
    }

    /// Waits for in-flight prefetches, then frees every cached block.
    pub async fn release(&self, fe: &FileEntry) {
        let Some(file_buf) = self.core.file_buffer_by_id(fe.id) else {
            return;
        };

        file_buf.wait_unlocked().await;

        for blk_idx in file_buf.indexes() {
            self.release_buffer(&file_buf, blk_idx).await;
        }
    }

    pub async fn close(&self, fe: &FileEntry) {
        self.release(fe).await;
        self.core.detach_file(fe.id);
    }

    async fn release_by_id(&self, file_id: u64) {
        if let Some(file_buf) = self.core.file_buffer_by_id(file_id) {
            file_buf.wait_unlocked().await;
            for blk_idx in file_buf.indexes() {
                self.release_buffer(&file_buf, blk_idx).await;
            }
        }
        self.core.detach_file(file_id);
    }

    /// Shutdown: close the prefetch channel, stop the sweeper, release
    /// every file, join workers.
    pub async fn close_all(&self) {
        self.prefetch_tx.lock().unwrap().take();
        self.stop.store(true, Ordering::Relaxed);

        for file_id in self.core.file_ids() {
            self.release_by_id(file_id).await;
        }

        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            let _ = task.await;
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

                self.release_buffer(&file_buf, blk_idx).await;
                ClientMetrics::incr(&self.metrics.expired_buffers);
            }

            last_check = tokio::time::Instant::now();
        }
    }
}
