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
use crate::cache::block::slice_ops;
use crate::cache::{ReadCache, WriteCache};
use crate::fs::FileEntry;
use crate::metrics::ClientMetrics;
use log::debug;
use proxyfs_common::conf::CacheConf;
use proxyfs_common::proto::DEFAULT_BLOCK_SIZE;
use proxyfs_common::FsResult;
use std::sync::Arc;

/// Read/write cache pair for one mount. Readers observe their own
/// unflushed writes: every read consults the write side per block, and
/// every write invalidates the overlapping clean blocks.
pub struct RwCache {
    rcache: Arc<ReadCache>,
    wcache: Arc<WriteCache>,
}

impl RwCache {
    pub fn new(
        client: Arc<dyn ProxyApi>,
        metrics: Arc<ClientMetrics>,
        conf: &CacheConf,
    ) -> Arc<Self> {
        Arc::new(Self {
            rcache: ReadCache::new(client.clone(), metrics.clone(), conf, DEFAULT_BLOCK_SIZE),
            wcache: WriteCache::new(client, metrics, conf, DEFAULT_BLOCK_SIZE),
        })
    }

    pub async fn read(&self, fe: &FileEntry, buf: &mut [u8], offset: u64) -> FsResult<usize> {
        let size = self.do_read(fe, buf, offset).await?;

        debug!(
            "cache read done, handle {} id {} offset {} size {} idx {} rsp {}",
            fe.handle,
            fe.id,
            offset,
            buf.len(),
            offset / fe.block_size as u64,
            size
        );

        Ok(size)
    }

    async fn do_read(&self, fe: &FileEntry, buf: &mut [u8], offset: u64) -> FsResult<usize> {
        let mut scratch = vec![0u8; buf.len()];

        let file_buf_read = self
            .rcache
            .file_buffer(fe, true)
            .expect("read file buffer must allocate");
        self.rcache
            .try_prefetch(&file_buf_read, buf.len() as u32, offset)
            .await;

        let file_buf_write = self.wcache.file_buffer(fe, false);

        let mut size = 0usize;
        for op in slice_ops(fe.block_size, buf.len(), offset) {
            // the write-side shared lock first: it serializes against an
            // in-flight flush of the same block
            if let Some(w) = &file_buf_write {
                w.lock_shared(op.index).await;
            }

            file_buf_read.lock_shared(op.index).await;
            let result = self
                .rcache
                .read_op(fe, &file_buf_read, &op, &mut scratch[op.buf_range()])
                .await;
            file_buf_read.unlock_shared(op.index);

            let mut op_size = match result {
                Ok(n) => n,
                Err(e) => {
                    if let Some(w) = &file_buf_write {
                        w.unlock_shared(op.index);
                    }
                    return Err(e);
                }
            };

            // overlay dirty bytes from the write cache
            if let Some(w) = &file_buf_write {
                op_size = self
                    .wcache
                    .merge_op(w, &op, op_size, &mut scratch[op.buf_range()]);
                w.unlock_shared(op.index);
            }

            // earlier short ops become zero-filled holes when a later block
            // produces data
            if op_size != 0 {
                size = (op.file_offset() - offset) as usize + op_size;
            }
        }

        debug_assert!(size <= buf.len());
        buf[..size].copy_from_slice(&scratch[..size]);
        Ok(size)
    }

    pub async fn write(&self, fe: &FileEntry, buf: &[u8], offset: u64) -> FsResult<usize> {
        let result = self.wcache.write(fe, buf, offset).await;

        // stale clean blocks go regardless of the write outcome
        self.rcache.clean(fe, buf.len(), offset).await;

        debug!(
            "cache write done, handle {} id {} offset {} size {} idx {} rsp {:?}",
            fe.handle,
            fe.id,
            offset,
            buf.len(),
            offset / fe.block_size as u64,
            result
        );

        result
    }

    pub async fn flush(&self, fe: &FileEntry) -> FsResult<()> {
        self.wcache.flush(fe).await
    }

    pub async fn release(&self, fe: &FileEntry) {
        self.rcache.release(fe).await
    }

    pub async fn stat_size(&self, fe: &FileEntry) -> FsResult<u64> {
        self.wcache.stat_size(fe).await
    }

    pub async fn close(&self, fe: &FileEntry) -> FsResult<()> {
        self.rcache.close(fe).await;
        self.wcache.close(fe).await
    }

    /// Unmount path: quiesce both sides and join every worker.
    pub async fn close_all(&self) {
        self.rcache.close_all().await;
        self.wcache.close_all().await;
    }
}
