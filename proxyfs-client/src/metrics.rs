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

use std::sync::atomic::{AtomicU64, Ordering};

/// Client-side instrumentation hook. Counters only; a snapshot line is
/// logged when the mount goes away.
#[derive(Debug, Default)]
pub struct ClientMetrics {
    pub proxy_calls: AtomicU64,
    pub proxy_retries: AtomicU64,
    pub read_bytes: AtomicU64,
    pub write_bytes: AtomicU64,
    pub cache_read_hits: AtomicU64,
    pub merged_bytes: AtomicU64,
    pub prefetch_reads: AtomicU64,
    pub flushed_buffers: AtomicU64,
    pub expired_buffers: AtomicU64,
    pub dentry_hits: AtomicU64,
}

impl ClientMetrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, v: u64) {
        counter.fetch_add(v, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> String {
        format!(
            "proxy_calls={} proxy_retries={} read_bytes={} write_bytes={} \
             cache_read_hits={} merged_bytes={} prefetch_reads={} \
             flushed_buffers={} expired_buffers={} dentry_hits={}",
            self.proxy_calls.load(Ordering::Relaxed),
            self.proxy_retries.load(Ordering::Relaxed),
            self.read_bytes.load(Ordering::Relaxed),
            self.write_bytes.load(Ordering::Relaxed),
            self.cache_read_hits.load(Ordering::Relaxed),
            self.merged_bytes.load(Ordering::Relaxed),
            self.prefetch_reads.load(Ordering::Relaxed),
            self.flushed_buffers.load(Ordering::Relaxed),
            self.expired_buffers.load(Ordering::Relaxed),
            self.dentry_hits.load(Ordering::Relaxed),
        )
    }
}
