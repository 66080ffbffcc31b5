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

use log::{debug, warn};
use proxyfs_common::utils::now_ms;
use proxyfs_common::{FsError, FsResult};
use rand::Rng;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

/// One proxy host with its failure penalty timestamp.
pub struct Host {
    raw: String,
    last_failed_s: AtomicI64,
}

impl Host {
    pub fn new(raw: String) -> Self {
        Self {
            raw,
            last_failed_s: AtomicI64::new(0),
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn set_fail(&self) {
        let now = (now_ms() / 1000) as i64;
        self.last_failed_s.store(now, Ordering::Relaxed);
        warn!("host {} marked failed at {}", self.raw, now);
    }

    pub fn is_punished(&self, fail_retry_interval_s: i64) -> bool {
        let last = self.last_failed_s.load(Ordering::Relaxed);
        last != 0 && (now_ms() / 1000) as i64 - last < fail_retry_interval_s
    }
}

/// Host selection with failure penalty. The default host is sticky: a
/// request that ends on a different host promotes it for later requests.
pub struct Selector {
    hosts: Vec<Arc<Host>>,
    default_host: RwLock<Arc<Host>>,
    try_times: u32,
    fail_retry_interval_s: i64,
}

impl Selector {
    pub fn new(hosts: Vec<String>, try_times: u32, fail_retry_interval_s: i64) -> FsResult<Self> {
        if hosts.is_empty() {
            return Err(FsError::common("empty proxy host list"));
        }

        let interval = if fail_retry_interval_s == 0 {
            1
        } else {
            fail_retry_interval_s
        };

        let hosts: Vec<Arc<Host>> = hosts
            .into_iter()
            .map(|h| {
                let raw = if h.starts_with("http") {
                    h
                } else {
                    format!("http://{}", h)
                };
                Arc::new(Host::new(raw))
            })
            .collect();

        let default_host = RwLock::new(hosts[0].clone());
        Ok(Self {
            hosts,
            default_host,
            try_times,
            fail_retry_interval_s: interval,
        })
    }

    /// The sticky default host plus a retry cursor over the full list.
    pub fn get(&self) -> (Arc<Host>, RetryCursor) {
        let h = self.default_host.read().unwrap().clone();
        let cursor = RetryCursor {
            hosts: self.hosts.clone(),
            pool: Vec::new(),
            fail_retry_interval_s: self.fail_retry_interval_s,
        };
        (h, cursor)
    }

    pub fn promote(&self, host: &Arc<Host>) {
        debug!("promote default host {}", host.raw());
        *self.default_host.write().unwrap() = host.clone();
    }

    pub fn try_times(&self) -> usize {
        if self.try_times != 0 {
            self.try_times as usize
        } else {
            self.hosts.len()
        }
    }
}

/// Draws hosts in random order, skipping punished ones until the pool runs
/// dry, then refills ignoring the penalty.
pub struct RetryCursor {
    hosts: Vec<Arc<Host>>,
    pool: Vec<Arc<Host>>,
    fail_retry_interval_s: i64,
}

impl RetryCursor {
    pub fn next(&mut self) -> Option<Arc<Host>> {
        if self.pool.is_empty() {
            self.pool = self
                .hosts
                .iter()
                .filter(|h| !h.is_punished(self.fail_retry_interval_s))
                .cloned()
                .collect();
        }
        if self.pool.is_empty() {
            return None;
        }
        let i = rand::thread_rng().gen_range(0..self.pool.len());
        Some(self.pool.swap_remove(i))
    }
}
