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
use crate::fs::dentry_cache::DentryCache;
use log::{debug, error};
use proxyfs_common::proto::Dentry;
use proxyfs_common::{Errno, FsError, FsResult};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LsStatus {
    Fetching,
    Done,
    Error,
    UserAbort,
}

struct DirState {
    entries: VecDeque<Dentry>,
    start_key: String,
    status: LsStatus,
    cache_size: usize,
    error: Option<FsError>,
}

/// Streaming directory handle. A background task pages through the proxy
/// with `(start_key, ls_size)` while readers drain the front; the two sides
/// meet on a mutex plus a single-permit notification.
pub struct Dir {
    state: Mutex<DirState>,
    notify: Notify,
    ls_size: u16,
}

impl Dir {
    /// Starts the fetcher and returns the readable handle.
    pub(crate) fn open(
        client: Arc<dyn ProxyApi>,
        dentry_cache: Arc<DentryCache>,
        path: String,
        ls_size: u16,
    ) -> Arc<Dir> {
        let dir = Arc::new(Dir {
            state: Mutex::new(DirState {
                entries: VecDeque::new(),
                start_key: String::new(),
                status: LsStatus::Fetching,
                cache_size: ls_size as usize,
                error: None,
            }),
            notify: Notify::new(),
            ls_size,
        });

        debug!("open dir {}, ls_size {}", path, ls_size);

        let fetcher = dir.clone();
        tokio::spawn(async move { fetcher.fetch(client, dentry_cache, path).await });

        dir
    }

    async fn fetch(&self, client: Arc<dyn ProxyApi>, dentry_cache: Arc<DentryCache>, path: String) {
        loop {
            let start_key = {
                let st = self.state.lock().unwrap();
                if st.status == LsStatus::UserAbort {
                    return;
                }
                // bounded readahead
                if st.entries.len() > st.cache_size {
                    None
                } else {
                    Some(st.start_key.clone())
                }
            };
            let start_key = match start_key {
                Some(key) => key,
                None => {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    continue;
                }
            };

            let page = match client.readdir_ex(&path, &start_key, self.ls_size).await {
                Ok(page) => page,
                Err(e) => {
                    error!("readdirex failed for {}: {}", path, e);
                    let mut st = self.state.lock().unwrap();
                    st.status = LsStatus::Error;
                    st.error = Some(e);
                    drop(st);
                    self.notify.notify_one();
                    return;
                }
            };

            debug!("read dir page, start {:?} len {}", start_key, page.len());
            let done = page.len() < self.ls_size as usize;

            {
                let mut st = self.state.lock().unwrap();
                if done {
                    st.status = LsStatus::Done;
                } else if let Some(last) = page.last() {
                    st.start_key = last.name.clone();
                }
                st.entries.extend(page.iter().cloned());
            }
            self.notify.notify_one();

            for entry in &page {
                let child = if path == "/" {
                    format!("/{}", entry.name)
                } else {
                    format!("{}/{}", path, entry.name)
                };
                dentry_cache.put(&child, entry.clone());
            }

            if done {
                return;
            }
        }
    }

    /// Takes up to `count` entries, blocking while the fetcher is behind.
    /// An empty result means end of directory.
    pub async fn readdir(&self, count: usize) -> FsResult<Vec<Dentry>> {
        loop {
            {
                let mut st = self.state.lock().unwrap();

                // readers asking for big batches deserve deeper readahead
                if count * 2 > st.cache_size {
                    st.cache_size = count * 2;
                }

                match st.status {
                    LsStatus::Error => {
                        return Err(st.error.clone().unwrap_or(FsError::Errno(Errno::EIO)));
                    }
                    LsStatus::UserAbort => {
                        return Ok(Vec::new());
                    }
                    LsStatus::Done if st.entries.is_empty() => {
                        return Ok(Vec::new());
                    }
                    LsStatus::Fetching if st.entries.len() < count => {}
                    _ => {
                        let take = count.min(st.entries.len());
                        return Ok(st.entries.drain(..take).collect());
                    }
                }
            }

            self.notify.notified().await;
        }
    }

    /// Caller abort; the fetcher stops at its next page boundary.
    pub fn close_dir(&self) {
        let mut st = self.state.lock().unwrap();
        if st.status == LsStatus::Fetching {
            st.status = LsStatus::UserAbort;
        }
        drop(st);
        self.notify.notify_one();
    }

    pub fn status(&self) -> LsStatus {
        self.state.lock().unwrap().status
    }
}
