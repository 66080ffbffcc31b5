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

#![allow(dead_code)]

use async_trait::async_trait;
use proxyfs_client::api::ProxyApi;
use proxyfs_common::conf::ClientConf;
use proxyfs_common::proto::*;
use proxyfs_common::{Errno, FsError, FsResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
struct Node {
    id: u64,
    mode: u32,
    data: Vec<u8>,
    target: String,
    xattrs: HashMap<String, Vec<u8>>,
}

impl Node {
    fn dir(id: u64, mode: u32) -> Self {
        Self {
            id,
            mode: mode & 0o777 | libc::S_IFDIR,
            data: Vec::new(),
            target: String::new(),
            xattrs: HashMap::new(),
        }
    }

    fn file(id: u64, mode: u32) -> Self {
        Self {
            id,
            mode,
            data: Vec::new(),
            target: String::new(),
            xattrs: HashMap::new(),
        }
    }

    fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    fn info(&self) -> InoInfo {
        InoInfo {
            inode: self.id,
            mode: self.mode,
            nlink: 1,
            size: self.data.len() as u64,
            target: self.target.clone(),
            ..Default::default()
        }
    }
}

struct MemState {
    nodes: HashMap<String, Node>,
    by_id: HashMap<u64, String>,
    next_id: u64,
    write_error: Option<FsError>,
    read_error: Option<FsError>,
}

/// In-memory stand-in for the proxy. Counts calls and supports error
/// injection so cache behavior can be pinned down.
pub struct MemProxy {
    state: Mutex<MemState>,
    pub open_calls: AtomicU64,
    pub read_calls: AtomicU64,
    pub write_calls: AtomicU64,
    pub fsync_calls: AtomicU64,
    pub stat_calls: AtomicU64,
}

impl MemProxy {
    pub fn new() -> Arc<Self> {
        let mut nodes = HashMap::new();
        nodes.insert("/".to_string(), Node::dir(1, 0o755));

        Arc::new(Self {
            state: Mutex::new(MemState {
                nodes,
                by_id: HashMap::new(),
                next_id: 2,
                write_error: None,
                read_error: None,
            }),
            open_calls: AtomicU64::new(0),
            read_calls: AtomicU64::new(0),
            write_calls: AtomicU64::new(0),
            fsync_calls: AtomicU64::new(0),
            stat_calls: AtomicU64::new(0),
        })
    }

    pub fn fail_writes_with(&self, err: Option<FsError>) {
        self.state.lock().unwrap().write_error = err;
    }

    pub fn fail_reads_with(&self, err: Option<FsError>) {
        self.state.lock().unwrap().read_error = err;
    }

    pub fn file_content(&self, path: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .nodes
            .get(path)
            .map(|n| n.data.clone())
    }

    /// Overwrites stored bytes without touching counters; lets tests prove
    /// a result did not come from the proxy.
    pub fn poison_content(&self, path: &str, byte: u8) {
        let mut st = self.state.lock().unwrap();
        if let Some(node) = st.nodes.get_mut(path) {
            node.data.iter_mut().for_each(|b| *b = byte);
        }
    }

    pub fn reads(&self) -> u64 {
        self.read_calls.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> u64 {
        self.write_calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ProxyApi for MemProxy {
    async fn open(&self, path: &str, flag: u32, mode: u32) -> FsResult<u64> {
        self.open_calls.fetch_add(1, Ordering::Relaxed);
        let mut st = self.state.lock().unwrap();

        if let Some(node) = st.nodes.get(path) {
            return Ok(node.id);
        }

        if flag != OPEN_FLAG_CREATE {
            return Err(FsError::Errno(Errno::ENOENT));
        }

        let id = st.next_id;
        st.next_id += 1;
        st.nodes.insert(path.to_string(), Node::file(id, mode));
        st.by_id.insert(id, path.to_string());
        Ok(id)
    }

    async fn read(&self, id: u64, off: u64, len: u64) -> FsResult<Vec<u8>> {
        self.read_calls.fetch_add(1, Ordering::Relaxed);
        let st = self.state.lock().unwrap();

        if let Some(e) = &st.read_error {
            return Err(e.clone());
        }

        let path = st.by_id.get(&id).ok_or(FsError::Errno(Errno::ENOENT))?;
        let node = st.nodes.get(path).ok_or(FsError::Errno(Errno::ENOENT))?;

        let start = (off as usize).min(node.data.len());
        let end = (off as usize + len as usize).min(node.data.len());
        Ok(node.data[start..end].to_vec())
    }

    async fn write(&self, id: u64, off: u64, data: &[u8]) -> FsResult<()> {
        self.write_calls.fetch_add(1, Ordering::Relaxed);
        let mut st = self.state.lock().unwrap();

        if let Some(e) = &st.write_error {
            return Err(e.clone());
        }

        let path = st
            .by_id
            .get(&id)
            .ok_or(FsError::Errno(Errno::ENOENT))?
            .clone();
        let node = st.nodes.get_mut(&path).ok_or(FsError::Errno(Errno::ENOENT))?;

        let end = off as usize + data.len();
        if node.data.len() < end {
            node.data.resize(end, 0);
        }
        node.data[off as usize..end].copy_from_slice(data);
        Ok(())
    }

    async fn fsync(&self, _id: u64) -> FsResult<()> {
        self.fsync_calls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn truncate(&self, path: &str, offset: u64) -> FsResult<()> {
        let mut st = self.state.lock().unwrap();
        let node = st.nodes.get_mut(path).ok_or(FsError::Errno(Errno::ENOENT))?;
        node.data.resize(offset as usize, 0);
        Ok(())
    }

    async fn stat(&self, path: &str) -> FsResult<InoInfo> {
        self.stat_calls.fetch_add(1, Ordering::Relaxed);
        let st = self.state.lock().unwrap();
        let node = st.nodes.get(path).ok_or(FsError::Errno(Errno::ENOENT))?;
        Ok(node.info())
    }

    async fn stat_fs(&self, path: &str) -> FsResult<StatfsInfo> {
        let st = self.state.lock().unwrap();
        if !st.nodes.contains_key(path) {
            return Err(FsError::Errno(Errno::ENOENT));
        }

        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };

        let mut info = StatfsInfo::default();
        for (p, node) in &st.nodes {
            if !p.starts_with(&prefix) || p.as_str() == path {
                continue;
            }
            if node.is_dir() {
                info.folders += 1;
                info.rfolders += 1;
            } else {
                info.files += 1;
                info.rfiles += 1;
                info.fbytes += node.data.len() as u64;
                info.rbytes += node.data.len() as u64;
            }
        }
        Ok(info)
    }

    async fn readdir_ex(&self, path: &str, from: &str, limit: u16) -> FsResult<Vec<Dentry>> {
        let st = self.state.lock().unwrap();
        if !st.nodes.contains_key(path) {
            return Err(FsError::Errno(Errno::ENOENT));
        }

        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };

        let mut names: Vec<&String> = st
            .nodes
            .keys()
            .filter(|p| {
                p.starts_with(&prefix)
                    && p.len() > prefix.len()
                    && !p[prefix.len()..].contains('/')
            })
            .collect();
        names.sort();

        let entries = names
            .into_iter()
            .map(|p| {
                let node = &st.nodes[p];
                Dentry {
                    name: p[prefix.len()..].to_string(),
                    inode: node.id,
                    dtype: DentryType::from_mode(node.mode).as_u32(),
                    info: Some(node.info()),
                }
            })
            .filter(|d| d.name.as_str() > from)
            .take(limit as usize)
            .collect();

        Ok(entries)
    }

    async fn mkdir(&self, path: &str, mode: u32) -> FsResult<()> {
        let mut st = self.state.lock().unwrap();
        if st.nodes.contains_key(path) {
            return Err(FsError::Errno(Errno::EEXIST));
        }

        let id = st.next_id;
        st.next_id += 1;
        st.nodes.insert(path.to_string(), Node::dir(id, mode));
        Ok(())
    }

    async fn rmdir(&self, path: &str) -> FsResult<()> {
        let mut st = self.state.lock().unwrap();
        let prefix = format!("{}/", path);
        if st.nodes.keys().any(|p| p.starts_with(&prefix)) {
            return Err(FsError::Errno(Errno::ENOTEMPTY));
        }

        match st.nodes.remove(path) {
            Some(_) => Ok(()),
            None => Err(FsError::Errno(Errno::ENOENT)),
        }
    }

    async fn rmdir_tree(&self, path: &str) -> FsResult<()> {
        let mut st = self.state.lock().unwrap();
        let prefix = format!("{}/", path);
        let victims: Vec<String> = st
            .nodes
            .keys()
            .filter(|p| p.as_str() == path || p.starts_with(&prefix))
            .cloned()
            .collect();
        if victims.is_empty() {
            return Err(FsError::Errno(Errno::ENOENT));
        }

        for p in victims {
            if let Some(node) = st.nodes.remove(&p) {
                st.by_id.remove(&node.id);
            }
        }
        Ok(())
    }

    async fn unlink(&self, path: &str) -> FsResult<()> {
        let mut st = self.state.lock().unwrap();
        match st.nodes.remove(path) {
            Some(node) => {
                st.by_id.remove(&node.id);
                Ok(())
            }
            None => Err(FsError::Errno(Errno::ENOENT)),
        }
    }

    async fn link(&self, path: &str, new_path: &str) -> FsResult<()> {
        let mut st = self.state.lock().unwrap();
        let node = st
            .nodes
            .get(path)
            .ok_or(FsError::Errno(Errno::ENOENT))?
            .clone();
        st.nodes.insert(new_path.to_string(), node);
        Ok(())
    }

    async fn symlink(&self, path: &str, new_path: &str) -> FsResult<()> {
        let mut st = self.state.lock().unwrap();
        let id = st.next_id;
        st.next_id += 1;

        let mut node = Node::file(id, 0o777 | libc::S_IFLNK);
        node.target = path.to_string();
        st.nodes.insert(new_path.to_string(), node);
        Ok(())
    }

    async fn rename(&self, path: &str, dst_path: &str) -> FsResult<()> {
        let mut st = self.state.lock().unwrap();
        let prefix = format!("{}/", path);
        let moved: Vec<String> = st
            .nodes
            .keys()
            .filter(|p| p.as_str() == path || p.starts_with(&prefix))
            .cloned()
            .collect();
        if moved.is_empty() {
            return Err(FsError::Errno(Errno::ENOENT));
        }

        for old in moved {
            let new = format!("{}{}", dst_path, &old[path.len()..]);
            if let Some(node) = st.nodes.remove(&old) {
                st.by_id.insert(node.id, new.clone());
                st.nodes.insert(new, node);
            }
        }
        Ok(())
    }

    async fn set_attr(&self, req: SetAttrRequest) -> FsResult<()> {
        let mut st = self.state.lock().unwrap();
        let node = st
            .nodes
            .get_mut(&req.path)
            .ok_or(FsError::Errno(Errno::ENOENT))?;

        if req.flag & SET_ATTR_MODE != 0 {
            node.mode = node.mode & libc::S_IFMT | req.mode & 0o7777;
        }
        Ok(())
    }

    async fn set_xattr(
        &self,
        path: &str,
        _flag: SetXattrFlag,
        name: &str,
        value: &[u8],
    ) -> FsResult<()> {
        let mut st = self.state.lock().unwrap();
        let node = st.nodes.get_mut(path).ok_or(FsError::Errno(Errno::ENOENT))?;
        node.xattrs.insert(name.to_string(), value.to_vec());
        Ok(())
    }

    async fn get_xattr(&self, path: &str, name: &str) -> FsResult<Vec<u8>> {
        let st = self.state.lock().unwrap();
        let node = st.nodes.get(path).ok_or(FsError::Errno(Errno::ENOENT))?;
        node.xattrs
            .get(name)
            .cloned()
            .ok_or(FsError::Errno(Errno::ENODATA))
    }

    async fn list_xattr(&self, path: &str) -> FsResult<Vec<String>> {
        let st = self.state.lock().unwrap();
        let node = st.nodes.get(path).ok_or(FsError::Errno(Errno::ENOENT))?;
        let mut names: Vec<String> = node.xattrs.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn remove_xattr(&self, path: &str, name: &str) -> FsResult<()> {
        let mut st = self.state.lock().unwrap();
        let node = st.nodes.get_mut(path).ok_or(FsError::Errno(Errno::ENOENT))?;
        node.xattrs.remove(name);
        Ok(())
    }
}

/// Cache-enabled test configuration.
pub fn cached_conf() -> ClientConf {
    let mut conf = ClientConf::default();
    conf.path = "/".to_string();
    conf.proxy_hosts = "127.0.0.1:9600".to_string();
    conf.dentry_cache_size = 1024;
    conf.dentry_cache_expire_ms = 60_000;
    conf.cache.buffer_max = 16;
    conf.cache.expire_ms = 60_000;
    conf.cache.check_gap_ms = 50;
    conf.cache.sync_routine = 4;
    conf.cache.prefetch_routine = 4;
    conf.cache.prefetch_times = 8;
    conf
}

/// Polls until `cond` holds or the deadline passes.
pub async fn wait_until(cond: impl Fn() -> bool, what: &str) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}
