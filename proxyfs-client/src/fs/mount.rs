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

use crate::api::{ProxyApi, ProxyClient};
use crate::cache::RwCache;
use crate::fs::dentry_cache::DentryCache;
use crate::fs::dir::Dir;
use crate::fs::file_table::{FileEntry, FileHandleTable};
use crate::http::HttpClient;
use crate::metrics::ClientMetrics;
use log::{debug, error, info, warn};
use proxyfs_common::conf::ClientConf;
use proxyfs_common::proto::*;
use proxyfs_common::utils::{base_name, client_id, parent_path};
use proxyfs_common::{Errno, FsError, FsResult};
use std::sync::{Arc, Mutex};

/// Largest single read or write accepted at the façade.
const MAX_IO_SIZE: usize = 512 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountStatus {
    New,
    Mounted,
    Deleted,
}

/// Directory usage summary derived from the proxy reply.
#[derive(Debug, Clone, Default)]
pub struct Statfs {
    pub block_size: u32,
    pub blocks: u32,
    pub files: u32,
    pub folders: u32,
    pub fbytes: u64,
    pub fubytes: u64,
    pub rfiles: u64,
    pub rfolders: u64,
    pub rbytes: u64,
    pub rubytes: u64,
}

struct MountState {
    status: MountStatus,
    mode: MountMode,
}

/// POSIX-like entry points over the proxy: path and permission gating,
/// handle bookkeeping, block-cache routing, and dentry invalidation.
pub struct ProxyFileSystem {
    conf: ClientConf,
    state: Mutex<MountState>,
    client: Arc<dyn ProxyApi>,
    file_table: FileHandleTable,
    dentry_cache: Arc<DentryCache>,
    rw_cache: Option<Arc<RwCache>>,
    metrics: Arc<ClientMetrics>,
}

impl ProxyFileSystem {
    /// Builds the HTTP-backed filesystem from configuration.
    pub fn new(conf: ClientConf) -> FsResult<Self> {
        conf.validate()?;

        let metrics = Arc::new(ClientMetrics::default());
        let id = client_id(&conf.path);
        let http = HttpClient::new(&conf, id)?;
        let client = Arc::new(ProxyClient::new(http, conf.retry.clone(), metrics.clone()));

        Ok(Self::assemble(conf, client, metrics))
    }

    /// Same wiring with a caller-provided proxy; the test path.
    pub fn with_client(conf: ClientConf, client: Arc<dyn ProxyApi>) -> FsResult<Self> {
        conf.validate()?;
        Ok(Self::assemble(conf, client, Arc::new(ClientMetrics::default())))
    }

    fn assemble(
        conf: ClientConf,
        client: Arc<dyn ProxyApi>,
        metrics: Arc<ClientMetrics>,
    ) -> Self {
        let rw_cache = if conf.rw_cache_enabled() {
            Some(RwCache::new(client.clone(), metrics.clone(), &conf.cache))
        } else {
            None
        };

        let dentry_cache = Arc::new(DentryCache::new(
            conf.dentry_cache_size,
            conf.dentry_cache_expire_ms,
        ));

        let file_table = FileHandleTable::new(conf.open_file_max);

        Self {
            conf,
            state: Mutex::new(MountState {
                status: MountStatus::New,
                mode: 0,
            }),
            client,
            file_table,
            dentry_cache,
            rw_cache,
            metrics,
        }
    }

    pub fn conf(&self) -> &ClientConf {
        &self.conf
    }

    pub fn metrics(&self) -> &ClientMetrics {
        &self.metrics
    }

    pub fn status(&self) -> MountStatus {
        self.state.lock().unwrap().status
    }

    /// Activates the mount with full permissions and probes the root path.
    pub async fn mount(&self) -> FsResult<()> {
        {
            let mut st = self.state.lock().unwrap();
            if st.status != MountStatus::New {
                return Err(FsError::Errno(Errno::EPERM));
            }
            st.mode = MOUNT_MODE_READ | MOUNT_MODE_WRITE | MOUNT_MODE_DEL;
            st.status = MountStatus::Mounted;
        }

        if let Err(e) = self.stat(&self.conf.path).await {
            error!("mount stat failed for {}: {}", self.conf.path, e);
            return Err(e);
        }

        info!("mount ready at {}", self.conf.path);
        Ok(())
    }

    /// Unmount: flush and stop the caches, then refuse further operations.
    pub async fn unmount(&self) {
        debug!("unmount start for {}", self.conf.path);

        if let Some(rw) = &self.rw_cache {
            rw.close_all().await;
        }

        self.state.lock().unwrap().status = MountStatus::Deleted;
        info!("unmounted {}, metrics: {}", self.conf.path, self.metrics.snapshot());
    }

    /// Gate for every operation: mounted, permitted, and a valid in-tree
    /// path.
    fn check_mount(&self, path: &str, perm: MountMode) -> FsResult<()> {
        let st = self.state.lock().unwrap();
        if st.status != MountStatus::Mounted {
            return Err(FsError::Errno(Errno::EPERM));
        }

        if perm == 0 || perm & st.mode != perm {
            warn!(
                "permission check failed, path {} perm {:#x} mode {:#x}",
                path, perm, st.mode
            );
            return Err(FsError::Errno(Errno::EACCES));
        }
        drop(st);

        if !ClientConf::valid_path(path) {
            warn!("invalid path {:?}", path);
            return Err(FsError::Errno(Errno::EACCES));
        }

        if !path.starts_with(&self.conf.path) {
            warn!("path {} outside mount root {}", path, self.conf.path);
            return Err(FsError::Errno(Errno::EACCES));
        }

        Ok(())
    }

    fn use_rw_cache(&self, entry: &FileEntry) -> Option<&Arc<RwCache>> {
        if entry.direct_io {
            return None;
        }
        self.rw_cache.as_ref()
    }

    // File operations.

    pub async fn open(&self, path: &str, flags: i32, mode: u32) -> FsResult<i32> {
        info!("open {} flags {:#o} mode {:#o}", path, flags, mode);

        let mut perm = MOUNT_MODE_READ;
        if flags & libc::O_WRONLY != 0 {
            perm = MOUNT_MODE_WRITE;
        } else if flags & libc::O_RDWR != 0 {
            perm |= MOUNT_MODE_WRITE;
        }
        if flags & (libc::O_CREAT | libc::O_TRUNC) != 0 {
            perm |= MOUNT_MODE_WRITE;
        }

        self.check_mount(path, perm)?;

        // everything but symlinks is stored as a regular file
        let mut mode = mode;
        if mode & libc::S_IFMT != libc::S_IFLNK {
            mode = mode & SYS_PERM | libc::S_IFREG;
        }

        let open_flag = if flags & libc::O_CREAT != 0 {
            OPEN_FLAG_CREATE
        } else {
            OPEN_FLAG_OPEN
        };

        let id = match self.client.open(path, open_flag, mode).await {
            Ok(id) => id,
            Err(e) => {
                error!("proxy open failed for {}: {}", path, e);
                return Err(e);
            }
        };

        let entry = FileEntry::new(id, path.to_string(), flags, mode);
        let entry = match self.file_table.insert(entry) {
            Ok(entry) => entry,
            Err(_) => {
                error!("open failed, too many files, path {} id {}", path, id);
                return Err(FsError::Errno(Errno::EBADF));
            }
        };

        self.dentry_cache.remove(parent_path(path));

        debug!("open done, fd {} entry {:?}", entry.handle, entry);
        Ok(entry.handle)
    }

    pub async fn close(&self, fd: i32) -> FsResult<()> {
        let entry = self
            .file_table
            .get(fd)
            .map_err(|_| FsError::Errno(Errno::EBADF))?;

        debug!("close fd {} id {} path {}", fd, entry.id, entry.path);

        if let Some(rw) = self.use_rw_cache(&entry) {
            if self.file_table.is_last_ref(entry.id) {
                if let Err(e) = rw.close(&entry).await {
                    error!("cache close failed for fd {}: {}", fd, e);
                    return Err(FsError::Errno(Errno::EBADF));
                }
            } else if let Err(e) = rw.flush(&entry).await {
                error!("cache flush failed for fd {}: {}", fd, e);
                return Err(FsError::Errno(Errno::EBADF));
            }
        }

        self.file_table.close(fd)?;
        Ok(())
    }

    pub async fn read(&self, fd: i32, buf: &mut [u8], offset: u64) -> FsResult<usize> {
        if buf.len() > MAX_IO_SIZE {
            return Err(FsError::Errno(Errno::EIO));
        }

        let entry = self.file_table.get(fd)?;
        if entry.open_flags & libc::O_WRONLY == libc::O_WRONLY {
            return Err(FsError::Errno(Errno::EPERM));
        }

        let size = match self.use_rw_cache(&entry) {
            Some(rw) => rw.read(&entry, buf, offset).await?,
            None => {
                let data = self.client.read(entry.id, offset, buf.len() as u64).await?;
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                ClientMetrics::add(&self.metrics.read_bytes, n as u64);
                n
            }
        };

        Ok(size)
    }

    pub async fn write(&self, fd: i32, buf: &[u8], offset: u64) -> FsResult<usize> {
        if buf.len() > MAX_IO_SIZE {
            return Err(FsError::Errno(Errno::EIO));
        }

        let entry = self
            .file_table
            .get(fd)
            .map_err(|_| FsError::Errno(Errno::EBADF))?;
        if entry.open_flags & (libc::O_RDWR | libc::O_WRONLY) == 0 {
            return Err(FsError::Errno(Errno::EPERM));
        }

        let result = match self.use_rw_cache(&entry) {
            Some(rw) => rw.write(&entry, buf, offset).await,
            None => {
                self.client.write(entry.id, offset, buf).await?;
                ClientMetrics::add(&self.metrics.write_bytes, buf.len() as u64);
                Ok(buf.len())
            }
        };

        // size and mtime are stale now, cached or not
        self.dentry_cache.remove(&entry.path);

        result
    }

    /// Empties the client-side cache for the handle and asks the proxy to
    /// sync the file.
    pub async fn flush(&self, fd: i32) -> FsResult<()> {
        let entry = self
            .file_table
            .get(fd)
            .map_err(|_| FsError::Errno(Errno::EBADF))?;

        if let Some(rw) = self.use_rw_cache(&entry) {
            rw.flush(&entry).await?;
        }

        self.client.fsync(entry.id).await
    }

    pub async fn fsync(&self, fd: i32, _datasync: i32) -> FsResult<()> {
        self.flush(fd).await
    }

    pub async fn truncate(&self, path: &str, length: u64) -> FsResult<()> {
        self.check_mount(path, MOUNT_MODE_WRITE)?;

        debug!("truncate {} len {}", path, length);

        // dirty data must land before the proxy changes the length
        if let Some(rw) = &self.rw_cache {
            let dentry = self.do_stat(path).await?;
            if DentryType::from_mode(dentry.info.as_ref().map(|i| i.mode).unwrap_or(0))
                == DentryType::File
            {
                let fe = FileEntry::simple(dentry.inode);
                rw.flush(&fe).await?;
                rw.release(&fe).await;
            }
        }

        self.client.truncate(path, length).await?;

        self.dentry_cache.remove(path);
        Ok(())
    }

    pub async fn ftruncate(&self, fd: i32, length: u64) -> FsResult<()> {
        let entry = self
            .file_table
            .get(fd)
            .map_err(|_| FsError::Errno(Errno::EBADF))?;

        if entry.open_flags & (libc::O_RDWR | libc::O_WRONLY) == 0 {
            return Err(FsError::Errno(Errno::EPERM));
        }

        self.truncate(&entry.path, length).await
    }

    // Metadata operations.

    async fn do_stat(&self, path: &str) -> FsResult<Dentry> {
        let info = self.client.stat(path).await?;

        Ok(Dentry {
            name: base_name(path).to_string(),
            inode: info.inode,
            dtype: DentryType::from_mode(info.mode).as_u32(),
            info: Some(info),
        })
    }

    pub async fn stat(&self, path: &str) -> FsResult<Dentry> {
        self.check_mount(path, MOUNT_MODE_READ)?;

        if let Some(dentry) = self.dentry_cache.get(path) {
            ClientMetrics::incr(&self.metrics.dentry_hits);
            return Ok(dentry);
        }

        let mut dentry = self.do_stat(path).await?;

        // a buffered write may imply a larger size than the proxy knows
        if let Some(rw) = &self.rw_cache {
            if dentry.dtype == DentryType::File.as_u32() {
                let fe = FileEntry::simple(dentry.inode);
                match rw.stat_size(&fe).await {
                    Ok(cache_size) => {
                        if let Some(info) = dentry.info.as_mut() {
                            if info.size < cache_size {
                                info.size = cache_size;
                            }
                        }
                    }
                    Err(_) => {
                        // racing flush; the proxy answer is authoritative now
                        dentry = self.do_stat(path).await?;
                    }
                }
            }
        }

        self.dentry_cache.put(path, dentry.clone());

        debug!("stat {} -> ino {} type {}", path, dentry.inode, dentry.dtype);
        Ok(dentry)
    }

    pub async fn fstat(&self, fd: i32) -> FsResult<Dentry> {
        let entry = self
            .file_table
            .get(fd)
            .map_err(|_| FsError::Errno(Errno::EBADF))?;

        self.check_mount(&entry.path, MOUNT_MODE_READ)?;

        if let Some(dentry) = self.dentry_cache.get(&entry.path) {
            ClientMetrics::incr(&self.metrics.dentry_hits);
            return Ok(dentry);
        }

        let cache_size = match &self.rw_cache {
            Some(rw) => rw.stat_size(&entry).await.unwrap_or(0),
            None => 0,
        };

        let mut dentry = self.do_stat(&entry.path).await?;
        if let Some(info) = dentry.info.as_mut() {
            if info.size < cache_size {
                info.size = cache_size;
            }
        }

        self.dentry_cache.put(&entry.path, dentry.clone());
        Ok(dentry)
    }

    pub async fn statfs(&self, path: &str) -> FsResult<Statfs> {
        self.check_mount(path, MOUNT_MODE_READ)?;

        let info = self.client.stat_fs(path).await?;

        let blk_size = 4 * 1024u64;
        Ok(Statfs {
            block_size: blk_size as u32,
            blocks: (info.fbytes / blk_size) as u32,
            files: info.files,
            folders: info.folders,
            fbytes: info.fbytes,
            fubytes: info.fubytes,
            rfiles: info.rfiles,
            rfolders: info.rfolders,
            rbytes: info.rbytes,
            rubytes: info.rubytes,
        })
    }

    // Directory operations.

    pub async fn mkdir(&self, path: &str, mode: u32) -> FsResult<()> {
        debug!("mkdir {} mode {:#o}", path, mode);
        self.check_mount(path, MOUNT_MODE_WRITE)?;

        let mode = mode & SYS_PERM | libc::S_IFDIR;
        self.client.mkdir(path, mode).await?;

        self.dentry_cache.remove(parent_path(path));
        Ok(())
    }

    /// `mkdir -p`: every missing ancestor under the mount root, existing
    /// directories tolerated.
    pub async fn mkdir_all(&self, path: &str, mode: u32) -> FsResult<()> {
        debug!("mkdir_all {}", path);
        self.check_mount(path, MOUNT_MODE_WRITE)?;

        let mode = mode & SYS_PERM | libc::S_IFDIR;

        let mut base = self.conf.path.clone();
        for part in path[self.conf.path.len()..].split('/') {
            if part.is_empty() {
                continue;
            }

            if base == "/" {
                base = format!("/{}", part);
            } else {
                base = format!("{}/{}", base, part);
            }

            match self.client.mkdir(&base, mode).await {
                Ok(()) => {
                    self.dentry_cache.remove(parent_path(&base));
                }
                Err(FsError::Errno(Errno::EEXIST)) => continue,
                Err(e) => {
                    error!("mkdir failed for {}: {}", base, e);
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    /// Only fifo and socket nodes exist on the proxy side.
    pub async fn mknod(&self, path: &str, mode: u32, dev: i32) -> FsResult<()> {
        debug!("mknod {} mode {:#o}", path, mode);
        self.check_mount(path, MOUNT_MODE_WRITE)?;

        if (mode & libc::S_IFIFO == 0 && mode & libc::S_IFSOCK == 0) || dev != 0 {
            return Err(FsError::Errno(Errno::ENOTSUP));
        }

        let mode = if mode & libc::S_IFIFO != 0 {
            mode & SYS_PERM | mode & libc::S_IFIFO
        } else {
            mode & SYS_PERM | mode & libc::S_IFSOCK
        };

        self.client.open(path, OPEN_FLAG_CREATE, mode).await?;

        self.dentry_cache.remove(parent_path(path));
        Ok(())
    }

    /// Opens a streaming directory handle; entries arrive in the
    /// background and land in the dentry cache as they come.
    pub fn opendir(&self, path: &str) -> FsResult<Arc<Dir>> {
        self.check_mount(path, MOUNT_MODE_READ)?;

        Ok(Dir::open(
            self.client.clone(),
            self.dentry_cache.clone(),
            path.to_string(),
            self.conf.ls_size,
        ))
    }

    pub async fn rename(&self, src_path: &str, dst_path: &str) -> FsResult<()> {
        self.check_mount(src_path, MOUNT_MODE_WRITE)?;

        if let Err(e) = self.client.rename(src_path, dst_path).await {
            error!("rename {} -> {} failed: {}", src_path, dst_path, e);
            return Err(e);
        }

        // both subtrees changed identity
        self.dentry_cache.remove_prefix(src_path);
        self.dentry_cache.remove_prefix(dst_path);
        Ok(())
    }

    pub async fn unlink(&self, path: &str) -> FsResult<()> {
        self.check_mount(path, MOUNT_MODE_DEL)?;

        debug!("unlink {}", path);
        self.client.unlink(path).await?;

        self.dentry_cache.remove(path);
        Ok(())
    }

    pub async fn rmdir(&self, path: &str) -> FsResult<()> {
        self.check_mount(path, MOUNT_MODE_DEL)?;

        self.client.rmdir(path).await?;

        self.dentry_cache.remove(path);
        Ok(())
    }

    /// Recursive removal; invalidates the whole prefix.
    pub async fn rmdir_tree(&self, path: &str) -> FsResult<()> {
        self.check_mount(path, MOUNT_MODE_DEL)?;

        self.client.rmdir_tree(path).await?;

        self.dentry_cache.remove_prefix(path);
        Ok(())
    }

    // Attribute operations.

    pub async fn utime(&self, path: &str, mtime: u64, atime: u64) -> FsResult<()> {
        self.check_mount(path, MOUNT_MODE_WRITE)?;

        let req = SetAttrRequest {
            path: path.to_string(),
            flag: SET_ATTR_MTIME | SET_ATTR_ATIME,
            mtime,
            atime,
            ..Default::default()
        };
        self.client.set_attr(req).await?;

        self.dentry_cache.remove(path);
        Ok(())
    }

    pub async fn chmod(&self, path: &str, mode: u32) -> FsResult<()> {
        self.check_mount(path, MOUNT_MODE_WRITE)?;

        let req = SetAttrRequest {
            path: path.to_string(),
            flag: SET_ATTR_MODE,
            mode,
            ..Default::default()
        };
        self.client.set_attr(req).await?;

        self.dentry_cache.remove(path);
        Ok(())
    }

    pub async fn fchmod(&self, fd: i32, mode: u32) -> FsResult<()> {
        let entry = self
            .file_table
            .get(fd)
            .map_err(|_| FsError::Errno(Errno::EBADF))?;
        self.chmod(&entry.path, mode).await
    }

    pub async fn chown(&self, path: &str, uid: u32, gid: u32) -> FsResult<()> {
        self.check_mount(path, MOUNT_MODE_WRITE)?;

        let req = SetAttrRequest {
            path: path.to_string(),
            flag: SET_ATTR_UID | SET_ATTR_GID,
            uid,
            gid,
            ..Default::default()
        };
        self.client.set_attr(req).await?;

        self.dentry_cache.remove(path);
        Ok(())
    }

    // Link operations.

    pub async fn link(&self, path: &str, link_path: &str) -> FsResult<()> {
        self.check_mount(path, MOUNT_MODE_WRITE)?;

        self.client.link(path, link_path).await?;

        self.dentry_cache.remove(path);
        Ok(())
    }

    pub async fn symlink(&self, path: &str, link_path: &str) -> FsResult<()> {
        self.check_mount(path, MOUNT_MODE_WRITE)?;

        self.client.symlink(path, link_path).await?;

        self.dentry_cache.remove(path);
        Ok(())
    }

    /// Resolves a symlink target from the stat reply.
    pub async fn read_link(&self, path: &str) -> FsResult<String> {
        self.check_mount(path, MOUNT_MODE_READ)?;

        let info = self.client.stat(path).await?;
        if DentryType::from_mode(info.mode) != DentryType::Link {
            return Err(FsError::Errno(Errno::EINVAL));
        }

        Ok(info.target)
    }

    // Extended attributes.

    pub async fn set_xattr(
        &self,
        path: &str,
        name: &str,
        value: &[u8],
        flag: SetXattrFlag,
    ) -> FsResult<()> {
        self.check_mount(path, MOUNT_MODE_WRITE)?;

        self.client.set_xattr(path, flag, name, value).await?;

        self.dentry_cache.remove(path);
        Ok(())
    }

    pub async fn get_xattr(&self, path: &str, name: &str) -> FsResult<Vec<u8>> {
        self.check_mount(path, MOUNT_MODE_READ)?;

        self.client.get_xattr(path, name).await
    }

    pub async fn list_xattr(&self, path: &str) -> FsResult<Vec<String>> {
        self.check_mount(path, MOUNT_MODE_READ)?;

        self.client.list_xattr(path).await
    }

    pub async fn remove_xattr(&self, path: &str, name: &str) -> FsResult<()> {
        self.check_mount(path, MOUNT_MODE_WRITE)?;

        self.client.remove_xattr(path, name).await?;

        self.dentry_cache.remove(path);
        Ok(())
    }

    pub async fn fset_xattr(
        &self,
        fd: i32,
        name: &str,
        value: &[u8],
        flag: SetXattrFlag,
    ) -> FsResult<()> {
        let entry = self.file_table.get(fd)?;
        self.set_xattr(&entry.path, name, value, flag).await
    }

    pub async fn fget_xattr(&self, fd: i32, name: &str) -> FsResult<Vec<u8>> {
        let entry = self.file_table.get(fd)?;
        self.get_xattr(&entry.path, name).await
    }

    pub async fn flist_xattr(&self, fd: i32) -> FsResult<Vec<String>> {
        let entry = self.file_table.get(fd)?;
        self.list_xattr(&entry.path).await
    }

    pub async fn fremove_xattr(&self, fd: i32, name: &str) -> FsResult<()> {
        let entry = self.file_table.get(fd)?;
        self.remove_xattr(&entry.path, name).await
    }
}
