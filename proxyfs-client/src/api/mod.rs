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

mod proxy_client;

pub use proxy_client::ProxyClient;

use async_trait::async_trait;
use proxyfs_common::proto::{Dentry, InoInfo, SetAttrRequest, SetXattrFlag, StatfsInfo};
use proxyfs_common::FsResult;

/// Typed view of every proxy endpoint. The production implementation speaks
/// JSON over HTTP; tests substitute an in-memory store.
#[async_trait]
pub trait ProxyApi: Send + Sync {
    async fn open(&self, path: &str, flag: u32, mode: u32) -> FsResult<u64>;

    async fn read(&self, id: u64, off: u64, len: u64) -> FsResult<Vec<u8>>;

    async fn write(&self, id: u64, off: u64, data: &[u8]) -> FsResult<()>;

    async fn fsync(&self, id: u64) -> FsResult<()>;

    async fn truncate(&self, path: &str, offset: u64) -> FsResult<()>;

    async fn stat(&self, path: &str) -> FsResult<InoInfo>;

    async fn stat_fs(&self, path: &str) -> FsResult<StatfsInfo>;

    async fn readdir_ex(&self, path: &str, from: &str, limit: u16) -> FsResult<Vec<Dentry>>;

    async fn mkdir(&self, path: &str, mode: u32) -> FsResult<()>;

    async fn rmdir(&self, path: &str) -> FsResult<()>;

    async fn rmdir_tree(&self, path: &str) -> FsResult<()>;

    async fn unlink(&self, path: &str) -> FsResult<()>;

    async fn link(&self, path: &str, new_path: &str) -> FsResult<()>;

    async fn symlink(&self, path: &str, new_path: &str) -> FsResult<()>;

    async fn rename(&self, path: &str, dst_path: &str) -> FsResult<()>;

    async fn set_attr(&self, req: SetAttrRequest) -> FsResult<()>;

    async fn set_xattr(
        &self,
        path: &str,
        flag: SetXattrFlag,
        name: &str,
        value: &[u8],
    ) -> FsResult<()>;

    async fn get_xattr(&self, path: &str, name: &str) -> FsResult<Vec<u8>>;

    async fn list_xattr(&self, path: &str) -> FsResult<Vec<String>>;

    async fn remove_xattr(&self, path: &str, name: &str) -> FsResult<()>;
}
