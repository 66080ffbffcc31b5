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
use crate::http::HttpClient;
use crate::metrics::ClientMetrics;
use async_trait::async_trait;
use log::{debug, warn};
use proxyfs_common::conf::RetryConf;
use proxyfs_common::proto::*;
use proxyfs_common::{FsError, FsResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

/// HTTP implementation of [`ProxyApi`]. Transport-class failures are retried
/// with `attempt * retry_factor + retry_gap` backoff; terminal proxy codes
/// are mapped to errno and returned as-is.
pub struct ProxyClient {
    http: HttpClient,
    retry: RetryConf,
    metrics: Arc<ClientMetrics>,
}

impl ProxyClient {
    pub fn new(http: HttpClient, retry: RetryConf, metrics: Arc<ClientMetrics>) -> Self {
        Self {
            http,
            retry,
            metrics,
        }
    }

    async fn try_req<P, R>(&self, uri: &'static str, params: &P) -> FsResult<R>
    where
        P: Serialize + Debug + Sync,
        R: DeserializeOwned + ProxyResp,
    {
        let mut last_err = None;

        for attempt in 0..=self.retry.retry_times {
            ClientMetrics::incr(&self.metrics.proxy_calls);

            match self.http.post_json::<P, R>(uri, params).await {
                Ok(resp) => {
                    if resp.code() == 0 {
                        return Ok(resp);
                    }
                    warn!(
                        "proxy {} failed, code {} msg {:?}, req {:?}",
                        uri,
                        resp.code(),
                        resp.msg(),
                        params
                    );
                    return Err(FsError::from_code(resp.code(), resp.msg()));
                }
                Err(e) if e.is_retryable() => {
                    debug!("proxy {} attempt {} failed: {}", uri, attempt + 1, e);
                    ClientMetrics::incr(&self.metrics.proxy_retries);
                    last_err = Some(e);

                    let backoff = attempt as u64 * self.retry.retry_factor_ms
                        + self.retry.retry_gap_ms;
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| FsError::transport("retry budget exhausted", true)))
    }
}

#[async_trait]
impl ProxyApi for ProxyClient {
    async fn open(&self, path: &str, flag: u32, mode: u32) -> FsResult<u64> {
        let req = OpenRequest {
            path,
            openflag: flag,
            mode,
        };
        debug!("proxy open {:?}", req);
        let resp: OpenResponse = self.try_req(URL_OPEN, &req).await?;
        Ok(resp.id)
    }

    async fn read(&self, id: u64, off: u64, len: u64) -> FsResult<Vec<u8>> {
        debug!("proxy read id {} off {} len {}", id, off, len);
        let req = ReadRequest { id, off, len };
        let resp: ReadResponse = self.try_req(URL_READ, &req).await?;
        Ok(resp.data)
    }

    async fn write(&self, id: u64, off: u64, data: &[u8]) -> FsResult<()> {
        debug!("proxy write id {} off {} len {}", id, off, data.len());
        let req = WriteRequest {
            id,
            off,
            len: data.len() as u64,
            data,
        };
        let _: EmptyResponse = self.try_req(URL_WRITE, &req).await?;
        Ok(())
    }

    async fn fsync(&self, id: u64) -> FsResult<()> {
        let req = FsyncRequest { id };
        let _: EmptyResponse = self.try_req(URL_FSYNC, &req).await?;
        Ok(())
    }

    async fn truncate(&self, path: &str, offset: u64) -> FsResult<()> {
        let req = TruncateRequest { path, offset };
        let _: EmptyResponse = self.try_req(URL_TRUNCATE, &req).await?;
        Ok(())
    }

    async fn stat(&self, path: &str) -> FsResult<InoInfo> {
        let req = PathRequest { path };
        let resp: StatResponse = self.try_req(URL_STAT, &req).await?;
        Ok(resp.data)
    }

    async fn stat_fs(&self, path: &str) -> FsResult<StatfsInfo> {
        let req = PathRequest { path };
        let resp: StatfsResponse = self.try_req(URL_STATFS, &req).await?;
        Ok(resp.data)
    }

    async fn readdir_ex(&self, path: &str, from: &str, limit: u16) -> FsResult<Vec<Dentry>> {
        let req = ReaddirExRequest { path, from, limit };
        let resp: ReaddirExResponse = self.try_req(URL_READDIR_EX, &req).await?;
        Ok(resp.data)
    }

    async fn mkdir(&self, path: &str, mode: u32) -> FsResult<()> {
        let req = MkdirRequest { path, mode };
        let _: EmptyResponse = self.try_req(URL_MKDIR, &req).await?;
        Ok(())
    }

    async fn rmdir(&self, path: &str) -> FsResult<()> {
        let req = PathRequest { path };
        let _: EmptyResponse = self.try_req(URL_RMDIR, &req).await?;
        Ok(())
    }

    async fn rmdir_tree(&self, path: &str) -> FsResult<()> {
        let req = PathRequest { path };
        let _: EmptyResponse = self.try_req(URL_RMDIR_TREE, &req).await?;
        Ok(())
    }

    async fn unlink(&self, path: &str) -> FsResult<()> {
        let req = PathRequest { path };
        let _: EmptyResponse = self.try_req(URL_UNLINK, &req).await?;
        Ok(())
    }

    async fn link(&self, path: &str, new_path: &str) -> FsResult<()> {
        let req = LinkRequest {
            path,
            newpath: new_path,
        };
        let _: EmptyResponse = self.try_req(URL_LINK, &req).await?;
        Ok(())
    }

    async fn symlink(&self, path: &str, new_path: &str) -> FsResult<()> {
        let req = LinkRequest {
            path,
            newpath: new_path,
        };
        let _: EmptyResponse = self.try_req(URL_SYMLINK, &req).await?;
        Ok(())
    }

    async fn rename(&self, path: &str, dst_path: &str) -> FsResult<()> {
        let req = RenameRequest {
            path,
            destpath: dst_path,
        };
        let _: EmptyResponse = self.try_req(URL_RENAME, &req).await?;
        Ok(())
    }

    async fn set_attr(&self, req: SetAttrRequest) -> FsResult<()> {
        let _: EmptyResponse = self.try_req(URL_SET_ATTR, &req).await?;
        Ok(())
    }

    async fn set_xattr(
        &self,
        path: &str,
        flag: SetXattrFlag,
        name: &str,
        value: &[u8],
    ) -> FsResult<()> {
        let req = SetXattrRequest {
            path,
            flag,
            name,
            data: value,
        };
        debug!("proxy setXattr path {} name {}", path, name);
        let _: EmptyResponse = self.try_req(URL_SET_XATTR, &req).await?;
        Ok(())
    }

    async fn get_xattr(&self, path: &str, name: &str) -> FsResult<Vec<u8>> {
        let req = XattrNameRequest { path, name };
        let resp: GetXattrResponse = self.try_req(URL_GET_XATTR, &req).await?;
        Ok(resp.data)
    }

    async fn list_xattr(&self, path: &str) -> FsResult<Vec<String>> {
        let req = PathRequest { path };
        let resp: ListXattrResponse = self.try_req(URL_LIST_XATTR, &req).await?;
        Ok(resp.data)
    }

    async fn remove_xattr(&self, path: &str, name: &str) -> FsResult<()> {
        let req = XattrNameRequest { path, name };
        let _: EmptyResponse = self.try_req(URL_REMOVE_XATTR, &req).await?;
        Ok(())
    }
}
