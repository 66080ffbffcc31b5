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

use crate::error::{Errno, FsError, FsResult};
use serde::{Deserialize, Serialize};

/// Client configuration, loaded from a JSON file. Every field has a default
/// so partial configs stay valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConf {
    /// Mount path prefix. Non-empty, absolute, no trailing slash (except "/").
    pub path: String,

    /// Comma separated proxy host list, e.g. "10.0.0.1:9600,10.0.0.2:9600".
    pub proxy_hosts: String,

    pub user_id: String,
    pub user_token: String,
    pub app_id: String,
    pub dev_id: String,
    pub package_name: String,
    pub client_tag: String,

    pub open_file_max: usize,
    pub ls_size: u16,

    pub dentry_cache_size: usize,
    pub dentry_cache_expire_ms: u64,

    pub cache: CacheConf,
    pub http: HttpConf,
    pub retry: RetryConf,
}

impl Default for ClientConf {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            proxy_hosts: "".to_string(),
            user_id: "UidNotSet".to_string(),
            user_token: "TokenNotSet".to_string(),
            app_id: "".to_string(),
            dev_id: "".to_string(),
            package_name: "".to_string(),
            client_tag: "proxyfs".to_string(),
            open_file_max: 100_000,
            ls_size: 2000,
            dentry_cache_size: 0,
            dentry_cache_expire_ms: 500,
            cache: CacheConf::default(),
            http: HttpConf::default(),
            retry: RetryConf::default(),
        }
    }
}

/// Read/write cache tuning. `buffer_max == 0` disables the cache entirely.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConf {
    /// Block buffers preallocated per cache (read and write each own a pool).
    pub buffer_max: usize,
    /// A buffer untouched for this long is flushed (write) or freed (read).
    pub expire_ms: u64,
    /// Expiry sweeper wake interval.
    pub check_gap_ms: u64,
    /// Async flush workers; 0 selects synchronous-only writes.
    pub sync_routine: usize,
    /// Prefetch workers; 0 disables read-ahead.
    pub prefetch_routine: usize,
    /// Window growth factor once a sequential pattern is detected.
    pub prefetch_times: u32,
}

impl Default for CacheConf {
    fn default() -> Self {
        Self {
            buffer_max: 0,
            expire_ms: 500,
            check_gap_ms: 300,
            sync_routine: 64,
            prefetch_routine: 64,
            prefetch_times: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConf {
    /// Whole-request timeout; 0 means no client-side timeout.
    pub client_timeout_ms: u64,
    /// Maximum hosts tried per request; 0 falls back to the host count.
    pub try_times: u32,
    /// Seconds a failed host stays penalized in selection.
    pub fails_period_s: i64,
}

impl Default for HttpConf {
    fn default() -> Self {
        Self {
            client_timeout_ms: 0,
            try_times: 0,
            fails_period_s: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConf {
    /// Retries after the first attempt.
    pub retry_times: usize,
    /// Base pause between attempts.
    pub retry_gap_ms: u64,
    /// Extra pause multiplied by the attempt index.
    pub retry_factor_ms: u64,
}

impl Default for RetryConf {
    fn default() -> Self {
        Self {
            retry_times: 3,
            retry_gap_ms: 5000,
            retry_factor_ms: 10_000,
        }
    }
}

impl ClientConf {
    pub fn from_file(path: impl AsRef<std::path::Path>) -> FsResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| FsError::common(format!("read conf {:?}: {}", path.as_ref(), e)))?;
        let conf: ClientConf = serde_json::from_str(&text)?;
        conf.validate()?;
        Ok(conf)
    }

    pub fn validate(&self) -> FsResult<()> {
        if !Self::valid_path(&self.path) {
            log::error!("illegal mount path {:?}", self.path);
            return Err(FsError::Errno(Errno::EPERM));
        }
        if self.hosts().is_empty() {
            return Err(FsError::common("proxy_hosts must not be empty"));
        }
        Ok(())
    }

    /// Non-empty, absolute, no trailing slash except the root itself.
    pub fn valid_path(path: &str) -> bool {
        let bytes = path.as_bytes();
        !bytes.is_empty() && bytes[0] == b'/' && !(bytes.len() > 1 && bytes[bytes.len() - 1] == b'/')
    }

    pub fn hosts(&self) -> Vec<String> {
        self.proxy_hosts
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn rw_cache_enabled(&self) -> bool {
        self.cache.buffer_max > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let conf = ClientConf::default();
        assert_eq!(conf.open_file_max, 100_000);
        assert_eq!(conf.ls_size, 2000);
        assert_eq!(conf.cache.sync_routine, 64);
        assert_eq!(conf.cache.prefetch_times, 8);
        assert_eq!(conf.retry.retry_times, 3);
        assert!(!conf.rw_cache_enabled());
    }

    #[test]
    fn test_partial_json() {
        let conf: ClientConf = serde_json::from_str(
            r#"{"path":"/data","proxy_hosts":"h1:80, h2:80","cache":{"buffer_max":16}}"#,
        )
        .unwrap();
        assert_eq!(conf.path, "/data");
        assert_eq!(conf.hosts(), vec!["h1:80", "h2:80"]);
        assert_eq!(conf.cache.buffer_max, 16);
        // untouched fields keep defaults
        assert_eq!(conf.cache.expire_ms, 500);
        assert!(conf.validate().is_ok());
    }

    #[test]
    fn test_path_rule() {
        assert!(ClientConf::valid_path("/"));
        assert!(ClientConf::valid_path("/a/b"));
        assert!(!ClientConf::valid_path(""));
        assert!(!ClientConf::valid_path("a/b"));
        assert!(!ClientConf::valid_path("/a/"));
    }
}
