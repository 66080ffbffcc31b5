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

//! Proxy wire protocol: endpoint paths, request headers, and the JSON
//! request/response bodies. Field names are part of the wire contract and
//! must match the proxy exactly.

use serde::{Deserialize, Serialize};

// Proxy endpoints.
pub const URL_MKDIR: &str = "/api/v1/mkdir";
pub const URL_READDIR_EX: &str = "/api/v1/readdirex";
pub const URL_RMDIR: &str = "/api/v1/rmdir";
pub const URL_RMDIR_TREE: &str = "/api/v1/rmdirtree";
pub const URL_OPEN: &str = "/api/v1/open";
pub const URL_READ: &str = "/api/v1/read";
pub const URL_WRITE: &str = "/api/v1/write";
pub const URL_FSYNC: &str = "/api/v1/fsync";
pub const URL_TRUNCATE: &str = "/api/v1/truncate";
pub const URL_UNLINK: &str = "/api/v1/unlink";
pub const URL_LINK: &str = "/api/v1/link";
pub const URL_SYMLINK: &str = "/api/v1/symbol_link";
pub const URL_SET_XATTR: &str = "/api/v1/setXattr";
pub const URL_GET_XATTR: &str = "/api/v1/getXattr";
pub const URL_REMOVE_XATTR: &str = "/api/v1/removeXattr";
pub const URL_LIST_XATTR: &str = "/api/v1/listXattr";
pub const URL_SET_ATTR: &str = "/api/v1/setattr";
pub const URL_RENAME: &str = "/api/v1/rename";
pub const URL_STAT: &str = "/api/v1/stat";
pub const URL_STATFS: &str = "/api/v1/statDir";

// Request headers.
pub const HDR_REQ_ID: &str = "X-ReqId";
pub const HDR_USER_ID: &str = "X-UserId";
pub const HDR_APP_ID: &str = "X-AppId";
pub const HDR_DEV_ID: &str = "X-DevId";
pub const HDR_PKG_NAME: &str = "X-PkgName";
pub const HDR_CLIENT_LABEL: &str = "X-ClientLabel";
pub const HDR_TOKEN: &str = "X-Token";
pub const HDR_CLIENT_ID: &str = "X-ClientId";
pub const HDR_TS: &str = "X-Ts";

/// Mount mode bitmask; the mount grants a subset of these classes.
pub type MountMode = u32;
pub const MOUNT_MODE_READ: MountMode = 0x01;
pub const MOUNT_MODE_WRITE: MountMode = 0x02;
pub const MOUNT_MODE_DEL: MountMode = 0x04;

// Proxy open flags (not POSIX flags).
pub const OPEN_FLAG_CREATE: u32 = 1;
pub const OPEN_FLAG_OPEN: u32 = 2;

/// The block size is fixed for every file.
pub const DEFAULT_BLOCK_SIZE: u32 = 1024 * 1024;

pub const SYS_PERM: u32 = 0o777;

// setattr flag bits.
pub type SetAttrFlag = u32;
pub const SET_ATTR_MODE: SetAttrFlag = 1 << 0;
pub const SET_ATTR_UID: SetAttrFlag = 1 << 1;
pub const SET_ATTR_GID: SetAttrFlag = 1 << 2;
pub const SET_ATTR_MTIME: SetAttrFlag = 1 << 3;
pub const SET_ATTR_ATIME: SetAttrFlag = 1 << 4;
pub const SET_ATTR_OWNER: SetAttrFlag = 1 << 5;
pub const SET_ATTR_GROUP: SetAttrFlag = 1 << 6;

// setxattr flag bits.
pub type SetXattrFlag = u32;
pub const SET_XATTR_CREATE: SetXattrFlag = 1;
pub const SET_XATTR_REPLACE: SetXattrFlag = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DentryType {
    File = 1,
    Dir = 2,
    Link = 3,
    Fifo = 4,
    Sock = 5,
}

impl DentryType {
    pub fn from_mode(mode: u32) -> Self {
        match mode & libc::S_IFMT {
            libc::S_IFDIR => DentryType::Dir,
            libc::S_IFREG => DentryType::File,
            libc::S_IFIFO => DentryType::Fifo,
            libc::S_IFSOCK => DentryType::Sock,
            _ => DentryType::Link,
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DentryType::File => "regular",
            DentryType::Dir => "directory",
            DentryType::Link => "link",
            DentryType::Fifo => "fifo",
            DentryType::Sock => "socket",
        }
    }
}

/// Byte payloads ride in JSON as base64 strings.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<T, S>(data: &T, ser: S) -> Result<S::Ok, S::Error>
    where
        T: AsRef<[u8]> + ?Sized,
        S: Serializer,
    {
        STANDARD.encode(data.as_ref()).serialize(ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let text = Option::<String>::deserialize(de)?.unwrap_or_default();
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

/// Status part embedded in every proxy reply; `code == 0` is success.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyStatus {
    #[serde(default)]
    pub code: i32,
    #[serde(default, rename = "msg")]
    pub msg: String,
}

pub trait ProxyResp {
    fn status(&self) -> &ProxyStatus;

    fn code(&self) -> i32 {
        self.status().code
    }

    fn msg(&self) -> &str {
        &self.status().msg
    }
}

macro_rules! impl_proxy_resp {
    ($($ty:ty),+) => {
        $(impl ProxyResp for $ty {
            fn status(&self) -> &ProxyStatus {
                &self.status
            }
        })+
    };
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InoInfo {
    #[serde(default, rename = "ino")]
    pub inode: u64,
    #[serde(default)]
    pub mode: u32,
    #[serde(default)]
    pub nlink: u32,
    #[serde(default, rename = "sz")]
    pub size: u64,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
    #[serde(default, rename = "mt")]
    pub mtime: u64,
    #[serde(default, rename = "ct")]
    pub ctime: u64,
    #[serde(default, rename = "at")]
    pub atime: u64,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub group: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dentry {
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "ino")]
    pub inode: u64,
    #[serde(default, rename = "type")]
    pub dtype: u32,
    #[serde(default)]
    pub info: Option<InoInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatfsInfo {
    #[serde(default)]
    pub files: u32,
    #[serde(default)]
    pub folders: u32,
    #[serde(default)]
    pub fbytes: u64,
    #[serde(default)]
    pub fubytes: u64,
    #[serde(default)]
    pub rfiles: u64,
    #[serde(default)]
    pub rfolders: u64,
    #[serde(default)]
    pub rbytes: u64,
    #[serde(default)]
    pub rubytes: u64,
}

// Requests.

#[derive(Debug, Serialize)]
pub struct PathRequest<'a> {
    pub path: &'a str,
}

#[derive(Debug, Serialize)]
pub struct OpenRequest<'a> {
    pub path: &'a str,
    pub openflag: u32,
    pub mode: u32,
}

#[derive(Debug, Serialize)]
pub struct ReadRequest {
    pub id: u64,
    pub off: u64,
    pub len: u64,
}

#[derive(Serialize)]
pub struct WriteRequest<'a> {
    pub id: u64,
    pub off: u64,
    pub len: u64,
    #[serde(with = "base64_bytes")]
    pub data: &'a [u8],
}

impl std::fmt::Debug for WriteRequest<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteRequest")
            .field("id", &self.id)
            .field("off", &self.off)
            .field("len", &self.len)
            .finish()
    }
}

#[derive(Debug, Serialize)]
pub struct FsyncRequest {
    pub id: u64,
}

#[derive(Debug, Serialize)]
pub struct TruncateRequest<'a> {
    pub path: &'a str,
    pub offset: u64,
}

#[derive(Debug, Serialize)]
pub struct MkdirRequest<'a> {
    pub path: &'a str,
    pub mode: u32,
}

#[derive(Debug, Serialize)]
pub struct ReaddirExRequest<'a> {
    pub path: &'a str,
    pub from: &'a str,
    pub limit: u16,
}

#[derive(Debug, Serialize)]
pub struct LinkRequest<'a> {
    pub path: &'a str,
    pub newpath: &'a str,
}

#[derive(Debug, Serialize)]
pub struct RenameRequest<'a> {
    pub path: &'a str,
    pub destpath: &'a str,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SetAttrRequest {
    pub path: String,
    pub flag: SetAttrFlag,
    pub uid: u32,
    pub gid: u32,
    pub mtime: u64,
    pub atime: u64,
    pub mode: u32,
    pub owner: String,
    pub group: String,
}

#[derive(Serialize)]
pub struct SetXattrRequest<'a> {
    pub path: &'a str,
    pub flag: SetXattrFlag,
    pub name: &'a str,
    #[serde(with = "base64_bytes")]
    pub data: &'a [u8],
}

impl std::fmt::Debug for SetXattrRequest<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SetXattrRequest")
            .field("path", &self.path)
            .field("flag", &self.flag)
            .field("name", &self.name)
            .field("len", &self.data.len())
            .finish()
    }
}

#[derive(Debug, Serialize)]
pub struct XattrNameRequest<'a> {
    pub path: &'a str,
    pub name: &'a str,
}

// Responses.

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EmptyResponse {
    #[serde(flatten)]
    pub status: ProxyStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpenResponse {
    #[serde(flatten)]
    pub status: ProxyStatus,
    #[serde(default, rename = "data")]
    pub id: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReadResponse {
    #[serde(flatten)]
    pub status: ProxyStatus,
    #[serde(default, with = "base64_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatResponse {
    #[serde(flatten)]
    pub status: ProxyStatus,
    #[serde(default)]
    pub data: InoInfo,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatfsResponse {
    #[serde(flatten)]
    pub status: ProxyStatus,
    #[serde(default)]
    pub data: StatfsInfo,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReaddirExResponse {
    #[serde(flatten)]
    pub status: ProxyStatus,
    #[serde(default)]
    pub data: Vec<Dentry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GetXattrResponse {
    #[serde(flatten)]
    pub status: ProxyStatus,
    #[serde(default, with = "base64_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListXattrResponse {
    #[serde(flatten)]
    pub status: ProxyStatus,
    #[serde(default)]
    pub data: Vec<String>,
}

impl_proxy_resp!(
    EmptyResponse,
    OpenResponse,
    ReadResponse,
    StatResponse,
    StatfsResponse,
    ReaddirExResponse,
    GetXattrResponse,
    ListXattrResponse
);
