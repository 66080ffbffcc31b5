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

use thiserror::Error;

/// POSIX errno kinds surfaced at the library boundary. Values are the
/// platform `libc` constants so conversion to a kernel status code is a cast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[repr(i32)]
pub enum Errno {
    #[error("EACCES: permission denied")]
    EACCES = libc::EACCES,
    #[error("EAGAIN: try again")]
    EAGAIN = libc::EAGAIN,
    #[error("EBADF: bad file descriptor")]
    EBADF = libc::EBADF,
    #[error("EBUSY: resource busy")]
    EBUSY = libc::EBUSY,
    #[error("EEXIST: already exists")]
    EEXIST = libc::EEXIST,
    #[error("EFAULT: bad address")]
    EFAULT = libc::EFAULT,
    #[error("EFBIG: file too large")]
    EFBIG = libc::EFBIG,
    #[error("EINVAL: invalid argument")]
    EINVAL = libc::EINVAL,
    #[error("EIO: input/output error")]
    EIO = libc::EIO,
    #[error("EISDIR: is a directory")]
    EISDIR = libc::EISDIR,
    #[error("ELOOP: too many levels of symbolic links")]
    ELOOP = libc::ELOOP,
    #[error("EMLINK: too many links")]
    EMLINK = libc::EMLINK,
    #[error("ENAMETOOLONG: file name too long")]
    ENAMETOOLONG = libc::ENAMETOOLONG,
    #[error("ENODATA: no data available")]
    ENODATA = libc::ENODATA,
    #[error("ENOENT: no such file or directory")]
    ENOENT = libc::ENOENT,
    #[error("ENOTCONN: not connected")]
    ENOTCONN = libc::ENOTCONN,
    #[error("ENOTDIR: not a directory")]
    ENOTDIR = libc::ENOTDIR,
    #[error("ENOTEMPTY: directory not empty")]
    ENOTEMPTY = libc::ENOTEMPTY,
    #[error("ENOTSUP: operation not supported")]
    ENOTSUP = libc::ENOTSUP,
    #[error("EPERM: operation not permitted")]
    EPERM = libc::EPERM,
    #[error("ERANGE: result out of range")]
    ERANGE = libc::ERANGE,
}

impl Errno {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

/// Library error type. Errors carry a POSIX errno, or a transport failure
/// tagged with whether the transport layer considers it retryable.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FsError {
    #[error("{0}")]
    Errno(#[from] Errno),

    #[error("transport: {msg}")]
    Transport { msg: String, retryable: bool },

    #[error("json codec: {0}")]
    Json(String),

    #[error("{0}")]
    Common(String),
}

pub type FsResult<T> = Result<T, FsError>;

impl FsError {
    pub fn transport(msg: impl Into<String>, retryable: bool) -> Self {
        FsError::Transport {
            msg: msg.into(),
            retryable,
        }
    }

    pub fn common(msg: impl Into<String>) -> Self {
        FsError::Common(msg.into())
    }

    /// Maps a non-zero proxy reply code to the library error.
    pub fn from_code(code: i32, msg: &str) -> Self {
        let errno = match code {
            1001 => Errno::EAGAIN,
            1002 => Errno::EEXIST,
            1003 => Errno::ENOENT,
            1004 => Errno::ENOTSUP,
            1005 => Errno::EIO,
            1006 => Errno::ENOTEMPTY,
            1007 => Errno::EPERM,
            _ => {
                log::warn!("unknown proxy code {}: {}", code, msg);
                Errno::EIO
            }
        };
        FsError::Errno(errno)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, FsError::Transport { retryable: true, .. })
    }

    /// The errno reported across the kernel boundary. Transport and codec
    /// failures that survive the retry budget degrade to EIO.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::Errno(e) => e.as_i32(),
            _ => Errno::EIO.as_i32(),
        }
    }
}

impl From<serde_json::Error> for FsError {
    fn from(value: serde_json::Error) -> Self {
        FsError::Json(value.to_string())
    }
}

/// Builds an `FsError::Common` from format arguments.
#[macro_export]
macro_rules! err_fs {
    ($($arg:tt)*) => {
        $crate::error::FsError::Common(format!($($arg)*))
    };
}
