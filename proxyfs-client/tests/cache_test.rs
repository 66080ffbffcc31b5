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

//! Cache-path scenarios driven through the full filesystem façade against
//! the in-memory proxy.

mod common;

use common::{cached_conf, wait_until, MemProxy};
use proxyfs_client::ProxyFileSystem;
use proxyfs_common::{Errno, FsError};
use std::sync::atomic::Ordering;
use std::sync::Arc;

const MB: usize = 1024 * 1024;

async fn mounted_fs(mem: &Arc<MemProxy>) -> ProxyFileSystem {
    let fs = ProxyFileSystem::with_client(cached_conf(), mem.clone()).unwrap();
    fs.mount().await.unwrap();
    fs
}

#[tokio::test]
async fn test_small_write_then_read() {
    let mem = MemProxy::new();
    let fs = mounted_fs(&mem).await;

    let fd = fs
        .open("/a", libc::O_RDWR | libc::O_CREAT, 0o644)
        .await
        .unwrap();
    assert_eq!(fs.write(fd, b"hello", 0).await.unwrap(), 5);

    let mut buf = [0u8; 5];
    assert_eq!(fs.read(fd, &mut buf, 0).await.unwrap(), 5);
    assert_eq!(&buf, b"hello");

    // nothing flushed yet: the size comes from the dirty tail
    let dentry = fs.stat("/a").await.unwrap();
    assert_eq!(dentry.info.unwrap().size, 5);

    fs.close(fd).await.unwrap();
    assert_eq!(mem.file_content("/a").unwrap(), b"hello");

    fs.unmount().await;
}

#[tokio::test]
async fn test_cross_block_write_coalescing() {
    let mem = MemProxy::new();
    let fs = mounted_fs(&mem).await;

    let fd = fs
        .open("/b", libc::O_RDWR | libc::O_CREAT, 0o644)
        .await
        .unwrap();

    // two adjacent half-block writes fill block 0, which flushes on its own
    let a = vec![b'A'; MB / 2];
    let b = vec![b'B'; MB / 2];
    assert_eq!(fs.write(fd, &a, 0).await.unwrap(), a.len());
    assert_eq!(fs.write(fd, &b, (MB / 2) as u64).await.unwrap(), b.len());

    wait_until(|| mem.writes() == 1, "full block auto flush").await;

    // a third write starts block 1 and stays buffered until flush
    let c = vec![b'C'; 100];
    assert_eq!(fs.write(fd, &c, MB as u64).await.unwrap(), c.len());
    assert_eq!(mem.writes(), 1);

    fs.flush(fd).await.unwrap();
    assert_eq!(mem.writes(), 2);

    let data = mem.file_content("/b").unwrap();
    assert_eq!(data.len(), MB + 100);
    assert!(data[..MB / 2].iter().all(|&x| x == b'A'));
    assert!(data[MB / 2..MB].iter().all(|&x| x == b'B'));
    assert!(data[MB..].iter().all(|&x| x == b'C'));

    fs.close(fd).await.unwrap();
    fs.unmount().await;
}

#[tokio::test]
async fn test_read_merges_inflight_dirty_data() {
    let mem = MemProxy::new();
    let fs = mounted_fs(&mem).await;

    let fd = fs
        .open("/c", libc::O_RDWR | libc::O_CREAT, 0o644)
        .await
        .unwrap();

    fs.write(fd, b"XYZ", 100).await.unwrap();
    assert_eq!(mem.writes(), 0);

    let mut buf = [0u8; 3];
    assert_eq!(fs.read(fd, &mut buf, 100).await.unwrap(), 3);
    assert_eq!(&buf, b"XYZ");

    fs.close(fd).await.unwrap();
    fs.unmount().await;
}

#[tokio::test]
async fn test_overwrite_invalidates_read_cache() {
    let mem = MemProxy::new();
    let fs = mounted_fs(&mem).await;

    // two full blocks on the proxy
    let fd = fs
        .open("/d", libc::O_RDWR | libc::O_CREAT, 0o644)
        .await
        .unwrap();
    fs.write(fd, &vec![b'o'; 2 * MB], 0).await.unwrap();
    fs.flush(fd).await.unwrap();

    // a read at the file start arms the prefetch window over block 1
    let mut buf = vec![0u8; 4096];
    fs.read(fd, &mut buf, 0).await.unwrap();
    wait_until(
        || fs.metrics().prefetch_reads.load(Ordering::Relaxed) >= 1,
        "prefetch population",
    )
    .await;

    // overwrite the head of block 1; the clean copy must go
    fs.write(fd, b"Z", MB as u64).await.unwrap();

    // poison the proxy so only the dirty byte can produce 'Z'
    mem.poison_content("/d", b'!');

    let mut one = [0u8; 1];
    assert_eq!(fs.read(fd, &mut one, MB as u64).await.unwrap(), 1);
    assert_eq!(&one, b"Z");

    fs.close(fd).await.unwrap();
    fs.unmount().await;
}

#[tokio::test]
async fn test_flush_error_drops_buffer_on_enoent() {
    let mem = MemProxy::new();
    let fs = mounted_fs(&mem).await;

    let fd = fs
        .open("/e", libc::O_RDWR | libc::O_CREAT, 0o644)
        .await
        .unwrap();
    fs.write(fd, b"data", 0).await.unwrap();

    mem.fail_writes_with(Some(FsError::Errno(Errno::ENOENT)));
    let err = fs.flush(fd).await.unwrap_err();
    assert_eq!(err, FsError::Errno(Errno::ENOENT));
    mem.fail_writes_with(None);

    // the buffer is gone: another flush writes nothing
    let writes = mem.writes();
    fs.flush(fd).await.unwrap();
    assert_eq!(mem.writes(), writes);

    // and reads fall through to the (empty) proxy file
    let mut buf = [0u8; 4];
    assert_eq!(fs.read(fd, &mut buf, 0).await.unwrap(), 0);

    fs.close(fd).await.unwrap();
    fs.unmount().await;
}

#[tokio::test]
async fn test_sequential_prefetch_serves_next_block() {
    let mem = MemProxy::new();
    let fs = mounted_fs(&mem).await;

    let fd = fs
        .open("/f", libc::O_RDWR | libc::O_CREAT, 0o644)
        .await
        .unwrap();
    let mut body = vec![b'1'; MB];
    body.extend(vec![b'2'; MB]);
    fs.write(fd, &body, 0).await.unwrap();
    fs.flush(fd).await.unwrap();

    let mut buf = vec![0u8; 4096];
    fs.read(fd, &mut buf, 0).await.unwrap();
    assert!(buf.iter().all(|&x| x == b'1'));

    wait_until(
        || fs.metrics().prefetch_reads.load(Ordering::Relaxed) >= 1,
        "block 1 prefetched",
    )
    .await;

    let hits_before = fs.metrics().cache_read_hits.load(Ordering::Relaxed);
    fs.read(fd, &mut buf, MB as u64).await.unwrap();
    assert!(buf.iter().all(|&x| x == b'2'));
    assert!(fs.metrics().cache_read_hits.load(Ordering::Relaxed) > hits_before);

    fs.close(fd).await.unwrap();
    fs.unmount().await;
}

#[tokio::test]
async fn test_flush_is_idempotent() {
    let mem = MemProxy::new();
    let fs = mounted_fs(&mem).await;

    let fd = fs
        .open("/g", libc::O_RDWR | libc::O_CREAT, 0o644)
        .await
        .unwrap();
    fs.write(fd, b"abc", 0).await.unwrap();

    fs.flush(fd).await.unwrap();
    let writes = mem.writes();
    assert_eq!(writes, 1);

    fs.flush(fd).await.unwrap();
    assert_eq!(mem.writes(), writes);

    fs.close(fd).await.unwrap();
    fs.unmount().await;
}

#[tokio::test]
async fn test_read_crosses_block_boundary_seamlessly() {
    let mem = MemProxy::new();
    let fs = mounted_fs(&mem).await;

    let fd = fs
        .open("/h", libc::O_RDWR | libc::O_CREAT, 0o644)
        .await
        .unwrap();

    // block 0 flushed, block 1 dirty
    fs.write(fd, &vec![b'A'; MB], 0).await.unwrap();
    wait_until(|| mem.writes() == 1, "block 0 flush").await;
    fs.write(fd, &vec![b'B'; 100], MB as u64).await.unwrap();

    let mut buf = vec![0u8; MB + 100];
    assert_eq!(fs.read(fd, &mut buf, 0).await.unwrap(), MB + 100);
    assert!(buf[..MB].iter().all(|&x| x == b'A'));
    assert!(buf[MB..].iter().all(|&x| x == b'B'));

    fs.close(fd).await.unwrap();
    fs.unmount().await;
}

#[tokio::test]
async fn test_read_hole_zero_fills_below_dirty_tail() {
    let mem = MemProxy::new();
    let fs = mounted_fs(&mem).await;

    let fd = fs
        .open("/i", libc::O_RDWR | libc::O_CREAT, 0o644)
        .await
        .unwrap();

    // ten flushed bytes, then a dirty island at [100, 103)
    fs.write(fd, b"0123456789", 0).await.unwrap();
    fs.flush(fd).await.unwrap();
    fs.write(fd, b"XYZ", 100).await.unwrap();

    let mut buf = vec![0xFFu8; 103];
    assert_eq!(fs.read(fd, &mut buf, 0).await.unwrap(), 103);
    assert_eq!(&buf[..10], b"0123456789");
    assert!(buf[10..100].iter().all(|&x| x == 0), "hole must read zero");
    assert_eq!(&buf[100..], b"XYZ");

    fs.close(fd).await.unwrap();
    fs.unmount().await;
}

#[tokio::test]
async fn test_two_handles_share_one_file_buffer() {
    let mem = MemProxy::new();
    let fs = mounted_fs(&mem).await;

    let fd1 = fs
        .open("/j", libc::O_RDWR | libc::O_CREAT, 0o644)
        .await
        .unwrap();
    let fd2 = fs.open("/j", libc::O_RDWR, 0o644).await.unwrap();
    assert_ne!(fd1, fd2);

    fs.write(fd1, b"abc", 0).await.unwrap();

    // closing the non-last handle flushes but keeps the caches attached
    fs.close(fd1).await.unwrap();
    assert_eq!(mem.writes(), 1);

    let mut buf = [0u8; 3];
    assert_eq!(fs.read(fd2, &mut buf, 0).await.unwrap(), 3);
    assert_eq!(&buf, b"abc");

    fs.close(fd2).await.unwrap();
    fs.unmount().await;
}

#[tokio::test]
async fn test_zero_length_write() {
    let mem = MemProxy::new();
    let fs = mounted_fs(&mem).await;

    let fd = fs
        .open("/k", libc::O_RDWR | libc::O_CREAT, 0o644)
        .await
        .unwrap();
    assert_eq!(fs.write(fd, b"", 0).await.unwrap(), 0);
    assert_eq!(mem.writes(), 0);

    fs.close(fd).await.unwrap();
    assert_eq!(mem.writes(), 0);
    fs.unmount().await;
}

#[tokio::test]
async fn test_expiry_sweeper_flushes_idle_buffers() {
    let mem = MemProxy::new();
    let mut conf = cached_conf();
    conf.cache.expire_ms = 50;
    conf.cache.check_gap_ms = 20;

    let fs = ProxyFileSystem::with_client(conf, mem.clone()).unwrap();
    fs.mount().await.unwrap();

    let fd = fs
        .open("/l", libc::O_RDWR | libc::O_CREAT, 0o644)
        .await
        .unwrap();
    fs.write(fd, b"idle", 0).await.unwrap();
    assert_eq!(mem.writes(), 0);

    // the sweeper flushes without an explicit flush call
    wait_until(|| mem.writes() == 1, "expiry flush").await;
    assert_eq!(mem.file_content("/l").unwrap(), b"idle");

    fs.close(fd).await.unwrap();
    fs.unmount().await;
}

#[tokio::test]
async fn test_stat_reflects_buffered_size() {
    let mem = MemProxy::new();
    let fs = mounted_fs(&mem).await;

    let fd = fs
        .open("/m", libc::O_RDWR | libc::O_CREAT, 0o644)
        .await
        .unwrap();
    fs.write(fd, &vec![b'x'; 1000], 500).await.unwrap();

    // 500 + 1000 dirty bytes, nothing flushed
    let dentry = fs.fstat(fd).await.unwrap();
    assert_eq!(dentry.info.unwrap().size, 1500);

    fs.close(fd).await.unwrap();
    fs.unmount().await;
}

#[tokio::test]
async fn test_truncate_flushes_dirty_data_first() {
    let mem = MemProxy::new();
    let fs = mounted_fs(&mem).await;

    let fd = fs
        .open("/n", libc::O_RDWR | libc::O_CREAT, 0o644)
        .await
        .unwrap();
    fs.write(fd, b"longcontent", 0).await.unwrap();

    fs.truncate("/n", 4).await.unwrap();
    assert_eq!(mem.file_content("/n").unwrap(), b"long");

    // post-truncate read observes the shortened file
    let mut buf = [0u8; 16];
    assert_eq!(fs.read(fd, &mut buf, 0).await.unwrap(), 4);

    fs.close(fd).await.unwrap();
    fs.unmount().await;
}

#[tokio::test]
async fn test_direct_io_bypasses_cache() {
    let mem = MemProxy::new();
    let fs = mounted_fs(&mem).await;

    let fd = fs
        .open("/o", libc::O_RDWR | libc::O_CREAT | libc::O_DIRECT, 0o644)
        .await
        .unwrap();

    fs.write(fd, b"direct", 0).await.unwrap();
    // the write went straight through
    assert_eq!(mem.writes(), 1);
    assert_eq!(mem.file_content("/o").unwrap(), b"direct");

    let reads = mem.reads();
    let mut buf = [0u8; 6];
    assert_eq!(fs.read(fd, &mut buf, 0).await.unwrap(), 6);
    assert_eq!(&buf, b"direct");
    assert_eq!(mem.reads(), reads + 1);

    fs.close(fd).await.unwrap();
    fs.unmount().await;
}

#[tokio::test]
async fn test_sync_only_mode_full_block_goes_direct() {
    let mem = MemProxy::new();
    let mut conf = cached_conf();
    conf.cache.sync_routine = 0;

    let fs = ProxyFileSystem::with_client(conf, mem.clone()).unwrap();
    fs.mount().await.unwrap();

    let fd = fs
        .open("/p", libc::O_RDWR | libc::O_CREAT, 0o644)
        .await
        .unwrap();

    // a full-block write never touches a buffer in sync-only mode
    fs.write(fd, &vec![b'F'; MB], 0).await.unwrap();
    assert_eq!(mem.writes(), 1);

    // partial writes still coalesce
    fs.write(fd, b"tail", MB as u64).await.unwrap();
    assert_eq!(mem.writes(), 1);
    fs.flush(fd).await.unwrap();
    assert_eq!(mem.writes(), 2);

    fs.close(fd).await.unwrap();
    fs.unmount().await;
}

#[tokio::test]
async fn test_non_adjacent_write_flushes_old_window() {
    let mem = MemProxy::new();
    let fs = mounted_fs(&mem).await;

    let fd = fs
        .open("/q", libc::O_RDWR | libc::O_CREAT, 0o644)
        .await
        .unwrap();

    fs.write(fd, b"aaaa", 0).await.unwrap();
    assert_eq!(mem.writes(), 0);

    // same block, not contiguous: the old window must flush first
    fs.write(fd, b"bbbb", 100).await.unwrap();
    assert_eq!(mem.writes(), 1);

    fs.flush(fd).await.unwrap();
    let data = mem.file_content("/q").unwrap();
    assert_eq!(&data[..4], b"aaaa");
    assert_eq!(&data[100..104], b"bbbb");

    fs.close(fd).await.unwrap();
    fs.unmount().await;
}

#[tokio::test]
async fn test_write_read_round_trip_random_ranges() {
    let mem = MemProxy::new();
    let fs = mounted_fs(&mem).await;

    let fd = fs
        .open("/r", libc::O_RDWR | libc::O_CREAT, 0o644)
        .await
        .unwrap();

    // a patchwork of writes, some flushed, some dirty
    let total = MB + 4096;
    let mut expect = vec![0u8; total];

    let patches: [(usize, u8); 4] = [(0, b'a'), (4096, b'b'), (MB - 2048, b'c'), (MB, b'd')];
    for (off, byte) in patches {
        let chunk = vec![byte; 4096];
        fs.write(fd, &chunk, off as u64).await.unwrap();
        expect[off..off + 4096].copy_from_slice(&chunk);
        fs.flush(fd).await.unwrap();
    }

    let mut buf = vec![0u8; total];
    assert_eq!(fs.read(fd, &mut buf, 0).await.unwrap(), total);
    assert_eq!(buf, expect);

    fs.close(fd).await.unwrap();
    fs.unmount().await;
}
