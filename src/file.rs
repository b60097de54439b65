//! Open-file objects and the per-session file table.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};

use log::debug;
use parking_lot::Mutex;

use crate::fs::{FsFile, FsStat};
use crate::page::PgwBook;

const FTAB_SIZE: usize = 16;

/// File access mode as granted at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

/// Why a lock request was refused: the conflicting holders.
#[derive(Debug, Clone, Copy)]
pub struct LockDenied {
    pub readers: u32,
    pub writers: u32,
}

/// Admission control for shared file access. Lock keys are the per-file hash
/// keys, so identical backend objects opened via different paths contend on
/// the same entry.
pub trait FileLock: Send + Sync {
    fn lock(&self, key: &str, mode: AccessMode, force: bool) -> Result<(), LockDenied>;

    fn unlock(&self, key: &str, mode: AccessMode);
}

/// Single-writer / many-reader admission over a counting table.
#[derive(Debug, Default)]
pub struct CountingFileLock {
    table: Mutex<std::collections::HashMap<String, (u32, u32)>>,
}

impl FileLock for CountingFileLock {
    fn lock(&self, key: &str, mode: AccessMode, force: bool) -> Result<(), LockDenied> {
        let mut table = self.table.lock();
        let entry = table.entry(key.to_string()).or_insert((0, 0));
        let (readers, writers) = *entry;
        let denied = match mode {
            AccessMode::Read => writers > 0,
            AccessMode::Write => readers > 0 || writers > 0,
        };
        if denied && !force {
            return Err(LockDenied { readers, writers });
        }
        match mode {
            AccessMode::Read => entry.0 += 1,
            AccessMode::Write => entry.1 += 1,
        }
        Ok(())
    }

    fn unlock(&self, key: &str, mode: AccessMode) {
        let mut table = self.table.lock();
        if let Some(entry) = table.get_mut(key) {
            match mode {
                AccessMode::Read => entry.0 = entry.0.saturating_sub(1),
                AccessMode::Write => entry.1 = entry.1.saturating_sub(1),
            }
            if *entry == (0, 0) {
                table.remove(key);
            }
        }
    }
}

/// Per-file transfer statistics. Monotonic while the file is open.
#[derive(Debug, Default)]
pub struct FileStats {
    inner: Mutex<StatsInner>,
}

#[derive(Debug)]
struct StatsInner {
    bytes_read: i64,
    bytes_readv: i64,
    bytes_written: i64,
    read_ops: u32,
    readv_ops: u32,
    readv_segs: u32,
    write_ops: u32,
    rd_min: i32,
    rd_max: i32,
    wr_min: i32,
    wr_max: i32,
    ssq_read: f64,
    ssq_write: f64,
    pgr_bytes: i64,
    pgr_ops: u32,
    pgr_retries: u32,
    pgw_bytes: i64,
    pgw_ops: u32,
    pgw_cserrs: u32,
}

impl Default for StatsInner {
    fn default() -> StatsInner {
        StatsInner {
            bytes_read: 0,
            bytes_readv: 0,
            bytes_written: 0,
            read_ops: 0,
            readv_ops: 0,
            readv_segs: 0,
            write_ops: 0,
            rd_min: i32::MAX,
            rd_max: 0,
            wr_min: i32::MAX,
            wr_max: 0,
            ssq_read: 0.0,
            ssq_write: 0.0,
            pgr_bytes: 0,
            pgr_ops: 0,
            pgr_retries: 0,
            pgw_bytes: 0,
            pgw_ops: 0,
            pgw_cserrs: 0,
        }
    }
}

impl FileStats {
    pub fn rd_ops(&self, size: i32) {
        let mut s = self.inner.lock();
        s.bytes_read += size as i64;
        s.read_ops += 1;
        s.rd_min = s.rd_min.min(size);
        s.rd_max = s.rd_max.max(size);
        s.ssq_read += (size as f64) * (size as f64);
    }

    pub fn rv_ops(&self, size: i32, segs: u32) {
        let mut s = self.inner.lock();
        s.bytes_readv += size as i64;
        s.readv_ops += 1;
        s.readv_segs += segs;
    }

    pub fn wr_ops(&self, size: i32) {
        let mut s = self.inner.lock();
        s.bytes_written += size as i64;
        s.write_ops += 1;
        s.wr_min = s.wr_min.min(size);
        s.wr_max = s.wr_max.max(size);
        s.ssq_write += (size as f64) * (size as f64);
    }

    pub fn pgr_ops(&self, size: i32, retry: bool) {
        let mut s = self.inner.lock();
        s.pgr_bytes += size as i64;
        s.pgr_ops += 1;
        if retry {
            s.pgr_retries += 1;
        }
    }

    pub fn pgw_ops(&self, size: i32, cserrs: u32) {
        let mut s = self.inner.lock();
        s.pgw_bytes += size as i64;
        s.pgw_ops += 1;
        s.pgw_cserrs += cserrs;
    }

    /// Total bytes delivered to the client (read + readv).
    pub fn total_read(&self) -> i64 {
        let s = self.inner.lock();
        s.bytes_read + s.bytes_readv
    }

    pub fn total_written(&self) -> i64 {
        self.inner.lock().bytes_written
    }
}

static ANON_KEY: AtomicU64 = AtomicU64::new(0);

/// A handle on an opened backend object plus its per-file state.
pub struct File {
    pub fsfile: Box<dyn FsFile>,
    /// Hash key derived from the backend device+inode pair. Identical files
    /// opened by different paths collide on this key.
    pub key: String,
    pub path: String,
    pub mode: AccessMode,
    pub async_mode: bool,
    pub sf_enabled: bool,
    pub stats: FileStats,
    /// Failed-checksum offsets awaiting client correction.
    pub pgw_book: PgwBook,
    ckp_active: AtomicBool,
    /// Monitoring dictionary id assigned at open.
    pub mon_id: AtomicU64,
    refs: AtomicI32,
}

impl File {
    pub fn new(
        fsfile: Box<dyn FsFile>,
        path: &str,
        mode: AccessMode,
        async_mode: bool,
        stat: &FsStat,
    ) -> File {
        let key = if stat.dev != 0 || stat.ino != 0 {
            format!("{}", HexKey(stat.dev, stat.ino))
        } else {
            format!("anon{:x}", ANON_KEY.fetch_add(1, Ordering::Relaxed))
        };
        File {
            fsfile,
            key,
            path: path.to_string(),
            mode,
            async_mode,
            sf_enabled: false,
            stats: FileStats::default(),
            pgw_book: PgwBook::new(),
            ckp_active: AtomicBool::new(false),
            mon_id: AtomicU64::new(0),
            refs: AtomicI32::new(0),
        }
    }

    /// Adjust the outstanding-work reference count.
    pub fn ref_add(&self, delta: i32) {
        let prior = self.refs.fetch_add(delta, Ordering::AcqRel);
        debug_assert!(prior + delta >= 0, "file reference count went negative");
    }

    pub fn ref_count(&self) -> i32 {
        self.refs.load(Ordering::Acquire)
    }

    pub fn ckp_active(&self) -> bool {
        self.ckp_active.load(Ordering::Acquire)
    }

    pub fn set_ckp_active(&self, on: bool) {
        self.ckp_active.store(on, Ordering::Release);
    }
}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File")
            .field("key", &self.key)
            .field("path", &self.path)
            .field("mode", &self.mode)
            .field("async_mode", &self.async_mode)
            .field("refs", &self.ref_count())
            .finish()
    }
}

struct HexKey(u64, u64);

impl std::fmt::Display for HexKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:x}{:016x}", self.0, self.1)
    }
}

/// Per-session map from small integer handles to files.
///
/// A fixed primary table keeps the common case allocation-free; a secondary
/// table grows in 16-slot increments. Handles are stable for the lifetime of
/// the file and the lowest free slot is always preferred. Manipulation is
/// serialized by the owning session.
#[derive(Debug)]
pub struct FileTable {
    primary: [Option<Arc<File>>; FTAB_SIZE],
    ft_free: usize,
    ext: Vec<Option<Arc<File>>>,
    xt_free: usize,
}

impl FileTable {
    pub fn new() -> FileTable {
        FileTable {
            primary: Default::default(),
            ft_free: 0,
            ext: Vec::new(),
            xt_free: 0,
        }
    }

    /// Insert a file, returning its handle.
    pub fn add(&mut self, file: Arc<File>) -> i32 {
        for i in self.ft_free..FTAB_SIZE {
            if self.primary[i].is_none() {
                self.primary[i] = Some(file);
                self.ft_free = i + 1;
                return i as i32;
            }
        }
        for i in self.xt_free..self.ext.len() {
            if self.ext[i].is_none() {
                self.ext[i] = Some(file);
                self.xt_free = i + 1;
                return (i + FTAB_SIZE) as i32;
            }
        }
        let i = self.ext.len();
        self.ext.resize_with(i + FTAB_SIZE, || None);
        self.ext[i] = Some(file);
        self.xt_free = i + 1;
        (i + FTAB_SIZE) as i32
    }

    pub fn get(&self, handle: i32) -> Option<Arc<File>> {
        if handle < 0 {
            return None;
        }
        let i = handle as usize;
        if i < FTAB_SIZE {
            self.primary[i].clone()
        } else {
            self.ext.get(i - FTAB_SIZE).cloned().flatten()
        }
    }

    /// Remove and return the entry. The file is not closed here.
    pub fn del(&mut self, handle: i32) -> Option<Arc<File>> {
        if handle < 0 {
            return None;
        }
        let i = handle as usize;
        if i < FTAB_SIZE {
            let fp = self.primary[i].take();
            if fp.is_some() && i < self.ft_free {
                self.ft_free = i;
            }
            fp
        } else {
            let i = i - FTAB_SIZE;
            let fp = self.ext.get_mut(i)?.take();
            if fp.is_some() && i < self.xt_free {
                self.xt_free = i;
            }
            fp
        }
    }

    /// Drain every still-present file for session teardown. The caller emits
    /// monitor close events and closes the backends; this must only run once
    /// the session is quiesced.
    pub fn recycle(&mut self) -> Vec<Arc<File>> {
        let mut out = Vec::new();
        for slot in self.primary.iter_mut() {
            if let Some(fp) = slot.take() {
                out.push(fp);
            }
        }
        for slot in self.ext.iter_mut() {
            if let Some(fp) = slot.take() {
                out.push(fp);
            }
        }
        self.ft_free = 0;
        self.xt_free = 0;
        self.ext.clear();
        if !out.is_empty() {
            debug!("file table recycled {} open files", out.len());
        }
        out
    }

    pub fn len(&self) -> usize {
        self.primary.iter().filter(|s| s.is_some()).count()
            + self.ext.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FileTable {
    fn default() -> FileTable {
        FileTable::new()
    }
}
