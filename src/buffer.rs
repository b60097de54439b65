//! Bucketed buffer pool.
//!
//! Buffers are sized in powers of two from 1 KiB up to the largest bucket
//! and recycled through per-bucket free lists so steady-state I/O does not
//! allocate. A periodic reshape pass trims buckets that have grown past the
//! configured memory cap, but never before the retention window has passed,
//! so bursts do not immediately free their working set.

use std::time::{Duration, Instant};

use log::debug;
use parking_lot::Mutex;

const BUCKETS: usize = 12;
const BUCKET_SHIFT: u32 = 10; // smallest bucket is 1 KiB

/// A pooled byte buffer. Capacity is fixed at obtain time; the same backing
/// storage cycles through many obtain/release rounds.
pub struct Buffer {
    data: Vec<u8>,
    bindex: Option<usize>,
}

impl Buffer {
    /// Usable capacity (the bucket size).
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Buffer({}k)", self.data.len() >> 10)
    }
}

struct Bucket {
    free: Vec<Vec<u8>>,
    numbuf: usize, // live buffers of this size, pooled or not
    numreq: usize, // obtain requests against this bucket
}

struct PoolState {
    total_alloc: i64,
    last_reshape: Instant,
}

/// Process-wide buffer manager.
pub struct BufferPool {
    buckets: [Mutex<Bucket>; BUCKETS],
    state: Mutex<PoolState>,
    max_alloc: i64,
    min_retention: Duration,
    maxsz: usize,
}

impl BufferPool {
    /// `max_alloc` caps the total pooled memory before reshape starts
    /// trimming; `min_retention` is the burst window reshape must respect.
    pub fn new(max_alloc: i64, min_retention: Duration) -> BufferPool {
        BufferPool {
            buckets: std::array::from_fn(|_| {
                Mutex::new(Bucket {
                    free: Vec::new(),
                    numbuf: 0,
                    numreq: 0,
                })
            }),
            state: Mutex::new(PoolState {
                total_alloc: 0,
                last_reshape: Instant::now(),
            }),
            max_alloc,
            min_retention,
            maxsz: 1 << (BUCKET_SHIFT + BUCKETS as u32 - 1),
        }
    }

    /// Largest bucket size.
    pub fn max_size(&self) -> usize {
        self.maxsz
    }

    fn bucket_of(&self, size: usize) -> Option<(usize, usize)> {
        if size > self.maxsz {
            return None;
        }
        let mut bsz = 1usize << BUCKET_SHIFT;
        let mut idx = 0;
        while bsz < size {
            bsz <<= 1;
            idx += 1;
        }
        Some((idx, bsz))
    }

    /// The effective size a caller asking for `size` would receive, or 0 if
    /// `size` exceeds the largest bucket. Lets the async read path pick a
    /// segment size that wastes no bucket space.
    pub fn recalc(&self, size: usize) -> usize {
        match self.bucket_of(size.max(1)) {
            Some((_, bsz)) => bsz,
            None => 0,
        }
    }

    /// Obtain a buffer of at least `size` bytes, rounded up to its bucket.
    /// Requests beyond the largest bucket are served unpooled.
    pub fn obtain(&self, size: usize) -> Option<Buffer> {
        let size = size.max(1);
        let Some((idx, bsz)) = self.bucket_of(size) else {
            // Oversize buffers exist outside the bucket scheme and are
            // dropped on release.
            return Some(Buffer {
                data: vec![0u8; size],
                bindex: None,
            });
        };
        let recycled = {
            let mut bucket = self.buckets[idx].lock();
            bucket.numreq += 1;
            bucket.free.pop()
        };
        let data = match recycled {
            Some(data) => data,
            None => {
                self.buckets[idx].lock().numbuf += 1;
                self.state.lock().total_alloc += bsz as i64;
                vec![0u8; bsz]
            }
        };
        Some(Buffer {
            data,
            bindex: Some(idx),
        })
    }

    /// Return a buffer to its bucket's free list.
    pub fn release(&self, buf: Buffer) {
        let Some(idx) = buf.bindex else {
            return;
        };
        self.buckets[idx].lock().free.push(buf.data);
    }

    /// Trim over-full buckets once total allocation exceeds the cap and the
    /// retention window has elapsed. Buckets keep as many buffers as their
    /// demand since the last pass indicates.
    pub fn reshape(&self) {
        {
            let mut state = self.state.lock();
            if state.total_alloc <= self.max_alloc
                || state.last_reshape.elapsed() < self.min_retention
            {
                return;
            }
            state.last_reshape = Instant::now();
        }
        let mut freed = 0i64;
        for (idx, slot) in self.buckets.iter().enumerate() {
            let bsz = 1usize << (BUCKET_SHIFT + idx as u32);
            let mut bucket = slot.lock();
            let keep = bucket.numreq.min(bucket.free.len());
            while bucket.free.len() > keep {
                bucket.free.pop();
                bucket.numbuf -= 1;
                freed += bsz as i64;
            }
            bucket.numreq = 0;
        }
        if freed > 0 {
            self.state.lock().total_alloc -= freed;
            debug!("buffer pool reshape freed {freed} bytes");
        }
    }

    /// Current pooled allocation in bytes.
    pub fn allocated(&self) -> i64 {
        self.state.lock().total_alloc
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("maxsz", &self.maxsz)
            .field("allocated", &self.allocated())
            .finish()
    }
}

impl Default for BufferPool {
    fn default() -> BufferPool {
        BufferPool::new(64 << 20, Duration::from_secs(20 * 60))
    }
}
