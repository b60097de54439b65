//! Asynchronous I/O engine.
//!
//! Two task kinds share one machine: normal read/write and page read/write.
//! A task owns a bounded set of in-flight backend operations, each tied to
//! one buffer; completions arrive on the task's channel and a single sender
//! drains them, for reads in strict offset order. Cancellation rides a
//! session-wide watch: a cancelled task stops sending, recycles buffers as
//! their operations finish, and releases its file and link references on the
//! last completion.

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;

use log::{debug, warn};
use smallvec::SmallVec;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, watch};
use zerocopy::IntoBytes;
use zerocopy::byteorder::big_endian::I64;

use crate::buffer::{Buffer, BufferPool};
use crate::channel::{Link, recv_exact};
use crate::file::File;
use crate::fs::{FsError, FsResult};
use crate::ll::reply::Response;
use crate::ll::wire::{CRC_LEN, PAGE_SIZE};
use crate::page::crc32c_of;

struct Completion {
    offset: i64,
    requested: usize,
    buf: Buffer,
    result: FsResult<usize>,
}

/// A file-to-link copy task. `page` selects pgread framing, where every page
/// travels behind its CRC32C.
pub(crate) struct ReadTask {
    pub link: Arc<Link>,
    pub file: Arc<File>,
    pub resp: Response,
    pub pool: Arc<BufferPool>,
    pub segsize: usize,
    pub max_per_req: usize,
    pub cancel: watch::Receiver<bool>,
    pub page: bool,
    pub verify: bool,
}

impl ReadTask {
    /// Take the task's file and link references and run detached. The
    /// references are released exactly once, when the last buffer returns.
    pub(crate) fn spawn(self, offset: i64, len: i32) {
        self.link.set_ref(1);
        self.file.ref_add(1);
        tokio::spawn(async move {
            let link = Arc::clone(&self.link);
            let file = Arc::clone(&self.file);
            self.run(offset, len).await;
            file.ref_add(-1);
            link.set_ref(-1);
        });
    }

    fn segment(&self, len: i32) -> usize {
        let want = self.segsize.min(len.max(1) as usize);
        let eff = self.pool.recalc(want);
        let eff = if eff == 0 { self.pool.max_size() } else { eff };
        if self.page {
            // Page framing needs whole pages per buffer.
            eff.max(PAGE_SIZE) & !(PAGE_SIZE - 1)
        } else {
            eff
        }
    }

    async fn run(mut self, offset: i64, len: i32) {
        let seg = self.segment(len);
        let end = offset + len as i64;
        let (tx, mut rx) = mpsc::channel::<Completion>(self.max_per_req.max(1));

        let mut next_issue = offset;
        let mut in_flight = 0usize;
        let mut send_cursor = offset;
        let mut pending: BTreeMap<i64, Completion> = BTreeMap::new();
        let mut dead = false; // stop sending, drain quietly
        let mut finished = false; // terminal response has been sent

        loop {
            // Keep the pipe full while there is file range left to issue.
            while !dead && !finished && in_flight < self.max_per_req && next_issue < end {
                let this_len = seg.min((end - next_issue) as usize);
                let Some(mut buf) = self.pool.obtain(this_len) else {
                    self.send_error(&FsError::io(libc::ENOMEM, "insufficient memory"))
                        .await;
                    finished = true;
                    break;
                };
                let file = Arc::clone(&self.file);
                let tx = tx.clone();
                let at = next_issue;
                let verify = self.verify;
                let page = self.page;
                tokio::spawn(async move {
                    let result = if page {
                        file.fsfile.pgread(at, &mut buf.as_mut_slice()[..this_len], verify).await
                    } else {
                        file.fsfile.read(at, &mut buf.as_mut_slice()[..this_len]).await
                    };
                    // Receiver gone means the task died; buffer is dropped.
                    let _ = tx
                        .send(Completion {
                            offset: at,
                            requested: this_len,
                            buf,
                            result,
                        })
                        .await;
                });
                in_flight += 1;
                next_issue += this_len as i64;
            }

            if in_flight == 0 {
                break;
            }

            let completion = if dead || finished {
                match rx.recv().await {
                    Some(c) => c,
                    None => break,
                }
            } else {
                tokio::select! {
                    changed = self.cancel.changed() => {
                        if changed.is_err() || *self.cancel.borrow() {
                            debug!("read task cancelled at {}", send_cursor);
                            dead = true;
                        }
                        continue;
                    }
                    c = rx.recv() => match c {
                        Some(c) => c,
                        None => break,
                    },
                }
            };
            in_flight -= 1;

            if dead || finished {
                self.pool.release(completion.buf);
                continue;
            }
            pending.insert(completion.offset, completion);

            // Deliver every contiguous buffer starting at the send cursor.
            while let Some(c) = pending.remove(&send_cursor) {
                match c.result {
                    Err(ref e) => {
                        self.send_error(e).await;
                        finished = true;
                        self.pool.release(c.buf);
                        break;
                    }
                    Ok(n) => {
                        let short = n < c.requested;
                        let last = c.offset + n as i64 >= end;
                        let ok = self.send_data(&c, n, short || last).await;
                        self.pool.release(c.buf);
                        if short || last {
                            finished = true;
                            break;
                        }
                        if !ok {
                            dead = true;
                            break;
                        }
                        send_cursor += n as i64;
                    }
                }
            }
            if finished {
                // Later buffers will be recycled as their I/O completes.
                for (_, c) in std::mem::take(&mut pending) {
                    self.pool.release(c.buf);
                }
            }
        }

        if !finished && !dead {
            // Every issued buffer landed but the range was empty.
            let _ = self.resp.send_ok(&[]).await;
        } else if dead && !finished {
            self.resp.mark_failed();
        }
        for (_, c) in pending {
            self.pool.release(c.buf);
        }
    }

    /// Send one buffer's bytes, framed per the task kind. Returns false on a
    /// link failure.
    async fn send_data(&self, c: &Completion, n: usize, terminal: bool) -> bool {
        let result = if self.page {
            self.send_page_frame(c, n, terminal).await
        } else if terminal {
            self.resp.send_ok(&c.buf.as_slice()[..n]).await
        } else {
            self.resp.send_partial(&c.buf.as_slice()[..n]).await
        };
        if let Err(e) = result {
            warn!("read task send failed on {}: {}", self.link.id(), e);
            return false;
        }
        true
    }

    /// pgread framing: `ofs | (crc, page)*`, the final page possibly short
    /// with a full-width CRC.
    async fn send_page_frame(&self, c: &Completion, n: usize, terminal: bool) -> io::Result<()> {
        let data = &c.buf.as_slice()[..n];
        let pages = n.div_ceil(PAGE_SIZE).max(1);
        let mut crcs = Vec::with_capacity(pages * CRC_LEN);
        for chunk in data.chunks(PAGE_SIZE) {
            crcs.extend_from_slice(&crc32c_of(chunk).to_be_bytes());
        }
        let ofs = I64::new(c.offset);
        let mut iov: SmallVec<[&[u8]; 34]> = SmallVec::new();
        iov.push(ofs.as_bytes());
        let mut i = 0;
        for chunk in data.chunks(PAGE_SIZE) {
            iov.push(&crcs[i * CRC_LEN..(i + 1) * CRC_LEN]);
            iov.push(chunk);
            i += 1;
        }
        if terminal {
            self.resp
                .send_iov(crate::ll::wire::ResponseStatus::Ok, iov.as_slice())
                .await
        } else {
            self.resp
                .send_iov(crate::ll::wire::ResponseStatus::OkSoFar, iov.as_slice())
                .await
        }
    }

    async fn send_error(&self, e: &FsError) {
        let _ = match e {
            FsError::Io { msg, .. } => self.resp.send_error(e.code(), msg).await,
            FsError::Redirect { host, port } => self.resp.send_redirect(*port, host).await,
            FsError::Stall { seconds, msg } => self.resp.send_wait(*seconds, msg).await,
        };
    }
}

/// Outcome of a link-to-file copy.
pub(crate) struct WriteOutcome {
    /// Bytes the backend actually accepted.
    pub committed: i64,
    /// First backend failure, if any. The payload was still fully consumed
    /// from the link to preserve wire alignment.
    pub error: Option<FsError>,
    /// The link itself failed; the connection must close. Committed bytes
    /// are still accurate for accounting.
    pub failed: Option<io::Error>,
}

/// Copy `len` payload bytes from the link into the file with bounded
/// in-flight backend writes. Runs on the dispatcher task because it owns the
/// socket read side.
pub(crate) async fn write_task<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
    file: &Arc<File>,
    pool: &Arc<BufferPool>,
    segsize: usize,
    max_per_req: usize,
    read_wait: std::time::Duration,
    offset: i64,
    len: i32,
) -> WriteOutcome {
    let seg = {
        let eff = pool.recalc(segsize.min(len.max(1) as usize));
        if eff == 0 { pool.max_size() } else { eff }
    };
    let (tx, mut rx) = mpsc::channel::<(usize, FsResult<usize>)>(max_per_req.max(1));
    let mut in_flight = 0usize;
    let mut committed: i64 = 0;
    let mut error: Option<FsError> = None;
    let mut remaining = len as usize;
    let mut at = offset;

    let settle =
        |done: (usize, FsResult<usize>), committed: &mut i64, error: &mut Option<FsError>| {
            match done.1 {
                Ok(n) => *committed += n as i64,
                Err(e) => {
                    if error.is_none() {
                        *error = Some(e);
                    }
                }
            }
        };

    while remaining > 0 && error.is_none() {
        if in_flight >= max_per_req {
            if let Some(done) = rx.recv().await {
                in_flight -= 1;
                settle(done, &mut committed, &mut error);
            }
            continue;
        }
        let this_len = seg.min(remaining);
        let Some(mut buf) = pool.obtain(this_len) else {
            error = Some(FsError::io(libc::ENOMEM, "insufficient memory"));
            break;
        };
        if let Err(e) = recv_exact(reader, &mut buf.as_mut_slice()[..this_len], read_wait).await {
            // Wire is now misaligned; only closing the link is safe.
            pool.release(buf);
            drain_completions(&mut rx, in_flight, &mut committed, &mut error).await;
            return WriteOutcome {
                committed,
                error,
                failed: Some(e),
            };
        }
        remaining -= this_len;
        let file = Arc::clone(file);
        let tx = tx.clone();
        let pool2 = Arc::clone(pool);
        let woff = at;
        tokio::spawn(async move {
            let result = file.fsfile.write(woff, &buf.as_slice()[..this_len]).await;
            pool2.release(buf);
            let _ = tx.send((this_len, result)).await;
        });
        in_flight += 1;
        at += this_len as i64;
    }

    // A poisoned request still consumes its remaining payload.
    let mut failed = None;
    if remaining > 0 {
        failed = discard_payload(reader, pool, remaining, read_wait).await.err();
    }
    drop(tx);
    while in_flight > 0 {
        if let Some(done) = rx.recv().await {
            in_flight -= 1;
            settle(done, &mut committed, &mut error);
        } else {
            break;
        }
    }
    WriteOutcome {
        committed,
        error,
        failed,
    }
}

async fn drain_completions(
    rx: &mut mpsc::Receiver<(usize, FsResult<usize>)>,
    mut in_flight: usize,
    committed: &mut i64,
    error: &mut Option<FsError>,
) {
    while in_flight > 0 {
        match rx.recv().await {
            Some((n, Ok(_))) => {
                *committed += n as i64;
                in_flight -= 1;
            }
            Some((_, Err(e))) => {
                if error.is_none() {
                    *error = Some(e);
                }
                in_flight -= 1;
            }
            None => break,
        }
    }
}

/// Read and discard `len` bytes of request payload to keep the stream
/// aligned after a failed write.
pub(crate) async fn discard_payload<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
    pool: &Arc<BufferPool>,
    len: usize,
    read_wait: std::time::Duration,
) -> io::Result<()> {
    debug!("discarding {len} bytes of request payload");
    let mut buf = pool
        .obtain(len.min(65536))
        .ok_or_else(|| io::Error::new(io::ErrorKind::OutOfMemory, "no discard buffer"))?;
    let mut remaining = len;
    while remaining > 0 {
        let n = buf.size().min(remaining);
        let r = recv_exact(reader, &mut buf.as_mut_slice()[..n], read_wait).await;
        if let Err(e) = r {
            pool.release(buf);
            return Err(e);
        }
        remaining -= n;
    }
    pool.release(buf);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{CkpAct, CkpInfo, FsFile};
    use crate::file::AccessMode;
    use crate::fs::FsStat;
    use crate::ll::reply::tests::CaptureSender;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Backend whose reads complete in deliberately scrambled order.
    struct ScrambledFile {
        data: Vec<u8>,
        delays: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl FsFile for ScrambledFile {
        async fn read(&self, offset: i64, buf: &mut [u8]) -> FsResult<usize> {
            let delay = self.delays.lock().pop().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            let offset = offset as usize;
            if offset >= self.data.len() {
                return Ok(0);
            }
            let n = buf.len().min(self.data.len() - offset);
            buf[..n].copy_from_slice(&self.data[offset..offset + n]);
            Ok(n)
        }
        async fn write(&self, _offset: i64, data: &[u8]) -> FsResult<usize> {
            Ok(data.len())
        }
        async fn pgread(&self, offset: i64, buf: &mut [u8], _verify: bool) -> FsResult<usize> {
            self.read(offset, buf).await
        }
        async fn pgwrite(&self, _offset: i64, data: &[u8]) -> FsResult<usize> {
            Ok(data.len())
        }
        async fn sync(&self) -> FsResult<()> {
            Ok(())
        }
        async fn truncate(&self, _size: i64) -> FsResult<()> {
            Ok(())
        }
        async fn stat(&self) -> FsResult<FsStat> {
            unimplemented!()
        }
        async fn checkpoint(&self, _act: CkpAct<'_>) -> FsResult<CkpInfo> {
            unimplemented!()
        }
        async fn close(&self) -> FsResult<()> {
            Ok(())
        }
    }

    fn scrambled_task(
        data: Vec<u8>,
        delays: Vec<u64>,
        cap: Arc<CaptureSender>,
    ) -> (ReadTask, watch::Sender<bool>) {
        let stat = FsStat {
            dev: 1,
            ino: 9,
            size: data.len() as i64,
            mtime: 0,
            kind: crate::fs::FileKind::File,
            exec: false,
            readable: true,
            writable: false,
        };
        let file = Arc::new(File::new(
            Box::new(ScrambledFile {
                data,
                delays: Mutex::new(delays),
            }),
            "/f",
            AccessMode::Read,
            true,
            &stat,
        ));
        let (_client, server) = tokio::io::duplex(1 << 20);
        let (_rd, wr) = tokio::io::split(server);
        let link = Link::new(Box::new(wr), "test".into());
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = ReadTask {
            link,
            file,
            resp: Response::new(cap, [7, 7]),
            pool: Arc::new(BufferPool::default()),
            segsize: 1024,
            max_per_req: 4,
            cancel: cancel_rx,
            page: false,
            verify: false,
        };
        (task, cancel_tx)
    }

    fn reassemble(cap: &CaptureSender) -> (Vec<u8>, Vec<u16>) {
        let mut bytes = Vec::new();
        let mut statuses = Vec::new();
        for f in cap.frames.lock().iter() {
            statuses.push(u16::from_be_bytes([f[2], f[3]]));
            bytes.extend_from_slice(&f[8..]);
        }
        (bytes, statuses)
    }

    #[tokio::test]
    async fn out_of_order_completions_deliver_in_offset_order() {
        let data: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let cap = CaptureSender::new();
        let (task, _cancel) = scrambled_task(data.clone(), vec![5, 40, 1, 20], cap.clone());
        let file = Arc::clone(&task.file);
        let link = Arc::clone(&task.link);
        task.spawn(0, 4096);
        while link.use_count() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let (bytes, statuses) = reassemble(&cap);
        assert_eq!(bytes, data);
        assert_eq!(*statuses.last().unwrap(), 0);
        for s in &statuses[..statuses.len() - 1] {
            assert_eq!(*s, 4000);
        }
        assert_eq!(file.ref_count(), 0);
    }

    #[tokio::test]
    async fn short_read_terminates_with_final_ok() {
        let data: Vec<u8> = vec![9u8; 1500]; // 1.5 segments
        let cap = CaptureSender::new();
        let (task, _cancel) = scrambled_task(data.clone(), vec![0, 0, 0, 0], cap.clone());
        let link = Arc::clone(&task.link);
        task.spawn(0, 4096);
        while link.use_count() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let (bytes, statuses) = reassemble(&cap);
        assert_eq!(bytes, data);
        assert_eq!(*statuses.last().unwrap(), 0);
    }

    #[tokio::test]
    async fn zero_byte_read_sends_empty_ok() {
        let cap = CaptureSender::new();
        let (task, _cancel) = scrambled_task(Vec::new(), vec![0], cap.clone());
        let link = Arc::clone(&task.link);
        task.spawn(0, 1024);
        while link.use_count() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let frames = cap.frames.lock();
        assert_eq!(frames.len(), 1);
        assert_eq!(u16::from_be_bytes([frames[0][2], frames[0][3]]), 0);
        assert_eq!(frames[0].len(), 8);
    }

    #[tokio::test]
    async fn cancellation_releases_refs_without_sending() {
        let data: Vec<u8> = vec![1u8; 64 * 1024];
        let cap = CaptureSender::new();
        let (task, cancel) = scrambled_task(data, vec![200, 200, 200, 200], cap.clone());
        let file = Arc::clone(&task.file);
        let link = Arc::clone(&task.link);
        task.spawn(0, 4096 * 4);
        cancel.send(true).unwrap();
        while link.use_count() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(file.ref_count(), 0);
    }

    #[tokio::test]
    async fn page_frames_carry_matching_crcs() {
        let data: Vec<u8> = (0..8192u32).map(|i| (i % 13) as u8).collect();
        let cap = CaptureSender::new();
        let (mut task, _cancel) = scrambled_task(data.clone(), vec![0, 0], cap.clone());
        task.page = true;
        task.segsize = 4096;
        let link = Arc::clone(&task.link);
        task.spawn(0, 8192);
        while link.use_count() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let frames = cap.frames.lock();
        for f in frames.iter() {
            let ofs = i64::from_be_bytes(f[8..16].try_into().unwrap()) as usize;
            let crc = u32::from_be_bytes(f[16..20].try_into().unwrap());
            let page = &f[20..20 + PAGE_SIZE];
            assert_eq!(page, &data[ofs..ofs + PAGE_SIZE]);
            assert_eq!(crc, crc32c_of(page));
        }
    }

    #[tokio::test]
    async fn write_task_reports_committed_bytes() {
        let (client, server) = tokio::io::duplex(1 << 16);
        let (mut srd, _swr) = tokio::io::split(server);
        let (_crd, mut cwr) = tokio::io::split(client);
        use tokio::io::AsyncWriteExt;

        let stat = FsStat {
            dev: 1,
            ino: 2,
            size: 0,
            mtime: 0,
            kind: crate::fs::FileKind::File,
            exec: false,
            readable: true,
            writable: true,
        };
        let file = Arc::new(File::new(
            Box::new(ScrambledFile {
                data: Vec::new(),
                delays: Mutex::new(Vec::new()),
            }),
            "/w",
            AccessMode::Write,
            true,
            &stat,
        ));
        let pool = Arc::new(BufferPool::default());
        let payload = vec![3u8; 3000];
        let writer = tokio::spawn(async move {
            cwr.write_all(&payload).await.unwrap();
        });
        let outcome = write_task(
            &mut srd,
            &file,
            &pool,
            1024,
            4,
            Duration::from_secs(5),
            0,
            3000,
        )
        .await;
        writer.await.unwrap();
        assert_eq!(outcome.committed, 3000);
        assert!(outcome.error.is_none());
        assert!(outcome.failed.is_none());
    }
}
