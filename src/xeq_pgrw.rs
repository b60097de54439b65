//! Page read and page write handlers.
//!
//! Page I/O moves 4096-byte units, each protected by a CRC32C. Reads attach
//! a checksum ahead of every page on the way out; writes verify every page
//! on the way in, record failures in the per-file book, and report them in a
//! trailing corrective record so the client can resubmit exactly the pages
//! that went bad.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use log::debug;
use smallvec::SmallVec;
use tokio::sync::mpsc;
use zerocopy::IntoBytes;
use zerocopy::byteorder::big_endian::I64;

use crate::aio::{ReadTask, discard_payload};
use crate::channel::recv_exact;
use crate::file::{AccessMode, File};
use crate::fs::{FsError, FsResult};
use crate::ll::argument::ArgumentIterator;
use crate::ll::reply::Response;
use crate::ll::request::{Operation, Request, fhandle};
use crate::ll::wire::{
    CRC_LEN, ErrorCode, PAGE_SIZE, PG_RETRY, PgReadReqArgs, ResponseStatus,
};
use crate::page::{BadCsAccum, crc32c_of, pgw_layout};
use crate::session::{Flow, Session, XeqResult};

impl Session {
    // --------------------------------------------------------------- pgread

    pub(crate) async fn do_pgread(&mut self, req: &Request) -> XeqResult {
        let Operation::PgRead(args) = req.operation() else {
            unreachable!()
        };
        self.num_reads += 1;
        let offset = args.offset.get();
        let rlen = args.rlen.get();

        // Optional payload: alternate path plus request flags.
        let mut pathid = 0u8;
        let mut reqflags = 0u8;
        if req.dlen() > 0 {
            let payload = self.payload(req.dlen());
            let mut it = ArgumentIterator::new(payload);
            if let Some(extra) = it.fetch::<PgReadReqArgs>() {
                pathid = extra.pathid;
                reqflags = extra.reqflags;
            } else if !payload.is_empty() {
                pathid = payload[0];
            }
        }
        let retry = reqflags & PG_RETRY != 0;
        let (link, resp) = self.resp_on_path(req.streamid(), pathid);

        if rlen <= 0 || rlen as i64 & (PAGE_SIZE as i64 - 1) != 0 {
            resp.send_error(ErrorCode::ArgInvalid, "Read length is invalid")
                .await?;
            return Ok(Flow::Continue);
        }
        if offset < 0 || offset & (PAGE_SIZE as i64 - 1) != 0 {
            resp.send_error(ErrorCode::ArgInvalid, "Read offset is invalid")
                .await?;
            return Ok(Flow::Continue);
        }
        let Some(file) = self.get_file(args.fhandle) else {
            resp.send_error(ErrorCode::FileNotOpen, "read does not refer to an open file")
                .await?;
            return Ok(Flow::Continue);
        };
        debug!(
            "{} fh={} pgread {}@{} retry={}",
            self.link.id(),
            fhandle(args.fhandle),
            rlen,
            offset,
            retry
        );
        if let Some(mon) = &self.monitor {
            mon.add_rd(file.mon_id.load(Ordering::Relaxed) as u32, rlen, offset);
        }
        file.stats.pgr_ops(rlen, retry);

        if self.async_eligible(&file, rlen) {
            let task = ReadTask {
                link,
                file,
                resp,
                pool: Arc::clone(&self.ctx.pool),
                segsize: self.ctx.config.as_segsize,
                max_per_req: self.ctx.config.as_maxperreq,
                cancel: self.cancel.subscribe(),
                page: true,
                verify: retry,
            };
            task.spawn(offset, rlen);
            return Ok(Flow::Continue);
        }
        self.pg_read_sync(&resp, &file, offset, rlen, retry).await?;
        Ok(Flow::Continue)
    }

    /// Buffered pgread loop. Each frame is `ofs | (crc, page)*` with the
    /// final page possibly short.
    async fn pg_read_sync(
        &mut self,
        resp: &Response,
        file: &Arc<File>,
        offset: i64,
        rlen: i32,
        retry: bool,
    ) -> std::io::Result<()> {
        let quantum = (rlen as usize).min(self.ctx.config.max_transz) & !(PAGE_SIZE - 1);
        let quantum = quantum.max(PAGE_SIZE);
        let Some(mut buf) = self.ctx.pool.obtain(quantum) else {
            return resp
                .send_error(ErrorCode::NoMemory, "Insufficient memory.")
                .await;
        };
        let mut at = offset;
        let mut remaining = rlen as usize;
        let result = loop {
            let q = quantum.min(remaining);
            let n = match file.fsfile.pgread(at, &mut buf.as_mut_slice()[..q], retry).await {
                Ok(n) => n,
                Err(e) => break self.fs_error(resp, &e).await,
            };
            let terminal = n < q || n >= remaining;
            let data = &buf.as_slice()[..n];
            let mut crcs = Vec::with_capacity(data.len().div_ceil(PAGE_SIZE) * CRC_LEN);
            for chunk in data.chunks(PAGE_SIZE) {
                crcs.extend_from_slice(&crc32c_of(chunk).to_be_bytes());
            }
            let ofs = I64::new(at);
            let mut iov: SmallVec<[&[u8]; 34]> = SmallVec::new();
            iov.push(ofs.as_bytes());
            for (i, chunk) in data.chunks(PAGE_SIZE).enumerate() {
                iov.push(&crcs[i * CRC_LEN..(i + 1) * CRC_LEN]);
                iov.push(chunk);
            }
            let status = if terminal {
                ResponseStatus::Ok
            } else {
                ResponseStatus::OkSoFar
            };
            let sent = resp.send_iov(status, iov.as_slice()).await;
            if terminal || sent.is_err() {
                break sent;
            }
            at += n as i64;
            remaining -= n;
        };
        self.ctx.pool.release(buf);
        result
    }

    // -------------------------------------------------------------- pgwrite

    pub(crate) async fn do_pgwrite(&mut self, req: &Request) -> XeqResult {
        let Operation::PgWrite(args) = req.operation() else {
            unreachable!()
        };
        self.num_writes += 1;
        let resp = self.resp(req.streamid());
        let offset = args.offset.get();
        let dlen = req.dlen();

        let layout = match pgw_layout(offset.max(0), dlen.max(0) as usize) {
            Ok(l) if offset >= 0 => l,
            _ => {
                if dlen > 0 {
                    discard_payload(
                        &mut self.reader,
                        &self.ctx.pool,
                        dlen as usize,
                        self.ctx.config.read_wait,
                    )
                    .await?;
                }
                resp.send_error(ErrorCode::ArgInvalid, "pgwrite request is invalid")
                    .await?;
                return Ok(Flow::Continue);
            }
        };
        let Some(file) = self.get_file(args.fhandle) else {
            discard_payload(
                &mut self.reader,
                &self.ctx.pool,
                dlen as usize,
                self.ctx.config.read_wait,
            )
            .await?;
            resp.send_error(
                ErrorCode::FileNotOpen,
                "pgwrite does not refer to an open file",
            )
            .await?;
            return Ok(Flow::Continue);
        };
        if file.mode != AccessMode::Write {
            discard_payload(
                &mut self.reader,
                &self.ctx.pool,
                dlen as usize,
                self.ctx.config.read_wait,
            )
            .await?;
            resp.send_error(
                ErrorCode::InvalidRequest,
                "pgwrite to a file open for reading",
            )
            .await?;
            return Ok(Flow::Continue);
        }
        debug!(
            "{} fh={} pgwrite {}@{}",
            self.link.id(),
            fhandle(args.fhandle),
            dlen,
            offset
        );
        if let Some(mon) = &self.monitor {
            mon.add_wr(file.mon_id.load(Ordering::Relaxed) as u32, dlen, offset);
        }
        self.pgwrite_exec(&resp, &file, offset, &layout).await?;
        Ok(Flow::Continue)
    }

    /// Receive, verify, and apply the units of a pgwrite. Also the execution
    /// tail of a checkpointed pgwrite, whose pre-image is already recorded.
    pub(crate) async fn pgwrite_exec(
        &mut self,
        resp: &Response,
        file: &Arc<File>,
        offset: i64,
        layout: &[(i64, usize)],
    ) -> std::io::Result<()> {
        let eligible = file.async_mode && !self.ctx.config.as_syncw && !self.ctx.config.as_noaio;
        let width = if eligible {
            self.ctx.config.as_maxperreq
        } else {
            1
        };
        let (tx, mut rx) = mpsc::channel::<FsResult<usize>>(width.max(1));
        let mut in_flight = 0usize;
        let mut committed: i64 = 0;
        let mut poisoned: Option<FsError> = None;
        let mut accum = BadCsAccum::new();
        let mut fatal: Option<&'static str> = None;
        let wait = self.ctx.config.read_wait;

        for (i, &(uoff, ulen)) in layout.iter().enumerate() {
            while in_flight >= width {
                if let Some(done) = rx.recv().await {
                    in_flight -= 1;
                    settle(done, &mut committed, &mut poisoned);
                }
            }
            if fatal.is_some() {
                // Alignment only: the remaining units still occupy the wire.
                discard_payload(
                    &mut self.reader,
                    &self.ctx.pool,
                    layout[i..].iter().map(|&(_, l)| l + CRC_LEN).sum(),
                    wait,
                )
                .await?;
                break;
            }
            let mut crc_buf = [0u8; CRC_LEN];
            recv_exact(&mut self.reader, &mut crc_buf, wait).await?;
            let want_crc = u32::from_be_bytes(crc_buf);
            let Some(mut buf) = self.ctx.pool.obtain(ulen) else {
                poisoned.get_or_insert(FsError::io(libc::ENOMEM, "insufficient memory"));
                discard_payload(&mut self.reader, &self.ctx.pool, ulen, wait).await?;
                continue;
            };
            recv_exact(&mut self.reader, &mut buf.as_mut_slice()[..ulen], wait).await?;

            if poisoned.is_some() {
                self.ctx.pool.release(buf);
                continue;
            }
            let got_crc = crc32c_of(&buf.as_slice()[..ulen]);
            if got_crc != want_crc {
                debug!(
                    "{} csErr {}@{} inreq={}",
                    self.link.id(),
                    ulen,
                    uoff,
                    accum.count() + 1
                );
                if let Err(msg) = accum.add(&file.pgw_book, uoff, ulen) {
                    fatal = Some(msg);
                    self.ctx.pool.release(buf);
                    continue;
                }
            } else if file.pgw_book.num_offs() > 0 {
                file.pgw_book.del_offs(uoff, ulen);
            }

            let file2 = Arc::clone(file);
            let tx = tx.clone();
            let pool = Arc::clone(&self.ctx.pool);
            tokio::spawn(async move {
                let result = file2.fsfile.pgwrite(uoff, &buf.as_slice()[..ulen]).await;
                pool.release(buf);
                let _ = tx.send(result).await;
            });
            in_flight += 1;
        }
        drop(tx);
        while in_flight > 0 {
            match rx.recv().await {
                Some(done) => {
                    in_flight -= 1;
                    settle(done, &mut committed, &mut poisoned);
                }
                None => break,
            }
        }

        let total: usize = layout.iter().map(|&(_, l)| l).sum();
        file.stats.pgw_ops(committed as i32, accum.count() as u32);

        if let Some(msg) = fatal {
            self.ctx.stats.bump(&self.ctx.stats.error_cnt);
            return resp
                .send_error(crate::ll::errno::map_errno(libc::ETOOMANYREFS), msg)
                .await;
        }
        if let Some(e) = poisoned {
            return self.fs_error(resp, &e).await;
        }
        debug!(
            "{} pgwrite done {} bytes, {} bad pages",
            self.link.id(),
            total,
            accum.count()
        );
        // Final ok: request offset plus any corrective record.
        let ofs = I64::new(offset);
        match accum.info() {
            Some(record) => {
                resp.send_iov(ResponseStatus::Ok, &[ofs.as_bytes(), &record])
                    .await
            }
            None => resp.send_iov(ResponseStatus::Ok, &[ofs.as_bytes()]).await,
        }
    }
}

fn settle(done: FsResult<usize>, committed: &mut i64, poisoned: &mut Option<FsError>) {
    match done {
        Ok(n) => *committed += n as i64,
        Err(e) => {
            if poisoned.is_none() {
                *poisoned = Some(e);
            }
        }
    }
}
