//! Request handlers.
//!
//! One method per request code, invoked by the dispatcher once the phase
//! machine admits the request. Handlers reply through the response framer
//! and return `Flow` for the session loop; an `Err` means the link must
//! close (wire desync or protocol violation).

use std::sync::Arc;
use std::sync::atomic::Ordering;

use log::{debug, info, warn};
use zerocopy::IntoBytes;
use zerocopy::byteorder::big_endian::{I32, I64, U32};

use crate::aio::{ReadTask, discard_payload, write_task};
use crate::file::{AccessMode, File};
use crate::fs::{AuthOutcome, FsStat};
use crate::ll::argument::ArgumentIterator;
use crate::ll::reply::Response;
use crate::ll::request::{Operation, Request, fhandle, fhandle_bytes};
use crate::ll::wire::{
    self, ErrorCode, LoginArgs, OpenFlags, OpenMode, QUERY_CONFIG, QUERY_STATS, ReadVEntry,
    ResponseStatus, StatFlags, WriteVEntry, map_mode,
};
use crate::monitor::MonitorCtx;
use crate::session::{Flow, Session, SessionHandle, Status, XeqResult, protocol_violation};

/// Reject relative paths outright: they must be absolute and free of any
/// parent-directory component.
pub(crate) fn rp_check(path: &str) -> bool {
    if !path.starts_with('/') {
        return false;
    }
    !path.split('/').any(|seg| seg == "..")
}

/// Collapse duplicate slashes and `/./` components.
pub(crate) fn squash(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for seg in path.split('/') {
        if seg.is_empty() || seg == "." {
            continue;
        }
        out.push('/');
        out.push_str(seg);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

impl Session {
    /// Extract and screen a path argument, answering the client on failure.
    pub(crate) async fn screen_path(
        &self,
        resp: &Response,
        op: &str,
        raw: &[u8],
    ) -> std::io::Result<Option<String>> {
        let Ok(path) = std::str::from_utf8(raw) else {
            resp.send_error(ErrorCode::ArgInvalid, "path is not valid text")
                .await?;
            return Ok(None);
        };
        if !rp_check(path) {
            let msg = format!("{op} relative path '{path}' is disallowed.");
            resp.send_error(ErrorCode::NotAuthorized, &msg).await?;
            return Ok(None);
        }
        Ok(Some(squash(path)))
    }

    /// Split a payload path from any opaque info after `?`.
    fn split_opaque(raw: &[u8]) -> (&[u8], Option<&[u8]>) {
        match memchr::memchr(b'?', raw) {
            Some(at) => (&raw[..at], Some(&raw[at + 1..])),
            None => (raw, None),
        }
    }

    pub(crate) fn get_file(&self, fh: [u8; 4]) -> Option<Arc<File>> {
        self.ftab.get(fhandle(fh))
    }

    // ---------------------------------------------------------------- login

    pub(crate) async fn do_login(&mut self, req: &Request) -> XeqResult {
        let Operation::Login(args) = req.operation() else {
            unreachable!()
        };
        self.ctx.stats.bump(&self.ctx.stats.misc_cnt);
        let resp = self.resp(req.streamid());

        if !self.status.is_empty() {
            resp.send_error(
                ErrorCode::InvalidRequest,
                "duplicate login; already logged in",
            )
            .await?;
            return Ok(Flow::Continue);
        }

        let uname = login_name(&args);
        self.client.name = uname.clone();
        self.client.pid = args.pid.get();
        self.client.host = self.link.id().to_string();
        self.client.prot = "host".to_string();
        self.capver = args.capver;
        if args.role == wire::LOGIN_ROLE_ADMIN {
            self.status |= Status::ADMIN;
        }

        // Mint the session identity and register it for endsess/bind.
        let seq = self.ctx.session_seq.fetch_add(1, Ordering::Relaxed);
        let mut sessid = [0u8; 16];
        sessid[0..4].copy_from_slice(&std::process::id().to_be_bytes());
        sessid[4..8].copy_from_slice(&seq.to_be_bytes());
        self.sessid = sessid;
        self.ctx.sessions.lock().insert(
            sessid,
            Arc::new(SessionHandle {
                cancel: self.cancel.clone(),
                bound: Arc::clone(&self.bound),
            }),
        );

        if let Some(mon) = &self.ctx.monitor {
            self.monitor = Some(MonitorCtx::new(Arc::clone(mon), &uname, true, true));
        }

        let token = self
            .ctx
            .security
            .as_ref()
            .and_then(|sec| sec.get_parms(&self.client.host));
        match token {
            Some(parms) if !parms.is_empty() => {
                self.status |= Status::LOGGED_IN | Status::NEED_AUTH;
                resp.send_ok(&parms).await?;
            }
            _ => {
                self.status |= Status::LOGGED_IN;
                resp.send_ok(&[]).await?;
            }
        }
        info!(
            "{} login capver={}{}",
            self.link.id(),
            self.capver,
            if self.status.contains(Status::ADMIN) {
                " as admin"
            } else {
                ""
            }
        );
        Ok(Flow::Continue)
    }

    pub(crate) async fn do_auth(&mut self, req: &Request) -> XeqResult {
        let resp = self.resp(req.streamid());
        let Some(sec) = self.ctx.security.clone() else {
            resp.send_ok(&[]).await?;
            return Ok(Flow::Continue);
        };
        let cred = self.payload(req.dlen()).to_vec();
        match sec.authenticate(&cred, &mut self.client).await {
            Ok(AuthOutcome::Done) => {
                self.status.remove(Status::NEED_AUTH);
                info!("{} authenticated as {}", self.link.id(), self.client.name);
                resp.send_ok(&[]).await?;
            }
            Ok(AuthOutcome::Continue(challenge)) => {
                self.status |= Status::NEED_AUTH;
                debug!("more auth requested; sz={}", challenge.len());
                resp.send_authmore(&challenge).await?;
            }
            Err(e) => {
                warn!("{} authentication failed: {e}", self.link.id());
                resp.send_error(ErrorCode::NotAuthorized, &e.to_string())
                    .await?;
            }
        }
        Ok(Flow::Continue)
    }

    pub(crate) async fn do_protocol(&mut self, req: &Request) -> XeqResult {
        let Operation::Protocol(args) = req.operation() else {
            unreachable!()
        };
        self.ctx.stats.bump(&self.ctx.stats.misc_cnt);
        self.clientpv = args.clientpv.get();
        debug!("{} protocol clientpv={:#x}", self.link.id(), self.clientpv);
        let pval = I32::new(wire::PROTOCOL_VERSION as i32);
        let flags = I32::new(if self.ctx.config.redirector {
            wire::ROLE_LBAL_SERVER as i32
        } else {
            wire::ROLE_DATA_SERVER as i32
        });
        self.resp(req.streamid())
            .send_iov(ResponseStatus::Ok, &[pval.as_bytes(), flags.as_bytes()])
            .await?;
        Ok(Flow::Continue)
    }

    pub(crate) async fn do_ping(&mut self, req: &Request) -> XeqResult {
        self.ctx.stats.bump(&self.ctx.stats.misc_cnt);
        self.resp(req.streamid()).send_ok(&[]).await?;
        Ok(Flow::Continue)
    }

    // ----------------------------------------------------------------- open

    pub(crate) async fn do_open(&mut self, req: &Request) -> XeqResult {
        let Operation::Open(args) = req.operation() else {
            unreachable!()
        };
        self.ctx.stats.bump(&self.ctx.stats.open_cnt);
        let resp = self.resp(req.streamid());

        if req.dlen() == 0 {
            resp.send_error(ErrorCode::ArgMissing, "Required argument not present")
                .await?;
            return Ok(Flow::Continue);
        }
        let payload = self.payload(req.dlen());
        let raw = match memchr::memchr(0, payload) {
            Some(at) => &payload[..at],
            None => payload,
        };
        let (raw_path, _opaque) = Self::split_opaque(raw);
        let Some(path) = self.screen_path(&resp, "Opening", raw_path).await? else {
            return Ok(Flow::Continue);
        };

        let flags = OpenFlags::from_bits_truncate(args.options.get());
        let mode = map_mode(OpenMode::from_bits_truncate(args.mode.get())) | 0o600;
        let writable = flags
            .intersects(OpenFlags::NEW | OpenFlags::DELETE | OpenFlags::UPDATE | OpenFlags::APPEND);
        let access = if writable {
            AccessMode::Write
        } else {
            AccessMode::Read
        };
        let async_mode = (flags.contains(OpenFlags::ASYNC) || self.ctx.config.as_force)
            && !self.ctx.config.as_noaio;

        let fsfile = match self.ctx.fs.open(&path, flags, mode, &self.client).await {
            Ok(f) => f,
            Err(e) => {
                self.fs_error(&resp, &e).await?;
                return Ok(Flow::Continue);
            }
        };
        let stat = match fsfile.stat().await {
            Ok(s) => s,
            Err(e) => {
                self.fs_error(&resp, &e).await?;
                return Ok(Flow::Continue);
            }
        };

        let mut file = File::new(fsfile, &path, access, async_mode, &stat);
        file.sf_enabled = !self.ctx.config.no_sendfile;
        let file = Arc::new(file);

        let force = flags.contains(OpenFlags::FORCE);
        if let Err(denied) = self.ctx.locker.lock(&file.key, access, force) {
            let (n, who) = match access {
                AccessMode::Read => (
                    denied.writers,
                    if denied.writers > 1 { "writers" } else { "writer" },
                ),
                AccessMode::Write => (
                    denied.readers + denied.writers,
                    if denied.readers + denied.writers > 1 {
                        "users"
                    } else {
                        "user"
                    },
                ),
            };
            let msg = format!("file {path} is already opened by {n} {who}; open denied.");
            warn!("{} {msg}", self.link.id());
            let _ = file.fsfile.close().await;
            resp.send_error(ErrorCode::FileLocked, &msg).await?;
            return Ok(Flow::Continue);
        }

        if let Some(mon) = &self.monitor {
            if mon.mon_file {
                let did = mon.agent.map_path(&self.client.name, &path);
                file.mon_id.store(did as u64, Ordering::Relaxed);
                mon.agent.open(did, stat.size);
            }
        }

        let handle = self.ftab.add(Arc::clone(&file));
        debug!(
            "{} open {} fh={} async={} sf={}",
            self.link.id(),
            path,
            handle,
            file.async_mode,
            file.sf_enabled
        );
        resp.send_ok(&fhandle_bytes(handle)).await?;
        Ok(Flow::Continue)
    }

    pub(crate) async fn do_close(&mut self, req: &Request) -> XeqResult {
        let Operation::Close(args) = req.operation() else {
            unreachable!()
        };
        self.ctx.stats.bump(&self.ctx.stats.misc_cnt);
        let resp = self.resp(req.streamid());
        let handle = fhandle(args.fhandle);
        let Some(file) = self.ftab.get(handle) else {
            resp.send_error(
                ErrorCode::FileNotOpen,
                "close does not refer to an open file",
            )
            .await?;
            return Ok(Flow::Continue);
        };

        // No aio completion may race the close.
        if file.async_mode {
            self.link.serialize().await;
        }

        if let Some(mon) = &self.monitor {
            if mon.mon_file {
                mon.agent.close(
                    file.mon_id.load(Ordering::Relaxed) as u32,
                    file.stats.total_read(),
                    file.stats.total_written(),
                );
            }
        }

        self.ftab.del(handle);
        self.ctx.locker.unlock(&file.key, file.mode);
        debug!("{} close fh={}", self.link.id(), handle);
        match file.fsfile.close().await {
            Ok(()) => resp.send_ok(&[]).await?,
            // The handle is gone either way.
            Err(e) => self.fs_error(&resp, &e).await?,
        }
        Ok(Flow::Continue)
    }

    pub(crate) async fn do_sync(&mut self, req: &Request) -> XeqResult {
        let Operation::Sync(args) = req.operation() else {
            unreachable!()
        };
        self.ctx.stats.bump(&self.ctx.stats.sync_cnt);
        let resp = self.resp(req.streamid());
        let Some(file) = self.get_file(args.fhandle) else {
            resp.send_error(ErrorCode::FileNotOpen, "sync does not refer to an open file")
                .await?;
            return Ok(Flow::Continue);
        };
        match file.fsfile.sync().await {
            Ok(()) => resp.send_ok(&[]).await?,
            Err(e) => self.fs_error(&resp, &e).await?,
        }
        Ok(Flow::Continue)
    }

    pub(crate) async fn do_truncate(&mut self, req: &Request) -> XeqResult {
        let Operation::Truncate(args) = req.operation() else {
            unreachable!()
        };
        self.ctx.stats.bump(&self.ctx.stats.misc_cnt);
        let resp = self.resp(req.streamid());
        let size = args.offset.get();
        if size < 0 {
            resp.send_error(ErrorCode::ArgInvalid, "Truncate size is invalid")
                .await?;
            return Ok(Flow::Continue);
        }
        let result = if req.dlen() > 0 {
            let payload = self.payload(req.dlen());
            let raw = match memchr::memchr(0, payload) {
                Some(at) => &payload[..at],
                None => payload,
            };
            let Some(path) = self.screen_path(&resp, "Truncating", raw).await? else {
                return Ok(Flow::Continue);
            };
            self.ctx.fs.truncate(&path, size, &self.client).await
        } else {
            let Some(file) = self.get_file(args.fhandle) else {
                resp.send_error(
                    ErrorCode::FileNotOpen,
                    "truncate does not refer to an open file",
                )
                .await?;
                return Ok(Flow::Continue);
            };
            file.fsfile.truncate(size).await
        };
        match result {
            Ok(()) => resp.send_ok(&[]).await?,
            Err(e) => self.fs_error(&resp, &e).await?,
        }
        Ok(Flow::Continue)
    }

    // ----------------------------------------------------------------- read

    pub(crate) async fn do_read(&mut self, req: &Request) -> XeqResult {
        let Operation::Read(args) = req.operation() else {
            unreachable!()
        };
        self.num_reads += 1;
        let resp = self.resp(req.streamid());

        // The payload, when present, is a pre-read hint list.
        if req.dlen() > 0 && self.do_preread(&resp, req.dlen()).await? == Flow::Terminate {
            return Ok(Flow::Continue);
        }

        let offset = args.offset.get();
        let rlen = args.rlen.get();
        if offset < 0 || rlen < 0 {
            resp.send_error(ErrorCode::ArgInvalid, "Read length or offset is invalid")
                .await?;
            return Ok(Flow::Continue);
        }
        let Some(file) = self.get_file(args.fhandle) else {
            resp.send_error(ErrorCode::FileNotOpen, "read does not refer to an open file")
                .await?;
            return Ok(Flow::Continue);
        };
        debug!(
            "{} fh={} read {}@{}",
            self.link.id(),
            fhandle(args.fhandle),
            rlen,
            offset
        );
        if rlen == 0 {
            resp.send_ok(&[]).await?;
            return Ok(Flow::Continue);
        }
        if let Some(mon) = &self.monitor {
            mon.add_rd(file.mon_id.load(Ordering::Relaxed) as u32, rlen, offset);
        }
        file.stats.rd_ops(rlen);

        if self.async_eligible(&file, rlen) {
            let task = ReadTask {
                link: Arc::clone(&self.link),
                file,
                resp,
                pool: Arc::clone(&self.ctx.pool),
                segsize: self.ctx.config.as_segsize,
                max_per_req: self.ctx.config.as_maxperreq,
                cancel: self.cancel.subscribe(),
                page: false,
                verify: false,
            };
            task.spawn(offset, rlen);
            return Ok(Flow::Continue);
        }
        self.read_sync(&resp, &file, offset, rlen).await?;
        Ok(Flow::Continue)
    }

    pub(crate) fn async_eligible(&self, file: &File, rlen: i32) -> bool {
        if !file.async_mode || self.ctx.config.as_noaio {
            if file.async_mode {
                self.ctx.stats.bump(&self.ctx.stats.async_rej);
            }
            return false;
        }
        let ok = rlen >= self.ctx.config.as_miniosz
            && self.link.use_count() < self.ctx.config.as_maxperlnk;
        if !ok {
            self.ctx.stats.bump(&self.ctx.stats.async_rej);
        }
        ok
    }

    /// Submit each pre-read hint; delivers no data. Returns Terminate if the
    /// request had to be failed.
    async fn do_preread(&mut self, resp: &Response, dlen: i32) -> XeqResult {
        let payload = self.payload(dlen).to_vec();
        let mut it = ArgumentIterator::new(&payload);
        while it.len() >= wire::IOVEC_ENTRY_LEN {
            let entry: &ReadVEntry = it.fetch().unwrap();
            let Some(file) = self.get_file(entry.fhandle) else {
                resp.send_error(
                    ErrorCode::FileNotOpen,
                    "preread does not refer to an open file",
                )
                .await?;
                return Ok(Flow::Terminate);
            };
            let _ = file.fsfile.preread(entry.offset.get(), entry.rlen.get()).await;
            self.tot_readp += entry.rlen.get() as i64;
            self.num_reads += 1;
            self.ctx.stats.bump(&self.ctx.stats.prer_cnt);
        }
        Ok(Flow::Continue)
    }

    /// Buffered read loop: chunks go out as partials, EOF or the range end
    /// produces the final ok.
    async fn read_sync(
        &mut self,
        resp: &Response,
        file: &Arc<File>,
        offset: i64,
        rlen: i32,
    ) -> std::io::Result<()> {
        let quantum = (rlen as usize).min(self.ctx.config.max_transz);
        let Some(mut buf) = self.ctx.pool.obtain(quantum) else {
            return resp
                .send_error(ErrorCode::NoMemory, "insufficient memory to read file")
                .await;
        };
        let mut at = offset;
        let mut remaining = rlen as usize;
        let result = loop {
            let q = quantum.min(remaining);
            match file.fsfile.read(at, &mut buf.as_mut_slice()[..q]).await {
                Err(e) => {
                    break self.fs_error(resp, &e).await;
                }
                Ok(0) => {
                    break resp.send_ok(&[]).await;
                }
                Ok(n) => {
                    if n >= remaining {
                        break resp.send_ok(&buf.as_slice()[..n]).await;
                    }
                    resp.send_partial(&buf.as_slice()[..n]).await?;
                    at += n as i64;
                    remaining -= n;
                }
            }
        };
        self.ctx.pool.release(buf);
        result
    }

    // ---------------------------------------------------------------- readv

    pub(crate) async fn do_readv(&mut self, req: &Request) -> XeqResult {
        let resp = self.resp(req.streamid());
        let dlen = req.dlen();
        if dlen <= 0 || dlen as usize % wire::IOVEC_ENTRY_LEN != 0 {
            resp.send_error(ErrorCode::ArgInvalid, "Read vector is invalid")
                .await?;
            return Ok(Flow::Continue);
        }
        if dlen as usize > wire::MAX_RVEC_LEN {
            resp.send_error(ErrorCode::ArgTooLong, "Read vector is too long")
                .await?;
            return Ok(Flow::Continue);
        }
        let payload = self.payload(dlen).to_vec();
        let count = payload.len() / wire::IOVEC_ENTRY_LEN;
        let mut it = ArgumentIterator::new(&payload);
        let entries = it.fetch_slice::<ReadVEntry>(count).unwrap().to_vec();
        self.num_readv += 1;
        self.num_segsv += count as u64;

        for (i, entry) in entries.iter().enumerate() {
            let last = i + 1 == entries.len();
            let rlen = entry.rlen.get();
            let offset = entry.offset.get();
            if rlen < 0 || offset < 0 || rlen as usize > self.ctx.pool.max_size() {
                resp.send_error(ErrorCode::ArgInvalid, "Read vector element is invalid")
                    .await?;
                return Ok(Flow::Continue);
            }
            let Some(file) = self.get_file(entry.fhandle) else {
                resp.send_error(ErrorCode::FileNotOpen, "readv does not refer to an open file")
                    .await?;
                return Ok(Flow::Continue);
            };
            let Some(mut buf) = self.ctx.pool.obtain(rlen.max(1) as usize) else {
                resp.send_error(ErrorCode::NoMemory, "insufficient memory for readv")
                    .await?;
                return Ok(Flow::Continue);
            };
            // Fill the element completely; a short read ends it at EOF.
            let mut got = 0usize;
            let mut failed = None;
            while got < rlen as usize {
                match file
                    .fsfile
                    .read(offset + got as i64, &mut buf.as_mut_slice()[got..rlen as usize])
                    .await
                {
                    Ok(0) => break,
                    Ok(n) => got += n,
                    Err(e) => {
                        failed = Some(e);
                        break;
                    }
                }
            }
            if let Some(e) = failed {
                self.fs_error(&resp, &e).await?;
                self.ctx.pool.release(buf);
                return Ok(Flow::Continue);
            }
            file.stats.rv_ops(got as i32, 1);
            let hdr = ReadVEntry {
                fhandle: entry.fhandle,
                rlen: I32::new(got as i32),
                offset: I64::new(offset),
            };
            let status = if last {
                ResponseStatus::Ok
            } else {
                ResponseStatus::OkSoFar
            };
            let sent = resp
                .send_iov(status, &[hdr.as_bytes(), &buf.as_slice()[..got]])
                .await;
            self.ctx.pool.release(buf);
            sent?;
        }
        Ok(Flow::Continue)
    }

    // ---------------------------------------------------------------- write

    pub(crate) async fn do_write(&mut self, req: &Request) -> XeqResult {
        let Operation::Write(args) = req.operation() else {
            unreachable!()
        };
        self.num_writes += 1;
        let resp = self.resp(req.streamid());
        let offset = args.offset.get();
        let dlen = req.dlen();

        if dlen == 0 {
            resp.send_ok(&[]).await?;
            return Ok(Flow::Continue);
        }
        let file = match self.get_file(args.fhandle) {
            Some(f) if offset >= 0 => f,
            bad => {
                // The payload is already in flight; eat it to stay aligned.
                discard_payload(
                    &mut self.reader,
                    &self.ctx.pool,
                    dlen as usize,
                    self.ctx.config.read_wait,
                )
                .await?;
                if bad.is_none() {
                    resp.send_error(
                        ErrorCode::FileNotOpen,
                        "write does not refer to an open file",
                    )
                    .await?;
                } else {
                    resp.send_error(ErrorCode::ArgInvalid, "Write offset is invalid")
                        .await?;
                }
                return Ok(Flow::Continue);
            }
        };
        debug!(
            "{} fh={} write {}@{}",
            self.link.id(),
            fhandle(args.fhandle),
            dlen,
            offset
        );
        if let Some(mon) = &self.monitor {
            mon.add_wr(file.mon_id.load(Ordering::Relaxed) as u32, dlen, offset);
        }
        self.write_common(&resp, &file, offset, dlen).await?;
        Ok(Flow::Continue)
    }

    /// Stream `dlen` bytes from the link into the file and send the terminal
    /// response. Sync and async writes share this path; eligibility only
    /// widens the in-flight window.
    pub(crate) async fn write_common(
        &mut self,
        resp: &Response,
        file: &Arc<File>,
        offset: i64,
        dlen: i32,
    ) -> std::io::Result<()> {
        let eligible = file.async_mode
            && !self.ctx.config.as_syncw
            && !self.ctx.config.as_noaio
            && dlen >= self.ctx.config.as_miniosz;
        let (seg, width) = if eligible {
            (self.ctx.config.as_segsize, self.ctx.config.as_maxperreq)
        } else {
            (self.ctx.config.max_transz, 1)
        };
        let outcome = write_task(
            &mut self.reader,
            file,
            &self.ctx.pool,
            seg,
            width,
            self.ctx.config.read_wait,
            offset,
            dlen,
        )
        .await;
        file.stats.wr_ops(outcome.committed as i32);
        if let Some(e) = outcome.failed {
            return Err(e);
        }
        match outcome.error {
            None => resp.send_ok(&[]).await,
            Some(e) => self.fs_error(resp, &e).await,
        }
    }

    // --------------------------------------------------------------- writev

    pub(crate) async fn do_writev(&mut self, req: &Request) -> XeqResult {
        let resp = self.resp(req.streamid());
        let dlen = req.dlen();
        if dlen == 0 {
            resp.send_ok(&[]).await?;
            return Ok(Flow::Continue);
        }
        if dlen as usize % wire::IOVEC_ENTRY_LEN != 0 {
            // The data stream length is unknowable; the link must close.
            resp.send_error(ErrorCode::ArgInvalid, "Write vector is invalid")
                .await?;
            return Err(protocol_violation("malformed write vector"));
        }
        if dlen as usize > wire::MAX_WVEC_LEN {
            resp.send_error(ErrorCode::ArgTooLong, "Write vector is too long")
                .await?;
            return Err(protocol_violation("oversized write vector"));
        }
        let payload = self.payload(dlen).to_vec();
        let count = payload.len() / wire::IOVEC_ENTRY_LEN;
        let mut it = ArgumentIterator::new(&payload);
        let entries = it.fetch_slice::<WriteVEntry>(count).unwrap().to_vec();
        for e in &entries {
            if e.wlen.get() < 0 || e.offset.get() < 0 {
                resp.send_error(ErrorCode::ArgInvalid, "Write vector element is invalid")
                    .await?;
                return Err(protocol_violation("invalid write vector element"));
            }
        }
        self.writev_exec(&resp, &entries).await?;
        Ok(Flow::Continue)
    }

    /// Execute writev elements in list order; on the first failure the rest
    /// of the data stream is consumed but not written.
    pub(crate) async fn writev_exec(
        &mut self,
        resp: &Response,
        entries: &[WriteVEntry],
    ) -> std::io::Result<()> {
        self.num_writes += 1;
        for (i, entry) in entries.iter().enumerate() {
            let wlen = entry.wlen.get();
            let Some(file) = self.get_file(entry.fhandle) else {
                self.drain_elements(&entries[i..]).await?;
                let msg = format!("writev element {i} does not refer to an open file");
                resp.send_error(ErrorCode::FileNotOpen, &msg).await?;
                return Ok(());
            };
            let outcome = write_task(
                &mut self.reader,
                &file,
                &self.ctx.pool,
                self.ctx.config.max_transz,
                1,
                self.ctx.config.read_wait,
                entry.offset.get(),
                wlen,
            )
            .await;
            file.stats.wr_ops(outcome.committed as i32);
            if let Some(e) = outcome.failed {
                return Err(e);
            }
            if let Some(e) = outcome.error {
                self.drain_elements(&entries[i + 1..]).await?;
                let msg = format!("writev element {i} failed: {e}");
                resp.send_error(e.code(), &msg).await?;
                return Ok(());
            }
        }
        resp.send_ok(&[]).await
    }

    async fn drain_elements(&mut self, entries: &[WriteVEntry]) -> std::io::Result<()> {
        let total: i64 = entries.iter().map(|e| e.wlen.get() as i64).sum();
        if total > 0 {
            discard_payload(
                &mut self.reader,
                &self.ctx.pool,
                total as usize,
                self.ctx.config.read_wait,
            )
            .await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------ stat etc.

    pub(crate) async fn do_stat(&mut self, req: &Request) -> XeqResult {
        let Operation::Stat(args) = req.operation() else {
            unreachable!()
        };
        self.ctx.stats.bump(&self.ctx.stats.misc_cnt);
        let resp = self.resp(req.streamid());
        let stat = if req.dlen() > 0 {
            let payload = self.payload(req.dlen());
            let raw = match memchr::memchr(0, payload) {
                Some(at) => &payload[..at],
                None => payload,
            };
            let Some(path) = self.screen_path(&resp, "Stating", raw).await? else {
                return Ok(Flow::Continue);
            };
            self.ctx.fs.stat(&path, &self.client).await
        } else {
            match self.get_file(args.fhandle) {
                Some(file) => file.fsfile.stat().await,
                None => {
                    resp.send_error(ErrorCode::FileNotOpen, "stat does not refer to an open file")
                        .await?;
                    return Ok(Flow::Continue);
                }
            }
        };
        match stat {
            Ok(st) => {
                let text = format_stat(&st);
                resp.send_ok(text.as_bytes()).await?;
            }
            Err(e) => self.fs_error(&resp, &e).await?,
        }
        Ok(Flow::Continue)
    }

    pub(crate) async fn do_statx(&mut self, req: &Request) -> XeqResult {
        self.ctx.stats.bump(&self.ctx.stats.misc_cnt);
        let resp = self.resp(req.streamid());
        if req.dlen() == 0 {
            resp.send_error(ErrorCode::ArgMissing, "Required argument not present")
                .await?;
            return Ok(Flow::Continue);
        }
        let payload = self.payload(req.dlen()).to_vec();
        let mut flags = Vec::new();
        for line in payload.split(|&b| b == b'\n' || b == 0) {
            if line.is_empty() {
                continue;
            }
            let Some(path) = self.screen_path(&resp, "Stating", line).await? else {
                return Ok(Flow::Continue);
            };
            let flag = match self.ctx.fs.stat(&path, &self.client).await {
                Ok(st) => match st.kind {
                    crate::fs::FileKind::Dir => StatFlags::IS_DIR.bits() as u8,
                    crate::fs::FileKind::File => 0,
                    crate::fs::FileKind::Other => StatFlags::OTHER.bits() as u8,
                },
                Err(_) => StatFlags::OTHER.bits() as u8,
            };
            flags.push(flag);
        }
        resp.send_ok(&flags).await?;
        Ok(Flow::Continue)
    }

    pub(crate) async fn do_dirlist(&mut self, req: &Request) -> XeqResult {
        self.ctx.stats.bump(&self.ctx.stats.misc_cnt);
        let resp = self.resp(req.streamid());
        if req.dlen() == 0 {
            resp.send_error(ErrorCode::ArgMissing, "Required argument not present")
                .await?;
            return Ok(Flow::Continue);
        }
        let payload = self.payload(req.dlen());
        let raw = match memchr::memchr(0, payload) {
            Some(at) => &payload[..at],
            None => payload,
        };
        let Some(path) = self.screen_path(&resp, "Listing", raw).await? else {
            return Ok(Flow::Continue);
        };
        let names = match self.ctx.fs.dirlist(&path, &self.client).await {
            Ok(n) => n,
            Err(e) => {
                self.fs_error(&resp, &e).await?;
                return Ok(Flow::Continue);
            }
        };
        // Entries go out newline separated, segmented when the staging
        // area fills; the last entry is null terminated.
        let mut chunk = Vec::with_capacity(4096);
        let mut first = true;
        for name in names.iter().filter(|n| *n != "." && *n != "..") {
            if !first && chunk.len() + name.len() + 1 > 4096 {
                resp.send_partial(&chunk).await?;
                chunk.clear();
            }
            if !chunk.is_empty() {
                chunk.push(b'\n');
            }
            chunk.extend_from_slice(name.as_bytes());
            first = false;
        }
        if chunk.is_empty() {
            resp.send_ok(&[]).await?;
        } else {
            chunk.push(0);
            resp.send_ok(&chunk).await?;
        }
        Ok(Flow::Continue)
    }

    pub(crate) async fn do_mkdir(&mut self, req: &Request) -> XeqResult {
        let Operation::Mkdir(args) = req.operation() else {
            unreachable!()
        };
        self.ctx.stats.bump(&self.ctx.stats.misc_cnt);
        let resp = self.resp(req.streamid());
        if req.dlen() == 0 {
            resp.send_error(ErrorCode::ArgMissing, "Required argument not present")
                .await?;
            return Ok(Flow::Continue);
        }
        let payload = self.payload(req.dlen());
        let raw = match memchr::memchr(0, payload) {
            Some(at) => &payload[..at],
            None => payload,
        };
        let Some(path) = self.screen_path(&resp, "Creating", raw).await? else {
            return Ok(Flow::Continue);
        };
        let mode = map_mode(OpenMode::from_bits_truncate(args.mode.get())) | 0o700;
        let mkpath = args.options & wire::MKDIR_PATH != 0;
        match self.ctx.fs.mkdir(&path, mode, mkpath, &self.client).await {
            Ok(()) => resp.send_ok(&[]).await?,
            Err(e) => self.fs_error(&resp, &e).await?,
        }
        Ok(Flow::Continue)
    }

    pub(crate) async fn do_mv(&mut self, req: &Request) -> XeqResult {
        self.ctx.stats.bump(&self.ctx.stats.misc_cnt);
        let resp = self.resp(req.streamid());
        if req.dlen() == 0 {
            resp.send_error(ErrorCode::ArgMissing, "Required argument not present")
                .await?;
            return Ok(Flow::Continue);
        }
        let payload = self.payload(req.dlen()).to_vec();
        let text = &payload[..memchr::memchr(0, &payload).unwrap_or(payload.len())];
        let Some(space) = memchr::memchr(b' ', text) else {
            resp.send_error(ErrorCode::ArgMissing, "new path specified for mv")
                .await?;
            return Ok(Flow::Continue);
        };
        let (old_raw, new_raw) = text.split_at(space);
        let new_raw: Vec<u8> = new_raw
            .iter()
            .copied()
            .skip_while(|&b| b == b' ')
            .collect();
        let Some(old) = self.screen_path(&resp, "Renaming", old_raw).await? else {
            return Ok(Flow::Continue);
        };
        let Some(new) = self.screen_path(&resp, "Renaming to", &new_raw).await? else {
            return Ok(Flow::Continue);
        };
        match self.ctx.fs.rename(&old, &new, &self.client).await {
            Ok(()) => resp.send_ok(&[]).await?,
            Err(e) => self.fs_error(&resp, &e).await?,
        }
        Ok(Flow::Continue)
    }

    pub(crate) async fn do_chmod(&mut self, req: &Request) -> XeqResult {
        let Operation::Chmod(args) = req.operation() else {
            unreachable!()
        };
        self.ctx.stats.bump(&self.ctx.stats.misc_cnt);
        let resp = self.resp(req.streamid());
        if req.dlen() == 0 {
            resp.send_error(ErrorCode::ArgMissing, "Required argument not present")
                .await?;
            return Ok(Flow::Continue);
        }
        let payload = self.payload(req.dlen());
        let raw = match memchr::memchr(0, payload) {
            Some(at) => &payload[..at],
            None => payload,
        };
        let Some(path) = self.screen_path(&resp, "Modifying", raw).await? else {
            return Ok(Flow::Continue);
        };
        let mode = map_mode(OpenMode::from_bits_truncate(args.mode.get()));
        match self.ctx.fs.chmod(&path, mode, &self.client).await {
            Ok(()) => resp.send_ok(&[]).await?,
            Err(e) => self.fs_error(&resp, &e).await?,
        }
        Ok(Flow::Continue)
    }

    pub(crate) async fn do_rm(&mut self, req: &Request) -> XeqResult {
        self.ctx.stats.bump(&self.ctx.stats.misc_cnt);
        let resp = self.resp(req.streamid());
        if req.dlen() == 0 {
            resp.send_error(ErrorCode::ArgMissing, "Required argument not present")
                .await?;
            return Ok(Flow::Continue);
        }
        let payload = self.payload(req.dlen());
        let raw = match memchr::memchr(0, payload) {
            Some(at) => &payload[..at],
            None => payload,
        };
        let Some(path) = self.screen_path(&resp, "Removing", raw).await? else {
            return Ok(Flow::Continue);
        };
        match self.ctx.fs.remove(&path, &self.client).await {
            Ok(()) => resp.send_ok(&[]).await?,
            Err(e) => self.fs_error(&resp, &e).await?,
        }
        Ok(Flow::Continue)
    }

    pub(crate) async fn do_rmdir(&mut self, req: &Request) -> XeqResult {
        self.ctx.stats.bump(&self.ctx.stats.misc_cnt);
        let resp = self.resp(req.streamid());
        if req.dlen() == 0 {
            resp.send_error(ErrorCode::ArgMissing, "Required argument not present")
                .await?;
            return Ok(Flow::Continue);
        }
        let payload = self.payload(req.dlen());
        let raw = match memchr::memchr(0, payload) {
            Some(at) => &payload[..at],
            None => payload,
        };
        let Some(path) = self.screen_path(&resp, "Removing", raw).await? else {
            return Ok(Flow::Continue);
        };
        match self.ctx.fs.rmdir(&path, &self.client).await {
            Ok(()) => resp.send_ok(&[]).await?,
            Err(e) => self.fs_error(&resp, &e).await?,
        }
        Ok(Flow::Continue)
    }

    // ------------------------------------------------------------ set/query

    pub(crate) async fn do_set(&mut self, req: &Request) -> XeqResult {
        self.ctx.stats.bump(&self.ctx.stats.misc_cnt);
        let resp = self.resp(req.streamid());
        let payload = self.payload(req.dlen()).to_vec();
        let text = String::from_utf8_lossy(
            &payload[..memchr::memchr(0, &payload).unwrap_or(payload.len())],
        )
        .into_owned();
        let mut tokens = text.split_whitespace();
        let Some(verb) = tokens.next() else {
            resp.send_error(ErrorCode::ArgMissing, "set argument not specified.")
                .await?;
            return Ok(Flow::Continue);
        };
        match verb {
            "appid" => {
                let appid: String = tokens.collect::<Vec<_>>().join(" ");
                info!("{} appid {}", self.link.id(), appid);
                resp.send_ok(&[]).await?;
            }
            "monitor" => match tokens.next() {
                Some("on") => {
                    if self.monitor.is_none() {
                        if let Some(agent) = self.ctx.monitor.clone() {
                            self.monitor =
                                Some(MonitorCtx::new(agent, &self.client.name, true, true));
                        }
                    }
                    resp.send_ok(&[]).await?;
                }
                Some("off") => {
                    self.monitor = None;
                    resp.send_ok(&[]).await?;
                }
                Some("info") => {
                    let myseq = U32::new(0);
                    resp.send_ok(myseq.as_bytes()).await?;
                }
                _ => {
                    resp.send_error(ErrorCode::ArgInvalid, "invalid set monitor argument")
                        .await?;
                }
            },
            _ => {
                resp.send_error(ErrorCode::ArgInvalid, "invalid set parameter")
                    .await?;
            }
        }
        Ok(Flow::Continue)
    }

    pub(crate) async fn do_query(&mut self, req: &Request) -> XeqResult {
        let Operation::Query(args) = req.operation() else {
            unreachable!()
        };
        self.ctx.stats.bump(&self.ctx.stats.misc_cnt);
        let resp = self.resp(req.streamid());
        match args.infotype.get() {
            QUERY_STATS => {
                let report = self.ctx.stats.report();
                resp.send_ok(report.as_bytes()).await?;
            }
            QUERY_CONFIG => {
                let payload = self.payload(req.dlen()).to_vec();
                let text = String::from_utf8_lossy(
                    &payload[..memchr::memchr(0, &payload).unwrap_or(payload.len())],
                )
                .into_owned();
                let mut out = String::new();
                for word in text.split_whitespace() {
                    match word {
                        "version" => out.push_str(concat!("rootd ", env!("CARGO_PKG_VERSION"), "\n")),
                        "role" => {
                            out.push_str(if self.ctx.config.redirector {
                                "manager\n"
                            } else {
                                "server\n"
                            });
                        }
                        other => {
                            out.push_str(other);
                            out.push('\n');
                        }
                    }
                }
                resp.send_ok(out.as_bytes()).await?;
            }
            _ => {
                resp.send_error(ErrorCode::ArgInvalid, "Invalid information query type code")
                    .await?;
            }
        }
        Ok(Flow::Continue)
    }

    // --------------------------------------------------------- endsess/bind

    pub(crate) async fn do_endsess(&mut self, req: &Request) -> XeqResult {
        let Operation::Endsess(args) = req.operation() else {
            unreachable!()
        };
        self.ctx.stats.bump(&self.ctx.stats.misc_cnt);
        let resp = self.resp(req.streamid());
        let target = args.sessid;
        if target == [0u8; 16] || target == self.sessid {
            resp.send_ok(&[]).await?;
            return Ok(Flow::Terminate);
        }
        let handle = self.ctx.sessions.lock().get(&target).cloned();
        if let Some(handle) = handle {
            let _ = handle.cancel.send(true);
        }
        // An unknown session is already as ended as it can get.
        resp.send_ok(&[]).await?;
        Ok(Flow::Continue)
    }

    pub(crate) async fn do_bind(&mut self, req: &Request) -> XeqResult {
        let Operation::Bind(args) = req.operation() else {
            unreachable!()
        };
        self.ctx.stats.bump(&self.ctx.stats.misc_cnt);
        let resp = self.resp(req.streamid());
        let handle = self.ctx.sessions.lock().get(&args.sessid).cloned();
        let Some(handle) = handle else {
            resp.send_error(ErrorCode::NotFound, "bind session not found")
                .await?;
            return Ok(Flow::Continue);
        };
        let pathid = {
            let mut bound = handle.bound.lock();
            bound.push(Arc::clone(&self.link));
            bound.len() as u8
        };
        self.status |= Status::BOUND_PATH;
        debug!("{} bound as path {}", self.link.id(), pathid);
        resp.send_ok(&[pathid]).await?;
        Ok(Flow::Continue)
    }
}

fn login_name(args: &LoginArgs) -> String {
    let end = args
        .username
        .iter()
        .position(|&b| b == 0 || b == b' ')
        .unwrap_or(args.username.len());
    String::from_utf8_lossy(&args.username[..end]).into_owned()
}

/// Render a stat reply: `id size flags mtime` plus the terminating null.
fn format_stat(st: &FsStat) -> String {
    let mut flags = StatFlags::empty();
    if st.exec {
        flags |= StatFlags::XSET;
    }
    match st.kind {
        crate::fs::FileKind::Dir => flags |= StatFlags::IS_DIR,
        crate::fs::FileKind::Other => flags |= StatFlags::OTHER,
        crate::fs::FileKind::File => {}
    }
    if st.dev == 0 && st.ino == 0 {
        flags |= StatFlags::OFFLINE;
    }
    if st.readable {
        flags |= StatFlags::READABLE;
    }
    if st.writable {
        flags |= StatFlags::WRITABLE;
    }
    format!("{} {} {} {}\0", st.id(), st.size, flags.bits(), st.mtime)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rp_check_wants_absolute_clean_paths() {
        assert!(rp_check("/a/b/c"));
        assert!(!rp_check("a/b"));
        assert!(!rp_check("/a/../b"));
        assert!(!rp_check("/.."));
    }

    #[test]
    fn squash_collapses_dup_slashes_and_dots() {
        assert_eq!(squash("/a//b/./c"), "/a/b/c");
        assert_eq!(squash("//x"), "/x");
        assert_eq!(squash("/"), "/");
    }

    #[test]
    fn stat_flags_reflect_kind() {
        let st = FsStat {
            dev: 1,
            ino: 2,
            size: 10,
            mtime: 0,
            kind: crate::fs::FileKind::Dir,
            exec: false,
            readable: true,
            writable: false,
        };
        let text = format_stat(&st);
        let parts: Vec<&str> = text.trim_end_matches('\0').split(' ').collect();
        let flags = StatFlags::from_bits_truncate(parts[2].parse().unwrap());
        assert!(flags.contains(StatFlags::IS_DIR));
        assert!(flags.contains(StatFlags::READABLE));
        assert!(!flags.contains(StatFlags::WRITABLE));
    }
}
