//! Checkpoint handlers.
//!
//! A checkpoint brackets mutating operations on one file so that rollback
//! restores the pre-begin state. The `xeq` sub-opcode wraps a complete inner
//! request; the pre-image for the inner mutation is recorded before the
//! mutation runs.

use log::debug;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;
use zerocopy::byteorder::big_endian::U32;

use crate::aio::discard_payload;
use crate::channel::recv_exact;
use crate::fs::CkpAct;
use crate::ll::reply::Response;
use crate::ll::request::{Operation, Request, fhandle};
use crate::ll::wire::{
    self, CKP_BEGIN, CKP_COMMIT, CKP_QUERY, CKP_ROLLBACK, CKP_XEQ, ChkPointQueryResponse,
    ErrorCode, RequestCode, RequestHeader, WriteVEntry,
};
use crate::page::pgw_layout;
use crate::session::{Flow, Session, XeqResult, protocol_violation};

impl Session {
    pub(crate) async fn do_chkpoint(&mut self, req: &Request) -> XeqResult {
        let Operation::ChkPoint(args) = req.operation() else {
            unreachable!()
        };
        self.ctx.stats.bump(&self.ctx.stats.misc_cnt);

        if args.opcode == CKP_XEQ {
            return self.do_chkpoint_xeq(req).await;
        }

        let resp = self.resp(req.streamid());
        let Some(file) = self.get_file(args.fhandle) else {
            resp.send_error(
                ErrorCode::FileNotOpen,
                "chkpoint does not refer to an open file",
            )
            .await?;
            return Ok(Flow::Continue);
        };
        debug!(
            "{} fh={} chkpoint op={}",
            self.link.id(),
            fhandle(args.fhandle),
            args.opcode
        );

        let result = match args.opcode {
            CKP_BEGIN => file.fsfile.checkpoint(CkpAct::Create).await,
            CKP_COMMIT => file.fsfile.checkpoint(CkpAct::Delete).await,
            CKP_QUERY => file.fsfile.checkpoint(CkpAct::Query).await,
            CKP_ROLLBACK => file.fsfile.checkpoint(CkpAct::Restore).await,
            _ => {
                resp.send_error(ErrorCode::ArgInvalid, "chkpoint subcode is invalid")
                    .await?;
                return Ok(Flow::Continue);
            }
        };
        match result {
            Ok(info) => {
                match args.opcode {
                    CKP_BEGIN => file.set_ckp_active(true),
                    CKP_COMMIT | CKP_ROLLBACK => file.set_ckp_active(false),
                    _ => {}
                }
                if args.opcode == CKP_QUERY {
                    let body = ChkPointQueryResponse {
                        max_ckp_size: U32::new(info.max_size),
                        use_ckp_size: U32::new(info.used_size),
                    };
                    resp.send_ok(body.as_bytes()).await?;
                } else {
                    resp.send_ok(&[]).await?;
                }
            }
            Err(e) => self.fs_error(&resp, &e).await?,
        }
        Ok(Flow::Continue)
    }

    /// Execute one inner mutating request under the file's checkpoint. The
    /// outer payload must be exactly the inner header, carrying the same
    /// stream id; anything else is a protocol violation that closes the
    /// connection.
    async fn do_chkpoint_xeq(&mut self, req: &Request) -> XeqResult {
        let resp = self.resp(req.streamid());

        if req.dlen() as usize != wire::REQUEST_HDR_LEN {
            resp.send_error(ErrorCode::ArgInvalid, "Request length invalid")
                .await?;
            return Err(protocol_violation("chkpoint xeq bad wrapper length"));
        }
        let payload = self.payload(req.dlen());
        let inner_hdr = RequestHeader::read_from_bytes(&payload[..wire::REQUEST_HDR_LEN])
            .expect("wrapper length was just checked");
        if inner_hdr.streamid != req.streamid() {
            resp.send_error(ErrorCode::ArgInvalid, "Request streamid mismatch")
                .await?;
            return Err(protocol_violation("chkpoint xeq streamid mismatch"));
        }
        let Ok(inner) = Request::from_header(inner_hdr) else {
            resp.send_error(ErrorCode::ArgInvalid, "chkpoint request is invalid")
                .await?;
            return Err(protocol_violation("chkpoint xeq bad inner request"));
        };

        debug!(
            "{} chkpoint xeq inner={}",
            self.link.id(),
            inner.code().name()
        );
        match inner.code() {
            RequestCode::Truncate if inner.dlen() == 0 => self.ckp_truncate(&resp, &inner).await,
            RequestCode::Write => self.ckp_write(&resp, &inner).await,
            RequestCode::PgWrite => self.ckp_pgwrite(&resp, &inner).await,
            RequestCode::WriteV => self.ckp_writev(&resp, &inner).await,
            _ => {
                resp.send_error(ErrorCode::ArgInvalid, "chkpoint request is invalid")
                    .await?;
                Err(protocol_violation("chkpoint xeq inner opcode invalid"))
            }
        }
    }

    async fn ckp_truncate(&mut self, resp: &Response, inner: &Request) -> XeqResult {
        let Operation::Truncate(args) = inner.operation() else {
            unreachable!()
        };
        let size = args.offset.get();
        let Some(file) = self.get_file(args.fhandle) else {
            resp.send_error(
                ErrorCode::FileNotOpen,
                "chkpoint does not refer to an open file",
            )
            .await?;
            return Ok(Flow::Continue);
        };
        if size < 0 {
            resp.send_error(ErrorCode::ArgInvalid, "Truncate size is invalid")
                .await?;
            return Ok(Flow::Continue);
        }
        if let Err(e) = file.fsfile.checkpoint(CkpAct::Trunc { size }).await {
            self.fs_error(resp, &e).await?;
            return Ok(Flow::Continue);
        }
        match file.fsfile.truncate(size).await {
            Ok(()) => resp.send_ok(&[]).await?,
            Err(e) => self.fs_error(resp, &e).await?,
        }
        Ok(Flow::Continue)
    }

    async fn ckp_write(&mut self, resp: &Response, inner: &Request) -> XeqResult {
        let Operation::Write(args) = inner.operation() else {
            unreachable!()
        };
        let offset = args.offset.get();
        let dlen = inner.dlen();
        let wait = self.ctx.config.read_wait;
        let file = match self.get_file(args.fhandle) {
            Some(f) if offset >= 0 => f,
            bad => {
                if dlen > 0 {
                    discard_payload(&mut self.reader, &self.ctx.pool, dlen as usize, wait).await?;
                }
                let (code, msg) = if bad.is_none() {
                    (
                        ErrorCode::FileNotOpen,
                        "chkpoint does not refer to an open file",
                    )
                } else {
                    (ErrorCode::ArgInvalid, "Write offset is invalid")
                };
                resp.send_error(code, msg).await?;
                return Ok(Flow::Continue);
            }
        };
        if dlen == 0 {
            resp.send_ok(&[]).await?;
            return Ok(Flow::Continue);
        }
        if let Err(e) = file
            .fsfile
            .checkpoint(CkpAct::Write {
                ranges: &[(offset, dlen)],
            })
            .await
        {
            discard_payload(&mut self.reader, &self.ctx.pool, dlen as usize, wait).await?;
            self.fs_error(resp, &e).await?;
            return Ok(Flow::Continue);
        }
        self.num_writes += 1;
        self.write_common(resp, &file, offset, dlen).await?;
        Ok(Flow::Continue)
    }

    async fn ckp_pgwrite(&mut self, resp: &Response, inner: &Request) -> XeqResult {
        let Operation::PgWrite(args) = inner.operation() else {
            unreachable!()
        };
        let offset = args.offset.get();
        let dlen = inner.dlen();
        let wait = self.ctx.config.read_wait;
        let layout = match pgw_layout(offset.max(0), dlen.max(0) as usize) {
            Ok(l) if offset >= 0 => l,
            _ => {
                if dlen > 0 {
                    discard_payload(&mut self.reader, &self.ctx.pool, dlen as usize, wait).await?;
                }
                resp.send_error(ErrorCode::ArgInvalid, "pgwrite request is invalid")
                    .await?;
                return Ok(Flow::Continue);
            }
        };
        let Some(file) = self.get_file(args.fhandle) else {
            discard_payload(&mut self.reader, &self.ctx.pool, dlen as usize, wait).await?;
            resp.send_error(
                ErrorCode::FileNotOpen,
                "chkpoint does not refer to an open file",
            )
            .await?;
            return Ok(Flow::Continue);
        };
        let ranges: Vec<(i64, i32)> = layout.iter().map(|&(o, l)| (o, l as i32)).collect();
        if let Err(e) = file.fsfile.checkpoint(CkpAct::Write { ranges: &ranges }).await {
            discard_payload(&mut self.reader, &self.ctx.pool, dlen as usize, wait).await?;
            self.fs_error(resp, &e).await?;
            return Ok(Flow::Continue);
        }
        self.num_writes += 1;
        self.pgwrite_exec(resp, &file, offset, &layout).await?;
        Ok(Flow::Continue)
    }

    async fn ckp_writev(&mut self, resp: &Response, inner: &Request) -> XeqResult {
        let dlen = inner.dlen();
        let wait = self.ctx.config.read_wait;
        if dlen == 0 {
            resp.send_ok(&[]).await?;
            return Ok(Flow::Continue);
        }
        if dlen as usize % wire::IOVEC_ENTRY_LEN != 0 || dlen as usize > wire::MAX_WVEC_LEN {
            resp.send_error(ErrorCode::ArgTooLong, "chkpoint write vector is too long")
                .await?;
            return Err(protocol_violation("chkpoint writev bad vector"));
        }

        // The vector itself still sits on the wire; fetch it first.
        let mut vec_buf = vec![0u8; dlen as usize];
        recv_exact(&mut self.reader, &mut vec_buf, wait).await?;
        let count = vec_buf.len() / wire::IOVEC_ENTRY_LEN;
        let entries = <[WriteVEntry]>::ref_from_bytes_with_elems(&vec_buf, count)
            .expect("vector length was just checked")
            .to_vec();
        for e in &entries {
            if e.wlen.get() < 0 || e.offset.get() < 0 {
                resp.send_error(ErrorCode::ArgInvalid, "Write vector element is invalid")
                    .await?;
                return Err(protocol_violation("chkpoint writev bad element"));
            }
        }

        // A checkpoint covers exactly one file; mixed vectors are refused.
        let fh0 = entries[0].fhandle;
        if entries.iter().any(|e| e.fhandle != fh0) {
            resp.send_error(
                ErrorCode::Unsupported,
                "multi-file chkpoint writev not supported",
            )
            .await?;
            return Err(protocol_violation("chkpoint writev spans files"));
        }
        let Some(file) = self.get_file(fh0) else {
            let total: i64 = entries.iter().map(|e| e.wlen.get() as i64).sum();
            if total > 0 {
                discard_payload(&mut self.reader, &self.ctx.pool, total as usize, wait).await?;
            }
            resp.send_error(
                ErrorCode::FileNotOpen,
                "chkpoint does not refer to an open file",
            )
            .await?;
            return Ok(Flow::Continue);
        };

        let ranges: Vec<(i64, i32)> = entries
            .iter()
            .map(|e| (e.offset.get(), e.wlen.get()))
            .collect();
        if let Err(e) = file.fsfile.checkpoint(CkpAct::Write { ranges: &ranges }).await {
            let total: i64 = entries.iter().map(|e| e.wlen.get() as i64).sum();
            if total > 0 {
                discard_payload(&mut self.reader, &self.ctx.pool, total as usize, wait).await?;
            }
            self.fs_error(resp, &e).await?;
            return Ok(Flow::Continue);
        }
        self.writev_exec(resp, &entries).await?;
        Ok(Flow::Continue)
    }
}
