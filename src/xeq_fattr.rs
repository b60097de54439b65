//! Extended attribute handlers.
//!
//! One opcode with get/set/del/list sub-codes. Attribute names arrive with a
//! two-byte hole ahead of them; validation rewrites the hole into the single
//! client namespace prefix in place, and the reply re-uses the same region
//! to carry per-attribute status codes back.

use std::sync::atomic::Ordering;

use log::debug;
use zerocopy::IntoBytes;
use zerocopy::byteorder::big_endian::U32;

use crate::fs::{FaItem, FaRequest};
use crate::ll::errno::map_errno;
use crate::ll::reply::Response;
use crate::ll::request::{Operation, Request};
use crate::ll::wire::{
    ErrorCode, FATTR_DEL, FATTR_GET, FATTR_LIST, FATTR_MAX_SC, FATTR_MAX_VARS, FATTR_NAMESPACE,
    FATTR_OPT_DATA, FATTR_OPT_NEW, FATTR_SET,
};
use crate::session::{Flow, Session, XeqResult};
use crate::xeq::{rp_check, squash};

/// Outcome of decoding the attribute argument region.
struct Decoded {
    /// The name segment with namespace prefixes rewritten, reused for the
    /// response status vector.
    seg: Vec<u8>,
    /// (offset into seg, name length) per attribute; the name at the offset
    /// spans prefix + name + null.
    names: Vec<(usize, usize)>,
    values: Vec<Vec<u8>>,
}

#[derive(Debug)]
enum DecodeFail {
    /// (error, failing index, true when a value was at fault)
    At(ErrorCode, usize, bool),
}

/// Decode `numattr` names (and, for set, values) from the argument region.
/// Names are a two-byte hole plus a null-terminated string; values are a
/// 32-bit length plus that many bytes. Anything left over is a bad payload.
fn decode(data: &[u8], numattr: usize, max_nsz: usize, max_vsz: usize) -> Result<Decoded, DecodeFail> {
    let mut at = 0usize;
    let mut names = Vec::with_capacity(numattr);
    for i in 0..numattr {
        if at + 2 >= data.len() {
            return Err(DecodeFail::At(ErrorCode::ArgMissing, i, false));
        }
        if data[at] != 0 || data[at + 1] != 0 {
            return Err(DecodeFail::At(ErrorCode::ArgInvalid, i, false));
        }
        let nstart = at + 2;
        let Some(nul) = memchr::memchr(0, &data[nstart..]) else {
            return Err(DecodeFail::At(ErrorCode::ArgMissing, i, false));
        };
        if nul == 0 {
            return Err(DecodeFail::At(ErrorCode::ArgMissing, i, false));
        }
        if nul > max_nsz {
            return Err(DecodeFail::At(ErrorCode::ArgTooLong, i, false));
        }
        names.push((at, nul));
        at = nstart + nul + 1;
    }
    let vnsz = at;
    let mut seg = data[..vnsz].to_vec();
    for &(off, _) in &names {
        seg[off] = FATTR_NAMESPACE;
        seg[off + 1] = b'.';
    }

    let mut values = Vec::new();
    if max_vsz == 0 {
        if at != data.len() {
            return Err(DecodeFail::At(ErrorCode::BadPayload, numattr, false));
        }
        return Ok(Decoded { seg, names, values });
    }
    for i in 0..numattr {
        if at + 4 > data.len() {
            return Err(DecodeFail::At(ErrorCode::ArgInvalid, i, true));
        }
        let vsize = u32::from_be_bytes(data[at..at + 4].try_into().unwrap()) as usize;
        if vsize > max_vsz {
            return Err(DecodeFail::At(ErrorCode::ArgTooLong, i, true));
        }
        at += 4;
        if at + vsize > data.len() {
            return Err(DecodeFail::At(ErrorCode::ArgInvalid, i, true));
        }
        values.push(data[at..at + vsize].to_vec());
        at += vsize;
    }
    if at != data.len() {
        return Err(DecodeFail::At(ErrorCode::BadPayload, numattr, true));
    }
    Ok(Decoded { seg, names, values })
}

impl Session {
    pub(crate) async fn do_fattr(&mut self, req: &Request) -> XeqResult {
        let Operation::Fattr(args) = req.operation() else {
            unreachable!()
        };
        self.ctx.stats.bump(&self.ctx.stats.misc_cnt);
        let resp = self.resp(req.streamid());

        if self.ctx.config.usx_max_nsz == 0 {
            resp.send_error(ErrorCode::Unsupported, "fattr request is not supported")
                .await?;
            return Ok(Flow::Continue);
        }
        if args.subcode > FATTR_MAX_SC {
            resp.send_error(ErrorCode::ArgInvalid, "fattr subcode is invalid")
                .await?;
            return Ok(Flow::Continue);
        }
        let is_ro = args.subcode == FATTR_GET || args.subcode == FATTR_LIST;
        let dlen = req.dlen() as usize;
        if args.subcode != FATTR_LIST && dlen == 0 {
            resp.send_error(
                ErrorCode::ArgMissing,
                "Required arguments for fattr request not present",
            )
            .await?;
            return Ok(Flow::Continue);
        }

        // Handle or path addressing; a leading null byte selects the handle.
        let payload = self.payload(req.dlen()).to_vec();
        let (path, arg_at) = if dlen == 0 || payload[0] == 0 {
            let Some(file) = self.get_file(args.fhandle) else {
                resp.send_error(
                    ErrorCode::FileNotOpen,
                    "fattr does not refer to an open file",
                )
                .await?;
                return Ok(Flow::Continue);
            };
            if !is_ro && file.mode != crate::file::AccessMode::Write {
                resp.send_error(
                    ErrorCode::InvalidRequest,
                    "fattr request modifies a file open for reading",
                )
                .await?;
                return Ok(Flow::Continue);
            }
            (file.path.clone(), if dlen > 0 { 1 } else { 0 })
        } else {
            let etxt = if is_ro {
                "Inspecting file attributes"
            } else {
                "Modifying file attributes"
            };
            let nul = memchr::memchr(0, &payload).unwrap_or(payload.len());
            let Ok(raw) = std::str::from_utf8(&payload[..nul]) else {
                resp.send_error(ErrorCode::ArgInvalid, "path is not valid text")
                    .await?;
                return Ok(Flow::Continue);
            };
            if !rp_check(raw) {
                let msg = format!("{etxt} relative path '{raw}' is disallowed.");
                resp.send_error(ErrorCode::NotAuthorized, &msg).await?;
                return Ok(Flow::Continue);
            }
            (squash(raw), nul + 1)
        };

        let numattr = args.numattr as usize;
        let bad_count = (args.subcode == FATTR_LIST && numattr != 0)
            || (args.subcode != FATTR_LIST && (numattr == 0 || numattr > FATTR_MAX_VARS));
        if bad_count {
            resp.send_error(ErrorCode::ArgInvalid, "fattr numattr is invalid")
                .await?;
            return Ok(Flow::Continue);
        }
        debug!(
            "{} fattr sub={} n={} path={}",
            self.link.id(),
            args.subcode,
            numattr,
            path
        );

        if args.subcode == FATTR_LIST {
            return self
                .fattr_list(&resp, &path, args.options & FATTR_OPT_DATA != 0)
                .await;
        }

        let max_vsz = if args.subcode == FATTR_SET {
            self.ctx.config.usx_max_vsz
        } else {
            0
        };
        let arg_region = &payload[arg_at.min(payload.len())..];
        let mut decoded =
            match decode(arg_region, numattr, self.ctx.config.usx_max_nsz, max_vsz) {
                Ok(d) => d,
                Err(DecodeFail::At(code, index, verr)) => {
                    let msg = format!(
                        "{} processing fattr {} argument #{}",
                        code.name(),
                        if verr { "data" } else { "name" },
                        index + 1
                    );
                    resp.send_error(code, &msg).await?;
                    return Ok(Flow::Continue);
                }
            };

        let mut items: Vec<FaItem> = decoded
            .names
            .iter()
            .enumerate()
            .map(|(i, &(off, nlen))| FaItem {
                name: decoded.seg[off..off + 2 + nlen].to_vec(),
                value: decoded.values.get(i).cloned().unwrap_or_default(),
                rc: 0,
            })
            .collect();

        let fa_req = match args.subcode {
            FATTR_GET => FaRequest::Get,
            FATTR_DEL => FaRequest::Del,
            FATTR_SET => FaRequest::Set {
                new_only: args.options & FATTR_OPT_NEW != 0,
            },
            _ => unreachable!(),
        };
        if let Err(e) = self.ctx.fs.fattr(&path, fa_req, &mut items, &self.client).await {
            self.fs_error(&resp, &e).await?;
            return Ok(Flow::Continue);
        }

        // Per-attribute status goes back in the rewritten prefix holes,
        // preceded by the (n-errors, n-attrs) pair.
        let mut nerrs = 0u8;
        for (i, item) in items.iter().enumerate() {
            let (off, _) = decoded.names[i];
            if item.rc == 0 {
                decoded.seg[off] = 0;
                decoded.seg[off + 1] = 0;
            } else {
                nerrs += 1;
                let code: i32 = map_errno(item.rc).into();
                decoded.seg[off..off + 2].copy_from_slice(&(code as u16).to_be_bytes());
            }
        }
        let fa_rc = [nerrs, numattr as u8];

        let mut body = Vec::with_capacity(2 + decoded.seg.len());
        body.extend_from_slice(&fa_rc);
        body.extend_from_slice(&decoded.seg);
        if args.subcode == FATTR_GET {
            for item in &items {
                let vlen = if item.rc == 0 { item.value.len() } else { 0 };
                body.extend_from_slice(U32::new(vlen as u32).as_bytes());
                if vlen > 0 {
                    body.extend_from_slice(&item.value);
                }
            }
        }
        resp.send_ok(&body).await?;
        Ok(Flow::Continue)
    }

    async fn fattr_list(&mut self, resp: &Response, path: &str, with_values: bool) -> XeqResult {
        let mut items = Vec::new();
        if let Err(e) = self
            .ctx
            .fs
            .fattr(path, FaRequest::List { with_values }, &mut items, &self.client)
            .await
        {
            self.fs_error(resp, &e).await?;
            return Ok(Flow::Continue);
        }
        if items.is_empty() {
            resp.send_ok(&[]).await?;
            return Ok(Flow::Continue);
        }
        let mut body = Vec::new();
        for item in &items {
            body.extend_from_slice(&item.name);
            body.push(0);
            if with_values {
                body.extend_from_slice(U32::new(item.value.len() as u32).as_bytes());
                body.extend_from_slice(&item.value);
            }
        }
        resp.send_ok(&body).await?;
        Ok(Flow::Continue)
    }
}
