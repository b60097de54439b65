//! Response framing.
//!
//! A [`Response`] is bound to the stream id of the request that triggered it
//! and to the link the reply must travel on. Every send prepends the 8-byte
//! response header; the sender's per-link lock keeps frames whole, and this
//! type never reorders its own sends.

use std::io;
use std::sync::Arc;

use smallvec::SmallVec;
use zerocopy::IntoBytes;
use zerocopy::byteorder::big_endian::{I32, U16};

use super::wire::{ErrorCode, ResponseHeader, ResponseStatus};

/// Sink for framed replies. Implemented by `Link`; test harnesses provide
/// their own.
#[async_trait::async_trait]
pub trait ReplySender: Send + Sync {
    /// Send all byte runs as one frame.
    async fn send(&self, data: &[&[u8]]) -> io::Result<()>;

    /// Note a terminal transport failure.
    fn mark_failed(&self) {}
}

/// A reply builder carrying the captured stream id.
#[derive(Clone)]
pub struct Response {
    sid: [u8; 2],
    sender: Arc<dyn ReplySender>,
}

impl Response {
    pub fn new(sender: Arc<dyn ReplySender>, sid: [u8; 2]) -> Response {
        Response { sid, sender }
    }

    /// Rebind to another request's stream id on the same link.
    pub fn with_sid(&self, sid: [u8; 2]) -> Response {
        Response {
            sid,
            sender: Arc::clone(&self.sender),
        }
    }

    pub fn sid(&self) -> [u8; 2] {
        self.sid
    }

    fn header(&self, status: ResponseStatus, dlen: usize) -> ResponseHeader {
        ResponseHeader {
            streamid: self.sid,
            status: U16::new(status.into()),
            dlen: I32::new(dlen as i32),
        }
    }

    /// Scatter-send one framed response.
    pub async fn send_iov(&self, status: ResponseStatus, bufs: &[&[u8]]) -> io::Result<()> {
        let dlen = bufs.iter().map(|b| b.len()).sum();
        let header = self.header(status, dlen);
        let mut v: SmallVec<[&[u8]; 8]> = SmallVec::with_capacity(bufs.len() + 1);
        v.push(header.as_bytes());
        v.extend_from_slice(bufs);
        self.sender.send(&v).await
    }

    /// Final `ok` with an opaque body (possibly empty).
    pub async fn send_ok(&self, body: &[u8]) -> io::Result<()> {
        self.send_iov(ResponseStatus::Ok, &[body]).await
    }

    /// Partial result; more responses to this stream id will follow.
    pub async fn send_partial(&self, body: &[u8]) -> io::Result<()> {
        self.send_iov(ResponseStatus::OkSoFar, &[body]).await
    }

    /// Terminal error: 4-byte code plus a null-terminated message.
    pub async fn send_error(&self, code: ErrorCode, msg: &str) -> io::Result<()> {
        let ecode = I32::new(code.into());
        self.send_iov(
            ResponseStatus::Error,
            &[ecode.as_bytes(), msg.as_bytes(), b"\0"],
        )
        .await
    }

    /// Redirect the client: 4-byte port plus host string.
    pub async fn send_redirect(&self, port: i32, host: &str) -> io::Result<()> {
        let port = I32::new(port);
        self.send_iov(ResponseStatus::Redirect, &[port.as_bytes(), host.as_bytes()])
            .await
    }

    /// Ask the client to wait before retrying.
    pub async fn send_wait(&self, seconds: i32, msg: &str) -> io::Result<()> {
        let secs = I32::new(seconds);
        self.send_iov(ResponseStatus::Wait, &[secs.as_bytes(), msg.as_bytes()])
            .await
    }

    /// Tell the client the response will arrive later, unsolicited.
    pub async fn send_waitresp(&self, seconds: i32) -> io::Result<()> {
        let secs = I32::new(seconds);
        self.send_iov(ResponseStatus::WaitResp, &[secs.as_bytes()])
            .await
    }

    /// Continue an authentication exchange.
    pub async fn send_authmore(&self, challenge: &[u8]) -> io::Result<()> {
        self.send_iov(ResponseStatus::AuthMore, &[challenge]).await
    }

    /// Asynchronous attention event: 4-byte action code plus parameters.
    pub async fn send_attn(&self, actnum: i32, parms: &[u8]) -> io::Result<()> {
        let act = I32::new(actnum);
        self.send_iov(ResponseStatus::Attn, &[act.as_bytes(), parms])
            .await
    }

    pub(crate) fn mark_failed(&self) {
        self.sender.mark_failed();
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Response(sid={:02x}{:02x})", self.sid[0], self.sid[1])
    }
}
