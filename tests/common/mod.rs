//! In-process protocol client used by the integration tests.

#![allow(dead_code)]

use std::io;
use std::sync::{Arc, Mutex};

use rootd::{Monitor, Server};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

pub const PAGE: usize = 4096;

/// Route server logs through the test harness when RUST_LOG is set.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// One framed server response.
#[derive(Debug)]
pub struct Reply {
    pub sid: [u8; 2],
    pub status: u16,
    pub body: Vec<u8>,
}

pub struct TestClient {
    rd: ReadHalf<DuplexStream>,
    wr: WriteHalf<DuplexStream>,
}

impl TestClient {
    /// Connect a duplex pipe to the server and return the driving task.
    pub fn connect(server: Arc<Server>) -> (TestClient, JoinHandle<io::Result<()>>) {
        let (client, srv) = tokio::io::duplex(1 << 20);
        let task = tokio::spawn(async move { server.handle(srv, "testclient".into()).await });
        let (rd, wr) = tokio::io::split(client);
        (TestClient { rd, wr }, task)
    }

    /// Perform the 20-byte handshake; returns (protocol version, role).
    pub async fn handshake(&mut self) -> (u32, u32) {
        let mut hs = Vec::new();
        for word in [0i32, 0, 0, 4, 2012] {
            hs.extend_from_slice(&word.to_be_bytes());
        }
        self.wr.write_all(&hs).await.unwrap();
        let mut buf = [0u8; 16];
        self.rd.read_exact(&mut buf).await.unwrap();
        let pval = u32::from_be_bytes(buf[8..12].try_into().unwrap());
        let styp = u32::from_be_bytes(buf[12..16].try_into().unwrap());
        (pval, styp)
    }

    /// Send one request header plus optional payload.
    pub async fn request(&mut self, sid: [u8; 2], code: u16, body: &[u8; 16], payload: &[u8]) {
        let mut hdr = Vec::with_capacity(24 + payload.len());
        hdr.extend_from_slice(&sid);
        hdr.extend_from_slice(&code.to_be_bytes());
        hdr.extend_from_slice(body);
        hdr.extend_from_slice(&(payload.len() as i32).to_be_bytes());
        hdr.extend_from_slice(payload);
        self.wr.write_all(&hdr).await.unwrap();
    }

    /// Send a request whose payload length differs from the bytes attached
    /// (write-style streaming is driven by the caller).
    pub async fn request_hdr(&mut self, sid: [u8; 2], code: u16, body: &[u8; 16], dlen: i32) {
        let mut hdr = Vec::with_capacity(24);
        hdr.extend_from_slice(&sid);
        hdr.extend_from_slice(&code.to_be_bytes());
        hdr.extend_from_slice(body);
        hdr.extend_from_slice(&dlen.to_be_bytes());
        self.wr.write_all(&hdr).await.unwrap();
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.wr.write_all(bytes).await.unwrap();
    }

    /// Read one framed response.
    pub async fn response(&mut self) -> Reply {
        let mut hdr = [0u8; 8];
        self.rd.read_exact(&mut hdr).await.unwrap();
        let sid = [hdr[0], hdr[1]];
        let status = u16::from_be_bytes([hdr[2], hdr[3]]);
        let dlen = i32::from_be_bytes([hdr[4], hdr[5], hdr[6], hdr[7]]);
        assert!(dlen >= 0, "negative response length");
        let mut body = vec![0u8; dlen as usize];
        self.rd.read_exact(&mut body).await.unwrap();
        Reply { sid, status, body }
    }

    /// Collect partials until the terminal response; returns the terminal
    /// status and the concatenated data.
    pub async fn collect(&mut self, sid: [u8; 2]) -> (u16, Vec<u8>) {
        let mut data = Vec::new();
        loop {
            let reply = self.response().await;
            assert_eq!(reply.sid, sid, "response crossed stream ids");
            data.extend_from_slice(&reply.body);
            if reply.status != 4000 {
                return (reply.status, data);
            }
        }
    }

    pub async fn login(&mut self, user: &str, pid: i32) {
        let mut body = [0u8; 16];
        body[0..4].copy_from_slice(&pid.to_be_bytes());
        let name = user.as_bytes();
        body[4..4 + name.len().min(8)].copy_from_slice(&name[..name.len().min(8)]);
        body[14] = 4; // capver
        self.request([0, 1], 3007, &body, &[]).await;
        let reply = self.response().await;
        assert_eq!(reply.status, 0, "login failed");
    }

    pub async fn open(&mut self, sid: [u8; 2], path: &str, options: u16) -> [u8; 4] {
        let mut body = [0u8; 16];
        body[2..4].copy_from_slice(&options.to_be_bytes());
        self.request(sid, 3010, &body, path.as_bytes()).await;
        let reply = self.response().await;
        assert_eq!(reply.status, 0, "open of {path} failed: {:?}", reply.body);
        reply.body[0..4].try_into().unwrap()
    }

    pub async fn close(&mut self, sid: [u8; 2], fh: [u8; 4]) -> Reply {
        let mut body = [0u8; 16];
        body[0..4].copy_from_slice(&fh);
        self.request(sid, 3003, &body, &[]).await;
        self.response().await
    }

    pub async fn read(&mut self, sid: [u8; 2], fh: [u8; 4], offset: i64, rlen: i32) -> (u16, Vec<u8>) {
        let body = rw_body(fh, offset, rlen);
        self.request(sid, 3013, &body, &[]).await;
        self.collect(sid).await
    }

    pub async fn write(&mut self, sid: [u8; 2], fh: [u8; 4], offset: i64, data: &[u8]) -> Reply {
        let mut body = [0u8; 16];
        body[0..4].copy_from_slice(&fh);
        body[4..12].copy_from_slice(&offset.to_be_bytes());
        self.request_hdr(sid, 3019, &body, data.len() as i32).await;
        self.send_raw(data).await;
        self.response().await
    }

    pub async fn pgread(
        &mut self,
        sid: [u8; 2],
        fh: [u8; 4],
        offset: i64,
        rlen: i32,
        flags: u8,
    ) -> Vec<Reply> {
        let body = rw_body(fh, offset, rlen);
        let payload = [0u8, flags];
        self.request(sid, 3030, &body, &payload).await;
        let mut out = Vec::new();
        loop {
            let reply = self.response().await;
            let done = reply.status != 4000;
            out.push(reply);
            if done {
                return out;
            }
        }
    }

    /// Build and send a pgwrite; `pages` carries (crc, data) pairs already.
    pub async fn pgwrite(&mut self, sid: [u8; 2], fh: [u8; 4], offset: i64, payload: &[u8]) -> Reply {
        let mut body = [0u8; 16];
        body[0..4].copy_from_slice(&fh);
        body[4..12].copy_from_slice(&offset.to_be_bytes());
        self.request_hdr(sid, 3026, &body, payload.len() as i32).await;
        self.send_raw(payload).await;
        self.response().await
    }

    pub async fn stat_path(&mut self, sid: [u8; 2], path: &str) -> Reply {
        let body = [0u8; 16];
        self.request(sid, 3017, &body, path.as_bytes()).await;
        self.response().await
    }

    pub async fn chkpoint(&mut self, sid: [u8; 2], fh: [u8; 4], opcode: u8) -> Reply {
        let mut body = [0u8; 16];
        body[0..4].copy_from_slice(&fh);
        body[15] = opcode;
        self.request(sid, 3012, &body, &[]).await;
        self.response().await
    }

    /// chkpoint-xeq wrapping an inner request header; inner payload bytes,
    /// if any, must be streamed by the caller afterwards.
    pub async fn chkpoint_xeq(
        &mut self,
        sid: [u8; 2],
        fh: [u8; 4],
        inner_code: u16,
        inner_body: &[u8; 16],
        inner_dlen: i32,
    ) {
        let mut body = [0u8; 16];
        body[0..4].copy_from_slice(&fh);
        body[15] = 4; // xeq
        let mut inner = Vec::with_capacity(24);
        inner.extend_from_slice(&sid);
        inner.extend_from_slice(&inner_code.to_be_bytes());
        inner.extend_from_slice(inner_body);
        inner.extend_from_slice(&inner_dlen.to_be_bytes());
        self.request(sid, 3012, &body, &inner).await;
    }

    /// Drop the connection without ceremony.
    pub fn hangup(self) {}
}

pub fn rw_body(fh: [u8; 4], offset: i64, rlen: i32) -> [u8; 16] {
    let mut body = [0u8; 16];
    body[0..4].copy_from_slice(&fh);
    body[4..12].copy_from_slice(&offset.to_be_bytes());
    body[12..16].copy_from_slice(&rlen.to_be_bytes());
    body
}

/// A (crc, page) unit stream for a pgwrite of `data` starting at an aligned
/// offset; `corrupt` offsets get a deliberately wrong checksum.
pub fn pgw_payload(offset: i64, data: &[u8], corrupt: &[i64]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut at = offset;
    for chunk in data.chunks(PAGE) {
        let mut crc = rootd::crc32c_of(chunk);
        if corrupt.contains(&at) {
            crc ^= 0xdead_beef;
        }
        out.extend_from_slice(&crc.to_be_bytes());
        out.extend_from_slice(chunk);
        at += chunk.len() as i64;
    }
    out
}

/// Monitoring sink that records everything it hears.
#[derive(Debug, Default)]
pub struct RecordingMonitor {
    pub opens: Mutex<Vec<(u32, i64)>>,
    pub closes: Mutex<Vec<(u32, i64, i64)>>,
    pub discs: Mutex<Vec<(u32, u64, bool)>>,
    pub ios: Mutex<Vec<(u32, i32, i64)>>,
    next_id: Mutex<u32>,
}

impl Monitor for RecordingMonitor {
    fn map_user(&self, _uname: &str) -> u32 {
        let mut id = self.next_id.lock().unwrap();
        *id += 1;
        *id
    }

    fn map_path(&self, _uname: &str, _path: &str) -> u32 {
        let mut id = self.next_id.lock().unwrap();
        *id += 1;
        *id
    }

    fn open(&self, dictid: u32, fsize: i64) {
        self.opens.lock().unwrap().push((dictid, fsize));
    }

    fn close(&self, dictid: u32, bytes_read: i64, bytes_written: i64) {
        self.closes.lock().unwrap().push((dictid, bytes_read, bytes_written));
    }

    fn io(&self, dictid: u32, len: i32, offset: i64) {
        self.ios.lock().unwrap().push((dictid, len, offset));
    }

    fn disc(&self, dictid: u32, duration_secs: u64, forced: bool) {
        self.discs.lock().unwrap().push((dictid, duration_secs, forced));
    }
}
