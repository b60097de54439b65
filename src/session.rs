//! Per-connection session and request dispatcher.
//!
//! A session begins when a link completes the protocol handshake and ends
//! when the link closes, the client ends the session, or an administrative
//! unbind cancels it. The session loop reads one 24-byte request header at a
//! time, stages the argument payload (writes stream theirs), enforces the
//! login/auth phase machine, and hands the request to its handler. A link is
//! never processed by two tasks at once; everything the handler suspends on
//! is an await in this loop.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use bitflags::bitflags;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use zerocopy::{FromBytes, IntoBytes};
use zerocopy::byteorder::big_endian::{U16, U32};

use crate::buffer::{Buffer, BufferPool};
use crate::channel::{Link, recv_exact};
use crate::config::Config;
use crate::file::{CountingFileLock, FileLock, FileTable};
use crate::fs::{ClientIdent, Filesystem, FsError, Security};
use crate::ll::reply::Response;
use crate::ll::request::{Request, RequestError};
use crate::ll::wire::{
    self, ClientHandshake, ErrorCode, HandshakeResponse, RequestCode, RequestHeader,
};
use crate::monitor::{Monitor, MonitorCtx};
use crate::stats::ServerStats;

bitflags! {
    /// Session phase word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct Status: u8 {
        const LOGGED_IN  = 0x01;
        const NEED_AUTH  = 0x02;
        const ADMIN      = 0x04;
        const BOUND_PATH = 0x08;
    }
}

/// What the dispatcher decides after a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    /// Graceful end of session (endsess or administrative).
    Terminate,
}

pub(crate) type XeqResult = io::Result<Flow>;

/// Cross-session handle registered at login, addressed by session id.
pub(crate) struct SessionHandle {
    pub cancel: watch::Sender<bool>,
    /// Links bound to this session for auxiliary data paths.
    pub bound: Arc<Mutex<Vec<Arc<Link>>>>,
}

pub(crate) struct ServerCtx {
    pub fs: Arc<dyn Filesystem>,
    pub security: Option<Arc<dyn Security>>,
    pub monitor: Option<Arc<dyn Monitor>>,
    pub locker: Arc<dyn FileLock>,
    pub pool: Arc<BufferPool>,
    pub config: Config,
    pub stats: ServerStats,
    pub sessions: Mutex<HashMap<[u8; 16], Arc<SessionHandle>>>,
    pub session_seq: AtomicU32,
}

/// The server: shared context plus the accept loop.
pub struct Server {
    ctx: Arc<ServerCtx>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("sessions", &self.ctx.sessions.lock().len())
            .field("config", &self.ctx.config)
            .finish()
    }
}

impl Server {
    pub fn new(fs: Arc<dyn Filesystem>) -> Server {
        Server::with_config(fs, Config::default())
    }

    pub fn with_config(fs: Arc<dyn Filesystem>, config: Config) -> Server {
        Server {
            ctx: Arc::new(ServerCtx {
                fs,
                security: None,
                monitor: None,
                locker: Arc::new(CountingFileLock::default()),
                pool: Arc::new(BufferPool::default()),
                config,
                stats: ServerStats::default(),
                sessions: Mutex::new(HashMap::new()),
                session_seq: AtomicU32::new(1),
            }),
        }
    }

    pub fn security(mut self, sec: Arc<dyn Security>) -> Server {
        Arc::get_mut(&mut self.ctx)
            .expect("configure the server before serving")
            .security = Some(sec);
        self
    }

    pub fn monitor(mut self, mon: Arc<dyn Monitor>) -> Server {
        Arc::get_mut(&mut self.ctx)
            .expect("configure the server before serving")
            .monitor = Some(mon);
        self
    }

    pub fn locker(mut self, locker: Arc<dyn FileLock>) -> Server {
        Arc::get_mut(&mut self.ctx)
            .expect("configure the server before serving")
            .locker = locker;
        self
    }

    /// Accept and serve connections until the listener fails.
    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let ctx = Arc::clone(&self.ctx);
            tokio::spawn(async move {
                if let Err(e) = run_connection(ctx, stream, peer.to_string()).await {
                    debug!("connection {peer} ended: {e}");
                }
            });
        }
    }

    /// Drive one already-accepted byte stream to completion. Test harnesses
    /// feed in-process duplex streams through here.
    pub async fn handle<S>(&self, stream: S, peer: String) -> io::Result<()>
    where
        S: AsyncRead + tokio::io::AsyncWrite + Send + Sync + Unpin + 'static,
    {
        run_connection(Arc::clone(&self.ctx), stream, peer).await
    }
}

async fn run_connection<S>(ctx: Arc<ServerCtx>, stream: S, peer: String) -> io::Result<()>
where
    S: AsyncRead + tokio::io::AsyncWrite + Send + Sync + Unpin + 'static,
{
    ctx.stats.bump(&ctx.stats.connections);
    let (reader, writer) = tokio::io::split(stream);
    let link = Link::new(Box::new(writer), peer);
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let mut session = Session {
        ctx,
        link,
        reader: Box::new(reader),
        status: Status::empty(),
        client: ClientIdent::default(),
        capver: 0,
        clientpv: 0,
        ftab: FileTable::new(),
        monitor: None,
        argp: None,
        sessid: [0u8; 16],
        bound: Arc::new(Mutex::new(Vec::new())),
        cancel: cancel_tx,
        cancel_rx,
        num_reads: 0,
        num_readv: 0,
        num_segsv: 0,
        num_writes: 0,
        tot_readp: 0,
        started: Instant::now(),
    };
    let result = session.run_inner().await;
    session.teardown(result.is_err()).await;
    result
}

pub(crate) struct Session {
    pub(crate) ctx: Arc<ServerCtx>,
    pub(crate) link: Arc<Link>,
    pub(crate) reader: Box<dyn AsyncRead + Send + Sync + Unpin>,
    pub(crate) status: Status,
    pub(crate) client: ClientIdent,
    pub(crate) capver: u8,
    pub(crate) clientpv: i32,
    pub(crate) ftab: FileTable,
    pub(crate) monitor: Option<MonitorCtx>,
    /// Staged argument payload, reused across requests.
    pub(crate) argp: Option<Buffer>,
    pub(crate) sessid: [u8; 16],
    pub(crate) bound: Arc<Mutex<Vec<Arc<Link>>>>,
    pub(crate) cancel: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
    pub(crate) num_reads: u64,
    pub(crate) num_readv: u64,
    pub(crate) num_segsv: u64,
    pub(crate) num_writes: u64,
    pub(crate) tot_readp: i64,
    pub(crate) started: Instant,
}

impl Session {
    /// A response bound to this link for the given stream id.
    pub(crate) fn resp(&self, sid: [u8; 2]) -> Response {
        Response::new(self.link.clone(), sid)
    }

    /// A response on the chosen data path. Path 0 is this link; others index
    /// links bound to this session.
    pub(crate) fn resp_on_path(&self, sid: [u8; 2], pathid: u8) -> (Arc<Link>, Response) {
        if pathid > 0 {
            let bound = self.bound.lock();
            if let Some(link) = bound.get(pathid as usize - 1) {
                return (Arc::clone(link), Response::new(link.clone(), sid));
            }
        }
        (Arc::clone(&self.link), self.resp(sid))
    }

    async fn run_inner(&mut self) -> io::Result<()> {
        self.handshake().await?;
        let mut hdr = [0u8; wire::REQUEST_HDR_LEN];
        loop {
            // Idle until the next request header or an administrative end.
            // The clone is taken before the check so a cancel can never fall
            // between the two unobserved.
            let mut cancel = self.cancel_rx.clone();
            if *cancel.borrow() {
                info!("session {} administratively ended", self.link.id());
                return Ok(());
            }
            tokio::select! {
                r = self.reader.read_exact(&mut hdr) => {
                    match r {
                        Ok(_) => {}
                        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                        Err(e) => return Err(e),
                    }
                }
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        info!("session {} administratively ended", self.link.id());
                        return Ok(());
                    }
                    continue;
                }
            }

            let raw = RequestHeader::read_from_bytes(&hdr).unwrap();
            let sid = raw.streamid;
            let reqid = raw.requestid.get();
            let dlen = raw.dlen.get();

            if dlen < 0 {
                self.resp(sid)
                    .send_error(ErrorCode::ArgInvalid, "Invalid request data length")
                    .await?;
                return Err(protocol_violation("request data length error"));
            }

            // Stage the payload now unless the request streams it itself.
            let is_stream = reqid == u16::from(RequestCode::Write)
                || reqid == u16::from(RequestCode::PgWrite);
            if !is_stream && dlen > 0 {
                self.stage_payload(sid, dlen as usize).await?;
            }

            let req = match Request::parse(&hdr) {
                Ok(req) => req,
                Err(RequestError::UnknownOpcode(code)) => {
                    debug!("unknown request code {code} on {}", self.link.id());
                    if is_stream || !self.status.contains(Status::LOGGED_IN) {
                        self.resp(sid)
                            .send_error(ErrorCode::InvalidRequest, "Invalid request code")
                            .await?;
                        return Err(protocol_violation("invalid request code"));
                    }
                    self.resp(sid)
                        .send_error(ErrorCode::InvalidRequest, "Invalid request code")
                        .await?;
                    continue;
                }
                Err(e) => {
                    self.resp(sid)
                        .send_error(ErrorCode::ArgInvalid, &e.to_string())
                        .await?;
                    return Err(protocol_violation("malformed request header"));
                }
            };

            debug!("{} req={}", self.link.id(), req);
            match self.dispatch(&req).await? {
                Flow::Continue => {}
                Flow::Terminate => return Ok(()),
            }
        }
    }

    /// Read the argument payload into the staging buffer and terminate it.
    async fn stage_payload(&mut self, sid: [u8; 2], dlen: usize) -> io::Result<()> {
        let need = dlen + 1;
        if need > self.ctx.pool.max_size() {
            self.resp(sid)
                .send_error(ErrorCode::ArgTooLong, "Request argument is too long")
                .await?;
            return Err(protocol_violation("oversized request argument"));
        }
        if self.argp.as_ref().is_none_or(|b| b.size() < need) {
            if let Some(old) = self.argp.take() {
                self.ctx.pool.release(old);
            }
            match self.ctx.pool.obtain(need) {
                Some(buf) => self.argp = Some(buf),
                None => {
                    self.resp(sid)
                        .send_error(ErrorCode::NoMemory, "Insufficient memory for request")
                        .await?;
                    return Err(protocol_violation("request argument buffer unavailable"));
                }
            }
        }
        let buf = self.argp.as_mut().unwrap();
        let wait = self.ctx.config.read_wait;
        recv_exact(&mut self.reader, &mut buf.as_mut_slice()[..dlen], wait).await?;
        buf.as_mut_slice()[dlen] = 0;
        Ok(())
    }

    /// The staged payload of the current request.
    pub(crate) fn payload(&self, dlen: i32) -> &[u8] {
        match self.argp.as_ref() {
            Some(buf) if dlen > 0 => &buf.as_slice()[..dlen as usize],
            _ => &[],
        }
    }

    async fn handshake(&mut self) -> io::Result<()> {
        let mut buf = [0u8; wire::HANDSHAKE_LEN];
        recv_exact(&mut self.reader, &mut buf, self.ctx.config.hail_wait)
            .await
            .map_err(|_| protocol_violation("handshake not received"))?;
        let hs = ClientHandshake::read_from_bytes(&buf).unwrap();
        if hs.first.get() != 0
            || hs.second.get() != 0
            || hs.third.get() != 0
            || hs.fourth.get() != wire::HANDSHAKE_FOURTH
            || hs.fifth.get() != wire::HANDSHAKE_FIFTH
        {
            return Err(protocol_violation("handshake mismatch"));
        }
        let styp = if self.ctx.config.redirector {
            wire::ROLE_LBAL_SERVER
        } else {
            wire::ROLE_DATA_SERVER
        };
        let resp = HandshakeResponse {
            streamid: U16::new(0),
            status: U16::new(0),
            rlen: U32::new(8),
            pval: U32::new(wire::PROTOCOL_VERSION),
            styp: U32::new(styp),
        };
        self.link
            .send(&[resp.as_bytes()])
            .await
            .map_err(|_| protocol_violation("handshake response failed"))
    }

    /// Route one request through the phase machine to its handler.
    async fn dispatch(&mut self, req: &Request) -> XeqResult {
        let resp = self.resp(req.streamid());

        // A bound path carries no user requests of its own.
        if self.status.contains(Status::BOUND_PATH) {
            resp.send_error(
                ErrorCode::InvalidRequest,
                "Invalid request; link is a bound path",
            )
            .await?;
            return Ok(Flow::Continue);
        }

        // Before login only these three are admissible.
        if !self.status.contains(Status::LOGGED_IN) {
            return match req.code() {
                RequestCode::Login => self.do_login(req).await,
                RequestCode::Protocol => self.do_protocol(req).await,
                RequestCode::Bind => self.do_bind(req).await,
                _ => {
                    resp.send_error(
                        ErrorCode::InvalidRequest,
                        "Invalid request; user not logged in",
                    )
                    .await?;
                    Err(protocol_violation("request before login"))
                }
            };
        }

        // These never require authentication.
        match req.code() {
            RequestCode::Protocol => return self.do_protocol(req).await,
            RequestCode::Ping => return self.do_ping(req).await,
            _ => {}
        }

        if self.status.contains(Status::NEED_AUTH) {
            if req.code() == RequestCode::Auth {
                return self.do_auth(req).await;
            }
            resp.send_error(
                ErrorCode::InvalidRequest,
                "Invalid request; user not authenticated",
            )
            .await?;
            return Err(protocol_violation("request before auth"));
        }

        match req.code() {
            RequestCode::Auth => self.do_auth(req).await,
            RequestCode::Read => self.do_read(req).await,
            RequestCode::ReadV => self.do_readv(req).await,
            RequestCode::Write => self.do_write(req).await,
            RequestCode::PgRead => self.do_pgread(req).await,
            RequestCode::PgWrite => self.do_pgwrite(req).await,
            RequestCode::Sync => self.do_sync(req).await,
            RequestCode::Close => self.do_close(req).await,
            RequestCode::Truncate => self.do_truncate(req).await,
            RequestCode::ChkPoint => self.do_chkpoint(req).await,
            RequestCode::Fattr => self.do_fattr(req).await,
            RequestCode::WriteV => self.do_writev(req).await,
            RequestCode::Stat => self.do_stat(req).await,
            RequestCode::Statx => self.do_statx(req).await,
            RequestCode::Endsess => self.do_endsess(req).await,
            RequestCode::Open => self.do_open(req).await,
            RequestCode::Dirlist => self.do_dirlist(req).await,
            RequestCode::Mkdir => self.do_mkdir(req).await,
            RequestCode::Mv => self.do_mv(req).await,
            RequestCode::Chmod => self.do_chmod(req).await,
            RequestCode::Rm => self.do_rm(req).await,
            RequestCode::Rmdir => self.do_rmdir(req).await,
            RequestCode::Set => self.do_set(req).await,
            RequestCode::Query => self.do_query(req).await,
            RequestCode::Bind => {
                resp.send_error(ErrorCode::InvalidRequest, "bind after login is invalid")
                    .await?;
                Ok(Flow::Continue)
            }
            RequestCode::Protocol | RequestCode::Ping => {
                unreachable!("Protocol and Ping are handled earlier in dispatch")
            }
            RequestCode::Locate
            | RequestCode::Prepare
            | RequestCode::Gpfile
            | RequestCode::Sigver
            | RequestCode::Login => {
                self.ctx.stats.bump(&self.ctx.stats.misc_cnt);
                if req.code() == RequestCode::Login {
                    resp.send_error(
                        ErrorCode::InvalidRequest,
                        "duplicate login; already logged in",
                    )
                    .await?;
                } else {
                    let msg = format!("{} request is not supported", req.code().name());
                    resp.send_error(ErrorCode::Unsupported, &msg).await?;
                }
                Ok(Flow::Continue)
            }
        }
    }

    /// Report a backend outcome to the client.
    pub(crate) async fn fs_error(&self, resp: &Response, e: &FsError) -> io::Result<()> {
        match e {
            FsError::Io { msg, .. } => {
                self.ctx.stats.bump(&self.ctx.stats.error_cnt);
                resp.send_error(e.code(), msg).await
            }
            FsError::Redirect { host, port } => {
                self.ctx.stats.bump(&self.ctx.stats.redir_cnt);
                debug!("redirecting {} to {host}:{port}", self.link.id());
                resp.send_redirect(*port, host).await
            }
            FsError::Stall { seconds, msg } => {
                if *seconds > self.ctx.config.wait_ceiling {
                    self.ctx.stats.bump(&self.ctx.stats.error_cnt);
                    resp.send_error(ErrorCode::Cancelled, "backend wait limit exceeded")
                        .await
                } else {
                    self.ctx.stats.bump(&self.ctx.stats.stall_cnt);
                    resp.send_wait(*seconds, msg).await
                }
            }
        }
    }

    /// Tear the session down: cancel async work, wait for quiescence, close
    /// every still-open file (emitting monitor close events), and cut the
    /// disconnect record.
    async fn teardown(&mut self, forced: bool) {
        let _ = self.cancel.send(true);
        self.link.set_dead();
        self.link.serialize().await;

        if let Some(buf) = self.argp.take() {
            self.ctx.pool.release(buf);
        }

        if self.status.contains(Status::LOGGED_IN) && !self.status.contains(Status::BOUND_PATH) {
            self.ctx.fs.disc(&self.client).await;
        }

        for file in self.ftab.recycle() {
            if let Some(mon) = &self.monitor {
                if mon.mon_file {
                    mon.agent.close(
                        file.mon_id.load(Ordering::Relaxed) as u32,
                        file.stats.total_read(),
                        file.stats.total_written(),
                    );
                }
            }
            self.ctx.locker.unlock(&file.key, file.mode);
            if let Err(e) = file.fsfile.close().await {
                warn!("close of {} failed during recycle: {e}", file.path);
            }
        }

        self.ctx.sessions.lock().remove(&self.sessid);

        self.ctx.stats.add(&self.ctx.stats.read_cnt, self.num_reads);
        self.ctx.stats.add(&self.ctx.stats.rvec_cnt, self.num_readv);
        self.ctx.stats.add(&self.ctx.stats.rseg_cnt, self.num_segsv);
        self.ctx
            .stats
            .add(&self.ctx.stats.write_cnt, self.num_writes);

        if let Some(mon) = &self.monitor {
            mon.agent
                .disc(mon.did, self.started.elapsed().as_secs(), forced);
        }
        let what = if self.status.contains(Status::BOUND_PATH) {
            "unbind"
        } else {
            "disc"
        };
        info!(
            "{} {} after {}s (rd={} rv={}/{} wr={} prb={})",
            self.link.id(),
            what,
            self.started.elapsed().as_secs(),
            self.num_reads,
            self.num_readv,
            self.num_segsv,
            self.num_writes,
            self.tot_readp
        );
    }
}

pub(crate) fn protocol_violation(msg: &str) -> io::Error {
    error!("protocol violation: {msg}");
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}
