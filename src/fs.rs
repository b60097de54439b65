//! Storage, security and identity capabilities.
//!
//! The server core never touches disks or credentials directly; everything
//! goes through these traits. A backend reports failures as structured
//! [`FsError`] values: plain errors map through the errno table onto wire
//! error codes, while `Redirect` and `Stall` are control outcomes the
//! dispatcher turns into their own response kinds.

use async_trait::async_trait;
use thiserror::Error;

use crate::ll::errno::map_errno;
use crate::ll::wire::{ErrorCode, OpenFlags};

/// Structured backend result carried to the response framer.
#[derive(Debug, Clone, Error)]
pub enum FsError {
    /// An ordinary failure; `errno` selects the wire error code.
    #[error("{msg}")]
    Io { errno: i32, msg: String },
    /// The file lives elsewhere; client should retry against host:port.
    #[error("redirect to {host}:{port}")]
    Redirect { host: String, port: i32 },
    /// The backend needs time; client should retry after `seconds`.
    #[error("wait {seconds}s")]
    Stall { seconds: i32, msg: String },
}

impl FsError {
    pub fn io(errno: i32, msg: impl Into<String>) -> FsError {
        FsError::Io {
            errno,
            msg: msg.into(),
        }
    }

    pub fn not_found(path: &str) -> FsError {
        FsError::io(libc::ENOENT, format!("{path} not found"))
    }

    pub fn not_supported(what: &str) -> FsError {
        FsError::io(libc::ENOSYS, format!("{what} not supported"))
    }

    /// The wire error code for an `Io` failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            FsError::Io { errno, .. } => map_errno(*errno),
            FsError::Redirect { .. } => ErrorCode::ServerError,
            FsError::Stall { .. } => ErrorCode::ServerError,
        }
    }
}

pub type FsResult<T> = Result<T, FsError>;

/// Who is asking. Filled in at login and enriched by authentication.
#[derive(Debug, Clone, Default)]
pub struct ClientIdent {
    pub name: String,
    pub host: String,
    pub pid: i32,
    pub prot: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Dir,
    Other,
}

/// Result of a stat call, enough to synthesize the wire flag word.
#[derive(Debug, Clone, Copy)]
pub struct FsStat {
    pub dev: u64,
    pub ino: u64,
    pub size: i64,
    pub mtime: i64,
    pub kind: FileKind,
    pub exec: bool,
    pub readable: bool,
    pub writable: bool,
}

impl FsStat {
    /// The device+inode pair packed the way stat replies carry it.
    pub fn id(&self) -> i64 {
        ((self.dev as i64) << 32) | (self.ino as i64 & 0xffff_ffff)
    }
}

/// Checkpoint actions a backend file must support.
#[derive(Debug)]
pub enum CkpAct<'a> {
    /// Open a slot; fails if one is already open.
    Create,
    /// Commit: discard the pre-image, keeping effects.
    Delete,
    /// Report `(max-size, used-size)` of the current slot.
    Query,
    /// Roll back to the pre-image and close the slot.
    Restore,
    /// Record pre-images for the byte ranges about to be written.
    Write { ranges: &'a [(i64, i32)] },
    /// Record a pre-image for a truncation to `size`.
    Trunc { size: i64 },
}

/// Checkpoint slot occupancy, returned by `Query`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CkpInfo {
    pub max_size: u32,
    pub used_size: u32,
}

/// One per-attribute element of a fattr request/response.
#[derive(Debug, Clone)]
pub struct FaItem {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
    /// errno per attribute; 0 on success.
    pub rc: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaRequest {
    Get,
    /// `new_only` refuses to replace an existing attribute.
    Set { new_only: bool },
    Del,
    /// `with_values` returns values alongside names.
    List { with_values: bool },
}

/// An opened backend object.
#[async_trait]
pub trait FsFile: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset`. A short count is the sole
    /// EOF indicator.
    async fn read(&self, offset: i64, buf: &mut [u8]) -> FsResult<usize>;

    /// Prefetch hint; delivers no data.
    async fn preread(&self, _offset: i64, _len: i32) -> FsResult<()> {
        Ok(())
    }

    async fn write(&self, offset: i64, data: &[u8]) -> FsResult<usize>;

    /// Page-oriented read. `verify` asks the backend to recompute any
    /// cached integrity state rather than trust it.
    async fn pgread(&self, offset: i64, buf: &mut [u8], verify: bool) -> FsResult<usize>;

    async fn pgwrite(&self, offset: i64, data: &[u8]) -> FsResult<usize>;

    async fn sync(&self) -> FsResult<()>;

    async fn truncate(&self, size: i64) -> FsResult<()>;

    async fn stat(&self) -> FsResult<FsStat>;

    /// Drive the per-file checkpoint slot.
    async fn checkpoint(&self, act: CkpAct<'_>) -> FsResult<CkpInfo>;

    async fn close(&self) -> FsResult<()>;
}

/// The storage backend.
#[async_trait]
pub trait Filesystem: Send + Sync + 'static {
    async fn open(
        &self,
        path: &str,
        flags: OpenFlags,
        mode: u32,
        client: &ClientIdent,
    ) -> FsResult<Box<dyn FsFile>>;

    async fn stat(&self, path: &str, client: &ClientIdent) -> FsResult<FsStat>;

    async fn chmod(&self, path: &str, mode: u32, client: &ClientIdent) -> FsResult<()>;

    async fn mkdir(&self, path: &str, mode: u32, mkpath: bool, client: &ClientIdent)
    -> FsResult<()>;

    async fn rename(&self, from: &str, to: &str, client: &ClientIdent) -> FsResult<()>;

    async fn remove(&self, path: &str, client: &ClientIdent) -> FsResult<()>;

    async fn rmdir(&self, path: &str, client: &ClientIdent) -> FsResult<()>;

    async fn dirlist(&self, path: &str, client: &ClientIdent) -> FsResult<Vec<String>>;

    async fn truncate(&self, path: &str, size: i64, client: &ClientIdent) -> FsResult<()>;

    /// Extended attribute operations against a path. Per-attribute failures
    /// land in each item's `rc`; a wholesale failure is the error return.
    async fn fattr(
        &self,
        path: &str,
        req: FaRequest,
        items: &mut Vec<FaItem>,
        client: &ClientIdent,
    ) -> FsResult<()>;

    /// Session disconnect notice.
    async fn disc(&self, _client: &ClientIdent) {}
}

/// Outcome of one authentication round.
#[derive(Debug)]
pub enum AuthOutcome {
    /// Identity established.
    Done,
    /// More rounds needed; send this challenge to the client.
    Continue(Vec<u8>),
}

/// Pluggable challenge/response authentication.
#[async_trait]
pub trait Security: Send + Sync + 'static {
    /// The security token handed out at login, if any.
    fn get_parms(&self, host: &str) -> Option<Vec<u8>>;

    async fn authenticate(&self, cred: &[u8], client: &mut ClientIdent) -> FsResult<AuthOutcome>;
}
