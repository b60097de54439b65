//! XRootD wire protocol data server core.
//!
//! This crate implements the server side of the XRootD binary RPC protocol:
//! the per-connection protocol state machine and dispatcher, the async I/O
//! pipeline (including page-oriented reads and writes with per-page CRC32C),
//! the per-session file-handle table, and the checkpoint substrate that
//! brackets mutating operations. Storage, authentication and monitoring are
//! capabilities supplied by the embedding application; see [`Filesystem`],
//! [`Security`] and [`Monitor`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use rootd::{MemFs, Server};
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let fs = MemFs::new();
//!     fs.insert("/hello", b"hello world\n");
//!     let server = Server::new(fs);
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:1094").await?;
//!     server.serve(listener).await
//! }
//! ```

#![warn(missing_debug_implementations, rust_2018_idioms, unreachable_pub)]

pub use crate::buffer::{Buffer, BufferPool};
pub use crate::channel::Link;
pub use crate::config::Config;
pub use crate::file::{
    AccessMode, CountingFileLock, File, FileLock, FileStats, FileTable, LockDenied,
};
pub use crate::fs::{
    AuthOutcome, CkpAct, CkpInfo, ClientIdent, FaItem, FaRequest, FileKind, Filesystem, FsError,
    FsFile, FsResult, FsStat, Security,
};
pub use crate::ll::errno::{map_errno, to_errno};
pub use crate::ll::reply::{ReplySender, Response};
pub use crate::ll::request::{Operation, Request, RequestError};
pub use crate::ll::wire::{ErrorCode, OpenFlags, OpenMode, RequestCode, ResponseStatus, StatFlags};
pub use crate::memfs::MemFs;
pub use crate::monitor::{Monitor, MonitorCtx};
pub use crate::page::{PgwBook, crc32c_of};
pub use crate::session::Server;
pub use crate::stats::ServerStats;

mod aio;
mod buffer;
mod channel;
mod config;
mod file;
mod fs;
pub mod ll;
mod memfs;
mod monitor;
mod page;
mod session;
mod stats;
mod xeq;
mod xeq_chkpnt;
mod xeq_fattr;
mod xeq_pgrw;
