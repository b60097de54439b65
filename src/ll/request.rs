//! Low-level client request.
//!
//! A request is the fixed 24-byte header read off a link, possibly followed
//! by an argument payload. The header's 16 body bytes are re-interpreted per
//! request code; [`Request::operation`] surfaces that as a tagged variant.

use std::{error, fmt};

use zerocopy::FromBytes;

use super::wire::{
    self, BindArgs, ChkPointArgs, ChmodArgs, CloseArgs, DirlistArgs, EndsessArgs, FattrArgs,
    LoginArgs, MkdirArgs, MvArgs, OpenArgs, PgReadArgs, PgWriteArgs, ProtocolArgs, QueryArgs,
    ReadArgs, ReadVArgs, RequestCode, RequestHeader, StatArgs, SyncArgs, TruncateArgs, WriteArgs,
    WriteVArgs,
};

/// Error that may occur while reading and parsing a request header.
#[derive(Debug, PartialEq)]
pub enum RequestError {
    /// Not enough data for the fixed header (short read).
    ShortHeader(usize),
    /// The client sent a request code outside the valid range.
    UnknownOpcode(u16),
    /// The payload length field is negative.
    NegativeLength(i32),
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::ShortHeader(len) => write!(
                f,
                "Short read of request header ({} < {})",
                len,
                wire::REQUEST_HDR_LEN
            ),
            RequestError::UnknownOpcode(code) => write!(f, "Unknown request code ({code})"),
            RequestError::NegativeLength(len) => {
                write!(f, "Negative request data length ({len})")
            }
        }
    }
}

impl error::Error for RequestError {}

/// A parsed request header. The argument payload, if any, is read separately
/// by the dispatcher and handed to the handler alongside this.
#[derive(Debug, Clone, Copy)]
pub struct Request {
    header: RequestHeader,
    code: RequestCode,
}

/// The request decoded into its per-opcode argument view.
#[derive(Debug, Clone, Copy)]
pub enum Operation {
    Auth,
    Query(QueryArgs),
    Chmod(ChmodArgs),
    Close(CloseArgs),
    Dirlist(DirlistArgs),
    Gpfile,
    Protocol(ProtocolArgs),
    Login(LoginArgs),
    Mkdir(MkdirArgs),
    Mv(MvArgs),
    Open(OpenArgs),
    Ping,
    ChkPoint(ChkPointArgs),
    Read(ReadArgs),
    Rm,
    Rmdir,
    Sync(SyncArgs),
    Stat(StatArgs),
    Set,
    Write(WriteArgs),
    Fattr(FattrArgs),
    Prepare,
    Statx,
    Endsess(EndsessArgs),
    Bind(BindArgs),
    ReadV(ReadVArgs),
    PgWrite(PgWriteArgs),
    Locate,
    Truncate(TruncateArgs),
    Sigver,
    PgRead(PgReadArgs),
    WriteV(WriteVArgs),
}

impl Request {
    /// Parse a raw 24-byte header. The payload length must be non-negative;
    /// anything else means we cannot know how much data follows.
    pub fn parse(data: &[u8]) -> Result<Request, RequestError> {
        let header = RequestHeader::read_from_bytes(
            data.get(..wire::REQUEST_HDR_LEN)
                .ok_or(RequestError::ShortHeader(data.len()))?,
        )
        .map_err(|_| RequestError::ShortHeader(data.len()))?;
        let code = RequestCode::try_from(header.requestid.get())
            .map_err(|_| RequestError::UnknownOpcode(header.requestid.get()))?;
        if header.dlen.get() < 0 {
            return Err(RequestError::NegativeLength(header.dlen.get()));
        }
        Ok(Request { header, code })
    }

    /// Build a request from an already-validated header. Used by the
    /// checkpoint-xeq path, which re-enters with an inner header.
    pub(crate) fn from_header(header: RequestHeader) -> Result<Request, RequestError> {
        let code = RequestCode::try_from(header.requestid.get())
            .map_err(|_| RequestError::UnknownOpcode(header.requestid.get()))?;
        if header.dlen.get() < 0 {
            return Err(RequestError::NegativeLength(header.dlen.get()));
        }
        Ok(Request { header, code })
    }

    pub fn streamid(&self) -> [u8; 2] {
        self.header.streamid
    }

    pub fn code(&self) -> RequestCode {
        self.code
    }

    /// Length of the argument payload that follows the header.
    pub fn dlen(&self) -> i32 {
        self.header.dlen.get()
    }

    pub(crate) fn header(&self) -> &RequestHeader {
        &self.header
    }

    /// The typed view of the 16 body bytes.
    pub fn operation(&self) -> Operation {
        match self.code {
            RequestCode::Auth => Operation::Auth,
            RequestCode::Query => Operation::Query(*self.header.args()),
            RequestCode::Chmod => Operation::Chmod(*self.header.args()),
            RequestCode::Close => Operation::Close(*self.header.args()),
            RequestCode::Dirlist => Operation::Dirlist(*self.header.args()),
            RequestCode::Gpfile => Operation::Gpfile,
            RequestCode::Protocol => Operation::Protocol(*self.header.args()),
            RequestCode::Login => Operation::Login(*self.header.args()),
            RequestCode::Mkdir => Operation::Mkdir(*self.header.args()),
            RequestCode::Mv => Operation::Mv(*self.header.args()),
            RequestCode::Open => Operation::Open(*self.header.args()),
            RequestCode::Ping => Operation::Ping,
            RequestCode::ChkPoint => Operation::ChkPoint(*self.header.args()),
            RequestCode::Read => Operation::Read(*self.header.args()),
            RequestCode::Rm => Operation::Rm,
            RequestCode::Rmdir => Operation::Rmdir,
            RequestCode::Sync => Operation::Sync(*self.header.args()),
            RequestCode::Stat => Operation::Stat(*self.header.args()),
            RequestCode::Set => Operation::Set,
            RequestCode::Write => Operation::Write(*self.header.args()),
            RequestCode::Fattr => Operation::Fattr(*self.header.args()),
            RequestCode::Prepare => Operation::Prepare,
            RequestCode::Statx => Operation::Statx,
            RequestCode::Endsess => Operation::Endsess(*self.header.args()),
            RequestCode::Bind => Operation::Bind(*self.header.args()),
            RequestCode::ReadV => Operation::ReadV(*self.header.args()),
            RequestCode::PgWrite => Operation::PgWrite(*self.header.args()),
            RequestCode::Locate => Operation::Locate,
            RequestCode::Truncate => Operation::Truncate(*self.header.args()),
            RequestCode::Sigver => Operation::Sigver,
            RequestCode::PgRead => Operation::PgRead(*self.header.args()),
            RequestCode::WriteV => Operation::WriteV(*self.header.args()),
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} sid={:02x}{:02x} dlen={}",
            self.code.name(),
            self.header.streamid[0],
            self.header.streamid[1],
            self.dlen()
        )
    }
}

/// A file handle as carried on the wire: four opaque bytes holding the
/// server-chosen table index.
pub(crate) fn fhandle(bytes: [u8; 4]) -> i32 {
    i32::from_ne_bytes(bytes)
}

pub(crate) fn fhandle_bytes(handle: i32) -> [u8; 4] {
    handle.to_ne_bytes()
}
