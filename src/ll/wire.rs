//! XRootD wire protocol definitions.
//!
//! Types and constants shared between the client and server sides of the
//! protocol. Every multi-byte integer on the wire is big-endian; the structs
//! here use the `zerocopy` byte-order types so that a request body can be
//! viewed in place without a deserialization step.

#![allow(missing_docs)]

use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use zerocopy::byteorder::big_endian::{I16, I32, I64, U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Binary protocol version (three base-10 digits: 4.0.0).
pub const PROTOCOL_VERSION: u32 = 0x0000_0400;

/// The magic fourth/fifth words of the 20-byte client handshake.
pub const HANDSHAKE_FOURTH: i32 = 4;
pub const HANDSHAKE_FIFTH: i32 = 2012;

/// Server role words returned in the handshake and protocol responses.
pub const ROLE_DATA_SERVER: u32 = 1;
pub const ROLE_LBAL_SERVER: u32 = 0;

pub const REQUEST_HDR_LEN: usize = 24;
pub const RESPONSE_HDR_LEN: usize = 8;
pub const HANDSHAKE_LEN: usize = 20;
pub const SESSID_LEN: usize = 16;

/// Page-level I/O unit. Fixed by the protocol, not the host.
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_MASK: i64 = (PAGE_SIZE as i64) - 1;
pub const PAGE_BITS: u32 = 12;
/// One checksum-prefixed page on the wire.
pub const PAGE_UNIT: usize = PAGE_SIZE + CRC_LEN;
pub const CRC_LEN: usize = 4;

/// Maximum failed-checksum entries a single pgwrite request may accumulate.
pub const PGW_MAX_EPR: usize = 256;
/// Maximum uncorrected failed-checksum entries a file may hold.
pub const PGW_MAX_EOS: usize = 4096;

/// pgread/pgwrite request flag: recompute checksums, bypassing any cache.
pub const PG_RETRY: u8 = 0x01;

/// Upper bound on a readv/writev descriptor payload, in bytes.
pub const MAX_RVEC_LEN: usize = 16384;
pub const MAX_WVEC_LEN: usize = 16384;
/// One element of a readv/writev/pre-read descriptor vector.
pub const IOVEC_ENTRY_LEN: usize = 16;

/// fattr limits: names and values are bounded and the attribute count per
/// request is small.
pub const FATTR_MAX_VARS: usize = 16;
pub const FATTR_MAX_NLEN: usize = 248;
pub const FATTR_MAX_VLEN: usize = 65536;
/// All client attributes live under this single namespace prefix.
pub const FATTR_NAMESPACE: u8 = b'U';

/// Checkpoint sub-opcodes.
pub const CKP_BEGIN: u8 = 0;
pub const CKP_COMMIT: u8 = 1;
pub const CKP_QUERY: u8 = 2;
pub const CKP_ROLLBACK: u8 = 3;
pub const CKP_XEQ: u8 = 4;

/// fattr sub-codes.
pub const FATTR_DEL: u8 = 0;
pub const FATTR_GET: u8 = 1;
pub const FATTR_LIST: u8 = 2;
pub const FATTR_SET: u8 = 3;
pub const FATTR_MAX_SC: u8 = 3;
/// fattr option bits.
pub const FATTR_OPT_NEW: u8 = 0x01;
pub const FATTR_OPT_DATA: u8 = 0x10;

/// Request codes. The 3000 base and ordering are fixed by the protocol;
/// slots re-used across protocol revisions keep their current meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum RequestCode {
    Auth = 3000,
    Query = 3001,
    Chmod = 3002,
    Close = 3003,
    Dirlist = 3004,
    Gpfile = 3005,
    Protocol = 3006,
    Login = 3007,
    Mkdir = 3008,
    Mv = 3009,
    Open = 3010,
    Ping = 3011,
    ChkPoint = 3012,
    Read = 3013,
    Rm = 3014,
    Rmdir = 3015,
    Sync = 3016,
    Stat = 3017,
    Set = 3018,
    Write = 3019,
    Fattr = 3020,
    Prepare = 3021,
    Statx = 3022,
    Endsess = 3023,
    Bind = 3024,
    ReadV = 3025,
    PgWrite = 3026,
    Locate = 3027,
    Truncate = 3028,
    Sigver = 3029,
    PgRead = 3030,
    WriteV = 3031,
}

impl RequestCode {
    pub fn name(&self) -> &'static str {
        match self {
            RequestCode::Auth => "auth",
            RequestCode::Query => "query",
            RequestCode::Chmod => "chmod",
            RequestCode::Close => "close",
            RequestCode::Dirlist => "dirlist",
            RequestCode::Gpfile => "gpfile",
            RequestCode::Protocol => "protocol",
            RequestCode::Login => "login",
            RequestCode::Mkdir => "mkdir",
            RequestCode::Mv => "mv",
            RequestCode::Open => "open",
            RequestCode::Ping => "ping",
            RequestCode::ChkPoint => "chkpoint",
            RequestCode::Read => "read",
            RequestCode::Rm => "rm",
            RequestCode::Rmdir => "rmdir",
            RequestCode::Sync => "sync",
            RequestCode::Stat => "stat",
            RequestCode::Set => "set",
            RequestCode::Write => "write",
            RequestCode::Fattr => "fattr",
            RequestCode::Prepare => "prepare",
            RequestCode::Statx => "statx",
            RequestCode::Endsess => "endsess",
            RequestCode::Bind => "bind",
            RequestCode::ReadV => "readv",
            RequestCode::PgWrite => "pgwrite",
            RequestCode::Locate => "locate",
            RequestCode::Truncate => "truncate",
            RequestCode::Sigver => "sigver",
            RequestCode::PgRead => "pgread",
            RequestCode::WriteV => "writev",
        }
    }
}

/// Response status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum ResponseStatus {
    Ok = 0,
    OkSoFar = 4000,
    Attn = 4001,
    AuthMore = 4002,
    Error = 4003,
    Redirect = 4004,
    Wait = 4005,
    WaitResp = 4006,
}

/// Protocol error codes, a flat enumeration starting at 3000.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum ErrorCode {
    ArgInvalid = 3000,
    ArgMissing = 3001,
    ArgTooLong = 3002,
    FileLocked = 3003,
    FileNotOpen = 3004,
    FSError = 3005,
    InvalidRequest = 3006,
    IOError = 3007,
    NoMemory = 3008,
    NoSpace = 3009,
    NotAuthorized = 3010,
    NotFound = 3011,
    ServerError = 3012,
    Unsupported = 3013,
    NoServer = 3014,
    NotFile = 3015,
    IsDirectory = 3016,
    Cancelled = 3017,
    ChkLenErr = 3018,
    ChkSumErr = 3019,
    InProgress = 3020,
    OverQuota = 3021,
    SigVerErr = 3022,
    DecryptErr = 3023,
    Overloaded = 3024,
    FsReadOnly = 3025,
    BadPayload = 3026,
}

impl ErrorCode {
    pub fn name(&self) -> &'static str {
        match self {
            ErrorCode::ArgInvalid => "ArgInvalid",
            ErrorCode::ArgMissing => "ArgMissing",
            ErrorCode::ArgTooLong => "ArgTooLong",
            ErrorCode::FileLocked => "FileLocked",
            ErrorCode::FileNotOpen => "FileNotOpen",
            ErrorCode::FSError => "FSError",
            ErrorCode::InvalidRequest => "InvalidRequest",
            ErrorCode::IOError => "IOError",
            ErrorCode::NoMemory => "NoMemory",
            ErrorCode::NoSpace => "NoSpace",
            ErrorCode::NotAuthorized => "NotAuthorized",
            ErrorCode::NotFound => "NotFound",
            ErrorCode::ServerError => "ServerError",
            ErrorCode::Unsupported => "Unsupported",
            ErrorCode::NoServer => "NoServer",
            ErrorCode::NotFile => "NotFile",
            ErrorCode::IsDirectory => "IsDirectory",
            ErrorCode::Cancelled => "Cancelled",
            ErrorCode::ChkLenErr => "ChkLenErr",
            ErrorCode::ChkSumErr => "ChkSumErr",
            ErrorCode::InProgress => "InProgress",
            ErrorCode::OverQuota => "OverQuota",
            ErrorCode::SigVerErr => "SigVerErr",
            ErrorCode::DecryptErr => "DecryptErr",
            ErrorCode::Overloaded => "Overloaded",
            ErrorCode::FsReadOnly => "FsReadOnly",
            ErrorCode::BadPayload => "BadPayload",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

bitflags! {
    /// File open options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u16 {
        const COMPRESS = 0x0001;
        const DELETE   = 0x0002;
        const FORCE    = 0x0004;
        const NEW      = 0x0008;
        const READ     = 0x0010;
        const UPDATE   = 0x0020;
        const ASYNC    = 0x0040;
        const REFRESH  = 0x0080;
        const MKPATH   = 0x0100;
        const APPEND   = 0x0200;
        const RETSTAT  = 0x0400;
        const REPLICA  = 0x0800;
        const POSC     = 0x1000;
        const NOWAIT   = 0x2000;
        const SEQIO    = 0x4000;
        const WRTO     = 0x8000;
    }
}

bitflags! {
    /// Open mode bits carried in the open request (a permission triplet).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenMode: u16 {
        const UR = 0x100;
        const UW = 0x080;
        const UX = 0x040;
        const GR = 0x020;
        const GW = 0x010;
        const GX = 0x008;
        const OR = 0x004;
        const OW = 0x002;
        const OX = 0x001;
    }
}

bitflags! {
    /// Flags in a stat reply.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatFlags: u16 {
        const XSET      = 0x01;
        const IS_DIR    = 0x02;
        const OTHER     = 0x04;
        const OFFLINE   = 0x08;
        const READABLE  = 0x10;
        const WRITABLE  = 0x20;
        const POSC_PEND = 0x40;
        const BKP_EXIST = 0x80;
    }
}

/// Login role byte: ordinary user or administrator.
pub const LOGIN_ROLE_ADMIN: u8 = 1;

/// Map the protocol permission triplet into Unix mode bits.
pub fn map_mode(mode: OpenMode) -> u32 {
    let mut out = 0;
    if mode.contains(OpenMode::UR) {
        out |= 0o400;
    }
    if mode.contains(OpenMode::UW) {
        out |= 0o200;
    }
    if mode.contains(OpenMode::UX) {
        out |= 0o100;
    }
    if mode.contains(OpenMode::GR) {
        out |= 0o040;
    }
    if mode.contains(OpenMode::GW) {
        out |= 0o020;
    }
    if mode.contains(OpenMode::GX) {
        out |= 0o010;
    }
    if mode.contains(OpenMode::OR) {
        out |= 0o004;
    }
    if mode.contains(OpenMode::OX) {
        out |= 0o001;
    }
    out
}

/// The fixed 24-byte request header. The 16 `body` bytes are re-interpreted
/// per request code via [`RequestHeader::args`].
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct RequestHeader {
    pub streamid: [u8; 2],
    pub requestid: U16,
    pub body: [u8; 16],
    pub dlen: I32,
}

impl RequestHeader {
    /// View the 16 body bytes as a typed argument struct.
    pub fn args<T: FromBytes + KnownLayout + Immutable + Unaligned>(&self) -> &T {
        const { assert!(size_of::<T>() <= 16) };
        T::ref_from_prefix(&self.body).map(|(r, _)| r).unwrap()
    }
}

/// The fixed 8-byte response header.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct ResponseHeader {
    pub streamid: [u8; 2],
    pub status: U16,
    pub dlen: I32,
}

/// 20-byte client handshake: five big-endian words, `0 0 0 4 2012`.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct ClientHandshake {
    pub first: I32,
    pub second: I32,
    pub third: I32,
    pub fourth: I32,
    pub fifth: I32,
}

/// 16-byte server handshake response.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct HandshakeResponse {
    pub streamid: U16,
    pub status: U16,
    pub rlen: U32,
    pub pval: U32,
    pub styp: U32,
}

// Per-request argument layouts. Each occupies the 16 header body bytes.

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct LoginArgs {
    pub pid: I32,
    pub username: [u8; 8],
    pub reserved: u8,
    pub ability: u8,
    pub capver: u8,
    pub role: u8,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct ProtocolArgs {
    pub clientpv: I32,
    pub flags: u8,
    pub reserved: [u8; 11],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct OpenArgs {
    pub mode: U16,
    pub options: U16,
    pub reserved: [u8; 12],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct ReadArgs {
    pub fhandle: [u8; 4],
    pub offset: I64,
    pub rlen: I32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct WriteArgs {
    pub fhandle: [u8; 4],
    pub offset: I64,
    pub pathid: u8,
    pub reserved: [u8; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct PgReadArgs {
    pub fhandle: [u8; 4],
    pub offset: I64,
    pub rlen: I32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct PgWriteArgs {
    pub fhandle: [u8; 4],
    pub offset: I64,
    pub pathid: u8,
    pub reqflags: u8,
    pub reserved: [u8; 2],
}

/// Optional payload arguments of a pgread (alternate path + flags).
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct PgReadReqArgs {
    pub pathid: u8,
    pub reqflags: u8,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct CloseArgs {
    pub fhandle: [u8; 4],
    pub fsize: I64,
    pub reserved: [u8; 4],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct SyncArgs {
    pub fhandle: [u8; 4],
    pub reserved: [u8; 12],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct TruncateArgs {
    pub fhandle: [u8; 4],
    pub offset: I64,
    pub reserved: [u8; 4],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct StatArgs {
    pub options: u8,
    pub reserved: [u8; 11],
    pub fhandle: [u8; 4],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct ChmodArgs {
    pub reserved: [u8; 14],
    pub mode: U16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct MkdirArgs {
    pub options: u8,
    pub reserved: [u8; 13],
    pub mode: U16,
}

/// mkdir option bit: create intermediate path components.
pub const MKDIR_PATH: u8 = 0x01;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct MvArgs {
    pub reserved: [u8; 14],
    pub arg1len: I16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct DirlistArgs {
    pub reserved: [u8; 15],
    pub options: u8,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct QueryArgs {
    pub infotype: U16,
    pub reserved1: [u8; 2],
    pub fhandle: [u8; 4],
    pub reserved2: [u8; 8],
}

/// Query info types we answer.
pub const QUERY_STATS: u16 = 1;
pub const QUERY_CONFIG: u16 = 7;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct BindArgs {
    pub sessid: [u8; 16],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct EndsessArgs {
    pub sessid: [u8; 16],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct ChkPointArgs {
    pub fhandle: [u8; 4],
    pub reserved: [u8; 11],
    pub opcode: u8,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct FattrArgs {
    pub fhandle: [u8; 4],
    pub subcode: u8,
    pub numattr: u8,
    pub options: u8,
    pub reserved: [u8; 9],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct ReadVArgs {
    pub reserved: [u8; 15],
    pub pathid: u8,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct WriteVArgs {
    pub options: u8,
    pub reserved: [u8; 15],
}

/// One element of a readv descriptor vector or a pre-read hint list.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct ReadVEntry {
    pub fhandle: [u8; 4],
    pub rlen: I32,
    pub offset: I64,
}

/// One element of a writev descriptor vector.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct WriteVEntry {
    pub fhandle: [u8; 4],
    pub wlen: I32,
    pub offset: I64,
}

/// Body of an open response (file handle plus optional compression info).
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct OpenResponse {
    pub fhandle: [u8; 4],
}

/// Body of a checkpoint query response.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct ChkPointQueryResponse {
    pub max_ckp_size: U32,
    pub use_ckp_size: U32,
}

/// Leading fixed part of the pgwrite corrective (retry) record. The CRC
/// covers everything after itself: the two lengths plus the offset vector.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct PgWriteCse {
    pub cse_crc: U32,
    pub dl_first: I16,
    pub dl_last: I16,
}
