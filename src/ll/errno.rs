//! Mapping between POSIX errno values and protocol error codes.
//!
//! The forward table is the official injective mapping; anything it does not
//! name collapses to `FSError`. The reverse table exists for backends that
//! want to synthesize an errno from a wire error.

use crate::ll::wire::ErrorCode;

/// Map an errno (positive or negative) to its protocol error code.
pub fn map_errno(rc: i32) -> ErrorCode {
    match rc.abs() {
        libc::ENOENT => ErrorCode::NotFound,
        libc::EPERM => ErrorCode::NotAuthorized,
        libc::EACCES => ErrorCode::NotAuthorized,
        libc::EIO => ErrorCode::IOError,
        libc::ENOMEM => ErrorCode::NoMemory,
        libc::ENOBUFS => ErrorCode::NoMemory,
        libc::ENOSPC => ErrorCode::NoSpace,
        libc::ENAMETOOLONG => ErrorCode::ArgTooLong,
        libc::ENETUNREACH => ErrorCode::NoServer,
        libc::ENOTBLK => ErrorCode::NotFile,
        libc::EISDIR => ErrorCode::IsDirectory,
        libc::EEXIST => ErrorCode::InvalidRequest,
        libc::ETXTBSY => ErrorCode::InProgress,
        libc::ENODEV => ErrorCode::FSError,
        libc::EFAULT => ErrorCode::ServerError,
        libc::EDOM => ErrorCode::ChkSumErr,
        libc::EDQUOT => ErrorCode::OverQuota,
        libc::EILSEQ => ErrorCode::SigVerErr,
        libc::ERANGE => ErrorCode::DecryptErr,
        libc::EUSERS => ErrorCode::Overloaded,
        libc::EROFS => ErrorCode::FsReadOnly,
        libc::ENOSYS => ErrorCode::Unsupported,
        libc::EBADF => ErrorCode::FileNotOpen,
        libc::EINVAL => ErrorCode::ArgInvalid,
        libc::ECANCELED => ErrorCode::Cancelled,
        libc::EDEADLK => ErrorCode::FileLocked,
        _ => ErrorCode::FSError,
    }
}

/// Map a protocol error code back to a representative errno.
pub fn to_errno(code: ErrorCode) -> i32 {
    match code {
        ErrorCode::ArgInvalid => libc::EINVAL,
        ErrorCode::ArgMissing => libc::EINVAL,
        ErrorCode::ArgTooLong => libc::ENAMETOOLONG,
        ErrorCode::FileLocked => libc::EDEADLK,
        ErrorCode::FileNotOpen => libc::EBADF,
        ErrorCode::FSError => libc::EIO,
        ErrorCode::InvalidRequest => libc::EEXIST,
        ErrorCode::IOError => libc::EIO,
        ErrorCode::NoMemory => libc::ENOMEM,
        ErrorCode::NoSpace => libc::ENOSPC,
        ErrorCode::NotAuthorized => libc::EACCES,
        ErrorCode::NotFound => libc::ENOENT,
        ErrorCode::ServerError => libc::ENOMSG,
        ErrorCode::Unsupported => libc::ENOSYS,
        ErrorCode::NoServer => libc::EHOSTUNREACH,
        ErrorCode::NotFile => libc::ENOTBLK,
        ErrorCode::IsDirectory => libc::EISDIR,
        ErrorCode::Cancelled => libc::ECANCELED,
        ErrorCode::ChkLenErr => libc::EDOM,
        ErrorCode::ChkSumErr => libc::EDOM,
        ErrorCode::InProgress => libc::EINPROGRESS,
        ErrorCode::OverQuota => libc::EDQUOT,
        ErrorCode::SigVerErr => libc::EILSEQ,
        ErrorCode::DecryptErr => libc::ERANGE,
        ErrorCode::Overloaded => libc::EUSERS,
        ErrorCode::FsReadOnly => libc::EROFS,
        ErrorCode::BadPayload => libc::EINVAL,
    }
}
