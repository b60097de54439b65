//! Server configuration record.
//!
//! An external loader parses keyword/value directives; the core only sees
//! this struct. Defaults mirror a stock data-server deployment.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Segment size for async I/O buffers.
    pub as_segsize: usize,
    /// Minimum request size before the async path is considered.
    pub as_miniosz: i32,
    /// Maximum in-flight async buffers per request.
    pub as_maxperreq: usize,
    /// Maximum async requests outstanding per link.
    pub as_maxperlnk: i32,
    /// Stall tolerance before a write falls back to the sync path.
    pub as_maxstalls: u32,
    /// Force async I/O even when the client did not ask for it.
    pub as_force: bool,
    /// Disable async I/O entirely.
    pub as_noaio: bool,
    /// Force writes down the synchronous path.
    pub as_syncw: bool,
    /// Largest single network transfer unit for buffered I/O.
    pub max_transz: usize,
    /// How long to wait for the rest of a partially received request.
    pub read_wait: Duration,
    /// Handshake must complete within this window.
    pub hail_wait: Duration,
    /// Backend wait requests above this ceiling become terminal errors.
    pub wait_ceiling: i32,
    /// fattr limits: maximum name and value lengths. A zero name bound
    /// disables the fattr subsystem.
    pub usx_max_nsz: usize,
    pub usx_max_vsz: usize,
    /// Checkpoint slot data budget per file.
    pub ckp_max_size: u32,
    /// Disable the zero-copy send path regardless of per-file eligibility.
    pub no_sendfile: bool,
    /// Answer handshakes as a load balancer instead of a data server.
    pub redirector: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            as_segsize: 131072,
            as_miniosz: 32768,
            as_maxperreq: 8,
            as_maxperlnk: 8,
            as_maxstalls: 5,
            as_force: false,
            as_noaio: false,
            as_syncw: false,
            max_transz: 262144,
            read_wait: Duration::from_secs(30),
            hail_wait: Duration::from_secs(10),
            wait_ceiling: 600,
            usx_max_nsz: 248,
            usx_max_vsz: 65536,
            ckp_max_size: 10 << 20,
            no_sendfile: true,
            redirector: false,
        }
    }
}
