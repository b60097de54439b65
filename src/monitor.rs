//! Monitoring hooks.
//!
//! The core emits events; transport and formatting live elsewhere. A sink
//! that wants nothing overrides nothing.

use std::sync::Arc;

/// Pluggable monitoring sink.
pub trait Monitor: Send + Sync {
    /// Map a user or user+path pair to a dictionary id for later events.
    fn map_user(&self, _uname: &str) -> u32 {
        0
    }

    fn map_path(&self, _uname: &str, _path: &str) -> u32 {
        0
    }

    /// A file was opened.
    fn open(&self, _dictid: u32, _fsize: i64) {}

    /// A file was closed, with lifetime transfer totals.
    fn close(&self, _dictid: u32, _bytes_read: i64, _bytes_written: i64) {}

    /// One I/O event (reads positive, writes negative length).
    fn io(&self, _dictid: u32, _len: i32, _offset: i64) {}

    /// Session ended after `duration_secs`; `forced` when torn down
    /// administratively.
    fn disc(&self, _dictid: u32, _duration_secs: u64, _forced: bool) {}

    /// Free-form g-stream event.
    fn gstream(&self, _ident: &str, _info: &str) {}
}

/// Per-session monitoring context: the sink plus what this session agreed
/// to report.
#[derive(Clone)]
pub struct MonitorCtx {
    pub agent: Arc<dyn Monitor>,
    /// Session dictionary id (user mapping).
    pub did: u32,
    pub mon_io: bool,
    pub mon_file: bool,
}

impl MonitorCtx {
    pub fn new(agent: Arc<dyn Monitor>, uname: &str, mon_io: bool, mon_file: bool) -> MonitorCtx {
        let did = agent.map_user(uname);
        MonitorCtx {
            agent,
            did,
            mon_io,
            mon_file,
        }
    }

    pub fn add_rd(&self, dictid: u32, len: i32, offset: i64) {
        if self.mon_io {
            self.agent.io(dictid, len, offset);
        }
    }

    pub fn add_wr(&self, dictid: u32, len: i32, offset: i64) {
        if self.mon_io {
            self.agent.io(dictid, -len, offset);
        }
    }
}

impl std::fmt::Debug for MonitorCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorCtx")
            .field("did", &self.did)
            .field("mon_io", &self.mon_io)
            .field("mon_file", &self.mon_file)
            .finish()
    }
}
