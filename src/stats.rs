//! Server-wide statistics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counters, folded in from sessions as they run and when they
/// end. Cheap enough to bump from any path.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections: AtomicU64,
    pub read_cnt: AtomicU64,
    pub prer_cnt: AtomicU64,
    pub rvec_cnt: AtomicU64,
    pub rseg_cnt: AtomicU64,
    pub write_cnt: AtomicU64,
    pub open_cnt: AtomicU64,
    pub sync_cnt: AtomicU64,
    pub misc_cnt: AtomicU64,
    pub error_cnt: AtomicU64,
    pub redir_cnt: AtomicU64,
    pub stall_cnt: AtomicU64,
    pub async_rej: AtomicU64,
    pub async_now: AtomicU64,
}

impl ServerStats {
    pub fn bump(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Render the counters for a stats query.
    pub fn report(&self) -> String {
        format!(
            "<stats id=\"xeq\"><num>{}</num><rdr>{}</rdr><prr>{}</prr>\
             <rvc>{}</rvc><rsg>{}</rsg><wrt>{}</wrt><opn>{}</opn>\
             <syn>{}</syn><msc>{}</msc><err>{}</err><rdx>{}</rdx>\
             <stl>{}</stl><arj>{}</arj></stats>",
            self.connections.load(Ordering::Relaxed),
            self.read_cnt.load(Ordering::Relaxed),
            self.prer_cnt.load(Ordering::Relaxed),
            self.rvec_cnt.load(Ordering::Relaxed),
            self.rseg_cnt.load(Ordering::Relaxed),
            self.write_cnt.load(Ordering::Relaxed),
            self.open_cnt.load(Ordering::Relaxed),
            self.sync_cnt.load(Ordering::Relaxed),
            self.misc_cnt.load(Ordering::Relaxed),
            self.error_cnt.load(Ordering::Relaxed),
            self.redir_cnt.load(Ordering::Relaxed),
            self.stall_cnt.load(Ordering::Relaxed),
            self.async_rej.load(Ordering::Relaxed),
        )
    }
}
