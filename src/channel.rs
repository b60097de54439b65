//! Link: one bidirectional byte stream bound to a session.
//!
//! The read half stays with the session's dispatcher, which is the only
//! reader. The write half lives here behind a send lock so that replies from
//! async tasks and the dispatcher never interleave mid-frame. A link also
//! carries the reference count that async tasks take while they hold a
//! pointer to it, and the serialize primitive that waits for those tasks to
//! drain before a file is torn down.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Duration;

use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, Notify};

use crate::ll::reply::ReplySender;

/// The writable, shareable half of a connection.
pub struct Link {
    id: String,
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    refs: AtomicI32,
    dead: AtomicBool,
    quiesced: Notify,
}

impl Link {
    pub fn new(writer: Box<dyn AsyncWrite + Send + Unpin>, id: String) -> Arc<Link> {
        Arc::new(Link {
            id,
            writer: Mutex::new(writer),
            refs: AtomicI32::new(0),
            dead: AtomicBool::new(false),
            quiesced: Notify::new(),
        })
    }

    /// Client identity string for logging ("user.pid:host" once logged in).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Send all byte runs as one frame. The send lock guarantees no other
    /// frame interleaves.
    pub async fn send(&self, bufs: &[&[u8]]) -> io::Result<()> {
        if self.dead.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link is dead"));
        }
        let mut writer = self.writer.lock().await;
        for buf in bufs {
            if let Err(e) = writer.write_all(buf).await {
                self.dead.store(true, Ordering::Release);
                return Err(e);
            }
        }
        writer.flush().await.inspect_err(|_| {
            self.dead.store(true, Ordering::Release);
        })
    }

    /// Adjust the task reference count. Dropping to zero wakes any
    /// serialize() waiters.
    pub fn set_ref(&self, delta: i32) {
        let prior = self.refs.fetch_add(delta, Ordering::AcqRel);
        let now = prior + delta;
        debug_assert!(now >= 0, "link reference count went negative");
        if now == 0 {
            self.quiesced.notify_waiters();
        }
    }

    pub fn use_count(&self) -> i32 {
        self.refs.load(Ordering::Acquire)
    }

    /// Wait until no async task holds a reference to this link.
    pub async fn serialize(&self) {
        loop {
            let waiter = self.quiesced.notified();
            if self.refs.load(Ordering::Acquire) == 0 {
                return;
            }
            waiter.await;
        }
    }

    /// Mark the link unusable. In-flight senders will fail their next send.
    pub fn set_dead(&self) {
        if !self.dead.swap(true, Ordering::AcqRel) {
            debug!("link {} marked dead", self.id);
        }
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.id)
            .field("refs", &self.use_count())
            .field("dead", &self.is_dead())
            .finish()
    }
}

#[async_trait::async_trait]
impl ReplySender for Link {
    async fn send(&self, data: &[&[u8]]) -> io::Result<()> {
        Link::send(self, data).await
    }

    fn mark_failed(&self) {
        self.set_dead();
    }
}

/// Read exactly `buf.len()` bytes, failing with `TimedOut` if the client
/// stops feeding us mid-object for longer than `wait`.
pub(crate) async fn recv_exact<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
    buf: &mut [u8],
    wait: Duration,
) -> io::Result<()> {
    match tokio::time::timeout(wait, reader.read_exact(buf)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(e),
        Err(_) => {
            warn!("timeout after {}ms awaiting request data", wait.as_millis());
            Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "request data timeout",
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_is_atomic_per_call() {
        let (client, server) = tokio::io::duplex(1024);
        let (mut crd, _cwr) = tokio::io::split(client);
        let (_srd, swr) = tokio::io::split(server);
        let link = Link::new(Box::new(swr), "test".into());

        link.send(&[b"abc", b"def"]).await.unwrap();
        let mut buf = [0u8; 6];
        crd.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abcdef");
    }

    #[tokio::test]
    async fn serialize_waits_for_refs() {
        let (_client, server) = tokio::io::duplex(64);
        let (_srd, swr) = tokio::io::split(server);
        let link = Link::new(Box::new(swr), "test".into());

        link.set_ref(1);
        let l2 = link.clone();
        let waiter = tokio::spawn(async move {
            l2.serialize().await;
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        link.set_ref(-1);
        waiter.await.unwrap();
        assert_eq!(link.use_count(), 0);
    }

    #[tokio::test]
    async fn recv_exact_times_out() {
        let (_client, server) = tokio::io::duplex(64);
        let (mut srd, _swr) = tokio::io::split(server);
        let mut buf = [0u8; 4];
        let err = recv_exact(&mut srd, &mut buf, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
