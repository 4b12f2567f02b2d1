use std::{
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, RwLock,
    },
    task::{Context, Poll},
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;

use super::{forward, Error, Kind};
use crate::ssh::Session;

/// Accounting wrapper: a single atomic add per read or write, against the
/// owning tunnel's shared counter.
pub struct CountingStream<S> {
    inner: S,
    count: Arc<AtomicU64>,
}

impl<S> CountingStream<S> {
    pub fn new(inner: S, count: Arc<AtomicU64>) -> Self {
        Self { inner, count }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CountingStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();

        match Pin::new(&mut self.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let read = buf.filled().len() - before;
                self.count.fetch_add(read as u64, Ordering::Relaxed);

                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CountingStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match Pin::new(&mut self.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(written)) => {
                self.count.fetch_add(written as u64, Ordering::Relaxed);

                Poll::Ready(Ok(written))
            }
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// One tunnel: a loopback listener bridging every accepted connection onto a
/// fresh remote stream, plus the health bookkeeping the monitor reads.
pub struct Channel {
    kind: Kind,
    local_port: u16,
    started_at: DateTime<Utc>,
    bytes: Arc<AtomicU64>,
    last_probe_at: RwLock<Option<DateTime<Utc>>>,
    last_success_at: RwLock<Option<DateTime<Utc>>>,
    last_error: RwLock<Option<String>>,
    closed: AtomicBool,
    cancel: CancellationToken,
}

#[derive(Debug, Clone, Serialize)]
pub struct Metrics {
    pub service: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub started_at: DateTime<Utc>,
    pub last_probe_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub bytes_transferred: u64,
    pub healthy: bool,
    pub last_error: Option<String>,
}

pub(super) async fn open(
    session: Arc<Session>,
    instance_id: i64,
    kind: Kind,
) -> Result<Arc<Channel>, Error> {
    let bytes = Arc::new(AtomicU64::new(0));
    let cancel = CancellationToken::new();

    let local_port = forward::bind(session, kind, bytes.clone(), cancel.clone())
        .await
        .map_err(|err| Error::Open {
            instance_id,
            kind,
            detail: format!("{err:#}"),
        })?;

    Ok(Arc::new(Channel {
        kind,
        local_port,
        started_at: Utc::now(),
        bytes,
        last_probe_at: RwLock::new(None),
        last_success_at: RwLock::new(None),
        last_error: RwLock::new(None),
        closed: AtomicBool::new(false),
        cancel,
    }))
}

impl Channel {
    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn last_probe(&self) -> Option<DateTime<Utc>> {
        *self.last_probe_at.read().expect("channel lock")
    }

    pub fn closed(&self) -> bool {
        // The accept loop cancels the token when it dies on its own, e.g.
        // after the transport went away under it.
        self.closed.load(Ordering::Acquire) || self.cancel.is_cancelled()
    }

    /// Idempotent. Tears the listener down; in-flight streams are aborted.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.cancel.cancel();
        }
    }

    pub(super) fn probe_success(&self) {
        let now = Some(Utc::now());

        *self.last_probe_at.write().expect("channel lock") = now;
        *self.last_success_at.write().expect("channel lock") = now;
    }

    pub(super) fn probe_failure(&self, detail: String) {
        *self.last_probe_at.write().expect("channel lock") = Some(Utc::now());
        *self.last_error.write().expect("channel lock") = Some(detail);
    }

    pub fn metrics(&self) -> Metrics {
        Metrics {
            service: self.kind.to_string(),
            local_port: self.local_port,
            remote_port: self.kind.remote_port(),
            started_at: self.started_at,
            last_probe_at: *self.last_probe_at.read().expect("channel lock"),
            last_success_at: *self.last_success_at.read().expect("channel lock"),
            bytes_transferred: self.bytes_transferred(),
            healthy: !self.closed(),
            last_error: self.last_error.read().expect("channel lock").clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn counting_stream_accounts_both_directions() {
        let count = Arc::new(AtomicU64::new(0));
        let (near, mut far) = tokio::io::duplex(256);

        let mut counted = CountingStream::new(near, count.clone());

        counted.write_all(b"four").await.unwrap();
        counted.flush().await.unwrap();

        let mut buf = [0u8; 4];
        far.read_exact(&mut buf).await.unwrap();
        far.write_all(b"ok").await.unwrap();

        let mut buf = [0u8; 2];
        counted.read_exact(&mut buf).await.unwrap();

        assert_eq!(count.load(Ordering::Relaxed), 6);
    }
}
