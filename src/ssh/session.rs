use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        RwLock,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use eyre::Result;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};

use super::{Error, KEEPALIVE_DEADLINE};
use crate::tunnel::ServiceLabel;

pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

pub type BoxedStream = Box<dyn Stream>;

/// Interactive channel with window-change control. Driven by the terminal
/// relay, which owns it for the lifetime of the shell session.
#[async_trait::async_trait]
pub trait Pty: Send {
    async fn resize(&mut self, cols: u16, rows: u16) -> Result<()>;

    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// `None` once the remote side has closed.
    async fn recv(&mut self) -> Result<Option<Vec<u8>>>;
}

/// One authenticated, multiplexing link to an instance. Streams are cheap;
/// everything an instance serves flows over a single transport.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn open_labeled(&self, label: ServiceLabel) -> Result<BoxedStream>;

    async fn open_direct(&self, remote_port: u16) -> Result<BoxedStream>;

    async fn open_pty(&self) -> Result<Box<dyn Pty>>;

    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// A live transport plus its health bookkeeping. At most one non-closed
/// session exists per instance; the manager enforces that invariant.
pub struct Session {
    instance_id: i64,
    transport: Box<dyn Transport>,
    established_at: DateTime<Utc>,
    peer_fingerprint: String,
    last_keepalive_at: RwLock<Option<DateTime<Utc>>>,
    successful_probes: AtomicU64,
    failed_probes: AtomicU64,
    closed: AtomicBool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub established_at: DateTime<Utc>,
    pub last_keepalive_at: Option<DateTime<Utc>>,
    pub successful_probes: u64,
    pub failed_probes: u64,
    pub peer_fingerprint: String,
    pub healthy: bool,
}

impl Session {
    pub fn new(instance_id: i64, transport: Box<dyn Transport>, peer_fingerprint: String) -> Self {
        Self {
            instance_id,
            transport,
            established_at: Utc::now(),
            peer_fingerprint,
            last_keepalive_at: RwLock::new(None),
            successful_probes: AtomicU64::new(0),
            failed_probes: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn instance_id(&self) -> i64 {
        self.instance_id
    }

    pub fn established_at(&self) -> DateTime<Utc> {
        self.established_at
    }

    pub fn peer_fingerprint(&self) -> &str {
        &self.peer_fingerprint
    }

    pub fn healthy(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && !self.transport.is_closed()
    }

    /// Idempotent. Everything layered on the transport dies with it.
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.transport.close().await;
        }
    }

    pub async fn open_labeled(&self, label: ServiceLabel) -> Result<BoxedStream, Error> {
        self.guard()?;

        self.transport
            .open_labeled(label)
            .await
            .map_err(|err| self.open_error(err))
    }

    pub async fn open_direct(&self, remote_port: u16) -> Result<BoxedStream, Error> {
        self.guard()?;

        self.transport
            .open_direct(remote_port)
            .await
            .map_err(|err| self.open_error(err))
    }

    pub async fn open_pty(&self) -> Result<Box<dyn Pty>, Error> {
        self.guard()?;

        self.transport
            .open_pty()
            .await
            .map_err(|err| self.open_error(err))
    }

    /// One protocol-level round trip: a `ping` channel whose dispatcher
    /// answers with a single `pong` line. Misses count against health.
    pub async fn keepalive(&self) -> Result<Duration, Error> {
        self.guard()?;

        let start = tokio::time::Instant::now();

        let exchange = async {
            let stream = self.transport.open_labeled(ServiceLabel::Ping).await?;

            let mut line = String::new();
            BufReader::new(stream).read_line(&mut line).await?;
            eyre::ensure!(line == "pong\n", "unexpected keepalive reply {line:?}");

            Ok::<_, eyre::Report>(())
        };

        match tokio::time::timeout(KEEPALIVE_DEADLINE, exchange).await {
            Ok(Ok(())) => {
                self.successful_probes.fetch_add(1, Ordering::Relaxed);
                *self.last_keepalive_at.write().expect("session lock") = Some(Utc::now());

                Ok(start.elapsed())
            }
            Ok(Err(err)) => {
                self.failed_probes.fetch_add(1, Ordering::Relaxed);

                Err(Error::ChannelOpen {
                    instance_id: self.instance_id,
                    detail: format!("{err:#}"),
                })
            }
            Err(_) => {
                self.failed_probes.fetch_add(1, Ordering::Relaxed);

                Err(Error::Timeout {
                    instance_id: self.instance_id,
                    timeout: KEEPALIVE_DEADLINE,
                })
            }
        }
    }

    pub fn status(&self) -> Status {
        Status {
            established_at: self.established_at,
            last_keepalive_at: *self.last_keepalive_at.read().expect("session lock"),
            successful_probes: self.successful_probes.load(Ordering::Relaxed),
            failed_probes: self.failed_probes.load(Ordering::Relaxed),
            peer_fingerprint: self.peer_fingerprint.clone(),
            healthy: self.healthy(),
        }
    }

    fn guard(&self) -> Result<(), Error> {
        if self.healthy() {
            return Ok(());
        }

        Err(Error::NotConnected {
            instance_id: self.instance_id,
        })
    }

    fn open_error(&self, err: eyre::Report) -> Error {
        Error::ChannelOpen {
            instance_id: self.instance_id,
            detail: format!("{err:#}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::testutil::FakeTransport;

    #[tokio::test]
    async fn keepalive_round_trip() {
        let session = Session::new(1, Box::new(FakeTransport::default()), String::new());

        session.keepalive().await.unwrap();
        session.keepalive().await.unwrap();

        let status = session.status();
        assert_eq!(status.successful_probes, 2);
        assert_eq!(status.failed_probes, 0);
        assert!(status.last_keepalive_at.is_some());
    }

    #[tokio::test]
    async fn keepalive_miss_counts_against_health() {
        let transport = FakeTransport::default();
        transport.mute_pings();

        let session = Session::new(1, Box::new(transport), String::new());

        session.keepalive().await.unwrap_err();

        let status = session.status();
        assert_eq!(status.successful_probes, 0);
        assert_eq!(status.failed_probes, 1);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_fails_opens() {
        let session = Session::new(1, Box::new(FakeTransport::default()), String::new());

        session.close().await;
        session.close().await;

        assert!(!session.healthy());

        let err = match session.open_labeled(ServiceLabel::Gateway).await {
            Err(e) => e,
            Ok(_) => panic!("expected the session to be closed"),
        };
        assert!(matches!(err, Error::NotConnected { .. }));
    }
}
