use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use eyre::{bail, Result};
use tokio::{
    io::{AsyncWriteExt, DuplexStream},
    sync::mpsc,
};

use super::{
    dialer::{Dialed, Dialer, Target},
    session::{BoxedStream, Pty, Transport},
    Error,
};
use crate::tunnel::ServiceLabel;

/// Transport over in-memory pipes. Ping channels answer `pong` unless muted;
/// other opens hand the far half back to the test for driving.
pub struct FakeTransport {
    closed: AtomicBool,
    pong: AtomicBool,
    refuse: AtomicBool,
    pub opened: Mutex<Vec<String>>,
    pub peers: Mutex<Vec<(String, DuplexStream)>>,
    pub ptys: Mutex<Vec<PtyDriver>>,
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self {
            closed: AtomicBool::new(false),
            pong: AtomicBool::new(true),
            refuse: AtomicBool::new(false),
            opened: Mutex::new(Vec::new()),
            peers: Mutex::new(Vec::new()),
            ptys: Mutex::new(Vec::new()),
        }
    }
}

impl FakeTransport {
    pub fn mute_pings(&self) {
        self.pong.store(false, Ordering::SeqCst);
    }

    pub fn refuse_opens(&self) {
        self.refuse.store(true, Ordering::SeqCst);
    }

    fn register(&self, name: String) -> DuplexStream {
        let (near, far) = tokio::io::duplex(64 * 1024);

        self.opened.lock().unwrap().push(name.clone());
        self.peers.lock().unwrap().push((name, far));

        near
    }
}

#[async_trait::async_trait]
impl Transport for FakeTransport {
    async fn open_labeled(&self, label: ServiceLabel) -> Result<BoxedStream> {
        if self.closed.load(Ordering::SeqCst) || self.refuse.load(Ordering::SeqCst) {
            bail!("stream open refused");
        }

        if label == ServiceLabel::Ping {
            let (near, mut far) = tokio::io::duplex(64);

            if self.pong.load(Ordering::SeqCst) {
                far.write_all(b"pong\n").await?;
            }

            return Ok(Box::new(near));
        }

        Ok(Box::new(self.register(label.to_string())))
    }

    async fn open_direct(&self, remote_port: u16) -> Result<BoxedStream> {
        if self.closed.load(Ordering::SeqCst) || self.refuse.load(Ordering::SeqCst) {
            bail!("stream open refused");
        }

        Ok(Box::new(self.register(format!("port:{remote_port}"))))
    }

    async fn open_pty(&self) -> Result<Box<dyn Pty>> {
        if self.closed.load(Ordering::SeqCst) || self.refuse.load(Ordering::SeqCst) {
            bail!("stream open refused");
        }

        let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
        let resizes = Arc::new(Mutex::new(Vec::new()));
        let sent = Arc::new(Mutex::new(Vec::new()));

        self.ptys.lock().unwrap().push(PtyDriver {
            to_client: to_client_tx,
            resizes: resizes.clone(),
            sent: sent.clone(),
        });

        Ok(Box::new(FakePty {
            resizes,
            sent,
            from_driver: to_client_rx,
        }))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Test-side handle to a [`FakePty`].
pub struct PtyDriver {
    pub to_client: mpsc::UnboundedSender<Vec<u8>>,
    pub resizes: Arc<Mutex<Vec<(u16, u16)>>>,
    pub sent: Arc<Mutex<Vec<Vec<u8>>>>,
}

pub struct FakePty {
    resizes: Arc<Mutex<Vec<(u16, u16)>>>,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    from_driver: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[async_trait::async_trait]
impl Pty for FakePty {
    async fn resize(&mut self, cols: u16, rows: u16) -> Result<()> {
        self.resizes.lock().unwrap().push((cols, rows));
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.sent.lock().unwrap().push(data.to_vec());
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.from_driver.recv().await)
    }
}

/// Delegating wrapper so tests can keep a handle on the transport the dialer
/// hands out.
pub struct Shared(pub Arc<FakeTransport>);

#[async_trait::async_trait]
impl Transport for Shared {
    async fn open_labeled(&self, label: ServiceLabel) -> Result<BoxedStream> {
        self.0.open_labeled(label).await
    }

    async fn open_direct(&self, remote_port: u16) -> Result<BoxedStream> {
        self.0.open_direct(remote_port).await
    }

    async fn open_pty(&self) -> Result<Box<dyn Pty>> {
        self.0.open_pty().await
    }

    async fn close(&self) {
        self.0.close().await;
    }

    fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

#[derive(Debug, Clone)]
pub struct DialRecord {
    pub instance_id: i64,
    pub address: String,
    pub key_fingerprint: String,
    pub pinned: String,
    pub strict: bool,
}

/// Dialer that mints [`FakeTransport`]s and records every attempt.
pub struct FakeDialer {
    pub fail: AtomicBool,
    pub panic: AtomicBool,
    pub changed: AtomicBool,
    pub fingerprint: Mutex<String>,
    pub dials: Mutex<Vec<DialRecord>>,
    pub transports: Mutex<Vec<Arc<FakeTransport>>>,
}

impl Default for FakeDialer {
    fn default() -> Self {
        Self {
            fail: AtomicBool::new(false),
            panic: AtomicBool::new(false),
            changed: AtomicBool::new(false),
            fingerprint: Mutex::new("SHA256:peer".to_string()),
            dials: Mutex::new(Vec::new()),
            transports: Mutex::new(Vec::new()),
        }
    }
}

impl FakeDialer {
    pub fn latest(&self) -> Arc<FakeTransport> {
        self.transports.lock().unwrap().last().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Dialer for FakeDialer {
    async fn dial(&self, target: Target) -> Result<Dialed, Error> {
        self.dials.lock().unwrap().push(DialRecord {
            instance_id: target.instance_id,
            address: format!("{}:{}", target.host, target.port),
            key_fingerprint: target
                .key
                .clone_public_key()
                .map(|public| public.fingerprint())
                .unwrap_or_default(),
            pinned: target.pinned.clone(),
            strict: target.strict,
        });

        if self.panic.load(Ordering::SeqCst) {
            panic!("dialer exploded");
        }

        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Dial {
                instance_id: target.instance_id,
                address: format!("{}:{}", target.host, target.port),
                source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
            });
        }

        let transport = Arc::new(FakeTransport::default());
        self.transports.lock().unwrap().push(transport.clone());

        Ok(Dialed {
            transport: Box::new(Shared(transport)),
            observed_fingerprint: self.fingerprint.lock().unwrap().clone(),
            changed: self.changed.load(Ordering::SeqCst),
        })
    }
}
