use std::sync::{Arc, Mutex};

use eyre::Result;
use russh::{
    client::{self, Msg},
    Channel, ChannelMsg, Disconnect,
};
use russh_keys::key::{KeyPair, PublicKey};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use super::{
    session::{BoxedStream, Pty, Transport},
    Error, DIAL_TIMEOUT,
};
use crate::tunnel::ServiceLabel;

pub struct Target {
    pub instance_id: i64,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub key: Arc<KeyPair>,
    /// Pinned peer fingerprint; empty is trust-on-first-use.
    pub pinned: String,
    pub strict: bool,
}

pub struct Dialed {
    pub transport: Box<dyn Transport>,
    pub observed_fingerprint: String,
    /// The peer presented an identity other than the pinned one. Restarted
    /// pods do this legitimately, so it is surfaced rather than fatal.
    pub changed: bool,
}

#[async_trait::async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, target: Target) -> Result<Dialed, Error>;
}

/// The production dialer: one authenticated SSH session per instance.
pub struct Ssh;

#[derive(Clone, Default)]
struct Observation {
    fingerprint: String,
    changed: bool,
}

struct ClientHandler {
    pinned: String,
    strict: bool,
    observation: Arc<Mutex<Observation>>,
}

#[async_trait::async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, key: &PublicKey) -> Result<bool, Self::Error> {
        let observed = key.fingerprint();

        let mut observation = self.observation.lock().expect("observation lock");
        observation.fingerprint.clone_from(&observed);

        if self.pinned.is_empty() {
            debug!(%observed, "pinning peer identity on first use");
            return Ok(true);
        }

        if self.pinned == observed {
            return Ok(true);
        }

        observation.changed = true;
        warn!(pinned = %self.pinned, %observed, "peer identity changed");

        Ok(!self.strict)
    }
}

#[async_trait::async_trait]
impl Dialer for Ssh {
    #[tracing::instrument(skip(self, target), fields(instance_id = target.instance_id))]
    async fn dial(&self, target: Target) -> Result<Dialed, Error> {
        let observation = Arc::new(Mutex::new(Observation::default()));

        let handler = ClientHandler {
            pinned: target.pinned.clone(),
            strict: target.strict,
            observation: observation.clone(),
        };

        let config = Arc::new(client::Config::default());

        let connected = tokio::time::timeout(
            DIAL_TIMEOUT,
            client::connect(config, (target.host.as_str(), target.port), handler),
        )
        .await
        .map_err(|_| Error::Timeout {
            instance_id: target.instance_id,
            timeout: DIAL_TIMEOUT,
        })?;

        let mut handle = match connected {
            Ok(handle) => handle,
            Err(russh::Error::UnknownKey) => {
                let observed = observation.lock().expect("observation lock").clone();

                return Err(Error::HostKeyChanged {
                    instance_id: target.instance_id,
                    pinned: target.pinned,
                    observed: observed.fingerprint,
                });
            }
            Err(russh::Error::IO(source)) => {
                return Err(Error::Dial {
                    instance_id: target.instance_id,
                    address: format!("{}:{}", target.host, target.port),
                    source,
                });
            }
            Err(err) => {
                return Err(Error::Handshake {
                    instance_id: target.instance_id,
                    detail: err.to_string(),
                });
            }
        };

        let authenticated = handle
            .authenticate_publickey(target.user.as_str(), target.key.clone())
            .await
            .map_err(|err| Error::Handshake {
                instance_id: target.instance_id,
                detail: err.to_string(),
            })?;

        if !authenticated {
            return Err(Error::Auth {
                instance_id: target.instance_id,
            });
        }

        let observed = observation.lock().expect("observation lock").clone();

        Ok(Dialed {
            transport: Box::new(Remote { handle }),
            observed_fingerprint: observed.fingerprint,
            changed: observed.changed,
        })
    }
}

struct Remote {
    handle: client::Handle<ClientHandler>,
}

#[async_trait::async_trait]
impl Transport for Remote {
    async fn open_labeled(&self, label: ServiceLabel) -> Result<BoxedStream> {
        let channel = self.handle.channel_open_session().await?;

        let mut stream = channel.into_stream();
        stream.write_all(format!("{label}\n").as_bytes()).await?;

        Ok(Box::new(stream))
    }

    async fn open_direct(&self, remote_port: u16) -> Result<BoxedStream> {
        let channel = self
            .handle
            .channel_open_direct_tcpip("127.0.0.1", u32::from(remote_port), "127.0.0.1", 0)
            .await?;

        Ok(Box::new(channel.into_stream()))
    }

    async fn open_pty(&self) -> Result<Box<dyn Pty>> {
        let channel = self.handle.channel_open_session().await?;

        let mut writer = Box::new(channel.make_writer());
        writer
            .write_all(format!("{}\n", ServiceLabel::Terminal).as_bytes())
            .await?;

        Ok(Box::new(RemotePty { channel, writer }))
    }

    async fn close(&self) {
        let _unused = self
            .handle
            .disconnect(Disconnect::ByApplication, "closed", "")
            .await;
    }

    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }
}

struct RemotePty {
    channel: Channel<Msg>,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
}

#[async_trait::async_trait]
impl Pty for RemotePty {
    async fn resize(&mut self, cols: u16, rows: u16) -> Result<()> {
        self.channel
            .window_change(u32::from(cols), u32::from(rows), 0, 0)
            .await?;

        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data).await?;
        self.writer.flush().await?;

        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            match self.channel.wait().await {
                Some(ChannelMsg::Data { data }) => return Ok(Some(data.to_vec())),
                Some(ChannelMsg::ExtendedData { data, .. }) => return Ok(Some(data.to_vec())),
                Some(ChannelMsg::Eof | ChannelMsg::Close) | None => return Ok(None),
                Some(_) => {}
            }
        }
    }
}
