use std::sync::{atomic::AtomicU64, Arc};

use eyre::Result;
use tokio::{net::TcpListener, task::JoinSet};
use tokio_util::sync::CancellationToken;

use super::{
    channel::CountingStream,
    metrics::{STREAM_ACTIVE, STREAM_BYTES, STREAM_TOTAL},
    Kind, ServiceLabel,
};
use crate::ssh::{session::BoxedStream, Session};

/// Where each accepted local connection is bridged to: a labeled multiplexed
/// stream, or a direct forward to a remote port.
#[derive(Debug, Clone, Copy)]
pub enum Target {
    Label(ServiceLabel),
    Port(u16),
}

impl Target {
    async fn open(self, session: &Session) -> Result<BoxedStream, crate::ssh::Error> {
        match self {
            Self::Label(label) => session.open_labeled(label).await,
            Self::Port(port) => session.open_direct(port).await,
        }
    }
}

/// Bind a loopback listener and bridge until cancelled. Returns the bound
/// port; the accept loop runs in its own task.
pub(super) async fn bind(
    session: Arc<Session>,
    kind: Kind,
    bytes: Arc<AtomicU64>,
    cancel: CancellationToken,
) -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let local_port = listener.local_addr()?.port();

    tokio::spawn(accept(listener, session, kind, bytes, cancel));

    Ok(local_port)
}

async fn accept(
    listener: TcpListener,
    session: Arc<Session>,
    kind: Kind,
    bytes: Arc<AtomicU64>,
    cancel: CancellationToken,
) {
    let service = kind.to_string();
    let mut tasks: JoinSet<Result<()>> = JoinSet::new();

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let Ok((socket, peer)) = accepted else { break };

                let remote = match kind.target().open(&session).await {
                    Ok(remote) => remote,
                    Err(err) => {
                        tracing::debug!(%service, %err, "remote stream open failed");

                        if !session.healthy() {
                            // The channel dies with its transport.
                            break;
                        }

                        continue;
                    }
                };

                tracing::debug!(%service, %peer, "forward stream opened");
                STREAM_TOTAL.with_label_values(&[&service]).inc();
                STREAM_ACTIVE.with_label_values(&[&service]).inc();

                // Reap one finished stream per accept so the set stays small.
                if let Some(result) = tasks.try_join_next() {
                    let _unused = result;
                }

                let bytes = bytes.clone();
                let service = service.clone();

                tasks.spawn(async move {
                    let mut local = socket;
                    let mut remote = CountingStream::new(remote, bytes);

                    let copied =
                        tokio::io::copy_bidirectional(&mut local, &mut remote).await;

                    STREAM_ACTIVE.with_label_values(&[&service]).dec();

                    let (outgoing, incoming) = copied?;
                    STREAM_BYTES
                        .with_label_values(&[&service, "outgoing"])
                        .inc_by(outgoing);
                    STREAM_BYTES
                        .with_label_values(&[&service, "incoming"])
                        .inc_by(incoming);

                    tracing::debug!(%service, outgoing, incoming, "forward stream closed");

                    Ok(())
                });
            }
        }
    }

    // Whether cancelled from outside or dead on its own, the owning channel
    // observes the same cancelled token.
    cancel.cancel();
    tasks.abort_all();
}
