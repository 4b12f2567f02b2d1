use eyre::Result;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use warp::{
    reply::{Reply, Response},
    ws::{Message, WebSocket, Ws},
};

use super::{Ctx, MAX_FRAME_BYTES};
use crate::audit::Kind;

pub fn upgrade(ctx: Ctx, upgrade: Ws) -> Response {
    upgrade
        .max_message_size(MAX_FRAME_BYTES)
        .max_frame_size(MAX_FRAME_BYTES)
        .on_upgrade(move |client| async move {
            if let Err(err) = relay(client, ctx).await {
                tracing::debug!(%err, "terminal relay ended");
            }
        })
        .into_response()
}

/// Interactive shell relay. Binary frames carry the byte stream; text frames
/// are control-only. A well-formed resize becomes a window-change on the
/// upstream; anything else is ignored and never breaks the session.
async fn relay(client: WebSocket, ctx: Ctx) -> Result<()> {
    let session = ctx.core.connections.ensure_connected(ctx.instance.id).await?;
    let mut pty = session.open_pty().await?;

    ctx.event(Kind::ShellSessionOpened, String::new());

    let (mut client_tx, mut client_rx) = client.split();

    loop {
        tokio::select! {
            inbound = client_rx.next() => match inbound {
                Some(Ok(message)) if message.is_text() => {
                    if let Some((cols, rows)) = parse_resize(message.to_str().unwrap_or_default()) {
                        pty.resize(cols, rows).await?;
                    }
                }
                Some(Ok(message)) if message.is_binary() => {
                    pty.send(message.as_bytes()).await?;
                }
                Some(Ok(message)) if message.is_close() => break,
                Some(Ok(_)) => {}
                _ => break,
            },
            outbound = pty.recv() => match outbound {
                Ok(Some(data)) => client_tx.send(Message::binary(data)).await?,
                _ => break,
            },
        }
    }

    let _unused = client_tx.send(Message::close()).await;

    ctx.event(Kind::ShellSessionClosed, String::new());

    Ok(())
}

#[derive(Deserialize)]
struct Control {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    cols: i64,
    #[serde(default)]
    rows: i64,
}

/// `{"type":"resize","cols":C,"rows":R}` with both dimensions in (0, 65535].
fn parse_resize(text: &str) -> Option<(u16, u16)> {
    let control: Control = serde_json::from_str(text).ok()?;

    if control.kind != "resize" {
        return None;
    }

    let cols = u16::try_from(control.cols).ok().filter(|c| *c > 0)?;
    let rows = u16::try_from(control.rows).ok().filter(|r| *r > 0)?;

    Some((cols, rows))
}
