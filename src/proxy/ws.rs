use eyre::Result;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::{self, protocol::WebSocketConfig};
use warp::{
    path::Tail,
    reply::{Reply, Response},
    ws::{Message, WebSocket, Ws},
};

use super::{http::path_with_query, Ctx, MAX_FRAME_BYTES};
use crate::tunnel::ServiceLabel;

/// Accept the client upgrade and bridge it onto a fresh channel. The offered
/// subprotocol list travels to the upstream handshake verbatim; the first
/// offer is echoed back on the 101 so strict clients accept the reply.
pub fn upgrade(
    ctx: Ctx,
    label: ServiceLabel,
    tail: &Tail,
    query: &str,
    protocols: Option<String>,
    upgrade: Ws,
) -> Response {
    let path = path_with_query(tail, query);
    let offered = protocols.clone();

    let reply = upgrade
        .max_message_size(MAX_FRAME_BYTES)
        .max_frame_size(MAX_FRAME_BYTES)
        .on_upgrade(move |client| async move {
            if let Err(err) = relay(client, ctx, label, path, offered).await {
                tracing::debug!(%label, %err, "websocket relay ended");
            }
        });

    match protocols.and_then(|list| list.split(',').next().map(|p| p.trim().to_string())) {
        Some(first) => {
            warp::reply::with_header(reply, "sec-websocket-protocol", first).into_response()
        }
        None => reply.into_response(),
    }
}

async fn relay(
    client: WebSocket,
    ctx: Ctx,
    label: ServiceLabel,
    path: String,
    protocols: Option<String>,
) -> Result<()> {
    let session = ctx.core.connections.ensure_connected(ctx.instance.id).await?;
    let stream = session.open_labeled(label).await?;

    let mut request = tungstenite::handshake::client::Request::builder()
        .uri(format!("ws://{label}{path}"))
        .header("host", label.to_string());

    if let Some(protocols) = &protocols {
        request = request.header("sec-websocket-protocol", protocols.clone());
    }

    let config = WebSocketConfig {
        max_message_size: Some(MAX_FRAME_BYTES),
        max_frame_size: Some(MAX_FRAME_BYTES),
        ..WebSocketConfig::default()
    };

    let (upstream, _response) =
        tokio_tungstenite::client_async_with_config(request.body(())?, stream, Some(config))
            .await?;

    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    // One loop, two directions: either side failing or closing tears both
    // down, and per-direction ordering rides on the underlying streams.
    loop {
        tokio::select! {
            inbound = client_rx.next() => match inbound {
                Some(Ok(message)) if message.is_text() => {
                    let text = message.to_str().unwrap_or_default().to_string();
                    upstream_tx.send(tungstenite::Message::Text(text)).await?;
                }
                Some(Ok(message)) if message.is_binary() => {
                    upstream_tx
                        .send(tungstenite::Message::Binary(message.into_bytes()))
                        .await?;
                }
                Some(Ok(message)) if message.is_close() => break,
                Some(Ok(_)) => {}
                _ => break,
            },
            outbound = upstream_rx.next() => match outbound {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    client_tx.send(Message::text(text)).await?;
                }
                Some(Ok(tungstenite::Message::Binary(data))) => {
                    client_tx.send(Message::binary(data)).await?;
                }
                Some(Ok(tungstenite::Message::Close(_))) => break,
                Some(Ok(_)) => {}
                _ => break,
            },
        }
    }

    // Normal closure both ways; either side may already be gone.
    let _unused = client_tx.send(Message::close()).await;
    let _unused = upstream_tx
        .send(tungstenite::Message::Close(None))
        .await;

    Ok(())
}
