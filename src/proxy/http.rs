use bytes::Bytes;
use eyre::{bail, eyre, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use warp::{
    http::{HeaderMap, HeaderValue, Method, StatusCode},
    path::Tail,
    reply::Response,
    Rejection,
};

use super::{unavailable, Ctx, Deny};
use crate::{ssh::session::BoxedStream, tunnel::ServiceLabel};

// Hop-by-hop headers stay home; everything here is forwarded verbatim.
const REQUEST_HEADERS: &[&str] = &[
    "accept",
    "accept-encoding",
    "authorization",
    "content-type",
    "cookie",
    "if-modified-since",
    "if-none-match",
    "range",
    "user-agent",
    "x-requested-with",
];

const RESPONSE_HEADERS: &[&str] = &[
    "cache-control",
    "content-disposition",
    "content-type",
    "etag",
    "last-modified",
    "location",
    "set-cookie",
];

// Upstream responses are buffered; anything bigger than this is a defect in
// the proxied service, not a relay concern.
const MAX_RESPONSE_BYTES: usize = 64 << 20;

/// One-shot HTTP relay: a fresh labeled channel per request, an HTTP/1.1
/// exchange over it, and a filtered response back to the caller. Transport
/// trouble is a 502.
pub async fn relay(
    ctx: Ctx,
    label: ServiceLabel,
    tail: Tail,
    query: String,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Rejection> {
    let session = ctx
        .core
        .connections
        .ensure_connected(ctx.instance.id)
        .await
        .map_err(unavailable)?;

    let stream = session.open_labeled(label).await.map_err(unavailable)?;

    let path = path_with_query(&tail, &query);

    exchange(stream, label, &method, &path, &headers, &body)
        .await
        .map_err(|err| {
            tracing::debug!(instance_id = ctx.instance.id, %label, %err, "http relay failed");

            Deny::BadGateway(format!("{err:#}")).into()
        })
}

pub(super) fn path_with_query(tail: &Tail, query: &str) -> String {
    if query.is_empty() {
        format!("/{}", tail.as_str())
    } else {
        format!("/{}?{query}", tail.as_str())
    }
}

async fn exchange(
    mut stream: BoxedStream,
    label: ServiceLabel,
    method: &Method,
    path: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response> {
    let mut request = format!("{method} {path} HTTP/1.1\r\nHost: {label}\r\nConnection: close\r\n");

    for name in REQUEST_HEADERS {
        for value in headers.get_all(*name) {
            if let Ok(value) = value.to_str() {
                request.push_str(&format!("{name}: {value}\r\n"));
            }
        }
    }

    if !body.is_empty() {
        request.push_str(&format!("content-length: {}\r\n", body.len()));
    }

    request.push_str("\r\n");

    stream.write_all(request.as_bytes()).await?;
    if !body.is_empty() {
        stream.write_all(body).await?;
    }
    stream.flush().await?;

    // Connection: close lets us read to EOF instead of framing the body.
    let mut raw = Vec::new();
    stream
        .take(MAX_RESPONSE_BYTES as u64)
        .read_to_end(&mut raw)
        .await?;

    parse_response(&raw)
}

fn parse_response(raw: &[u8]) -> Result<Response> {
    let mut header_storage = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Response::new(&mut header_storage);

    let httparse::Status::Complete(body_at) = parsed.parse(raw)? else {
        bail!("truncated upstream response");
    };

    let status = StatusCode::from_u16(parsed.code.ok_or_else(|| eyre!("missing status code"))?)?;

    let mut response = Response::new(raw[body_at..].to_vec().into());
    *response.status_mut() = status;

    for header in parsed.headers.iter() {
        let name = header.name.to_ascii_lowercase();

        if RESPONSE_HEADERS.contains(&name.as_str()) {
            if let (Ok(name), Ok(value)) = (
                warp::http::header::HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_bytes(header.value),
            ) {
                response.headers_mut().append(name, value);
            }
        }
    }

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_status_headers_and_body() {
        let raw = b"HTTP/1.1 404 Not Found\r\ncontent-type: text/plain\r\nx-internal: 1\r\n\r\nmissing";

        let response = parse_response(raw).unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/plain",
        );
        // Off-whitelist headers are dropped.
        assert!(response.headers().get("x-internal").is_none());
    }

    #[test]
    fn truncated_response_is_an_error() {
        assert!(parse_response(b"HTTP/1.1 200 OK\r\ncontent-ty").is_err());
    }

    #[tokio::test]
    async fn exchange_writes_a_well_formed_request() {
        let (near, mut far) = tokio::io::duplex(64 * 1024);

        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1"));

        let relay = tokio::spawn(async move {
            exchange(
                Box::new(near),
                ServiceLabel::Files,
                &Method::POST,
                "/upload?name=a.txt",
                &headers,
                b"{}",
            )
            .await
        });

        let mut request = vec![0u8; 1024];
        let mut read = 0;
        while !request[..read].windows(4).any(|w| w == b"\r\n\r\n") {
            read += far.read(&mut request[read..]).await.unwrap();
        }
        let text = String::from_utf8_lossy(&request[..read]).to_string();

        assert!(text.starts_with("POST /upload?name=a.txt HTTP/1.1\r\n"));
        assert!(text.contains("Host: files\r\n"));
        assert!(text.contains("content-type: application/json\r\n"));
        assert!(text.contains("content-length: 2\r\n"));
        // Off-whitelist request headers are dropped.
        assert!(!text.contains("x-forwarded-for"));

        far.write_all(b"HTTP/1.1 204 No Content\r\n\r\n").await.unwrap();
        drop(far);

        let response = relay.await.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }
}
