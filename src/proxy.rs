pub mod api;
pub mod http;
pub mod restrict;
pub mod terminal;
pub mod ws;

use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use warp::{
    filters::BoxedFilter,
    http::StatusCode,
    reply::{Reply, Response},
    Filter, Rejection,
};

use crate::{
    audit::{EventBuilder, Kind},
    core::Core,
    health,
    instance::Instance,
    ssh,
    tunnel::ServiceLabel,
};

/// Identity installed by the upstream auth middleware; the core trusts it.
pub const USER_HEADER: &str = "x-tether-user";
/// Present (as `true`) only on requests the upstream middleware marked admin.
pub const ADMIN_HEADER: &str = "x-tether-admin";

pub const MAX_FRAME_BYTES: usize = 4 << 20;

/// Everything a handler needs once a request has cleared access control.
pub struct Ctx {
    pub core: Arc<Core>,
    pub instance: Instance,
    pub user: String,
    pub source: Option<SocketAddr>,
}

impl Ctx {
    pub fn source_ip(&self) -> String {
        self.source.map(|addr| addr.ip().to_string()).unwrap_or_default()
    }

    pub fn event(&self, kind: Kind, detail: String) {
        self.core.audit.record(
            EventBuilder::default()
                .instance_id(self.instance.id)
                .instance_name(self.instance.name.clone())
                .username(self.user.clone())
                .source_ip(self.source_ip())
                .kind(kind)
                .detail(detail)
                .build()
                .expect("audit event"),
        );
    }
}

#[derive(Debug)]
pub enum Deny {
    BadRequest(String),
    Forbidden(String),
    NotFound(String),
    RateLimited { retry_after: u64 },
    BadGateway(String),
    Internal(String),
}

impl warp::reject::Reject for Deny {}

/// Transport-level failures mapped onto the status codes the surface
/// promises: 503 + Retry-After for the limiter, 404 for unknown ids, 502 for
/// everything the proxy could not carry.
pub(crate) fn unavailable(err: ssh::Error) -> Rejection {
    match err {
        ssh::Error::RateLimited(limited) => Deny::RateLimited {
            retry_after: limited.retry_after.as_secs().max(1),
        }
        .into(),
        ssh::Error::Unknown { instance_id } => {
            Deny::NotFound(format!("instance {instance_id}")).into()
        }
        err => Deny::BadGateway(err.to_string()).into(),
    }
}

pub(crate) fn with_core(core: Arc<Core>) -> impl Filter<Extract = (Arc<Core>,), Error = Infallible> + Clone {
    warp::any().map(move || core.clone())
}

pub(crate) fn raw_query() -> impl Filter<Extract = (String,), Error = Infallible> + Clone {
    warp::query::raw()
        .or(warp::any().map(String::new))
        .unify()
}

/// `/instances/{id}/{segment}…` prefix: the segment matches before the access
/// checks run, so a request only ever authorizes against its own route.
pub(crate) fn instance_scope(
    core: Arc<Core>,
    segment: &'static str,
) -> impl Filter<Extract = (Ctx,), Error = Rejection> + Clone {
    warp::path("instances")
        .and(warp::path::param::<String>())
        .and(warp::path(segment))
        .and(warp::header::optional::<String>(USER_HEADER))
        .and(warp::addr::remote())
        .and(with_core(core))
        .and_then(authorize)
}

async fn authorize(
    raw_id: String,
    user: Option<String>,
    source: Option<SocketAddr>,
    core: Arc<Core>,
) -> Result<Ctx, Rejection> {
    let instance_id: i64 = raw_id
        .parse()
        .map_err(|_| Deny::BadRequest(format!("invalid instance id {raw_id:?}")))?;

    let user = user.unwrap_or_default();

    if !core.can_access(&user, instance_id) {
        return Err(Deny::Forbidden("access denied".to_string()).into());
    }

    let instance = core
        .registry
        .get(instance_id)
        .await
        .map_err(|err| Deny::Internal(format!("{err:#}")))?
        .ok_or_else(|| Deny::NotFound(format!("instance {instance_id}")))?;

    // Stored restrictions were validated when configured; a row that fails to
    // parse here fails closed.
    let restriction = restrict::Restriction::parse(&instance.allowed_source_ips)
        .map_err(|err| Deny::Forbidden(err.to_string()))?;

    let ctx = Ctx {
        core,
        instance,
        user,
        source,
    };

    if let Some(ip) = ctx.source.map(|addr| addr.ip()) {
        if let Err(err) = restriction.check(instance_id, ip) {
            ctx.event(Kind::IpRestricted, err.to_string());
            return Err(Deny::Forbidden(err.to_string()).into());
        }
    }

    Ok(ctx)
}

/// WS upgrade plus plain HTTP fallback for one proxied service. The upgrade
/// filter sits in front of the access checks so plain requests fall through
/// to the HTTP branch before authorizing.
fn service(core: Arc<Core>, segment: &'static str, label: ServiceLabel) -> BoxedFilter<(Response,)> {
    let upgrade = warp::ws()
        .and(instance_scope(core.clone(), segment))
        .and(warp::path::tail())
        .and(raw_query())
        .and(warp::header::optional::<String>("sec-websocket-protocol"))
        .map(
            move |upgrade: warp::ws::Ws,
                  ctx: Ctx,
                  tail: warp::path::Tail,
                  query: String,
                  protocols: Option<String>| {
                ws::upgrade(ctx, label, &tail, &query, protocols, upgrade)
            },
        )
        .boxed();

    let plain = instance_scope(core, segment)
        .and(warp::path::tail())
        .and(raw_query())
        .and(warp::method())
        .and(warp::header::headers_cloned())
        .and(warp::body::bytes())
        .and_then(
            move |ctx: Ctx,
                  tail: warp::path::Tail,
                  query: String,
                  method: warp::http::Method,
                  headers: warp::http::HeaderMap,
                  body: bytes::Bytes| {
                http::relay(ctx, label, tail, query, method, headers, body)
            },
        )
        .boxed();

    upgrade.or(plain).unify().boxed()
}

pub fn routes(core: Arc<Core>) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let desktop = service(core.clone(), "desktop", ServiceLabel::Neko);
    let gateway = service(core.clone(), "gateway", ServiceLabel::Gateway);
    let files = service(core.clone(), "files", ServiceLabel::Files);

    let terminal = warp::ws()
        .and(instance_scope(core.clone(), "terminal"))
        .and(warp::path::end())
        .map(|upgrade: warp::ws::Ws, ctx: Ctx| terminal::upgrade(ctx, upgrade))
        .boxed();

    let logs = instance_scope(core.clone(), "logs")
        .and(warp::path::end())
        .and(warp::get())
        .and(raw_query())
        .and_then(api::logs)
        .boxed();

    let observability = warp::path("metrics")
        .and(warp::path::end())
        .and(warp::get())
        .and_then(|| async { health::metrics().await.map(Reply::into_response) })
        .or(warp::path("healthz")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(|| async { health::healthz().await.map(Reply::into_response) }))
        .unify()
        .boxed();

    desktop
        .or(gateway)
        .or(files)
        .or(terminal)
        .or(logs)
        .or(api::routes(core))
        .or(observability)
        .recover(recover)
}

async fn recover(rejection: Rejection) -> Result<Response, Infallible> {
    if let Some(deny) = rejection.find::<Deny>() {
        let (status, message, retry_after) = match deny {
            Deny::BadRequest(message) => (StatusCode::BAD_REQUEST, message.clone(), None),
            Deny::Forbidden(message) => (StatusCode::FORBIDDEN, message.clone(), None),
            Deny::NotFound(message) => (StatusCode::NOT_FOUND, message.clone(), None),
            Deny::RateLimited { retry_after } => (
                StatusCode::SERVICE_UNAVAILABLE,
                "rate limited".to_string(),
                Some(*retry_after),
            ),
            Deny::BadGateway(message) => (StatusCode::BAD_GATEWAY, message.clone(), None),
            Deny::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message.clone(), None),
        };

        let body = warp::reply::json(&serde_json::json!({ "error": message }));
        let reply = warp::reply::with_status(body, status);

        return Ok(match retry_after {
            Some(secs) => {
                warp::reply::with_header(reply, "retry-after", secs.to_string()).into_response()
            }
            None => reply.into_response(),
        });
    }

    if rejection.is_not_found() {
        let body = warp::reply::json(&serde_json::json!({ "error": "not found" }));
        return Ok(warp::reply::with_status(body, StatusCode::NOT_FOUND).into_response());
    }

    if rejection
        .find::<warp::reject::MethodNotAllowed>()
        .is_some()
    {
        let body = warp::reply::json(&serde_json::json!({ "error": "method not allowed" }));
        return Ok(
            warp::reply::with_status(body, StatusCode::METHOD_NOT_ALLOWED).into_response(),
        );
    }

    let body = warp::reply::json(&serde_json::json!({ "error": "bad request" }));
    Ok(warp::reply::with_status(body, StatusCode::BAD_REQUEST).into_response())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::{SinkExt, StreamExt};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::{
        core::{testutil::harness, CoreBuilder},
        instance::{fixture, Registry, Status},
        ssh::testutil::FakeDialer,
    };

    async fn wait_for<T>(mut probe: impl FnMut() -> Option<T>) -> T {
        for _ in 0..500 {
            if let Some(found) = probe() {
                return found;
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        panic!("condition never became true");
    }

    async fn far_stream(dialer: &FakeDialer, label: &str) -> tokio::io::DuplexStream {
        wait_for(|| {
            let transports = dialer.transports.lock().unwrap();

            for transport in transports.iter() {
                let mut peers = transport.peers.lock().unwrap();
                if let Some(at) = peers.iter().position(|(name, _)| name == label) {
                    return Some(peers.remove(at).1);
                }
            }

            None
        })
        .await
    }

    #[tokio::test]
    async fn malformed_instance_id_is_a_bad_request() {
        let h = harness(vec![fixture(1, Status::Running)]);

        let response = warp::test::request()
            .path("/instances/nope/ssh-status")
            .reply(&routes(h.core.clone()))
            .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn access_predicate_denies_with_403() {
        let h = harness(vec![fixture(1, Status::Running)]);

        let denied = std::sync::Arc::new(
            CoreBuilder::default()
                .registry(h.core.registry.clone())
                .keys(h.core.keys.clone())
                .audit(h.core.audit.clone())
                .connections(h.core.connections.clone())
                .tunnels(h.core.tunnels.clone())
                .access(std::sync::Arc::new(|_: &str, _: i64| false))
                .config(h.core.config.clone())
                .build()
                .unwrap(),
        );

        let response = warp::test::request()
            .path("/instances/1/ssh-status")
            .reply(&routes(denied))
            .await;

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn unknown_instance_is_not_found() {
        let h = harness(vec![fixture(1, Status::Running)]);

        let response = warp::test::request()
            .path("/instances/99/ssh-status")
            .reply(&routes(h.core.clone()))
            .await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn ssh_status_reports_a_healthy_instance() {
        let h = harness(vec![fixture(1, Status::Running)]);

        h.core.connections.ensure_connected(1).await.unwrap();
        h.core.tunnels.start(1).await.unwrap();

        let response = warp::test::request()
            .path("/instances/1/ssh-status")
            .header(USER_HEADER, "operator")
            .reply(&routes(h.core.clone()))
            .await;

        assert_eq!(response.status(), StatusCode::OK);

        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["state"], "connected");
        assert_eq!(body["tunnel_count"], 2);
        assert_eq!(body["healthy_tunnels"], 2);
        assert_eq!(body["reconnect_count"], 0);
    }

    #[tokio::test]
    async fn ssh_test_reports_latency() {
        let h = harness(vec![fixture(1, Status::Running)]);

        let response = warp::test::request()
            .method("POST")
            .path("/instances/1/ssh-test")
            .reply(&routes(h.core.clone()))
            .await;

        assert_eq!(response.status(), StatusCode::OK);

        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn rotation_requires_the_admin_marker() {
        let h = harness(vec![fixture(1, Status::Running)]);

        let response = warp::test::request()
            .method("POST")
            .path("/instances/1/rotate-ssh-key")
            .reply(&routes(h.core.clone()))
            .await;

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn allowed_ips_validate_at_configuration_time() {
        let h = harness(vec![fixture(1, Status::Running)]);
        let routes = routes(h.core.clone());

        let response = warp::test::request()
            .method("PUT")
            .path("/instances/1/ssh-allowed-ips")
            .body("10.0.0.0/33")
            .reply(&routes)
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = warp::test::request()
            .method("PUT")
            .path("/instances/1/ssh-allowed-ips")
            .body("10.0.0.0/8, 172.16.0.0/12")
            .reply(&routes)
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let row = h.registry.get(1).await.unwrap().unwrap();
        assert_eq!(row.allowed_source_ips, "10.0.0.0/8, 172.16.0.0/12");
    }

    #[tokio::test]
    async fn audit_log_query_filters_and_pages() {
        let h = harness(vec![fixture(1, Status::Running)]);

        h.core.connections.ensure_connected(1).await.unwrap();

        let response = warp::test::request()
            .path("/ssh-audit-logs?instance_id=1&kind=connected&limit=5")
            .reply(&routes(h.core.clone()))
            .await;

        assert_eq!(response.status(), StatusCode::OK);

        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["count"], 1);
        assert_eq!(body["events"][0]["kind"], "connected");
    }

    #[tokio::test]
    async fn cluster_status_rolls_up() {
        let h = harness(vec![fixture(1, Status::Running), fixture(2, Status::Stopped)]);

        h.core.connections.ensure_connected(1).await.unwrap();

        let response = warp::test::request()
            .path("/ssh-status")
            .reply(&routes(h.core.clone()))
            .await;

        assert_eq!(response.status(), StatusCode::OK);

        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["total"], 2);
        assert_eq!(body["connected"], 1);
    }

    #[tokio::test]
    async fn desktop_ws_round_trips_bytes() {
        let h = harness(vec![fixture(1, Status::Running)]);

        // Echo server on the instance side of the neko channel.
        let dialer = h.dialer.clone();
        tokio::spawn(async move {
            let far = far_stream(&dialer, "neko").await;
            let ws = tokio_tungstenite::accept_async(far).await.unwrap();
            let (mut tx, mut rx) = ws.split();

            while let Some(Ok(message)) = rx.next().await {
                if message.is_close() {
                    break;
                }

                tx.send(message).await.unwrap();
            }
        });

        let mut client = warp::test::ws()
            .path("/instances/1/desktop/stream")
            .handshake(routes(h.core.clone()))
            .await
            .expect("upgrade");

        let payload: Vec<u8> = (0..256 * 1024).map(|n| (n % 251) as u8).collect();
        client
            .send(warp::ws::Message::binary(payload.clone()))
            .await;

        let echoed = client.recv().await.expect("echo");
        assert_eq!(echoed.as_bytes(), payload.as_slice());

        client.send(warp::ws::Message::text("ping")).await;
        let echoed = client.recv().await.expect("echo");
        assert_eq!(echoed.to_str().unwrap(), "ping");
    }

    #[tokio::test]
    async fn terminal_relays_and_resizes() {
        let h = harness(vec![fixture(1, Status::Running)]);

        let mut client = warp::test::ws()
            .path("/instances/1/terminal")
            .handshake(routes(h.core.clone()))
            .await
            .expect("upgrade");

        let dialer = h.dialer.clone();
        let driver = wait_for(|| {
            let transports = dialer.transports.lock().unwrap();

            transports
                .iter()
                .find(|transport| !transport.ptys.lock().unwrap().is_empty())
                .map(|transport| transport.ptys.lock().unwrap().remove(0))
        })
        .await;

        client
            .send(warp::ws::Message::binary(b"ls -la\n".to_vec()))
            .await;
        wait_for(|| (!driver.sent.lock().unwrap().is_empty()).then_some(())).await;
        assert_eq!(driver.sent.lock().unwrap()[0], b"ls -la\n");

        // Valid resize lands as a window change; junk is silently ignored.
        client
            .send(warp::ws::Message::text(
                r#"{"type":"resize","cols":120,"rows":40}"#,
            ))
            .await;
        wait_for(|| (!driver.resizes.lock().unwrap().is_empty()).then_some(())).await;
        assert_eq!(driver.resizes.lock().unwrap()[0], (120, 40));

        client
            .send(warp::ws::Message::text(r#"{"type":"resize","cols":0,"rows":40}"#))
            .await;
        client.send(warp::ws::Message::text("garbage")).await;

        driver.to_client.send(b"total 0\n".to_vec()).unwrap();
        let output = client.recv().await.expect("pty output");
        assert_eq!(output.as_bytes(), b"total 0\n");

        assert_eq!(driver.resizes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn files_http_one_shot_is_bridged() {
        let h = harness(vec![fixture(1, Status::Running)]);

        let dialer = h.dialer.clone();
        tokio::spawn(async move {
            let mut far = far_stream(&dialer, "files").await;

            let mut buf = vec![0u8; 4096];
            let mut read = 0;
            while !buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                read += far.read(&mut buf[read..]).await.unwrap();
            }

            let request = String::from_utf8_lossy(&buf[..read]).to_string();
            assert!(request.starts_with("GET /etc/hosts?raw=1 HTTP/1.1\r\n"));
            assert!(request.contains("Host: files\r\n"));

            far.write_all(
                b"HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\n\r\n127.0.0.1 localhost\n",
            )
            .await
            .unwrap();
        });

        let response = warp::test::request()
            .path("/instances/1/files/etc/hosts?raw=1")
            .reply(&routes(h.core.clone()))
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body().as_ref(), b"127.0.0.1 localhost\n");
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/plain",
        );
    }
}
