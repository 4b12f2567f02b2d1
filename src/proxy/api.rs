use std::{collections::HashMap, convert::Infallible, sync::Arc};

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use warp::{
    filters::BoxedFilter,
    http::StatusCode,
    reply::{Reply, Response},
    Filter, Rejection,
};

use super::{instance_scope, unavailable, with_core, Ctx, Deny, ADMIN_HEADER};
use crate::{
    audit,
    core::Core,
    identity, ssh, stats,
    tunnel::ServiceLabel,
};

pub fn routes(core: Arc<Core>) -> BoxedFilter<(Response,)> {
    let status = instance_scope(core.clone(), "ssh-status")
        .and(warp::path::end())
        .and(warp::get())
        .and_then(ssh_status)
        .boxed();

    let reconnect = instance_scope(core.clone(), "ssh-reconnect")
        .and(warp::path::end())
        .and(warp::post())
        .and_then(ssh_reconnect)
        .boxed();

    let test = instance_scope(core.clone(), "ssh-test")
        .and(warp::path::end())
        .and(warp::post())
        .and_then(ssh_test)
        .boxed();

    let fingerprint = instance_scope(core.clone(), "ssh-fingerprint")
        .and(warp::path::end())
        .and(warp::get())
        .and_then(ssh_fingerprint)
        .boxed();

    let rotate = instance_scope(core.clone(), "rotate-ssh-key")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::header::optional::<String>(ADMIN_HEADER))
        .and_then(rotate_key)
        .boxed();

    let allowed_ips = instance_scope(core.clone(), "ssh-allowed-ips")
        .and(warp::path::end())
        .and(warp::put())
        .and(warp::body::bytes())
        .and_then(set_allowed_ips)
        .boxed();

    let cluster = warp::path("ssh-status")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_core(core.clone()))
        .and_then(cluster_status)
        .boxed();

    let audit_logs = warp::path("ssh-audit-logs")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_core(core))
        .and(warp::query::<HashMap<String, String>>())
        .and_then(audit_logs)
        .boxed();

    status
        .or(reconnect)
        .unify()
        .or(test)
        .unify()
        .or(fingerprint)
        .unify()
        .or(rotate)
        .unify()
        .or(allowed_ips)
        .unify()
        .or(cluster)
        .unify()
        .or(audit_logs)
        .unify()
        .boxed()
}

async fn ssh_status(ctx: Ctx) -> Result<Response, Rejection> {
    let status = ctx.core.connections.status(ctx.instance.id);
    let tunnels = ctx.core.tunnels.snapshot(ctx.instance.id);

    let uptime_bucket = status.session.as_ref().map(|session| {
        stats::uptime_bucket((Utc::now() - session.established_at).num_seconds())
    });
    let success_rate = status
        .session
        .as_ref()
        .and_then(|session| stats::success_rate(session.successful_probes, session.failed_probes));

    let body = serde_json::json!({
        "instance_id": ctx.instance.id,
        "name": ctx.instance.name,
        "state": status.state,
        "session": status.session,
        "reconnect_count": status.reconnect_count,
        "rate_limit": status.rate_limit,
        "uptime_bucket": uptime_bucket,
        "success_rate": success_rate,
        "tunnel_count": tunnels.len(),
        "healthy_tunnels": ctx.core.tunnels.healthy_count(ctx.instance.id),
        "tunnel_reconnects": ctx.core.tunnels.reconnect_count(ctx.instance.id),
        "tunnels": tunnels,
        "recent_events": ctx.core.audit.recent(ctx.instance.id, 20),
    });

    Ok(warp::reply::json(&body).into_response())
}

async fn ssh_reconnect(ctx: Ctx) -> Result<Response, Rejection> {
    let latency = ctx
        .core
        .connections
        .force_reconnect(ctx.instance.id)
        .await
        .map_err(unavailable)?;

    let body = serde_json::json!({
        "status": "reconnected",
        "latency_ms": latency.as_millis() as u64,
    });

    Ok(warp::reply::json(&body).into_response())
}

/// Probe outcome travels in the body; only the limiter escalates to a 503.
async fn ssh_test(ctx: Ctx) -> Result<Response, Rejection> {
    match ctx.core.connections.probe(ctx.instance.id).await {
        Ok(latency) => {
            let body = serde_json::json!({
                "status": "ok",
                "latency_ms": latency.as_millis() as u64,
            });

            Ok(warp::reply::json(&body).into_response())
        }
        Err(err @ ssh::Error::RateLimited(_)) => Err(unavailable(err)),
        Err(err) => {
            let body = serde_json::json!({
                "status": "error",
                "error": err.to_string(),
            });

            Ok(warp::reply::json(&body).into_response())
        }
    }
}

async fn ssh_fingerprint(ctx: Ctx) -> Result<Response, Rejection> {
    let fingerprint = match ctx.core.keys.load(&ctx.instance.name) {
        Ok(pair) => identity::fingerprint(&pair.public),
        Err(_) => ctx.instance.public_key_fingerprint.clone(),
    };

    if fingerprint.is_empty() {
        return Err(Deny::NotFound(format!(
            "no key material for instance {}",
            ctx.instance.id
        ))
        .into());
    }

    let body = serde_json::json!({
        "fingerprint": fingerprint,
        "algorithm": "ssh-ed25519",
        "verified": ctx.core.connections.get(ctx.instance.id).is_some(),
    });

    Ok(warp::reply::json(&body).into_response())
}

async fn rotate_key(ctx: Ctx, admin: Option<String>) -> Result<Response, Rejection> {
    if admin.as_deref() != Some("true") {
        return Err(Deny::Forbidden("rotation is admin only".to_string()).into());
    }

    match ctx.core.connections.rotate(ctx.instance.id).await {
        Ok(outcome) => {
            let body = serde_json::json!({
                "rotated": true,
                "fingerprint": outcome.fingerprint,
            });

            Ok(warp::reply::json(&body).into_response())
        }
        Err(ssh::Error::Key(identity::Error::RotationPartial {
            instance,
            step,
            detail,
        })) => {
            let body = serde_json::json!({
                "rotated": false,
                "instance": instance,
                "step": step,
                "error": detail,
            });

            Ok(
                warp::reply::with_status(warp::reply::json(&body), StatusCode::INTERNAL_SERVER_ERROR)
                    .into_response(),
            )
        }
        Err(err) => Err(unavailable(err)),
    }
}

async fn set_allowed_ips(ctx: Ctx, body: bytes::Bytes) -> Result<Response, Rejection> {
    let csv = String::from_utf8(body.to_vec())
        .map_err(|_| Deny::BadRequest("body must be utf-8".to_string()))?
        .trim()
        .to_string();

    // Validated here, at configuration time; requests never see a parse.
    super::restrict::Restriction::parse(&csv).map_err(|err| Deny::BadRequest(err.to_string()))?;

    ctx.core
        .registry
        .set_allowed_ips(ctx.instance.id, &csv)
        .await
        .map_err(|err| Deny::Internal(format!("{err:#}")))?;

    let body = serde_json::json!({ "allowed_source_ips": csv });
    Ok(warp::reply::json(&body).into_response())
}

async fn cluster_status(core: Arc<Core>) -> Result<Response, Rejection> {
    let cluster = stats::cluster(&core)
        .await
        .map_err(|err| Deny::Internal(format!("{err:#}")))?;

    Ok(warp::reply::json(&cluster).into_response())
}

async fn audit_logs(
    core: Arc<Core>,
    params: HashMap<String, String>,
) -> Result<Response, Rejection> {
    let mut query = audit::Query {
        offset: 0,
        limit: Some(100),
        ..audit::Query::default()
    };

    if let Some(raw) = params.get("instance_id") {
        query.instance_id =
            Some(raw.parse().map_err(|_| {
                Deny::BadRequest(format!("invalid instance_id {raw:?}"))
            })?);
    }

    if let Some(user) = params.get("user") {
        query.username = Some(user.clone());
    }

    if let Some(raw) = params.get("kind") {
        query.kind = Some(
            raw.parse()
                .map_err(|_| Deny::BadRequest(format!("unknown event kind {raw:?}")))?,
        );
    }

    if let Some(raw) = params.get("from") {
        query.from = Some(parse_time(raw)?);
    }

    if let Some(raw) = params.get("until") {
        query.until = Some(parse_time(raw)?);
    }

    if let Some(raw) = params.get("offset") {
        query.offset = raw
            .parse()
            .map_err(|_| Deny::BadRequest(format!("invalid offset {raw:?}")))?;
    }

    if let Some(raw) = params.get("limit") {
        let limit: usize = raw
            .parse()
            .map_err(|_| Deny::BadRequest(format!("invalid limit {raw:?}")))?;
        query.limit = Some(limit.min(1000));
    }

    let events = core.audit.query(&query);

    let body = serde_json::json!({
        "count": events.len(),
        "events": events,
    });

    Ok(warp::reply::json(&body).into_response())
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, Rejection> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|_| Deny::BadRequest(format!("invalid timestamp {raw:?}")).into())
}

/// Tail the remote log channel as a `text/event-stream`.
pub async fn logs(ctx: Ctx, query: String) -> Result<Response, Rejection> {
    let params: HashMap<&str, &str> = query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .collect();

    let tail: u32 = params
        .get("tail")
        .map_or(Ok(100), |raw| raw.parse())
        .map_err(|_| Deny::BadRequest("invalid tail".to_string()))?;
    let follow = matches!(params.get("follow").copied(), Some("true" | "1"));

    let session = ctx
        .core
        .connections
        .ensure_connected(ctx.instance.id)
        .await
        .map_err(unavailable)?;

    let mut stream = session
        .open_labeled(ServiceLabel::Logs)
        .await
        .map_err(unavailable)?;

    stream
        .write_all(format!("tail={tail} follow={}\n", u8::from(follow)).as_bytes())
        .await
        .map_err(|err| Deny::BadGateway(err.to_string()))?;

    let lines = BufReader::new(stream).lines();

    let events = futures::stream::unfold(lines, |mut lines| async move {
        match lines.next_line().await {
            Ok(Some(line)) => Some((
                Ok::<_, Infallible>(warp::sse::Event::default().data(line)),
                lines,
            )),
            _ => None,
        }
    });

    Ok(warp::sse::reply(warp::sse::keep_alive().stream(events)).into_response())
}
