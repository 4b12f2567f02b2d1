use chrono::Utc;
use eyre::Result;
use itertools::Itertools;
use serde::Serialize;

use crate::{core::Core, ssh};

/// Coarse uptime buckets for fleet dashboards.
pub fn uptime_bucket(established_secs: i64) -> &'static str {
    match established_secs {
        s if s < 3600 => "<1h",
        s if s < 6 * 3600 => "1-6h",
        s if s < 24 * 3600 => "6-24h",
        s if s < 7 * 24 * 3600 => "1-7d",
        _ => ">7d",
    }
}

/// Keepalive success rate; `None` until the first probe lands.
pub fn success_rate(successful: u64, failed: u64) -> Option<f64> {
    let total = successful + failed;

    if total == 0 {
        return None;
    }

    let rate = successful as f64 / total as f64;

    Some(rate)
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceSummary {
    pub instance_id: i64,
    pub name: String,
    pub state: ssh::State,
    pub uptime_bucket: Option<&'static str>,
    pub success_rate: Option<f64>,
    pub reconnect_count: u64,
    pub tunnel_count: usize,
    pub healthy_tunnels: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Cluster {
    pub instances: Vec<InstanceSummary>,
    pub connected: usize,
    pub total: usize,
}

/// Fleet roll-up computed on demand from live session and tunnel state.
pub async fn cluster(core: &Core) -> Result<Cluster> {
    let rows = core.registry.list().await?;
    let total = rows.len();

    let instances: Vec<InstanceSummary> = rows
        .into_iter()
        .map(|row| {
            let status = core.connections.status(row.id);

            let uptime = status.session.as_ref().map(|session| {
                uptime_bucket((Utc::now() - session.established_at).num_seconds())
            });
            let rate = status
                .session
                .as_ref()
                .and_then(|session| success_rate(session.successful_probes, session.failed_probes));

            InstanceSummary {
                instance_id: row.id,
                name: row.name,
                state: status.state,
                uptime_bucket: uptime,
                success_rate: rate,
                reconnect_count: status.reconnect_count,
                tunnel_count: core.tunnels.snapshot(row.id).len(),
                healthy_tunnels: core.tunnels.healthy_count(row.id),
            }
        })
        .sorted_by_key(|summary| summary.instance_id)
        .collect();

    let connected = instances
        .iter()
        .filter(|summary| summary.state == ssh::State::Connected)
        .count();

    Ok(Cluster {
        instances,
        connected,
        total,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uptime_buckets() {
        assert_eq!(uptime_bucket(30), "<1h");
        assert_eq!(uptime_bucket(3600), "1-6h");
        assert_eq!(uptime_bucket(7 * 3600), "6-24h");
        assert_eq!(uptime_bucket(36 * 3600), "1-7d");
        assert_eq!(uptime_bucket(8 * 24 * 3600), ">7d");
    }

    #[test]
    fn success_rates() {
        assert_eq!(success_rate(0, 0), None);
        assert_eq!(success_rate(3, 1), Some(0.75));
        assert_eq!(success_rate(0, 4), Some(0.0));
    }
}
