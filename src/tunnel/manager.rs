use std::{
    collections::HashMap,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use eyre::{Result, WrapErr};
use futures::FutureExt;
use tokio::{net::TcpStream, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    channel::{self, Channel, Metrics},
    metrics::{PROBE_FAILURES, TUNNELS_ACTIVE, TUNNEL_RECONNECTS},
    Kind, ServiceLabel, EXPECTED,
};
use crate::{
    audit::{self, EventBuilder},
    ssh,
};

pub const MONITOR_INTERVAL: Duration = Duration::from_secs(10);
pub const PROBE_INTERVAL: Duration = Duration::from_secs(60);
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const BACKOFF_FLOOR: Duration = Duration::from_secs(1);
const BACKOFF_CEILING: Duration = Duration::from_secs(60);

struct Entry {
    channels: HashMap<Kind, Arc<Channel>>,
    expected: Vec<Kind>,
    backoff: HashMap<Kind, (Duration, tokio::time::Instant)>,
    cancel: CancellationToken,
    monitor: JoinHandle<()>,
}

/// Keeps the standing tunnel set alive per instance: the desktop and gateway
/// pair, plus ad-hoc custom forwards. A per-instance monitor recreates what
/// closes; a global probe detects tunnels that stopped answering.
pub struct Manager {
    connections: Arc<ssh::Manager>,
    audit: Arc<audit::Log>,
    registry: RwLock<HashMap<i64, Entry>>,
    // Monotonic per instance; survives start/stop cycles.
    reconnects: RwLock<HashMap<i64, u64>>,
    probe: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Manager {
    pub fn new(connections: Arc<ssh::Manager>, audit: Arc<audit::Log>) -> Self {
        Self {
            connections,
            audit,
            registry: RwLock::new(HashMap::new()),
            reconnects: RwLock::new(HashMap::new()),
            probe: Mutex::new(None),
        }
    }

    /// Idempotent: a second start replaces the previous monitor and channel
    /// set cleanly instead of accumulating. All-or-nothing on open.
    pub async fn start(self: &Arc<Self>, instance_id: i64) -> Result<()> {
        let session = self
            .connections
            .ensure_connected(instance_id)
            .await
            .wrap_err("no session for tunnel start")?;

        self.stop(instance_id).await;

        let mut channels = HashMap::new();

        for kind in EXPECTED {
            match channel::open(session.clone(), instance_id, kind).await {
                Ok(opened) => {
                    channels.insert(kind, opened);
                }
                Err(err) => {
                    // Release whatever did open; no partial state survives.
                    for opened in channels.values() {
                        opened.close();
                    }

                    return Err(err).wrap_err("tunnel set incomplete");
                }
            }
        }

        for (kind, opened) in &channels {
            self.record(instance_id, audit::Kind::TunnelOpened, format!(
                "{kind} on 127.0.0.1:{}",
                opened.local_port()
            ));
        }

        TUNNELS_ACTIVE.add(channels.len() as i64);

        let cancel = CancellationToken::new();
        let monitor = tokio::spawn(self.clone().monitor_guarded(instance_id, cancel.clone()));

        self.registry.write().expect("tunnel registry lock").insert(
            instance_id,
            Entry {
                channels,
                expected: EXPECTED.to_vec(),
                backoff: HashMap::new(),
                cancel,
                monitor,
            },
        );

        Ok(())
    }

    /// After this returns no reconnect for the instance can happen until the
    /// next `start`.
    pub async fn stop(&self, instance_id: i64) {
        let entry = self
            .registry
            .write()
            .expect("tunnel registry lock")
            .remove(&instance_id);

        let Some(entry) = entry else { return };

        entry.cancel.cancel();
        let _unused = entry.monitor.await;

        for (kind, channel) in entry.channels {
            channel.close();
            TUNNELS_ACTIVE.dec();
            self.record(instance_id, audit::Kind::TunnelClosed, kind.to_string());
        }
    }

    /// Safe to call twice.
    pub async fn shutdown(&self) {
        if let Some((probe, _)) = self.probe.lock().expect("probe lock").take() {
            probe.cancel();
        }

        let ids: Vec<i64> = self
            .registry
            .read()
            .expect("tunnel registry lock")
            .keys()
            .copied()
            .collect();

        for instance_id in ids {
            self.stop(instance_id).await;
        }
    }

    /// Ad-hoc forward to an arbitrary remote port, monitored like the
    /// standing pair.
    pub async fn open_custom(self: &Arc<Self>, instance_id: i64, remote_port: u16) -> Result<u16> {
        if !self
            .registry
            .read()
            .expect("tunnel registry lock")
            .contains_key(&instance_id)
        {
            self.start(instance_id).await?;
        }

        let session = self.connections.ensure_connected(instance_id).await?;
        let kind = Kind::Custom(remote_port);

        let opened = channel::open(session, instance_id, kind).await?;
        let local_port = opened.local_port();

        let mut registry = self.registry.write().expect("tunnel registry lock");
        let Some(entry) = registry.get_mut(&instance_id) else {
            opened.close();
            return Err(super::Error::NotFound { instance_id, kind }.into());
        };

        if let Some(previous) = entry.channels.insert(kind, opened) {
            previous.close();
        } else {
            entry.expected.push(kind);
            TUNNELS_ACTIVE.inc();
        }

        self.record(
            instance_id,
            audit::Kind::TunnelOpened,
            format!("{kind} on 127.0.0.1:{local_port}"),
        );

        Ok(local_port)
    }

    pub fn local_port(&self, instance_id: i64, kind: Kind) -> Option<u16> {
        self.registry
            .read()
            .expect("tunnel registry lock")
            .get(&instance_id)?
            .channels
            .get(&kind)
            .filter(|channel| !channel.closed())
            .map(|channel| channel.local_port())
    }

    pub fn service_port(&self, instance_id: i64, label: ServiceLabel) -> Option<u16> {
        self.local_port(instance_id, Kind::Service(label))
    }

    pub fn snapshot(&self, instance_id: i64) -> Vec<Metrics> {
        self.registry
            .read()
            .expect("tunnel registry lock")
            .get(&instance_id)
            .map(|entry| entry.channels.values().map(|c| c.metrics()).collect())
            .unwrap_or_default()
    }

    pub fn healthy_count(&self, instance_id: i64) -> usize {
        self.registry
            .read()
            .expect("tunnel registry lock")
            .get(&instance_id)
            .map_or(0, |entry| {
                entry
                    .channels
                    .values()
                    .filter(|channel| !channel.closed())
                    .count()
            })
    }

    pub fn reconnect_count(&self, instance_id: i64) -> u64 {
        self.reconnects
            .read()
            .expect("tunnel reconnect lock")
            .get(&instance_id)
            .copied()
            .unwrap_or_default()
    }

    pub fn instances(&self) -> Vec<i64> {
        self.registry
            .read()
            .expect("tunnel registry lock")
            .keys()
            .copied()
            .collect()
    }

    /// Start the global health probe loop, or respawn it if the previous one
    /// died. A live loop is left alone, so this is cheap to call every
    /// reconcile tick.
    pub fn start_probe(self: &Arc<Self>) {
        let mut slot = self.probe.lock().expect("probe lock");

        if let Some((_, task)) = slot.as_ref() {
            if !task.is_finished() {
                return;
            }
        }

        if let Some((old, _)) = slot.take() {
            old.cancel();
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(self.clone().probe_guarded(cancel.clone()));

        *slot = Some((cancel, task));
    }

    async fn probe_guarded(self: Arc<Self>, cancel: CancellationToken) {
        let probe = AssertUnwindSafe(self.clone().probe_loop(cancel)).catch_unwind();

        if let Err(payload) = probe.await {
            // Fleet-wide loop; 0 marks an event with no owning instance.
            self.record(
                0,
                audit::Kind::SupervisionPanic,
                format!("health probe: {}", audit::panic_detail(payload.as_ref())),
            );
        }
    }

    async fn probe_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(PROBE_INTERVAL);
        tick.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = tick.tick() => {}
            }

            self.probe_once().await;
        }
    }

    async fn probe_once(&self) {
        let targets: Vec<(i64, Arc<Channel>)> = {
            let registry = self.registry.read().expect("tunnel registry lock");

            registry
                .iter()
                .flat_map(|(instance_id, entry)| {
                    entry
                        .channels
                        .values()
                        .filter(|channel| !channel.closed() && channel.local_port() != 0)
                        .map(|channel| (*instance_id, channel.clone()))
                        .collect::<Vec<_>>()
                })
                .collect()
        };

        for (instance_id, channel) in targets {
            let dialed = tokio::time::timeout(
                PROBE_TIMEOUT,
                TcpStream::connect(("127.0.0.1", channel.local_port())),
            )
            .await;

            match dialed {
                Ok(Ok(_)) => channel.probe_success(),
                Ok(Err(err)) => self.mark_unhealthy(instance_id, &channel, err.to_string()),
                Err(_) => self.mark_unhealthy(
                    instance_id,
                    &channel,
                    format!("probe timed out after {PROBE_TIMEOUT:?}"),
                ),
            }
        }
    }

    fn mark_unhealthy(&self, instance_id: i64, channel: &Channel, detail: String) {
        warn!(instance_id, kind = %channel.kind(), %detail, "tunnel unhealthy");

        channel.probe_failure(detail.clone());
        channel.close();
        PROBE_FAILURES.inc();

        self.record(
            instance_id,
            audit::Kind::TunnelUnhealthy,
            format!("{}: {detail}", channel.kind()),
        );
    }

    /// A panicking monitor must not leave its instance registered with
    /// nothing reconciling it: the panic becomes an audit event, the entry is
    /// dropped (without joining the monitor, which is this task), and the
    /// next reconcile tick issues a fresh start.
    async fn monitor_guarded(self: Arc<Self>, instance_id: i64, cancel: CancellationToken) {
        let monitor = AssertUnwindSafe(self.clone().monitor(instance_id, cancel)).catch_unwind();

        if let Err(payload) = monitor.await {
            self.record(
                instance_id,
                audit::Kind::SupervisionPanic,
                format!("tunnel monitor: {}", audit::panic_detail(payload.as_ref())),
            );

            let entry = self
                .registry
                .write()
                .expect("tunnel registry lock")
                .remove(&instance_id);

            if let Some(entry) = entry {
                entry.cancel.cancel();

                for channel in entry.channels.values() {
                    channel.close();
                    TUNNELS_ACTIVE.dec();
                }
            }
        }
    }

    async fn monitor(self: Arc<Self>, instance_id: i64, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(MONITOR_INTERVAL);
        tick.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = tick.tick() => {}
            }

            self.reconcile(instance_id).await;
        }
    }

    /// One monitor pass: sweep closed channels, then recreate whatever the
    /// expected set is missing, with per-label backoff. While no session is
    /// up every channel is torn down and nothing reopens; the session
    /// supervisor owns that recovery and the next tick rebuilds the set.
    async fn reconcile(&self, instance_id: i64) {
        let session = self.connections.get(instance_id);

        let missing: Vec<Kind> = {
            let mut registry = self.registry.write().expect("tunnel registry lock");
            let Some(entry) = registry.get_mut(&instance_id) else {
                return;
            };

            if session.is_none() {
                for channel in entry.channels.values() {
                    channel.close();
                }
            }

            let swept: Vec<Kind> = entry
                .channels
                .iter()
                .filter(|(_, channel)| channel.closed())
                .map(|(kind, _)| *kind)
                .collect();

            for kind in swept {
                entry.channels.remove(&kind);
                TUNNELS_ACTIVE.dec();
                debug!(instance_id, %kind, "swept closed tunnel");
                self.record(instance_id, audit::Kind::TunnelClosed, kind.to_string());
            }

            let now = tokio::time::Instant::now();

            entry
                .expected
                .iter()
                .filter(|kind| !entry.channels.contains_key(kind))
                .filter(|kind| {
                    entry
                        .backoff
                        .get(kind)
                        .is_none_or(|(_, not_before)| now >= *not_before)
                })
                .copied()
                .collect()
        };

        let Some(session) = session else {
            return;
        };

        if missing.is_empty() {
            return;
        }

        for kind in missing {
            match channel::open(session.clone(), instance_id, kind).await {
                Ok(opened) => {
                    let local_port = opened.local_port();

                    let mut registry = self.registry.write().expect("tunnel registry lock");
                    let Some(entry) = registry.get_mut(&instance_id) else {
                        opened.close();
                        return;
                    };

                    entry.backoff.remove(&kind);
                    entry.channels.insert(kind, opened);

                    TUNNELS_ACTIVE.inc();
                    TUNNEL_RECONNECTS.inc();
                    *self
                        .reconnects
                        .write()
                        .expect("tunnel reconnect lock")
                        .entry(instance_id)
                        .or_default() += 1;

                    self.record(
                        instance_id,
                        audit::Kind::TunnelOpened,
                        format!("{kind} reopened on 127.0.0.1:{local_port}"),
                    );
                }
                Err(err) => {
                    debug!(instance_id, %kind, %err, "tunnel reopen failed");

                    let mut registry = self.registry.write().expect("tunnel registry lock");
                    let Some(entry) = registry.get_mut(&instance_id) else {
                        return;
                    };

                    let delay = entry
                        .backoff
                        .get(&kind)
                        .map_or(BACKOFF_FLOOR, |(delay, _)| (*delay * 2).min(BACKOFF_CEILING));

                    entry
                        .backoff
                        .insert(kind, (delay, tokio::time::Instant::now() + delay));
                }
            }
        }
    }

    fn record(&self, instance_id: i64, kind: audit::Kind, detail: String) {
        self.audit.record(
            EventBuilder::default()
                .instance_id(instance_id)
                .kind(kind)
                .detail(detail)
                .build()
                .expect("audit event"),
        );
    }
}
