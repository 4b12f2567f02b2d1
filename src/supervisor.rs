use std::{
    collections::HashSet,
    panic::AssertUnwindSafe,
    sync::Arc,
    time::Duration,
};

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::{
    audit::{self, EventBuilder, Kind},
    core::Core,
    instance::Status,
};

const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

/// Drives the managers towards the registry's desired state: running
/// instances get a session and the standing tunnel set, everything else is
/// torn down. One reconcile pass runs at startup, then on every tick.
pub struct Supervisor {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Supervisor {
    pub fn start(core: Arc<Core>, every: Duration) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(core, every, cancel.clone()));

        Self { cancel, task }
    }

    /// Tunnels drain before transports so nothing reopens mid-shutdown.
    pub async fn shutdown(self) {
        self.cancel.cancel();

        if let Err(err) = self.task.await {
            error!(?err, "supervisor task failed to join");
        }
    }
}

async fn run(core: Arc<Core>, every: Duration, cancel: CancellationToken) {
    core.tunnels.start_probe();

    let mut purge = tokio::spawn(purge_guarded(core.clone(), cancel.child_token()));

    let mut tick = tokio::time::interval(every);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = tick.tick() => {}
        }

        reconcile(&core).await;

        // Respawns the loops a panic took down since the last tick.
        core.tunnels.start_probe();
        if purge.is_finished() && !cancel.is_cancelled() {
            purge = tokio::spawn(purge_guarded(core.clone(), cancel.child_token()));
        }
    }

    core.tunnels.shutdown().await;
    core.connections.close_all().await;

    let _unused = purge.await;
}

async fn purge_guarded(core: Arc<Core>, cancel: CancellationToken) {
    let purge = AssertUnwindSafe(purge_loop(core.clone(), cancel)).catch_unwind();

    if let Err(payload) = purge.await {
        core.audit.record(
            EventBuilder::default()
                .instance_id(0)
                .kind(Kind::SupervisionPanic)
                .detail(format!("audit purge: {}", audit::panic_detail(payload.as_ref())))
                .build()
                .expect("audit event"),
        );
    }
}

async fn purge_loop(core: Arc<Core>, cancel: CancellationToken) {
    let mut tick = tokio::time::interval(PURGE_INTERVAL);
    tick.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = tick.tick() => {}
        }

        let purged = core.audit.purge();
        if purged > 0 {
            tracing::debug!(purged, "audit retention purge");
        }
    }
}

async fn reconcile(core: &Arc<Core>) {
    let rows = match core.registry.list().await {
        Ok(rows) => rows,
        Err(err) => {
            warn!(?err, "reconcile skipped, registry unavailable");
            return;
        }
    };

    let running: HashSet<i64> = rows
        .iter()
        .filter(|row| row.status == Status::Running)
        .map(|row| row.id)
        .collect();

    let active: HashSet<i64> = core.tunnels.instances().into_iter().collect();
    let connected: HashSet<i64> = core.connections.instance_ids().into_iter().collect();

    // A running instance converges when its tunnel set is missing or when its
    // session is gone, e.g. after a supervision loop died.
    for instance_id in running.iter().copied() {
        if !active.contains(&instance_id) || core.connections.get(instance_id).is_none() {
            converge(core, instance_id).await;
        }
    }

    for instance_id in active.union(&connected).copied() {
        if running.contains(&instance_id) {
            continue;
        }

        core.tunnels.stop(instance_id).await;
        core.connections.close(instance_id).await;
    }
}

/// Convergence for one instance runs in its own task so a panic there is
/// contained; the next tick retries.
async fn converge(core: &Arc<Core>, instance_id: i64) {
    let handle = {
        let core = core.clone();

        tokio::spawn(async move {
            core.connections.ensure_connected(instance_id).await?;
            core.tunnels.start(instance_id).await
        })
    };

    match handle.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(instance_id, %err, "convergence failed"),
        Err(join_err) => {
            let detail = if join_err.is_panic() {
                audit::panic_detail(join_err.into_panic().as_ref())
            } else {
                join_err.to_string()
            };

            error!(instance_id, %detail, "convergence panicked");
            core.audit.record(
                EventBuilder::default()
                    .instance_id(instance_id)
                    .kind(Kind::SupervisionPanic)
                    .detail(format!("convergence: {detail}"))
                    .build()
                    .expect("audit event"),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::testutil::harness,
        instance::{fixture, Status},
        ssh::State,
    };

    #[tokio::test]
    async fn reconcile_converges_running_instances() {
        let h = harness(vec![fixture(1, Status::Running), fixture(2, Status::Stopped)]);

        reconcile(&h.core).await;

        assert_eq!(h.core.connections.state(1), State::Connected);
        assert_eq!(h.core.tunnels.healthy_count(1), 2);

        assert_eq!(h.core.connections.state(2), State::Disconnected);
        assert_eq!(h.core.tunnels.healthy_count(2), 0);
    }

    #[tokio::test]
    async fn reconcile_tears_down_instances_leaving_running() {
        let h = harness(vec![fixture(1, Status::Running)]);

        reconcile(&h.core).await;
        assert_eq!(h.core.tunnels.healthy_count(1), 2);

        h.registry.set_status(1, Status::Stopping);
        reconcile(&h.core).await;

        assert_eq!(h.core.tunnels.healthy_count(1), 0);
        assert!(h.core.connections.get(1).is_none());
    }

    #[tokio::test]
    async fn convergence_panics_are_audited_and_retried() {
        let h = harness(vec![fixture(1, Status::Running)]);

        h.dialer.panic.store(true, std::sync::atomic::Ordering::SeqCst);
        reconcile(&h.core).await;

        let panics = h.core.audit.query(&audit::Query {
            kind: Some(Kind::SupervisionPanic),
            ..audit::Query::default()
        });
        assert_eq!(panics.len(), 1);
        assert!(panics[0].detail.contains("dialer exploded"));

        // The next tick converges once the fault clears.
        h.dialer.panic.store(false, std::sync::atomic::Ordering::SeqCst);
        reconcile(&h.core).await;

        assert_eq!(h.core.connections.state(1), State::Connected);
        assert_eq!(h.core.tunnels.healthy_count(1), 2);
    }

    #[tokio::test]
    async fn shutdown_stops_everything() {
        let h = harness(vec![fixture(1, Status::Running)]);

        let supervisor = Supervisor::start(h.core.clone(), Duration::from_millis(10));

        tokio::time::timeout(Duration::from_secs(5), async {
            while h.core.tunnels.healthy_count(1) < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("startup convergence");

        supervisor.shutdown().await;

        assert!(h.core.tunnels.instances().is_empty());
        assert!(h.core.connections.get(1).is_none());
    }
}
