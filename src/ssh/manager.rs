use std::{
    collections::HashMap,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use derive_builder::Builder;
use futures::FutureExt;
use russh_keys::key::KeyPair;
use serde::Serialize;
use tokio::{task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    dialer::{self, Dialer, Target},
    metrics::{ACTIVE_SESSIONS, CONNECTS, KEEPALIVES, RECONNECTS},
    ratelimit::{self, RateLimiter},
    session::Session,
    Error, State, KEEPALIVE_INTERVAL, RECONNECT_BUDGET, RECONNECT_CEILING, RECONNECT_FLOOR,
};
use crate::{
    audit::{self, EventBuilder, Kind},
    identity,
    instance::{Instance, Registry},
    orchestrator::Orchestrator,
};

struct Entry {
    session: Arc<Session>,
    cancel: CancellationToken,
    // Kept so shutdown has something to join against; the supervision loop
    // exits on cancellation.
    #[allow(dead_code)]
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Meta {
    state: State,
    reconnects: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub state: State,
    pub session: Option<super::session::Status>,
    pub reconnect_count: u64,
    pub rate_limit: ratelimit::Snapshot,
}

/// Owns the `instance_id → session` map. One supervision task per session
/// keeps it alive; everything else reads through `get`.
#[derive(Builder)]
#[builder(pattern = "owned")]
pub struct Manager {
    registry: Arc<dyn Registry>,
    orchestrator: Arc<dyn Orchestrator>,
    keys: Arc<identity::Store>,
    audit: Arc<audit::Log>,
    user: String,
    #[builder(default)]
    strict_host_keys: bool,
    #[builder(default)]
    limiter: RateLimiter,
    #[builder(default = "Arc::new(dialer::Ssh) as Arc<dyn Dialer>")]
    dialer: Arc<dyn Dialer>,
    #[builder(default, setter(skip))]
    sessions: RwLock<HashMap<i64, Entry>>,
    #[builder(default, setter(skip))]
    meta: RwLock<HashMap<i64, Meta>>,
    #[builder(default, setter(skip))]
    flights: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
    #[builder(default, setter(skip))]
    signers: RwLock<HashMap<i64, Arc<KeyPair>>>,
}

struct SignerLoad {
    signer: Arc<KeyPair>,
    /// Set when the pair is fresh and still has to reach the instance.
    deploy: Option<Deploy>,
}

struct Deploy {
    line: String,
    fingerprint: String,
}

impl Manager {
    /// Non-blocking lookup. Never hands out a dead session.
    pub fn get(&self, instance_id: i64) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .expect("session lock")
            .get(&instance_id)
            .map(|entry| entry.session.clone())
            .filter(|session| session.healthy())
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Fast path returns the live session; otherwise a single flight per
    /// instance dials, installs, and supervises a new one.
    pub async fn ensure_connected(self: &Arc<Self>, instance_id: i64) -> Result<Arc<Session>, Error> {
        if let Some(session) = self.get(instance_id) {
            return Ok(session);
        }

        self.set_state(instance_id, State::Connecting);

        match self.connect_under_flight(instance_id).await {
            Ok(session) => Ok(session),
            Err(err) => {
                self.set_state(instance_id, State::Failed);
                Err(err)
            }
        }
    }

    async fn connect_under_flight(self: &Arc<Self>, instance_id: i64) -> Result<Arc<Session>, Error> {
        let flight = {
            let mut flights = self.flights.lock().expect("flight lock");
            flights.entry(instance_id).or_default().clone()
        };

        let _guard = flight.lock().await;

        // A racing flight may have installed a session while we queued.
        if let Some(session) = self.get(instance_id) {
            return Ok(session);
        }

        self.establish(instance_id).await
    }

    async fn establish(self: &Arc<Self>, instance_id: i64) -> Result<Arc<Session>, Error> {
        if let Err(limited) = self.limiter.allow(instance_id) {
            self.record(instance_id, "", Kind::RateLimited, limited.to_string());
            return Err(limited.into());
        }

        let instance = self
            .registry
            .get(instance_id)
            .await
            .map_err(|err| Error::Endpoint {
                instance_id,
                detail: format!("{err:#}"),
            })?
            .ok_or(Error::Unknown { instance_id })?;

        let (host, port) =
            self.orchestrator
                .get_endpoint(instance_id)
                .await
                .map_err(|err| Error::Endpoint {
                    instance_id,
                    detail: format!("{err:#}"),
                })?;

        let load = self.signer(&instance)?;

        if let Some(deploy) = load.deploy {
            self.record(
                instance_id,
                &instance.name,
                Kind::KeyGenerated,
                deploy.fingerprint.clone(),
            );

            self.orchestrator
                .configure_authorized_key(instance_id, &deploy.line)
                .await
                .map_err(|err| Error::Endpoint {
                    instance_id,
                    detail: format!("{err:#}"),
                })?;

            if let Err(err) = self
                .registry
                .set_public_key_fingerprint(instance_id, &deploy.fingerprint)
                .await
            {
                warn!(instance_id, ?err, "unable to persist key fingerprint");
            }
        }

        let target = Target {
            instance_id,
            host: host.clone(),
            port,
            user: self.user.clone(),
            key: load.signer,
            pinned: instance.peer_fingerprint.clone(),
            strict: self.strict_host_keys,
        };

        let dialed = match self.dialer.dial(target).await {
            Ok(dialed) => {
                self.limiter.record_success(instance_id);
                CONNECTS.success.inc();
                dialed
            }
            Err(err) => {
                self.limiter.record_failure(instance_id);
                CONNECTS.failure.inc();
                return Err(err);
            }
        };

        if dialed.changed {
            self.record(
                instance_id,
                &instance.name,
                Kind::FingerprintMismatch,
                format!(
                    "pinned {} observed {}",
                    instance.peer_fingerprint, dialed.observed_fingerprint
                ),
            );
        }

        if instance.peer_fingerprint.is_empty() && !dialed.observed_fingerprint.is_empty() {
            if let Err(err) = self
                .registry
                .set_peer_fingerprint(instance_id, &dialed.observed_fingerprint)
                .await
            {
                warn!(instance_id, ?err, "unable to pin peer fingerprint");
            }
        }

        let session = Arc::new(Session::new(
            instance_id,
            dialed.transport,
            dialed.observed_fingerprint,
        ));

        self.install(instance_id, &instance.name, session.clone());
        self.set_state(instance_id, State::Connected);
        self.record(
            instance_id,
            &instance.name,
            Kind::Connected,
            format!("{host}:{port}"),
        );

        Ok(session)
    }

    fn signer(&self, instance: &Instance) -> Result<SignerLoad, Error> {
        if let Some(signer) = self
            .signers
            .read()
            .expect("signer lock")
            .get(&instance.id)
        {
            return Ok(SignerLoad {
                signer: signer.clone(),
                deploy: None,
            });
        }

        let (pair, fresh) = self.keys.ensure(&instance.name)?;

        let deploy = fresh.then(|| Deploy {
            line: identity::authorized_line(&pair.public, &instance.name),
            fingerprint: identity::fingerprint(&pair.public),
        });

        let signer = Arc::new(pair.private);
        self.signers
            .write()
            .expect("signer lock")
            .insert(instance.id, signer.clone());

        Ok(SignerLoad { signer, deploy })
    }

    fn install(self: &Arc<Self>, instance_id: i64, name: &str, session: Arc<Session>) {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(self.clone().supervise_guarded(
            instance_id,
            name.to_string(),
            session.clone(),
            cancel.clone(),
        ));

        let old = self.sessions.write().expect("session lock").insert(
            instance_id,
            Entry {
                session,
                cancel,
                task,
            },
        );

        match old {
            Some(old) => {
                old.cancel.cancel();

                let stale = old.session;
                tokio::spawn(async move { stale.close().await });
            }
            None => ACTIVE_SESSIONS.inc(),
        }
    }

    /// A panicking supervision loop must not leave a session in the map with
    /// nothing probing it: the panic becomes an audit event, the session is
    /// torn down, and the next reconcile tick brings the instance back.
    async fn supervise_guarded(
        self: Arc<Self>,
        instance_id: i64,
        name: String,
        session: Arc<Session>,
        cancel: CancellationToken,
    ) {
        let supervise = AssertUnwindSafe(self.clone().supervise(
            instance_id,
            name.clone(),
            session,
            cancel,
        ))
        .catch_unwind();

        if let Err(payload) = supervise.await {
            self.record(
                instance_id,
                &name,
                Kind::SupervisionPanic,
                format!("session supervisor: {}", audit::panic_detail(payload.as_ref())),
            );
            self.set_state(instance_id, State::Failed);
            self.remove(instance_id).await;
        }
    }

    /// Keepalive loop for one session. A miss closes the transport and hands
    /// over to the reconnect loop; cancellation is the only other way out.
    async fn supervise(
        self: Arc<Self>,
        instance_id: i64,
        name: String,
        session: Arc<Session>,
        cancel: CancellationToken,
    ) {
        let mut tick = tokio::time::interval(KEEPALIVE_INTERVAL);
        tick.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = tick.tick() => {}
            }

            if !session.healthy() {
                self.record(instance_id, &name, Kind::KeepaliveMiss, "transport lost".into());
                break;
            }

            match session.keepalive().await {
                Ok(_) => KEEPALIVES.ok.inc(),
                Err(err) => {
                    KEEPALIVES.miss.inc();
                    self.record(instance_id, &name, Kind::KeepaliveMiss, err.to_string());
                    break;
                }
            }
        }

        if cancel.is_cancelled() {
            return;
        }

        session.close().await;
        self.reconnect(instance_id, name, cancel).await;
    }

    async fn reconnect(self: Arc<Self>, instance_id: i64, name: String, cancel: CancellationToken) {
        self.set_state(instance_id, State::Reconnecting);
        self.record(instance_id, &name, Kind::Reconnecting, String::new());

        let mut backoff = RECONNECT_FLOOR;

        for attempt in 1..=RECONNECT_BUDGET {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = sleep(backoff) => {}
            }

            match self.connect_under_flight(instance_id).await {
                Ok(_) => {
                    RECONNECTS.inc();
                    self.bump_reconnects(instance_id);
                    info!(instance_id, attempt, "session re-established");

                    return;
                }
                Err(Error::RateLimited(limited)) => {
                    debug!(instance_id, attempt, %limited, "reconnect deferred");
                    backoff = (backoff * 2).min(RECONNECT_CEILING).max(limited.retry_after);
                }
                Err(err) => {
                    debug!(instance_id, attempt, %err, "reconnect attempt failed");
                    backoff = (backoff * 2).min(RECONNECT_CEILING);
                }
            }
        }

        self.set_state(instance_id, State::Failed);

        let exhausted = Error::ReconnectExhausted {
            instance_id,
            attempts: RECONNECT_BUDGET,
        };
        self.record(instance_id, &name, Kind::ReconnectExhausted, exhausted.to_string());

        self.remove(instance_id).await;
    }

    async fn remove(&self, instance_id: i64) {
        let entry = self
            .sessions
            .write()
            .expect("session lock")
            .remove(&instance_id);

        if let Some(entry) = entry {
            entry.cancel.cancel();
            entry.session.close().await;
            ACTIVE_SESSIONS.dec();
        }
    }

    /// Idempotent. After this returns, `get` never hands the old session out.
    pub async fn close(&self, instance_id: i64) {
        if self
            .sessions
            .read()
            .expect("session lock")
            .contains_key(&instance_id)
        {
            self.remove(instance_id).await;
            self.set_state(instance_id, State::Disconnected);
            self.record(instance_id, "", Kind::Disconnected, String::new());
        }
    }

    pub async fn close_all(&self) {
        let ids: Vec<i64> = self
            .sessions
            .read()
            .expect("session lock")
            .keys()
            .copied()
            .collect();

        for id in ids {
            self.close(id).await;
        }
    }

    /// Swap the signer used by future dials. Existing sessions keep running
    /// on whatever key they were established with.
    pub fn reload_keys(&self, instance_id: i64, private: KeyPair) {
        self.signers
            .write()
            .expect("signer lock")
            .insert(instance_id, Arc::new(private));
    }

    /// Forced close + redial, returning the handshake latency.
    pub async fn force_reconnect(self: &Arc<Self>, instance_id: i64) -> Result<Duration, Error> {
        self.close(instance_id).await;

        let start = tokio::time::Instant::now();
        self.ensure_connected(instance_id).await?;

        Ok(start.elapsed())
    }

    /// Connectivity probe: ensure a session and run one keepalive round trip.
    pub async fn probe(self: &Arc<Self>, instance_id: i64) -> Result<Duration, Error> {
        let session = self.ensure_connected(instance_id).await?;

        session.keepalive().await
    }

    /// Zero-downtime key rotation for one instance, swapping the cached
    /// signer only after the new pair has proven itself.
    pub async fn rotate(self: &Arc<Self>, instance_id: i64) -> Result<identity::rotation::Outcome, Error> {
        let instance = self
            .registry
            .get(instance_id)
            .await
            .map_err(|err| Error::Endpoint {
                instance_id,
                detail: format!("{err:#}"),
            })?
            .ok_or(Error::Unknown { instance_id })?;

        let reacher = Reacher {
            manager: self.clone(),
            instance: instance.clone(),
        };

        match identity::rotate(&self.keys, &instance.name, &reacher).await {
            Ok(outcome) => {
                let pair = self.keys.load(&instance.name)?;
                self.reload_keys(instance_id, pair.private);

                if let Err(err) = self
                    .registry
                    .set_public_key_fingerprint(instance_id, &outcome.fingerprint)
                    .await
                {
                    warn!(instance_id, ?err, "unable to persist rotated fingerprint");
                }

                self.record(
                    instance_id,
                    &instance.name,
                    Kind::KeyRotated,
                    outcome.fingerprint.clone(),
                );

                Ok(outcome)
            }
            Err(err) => {
                self.record(
                    instance_id,
                    &instance.name,
                    Kind::KeyRotationFailed,
                    err.to_string(),
                );

                Err(err.into())
            }
        }
    }

    pub fn state(&self, instance_id: i64) -> State {
        self.meta
            .read()
            .expect("meta lock")
            .get(&instance_id)
            .map_or(State::Disconnected, |meta| meta.state)
    }

    pub fn reconnect_count(&self, instance_id: i64) -> u64 {
        self.meta
            .read()
            .expect("meta lock")
            .get(&instance_id)
            .map_or(0, |meta| meta.reconnects)
    }

    pub fn status(&self, instance_id: i64) -> Status {
        Status {
            state: self.state(instance_id),
            session: self
                .sessions
                .read()
                .expect("session lock")
                .get(&instance_id)
                .map(|entry| entry.session.status()),
            reconnect_count: self.reconnect_count(instance_id),
            rate_limit: self.limiter.snapshot(instance_id),
        }
    }

    pub fn instance_ids(&self) -> Vec<i64> {
        self.sessions
            .read()
            .expect("session lock")
            .keys()
            .copied()
            .collect()
    }

    fn set_state(&self, instance_id: i64, state: State) {
        self.meta
            .write()
            .expect("meta lock")
            .entry(instance_id)
            .or_default()
            .state = state;
    }

    fn bump_reconnects(&self, instance_id: i64) {
        self.meta
            .write()
            .expect("meta lock")
            .entry(instance_id)
            .or_default()
            .reconnects += 1;
    }

    fn record(&self, instance_id: i64, name: &str, kind: Kind, detail: String) {
        self.audit.record(
            EventBuilder::default()
                .instance_id(instance_id)
                .instance_name(name.to_string())
                .kind(kind)
                .detail(detail)
                .build()
                .expect("audit event"),
        );
    }
}

/// Rotation seam: key deployment over the orchestrator, confirmation by a
/// real handshake with the candidate key.
struct Reacher {
    manager: Arc<Manager>,
    instance: Instance,
}

#[async_trait::async_trait]
impl identity::AuthorizedKeys for Reacher {
    async fn append(&self, public: &russh_keys::key::PublicKey) -> eyre::Result<()> {
        let line = identity::authorized_line(public, &self.instance.name);

        let output = self
            .manager
            .orchestrator
            .exec_in_instance(
                &self.instance.name,
                &[
                    "sh".to_string(),
                    "-c".to_string(),
                    format!("mkdir -p ~/.ssh && printf '%s\\n' \"{line}\" >> ~/.ssh/authorized_keys"),
                ],
            )
            .await?;

        eyre::ensure!(output.code == 0, "append exited {}: {}", output.code, output.stderr);

        Ok(())
    }

    async fn replace(&self, public: &russh_keys::key::PublicKey) -> eyre::Result<()> {
        let line = identity::authorized_line(public, &self.instance.name);

        self.manager
            .orchestrator
            .configure_authorized_key(self.instance.id, &line)
            .await
    }

    async fn confirm(&self, pair: &identity::Pair) -> eyre::Result<()> {
        let (host, port) = self
            .manager
            .orchestrator
            .get_endpoint(self.instance.id)
            .await?;

        let dialed = self
            .manager
            .dialer
            .dial(Target {
                instance_id: self.instance.id,
                host,
                port,
                user: self.manager.user.clone(),
                key: Arc::new(pair.private.clone()),
                pinned: self.instance.peer_fingerprint.clone(),
                strict: false,
            })
            .await?;

        dialed.transport.close().await;

        Ok(())
    }
}
