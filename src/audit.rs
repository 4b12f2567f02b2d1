use std::{collections::VecDeque, sync::RwLock, time::Duration};

use chrono::{DateTime, Utc};
use derive_builder::Builder;
use serde::Serialize;
use tracing::info;

// Memory bound independent of the retention window.
const CAPACITY: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    Connected,
    Disconnected,
    Reconnecting,
    ReconnectExhausted,
    KeepaliveMiss,
    FingerprintMismatch,
    RateLimited,
    IpRestricted,
    KeyGenerated,
    KeyRotated,
    KeyRotationFailed,
    TunnelOpened,
    TunnelClosed,
    TunnelUnhealthy,
    ShellSessionOpened,
    ShellSessionClosed,
    SupervisionPanic,
}

/// Render a caught panic payload for an audit detail line.
pub fn panic_detail(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

#[derive(Debug, Clone, Serialize, Builder)]
#[builder(pattern = "owned")]
pub struct Event {
    #[builder(default = "Utc::now()")]
    pub timestamp: DateTime<Utc>,
    pub instance_id: i64,
    #[builder(default)]
    pub instance_name: String,
    #[builder(default)]
    pub username: String,
    #[builder(default)]
    pub source_ip: String,
    pub kind: Kind,
    #[builder(default)]
    pub detail: String,
}

#[derive(Debug, Clone, Default)]
pub struct Query {
    pub instance_id: Option<i64>,
    pub username: Option<String>,
    pub kind: Option<Kind>,
    pub from: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub offset: usize,
    pub limit: Option<usize>,
}

/// Append-only, time-bounded event log. Writes are serialised behind one
/// lock; queries walk newest-first.
pub struct Log {
    retention: Duration,
    events: RwLock<VecDeque<Event>>,
}

impl Log {
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            events: RwLock::new(VecDeque::new()),
        }
    }

    pub fn record(&self, event: Event) {
        info!(
            instance_id = event.instance_id,
            kind = %event.kind,
            detail = %event.detail,
            "audit",
        );

        let mut events = self.events.write().expect("audit lock");

        if events.len() == CAPACITY {
            events.pop_front();
        }

        events.push_back(event);
    }

    pub fn query(&self, query: &Query) -> Vec<Event> {
        let events = self.events.read().expect("audit lock");

        events
            .iter()
            .rev()
            .filter(|event| {
                query
                    .instance_id
                    .is_none_or(|id| event.instance_id == id)
                    && query
                        .username
                        .as_ref()
                        .is_none_or(|user| event.username == *user)
                    && query.kind.is_none_or(|kind| event.kind == kind)
                    && query.from.is_none_or(|from| event.timestamp >= from)
                    && query.until.is_none_or(|until| event.timestamp <= until)
            })
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    /// Latest events for one instance, newest first.
    pub fn recent(&self, instance_id: i64, limit: usize) -> Vec<Event> {
        self.query(&Query {
            instance_id: Some(instance_id),
            limit: Some(limit),
            ..Query::default()
        })
    }

    /// Drop events older than the retention window. Returns how many went.
    pub fn purge(&self) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::MAX);

        self.purge_before(cutoff)
    }

    fn purge_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut events = self.events.write().expect("audit lock");

        let before = events.len();
        events.retain(|event| event.timestamp >= cutoff);

        before - events.len()
    }

    pub fn len(&self) -> usize {
        self.events.read().expect("audit lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
