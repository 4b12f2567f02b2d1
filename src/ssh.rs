pub mod dialer;
pub mod manager;
mod metrics;
pub mod ratelimit;
pub mod session;
#[cfg(test)]
pub mod testutil;

pub use dialer::Dialer;
pub use manager::{Manager, ManagerBuilder};
pub use session::Session;

use std::time::Duration;

use serde::Serialize;

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
pub const KEEPALIVE_DEADLINE: Duration = Duration::from_secs(5);
pub const RECONNECT_FLOOR: Duration = Duration::from_secs(1);
pub const RECONNECT_CEILING: Duration = Duration::from_secs(60);
pub const RECONNECT_BUDGET: u32 = 10;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("dial to {address} failed for instance {instance_id}")]
    Dial {
        instance_id: i64,
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("handshake with instance {instance_id} failed: {detail}")]
    Handshake { instance_id: i64, detail: String },
    #[error("instance {instance_id} rejected the offered key")]
    Auth { instance_id: i64 },
    #[error("instance {instance_id} did not answer within {timeout:?}")]
    Timeout {
        instance_id: i64,
        timeout: Duration,
    },
    #[error(
        "host key for instance {instance_id} changed: pinned {pinned}, observed {observed}"
    )]
    HostKeyChanged {
        instance_id: i64,
        pinned: String,
        observed: String,
    },
    #[error("reconnect budget exhausted for instance {instance_id} after {attempts} attempts")]
    ReconnectExhausted { instance_id: i64, attempts: u32 },
    #[error("no live session for instance {instance_id}")]
    NotConnected { instance_id: i64 },
    #[error("instance {instance_id} is not registered")]
    Unknown { instance_id: i64 },
    #[error("endpoint resolution failed for instance {instance_id}: {detail}")]
    Endpoint { instance_id: i64, detail: String },
    #[error("channel open failed for instance {instance_id}: {detail}")]
    ChannelOpen { instance_id: i64, detail: String },
    #[error(transparent)]
    RateLimited(#[from] ratelimit::Error),
    #[error(transparent)]
    Key(#[from] crate::identity::Error),
}

/// Connection lifecycle per instance. `Failed` is terminal until the next
/// ensure or reconcile tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum State {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}
