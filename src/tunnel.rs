pub mod channel;
pub mod forward;
pub mod manager;
mod metrics;

pub use channel::{Channel, CountingStream};
pub use manager::Manager;

use serde::Serialize;

// Remote ports the agent image exposes on its loopback for the two standing
// services. Custom tunnels carry their own port.
pub const DESKTOP_REMOTE_PORT: u16 = 8080;
pub const GATEWAY_REMOTE_PORT: u16 = 8600;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("opening {kind} for instance {instance_id} failed: {detail}")]
    Open {
        instance_id: i64,
        kind: Kind,
        detail: String,
    },
    #[error("no {kind} tunnel for instance {instance_id}")]
    NotFound { instance_id: i64, kind: Kind },
}

/// Channel labels the remote dispatcher recognises. The header on every
/// multiplexed stream is the label followed by a newline.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ServiceLabel {
    /// The remote desktop; dispatches to the neko server.
    Neko,
    Gateway,
    Terminal,
    Files,
    Logs,
    Ping,
}

/// What a tunnel carries: one of the two standing services, or an ad-hoc
/// forward to an arbitrary remote port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase", untagged)]
pub enum Kind {
    Service(ServiceLabel),
    Custom(u16),
}

pub const EXPECTED: [Kind; 2] = [
    Kind::Service(ServiceLabel::Neko),
    Kind::Service(ServiceLabel::Gateway),
];

impl Kind {
    /// What each accepted local connection is bridged to.
    pub fn target(self) -> forward::Target {
        match self {
            Self::Service(label) => forward::Target::Label(label),
            Self::Custom(port) => forward::Target::Port(port),
        }
    }

    pub fn remote_port(self) -> u16 {
        match self {
            Self::Service(ServiceLabel::Neko) => DESKTOP_REMOTE_PORT,
            Self::Service(ServiceLabel::Gateway) => GATEWAY_REMOTE_PORT,
            Self::Service(_) => 0,
            Self::Custom(port) => port,
        }
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Service(label) => write!(f, "{label}"),
            Self::Custom(port) => write!(f, "custom:{port}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_match_the_wire_set() {
        for (label, wire) in [
            (ServiceLabel::Neko, "neko"),
            (ServiceLabel::Gateway, "gateway"),
            (ServiceLabel::Terminal, "terminal"),
            (ServiceLabel::Files, "files"),
            (ServiceLabel::Logs, "logs"),
            (ServiceLabel::Ping, "ping"),
        ] {
            assert_eq!(label.to_string(), wire);
            assert_eq!(wire.parse::<ServiceLabel>().unwrap(), label);
        }
    }

    #[test]
    fn kind_display() {
        assert_eq!(Kind::Service(ServiceLabel::Neko).to_string(), "neko");
        assert_eq!(Kind::Custom(9000).to_string(), "custom:9000");
    }
}
