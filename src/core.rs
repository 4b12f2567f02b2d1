use std::{sync::Arc, time::Duration};

use derive_builder::Builder;

use crate::{audit, identity, instance::Registry, ssh, tunnel};

/// `CanAccessInstance`, supplied by the upstream auth middleware.
pub type AccessFn = Arc<dyn Fn(&str, i64) -> bool + Send + Sync>;

/// Deployments without an upstream policy admit every authenticated caller.
pub fn allow_all() -> AccessFn {
    Arc::new(|_, _| true)
}

#[derive(Clone, Debug)]
pub struct Config {
    pub strict_host_keys: bool,
    pub audit_retention: Duration,
}

/// Everything the HTTP surface and the supervisor need, built once at
/// startup and passed around explicitly. Tests construct isolated cores.
#[derive(Builder)]
#[builder(pattern = "owned")]
pub struct Core {
    pub registry: Arc<dyn Registry>,
    pub keys: Arc<identity::Store>,
    pub audit: Arc<audit::Log>,
    pub connections: Arc<ssh::Manager>,
    pub tunnels: Arc<tunnel::Manager>,
    pub access: AccessFn,
    pub config: Config,
}

impl Core {
    pub fn can_access(&self, user: &str, instance_id: i64) -> bool {
        (self.access)(user, instance_id)
    }
}

#[cfg(test)]
pub mod testutil {
    use super::*;
    use crate::{
        instance::{Instance, Memory},
        orchestrator::{Orchestrator, Static},
        ssh::{dialer::Dialer, testutil::FakeDialer, ManagerBuilder},
    };

    pub struct Harness {
        pub core: Arc<Core>,
        pub registry: Arc<Memory>,
        pub dialer: Arc<FakeDialer>,
        pub dir: tempfile::TempDir,
    }

    pub fn harness(rows: Vec<Instance>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(Memory::new(rows));
        let dialer = Arc::new(FakeDialer::default());
        let audit = Arc::new(audit::Log::new(Duration::from_secs(3600)));
        let keys = Arc::new(identity::Store::new(dir.path().join("keys")).unwrap());

        let connections = Arc::new(
            ManagerBuilder::default()
                .registry(registry.clone() as Arc<dyn Registry>)
                .orchestrator(Arc::new(Static::new(registry.clone())) as Arc<dyn Orchestrator>)
                .keys(keys.clone())
                .audit(audit.clone())
                .user("agent".to_string())
                .dialer(dialer.clone() as Arc<dyn Dialer>)
                .build()
                .unwrap(),
        );

        let tunnels = Arc::new(tunnel::Manager::new(connections.clone(), audit.clone()));

        let core = Arc::new(
            CoreBuilder::default()
                .registry(registry.clone() as Arc<dyn Registry>)
                .keys(keys)
                .audit(audit)
                .connections(connections)
                .tunnels(tunnels)
                .access(allow_all())
                .config(Config {
                    strict_host_keys: false,
                    audit_retention: Duration::from_secs(3600),
                })
                .build()
                .unwrap(),
        );

        Harness {
            core,
            registry,
            dialer,
            dir,
        }
    }
}
