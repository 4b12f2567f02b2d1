use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use cata::{Command, Container};
use clap::Parser;
use eyre::Result;
use tracing::info;

use crate::{
    audit,
    core::{allow_all, Config, CoreBuilder},
    identity, instance, orchestrator, proxy, ssh,
    supervisor::Supervisor,
    tunnel,
};

#[derive(Parser, Container)]
pub struct Serve {
    /// Address to bind the HTTP surface on
    #[arg(long, default_value = "0.0.0.0:8123", env = "TETHER_ADDRESS")]
    address: SocketAddr,

    /// Directory holding per-instance key material
    #[arg(long, default_value = "keys", env = "TETHER_KEY_DIR")]
    key_dir: PathBuf,

    /// Instance definitions used to seed the registry
    #[arg(long, env = "TETHER_INSTANCES")]
    instances: PathBuf,

    /// Username presented to instances during the SSH handshake
    #[arg(long, default_value = "agent", env = "TETHER_SSH_USER")]
    ssh_user: String,

    /// Fail the handshake when a pinned host key changes
    #[arg(long)]
    strict_host_keys: bool,

    /// How long audit events are retained
    #[arg(long, default_value = "90days", value_parser = humantime::parse_duration)]
    audit_retention: Duration,

    /// How often the supervisor reconciles the instance set
    #[arg(long, default_value = "15s", value_parser = humantime::parse_duration)]
    reconcile_interval: Duration,
}

#[async_trait::async_trait]
impl Command for Serve {
    async fn run(&self) -> Result<()> {
        let registry: Arc<dyn instance::Registry> =
            Arc::new(instance::Memory::load(&self.instances)?);
        let orchestrator: Arc<dyn orchestrator::Orchestrator> =
            Arc::new(orchestrator::Static::new(registry.clone()));

        let keys = Arc::new(identity::Store::new(&self.key_dir)?);
        let audit = Arc::new(audit::Log::new(self.audit_retention));

        let connections = Arc::new(
            ssh::ManagerBuilder::default()
                .registry(registry.clone())
                .orchestrator(orchestrator)
                .keys(keys.clone())
                .audit(audit.clone())
                .user(self.ssh_user.clone())
                .strict_host_keys(self.strict_host_keys)
                .build()?,
        );
        let tunnels = Arc::new(tunnel::Manager::new(connections.clone(), audit.clone()));

        let core = Arc::new(
            CoreBuilder::default()
                .registry(registry)
                .keys(keys)
                .audit(audit)
                .connections(connections)
                .tunnels(tunnels)
                .access(allow_all())
                .config(Config {
                    strict_host_keys: self.strict_host_keys,
                    audit_retention: self.audit_retention,
                })
                .build()?,
        );

        let supervisor = Supervisor::start(core.clone(), self.reconcile_interval);

        let (addr, server) = warp::serve(proxy::routes(core.clone()))
            .bind_with_graceful_shutdown(self.address, async {
                let _unused = tokio::signal::ctrl_c().await;
            });

        info!(%addr, "http surface listening");

        server.await;

        supervisor.shutdown().await;

        Ok(())
    }
}
