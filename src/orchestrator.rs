use std::sync::Arc;

use eyre::{bail, eyre, Result};

use crate::instance::{Registry, Status};

pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub code: i32,
}

/// The container platform the core runs against. Endpoints may move across
/// restarts, so they are resolved on every dial.
#[async_trait::async_trait]
pub trait Orchestrator: Send + Sync {
    async fn get_endpoint(&self, instance_id: i64) -> Result<(String, u16)>;

    /// Idempotent: deploys the public half to the instance's authorized-peer
    /// file, appending or replacing as needed.
    async fn configure_authorized_key(&self, instance_id: i64, line: &str) -> Result<()>;

    async fn exec_in_instance(&self, instance_name: &str, argv: &[String]) -> Result<ExecOutput>;

    async fn status(&self, instance_name: &str) -> Result<Status>;
}

/// Registry-backed orchestrator for fixed deployments: endpoints come from
/// the seeded rows and key material is provisioned out of band, so the
/// authorized-key call is a no-op and exec is unsupported.
pub struct Static {
    registry: Arc<dyn Registry>,
}

impl Static {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self { registry }
    }
}

#[async_trait::async_trait]
impl Orchestrator for Static {
    async fn get_endpoint(&self, instance_id: i64) -> Result<(String, u16)> {
        let instance = self
            .registry
            .get(instance_id)
            .await?
            .ok_or_else(|| eyre!("unknown instance {instance_id}"))?;

        Ok((instance.endpoint_host, instance.endpoint_port))
    }

    async fn configure_authorized_key(&self, _: i64, _: &str) -> Result<()> {
        Ok(())
    }

    async fn exec_in_instance(&self, instance_name: &str, _: &[String]) -> Result<ExecOutput> {
        bail!("exec in {instance_name} is not supported by the static orchestrator")
    }

    async fn status(&self, instance_name: &str) -> Result<Status> {
        let rows = self.registry.list().await?;

        rows.into_iter()
            .find(|row| row.name == instance_name)
            .map(|row| row.status)
            .ok_or_else(|| eyre!("unknown instance {instance_name}"))
    }
}
