use std::{collections::HashMap, path::Path, sync::RwLock};

use eyre::{eyre, Result};
use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Creating,
    Running,
    Restarting,
    Stopping,
    Stopped,
    Error,
}

/// The subset of an instance row the core reads and writes. Everything is
/// keyed by the stable numeric id; names only appear at the wire and
/// filesystem edges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    pub status: Status,
    pub endpoint_host: String,
    pub endpoint_port: u16,
    /// Pinned peer identity, empty until the first observation.
    #[serde(default)]
    pub peer_fingerprint: String,
    /// Comma-separated CIDR allow-list, empty admits everything.
    #[serde(default)]
    pub allowed_source_ips: String,
    /// Fingerprint of the control plane's public half for this instance.
    #[serde(default)]
    pub public_key_fingerprint: String,
}

/// The columns of the instances table the core touches.
#[async_trait::async_trait]
pub trait Registry: Send + Sync {
    async fn list(&self) -> Result<Vec<Instance>>;

    async fn get(&self, id: i64) -> Result<Option<Instance>>;

    async fn set_peer_fingerprint(&self, id: i64, fingerprint: &str) -> Result<()>;

    async fn set_allowed_ips(&self, id: i64, csv: &str) -> Result<()>;

    async fn set_public_key_fingerprint(&self, id: i64, fingerprint: &str) -> Result<()>;
}

/// In-memory registry. Backs tests and the file-seeded deployment mode where
/// the instance set is fixed at startup.
#[derive(Default)]
pub struct Memory {
    rows: RwLock<HashMap<i64, Instance>>,
}

impl Memory {
    pub fn new(rows: impl IntoIterator<Item = Instance>) -> Self {
        Self {
            rows: RwLock::new(rows.into_iter().map(|row| (row.id, row)).collect()),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|err| eyre!(err).wrap_err("unable to read instance definitions"))?;

        let rows: Vec<Instance> = serde_json::from_str(&raw)?;

        Ok(Self::new(rows))
    }

    pub fn upsert(&self, instance: Instance) {
        self.rows
            .write()
            .expect("registry lock")
            .insert(instance.id, instance);
    }

    pub fn set_status(&self, id: i64, status: Status) {
        if let Some(row) = self.rows.write().expect("registry lock").get_mut(&id) {
            row.status = status;
        }
    }

    fn update(&self, id: i64, apply: impl FnOnce(&mut Instance)) -> Result<()> {
        let mut rows = self.rows.write().expect("registry lock");

        let row = rows.get_mut(&id).ok_or_else(|| eyre!("unknown instance {id}"))?;
        apply(row);

        Ok(())
    }
}

#[async_trait::async_trait]
impl Registry for Memory {
    async fn list(&self) -> Result<Vec<Instance>> {
        Ok(self
            .rows
            .read()
            .expect("registry lock")
            .values()
            .cloned()
            .collect())
    }

    async fn get(&self, id: i64) -> Result<Option<Instance>> {
        Ok(self.rows.read().expect("registry lock").get(&id).cloned())
    }

    async fn set_peer_fingerprint(&self, id: i64, fingerprint: &str) -> Result<()> {
        self.update(id, |row| row.peer_fingerprint = fingerprint.to_string())
    }

    async fn set_allowed_ips(&self, id: i64, csv: &str) -> Result<()> {
        self.update(id, |row| row.allowed_source_ips = csv.to_string())
    }

    async fn set_public_key_fingerprint(&self, id: i64, fingerprint: &str) -> Result<()> {
        self.update(id, |row| row.public_key_fingerprint = fingerprint.to_string())
    }
}

#[cfg(test)]
pub fn fixture(id: i64, status: Status) -> Instance {
    Instance {
        id,
        name: format!("tenant-{id}"),
        display_name: String::new(),
        status,
        endpoint_host: "127.0.0.1".to_string(),
        endpoint_port: 2222,
        peer_fingerprint: String::new(),
        allowed_source_ips: String::new(),
        public_key_fingerprint: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_round_trip() {
        let registry = Memory::new([fixture(1, Status::Running)]);

        registry.set_peer_fingerprint(1, "SHA256:abc").await.unwrap();

        let row = registry.get(1).await.unwrap().unwrap();
        assert_eq!(row.peer_fingerprint, "SHA256:abc");

        assert!(registry.get(2).await.unwrap().is_none());
        assert!(registry.set_peer_fingerprint(2, "x").await.is_err());
    }
}
