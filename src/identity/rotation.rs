use std::fs;

use russh_keys::key::PublicKey;
use serde::Serialize;
use tracing::{debug, warn};

use super::{fingerprint, Error, Pair, Store};

/// Seam back to the instance's authorized-peer file. `append` must leave the
/// old key working; `replace` leaves only the new one.
#[async_trait::async_trait]
pub trait AuthorizedKeys: Send + Sync {
    async fn append(&self, public: &PublicKey) -> eyre::Result<()>;

    async fn replace(&self, public: &PublicKey) -> eyre::Result<()>;

    /// Complete a fresh handshake with the candidate pair.
    async fn confirm(&self, pair: &Pair) -> eyre::Result<()>;
}

#[derive(Debug, Clone, Copy, Serialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Generate,
    Append,
    Persist,
    Confirm,
    Replace,
}

#[derive(Debug, Clone, Serialize)]
pub struct Outcome {
    pub fingerprint: String,
}

/// Zero-downtime rotation. The instance accepts both keys between `append`
/// and `replace`; any failure in that window leaves the old key working and
/// the `.old` backup on disk for forensics. Backups are removed only once
/// every step has succeeded.
pub async fn rotate(
    store: &Store,
    name: &str,
    reacher: &dyn AuthorizedKeys,
) -> Result<Outcome, Error> {
    // Loading up front surfaces missing key material before anything mutates.
    let _old = store.load(name)?;

    let fresh = Pair::generate().map_err(|err| partial(name, Step::Generate, &err))?;

    reacher
        .append(&fresh.public)
        .await
        .map_err(|err| partial(name, Step::Append, &err))?;

    persist(store, name, &fresh).map_err(|err| partial(name, Step::Persist, &err))?;

    reacher
        .confirm(&fresh)
        .await
        .map_err(|err| partial(name, Step::Confirm, &err))?;

    reacher
        .replace(&fresh.public)
        .await
        .map_err(|err| partial(name, Step::Replace, &err))?;

    if let Err(err) = fs::remove_file(store.backup_path(name)) {
        warn!(name, ?err, "rotation succeeded but backup removal failed");
    }

    let fingerprint = fingerprint(&fresh.public);
    debug!(name, %fingerprint, "rotated key pair");

    Ok(Outcome { fingerprint })
}

/// Back the old private half up as `.old`, then swap the new pair in via
/// write-then-rename.
fn persist(store: &Store, name: &str, fresh: &Pair) -> eyre::Result<()> {
    fs::copy(store.private_path(name), store.backup_path(name))?;
    store.save(name, fresh)?;

    Ok(())
}

fn partial(name: &str, step: Step, err: &dyn std::fmt::Debug) -> Error {
    Error::RotationPartial {
        instance: name.to_string(),
        step,
        detail: format!("{err:?}"),
    }
}
