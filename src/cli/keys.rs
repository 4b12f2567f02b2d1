use std::path::PathBuf;

use cata::{Command, Container};
use clap::{Parser, Subcommand};
use eyre::Result;

use crate::identity;

/// Inspect and create per-instance key material directly on disk.
#[derive(Parser, Container)]
pub struct Keys {
    #[command(subcommand)]
    command: KeysCmd,
}

#[derive(Subcommand, Container)]
enum KeysCmd {
    Delete(Delete),
    Generate(Generate),
    Fingerprint(Fingerprint),
}

impl Command for Keys {}

/// Generate a fresh pair for an instance, overwriting any existing one.
#[derive(Parser, Container)]
pub struct Generate {
    /// Instance name the pair belongs to
    name: String,

    #[arg(long, default_value = "keys", env = "TETHER_KEY_DIR")]
    key_dir: PathBuf,
}

#[async_trait::async_trait]
impl Command for Generate {
    async fn run(&self) -> Result<()> {
        let store = identity::Store::new(&self.key_dir)?;

        let pair = identity::Pair::generate()?;
        store.save(&self.name, &pair)?;

        println!("{}", identity::fingerprint(&pair.public));
        println!("{}", store.private_path(&self.name).display());

        Ok(())
    }
}

/// Remove an instance's key material from disk.
#[derive(Parser, Container)]
pub struct Delete {
    /// Instance name to remove
    name: String,

    #[arg(long, default_value = "keys", env = "TETHER_KEY_DIR")]
    key_dir: PathBuf,
}

#[async_trait::async_trait]
impl Command for Delete {
    async fn run(&self) -> Result<()> {
        let store = identity::Store::new(&self.key_dir)?;
        store.delete(&self.name)?;

        Ok(())
    }
}

/// Print the fingerprint of an instance's public half.
#[derive(Parser, Container)]
pub struct Fingerprint {
    /// Instance name to look up
    name: String,

    #[arg(long, default_value = "keys", env = "TETHER_KEY_DIR")]
    key_dir: PathBuf,
}

#[async_trait::async_trait]
impl Command for Fingerprint {
    async fn run(&self) -> Result<()> {
        let store = identity::Store::new(&self.key_dir)?;
        let pair = store.load(&self.name)?;

        println!("{}", identity::fingerprint(&pair.public));

        Ok(())
    }
}
