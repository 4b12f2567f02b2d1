use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use pkcs8::EncodePrivateKey;
use russh_keys::key::KeyPair;
use tracing::debug;
use umask::Mode;

use super::{authorized_line, Error, Pair};

pub const PRIVATE: &str = "id_ed25519";
pub const PUBLIC: &str = "id_ed25519.pub";
pub const BACKUP: &str = "id_ed25519.old";

const DIR_MODE: &str = "rwx------";
const PRIVATE_MODE: &str = "rw-------";
const PUBLIC_MODE: &str = "rw-r--r--";

/// On-disk credential store: one directory per instance name under a 0700
/// root, private half as PKCS#8 PEM, public half as an authorized-keys line.
pub struct Store {
    root: PathBuf,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root = root.into();

        fs::create_dir_all(&root).map_err(|source| Error::KeyIo {
            path: root.clone(),
            source,
        })?;
        set_mode(&root, DIR_MODE)?;

        Ok(Self { root })
    }

    fn dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn private_path(&self, name: &str) -> PathBuf {
        self.dir(name).join(PRIVATE)
    }

    pub fn public_path(&self, name: &str) -> PathBuf {
        self.dir(name).join(PUBLIC)
    }

    pub fn backup_path(&self, name: &str) -> PathBuf {
        self.dir(name).join(BACKUP)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.private_path(name).is_file()
    }

    /// Overwrite-safe: the private half goes through a write-then-rename so a
    /// crash never leaves a truncated key on disk.
    pub fn save(&self, name: &str, pair: &Pair) -> Result<(), Error> {
        let dir = self.dir(name);

        fs::create_dir_all(&dir).map_err(|source| Error::KeyIo {
            path: dir.clone(),
            source,
        })?;
        set_mode(&dir, DIR_MODE)?;

        let pem = encode_private(&pair.private)?;
        write_rename(&self.private_path(name), pem.as_bytes(), PRIVATE_MODE)?;

        let line = format!("{}\n", authorized_line(&pair.public, name));
        write_rename(&self.public_path(name), line.as_bytes(), PUBLIC_MODE)?;

        debug!(name, "saved key pair");

        Ok(())
    }

    pub fn load(&self, name: &str) -> Result<Pair, Error> {
        let private_path = self.private_path(name);
        let private =
            russh_keys::load_secret_key(&private_path, None).map_err(|source| Error::KeyParse {
                path: private_path,
                source,
            })?;

        let public_path = self.public_path(name);
        let line = fs::read_to_string(&public_path).map_err(|source| Error::KeyIo {
            path: public_path.clone(),
            source,
        })?;

        let encoded = line
            .split_whitespace()
            .nth(1)
            .ok_or_else(|| Error::KeyParse {
                path: public_path.clone(),
                source: russh_keys::Error::CouldNotReadKey,
            })?;

        let public =
            russh_keys::parse_public_key_base64(encoded).map_err(|source| Error::KeyParse {
                path: public_path,
                source,
            })?;

        Ok(Pair { private, public })
    }

    /// Load the pair for `name`, generating and persisting one the first time
    /// an instance is seen. The bool is true when the pair is fresh.
    pub fn ensure(&self, name: &str) -> Result<(Pair, bool), Error> {
        if self.exists(name) {
            return Ok((self.load(name)?, false));
        }

        let pair = Pair::generate()?;
        self.save(name, &pair)?;

        Ok((pair, true))
    }

    pub fn delete(&self, name: &str) -> Result<(), Error> {
        let dir = self.dir(name);

        if !dir.exists() {
            return Ok(());
        }

        fs::remove_dir_all(&dir).map_err(|source| Error::KeyIo { path: dir, source })
    }
}

fn encode_private(key: &KeyPair) -> Result<String, Error> {
    match key {
        KeyPair::Ed25519(inner) => inner
            .to_pkcs8_pem(ssh_key::LineEnding::default())
            .map(|pem| pem.to_string())
            .map_err(|_| Error::KeyGen),
        _ => Err(Error::KeyGen),
    }
}

fn set_mode(path: &Path, perms: &str) -> Result<(), Error> {
    let mode: u32 = Mode::parse(perms).expect("valid mode").into();

    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|source| Error::KeyIo {
        path: path.to_path_buf(),
        source,
    })
}

fn write_rename(path: &Path, contents: &[u8], mode: &str) -> Result<(), Error> {
    let staged = path.with_extension("tmp");

    fs::write(&staged, contents).map_err(|source| Error::KeyIo {
        path: staged.clone(),
        source,
    })?;
    set_mode(&staged, mode)?;

    fs::rename(&staged, path).map_err(|source| Error::KeyIo {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::fingerprint;

    #[test]
    fn save_load_round_trip() {
        let root = tempfile::tempdir().unwrap();
        let store = Store::new(root.path().join("keys")).unwrap();

        let pair = Pair::generate().unwrap();
        store.save("tenant-1", &pair).unwrap();

        let loaded = store.load("tenant-1").unwrap();
        assert_eq!(fingerprint(&loaded.public), fingerprint(&pair.public));
        assert_eq!(
            fingerprint(&loaded.private.clone_public_key().unwrap()),
            fingerprint(&pair.public),
        );
    }

    #[test]
    fn restrictive_permissions() {
        let root = tempfile::tempdir().unwrap();
        let store = Store::new(root.path().join("keys")).unwrap();

        let pair = Pair::generate().unwrap();
        store.save("tenant-1", &pair).unwrap();

        let mode = |path: &Path| {
            fs::metadata(path).unwrap().permissions().mode() & 0o777
        };

        assert_eq!(mode(&root.path().join("keys")), 0o700);
        assert_eq!(mode(&store.private_path("tenant-1")), 0o600);
        assert_eq!(mode(&store.public_path("tenant-1")), 0o644);
    }

    #[test]
    fn ensure_generates_once() {
        let root = tempfile::tempdir().unwrap();
        let store = Store::new(root.path().join("keys")).unwrap();

        assert!(!store.exists("tenant-1"));

        let (first, fresh) = store.ensure("tenant-1").unwrap();
        assert!(fresh);
        assert!(store.exists("tenant-1"));

        let (second, fresh) = store.ensure("tenant-1").unwrap();
        assert!(!fresh);
        assert_eq!(fingerprint(&first.public), fingerprint(&second.public));
    }

    #[test]
    fn delete_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let store = Store::new(root.path().join("keys")).unwrap();

        let pair = Pair::generate().unwrap();
        store.save("tenant-1", &pair).unwrap();

        store.delete("tenant-1").unwrap();
        assert!(!store.exists("tenant-1"));

        store.delete("tenant-1").unwrap();
    }
}
