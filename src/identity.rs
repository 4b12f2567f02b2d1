pub mod rotation;
pub mod store;

pub use rotation::{rotate, AuthorizedKeys};
pub use store::Store;

use russh_keys::{
    key::{KeyPair, PublicKey},
    PublicKeyBase64,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("key generation failed")]
    KeyGen,
    #[error("key io failed at {path}")]
    KeyIo {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unable to parse key material at {path}")]
    KeyParse {
        path: std::path::PathBuf,
        #[source]
        source: russh_keys::Error,
    },
    #[error("fingerprint mismatch: expected {expected}, observed {observed}")]
    FingerprintMismatch { expected: String, observed: String },
    #[error("rotation of {instance} failed at {step}: {detail}")]
    RotationPartial {
        instance: String,
        step: rotation::Step,
        detail: String,
    },
}

/// A per-instance key pair. The private half authenticates the control plane
/// to the instance; the public half lands in the instance's authorized peers.
pub struct Pair {
    pub private: KeyPair,
    pub public: PublicKey,
}

impl Pair {
    pub fn generate() -> Result<Self, Error> {
        let private = KeyPair::generate_ed25519().ok_or(Error::KeyGen)?;
        let public = private.clone_public_key().map_err(|_| Error::KeyGen)?;

        Ok(Self { private, public })
    }
}

pub fn fingerprint(key: &PublicKey) -> String {
    key.fingerprint()
}

/// An empty `expected` is trust-on-first-use: accept and hand back the
/// observed fingerprint so the caller can pin it.
pub fn verify(key: &PublicKey, expected: &str) -> Result<String, Error> {
    let observed = fingerprint(key);

    if expected.is_empty() || expected == observed {
        return Ok(observed);
    }

    Err(Error::FingerprintMismatch {
        expected: expected.to_string(),
        observed,
    })
}

/// Single `authorized_keys` line for an instance's peer file.
pub fn authorized_line(key: &PublicKey, name: &str) -> String {
    format!("{} {} tether-{name}", key.name(), key.public_key_base64())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_deterministic() {
        let pair = Pair::generate().unwrap();

        assert_eq!(fingerprint(&pair.public), fingerprint(&pair.public));

        let other = Pair::generate().unwrap();
        assert_ne!(fingerprint(&pair.public), fingerprint(&other.public));
    }

    #[test]
    fn verify_tofu_accepts_and_returns_observed() {
        let pair = Pair::generate().unwrap();
        let observed = verify(&pair.public, "").unwrap();

        assert_eq!(observed, fingerprint(&pair.public));
    }

    #[test]
    fn verify_pinned() {
        let pair = Pair::generate().unwrap();
        let pinned = fingerprint(&pair.public);

        assert!(verify(&pair.public, &pinned).is_ok());

        let other = Pair::generate().unwrap();
        let err = verify(&other.public, &pinned).unwrap_err();
        assert!(matches!(err, Error::FingerprintMismatch { .. }));
    }

    #[test]
    fn authorized_line_shape() {
        let pair = Pair::generate().unwrap();
        let line = authorized_line(&pair.public, "tenant-3");

        let mut fields = line.split_whitespace();
        assert_eq!(fields.next(), Some("ssh-ed25519"));
        assert!(fields.next().is_some());
        assert_eq!(fields.next(), Some("tether-tenant-3"));
        assert_eq!(fields.next(), None);
    }
}
